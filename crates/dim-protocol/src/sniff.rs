//! Wire protocol selection.
//!
//! The first bytes of a connection's first frame select the decoder:
//! an HTTP `GET ` starts a WebSocket upgrade, the `DIM` magic starts MTP,
//! anything else is handed to the Mars decoder (which re-seeks past any
//! leading garbage on its own).

use tokio::net::TcpStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireProtocol {
    Mtp,
    Mars,
    Ws,
}

/// Peek (without consuming) the head of the first frame and pick a decoder.
pub async fn sniff(stream: &TcpStream) -> std::io::Result<WireProtocol> {
    let mut head = [0u8; 4];
    let n = stream.peek(&mut head).await?;
    Ok(classify(&head[..n]))
}

/// Classify a (possibly short) peek at the first bytes.
pub fn classify(head: &[u8]) -> WireProtocol {
    if head.is_empty() {
        // Peer closed before sending; Mars surfaces the EOF.
        return WireProtocol::Mars;
    }
    if head.starts_with(b"GET ") || (head.len() < 4 && b"GET ".starts_with(head)) {
        WireProtocol::Ws
    } else if head.starts_with(b"DIM") || (head.len() < 3 && b"DIM".starts_with(head)) {
        WireProtocol::Mtp
    } else {
        WireProtocol::Mars
    }
}
