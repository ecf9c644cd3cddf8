//! The transport gate: one task per connection.
//!
//! Sniffs the wire protocol, then runs a read/write loop translating wire
//! frames into [`Arrival`]s and [`Departure`]s into wire frames.  The gate
//! owns the socket; everything above it sees only the two channels.
//!
//! Transport-level liveness (Mars `PING`/`PONG`, WebSocket ping frames) is
//! answered here and never surfaced.  The gate exits on shutdown signal,
//! peer close, or transport error; dropping its ends of the channels is
//! the session's disconnect notification.

use crate::frame::{AckToken, Arrival, Departure, DepartureBody};
use crate::mars::{self, MarsCodec, MarsFrame};
use crate::mtp::{MtpCodec, MtpPacket, PacketKind};
use crate::sniff::{WireProtocol, sniff};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;
use tracing::{debug, trace};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("MTP: {0}")]
    Mtp(#[from] crate::mtp::MtpError),
    #[error("Mars: {0}")]
    Mars(#[from] crate::mars::MarsError),
    #[error("WebSocket: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Sniff the protocol on a fresh TCP connection and run the gate until
/// shutdown, peer close, or transport error.
pub async fn run_gate(
    stream: TcpStream,
    arrivals: mpsc::Sender<Arrival>,
    departures: mpsc::Receiver<Departure>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), GateError> {
    let protocol = sniff(&stream).await?;
    debug!(?protocol, "gate protocol selected");
    run_framed_gate(stream, protocol, arrivals, departures, shutdown).await
}

/// Run the gate over any duplex stream with a pre-selected protocol.
///
/// Split out of [`run_gate`] so tests can drive the gate over an
/// in-memory duplex pipe.
pub async fn run_framed_gate<S>(
    stream: S,
    protocol: WireProtocol,
    arrivals: mpsc::Sender<Arrival>,
    departures: mpsc::Receiver<Departure>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), GateError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match protocol {
        WireProtocol::Mtp => run_mtp(stream, arrivals, departures, shutdown).await,
        WireProtocol::Mars => run_mars(stream, arrivals, departures, shutdown).await,
        WireProtocol::Ws => run_ws(stream, arrivals, departures, shutdown).await,
    }
}

// ---------------------------------------------------------------------------
// MTP
// ---------------------------------------------------------------------------

async fn run_mtp<S>(
    stream: S,
    arrivals: mpsc::Sender<Arrival>,
    mut departures: mpsc::Receiver<Departure>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), GateError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut framed = Framed::new(stream, MtpCodec);
    // Transaction IDs for frames this side originates.
    let mut next_sn: u64 = 1;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => { if *shutdown.borrow() { break; } }
            dep = departures.recv() => {
                let Some(dep) = dep else { break };
                let pkt = match dep.body {
                    DepartureBody::Payload(payload) => {
                        let sn = next_sn.to_be_bytes();
                        next_sn += 1;
                        MtpPacket::message(sn, payload.into())
                    }
                    DepartureBody::Ack(AckToken::Mtp { sn, command: true }) => {
                        MtpPacket::command_response(sn, "OK".into())
                    }
                    DepartureBody::Ack(AckToken::Mtp { sn, command: false }) => {
                        MtpPacket::message_response(sn)
                    }
                    DepartureBody::Ack(AckToken::Mars { .. }) => continue,
                };
                framed.send(pkt).await?;
            }
            pkt = framed.next() => {
                match pkt {
                    None => break,
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(pkt)) => match pkt.kind {
                        PacketKind::Message => {
                            let arrival = Arrival {
                                payload: pkt.body.to_vec(),
                                ack: Some(AckToken::Mtp { sn: pkt.sn, command: false }),
                            };
                            if arrivals.send(arrival).await.is_err() { break; }
                        }
                        PacketKind::Command => {
                            let arrival = Arrival {
                                payload: pkt.body.to_vec(),
                                ack: Some(AckToken::Mtp { sn: pkt.sn, command: true }),
                            };
                            if arrivals.send(arrival).await.is_err() { break; }
                        }
                        // Responses close our own requests; nothing to do.
                        PacketKind::CommandResponse | PacketKind::MessageResponse => {
                            trace!(sn = ?pkt.sn, "MTP response received");
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Mars
// ---------------------------------------------------------------------------

async fn run_mars<S>(
    stream: S,
    arrivals: mpsc::Sender<Arrival>,
    mut departures: mpsc::Receiver<Departure>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), GateError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut framed = Framed::new(stream, MarsCodec);
    let mut next_seq: u32 = 1;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => { if *shutdown.borrow() { break; } }
            dep = departures.recv() => {
                let Some(dep) = dep else { break };
                let frame = match dep.body {
                    DepartureBody::Payload(payload) => {
                        let seq = next_seq;
                        next_seq += 1;
                        MarsFrame::push_message(seq, payload.into())
                    }
                    DepartureBody::Ack(AckToken::Mars { cmd, seq }) => {
                        MarsFrame::response(cmd, seq)
                    }
                    DepartureBody::Ack(AckToken::Mtp { .. }) => continue,
                };
                framed.send(frame).await?;
            }
            frame = framed.next() => {
                match frame {
                    None => break,
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(frame)) => {
                        if frame.is_ping() {
                            framed.send(MarsFrame::pong(frame.seq)).await?;
                            continue;
                        }
                        match frame.cmd {
                            mars::CMD_SEND_MSG => {
                                let arrival = Arrival {
                                    payload: frame.body.to_vec(),
                                    ack: Some(AckToken::Mars { cmd: frame.cmd, seq: frame.seq }),
                                };
                                if arrivals.send(arrival).await.is_err() { break; }
                            }
                            mars::CMD_PUSH_MESSAGE => {
                                let arrival = Arrival { payload: frame.body.to_vec(), ack: None };
                                if arrivals.send(arrival).await.is_err() { break; }
                            }
                            // NOOP keeps the connection warm.
                            _ => trace!(cmd = frame.cmd, "mars noop"),
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

async fn run_ws<S>(
    stream: S,
    arrivals: mpsc::Sender<Arrival>,
    mut departures: mpsc::Receiver<Departure>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), GateError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    use tokio_tungstenite::tungstenite::protocol::Message;

    let mut ws = tokio_tungstenite::accept_async(stream).await?;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => { if *shutdown.borrow() { break; } }
            dep = departures.recv() => {
                let Some(dep) = dep else { break };
                match dep.body {
                    DepartureBody::Payload(payload) => {
                        ws.send(Message::Binary(payload.into())).await?;
                    }
                    // WebSocket has no framing-level page acks.
                    DepartureBody::Ack(_) => {}
                }
            }
            msg = ws.next() => {
                match msg {
                    None => break,
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(Message::Binary(b))) => {
                        let arrival = Arrival { payload: b.to_vec(), ack: None };
                        if arrivals.send(arrival).await.is_err() { break; }
                    }
                    Some(Ok(Message::Text(t))) => {
                        let arrival = Arrival { payload: t.as_bytes().to_vec(), ack: None };
                        if arrivals.send(arrival).await.is_err() { break; }
                    }
                    Some(Ok(Message::Ping(d))) => { let _ = ws.send(Message::Pong(d)).await; }
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Priority;
    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::codec::{Decoder, Encoder};

    async fn spawn_gate(
        protocol: WireProtocol,
    ) -> (
        tokio::io::DuplexStream,
        mpsc::Receiver<Arrival>,
        mpsc::Sender<Departure>,
        watch::Sender<bool>,
    ) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (arr_tx, arr_rx) = mpsc::channel(64);
        let (dep_tx, dep_rx) = mpsc::channel(64);
        let (sd_tx, sd_rx) = watch::channel(false);
        tokio::spawn(async move {
            let _ = run_framed_gate(server, protocol, arr_tx, dep_rx, sd_rx).await;
        });
        (client, arr_rx, dep_tx, sd_tx)
    }

    #[tokio::test]
    async fn mtp_message_surfaces_arrival_with_ack_token() {
        let (mut client, mut arrivals, _deps, _sd) = spawn_gate(WireProtocol::Mtp).await;

        let pkt = MtpPacket::message(*b"SN000001", "payload".into());
        let mut buf = BytesMut::new();
        MtpCodec.encode(pkt, &mut buf).unwrap();
        client.write_all(&buf).await.unwrap();

        let arrival = arrivals.recv().await.unwrap();
        assert_eq!(arrival.payload, b"payload");
        assert_eq!(
            arrival.ack,
            Some(AckToken::Mtp { sn: *b"SN000001", command: false })
        );
    }

    #[tokio::test]
    async fn mtp_departure_is_framed_as_message_packet() {
        let (mut client, _arrivals, deps, _sd) = spawn_gate(WireProtocol::Mtp).await;

        deps.send(Departure::message(b"out".to_vec(), Priority::NORMAL))
            .await
            .unwrap();

        let mut read = vec![0u8; 64];
        let n = client.read(&mut read).await.unwrap();
        let mut buf = BytesMut::from(&read[..n]);
        let pkt = MtpCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(pkt.kind, PacketKind::Message);
        assert_eq!(pkt.body.as_ref(), b"out");
    }

    #[tokio::test]
    async fn mars_ping_answered_with_pong_not_surfaced() {
        let (mut client, mut arrivals, _deps, _sd) = spawn_gate(WireProtocol::Mars).await;

        let ping = MarsFrame {
            cmd: mars::CMD_NOOP,
            seq: 9,
            sn: None,
            body: "PING".into(),
        };
        let mut buf = BytesMut::new();
        MarsCodec.encode(ping, &mut buf).unwrap();
        client.write_all(&buf).await.unwrap();

        let mut read = vec![0u8; 64];
        let n = client.read(&mut read).await.unwrap();
        let mut buf = BytesMut::from(&read[..n]);
        let pong = MarsCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(pong.body.as_ref(), b"PONG");
        assert_eq!(pong.seq, 9);
        assert!(arrivals.try_recv().is_err());
    }

    #[tokio::test]
    async fn mars_send_msg_gets_ack_token_and_response() {
        let (mut client, mut arrivals, deps, _sd) = spawn_gate(WireProtocol::Mars).await;

        let frame = MarsFrame {
            cmd: mars::CMD_SEND_MSG,
            seq: 17,
            sn: None,
            body: "msg".into(),
        };
        let mut buf = BytesMut::new();
        MarsCodec.encode(frame, &mut buf).unwrap();
        client.write_all(&buf).await.unwrap();

        let arrival = arrivals.recv().await.unwrap();
        let token = arrival.ack.clone().unwrap();
        assert_eq!(token, AckToken::Mars { cmd: mars::CMD_SEND_MSG, seq: 17 });

        deps.send(Departure::response(token)).await.unwrap();
        let mut read = vec![0u8; 64];
        let n = client.read(&mut read).await.unwrap();
        let mut buf = BytesMut::from(&read[..n]);
        let resp = MarsCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(resp.seq, 17);
        assert_eq!(resp.body.as_ref(), b"OK");
    }

    #[tokio::test]
    async fn shutdown_stops_the_gate() {
        let (_client, _arrivals, deps, sd) = spawn_gate(WireProtocol::Mars).await;
        sd.send(true).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        // Gate is gone: its receiver is dropped and sends start failing.
        let mut closed = false;
        for _ in 0..50 {
            if deps
                .send(Departure::message(b"x".to_vec(), Priority::NORMAL))
                .await
                .is_err()
            {
                closed = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(closed);
    }
}
