//! Mars framing: length-prefixed frames with a (cmd, seq) header.
//!
//! # Wire layout (20-byte head, big-endian u32 fields)
//!
//! ```text
//! head_len=20 | version=200 | cmd | seq | body_len | body...
//! ```
//!
//! Commands recognized at transport: `SEND_MSG` (3), `NOOP` (6),
//! `PUSH_MESSAGE` (10001).  A body may begin with `Mars SN:<base64>\n`,
//! overriding the sequence-derived SN for the inner payload.  The payload
//! `PING` is answered with `PONG` at the transport and never surfaced.
//!
//! Heads that fail the sanity checks are re-sought one byte at a time.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

pub const HEAD_LEN: usize = 20;
pub const VERSION: u32 = 200;
pub const MAX_BODY: usize = 1 << 24;

pub const CMD_SEND_MSG: u32 = 3;
pub const CMD_NOOP: u32 = 6;
pub const CMD_PUSH_MESSAGE: u32 = 10_001;

const SN_PREFIX: &[u8] = b"Mars SN:";

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One Mars frame, SN prefix already stripped from the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarsFrame {
    pub cmd: u32,
    pub seq: u32,
    /// SN override parsed from the `Mars SN:` body prefix, if present.
    pub sn: Option<Vec<u8>>,
    pub body: Bytes,
}

impl MarsFrame {
    pub fn push_message(seq: u32, body: Bytes) -> MarsFrame {
        MarsFrame {
            cmd: CMD_PUSH_MESSAGE,
            seq,
            sn: None,
            body,
        }
    }

    /// Acknowledge a SEND_MSG by echoing its (cmd, seq).
    pub fn response(cmd: u32, seq: u32) -> MarsFrame {
        MarsFrame {
            cmd,
            seq,
            sn: None,
            body: Bytes::from_static(b"OK"),
        }
    }

    pub fn pong(seq: u32) -> MarsFrame {
        MarsFrame {
            cmd: CMD_NOOP,
            seq,
            sn: None,
            body: Bytes::from_static(b"PONG"),
        }
    }

    pub fn is_ping(&self) -> bool {
        self.body.as_ref() == b"PING"
    }
}

fn known_cmd(cmd: u32) -> bool {
    matches!(cmd, CMD_SEND_MSG | CMD_NOOP | CMD_PUSH_MESSAGE)
}

/// Split an optional `Mars SN:<base64>\n` prefix off a frame body.
fn split_sn(body: Bytes) -> (Option<Vec<u8>>, Bytes) {
    if !body.starts_with(SN_PREFIX) {
        return (None, body);
    }
    let Some(nl) = body.iter().position(|&b| b == b'\n') else {
        return (None, body);
    };
    let encoded = &body[SN_PREFIX.len()..nl];
    match B64.decode(encoded) {
        Ok(sn) => {
            let rest = body.slice(nl + 1..);
            (Some(sn), rest)
        }
        Err(_) => {
            trace!("undecodable Mars SN prefix left in body");
            (None, body)
        }
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum MarsError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Default)]
pub struct MarsCodec;

impl Decoder for MarsCodec {
    type Item = MarsFrame;
    type Error = MarsError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<MarsFrame>, MarsError> {
        loop {
            if buf.len() < HEAD_LEN {
                return Ok(None);
            }
            let head_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
            let version = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
            let cmd = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
            let seq = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
            let body_len = u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]) as usize;
            if head_len != HEAD_LEN || version != VERSION || !known_cmd(cmd) || body_len > MAX_BODY
            {
                trace!(head_len, version, cmd, "implausible Mars head, re-seeking");
                buf.advance(1);
                continue;
            }
            if buf.len() < HEAD_LEN + body_len {
                buf.reserve(HEAD_LEN + body_len - buf.len());
                return Ok(None);
            }
            buf.advance(HEAD_LEN);
            let raw = buf.split_to(body_len).freeze();
            let (sn, body) = split_sn(raw);
            return Ok(Some(MarsFrame { cmd, seq, sn, body }));
        }
    }
}

impl Encoder<MarsFrame> for MarsCodec {
    type Error = MarsError;

    fn encode(&mut self, frame: MarsFrame, buf: &mut BytesMut) -> Result<(), MarsError> {
        let mut body = BytesMut::new();
        if let Some(sn) = &frame.sn {
            body.put_slice(SN_PREFIX);
            body.put_slice(B64.encode(sn).as_bytes());
            body.put_u8(b'\n');
        }
        body.put_slice(&frame.body);
        buf.reserve(HEAD_LEN + body.len());
        buf.put_u32(HEAD_LEN as u32);
        buf.put_u32(VERSION);
        buf.put_u32(frame.cmd);
        buf.put_u32(frame.seq);
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(frame: MarsFrame) -> BytesMut {
        let mut buf = BytesMut::new();
        MarsCodec.encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn round_trip_send_msg() {
        let frame = MarsFrame {
            cmd: CMD_SEND_MSG,
            seq: 7,
            sn: None,
            body: Bytes::from_static(b"{\"sender\":\"a@b\"}"),
        };
        let mut buf = encode(frame.clone());
        assert_eq!(MarsCodec.decode(&mut buf).unwrap().unwrap(), frame);
    }

    #[test]
    fn sn_prefix_overrides_sequence() {
        let frame = MarsFrame {
            cmd: CMD_SEND_MSG,
            seq: 42,
            sn: Some(b"override-sn".to_vec()),
            body: Bytes::from_static(b"payload"),
        };
        let mut buf = encode(frame.clone());
        let out = MarsCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(out.sn.as_deref(), Some(&b"override-sn"[..]));
        assert_eq!(out.body.as_ref(), b"payload");
        assert_eq!(out.seq, 42);
    }

    #[test]
    fn ping_is_detected() {
        let frame = MarsFrame {
            cmd: CMD_NOOP,
            seq: 1,
            sn: None,
            body: Bytes::from_static(b"PING"),
        };
        assert!(frame.is_ping());
        assert_eq!(MarsFrame::pong(1).body.as_ref(), b"PONG");
    }

    #[test]
    fn bad_head_reseeks_to_next_frame() {
        let frame = MarsFrame::push_message(3, Bytes::from_static(b"x"));
        let mut buf = BytesMut::from(&[9u8, 9, 9][..]);
        buf.extend_from_slice(&encode(frame.clone()));
        assert_eq!(MarsCodec.decode(&mut buf).unwrap().unwrap(), frame);
    }

    #[test]
    fn partial_body_waits_for_more() {
        let frame = MarsFrame::push_message(5, Bytes::from_static(b"long-payload"));
        let full = encode(frame.clone());
        let mut buf = BytesMut::from(&full[..HEAD_LEN + 3]);
        assert!(MarsCodec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[HEAD_LEN + 3..]);
        assert_eq!(MarsCodec.decode(&mut buf).unwrap().unwrap(), frame);
    }
}
