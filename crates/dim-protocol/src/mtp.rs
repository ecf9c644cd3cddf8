//! MTP framing: length-prefixed typed packets.
//!
//! # Wire layout (16-byte head, big-endian)
//!
//! ```text
//! 0      3    4           12          16
//! "DIM"  kind transaction  body_len    body...
//! ```
//!
//! Kinds: Command=0x00, CommandResponse=0x01, Message=0x02,
//! MessageResponse=0x03.  Messages carry a DIM payload; a
//! command-response closes a request and a message-response acknowledges
//! a page, both echoing the transaction ID.
//!
//! Malformed head bytes are skipped one at a time until a valid head is
//! found (the stream re-synchronizes on the magic).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

pub const MAGIC: &[u8; 3] = b"DIM";
pub const HEAD_LEN: usize = 16;
/// Upper bound on one packet body; larger lengths are treated as a
/// corrupted head.
pub const MAX_BODY: usize = 1 << 24;

// ---------------------------------------------------------------------------
// Packet
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    Command = 0x00,
    CommandResponse = 0x01,
    Message = 0x02,
    MessageResponse = 0x03,
}

impl PacketKind {
    fn from_byte(b: u8) -> Option<PacketKind> {
        match b {
            0x00 => Some(PacketKind::Command),
            0x01 => Some(PacketKind::CommandResponse),
            0x02 => Some(PacketKind::Message),
            0x03 => Some(PacketKind::MessageResponse),
            _ => None,
        }
    }
}

/// One MTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MtpPacket {
    pub kind: PacketKind,
    /// Transaction ID; responses echo the request's.
    pub sn: [u8; 8],
    pub body: Bytes,
}

impl MtpPacket {
    pub fn message(sn: [u8; 8], body: Bytes) -> MtpPacket {
        MtpPacket {
            kind: PacketKind::Message,
            sn,
            body,
        }
    }

    /// Acknowledge a message page.
    pub fn message_response(sn: [u8; 8]) -> MtpPacket {
        MtpPacket {
            kind: PacketKind::MessageResponse,
            sn,
            body: Bytes::from_static(b"OK"),
        }
    }

    pub fn command_response(sn: [u8; 8], body: Bytes) -> MtpPacket {
        MtpPacket {
            kind: PacketKind::CommandResponse,
            sn,
            body,
        }
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Error type shared by the MTP codec halves.
#[derive(Debug, thiserror::Error)]
pub enum MtpError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Default)]
pub struct MtpCodec;

impl Decoder for MtpCodec {
    type Item = MtpPacket;
    type Error = MtpError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<MtpPacket>, MtpError> {
        loop {
            if buf.len() < HEAD_LEN {
                return Ok(None);
            }
            // Re-synchronize on the magic: drop one byte at a time.
            if &buf[0..3] != MAGIC {
                trace!(byte = buf[0], "skipping byte before MTP head");
                buf.advance(1);
                continue;
            }
            let kind = match PacketKind::from_byte(buf[3]) {
                Some(k) => k,
                None => {
                    trace!(kind = buf[3], "unknown MTP packet kind, re-seeking");
                    buf.advance(1);
                    continue;
                }
            };
            let body_len =
                u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]) as usize;
            if body_len > MAX_BODY {
                trace!(body_len, "implausible MTP body length, re-seeking");
                buf.advance(1);
                continue;
            }
            if buf.len() < HEAD_LEN + body_len {
                // Partial frame: wait for the next read.
                buf.reserve(HEAD_LEN + body_len - buf.len());
                return Ok(None);
            }
            let mut head = buf.split_to(HEAD_LEN);
            head.advance(4);
            let mut sn = [0u8; 8];
            sn.copy_from_slice(&head[0..8]);
            let body = buf.split_to(body_len).freeze();
            return Ok(Some(MtpPacket { kind, sn, body }));
        }
    }
}

impl Encoder<MtpPacket> for MtpCodec {
    type Error = MtpError;

    fn encode(&mut self, pkt: MtpPacket, buf: &mut BytesMut) -> Result<(), MtpError> {
        buf.reserve(HEAD_LEN + pkt.body.len());
        buf.put_slice(MAGIC);
        buf.put_u8(pkt.kind as u8);
        buf.put_slice(&pkt.sn);
        buf.put_u32(pkt.body.len() as u32);
        buf.put_slice(&pkt.body);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
