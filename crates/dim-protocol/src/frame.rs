//! Framing-agnostic arrival/departure model.
//!
//! The gate translates wire frames into `Arrival`s and `Departure`s into
//! wire frames.  Sessions never see framing details; the opaque `AckToken`
//! carries whatever the framing needs to acknowledge a page.

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Outbound priority; lower is earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority(pub i8);

impl Priority {
    /// Handshake replies and acks jump the queue.
    pub const URGENT: Priority = Priority(-1);
    pub const NORMAL: Priority = Priority(0);
    /// Bulk replay traffic yields to fresh messages.
    pub const SLOWER: Priority = Priority(1);
}

// ---------------------------------------------------------------------------
// AckToken
// ---------------------------------------------------------------------------

/// What the framing needs to acknowledge an inbound frame.
///
/// WebSocket frames are not acknowledged at the framing layer, so they
/// carry no token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckToken {
    /// MTP packets are acknowledged with a response packet carrying the
    /// same transaction ID: message-response for a message page,
    /// command-response to close a command.
    Mtp { sn: [u8; 8], command: bool },
    /// Mars SEND_MSG frames are acknowledged with a response frame
    /// carrying the same (cmd, seq).
    Mars { cmd: u32, seq: u32 },
}

// ---------------------------------------------------------------------------
// Arrival / Departure
// ---------------------------------------------------------------------------

/// One complete inbound frame: the inner DIM payload plus, when the
/// framing wants one, the token to acknowledge it with.
#[derive(Debug, Clone)]
pub struct Arrival {
    pub payload: Vec<u8>,
    pub ack: Option<AckToken>,
}

/// One outbound frame with its queue priority and retry budget.
#[derive(Debug, Clone)]
pub enum DepartureBody {
    /// A DIM payload; the gate wraps it as a message frame.
    Payload(Vec<u8>),
    /// Acknowledge a previously received frame.
    Ack(AckToken),
}

#[derive(Debug, Clone)]
pub struct Departure {
    pub body: DepartureBody,
    pub priority: Priority,
    /// Remaining send attempts.  Message frames default to 3, responses to 1.
    pub retries: u8,
}

impl Departure {
    pub fn message(payload: Vec<u8>, priority: Priority) -> Departure {
        Departure {
            body: DepartureBody::Payload(payload),
            priority,
            retries: 3,
        }
    }

    pub fn response(token: AckToken) -> Departure {
        Departure {
            body: DepartureBody::Ack(token),
            priority: Priority::URGENT,
            retries: 1,
        }
    }
}
