// dim-protocol: Stream framings for station connections.
//
// One listening port accepts three mutually recognizable framings; the
// first bytes of a connection's first frame select the decoder:
//
// - MTP: length-prefixed typed packets with a transaction ID
// - Mars: length-prefixed frames with a (cmd, seq) header
// - WebSocket: RFC 6455 after HTTP upgrade, inner DIM frame as payload
//
// The gate surfaces every complete inbound frame as an `Arrival` and
// writes prioritized `Departure`s back; everything above the gate is
// framing-agnostic.

pub mod frame;
pub mod gate;
pub mod mars;
pub mod mtp;
pub mod sniff;

pub use frame::{AckToken, Arrival, Departure, Priority};
pub use gate::{GateError, run_gate};
pub use sniff::{WireProtocol, sniff};
