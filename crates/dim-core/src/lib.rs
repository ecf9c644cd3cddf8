// dim-core: Entity identifiers, message envelopes, and command contents
// shared by the station and the octopus edge.
//
// The station routes ciphertext it cannot read; everything in this crate
// is the routable outside of a message, never the plaintext inside.

pub mod command;
pub mod id;
pub mod message;

pub use command::{
    AnsCommand, Command, DocumentCommand, HandshakeCommand, HandshakeTitle, LoginCommand,
    LoginStation, ReceiptCommand, ReportCommand,
};
pub use id::{Address, EntityType, Id, IdError};
pub use message::{Envelope, MessageError, ReliableMessage};
