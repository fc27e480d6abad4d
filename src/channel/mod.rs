//! Channel establishment
//!
//! A channel is an authenticated session between one local identity and one
//! device of a contact. [`ChannelEngine`] runs the three-message handshake
//! that creates it; [`ChannelState`] tracks where each channel stands.

mod message;
mod protocol;
mod state;

pub use message::{
    ConfirmMessage, ConfirmationMac, HandshakeId, HandshakeMessage, InitMessage, ResponseMessage,
    HANDSHAKE_ID_SIZE, MAC_SIZE, PROTOCOL_CONTEXT, PROTOCOL_VERSION,
};
pub use protocol::{ChannelEngine, HandshakeOutcome};
pub use state::{ChannelEvent, ChannelState, InvalidTransition};
