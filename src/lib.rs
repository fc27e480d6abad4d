//! # Parley
//!
//! Identity and secure-channel engine for end-to-end encrypted messaging
//! over an untrusted store-and-forward relay.
//!
//! ## Features
//!
//! - **Long-term identities** with Ed25519 signing and X25519 agreement keys
//! - **Mutually authenticated handshakes** (triple Diffie-Hellman, signed
//!   transcript, key confirmation) per contact device
//! - **Session encryption** with ChaCha20-Poly1305, per-direction keys,
//!   sequence numbers and a sliding replay window
//! - **Retrying relay client** with exponential backoff and cancellation
//! - **Encrypted persistence**: private keys, contacts and sessions are
//!   sealed before they reach disk
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use parley::{CancelToken, Engine, EngineConfig, MemoryRelay, TrustLevel};
//!
//! # async fn demo() -> parley::EngineResult<()> {
//! let relay = Arc::new(MemoryRelay::new());
//! let alice = Engine::new(EngineConfig::default(), relay.clone())?;
//! let bob = Engine::new(EngineConfig::default(), relay)?;
//!
//! let a = alice.create_identity()?;
//! let b = bob.create_identity()?;
//! alice.add_contact(&a.id(), b.public, TrustLevel::Trusted)?;
//! alice.add_contact_device(&a.id(), &b.id(), b.device)?;
//!
//! // Bob must be polling for the handshake to complete
//! alice
//!     .send_message(&a.id(), &b.id(), &b.device, b"hello", &CancelToken::never())
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                   ENGINE                    │
//! │   send | poll | trust | callbacks           │
//! └─────────────────────┬───────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │                  CHANNELS                   │
//! │  Handshake | Sessions | Dispatch queues     │
//! └─────────────────────┬───────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │            IDENTITIES AND STORAGE           │
//! │  Key store | Registry | Sealed store        │
//! └─────────────────────┬───────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │                   RELAY                     │
//! │   Retry/backoff | WebSocket | In-memory     │
//! └─────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

#[macro_use]
mod macros;

pub mod channel;
pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod keystore;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;

// Re-export main types at crate root
pub use channel::ChannelState;
pub use config::EngineConfig;
pub use crypto::{CryptoError, CryptoResult, DeviceId, IdentityId, PublicIdentity};
pub use engine::{Diagnostic, Engine, ReceivedMessage};
pub use error::{EngineError, EngineResult, HandshakeFailure};
pub use registry::{Contact, LocalIdentity, TrustLevel};
pub use server::{CancelHandle, CancelToken, MemoryRelay, MessageId, RelayApi, WebSocketRelay};
pub use storage::{DirStorage, Storage, StorageKey};
