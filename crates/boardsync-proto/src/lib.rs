//! # BoardSync Protocol
//!
//! Wire boundary between the replica core and an external transport.
//!
//! ## Formats
//!
//! - Operation JSON: the interop shape of [`boardsync_core::Operation`],
//!   validated on decode ([`codec`])
//! - `SyncMessage` CBOR: operation delivery and full-state resync
//!   ([`messages`])
//!
//! ## Resync contract
//!
//! [`resync::handle`] applies an inbound message to a replica and returns the
//! reply the transport must send: a snapshot request when an operation was
//! dropped as not causally ready, a snapshot when one was requested.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod messages;
pub mod resync;

pub use codec::{decode_batch, decode_operation, encode_operation, CodecError};
pub use messages::{MessageError, SyncMessage};
pub use resync::handle;
