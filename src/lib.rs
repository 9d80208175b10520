//! A self-describing, variable-length binary wire format (DBF) with an
//! ASCII mirror mode and a framed-stream receiver.
//!
//! The format encodes a sequence of typed values (signed integers, quoted
//! strings, unquoted words) as a stream of prefix-coded sub-codes. Small
//! integers and common ASCII characters fit in a single byte; runs of
//! identical integers fold into a single repetition code; an optional
//! trailing CRC-32 covers the payload. The same byte sequence can be
//! losslessly reinterpreted as plain, human-readable ASCII for debugging
//! (see [`serializer::GenericSerializer::new_ascii`] and
//! [`unserializer::Unserializer::new_ascii`]).
//!
//! Four components, lowest first:
//!   - [`subcode`] — the bit-level prefix code shared by everything else.
//!   - [`serializer`] — streaming, value-by-value message writer.
//!   - [`unserializer`] — streaming, value-by-value message reader.
//!   - [`receiver`] — byte-at-a-time framing of an untrusted transport.
//!
//! All types are single-owner and single-threaded; there is no internal
//! locking and no shared mutable state between instances.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "alloc")]
extern crate alloc;

pub mod ascii;
pub mod buffer;
pub mod crc;
pub mod receiver;
pub mod serializer;
pub mod subcode;
pub mod unserializer;

mod trace;

pub use buffer::{BufferError, ByteSink, FixedBuf};
#[cfg(feature = "alloc")]
pub use buffer::GrowableBuf;
pub use receiver::{Encoding, ProcessOutcome, Receiver, ReceiverError, ReceiverState};
#[cfg(feature = "alloc")]
pub use serializer::Serializer;
pub use serializer::{FixedSerializer, GenericSerializer};
pub use unserializer::{CrcStatus, DecoderState, Unserializer};

/// Crate version, as it would appear in a handshake/debug banner.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
