//! Error types for the protocol core.
//!
//! Transient network conditions (loss, duplication, reordering) are never
//! errors; they are counted by the channel and dropped. These types cover
//! the fatal category: a message stream that cannot be decoded safely, which
//! costs the offending connection and nothing else.

use thiserror::Error;

/// Fatal protocol violation detected while decoding a message stream.
///
/// The bitstream has no field framing, so after any of these the read
/// cursor cannot be resynchronized; the connection is dropped with the
/// error as the diagnostic.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Server message started with an opcode byte outside the table.
    #[error("unknown server opcode {0}")]
    UnknownServerOp(u8),

    /// Client message started with an opcode byte outside the table.
    #[error("unknown client opcode {0}")]
    UnknownClientOp(u8),

    /// A field read ran past the end of the message.
    #[error("message ended in the middle of a field")]
    UnexpectedEnd,

    /// Entity number outside `1..MAX_ENTITIES`.
    #[error("entity number {0} out of range")]
    BadEntityNumber(u16),

    /// Packet-entities list not in ascending entity-number order.
    #[error("packet entities out of order: {prev} followed by {got}")]
    NonAscendingEntities {
        /// Previously decoded entity number.
        prev: u16,
        /// The offending number that followed it.
        got: u16,
    },

    /// Configuration-string index outside the table.
    #[error("config string index {0} out of range")]
    BadConfigStringIndex(u16),

    /// Configuration-string value over the length bound.
    #[error("config string of {0} bytes exceeds the limit")]
    ConfigStringTooLong(usize),

    /// Peer speaks a protocol version we do not.
    #[error("unsupported protocol version {0}")]
    BadProtocolVersion(u16),

    /// `PlayerState`/`PacketEntities` arrived outside a `Frame` envelope.
    #[error("frame data outside a frame message")]
    OutOfPlaceFrameData,
}

/// Errors from the sequenced datagram channel.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// Queued reliable data would exceed the channel's staging capacity.
    /// The pending payload is left untouched.
    #[error("reliable payload of {size} bytes exceeds channel capacity {capacity}")]
    ReliableOverflow {
        /// Bytes the staging buffer would have held after the push.
        size: usize,
        /// Staging capacity.
        capacity: usize,
    },

    /// Datagram shorter than the channel header.
    #[error("runt packet of {0} bytes")]
    RuntPacket(usize),
}
