#![warn(missing_docs)]
//! Network protocol core shared by the client and server.
//!
//! Layering, leaves first: [`msg`] is the bitstream codec every other module
//! encodes through; [`channel`] turns an unreliable datagram socket into a
//! sequenced channel with single-flight reliable delivery; [`delta`] and
//! [`snapshot`] implement baseline + delta entity replication; [`prediction`]
//! holds the client command ring and reconciliation; [`protocol`] pins down
//! opcodes, limits, and the configuration-string table; [`transport`] is the
//! socket abstraction the tick loops poll once per frame.

pub mod channel;
pub mod config;
pub mod delta;
pub mod error;
pub mod msg;
pub mod prediction;
pub mod protocol;
pub mod snapshot;
pub mod transport;

pub use channel::{NetChannel, NetSide, ProcessedPacket};
pub use config::NetConfig;
pub use error::{ChannelError, ProtocolError};
pub use msg::{MessageBuffer, MAX_MESSAGE_LEN};
pub use protocol::{
    ClientOp, CommandRegistry, ConfigStringTable, ConfigStore, ServerOp, PROTOCOL_VERSION,
};
pub use snapshot::{BaselineTable, EntityTable, FrameSnapshot, SnapshotHistory, FRAME_BACKUP};
pub use transport::{MemoryNetwork, MemorySocket, Socket, UdpTransport};
