//! Protocol constants, opcode tables, and the configuration-string store.
//!
//! Every reliable message is a stream of opcode-tagged records. Opcode
//! bytes outside the tables below are fatal: the bitstream carries no field
//! framing, so an unknown record cannot be skipped and the connection must
//! drop.

use crate::error::ProtocolError;

/// Wire protocol revision; both ends must match exactly.
pub const PROTOCOL_VERSION: u16 = 7;

/// Default UDP port for dedicated servers.
pub const PORT_SERVER: u16 = 27_880;

/// Most simultaneous clients a server will accept.
pub const MAX_CLIENTS: usize = 16;

/// Model slots in the configuration-string table.
pub const MAX_MODELS: usize = 256;
/// Sound slots in the configuration-string table.
pub const MAX_SOUNDS: usize = 256;

/// Config string: server (host) name.
pub const CS_SERVER_NAME: usize = 0;
/// Config string: map path.
pub const CS_MAP: usize = 1;
/// First model name slot.
pub const CS_MODELS: usize = 32;
/// First sound name slot.
pub const CS_SOUNDS: usize = CS_MODELS + MAX_MODELS;
/// First per-player info slot.
pub const CS_PLAYERS: usize = CS_SOUNDS + MAX_SOUNDS;
/// Total size of the configuration-string table.
pub const MAX_CONFIG_STRINGS: usize = CS_PLAYERS + MAX_CLIENTS;

/// Longest value a configuration string may hold.
pub const MAX_CONFIG_STRING_LEN: usize = 64;

/// Server-to-client message opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerOp {
    /// Keepalive, no payload.
    Nop = 1,
    /// Connection is over; reason string follows.
    Disconnect = 2,
    /// Drop the channel and redo the handshake against the same address.
    Reconnect = 3,
    /// Console text: print level byte + string.
    Print = 4,
    /// Command text the client must execute (handshake sequencing, server
    /// redirects).
    StuffText = 5,
    /// Handshake payload: protocol version, spawn count, client slot, map.
    ServerData = 6,
    /// Configuration-string set: index + value.
    ConfigString = 7,
    /// Spawn baseline: full entity state to delta against later.
    SpawnBaseline = 8,
    /// Frame envelope: header, then `PlayerState` and `PacketEntities`.
    Frame = 9,
    /// Player-state delta; only valid inside a `Frame`.
    PlayerState = 10,
    /// Packet-entities delta list; only valid inside a `Frame`.
    PacketEntities = 11,
}

impl TryFrom<u8> for ServerOp {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(ServerOp::Nop),
            2 => Ok(ServerOp::Disconnect),
            3 => Ok(ServerOp::Reconnect),
            4 => Ok(ServerOp::Print),
            5 => Ok(ServerOp::StuffText),
            6 => Ok(ServerOp::ServerData),
            7 => Ok(ServerOp::ConfigString),
            8 => Ok(ServerOp::SpawnBaseline),
            9 => Ok(ServerOp::Frame),
            10 => Ok(ServerOp::PlayerState),
            11 => Ok(ServerOp::PacketEntities),
            other => Err(ProtocolError::UnknownServerOp(other)),
        }
    }
}

/// Client-to-server message opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientOp {
    /// Keepalive, no payload.
    Nop = 1,
    /// Command batch: last-received frame + three delta-compressed commands.
    Move = 2,
    /// Updated userinfo string.
    UserInfo = 3,
    /// Console command forwarded for server-side execution.
    StringCmd = 4,
}

impl TryFrom<u8> for ClientOp {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(ClientOp::Nop),
            2 => Ok(ClientOp::Move),
            3 => Ok(ClientOp::UserInfo),
            4 => Ok(ClientOp::StringCmd),
            other => Err(ProtocolError::UnknownClientOp(other)),
        }
    }
}

/// Console print levels carried by [`ServerOp::Print`].
pub mod print_level {
    /// Low-priority chatter, filterable client-side.
    pub const LOW: u8 = 0;
    /// Chat text.
    pub const CHAT: u8 = 1;
    /// Always shown.
    pub const HIGH: u8 = 2;
}

/// Shared out-of-band state store both peers must agree on.
///
/// Implemented by [`ConfigStringTable`]; the trait exists so engine hosts
/// can interpose (precache hooks, renderer registration) without the
/// protocol core knowing about them.
pub trait ConfigStore {
    /// Value at `index`, empty string when unset.
    fn get(&self, index: usize) -> &str;
    /// Set `index` to `value`, validating bounds and length.
    fn set(&mut self, index: usize, value: &str) -> Result<(), ProtocolError>;
}

/// Console command registry collaborator. The console subsystem is
/// external; the protocol core only declares which command names it wants
/// routed back to it.
pub trait CommandRegistry {
    /// Make `name` invocable from the console.
    fn register(&mut self, name: &'static str);
}

/// Fixed-size configuration-string table.
#[derive(Debug)]
pub struct ConfigStringTable {
    strings: Vec<String>,
}

impl Default for ConfigStringTable {
    fn default() -> Self {
        Self {
            strings: vec![String::new(); MAX_CONFIG_STRINGS],
        }
    }
}

impl ConfigStringTable {
    /// Iterate the populated slots.
    pub fn iter_set(&self) -> impl Iterator<Item = (usize, &str)> {
        self.strings
            .iter()
            .enumerate()
            .filter(|(_, value)| !value.is_empty())
            .map(|(index, value)| (index, value.as_str()))
    }

    /// Clear every slot (level change).
    pub fn clear(&mut self) {
        for slot in &mut self.strings {
            slot.clear();
        }
    }
}

impl ConfigStore for ConfigStringTable {
    fn get(&self, index: usize) -> &str {
        self.strings.get(index).map_or("", |value| value.as_str())
    }

    fn set(&mut self, index: usize, value: &str) -> Result<(), ProtocolError> {
        if index >= MAX_CONFIG_STRINGS {
            return Err(ProtocolError::BadConfigStringIndex(index as u16));
        }
        if value.len() > MAX_CONFIG_STRING_LEN {
            return Err(ProtocolError::ConfigStringTooLong(value.len()));
        }
        self.strings[index] = value.to_string();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_ops_round_trip_through_bytes() {
        for op in [
            ServerOp::Nop,
            ServerOp::Disconnect,
            ServerOp::Reconnect,
            ServerOp::Print,
            ServerOp::StuffText,
            ServerOp::ServerData,
            ServerOp::ConfigString,
            ServerOp::SpawnBaseline,
            ServerOp::Frame,
            ServerOp::PlayerState,
            ServerOp::PacketEntities,
        ] {
            assert_eq!(ServerOp::try_from(op as u8).unwrap(), op);
        }
    }

    #[test]
    fn unknown_opcodes_are_rejected() {
        assert_eq!(
            ServerOp::try_from(0).unwrap_err(),
            ProtocolError::UnknownServerOp(0)
        );
        assert_eq!(
            ServerOp::try_from(200).unwrap_err(),
            ProtocolError::UnknownServerOp(200)
        );
        assert_eq!(
            ClientOp::try_from(99).unwrap_err(),
            ProtocolError::UnknownClientOp(99)
        );
    }

    #[test]
    fn config_strings_enforce_bounds() {
        let mut table = ConfigStringTable::default();
        table.set(CS_MAP, "maps/demo1").unwrap();
        assert_eq!(table.get(CS_MAP), "maps/demo1");
        assert_eq!(table.get(CS_MODELS + 3), "");

        assert_eq!(
            table.set(MAX_CONFIG_STRINGS, "x").unwrap_err(),
            ProtocolError::BadConfigStringIndex(MAX_CONFIG_STRINGS as u16)
        );
        let long = "y".repeat(MAX_CONFIG_STRING_LEN + 1);
        assert!(matches!(
            table.set(0, &long).unwrap_err(),
            ProtocolError::ConfigStringTooLong(_)
        ));
    }

    #[test]
    fn iter_set_skips_empty_slots() {
        let mut table = ConfigStringTable::default();
        table.set(CS_MAP, "maps/demo1").unwrap();
        table.set(CS_MODELS, "models/crate.md3").unwrap();
        let set: Vec<_> = table.iter_set().collect();
        assert_eq!(
            set,
            vec![(CS_MAP, "maps/demo1"), (CS_MODELS, "models/crate.md3")]
        );
    }
}
