#![warn(missing_docs)]
//! Server-side connection lifecycle and snapshot broadcast.
//!
//! [`Server`] owns the listen socket, the challenge list, one
//! [`ClientSlot`] per connection, the shared configuration strings and
//! spawn baselines, and the entity arena game code mutates between ticks.
//! Everything runs inside [`Server::tick`] on one thread: pump the socket,
//! simulate received commands, broadcast one frame per spawned client,
//! sweep timeouts.
//!
//! Handshake, server side: an out-of-band `getchallenge` gets a random
//! token; `connect` with a matching token allocates a slot and channel;
//! the client's reliable `new` triggers the queued setup stream
//! (server data, configuration strings, spawn baselines, `begin` stuff);
//! the client's `begin` puts the slot into the frame broadcast.

mod world;

use std::collections::VecDeque;
use std::net::SocketAddr;

use arclight_core::{
    player_move, short_to_angle, EntityState, MoveState, PlayerState, UserCmd, YAW,
};
use arclight_net::channel::{NetChannel, NetSide};
use arclight_net::delta::{read_delta_cmd, write_delta_entity, write_delta_player};
use arclight_net::protocol::{
    print_level, ClientOp, CommandRegistry, ConfigStore, ConfigStringTable, ServerOp, CS_MAP,
    PROTOCOL_VERSION,
};
use arclight_net::snapshot::{write_packet_entities, BaselineTable, FrameSnapshot, SnapshotHistory};
use arclight_net::transport::Socket;
use arclight_net::{MessageBuffer, NetConfig, ProtocolError};
use rand::Rng;
use tracing::{debug, info, warn};

pub use world::EntityArena;

/// Soft cap on a batched reliable setup message, leaving room for channel
/// overhead under the wire MTU.
const SETUP_BATCH_LEN: usize = 900;

/// Lifecycle of one connected client, server side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Channel allocated; waiting for the client's `new` request.
    Assigned,
    /// Setup stream queued/sent; waiting for `begin`.
    Primed,
    /// Receiving frames and simulating commands.
    Spawned,
}

/// Outstanding anti-spoof token.
struct Challenge {
    addr: SocketAddr,
    token: i32,
    issued_ms: u64,
}

/// Per-client connection state.
struct ClientSlot {
    addr: SocketAddr,
    qport: u16,
    state: SlotState,
    channel: NetChannel,
    created_ms: u64,
    /// Reliable messages waiting for the single-flight channel to free up.
    reliable_queue: VecDeque<Vec<u8>>,
    /// Frame history for delta compression, per client.
    history: SnapshotHistory,
    /// Newest frame the client reported reconstructing, -1 for none.
    acked_frame: i32,
    /// Sequence of the last move packet simulated, for drop compensation.
    last_move_sequence: u32,
    player: PlayerState,
    userinfo: String,
}

impl ClientSlot {
    fn avatar_number(index: usize) -> u16 {
        index as u16 + 1
    }
}

/// Value of `key` in a `\key\value` userinfo string.
fn userinfo_value<'a>(info: &'a str, key: &str) -> Option<&'a str> {
    let mut parts = info.split('\\').skip(1);
    while let Some(k) = parts.next() {
        let value = parts.next()?;
        if k == key {
            return Some(value);
        }
    }
    None
}

/// One game server endpoint.
pub struct Server<S: Socket> {
    socket: S,
    config: NetConfig,
    frame_number: u32,
    /// Bumped per level load so stale clients can be told to reconnect.
    spawn_count: i32,
    challenges: Vec<Challenge>,
    slots: Vec<Option<ClientSlot>>,
    config_strings: ConfigStringTable,
    baselines: BaselineTable,
    world: EntityArena,
}

impl<S: Socket> Server<S> {
    /// Create a server listening on `socket`.
    pub fn new(socket: S, config: NetConfig) -> Self {
        let slot_count = config.max_clients;
        Self {
            socket,
            config,
            frame_number: 0,
            spawn_count: 1,
            challenges: Vec::new(),
            slots: (0..slot_count).map(|_| None).collect(),
            config_strings: ConfigStringTable::default(),
            baselines: BaselineTable::default(),
            world: EntityArena::default(),
        }
    }

    /// Current server frame number.
    pub fn frame_number(&self) -> u32 {
        self.frame_number
    }

    /// Number of occupied client slots.
    pub fn client_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Lifecycle state of slot `index`, if occupied.
    pub fn slot_state(&self, index: usize) -> Option<SlotState> {
        self.slots.get(index)?.as_ref().map(|slot| slot.state)
    }

    /// Authoritative player state of slot `index`, if occupied.
    pub fn player_state(&self, index: usize) -> Option<&PlayerState> {
        self.slots.get(index)?.as_ref().map(|slot| &slot.player)
    }

    /// Userinfo string of slot `index`, if occupied.
    pub fn userinfo(&self, index: usize) -> Option<&str> {
        self.slots
            .get(index)?
            .as_ref()
            .map(|slot| slot.userinfo.as_str())
    }

    /// The shared configuration strings.
    pub fn config_strings(&self) -> &ConfigStringTable {
        &self.config_strings
    }

    /// The live entity arena.
    pub fn world(&self) -> &EntityArena {
        &self.world
    }

    /// Set a configuration string and replicate it to every connected
    /// client over the reliable channel.
    pub fn set_config_string(&mut self, index: usize, value: &str) -> Result<(), ProtocolError> {
        self.config_strings.set(index, value)?;

        let mut msg = MessageBuffer::default();
        msg.write_u8(ServerOp::ConfigString as i32);
        msg.write_i16(index as i32);
        msg.write_string(value);
        for slot in self.slots.iter_mut().flatten() {
            if slot.state != SlotState::Assigned {
                slot.reliable_queue.push_back(msg.as_slice().to_vec());
            }
        }
        Ok(())
    }

    /// Declare the console commands this server answers to.
    pub fn register_commands<R: CommandRegistry>(&self, registry: &mut R) {
        registry.register("map");
        registry.register("status");
    }

    /// Execute a console command line routed here by the registry.
    pub fn exec_command(&mut self, line: &str) {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("map") => match parts.next() {
                Some(map) => {
                    if let Err(err) = self.change_level(map) {
                        warn!("map change refused: {err}");
                    }
                }
                None => warn!("usage: map <path>"),
            },
            Some("status") => {
                info!(
                    frame = self.frame_number,
                    clients = self.client_count(),
                    entities = self.world.len(),
                    "status"
                );
            }
            Some(other) => warn!("unknown server command {other:?}"),
            None => {}
        }
    }

    /// Load a new level: reset the replicated world and tell every
    /// connected client, over the reliable channel, to redo the handshake
    /// against the fresh spawn state.
    pub fn change_level(&mut self, map: &str) -> Result<(), ProtocolError> {
        self.config_strings.set(CS_MAP, map)?;
        info!(map, "changing level");
        self.spawn_count += 1;
        self.world.clear();
        self.baselines.clear();

        let mut msg = MessageBuffer::default();
        msg.write_u8(ServerOp::Reconnect as i32);
        for slot in self.slots.iter_mut().flatten() {
            // Whatever was queued belongs to the old level.
            slot.reliable_queue.clear();
            slot.reliable_queue.push_back(msg.as_slice().to_vec());
            slot.state = SlotState::Assigned;
            slot.history.clear();
            slot.acked_frame = -1;
        }
        Ok(())
    }

    /// Populate a level entity before clients connect: the entity goes
    /// live and its state is recorded as the spawn baseline every client
    /// receives during the handshake.
    ///
    /// Baselines are frozen after load; both ends must hold identical
    /// baselines or deltas would merge over different bases. Entities that
    /// appear mid-game go through [`Server::spawn_entity`] and delta
    /// against the default state instead.
    pub fn load_entity(&mut self, state: EntityState) {
        self.baselines.set(state);
        self.world.spawn(state);
    }

    /// Bring an entity into the world mid-game. Its first appearance in
    /// each client's frame is a forced full update against whatever
    /// baseline that number holds (the load-time one, or the default).
    pub fn spawn_entity(&mut self, state: EntityState) {
        self.world.spawn(state);
    }

    /// Remove an entity from the world; clients get an explicit remove in
    /// their next frame.
    pub fn despawn_entity(&mut self, number: u16) {
        self.world.despawn(number);
    }

    /// Mutable access to a live entity for game logic.
    pub fn entity_mut(&mut self, number: u16) -> Option<&mut EntityState> {
        self.world.get_mut(number)
    }

    /// One cooperative server tick.
    pub fn tick(&mut self, now_ms: u64) {
        self.pump_socket(now_ms);
        self.frame_number += 1;
        self.broadcast(now_ms);
        self.sweep_timeouts(now_ms);
        self.world.clear_events();
        self.challenges
            .retain(|challenge| now_ms.saturating_sub(challenge.issued_ms) < 60_000);
    }

    // --- incoming ----------------------------------------------------------

    fn pump_socket(&mut self, now_ms: u64) {
        let mut buf = [0u8; 2048];
        loop {
            let (from, len) = match self.socket.poll_recv(&mut buf) {
                Ok(Some(datagram)) => datagram,
                Ok(None) => break,
                Err(err) => {
                    warn!("socket receive error: {err}");
                    break;
                }
            };
            let packet = buf[..len].to_vec();
            self.handle_packet(from, &packet, now_ms);
        }
    }

    fn handle_packet(&mut self, from: SocketAddr, packet: &[u8], now_ms: u64) {
        if let Some(text) = NetChannel::parse_oob(packet) {
            let text = text.to_string();
            self.handle_oob(from, &text, now_ms);
            return;
        }

        // Client channel packets carry a qport after the header words;
        // match on it plus the source IP so NAT source-port rebinds do not
        // orphan the slot.
        if packet.len() < 10 {
            debug!("runt datagram from {from}, dropped");
            return;
        }
        let qport = u16::from_le_bytes([packet[8], packet[9]]);
        let Some(index) = self.find_slot(from, qport) else {
            debug!("channel packet from unknown peer {from}, dropped");
            return;
        };

        let processed = {
            let Some(slot) = self.slots[index].as_mut() else {
                return;
            };
            slot.addr = from;
            match slot.channel.process(packet, now_ms) {
                Ok(Some(processed)) => processed,
                Ok(None) => return,
                Err(err) => {
                    debug!("malformed packet from {from} dropped: {err}");
                    return;
                }
            }
        };

        if let Some(reliable) = processed.reliable {
            if let Err(err) = self.parse_client_message(index, &reliable, now_ms) {
                self.drop_client(index, &format!("protocol error: {err}"), true, now_ms);
                return;
            }
        }
        if !processed.unreliable.is_empty() {
            if let Err(err) = self.parse_client_message(index, &processed.unreliable, now_ms) {
                self.drop_client(index, &format!("protocol error: {err}"), true, now_ms);
            }
        }
    }

    fn find_slot(&self, from: SocketAddr, qport: u16) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.as_ref().is_some_and(|slot| {
                slot.qport == qport && slot.addr.ip() == from.ip()
            })
        })
    }

    fn handle_oob(&mut self, from: SocketAddr, text: &str, now_ms: u64) {
        let mut parts = text.split_whitespace();
        match parts.next() {
            Some("getchallenge") => {
                let token = self.issue_challenge(from, now_ms);
                self.send_oob(from, &format!("challenge {token}"));
            }
            Some("connect") => {
                let protocol: Option<u16> = parts.next().and_then(|t| t.parse().ok());
                let qport: Option<u16> = parts.next().and_then(|t| t.parse().ok());
                let token: Option<i32> = parts.next().and_then(|t| t.parse().ok());
                let userinfo = text
                    .splitn(5, ' ')
                    .nth(4)
                    .unwrap_or("")
                    .trim_matches('"')
                    .to_string();
                let (Some(protocol), Some(qport), Some(token)) = (protocol, qport, token) else {
                    debug!("malformed connect from {from}, dropped");
                    return;
                };
                self.handle_connect(from, protocol, qport, token, userinfo, now_ms);
            }
            Some(other) => debug!("unhandled out-of-band command {other:?} from {from}"),
            None => {}
        }
    }

    fn issue_challenge(&mut self, from: SocketAddr, now_ms: u64) -> i32 {
        if let Some(existing) = self
            .challenges
            .iter()
            .find(|challenge| challenge.addr.ip() == from.ip())
        {
            return existing.token;
        }
        let token: i32 = rand::thread_rng().gen_range(0..i32::MAX);
        self.challenges.push(Challenge {
            addr: from,
            token,
            issued_ms: now_ms,
        });
        token
    }

    fn handle_connect(
        &mut self,
        from: SocketAddr,
        protocol: u16,
        qport: u16,
        token: i32,
        userinfo: String,
        now_ms: u64,
    ) {
        if protocol != PROTOCOL_VERSION {
            self.send_oob(from, "print wrong protocol version");
            return;
        }
        let challenge_ok = self
            .challenges
            .iter()
            .any(|challenge| challenge.addr.ip() == from.ip() && challenge.token == token);
        if !challenge_ok {
            self.send_oob(from, "print bad challenge");
            return;
        }

        // A reconnecting client reuses its slot rather than leaking one.
        if let Some(index) = self.find_slot(from, qport) {
            info!("client {from} reconnecting into slot {index}");
            self.slots[index] = None;
            self.despawn_entity(ClientSlot::avatar_number(index));
        }

        let Some(index) = self.slots.iter().position(|slot| slot.is_none()) else {
            self.send_oob(from, "print server is full");
            return;
        };

        self.slots[index] = Some(ClientSlot {
            addr: from,
            qport,
            state: SlotState::Assigned,
            channel: NetChannel::new(NetSide::Server, qport),
            created_ms: now_ms,
            reliable_queue: VecDeque::new(),
            history: SnapshotHistory::default(),
            acked_frame: -1,
            last_move_sequence: 0,
            player: PlayerState::default(),
            userinfo,
        });
        info!("client {from} assigned slot {index}");
        self.send_oob(from, "client_connect");
    }

    fn parse_client_message(
        &mut self,
        index: usize,
        data: &[u8],
        now_ms: u64,
    ) -> Result<(), ProtocolError> {
        let mut msg = MessageBuffer::from_bytes(data);
        while msg.remaining() > 0 {
            match ClientOp::try_from(msg.read_u8() as u8)? {
                ClientOp::Nop => {}
                ClientOp::Move => self.parse_move(index, &mut msg)?,
                ClientOp::UserInfo => {
                    let info = msg.read_string();
                    if let Some(slot) = self.slots[index].as_mut() {
                        slot.userinfo = info;
                    }
                }
                ClientOp::StringCmd => {
                    let command = msg.read_string();
                    self.execute_client_command(index, &command, now_ms);
                    if self.slots[index].is_none() {
                        // The command tore the slot down (disconnect).
                        return Ok(());
                    }
                }
            }
            if msg.overflowed() {
                return Err(ProtocolError::UnexpectedEnd);
            }
        }
        Ok(())
    }

    /// Decode a command batch and run authoritative movement.
    ///
    /// Each batch repeats the previous two commands, so when the sequence
    /// gap shows packets were lost the missed commands are recovered from
    /// the repeats instead of stalling the player.
    fn parse_move(&mut self, index: usize, msg: &mut MessageBuffer) -> Result<(), ProtocolError> {
        let acked_frame = msg.read_i32();
        let null_cmd = UserCmd::default();
        let oldest = read_delta_cmd(msg, &null_cmd);
        let prev = read_delta_cmd(msg, &oldest);
        let newest = read_delta_cmd(msg, &prev);
        if msg.overflowed() {
            return Err(ProtocolError::UnexpectedEnd);
        }

        let Some(slot) = self.slots[index].as_mut() else {
            return Ok(());
        };
        slot.acked_frame = acked_frame;
        if slot.state != SlotState::Spawned {
            return Ok(());
        }

        let sequence = slot.channel.incoming_sequence();
        let lost = sequence
            .saturating_sub(slot.last_move_sequence + 1)
            .min(2);
        slot.last_move_sequence = sequence;

        let mut run = |slot: &mut ClientSlot, cmd: &UserCmd| {
            slot.player.move_state = player_move(&slot.player.move_state, cmd);
        };
        if lost >= 2 {
            run(slot, &oldest);
        }
        if lost >= 1 {
            run(slot, &prev);
        }
        run(slot, &newest);

        // Mirror the avatar entity for everyone else's snapshots.
        let origin = slot.player.move_state.origin_units();
        let yaw = short_to_angle(newest.angles[YAW]);
        if let Some(avatar) = self.world.get_mut(ClientSlot::avatar_number(index)) {
            avatar.old_origin = avatar.origin;
            avatar.origin = origin;
            avatar.angles[YAW] = yaw;
        }
        Ok(())
    }

    fn execute_client_command(&mut self, index: usize, command: &str, now_ms: u64) {
        match command.trim() {
            "new" => self.queue_setup(index),
            "begin" => self.begin_client(index),
            "disconnect" => self.drop_client(index, "client disconnected", false, now_ms),
            other => {
                // Console passthrough; game-level commands are outside this
                // core.
                debug!(slot = index, command = other, "client command ignored");
            }
        }
    }

    /// Queue the connection setup stream: server data, configuration
    /// strings, spawn baselines, then the `begin` stuff. Each element is
    /// one reliable message; the flush in [`Server::broadcast`] feeds them
    /// through the single-flight channel in order.
    fn queue_setup(&mut self, index: usize) {
        let map_name = self.config_strings.get(CS_MAP).to_string();
        let Some(slot) = self.slots[index].as_mut() else {
            return;
        };
        info!(slot = index, "queueing spawn state");
        slot.reliable_queue.clear();

        let mut msg = MessageBuffer::default();
        msg.write_u8(ServerOp::ServerData as i32);
        msg.write_i32(i32::from(PROTOCOL_VERSION));
        msg.write_i32(self.spawn_count);
        msg.write_u8(index as i32);
        msg.write_string(&map_name);
        slot.reliable_queue.push_back(msg.as_slice().to_vec());

        let mut msg = MessageBuffer::default();
        for (cs_index, value) in self.config_strings.iter_set() {
            if msg.len() + value.len() + 8 > SETUP_BATCH_LEN {
                slot.reliable_queue.push_back(msg.as_slice().to_vec());
                msg = MessageBuffer::default();
            }
            msg.write_u8(ServerOp::ConfigString as i32);
            msg.write_i16(cs_index as i32);
            msg.write_string(value);
        }
        if !msg.is_empty() {
            slot.reliable_queue.push_back(msg.as_slice().to_vec());
        }

        let null_state = EntityState::default();
        let mut msg = MessageBuffer::default();
        for baseline in self.baselines.iter_set() {
            if msg.len() + 64 > SETUP_BATCH_LEN {
                slot.reliable_queue.push_back(msg.as_slice().to_vec());
                msg = MessageBuffer::default();
            }
            msg.write_u8(ServerOp::SpawnBaseline as i32);
            write_delta_entity(&mut msg, &null_state, baseline, true, true);
        }
        if !msg.is_empty() {
            slot.reliable_queue.push_back(msg.as_slice().to_vec());
        }

        let mut msg = MessageBuffer::default();
        msg.write_u8(ServerOp::StuffText as i32);
        msg.write_string("begin\n");
        slot.reliable_queue.push_back(msg.as_slice().to_vec());

        slot.state = SlotState::Primed;
    }

    /// Spawn the player avatar and move the slot into the frame broadcast.
    fn begin_client(&mut self, index: usize) {
        let avatar_number = ClientSlot::avatar_number(index);
        let Some(slot) = self.slots[index].as_mut() else {
            return;
        };
        if slot.state != SlotState::Primed {
            debug!(slot = index, "begin out of order, ignored");
            return;
        }
        slot.state = SlotState::Spawned;
        // Commands batched before the spawn do not replay into the fresh
        // player state.
        slot.last_move_sequence = slot.channel.incoming_sequence();
        slot.player = PlayerState {
            move_state: MoveState::spawn(),
            view_height: 22,
            fov: 90,
            ..PlayerState::default()
        };
        slot.acked_frame = -1;
        let name = userinfo_value(&slot.userinfo, "name")
            .unwrap_or("player")
            .to_string();
        info!(slot = index, name = %name, "client entered the game");

        let avatar = EntityState {
            number: avatar_number,
            model_index: 1,
            ..EntityState::default()
        };
        self.spawn_entity(avatar);
        self.broadcast_print(print_level::HIGH, &format!("{name} entered the game"));
    }

    /// Queue a console print on every slot past the handshake.
    fn broadcast_print(&mut self, level: u8, text: &str) {
        let mut msg = MessageBuffer::default();
        msg.write_u8(ServerOp::Print as i32);
        msg.write_u8(level as i32);
        msg.write_string(text);
        for slot in self.slots.iter_mut().flatten() {
            if slot.state != SlotState::Assigned {
                slot.reliable_queue.push_back(msg.as_slice().to_vec());
            }
        }
    }

    // --- outgoing ----------------------------------------------------------

    fn send_oob(&mut self, to: SocketAddr, text: &str) {
        let packet = NetChannel::frame_oob(text);
        if let Err(err) = self.socket.send(to, &packet) {
            warn!("failed to send out-of-band reply: {err}");
        }
    }

    /// Send one packet per client: queued reliable setup data plus, for
    /// spawned slots, the frame snapshot.
    fn broadcast(&mut self, now_ms: u64) {
        for index in 0..self.slots.len() {
            let Some(slot) = self.slots[index].as_mut() else {
                continue;
            };

            // Feed the next queued reliable message once the channel is
            // free; the single-flight window keeps them ordered.
            if !slot.channel.reliable_pending() {
                if let Some(next) = slot.reliable_queue.pop_front() {
                    if let Err(err) = slot.channel.push_reliable(&next) {
                        warn!(slot = index, "reliable queue overflow: {err}");
                        self.drop_client(index, "reliable channel overflow", true, now_ms);
                        continue;
                    }
                }
            }

            let payload = if slot.state == SlotState::Spawned {
                Self::build_frame(
                    self.frame_number,
                    &self.config,
                    slot,
                    &self.world,
                    &self.baselines,
                )
            } else {
                Vec::new()
            };

            let packet = slot.channel.transmit(&payload, now_ms);
            let addr = slot.addr;
            if let Err(err) = self.socket.send(addr, &packet) {
                warn!("failed to send to {addr}: {err}");
            }
        }
    }

    /// Encode one frame for one client, delta-compressed against the
    /// newest frame that client acknowledged while it is still in the
    /// history window; otherwise uncompressed from scratch.
    fn build_frame(
        frame_number: u32,
        config: &NetConfig,
        slot: &mut ClientSlot,
        world: &EntityArena,
        baselines: &BaselineTable,
    ) -> Vec<u8> {
        let mut frame = FrameSnapshot {
            number: frame_number,
            delta_base: None,
            valid: true,
            player: slot.player,
            entities: world.snapshot(),
        };

        let old_frame = if slot.acked_frame > 0
            && frame_number.saturating_sub(slot.acked_frame as u32) <= config.max_delta_age
        {
            slot.history.get(slot.acked_frame as u32).cloned()
        } else {
            None
        };
        frame.delta_base = old_frame.as_ref().map(|old| old.number);

        let mut msg = MessageBuffer::default();
        msg.write_u8(ServerOp::Frame as i32);
        msg.write_i32(frame.number as i32);
        msg.write_i32(frame.delta_base.map_or(-1, |base| base as i32));

        msg.write_u8(ServerOp::PlayerState as i32);
        let base_player = old_frame.as_ref().map(|old| old.player).unwrap_or_default();
        write_delta_player(&mut msg, &base_player, &frame.player);

        msg.write_u8(ServerOp::PacketEntities as i32);
        write_packet_entities(&mut msg, old_frame.as_ref(), &frame, baselines);

        if msg.overflowed() {
            // A frame that cannot fit the MTU falls back to nothing this
            // tick; the next ack will shrink the delta.
            warn!(frame = frame.number, "frame overflowed the MTU, skipped");
            return Vec::new();
        }

        slot.history.store(frame);
        msg.as_slice().to_vec()
    }

    // --- teardown ----------------------------------------------------------

    fn sweep_timeouts(&mut self, now_ms: u64) {
        for index in 0..self.slots.len() {
            let timed_out = match self.slots[index].as_ref() {
                Some(slot) => {
                    let last_seen = slot.channel.last_received_ms().max(slot.created_ms);
                    now_ms.saturating_sub(last_seen) > self.config.connection_timeout_ms
                }
                None => false,
            };
            if timed_out {
                self.drop_client(index, "connection timed out", true, now_ms);
            }
        }
    }

    /// Free a slot, its channel, history, and avatar. When `notify` is
    /// set a parting disconnect datagram goes out best-effort; it may be
    /// lost and is never retried.
    fn drop_client(&mut self, index: usize, reason: &str, notify: bool, now_ms: u64) {
        let Some(mut slot) = self.slots[index].take() else {
            return;
        };
        info!(slot = index, reason, "dropping client");

        if notify {
            let mut msg = MessageBuffer::default();
            msg.write_u8(ServerOp::Disconnect as i32);
            msg.write_string(reason);
            let packet = slot.channel.transmit(msg.as_slice(), now_ms);
            let _ = self.socket.send(slot.addr, &packet);
        }
        self.despawn_entity(ClientSlot::avatar_number(index));
    }
}
