#![warn(missing_docs)]
//! Client-side protocol state machine and prediction loop.
//!
//! [`Client`] owns one connection's worth of state: the handshake state
//! machine, the sequenced channel, the replicated configuration strings,
//! entity tracking, the frame history ring, and the movement predictor.
//! Everything runs inside [`Client::tick`], called once per render frame on
//! one thread; the socket is polled, never waited on.
//!
//! The renderer, console, input sampling, and audio are external: input
//! arrives as a ready-made [`UserCmd`], and everything the upper layers
//! need to react to is drained from [`Client::take_events`].

mod parse;

use std::net::SocketAddr;

use arclight_core::UserCmd;
use arclight_net::channel::{NetChannel, NetSide};
use arclight_net::prediction::{PredictionMetrics, Predictor};
use arclight_net::protocol::{ClientOp, CommandRegistry, ConfigStringTable, PROTOCOL_VERSION};
use arclight_net::snapshot::{EntityTable, SnapshotHistory};
use arclight_net::transport::Socket;
use arclight_net::{MessageBuffer, NetConfig, ProtocolError};
use rand::Rng;
use tracing::{debug, info, warn};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Not talking to any server.
    Disconnected,
    /// Asking the server for a challenge token.
    Challenging,
    /// Challenge in hand; negotiating the channel and initial state.
    Connecting,
    /// Baselines and configuration strings held; waiting for a live frame.
    Primed,
    /// Steady-state frame exchange.
    Active,
}

/// Notifications for the layers above the protocol core (session UI,
/// console, renderer). Drained via [`Client::take_events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// First live frame arrived; the world is renderable.
    Connected,
    /// Connection ended; emitted exactly once per connection.
    Disconnected {
        /// Human-readable reason, also logged.
        reason: String,
    },
    /// Console text from the server.
    Print {
        /// One of [`arclight_net::protocol::print_level`].
        level: u8,
        /// The text.
        text: String,
    },
    /// Server-pushed console command the protocol core did not consume.
    Command(String),
}

/// One client connection.
pub struct Client<S: Socket> {
    socket: S,
    config: NetConfig,
    userinfo: String,
    qport: u16,

    state: ConnectionState,
    server_addr: Option<SocketAddr>,
    challenge: Option<i32>,
    channel: Option<NetChannel>,
    last_handshake_ms: u64,
    last_server_packet_ms: u64,

    config_strings: ConfigStringTable,
    entities: EntityTable,
    frames: SnapshotHistory,
    /// Newest valid frame number, 0 before the first one.
    latest_frame: u32,
    spawn_count: i32,
    player_slot: u8,
    map_name: String,

    predictor: Predictor,
    events: Vec<ClientEvent>,
}

impl<S: Socket> Client<S> {
    /// Create a disconnected client. The qport is randomized once per
    /// process so servers can keep tracking this client across NAT source
    /// port rebinds.
    pub fn new(socket: S, config: NetConfig, userinfo: &str) -> Self {
        Self {
            socket,
            config,
            userinfo: userinfo.to_string(),
            qport: rand::thread_rng().gen(),
            state: ConnectionState::Disconnected,
            server_addr: None,
            challenge: None,
            channel: None,
            last_handshake_ms: 0,
            last_server_packet_ms: 0,
            config_strings: ConfigStringTable::default(),
            entities: EntityTable::default(),
            frames: SnapshotHistory::default(),
            latest_frame: 0,
            spawn_count: 0,
            player_slot: 0,
            map_name: String::new(),
            predictor: Predictor::new(),
            events: Vec::new(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Replicated configuration strings.
    pub fn config_strings(&self) -> &ConfigStringTable {
        &self.config_strings
    }

    /// Per-entity tracking table.
    pub fn entities(&self) -> &EntityTable {
        &self.entities
    }

    /// Newest valid frame number, 0 before any frame.
    pub fn latest_frame(&self) -> u32 {
        self.latest_frame
    }

    /// Frame history ring.
    pub fn frames(&self) -> &SnapshotHistory {
        &self.frames
    }

    /// Slot index the server assigned us.
    pub fn player_slot(&self) -> u8 {
        self.player_slot
    }

    /// Map path from the handshake.
    pub fn map_name(&self) -> &str {
        &self.map_name
    }

    /// Spawn counter from the handshake; the server bumps it per level
    /// load, which is how a stale client notices it must resynchronize.
    pub fn spawn_count(&self) -> i32 {
        self.spawn_count
    }

    /// Replace the userinfo string, pushing the refresh to the server when
    /// a connection is up.
    pub fn set_userinfo(&mut self, userinfo: &str) {
        self.userinfo = userinfo.to_string();
        if let Some(channel) = self.channel.as_mut() {
            let mut msg = MessageBuffer::default();
            msg.write_u8(ClientOp::UserInfo as i32);
            msg.write_string(userinfo);
            if let Err(err) = channel.push_reliable(msg.as_slice()) {
                warn!("could not queue userinfo update: {err}");
            }
        }
    }

    /// Predicted local movement state.
    pub fn predicted(&self) -> &arclight_core::MoveState {
        self.predictor.predicted()
    }

    /// Prediction accuracy counters.
    pub fn prediction_metrics(&self) -> &PredictionMetrics {
        self.predictor.metrics()
    }

    /// Take all pending notifications.
    pub fn take_events(&mut self) -> Vec<ClientEvent> {
        std::mem::take(&mut self.events)
    }

    /// Declare the console commands this client answers to.
    pub fn register_commands<R: CommandRegistry>(&self, registry: &mut R) {
        registry.register("connect");
        registry.register("disconnect");
    }

    /// Execute a console command line routed here by the registry. Lines
    /// that are not client commands are forwarded to the server verbatim
    /// while a connection is up.
    pub fn exec_command(&mut self, line: &str, now_ms: u64) {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("connect") => match parts.next().and_then(|a| a.parse().ok()) {
                Some(addr) => self.connect(addr, now_ms),
                None => warn!("usage: connect <address:port>"),
            },
            Some("disconnect") => self.disconnect("client disconnected", now_ms),
            Some(_) if self.channel.is_some() => self.send_command(line),
            Some(other) => warn!("unknown client command {other:?}"),
            None => {}
        }
    }

    /// Forward a console command line to the server for execution there.
    pub fn send_command(&mut self, command: &str) {
        let Some(channel) = self.channel.as_mut() else {
            warn!("not connected, command {command:?} dropped");
            return;
        };
        let mut msg = MessageBuffer::default();
        msg.write_u8(ClientOp::StringCmd as i32);
        msg.write_string(command);
        if let Err(err) = channel.push_reliable(msg.as_slice()) {
            warn!("could not queue command: {err}");
        }
    }

    /// Begin connecting to `addr`.
    pub fn connect(&mut self, addr: SocketAddr, now_ms: u64) {
        if self.state != ConnectionState::Disconnected {
            self.disconnect("connecting elsewhere", now_ms);
        }
        info!("connecting to {addr}");
        self.server_addr = Some(addr);
        self.state = ConnectionState::Challenging;
        self.challenge = None;
        self.last_server_packet_ms = now_ms;
        self.send_challenge_request(now_ms);
    }

    /// Tear the connection down, telling the server on a best-effort basis.
    pub fn disconnect(&mut self, reason: &str, now_ms: u64) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        // Parting shot; the datagram may be lost and is never retried.
        if let (Some(addr), Some(channel)) = (self.server_addr, self.channel.as_mut()) {
            let mut msg = MessageBuffer::default();
            msg.write_u8(ClientOp::StringCmd as i32);
            msg.write_string("disconnect");
            let packet = channel.transmit(msg.as_slice(), now_ms);
            let _ = self.socket.send(addr, &packet);
        }
        self.drop_connection(reason);
    }

    /// One cooperative tick: pump the socket, drive the handshake, send
    /// input, and enforce the timeout. `input` is this tick's sampled
    /// command, if the caller has one.
    pub fn tick(&mut self, now_ms: u64, input: Option<UserCmd>) {
        self.pump_socket(now_ms);

        match self.state {
            ConnectionState::Disconnected => return,
            ConnectionState::Challenging => {
                if now_ms - self.last_handshake_ms >= self.config.handshake_retry_ms {
                    self.send_challenge_request(now_ms);
                }
            }
            ConnectionState::Connecting => {
                if self.channel.is_none()
                    && now_ms - self.last_handshake_ms >= self.config.handshake_retry_ms
                {
                    self.send_connect_request(now_ms);
                }
            }
            ConnectionState::Primed | ConnectionState::Active => {}
        }

        if self.channel.is_some() {
            self.send_move(now_ms, input);
        }

        if self.state != ConnectionState::Disconnected
            && now_ms.saturating_sub(self.last_server_packet_ms) > self.config.connection_timeout_ms
        {
            warn!("server timed out");
            self.drop_connection("connection timed out");
        }
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
            if Some(from) != self.server_addr {
                debug!("datagram from unexpected address {from}, dropped");
                continue;
            }
            let packet = buf[..len].to_vec();
            self.handle_packet(&packet, now_ms);
        }
    }

    fn handle_packet(&mut self, packet: &[u8], now_ms: u64) {
        if let Some(text) = NetChannel::parse_oob(packet) {
            let text = text.to_string();
            self.handle_oob(&text, now_ms);
            return;
        }

        let Some(channel) = self.channel.as_mut() else {
            debug!("channel packet before handshake finished, dropped");
            return;
        };
        let processed = match channel.process(packet, now_ms) {
            Ok(Some(processed)) => processed,
            Ok(None) => return,
            Err(err) => {
                debug!("malformed packet dropped: {err}");
                return;
            }
        };
        self.last_server_packet_ms = now_ms;

        if let Some(reliable) = processed.reliable {
            if let Err(err) = self.parse_server_message(&reliable) {
                self.protocol_failure(err);
                return;
            }
        }
        if !processed.unreliable.is_empty() {
            if let Err(err) = self.parse_server_message(&processed.unreliable) {
                self.protocol_failure(err);
            }
        }
    }

    fn handle_oob(&mut self, text: &str, now_ms: u64) {
        self.last_server_packet_ms = now_ms;
        let mut parts = text.split_whitespace();
        match parts.next() {
            Some("challenge") if self.state == ConnectionState::Challenging => {
                let Some(token) = parts.next().and_then(|t| t.parse().ok()) else {
                    debug!("malformed challenge reply dropped");
                    return;
                };
                self.challenge = Some(token);
                self.state = ConnectionState::Connecting;
                self.send_connect_request(now_ms);
            }
            Some("client_connect")
                if self.state == ConnectionState::Connecting && self.channel.is_none() =>
            {
                info!("channel established, requesting spawn state");
                let mut channel = NetChannel::new(NetSide::Client, self.qport);
                let mut msg = MessageBuffer::default();
                msg.write_u8(ClientOp::StringCmd as i32);
                msg.write_string("new");
                if let Err(err) = channel.push_reliable(msg.as_slice()) {
                    self.drop_connection(&format!("handshake failed: {err}"));
                    return;
                }
                self.channel = Some(channel);
                // Carry the spawn request out immediately; the per-tick
                // send loop keeps retrying it until acknowledged.
                self.send_move(now_ms, None);
            }
            Some("print") => {
                let rest = text.splitn(2, ' ').nth(1).unwrap_or("").to_string();
                self.events.push(ClientEvent::Print {
                    level: arclight_net::protocol::print_level::HIGH,
                    text: rest,
                });
            }
            Some(other) => debug!("unhandled out-of-band command {other:?}"),
            None => {}
        }
    }

    // --- outgoing ----------------------------------------------------------

    fn send_oob(&mut self, text: &str) {
        if let Some(addr) = self.server_addr {
            let packet = NetChannel::frame_oob(text);
            if let Err(err) = self.socket.send(addr, &packet) {
                warn!("failed to send handshake datagram: {err}");
            }
        }
    }

    fn send_challenge_request(&mut self, now_ms: u64) {
        self.last_handshake_ms = now_ms;
        self.send_oob("getchallenge");
    }

    fn send_connect_request(&mut self, now_ms: u64) {
        self.last_handshake_ms = now_ms;
        let Some(challenge) = self.challenge else {
            return;
        };
        let request = format!(
            "connect {PROTOCOL_VERSION} {} {challenge} \"{}\"",
            self.qport, self.userinfo
        );
        self.send_oob(&request);
    }

    /// Sample, record, predict, and transmit this tick's command batch.
    ///
    /// Each move packet carries the last three commands delta-compressed in
    /// sequence, so a single lost packet costs no input. Command numbers
    /// are the channel's outgoing sequence numbers, which makes the
    /// channel's ack stream double as command acknowledgment.
    fn send_move(&mut self, now_ms: u64, input: Option<UserCmd>) {
        let Some(addr) = self.server_addr else { return };
        let Some(channel) = self.channel.as_mut() else {
            return;
        };

        let cmd = input.unwrap_or_default();
        let cmd_number = channel.next_sequence();
        self.predictor.record_cmd(cmd_number, cmd);

        let mut msg = MessageBuffer::default();
        msg.write_u8(ClientOp::Move as i32);
        let ack_frame = if self.latest_frame == 0 {
            -1
        } else {
            self.latest_frame as i32
        };
        msg.write_i32(ack_frame);

        let oldest = *self.predictor.cmd(cmd_number.wrapping_sub(2));
        let prev = *self.predictor.cmd(cmd_number.wrapping_sub(1));
        arclight_net::delta::write_delta_cmd(&mut msg, &UserCmd::default(), &oldest);
        arclight_net::delta::write_delta_cmd(&mut msg, &oldest, &prev);
        arclight_net::delta::write_delta_cmd(&mut msg, &prev, &cmd);

        let packet = channel.transmit(msg.as_slice(), now_ms);
        if let Err(err) = self.socket.send(addr, &packet) {
            warn!("failed to send move packet: {err}");
        }
    }

    // --- teardown ----------------------------------------------------------

    fn protocol_failure(&mut self, err: ProtocolError) {
        warn!("fatal protocol error: {err}");
        self.drop_connection(&format!("protocol error: {err}"));
    }

    /// Release everything owned by the connection and notify the upper
    /// layers exactly once.
    fn drop_connection(&mut self, reason: &str) {
        info!("disconnected: {reason}");
        self.state = ConnectionState::Disconnected;
        self.server_addr = None;
        self.challenge = None;
        self.channel = None;
        self.config_strings.clear();
        self.entities.clear();
        self.frames.clear();
        self.latest_frame = 0;
        self.map_name.clear();
        self.predictor.reset(arclight_core::MoveState::default());
        self.events.push(ClientEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    /// Restart the handshake against the same server (server-initiated
    /// reconnect, typically across a level change).
    pub(crate) fn begin_reconnect(&mut self, now_ms: u64) {
        info!("server requested reconnect");
        let addr = self.server_addr;
        self.channel = None;
        self.challenge = None;
        self.entities.clear();
        self.frames.clear();
        self.latest_frame = 0;
        self.state = ConnectionState::Challenging;
        self.server_addr = addr;
        self.send_challenge_request(now_ms.max(self.last_handshake_ms));
    }

    pub(crate) fn push_event(&mut self, event: ClientEvent) {
        self.events.push(event);
    }
}
