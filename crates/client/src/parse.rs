//! Server-message dispatch.
//!
//! Every message is a stream of opcode-tagged records. The stream carries
//! no per-record framing, so decoding is strictly sequential and any
//! unknown opcode or short read is fatal for the connection: the caller
//! gets a [`ProtocolError`] and drops the channel rather than guess at a
//! resync point.

use arclight_core::{EntityState, PlayerState};
use arclight_net::delta::{read_delta_entity, read_delta_player, read_entity_header};
use arclight_net::protocol::ServerOp;
use arclight_net::snapshot::{read_packet_entities, FrameSnapshot};
use arclight_net::{ConfigStore, MessageBuffer, ProtocolError, PROTOCOL_VERSION};
use tracing::{debug, info, warn};

use crate::{Client, ClientEvent, ConnectionState};

impl<S: arclight_net::transport::Socket> Client<S> {
    /// Decode one reliable or unreliable message payload.
    pub(crate) fn parse_server_message(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        let mut msg = MessageBuffer::from_bytes(data);

        while msg.remaining() > 0 {
            let op = ServerOp::try_from(msg.read_u8() as u8)?;
            match op {
                ServerOp::Nop => {}

                ServerOp::Disconnect => {
                    let reason = msg.read_string();
                    let reason = if reason.is_empty() {
                        "server disconnected".to_string()
                    } else {
                        reason
                    };
                    self.drop_connection(&reason);
                    return Ok(());
                }

                ServerOp::Reconnect => {
                    self.begin_reconnect(0);
                    return Ok(());
                }

                ServerOp::Print => {
                    let level = msg.read_u8().max(0) as u8;
                    let text = msg.read_string();
                    self.push_event(ClientEvent::Print { level, text });
                }

                ServerOp::StuffText => {
                    let text = msg.read_string();
                    for line in text.lines().filter(|l| !l.is_empty()) {
                        self.execute_stuffed(line);
                    }
                }

                ServerOp::ServerData => self.parse_server_data(&mut msg)?,

                ServerOp::ConfigString => {
                    let index = msg.read_i16();
                    if index < 0 {
                        return Err(ProtocolError::UnexpectedEnd);
                    }
                    let value = msg.read_string();
                    self.config_strings.set(index as usize, &value)?;
                }

                ServerOp::SpawnBaseline => {
                    let (number, bits) = read_entity_header(&mut msg)?;
                    if number == 0 || number as usize >= arclight_core::MAX_ENTITIES {
                        return Err(ProtocolError::BadEntityNumber(number));
                    }
                    let null_state = EntityState::default();
                    let state = read_delta_entity(&mut msg, &null_state, number, bits)?;
                    self.entities.get_mut(number).baseline = state;
                }

                ServerOp::Frame => self.parse_frame(&mut msg)?,

                ServerOp::PlayerState | ServerOp::PacketEntities => {
                    return Err(ProtocolError::OutOfPlaceFrameData);
                }
            }

            if msg.overflowed() {
                return Err(ProtocolError::UnexpectedEnd);
            }
        }
        Ok(())
    }

    /// Commands the server pushed into our console. Handshake sequencing
    /// commands are consumed here; anything else is surfaced to the host.
    fn execute_stuffed(&mut self, line: &str) {
        match line.trim() {
            "begin" => {
                if self.state == ConnectionState::Connecting {
                    // Everything needed to spawn is in hand; tell the
                    // server to start sending live frames.
                    let mut msg = MessageBuffer::default();
                    msg.write_u8(arclight_net::protocol::ClientOp::StringCmd as i32);
                    msg.write_string("begin");
                    if let Some(channel) = self.channel.as_mut() {
                        if let Err(err) = channel.push_reliable(msg.as_slice()) {
                            warn!("could not queue begin: {err}");
                            return;
                        }
                    }
                    self.state = ConnectionState::Primed;
                    info!("primed, waiting for the first frame");
                }
            }
            "reconnect" => self.begin_reconnect(0),
            other => self.push_event(ClientEvent::Command(other.to_string())),
        }
    }

    fn parse_server_data(&mut self, msg: &mut MessageBuffer) -> Result<(), ProtocolError> {
        let protocol = msg.read_i32();
        if protocol != i32::from(PROTOCOL_VERSION) {
            return Err(ProtocolError::BadProtocolVersion(protocol as u16));
        }
        self.spawn_count = msg.read_i32();
        self.player_slot = msg.read_u8().max(0) as u8;
        self.map_name = msg.read_string();
        if msg.overflowed() {
            return Err(ProtocolError::UnexpectedEnd);
        }

        // Fresh spawn state incoming: forget the previous level.
        self.config_strings.clear();
        self.entities.clear();
        self.frames.clear();
        self.latest_frame = 0;
        info!(map = %self.map_name, slot = self.player_slot, "received server data");
        Ok(())
    }

    /// Decode a frame envelope: header, player-state delta, packet
    /// entities.
    fn parse_frame(&mut self, msg: &mut MessageBuffer) -> Result<(), ProtocolError> {
        let number = msg.read_i32();
        let delta = msg.read_i32();
        if msg.overflowed() || number <= 0 {
            return Err(ProtocolError::UnexpectedEnd);
        }

        let mut frame = FrameSnapshot {
            number: number as u32,
            delta_base: (delta > 0).then_some(delta as u32),
            valid: true,
            player: PlayerState::default(),
            entities: Vec::new(),
        };

        // Locate the delta base. A missing or invalid base is the
        // recoverable-desync case: the frame still has to be decoded to
        // keep the stream in sync, but it is never rendered or
        // acknowledged, which makes the server fall back to an
        // uncompressed frame.
        let old_frame = match frame.delta_base {
            None => None,
            Some(base) => match self.frames.get(base) {
                Some(old) if old.valid => Some(old.clone()),
                _ => {
                    warn!(base, "delta base missing from history, frame unusable");
                    frame.valid = false;
                    None
                }
            },
        };

        match ServerOp::try_from(msg.read_u8() as u8)? {
            ServerOp::PlayerState => {}
            _ => return Err(ProtocolError::OutOfPlaceFrameData),
        }
        let base_player = old_frame
            .as_ref()
            .map(|f| f.player)
            .unwrap_or_default();
        frame.player = read_delta_player(msg, &base_player)?;

        match ServerOp::try_from(msg.read_u8() as u8)? {
            ServerOp::PacketEntities => {}
            _ => return Err(ProtocolError::OutOfPlaceFrameData),
        }
        read_packet_entities(msg, old_frame.as_ref(), &mut self.entities, &mut frame)?;

        if frame.valid {
            self.latest_frame = frame.number;

            if self.state == ConnectionState::Primed {
                self.state = ConnectionState::Active;
                self.predictor.reset(frame.player.move_state);
                self.push_event(ClientEvent::Connected);
                info!(frame = frame.number, "entering active state");
            } else if self.state == ConnectionState::Active {
                // The ack on this packet names the newest command the
                // server had run when it built this frame.
                let acked = self
                    .channel
                    .as_ref()
                    .map_or(0, |channel| channel.incoming_acknowledged());
                let outcome = self.predictor.reconcile(
                    acked,
                    &frame.player.move_state,
                    self.config.prediction_epsilon,
                );
                debug!(?outcome, frame = frame.number, "reconciled");
            }
        }

        self.frames.store(frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Client;
    use arclight_net::delta::{write_delta_entity, write_delta_player};
    use arclight_net::protocol::{ClientOp, CS_MAP};
    use arclight_net::snapshot::{write_packet_entities, BaselineTable};
    use arclight_net::transport::{MemoryNetwork, MemorySocket, Socket};
    use arclight_net::NetConfig;
    use std::net::SocketAddr;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    /// A client plus a hand-driven fake server on a memory network.
    struct Harness {
        client: Client<MemorySocket>,
        server_socket: MemorySocket,
        server_channel: arclight_net::NetChannel,
        client_addr: SocketAddr,
    }

    impl Harness {
        fn new() -> Self {
            let network = MemoryNetwork::new();
            Self {
                client: Client::new(network.socket(addr(2000)), NetConfig::default(), "\\n\\t"),
                server_socket: network.socket(addr(3000)),
                server_channel: arclight_net::NetChannel::new(
                    arclight_net::NetSide::Server,
                    0,
                ),
                client_addr: addr(2000),
            }
        }

        /// Run the OOB handshake up to an established channel.
        fn establish(&mut self) {
            self.client.connect(addr(3000), 0);
            self.pump_server(); // getchallenge
            self.server_socket
                .send(self.client_addr, &arclight_net::NetChannel::frame_oob("challenge 7"))
                .unwrap();
            self.client.tick(1, None);
            self.pump_server(); // connect request
            self.server_socket
                .send(
                    self.client_addr,
                    &arclight_net::NetChannel::frame_oob("client_connect"),
                )
                .unwrap();
            self.client.tick(2, None);
            self.pump_server(); // move packet carrying reliable "new"
        }

        /// Drain client-to-server datagrams, feeding channel packets
        /// through the server-side channel.
        fn pump_server(&mut self) {
            let mut buf = [0u8; 2048];
            while let Some((_, len)) = self.server_socket.poll_recv(&mut buf).unwrap() {
                if arclight_net::NetChannel::parse_oob(&buf[..len]).is_some() {
                    continue;
                }
                let _ = self.server_channel.process(&buf[..len], 0);
            }
        }

        /// Send `payload` to the client as channel traffic.
        fn send_unreliable(&mut self, payload: &[u8], now: u64) {
            let packet = self.server_channel.transmit(payload, now);
            self.server_socket.send(self.client_addr, &packet).unwrap();
            self.client.tick(now, None);
            self.pump_server();
        }

        /// Send `payload` reliably to the client.
        fn send_reliable(&mut self, payload: &[u8], now: u64) {
            self.server_channel.push_reliable(payload).unwrap();
            self.send_unreliable(&[], now);
        }
    }

    fn setup_message() -> MessageBuffer {
        let mut msg = MessageBuffer::default();
        msg.write_u8(ServerOp::ServerData as i32);
        msg.write_i32(i32::from(PROTOCOL_VERSION));
        msg.write_i32(1); // spawn count
        msg.write_u8(0); // player slot
        msg.write_string("maps/demo1");

        msg.write_u8(ServerOp::ConfigString as i32);
        msg.write_i16(CS_MAP as i32);
        msg.write_string("maps/demo1");

        // One baseline entity: number 1 at the origin.
        msg.write_u8(ServerOp::SpawnBaseline as i32);
        let baseline = EntityState {
            number: 1,
            ..EntityState::default()
        };
        write_delta_entity(&mut msg, &EntityState::default(), &baseline, true, true);

        msg.write_u8(ServerOp::StuffText as i32);
        msg.write_string("begin\n");
        msg
    }

    fn frame_message(number: u32, delta: Option<u32>, entities: &[EntityState]) -> MessageBuffer {
        let mut msg = MessageBuffer::default();
        msg.write_u8(ServerOp::Frame as i32);
        msg.write_i32(number as i32);
        msg.write_i32(delta.map_or(-1, |d| d as i32));

        msg.write_u8(ServerOp::PlayerState as i32);
        write_delta_player(&mut msg, &PlayerState::default(), &PlayerState::default());

        msg.write_u8(ServerOp::PacketEntities as i32);
        let baselines = BaselineTable::default();
        let to = FrameSnapshot {
            number,
            delta_base: delta,
            valid: true,
            player: PlayerState::default(),
            entities: entities.to_vec(),
        };
        // Tests always delta against nothing for simplicity.
        write_packet_entities(&mut msg, None, &to, &baselines);
        msg
    }

    #[test]
    fn connect_sequence_reaches_primed_then_active() {
        let mut harness = Harness::new();
        harness.establish();
        assert_eq!(harness.client.state(), ConnectionState::Connecting);

        harness.send_reliable(setup_message().as_slice(), 10);
        assert_eq!(harness.client.state(), ConnectionState::Primed);
        assert_eq!(harness.client.map_name(), "maps/demo1");
        assert_eq!(harness.client.config_strings().get(CS_MAP), "maps/demo1");
        assert_eq!(harness.client.entities().get(1).baseline.number, 1);

        let frame = frame_message(1, None, &[EntityState { number: 1, ..Default::default() }]);
        harness.send_unreliable(frame.as_slice(), 20);
        assert_eq!(harness.client.state(), ConnectionState::Active);
        assert_eq!(harness.client.latest_frame(), 1);

        let events = harness.client.take_events();
        assert!(events.contains(&ClientEvent::Connected));
    }

    #[test]
    fn unknown_opcode_is_fatal() {
        let mut harness = Harness::new();
        harness.establish();

        harness.send_unreliable(&[200], 10);
        assert_eq!(harness.client.state(), ConnectionState::Disconnected);
        let events = harness.client.take_events();
        assert!(events.iter().any(|e| matches!(
            e,
            ClientEvent::Disconnected { reason } if reason.contains("opcode")
        )));
    }

    #[test]
    fn wrong_protocol_version_is_fatal() {
        let mut harness = Harness::new();
        harness.establish();

        let mut msg = MessageBuffer::default();
        msg.write_u8(ServerOp::ServerData as i32);
        msg.write_i32(i32::from(PROTOCOL_VERSION) + 1);
        msg.write_i32(1);
        msg.write_u8(0);
        msg.write_string("maps/demo1");
        harness.send_reliable(msg.as_slice(), 10);
        assert_eq!(harness.client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn out_of_place_frame_data_is_fatal() {
        let mut harness = Harness::new();
        harness.establish();

        let mut msg = MessageBuffer::default();
        msg.write_u8(ServerOp::PacketEntities as i32);
        harness.send_unreliable(msg.as_slice(), 10);
        assert_eq!(harness.client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn print_and_stufftext_surface_as_events() {
        let mut harness = Harness::new();
        harness.establish();

        let mut msg = MessageBuffer::default();
        msg.write_u8(ServerOp::Print as i32);
        msg.write_u8(2);
        msg.write_string("hello there");
        msg.write_u8(ServerOp::StuffText as i32);
        msg.write_string("volume 0.5\n");
        harness.send_unreliable(msg.as_slice(), 10);

        let events = harness.client.take_events();
        assert!(events.contains(&ClientEvent::Print {
            level: 2,
            text: "hello there".to_string()
        }));
        assert!(events.contains(&ClientEvent::Command("volume 0.5".to_string())));
    }

    #[test]
    fn server_disconnect_tears_down_once() {
        let mut harness = Harness::new();
        harness.establish();

        let mut msg = MessageBuffer::default();
        msg.write_u8(ServerOp::Disconnect as i32);
        msg.write_string("server is shutting down");
        harness.send_unreliable(msg.as_slice(), 10);

        assert_eq!(harness.client.state(), ConnectionState::Disconnected);
        let events = harness.client.take_events();
        let reasons: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ClientEvent::Disconnected { reason } => Some(reason.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(reasons, vec!["server is shutting down"]);
    }

    #[test]
    fn frame_with_missing_delta_base_is_not_acknowledged() {
        let mut harness = Harness::new();
        harness.establish();
        harness.send_reliable(setup_message().as_slice(), 10);
        let frame1 = frame_message(1, None, &[]);
        harness.send_unreliable(frame1.as_slice(), 20);
        assert_eq!(harness.client.latest_frame(), 1);

        // A frame deltaed against a base the client never saw decodes but
        // stays invalid: latest_frame must not advance.
        let stale = frame_message(40, Some(39), &[]);
        harness.send_unreliable(stale.as_slice(), 30);
        assert_eq!(harness.client.state(), ConnectionState::Active);
        assert_eq!(harness.client.latest_frame(), 1);
    }

    #[test]
    fn nop_and_config_updates_flow_in_active_state() {
        let mut harness = Harness::new();
        harness.establish();
        harness.send_reliable(setup_message().as_slice(), 10);
        harness.send_unreliable(frame_message(1, None, &[]).as_slice(), 20);

        let mut msg = MessageBuffer::default();
        msg.write_u8(ServerOp::Nop as i32);
        msg.write_u8(ServerOp::ConfigString as i32);
        msg.write_i16(CS_MAP as i32);
        msg.write_string("maps/demo2");
        harness.send_unreliable(msg.as_slice(), 30);

        assert_eq!(harness.client.config_strings().get(CS_MAP), "maps/demo2");
        assert_eq!(harness.client.state(), ConnectionState::Active);
    }

    #[test]
    fn console_commands_forward_to_the_server() {
        let mut harness = Harness::new();
        harness.establish();
        // Ack the reliable "new" so the forwarded command can go out.
        harness.send_unreliable(&[], 3);

        harness.client.exec_command("say hello", 5);
        harness.client.tick(6, None);

        let mut buf = [0u8; 2048];
        let mut forwarded = None;
        while let Some((_, len)) = harness.server_socket.poll_recv(&mut buf).unwrap() {
            if let Ok(Some(p)) = harness.server_channel.process(&buf[..len], 6) {
                if let Some(reliable) = p.reliable {
                    forwarded = Some(reliable);
                }
            }
        }
        let payload = forwarded.expect("forwarded command seen");
        let mut msg = MessageBuffer::from_bytes(&payload);
        assert_eq!(
            ClientOp::try_from(msg.read_u8() as u8).unwrap(),
            ClientOp::StringCmd
        );
        assert_eq!(msg.read_string(), "say hello");
    }

    #[test]
    fn move_packets_ack_the_latest_frame() {
        let mut harness = Harness::new();
        harness.establish();
        harness.send_reliable(setup_message().as_slice(), 10);
        harness.send_unreliable(frame_message(3, None, &[]).as_slice(), 20);

        // Client sends a move on its next tick; decode it server-side.
        harness.client.tick(30, Some(arclight_core::UserCmd {
            msec: 16,
            forward_move: 100,
            ..Default::default()
        }));

        let mut buf = [0u8; 2048];
        let mut last_move = None;
        while let Some((_, len)) = harness.server_socket.poll_recv(&mut buf).unwrap() {
            if let Ok(Some(p)) = harness.server_channel.process(&buf[..len], 30) {
                if !p.unreliable.is_empty() {
                    last_move = Some(p.unreliable.clone());
                }
            }
        }
        let payload = last_move.expect("move packet seen");
        let mut msg = MessageBuffer::from_bytes(&payload);
        assert_eq!(ClientOp::try_from(msg.read_u8() as u8).unwrap(), ClientOp::Move);
        assert_eq!(msg.read_i32(), 3); // acked frame number
    }
}
