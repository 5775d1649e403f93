//! Sequenced datagram channel with single-flight reliable delivery.
//!
//! Every connection owns one [`NetChannel`] per direction pair. Each
//! outgoing datagram carries a 30-bit sequence number, the highest incoming
//! sequence as a piggy-backed ack, and at most one reliable payload. Only
//! one reliable payload may be unacknowledged at a time, which makes the
//! reliable path a one-element sliding window: trivially ordered, trivially
//! bounded.
//!
//! Header layout, little-endian words:
//!
//! ```text
//! [u32 sequence | bit31 = reliable payload present | bit30 = reliable toggle]
//! [u32 ack      | bit31 = toggle of last reliable the sender processed]
//! [u16 qport]                        (client-to-server packets only)
//! [u16 reliable length][reliable bytes]   (when bit31 of sequence is set)
//! [unreliable bytes]
//! ```
//!
//! The toggle bit alternates per fresh reliable payload; a retransmission
//! carries the same toggle, which is how the receiver discards replays of a
//! fragment it already processed while still acknowledging them.
//!
//! Lost, duplicated, and reordered datagrams are expected traffic: they are
//! counted, logged at debug level, and dropped. Nothing here retries
//! unreliable data; the next frame supersedes it.

use tracing::debug;

use crate::error::ChannelError;
use crate::msg::MAX_MESSAGE_LEN;

/// Mask for the 30 usable sequence bits.
const SEQUENCE_MASK: u32 = 0x3fff_ffff;
/// Header flag: packet carries the reliable payload.
const FLAG_RELIABLE: u32 = 1 << 31;
/// Header flag: reliable alternation toggle.
const FLAG_TOGGLE: u32 = 1 << 30;

/// Out-of-band marker: four `0xff` bytes where a sequence number would be.
const OOB_MARKER: [u8; 4] = [0xff; 4];

/// Bytes reserved for header + reliable length prefix.
const CHANNEL_OVERHEAD: usize = 4 + 4 + 2 + 2;

/// Capacity of the reliable staging buffer.
pub const MAX_RELIABLE_LEN: usize = MAX_MESSAGE_LEN - CHANNEL_OVERHEAD;

/// Which end of the connection this channel serves; clients stamp a qport
/// into every packet so address-translating routers that rebind the source
/// port cannot orphan the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetSide {
    /// Channel on the client, talking to a server.
    Client,
    /// Channel on the server, talking to one client.
    Server,
}

/// Transient-loss accounting; all of these are expected conditions.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelStats {
    /// Unreliable packets the peer sent that never arrived (sequence gaps).
    pub dropped: u64,
    /// Packets discarded as duplicates or stale reorderings.
    pub duplicates: u64,
    /// Reliable payload replays discarded by the alternation toggle.
    pub reliable_replays: u64,
    /// Datagrams too short to carry a channel header.
    pub runts: u64,
}

/// Payloads extracted from one accepted datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedPacket {
    /// Sequence number the packet carried.
    pub sequence: u32,
    /// Fresh reliable payload, if this packet carried one not yet processed.
    pub reliable: Option<Vec<u8>>,
    /// Unreliable remainder of the datagram.
    pub unreliable: Vec<u8>,
}

/// Per-peer sequenced channel state.
#[derive(Debug)]
pub struct NetChannel {
    side: NetSide,
    qport: u16,

    outgoing_sequence: u32,
    incoming_sequence: u32,
    incoming_acknowledged: u32,

    /// Toggle of the reliable payload currently in flight (or last sent).
    reliable_toggle: bool,
    /// Toggle of the last reliable payload the peer acknowledged.
    incoming_reliable_acknowledged: bool,
    /// Toggle of the last reliable payload we processed from the peer.
    incoming_reliable_toggle: Option<bool>,

    /// Staged reliable data waiting to be promoted into flight.
    staging: Vec<u8>,
    /// The in-flight reliable payload; retransmitted until acknowledged.
    in_flight: Vec<u8>,
    /// Outgoing sequence number of the packet that last carried `in_flight`.
    last_reliable_sequence: u32,

    last_received_ms: u64,
    last_sent_ms: u64,
    stats: ChannelStats,
}

impl NetChannel {
    /// Create a channel for one peer. `qport` is only stamped on the wire
    /// by the client side but both ends remember it for slot matching.
    pub fn new(side: NetSide, qport: u16) -> Self {
        Self {
            side,
            qport,
            outgoing_sequence: 0,
            incoming_sequence: 0,
            incoming_acknowledged: 0,
            reliable_toggle: false,
            incoming_reliable_acknowledged: false,
            incoming_reliable_toggle: None,
            staging: Vec::new(),
            in_flight: Vec::new(),
            last_reliable_sequence: 0,
            last_received_ms: 0,
            last_sent_ms: 0,
            stats: ChannelStats::default(),
        }
    }

    /// The qport this channel was created with.
    pub fn qport(&self) -> u16 {
        self.qport
    }

    /// Sequence number the next transmitted packet will carry.
    pub fn next_sequence(&self) -> u32 {
        self.outgoing_sequence + 1
    }

    /// Highest sequence number accepted from the peer.
    pub fn incoming_sequence(&self) -> u32 {
        self.incoming_sequence
    }

    /// Latest of our sequence numbers the peer has echoed back.
    pub fn incoming_acknowledged(&self) -> u32 {
        self.incoming_acknowledged
    }

    /// Loss/duplication counters.
    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    /// Tick time a packet last arrived, for timeout detection.
    pub fn last_received_ms(&self) -> u64 {
        self.last_received_ms
    }

    /// True while a reliable payload is staged or unacknowledged.
    pub fn reliable_pending(&self) -> bool {
        !self.staging.is_empty() || !self.in_flight.is_empty()
    }

    /// Queue reliable data behind whatever is already pending.
    ///
    /// The in-flight payload is never overwritten: new data accumulates in
    /// the staging buffer and is promoted only after the previous payload
    /// is acknowledged. Exceeding the staging capacity refuses the push and
    /// leaves pending data untouched.
    pub fn push_reliable(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        let size = self.staging.len() + data.len();
        if size > MAX_RELIABLE_LEN {
            return Err(ChannelError::ReliableOverflow {
                size,
                capacity: MAX_RELIABLE_LEN,
            });
        }
        self.staging.extend_from_slice(data);
        Ok(())
    }

    fn promote_reliable(&mut self) {
        if self.in_flight.is_empty() && !self.staging.is_empty() {
            std::mem::swap(&mut self.in_flight, &mut self.staging);
            self.staging.clear();
            self.reliable_toggle = !self.reliable_toggle;
        }
    }

    /// True when this transmission should (re)carry the reliable payload:
    /// either it has never been sent, or the packet that carried it was
    /// acknowledged without the toggle coming back.
    fn need_reliable(&self) -> bool {
        if self.in_flight.is_empty() {
            return false;
        }
        if self.last_reliable_sequence == 0 {
            return true;
        }
        self.incoming_acknowledged >= self.last_reliable_sequence
            && self.incoming_reliable_acknowledged != self.reliable_toggle
    }

    /// Frame one outgoing datagram carrying `unreliable` plus any due
    /// reliable payload, and advance the sequence counter.
    pub fn transmit(&mut self, unreliable: &[u8], now_ms: u64) -> Vec<u8> {
        self.promote_reliable();
        let send_reliable = self.need_reliable();

        self.outgoing_sequence += 1;
        self.last_sent_ms = now_ms;

        let mut w1 = self.outgoing_sequence & SEQUENCE_MASK;
        if send_reliable {
            w1 |= FLAG_RELIABLE;
            if self.reliable_toggle {
                w1 |= FLAG_TOGGLE;
            }
        }
        let mut w2 = self.incoming_sequence & SEQUENCE_MASK;
        if self.incoming_reliable_toggle == Some(true) {
            w2 |= FLAG_TOGGLE;
        }

        let mut packet = Vec::with_capacity(CHANNEL_OVERHEAD + self.in_flight.len() + unreliable.len());
        packet.extend_from_slice(&w1.to_le_bytes());
        packet.extend_from_slice(&w2.to_le_bytes());
        if self.side == NetSide::Client {
            packet.extend_from_slice(&self.qport.to_le_bytes());
        }
        if send_reliable {
            packet.extend_from_slice(&(self.in_flight.len() as u16).to_le_bytes());
            packet.extend_from_slice(&self.in_flight);
            self.last_reliable_sequence = self.outgoing_sequence;
        }
        if packet.len() + unreliable.len() <= MAX_MESSAGE_LEN {
            packet.extend_from_slice(unreliable);
        } else {
            debug!(
                len = unreliable.len(),
                "unreliable payload dropped from over-full datagram"
            );
        }
        packet
    }

    /// Accept one incoming datagram.
    ///
    /// Returns `Ok(None)` for expected, silently-dropped traffic
    /// (duplicates, stale reorders). `Err` only for datagrams that are not
    /// channel packets at all.
    pub fn process(
        &mut self,
        packet: &[u8],
        now_ms: u64,
    ) -> Result<Option<ProcessedPacket>, ChannelError> {
        let header_len = if self.side == NetSide::Server { 10 } else { 8 };
        if packet.len() < header_len {
            self.stats.runts += 1;
            return Err(ChannelError::RuntPacket(packet.len()));
        }

        let w1 = u32::from_le_bytes([packet[0], packet[1], packet[2], packet[3]]);
        let w2 = u32::from_le_bytes([packet[4], packet[5], packet[6], packet[7]]);
        let mut offset = 8;
        if self.side == NetSide::Server {
            // qport already matched by the dispatcher; skip it.
            offset += 2;
        }

        let sequence = w1 & SEQUENCE_MASK;
        let has_reliable = w1 & FLAG_RELIABLE != 0;
        let reliable_toggle = w1 & FLAG_TOGGLE != 0;
        let ack = w2 & SEQUENCE_MASK;
        let ack_toggle = w2 & FLAG_TOGGLE != 0;

        if sequence <= self.incoming_sequence {
            self.stats.duplicates += 1;
            debug!(sequence, have = self.incoming_sequence, "stale packet dropped");
            return Ok(None);
        }

        let gap = sequence - self.incoming_sequence - 1;
        if gap > 0 {
            self.stats.dropped += u64::from(gap);
            debug!(gap, sequence, "unreliable packets lost");
        }

        self.incoming_sequence = sequence;
        self.incoming_acknowledged = ack;
        self.incoming_reliable_acknowledged = ack_toggle;
        self.last_received_ms = now_ms;

        // The peer has seen our in-flight reliable payload: retire it.
        if !self.in_flight.is_empty() && ack_toggle == self.reliable_toggle {
            self.in_flight.clear();
        }

        let mut reliable = None;
        if has_reliable {
            if packet.len() < offset + 2 {
                self.stats.runts += 1;
                return Err(ChannelError::RuntPacket(packet.len()));
            }
            let len = u16::from_le_bytes([packet[offset], packet[offset + 1]]) as usize;
            offset += 2;
            if packet.len() < offset + len {
                self.stats.runts += 1;
                return Err(ChannelError::RuntPacket(packet.len()));
            }
            let payload = &packet[offset..offset + len];
            offset += len;

            if self.incoming_reliable_toggle == Some(reliable_toggle) {
                // Replay of a fragment we already processed; ack covers it.
                self.stats.reliable_replays += 1;
            } else {
                self.incoming_reliable_toggle = Some(reliable_toggle);
                reliable = Some(payload.to_vec());
            }
        }

        Ok(Some(ProcessedPacket {
            sequence,
            reliable,
            unreliable: packet[offset..].to_vec(),
        }))
    }

    /// Frame a connectionless (out-of-band) datagram: four `0xff` bytes
    /// followed by a text command. Used for all traffic before a channel
    /// exists (challenge and connect handshake).
    pub fn frame_oob(text: &str) -> Vec<u8> {
        let mut packet = Vec::with_capacity(4 + text.len());
        packet.extend_from_slice(&OOB_MARKER);
        packet.extend_from_slice(text.as_bytes());
        packet
    }

    /// Recognize an out-of-band datagram and return its text command.
    pub fn parse_oob(packet: &[u8]) -> Option<&str> {
        let body = packet.strip_prefix(&OOB_MARKER[..])?;
        std::str::from_utf8(body).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (NetChannel, NetChannel) {
        (
            NetChannel::new(NetSide::Client, 0x1234),
            NetChannel::new(NetSide::Server, 0x1234),
        )
    }

    fn deliver(from: &mut NetChannel, to: &mut NetChannel, payload: &[u8]) -> ProcessedPacket {
        let packet = from.transmit(payload, 0);
        to.process(&packet, 0).unwrap().expect("packet accepted")
    }

    #[test]
    fn unreliable_payload_round_trips() {
        let (mut client, mut server) = pair();
        let got = deliver(&mut client, &mut server, b"move");
        assert_eq!(got.unreliable, b"move");
        assert_eq!(got.reliable, None);
        assert_eq!(server.incoming_sequence(), 1);
    }

    #[test]
    fn duplicate_packets_are_dropped_and_counted() {
        let (mut client, mut server) = pair();
        let packet = client.transmit(b"a", 0);
        assert!(server.process(&packet, 0).unwrap().is_some());
        assert!(server.process(&packet, 0).unwrap().is_none());
        assert_eq!(server.stats().duplicates, 1);
    }

    #[test]
    fn sequence_gaps_count_lost_packets() {
        let (mut client, mut server) = pair();
        let _lost_a = client.transmit(b"1", 0);
        let _lost_b = client.transmit(b"2", 0);
        let third = client.transmit(b"3", 0);
        let got = server.process(&third, 0).unwrap().unwrap();
        assert_eq!(got.unreliable, b"3");
        assert_eq!(server.stats().dropped, 2);
    }

    #[test]
    fn reordered_packet_is_dropped() {
        let (mut client, mut server) = pair();
        let first = client.transmit(b"1", 0);
        let second = client.transmit(b"2", 0);
        assert!(server.process(&second, 0).unwrap().is_some());
        assert!(server.process(&first, 0).unwrap().is_none());
        assert_eq!(server.stats().duplicates, 1);
    }

    #[test]
    fn reliable_payload_delivers_and_acks() {
        let (mut client, mut server) = pair();
        client.push_reliable(b"hello").unwrap();

        let got = deliver(&mut client, &mut server, b"");
        assert_eq!(got.reliable.as_deref(), Some(&b"hello"[..]));
        assert!(client.reliable_pending());

        // Server's next packet acks the toggle; client retires the payload.
        deliver(&mut server, &mut client, b"");
        assert!(!client.reliable_pending());
    }

    #[test]
    fn second_reliable_queues_behind_first() {
        let (mut client, mut server) = pair();
        client.push_reliable(b"first").unwrap();
        let first = client.transmit(b"", 0);

        // A second push while the first is in flight must not clobber it.
        client.push_reliable(b"second").unwrap();
        let got = server.process(&first, 0).unwrap().unwrap();
        assert_eq!(got.reliable.as_deref(), Some(&b"first"[..]));
        deliver(&mut server, &mut client, b"");

        let got = deliver(&mut client, &mut server, b"");
        assert_eq!(got.reliable.as_deref(), Some(&b"second"[..]));
    }

    #[test]
    fn oversized_reliable_is_refused_without_corruption() {
        let mut channel = NetChannel::new(NetSide::Client, 1);
        channel.push_reliable(b"keep").unwrap();
        let err = channel.push_reliable(&vec![0u8; MAX_RELIABLE_LEN]).unwrap_err();
        assert!(matches!(err, ChannelError::ReliableOverflow { .. }));
        // Pending data untouched.
        assert!(channel.reliable_pending());
    }

    #[test]
    fn lost_reliable_carrier_is_retransmitted() {
        let (mut client, mut server) = pair();
        client.push_reliable(b"payload").unwrap();

        // Carrier packet lost in transit.
        let _lost = client.transmit(b"", 0);

        // Peer traffic acks a later empty packet; client learns the carrier
        // arrived nowhere and re-carries the payload.
        let plain = client.transmit(b"", 0);
        server.process(&plain, 0).unwrap();
        deliver(&mut server, &mut client, b"");

        let retry = client.transmit(b"", 0);
        let got = server.process(&retry, 0).unwrap().unwrap();
        assert_eq!(got.reliable.as_deref(), Some(&b"payload"[..]));
    }

    #[test]
    fn reliable_replay_is_deduplicated() {
        let (mut client, mut server) = pair();
        client.push_reliable(b"once").unwrap();
        let carrier = client.transmit(b"", 0);
        let got = server.process(&carrier, 0).unwrap().unwrap();
        assert_eq!(got.reliable.as_deref(), Some(&b"once"[..]));

        // The same fragment arriving again under a newer sequence (the
        // carrier was resent while the first copy was merely delayed) must
        // be acknowledged but not processed twice.
        let mut replay = carrier.clone();
        let w1 = u32::from_le_bytes([replay[0], replay[1], replay[2], replay[3]]) + 1;
        replay[..4].copy_from_slice(&w1.to_le_bytes());
        let got = server.process(&replay, 0).unwrap().unwrap();
        assert_eq!(got.reliable, None);
        assert_eq!(server.stats().reliable_replays, 1);
    }

    #[test]
    fn runt_packet_is_an_error() {
        let mut server = NetChannel::new(NetSide::Server, 1);
        assert!(matches!(
            server.process(&[1, 2, 3], 0),
            Err(ChannelError::RuntPacket(3))
        ));
        assert_eq!(server.stats().runts, 1);
    }

    #[test]
    fn client_packets_carry_qport() {
        let mut client = NetChannel::new(NetSide::Client, 0xBEEF);
        let packet = client.transmit(b"", 0);
        assert_eq!(&packet[8..10], &0xBEEFu16.to_le_bytes());

        let mut server = NetChannel::new(NetSide::Server, 0xBEEF);
        let packet = server.transmit(b"", 0);
        assert_eq!(packet.len(), 8);
    }

    #[test]
    fn oob_frames_round_trip() {
        let packet = NetChannel::frame_oob("getchallenge");
        assert_eq!(NetChannel::parse_oob(&packet), Some("getchallenge"));

        let mut server = NetChannel::new(NetSide::Server, 1);
        // An OOB packet is not channel traffic; sequence 0x3fffffff with
        // both flag bits would alias it, so the dispatcher checks first.
        assert!(NetChannel::parse_oob(&server.transmit(b"x", 0)).is_none());
    }

    #[test]
    fn last_received_tracks_arrival_time() {
        let (mut client, mut server) = pair();
        let packet = client.transmit(b"", 0);
        server.process(&packet, 777).unwrap();
        assert_eq!(server.last_received_ms(), 777);
    }
}
