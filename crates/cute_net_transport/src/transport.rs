//! Composes the ack system and the fragmenter/reassembler into the two
//! logical channels (reliable-in-order, fire-and-forget) exposed to the
//! protocol layer. See [`Transport`].

use std::time::{Duration, Instant};

use thiserror::Error;

use crate::{
    ack::{AckHeader, AckSystem},
    frag::{self, FragmentHeader, MessageTooBig, ReassembleError},
    handle::{Handle, HandleTable},
    lane::{InboundLane, ReliableSendItem, SendQueue, SendQueueFull},
    seq_buf::SeqBuf,
};

/// Default per-fragment payload size.
pub const DEFAULT_FRAGMENT_SIZE: usize = 1100;
/// Default ceiling on one `send()` call's message size.
pub const DEFAULT_MAX_SIZE_SINGLE_SEND: usize = 20 * 1024 * 1024;
/// Default ceiling on concurrently in-flight reliable fragments.
pub const DEFAULT_MAX_FRAGMENTS_IN_FLIGHT: usize = 8;
/// Default reliable send queue depth, in whole messages.
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 1024;
/// Default interval between resends of an unacked reliable fragment.
pub const DEFAULT_RESEND_RATE: Duration = Duration::from_millis(100);

/// Tunables for one [`Transport`] instance.
#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    /// Size of each fragment's payload, in bytes, before the 9-byte header.
    pub fragment_size: usize,
    /// Largest message a single `send()` call may submit.
    pub max_size_single_send: usize,
    /// Cap on reliable fragments in flight at once, across all messages.
    pub max_fragments_in_flight: usize,
    /// Cap on whole reliable messages queued (sent or not) at once.
    pub send_queue_capacity: usize,
    /// How long an unacked reliable fragment waits before it is resent.
    pub resend_rate: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            max_size_single_send: DEFAULT_MAX_SIZE_SINGLE_SEND,
            max_fragments_in_flight: DEFAULT_MAX_FRAGMENTS_IN_FLIGHT,
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            resend_rate: DEFAULT_RESEND_RATE,
        }
    }
}

/// A destination for encoded packet bytes.
///
/// Modeled as a small trait rather than a concrete socket type: the
/// transport doesn't know or care whether bytes end up on a UDP socket, a
/// loopback channel, or a loss-injecting test shim.
pub trait PacketSink {
    /// Sends one already-framed packet. Errors are the caller's problem to
    /// surface (typically a non-blocking socket-full condition); the
    /// transport treats every call as fire-and-forget.
    fn send(&mut self, bytes: &[u8]);
}

impl<F: FnMut(&[u8])> PacketSink for F {
    fn send(&mut self, bytes: &[u8]) {
        self(bytes);
    }
}

/// Failure to submit a message to [`Transport::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// The reliable send queue has no free slot.
    #[error(transparent)]
    QueueFull(#[from] SendQueueFull),
    /// The message needs more fragments than a `u16` can index.
    #[error(transparent)]
    TooBig(#[from] MessageTooBig),
}

/// Failure while feeding a received packet into [`Transport::receive`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReceiveError {
    /// Packet was too short to contain an ack header.
    #[error("packet too short for ack header")]
    Truncated,
    /// Packet was too short to contain a fragment header after the ack
    /// header.
    #[error("packet too short for fragment header")]
    TruncatedFragment,
    /// The fragment's header was internally inconsistent.
    #[error(transparent)]
    Reassemble(#[from] ReassembleError),
}

struct InFlightFragment {
    reliable: bool,
    queue_index: usize,
    fragment_index: u16,
    bytes: Vec<u8>,
    last_send: Instant,
}

/// Reliability transport for one connection: owns the ack system, the
/// reliable send queue and in-flight fragment table, and the two inbound
/// reassembly lanes.
pub struct Transport {
    config: TransportConfig,
    ack: AckSystem,

    reliable_queue: SendQueue,
    in_flight: HandleTable<InFlightFragment>,
    sent_fragments: SeqBuf<Handle, { crate::ack::BUFFER_SIZE }>, // NB: braces required for path-valued const generics
    in_flight_count: usize,

    reliable_reassembly_seq: u16,
    unreliable_reassembly_seq: u16,

    reliable_inbound: InboundLane,
    unreliable_inbound: InboundLane,
}

impl Transport {
    /// Creates a transport with the given configuration.
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            ack: AckSystem::new(),
            reliable_queue: SendQueue::new(config.send_queue_capacity),
            in_flight: HandleTable::new(),
            sent_fragments: SeqBuf::new(),
            in_flight_count: 0,
            reliable_reassembly_seq: 0,
            unreliable_reassembly_seq: 0,
            reliable_inbound: InboundLane::new(),
            unreliable_inbound: InboundLane::new(),
        }
    }

    /// Current RTT estimate for this connection.
    #[must_use]
    pub fn rtt(&self) -> Duration {
        self.ack.rtt()
    }

    /// Current packet loss estimate for this connection.
    #[must_use]
    pub fn loss(&self) -> f32 {
        self.ack.loss()
    }

    /// Number of reliable fragments currently in flight (sent, not yet
    /// acked).
    #[must_use]
    pub fn in_flight_fragments(&self) -> usize {
        self.in_flight_count
    }

    /// Submits `bytes` for delivery. If `reliable`, the message is split and
    /// enqueued for the resend-until-acked pump; otherwise every fragment is
    /// sent immediately through `sink` and never retried.
    ///
    /// # Errors
    /// Fails if the message needs more fragments than fit in a `u16`, or (for
    /// reliable messages) the send queue is already full.
    pub fn send(
        &mut self,
        now: Instant,
        sink: &mut impl PacketSink,
        bytes: &[u8],
        reliable: bool,
    ) -> Result<(), SendError> {
        if reliable {
            let reassembly_seq = self.next_reliable_reassembly_seq();
            let fragments = frag::split(self.config.fragment_size, true, reassembly_seq, bytes)?;
            self.reliable_queue.push(ReliableSendItem::new(fragments))?;
            self.pump_send_queue(now, sink);
            Ok(())
        } else {
            let reassembly_seq = self.unreliable_reassembly_seq;
            self.unreliable_reassembly_seq = self.unreliable_reassembly_seq.wrapping_add(1);
            let fragments = frag::split(self.config.fragment_size, false, reassembly_seq, bytes)?;
            for fragment in &fragments {
                self.send_ack_framed(now, sink, fragment);
            }
            Ok(())
        }
    }

    fn next_reliable_reassembly_seq(&mut self) -> u16 {
        let seq = self.reliable_reassembly_seq;
        self.reliable_reassembly_seq = self.reliable_reassembly_seq.wrapping_add(1);
        seq
    }

    fn send_ack_framed(&mut self, now: Instant, sink: &mut impl PacketSink, fragment: &[u8]) {
        let header = self.ack.next_outgoing(now, fragment.len());
        let mut out = Vec::with_capacity(AckHeader::ENCODED_LEN + fragment.len());
        let mut ack_buf = [0u8; AckHeader::ENCODED_LEN];
        header.encode(&mut ack_buf);
        out.extend_from_slice(&ack_buf);
        out.extend_from_slice(fragment);
        sink.send(&out);
    }

    /// Advances reliable delivery: resends fragments whose last send is
    /// older than `resend_rate`, then pumps newly-sendable fragments from
    /// the queue up to `max_fragments_in_flight`.
    pub fn update(&mut self, now: Instant, sink: &mut impl PacketSink) {
        self.resend_stale(now, sink);
        self.pump_send_queue(now, sink);
    }

    fn resend_stale(&mut self, now: Instant, sink: &mut impl PacketSink) {
        let stale: Vec<Handle> = self
            .in_flight
            .iter()
            .filter(|(_, f)| now.saturating_duration_since(f.last_send) >= self.config.resend_rate)
            .map(|(handle, _)| handle)
            .collect();

        for handle in stale {
            let Some(fragment) = self.in_flight.get(handle) else {
                continue;
            };
            let bytes = fragment.bytes.clone();
            let header = self.ack.next_outgoing(now, bytes.len());

            let Some(fragment) = self.in_flight.get_mut(handle) else {
                continue;
            };
            fragment.last_send = now;

            self.sent_fragments.insert(header.sequence, handle);

            let mut out = Vec::with_capacity(AckHeader::ENCODED_LEN + bytes.len());
            let mut ack_buf = [0u8; AckHeader::ENCODED_LEN];
            header.encode(&mut ack_buf);
            out.extend_from_slice(&ack_buf);
            out.extend_from_slice(&bytes);
            sink.send(&out);
        }
    }

    fn pump_send_queue(&mut self, now: Instant, sink: &mut impl PacketSink) {
        while self.in_flight_count < self.config.max_fragments_in_flight {
            let Some(queue_index) = self.next_sendable_index() else {
                break;
            };
            let Some(item) = self.reliable_queue.get_mut(queue_index) else {
                break;
            };
            let fragment_index = item.next_unsent;
            let bytes = item.fragments[usize::from(fragment_index)].clone();
            item.next_unsent += 1;

            let header = self.ack.next_outgoing(now, bytes.len());
            let handle = self.in_flight.insert(InFlightFragment {
                reliable: true,
                queue_index,
                fragment_index,
                bytes: bytes.clone(),
                last_send: now,
            });
            self.sent_fragments.insert(header.sequence, handle);
            self.in_flight_count += 1;

            let mut out = Vec::with_capacity(AckHeader::ENCODED_LEN + bytes.len());
            let mut ack_buf = [0u8; AckHeader::ENCODED_LEN];
            header.encode(&mut ack_buf);
            out.extend_from_slice(&ack_buf);
            out.extend_from_slice(&bytes);
            sink.send(&out);
        }
    }

    fn next_sendable_index(&mut self) -> Option<usize> {
        self.reliable_queue
            .front_mut()
            .is_some_and(|item| !item.is_fully_sent())
            .then_some(0)
    }

    /// Feeds one decrypted PAYLOAD body into the transport: strips the ack
    /// header, updates ack bookkeeping, then parses and reassembles the
    /// fragment.
    ///
    /// # Errors
    /// Fails if the packet is malformed or the fragment header is
    /// internally inconsistent.
    pub fn receive(&mut self, now: Instant, packet: &[u8]) -> Result<(), ReceiveError> {
        let ack_header = AckHeader::decode(packet).ok_or(ReceiveError::Truncated)?;
        let rest = &packet[AckHeader::ENCODED_LEN..];

        let newly_acked = self.ack.receive(now, ack_header, rest.len());
        for seq in newly_acked {
            self.on_fragment_acked(seq);
        }

        let frag_header = FragmentHeader::decode(rest).ok_or(ReceiveError::TruncatedFragment)?;
        let payload = &rest[frag::HEADER_LEN..];

        if payload.len() != usize::from(frag_header.fragment_size) {
            return Err(ReceiveError::TruncatedFragment);
        }

        let lane = if frag_header.reliable {
            &mut self.reliable_inbound
        } else {
            &mut self.unreliable_inbound
        };
        if let Some(message) = lane.reassembler_mut().receive(
            self.config.max_size_single_send,
            self.config.fragment_size,
            frag_header,
            payload,
        )? {
            lane.push_ready(message);
        }
        Ok(())
    }

    fn on_fragment_acked(&mut self, seq: u16) {
        let Some(&handle) = self.sent_fragments.find(seq) else {
            return;
        };
        let Some(fragment) = self.in_flight.remove(handle) else {
            return;
        };
        if !fragment.reliable {
            return;
        }
        self.in_flight_count -= 1;
        if let Some(item) = self.reliable_queue.get_mut(fragment.queue_index) {
            item.acked_count += 1;
        }
        self.reliable_queue.drain_delivered();
    }

    /// Pops the next fully reassembled message from the reliable-in-order
    /// channel, if one is ready.
    pub fn receive_reliable(&mut self) -> Option<Vec<u8>> {
        self.reliable_inbound.pop_ready()
    }

    /// Pops the next fully reassembled message from the fire-and-forget
    /// channel, if one is ready.
    pub fn receive_fire_and_forget(&mut self) -> Option<Vec<u8>> {
        self.unreliable_inbound.pop_ready()
    }
}
