//! Per-connection, per-direction ack bookkeeping. See [`AckSystem`].

use std::time::{Duration, Instant};

use crate::{rtt::RttEstimator, seq_buf::SeqBuf};

/// Size of the sent/received sequence buffers backing one [`AckSystem`].
///
/// Large enough to cover several seconds of traffic at typical send rates
/// without the sent/received windows wrapping and colliding.
pub const BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, Default)]
struct SentPacket {
    send_time: Option<Instant>,
    acked: bool,
    size: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct RecvPacket {
    recv_time: Option<Instant>,
    size: usize,
}

/// An 8-byte ack header prefixed onto every outgoing PAYLOAD body: `sequence:2,
/// ack:2, ack_bits:4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckHeader {
    /// This packet's own sequence number.
    pub sequence: u16,
    /// Most recent sequence the sender has received from the peer.
    pub ack: u16,
    /// Bitfield of acks relative to `ack` (see [`SeqBuf::generate_ack_bits`]).
    pub ack_bits: u32,
}

impl AckHeader {
    /// Encoded size in bytes.
    pub const ENCODED_LEN: usize = 8;

    /// Writes this header to the front of `out`, little-endian.
    pub fn encode(&self, out: &mut [u8; Self::ENCODED_LEN]) {
        out[0..2].copy_from_slice(&self.sequence.to_le_bytes());
        out[2..4].copy_from_slice(&self.ack.to_le_bytes());
        out[4..8].copy_from_slice(&self.ack_bits.to_le_bytes());
    }

    /// Reads a header from the front of a buffer.
    ///
    /// # Errors
    /// Fails if `buf` is shorter than [`AckHeader::ENCODED_LEN`].
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::ENCODED_LEN {
            return None;
        }
        Some(Self {
            sequence: u16::from_le_bytes([buf[0], buf[1]]),
            ack: u16::from_le_bytes([buf[2], buf[3]]),
            ack_bits: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }
}

/// Per-direction ack state for one connection.
///
/// Assigns outgoing sequence numbers, piggybacks `(ack, ack_bits)` on every
/// outgoing payload, tracks which sent sequences have been acked by the
/// peer, and estimates RTT, packet loss, and bandwidth. Used on top of
/// PAYLOAD-carrying channels only; handshake packets carry no ack header.
#[derive(Debug)]
pub struct AckSystem {
    sent: SeqBuf<SentPacket, BUFFER_SIZE>,
    recv: SeqBuf<RecvPacket, BUFFER_SIZE>,
    next_seq: u16,
    rtt: RttEstimator,
    loss: f32,
}

/// EMA weight applied to the loss estimate on every newly-acked sequence;
/// see [`RttEstimator`] for the matching RTT smoothing constant.
const LOSS_EMA_ALPHA: f32 = 0.1;

impl Default for AckSystem {
    fn default() -> Self {
        Self {
            sent: SeqBuf::new(),
            recv: SeqBuf::new(),
            next_seq: 0,
            rtt: RttEstimator::default(),
            loss: 0.0,
        }
    }
}

impl AckSystem {
    /// Creates a fresh ack system with no history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns the next outgoing sequence, records a sent-packet entry, and
    /// returns the header to prefix onto the payload.
    pub fn next_outgoing(&mut self, now: Instant, payload_size: usize) -> AckHeader {
        let sequence = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        // the slot about to be overwritten held the send from one full
        // buffer cycle ago; if it never got acked, count it as lost.
        if let Some(evicted) = self.sent.peek_evictee(sequence) {
            if evicted.acked {
                self.loss *= 1.0 - LOSS_EMA_ALPHA;
            } else {
                self.loss = self.loss.mul_add(1.0 - LOSS_EMA_ALPHA, LOSS_EMA_ALPHA);
            }
        }

        self.sent.insert(
            sequence,
            SentPacket {
                send_time: Some(now),
                acked: false,
                size: payload_size,
            },
        );

        let (ack, ack_bits) = self.recv.generate_ack_bits();
        AckHeader {
            sequence,
            ack,
            ack_bits,
        }
    }

    /// Processes an incoming header: records the received sequence and
    /// returns every sequence that became newly acked as a result.
    ///
    /// Rejects (returns an empty vec, records nothing) if `header.sequence`
    /// is stale relative to the receive buffer's head.
    pub fn receive(&mut self, now: Instant, header: AckHeader, payload_size: usize) -> Vec<u16> {
        if self.recv.is_stale(header.sequence) {
            return Vec::new();
        }
        self.recv.insert(
            header.sequence,
            RecvPacket {
                recv_time: Some(now),
                size: payload_size,
            },
        );

        let mut newly_acked = Vec::new();
        for i in 0..32u32 {
            if header.ack_bits & (1 << i) == 0 {
                continue;
            }
            let seq = header.ack.wrapping_sub(i as u16);
            if let Some(sent) = self.sent.find_mut(seq) {
                if !sent.acked {
                    sent.acked = true;
                    if let Some(send_time) = sent.send_time {
                        self.rtt.update(now.saturating_duration_since(send_time));
                    }
                    newly_acked.push(seq);
                    self.loss = self.loss * (1.0 - LOSS_EMA_ALPHA);
                }
            }
        }
        newly_acked
    }

    /// Current RTT estimate.
    #[must_use]
    pub fn rtt(&self) -> Duration {
        self.rtt.get()
    }

    /// Packet loss estimate in `0.0..=1.0`, an EMA over the sent buffer.
    #[must_use]
    pub fn loss(&self) -> f32 {
        self.loss
    }

    /// `true` if the sent-packet entry at `seq` is marked acked.
    #[must_use]
    pub fn is_acked(&self, seq: u16) -> bool {
        self.sent.find(seq).is_some_and(|p| p.acked)
    }
}
