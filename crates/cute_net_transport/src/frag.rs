//! Splits oversized messages into fragments and reassembles them.
//!
//! Wire format for a single transport fragment:
//! `[reliability_flag:1][reassembly_seq:2][fragment_count:2]
//! [fragment_index:2][fragment_size:2]` followed by the fragment payload.
//! `reliability_flag == 1` marks a fragment belonging to the reliable-in-order
//! channel, `0` the fire-and-forget channel.

use bit_vec::BitVec;
use thiserror::Error;

use crate::seq_buf::SeqBuf;

/// Length of the fixed fragment header, in bytes.
pub const HEADER_LEN: usize = 9;

/// Front-loaded metadata for one fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// `true` for the reliable-in-order channel, `false` for fire-and-forget.
    pub reliable: bool,
    /// Sequence identifying the user message this fragment belongs to,
    /// independent of the ack-layer sequence.
    pub reassembly_seq: u16,
    /// Total number of fragments the message was split into.
    pub fragment_count: u16,
    /// This fragment's position within the message.
    pub fragment_index: u16,
    /// Length of this fragment's payload, in bytes.
    pub fragment_size: u16,
}

impl FragmentHeader {
    /// Encodes this header into the front of `out`.
    pub fn encode(&self, out: &mut [u8; HEADER_LEN]) {
        out[0] = u8::from(self.reliable);
        out[1..3].copy_from_slice(&self.reassembly_seq.to_le_bytes());
        out[3..5].copy_from_slice(&self.fragment_count.to_le_bytes());
        out[5..7].copy_from_slice(&self.fragment_index.to_le_bytes());
        out[7..9].copy_from_slice(&self.fragment_size.to_le_bytes());
    }

    /// Decodes a header from the front of `buf`.
    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        Some(Self {
            reliable: buf[0] != 0,
            reassembly_seq: u16::from_le_bytes([buf[1], buf[2]]),
            fragment_count: u16::from_le_bytes([buf[3], buf[4]]),
            fragment_index: u16::from_le_bytes([buf[5], buf[6]]),
            fragment_size: u16::from_le_bytes([buf[7], buf[8]]),
        })
    }
}

/// A message was too large to split given the configured fragment size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("message of {byte_len} bytes needs {num_frags} fragments, more than u16 can index")]
pub struct MessageTooBig {
    /// Length of the message, in bytes.
    pub byte_len: usize,
    /// Number of fragments the message would require.
    pub num_frags: usize,
}

/// Splits `bytes` into `ceil(len / fragment_size)` fragments, the final one
/// possibly smaller than the rest, each prefixed with its encoded
/// [`FragmentHeader`].
///
/// # Errors
/// Fails if the message would need more than [`u16::MAX`] fragments.
pub fn split(
    fragment_size: usize,
    reliable: bool,
    reassembly_seq: u16,
    bytes: &[u8],
) -> Result<Vec<Vec<u8>>, MessageTooBig> {
    assert!(fragment_size > 0);

    let num_frags = bytes.len().div_ceil(fragment_size).max(1);
    if num_frags > usize::from(u16::MAX) {
        return Err(MessageTooBig {
            byte_len: bytes.len(),
            num_frags,
        });
    }

    let mut out = Vec::with_capacity(num_frags);
    for (index, chunk) in bytes.chunks(fragment_size.max(1)).enumerate() {
        let header = FragmentHeader {
            reliable,
            reassembly_seq,
            #[expect(clippy::cast_possible_truncation, reason = "checked above")]
            fragment_count: num_frags as u16,
            #[expect(clippy::cast_possible_truncation, reason = "checked above")]
            fragment_index: index as u16,
            #[expect(clippy::cast_possible_truncation, reason = "fragment_size is small")]
            fragment_size: chunk.len() as u16,
        };
        let mut encoded = vec![0u8; HEADER_LEN + chunk.len()];
        header.encode((&mut encoded[..HEADER_LEN]).try_into().expect("exact len"));
        encoded[HEADER_LEN..].copy_from_slice(chunk);
        out.push(encoded);
    }
    if bytes.is_empty() {
        // a zero-length message still becomes exactly one (empty) fragment
        let header = FragmentHeader {
            reliable,
            reassembly_seq,
            fragment_count: 1,
            fragment_index: 0,
            fragment_size: 0,
        };
        let mut encoded = vec![0u8; HEADER_LEN];
        header.encode((&mut encoded[..]).try_into().expect("exact len"));
        out.push(encoded);
    }
    Ok(out)
}

/// A received fragment was rejected during reassembly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReassembleError {
    /// `fragment_count * fragment_size` would exceed the configured maximum
    /// single-send size.
    #[error("fragment count {fragment_count} * size {fragment_size} exceeds max_size_single_send")]
    TooLarge {
        /// Reported fragment count.
        fragment_count: u16,
        /// Configured per-fragment size.
        fragment_size: usize,
    },
    /// `fragment_index >= fragment_count`.
    #[error("fragment index {index} out of range for count {count}")]
    IndexOutOfRange {
        /// Offending index.
        index: u16,
        /// Reported fragment count.
        count: u16,
    },
    /// The fragment's payload is larger than the transport's configured
    /// fragment size.
    #[error("fragment payload of {len} bytes exceeds configured fragment size {max}")]
    FragmentTooBig {
        /// Actual payload length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },
    /// A fragment with this index was already received for this message.
    #[error("fragment {index} already received")]
    AlreadyReceived {
        /// Offending index.
        index: u16,
    },
}

#[derive(Clone, Default)]
struct ReassemblyEntry {
    fragment_count: u16,
    received: BitVec,
    received_count: u16,
    buf: Vec<u8>,
}

/// Sequence-buffer-backed reassembler for one channel (reliable or
/// fire-and-forget) of one connection.
///
/// Keyed by `reassembly_seq`; entries older than the buffer's capacity are
/// silently evicted rather than reported as an error.
pub struct Reassembler<const N: usize> {
    entries: SeqBuf<ReassemblyEntry, N>,
}

impl<const N: usize> Default for Reassembler<N> {
    fn default() -> Self {
        Self {
            entries: SeqBuf::new(),
        }
    }
}

impl<const N: usize> Reassembler<N> {
    /// Creates an empty reassembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one fragment into reassembly.
    ///
    /// Returns `Ok(Some(bytes))` once every fragment of `header.reassembly_seq`
    /// has arrived, `Ok(None)` if the message is still incomplete, or
    /// silently drops stale reassembly sequences by returning `Ok(None)`
    /// rather than an error.
    ///
    /// # Errors
    /// Returns [`ReassembleError`] for internally-inconsistent fragments.
    pub fn receive(
        &mut self,
        max_size_single_send: usize,
        configured_fragment_size: usize,
        header: FragmentHeader,
        payload: &[u8],
    ) -> Result<Option<Vec<u8>>, ReassembleError> {
        if usize::from(header.fragment_count) * configured_fragment_size > max_size_single_send {
            return Err(ReassembleError::TooLarge {
                fragment_count: header.fragment_count,
                fragment_size: configured_fragment_size,
            });
        }
        if header.fragment_index >= header.fragment_count {
            return Err(ReassembleError::IndexOutOfRange {
                index: header.fragment_index,
                count: header.fragment_count,
            });
        }
        if payload.len() > configured_fragment_size {
            return Err(ReassembleError::FragmentTooBig {
                len: payload.len(),
                max: configured_fragment_size,
            });
        }

        if self.entries.is_stale(header.reassembly_seq) {
            log::debug!(
                "dropping fragment for stale reassembly_seq {}",
                header.reassembly_seq
            );
            return Ok(None);
        }

        if self.entries.find(header.reassembly_seq).is_none() {
            self.entries.insert(
                header.reassembly_seq,
                ReassemblyEntry {
                    fragment_count: header.fragment_count,
                    received: BitVec::from_elem(usize::from(header.fragment_count), false),
                    received_count: 0,
                    buf: vec![0u8; usize::from(header.fragment_count) * configured_fragment_size],
                },
            );
        }
        let entry = self
            .entries
            .find_mut(header.reassembly_seq)
            .expect("just inserted or already present");

        let index = usize::from(header.fragment_index);
        if entry.received.get(index) == Some(true) {
            return Err(ReassembleError::AlreadyReceived {
                index: header.fragment_index,
            });
        }

        let start = index * configured_fragment_size;
        let end = start + payload.len();
        entry.buf[start..end].copy_from_slice(payload);
        entry.received.set(index, true);
        entry.received_count += 1;

        let is_last = header.fragment_index + 1 == header.fragment_count;
        let final_size = if is_last { Some(end) } else { None };

        if entry.received_count == entry.fragment_count {
            let mut entry = self
                .entries
                .remove(header.reassembly_seq)
                .expect("found above");
            // trim to the size implied by the last fragment received, if we
            // know it; otherwise the buffer is already exactly sized.
            if let Some(size) = final_size {
                entry.buf.truncate(size);
            } else {
                entry.buf.truncate(
                    usize::from(entry.fragment_count - 1) * configured_fragment_size
                        + payload.len(),
                );
            }
            Ok(Some(entry.buf))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_single_fragment() {
        let fragments = split(8, true, 1, b"hello").unwrap();
        assert_eq!(1, fragments.len());

        let mut r = Reassembler::<64>::new();
        let raw = &fragments[0];
        let header = FragmentHeader::decode(raw).unwrap();
        let out = r
            .receive(1 << 20, 8, header, &raw[HEADER_LEN..])
            .unwrap();
        assert_eq!(Some(b"hello".to_vec()), out);
    }

    #[test]
    fn round_trip_multi_fragment_out_of_order() {
        let msg = b"the quick brown fox jumps over the lazy dog";
        let fragments = split(8, true, 7, msg).unwrap();
        assert!(fragments.len() > 1);

        let mut r = Reassembler::<64>::new();
        let mut result = None;
        // feed fragments in reverse order
        for raw in fragments.iter().rev() {
            let header = FragmentHeader::decode(raw).unwrap();
            result = r.receive(1 << 20, 8, header, &raw[HEADER_LEN..]).unwrap();
        }
        assert_eq!(Some(msg.to_vec()), result);
    }

    #[test]
    fn rejects_index_out_of_range() {
        let mut r = Reassembler::<64>::new();
        let header = FragmentHeader {
            reliable: true,
            reassembly_seq: 0,
            fragment_count: 2,
            fragment_index: 5,
            fragment_size: 4,
        };
        let err = r.receive(1 << 20, 8, header, &[0; 4]).unwrap_err();
        assert!(matches!(err, ReassembleError::IndexOutOfRange { .. }));
    }

    #[test]
    fn rejects_duplicate_fragment() {
        let mut r = Reassembler::<64>::new();
        let header = FragmentHeader {
            reliable: true,
            reassembly_seq: 0,
            fragment_count: 2,
            fragment_index: 0,
            fragment_size: 4,
        };
        r.receive(1 << 20, 8, header, &[1; 4]).unwrap();
        let err = r.receive(1 << 20, 8, header, &[1; 4]).unwrap_err();
        assert!(matches!(err, ReassembleError::AlreadyReceived { .. }));
    }
}
