//! Jitter buffer for RTP packet reordering and gap handling.
//!
//! Packets are keyed by sequence number and released strictly in sequence
//! order. A gap that grows beyond the buffer size is written off as loss
//! so playout never stalls for longer than `max_size` packet intervals.

use std::collections::HashMap;

use tracing::{debug, trace, warn};
use voip_bench_common::RtpPacket;

/// Half of the 16-bit sequence space.
const HALF_SEQ_SPACE: u16 = 1 << 15;

/// Forward distance from `from` to `to` in 16-bit sequence space.
pub fn seq_forward_distance(from: u16, to: u16) -> u16 {
    to.wrapping_sub(from)
}

/// Returns `true` if `a` comes strictly before `b`, accounting for
/// wraparound (65535 is before 0).
pub fn seq_is_before(a: u16, b: u16) -> bool {
    // ---
    let diff = b.wrapping_sub(a);
    diff != 0 && diff < HALF_SEQ_SPACE
}

/// Jitter buffer configuration.
#[derive(Debug, Clone)]
pub struct JitterBufferConfig {
    // ---
    /// Maximum packets held at once; also the largest gap waited out
    pub max_size: usize,
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        // ---
        Self {
            max_size: 50, // 1s of 20ms frames
        }
    }
}

/// Jitter buffer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JitterBufferStats {
    pub packets_added: u64,
    pub packets_retrieved: u64,
    /// Too old, duplicate, or evicted/refused while full
    pub packets_dropped: u64,
    /// Arrived after a higher sequence number had already been added
    pub packets_out_of_order: u64,
    /// Sequence numbers skipped over without ever being played
    pub packets_lost: u64,
    pub duplicates: u64,
    pub evicted: u64,
    pub buffered: usize,
    pub next_sequence: Option<u16>,
}

/// Sequence-ordered playout buffer.
///
/// # Example
///
/// ```
/// use receiver::jitter_buffer::{JitterBuffer, JitterBufferConfig};
/// use voip_bench_common::RtpPacket;
///
/// let mut buffer = JitterBuffer::new(JitterBufferConfig::default());
///
/// // Insert packets as they arrive (possibly out of order)
/// buffer.add_packet(RtpPacket::new(0, 0, 0x12345678, vec![1, 2, 3]));
/// buffer.add_packet(RtpPacket::new(2, 640, 0x12345678, vec![7, 8, 9]));
/// buffer.add_packet(RtpPacket::new(1, 320, 0x12345678, vec![4, 5, 6]));
///
/// // Retrieve packets in sequence order
/// let order: Vec<u16> = std::iter::from_fn(|| buffer.get_next_packet())
///     .map(|p| p.sequence)
///     .collect();
/// assert_eq!(order, vec![0, 1, 2]);
/// ```
#[derive(Debug)]
pub struct JitterBuffer {
    // ---
    config: JitterBufferConfig,

    /// Buffered packets keyed by sequence number
    packets: HashMap<u16, RtpPacket>,

    /// Next sequence number to release; set by the first packet
    next_sequence: Option<u16>,

    /// Highest sequence added so far, for reorder detection
    highest_seen: Option<u16>,

    stats: JitterBufferStats,
}

impl JitterBuffer {
    // ---
    pub fn new(config: JitterBufferConfig) -> Self {
        // ---
        let config = JitterBufferConfig {
            max_size: config.max_size.max(1),
        };
        Self {
            packets: HashMap::with_capacity(config.max_size),
            config,
            next_sequence: None,
            highest_seen: None,
            stats: JitterBufferStats::default(),
        }
    }

    /// Pins the first sequence number to play instead of taking it from
    /// the first packet that arrives.
    pub fn expect_sequence(&mut self, sequence: u16) {
        self.next_sequence = Some(sequence);
    }

    /// Offers a packet to the buffer.
    ///
    /// Returns `true` if the packet was stored. It is refused when it is
    /// behind the playout point, already buffered, or older than
    /// everything held in a full buffer. When a full buffer admits a
    /// packet, the oldest buffered entry is evicted to make room.
    pub fn add_packet(&mut self, packet: RtpPacket) -> bool {
        // ---
        let seq = packet.sequence;
        let next = *self.next_sequence.get_or_insert(seq);

        if seq_is_before(seq, next) {
            debug!("Discarding late packet: seq={} (expected={})", seq, next);
            self.stats.packets_dropped += 1;
            return false;
        }

        if self.packets.contains_key(&seq) {
            debug!("Discarding duplicate packet: seq={}", seq);
            self.stats.duplicates += 1;
            self.stats.packets_dropped += 1;
            return false;
        }

        if self.packets.len() >= self.config.max_size {
            // Full buffers are never empty, so an oldest entry exists.
            let Some(oldest) = self.oldest_buffered(next) else {
                return false;
            };

            if seq_forward_distance(next, seq) < seq_forward_distance(next, oldest) {
                warn!("Buffer full, refusing older packet seq={}", seq);
                self.stats.packets_dropped += 1;
                return false;
            }

            warn!("Buffer full, evicting oldest packet seq={}", oldest);
            self.packets.remove(&oldest);
            self.stats.evicted += 1;
            self.stats.packets_dropped += 1;
        }

        match self.highest_seen {
            Some(high) if seq_is_before(seq, high) => self.stats.packets_out_of_order += 1,
            _ => self.highest_seen = Some(seq),
        }

        self.packets.insert(seq, packet);
        self.stats.packets_added += 1;
        true
    }

    /// Releases the next packet in sequence order.
    ///
    /// Returns `None` while the next sequence number is missing and the
    /// gap to the earliest buffered packet is still within `max_size`.
    /// Once the gap exceeds `max_size`, the missing range is counted as
    /// lost and playout resumes at the earliest buffered packet.
    pub fn get_next_packet(&mut self) -> Option<RtpPacket> {
        // ---
        let next = self.next_sequence?;

        if let Some(packet) = self.packets.remove(&next) {
            self.next_sequence = Some(next.wrapping_add(1));
            self.stats.packets_retrieved += 1;
            return Some(packet);
        }

        let oldest = self.oldest_buffered(next)?;
        let gap = seq_forward_distance(next, oldest);
        if (gap as usize) <= self.config.max_size {
            return None;
        }

        debug!(
            "Skipping {} missing packets: seq {}..{}",
            gap,
            next,
            oldest.wrapping_sub(1)
        );
        self.stats.packets_lost += gap as u64;
        self.next_sequence = Some(oldest.wrapping_add(1));
        self.stats.packets_retrieved += 1;
        self.packets.remove(&oldest)
    }

    /// Releases everything still buffered, in order, counting any gaps
    /// as lost. Used at end of stream when no more packets will come.
    pub fn flush(&mut self) -> Vec<RtpPacket> {
        // ---
        let mut out = Vec::with_capacity(self.packets.len());

        while let Some(next) = self.next_sequence {
            let Some(oldest) = self.oldest_buffered(next) else {
                break;
            };
            self.stats.packets_lost += seq_forward_distance(next, oldest) as u64;
            self.next_sequence = Some(oldest.wrapping_add(1));

            if let Some(packet) = self.packets.remove(&oldest) {
                self.stats.packets_retrieved += 1;
                out.push(packet);
            }
        }

        trace!("Flushed {} packets", out.len());
        out
    }

    /// Gives up on the missing sequence numbers in front of the earliest
    /// buffered packet, counting them as lost.
    ///
    /// Used by a playout clock that will not wait any longer. Returns the
    /// number of sequence numbers skipped.
    pub fn skip_gap(&mut self) -> u16 {
        // ---
        let Some(next) = self.next_sequence else {
            return 0;
        };
        let Some(oldest) = self.oldest_buffered(next) else {
            return 0;
        };

        let gap = seq_forward_distance(next, oldest);
        if gap > 0 {
            debug!("Playout deadline passed, skipping seq {}..{}", next, oldest.wrapping_sub(1));
            self.stats.packets_lost += gap as u64;
            self.next_sequence = Some(oldest);
        }
        gap
    }

    /// Buffered sequence number closest ahead of `next`.
    fn oldest_buffered(&self, next: u16) -> Option<u16> {
        // ---
        self.packets
            .keys()
            .copied()
            .min_by_key(|&seq| seq_forward_distance(next, seq))
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.config.max_size
    }

    pub fn stats(&self) -> JitterBufferStats {
        // ---
        JitterBufferStats {
            buffered: self.packets.len(),
            next_sequence: self.next_sequence,
            ..self.stats
        }
    }
}
