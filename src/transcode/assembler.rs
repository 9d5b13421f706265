//! RTP sample reassembly
//!
//! Buffers RTP packets per track, reorders them by extended sequence number
//! and emits depacketized media samples once a frame boundary is proven.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing::debug;
use webrtc::rtp::packet::Packet;
use webrtc::rtp::packetizer::Depacketizer;

use crate::error::{Error, Result};

/// Offset applied to the first extended sequence number, so reordering at
/// the very start of a stream cannot underflow past zero.
const SEQUENCE_BASE: u64 = 1 << 16;

/// A depacketized media frame spanning one RTP timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSample {
    /// Codec payload with the RTP packetization stripped.
    pub data: Bytes,
    /// Wall-clock duration covered by the sample, derived from the RTP
    /// timestamp step to the following sample.
    pub duration: Duration,
}

/// Reorders RTP packets and assembles them into complete samples.
///
/// Packets are buffered by extended sequence number. A sample is emitted
/// once every packet of a frame is present and a following packet proves
/// the frame complete; the RTP timestamp step to that packet also yields
/// the sample duration. When a gap persists for more than `max_late`
/// packets the frame in progress is abandoned and assembly resumes at the
/// next partition head.
pub struct SampleAssembler<D: Depacketizer> {
    depacketizer: D,
    clock_rate: u32,
    max_late: u16,
    packets: BTreeMap<u64, Packet>,
    /// Extended sequence number of the next packet to consume.
    head: Option<u64>,
    /// Highest extended sequence number seen so far.
    newest: Option<u64>,
    /// Set at start and after a forced skip: discard buffered packets
    /// until one that begins a partition.
    await_partition_head: bool,
    dropped: u64,
}

impl<D: Depacketizer> SampleAssembler<D> {
    pub fn new(depacketizer: D, clock_rate: u32, max_late: u16) -> Self {
        Self {
            depacketizer,
            clock_rate,
            max_late,
            packets: BTreeMap::new(),
            head: None,
            newest: None,
            await_partition_head: true,
            dropped: 0,
        }
    }

    /// Number of packets dropped as late, lost or unusable.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Buffers one RTP packet.
    ///
    /// Packets that sort before the current assembly head are dropped;
    /// reordering within the buffer is handled by [`pop`](Self::pop).
    pub fn push(&mut self, packet: Packet) {
        let seq = packet.header.sequence_number;
        let ext = self.extend_sequence(seq);
        if let Some(head) = self.head {
            if ext < head {
                self.dropped += 1;
                debug!(sequence = seq, "dropping packet behind assembly head");
                return;
            }
        }
        if self.newest.map_or(true, |newest| ext > newest) {
            self.newest = Some(ext);
        }
        self.packets.insert(ext, packet);
    }

    /// Drains the next complete sample, if any.
    ///
    /// Returns `Ok(None)` while more packets are needed. A payload the
    /// depacketizer rejects is unrecoverable for the stream and surfaces
    /// as an error.
    pub fn pop(&mut self) -> Result<Option<MediaSample>> {
        loop {
            if self.await_partition_head && !self.seek_partition_head() {
                return Ok(None);
            }
            let Some(head) = self.head else {
                return Ok(None);
            };
            let Some((end, head_ts, next_ts)) = self.complete_run(head) else {
                if self.force_skip(head) {
                    continue;
                }
                return Ok(None);
            };
            return self.assemble(head, end, head_ts, next_ts).map(Some);
        }
    }

    /// Extends a 16-bit sequence number for ordering across wraparound.
    ///
    /// The signed distance from the newest sequence seen places the value
    /// in the extended space.
    fn extend_sequence(&self, seq: u16) -> u64 {
        match self.newest {
            Some(newest) => {
                let delta = i64::from(seq.wrapping_sub(newest as u16) as i16);
                (newest as i64 + delta) as u64
            }
            None => SEQUENCE_BASE + u64::from(seq),
        }
    }

    /// Finds the end of a complete sample starting at `head`.
    ///
    /// Returns the inclusive end of the run plus the RTP timestamps of the
    /// run and of the packet that follows it, or `None` while packets are
    /// still missing.
    fn complete_run(&self, head: u64) -> Option<(u64, u32, u32)> {
        let head_ts = self.packets.get(&head)?.header.timestamp;
        let mut cursor = head;
        let end = loop {
            let packet = self.packets.get(&cursor)?;
            if packet.header.timestamp != head_ts {
                break cursor - 1;
            }
            if self
                .depacketizer
                .is_partition_tail(packet.header.marker, &packet.payload)
            {
                break cursor;
            }
            cursor += 1;
        };
        // The packet after the run supplies the duration of this sample.
        let next = self.packets.get(&(end + 1))?;
        Some((end, head_ts, next.header.timestamp))
    }

    /// Depacketizes and concatenates the run `head..=end`, advancing the
    /// assembly head past it.
    fn assemble(&mut self, head: u64, end: u64, head_ts: u32, next_ts: u32) -> Result<MediaSample> {
        let mut data = BytesMut::new();
        for ext in head..=end {
            let Some(packet) = self.packets.remove(&ext) else {
                continue;
            };
            let part = self
                .depacketizer
                .depacketize(&packet.payload)
                .map_err(|e| Error::Bitstream(format!("depacketize: {e}")))?;
            data.extend_from_slice(&part);
        }
        self.head = Some(end + 1);
        let ticks = next_ts.wrapping_sub(head_ts);
        Ok(MediaSample {
            data: data.freeze(),
            duration: Duration::from_secs_f64(f64::from(ticks) / f64::from(self.clock_rate)),
        })
    }

    /// Discards buffered packets until one begins a partition, then
    /// resumes assembly there. Returns false while nothing usable is
    /// buffered.
    fn seek_partition_head(&mut self) -> bool {
        while let Some((&ext, packet)) = self.packets.first_key_value() {
            if self.depacketizer.is_partition_head(&packet.payload) {
                self.head = Some(ext);
                self.await_partition_head = false;
                return true;
            }
            self.packets.remove(&ext);
            self.dropped += 1;
        }
        self.head = self.newest.map(|newest| newest + 1);
        false
    }

    /// Abandons the sample in progress once the buffer has run `max_late`
    /// packets past its gap, then resynchronizes on a partition head.
    fn force_skip(&mut self, head: u64) -> bool {
        let Some(newest) = self.newest else {
            return false;
        };
        if newest.saturating_sub(head) < u64::from(self.max_late) {
            return false;
        }
        if let Some(head_ts) = self.packets.get(&head).map(|p| p.header.timestamp) {
            let mut cursor = head;
            while let Some(packet) = self.packets.get(&cursor) {
                if packet.header.timestamp != head_ts {
                    break;
                }
                self.packets.remove(&cursor);
                self.dropped += 1;
                cursor += 1;
            }
        }
        debug!(dropped = self.dropped, "abandoning frame with unfilled gap");
        self.head = self.packets.keys().next().copied();
        self.await_partition_head = true;
        true
    }
}
