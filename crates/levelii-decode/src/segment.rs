//! Multi-segment message reassembly.
//!
//! Large messages are split into segments that share a sequence number.
//! The segmenter accumulates segments per sequence number and emits the
//! concatenated message once every slot is filled. State is dropped at
//! volume start so partial messages never stitch across volumes.

use crate::message::MessageHeader;
use std::collections::HashMap;

/// A fully reassembled message.
#[derive(Debug, Clone)]
pub struct AssembledMessage {
    pub sequence_num: u16,
    pub msg_type: u8,
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct Pending {
    msg_type: u8,
    segments: Vec<Option<Vec<u8>>>,
    received: u16,
    total_len: usize,
}

/// Reassembles segmented messages keyed by sequence number.
#[derive(Debug)]
pub struct MessageSegmenter {
    pending: HashMap<u16, Pending>,
    max_segments: u16,
}

impl Default for MessageSegmenter {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageSegmenter {
    /// Default cap on segments per message; larger counts are treated
    /// as corruption.
    pub const DEFAULT_MAX_SEGMENTS: u16 = 2000;

    pub fn new() -> Self {
        Self::with_max_segments(Self::DEFAULT_MAX_SEGMENTS)
    }

    pub fn with_max_segments(max_segments: u16) -> Self {
        Self {
            pending: HashMap::new(),
            max_segments,
        }
    }

    /// Feed one segment. Returns the completed message when this
    /// segment fills the last open slot.
    ///
    /// Single-segment messages pass straight through. Segments with an
    /// out-of-range index or an absurd segment count are rejected;
    /// duplicates are idempotent (the first copy wins).
    pub fn add(&mut self, header: &MessageHeader, payload: &[u8]) -> Option<AssembledMessage> {
        if header.num_segments <= 1 {
            return Some(AssembledMessage {
                sequence_num: header.sequence_num,
                msg_type: header.msg_type,
                data: payload.to_vec(),
            });
        }

        if header.num_segments > self.max_segments {
            return None;
        }

        let entry = self
            .pending
            .entry(header.sequence_num)
            .or_insert_with(|| Pending {
                msg_type: header.msg_type,
                segments: vec![None; header.num_segments as usize],
                received: 0,
                total_len: 0,
            });

        let index = header.segment_num as usize;
        if index < 1 || index > entry.segments.len() {
            return None;
        }

        let slot = &mut entry.segments[index - 1];
        if slot.is_none() {
            entry.total_len += payload.len();
            entry.received += 1;
            *slot = Some(payload.to_vec());
        }

        if entry.received as usize == entry.segments.len() {
            let entry = self
                .pending
                .remove(&header.sequence_num)
                .expect("entry exists; just updated");
            let mut data = Vec::with_capacity(entry.total_len);
            for segment in entry.segments {
                data.extend_from_slice(&segment.expect("all slots filled"));
            }
            return Some(AssembledMessage {
                sequence_num: header.sequence_num,
                msg_type: entry.msg_type,
                data,
            });
        }
        None
    }

    /// Drop all in-flight partial messages.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Number of sequence numbers with partial state.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
