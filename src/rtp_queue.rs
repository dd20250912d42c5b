use std::collections::VecDeque;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    api::units::{is_newer_sequence_number, DataSize, TimeDelta, Timestamp},
    Error, Result,
};

/// One RTP packet waiting for transmission.
#[derive(Debug, Clone, PartialEq)]
pub struct RtpQueueItem {
    pub sequence_number: u16,
    pub size: DataSize,
    pub enqueue_time: Timestamp,
    pub is_marker: bool,
    pub transmitted: bool,
    pub retransmissions: u32,
    // The serialized RTP packet, opaque to the queue.
    pub packet: Bytes,
}

impl RtpQueueItem {
    pub fn new(sequence_number: u16, packet: Bytes, enqueue_time: Timestamp, is_marker: bool) -> Self {
        Self {
            sequence_number,
            size: DataSize::from_bytes(packet.len() as i64),
            enqueue_time,
            is_marker,
            transmitted: false,
            retransmissions: 0,
            packet,
        }
    }

    /// An item that only carries its size, for callers that keep payloads elsewhere.
    pub fn with_size(
        sequence_number: u16,
        size: DataSize,
        enqueue_time: Timestamp,
        is_marker: bool,
    ) -> Self {
        Self {
            sequence_number,
            size,
            enqueue_time,
            is_marker,
            transmitted: false,
            retransmissions: 0,
            packet: Bytes::new(),
        }
    }
}

#[derive(Debug, Default)]
struct RtpQueueState {
    items: VecDeque<RtpQueueItem>,
    bytes_in_queue: i64,
    last_sequence_number: Option<u16>,
    // Bytes enqueued since the last marker packet.
    current_frame_bytes: i64,
    last_frame_size: i64,
}

/// FIFO of outgoing RTP packets for one stream.
///
/// The producer thread enqueues while the sender thread drains, so all state
/// sits behind a lock and every method takes `&self`. Capacity is unbounded,
/// dropping packets is left to the controller.
#[derive(Debug, Default)]
pub struct RtpQueue {
    state: Mutex<RtpQueueState>,
}

impl RtpQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, item: RtpQueueItem) {
        let mut state = self.state.lock();

        if let Some(last) = state.last_sequence_number {
            if !is_newer_sequence_number(item.sequence_number, last) {
                tracing::warn!(
                    "Enqueued sequence number {} does not follow {}",
                    item.sequence_number,
                    last
                );
            }
        }

        let size = item.size.bytes();
        state.bytes_in_queue += size;
        state.current_frame_bytes += size;
        if item.is_marker {
            state.last_frame_size = state.current_frame_bytes;
            state.current_frame_bytes = 0;
        }
        state.last_sequence_number = Some(item.sequence_number);
        state.items.push_back(item);
    }

    /// Puts a previously dequeued packet back at the head of the queue for retransmission.
    pub fn requeue_front(&self, mut item: RtpQueueItem) {
        let mut state = self.state.lock();
        item.transmitted = false;
        item.retransmissions += 1;
        state.bytes_in_queue += item.size.bytes();
        state.items.push_front(item);
    }

    pub fn peek_next(&self) -> Option<RtpQueueItem> {
        self.state.lock().items.front().cloned()
    }

    pub fn dequeue_next(&self) -> Result<RtpQueueItem> {
        let mut state = self.state.lock();
        let mut item = state.items.pop_front().ok_or(Error::QueueEmpty)?;
        state.bytes_in_queue -= item.size.bytes();
        item.transmitted = true;
        Ok(item)
    }

    /// Discards everything and returns the number of dropped items.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.items.len();
        *state = RtpQueueState::default();
        dropped
    }

    pub fn bytes_in_queue(&self) -> DataSize {
        DataSize::from_bytes(self.state.lock().bytes_in_queue)
    }

    pub fn size_of_queue(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn size_of_next_item(&self) -> Option<DataSize> {
        self.state.lock().items.front().map(|item| item.size)
    }

    pub fn seq_nr_of_next_item(&self) -> Option<u16> {
        self.state
            .lock()
            .items
            .front()
            .map(|item| item.sequence_number)
    }

    pub fn seq_nr_of_last_item(&self) -> Option<u16> {
        self.state.lock().last_sequence_number
    }

    /// Age of the oldest queued packet, zero when empty.
    pub fn delay(&self, now: Timestamp) -> TimeDelta {
        match self.state.lock().items.front() {
            Some(item) => (now - item.enqueue_time).max(TimeDelta::zero()),
            None => TimeDelta::zero(),
        }
    }

    pub fn size_of_last_frame(&self) -> DataSize {
        DataSize::from_bytes(self.state.lock().last_frame_size)
    }
}
