use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    api::units::{DataRate, DataSize, TimeDelta, Timestamp},
    config::ScreamTxConfig,
    feedback::FeedbackReport,
    rtcp::PictureLossIndication,
    rtp_queue::RtpQueue,
    scream_tx::{ScreamTx, Statistics},
    Result,
};

/// A [ScreamTx] shared between encoder threads, the sender thread and the
/// feedback thread.
///
/// Every call takes the same lock, so window and stream updates are applied one
/// at a time. Clones refer to the same controller.
#[derive(Debug, Clone)]
pub struct SharedScreamTx {
    inner: Arc<Mutex<ScreamTx>>,
}

impl SharedScreamTx {
    pub fn new(config: ScreamTxConfig) -> Self {
        Self::from(ScreamTx::new(config))
    }

    pub fn register_stream(
        &self,
        queue: Arc<RtpQueue>,
        ssrc: u32,
        priority: f64,
        min_bitrate: DataRate,
        max_bitrate: DataRate,
        start_bitrate: DataRate,
    ) -> Result<()> {
        self.inner.lock().register_stream(
            queue,
            ssrc,
            priority,
            min_bitrate,
            max_bitrate,
            start_bitrate,
        )
    }

    pub fn deregister_stream(&self, ssrc: u32) -> Result<Arc<RtpQueue>> {
        self.inner.lock().deregister_stream(ssrc)
    }

    pub fn new_media_frame(
        &self,
        now: Timestamp,
        ssrc: u32,
        size: DataSize,
        is_marker: bool,
    ) -> Result<()> {
        self.inner.lock().new_media_frame(now, ssrc, size, is_marker)
    }

    pub fn is_ok_to_transmit(&self, now: Timestamp, ssrc: u32) -> Result<TimeDelta> {
        self.inner.lock().is_ok_to_transmit(now, ssrc)
    }

    pub fn add_transmitted(
        &self,
        now: Timestamp,
        ssrc: u32,
        size: DataSize,
        sequence_number: u16,
        is_marker: bool,
    ) -> Result<TimeDelta> {
        self.inner
            .lock()
            .add_transmitted(now, ssrc, size, sequence_number, is_marker)
    }

    pub fn incoming_feedback(&self, now: Timestamp, report: &FeedbackReport) -> Result<()> {
        self.inner.lock().incoming_feedback(now, report)
    }

    pub fn incoming_feedback_buf(
        &self,
        now: Timestamp,
        buf: &[u8],
    ) -> Result<Vec<PictureLossIndication>> {
        self.inner.lock().incoming_feedback_buf(now, buf)
    }

    pub fn target_bitrate(&self, now: Timestamp, ssrc: u32) -> Result<DataRate> {
        self.inner.lock().target_bitrate(now, ssrc)
    }

    pub fn statistics(&self, now: Timestamp) -> Statistics {
        self.inner.lock().statistics(now)
    }

    /// Runs `f` with the controller locked, for several calls that must not
    /// interleave with other threads.
    pub fn with<R>(&self, f: impl FnOnce(&mut ScreamTx) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

impl From<ScreamTx> for SharedScreamTx {
    fn from(tx: ScreamTx) -> Self {
        Self {
            inner: Arc::new(Mutex::new(tx)),
        }
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use test_trace::test;

    use super::*;
    use crate::{
        api::transport::EcnMarking,
        feedback::{ntp_short, PacketReport, StreamReport},
        rtp_queue::RtpQueueItem,
        Error,
    };

    fn kbps(value: i64) -> DataRate {
        DataRate::from_kilobits_per_sec(value)
    }

    #[test]
    fn clones_share_state() {
        let tx = SharedScreamTx::new(ScreamTxConfig::default());
        let other = tx.clone();
        tx.register_stream(Arc::new(RtpQueue::new()), 1, 1.0, kbps(100), kbps(1000), kbps(300))
            .unwrap();

        assert_eq!(other.target_bitrate(Timestamp::from_seconds(1), 1), Ok(kbps(300)));
        assert_eq!(
            other.register_stream(Arc::new(RtpQueue::new()), 1, 1.0, kbps(100), kbps(1000), kbps(300)),
            Err(Error::DuplicateRegistration(1))
        );
        other.deregister_stream(1).unwrap();
        assert_eq!(tx.with(|tx| tx.stream_count()), 0);
    }

    #[test]
    fn sender_and_feedback_threads() {
        const PACKETS: u16 = 200;

        let tx = SharedScreamTx::new(ScreamTxConfig::default());
        let queue = Arc::new(RtpQueue::new());
        tx.register_stream(queue.clone(), 7, 1.0, kbps(100), kbps(2000), kbps(500))
            .unwrap();

        let producer = {
            let queue = queue.clone();
            let tx = tx.clone();
            thread::spawn(move || {
                for seq in 0..PACKETS {
                    let now = Timestamp::from_millis(1000 + seq as i64);
                    let size = DataSize::from_bytes(500);
                    queue.enqueue(RtpQueueItem::with_size(seq, size, now, true));
                    tx.new_media_frame(now, 7, size, true).unwrap();
                }
            })
        };
        producer.join().unwrap();

        let sender = {
            let tx = tx.clone();
            thread::spawn(move || {
                let mut sent = 0;
                while let Ok(item) = queue.dequeue_next() {
                    let now = Timestamp::from_millis(1000 + item.sequence_number as i64);
                    tx.add_transmitted(now, 7, item.size, item.sequence_number, true)
                        .unwrap();
                    sent += 1;
                }
                sent
            })
        };

        let feedback = {
            let tx = tx.clone();
            thread::spawn(move || {
                let now = Timestamp::from_millis(1000 + PACKETS as i64 + 50);
                let report_timestamp = ntp_short(now);
                let report = FeedbackReport {
                    sender_ssrc: 99,
                    report_timestamp,
                    streams: vec![StreamReport {
                        media_ssrc: 7,
                        begin_seq: 0,
                        reports: vec![
                            PacketReport::received(EcnMarking::Ect1, report_timestamp, report_timestamp);
                            PACKETS as usize
                        ],
                    }],
                };
                // Packets not yet recorded as sent are skipped, not an error.
                tx.incoming_feedback(now, &report).unwrap();
            })
        };

        assert_eq!(sender.join().unwrap(), PACKETS);
        feedback.join().unwrap();

        let stats = tx.statistics(Timestamp::from_millis(2000));
        assert_eq!(stats.streams[0].packets_transmitted, PACKETS as u64);
        assert_eq!(stats.malformed_reports, 0);
        let resolved = PACKETS as usize - tx.with(|tx| tx.packets_in_flight());
        assert_eq!(
            stats.ignored_feedback + resolved as u64,
            PACKETS as u64
        );
    }
}
