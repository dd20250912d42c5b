use std::fmt;

use crate::api::units::{DataRate, DataSize, TimeDelta, Timestamp};

use super::window::WindowState;

#[derive(Debug, Clone, PartialEq)]
pub struct StreamStatistics {
    pub ssrc: u32,
    pub priority: f64,
    pub target_bitrate: DataRate,
    pub min_bitrate: DataRate,
    pub max_bitrate: DataRate,
    pub transmit_rate: DataRate,
    pub media_rate: DataRate,
    pub bytes_in_flight: DataSize,
    pub bytes_in_queue: DataSize,
    pub packets_in_queue: usize,
    pub rtp_queue_delay: TimeDelta,
    pub packets_transmitted: u64,
    pub bytes_transmitted: DataSize,
    pub frames: u64,
    pub oversize_frames: u64,
    pub queue_delay_reductions: u64,
}

impl fmt::Display for StreamStatistics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "ssrc={} target={:.0}kbps rate={:.0}kbps media={:.0}kbps in_flight={}B queue={}B/{} queue_delay={:.3}s",
            self.ssrc,
            self.target_bitrate.kbps_float(),
            self.transmit_rate.kbps_float(),
            self.media_rate.kbps_float(),
            self.bytes_in_flight.bytes(),
            self.bytes_in_queue.bytes(),
            self.packets_in_queue,
            self.rtp_queue_delay.seconds_float(),
        )
    }
}

/// Snapshot of the controller, taken by [ScreamTx::statistics](super::ScreamTx::statistics).
#[derive(Debug, Clone, PartialEq)]
pub struct Statistics {
    pub time: Timestamp,
    pub state: WindowState,
    pub cwnd: DataSize,
    pub bytes_in_flight: DataSize,
    pub allowed_rate: DataRate,
    pub queue_delay: TimeDelta,
    pub srtt: TimeDelta,
    pub loss_rate: f64,

    pub loss_events: u64,
    pub ecn_events: u64,
    pub window_reductions: u64,
    pub coalesced_events: u64,
    pub malformed_reports: u64,
    pub ignored_feedback: u64,

    pub streams: Vec<StreamStatistics>,
}

impl Statistics {
    pub const CSV_HEADER: &'static str = "time,state,cwnd,bytes_in_flight,allowed_rate,queue_delay,srtt,loss_rate,loss_events,ecn_events,window_reductions,coalesced_events,malformed_reports,ignored_feedback,total_target_bitrate,total_transmit_rate";

    pub fn total_target_bitrate(&self) -> DataRate {
        self.streams
            .iter()
            .fold(DataRate::zero(), |acc, stream| acc + stream.target_bitrate)
    }

    pub fn total_transmit_rate(&self) -> DataRate {
        self.streams
            .iter()
            .fold(DataRate::zero(), |acc, stream| acc + stream.transmit_rate)
    }

    /// One line matching [Statistics::CSV_HEADER]. Times are in seconds, rates in bps.
    pub fn to_csv_row(&self) -> String {
        format!(
            "{:.3},{},{},{},{},{:.4},{:.4},{:.4},{},{},{},{},{},{},{},{}",
            self.time.seconds_float(),
            self.state,
            self.cwnd.bytes(),
            self.bytes_in_flight.bytes(),
            self.allowed_rate.bps(),
            self.queue_delay.seconds_float(),
            self.srtt.seconds_float(),
            self.loss_rate,
            self.loss_events,
            self.ecn_events,
            self.window_reductions,
            self.coalesced_events,
            self.malformed_reports,
            self.ignored_feedback,
            self.total_target_bitrate().bps(),
            self.total_transmit_rate().bps(),
        )
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "time={:.3}s state={} cwnd={}B in_flight={}B rate={:.0}kbps qdelay={:.3}s srtt={:.3}s loss={:.4} loss_events={} ecn_events={} reductions={}",
            self.time.seconds_float(),
            self.state,
            self.cwnd.bytes(),
            self.bytes_in_flight.bytes(),
            self.allowed_rate.kbps_float(),
            self.queue_delay.seconds_float(),
            self.srtt.seconds_float(),
            self.loss_rate,
            self.loss_events,
            self.ecn_events,
            self.window_reductions,
        )?;
        for stream in &self.streams {
            write!(f, " [{}]", stream)?;
        }
        Ok(())
    }
}
