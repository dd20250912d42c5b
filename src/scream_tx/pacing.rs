use crate::api::units::{DataRate, DataSize, TimeDelta, Timestamp};

/// Per-stream transmit budget, refilled at the pacing rate.
///
/// Unused budget builds up to one window's worth of data, so a stream that was
/// quiet may send a short burst. Overuse is carried into the next interval, up
/// to one window of debt.
#[derive(Debug, Clone)]
pub struct IntervalBudget {
    target_rate: DataRate,
    window: TimeDelta,
    max_bytes_in_budget: i64,
    bytes_remaining: i64,
    last_update: Option<Timestamp>,
}

impl IntervalBudget {
    pub fn new(initial_target_rate: DataRate, window: TimeDelta) -> Self {
        let mut this = Self {
            target_rate: DataRate::zero(),
            window,
            max_bytes_in_budget: 0,
            bytes_remaining: 0,
            last_update: None,
        };
        this.set_target_rate(initial_target_rate);
        this
    }

    pub fn set_target_rate(&mut self, target_rate: DataRate) {
        self.target_rate = target_rate;
        self.max_bytes_in_budget = (target_rate * self.window).bytes();
        self.bytes_remaining = self
            .bytes_remaining
            .clamp(-self.max_bytes_in_budget, self.max_bytes_in_budget);
    }

    pub fn target_rate(&self) -> DataRate {
        self.target_rate
    }

    pub fn increase_budget(&mut self, delta_time: TimeDelta) {
        self.bytes_remaining = self.accrued(delta_time);
    }

    /// Refills the budget for the time elapsed since the previous call.
    pub fn advance(&mut self, now: Timestamp) {
        match self.last_update {
            Some(last) if now > last => self.increase_budget(now - last),
            Some(_) => {}
            // A fresh budget starts full.
            None => self.bytes_remaining = self.max_bytes_in_budget,
        }
        if self.last_update.map_or(true, |last| now > last) {
            self.last_update = Some(now);
        }
    }

    pub fn use_budget(&mut self, now: Timestamp, size: DataSize) {
        self.advance(now);
        self.bytes_remaining = (self.bytes_remaining - size.bytes()).max(-self.max_bytes_in_budget);
    }

    /// Budget available at `now` without committing the refill.
    pub fn remaining_at(&self, now: Timestamp) -> i64 {
        match self.last_update {
            Some(last) if now > last => self.accrued(now - last),
            Some(_) => self.bytes_remaining,
            None => self.max_bytes_in_budget,
        }
    }

    /// Time until the budget turns positive again, zero if it already is.
    pub fn time_until_available(&self, now: Timestamp) -> TimeDelta {
        let remaining = self.remaining_at(now);
        if remaining > 0 {
            return TimeDelta::zero();
        }
        if self.target_rate.is_zero() {
            return self.window;
        }
        let deficit = DataSize::from_bytes(1 - remaining);
        (deficit / self.target_rate).max(TimeDelta::from_micros(1))
    }

    fn accrued(&self, delta_time: TimeDelta) -> i64 {
        let bytes = (self.target_rate * delta_time).bytes();
        (self.bytes_remaining + bytes).min(self.max_bytes_in_budget)
    }
}
