/*
 *  Copyright (c) 2018 The WebRTC project authors. All Rights Reserved.
 *
 *  Use of this source code is governed by a BSD-style license
 *  that can be found in the LICENSE file in the root of the source
 *  tree. An additional intellectual property rights grant can be found
 *  in the file PATENTS.  All contributing project authors may
 *  be found in the AUTHORS file in the root of the source tree.
 */

//! A point in time on the caller's clock, in microseconds.
//!
//! The controller never reads a clock itself: every operation takes the current
//! time as a Timestamp, so the sender and receiver can run on a simulated clock.
//! Subtracting two Timestamps yields a [TimeDelta].
super::unit_base!(Timestamp);

use std::fmt;
use std::ops::*;

use super::TimeDelta;

impl Timestamp {
    const ONE_SIDED: bool = false;

    pub const fn from_seconds(value: i64) -> Self {
        Self::from_fraction(1_000_000, value)
    }

    pub const fn from_millis(value: i64) -> Self {
        Self::from_fraction(1_000, value)
    }

    pub const fn from_micros(value: i64) -> Self {
        Self::from_value(value)
    }

    pub fn seconds_float(&self) -> f64 {
        self.to_fraction_float(1_000_000.0)
    }

    pub const fn ms(&self) -> i64 {
        self.to_fraction(1_000)
    }

    pub const fn us(&self) -> i64 {
        self.to_value()
    }
}

// Infinite operands saturate the result. `rhs_plus`/`rhs_minus` describe the
// right operand as it contributes to the result, so subtraction swaps them.
fn saturated(lhs_plus: bool, lhs_minus: bool, rhs_plus: bool, rhs_minus: bool) -> Option<bool> {
    let plus = lhs_plus || rhs_plus;
    let minus = lhs_minus || rhs_minus;
    assert!(!(plus && minus), "opposite infinities in time arithmetic");
    match (plus, minus) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

impl Add<TimeDelta> for Timestamp {
    type Output = Self;

    fn add(self, delta: TimeDelta) -> Self {
        match saturated(
            self.is_plus_infinity(),
            self.is_minus_infinity(),
            delta.is_plus_infinity(),
            delta.is_minus_infinity(),
        ) {
            Some(true) => Self::plus_infinity(),
            Some(false) => Self::minus_infinity(),
            None => Self::from_micros(self.us() + delta.us()),
        }
    }
}

impl Sub<TimeDelta> for Timestamp {
    type Output = Self;

    fn sub(self, delta: TimeDelta) -> Self {
        match saturated(
            self.is_plus_infinity(),
            self.is_minus_infinity(),
            delta.is_minus_infinity(),
            delta.is_plus_infinity(),
        ) {
            Some(true) => Self::plus_infinity(),
            Some(false) => Self::minus_infinity(),
            None => Self::from_micros(self.us() - delta.us()),
        }
    }
}

impl Sub for Timestamp {
    type Output = TimeDelta;

    fn sub(self, earlier: Self) -> TimeDelta {
        match saturated(
            self.is_plus_infinity(),
            self.is_minus_infinity(),
            earlier.is_minus_infinity(),
            earlier.is_plus_infinity(),
        ) {
            Some(true) => TimeDelta::plus_infinity(),
            Some(false) => TimeDelta::minus_infinity(),
            None => TimeDelta::from_micros(self.us() - earlier.us()),
        }
    }
}

impl AddAssign<TimeDelta> for Timestamp {
    fn add_assign(&mut self, delta: TimeDelta) {
        *self = *self + delta;
    }
}

impl SubAssign<TimeDelta> for Timestamp {
    fn sub_assign(&mut self, delta: TimeDelta) {
        *self = *self - delta;
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_plus_infinity() {
            write!(f, "+inf")
        } else if self.is_minus_infinity() {
            write!(f, "-inf")
        } else {
            write!(f, "{:.6} s", self.seconds_float())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn send_and_arrival() {
        let sent = Timestamp::from_millis(10_250);
        let one_way = TimeDelta::from_millis(25);
        let arrived = sent + one_way;

        assert_eq!(arrived.ms(), 10_275);
        assert_eq!(arrived - sent, one_way);
        assert_eq!(sent - arrived, -one_way);
        assert_eq!(arrived - one_way, sent);
        assert_eq!(Timestamp::from_seconds(3).us(), 3_000_000);

        let mut now = sent;
        now += one_way;
        assert_eq!(now, arrived);
        now -= one_way * 2i64;
        assert!(now < sent);
    }

    #[test]
    fn infinity_saturates() {
        let now = Timestamp::from_millis(100);
        let delta = TimeDelta::from_millis(100);
        assert!((Timestamp::plus_infinity() + delta).is_plus_infinity());
        assert!((now + TimeDelta::plus_infinity()).is_plus_infinity());
        assert!((now - TimeDelta::plus_infinity()).is_minus_infinity());
        assert!((Timestamp::plus_infinity() - now).is_plus_infinity());
        assert!((now - Timestamp::minus_infinity()).is_plus_infinity());
        assert!((now - Timestamp::plus_infinity()).is_minus_infinity());
    }

    #[test]
    #[should_panic]
    fn opposite_infinities_panic() {
        let _ = Timestamp::plus_infinity() - Timestamp::plus_infinity();
    }

    #[test]
    fn debug_format() {
        assert_eq!(format!("{:?}", Timestamp::from_millis(1500)), "1.500000 s");
        assert_eq!(format!("{:?}", Timestamp::plus_infinity()), "+inf");
    }
}
