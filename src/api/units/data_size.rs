/*
 *  Copyright (c) 2019 The WebRTC project authors. All Rights Reserved.
 *
 *  Use of this source code is governed by a BSD-style license
 *  that can be found in the LICENSE file in the root of the source
 *  tree. An additional intellectual property rights grant can be found
 *  in the file PATENTS.  All contributing project authors may
 *  be found in the AUTHORS file in the root of the source tree.
 */

use std::fmt;

super::relative_unit!(DataSize);

/// A byte count: packet and frame sizes, queue occupancy, the congestion window
/// and bytes in flight. Never negative, so subtracting a larger size panics.
impl DataSize {
    const ONE_SIDED: bool = true;

    pub const fn from_bytes(value: i64) -> Self {
        Self::from_value(value)
    }

    /// Rounds to the nearest byte.
    pub fn from_bytes_float(value: f64) -> Self {
        Self::from_value_float(value.round())
    }

    pub const fn bytes(&self) -> i64 {
        self.to_value()
    }

    pub fn bytes_float(&self) -> f64 {
        self.to_value_float()
    }

    // Rate conversions work in bits times microseconds to stay in integers.
    pub(super) const fn microbits(&self) -> i64 {
        const MAX_BEFORE_CONVERSION: i64 = i64::MAX / 8_000_000;
        assert!(
            self.bytes() <= MAX_BEFORE_CONVERSION,
            "size is too large to be expressed in microbits"
        );
        self.bytes() * 8_000_000
    }
}

impl fmt::Debug for DataSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_plus_infinity() {
            write!(f, "+inf B")
        } else {
            write!(f, "{} B", self.bytes())
        }
    }
}
