/*
 *  Copyright (c) 2013 The WebRTC project authors. All Rights Reserved.
 *
 *  Use of this source code is governed by a BSD-style license
 *  that can be found in the LICENSE file in the root of the source
 *  tree. An additional intellectual property rights grant can be found
 *  in the file PATENTS.  All contributing project authors may
 *  be found in the AUTHORS file in the root of the source tree.
 */

/// Returns true if `sequence_number` comes after `prev_sequence_number` in
/// 16-bit RTP sequence space.
///
/// Doesn't fulfill strict weak ordering requirements, so it must not be used
/// as a sort comparator.
pub const fn is_newer_sequence_number(sequence_number: u16, prev_sequence_number: u16) -> bool {
    // The breakpoint is the half-way mark of the sequence space.
    const BREAKPOINT: u16 = (u16::MAX >> 1) + 1;
    // Distinguish between elements that are exactly BREAKPOINT apart.
    // If t1>t2 and |t1-t2| = BREAKPOINT: is_newer(t1,t2)=true,
    // is_newer(t2,t1)=false
    match sequence_number.wrapping_sub(prev_sequence_number) {
        1..BREAKPOINT => true,
        BREAKPOINT => sequence_number > prev_sequence_number,
        _ => false,
    }
}

/// Extends 16-bit sequence numbers to a monotonic 64-bit space, following
/// wraparounds in either direction.
#[derive(Debug, Default, Clone, Copy)]
pub struct SequenceUnwrapper {
    last_value: Option<i64>,
}

impl SequenceUnwrapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unwraps `value` relative to the last unwrapped value and remembers it.
    pub fn unwrap(&mut self, value: u16) -> i64 {
        let unwrapped = self.peek(value);
        self.last_value = Some(unwrapped);
        unwrapped
    }

    /// Unwraps `value` without updating the reference point.
    pub fn peek(&self, value: u16) -> i64 {
        match self.last_value {
            Some(last) => unwrap_near(last, value),
            None => value as i64,
        }
    }

    pub fn last_value(&self) -> Option<i64> {
        self.last_value
    }
}

/// Unwraps `value` to the 64-bit sequence number closest to `reference`.
pub fn unwrap_near(reference: i64, value: u16) -> i64 {
    let reference_wrapped = reference.rem_euclid(1 << 16) as u16;
    if is_newer_sequence_number(value, reference_wrapped) {
        reference + value.wrapping_sub(reference_wrapped) as i64
    } else {
        reference - reference_wrapped.wrapping_sub(value) as i64
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn is_newer_sequence_number_equal() {
        assert!(!is_newer_sequence_number(0x0001, 0x0001));
    }

    #[test]
    fn is_newer_sequence_number_no_wrap() {
        assert!(is_newer_sequence_number(0xFFFF, 0xFFFE));
        assert!(is_newer_sequence_number(0x0001, 0x0000));
        assert!(is_newer_sequence_number(0x0100, 0x00FF));
    }

    #[test]
    fn is_newer_sequence_number_forward_wrap() {
        assert!(is_newer_sequence_number(0x0000, 0xFFFF));
        assert!(is_newer_sequence_number(0x0000, 0xFF00));
        assert!(is_newer_sequence_number(0x00FF, 0xFFFF));
        assert!(is_newer_sequence_number(0x00FF, 0xFF00));
    }

    #[test]
    fn is_newer_sequence_number_backward_wrap() {
        assert!(!is_newer_sequence_number(0xFFFF, 0x0000));
        assert!(!is_newer_sequence_number(0xFF00, 0x0000));
        assert!(!is_newer_sequence_number(0xFFFF, 0x00FF));
        assert!(!is_newer_sequence_number(0xFF00, 0x00FF));
    }

    #[test]
    fn is_newer_sequence_number_half_way_apart() {
        assert!(is_newer_sequence_number(0x8000, 0x0000));
        assert!(!is_newer_sequence_number(0x0000, 0x8000));
    }

    #[test]
    fn unwrap_forward_wrap() {
        let mut unwrapper = SequenceUnwrapper::new();
        assert_eq!(unwrapper.unwrap(0xFFFE), 0xFFFE);
        assert_eq!(unwrapper.unwrap(0xFFFF), 0xFFFF);
        assert_eq!(unwrapper.unwrap(0x0000), 0x10000);
        assert_eq!(unwrapper.unwrap(0x0005), 0x10005);
    }

    #[test]
    fn unwrap_backward_across_wrap() {
        let mut unwrapper = SequenceUnwrapper::new();
        unwrapper.unwrap(0xFFFF);
        unwrapper.unwrap(0x0002);
        assert_eq!(unwrapper.peek(0xFFFD), 0xFFFD);
        assert_eq!(unwrapper.last_value(), Some(0x10002));
    }

    #[test]
    fn unwrap_before_zero_goes_negative() {
        let mut unwrapper = SequenceUnwrapper::new();
        unwrapper.unwrap(2);
        assert_eq!(unwrapper.unwrap(0xFFFF), -1);
    }
}
