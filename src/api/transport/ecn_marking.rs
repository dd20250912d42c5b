/*
 *  Copyright 2024 The WebRTC Project Authors. All rights reserved.
 *
 *  Use of this source code is governed by a BSD-style license
 *  that can be found in the LICENSE file in the root of the source
 *  tree. An additional intellectual property rights grant can be found
 *  in the file PATENTS.  All contributing project authors may
 *  be found in the AUTHORS file in the root of the source tree.
 */

// Explicit Congestion Notification (ECN).
// https://www.rfc-editor.org/rfc/rfc9331.html ECT stands for ECN-Capable
// Transport and CE stands for Congestion Experienced.

// RFC-3168, Section 5
// +-----+-----+
// | ECN FIELD |
// +-----+-----+
//   ECT   CE         [Obsolete] RFC 2481 names for the ECN bits.
//    0     0         Not-ECT
//    0     1         ECT(1)
//    1     0         ECT(0)
//    1     1         CE

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum EcnMarking {
    #[default]
    NotEct = 0, // Not ECN-Capable Transport
    Ect1 = 1, // ECN-Capable Transport, L4S
    Ect0 = 2, // ECN-Capable Transport, classic
    Ce = 3,   // Congestion experienced
}

impl EcnMarking {
    /// Decodes the two low bits of the IP TOS / traffic class byte.
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => EcnMarking::NotEct,
            1 => EcnMarking::Ect1,
            2 => EcnMarking::Ect0,
            _ => EcnMarking::Ce,
        }
    }

    pub const fn bits(self) -> u8 {
        self as u8
    }

    pub const fn is_congestion_experienced(self) -> bool {
        matches!(self, EcnMarking::Ce)
    }
}
