//! Wire protocol for the supported traffic-controller family.
//!
//! The protocol is a byte-oriented TCP framing scheme: every message is
//! delimited by marker bytes, carries a wrapping sequence number, a 16-bit
//! device address, a declared length, a two-byte command family, and a
//! trailing XOR checksum. Marker bytes occurring inside the payload are
//! escaped by duplication ("stuffing") so the receiver can tell data from
//! framing.
//!
//! - [`frame`] implements the generic framing layer: encode, stuff/destuff,
//!   checksum, and validation.
//! - [`payload`] implements the per-command field layouts and the decoding of
//!   unsolicited status replies.

pub mod frame;
pub mod payload;

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Escape/start marker (DLE).
pub const DLE: u8 = 0xAA;
/// Frame-begin marker (STX).
pub const STX: u8 = 0xBB;
/// Frame-end marker (ETX).
pub const ETX: u8 = 0xCC;
/// Transport-level positive acknowledgement marker.
pub const ACK: u8 = 0xDD;
/// Transport-level negative acknowledgement marker.
pub const NAK: u8 = 0xEE;

/// Fixed header length: DLE, STX, seq, addr(2), len(2), command(2).
pub const HEADER_LEN: usize = 9;
/// Fixed footer length: DLE, ETX, checksum.
pub const FOOTER_LEN: usize = 3;
/// Total length of a transport ACK frame.
pub const ACK_FRAME_LEN: usize = 8;
/// Total length of a transport NAK frame.
pub const NAK_FRAME_LEN: usize = 9;

/// Command families this device family understands.
///
/// The numeric codes are the two command bytes at frame offsets 7 and 8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandId {
    /// 5F10 — select the active control strategy (time-of-day or dynamic).
    EnableStrategy,
    /// 5F14 — push per-subphase extended timings for a plan.
    SetSubphaseExtended,
    /// 5F15 — push plan-level summary (greens, cycle time, offset).
    SetPlanSummary,
    /// 5F18 — activate a previously pushed plan.
    ActivatePlan,
    /// 5F40 — query the active control strategy (replied with 5FC0).
    QueryStrategy,
    /// 5F44 — query per-subphase timings (replied with 5FC4).
    QuerySubphaseExtended,
    /// 5F45 — query plan summary (replied with 5FC5).
    QueryPlanSummary,
}

impl CommandId {
    /// The two wire command bytes.
    pub fn code(self) -> [u8; 2] {
        match self {
            Self::EnableStrategy => [0x5F, 0x10],
            Self::SetSubphaseExtended => [0x5F, 0x14],
            Self::SetPlanSummary => [0x5F, 0x15],
            Self::ActivatePlan => [0x5F, 0x18],
            Self::QueryStrategy => [0x5F, 0x40],
            Self::QuerySubphaseExtended => [0x5F, 0x44],
            Self::QueryPlanSummary => [0x5F, 0x45],
        }
    }

    /// Lower-case hex label used in correlation keys, logs, and audit records.
    pub fn label(self) -> &'static str {
        match self {
            Self::EnableStrategy => "5f10",
            Self::SetSubphaseExtended => "5f14",
            Self::SetPlanSummary => "5f15",
            Self::ActivatePlan => "5f18",
            Self::QueryStrategy => "5f40",
            Self::QuerySubphaseExtended => "5f44",
            Self::QueryPlanSummary => "5f45",
        }
    }

    /// Upper-case message id as used on the pub/sub bridge.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::EnableStrategy => "5F10",
            Self::SetSubphaseExtended => "5F14",
            Self::SetPlanSummary => "5F15",
            Self::ActivatePlan => "5F18",
            Self::QueryStrategy => "5F40",
            Self::QuerySubphaseExtended => "5F44",
            Self::QueryPlanSummary => "5F45",
        }
    }

    /// Look a command up by its two wire bytes.
    pub fn from_code(c1: u8, c2: u8) -> Option<Self> {
        match (c1, c2) {
            (0x5F, 0x10) => Some(Self::EnableStrategy),
            (0x5F, 0x14) => Some(Self::SetSubphaseExtended),
            (0x5F, 0x15) => Some(Self::SetPlanSummary),
            (0x5F, 0x18) => Some(Self::ActivatePlan),
            (0x5F, 0x40) => Some(Self::QueryStrategy),
            (0x5F, 0x44) => Some(Self::QuerySubphaseExtended),
            (0x5F, 0x45) => Some(Self::QueryPlanSummary),
            _ => None,
        }
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Control strategies the device can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlStrategy {
    /// Built-in time-of-day plan table (the device's default mode).
    TimeOfDay = 5,
    /// Adaptive mode where this system owns the active plan.
    Dynamic = 6,
}

impl ControlStrategy {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            5 => Some(Self::TimeOfDay),
            6 => Some(Self::Dynamic),
            _ => None,
        }
    }
}

/// Wrapping sequence counter for outbound frames: 1..=255, never 0.
///
/// One counter is shared across all connections, matching the device
/// vendor's reference behaviour; the sequence only has to be unique among
/// the handful of frames in flight to a single controller.
#[derive(Debug)]
pub struct SequenceCounter {
    current: AtomicU8,
}

impl SequenceCounter {
    pub const fn new() -> Self {
        Self { current: AtomicU8::new(0) }
    }

    /// Next sequence number, wrapping 255 -> 1.
    pub fn next(&self) -> u8 {
        loop {
            let current = self.current.load(Ordering::Relaxed);
            let next = if current >= 255 { 1 } else { current + 1 };
            if self
                .current
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return next;
            }
        }
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_wraps_to_one() {
        let seq = SequenceCounter::new();
        let mut last = 0u8;
        for _ in 0..300 {
            last = seq.next();
            assert!(last >= 1);
        }
        // 300 draws starting at 0: 255 values then wrap to 1 and 45 more.
        assert_eq!(last, 45);
    }

    #[test]
    fn command_codes_round_trip() {
        for cmd in [
            CommandId::EnableStrategy,
            CommandId::SetSubphaseExtended,
            CommandId::SetPlanSummary,
            CommandId::ActivatePlan,
            CommandId::QueryStrategy,
            CommandId::QuerySubphaseExtended,
            CommandId::QueryPlanSummary,
        ] {
            let [c1, c2] = cmd.code();
            assert_eq!(CommandId::from_code(c1, c2), Some(cmd));
        }
        assert_eq!(CommandId::from_code(0x5F, 0xC0), None);
    }
}
