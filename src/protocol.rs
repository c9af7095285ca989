use bytes::Buf;
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// Flags bit 0: cumulative wheel revolutions and last wheel event time follow
pub const FLAG_WHEEL_DATA_PRESENT: u8 = 0x01;

/// Flags bit 1: cumulative crank revolutions and last crank event time follow
pub const FLAG_CRANK_DATA_PRESENT: u8 = 0x02;

/// Wheel revolution data size in bytes (u32 revolutions + u16 event time)
pub const WHEEL_DATA_SIZE: usize = 6;

/// Crank revolution data size in bytes (u16 revolutions + u16 event time)
pub const CRANK_DATA_SIZE: usize = 4;

/// Event time ticks per second (event times are in 1/1024 s)
pub const EVENT_TIME_TICKS_PER_SECOND: f64 = 1024.0;

/// Crank revolution data block of a CSC Measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrankData {
    /// Cumulative crank revolutions, wraps at 65536
    pub cumulative_revolutions: u16,
    /// Time of the last crank event in 1/1024 s, wraps at 65536
    pub last_event_time: u16,
}

/// Decoded CSC Measurement notification
///
/// Wire layout (all fields little-endian):
/// - Byte 0: flags (bit 0 = wheel data present, bit 1 = crank data present)
/// - If wheel data present: u32 cumulative wheel revolutions, u16 last wheel event time
/// - If crank data present: u16 cumulative crank revolutions, u16 last crank event time
///
/// Wheel values are skipped; only their presence is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CscMeasurement {
    /// Wheel revolution data was present in the packet
    pub wheel_data_present: bool,
    /// Crank revolution data, present only if flagged
    pub crank: Option<CrankData>,
}

impl CscMeasurement {
    /// Parse a measurement from raw notification bytes
    ///
    /// # Errors
    ///
    /// See [`decode`].
    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        decode(data)
    }

    /// Whether crank revolution data was present
    #[must_use]
    pub const fn crank_data_present(&self) -> bool {
        self.crank.is_some()
    }

    /// Cumulative crank revolutions, if crank data was present
    #[must_use]
    pub fn cumulative_crank_revolutions(&self) -> Option<u16> {
        self.crank.map(|c| c.cumulative_revolutions)
    }

    /// Last crank event time in 1/1024 s, if crank data was present
    #[must_use]
    pub fn last_crank_event_time(&self) -> Option<u16> {
        self.crank.map(|c| c.last_event_time)
    }
}

/// Decode a CSC Measurement notification
///
/// Pure and deterministic. Trailing bytes beyond the flagged fields are ignored.
///
/// # Errors
///
/// - [`DecodeError::EmptyBuffer`] if `data` is empty
/// - [`DecodeError::TruncatedWheelData`] if wheel data is flagged but fewer than 6 bytes follow
/// - [`DecodeError::TruncatedCrankData`] if crank data is flagged but fewer than 4 bytes remain
pub fn decode(data: &[u8]) -> Result<CscMeasurement, DecodeError> {
    let mut buf = data;

    if !buf.has_remaining() {
        return Err(DecodeError::EmptyBuffer);
    }

    let flags = buf.get_u8();
    let wheel_data_present = flags & FLAG_WHEEL_DATA_PRESENT != 0;
    let crank_data_present = flags & FLAG_CRANK_DATA_PRESENT != 0;

    if wheel_data_present {
        if buf.remaining() < WHEEL_DATA_SIZE {
            return Err(DecodeError::TruncatedWheelData {
                remaining: buf.remaining(),
            });
        }
        buf.advance(WHEEL_DATA_SIZE);
    }

    let crank = if crank_data_present {
        if buf.remaining() < CRANK_DATA_SIZE {
            return Err(DecodeError::TruncatedCrankData {
                remaining: buf.remaining(),
            });
        }
        Some(CrankData {
            cumulative_revolutions: buf.get_u16_le(),
            last_event_time: buf.get_u16_le(),
        })
    } else {
        None
    };

    Ok(CscMeasurement {
        wheel_data_present,
        crank,
    })
}
