//! module for parse UM25C frames

use chrono::{DateTime, Local};
use serde::Serialize;

/// poll command, the meter answers with one frame
pub(crate) const CMD_POLL: u8 = 0xF0;

/// fixed length of a response frame
pub(crate) const FRAME_LEN: usize = 130;

/// number of charge/energy accumulator groups
pub(crate) const GROUP_COUNT: usize = 8;

const OFFSET_VOLTAGE: usize = 2;
const OFFSET_CURRENT: usize = 4;
const OFFSET_POWER: usize = 6;
const OFFSET_TEMP_C: usize = 10;
const OFFSET_TEMP_F: usize = 12;
const OFFSET_GROUPS: usize = 16;
const GROUP_STRIDE: usize = 8;
const OFFSET_DATA_POS: usize = 96;
const OFFSET_DATA_NEG: usize = 98;
const OFFSET_RESISTANCE: usize = 122;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum DecodeError {
    #[error("short frame: got {len} bytes, need {}", FRAME_LEN)]
    ShortFrame { len: usize },
}

/// accumulated charge and energy of one group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub(crate) struct Group {
    pub(crate) charge_mah: u32,
    pub(crate) energy_mwh: u32,
}

/// one decoded measurement
#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct Sample {
    pub(crate) voltage_v: f64,
    pub(crate) current_a: f64,
    pub(crate) power_w: f64,
    pub(crate) temperature_c: i16,
    pub(crate) temperature_f: i16,
    pub(crate) groups: [Group; GROUP_COUNT],
    pub(crate) data_line_pos_v: f64,
    pub(crate) data_line_neg_v: f64,
    pub(crate) resistance_ohm: f64,
    /// local time of decode, the meter does not send one
    pub(crate) captured_at: DateTime<Local>,
}

impl Sample {
    /// energy of the first group, the one shown on the meter by default
    pub(crate) fn energy_mwh(&self) -> u32 {
        return self.groups[0].energy_mwh;
    }
}

fn read_i16(frame: &[u8], offset: usize) -> i16 {
    i16::from_be_bytes([frame[offset], frame[offset + 1]])
}

fn read_u32(frame: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        frame[offset],
        frame[offset + 1],
        frame[offset + 2],
        frame[offset + 3],
    ])
}

/// parser, stamps the sample with the current local time
pub(crate) fn parse_frame(frame: &[u8]) -> Result<Sample, DecodeError> {
    decode_at(frame, Local::now())
}

/// Decodes the first [`FRAME_LEN`] bytes of `frame`.
///
/// Values are taken as the meter sends them, no range checks are done.
/// Anything past the first frame is ignored.
pub(crate) fn decode_at(
    frame: &[u8],
    captured_at: DateTime<Local>,
) -> Result<Sample, DecodeError> {
    if frame.len() < FRAME_LEN {
        return Err(DecodeError::ShortFrame { len: frame.len() });
    }
    let frame = &frame[..FRAME_LEN];

    let mut groups = [Group::default(); GROUP_COUNT];
    for (g, group) in groups.iter_mut().enumerate() {
        let offset = OFFSET_GROUPS + g * GROUP_STRIDE;
        *group = Group {
            charge_mah: read_u32(frame, offset),
            energy_mwh: read_u32(frame, offset + 4),
        };
    }

    return Ok(Sample {
        voltage_v: read_i16(frame, OFFSET_VOLTAGE) as f64 / 1_000_f64,
        current_a: read_i16(frame, OFFSET_CURRENT) as f64 / 10_000_f64,
        power_w: read_u32(frame, OFFSET_POWER) as f64 / 1_000_f64,
        temperature_c: read_i16(frame, OFFSET_TEMP_C),
        temperature_f: read_i16(frame, OFFSET_TEMP_F),
        groups,
        data_line_pos_v: read_i16(frame, OFFSET_DATA_POS) as f64 / 100_f64,
        data_line_neg_v: read_i16(frame, OFFSET_DATA_NEG) as f64 / 100_f64,
        resistance_ohm: read_u32(frame, OFFSET_RESISTANCE) as f64 / 10_f64,
        captured_at,
    });
}
