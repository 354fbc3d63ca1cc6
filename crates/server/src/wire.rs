// Copyright 2025-2026 CEMAXECUTER LLC

//! rtl_tcp wire format: a 12-byte greeting, then raw interleaved I/Q
//! bytes server-to-client, with fixed 5-byte command frames in the other
//! direction. No framing metadata anywhere else.

use byteorder::{BigEndian, ByteOrder};
use rk_driver::TunerKind;

pub const GREETING_MAGIC: &[u8; 4] = b"RTL0";
pub const GREETING_LEN: usize = 12;
pub const CMD_FRAME_LEN: usize = 5;

/// Command codes, matching the reference rtl_tcp server.
pub mod cmd {
    pub const SET_CENTER_FREQ: u8 = 0x01;
    pub const SET_SAMPLE_RATE: u8 = 0x02;
    pub const SET_GAIN_MODE: u8 = 0x03;
    pub const SET_TUNER_GAIN: u8 = 0x04;
    pub const SET_FREQ_CORRECTION: u8 = 0x05;
    pub const SET_IF_GAIN: u8 = 0x06;
    pub const SET_TEST_MODE: u8 = 0x07;
    pub const SET_AGC_MODE: u8 = 0x08;
    pub const SET_DIRECT_SAMPLING: u8 = 0x09;
    pub const SET_OFFSET_TUNING: u8 = 0x0A;
    pub const SET_XTAL_FREQ: u8 = 0x0B;
    pub const SET_TUNER_GAIN_INDEX: u8 = 0x0D;
    pub const SET_BIAS_TEE: u8 = 0x0E;
}

/// 12-byte preamble sent once per connection, before any sample byte:
/// ASCII magic, tuner type code, gain table length. Multi-byte fields are
/// network byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Greeting {
    pub tuner: TunerKind,
    pub gain_count: u32,
}

impl Greeting {
    pub fn encode(&self) -> [u8; GREETING_LEN] {
        let mut buf = [0u8; GREETING_LEN];
        buf[..4].copy_from_slice(GREETING_MAGIC);
        BigEndian::write_u32(&mut buf[4..8], self.tuner.code());
        BigEndian::write_u32(&mut buf[8..12], self.gain_count);
        buf
    }
}

/// One command frame: code byte plus big-endian u32 parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame {
    pub code: u8,
    pub param: u32,
}

impl CommandFrame {
    pub fn decode(raw: &[u8; CMD_FRAME_LEN]) -> Self {
        Self {
            code: raw[0],
            param: BigEndian::read_u32(&raw[1..5]),
        }
    }
}
