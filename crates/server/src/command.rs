// Copyright 2025-2026 CEMAXECUTER LLC

//! Translation from raw command frames to typed controller commands.

use rk_driver::{DirectSampling, GainMode};

use crate::wire::{cmd, CommandFrame};

/// A validated client command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SetCenterFreq(u32),
    SetSampleRate(u32),
    SetGainMode(GainMode),
    /// Tenths of a dB; the controller snaps it to the tuner's gain table.
    SetTunerGain(i32),
    SetFreqCorrection(i32),
    SetIfGain { stage: i32, tenth_db: i32 },
    SetTestMode(bool),
    SetAgcMode(bool),
    SetDirectSampling(DirectSampling),
    SetOffsetTuning(bool),
    SetXtalFreq(u32),
    SetTunerGainIndex(u32),
    SetBiasTee(bool),
}

impl Command {
    /// Translate a raw frame. `None` means the code (or its parameter) is
    /// not one this server understands; such frames are dropped without
    /// closing the socket, matching the reference server.
    pub fn from_frame(frame: CommandFrame) -> Option<Command> {
        let p = frame.param;
        match frame.code {
            cmd::SET_CENTER_FREQ => Some(Command::SetCenterFreq(p)),
            cmd::SET_SAMPLE_RATE => Some(Command::SetSampleRate(p)),
            cmd::SET_GAIN_MODE => Some(Command::SetGainMode(if p == 0 {
                GainMode::Auto
            } else {
                GainMode::Manual
            })),
            cmd::SET_TUNER_GAIN => Some(Command::SetTunerGain(p as i32)),
            cmd::SET_FREQ_CORRECTION => Some(Command::SetFreqCorrection(p as i32)),
            // high half is the stage index, low half a signed gain
            cmd::SET_IF_GAIN => Some(Command::SetIfGain {
                stage: (p >> 16) as i32,
                tenth_db: (p & 0xFFFF) as u16 as i16 as i32,
            }),
            cmd::SET_TEST_MODE => Some(Command::SetTestMode(p != 0)),
            cmd::SET_AGC_MODE => Some(Command::SetAgcMode(p != 0)),
            cmd::SET_DIRECT_SAMPLING => {
                DirectSampling::from_param(p).map(Command::SetDirectSampling)
            }
            cmd::SET_OFFSET_TUNING => Some(Command::SetOffsetTuning(p != 0)),
            cmd::SET_XTAL_FREQ => Some(Command::SetXtalFreq(p)),
            cmd::SET_TUNER_GAIN_INDEX => Some(Command::SetTunerGainIndex(p)),
            cmd::SET_BIAS_TEE => Some(Command::SetBiasTee(p != 0)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translate(code: u8, param: u32) -> Option<Command> {
        Command::from_frame(CommandFrame { code, param })
    }

    #[test]
    fn test_freq_and_rate() {
        assert_eq!(
            translate(0x01, 100_000_000),
            Some(Command::SetCenterFreq(100_000_000))
        );
        assert_eq!(
            translate(0x02, 2_048_000),
            Some(Command::SetSampleRate(2_048_000))
        );
    }

    #[test]
    fn test_gain_mode() {
        assert_eq!(
            translate(0x03, 0),
            Some(Command::SetGainMode(GainMode::Auto))
        );
        assert_eq!(
            translate(0x03, 1),
            Some(Command::SetGainMode(GainMode::Manual))
        );
        assert_eq!(
            translate(0x03, 0xFFFF),
            Some(Command::SetGainMode(GainMode::Manual))
        );
    }

    #[test]
    fn test_ppm_sign() {
        assert_eq!(
            translate(0x05, 0xFFFF_FFFF),
            Some(Command::SetFreqCorrection(-1))
        );
        assert_eq!(translate(0x05, 60), Some(Command::SetFreqCorrection(60)));
    }

    #[test]
    fn test_if_gain_split() {
        // stage 1, -10 tenths of a dB
        assert_eq!(
            translate(0x06, 0x0001_FFF6),
            Some(Command::SetIfGain {
                stage: 1,
                tenth_db: -10
            })
        );
        assert_eq!(
            translate(0x06, 0x0006_0014),
            Some(Command::SetIfGain {
                stage: 6,
                tenth_db: 20
            })
        );
    }

    #[test]
    fn test_direct_sampling() {
        assert_eq!(
            translate(0x09, 2),
            Some(Command::SetDirectSampling(DirectSampling::QBranch))
        );
        // out-of-range branch parameter is dropped
        assert_eq!(translate(0x09, 5), None);
    }

    #[test]
    fn test_unknown_codes() {
        assert_eq!(translate(0x00, 0), None);
        assert_eq!(translate(0x0C, 0), None);
        assert_eq!(translate(0xFF, 0), None);
    }
}
