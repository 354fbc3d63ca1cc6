// Copyright 2025-2026 CEMAXECUTER LLC

//! Deterministic in-process backend for hardware-free testing.
//!
//! The mock produces a configurable byte pattern at a configurable pace and
//! records every parameter mutation in arrival order, so tests can assert
//! exactly which driver calls a wire command translated into.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::{
    DirectSampling, DriverError, GainMode, RadioBackend, RadioDevice, Result, SampleBuf, TunerKind,
};

/// R820T gain table in tenths of a dB (29 steps).
pub const R820T_GAINS: &[i32] = &[
    0, 9, 14, 27, 37, 77, 87, 125, 144, 157, 166, 197, 207, 229, 254, 280, 297, 328, 338, 364,
    372, 386, 402, 421, 434, 439, 445, 480, 496,
];

/// Payload the mock device streams.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Monotonically increasing u32 counter, little-endian in the byte
    /// stream. Block length must be a multiple of 4.
    Counter,
    /// Every byte set to the same value.
    Fill(u8),
}

/// One recorded parameter mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverCall {
    CenterFreq(u32),
    SampleRate(u32),
    GainMode(GainMode),
    TunerGain(i32),
    FreqCorrection(i32),
    IfGain { stage: i32, tenth_db: i32 },
    AgcMode(bool),
    DirectSampling(DirectSampling),
    OffsetTuning(bool),
    BiasTee(bool),
    TunerBandwidth(u32),
    ResetBuffer,
}

#[derive(Debug, Clone)]
pub struct MockConfig {
    pub tuner: TunerKind,
    pub gains: Vec<i32>,
    pub serial: String,
    pub block_len: usize,
    pub block_interval: Duration,
    pub pattern: Pattern,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            tuner: TunerKind::R820T,
            gains: R820T_GAINS.to_vec(),
            serial: "00000001".to_string(),
            block_len: 16384,
            block_interval: Duration::from_millis(1),
            pattern: Pattern::Counter,
        }
    }
}

/// Backend exposing a single simulated dongle.
///
/// The backend and every device it opens share one call recorder, so a
/// test can keep the backend and inspect mutations after handing the
/// opened device to the server.
pub struct MockBackend {
    config: MockConfig,
    calls: Arc<Mutex<Vec<DriverCall>>>,
}

impl MockBackend {
    pub fn new(config: MockConfig) -> Self {
        Self {
            config,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Snapshot of every recorded driver call, in arrival order.
    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl RadioBackend for MockBackend {
    fn device_count(&self) -> Result<u32> {
        Ok(1)
    }

    fn device_name(&self, index: u32) -> Result<String> {
        if index == 0 {
            Ok(format!("Mock RTL2832U (sn {})", self.config.serial))
        } else {
            Err(DriverError::NoDevice)
        }
    }

    fn index_by_serial(&self, serial: &str) -> Result<Option<u32>> {
        if serial == self.config.serial {
            Ok(Some(0))
        } else {
            Ok(None)
        }
    }

    fn buffer_len(&self) -> usize {
        self.config.block_len
    }

    fn open(&self, index: u32) -> Result<Box<dyn RadioDevice>> {
        if index != 0 {
            return Err(DriverError::OpenFailed(-1));
        }
        Ok(Box::new(MockDevice {
            config: self.config.clone(),
            calls: Arc::clone(&self.calls),
            cancelled: AtomicBool::new(false),
        }))
    }
}

/// Simulated receiver backing `MockBackend`.
pub struct MockDevice {
    config: MockConfig,
    calls: Arc<Mutex<Vec<DriverCall>>>,
    cancelled: AtomicBool,
}

impl MockDevice {
    fn record(&self, call: DriverCall) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        Ok(())
    }

    fn fill_block(&self, counter: &mut u32) -> SampleBuf {
        let mut bytes = vec![0u8; self.config.block_len];
        match self.config.pattern {
            Pattern::Counter => {
                for chunk in bytes.chunks_exact_mut(4) {
                    chunk.copy_from_slice(&counter.to_le_bytes());
                    *counter = counter.wrapping_add(1);
                }
            }
            Pattern::Fill(value) => {
                bytes.fill(value);
            }
        }
        SampleBuf { bytes }
    }
}

impl RadioDevice for MockDevice {
    fn tuner_kind(&self) -> TunerKind {
        self.config.tuner
    }

    fn tuner_gains(&self) -> &[i32] {
        &self.config.gains
    }

    fn set_center_freq(&self, hz: u32) -> Result<()> {
        self.record(DriverCall::CenterFreq(hz))
    }

    fn set_sample_rate(&self, hz: u32) -> Result<()> {
        self.record(DriverCall::SampleRate(hz))
    }

    fn set_gain_mode(&self, mode: GainMode) -> Result<()> {
        self.record(DriverCall::GainMode(mode))
    }

    fn set_tuner_gain(&self, tenth_db: i32) -> Result<()> {
        self.record(DriverCall::TunerGain(tenth_db))
    }

    fn set_freq_correction(&self, ppm: i32) -> Result<()> {
        self.record(DriverCall::FreqCorrection(ppm))
    }

    fn set_if_gain(&self, stage: i32, tenth_db: i32) -> Result<()> {
        self.record(DriverCall::IfGain { stage, tenth_db })
    }

    fn set_agc_mode(&self, on: bool) -> Result<()> {
        self.record(DriverCall::AgcMode(on))
    }

    fn set_direct_sampling(&self, mode: DirectSampling) -> Result<()> {
        self.record(DriverCall::DirectSampling(mode))
    }

    fn set_offset_tuning(&self, on: bool) -> Result<()> {
        self.record(DriverCall::OffsetTuning(on))
    }

    fn set_bias_tee(&self, on: bool) -> Result<()> {
        self.record(DriverCall::BiasTee(on))
    }

    fn set_tuner_bandwidth(&self, hz: u32) -> Result<()> {
        self.record(DriverCall::TunerBandwidth(hz))
    }

    fn reset_buffer(&self) -> Result<()> {
        self.record(DriverCall::ResetBuffer)
    }

    fn read_stream(&self, sink: &mut dyn FnMut(SampleBuf)) -> Result<()> {
        let mut counter: u32 = 0;
        while !self.cancelled.load(Ordering::SeqCst) {
            sink(self.fill_block(&mut counter));
            thread::sleep(self.config.block_interval);
        }
        log::debug!("mock stream cancelled");
        Ok(())
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}
