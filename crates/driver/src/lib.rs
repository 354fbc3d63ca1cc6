// Copyright 2025-2026 CEMAXECUTER LLC

pub mod mock;
pub mod rtlsdr;

use std::fmt;

use thiserror::Error;

/// Sample buffer: a block of interleaved 8-bit unsigned I/Q bytes
/// (I, Q, I, Q, ...) exactly as the demodulator delivers them.
pub struct SampleBuf {
    pub bytes: Vec<u8>,
}

impl SampleBuf {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Tuner chip inside the dongle. Fixed at open time; decides which
/// parameter mutations are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunerKind {
    Unknown,
    E4000,
    FC0012,
    FC0013,
    FC2580,
    R820T,
    R828D,
}

impl TunerKind {
    /// Numeric code used in the connection greeting.
    pub fn code(self) -> u32 {
        match self {
            TunerKind::Unknown => 0,
            TunerKind::E4000 => 1,
            TunerKind::FC0012 => 2,
            TunerKind::FC0013 => 3,
            TunerKind::FC2580 => 4,
            TunerKind::R820T => 5,
            TunerKind::R828D => 6,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            1 => TunerKind::E4000,
            2 => TunerKind::FC0012,
            3 => TunerKind::FC0013,
            4 => TunerKind::FC2580,
            5 => TunerKind::R820T,
            6 => TunerKind::R828D,
            _ => TunerKind::Unknown,
        }
    }
}

impl fmt::Display for TunerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunerKind::Unknown => "unknown",
            TunerKind::E4000 => "E4000",
            TunerKind::FC0012 => "FC0012",
            TunerKind::FC0013 => "FC0013",
            TunerKind::FC2580 => "FC2580",
            TunerKind::R820T => "R820T",
            TunerKind::R828D => "R828D",
        };
        f.write_str(name)
    }
}

/// Tuner gain control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GainMode {
    Auto,
    Manual,
}

/// Direct sampling: bypasses the tuner and feeds one ADC branch straight
/// from the antenna input, used for reception below the tuner range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectSampling {
    Off,
    IBranch,
    QBranch,
}

impl DirectSampling {
    /// Map the raw wire parameter (0/1/2). Anything else is not a mode.
    pub fn from_param(param: u32) -> Option<Self> {
        match param {
            0 => Some(DirectSampling::Off),
            1 => Some(DirectSampling::IBranch),
            2 => Some(DirectSampling::QBranch),
            _ => None,
        }
    }

    pub fn mode(self) -> i32 {
        match self {
            DirectSampling::Off => 0,
            DirectSampling::IBranch => 1,
            DirectSampling::QBranch => 2,
        }
    }
}

/// Errors from a radio backend.
#[derive(Debug, Clone, Error)]
pub enum DriverError {
    #[error("native SDR library not found")]
    LibraryNotFound,

    #[error("native SDR library unusable: {0}")]
    LibraryMismatch(String),

    #[error("no SDR device found")]
    NoDevice,

    #[error("no SDR device with serial '{0}'")]
    SerialNotFound(String),

    #[error("device open failed: error code {0}")]
    OpenFailed(i32),

    #[error("{op} failed: error code {code}")]
    OperationFailed { op: &'static str, code: i32 },

    #[error("invalid argument for {0}")]
    InvalidArgument(&'static str),

    #[error("{0} not supported by this device")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, DriverError>;

/// A backend that can enumerate and open receivers of one vendor family.
///
/// Enumeration is fallible: a missing or mismatched native library is
/// reported here, before any device is touched.
pub trait RadioBackend: Send + Sync {
    fn device_count(&self) -> Result<u32>;

    /// Display name for a device index.
    fn device_name(&self, index: u32) -> Result<String>;

    /// Look up a device by its USB serial string.
    fn index_by_serial(&self, serial: &str) -> Result<Option<u32>>;

    /// Nominal length in bytes of the sample buffers devices of this
    /// backend deliver. Consumers size their queues from this.
    fn buffer_len(&self) -> usize;

    fn open(&self, index: u32) -> Result<Box<dyn RadioDevice>>;
}

/// An opened receiver.
///
/// Setters take `&self`: the control thread mutates parameters while the
/// producer thread is parked inside `read_stream`. Implementations must be
/// safe for exactly that two-thread pattern (one reader, one controller).
pub trait RadioDevice: Send + Sync {
    fn tuner_kind(&self) -> TunerKind;

    /// Supported manual gain steps in tenths of a dB, ascending.
    fn tuner_gains(&self) -> &[i32];

    fn set_center_freq(&self, hz: u32) -> Result<()>;
    fn set_sample_rate(&self, hz: u32) -> Result<()>;
    fn set_gain_mode(&self, mode: GainMode) -> Result<()>;

    /// Set the manual tuner gain in tenths of a dB. The value must come
    /// from `tuner_gains`.
    fn set_tuner_gain(&self, tenth_db: i32) -> Result<()>;

    fn set_freq_correction(&self, ppm: i32) -> Result<()>;
    fn set_if_gain(&self, stage: i32, tenth_db: i32) -> Result<()>;
    fn set_agc_mode(&self, on: bool) -> Result<()>;
    fn set_direct_sampling(&self, mode: DirectSampling) -> Result<()>;
    fn set_offset_tuning(&self, on: bool) -> Result<()>;
    fn set_bias_tee(&self, on: bool) -> Result<()>;
    fn set_tuner_bandwidth(&self, hz: u32) -> Result<()>;

    /// Flush any samples buffered before streaming starts.
    fn reset_buffer(&self) -> Result<()>;

    /// Block delivering sample buffers to `sink` until `cancel` is called
    /// from another thread. Each buffer is a fresh allocation the sink may
    /// keep.
    fn read_stream(&self, sink: &mut dyn FnMut(SampleBuf)) -> Result<()>;

    /// Unblock `read_stream`. Callable from any thread, idempotent.
    fn cancel(&self);
}
