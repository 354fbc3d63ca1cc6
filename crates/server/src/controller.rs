// Copyright 2025-2026 CEMAXECUTER LLC

//! Radio controller: owns one opened device, streams its samples into the
//! broadcast hub from a dedicated producer thread, and serializes every
//! parameter mutation on a dedicated control thread.
//!
//! Mutations are ordered with respect to each other but not with respect
//! to sample delivery; a buffer may straddle a parameter change.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use rk_driver::{
    DirectSampling, DriverError, GainMode, RadioBackend, RadioDevice, SampleBuf, TunerKind,
};

use crate::command::Command;
use crate::error::Result;
use crate::hub::BroadcastHub;
use crate::wire::Greeting;

/// Initial parameter state applied right after open.
#[derive(Debug, Clone)]
pub struct TunerConfig {
    pub center_freq: u32,
    pub sample_rate: u32,
    /// Manual gain in tenths of a dB; `None` selects automatic gain.
    pub gain: Option<i32>,
    pub freq_correction: i32,
    pub bias_tee: bool,
    pub direct_sampling: DirectSampling,
    /// Tuner IF bandwidth in Hz; 0 leaves the tuner in automatic.
    pub tuner_bandwidth: u32,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            center_freq: 100_000_000,
            sample_rate: 2_048_000,
            gain: None,
            freq_correction: 0,
            bias_tee: false,
            direct_sampling: DirectSampling::Off,
            tuner_bandwidth: 0,
        }
    }
}

/// Last successfully applied parameter state.
#[derive(Debug, Clone)]
pub struct Params {
    pub center_freq: u32,
    pub sample_rate: u32,
    pub gain_mode: GainMode,
    pub tuner_gain: i32,
    pub freq_correction: i32,
    /// Applied IF gain per tuner stage, in tenths of a dB.
    pub if_gain: HashMap<i32, i32>,
    pub agc: bool,
    pub direct_sampling: DirectSampling,
    pub offset_tuning: bool,
    pub bias_tee: bool,
    pub tuner_bandwidth: u32,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            center_freq: 0,
            sample_rate: 0,
            gain_mode: GainMode::Auto,
            tuner_gain: 0,
            freq_correction: 0,
            if_gain: HashMap::new(),
            agc: false,
            direct_sampling: DirectSampling::Off,
            offset_tuning: false,
            bias_tee: false,
            tuner_bandwidth: 0,
        }
    }
}

enum ControlRequest {
    Apply(Command),
    Shutdown,
}

/// Cloneable entry into the serialized control path.
#[derive(Clone)]
pub struct ControlHandle {
    tx: Sender<ControlRequest>,
}

impl ControlHandle {
    /// Enqueue a mutation. Failures to apply are logged by the control
    /// thread; nothing is reported back to the caller (the wire protocol
    /// has no acknowledgement).
    pub fn apply(&self, command: Command) {
        let _ = self.tx.send(ControlRequest::Apply(command));
    }
}

pub struct RadioController {
    device: Arc<dyn RadioDevice>,
    tuner: TunerKind,
    gain_count: u32,
    params: Arc<Mutex<Params>>,
    control_tx: Sender<ControlRequest>,
    control_thread: Option<JoinHandle<()>>,
    producer_thread: Option<JoinHandle<()>>,
}

impl RadioController {
    /// Select and open a device, apply the initial parameter state, then
    /// start the producer and control threads.
    ///
    /// Selection: by serial when given, else by index. Initial parameter
    /// failures are logged and survived; only enumeration and open
    /// failures abort startup.
    pub fn start(
        backend: &dyn RadioBackend,
        device_index: u32,
        serial: Option<&str>,
        config: &TunerConfig,
        hub: Arc<BroadcastHub>,
    ) -> Result<Self> {
        let count = backend.device_count()?;
        if count == 0 {
            return Err(DriverError::NoDevice.into());
        }
        let index = match serial {
            Some(sn) => backend
                .index_by_serial(sn)?
                .ok_or_else(|| DriverError::SerialNotFound(sn.to_string()))?,
            None => device_index,
        };
        if index >= count {
            log::error!("device index {} out of range ({} devices)", index, count);
            return Err(DriverError::NoDevice.into());
        }

        log::info!("using {}", backend.device_name(index)?);
        let device: Arc<dyn RadioDevice> = Arc::from(backend.open(index)?);
        let tuner = device.tuner_kind();
        let gains = device.tuner_gains().to_vec();
        log::info!("tuner {} with {} gain steps", tuner, gains.len());

        let params = Arc::new(Mutex::new(Params::default()));
        apply_initial(&*device, tuner, &gains, &params, config);

        let (control_tx, control_rx) = channel::unbounded();
        let control_thread = {
            let device = Arc::clone(&device);
            let gains = gains.clone();
            let params = Arc::clone(&params);
            thread::Builder::new()
                .name("radio-control".to_string())
                .spawn(move || control_loop(device, tuner, gains, params, control_rx))?
        };

        let producer_thread = {
            let device = Arc::clone(&device);
            thread::Builder::new()
                .name("radio-producer".to_string())
                .spawn(move || {
                    if let Err(e) = device.reset_buffer() {
                        log::warn!("buffer reset failed: {}", e);
                    }
                    let mut sink = |buf: SampleBuf| hub.publish(Arc::new(buf));
                    match device.read_stream(&mut sink) {
                        Ok(()) => log::info!("sample stream stopped"),
                        Err(e) => log::error!("sample stream failed: {}", e),
                    }
                })?
        };

        Ok(Self {
            device,
            tuner,
            gain_count: gains.len() as u32,
            params,
            control_tx,
            control_thread: Some(control_thread),
            producer_thread: Some(producer_thread),
        })
    }

    pub fn tuner_kind(&self) -> TunerKind {
        self.tuner
    }

    pub fn gain_count(&self) -> u32 {
        self.gain_count
    }

    /// The 12-byte preamble describing this device.
    pub fn greeting(&self) -> Greeting {
        Greeting {
            tuner: self.tuner,
            gain_count: self.gain_count,
        }
    }

    pub fn params(&self) -> Params {
        self.params.lock().unwrap().clone()
    }

    pub fn handle(&self) -> ControlHandle {
        ControlHandle {
            tx: self.control_tx.clone(),
        }
    }

    /// Cancel the producer, join both threads. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if let Some(producer) = self.producer_thread.take() {
            self.device.cancel();
            if producer.join().is_err() {
                log::error!("producer thread panicked");
            }
        }
        if let Some(control) = self.control_thread.take() {
            let _ = self.control_tx.send(ControlRequest::Shutdown);
            if control.join().is_err() {
                log::error!("control thread panicked");
            }
        }
    }
}

impl Drop for RadioController {
    fn drop(&mut self) {
        self.stop();
    }
}

fn control_loop(
    device: Arc<dyn RadioDevice>,
    tuner: TunerKind,
    gains: Vec<i32>,
    params: Arc<Mutex<Params>>,
    rx: Receiver<ControlRequest>,
) {
    while let Ok(request) = rx.recv() {
        match request {
            ControlRequest::Shutdown => break,
            ControlRequest::Apply(command) => {
                log::debug!("applying {:?}", command);
                if let Err(e) = apply_command(&*device, tuner, &gains, &params, command) {
                    log::error!("{:?} failed: {}", command, e);
                }
            }
        }
    }
    log::debug!("control thread exiting");
}

fn apply_initial(
    device: &dyn RadioDevice,
    tuner: TunerKind,
    gains: &[i32],
    params: &Mutex<Params>,
    config: &TunerConfig,
) {
    let mut initial = vec![
        Command::SetSampleRate(config.sample_rate),
        Command::SetCenterFreq(config.center_freq),
    ];
    match config.gain {
        None => initial.push(Command::SetGainMode(GainMode::Auto)),
        Some(tenth_db) => {
            initial.push(Command::SetGainMode(GainMode::Manual));
            initial.push(Command::SetTunerGain(tenth_db));
        }
    }
    if config.freq_correction != 0 {
        initial.push(Command::SetFreqCorrection(config.freq_correction));
    }
    initial.push(Command::SetAgcMode(false));
    if config.direct_sampling != DirectSampling::Off {
        initial.push(Command::SetDirectSampling(config.direct_sampling));
    }
    if config.bias_tee {
        initial.push(Command::SetBiasTee(true));
    }

    for command in initial {
        if let Err(e) = apply_command(device, tuner, gains, params, command) {
            log::error!("initial {:?} failed: {}", command, e);
        }
    }

    if config.tuner_bandwidth != 0 {
        match device.set_tuner_bandwidth(config.tuner_bandwidth) {
            Ok(()) => params.lock().unwrap().tuner_bandwidth = config.tuner_bandwidth,
            Err(e) => log::error!("initial tuner bandwidth failed: {}", e),
        }
    }
}

/// The single mutation path: vendor policy, then the driver call, then the
/// parameter record on success.
fn apply_command(
    device: &dyn RadioDevice,
    tuner: TunerKind,
    gains: &[i32],
    params: &Mutex<Params>,
    command: Command,
) -> rk_driver::Result<()> {
    match command {
        Command::SetCenterFreq(hz) => {
            device.set_center_freq(hz)?;
            params.lock().unwrap().center_freq = hz;
        }
        Command::SetSampleRate(hz) => {
            device.set_sample_rate(hz)?;
            params.lock().unwrap().sample_rate = hz;
        }
        Command::SetGainMode(mode) => {
            device.set_gain_mode(mode)?;
            params.lock().unwrap().gain_mode = mode;
        }
        Command::SetTunerGain(tenth_db) => {
            let snapped = nearest_gain(gains, tenth_db)?;
            device.set_tuner_gain(snapped)?;
            params.lock().unwrap().tuner_gain = snapped;
        }
        Command::SetFreqCorrection(ppm) => {
            device.set_freq_correction(ppm)?;
            params.lock().unwrap().freq_correction = ppm;
        }
        Command::SetIfGain { stage, tenth_db } => {
            device.set_if_gain(stage, tenth_db)?;
            params.lock().unwrap().if_gain.insert(stage, tenth_db);
        }
        Command::SetTestMode(_) => {
            log::debug!("test mode request accepted, no device action");
        }
        Command::SetAgcMode(on) => {
            device.set_agc_mode(on)?;
            params.lock().unwrap().agc = on;
        }
        Command::SetDirectSampling(mode) => {
            device.set_direct_sampling(mode)?;
            params.lock().unwrap().direct_sampling = mode;
        }
        Command::SetOffsetTuning(on) => {
            // R820-family tuners have no offset tuning; accept and ignore
            if matches!(tuner, TunerKind::R820T | TunerKind::R828D) {
                log::debug!("offset tuning ignored on {}", tuner);
            } else {
                device.set_offset_tuning(on)?;
                params.lock().unwrap().offset_tuning = on;
            }
        }
        Command::SetXtalFreq(_) => {
            log::debug!("crystal frequency request accepted, no device action");
        }
        Command::SetTunerGainIndex(index) => {
            let gain = *gains
                .get(index as usize)
                .ok_or(DriverError::InvalidArgument("gain index"))?;
            device.set_tuner_gain(gain)?;
            params.lock().unwrap().tuner_gain = gain;
        }
        Command::SetBiasTee(on) => {
            device.set_bias_tee(on)?;
            params.lock().unwrap().bias_tee = on;
        }
    }
    Ok(())
}

fn nearest_gain(gains: &[i32], tenth_db: i32) -> rk_driver::Result<i32> {
    gains
        .iter()
        .copied()
        .min_by_key(|g| (g - tenth_db).abs())
        .ok_or(DriverError::InvalidArgument("empty gain table"))
}
