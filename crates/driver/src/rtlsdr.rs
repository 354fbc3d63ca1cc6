// Copyright 2025-2026 CEMAXECUTER LLC

//! RTL-SDR backend using librtlsdr loaded at runtime.
//!
//! Dynamic loading (libloading) avoids a compile-time dependency on
//! librtlsdr: the same binary runs on hosts without the library installed,
//! and a missing or architecture-mismatched library is reported as a
//! startup error instead of a link failure.

use std::ffi::{c_char, c_int, c_uint, c_void, CStr, CString};
use std::ptr;
use std::sync::OnceLock;

use libloading::{Library, Symbol};

use crate::{
    DirectSampling, DriverError, GainMode, RadioBackend, RadioDevice, Result, SampleBuf, TunerKind,
};

/// Opaque librtlsdr device handle.
type RtlHandle = *mut c_void;

/// librtlsdr's default transfer geometry delivers 256 KiB per callback.
pub const TRANSFER_BUF_LEN: usize = 256 * 1024;

/// rtlsdr_set_freq_correction returns this when the correction is already
/// at the requested value.
const ALREADY_SET: c_int = -2;

type StreamCallback = unsafe extern "C" fn(buf: *mut u8, len: u32, ctx: *mut c_void);

/// Loaded librtlsdr library and function pointers.
struct RtlLib {
    _lib: Library,
    get_device_count: Symbol<'static, unsafe extern "C" fn() -> c_uint>,
    get_device_name: Symbol<'static, unsafe extern "C" fn(c_uint) -> *const c_char>,
    get_device_usb_strings: Symbol<
        'static,
        unsafe extern "C" fn(c_uint, *mut c_char, *mut c_char, *mut c_char) -> c_int,
    >,
    get_index_by_serial: Symbol<'static, unsafe extern "C" fn(*const c_char) -> c_int>,
    open: Symbol<'static, unsafe extern "C" fn(*mut RtlHandle, c_uint) -> c_int>,
    close: Symbol<'static, unsafe extern "C" fn(RtlHandle) -> c_int>,
    get_tuner_type: Symbol<'static, unsafe extern "C" fn(RtlHandle) -> c_int>,
    get_tuner_gains: Symbol<'static, unsafe extern "C" fn(RtlHandle, *mut c_int) -> c_int>,
    set_center_freq: Symbol<'static, unsafe extern "C" fn(RtlHandle, c_uint) -> c_int>,
    set_sample_rate: Symbol<'static, unsafe extern "C" fn(RtlHandle, c_uint) -> c_int>,
    set_tuner_gain_mode: Symbol<'static, unsafe extern "C" fn(RtlHandle, c_int) -> c_int>,
    set_tuner_gain: Symbol<'static, unsafe extern "C" fn(RtlHandle, c_int) -> c_int>,
    set_tuner_if_gain: Symbol<'static, unsafe extern "C" fn(RtlHandle, c_int, c_int) -> c_int>,
    set_freq_correction: Symbol<'static, unsafe extern "C" fn(RtlHandle, c_int) -> c_int>,
    set_agc_mode: Symbol<'static, unsafe extern "C" fn(RtlHandle, c_int) -> c_int>,
    set_direct_sampling: Symbol<'static, unsafe extern "C" fn(RtlHandle, c_int) -> c_int>,
    set_offset_tuning: Symbol<'static, unsafe extern "C" fn(RtlHandle, c_int) -> c_int>,
    set_tuner_bandwidth: Symbol<'static, unsafe extern "C" fn(RtlHandle, c_uint) -> c_int>,
    reset_buffer: Symbol<'static, unsafe extern "C" fn(RtlHandle) -> c_int>,
    read_async: Symbol<
        'static,
        unsafe extern "C" fn(RtlHandle, StreamCallback, *mut c_void, u32, u32) -> c_int,
    >,
    cancel_async: Symbol<'static, unsafe extern "C" fn(RtlHandle) -> c_int>,
    /// Absent in librtlsdr builds older than 0.6.
    set_bias_tee: Option<Symbol<'static, unsafe extern "C" fn(RtlHandle, c_int) -> c_int>>,
}

static RTLSDR_LIB: OnceLock<Result<RtlLib>> = OnceLock::new();

/// Library names to try on different platforms.
#[cfg(target_os = "linux")]
const LIB_NAMES: &[&str] = &["librtlsdr.so.0", "librtlsdr.so.2", "librtlsdr.so"];

#[cfg(target_os = "macos")]
const LIB_NAMES: &[&str] = &["librtlsdr.dylib", "librtlsdr.0.dylib"];

#[cfg(target_os = "windows")]
const LIB_NAMES: &[&str] = &["rtlsdr.dll", "librtlsdr.dll"];

fn sym<T>(
    lib: &'static Library,
    name: &[u8],
) -> std::result::Result<Symbol<'static, T>, libloading::Error> {
    unsafe { lib.get(name) }
}

/// The dynamic loader found a library file but refused it (typically a
/// 32/64-bit or cross-architecture mismatch).
fn is_arch_mismatch(desc: &str) -> bool {
    desc.contains("wrong ELF class")
        || desc.contains("invalid ELF header")
        || desc.contains("not a valid Win32 application")
        || desc.contains("incompatible architecture")
}

fn load_library() -> Result<RtlLib> {
    let mut mismatch: Option<String> = None;

    for name in LIB_NAMES {
        let lib = match unsafe { Library::new(name) } {
            Ok(lib) => lib,
            Err(e) => {
                let desc = e.to_string();
                if is_arch_mismatch(&desc) {
                    mismatch = Some(desc);
                }
                continue;
            }
        };

        // The symbols borrow the Library for 'static; this is sound because
        // the Library is kept alive inside the returned struct.
        let lib_ref: &'static Library = unsafe { std::mem::transmute(&lib) };

        let loaded = (|| {
            Ok::<RtlLib, libloading::Error>(RtlLib {
                get_device_count: sym(lib_ref, b"rtlsdr_get_device_count\0")?,
                get_device_name: sym(lib_ref, b"rtlsdr_get_device_name\0")?,
                get_device_usb_strings: sym(lib_ref, b"rtlsdr_get_device_usb_strings\0")?,
                get_index_by_serial: sym(lib_ref, b"rtlsdr_get_index_by_serial\0")?,
                open: sym(lib_ref, b"rtlsdr_open\0")?,
                close: sym(lib_ref, b"rtlsdr_close\0")?,
                get_tuner_type: sym(lib_ref, b"rtlsdr_get_tuner_type\0")?,
                get_tuner_gains: sym(lib_ref, b"rtlsdr_get_tuner_gains\0")?,
                set_center_freq: sym(lib_ref, b"rtlsdr_set_center_freq\0")?,
                set_sample_rate: sym(lib_ref, b"rtlsdr_set_sample_rate\0")?,
                set_tuner_gain_mode: sym(lib_ref, b"rtlsdr_set_tuner_gain_mode\0")?,
                set_tuner_gain: sym(lib_ref, b"rtlsdr_set_tuner_gain\0")?,
                set_tuner_if_gain: sym(lib_ref, b"rtlsdr_set_tuner_if_gain\0")?,
                set_freq_correction: sym(lib_ref, b"rtlsdr_set_freq_correction\0")?,
                set_agc_mode: sym(lib_ref, b"rtlsdr_set_agc_mode\0")?,
                set_direct_sampling: sym(lib_ref, b"rtlsdr_set_direct_sampling\0")?,
                set_offset_tuning: sym(lib_ref, b"rtlsdr_set_offset_tuning\0")?,
                set_tuner_bandwidth: sym(lib_ref, b"rtlsdr_set_tuner_bandwidth\0")?,
                reset_buffer: sym(lib_ref, b"rtlsdr_reset_buffer\0")?,
                read_async: sym(lib_ref, b"rtlsdr_read_async\0")?,
                cancel_async: sym(lib_ref, b"rtlsdr_cancel_async\0")?,
                set_bias_tee: sym(lib_ref, b"rtlsdr_set_bias_tee\0").ok(),
                _lib: lib,
            })
        })();

        match loaded {
            Ok(l) => {
                log::info!("loaded librtlsdr: {}", name);
                return Ok(l);
            }
            Err(e) => {
                log::warn!("{}: missing symbol, skipping: {}", name, e);
                continue;
            }
        }
    }

    match mismatch {
        Some(desc) => Err(DriverError::LibraryMismatch(desc)),
        None => Err(DriverError::LibraryNotFound),
    }
}

fn lib() -> Result<&'static RtlLib> {
    match RTLSDR_LIB.get_or_init(load_library) {
        Ok(lib) => Ok(lib),
        Err(e) => Err(e.clone()),
    }
}

fn cstr_field(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(0);
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

fn usb_serial(l: &RtlLib, index: u32) -> Option<String> {
    let mut manufact = [0u8; 256];
    let mut product = [0u8; 256];
    let mut serial = [0u8; 256];
    let ret = unsafe {
        (l.get_device_usb_strings)(
            index,
            manufact.as_mut_ptr() as *mut c_char,
            product.as_mut_ptr() as *mut c_char,
            serial.as_mut_ptr() as *mut c_char,
        )
    };
    if ret == 0 {
        Some(cstr_field(&serial))
    } else {
        None
    }
}

/// librtlsdr-backed device enumeration.
pub struct RtlSdrBackend;

impl RtlSdrBackend {
    pub fn new() -> Self {
        RtlSdrBackend
    }
}

impl Default for RtlSdrBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RadioBackend for RtlSdrBackend {
    fn device_count(&self) -> Result<u32> {
        let l = lib()?;
        Ok(unsafe { (l.get_device_count)() })
    }

    fn device_name(&self, index: u32) -> Result<String> {
        let l = lib()?;
        let ptr = unsafe { (l.get_device_name)(index) };
        let name = if ptr.is_null() {
            format!("device {}", index)
        } else {
            unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
        };
        match usb_serial(l, index) {
            Some(sn) if !sn.is_empty() => Ok(format!("{} (sn {})", name, sn)),
            _ => Ok(name),
        }
    }

    fn index_by_serial(&self, serial: &str) -> Result<Option<u32>> {
        let l = lib()?;
        let cs = CString::new(serial).map_err(|_| DriverError::InvalidArgument("serial"))?;
        let ret = unsafe { (l.get_index_by_serial)(cs.as_ptr()) };
        if ret >= 0 {
            Ok(Some(ret as u32))
        } else {
            Ok(None)
        }
    }

    fn buffer_len(&self) -> usize {
        TRANSFER_BUF_LEN
    }

    fn open(&self, index: u32) -> Result<Box<dyn RadioDevice>> {
        Ok(Box::new(RtlSdrDevice::open(index)?))
    }
}

/// Context handed to the read_async trampoline.
struct SinkContext<'a> {
    sink: &'a mut dyn FnMut(SampleBuf),
}

unsafe extern "C" fn stream_callback(buf: *mut u8, len: u32, ctx: *mut c_void) {
    if buf.is_null() || len == 0 {
        return;
    }
    let ctx = &mut *(ctx as *mut SinkContext);
    // librtlsdr reuses its transfer buffers; copy before handing off
    let bytes = std::slice::from_raw_parts(buf, len as usize).to_vec();
    (ctx.sink)(SampleBuf { bytes });
}

/// One opened RTL-SDR dongle.
pub struct RtlSdrDevice {
    handle: RtlHandle,
    tuner: TunerKind,
    gains: Vec<i32>,
}

// The handle is used from one reading thread plus one control thread;
// librtlsdr serializes its USB control transfers internally.
unsafe impl Send for RtlSdrDevice {}
unsafe impl Sync for RtlSdrDevice {}

impl RtlSdrDevice {
    pub fn open(index: u32) -> Result<Self> {
        let l = lib()?;

        let mut handle: RtlHandle = ptr::null_mut();
        let ret = unsafe { (l.open)(&mut handle, index) };
        if ret != 0 || handle.is_null() {
            return Err(DriverError::OpenFailed(ret));
        }

        let tuner_code = unsafe { (l.get_tuner_type)(handle) };
        let tuner = TunerKind::from_code(tuner_code.max(0) as u32);

        // First call sizes the table, second call fills it
        let count = unsafe { (l.get_tuner_gains)(handle, ptr::null_mut()) };
        let gains = if count > 0 {
            let mut gains = vec![0 as c_int; count as usize];
            let n = unsafe { (l.get_tuner_gains)(handle, gains.as_mut_ptr()) };
            gains.truncate(n.max(0) as usize);
            gains
        } else {
            Vec::new()
        };

        log::info!(
            "opened RTL-SDR #{} (tuner {}, {} gain steps)",
            index,
            tuner,
            gains.len()
        );

        Ok(Self {
            handle,
            tuner,
            gains,
        })
    }

    fn status(&self, op: &'static str, ret: c_int) -> Result<()> {
        if ret == 0 {
            Ok(())
        } else {
            Err(DriverError::OperationFailed { op, code: ret })
        }
    }
}

impl RadioDevice for RtlSdrDevice {
    fn tuner_kind(&self) -> TunerKind {
        self.tuner
    }

    fn tuner_gains(&self) -> &[i32] {
        &self.gains
    }

    fn set_center_freq(&self, hz: u32) -> Result<()> {
        let l = lib()?;
        self.status("set_center_freq", unsafe {
            (l.set_center_freq)(self.handle, hz)
        })
    }

    fn set_sample_rate(&self, hz: u32) -> Result<()> {
        let l = lib()?;
        self.status("set_sample_rate", unsafe {
            (l.set_sample_rate)(self.handle, hz)
        })
    }

    fn set_gain_mode(&self, mode: GainMode) -> Result<()> {
        let l = lib()?;
        let manual = match mode {
            GainMode::Auto => 0,
            GainMode::Manual => 1,
        };
        self.status("set_tuner_gain_mode", unsafe {
            (l.set_tuner_gain_mode)(self.handle, manual)
        })
    }

    fn set_tuner_gain(&self, tenth_db: i32) -> Result<()> {
        let l = lib()?;
        self.status("set_tuner_gain", unsafe {
            (l.set_tuner_gain)(self.handle, tenth_db)
        })
    }

    fn set_freq_correction(&self, ppm: i32) -> Result<()> {
        let l = lib()?;
        let ret = unsafe { (l.set_freq_correction)(self.handle, ppm) };
        // the correction was already at this value
        if ret == ALREADY_SET {
            return Ok(());
        }
        self.status("set_freq_correction", ret)
    }

    fn set_if_gain(&self, stage: i32, tenth_db: i32) -> Result<()> {
        let l = lib()?;
        self.status("set_tuner_if_gain", unsafe {
            (l.set_tuner_if_gain)(self.handle, stage, tenth_db)
        })
    }

    fn set_agc_mode(&self, on: bool) -> Result<()> {
        let l = lib()?;
        self.status("set_agc_mode", unsafe {
            (l.set_agc_mode)(self.handle, on as c_int)
        })
    }

    fn set_direct_sampling(&self, mode: DirectSampling) -> Result<()> {
        let l = lib()?;
        self.status("set_direct_sampling", unsafe {
            (l.set_direct_sampling)(self.handle, mode.mode())
        })
    }

    fn set_offset_tuning(&self, on: bool) -> Result<()> {
        let l = lib()?;
        self.status("set_offset_tuning", unsafe {
            (l.set_offset_tuning)(self.handle, on as c_int)
        })
    }

    fn set_bias_tee(&self, on: bool) -> Result<()> {
        let l = lib()?;
        match &l.set_bias_tee {
            Some(f) => self.status("set_bias_tee", unsafe { f(self.handle, on as c_int) }),
            None => Err(DriverError::Unsupported("bias tee")),
        }
    }

    fn set_tuner_bandwidth(&self, hz: u32) -> Result<()> {
        let l = lib()?;
        self.status("set_tuner_bandwidth", unsafe {
            (l.set_tuner_bandwidth)(self.handle, hz)
        })
    }

    fn reset_buffer(&self) -> Result<()> {
        let l = lib()?;
        self.status("reset_buffer", unsafe { (l.reset_buffer)(self.handle) })
    }

    fn read_stream(&self, sink: &mut dyn FnMut(SampleBuf)) -> Result<()> {
        let l = lib()?;
        let mut ctx = SinkContext { sink };
        // 0/0 keeps librtlsdr's default transfer geometry
        let ret = unsafe {
            (l.read_async)(
                self.handle,
                stream_callback,
                &mut ctx as *mut SinkContext as *mut c_void,
                0,
                0,
            )
        };
        self.status("read_async", ret)
    }

    fn cancel(&self) {
        if let Ok(l) = lib() {
            unsafe {
                (l.cancel_async)(self.handle);
            }
        }
    }
}

impl Drop for RtlSdrDevice {
    fn drop(&mut self) {
        if let Ok(l) = lib() {
            log::debug!("closing RTL-SDR device");
            unsafe {
                (l.close)(self.handle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_probe() {
        // Loading either succeeds or fails with one of the two startup
        // error kinds; anything else is a wiring bug.
        match lib() {
            Ok(_) => {}
            Err(DriverError::LibraryNotFound) => {}
            Err(DriverError::LibraryMismatch(_)) => {}
            Err(e) => panic!("unexpected load error: {}", e),
        }
    }

    #[test]
    fn test_arch_mismatch_detection() {
        assert!(is_arch_mismatch(
            "librtlsdr.so: wrong ELF class: ELFCLASS32"
        ));
        assert!(!is_arch_mismatch("librtlsdr.so: cannot open shared object file"));
    }
}
