use clap::Parser;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rk_driver::mock::{MockBackend, MockConfig};
use rk_driver::rtlsdr::RtlSdrBackend;
use rk_driver::{DirectSampling, RadioBackend};
use rk_server::{Server, ServerConfig, TunerConfig};

#[derive(Parser, Debug)]
#[command(name = "red-kite")]
#[command(about = "rtl_tcp-compatible SDR streaming server")]
struct Cli {
    /// Listen address
    #[arg(short = 'a', long, default_value = "0.0.0.0")]
    address: IpAddr,

    /// Listen port
    #[arg(short = 'p', long, default_value = "1234")]
    port: u16,

    /// Device index
    #[arg(short = 'd', long, default_value = "0")]
    device: u32,

    /// Select the device by USB serial instead of index
    #[arg(long)]
    serial: Option<String>,

    /// Center frequency in Hz
    #[arg(short = 'f', long, default_value = "100000000")]
    freq: u32,

    /// Sample rate in Hz
    #[arg(short = 's', long, default_value = "2048000")]
    rate: u32,

    /// Manual tuner gain in tenths of a dB (omit for automatic gain)
    #[arg(short = 'g', long)]
    gain: Option<i32>,

    /// Frequency correction in ppm
    #[arg(short = 'P', long, default_value = "0")]
    ppm: i32,

    /// Enable the antenna bias tee
    #[arg(short = 'T', long)]
    bias_tee: bool,

    /// Direct sampling mode: 0 off, 1 I-branch, 2 Q-branch
    #[arg(short = 'D', long, default_value = "0")]
    direct_sampling: u32,

    /// Tuner bandwidth in Hz (0 = automatic)
    #[arg(short = 'w', long, default_value = "0")]
    bandwidth: u32,

    /// Per-client queue budget in bytes (0 = about one second of samples)
    #[arg(short = 'b', long, default_value = "0")]
    queue_bytes: usize,

    /// Radio backend: rtlsdr, or mock (loopback test source)
    #[arg(long, default_value = "rtlsdr")]
    backend: String,

    /// List detected devices and exit
    #[arg(long)]
    list: bool,

    /// Verbose output
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn make_backend(name: &str) -> Box<dyn RadioBackend> {
    match name {
        "rtlsdr" => Box::new(RtlSdrBackend::new()),
        "mock" => Box::new(MockBackend::new(MockConfig::default())),
        other => {
            eprintln!("unknown backend: {} (use rtlsdr or mock)", other);
            std::process::exit(1);
        }
    }
}

fn list_devices(backend: &dyn RadioBackend) -> i32 {
    match backend.device_count() {
        Ok(0) => {
            eprintln!("  (no SDR devices found)");
            0
        }
        Ok(count) => {
            for index in 0..count {
                match backend.device_name(index) {
                    Ok(name) => eprintln!("  {}: {}", index, name),
                    Err(e) => eprintln!("  {}: error: {}", index, e),
                }
            }
            0
        }
        Err(e) => {
            eprintln!("error listing devices: {}", e);
            rk_server::Error::from(e).exit_code()
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let backend = make_backend(&cli.backend);

    if cli.list {
        std::process::exit(list_devices(&*backend));
    }

    let direct_sampling = DirectSampling::from_param(cli.direct_sampling).unwrap_or_else(|| {
        eprintln!(
            "invalid direct sampling mode: {} (use 0, 1 or 2)",
            cli.direct_sampling
        );
        std::process::exit(1);
    });

    let config = ServerConfig {
        address: cli.address,
        port: cli.port,
        device_index: cli.device,
        serial: cli.serial.clone(),
        queue_bytes: cli.queue_bytes,
        tuner: TunerConfig {
            center_freq: cli.freq,
            sample_rate: cli.rate,
            gain: cli.gain,
            freq_correction: cli.ppm,
            bias_tee: cli.bias_tee,
            direct_sampling,
            tuner_bandwidth: cli.bandwidth,
        },
    };

    let mut server = match Server::start(&*backend, &config) {
        Ok(server) => server,
        Err(e) => {
            log::error!("startup failed: {}", e);
            std::process::exit(e.exit_code());
        }
    };

    // Set up Ctrl-C handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        eprintln!("\ninterrupted, stopping...");
        r.store(false, Ordering::SeqCst);
    })
    .expect("failed to set Ctrl-C handler");

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    server.shutdown(Duration::from_secs(5));
}
