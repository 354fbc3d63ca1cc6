//! End-to-end tests: a full server over real TCP sockets, backed by the
//! mock driver.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

use rk_driver::mock::{DriverCall, MockBackend, MockConfig, Pattern};
use rk_driver::GainMode;
use rk_server::{Server, ServerConfig};

const GREETING_LEN: usize = 12;

fn start(mock: MockConfig, queue_bytes: usize) -> (MockBackend, Server) {
    let backend = MockBackend::new(mock);
    let config = ServerConfig {
        address: "127.0.0.1".parse().unwrap(),
        port: 0,
        queue_bytes,
        ..Default::default()
    };
    let server = Server::start(&backend, &config).unwrap();
    // producer is up once the stream reset has been seen
    assert!(wait_until(Duration::from_secs(2), || {
        backend.calls().contains(&DriverCall::ResetBuffer)
    }));
    (backend, server)
}

fn connect(server: &Server) -> TcpStream {
    let stream = TcpStream::connect(server.local_addr()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

fn read_greeting(stream: &mut TcpStream) -> [u8; GREETING_LEN] {
    let mut buf = [0u8; GREETING_LEN];
    stream.read_exact(&mut buf).unwrap();
    buf
}

fn read_bytes(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).unwrap();
    buf
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

/// Calls recorded after `baseline`, once at least `expect` of them arrived.
fn new_calls(backend: &MockBackend, baseline: usize, expect: usize) -> Vec<DriverCall> {
    assert!(
        wait_until(Duration::from_secs(2), || {
            backend.calls().len() >= baseline + expect
        }),
        "driver calls never arrived"
    );
    // let any stragglers land before snapshotting
    thread::sleep(Duration::from_millis(50));
    backend.calls()[baseline..].to_vec()
}

#[test]
fn greeting_is_the_first_twelve_bytes() {
    let (_backend, mut server) = start(MockConfig::default(), 0);
    let mut stream = connect(&server);

    let greeting = read_greeting(&mut stream);
    assert_eq!(
        greeting,
        [0x52, 0x54, 0x4C, 0x30, 0, 0, 0, 5, 0, 0, 0, 0x1D]
    );

    server.shutdown(Duration::from_secs(5));
}

#[test]
fn set_frequency_reaches_the_driver_once() {
    let (backend, mut server) = start(MockConfig::default(), 0);
    let mut stream = connect(&server);
    read_greeting(&mut stream);

    let baseline = backend.calls().len();
    stream.write_all(&[0x01, 0x05, 0xF5, 0xE1, 0x00]).unwrap();

    assert_eq!(
        new_calls(&backend, baseline, 1),
        vec![DriverCall::CenterFreq(100_000_000)]
    );

    server.shutdown(Duration::from_secs(5));
}

#[test]
fn gain_mode_transitions_auto_then_manual() {
    let (backend, mut server) = start(MockConfig::default(), 0);
    let mut stream = connect(&server);
    read_greeting(&mut stream);

    let baseline = backend.calls().len();
    stream.write_all(&[0x03, 0, 0, 0, 0]).unwrap();
    stream.write_all(&[0x03, 0, 0, 0, 1]).unwrap();

    assert_eq!(
        new_calls(&backend, baseline, 2),
        vec![
            DriverCall::GainMode(GainMode::Auto),
            DriverCall::GainMode(GainMode::Manual),
        ]
    );

    server.shutdown(Duration::from_secs(5));
}

#[test]
fn repeating_a_value_applies_it_twice() {
    let (backend, mut server) = start(MockConfig::default(), 0);
    let mut stream = connect(&server);
    read_greeting(&mut stream);

    let baseline = backend.calls().len();
    stream.write_all(&[0x05, 0, 0, 0, 5]).unwrap();
    stream.write_all(&[0x05, 0, 0, 0, 5]).unwrap();

    assert_eq!(
        new_calls(&backend, baseline, 2),
        vec![DriverCall::FreqCorrection(5), DriverCall::FreqCorrection(5)]
    );

    // the connection survived both
    assert_eq!(server.session_count(), 1);
    server.shutdown(Duration::from_secs(5));
}

#[test]
fn unknown_command_is_ignored_and_the_socket_stays_open() {
    let (backend, mut server) = start(MockConfig::default(), 0);
    let mut stream = connect(&server);
    read_greeting(&mut stream);

    let baseline = backend.calls().len();
    stream.write_all(&[0xFF, 0, 0, 0, 0]).unwrap();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(backend.calls().len(), baseline);

    // a recognized command still goes through afterwards
    stream.write_all(&[0x02, 0x00, 0x0F, 0x42, 0x40]).unwrap();
    assert_eq!(
        new_calls(&backend, baseline, 1),
        vec![DriverCall::SampleRate(1_000_000)]
    );

    server.shutdown(Duration::from_secs(5));
}

#[test]
fn every_command_code_lands_as_one_driver_call() {
    use rk_driver::DirectSampling;

    let (backend, mut server) = start(MockConfig::default(), 0);
    let mut stream = connect(&server);
    read_greeting(&mut stream);

    let baseline = backend.calls().len();
    let frames: &[[u8; 5]] = &[
        [0x04, 0x00, 0x00, 0x00, 0x64], // gain 100 -> nearest table entry
        [0x06, 0x00, 0x01, 0xFF, 0xF6], // IF stage 1, -10 tenths dB
        [0x07, 0x00, 0x00, 0x00, 0x01], // test mode: accepted, no effect
        [0x08, 0x00, 0x00, 0x00, 0x01], // RTL AGC on
        [0x09, 0x00, 0x00, 0x00, 0x02], // direct sampling, Q branch
        [0x0A, 0x00, 0x00, 0x00, 0x01], // offset tuning: ignored on R820T
        [0x0B, 0x01, 0xB7, 0x74, 0x00], // crystal freq: accepted, no effect
        [0x0D, 0x00, 0x00, 0x00, 0x1C], // gain index 28 -> last table entry
        [0x0E, 0x00, 0x00, 0x00, 0x01], // bias tee on
    ];
    for frame in frames {
        stream.write_all(frame).unwrap();
    }

    assert_eq!(
        new_calls(&backend, baseline, 6),
        vec![
            DriverCall::TunerGain(87),
            DriverCall::IfGain {
                stage: 1,
                tenth_db: -10
            },
            DriverCall::AgcMode(true),
            DriverCall::DirectSampling(DirectSampling::QBranch),
            DriverCall::TunerGain(496),
            DriverCall::BiasTee(true),
        ]
    );

    // the parameter record reflects every applied change
    let params = server.params();
    assert_eq!(params.if_gain.get(&1), Some(&-10));
    assert!(params.agc);
    assert_eq!(params.direct_sampling, DirectSampling::QBranch);
    assert_eq!(params.tuner_gain, 496);
    assert!(params.bias_tee);

    server.shutdown(Duration::from_secs(5));
}

#[test]
fn sample_stream_is_ordered_with_no_torn_buffers() {
    let mock = MockConfig {
        block_len: 4096,
        pattern: Pattern::Counter,
        ..Default::default()
    };
    let words_per_block = 4096 / 4;
    let (_backend, mut server) = start(mock, 0);

    let mut stream = connect(&server);
    read_greeting(&mut stream);

    let bytes = read_bytes(&mut stream, 32 * 4096);
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect();

    // delivery starts on a buffer boundary
    assert_eq!(words[0] as usize % words_per_block, 0);

    // consecutive within buffers; only whole-buffer gaps allowed
    for pair in words.windows(2) {
        let delta = pair[1].wrapping_sub(pair[0]) as usize;
        assert!(delta >= 1, "stream went backwards: {} -> {}", pair[0], pair[1]);
        assert_eq!(
            (delta - 1) % words_per_block,
            0,
            "torn buffer between {} and {}",
            pair[0],
            pair[1]
        );
    }

    server.shutdown(Duration::from_secs(5));
}

#[test]
fn concurrent_clients_see_identical_bytes() {
    let mock = MockConfig {
        pattern: Pattern::Fill(0xA5),
        block_len: 4096,
        ..Default::default()
    };
    let (_backend, mut server) = start(mock, 0);

    let mut a = connect(&server);
    let mut b = connect(&server);
    read_greeting(&mut a);
    read_greeting(&mut b);

    let readers = [a, b].map(|mut stream| {
        thread::spawn(move || read_bytes(&mut stream, 32 * 1024))
    });
    for reader in readers {
        let bytes = reader.join().unwrap();
        assert!(bytes.iter().all(|&b| b == 0xA5));
    }

    server.shutdown(Duration::from_secs(5));
}

#[test]
fn slow_client_drops_without_disturbing_a_fast_one() {
    let mock = MockConfig {
        block_len: 16384,
        block_interval: Duration::from_millis(5),
        pattern: Pattern::Counter,
        ..Default::default()
    };
    // a tight byte budget (16 blocks) so the stalled client overflows fast
    let (_backend, mut server) = start(mock, 256 * 1024);

    let mut fast = connect(&server);
    read_greeting(&mut fast);
    let fast_reader = thread::spawn(move || read_bytes(&mut fast, 1024 * 1024));

    // the slow client reads its greeting and then nothing at all
    let mut slow = connect(&server);
    read_greeting(&mut slow);
    thread::sleep(Duration::from_millis(1500));

    let fast_bytes = fast_reader.join().unwrap();
    let words: Vec<u32> = fast_bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect();
    for pair in words.windows(2) {
        assert_eq!(
            pair[1],
            pair[0] + 1,
            "fast client lost samples while the slow client stalled"
        );
    }

    assert!(
        server.dropped_buffers() > 0,
        "the stalled client never overflowed its queue"
    );

    server.shutdown(Duration::from_secs(5));
}

#[test]
fn disconnect_unregisters_exactly_one_session() {
    let (_backend, mut server) = start(MockConfig::default(), 0);

    let mut a = connect(&server);
    let mut b = connect(&server);
    read_greeting(&mut a);
    read_greeting(&mut b);
    assert!(wait_until(Duration::from_secs(2), || {
        server.session_count() == 2
    }));

    drop(a);
    assert!(
        wait_until(Duration::from_secs(3), || server.session_count() == 1),
        "hub still holds the dead session"
    );

    // the survivor keeps streaming
    let bytes = read_bytes(&mut b, 4096);
    assert_eq!(bytes.len(), 4096);

    server.shutdown(Duration::from_secs(5));
}

#[test]
fn shutdown_with_streaming_clients_is_bounded() {
    let (_backend, mut server) = start(MockConfig::default(), 0);

    let mut clients = Vec::new();
    for _ in 0..3 {
        let mut stream = connect(&server);
        read_greeting(&mut stream);
        // each client is mid-stream when shutdown hits
        read_bytes(&mut stream, 8192);
        clients.push(stream);
    }

    let begun = Instant::now();
    server.shutdown(Duration::from_secs(5));
    assert!(begun.elapsed() < Duration::from_secs(5));

    // repeated shutdown is a no-op
    server.shutdown(Duration::from_secs(5));

    // every socket reaches EOF (or reset) quickly now
    for mut stream in clients {
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut sink = [0u8; 4096];
        loop {
            match stream.read(&mut sink) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    }
}

#[test]
fn half_frame_then_close_is_survived_by_the_server() {
    let (backend, mut server) = start(MockConfig::default(), 0);

    let mut stream = connect(&server);
    read_greeting(&mut stream);
    let baseline = backend.calls().len();

    // three bytes of a five-byte frame, then gone
    stream.write_all(&[0x01, 0x00, 0x01]).unwrap();
    drop(stream);

    assert!(wait_until(Duration::from_secs(3), || {
        server.session_count() == 0
    }));
    // the torn frame never became a command
    assert_eq!(backend.calls().len(), baseline);

    // and the server still accepts new clients
    let mut next = connect(&server);
    assert_eq!(&read_greeting(&mut next)[..4], b"RTL0");

    server.shutdown(Duration::from_secs(5));
}
