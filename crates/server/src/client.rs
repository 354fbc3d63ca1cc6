// Copyright 2025-2026 CEMAXECUTER LLC

//! Per-connection state machine.
//!
//! greeting-pending -> running -> draining -> closed. The greeting goes out
//! before the session registers with the hub, so no sample byte can precede
//! it. Draining runs exactly once: it unregisters the session, closes both
//! socket directions and joins the writer before the connection thread
//! exits.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError};
use rk_driver::SampleBuf;

use crate::command::Command;
use crate::controller::ControlHandle;
use crate::hub::BroadcastHub;
use crate::wire::{CommandFrame, Greeting, CMD_FRAME_LEN};

/// How long the RX loop blocks before rechecking the drain flag.
const RX_POLL: Duration = Duration::from_millis(500);
/// How long the TX loop waits for the next buffer before rechecking.
const TX_POLL: Duration = Duration::from_millis(100);

/// Handle kept by the listener for shutdown and reaping.
pub struct ClientHandle {
    addr: SocketAddr,
    closing: Arc<AtomicBool>,
    stream: TcpStream,
    thread: JoinHandle<()>,
}

impl ClientHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Ask the connection to drain. Safe to call repeatedly; the socket is
    /// force-closed so both loops fail out promptly.
    pub fn signal_drain(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    pub fn join(self) {
        if self.thread.join().is_err() {
            log::error!("client {} thread panicked", self.addr);
        }
    }
}

/// Start the connection state machine for one accepted socket.
pub fn spawn(
    stream: TcpStream,
    addr: SocketAddr,
    hub: Arc<BroadcastHub>,
    control: ControlHandle,
    greeting: Greeting,
) -> std::io::Result<ClientHandle> {
    // sample writes are latency-sensitive and already buffer-sized
    if let Err(e) = stream.set_nodelay(true) {
        log::warn!("client {}: set_nodelay failed: {}", addr, e);
    }

    let closing = Arc::new(AtomicBool::new(false));
    let handle_stream = stream.try_clone()?;
    let thread_closing = Arc::clone(&closing);
    let thread = thread::Builder::new()
        .name(format!("client-{}", addr))
        .spawn(move || run(stream, addr, hub, control, greeting, thread_closing))?;

    Ok(ClientHandle {
        addr,
        closing,
        stream: handle_stream,
        thread,
    })
}

fn run(
    mut stream: TcpStream,
    addr: SocketAddr,
    hub: Arc<BroadcastHub>,
    control: ControlHandle,
    greeting: Greeting,
    closing: Arc<AtomicBool>,
) {
    // greeting-pending
    if let Err(e) = stream.write_all(&greeting.encode()) {
        log::info!("client {} lost during greeting: {}", addr, e);
        return;
    }

    // running: register for samples and split off the writer
    let (session_id, samples) = hub.register();
    let writer_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            log::error!("client {}: stream clone failed: {}", addr, e);
            hub.unregister(session_id);
            return;
        }
    };

    let writer_closing = Arc::clone(&closing);
    let writer = thread::Builder::new()
        .name(format!("client-tx-{}", addr))
        .spawn(move || tx_loop(writer_stream, samples, writer_closing));

    rx_loop(&mut stream, addr, &control, &closing);

    // draining: one unregistration, then tear the socket down
    closing.store(true, Ordering::SeqCst);
    let dropped = hub.unregister(session_id);
    let _ = stream.shutdown(Shutdown::Both);
    match writer {
        Ok(writer) => {
            if writer.join().is_err() {
                log::error!("client {}: writer thread panicked", addr);
            }
        }
        Err(e) => log::error!("client {}: writer spawn failed: {}", addr, e),
    }

    // closed
    log::info!("client {} disconnected ({} buffers dropped)", addr, dropped);
}

/// Dequeue sample buffers and write each one out in full. A short write is
/// retried inside `write_all`; whole buffers are the only unit on the wire.
fn tx_loop(mut stream: TcpStream, samples: Receiver<Arc<SampleBuf>>, closing: Arc<AtomicBool>) {
    loop {
        if closing.load(Ordering::SeqCst) {
            return;
        }
        match samples.recv_timeout(TX_POLL) {
            Ok(buf) => {
                if let Err(e) = stream.write_all(&buf.bytes) {
                    log::debug!("sample write failed: {}", e);
                    closing.store(true, Ordering::SeqCst);
                    let _ = stream.shutdown(Shutdown::Both);
                    return;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Read exact 5-byte command frames, accumulating partial reads. EOF on a
/// frame boundary is a clean close; EOF inside a frame is a protocol error.
/// Either way the connection drains.
fn rx_loop(stream: &mut TcpStream, addr: SocketAddr, control: &ControlHandle, closing: &AtomicBool) {
    if let Err(e) = stream.set_read_timeout(Some(RX_POLL)) {
        log::warn!("client {}: set_read_timeout failed: {}", addr, e);
    }

    let mut frame = [0u8; CMD_FRAME_LEN];
    let mut filled = 0usize;

    loop {
        if closing.load(Ordering::SeqCst) {
            return;
        }
        match stream.read(&mut frame[filled..]) {
            Ok(0) => {
                if filled == 0 {
                    log::debug!("client {} closed", addr);
                } else {
                    log::warn!("client {} closed inside a command frame", addr);
                }
                return;
            }
            Ok(n) => {
                filled += n;
                if filled == CMD_FRAME_LEN {
                    filled = 0;
                    let parsed = CommandFrame::decode(&frame);
                    match Command::from_frame(parsed) {
                        Some(command) => {
                            log::debug!("client {}: {:?}", addr, command);
                            control.apply(command);
                        }
                        None => log::debug!(
                            "client {}: ignoring unknown command 0x{:02x}",
                            addr,
                            parsed.code
                        ),
                    }
                }
            }
            Err(e)
                if e.kind() == ErrorKind::WouldBlock
                    || e.kind() == ErrorKind::TimedOut
                    || e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                log::debug!("client {} read error: {}", addr, e);
                return;
            }
        }
    }
}
