// Copyright 2025-2026 CEMAXECUTER LLC

//! Server lifecycle: bind, accept, and ordered shutdown.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rk_driver::RadioBackend;

use crate::client::{self, ClientHandle};
use crate::controller::{ControlHandle, Params, RadioController, TunerConfig};
use crate::error::Result;
use crate::hub::BroadcastHub;
use crate::wire::Greeting;

const ACCEPT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: IpAddr,
    pub port: u16,
    pub device_index: u32,
    /// Select the device by USB serial instead of index.
    pub serial: Option<String>,
    /// Per-client queue budget in bytes; 0 sizes it to about one second of
    /// samples at the configured rate.
    pub queue_bytes: usize,
    pub tuner: TunerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 1234,
            device_index: 0,
            serial: None,
            queue_bytes: 0,
            tuner: TunerConfig::default(),
        }
    }
}

pub struct Server {
    controller: RadioController,
    hub: Arc<BroadcastHub>,
    local_addr: SocketAddr,
    shutting_down: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
    clients: Arc<Mutex<Vec<ClientHandle>>>,
}

impl Server {
    /// Open the device, start streaming, and begin accepting clients.
    pub fn start(backend: &dyn RadioBackend, config: &ServerConfig) -> Result<Server> {
        let queue_bytes = if config.queue_bytes == 0 {
            // one second of interleaved I/Q bytes
            2 * config.tuner.sample_rate as usize
        } else {
            config.queue_bytes
        };
        let depth = BroadcastHub::queue_depth(queue_bytes, backend.buffer_len());
        let hub = Arc::new(BroadcastHub::new(depth));

        let controller = RadioController::start(
            backend,
            config.device_index,
            config.serial.as_deref(),
            &config.tuner,
            Arc::clone(&hub),
        )?;

        let listener = TcpListener::bind(SocketAddr::new(config.address, config.port))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        log::info!(
            "listening on {} (client queue {} buffers)",
            local_addr,
            depth
        );

        let shutting_down = Arc::new(AtomicBool::new(false));
        let clients = Arc::new(Mutex::new(Vec::new()));

        let accept_thread = {
            let hub = Arc::clone(&hub);
            let control = controller.handle();
            let greeting = controller.greeting();
            let clients = Arc::clone(&clients);
            let shutting_down = Arc::clone(&shutting_down);
            thread::Builder::new()
                .name("tcp-listener".to_string())
                .spawn(move || {
                    accept_loop(listener, hub, control, greeting, clients, shutting_down)
                })?
        };

        Ok(Server {
            controller,
            hub,
            local_addr,
            shutting_down,
            accept_thread: Some(accept_thread),
            clients,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sessions currently registered with the hub.
    pub fn session_count(&self) -> usize {
        self.hub.session_count()
    }

    /// Buffers lost to slow clients since startup.
    pub fn dropped_buffers(&self) -> u64 {
        self.hub.total_dropped()
    }

    /// Last successfully applied device parameters.
    pub fn params(&self) -> Params {
        self.controller.params()
    }

    /// Stop accepting, stop the producer, then drain every client.
    ///
    /// Bounded by `timeout`: sockets are force-closed up front, so a client
    /// thread that has not finished by the deadline is left to die detached
    /// rather than block shutdown. Safe to call repeatedly.
    pub fn shutdown(&mut self, timeout: Duration) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        log::info!("shutting down");
        if let Some(accept) = self.accept_thread.take() {
            if accept.join().is_err() {
                log::error!("listener thread panicked");
            }
        }

        self.controller.stop();

        let pending: Vec<ClientHandle> = {
            let mut clients = self.clients.lock().unwrap();
            clients.drain(..).collect()
        };
        for client in &pending {
            client.signal_drain();
        }

        let deadline = Instant::now() + timeout;
        let mut pending = pending;
        while !pending.is_empty() && Instant::now() < deadline {
            let (done, still): (Vec<_>, Vec<_>) =
                pending.into_iter().partition(ClientHandle::is_finished);
            for client in done {
                client.join();
            }
            pending = still;
            if !pending.is_empty() {
                thread::sleep(Duration::from_millis(10));
            }
        }
        for client in &pending {
            log::warn!("client {} still draining at shutdown timeout", client.addr());
        }

        log::info!("server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown(Duration::from_secs(5));
    }
}

fn accept_loop(
    listener: TcpListener,
    hub: Arc<BroadcastHub>,
    control: ControlHandle,
    greeting: Greeting,
    clients: Arc<Mutex<Vec<ClientHandle>>>,
    shutting_down: Arc<AtomicBool>,
) {
    while !shutting_down.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, addr)) => {
                log::info!("client connected: {}", addr);
                match client::spawn(stream, addr, Arc::clone(&hub), control.clone(), greeting) {
                    Ok(handle) => {
                        let mut clients = clients.lock().unwrap();
                        // reap connections that already finished on their own
                        clients.retain(|c| !c.is_finished());
                        clients.push(handle);
                    }
                    Err(e) => log::error!("client {}: spawn failed: {}", addr, e),
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                // accept failures during shutdown are expected noise
                if !shutting_down.load(Ordering::SeqCst) {
                    log::error!("accept failed: {}", e);
                }
            }
        }
    }
    log::debug!("listener thread exiting");
}
