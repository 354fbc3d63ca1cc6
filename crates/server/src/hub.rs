// Copyright 2025-2026 CEMAXECUTER LLC

//! One-producer many-consumer distributor for sample buffers.
//!
//! The producer thread must never stall on a slow socket, so every session
//! gets a bounded queue and `publish` only ever does a `try_send`: when a
//! queue is full that session loses the buffer and the loss is counted.
//! Whole buffers are dropped or delivered, never split.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use rk_driver::SampleBuf;

/// Floor for the per-session queue depth.
pub const MIN_QUEUE_BUFS: usize = 4;

struct Session {
    id: u64,
    tx: Sender<Arc<SampleBuf>>,
    dropped: u64,
}

pub struct BroadcastHub {
    sessions: Mutex<Vec<Session>>,
    next_id: AtomicU64,
    queue_bufs: usize,
    total_dropped: AtomicU64,
}

impl BroadcastHub {
    pub fn new(queue_bufs: usize) -> Self {
        Self {
            sessions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            queue_bufs: queue_bufs.max(MIN_QUEUE_BUFS),
            total_dropped: AtomicU64::new(0),
        }
    }

    /// Queue depth in buffers for a byte budget and a nominal buffer size.
    pub fn queue_depth(queue_bytes: usize, buf_len: usize) -> usize {
        (queue_bytes / buf_len.max(1)).max(MIN_QUEUE_BUFS)
    }

    /// Add a session; the receiver is the session's TX feed.
    pub fn register(&self) -> (u64, Receiver<Arc<SampleBuf>>) {
        let (tx, rx) = channel::bounded(self.queue_bufs);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.lock().unwrap().push(Session {
            id,
            tx,
            dropped: 0,
        });
        log::debug!("session {} registered", id);
        (id, rx)
    }

    /// Remove a session; returns how many buffers it lost to backpressure.
    /// Removing an unknown id is a no-op.
    pub fn unregister(&self, id: u64) -> u64 {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.iter().position(|s| s.id == id) {
            Some(i) => {
                let session = sessions.swap_remove(i);
                log::debug!(
                    "session {} unregistered ({} buffers dropped)",
                    id,
                    session.dropped
                );
                session.dropped
            }
            None => 0,
        }
    }

    /// Hand `buf` to every registered session. Non-blocking, O(sessions).
    pub fn publish(&self, buf: Arc<SampleBuf>) {
        let mut sessions = self.sessions.lock().unwrap();
        for session in sessions.iter_mut() {
            match session.tx.try_send(Arc::clone(&buf)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    session.dropped += 1;
                    self.total_dropped.fetch_add(1, Ordering::Relaxed);
                    if session.dropped == 1 || session.dropped % 512 == 0 {
                        log::warn!(
                            "session {} slow: {} buffers dropped",
                            session.id,
                            session.dropped
                        );
                    }
                }
                // session is already tearing down; unregister reaps it
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Buffers lost to backpressure across all sessions, ever.
    pub fn total_dropped(&self) -> u64 {
        self.total_dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(tag: u8) -> Arc<SampleBuf> {
        Arc::new(SampleBuf {
            bytes: vec![tag; 8],
        })
    }

    #[test]
    fn test_publish_order() {
        let hub = BroadcastHub::new(8);
        let (_a, rx_a) = hub.register();
        let (_b, rx_b) = hub.register();

        for tag in 0..3 {
            hub.publish(buf(tag));
        }

        for rx in [rx_a, rx_b] {
            for tag in 0..3u8 {
                assert_eq!(rx.recv().unwrap().bytes[0], tag);
            }
        }
        assert_eq!(hub.total_dropped(), 0);
    }

    #[test]
    fn test_full_queue_drops() {
        let hub = BroadcastHub::new(4);
        let (id, rx) = hub.register();

        for tag in 0..10 {
            hub.publish(buf(tag));
        }

        // the first four made it, the rest were dropped for this session
        for tag in 0..4u8 {
            assert_eq!(rx.recv().unwrap().bytes[0], tag);
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(hub.total_dropped(), 6);
        assert_eq!(hub.unregister(id), 6);
    }

    #[test]
    fn test_unregister() {
        let hub = BroadcastHub::new(4);
        let (id, _rx) = hub.register();
        assert_eq!(hub.session_count(), 1);
        hub.unregister(id);
        assert_eq!(hub.session_count(), 0);
        // double unregister is a no-op
        assert_eq!(hub.unregister(id), 0);
    }

    #[test]
    fn test_queue_depth() {
        assert_eq!(BroadcastHub::queue_depth(1, 262_144), MIN_QUEUE_BUFS);
        assert_eq!(BroadcastHub::queue_depth(4_096_000, 262_144), 15);
    }
}
