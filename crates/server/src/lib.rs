// Copyright 2025-2026 CEMAXECUTER LLC

//! rtl_tcp-compatible sample server core.
//!
//! One producer thread per opened device feeds a broadcast hub; each TCP
//! client gets a bounded queue fed by the hub and a pair of socket loops.
//! A slow client loses whole buffers, never stalls the producer, and never
//! affects other clients.

pub mod client;
pub mod command;
pub mod controller;
pub mod error;
pub mod hub;
pub mod server;
pub mod wire;

pub use command::Command;
pub use controller::{ControlHandle, Params, RadioController, TunerConfig};
pub use error::{Error, Result};
pub use hub::BroadcastHub;
pub use server::{Server, ServerConfig};
pub use wire::Greeting;
