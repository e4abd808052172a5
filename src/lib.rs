//! # obftun
//!
//! A point-to-point layer-2 tunnel over mutually authenticated TLS that
//! looks like an ordinary HTTPS site to anyone without a trusted client
//! certificate.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Session loops (client reconnect / server accept)       │
//! ├──────────────────────────────┬──────────────────────────┤
//! │  Authentication gate         │  Decoy responder         │
//! ├──────────────────────────────┴──────────────────────────┤
//! │  Framed relay (u32 BE length + packet)                  │
//! ├─────────────────────────────────────────────────────────┤
//! │  Interface lifecycle (TAP device + up/down script)      │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! The client always reconnects after transport or protocol faults and
//! stops on interface faults. The server gives every connection its own
//! task: verified peers get an interface and a relay, everyone else gets a
//! live copy of a reference web site.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod client;
pub mod config;
pub mod decoy;
pub mod error;
pub mod forward;
pub mod iface;
pub mod retry;
pub mod session;
pub mod tls;
pub mod tunnel;

#[cfg(feature = "server")]
pub mod server;

pub use config::TunnelConfig;
pub use error::{Error, Fault, Result};
pub use session::Role;
