#![forbid(unsafe_code)]

//! Chat rooms for classes: password-gated rooms, a real-time QUIC hub and a
//! REST surface for room lifecycle.

pub mod config;
pub mod quic;
pub mod server;
pub mod util;
