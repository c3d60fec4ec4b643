// src/connection/mod.rs

//! Peer link lifecycle: the inbound connection handler and the shared
//! login/reader/writer plumbing the outbound manager links reuse.

pub mod handler;

pub use handler::PeerConnection;
