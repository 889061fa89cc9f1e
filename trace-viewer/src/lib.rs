//! Viewer-side library: transport receiver, symbolication, and the
//! source-line projection model. The binary in `main.rs` wires these to a
//! launched DBI host and an operator console; tests drive them over an
//! in-process segment.

pub mod commands;
pub mod config;
pub mod logger;
pub mod model;
pub mod projection;
pub mod receiver;
pub mod session;
pub mod symbolicate;
