//! Seam to the DBI host.
//!
//! The host supplies module callbacks, instruction queries, and the
//! clean-call primitive; the library code consumes them through the plain
//! data types here. The raw DynamoRIO translation layer lives in [`ffi`]
//! behind the `dynamorio` feature.

use once_cell::sync::Lazy;
use std::time::Instant;

/// Module load/unload notification as delivered by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDetails {
    pub start: u64,
    pub end: u64,
    /// Full image path, UTF-8. The host hands it over in OS encoding; the
    /// FFI layer transcodes at the boundary.
    pub path: String,
}

/// One application-level instruction inside a discovered block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub pc: u64,
    pub length: u32,
}

/// Extracts the `--channel <name>` argument from the client's argv.
pub fn channel_from_args<I, S>(args: I) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        if arg.as_ref() == "--channel" {
            return iter.next().map(|s| s.as_ref().to_owned());
        }
    }
    None
}

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic microseconds for event timestamps. The FFI layer prefers the
/// host's own clock; this fallback serves the library and its tests.
pub fn monotonic_micros() -> u64 {
    EPOCH.elapsed().as_micros() as u64
}

#[cfg(all(windows, feature = "dynamorio"))]
pub mod ffi;
