/// Value of `ShmHeader::magic` for an initialized segment ("RBTR" as LE bytes).
pub const SHM_MAGIC: u32 = 0x5254_4252;

/// Slot count of the event ring. Must stay a power of two.
pub const EVENT_CAPACITY: usize = 1 << 15;

/// Slot count of the command ring. Must stay a power of two.
pub const COMMAND_CAPACITY: usize = 1024;

/// Size in bytes of the append-only module-path arena.
pub const STRING_HEAP_SIZE: usize = 16_384;

/// Upper bound on address ranges carried by a single command record.
pub const MAX_RANGES_PER_COMMAND: usize = 8;

/// Prefix for the ephemeral segment name; the viewer appends a UUID.
pub const CHANNEL_NAME_PREFIX: &str = r"Local\bbtrace_shm_";

/// The viewer polls `Segment::open_existing` this many times while the
/// DBI host starts up, sleeping [`ATTACH_RETRY_INTERVAL_MS`] between tries.
pub const ATTACH_RETRY_COUNT: u32 = 300;
pub const ATTACH_RETRY_INTERVAL_MS: u64 = 100;

/// Sleep between command-ring polls in the agent.
pub const COMMAND_POLL_INTERVAL_MS: u64 = 10;

/// Channel id carried in the segment header, derived from the first two
/// UTF-16 units of the segment name. Both sides compute it from the same
/// `--channel` string, so a stale mapping under a reused name is rejected
/// by `Segment::verify`.
pub fn channel_id_for(name: &str) -> u32 {
    let mut units = name.encode_utf16();
    let hi = u32::from(units.next().unwrap_or(0));
    let lo = u32::from(units.next().unwrap_or(0));
    (hi << 16) + lo
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_id_uses_first_two_utf16_units() {
        let id = channel_id_for("Lo");
        assert_eq!(id, (u32::from(b'L') << 16) + u32::from(b'o'));
    }

    #[test]
    fn channel_id_tolerates_short_names() {
        assert_eq!(channel_id_for(""), 0);
        assert_eq!(channel_id_for("A"), u32::from(b'A') << 16);
    }

    #[test]
    fn capacities_are_powers_of_two() {
        assert!(EVENT_CAPACITY.is_power_of_two());
        assert!(COMMAND_CAPACITY.is_power_of_two());
    }
}
