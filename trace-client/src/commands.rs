//! Command-ring poller and the active-range table it maintains.
//!
//! The table is read concurrently by instrumentation threads through
//! [`should_instrument`]; only the poller thread writes. Slots in
//! `[0, count)` are write-once: `add` fills new slots first and publishes
//! the enlarged count with a Release store, so an Acquire reader never
//! observes a slot it cannot read.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use shared::constants::{COMMAND_POLL_INTERVAL_MS, MAX_RANGES_PER_COMMAND};
use shared::{AddressRange, Command};

use crate::context::AgentContext;

pub const RANGE_TABLE_CAPACITY: usize = 256;

pub struct RangeTable {
    count: AtomicUsize,
    slots: [UnsafeCell<AddressRange>; RANGE_TABLE_CAPACITY],
}

// SAFETY: single writer (the poller); readers only touch slots below the
// Acquire-loaded count, which the writer filled before publishing.
unsafe impl Sync for RangeTable {}

impl RangeTable {
    pub fn new() -> Self {
        const EMPTY: AddressRange = AddressRange {
            base: 0,
            begin_rva: 0,
            end_rva: 0,
        };
        Self {
            count: AtomicUsize::new(0),
            slots: [const { UnsafeCell::new(EMPTY) }; RANGE_TABLE_CAPACITY],
        }
    }

    pub fn clear(&self) {
        self.count.store(0, Ordering::Release);
    }

    /// Appends up to the record limit and the remaining table capacity;
    /// anything beyond is discarded.
    pub fn add(&self, ranges: &[AddressRange]) {
        let current = self.count.load(Ordering::Relaxed);
        let room = RANGE_TABLE_CAPACITY - current;
        let take = ranges.len().min(MAX_RANGES_PER_COMMAND).min(room);
        for (i, range) in ranges[..take].iter().enumerate() {
            unsafe { *self.slots[current + i].get() = *range };
        }
        self.count.store(current + take, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, pc: u64) -> bool {
        let count = self.count.load(Ordering::Acquire);
        (0..count).any(|i| {
            let range = unsafe { *self.slots[i].get() };
            let begin = range.base.wrapping_add(range.begin_rva);
            let end = range.base.wrapping_add(range.end_rva);
            pc >= begin && pc < end
        })
    }
}

impl Default for RangeTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Range-filtered block selection predicate. An empty table accepts every
/// PC. Wired for pre-trigger filtering; the block-insertion path does not
/// consult it.
pub fn should_instrument(table: &RangeTable, pc: u64) -> bool {
    table.is_empty() || table.contains(pc)
}

/// [`should_instrument`] against the context's active table.
pub fn should_instrument_pc(ctx: &AgentContext, pc: u64) -> bool {
    should_instrument(ctx.ranges(), pc)
}

/// Number of ranges currently active; diagnostics and tests.
pub fn active_range_count(ctx: &AgentContext) -> usize {
    ctx.ranges().len()
}

/// Applies one dequeued command to the table.
pub(crate) fn apply(table: &RangeTable, command: Command) {
    match command {
        Command::AddRanges { count, ranges } => table.add(&ranges[..count]),
        Command::ClearRanges => table.clear(),
    }
}

/// Drains everything currently queued on the command ring. Returns the
/// number of records handled.
pub(crate) fn poll_once(ctx: &AgentContext) -> usize {
    let mut handled = 0;
    while let Some(record) = ctx.pop_command() {
        match record.decode() {
            Some(command) => apply(ctx.ranges(), command),
            None => log::warn!("ignoring command with unknown tag"),
        }
        handled += 1;
    }
    handled
}

/// Dedicated polling thread; sleep-based, no OS event primitive.
pub(crate) fn spawn_poller(ctx: Arc<AgentContext>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("command_poller".into())
        .spawn(move || {
            log::debug!("command poller running");
            while !ctx.shutdown_requested() {
                poll_once(&ctx);
                thread::sleep(Duration::from_millis(COMMAND_POLL_INTERVAL_MS));
            }
            log::debug!("command poller exiting");
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(base: u64, begin: u64, end: u64) -> AddressRange {
        AddressRange {
            base,
            begin_rva: begin,
            end_rva: end,
        }
    }

    #[test]
    fn empty_table_accepts_everything() {
        let table = RangeTable::new();
        assert!(should_instrument(&table, 0));
        assert!(should_instrument(&table, u64::MAX));
    }

    #[test]
    fn populated_table_gates_by_absolute_address() {
        let table = RangeTable::new();
        table.add(&[range(0x40_0000, 0x1000, 0x2000)]);
        assert!(should_instrument(&table, 0x40_1000));
        assert!(should_instrument(&table, 0x40_1FFF));
        assert!(!should_instrument(&table, 0x40_2000));
        assert!(!should_instrument(&table, 0x40_0FFF));
    }

    #[test]
    fn add_clamps_to_command_limit() {
        let table = RangeTable::new();
        let ranges: Vec<AddressRange> =
            (0..12).map(|i| range(0x1000 * i, 0, 0x10)).collect();
        table.add(&ranges);
        assert_eq!(table.len(), MAX_RANGES_PER_COMMAND);
    }

    #[test]
    fn add_clamps_to_table_capacity() {
        let table = RangeTable::new();
        let batch: Vec<AddressRange> = (0..8).map(|i| range(0x1000 * i, 0, 0x10)).collect();
        for _ in 0..40 {
            table.add(&batch);
        }
        assert_eq!(table.len(), RANGE_TABLE_CAPACITY);
        // Saturated table: further adds are discarded, not wrapped.
        table.add(&batch);
        assert_eq!(table.len(), RANGE_TABLE_CAPACITY);
    }

    #[test]
    fn clear_resets_count() {
        let table = RangeTable::new();
        table.add(&[range(0, 0, 1)]);
        assert!(!table.is_empty());
        table.clear();
        assert!(table.is_empty());
        assert!(should_instrument(&table, 12345));
    }

    #[test]
    fn clear_then_add_leaves_exactly_the_new_ranges() {
        let table = RangeTable::new();
        table.add(&[range(0x10_0000, 0, 0x100), range(0x20_0000, 0, 0x100)]);
        table.clear();
        table.add(&[range(0x30_0000, 0, 0x100)]);
        assert_eq!(table.len(), 1);
        assert!(table.contains(0x30_0050));
        assert!(!table.contains(0x10_0050));
    }

    #[test]
    fn apply_dispatches_both_kinds() {
        let table = RangeTable::new();
        apply(
            &table,
            Command::AddRanges {
                count: 1,
                ranges: [range(0x40_0000, 0, 0x10); MAX_RANGES_PER_COMMAND],
            },
        );
        assert_eq!(table.len(), 1);
        apply(&table, Command::ClearRanges);
        assert!(table.is_empty());
    }
}
