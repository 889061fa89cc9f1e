//! On-wire layout of the shared segment.
//!
//! Both processes map the same region and interpret it through the structs
//! below, so every offset is fixed byte-for-byte (little-endian, x86-64
//! only). Record structs are `#[repr(C, packed)]` to match the producer's
//! and consumer's view exactly; the ring headers are `#[repr(C)]` over
//! `AtomicU32` fields, which occupy the same bytes as plain `u32`s.
//!
//! Layout of the whole segment:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ ShmHeader    magic / channel / pid / caps    │  20 B
//! ├──────────────────────────────────────────────┤
//! │ RingHeader   event ring cursors              │  16 B
//! │ EventRecord[32768]                           │  36 B each
//! ├──────────────────────────────────────────────┤
//! │ RingHeader   command ring cursors            │  16 B
//! │ CommandRecord[1024]                          │  196 B each
//! ├──────────────────────────────────────────────┤
//! │ u8[16384]    string heap (module paths)      │
//! └──────────────────────────────────────────────┘
//! ```

use std::sync::atomic::AtomicU32;

use static_assertions::const_assert_eq;

use crate::constants::{COMMAND_CAPACITY, EVENT_CAPACITY, MAX_RANGES_PER_COMMAND, STRING_HEAP_SIZE};

/// Fixed header written exactly once by whichever side creates the mapping.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ShmHeader {
    pub magic: u32,
    pub channel: u32,
    pub producer_pid: u32,
    pub event_capacity: u32,
    pub command_capacity: u32,
}

/// Cursor block of one SPSC ring. Indices are free-running modulo
/// `capacity`; `dropped` counts producer-side rejections and is for
/// diagnostics only.
#[repr(C)]
pub struct RingHeader {
    pub capacity: AtomicU32,
    pub write: AtomicU32,
    pub read: AtomicU32,
    pub dropped: AtomicU32,
}

/// One executed basic block. `app_pc_end` is exclusive.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct BasicBlockEvent {
    pub pid: u32,
    pub tid: u32,
    pub timestamp_us: u64,
    pub app_pc_start: u64,
    pub app_pc_end: u64,
}

/// Module load or unload. `path_index`/`path_len` address a UTF-8 byte
/// region in the string heap; only loads carry a path.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct ModuleEvent {
    pub pid: u32,
    pub base: u64,
    pub size: u64,
    pub path_len: u32,
    pub path_index: u16,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
union EventPayload {
    basic_block: BasicBlockEvent,
    module: ModuleEvent,
}

const EVENT_KIND_BASIC_BLOCK: u16 = 0;
const EVENT_KIND_MODULE_ADD: u16 = 1;
const EVENT_KIND_MODULE_REMOVE: u16 = 2;

/// Tagged record flowing producer → consumer through the event ring.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct EventRecord {
    kind: u16,
    _pad: u16,
    payload: EventPayload,
}

/// Decoded view of an [`EventRecord`].
#[derive(Debug, Clone, Copy)]
pub enum Event {
    BasicBlockHit(BasicBlockEvent),
    ModuleAdd(ModuleEvent),
    ModuleRemove(ModuleEvent),
}

impl EventRecord {
    pub fn basic_block(
        pid: u32,
        tid: u32,
        timestamp_us: u64,
        app_pc_start: u64,
        app_pc_end: u64,
    ) -> Self {
        Self {
            kind: EVENT_KIND_BASIC_BLOCK,
            _pad: 0,
            payload: EventPayload {
                basic_block: BasicBlockEvent {
                    pid,
                    tid,
                    timestamp_us,
                    app_pc_start,
                    app_pc_end,
                },
            },
        }
    }

    pub fn module_add(pid: u32, base: u64, size: u64, path_index: u16, path_len: u32) -> Self {
        Self {
            kind: EVENT_KIND_MODULE_ADD,
            _pad: 0,
            payload: EventPayload {
                module: ModuleEvent {
                    pid,
                    base,
                    size,
                    path_len,
                    path_index,
                },
            },
        }
    }

    pub fn module_remove(pid: u32, base: u64) -> Self {
        Self {
            kind: EVENT_KIND_MODULE_REMOVE,
            _pad: 0,
            payload: EventPayload {
                module: ModuleEvent {
                    pid,
                    base,
                    size: 0,
                    path_len: 0,
                    path_index: 0,
                },
            },
        }
    }

    /// `None` for an unrecognized tag (a newer producer, or a corrupt slot).
    pub fn decode(&self) -> Option<Event> {
        match self.kind {
            // The union reads only reinterpret bytes written by the
            // constructors above; every field type is valid for any bits.
            EVENT_KIND_BASIC_BLOCK => Some(Event::BasicBlockHit(unsafe {
                self.payload.basic_block
            })),
            EVENT_KIND_MODULE_ADD => Some(Event::ModuleAdd(unsafe { self.payload.module })),
            EVENT_KIND_MODULE_REMOVE => Some(Event::ModuleRemove(unsafe { self.payload.module })),
            _ => None,
        }
    }
}

/// Half-open RVA window relative to a module base.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub base: u64,
    pub begin_rva: u64,
    pub end_rva: u64,
}

const COMMAND_KIND_ADD_RANGES: u16 = 0;
const COMMAND_KIND_CLEAR_RANGES: u16 = 1;

/// Tagged record flowing consumer → producer through the command ring.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct CommandRecord {
    kind: u16,
    range_count: u16,
    ranges: [AddressRange; MAX_RANGES_PER_COMMAND],
}

/// Decoded view of a [`CommandRecord`]. `count` is already clamped to the
/// record limit.
#[derive(Debug, Clone, Copy)]
pub enum Command {
    AddRanges {
        count: usize,
        ranges: [AddressRange; MAX_RANGES_PER_COMMAND],
    },
    ClearRanges,
}

impl CommandRecord {
    const EMPTY_RANGE: AddressRange = AddressRange {
        base: 0,
        begin_rva: 0,
        end_rva: 0,
    };

    /// Builds an `AddRanges` record from at most the first eight ranges.
    pub fn add_ranges(ranges: &[AddressRange]) -> Self {
        let count = ranges.len().min(MAX_RANGES_PER_COMMAND);
        let mut slots = [Self::EMPTY_RANGE; MAX_RANGES_PER_COMMAND];
        slots[..count].copy_from_slice(&ranges[..count]);
        Self {
            kind: COMMAND_KIND_ADD_RANGES,
            range_count: count as u16,
            ranges: slots,
        }
    }

    pub fn clear_ranges() -> Self {
        Self {
            kind: COMMAND_KIND_CLEAR_RANGES,
            range_count: 0,
            ranges: [Self::EMPTY_RANGE; MAX_RANGES_PER_COMMAND],
        }
    }

    pub fn decode(&self) -> Option<Command> {
        match self.kind {
            COMMAND_KIND_ADD_RANGES => Some(Command::AddRanges {
                count: usize::from(self.range_count).min(MAX_RANGES_PER_COMMAND),
                ranges: self.ranges,
            }),
            COMMAND_KIND_CLEAR_RANGES => Some(Command::ClearRanges),
            _ => None,
        }
    }
}

/// The full segment. Never constructed by value; both sides interpret the
/// mapped region through this type.
#[repr(C)]
pub struct ShmLayout {
    pub header: ShmHeader,
    pub event_header: RingHeader,
    pub event_buffer: [EventRecord; EVENT_CAPACITY],
    pub command_header: RingHeader,
    pub command_buffer: [CommandRecord; COMMAND_CAPACITY],
    pub strings: [u8; STRING_HEAP_SIZE],
}

// Byte-for-byte layout pins. Any drift here breaks cross-process decoding.
const_assert_eq!(size_of::<ShmHeader>(), 20);
const_assert_eq!(size_of::<RingHeader>(), 16);
const_assert_eq!(size_of::<BasicBlockEvent>(), 32);
const_assert_eq!(size_of::<ModuleEvent>(), 26);
const_assert_eq!(size_of::<EventRecord>(), 36);
const_assert_eq!(size_of::<AddressRange>(), 24);
const_assert_eq!(size_of::<CommandRecord>(), 196);
const_assert_eq!(std::mem::offset_of!(ShmLayout, event_header), 20);
const_assert_eq!(std::mem::offset_of!(ShmLayout, event_buffer), 36);
const_assert_eq!(
    std::mem::offset_of!(ShmLayout, command_header),
    36 + 36 * EVENT_CAPACITY
);
const_assert_eq!(
    std::mem::offset_of!(ShmLayout, command_buffer),
    52 + 36 * EVENT_CAPACITY
);
const_assert_eq!(
    std::mem::offset_of!(ShmLayout, strings),
    52 + 36 * EVENT_CAPACITY + 196 * COMMAND_CAPACITY
);
const_assert_eq!(size_of::<ShmLayout>(), 1_396_788);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_block_round_trips() {
        let rec = EventRecord::basic_block(7, 11, 123_456, 0x40_1000, 0x40_1010);
        match rec.decode() {
            Some(Event::BasicBlockHit(bb)) => {
                assert_eq!({ bb.pid }, 7);
                assert_eq!({ bb.tid }, 11);
                assert_eq!({ bb.timestamp_us }, 123_456);
                assert_eq!({ bb.app_pc_start }, 0x40_1000);
                assert_eq!({ bb.app_pc_end }, 0x40_1010);
            }
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn module_add_round_trips() {
        let rec = EventRecord::module_add(3, 0x40_0000, 0x1000, 42, 5);
        match rec.decode() {
            Some(Event::ModuleAdd(m)) => {
                assert_eq!({ m.base }, 0x40_0000);
                assert_eq!({ m.size }, 0x1000);
                assert_eq!({ m.path_index }, 42);
                assert_eq!({ m.path_len }, 5);
            }
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn unknown_event_kind_decodes_to_none() {
        let mut rec = EventRecord::module_remove(1, 0x40_0000);
        rec.kind = 0xFFFF;
        assert!(rec.decode().is_none());
    }

    #[test]
    fn add_ranges_clamps_to_record_limit() {
        let range = AddressRange {
            base: 0x40_0000,
            begin_rva: 0x10,
            end_rva: 0x20,
        };
        let rec = CommandRecord::add_ranges(&[range; 12]);
        match rec.decode() {
            Some(Command::AddRanges { count, ranges }) => {
                assert_eq!(count, MAX_RANGES_PER_COMMAND);
                assert_eq!(ranges[0], range);
                assert_eq!(ranges[MAX_RANGES_PER_COMMAND - 1], range);
            }
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn empty_add_ranges_is_representable() {
        let rec = CommandRecord::add_ranges(&[]);
        match rec.decode() {
            Some(Command::AddRanges { count, .. }) => assert_eq!(count, 0),
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn clear_ranges_round_trips() {
        assert!(matches!(
            CommandRecord::clear_ranges().decode(),
            Some(Command::ClearRanges)
        ));
    }

    #[test]
    fn oversized_stored_count_is_clamped_on_decode() {
        let mut rec = CommandRecord::add_ranges(&[]);
        rec.range_count = 100;
        match rec.decode() {
            Some(Command::AddRanges { count, .. }) => {
                assert_eq!(count, MAX_RANGES_PER_COMMAND);
            }
            other => panic!("decoded {other:?}"),
        }
    }
}
