//! Lifecycle of the named shared segment.
//!
//! Creation is race-free without any OS synchronization object: whichever
//! side maps the name first observes "did not already exist" from the OS
//! primitive and performs the one-shot header initialization; every later
//! attacher leaves the contents intact and validates them with
//! [`Segment::verify`]. Detach is `Drop` and runs on all exit paths.
//!
//! The heap-backed [`Segment::in_process`] constructor provides the same
//! region without any OS mapping; tests drive both ring sides through it
//! in a single process.

use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use crate::constants::{COMMAND_CAPACITY, EVENT_CAPACITY, SHM_MAGIC, STRING_HEAP_SIZE};
use crate::errors::SegmentError;
use crate::layout::{CommandRecord, EventRecord, ShmHeader, ShmLayout};
use crate::ring::Ring;

#[cfg(windows)]
use crate::platform::windows as platform;

/// Heap backing for in-process segments (tests, single-process tooling).
struct HeapRegion {
    ptr: NonNull<ShmLayout>,
}

impl HeapRegion {
    fn alloc_zeroed() -> Self {
        let layout = std::alloc::Layout::new::<ShmLayout>();
        // SAFETY: ShmLayout has non-zero size; alloc failure is handled.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw.cast::<ShmLayout>()) else {
            std::alloc::handle_alloc_error(layout);
        };
        Self { ptr }
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        let layout = std::alloc::Layout::new::<ShmLayout>();
        unsafe { std::alloc::dealloc(self.ptr.as_ptr().cast(), layout) };
    }
}

enum Backing {
    InProcess(HeapRegion),
    #[cfg(windows)]
    Mapped(platform::MappedSection),
}

/// A mapped (or heap-backed) view of the shared segment.
pub struct Segment {
    backing: Backing,
    already_existed: bool,
}

// SAFETY: the raw region is only touched through the atomic ring cursors,
// the one-shot initialization, and the bounds-checked string-heap calls.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Creates the named mapping or attaches to it if some other process
    /// got there first; only the first creator writes the header.
    #[cfg(windows)]
    pub fn create_or_attach(name: &str, channel: u32) -> Result<Self, SegmentError> {
        let (section, already_existed) = platform::MappedSection::create(name)?;
        let segment = Self {
            backing: Backing::Mapped(section),
            already_existed,
        };
        if !already_existed {
            segment.initialize(channel, std::process::id());
            log::info!("created segment `{name}` (channel {channel})");
        } else {
            log::info!("attached to existing segment `{name}`");
        }
        Ok(segment)
    }

    /// Attaches to an existing mapping; fails fast with
    /// [`SegmentError::NotFound`] so callers can poll.
    #[cfg(windows)]
    pub fn open_existing(name: &str) -> Result<Self, SegmentError> {
        let section = platform::MappedSection::open(name)?;
        Ok(Self {
            backing: Backing::Mapped(section),
            already_existed: true,
        })
    }

    /// Heap-backed segment with an initialized header. No OS object is
    /// involved; both ring sides live in the calling process.
    pub fn in_process(channel: u32, producer_pid: u32) -> Self {
        let segment = Self {
            backing: Backing::InProcess(HeapRegion::alloc_zeroed()),
            already_existed: false,
        };
        segment.initialize(channel, producer_pid);
        segment
    }

    /// Whether the OS reported the mapping as pre-existing at attach.
    pub fn already_existed(&self) -> bool {
        self.already_existed
    }

    fn layout_ptr(&self) -> *mut ShmLayout {
        match &self.backing {
            Backing::InProcess(region) => region.ptr.as_ptr(),
            #[cfg(windows)]
            Backing::Mapped(section) => section.base().cast::<ShmLayout>(),
        }
    }

    /// One-shot header initialization, performed by the creator before the
    /// segment name is observable by the peer.
    fn initialize(&self, channel: u32, producer_pid: u32) {
        let layout = self.layout_ptr();
        unsafe {
            (*layout).header = ShmHeader {
                magic: SHM_MAGIC,
                channel,
                producer_pid,
                event_capacity: EVENT_CAPACITY as u32,
                command_capacity: COMMAND_CAPACITY as u32,
            };
        }
        self.event_ring().init_header(EVENT_CAPACITY as u32);
        self.command_ring().init_header(COMMAND_CAPACITY as u32);
    }

    pub fn header(&self) -> ShmHeader {
        unsafe { (*self.layout_ptr()).header }
    }

    /// Magic then channel check; either mismatch aborts the session.
    pub fn verify(&self, expected_channel: u32) -> Result<(), SegmentError> {
        let header = self.header();
        if header.magic != SHM_MAGIC {
            return Err(SegmentError::MagicMismatch {
                expected: SHM_MAGIC,
                found: header.magic,
            });
        }
        if header.channel != expected_channel {
            return Err(SegmentError::ChannelMismatch {
                expected: expected_channel,
                found: header.channel,
            });
        }
        Ok(())
    }

    /// View of the event ring (producer pushes, consumer pops).
    pub fn event_ring(&self) -> Ring<EventRecord> {
        let layout = self.layout_ptr();
        unsafe {
            Ring::from_raw(
                &raw const (*layout).event_header,
                (&raw mut (*layout).event_buffer).cast::<EventRecord>(),
            )
        }
    }

    /// View of the command ring (consumer pushes, producer pops).
    pub fn command_ring(&self) -> Ring<CommandRecord> {
        let layout = self.layout_ptr();
        unsafe {
            Ring::from_raw(
                &raw const (*layout).command_header,
                (&raw mut (*layout).command_buffer).cast::<CommandRecord>(),
            )
        }
    }

    /// Appends `bytes` plus a NUL at `index` in the string heap. Returns
    /// `false` (writing nothing) when the region would not fit; the
    /// producer owns cursor management and never reuses an index.
    pub fn write_string(&self, index: usize, bytes: &[u8]) -> bool {
        if index + bytes.len() + 1 > STRING_HEAP_SIZE {
            return false;
        }
        let layout = self.layout_ptr();
        unsafe {
            let heap = (&raw mut (*layout).strings).cast::<u8>();
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), heap.add(index), bytes.len());
            heap.add(index + bytes.len()).write(0);
        }
        true
    }

    /// Copies `len` bytes at `index` out of the string heap, lossily
    /// decoded as UTF-8. `None` when the region is out of bounds.
    pub fn read_string(&self, index: usize, len: usize) -> Option<String> {
        if index + len > STRING_HEAP_SIZE {
            return None;
        }
        let layout = self.layout_ptr();
        let bytes = unsafe {
            let heap = (&raw const (*layout).strings).cast::<u8>();
            std::slice::from_raw_parts(heap.add(index), len)
        };
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Raw byte at a heap offset; diagnostics and tests.
    pub fn string_heap_byte(&self, index: usize) -> Option<u8> {
        if index >= STRING_HEAP_SIZE {
            return None;
        }
        let layout = self.layout_ptr();
        Some(unsafe { (&raw const (*layout).strings).cast::<u8>().add(index).read() })
    }

    #[cfg(test)]
    fn corrupt_magic(&self, value: u32) {
        let layout = self.layout_ptr();
        unsafe { (*layout).header.magic = value };
    }

    /// Event-ring drop counter, for operator diagnostics.
    pub fn event_drops(&self) -> u32 {
        unsafe { (*self.layout_ptr()).event_header.dropped.load(Ordering::Relaxed) }
    }

    /// Command-ring drop counter.
    pub fn command_drops(&self) -> u32 {
        unsafe {
            (*self.layout_ptr())
                .command_header
                .dropped
                .load(Ordering::Relaxed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::channel_id_for;

    #[test]
    fn in_process_segment_has_initialized_header() {
        let segment = Segment::in_process(0x11, 1234);
        let header = segment.header();
        assert_eq!(header.magic, SHM_MAGIC);
        assert_eq!(header.channel, 0x11);
        assert_eq!(header.producer_pid, 1234);
        assert_eq!(header.event_capacity, 32_768);
        assert_eq!(header.command_capacity, 1024);
        assert!(!segment.already_existed());
    }

    #[test]
    fn verify_accepts_matching_channel() {
        let channel = channel_id_for(r"Local\bbtrace_shm_test");
        let segment = Segment::in_process(channel, 1);
        assert!(segment.verify(channel).is_ok());
    }

    #[test]
    fn verify_rejects_wrong_channel() {
        let segment = Segment::in_process(5, 1);
        match segment.verify(6) {
            Err(SegmentError::ChannelMismatch { expected, found }) => {
                assert_eq!(expected, 6);
                assert_eq!(found, 5);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn verify_rejects_bad_magic_before_channel() {
        let segment = Segment::in_process(5, 1);
        segment.corrupt_magic(0);
        assert!(matches!(
            segment.verify(6),
            Err(SegmentError::MagicMismatch { found: 0, .. })
        ));
    }

    #[test]
    fn string_heap_round_trips() {
        let segment = Segment::in_process(1, 1);
        assert!(segment.write_string(0, b"a.exe"));
        assert_eq!(segment.read_string(0, 5).as_deref(), Some("a.exe"));
        assert_eq!(segment.string_heap_byte(5), Some(0));
    }

    #[test]
    fn string_heap_rejects_overflow() {
        let segment = Segment::in_process(1, 1);
        assert!(!segment.write_string(STRING_HEAP_SIZE - 3, b"abc"));
        // NUL still fits exactly at the end.
        assert!(segment.write_string(STRING_HEAP_SIZE - 4, b"abc"));
        assert!(segment.read_string(STRING_HEAP_SIZE - 3, 4).is_none());
    }

    #[test]
    fn rings_are_usable_through_the_segment() {
        let segment = Segment::in_process(1, 1);
        let events = segment.event_ring();
        assert_eq!(events.capacity(), 32_768);
        let _ = events.push(EventRecord::module_remove(1, 0x40_0000));
        assert!(events.pop().is_some());
        assert!(events.pop().is_none());
    }
}
