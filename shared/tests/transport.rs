//! Both ring sides driven through one segment, the way the two processes
//! use it.

use shared::constants::{channel_id_for, EVENT_CAPACITY, SHM_MAGIC};
use shared::{AddressRange, Command, CommandRecord, Event, EventRecord, PushOutcome, Segment};

#[test]
fn creator_header_is_what_attachers_validate() {
    let channel = channel_id_for(r"Local\bbtrace_shm_X");
    let segment = Segment::in_process(channel, 4242);

    let header = segment.header();
    assert_eq!(header.magic, SHM_MAGIC);
    assert_eq!(header.magic, 0x5254_4252);
    assert_eq!(header.channel, channel);
    assert_eq!(header.producer_pid, 4242);
    assert_eq!(header.event_capacity, 32_768);
    assert_eq!(header.command_capacity, 1024);

    segment.verify(channel).expect("header must validate");
}

#[test]
fn event_ring_overflow_drops_exactly_one_and_preserves_fifo() {
    let segment = Segment::in_process(1, 1);
    let producer = segment.event_ring();
    let consumer = segment.event_ring();

    // A writer with no consumer fills capacity - 1 slots; the next push
    // must be rejected without touching the buffer.
    let mut accepted = 0u32;
    let mut dropped = 0u32;
    for seq in 0..EVENT_CAPACITY as u64 {
        match producer.push(EventRecord::basic_block(1, 2, seq, 0x40_0000 + seq, 0x40_0001 + seq))
        {
            PushOutcome::Accepted => accepted += 1,
            PushOutcome::Dropped => dropped += 1,
        }
    }
    assert_eq!(accepted, EVENT_CAPACITY as u32 - 1);
    assert_eq!(dropped, 1);
    assert_eq!(producer.dropped(), 1);
    assert_eq!(segment.event_drops(), 1);

    // FIFO drain of the 32,767 stored events; the dropped one is gone.
    for seq in 0..(EVENT_CAPACITY as u64 - 1) {
        let record = consumer.pop().expect("stored event");
        match record.decode() {
            Some(Event::BasicBlockHit(bb)) => {
                assert_eq!({ bb.timestamp_us }, seq);
                assert_eq!({ bb.app_pc_start }, 0x40_0000 + seq);
            }
            other => panic!("unexpected record {other:?}"),
        }
    }
    assert!(consumer.pop().is_none());
}

#[test]
fn command_ring_round_trips_both_kinds() {
    let segment = Segment::in_process(1, 1);
    let viewer_side = segment.command_ring();
    let agent_side = segment.command_ring();

    let range = AddressRange {
        base: 0x14_0000_0000,
        begin_rva: 0x1000,
        end_rva: 0x2000,
    };
    assert_eq!(
        viewer_side.push(CommandRecord::add_ranges(&[range])),
        PushOutcome::Accepted
    );
    assert_eq!(
        viewer_side.push(CommandRecord::clear_ranges()),
        PushOutcome::Accepted
    );

    match agent_side.pop().and_then(|r| r.decode()) {
        Some(Command::AddRanges { count, ranges }) => {
            assert_eq!(count, 1);
            assert_eq!(ranges[0], range);
        }
        other => panic!("unexpected command {other:?}"),
    }
    assert!(matches!(
        agent_side.pop().and_then(|r| r.decode()),
        Some(Command::ClearRanges)
    ));
    assert!(agent_side.pop().is_none());
}

#[test]
fn rings_are_independent() {
    let segment = Segment::in_process(1, 1);
    let _ = segment.event_ring().push(EventRecord::module_remove(1, 0x40_0000));
    assert!(segment.command_ring().pop().is_none());
    assert!(segment.event_ring().pop().is_some());
}

#[test]
fn string_heap_region_is_shared_between_views() {
    let segment = Segment::in_process(1, 1);
    assert!(segment.write_string(0, b"a.exe"));
    assert!(segment.write_string(6, b"C:\\Windows\\System32\\ntdll.dll"));
    assert_eq!(segment.read_string(0, 5).as_deref(), Some("a.exe"));
    assert_eq!(
        segment.read_string(6, 29).as_deref(),
        Some("C:\\Windows\\System32\\ntdll.dll")
    );
    assert_eq!(segment.string_heap_byte(5), Some(0));
}
