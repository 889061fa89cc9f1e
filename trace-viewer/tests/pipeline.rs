//! Receiver pipeline over a real segment: producer-shaped events in,
//! projected grid cells out. The PDB seam is scripted.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use shared::{Command, EventRecord, PushOutcome, Segment};
use trace_viewer::commands::OperatorCommand;
use trace_viewer::model::{BlockLineModel, LineExtent};
use trace_viewer::projection::{self, GridCell};
use trace_viewer::receiver::{Receiver, ReceiverStats};
use trace_viewer::symbolicate::{path_ends_with_ci, LineRecord, LineSource};

/// Scripted PDB session: line records keyed by RVA plus one function
/// range; remembers the rebase it was given through a shared handle so
/// tests can observe it after the session moved into the receiver.
struct FakeSession {
    records: Vec<LineRecord>,
    function_range: (u32, u32),
    load_address: Arc<AtomicU64>,
}

impl FakeSession {
    fn new(records: Vec<LineRecord>) -> Self {
        Self {
            records,
            function_range: (0, u32::MAX),
            load_address: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl LineSource for FakeSession {
    fn set_load_address(&self, base: u64) {
        self.load_address.store(base, Ordering::Relaxed);
    }

    fn lines_near_rva(&self, rva: u32, window: u32) -> Vec<LineRecord> {
        self.records
            .iter()
            .filter(|r| r.rva + r.length.max(1) > rva)
            .take(window as usize)
            .cloned()
            .collect()
    }

    fn has_function_at(&self, rva: u32) -> bool {
        rva >= self.function_range.0 && rva < self.function_range.1
    }

    fn lines_matching_file(&self, path_tail: &str) -> Vec<LineRecord> {
        self.records
            .iter()
            .filter(|r| path_ends_with_ci(&r.file, path_tail))
            .cloned()
            .collect()
    }
}

fn record(rva: u32, length: u32, line: u32) -> LineRecord {
    LineRecord {
        rva,
        length,
        file: r"C:\src\main.cpp".into(),
        line,
        column: 1,
    }
}

struct Pipeline {
    segment: Arc<Segment>,
    receiver: Receiver<FakeSession>,
    load_address: Arc<AtomicU64>,
    model: Arc<Mutex<BlockLineModel>>,
    ops_tx: mpsc::Sender<OperatorCommand>,
    stats: Arc<ReceiverStats>,
}

fn pipeline(records: Vec<LineRecord>) -> Pipeline {
    let segment = Arc::new(Segment::in_process(7, 1));
    let session = FakeSession::new(records);
    let load_address = Arc::clone(&session.load_address);
    let model = Arc::new(Mutex::new(BlockLineModel::default()));
    let stats = Arc::new(ReceiverStats::default());
    let (ops_tx, ops_rx) = mpsc::channel();
    let receiver = Receiver::new(
        Arc::clone(&segment),
        session,
        Arc::clone(&model),
        ops_rx,
        r"\main.cpp".into(),
        8,
        Arc::clone(&stats),
        Arc::new(AtomicBool::new(false)),
    );
    Pipeline {
        segment,
        receiver,
        load_address,
        model,
        ops_tx,
        stats,
    }
}

/// Producer-shaped module add: path into the heap, then the event.
fn push_module(segment: &Segment, path: &str, index: u16, base: u64, size: u64) {
    assert!(segment.write_string(usize::from(index), path.as_bytes()));
    assert_eq!(
        segment.event_ring().push(EventRecord::module_add(
            1,
            base,
            size,
            index,
            path.len() as u32
        )),
        PushOutcome::Accepted
    );
}

fn push_hit(segment: &Segment, start: u64, end: u64) {
    assert_eq!(
        segment
            .event_ring()
            .push(EventRecord::basic_block(1, 2, 0, start, end)),
        PushOutcome::Accepted
    );
}

#[test]
fn module_add_sets_main_module_and_rebases_the_session() {
    let mut p = pipeline(vec![]);
    push_module(&p.segment, "a.exe", 0, 0x40_0000, 0x2000);
    push_module(&p.segment, r"C:\Windows\System32\ntdll.dll", 6, 0x7FF8_0000_0000, 0x10_0000);
    assert_eq!(p.receiver.poll_once(), 2);

    let main = p.receiver.main_module().expect("main module");
    assert_eq!(main.base, 0x40_0000);
    assert_eq!(main.size, 0x2000);
    assert_eq!(p.load_address.load(Ordering::Relaxed), 0x40_0000);
    assert_eq!(p.receiver.module_count(), 2);
}

#[test]
fn module_remove_drops_the_table_entry() {
    let mut p = pipeline(vec![]);
    push_module(&p.segment, "a.exe", 0, 0x40_0000, 0x2000);
    assert_eq!(p.receiver.poll_once(), 1);
    assert_eq!(p.receiver.module_count(), 1);

    let _ = p
        .segment
        .event_ring()
        .push(EventRecord::module_remove(1, 0x40_0000));
    assert_eq!(p.receiver.poll_once(), 1);
    assert_eq!(p.receiver.module_count(), 0);
}

#[test]
fn resolved_hit_lands_in_model_and_grid() {
    let mut p = pipeline(vec![record(0x1000, 0x10, 10), record(0x1010, 0x10, 12)]);
    push_module(&p.segment, "a.exe", 0, 0x40_0000, 0x2000);
    push_hit(&p.segment, 0x40_1000, 0x40_1010);
    assert_eq!(p.receiver.poll_once(), 2);

    let model = p.model.lock().unwrap();
    assert_eq!(
        model.extent_of(9),
        Some(LineExtent {
            start_line: 9,
            end_line: 11
        })
    );
    assert_eq!(model.hits(), &[9]);
    let cells = projection::project(&model.snapshot());
    assert_eq!(
        cells,
        vec![GridCell {
            row: 9,
            end_row: 11,
            column: 0
        }]
    );
    assert_eq!(p.stats.accepted(), 1);
}

#[test]
fn hits_outside_the_main_module_are_dropped() {
    let mut p = pipeline(vec![record(0x1000, 0x10, 10)]);
    push_module(&p.segment, "a.exe", 0, 0x40_0000, 0x2000);
    // End PC one past the image: rejected before any PDB query.
    push_hit(&p.segment, 0x40_1FF0, 0x40_2000);
    // Entirely foreign PC.
    push_hit(&p.segment, 0x50_0000, 0x50_0010);
    assert_eq!(p.receiver.poll_once(), 3);
    assert!(p.model.lock().unwrap().hits().is_empty());
    assert_eq!(p.stats.accepted(), 0);
}

#[test]
fn hits_in_unfiltered_files_are_dropped() {
    let mut other = record(0x1000, 0x10, 10);
    other.file = r"C:\src\helper.cpp".into();
    let mut p = pipeline(vec![other]);
    push_module(&p.segment, "a.exe", 0, 0x40_0000, 0x2000);
    push_hit(&p.segment, 0x40_1000, 0x40_1001);
    assert_eq!(p.receiver.poll_once(), 2);
    assert!(p.model.lock().unwrap().hits().is_empty());
}

#[test]
fn unresolvable_hits_are_silently_dropped() {
    // No line records at all: va_to_line misses, nothing accumulates.
    let mut p = pipeline(vec![]);
    push_module(&p.segment, "a.exe", 0, 0x40_0000, 0x2000);
    push_hit(&p.segment, 0x40_1000, 0x40_1001);
    assert_eq!(p.receiver.poll_once(), 2);
    assert!(p.model.lock().unwrap().hits().is_empty());
}

#[test]
fn backward_jumps_open_new_columns_across_the_pipeline() {
    let p_records = vec![
        record(0x1000, 0x10, 10),
        record(0x1100, 0x10, 11),
        record(0x1200, 0x10, 21),
        record(0x1300, 0x10, 31),
    ];
    let mut p = pipeline(p_records);
    push_module(&p.segment, "a.exe", 0, 0x40_0000, 0x2000);
    for rva in [0x1000u64, 0x1100, 0x1200, 0x1000, 0x1300] {
        push_hit(&p.segment, 0x40_0000 + rva, 0x40_0000 + rva + 1);
    }
    // Batch size is 8; everything lands in one poll.
    assert_eq!(p.receiver.poll_once(), 6);

    let model = p.model.lock().unwrap();
    assert_eq!(model.hits(), &[9, 10, 20, 9, 30]);
    let cells = projection::project(&model.snapshot());
    let columns: Vec<u32> = cells.iter().map(|c| c.column).collect();
    assert_eq!(columns, [0, 0, 0, 1, 1]);
}

#[test]
fn single_byte_block_produces_a_single_line_extent() {
    let mut p = pipeline(vec![record(0x1000, 0x10, 10)]);
    push_module(&p.segment, "a.exe", 0, 0x40_0000, 0x2000);
    push_hit(&p.segment, 0x40_1000, 0x40_1001);
    assert_eq!(p.receiver.poll_once(), 2);
    let model = p.model.lock().unwrap();
    assert_eq!(
        model.extent_of(9),
        Some(LineExtent {
            start_line: 9,
            end_line: 9
        })
    );
}

#[test]
fn operator_commands_reach_the_command_ring() {
    let mut p = pipeline(vec![record(0x1000, 0x8, 42)]);
    push_module(&p.segment, "a.exe", 0, 0x40_0000, 0x2000);
    assert_eq!(p.receiver.poll_once(), 1);

    p.ops_tx
        .send(OperatorCommand::AddRange {
            base: 0x40_0000,
            begin_rva: 0x1000,
            end_rva: 0x2000,
        })
        .unwrap();
    p.ops_tx.send(OperatorCommand::Clear).unwrap();
    p.ops_tx
        .send(OperatorCommand::LookupLine {
            file: "main.cpp".into(),
            line: 42,
        })
        .unwrap();
    assert_eq!(p.receiver.poll_ops(), 3);

    let agent_side = p.segment.command_ring();
    match agent_side.pop().and_then(|r| r.decode()) {
        Some(Command::AddRanges { count, ranges }) => {
            assert_eq!(count, 1);
            assert_eq!({ ranges[0].begin_rva }, 0x1000);
        }
        other => panic!("expected AddRanges, got {other:?}"),
    }
    assert!(matches!(
        agent_side.pop().and_then(|r| r.decode()),
        Some(Command::ClearRanges)
    ));
    // The reverse lookup resolved line 42 against the main module base.
    match agent_side.pop().and_then(|r| r.decode()) {
        Some(Command::AddRanges { count, ranges }) => {
            assert_eq!(count, 1);
            assert_eq!({ ranges[0].base }, 0x40_0000);
            assert_eq!({ ranges[0].begin_rva }, 0x1000);
            assert_eq!({ ranges[0].end_rva }, 0x1008);
        }
        other => panic!("expected lookup AddRanges, got {other:?}"),
    }
}
