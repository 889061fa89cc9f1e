//! Transport receiver: the one thread that touches the event ring's read
//! side, the command ring's write side, and the PDB session.
//!
//! Routing operator commands through this thread keeps both rings under
//! their single-writer discipline and keeps every PDB call off the render
//! path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver as OpsReceiver, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};

use shared::{AddressRange, CommandRecord, Event, EventRecord, ModuleEvent, PushOutcome, Ring, Segment};

use crate::commands::OperatorCommand;
use crate::model::BlockLineModel;
use crate::projection;
use crate::symbolicate::{self, LineSource, ModuleInfo};

/// Counters shared with the render/console side.
#[derive(Debug, Default)]
pub struct ReceiverStats {
    accepted: AtomicU64,
}

impl ReceiverStats {
    /// Hits that survived symbolication and the file filter.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }
}

pub struct Receiver<S: LineSource> {
    segment: Arc<Segment>,
    events: Ring<EventRecord>,
    commands: Ring<CommandRecord>,
    session: S,
    model: Arc<Mutex<BlockLineModel>>,
    ops: OpsReceiver<OperatorCommand>,
    modules: HashMap<String, ModuleInfo>,
    main_module: Option<ModuleInfo>,
    filter_suffix: String,
    batch: usize,
    stats: Arc<ReceiverStats>,
    terminate: Arc<AtomicBool>,
}

impl<S: LineSource> Receiver<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        segment: Arc<Segment>,
        session: S,
        model: Arc<Mutex<BlockLineModel>>,
        ops: OpsReceiver<OperatorCommand>,
        filter_suffix: String,
        batch: usize,
        stats: Arc<ReceiverStats>,
        terminate: Arc<AtomicBool>,
    ) -> Self {
        Self {
            events: segment.event_ring(),
            commands: segment.command_ring(),
            segment,
            session,
            model,
            ops,
            modules: HashMap::new(),
            main_module: None,
            filter_suffix,
            batch,
            stats,
            terminate,
        }
    }

    /// Drive until the terminate flag is raised. Yields when idle; the
    /// ring never blocks.
    pub fn run(mut self) {
        log::debug!("receiver running");
        while !self.terminate.load(Ordering::Acquire) {
            let ops = self.poll_ops();
            let events = self.poll_once();
            if ops == 0 && events == 0 {
                std::thread::yield_now();
            }
        }
        log::debug!("receiver exiting");
    }

    /// Drains up to one batch of events. Exposed so tests can step the
    /// receiver deterministically.
    pub fn poll_once(&mut self) -> usize {
        let mut drained = 0;
        while drained < self.batch {
            let Some(record) = self.events.pop() else {
                break;
            };
            self.dispatch(record);
            drained += 1;
        }
        drained
    }

    /// Handles everything queued on the operator channel. Public for the
    /// same reason as [`Self::poll_once`].
    pub fn poll_ops(&mut self) -> usize {
        let mut handled = 0;
        loop {
            match self.ops.try_recv() {
                Ok(op) => {
                    self.handle_op(op);
                    handled += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        handled
    }

    fn dispatch(&mut self, record: EventRecord) {
        match record.decode() {
            Some(Event::ModuleAdd(ev)) => self.on_module_add(ev),
            Some(Event::ModuleRemove(ev)) => {
                let base = { ev.base };
                self.modules.retain(|_, info| info.base != base);
            }
            Some(Event::BasicBlockHit(ev)) => {
                self.on_block_hit({ ev.app_pc_start }, { ev.app_pc_end });
            }
            None => log::warn!("ignoring event with unknown tag"),
        }
    }

    fn on_module_add(&mut self, ev: ModuleEvent) {
        let index = usize::from({ ev.path_index });
        let len = { ev.path_len } as usize;
        let path = self.segment.read_string(index, len).unwrap_or_default();
        let info = ModuleInfo {
            base: { ev.base },
            size: { ev.size },
        };
        log::info!("module `{path}` at {:#x} (+{:#x})", info.base, info.size);
        self.modules.insert(path.to_lowercase(), info);

        if path.to_ascii_lowercase().ends_with(".exe") {
            self.main_module = Some(info);
            // Rebase the session so VA queries line up with the image.
            self.session.set_load_address(info.base);
        }
    }

    fn on_block_hit(&mut self, start: u64, end_exclusive: u64) {
        let Some(main) = self.main_module else {
            return;
        };
        if !main.contains(start) || !main.contains(end_exclusive) {
            return;
        }
        let Some(begin_pos) = symbolicate::va_to_line(&self.session, &main, start) else {
            return;
        };
        let Some(end_pos) = symbolicate::va_to_line(&self.session, &main, end_exclusive) else {
            return;
        };
        if !begin_pos.file.ends_with(&self.filter_suffix) {
            return;
        }
        if begin_pos.line == 0 || end_pos.line == 0 {
            return;
        }
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        let start_line = begin_pos.line - 1;
        let end_line = end_pos.line - 1;
        self.lock_model().record_hit(start_line, end_line);
    }

    fn handle_op(&mut self, op: OperatorCommand) {
        match op {
            OperatorCommand::AddRange {
                base,
                begin_rva,
                end_rva,
            } => {
                self.send_ranges(&[AddressRange {
                    base,
                    begin_rva,
                    end_rva,
                }]);
            }
            OperatorCommand::LookupLine { file, line } => self.lookup_line(&file, line),
            OperatorCommand::Clear => {
                match self.commands.push(CommandRecord::clear_ranges()) {
                    PushOutcome::Accepted => log::info!("sent CLEAR"),
                    PushOutcome::Dropped => log::warn!("command ring full"),
                }
            }
            OperatorCommand::Stats => self.log_stats(),
            // Session teardown is the console loop's job.
            OperatorCommand::Quit => {}
        }
    }

    fn send_ranges(&mut self, ranges: &[AddressRange]) {
        match self.commands.push(CommandRecord::add_ranges(ranges)) {
            PushOutcome::Accepted => log::info!("sent ADD ({} ranges)", ranges.len().min(8)),
            PushOutcome::Dropped => log::warn!("command ring full"),
        }
    }

    fn lookup_line(&mut self, file: &str, line: u32) {
        let Some(main) = self.main_module else {
            log::warn!("no main module yet; cannot resolve {file}:{line}");
            return;
        };
        let ranges = symbolicate::file_line_to_rva_ranges(&self.session, file, line);
        if ranges.is_empty() {
            log::warn!("{file}:{line} has no code ranges");
            return;
        }
        let ranges: Vec<AddressRange> = ranges
            .into_iter()
            .map(|(begin, end)| AddressRange {
                base: main.base,
                begin_rva: u64::from(begin),
                end_rva: u64::from(end),
            })
            .collect();
        log::info!("{file}:{line} resolved to {} range(s)", ranges.len());
        self.send_ranges(&ranges);
    }

    fn log_stats(&self) {
        let model = self.lock_model();
        let snapshot = model.snapshot();
        drop(model);
        let cells = projection::project(&snapshot);
        log::info!(
            "events dropped: {}, commands dropped: {}, hits accepted: {}, blocks: {}, columns: {}",
            self.segment.event_drops(),
            self.segment.command_drops(),
            self.stats.accepted(),
            snapshot.blocks.len(),
            projection::column_count(&cells),
        );
    }

    fn lock_model(&self) -> std::sync::MutexGuard<'_, BlockLineModel> {
        self.model.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Main module as currently known; tests and diagnostics.
    pub fn main_module(&self) -> Option<ModuleInfo> {
        self.main_module
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }
}
