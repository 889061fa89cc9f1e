//! Process-wide agent state.
//!
//! The agent runs inside arbitrary application threads, so its mutable
//! state is collected in one `AgentContext` with an explicit lifecycle:
//! one `init` when the client attaches, one `shutdown` when it exits.
//! Threads reach it through the published handle rather than free
//! functions on globals.
//!
//! Attach order matters: module callbacks can fire before the shared
//! segment exists. Until [`AgentContext::attach`] runs, module events are
//! staged in a pending queue (with their string-heap indices already
//! assigned) and flushed by the first clean call that finds the transport
//! ready.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use once_cell::sync::OnceCell;
use shared::{CommandRecord, EventRecord, PushOutcome, Ring, Segment};

use crate::commands::{self, RangeTable};

/// Module-add event delayed until the segment is attached. The path bytes
/// travel with the event; its heap index was assigned at load time.
pub(crate) struct PendingModule {
    pub base: u64,
    pub size: u64,
    pub path_index: u16,
    pub path_bytes: Vec<u8>,
}

/// Module bookkeeping guarded by one mutex: the string-heap bump cursor
/// and the pre-attach staging queue. Module callbacks are rare; the hot
/// path only takes this lock when the queue is known non-empty.
pub(crate) struct ModuleBook {
    pub string_cursor: usize,
    pub pending: VecDeque<PendingModule>,
}

struct Transport {
    segment: Segment,
    events: Ring<EventRecord>,
    commands: Ring<CommandRecord>,
}

pub struct AgentContext {
    pid: u32,
    transport: OnceCell<Transport>,
    ipc_ready: AtomicBool,
    main_module_start: AtomicU64,
    main_module_end: AtomicU64,
    modules: Mutex<ModuleBook>,
    pending_count: AtomicUsize,
    ranges: RangeTable,
    shutdown: AtomicBool,
    poller: Mutex<Option<JoinHandle<()>>>,
}

static AGENT: OnceCell<Arc<AgentContext>> = OnceCell::new();

/// Publishes the process-wide context. Idempotent; the first caller wins.
pub fn init(pid: u32) -> Arc<AgentContext> {
    AGENT.get_or_init(|| Arc::new(AgentContext::new(pid))).clone()
}

pub fn instance() -> Option<&'static Arc<AgentContext>> {
    AGENT.get()
}

/// Stops the poller and leaves the context quiesced. Safe to call more
/// than once.
pub fn shutdown_agent() {
    if let Some(ctx) = AGENT.get() {
        ctx.shutdown();
    }
}

impl AgentContext {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            transport: OnceCell::new(),
            ipc_ready: AtomicBool::new(false),
            main_module_start: AtomicU64::new(0),
            main_module_end: AtomicU64::new(0),
            modules: Mutex::new(ModuleBook {
                string_cursor: 0,
                pending: VecDeque::new(),
            }),
            pending_count: AtomicUsize::new(0),
            ranges: RangeTable::new(),
            shutdown: AtomicBool::new(false),
            poller: Mutex::new(None),
        }
    }

    /// Installs the transport and starts the command poller. The ready
    /// flag is published last so a clean call racing with attach either
    /// sees nothing or a fully usable transport.
    pub fn attach(self: &Arc<Self>, segment: Segment) {
        let transport = Transport {
            events: segment.event_ring(),
            commands: segment.command_ring(),
            segment,
        };
        if self.transport.set(transport).is_err() {
            log::warn!("agent transport attached twice; keeping the first");
            return;
        }
        match commands::spawn_poller(Arc::clone(self)) {
            Ok(handle) => {
                *self.lock_poller() = Some(handle);
            }
            Err(e) => log::error!("failed to spawn command poller: {e}"),
        }
        self.ipc_ready.store(true, Ordering::Release);
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let handle = self.lock_poller().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    #[inline]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    #[inline]
    pub fn ipc_ready(&self) -> bool {
        self.ipc_ready.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_attached(&self) -> bool {
        self.ipc_ready()
    }

    pub(crate) fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn ranges(&self) -> &RangeTable {
        &self.ranges
    }

    pub(crate) fn set_main_module(&self, start: u64, end: u64) {
        self.main_module_start.store(start, Ordering::Relaxed);
        self.main_module_end.store(end, Ordering::Release);
    }

    /// PC gate for block discovery. False until the main module has been
    /// observed.
    pub fn main_module_contains(&self, pc: u64) -> bool {
        let end = self.main_module_end.load(Ordering::Acquire);
        let start = self.main_module_start.load(Ordering::Relaxed);
        start != 0 && pc >= start && pc < end
    }

    pub(crate) fn lock_modules(&self) -> MutexGuard<'_, ModuleBook> {
        self.modules.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_poller(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.poller.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn note_pending(&self, len: usize) {
        self.pending_count.store(len, Ordering::Release);
    }

    /// Drains staged module events into the event ring. Wait-free: when
    /// the module lock is contended the drain is retried by the next
    /// clean call instead of blocking this one.
    pub(crate) fn flush_pending(&self) {
        if self.pending_count.load(Ordering::Acquire) == 0 {
            return;
        }
        let Some(transport) = self.transport.get() else {
            return;
        };
        let Ok(mut book) = self.modules.try_lock() else {
            return;
        };
        while let Some(pending) = book.pending.pop_front() {
            transport
                .segment
                .write_string(usize::from(pending.path_index), &pending.path_bytes);
            let record = EventRecord::module_add(
                self.pid,
                pending.base,
                pending.size,
                pending.path_index,
                pending.path_bytes.len() as u32,
            );
            let _ = transport.events.push(record);
        }
        self.pending_count.store(0, Ordering::Release);
    }

    pub(crate) fn write_path(&self, index: usize, bytes: &[u8]) {
        if let Some(transport) = self.transport.get() {
            transport.segment.write_string(index, bytes);
        }
    }

    /// Pushes onto the event ring; `Dropped` both for ring pressure and
    /// for the not-yet-attached window.
    pub(crate) fn push_event(&self, record: EventRecord) -> PushOutcome {
        match self.transport.get() {
            Some(transport) => transport.events.push(record),
            None => PushOutcome::Dropped,
        }
    }

    pub(crate) fn pop_command(&self) -> Option<CommandRecord> {
        self.transport.get()?.commands.pop()
    }

    /// Shared segment, once attached. The FFI layer reports its header on
    /// connect; tests inspect heap contents through it.
    pub fn segment(&self) -> Option<&Segment> {
        self.transport.get().map(|t| &t.segment)
    }
}
