//! Raw DynamoRIO glue: the exported `dr_client_main` plus the callback
//! trampolines that translate host types into the library's seam types.
//!
//! Everything here is a thin shim; decisions live in `instrument`,
//! `modules`, and `commands`. Links against the DynamoRIO SDK import
//! library, hence the `dynamorio` feature gate.

#![allow(non_camel_case_types)]

use std::ffi::{c_char, c_int, c_uint, c_void, CStr};

use shared::constants::channel_id_for;
use shared::Segment;

use crate::context::{self, AgentContext};
use crate::dbi::{Instruction, ModuleDetails};
use crate::{instrument, modules};

pub type app_pc = *mut u8;

#[repr(C)]
pub struct module_names_t {
    pub module_name: *const c_char,
    pub file_name: *const c_char,
    pub exe_name: *const c_char,
    pub rsrc_name: *const c_char,
}

/// Prefix of DynamoRIO's `module_data_t`; only the fields read here.
#[repr(C)]
pub struct module_data_t {
    pub start: app_pc,
    pub end: app_pc,
    pub entry_point: app_pc,
    pub flags: c_uint,
    pub names: module_names_t,
    pub full_path: *mut c_char,
}

pub type dr_emit_flags_t = c_uint;
pub const DR_EMIT_DEFAULT: dr_emit_flags_t = 0;

/// Operand descriptor, passed by value into the clean-call inserter.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct opnd_t {
    raw: [u64; 2],
}

unsafe extern "C" {
    fn dr_set_client_name(name: *const c_char, report_url: *const c_char);
    fn dr_register_exit_event(func: unsafe extern "C" fn());
    fn dr_register_module_load_event(
        func: unsafe extern "C" fn(*mut c_void, *const module_data_t, c_char),
    );
    fn dr_register_module_unload_event(
        func: unsafe extern "C" fn(*mut c_void, *const module_data_t),
    );
    fn dr_register_bb_event(
        func: unsafe extern "C" fn(
            *mut c_void,
            *mut c_void,
            *mut c_void,
            c_char,
            c_char,
        ) -> dr_emit_flags_t,
    );
    fn dr_get_process_id() -> c_uint;
    fn dr_get_thread_id(drcontext: *mut c_void) -> c_uint;
    fn dr_get_current_drcontext() -> *mut c_void;
    fn dr_get_microseconds() -> u64;

    fn instrlist_first_app(bb: *mut c_void) -> *mut c_void;
    fn instrlist_last_app(bb: *mut c_void) -> *mut c_void;
    fn instr_get_app_pc(instr: *mut c_void) -> app_pc;
    fn instr_length(drcontext: *mut c_void, instr: *mut c_void) -> c_int;

    fn dr_insert_clean_call(
        drcontext: *mut c_void,
        bb: *mut c_void,
        where_: *mut c_void,
        callee: *mut c_void,
        save_fpstate: c_char,
        num_args: c_uint,
        ...
    );
    fn opnd_create_immed_int64(value: i64, size: c_uint) -> opnd_t;
}

const OPSZ_8: c_uint = 8;

fn instruction_at(drcontext: *mut c_void, instr: *mut c_void) -> Option<Instruction> {
    if instr.is_null() {
        return None;
    }
    let pc = unsafe { instr_get_app_pc(instr) } as u64;
    let length = unsafe { instr_length(drcontext, instr) }.max(0) as u32;
    Some(Instruction { pc, length })
}

/// Clean-call target; receives the PC range captured at discovery time.
unsafe extern "C" fn on_bb(start: u64, _tag: u64, end_exclusive: u64) {
    let Some(ctx) = context::instance() else {
        return;
    };
    let drcontext = unsafe { dr_get_current_drcontext() };
    let tid = unsafe { dr_get_thread_id(drcontext) };
    let now_us = unsafe { dr_get_microseconds() };
    instrument::on_block_executed(
        ctx,
        tid,
        now_us,
        instrument::BlockBounds {
            start,
            end_exclusive,
        },
    );
}

unsafe extern "C" fn event_bb(
    drcontext: *mut c_void,
    tag: *mut c_void,
    bb: *mut c_void,
    _for_trace: c_char,
    _translating: c_char,
) -> dr_emit_flags_t {
    let Some(ctx) = context::instance() else {
        return DR_EMIT_DEFAULT;
    };
    let first = instruction_at(drcontext, unsafe { instrlist_first_app(bb) });
    let last = instruction_at(drcontext, unsafe { instrlist_last_app(bb) });
    if let Some(bounds) = instrument::plan_block(ctx, first, last) {
        let insert_at = unsafe { instrlist_first_app(bb) };
        unsafe {
            dr_insert_clean_call(
                drcontext,
                bb,
                insert_at,
                on_bb as usize as *mut c_void,
                0,
                3,
                opnd_create_immed_int64(bounds.start as i64, OPSZ_8),
                opnd_create_immed_int64(tag as usize as i64, OPSZ_8),
                opnd_create_immed_int64(bounds.end_exclusive as i64, OPSZ_8),
            );
        }
    }
    DR_EMIT_DEFAULT
}

unsafe extern "C" fn event_module_load(
    _drcontext: *mut c_void,
    info: *const module_data_t,
    _loaded: c_char,
) {
    let Some(ctx) = context::instance() else {
        return;
    };
    let details = unsafe { module_details(info) };
    modules::on_module_load(ctx, &details);
}

unsafe extern "C" fn event_module_unload(_drcontext: *mut c_void, info: *const module_data_t) {
    let Some(ctx) = context::instance() else {
        return;
    };
    let base = unsafe { (*info).start } as u64;
    modules::on_module_unload(ctx, base);
}

unsafe fn module_details(info: *const module_data_t) -> ModuleDetails {
    let path = unsafe {
        let raw = (*info).full_path;
        if raw.is_null() {
            String::new()
        } else {
            CStr::from_ptr(raw).to_string_lossy().into_owned()
        }
    };
    ModuleDetails {
        start: unsafe { (*info).start } as u64,
        end: unsafe { (*info).end } as u64,
        path,
    }
}

unsafe extern "C" fn event_exit() {
    context::shutdown_agent();
}

fn attach_channel(ctx: &std::sync::Arc<AgentContext>, name: &str) {
    match Segment::create_or_attach(name, channel_id_for(name)) {
        Ok(segment) => ctx.attach(segment),
        Err(e) => log::error!("segment attach failed: {e}"),
    }
}

/// DynamoRIO client entry point.
///
/// # Safety
///
/// Called once by the host with a valid argv of `argc` entries.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dr_client_main(_id: c_uint, argc: c_int, argv: *const *const c_char) {
    unsafe {
        dr_set_client_name(c"bbtrace client".as_ptr(), c"".as_ptr());
    }

    let args: Vec<String> = (0..argc.max(0) as usize)
        .map(|i| unsafe {
            CStr::from_ptr(*argv.add(i))
                .to_string_lossy()
                .into_owned()
        })
        .collect();

    let pid = unsafe { dr_get_process_id() };
    let ctx = context::init(pid);

    unsafe {
        dr_register_exit_event(event_exit);
        dr_register_module_load_event(event_module_load);
        dr_register_module_unload_event(event_module_unload);
        dr_register_bb_event(event_bb);
    }

    match super::channel_from_args(&args) {
        Some(name) => attach_channel(&ctx, &name),
        None => log::error!("missing --channel argument; tracing stays disabled"),
    }
}
