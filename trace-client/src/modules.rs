//! Module tracking on the producer side.
//!
//! Every load is forwarded to the viewer with its path parked in the
//! shared string heap; loads seen before the segment exists are staged
//! with their heap index already reserved and flushed by the first clean
//! call after attach. The `.exe` image defines the PC gate for block
//! discovery.

use shared::constants::STRING_HEAP_SIZE;
use shared::EventRecord;

use crate::context::{AgentContext, PendingModule};
use crate::dbi::ModuleDetails;

fn is_executable_image(path: &str) -> bool {
    path.len() >= 4
        && path
            .get(path.len() - 4..)
            .is_some_and(|tail| tail.eq_ignore_ascii_case(".exe"))
}

pub fn on_module_load(ctx: &AgentContext, details: &ModuleDetails) {
    if is_executable_image(&details.path) {
        ctx.set_main_module(details.start, details.end);
        log::info!(
            "main module `{}` at {:#x}..{:#x}",
            details.path,
            details.start,
            details.end
        );
    }

    let size = details.end.saturating_sub(details.start);
    let mut book = ctx.lock_modules();
    let index = book.string_cursor;
    if index + 1 > STRING_HEAP_SIZE {
        // Not even a terminator fits; an index handed out here would
        // violate the arena bound, so the event is dropped instead.
        log::warn!(
            "string heap exhausted; dropping module event for `{}`",
            details.path
        );
        return;
    }
    let mut bytes = details.path.as_bytes();
    if index + bytes.len() + 1 > STRING_HEAP_SIZE {
        bytes = &bytes[..0];
    }
    book.string_cursor = index + bytes.len() + 1;

    if ctx.is_attached() {
        ctx.write_path(index, bytes);
        let record = EventRecord::module_add(
            ctx.pid(),
            details.start,
            size,
            index as u16,
            bytes.len() as u32,
        );
        let _ = ctx.push_event(record);
    } else {
        book.pending.push_back(PendingModule {
            base: details.start,
            size,
            path_index: index as u16,
            path_bytes: bytes.to_vec(),
        });
        let staged = book.pending.len();
        drop(book);
        ctx.note_pending(staged);
        log::debug!("staged module `{}` until attach", details.path);
    }
}

/// Unloads before attach carry no information the viewer could use.
pub fn on_module_unload(ctx: &AgentContext, base: u64) {
    if ctx.is_attached() {
        let _ = ctx.push_event(EventRecord::module_remove(ctx.pid(), base));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exe_suffix_is_case_insensitive() {
        assert!(is_executable_image(r"C:\app\Target.EXE"));
        assert!(is_executable_image("a.exe"));
        assert!(!is_executable_image(r"C:\Windows\System32\ntdll.dll"));
        assert!(!is_executable_image("exe"));
    }

    #[test]
    fn exe_load_sets_the_main_module_range() {
        let ctx = AgentContext::new(1);
        on_module_load(
            &ctx,
            &ModuleDetails {
                start: 0x40_0000,
                end: 0x40_1000,
                path: "a.exe".into(),
            },
        );
        assert!(ctx.main_module_contains(0x40_0800));
        assert!(!ctx.main_module_contains(0x40_1000));
    }

    #[test]
    fn redelivered_main_module_is_idempotent() {
        let ctx = AgentContext::new(1);
        let details = ModuleDetails {
            start: 0x40_0000,
            end: 0x40_1000,
            path: "a.exe".into(),
        };
        on_module_load(&ctx, &details);
        on_module_load(&ctx, &details);
        assert!(ctx.main_module_contains(0x40_0800));
        assert!(!ctx.main_module_contains(0x3F_FFFF));
    }

    #[test]
    fn dll_load_does_not_touch_the_main_module_range() {
        let ctx = AgentContext::new(1);
        on_module_load(
            &ctx,
            &ModuleDetails {
                start: 0x7FF8_0000_0000,
                end: 0x7FF8_0001_0000,
                path: r"C:\Windows\System32\ntdll.dll".into(),
            },
        );
        assert!(!ctx.main_module_contains(0x7FF8_0000_8000));
    }

    #[test]
    fn string_cursor_advances_past_each_path_and_nul() {
        let ctx = AgentContext::new(1);
        on_module_load(
            &ctx,
            &ModuleDetails {
                start: 0x40_0000,
                end: 0x40_1000,
                path: "a.exe".into(),
            },
        );
        on_module_load(
            &ctx,
            &ModuleDetails {
                start: 0x50_0000,
                end: 0x50_1000,
                path: "b.dll".into(),
            },
        );
        let book = ctx.lock_modules();
        assert_eq!(book.string_cursor, 12);
        assert_eq!(book.pending.len(), 2);
        assert_eq!(book.pending[0].path_index, 0);
        assert_eq!(book.pending[1].path_index, 6);
    }

    #[test]
    fn unload_before_attach_is_dropped() {
        let ctx = AgentContext::new(1);
        // No segment attached; nothing to observe, nothing to panic on.
        on_module_unload(&ctx, 0x40_0000);
        assert!(ctx.segment().is_none());
    }
}
