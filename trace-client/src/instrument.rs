//! Block discovery filter and the clean-call body.
//!
//! `on_block_executed` runs on whatever application thread hit the block.
//! Its constraints are strict: no heap allocation, no blocking, no error
//! values. Ring pressure and the not-yet-attached window both surface as
//! drop counts.

use shared::EventRecord;

use crate::context::AgentContext;
use crate::dbi::Instruction;

/// PC range of one discovered block; `end_exclusive` is the last app
/// instruction's PC plus its length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockBounds {
    pub start: u64,
    pub end_exclusive: u64,
}

/// First/last app-instruction queries over a discovered block, as the DBI
/// host exposes them.
pub fn app_bounds(instructions: &[Instruction]) -> (Option<Instruction>, Option<Instruction>) {
    (instructions.first().copied(), instructions.last().copied())
}

/// Decides whether a discovered block gets the clean call, and with which
/// arguments. `None` means leave the block uninstrumented.
///
/// The gate keys on the first instruction's PC being inside the main
/// module; a block whose last app instruction is missing bypasses the
/// gate with a zero-length range.
pub fn plan_block(
    ctx: &AgentContext,
    first: Option<Instruction>,
    last: Option<Instruction>,
) -> Option<BlockBounds> {
    let first = first?;
    match last {
        Some(last) => {
            if !ctx.main_module_contains(first.pc) {
                return None;
            }
            Some(BlockBounds {
                start: first.pc,
                end_exclusive: last.pc + u64::from(last.length),
            })
        }
        None => Some(BlockBounds {
            start: first.pc,
            end_exclusive: first.pc,
        }),
    }
}

/// Clean-call body: the hot path.
pub fn on_block_executed(ctx: &AgentContext, tid: u32, timestamp_us: u64, bounds: BlockBounds) {
    if !ctx.ipc_ready() {
        return;
    }
    // Staged module events go first so the consumer can resolve the PCs
    // that follow.
    ctx.flush_pending();
    let record = EventRecord::basic_block(
        ctx.pid(),
        tid,
        timestamp_us,
        bounds.start,
        bounds.end_exclusive,
    );
    let _ = ctx.push_event(record);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AgentContext;

    fn instr(pc: u64, length: u32) -> Instruction {
        Instruction { pc, length }
    }

    fn ctx_with_main_module() -> AgentContext {
        let ctx = AgentContext::new(1);
        ctx.set_main_module(0x40_0000, 0x40_1000);
        ctx
    }

    #[test]
    fn in_range_block_is_planned_with_exclusive_end() {
        let ctx = ctx_with_main_module();
        let plan = plan_block(&ctx, Some(instr(0x40_0010, 2)), Some(instr(0x40_0020, 3)));
        assert_eq!(
            plan,
            Some(BlockBounds {
                start: 0x40_0010,
                end_exclusive: 0x40_0023
            })
        );
    }

    #[test]
    fn out_of_range_block_is_rejected() {
        let ctx = ctx_with_main_module();
        assert!(plan_block(&ctx, Some(instr(0x50_0000, 1)), Some(instr(0x50_0004, 1))).is_none());
    }

    #[test]
    fn block_without_last_instruction_bypasses_the_gate() {
        let ctx = ctx_with_main_module();
        let plan = plan_block(&ctx, Some(instr(0x50_0000, 1)), None);
        assert_eq!(
            plan,
            Some(BlockBounds {
                start: 0x50_0000,
                end_exclusive: 0x50_0000
            })
        );
    }

    #[test]
    fn block_without_instructions_is_rejected() {
        let ctx = ctx_with_main_module();
        assert!(plan_block(&ctx, None, None).is_none());
    }

    #[test]
    fn everything_is_rejected_before_the_main_module_is_known() {
        let ctx = AgentContext::new(1);
        assert!(plan_block(&ctx, Some(instr(0x40_0010, 1)), Some(instr(0x40_0011, 1))).is_none());
    }

    #[test]
    fn single_instruction_block_yields_minimal_range() {
        let ctx = ctx_with_main_module();
        let (first, last) = app_bounds(&[instr(0x40_0100, 1)]);
        let plan = plan_block(&ctx, first, last).expect("in range");
        assert_eq!(plan.start, 0x40_0100);
        assert_eq!(plan.end_exclusive, 0x40_0101);
    }
}
