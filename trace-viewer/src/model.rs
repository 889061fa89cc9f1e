//! Block-line model: which source lines each discovered block covers, and
//! the order in which blocks were hit.
//!
//! Blocks are discovered in execution order, which is arbitrary relative
//! to their position in the file, so the adjacency invariant (an extent
//! never reaches into the extent that starts after it) is restored by a
//! trim pass after every insertion. The earlier-starting block keeps its
//! start, which is its grid row; only its end is pulled back.

use std::collections::BTreeMap;

/// Inclusive zero-based source-line range of one basic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineExtent {
    pub start_line: u32,
    pub end_line: u32,
}

/// Extent map plus hit log. Shared between the receiver (insertions) and
/// the renderer (snapshot reads) under one mutex.
#[derive(Debug, Default, Clone)]
pub struct BlockLineModel {
    blocks: BTreeMap<u32, LineExtent>,
    hits: Vec<u32>,
}

/// Read-only copy handed to the renderer each frame.
#[derive(Debug, Default, Clone)]
pub struct ModelSnapshot {
    pub blocks: BTreeMap<u32, LineExtent>,
    pub hits: Vec<u32>,
}

impl BlockLineModel {
    /// Records one hit of the block beginning at `start_line`. The first
    /// sighting of a start line fixes the block's raw extent; every hit
    /// appends to the log.
    pub fn record_hit(&mut self, start_line: u32, end_line: u32) {
        if !self.blocks.contains_key(&start_line) {
            self.blocks.insert(
                start_line,
                LineExtent {
                    start_line,
                    end_line,
                },
            );
            self.trim_overlaps();
        }
        self.hits.push(start_line);
    }

    /// Restores the invariant: for adjacent entries A < B,
    /// `A.end_line <= B.start_line - 1`. B is never moved.
    fn trim_overlaps(&mut self) {
        if self.blocks.len() < 2 {
            return;
        }
        let keys: Vec<u32> = self.blocks.keys().copied().collect();
        for pair in keys.windows(2) {
            // Adjacent keys are strictly ordered, so pair[1] >= 1.
            let limit = pair[1] - 1;
            if let Some(extent) = self.blocks.get_mut(&pair[0]) {
                if extent.end_line > limit {
                    extent.end_line = limit;
                }
            }
        }
    }

    pub fn blocks(&self) -> &BTreeMap<u32, LineExtent> {
        &self.blocks
    }

    pub fn hits(&self) -> &[u32] {
        &self.hits
    }

    pub fn extent_of(&self, start_line: u32) -> Option<LineExtent> {
        self.blocks.get(&start_line).copied()
    }

    pub fn snapshot(&self) -> ModelSnapshot {
        ModelSnapshot {
            blocks: self.blocks.clone(),
            hits: self.hits.clone(),
        }
    }
}
