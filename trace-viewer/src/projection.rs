//! Temporal projection of the hit log onto grid cells.
//!
//! Rows are source lines; columns are "passes": a hit on a line above the
//! previous hit starts a new column, so loops and repeated calls stack
//! horizontally instead of overdrawing one column.

use crate::model::{LineExtent, ModelSnapshot};

/// One filled cell. Spans rows `[row, end_row]` inclusive in column
/// `column`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridCell {
    pub row: u32,
    pub end_row: u32,
    pub column: u32,
}

/// Maps the hit log onto cells in receive order.
pub fn project(snapshot: &ModelSnapshot) -> Vec<GridCell> {
    let mut cells = Vec::with_capacity(snapshot.hits.len());
    let mut column = 0u32;
    let mut last_line = 0u32;
    for &line in &snapshot.hits {
        if line < last_line {
            column += 1;
        }
        last_line = line;
        let extent = snapshot
            .blocks
            .get(&line)
            .copied()
            .unwrap_or(LineExtent {
                start_line: line,
                end_line: line,
            });
        cells.push(GridCell {
            row: extent.start_line,
            end_row: extent.end_line,
            column,
        });
    }
    cells
}

/// Number of columns the projection occupies.
pub fn column_count(cells: &[GridCell]) -> u32 {
    cells.last().map_or(0, |c| c.column + 1)
}
