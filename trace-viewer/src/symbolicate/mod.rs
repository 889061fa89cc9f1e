//! VA → source-line resolution over an abstract PDB session.
//!
//! [`LineSource`] is the seam to the PDB reader: the DIA-backed
//! implementation lives in [`dia`]; tests script the seam directly. The
//! operations here hold the resolution policy: main-module gating, the
//! enumeration window, the function-symbol double check that filters out
//! stale and padding PCs, and the zero-length-record convention.

use thiserror::Error;

#[cfg(windows)]
pub mod dia;

/// Resolved source position; `line` and `column` are 1-based as stored in
/// the PDB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrcPos {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

/// One line-table record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineRecord {
    pub rva: u32,
    /// Byte length of the record's machine-code range; 0 is treated as 1.
    pub length: u32,
    pub file: String,
    pub line: u32,
    pub column: u32,
}

/// Consumer-side view of a loaded module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleInfo {
    pub base: u64,
    pub size: u64,
}

impl ModuleInfo {
    pub fn contains(&self, va: u64) -> bool {
        self.base <= va && va < self.base + self.size
    }
}

/// Seam over the PDB session. Used from the receiver thread only.
pub trait LineSource {
    /// Rebases the session so RVA-relative answers line up with the
    /// running image.
    fn set_load_address(&self, base: u64);

    /// Up to `window` line records starting at `rva`, in table order.
    fn lines_near_rva(&self, rva: u32, window: u32) -> Vec<LineRecord>;

    /// Whether a function symbol covers `rva`.
    fn has_function_at(&self, rva: u32) -> bool;

    /// Every line record of every source file whose path matches
    /// `path_tail` case-insensitively, across all compilands.
    fn lines_matching_file(&self, path_tail: &str) -> Vec<LineRecord>;
}

/// Records fetched per address query.
pub const LINE_WINDOW: u32 = 16;

/// Resolves a runtime VA inside `module` to its source position.
///
/// The window walk requires the containing record rather than trusting
/// the first enumerator entry, and the function-symbol lookup must also
/// succeed; both together reject padding bytes and stale table entries.
pub fn va_to_line<S: LineSource + ?Sized>(
    source: &S,
    module: &ModuleInfo,
    va: u64,
) -> Option<SrcPos> {
    if !module.contains(va) {
        return None;
    }
    let rva = (va - module.base) as u32;
    let window = source.lines_near_rva(rva, LINE_WINDOW);
    if !source.has_function_at(rva) {
        return None;
    }
    for record in window {
        let length = record.length.max(1);
        if rva >= record.rva && rva < record.rva + length {
            return Some(SrcPos {
                file: record.file,
                line: record.line,
                column: record.column,
            });
        }
    }
    None
}

/// Reverse lookup: all `[rva_start, rva_end)` ranges that carry `line` of
/// the file matching `path_tail`. Multiple ranges are normal (inlining,
/// optimization); an empty result means the line has no code.
pub fn file_line_to_rva_ranges<S: LineSource + ?Sized>(
    source: &S,
    path_tail: &str,
    line: u32,
) -> Vec<(u32, u32)> {
    let mut ranges = Vec::new();
    for record in source.lines_matching_file(path_tail) {
        if record.line == line && path_ends_with_ci(&record.file, path_tail) {
            let length = record.length.max(1);
            ranges.push((record.rva, record.rva + length));
        }
    }
    ranges
}

/// Case-insensitive tail match, absorbing path-spelling differences
/// between the PDB and the query.
pub fn path_ends_with_ci(full: &str, tail: &str) -> bool {
    if tail.len() > full.len() {
        return false;
    }
    full.is_char_boundary(full.len() - tail.len())
        && full[full.len() - tail.len()..].eq_ignore_ascii_case(tail)
}

/// Failures that end the symbolication session. Per-address misses are
/// not errors; they surface as `None` from [`va_to_line`].
#[derive(Error, Debug)]
pub enum SymbolError {
    #[error("failed to load PDB reader `{path}`: {detail}")]
    LoadLibrary { path: String, detail: String },

    #[error("PDB reader exports no DllGetClassObject entry point")]
    MissingEntryPoint,

    #[error("creating the DIA data source failed: {0}")]
    CreateSource(String),

    #[error("no debug data found for `{path}`")]
    LoadData { path: String },

    #[error("opening the debug session failed: {0}")]
    OpenSession(String),
}
