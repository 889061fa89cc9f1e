//! Operator console commands.
//!
//! Parsing is a pure function over one input line; execution happens on
//! the receiver thread, which owns the command ring's write side and the
//! PDB session (see `receiver`).

use thiserror::Error;

/// One parsed console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    /// `add <base hex> <begin_rva hex> <end_rva hex>`: one range to the
    /// agent's filter table.
    AddRange {
        base: u64,
        begin_rva: u64,
        end_rva: u64,
    },
    /// `line <file> <line>`: reverse-lookup the line's RVA ranges and
    /// send them as a filter.
    LookupLine { file: String, line: u32 },
    /// `clear`: empty the agent's filter table.
    Clear,
    /// `stats`: log ring drop counters and model totals.
    Stats,
    /// `quit` or `q`: end the session.
    Quit,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CommandParseError {
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("unknown command `{0}`")]
    Unknown(String),
    #[error("empty command")]
    Empty,
}

fn parse_hex(token: &str) -> Option<u64> {
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    u64::from_str_radix(digits, 16).ok()
}

pub fn parse(input: &str) -> Result<OperatorCommand, CommandParseError> {
    let mut parts = input.split_whitespace();
    match parts.next() {
        None => Err(CommandParseError::Empty),
        Some("add") => {
            const USAGE: &str = "add <base hex> <begin_rva hex> <end_rva hex>";
            let base = parts.next().and_then(parse_hex);
            let begin = parts.next().and_then(parse_hex);
            let end = parts.next().and_then(parse_hex);
            match (base, begin, end) {
                (Some(base), Some(begin_rva), Some(end_rva)) => Ok(OperatorCommand::AddRange {
                    base,
                    begin_rva,
                    end_rva,
                }),
                _ => Err(CommandParseError::Usage(USAGE)),
            }
        }
        Some("line") => {
            const USAGE: &str = "line <file> <line>";
            let file = parts.next();
            let line = parts.next().and_then(|t| t.parse::<u32>().ok());
            match (file, line) {
                (Some(file), Some(line)) => Ok(OperatorCommand::LookupLine {
                    file: file.to_owned(),
                    line,
                }),
                _ => Err(CommandParseError::Usage(USAGE)),
            }
        }
        Some("clear") => Ok(OperatorCommand::Clear),
        Some("stats") => Ok(OperatorCommand::Stats),
        Some("quit") | Some("q") => Ok(OperatorCommand::Quit),
        Some(other) => Err(CommandParseError::Unknown(other.to_owned())),
    }
}
