use flexi_logger::{
    DeferredNow, Duplicate, FileSpec, FlexiLoggerError, Logger, LoggerHandle, WriteMode,
};
use log::Record;
use std::io::Write;

/// File logging plus a console echo. The operator drives the session over
/// stdin, so informational lines (command acks, module loads, stats) are
/// duplicated to stderr while the full record goes to the log file.
pub fn init_logger() -> Result<LoggerHandle, FlexiLoggerError> {
    Logger::try_with_env_or_str("trace_viewer=info, shared=info")?
        .log_to_file(FileSpec::default().directory("logs").suppress_timestamp())
        .append()
        .duplicate_to_stderr(Duplicate::Info)
        .format_for_files(file_format)
        .format_for_stderr(console_format)
        .write_mode(WriteMode::BufferAndFlush)
        .start()
}

/// Sub-second timestamps so log lines can be read against the
/// microsecond timestamps carried by trace events.
fn file_format(w: &mut dyn Write, now: &mut DeferredNow, record: &Record) -> std::io::Result<()> {
    write!(
        w,
        "{} {:<5} {} {}",
        now.format("%H:%M:%S%.3f"),
        record.level(),
        record.target(),
        record.args()
    )
}

/// Console lines stay short; the file has the detail.
fn console_format(
    w: &mut dyn Write,
    _now: &mut DeferredNow,
    record: &Record,
) -> std::io::Result<()> {
    write!(w, "[{:<5}] {}", record.level(), record.args())
}
