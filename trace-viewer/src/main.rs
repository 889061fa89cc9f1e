//! Viewer entry point: wires the launched DBI host, the PDB session, the
//! receiver thread, and the operator console together. The projection
//! itself is consumed through `model` snapshots; a renderer plugs in on
//! top of those without touching the transport.

fn main() -> anyhow::Result<()> {
    run()
}

#[cfg(windows)]
fn run() -> anyhow::Result<()> {
    use std::io::{self, BufRead};
    use std::path::PathBuf;
    use std::sync::{mpsc, Arc, Mutex, PoisonError};

    use anyhow::Context;
    use windows::Win32::System::Com::{CoInitializeEx, COINIT_MULTITHREADED};

    use trace_viewer::commands::{self, CommandParseError, OperatorCommand};
    use trace_viewer::config::{find_config_file, Config};
    use trace_viewer::logger;
    use trace_viewer::model::BlockLineModel;
    use trace_viewer::projection;
    use trace_viewer::session::TraceSession;
    use trace_viewer::symbolicate::dia::DiaSession;

    let _logger = logger::init_logger()?;

    let config_path = find_config_file();
    let config = Config::load(&config_path)
        .with_context(|| format!("loading `{}`", config_path.display()))?;
    log::info!("configuration loaded from `{}`", config_path.display());

    let target: PathBuf = std::env::args_os()
        .nth(1)
        .map(Into::into)
        .context("usage: trace-viewer <target.exe>")?;

    // The DIA reader is apartment-agnostic but still wants COM set up on
    // the process.
    unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) }.ok()?;

    // PDB load failure is fatal: without symbols the viewer would accept
    // no traces anyway.
    let dia = DiaSession::open_for_exe(
        &config.symbols.reader_dll,
        &target,
        config.symbols.search_path.as_deref(),
    )?;

    let mut session = TraceSession::launch(&config.launcher, &target)?;
    let model = Arc::new(Mutex::new(BlockLineModel::default()));
    let (ops_tx, ops_rx) = mpsc::channel();
    session.start_receiver(dia, Arc::clone(&model), ops_rx, &config.viewer)?;

    log::info!(
        "commands: add <base hex> <begin_rva hex> <end_rva hex> | line <file> <line> | clear | stats | quit"
    );
    for line in io::stdin().lock().lines() {
        let line = line?;
        match commands::parse(&line) {
            Ok(OperatorCommand::Quit) => break,
            Ok(op) => {
                if ops_tx.send(op).is_err() {
                    break;
                }
            }
            Err(CommandParseError::Empty) => {}
            Err(e) => log::warn!("{e}"),
        }
    }

    session.shutdown();

    let snapshot = model
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .snapshot();
    let cells = projection::project(&snapshot);
    log::info!(
        "session done: {} blocks, {} hits, {} columns, {} events dropped, {} hits accepted",
        snapshot.blocks.len(),
        snapshot.hits.len(),
        projection::column_count(&cells),
        session.segment().event_drops(),
        session.stats().accepted(),
    );
    Ok(())
}

#[cfg(not(windows))]
fn run() -> anyhow::Result<()> {
    anyhow::bail!("trace-viewer drives Windows-only components (DBI host, PDB reader)")
}
