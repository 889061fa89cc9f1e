//! Trace session lifecycle: channel naming, spawning the DBI host,
//! attaching to the agent's segment, and tearing the receiver down.

use shared::constants::CHANNEL_NAME_PREFIX;
use shared::SegmentError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("failed to spawn the DBI host: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("segment `{name}` did not appear within the attach window")]
    AttachTimeout { name: String },

    #[error(transparent)]
    Segment(#[from] SegmentError),
}

/// Fresh ephemeral segment name, one per traced run.
pub fn generate_channel_name() -> String {
    format!("{CHANNEL_NAME_PREFIX}{}", Uuid::new_v4())
}

#[cfg(windows)]
pub use windows_session::TraceSession;

#[cfg(windows)]
mod windows_session {
    use std::path::Path;
    use std::process::{Child, Command, Stdio};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc::Receiver as OpsReceiver;
    use std::sync::{Arc, Mutex};
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    use shared::constants::{
        channel_id_for, ATTACH_RETRY_COUNT, ATTACH_RETRY_INTERVAL_MS,
    };
    use shared::{Segment, SegmentError};

    use super::{generate_channel_name, SessionError};
    use crate::commands::OperatorCommand;
    use crate::config::{LauncherConfig, ViewerConfig};
    use crate::model::BlockLineModel;
    use crate::receiver::{Receiver, ReceiverStats};
    use crate::symbolicate::LineSource;

    /// A running traced process plus the viewer-side plumbing around it.
    pub struct TraceSession {
        segment: Arc<Segment>,
        child: Child,
        terminate: Arc<AtomicBool>,
        receiver: Option<JoinHandle<()>>,
        stats: Arc<ReceiverStats>,
    }

    impl TraceSession {
        /// Spawns `drrun -c <client_dll> --channel <name> -- <target>`,
        /// polls the segment into view, and validates its header.
        pub fn launch(launcher: &LauncherConfig, target: &Path) -> Result<Self, SessionError> {
            let name = generate_channel_name();
            let channel = channel_id_for(&name);

            log::info!("start debug `{}`", target.display());
            let child = Command::new(&launcher.drrun)
                .arg("-c")
                .arg(&launcher.client_dll)
                .arg("--channel")
                .arg(&name)
                .arg("--")
                .arg(target)
                .stdin(Stdio::null())
                .spawn()
                .map_err(SessionError::Spawn)?;

            let segment = Self::attach(&name)?;
            segment.verify(channel)?;
            let header = segment.header();
            log::info!(
                "connected: cap_evt={} cap_cmd={} producer_pid={}",
                header.event_capacity,
                header.command_capacity,
                header.producer_pid
            );

            Ok(Self {
                segment: Arc::new(segment),
                child,
                terminate: Arc::new(AtomicBool::new(false)),
                receiver: None,
                stats: Arc::new(ReceiverStats::default()),
            })
        }

        /// Bounded poll: the DBI host takes a moment to inject the agent
        /// and create the mapping.
        fn attach(name: &str) -> Result<Segment, SessionError> {
            for _ in 0..ATTACH_RETRY_COUNT {
                match Segment::open_existing(name) {
                    Ok(segment) => return Ok(segment),
                    Err(SegmentError::NotFound { .. }) => {
                        thread::sleep(Duration::from_millis(ATTACH_RETRY_INTERVAL_MS));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Err(SessionError::AttachTimeout {
                name: name.to_owned(),
            })
        }

        /// Starts the receiver thread over this session's segment.
        pub fn start_receiver<S>(
            &mut self,
            session: S,
            model: Arc<Mutex<BlockLineModel>>,
            ops: OpsReceiver<OperatorCommand>,
            viewer: &ViewerConfig,
        ) -> std::io::Result<()>
        where
            S: LineSource + Send + 'static,
        {
            let receiver = Receiver::new(
                Arc::clone(&self.segment),
                session,
                model,
                ops,
                viewer.source_filter_suffix.clone(),
                viewer.receive_batch,
                Arc::clone(&self.stats),
                Arc::clone(&self.terminate),
            );
            let handle = thread::Builder::new()
                .name("receiver".into())
                .spawn(move || receiver.run())?;
            self.receiver = Some(handle);
            Ok(())
        }

        pub fn stats(&self) -> &Arc<ReceiverStats> {
            &self.stats
        }

        pub fn segment(&self) -> &Arc<Segment> {
            &self.segment
        }

        /// Raises the terminate flag and joins the receiver. The traced
        /// process is left to finish on its own; a crashed producer just
        /// looks like a stalled ring.
        pub fn shutdown(&mut self) {
            self.terminate.store(true, Ordering::Release);
            if let Some(handle) = self.receiver.take() {
                let _ = handle.join();
            }
            match self.child.try_wait() {
                Ok(Some(status)) => log::info!("traced process exited: {status}"),
                Ok(None) => log::info!("traced process still running; detaching"),
                Err(e) => log::warn!("could not query traced process: {e}"),
            }
        }
    }

    impl Drop for TraceSession {
        fn drop(&mut self) {
            self.shutdown();
        }
    }

}
