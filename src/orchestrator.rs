//! Runs the frame loop and the heartbeat as two long-lived threads.
//!
//! Both share one `CancelToken`. The frame thread ends on source exhaustion,
//! a source error or cancellation; whichever way it ends, the token is
//! cancelled so the heartbeat stops too.

use anyhow::{anyhow, Context, Result};
use std::thread;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::detect::DetectorBackend;
use crate::frame::FrameSource;
use crate::pipeline::{run_frame_loop, Engine, LoopStats};
use crate::transport::{run_heartbeat, DeviceClient, HeartbeatStats};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunSummary {
    pub frames: LoopStats,
    /// `None` when no heartbeat was configured.
    pub heartbeat: Option<HeartbeatStats>,
}

pub struct Orchestrator {
    cancel: CancelToken,
    heartbeat: Option<(DeviceClient, Duration)>,
    pacing: Option<Duration>,
}

impl Orchestrator {
    pub fn new(cancel: CancelToken) -> Self {
        Self {
            cancel,
            heartbeat: None,
            pacing: None,
        }
    }

    pub fn with_heartbeat(mut self, client: DeviceClient, interval: Duration) -> Self {
        self.heartbeat = Some((client, interval));
        self
    }

    /// Minimum pause between frames (cancellable).
    pub fn with_pacing(mut self, pacing: Option<Duration>) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn run(
        self,
        mut source: Box<dyn FrameSource>,
        mut detector: Box<dyn DetectorBackend>,
        mut engine: Engine,
    ) -> Result<RunSummary> {
        let heartbeat_handle = match self.heartbeat {
            Some((client, interval)) => {
                let cancel = self.cancel.clone();
                let handle = thread::Builder::new()
                    .name("heartbeat".into())
                    .spawn(move || run_heartbeat(&client, interval, &cancel))
                    .context("spawn heartbeat thread")?;
                Some(handle)
            }
            None => None,
        };

        let cancel = self.cancel.clone();
        let pacing = self.pacing;
        let frame_handle = thread::Builder::new()
            .name("frame-loop".into())
            .spawn(move || {
                run_frame_loop(
                    source.as_mut(),
                    detector.as_mut(),
                    &mut engine,
                    &cancel,
                    pacing,
                )
            });

        let frames = match frame_handle {
            Ok(handle) => handle
                .join()
                .map_err(|_| anyhow!("frame loop thread panicked")),
            Err(e) => Err(anyhow!("spawn frame loop thread: {}", e)),
        };
        self.cancel.cancel();

        let heartbeat = match heartbeat_handle {
            Some(handle) => Some(
                handle
                    .join()
                    .map_err(|_| anyhow!("heartbeat thread panicked"))?,
            ),
            None => None,
        };

        let frames = frames??;
        log::info!(
            "run finished: {} frames, {} events saved, {} suppressed, {} dropped",
            frames.frames,
            frames.persisted,
            frames.suppressed,
            frames.dropped
        );
        Ok(RunSummary { frames, heartbeat })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::ReplayBackend;
    use crate::ingest::{file::FileConfig, FileSource};
    use crate::lifecycle::EventPolicy;
    use crate::storage::InMemoryGateway;
    use crate::track::motion::{IouTracker, IouTrackerParams};

    fn engine() -> Engine {
        Engine::new(
            Box::new(IouTracker::new(IouTrackerParams::default())),
            EventPolicy::default(),
            Box::new(InMemoryGateway::with_references(["ref"])),
            "dev",
        )
    }

    #[test]
    fn exhausted_source_stops_heartbeat() {
        let source = FileSource::new(FileConfig {
            path: "stub://test?frames=3".to_string(),
            ..FileConfig::default()
        })
        .unwrap();
        let client =
            DeviceClient::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        let summary = Orchestrator::new(CancelToken::new())
            .with_heartbeat(client, Duration::from_secs(60))
            .run(Box::new(source), Box::new(ReplayBackend::new()), engine())
            .unwrap();
        assert_eq!(summary.frames.frames, 3);
        assert!(!summary.frames.cancelled);
        assert!(summary.heartbeat.is_some());
    }

    #[test]
    fn pre_cancelled_run_processes_nothing() {
        let source = FileSource::new(FileConfig::default()).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let summary = Orchestrator::new(cancel)
            .run(Box::new(source), Box::new(ReplayBackend::new()), engine())
            .unwrap();
        assert_eq!(summary.frames.frames, 0);
        assert!(summary.frames.cancelled);
        assert_eq!(summary.heartbeat, None);
    }
}
