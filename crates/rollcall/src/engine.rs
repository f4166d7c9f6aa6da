use rollcall_core::{FaceAnalyzer, Gallery, Ledger, RecognitionError, SessionId, SessionRecognizer};
use rollcall_hw::{Camera, CameraError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error(transparent)]
    Recognition(#[from] RecognitionError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Notifications from the engine thread to the CLI.
#[derive(Debug)]
pub enum EngineEvent {
    Marked { session: SessionId, identity: String },
    MarkFailed { identity: String, error: String },
    /// The loop stopped on its own; no further events follow.
    Stopped { error: String },
}

/// Session that was capturing when it was stopped.
#[derive(Debug)]
pub struct StoppedSession {
    pub session: SessionId,
    pub recognized: Vec<String>,
}

/// Commands are applied between frames, never mid-frame.
enum EngineRequest {
    StartSession {
        label: String,
        reply: oneshot::Sender<Result<SessionId, EngineError>>,
    },
    StopSession {
        reply: oneshot::Sender<Option<StoppedSession>>,
    },
}

/// Clone-safe handle to the engine thread. The loop exits once every
/// handle has been dropped.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    pub async fn start_session(&self, label: &str) -> Result<SessionId, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::StartSession {
                label: label.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn stop_session(&self) -> Result<Option<StoppedSession>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::StopSession { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Everything the recognition loop owns.
pub struct EngineParts<A> {
    pub camera: Camera,
    pub analyzer: A,
    pub recognizer: SessionRecognizer,
    pub gallery: Gallery,
    pub ledger: Arc<Ledger>,
}

/// Spawn the session recognition loop on a dedicated OS thread.
///
/// The thread streams frames from the camera, recognizes faces and, while a
/// session is capturing, records attendance. Events are reported on `events`.
pub fn spawn_engine<A>(
    parts: EngineParts<A>,
    events: mpsc::UnboundedSender<EngineEvent>,
) -> Result<EngineHandle, EngineError>
where
    A: FaceAnalyzer + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            if let Err(e) = run_loop(parts, rx, &events) {
                tracing::error!(error = %e, "recognition loop failed");
                let _ = events.send(EngineEvent::Stopped { error: e.to_string() });
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

fn run_loop<A: FaceAnalyzer>(
    parts: EngineParts<A>,
    mut rx: mpsc::Receiver<EngineRequest>,
    events: &mpsc::UnboundedSender<EngineEvent>,
) -> Result<(), EngineError> {
    let EngineParts {
        camera,
        mut analyzer,
        mut recognizer,
        gallery,
        ledger,
    } = parts;
    let mut stream = camera.stream()?;
    let mut frames = 0u64;

    loop {
        loop {
            match rx.try_recv() {
                Ok(req) => handle_request(req, &mut recognizer, &ledger),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    recognizer.stop_session();
                    tracing::info!(frames, "engine handle dropped");
                    return Ok(());
                }
            }
        }

        let frame = stream.next_frame()?;
        let report = recognizer.handle_frame(&ledger, &mut analyzer, &gallery, &frame)?;
        frames += 1;

        if let Some(session) = recognizer.session() {
            for identity in report.marked {
                let _ = events.send(EngineEvent::Marked { session, identity });
            }
        }
        for (identity, error) in report.failed {
            let _ = events.send(EngineEvent::MarkFailed {
                identity,
                error: error.to_string(),
            });
        }
    }
}

fn handle_request(req: EngineRequest, recognizer: &mut SessionRecognizer, ledger: &Ledger) {
    match req {
        EngineRequest::StartSession { label, reply } => {
            let result = recognizer.start_session(ledger, &label).map_err(EngineError::from);
            let _ = reply.send(result);
        }
        EngineRequest::StopSession { reply } => {
            let recognized = recognizer
                .recognized()
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default();
            let stopped = recognizer
                .stop_session()
                .map(|session| StoppedSession { session, recognized });
            let _ = reply.send(stopped);
        }
    }
}
