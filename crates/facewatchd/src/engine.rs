use std::sync::Arc;

use facewatch_core::{
    EngineSettings, ExtractedFrame, IdentitySnapshot, ProviderError, Session, SessionError,
    SessionStats,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::dispatch::EventDispatcher;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("session start failed: {0}")]
    Session(#[from] SessionError),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("failed to spawn session thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("session thread exited")]
    ChannelClosed,
    #[error("registry is shut down")]
    Closed,
}

/// Point-in-time view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub camera: String,
    pub identities: usize,
    pub tracked_sightings: usize,
    pub stats: SessionStats,
}

/// Messages sent to a session thread.
enum SessionRequest {
    Frame(ExtractedFrame),
    InstallSnapshot(Arc<IdentitySnapshot>),
    ApplySettings(EngineSettings),
    Status {
        reply: oneshot::Sender<SessionStatus>,
    },
    Stop {
        reply: oneshot::Sender<usize>,
    },
}

/// Clone-safe handle to one session thread.
#[derive(Clone)]
pub struct SessionHandle {
    camera: String,
    tx: mpsc::Sender<SessionRequest>,
}

impl SessionHandle {
    pub fn camera(&self) -> &str {
        &self.camera
    }

    /// Queue a frame from a non-async thread. Blocks while the queue is full.
    pub fn blocking_submit(&self, frame: ExtractedFrame) -> Result<(), EngineError> {
        self.tx
            .blocking_send(SessionRequest::Frame(frame))
            .map_err(|_| EngineError::ChannelClosed)
    }

    #[cfg(test)]
    pub async fn submit(&self, frame: ExtractedFrame) -> Result<(), EngineError> {
        self.send(SessionRequest::Frame(frame)).await
    }

    pub async fn install_snapshot(&self, snapshot: Arc<IdentitySnapshot>) -> Result<(), EngineError> {
        self.send(SessionRequest::InstallSnapshot(snapshot)).await
    }

    pub async fn apply_settings(&self, settings: EngineSettings) -> Result<(), EngineError> {
        self.send(SessionRequest::ApplySettings(settings)).await
    }

    pub async fn status(&self) -> Result<SessionStatus, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(SessionRequest::Status { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Stop the session after the frames already queued. Returns the number
    /// of sightings flushed on the way out.
    pub async fn stop(&self) -> Result<usize, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(SessionRequest::Stop { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    async fn send(&self, request: SessionRequest) -> Result<(), EngineError> {
        self.tx
            .send(request)
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }
}

/// Run `session` on a dedicated OS thread.
///
/// Frames are processed strictly in arrival order. Emitted events go to
/// `dispatcher` without waiting for delivery. The session is stopped (and
/// eligible sightings flushed) on a stop request or when every handle has
/// been dropped.
pub fn spawn_session(
    session: Session,
    dispatcher: EventDispatcher,
    queue: usize,
) -> Result<SessionHandle, EngineError> {
    let camera = session.name().to_string();
    let (tx, mut rx) = mpsc::channel::<SessionRequest>(queue.max(1));

    std::thread::Builder::new()
        .name(format!("facewatch-{camera}"))
        .spawn(move || {
            let mut session = session;
            let mut stop_reply = None;
            tracing::info!(camera = %session.name(), "session thread started");

            while let Some(req) = rx.blocking_recv() {
                match req {
                    SessionRequest::Frame(frame) => {
                        for event in session.process_frame(frame) {
                            dispatcher.dispatch(event);
                        }
                    }
                    SessionRequest::InstallSnapshot(snapshot) => session.install_snapshot(snapshot),
                    SessionRequest::ApplySettings(settings) => session.apply_settings(settings),
                    SessionRequest::Status { reply } => {
                        let _ = reply.send(status_of(&session));
                    }
                    SessionRequest::Stop { reply } => {
                        stop_reply = Some(reply);
                        break;
                    }
                }
            }

            let flushed = session.stop();
            let count = flushed.len();
            for event in flushed {
                dispatcher.dispatch(event);
            }
            if let Some(reply) = stop_reply {
                let _ = reply.send(count);
            }
            tracing::info!(flushed = count, "session thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(SessionHandle { camera, tx })
}

fn status_of(session: &Session) -> SessionStatus {
    SessionStatus {
        camera: session.name().to_string(),
        identities: session.snapshot().len(),
        tracked_sightings: session.tracked_sightings(),
        stats: session.stats().clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::RetryPolicy;
    use chrono::{DateTime, TimeZone, Utc};
    use facewatch_core::{
        BucketGrid, DetectionEvent, Embedding, EventKind, EventSink, ExtractedFace, FaceBox,
        KnownIdentity, SinkError,
    };
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct MemorySink {
        events: Mutex<Vec<DetectionEvent>>,
    }

    impl EventSink for MemorySink {
        fn emit(&self, event: &DetectionEvent) -> Result<(), SinkError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn at(secs: f64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + (secs * 1000.0) as i64)
            .unwrap()
    }

    fn stranger(secs: f64) -> ExtractedFrame {
        ExtractedFrame {
            camera: "door".into(),
            sequence: 0,
            captured_at: at(secs),
            image_ref: None,
            faces: vec![ExtractedFace {
                bbox: FaceBox::new(0.0, 40.0, 40.0, 0.0),
                embedding: Embedding::new(vec![5.0, 5.0]),
            }],
        }
    }

    fn session() -> Session {
        let snapshot = IdentitySnapshot::new(vec![KnownIdentity::new(
            "alice",
            vec![Embedding::new(vec![0.0, 0.0])],
        )]);
        Session::with_state("door", Arc::new(snapshot), EngineSettings::default(), BucketGrid::default())
    }

    fn dispatcher(sink: Arc<MemorySink>) -> EventDispatcher {
        EventDispatcher::new(
            sink,
            tokio::runtime::Handle::current(),
            RetryPolicy {
                max_retries: 0,
                backoff: Duration::from_millis(1),
            },
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_session_thread_processes_frames_in_order() {
        let sink = Arc::new(MemorySink::default());
        let dispatcher = dispatcher(sink.clone());
        let handle = spawn_session(session(), dispatcher.clone(), 8).unwrap();

        handle.submit(stranger(0.0)).await.unwrap();
        handle.submit(stranger(1.0)).await.unwrap();
        let status = handle.status().await.unwrap();
        assert_eq!(status.stats.frames, 2);
        assert_eq!(status.stats.unknown, 2);
        assert_eq!(status.identities, 1);

        assert_eq!(handle.stop().await.unwrap(), 0);
        assert!(dispatcher.wait_idle(Duration::from_secs(5)).await);
        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Unknown);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_snapshot_swap_applies_to_later_frames() {
        let sink = Arc::new(MemorySink::default());
        let handle = spawn_session(session(), dispatcher(sink.clone()), 8).unwrap();

        let swapped = IdentitySnapshot::new(vec![KnownIdentity::new(
            "bob",
            vec![Embedding::new(vec![5.0, 5.1])],
        )]);
        handle.install_snapshot(Arc::new(swapped)).await.unwrap();
        handle.submit(stranger(0.0)).await.unwrap();

        let status = handle.status().await.unwrap();
        assert_eq!(status.stats.recognized, 1);
        handle.stop().await.unwrap();
        assert!(handle.status().await.is_err());
    }
}
