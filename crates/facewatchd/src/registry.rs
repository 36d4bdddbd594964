//! Camera name to running session, with the control operations that fan out
//! across sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use facewatch_core::{BucketGrid, EngineSettings, IdentitySnapshot, IdentityStore, Session};
use facewatch_store::SqliteStore;
use serde::Serialize;

use crate::dispatch::{DispatchStats, EventDispatcher};
use crate::engine::{spawn_session, EngineError, SessionHandle, SessionStatus};

#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    pub version: &'static str,
    pub sessions: Vec<SessionStatus>,
    pub dispatch: DispatchStats,
}

pub struct SessionRegistry {
    store: Arc<SqliteStore>,
    dispatcher: EventDispatcher,
    grid: BucketGrid,
    queue: usize,
    sessions: Mutex<Sessions>,
}

#[derive(Default)]
struct Sessions {
    running: HashMap<String, SessionHandle>,
    /// Set by `stop_all`; no session starts afterwards.
    closed: bool,
}

impl SessionRegistry {
    pub fn new(store: Arc<SqliteStore>, dispatcher: EventDispatcher, grid: BucketGrid, queue: usize) -> Self {
        Self {
            store,
            dispatcher,
            grid,
            queue,
            sessions: Mutex::new(Sessions::default()),
        }
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    fn handles(&self) -> Vec<SessionHandle> {
        self.sessions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .running
            .values()
            .cloned()
            .collect()
    }

    /// Handle for `camera`, starting a session on first use.
    ///
    /// Blocking: a new session reads identities and settings from the store.
    /// Fails with [`EngineError::Closed`] once `stop_all` has run.
    pub fn get_or_spawn(&self, camera: &str) -> Result<SessionHandle, EngineError> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        if sessions.closed {
            return Err(EngineError::Closed);
        }
        if let Some(handle) = sessions.running.get(camera) {
            return Ok(handle.clone());
        }

        let session = Session::start(camera, &*self.store, &*self.store, self.grid)?;
        let handle = spawn_session(session, self.dispatcher.clone(), self.queue)?;
        sessions.running.insert(camera.to_string(), handle.clone());
        Ok(handle)
    }

    /// Load identities once and install the same snapshot in every session.
    /// On failure every session keeps its current snapshot.
    pub async fn reload_identities(&self) -> Result<usize, EngineError> {
        let store = Arc::clone(&self.store);
        let identities = match tokio::task::spawn_blocking(move || store.list_identities()).await? {
            Ok(identities) => identities,
            Err(e) => {
                tracing::warn!(error = %e, "identity reload failed; keeping previous snapshots");
                return Err(e.into());
            }
        };

        let snapshot = Arc::new(IdentitySnapshot::new(identities));
        let count = snapshot.len();
        for handle in self.handles() {
            if let Err(e) = handle.install_snapshot(Arc::clone(&snapshot)).await {
                tracing::warn!(camera = handle.camera(), error = %e, "snapshot not installed");
            }
        }
        tracing::info!(identities = count, "identities reloaded");
        Ok(count)
    }

    pub async fn reload_settings(&self) -> Result<EngineSettings, EngineError> {
        let store = Arc::clone(&self.store);
        let settings = match tokio::task::spawn_blocking(move || EngineSettings::load(&*store)).await? {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(error = %e, "settings reload failed; keeping previous settings");
                return Err(e.into());
            }
        };

        for handle in self.handles() {
            if let Err(e) = handle.apply_settings(settings.clone()).await {
                tracing::warn!(camera = handle.camera(), error = %e, "settings not applied");
            }
        }
        tracing::info!(threshold = settings.recognition_threshold, "settings reloaded");
        Ok(settings)
    }

    /// Stop one session. `None` if no session runs for `camera`.
    pub async fn stop(&self, camera: &str) -> Result<Option<usize>, EngineError> {
        let handle = self
            .sessions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .running
            .remove(camera);
        match handle {
            Some(handle) => Ok(Some(handle.stop().await?)),
            None => Ok(None),
        }
    }

    /// Stop every session and refuse new ones; returns the total number of
    /// flushed sightings.
    pub async fn stop_all(&self) -> usize {
        let handles: Vec<SessionHandle> = {
            let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
            sessions.closed = true;
            sessions.running.drain().map(|(_, handle)| handle).collect()
        };

        let mut flushed = 0;
        for handle in handles {
            match handle.stop().await {
                Ok(n) => flushed += n,
                Err(e) => tracing::warn!(camera = handle.camera(), error = %e, "session stop failed"),
            }
        }
        flushed
    }

    pub async fn status(&self) -> DaemonStatus {
        let mut sessions = Vec::new();
        for handle in self.handles() {
            match handle.status().await {
                Ok(status) => sessions.push(status),
                Err(e) => tracing::debug!(camera = handle.camera(), error = %e, "status unavailable"),
            }
        }
        sessions.sort_by(|a, b| a.camera.cmp(&b.camera));
        DaemonStatus {
            version: env!("CARGO_PKG_VERSION"),
            sessions,
            dispatch: self.dispatcher.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::RetryPolicy;
    use chrono::{TimeZone, Utc};
    use facewatch_core::{Embedding, ExtractedFace, ExtractedFrame, FaceBox};
    use std::time::Duration;

    fn registry() -> Arc<SessionRegistry> {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .register_face("alice", &Embedding::new(vec![0.0, 1.0]))
            .unwrap();
        let dispatcher = EventDispatcher::new(
            store.clone(),
            tokio::runtime::Handle::current(),
            RetryPolicy {
                max_retries: 3,
                backoff: Duration::from_millis(1),
            },
        );
        Arc::new(SessionRegistry::new(store, dispatcher, BucketGrid::default(), 8))
    }

    fn frame(camera: &str, secs: i64, values: &[f32]) -> ExtractedFrame {
        ExtractedFrame {
            camera: camera.into(),
            sequence: secs as u64,
            captured_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            image_ref: None,
            faces: vec![ExtractedFace {
                bbox: FaceBox::new(0.0, 40.0, 40.0, 0.0),
                embedding: Embedding::new(values.to_vec()),
            }],
        }
    }

    async fn spawn(registry: &Arc<SessionRegistry>, camera: &str) -> SessionHandle {
        let registry = Arc::clone(registry);
        let camera = camera.to_string();
        tokio::task::spawn_blocking(move || registry.get_or_spawn(&camera))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sessions_are_independent() {
        let registry = registry();
        let door = spawn(&registry, "door").await;
        let yard = spawn(&registry, "yard").await;
        door.submit(frame("door", 0, &[5.0, 5.0])).await.unwrap();
        door.submit(frame("door", 1, &[5.0, 5.0])).await.unwrap();
        yard.submit(frame("yard", 0, &[5.0, 5.0])).await.unwrap();

        let status = registry.status().await;
        assert_eq!(status.sessions.len(), 2);
        assert_eq!(status.sessions[0].camera, "door");
        assert_eq!(status.sessions[0].stats.events, 1);
        assert_eq!(status.sessions[1].stats.events, 0);
        assert_eq!(status.sessions[1].tracked_sightings, 1);

        registry.stop_all().await;
        assert!(registry.dispatcher().wait_idle(Duration::from_secs(5)).await);
        assert_eq!(registry.store.event_count().unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_sessions_start_after_stop_all() {
        let registry = registry();
        spawn(&registry, "door").await;
        registry.stop_all().await;

        let late = Arc::clone(&registry);
        let result = tokio::task::spawn_blocking(move || late.get_or_spawn("door"))
            .await
            .unwrap();
        assert!(matches!(result, Err(EngineError::Closed)));
        assert!(registry.status().await.sessions.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reload_identities_reaches_running_sessions() {
        let registry = registry();
        let door = spawn(&registry, "door").await;
        registry
            .store
            .register_face("bob", &Embedding::new(vec![1.0, 0.0]))
            .unwrap();

        assert_eq!(registry.reload_identities().await.unwrap(), 2);
        assert_eq!(door.status().await.unwrap().identities, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reload_settings_and_stop_one() {
        let registry = registry();
        spawn(&registry, "door").await;
        registry.store.set_setting("recognition_threshold", "0.3").unwrap();
        let settings = registry.reload_settings().await.unwrap();
        assert!((settings.recognition_threshold - 0.3).abs() < 1e-6);

        assert_eq!(registry.stop("door").await.unwrap(), Some(0));
        assert_eq!(registry.stop("door").await.unwrap(), None);
        assert!(registry.status().await.sessions.is_empty());
    }
}
