use std::sync::Arc;

use zbus::interface;

use crate::registry::SessionRegistry;

/// D-Bus control surface for the detection daemon.
///
/// Bus name: org.facewatch.Engine1
/// Object path: /org/facewatch/Engine1
pub struct FacewatchService {
    registry: Arc<SessionRegistry>,
}

impl FacewatchService {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.facewatch.Engine1")]
impl FacewatchService {
    /// Reload identities from the store into every running session.
    /// Returns the number of identities now matched against.
    async fn reload_identities(&self) -> zbus::fdo::Result<u32> {
        tracing::info!("reload_identities requested");
        let count = self.registry.reload_identities().await.map_err(failed)?;
        Ok(count as u32)
    }

    /// Re-read thresholds and timings. Returns the applied settings as JSON.
    async fn reload_settings(&self) -> zbus::fdo::Result<String> {
        tracing::info!("reload_settings requested");
        let settings = self.registry.reload_settings().await.map_err(failed)?;
        serde_json::to_string(&settings).map_err(failed)
    }

    /// Stop the session for `camera`, flushing eligible sightings.
    /// Returns false when no such session is running.
    async fn stop_session(&self, camera: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(camera, "stop_session requested");
        let stopped = self.registry.stop(camera).await.map_err(failed)?;
        Ok(stopped.is_some())
    }

    /// Return daemon status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.registry.status().await;
        serde_json::to_string(&status).map_err(failed)
    }
}
