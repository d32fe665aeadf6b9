//! Endpoint key → session map

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

use super::key::EndpointKey;
use super::orchestrator::{SessionContext, SessionOrchestrator};
use crate::config::CameraConfig;
use crate::error::Result;
use crate::events::SessionEvent;

type SessionMap = HashMap<EndpointKey, Arc<SessionOrchestrator>>;

/// Sessions by endpoint key, one per key
///
/// Owned by the composition root. Sessions are created on first request and
/// drop out of the map when they terminate.
pub struct SessionRegistry {
    ctx: SessionContext,
    sessions: Arc<RwLock<SessionMap>>,
    creating: tokio::sync::Mutex<()>,
    global_mute: AtomicBool,
    global_debug: AtomicBool,
    global_stats: AtomicBool,
}

impl SessionRegistry {
    pub fn new(ctx: SessionContext) -> Self {
        Self {
            ctx,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            creating: tokio::sync::Mutex::new(()),
            global_mute: AtomicBool::new(false),
            global_debug: AtomicBool::new(false),
            global_stats: AtomicBool::new(false),
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Session for `config`, created on first use
    ///
    /// Configs with the same endpoint key share the session. A terminated
    /// session still in the map is replaced.
    pub async fn session(&self, config: &CameraConfig) -> Result<Arc<SessionOrchestrator>> {
        let key = EndpointKey::from_config(config);
        if let Some(session) = self.get(&key) {
            return Ok(session);
        }

        let _creating = self.creating.lock().await;
        if let Some(session) = self.get(&key) {
            return Ok(session);
        }

        let session = SessionOrchestrator::new(config.clone(), self.ctx.clone()).await?;
        if self.global_debug.load(Ordering::Relaxed) {
            session.set_debug(true);
        }
        if self.global_stats.load(Ordering::Relaxed) {
            session.set_statistics_enabled(true);
        }

        let sessions = Arc::downgrade(&self.sessions);
        session.on_terminated(Box::new(move |key| {
            let Some(sessions) = sessions.upgrade() else {
                return;
            };
            let mut sessions = sessions.write();
            if sessions.get(key).map(|s| s.is_terminated()).unwrap_or(false) {
                sessions.remove(key);
                info!("Removed session {}", key);
            }
        }));

        self.sessions.write().insert(key, session.clone());
        Ok(session)
    }

    /// Live session for `key`
    pub fn get(&self, key: &EndpointKey) -> Option<Arc<SessionOrchestrator>> {
        self.sessions
            .read()
            .get(key)
            .filter(|s| !s.is_terminated())
            .cloned()
    }

    pub fn keys(&self) -> Vec<EndpointKey> {
        self.sessions.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    fn all(&self) -> Vec<Arc<SessionOrchestrator>> {
        self.sessions.read().values().cloned().collect()
    }

    /// Flip global mute and tell every session's consumers
    pub fn toggle_global_mute(&self) -> bool {
        let muted = !self.global_mute.fetch_xor(true, Ordering::SeqCst);
        info!("Global mute {}", if muted { "enabled" } else { "disabled" });
        for session in self.all() {
            session.publish(SessionEvent::Mute { muted });
        }
        muted
    }

    pub fn is_muted(&self) -> bool {
        self.global_mute.load(Ordering::SeqCst)
    }

    /// Flip trace mode on every session
    pub fn toggle_global_debug(&self) -> bool {
        let enabled = !self.global_debug.fetch_xor(true, Ordering::SeqCst);
        info!("Global debug mode {}", if enabled { "enabled" } else { "disabled" });
        for session in self.all() {
            session.set_debug(enabled);
        }
        enabled
    }

    /// Flip statistics collection on every session
    pub fn toggle_global_stats(&self) -> bool {
        let enabled = !self.global_stats.fetch_xor(true, Ordering::SeqCst);
        info!("Global stats mode {}", if enabled { "enabled" } else { "disabled" });
        for session in self.all() {
            session.set_statistics_enabled(enabled || session.config().stats);
        }
        enabled
    }

    /// Terminate every session
    pub async fn shutdown(&self) {
        let sessions = self.all();
        info!("Shutting down {} sessions", sessions.len());
        for session in sessions {
            session.terminate().await;
        }
    }
}
