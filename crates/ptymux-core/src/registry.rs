//! Session registry.
//!
//! Maps caller-supplied ids to running sessions. Creation and removal are
//! serialized by one async lock so an id never spawns two children; lookups
//! only take the read side of the map. Crashed sessions are evicted by a
//! background task fed by the per-session health monitors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{PatternError, SendError, SendResult, StartupError, StartupResult};
use crate::health::{Eviction, HealthMonitor};
use crate::launch::{CredentialEnv, LaunchSpec};
use crate::session::{InteractiveSession, SessionInfo, SessionRules, SessionStatus};

type SessionMap = Arc<RwLock<HashMap<String, Arc<InteractiveSession>>>>;

/// Owns every session of one process. Construct once and pass it around.
pub struct SessionRegistry {
    sessions: SessionMap,
    /// Serializes create, remove and gc. Held across a child's startup, so
    /// creating one id makes creates of other ids wait for it too.
    create_lock: Mutex<()>,
    config: SessionConfig,
    rules: SessionRules,
    evictions: mpsc::UnboundedSender<Eviction>,
    evictor: JoinHandle<()>,
}

impl SessionRegistry {
    /// Compile the rule tables and start the eviction task. Must be called
    /// inside a Tokio runtime.
    pub fn new(config: SessionConfig) -> Result<Self, PatternError> {
        let rules = SessionRules::compile(&config)?;
        let sessions: SessionMap = Arc::new(RwLock::new(HashMap::new()));
        let (evictions, rx) = mpsc::unbounded_channel();
        let evictor = tokio::spawn(evict_loop(Arc::clone(&sessions), rx));
        Ok(Self {
            sessions,
            create_lock: Mutex::new(()),
            config,
            rules,
            evictions,
            evictor,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Return the live session for `id`, starting one if there is none.
    /// A crashed or terminated entry under `id` is replaced.
    pub async fn get_or_create(
        &self,
        id: &str,
        launch: &LaunchSpec,
        env: &CredentialEnv,
    ) -> StartupResult<Arc<InteractiveSession>> {
        let _guard = self.create_lock.lock().await;

        if let Some(existing) = self.get(id).await {
            if existing.is_alive() {
                return Ok(existing);
            }
            info!(session_id = %id, state = ?existing.state(), "replacing stale session");
            self.sessions.write().await.remove(id);
            existing.stop().await;
        }

        let count = self.count().await;
        if count >= self.config.max_sessions {
            warn!(session_id = %id, count, "session limit reached");
            return Err(StartupError::CapacityExceeded(self.config.max_sessions));
        }

        let session = Arc::new(
            InteractiveSession::start(id, launch, env, &self.config, &self.rules).await?,
        );
        HealthMonitor::spawn(
            Arc::downgrade(&session),
            self.config.health_period(),
            self.evictions.clone(),
        );
        self.sessions
            .write()
            .await
            .insert(id.to_string(), Arc::clone(&session));
        info!(session_id = %id, pid = ?session.pid(), "session created");
        Ok(session)
    }

    /// Same as `get_or_create`, for callers that only need the side effect.
    pub async fn create(
        &self,
        id: &str,
        launch: &LaunchSpec,
        env: &CredentialEnv,
    ) -> StartupResult<()> {
        self.get_or_create(id, launch, env).await.map(|_| ())
    }

    pub async fn get(&self, id: &str) -> Option<Arc<InteractiveSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Send to the session registered under `id`.
    pub async fn send(&self, id: &str, text: &str, timeout: Duration) -> SendResult<String> {
        let session = self
            .get(id)
            .await
            .ok_or_else(|| SendError::NotFound(id.to_string()))?;
        session.send(text, timeout).await
    }

    pub async fn status(&self, id: &str) -> SessionStatus {
        match self.get(id).await {
            Some(session) => session.status(),
            None => SessionStatus {
                exists: false,
                alive: false,
            },
        }
    }

    /// Remove and stop the session. Returns false if `id` was unknown.
    pub async fn remove(&self, id: &str) -> bool {
        let _guard = self.create_lock.lock().await;
        let Some(session) = self.sessions.write().await.remove(id) else {
            return false;
        };
        session.stop().await;
        info!(session_id = %id, "session removed");
        true
    }

    /// Alias of `remove`.
    pub async fn stop(&self, id: &str) -> bool {
        self.remove(id).await
    }

    /// Snapshot of every session, ordered by id.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<_> = self
            .sessions
            .read()
            .await
            .values()
            .map(|s| s.info())
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Stop sessions idle past `idle_timeout`, and any left dead.
    ///
    /// Returns the ids that were removed.
    pub async fn gc(&self) -> Vec<String> {
        let _guard = self.create_lock.lock().await;
        let idle_timeout = self.config.idle_timeout();

        let expired: Vec<Arc<InteractiveSession>> = {
            let mut sessions = self.sessions.write().await;
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| !s.is_alive() || s.idle_for() > idle_timeout)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        let mut removed = Vec::with_capacity(expired.len());
        for session in expired {
            warn!(
                session_id = %session.id(),
                idle_secs = session.idle_for().as_secs(),
                alive = session.is_alive(),
                "session expired"
            );
            session.stop().await;
            removed.push(session.id().to_string());
        }
        if !removed.is_empty() {
            debug!(count = removed.len(), "GC removed sessions");
        }
        removed
    }

    /// Stop every session.
    pub async fn shutdown(&self) {
        let _guard = self.create_lock.lock().await;
        let drained: Vec<_> = self.sessions.write().await.drain().collect();
        if drained.is_empty() {
            return;
        }
        info!(count = drained.len(), "stopping all sessions");
        let mut stops = JoinSet::new();
        for (_, session) in drained {
            stops.spawn(async move { session.stop().await });
        }
        while let Some(result) = stops.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "session stop task failed");
            }
        }
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.evictor.abort();
    }
}

async fn evict_loop(sessions: SessionMap, mut rx: mpsc::UnboundedReceiver<Eviction>) {
    while let Some(notice) = rx.recv().await {
        let evicted = {
            let mut map = sessions.write().await;
            let same = map
                .get(&notice.id)
                .is_some_and(|s| Arc::as_ptr(s) == notice.session.as_ptr());
            if same {
                map.remove(&notice.id)
            } else {
                None
            }
        };
        match evicted {
            Some(session) => {
                info!(session_id = %notice.id, "evicting crashed session");
                tokio::spawn(async move { session.stop().await });
            }
            None => debug!(session_id = %notice.id, "stale eviction notice ignored"),
        }
    }
}
