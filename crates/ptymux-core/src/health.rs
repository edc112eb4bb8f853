//! Per-session liveness probe.
//!
//! Polls the child at a fixed period. The first failed probe marks the
//! session crashed, which fails any pending `send`, and posts an eviction
//! notice so the owner can drop the entry and release descriptors.

use std::sync::Weak;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::session::{InteractiveSession, SessionState};

/// A session that failed its liveness probe.
#[derive(Debug, Clone)]
pub struct Eviction {
    pub id: String,
    /// Identity of the crashed session, so a newer session registered under
    /// the same id is never evicted by mistake.
    pub session: Weak<InteractiveSession>,
}

pub struct HealthMonitor;

impl HealthMonitor {
    /// Watch `session` until it is stopped, dropped or found dead.
    pub fn spawn(
        session: Weak<InteractiveSession>,
        period: Duration,
        evictions: mpsc::UnboundedSender<Eviction>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(live) = session.upgrade() else {
                    break;
                };
                let state = live.state();
                if state.is_shutting_down() {
                    break;
                }
                if state == SessionState::Crashed || !live.is_alive() {
                    live.mark_crashed();
                    warn!(session_id = %live.id(), pid = ?live.pid(), "health check failed");
                    let notice = Eviction {
                        id: live.id().to_string(),
                        session: session.clone(),
                    };
                    if evictions.send(notice).is_err() {
                        debug!(session_id = %live.id(), "no eviction listener");
                    }
                    break;
                }
            }
        })
    }
}
