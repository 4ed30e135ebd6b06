//! Enforcement monitor
//!
//! Two independent loops per agent:
//! - reconciliation: polls the real session lock state and corrects the
//!   believed state, catching locks and unlocks done by the user
//! - enforcement: evaluates scheduled locks and the usage limit, and on the
//!   first match warns, waits the lead time and locks. It is one-shot:
//!   `Waiting -> WarningIssued -> Locked`, with no way back short of a restart.

use chrono::Local;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::config::EnforcementConfig;
use crate::metrics::MetricsCollector;
use crate::session::{SessionControl, SessionError};
use crate::state::{SharedState, Trigger};

/// Trigger evaluation runs twice a second so no wall-clock second is skipped
const TRIGGER_TICK: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforcementPhase {
    Waiting,
    WarningIssued,
    Locked,
}

/// A lock state change observed by reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockTransition {
    Locked,
    Unlocked,
}

impl fmt::Display for LockTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockTransition::Locked => f.write_str("unlocked -> locked"),
            LockTransition::Unlocked => f.write_str("locked -> unlocked"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    pub warning_lead: Duration,
    pub trigger_tick: Duration,
}

impl From<&EnforcementConfig> for MonitorConfig {
    fn from(config: &EnforcementConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            warning_lead: config.warning_lead(),
            trigger_tick: TRIGGER_TICK,
        }
    }
}

pub struct EnforcementMonitor {
    state: SharedState,
    session: Arc<dyn SessionControl>,
    metrics: Arc<MetricsCollector>,
    config: MonitorConfig,
    phase: watch::Sender<EnforcementPhase>,
    span: Span,
}

impl EnforcementMonitor {
    pub fn new(
        state: SharedState,
        session: Arc<dyn SessionControl>,
        metrics: Arc<MetricsCollector>,
        config: MonitorConfig,
    ) -> Self {
        let (phase, _) = watch::channel(EnforcementPhase::Waiting);
        Self {
            state,
            session,
            metrics,
            config,
            phase,
            span: info_span!("enforcement"),
        }
    }

    pub fn phase(&self) -> EnforcementPhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<EnforcementPhase> {
        self.phase.subscribe()
    }

    /// Start both loops; they stop when `cancel` fires
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let reconcile = tokio::spawn(
            Arc::clone(self)
                .run_reconciliation(cancel.clone())
                .instrument(self.span.clone()),
        );
        let enforce = tokio::spawn(
            Arc::clone(self)
                .run_enforcement(cancel)
                .instrument(self.span.clone()),
        );
        vec![reconcile, enforce]
    }

    async fn run_reconciliation(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let reconciled = tokio::select! {
                _ = cancel.cancelled() => break,
                reconciled = self.reconcile_once() => reconciled,
            };
            if let Err(e) = reconciled {
                warn!(error = %e, "Could not read session lock state");
            }
        }
        debug!("Reconciliation loop stopped");
    }

    /// Compare the believed lock state with the real one and correct it
    pub async fn reconcile_once(&self) -> Result<Option<LockTransition>, SessionError> {
        let session = Arc::clone(&self.session);
        let actual = tokio::task::spawn_blocking(move || session.is_session_locked())
            .await
            .map_err(|e| SessionError::Aborted(e.to_string()))??;

        if !self.state.write().await.set_locked(actual) {
            return Ok(None);
        }

        let transition = if actual {
            LockTransition::Locked
        } else {
            LockTransition::Unlocked
        };
        self.metrics.record_lock_transition();
        info!(%transition, "Session lock state changed");
        Ok(Some(transition))
    }

    async fn run_enforcement(self: Arc<Self>, cancel: CancellationToken) {
        info!("Enforcement loop running");
        let mut interval = tokio::time::interval(self.config.trigger_tick);

        let trigger = loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            if let Some(trigger) = self.state.read().await.due_trigger(Local::now()) {
                break trigger;
            }
        };

        self.fire(trigger, &cancel).await;
    }

    /// Warn, wait out the lead time, then lock
    async fn fire(&self, trigger: Trigger, cancel: &CancellationToken) {
        info!(reason = %trigger, "Locking PC");
        self.metrics.record_trigger();
        self.phase.send_replace(EnforcementPhase::WarningIssued);

        let warning = format!("Computer will lock in {}!", describe(self.config.warning_lead));
        if let Err(e) = self.call(move |s| s.show_message("Warning", &warning)).await {
            warn!(error = %e, "Could not show lock warning");
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Stopped during warning period, not locking");
                return;
            }
            _ = tokio::time::sleep(self.config.warning_lead) => {}
        }

        match self.call(|s| s.lock_session()).await {
            Ok(()) => {
                self.state.write().await.set_locked(true);
                info!("PC locked by enforcement");
            }
            Err(e) => warn!(error = %e, "Automatic lock failed"),
        }
        self.phase.send_replace(EnforcementPhase::Locked);
    }

    async fn call<F>(&self, f: F) -> Result<(), SessionError>
    where
        F: FnOnce(&dyn SessionControl) -> Result<(), SessionError> + Send + 'static,
    {
        let session = Arc::clone(&self.session);
        tokio::task::spawn_blocking(move || f(session.as_ref()))
            .await
            .map_err(|e| SessionError::Aborted(e.to_string()))?
    }
}

fn describe(lead: Duration) -> String {
    let secs = lead.as_secs();
    match secs {
        60 => "1 minute".to_string(),
        s if s >= 60 && s % 60 == 0 => format!("{} minutes", s / 60),
        1 => "1 second".to_string(),
        s => format!("{} seconds", s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{DryRunSession, SessionAction};
    use crate::state::EnforcementState;
    use tokio::sync::RwLock;

    fn monitor(state: EnforcementState, lead: Duration) -> (Arc<EnforcementMonitor>, Arc<DryRunSession>) {
        let session = Arc::new(DryRunSession::new("test-pc"));
        let monitor = EnforcementMonitor::new(
            Arc::new(RwLock::new(state)),
            session.clone(),
            Arc::new(MetricsCollector::new()),
            MonitorConfig {
                poll_interval: Duration::from_millis(20),
                warning_lead: lead,
                trigger_tick: Duration::from_millis(10),
            },
        );
        (Arc::new(monitor), session)
    }

    async fn wait_for_phase(monitor: &EnforcementMonitor, phase: EnforcementPhase) {
        let mut rx = monitor.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|p| *p == phase))
            .await
            .expect("phase not reached")
            .unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_detects_external_lock_and_unlock() {
        let (monitor, session) = monitor(EnforcementState::new(), Duration::from_secs(60));

        assert_eq!(monitor.reconcile_once().await.unwrap(), None);

        session.set_locked(true);
        assert_eq!(
            monitor.reconcile_once().await.unwrap(),
            Some(LockTransition::Locked)
        );
        assert!(monitor.state.read().await.is_locked());

        session.set_locked(false);
        assert_eq!(
            monitor.reconcile_once().await.unwrap(),
            Some(LockTransition::Unlocked)
        );
        assert!(!monitor.state.read().await.is_locked());
    }

    #[tokio::test]
    async fn test_reconciliation_loop_converges_within_interval() {
        let (monitor, session) = monitor(EnforcementState::new(), Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let tasks = monitor.spawn(cancel.clone());

        session.set_locked(true);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(monitor.state.read().await.is_locked());

        cancel.cancel();
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_usage_limit_warns_then_locks_once() {
        let mut state = EnforcementState::started_at(Local::now() - chrono::Duration::minutes(10));
        state.set_usage_limit(5);
        let (monitor, session) = monitor(state, Duration::from_millis(50));
        assert_eq!(monitor.phase(), EnforcementPhase::Waiting);

        let cancel = CancellationToken::new();
        let tasks = monitor.spawn(cancel.clone());

        wait_for_phase(&monitor, EnforcementPhase::Locked).await;

        let actions = session.actions();
        assert_eq!(actions.len(), 2);
        assert!(matches!(&actions[0], SessionAction::Message { title, .. } if title == "Warning"));
        assert_eq!(actions[1], SessionAction::Lock);
        assert!(monitor.state.read().await.is_locked());

        // One-shot: the enforcement loop has finished, nothing else fires
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(session.actions().len(), 2);

        cancel.cancel();
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_cancel_during_warning_skips_lock() {
        let mut state = EnforcementState::started_at(Local::now() - chrono::Duration::minutes(10));
        state.set_usage_limit(1);
        let (monitor, session) = monitor(state, Duration::from_secs(30));

        let cancel = CancellationToken::new();
        let tasks = monitor.spawn(cancel.clone());
        wait_for_phase(&monitor, EnforcementPhase::WarningIssued).await;

        cancel.cancel();
        for task in tasks {
            task.await.unwrap();
        }
        assert!(!session.actions().contains(&SessionAction::Lock));
    }

    #[test]
    fn test_describe_lead_time() {
        assert_eq!(describe(Duration::from_secs(60)), "1 minute");
        assert_eq!(describe(Duration::from_secs(300)), "5 minutes");
        assert_eq!(describe(Duration::from_secs(45)), "45 seconds");
    }
}
