//! Command dispatch: one command line in, one response string out

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::daemon::protocol::{response, Command, HELP_TEXT};
use crate::metrics::MetricsCollector;
use crate::session::{SessionControl, SessionError, MESSAGE_TITLE};
use crate::state::SharedState;

/// Turns command lines into state changes or session actions.
///
/// `process` never fails: protocol errors, collaborator errors and panics all
/// come back as response text, so a bad command cannot take down the
/// connection that carried it.
pub struct CommandProcessor {
    state: SharedState,
    session: Arc<dyn SessionControl>,
    metrics: Arc<MetricsCollector>,
    shutdown_delay: Duration,
}

impl CommandProcessor {
    pub fn new(
        state: SharedState,
        session: Arc<dyn SessionControl>,
        metrics: Arc<MetricsCollector>,
        shutdown_delay: Duration,
    ) -> Self {
        Self {
            state,
            session,
            metrics,
            shutdown_delay,
        }
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Process a single command line and produce its response
    pub async fn process(&self, line: &str) -> String {
        let start = Instant::now();

        let command = match line.parse::<Command>() {
            Ok(command) => command,
            Err(e) => {
                debug!(line, error = %e, "Rejected command");
                self.metrics.record_command(false, start.elapsed());
                return e.to_string();
            }
        };

        let (text, success) = match AssertUnwindSafe(self.dispatch(command))
            .catch_unwind()
            .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                error!(error = %e, "Command processing error");
                (response::internal_error(e), false)
            }
            Err(_) => {
                error!("Command processing panicked");
                (response::internal_error("internal failure"), false)
            }
        };

        self.metrics.record_command(success, start.elapsed());
        text
    }

    /// Returns the response and whether the command succeeded
    async fn dispatch(&self, command: Command) -> Result<(String, bool), SessionError> {
        let outcome = match command {
            Command::Lock => {
                self.with_session(|s| s.lock_session()).await?;
                self.state.write().await.set_locked(true);
                (response::LOCKED.to_string(), true)
            }

            Command::Shutdown => {
                let delay = self.shutdown_delay;
                self.with_session(move |s| s.shutdown(delay)).await?;
                (response::SHUTTING_DOWN.to_string(), true)
            }

            Command::CancelShutdown => {
                self.with_session(|s| s.cancel_shutdown()).await?;
                (response::SHUTDOWN_CANCELLED.to_string(), true)
            }

            Command::GetName => (self.with_session(|s| Ok(s.hostname())).await?, true),

            Command::GetStatus => {
                let actual = self.with_session(|s| s.is_session_locked()).await?;
                if self.state.write().await.set_locked(actual) {
                    info!(status = response::status(actual), "Status changed");
                }
                (response::status(actual).to_string(), true)
            }

            Command::Message(text) => {
                self.with_session(move |s| s.show_message(MESSAGE_TITLE, &text))
                    .await?;
                (response::MESSAGE_SENT.to_string(), true)
            }

            Command::SetLimit(minutes) => {
                self.state.write().await.set_usage_limit(minutes);
                info!(minutes, "Usage limit set");
                (response::limit_set(minutes), true)
            }

            Command::AddLockTime(at) => {
                self.state.write().await.add_scheduled_lock(at);
                info!(at = %at.format("%H:%M"), "Scheduled lock added");
                (response::lock_time_added(at), true)
            }

            Command::ExtendTime(minutes) => {
                match self.state.write().await.extend_usage_limit(minutes) {
                    Some(limit) => {
                        info!(minutes, limit, "Usage limit extended");
                        (response::extended(minutes), true)
                    }
                    None => (response::NO_LIMIT_TO_EXTEND.to_string(), false),
                }
            }

            Command::Help => (HELP_TEXT.to_string(), true),

            Command::Metrics => (self.metrics.snapshot().to_prometheus(), true),
        };

        Ok(outcome)
    }

    /// Run a (possibly blocking) collaborator call off the async workers
    async fn with_session<T, F>(&self, call: F) -> Result<T, SessionError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn SessionControl) -> Result<T, SessionError> + Send + 'static,
    {
        let session = Arc::clone(&self.session);
        tokio::task::spawn_blocking(move || call(session.as_ref()))
            .await
            .map_err(|e| SessionError::Aborted(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{DryRunSession, SessionAction};
    use crate::state::EnforcementState;
    use chrono::NaiveTime;
    use tokio::sync::RwLock;

    fn processor() -> (CommandProcessor, Arc<DryRunSession>) {
        let session = Arc::new(DryRunSession::new("kid-laptop"));
        let state = Arc::new(RwLock::new(EnforcementState::new()));
        let processor = CommandProcessor::new(
            state,
            session.clone(),
            Arc::new(MetricsCollector::new()),
            Duration::from_secs(60),
        );
        (processor, session)
    }

    #[tokio::test]
    async fn test_lock_sets_state_and_calls_session() {
        let (processor, session) = processor();

        assert_eq!(processor.process("LOCK").await, "PC Locked");

        assert!(processor.state().read().await.is_locked());
        assert_eq!(session.actions(), vec![SessionAction::Lock]);
    }

    #[tokio::test]
    async fn test_shutdown_uses_configured_delay() {
        let (processor, session) = processor();

        assert_eq!(processor.process("SHUTDOWN").await, "PC Shutting down");
        assert_eq!(
            session.actions(),
            vec![SessionAction::Shutdown(Duration::from_secs(60))]
        );
    }

    #[tokio::test]
    async fn test_get_name_returns_hostname() {
        let (processor, _session) = processor();
        assert_eq!(processor.process("GET_NAME").await, "kid-laptop");
    }

    #[tokio::test]
    async fn test_get_status_reconciles_state() {
        let (processor, session) = processor();

        assert_eq!(processor.process("GET_STATUS").await, "UNLOCKED");

        // Locked by the user, outside the agent
        session.set_locked(true);
        assert_eq!(processor.process("GET_STATUS").await, "LOCKED");
        assert!(processor.state().read().await.is_locked());
    }

    #[tokio::test]
    async fn test_message_is_shown() {
        let (processor, session) = processor();

        assert_eq!(
            processor.process("MESSAGE:Homework first").await,
            "Message sent"
        );
        assert_eq!(
            session.actions(),
            vec![SessionAction::Message {
                title: MESSAGE_TITLE.to_string(),
                text: "Homework first".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_set_limit_last_write_wins() {
        let (processor, _session) = processor();

        assert_eq!(
            processor.process("SET_LIMIT:30").await,
            "Usage limit set to 30 minutes"
        );
        assert_eq!(
            processor.process("SET_LIMIT:90").await,
            "Usage limit set to 90 minutes"
        );
        assert_eq!(processor.state().read().await.usage_limit(), Some(90));

        assert_eq!(
            processor.process("SET_LIMIT:lots").await,
            "Invalid limit value"
        );
        assert_eq!(processor.state().read().await.usage_limit(), Some(90));
    }

    #[tokio::test]
    async fn test_extend_without_limit() {
        let (processor, _session) = processor();

        assert_eq!(
            processor.process("EXTEND_TIME:15").await,
            "No time limit set to extend"
        );
        assert!(processor.state().read().await.usage_limit().is_none());

        processor.process("SET_LIMIT:60").await;
        assert_eq!(
            processor.process("EXTEND_TIME:15").await,
            "Extended time by 15 minutes"
        );
        assert_eq!(processor.state().read().await.usage_limit(), Some(75));

        assert_eq!(
            processor.process("EXTEND_TIME:x").await,
            "Invalid time value"
        );
    }

    #[tokio::test]
    async fn test_add_lock_time() {
        let (processor, _session) = processor();

        assert_eq!(
            processor.process("ADD_LOCK_TIME:25:99").await,
            "Invalid time format (use HH:MM)"
        );
        assert!(processor.state().read().await.scheduled_locks().is_empty());

        assert_eq!(
            processor.process("ADD_LOCK_TIME:21:00").await,
            "Lock time added: 21:00"
        );
        assert_eq!(
            processor.process("ADD_LOCK_TIME:21:00").await,
            "Lock time added: 21:00"
        );

        let nine = NaiveTime::from_hms_opt(21, 0, 0).unwrap();
        assert_eq!(
            processor.state().read().await.scheduled_locks(),
            &[nine, nine]
        );
    }

    #[tokio::test]
    async fn test_help_is_fixed() {
        let (processor, _session) = processor();

        let before = processor.process("HELP").await;
        processor.process("SET_LIMIT:5").await;
        processor.process("LOCK").await;
        let after = processor.process("HELP").await;

        assert_eq!(before, HELP_TEXT);
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let (processor, _session) = processor();
        assert_eq!(
            processor.process("REBOOT").await,
            "Unknown command (try HELP)"
        );
    }

    #[tokio::test]
    async fn test_collaborator_failure_becomes_response() {
        let (processor, session) = processor();
        session.fail_with(Some("lock screen unavailable"));

        assert_eq!(
            processor.process("LOCK").await,
            "Error processing command: session action aborted: lock screen unavailable"
        );
        assert!(!processor.state().read().await.is_locked());
    }

    #[tokio::test]
    async fn test_metrics_counts_commands() {
        let (processor, _session) = processor();
        processor.process("HELP").await;
        processor.process("BOGUS").await;

        let text = processor.process("METRICS").await;
        assert!(text.contains("timeguard_agent_commands_total 2"));
        assert!(text.contains("timeguard_agent_command_errors_total 1"));
    }

    struct PanickingSession;

    impl SessionControl for PanickingSession {
        fn lock_session(&self) -> Result<(), SessionError> {
            panic!("boom")
        }
        fn shutdown(&self, _delay: Duration) -> Result<(), SessionError> {
            Ok(())
        }
        fn cancel_shutdown(&self) -> Result<(), SessionError> {
            Ok(())
        }
        fn show_message(&self, _title: &str, _text: &str) -> Result<(), SessionError> {
            Ok(())
        }
        fn is_session_locked(&self) -> Result<bool, SessionError> {
            Ok(false)
        }
        fn hostname(&self) -> String {
            "kid-laptop".to_string()
        }
    }

    #[tokio::test]
    async fn test_collaborator_panic_becomes_response() {
        let processor = CommandProcessor::new(
            Arc::new(RwLock::new(EnforcementState::new())),
            Arc::new(PanickingSession),
            Arc::new(MetricsCollector::new()),
            Duration::from_secs(60),
        );

        let text = processor.process("LOCK").await;
        assert!(
            text.starts_with("Error processing command: session action aborted:"),
            "{}",
            text
        );
        assert!(text.contains("boom"));
        assert!(!processor.state().read().await.is_locked());

        // The processor keeps serving after the panic
        assert_eq!(processor.process("GET_STATUS").await, "UNLOCKED");
    }
}
