//! Enforcement state shared by the command server and the monitor

use chrono::{DateTime, Local, NaiveTime, Timelike};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Handle to the single enforcement state of an agent process.
///
/// Every connection handler and both monitor loops go through this one lock.
pub type SharedState = Arc<RwLock<EnforcementState>>;

/// Per-agent time-management state
#[derive(Debug, Clone)]
pub struct EnforcementState {
    started_at: DateTime<Local>,
    usage_limit_minutes: Option<u32>,
    scheduled_locks: Vec<NaiveTime>,
    is_locked: bool,
}

/// A condition that starts the warning-then-lock sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    ScheduledLock(NaiveTime),
    UsageLimit(u32),
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::ScheduledLock(at) => {
                write!(f, "Scheduled lock time reached ({})", at.format("%H:%M"))
            }
            Trigger::UsageLimit(minutes) => {
                write!(f, "Usage limit of {} minutes reached", minutes)
            }
        }
    }
}

impl EnforcementState {
    pub fn new() -> Self {
        Self::started_at(Local::now())
    }

    pub fn started_at(started_at: DateTime<Local>) -> Self {
        Self {
            started_at,
            usage_limit_minutes: None,
            scheduled_locks: Vec::new(),
            is_locked: false,
        }
    }

    pub fn start_time(&self) -> DateTime<Local> {
        self.started_at
    }

    pub fn usage_limit(&self) -> Option<u32> {
        self.usage_limit_minutes
    }

    /// Replace the usage limit (last write wins)
    pub fn set_usage_limit(&mut self, minutes: u32) {
        self.usage_limit_minutes = Some(minutes);
    }

    /// Add minutes to the current limit. Returns the new limit, or `None`
    /// (leaving the state untouched) when no limit is set.
    pub fn extend_usage_limit(&mut self, minutes: u32) -> Option<u32> {
        let limit = self.usage_limit_minutes.as_mut()?;
        *limit = limit.saturating_add(minutes);
        Some(*limit)
    }

    /// Append a scheduled lock. Duplicates are kept.
    pub fn add_scheduled_lock(&mut self, at: NaiveTime) {
        self.scheduled_locks.push(at);
    }

    pub fn scheduled_locks(&self) -> &[NaiveTime] {
        &self.scheduled_locks
    }

    pub fn is_locked(&self) -> bool {
        self.is_locked
    }

    /// Record the lock status. Returns true if it changed.
    pub fn set_locked(&mut self, locked: bool) -> bool {
        let changed = self.is_locked != locked;
        self.is_locked = locked;
        changed
    }

    /// Time of use since the agent started
    pub fn usage_elapsed(&self, now: DateTime<Local>) -> chrono::Duration {
        now.signed_duration_since(self.started_at)
    }

    /// First trigger that is due at `now`, scheduled locks before the usage limit.
    ///
    /// A scheduled lock matches only during the first second of its minute.
    pub fn due_trigger(&self, now: DateTime<Local>) -> Option<Trigger> {
        let wall = now.time();
        if let Some(at) = self
            .scheduled_locks
            .iter()
            .find(|at| at.hour() == wall.hour() && at.minute() == wall.minute() && wall.second() < 1)
        {
            return Some(Trigger::ScheduledLock(*at));
        }

        let limit = self.usage_limit_minutes?;
        if self.usage_elapsed(now).num_seconds() >= i64::from(limit) * 60 {
            return Some(Trigger::UsageLimit(limit));
        }

        None
    }
}

impl Default for EnforcementState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 3, 14, h, m, s).unwrap()
    }

    #[test]
    fn test_new_state_is_unlimited_and_unlocked() {
        let state = EnforcementState::new();
        assert!(state.usage_limit().is_none());
        assert!(state.scheduled_locks().is_empty());
        assert!(!state.is_locked());
    }

    #[test]
    fn test_set_limit_last_write_wins() {
        let mut state = EnforcementState::new();
        state.set_usage_limit(30);
        state.set_usage_limit(90);
        assert_eq!(state.usage_limit(), Some(90));
    }

    #[test]
    fn test_extend_without_limit_is_noop() {
        let mut state = EnforcementState::new();
        assert_eq!(state.extend_usage_limit(15), None);
        assert!(state.usage_limit().is_none());

        state.set_usage_limit(60);
        assert_eq!(state.extend_usage_limit(15), Some(75));
    }

    #[test]
    fn test_scheduled_locks_keep_duplicates() {
        let mut state = EnforcementState::new();
        let nine = NaiveTime::from_hms_opt(21, 0, 0).unwrap();
        state.add_scheduled_lock(nine);
        state.add_scheduled_lock(nine);
        assert_eq!(state.scheduled_locks(), &[nine, nine]);
    }

    #[test]
    fn test_set_locked_reports_change() {
        let mut state = EnforcementState::new();
        assert!(state.set_locked(true));
        assert!(!state.set_locked(true));
        assert!(state.set_locked(false));
    }

    #[test]
    fn test_scheduled_trigger_first_second_only() {
        let mut state = EnforcementState::started_at(at(20, 0, 0));
        let nine = NaiveTime::from_hms_opt(21, 0, 0).unwrap();
        state.add_scheduled_lock(nine);

        assert_eq!(
            state.due_trigger(at(21, 0, 0)),
            Some(Trigger::ScheduledLock(nine))
        );
        assert_eq!(state.due_trigger(at(21, 0, 1)), None);
        assert_eq!(state.due_trigger(at(20, 59, 0)), None);
    }

    #[test]
    fn test_usage_limit_trigger() {
        let start = at(10, 0, 0);
        let mut state = EnforcementState::started_at(start);
        state.set_usage_limit(45);

        assert_eq!(state.due_trigger(start + Duration::minutes(44)), None);
        assert_eq!(
            state.due_trigger(start + Duration::minutes(45)),
            Some(Trigger::UsageLimit(45))
        );
        // Elapsed time is not truncated to a single day
        assert_eq!(
            state.due_trigger(start + Duration::days(1) + Duration::minutes(1)),
            Some(Trigger::UsageLimit(45))
        );
    }

    #[test]
    fn test_trigger_reason_text() {
        assert_eq!(
            Trigger::UsageLimit(120).to_string(),
            "Usage limit of 120 minutes reached"
        );
    }
}
