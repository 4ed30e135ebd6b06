//! Operator actions and their agent command lines

use clap::Subcommand;
use serde::{Deserialize, Serialize};

use timeguard_agent::daemon::protocol::parse_clock;
use timeguard_agent::daemon::{Command, ProtocolError};

fn default_limit_minutes() -> u32 {
    120
}

fn default_lock_time() -> String {
    "21:00".to_string()
}

/// What an operator can ask of an agent.
///
/// Deserializes from `{"action": "set_limit", "minutes": 90}` and friends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Subcommand)]
#[serde(tag = "action", rename_all = "snake_case")]
#[command(rename_all = "snake_case")]
pub enum Action {
    /// Lock the session now
    Lock,
    /// Shut the machine down after the agent's delay
    Shutdown,
    /// Cancel a pending shutdown
    CancelShutdown,
    /// Show a popup
    Message { message: String },
    /// Set the usage limit
    SetLimit {
        #[serde(default = "default_limit_minutes")]
        #[arg(default_value_t = default_limit_minutes())]
        minutes: u32,
    },
    /// Add a daily lock time (HH:MM)
    AddLockTime {
        #[serde(default = "default_lock_time")]
        #[arg(default_value_t = default_lock_time())]
        time: String,
    },
    /// Extend the usage limit
    ExtendTime { minutes: u32 },
    /// Query the lock status
    Status,
}

impl Action {
    /// The command this action sends, validated before anything goes on the wire
    pub fn to_command(&self) -> Result<Command, ProtocolError> {
        Ok(match self {
            Action::Lock => Command::Lock,
            Action::Shutdown => Command::Shutdown,
            Action::CancelShutdown => Command::CancelShutdown,
            Action::Message { message } => Command::Message(message.clone()),
            Action::SetLimit { minutes: 0 } => return Err(ProtocolError::InvalidLimit),
            Action::SetLimit { minutes } => Command::SetLimit(*minutes),
            Action::AddLockTime { time } => Command::AddLockTime(parse_clock(time)?),
            Action::ExtendTime { minutes: 0 } => return Err(ProtocolError::InvalidExtension),
            Action::ExtendTime { minutes } => Command::ExtendTime(*minutes),
            Action::Status => Command::GetStatus,
        })
    }
}
