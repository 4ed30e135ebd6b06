//! Text command protocol between controller and agent
//!
//! A command is `VERB` or `VERB:argument`; verbs are case-sensitive. Each
//! message travels in its own length-delimited frame (4-byte big-endian
//! length, then the body), so multi-line responses can never be split across
//! reads.
//!
//! Command frames are plain UTF-8. Frames from the agent start with a kind
//! byte, [`Reply::KeepAlive`] or [`Reply::Response`] followed by UTF-8 text,
//! so no response text can ever be mistaken for a keepalive.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{NaiveTime, Timelike};
use std::fmt;
use std::str::FromStr;
use tokio_util::codec::LengthDelimitedCodec;

/// Body of a keepalive frame, after the kind byte
pub const KEEPALIVE: &str = "ALIVE";

const KEEPALIVE_KIND: u8 = 0x00;
const RESPONSE_KIND: u8 = 0x01;

/// Largest frame either side accepts
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Codec used on both ends of a connection
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

pub const HELP_TEXT: &str = "Available commands:\n\
LOCK - Lock the PC\n\
SHUTDOWN - Shutdown the PC\n\
CANCEL_SHUTDOWN - Cancel a pending shutdown\n\
GET_NAME - Get PC name\n\
GET_STATUS - Check if PC is locked\n\
MESSAGE:<text> - Show popup message\n\
SET_LIMIT:<minutes> - Set usage limit\n\
ADD_LOCK_TIME:HH:MM - Add scheduled lock\n\
EXTEND_TIME:<minutes> - Extend usage time\n\
METRICS - Show agent metrics";

/// Fixed response texts
pub mod response {
    pub const LOCKED: &str = "PC Locked";
    pub const SHUTTING_DOWN: &str = "PC Shutting down";
    pub const SHUTDOWN_CANCELLED: &str = "Shutdown cancelled";
    pub const MESSAGE_SENT: &str = "Message sent";
    pub const STATUS_LOCKED: &str = "LOCKED";
    pub const STATUS_UNLOCKED: &str = "UNLOCKED";
    pub const NO_LIMIT_TO_EXTEND: &str = "No time limit set to extend";

    pub fn limit_set(minutes: u32) -> String {
        format!("Usage limit set to {} minutes", minutes)
    }

    pub fn lock_time_added(at: chrono::NaiveTime) -> String {
        format!("Lock time added: {}", at.format("%H:%M"))
    }

    pub fn extended(minutes: u32) -> String {
        format!("Extended time by {} minutes", minutes)
    }

    pub fn status(locked: bool) -> &'static str {
        if locked {
            STATUS_LOCKED
        } else {
            STATUS_UNLOCKED
        }
    }

    pub fn internal_error(description: impl std::fmt::Display) -> String {
        format!("Error processing command: {}", description)
    }
}

/// A frame sent from agent to controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Sent on a connection that has been idle for the idle timeout
    KeepAlive,
    Response(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplyError {
    #[error("empty reply frame")]
    Empty,
    #[error("unknown reply kind {0:#04x}")]
    UnknownKind(u8),
    #[error("reply is not valid UTF-8")]
    InvalidUtf8,
}

impl Reply {
    pub fn encode(&self) -> Bytes {
        match self {
            Reply::KeepAlive => {
                let mut buf = BytesMut::with_capacity(1 + KEEPALIVE.len());
                buf.put_u8(KEEPALIVE_KIND);
                buf.put_slice(KEEPALIVE.as_bytes());
                buf.freeze()
            }
            Reply::Response(text) => {
                let mut buf = BytesMut::with_capacity(1 + text.len());
                buf.put_u8(RESPONSE_KIND);
                buf.put_slice(text.as_bytes());
                buf.freeze()
            }
        }
    }

    pub fn decode(frame: &[u8]) -> Result<Self, ReplyError> {
        let (&kind, body) = frame.split_first().ok_or(ReplyError::Empty)?;
        match kind {
            KEEPALIVE_KIND => Ok(Reply::KeepAlive),
            RESPONSE_KIND => std::str::from_utf8(body)
                .map(|text| Reply::Response(text.to_string()))
                .map_err(|_| ReplyError::InvalidUtf8),
            other => Err(ReplyError::UnknownKind(other)),
        }
    }
}

/// A parsed agent command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Lock,
    Shutdown,
    CancelShutdown,
    GetName,
    GetStatus,
    Message(String),
    SetLimit(u32),
    AddLockTime(NaiveTime),
    ExtendTime(u32),
    Help,
    Metrics,
}

/// Why a command line was rejected. The display text is the response sent back.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown command (try HELP)")]
    UnknownCommand,
    #[error("Invalid limit value")]
    InvalidLimit,
    #[error("Invalid time format (use HH:MM)")]
    InvalidLockTime,
    #[error("Invalid time value")]
    InvalidExtension,
}

/// Parse `HH:MM` into a wall-clock time
pub fn parse_clock(input: &str) -> Result<NaiveTime, ProtocolError> {
    let (hour, minute) = input
        .trim()
        .split_once(':')
        .ok_or(ProtocolError::InvalidLockTime)?;
    let hour: u32 = hour.trim().parse().map_err(|_| ProtocolError::InvalidLockTime)?;
    let minute: u32 = minute
        .trim()
        .parse()
        .map_err(|_| ProtocolError::InvalidLockTime)?;
    NaiveTime::from_hms_opt(hour, minute, 0).ok_or(ProtocolError::InvalidLockTime)
}

fn parse_minutes(input: &str, err: ProtocolError) -> Result<u32, ProtocolError> {
    match input.trim().parse::<u32>() {
        Ok(minutes) if minutes > 0 => Ok(minutes),
        _ => Err(err),
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();

        let Some((verb, arg)) = line.split_once(':') else {
            return match line {
                "LOCK" => Ok(Command::Lock),
                "SHUTDOWN" => Ok(Command::Shutdown),
                "CANCEL_SHUTDOWN" => Ok(Command::CancelShutdown),
                "GET_NAME" => Ok(Command::GetName),
                "GET_STATUS" => Ok(Command::GetStatus),
                "HELP" => Ok(Command::Help),
                "METRICS" => Ok(Command::Metrics),
                _ => Err(ProtocolError::UnknownCommand),
            };
        };

        match verb {
            "MESSAGE" => Ok(Command::Message(arg.to_string())),
            "SET_LIMIT" => parse_minutes(arg, ProtocolError::InvalidLimit).map(Command::SetLimit),
            "ADD_LOCK_TIME" => parse_clock(arg).map(Command::AddLockTime),
            "EXTEND_TIME" => {
                parse_minutes(arg, ProtocolError::InvalidExtension).map(Command::ExtendTime)
            }
            _ => Err(ProtocolError::UnknownCommand),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Lock => f.write_str("LOCK"),
            Command::Shutdown => f.write_str("SHUTDOWN"),
            Command::CancelShutdown => f.write_str("CANCEL_SHUTDOWN"),
            Command::GetName => f.write_str("GET_NAME"),
            Command::GetStatus => f.write_str("GET_STATUS"),
            Command::Message(text) => write!(f, "MESSAGE:{}", text),
            Command::SetLimit(minutes) => write!(f, "SET_LIMIT:{}", minutes),
            Command::AddLockTime(at) => {
                write!(f, "ADD_LOCK_TIME:{:02}:{:02}", at.hour(), at.minute())
            }
            Command::ExtendTime(minutes) => write!(f, "EXTEND_TIME:{}", minutes),
            Command::Help => f.write_str("HELP"),
            Command::Metrics => f.write_str("METRICS"),
        }
    }
}
