//! Wire format of the relay WebSocket.
//!
//! Client frames are classified through a closed [`MessageKind`] table and
//! forwarded verbatim; the relay never looks at payload fields other than
//! `type` and `id`. Frames the relay itself originates are typed
//! [`ServerMessage`] values.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod error_codes {
    pub const DESKTOP_OFFLINE: &str = "DESKTOP_OFFLINE";
    pub const DESKTOP_BUSY: &str = "DESKTOP_BUSY";
    pub const INVALID_MESSAGE: &str = "INVALID_MESSAGE";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
}

/// Direction class of a message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageFamily {
    /// mobile -> desktop, correlated by `id`
    Command,
    /// mobile -> desktop, fire-and-forget
    Directive,
    /// desktop -> mobile, correlated by `id`
    Response,
    /// desktop -> mobile, fire-and-forget
    Event,
    /// relay-originated only
    Control,
}

impl MessageFamily {
    pub fn is_correlated(self) -> bool {
        matches!(self, MessageFamily::Command | MessageFamily::Response)
    }
}

macro_rules! message_kinds {
    ($($variant:ident => $tag:literal, $family:ident;)+) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum MessageKind {
            $($variant,)+
        }

        impl MessageKind {
            pub const ALL: &'static [MessageKind] = &[$(MessageKind::$variant,)+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $(MessageKind::$variant => $tag,)+
                }
            }

            pub fn family(self) -> MessageFamily {
                match self {
                    $(MessageKind::$variant => MessageFamily::$family,)+
                }
            }
        }

        impl FromStr for MessageKind {
            type Err = EnvelopeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($tag => Ok(MessageKind::$variant),)+
                    other => Err(EnvelopeError::UnknownType(other.to_string())),
                }
            }
        }
    };
}

message_kinds! {
    ListJobs => "list_jobs", Command;
    RunJob => "run_job", Command;
    PauseJob => "pause_job", Command;
    ResumeJob => "resume_job", Command;
    StopJob => "stop_job", Command;
    SendInput => "send_input", Command;
    SubscribeLogs => "subscribe_logs", Command;
    GetRunHistory => "get_run_history", Command;
    RunAgent => "run_agent", Command;
    CreateJob => "create_job", Command;
    DetectProcesses => "detect_processes", Command;
    GetRunDetail => "get_run_detail", Command;
    GetDetectedProcessLogs => "get_detected_process_logs", Command;
    SendDetectedProcessInput => "send_detected_process_input", Command;
    StopDetectedProcess => "stop_detected_process", Command;
    AnswerQuestion => "answer_question", Command;
    SetAutoYesPanes => "set_auto_yes_panes", Command;

    UnsubscribeLogs => "unsubscribe_logs", Directive;

    JobsList => "jobs_list", Response;
    RunJobAck => "run_job_ack", Response;
    PauseJobAck => "pause_job_ack", Response;
    ResumeJobAck => "resume_job_ack", Response;
    StopJobAck => "stop_job_ack", Response;
    SendInputAck => "send_input_ack", Response;
    SubscribeLogsAck => "subscribe_logs_ack", Response;
    RunHistory => "run_history", Response;
    RunAgentAck => "run_agent_ack", Response;
    CreateJobAck => "create_job_ack", Response;
    DetectedProcesses => "detected_processes", Response;
    RunDetailResponse => "run_detail_response", Response;
    DetectedProcessLogs => "detected_process_logs", Response;
    SendDetectedProcessInputAck => "send_detected_process_input_ack", Response;
    StopDetectedProcessAck => "stop_detected_process_ack", Response;

    StatusUpdate => "status_update", Event;
    LogChunk => "log_chunk", Event;
    JobsChanged => "jobs_changed", Event;
    JobNotification => "job_notification", Event;
    ClaudeQuestions => "claude_questions", Event;

    Welcome => "welcome", Control;
    Error => "error", Control;
    DesktopStatus => "desktop_status", Control;
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("malformed JSON: {0}")]
    Malformed(String),
    #[error("frame must be a JSON object")]
    NotAnObject,
    #[error("missing string field `type`")]
    MissingType,
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("`{0}` requires a string `id`")]
    MissingId(MessageKind),
    #[error("binary frames are not supported")]
    Binary,
}

impl EnvelopeError {
    /// Every decoding failure is reported to the sender the same way.
    pub fn code(&self) -> &'static str {
        error_codes::INVALID_MESSAGE
    }
}

/// A classified inbound frame. `raw` is the exact text received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: MessageKind,
    pub id: Option<String>,
    pub raw: String,
}

impl Envelope {
    pub fn decode(text: &str) -> Result<Self, EnvelopeError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        let object = value.as_object().ok_or(EnvelopeError::NotAnObject)?;

        let kind: MessageKind = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or(EnvelopeError::MissingType)?
            .parse()?;

        let id = object.get("id").and_then(Value::as_str).map(str::to_string);
        if kind.family().is_correlated() && id.is_none() {
            return Err(EnvelopeError::MissingId(kind));
        }

        Ok(Envelope {
            kind,
            id,
            raw: text.to_string(),
        })
    }

    pub fn family(&self) -> MessageFamily {
        self.kind.family()
    }

    /// Best-effort `id` of a frame that failed to decode, for echoing in errors.
    pub fn peek_id(text: &str) -> Option<String> {
        serde_json::from_str::<Value>(text)
            .ok()?
            .get("id")?
            .as_str()
            .map(str::to_string)
    }
}

/// Frames originated by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        connection_id: String,
        server_version: String,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        code: String,
        message: String,
    },
    DesktopStatus {
        online: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_id: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_name: Option<String>,
    },
}

impl ServerMessage {
    pub fn welcome(connection_id: impl fmt::Display) -> Self {
        ServerMessage::Welcome {
            connection_id: connection_id.to_string(),
            server_version: SERVER_VERSION.to_string(),
        }
    }

    pub fn error(code: &str, message: impl Into<String>, id: Option<String>) -> Self {
        ServerMessage::Error {
            id,
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn invalid(err: &EnvelopeError, id: Option<String>) -> Self {
        Self::error(err.code(), err.to_string(), id)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
