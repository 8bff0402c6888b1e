use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Number of distinct reports that moves a message to `reported`.
pub const REPORT_THRESHOLD: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Visible,
    Hidden,
    Reported,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Visible => "visible",
            MessageStatus::Hidden => "hidden",
            MessageStatus::Reported => "reported",
        }
    }
}

impl FromStr for MessageStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "visible" => Ok(MessageStatus::Visible),
            "hidden" => Ok(MessageStatus::Hidden),
            "reported" => Ok(MessageStatus::Reported),
            other => Err(AppError::WriteFailed(format!("unknown message status {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportReason {
    Spam,
    Harassment,
    Inappropriate,
    Other,
}

impl ReportReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ReportReason::Spam => "spam",
            ReportReason::Harassment => "harassment",
            ReportReason::Inappropriate => "inappropriate",
            ReportReason::Other => "other",
        }
    }
}

impl FromStr for ReportReason {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spam" => Ok(ReportReason::Spam),
            "harassment" => Ok(ReportReason::Harassment),
            "inappropriate" => Ok(ReportReason::Inappropriate),
            "other" => Ok(ReportReason::Other),
            other => Err(AppError::WriteFailed(format!("unknown report reason {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub reporter_id: String,
    pub reason: ReportReason,
    pub description: Option<String>,
    pub reported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message_id: String,
    pub event_id: String,
    pub author_id: String,
    pub author_name: String,
    pub content: String,
    pub status: MessageStatus,
    /// Whether the author organised the event when the message was written.
    pub is_organizer: bool,
    #[serde(default)]
    pub reports: Vec<Report>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModerationAction {
    Hide,
    Show,
}

impl ModerationAction {
    pub fn target_status(self) -> MessageStatus {
        match self {
            ModerationAction::Hide => MessageStatus::Hidden,
            ModerationAction::Show => MessageStatus::Visible,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    Added(ChatMessage),
    Duplicate,
}
