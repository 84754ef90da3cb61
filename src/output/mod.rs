pub mod json;
pub mod table;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::auth::TokenRecord;
use crate::events::SessionEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Table
        }
    }
}

/// What `status` reports about the token cache.
#[derive(Debug, Clone, Serialize)]
pub struct TokenStatus {
    pub cache_path: String,
    pub encrypted: bool,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub fresh: bool,
    pub has_refresh_token: bool,
}

impl TokenStatus {
    pub fn new(cache_path: String, encrypted: bool, record: Option<&TokenRecord>) -> Self {
        Self {
            cache_path,
            encrypted,
            cached: record.is_some(),
            email: record.map(|r| r.email.clone()),
            expires_at: record.map(|r| r.expires_at),
            fresh: record.is_some_and(TokenRecord::is_fresh),
            has_refresh_token: record.is_some_and(TokenRecord::has_refresh_token),
        }
    }
}

/// Serializable view of a [`SessionEvent`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventLine {
    Log { message: String },
    AuthRequired { verification_url: String, user_code: String },
    NewMail { sender: String, subject: String },
    Error { message: String },
}

impl From<&SessionEvent> for EventLine {
    fn from(event: &SessionEvent) -> Self {
        match event {
            SessionEvent::Log(message) => Self::Log {
                message: message.clone(),
            },
            SessionEvent::AuthRequired {
                verification_url,
                user_code,
            } => Self::AuthRequired {
                verification_url: verification_url.clone(),
                user_code: user_code.clone(),
            },
            SessionEvent::NewMail { sender, subject } => Self::NewMail {
                sender: sender.clone(),
                subject: subject.clone(),
            },
            SessionEvent::Error(error) => Self::Error {
                message: error.to_string(),
            },
        }
    }
}

pub fn format_status(format: OutputFormat, status: &TokenStatus) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_status(status)),
        OutputFormat::Json => json::format_status(status),
    }
}

pub fn format_event(format: OutputFormat, event: &SessionEvent) -> Result<String> {
    let line = EventLine::from(event);
    match format {
        OutputFormat::Table => Ok(table::format_event(&line)),
        OutputFormat::Json => json::format_event(&line),
    }
}
