use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::error::MonitorError;

/// Notifications delivered to whoever drives the session (CLI, UI).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Log(String),
    AuthRequired {
        verification_url: String,
        user_code: String,
    },
    NewMail {
        sender: String,
        subject: String,
    },
    Error(MonitorError),
}

/// Sending half of the event channel.
///
/// Sends never fail from the caller's point of view: once the receiver is
/// gone the events are dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: UnboundedSender<SessionEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn log(&self, message: impl Into<String>) {
        self.emit(SessionEvent::Log(message.into()));
    }

    pub fn auth_required(&self, verification_url: &str, user_code: &str) {
        self.emit(SessionEvent::AuthRequired {
            verification_url: verification_url.to_string(),
            user_code: user_code.to_string(),
        });
    }

    pub fn new_mail(&self, sender: &str, subject: &str) {
        self.emit(SessionEvent::NewMail {
            sender: sender.to_string(),
            subject: subject.to_string(),
        });
    }

    pub fn error(&self, error: MonitorError) {
        self.emit(SessionEvent::Error(error));
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }
}
