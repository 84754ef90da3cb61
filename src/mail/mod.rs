//! IMAP push-watch of the inbox.
//!
//! `MailMonitor` owns the lifecycle (state, cancellation, reconnects); the
//! wire protocol sits behind [`MailConnector`] / [`MailSession`] so the loop
//! can be driven without a server.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use mailparse::MailHeaderMap;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::OAuth2Authenticator;
use crate::config::{AccountConfig, MonitorSettings};
use crate::error::MonitorError;
use crate::events::EventSink;
use crate::session::SessionState;

pub mod imap;

pub use imap::ImapConnector;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const LOGOUT_TIMEOUT: Duration = Duration::from_secs(10);

/// Markers servers use when they reject or revoke OAuth credentials.
const AUTH_FAILURE_MARKERS: &[&str] = &[
    "authenticat",
    "accesstokenexpired",
    "session invalidated",
    "invalid credentials",
    "authfailed",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    NewData,
    Timeout,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrivedMessage {
    pub uid: u32,
    pub sender: String,
    pub subject: String,
}

/// One authenticated connection with the inbox open read-only.
#[async_trait]
pub trait MailSession: Send {
    /// Blocks until the server pushes a change, `timeout` elapses, or `cancel` fires.
    async fn wait_for_change(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<IdleOutcome, MonitorError>;

    /// Messages that arrived since the previous call (or since the connection opened).
    async fn fetch_arrivals(&mut self) -> Result<Vec<ArrivedMessage>, MonitorError>;

    async fn logout(&mut self) -> Result<(), MonitorError>;
}

#[async_trait]
pub trait MailConnector: Send + Sync {
    async fn connect(
        &self,
        account: &AccountConfig,
        access_token: &str,
    ) -> Result<Box<dyn MailSession>, MonitorError>;
}

/// True when a server or transport message means the credentials were rejected.
pub fn is_auth_failure(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    AUTH_FAILURE_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

/// Builds an [`ArrivedMessage`] from a raw RFC 5322 header block.
pub fn parse_arrival(uid: u32, raw_headers: &[u8]) -> Result<ArrivedMessage, MonitorError> {
    let (headers, _) = mailparse::parse_headers(raw_headers)
        .map_err(|error| MonitorError::Transport(format!("parse message headers: {error}")))?;
    Ok(ArrivedMessage {
        uid,
        sender: headers.get_first_value("From").unwrap_or_default(),
        subject: headers.get_first_value("Subject").unwrap_or_default(),
    })
}

struct MonitorStatus {
    state: SessionState,
    generation: u64,
    cancel: CancellationToken,
}

/// Claim on one armed pipeline.
///
/// State changes made through a ticket that has been superseded by a later
/// `try_arm` are ignored.
#[derive(Debug, Clone)]
pub struct PipelineTicket {
    generation: u64,
    cancel: CancellationToken,
}

impl PipelineTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

pub struct MailMonitor {
    connector: Arc<dyn MailConnector>,
    authenticator: Arc<OAuth2Authenticator>,
    settings: MonitorSettings,
    status: Mutex<MonitorStatus>,
}

impl MailMonitor {
    pub fn new(
        connector: Arc<dyn MailConnector>,
        authenticator: Arc<OAuth2Authenticator>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            connector,
            authenticator,
            settings,
            status: Mutex::new(MonitorStatus {
                state: SessionState::Stopped,
                generation: 0,
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    pub fn state(&self) -> SessionState {
        self.status().state
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    /// Claims the running flag. Returns `None` if a pipeline is already active.
    pub fn try_arm(&self) -> Option<PipelineTicket> {
        let mut status = self.status();
        if status.state.is_running() {
            return None;
        }
        status.state = SessionState::Authenticating;
        status.generation += 1;
        status.cancel = CancellationToken::new();
        Some(PipelineTicket {
            generation: status.generation,
            cancel: status.cancel.clone(),
        })
    }

    /// Clears the running flag, then interrupts whatever the pipeline is blocked on.
    ///
    /// The session itself is logged out by the watch loop once it observes the
    /// cancellation.
    pub fn stop(&self) {
        let cancel = {
            let mut status = self.status();
            if status.state.is_running() {
                status.state = SessionState::Stopped;
            }
            status.cancel.clone()
        };
        cancel.cancel();
        info!("mail monitor stop requested");
    }

    /// Marks a terminal failure unless the pipeline was stopped or replaced.
    pub fn fail(&self, ticket: &PipelineTicket) {
        self.set_state(ticket, SessionState::Failed);
    }

    pub fn finish(&self, ticket: &PipelineTicket) {
        self.set_state(ticket, SessionState::Stopped);
    }

    /// True while `ticket` is the armed pipeline and nobody stopped it.
    fn is_current(&self, ticket: &PipelineTicket) -> bool {
        let status = self.status();
        status.generation == ticket.generation && status.state.is_running()
    }

    fn set_state(&self, ticket: &PipelineTicket, next: SessionState) {
        let mut status = self.status();
        if status.generation == ticket.generation && status.state.is_running() {
            status.state = next;
        }
    }

    fn status(&self) -> MutexGuard<'_, MonitorStatus> {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Connects with `access_token` and watches the inbox until stopped.
    ///
    /// Returns `Ok(())` after a requested stop and `Err` only for terminal
    /// failures.
    pub async fn run(
        &self,
        access_token: String,
        account: &AccountConfig,
        events: &EventSink,
        ticket: &PipelineTicket,
    ) -> Result<(), MonitorError> {
        self.set_state(ticket, SessionState::Connecting);
        events.log(format!("Connecting to {}...", self.settings.imap_host));

        let mut access_token = access_token;
        let mut session = match self.connector.connect(account, &access_token).await {
            Ok(session) => session,
            Err(error) if error.is_auth_expired() => {
                warn!(email = %account.email, "initial login rejected: {error}");
                let (session, token) = self.recover_auth(account, events, ticket).await?;
                access_token = token;
                session
            }
            Err(error) => return Err(error),
        };
        events.log("Connected successfully!");

        self.set_state(ticket, SessionState::Watching);
        events.log("IDLE mode active. Waiting for emails...");
        info!(email = %account.email, host = %self.settings.imap_host, "watching inbox");

        let result = self
            .watch(&mut session, &mut access_token, account, events, ticket)
            .await;

        match tokio::time::timeout(LOGOUT_TIMEOUT, session.logout()).await {
            Ok(Ok(())) => debug!("IMAP session logged out"),
            Ok(Err(error)) => warn!("IMAP logout failed: {error}"),
            Err(_) => warn!("IMAP logout timed out"),
        }
        result
    }

    async fn watch(
        &self,
        session: &mut Box<dyn MailSession>,
        access_token: &mut String,
        account: &AccountConfig,
        events: &EventSink,
        ticket: &PipelineTicket,
    ) -> Result<(), MonitorError> {
        let cancel = &ticket.cancel;
        let mut backoff = INITIAL_BACKOFF;

        while self.is_current(ticket) && !cancel.is_cancelled() {
            let waited = session
                .wait_for_change(self.settings.idle_timeout, cancel)
                .await;
            if cancel.is_cancelled() || !self.is_current(ticket) {
                break;
            }

            let step = match waited {
                Ok(outcome) => {
                    debug!(?outcome, "IDLE returned");
                    session
                        .fetch_arrivals()
                        .await
                        .map(|arrivals| self.dispatch(&arrivals, events))
                }
                Err(error) => Err(error),
            };

            match step {
                Ok(()) => backoff = INITIAL_BACKOFF,
                Err(error) if error.is_auth_expired() => {
                    warn!(email = %account.email, "IDLE rejected credentials: {error}");
                    events.log("Authentication error - token may have expired");
                    let (fresh, token) = self.recover_auth(account, events, ticket).await?;
                    *session = fresh;
                    *access_token = token;
                    backoff = INITIAL_BACKOFF;
                }
                Err(error) => {
                    warn!("IDLE interrupted: {error}");
                    events.log("IDLE refreshed/interrupted.");
                    self.pause(backoff, cancel).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    if cancel.is_cancelled() {
                        break;
                    }
                    self.reconnect_transient(session, access_token, account, events, ticket)
                        .await?;
                }
            }
        }

        Ok(())
    }

    /// Reconnects after a non-credential failure; a failed attempt is retried on the next pass.
    async fn reconnect_transient(
        &self,
        session: &mut Box<dyn MailSession>,
        access_token: &mut String,
        account: &AccountConfig,
        events: &EventSink,
        ticket: &PipelineTicket,
    ) -> Result<(), MonitorError> {
        self.set_state(ticket, SessionState::Reconnecting);
        let attempt = tokio::select! {
            _ = ticket.cancel.cancelled() => return Ok(()),
            attempt = self.connector.connect(account, access_token.as_str()) => attempt,
        };
        match attempt {
            Ok(fresh) => {
                *session = fresh;
                self.set_state(ticket, SessionState::Watching);
                events.log("Reconnected.");
                Ok(())
            }
            Err(error) if error.is_auth_expired() => {
                warn!(email = %account.email, "reconnect rejected credentials: {error}");
                let (fresh, token) = self.recover_auth(account, events, ticket).await?;
                *session = fresh;
                *access_token = token;
                Ok(())
            }
            Err(error) => {
                warn!("reconnect failed, will retry: {error}");
                Ok(())
            }
        }
    }

    /// The single refresh + reconnect attempt allowed per credential failure.
    ///
    /// A stop while either round trip is in flight abandons the attempt.
    async fn recover_auth(
        &self,
        account: &AccountConfig,
        events: &EventSink,
        ticket: &PipelineTicket,
    ) -> Result<(Box<dyn MailSession>, String), MonitorError> {
        self.set_state(ticket, SessionState::Reconnecting);
        let cancel = &ticket.cancel;
        let token = tokio::select! {
            _ = cancel.cancelled() => return Err(stopped_during_recovery()),
            token = self.authenticator.force_refresh(account, events) => token?,
        };
        let session = tokio::select! {
            _ = cancel.cancelled() => return Err(stopped_during_recovery()),
            session = self.connector.connect(account, &token) => session?,
        };
        self.set_state(ticket, SessionState::Watching);
        events.log("Reconnected with refreshed token.");
        info!(email = %account.email, "recovered from credential expiry");
        Ok((session, token))
    }

    fn dispatch(&self, arrivals: &[ArrivedMessage], events: &EventSink) {
        for message in arrivals {
            if message.subject == self.settings.trigger_subject {
                info!(uid = message.uid, sender = %message.sender, "trigger message arrived");
                events.new_mail(&message.sender, &message.subject);
            } else {
                debug!(uid = message.uid, "ignoring non-matching message");
            }
        }
    }

    async fn pause(&self, delay: Duration, cancel: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = sleep(delay) => {}
        }
    }
}

fn stopped_during_recovery() -> MonitorError {
    MonitorError::Transport("stopped while recovering credentials".to_string())
}

#[cfg(test)]
mod tests {
    use super::{is_auth_failure, parse_arrival};

    #[test]
    fn credential_rejections_are_auth_failures() {
        assert!(is_auth_failure("NO AUTHENTICATE failed."));
        assert!(is_auth_failure(
            "BYE Session invalidated - AccessTokenExpired"
        ));
        assert!(is_auth_failure("Authentication error"));
        assert!(!is_auth_failure("connection reset by peer"));
        assert!(!is_auth_failure("Connection Lost"));
    }

    #[test]
    fn headers_decode_encoded_subjects() {
        let raw = b"From: Alice <alice@example.com>\r\nSubject: =?UTF-8?Q?Teniu_un_VH?=\r\n\r\n";
        let message = parse_arrival(42, raw).expect("parse headers");
        assert_eq!(message.uid, 42);
        assert_eq!(message.subject, "Teniu un VH");
        assert_eq!(message.sender, "Alice <alice@example.com>");
    }

    #[test]
    fn missing_headers_become_empty_strings() {
        let message = parse_arrival(7, b"X-Other: 1\r\n\r\n").expect("parse headers");
        assert!(message.subject.is_empty());
        assert!(message.sender.is_empty());
    }
}
