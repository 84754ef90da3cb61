use std::time::Duration;

use async_imap::extensions::idle::IdleResponse;
use async_imap::Session;
use async_native_tls::TlsStream;
use async_trait::async_trait;
use futures::TryStreamExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{AccountConfig, MonitorSettings};
use crate::error::MonitorError;
use crate::mail::{is_auth_failure, parse_arrival, ArrivedMessage, IdleOutcome, MailConnector, MailSession};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const INBOX: &str = "INBOX";

pub type ImapSession = Session<TlsStream<TcpStream>>;

/// SASL XOAUTH2 initial response.
struct XOAuth2 {
    user: String,
    access_token: String,
    sent: bool,
}

impl async_imap::Authenticator for XOAuth2 {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        // A second challenge carries the server's error JSON and expects an empty reply.
        if self.sent {
            return String::new();
        }
        self.sent = true;
        format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.user, self.access_token
        )
    }
}

fn classify(error: async_imap::error::Error) -> MonitorError {
    let message = error.to_string();
    if is_auth_failure(&message) {
        MonitorError::AuthenticationExpired(message)
    } else {
        MonitorError::Transport(message)
    }
}

/// Moves the UID cursor past `uid`; false when `uid` was already seen.
///
/// `n:*` always matches the newest message, even when it is older than n.
fn advance_cursor(next_uid: &mut u32, uid: u32) -> bool {
    if uid < *next_uid {
        return false;
    }
    *next_uid = (*next_uid).max(uid.saturating_add(1));
    true
}

#[derive(Debug, Clone)]
pub struct ImapConnector {
    host: String,
    port: u16,
}

impl ImapConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn from_settings(settings: &MonitorSettings) -> Self {
        Self::new(settings.imap_host.clone(), settings.imap_port)
    }
}

#[async_trait]
impl MailConnector for ImapConnector {
    async fn connect(
        &self,
        account: &AccountConfig,
        access_token: &str,
    ) -> Result<Box<dyn MailSession>, MonitorError> {
        info!(host = %self.host, port = self.port, "connecting to IMAP server");

        let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((self.host.as_str(), self.port)))
            .await
            .map_err(|_| MonitorError::Transport(format!("connect to {} timed out", self.host)))?
            .map_err(|error| MonitorError::Transport(format!("TCP connection failed: {error}")))?;

        let tls = async_native_tls::TlsConnector::new()
            .connect(self.host.as_str(), tcp)
            .await
            .map_err(|error| MonitorError::Transport(format!("TLS handshake failed: {error}")))?;

        let client = async_imap::Client::new(tls);
        let authenticator = XOAuth2 {
            user: account.email.clone(),
            access_token: access_token.to_string(),
            sent: false,
        };
        let mut session = client
            .authenticate("XOAUTH2", authenticator)
            .await
            .map_err(|(error, _)| classify(error))?;

        let mailbox = session.examine(INBOX).await.map_err(classify)?;
        let next_uid = match mailbox.uid_next {
            Some(uid_next) => uid_next,
            None => session
                .uid_search("ALL")
                .await
                .map_err(classify)?
                .into_iter()
                .max()
                .map_or(1, |uid| uid + 1),
        };
        debug!(exists = mailbox.exists, next_uid, "inbox opened read-only");

        Ok(Box::new(ImapMailSession {
            session: Some(session),
            next_uid,
        }))
    }
}

/// Live session; `None` once an IDLE round trip broke the connection.
pub struct ImapMailSession {
    session: Option<ImapSession>,
    next_uid: u32,
}

impl ImapMailSession {
    fn closed() -> MonitorError {
        MonitorError::Transport("IMAP session is closed".to_string())
    }
}

#[async_trait]
impl MailSession for ImapMailSession {
    async fn wait_for_change(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<IdleOutcome, MonitorError> {
        let session = self.session.take().ok_or_else(Self::closed)?;
        let mut handle = session.idle();
        handle.init().await.map_err(classify)?;

        let (idle_wait, interrupt) = handle.wait_with_timeout(timeout);
        let watcher = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                drop(interrupt);
            })
        };
        let response = idle_wait.await;
        watcher.abort();
        let response = response.map_err(classify)?;

        self.session = Some(handle.done().await.map_err(classify)?);

        Ok(match response {
            IdleResponse::NewData(_) => IdleOutcome::NewData,
            IdleResponse::Timeout => IdleOutcome::Timeout,
            IdleResponse::ManualInterrupt => IdleOutcome::Interrupted,
        })
    }

    async fn fetch_arrivals(&mut self) -> Result<Vec<ArrivedMessage>, MonitorError> {
        let session = self.session.as_mut().ok_or_else(Self::closed)?;
        let range = format!("{}:*", self.next_uid);
        let fetches: Vec<_> = session
            .uid_fetch(&range, "(UID RFC822.HEADER)")
            .await
            .map_err(classify)?
            .try_collect()
            .await
            .map_err(classify)?;

        let mut arrivals = Vec::new();
        for fetch in &fetches {
            let Some(uid) = fetch.uid else {
                continue;
            };
            if !advance_cursor(&mut self.next_uid, uid) {
                continue;
            }
            if let Some(header) = fetch.header() {
                arrivals.push(parse_arrival(uid, header)?);
            }
        }
        Ok(arrivals)
    }

    async fn logout(&mut self) -> Result<(), MonitorError> {
        match self.session.take() {
            Some(mut session) => session.logout().await.map_err(classify),
            None => Ok(()),
        }
    }
}
