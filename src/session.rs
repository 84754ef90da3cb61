use std::any::Any;
use std::fmt::{Display, Formatter};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::auth::OAuth2Authenticator;
use crate::config::AccountConfig;
use crate::error::MonitorError;
use crate::events::EventSink;
use crate::mail::MailMonitor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Stopped,
    Authenticating,
    Connecting,
    Watching,
    Reconnecting,
    Failed,
}

impl SessionState {
    pub fn is_running(self) -> bool {
        matches!(
            self,
            Self::Authenticating | Self::Connecting | Self::Watching | Self::Reconnecting
        )
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Stopped => "stopped",
            Self::Authenticating => "authenticating",
            Self::Connecting => "connecting",
            Self::Watching => "watching",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Runs authentication followed by the inbox watch on one background task.
pub struct MonitoringSession {
    account: AccountConfig,
    authenticator: Arc<OAuth2Authenticator>,
    monitor: Arc<MailMonitor>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MonitoringSession {
    pub fn new(
        account: AccountConfig,
        authenticator: Arc<OAuth2Authenticator>,
        monitor: Arc<MailMonitor>,
    ) -> Self {
        Self {
            account,
            authenticator,
            monitor,
            task: Mutex::new(None),
        }
    }

    /// Starts the pipeline without blocking. Must be called inside a tokio runtime.
    pub fn start(&self, events: EventSink) {
        if self.monitor.is_running() {
            events.log("Service is already running.");
            return;
        }

        if let Err(error) = self.account.validate() {
            events.error(error);
            return;
        }

        let Some(ticket) = self.monitor.try_arm() else {
            events.log("Service is already running.");
            return;
        };
        events.log(format!(
            "Starting background service for {}...",
            self.account.email
        ));

        let account = self.account.clone();
        let authenticator = self.authenticator.clone();
        let monitor = self.monitor.clone();
        let handle = tokio::spawn(async move {
            let cancel = ticket.cancel_token();
            let pipeline = AssertUnwindSafe(async {
                let token = authenticator
                    .get_access_token(&account, &events, cancel)
                    .await?;
                monitor.run(token, &account, &events, &ticket).await
            })
            .catch_unwind()
            .await;

            let result = pipeline.unwrap_or_else(|panic| {
                Err(MonitorError::Transport(format!(
                    "monitoring task panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });

            match result {
                Ok(()) => {
                    monitor.finish(&ticket);
                    events.log("Monitoring stopped.");
                }
                Err(error) if cancel.is_cancelled() => {
                    monitor.finish(&ticket);
                    info!(generation = ticket.generation(), "pipeline ended after stop: {error}");
                    events.log("Monitoring stopped.");
                }
                Err(error) => {
                    monitor.fail(&ticket);
                    error!(email = %account.email, "monitoring failed: {error}");
                    events.error(error);
                }
            }
        });

        *self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
    }

    pub fn stop(&self) {
        if !self.monitor.is_running() {
            return;
        }
        self.monitor.stop();
    }

    pub fn is_running(&self) -> bool {
        self.monitor.is_running()
    }

    pub fn state(&self) -> SessionState {
        self.monitor.state()
    }

    /// Waits for the background task of the last `start()` to finish.
    pub async fn wait(&self) {
        let handle = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(join_error) = handle.await {
                error!("monitoring task panicked: {join_error}");
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
