pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod mail;
pub mod output;
pub mod session;

pub use auth::{OAuth2Authenticator, TokenRecord, TokenStore};
pub use config::{AccountConfig, MonitorSettings};
pub use error::MonitorError;
pub use events::{EventSink, SessionEvent};
pub use mail::MailMonitor;
pub use session::{MonitoringSession, SessionState};
