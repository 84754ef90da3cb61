use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::error::MonitorError;

pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";
pub const DEFAULT_IMAP_HOST: &str = "outlook.office365.com";
pub const DEFAULT_IMAP_PORT: u16 = 993;
pub const DEFAULT_TRIGGER_SUBJECT: &str = "Teniu un VH";
/// Servers drop IDLE after 29 minutes; re-issue well before that.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(20 * 60);

const CONFIG_FILE_NAME: &str = "Config.properties";

const KEY_CLIENT_ID: &str = "client.id";
const KEY_TENANT_ID: &str = "tenant.id";
const KEY_EMAIL: &str = "app.email";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Config(String),
}

/// Identity a cached token is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccountKey {
    pub client_id: String,
    pub tenant_id: String,
    pub email: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountConfig {
    pub client_id: String,
    pub tenant_id: String,
    pub email: String,
    /// Extra `value.N` entries carried through for the UI; unused by the core.
    pub extensions: BTreeMap<String, String>,
}

impl AccountConfig {
    pub fn new(
        client_id: impl Into<String>,
        tenant_id: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            tenant_id: tenant_id.into(),
            email: email.into(),
            extensions: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> AccountKey {
        AccountKey {
            client_id: self.client_id.clone(),
            tenant_id: self.tenant_id.clone(),
            email: self.email.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), MonitorError> {
        let missing: Vec<&'static str> = [
            ("client id", self.client_id.as_str()),
            ("tenant id", self.tenant_id.as_str()),
            ("email", self.email.as_str()),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(MonitorError::ConfigurationInvalid { missing })
        }
    }

    /// Applies `MAILWATCH_*` environment overrides on top of file values.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(value) = env_string("MAILWATCH_CLIENT_ID") {
            self.client_id = value;
        }
        if let Some(value) = env_string("MAILWATCH_TENANT_ID") {
            self.tenant_id = value;
        }
        if let Some(value) = env_string("MAILWATCH_EMAIL") {
            self.email = value;
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSettings {
    pub authority: String,
    pub imap_host: String,
    pub imap_port: u16,
    pub trigger_subject: String,
    pub idle_timeout: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            authority: DEFAULT_AUTHORITY.to_string(),
            imap_host: DEFAULT_IMAP_HOST.to_string(),
            imap_port: DEFAULT_IMAP_PORT,
            trigger_subject: DEFAULT_TRIGGER_SUBJECT.to_string(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl MonitorSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            authority: env_string("MAILWATCH_AUTHORITY").unwrap_or(defaults.authority),
            imap_host: env_string("MAILWATCH_IMAP_HOST").unwrap_or(defaults.imap_host),
            imap_port: defaults.imap_port,
            trigger_subject: env_string("MAILWATCH_TRIGGER_SUBJECT")
                .unwrap_or(defaults.trigger_subject),
            idle_timeout: defaults.idle_timeout,
        }
    }
}

/// Flat `key=value` properties file holding the account settings.
#[derive(Debug, Clone, Default)]
pub struct ConfigFile {
    entries: BTreeMap<String, String>,
}

impl ConfigFile {
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir()
            .ok_or_else(|| ConfigError::Config("failed to determine home directory".to_string()))?;
        Ok(home.join(".mailwatch").join(CONFIG_FILE_NAME))
    }

    /// A missing file yields an empty config; validation reports what is absent.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Ok(Self::parse(&raw)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(error) => Err(error.into()),
        }
    }

    pub fn parse(raw: &str) -> Self {
        let entries = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('!'))
            .filter_map(|line| {
                let split_at = line.find(['=', ':'])?;
                let (key, value) = line.split_at(split_at);
                Some((key.trim().to_string(), value[1..].trim().to_string()))
            })
            .collect();
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.entries.insert(key.to_string(), value.to_string());
    }

    pub fn account(&self) -> AccountConfig {
        let extensions = self
            .entries
            .iter()
            .filter(|(key, value)| key.starts_with("value.") && !value.is_empty())
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        AccountConfig {
            client_id: self.get(KEY_CLIENT_ID).unwrap_or_default().to_string(),
            tenant_id: self.get(KEY_TENANT_ID).unwrap_or_default().to_string(),
            email: self.get(KEY_EMAIL).unwrap_or_default().to_string(),
            extensions,
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = String::from("# mailwatch configuration\n");
        for (key, value) in &self.entries {
            out.push_str(&format!("{key}={value}\n"));
        }
        std::fs::write(path, out)?;
        Ok(())
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
