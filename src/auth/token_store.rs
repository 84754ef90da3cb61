use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::auth::cipher::TokenCipher;
use crate::config::{AccountConfig, AccountKey};
use crate::error::MonitorError;

const TOKEN_FILE_NAME: &str = "oauth_token.json";

/// Tokens this close to expiry are refreshed instead of handed out.
pub const EXPIRY_BUFFER_SECONDS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub expires_at: DateTime<Utc>,
    pub client_id: String,
    pub tenant_id: String,
    pub email: String,
}

impl TokenRecord {
    pub fn new(
        account: &AccountConfig,
        access_token: String,
        refresh_token: String,
        expires_in_seconds: i64,
    ) -> Result<Self, MonitorError> {
        Ok(Self {
            access_token,
            refresh_token,
            expires_at: expiry_after(expires_in_seconds)?,
            client_id: account.client_id.clone(),
            tenant_id: account.tenant_id.clone(),
            email: account.email.clone(),
        })
    }

    pub fn key(&self) -> AccountKey {
        AccountKey {
            client_id: self.client_id.clone(),
            tenant_id: self.tenant_id.clone(),
            email: self.email.clone(),
        }
    }

    /// True while the access token outlives the expiry buffer.
    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(Utc::now())
    }

    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now + Duration::seconds(EXPIRY_BUFFER_SECONDS)
    }

    pub fn has_refresh_token(&self) -> bool {
        !self.refresh_token.trim().is_empty()
    }
}

/// Absolute expiry for a lifetime reported by the identity server.
pub fn expiry_after(expires_in_seconds: i64) -> Result<DateTime<Utc>, MonitorError> {
    Duration::try_seconds(expires_in_seconds)
        .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
        .ok_or_else(|| {
            MonitorError::AuthenticationFailed(format!(
                "token lifetime out of range: {expires_in_seconds}s"
            ))
        })
}

/// Single-record token cache on disk.
///
/// Writers are serialized within the process only; two processes sharing the
/// same file can still race each other.
pub struct TokenStore {
    path: PathBuf,
    cipher: Option<TokenCipher>,
    write_lock: Mutex<()>,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cipher: None,
            write_lock: Mutex::new(()),
        }
    }

    /// Store at `path`, sealing records when `MAILWATCH_TOKEN_CACHE_KEY` is set.
    pub fn from_env(path: impl Into<PathBuf>) -> Result<Self, MonitorError> {
        let cipher = TokenCipher::from_env()?;
        Ok(Self::new(path).with_cipher(cipher))
    }

    pub fn with_cipher(mut self, cipher: Option<TokenCipher>) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn default_path() -> Result<PathBuf, MonitorError> {
        let home = dirs::home_dir().ok_or_else(|| {
            MonitorError::CacheCorrupt("failed to determine home directory".to_string())
        })?;
        Ok(home.join(".mailwatch").join(TOKEN_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Returns the cached record for `key`, or `None`.
    ///
    /// Unreadable, undecodable or foreign records are deleted on the way out.
    pub fn load(&self, key: &AccountKey) -> Option<TokenRecord> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no cached token");
                return None;
            }
            Err(error) => {
                self.discard(&MonitorError::CacheCorrupt(error.to_string()));
                return None;
            }
        };

        let record = match self.decode(&raw) {
            Ok(record) => record,
            Err(error) => {
                self.discard(&error);
                return None;
            }
        };

        if &record.key() != key {
            self.discard(&MonitorError::CacheCorrupt(
                "cached token belongs to a different account".to_string(),
            ));
            return None;
        }

        Some(record)
    }

    pub fn save(&self, record: &TokenRecord) -> Result<(), MonitorError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| MonitorError::CacheCorrupt("token store lock poisoned".to_string()))?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(cache_io)?;
        }

        let payload = self.encode(record)?;
        let staging = self.path.with_extension("json.tmp");
        std::fs::write(&staging, payload).map_err(cache_io)?;
        std::fs::rename(&staging, &self.path).map_err(cache_io)?;
        debug!(path = %self.path.display(), expires_at = %record.expires_at, "token cached");
        Ok(())
    }

    pub fn clear(&self) -> Result<(), MonitorError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(cache_io(error)),
        }
    }

    fn encode(&self, record: &TokenRecord) -> Result<String, MonitorError> {
        let plain = serde_json::to_string_pretty(record)
            .map_err(|error| MonitorError::CacheCorrupt(error.to_string()))?;
        match &self.cipher {
            Some(cipher) => cipher.seal(plain.as_bytes()),
            None => Ok(plain),
        }
    }

    fn decode(&self, raw: &str) -> Result<TokenRecord, MonitorError> {
        let plain = match &self.cipher {
            Some(cipher) => cipher.open(raw)?,
            None => raw.as_bytes().to_vec(),
        };
        serde_json::from_slice(&plain).map_err(|error| MonitorError::CacheCorrupt(error.to_string()))
    }

    fn discard(&self, reason: &MonitorError) {
        warn!(path = %self.path.display(), "discarding token cache: {reason}");
        if let Err(error) = self.clear() {
            warn!("failed to delete token cache: {error}");
        }
    }
}

fn cache_io(error: std::io::Error) -> MonitorError {
    MonitorError::CacheCorrupt(error.to_string())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use super::{TokenRecord, TokenStore};
    use crate::auth::cipher::TokenCipher;
    use crate::config::AccountConfig;
    use crate::error::MonitorError;

    const TEST_KEY_HEX: &str = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";

    fn temp_token_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("mailwatch-token-test-{}", Uuid::new_v4()))
            .join("oauth_token.json")
    }

    fn account() -> AccountConfig {
        AccountConfig::new("client-a", "tenant-a", "owner@example.com")
    }

    fn record(expires_in: i64) -> TokenRecord {
        TokenRecord::new(
            &account(),
            "access-a".to_string(),
            "refresh-a".to_string(),
            expires_in,
        )
        .expect("token record")
    }

    #[test]
    fn out_of_range_lifetime_is_rejected() {
        let error = TokenRecord::new(
            &account(),
            "access-a".to_string(),
            String::new(),
            i64::MAX,
        )
        .expect_err("lifetime overflows");
        assert!(matches!(error, MonitorError::AuthenticationFailed(ref msg) if msg.contains("out of range")));
    }

    #[test]
    fn save_then_load_returns_matching_record() {
        let store = TokenStore::new(temp_token_path());
        let token = record(3600);
        store.save(&token).expect("save token");

        let loaded = store.load(&account().key()).expect("token exists");
        assert_eq!(loaded.access_token, "access-a");
        assert_eq!(loaded.refresh_token, "refresh-a");
        assert_eq!(loaded.expires_at.timestamp(), token.expires_at.timestamp());
        let _ = std::fs::remove_dir_all(store.path().parent().expect("parent"));
    }

    #[test]
    fn persisted_file_uses_camel_case_epoch_seconds() {
        let store = TokenStore::new(temp_token_path());
        let token = record(3600);
        store.save(&token).expect("save token");

        let raw = std::fs::read_to_string(store.path()).expect("read token file");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("parse token file");
        assert_eq!(value["accessToken"], "access-a");
        assert_eq!(value["expiresAt"], token.expires_at.timestamp());
        assert_eq!(value["tenantId"], "tenant-a");
        let _ = std::fs::remove_dir_all(store.path().parent().expect("parent"));
    }

    #[test]
    fn malformed_json_is_treated_as_absent_and_deleted() {
        let store = TokenStore::new(temp_token_path());
        let parent = store.path().parent().expect("parent").to_path_buf();
        std::fs::create_dir_all(&parent).expect("create dir");
        std::fs::write(store.path(), "{ not json").expect("write garbage");

        assert!(store.load(&account().key()).is_none());
        assert!(!store.path().exists());
        let _ = std::fs::remove_dir_all(parent);
    }

    #[test]
    fn record_for_another_account_is_discarded() {
        let store = TokenStore::new(temp_token_path());
        store.save(&record(3600)).expect("save token");

        let other = AccountConfig::new("client-b", "tenant-a", "owner@example.com");
        assert!(store.load(&other.key()).is_none());
        assert!(!store.path().exists());
        let _ = std::fs::remove_dir_all(store.path().parent().expect("parent"));
    }

    #[test]
    fn clear_is_idempotent() {
        let store = TokenStore::new(temp_token_path());
        store.save(&record(3600)).expect("save token");
        store.clear().expect("first clear");
        store.clear().expect("second clear");
        assert!(!store.path().exists());
        let _ = std::fs::remove_dir_all(store.path().parent().expect("parent"));
    }

    #[test]
    fn freshness_honours_five_minute_buffer() {
        let now = Utc::now();
        let mut token = record(0);
        token.expires_at = now + Duration::minutes(6);
        assert!(token.is_fresh_at(now));
        token.expires_at = now + Duration::minutes(5);
        assert!(!token.is_fresh_at(now));
        token.expires_at = now - Duration::minutes(1);
        assert!(!token.is_fresh_at(now));
    }

    #[test]
    fn sealed_cache_does_not_contain_plaintext_token() {
        let cipher = TokenCipher::from_hex(TEST_KEY_HEX).expect("cipher");
        let store = TokenStore::new(temp_token_path()).with_cipher(Some(cipher));
        store.save(&record(3600)).expect("save sealed token");

        let raw = std::fs::read_to_string(store.path()).expect("read token file");
        assert!(!raw.contains("access-a"));

        let loaded = store.load(&account().key()).expect("token exists");
        assert_eq!(loaded.access_token, "access-a");
        let _ = std::fs::remove_dir_all(store.path().parent().expect("parent"));
    }

    #[test]
    fn plaintext_cache_is_unreadable_once_encryption_is_enabled() {
        let path = temp_token_path();
        TokenStore::new(&path)
            .save(&record(3600))
            .expect("save plaintext token");

        let cipher = TokenCipher::from_hex(TEST_KEY_HEX).expect("cipher");
        let sealed = TokenStore::new(&path).with_cipher(Some(cipher));
        assert!(sealed.load(&account().key()).is_none());
        assert!(!path.exists());
        let _ = std::fs::remove_dir_all(path.parent().expect("parent"));
    }
}
