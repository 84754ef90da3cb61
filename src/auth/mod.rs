//! Microsoft identity OAuth2: cached tokens, refresh grant, device-code grant.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AccountConfig;
use crate::error::MonitorError;
use crate::events::EventSink;

pub mod cipher;
pub mod token_store;

pub use token_store::{TokenRecord, TokenStore};

use token_store::expiry_after;

pub const IMAP_SCOPE: &str = "https://outlook.office.com/IMAP.AccessAsUser.All offline_access";
const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 5;
const SLOW_DOWN_STEP: Duration = Duration::from_secs(5);
const REDACTED_BODY_MAX_LEN: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

/// Form POST against the identity endpoints.
#[async_trait]
pub trait OAuthHttp: Send + Sync {
    async fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<HttpReply, MonitorError>;
}

#[derive(Debug, Clone, Default)]
pub struct ReqwestHttp {
    client: Client,
}

impl ReqwestHttp {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

#[async_trait]
impl OAuthHttp for ReqwestHttp {
    async fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<HttpReply, MonitorError> {
        let response = self
            .client
            .post(url)
            .header("accept", "application/json")
            .form(form)
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(HttpReply { status, body })
    }
}

/// Transient state of an in-progress device-code sign in.
#[derive(Debug, Clone)]
pub struct DeviceCodeChallenge {
    pub device_code: String,
    pub user_code: String,
    pub verification_url: String,
    pub poll_interval: Duration,
    pub expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    #[serde(default = "default_poll_interval")]
    interval: u64,
    expires_in: u64,
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECONDS
}

#[derive(Debug, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
}

#[derive(Debug, Default, Deserialize)]
struct OAuthErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

pub struct OAuth2Authenticator {
    store: Arc<TokenStore>,
    http: Arc<dyn OAuthHttp>,
    authority: String,
}

impl OAuth2Authenticator {
    pub fn new(store: Arc<TokenStore>, http: Arc<dyn OAuthHttp>, authority: impl Into<String>) -> Self {
        Self {
            store,
            http,
            authority: authority.into(),
        }
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    /// Returns a usable access token, going interactive only as a last resort.
    pub async fn get_access_token(
        &self,
        account: &AccountConfig,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<String, MonitorError> {
        if let Some(cached) = self.store.load(&account.key()) {
            if cached.is_fresh() {
                events.log("Using cached access token");
                return Ok(cached.access_token);
            }

            if cached.has_refresh_token() {
                events.log("Access token expired, refreshing...");
                match self.refresh(&cached).await {
                    Ok(refreshed) => {
                        events.log("Token refreshed successfully");
                        return Ok(refreshed.access_token);
                    }
                    Err(error) => {
                        warn!(email = %account.email, "token refresh failed: {error}");
                        events.log("Refresh failed, need new authentication");
                    }
                }
            }
        }

        events.log("Starting device code flow...");
        let record = self.device_code_flow(account, events, cancel).await?;
        events.log("Authentication successful");
        Ok(record.access_token)
    }

    /// Refreshes regardless of remaining lifetime; never starts a device-code flow.
    pub async fn force_refresh(
        &self,
        account: &AccountConfig,
        events: &EventSink,
    ) -> Result<String, MonitorError> {
        let cached = self
            .store
            .load(&account.key())
            .filter(TokenRecord::has_refresh_token)
            .ok_or_else(|| {
                MonitorError::AuthenticationFailed("no refresh token available".to_string())
            })?;

        events.log("Refreshing access token...");
        let refreshed = self.refresh(&cached).await?;
        events.log("Token refreshed successfully");
        Ok(refreshed.access_token)
    }

    pub fn cached_record(&self, account: &AccountConfig) -> Option<TokenRecord> {
        self.store.load(&account.key())
    }

    pub fn clear_cache(&self) -> Result<(), MonitorError> {
        self.store.clear()
    }

    fn endpoint(&self, tenant_id: &str, leaf: &str) -> String {
        format!(
            "{}/{}/oauth2/v2.0/{}",
            self.authority.trim_end_matches('/'),
            tenant_id,
            leaf
        )
    }

    /// A rejected refresh deletes the cached record; a transport failure keeps it.
    async fn refresh(&self, cached: &TokenRecord) -> Result<TokenRecord, MonitorError> {
        let token_url = self.endpoint(&cached.tenant_id, "token");
        let reply = self
            .http
            .post_form(
                &token_url,
                &[
                    ("client_id", cached.client_id.as_str()),
                    ("grant_type", "refresh_token"),
                    ("refresh_token", cached.refresh_token.as_str()),
                    ("scope", IMAP_SCOPE),
                ],
            )
            .await?;

        if !reply.is_ok() {
            self.store.clear()?;
            return Err(MonitorError::AuthenticationFailed(format!(
                "refresh rejected: status={} body={}",
                reply.status,
                redact_response_body(&reply.body)
            )));
        }

        let payload = decode_token_response(&reply.body)?;
        let refresh_token = payload
            .refresh_token
            .filter(|token| !token.trim().is_empty())
            .unwrap_or_else(|| cached.refresh_token.clone());
        let mut record = cached.clone();
        record.access_token = payload.access_token;
        record.refresh_token = refresh_token;
        record.expires_at = expiry_after(payload.expires_in)?;

        self.store.save(&record)?;
        info!(email = %record.email, expires_at = %record.expires_at, "access token refreshed");
        Ok(record)
    }

    async fn device_code_flow(
        &self,
        account: &AccountConfig,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<TokenRecord, MonitorError> {
        let challenge = self.request_device_code(account).await?;
        events.auth_required(&challenge.verification_url, &challenge.user_code);

        let record = self.poll_for_token(account, &challenge, events, cancel).await?;
        self.store.save(&record)?;
        info!(email = %account.email, expires_at = %record.expires_at, "device code sign in complete");
        Ok(record)
    }

    pub async fn request_device_code(
        &self,
        account: &AccountConfig,
    ) -> Result<DeviceCodeChallenge, MonitorError> {
        let url = self.endpoint(&account.tenant_id, "devicecode");
        let reply = self
            .http
            .post_form(
                &url,
                &[("client_id", account.client_id.as_str()), ("scope", IMAP_SCOPE)],
            )
            .await?;

        if !reply.is_ok() {
            let error = decode_error_response(&reply.body);
            return Err(MonitorError::AuthenticationFailed(format!(
                "device code request rejected: status={} error={} {}",
                reply.status,
                error.error,
                error.error_description.unwrap_or_default()
            )));
        }

        let payload: DeviceCodeResponse = serde_json::from_str(&reply.body).map_err(|error| {
            MonitorError::AuthenticationFailed(format!("decode device code response: {error}"))
        })?;

        Ok(DeviceCodeChallenge {
            device_code: payload.device_code,
            user_code: payload.user_code,
            verification_url: payload.verification_uri,
            poll_interval: Duration::from_secs(payload.interval.max(1)),
            expires_at: Instant::now()
                .checked_add(Duration::from_secs(payload.expires_in))
                .ok_or_else(|| {
                    MonitorError::AuthenticationFailed(format!(
                        "device code lifetime out of range: {}s",
                        payload.expires_in
                    ))
                })?,
        })
    }

    async fn poll_for_token(
        &self,
        account: &AccountConfig,
        challenge: &DeviceCodeChallenge,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<TokenRecord, MonitorError> {
        let token_url = self.endpoint(&account.tenant_id, "token");
        let mut interval = challenge.poll_interval;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(MonitorError::AuthenticationFailed("cancelled".to_string()));
                }
                _ = sleep(interval) => {}
            }

            if Instant::now() >= challenge.expires_at {
                return Err(MonitorError::AuthenticationFailed(
                    "device code expired before sign in completed".to_string(),
                ));
            }

            let reply = self
                .http
                .post_form(
                    &token_url,
                    &[
                        ("client_id", account.client_id.as_str()),
                        ("grant_type", DEVICE_CODE_GRANT),
                        ("device_code", challenge.device_code.as_str()),
                    ],
                )
                .await?;

            if reply.is_ok() {
                let payload = decode_token_response(&reply.body)?;
                return TokenRecord::new(
                    account,
                    payload.access_token,
                    payload.refresh_token.unwrap_or_default(),
                    payload.expires_in,
                );
            }

            let error = decode_error_response(&reply.body);
            match error.error.as_str() {
                "authorization_pending" => {
                    debug!("authorization pending");
                    events.log("Waiting for user authentication...");
                }
                "slow_down" => {
                    interval += SLOW_DOWN_STEP;
                    debug!(interval_secs = interval.as_secs(), "server asked to slow down");
                }
                other => {
                    return Err(MonitorError::AuthenticationFailed(format!(
                        "{} {}",
                        if other.is_empty() { "unexpected token response" } else { other },
                        error
                            .error_description
                            .unwrap_or_else(|| redact_response_body(&reply.body))
                    )));
                }
            }
        }
    }
}

fn decode_token_response(body: &str) -> Result<OAuthTokenResponse, MonitorError> {
    serde_json::from_str(body).map_err(|error| {
        MonitorError::AuthenticationFailed(format!("decode token response: {error}"))
    })
}

fn decode_error_response(body: &str) -> OAuthErrorResponse {
    serde_json::from_str(body).unwrap_or_default()
}

fn redact_response_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= REDACTED_BODY_MAX_LEN {
        trimmed.to_string()
    } else {
        let cut = (0..=REDACTED_BODY_MAX_LEN)
            .rev()
            .find(|idx| trimmed.is_char_boundary(*idx))
            .unwrap_or(0);
        format!("{}…[truncated {} bytes]", &trimmed[..cut], trimmed.len())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use super::{
        redact_response_body, HttpReply, OAuth2Authenticator, OAuthHttp, TokenRecord, TokenStore,
        IMAP_SCOPE,
    };
    use crate::config::AccountConfig;
    use crate::error::MonitorError;
    use crate::events::{EventSink, SessionEvent};

    #[derive(Debug, Clone)]
    struct RecordedCall {
        url: String,
        form: Vec<(String, String)>,
        at: Instant,
    }

    #[derive(Default)]
    struct ScriptedHttp {
        replies: Mutex<VecDeque<HttpReply>>,
        calls: Mutex<Vec<RecordedCall>>,
    }

    impl ScriptedHttp {
        fn with(replies: Vec<HttpReply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<RecordedCall> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    #[async_trait]
    impl OAuthHttp for ScriptedHttp {
        async fn post_form(
            &self,
            url: &str,
            form: &[(&str, &str)],
        ) -> Result<HttpReply, MonitorError> {
            self.calls.lock().expect("calls lock").push(RecordedCall {
                url: url.to_string(),
                form: form
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                at: Instant::now(),
            });
            self.replies
                .lock()
                .expect("replies lock")
                .pop_front()
                .ok_or_else(|| MonitorError::Transport("no scripted reply".to_string()))
        }
    }

    fn reply(status: u16, body: serde_json::Value) -> HttpReply {
        HttpReply {
            status,
            body: body.to_string(),
        }
    }

    fn device_code_reply(interval: u64) -> HttpReply {
        reply(
            200,
            json!({
                "device_code": "dev-123",
                "user_code": "ABCD-EFGH",
                "verification_uri": "https://microsoft.com/devicelogin",
                "interval": interval,
                "expires_in": 900
            }),
        )
    }

    fn token_reply(access: &str, refresh: Option<&str>) -> HttpReply {
        let mut body = json!({
            "token_type": "Bearer",
            "access_token": access,
            "expires_in": 3600
        });
        if let Some(refresh) = refresh {
            body["refresh_token"] = json!(refresh);
        }
        reply(200, body)
    }

    fn error_reply(error: &str) -> HttpReply {
        reply(400, json!({ "error": error, "error_description": "scripted" }))
    }

    fn temp_token_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("mailwatch-auth-test-{}", Uuid::new_v4()))
            .join("oauth_token.json")
    }

    fn account() -> AccountConfig {
        AccountConfig::new("client-a", "tenant-a", "owner@example.com")
    }

    fn authenticator(http: Arc<ScriptedHttp>) -> (OAuth2Authenticator, Arc<TokenStore>) {
        let store = Arc::new(TokenStore::new(temp_token_path()));
        let auth = OAuth2Authenticator::new(store.clone(), http, "https://login.example.test/");
        (auth, store)
    }

    fn cached(expires_in: i64, refresh: &str) -> TokenRecord {
        TokenRecord::new(
            &account(),
            "cached-access".to_string(),
            refresh.to_string(),
            expires_in,
        )
        .expect("token record")
    }

    fn form_value<'a>(call: &'a RecordedCall, key: &str) -> Option<&'a str> {
        call.form
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn fresh_cached_token_needs_no_network() {
        let http = ScriptedHttp::with(vec![]);
        let (auth, store) = authenticator(http.clone());
        store.save(&cached(3600, "refresh-a")).expect("seed cache");
        let (events, _rx) = EventSink::channel();

        let token = auth
            .get_access_token(&account(), &events, &CancellationToken::new())
            .await
            .expect("token");
        assert_eq!(token, "cached-access");
        assert!(http.calls().is_empty());
    }

    #[tokio::test]
    async fn expiring_token_is_refreshed_once_and_keeps_refresh_token() {
        let http = ScriptedHttp::with(vec![token_reply("refreshed-access", None)]);
        let (auth, store) = authenticator(http.clone());
        store.save(&cached(120, "refresh-a")).expect("seed cache");
        let (events, _rx) = EventSink::channel();

        let token = auth
            .get_access_token(&account(), &events, &CancellationToken::new())
            .await
            .expect("token");
        assert_eq!(token, "refreshed-access");

        let calls = http.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].url,
            "https://login.example.test/tenant-a/oauth2/v2.0/token"
        );
        assert_eq!(form_value(&calls[0], "grant_type"), Some("refresh_token"));
        assert_eq!(form_value(&calls[0], "refresh_token"), Some("refresh-a"));
        assert_eq!(form_value(&calls[0], "scope"), Some(IMAP_SCOPE));

        let persisted = store.load(&account().key()).expect("persisted record");
        assert_eq!(persisted.access_token, "refreshed-access");
        assert_eq!(persisted.refresh_token, "refresh-a");
        assert!(persisted.expires_at > Utc::now() + chrono::Duration::minutes(50));
    }

    #[tokio::test]
    async fn refresh_response_may_rotate_refresh_token() {
        let http = ScriptedHttp::with(vec![token_reply("refreshed-access", Some("refresh-b"))]);
        let (auth, store) = authenticator(http);
        store.save(&cached(-60, "refresh-a")).expect("seed cache");
        let (events, _rx) = EventSink::channel();

        auth.get_access_token(&account(), &events, &CancellationToken::new())
            .await
            .expect("token");
        let persisted = store.load(&account().key()).expect("persisted record");
        assert_eq!(persisted.refresh_token, "refresh-b");
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_refresh_discards_cache_and_falls_back_to_device_code() {
        let http = ScriptedHttp::with(vec![
            error_reply("invalid_grant"),
            device_code_reply(1),
            token_reply("device-access", Some("device-refresh")),
        ]);
        let (auth, store) = authenticator(http.clone());
        store.save(&cached(60, "refresh-a")).expect("seed cache");
        let (events, mut rx) = EventSink::channel();

        let token = auth
            .get_access_token(&account(), &events, &CancellationToken::new())
            .await
            .expect("token");
        assert_eq!(token, "device-access");
        assert_eq!(http.calls().len(), 3);
        assert!(drain(&mut rx)
            .iter()
            .any(|event| matches!(event, SessionEvent::AuthRequired { .. })));
        let persisted = store.load(&account().key()).expect("persisted record");
        assert_eq!(persisted.refresh_token, "device-refresh");
    }

    #[tokio::test(start_paused = true)]
    async fn expiring_token_without_refresh_token_goes_interactive() {
        let http = ScriptedHttp::with(vec![device_code_reply(1), token_reply("device-access", None)]);
        let (auth, store) = authenticator(http.clone());
        store.save(&cached(60, "")).expect("seed cache");
        let (events, _rx) = EventSink::channel();

        let token = auth
            .get_access_token(&account(), &events, &CancellationToken::new())
            .await
            .expect("token");
        assert_eq!(token, "device-access");
        assert!(http.calls()[0].url.ends_with("/devicecode"));
    }

    #[tokio::test(start_paused = true)]
    async fn device_code_polls_until_authorized() {
        let http = ScriptedHttp::with(vec![
            device_code_reply(5),
            error_reply("authorization_pending"),
            error_reply("authorization_pending"),
            token_reply("device-access", Some("device-refresh")),
        ]);
        let (auth, store) = authenticator(http.clone());
        let (events, mut rx) = EventSink::channel();

        let token = auth
            .get_access_token(&account(), &events, &CancellationToken::new())
            .await
            .expect("token");
        assert_eq!(token, "device-access");

        let calls = http.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(form_value(&calls[0], "client_id"), Some("client-a"));
        assert_eq!(form_value(&calls[0], "scope"), Some(IMAP_SCOPE));
        for pair in calls[1..].windows(2) {
            assert!(pair[1].at - pair[0].at >= Duration::from_secs(5));
            assert_eq!(form_value(&pair[1], "device_code"), Some("dev-123"));
        }
        assert!(calls[1].at - calls[0].at >= Duration::from_secs(5));

        let challenges: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|event| matches!(event, SessionEvent::AuthRequired { .. }))
            .collect();
        assert_eq!(
            challenges,
            vec![SessionEvent::AuthRequired {
                verification_url: "https://microsoft.com/devicelogin".to_string(),
                user_code: "ABCD-EFGH".to_string(),
            }]
        );
        assert!(store.load(&account().key()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_down_stretches_poll_interval() {
        let http = ScriptedHttp::with(vec![
            device_code_reply(2),
            error_reply("slow_down"),
            token_reply("device-access", None),
        ]);
        let (auth, _store) = authenticator(http.clone());
        let (events, _rx) = EventSink::channel();

        auth.get_access_token(&account(), &events, &CancellationToken::new())
            .await
            .expect("token");
        let calls = http.calls();
        assert!(calls[2].at - calls[1].at >= Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn declined_sign_in_fails_authentication() {
        let http = ScriptedHttp::with(vec![device_code_reply(1), error_reply("authorization_declined")]);
        let (auth, store) = authenticator(http);
        let (events, _rx) = EventSink::channel();

        let error = auth
            .get_access_token(&account(), &events, &CancellationToken::new())
            .await
            .expect_err("declined");
        assert!(matches!(error, MonitorError::AuthenticationFailed(ref msg) if msg.contains("authorization_declined")));
        assert!(store.load(&account().key()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn device_code_expiry_stops_polling() {
        let http = ScriptedHttp::with(vec![
            reply(
                200,
                json!({
                    "device_code": "dev-123",
                    "user_code": "ABCD-EFGH",
                    "verification_uri": "https://microsoft.com/devicelogin",
                    "interval": 5,
                    "expires_in": 12
                }),
            ),
            error_reply("authorization_pending"),
            error_reply("authorization_pending"),
        ]);
        let (auth, _store) = authenticator(http.clone());
        let (events, _rx) = EventSink::channel();

        let error = auth
            .get_access_token(&account(), &events, &CancellationToken::new())
            .await
            .expect_err("expired");
        assert!(matches!(error, MonitorError::AuthenticationFailed(ref msg) if msg.contains("expired")));
        assert_eq!(http.calls().len(), 3);
    }

    #[tokio::test]
    async fn cancellation_interrupts_polling() {
        let http = ScriptedHttp::with(vec![device_code_reply(60)]);
        let (auth, _store) = authenticator(http);
        let (events, _rx) = EventSink::channel();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let error = auth
            .get_access_token(&account(), &events, &cancel)
            .await
            .expect_err("cancelled");
        assert_eq!(
            error,
            MonitorError::AuthenticationFailed("cancelled".to_string())
        );
    }

    #[tokio::test]
    async fn force_refresh_without_refresh_token_does_not_go_interactive() {
        let http = ScriptedHttp::with(vec![]);
        let (auth, store) = authenticator(http.clone());
        store.save(&cached(3600, "")).expect("seed cache");
        let (events, _rx) = EventSink::channel();

        let error = auth
            .force_refresh(&account(), &events)
            .await
            .expect_err("no refresh token");
        assert!(matches!(error, MonitorError::AuthenticationFailed(_)));
        assert!(http.calls().is_empty());
    }

    #[tokio::test]
    async fn force_refresh_ignores_remaining_lifetime() {
        let http = ScriptedHttp::with(vec![token_reply("forced-access", None)]);
        let (auth, store) = authenticator(http.clone());
        store.save(&cached(3600, "refresh-a")).expect("seed cache");
        let (events, _rx) = EventSink::channel();

        let token = auth
            .force_refresh(&account(), &events)
            .await
            .expect("forced refresh");
        assert_eq!(token, "forced-access");
        assert_eq!(http.calls().len(), 1);
    }

    #[tokio::test]
    async fn rejected_forced_refresh_clears_cache() {
        let http = ScriptedHttp::with(vec![error_reply("invalid_grant")]);
        let (auth, store) = authenticator(http);
        store.save(&cached(3600, "refresh-a")).expect("seed cache");
        let (events, _rx) = EventSink::channel();

        assert!(auth.force_refresh(&account(), &events).await.is_err());
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn oversized_token_lifetime_fails_refresh() {
        let http = ScriptedHttp::with(vec![reply(
            200,
            json!({ "access_token": "x", "expires_in": i64::MAX }),
        )]);
        let (auth, store) = authenticator(http);
        store.save(&cached(3600, "refresh-a")).expect("seed cache");
        let (events, _rx) = EventSink::channel();

        let error = auth
            .force_refresh(&account(), &events)
            .await
            .expect_err("lifetime out of range");
        assert!(matches!(error, MonitorError::AuthenticationFailed(ref msg) if msg.contains("out of range")));
        let kept = store.load(&account().key()).expect("cache untouched");
        assert_eq!(kept.access_token, "cached-access");
    }

    #[tokio::test]
    async fn oversized_device_code_lifetime_is_rejected() {
        let http = ScriptedHttp::with(vec![reply(
            200,
            json!({
                "device_code": "dev-123",
                "user_code": "ABCD-EFGH",
                "verification_uri": "https://microsoft.com/devicelogin",
                "interval": 5,
                "expires_in": u64::MAX
            }),
        )]);
        let (auth, _store) = authenticator(http);

        let error = auth
            .request_device_code(&account())
            .await
            .expect_err("lifetime out of range");
        assert!(matches!(error, MonitorError::AuthenticationFailed(ref msg) if msg.contains("out of range")));
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(500);
        let redacted = redact_response_body(&body);
        assert!(redacted.starts_with(&"x".repeat(200)));
        assert!(redacted.contains("truncated 500 bytes"));
        assert_eq!(redact_response_body("  short  "), "short");
    }
}
