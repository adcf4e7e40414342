//! Credential resolution for the workspace gateway.
//!
//! Precedence mirrors the gateway CLI's own auth chain:
//!   1. `DATABRICKS_TOKEN` env override (never expires from our perspective)
//!   2. Cached broker token (if not within 60 s of expiry)
//!   3. Fresh broker token via `databricks auth token --host <host>`
//!
//! The cache is guarded by a single async mutex held across the refresh call,
//! so concurrent requests hitting an expired cache produce exactly one broker
//! invocation and all waiters observe the refreshed credential.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{RelayError, Result};

/// Env var holding a fixed credential override.
pub const TOKEN_ENV: &str = "DATABRICKS_TOKEN";

/// A cached credential is never served with less than this long to expiry.
pub const EXPIRY_MARGIN_SECS: i64 = 60;

/// Validity window assumed when the broker reports no usable expiry.
const DEFAULT_VALIDITY_SECS: i64 = 3600;

/// Upper bound on one broker invocation.
pub const REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

/// An opaque bearer credential for the gateway, with its expiry when known.
#[derive(Debug, Clone)]
pub struct Credential {
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// A fixed credential with no known expiry.
    pub fn fixed(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
        }
    }

    /// Whether this credential is still safe to hand out at `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            None => true,
            Some(expiry) => expiry - chrono::Duration::seconds(EXPIRY_MARGIN_SECS) > now,
        }
    }
}

/// External identity broker yielding session credentials for a gateway host.
///
/// Injectable so tests never spawn real subprocesses.
#[async_trait]
pub trait TokenBroker: Send + Sync {
    async fn fetch_token(&self, host: &str) -> Result<Credential>;
}

/// Broker backed by the gateway CLI (`<program> auth token --host <host>`).
#[derive(Debug, Clone)]
pub struct CliTokenBroker {
    program: String,
}

impl Default for CliTokenBroker {
    fn default() -> Self {
        Self {
            program: "databricks".to_string(),
        }
    }
}

impl CliTokenBroker {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl TokenBroker for CliTokenBroker {
    async fn fetch_token(&self, host: &str) -> Result<Credential> {
        let output = tokio::process::Command::new(&self.program)
            .args(["auth", "token", "--host", host])
            // The refresh timeout drops this future; take the child with it.
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                RelayError::Credential(format!("failed to run `{} auth token`: {e}", self.program))
            })?;

        if !output.status.success() {
            return Err(RelayError::Credential(format!(
                "`{} auth token` exited with {}",
                self.program, output.status
            )));
        }

        let payload: Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| RelayError::Credential(format!("broker returned invalid JSON: {e}")))?;
        let token = payload
            .get("access_token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                RelayError::Credential("broker response contained no access_token".to_string())
            })?;

        Ok(Credential {
            token: token.to_string(),
            expires_at: Some(parse_expiry(payload.get("expiry"), Utc::now())),
        })
    }
}

/// Parse the broker's `expiry` field.
///
/// Accepts an ISO-8601 timestamp or a numeric epoch value; anything missing
/// or unparseable falls back to a conservative 1-hour window from `now`.
pub fn parse_expiry(raw: Option<&Value>, now: DateTime<Utc>) -> DateTime<Utc> {
    let fallback = now + chrono::Duration::seconds(DEFAULT_VALIDITY_SECS);
    match raw {
        Some(Value::String(text)) => DateTime::parse_from_rfc3339(text)
            .map(|parsed| parsed.with_timezone(&Utc))
            .unwrap_or(fallback),
        Some(Value::Number(num)) => match num.as_f64() {
            Some(epoch) if epoch > 0.0 => {
                DateTime::from_timestamp(epoch as i64, 0).unwrap_or(fallback)
            }
            _ => fallback,
        },
        _ => fallback,
    }
}

/// Resolves a valid gateway credential for one workspace identity.
///
/// One instance is constructed per relay process and shared by all request
/// handlers; there are no ambient globals.
pub struct CredentialProvider {
    host: String,
    fixed: Option<String>,
    broker: Arc<dyn TokenBroker>,
    cache: Mutex<Option<Credential>>,
}

impl CredentialProvider {
    /// Build a provider, reading the fixed override from the environment.
    pub fn from_env(host: impl Into<String>, broker: Arc<dyn TokenBroker>) -> Self {
        let fixed = std::env::var(TOKEN_ENV)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        Self::with_override(host, broker, fixed)
    }

    /// Build a provider with an explicit fixed override (or none).
    pub fn with_override(
        host: impl Into<String>,
        broker: Arc<dyn TokenBroker>,
        fixed: Option<String>,
    ) -> Self {
        Self {
            host: host.into(),
            fixed,
            broker,
            cache: Mutex::new(None),
        }
    }

    /// Return a credential currently valid for the workspace.
    ///
    /// The fixed override short-circuits without touching the cache or the
    /// broker. Otherwise the cached credential is returned while it has more
    /// than [`EXPIRY_MARGIN_SECS`] left; past that, one refresh runs under
    /// the cache lock and every concurrent waiter sees its result.
    pub async fn fetch(&self) -> Result<Credential> {
        if let Some(token) = &self.fixed {
            return Ok(Credential::fixed(token.clone()));
        }

        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.is_fresh(Utc::now()) {
                return Ok(cached.clone());
            }
        }

        let refreshed = tokio::time::timeout(REFRESH_TIMEOUT, self.broker.fetch_token(&self.host))
            .await
            .map_err(|_| RelayError::Credential("credential refresh timed out".to_string()))??;
        *cache = Some(refreshed.clone());
        Ok(refreshed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    struct FakeBroker {
        calls: AtomicUsize,
        validity_secs: i64,
        delay: Duration,
    }

    impl FakeBroker {
        fn with_validity(validity_secs: i64) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                validity_secs,
                delay: Duration::ZERO,
            }
        }

        fn slow(validity_secs: i64, delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                validity_secs,
                delay,
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenBroker for FakeBroker {
        async fn fetch_token(&self, _host: &str) -> Result<Credential> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(Credential {
                token: format!("broker-token-{call}"),
                expires_at: Some(Utc::now() + chrono::Duration::seconds(self.validity_secs)),
            })
        }
    }

    struct FailingBroker;

    #[async_trait]
    impl TokenBroker for FailingBroker {
        async fn fetch_token(&self, _host: &str) -> Result<Credential> {
            Err(RelayError::Credential("broker says no".to_string()))
        }
    }

    #[tokio::test]
    async fn fixed_override_never_invokes_broker() {
        let broker = Arc::new(FakeBroker::with_validity(3600));
        let provider = CredentialProvider::with_override(
            "https://ws.example.com",
            broker.clone(),
            Some("dbx_fixed".to_string()),
        );

        for _ in 0..3 {
            let cred = provider.fetch().await.unwrap();
            assert_eq!(cred.token, "dbx_fixed");
            assert!(cred.expires_at.is_none());
        }
        assert_eq!(broker.call_count(), 0);
    }

    #[tokio::test]
    async fn cached_credential_is_reused_while_outside_margin() {
        let broker = Arc::new(FakeBroker::with_validity(120));
        let provider =
            CredentialProvider::with_override("https://ws.example.com", broker.clone(), None);

        let first = provider.fetch().await.unwrap();
        let second = provider.fetch().await.unwrap();
        assert_eq!(first.token, second.token);
        assert_eq!(broker.call_count(), 1);
    }

    #[tokio::test]
    async fn credential_inside_margin_triggers_refresh() {
        // 30 s validity is inside the 60 s safety margin, so every fetch
        // refreshes.
        let broker = Arc::new(FakeBroker::with_validity(30));
        let provider =
            CredentialProvider::with_override("https://ws.example.com", broker.clone(), None);

        let first = provider.fetch().await.unwrap();
        let second = provider.fetch().await.unwrap();
        assert_ne!(first.token, second.token);
        assert_eq!(broker.call_count(), 2);
    }

    #[tokio::test]
    async fn concurrent_fetches_share_a_single_refresh() {
        let broker = Arc::new(FakeBroker::slow(3600, Duration::from_millis(50)));
        let provider = Arc::new(CredentialProvider::with_override(
            "https://ws.example.com",
            broker.clone(),
            None,
        ));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let provider = provider.clone();
            tasks.push(tokio::spawn(async move { provider.fetch().await }));
        }
        for task in tasks {
            let cred = task.await.unwrap().unwrap();
            assert_eq!(cred.token, "broker-token-1");
        }
        assert_eq!(broker.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_timeout_surfaces_as_credential_error() {
        // Broker takes far longer than the 10 s refresh bound.
        let broker = Arc::new(FakeBroker::slow(3600, Duration::from_secs(30)));
        let provider =
            CredentialProvider::with_override("https://ws.example.com", broker.clone(), None);

        let err = provider.fetch().await.unwrap_err();
        assert_eq!(err.error_type(), "config_error");
        assert!(err.to_string().contains("timed out"));
        assert_eq!(broker.call_count(), 1);
    }

    #[tokio::test]
    async fn dropped_cli_broker_call_kills_the_subprocess() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("broker.pid");
        let script_path = dir.path().join("fake-broker");
        std::fs::write(
            &script_path,
            format!("#!/bin/sh\necho $$ > '{}'\nsleep 60\n", pid_path.display()),
        )
        .unwrap();
        std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let broker = CliTokenBroker::new(script_path.to_string_lossy());
        let call = tokio::time::timeout(
            Duration::from_millis(300),
            broker.fetch_token("https://ws.example.com"),
        )
        .await;
        assert!(call.is_err(), "the sleeping broker should have been cut off");

        let pid: u32 = std::fs::read_to_string(&pid_path)
            .expect("broker never wrote its pid")
            .trim()
            .parse()
            .unwrap();
        let alive = |pid: u32| {
            // Gone or reaped-pending (zombie) both count as dead.
            std::fs::read_to_string(format!("/proc/{pid}/stat"))
                .map(|stat| !stat.contains(") Z "))
                .unwrap_or(false)
        };
        for _ in 0..50 {
            if !alive(pid) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("broker subprocess {pid} survived the dropped refresh");
    }

    #[tokio::test]
    async fn broker_failure_surfaces_as_credential_error() {
        let provider = CredentialProvider::with_override(
            "https://ws.example.com",
            Arc::new(FailingBroker),
            None,
        );

        let err = provider.fetch().await.unwrap_err();
        assert_eq!(err.error_type(), "config_error");
    }

    #[test]
    fn expiry_accepts_iso_8601() {
        let now = Utc::now();
        let parsed = parse_expiry(Some(&json!("2030-01-02T03:04:05Z")), now);
        assert_eq!(parsed.to_rfc3339(), "2030-01-02T03:04:05+00:00");
    }

    #[test]
    fn expiry_accepts_numeric_epoch() {
        let now = Utc::now();
        let parsed = parse_expiry(Some(&json!(1893553445)), now);
        assert_eq!(parsed, DateTime::from_timestamp(1893553445, 0).unwrap());
    }

    #[test]
    fn unparseable_expiry_falls_back_to_one_hour() {
        let now = Utc::now();
        for raw in [Some(json!("not a timestamp")), Some(json!(0)), None] {
            let parsed = parse_expiry(raw.as_ref(), now);
            assert_eq!(parsed, now + chrono::Duration::seconds(3600));
        }
    }

    #[test]
    fn freshness_honors_the_sixty_second_margin() {
        let now = Utc::now();
        let fresh = Credential {
            token: "t".into(),
            expires_at: Some(now + chrono::Duration::seconds(61)),
        };
        let stale = Credential {
            token: "t".into(),
            expires_at: Some(now + chrono::Duration::seconds(60)),
        };
        assert!(fresh.is_fresh(now));
        assert!(!stale.is_fresh(now));
        assert!(Credential::fixed("t").is_fresh(now));
    }
}
