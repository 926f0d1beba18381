//! Security Tokens
//!
//! A token is issued whenever a dashboard page declaring a metrics meta tag
//! is served. It records which metrics the page may display and expires after
//! a TTL; a background sweeper removes expired entries.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::distr::{Alphanumeric, SampleString};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

/// Default token lifetime
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Default token length in characters
pub const DEFAULT_TOKEN_LENGTH: usize = 32;

/// A stored token and the metrics it grants
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityToken {
    pub token: String,
    pub allowed_metrics: HashSet<String>,
    pub expires_at: DateTime<Utc>,
}

impl SecurityToken {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Generate a random alphanumeric token
pub fn generate(length: usize) -> String {
    Alphanumeric.sample_string(&mut rand::rng(), length)
}

/// Split a comma-separated metric list, dropping blanks
pub fn parse_allowed_metrics(csv: &str) -> HashSet<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// In-memory token store
pub struct TokenStore {
    tokens: RwLock<HashMap<String, SecurityToken>>,
    default_ttl: Duration,
    token_length: usize,
}

impl TokenStore {
    pub fn new(default_ttl: Duration, token_length: usize) -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
            default_ttl,
            token_length,
        }
    }

    /// Store a token with its allowed metrics
    ///
    /// Storing an existing token replaces its entry.
    pub async fn store(&self, token: &str, allowed_metrics_csv: &str, ttl: Duration) {
        let ttl = ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::days(36500));
        let entry = SecurityToken {
            token: token.to_string(),
            allowed_metrics: parse_allowed_metrics(allowed_metrics_csv),
            expires_at: Utc::now() + ttl,
        };

        self.tokens.write().await.insert(token.to_string(), entry);
    }

    /// Generate a fresh token and store it with the default TTL
    pub async fn issue(&self, allowed_metrics_csv: &str) -> String {
        let token = generate(self.token_length);
        self.store(&token, allowed_metrics_csv, self.default_ttl).await;
        tracing::debug!(metrics = %allowed_metrics_csv, "Issued security token");
        token
    }

    /// Metrics granted to `token`
    pub async fn lookup(&self, token: &str) -> Result<HashSet<String>, TokenError> {
        let tokens = self.tokens.read().await;
        let entry = tokens.get(token).ok_or(TokenError::NotFound)?;

        if entry.is_expired_at(Utc::now()) {
            return Err(TokenError::Expired);
        }
        Ok(entry.allowed_metrics.clone())
    }

    /// Remove expired tokens, returning how many were dropped
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|_, entry| !entry.is_expired_at(now));
        before - tokens.len()
    }

    pub async fn len(&self) -> usize {
        self.tokens.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tokens.read().await.is_empty()
    }

    /// Start the periodic sweep task
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let removed = self.sweep_expired().await;
                        if removed > 0 {
                            tracing::debug!(removed = removed, "Swept expired tokens");
                        }
                    }
                }
            }
            tracing::info!("Token sweeper stopped");
        })
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_TOKEN_LENGTH)
    }
}

/// Token lookup errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("Token not found")]
    NotFound,

    #[error("Token expired")]
    Expired,
}
