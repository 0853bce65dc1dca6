//! Newsletter subscription status, looked up by email from a subscriber API and cached.

use crate::config::{CacheSettings, NewsletterSettings, StoreFormat};
use crate::error::{ResolveError, StoreError};
use crate::hydration::{CacheLookupSuccess, ResolveOptions};
use crate::managed_cache::ManagedCache;
use crate::source_of_record::SourceOfRecord;
use crate::store::discrete_files::{DiscreteFileStoreBincode, DiscreteFileStoreJson};
use crate::store::memory::MemoryStore;
use crate::store::replacement::LruReplacementStrategy;
use crate::store::CacheStoreStrategy;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

pub const STATUS_KEY_PREFIX: &str = "newsletter-status:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NewsletterStatus {
    Subscribed,
    /// Signed up, confirmation outstanding.
    Pending,
    Unsubscribed,
}

impl NewsletterStatus {
    /// Maps a subscriber `state` as reported by the API. Unknown states are `None`: they are not
    /// evidence that the address is unsubscribed.
    pub fn from_subscriber_state(state: &str) -> Option<Self> {
        match state {
            "active" => Some(Self::Subscribed),
            "inactive" => Some(Self::Pending),
            "cancelled" | "bounced" | "complained" => Some(Self::Unsubscribed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscribed => "subscribed",
            Self::Pending => "pending",
            Self::Unsubscribed => "unsubscribed",
        }
    }
}

impl fmt::Display for NewsletterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

/// Cache key for one subscriber: [`STATUS_KEY_PREFIX`] followed by the normalized email.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StatusKey(String);

impl StatusKey {
    /// Fails for an email that is empty once normalized.
    pub fn for_email(email: &str) -> Result<Self, ResolveError> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Err(ResolveError::invalid_key("email address is blank"));
        }
        Ok(Self(format!("{STATUS_KEY_PREFIX}{email}")))
    }

    pub fn email(&self) -> &str {
        &self.0[STATUS_KEY_PREFIX.len()..]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StatusKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for StatusKey {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.strip_prefix(STATUS_KEY_PREFIX)
            .and_then(|email| Self::for_email(email).ok())
            .ok_or_else(|| format!("`{raw}` is not a newsletter status key"))
    }
}

impl From<StatusKey> for String {
    fn from(key: StatusKey) -> Self {
        key.0
    }
}

#[derive(Debug, Deserialize)]
struct SubscribersResponse {
    subscribers: Vec<Subscriber>,
}

#[derive(Debug, Deserialize)]
struct Subscriber {
    state: String,
}

/// Reads subscriber state from a ConvertKit-style `GET /v3/subscribers` endpoint.
pub struct SubscriberApiSource {
    client: reqwest::Client,
    subscribers_url: String,
    api_secret: String,
}

impl SubscriberApiSource {
    pub fn new(settings: &NewsletterSettings) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()?;

        Ok(Self::with_client(client, &settings.base_url, &settings.api_secret))
    }

    pub fn with_client(client: reqwest::Client, base_url: &str, api_secret: &str) -> Self {
        Self {
            client,
            subscribers_url: format!("{}/v3/subscribers", base_url.trim_end_matches('/')),
            api_secret: api_secret.to_string(),
        }
    }
}

#[async_trait]
impl SourceOfRecord<StatusKey, NewsletterStatus> for SubscriberApiSource {
    async fn retrieve(&self, key: &StatusKey) -> Result<NewsletterStatus, ResolveError> {
        let response = self
            .client
            .get(&self.subscribers_url)
            .query(&[
                ("api_secret", self.api_secret.as_str()),
                ("email_address", key.email()),
            ])
            .send()
            .await
            .map_err(|err| {
                ResolveError::remote_unavailable(format!("subscriber lookup failed: {err}"))
            })?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ResolveError::remote_unavailable(format!(
                "subscriber API answered {status}"
            )));
        }
        if !status.is_success() {
            return Err(ResolveError::invalid_response(format!(
                "subscriber API answered {status}"
            )));
        }

        let body: SubscribersResponse = response.json().await.map_err(|err| {
            if err.is_timeout() {
                ResolveError::remote_unavailable(format!("subscriber API body timed out: {err}"))
            } else {
                ResolveError::invalid_response(format!("undecodable subscriber payload: {err}"))
            }
        })?;

        match body.subscribers.first() {
            None => Ok(NewsletterStatus::Unsubscribed),
            Some(subscriber) => NewsletterStatus::from_subscriber_state(&subscriber.state)
                .ok_or_else(|| {
                    ResolveError::invalid_response(format!(
                        "unknown subscriber state `{}`",
                        subscriber.state
                    ))
                }),
        }
    }

    fn is_valid(&self, key: &StatusKey, _value: &NewsletterStatus) -> bool {
        // The enum itself is the payload shape; only the key can drift.
        key.as_str().starts_with(STATUS_KEY_PREFIX) && !key.email().is_empty()
    }
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("failed to open cache store: {0}")]
    Store(#[from] StoreError),
    #[error("failed to build http client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Resolves newsletter status by email through a [`ManagedCache`].
pub struct NewsletterStatusResolver {
    cache: ManagedCache<StatusKey, NewsletterStatus>,
}

impl NewsletterStatusResolver {
    pub fn new(cache: ManagedCache<StatusKey, NewsletterStatus>) -> Self {
        Self { cache }
    }

    /// Opens the configured store (on disk when `cache.directory` is set, in memory otherwise),
    /// bounds it with LRU eviction and wires it to the subscriber API.
    pub async fn from_settings(
        cache: &CacheSettings,
        newsletter: &NewsletterSettings,
    ) -> Result<Self, SetupError> {
        let store = open_store(cache).await?;
        let source = Arc::new(SubscriberApiSource::new(newsletter)?);
        let defaults = ResolveOptions::new(cache.ttl, cache.stale_while_revalidate);

        Ok(Self::new(ManagedCache::pull(store, source, defaults)))
    }

    pub async fn status_for(
        &self,
        email: &str,
        force_fresh: bool,
    ) -> Result<NewsletterStatus, ResolveError> {
        self.lookup(email, force_fresh)
            .await
            .map(CacheLookupSuccess::into_value)
    }

    pub async fn lookup(
        &self,
        email: &str,
        force_fresh: bool,
    ) -> Result<CacheLookupSuccess<NewsletterStatus>, ResolveError> {
        let key = StatusKey::for_email(email)?;
        let options = self.cache.defaults().with_force_fresh(force_fresh);
        self.cache.lookup(&key, &options).await
    }

    /// Drops any cached status for `email`, e.g. after the user subscribes or unsubscribes.
    pub async fn forget(&self, email: &str) -> Result<bool, ResolveError> {
        let key = StatusKey::for_email(email)?;
        debug!(%key, "Forgetting cached newsletter status");
        self.cache.invalidate(&key).await
    }

    /// Waits for background refreshes started by earlier lookups. A process that exits right after
    /// a lookup calls this first, or the refresh dies with the runtime.
    pub async fn settle(&self) {
        self.cache.settle().await
    }
}

async fn open_store(
    settings: &CacheSettings,
) -> Result<Arc<dyn CacheStoreStrategy<StatusKey, NewsletterStatus>>, StoreError> {
    let inner: Box<dyn CacheStoreStrategy<StatusKey, NewsletterStatus>> =
        match (&settings.directory, settings.format) {
            (None, _) => Box::new(MemoryStore::<StatusKey, NewsletterStatus>::new()),
            (Some(directory), StoreFormat::Json) => {
                Box::new(
                    DiscreteFileStoreJson::<StatusKey, NewsletterStatus>::non_volatile(
                        directory.clone(),
                    )
                    .await?,
                )
            }
            (Some(directory), StoreFormat::Bincode) => {
                Box::new(
                    DiscreteFileStoreBincode::<StatusKey, NewsletterStatus>::non_volatile(
                        directory.clone(),
                    )
                    .await?,
                )
            }
        };

    info!(
        directory = ?settings.directory,
        format = ?settings.format,
        max_entries = settings.max_entries.get(),
        "Opened newsletter status cache"
    );
    let bounded = LruReplacementStrategy::new(settings.max_entries, inner).await?;
    Ok(Arc::new(bounded))
}
