//! Cached model metadata from models.dev

use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const MODELS_DEV_API_URL: &str = "https://models.dev/api.json";
pub const MODELS_METADATA_TTL: Duration = Duration::from_secs(5 * 60);
pub const MODELS_METADATA_TIMEOUT: Duration = Duration::from_secs(8);

struct Cached {
    payload: Value,
    fetched_at: Instant,
}

/// Fetch-through cache; a stale copy is served when the upstream fails
pub struct ModelsMetadataCache {
    client: reqwest::Client,
    url: String,
    ttl: Duration,
    timeout: Duration,
    entry: Mutex<Option<Cached>>,
}

impl ModelsMetadataCache {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_source(client, MODELS_DEV_API_URL, MODELS_METADATA_TTL)
    }

    pub fn with_source(client: reqwest::Client, url: impl Into<String>, ttl: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            ttl,
            timeout: MODELS_METADATA_TIMEOUT,
            entry: Mutex::new(None),
        }
    }

    /// Fresh cached payload, else a new fetch, else the stale payload; `None` when all fail
    pub async fn get(&self) -> Option<Value> {
        let stale = {
            let entry = self.entry.lock().await;
            match entry.as_ref() {
                Some(cached) if cached.fetched_at.elapsed() < self.ttl => {
                    return Some(cached.payload.clone());
                }
                Some(cached) => Some(cached.payload.clone()),
                None => None,
            }
        };

        match self.fetch().await {
            Ok(payload) => {
                *self.entry.lock().await = Some(Cached {
                    payload: payload.clone(),
                    fetched_at: Instant::now(),
                });
                Some(payload)
            }
            Err(e) => {
                warn!("Failed to fetch models metadata: {}", e);
                if stale.is_some() {
                    debug!("Serving stale models metadata");
                }
                stale
            }
        }
    }

    async fn fetch(&self) -> Result<Value, String> {
        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("{} responded with status {}", self.url, response.status()));
        }
        response.json::<Value>().await.map_err(|e| e.to_string())
    }
}
