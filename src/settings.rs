//! Global settings provider
//!
//! The `global_settings` row is read on every withdrawal request and written
//! rarely by admins. Reads go through a short TTL cache; writes go through
//! [`SettingsProvider::update`], which persists and drops the cached copy.

use cached::{Cached, TimedCache};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::models::GlobalSettings;
use crate::store::{LedgerStore, StoreError};

const SETTINGS_KEY: &str = "global_settings";

pub struct SettingsProvider {
    store: Arc<dyn LedgerStore>,
    cache: Mutex<TimedCache<&'static str, GlobalSettings>>,
}

impl SettingsProvider {
    pub fn new(store: Arc<dyn LedgerStore>, ttl: Duration) -> Self {
        Self {
            store,
            cache: Mutex::new(TimedCache::with_lifespan(ttl.as_secs().max(1))),
        }
    }

    /// Cached settings, loading (get-or-create) on miss
    pub async fn current(&self) -> Result<GlobalSettings, StoreError> {
        let mut cache = self.cache.lock().await;
        if let Some(settings) = cache.cache_get(&SETTINGS_KEY) {
            return Ok(settings.clone());
        }
        tracing::debug!("[settings] Loading global settings from store");
        let settings = self.store.load_settings().await?;
        cache.cache_set(SETTINGS_KEY, settings.clone());
        Ok(settings)
    }

    pub async fn invalidate(&self) {
        self.cache.lock().await.cache_clear();
    }

    /// Persist new settings and drop the cached copy
    pub async fn update(&self, settings: &GlobalSettings) -> Result<(), StoreError> {
        let mut cache = self.cache.lock().await;
        self.store.save_settings(settings).await?;
        cache.cache_clear();
        tracing::info!(?settings, "Global settings updated");
        Ok(())
    }
}
