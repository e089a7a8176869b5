use crate::clock::{Clock, ONE_DAY_MS};
use crate::fetch::Fetcher;
use crate::origin::AllowList;
use crate::storage::{KeyValueStore, read_or_miss, write_best_effort};
use crate::tenant::TenantIdentity;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// Per-tenant widget configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct WidgetConfig {
    pub allowed_origins: AllowList,
    pub welcome_text: String,
    pub font_family: String,
    /// Optional translations of the welcome text, keyed by language code.
    pub welcome_labels: HashMap<String, String>,
    pub source_language: Option<String>,
}

impl WidgetConfig {
    /// What the widget runs with when no config can be obtained.
    pub fn allow_all() -> Self {
        Self {
            allowed_origins: AllowList::allow_all(),
            welcome_text: String::new(),
            font_family: String::new(),
            welcome_labels: HashMap::new(),
            source_language: None,
        }
    }

    /// Reads a config document field by field. Only a body that is not a
    /// JSON object is rejected; a mistyped cosmetic field is dropped on its
    /// own so it can never loosen `allowedOrigins`.
    pub fn from_document(doc: &Value) -> Option<Self> {
        let doc = doc.as_object()?;
        let text = |name: &str| {
            doc.get(name)
                .and_then(Value::as_str)
                .map(|v| v.trim().to_string())
                .unwrap_or_default()
        };
        let welcome_labels = doc
            .get("welcomeLabels")
            .and_then(Value::as_object)
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|(lang, text)| Some((lang.clone(), text.as_str()?.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        Some(Self {
            allowed_origins: AllowList::from_value(
                doc.get("allowedOrigins").unwrap_or(&Value::Null),
            ),
            welcome_text: text("welcome"),
            font_family: text("fontFamily"),
            welcome_labels,
            source_language: Some(text("sourceLanguage")).filter(|v| !v.is_empty()),
        })
    }
}

/// Persisted cache record: the raw document plus the time it was fetched.
#[derive(Debug, Serialize, Deserialize)]
struct CachedConfig {
    data: Value,
    ts: i64,
}

pub struct ConfigLoader {
    fetcher: Arc<dyn Fetcher>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    base_url: Url,
}

impl ConfigLoader {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        base_url: Url,
    ) -> Self {
        Self {
            fetcher,
            store,
            clock,
            base_url,
        }
    }

    /// Returns the tenant's config, from cache when younger than 24 hours.
    /// Never fails: any problem yields [`WidgetConfig::allow_all`], which is
    /// not cached.
    pub async fn load(&self, tenant: &TenantIdentity) -> WidgetConfig {
        let key = tenant.config_cache_key();
        if let Some(cfg) = self.read_cache(&key) {
            debug!(%key, "widget config served from cache");
            return cfg;
        }

        let Some(url) = tenant.config_url(&self.base_url) else {
            warn!(base = %self.base_url, "cannot build config url; using defaults");
            return WidgetConfig::allow_all();
        };

        let doc = match self.fetcher.get_json(&url).await {
            Ok(doc) => doc,
            Err(err) => {
                warn!(%url, %err, "widget config fetch failed; using defaults");
                return WidgetConfig::allow_all();
            }
        };
        let Some(cfg) = WidgetConfig::from_document(&doc) else {
            warn!(%url, "widget config is not a JSON object; using defaults");
            return WidgetConfig::allow_all();
        };

        let record = CachedConfig {
            data: doc,
            ts: self.clock.now_ms(),
        };
        match serde_json::to_string(&record) {
            Ok(json) => write_best_effort(self.store.as_ref(), &key, &json),
            Err(err) => debug!(%key, ?err, "failed to encode config cache record"),
        }
        cfg
    }

    fn read_cache(&self, key: &str) -> Option<WidgetConfig> {
        let raw = read_or_miss(self.store.as_ref(), key)?;
        let record: CachedConfig = serde_json::from_str(&raw).ok()?;
        if self.clock.now_ms() - record.ts >= ONE_DAY_MS {
            debug!(%key, "widget config cache expired");
            return None;
        }
        WidgetConfig::from_document(&record.data)
    }
}
