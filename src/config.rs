use crate::storage::{KeyValueStore, API_SETTINGS_KEY};
use anyhow::{Context, Result};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Environment variable selecting the backend base path.
pub const BASE_URL_ENV: &str = "VITE_API_BASE_URL";
pub const DEFAULT_BACKEND_BASE: &str = "/api/v1";

const KEYRING_SERVICE: &str = "charm_studio_api_key";

/// Connection settings for the OpenAI-compatible provider.
///
/// Stored as JSON; any field missing from the stored object takes its default,
/// so older records stay readable.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ApiSettings {
    pub api_base_url: String,
    /// A literal key, `env:NAME`, or `keyring`.
    pub api_key: String,
    pub image_model: String,
    pub chat_model: String,
    /// Request timeout in milliseconds.
    pub timeout: u64,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.lsaigc.com/v1".to_string(),
            api_key: String::new(),
            image_model: "doubao-seedream-4-5-251128".to_string(),
            chat_model: "claude-3-5-sonnet-20240620".to_string(),
            timeout: 180_000,
        }
    }
}

impl ApiSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    pub fn is_configured(&self) -> bool {
        !self.api_key.trim().is_empty() && !self.api_base_url.trim().is_empty()
    }

    /// Base URL without a trailing slash, falling back to the backend path
    /// from the environment when none is configured.
    pub fn base_url(&self) -> String {
        let configured = self.api_base_url.trim();
        if configured.is_empty() {
            backend_base_url()
        } else {
            configured.trim_end_matches('/').to_string()
        }
    }
}

/// Partial update merged over the stored settings.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApiSettingsUpdate {
    pub api_base_url: Option<String>,
    pub api_key: Option<String>,
    pub image_model: Option<String>,
    pub chat_model: Option<String>,
    pub timeout: Option<u64>,
}

impl ApiSettingsUpdate {
    fn apply(self, settings: &mut ApiSettings) {
        if let Some(v) = self.api_base_url {
            settings.api_base_url = v;
        }
        if let Some(v) = self.api_key {
            settings.api_key = v;
        }
        if let Some(v) = self.image_model {
            settings.image_model = v;
        }
        if let Some(v) = self.chat_model {
            settings.chat_model = v;
        }
        if let Some(v) = self.timeout {
            settings.timeout = v;
        }
    }
}

pub fn backend_base_url() -> String {
    std::env::var(BASE_URL_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(|v| v.trim_end_matches('/').to_string())
        .unwrap_or_else(|| DEFAULT_BACKEND_BASE.to_string())
}

/// Loads and saves [`ApiSettings`], notifying subscribers of every change.
#[derive(Clone)]
pub struct SettingsService {
    store: Arc<dyn KeyValueStore>,
    changes: broadcast::Sender<ApiSettings>,
}

impl SettingsService {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        let (changes, _) = broadcast::channel(16);
        Self { store, changes }
    }

    /// Receives the full settings after every save or clear.
    pub fn subscribe(&self) -> broadcast::Receiver<ApiSettings> {
        self.changes.subscribe()
    }

    /// Stored settings over defaults. Corrupted storage yields the defaults.
    pub async fn get(&self) -> ApiSettings {
        match self.store.get(API_SETTINGS_KEY).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                log::error!("[ApiSettings] Failed to load settings: {}", e);
                ApiSettings::default()
            }),
            Ok(None) => ApiSettings::default(),
            Err(e) => {
                log::error!("[ApiSettings] Failed to read settings: {:?}", e);
                ApiSettings::default()
            }
        }
    }

    pub async fn save(&self, update: ApiSettingsUpdate) -> Result<ApiSettings> {
        let mut settings = self.get().await;
        update.apply(&mut settings);

        let serialized = serde_json::to_string(&settings).context("Failed to serialize API settings")?;
        self.store.set(API_SETTINGS_KEY, &serialized).await?;
        log::info!("[ApiSettings] Saved settings for {}", settings.base_url());

        self.notify(&settings);
        Ok(settings)
    }

    pub async fn clear(&self) -> Result<()> {
        self.store.remove(API_SETTINGS_KEY).await?;
        self.notify(&ApiSettings::default());
        Ok(())
    }

    pub async fn is_configured(&self) -> bool {
        self.get().await.is_configured()
    }

    fn notify(&self, settings: &ApiSettings) {
        // No subscribers is fine
        let _ = self.changes.send(settings.clone());
    }
}

/// Resolves the API key the settings refer to.
pub fn resolve_api_key(settings: &ApiSettings) -> Result<String> {
    let key_ref = settings.api_key.trim();
    match key_ref {
        "" => Err(anyhow::anyhow!("API key is not configured")),
        r if r.starts_with("env:") => {
            let env_var_name = r.trim_start_matches("env:");
            log::debug!("Retrieving API key from environment variable: {}", env_var_name);
            std::env::var(env_var_name).context(format!(
                "Failed to get API key from environment variable '{}'",
                env_var_name
            ))
        }
        "keyring" => {
            let account = settings.base_url();
            let entry = Entry::new(KEYRING_SERVICE, &account).context("Failed to create keyring entry")?;
            log::debug!("Retrieving API key from keyring for: {}", account);
            entry.get_password().context(format!(
                "Failed to get API key from keyring for '{}'. Please set it in settings.",
                account
            ))
        }
        literal => Ok(literal.to_string()),
    }
}

/// Stores an API key in the OS keyring under the settings' base URL.
pub fn set_api_key_in_keyring(settings: &ApiSettings, api_key: &str) -> Result<()> {
    let account = settings.base_url();
    let entry = Entry::new(KEYRING_SERVICE, &account)
        .context("Failed to create keyring entry for setting password")?;
    log::info!("Setting API key in keyring for: {}", account);
    entry
        .set_password(api_key)
        .context(format!("Failed to set API key in keyring for '{}'", account))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[tokio::test]
    async fn missing_settings_resolve_to_defaults() {
        let svc = SettingsService::new(Arc::new(MemoryStore::new()));
        let settings = svc.get().await;
        assert_eq!(settings, ApiSettings::default());
        assert!(!settings.is_configured());
    }

    #[tokio::test]
    async fn partial_record_merges_over_defaults() {
        let store = Arc::new(MemoryStore::new());
        store.set(API_SETTINGS_KEY, r#"{"apiKey":"sk-1"}"#).await.unwrap();
        let settings = SettingsService::new(store).get().await;
        assert_eq!(settings.api_key, "sk-1");
        assert_eq!(settings.timeout, 180_000);
        assert!(settings.is_configured());
    }

    #[tokio::test]
    async fn corrupted_settings_fall_back_to_defaults() {
        let store = Arc::new(MemoryStore::new());
        store.set(API_SETTINGS_KEY, "not json").await.unwrap();
        assert_eq!(SettingsService::new(store).get().await, ApiSettings::default());
    }

    #[tokio::test]
    async fn save_merges_and_broadcasts() {
        let svc = SettingsService::new(Arc::new(MemoryStore::new()));
        let mut rx = svc.subscribe();

        svc.save(ApiSettingsUpdate {
            api_key: Some("sk-test".into()),
            ..Default::default()
        })
        .await
        .unwrap();
        let saved = svc
            .save(ApiSettingsUpdate {
                chat_model: Some("gpt-4o".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(saved.api_key, "sk-test");
        assert_eq!(saved.chat_model, "gpt-4o");
        assert_eq!(rx.recv().await.unwrap().api_key, "sk-test");
        assert_eq!(rx.recv().await.unwrap().chat_model, "gpt-4o");

        svc.clear().await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), ApiSettings::default());
        assert_eq!(svc.get().await, ApiSettings::default());
    }

    #[test]
    fn base_url_trims_trailing_slash() {
        let settings = ApiSettings {
            api_base_url: "https://example.test/v1/".into(),
            ..ApiSettings::default()
        };
        assert_eq!(settings.base_url(), "https://example.test/v1");
    }

    #[test]
    fn literal_and_env_keys_resolve() {
        let mut settings = ApiSettings {
            api_key: "sk-literal".into(),
            ..ApiSettings::default()
        };
        assert_eq!(resolve_api_key(&settings).unwrap(), "sk-literal");

        std::env::set_var("CHARM_STUDIO_TEST_KEY", "sk-env");
        settings.api_key = "env:CHARM_STUDIO_TEST_KEY".into();
        assert_eq!(resolve_api_key(&settings).unwrap(), "sk-env");

        settings.api_key = "  ".into();
        assert!(resolve_api_key(&settings).is_err());
    }
}
