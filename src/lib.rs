pub mod api;
pub mod canvases;
pub mod commands;
pub mod config;
pub mod gallery;
pub mod history;
pub mod models;
pub mod presets;
pub mod session;
pub mod state;
pub mod storage;

use anyhow::{Context, Result};
use api::{DesignApi, OpenAICompatibleClient};
use commands::Workspace;
use config::SettingsService;
use gallery::Catalog;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use storage::{KeyValueStore, SqliteStore};

/// Overrides the directory holding the database and gallery metadata.
pub const DATA_DIR_ENV: &str = "CHARM_STUDIO_DATA_DIR";
const DEFAULT_DATA_DIR: &str = ".charm-studio";

pub fn data_dir() -> PathBuf {
    std::env::var(DATA_DIR_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
}

/// Reads `gallery/metadata.json` under `data_dir`. A missing file means an
/// empty gallery.
pub async fn load_catalog(data_dir: &Path) -> Result<Catalog> {
    let path = data_dir.join("gallery").join("metadata.json");
    match tokio::fs::read_to_string(&path).await {
        Ok(text) => Catalog::from_json(&text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::info!("No gallery metadata at {}, starting with an empty gallery", path.display());
            Ok(Catalog::default())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Everything a front end needs: the workspace plus the services it shares
/// storage with.
pub struct App {
    pub workspace: Workspace,
    pub settings: SettingsService,
    pub catalog: Catalog,
}

/// Opens the SQLite store under `data_dir` and wires the workspace to the
/// OpenAI-compatible provider.
pub async fn open_app(data_dir: &Path) -> Result<App> {
    let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::open(&data_dir.join("charm_studio.db")).await?);
    let settings = SettingsService::new(store.clone());
    let catalog = load_catalog(data_dir).await?;

    let api: Arc<dyn DesignApi> = Arc::new(OpenAICompatibleClient::new(settings.clone(), catalog.clone()));
    let workspace = Workspace::open(store, api).await;

    Ok(App {
        workspace,
        settings,
        catalog,
    })
}
