use crate::models::DesignCanvas;
use crate::storage::{KeyValueStore, CANVASES_KEY, CURRENT_CANVAS_KEY};
use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Serializes one canvas. Timestamps become ISO-8601 strings.
pub fn serialize_canvas(canvas: &DesignCanvas) -> Result<String> {
    serde_json::to_string(canvas).with_context(|| format!("Failed to serialize canvas {}", canvas.id))
}

/// Inverse of [`serialize_canvas`]. Absent arrays default to empty and the
/// stored record is repaired so it satisfies the canvas invariants.
pub fn deserialize_canvas(data: &str) -> Result<DesignCanvas> {
    let canvas: DesignCanvas = serde_json::from_str(data).context("Failed to parse canvas JSON")?;
    Ok(repair(canvas))
}

fn repair(mut canvas: DesignCanvas) -> DesignCanvas {
    if let Some(current) = canvas.current_version_id.as_deref() {
        if !canvas.versions.iter().any(|v| v.id == current) {
            log::warn!(
                "Canvas {} points at missing version {}, clearing selection",
                canvas.id,
                current
            );
            canvas.current_version_id = None;
        }
    }

    // Older records never stored the counter
    let floor = canvas
        .versions
        .iter()
        .filter_map(|v| v.number())
        .max()
        .map_or(0, |n| n + 1);
    canvas.next_version_number = canvas.next_version_number.max(floor);
    canvas
}

fn random_suffix(len: usize) -> String {
    Uuid::new_v4().simple().to_string()[..len].to_string()
}

/// `canvas_{millis}_{6 hex chars}`.
pub fn new_canvas_id() -> String {
    format!("canvas_{}_{}", Utc::now().timestamp_millis(), random_suffix(6))
}

/// The requested name, or `画布 N` for the N-th canvas when blank.
pub fn canvas_name(requested: Option<&str>, existing: usize) -> String {
    match requested {
        Some(n) if !n.trim().is_empty() => n.trim().to_string(),
        _ => format!("画布 {}", existing + 1),
    }
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CanvasStats {
    pub total: usize,
    pub total_versions: usize,
    /// Canvases updated within the last 24 hours.
    pub recent_count: usize,
}

/// Persists the canvas collection and the current-canvas pointer.
#[derive(Clone)]
pub struct CanvasService {
    store: Arc<dyn KeyValueStore>,
    // Serializes load-modify-save cycles on the collection key
    writes: Arc<Mutex<()>>,
}

impl CanvasService {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            writes: Arc::new(Mutex::new(())),
        }
    }

    /// Reads the whole collection. Never fails: unreadable or corrupted storage
    /// yields an empty list, and individual broken records are skipped.
    pub async fn load_canvases(&self) -> Vec<DesignCanvas> {
        let raw = match self.store.get(CANVASES_KEY).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                log::error!("[CanvasService] Failed to read canvases: {:?}", e);
                return Vec::new();
            }
        };

        let entries: Vec<serde_json::Value> = match serde_json::from_str(&raw) {
            Ok(entries) => entries,
            Err(e) => {
                log::error!("[CanvasService] Failed to load canvases: {}", e);
                return Vec::new();
            }
        };

        entries
            .into_iter()
            .filter_map(|entry| match serde_json::from_value::<DesignCanvas>(entry) {
                Ok(canvas) => Some(repair(canvas)),
                Err(e) => {
                    log::warn!("[CanvasService] Skipping unreadable canvas record: {}", e);
                    None
                }
            })
            .collect()
    }

    /// Writes the whole collection under one key.
    pub async fn save_canvases(&self, canvases: &[DesignCanvas]) -> Result<()> {
        let _writing = self.writes.lock().await;
        self.write_all(canvases).await
    }

    async fn write_all(&self, canvases: &[DesignCanvas]) -> Result<()> {
        let serialized = serde_json::to_string(canvases).context("Failed to serialize canvases")?;
        self.store.set(CANVASES_KEY, &serialized).await
    }

    /// All canvases, most recently updated first.
    pub async fn get_canvases(&self) -> Vec<DesignCanvas> {
        let mut canvases = self.load_canvases().await;
        canvases.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        canvases
    }

    pub async fn get_canvas(&self, id: &str) -> Option<DesignCanvas> {
        self.load_canvases().await.into_iter().find(|c| c.id == id)
    }

    /// Prepends a fresh, empty canvas and makes it current.
    pub async fn create_canvas(&self, name: Option<&str>) -> Result<DesignCanvas> {
        let _writing = self.writes.lock().await;
        let mut canvases = self.load_canvases().await;
        let canvas = DesignCanvas::empty(new_canvas_id(), canvas_name(name, canvases.len()));
        canvases.insert(0, canvas.clone());
        self.write_all(&canvases).await?;
        self.set_current_canvas_id(Some(&canvas.id)).await?;

        log::info!("[CanvasService] Created canvas: {}", canvas.id);
        Ok(canvas)
    }

    /// Upserts a canvas, refreshing `updated_at` and the thumbnail. Returns the
    /// record as stored.
    pub async fn save_canvas(&self, canvas: &DesignCanvas) -> Result<DesignCanvas> {
        let _writing = self.writes.lock().await;
        let mut canvases = self.load_canvases().await;

        let mut updated = canvas.clone();
        updated.updated_at = Utc::now();
        updated.thumbnail = canvas.latest_image().map(str::to_string);

        match canvases.iter().position(|c| c.id == canvas.id) {
            Some(index) => canvases[index] = updated.clone(),
            None => canvases.insert(0, updated.clone()),
        }

        self.write_all(&canvases).await?;
        log::info!("[CanvasService] Saved canvas: {}", canvas.id);
        Ok(updated)
    }

    /// Returns `false` when no canvas had that id.
    pub async fn delete_canvas(&self, id: &str) -> Result<bool> {
        let _writing = self.writes.lock().await;
        let canvases = self.load_canvases().await;
        let before = canvases.len();
        let filtered: Vec<DesignCanvas> = canvases.into_iter().filter(|c| c.id != id).collect();

        if filtered.len() == before {
            log::warn!("[CanvasService] Attempted to delete non-existent canvas: {}", id);
            return Ok(false);
        }

        self.write_all(&filtered).await?;

        if self.current_canvas_id().await.as_deref() == Some(id) {
            self.set_current_canvas_id(None).await?;
        }

        log::info!("[CanvasService] Deleted canvas: {}", id);
        Ok(true)
    }

    pub async fn current_canvas_id(&self) -> Option<String> {
        match self.store.get(CURRENT_CANVAS_KEY).await {
            Ok(id) => id,
            Err(e) => {
                log::error!("[CanvasService] Failed to read current canvas id: {:?}", e);
                None
            }
        }
    }

    pub async fn set_current_canvas_id(&self, id: Option<&str>) -> Result<()> {
        match id {
            Some(id) => self.store.set(CURRENT_CANVAS_KEY, id).await,
            None => self.store.remove(CURRENT_CANVAS_KEY).await,
        }
    }

    pub async fn stats(&self) -> CanvasStats {
        let canvases = self.load_canvases().await;
        let day_ago = Utc::now() - Duration::hours(24);
        CanvasStats {
            total: canvases.len(),
            total_versions: canvases.iter().map(|c| c.versions.len()).sum(),
            recent_count: canvases.iter().filter(|c| c.updated_at > day_ago).count(),
        }
    }
}
