use crate::models::{HistoryItem, HistoryStatus, TimeFilter};
use crate::storage::{KeyValueStore, HISTORY_KEY};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Local, LocalResult, TimeZone, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Serialize, Clone, Copy, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryStats {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub total_cost: f64,
}

/// Start of the calendar day containing `now`, in local time.
fn local_midnight(now: DateTime<Local>) -> DateTime<Utc> {
    let date = now.date_naive();
    let naive = date.and_hms_opt(0, 0, 0).unwrap_or_else(|| now.naive_local());
    match Local.from_local_datetime(&naive) {
        LocalResult::Single(t) => t.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        // Midnight skipped by a DST jump; the day starts at the first valid instant
        LocalResult::None => now.with_timezone(&Utc) - (now.naive_local() - naive),
    }
}

/// Lower bound of a time window, or `None` for [`TimeFilter::All`].
pub fn window_start(filter: TimeFilter, now: DateTime<Local>) -> Option<DateTime<Utc>> {
    let today = local_midnight(now);
    match filter {
        TimeFilter::Today => Some(today),
        TimeFilter::Week => Some(today - Duration::days(7)),
        TimeFilter::Month => Some(today - Duration::days(30)),
        TimeFilter::All => None,
    }
}

fn sort_recent_first(items: &mut [HistoryItem]) {
    items.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
}

/// Persists generation history under its own key.
#[derive(Clone)]
pub struct HistoryService {
    store: Arc<dyn KeyValueStore>,
    // Serializes load-modify-save cycles on the shared key
    writes: Arc<Mutex<()>>,
}

impl HistoryService {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            writes: Arc::new(Mutex::new(())),
        }
    }

    async fn load(&self) -> Vec<HistoryItem> {
        let raw = match self.store.get(HISTORY_KEY).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                log::error!("Failed to read history: {:?}", e);
                return Vec::new();
            }
        };

        match serde_json::from_str(&raw) {
            Ok(items) => items,
            Err(e) => {
                log::error!("Failed to load history: {}", e);
                Vec::new()
            }
        }
    }

    async fn save(&self, items: &[HistoryItem]) -> Result<()> {
        let serialized = serde_json::to_string(items).context("Failed to serialize history")?;
        self.store.set(HISTORY_KEY, &serialized).await
    }

    /// Stores `item` with a freshly assigned id; any id it carries is replaced.
    pub async fn add(&self, mut item: HistoryItem) -> Result<HistoryItem> {
        let _writing = self.writes.lock().await;
        let mut items = self.load().await;
        let suffix = Uuid::new_v4().simple().to_string();
        item.id = format!("history_{}_{}", Utc::now().timestamp_millis(), &suffix[..9]);
        items.insert(0, item.clone());
        self.save(&items).await?;
        log::info!("Recorded history item {} ({:?})", item.id, item.status);
        Ok(item)
    }

    pub async fn get(&self, id: &str) -> Option<HistoryItem> {
        self.load().await.into_iter().find(|item| item.id == id)
    }

    /// All items, newest first.
    pub async fn list(&self) -> Vec<HistoryItem> {
        let mut items = self.load().await;
        sort_recent_first(&mut items);
        items
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let _writing = self.writes.lock().await;
        let items: Vec<HistoryItem> = self.load().await.into_iter().filter(|item| item.id != id).collect();
        self.save(&items).await
    }

    pub async fn clear(&self) -> Result<()> {
        let _writing = self.writes.lock().await;
        log::warn!("Clearing generation history");
        self.store.remove(HISTORY_KEY).await
    }

    /// Case-insensitive substring match on the instruction. A blank query lists everything.
    pub async fn search(&self, query: &str) -> Vec<HistoryItem> {
        if query.trim().is_empty() {
            return self.list().await;
        }

        let needle = query.to_lowercase();
        let mut items: Vec<HistoryItem> = self
            .load()
            .await
            .into_iter()
            .filter(|item| item.instruction.to_lowercase().contains(&needle))
            .collect();
        sort_recent_first(&mut items);
        items
    }

    pub async fn filter_by_time(&self, filter: TimeFilter) -> Vec<HistoryItem> {
        self.filter_by_time_at(filter, Local::now()).await
    }

    /// [`Self::filter_by_time`] evaluated against an explicit clock.
    pub async fn filter_by_time_at(&self, filter: TimeFilter, now: DateTime<Local>) -> Vec<HistoryItem> {
        let start = window_start(filter, now);
        let mut items: Vec<HistoryItem> = self
            .load()
            .await
            .into_iter()
            .filter(|item| start.map_or(true, |s| item.timestamp >= s))
            .collect();
        sort_recent_first(&mut items);
        items
    }

    pub async fn stats(&self) -> HistoryStats {
        let items = self.load().await;
        HistoryStats {
            total: items.len(),
            success: items.iter().filter(|h| h.status == HistoryStatus::Success).count(),
            failed: items.iter().filter(|h| h.status == HistoryStatus::Failed).count(),
            total_cost: items.iter().map(|h| h.cost).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, SqliteStore};

    fn item(instruction: &str, timestamp: DateTime<Utc>, status: HistoryStatus) -> HistoryItem {
        HistoryItem {
            id: String::new(),
            timestamp,
            instruction: instruction.into(),
            reference_url: "blob:ref".into(),
            generated_url: "https://img/out.png".into(),
            versions: Vec::new(),
            versions_count: 0,
            status,
            cost: 0.15,
            cost_breakdown: None,
        }
    }

    fn service() -> (HistoryService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (HistoryService::new(store.clone()), store)
    }

    #[tokio::test]
    async fn add_assigns_id_and_lists_newest_first() {
        let (svc, _) = service();
        let now = Utc::now();
        let older = svc.add(item("旧的", now - Duration::hours(3), HistoryStatus::Success)).await.unwrap();
        let newer = svc.add(item("新的", now, HistoryStatus::Success)).await.unwrap();

        assert!(older.id.starts_with("history_"));
        assert_ne!(older.id, newer.id);
        let listed: Vec<String> = svc.list().await.into_iter().map(|h| h.instruction).collect();
        assert_eq!(listed, vec!["新的", "旧的"]);
        assert_eq!(svc.get(&older.id).await.unwrap().instruction, "旧的");
    }

    #[tokio::test]
    async fn round_trip_preserves_timestamps_by_value() {
        let (svc, _) = service();
        let stamp = Utc::now();
        let added = svc.add(item("x", stamp, HistoryStatus::Failed)).await.unwrap();
        let loaded = svc.get(&added.id).await.unwrap();
        assert_eq!(loaded, added);
        assert_eq!(loaded.timestamp, stamp);
    }

    #[tokio::test]
    async fn missing_versions_field_defaults_to_empty() {
        let (svc, store) = service();
        store
            .set(
                HISTORY_KEY,
                r#"[{"id":"history_1","timestamp":"2024-03-01T08:00:00Z","instruction":"a","status":"success"}]"#,
            )
            .await
            .unwrap();
        let items = svc.list().await;
        assert_eq!(items.len(), 1);
        assert!(items[0].versions.is_empty());
    }

    #[tokio::test]
    async fn search_is_case_insensitive_and_blank_lists_all() {
        let (svc, _) = service();
        let now = Utc::now();
        svc.add(item("Add a BOW", now, HistoryStatus::Success)).await.unwrap();
        svc.add(item("换成蓝色水晶", now, HistoryStatus::Success)).await.unwrap();

        assert_eq!(svc.search("bow").await.len(), 1);
        assert_eq!(svc.search("水晶").await.len(), 1);
        assert_eq!(svc.search("   ").await.len(), 2);
    }

    #[tokio::test]
    async fn time_filters_use_local_midnight() {
        let (svc, _) = service();
        let now = Local::now();
        let midnight = local_midnight(now);

        svc.add(item("today", midnight + Duration::seconds(1), HistoryStatus::Success)).await.unwrap();
        svc.add(item("yesterday", midnight - Duration::hours(1), HistoryStatus::Success)).await.unwrap();
        svc.add(item("last month", midnight - Duration::days(20), HistoryStatus::Success)).await.unwrap();
        svc.add(item("ancient", midnight - Duration::days(90), HistoryStatus::Success)).await.unwrap();

        let names = |items: Vec<HistoryItem>| items.into_iter().map(|h| h.instruction).collect::<Vec<_>>();
        assert_eq!(names(svc.filter_by_time_at(TimeFilter::Today, now).await), vec!["today"]);
        assert_eq!(
            names(svc.filter_by_time_at(TimeFilter::Week, now).await),
            vec!["today", "yesterday"]
        );
        assert_eq!(svc.filter_by_time_at(TimeFilter::Month, now).await.len(), 3);
        assert_eq!(
            names(svc.filter_by_time_at(TimeFilter::All, now).await),
            vec!["today", "yesterday", "last month", "ancient"]
        );
    }

    #[tokio::test]
    async fn delete_clear_and_stats() {
        let (svc, _) = service();
        let now = Utc::now();
        let a = svc.add(item("a", now, HistoryStatus::Success)).await.unwrap();
        svc.add(item("b", now, HistoryStatus::Failed)).await.unwrap();

        let stats = svc.stats().await;
        assert_eq!((stats.total, stats.success, stats.failed), (2, 1, 1));
        assert!((stats.total_cost - 0.30).abs() < 1e-9);

        svc.delete(&a.id).await.unwrap();
        assert_eq!(svc.list().await.len(), 1);

        svc.clear().await.unwrap();
        assert!(svc.list().await.is_empty());
    }

    #[tokio::test]
    async fn corrupted_history_loads_as_empty() {
        let (svc, store) = service();
        store.set(HISTORY_KEY, "[{]").await.unwrap();
        assert!(svc.list().await.is_empty());
        assert_eq!(svc.stats().await.total, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_adds_are_all_kept() {
        let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::in_memory().await.unwrap());
        let svc = HistoryService::new(store);

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let svc = svc.clone();
                tokio::spawn(async move {
                    svc.add(item(&format!("第{}次", i), Utc::now(), HistoryStatus::Success))
                        .await
                        .unwrap()
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(svc.list().await.len(), 8);
        assert_eq!(svc.stats().await.success, 8);
    }
}
