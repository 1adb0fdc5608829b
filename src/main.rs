use anyhow::Result;
use charm_studio::{data_dir, open_app};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let dir = data_dir();
    let app = open_app(&dir).await?;

    let canvases = app.workspace.canvas_service().stats().await;
    let history = app.workspace.history().stats().await;
    let settings = app.settings.get().await;

    log::info!("Data directory: {}", dir.display());
    log::info!(
        "Canvases: {} ({} versions, {} updated in the last 24h)",
        canvases.total,
        canvases.total_versions,
        canvases.recent_count
    );
    log::info!(
        "History: {} generations ({} succeeded, {} failed, total cost {:.2})",
        history.total,
        history.success,
        history.failed,
        history.total_cost
    );
    log::info!("Gallery items: {}", app.catalog.items().len());
    if settings.is_configured() {
        log::info!("Provider: {} (image model {})", settings.base_url(), settings.image_model);
    } else {
        log::warn!("API settings are not configured; generation requests will fail");
    }
    if let Some(id) = app.workspace.active_canvas_id().await {
        log::info!("Active canvas: {}", id);
    }
    Ok(())
}
