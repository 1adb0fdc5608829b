use crate::models::DesignCanvas;
use crate::session::{CanvasSession, SessionError};
use chrono::Utc;

// The canvas currently on screen and its live state
#[derive(Debug, Clone)]
struct ActiveCanvas {
    id: String,
    session: CanvasSession,
}

/// In-memory canvas collection plus the live session of the active canvas.
///
/// The stored record of the active canvas lags behind its session until
/// [`WorkspaceState::snapshot_active`] runs; every operation that changes which
/// canvas is active snapshots first.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceState {
    canvases: Vec<DesignCanvas>,
    active: Option<ActiveCanvas>,
}

impl WorkspaceState {
    /// Restores a persisted collection, activating `current_id` when it exists.
    pub fn restore(canvases: Vec<DesignCanvas>, current_id: Option<&str>) -> Self {
        let mut state = Self {
            canvases,
            active: None,
        };
        if let Some(id) = current_id {
            if state.switch_canvas(id).is_err() {
                log::warn!("Stored current canvas {} no longer exists", id);
            }
        }
        state
    }

    pub fn canvases(&self) -> &[DesignCanvas] {
        &self.canvases
    }

    pub fn canvas(&self, id: &str) -> Option<&DesignCanvas> {
        self.canvases.iter().find(|c| c.id == id)
    }

    pub fn active_canvas_id(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.id.as_str())
    }

    pub fn session(&self) -> Option<&CanvasSession> {
        self.active.as_ref().map(|a| &a.session)
    }

    pub fn session_mut(&mut self) -> Option<&mut CanvasSession> {
        self.active.as_mut().map(|a| &mut a.session)
    }

    /// Copies the live session into the collection and refreshes its thumbnail.
    pub fn snapshot_active(&mut self) {
        let Some(active) = &self.active else {
            return;
        };
        if let Some(canvas) = self.canvases.iter_mut().find(|c| c.id == active.id) {
            active.session.write_into(canvas);
            canvas.thumbnail = canvas.latest_image().map(str::to_string);
        }
    }

    /// Marks a canvas as modified now.
    pub fn touch(&mut self, id: &str) {
        if let Some(canvas) = self.canvases.iter_mut().find(|c| c.id == id) {
            canvas.updated_at = Utc::now();
        }
    }

    /// Snapshots the outgoing canvas, then adds `canvas` at the front and activates it.
    pub fn create_canvas(&mut self, canvas: DesignCanvas) -> &DesignCanvas {
        self.snapshot_active();
        let session = CanvasSession::from_canvas(&canvas);
        self.active = Some(ActiveCanvas {
            id: canvas.id.clone(),
            session,
        });
        self.canvases.insert(0, canvas);
        &self.canvases[0]
    }

    /// Snapshots the outgoing canvas and loads `id`. An unknown id leaves
    /// everything untouched.
    pub fn switch_canvas(&mut self, id: &str) -> Result<(), SessionError> {
        let incoming = self
            .canvas(id)
            .map(CanvasSession::from_canvas)
            .ok_or_else(|| SessionError::CanvasNotFound(id.to_string()))?;

        if self.active_canvas_id() == Some(id) {
            return Ok(());
        }

        self.snapshot_active();
        self.active = Some(ActiveCanvas {
            id: id.to_string(),
            session: incoming,
        });
        Ok(())
    }

    /// Drops a canvas from the collection. Removing the active canvas leaves
    /// nothing active.
    pub fn remove_canvas(&mut self, id: &str) -> Result<DesignCanvas, SessionError> {
        let index = self
            .canvases
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| SessionError::CanvasNotFound(id.to_string()))?;

        if self.active_canvas_id() == Some(id) {
            self.active = None;
        }
        Ok(self.canvases.remove(index))
    }

    /// Runs `f` against the session of canvas `id`, whether or not it is the
    /// active one. Inactive canvases are materialized and written straight back.
    pub fn with_session<T>(
        &mut self,
        id: &str,
        f: impl FnOnce(&mut CanvasSession) -> T,
    ) -> Result<T, SessionError> {
        if let Some(active) = self.active.as_mut().filter(|a| a.id == id) {
            return Ok(f(&mut active.session));
        }

        let canvas = self
            .canvases
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| SessionError::CanvasNotFound(id.to_string()))?;
        let mut session = CanvasSession::from_canvas(canvas);
        let out = f(&mut session);
        session.write_into(canvas);
        canvas.thumbnail = canvas.latest_image().map(str::to_string);
        Ok(out)
    }
}
