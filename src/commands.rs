//! User intents on the design workspace.
//!
//! [`Workspace`] is the single owner of mutable workspace state. Every intent
//! locks the state briefly, releases it before talking to the model provider,
//! and re-locks to apply the result. A result that comes back after its canvas
//! was switched away is written into that canvas's stored record instead of
//! the live session.

use crate::api::{ChatContext, DesignApi, GenerateRequest};
use crate::canvases::{canvas_name, new_canvas_id, CanvasService};
use crate::gallery::CatalogItem;
use crate::history::HistoryService;
use crate::models::{
    ChatMessage, DesignCanvas, GenerationStep, HistoryItem, HistoryStatus, ImageAnalysis, MessageRole,
    MessageStatus, GALLERY_INSTRUCTION, REFERENCE_VERSION_ID, UPLOAD_INSTRUCTION,
};
use crate::presets::{detect_style, StyleHint};
use crate::session::{CanvasSession, SessionError};
use crate::state::WorkspaceState;
use crate::storage::KeyValueStore;
use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Provider charge recorded per successful generation.
pub const GENERATION_API_COST: f64 = 0.15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Generation,
    Chat,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    request_id: Uuid,
    kind: RequestKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    Generated { version_id: String, image_url: String },
    Failed { message: String },
    Cancelled,
    /// The canvas was deleted while the request ran.
    Discarded,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatOutcome {
    Replied { message: String },
    Failed { message: String },
    Cancelled,
    Discarded,
}

/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct Workspace {
    state: Arc<Mutex<WorkspaceState>>,
    canvases: CanvasService,
    history: HistoryService,
    api: Arc<dyn DesignApi>,
    in_flight: Arc<DashMap<String, InFlight>>,
    cancelled_requests: Arc<DashMap<Uuid, bool>>,
    // Provider conversation id per canvas
    chat_sessions: Arc<DashMap<String, String>>,
}

impl Workspace {
    /// Restores the persisted canvases and reactivates the stored current canvas.
    pub async fn open(store: Arc<dyn KeyValueStore>, api: Arc<dyn DesignApi>) -> Self {
        let canvases = CanvasService::new(store.clone());
        let history = HistoryService::new(store);

        let stored = canvases.load_canvases().await;
        let current = canvases.current_canvas_id().await;
        log::info!(
            "Opening workspace with {} canvases (current: {:?})",
            stored.len(),
            current
        );
        let state = WorkspaceState::restore(stored, current.as_deref());

        Self {
            state: Arc::new(Mutex::new(state)),
            canvases,
            history,
            api,
            in_flight: Arc::new(DashMap::new()),
            cancelled_requests: Arc::new(DashMap::new()),
            chat_sessions: Arc::new(DashMap::new()),
        }
    }

    pub fn history(&self) -> &HistoryService {
        &self.history
    }

    pub fn canvas_service(&self) -> &CanvasService {
        &self.canvases
    }

    // --- Queries ---

    /// Canvas collection with the live session folded in, most recent first.
    pub async fn list_canvases(&self) -> Vec<DesignCanvas> {
        let mut state = self.state.lock().await;
        state.snapshot_active();
        let mut canvases = state.canvases().to_vec();
        canvases.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        canvases
    }

    pub async fn active_canvas_id(&self) -> Option<String> {
        self.state.lock().await.active_canvas_id().map(str::to_string)
    }

    /// Copy of the live session of the active canvas.
    pub async fn active_session(&self) -> Option<CanvasSession> {
        self.state.lock().await.session().cloned()
    }

    pub fn is_generating(&self, canvas_id: &str) -> bool {
        self.in_flight
            .get(canvas_id)
            .is_some_and(|r| r.kind == RequestKind::Generation)
    }

    pub fn is_chatting(&self, canvas_id: &str) -> bool {
        self.in_flight
            .get(canvas_id)
            .is_some_and(|r| r.kind == RequestKind::Chat)
    }

    // --- Canvas management ---

    pub async fn create_canvas(&self, name: Option<&str>) -> Result<DesignCanvas> {
        let mut state = self.state.lock().await;
        let canvas = DesignCanvas::empty(new_canvas_id(), canvas_name(name, state.canvases().len()));
        let created = state.create_canvas(canvas).clone();
        log::info!("Created canvas {} ({})", created.id, created.name);
        self.persist(&mut state).await;
        Ok(created)
    }

    pub async fn switch_canvas(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.switch_canvas(id)?;
        log::info!("Switched to canvas {}", id);
        self.persist(&mut state).await;
        Ok(())
    }

    /// Returns `false` when no canvas had that id.
    pub async fn delete_canvas(&self, id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.remove_canvas(id) {
            Ok(_) => {
                self.cancel(id);
                self.chat_sessions.remove(id);
                log::info!("Deleted canvas {}", id);
                self.persist(&mut state).await;
                Ok(true)
            }
            Err(SessionError::CanvasNotFound(_)) => {
                log::warn!("Attempted to delete non-existent canvas: {}", id);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Saves the active canvas, refreshing its timestamp and thumbnail.
    pub async fn save_active(&self) -> Result<Option<DesignCanvas>> {
        let mut state = self.state.lock().await;
        let Some(id) = state.active_canvas_id().map(str::to_string) else {
            return Ok(None);
        };
        state.snapshot_active();
        state.touch(&id);
        let Some(canvas) = state.canvas(&id).cloned() else {
            return Ok(None);
        };
        let saved = self.canvases.save_canvas(&canvas).await?;
        self.canvases.set_current_canvas_id(Some(&id)).await?;
        Ok(Some(saved))
    }

    // --- Versions ---

    pub async fn create_blank_version(&self) -> Result<()> {
        self.edit_active(|session| {
            session.create_blank_version();
            Ok(())
        })
        .await
    }

    pub async fn select_version(&self, version_id: &str) -> Result<()> {
        self.edit_active(|session| session.select_version(version_id)).await
    }

    pub async fn delete_version(&self, version_id: &str) -> Result<()> {
        self.edit_active(|session| session.delete_version(version_id).map(|_| ()))
            .await
    }

    // --- Reference images ---

    /// Starts the active canvas over from an uploaded image. `v0` exists when
    /// this returns; the returned task resolves the analysis in the background.
    pub async fn upload_reference(&self, url: &str, base64: Option<String>) -> Result<JoinHandle<()>> {
        let (canvas_id, uploaded_at) = {
            let mut state = self.state.lock().await;
            let canvas_id = self.ensure_active(&mut state);
            self.ensure_idle(&canvas_id)?;
            let session = state.session_mut().ok_or(SessionError::NoActiveCanvas)?;
            let uploaded_at = session.load_reference(url, base64.clone(), UPLOAD_INSTRUCTION).timestamp;
            state.touch(&canvas_id);
            self.persist(&mut state).await;
            (canvas_id, uploaded_at)
        };
        log::info!("Reference uploaded to canvas {}", canvas_id);

        let workspace = self.clone();
        let image = base64.unwrap_or_else(|| url.to_string());
        Ok(tokio::spawn(async move {
            workspace.resolve_reference_analysis(canvas_id, uploaded_at, image).await;
        }))
    }

    /// Starts the active canvas over from a gallery product. The catalog
    /// already carries its analysis, so no request is made.
    pub async fn select_from_gallery(&self, item: &CatalogItem) -> Result<()> {
        let mut state = self.state.lock().await;
        let canvas_id = self.ensure_active(&mut state);
        self.ensure_idle(&canvas_id)?;
        let session = state.session_mut().ok_or(SessionError::NoActiveCanvas)?;

        session.load_reference(&item.image_url(), None, GALLERY_INSTRUCTION);
        session.attach_analysis(REFERENCE_VERSION_ID, item.analysis.clone())?;

        let style = item.analysis.style.tags.first().map(String::as_str).unwrap_or("未识别");
        session.push_message(ChatMessage::assistant(format!(
            "已选择 {} 风格的参考图。检测到元素：{}。请告诉我你想要的修改。",
            style,
            element_list(&item.analysis)
        )));
        session.record_transcript(REFERENCE_VERSION_ID)?;
        session.set_step(GenerationStep::Idle);

        state.touch(&canvas_id);
        log::info!("Gallery item {} selected on canvas {}", item.id, canvas_id);
        self.persist(&mut state).await;
        Ok(())
    }

    // `uploaded_at` identifies the v0 this analysis belongs to
    async fn resolve_reference_analysis(&self, canvas_id: String, uploaded_at: DateTime<Utc>, image: String) {
        let result = self.api.analyze_image(&image, true).await;

        let mut state = self.state.lock().await;
        let applied = state.with_session(&canvas_id, |session| {
            // A newer upload replaced v0 while this one was analyzed
            if session.version(REFERENCE_VERSION_ID).map(|v| v.timestamp) != Some(uploaded_at) {
                return false;
            }
            match result {
                Ok(analysis) => {
                    let message = format!(
                        "已分析参考图：检测到{}等元素。请告诉我你想要的修改，例如：「把粉色贝壳换成蓝色水晶」或「增加星星装饰」。",
                        element_list(&analysis)
                    );
                    if session.attach_analysis(REFERENCE_VERSION_ID, analysis).is_err() {
                        return false;
                    }
                    session.push_message(ChatMessage::assistant(message));
                }
                Err(e) => {
                    log::error!("Reference analysis failed for canvas {}: {:?}", canvas_id, e);
                    session.push_message(ChatMessage::new(
                        MessageRole::Assistant,
                        format!("参考图分析失败：{}。你仍然可以直接描述想要的修改。", e),
                        MessageStatus::Error,
                    ));
                }
            }
            if let Err(e) = session.record_transcript(REFERENCE_VERSION_ID) {
                log::warn!("Could not record reference transcript on canvas {}: {}", canvas_id, e);
            }
            session.set_step(GenerationStep::Idle);
            true
        });

        match applied {
            Ok(true) => self.persist(&mut state).await,
            Ok(false) => log::warn!("Discarding stale analysis for canvas {}", canvas_id),
            Err(e) => log::warn!("Discarding analysis for canvas {}: {}", canvas_id, e),
        }
    }

    // --- Model requests ---

    /// Generates a new version from `instruction`: an edit of the selected
    /// version, or text-to-image in blank mode. The transcript grows by the
    /// user message and one assistant reply whatever the outcome.
    pub async fn generate(&self, instruction: &str, style: Option<StyleHint>) -> Result<GenerationOutcome> {
        let instruction = instruction.trim();
        if instruction.is_empty() {
            anyhow::bail!("Instruction cannot be empty");
        }

        let (canvas_id, mut guard, placeholder_id, request) = {
            let mut state = self.state.lock().await;
            let canvas_id = self.ensure_active(&mut state);
            let mut guard = self.begin(&canvas_id, RequestKind::Generation)?;
            let session = state.session_mut().ok_or(SessionError::NoActiveCanvas)?;

            session.push_message(ChatMessage::user(instruction));
            let placeholder_id = session.push_message(ChatMessage::thinking());
            guard.track(&placeholder_id);
            session.set_step(GenerationStep::Generating);

            let request = GenerateRequest {
                instruction: instruction.to_string(),
                reference_image: session.generation_reference(),
                session_id: self.chat_sessions.get(&canvas_id).map(|s| s.clone()),
                style_hint: style.or_else(|| detect_style(instruction)),
            };
            state.touch(&canvas_id);
            self.persist(&mut state).await;
            (canvas_id, guard, placeholder_id, request)
        };

        log::info!("Generating on canvas {} (request {})", canvas_id, guard.request_id);
        let result = self.api.generate_design(&request).await;
        let cancelled = guard.release();

        let mut state = self.state.lock().await;
        let applied = state.with_session(&canvas_id, |session| {
            if cancelled {
                session.resolve_message(&placeholder_id, "已取消生成。", MessageStatus::Complete);
                session.set_step(GenerationStep::Idle);
                return (GenerationOutcome::Cancelled, None);
            }

            match result {
                Ok(response) if response.success && response.image_url.is_some() => {
                    let image_url = response.image_url.unwrap_or_default();
                    session.resolve_message(
                        &placeholder_id,
                        format!("已完成「{}」的修改。\n\n你可以继续调整，或点击「导出」保存设计。", instruction),
                        MessageStatus::Complete,
                    );
                    let version_id = session.push_generated(&image_url, instruction, response.analysis).id.clone();
                    let item = history_item(session, instruction, &image_url, HistoryStatus::Success);
                    (GenerationOutcome::Generated { version_id, image_url }, Some(item))
                }
                Ok(response) => {
                    let message = response.message;
                    session.fail_generation(message.clone());
                    session.resolve_message(
                        &placeholder_id,
                        format!("抱歉，生成失败：{}。请稍后重试。", message),
                        MessageStatus::Error,
                    );
                    let item = history_item(session, instruction, "", HistoryStatus::Failed);
                    (GenerationOutcome::Failed { message }, Some(item))
                }
                Err(e) => {
                    let message = e.to_string();
                    session.fail_generation(message.clone());
                    session.resolve_message(
                        &placeholder_id,
                        format!("抱歉，发生错误：{}。请检查网络连接后重试。", message),
                        MessageStatus::Error,
                    );
                    let item = history_item(session, instruction, "", HistoryStatus::Failed);
                    (GenerationOutcome::Failed { message }, Some(item))
                }
            }
        });

        guard.settle();
        let (outcome, item) = match applied {
            Ok(applied) => applied,
            Err(e) => {
                log::warn!("Discarding generation result for canvas {}: {}", canvas_id, e);
                return Ok(GenerationOutcome::Discarded);
            }
        };

        if matches!(outcome, GenerationOutcome::Generated { .. }) {
            self.chat_sessions
                .entry(canvas_id.clone())
                .or_insert_with(|| Utc::now().timestamp_millis().to_string());
        }
        state.touch(&canvas_id);
        self.persist(&mut state).await;
        drop(state);

        match &outcome {
            GenerationOutcome::Generated { version_id, .. } => {
                log::info!("Canvas {} now at {}", canvas_id, version_id)
            }
            GenerationOutcome::Failed { message } => {
                log::error!("Generation failed on canvas {}: {}", canvas_id, message)
            }
            _ => log::warn!("Generation on canvas {} was cancelled", canvas_id),
        }

        if let Some(item) = item {
            if let Err(e) = self.history.add(item).await {
                log::error!("Failed to record history for canvas {}: {:?}", canvas_id, e);
            }
        }
        Ok(outcome)
    }

    /// Talks to the design assistant about the active canvas without
    /// generating an image.
    pub async fn chat(&self, content: &str) -> Result<ChatOutcome> {
        let content = content.trim();
        if content.is_empty() {
            anyhow::bail!("Message cannot be empty");
        }

        let (canvas_id, mut guard, placeholder_id, transcript, context) = {
            let mut state = self.state.lock().await;
            let canvas_id = self.ensure_active(&mut state);
            let mut guard = self.begin(&canvas_id, RequestKind::Chat)?;
            let session = state.session_mut().ok_or(SessionError::NoActiveCanvas)?;

            session.push_message(ChatMessage::user(content));
            // Earlier failures and placeholders are not part of the conversation
            let transcript: Vec<ChatMessage> = session
                .messages()
                .iter()
                .filter(|m| m.status == MessageStatus::Complete)
                .cloned()
                .collect();
            let placeholder_id = session.push_message(ChatMessage::thinking());
            guard.track(&placeholder_id);
            let context = ChatContext {
                analysis: session.analysis().cloned(),
                style: detect_style(content),
            };
            state.touch(&canvas_id);
            self.persist(&mut state).await;
            (canvas_id, guard, placeholder_id, transcript, context)
        };

        let session_id = self.chat_sessions.get(&canvas_id).map(|s| s.clone());
        let result = self.api.chat(&transcript, session_id.as_deref(), &context).await;
        let cancelled = guard.release();

        let mut state = self.state.lock().await;
        let applied = state.with_session(&canvas_id, |session| {
            if cancelled {
                session.resolve_message(&placeholder_id, "已取消。", MessageStatus::Complete);
                return ChatOutcome::Cancelled;
            }
            match &result {
                Ok(reply) => {
                    session.resolve_message(&placeholder_id, reply.message.clone(), MessageStatus::Complete);
                    ChatOutcome::Replied {
                        message: reply.message.clone(),
                    }
                }
                Err(e) => {
                    log::error!("Chat failed on canvas {}: {:?}", canvas_id, e);
                    let message = e.to_string();
                    session.resolve_message(
                        &placeholder_id,
                        format!("抱歉，发生错误：{}。请检查网络连接后重试。", message),
                        MessageStatus::Error,
                    );
                    ChatOutcome::Failed { message }
                }
            }
        });

        guard.settle();
        let outcome = match applied {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!("Discarding chat reply for canvas {}: {}", canvas_id, e);
                return Ok(ChatOutcome::Discarded);
            }
        };

        if let (ChatOutcome::Replied { .. }, Ok(reply)) = (&outcome, &result) {
            if !reply.session_id.is_empty() {
                self.chat_sessions.insert(canvas_id.clone(), reply.session_id.clone());
            }
        }
        self.persist(&mut state).await;
        Ok(outcome)
    }

    /// Flags the request running on `canvas_id`; its result is dropped when it
    /// returns. Returns `false` when nothing was running.
    pub fn cancel(&self, canvas_id: &str) -> bool {
        match self.in_flight.get(canvas_id) {
            Some(request) => {
                self.cancelled_requests.insert(request.request_id, true);
                log::warn!("Cancellation requested for {:?} on canvas {}", request.kind, canvas_id);
                true
            }
            None => false,
        }
    }

    // --- Internals ---

    async fn edit_active(
        &self,
        f: impl FnOnce(&mut CanvasSession) -> Result<(), SessionError>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let canvas_id = state
            .active_canvas_id()
            .map(str::to_string)
            .ok_or(SessionError::NoActiveCanvas)?;
        let session = state.session_mut().ok_or(SessionError::NoActiveCanvas)?;
        f(session)?;
        state.touch(&canvas_id);
        self.persist(&mut state).await;
        Ok(())
    }

    // Activates a fresh canvas when the workspace has none
    fn ensure_active(&self, state: &mut WorkspaceState) -> String {
        if let Some(id) = state.active_canvas_id() {
            return id.to_string();
        }
        let canvas = DesignCanvas::empty(new_canvas_id(), canvas_name(None, state.canvases().len()));
        log::info!("No active canvas, created {}", canvas.id);
        state.create_canvas(canvas).id.clone()
    }

    fn ensure_idle(&self, canvas_id: &str) -> Result<(), SessionError> {
        if self.in_flight.contains_key(canvas_id) {
            return Err(SessionError::Busy(canvas_id.to_string()));
        }
        Ok(())
    }

    fn begin(&self, canvas_id: &str, kind: RequestKind) -> Result<RequestGuard, SessionError> {
        match self.in_flight.entry(canvas_id.to_string()) {
            Entry::Occupied(_) => Err(SessionError::Busy(canvas_id.to_string())),
            Entry::Vacant(slot) => {
                let request_id = Uuid::new_v4();
                slot.insert(InFlight { request_id, kind });
                Ok(RequestGuard {
                    workspace: self.clone(),
                    canvas_id: canvas_id.to_string(),
                    request_id,
                    placeholder_id: None,
                })
            }
        }
    }

    // Resolves the placeholder of a request whose caller went away
    async fn abandon(&self, canvas_id: String, placeholder_id: String) {
        let mut state = self.state.lock().await;
        let applied = state.with_session(&canvas_id, |session| {
            session.resolve_message(&placeholder_id, "请求已中断，请重试。", MessageStatus::Error);
            if session.step() == GenerationStep::Generating {
                session.set_step(GenerationStep::Idle);
            }
        });
        match applied {
            Ok(()) => self.persist(&mut state).await,
            Err(e) => log::warn!("Dropping interrupted request on canvas {}: {}", canvas_id, e),
        }
    }

    async fn persist(&self, state: &mut WorkspaceState) {
        state.snapshot_active();
        if let Err(e) = self.canvases.save_canvases(state.canvases()).await {
            log::error!("Failed to persist canvases: {:?}", e);
        }
        if let Err(e) = self.canvases.set_current_canvas_id(state.active_canvas_id()).await {
            log::error!("Failed to persist current canvas id: {:?}", e);
        }
    }
}

/// Holds the in-flight slot of one canvas for the life of a request.
///
/// Dropping the guard frees the slot. If the request's placeholder was never
/// settled, because the caller's future was dropped mid-request, the
/// placeholder is resolved as interrupted on a background task.
struct RequestGuard {
    workspace: Workspace,
    canvas_id: String,
    request_id: Uuid,
    placeholder_id: Option<String>,
}

impl RequestGuard {
    fn track(&mut self, placeholder_id: &str) {
        self.placeholder_id = Some(placeholder_id.to_string());
    }

    // Frees the canvas and reports whether the request was cancelled
    fn release(&mut self) -> bool {
        self.workspace
            .in_flight
            .remove_if(&self.canvas_id, |_, r| r.request_id == self.request_id);
        self.workspace.cancelled_requests.remove(&self.request_id).is_some()
    }

    // The result has been applied to the transcript
    fn settle(&mut self) {
        self.placeholder_id = None;
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.release();
        let Some(placeholder_id) = self.placeholder_id.take() else {
            return;
        };
        log::warn!(
            "Request {} on canvas {} was dropped before it finished",
            self.request_id,
            self.canvas_id
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let workspace = self.workspace.clone();
                let canvas_id = self.canvas_id.clone();
                handle.spawn(async move {
                    workspace.abandon(canvas_id, placeholder_id).await;
                });
            }
            Err(_) => log::warn!("No runtime left to resolve placeholder {}", placeholder_id),
        }
    }
}

fn element_list(analysis: &ImageAnalysis) -> String {
    let primary = analysis.primary_summary();
    if primary.is_empty() {
        "未识别".to_string()
    } else {
        primary
    }
}

fn history_item(session: &CanvasSession, instruction: &str, generated_url: &str, status: HistoryStatus) -> HistoryItem {
    HistoryItem {
        id: String::new(),
        timestamp: Utc::now(),
        instruction: instruction.to_string(),
        reference_url: session.reference_image().unwrap_or_default().to_string(),
        generated_url: generated_url.to_string(),
        versions: session.versions().to_vec(),
        versions_count: session.versions().len(),
        status,
        cost: match status {
            HistoryStatus::Success => GENERATION_API_COST,
            HistoryStatus::Failed => 0.0,
        },
        cost_breakdown: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ChatReply, DesignResponse};
    use crate::storage::MemoryStore;
    use async_trait::async_trait;

    // Provider double that always fails
    struct Offline;

    #[async_trait]
    impl DesignApi for Offline {
        async fn analyze_image(&self, _image: &str, _include_similar: bool) -> Result<ImageAnalysis> {
            anyhow::bail!("offline")
        }

        async fn chat(&self, _: &[ChatMessage], _: Option<&str>, _: &ChatContext) -> Result<ChatReply> {
            anyhow::bail!("offline")
        }

        async fn generate_design(&self, _request: &GenerateRequest) -> Result<DesignResponse> {
            Ok(DesignResponse::failed("offline"))
        }
    }

    async fn workspace() -> Workspace {
        Workspace::open(Arc::new(MemoryStore::new()), Arc::new(Offline)).await
    }

    #[tokio::test]
    async fn second_request_on_busy_canvas_is_rejected() {
        let ws = workspace().await;
        let canvas = ws.create_canvas(None).await.unwrap();
        let mut request = ws.begin(&canvas.id, RequestKind::Generation).unwrap();

        assert!(ws.is_generating(&canvas.id));
        let err = ws.generate("加一个蝴蝶结", None).await.unwrap_err();
        assert_eq!(err.downcast_ref::<SessionError>(), Some(&SessionError::Busy(canvas.id.clone())));
        assert!(ws.chat("你好").await.is_err());

        assert!(!request.release());
        assert!(!ws.is_generating(&canvas.id));
    }

    #[tokio::test]
    async fn cancel_marks_running_request() {
        let ws = workspace().await;
        assert!(!ws.cancel("nothing"));
        let mut request = ws.begin("c", RequestKind::Chat).unwrap();
        assert!(ws.is_chatting("c"));
        assert!(ws.cancel("c"));
        assert!(request.release());
    }

    #[tokio::test]
    async fn dropping_a_request_frees_the_canvas() {
        let ws = workspace().await;
        let request = ws.begin("c", RequestKind::Generation).unwrap();
        ws.cancel("c");
        drop(request);
        assert!(!ws.is_generating("c"));
        assert!(ws.cancelled_requests.is_empty());
        assert!(ws.begin("c", RequestKind::Chat).is_ok());
    }

    #[tokio::test]
    async fn chat_failure_rewrites_placeholder() {
        let ws = workspace().await;
        let outcome = ws.chat("有什么建议？").await.unwrap();
        assert_eq!(outcome, ChatOutcome::Failed { message: "offline".into() });

        let session = ws.active_session().await.unwrap();
        assert_eq!(session.messages().len(), 2);
        let reply = &session.messages()[1];
        assert_eq!(reply.status, MessageStatus::Error);
        assert!(reply.content.contains("offline"));
    }

    #[tokio::test]
    async fn empty_instruction_is_rejected() {
        let ws = workspace().await;
        assert!(ws.generate("   ", None).await.is_err());
        assert!(ws.active_canvas_id().await.is_none());
    }

    #[tokio::test]
    async fn version_edits_need_an_active_canvas() {
        let ws = workspace().await;
        let err = ws.create_blank_version().await.unwrap_err();
        assert_eq!(err.downcast_ref::<SessionError>(), Some(&SessionError::NoActiveCanvas));
    }

    #[tokio::test]
    async fn delete_unknown_canvas_returns_false() {
        let ws = workspace().await;
        assert!(!ws.delete_canvas("missing").await.unwrap());
    }
}
