//! Live version state of the canvas being edited.
//!
//! A [`CanvasSession`] is the materialized, mutable form of one
//! [`DesignCanvas`]. It moves between four phases:
//!
//! - `Idle`: nothing uploaded or generated yet.
//! - `HasReference`: only the reference version `v0` exists.
//! - `Versioned`: at least one generated version exists.
//! - `BlankPending`: the user asked for a fresh text-to-image slot; history is kept
//!   but no version is selected.
//!
//! Every version carries the chat transcript and analysis that were on screen
//! when it was produced, so selecting a version restores both.

use crate::models::{
    ChatMessage, DesignCanvas, GenerationStep, ImageAnalysis, ImageVersion, MessageStatus,
    REFERENCE_VERSION_ID,
};
use chrono::Utc;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("version {0} not found")]
    VersionNotFound(String),
    #[error("the reference version cannot be deleted")]
    ReferenceUndeletable,
    #[error("canvas {0} not found")]
    CanvasNotFound(String),
    #[error("no canvas is active")]
    NoActiveCanvas,
    #[error("a request is already running on canvas {0}")]
    Busy(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    HasReference,
    Versioned,
    BlankPending,
}

/// One entry of the per-version snapshot log.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VersionSnapshot<'a> {
    pub version_id: &'a str,
    pub messages: Option<&'a [ChatMessage]>,
    pub analysis: Option<&'a ImageAnalysis>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CanvasSession {
    versions: Vec<ImageVersion>,
    current_version_id: Option<String>,
    is_blank_mode: bool,
    reference_image: Option<String>,
    reference_base64: Option<String>,
    messages: Vec<ChatMessage>,
    analysis: Option<ImageAnalysis>,
    // Next number handed to a generated version; never decremented
    next_version: u32,
    step: GenerationStep,
    generation_error: Option<String>,
}

impl Default for CanvasSession {
    fn default() -> Self {
        Self {
            versions: Vec::new(),
            current_version_id: None,
            is_blank_mode: false,
            reference_image: None,
            reference_base64: None,
            messages: Vec::new(),
            analysis: None,
            next_version: 1,
            step: GenerationStep::Idle,
            generation_error: None,
        }
    }
}

impl CanvasSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Materializes the stored state of `canvas`.
    pub fn from_canvas(canvas: &DesignCanvas) -> Self {
        let floor = canvas
            .versions
            .iter()
            .filter_map(ImageVersion::number)
            .max()
            .map_or(1, |n| n + 1);

        // A dangling selection is dropped rather than trusted
        let current_version_id = canvas
            .current_version_id
            .clone()
            .filter(|id| canvas.versions.iter().any(|v| &v.id == id));

        Self {
            versions: canvas.versions.clone(),
            current_version_id,
            is_blank_mode: canvas.is_blank_mode,
            reference_image: canvas.reference_image.clone(),
            reference_base64: canvas.reference_base64.clone(),
            messages: canvas.messages.clone(),
            analysis: canvas.analysis.clone(),
            next_version: canvas.next_version_number.max(floor).max(1),
            step: GenerationStep::Idle,
            generation_error: None,
        }
    }

    /// Copies the live state back into `canvas`. Timestamps are left alone.
    pub fn write_into(&self, canvas: &mut DesignCanvas) {
        canvas.versions = self.versions.clone();
        canvas.current_version_id = self.current_version_id.clone();
        canvas.is_blank_mode = self.is_blank_mode;
        canvas.reference_image = self.reference_image.clone();
        canvas.reference_base64 = self.reference_base64.clone();
        canvas.messages = self.messages.clone();
        canvas.analysis = self.analysis.clone();
        canvas.next_version_number = self.next_version;
    }

    pub fn versions(&self) -> &[ImageVersion] {
        &self.versions
    }

    pub fn version(&self, id: &str) -> Option<&ImageVersion> {
        self.versions.iter().find(|v| v.id == id)
    }

    pub fn current_version_id(&self) -> Option<&str> {
        self.current_version_id.as_deref()
    }

    pub fn current_version(&self) -> Option<&ImageVersion> {
        self.current_version_id.as_deref().and_then(|id| self.version(id))
    }

    pub fn is_blank_mode(&self) -> bool {
        self.is_blank_mode
    }

    pub fn reference_image(&self) -> Option<&str> {
        self.reference_image.as_deref()
    }

    pub fn reference_base64(&self) -> Option<&str> {
        self.reference_base64.as_deref()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn analysis(&self) -> Option<&ImageAnalysis> {
        self.analysis.as_ref()
    }

    pub fn step(&self) -> GenerationStep {
        self.step
    }

    pub fn generation_error(&self) -> Option<&str> {
        self.generation_error.as_deref()
    }

    pub fn phase(&self) -> Phase {
        if self.is_blank_mode {
            Phase::BlankPending
        } else if self.versions.is_empty() {
            Phase::Idle
        } else if self.versions.iter().all(ImageVersion::is_reference) {
            Phase::HasReference
        } else {
            Phase::Versioned
        }
    }

    /// Image handed to the generator: none in blank mode, otherwise the
    /// selected version (its payload when it has one), then the reference.
    pub fn generation_reference(&self) -> Option<String> {
        if self.is_blank_mode {
            return None;
        }
        if let Some(version) = self.current_version() {
            if let Some(b64) = &version.base64 {
                return Some(b64.clone());
            }
            if version.url.starts_with("http") || version.url.starts_with("data:") {
                return Some(version.url.clone());
            }
        }
        self.reference_base64.clone()
    }

    /// Starts over from a new reference image as `v0`.
    pub fn load_reference(&mut self, url: &str, base64: Option<String>, instruction: &str) -> &ImageVersion {
        let reference = ImageVersion {
            id: REFERENCE_VERSION_ID.to_string(),
            url: url.to_string(),
            timestamp: Utc::now(),
            instruction: instruction.to_string(),
            analysis: None,
            messages_snapshot: None,
            parent_id: None,
            base64: base64.clone(),
        };

        self.versions = vec![reference];
        self.current_version_id = Some(REFERENCE_VERSION_ID.to_string());
        self.is_blank_mode = false;
        self.reference_image = Some(url.to_string());
        self.reference_base64 = base64;
        self.messages.clear();
        self.analysis = None;
        self.next_version = 1;
        self.step = GenerationStep::Analyzing;
        self.generation_error = None;
        &self.versions[0]
    }

    /// Attaches an analysis to a version; the live panel follows when that
    /// version is selected.
    pub fn attach_analysis(&mut self, version_id: &str, analysis: ImageAnalysis) -> Result<(), SessionError> {
        let is_current = self.current_version_id.as_deref() == Some(version_id);
        let version = self
            .versions
            .iter_mut()
            .find(|v| v.id == version_id)
            .ok_or_else(|| SessionError::VersionNotFound(version_id.to_string()))?;

        version.analysis = Some(analysis.clone());
        if is_current {
            self.analysis = Some(analysis);
        }
        Ok(())
    }

    /// Records the current transcript on a version that has none yet.
    /// Existing snapshots are never overwritten.
    pub fn record_transcript(&mut self, version_id: &str) -> Result<(), SessionError> {
        let messages = self.messages.clone();
        let version = self
            .versions
            .iter_mut()
            .find(|v| v.id == version_id)
            .ok_or_else(|| SessionError::VersionNotFound(version_id.to_string()))?;
        if version.messages_snapshot.is_none() {
            version.messages_snapshot = Some(messages);
        }
        Ok(())
    }

    /// Appends a generated version, snapshots the chat and selects it.
    pub fn push_generated(
        &mut self,
        url: &str,
        instruction: &str,
        analysis: Option<ImageAnalysis>,
    ) -> &ImageVersion {
        let id = format!("v{}", self.next_version);
        self.next_version += 1;

        let parent_id = if self.is_blank_mode {
            None
        } else {
            self.current_version_id.clone()
        };

        // An edit without its own analysis keeps describing its parent. A design
        // started from blank has nothing to inherit.
        let analysis = match analysis {
            Some(analysis) => Some(analysis),
            None if parent_id.is_some() => self.analysis.clone(),
            None => None,
        };
        self.analysis = analysis.clone();

        self.versions.push(ImageVersion {
            id: id.clone(),
            url: url.to_string(),
            timestamp: Utc::now(),
            instruction: instruction.to_string(),
            analysis,
            messages_snapshot: Some(self.messages.clone()),
            parent_id,
            base64: None,
        });
        self.current_version_id = Some(id);
        self.is_blank_mode = false;
        self.step = GenerationStep::Complete;
        self.generation_error = None;

        let last = self.versions.len() - 1;
        &self.versions[last]
    }

    /// Deselects without discarding history so the next generation starts from text only.
    pub fn create_blank_version(&mut self) {
        self.current_version_id = None;
        self.is_blank_mode = true;
    }

    pub fn select_version(&mut self, id: &str) -> Result<(), SessionError> {
        let version = self
            .version(id)
            .ok_or_else(|| SessionError::VersionNotFound(id.to_string()))?;

        let messages = version.messages_snapshot.clone();
        let analysis = version.analysis.clone();

        self.current_version_id = Some(id.to_string());
        self.is_blank_mode = false;
        if let Some(messages) = messages {
            self.messages = messages;
        }
        self.analysis = analysis;
        Ok(())
    }

    /// Removes a version. Deleting the selected one falls back to the last
    /// remaining version, or to blank mode when nothing remains.
    pub fn delete_version(&mut self, id: &str) -> Result<ImageVersion, SessionError> {
        if id == REFERENCE_VERSION_ID {
            return Err(SessionError::ReferenceUndeletable);
        }
        let index = self
            .versions
            .iter()
            .position(|v| v.id == id)
            .ok_or_else(|| SessionError::VersionNotFound(id.to_string()))?;

        let removed = self.versions.remove(index);

        if self.current_version_id.as_deref() == Some(id) {
            match self.versions.last().map(|v| v.id.clone()) {
                Some(fallback) => self.select_version(&fallback)?,
                None => self.create_blank_version(),
            }
        }
        Ok(removed)
    }

    /// Per-version (transcript, analysis) log, in version order.
    pub fn snapshot_log(&self) -> Vec<VersionSnapshot<'_>> {
        self.versions
            .iter()
            .map(|v| VersionSnapshot {
                version_id: &v.id,
                messages: v.messages_snapshot.as_deref(),
                analysis: v.analysis.as_ref(),
            })
            .collect()
    }

    pub fn push_message(&mut self, message: ChatMessage) -> String {
        let id = message.id.clone();
        self.messages.push(message);
        id
    }

    /// Rewrites a message in place. Returns `false` when the id is unknown.
    pub fn resolve_message(&mut self, id: &str, content: impl Into<String>, status: MessageStatus) -> bool {
        match self.messages.iter_mut().find(|m| m.id == id) {
            Some(message) => {
                message.content = content.into();
                message.status = status;
                true
            }
            None => false,
        }
    }

    pub fn set_step(&mut self, step: GenerationStep) {
        self.step = step;
        if step != GenerationStep::Error {
            self.generation_error = None;
        }
    }

    pub fn fail_generation(&mut self, error: impl Into<String>) {
        self.step = GenerationStep::Error;
        self.generation_error = Some(error.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageRole, UPLOAD_INSTRUCTION};

    fn analysis(tag: &str) -> ImageAnalysis {
        let mut a = ImageAnalysis::default();
        a.style.tags = vec![tag.to_string()];
        a
    }

    /// `[v0, v1]`, with v1 selected.
    fn two_versions() -> CanvasSession {
        let mut session = CanvasSession::new();
        session.load_reference("blob:ref", Some("QUJD".into()), UPLOAD_INSTRUCTION);
        session.attach_analysis("v0", analysis("reference")).unwrap();
        session.push_message(ChatMessage::user("换成蓝色水晶"));
        session.push_generated("https://img/v1.png", "换成蓝色水晶", Some(analysis("v1")));
        session
    }

    #[test]
    fn fresh_session_is_idle() {
        let session = CanvasSession::new();
        assert_eq!(session.phase(), Phase::Idle);
        assert!(session.current_version_id().is_none());
        assert!(session.versions().is_empty());
    }

    #[test]
    fn load_reference_creates_v0_and_starts_analysis() {
        let mut session = CanvasSession::new();
        session.load_reference("blob:ref", None, UPLOAD_INSTRUCTION);
        assert_eq!(session.phase(), Phase::HasReference);
        assert_eq!(session.current_version_id(), Some("v0"));
        assert_eq!(session.versions()[0].instruction, UPLOAD_INSTRUCTION);
        assert_eq!(session.step(), GenerationStep::Analyzing);
        assert!(session.analysis().is_none());
    }

    #[test]
    fn push_generated_allocates_sequential_ids() {
        let mut session = two_versions();
        assert_eq!(session.phase(), Phase::Versioned);
        let id = session.push_generated("https://img/v2.png", "加一个蝴蝶结", None).id.clone();
        assert_eq!(id, "v2");
        assert_eq!(session.current_version_id(), Some("v2"));
        assert_eq!(session.current_version().unwrap().parent_id.as_deref(), Some("v1"));
        // no new analysis keeps the previous one on screen
        assert_eq!(session.analysis(), Some(&analysis("v1")));
    }

    #[test]
    fn deleted_ids_are_not_reused() {
        let mut session = two_versions();
        session.delete_version("v1").unwrap();
        let id = session.push_generated("https://img/x.png", "again", None).id.clone();
        assert_eq!(id, "v2");
    }

    #[test]
    fn reference_version_cannot_be_deleted() {
        let mut session = two_versions();
        assert_eq!(session.delete_version("v0"), Err(SessionError::ReferenceUndeletable));
        assert_eq!(session.versions().iter().filter(|v| v.is_reference()).count(), 1);
        assert!(matches!(session.delete_version("v9"), Err(SessionError::VersionNotFound(_))));
    }

    #[test]
    fn blank_version_keeps_history() {
        let mut session = two_versions();
        session.create_blank_version();
        assert_eq!(session.phase(), Phase::BlankPending);
        assert!(session.current_version_id().is_none());
        assert!(session.is_blank_mode());
        assert_eq!(session.versions().len(), 2);
        assert!(session.generation_reference().is_none());
    }

    #[test]
    fn generating_from_blank_exits_blank_mode_without_parent() {
        let mut session = two_versions();
        session.create_blank_version();
        session.push_generated("https://img/v2.png", "一只猫咪挂件", None);
        assert!(!session.is_blank_mode());
        assert!(session.current_version().unwrap().parent_id.is_none());
    }

    #[test]
    fn select_version_restores_snapshots() {
        let mut session = two_versions();
        let v1_messages = session.versions()[1].messages_snapshot.clone().unwrap();

        session.push_message(ChatMessage::user("再加一个铃铛"));
        session.push_generated("https://img/v2.png", "再加一个铃铛", Some(analysis("v2")));
        session.create_blank_version();

        session.select_version("v1").unwrap();
        assert!(!session.is_blank_mode());
        assert_eq!(session.messages(), v1_messages.as_slice());
        assert_eq!(session.analysis(), Some(&analysis("v1")));
        assert!(session.select_version("nope").is_err());
    }

    #[test]
    fn selecting_unanalyzed_reference_clears_panel() {
        let mut session = CanvasSession::new();
        session.load_reference("blob:ref", None, UPLOAD_INSTRUCTION);
        session.push_generated("https://img/v1.png", "换成蓝色水晶", Some(analysis("v1")));

        session.select_version("v0").unwrap();
        assert!(session.analysis().is_none());

        session.select_version("v1").unwrap();
        assert_eq!(session.analysis(), Some(&analysis("v1")));
    }

    #[test]
    fn edit_without_analysis_inherits_parent_analysis() {
        let mut session = two_versions();
        session.push_generated("https://img/v2.png", "加一个蝴蝶结", None);
        assert_eq!(session.versions()[2].analysis, Some(analysis("v1")));

        session.select_version("v0").unwrap();
        assert_eq!(session.analysis(), Some(&analysis("reference")));
        session.select_version("v2").unwrap();
        assert_eq!(session.analysis(), Some(&analysis("v1")));

        session.create_blank_version();
        session.push_generated("https://img/v3.png", "一只猫咪挂件", None);
        assert!(session.analysis().is_none());
        assert!(session.versions()[3].analysis.is_none());
    }

    #[test]
    fn deleting_current_falls_back_to_last_remaining() {
        let mut session = two_versions();
        session.push_generated("https://img/v2.png", "b", None);
        session.create_blank_version();
        session.select_version("v2").unwrap();

        session.delete_version("v2").unwrap();
        assert_eq!(session.current_version_id(), Some("v1"));
        assert!(!session.is_blank_mode());
    }

    #[test]
    fn deleting_last_version_enters_blank_mode() {
        let mut session = CanvasSession::new();
        session.push_generated("https://img/v1.png", "text to image", None);
        session.delete_version("v1").unwrap();
        assert!(session.current_version_id().is_none());
        assert!(session.is_blank_mode());
    }

    #[test]
    fn deleting_other_version_keeps_selection() {
        let mut session = two_versions();
        session.push_generated("https://img/v2.png", "b", None);
        session.delete_version("v1").unwrap();
        assert_eq!(session.current_version_id(), Some("v2"));
    }

    #[test]
    fn record_transcript_is_write_once() {
        let mut session = CanvasSession::new();
        session.load_reference("blob:ref", None, UPLOAD_INSTRUCTION);
        session.push_message(ChatMessage::assistant("已分析参考图"));
        session.record_transcript("v0").unwrap();
        session.push_message(ChatMessage::user("later"));
        session.record_transcript("v0").unwrap();
        assert_eq!(session.versions()[0].messages_snapshot.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn analysis_for_unselected_version_does_not_touch_panel() {
        let mut session = two_versions();
        session.attach_analysis("v0", analysis("late")).unwrap();
        assert_eq!(session.analysis(), Some(&analysis("v1")));
        assert_eq!(session.versions()[0].analysis, Some(analysis("late")));
    }

    #[test]
    fn canvas_round_trip_preserves_live_state() {
        let session = two_versions();
        let mut canvas = DesignCanvas::empty("c", "n");
        session.write_into(&mut canvas);
        let restored = CanvasSession::from_canvas(&canvas);
        assert_eq!(restored.versions(), session.versions());
        assert_eq!(restored.current_version_id(), session.current_version_id());
        assert_eq!(restored.messages(), session.messages());
        assert_eq!(restored.analysis(), session.analysis());
        assert_eq!(restored.reference_image(), session.reference_image());
        assert_eq!(canvas.next_version_number, 2);
    }

    #[test]
    fn generation_reference_prefers_selected_version() {
        let mut session = two_versions();
        assert_eq!(session.generation_reference().as_deref(), Some("https://img/v1.png"));
        session.select_version("v0").unwrap();
        // v0 is a blob URL; its payload is used instead
        assert_eq!(session.generation_reference().as_deref(), Some("QUJD"));
    }

    #[test]
    fn resolve_message_rewrites_in_place() {
        let mut session = CanvasSession::new();
        let id = session.push_message(ChatMessage::thinking());
        assert!(session.resolve_message(&id, "出错了", MessageStatus::Error));
        assert_eq!(session.messages()[0].status, MessageStatus::Error);
        assert_eq!(session.messages()[0].role, MessageRole::Assistant);
        assert!(!session.resolve_message("missing", "x", MessageStatus::Complete));
    }

    #[test]
    fn snapshot_log_is_keyed_by_version() {
        let session = two_versions();
        let log = session.snapshot_log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].version_id, "v0");
        assert!(log[0].messages.is_none());
        assert_eq!(log[1].messages.map(<[ChatMessage]>::len), Some(1));
    }
}
