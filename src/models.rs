use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Instruction recorded on `v0` when the user uploads a reference image.
pub const UPLOAD_INSTRUCTION: &str = "原始参考图";
/// Instruction recorded on `v0` when the reference comes from the gallery.
pub const GALLERY_INSTRUCTION: &str = "从图库选择";
/// Id of the reference version. Never deletable.
pub const REFERENCE_VERSION_ID: &str = "v0";

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

// Controls how a message is rendered. Older records carry no status.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Thinking,
    #[default]
    Complete,
    Error,
}

// A single entry in a canvas chat transcript
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(default = "new_id")]
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>, status: MessageStatus) -> Self {
        Self {
            id: new_id(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            status,
            image_url: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content, MessageStatus::Complete)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content, MessageStatus::Complete)
    }

    /// Placeholder shown while a request is outstanding.
    pub fn thinking() -> Self {
        Self::new(MessageRole::Assistant, String::new(), MessageStatus::Thinking)
    }
}

/// One detected visual element. Only `type` is guaranteed.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub material: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
}

impl Element {
    pub fn named(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Self::default()
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct ElementGroups {
    #[serde(default)]
    pub primary: Vec<Element>,
    #[serde(default)]
    pub secondary: Vec<Element>,
    #[serde(default)]
    pub hardware: Vec<Element>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct StyleProfile {
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub mood: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct PhysicalSpecs {
    pub length_cm: f64,
    pub weight_g: f64,
}

impl Default for PhysicalSpecs {
    // Typical charm size assumed when the model does not estimate one
    fn default() -> Self {
        Self {
            length_cm: 15.0,
            weight_g: 10.0,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SimilarItem {
    pub id: String,
    pub image_url: String,
    /// Score in `0.0..=1.0`.
    pub similarity: f64,
}

/// Structured description of a charm image.
///
/// Every field defaults when absent so partially filled model output still
/// deserializes: groups and lists default to empty, `physicalSpecs` to
/// 15 cm / 10 g.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ImageAnalysis {
    #[serde(default)]
    pub elements: ElementGroups,
    #[serde(default)]
    pub style: StyleProfile,
    #[serde(default)]
    pub physical_specs: PhysicalSpecs,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similar_items: Option<Vec<SimilarItem>>,
}

impl ImageAnalysis {
    /// Comma-joined primary element names, used in assistant messages.
    pub fn primary_summary(&self) -> String {
        self.elements
            .primary
            .iter()
            .map(|e| e.kind.as_str())
            .collect::<Vec<_>>()
            .join("、")
    }
}

// One image state within a canvas
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageVersion {
    pub id: String,
    pub url: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub instruction: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<ImageAnalysis>,
    // Chat transcript as it was when this version was produced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages_snapshot: Option<Vec<ChatMessage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    // Kept for uploads so the image survives an expired object URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base64: Option<String>,
}

impl ImageVersion {
    pub fn is_reference(&self) -> bool {
        self.id == REFERENCE_VERSION_ID
    }

    /// Sequence number parsed from `v{n}`.
    pub fn number(&self) -> Option<u32> {
        self.id.strip_prefix('v')?.parse().ok()
    }
}

/// One independent design session.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DesignCanvas {
    pub id: String,
    pub name: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub versions: Vec<ImageVersion>,
    #[serde(default)]
    pub current_version_id: Option<String>,
    #[serde(default)]
    pub reference_image: Option<String>,
    #[serde(default)]
    pub reference_base64: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub analysis: Option<ImageAnalysis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub is_blank_mode: bool,
    // Zero means "not recorded"; resolved from the version list on load.
    #[serde(default)]
    pub next_version_number: u32,
}

impl DesignCanvas {
    pub fn empty(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            created_at: now,
            updated_at: now,
            versions: Vec::new(),
            current_version_id: None,
            reference_image: None,
            reference_base64: None,
            messages: Vec::new(),
            analysis: None,
            thumbnail: None,
            description: None,
            tags: Vec::new(),
            is_blank_mode: false,
            next_version_number: 0,
        }
    }

    /// Image URL of the most recent version.
    pub fn latest_image(&self) -> Option<&str> {
        self.versions.last().map(|v| v.url.as_str())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MaterialCost {
    pub name: String,
    pub quantity: u32,
    pub unit_price: f64,
    pub total: f64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LaborCost {
    pub time_minutes: u32,
    pub hourly_rate: f64,
    pub total: f64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CostBreakdown {
    #[serde(default)]
    pub materials: Vec<MaterialCost>,
    pub labor: LaborCost,
    pub api_cost: f64,
    pub total_cost: f64,
    pub currency: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    Success,
    Failed,
}

/// Persisted record of one generation episode.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryItem {
    #[serde(default)]
    pub id: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub instruction: String,
    #[serde(default)]
    pub reference_url: String,
    #[serde(default)]
    pub generated_url: String,
    #[serde(default)]
    pub versions: Vec<ImageVersion>,
    #[serde(default)]
    pub versions_count: usize,
    pub status: HistoryStatus,
    #[serde(default)]
    pub cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_breakdown: Option<CostBreakdown>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum GenerationStep {
    #[default]
    Idle,
    Analyzing,
    Searching,
    Checking,
    Generating,
    Verifying,
    Complete,
    Error,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimeFilter {
    Today,
    Week,
    Month,
    #[default]
    All,
}
