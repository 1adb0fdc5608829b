use crate::config::{resolve_api_key, ApiSettings, SettingsService};
use crate::gallery::Catalog;
use crate::models::{ChatMessage, ImageAnalysis};
use crate::presets::{compose_prompt, design_system_prompt, StyleHint};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

const ANALYSIS_PROMPT: &str = r#"分析这个挂饰设计的元素、材质、风格和结构。

请返回 JSON 格式：
{
  "elements": {
    "primary": [{"type": "元素名", "color": "颜色", "material": "材质"}],
    "secondary": [{"type": "元素名", "count": 数量}],
    "hardware": [{"type": "五金件名", "material": "材质"}]
  },
  "style": {"tags": ["风格标签1", "风格标签2"], "mood": "整体氛围描述"},
  "physicalSpecs": {"lengthCm": 估计长度, "weightG": 估计重量},
  "suggestions": ["建议1", "建议2"]
}"#;

const SIMILAR_TOP_K: usize = 5;

/// Context the assistant sees alongside the transcript.
#[derive(Clone, Debug, Default)]
pub struct ChatContext {
    pub analysis: Option<ImageAnalysis>,
    pub style: Option<StyleHint>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChatReply {
    pub message: String,
    pub session_id: String,
}

#[derive(Clone, Debug, Default)]
pub struct GenerateRequest {
    pub instruction: String,
    /// Base64 payload, data URI or http(s) URL.
    pub reference_image: Option<String>,
    pub session_id: Option<String>,
    pub style_hint: Option<StyleHint>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DesignResponse {
    pub success: bool,
    pub image_url: Option<String>,
    pub analysis: Option<ImageAnalysis>,
    pub prompt_used: Option<String>,
    pub message: String,
}

impl DesignResponse {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            ..Self::default()
        }
    }
}

// Boundary to the external model provider. None of these calls are idempotent.
#[async_trait]
pub trait DesignApi: Send + Sync {
    async fn analyze_image(&self, image: &str, include_similar: bool) -> Result<ImageAnalysis>;

    async fn chat(
        &self,
        messages: &[ChatMessage],
        session_id: Option<&str>,
        context: &ChatContext,
    ) -> Result<ChatReply>;

    /// Provider failures come back as `success = false`, not as `Err`.
    async fn generate_design(&self, request: &GenerateRequest) -> Result<DesignResponse>;
}

/// Bounded retry for outbound calls. The default makes a single attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Runs `op` until it succeeds or attempts run out; the wait grows linearly.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts => {
                    log::warn!("{} failed (attempt {}/{}): {:#}", label, attempt, attempts, e);
                    tokio::time::sleep(self.backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// --- OpenAI Compatible wire types ---

#[derive(Serialize, Debug)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize, Debug, Clone)]
struct OpenAIMessage {
    role: String,
    content: OpenAIContent,
}

#[derive(Serialize, Debug, Clone)]
#[serde(untagged)]
enum OpenAIContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize, Debug, Clone)]
struct ImageUrl {
    url: String,
}

#[derive(Deserialize, Debug)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize, Debug)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize, Debug)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Serialize, Debug)]
struct ImageGenerationRequest {
    model: String,
    prompt: String,
    n: u32,
    size: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<Vec<String>>,
    response_format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sequential_image_generation: Option<String>,
    watermark: bool,
}

#[derive(Deserialize, Debug)]
struct ImageGenerationResponse {
    #[serde(default)]
    data: Vec<GeneratedImage>,
}

#[derive(Deserialize, Debug)]
struct GeneratedImage {
    url: Option<String>,
    revised_prompt: Option<String>,
}

/// Reference images go out as http(s) URLs or data URIs; bare base64 gets a PNG prefix.
pub fn normalize_image_ref(image: &str) -> String {
    if image.starts_with("http") || image.starts_with("data:") {
        image.to_string()
    } else {
        format!("data:image/png;base64,{}", image)
    }
}

/// Extracts the JSON object embedded in model output. Text without a usable
/// object produces a placeholder analysis that carries the raw text as mood.
pub fn parse_analysis_result(text: &str) -> ImageAnalysis {
    let embedded = match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => Some(&text[start..=end]),
        _ => None,
    };

    if let Some(json) = embedded {
        match serde_json::from_str::<ImageAnalysis>(json) {
            Ok(analysis) => return analysis,
            Err(e) => log::warn!("Analysis JSON parse failed, using fallback: {}", e),
        }
    }

    let mut analysis = ImageAnalysis::default();
    analysis.style.tags = vec!["未识别".to_string()];
    analysis.style.mood = text.chars().take(100).collect();
    analysis.suggestions = vec!["请提供更清晰的图片以获得更准确的分析".to_string()];
    analysis
}

pub struct OpenAICompatibleClient {
    client: Client,
    settings: SettingsService,
    catalog: Catalog,
    retry: RetryPolicy,
}

impl OpenAICompatibleClient {
    pub fn new(settings: SettingsService, catalog: Catalog) -> Self {
        Self {
            client: Client::new(),
            settings,
            catalog,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// `true` when a base URL and key are configured. No request is made.
    pub async fn health_check(&self) -> bool {
        self.settings.is_configured().await
    }

    async fn post_json<B, R>(&self, settings: &ApiSettings, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned + Send,
    {
        let api_key = resolve_api_key(settings)?;
        let request_url = format!("{}{}", settings.base_url(), path);

        let response = self
            .client
            .post(&request_url)
            .bearer_auth(api_key)
            .timeout(settings.timeout())
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", request_url))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "<Failed to read error body>".to_string());
            log::error!("Request to {} failed with status {}: {}", path, status, error_body);
            return Err(anyhow::anyhow!("API request failed with status {}", status));
        }

        response
            .json::<R>()
            .await
            .with_context(|| format!("Failed to decode response from {}", path))
    }

    async fn chat_completion(
        &self,
        settings: &ApiSettings,
        messages: Vec<OpenAIMessage>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String> {
        let body = ChatCompletionRequest {
            model: settings.chat_model.clone(),
            messages,
            temperature,
            max_tokens,
        };
        log::info!("Chat: model={}, messages={}", body.model, body.messages.len());

        let response: ChatCompletionResponse = self
            .retry
            .run("chat completion", || self.post_json(settings, "/chat/completions", &body))
            .await?;

        Ok(response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }

    async fn generate_image(&self, settings: &ApiSettings, prompt: String, references: Vec<String>) -> Result<GeneratedImage> {
        let has_references = !references.is_empty();
        let body = ImageGenerationRequest {
            model: settings.image_model.clone(),
            prompt,
            n: 1,
            size: "2K".to_string(),
            image: has_references.then_some(references),
            response_format: "url".to_string(),
            sequential_image_generation: has_references.then(|| "auto".to_string()),
            watermark: false,
        };
        log::info!(
            "Image generation: model={}, mode={}",
            body.model,
            if has_references { "image-to-image" } else { "text-to-image" }
        );

        let response: ImageGenerationResponse = self
            .retry
            .run("image generation", || self.post_json(settings, "/images/generations", &body))
            .await?;

        response
            .data
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("生成失败: 未返回图像"))
    }
}

#[async_trait]
impl DesignApi for OpenAICompatibleClient {
    async fn analyze_image(&self, image: &str, include_similar: bool) -> Result<ImageAnalysis> {
        let settings = self.settings.get().await;
        let prompt = format!("{}\n\n{}", design_system_prompt(None), ANALYSIS_PROMPT);
        let messages = vec![OpenAIMessage {
            role: "user".to_string(),
            content: OpenAIContent::Parts(vec![
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: normalize_image_ref(image),
                    },
                },
                ContentPart::Text { text: prompt },
            ]),
        }];

        let text = self
            .chat_completion(&settings, messages, 0.3, 2048)
            .await
            .context("分析失败")?;
        let mut analysis = parse_analysis_result(&text);

        if include_similar {
            analysis.similar_items = Some(self.catalog.find_similar(&analysis, SIMILAR_TOP_K));
        }
        Ok(analysis)
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        session_id: Option<&str>,
        context: &ChatContext,
    ) -> Result<ChatReply> {
        let settings = self.settings.get().await;

        let mut system_prompt = design_system_prompt(context.style);
        if let Some(analysis) = &context.analysis {
            system_prompt.push_str(&format!(
                "\n\n当前分析结果：\n- 主体元素：{}\n- 风格标签：{}\n- 氛围：{}",
                analysis.primary_summary(),
                analysis.style.tags.join(", "),
                analysis.style.mood
            ));
        }

        let mut api_messages = vec![OpenAIMessage {
            role: "system".to_string(),
            content: OpenAIContent::Text(system_prompt),
        }];
        api_messages.extend(messages.iter().map(|m| OpenAIMessage {
            role: m.role.as_str().to_string(),
            content: OpenAIContent::Text(m.content.clone()),
        }));

        let message = self
            .chat_completion(&settings, api_messages, 0.7, 2048)
            .await
            .context("对话失败")?;

        Ok(ChatReply {
            message,
            session_id: session_id
                .map(str::to_string)
                .unwrap_or_else(|| Utc::now().timestamp_millis().to_string()),
        })
    }

    async fn generate_design(&self, request: &GenerateRequest) -> Result<DesignResponse> {
        let settings = self.settings.get().await;
        let prompt = compose_prompt(&request.instruction, request.style_hint);
        let references: Vec<String> = request
            .reference_image
            .as_deref()
            .map(normalize_image_ref)
            .into_iter()
            .collect();

        let image = match self.generate_image(&settings, prompt.clone(), references).await {
            Ok(image) => image,
            Err(e) => {
                log::error!("[API] Generation failed: {:#}", e);
                return Ok(DesignResponse::failed(format!("{:#}", e)));
            }
        };

        let image_url = image.url.unwrap_or_default();
        if image_url.is_empty() {
            return Ok(DesignResponse::failed("生成失败: 未返回图像"));
        }

        // Analysis of the result is best-effort
        let analysis = match self.analyze_image(&image_url, false).await {
            Ok(analysis) => Some(analysis),
            Err(e) => {
                log::warn!("[API] Analysis of generated image failed: {:#}", e);
                None
            }
        };

        Ok(DesignResponse {
            success: true,
            image_url: Some(image_url),
            analysis,
            prompt_used: Some(image.revised_prompt.unwrap_or(prompt)),
            message: "生成成功".to_string(),
        })
    }
}
