use base64::{engine::general_purpose, Engine as _};

use crate::config::Config;
use crate::models::{
    AnalysisRequest, ChatMessage, ChatRequest, ChatResponse, ContentPart, ImageUrl, UploadedImage,
};

// ── Constants ────────────────────────────────────────────────────────────────

const USER_AGENT: &str = "stylesync-api/1.0";
const ANALYSIS_PROMPT: &str = "Do these clothes match? If they do, say so. \
     If they don\u{2019}t, suggest one item to add or replace and why.";
const ANALYSIS_MAX_TOKENS: u32 = 300;
const LOOKUP_MAX_TOKENS: u32 = 100;
const ERROR_BODY_PREVIEW: usize = 200;

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum StylistError {
    #[error("OPENAI_API_KEY is not configured")]
    MissingApiKey,
    #[error("{0}")]
    Request(String),
    #[error("model API returned status {0}")]
    Upstream(reqwest::StatusCode),
    #[error("model API returned no reply text")]
    EmptyReply,
}

// ── Client ───────────────────────────────────────────────────────────────────

/// Client for the hosted multimodal chat-completions API.
#[derive(Clone)]
pub struct StylistClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    marketplace: String,
}

impl StylistClient {
    pub fn new(config: &Config) -> Result<Self, StylistError> {
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(config.upstream_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| StylistError::Request(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.api_base_url),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            marketplace: config.interpreter.marketplace_domain.clone(),
        })
    }

    /// Asks the model whether the uploaded garments go together.
    pub async fn analyze_outfit(&self, request: &AnalysisRequest) -> Result<String, StylistError> {
        let mut content = vec![ContentPart::Text {
            text: ANALYSIS_PROMPT.to_string(),
        }];
        content.extend(request.images.iter().map(|image| ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: data_url(image),
            },
        }));

        self.complete(content, ANALYSIS_MAX_TOKENS).await
    }

    /// Asks the model for a direct marketplace product link for `keyword`.
    pub async fn lookup_product(&self, keyword: &str) -> Result<String, StylistError> {
        let prompt = format!(
            "Give me a direct {} product URL for a stylish {}. \
             Only return the full URL. No text, no markdown, no explanation.",
            self.marketplace, keyword
        );
        self.complete(vec![ContentPart::Text { text: prompt }], LOOKUP_MAX_TOKENS)
            .await
    }

    async fn complete(
        &self,
        content: Vec<ContentPart>,
        max_tokens: u32,
    ) -> Result<String, StylistError> {
        let api_key = self.api_key.as_deref().ok_or(StylistError::MissingApiKey)?;

        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content,
            }],
            max_tokens,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    StylistError::Request(format!("TimeoutError: {}", e))
                } else if e.is_connect() {
                    StylistError::Request(format!("ConnectError: {}", e))
                } else {
                    StylistError::Request(format!("RequestError: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            tracing::warn!(
                "model API returned {}: {}",
                status,
                detail.chars().take(ERROR_BODY_PREVIEW).collect::<String>()
            );
            return Err(StylistError::Upstream(status));
        }

        let reply: ChatResponse = response
            .json()
            .await
            .map_err(|e| StylistError::Request(e.to_string()))?;

        reply
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or(StylistError::EmptyReply)
    }
}

fn data_url(image: &UploadedImage) -> String {
    format!(
        "data:{};base64,{}",
        image.mime,
        general_purpose::STANDARD.encode(&image.bytes)
    )
}
