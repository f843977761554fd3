use image::RgbImage;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::capabilities::{Captioner, Embedder};
use crate::config::{EmbeddingsConfig, OllamaConfig};
use crate::error::{InferenceError, OllamaError, ServiceError, ServiceResult};
use crate::imaging;

/// Ollama API client, serving both the vision model and the embedding model
#[derive(Clone)]
pub struct OllamaClient {
    client: Client,
    config: OllamaConfig,
    embedding_model: String,
}

impl OllamaClient {
    /// Create a new Ollama client
    pub fn new(config: OllamaConfig, embeddings: &EmbeddingsConfig) -> ServiceResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| {
                ServiceError::Ollama(OllamaError::Connection {
                    url: config.base_url.clone(),
                    source: e,
                })
            })?;

        Ok(Self {
            client,
            config,
            embedding_model: embeddings.model.clone(),
        })
    }

    /// Check if Ollama is available
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/api/tags", self.config.base_url);

        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!(error = %e, "Ollama health check failed");
                false
            }
        }
    }

    /// Generate a non-streaming response (used for image captioning)
    pub async fn generate_simple(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
    ) -> ServiceResult<String> {
        let url = format!("{}/api/chat", self.config.base_url);

        let request = OllamaChatRequest {
            model: model.to_string(),
            messages,
            stream: false,
            options: Some(OllamaOptions {
                temperature: Some(self.config.temperature),
                num_predict: Some(self.config.max_caption_tokens),
            }),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| OllamaError::Connection {
                url: url.clone(),
                source: e,
            })?;

        let response = check_status(response, model).await?;

        let chat_response: OllamaChatResponse = response
            .json()
            .await
            .map_err(|e| OllamaError::InvalidResponse { source: e })?;

        Ok(chat_response.message.content)
    }

    /// Generate an embedding for text
    pub async fn embed_text(&self, text: &str) -> ServiceResult<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.config.base_url);

        let request = OllamaEmbeddingRequest {
            model: self.embedding_model.clone(),
            prompt: text.to_string(),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| OllamaError::Connection {
                url: url.clone(),
                source: e,
            })?;

        let response = check_status(response, &self.embedding_model).await?;

        let embedding_response: OllamaEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| OllamaError::InvalidResponse { source: e })?;

        Ok(embedding_response.embedding)
    }
}

async fn check_status(response: reqwest::Response, model: &str) -> ServiceResult<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();

    if message.contains("model")
        && (message.contains("not found") || message.contains("does not exist"))
    {
        return Err(ServiceError::Ollama(OllamaError::ModelNotFound {
            model: model.to_string(),
        }));
    }

    Err(ServiceError::Ollama(OllamaError::Generation { status, message }))
}

impl Captioner for OllamaClient {
    async fn caption(&self, image: &RgbImage) -> ServiceResult<String> {
        let image_base64 = imaging::to_base64_png(image)?;
        let message = ChatMessage::user_with_image(&self.config.caption_prompt, image_base64);

        let raw = self
            .generate_simple(&self.config.vision_model, vec![message])
            .await?;

        let caption = normalize_caption(&raw);
        if caption.is_empty() {
            return Err(InferenceError::EmptyCaption.into());
        }

        debug!(model = %self.config.vision_model, caption = %caption, "Generated caption");
        Ok(caption)
    }
}

impl Embedder for OllamaClient {
    async fn embed(&self, text: &str) -> ServiceResult<Vec<f32>> {
        self.embed_text(text).await
    }
}

/// Collapse whitespace and strip wrapping quotes some vision models add
fn normalize_caption(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.trim_matches('"').trim().to_string()
}

/// Chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    /// Base64-encoded images for vision models
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

impl ChatMessage {
    /// Create a user message with an image for vision models
    pub fn user_with_image(content: impl Into<String>, image_base64: String) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
            images: Some(vec![image_base64]),
        }
    }
}

// Internal Ollama API types

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    /// Maximum number of tokens to generate
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaMessage,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Serialize)]
struct OllamaEmbeddingRequest {
    model: String,
    prompt: String,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}
