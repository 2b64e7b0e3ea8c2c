//! Enhancer capability: optional LLM polish for transcripts.
//!
//! The core treats enhancement as strictly best-effort. Providers are
//! selected by tag at boot (`openai | gemini | ollama | none`); any error is
//! logged and the caller keeps the pre-enhancement text.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{EnhancerConfig, EnhancerProvider};

const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";
const DEFAULT_OPENAI_URL: &str = "https://api.openai.com";
const GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Debug, Error)]
pub enum EnhancerError {
    #[error("enhancer request failed: {0}")]
    RequestFailed(String),

    #[error("enhancer returned an unusable response: {0}")]
    BadResponse(String),
}

/// The enhancer capability: rewrite a draft transcript for fluency.
#[async_trait]
pub trait Enhancer: Send + Sync {
    fn provider(&self) -> &'static str;

    async fn enhance(&self, text: &str, profile_hint: &str) -> Result<String, EnhancerError>;
}

/// Build the configured provider; `none` yields no enhancer at all.
pub fn build_enhancer(config: &EnhancerConfig) -> Option<Arc<dyn Enhancer>> {
    match config.provider {
        EnhancerProvider::None => None,
        EnhancerProvider::OpenAi => {
            let base = non_empty(&config.base_url).unwrap_or(DEFAULT_OPENAI_URL);
            Some(Arc::new(ChatCompletionEnhancer::new(
                "openai",
                base,
                config.api_key.clone(),
                &config.model,
                config.timeout,
            )))
        }
        EnhancerProvider::Ollama => {
            let base = non_empty(&config.base_url).unwrap_or(DEFAULT_OLLAMA_URL);
            Some(Arc::new(ChatCompletionEnhancer::new(
                "ollama",
                base,
                config.api_key.clone(),
                &config.model,
                config.timeout,
            )))
        }
        EnhancerProvider::Gemini => Some(Arc::new(GeminiEnhancer::new(
            config.api_key.clone().unwrap_or_default(),
            &config.model,
            config.timeout,
        ))),
    }
}

fn non_empty(s: &str) -> Option<&str> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn instruction_for(profile_hint: &str) -> String {
    format!(
        "You polish dictated speech-to-text output. Fix grammar, punctuation \
         and obvious recognition slips while preserving the speaker's wording \
         and meaning. Do not add commentary; return only the corrected text. \
         Target context: {profile_hint}."
    )
}

// -- OpenAI-compatible chat completions (openai, ollama) --

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// Client for any OpenAI-compatible `/v1/chat/completions` endpoint
pub struct ChatCompletionEnhancer {
    provider: &'static str,
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl ChatCompletionEnhancer {
    pub fn new(
        provider: &'static str,
        base_url: &str,
        api_key: Option<String>,
        model: &str,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        info!("Enhancer '{}' configured for {}", provider, base_url);
        Self {
            provider,
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl Enhancer for ChatCompletionEnhancer {
    fn provider(&self) -> &'static str {
        self.provider
    }

    async fn enhance(&self, text: &str, profile_hint: &str) -> Result<String, EnhancerError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: instruction_for(profile_hint),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: text.to_string(),
                },
            ],
            stream: false,
            temperature: 0.2,
        };

        let mut builder = self.client.post(&url).json(&request);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| EnhancerError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EnhancerError::RequestFailed(format!("{status}: {body}")));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| EnhancerError::BadResponse(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();

        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(EnhancerError::BadResponse("empty completion".into()));
        }
        debug!("Enhancer '{}' returned {} chars", self.provider, trimmed.len());
        Ok(trimmed.to_string())
    }
}

// -- Gemini generateContent --

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiResponseContent,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    #[serde(default)]
    text: Option<String>,
}

/// Client for the Gemini generateContent endpoint
pub struct GeminiEnhancer {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl GeminiEnhancer {
    pub fn new(api_key: String, model: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        let model = if model.is_empty() {
            "gemini-2.0-flash".to_string()
        } else {
            model.to_string()
        };
        info!("Enhancer 'gemini' configured with model {}", model);
        Self {
            client,
            api_key,
            model,
        }
    }
}

#[async_trait]
impl Enhancer for GeminiEnhancer {
    fn provider(&self) -> &'static str {
        "gemini"
    }

    async fn enhance(&self, text: &str, profile_hint: &str) -> Result<String, EnhancerError> {
        if self.api_key.trim().is_empty() {
            return Err(EnhancerError::RequestFailed("Gemini API key missing".into()));
        }

        let url = format!(
            "{}/{}:generateContent?key={}",
            GEMINI_ENDPOINT, self.model, self.api_key
        );
        let prompt = format!("{}\n\n{}", instruction_for(profile_hint), text);
        let request = GeminiRequest {
            contents: vec![GeminiContent {
                parts: vec![GeminiPart { text: prompt }],
            }],
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| EnhancerError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(EnhancerError::RequestFailed(status.to_string()));
        }

        let parsed: GeminiResponse = response
            .json()
            .await
            .map_err(|e| EnhancerError::BadResponse(e.to_string()))?;

        let content: String = parsed
            .candidates
            .into_iter()
            .next()
            .map(|c| {
                c.content
                    .parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(EnhancerError::BadResponse("no candidates".into()));
        }
        Ok(trimmed.to_string())
    }
}

/// Best-effort wrapper: returns the enhanced text, or the original on any
/// failure. This is the only way the rest of the crate calls an enhancer.
pub async fn enhance_or_passthrough(
    enhancer: &dyn Enhancer,
    text: &str,
    profile_hint: &str,
) -> (String, bool) {
    match enhancer.enhance(text, profile_hint).await {
        Ok(enhanced) => (enhanced, true),
        Err(e) => {
            warn!(
                "Enhancer '{}' failed, returning unenhanced text: {}",
                enhancer.provider(),
                e
            );
            (text.to_string(), false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingEnhancer;

    #[async_trait]
    impl Enhancer for FailingEnhancer {
        fn provider(&self) -> &'static str {
            "failing"
        }

        async fn enhance(&self, _text: &str, _hint: &str) -> Result<String, EnhancerError> {
            Err(EnhancerError::RequestFailed("offline".into()))
        }
    }

    struct UppercaseEnhancer;

    #[async_trait]
    impl Enhancer for UppercaseEnhancer {
        fn provider(&self) -> &'static str {
            "upper"
        }

        async fn enhance(&self, text: &str, _hint: &str) -> Result<String, EnhancerError> {
            Ok(text.to_uppercase())
        }
    }

    #[tokio::test]
    async fn test_failure_passes_original_through() {
        let (text, enhanced) =
            enhance_or_passthrough(&FailingEnhancer, "keep me intact", "general").await;
        assert_eq!(text, "keep me intact");
        assert!(!enhanced);
    }

    #[tokio::test]
    async fn test_success_returns_enhanced() {
        let (text, enhanced) = enhance_or_passthrough(&UppercaseEnhancer, "hello", "general").await;
        assert_eq!(text, "HELLO");
        assert!(enhanced);
    }

    #[test]
    fn test_build_enhancer_none() {
        let config = EnhancerConfig::default();
        assert!(build_enhancer(&config).is_none());
    }

    #[test]
    fn test_build_enhancer_ollama_defaults() {
        let mut config = EnhancerConfig::default();
        config.provider = EnhancerProvider::Ollama;
        config.model = "llama3.2".to_string();
        let enhancer = build_enhancer(&config).unwrap();
        assert_eq!(enhancer.provider(), "ollama");
    }

    #[test]
    fn test_gemini_default_model_applied() {
        let gemini = GeminiEnhancer::new("key".into(), "", Duration::from_secs(5));
        assert_eq!(gemini.model, "gemini-2.0-flash");
    }
}
