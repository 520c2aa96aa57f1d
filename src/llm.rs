//! Generation Client
//!
//! Turns prompts into SQL text. The provided client speaks the OpenAI chat
//! completions API and retries once on a fallback model when the default
//! model returns nothing usable.

use crate::error::{AgentError, Result};
use crate::semantic::{looks_incomplete, normalize_sql};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const MAX_OUTPUT_TOKENS: u32 = 1400;

lazy_static! {
    static ref FENCED_BLOCK: Regex = Regex::new(r"(?is)```(?:sql)?\s*(.*?)```").unwrap();
}

/// System instructions plus the user-facing input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub instructions: String,
    pub input: String,
}

/// Everything the model needs to fix a query the warehouse rejected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairRequest {
    pub instructions: String,
    pub question: String,
    pub failed_sql: String,
    pub error: String,
}

impl RepairRequest {
    pub fn to_prompt(&self) -> Prompt {
        Prompt {
            instructions: self.instructions.clone(),
            input: format!(
                "User question:\n{}\n\nPrevious SQL (failed):\n{}\n\nBigQuery error:\n{}\n\nReturn a corrected SQL query only.",
                self.question.trim(),
                self.failed_sql.trim(),
                self.error.trim()
            ),
        }
    }
}

#[async_trait]
pub trait GenerationClient: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &Prompt) -> Result<String>;

    async fn repair(&self, request: &RepairRequest) -> Result<String>;
}

pub struct LlmClient {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: String,
    fallback_model: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl LlmClient {
    pub fn new(
        api_key: String,
        base_url: String,
        default_model: String,
        fallback_model: String,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            default_model,
            fallback_model,
        })
    }

    /// Build from `OPENAI_API_KEY` and optionally `OPENAI_BASE_URL`.
    pub fn from_env(default_model: &str, fallback_model: &str, timeout: Duration) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| AgentError::Config("Missing OPENAI_API_KEY".to_string()))?;
        let base_url = std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Self::new(
            api_key,
            base_url,
            default_model.to_string(),
            fallback_model.to_string(),
            timeout,
        )
    }

    async fn call_llm(&self, model: &str, prompt: &Prompt) -> Result<String> {
        let body = serde_json::json!({
            "model": model,
            "messages": [
                {"role": "system", "content": prompt.instructions},
                {"role": "user", "content": prompt.input}
            ],
            "temperature": 0.0,
            "max_tokens": MAX_OUTPUT_TOKENS
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Generation(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AgentError::Generation(format!("Failed to read LLM response: {}", e)))?;
        if !status.is_success() {
            return Err(AgentError::Generation(format!("LLM API returned {}: {}", status, text)));
        }

        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| AgentError::Generation(format!("Failed to parse LLM response: {}", e)))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        Ok(extract_sql(&content))
    }

    /// Default model first; the fallback model only when the first answer is
    /// empty or truncated.
    async fn complete(&self, prompt: &Prompt) -> Result<String> {
        let sql = self.call_llm(&self.default_model, prompt).await?;
        if !sql.is_empty() && !looks_incomplete(&sql) {
            info!("SQL generated with {}", self.default_model);
            return Ok(sql);
        }

        warn!(
            "{} returned empty or incomplete SQL, retrying with {}",
            self.default_model, self.fallback_model
        );
        let sql = self.call_llm(&self.fallback_model, prompt).await?;
        if sql.is_empty() || looks_incomplete(&sql) {
            return Err(AgentError::Generation(
                "Model returned empty or incomplete SQL".to_string(),
            ));
        }
        info!("SQL generated with {}", self.fallback_model);
        Ok(sql)
    }
}

#[async_trait]
impl GenerationClient for LlmClient {
    fn name(&self) -> &str {
        &self.default_model
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String> {
        self.complete(prompt).await
    }

    async fn repair(&self, request: &RepairRequest) -> Result<String> {
        self.complete(&request.to_prompt()).await
    }
}

/// Pull SQL out of a model answer: the first fenced block if there is one,
/// otherwise the whole text.
pub fn extract_sql(text: &str) -> String {
    let trimmed = text.trim();
    let body = FENCED_BLOCK
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map_or(trimmed, |m| m.as_str());
    normalize_sql(body)
}
