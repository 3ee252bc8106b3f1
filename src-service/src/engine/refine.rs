//! Text refinement via an OpenAI-compatible chat completions API
//!
//! Used by PROCESS_TEXT to clean up dictated text with a local or remote
//! LLM. The daemon applies per-attempt timeouts and backoff around this
//! adapter, so a single call here is one attempt.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::TextRefiner;
use crate::config::RefinementConfig;
use crate::error::{DaemonError, Result};

// Request types for the chat completions API

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

// Response types for the chat completions API

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Option<Vec<Choice>>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

/// Chat-completions-backed text refiner
pub struct HttpRefiner {
    endpoint: String,
    model: String,
    prompt: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpRefiner {
    /// Create a new refiner from config
    pub fn new(config: &RefinementConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            prompt: config.prompt.clone(),
            api_key: config.api_key.clone(),
            client: reqwest::Client::new(),
        }
    }

    /// Build the request body
    fn build_request<'a>(&'a self, text: &'a str) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &self.prompt,
                },
                ChatMessage {
                    role: "user",
                    content: text,
                },
            ],
            temperature: 0.2,
        }
    }

    /// Extract text from a response
    fn extract_text(response: &ChatResponse) -> Option<String> {
        response
            .choices
            .as_ref()?
            .first()?
            .message
            .as_ref()?
            .content
            .clone()
    }
}

#[async_trait]
impl TextRefiner for HttpRefiner {
    async fn refine(&self, text: &str) -> Result<String> {
        let body = self.build_request(text);

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DaemonError::Refinement(format!("Request failed: {}", e)))?;

        let status = response.status();

        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(DaemonError::Refinement("Invalid API key".to_string()));
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(DaemonError::Refinement("Rate limited".to_string()));
        }

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(DaemonError::Refinement(format!(
                "HTTP {}: {}",
                status, error_text
            )));
        }

        let response: ChatResponse = response
            .json()
            .await
            .map_err(|e| DaemonError::Refinement(format!("Failed to parse response: {}", e)))?;

        if let Some(error) = response.error {
            return Err(DaemonError::Refinement(error.message));
        }

        let text = Self::extract_text(&response)
            .ok_or_else(|| DaemonError::Refinement("Empty response".to_string()))?;

        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(DaemonError::Refinement("Empty response".to_string()));
        }

        Ok(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refiner() -> HttpRefiner {
        HttpRefiner::new(&RefinementConfig::default())
    }

    #[test]
    fn build_request_has_correct_structure() {
        let refiner = refiner();
        let request = refiner.build_request("um hello world");

        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[0].role, "system");
        assert_eq!(request.messages[1].role, "user");
        assert_eq!(request.messages[1].content, "um hello world");
        assert_eq!(request.model, "llama3.2");
    }

    #[test]
    fn request_serializes_to_chat_completions_shape() {
        let refiner = refiner();
        let request = refiner.build_request("hi");
        let json = serde_json::to_value(&request).unwrap();

        assert!(json.get("model").is_some());
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hi");
    }

    #[test]
    fn extract_text_from_response() {
        let response = ChatResponse {
            choices: Some(vec![Choice {
                message: Some(ResponseMessage {
                    content: Some("Hello world".to_string()),
                }),
            }]),
            error: None,
        };

        assert_eq!(
            HttpRefiner::extract_text(&response),
            Some("Hello world".to_string())
        );
    }

    #[test]
    fn extract_text_empty_response() {
        let response = ChatResponse {
            choices: None,
            error: None,
        };

        assert!(HttpRefiner::extract_text(&response).is_none());
    }

    #[test]
    fn response_parses_from_wire_shape() {
        let raw = r#"{
            "choices": [
                {"message": {"role": "assistant", "content": "Cleaned text."}}
            ]
        }"#;

        let response: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(
            HttpRefiner::extract_text(&response),
            Some("Cleaned text.".to_string())
        );
    }
}
