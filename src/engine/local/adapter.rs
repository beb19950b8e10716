use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tokio::sync::mpsc;
use url::Url;

use super::models::*;
use super::stream::parse_sse_stream;
use crate::engine::traits::InferenceEngine;
use crate::engine::types::{ChatRequest, EngineError, StreamEvent};
use crate::services::settings::AppSettings;

/// Engine backed by an OpenAI-compatible server on the local machine
/// (llama.cpp server, Ollama, vLLM and friends).
pub struct LocalEngine {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl LocalEngine {
    pub fn new(
        base_url: &str,
        model: &str,
        api_key: Option<String>,
    ) -> Result<Self, EngineError> {
        Url::parse(base_url).map_err(|e| {
            EngineError::RequestFailed(format!("Invalid base URL {}: {}", base_url, e))
        })?;

        Ok(Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
        })
    }

    /// Build an engine from settings and make sure the server answers,
    /// reporting each step through `on_progress`.
    pub async fn connect<F>(settings: &AppSettings, mut on_progress: F) -> Result<Self, EngineError>
    where
        F: FnMut(&str),
    {
        let engine = Self::new(&settings.base_url, &settings.model, settings.api_key.clone())?;

        on_progress(&format!("Connecting to {}", engine.base_url));
        let models = engine.list_models().await?;

        if models.iter().any(|m| m == &engine.model) {
            on_progress(&format!("Model {} ready", engine.model));
        } else {
            tracing::warn!(
                "Model {} not listed by {} (available: {:?})",
                engine.model,
                engine.base_url,
                models
            );
            on_progress(&format!(
                "Model {} not listed by the server, using it anyway",
                engine.model
            ));
        }

        Ok(engine)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("Authorization", format!("Bearer {}", key)),
            None => req,
        }
    }

    fn parse_error_message(status: StatusCode, body: &str) -> String {
        if let Ok(parsed) = serde_json::from_str::<OpenAiErrorResponse>(body) {
            return format!("HTTP {}: {}", status.as_u16(), parsed.error.message);
        }
        format!("HTTP {}: Request failed", status.as_u16())
    }

    async fn check_status(response: Response) -> Result<Response, EngineError> {
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(EngineError::AuthError("Invalid API key".to_string()));
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(EngineError::RateLimited { retry_after_secs });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::RequestFailed(Self::parse_error_message(
                status, &body,
            )));
        }

        Ok(response)
    }

    pub async fn list_models(&self) -> Result<Vec<String>, EngineError> {
        let req = self.authorize(self.client.get(self.endpoint("v1/models")));

        let response = req.send().await.map_err(|e| {
            EngineError::NetworkError(format!("Failed to connect to {}: {}", self.base_url, e))
        })?;
        let response = Self::check_status(response).await?;

        let model_list: OpenAiModelList = response.json().await.map_err(|e| {
            EngineError::InvalidResponse(format!("Failed to parse model list: {}", e))
        })?;

        Ok(model_list.data.into_iter().map(|m| m.id).collect())
    }

    fn completion_body<'a>(&'a self, request: &'a ChatRequest) -> OpenAiRequest<'a> {
        OpenAiRequest {
            model: &self.model,
            messages: &request.messages,
            stream: true,
            stream_options: Some(StreamOptions {
                include_usage: true,
            }),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        }
    }
}

#[async_trait]
impl InferenceEngine for LocalEngine {
    fn model(&self) -> &str {
        &self.model
    }

    async fn stream_completion(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), EngineError> {
        let req = self
            .client
            .post(self.endpoint("v1/chat/completions"))
            .header("content-type", "application/json")
            .json(&self.completion_body(&request));

        let response = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| EngineError::NetworkError(e.to_string()))?;
        let response = Self::check_status(response).await?;

        parse_sse_stream(response.bytes_stream(), tx).await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::ChatMessage;

    #[test]
    fn test_rejects_invalid_base_url() {
        let err = LocalEngine::new("not a url", "m", None).err().unwrap();
        assert!(matches!(err, EngineError::RequestFailed(_)));
    }

    #[test]
    fn test_endpoint_joins_without_double_slash() {
        let engine = LocalEngine::new("http://127.0.0.1:8080/", "m", Some(String::new())).unwrap();
        assert_eq!(
            engine.endpoint("v1/chat/completions"),
            "http://127.0.0.1:8080/v1/chat/completions"
        );
        assert!(engine.api_key.is_none());
    }

    #[test]
    fn test_completion_body_shape() {
        let engine = LocalEngine::new("http://localhost:11434", "llama3.1:8b", None).unwrap();
        let request = ChatRequest {
            messages: vec![
                ChatMessage::system("You are a helpful assistant."),
                ChatMessage::user("Hello"),
            ],
            temperature: None,
            max_tokens: None,
        };

        let body = serde_json::to_value(engine.completion_body(&request)).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "model": "llama3.1:8b",
                "messages": [
                    {"role": "system", "content": "You are a helpful assistant."},
                    {"role": "user", "content": "Hello"},
                ],
                "stream": true,
                "stream_options": {"include_usage": true},
            })
        );
    }

    #[test]
    fn test_parse_error_message() {
        let msg = LocalEngine::parse_error_message(
            StatusCode::BAD_REQUEST,
            r#"{"error":{"message":"model not found"}}"#,
        );
        assert_eq!(msg, "HTTP 400: model not found");

        let msg = LocalEngine::parse_error_message(StatusCode::BAD_GATEWAY, "<html>");
        assert_eq!(msg, "HTTP 502: Request failed");
    }
}
