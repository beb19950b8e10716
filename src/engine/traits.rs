use async_trait::async_trait;
use tokio::sync::mpsc;

use super::types::{ChatRequest, EngineError, StreamEvent};

#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Model identifier requests are served by.
    fn model(&self) -> &str;

    /// Open a streaming completion and push its fragments into `tx` in
    /// arrival order. Implementations stop as soon as `tx` is closed.
    async fn stream_completion(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), EngineError>;
}
