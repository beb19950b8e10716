pub mod local;
pub mod traits;
pub mod types;

pub use local::LocalEngine;
pub use traits::InferenceEngine;
pub use types::{ChatMessage, ChatRequest, EngineError, StreamEvent};
