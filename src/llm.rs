//! Generation provider access and model fallback.

pub mod gemini;
pub mod routing;
pub mod types;

pub use gemini::GeminiClient;
pub use routing::{ErrorClass, FallbackEngine, FallbackPolicy, FallbackState};
pub use types::{
    ChunkStream, FileState, GenerationApi, GenerationRequest, RemoteFile, ResponseChunk,
    SafetySetting, Tool,
};
