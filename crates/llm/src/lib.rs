pub mod client;
pub mod config;
pub mod dial;

pub use client::{ChunkStream, LlmClient, LlmRequest, LlmResponse, ResponseFormat, TokenUsage};
pub use config::{build_dial_client, DialConfig};
pub use dial::{DialClient, DEFAULT_API_VERSION};
