//! Coordinator transport
//!
//! The coordination client talks JSON to the coordinator through this trait.
//! Implementations only move requests: status codes and `{code, message}`
//! error bodies are interpreted by [`crate::coordinator::CoordinatorClient`].

use crate::Result;

pub use ::async_trait::async_trait;

/// Reply from the coordinator
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: serde_json::Value,
}

impl Response {
    pub fn new(status: u16, body: serde_json::Value) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Request/response channel to the coordinator
#[async_trait]
pub trait Transport: Send + Sync {
    /// GET `path`, which may carry a query string
    async fn get(&self, path: &str) -> Result<Response>;

    /// POST a JSON body to `path`
    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<Response>;
}

/// In-memory coordinator for testing
pub mod memory;

pub use memory::MemoryCoordinator;
