//! Gantry HTTP Client
//!
//! A typed HTTP client for the Gantry orchestrator API.
//!
//! Both the CLI and the runner talk to the orchestrator through this crate,
//! so request and response shapes are defined once in `gantry-core`.
//!
//! # Example
//!
//! ```no_run
//! use gantry_client::OrchestratorClient;
//! use gantry_core::dto::pipeline::CreatePipeline;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = OrchestratorClient::new("http://localhost:8080");
//!
//!     let pipeline = client
//!         .create_pipeline(CreatePipeline {
//!             repo_id: "acme/api".to_string(),
//!             uid: "ci".to_string(),
//!             description: None,
//!             config_path: None,
//!             default_branch: None,
//!         })
//!         .await?;
//!
//!     println!("Created pipeline: {}", pipeline.id);
//!     Ok(())
//! }
//! ```

pub mod error;
mod events;
mod executions;
mod jobs;
mod pipelines;
mod runners;
mod webhooks;

pub use error::{ClientError, Result};

use reqwest::Client;
use serde::de::DeserializeOwned;

/// HTTP client for the Gantry orchestrator API
///
/// Methods are grouped by resource:
/// - Pipelines, triggers and cron schedules
/// - Executions, cancellation and step logs
/// - Webhooks and their delivery history
/// - The runner protocol (poll, heartbeat, stage fetch, step reports)
/// - Event ingestion and background jobs
#[derive(Debug, Clone)]
pub struct OrchestratorClient {
    /// Base URL of the orchestrator (e.g., "http://localhost:8080")
    base_url: String,
    client: Client,
}

impl OrchestratorClient {
    /// Create a new orchestrator client
    ///
    /// # Example
    /// ```
    /// use gantry_client::OrchestratorClient;
    ///
    /// let client = OrchestratorClient::new("http://localhost:8080");
    /// ```
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a new orchestrator client with a custom HTTP client
    ///
    /// Long-poll requests hold the connection for up to the requested wait,
    /// so a configured request timeout must exceed it.
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Get the base URL of the orchestrator
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check that the orchestrator is up
    pub async fn health(&self) -> Result<()> {
        let response = self.client.get(self.url("/health")).send().await?;
        self.handle_empty_response(response).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Check the status code and deserialize a JSON body
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let response = Self::check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// Check the status code of a response that carries no body
    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        Self::check_status(response).await?;
        Ok(())
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        // The orchestrator answers errors as {"error": "..."}
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
            .unwrap_or(body);
        Err(ClientError::api_error(status.as_u16(), message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = OrchestratorClient::new("http://localhost:8080");
        assert_eq!(client.base_url(), "http://localhost:8080");
    }

    #[test]
    fn test_client_trims_trailing_slash() {
        let client = OrchestratorClient::new("http://localhost:8080/");
        assert_eq!(client.base_url(), "http://localhost:8080");
        assert_eq!(client.url("/api/jobs"), "http://localhost:8080/api/jobs");
    }

    #[test]
    fn test_client_with_custom_client() {
        let http_client = Client::new();
        let client = OrchestratorClient::with_client("http://localhost:8080", http_client);
        assert_eq!(client.base_url(), "http://localhost:8080");
    }
}
