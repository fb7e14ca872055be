//! Execution endpoints
//!
//! Running and canceling pipelines, reading execution trees and following
//! step logs over server-sent events.

use uuid::Uuid;

use gantry_core::domain::execution::Execution;
use gantry_core::domain::log::LogLine;
use gantry_core::dto::execution::{CancelExecution, ExecutionDetail, RunPipeline};

use crate::OrchestratorClient;
use crate::error::{ClientError, Result};

impl OrchestratorClient {
    // =============================================================================
    // Execution Lifecycle
    // =============================================================================

    /// Start a manual execution of a pipeline
    pub async fn run_pipeline(&self, pipeline_id: Uuid, req: RunPipeline) -> Result<Execution> {
        let response = self
            .client
            .post(self.url(&format!("/api/pipelines/{}/executions", pipeline_id)))
            .json(&req)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Request cancellation of an execution
    ///
    /// The returned execution is usually still running: cancellation is
    /// carried out asynchronously and observed through [`Self::get_execution`].
    pub async fn cancel_execution(&self, execution_id: Uuid, req: CancelExecution) -> Result<Execution> {
        let response = self
            .client
            .post(self.url(&format!("/api/executions/{}/cancel", execution_id)))
            .json(&req)
            .send()
            .await?;

        self.handle_response(response).await
    }

    // =============================================================================
    // Execution Query
    // =============================================================================

    /// Executions of a pipeline, newest first
    pub async fn list_executions(&self, pipeline_id: Uuid, limit: u32) -> Result<Vec<Execution>> {
        let response = self
            .client
            .get(self.url(&format!("/api/pipelines/{}/executions", pipeline_id)))
            .query(&[("limit", limit)])
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// An execution with its stages and steps
    pub async fn get_execution(&self, execution_id: Uuid) -> Result<ExecutionDetail> {
        let response = self
            .client
            .get(self.url(&format!("/api/executions/{}", execution_id)))
            .send()
            .await?;

        self.handle_response(response).await
    }

    // =============================================================================
    // Step Logs
    // =============================================================================

    pub async fn get_step_logs(&self, step_id: Uuid) -> Result<Vec<LogLine>> {
        let response = self
            .client
            .get(self.url(&format!("/api/steps/{}/logs", step_id)))
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Follow a step's log until the step finishes
    ///
    /// Calls `on_line` for every stored line and then for each line as it
    /// arrives. Returns the number of lines seen.
    pub async fn follow_step_logs<F>(&self, step_id: Uuid, mut on_line: F) -> Result<usize>
    where
        F: FnMut(LogLine),
    {
        let response = self
            .client
            .get(self.url(&format!("/api/steps/{}/logs/stream", step_id)))
            .send()
            .await?;
        let mut response = Self::check_status(response).await?;

        let mut frames = SseFrames::default();
        let mut seen = 0;
        while let Some(chunk) = response.chunk().await? {
            for frame in frames.push(&chunk) {
                if frame.event.as_deref() != Some("log") {
                    continue;
                }
                let line: LogLine = serde_json::from_str(&frame.data).map_err(|e| {
                    ClientError::ParseError(format!("Invalid log event: {}", e))
                })?;
                on_line(line);
                seen += 1;
            }
        }
        tracing::debug!("Log stream of step {} ended after {} lines", step_id, seen);
        Ok(seen)
    }
}

/// One server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental parser for a `text/event-stream` body
#[derive(Debug, Default)]
pub(crate) struct SseFrames {
    /// Bytes of a character split across chunks
    pending: Vec<u8>,
    buffer: String,
}

impl SseFrames {
    /// Feed a chunk; returns the frames it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.pending.extend_from_slice(chunk);
        let valid = match std::str::from_utf8(&self.pending) {
            Ok(text) => text.len(),
            Err(e) => e.valid_up_to(),
        };
        let text: Vec<u8> = self.pending.drain(..valid).collect();
        self.buffer.push_str(&String::from_utf8_lossy(&text));
        if self.buffer.contains('\r') {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }

        let mut frames = Vec::new();
        while let Some(end) = self.buffer.find("\n\n") {
            let raw: String = self.buffer.drain(..end + 2).collect();
            let mut event = None;
            let mut data = Vec::new();
            for line in raw.lines() {
                // Comments carry keep-alives
                if line.starts_with(':') {
                    continue;
                }
                let (field, value) = line.split_once(':').unwrap_or((line, ""));
                let value = value.strip_prefix(' ').unwrap_or(value);
                match field {
                    "event" => event = Some(value.to_string()),
                    "data" => data.push(value),
                    _ => {}
                }
            }
            if !data.is_empty() {
                frames.push(SseFrame {
                    event,
                    data: data.join("\n"),
                });
            }
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_split_across_chunks() {
        let mut frames = SseFrames::default();
        assert!(frames.push(b"event: log\ndata: {\"a\"").is_empty());
        let done = frames.push(b":1}\n\n: ping\n\nevent: log\ndata: 2\n\n");
        assert_eq!(
            done,
            vec![
                SseFrame {
                    event: Some("log".to_string()),
                    data: "{\"a\":1}".to_string()
                },
                SseFrame {
                    event: Some("log".to_string()),
                    data: "2".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_multiline_data_and_crlf() {
        let mut frames = SseFrames::default();
        let done = frames.push(b"data: one\r\ndata: two\r\n\r\n");
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].event, None);
        assert_eq!(done[0].data, "one\ntwo");
    }

    #[test]
    fn test_character_split_across_chunks() {
        let mut frames = SseFrames::default();
        let bytes = "data: é\n\n".as_bytes();
        let split = bytes.iter().position(|&b| b == 0xc3).unwrap() + 1;
        assert!(frames.push(&bytes[..split]).is_empty());
        let done = frames.push(&bytes[split..]);
        assert_eq!(done[0].data, "é");
    }
}
