//! ID resolver
//!
//! Resolves UUID prefixes to full UUIDs by listing the candidates through the
//! API, so short unambiguous prefixes can be typed instead of full ids.

use anyhow::{Context, Result, anyhow};
use gantry_client::OrchestratorClient;
use uuid::Uuid;

use crate::types::IdOrPrefix;

/// Resolve a pipeline ID or prefix
pub async fn resolve_pipeline_id(client: &OrchestratorClient, input: &str) -> Result<Uuid> {
    let id = IdOrPrefix::parse(input);
    if let Some(uuid) = id.as_uuid() {
        return Ok(uuid);
    }

    let pipelines = client
        .list_pipelines(None)
        .await
        .context("Failed to fetch pipelines for ID resolution")?;
    pick_unique("pipeline", &id, pipelines.iter().map(|p| p.id))
}

/// Resolve a trigger ID or prefix among the triggers of a pipeline
pub async fn resolve_trigger_id(
    client: &OrchestratorClient,
    pipeline_id: Uuid,
    input: &str,
) -> Result<Uuid> {
    let id = IdOrPrefix::parse(input);
    if let Some(uuid) = id.as_uuid() {
        return Ok(uuid);
    }

    let triggers = client
        .list_triggers(pipeline_id)
        .await
        .context("Failed to fetch triggers for ID resolution")?;
    pick_unique("trigger", &id, triggers.iter().map(|t| t.id))
}

/// Resolve an execution ID or prefix
///
/// Executions are listed per pipeline, so a prefix needs the pipeline.
pub async fn resolve_execution_id(
    client: &OrchestratorClient,
    pipeline: Option<&str>,
    input: &str,
) -> Result<Uuid> {
    let id = IdOrPrefix::parse(input);
    if let Some(uuid) = id.as_uuid() {
        return Ok(uuid);
    }
    let pipeline = pipeline.ok_or_else(|| {
        anyhow!(
            "'{}' is not a full execution ID; pass --pipeline to resolve a prefix",
            input
        )
    })?;
    let pipeline_id = resolve_pipeline_id(client, pipeline).await?;

    let executions = client
        .list_executions(pipeline_id, 200)
        .await
        .context("Failed to fetch executions for ID resolution")?;
    pick_unique("execution", &id, executions.iter().map(|e| e.id))
}

/// Resolve a step ID or prefix among the steps of an execution
pub async fn resolve_step_id(
    client: &OrchestratorClient,
    execution_id: Option<Uuid>,
    input: &str,
) -> Result<Uuid> {
    let id = IdOrPrefix::parse(input);
    if let Some(uuid) = id.as_uuid() {
        return Ok(uuid);
    }
    let execution_id = execution_id.ok_or_else(|| {
        anyhow!(
            "'{}' is not a full step ID; pass --execution to resolve a prefix",
            input
        )
    })?;

    let detail = client
        .get_execution(execution_id)
        .await
        .context("Failed to fetch execution for step ID resolution")?;
    let steps = detail.stages.iter().flat_map(|s| s.steps.iter().map(|step| step.id));
    pick_unique("step", &id, steps)
}

/// Pick the single candidate matching `id`
fn pick_unique(kind: &str, id: &IdOrPrefix, candidates: impl Iterator<Item = Uuid>) -> Result<Uuid> {
    let matches: Vec<Uuid> = candidates.filter(|c| id.matches(*c)).collect();

    match matches.as_slice() {
        [] => Err(anyhow!("No {} found with ID starting with '{}'", kind, id)),
        [only] => Ok(*only),
        _ => {
            let ids: Vec<String> = matches.iter().map(Uuid::to_string).collect();
            Err(anyhow!(
                "Ambiguous prefix '{}' matches multiple {}s: {}",
                id,
                kind,
                ids.join(", ")
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid(s: &str) -> Uuid {
        Uuid::parse_str(s).unwrap()
    }

    #[test]
    fn test_pick_unique() {
        let a = uuid("3f2a0000-0000-4000-8000-000000000001");
        let b = uuid("3f2b0000-0000-4000-8000-000000000002");
        let candidates = [a, b];

        let found = pick_unique("pipeline", &IdOrPrefix::parse("3f2a"), candidates.into_iter());
        assert_eq!(found.unwrap(), a);

        let ambiguous = pick_unique("pipeline", &IdOrPrefix::parse("3f2"), candidates.into_iter());
        let message = ambiguous.unwrap_err().to_string();
        assert!(message.contains("Ambiguous"));
        assert!(message.contains(&b.to_string()));

        let missing = pick_unique("pipeline", &IdOrPrefix::parse("ff"), candidates.into_iter());
        assert!(missing.unwrap_err().to_string().contains("No pipeline"));
    }

    #[tokio::test]
    async fn test_full_execution_id_needs_no_lookup() {
        // Nothing listens here; a full UUID must resolve without a request
        let client = OrchestratorClient::new("http://127.0.0.1:9");
        let id = Uuid::new_v4();
        let resolved = resolve_execution_id(&client, None, &id.to_string()).await;
        assert_eq!(resolved.unwrap(), id);

        let prefix = resolve_execution_id(&client, None, "3f2a").await;
        assert!(prefix.unwrap_err().to_string().contains("--pipeline"));
    }
}
