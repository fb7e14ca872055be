use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

const SCHEMA: &[&str] = &[
    // Pipelines and triggers
    r#"
    CREATE TABLE IF NOT EXISTS pipelines (
        id UUID PRIMARY KEY,
        repo_id VARCHAR(255) NOT NULL,
        uid VARCHAR(255) NOT NULL,
        description TEXT,
        config_path TEXT NOT NULL,
        default_branch VARCHAR(255) NOT NULL,
        seq BIGINT NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        UNIQUE (repo_id, uid)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS triggers (
        id UUID PRIMARY KEY,
        pipeline_id UUID NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
        uid VARCHAR(255) NOT NULL,
        description TEXT,
        actions TEXT[] NOT NULL DEFAULT '{}',
        ref_patterns TEXT[] NOT NULL DEFAULT '{}',
        path_patterns TEXT[] NOT NULL DEFAULT '{}',
        enabled BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        UNIQUE (pipeline_id, uid)
    )
    "#,
    // Executions, stages, steps and logs
    r#"
    CREATE TABLE IF NOT EXISTS executions (
        id UUID PRIMARY KEY,
        pipeline_id UUID NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
        repo_id VARCHAR(255) NOT NULL,
        number BIGINT NOT NULL,
        cause VARCHAR(50) NOT NULL,
        source_ref TEXT NOT NULL,
        target_ref TEXT NOT NULL,
        commit_sha VARCHAR(64) NOT NULL,
        before_sha VARCHAR(64),
        status VARCHAR(50) NOT NULL,
        fail_fast BOOLEAN NOT NULL DEFAULT FALSE,
        params JSONB NOT NULL DEFAULT '{}',
        idempotency_key TEXT,
        source_stream VARCHAR(255),
        source_offset BIGINT,
        triggered_by VARCHAR(255),
        error TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        started_at TIMESTAMPTZ,
        finished_at TIMESTAMPTZ,
        updated_at TIMESTAMPTZ NOT NULL,
        UNIQUE (pipeline_id, number),
        UNIQUE (pipeline_id, idempotency_key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stages (
        id UUID PRIMARY KEY,
        execution_id UUID NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
        number INTEGER NOT NULL,
        name VARCHAR(255) NOT NULL,
        depends_on TEXT[] NOT NULL DEFAULT '{}',
        labels TEXT[] NOT NULL DEFAULT '{}',
        status VARCHAR(50) NOT NULL,
        lease_runner VARCHAR(255),
        lease_expires_at TIMESTAMPTZ,
        reclaims INTEGER NOT NULL DEFAULT 0,
        cancel_requested BOOLEAN NOT NULL DEFAULT FALSE,
        fail_fast BOOLEAN NOT NULL DEFAULT FALSE,
        error TEXT,
        started_at TIMESTAMPTZ,
        finished_at TIMESTAMPTZ,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS steps (
        id UUID PRIMARY KEY,
        stage_id UUID NOT NULL REFERENCES stages(id) ON DELETE CASCADE,
        execution_id UUID NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
        number INTEGER NOT NULL,
        name VARCHAR(255) NOT NULL,
        image TEXT,
        commands TEXT[] NOT NULL DEFAULT '{}',
        env JSONB NOT NULL DEFAULT '{}',
        secrets TEXT[] NOT NULL DEFAULT '{}',
        status VARCHAR(50) NOT NULL,
        exit_code INTEGER,
        error TEXT,
        started_at TIMESTAMPTZ,
        finished_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS step_logs (
        id BIGSERIAL PRIMARY KEY,
        step_id UUID NOT NULL REFERENCES steps(id) ON DELETE CASCADE,
        timestamp TIMESTAMPTZ NOT NULL,
        source VARCHAR(20) NOT NULL,
        message TEXT NOT NULL
    )
    "#,
    // Webhooks
    r#"
    CREATE TABLE IF NOT EXISTS webhooks (
        id UUID PRIMARY KEY,
        scope_type VARCHAR(50) NOT NULL,
        scope_id VARCHAR(255) NOT NULL,
        display_name VARCHAR(255) NOT NULL,
        url TEXT NOT NULL,
        secret TEXT NOT NULL DEFAULT '',
        triggers TEXT[] NOT NULL DEFAULT '{}',
        enabled BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS webhook_deliveries (
        id UUID PRIMARY KEY,
        webhook_id UUID NOT NULL REFERENCES webhooks(id) ON DELETE CASCADE,
        chain_id UUID NOT NULL,
        attempt INTEGER NOT NULL,
        trigger VARCHAR(50) NOT NULL,
        event_stream VARCHAR(255),
        event_offset BIGINT,
        retrigger_of UUID,
        request_body TEXT NOT NULL,
        result VARCHAR(50) NOT NULL,
        response_status INTEGER,
        response_body TEXT,
        error TEXT,
        duration_ms BIGINT NOT NULL,
        next_retry_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    // Background jobs, commit checks, runners
    r#"
    CREATE TABLE IF NOT EXISTS background_jobs (
        id VARCHAR(255) PRIMARY KEY,
        kind VARCHAR(255) NOT NULL,
        payload JSONB NOT NULL DEFAULT 'null',
        state VARCHAR(50) NOT NULL,
        schedule JSONB NOT NULL,
        run_at TIMESTAMPTZ NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        last_error TEXT,
        result JSONB,
        lease_holder VARCHAR(255),
        lease_expires_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS checks (
        repo_id VARCHAR(255) NOT NULL,
        commit_sha VARCHAR(64) NOT NULL,
        uid VARCHAR(255) NOT NULL,
        status VARCHAR(50) NOT NULL,
        summary TEXT NOT NULL,
        link TEXT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (repo_id, commit_sha, uid)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS runners (
        id VARCHAR(255) PRIMARY KEY,
        labels TEXT[] NOT NULL DEFAULT '{}',
        registered_at TIMESTAMPTZ NOT NULL,
        last_seen_at TIMESTAMPTZ NOT NULL
    )
    "#,
    // Coordination: leases and the event log
    r#"
    CREATE TABLE IF NOT EXISTS leases (
        key VARCHAR(512) PRIMARY KEY,
        holder VARCHAR(255),
        expires_at TIMESTAMPTZ NOT NULL,
        token BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS event_streams (
        stream VARCHAR(255) PRIMARY KEY,
        last_offset BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS events (
        stream VARCHAR(255) NOT NULL,
        event_offset BIGINT NOT NULL,
        partition_key VARCHAR(255) NOT NULL,
        payload BYTEA NOT NULL,
        produced_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (stream, event_offset)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS event_checkpoints (
        stream VARCHAR(255) NOT NULL,
        consumer_group VARCHAR(255) NOT NULL,
        event_offset BIGINT NOT NULL,
        PRIMARY KEY (stream, consumer_group)
    )
    "#,
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_executions_pipeline ON executions(pipeline_id, number DESC)",
    "CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status)",
    "CREATE INDEX IF NOT EXISTS idx_stages_execution ON stages(execution_id, number)",
    "CREATE INDEX IF NOT EXISTS idx_stages_status ON stages(status)",
    "CREATE INDEX IF NOT EXISTS idx_steps_stage ON steps(stage_id, number)",
    "CREATE INDEX IF NOT EXISTS idx_step_logs_step ON step_logs(step_id, id)",
    "CREATE INDEX IF NOT EXISTS idx_webhooks_scope ON webhooks(scope_type, scope_id)",
    "CREATE INDEX IF NOT EXISTS idx_deliveries_webhook ON webhook_deliveries(webhook_id, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_deliveries_event ON webhook_deliveries(webhook_id, event_stream, event_offset)",
    "CREATE INDEX IF NOT EXISTS idx_deliveries_chain ON webhook_deliveries(chain_id, attempt)",
    "CREATE INDEX IF NOT EXISTS idx_background_jobs_due ON background_jobs(state, run_at)",
];

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA.iter().chain(INDEXES) {
        sqlx::query(statement).execute(pool).await?;
    }

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
