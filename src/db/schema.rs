use anyhow::{Context, Result};
use sqlx::PgPool;

/// Create the ledger and broker tables if they do not exist yet.
///
/// Used by development runs and the PostgreSQL integration tests. Production
/// schema changes go through the migration tooling.
pub async fn init_schema(pool: &PgPool) -> Result<()> {
    tracing::info!("Initializing PostgreSQL schema...");

    for (name, ddl) in [
        ("accounts", CREATE_ACCOUNTS_TABLE),
        ("entries", CREATE_ENTRIES_TABLE),
        ("transfers", CREATE_TRANSFERS_TABLE),
        ("users", CREATE_USERS_TABLE),
        ("verify_emails", CREATE_VERIFY_EMAILS_TABLE),
        ("tasks", CREATE_TASKS_TABLE),
        ("tasks index", CREATE_TASKS_CLAIM_INDEX),
    ] {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .with_context(|| format!("Failed to create {}", name))?;
    }

    tracing::info!("PostgreSQL schema initialized successfully");
    Ok(())
}

pub const CREATE_ACCOUNTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id          BIGSERIAL PRIMARY KEY,
    owner       VARCHAR NOT NULL,
    balance     BIGINT NOT NULL,
    currency    VARCHAR NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (owner, currency)
)
"#;

pub const CREATE_ENTRIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS entries (
    id          BIGSERIAL PRIMARY KEY,
    account_id  BIGINT NOT NULL REFERENCES accounts (id),
    amount      BIGINT NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

pub const CREATE_TRANSFERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS transfers (
    id               BIGSERIAL PRIMARY KEY,
    from_account_id  BIGINT NOT NULL REFERENCES accounts (id),
    to_account_id    BIGINT NOT NULL REFERENCES accounts (id),
    amount           BIGINT NOT NULL CHECK (amount > 0),
    created_at       TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

pub const CREATE_USERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    username             VARCHAR PRIMARY KEY,
    hashed_password      VARCHAR NOT NULL,
    full_name            VARCHAR NOT NULL,
    email                VARCHAR UNIQUE NOT NULL,
    is_email_verified    BOOLEAN NOT NULL DEFAULT FALSE,
    password_changed_at  TIMESTAMPTZ NOT NULL DEFAULT '0001-01-01 00:00:00Z',
    created_at           TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

pub const CREATE_VERIFY_EMAILS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS verify_emails (
    id           BIGSERIAL PRIMARY KEY,
    username     VARCHAR NOT NULL REFERENCES users (username),
    email        VARCHAR NOT NULL,
    secret_code  VARCHAR NOT NULL,
    is_used      BOOLEAN NOT NULL DEFAULT FALSE,
    created_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    expired_at   TIMESTAMPTZ NOT NULL DEFAULT (NOW() + INTERVAL '15 minutes')
)
"#;

pub const CREATE_TASKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id                UUID PRIMARY KEY,
    task_type         VARCHAR NOT NULL,
    payload           BYTEA NOT NULL,
    queue             VARCHAR NOT NULL,
    max_retry         INTEGER NOT NULL,
    retried           INTEGER NOT NULL DEFAULT 0,
    last_error        TEXT,
    state             VARCHAR NOT NULL,
    process_at        TIMESTAMPTZ NOT NULL,
    lease_expires_at  TIMESTAMPTZ,
    created_at        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at        TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

pub const CREATE_TASKS_CLAIM_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS tasks_claim_idx ON tasks (queue, state, process_at)
"#;
