//! Persistence seams for the hierarchy sync: the relational directory, the
//! external identity provider, and the content-addressed upload archive.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use tbs_core::{ManagerRole, RelationKind, StoreRecord, SyncRunSummary};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub mod memory;

pub const CRATE_NAME: &str = "tbs-storage";

/// Fixed suffix appended to the surname when provisioning a first password.
/// Accounts created this way must change it on first login; subsequent syncs
/// never touch the password again.
pub const INITIAL_PASSWORD_SUFFIX: &str = "951#";

/// Deterministic initial password: surname plus the fixed suffix, padded to
/// the provider's eight-character minimum.
pub fn initial_password(last_name: &str) -> String {
    let mut password = format!("{last_name}{INITIAL_PASSWORD_SUFFIX}");
    while password.len() < 8 {
        password.push('#');
    }
    password
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("corrupt directory row: {0}")]
    Data(String),
}

/// Mirrored user profile row as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub role: ManagerRole,
    pub active: bool,
}

/// Profile fields for a brand-new user row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUserProfile {
    pub email: String,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub role: ManagerRole,
}

/// Mutable profile fields applied on re-sync. Email and password are out of
/// scope on purpose: email is the identity key, the password belongs to the
/// provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfileUpdate {
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub role: ManagerRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreUpsert {
    pub id: Uuid,
    pub created: bool,
}

/// What activating an assignment did to the underlying row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentChange {
    Created,
    Reactivated,
    Unchanged,
}

/// Current state of one persisted relation row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignmentState {
    pub active: bool,
}

/// Relational store the pipeline writes through. Implemented by Postgres in
/// production and by [`memory::MemoryDirectory`] in tests.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn find_user_by_email(&self, email: &str)
        -> Result<Option<UserProfile>, DirectoryError>;

    async fn insert_user(&self, user: &NewUserProfile) -> Result<Uuid, DirectoryError>;

    async fn update_user(
        &self,
        id: Uuid,
        update: &UserProfileUpdate,
    ) -> Result<(), DirectoryError>;

    /// Create-or-update keyed by store code; the code itself is immutable.
    async fn upsert_store(&self, store: &StoreRecord) -> Result<StoreUpsert, DirectoryError>;

    async fn find_store_by_code(&self, code: &str) -> Result<Option<Uuid>, DirectoryError>;

    /// Ensure an active row exists for the relation pair, reviving an inactive
    /// historical row rather than inserting a duplicate.
    async fn activate_assignment(
        &self,
        kind: RelationKind,
        manager_id: Uuid,
        subject_id: Uuid,
    ) -> Result<AssignmentChange, DirectoryError>;

    /// Flip every active row of `kind` whose pair is absent from `keep` to
    /// inactive. Rows are never deleted. Returns the number deactivated.
    async fn deactivate_assignments_except(
        &self,
        kind: RelationKind,
        keep: &[(Uuid, Uuid)],
    ) -> Result<u32, DirectoryError>;

    async fn find_assignment(
        &self,
        kind: RelationKind,
        manager_id: Uuid,
        subject_id: Uuid,
    ) -> Result<Option<AssignmentState>, DirectoryError>;

    /// Append-only audit entry, one per run.
    async fn insert_sync_log(&self, summary: &SyncRunSummary) -> Result<(), DirectoryError>;

    async fn recent_sync_logs(&self, limit: i64) -> Result<Vec<SyncRunSummary>, DirectoryError>;
}

fn role_from_str(raw: &str) -> Result<ManagerRole, DirectoryError> {
    match raw {
        "regional_manager" => Ok(ManagerRole::RegionalManager),
        "area_manager" => Ok(ManagerRole::AreaManager),
        "store_manager" => Ok(ManagerRole::StoreManager),
        other => Err(DirectoryError::Data(format!("unknown role {other}"))),
    }
}

/// Postgres-backed directory. Schema lives under `migrations/`.
#[derive(Debug, Clone)]
pub struct PgDirectory {
    pool: PgPool,
}

/// (table, manager column, subject column) for each relation.
fn relation_table(kind: RelationKind) -> (&'static str, &'static str, &'static str) {
    match kind {
        RelationKind::StoreManagerToStore => {
            ("store_manager_assignments", "store_manager_id", "store_id")
        }
        RelationKind::AreaManagerToStore => {
            ("area_manager_store_assignments", "area_manager_id", "store_id")
        }
        RelationKind::RegionalToAreaManager => (
            "regional_area_manager_assignments",
            "regional_manager_id",
            "area_manager_id",
        ),
    }
}

impl PgDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, DirectoryError> {
        Ok(Self::new(PgPool::connect(database_url).await?))
    }

    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Directory for PgDirectory {
    async fn find_user_by_email(
        &self,
        email: &str,
    ) -> Result<Option<UserProfile>, DirectoryError> {
        let row = sqlx::query(
            r#"
            SELECT id, email, username, first_name, last_name, role, active
              FROM users
             WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let role: String = row.try_get("role")?;
            Ok(UserProfile {
                id: row.try_get("id")?,
                email: row.try_get("email")?,
                username: row.try_get("username")?,
                first_name: row.try_get("first_name")?,
                last_name: row.try_get("last_name")?,
                role: role_from_str(&role)?,
                active: row.try_get("active")?,
            })
        })
        .transpose()
    }

    async fn insert_user(&self, user: &NewUserProfile) -> Result<Uuid, DirectoryError> {
        let row = sqlx::query(
            r#"
            INSERT INTO users (email, username, first_name, last_name, role, active)
            VALUES ($1, $2, $3, $4, $5, TRUE)
            RETURNING id
            "#,
        )
        .bind(&user.email)
        .bind(&user.username)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(user.role.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn update_user(
        &self,
        id: Uuid,
        update: &UserProfileUpdate,
    ) -> Result<(), DirectoryError> {
        sqlx::query(
            r#"
            UPDATE users
               SET username = $2,
                   first_name = $3,
                   last_name = $4,
                   role = $5,
                   active = TRUE,
                   updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&update.username)
        .bind(&update.first_name)
        .bind(&update.last_name)
        .bind(update.role.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_store(&self, store: &StoreRecord) -> Result<StoreUpsert, DirectoryError> {
        let row = sqlx::query(
            r#"
            INSERT INTO stores (store_code, store_name, region, active)
            VALUES ($1, $2, $3, TRUE)
            ON CONFLICT (store_code) DO UPDATE
               SET store_name = EXCLUDED.store_name,
                   region = EXCLUDED.region,
                   active = TRUE,
                   updated_at = NOW()
            RETURNING id, (xmax = 0) AS created
            "#,
        )
        .bind(&store.code)
        .bind(&store.name)
        .bind(&store.region)
        .fetch_one(&self.pool)
        .await?;
        Ok(StoreUpsert {
            id: row.try_get("id")?,
            created: row.try_get("created")?,
        })
    }

    async fn find_store_by_code(&self, code: &str) -> Result<Option<Uuid>, DirectoryError> {
        let row = sqlx::query("SELECT id FROM stores WHERE store_code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| Ok(row.try_get("id")?)).transpose()
    }

    async fn activate_assignment(
        &self,
        kind: RelationKind,
        manager_id: Uuid,
        subject_id: Uuid,
    ) -> Result<AssignmentChange, DirectoryError> {
        let (table, manager_col, subject_col) = relation_table(kind);

        let existing = sqlx::query(&format!(
            "SELECT id, status FROM {table} WHERE {manager_col} = $1 AND {subject_col} = $2"
        ))
        .bind(manager_id)
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await?;

        match existing {
            None => {
                sqlx::query(&format!(
                    "INSERT INTO {table} ({manager_col}, {subject_col}, status) \
                     VALUES ($1, $2, 'active')"
                ))
                .bind(manager_id)
                .bind(subject_id)
                .execute(&self.pool)
                .await?;
                Ok(AssignmentChange::Created)
            }
            Some(row) => {
                let id: Uuid = row.try_get("id")?;
                let status: String = row.try_get("status")?;
                if status == "active" {
                    return Ok(AssignmentChange::Unchanged);
                }
                sqlx::query(&format!(
                    "UPDATE {table} \
                        SET status = 'active', deactivated_at = NULL, updated_at = NOW() \
                      WHERE id = $1"
                ))
                .bind(id)
                .execute(&self.pool)
                .await?;
                Ok(AssignmentChange::Reactivated)
            }
        }
    }

    async fn deactivate_assignments_except(
        &self,
        kind: RelationKind,
        keep: &[(Uuid, Uuid)],
    ) -> Result<u32, DirectoryError> {
        let (table, manager_col, subject_col) = relation_table(kind);

        let rows = sqlx::query(&format!(
            "SELECT id, {manager_col} AS manager_id, {subject_col} AS subject_id \
               FROM {table} WHERE status = 'active'"
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut deactivated = 0u32;
        for row in rows {
            let id: Uuid = row.try_get("id")?;
            let pair: (Uuid, Uuid) = (row.try_get("manager_id")?, row.try_get("subject_id")?);
            if keep.contains(&pair) {
                continue;
            }
            sqlx::query(&format!(
                "UPDATE {table} \
                    SET status = 'inactive', deactivated_at = NOW(), updated_at = NOW() \
                  WHERE id = $1"
            ))
            .bind(id)
            .execute(&self.pool)
            .await?;
            deactivated += 1;
        }
        debug!(relation = kind.as_str(), deactivated, "soft-removed stale assignments");
        Ok(deactivated)
    }

    async fn find_assignment(
        &self,
        kind: RelationKind,
        manager_id: Uuid,
        subject_id: Uuid,
    ) -> Result<Option<AssignmentState>, DirectoryError> {
        let (table, manager_col, subject_col) = relation_table(kind);
        let row = sqlx::query(&format!(
            "SELECT status FROM {table} WHERE {manager_col} = $1 AND {subject_col} = $2"
        ))
        .bind(manager_id)
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            let status: String = row.try_get("status")?;
            Ok(AssignmentState {
                active: status == "active",
            })
        })
        .transpose()
    }

    async fn insert_sync_log(&self, summary: &SyncRunSummary) -> Result<(), DirectoryError> {
        let payload = serde_json::to_value(summary)
            .map_err(|err| DirectoryError::Data(err.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO hierarchy_sync_logs
                (run_id, started_at, finished_at, source_sha256,
                 total_rows, succeeded_rows, failed_rows, payload)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(summary.run_id)
        .bind(summary.started_at)
        .bind(summary.finished_at)
        .bind(&summary.source_sha256)
        .bind(summary.total_rows as i64)
        .bind(summary.succeeded_rows as i64)
        .bind(summary.failed_rows as i64)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_sync_logs(&self, limit: i64) -> Result<Vec<SyncRunSummary>, DirectoryError> {
        let rows = sqlx::query(
            r#"
            SELECT payload
              FROM hierarchy_sync_logs
             ORDER BY started_at DESC
             LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let payload: serde_json::Value = row.try_get("payload")?;
                serde_json::from_value(payload)
                    .map_err(|err| DirectoryError::Data(err.to_string()))
            })
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("identity provider request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("identity provider rejected {email} with status {status}: {message}")]
    Rejected {
        email: String,
        status: u16,
        message: String,
    },
}

/// Account payload sent to the identity provider on first sight of a manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewAccount {
    pub email: String,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub role: ManagerRole,
    pub initial_password: String,
}

/// Hosted auth service the sync provisions accounts against. The trait exists
/// so tests can run against [`memory::MemoryIdentityProvider`].
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Create the account if the provider does not know the email yet. An
    /// already-existing account is success: the mirrored profile will be
    /// updated and the password left alone.
    async fn ensure_account(&self, account: &NewAccount) -> Result<(), ProvisionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct IdentityProviderConfig {
    pub base_url: String,
    pub api_token: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

/// REST client for the hosted identity provider. Transient transport failures
/// and 5xx/429 responses retry with bounded exponential backoff; anything
/// else surfaces as a per-entity provisioning error.
#[derive(Debug)]
pub struct RestIdentityProvider {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
    backoff: BackoffPolicy,
}

impl RestIdentityProvider {
    pub fn new(config: IdentityProviderConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token,
            backoff: config.backoff,
        })
    }
}

#[async_trait]
impl IdentityProvider for RestIdentityProvider {
    async fn ensure_account(&self, account: &NewAccount) -> Result<(), ProvisionError> {
        let url = format!("{}/accounts", self.base_url);
        let body = serde_json::json!({
            "email": account.email,
            "username": account.username,
            "password": account.initial_password,
            "first_name": account.first_name,
            "last_name": account.last_name,
            "role": account.role.as_str(),
        });

        let mut last_transport_error: Option<reqwest::Error> = None;
        for attempt in 0..=self.backoff.max_retries {
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.api_token)
                .json(&body)
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() || status == StatusCode::CONFLICT {
                        // CONFLICT means the account already exists; the
                        // mirrored profile update carries the rest.
                        debug!(email = %account.email, %status, "identity account ensured");
                        return Ok(());
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    let message = resp.text().await.unwrap_or_default();
                    return Err(ProvisionError::Rejected {
                        email: account.email.clone(),
                        status: status.as_u16(),
                        message,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_transport_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(ProvisionError::Transport(err));
                }
            }
        }

        Err(ProvisionError::Transport(
            last_transport_error.expect("retry loop captures a transport error"),
        ))
    }
}

/// Immutable, hash-addressed archive of uploaded workbooks. Re-uploading the
/// same bytes lands on the same path and is reported as deduplicated.
#[derive(Debug, Clone)]
pub struct UploadArchive {
    root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ArchivedUpload {
    pub sha256: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

impl UploadArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn relative_path(received_at: DateTime<Utc>, sha256: &str, extension: &str) -> PathBuf {
        let stamp = received_at.format("%Y%m%d_%H%M%S").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(stamp).join(format!("{sha256}.{ext}"))
    }

    /// Store the workbook bytes via an atomic temp-file rename.
    pub async fn store_bytes(
        &self,
        received_at: DateTime<Utc>,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedUpload> {
        use anyhow::Context;

        let sha256 = Self::sha256_hex(bytes);
        let relative_path = Self::relative_path(received_at, &sha256, extension);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating archive directory {}", parent.display()))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(ArchivedUpload {
                sha256,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = absolute_path
            .parent()
            .expect("archive path always has parent")
            .join(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp upload file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp upload file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp upload file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(ArchivedUpload {
                sha256,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(ArchivedUpload {
                    sha256,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp upload {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}
