use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::info;

use super::Database;
use crate::models::api::ExtractionConfig;
use crate::models::upload::{DocType, ExtractState, IngestState, Page, PageState, Schema, Upload};

/// PostgreSQL store for uploads, pages and schemas.
pub struct PostgresDatabase {
    pool: PgPool,
}

impl PostgresDatabase {
    pub async fn new(uri: &str, pool_size: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(pool_size)
            .acquire_timeout(std::time::Duration::from_secs(10))
            .connect(uri)
            .await?;

        info!("Connected to PostgreSQL (pool_size={pool_size})");
        Ok(Self { pool })
    }
}

fn upload_from_row(r: &sqlx::postgres::PgRow) -> Upload {
    Upload {
        id: r.get("id"),
        workspace_id: r.get("workspace_id"),
        filename: r.get("filename"),
        company: r.get("company"),
        year: r.get("year"),
        month: r.get("month"),
        doc_type: DocType::parse(r.get::<String, _>("doc_type").as_str()).unwrap_or(DocType::Pdf),
        state: IngestState::parse(r.get::<String, _>("state").as_str())
            .unwrap_or(IngestState::Error),
        message: r.get("message"),
        total_pages: r.get("total_pages"),
        current_page: r.get("current_page"),
        extract_state: ExtractState::parse(r.get::<String, _>("extract_state").as_str())
            .unwrap_or(ExtractState::None),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}

fn schema_from_row(r: &sqlx::postgres::PgRow) -> anyhow::Result<Schema> {
    let config: serde_json::Value = r.get("config");
    Ok(Schema {
        id: r.get("id"),
        workspace_id: r.get("workspace_id"),
        company: r.get("company"),
        name: r.get("name"),
        config: serde_json::from_value(config)?,
        is_default: r.get("is_default"),
        created_at: r.get("created_at"),
    })
}

const UPLOAD_COLUMNS: &str = "id, workspace_id, filename, company, year, month, doc_type, \
     state, message, total_pages, current_page, extract_state, created_at, updated_at";

#[async_trait]
impl Database for PostgresDatabase {
    async fn initialize(&self) -> anyhow::Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS uploads (
                id VARCHAR(12) PRIMARY KEY,
                workspace_id VARCHAR(36) NOT NULL,
                filename VARCHAR(1024) NOT NULL,
                company VARCHAR(100) NOT NULL,
                year INTEGER,
                month INTEGER,
                doc_type VARCHAR(10) NOT NULL DEFAULT 'pdf',
                state VARCHAR(20) NOT NULL DEFAULT 'queued',
                message TEXT NOT NULL DEFAULT '',
                total_pages INTEGER NOT NULL DEFAULT 0,
                current_page INTEGER NOT NULL DEFAULT 0,
                extract_state VARCHAR(20) NOT NULL DEFAULT 'none',
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT CURRENT_TIMESTAMP
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS pages (
                upload_id VARCHAR(12) NOT NULL REFERENCES uploads(id) ON DELETE CASCADE,
                page_num INTEGER NOT NULL,
                markdown TEXT,
                state VARCHAR(20) NOT NULL DEFAULT 'pending',
                error TEXT,
                PRIMARY KEY (upload_id, page_num)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schemas (
                id VARCHAR(12) PRIMARY KEY,
                workspace_id VARCHAR(36) NOT NULL,
                company VARCHAR(100) NOT NULL,
                name VARCHAR(255) NOT NULL,
                config JSONB NOT NULL,
                is_default BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT CURRENT_TIMESTAMP
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_uploads_workspace ON uploads(workspace_id, company)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_schemas_workspace ON schemas(workspace_id, company)",
        )
        .execute(&self.pool)
        .await?;

        info!("Database tables initialized");
        Ok(())
    }

    // ── Uploads ──────────────────────────────────────────────────────────

    async fn create_upload(&self, upload: &Upload) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO uploads (id, workspace_id, filename, company, year, month, doc_type,
                                  state, message, extract_state)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(&upload.id)
        .bind(&upload.workspace_id)
        .bind(&upload.filename)
        .bind(&upload.company)
        .bind(upload.year)
        .bind(upload.month)
        .bind(upload.doc_type.as_str())
        .bind(upload.state.as_str())
        .bind(&upload.message)
        .bind(upload.extract_state.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_upload(&self, id: &str, workspace_id: &str) -> anyhow::Result<Option<Upload>> {
        let row = sqlx::query(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM uploads WHERE id = $1 AND workspace_id = $2"
        ))
        .bind(id)
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(upload_from_row))
    }

    async fn get_upload_unscoped(&self, id: &str) -> anyhow::Result<Option<Upload>> {
        let row = sqlx::query(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM uploads WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(upload_from_row))
    }

    async fn list_uploads(&self, workspace_id: &str) -> anyhow::Result<Vec<Upload>> {
        let rows = sqlx::query(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM uploads WHERE workspace_id = $1 ORDER BY created_at DESC"
        ))
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(upload_from_row).collect())
    }

    async fn update_upload_meta(
        &self,
        id: &str,
        workspace_id: &str,
        company: Option<&str>,
        year: Option<i32>,
        month: Option<i32>,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE uploads SET
                company = COALESCE($3, company),
                year = COALESCE($4, year),
                month = COALESCE($5, month),
                updated_at = CURRENT_TIMESTAMP
             WHERE id = $1 AND workspace_id = $2",
        )
        .bind(id)
        .bind(workspace_id)
        .bind(company)
        .bind(year)
        .bind(month)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_upload(&self, id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM uploads WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_state(&self, id: &str, state: IngestState, message: &str) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE uploads SET state = $2, message = $3, updated_at = CURRENT_TIMESTAMP
             WHERE id = $1",
        )
        .bind(id)
        .bind(state.as_str())
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn try_transition(
        &self,
        id: &str,
        from: &[IngestState],
        to: IngestState,
        message: &str,
    ) -> anyhow::Result<bool> {
        let from_states: Vec<&str> = from.iter().map(|s| s.as_str()).collect();
        let result = sqlx::query(
            "UPDATE uploads SET state = $2, message = $3, updated_at = CURRENT_TIMESTAMP
             WHERE id = $1 AND state = ANY($4)",
        )
        .bind(id)
        .bind(to.as_str())
        .bind(message)
        .bind(&from_states)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_total_pages(&self, id: &str, total_pages: i32) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE uploads SET total_pages = $2, updated_at = CURRENT_TIMESTAMP WHERE id = $1",
        )
        .bind(id)
        .bind(total_pages)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn advance_current_page(&self, id: &str, current_page: i32) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE uploads SET current_page = $2, updated_at = CURRENT_TIMESTAMP
             WHERE id = $1 AND current_page < $2",
        )
        .bind(id)
        .bind(current_page)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset_current_page(&self, id: &str) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE uploads SET current_page = 0, updated_at = CURRENT_TIMESTAMP WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_extract_state(&self, id: &str, state: ExtractState) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE uploads SET extract_state = $2, updated_at = CURRENT_TIMESTAMP WHERE id = $1",
        )
        .bind(id)
        .bind(state.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn comparable_uploads(
        &self,
        workspace_id: &str,
        company: &str,
        exclude_id: &str,
    ) -> anyhow::Result<Vec<Upload>> {
        let rows = sqlx::query(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM uploads
             WHERE workspace_id = $1 AND company = $2 AND extract_state = 'done' AND id != $3
             ORDER BY created_at DESC"
        ))
        .bind(workspace_id)
        .bind(company)
        .bind(exclude_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(upload_from_row).collect())
    }

    async fn uploads_needing_reextract(
        &self,
        workspace_id: &str,
        company: &str,
    ) -> anyhow::Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT id FROM uploads
             WHERE workspace_id = $1 AND company = $2 AND state = 'done'
               AND extract_state IN ('none', 'no_config', 'error')",
        )
        .bind(workspace_id)
        .bind(company)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    // ── Pages ────────────────────────────────────────────────────────────

    async fn upsert_page_pending(&self, upload_id: &str, page_num: i32) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO pages (upload_id, page_num, state) VALUES ($1, $2, 'pending')
             ON CONFLICT (upload_id, page_num) DO NOTHING",
        )
        .bind(upload_id)
        .bind(page_num)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_page(&self, upload_id: &str, page_num: i32) -> anyhow::Result<Option<Page>> {
        let row = sqlx::query(
            "SELECT upload_id, page_num, markdown, state, error FROM pages
             WHERE upload_id = $1 AND page_num = $2",
        )
        .bind(upload_id)
        .bind(page_num)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Page {
            upload_id: r.get("upload_id"),
            page_num: r.get("page_num"),
            markdown: r.get("markdown"),
            state: PageState::parse(r.get::<String, _>("state").as_str())
                .unwrap_or(PageState::Error),
            error: r.get("error"),
        }))
    }

    async fn page_states(&self, upload_id: &str) -> anyhow::Result<Vec<(i32, PageState)>> {
        let rows = sqlx::query(
            "SELECT page_num, state FROM pages WHERE upload_id = $1 ORDER BY page_num",
        )
        .bind(upload_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| {
                (
                    r.get("page_num"),
                    PageState::parse(r.get::<String, _>("state").as_str())
                        .unwrap_or(PageState::Error),
                )
            })
            .collect())
    }

    async fn pages_to_parse(
        &self,
        upload_id: &str,
        include_errors: bool,
    ) -> anyhow::Result<Vec<i32>> {
        let query = if include_errors {
            "SELECT page_num FROM pages WHERE upload_id = $1 AND state IN ('pending', 'error')
             ORDER BY page_num"
        } else {
            "SELECT page_num FROM pages WHERE upload_id = $1 AND state = 'pending'
             ORDER BY page_num"
        };
        let rows = sqlx::query(query)
            .bind(upload_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("page_num")).collect())
    }

    async fn set_page_running(&self, upload_id: &str, page_num: i32) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE pages SET state = 'running', error = NULL
             WHERE upload_id = $1 AND page_num = $2",
        )
        .bind(upload_id)
        .bind(page_num)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_page_done(
        &self,
        upload_id: &str,
        page_num: i32,
        markdown: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE pages SET markdown = $3, state = 'done', error = NULL
             WHERE upload_id = $1 AND page_num = $2",
        )
        .bind(upload_id)
        .bind(page_num)
        .bind(markdown)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_page_error(
        &self,
        upload_id: &str,
        page_num: i32,
        error: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE pages SET state = 'error', error = $3
             WHERE upload_id = $1 AND page_num = $2",
        )
        .bind(upload_id)
        .bind(page_num)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_page_markdown(
        &self,
        upload_id: &str,
        page_num: i32,
        markdown: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE pages SET markdown = $3 WHERE upload_id = $1 AND page_num = $2",
        )
        .bind(upload_id)
        .bind(page_num)
        .bind(markdown)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset_pages_for_reparse(&self, upload_id: &str) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE pages SET state = 'pending', markdown = NULL, error = NULL
             WHERE upload_id = $1",
        )
        .bind(upload_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_terminal_pages(&self, upload_id: &str) -> anyhow::Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM pages
             WHERE upload_id = $1 AND state IN ('done', 'error')",
        )
        .bind(upload_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("n"))
    }

    async fn count_pages_in_state(
        &self,
        upload_id: &str,
        state: PageState,
    ) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM pages WHERE upload_id = $1 AND state = $2")
            .bind(upload_id)
            .bind(state.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    async fn done_page_markdown(&self, upload_id: &str) -> anyhow::Result<Vec<(i32, String)>> {
        let rows = sqlx::query(
            "SELECT page_num, markdown FROM pages
             WHERE upload_id = $1 AND state = 'done' ORDER BY page_num",
        )
        .bind(upload_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| {
                (
                    r.get("page_num"),
                    r.get::<Option<String>, _>("markdown").unwrap_or_default(),
                )
            })
            .collect())
    }

    // ── Schemas ──────────────────────────────────────────────────────────

    async fn create_schema(&self, schema: &Schema) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO schemas (id, workspace_id, company, name, config, is_default)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&schema.id)
        .bind(&schema.workspace_id)
        .bind(&schema.company)
        .bind(&schema.name)
        .bind(serde_json::to_value(&schema.config)?)
        .bind(schema.is_default)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_schema(&self, id: &str, workspace_id: &str) -> anyhow::Result<Option<Schema>> {
        let row = sqlx::query(
            "SELECT id, workspace_id, company, name, config, is_default, created_at
             FROM schemas WHERE id = $1 AND workspace_id = $2",
        )
        .bind(id)
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(schema_from_row).transpose()
    }

    async fn list_schemas(
        &self,
        workspace_id: &str,
        company: Option<&str>,
    ) -> anyhow::Result<Vec<Schema>> {
        let rows = sqlx::query(
            "SELECT id, workspace_id, company, name, config, is_default, created_at
             FROM schemas
             WHERE workspace_id = $1 AND ($2::varchar IS NULL OR company = $2)
             ORDER BY created_at DESC",
        )
        .bind(workspace_id)
        .bind(company)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(schema_from_row).collect()
    }

    async fn update_schema(
        &self,
        id: &str,
        workspace_id: &str,
        company: Option<&str>,
        name: Option<&str>,
        config: Option<&ExtractionConfig>,
    ) -> anyhow::Result<bool> {
        let config_json = config.map(serde_json::to_value).transpose()?;
        let result = sqlx::query(
            "UPDATE schemas SET
                company = COALESCE($3, company),
                name = COALESCE($4, name),
                config = COALESCE($5, config)
             WHERE id = $1 AND workspace_id = $2",
        )
        .bind(id)
        .bind(workspace_id)
        .bind(company)
        .bind(name)
        .bind(config_json)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_schema(&self, id: &str, workspace_id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM schemas WHERE id = $1 AND workspace_id = $2")
            .bind(id)
            .bind(workspace_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_default_schema(&self, id: &str, workspace_id: &str) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT company FROM schemas WHERE id = $1 AND workspace_id = $2")
            .bind(id)
            .bind(workspace_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(false);
        };
        let company: String = row.get("company");

        sqlx::query(
            "UPDATE schemas SET is_default = FALSE WHERE workspace_id = $1 AND company = $2",
        )
        .bind(workspace_id)
        .bind(&company)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE schemas SET is_default = TRUE WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn get_default_schema(
        &self,
        workspace_id: &str,
        company: &str,
    ) -> anyhow::Result<Option<Schema>> {
        let row = sqlx::query(
            "SELECT id, workspace_id, company, name, config, is_default, created_at
             FROM schemas
             WHERE workspace_id = $1 AND company = $2 AND is_default = TRUE",
        )
        .bind(workspace_id)
        .bind(company)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(schema_from_row).transpose()
    }

    // ── Crash recovery ───────────────────────────────────────────────────

    async fn recover_interrupted(&self) -> anyhow::Result<()> {
        let pages = sqlx::query("UPDATE pages SET state = 'pending' WHERE state = 'running'")
            .execute(&self.pool)
            .await?;

        let uploads = sqlx::query(
            "UPDATE uploads SET state = 'interrupted',
                    message = 'Interrupted by restart; resume to continue',
                    updated_at = CURRENT_TIMESTAMP
             WHERE state IN ('queued', 'rendering', 'parsing')",
        )
        .execute(&self.pool)
        .await?;

        if pages.rows_affected() > 0 || uploads.rows_affected() > 0 {
            info!(
                "Recovered {} running pages, {} in-flight uploads",
                pages.rows_affected(),
                uploads.rows_affected()
            );
        }
        Ok(())
    }
}
