use std::{env, sync::Arc};

use anyhow::{Context, Result, anyhow};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::info;
use uuid::Uuid;

use crate::config::ExportConfig;

#[derive(Clone)]
pub struct AppState {
    pool: PgPool,
    config: Arc<ExportConfig>,
}

impl AppState {
    pub async fn new() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL env var is missing")?;

        let config = ExportConfig::from_env().context("failed to load export settings")?;
        config
            .ensure_directories()
            .context("failed to prepare storage directories")?;

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&database_url)
            .await
            .context("failed to connect to Postgres")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run database migrations")?;

        Ok(Self {
            pool,
            config: Arc::new(config),
        })
    }

    /// Seeds a default organization and admin account on first start so the
    /// API is reachable before any real users exist.
    pub async fn ensure_seed_admin(&self) -> Result<()> {
        let has_admin: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE is_admin = TRUE)")
                .fetch_one(&self.pool)
                .await
                .context("failed to verify admin presence")?;

        if has_admin {
            return Ok(());
        }

        let organization_id: Uuid = match sqlx::query_scalar(
            "SELECT id FROM organizations ORDER BY created_at LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("failed to look up default organization")?
        {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4();
                sqlx::query("INSERT INTO organizations (id, title) VALUES ($1, $2)")
                    .bind(id)
                    .bind("Default organization")
                    .execute(&self.pool)
                    .await
                    .context("failed to create default organization")?;
                id
            }
        };

        let password_hash = crate::web::auth::hash_password("change-me")
            .map_err(|err| anyhow!("failed to hash seed admin password: {err}"))?;
        let api_token = Uuid::new_v4();

        sqlx::query(
            "INSERT INTO users (id, username, password_hash, api_token, organization_id, is_admin) VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(Uuid::new_v4())
        .bind("demo-admin")
        .bind(password_hash)
        .bind(api_token)
        .bind(organization_id)
        .bind(true)
        .execute(&self.pool)
        .await
        .context("failed to insert seed admin user")?;

        info!(
            %api_token,
            "Seeded default admin user 'demo-admin' (password: 'change-me'). Update it promptly."
        );

        Ok(())
    }

    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }

    pub fn pool_ref(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }
}
