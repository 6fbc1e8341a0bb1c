use crate::postgres::PostgresConfig;
use anyhow::{Context, Result};
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;
use tracing::{debug, info};

const APPLICATION_NAME: &str = "aqms-ingest";

/// Pooled PostgreSQL connections shared by the reading sink
#[derive(Clone)]
pub struct PostgresClient {
    pool: Pool,
}

impl PostgresClient {
    /// Build the pool from `config`
    ///
    /// Connections are opened lazily on checkout, so a wrong host only shows
    /// up on [`ping`](Self::ping) or the first write.
    pub fn new(config: &PostgresConfig) -> Result<Self> {
        let mut cfg = Config::new();
        cfg.host = Some(config.host.clone());
        cfg.port = Some(config.port);
        cfg.dbname = Some(config.database.clone());
        cfg.user = Some(config.username.clone());
        cfg.password = Some(config.password.clone());
        cfg.application_name = Some(APPLICATION_NAME.to_string());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(PoolConfig::new(config.max_pool_size));

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .with_context(|| format!("invalid PostgreSQL settings for {}", config.host))?;

        Ok(Self { pool })
    }

    /// Check out a connection and run a trivial query
    pub async fn ping(&self) -> Result<()> {
        let conn = self.get_connection().await?;
        conn.simple_query("SELECT 1")
            .await
            .context("PostgreSQL ping query failed")?;

        let status = self.pool.status();
        debug!(
            open = status.size,
            max = status.max_size,
            "PostgreSQL reachable"
        );
        Ok(())
    }

    pub async fn get_connection(&self) -> Result<deadpool_postgres::Client> {
        self.pool
            .get()
            .await
            .context("no PostgreSQL connection available")
    }

    /// Stop handing out connections; ones in use close when returned
    pub fn close(&self) {
        self.pool.close();
        info!("PostgreSQL pool closed");
    }
}
