use anyhow::{Context, Result};
use quarry_schema::schema::Provider;
use sqlx::any::{AnyKind, AnyPool, AnyPoolOptions};
use sqlx::Executor;

/// Database connection pool bound to one provider.
#[derive(Debug, Clone)]
pub struct DataConn {
    pub pool: AnyPool,
}

impl DataConn {
    pub async fn connect(uri: &str, max_connections: usize) -> Result<Self> {
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections as u32)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if matches!(conn.kind(), AnyKind::Sqlite) {
                        conn.execute("PRAGMA journal_mode=WAL;").await?;
                        conn.execute("PRAGMA foreign_keys=ON;").await?;
                    }
                    Ok(())
                })
            })
            .connect(uri)
            .await
            .with_context(|| format!("failed to connect to {}", uri))?;
        Ok(Self { pool })
    }

    pub fn kind(&self) -> Provider {
        match self.pool.any_kind() {
            AnyKind::Sqlite => Provider::Sqlite,
            AnyKind::Postgres => Provider::Postgres,
            AnyKind::MySql => Provider::MySql,
        }
    }
}
