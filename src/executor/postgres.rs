//! tokio-postgres destination.

use super::{Destination, ExecError};
use crate::error::{PipelineError, Result};
use crate::schema::{SchemaInfo, SchemaSource};
use async_trait::async_trait;
use tokio_postgres::{Client, Config as PgConfig, NoTls, SimpleQueryMessage};
use tracing::{debug, info, warn};

const TABLES_SQL: &str = "SELECT table_name::text FROM information_schema.tables \
     WHERE table_schema = $1 AND table_type = 'BASE TABLE' ORDER BY table_name";

const COLUMNS_SQL: &str = "SELECT table_name::text, column_name::text FROM information_schema.columns \
     WHERE table_schema = $1 ORDER BY table_name, ordinal_position";

const FOREIGN_KEYS_SQL: &str = "SELECT DISTINCT tc.table_name::text, ccu.table_name::text \
     FROM information_schema.table_constraints tc \
     JOIN information_schema.constraint_column_usage ccu \
       ON tc.constraint_name = ccu.constraint_name \
      AND tc.constraint_schema = ccu.constraint_schema \
     WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_schema = $1 \
     ORDER BY 1, 2";

/// A single PostgreSQL connection used as executor destination.
pub struct PgDestination {
    client: Client,
    database: String,
    schema: String,
}

impl PgDestination {
    /// Connect to `database` using a libpq-style connection string.
    pub async fn connect(connection: &str, database: &str) -> Result<Self> {
        let mut config: PgConfig = connection
            .parse()
            .map_err(|e| PipelineError::Config(format!("invalid destination: {}", e)))?;
        config.dbname(database);

        let (client, conn) = config
            .connect(NoTls)
            .await
            .map_err(|e| PipelineError::Connection(format!("{}: {}", database, e)))?;

        let db = database.to_string();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                warn!(database = %db, "destination connection closed: {}", e);
            }
        });

        info!(database, "connected to destination");
        Ok(Self {
            client,
            database: database.to_string(),
            schema: "public".to_string(),
        })
    }

    /// Schema whose tables are read for FK ordering (default `public`)
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn database(&self) -> &str {
        &self.database
    }
}

fn map_error(e: tokio_postgres::Error) -> ExecError {
    if let Some(db) = e.as_db_error() {
        let mut message = db.message().to_string();
        if let Some(detail) = db.detail() {
            message.push_str(" (");
            message.push_str(detail);
            message.push(')');
        }
        return ExecError::Statement {
            message,
            code: Some(db.code().code().to_string()),
        };
    }
    ExecError::Connection(e.to_string())
}

#[async_trait]
impl Destination for PgDestination {
    async fn execute(&mut self, sql: &str) -> std::result::Result<u64, ExecError> {
        if self.client.is_closed() {
            return Err(ExecError::Connection("client is closed".into()));
        }
        let messages = self.client.simple_query(sql).await.map_err(map_error)?;
        let rows = messages
            .iter()
            .map(|m| match m {
                SimpleQueryMessage::CommandComplete(n) => *n,
                _ => 0,
            })
            .sum();
        Ok(rows)
    }
}

#[async_trait]
impl SchemaSource for PgDestination {
    async fn schema_info(&mut self) -> Result<SchemaInfo> {
        let query_err = |e: tokio_postgres::Error| {
            PipelineError::Connection(format!("schema query on {}: {}", self.database, e))
        };

        let mut info = SchemaInfo::new();
        for row in self
            .client
            .query(TABLES_SQL, &[&self.schema])
            .await
            .map_err(query_err)?
        {
            info.add_table(&row.get::<_, String>(0));
        }
        for row in self
            .client
            .query(COLUMNS_SQL, &[&self.schema])
            .await
            .map_err(query_err)?
        {
            let table: String = row.get(0);
            if info.get_table_id(&table).is_some() {
                info.add_column(&table, &row.get::<_, String>(1));
            }
        }
        for row in self
            .client
            .query(FOREIGN_KEYS_SQL, &[&self.schema])
            .await
            .map_err(query_err)?
        {
            let table: String = row.get(0);
            let referenced: String = row.get(1);
            info.add_reference(&table, &referenced);
        }

        debug!(database = %self.database, tables = info.len(), "loaded destination schema");
        Ok(info)
    }
}
