use async_trait::async_trait;
use chrono::Utc;

use common::error::EngineError;
use common::plugin::sql::{SqlExecutionResult, SqlValue};
use common::plugin::{BuildExecutionResult, BuildPlugin, EmbeddableChunk};
use db_introspection::dialects::duckdb::{DuckDbConfigFile, DuckDbDialect};
use db_introspection::dialects::postgres::{PostgresConfigFile, PostgresDialect};
use db_introspection::dialects::sqlite::{SqliteConfigFile, SqliteDialect};
use db_introspection::introspector::{self, SqlDialect};
use db_introspection::scope::IntrospectionScope;
use db_introspection::types::DatabaseIntrospectionResult;

use super::database_chunker::build_database_chunks;

pub const DATABASE_PLUGIN_NAME: &str = "databases";

pub const SQLITE_FULL_TYPE: &str = "databases/sqlite";
pub const DUCKDB_FULL_TYPE: &str = "databases/duckdb";
pub const POSTGRES_FULL_TYPE: &str = "databases/postgres";

/// SQL database datasources: execution introspects the database through the
/// dialect adapter; chunking emits one chunk per table and per column.
pub struct DatabaseBuildPlugin;

impl DatabaseBuildPlugin {
    fn build_dialect(
        full_type: &str,
        config: &serde_json::Value,
    ) -> Result<(Box<dyn SqlDialect>, Option<IntrospectionScope>), EngineError> {
        match full_type {
            SQLITE_FULL_TYPE => {
                let file: SqliteConfigFile = serde_json::from_value(config.clone())?;
                Ok((
                    Box::new(SqliteDialect::new(file.connection)),
                    file.introspection_scope,
                ))
            }
            DUCKDB_FULL_TYPE => {
                let file: DuckDbConfigFile = serde_json::from_value(config.clone())?;
                Ok((
                    Box::new(DuckDbDialect::new(file.connection)),
                    file.introspection_scope,
                ))
            }
            POSTGRES_FULL_TYPE => {
                let file: PostgresConfigFile = serde_json::from_value(config.clone())?;
                Ok((
                    Box::new(PostgresDialect::new(file.connection)),
                    file.introspection_scope,
                ))
            }
            other => Err(EngineError::NotSupported(format!(
                "unknown database type: {other}"
            ))),
        }
    }
}

#[async_trait]
impl BuildPlugin for DatabaseBuildPlugin {
    fn name(&self) -> &str {
        DATABASE_PLUGIN_NAME
    }

    fn supported_types(&self) -> Vec<String> {
        vec![
            SQLITE_FULL_TYPE.to_string(),
            DUCKDB_FULL_TYPE.to_string(),
            POSTGRES_FULL_TYPE.to_string(),
        ]
    }

    async fn execute(
        &self,
        full_type: &str,
        name: &str,
        config: &serde_json::Value,
    ) -> Result<BuildExecutionResult, EngineError> {
        let (dialect, scope) = Self::build_dialect(full_type, config)?;
        let introspection = introspector::introspect_database(dialect.as_ref(), scope.as_ref()).await?;

        Ok(BuildExecutionResult {
            id: None,
            name: name.to_owned(),
            full_type: full_type.to_owned(),
            executed_at: Utc::now(),
            version: None,
            description: None,
            result: serde_json::to_value(introspection)?,
        })
    }

    fn divide_into_chunks(
        &self,
        result: &BuildExecutionResult,
    ) -> Result<Vec<EmbeddableChunk>, EngineError> {
        let introspection: DatabaseIntrospectionResult =
            serde_json::from_value(result.result.clone())?;
        build_database_chunks(&introspection)
    }

    async fn check_connection(
        &self,
        full_type: &str,
        _name: &str,
        config: &serde_json::Value,
    ) -> Result<(), EngineError> {
        let (dialect, _) = Self::build_dialect(full_type, config)?;
        introspector::check_connection(dialect.as_ref()).await
    }

    async fn run_sql(
        &self,
        config: &serde_json::Value,
        sql: &str,
        params: &[SqlValue],
        read_only: bool,
    ) -> Result<SqlExecutionResult, EngineError> {
        let full_type = config
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| {
                EngineError::Validation("database config has no 'type' field".into())
            })?;
        let (dialect, _) = Self::build_dialect(full_type, config)?;
        dialect.run_sql(sql, params, read_only).await
    }
}
