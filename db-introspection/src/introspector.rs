use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{debug, warn};

use common::error::EngineError;
use common::plugin::sql::{SqlExecutionResult, SqlQuery, SqlRow, SqlValue};

use crate::scope::{IntrospectionScope, IntrospectionScopeMatcher};
use crate::types::{DatabaseCatalog, DatabaseIntrospectionResult, DatabaseSchema};

pub const SAMPLE_LIMIT: i64 = 5;

/// An open connection to a dialect, scoped to one catalog when the engine
/// requires it.
#[async_trait]
pub trait SqlConnection: Send + Sync {
    /// Execute a statement and return its rows keyed by lower-case column
    /// name. Statements without a result set return an empty list.
    async fn fetch_rows(
        &self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<SqlRow>, EngineError>;
}

/// One SQL dialect: connection handling plus the family of component
/// queries that describe its catalogs.
#[async_trait]
pub trait SqlDialect: Send + Sync {
    fn dialect_name(&self) -> &'static str;

    fn supports_catalogs(&self) -> bool {
        true
    }

    /// Schemas that are never introspected, regardless of scope.
    fn ignored_schemas(&self) -> Vec<String> {
        vec!["information_schema".to_string()]
    }

    /// Catalog name used when the engine has no catalog concept.
    fn pseudo_catalog_name(&self) -> String {
        "default".to_string()
    }

    /// Open a connection; with `catalog` set the connection (or session)
    /// must be scoped to that catalog.
    async fn connect(&self, catalog: Option<&str>) -> Result<Box<dyn SqlConnection>, EngineError>;

    async fn get_catalogs(
        &self,
        connection: &dyn SqlConnection,
    ) -> Result<Vec<String>, EngineError>;

    fn list_schemas_sql(&self, catalog: &str) -> SqlQuery {
        SqlQuery::with_params(
            "SELECT catalog_name, schema_name FROM information_schema.schemata \
             WHERE catalog_name = $1",
            vec![SqlValue::Text(catalog.to_owned())],
        )
    }

    async fn list_schemas_for_catalog(
        &self,
        connection: &dyn SqlConnection,
        catalog: &str,
    ) -> Result<Vec<String>, EngineError> {
        let query = self.list_schemas_sql(catalog);
        let rows = connection.fetch_rows(&query.sql, &query.params).await?;

        Ok(rows
            .iter()
            .filter_map(|row| row.get_str("schema_name"))
            .filter(|schema| !schema.is_empty())
            .map(str::to_owned)
            .collect())
    }

    /// Issue the dialect's component queries for one catalog and recompose
    /// them into schema aggregates.
    async fn collect_catalog_model(
        &self,
        connection: &dyn SqlConnection,
        catalog: &str,
        schemas: &[String],
    ) -> Result<Vec<DatabaseSchema>, EngineError>;

    /// Sampling query for one table; `None` when the dialect cannot sample.
    fn sample_rows_sql(
        &self,
        _catalog: &str,
        _schema: &str,
        _table: &str,
        _limit: i64,
    ) -> Option<SqlQuery> {
        None
    }

    /// Execute an ad-hoc statement against the datasource.
    async fn run_sql(
        &self,
        sql: &str,
        params: &[SqlValue],
        read_only: bool,
    ) -> Result<SqlExecutionResult, EngineError> {
        if read_only {
            return Err(EngineError::NotSupported(format!(
                "read-only execution is not supported for {}",
                self.dialect_name()
            )));
        }
        let connection = self.connect(None).await?;
        let rows = connection.fetch_rows(sql, params).await?;
        Ok(SqlExecutionResult::from_rows(rows))
    }
}

/// Verify the datasource is reachable.
pub async fn check_connection(dialect: &dyn SqlDialect) -> Result<(), EngineError> {
    let connection = dialect.connect(None).await?;
    connection.fetch_rows("SELECT 1 AS test", &[]).await?;
    Ok(())
}

/// Walk catalogs and schemas, apply the scope filter, collect each catalog's
/// component model and table samples, and compose the result tree.
pub async fn introspect_database(
    dialect: &dyn SqlDialect,
    scope: Option<&IntrospectionScope>,
) -> Result<DatabaseIntrospectionResult, EngineError> {
    let matcher = IntrospectionScopeMatcher::new(scope.cloned(), &dialect.ignored_schemas());

    let catalogs = {
        let root_connection = dialect.connect(None).await?;
        if dialect.supports_catalogs() {
            dialect.get_catalogs(root_connection.as_ref()).await?
        } else {
            vec![dialect.pseudo_catalog_name()]
        }
    };

    let mut discovered: HashMap<String, Vec<String>> = HashMap::new();
    for catalog in &catalogs {
        let connection = dialect.connect(Some(catalog)).await?;
        let schemas = dialect
            .list_schemas_for_catalog(connection.as_ref(), catalog)
            .await?;
        discovered.insert(catalog.clone(), schemas);
    }

    let resolved = matcher.filter_scopes(&catalogs, &discovered);

    let mut introspected_catalogs = Vec::new();
    for catalog in &resolved.catalogs {
        let Some(schemas) = resolved.schemas_per_catalog.get(catalog) else {
            continue;
        };
        if schemas.is_empty() {
            continue;
        }

        let connection = dialect.connect(Some(catalog)).await?;
        let mut introspected_schemas = dialect
            .collect_catalog_model(connection.as_ref(), catalog, schemas)
            .await?;

        if introspected_schemas.is_empty() {
            continue;
        }

        collect_samples(dialect, connection.as_ref(), catalog, &mut introspected_schemas).await;

        introspected_catalogs.push(DatabaseCatalog {
            name: catalog.clone(),
            schemas: introspected_schemas,
            description: None,
        });
    }

    Ok(DatabaseIntrospectionResult {
        catalogs: introspected_catalogs,
    })
}

/// Per-table sampling errors are logged and swallowed so one odd table does
/// not sink the whole introspection.
async fn collect_samples(
    dialect: &dyn SqlDialect,
    connection: &dyn SqlConnection,
    catalog: &str,
    schemas: &mut [DatabaseSchema],
) {
    if SAMPLE_LIMIT <= 0 {
        return;
    }

    for schema in schemas {
        for table in &mut schema.tables {
            let Some(query) =
                dialect.sample_rows_sql(catalog, &schema.name, &table.name, SAMPLE_LIMIT)
            else {
                continue;
            };

            match connection.fetch_rows(&query.sql, &query.params).await {
                Ok(rows) => {
                    debug!(
                        catalog = catalog,
                        schema = %schema.name,
                        table = %table.name,
                        samples = rows.len(),
                        "Collected table samples"
                    );
                    table.samples = rows;
                }
                Err(err) => {
                    warn!(
                        catalog = catalog,
                        schema = %schema.name,
                        table = %table.name,
                        error = %err,
                        "Failed to fetch samples"
                    );
                }
            }
        }
    }
}
