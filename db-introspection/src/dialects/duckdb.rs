use std::sync::mpsc;
use std::thread::JoinHandle;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use common::error::EngineError;
use common::plugin::sql::{SqlExecutionResult, SqlQuery, SqlRow, SqlValue};

use crate::introspector::{SqlConnection, SqlDialect};
use crate::model_builder::{ComponentRows, IntrospectionModelBuilder};
use crate::scope::IntrospectionScope;
use crate::types::DatabaseSchema;

const IGNORED_CATALOGS: [&str; 2] = ["system", "temp"];

#[derive(Debug, Clone, Deserialize)]
pub struct DuckDbConnectionConfig {
    /// Path to the DuckDB database file.
    pub database_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DuckDbConfigFile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub full_type: Option<String>,
    pub connection: DuckDbConnectionConfig,
    #[serde(default)]
    pub introspection_scope: Option<IntrospectionScope>,
}

enum WorkerRequest {
    Fetch {
        sql: String,
        params: Vec<SqlValue>,
        reply: tokio::sync::oneshot::Sender<Result<Vec<SqlRow>, EngineError>>,
    },
    Shutdown,
}

/// A DuckDB connection owned by one dedicated worker thread, the same
/// bridge the SQLite adapter uses: the engine is synchronous, so the
/// connection stays on a single thread and commands cross a channel.
///
/// Read-only enforcement happens at open time through the engine's
/// read-only access mode.
pub struct DuckDbConnection {
    requests: mpsc::Sender<WorkerRequest>,
    worker: Option<JoinHandle<()>>,
}

impl DuckDbConnection {
    pub fn open(database_path: &str, read_only: bool) -> Result<Self, EngineError> {
        let (requests, request_rx) = mpsc::channel::<WorkerRequest>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), EngineError>>();
        let path = database_path.to_owned();

        let worker = std::thread::Builder::new()
            .name("duckdb-worker".into())
            .spawn(move || {
                let connection = match open_connection(&path, read_only) {
                    Ok(connection) => {
                        let _ = ready_tx.send(Ok(()));
                        connection
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };

                while let Ok(request) = request_rx.recv() {
                    match request {
                        WorkerRequest::Fetch { sql, params, reply } => {
                            let _ = reply.send(run_statement(&connection, &sql, &params));
                        }
                        WorkerRequest::Shutdown => break,
                    }
                }
            })?;

        ready_rx
            .recv()
            .map_err(|_| EngineError::Sql("duckdb worker exited before opening".into()))??;

        Ok(Self {
            requests,
            worker: Some(worker),
        })
    }
}

impl Drop for DuckDbConnection {
    fn drop(&mut self) {
        let _ = self.requests.send(WorkerRequest::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[async_trait]
impl SqlConnection for DuckDbConnection {
    async fn fetch_rows(
        &self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<SqlRow>, EngineError> {
        let (reply, response) = tokio::sync::oneshot::channel();
        self.requests
            .send(WorkerRequest::Fetch {
                sql: sql.to_owned(),
                params: params.to_vec(),
                reply,
            })
            .map_err(|_| EngineError::Sql("duckdb worker is gone".into()))?;

        response
            .await
            .map_err(|_| EngineError::Sql("duckdb worker dropped the request".into()))?
    }
}

fn open_connection(path: &str, read_only: bool) -> Result<duckdb::Connection, EngineError> {
    if read_only {
        let config = duckdb::Config::default()
            .access_mode(duckdb::AccessMode::ReadOnly)
            .map_err(|err| map_duckdb_error(&err))?;
        duckdb::Connection::open_with_flags(path, config).map_err(|err| map_duckdb_error(&err))
    } else {
        duckdb::Connection::open(path).map_err(|err| map_duckdb_error(&err))
    }
}

fn run_statement(
    connection: &duckdb::Connection,
    sql: &str,
    params: &[SqlValue],
) -> Result<Vec<SqlRow>, EngineError> {
    let mut statement = connection
        .prepare(sql)
        .map_err(|err| map_duckdb_error(&err))?;
    let bound = duckdb::params_from_iter(params.iter().map(sql_value_to_duckdb));

    let mut rows = statement
        .query(bound)
        .map_err(|err| map_duckdb_error(&err))?;

    // Column metadata is only available once the statement has executed, so
    // the names are read off the first row.
    let mut column_names: Option<Vec<String>> = None;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(|err| map_duckdb_error(&err))? {
        let names = column_names.get_or_insert_with(|| {
            row.as_ref()
                .column_names()
                .into_iter()
                .map(Into::into)
                .collect()
        });

        let mut sql_row = SqlRow::new();
        for (index, column) in names.iter().enumerate() {
            let value: duckdb::types::Value =
                row.get(index).map_err(|err| map_duckdb_error(&err))?;
            sql_row.push(column, duckdb_value_to_sql(value));
        }
        out.push(sql_row);
    }

    Ok(out)
}

fn duckdb_value_to_sql(value: duckdb::types::Value) -> SqlValue {
    use duckdb::types::Value;
    match value {
        Value::Null => SqlValue::Null,
        Value::Boolean(b) => SqlValue::Bool(b),
        Value::TinyInt(i) => SqlValue::Int(i.into()),
        Value::SmallInt(i) => SqlValue::Int(i.into()),
        Value::Int(i) => SqlValue::Int(i.into()),
        Value::BigInt(i) => SqlValue::Int(i),
        Value::HugeInt(i) => SqlValue::Int(i as i64),
        Value::UTinyInt(i) => SqlValue::Int(i.into()),
        Value::USmallInt(i) => SqlValue::Int(i.into()),
        Value::UInt(i) => SqlValue::Int(i.into()),
        Value::UBigInt(i) => SqlValue::Int(i as i64),
        Value::Float(f) => SqlValue::Float(f.into()),
        Value::Double(f) => SqlValue::Float(f),
        Value::Text(s) => SqlValue::Text(s),
        Value::Enum(s) => SqlValue::Text(s),
        Value::Blob(b) => SqlValue::Bytes(b),
        Value::List(items) => {
            SqlValue::Array(items.into_iter().map(duckdb_value_to_sql).collect())
        }
        // Temporal, decimal and nested struct values only show up in row
        // samples; they are dropped rather than lossily rendered.
        _ => SqlValue::Null,
    }
}

fn sql_value_to_duckdb(value: &SqlValue) -> duckdb::types::Value {
    use duckdb::types::Value;
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Bool(b) => Value::Boolean(*b),
        SqlValue::Int(i) => Value::BigInt(*i),
        SqlValue::Float(f) => Value::Double(*f),
        SqlValue::Text(s) => Value::Text(s.clone()),
        SqlValue::Bytes(b) => Value::Blob(b.clone()),
        SqlValue::Array(_) => Value::Text(value.to_string()),
    }
}

fn map_duckdb_error(err: &dyn std::fmt::Display) -> EngineError {
    let message = err.to_string();
    if message.contains("read-only") {
        EngineError::Permission(message)
    } else {
        EngineError::Sql(message)
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `IN ('a','b')` list for the schema filter; array parameters are not
/// expressible through the driver's positional params.
fn schema_list(schemas: &[String]) -> String {
    schemas
        .iter()
        .map(|schema| quote_literal(schema))
        .collect::<Vec<_>>()
        .join(", ")
}

/// DuckDB introspection: catalogs from `duckdb_databases()`, constraints
/// and indexes from the `duckdb_*` table functions.
pub struct DuckDbDialect {
    connection: DuckDbConnectionConfig,
}

impl DuckDbDialect {
    pub fn new(connection: DuckDbConnectionConfig) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl SqlDialect for DuckDbDialect {
    fn dialect_name(&self) -> &'static str {
        "duckdb"
    }

    fn ignored_schemas(&self) -> Vec<String> {
        vec!["information_schema".to_string(), "pg_catalog".to_string()]
    }

    async fn connect(&self, _catalog: Option<&str>) -> Result<Box<dyn SqlConnection>, EngineError> {
        // One file holds every catalog; no per-catalog session is needed.
        Ok(Box::new(DuckDbConnection::open(
            &self.connection.database_path,
            false,
        )?))
    }

    async fn get_catalogs(
        &self,
        connection: &dyn SqlConnection,
    ) -> Result<Vec<String>, EngineError> {
        let rows = connection
            .fetch_rows("SELECT database_name FROM duckdb_databases();", &[])
            .await?;

        let catalogs: Vec<String> = rows
            .iter()
            .filter_map(|row| row.get_str("database_name"))
            .filter(|name| !IGNORED_CATALOGS.contains(&name.to_lowercase().as_str()))
            .map(str::to_owned)
            .collect();

        if catalogs.is_empty() {
            return Ok(vec![self.pseudo_catalog_name()]);
        }
        Ok(catalogs)
    }

    fn list_schemas_sql(&self, catalog: &str) -> SqlQuery {
        SqlQuery::with_params(
            "SELECT catalog_name, schema_name FROM information_schema.schemata \
             WHERE catalog_name = ?",
            vec![SqlValue::Text(catalog.to_owned())],
        )
    }

    async fn collect_catalog_model(
        &self,
        connection: &dyn SqlConnection,
        catalog: &str,
        schemas: &[String],
    ) -> Result<Vec<DatabaseSchema>, EngineError> {
        if schemas.is_empty() {
            return Ok(Vec::new());
        }

        debug!(
            catalog = catalog,
            schema_count = schemas.len(),
            "Collecting duckdb catalog model"
        );

        let schemas_in = schema_list(schemas);
        let components = ComponentRows {
            relations: connection
                .fetch_rows(&sql_relations(&schemas_in), &[])
                .await?,
            columns: connection.fetch_rows(&sql_columns(&schemas_in), &[]).await?,
            primary_keys: connection
                .fetch_rows(&sql_key_constraints(&schemas_in, "PRIMARY KEY"), &[])
                .await?,
            unique_constraints: connection
                .fetch_rows(&sql_key_constraints(&schemas_in, "UNIQUE"), &[])
                .await?,
            checks: connection.fetch_rows(&sql_checks(&schemas_in), &[]).await?,
            foreign_keys: connection
                .fetch_rows(&sql_foreign_keys(&schemas_in), &[])
                .await?,
            indexes: connection.fetch_rows(&sql_indexes(&schemas_in), &[]).await?,
            ..ComponentRows::default()
        };

        Ok(IntrospectionModelBuilder::build_schemas_from_components(
            schemas, &components,
        ))
    }

    fn sample_rows_sql(
        &self,
        _catalog: &str,
        schema: &str,
        table: &str,
        limit: i64,
    ) -> Option<SqlQuery> {
        Some(SqlQuery::with_params(
            format!(
                "SELECT * FROM {}.{} LIMIT ?",
                quote_ident(schema),
                quote_ident(table)
            ),
            vec![SqlValue::Int(limit)],
        ))
    }

    async fn run_sql(
        &self,
        sql: &str,
        params: &[SqlValue],
        read_only: bool,
    ) -> Result<SqlExecutionResult, EngineError> {
        let connection = DuckDbConnection::open(&self.connection.database_path, read_only)?;
        let rows = connection.fetch_rows(sql, params).await?;
        Ok(SqlExecutionResult::from_rows(rows))
    }
}

fn sql_relations(schemas_in: &str) -> String {
    format!(
        r#"
        SELECT
            table_schema AS schema_name,
            table_name,
            CASE table_type
                WHEN 'BASE TABLE' THEN 'table'
                WHEN 'VIEW' THEN 'view'
                WHEN 'MATERIALIZED VIEW' THEN 'materialized_view'
                ELSE lower(table_type)
            END AS kind,
            NULL AS description
        FROM
            information_schema.tables
        WHERE
            table_schema IN ({schemas_in})
        ORDER BY
            table_name;
        "#
    )
}

fn sql_columns(schemas_in: &str) -> String {
    format!(
        r#"
        SELECT
            c.table_schema AS schema_name,
            c.table_name,
            c.column_name,
            c.ordinal_position AS ordinal_position,
            c.data_type AS data_type,
            CASE
                WHEN c.is_nullable = 'YES' THEN TRUE
                ELSE FALSE
            END AS is_nullable,
            c.column_default AS default_expression,
            NULL AS generated,
            NULL AS description
        FROM
            information_schema.columns c
        WHERE
            c.table_schema IN ({schemas_in})
        ORDER BY
            c.table_schema,
            c.table_name,
            c.ordinal_position;
        "#
    )
}

fn sql_key_constraints(schemas_in: &str, constraint_type: &str) -> String {
    format!(
        r#"
        WITH d AS (
            SELECT
                *
            FROM
                duckdb_constraints()
            WHERE
                schema_name IN ({schemas_in})
                AND constraint_type = '{constraint_type}'
        ),
        cols AS (
            SELECT
                d.schema_name,
                d.table_name,
                d.constraint_name,
                r.pos AS position,
                d.constraint_column_names[r.pos] AS column_name
            FROM
                d,
                range(1, length(d.constraint_column_names) + 1) AS r(pos)
        )
        SELECT
            schema_name,
            table_name,
            constraint_name,
            position,
            column_name
        FROM
            cols
        ORDER BY
            schema_name,
            table_name,
            constraint_name,
            position;
        "#
    )
}

fn sql_checks(schemas_in: &str) -> String {
    format!(
        r#"
        SELECT
            d.schema_name,
            d.table_name,
            d.constraint_name,
            d.expression        AS expression,
            TRUE                AS validated
        FROM
            duckdb_constraints() AS d
        WHERE
            d.schema_name IN ({schemas_in})
            AND d.constraint_type = 'CHECK'
        ORDER BY
            d.schema_name,
            d.table_name,
            d.constraint_name;
        "#
    )
}

fn sql_foreign_keys(schemas_in: &str) -> String {
    format!(
        r#"
        WITH d AS (
            SELECT
                *
            FROM
                duckdb_constraints()
            WHERE
                schema_name IN ({schemas_in})
                AND constraint_type = 'FOREIGN KEY'
        ),
        cols AS (
            SELECT
                d.schema_name,
                d.table_name,
                d.constraint_name,
                r.pos AS position,
                d.constraint_column_names[r.pos]  AS from_column,
                d.referenced_column_names[r.pos]  AS to_column
            FROM
                d,
                range(1, length(d.constraint_column_names) + 1) AS r(pos)
        ),
        ref AS (
        SELECT
            rc.constraint_schema AS schema_name,
            rc.constraint_name,
            tc.table_schema AS ref_schema,
            tc.table_name   AS ref_table
        FROM
            information_schema.referential_constraints rc
            JOIN information_schema.table_constraints tc ON
                tc.constraint_schema = rc.unique_constraint_schema
                AND tc.constraint_name = rc.unique_constraint_name
        ),
        rules AS (
            SELECT
                constraint_schema AS schema_name,
                constraint_name,
                lower(update_rule) AS on_update,
                lower(delete_rule) AS on_delete
            FROM
                information_schema.referential_constraints
        )
        SELECT
            c.schema_name,
            c.table_name,
            c.constraint_name,
            c.position,
            c.from_column,
            r.ref_schema,
            r.ref_table,
            c.to_column,
            coalesce(u.on_update, 'no action') AS on_update,
            coalesce(u.on_delete, 'no action') AS on_delete,
            TRUE AS enforced,
            TRUE AS validated
        FROM
            cols c JOIN ref r ON r.schema_name = c.schema_name AND r.constraint_name = c.constraint_name
        LEFT JOIN rules u ON u.schema_name = c.schema_name AND u.constraint_name = c.constraint_name
        ORDER BY
            c.schema_name,
            c.table_name,
            c.constraint_name,
            c.position;
        "#
    )
}

fn sql_indexes(schemas_in: &str) -> String {
    format!(
        r#"
        WITH idx AS (
            SELECT
                schema_name,
                table_name,
                index_name,
                is_unique,
                string_split(trim(BOTH '[]' FROM expressions), ',') AS expr_list
            FROM
                duckdb_indexes()
            WHERE
                schema_name IN ({schemas_in})
        )
        SELECT
            schema_name,
            table_name,
            index_name,
            pos AS position,
            trim(expr_list[pos]) AS expr,
            is_unique
        FROM
            idx,
            range(1, length(expr_list) + 1) AS r(pos)
        ORDER BY
            schema_name,
            table_name,
            index_name,
            position;
        "#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::introspector::{check_connection, introspect_database};

    fn seeded_database(dir: &tempfile::TempDir) -> DuckDbConnectionConfig {
        let path = dir.path().join("lake.duckdb");
        let connection = duckdb::Connection::open(&path).expect("open duckdb");
        connection
            .execute_batch(
                r#"
                CREATE TABLE users (
                    id INTEGER PRIMARY KEY,
                    email VARCHAR NOT NULL UNIQUE,
                    name VARCHAR
                );
                CREATE TABLE orders (
                    order_id INTEGER PRIMARY KEY,
                    user_id INTEGER REFERENCES users(id),
                    amount DOUBLE
                );
                CREATE VIEW user_emails AS SELECT email FROM users;
                INSERT INTO users VALUES (1, 'a@x.com', 'Alice'), (2, 'b@x.com', 'Bob');
                INSERT INTO orders VALUES (10, 1, 19.99);
                "#,
            )
            .expect("seed schema");

        DuckDbConnectionConfig {
            database_path: path.to_string_lossy().into_owned(),
        }
    }

    #[tokio::test]
    async fn introspects_catalog_schema_and_tables() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dialect = DuckDbDialect::new(seeded_database(&dir));

        let result = introspect_database(&dialect, None).await.expect("introspect");

        assert_eq!(result.catalogs.len(), 1);
        let catalog = &result.catalogs[0];
        assert_eq!(catalog.name, "lake");
        assert_eq!(catalog.schemas.len(), 1);
        let schema = &catalog.schemas[0];
        assert_eq!(schema.name, "main");

        let users = schema
            .tables
            .iter()
            .find(|t| t.name == "users")
            .expect("users table");
        assert_eq!(
            users.primary_key.as_ref().expect("pk").columns,
            vec!["id"]
        );
        assert_eq!(users.samples.len(), 2);
        assert!(!users
            .columns
            .iter()
            .find(|c| c.name == "email")
            .expect("email")
            .nullable);

        let orders = schema
            .tables
            .iter()
            .find(|t| t.name == "orders")
            .expect("orders table");
        assert_eq!(orders.foreign_keys.len(), 1);
        assert_eq!(orders.foreign_keys[0].referenced_table, "main.users");
    }

    #[tokio::test]
    async fn scope_filter_prunes_schemas() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dialect = DuckDbDialect::new(seeded_database(&dir));

        let scope: IntrospectionScope = serde_json::from_value(serde_json::json!({
            "exclude": [{"catalog": "lake", "schemas": ["main"]}]
        }))
        .expect("scope");

        let result = introspect_database(&dialect, Some(&scope))
            .await
            .expect("introspect");
        assert!(result.catalogs.is_empty());
    }

    #[tokio::test]
    async fn check_connection_succeeds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dialect = DuckDbDialect::new(seeded_database(&dir));
        check_connection(&dialect).await.expect("check connection");
    }

    #[tokio::test]
    async fn run_sql_read_only_rejects_mutations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dialect = DuckDbDialect::new(seeded_database(&dir));

        let result = dialect
            .run_sql("SELECT email FROM users ORDER BY id", &[], true)
            .await
            .expect("select");
        assert_eq!(result.columns, vec!["email"]);
        assert_eq!(result.rows.len(), 2);

        let err = dialect
            .run_sql("INSERT INTO users VALUES (3, 'c@x.com', 'Cara')", &[], true)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Permission(_)), "{err}");
    }
}
