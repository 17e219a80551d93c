use std::sync::mpsc;
use std::thread::JoinHandle;

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use serde::Deserialize;
use tracing::debug;

use common::error::EngineError;
use common::plugin::sql::{SqlExecutionResult, SqlQuery, SqlRow, SqlValue};

use crate::introspector::{SqlConnection, SqlDialect};
use crate::model_builder::{ComponentRows, IntrospectionModelBuilder};
use crate::scope::IntrospectionScope;
use crate::types::DatabaseSchema;

const PSEUDO_SCHEMA: &str = "main";

#[derive(Debug, Clone, Deserialize)]
pub struct SqliteConnectionConfig {
    /// Path to the SQLite database file.
    pub database_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SqliteConfigFile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub full_type: Option<String>,
    pub connection: SqliteConnectionConfig,
    #[serde(default)]
    pub introspection_scope: Option<IntrospectionScope>,
}

enum WorkerRequest {
    Fetch {
        sql: String,
        params: Vec<SqlValue>,
        query_only: bool,
        reply: tokio::sync::oneshot::Sender<Result<Vec<SqlRow>, EngineError>>,
    },
    Shutdown,
}

/// A SQLite connection owned by one dedicated worker thread.
///
/// The driver is synchronous and its connection is not `Sync`, so the
/// connection lives on a single thread for its whole lifetime and commands
/// cross a channel. The thread is joined on drop.
pub struct SqliteConnection {
    requests: mpsc::Sender<WorkerRequest>,
    worker: Option<JoinHandle<()>>,
}

impl SqliteConnection {
    pub fn open(database_path: &str) -> Result<Self, EngineError> {
        let (requests, request_rx) = mpsc::channel::<WorkerRequest>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), EngineError>>();
        let path = database_path.to_owned();

        let worker = std::thread::Builder::new()
            .name("sqlite-worker".into())
            .spawn(move || {
                let connection = match rusqlite::Connection::open(&path) {
                    Ok(connection) => {
                        let _ = ready_tx.send(Ok(()));
                        connection
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(map_sqlite_error(&err)));
                        return;
                    }
                };

                while let Ok(request) = request_rx.recv() {
                    match request {
                        WorkerRequest::Fetch {
                            sql,
                            params,
                            query_only,
                            reply,
                        } => {
                            let _ = reply.send(run_statement(
                                &connection,
                                &sql,
                                &params,
                                query_only,
                            ));
                        }
                        WorkerRequest::Shutdown => break,
                    }
                }
            })?;

        ready_rx
            .recv()
            .map_err(|_| EngineError::Sql("sqlite worker exited before opening".into()))??;

        Ok(Self {
            requests,
            worker: Some(worker),
        })
    }

    async fn fetch_with_mode(
        &self,
        sql: &str,
        params: &[SqlValue],
        query_only: bool,
    ) -> Result<Vec<SqlRow>, EngineError> {
        let (reply, response) = tokio::sync::oneshot::channel();
        self.requests
            .send(WorkerRequest::Fetch {
                sql: sql.to_owned(),
                params: params.to_vec(),
                query_only,
                reply,
            })
            .map_err(|_| EngineError::Sql("sqlite worker is gone".into()))?;

        response
            .await
            .map_err(|_| EngineError::Sql("sqlite worker dropped the request".into()))?
    }
}

impl Drop for SqliteConnection {
    fn drop(&mut self) {
        let _ = self.requests.send(WorkerRequest::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[async_trait]
impl SqlConnection for SqliteConnection {
    async fn fetch_rows(
        &self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<SqlRow>, EngineError> {
        self.fetch_with_mode(sql, params, false).await
    }
}

fn run_statement(
    connection: &rusqlite::Connection,
    sql: &str,
    params: &[SqlValue],
    query_only: bool,
) -> Result<Vec<SqlRow>, EngineError> {
    connection
        .pragma_update(None, "query_only", if query_only { "1" } else { "0" })
        .map_err(|err| map_sqlite_error(&err))?;

    let mut statement = connection.prepare(sql).map_err(|err| map_sqlite_error(&err))?;
    let bound = rusqlite::params_from_iter(params.iter().map(sql_value_to_rusqlite));

    if statement.column_count() == 0 {
        statement.execute(bound).map_err(|err| map_sqlite_error(&err))?;
        return Ok(Vec::new());
    }

    let column_names: Vec<String> = statement
        .column_names()
        .into_iter()
        .map(str::to_owned)
        .collect();

    let mut rows = statement.query(bound).map_err(|err| map_sqlite_error(&err))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(|err| map_sqlite_error(&err))? {
        let mut sql_row = SqlRow::new();
        for (index, column) in column_names.iter().enumerate() {
            let value = row
                .get_ref(index)
                .map(value_ref_to_sql)
                .map_err(|err| map_sqlite_error(&err))?;
            sql_row.push(column, value);
        }
        out.push(sql_row);
    }

    Ok(out)
}

fn value_ref_to_sql(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Int(i),
        ValueRef::Real(f) => SqlValue::Float(f),
        ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => SqlValue::Bytes(b.to_vec()),
    }
}

fn sql_value_to_rusqlite(value: &SqlValue) -> rusqlite::types::Value {
    use rusqlite::types::Value;
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Bool(b) => Value::Integer(i64::from(*b)),
        SqlValue::Int(i) => Value::Integer(*i),
        SqlValue::Float(f) => Value::Real(*f),
        SqlValue::Text(s) => Value::Text(s.clone()),
        SqlValue::Bytes(b) => Value::Blob(b.clone()),
        SqlValue::Array(_) => Value::Text(value.to_string()),
    }
}

fn map_sqlite_error(err: &rusqlite::Error) -> EngineError {
    let message = err.to_string();
    if message.contains("readonly database") || message.contains("query_only") {
        EngineError::Permission(message)
    } else {
        EngineError::Sql(message)
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// SQLite introspection: single pseudo-catalog, single `main` schema, all
/// component facts read through the pragma table functions.
pub struct SqliteDialect {
    connection: SqliteConnectionConfig,
}

impl SqliteDialect {
    pub fn new(connection: SqliteConnectionConfig) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl SqlDialect for SqliteDialect {
    fn dialect_name(&self) -> &'static str {
        "sqlite"
    }

    fn supports_catalogs(&self) -> bool {
        false
    }

    fn ignored_schemas(&self) -> Vec<String> {
        vec!["temp".to_string(), "information_schema".to_string()]
    }

    async fn connect(&self, _catalog: Option<&str>) -> Result<Box<dyn SqlConnection>, EngineError> {
        Ok(Box::new(SqliteConnection::open(
            &self.connection.database_path,
        )?))
    }

    async fn get_catalogs(
        &self,
        _connection: &dyn SqlConnection,
    ) -> Result<Vec<String>, EngineError> {
        Ok(vec![self.pseudo_catalog_name()])
    }

    async fn list_schemas_for_catalog(
        &self,
        _connection: &dyn SqlConnection,
        _catalog: &str,
    ) -> Result<Vec<String>, EngineError> {
        Ok(vec![PSEUDO_SCHEMA.to_string()])
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

        debug!(catalog = catalog, "Collecting sqlite catalog model");

        let components = ComponentRows {
            relations: connection.fetch_rows(SQL_RELATIONS, &[]).await?,
            columns: connection.fetch_rows(SQL_COLUMNS, &[]).await?,
            primary_keys: connection.fetch_rows(SQL_PRIMARY_KEYS, &[]).await?,
            unique_constraints: connection.fetch_rows(SQL_UNIQUE, &[]).await?,
            foreign_keys: connection.fetch_rows(SQL_FOREIGN_KEYS, &[]).await?,
            indexes: connection.fetch_rows(SQL_INDEXES, &[]).await?,
            ..ComponentRows::default()
        };

        Ok(IntrospectionModelBuilder::build_schemas_from_components(
            &[PSEUDO_SCHEMA.to_string()],
            &components,
        ))
    }

    fn sample_rows_sql(
        &self,
        _catalog: &str,
        _schema: &str,
        table: &str,
        limit: i64,
    ) -> Option<SqlQuery> {
        Some(SqlQuery::with_params(
            format!("SELECT * FROM {} LIMIT ?", quote_ident(table)),
            vec![SqlValue::Int(limit)],
        ))
    }

    async fn run_sql(
        &self,
        sql: &str,
        params: &[SqlValue],
        read_only: bool,
    ) -> Result<SqlExecutionResult, EngineError> {
        let connection = SqliteConnection::open(&self.connection.database_path)?;
        let rows = connection.fetch_with_mode(sql, params, read_only).await?;
        Ok(SqlExecutionResult::from_rows(rows))
    }
}

const SQL_RELATIONS: &str = r#"
    SELECT
        'main' AS schema_name,
        m.name AS table_name,
        CASE m.type
            WHEN 'view' THEN 'view'
            ELSE 'table'
        END AS kind,
        NULL AS description
    FROM
        sqlite_master m
    WHERE
        m.type IN ('table', 'view')
        AND m.name NOT LIKE 'sqlite_%'
    ORDER BY
        m.name;
"#;

const SQL_COLUMNS: &str = r#"
    SELECT
        'main' AS schema_name,
        m.name AS table_name,
        c.name AS column_name,
        (c.cid + 1) AS ordinal_position,
        COALESCE(c.type,'') AS data_type,
        CASE
            WHEN c.pk > 0 THEN 0
            WHEN c."notnull" = 0 THEN 1
            ELSE 0
        END AS is_nullable,
        c.dflt_value AS default_expression,
        CASE
            WHEN c.hidden IN (2,3) THEN 'computed'
        END AS generated,
        NULL AS description
    FROM
        sqlite_master m
        JOIN pragma_table_xinfo(m.name) c
    WHERE
        m.type IN ('table','view')
        AND m.name NOT LIKE 'sqlite_%'
    ORDER BY
        m.name,
        c.cid;
"#;

const SQL_PRIMARY_KEYS: &str = r#"
    SELECT
        'main' AS schema_name,
        m.name AS table_name,
        ('pk_' || m.name) AS constraint_name,
        c.pk AS position,
        c.name AS column_name
    FROM
        sqlite_master m
        JOIN pragma_table_info(m.name) c
    WHERE
        m.type = 'table'
        AND m.name NOT LIKE 'sqlite_%'
        AND c.pk > 0
    ORDER BY
        m.name,
        c.pk;
"#;

const SQL_UNIQUE: &str = r#"
    SELECT
        'main' AS schema_name,
        m.name AS table_name,
        il.name AS constraint_name,
        (ii.seqno + 1) AS position,
        ii.name AS column_name
    FROM
        sqlite_master m
        JOIN pragma_index_list(m.name) il
        JOIN pragma_index_info(il.name) ii
    WHERE
        m.type = 'table'
        AND m.name NOT LIKE 'sqlite_%'
        AND il."unique" = 1
        AND il.origin = 'u'
    ORDER BY
        m.name,
        il.name,
        ii.seqno;
"#;

const SQL_FOREIGN_KEYS: &str = r#"
    SELECT
        'main' AS schema_name,
        m.name AS table_name,
        ('fk_' || m.name || '_' || fk.id) AS constraint_name,
        (fk.seq + 1) AS position,
        fk."from" AS from_column,
        'main' AS ref_schema,
        fk."table" AS ref_table,
        fk."to" AS to_column,
        lower(fk.on_update) AS on_update,
        lower(fk.on_delete) AS on_delete,
        1 AS enforced,
        1 AS validated
    FROM sqlite_master m
    JOIN pragma_foreign_key_list(m.name) fk
    WHERE
        m.type = 'table'
        AND m.name NOT LIKE 'sqlite_%'
    ORDER BY
        m.name,
        fk.id,
        fk.seq;
"#;

const SQL_INDEXES: &str = r#"
    SELECT
        'main' AS schema_name,
        m.name AS table_name,
        il.name AS index_name,
        (ix.seqno + 1) AS position,
        ix.name AS expr,
        il."unique" AS is_unique,
        NULL AS method,
        CASE
            WHEN il.partial = 1 AND sm.sql IS NOT NULL AND instr(upper(sm.sql), 'WHERE') > 0
            THEN trim(substr(sm.sql, instr(upper(sm.sql), 'WHERE') + length('WHERE')))
        END AS predicate
    FROM
        sqlite_master m
        JOIN pragma_index_list(m.name) il
        JOIN pragma_index_xinfo(il.name) ix
        LEFT JOIN sqlite_master sm ON sm.type = 'index' AND sm.name = il.name
    WHERE
        m.type='table'
        AND m.name NOT LIKE 'sqlite_%'
        AND lower(il.origin) = 'c'
        AND ix.key = 1
    ORDER BY
        m.name,
        il.name,
        ix.seqno;
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::introspector::{check_connection, introspect_database};
    use crate::types::DatasetKind;

    fn seeded_database(dir: &tempfile::TempDir) -> SqliteConnectionConfig {
        let path = dir.path().join("test.db");
        let connection = rusqlite::Connection::open(&path).expect("open sqlite");
        connection
            .execute_batch(
                r#"
                CREATE TABLE users (
                    id INTEGER PRIMARY KEY,
                    email TEXT NOT NULL UNIQUE,
                    name TEXT
                );
                CREATE TABLE orders (
                    order_id INTEGER PRIMARY KEY,
                    user_id INTEGER NOT NULL REFERENCES users(id),
                    amount REAL
                );
                CREATE INDEX idx_orders_user ON orders(user_id);
                CREATE VIEW user_emails AS SELECT email FROM users;
                INSERT INTO users (id, email, name) VALUES (1, 'a@x.com', 'Alice');
                INSERT INTO users (id, email, name) VALUES (2, 'b@x.com', 'Bob');
                INSERT INTO orders (order_id, user_id, amount) VALUES (10, 1, 19.99);
                "#,
            )
            .expect("seed schema");

        SqliteConnectionConfig {
            database_path: path.to_string_lossy().into_owned(),
        }
    }

    #[tokio::test]
    async fn introspects_tables_columns_keys_and_samples() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dialect = SqliteDialect::new(seeded_database(&dir));

        let result = introspect_database(&dialect, None).await.expect("introspect");

        assert_eq!(result.catalogs.len(), 1);
        let schema = &result.catalogs[0].schemas[0];
        assert_eq!(schema.name, "main");

        let names: Vec<&str> = schema.tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["orders", "user_emails", "users"]);

        let users = schema
            .tables
            .iter()
            .find(|t| t.name == "users")
            .expect("users table");
        assert_eq!(users.kind, DatasetKind::Table);
        let primary_key = users.primary_key.as_ref().expect("pk");
        assert_eq!(primary_key.columns, vec!["id"]);
        assert_eq!(users.samples.len(), 2);

        let email = users
            .columns
            .iter()
            .find(|c| c.name == "email")
            .expect("email column");
        assert!(!email.nullable);

        let orders = schema
            .tables
            .iter()
            .find(|t| t.name == "orders")
            .expect("orders table");
        assert_eq!(orders.foreign_keys.len(), 1);
        assert_eq!(orders.foreign_keys[0].referenced_table, "main.users");
        assert_eq!(
            orders
                .indexes
                .iter()
                .map(|i| i.name.as_str())
                .collect::<Vec<_>>(),
            vec!["idx_orders_user"]
        );

        let view = schema
            .tables
            .iter()
            .find(|t| t.name == "user_emails")
            .expect("view");
        assert_eq!(view.kind, DatasetKind::View);
    }

    #[tokio::test]
    async fn check_connection_succeeds_on_a_real_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dialect = SqliteDialect::new(seeded_database(&dir));
        check_connection(&dialect).await.expect("check connection");
    }

    #[tokio::test]
    async fn run_sql_returns_columns_and_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dialect = SqliteDialect::new(seeded_database(&dir));

        let result = dialect
            .run_sql("SELECT id, email FROM users ORDER BY id", &[], true)
            .await
            .expect("run sql");

        assert_eq!(result.columns, vec!["id", "email"]);
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.rows[0][0], SqlValue::Int(1));
    }

    #[tokio::test]
    async fn run_sql_read_only_rejects_mutations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dialect = SqliteDialect::new(seeded_database(&dir));

        let err = dialect
            .run_sql(
                "INSERT INTO users (id, email) VALUES (3, 'c@x.com')",
                &[],
                true,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Permission(_)), "{err}");

        // The table is untouched.
        let result = dialect
            .run_sql("SELECT count(*) AS n FROM users", &[], true)
            .await
            .expect("count");
        assert_eq!(result.rows[0][0], SqlValue::Int(2));
    }

    #[tokio::test]
    async fn run_sql_allows_mutations_when_not_read_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dialect = SqliteDialect::new(seeded_database(&dir));

        dialect
            .run_sql(
                "INSERT INTO users (id, email) VALUES (3, 'c@x.com')",
                &[],
                false,
            )
            .await
            .expect("insert");

        let result = dialect
            .run_sql("SELECT count(*) AS n FROM users", &[], true)
            .await
            .expect("count");
        assert_eq!(result.rows[0][0], SqlValue::Int(3));
    }

    #[tokio::test]
    async fn bound_parameters_reach_the_statement() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dialect = SqliteDialect::new(seeded_database(&dir));

        let result = dialect
            .run_sql(
                "SELECT email FROM users WHERE id = ?",
                &[SqlValue::Int(2)],
                true,
            )
            .await
            .expect("run sql");
        assert_eq!(result.rows, vec![vec![SqlValue::Text("b@x.com".into())]]);
    }
}
