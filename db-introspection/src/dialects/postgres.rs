use async_trait::async_trait;
use serde::Deserialize;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::NoTls;
use tracing::{debug, error};

use common::error::EngineError;
use common::plugin::sql::{SqlExecutionResult, SqlQuery, SqlRow, SqlValue};

use crate::introspector::{SqlConnection, SqlDialect};
use crate::model_builder::{ComponentRows, IntrospectionModelBuilder};
use crate::scope::IntrospectionScope;
use crate::types::DatabaseSchema;

#[derive(Debug, Clone, Deserialize)]
pub struct PostgresConnectionConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    /// When set, only this database is introspected; otherwise every
    /// non-template database is a catalog.
    #[serde(default)]
    pub database: Option<String>,
}

fn default_port() -> u16 {
    5432
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostgresConfigFile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub full_type: Option<String>,
    pub connection: PostgresConnectionConfig,
    #[serde(default)]
    pub introspection_scope: Option<IntrospectionScope>,
}

/// A PostgreSQL connection. The driver is async; its connection task runs on
/// the runtime and is aborted when the handle drops.
pub struct PgConnection {
    client: tokio_postgres::Client,
    task: tokio::task::JoinHandle<()>,
}

impl PgConnection {
    pub async fn open(
        config: &PostgresConnectionConfig,
        catalog: Option<&str>,
    ) -> Result<Self, EngineError> {
        let mut pg_config = tokio_postgres::Config::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.user(&config.user);
        if let Some(password) = &config.password {
            pg_config.password(password);
        }
        let dbname = catalog
            .map(str::to_owned)
            .or_else(|| config.database.clone())
            .unwrap_or_else(|| config.user.clone());
        pg_config.dbname(&dbname);

        let (client, connection) = pg_config.connect(NoTls).await.map_err(map_pg_error)?;

        let task = tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!(error = %err, "postgres connection task ended with error");
            }
        });

        Ok(Self { client, task })
    }

    async fn query_rows(
        &self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<SqlRow>, EngineError> {
        let owned = to_pg_params(params);
        let refs: Vec<&(dyn ToSql + Sync)> = owned
            .iter()
            .map(|param| param.as_ref() as &(dyn ToSql + Sync))
            .collect();
        let rows = self.client.query(sql, &refs).await.map_err(map_pg_error)?;
        Ok(rows.iter().map(row_to_sql_row).collect())
    }

    async fn query_rows_read_only(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<SqlRow>, EngineError> {
        let owned = to_pg_params(params);
        let refs: Vec<&(dyn ToSql + Sync)> = owned
            .iter()
            .map(|param| param.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let transaction = self
            .client
            .build_transaction()
            .read_only(true)
            .start()
            .await
            .map_err(map_pg_error)?;
        let rows = transaction.query(sql, &refs).await.map_err(map_pg_error)?;
        transaction.commit().await.map_err(map_pg_error)?;

        Ok(rows.iter().map(row_to_sql_row).collect())
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl SqlConnection for PgConnection {
    async fn fetch_rows(
        &self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<SqlRow>, EngineError> {
        self.query_rows(sql, params).await
    }
}

fn to_pg_params(params: &[SqlValue]) -> Vec<Box<dyn ToSql + Sync + Send>> {
    params
        .iter()
        .map(|value| -> Box<dyn ToSql + Sync + Send> {
            match value {
                SqlValue::Null => Box::new(None::<String>),
                SqlValue::Bool(b) => Box::new(*b),
                SqlValue::Int(i) => Box::new(*i),
                SqlValue::Float(f) => Box::new(*f),
                SqlValue::Text(s) => Box::new(s.clone()),
                SqlValue::Bytes(b) => Box::new(b.clone()),
                SqlValue::Array(items) => Box::new(
                    items
                        .iter()
                        .filter_map(|item| item.as_str().map(str::to_owned))
                        .collect::<Vec<String>>(),
                ),
            }
        })
        .collect()
}

fn row_to_sql_row(row: &tokio_postgres::Row) -> SqlRow {
    let mut out = SqlRow::new();
    for (index, column) in row.columns().iter().enumerate() {
        out.push(column.name(), column_value(row, index, column.type_()));
    }
    out
}

fn column_value(row: &tokio_postgres::Row, index: usize, column_type: &Type) -> SqlValue {
    fn get<'a, T: tokio_postgres::types::FromSql<'a>>(
        row: &'a tokio_postgres::Row,
        index: usize,
    ) -> Option<T> {
        row.try_get::<_, Option<T>>(index).ok().flatten()
    }

    match *column_type {
        Type::BOOL => get::<bool>(row, index).map_or(SqlValue::Null, SqlValue::Bool),
        Type::INT2 => get::<i16>(row, index).map_or(SqlValue::Null, |v| SqlValue::Int(v.into())),
        Type::INT4 => get::<i32>(row, index).map_or(SqlValue::Null, |v| SqlValue::Int(v.into())),
        Type::INT8 => get::<i64>(row, index).map_or(SqlValue::Null, SqlValue::Int),
        Type::OID => get::<u32>(row, index).map_or(SqlValue::Null, |v| SqlValue::Int(v.into())),
        Type::FLOAT4 => {
            get::<f32>(row, index).map_or(SqlValue::Null, |v| SqlValue::Float(v.into()))
        }
        Type::FLOAT8 => get::<f64>(row, index).map_or(SqlValue::Null, SqlValue::Float),
        Type::BYTEA => get::<Vec<u8>>(row, index).map_or(SqlValue::Null, SqlValue::Bytes),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY | Type::NAME_ARRAY => get::<Vec<String>>(row, index)
            .map_or(SqlValue::Null, |items| {
                SqlValue::Array(items.into_iter().map(SqlValue::Text).collect())
            }),
        _ => get::<String>(row, index).map_or(SqlValue::Null, SqlValue::Text),
    }
}

fn map_pg_error(err: tokio_postgres::Error) -> EngineError {
    if err
        .code()
        .is_some_and(|code| *code == SqlState::READ_ONLY_SQL_TRANSACTION)
    {
        EngineError::Permission(err.to_string())
    } else {
        EngineError::Sql(err.to_string())
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// PostgreSQL introspection over the system catalogs.
pub struct PostgresDialect {
    connection: PostgresConnectionConfig,
}

impl PostgresDialect {
    pub fn new(connection: PostgresConnectionConfig) -> Self {
        Self { connection }
    }

    fn schemas_param(schemas: &[String]) -> Vec<SqlValue> {
        vec![SqlValue::Array(
            schemas
                .iter()
                .map(|schema| SqlValue::Text(schema.clone()))
                .collect(),
        )]
    }
}

#[async_trait]
impl SqlDialect for PostgresDialect {
    fn dialect_name(&self) -> &'static str {
        "postgres"
    }

    fn ignored_schemas(&self) -> Vec<String> {
        vec![
            "information_schema".to_string(),
            "pg_catalog".to_string(),
            "pg_toast".to_string(),
        ]
    }

    async fn connect(&self, catalog: Option<&str>) -> Result<Box<dyn SqlConnection>, EngineError> {
        Ok(Box::new(PgConnection::open(&self.connection, catalog).await?))
    }

    async fn get_catalogs(
        &self,
        connection: &dyn SqlConnection,
    ) -> Result<Vec<String>, EngineError> {
        if let Some(database) = &self.connection.database {
            return Ok(vec![database.clone()]);
        }

        let rows = connection
            .fetch_rows(
                "SELECT datname FROM pg_catalog.pg_database WHERE datistemplate = false",
                &[],
            )
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get_str("datname"))
            .map(str::to_owned)
            .collect())
    }

    fn list_schemas_sql(&self, catalog: &str) -> SqlQuery {
        SqlQuery::with_params(
            "SELECT catalog_name, schema_name FROM information_schema.schemata \
             WHERE catalog_name = $1",
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
            "Collecting postgres catalog model"
        );

        let params = Self::schemas_param(schemas);
        let components = ComponentRows {
            relations: connection.fetch_rows(SQL_RELATIONS, &params).await?,
            columns: connection.fetch_rows(SQL_COLUMNS, &params).await?,
            primary_keys: connection.fetch_rows(SQL_PRIMARY_KEYS, &params).await?,
            unique_constraints: connection.fetch_rows(SQL_UNIQUES, &params).await?,
            checks: connection.fetch_rows(SQL_CHECKS, &params).await?,
            foreign_keys: connection.fetch_rows(SQL_FOREIGN_KEYS, &params).await?,
            indexes: connection.fetch_rows(SQL_INDEXES, &params).await?,
            partitions: connection.fetch_rows(SQL_PARTITIONS, &params).await?,
            table_stats: connection.fetch_rows(SQL_TABLE_STATS, &params).await?,
            column_stats: connection.fetch_rows(SQL_COLUMN_STATS, &params).await?,
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
                "SELECT * FROM {}.{} LIMIT $1",
                quote_ident(schema),
                quote_ident(table)
            ),
            vec![SqlValue::Int(limit)],
        ))
    }

    /// Read-only execution runs inside a `READ ONLY` transaction; the server
    /// rejects mutating statements with SQLSTATE 25006, surfaced as a
    /// permission error.
    async fn run_sql(
        &self,
        sql: &str,
        params: &[SqlValue],
        read_only: bool,
    ) -> Result<SqlExecutionResult, EngineError> {
        let mut connection = PgConnection::open(&self.connection, None).await?;

        let rows = if read_only {
            connection.query_rows_read_only(sql, params).await?
        } else {
            connection.query_rows(sql, params).await?
        };

        Ok(SqlExecutionResult::from_rows(rows))
    }
}

const SQL_RELATIONS: &str = r#"
    SELECT
        n.nspname AS schema_name,
        c.relname AS table_name,
        CASE c.relkind
            WHEN 'v' THEN 'view'
            WHEN 'm' THEN 'materialized_view'
            WHEN 'f' THEN 'external_table'
            ELSE 'table'
        END AS kind,
        obj_description(c.oid, 'pg_class') AS description
    FROM
        pg_class c
        JOIN pg_namespace n ON n.oid = c.relnamespace
    WHERE
        n.nspname = ANY($1)
        AND c.relkind IN ('r','p','v','m','f')
        AND NOT c.relispartition
    ORDER BY
        schema_name,
        c.relname
"#;

const SQL_COLUMNS: &str = r#"
    SELECT
        n.nspname AS schema_name,
        c.relname AS table_name,
        a.attname AS column_name,
        a.attnum  AS ordinal_position,
        format_type(a.atttypid, a.atttypmod) AS data_type,
        NOT a.attnotnull AS is_nullable,
        pg_get_expr(ad.adbin, ad.adrelid) AS default_expression,
        CASE
            WHEN a.attidentity IN ('a','d') THEN 'identity'
            WHEN a.attgenerated = 's'       THEN 'computed'
        END AS generated,
        col_description(a.attrelid, a.attnum) AS description
    FROM
        pg_attribute a
        JOIN pg_class c ON c.oid  = a.attrelid
        JOIN pg_namespace n ON n.oid  = c.relnamespace
        LEFT JOIN pg_attrdef ad ON ad.adrelid = a.attrelid AND ad.adnum = a.attnum
    WHERE
        n.nspname = ANY($1)
        AND a.attnum > 0
        AND c.relkind IN ('r','p','v','m','f')
        AND NOT a.attisdropped
        AND NOT c.relispartition
    ORDER BY
        schema_name,
        c.relname,
        a.attnum
"#;

const SQL_PRIMARY_KEYS: &str = r#"
    SELECT
        n.nspname AS schema_name,
        c.relname        AS table_name,
        con.conname      AS constraint_name,
        att.attname      AS column_name,
        k.pos            AS position
    FROM
        pg_constraint con
        JOIN pg_class      c   ON c.oid = con.conrelid
        JOIN pg_namespace  n   ON n.oid = c.relnamespace
        JOIN LATERAL unnest(con.conkey) WITH ORDINALITY AS k(attnum, pos) ON TRUE
        JOIN pg_attribute  att ON att.attrelid = c.oid AND att.attnum = k.attnum
    WHERE
        n.nspname = ANY($1)
        AND con.contype = 'p'
        AND NOT c.relispartition
    ORDER BY
        schema_name,
        c.relname,
        con.conname,
        k.pos
"#;

const SQL_UNIQUES: &str = r#"
    SELECT
        n.nspname AS schema_name,
        c.relname        AS table_name,
        con.conname      AS constraint_name,
        att.attname      AS column_name,
        k.pos            AS position
    FROM
        pg_constraint con
        JOIN pg_class      c   ON c.oid = con.conrelid
        JOIN pg_namespace  n   ON n.oid = c.relnamespace
        JOIN LATERAL unnest(con.conkey) WITH ORDINALITY AS k(attnum, pos) ON TRUE
        JOIN pg_attribute  att ON att.attrelid = c.oid AND att.attnum = k.attnum
    WHERE
        n.nspname = ANY($1)
        AND con.contype = 'u'
        AND NOT c.relispartition
    ORDER BY
        schema_name,
        c.relname,
        con.conname,
        k.pos
"#;

const SQL_CHECKS: &str = r#"
    SELECT
        n.nspname AS schema_name,
        c.relname AS table_name,
        con.conname AS constraint_name,
        pg_get_expr(con.conbin, con.conrelid) AS expression,
        con.convalidated AS validated
    FROM
        pg_constraint con
        JOIN pg_class c     ON c.oid = con.conrelid
        JOIN pg_namespace n ON n.oid = c.relnamespace
    WHERE
        n.nspname = ANY($1)
        AND con.contype = 'c'
        AND NOT c.relispartition
    ORDER BY
        schema_name,
        c.relname,
        con.conname
"#;

const SQL_FOREIGN_KEYS: &str = r#"
    SELECT
        n.nspname AS schema_name,
        c.relname           AS table_name,
        con.conname         AS constraint_name,
        src.ord             AS position,
        attc.attname        AS from_column,
        nref.nspname        AS ref_schema,
        cref.relname        AS ref_table,
        attref.attname      AS to_column,
        con.convalidated    AS validated,
        CASE con.confupdtype
            WHEN 'a' THEN 'no action' WHEN 'r' THEN 'restrict' WHEN 'c' THEN 'cascade'
            WHEN 'n' THEN 'set null'  WHEN 'd' THEN 'set default'
        END AS on_update,
        CASE con.confdeltype
            WHEN 'a' THEN 'no action' WHEN 'r' THEN 'restrict' WHEN 'c' THEN 'cascade'
            WHEN 'n' THEN 'set null'  WHEN 'd' THEN 'set default'
        END AS on_delete
    FROM
        pg_constraint con
        JOIN pg_class      c    ON c.oid  = con.conrelid
        JOIN pg_namespace  n    ON n.oid  = c.relnamespace
        JOIN pg_class      cref ON cref.oid = con.confrelid
        JOIN pg_namespace  nref ON nref.oid = cref.relnamespace
        JOIN LATERAL unnest(con.conkey)  WITH ORDINALITY AS src(src_attnum, ord)  ON TRUE
        JOIN LATERAL unnest(con.confkey) WITH ORDINALITY AS ref(ref_attnum, ord2) ON ref.ord2 = src.ord
        JOIN pg_attribute attc   ON attc.attrelid = c.oid     AND attc.attnum   = src.src_attnum
        JOIN pg_attribute attref ON attref.attrelid = cref.oid AND attref.attnum = ref.ref_attnum
    WHERE
        n.nspname = ANY($1)
        AND con.contype = 'f'
        AND NOT c.relispartition
    ORDER BY
        schema_name,
        c.relname,
        con.conname,
        src.ord
"#;

const SQL_INDEXES: &str = r#"
    SELECT
        n.nspname AS schema_name,
        c.relname                                   AS table_name,
        idx.relname                                 AS index_name,
        k.pos                                       AS position,
        pg_get_indexdef(i.indexrelid, k.pos, true)  AS expr,
        i.indisunique                               AS is_unique,
        am.amname                                   AS method,
        pg_get_expr(i.indpred, i.indrelid)          AS predicate
    FROM
        pg_index i
        JOIN pg_class     idx ON idx.oid = i.indexrelid
        JOIN pg_class     c   ON c.oid  = i.indrelid
        JOIN pg_namespace n   ON n.oid  = c.relnamespace
        JOIN pg_am        am  ON am.oid = idx.relam
        CROSS JOIN LATERAL generate_series(1, i.indnkeyatts::int) AS k(pos)
    WHERE
        n.nspname = ANY($1)
        AND i.indisprimary = false
        AND NOT EXISTS (
            SELECT
                1
            FROM
                pg_constraint cc
            WHERE
                cc.conindid = i.indexrelid
                AND cc.contype IN ('p','u')
        )
        AND NOT c.relispartition
    ORDER BY
        n.nspname,
        c.relname,
        idx.relname,
        k.pos
"#;

const SQL_PARTITIONS: &str = r#"
    WITH partitions AS (
        SELECT
            parentrel.oid,
            array_agg(childrel.relname) as partition_tables
        FROM
            pg_catalog.pg_class parentrel
            JOIN pg_catalog.pg_inherits inh ON inh.inhparent = parentrel.oid
            JOIN pg_catalog.pg_class childrel ON inh.inhrelid = childrel.oid
        GROUP BY
            parentrel.oid
    )
    SELECT
        nsp.nspname AS schema_name,
        rel.relname            AS table_name,
        CASE part.partstrat
            WHEN 'h' THEN 'hash partitioned'
            WHEN 'l' THEN 'list partitioned'
            WHEN 'r' THEN 'range partitioned'
        END                    AS partitioning_strategy,
        array_agg(att.attname) AS columns_in_partition_key,
        partitions.partition_tables
    FROM
        pg_catalog.pg_partitioned_table part
        JOIN pg_catalog.pg_class rel ON part.partrelid = rel.oid
        JOIN pg_catalog.pg_namespace nsp ON rel.relnamespace = nsp.oid
        JOIN pg_catalog.pg_attribute att ON att.attrelid = rel.oid AND att.attnum = ANY (part.partattrs)
        JOIN partitions ON partitions.oid = rel.oid
    WHERE
        nsp.nspname = ANY($1)
    GROUP BY
        schema_name,
        rel.relname,
        part.partstrat,
        partitions.partition_tables
"#;

const SQL_TABLE_STATS: &str = r#"
    SELECT
        n.nspname AS schema_name,
        c.relname AS table_name,
        CASE
            WHEN c.relkind = 'p' THEN (
                SELECT
                    CASE
                        WHEN MIN(child.reltuples) < 0 THEN NULL
                        ELSE COALESCE(SUM(child.reltuples), 0)::bigint
                    END
                FROM pg_inherits i
                JOIN pg_class child ON child.oid = i.inhrelid
                WHERE i.inhparent = c.oid
            )
            WHEN c.reltuples < 0 THEN NULL
            ELSE c.reltuples::bigint
        END AS row_count
    FROM
        pg_class c
        JOIN pg_namespace n ON n.oid = c.relnamespace
    WHERE
        n.nspname = ANY($1)
        AND c.relkind IN ('r','p')
        AND NOT c.relispartition
"#;

const SQL_COLUMN_STATS: &str = r#"
    SELECT
        s.schemaname AS schema_name,
        s.tablename AS table_name,
        s.attname AS column_name,
        s.null_frac,
        s.n_distinct,
        s.most_common_vals::text AS most_common_vals,
        s.most_common_freqs::text AS most_common_freqs
    FROM
        pg_stats s
    WHERE
        s.schemaname = ANY($1)
    ORDER BY
        s.schemaname,
        s.tablename,
        s.attname
"#;
