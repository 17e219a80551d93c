use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::storage::db::SurrealDbClient;
use crate::storage::sequence::Sequence;

use super::{deserialize_datetime, serialize_datetime};

pub const DATASOURCE_RUN_TABLE: &str = "datasource_run";

/// One datasource processed within a run. Created only when the datasource
/// yielded at least one chunk; immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasourceRun {
    pub datasource_run_id: i64,
    pub run_id: i64,
    pub plugin: String,
    pub full_type: String,
    /// Plugin-provided stable id, falling back to the source file stem.
    pub source_id: String,
    /// String form of the `DatasourceId` this run was built from.
    pub datasource_id: String,
    pub storage_directory: String,
    #[serde(
        serialize_with = "serialize_datetime",
        deserialize_with = "deserialize_datetime",
        default
    )]
    pub created_at: DateTime<Utc>,
}

pub struct NewDatasourceRun<'a> {
    pub run_id: i64,
    pub plugin: &'a str,
    pub full_type: &'a str,
    pub source_id: &'a str,
    pub datasource_id: &'a str,
    pub storage_directory: &'a str,
}

impl DatasourceRun {
    pub async fn create(
        db: &SurrealDbClient,
        new: NewDatasourceRun<'_>,
    ) -> Result<Self, EngineError> {
        let datasource_run_id = Sequence::next_id(db, Sequence::DATASOURCE_RUN).await?;
        let row = DatasourceRun {
            datasource_run_id,
            run_id: new.run_id,
            plugin: new.plugin.to_owned(),
            full_type: new.full_type.to_owned(),
            source_id: new.source_id.to_owned(),
            datasource_id: new.datasource_id.to_owned(),
            storage_directory: new.storage_directory.to_owned(),
            created_at: Utc::now(),
        };

        db.query("CREATE type::thing($table, $id) CONTENT $row;")
            .bind(("table", DATASOURCE_RUN_TABLE))
            .bind(("id", datasource_run_id))
            .bind(("row", row.clone()))
            .await?
            .check()?;

        Ok(row)
    }

    pub async fn get(
        db: &SurrealDbClient,
        datasource_run_id: i64,
    ) -> Result<Option<Self>, EngineError> {
        Ok(db
            .select(surrealdb::RecordId::from_table_key(
                DATASOURCE_RUN_TABLE,
                datasource_run_id,
            ))
            .await?)
    }

    pub async fn list_for_run(
        db: &SurrealDbClient,
        run_id: i64,
    ) -> Result<Vec<Self>, EngineError> {
        let mut response = db
            .query(
                "SELECT * FROM type::table($table) WHERE run_id = $run_id \
                 ORDER BY datasource_run_id ASC;",
            )
            .bind(("table", DATASOURCE_RUN_TABLE))
            .bind(("run_id", run_id))
            .await?;
        Ok(response.take(0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::run::Run;
    use uuid::Uuid;

    #[tokio::test]
    async fn create_and_list_for_run() {
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("dsr_ns", database)
            .await
            .expect("in-memory db");

        let run = Run::begin(&db, "proj", "0.1.0").await.expect("run");
        let created = DatasourceRun::create(
            &db,
            NewDatasourceRun {
                run_id: run.run_id,
                plugin: "databases",
                full_type: "databases/sqlite",
                source_id: "my_db",
                datasource_id: "databases/my_db.yaml",
                storage_directory: "/tmp/out",
            },
        )
        .await
        .expect("datasource run");

        let fetched = DatasourceRun::get(&db, created.datasource_run_id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(fetched, created);

        let listed = DatasourceRun::list_for_run(&db, run.run_id)
            .await
            .expect("list");
        assert_eq!(listed, vec![created]);
    }
}
