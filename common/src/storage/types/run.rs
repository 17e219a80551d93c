use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::storage::db::SurrealDbClient;
use crate::storage::sequence::Sequence;

use super::{
    deserialize_datetime, deserialize_option_datetime, serialize_datetime,
    serialize_option_datetime,
};

pub const RUN_TABLE: &str = "run";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILED")]
    Failed,
}

/// One build invocation. Created at build start, finalized exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: i64,
    pub project_id: String,
    pub engine_version: String,
    pub status: RunStatus,
    #[serde(
        serialize_with = "serialize_datetime",
        deserialize_with = "deserialize_datetime",
        default
    )]
    pub started_at: DateTime<Utc>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Run {
    pub async fn begin(
        db: &SurrealDbClient,
        project_id: &str,
        engine_version: &str,
    ) -> Result<Self, EngineError> {
        let run_id = Sequence::next_id(db, Sequence::RUN).await?;
        let run = Run {
            run_id,
            project_id: project_id.to_owned(),
            engine_version: engine_version.to_owned(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
        };

        db.query("CREATE type::thing($table, $id) CONTENT $run;")
            .bind(("table", RUN_TABLE))
            .bind(("id", run_id))
            .bind(("run", run.clone()))
            .await?
            .check()?;

        Ok(run)
    }

    /// Set the final status and end time. Runs are never deleted.
    pub async fn finalize(
        db: &SurrealDbClient,
        run_id: i64,
        status: RunStatus,
    ) -> Result<(), EngineError> {
        db.query(
            "UPDATE type::thing($table, $id) \
             SET status = $status, ended_at = $ended_at;",
        )
        .bind(("table", RUN_TABLE))
        .bind(("id", run_id))
        .bind(("status", status))
        .bind((
            "ended_at",
            Into::<surrealdb::sql::Datetime>::into(Utc::now()),
        ))
        .await?
        .check()?;

        Ok(())
    }

    pub async fn get(db: &SurrealDbClient, run_id: i64) -> Result<Option<Self>, EngineError> {
        Ok(db
            .select(surrealdb::RecordId::from_table_key(RUN_TABLE, run_id))
            .await?)
    }
}
