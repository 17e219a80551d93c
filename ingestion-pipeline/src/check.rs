use std::sync::Arc;

use tracing::debug;

use common::datasource::DatasourceId;
use common::error::EngineError;
use common::plugin::PluginRegistry;
use common::project::ProjectLayout;

use crate::discovery;

#[derive(Debug)]
pub struct ConnectionCheckOutcome {
    pub datasource_id: DatasourceId,
    pub full_type: String,
    /// `None` when the connection check passed.
    pub error: Option<String>,
}

impl ConnectionCheckOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Check connectivity for every (or the selected) configured datasource.
/// One outcome per datasource; failures are reported, never raised.
pub async fn check_datasource_connections(
    layout: &ProjectLayout,
    registry: &Arc<PluginRegistry>,
    datasource_ids: Option<&[DatasourceId]>,
) -> Result<Vec<ConnectionCheckOutcome>, EngineError> {
    let mut discovered = discovery::discover_datasources(layout)?;
    if let Some(wanted) = datasource_ids {
        discovered.retain(|datasource| wanted.contains(&datasource.id));
    }

    let mut outcomes = Vec::new();
    for datasource in discovered {
        let error = match registry.get(&datasource.full_type) {
            None => Some(format!(
                "no plugin registered for type {}",
                datasource.full_type
            )),
            Some(plugin) => plugin
                .check_connection(&datasource.full_type, &datasource.name, &datasource.config)
                .await
                .err()
                .map(|err| err.to_string()),
        };

        debug!(
            datasource_id = %datasource.id,
            ok = error.is_none(),
            "Connection check finished"
        );

        outcomes.push(ConnectionCheckOutcome {
            datasource_id: datasource.id,
            full_type: datasource.full_type,
            error,
        });
    }

    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::default_plugin_registry;
    use common::config::AppConfig;
    use std::path::Path;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(path, content).expect("write");
    }

    fn registry() -> Arc<PluginRegistry> {
        let config = AppConfig {
            project_dir: ".".into(),
            openai_api_key: String::new(),
            openai_base_url: String::new(),
            embedder: "tests".into(),
            embedding_model: "m".into(),
            embedding_dimensions: 4,
            chat_model: "c".into(),
            file_chunk_size: 1000,
        };
        Arc::new(default_plugin_registry(&config))
    }

    #[tokio::test]
    async fn reports_reachable_and_unreachable_datasources() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = ProjectLayout::new(dir.path());
        layout.ensure_created().expect("layout");

        let good_db = dir.path().join("good.db");
        rusqlite::Connection::open(&good_db)
            .expect("create db")
            .execute_batch("CREATE TABLE t (x INTEGER);")
            .expect("seed");

        write(
            &layout.src_dir.join("databases/good.yaml"),
            &format!(
                "type: databases/sqlite\nname: good\nconnection:\n  database_path: {}\n",
                good_db.to_string_lossy()
            ),
        );
        write(
            &layout.src_dir.join("databases/bad.yaml"),
            "type: databases/sqlite\nname: bad\nconnection:\n  database_path: /nonexistent/nope/bad.db\n",
        );
        // Raw files do not support connection checks.
        write(&layout.src_dir.join("files/notes.txt"), "notes");

        let outcomes = check_datasource_connections(&layout, &registry(), None)
            .await
            .expect("check");
        assert_eq!(outcomes.len(), 3);

        let by_id = |id: &str| {
            outcomes
                .iter()
                .find(|o| o.datasource_id.to_string() == id)
                .expect("outcome")
        };

        assert!(by_id("databases/good.yaml").is_ok());
        assert!(!by_id("databases/bad.yaml").is_ok());
        let files = by_id("files/notes.txt");
        assert!(files
            .error
            .as_deref()
            .is_some_and(|e| e.contains("does not support")));
    }

    #[tokio::test]
    async fn filter_restricts_the_checked_set() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = ProjectLayout::new(dir.path());
        layout.ensure_created().expect("layout");

        write(
            &layout.src_dir.join("custom/a.yaml"),
            "type: custom/config\nname: a\n",
        );
        write(
            &layout.src_dir.join("custom/b.yaml"),
            "type: custom/config\nname: b\n",
        );

        let only_a = DatasourceId::from_string_repr("custom/a.yaml").expect("id");
        let outcomes = check_datasource_connections(&layout, &registry(), Some(&[only_a.clone()]))
            .await
            .expect("check");

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].datasource_id, only_a);
        // The default plugin has no connection check.
        assert!(!outcomes[0].is_ok());
    }
}
