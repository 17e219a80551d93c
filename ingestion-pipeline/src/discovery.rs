use std::path::Path;

use tracing::warn;
use walkdir::WalkDir;

use common::datasource::{DatasourceId, DatasourceKind};
use common::error::EngineError;
use common::project::ProjectLayout;

/// A datasource found in the project source tree, paired with everything a
/// plugin needs to execute it.
#[derive(Debug, Clone)]
pub struct DiscoveredDatasource {
    pub id: DatasourceId,
    pub full_type: String,
    pub name: String,
    pub config: serde_json::Value,
}

/// Walk the project `src` tree and prepare every readable datasource, in
/// deterministic path order. Files that cannot be prepared (unreadable
/// YAML, missing `type`) are logged and skipped.
pub fn discover_datasources(layout: &ProjectLayout) -> Result<Vec<DiscoveredDatasource>, EngineError> {
    let mut paths: Vec<_> = WalkDir::new(&layout.src_dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect();
    paths.sort();

    let mut discovered = Vec::new();
    for path in paths {
        match prepare_datasource(layout, &path) {
            Ok(datasource) => discovered.push(datasource),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Skipping datasource");
            }
        }
    }

    Ok(discovered)
}

fn prepare_datasource(
    layout: &ProjectLayout,
    path: &Path,
) -> Result<DiscoveredDatasource, EngineError> {
    let relative = path.strip_prefix(&layout.src_dir).map_err(|_| {
        EngineError::Validation(format!(
            "datasource file is outside the src directory: {}",
            path.display()
        ))
    })?;
    let id = DatasourceId::from_string_repr(&relative.to_string_lossy())?;

    match id.kind() {
        DatasourceKind::Config => {
            let raw = std::fs::read_to_string(path)?;
            let yaml: serde_yaml::Value = serde_yaml::from_str(&raw)?;
            let config = serde_json::to_value(yaml)?;

            let full_type = config
                .get("type")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    EngineError::Validation(format!(
                        "config file has no 'type' field: {}",
                        path.display()
                    ))
                })?
                .to_owned();
            let name = config
                .get("name")
                .and_then(|v| v.as_str())
                .map_or_else(|| id.name(), str::to_owned);

            Ok(DiscoveredDatasource {
                id,
                full_type,
                name,
                config,
            })
        }
        DatasourceKind::File => {
            let extension = id.config_file_suffix().trim_start_matches('.');
            let full_type = format!("files/{extension}");
            let name = id.name();
            let config = serde_json::json!({
                "path": path.to_string_lossy(),
            });

            Ok(DiscoveredDatasource {
                id,
                full_type,
                name,
                config,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(path, content).expect("write");
    }

    #[test]
    fn discovers_configs_and_raw_files_in_path_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = ProjectLayout::new(dir.path());
        layout.ensure_created().expect("layout");

        write(
            &layout.src_dir.join("databases/my_db.yaml"),
            "type: databases/sqlite\nname: my_db\nconnection:\n  database_path: /tmp/x.db\n",
        );
        write(&layout.src_dir.join("files/notes.txt"), "hello");

        let discovered = discover_datasources(&layout).expect("discover");
        assert_eq!(discovered.len(), 2);

        assert_eq!(discovered[0].full_type, "databases/sqlite");
        assert_eq!(discovered[0].name, "my_db");
        assert_eq!(discovered[0].id.to_string(), "databases/my_db.yaml");

        assert_eq!(discovered[1].full_type, "files/txt");
        assert_eq!(discovered[1].name, "notes.txt");
        assert_eq!(discovered[1].id.to_string(), "files/notes.txt");
        assert!(discovered[1]
            .config
            .get("path")
            .and_then(|p| p.as_str())
            .is_some());
    }

    #[test]
    fn config_without_type_is_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = ProjectLayout::new(dir.path());
        layout.ensure_created().expect("layout");

        write(&layout.src_dir.join("databases/broken.yaml"), "name: only\n");
        write(
            &layout.src_dir.join("databases/ok.yaml"),
            "type: databases/sqlite\nconnection:\n  database_path: /tmp/x.db\n",
        );

        let discovered = discover_datasources(&layout).expect("discover");
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].id.to_string(), "databases/ok.yaml");
        // Name falls back to the file stem when the config has none.
        assert_eq!(discovered[0].name, "ok");
    }
}
