use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use common::datasource::DatasourceId;
use common::error::EngineError;
use common::plugin::BuildExecutionResult;

/// The YAML document written to `output/run-<id>/` for one datasource.
#[derive(Debug, Serialize)]
struct ContextDocument<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    full_type: &'a str,
    executed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    result: &'a serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct OwnedContextDocument {
    name: String,
    #[serde(rename = "type")]
    full_type: String,
    executed_at: DateTime<Utc>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    description: Option<String>,
    result: serde_yaml::Value,
}

/// Parse a previously written context document back into an execution
/// result, so already-built contexts can be re-chunked and re-indexed
/// without executing the plugin again.
pub fn parse_context_document(content: &str) -> Result<BuildExecutionResult, EngineError> {
    let document: OwnedContextDocument = serde_yaml::from_str(content)?;
    Ok(BuildExecutionResult {
        id: None,
        name: document.name,
        full_type: document.full_type,
        executed_at: document.executed_at,
        version: document.version,
        description: document.description,
        result: serde_json::to_value(document.result)?,
    })
}

pub fn render_context_document(result: &BuildExecutionResult) -> Result<String, EngineError> {
    let document = ContextDocument {
        name: &result.name,
        full_type: &result.full_type,
        executed_at: result.executed_at,
        version: result.version.as_deref(),
        description: result.description.as_deref(),
        result: &result.result,
    };
    Ok(serde_yaml::to_string(&document)?)
}

/// Write the rendered context document into the run directory, following the
/// datasource id's context path rules.
pub fn write_context_document(
    run_dir: &Path,
    id: &DatasourceId,
    result: &BuildExecutionResult,
) -> Result<PathBuf, EngineError> {
    let path = run_dir.join(id.relative_path_to_context_file());
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, render_context_document(result)?)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result() -> BuildExecutionResult {
        BuildExecutionResult {
            id: None,
            name: "my_db".into(),
            full_type: "databases/sqlite".into(),
            executed_at: Utc::now(),
            version: Some("1".into()),
            description: None,
            result: serde_json::json!({"catalogs": []}),
        }
    }

    #[test]
    fn renders_a_yaml_document_with_type_and_result() {
        let rendered = render_context_document(&result()).expect("render");
        assert!(rendered.contains("name: my_db"));
        assert!(rendered.contains("type: databases/sqlite"));
        assert!(rendered.contains("result:"));
    }

    #[test]
    fn rendered_documents_parse_back() {
        let original = result();
        let rendered = render_context_document(&original).expect("render");
        let parsed = parse_context_document(&rendered).expect("parse");

        assert_eq!(parsed.name, original.name);
        assert_eq!(parsed.full_type, original.full_type);
        assert_eq!(parsed.version, original.version);
        assert_eq!(parsed.result, original.result);
    }

    #[test]
    fn writes_to_the_context_path_for_raw_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let id = DatasourceId::from_string_repr("files/a.txt").expect("id");

        let path = write_context_document(dir.path(), &id, &result()).expect("write");
        assert!(path.ends_with("files/a.txt.yaml"));
        assert!(path.is_file());
    }
}
