use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

pub const ALLOWED_YAML_SUFFIXES: [&str; 2] = [".yaml", ".yml"];
pub const CONTEXT_FILE_SUFFIX: &str = ".yaml";

/// How a datasource is declared in the project source tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasourceKind {
    /// A YAML config file describing how to reach the datasource.
    Config,
    /// A raw file that is itself the datasource.
    File,
}

/// The ID of a datasource: the path to its config (or raw) file relative to
/// the project's `src` folder, split into path-without-suffix and suffix.
///
/// e.g. `databases/my_postgres.yaml` is
/// `(datasource_path: "databases/my_postgres", config_file_suffix: ".yaml")`.
///
/// Use the `from_string_repr` / `from_context_file_path` factories rather
/// than assembling the parts by hand; they validate the invariants.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatasourceId {
    datasource_path: String,
    config_file_suffix: String,
}

impl DatasourceId {
    pub fn new(
        datasource_path: impl Into<String>,
        config_file_suffix: impl Into<String>,
    ) -> Result<Self, EngineError> {
        let id = Self {
            datasource_path: datasource_path.into(),
            config_file_suffix: config_file_suffix.into(),
        };

        if id.datasource_path.trim().is_empty() {
            return Err(EngineError::Validation(format!(
                "Invalid DatasourceId ({id}): datasource_path must not be empty"
            )));
        }
        if id.config_file_suffix.trim().is_empty() {
            return Err(EngineError::Validation(format!(
                "Invalid DatasourceId ({id}): config_file_suffix must not be empty"
            )));
        }
        if !id.config_file_suffix.starts_with('.') {
            return Err(EngineError::Validation(format!(
                "Invalid DatasourceId ({id}): config_file_suffix must start with a dot \".\" (e.g.: .yaml)"
            )));
        }
        if id.datasource_path.ends_with(&id.config_file_suffix) {
            return Err(EngineError::Validation(format!(
                "Invalid DatasourceId ({id}): datasource_path must not contain the file suffix"
            )));
        }

        Ok(id)
    }

    /// Parse the string form, the path to the config file relative to the
    /// project's `src` folder (e.g. `databases/my_postgres.yaml`).
    pub fn from_string_repr(datasource_id_as_string: &str) -> Result<Self, EngineError> {
        let normalized = normalize_relative_path(datasource_id_as_string);
        let (path, suffix) = split_suffix(&normalized);
        Self::new(path, suffix)
    }

    /// Parse a context file path. Context files generated from raw files use
    /// a double suffix (`<name>.<raw_ext>.yaml`); the trailing `.yaml` is
    /// stripped so the id points back at the raw file.
    pub fn from_context_file_path(datasource_context_file: &Path) -> Result<Self, EngineError> {
        let normalized = normalize_relative_path(&datasource_context_file.to_string_lossy());
        let mut candidate = normalized.clone();

        if let Some(stripped) = normalized.strip_suffix(CONTEXT_FILE_SUFFIX) {
            // Only strip when another suffix remains underneath.
            let (_, inner_suffix) = split_suffix(stripped);
            if !inner_suffix.is_empty() {
                candidate = stripped.to_string();
            }
        }

        let (path, suffix) = split_suffix(&candidate);
        Self::new(path, suffix)
    }

    pub fn kind(&self) -> DatasourceKind {
        let parts: Vec<&str> = self.datasource_path.split('/').collect();
        if parts.len() == 2 && parts[0] == "files" {
            return DatasourceKind::File;
        }
        if ALLOWED_YAML_SUFFIXES.contains(&self.config_file_suffix.as_str()) {
            return DatasourceKind::Config;
        }
        DatasourceKind::File
    }

    /// The user-facing datasource name: the file name without the config
    /// suffix for configured datasources, the full file name for raw files.
    pub fn name(&self) -> String {
        let base = match self.kind() {
            DatasourceKind::Config => self.datasource_path.clone(),
            DatasourceKind::File => format!("{}{}", self.datasource_path, self.config_file_suffix),
        };
        base.rsplit('/').next().unwrap_or(&base).to_string()
    }

    pub fn datasource_path(&self) -> &str {
        &self.datasource_path
    }

    pub fn config_file_suffix(&self) -> &str {
        &self.config_file_suffix
    }

    /// Path to the config (or raw) file, relative to the project `src` folder.
    pub fn relative_path_to_config_file(&self) -> PathBuf {
        PathBuf::from(format!("{}{}", self.datasource_path, self.config_file_suffix))
    }

    /// Path to the context file, relative to a run folder under `output`.
    ///
    /// Raw-file datasources keep their original suffix in the file name so
    /// that two files differing only in extension don't collide.
    pub fn relative_path_to_context_file(&self) -> PathBuf {
        let suffix = if ALLOWED_YAML_SUFFIXES.contains(&self.config_file_suffix.as_str()) {
            CONTEXT_FILE_SUFFIX.to_string()
        } else {
            format!("{}{}", self.config_file_suffix, CONTEXT_FILE_SUFFIX)
        };

        PathBuf::from(format!("{}{}", self.datasource_path, suffix))
    }
}

impl fmt::Display for DatasourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.datasource_path, self.config_file_suffix)
    }
}

impl Serialize for DatasourceId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DatasourceId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::from_string_repr(&raw).map_err(serde::de::Error::custom)
    }
}

fn normalize_relative_path(raw: &str) -> String {
    raw.split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Split a relative path into (path-without-last-suffix, suffix-with-dot).
/// The suffix is empty when the final component carries no extension.
fn split_suffix(path: &str) -> (String, String) {
    let (dir, file_name) = match path.rfind('/') {
        Some(idx) => (&path[..=idx], &path[idx + 1..]),
        None => ("", path),
    };

    match file_name.rfind('.') {
        Some(idx) if idx > 0 => (
            format!("{dir}{}", &file_name[..idx]),
            file_name[idx..].to_string(),
        ),
        _ => (path.to_string(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_path_containing_the_suffix() {
        let err = DatasourceId::new("parent/my_datasource.yaml", ".yaml").unwrap_err();
        assert!(err.to_string().contains("not contain the file suffix"));
    }

    #[test]
    fn rejects_suffix_without_leading_dot() {
        let err = DatasourceId::new("parent/my_datasource", "yaml").unwrap_err();
        assert!(err
            .to_string()
            .contains("config_file_suffix must start with a dot"));
    }

    #[test]
    fn accepts_raw_file_path_with_yaml_suffix() {
        assert!(DatasourceId::new("parent/my_datasource.txt", ".yaml").is_ok());
        assert!(DatasourceId::new("Case Sensitive Folder/My Datasource", ".yaml").is_ok());
    }

    #[test]
    fn from_string_repr_parses_nested_paths() {
        let id = DatasourceId::from_string_repr("parent/child/my_datasource.yaml").unwrap();
        assert_eq!(id.datasource_path(), "parent/child/my_datasource");
        assert_eq!(id.config_file_suffix(), ".yaml");
    }

    #[test]
    fn from_string_repr_rejects_missing_suffix() {
        for input in ["parent/my_datasource", "parent/", "my_datasource"] {
            let err = DatasourceId::from_string_repr(input).unwrap_err();
            assert!(err.to_string().contains("must not be empty"), "{input}");
        }
    }

    #[test]
    fn from_string_repr_normalizes_duplicate_separators() {
        let id = DatasourceId::from_string_repr("parent//my_datasource.yaml").unwrap();
        assert_eq!(id.datasource_path(), "parent/my_datasource");
    }

    #[test]
    fn from_string_repr_keeps_inner_suffix_of_raw_files() {
        let id = DatasourceId::from_string_repr("parent/my_datasource.txt.yaml").unwrap();
        assert_eq!(id.datasource_path(), "parent/my_datasource.txt");
        assert_eq!(id.config_file_suffix(), ".yaml");
    }

    #[test]
    fn context_file_paths_round_trip() {
        let config = DatasourceId::new("parent/my_datasource", ".yaml").unwrap();
        assert_eq!(
            config.relative_path_to_context_file(),
            PathBuf::from("parent/my_datasource.yaml")
        );

        let raw = DatasourceId::new("parent/my_datasource", ".txt").unwrap();
        assert_eq!(
            raw.relative_path_to_context_file(),
            PathBuf::from("parent/my_datasource.txt.yaml")
        );

        let parsed = DatasourceId::from_context_file_path(&raw.relative_path_to_context_file())
            .expect("context path should parse back");
        assert_eq!(parsed, raw);
    }

    #[test]
    fn string_repr_round_trips() {
        let input = "parent/my_datasource.yaml";
        let id = DatasourceId::from_string_repr(input).unwrap();
        assert_eq!(id.to_string(), input);
        assert_eq!(DatasourceId::from_string_repr(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn kind_follows_folder_and_suffix_rules() {
        let cases = [
            ("databases/pg.yaml", DatasourceKind::Config),
            ("files/report.txt", DatasourceKind::File),
            ("files/report.yaml", DatasourceKind::File),
            ("custom/notes.txt", DatasourceKind::File),
        ];
        for (repr, expected) in cases {
            let id = DatasourceId::from_string_repr(repr).unwrap();
            assert_eq!(id.kind(), expected, "{repr}");
        }
    }

    #[test]
    fn name_depends_on_kind() {
        let cases = [
            ("my_datasource.yaml", "my_datasource"),
            ("parent/my_datasource.yaml", "my_datasource"),
            ("parent/my_datasource.txt", "my_datasource.txt"),
            ("files/my_datasource.yaml", "my_datasource.yaml"),
        ];
        for (repr, expected) in cases {
            let id = DatasourceId::from_string_repr(repr).unwrap();
            assert_eq!(id.name(), expected, "{repr}");
        }
    }
}
