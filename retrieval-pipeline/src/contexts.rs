use std::path::Path;

use walkdir::WalkDir;

use common::datasource::DatasourceId;
use common::error::EngineError;
use common::project::ProjectLayout;

/// One built context document, as produced by the most recent run.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasourceContext {
    pub datasource_id: DatasourceId,
    pub context: String,
}

pub fn get_context_header_for_datasource(id: &DatasourceId) -> String {
    format!("# ===== {id} =====\n")
}

/// All contexts from the most recent run, sorted by datasource id.
pub fn get_all_contexts(layout: &ProjectLayout) -> Result<Vec<DatasourceContext>, EngineError> {
    let Some(run_dir) = layout.latest_run_dir()? else {
        return Ok(Vec::new());
    };

    let mut contexts = Vec::new();
    for entry in WalkDir::new(&run_dir).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(&run_dir)
            .map_err(|_| EngineError::Validation("context file outside run dir".into()))?;
        let Ok(datasource_id) = DatasourceId::from_context_file_path(relative) else {
            continue;
        };
        let context = std::fs::read_to_string(entry.path())?;
        contexts.push(DatasourceContext {
            datasource_id,
            context,
        });
    }

    contexts.sort_by_key(|context| context.datasource_id.to_string());
    Ok(contexts)
}

pub fn get_datasource_context(
    layout: &ProjectLayout,
    datasource_id: &DatasourceId,
) -> Result<DatasourceContext, EngineError> {
    let Some(run_dir) = layout.latest_run_dir()? else {
        return Err(EngineError::NotFound(format!(
            "no built context available for {datasource_id}"
        )));
    };

    let path = layout.context_file_path(&run_dir, datasource_id);
    read_context(&path, datasource_id)
}

/// The list of datasources for which a context is available.
pub fn get_introspected_datasource_list(
    layout: &ProjectLayout,
) -> Result<Vec<DatasourceId>, EngineError> {
    Ok(get_all_contexts(layout)?
        .into_iter()
        .map(|context| context.datasource_id)
        .collect())
}

/// All contexts concatenated, each preceded by its id header.
pub fn get_all_contexts_formatted(layout: &ProjectLayout) -> Result<String, EngineError> {
    let contexts = get_all_contexts(layout)?;
    Ok(contexts
        .iter()
        .map(|context| {
            format!(
                "{}{}",
                get_context_header_for_datasource(&context.datasource_id),
                context.context
            )
        })
        .collect::<Vec<_>>()
        .join("\n"))
}

fn read_context(path: &Path, datasource_id: &DatasourceId) -> Result<DatasourceContext, EngineError> {
    if !path.is_file() {
        return Err(EngineError::NotFound(format!(
            "no built context available for {datasource_id}"
        )));
    }
    Ok(DatasourceContext {
        datasource_id: datasource_id.clone(),
        context: std::fs::read_to_string(path)?,
    })
}
