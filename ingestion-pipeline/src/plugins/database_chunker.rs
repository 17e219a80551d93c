use serde::{Deserialize, Serialize};

use common::error::EngineError;
use common::plugin::{ChunkContent, EmbeddableChunk};
use db_introspection::types::{
    DatabaseColumn, DatabaseIntrospectionResult, DatabaseTable,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseTableChunkContent {
    pub catalog_name: String,
    pub schema_name: String,
    pub table: DatabaseTable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseColumnChunkContent {
    pub catalog_name: String,
    pub schema_name: String,
    pub table_name: String,
    pub column: DatabaseColumn,
}

/// One chunk per table and one per column, walking the introspection tree.
pub fn build_database_chunks(
    result: &DatabaseIntrospectionResult,
) -> Result<Vec<EmbeddableChunk>, EngineError> {
    let mut chunks = Vec::new();
    for catalog in &result.catalogs {
        for schema in &catalog.schemas {
            for table in &schema.tables {
                chunks.push(create_table_chunk(&catalog.name, &schema.name, table)?);

                for column in &table.columns {
                    chunks.push(create_column_chunk(
                        &catalog.name,
                        &schema.name,
                        table,
                        column,
                    )?);
                }
            }
        }
    }

    Ok(chunks)
}

fn create_table_chunk(
    catalog_name: &str,
    schema_name: &str,
    table: &DatabaseTable,
) -> Result<EmbeddableChunk, EngineError> {
    Ok(EmbeddableChunk::new(
        build_table_chunk_text(table),
        ChunkContent::structured(&DatabaseTableChunkContent {
            catalog_name: catalog_name.to_owned(),
            schema_name: schema_name.to_owned(),
            table: table.clone(),
        })?,
    ))
}

fn create_column_chunk(
    catalog_name: &str,
    schema_name: &str,
    table: &DatabaseTable,
    column: &DatabaseColumn,
) -> Result<EmbeddableChunk, EngineError> {
    Ok(EmbeddableChunk::new(
        build_column_chunk_text(table, column),
        ChunkContent::structured(&DatabaseColumnChunkContent {
            catalog_name: catalog_name.to_owned(),
            schema_name: schema_name.to_owned(),
            table_name: table.name.clone(),
            column: column.clone(),
        })?,
    ))
}

fn build_table_chunk_text(table: &DatabaseTable) -> String {
    let sections = [
        format!(
            "{} is a database {} with {} columns",
            table.name,
            table.kind.as_str(),
            table.columns.len()
        ),
        build_table_primary_key_text(table),
        build_table_foreign_keys_section(table),
        build_table_all_columns_section(table),
        table.description.clone().unwrap_or_default(),
    ];

    join_sections(&sections)
}

fn build_table_all_columns_section(table: &DatabaseTable) -> String {
    let all_columns: Vec<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
    format!(
        "Here is the full list of columns for the {}: {}",
        table.kind.as_str(),
        all_columns.join(", ")
    )
}

fn build_table_primary_key_text(table: &DatabaseTable) -> String {
    let Some(primary_key) = &table.primary_key else {
        return String::new();
    };

    if primary_key.columns.len() == 1 {
        let primary_key_column = &primary_key.columns[0];
        let Some(column) = table.columns.iter().find(|c| &c.name == primary_key_column) else {
            return String::new();
        };
        return format!(
            "Its primary key is the column {primary_key_column} of type {}",
            column.data_type
        );
    }

    format!(
        "Its primary key is composed of the columns ({})",
        primary_key.columns.join(", ")
    )
}

fn build_table_foreign_keys_section(table: &DatabaseTable) -> String {
    if table.foreign_keys.is_empty() {
        return String::new();
    }

    let destinations: Vec<String> = table
        .foreign_keys
        .iter()
        .map(|fk| fk.referenced_table.clone())
        .collect();
    let all_destinations = join_with_different_last_separator(", ", " and ", &destinations);

    if table.foreign_keys.len() == 1 {
        return format!("The column has a foreign key to {all_destinations}");
    }

    format!(
        "The {} has foreign keys to {all_destinations}",
        table.kind.as_str()
    )
}

fn build_column_chunk_text(table: &DatabaseTable, column: &DatabaseColumn) -> String {
    let sections = [
        format!(
            "{} is a column with type {} in the {} {}",
            column.name,
            column.data_type,
            table.kind.as_str(),
            table.name
        ),
        format!(
            "It can{} contain null values",
            if column.nullable { "" } else { " not" }
        ),
        build_column_is_primary_key_section(table, column),
        build_column_is_foreign_key_section(table, column),
        build_column_generated_section(column),
        column.description.clone().unwrap_or_default(),
    ];

    join_sections(&sections)
}

fn build_column_generated_section(column: &DatabaseColumn) -> String {
    match column.generated.as_deref() {
        None | Some("") => String::new(),
        Some("identity") => "This column is an identity column".to_string(),
        Some(_) => "This column is a generated column".to_string(),
    }
}

fn build_column_is_primary_key_section(table: &DatabaseTable, column: &DatabaseColumn) -> String {
    let Some(primary_key) = &table.primary_key else {
        return String::new();
    };

    if primary_key.columns.len() == 1 && primary_key.columns[0] == column.name {
        return format!("It is the primary key of the {}", table.kind.as_str());
    }

    if primary_key.columns.contains(&column.name) {
        return format!("It is part of the primary key of the {}", table.kind.as_str());
    }

    String::new()
}

fn build_column_is_foreign_key_section(table: &DatabaseTable, column: &DatabaseColumn) -> String {
    let member_of: Vec<_> = table
        .foreign_keys
        .iter()
        .filter(|fk| fk.mapping.iter().any(|m| m.from_column == column.name))
        .collect();

    if member_of.is_empty() {
        return String::new();
    }

    let single_column: Vec<_> = member_of
        .iter()
        .filter(|fk| fk.mapping.len() == 1)
        .collect();
    let single_destinations: Vec<String> = single_column
        .iter()
        .map(|fk| format!("{}.{}", fk.referenced_table, fk.mapping[0].to_column))
        .collect();
    let single_section = if single_column.is_empty() {
        String::new()
    } else {
        format!(
            "This column is a foreign key to {}",
            join_with_different_last_separator(", ", " and ", &single_destinations)
        )
    };

    let composite: Vec<_> = member_of
        .iter()
        .filter(|fk| fk.mapping.len() > 1)
        .collect();
    let composite_destinations: Vec<String> = composite
        .iter()
        .map(|fk| fk.referenced_table.clone())
        .collect();
    let composite_section = if composite.is_empty() {
        String::new()
    } else {
        format!(
            "This column is part of a foreign key to {}",
            join_with_different_last_separator(", ", " and ", &composite_destinations)
        )
    };

    join_sections(&[single_section, composite_section])
}

fn join_sections(sections: &[String]) -> String {
    sections
        .iter()
        .filter(|section| !section.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join(". ")
}

fn join_with_different_last_separator(
    separator: &str,
    last_separator: &str,
    items: &[String],
) -> String {
    match items.len() {
        0 => String::new(),
        1 => items[0].clone(),
        _ => format!(
            "{}{last_separator}{}",
            items[..items.len() - 1].join(separator),
            items[items.len() - 1]
        ),
    }
}
