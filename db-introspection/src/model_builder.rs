use std::collections::BTreeMap;

use common::plugin::sql::{SqlRow, SqlValue};

use crate::types::{
    CheckConstraint, ColumnStats, DatabaseColumn, DatabasePartitionInfo, DatabaseSchema,
    DatabaseTable, DatasetKind, ForeignKey, ForeignKeyColumnMap, Index, KeyConstraint, TableStats,
};

/// Raw rows for one catalog, keyed by logical component group. Every group
/// is optional per dialect; missing groups simply contribute nothing.
#[derive(Debug, Default)]
pub struct ComponentRows {
    pub relations: Vec<SqlRow>,
    pub columns: Vec<SqlRow>,
    pub primary_keys: Vec<SqlRow>,
    pub unique_constraints: Vec<SqlRow>,
    pub checks: Vec<SqlRow>,
    pub foreign_keys: Vec<SqlRow>,
    pub indexes: Vec<SqlRow>,
    pub partitions: Vec<SqlRow>,
    pub table_stats: Vec<SqlRow>,
    pub column_stats: Vec<SqlRow>,
}

const SCHEMA_FIELD: &str = "schema_name";

/// Recomposes the orthogonal component-query results into normalized
/// `DatabaseTable` aggregates.
#[derive(Debug, Default)]
pub struct IntrospectionModelBuilder {
    by_table: BTreeMap<String, DatabaseTable>,
}

impl IntrospectionModelBuilder {
    /// Group every component by schema and build each schema's tables.
    /// Schemas that end up without tables are dropped.
    pub fn build_schemas_from_components(
        schemas: &[String],
        components: &ComponentRows,
    ) -> Vec<DatabaseSchema> {
        let grouped_relations = group_by_schema(&components.relations);
        let grouped_columns = group_by_schema(&components.columns);
        let grouped_pk = group_by_schema(&components.primary_keys);
        let grouped_uq = group_by_schema(&components.unique_constraints);
        let grouped_checks = group_by_schema(&components.checks);
        let grouped_fks = group_by_schema(&components.foreign_keys);
        let grouped_idx = group_by_schema(&components.indexes);
        let grouped_parts = group_by_schema(&components.partitions);
        let grouped_table_stats = group_by_schema(&components.table_stats);
        let grouped_column_stats = group_by_schema(&components.column_stats);

        let empty: Vec<&SqlRow> = Vec::new();
        let mut out = Vec::new();
        for schema in schemas {
            let tables = Self::build_tables_from_components(
                grouped_relations.get(schema).unwrap_or(&empty),
                grouped_columns.get(schema).unwrap_or(&empty),
                grouped_pk.get(schema).unwrap_or(&empty),
                grouped_uq.get(schema).unwrap_or(&empty),
                grouped_checks.get(schema).unwrap_or(&empty),
                grouped_fks.get(schema).unwrap_or(&empty),
                grouped_idx.get(schema).unwrap_or(&empty),
                grouped_parts.get(schema).unwrap_or(&empty),
                grouped_table_stats.get(schema).unwrap_or(&empty),
                grouped_column_stats.get(schema).unwrap_or(&empty),
            );

            if !tables.is_empty() {
                out.push(DatabaseSchema {
                    name: schema.clone(),
                    tables,
                    description: None,
                });
            }
        }

        out
    }

    #[allow(clippy::too_many_arguments)]
    fn build_tables_from_components(
        relations: &[&SqlRow],
        columns: &[&SqlRow],
        primary_keys: &[&SqlRow],
        unique_constraints: &[&SqlRow],
        checks: &[&SqlRow],
        foreign_keys: &[&SqlRow],
        indexes: &[&SqlRow],
        partitions: &[&SqlRow],
        table_stats: &[&SqlRow],
        column_stats: &[&SqlRow],
    ) -> Vec<DatabaseTable> {
        let mut builder = Self::default();
        builder.apply_relations(relations);
        builder.apply_columns(columns);
        builder.apply_primary_keys(primary_keys);
        builder.apply_unique_constraints(unique_constraints);
        builder.apply_checks(checks);
        builder.apply_foreign_keys(foreign_keys);
        builder.apply_indexes(indexes);
        builder.apply_partitions(partitions);
        builder.apply_table_stats(table_stats);
        builder.apply_column_stats(column_stats);
        builder.finish()
    }

    fn get_or_create_table(&mut self, table_name: &str) -> &mut DatabaseTable {
        self.by_table
            .entry(table_name.to_owned())
            .or_insert_with(|| DatabaseTable::new(table_name))
    }

    pub fn apply_relations(&mut self, rows: &[&SqlRow]) {
        for row in rows {
            let Some(table_name) = row.get_str("table_name") else {
                continue;
            };
            let kind = DatasetKind::from_raw(row.get_str("kind").unwrap_or("table"));
            let description = row.get_str("description").map(str::to_owned);
            let table = self.get_or_create_table(table_name);
            table.kind = kind;
            if description.is_some() {
                table.description = description;
            }
        }
    }

    pub fn apply_columns(&mut self, rows: &[&SqlRow]) {
        let groups = group_rows(rows, &["table_name"]);
        for (key, mut group) in groups {
            sort_by_position(&mut group, "ordinal_position");
            let table = self.get_or_create_table(&key[0]);
            for row in group {
                let Some(name) = row.get_str("column_name") else {
                    continue;
                };
                table.columns.push(DatabaseColumn {
                    name: name.to_owned(),
                    data_type: row.get_str("data_type").unwrap_or_default().to_owned(),
                    nullable: row
                        .get("is_nullable")
                        .and_then(SqlValue::coerce_bool)
                        .unwrap_or(true),
                    description: row.get_str("description").map(str::to_owned),
                    default_expression: row.get_str("default_expression").map(str::to_owned),
                    generated: row.get_str("generated").map(str::to_owned),
                    checks: Vec::new(),
                    stats: None,
                });
            }
        }
    }

    pub fn apply_primary_keys(&mut self, rows: &[&SqlRow]) {
        let groups = group_rows(rows, &["table_name", "constraint_name"]);
        for (key, mut group) in groups {
            sort_by_position(&mut group, "position");
            let columns = column_names(&group);
            self.get_or_create_table(&key[0]).primary_key = Some(KeyConstraint {
                name: non_empty(&key[1]),
                columns,
                validated: Some(true),
            });
        }
    }

    pub fn apply_unique_constraints(&mut self, rows: &[&SqlRow]) {
        let groups = group_rows(rows, &["table_name", "constraint_name"]);
        for (key, mut group) in groups {
            sort_by_position(&mut group, "position");
            let columns = column_names(&group);
            self.get_or_create_table(&key[0])
                .unique_constraints
                .push(KeyConstraint {
                    name: non_empty(&key[1]),
                    columns,
                    validated: Some(true),
                });
        }
    }

    pub fn apply_checks(&mut self, rows: &[&SqlRow]) {
        for row in rows {
            let Some(table_name) = row.get_str("table_name") else {
                continue;
            };
            let check = CheckConstraint {
                name: row.get_str("constraint_name").map(str::to_owned),
                expression: row.get_str("expression").unwrap_or_default().to_owned(),
                validated: row.get("validated").and_then(SqlValue::coerce_bool),
            };
            self.get_or_create_table(table_name).checks.push(check);
        }
    }

    pub fn apply_foreign_keys(&mut self, rows: &[&SqlRow]) {
        let groups = group_rows(rows, &["table_name", "constraint_name"]);
        for (key, mut group) in groups {
            sort_by_position(&mut group, "position");
            let Some(first) = group.first() else {
                continue;
            };

            let referenced = match (first.get_str("ref_schema"), first.get_str("ref_table")) {
                (Some(schema), Some(table)) if !schema.is_empty() && !table.is_empty() => {
                    format!("{schema}.{table}")
                }
                _ => String::new(),
            };
            let on_update = first.get_str("on_update").map(str::to_owned);
            let on_delete = first.get_str("on_delete").map(str::to_owned);
            let enforced = first.get("enforced").and_then(SqlValue::coerce_bool).or(Some(true));
            let validated = first
                .get("validated")
                .and_then(SqlValue::coerce_bool)
                .or(Some(true));

            let mapping = group
                .iter()
                .filter_map(|row| {
                    Some(ForeignKeyColumnMap {
                        from_column: row.get_str("from_column")?.to_owned(),
                        to_column: row.get_str("to_column")?.to_owned(),
                    })
                })
                .collect();

            self.get_or_create_table(&key[0])
                .foreign_keys
                .push(ForeignKey {
                    name: non_empty(&key[1]),
                    mapping,
                    referenced_table: referenced,
                    enforced,
                    validated,
                    on_update,
                    on_delete,
                });
        }
    }

    pub fn apply_indexes(&mut self, rows: &[&SqlRow]) {
        let groups = group_rows(rows, &["table_name", "index_name"]);
        for (key, mut group) in groups {
            sort_by_position(&mut group, "position");
            let Some(first) = group.first() else {
                continue;
            };

            let unique = first
                .get("is_unique")
                .and_then(SqlValue::coerce_bool)
                .unwrap_or(false);
            let method = first.get_str("method").map(str::to_owned);
            let predicate = first.get_str("predicate").map(str::to_owned);
            let columns = group
                .iter()
                .filter_map(|row| row.get_str("expr").map(str::to_owned))
                .collect();

            self.get_or_create_table(&key[0]).indexes.push(Index {
                name: key[1].clone(),
                columns,
                unique,
                method,
                predicate,
            });
        }
    }

    pub fn apply_partitions(&mut self, rows: &[&SqlRow]) {
        for row in rows {
            let Some(table_name) = row.get_str("table_name").map(str::to_owned) else {
                continue;
            };

            let mut meta = serde_json::Map::new();
            for (column, value) in row.iter() {
                if matches!(column, "table_name" | "partition_tables" | "schema_name") {
                    continue;
                }
                if let Ok(json) = serde_json::to_value(value) {
                    meta.insert(column.to_owned(), json);
                }
            }

            let partition_tables = row
                .get("partition_tables")
                .and_then(SqlValue::as_string_array)
                .unwrap_or_default();

            self.get_or_create_table(&table_name).partition_info = Some(DatabasePartitionInfo {
                meta: serde_json::Value::Object(meta),
                partition_tables,
            });
        }
    }

    pub fn apply_table_stats(&mut self, rows: &[&SqlRow]) {
        for row in rows {
            let Some(table_name) = row.get_str("table_name") else {
                continue;
            };
            if let Some(row_count) = row.get_i64("row_count") {
                self.get_or_create_table(table_name).stats = Some(TableStats {
                    row_count,
                    approximate: true,
                });
            }
        }
    }

    pub fn apply_column_stats(&mut self, rows: &[&SqlRow]) {
        let mut stats_by_table_col: BTreeMap<(String, String), &SqlRow> = BTreeMap::new();
        for row in rows {
            if let (Some(table), Some(column)) =
                (row.get_str("table_name"), row.get_str("column_name"))
            {
                stats_by_table_col.insert((table.to_owned(), column.to_owned()), row);
            }
        }

        for (table_name, table) in &mut self.by_table {
            let row_count = table.stats.as_ref().map(|s| s.row_count);
            for column in &mut table.columns {
                let Some(stat_row) =
                    stats_by_table_col.get(&(table_name.clone(), column.name.clone()))
                else {
                    continue;
                };

                let mut null_count = None;
                let mut non_null_count = None;
                if let (Some(rows_total), Some(null_frac)) = (
                    row_count,
                    stat_row.get("null_frac").and_then(SqlValue::as_f64),
                ) {
                    let nulls = (rows_total as f64 * null_frac).round() as i64;
                    null_count = Some(nulls);
                    non_null_count = Some(rows_total - nulls);
                }

                let distinct_count = stat_row
                    .get("n_distinct")
                    .and_then(SqlValue::as_f64)
                    .and_then(|n_distinct| {
                        if n_distinct < 0.0 {
                            // Negative values are a fraction of the row count.
                            row_count.map(|total| (n_distinct.abs() * total as f64).round() as i64)
                        } else if n_distinct > 0.0 {
                            Some(n_distinct.round() as i64)
                        } else {
                            None
                        }
                    });

                let top_values = match (
                    stat_row.get_str("most_common_vals"),
                    stat_row.get_str("most_common_freqs"),
                    row_count,
                ) {
                    (Some(vals), Some(freqs), Some(total)) if total > 0 => {
                        let vals = parse_pg_array_simple(vals);
                        let freqs = parse_pg_array_simple(freqs);
                        if !vals.is_empty() && vals.len() == freqs.len() {
                            let pairs: Vec<(String, i64)> = vals
                                .into_iter()
                                .zip(freqs)
                                .filter_map(|(value, freq)| {
                                    freq.parse::<f64>()
                                        .ok()
                                        .map(|f| (value, (f * total as f64).round() as i64))
                                })
                                .take(5)
                                .collect();
                            (!pairs.is_empty()).then_some(pairs)
                        } else {
                            None
                        }
                    }
                    _ => None,
                };

                let (min_value, max_value) = stat_row
                    .get_str("histogram_bounds")
                    .map(parse_pg_array_simple)
                    .filter(|bounds| !bounds.is_empty())
                    .map_or((None, None), |bounds| {
                        (bounds.first().cloned(), bounds.last().cloned())
                    });

                column.stats = Some(ColumnStats {
                    null_count,
                    non_null_count,
                    distinct_count,
                    min_value,
                    max_value,
                    top_values,
                });
            }
        }
    }

    /// Tables in sorted name order.
    pub fn finish(self) -> Vec<DatabaseTable> {
        self.by_table.into_values().collect()
    }
}

fn group_by_schema(rows: &[SqlRow]) -> BTreeMap<String, Vec<&SqlRow>> {
    let mut grouped: BTreeMap<String, Vec<&SqlRow>> = BTreeMap::new();
    for row in rows {
        if let Some(schema) = row.get_str(SCHEMA_FIELD) {
            if !schema.is_empty() {
                grouped.entry(schema.to_owned()).or_default().push(row);
            }
        }
    }
    grouped
}

fn group_rows<'a>(rows: &[&'a SqlRow], key_fields: &[&str]) -> BTreeMap<Vec<String>, Vec<&'a SqlRow>> {
    let mut grouped: BTreeMap<Vec<String>, Vec<&SqlRow>> = BTreeMap::new();
    for row in rows {
        let key: Vec<String> = key_fields
            .iter()
            .map(|field| {
                row.get(field)
                    .filter(|value| !value.is_null())
                    .map(ToString::to_string)
                    .unwrap_or_default()
            })
            .collect();
        grouped.entry(key).or_default().push(row);
    }
    grouped
}

/// Null positions sort last, stably.
fn sort_by_position(rows: &mut [&SqlRow], pos_field: &str) {
    rows.sort_by_key(|row| {
        let pos = row.get_i64(pos_field);
        (pos.is_none(), pos.unwrap_or(0))
    });
}

fn column_names(rows: &[&SqlRow]) -> Vec<String> {
    rows.iter()
        .filter_map(|row| row.get_str("column_name").map(str::to_owned))
        .collect()
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_owned())
}

/// Parse the `{value1,value2}` array format the PG statistics views emit.
/// Quoted strings with embedded commas are not handled.
fn parse_pg_array_simple(arr_str: &str) -> Vec<String> {
    let Some(content) = arr_str
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
    else {
        return Vec::new();
    };
    content
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_owned)
        .collect()
}
