use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// User-supplied filter pruning the catalogs and schemas a dialect walks.
///
/// Rules match exact `(catalog, schema)` pairs, or a whole catalog when no
/// schema list is given. Exclude rules take precedence over include rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntrospectionScope {
    #[serde(default)]
    pub include: Vec<ScopeRule>,
    #[serde(default)]
    pub exclude: Vec<ScopeRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeRule {
    pub catalog: String,
    /// `None` matches every schema in the catalog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schemas: Option<Vec<String>>,
}

impl ScopeRule {
    fn matches(&self, catalog: &str, schema: &str) -> bool {
        if self.catalog != catalog {
            return false;
        }
        match &self.schemas {
            None => true,
            Some(schemas) => schemas.iter().any(|s| s == schema),
        }
    }
}

/// The catalogs and schemas left after scope filtering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedScope {
    pub catalogs: Vec<String>,
    pub schemas_per_catalog: HashMap<String, Vec<String>>,
}

pub struct IntrospectionScopeMatcher {
    scope: Option<IntrospectionScope>,
    ignored_schemas: HashSet<String>,
}

impl IntrospectionScopeMatcher {
    pub fn new(scope: Option<IntrospectionScope>, ignored_schemas: &[String]) -> Self {
        Self {
            scope,
            ignored_schemas: ignored_schemas.iter().map(|s| s.to_lowercase()).collect(),
        }
    }

    /// Filter discovered catalogs/schemas down to the introspectable set.
    /// Catalogs that end up with no schemas are dropped entirely.
    pub fn filter_scopes(
        &self,
        catalogs: &[String],
        discovered_schemas_per_catalog: &HashMap<String, Vec<String>>,
    ) -> ResolvedScope {
        let mut resolved = ResolvedScope::default();

        for catalog in catalogs {
            let Some(schemas) = discovered_schemas_per_catalog.get(catalog) else {
                continue;
            };

            let in_scope: Vec<String> = schemas
                .iter()
                .filter(|schema| self.allows(catalog, schema))
                .cloned()
                .collect();

            if !in_scope.is_empty() {
                resolved.catalogs.push(catalog.clone());
                resolved
                    .schemas_per_catalog
                    .insert(catalog.clone(), in_scope);
            }
        }

        resolved
    }

    fn allows(&self, catalog: &str, schema: &str) -> bool {
        if self.ignored_schemas.contains(&schema.to_lowercase()) {
            return false;
        }

        let Some(scope) = &self.scope else {
            return true;
        };

        if scope.exclude.iter().any(|rule| rule.matches(catalog, schema)) {
            return false;
        }

        if scope.include.is_empty() {
            return true;
        }

        scope.include.iter().any(|rule| rule.matches(catalog, schema))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discovered(pairs: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(catalog, schemas)| {
                (
                    (*catalog).to_string(),
                    schemas.iter().map(|s| (*s).to_string()).collect(),
                )
            })
            .collect()
    }

    fn denied() -> Vec<String> {
        vec!["information_schema".to_string(), "pg_catalog".to_string()]
    }

    #[test]
    fn no_scope_includes_everything_except_denied_schemas() {
        let matcher = IntrospectionScopeMatcher::new(None, &denied());
        let resolved = matcher.filter_scopes(
            &["main".to_string(), "sys".to_string()],
            &discovered(&[
                ("main", &["public", "app", "information_schema"]),
                ("sys", &["pg_catalog"]),
            ]),
        );

        assert_eq!(resolved.catalogs, vec!["main"]);
        assert_eq!(
            resolved.schemas_per_catalog["main"],
            vec!["public", "app"]
        );
    }

    #[test]
    fn include_rule_restricts_to_named_schemas() {
        let scope = IntrospectionScope {
            include: vec![ScopeRule {
                catalog: "main".to_string(),
                schemas: Some(vec!["app".to_string()]),
            }],
            exclude: vec![],
        };
        let matcher = IntrospectionScopeMatcher::new(Some(scope), &denied());
        let resolved = matcher.filter_scopes(
            &["main".to_string(), "sys".to_string()],
            &discovered(&[("main", &["public", "app"]), ("sys", &["pg_catalog"])]),
        );

        assert_eq!(resolved.catalogs, vec!["main"]);
        assert_eq!(resolved.schemas_per_catalog["main"], vec!["app"]);
    }

    #[test]
    fn exclude_takes_precedence_over_include() {
        let scope = IntrospectionScope {
            include: vec![ScopeRule {
                catalog: "main".to_string(),
                schemas: None,
            }],
            exclude: vec![ScopeRule {
                catalog: "main".to_string(),
                schemas: Some(vec!["app".to_string()]),
            }],
        };
        let matcher = IntrospectionScopeMatcher::new(Some(scope), &denied());
        let resolved = matcher.filter_scopes(
            &["main".to_string()],
            &discovered(&[("main", &["public", "app"])]),
        );

        assert_eq!(resolved.schemas_per_catalog["main"], vec!["public"]);
    }

    #[test]
    fn catalog_wide_exclude_drops_the_catalog() {
        let scope = IntrospectionScope {
            include: vec![],
            exclude: vec![ScopeRule {
                catalog: "scratch".to_string(),
                schemas: None,
            }],
        };
        let matcher = IntrospectionScopeMatcher::new(Some(scope), &denied());
        let resolved = matcher.filter_scopes(
            &["main".to_string(), "scratch".to_string()],
            &discovered(&[("main", &["public"]), ("scratch", &["public"])]),
        );

        assert_eq!(resolved.catalogs, vec!["main"]);
        assert!(!resolved.schemas_per_catalog.contains_key("scratch"));
    }

    #[test]
    fn denied_schemas_are_never_included_even_when_asked_for() {
        let scope = IntrospectionScope {
            include: vec![ScopeRule {
                catalog: "main".to_string(),
                schemas: Some(vec!["pg_catalog".to_string(), "app".to_string()]),
            }],
            exclude: vec![],
        };
        let matcher = IntrospectionScopeMatcher::new(Some(scope), &denied());
        let resolved = matcher.filter_scopes(
            &["main".to_string()],
            &discovered(&[("main", &["pg_catalog", "app"])]),
        );

        assert_eq!(resolved.schemas_per_catalog["main"], vec!["app"]);
    }
}
