//! Query translation.
//!
//! Turns a typed domain query ([`ActivityQuery`], [`ActiveRuleQuery`])
//! into a [`FilterExpr`] tree that any index backend can evaluate or
//! render. The translator is pure: it never touches a store.
//!
//! The central composition rule: discrete filters combine as an AND of
//! per-key ORs. Every filtered key must be satisfied, but any one of the
//! candidate values per key is enough. A flat AND over all key/value
//! pairs would be wrong.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::error::{IndexError, Result};
use crate::models::{
    DocKind, Document, FieldValue, Inheritance, Severity, DETAIL_PROJECT_KEY, FIELD_CREATED_AT,
    FIELD_DETAILS, FIELD_INHERITANCE, FIELD_PARAMS, FIELD_PROFILE_KEY, FIELD_RULE_KEY,
    FIELD_SEVERITY, FIELD_TYPE,
};

/// Page size used when the caller passes `limit == 0`.
pub const DEFAULT_PAGE_SIZE: i64 = 10;

/// A boolean filter tree over index documents.
///
/// Built once per query and rendered by each backend: the in-memory
/// store evaluates it directly via [`FilterExpr::matches`], the SQLite
/// store renders it into a WHERE clause.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    /// No constraint.
    MatchAll,
    /// Document kind equality.
    KindIs(DocKind),
    /// Exact term equality on a top-level string field.
    Term { field: String, value: String },
    /// Exact term equality on one key of a nested mapping field.
    NestedTerm {
        field: String,
        key: String,
        value: String,
    },
    /// At least one branch matches. Empty means no document matches.
    AnyOf(Vec<FilterExpr>),
    /// Every branch matches. Empty means every document matches.
    AllOf(Vec<FilterExpr>),
    /// Creation timestamp strictly greater than the bound. Exclusive by
    /// contract; callers depend on the boundary value being excluded.
    CreatedAfter(DateTime<Utc>),
    /// Creation timestamp strictly less than the bound. Exclusive.
    CreatedBefore(DateTime<Utc>),
}

impl FilterExpr {
    /// Evaluate this filter against a single document.
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            FilterExpr::MatchAll => true,
            FilterExpr::KindIs(kind) => doc.kind == *kind,
            FilterExpr::Term { field, value } => doc
                .field(field)
                .and_then(FieldValue::as_str)
                .map(|s| s == value)
                .unwrap_or(false),
            FilterExpr::NestedTerm { field, key, value } => doc
                .field(field)
                .and_then(FieldValue::as_nested)
                .and_then(|map| map.get(key))
                .map(|s| s == value)
                .unwrap_or(false),
            FilterExpr::AnyOf(branches) => branches.iter().any(|b| b.matches(doc)),
            FilterExpr::AllOf(branches) => branches.iter().all(|b| b.matches(doc)),
            FilterExpr::CreatedAfter(bound) => {
                doc.created_at().map(|ts| ts > *bound).unwrap_or(false)
            }
            FilterExpr::CreatedBefore(bound) => {
                doc.created_at().map(|ts| ts < *bound).unwrap_or(false)
            }
        }
    }

    fn term(field: &str, value: impl Into<String>) -> Self {
        FilterExpr::Term {
            field: field.to_string(),
            value: value.into(),
        }
    }

    fn nested(field: &str, key: &str, value: impl Into<String>) -> Self {
        FilterExpr::NestedTerm {
            field: field.to_string(),
            key: key.to_string(),
            value: value.into(),
        }
    }
}

/// Adds one AND branch per nested key: any listed value for that key
/// matches, but every key must be satisfied.
fn push_nested_filters(
    clauses: &mut Vec<FilterExpr>,
    field: &str,
    filters: &BTreeMap<String, Vec<String>>,
) {
    for (key, values) in filters {
        if values.is_empty() {
            continue;
        }
        clauses.push(FilterExpr::AnyOf(
            values
                .iter()
                .map(|v| FilterExpr::nested(field, key, v.clone()))
                .collect(),
        ));
    }
}

// ============ Activity query ============

/// Filter set for activity lookups. An empty query matches every
/// activity document.
#[derive(Debug, Clone, Default)]
pub struct ActivityQuery {
    pub types: Vec<String>,
    pub details: BTreeMap<String, Vec<String>>,
    pub since: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl ActivityQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, activity_type: impl Into<String>) -> Self {
        self.types.push(activity_type.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.entry(key.into()).or_default().push(value.into());
        self
    }

    /// Scope to a project. Activities carry their project in the
    /// `projectKey` detail, so this is a nested-term filter like any
    /// other detail key.
    pub fn for_project(self, project_key: impl Into<String>) -> Self {
        self.with_detail(DETAIL_PROJECT_KEY, project_key)
    }

    pub fn since(mut self, bound: DateTime<Utc>) -> Self {
        self.since = Some(bound);
        self
    }

    pub fn to(mut self, bound: DateTime<Utc>) -> Self {
        self.to = Some(bound);
        self
    }

    /// Build the filter tree: AND of a kind term, an optional type OR,
    /// one OR per detail key, and exclusive range bounds.
    pub fn to_filter(&self) -> FilterExpr {
        let mut clauses = vec![FilterExpr::KindIs(DocKind::Activity)];

        if !self.types.is_empty() {
            clauses.push(FilterExpr::AnyOf(
                self.types
                    .iter()
                    .map(|t| FilterExpr::term(FIELD_TYPE, t.clone()))
                    .collect(),
            ));
        }

        push_nested_filters(&mut clauses, FIELD_DETAILS, &self.details);

        if let Some(since) = self.since {
            clauses.push(FilterExpr::CreatedAfter(since));
        }
        if let Some(to) = self.to {
            clauses.push(FilterExpr::CreatedBefore(to));
        }

        FilterExpr::AllOf(clauses)
    }
}

// ============ Active-rule query ============

/// Filter set for active-rule lookups (by profile, rule, severity,
/// inheritance, or param values).
#[derive(Debug, Clone, Default)]
pub struct ActiveRuleQuery {
    pub profile_key: Option<String>,
    pub rule_key: Option<String>,
    pub severities: Vec<Severity>,
    pub inheritances: Vec<Inheritance>,
    pub params: BTreeMap<String, Vec<String>>,
}

impl ActiveRuleQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_profile(mut self, profile_key: impl Into<String>) -> Self {
        self.profile_key = Some(profile_key.into());
        self
    }

    pub fn for_rule(mut self, rule_key: impl Into<String>) -> Self {
        self.rule_key = Some(rule_key.into());
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severities.push(severity);
        self
    }

    pub fn with_inheritance(mut self, inheritance: Inheritance) -> Self {
        self.inheritances.push(inheritance);
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.entry(name.into()).or_default().push(value.into());
        self
    }

    pub fn to_filter(&self) -> FilterExpr {
        let mut clauses = vec![FilterExpr::KindIs(DocKind::ActiveRule)];

        if let Some(ref profile) = self.profile_key {
            clauses.push(FilterExpr::term(FIELD_PROFILE_KEY, profile.clone()));
        }
        if let Some(ref rule) = self.rule_key {
            clauses.push(FilterExpr::term(FIELD_RULE_KEY, rule.clone()));
        }
        if !self.severities.is_empty() {
            clauses.push(FilterExpr::AnyOf(
                self.severities
                    .iter()
                    .map(|s| FilterExpr::term(FIELD_SEVERITY, s.as_str()))
                    .collect(),
            ));
        }
        if !self.inheritances.is_empty() {
            clauses.push(FilterExpr::AnyOf(
                self.inheritances
                    .iter()
                    .map(|i| FilterExpr::term(FIELD_INHERITANCE, i.as_str()))
                    .collect(),
            ));
        }

        push_nested_filters(&mut clauses, FIELD_PARAMS, &self.params);

        FilterExpr::AllOf(clauses)
    }
}

// ============ Search options ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    CreatedAt,
    Key,
}

impl SortField {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortField::CreatedAt => FIELD_CREATED_AT,
            SortField::Key => "key",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            FIELD_CREATED_AT => Ok(SortField::CreatedAt),
            "key" => Ok(SortField::Key),
            other => Err(IndexError::invalid_options(format!(
                "unknown sort field '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Pagination and sort for a search call.
///
/// `limit == 0` means "use the default page size"; negative values are
/// rejected by [`SearchOptions::validate`].
#[derive(Debug, Clone, Copy)]
pub struct SearchOptions {
    pub offset: i64,
    pub limit: i64,
    pub sort: SortField,
    pub order: SortOrder,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 0,
            sort: SortField::CreatedAt,
            order: SortOrder::Desc,
        }
    }
}

impl SearchOptions {
    pub fn page(offset: i64, limit: i64) -> Self {
        Self {
            offset,
            limit,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.offset < 0 {
            return Err(IndexError::invalid_options(format!(
                "offset must be >= 0, got {}",
                self.offset
            )));
        }
        if self.limit < 0 {
            return Err(IndexError::invalid_options(format!(
                "limit must be >= 0, got {}",
                self.limit
            )));
        }
        Ok(())
    }

    /// The limit a backend should actually apply.
    pub fn effective_limit(&self) -> i64 {
        if self.limit == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            self.limit
        }
    }
}
