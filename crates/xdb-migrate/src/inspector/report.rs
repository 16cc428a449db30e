//! Compatibility report between a source and a destination snapshot.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::{Column, SchemaSnapshot, Table};
use crate::dialect::{CanonicalType, ComposedMapper, TypeRelation};
use crate::error::{MigrateError, Result};

/// What is wrong with one column (or table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    TypeMismatch,
    PrecisionLoss,
    Unsupported,
    MissingTarget,
    PrimaryKeyMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => f.write_str("warning"),
            Severity::Error => f.write_str("error"),
        }
    }
}

/// One finding. `column` is empty for table-level issues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityIssue {
    pub table: String,
    pub column: String,
    pub issue: IssueKind,
    pub severity: Severity,
    pub detail: String,
}

impl fmt::Display for CompatibilityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.column.is_empty() {
            write!(f, "[{}] {}: {}", self.severity, self.table, self.detail)
        } else {
            write!(
                f,
                "[{}] {}.{}: {}",
                self.severity, self.table, self.column, self.detail
            )
        }
    }
}

/// Column-level compatibility of a table subset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompatibilityReport {
    /// Source tables compared, by bare name, in request order.
    pub tables: Vec<String>,
    /// Tables absent on the destination.
    pub missing_tables: Vec<String>,
    pub issues: Vec<CompatibilityIssue>,
}

impl CompatibilityReport {
    pub fn errors(&self) -> impl Iterator<Item = &CompatibilityIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &CompatibilityIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Warning)
    }

    pub fn has_errors(&self) -> bool {
        self.errors().next().is_some()
    }

    /// Issues that apply to `table`.
    pub fn for_table<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a CompatibilityIssue> {
        self.issues
            .iter()
            .filter(move |i| i.table.eq_ignore_ascii_case(table))
    }

    /// Tables kept out of a job by their `Error` issues, with the reasons.
    /// Empty when errors are overridden.
    pub fn blocked_tables(&self, override_errors: bool) -> BTreeMap<String, String> {
        let mut blocked: BTreeMap<String, Vec<String>> = BTreeMap::new();
        if !override_errors {
            for issue in self.errors() {
                blocked
                    .entry(issue.table.clone())
                    .or_default()
                    .push(issue.to_string());
            }
        }
        blocked
            .into_iter()
            .map(|(table, reasons)| (table, reasons.join("; ")))
            .collect()
    }

    /// Decide whether a job may proceed.
    ///
    /// `Error` issues only block their own table; the job is refused when
    /// no table is left to run. `MissingTarget` warnings are resolved by
    /// table creation, so they only block when `create_tables` is off.
    /// Checks on missing tables and warnings skip blocked tables.
    pub fn ensure_runnable(
        &self,
        create_tables: bool,
        acknowledge_warnings: bool,
        override_errors: bool,
    ) -> Result<()> {
        let blocked = self.blocked_tables(override_errors);
        if !self.tables.is_empty() && self.tables.iter().all(|t| blocked.contains_key(t)) {
            let reasons: Vec<&str> = blocked.values().map(String::as_str).collect();
            return Err(MigrateError::IncompatibleSchema(format!(
                "no table can be migrated: {}",
                reasons.join("; ")
            )));
        }
        let runnable = |table: &str| !blocked.contains_key(table);

        let missing: Vec<&str> = self
            .missing_tables
            .iter()
            .map(String::as_str)
            .filter(|t| runnable(t))
            .collect();
        if !create_tables && !missing.is_empty() {
            return Err(MigrateError::IncompatibleSchema(format!(
                "tables missing on destination and create_tables is off: {}",
                missing.join(", ")
            )));
        }

        let warnings: Vec<String> = self
            .warnings()
            .filter(|i| i.issue != IssueKind::MissingTarget && runnable(&i.table))
            .map(|i| i.to_string())
            .collect();
        if !warnings.is_empty() && !acknowledge_warnings {
            return Err(MigrateError::IncompatibleSchema(format!(
                "{} unacknowledged warning(s): {}",
                warnings.len(),
                warnings.join("; ")
            )));
        }
        Ok(())
    }
}

/// Compare `tables` of `source` against `dest`.
///
/// Destination tables are matched by bare name, since the two sides usually
/// live in differently named schemas. An empty `tables` compares every
/// source table.
pub fn compare(
    source: &SchemaSnapshot,
    dest: &SchemaSnapshot,
    tables: &[String],
    mapper: &ComposedMapper,
) -> Result<CompatibilityReport> {
    let selected: Vec<&Table> = if tables.is_empty() {
        source.tables.values().collect()
    } else {
        tables
            .iter()
            .map(|name| {
                source
                    .find(name)
                    .ok_or_else(|| MigrateError::NotFound(format!("source table {}", name)))
            })
            .collect::<Result<_>>()?
    };

    let mut report = CompatibilityReport::default();
    for src in selected {
        report.tables.push(src.name.clone());
        match dest.find(&src.name) {
            None => {
                report.missing_tables.push(src.name.clone());
                compare_missing(src, mapper, &mut report.issues);
            }
            Some(dst) => compare_present(src, dst, &mut report.issues),
        }
    }
    Ok(report)
}

fn issue(
    table: &Table,
    column: &str,
    kind: IssueKind,
    severity: Severity,
    detail: impl Into<String>,
) -> CompatibilityIssue {
    CompatibilityIssue {
        table: table.name.clone(),
        column: column.to_string(),
        issue: kind,
        severity,
        detail: detail.into(),
    }
}

fn unsupported(table: &Table, column: &str, ty: &CanonicalType) -> CompatibilityIssue {
    issue(
        table,
        column,
        IssueKind::Unsupported,
        Severity::Error,
        format!("type {} has no portable mapping", ty),
    )
}

/// Loss already incurred reading the source column into canonical form.
fn source_loss(src: &Table, col: &Column) -> Option<CompatibilityIssue> {
    let warning = col.canonical_warning.as_ref()?;
    Some(issue(
        src,
        &col.name,
        IssueKind::PrecisionLoss,
        Severity::Warning,
        format!("{} {}", col.data_type, warning),
    ))
}

fn compare_missing(src: &Table, mapper: &ComposedMapper, out: &mut Vec<CompatibilityIssue>) {
    for col in &src.columns {
        if col.canonical.is_unknown() {
            out.push(unsupported(src, &col.name, &col.canonical));
            continue;
        }
        out.push(issue(
            src,
            &col.name,
            IssueKind::MissingTarget,
            Severity::Warning,
            "table will be created on the destination",
        ));
        out.extend(source_loss(src, col));
        let mapping = mapper.map_canonical(&col.canonical);
        if mapping.is_lossy {
            out.push(issue(
                src,
                &col.name,
                IssueKind::PrecisionLoss,
                Severity::Warning,
                mapping
                    .warning
                    .unwrap_or_else(|| format!("lossy mapping to {}", mapping.target_type)),
            ));
        }
    }
}

fn compare_present(src: &Table, dst: &Table, out: &mut Vec<CompatibilityIssue>) {
    for col in &src.columns {
        let Some(target) = dst.column(&col.name) else {
            out.push(issue(
                src,
                &col.name,
                IssueKind::MissingTarget,
                Severity::Error,
                format!("column missing on destination table {}", dst.full_name()),
            ));
            continue;
        };

        if !col.canonical.is_unknown() {
            out.extend(source_loss(src, col));
        }
        match col.canonical.relation_to(&target.canonical) {
            TypeRelation::Equal | TypeRelation::Wider => {}
            TypeRelation::Narrower(why) => out.push(issue(
                src,
                &col.name,
                IssueKind::PrecisionLoss,
                Severity::Warning,
                why,
            )),
            TypeRelation::SafeConversion => out.push(issue(
                src,
                &col.name,
                IssueKind::TypeMismatch,
                Severity::Warning,
                format!("{} converted to {}", col.canonical, target.canonical),
            )),
            TypeRelation::Incompatible => out.push(issue(
                src,
                &col.name,
                IssueKind::TypeMismatch,
                Severity::Error,
                format!("{} cannot be stored as {}", col.canonical, target.canonical),
            )),
            TypeRelation::Unsupported => {
                let ty = if col.canonical.is_unknown() {
                    &col.canonical
                } else {
                    &target.canonical
                };
                out.push(unsupported(src, &col.name, ty));
            }
        }
    }

    if src.has_pk() != dst.has_pk() {
        let detail = if src.has_pk() {
            "destination table has no primary key; retries may duplicate rows"
        } else {
            "destination has a primary key the source lacks"
        };
        out.push(issue(
            src,
            "",
            IssueKind::PrimaryKeyMismatch,
            Severity::Warning,
            detail,
        ));
    }
}
