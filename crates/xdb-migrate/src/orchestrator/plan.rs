//! Load order derived from foreign keys among the selected tables.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::core::Table;

/// Dependency-ordered table list.
///
/// Every edge in `dependencies` is respected by `order`. Edges that had to be
/// dropped to break a cycle are kept in `deferred_edges`; their constraints
/// can only be added once both tables hold data.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationPlan {
    /// Tables in load order.
    pub order: Vec<String>,
    /// Table -> tables it must wait for.
    pub dependencies: BTreeMap<String, BTreeSet<String>>,
    /// `(referencing, referenced)` pairs removed to break cycles.
    pub deferred_edges: Vec<(String, String)>,
}

impl MigrationPlan {
    /// Order `tables` so that referenced tables come before referencing ones.
    ///
    /// Only foreign keys between tables in the set count. Ties are broken by
    /// name. When only cyclic tables remain, the first by name has its
    /// outstanding edges deferred and the sort continues.
    pub fn build(tables: &[Table]) -> Self {
        let by_lower: BTreeMap<String, String> = tables
            .iter()
            .map(|t| (t.name.to_lowercase(), t.name.clone()))
            .collect();

        let mut dependencies: BTreeMap<String, BTreeSet<String>> = tables
            .iter()
            .map(|t| (t.name.clone(), BTreeSet::new()))
            .collect();
        for table in tables {
            for fk in &table.foreign_keys {
                let Some(target) = by_lower.get(&fk.ref_table.to_lowercase()) else {
                    continue;
                };
                if target == &table.name {
                    continue;
                }
                if let Some(deps) = dependencies.get_mut(&table.name) {
                    deps.insert(target.clone());
                }
            }
        }

        let mut remaining: BTreeMap<String, BTreeSet<String>> = dependencies.clone();
        let mut order = Vec::with_capacity(tables.len());
        let mut deferred_edges = Vec::new();

        while !remaining.is_empty() {
            let ready: Vec<String> = remaining
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(name, _)| name.clone())
                .collect();

            let next = match ready.into_iter().next() {
                Some(name) => name,
                None => {
                    // Everything left waits on something left: break the cycle
                    // at the first table by name.
                    let Some((name, deps)) = remaining.iter_mut().next() else {
                        break;
                    };
                    for dep in std::mem::take(deps) {
                        deferred_edges.push((name.clone(), dep.clone()));
                        if let Some(scheduled) = dependencies.get_mut(name.as_str()) {
                            scheduled.remove(&dep);
                        }
                    }
                    name.clone()
                }
            };

            remaining.remove(&next);
            for deps in remaining.values_mut() {
                deps.remove(&next);
            }
            order.push(next);
        }

        Self {
            order,
            dependencies,
            deferred_edges,
        }
    }

    pub fn has_cycles(&self) -> bool {
        !self.deferred_edges.is_empty()
    }

    /// Tables `table` must wait for.
    pub fn dependencies_of(&self, table: &str) -> impl Iterator<Item = &String> {
        self.dependencies.get(table).into_iter().flatten()
    }

    /// Load order reversed, for clearing referencing tables first.
    pub fn reverse_order(&self) -> Vec<String> {
        self.order.iter().rev().cloned().collect()
    }

    /// Position of `table` in the load order.
    pub fn position(&self, table: &str) -> Option<usize> {
        self.order.iter().position(|t| t == table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ForeignKey;

    fn table(name: &str, refs: &[&str]) -> Table {
        let mut t = Table::new("s", name);
        for r in refs {
            t.foreign_keys.push(ForeignKey {
                name: format!("fk_{}_{}", name, r),
                columns: vec![format!("{}_id", r)],
                ref_schema: "s".into(),
                ref_table: r.to_string(),
                ref_columns: vec!["id".into()],
                on_delete: "NO ACTION".into(),
                on_update: "NO ACTION".into(),
            });
        }
        t
    }

    fn assert_valid(plan: &MigrationPlan) {
        for (table, deps) in &plan.dependencies {
            for dep in deps {
                assert!(
                    plan.position(dep) < plan.position(table),
                    "{} must precede {}",
                    dep,
                    table
                );
            }
        }
    }

    #[test]
    fn test_referenced_tables_first() {
        let tables = vec![
            table("order_items", &["orders", "products"]),
            table("orders", &["customers"]),
            table("products", &[]),
            table("customers", &[]),
        ];
        let plan = MigrationPlan::build(&tables);
        assert_eq!(
            plan.order,
            vec!["customers", "orders", "products", "order_items"]
        );
        assert!(!plan.has_cycles());
        assert_valid(&plan);
        assert_eq!(
            plan.reverse_order().first().map(String::as_str),
            Some("order_items")
        );
    }

    #[test]
    fn test_self_reference_and_outside_tables_ignored() {
        let tables = vec![
            table("employees", &["employees", "departments_archive"]),
            table("audit", &[]),
        ];
        let plan = MigrationPlan::build(&tables);
        assert_eq!(plan.order, vec!["audit", "employees"]);
        assert!(!plan.has_cycles());
    }

    #[test]
    fn test_cycle_is_broken_and_deferred() {
        let tables = vec![
            table("a", &["b"]),
            table("b", &["a"]),
            table("c", &["a"]),
            table("root", &[]),
        ];
        let plan = MigrationPlan::build(&tables);
        assert_eq!(plan.order.len(), 4);
        assert!(plan.has_cycles());
        assert_eq!(plan.deferred_edges, vec![("a".to_string(), "b".to_string())]);
        assert_eq!(plan.order, vec!["root", "a", "b", "c"]);
        assert_valid(&plan);
    }

    #[test]
    fn test_case_insensitive_references() {
        let tables = vec![table("Orders", &["CUSTOMERS"]), table("Customers", &[])];
        let plan = MigrationPlan::build(&tables);
        assert_eq!(plan.order, vec!["Customers", "Orders"]);
        assert_eq!(
            plan.dependencies_of("Orders").cloned().collect::<Vec<_>>(),
            vec!["Customers"]
        );
    }
}
