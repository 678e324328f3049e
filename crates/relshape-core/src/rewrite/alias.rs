//! Table alias uniquification.
//!
//! Composition (inlined subqueries, merged joins) can leave several table
//! sources with the same alias. This pass makes every alias reachable from one
//! root unique, case-insensitively, by appending 0, 1, 2, ... to later
//! occurrences. Assignments are recorded in a side table keyed by [`TableId`]
//! and then applied to table sources and to the columns that reference them.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};

use relshape_ir::{unique_name, ColumnExpr, KeyAccessExpr, SelectExpr, SqlExpr, TableExpr, TableId};

use super::visit::{walk_select, ExprRewriter};

/// Assigns unique aliases within one root query.
#[derive(Debug, Default)]
pub struct TableAliasUniquifier {
    used: HashSet<String>,
    visited: HashSet<TableId>,
    aliases: HashMap<TableId, String>,
}

impl TableAliasUniquifier {
    /// Create a new uniquifier with an empty scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uniquify a root query in a fresh scope.
    pub fn uniquify(select: &SelectExpr) -> Cow<'_, SelectExpr> {
        let mut uniquifier = Self::new();
        uniquifier.assign(select);
        uniquifier.apply(select)
    }

    /// Record an alias for every table source not seen before.
    pub fn assign(&mut self, select: &SelectExpr) {
        let mut collector = Collector { scope: self };
        // nothing is rewritten in this walk
        let _ = walk_select(&mut collector, select);
    }

    /// Aliases assigned so far.
    pub fn aliases(&self) -> &HashMap<TableId, String> {
        &self.aliases
    }

    /// Rewrite table sources and column qualifiers to the assigned aliases.
    pub fn apply<'a>(&self, select: &'a SelectExpr) -> Cow<'a, SelectExpr> {
        walk_select(&mut Applier { aliases: &self.aliases }, select)
    }

    fn reserve(&mut self, table: &TableExpr) {
        if !self.visited.insert(table.id()) {
            return;
        }
        let Some(alias) = table.alias() else {
            return;
        };
        let unique = unique_name(alias, &self.used);
        self.used.insert(unique.to_lowercase());
        self.aliases.insert(table.id(), unique);
    }
}

struct Collector<'s> {
    scope: &'s mut TableAliasUniquifier,
}

impl ExprRewriter for Collector<'_> {
    fn rewrite_table_alias(&mut self, table: &TableExpr) -> Option<Option<String>> {
        self.scope.reserve(table);
        None
    }
}

struct Applier<'m> {
    aliases: &'m HashMap<TableId, String>,
}

impl Applier<'_> {
    fn renamed(&self, table: TableId, current: Option<&str>) -> Option<String> {
        self.aliases
            .get(&table)
            .filter(|alias| Some(alias.as_str()) != current)
            .cloned()
    }
}

impl ExprRewriter for Applier<'_> {
    fn rewrite_column(&mut self, column: &ColumnExpr) -> Option<SqlExpr> {
        self.renamed(column.table, column.table_alias.as_deref()).map(|alias| {
            SqlExpr::Column(ColumnExpr {
                table_alias: Some(alias),
                ..column.clone()
            })
        })
    }

    fn rewrite_key_access(&mut self, key: &KeyAccessExpr) -> Option<SqlExpr> {
        self.renamed(key.table, key.table_alias.as_deref()).map(|alias| {
            SqlExpr::KeyAccess(KeyAccessExpr {
                table_alias: Some(alias),
                ..key.clone()
            })
        })
    }

    fn rewrite_table_alias(&mut self, table: &TableExpr) -> Option<Option<String>> {
        self.renamed(table.id(), table.alias()).map(Some)
    }
}

/// Every alias declared by a table source reachable from `select`.
pub fn collect_aliases(select: &SelectExpr) -> Vec<String> {
    struct Aliases(Vec<String>, HashSet<TableId>);
    impl ExprRewriter for Aliases {
        fn rewrite_table_alias(&mut self, table: &TableExpr) -> Option<Option<String>> {
            if self.1.insert(table.id()) {
                if let Some(alias) = table.alias() {
                    self.0.push(alias.to_string());
                }
            }
            None
        }
    }
    let mut aliases = Aliases(Vec::new(), HashSet::new());
    let _ = walk_select(&mut aliases, select);
    aliases.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use relshape_ir::{DerivedTable, JoinExpr, TableRef};

    fn assert_unique(select: &SelectExpr) {
        let aliases = collect_aliases(select);
        let lowered: HashSet<String> = aliases.iter().map(|a| a.to_lowercase()).collect();
        assert_eq!(lowered.len(), aliases.len(), "duplicate aliases in {aliases:?}");
    }

    fn colliding() -> SelectExpr {
        let users = TableRef::new("Users", "t");
        let orders = TableRef::new("Orders", "T");
        let inner = SelectExpr::from_table(orders.clone())
            .project("UserId", orders.column("UserId", None, false));
        let derived = DerivedTable::new("t", inner);
        let joined = derived.column_at(0).unwrap();
        SelectExpr::from_table(users.clone())
            .project("Id", users.column("Id", None, false))
            .join(JoinExpr::Left {
                table: Box::new(derived.into()),
                predicate: SqlExpr::equal(users.column("Id", None, false), joined.into()),
            })
    }

    #[test]
    fn test_colliding_aliases_get_suffixes() {
        let select = colliding();
        let unique = TableAliasUniquifier::uniquify(&select).into_owned();
        assert_unique(&unique);
        assert_eq!(collect_aliases(&unique), vec!["t", "t0", "T1"]);
        assert_eq!(
            unique.to_string(),
            "SELECT t.Id AS Id FROM Users AS t \
             LEFT JOIN (SELECT T1.UserId AS UserId FROM Orders AS T1) AS t0 \
             ON t.Id = t0.UserId"
        );
    }

    #[test]
    fn test_uniquify_is_idempotent() {
        let once = TableAliasUniquifier::uniquify(&colliding()).into_owned();
        let twice = TableAliasUniquifier::uniquify(&once);
        assert!(matches!(twice, Cow::Borrowed(s) if std::ptr::eq(s, &once)));
    }

    #[test]
    fn test_same_physical_table_visited_once() {
        let users = TableRef::new("Users", "u");
        let select =
            SelectExpr::from_table(users.clone()).project("Id", users.column("Id", None, false));
        // a union of the select with itself reaches the same table id twice
        let set = relshape_ir::SetOperationExpr::new(
            "s",
            relshape_ir::SetOperationKind::Union,
            true,
            select.clone(),
            select.clone(),
        );
        let root = SelectExpr::from_table(TableExpr::SetOperation(set));

        let mut uniquifier = TableAliasUniquifier::new();
        uniquifier.assign(&root);
        assert_eq!(uniquifier.aliases().len(), 2);
        let applied = uniquifier.apply(&root);
        assert!(matches!(applied, Cow::Borrowed(_)));
    }
}
