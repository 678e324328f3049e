//! Select expressions and table sources.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::expr::{ColumnExpr, SqlExpr};
use crate::types::TypeMapping;

static NEXT_TABLE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a table source.
///
/// Two structurally equal table sources built separately have different ids.
/// Clones of a tree share ids, which is how passes recognise the same physical
/// source reached along several paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId(u64);

impl TableId {
    /// Allocate a fresh id.
    pub fn next() -> Self {
        TableId(NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

/// A named output column of a select.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionExpr {
    pub alias: String,
    pub expr: SqlExpr,
}

/// One `ORDER BY` term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderingExpr {
    pub expr: SqlExpr,
    pub ascending: bool,
}

impl OrderingExpr {
    pub fn asc(expr: SqlExpr) -> Self {
        Self { expr, ascending: true }
    }

    pub fn desc(expr: SqlExpr) -> Self {
        Self { expr, ascending: false }
    }
}

/// A base table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRef {
    pub id: TableId,
    pub alias: Option<String>,
    pub name: String,
    pub schema: Option<String>,
}

impl TableRef {
    /// Create a new table reference with a fresh identity.
    pub fn new(name: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            id: TableId::next(),
            alias: Some(alias.into()),
            name: name.into(),
            schema: None,
        }
    }

    /// Column of this table.
    pub fn column(
        &self,
        name: impl Into<String>,
        type_mapping: Option<TypeMapping>,
        nullable: bool,
    ) -> SqlExpr {
        SqlExpr::Column(ColumnExpr {
            table: self.id,
            table_alias: self.alias.clone(),
            name: name.into(),
            type_mapping,
            nullable,
        })
    }
}

/// A subquery used as a table source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedTable {
    pub id: TableId,
    pub alias: Option<String>,
    pub select: Box<SelectExpr>,
}

impl DerivedTable {
    /// Create a new derived table with a fresh identity.
    pub fn new(alias: impl Into<String>, select: SelectExpr) -> Self {
        Self {
            id: TableId::next(),
            alias: Some(alias.into()),
            select: Box::new(select),
        }
    }

    /// Outer reference to the projection at `index`.
    pub fn column_at(&self, index: usize) -> Option<ColumnExpr> {
        self.select.projections.get(index).map(|p| ColumnExpr {
            table: self.id,
            table_alias: self.alias.clone(),
            name: p.alias.clone(),
            type_mapping: p.expr.type_mapping().cloned(),
            nullable: p.expr.is_nullable(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SetOperationKind {
    Except,
    Intersect,
    Union,
}

impl SetOperationKind {
    pub fn keyword(&self) -> &'static str {
        match self {
            SetOperationKind::Except => "EXCEPT",
            SetOperationKind::Intersect => "INTERSECT",
            SetOperationKind::Union => "UNION",
        }
    }
}

/// `(left <op> right) AS alias`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetOperationExpr {
    pub id: TableId,
    pub alias: Option<String>,
    pub kind: SetOperationKind,
    /// `UNION` versus `UNION ALL`.
    pub distinct: bool,
    pub left: Box<SelectExpr>,
    pub right: Box<SelectExpr>,
}

impl SetOperationExpr {
    /// Create a new set operation with a fresh identity.
    pub fn new(
        alias: impl Into<String>,
        kind: SetOperationKind,
        distinct: bool,
        left: SelectExpr,
        right: SelectExpr,
    ) -> Self {
        Self {
            id: TableId::next(),
            alias: Some(alias.into()),
            kind,
            distinct,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Outer reference to the output column at `index`; names come from the left side.
    pub fn column_at(&self, index: usize) -> Option<ColumnExpr> {
        self.left.projections.get(index).map(|p| ColumnExpr {
            table: self.id,
            table_alias: self.alias.clone(),
            name: p.alias.clone(),
            type_mapping: p.expr.type_mapping().cloned(),
            nullable: true,
        })
    }
}

/// Join of a table source into the enclosing select.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JoinExpr {
    Cross { table: Box<TableExpr> },
    CrossApply { table: Box<TableExpr> },
    OuterApply { table: Box<TableExpr> },
    Inner { table: Box<TableExpr>, predicate: SqlExpr },
    Left { table: Box<TableExpr>, predicate: SqlExpr },
}

impl JoinExpr {
    pub fn table(&self) -> &TableExpr {
        match self {
            JoinExpr::Cross { table }
            | JoinExpr::CrossApply { table }
            | JoinExpr::OuterApply { table }
            | JoinExpr::Inner { table, .. }
            | JoinExpr::Left { table, .. } => table,
        }
    }

    pub fn predicate(&self) -> Option<&SqlExpr> {
        match self {
            JoinExpr::Inner { predicate, .. } | JoinExpr::Left { predicate, .. } => Some(predicate),
            _ => None,
        }
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            JoinExpr::Cross { .. } => "CROSS JOIN",
            JoinExpr::CrossApply { .. } => "CROSS APPLY",
            JoinExpr::OuterApply { .. } => "OUTER APPLY",
            JoinExpr::Inner { .. } => "INNER JOIN",
            JoinExpr::Left { .. } => "LEFT JOIN",
        }
    }

    /// Same join kind over a different table and predicate.
    pub fn rebuild(&self, table: TableExpr, predicate: Option<SqlExpr>) -> JoinExpr {
        let table = Box::new(table);
        match (self, predicate) {
            (JoinExpr::Cross { .. }, _) => JoinExpr::Cross { table },
            (JoinExpr::CrossApply { .. }, _) => JoinExpr::CrossApply { table },
            (JoinExpr::OuterApply { .. }, _) => JoinExpr::OuterApply { table },
            (JoinExpr::Inner { predicate, .. }, p) => JoinExpr::Inner {
                table,
                predicate: p.unwrap_or_else(|| predicate.clone()),
            },
            (JoinExpr::Left { predicate, .. }, p) => JoinExpr::Left {
                table,
                predicate: p.unwrap_or_else(|| predicate.clone()),
            },
        }
    }
}

/// A source in a `FROM` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TableExpr {
    Table(TableRef),
    Derived(DerivedTable),
    SetOperation(SetOperationExpr),
    Join(JoinExpr),
}

impl TableExpr {
    /// Identity of the aliased source; joins report their joined table.
    pub fn id(&self) -> TableId {
        match self {
            TableExpr::Table(t) => t.id,
            TableExpr::Derived(d) => d.id,
            TableExpr::SetOperation(s) => s.id,
            TableExpr::Join(j) => j.table().id(),
        }
    }

    pub fn alias(&self) -> Option<&str> {
        match self {
            TableExpr::Table(t) => t.alias.as_deref(),
            TableExpr::Derived(d) => d.alias.as_deref(),
            TableExpr::SetOperation(s) => s.alias.as_deref(),
            TableExpr::Join(j) => j.table().alias(),
        }
    }

    /// Copy with a new alias on the aliased source (through joins).
    pub fn with_alias(&self, alias: Option<String>) -> TableExpr {
        match self {
            TableExpr::Table(t) => TableExpr::Table(TableRef { alias, ..t.clone() }),
            TableExpr::Derived(d) => TableExpr::Derived(DerivedTable { alias, ..d.clone() }),
            TableExpr::SetOperation(s) => {
                TableExpr::SetOperation(SetOperationExpr { alias, ..s.clone() })
            }
            TableExpr::Join(j) => TableExpr::Join(j.rebuild(j.table().with_alias(alias), None)),
        }
    }
}

impl From<TableRef> for TableExpr {
    fn from(table: TableRef) -> Self {
        TableExpr::Table(table)
    }
}

impl From<DerivedTable> for TableExpr {
    fn from(table: DerivedTable) -> Self {
        TableExpr::Derived(table)
    }
}

impl From<JoinExpr> for TableExpr {
    fn from(join: JoinExpr) -> Self {
        TableExpr::Join(join)
    }
}

/// A `SELECT` statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectExpr {
    pub projections: Vec<ProjectionExpr>,
    pub tables: Vec<TableExpr>,
    pub predicate: Option<SqlExpr>,
    pub group_by: Vec<SqlExpr>,
    pub having: Option<SqlExpr>,
    pub orderings: Vec<OrderingExpr>,
    pub limit: Option<SqlExpr>,
    pub offset: Option<SqlExpr>,
    pub distinct: bool,
}

impl SelectExpr {
    /// Select from a single table source.
    pub fn from_table(table: impl Into<TableExpr>) -> Self {
        Self {
            tables: vec![table.into()],
            ..Default::default()
        }
    }

    /// Add a projection and return the select (builder form).
    pub fn project(mut self, alias: impl Into<String>, expr: SqlExpr) -> Self {
        self.projections.push(ProjectionExpr {
            alias: alias.into(),
            expr,
        });
        self
    }

    /// AND a predicate onto the existing one.
    pub fn filter(mut self, predicate: SqlExpr) -> Self {
        self.apply_predicate(predicate);
        self
    }

    pub fn order_by(mut self, expr: SqlExpr, ascending: bool) -> Self {
        self.orderings.push(OrderingExpr { expr, ascending });
        self
    }

    pub fn join(mut self, join: JoinExpr) -> Self {
        self.tables.push(TableExpr::Join(join));
        self
    }

    pub fn with_limit(mut self, limit: SqlExpr) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: SqlExpr) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn with_group_by(mut self, keys: Vec<SqlExpr>) -> Self {
        self.group_by = keys;
        self
    }

    pub fn apply_predicate(&mut self, predicate: SqlExpr) {
        self.predicate = Some(match self.predicate.take() {
            Some(existing) => SqlExpr::and(existing, predicate),
            None => predicate,
        });
    }

    /// Index of a projection with exactly this expression.
    pub fn projection_index(&self, expr: &SqlExpr) -> Option<usize> {
        self.projections.iter().position(|p| &p.expr == expr)
    }

    /// Project `expr` unless it is already projected, returning its index.
    ///
    /// New projections get an alias derived from `alias_hint`, made unique
    /// (case-insensitively) by appending 0, 1, 2, ...
    pub fn add_projection(&mut self, expr: SqlExpr, alias_hint: &str) -> usize {
        if let Some(index) = self.projection_index(&expr) {
            return index;
        }
        let used: HashSet<String> =
            self.projections.iter().map(|p| p.alias.to_lowercase()).collect();
        let alias = unique_name(alias_hint, &used);
        self.projections.push(ProjectionExpr { alias, expr });
        self.projections.len() - 1
    }

    /// Append an ordering unless the same expression is already ordered on.
    pub fn append_ordering(&mut self, ordering: OrderingExpr) {
        if !self.orderings.iter().any(|o| o.expr == ordering.expr) {
            self.orderings.push(ordering);
        }
    }

    /// Modifiers after which appending join columns would change meaning.
    pub fn requires_pushdown(&self) -> bool {
        self.distinct || self.limit.is_some() || self.offset.is_some() || !self.group_by.is_empty()
    }

    /// Wrap this select into a derived table aliased `alias`.
    ///
    /// The returned outer select projects the same columns at the same indices.
    /// Orderings move to the outer select, except that the inner select keeps
    /// them too when it has a limit or offset. An ordering that is not
    /// projected gets a hidden projection, unless the select is distinct, in
    /// which case it only survives inside a limited inner select.
    pub fn push_down(self, alias: &str) -> SelectExpr {
        let mut inner = self;
        let visible = inner.projections.len();
        let keep_inner_orderings = inner.limit.is_some() || inner.offset.is_some();
        let orderings = std::mem::take(&mut inner.orderings);

        let mut outer_orderings = Vec::with_capacity(orderings.len());
        for ordering in &orderings {
            let index = match inner.projection_index(&ordering.expr) {
                Some(index) => index,
                None if inner.distinct => continue,
                None => inner.add_projection(ordering.expr.clone(), "c"),
            };
            outer_orderings.push((index, ordering.ascending));
        }
        if keep_inner_orderings {
            inner.orderings = orderings;
        }

        let derived = DerivedTable::new(alias, inner);
        let projections = (0..visible)
            .filter_map(|i| {
                derived.column_at(i).map(|column| ProjectionExpr {
                    alias: column.name.clone(),
                    expr: SqlExpr::Column(column),
                })
            })
            .collect();
        let orderings = outer_orderings
            .into_iter()
            .filter_map(|(i, ascending)| {
                derived.column_at(i).map(|column| OrderingExpr {
                    expr: SqlExpr::Column(column),
                    ascending,
                })
            })
            .collect();

        SelectExpr {
            projections,
            tables: vec![TableExpr::Derived(derived)],
            orderings,
            ..Default::default()
        }
    }

    /// Number of nested derived-table levels along the first table source.
    pub fn nesting_depth(&self) -> usize {
        match self.tables.first() {
            Some(TableExpr::Derived(d)) => 1 + d.select.nesting_depth(),
            _ => 0,
        }
    }
}

/// `hint` if unused, else `hint0`, `hint1`, ... Comparison is case-insensitive;
/// `used` holds lowercase names.
pub fn unique_name(hint: &str, used: &HashSet<String>) -> String {
    if !used.contains(&hint.to_lowercase()) {
        return hint.to_string();
    }
    let mut suffix = 0usize;
    loop {
        let candidate = format!("{hint}{suffix}");
        if !used.contains(&candidate.to_lowercase()) {
            return candidate;
        }
        suffix += 1;
    }
}
