//! Copy-on-write tree walking.
//!
//! Walk functions return [`Cow::Borrowed`] when nothing under a node changed,
//! so an unchanged tree comes back as the very same instance.

use std::borrow::Cow;

use relshape_ir::{
    BinaryExpr, ColumnExpr, ConditionalExpr, ExistsExpr, FunctionExpr, InExpr, InSource,
    KeyAccessExpr, LikeExpr, OrderingExpr, ProjectionExpr, RowNumberExpr, ScalarSubqueryExpr,
    SelectExpr, SetOperationExpr, SqlExpr, TableExpr, UnaryExpr,
};

/// Hooks for a structural rewrite. Every hook defaults to "no change".
pub trait ExprRewriter {
    /// Replacement for a column reference.
    fn rewrite_column(&mut self, _column: &ColumnExpr) -> Option<SqlExpr> {
        None
    }

    /// Replacement for a key access.
    fn rewrite_key_access(&mut self, _key: &KeyAccessExpr) -> Option<SqlExpr> {
        None
    }

    /// New alias for an aliased table source. Called before its children are walked.
    fn rewrite_table_alias(&mut self, _table: &TableExpr) -> Option<Option<String>> {
        None
    }
}

/// Collect a list of visited children; `None` when every child is unchanged.
pub(crate) fn changed_list<'a, T: Clone + 'a>(
    items: &'a [T],
    mut visit: impl FnMut(&'a T) -> Cow<'a, T>,
) -> Option<Vec<T>> {
    let visited: Vec<Cow<'a, T>> = items.iter().map(&mut visit).collect();
    if visited.iter().all(|c| matches!(c, Cow::Borrowed(_))) {
        None
    } else {
        Some(visited.into_iter().map(Cow::into_owned).collect())
    }
}

/// Visit an optional child; `None` when unchanged.
pub(crate) fn changed_opt<'a, T: Clone + 'a>(
    item: &'a Option<T>,
    visit: impl FnOnce(&'a T) -> Cow<'a, T>,
) -> Option<Option<T>> {
    match item.as_ref().map(visit) {
        Some(Cow::Owned(value)) => Some(Some(value)),
        _ => None,
    }
}

/// Visit a boxed child; `None` when unchanged.
pub(crate) fn changed_box<'a, T: Clone + 'a>(
    item: &'a T,
    visit: impl FnOnce(&'a T) -> Cow<'a, T>,
) -> Option<Box<T>> {
    match visit(item) {
        Cow::Owned(value) => Some(Box::new(value)),
        Cow::Borrowed(_) => None,
    }
}

/// Rebuild a select from optionally changed parts.
#[allow(clippy::too_many_arguments)]
pub(crate) fn rebuild_select<'a>(
    select: &'a SelectExpr,
    projections: Option<Vec<ProjectionExpr>>,
    tables: Option<Vec<TableExpr>>,
    predicate: Option<Option<SqlExpr>>,
    group_by: Option<Vec<SqlExpr>>,
    having: Option<Option<SqlExpr>>,
    orderings: Option<Vec<OrderingExpr>>,
    limit: Option<Option<SqlExpr>>,
    offset: Option<Option<SqlExpr>>,
) -> Cow<'a, SelectExpr> {
    if projections.is_none()
        && tables.is_none()
        && predicate.is_none()
        && group_by.is_none()
        && having.is_none()
        && orderings.is_none()
        && limit.is_none()
        && offset.is_none()
    {
        return Cow::Borrowed(select);
    }
    Cow::Owned(SelectExpr {
        projections: projections.unwrap_or_else(|| select.projections.clone()),
        tables: tables.unwrap_or_else(|| select.tables.clone()),
        predicate: predicate.unwrap_or_else(|| select.predicate.clone()),
        group_by: group_by.unwrap_or_else(|| select.group_by.clone()),
        having: having.unwrap_or_else(|| select.having.clone()),
        orderings: orderings.unwrap_or_else(|| select.orderings.clone()),
        limit: limit.unwrap_or_else(|| select.limit.clone()),
        offset: offset.unwrap_or_else(|| select.offset.clone()),
        distinct: select.distinct,
    })
}

pub(crate) fn projection_with<'a>(
    projection: &'a ProjectionExpr,
    expr: Cow<'a, SqlExpr>,
) -> Cow<'a, ProjectionExpr> {
    match expr {
        Cow::Borrowed(_) => Cow::Borrowed(projection),
        Cow::Owned(expr) => Cow::Owned(ProjectionExpr {
            alias: projection.alias.clone(),
            expr,
        }),
    }
}

pub(crate) fn ordering_with<'a>(
    ordering: &'a OrderingExpr,
    expr: Cow<'a, SqlExpr>,
) -> Cow<'a, OrderingExpr> {
    match expr {
        Cow::Borrowed(_) => Cow::Borrowed(ordering),
        Cow::Owned(expr) => Cow::Owned(OrderingExpr {
            expr,
            ascending: ordering.ascending,
        }),
    }
}

/// Walk a select: projections, tables, predicate, group by, having, orderings, limit, offset.
pub fn walk_select<'a, R: ExprRewriter + ?Sized>(
    r: &mut R,
    select: &'a SelectExpr,
) -> Cow<'a, SelectExpr> {
    let projections = changed_list(&select.projections, |p| {
        projection_with(p, walk_expr(r, &p.expr))
    });
    let tables = changed_list(&select.tables, |t| walk_table(r, t));
    let predicate = changed_opt(&select.predicate, |e| walk_expr(r, e));
    let group_by = changed_list(&select.group_by, |e| walk_expr(r, e));
    let having = changed_opt(&select.having, |e| walk_expr(r, e));
    let orderings = changed_list(&select.orderings, |o| ordering_with(o, walk_expr(r, &o.expr)));
    let limit = changed_opt(&select.limit, |e| walk_expr(r, e));
    let offset = changed_opt(&select.offset, |e| walk_expr(r, e));
    rebuild_select(
        select,
        projections,
        tables,
        predicate,
        group_by,
        having,
        orderings,
        limit,
        offset,
    )
}

/// Walk a table source; the alias hook runs before children.
pub fn walk_table<'a, R: ExprRewriter + ?Sized>(
    r: &mut R,
    table: &'a TableExpr,
) -> Cow<'a, TableExpr> {
    if let TableExpr::Join(join) = table {
        let inner = walk_table(r, join.table());
        let predicate = join.predicate().map(|p| walk_expr(r, p));
        let predicate_changed = matches!(predicate, Some(Cow::Owned(_)));
        if matches!(inner, Cow::Borrowed(_)) && !predicate_changed {
            return Cow::Borrowed(table);
        }
        let predicate = predicate.map(Cow::into_owned);
        return Cow::Owned(TableExpr::Join(join.rebuild(inner.into_owned(), predicate)));
    }

    let alias = r.rewrite_table_alias(table);
    let children: Option<TableExpr> = match table {
        TableExpr::Table(_) | TableExpr::Join(_) => None,
        TableExpr::Derived(d) => {
            changed_box(d.select.as_ref(), |s| walk_select(r, s)).map(|select| {
                TableExpr::Derived(relshape_ir::DerivedTable {
                    id: d.id,
                    alias: d.alias.clone(),
                    select,
                })
            })
        }
        TableExpr::SetOperation(s) => {
            let left = changed_box(s.left.as_ref(), |x| walk_select(r, x));
            let right = changed_box(s.right.as_ref(), |x| walk_select(r, x));
            if left.is_none() && right.is_none() {
                None
            } else {
                Some(TableExpr::SetOperation(SetOperationExpr {
                    left: left.unwrap_or_else(|| s.left.clone()),
                    right: right.unwrap_or_else(|| s.right.clone()),
                    ..s.clone()
                }))
            }
        }
    };

    match (alias, children) {
        (None, None) => Cow::Borrowed(table),
        (None, Some(rebuilt)) => Cow::Owned(rebuilt),
        (Some(alias), rebuilt) => {
            Cow::Owned(rebuilt.unwrap_or_else(|| table.clone()).with_alias(alias))
        }
    }
}

/// Walk a scalar expression.
pub fn walk_expr<'a, R: ExprRewriter + ?Sized>(r: &mut R, expr: &'a SqlExpr) -> Cow<'a, SqlExpr> {
    match expr {
        SqlExpr::Column(c) => r.rewrite_column(c).map_or(Cow::Borrowed(expr), Cow::Owned),
        SqlExpr::KeyAccess(k) => r.rewrite_key_access(k).map_or(Cow::Borrowed(expr), Cow::Owned),
        SqlExpr::Constant(_) | SqlExpr::Parameter(_) => Cow::Borrowed(expr),
        SqlExpr::Binary(b) => {
            let left = changed_box(b.left.as_ref(), |e| walk_expr(r, e));
            let right = changed_box(b.right.as_ref(), |e| walk_expr(r, e));
            rebuild_binary(expr, b, left, right)
        }
        SqlExpr::Unary(u) => match changed_box(u.operand.as_ref(), |e| walk_expr(r, e)) {
            Some(operand) => Cow::Owned(SqlExpr::Unary(UnaryExpr { op: u.op, operand })),
            None => Cow::Borrowed(expr),
        },
        SqlExpr::Conditional(c) => {
            let test = changed_box(c.test.as_ref(), |e| walk_expr(r, e));
            let if_true = changed_box(c.if_true.as_ref(), |e| walk_expr(r, e));
            let if_false = changed_box(c.if_false.as_ref(), |e| walk_expr(r, e));
            rebuild_conditional(expr, c, test, if_true, if_false)
        }
        SqlExpr::Function(f) => {
            let instance = f
                .instance
                .as_ref()
                .and_then(|i| changed_box(i.as_ref(), |e| walk_expr(r, e)));
            let arguments = changed_list(&f.arguments, |e| walk_expr(r, e));
            rebuild_function(expr, f, instance, arguments)
        }
        SqlExpr::In(i) => {
            let item = changed_box(i.item.as_ref(), |e| walk_expr(r, e));
            let source = match &i.source {
                InSource::Values(values) => {
                    changed_list(values, |e| walk_expr(r, e)).map(InSource::Values)
                }
                InSource::Subquery(s) => {
                    changed_box(s.as_ref(), |s| walk_select(r, s)).map(InSource::Subquery)
                }
            };
            rebuild_in(expr, i, item, source)
        }
        SqlExpr::Exists(e) => match changed_box(e.subquery.as_ref(), |s| walk_select(r, s)) {
            Some(subquery) => Cow::Owned(SqlExpr::Exists(ExistsExpr {
                subquery,
                negated: e.negated,
            })),
            None => Cow::Borrowed(expr),
        },
        SqlExpr::Like(l) => {
            let match_expr = changed_box(l.match_expr.as_ref(), |e| walk_expr(r, e));
            let pattern = changed_box(l.pattern.as_ref(), |e| walk_expr(r, e));
            let escape = l
                .escape
                .as_ref()
                .and_then(|x| changed_box(x.as_ref(), |e| walk_expr(r, e)));
            rebuild_like(expr, l, match_expr, pattern, escape)
        }
        SqlExpr::ScalarSubquery(s) => {
            match changed_box(s.subquery.as_ref(), |q| walk_select(r, q)) {
                Some(subquery) => {
                    Cow::Owned(SqlExpr::ScalarSubquery(ScalarSubqueryExpr { subquery }))
                }
                None => Cow::Borrowed(expr),
            }
        }
        SqlExpr::RowNumber(n) => {
            let partitions = changed_list(&n.partitions, |e| walk_expr(r, e));
            let orderings = changed_list(&n.orderings, |o| ordering_with(o, walk_expr(r, &o.expr)));
            rebuild_row_number(expr, n, partitions, orderings)
        }
    }
}

pub(crate) fn rebuild_binary<'a>(
    expr: &'a SqlExpr,
    b: &BinaryExpr,
    left: Option<Box<SqlExpr>>,
    right: Option<Box<SqlExpr>>,
) -> Cow<'a, SqlExpr> {
    if left.is_none() && right.is_none() {
        return Cow::Borrowed(expr);
    }
    Cow::Owned(SqlExpr::Binary(BinaryExpr {
        op: b.op,
        left: left.unwrap_or_else(|| b.left.clone()),
        right: right.unwrap_or_else(|| b.right.clone()),
    }))
}

pub(crate) fn rebuild_conditional<'a>(
    expr: &'a SqlExpr,
    c: &ConditionalExpr,
    test: Option<Box<SqlExpr>>,
    if_true: Option<Box<SqlExpr>>,
    if_false: Option<Box<SqlExpr>>,
) -> Cow<'a, SqlExpr> {
    if test.is_none() && if_true.is_none() && if_false.is_none() {
        return Cow::Borrowed(expr);
    }
    Cow::Owned(SqlExpr::Conditional(ConditionalExpr {
        test: test.unwrap_or_else(|| c.test.clone()),
        if_true: if_true.unwrap_or_else(|| c.if_true.clone()),
        if_false: if_false.unwrap_or_else(|| c.if_false.clone()),
    }))
}

pub(crate) fn rebuild_function<'a>(
    expr: &'a SqlExpr,
    f: &FunctionExpr,
    instance: Option<Box<SqlExpr>>,
    arguments: Option<Vec<SqlExpr>>,
) -> Cow<'a, SqlExpr> {
    if instance.is_none() && arguments.is_none() {
        return Cow::Borrowed(expr);
    }
    Cow::Owned(SqlExpr::Function(FunctionExpr {
        name: f.name.clone(),
        niladic: f.niladic,
        instance: instance.or_else(|| f.instance.clone()),
        arguments: arguments.unwrap_or_else(|| f.arguments.clone()),
        type_mapping: f.type_mapping.clone(),
    }))
}

pub(crate) fn rebuild_in<'a>(
    expr: &'a SqlExpr,
    i: &InExpr,
    item: Option<Box<SqlExpr>>,
    source: Option<InSource>,
) -> Cow<'a, SqlExpr> {
    if item.is_none() && source.is_none() {
        return Cow::Borrowed(expr);
    }
    Cow::Owned(SqlExpr::In(InExpr {
        item: item.unwrap_or_else(|| i.item.clone()),
        source: source.unwrap_or_else(|| i.source.clone()),
        negated: i.negated,
    }))
}

pub(crate) fn rebuild_like<'a>(
    expr: &'a SqlExpr,
    l: &LikeExpr,
    match_expr: Option<Box<SqlExpr>>,
    pattern: Option<Box<SqlExpr>>,
    escape: Option<Box<SqlExpr>>,
) -> Cow<'a, SqlExpr> {
    if match_expr.is_none() && pattern.is_none() && escape.is_none() {
        return Cow::Borrowed(expr);
    }
    Cow::Owned(SqlExpr::Like(LikeExpr {
        match_expr: match_expr.unwrap_or_else(|| l.match_expr.clone()),
        pattern: pattern.unwrap_or_else(|| l.pattern.clone()),
        escape: escape.or_else(|| l.escape.clone()),
    }))
}

pub(crate) fn rebuild_row_number<'a>(
    expr: &'a SqlExpr,
    n: &RowNumberExpr,
    partitions: Option<Vec<SqlExpr>>,
    orderings: Option<Vec<OrderingExpr>>,
) -> Cow<'a, SqlExpr> {
    if partitions.is_none() && orderings.is_none() {
        return Cow::Borrowed(expr);
    }
    Cow::Owned(SqlExpr::RowNumber(RowNumberExpr {
        partitions: partitions.unwrap_or_else(|| n.partitions.clone()),
        orderings: orderings.unwrap_or_else(|| n.orderings.clone()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use relshape_ir::TableRef;

    struct Noop;
    impl ExprRewriter for Noop {}

    struct RenameColumn;
    impl ExprRewriter for RenameColumn {
        fn rewrite_column(&mut self, column: &ColumnExpr) -> Option<SqlExpr> {
            (column.name == "A").then(|| {
                SqlExpr::Column(ColumnExpr {
                    name: "B".into(),
                    ..column.clone()
                })
            })
        }
    }

    fn sample() -> SelectExpr {
        let t = TableRef::new("T", "t");
        SelectExpr::from_table(t.clone())
            .project("A", t.column("A", None, false))
            .project("C", t.column("C", None, false))
            .filter(SqlExpr::equal(t.column("C", None, false), SqlExpr::constant(1)))
    }

    #[test]
    fn test_noop_walk_borrows() {
        let select = sample();
        let walked = walk_select(&mut Noop, &select);
        assert!(matches!(walked, Cow::Borrowed(s) if std::ptr::eq(s, &select)));
    }

    #[test]
    fn test_rewrite_only_touched_parts() {
        let select = sample();
        let walked = walk_select(&mut RenameColumn, &select).into_owned();
        assert_eq!(walked.projections[0].expr.to_string(), "t.B");
        assert_eq!(walked.projections[1], select.projections[1]);
        assert_eq!(walked.predicate, select.predicate);
    }
}
