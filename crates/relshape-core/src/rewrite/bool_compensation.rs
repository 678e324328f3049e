//! Boolean compensation for value-converted boolean columns.
//!
//! A boolean stored through a converter (e.g. as `'Y'`/`'N'`) is not a truth
//! value to the store, so a bare reference in predicate position is rewritten
//! to `column = TRUE`. The constant carries the column's mapping so it is
//! converted to the stored representation as well.

use std::borrow::Cow;

use relshape_ir::{
    ExistsExpr, InSource, OrderingExpr, ScalarSubqueryExpr, SelectExpr, SetOperationExpr,
    ShapedQuery, SqlExpr, TableExpr, TypeMapping, UnaryExpr, UnaryOp,
};

use super::visit::{
    changed_box, changed_list, changed_opt, ordering_with, projection_with, rebuild_binary,
    rebuild_conditional, rebuild_function, rebuild_in, rebuild_like, rebuild_row_number,
    rebuild_select,
};

/// Context threaded by value through the traversal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Flags {
    /// The subtree is used as a truth value.
    in_predicate: bool,
    /// The subtree is an operand of `=` or `<>`.
    in_bool_comparison: bool,
}

impl Flags {
    const CLEARED: Flags = Flags {
        in_predicate: false,
        in_bool_comparison: false,
    };

    const PREDICATE: Flags = Flags {
        in_predicate: true,
        in_bool_comparison: false,
    };
}

/// Rewrites converted boolean column references in predicate position.
#[derive(Debug, Default, Clone, Copy)]
pub struct BoolCompensator;

impl BoolCompensator {
    /// Create a new compensator.
    pub fn new() -> Self {
        Self
    }

    /// Compensate the query half of a shaped query.
    pub fn compensate(&self, shaped: ShapedQuery) -> ShapedQuery {
        let rewritten = match self.visit_select(&shaped.query) {
            Cow::Owned(query) => Some(query),
            Cow::Borrowed(_) => None,
        };
        match rewritten {
            Some(query) => shaped.with_query(query),
            None => shaped,
        }
    }

    /// Visit a select. Returns the same instance when nothing needed rewriting.
    pub fn visit_select<'a>(&self, select: &'a SelectExpr) -> Cow<'a, SelectExpr> {
        let projections = changed_list(&select.projections, |p| {
            projection_with(p, self.visit_expr(&p.expr, Flags::CLEARED))
        });
        let tables = changed_list(&select.tables, |t| self.visit_table(t));
        let predicate = changed_opt(&select.predicate, |e| self.visit_expr(e, Flags::PREDICATE));
        let group_by = changed_list(&select.group_by, |e| self.visit_expr(e, Flags::CLEARED));
        let having = changed_opt(&select.having, |e| self.visit_expr(e, Flags::PREDICATE));
        let orderings = changed_list(&select.orderings, |o| self.visit_ordering(o));
        let limit = changed_opt(&select.limit, |e| self.visit_expr(e, Flags::CLEARED));
        let offset = changed_opt(&select.offset, |e| self.visit_expr(e, Flags::CLEARED));
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

    fn visit_ordering<'a>(&self, ordering: &'a OrderingExpr) -> Cow<'a, OrderingExpr> {
        ordering_with(ordering, self.visit_expr(&ordering.expr, Flags::CLEARED))
    }

    fn visit_table<'a>(&self, table: &'a TableExpr) -> Cow<'a, TableExpr> {
        match table {
            TableExpr::Table(_) => Cow::Borrowed(table),
            TableExpr::Derived(d) => match self.visit_select(&d.select) {
                Cow::Borrowed(_) => Cow::Borrowed(table),
                Cow::Owned(select) => Cow::Owned(TableExpr::Derived(relshape_ir::DerivedTable {
                    id: d.id,
                    alias: d.alias.clone(),
                    select: Box::new(select),
                })),
            },
            TableExpr::SetOperation(s) => {
                let left = changed_box(s.left.as_ref(), |x| self.visit_select(x));
                let right = changed_box(s.right.as_ref(), |x| self.visit_select(x));
                if left.is_none() && right.is_none() {
                    return Cow::Borrowed(table);
                }
                Cow::Owned(TableExpr::SetOperation(SetOperationExpr {
                    left: left.unwrap_or_else(|| s.left.clone()),
                    right: right.unwrap_or_else(|| s.right.clone()),
                    ..s.clone()
                }))
            }
            TableExpr::Join(join) => {
                let inner = self.visit_table(join.table());
                let predicate = join.predicate().map(|p| self.visit_expr(p, Flags::PREDICATE));
                if matches!(inner, Cow::Borrowed(_)) && !matches!(predicate, Some(Cow::Owned(_))) {
                    return Cow::Borrowed(table);
                }
                Cow::Owned(TableExpr::Join(
                    join.rebuild(inner.into_owned(), predicate.map(Cow::into_owned)),
                ))
            }
        }
    }

    fn visit_expr<'a>(&self, expr: &'a SqlExpr, flags: Flags) -> Cow<'a, SqlExpr> {
        match expr {
            SqlExpr::Column(c) => self.compensate_reference(expr, c.type_mapping.as_ref(), flags),
            SqlExpr::KeyAccess(k) => {
                self.compensate_reference(expr, k.type_mapping.as_ref(), flags)
            }
            SqlExpr::Constant(_) | SqlExpr::Parameter(_) => Cow::Borrowed(expr),
            SqlExpr::Binary(b) => {
                let operands = Flags {
                    in_predicate: flags.in_predicate,
                    in_bool_comparison: b.op.is_equality(),
                };
                let left = changed_box(b.left.as_ref(), |e| self.visit_expr(e, operands));
                let right = changed_box(b.right.as_ref(), |e| self.visit_expr(e, operands));
                rebuild_binary(expr, b, left, right)
            }
            SqlExpr::Unary(u) => {
                let operand_flags = match u.op {
                    UnaryOp::Not => Flags {
                        in_predicate: flags.in_predicate,
                        in_bool_comparison: false,
                    },
                    _ => Flags::CLEARED,
                };
                match changed_box(u.operand.as_ref(), |e| self.visit_expr(e, operand_flags)) {
                    Some(operand) => Cow::Owned(SqlExpr::Unary(UnaryExpr { op: u.op, operand })),
                    None => Cow::Borrowed(expr),
                }
            }
            SqlExpr::Conditional(c) => {
                let test = changed_box(c.test.as_ref(), |e| self.visit_expr(e, Flags::PREDICATE));
                let if_true =
                    changed_box(c.if_true.as_ref(), |e| self.visit_expr(e, Flags::CLEARED));
                let if_false =
                    changed_box(c.if_false.as_ref(), |e| self.visit_expr(e, Flags::CLEARED));
                rebuild_conditional(expr, c, test, if_true, if_false)
            }
            SqlExpr::Function(f) => {
                let instance = f
                    .instance
                    .as_ref()
                    .and_then(|i| changed_box(i.as_ref(), |e| self.visit_expr(e, Flags::CLEARED)));
                let arguments = changed_list(&f.arguments, |e| self.visit_expr(e, Flags::CLEARED));
                rebuild_function(expr, f, instance, arguments)
            }
            SqlExpr::In(i) => {
                let item = changed_box(i.item.as_ref(), |e| self.visit_expr(e, Flags::CLEARED));
                let source = match &i.source {
                    InSource::Values(values) => {
                        changed_list(values, |e| self.visit_expr(e, Flags::CLEARED))
                            .map(InSource::Values)
                    }
                    InSource::Subquery(s) => {
                        changed_box(s.as_ref(), |q| self.visit_select(q)).map(InSource::Subquery)
                    }
                };
                rebuild_in(expr, i, item, source)
            }
            SqlExpr::Exists(e) => match changed_box(e.subquery.as_ref(), |q| self.visit_select(q)) {
                Some(subquery) => Cow::Owned(SqlExpr::Exists(ExistsExpr {
                    subquery,
                    negated: e.negated,
                })),
                None => Cow::Borrowed(expr),
            },
            SqlExpr::Like(l) => {
                let match_expr =
                    changed_box(l.match_expr.as_ref(), |e| self.visit_expr(e, Flags::CLEARED));
                let pattern =
                    changed_box(l.pattern.as_ref(), |e| self.visit_expr(e, Flags::CLEARED));
                let escape = l
                    .escape
                    .as_ref()
                    .and_then(|x| changed_box(x.as_ref(), |e| self.visit_expr(e, Flags::CLEARED)));
                rebuild_like(expr, l, match_expr, pattern, escape)
            }
            SqlExpr::ScalarSubquery(s) => {
                match changed_box(s.subquery.as_ref(), |q| self.visit_select(q)) {
                    Some(subquery) => {
                        Cow::Owned(SqlExpr::ScalarSubquery(ScalarSubqueryExpr { subquery }))
                    }
                    None => Cow::Borrowed(expr),
                }
            }
            SqlExpr::RowNumber(n) => {
                let partitions =
                    changed_list(&n.partitions, |e| self.visit_expr(e, Flags::CLEARED));
                let orderings = changed_list(&n.orderings, |o| self.visit_ordering(o));
                rebuild_row_number(expr, n, partitions, orderings)
            }
        }
    }

    fn compensate_reference<'a>(
        &self,
        expr: &'a SqlExpr,
        type_mapping: Option<&TypeMapping>,
        flags: Flags,
    ) -> Cow<'a, SqlExpr> {
        match type_mapping {
            Some(mapping)
                if flags.in_predicate
                    && !flags.in_bool_comparison
                    && mapping.is_converted_bool() =>
            {
                Cow::Owned(SqlExpr::equal(
                    expr.clone(),
                    SqlExpr::typed_constant(true, Some(mapping.clone())),
                ))
            }
            _ => Cow::Borrowed(expr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use relshape_ir::{DerivedTable, InExpr, JoinExpr, SetOperationKind, TableRef, ValueConverter};

    fn yes_no() -> Option<TypeMapping> {
        Some(TypeMapping::converted("char(1)", ValueConverter::yes_no()))
    }

    fn users() -> TableRef {
        TableRef::new("Users", "u")
    }

    #[test]
    fn test_bare_converted_bool_in_predicate_is_compared_to_true() {
        let u = users();
        let select = SelectExpr::from_table(u.clone())
            .project("Id", u.column("Id", None, false))
            .filter(u.column("IsActive", yes_no(), false));

        let rewritten = BoolCompensator::new().visit_select(&select).into_owned();
        assert_eq!(
            rewritten.predicate.as_ref().map(|p| p.to_string()).as_deref(),
            Some("u.IsActive = TRUE")
        );
        let Some(SqlExpr::Binary(b)) = &rewritten.predicate else {
            panic!("expected comparison");
        };
        assert_eq!(b.right.type_mapping(), yes_no().as_ref());
    }

    #[test]
    fn test_explicit_comparison_is_left_alone_and_pass_is_idempotent() {
        let u = users();
        let select =
            SelectExpr::from_table(u.clone()).filter(u.column("IsActive", yes_no(), false));

        let once = BoolCompensator::new().visit_select(&select).into_owned();
        let twice = BoolCompensator::new().visit_select(&once);
        assert!(matches!(twice, Cow::Borrowed(s) if std::ptr::eq(s, &once)));
        assert_eq!(twice.into_owned(), once);
    }

    #[test]
    fn test_projection_and_plain_bools_untouched() {
        let u = users();
        let native = Some(TypeMapping::new("bit", relshape_ir::DomainType::Bool));
        let select = SelectExpr::from_table(u.clone())
            .project("IsActive", u.column("IsActive", yes_no(), false))
            .filter(u.column("IsAdmin", native, false));

        let result = BoolCompensator::new().visit_select(&select);
        assert!(matches!(result, Cow::Borrowed(_)));
    }

    #[test]
    fn test_logical_operands_and_not_are_compensated() {
        let u = users();
        let select = SelectExpr::from_table(u.clone()).filter(SqlExpr::and(
            SqlExpr::not(u.column("IsActive", yes_no(), false)),
            SqlExpr::equal(u.column("Age", None, false), SqlExpr::constant(3)),
        ));

        let rewritten = BoolCompensator::new().visit_select(&select).into_owned();
        assert_eq!(
            rewritten.predicate.unwrap().to_string(),
            "NOT (u.IsActive = TRUE) AND (u.Age = 3)"
        );
    }

    #[test]
    fn test_conditional_test_is_predicate_but_branches_are_not() {
        let u = users();
        let case = SqlExpr::conditional(
            u.column("IsActive", yes_no(), false),
            u.column("IsAdmin", yes_no(), false),
            SqlExpr::constant(false),
        );
        let select = SelectExpr::from_table(u.clone()).project("Flag", case);

        let rewritten = BoolCompensator::new().visit_select(&select).into_owned();
        assert_eq!(
            rewritten.projections[0].expr.to_string(),
            "CASE WHEN u.IsActive = TRUE THEN u.IsAdmin ELSE FALSE END"
        );
    }

    #[test]
    fn test_join_predicate_and_subquery_are_visited() {
        let u = users();
        let o = TableRef::new("Orders", "o");
        let inner = SelectExpr::from_table(o.clone()).filter(o.column("Shipped", yes_no(), false));
        let select = SelectExpr::from_table(u.clone())
            .join(JoinExpr::Inner {
                table: Box::new(o.clone().into()),
                predicate: o.column("Paid", yes_no(), false),
            })
            .filter(SqlExpr::exists(inner))
            .project(
                "Flag",
                SqlExpr::function("COALESCE", vec![u.column("IsActive", yes_no(), true)]),
            );

        let text = BoolCompensator::new().visit_select(&select).into_owned().to_string();
        assert!(text.contains("ON o.Paid = TRUE"));
        assert!(text.contains("WHERE o.Shipped = TRUE"));
        assert!(text.contains("COALESCE(u.IsActive)"));
    }

    #[test]
    fn test_apply_joins_and_in_subquery_reset_flags() {
        let u = users();
        let s = TableRef::new("Sessions", "s");
        let a = TableRef::new("Audits", "a");
        let r = TableRef::new("Roles", "r");
        let sessions = SelectExpr::from_table(s.clone())
            .project("Open", s.column("Open", yes_no(), false))
            .filter(s.column("Open", yes_no(), false));
        let audits =
            SelectExpr::from_table(a.clone()).project("Seen", a.column("Seen", yes_no(), false));
        let roles = SelectExpr::from_table(r.clone())
            .project("Enabled", r.column("Enabled", yes_no(), false))
            .filter(r.column("Enabled", yes_no(), false));

        let select = SelectExpr::from_table(u.clone())
            .join(JoinExpr::Cross {
                table: Box::new(TableRef::new("Tags", "g").into()),
            })
            .join(JoinExpr::CrossApply {
                table: Box::new(DerivedTable::new("sx", sessions).into()),
            })
            .join(JoinExpr::OuterApply {
                table: Box::new(DerivedTable::new("ax", audits).into()),
            })
            .filter(SqlExpr::In(InExpr {
                item: Box::new(u.column("IsActive", yes_no(), false)),
                source: InSource::Subquery(Box::new(roles)),
                negated: false,
            }));

        let text = BoolCompensator::new().visit_select(&select).into_owned().to_string();
        assert!(text.contains("CROSS JOIN Tags AS g"), "{text}");
        // predicates inside applied selects are forced
        assert!(text.contains("FROM Sessions AS s WHERE s.Open = TRUE"), "{text}");
        assert!(
            text.contains("r.Enabled AS Enabled FROM Roles AS r WHERE r.Enabled = TRUE"),
            "{text}"
        );
        // projections and the IN item are not truth values
        assert!(text.contains("SELECT s.Open AS Open"), "{text}");
        assert!(text.contains("SELECT a.Seen AS Seen FROM Audits AS a)"), "{text}");
        assert!(text.contains("WHERE u.IsActive IN (SELECT"), "{text}");
    }

    #[test]
    fn test_set_operation_arms_are_visited_separately() {
        let u = users();
        let a = TableRef::new("Admins", "a");
        let left = SelectExpr::from_table(u.clone())
            .project("Flag", u.column("IsActive", yes_no(), false))
            .filter(u.column("IsActive", yes_no(), false));
        let right = SelectExpr::from_table(a.clone())
            .project("Flag", a.column("IsActive", yes_no(), false));
        let union = SetOperationExpr::new("x", SetOperationKind::Union, true, left, right);
        let select = SelectExpr {
            tables: vec![TableExpr::SetOperation(union)],
            ..Default::default()
        };

        let TableExpr::SetOperation(original) = &select.tables[0] else {
            panic!("expected set operation");
        };
        let rewritten = BoolCompensator::new().visit_select(&select).into_owned();
        let TableExpr::SetOperation(arms) = &rewritten.tables[0] else {
            panic!("expected set operation");
        };
        assert_eq!(
            arms.left.predicate.as_ref().map(|p| p.to_string()).as_deref(),
            Some("u.IsActive = TRUE")
        );
        assert_eq!(arms.left.projections[0].expr.to_string(), "u.IsActive");
        assert_eq!(arms.right, original.right);
        assert_eq!(arms.id, original.id);
    }
}
