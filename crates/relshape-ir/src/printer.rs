//! Deterministic SQL-like rendering of expression trees.
//!
//! Output is stable for a given tree so it can serve as command text for the
//! in-memory provider, as a cache/log fingerprint input, and in test assertions.

use std::fmt::{self, Write};

use crate::expr::{InSource, SqlExpr, UnaryOp};
use crate::select::{OrderingExpr, SelectExpr, TableExpr};

/// Renders [`SelectExpr`] and [`SqlExpr`] trees as text.
#[derive(Debug, Default)]
pub struct ExpressionPrinter {
    out: String,
}

impl ExpressionPrinter {
    /// Create a new printer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Render a select statement.
    pub fn print_select(select: &SelectExpr) -> String {
        let mut printer = Self::new();
        // writing to a String cannot fail
        let _ = printer.select(select);
        printer.out
    }

    /// Render a scalar expression.
    pub fn print_expr(expr: &SqlExpr) -> String {
        let mut printer = Self::new();
        let _ = printer.expr(expr);
        printer.out
    }

    fn select(&mut self, select: &SelectExpr) -> fmt::Result {
        self.out.push_str("SELECT ");
        if select.distinct {
            self.out.push_str("DISTINCT ");
        }
        if select.projections.is_empty() {
            self.out.push('1');
        }
        for (i, projection) in select.projections.iter().enumerate() {
            if i > 0 {
                self.out.push_str(", ");
            }
            self.expr(&projection.expr)?;
            write!(self.out, " AS {}", projection.alias)?;
        }

        let mut first_source = true;
        for table in &select.tables {
            match table {
                TableExpr::Join(join) => {
                    write!(self.out, " {} ", join.keyword())?;
                    self.table(join.table())?;
                    if let Some(predicate) = join.predicate() {
                        self.out.push_str(" ON ");
                        self.expr(predicate)?;
                    }
                }
                other => {
                    self.out.push_str(if first_source { " FROM " } else { ", " });
                    self.table(other)?;
                }
            }
            first_source = false;
        }

        if let Some(predicate) = &select.predicate {
            self.out.push_str(" WHERE ");
            self.expr(predicate)?;
        }
        if !select.group_by.is_empty() {
            self.out.push_str(" GROUP BY ");
            self.list(&select.group_by)?;
        }
        if let Some(having) = &select.having {
            self.out.push_str(" HAVING ");
            self.expr(having)?;
        }
        if !select.orderings.is_empty() {
            self.out.push_str(" ORDER BY ");
            self.orderings(&select.orderings)?;
        }
        if let Some(limit) = &select.limit {
            self.out.push_str(" LIMIT ");
            self.expr(limit)?;
        }
        if let Some(offset) = &select.offset {
            self.out.push_str(" OFFSET ");
            self.expr(offset)?;
        }
        Ok(())
    }

    fn table(&mut self, table: &TableExpr) -> fmt::Result {
        match table {
            TableExpr::Table(t) => {
                if let Some(schema) = &t.schema {
                    write!(self.out, "{schema}.")?;
                }
                self.out.push_str(&t.name);
                self.alias(t.alias.as_deref())
            }
            TableExpr::Derived(d) => {
                self.out.push('(');
                self.select(&d.select)?;
                self.out.push(')');
                self.alias(d.alias.as_deref())
            }
            TableExpr::SetOperation(s) => {
                self.out.push('(');
                self.select(&s.left)?;
                write!(self.out, " {}{} ", s.kind.keyword(), if s.distinct { "" } else { " ALL" })?;
                self.select(&s.right)?;
                self.out.push(')');
                self.alias(s.alias.as_deref())
            }
            TableExpr::Join(j) => self.table(j.table()),
        }
    }

    fn alias(&mut self, alias: Option<&str>) -> fmt::Result {
        match alias {
            Some(alias) => write!(self.out, " AS {alias}"),
            None => Ok(()),
        }
    }

    fn list(&mut self, exprs: &[SqlExpr]) -> fmt::Result {
        for (i, expr) in exprs.iter().enumerate() {
            if i > 0 {
                self.out.push_str(", ");
            }
            self.expr(expr)?;
        }
        Ok(())
    }

    fn orderings(&mut self, orderings: &[OrderingExpr]) -> fmt::Result {
        for (i, ordering) in orderings.iter().enumerate() {
            if i > 0 {
                self.out.push_str(", ");
            }
            self.expr(&ordering.expr)?;
            self.out.push_str(if ordering.ascending { " ASC" } else { " DESC" });
        }
        Ok(())
    }

    fn operand(&mut self, expr: &SqlExpr) -> fmt::Result {
        if matches!(expr, SqlExpr::Binary(_)) {
            self.out.push('(');
            self.expr(expr)?;
            self.out.push(')');
            Ok(())
        } else {
            self.expr(expr)
        }
    }

    fn expr(&mut self, expr: &SqlExpr) -> fmt::Result {
        match expr {
            SqlExpr::Column(c) => match &c.table_alias {
                Some(alias) => write!(self.out, "{alias}.{}", c.name),
                None => write!(self.out, "{}", c.name),
            },
            SqlExpr::KeyAccess(k) => match &k.table_alias {
                Some(alias) => write!(self.out, "{alias}[\"{}\"]", k.key),
                None => write!(self.out, "[\"{}\"]", k.key),
            },
            SqlExpr::Constant(c) => write!(self.out, "{}", c.value),
            SqlExpr::Parameter(p) => write!(self.out, "@{}", p.name),
            SqlExpr::Binary(b) => {
                self.operand(&b.left)?;
                write!(self.out, " {} ", b.op.symbol())?;
                self.operand(&b.right)
            }
            SqlExpr::Unary(u) => match u.op {
                UnaryOp::Not => {
                    self.out.push_str("NOT ");
                    self.operand(&u.operand)
                }
                UnaryOp::Negate => {
                    self.out.push('-');
                    self.operand(&u.operand)
                }
                UnaryOp::IsNull => {
                    self.operand(&u.operand)?;
                    self.out.push_str(" IS NULL");
                    Ok(())
                }
                UnaryOp::IsNotNull => {
                    self.operand(&u.operand)?;
                    self.out.push_str(" IS NOT NULL");
                    Ok(())
                }
            },
            SqlExpr::Conditional(c) => {
                self.out.push_str("CASE WHEN ");
                self.expr(&c.test)?;
                self.out.push_str(" THEN ");
                self.expr(&c.if_true)?;
                self.out.push_str(" ELSE ");
                self.expr(&c.if_false)?;
                self.out.push_str(" END");
                Ok(())
            }
            SqlExpr::Function(f) => {
                if let Some(instance) = &f.instance {
                    self.operand(instance)?;
                    self.out.push('.');
                }
                self.out.push_str(&f.name);
                if !f.niladic {
                    self.out.push('(');
                    self.list(&f.arguments)?;
                    self.out.push(')');
                }
                Ok(())
            }
            SqlExpr::In(i) => {
                self.operand(&i.item)?;
                self.out.push_str(if i.negated { " NOT IN (" } else { " IN (" });
                match &i.source {
                    InSource::Values(values) => self.list(values)?,
                    InSource::Subquery(subquery) => self.select(subquery)?,
                }
                self.out.push(')');
                Ok(())
            }
            SqlExpr::Exists(e) => {
                self.out.push_str(if e.negated { "NOT EXISTS (" } else { "EXISTS (" });
                self.select(&e.subquery)?;
                self.out.push(')');
                Ok(())
            }
            SqlExpr::Like(l) => {
                self.operand(&l.match_expr)?;
                self.out.push_str(" LIKE ");
                self.operand(&l.pattern)?;
                if let Some(escape) = &l.escape {
                    self.out.push_str(" ESCAPE ");
                    self.operand(escape)?;
                }
                Ok(())
            }
            SqlExpr::ScalarSubquery(s) => {
                self.out.push('(');
                self.select(&s.subquery)?;
                self.out.push(')');
                Ok(())
            }
            SqlExpr::RowNumber(r) => {
                self.out.push_str("ROW_NUMBER() OVER(");
                if !r.partitions.is_empty() {
                    self.out.push_str("PARTITION BY ");
                    self.list(&r.partitions)?;
                }
                if !r.orderings.is_empty() {
                    if !r.partitions.is_empty() {
                        self.out.push(' ');
                    }
                    self.out.push_str("ORDER BY ");
                    self.orderings(&r.orderings)?;
                }
                self.out.push(')');
                Ok(())
            }
        }
    }
}

impl fmt::Display for SelectExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&ExpressionPrinter::print_select(self))
    }
}

impl fmt::Display for SqlExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&ExpressionPrinter::print_expr(self))
    }
}
