//! Evaluation of finalized select trees over in-memory tables.
//!
//! Columns are resolved by the identity of their table source, innermost
//! scope first, so correlated subqueries and APPLY joins see the rows of the
//! enclosing selects. Predicates use three-valued logic and must evaluate to
//! a boolean or null; any other value in predicate position is an error.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::iter::Peekable;
use std::str::Chars;
use std::sync::Arc;

use relshape_ir::{
    BinaryExpr, BinaryOp, CompositeKey, FunctionExpr, InSource, JoinExpr, OrderingExpr, SelectExpr,
    SetOperationExpr, SetOperationKind, SqlExpr, TableExpr, TableId, TypeMapping, UnaryOp, Value,
};

use crate::error::{Error, Result};
use crate::execution::ParameterValues;

/// A stored table.
#[derive(Debug, Clone, Default)]
pub struct MemoryTable {
    pub(crate) columns: Arc<Vec<String>>,
    pub(crate) rows: Vec<Arc<Vec<Value>>>,
}

impl MemoryTable {
    pub fn new(columns: &[&str]) -> Self {
        Self {
            columns: Arc::new(columns.iter().map(|c| c.to_string()).collect()),
            rows: Vec::new(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Result of evaluating a select.
#[derive(Debug, Clone)]
pub(crate) struct Relation {
    pub columns: Arc<Vec<String>>,
    pub rows: Vec<Arc<Vec<Value>>>,
}

/// One table source bound to one of its rows; `None` for a null-extended row.
#[derive(Debug, Clone)]
struct Binding {
    id: TableId,
    columns: Arc<Vec<String>>,
    values: Option<Arc<Vec<Value>>>,
}

impl Binding {
    fn get(&self, name: &str) -> Result<Value> {
        let index = self
            .columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| Error::InvalidExpression(format!("unknown column {name}")))?;
        Ok(self
            .values
            .as_ref()
            .and_then(|values| values.get(index).cloned())
            .unwrap_or(Value::Null))
    }
}

type Frame = Vec<Binding>;

#[derive(Clone, Copy)]
struct Ctx<'a> {
    frame: &'a Frame,
    outer: &'a [&'a Frame],
    group: Option<&'a [Frame]>,
}

impl<'a> Ctx<'a> {
    fn row(frame: &'a Frame, outer: &'a [&'a Frame]) -> Self {
        Self { frame, outer, group: None }
    }

    fn env(&self) -> Vec<&'a Frame> {
        std::iter::once(self.frame).chain(self.outer.iter().copied()).collect()
    }

    fn binding(&self, id: TableId) -> Option<&'a Binding> {
        std::iter::once(self.frame)
            .chain(self.outer.iter().copied())
            .flat_map(|frame| frame.iter())
            .find(|binding| binding.id == id)
    }
}

pub(crate) struct Evaluator<'a> {
    tables: &'a HashMap<String, MemoryTable>,
    parameters: &'a ParameterValues,
}

impl<'a> Evaluator<'a> {
    pub fn new(tables: &'a HashMap<String, MemoryTable>, parameters: &'a ParameterValues) -> Self {
        Self { tables, parameters }
    }

    /// Evaluate a top-level select.
    pub fn run(&self, select: &SelectExpr) -> Result<Relation> {
        self.select(select, &[])
    }

    fn select(&self, select: &SelectExpr, outer: &[&Frame]) -> Result<Relation> {
        let mut frames = Vec::new();
        for frame in self.from(select, outer)? {
            let keep = match &select.predicate {
                Some(predicate) => self.predicate(predicate, Ctx::row(&frame, outer))?,
                None => true,
            };
            if keep {
                frames.push(frame);
            }
        }

        let grouped = !select.group_by.is_empty()
            || select.having.is_some()
            || select.projections.iter().any(|p| contains_aggregate(&p.expr));

        let mut rows: Vec<(Vec<Value>, Vec<Value>)> = Vec::new();
        if grouped {
            let empty = Frame::new();
            for group in self.groups(select, frames, outer)? {
                let ctx = Ctx {
                    frame: group.first().unwrap_or(&empty),
                    outer,
                    group: Some(group.as_slice()),
                };
                if let Some(having) = &select.having {
                    if !self.predicate(having, ctx)? {
                        continue;
                    }
                }
                let values = select
                    .projections
                    .iter()
                    .map(|p| self.eval(&p.expr, ctx))
                    .collect::<Result<Vec<_>>>()?;
                let keys = self.sort_keys(select, &values, ctx)?;
                rows.push((values, keys));
            }
        } else {
            let row_numbers = self.row_numbers(select, &frames, outer)?;
            for (index, frame) in frames.iter().enumerate() {
                let ctx = Ctx::row(frame, outer);
                let values = select
                    .projections
                    .iter()
                    .zip(&row_numbers)
                    .map(|(p, numbers)| match numbers {
                        Some(numbers) => Ok(Value::Int64(numbers[index])),
                        None => self.eval(&p.expr, ctx),
                    })
                    .collect::<Result<Vec<_>>>()?;
                let keys = self.sort_keys(select, &values, ctx)?;
                rows.push((values, keys));
            }
        }

        if !select.orderings.is_empty() {
            rows.sort_by(|a, b| compare_keys(&a.1, &b.1, &select.orderings));
        }
        let mut values: Vec<Vec<Value>> = rows.into_iter().map(|(values, _)| values).collect();
        if select.distinct {
            let mut seen = HashSet::new();
            values.retain(|row| seen.insert(CompositeKey::from_values(row)));
        }

        let empty = Frame::new();
        let ctx = Ctx::row(&empty, outer);
        let offset = match &select.offset {
            Some(offset) => self.count(offset, ctx)?,
            None => 0,
        };
        let limit = match &select.limit {
            Some(limit) => self.count(limit, ctx)?,
            None => usize::MAX,
        };

        Ok(Relation {
            columns: Arc::new(select.projections.iter().map(|p| p.alias.clone()).collect()),
            rows: values.into_iter().skip(offset).take(limit).map(Arc::new).collect(),
        })
    }

    fn sort_keys(&self, select: &SelectExpr, values: &[Value], ctx: Ctx<'_>) -> Result<Vec<Value>> {
        select
            .orderings
            .iter()
            .map(|o| match select.projection_index(&o.expr) {
                Some(index) => Ok(values[index].clone()),
                None => self.eval(&o.expr, ctx),
            })
            .collect()
    }

    fn count(&self, expr: &SqlExpr, ctx: Ctx<'_>) -> Result<usize> {
        let value = self.eval(expr, ctx)?;
        value
            .as_i64()
            .map(|n| n.max(0) as usize)
            .ok_or_else(|| {
                Error::InvalidExpression(format!("row count must be an integer, got {value}"))
            })
    }

    fn from(&self, select: &SelectExpr, outer: &[&Frame]) -> Result<Vec<Frame>> {
        let mut frames: Vec<Frame> = vec![Frame::new()];
        for table in &select.tables {
            frames = match table {
                TableExpr::Join(join) => self.join(frames, join, outer)?,
                source => {
                    let (id, relation) = self.source(source, outer)?;
                    cross(&frames, id, &relation)
                }
            };
        }
        Ok(frames)
    }

    fn join(&self, frames: Vec<Frame>, join: &JoinExpr, outer: &[&Frame]) -> Result<Vec<Frame>> {
        match join {
            JoinExpr::Cross { table } => {
                let (id, relation) = self.source(table, outer)?;
                Ok(cross(&frames, id, &relation))
            }
            JoinExpr::Inner { table, predicate } | JoinExpr::Left { table, predicate } => {
                let left_join = matches!(join, JoinExpr::Left { .. });
                let (id, relation) = self.source(table, outer)?;
                let mut joined = Vec::new();
                for frame in &frames {
                    let mut matched = false;
                    for row in &relation.rows {
                        let candidate = extend(frame, id, &relation.columns, Some(Arc::clone(row)));
                        if self.predicate(predicate, Ctx::row(&candidate, outer))? {
                            joined.push(candidate);
                            matched = true;
                        }
                    }
                    if left_join && !matched {
                        joined.push(extend(frame, id, &relation.columns, None));
                    }
                }
                Ok(joined)
            }
            JoinExpr::CrossApply { table } | JoinExpr::OuterApply { table } => {
                let outer_apply = matches!(join, JoinExpr::OuterApply { .. });
                let mut joined = Vec::new();
                for frame in &frames {
                    let env: Vec<&Frame> =
                        std::iter::once(frame).chain(outer.iter().copied()).collect();
                    let (id, relation) = self.source(table, &env)?;
                    if relation.rows.is_empty() && outer_apply {
                        joined.push(extend(frame, id, &relation.columns, None));
                    }
                    for row in &relation.rows {
                        joined.push(extend(frame, id, &relation.columns, Some(Arc::clone(row))));
                    }
                }
                Ok(joined)
            }
        }
    }

    fn source(&self, table: &TableExpr, outer: &[&Frame]) -> Result<(TableId, Relation)> {
        match table {
            TableExpr::Table(t) => {
                let stored = self
                    .tables
                    .get(&t.name)
                    .ok_or_else(|| Error::InvalidExpression(format!("unknown table {}", t.name)))?;
                Ok((
                    t.id,
                    Relation {
                        columns: Arc::clone(&stored.columns),
                        rows: stored.rows.clone(),
                    },
                ))
            }
            TableExpr::Derived(d) => Ok((d.id, self.select(&d.select, outer)?)),
            TableExpr::SetOperation(s) => Ok((s.id, self.set_operation(s, outer)?)),
            TableExpr::Join(_) => Err(Error::InvalidExpression(
                "join used as a table source".into(),
            )),
        }
    }

    fn set_operation(&self, operation: &SetOperationExpr, outer: &[&Frame]) -> Result<Relation> {
        let left = self.select(&operation.left, outer)?;
        let right = self.select(&operation.right, outer)?;
        let right_keys: HashSet<CompositeKey> = right
            .rows
            .iter()
            .map(|r| CompositeKey::from_values(r))
            .collect();
        let mut rows: Vec<Arc<Vec<Value>>> = match operation.kind {
            SetOperationKind::Union => left.rows.into_iter().chain(right.rows).collect(),
            SetOperationKind::Intersect => left
                .rows
                .into_iter()
                .filter(|r| right_keys.contains(&CompositeKey::from_values(r)))
                .collect(),
            SetOperationKind::Except => left
                .rows
                .into_iter()
                .filter(|r| !right_keys.contains(&CompositeKey::from_values(r)))
                .collect(),
        };
        if operation.distinct {
            let mut seen = HashSet::new();
            rows.retain(|row| seen.insert(CompositeKey::from_values(row)));
        }
        Ok(Relation {
            columns: left.columns,
            rows,
        })
    }

    fn groups(
        &self,
        select: &SelectExpr,
        frames: Vec<Frame>,
        outer: &[&Frame],
    ) -> Result<Vec<Vec<Frame>>> {
        if select.group_by.is_empty() {
            return Ok(vec![frames]);
        }
        let mut positions: HashMap<CompositeKey, usize> = HashMap::new();
        let mut groups: Vec<Vec<Frame>> = Vec::new();
        for frame in frames {
            let key = select
                .group_by
                .iter()
                .map(|expr| self.eval(expr, Ctx::row(&frame, outer)))
                .collect::<Result<Vec<_>>>()?;
            let key = CompositeKey::from_values(&key);
            match positions.get(&key) {
                Some(&position) => groups[position].push(frame),
                None => {
                    positions.insert(key, groups.len());
                    groups.push(vec![frame]);
                }
            }
        }
        Ok(groups)
    }

    /// Row numbers for every `ROW_NUMBER()` projection, indexed by frame.
    fn row_numbers(
        &self,
        select: &SelectExpr,
        frames: &[Frame],
        outer: &[&Frame],
    ) -> Result<Vec<Option<Vec<i64>>>> {
        select
            .projections
            .iter()
            .map(|projection| {
                let SqlExpr::RowNumber(row_number) = &projection.expr else {
                    return Ok(None);
                };
                let mut partitions: HashMap<CompositeKey, Vec<(Vec<Value>, usize)>> =
                    HashMap::new();
                for (index, frame) in frames.iter().enumerate() {
                    let ctx = Ctx::row(frame, outer);
                    let partition = row_number
                        .partitions
                        .iter()
                        .map(|e| self.eval(e, ctx))
                        .collect::<Result<Vec<_>>>()?;
                    let keys = row_number
                        .orderings
                        .iter()
                        .map(|o| self.eval(&o.expr, ctx))
                        .collect::<Result<Vec<_>>>()?;
                    partitions
                        .entry(CompositeKey::from_values(&partition))
                        .or_default()
                        .push((keys, index));
                }
                let mut numbers = vec![0i64; frames.len()];
                for members in partitions.values_mut() {
                    members.sort_by(|a, b| compare_keys(&a.0, &b.0, &row_number.orderings));
                    for (position, (_, index)) in members.iter().enumerate() {
                        numbers[*index] = position as i64 + 1;
                    }
                }
                Ok(Some(numbers))
            })
            .collect()
    }

    fn predicate(&self, expr: &SqlExpr, ctx: Ctx<'_>) -> Result<bool> {
        Ok(truth(&self.eval(expr, ctx)?, expr)?.unwrap_or(false))
    }

    fn eval(&self, expr: &SqlExpr, ctx: Ctx<'_>) -> Result<Value> {
        match expr {
            SqlExpr::Column(column) => ctx
                .binding(column.table)
                .ok_or_else(|| {
                    Error::InvalidExpression(format!(
                        "column {}.{} is not in scope",
                        column.table_alias.as_deref().unwrap_or("?"),
                        column.name
                    ))
                })?
                .get(&column.name),
            SqlExpr::KeyAccess(access) => ctx
                .binding(access.table)
                .ok_or_else(|| {
                    Error::InvalidExpression(format!("key {} is not in scope", access.key))
                })?
                .get(&access.key),
            SqlExpr::Constant(constant) => {
                to_provider(constant.value.clone(), constant.type_mapping.as_ref())
            }
            SqlExpr::Parameter(parameter) => {
                let value = self
                    .parameters
                    .get(&parameter.name)
                    .cloned()
                    .ok_or_else(|| {
                        Error::InvalidExpression(format!("missing parameter @{}", parameter.name))
                    })?;
                to_provider(value, parameter.type_mapping.as_ref())
            }
            SqlExpr::Binary(binary) => self.binary(binary, ctx),
            SqlExpr::Unary(unary) => {
                let operand = self.eval(&unary.operand, ctx)?;
                match unary.op {
                    UnaryOp::IsNull => Ok(Value::Bool(operand.is_null())),
                    UnaryOp::IsNotNull => Ok(Value::Bool(!operand.is_null())),
                    UnaryOp::Not => Ok(truth(&operand, &unary.operand)?
                        .map(|b| Value::Bool(!b))
                        .unwrap_or(Value::Null)),
                    UnaryOp::Negate => match operand {
                        Value::Null => Ok(Value::Null),
                        Value::Int32(i) => Ok(Value::Int32(-i)),
                        Value::Int64(i) => Ok(Value::Int64(-i)),
                        Value::Float32(f) => Ok(Value::Float32(-f)),
                        Value::Float64(f) => Ok(Value::Float64(-f)),
                        other => Err(Error::InvalidExpression(format!(
                            "cannot negate {}",
                            other.type_name()
                        ))),
                    },
                }
            }
            SqlExpr::Conditional(conditional) => {
                if self.predicate(&conditional.test, ctx)? {
                    self.eval(&conditional.if_true, ctx)
                } else {
                    self.eval(&conditional.if_false, ctx)
                }
            }
            SqlExpr::Function(function) => self.function(function, ctx),
            SqlExpr::In(in_expr) => {
                let item = self.eval(&in_expr.item, ctx)?;
                if item.is_null() {
                    return Ok(Value::Null);
                }
                let candidates = match &in_expr.source {
                    InSource::Values(values) => values
                        .iter()
                        .map(|v| self.eval(v, ctx))
                        .collect::<Result<Vec<_>>>()?,
                    InSource::Subquery(subquery) => self
                        .select(subquery, &ctx.env())?
                        .rows
                        .iter()
                        .map(|row| row.first().cloned().unwrap_or(Value::Null))
                        .collect(),
                };
                let result = if candidates.iter().any(|c| !c.is_null() && item.loosely_equals(c)) {
                    Some(true)
                } else if candidates.iter().any(Value::is_null) {
                    None
                } else {
                    Some(false)
                };
                Ok(result
                    .map(|found| Value::Bool(found != in_expr.negated))
                    .unwrap_or(Value::Null))
            }
            SqlExpr::Exists(exists) => {
                let found = !self.select(&exists.subquery, &ctx.env())?.rows.is_empty();
                Ok(Value::Bool(found != exists.negated))
            }
            SqlExpr::Like(like) => {
                let value = self.eval(&like.match_expr, ctx)?;
                let pattern = self.eval(&like.pattern, ctx)?;
                let escape = match &like.escape {
                    Some(escape) => match self.eval(escape, ctx)? {
                        Value::String(s) => s.chars().next(),
                        Value::Null => return Ok(Value::Null),
                        other => {
                            return Err(Error::InvalidExpression(format!(
                                "LIKE escape must be a string, got {}",
                                other.type_name()
                            )))
                        }
                    },
                    None => None,
                };
                match (value, pattern) {
                    (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
                    (Value::String(value), Value::String(pattern)) => {
                        Ok(Value::Bool(like_match(&value, &pattern, escape)))
                    }
                    (value, pattern) => Err(Error::InvalidExpression(format!(
                        "LIKE requires strings, got {} and {}",
                        value.type_name(),
                        pattern.type_name()
                    ))),
                }
            }
            SqlExpr::ScalarSubquery(scalar) => {
                let relation = self.select(&scalar.subquery, &ctx.env())?;
                match relation.rows.as_slice() {
                    [] => Ok(Value::Null),
                    [row] => Ok(row.first().cloned().unwrap_or(Value::Null)),
                    _ => Err(Error::InvalidExpression(
                        "scalar subquery returned more than one row".into(),
                    )),
                }
            }
            SqlExpr::RowNumber(_) => Err(Error::InvalidExpression(
                "ROW_NUMBER() is only supported as a projection".into(),
            )),
        }
    }

    fn binary(&self, binary: &BinaryExpr, ctx: Ctx<'_>) -> Result<Value> {
        if binary.op.is_logical() {
            let left = truth(&self.eval(&binary.left, ctx)?, &binary.left)?;
            // short circuit
            match (binary.op, left) {
                (BinaryOp::AndAlso, Some(false)) => return Ok(Value::Bool(false)),
                (BinaryOp::OrElse, Some(true)) => return Ok(Value::Bool(true)),
                _ => {}
            }
            let right = truth(&self.eval(&binary.right, ctx)?, &binary.right)?;
            let result = match (binary.op, left, right) {
                (BinaryOp::AndAlso, _, Some(false)) => Some(false),
                (BinaryOp::AndAlso, Some(true), Some(true)) => Some(true),
                (BinaryOp::OrElse, _, Some(true)) => Some(true),
                (BinaryOp::OrElse, Some(false), Some(false)) => Some(false),
                _ => None,
            };
            return Ok(result.map(Value::Bool).unwrap_or(Value::Null));
        }

        let left = self.eval(&binary.left, ctx)?;
        let right = self.eval(&binary.right, ctx)?;
        if left.is_null() || right.is_null() {
            return Ok(Value::Null);
        }
        if binary.op.is_comparison() {
            let ordering = if binary.op.is_equality() && left.loosely_equals(&right) {
                Ordering::Equal
            } else {
                left.compare(&right).ok_or_else(|| {
                    Error::InvalidExpression(format!(
                        "cannot compare {} with {}",
                        left.type_name(),
                        right.type_name()
                    ))
                })?
            };
            let result = match binary.op {
                BinaryOp::Equal => ordering == Ordering::Equal,
                BinaryOp::NotEqual => ordering != Ordering::Equal,
                BinaryOp::LessThan => ordering == Ordering::Less,
                BinaryOp::LessThanOrEqual => ordering != Ordering::Greater,
                BinaryOp::GreaterThan => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            return Ok(Value::Bool(result));
        }
        arithmetic(binary.op, left, right)
    }

    fn function(&self, function: &FunctionExpr, ctx: Ctx<'_>) -> Result<Value> {
        if function.is_aggregate() {
            let group = ctx.group.ok_or_else(|| {
                Error::InvalidExpression(format!(
                    "aggregate {} used outside a grouping",
                    function.name
                ))
            })?;
            return self.aggregate(function, group, ctx.outer);
        }

        let mut arguments = Vec::with_capacity(function.arguments.len() + 1);
        if let Some(instance) = &function.instance {
            arguments.push(self.eval(instance, ctx)?);
        }
        for argument in &function.arguments {
            arguments.push(self.eval(argument, ctx)?);
        }
        let name = function.name.to_ascii_uppercase();
        if name == "COALESCE" {
            return Ok(arguments.into_iter().find(|v| !v.is_null()).unwrap_or(Value::Null));
        }
        match (name.as_str(), arguments.as_slice()) {
            (_, [Value::Null]) => Ok(Value::Null),
            ("UPPER", [Value::String(s)]) => Ok(Value::String(s.to_uppercase())),
            ("LOWER", [Value::String(s)]) => Ok(Value::String(s.to_lowercase())),
            ("LENGTH", [Value::String(s)]) => Ok(Value::Int32(s.chars().count() as i32)),
            ("ABS", [Value::Int32(i)]) => Ok(Value::Int32(i.abs())),
            ("ABS", [Value::Int64(i)]) => Ok(Value::Int64(i.abs())),
            ("ABS", [Value::Float64(f)]) => Ok(Value::Float64(f.abs())),
            _ => Err(Error::InvalidExpression(format!(
                "unsupported function {}({})",
                function.name,
                arguments.iter().map(Value::type_name).collect::<Vec<_>>().join(", ")
            ))),
        }
    }

    fn aggregate(
        &self,
        function: &FunctionExpr,
        group: &[Frame],
        outer: &[&Frame],
    ) -> Result<Value> {
        let name = function.name.to_ascii_uppercase();
        let Some(argument) = function.arguments.first() else {
            return if name == "COUNT" {
                Ok(Value::Int64(group.len() as i64))
            } else {
                Err(Error::InvalidExpression(format!("{name} requires an argument")))
            };
        };
        let values = group
            .iter()
            .map(|frame| self.eval(argument, Ctx::row(frame, outer)))
            .filter(|value| !matches!(value, Ok(Value::Null)))
            .collect::<Result<Vec<_>>>()?;

        match name.as_str() {
            "COUNT" => Ok(Value::Int64(values.len() as i64)),
            "MIN" => Ok(values
                .into_iter()
                .min_by(|a, b| a.sort_cmp(b))
                .unwrap_or(Value::Null)),
            "MAX" => Ok(values
                .into_iter()
                .max_by(|a, b| a.sort_cmp(b))
                .unwrap_or(Value::Null)),
            "SUM" | "AVG" => {
                if values.is_empty() {
                    return Ok(Value::Null);
                }
                let integral = values
                    .iter()
                    .all(|v| matches!(v, Value::Int32(_) | Value::Int64(_)));
                if name == "SUM" && integral {
                    return Ok(Value::Int64(values.iter().filter_map(Value::as_i64).sum()));
                }
                let mut total = 0.0;
                for value in &values {
                    total += value.as_f64().ok_or_else(|| {
                        Error::InvalidExpression(format!(
                            "{name} over non-numeric {}",
                            value.type_name()
                        ))
                    })?;
                }
                Ok(Value::Float64(if name == "AVG" {
                    total / values.len() as f64
                } else {
                    total
                }))
            }
            _ => Err(Error::InvalidExpression(format!("unsupported aggregate {name}"))),
        }
    }
}

fn cross(frames: &[Frame], id: TableId, relation: &Relation) -> Vec<Frame> {
    let mut joined = Vec::with_capacity(frames.len() * relation.rows.len());
    for frame in frames {
        for row in &relation.rows {
            joined.push(extend(frame, id, &relation.columns, Some(Arc::clone(row))));
        }
    }
    joined
}

fn extend(
    frame: &Frame,
    id: TableId,
    columns: &Arc<Vec<String>>,
    values: Option<Arc<Vec<Value>>>,
) -> Frame {
    let mut extended = frame.clone();
    extended.push(Binding {
        id,
        columns: Arc::clone(columns),
        values,
    });
    extended
}

/// Truth value of a predicate result; `None` is unknown.
fn truth(value: &Value, expr: &SqlExpr) -> Result<Option<bool>> {
    match value {
        Value::Bool(b) => Ok(Some(*b)),
        Value::Null => Ok(None),
        other => Err(Error::InvalidExpression(format!(
            "expression {expr} evaluated to {} where a boolean is required",
            other.type_name()
        ))),
    }
}

fn to_provider(value: Value, mapping: Option<&TypeMapping>) -> Result<Value> {
    match mapping.and_then(|m| m.converter.as_ref()) {
        Some(converter) => Ok(converter.to_provider(&value)?),
        None => Ok(value),
    }
}

fn arithmetic(op: BinaryOp, left: Value, right: Value) -> Result<Value> {
    if let (BinaryOp::Add, Value::String(a), Value::String(b)) = (op, &left, &right) {
        return Ok(Value::String(format!("{a}{b}")));
    }
    let both_int32 = matches!((&left, &right), (Value::Int32(_), Value::Int32(_)));
    if let (Some(a), Some(b)) = (integer(&left), integer(&right)) {
        let result = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Subtract => a.checked_sub(b),
            BinaryOp::Multiply => a.checked_mul(b),
            BinaryOp::Divide => a.checked_div(b),
            BinaryOp::Modulo => a.checked_rem(b),
            _ => None,
        }
        .ok_or_else(|| {
            Error::InvalidExpression(format!(
                "arithmetic overflow or division by zero in {a} {} {b}",
                op.symbol()
            ))
        })?;
        return Ok(match i32::try_from(result) {
            Ok(small) if both_int32 => Value::Int32(small),
            _ => Value::Int64(result),
        });
    }
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => Ok(Value::Float64(match op {
            BinaryOp::Add => a + b,
            BinaryOp::Subtract => a - b,
            BinaryOp::Multiply => a * b,
            BinaryOp::Divide => a / b,
            _ => a % b,
        })),
        _ => Err(Error::InvalidExpression(format!(
            "cannot apply {} to {} and {}",
            op.symbol(),
            left.type_name(),
            right.type_name()
        ))),
    }
}

fn integer(value: &Value) -> Option<i64> {
    match value {
        Value::Int32(i) => Some(*i as i64),
        Value::Int64(i) => Some(*i),
        _ => None,
    }
}

fn compare_keys(a: &[Value], b: &[Value], orderings: &[OrderingExpr]) -> Ordering {
    for ((left, right), ordering) in a.iter().zip(b).zip(orderings) {
        let cmp = left.sort_cmp(right);
        let cmp = if ordering.ascending { cmp } else { cmp.reverse() };
        if cmp != Ordering::Equal {
            return cmp;
        }
    }
    Ordering::Equal
}

/// Whether an aggregate function occurs outside any subquery.
fn contains_aggregate(expr: &SqlExpr) -> bool {
    match expr {
        SqlExpr::Function(f) => {
            f.is_aggregate()
                || f.instance.as_deref().is_some_and(contains_aggregate)
                || f.arguments.iter().any(contains_aggregate)
        }
        SqlExpr::Binary(b) => contains_aggregate(&b.left) || contains_aggregate(&b.right),
        SqlExpr::Unary(u) => contains_aggregate(&u.operand),
        SqlExpr::Conditional(c) => {
            contains_aggregate(&c.test)
                || contains_aggregate(&c.if_true)
                || contains_aggregate(&c.if_false)
        }
        SqlExpr::Like(l) => contains_aggregate(&l.match_expr) || contains_aggregate(&l.pattern),
        SqlExpr::In(i) => contains_aggregate(&i.item),
        _ => false,
    }
}

/// SQL LIKE: `%` matches any run of characters, `_` exactly one, and the
/// escape character makes the next pattern character literal.
pub fn like_match(value: &str, pattern: &str, escape: Option<char>) -> bool {
    let mut chars = value.chars().peekable();
    let mut pattern_chars = pattern.chars().peekable();
    like_match_recursive(&mut chars, &mut pattern_chars, escape)
}

fn like_match_recursive(
    chars: &mut Peekable<Chars<'_>>,
    pattern: &mut Peekable<Chars<'_>>,
    escape: Option<char>,
) -> bool {
    loop {
        match (pattern.peek().copied(), chars.peek().copied()) {
            (None, None) => return true,
            (None, Some(_)) => return false,
            (Some(p), _) if Some(p) == escape => {
                pattern.next();
                match (pattern.peek().copied(), chars.peek().copied()) {
                    (Some(p), Some(c)) if p == c => {
                        pattern.next();
                        chars.next();
                    }
                    _ => return false,
                }
            }
            (Some('%'), _) => {
                pattern.next();
                if pattern.peek().is_none() {
                    return true;
                }
                loop {
                    let mut pattern_clone = pattern.clone();
                    let mut chars_clone = chars.clone();
                    if like_match_recursive(&mut chars_clone, &mut pattern_clone, escape) {
                        return true;
                    }
                    if chars.next().is_none() {
                        return false;
                    }
                }
            }
            (Some('_'), Some(_)) => {
                pattern.next();
                chars.next();
            }
            (Some(_), None) => return false,
            (Some(p), Some(c)) => {
                if p != c {
                    return false;
                }
                pattern.next();
                chars.next();
            }
        }
    }
}
