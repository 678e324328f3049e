//! Scalar SQL expression nodes.
//!
//! Every node is a plain value; trees are rebuilt rather than mutated. Column
//! references point at their table by [`TableId`] so that alias changes never
//! have to chase references through the tree.

use serde::{Deserialize, Serialize};

use crate::select::{OrderingExpr, SelectExpr, TableId};
use crate::types::{DomainType, TypeMapping};
use crate::value::Value;

/// A scalar SQL expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlExpr {
    Column(ColumnExpr),
    KeyAccess(KeyAccessExpr),
    Constant(ConstantExpr),
    Parameter(ParameterExpr),
    Binary(BinaryExpr),
    Unary(UnaryExpr),
    Conditional(ConditionalExpr),
    Function(FunctionExpr),
    In(InExpr),
    Exists(ExistsExpr),
    Like(LikeExpr),
    ScalarSubquery(ScalarSubqueryExpr),
    RowNumber(RowNumberExpr),
}

/// Reference to a column of a table source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnExpr {
    /// Identity of the table source the column belongs to.
    pub table: TableId,
    /// Qualifier as currently printed; follows the table's alias.
    pub table_alias: Option<String>,
    pub name: String,
    pub type_mapping: Option<TypeMapping>,
    pub nullable: bool,
}

/// Access to a named key of a document-shaped row, e.g. `c["IsActive"]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyAccessExpr {
    pub table: TableId,
    pub table_alias: Option<String>,
    pub key: String,
    pub type_mapping: Option<TypeMapping>,
    pub nullable: bool,
}

/// A literal value. The mapping, when present, is used to convert the literal
/// to the column's stored representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantExpr {
    pub value: Value,
    pub type_mapping: Option<TypeMapping>,
}

/// A named query parameter bound at execution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterExpr {
    pub name: String,
    pub type_mapping: Option<TypeMapping>,
}

/// Binary operator kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    AndAlso,
    OrElse,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
}

impl BinaryOp {
    /// `=` or `<>`; operands of these never need truth-value coercion.
    pub fn is_equality(&self) -> bool {
        matches!(self, BinaryOp::Equal | BinaryOp::NotEqual)
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Equal
                | BinaryOp::NotEqual
                | BinaryOp::LessThan
                | BinaryOp::LessThanOrEqual
                | BinaryOp::GreaterThan
                | BinaryOp::GreaterThanOrEqual
        )
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, BinaryOp::AndAlso | BinaryOp::OrElse)
    }

    /// SQL token for this operator.
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Equal => "=",
            BinaryOp::NotEqual => "<>",
            BinaryOp::LessThan => "<",
            BinaryOp::LessThanOrEqual => "<=",
            BinaryOp::GreaterThan => ">",
            BinaryOp::GreaterThanOrEqual => ">=",
            BinaryOp::AndAlso => "AND",
            BinaryOp::OrElse => "OR",
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryExpr {
    pub op: BinaryOp,
    pub left: Box<SqlExpr>,
    pub right: Box<SqlExpr>,
}

/// Unary operator kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Negate,
    IsNull,
    IsNotNull,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnaryExpr {
    pub op: UnaryOp,
    pub operand: Box<SqlExpr>,
}

/// `CASE WHEN test THEN if_true ELSE if_false END`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalExpr {
    pub test: Box<SqlExpr>,
    pub if_true: Box<SqlExpr>,
    pub if_false: Box<SqlExpr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionExpr {
    pub name: String,
    /// Niladic functions print without parentheses, e.g. `CURRENT_TIMESTAMP`.
    pub niladic: bool,
    pub instance: Option<Box<SqlExpr>>,
    pub arguments: Vec<SqlExpr>,
    pub type_mapping: Option<TypeMapping>,
}

impl FunctionExpr {
    /// Aggregate functions evaluated over a group of rows.
    pub fn is_aggregate(&self) -> bool {
        matches!(
            self.name.to_ascii_uppercase().as_str(),
            "COUNT" | "SUM" | "MIN" | "MAX" | "AVG"
        )
    }
}

/// Right-hand side of an `IN`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InSource {
    Values(Vec<SqlExpr>),
    Subquery(Box<SelectExpr>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InExpr {
    pub item: Box<SqlExpr>,
    pub source: InSource,
    pub negated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExistsExpr {
    pub subquery: Box<SelectExpr>,
    pub negated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LikeExpr {
    pub match_expr: Box<SqlExpr>,
    pub pattern: Box<SqlExpr>,
    pub escape: Option<Box<SqlExpr>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarSubqueryExpr {
    pub subquery: Box<SelectExpr>,
}

/// `ROW_NUMBER() OVER(PARTITION BY .. ORDER BY ..)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowNumberExpr {
    pub partitions: Vec<SqlExpr>,
    pub orderings: Vec<OrderingExpr>,
}

impl SqlExpr {
    /// A literal without a type mapping.
    pub fn constant(value: impl Into<Value>) -> Self {
        SqlExpr::Constant(ConstantExpr {
            value: value.into(),
            type_mapping: None,
        })
    }

    /// A literal carrying the mapping of the expression it is compared with.
    pub fn typed_constant(value: impl Into<Value>, type_mapping: Option<TypeMapping>) -> Self {
        SqlExpr::Constant(ConstantExpr {
            value: value.into(),
            type_mapping,
        })
    }

    pub fn parameter(name: impl Into<String>) -> Self {
        SqlExpr::Parameter(ParameterExpr {
            name: name.into(),
            type_mapping: None,
        })
    }

    pub fn binary(op: BinaryOp, left: SqlExpr, right: SqlExpr) -> Self {
        SqlExpr::Binary(BinaryExpr {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    pub fn equal(left: SqlExpr, right: SqlExpr) -> Self {
        Self::binary(BinaryOp::Equal, left, right)
    }

    pub fn not_equal(left: SqlExpr, right: SqlExpr) -> Self {
        Self::binary(BinaryOp::NotEqual, left, right)
    }

    pub fn and(left: SqlExpr, right: SqlExpr) -> Self {
        Self::binary(BinaryOp::AndAlso, left, right)
    }

    pub fn or(left: SqlExpr, right: SqlExpr) -> Self {
        Self::binary(BinaryOp::OrElse, left, right)
    }

    /// Fold a list of predicates with `AND`. Returns `None` for an empty list.
    pub fn and_all(predicates: impl IntoIterator<Item = SqlExpr>) -> Option<SqlExpr> {
        predicates.into_iter().reduce(SqlExpr::and)
    }

    pub fn unary(op: UnaryOp, operand: SqlExpr) -> Self {
        SqlExpr::Unary(UnaryExpr {
            op,
            operand: Box::new(operand),
        })
    }

    pub fn not(operand: SqlExpr) -> Self {
        Self::unary(UnaryOp::Not, operand)
    }

    pub fn is_null(operand: SqlExpr) -> Self {
        Self::unary(UnaryOp::IsNull, operand)
    }

    pub fn conditional(test: SqlExpr, if_true: SqlExpr, if_false: SqlExpr) -> Self {
        SqlExpr::Conditional(ConditionalExpr {
            test: Box::new(test),
            if_true: Box::new(if_true),
            if_false: Box::new(if_false),
        })
    }

    pub fn function(name: impl Into<String>, arguments: Vec<SqlExpr>) -> Self {
        SqlExpr::Function(FunctionExpr {
            name: name.into(),
            niladic: false,
            instance: None,
            arguments,
            type_mapping: None,
        })
    }

    pub fn in_values(item: SqlExpr, values: Vec<SqlExpr>) -> Self {
        SqlExpr::In(InExpr {
            item: Box::new(item),
            source: InSource::Values(values),
            negated: false,
        })
    }

    pub fn exists(subquery: SelectExpr) -> Self {
        SqlExpr::Exists(ExistsExpr {
            subquery: Box::new(subquery),
            negated: false,
        })
    }

    pub fn like(match_expr: SqlExpr, pattern: SqlExpr) -> Self {
        SqlExpr::Like(LikeExpr {
            match_expr: Box::new(match_expr),
            pattern: Box::new(pattern),
            escape: None,
        })
    }

    pub fn scalar_subquery(subquery: SelectExpr) -> Self {
        SqlExpr::ScalarSubquery(ScalarSubqueryExpr {
            subquery: Box::new(subquery),
        })
    }

    pub fn row_number(partitions: Vec<SqlExpr>, orderings: Vec<OrderingExpr>) -> Self {
        SqlExpr::RowNumber(RowNumberExpr { partitions, orderings })
    }

    /// Type mapping carried by the node, if any.
    pub fn type_mapping(&self) -> Option<&TypeMapping> {
        match self {
            SqlExpr::Column(c) => c.type_mapping.as_ref(),
            SqlExpr::KeyAccess(k) => k.type_mapping.as_ref(),
            SqlExpr::Constant(c) => c.type_mapping.as_ref(),
            SqlExpr::Parameter(p) => p.type_mapping.as_ref(),
            SqlExpr::Function(f) => f.type_mapping.as_ref(),
            SqlExpr::ScalarSubquery(s) => s
                .subquery
                .projections
                .first()
                .and_then(|p| p.expr.type_mapping()),
            SqlExpr::Conditional(c) => {
                c.if_true.type_mapping().or_else(|| c.if_false.type_mapping())
            }
            _ => None,
        }
    }

    /// Domain type of the expression when it can be determined.
    pub fn domain_type(&self) -> Option<DomainType> {
        match self {
            SqlExpr::Binary(b) if b.op.is_comparison() || b.op.is_logical() => {
                Some(DomainType::Bool)
            }
            SqlExpr::Unary(u) if u.op != UnaryOp::Negate => Some(DomainType::Bool),
            SqlExpr::In(_) | SqlExpr::Exists(_) | SqlExpr::Like(_) => Some(DomainType::Bool),
            SqlExpr::RowNumber(_) => Some(DomainType::Int64),
            SqlExpr::Constant(c) if c.type_mapping.is_none() => match &c.value {
                Value::Bool(_) => Some(DomainType::Bool),
                Value::Int32(_) => Some(DomainType::Int32),
                Value::Int64(_) => Some(DomainType::Int64),
                Value::Float32(_) => Some(DomainType::Float32),
                Value::Float64(_) => Some(DomainType::Float64),
                Value::String(_) => Some(DomainType::String),
                Value::Bytes(_) => Some(DomainType::Bytes),
                Value::Timestamp(_) => Some(DomainType::Timestamp),
                Value::Uuid(_) => Some(DomainType::Uuid),
                Value::Null => None,
            },
            other => other.type_mapping().map(|m| m.domain_type),
        }
    }

    /// Conservative nullability.
    pub fn is_nullable(&self) -> bool {
        match self {
            SqlExpr::Column(c) => c.nullable,
            SqlExpr::KeyAccess(k) => k.nullable,
            SqlExpr::Constant(c) => c.value.is_null(),
            SqlExpr::RowNumber(_) | SqlExpr::Exists(_) => false,
            SqlExpr::Unary(u) => {
                matches!(u.op, UnaryOp::Not | UnaryOp::Negate) && u.operand.is_nullable()
            }
            _ => true,
        }
    }
}

impl ColumnExpr {
    /// Same column, seen through an outer join: always nullable.
    pub fn made_nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

impl From<ColumnExpr> for SqlExpr {
    fn from(column: ColumnExpr) -> Self {
        SqlExpr::Column(column)
    }
}
