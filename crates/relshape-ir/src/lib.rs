//! Expression graph IR for relshape.
//!
//! This crate defines the trees the query pipeline operates on:
//! - [`SelectExpr`] and [`SqlExpr`]: a relational query with its scalar expressions
//! - [`ShaperExpr`]: how output values are assembled from projected columns
//! - [`ShapedQuery`]: the pairing of the two
//! - [`Value`], [`TypeMapping`], [`ValueConverter`]: runtime values and their
//!   stored representations
//!
//! Trees are plain owned values. Table sources carry a [`TableId`] identity so
//! passes can distinguish physically distinct but structurally equal sources.

pub mod error;
pub mod expr;
pub mod printer;
pub mod select;
pub mod shaper;
pub mod types;
pub mod value;

pub use error::Error;
pub use expr::{
    BinaryExpr, BinaryOp, ColumnExpr, ConditionalExpr, ConstantExpr, ExistsExpr, FunctionExpr,
    InExpr, InSource, KeyAccessExpr, LikeExpr, ParameterExpr, RowNumberExpr, ScalarSubqueryExpr,
    SqlExpr, UnaryExpr, UnaryOp,
};
pub use printer::ExpressionPrinter;
pub use select::{
    unique_name, DerivedTable, JoinExpr, OrderingExpr, ProjectionExpr, SelectExpr, SetOperationExpr,
    SetOperationKind, TableExpr, TableId, TableRef,
};
pub use shaper::{
    CollectionShaper, EntityShaper, NavigationShaper, PendingCollection, PropertyShaper,
    RecordMember, RecordShaper, ScalarShaper, ShapedQuery, ShaperExpr, SplitCollectionQuery,
};
pub use types::{DomainType, TypeMapping, ValueConverter};
pub use value::{CompositeKey, Value, ValueKey};
