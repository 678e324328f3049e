//! Tree-rewrite passes over the expression graph.
//!
//! Each pass is a narrow, single-purpose transformation. They run in a fixed
//! order, driven by [`QueryPostprocessor`].

pub mod alias;
pub mod bool_compensation;
pub mod collection_join;
pub mod postprocessor;
pub mod visit;

pub use alias::{collect_aliases, TableAliasUniquifier};
pub use bool_compensation::BoolCompensator;
pub use collection_join::CollectionJoinApplier;
pub use postprocessor::QueryPostprocessor;
pub use visit::{walk_expr, walk_select, walk_table, ExprRewriter};
