//! Shaper compilation and materialization.
//!
//! A finalized [`ShapedQuery`](relshape_ir::ShapedQuery) is compiled into a
//! [`ShaperProgram`], from which two procedures are built: the [`RowShaper`]
//! turning a row into an output value, and the [`RelatedDataLoader`] filling
//! the collections of that value.

pub mod compiler;
pub mod loader;
pub mod materialized;
pub mod row_shaper;

pub use compiler::{
    CollectionNode, EntityNode, ShapeNode, ShaperCompiler, ShaperProgram, ValueBinding,
};
pub use loader::RelatedDataLoader;
pub use materialized::{EntityInstance, EntityRef, Materialized};
pub use row_shaper::{ResultContext, RowShaper, ShapingState};
