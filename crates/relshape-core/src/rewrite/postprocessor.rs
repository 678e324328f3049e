//! Rewrite pipeline driver.

use std::borrow::Cow;

use relshape_ir::{SelectExpr, ShapedQuery};
use tracing::{debug, instrument};

use super::alias::TableAliasUniquifier;
use super::bool_compensation::BoolCompensator;
use super::collection_join::CollectionJoinApplier;
use crate::config::QueryOptions;
use crate::error::Result;

/// Runs the rewrite passes in their fixed order.
///
/// Collection joins first, since they introduce new sources and predicates;
/// then boolean compensation; alias uniquification last, over the root and
/// over every split collection query, each in its own scope.
#[derive(Debug, Clone)]
pub struct QueryPostprocessor {
    split: bool,
    compensate_converted_bools: bool,
}

impl QueryPostprocessor {
    /// Create a new postprocessor for the given options.
    pub fn new(options: &QueryOptions) -> Self {
        Self {
            split: options.is_split(),
            compensate_converted_bools: options.compensate_converted_bools,
        }
    }

    /// Finalize a shaped query.
    #[instrument(skip_all, fields(split = self.split))]
    pub fn process(&self, shaped: ShapedQuery) -> Result<ShapedQuery> {
        let mut applier = CollectionJoinApplier::new(self.split);
        let ShapedQuery { query, mut shaper } = applier.apply(shaped)?;
        debug!(collections = applier.collection_count(), "collection joins applied");

        let query = self.finalize(query);
        shaper.for_each_split_query_mut(&mut |split| {
            let finalized = self.finalize(std::mem::take(split));
            *split = finalized;
        });
        Ok(ShapedQuery::new(query, shaper))
    }

    fn finalize(&self, select: SelectExpr) -> SelectExpr {
        let select = if self.compensate_converted_bools {
            let compensated = owned(BoolCompensator::new().visit_select(&select));
            compensated.unwrap_or(select)
        } else {
            select
        };
        let unique = owned(TableAliasUniquifier::uniquify(&select));
        unique.unwrap_or(select)
    }
}

fn owned(select: Cow<'_, SelectExpr>) -> Option<SelectExpr> {
    match select {
        Cow::Owned(select) => Some(select),
        Cow::Borrowed(_) => None,
    }
}
