//! Collection join application.
//!
//! Replaces every [`PendingCollection`] in a shaper with a [`CollectionShaper`]:
//! - single query: the element query is LEFT JOINed into the enclosing query
//!   as a derived table and its columns appended to the projection list;
//! - split query: a sibling query is built from the parent's sources joined to
//!   the element query, projecting copies of the parent identifier first.
//!
//! Rows of one parent are kept contiguous by ordering on the parent
//! identifier, and elements are ordered by the element identifier last.

use relshape_ir::{
    BinaryOp, CollectionShaper, ConstantExpr, DerivedTable, EntityShaper, JoinExpr,
    NavigationShaper, OrderingExpr, PendingCollection, RecordMember, RecordShaper, SelectExpr,
    ShapedQuery, ShaperExpr, SplitCollectionQuery, SqlExpr, TableExpr, Value,
};
use tracing::debug;

use crate::error::{Error, Result};

const DERIVED_ALIAS: &str = "t";

/// Applies pending collection navigations to a shaped query.
#[derive(Debug)]
pub struct CollectionJoinApplier {
    split: bool,
    next_collection_id: usize,
}

/// An element query ready to be joined.
struct PreparedInner {
    select: SelectExpr,
    /// Correlation key projection indices.
    key: Vec<usize>,
    /// Orderings to append after the parent identifier: (projection index, ascending).
    orderings: Vec<(usize, bool)>,
}

impl CollectionJoinApplier {
    /// Create a new applier. Collection ids start at 0.
    pub fn new(split: bool) -> Self {
        Self {
            split,
            next_collection_id: 0,
        }
    }

    /// Number of collections applied so far.
    pub fn collection_count(&self) -> usize {
        self.next_collection_id
    }

    /// Apply every pending collection in the shaper.
    pub fn apply(&mut self, shaped: ShapedQuery) -> Result<ShapedQuery> {
        if !shaped.shaper.has_pending_collections() {
            return Ok(shaped);
        }
        let ShapedQuery { query, shaper } = shaped;
        let mut query = if query.requires_pushdown() {
            debug!("pushing down select before applying collection joins");
            query.push_down(DERIVED_ALIAS)
        } else {
            query
        };
        let shaper = self.process_shaper(&mut query, shaper, &[])?;
        Ok(ShapedQuery::new(query, shaper))
    }

    fn process_shaper(
        &mut self,
        target: &mut SelectExpr,
        shaper: ShaperExpr,
        outer_identifier: &[usize],
    ) -> Result<ShaperExpr> {
        Ok(match shaper {
            ShaperExpr::Scalar(_) | ShaperExpr::Collection(_) => shaper,
            ShaperExpr::PendingCollection(pending) => {
                ShaperExpr::Collection(self.apply_collection(target, pending, outer_identifier)?)
            }
            ShaperExpr::Entity(entity) => {
                ShaperExpr::Entity(self.process_entity(target, entity, outer_identifier)?)
            }
            ShaperExpr::Record(record) => {
                let mut members = Vec::with_capacity(record.members.len());
                for member in record.members {
                    members.push(RecordMember {
                        name: member.name,
                        shaper: self.process_shaper(target, member.shaper, outer_identifier)?,
                    });
                }
                ShaperExpr::Record(RecordShaper { members })
            }
        })
    }

    fn process_entity(
        &mut self,
        target: &mut SelectExpr,
        entity: EntityShaper,
        outer_identifier: &[usize],
    ) -> Result<EntityShaper> {
        let mut navigations = Vec::with_capacity(entity.navigations.len());
        for navigation in entity.navigations {
            let target_shaper = match navigation.target {
                ShaperExpr::PendingCollection(mut pending) => {
                    if pending.navigation.is_none() {
                        pending.navigation = Some(navigation.name.clone());
                    }
                    ShaperExpr::PendingCollection(pending)
                }
                other => other,
            };
            navigations.push(NavigationShaper {
                name: navigation.name,
                target: self.process_shaper(target, target_shaper, outer_identifier)?,
            });
        }
        Ok(EntityShaper { navigations, ..entity })
    }

    fn apply_collection(
        &mut self,
        target: &mut SelectExpr,
        pending: PendingCollection,
        outer_identifier: &[usize],
    ) -> Result<CollectionShaper> {
        let collection_id = self.next_collection_id;
        self.next_collection_id += 1;

        let mut parent_identifier = outer_identifier.to_vec();
        for index in &pending.parent_identifier {
            if !parent_identifier.contains(index) {
                parent_identifier.push(*index);
            }
        }
        if parent_identifier.is_empty() {
            return Err(Error::InvalidShaper(format!(
                "collection {collection_id} has no parent identifier"
            )));
        }
        if pending.outer_key.len() != pending.inner_key.len() || pending.outer_key.is_empty() {
            return Err(Error::InvalidShaper(format!(
                "collection {collection_id} has mismatched correlation keys"
            )));
        }
        for &index in &parent_identifier {
            let expr = projection_expr(target, index)?;
            target.append_ordering(OrderingExpr::asc(expr));
        }

        let outer_key = pending
            .outer_key
            .iter()
            .map(|&i| projection_expr(target, i))
            .collect::<Result<Vec<_>>>()?;
        let ShapedQuery {
            query: inner_query,
            shaper: inner_shaper,
        } = *pending.inner;
        let prepared = prepare_inner(inner_query, &pending.inner_key, &pending.inner_identifier)?;

        debug!(
            collection_id,
            split = self.split,
            navigation = pending.navigation.as_deref().unwrap_or(""),
            "applying collection"
        );

        if self.split {
            self.apply_split(
                target,
                collection_id,
                pending.navigation,
                pending.element_type,
                parent_identifier,
                outer_key,
                prepared,
                inner_shaper,
                &pending.inner_identifier,
            )
        } else {
            self.apply_single(
                target,
                collection_id,
                pending.navigation,
                pending.element_type,
                parent_identifier,
                outer_key,
                prepared,
                inner_shaper,
                &pending.inner_identifier,
            )
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_single(
        &mut self,
        target: &mut SelectExpr,
        collection_id: usize,
        navigation: Option<String>,
        element_type: String,
        parent_identifier: Vec<usize>,
        outer_key: Vec<SqlExpr>,
        prepared: PreparedInner,
        inner_shaper: ShaperExpr,
        inner_identifier: &[usize],
    ) -> Result<CollectionShaper> {
        let PreparedInner { select, key, orderings } = prepared;
        let derived = DerivedTable::new(DERIVED_ALIAS, select);
        let column = |index: usize, nullable: bool| -> Result<SqlExpr> {
            derived
                .column_at(index)
                .map(|c| {
                    if nullable {
                        SqlExpr::Column(c.made_nullable())
                    } else {
                        SqlExpr::Column(c)
                    }
                })
                .ok_or_else(|| {
                    Error::InvalidShaper(format!("element projection {index} out of range"))
                })
        };

        let predicate = SqlExpr::and_all(
            outer_key
                .into_iter()
                .zip(&key)
                .map(|(outer, &inner)| Ok(SqlExpr::equal(outer, column(inner, true)?)))
                .collect::<Result<Vec<_>>>()?,
        )
        .ok_or_else(|| Error::InvalidShaper("collection without correlation key".into()))?;

        let mut mapping = Vec::with_capacity(derived.select.projections.len());
        for (index, projection) in derived.select.projections.iter().enumerate() {
            mapping.push(target.add_projection(column(index, true)?, &projection.alias));
        }
        for (index, ascending) in orderings {
            target.append_ordering(OrderingExpr {
                expr: column(index, true)?,
                ascending,
            });
        }
        for &index in inner_identifier {
            target.append_ordering(OrderingExpr::asc(column(index, true)?));
        }
        target.tables.push(TableExpr::Join(JoinExpr::Left {
            table: Box::new(TableExpr::Derived(derived)),
            predicate,
        }));

        let child_identifier = remap_indices(inner_identifier, &mapping)?;
        let element = inner_shaper.remap(&mapping)?;
        let mut nested_outer = parent_identifier.clone();
        nested_outer.extend(child_identifier.iter().copied());
        let element = self.process_shaper(target, element, &nested_outer)?;

        Ok(CollectionShaper {
            collection_id,
            navigation,
            element_type,
            parent_identifier,
            child_identifier,
            element: Box::new(element),
            split: None,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_split(
        &mut self,
        target: &mut SelectExpr,
        collection_id: usize,
        navigation: Option<String>,
        element_type: String,
        parent_identifier: Vec<usize>,
        outer_key: Vec<SqlExpr>,
        prepared: PreparedInner,
        inner_shaper: ShaperExpr,
        inner_identifier: &[usize],
    ) -> Result<CollectionShaper> {
        let PreparedInner { select, key, orderings } = prepared;

        // the child query sees exactly the parent rows, in the parent's order
        let mut child = SelectExpr {
            tables: target.tables.clone(),
            predicate: target.predicate.clone(),
            orderings: target.orderings.clone(),
            ..Default::default()
        };
        let mut split_parent_identifier = Vec::with_capacity(parent_identifier.len());
        for &index in &parent_identifier {
            let projection = target
                .projections
                .get(index)
                .ok_or_else(|| {
                    Error::InvalidShaper(format!("parent identifier {index} out of range"))
                })?;
            split_parent_identifier
                .push(child.add_projection(projection.expr.clone(), &projection.alias));
        }

        let derived = DerivedTable::new(DERIVED_ALIAS, select);
        let column = |index: usize| -> Result<SqlExpr> {
            derived
                .column_at(index)
                .map(SqlExpr::Column)
                .ok_or_else(|| {
                    Error::InvalidShaper(format!("element projection {index} out of range"))
                })
        };
        let predicate = SqlExpr::and_all(
            outer_key
                .into_iter()
                .zip(&key)
                .map(|(outer, &inner)| Ok(SqlExpr::equal(outer, column(inner)?)))
                .collect::<Result<Vec<_>>>()?,
        )
        .ok_or_else(|| Error::InvalidShaper("collection without correlation key".into()))?;

        let mut mapping = Vec::with_capacity(derived.select.projections.len());
        for (index, projection) in derived.select.projections.iter().enumerate() {
            mapping.push(child.add_projection(column(index)?, &projection.alias));
        }
        for (index, ascending) in orderings {
            child.append_ordering(OrderingExpr {
                expr: column(index)?,
                ascending,
            });
        }
        for &index in inner_identifier {
            child.append_ordering(OrderingExpr::asc(column(index)?));
        }
        child.tables.push(TableExpr::Join(JoinExpr::Inner {
            table: Box::new(TableExpr::Derived(derived)),
            predicate,
        }));

        let child_identifier = remap_indices(inner_identifier, &mapping)?;
        let element = inner_shaper.remap(&mapping)?;
        let mut nested_outer = split_parent_identifier.clone();
        for index in &child_identifier {
            if !nested_outer.contains(index) {
                nested_outer.push(*index);
            }
        }
        let element = self.process_shaper(&mut child, element, &nested_outer)?;

        Ok(CollectionShaper {
            collection_id,
            navigation,
            element_type,
            parent_identifier,
            child_identifier,
            element: Box::new(element),
            split: Some(SplitCollectionQuery {
                query: child,
                parent_identifier: split_parent_identifier,
            }),
        })
    }
}

/// Project the correlation key and make the element query safe to join.
///
/// A limited or offset element query is paginated per parent: a
/// `ROW_NUMBER()` partitioned by the correlation key is projected and the
/// query wrapped and filtered on it. Distinct or grouped element queries are
/// pushed down so the join cannot change their row sets.
fn prepare_inner(
    mut select: SelectExpr,
    inner_key: &[SqlExpr],
    inner_identifier: &[usize],
) -> Result<PreparedInner> {
    let mut key = Vec::with_capacity(inner_key.len());
    for expr in inner_key {
        if !select.group_by.is_empty() && !select.group_by.contains(expr) {
            select.group_by.push(expr.clone());
        }
        key.push(select.add_projection(expr.clone(), "key"));
    }
    for &index in inner_identifier {
        if index >= select.projections.len() {
            return Err(Error::InvalidShaper(format!("element identifier {index} out of range")));
        }
    }

    if select.limit.is_some() || select.offset.is_some() {
        let limit = select.limit.take();
        let offset = select.offset.take();
        if select.distinct || !select.group_by.is_empty() {
            select = select.push_down(DERIVED_ALIAS);
        }
        let mut orderings = std::mem::take(&mut select.orderings);
        if orderings.is_empty() {
            orderings = inner_identifier
                .iter()
                .map(|&i| OrderingExpr::asc(select.projections[i].expr.clone()))
                .collect();
        }
        let partitions = key.iter().map(|&i| select.projections[i].expr.clone()).collect();
        let row = select.add_projection(SqlExpr::row_number(partitions, orderings), "row");

        let mut wrapped = select.push_down(DERIVED_ALIAS);
        let row_column = projection_expr(&wrapped, row)?;
        let mut bounds = Vec::new();
        if let Some(offset) = &offset {
            bounds.push(SqlExpr::binary(BinaryOp::GreaterThan, row_column.clone(), offset.clone()));
        }
        if let Some(limit) = limit {
            let upper = match offset {
                Some(offset) => add_bounds(offset, limit),
                None => limit,
            };
            bounds.push(SqlExpr::binary(BinaryOp::LessThanOrEqual, row_column.clone(), upper));
        }
        if let Some(predicate) = SqlExpr::and_all(bounds) {
            wrapped.apply_predicate(predicate);
        }
        wrapped.orderings = vec![OrderingExpr::asc(row_column)];
        select = wrapped;
    } else if select.distinct || !select.group_by.is_empty() {
        select = select.push_down(DERIVED_ALIAS);
    }

    let orderings = std::mem::take(&mut select.orderings)
        .into_iter()
        .map(|o| (select.add_projection(o.expr, "c"), o.ascending))
        .collect();

    Ok(PreparedInner { select, key, orderings })
}

/// `offset + limit`, folded when both are integer literals.
fn add_bounds(offset: SqlExpr, limit: SqlExpr) -> SqlExpr {
    match (&offset, &limit) {
        (SqlExpr::Constant(o), SqlExpr::Constant(l)) => match (o.value.as_i64(), l.value.as_i64()) {
            (Some(o), Some(l)) => SqlExpr::Constant(ConstantExpr {
                value: Value::Int64(o.saturating_add(l)),
                type_mapping: None,
            }),
            _ => SqlExpr::binary(BinaryOp::Add, offset, limit),
        },
        _ => SqlExpr::binary(BinaryOp::Add, offset, limit),
    }
}

fn projection_expr(select: &SelectExpr, index: usize) -> Result<SqlExpr> {
    select
        .projections
        .get(index)
        .map(|p| p.expr.clone())
        .ok_or_else(|| Error::InvalidShaper(format!("projection index {index} out of range")))
}

fn remap_indices(indices: &[usize], mapping: &[usize]) -> Result<Vec<usize>> {
    indices
        .iter()
        .map(|&i| {
            mapping
                .get(i)
                .copied()
                .ok_or_else(|| Error::InvalidShaper(format!("projection index {i} out of range")))
        })
        .collect()
}
