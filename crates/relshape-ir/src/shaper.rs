//! Shaper IR: how output values are assembled from projected row data.
//!
//! Indices in a shaper refer to projections of the select it is paired with in
//! a [`ShapedQuery`]. A split collection's element shaper refers to its own
//! split query instead.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::expr::SqlExpr;
use crate::select::SelectExpr;

/// Shape of an output value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ShaperExpr {
    Scalar(ScalarShaper),
    Entity(EntityShaper),
    /// A collection already flattened into its query.
    Collection(CollectionShaper),
    /// A collection navigation not yet joined; removed by the collection-join pass.
    PendingCollection(PendingCollection),
    Record(RecordShaper),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarShaper {
    pub index: usize,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyShaper {
    pub name: String,
    pub index: usize,
    pub nullable: bool,
}

/// Navigation from an entity: a reference (target is an entity shaper) or a
/// collection (target is a collection or pending collection).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationShaper {
    pub name: String,
    pub target: ShaperExpr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityShaper {
    pub entity_type: String,
    /// Projection indices of the identity key.
    pub key: Vec<usize>,
    pub properties: Vec<PropertyShaper>,
    pub navigations: Vec<NavigationShaper>,
    /// An all-null key means "no entity" (outer-joined reference).
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMember {
    pub name: String,
    pub shaper: ShaperExpr,
}

/// Anonymous composite of named members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordShaper {
    pub members: Vec<RecordMember>,
}

/// Secondary query used to load a collection in split mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitCollectionQuery {
    pub query: SelectExpr,
    /// Indices in `query` of the copies of the parent identifier.
    pub parent_identifier: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionShaper {
    pub collection_id: usize,
    pub navigation: Option<String>,
    pub element_type: String,
    /// Indices of the parent identifier in the enclosing query.
    pub parent_identifier: Vec<usize>,
    /// Indices of the element identifier; in the split query when split.
    pub child_identifier: Vec<usize>,
    pub element: Box<ShaperExpr>,
    pub split: Option<SplitCollectionQuery>,
}

/// A collection navigation before it has been joined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCollection {
    pub navigation: Option<String>,
    pub element_type: String,
    /// Identifier of the owning row within the enclosing query. Combined with
    /// the identifiers of enclosing collections by the join pass.
    pub parent_identifier: Vec<usize>,
    /// Outer correlation key indices, paired with `inner_key`.
    pub outer_key: Vec<usize>,
    /// Element query and shaper.
    pub inner: Box<ShapedQuery>,
    /// Inner correlation key expressions over `inner.query`'s tables.
    pub inner_key: Vec<SqlExpr>,
    /// Element identifier indices in `inner.query`.
    pub inner_identifier: Vec<usize>,
}

/// A query root paired with the shaper that consumes its rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapedQuery {
    pub query: SelectExpr,
    pub shaper: ShaperExpr,
}

impl ShapedQuery {
    /// Create a new shaped query.
    pub fn new(query: SelectExpr, shaper: ShaperExpr) -> Self {
        Self { query, shaper }
    }

    /// Replace both halves at once.
    pub fn update(self, query: SelectExpr, shaper: ShaperExpr) -> Self {
        Self { query, shaper }
    }

    pub fn with_query(self, query: SelectExpr) -> Self {
        Self { query, ..self }
    }

    pub fn with_shaper(self, shaper: ShaperExpr) -> Self {
        Self { shaper, ..self }
    }
}

impl ShaperExpr {
    pub fn scalar(index: usize) -> Self {
        ShaperExpr::Scalar(ScalarShaper { index, nullable: true })
    }

    pub fn record(members: Vec<(&str, ShaperExpr)>) -> Self {
        ShaperExpr::Record(RecordShaper {
            members: members
                .into_iter()
                .map(|(name, shaper)| RecordMember {
                    name: name.to_string(),
                    shaper,
                })
                .collect(),
        })
    }

    /// Rewrite projection indices through `map` (old index -> new index).
    ///
    /// Split collections keep their element indices, which belong to the split
    /// query, and pending collections keep their inner query untouched.
    pub fn remap(&self, map: &[usize]) -> Result<ShaperExpr, Error> {
        let at = |index: usize| {
            map.get(index)
                .copied()
                .ok_or_else(|| Error::InvalidTree(format!("projection index {index} out of range")))
        };
        let all = |indices: &[usize]| indices.iter().map(|&i| at(i)).collect::<Result<Vec<_>, _>>();

        Ok(match self {
            ShaperExpr::Scalar(s) => ShaperExpr::Scalar(ScalarShaper {
                index: at(s.index)?,
                nullable: s.nullable,
            }),
            ShaperExpr::Entity(e) => ShaperExpr::Entity(e.remap(map)?),
            ShaperExpr::Collection(c) => {
                let split = c.split.is_some();
                ShaperExpr::Collection(CollectionShaper {
                    collection_id: c.collection_id,
                    navigation: c.navigation.clone(),
                    element_type: c.element_type.clone(),
                    parent_identifier: all(&c.parent_identifier)?,
                    child_identifier: if split {
                        c.child_identifier.clone()
                    } else {
                        all(&c.child_identifier)?
                    },
                    element: Box::new(if split {
                        (*c.element).clone()
                    } else {
                        c.element.remap(map)?
                    }),
                    split: c.split.clone(),
                })
            }
            ShaperExpr::PendingCollection(p) => ShaperExpr::PendingCollection(PendingCollection {
                parent_identifier: all(&p.parent_identifier)?,
                outer_key: all(&p.outer_key)?,
                ..p.clone()
            }),
            ShaperExpr::Record(r) => ShaperExpr::Record(RecordShaper {
                members: r
                    .members
                    .iter()
                    .map(|m| {
                        Ok(RecordMember {
                            name: m.name.clone(),
                            shaper: m.shaper.remap(map)?,
                        })
                    })
                    .collect::<Result<Vec<_>, Error>>()?,
            }),
        })
    }

    /// Whether any pending collection remains anywhere in this shaper.
    pub fn has_pending_collections(&self) -> bool {
        match self {
            ShaperExpr::Scalar(_) => false,
            ShaperExpr::PendingCollection(_) => true,
            ShaperExpr::Entity(e) => {
                e.navigations.iter().any(|n| n.target.has_pending_collections())
            }
            ShaperExpr::Collection(c) => c.element.has_pending_collections(),
            ShaperExpr::Record(r) => r.members.iter().any(|m| m.shaper.has_pending_collections()),
        }
    }

    /// Visit every collection shaper, outermost first.
    pub fn for_each_collection<'a>(&'a self, f: &mut dyn FnMut(&'a CollectionShaper)) {
        match self {
            ShaperExpr::Scalar(_) | ShaperExpr::PendingCollection(_) => {}
            ShaperExpr::Entity(e) => {
                e.navigations.iter().for_each(|n| n.target.for_each_collection(f))
            }
            ShaperExpr::Collection(c) => {
                f(c);
                c.element.for_each_collection(f);
            }
            ShaperExpr::Record(r) => r.members.iter().for_each(|m| m.shaper.for_each_collection(f)),
        }
    }

    /// Visit every split collection query mutably.
    pub fn for_each_split_query_mut(&mut self, f: &mut dyn FnMut(&mut SelectExpr)) {
        match self {
            ShaperExpr::Scalar(_) | ShaperExpr::PendingCollection(_) => {}
            ShaperExpr::Entity(e) => e
                .navigations
                .iter_mut()
                .for_each(|n| n.target.for_each_split_query_mut(f)),
            ShaperExpr::Collection(c) => {
                if let Some(split) = c.split.as_mut() {
                    f(&mut split.query);
                }
                c.element.for_each_split_query_mut(f);
            }
            ShaperExpr::Record(r) => r
                .members
                .iter_mut()
                .for_each(|m| m.shaper.for_each_split_query_mut(f)),
        }
    }
}

impl EntityShaper {
    /// Rewrite projection indices through `map`.
    pub fn remap(&self, map: &[usize]) -> Result<EntityShaper, Error> {
        let at = |index: usize| {
            map.get(index)
                .copied()
                .ok_or_else(|| Error::InvalidTree(format!("projection index {index} out of range")))
        };
        Ok(EntityShaper {
            entity_type: self.entity_type.clone(),
            key: self.key.iter().map(|&i| at(i)).collect::<Result<_, _>>()?,
            properties: self
                .properties
                .iter()
                .map(|p| {
                    Ok(PropertyShaper {
                        name: p.name.clone(),
                        index: at(p.index)?,
                        nullable: p.nullable,
                    })
                })
                .collect::<Result<_, Error>>()?,
            navigations: self
                .navigations
                .iter()
                .map(|n| {
                    Ok(NavigationShaper {
                        name: n.name.clone(),
                        target: n.target.remap(map)?,
                    })
                })
                .collect::<Result<_, Error>>()?,
            nullable: self.nullable,
        })
    }
}

impl From<EntityShaper> for ShaperExpr {
    fn from(entity: EntityShaper) -> Self {
        ShaperExpr::Entity(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(key: usize, name: usize) -> EntityShaper {
        EntityShaper {
            entity_type: "Blog".into(),
            key: vec![key],
            properties: vec![
                PropertyShaper {
                    name: "Id".into(),
                    index: key,
                    nullable: false,
                },
                PropertyShaper {
                    name: "Name".into(),
                    index: name,
                    nullable: true,
                },
            ],
            navigations: Vec::new(),
            nullable: false,
        }
    }

    #[test]
    fn test_remap_entity() {
        let shaper = ShaperExpr::Entity(entity(0, 1));
        let ShaperExpr::Entity(remapped) = shaper.remap(&[3, 5]).unwrap() else {
            panic!("expected entity");
        };
        assert_eq!(remapped.key, vec![3]);
        assert_eq!(remapped.properties[1].index, 5);
    }

    #[test]
    fn test_remap_out_of_range() {
        let shaper = ShaperExpr::scalar(4);
        assert!(matches!(shaper.remap(&[0, 1]), Err(Error::InvalidTree(_))));
    }

    #[test]
    fn test_split_collection_keeps_element_indices() {
        let collection = ShaperExpr::Collection(CollectionShaper {
            collection_id: 0,
            navigation: Some("Posts".into()),
            element_type: "Post".into(),
            parent_identifier: vec![0],
            child_identifier: vec![1],
            element: Box::new(ShaperExpr::scalar(2)),
            split: Some(SplitCollectionQuery {
                query: SelectExpr::default(),
                parent_identifier: vec![0],
            }),
        });
        let ShaperExpr::Collection(c) = collection.remap(&[7]).unwrap() else {
            panic!("expected collection");
        };
        assert_eq!(c.parent_identifier, vec![7]);
        assert_eq!(c.child_identifier, vec![1]);
        assert_eq!(*c.element, ShaperExpr::scalar(2));
    }

    #[test]
    fn test_shaped_query_update_keeps_pairing() {
        let shaped = ShapedQuery::new(SelectExpr::default(), ShaperExpr::scalar(0));
        let updated = shaped.with_shaper(ShaperExpr::scalar(1));
        assert_eq!(updated.shaper, ShaperExpr::scalar(1));
        assert_eq!(updated.query, SelectExpr::default());
    }
}
