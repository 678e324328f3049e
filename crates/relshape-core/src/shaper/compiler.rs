//! Compiles a finalized shaper tree into a [`ShaperProgram`].
//!
//! Every projection a shaper refers to is resolved once to a [`ValueBinding`]
//! holding its ordinal, column name, domain type and converter, so shaping a
//! row never has to consult the expression tree again.

use std::collections::BTreeMap;

use relshape_ir::{
    CollectionShaper, DomainType, EntityShaper, SelectExpr, ShapedQuery, ShaperExpr, Value,
    ValueConverter,
};
use tracing::debug;

use crate::error::{DecodeErrorKind, Error, Result};
use crate::execution::DataReader;

/// A projected column resolved for decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueBinding {
    pub ordinal: usize,
    pub column: String,
    pub domain_type: Option<DomainType>,
    pub converter: Option<ValueConverter>,
    pub nullable: bool,
}

impl ValueBinding {
    /// Resolve the projection at `index` of `select`.
    pub fn resolve(select: &SelectExpr, index: usize, nullable: bool) -> Result<Self> {
        let projection = select
            .projections
            .get(index)
            .ok_or_else(|| Error::InvalidShaper(format!("projection index {index} out of range")))?;
        let mapping = projection.expr.type_mapping();
        Ok(Self {
            ordinal: index,
            column: projection.alias.clone(),
            domain_type: projection.expr.domain_type(),
            converter: mapping.and_then(|m| m.converter.clone()),
            nullable,
        })
    }

    /// Read and convert the value at this binding's ordinal.
    pub fn read(&self, reader: &dyn DataReader) -> Result<Value> {
        let raw = reader.value(self.ordinal)?;
        if raw.is_null() {
            return if self.nullable { Ok(Value::Null) } else { Err(self.null_error()) };
        }
        let value = match &self.converter {
            Some(converter) => converter
                .from_provider(&raw)
                .map_err(|e| self.error(DecodeErrorKind::Conversion(e.to_string())))?,
            None => raw,
        };
        match self.domain_type {
            Some(expected) if !expected.accepts(&value) => {
                Err(self.error(DecodeErrorKind::TypeMismatch {
                    expected: format!("{expected:?}"),
                    actual: value.type_name().to_string(),
                }))
            }
            Some(expected) => Ok(expected.coerce(value)),
            None => Ok(value),
        }
    }

    pub fn null_error(&self) -> Error {
        self.error(DecodeErrorKind::NullValue)
    }

    fn error(&self, kind: DecodeErrorKind) -> Error {
        Error::Decode {
            column: self.column.clone(),
            ordinal: self.ordinal,
            kind,
        }
    }
}

/// Read every binding; identifier bindings are nullable.
pub(crate) fn read_values(
    bindings: &[ValueBinding],
    reader: &dyn DataReader,
) -> Result<Vec<Value>> {
    bindings.iter().map(|b| b.read(reader)).collect()
}

/// Compiled shape of an output value.
#[derive(Debug, Clone)]
pub enum ShapeNode {
    Scalar(ValueBinding),
    Entity(EntityNode),
    /// Collection by id; see [`ShaperProgram::collection`].
    Collection(usize),
    Record(Vec<(String, ShapeNode)>),
}

#[derive(Debug, Clone)]
pub struct EntityNode {
    pub entity_type: String,
    pub key: Vec<ValueBinding>,
    pub properties: Vec<(String, ValueBinding)>,
    pub references: Vec<(String, EntityNode)>,
    /// Collection navigations: (name, collection id).
    pub collections: Vec<(String, usize)>,
    pub nullable: bool,
}

#[derive(Debug, Clone)]
pub struct CollectionNode {
    pub collection_id: usize,
    pub navigation: Option<String>,
    pub element_type: String,
    /// Parent identifier in the enclosing row.
    pub parent_identifier: Vec<ValueBinding>,
    /// Element identifier in the element row.
    pub child_identifier: Vec<ValueBinding>,
    pub element: ShapeNode,
    /// Parent identifier copies in the split query's rows.
    pub split_parent_identifier: Option<Vec<ValueBinding>>,
}

impl CollectionNode {
    pub fn is_split(&self) -> bool {
        self.split_parent_identifier.is_some()
    }
}

/// Executable form of a shaper, shared by the row shaper and the loader.
#[derive(Debug, Clone)]
pub struct ShaperProgram {
    pub(crate) root: ShapeNode,
    pub(crate) collections: BTreeMap<usize, CollectionNode>,
}

impl ShaperProgram {
    pub fn root(&self) -> &ShapeNode {
        &self.root
    }

    pub fn collection(&self, collection_id: usize) -> Result<&CollectionNode> {
        self.collections
            .get(&collection_id)
            .ok_or_else(|| Error::InvalidShaper(format!("unknown collection {collection_id}")))
    }

    pub fn collection_count(&self) -> usize {
        self.collections.len()
    }

    pub fn has_split_collections(&self) -> bool {
        self.collections.values().any(CollectionNode::is_split)
    }
}

/// Builds [`ShaperProgram`]s.
#[derive(Debug, Default)]
pub struct ShaperCompiler {
    collections: BTreeMap<usize, CollectionNode>,
}

impl ShaperCompiler {
    /// Compile the shaper of a finalized shaped query.
    pub fn compile(shaped: &ShapedQuery) -> Result<ShaperProgram> {
        let mut compiler = ShaperCompiler::default();
        let root = compiler.node(&shaped.shaper, &shaped.query)?;
        debug!(collections = compiler.collections.len(), "compiled shaper");
        Ok(ShaperProgram {
            root,
            collections: compiler.collections,
        })
    }

    fn node(&mut self, shaper: &ShaperExpr, select: &SelectExpr) -> Result<ShapeNode> {
        match shaper {
            ShaperExpr::Scalar(s) => {
                Ok(ShapeNode::Scalar(ValueBinding::resolve(select, s.index, s.nullable)?))
            }
            ShaperExpr::Entity(e) => Ok(ShapeNode::Entity(self.entity(e, select)?)),
            ShaperExpr::Collection(c) => Ok(ShapeNode::Collection(self.collection(c, select)?)),
            ShaperExpr::Record(r) => r
                .members
                .iter()
                .map(|m| Ok((m.name.clone(), self.node(&m.shaper, select)?)))
                .collect::<Result<Vec<_>>>()
                .map(ShapeNode::Record),
            ShaperExpr::PendingCollection(p) => Err(Error::InvalidShaper(format!(
                "collection of {} was not joined before compilation",
                p.element_type
            ))),
        }
    }

    fn entity(&mut self, entity: &EntityShaper, select: &SelectExpr) -> Result<EntityNode> {
        if entity.key.is_empty() {
            return Err(Error::InvalidShaper(format!("entity {} has no key", entity.entity_type)));
        }
        let key = entity
            .key
            .iter()
            .map(|&i| ValueBinding::resolve(select, i, true))
            .collect::<Result<Vec<_>>>()?;
        let properties = entity
            .properties
            .iter()
            .map(|p| Ok((p.name.clone(), ValueBinding::resolve(select, p.index, p.nullable)?)))
            .collect::<Result<Vec<_>>>()?;

        let mut references = Vec::new();
        let mut collections = Vec::new();
        for navigation in &entity.navigations {
            match &navigation.target {
                ShaperExpr::Entity(target) => {
                    references.push((navigation.name.clone(), self.entity(target, select)?))
                }
                ShaperExpr::Collection(target) => {
                    collections.push((navigation.name.clone(), self.collection(target, select)?))
                }
                ShaperExpr::PendingCollection(_) => {
                    return Err(Error::InvalidShaper(format!(
                        "navigation {} was not joined before compilation",
                        navigation.name
                    )))
                }
                ShaperExpr::Scalar(_) | ShaperExpr::Record(_) => {
                    return Err(Error::InvalidShaper(format!(
                        "navigation {} must target an entity or a collection",
                        navigation.name
                    )))
                }
            }
        }

        Ok(EntityNode {
            entity_type: entity.entity_type.clone(),
            key,
            properties,
            references,
            collections,
            nullable: entity.nullable,
        })
    }

    fn collection(&mut self, collection: &CollectionShaper, select: &SelectExpr) -> Result<usize> {
        if self.collections.contains_key(&collection.collection_id) {
            return Err(Error::InvalidShaper(format!(
                "duplicate collection id {}",
                collection.collection_id
            )));
        }
        let parent_identifier = collection
            .parent_identifier
            .iter()
            .map(|&i| ValueBinding::resolve(select, i, true))
            .collect::<Result<Vec<_>>>()?;

        let (element_select, split_parent_identifier) = match &collection.split {
            Some(split) => (
                &split.query,
                Some(
                    split
                        .parent_identifier
                        .iter()
                        .map(|&i| ValueBinding::resolve(&split.query, i, true))
                        .collect::<Result<Vec<_>>>()?,
                ),
            ),
            None => (select, None),
        };
        let child_identifier = collection
            .child_identifier
            .iter()
            .map(|&i| ValueBinding::resolve(element_select, i, true))
            .collect::<Result<Vec<_>>>()?;
        let element = self.node(&collection.element, element_select)?;

        self.collections.insert(
            collection.collection_id,
            CollectionNode {
                collection_id: collection.collection_id,
                navigation: collection.navigation.clone(),
                element_type: collection.element_type.clone(),
                parent_identifier,
                child_identifier,
                element,
                split_parent_identifier,
            },
        );
        Ok(collection.collection_id)
    }
}
