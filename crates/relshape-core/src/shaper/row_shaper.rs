//! Row shaping.
//!
//! Shaping a row is split into explicit steps:
//! 1. the first [`RowShaper::shape`] call decodes the row into a skeleton
//!    ([`Partial`]) and allocates an empty [`Slot`] per collection it meets;
//! 2. the related data loader fills the slots, possibly reading further rows;
//! 3. the second `shape` call attaches the slots to their owners and builds
//!    the final value from the stored skeleton, without re-reading the row.

use std::collections::HashMap;
use std::sync::Arc;

use relshape_ir::{CompositeKey, Value};

use super::compiler::{read_values, CollectionNode, EntityNode, ShapeNode, ShaperProgram};
use super::materialized::{EntityRef, Materialized};
use crate::config::QueryTrackingBehavior;
use crate::error::{Error, Result};
use crate::execution::{DataReader, StateManager};

/// Decoded row before collections are attached.
#[derive(Debug, Clone)]
pub(crate) enum Partial {
    Null,
    Scalar(Value),
    Entity(EntityRef),
    Record(Vec<(String, Partial)>),
    /// Index of a slot in the result context.
    Collection(usize),
}

#[derive(Debug)]
pub(crate) struct Element {
    pub value: Partial,
    /// Slots of the element's own collections.
    pub nested: Vec<usize>,
}

/// A collection being loaded for one parent.
#[derive(Debug)]
pub(crate) struct Slot {
    pub collection_id: usize,
    /// Entity and navigation the finished collection is attached to.
    pub owner: Option<(EntityRef, String)>,
    pub parent_key: CompositeKey,
    pub elements: Vec<Element>,
    seen: HashMap<CompositeKey, usize>,
}

/// Per-row scratch state, cleared before every row.
#[derive(Debug, Default)]
pub struct ResultContext {
    pub(crate) values: Option<Partial>,
    pub(crate) slots: Vec<Slot>,
    /// Slots allocated directly by the top-level value.
    pub(crate) pending: Vec<usize>,
}

impl ResultContext {
    pub fn clear(&mut self) {
        self.values = None;
        self.slots.clear();
        self.pending.clear();
    }

    /// Whether the current row has been decoded.
    pub fn has_values(&self) -> bool {
        self.values.is_some()
    }

    pub(crate) fn slot(&self, index: usize) -> Result<&Slot> {
        self.slots
            .get(index)
            .ok_or_else(|| Error::InvalidShaper(format!("unknown slot {index}")))
    }

    fn slot_mut(&mut self, index: usize) -> Result<&mut Slot> {
        self.slots
            .get_mut(index)
            .ok_or_else(|| Error::InvalidShaper(format!("unknown slot {index}")))
    }
}

/// Where entity identities are resolved for one enumeration.
pub(crate) enum IdentityScope {
    /// Every occurrence is a new instance.
    Disabled,
    /// Local identity map owned by the enumeration.
    Local(HashMap<(String, CompositeKey), EntityRef>),
    /// Entities are resolved against and registered with a state manager.
    Tracked(Arc<dyn StateManager>),
}

impl IdentityScope {
    pub fn new(tracking: QueryTrackingBehavior, state_manager: &Arc<dyn StateManager>) -> Self {
        match tracking {
            QueryTrackingBehavior::TrackAll => {
                state_manager.initialize(true);
                IdentityScope::Tracked(Arc::clone(state_manager))
            }
            QueryTrackingBehavior::NoTrackingWithIdentityResolution => {
                IdentityScope::Local(HashMap::new())
            }
            QueryTrackingBehavior::NoTracking => IdentityScope::Disabled,
        }
    }

    fn lookup(&self, entity_type: &str, key: &CompositeKey) -> Option<EntityRef> {
        match self {
            IdentityScope::Disabled => None,
            IdentityScope::Local(map) => map.get(&(entity_type.to_string(), key.clone())).cloned(),
            IdentityScope::Tracked(state_manager) => state_manager.try_get(entity_type, key),
        }
    }

    fn register(&mut self, entity: &EntityRef) {
        match self {
            IdentityScope::Disabled => {}
            IdentityScope::Local(map) => {
                map.insert(
                    (entity.entity_type().to_string(), entity.identity_key()),
                    entity.clone(),
                );
            }
            IdentityScope::Tracked(state_manager) => state_manager.start_tracking(entity),
        }
    }
}

impl std::fmt::Debug for IdentityScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityScope::Disabled => f.write_str("Disabled"),
            IdentityScope::Local(map) => write!(f, "Local({} entities)", map.len()),
            IdentityScope::Tracked(_) => f.write_str("Tracked"),
        }
    }
}

/// Shaping state owned by one enumeration.
#[derive(Debug)]
pub struct ShapingState {
    pub(crate) context: ResultContext,
    pub(crate) identity: IdentityScope,
}

impl ShapingState {
    pub(crate) fn new(identity: IdentityScope) -> Self {
        Self {
            context: ResultContext::default(),
            identity,
        }
    }

    pub fn context(&self) -> &ResultContext {
        &self.context
    }

    /// Decode `node` from the current row, allocating slots into `pending`.
    pub(crate) fn decode(
        &mut self,
        program: &ShaperProgram,
        node: &ShapeNode,
        reader: &dyn DataReader,
        pending: &mut Vec<usize>,
    ) -> Result<Partial> {
        match node {
            ShapeNode::Scalar(binding) => Ok(match binding.read(reader)? {
                Value::Null => Partial::Null,
                value => Partial::Scalar(value),
            }),
            ShapeNode::Entity(entity) => self.decode_entity(program, entity, reader, pending),
            ShapeNode::Collection(collection_id) => {
                let slot = self.allocate(program.collection(*collection_id)?, None, reader)?;
                pending.push(slot);
                Ok(Partial::Collection(slot))
            }
            ShapeNode::Record(members) => members
                .iter()
                .map(|(name, member)| {
                    Ok((name.clone(), self.decode(program, member, reader, pending)?))
                })
                .collect::<Result<Vec<_>>>()
                .map(Partial::Record),
        }
    }

    fn decode_entity(
        &mut self,
        program: &ShaperProgram,
        node: &EntityNode,
        reader: &dyn DataReader,
        pending: &mut Vec<usize>,
    ) -> Result<Partial> {
        let key = read_values(&node.key, reader)?;
        if key.iter().all(Value::is_null) {
            return if node.nullable {
                Ok(Partial::Null)
            } else {
                Err(node.key[0].null_error())
            };
        }
        if let Some(position) = key.iter().position(Value::is_null) {
            return Err(node.key[position].null_error());
        }

        let identity = CompositeKey::from_values(&key);
        let entity = match self.identity.lookup(&node.entity_type, &identity) {
            Some(existing) => existing,
            None => {
                let fields = node
                    .properties
                    .iter()
                    .map(|(name, binding)| Ok((name.clone(), binding.read(reader)?)))
                    .collect::<Result<Vec<_>>>()?;
                let entity = EntityRef::new(node.entity_type.clone(), key, fields);
                self.identity.register(&entity);
                entity
            }
        };

        for (name, target) in &node.references {
            let value = match self.decode_entity(program, target, reader, pending)? {
                Partial::Entity(reference) => Materialized::Entity(reference),
                _ => Materialized::Null,
            };
            entity.set_navigation(name, value);
        }
        for (name, collection_id) in &node.collections {
            let owner = Some((entity.clone(), name.clone()));
            let slot = self.allocate(program.collection(*collection_id)?, owner, reader)?;
            pending.push(slot);
        }
        Ok(Partial::Entity(entity))
    }

    fn allocate(
        &mut self,
        collection: &CollectionNode,
        owner: Option<(EntityRef, String)>,
        reader: &dyn DataReader,
    ) -> Result<usize> {
        let parent_key =
            CompositeKey::from_values(&read_values(&collection.parent_identifier, reader)?);
        self.context.slots.push(Slot {
            collection_id: collection.collection_id,
            owner,
            parent_key,
            elements: Vec::new(),
            seen: HashMap::new(),
        });
        Ok(self.context.slots.len() - 1)
    }

    /// Add the element on the current row to `slot`.
    ///
    /// Returns the element's position, or `None` when the row carries no
    /// element (all-null identifier of an outer-joined collection). An element
    /// already seen is not decoded again.
    pub(crate) fn add_element(
        &mut self,
        program: &ShaperProgram,
        slot: usize,
        collection: &CollectionNode,
        reader: &dyn DataReader,
    ) -> Result<Option<usize>> {
        let key = CompositeKey::from_values(&read_values(&collection.child_identifier, reader)?);
        if key.is_all_null() {
            return Ok(None);
        }
        if let Some(&position) = self.context.slot(slot)?.seen.get(&key) {
            return Ok(Some(position));
        }

        let mut nested = Vec::new();
        let value = self.decode(program, &collection.element, reader, &mut nested)?;
        let target = self.context.slot_mut(slot)?;
        target.elements.push(Element { value, nested });
        let position = target.elements.len() - 1;
        target.seen.insert(key, position);
        Ok(Some(position))
    }

    /// Nested slots of an element.
    pub(crate) fn nested_slots(&self, slot: usize, element: usize) -> Result<Vec<usize>> {
        self.context
            .slot(slot)?
            .elements
            .get(element)
            .map(|e| e.nested.clone())
            .ok_or_else(|| {
                Error::InvalidShaper(format!("unknown element {element} in slot {slot}"))
            })
    }

    fn materialize(&self, partial: &Partial) -> Materialized {
        match partial {
            Partial::Null => Materialized::Null,
            Partial::Scalar(value) => Materialized::Scalar(value.clone()),
            Partial::Entity(entity) => Materialized::Entity(entity.clone()),
            Partial::Record(members) => Materialized::Record(
                members
                    .iter()
                    .map(|(name, member)| (name.clone(), self.materialize(member)))
                    .collect(),
            ),
            Partial::Collection(slot) => self.collection(*slot),
        }
    }

    fn collection(&self, slot: usize) -> Materialized {
        let items = self
            .context
            .slots
            .get(slot)
            .map(|s| s.elements.iter().map(|e| self.materialize(&e.value)).collect())
            .unwrap_or_default();
        Materialized::Collection(items)
    }

    /// Attach every loaded collection to its owner and build the final value.
    fn finish(&self) -> Result<Materialized> {
        let values = self
            .context
            .values
            .as_ref()
            .ok_or_else(|| Error::InvalidShaper("no decoded row to finish".into()))?;
        for (index, slot) in self.context.slots.iter().enumerate() {
            if let Some((owner, navigation)) = &slot.owner {
                owner.set_navigation(navigation, self.collection(index));
            }
        }
        Ok(self.materialize(values))
    }
}

/// The compiled row-shaping procedure.
#[derive(Debug, Clone)]
pub struct RowShaper {
    program: Arc<ShaperProgram>,
}

impl RowShaper {
    /// Create a new row shaper over a compiled program.
    pub fn new(program: Arc<ShaperProgram>) -> Self {
        Self { program }
    }

    pub fn program(&self) -> &Arc<ShaperProgram> {
        &self.program
    }

    /// Shape the current row.
    ///
    /// The first call for a row decodes it and returns a preliminary value in
    /// which collections are still empty. The next call, made after related
    /// data was loaded, returns the final value.
    pub fn shape(&self, state: &mut ShapingState, reader: &dyn DataReader) -> Result<Materialized> {
        if state.context.values.is_some() {
            return state.finish();
        }
        let mut pending = Vec::new();
        let partial = state.decode(&self.program, self.program.root(), reader, &mut pending)?;
        let preliminary = state.materialize(&partial);
        state.context.values = Some(partial);
        state.context.pending = pending;
        Ok(preliminary)
    }
}
