use crate::error::AppError;
use crate::registry::{AggregateRegistry, RegisteredAggregate, SpecId};
use crate::value::{Id, InstanceId, Row, Value};
use crate::debug;
use std::collections::BTreeSet;

/// Identity of a parent: its id once persisted, its session handle before that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParentKey {
    Id(Id),
    Instance(InstanceId),
}

impl ParentKey {
    fn from_value(value: Option<&Value>) -> Option<ParentKey> {
        match value {
            Some(Value::Id(id)) => Some(ParentKey::Id(*id)),
            Some(Value::Ref(inst)) => Some(ParentKey::Instance(*inst)),
            _ => None,
        }
    }
}

/// Mutation of one entity instance as reported by the unit of work.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Inserted { entity: String, key: ParentKey, row: Row },
    Updated { entity: String, key: ParentKey, old: Row, new: Row },
    Deleted { entity: String, key: ParentKey, row: Row },
}

impl ChangeEvent {
    pub fn entity(&self) -> &str {
        match self {
            ChangeEvent::Inserted { entity, .. } | ChangeEvent::Updated { entity, .. } | ChangeEvent::Deleted { entity, .. } => entity,
        }
    }
}

/// Parents scheduled for recompute in one unit of work. A set, so repeated
/// mutations of the same parent collapse into one recompute.
#[derive(Debug, Default, Clone)]
pub struct PendingRecomputes {
    pairs: BTreeSet<(ParentKey, SpecId)>,
}

impl PendingRecomputes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, parent: ParentKey, spec: SpecId) -> bool {
        self.pairs.insert((parent, spec))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn contains(&self, parent: ParentKey, spec: SpecId) -> bool {
        self.pairs.contains(&(parent, spec))
    }

    /// Consumes the set, mapping instance handles to the ids assigned at flush.
    /// Handles without an id belong to instances that never reached storage.
    pub fn resolve<F>(self, id_of: F) -> BTreeSet<(Id, SpecId)>
    where
        F: Fn(InstanceId) -> Option<Id>,
    {
        self.pairs
            .into_iter()
            .filter_map(|(parent, spec)| match parent {
                ParentKey::Id(id) => Some((id, spec)),
                ParentKey::Instance(inst) => {
                    let id = id_of(inst);
                    if id.is_none() {
                        debug!("dropping recompute of unpersisted instance {:?}", inst);
                    }
                    id.map(|id| (id, spec))
                }
            })
            .collect()
    }
}

/// Maps change events to the parents whose aggregates they affect.
pub struct ChangeObserver<'r> {
    registry: &'r AggregateRegistry,
}

impl<'r> ChangeObserver<'r> {
    pub fn new(registry: &'r AggregateRegistry) -> Self {
        ChangeObserver { registry }
    }

    pub fn observe(&self, event: &ChangeEvent, pending: &mut PendingRecomputes) -> Result<(), AppError> {
        let model = self.registry.model();
        model.entity(event.entity())?;

        for entry in self.registry.specs_for_child(event.entity()) {
            match event {
                ChangeEvent::Inserted { row, .. } | ChangeEvent::Deleted { row, .. } => {
                    Self::schedule(entry, row, pending);
                }
                ChangeEvent::Updated { old, new, .. } => {
                    if Self::touches(entry, old, new) {
                        Self::schedule(entry, old, pending);
                        Self::schedule(entry, new, pending);
                    }
                }
            }
        }

        // a freshly inserted parent starts from the empty-collection value
        if let ChangeEvent::Inserted { entity, key, .. } = event {
            for entry in self.registry.specs_for_concrete(entity) {
                pending.insert(*key, entry.id);
            }
        }
        Ok(())
    }

    fn schedule(entry: &RegisteredAggregate, row: &Row, pending: &mut PendingRecomputes) {
        if let Some(parent) = ParentKey::from_value(row.get(&entry.foreign_key)) {
            if pending.insert(parent, entry.id) {
                debug!("scheduled {}.{} for {:?}", entry.spec.parent, entry.spec.column, parent);
            }
        }
    }

    /// True when the update moves the child or changes the aggregated field.
    fn touches(entry: &RegisteredAggregate, old: &Row, new: &Row) -> bool {
        let changed = |column: &str| old.get(column) != new.get(column);
        changed(entry.foreign_key.as_str()) || entry.spec.aggregation.field().map(changed).unwrap_or(false)
    }
}
