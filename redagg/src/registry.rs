use crate::error::AppError;
use crate::expr::Aggregation;
use crate::schema::{ColumnKind, Model};
use crate::value::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Declaration of one aggregate column: `column = aggregation(parent.relationship)`.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSpec {
    pub parent: String,
    pub relationship: String,
    pub aggregation: Aggregation,
    pub column: String,
    pub default: Option<Value>,
}

impl AggregateSpec {
    pub fn builder(parent: &str) -> AggregateSpecBuilder {
        AggregateSpecBuilder { parent: parent.to_string(), ..Default::default() }
    }
}

#[derive(Default)]
pub struct AggregateSpecBuilder {
    parent: String,
    relationship: Option<String>,
    aggregation: Option<Aggregation>,
    column: Option<String>,
    default: Option<Value>,
}

impl AggregateSpecBuilder {
    pub fn relationship(mut self, name: &str) -> Self {
        self.relationship = Some(name.to_string());
        self
    }

    pub fn aggregate(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = Some(aggregation);
        self
    }

    pub fn column(mut self, name: &str) -> Self {
        self.column = Some(name.to_string());
        self
    }

    /// Value written when the aggregation yields null, e.g. zero for a sum over no rows.
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn build(self) -> Result<AggregateSpec, AppError> {
        let missing = |what: &str| AppError::Schema(format!("aggregate on {} is missing its {}", self.parent, what));
        Ok(AggregateSpec {
            relationship: self.relationship.clone().ok_or_else(|| missing("relationship"))?,
            aggregation: self.aggregation.clone().ok_or_else(|| missing("aggregation"))?,
            column: self.column.clone().ok_or_else(|| missing("target column"))?,
            parent: self.parent.clone(),
            default: self.default.clone(),
        })
    }
}

/// Aggregate declaration submitted through `inventory`, picked up by `AggregateRegistry::collect`.
pub struct AggregateInfo {
    pub define: fn() -> AggregateSpec,
}

inventory::collect!(AggregateInfo);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecId(pub usize);

/// An `AggregateSpec` validated against the model, with every lookup it needs precomputed.
#[derive(Debug, Clone)]
pub struct RegisteredAggregate {
    pub id: SpecId,
    pub spec: AggregateSpec,
    pub child: String,
    pub foreign_key: String,
    pub target_entity: String,
    pub target_table: String,
    pub target_kind: ColumnKind,
    pub column_default: Option<Value>,
}

impl RegisteredAggregate {
    /// Value to store when the aggregation result is null.
    pub fn fallback(&self) -> Value {
        self.spec.default.clone()
            .or_else(|| self.column_default.clone())
            .unwrap_or(Value::Null)
    }
}

pub struct AggregateRegistry {
    model: Arc<Model>,
    entries: Vec<RegisteredAggregate>,
    by_child: HashMap<String, Vec<SpecId>>,
    by_parent: HashMap<String, Vec<SpecId>>,
    targets: HashSet<(String, String)>,
}

impl AggregateRegistry {
    pub fn new(model: Arc<Model>) -> Self {
        AggregateRegistry {
            model,
            entries: Vec::new(),
            by_child: HashMap::new(),
            by_parent: HashMap::new(),
            targets: HashSet::new(),
        }
    }

    /// Registers every `AggregateInfo` submitted in the binary.
    pub fn collect(model: Arc<Model>) -> Result<Self, AppError> {
        let mut registry = AggregateRegistry::new(model);
        for info in inventory::iter::<AggregateInfo> {
            registry.register((info.define)())?;
        }
        Ok(registry)
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn register(&mut self, spec: AggregateSpec) -> Result<SpecId, AppError> {
        let model = &self.model;
        let (_, relationship) = model.relationship(&spec.parent, &spec.relationship)?;
        let (owner, target) = model.column(&spec.parent, &spec.column)?;

        let mut field_kind = None;
        if let Some(field) = spec.aggregation.field() {
            let (_, field_def) = model.column(&relationship.target, field)?;
            if !spec.aggregation.accepts(field_def.kind) {
                return Err(AppError::Schema(format!(
                    "{}.{}: {}({}) is not defined for {:?} values",
                    spec.parent, spec.column, spec.aggregation.name(), field, field_def.kind
                )));
            }
            field_kind = Some(field_def.kind);
        }
        if target.kind == ColumnKind::Id {
            return Err(AppError::Schema(format!("{}.{}: an id column cannot hold an aggregate", spec.parent, spec.column)));
        }
        if !spec.aggregation.writable_into(field_kind, target.kind) {
            return Err(AppError::Schema(format!(
                "{}.{}: {} yields {:?} values that a {:?} column cannot hold",
                spec.parent, spec.column, spec.aggregation.name(),
                spec.aggregation.result_kind(field_kind), target.kind
            )));
        }
        if let Some(default) = &spec.default {
            if !default.fits(target.kind) || matches!(default, Value::Ref(_)) {
                return Err(AppError::TypeMismatch {
                    column: spec.column.clone(),
                    expected: target.kind,
                    found: default.to_string(),
                });
            }
        }

        let target_key = (owner.table.clone(), spec.column.clone());
        if self.targets.contains(&target_key) {
            return Err(AppError::AmbiguousAggregate { table: target_key.0, column: target_key.1 });
        }

        let id = SpecId(self.entries.len());
        let entry = RegisteredAggregate {
            id,
            child: relationship.target.clone(),
            foreign_key: relationship.foreign_key.clone(),
            target_entity: owner.name.clone(),
            target_table: owner.table.clone(),
            target_kind: target.kind,
            column_default: target.default.clone(),
            spec,
        };
        self.by_child.entry(entry.child.clone()).or_default().push(id);
        self.by_parent.entry(entry.spec.parent.clone()).or_default().push(id);
        self.targets.insert(target_key);
        self.entries.push(entry);
        Ok(id)
    }

    /// True when `table.column` holds a maintained aggregate.
    pub fn is_target(&self, table: &str, column: &str) -> bool {
        self.targets.contains(&(table.to_string(), column.to_string()))
    }

    pub fn get(&self, id: SpecId) -> &RegisteredAggregate {
        &self.entries[id.0]
    }

    pub fn all(&self) -> &[RegisteredAggregate] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Specs aggregating over `entity`, including those declared for one of its base types.
    pub fn specs_for_child(&self, entity: &str) -> Vec<&RegisteredAggregate> {
        let Ok(lineage) = self.model.lineage(entity) else {
            return Vec::new();
        };
        lineage.iter()
            .filter_map(|def| self.by_child.get(&def.name))
            .flatten()
            .map(|id| self.get(*id))
            .collect()
    }

    /// Specs declared anywhere in `entity`'s hierarchy branch: on the entity, on its
    /// base types, or on any of its subtypes, so a row loaded as the base type still
    /// finds the aggregates of its concrete type.
    pub fn specs_for_parent(&self, entity: &str) -> Vec<&RegisteredAggregate> {
        let Ok(hierarchy) = self.model.hierarchy_of(entity) else {
            return Vec::new();
        };
        hierarchy.iter()
            .filter(|def| self.model.is_a(entity, &def.name) || self.model.is_a(&def.name, entity))
            .filter_map(|def| self.by_parent.get(&def.name))
            .flatten()
            .map(|id| self.get(*id))
            .collect()
    }

    /// Specs that hold for a row whose concrete type is `entity`.
    pub fn specs_for_concrete(&self, entity: &str) -> Vec<&RegisteredAggregate> {
        self.specs_for_parent(entity)
            .into_iter()
            .filter(|entry| self.model.is_a(entity, &entry.spec.parent))
            .collect()
    }
}
