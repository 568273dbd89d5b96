//! Static model of entities, their tables and how they relate.
//!
//! A model replaces runtime relationship introspection with tables built once at
//! registration time: `(entity, relationship) -> (child entity, foreign key)` and
//! `(hierarchy root, discriminator) -> concrete entity`.

use crate::error::AppError;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Name of the implicit primary key column of every table.
pub const PK: &str = "id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnKind {
    Id,
    Int,
    Decimal,
    Text,
    Bool,
}

impl ColumnKind {
    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnKind::Int | ColumnKind::Decimal)
    }
}

#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: String,
    pub kind: ColumnKind,
    pub default: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct RelationshipDef {
    pub name: String,
    pub target: String,
    pub foreign_key: String,
}

/// Table and column holding a foreign key, indexed by storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ForeignKeyDef {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone)]
pub struct EntityDef {
    pub name: String,
    pub table: String,
    pub columns: Vec<ColumnDef>,
    pub inherits: Option<String>,
    pub polymorphic_on: Option<String>,
    pub polymorphic_identity: Option<String>,
    pub relationships: Vec<RelationshipDef>,
}

impl EntityDef {
    pub fn new(name: &str, table: &str) -> Self {
        EntityDef {
            name: name.to_string(),
            table: table.to_string(),
            columns: Vec::new(),
            inherits: None,
            polymorphic_on: None,
            polymorphic_identity: None,
            relationships: Vec::new(),
        }
    }

    pub fn column(mut self, name: &str, kind: ColumnKind) -> Self {
        self.columns.push(ColumnDef { name: name.to_string(), kind, default: None });
        self
    }

    pub fn column_with_default(mut self, name: &str, kind: ColumnKind, default: impl Into<Value>) -> Self {
        self.columns.push(ColumnDef { name: name.to_string(), kind, default: Some(default.into()) });
        self
    }

    /// Joined-table inheritance: rows of this entity also live in `base`'s tables.
    pub fn inherits(mut self, base: &str) -> Self {
        self.inherits = Some(base.to_string());
        self
    }

    /// Declares the discriminator column, only valid on a hierarchy root.
    pub fn polymorphic_on(mut self, column: &str) -> Self {
        self.polymorphic_on = Some(column.to_string());
        self
    }

    pub fn identity(mut self, discriminator: &str) -> Self {
        self.polymorphic_identity = Some(discriminator.to_string());
        self
    }

    pub fn has_many(mut self, name: &str, target: &str, foreign_key: &str) -> Self {
        self.relationships.push(RelationshipDef {
            name: name.to_string(),
            target: target.to_string(),
            foreign_key: foreign_key.to_string(),
        });
        self
    }

    pub fn own_column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Entity definition submitted through `inventory`, picked up by `ModelBuilder::collect`.
pub struct EntityInfo {
    pub define: fn() -> EntityDef,
}

inventory::collect!(EntityInfo);

#[derive(Default)]
pub struct ModelBuilder {
    entities: Vec<EntityDef>,
}

impl ModelBuilder {
    pub fn entity(mut self, def: EntityDef) -> Self {
        self.entities.push(def);
        self
    }

    pub fn collect(mut self) -> Self {
        for info in inventory::iter::<EntityInfo> {
            self.entities.push((info.define)());
        }
        self
    }

    pub fn build(self) -> Result<Model, AppError> {
        let mut entities: BTreeMap<String, EntityDef> = BTreeMap::new();
        let mut tables = HashSet::new();
        for mut def in self.entities {
            if def.name.is_empty() || def.table.is_empty() {
                return Err(AppError::Schema("entity and table names must not be empty".to_string()));
            }
            if !tables.insert(def.table.clone()) {
                return Err(AppError::Schema(format!("table {} is declared twice", def.table)));
            }
            let mut seen = HashSet::new();
            for column in &def.columns {
                if column.name == PK {
                    return Err(AppError::Schema(format!("{}: column '{}' is reserved for the primary key", def.name, PK)));
                }
                if !seen.insert(column.name.clone()) {
                    return Err(AppError::Schema(format!("{}: column {} is declared twice", def.name, column.name)));
                }
                if let Some(default) = &column.default {
                    if !default.fits(column.kind) || matches!(default, Value::Ref(_)) {
                        return Err(AppError::Schema(format!("{}.{}: default {} does not fit {:?}", def.name, column.name, default, column.kind)));
                    }
                }
            }
            if let Some(discriminator) = def.polymorphic_on.clone() {
                match def.own_column(&discriminator) {
                    None => def.columns.push(ColumnDef { name: discriminator, kind: ColumnKind::Text, default: None }),
                    Some(c) if c.kind != ColumnKind::Text => {
                        return Err(AppError::Schema(format!("{}: discriminator {} must be a text column", def.name, c.name)));
                    }
                    Some(_) => {}
                }
            }
            let name = def.name.clone();
            if entities.insert(name.clone(), def).is_some() {
                return Err(AppError::Schema(format!("entity {} is declared twice", name)));
            }
        }

        let mut model = Model { entities, identities: HashMap::new() };
        model.validate_hierarchies()?;
        model.validate_relationships()?;
        Ok(model)
    }
}

#[derive(Debug, Clone)]
pub struct Model {
    entities: BTreeMap<String, EntityDef>,
    identities: HashMap<(String, String), String>,
}

impl Model {
    pub fn builder() -> ModelBuilder {
        ModelBuilder::default()
    }

    /// Builds a model out of every `EntityInfo` submitted in the binary.
    pub fn collect() -> Result<Model, AppError> {
        ModelBuilder::default().collect().build()
    }

    fn validate_hierarchies(&mut self) -> Result<(), AppError> {
        for def in self.entities.values() {
            let mut depth = 0;
            let mut current = def;
            while let Some(base) = &current.inherits {
                depth += 1;
                if depth > self.entities.len() {
                    return Err(AppError::Schema(format!("{}: inheritance cycle", def.name)));
                }
                current = self.entities.get(base)
                    .ok_or_else(|| AppError::Schema(format!("{} inherits unknown entity {}", def.name, base)))?;
            }
            if def.inherits.is_some() && def.polymorphic_on.is_some() {
                return Err(AppError::Schema(format!("{}: only a hierarchy root may declare a discriminator", def.name)));
            }
        }

        let mut identities = HashMap::new();
        for def in self.entities.values() {
            let lineage = self.lineage(&def.name)?;
            let root = lineage[0];
            if def.inherits.is_some() {
                if root.polymorphic_on.is_none() {
                    return Err(AppError::Schema(format!("{}: root {} declares no discriminator", def.name, root.name)));
                }
                if def.polymorphic_identity.is_none() {
                    return Err(AppError::Schema(format!("{}: subtype needs a polymorphic identity", def.name)));
                }
            }
            if let Some(identity) = &def.polymorphic_identity {
                if root.polymorphic_on.is_none() {
                    return Err(AppError::Schema(format!("{}: identity without a discriminator on {}", def.name, root.name)));
                }
                let key = (root.name.clone(), identity.clone());
                if let Some(other) = identities.insert(key, def.name.clone()) {
                    return Err(AppError::Schema(format!("{} and {} share the identity '{}'", other, def.name, identity)));
                }
            }
            let mut columns = HashSet::new();
            for ancestor in &lineage {
                for column in &ancestor.columns {
                    if !columns.insert(column.name.as_str()) {
                        return Err(AppError::Schema(format!("{}: column {} shadows an inherited column", def.name, column.name)));
                    }
                }
            }
        }
        self.identities = identities;
        Ok(())
    }

    fn validate_relationships(&self) -> Result<(), AppError> {
        for def in self.entities.values() {
            let mut names = HashSet::new();
            for ancestor in self.lineage(&def.name)? {
                for rel in &ancestor.relationships {
                    if !names.insert(rel.name.as_str()) {
                        return Err(AppError::Schema(format!("{}: relationship {} is declared twice", def.name, rel.name)));
                    }
                }
            }
            for rel in &def.relationships {
                let target = self.entities.get(&rel.target)
                    .ok_or_else(|| AppError::Schema(format!("{}.{} targets unknown entity {}", def.name, rel.name, rel.target)))?;
                let (_, fk) = self.column(&target.name, &rel.foreign_key)?;
                if fk.kind != ColumnKind::Id {
                    return Err(AppError::Schema(format!("{}.{} must be an id column", target.name, fk.name)));
                }
            }
        }
        Ok(())
    }

    pub fn entity(&self, name: &str) -> Result<&EntityDef, AppError> {
        self.entities.get(name).ok_or_else(|| AppError::UnknownEntity(name.to_string()))
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityDef> {
        self.entities.values()
    }

    /// Definitions from the hierarchy root down to `name`.
    pub fn lineage(&self, name: &str) -> Result<Vec<&EntityDef>, AppError> {
        let mut current = self.entity(name)?;
        let mut chain = vec![current];
        while let Some(base) = &current.inherits {
            current = self.entity(base)?;
            chain.push(current);
        }
        chain.reverse();
        Ok(chain)
    }

    pub fn root_of(&self, name: &str) -> Result<&EntityDef, AppError> {
        Ok(self.lineage(name)?[0])
    }

    /// True when `name` is `ancestor` or inherits from it.
    pub fn is_a(&self, name: &str, ancestor: &str) -> bool {
        self.lineage(name)
            .map(|chain| chain.iter().any(|d| d.name == ancestor))
            .unwrap_or(false)
    }

    /// Every entity sharing the hierarchy root of `name`.
    pub fn hierarchy_of(&self, name: &str) -> Result<Vec<&EntityDef>, AppError> {
        let root = self.root_of(name)?.name.clone();
        Ok(self.entities
            .values()
            .filter(|d| self.root_of(&d.name).map(|r| r.name == root).unwrap_or(false))
            .collect())
    }

    /// Finds the definition in `entity`'s lineage that owns `column`.
    pub fn column(&self, entity: &str, column: &str) -> Result<(&EntityDef, &ColumnDef), AppError> {
        for def in self.lineage(entity)? {
            if let Some(c) = def.own_column(column) {
                return Ok((def, c));
            }
        }
        Err(AppError::unknown_column(entity, column))
    }

    pub fn relationship(&self, entity: &str, name: &str) -> Result<(&EntityDef, &RelationshipDef), AppError> {
        for def in self.lineage(entity)? {
            if let Some(rel) = def.relationships.iter().find(|r| r.name == name) {
                return Ok((def, rel));
            }
        }
        Err(AppError::UnknownRelationship { entity: entity.to_string(), relationship: name.to_string() })
    }

    /// Discriminator-keyed lookup of the concrete entity stored under `root`.
    /// A null discriminator designates the root itself when the root has no identity.
    pub fn resolve_identity(&self, root: &str, discriminator: &Value) -> Option<&EntityDef> {
        match discriminator {
            Value::Text(identity) => self.identities
                .get(&(root.to_string(), identity.clone()))
                .and_then(|name| self.entities.get(name)),
            Value::Null => self.entities.get(root).filter(|d| d.polymorphic_identity.is_none()),
            _ => None,
        }
    }

    /// Discriminator column and value to store for rows of `entity`.
    pub fn discriminator_for(&self, entity: &str) -> Result<Option<(String, Value)>, AppError> {
        let def = self.entity(entity)?;
        let root = self.root_of(entity)?;
        Ok(root.polymorphic_on.as_ref().map(|column| {
            let value = def.polymorphic_identity.clone().map(Value::Text).unwrap_or(Value::Null);
            (column.clone(), value)
        }))
    }

    pub fn foreign_keys(&self) -> Vec<ForeignKeyDef> {
        let mut fks: Vec<ForeignKeyDef> = self.entities
            .values()
            .flat_map(|def| def.relationships.iter())
            .filter_map(|rel| {
                self.column(&rel.target, &rel.foreign_key)
                    .ok()
                    .map(|(owner, _)| ForeignKeyDef { table: owner.table.clone(), column: rel.foreign_key.clone() })
            })
            .collect();
        fks.sort();
        fks.dedup();
        fks
    }
}
