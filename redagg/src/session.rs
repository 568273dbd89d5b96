use crate::error::AppError;
use crate::executor::RecomputeReport;
use crate::maintainer::{AggregateMaintainer, Drift};
use crate::observer::{ChangeEvent, ParentKey, PendingRecomputes};
use crate::schema::Model;
use crate::storage::entity::EntityWriter;
use crate::storage::init::Storage;
use crate::value::{Id, InstanceId, Row, Value};
use crate::debug;
use redb::WriteTransaction;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InstanceState {
    New,
    Persistent,
    Deleted,
    Gone,
}

#[derive(Debug)]
struct Instance {
    entity: String,
    id: Option<Id>,
    row: Row,
    dirty: BTreeSet<String>,
    state: InstanceState,
}

/// Unit of work over a single write transaction.
///
/// Mutations are buffered on in-memory instances and reported to the maintainer as they
/// happen. `flush` writes them, then recomputes the affected aggregates in the same
/// transaction, so `commit` and `rollback` cover the aggregate writes too.
pub struct Session<'s> {
    storage: &'s Storage,
    maintainer: &'s AggregateMaintainer,
    tx: Option<WriteTransaction>,
    instances: Vec<Instance>,
    identity_map: HashMap<(String, Id), InstanceId>,
    pending: PendingRecomputes,
}

impl<'s> Session<'s> {
    pub fn begin(storage: &'s Storage, maintainer: &'s AggregateMaintainer) -> Result<Self, AppError> {
        Ok(Session {
            storage,
            maintainer,
            tx: Some(storage.begin_write()?),
            instances: Vec::new(),
            identity_map: HashMap::new(),
            pending: PendingRecomputes::new(),
        })
    }

    fn model(&self) -> &'s Model {
        self.storage.model()
    }

    fn ensure_open(&self) -> Result<&WriteTransaction, AppError> {
        self.tx.as_ref().ok_or(AppError::SessionClosed)
    }

    fn instance(&self, handle: InstanceId) -> Result<&Instance, AppError> {
        self.instances
            .get(handle.0 as usize)
            .filter(|i| matches!(i.state, InstanceState::New | InstanceState::Persistent))
            .ok_or(AppError::UnknownInstance(handle))
    }

    /// Checks that `column` may be assigned `value` on `entity`.
    fn check_assignment(&self, entity: &str, column: &str, value: &Value) -> Result<(), AppError> {
        let model = self.model();
        let (owner, def) = model.column(entity, column)?;
        if owner.polymorphic_on.as_deref() == Some(column) {
            return Err(AppError::Custom(format!("{}.{} is the discriminator and cannot be assigned", entity, column)));
        }
        if self.maintainer.registry().is_target(&owner.table, column) {
            return Err(AppError::Custom(format!("{}.{} is a maintained aggregate and cannot be assigned", entity, column)));
        }
        if !value.fits(def.kind) {
            return Err(AppError::TypeMismatch { column: column.to_string(), expected: def.kind, found: format!("{} {}", value.kind_name(), value) });
        }
        if let Value::Ref(handle) = value {
            self.instance(*handle)?;
        }
        Ok(())
    }

    fn emit(&mut self, event: ChangeEvent) -> Result<(), AppError> {
        self.maintainer.observe(&event, &mut self.pending)
    }

    fn key_of(&self, handle: InstanceId) -> ParentKey {
        match self.instances[handle.0 as usize].id {
            Some(id) => ParentKey::Id(id),
            None => ParentKey::Instance(handle),
        }
    }

    /// Adds a new instance. Columns missing from `row` take their column default or null.
    pub fn add(&mut self, entity: &str, row: Row) -> Result<InstanceId, AppError> {
        self.ensure_open()?;
        for (column, value) in &row {
            self.check_assignment(entity, column, value)?;
        }
        let model = self.model();
        let mut full = Row::new();
        for def in model.lineage(entity)? {
            for column in &def.columns {
                let value = row.get(&column.name).cloned()
                    .or_else(|| column.default.clone())
                    .unwrap_or(Value::Null);
                full.insert(column.name.clone(), value);
            }
        }
        if let Some((column, discriminator)) = model.discriminator_for(entity)? {
            full.insert(column, discriminator);
        }

        let handle = InstanceId(self.instances.len() as u32);
        self.instances.push(Instance {
            entity: entity.to_string(),
            id: None,
            row: full.clone(),
            dirty: BTreeSet::new(),
            state: InstanceState::New,
        });
        self.emit(ChangeEvent::Inserted { entity: entity.to_string(), key: ParentKey::Instance(handle), row: full })?;
        Ok(handle)
    }

    /// Instance of `entity` with the given id, loaded through the identity map.
    pub fn get(&mut self, entity: &str, id: Id) -> Result<Option<InstanceId>, AppError> {
        let tx = self.ensure_open()?;
        let model = self.model();
        let root = model.root_of(entity)?.name.clone();
        if let Some(handle) = self.identity_map.get(&(root.clone(), id)) {
            let instance = &self.instances[handle.0 as usize];
            let live = matches!(instance.state, InstanceState::New | InstanceState::Persistent);
            return Ok(Some(*handle).filter(|_| live && model.is_a(&instance.entity, entity)));
        }

        let Some(loaded) = EntityWriter::new(self.storage, tx).reader().load(&root, id)? else {
            return Ok(None);
        };
        let handle = InstanceId(self.instances.len() as u32);
        let matches = model.is_a(&loaded.entity, entity);
        self.instances.push(Instance {
            entity: loaded.entity,
            id: Some(id),
            row: loaded.row,
            dirty: BTreeSet::new(),
            state: InstanceState::Persistent,
        });
        self.identity_map.insert((root, id), handle);
        Ok(Some(handle).filter(|_| matches))
    }

    pub fn set(&mut self, handle: InstanceId, column: &str, value: impl Into<Value>) -> Result<(), AppError> {
        self.ensure_open()?;
        let value = value.into();
        let entity = self.instance(handle)?.entity.clone();
        self.check_assignment(&entity, column, &value)?;

        let key = self.key_of(handle);
        let instance = &mut self.instances[handle.0 as usize];
        if instance.row.get(column) == Some(&value) {
            return Ok(());
        }
        let old = instance.row.clone();
        instance.row.insert(column.to_string(), value);
        instance.dirty.insert(column.to_string());
        let new = instance.row.clone();
        self.emit(ChangeEvent::Updated { entity, key, old, new })
    }

    pub fn delete(&mut self, handle: InstanceId) -> Result<(), AppError> {
        self.ensure_open()?;
        self.instance(handle)?;
        let key = self.key_of(handle);
        let instance = &mut self.instances[handle.0 as usize];
        instance.state = match instance.state {
            InstanceState::New => InstanceState::Gone,
            _ => InstanceState::Deleted,
        };
        let event = ChangeEvent::Deleted { entity: instance.entity.clone(), key, row: instance.row.clone() };
        self.emit(event)
    }

    pub fn value(&self, handle: InstanceId, column: &str) -> Result<Value, AppError> {
        let instance = self.instance(handle)?;
        instance.row.get(column).cloned().ok_or_else(|| AppError::unknown_column(&instance.entity, column))
    }

    /// Id of the instance, assigned at the first flush after `add`.
    pub fn id(&self, handle: InstanceId) -> Result<Option<Id>, AppError> {
        Ok(self.instance(handle)?.id)
    }

    pub fn entity(&self, handle: InstanceId) -> Result<&str, AppError> {
        Ok(&self.instance(handle)?.entity)
    }

    pub fn row(&self, handle: InstanceId) -> Result<&Row, AppError> {
        Ok(&self.instance(handle)?.row)
    }

    /// Writes buffered mutations and recomputes the affected aggregates. Any error aborts
    /// the transaction and closes the session.
    pub fn flush(&mut self) -> Result<RecomputeReport, AppError> {
        self.ensure_open()?;
        self.guard(|session| session.write_and_recompute())
    }

    /// Recomputes every aggregate of one parent after writes that bypassed the session.
    pub fn recompute_parent(&mut self, entity: &str, id: Id) -> Result<RecomputeReport, AppError> {
        self.flush()?;
        self.guard(|session| {
            let tx = session.ensure_open()?;
            let mut writer = EntityWriter::new(session.storage, tx);
            let report = session.maintainer.recompute_parent(&mut writer, entity, id)?;
            session.refresh(&report);
            Ok(report)
        })
    }

    pub fn recompute_all(&mut self, entity: &str) -> Result<RecomputeReport, AppError> {
        self.flush()?;
        self.guard(|session| {
            let tx = session.ensure_open()?;
            let mut writer = EntityWriter::new(session.storage, tx);
            let report = session.maintainer.recompute_all(&mut writer, entity)?;
            session.refresh(&report);
            Ok(report)
        })
    }

    /// Stored aggregates of one parent that disagree with the flushed child rows.
    pub fn verify(&mut self, entity: &str, id: Id) -> Result<Vec<Drift>, AppError> {
        self.flush()?;
        let tx = self.ensure_open()?;
        self.maintainer.verify(&EntityWriter::new(self.storage, tx).reader(), entity, id)
    }

    pub fn commit(mut self) -> Result<(), AppError> {
        self.flush()?;
        let tx = self.tx.take().ok_or(AppError::SessionClosed)?;
        tx.commit()?;
        debug!("committed session with {} instances", self.instances.len());
        Ok(())
    }

    pub fn rollback(mut self) -> Result<(), AppError> {
        let tx = self.tx.take().ok_or(AppError::SessionClosed)?;
        tx.abort()?;
        Ok(())
    }

    fn guard<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, AppError>) -> Result<T, AppError> {
        match f(self) {
            Ok(value) => Ok(value),
            Err(err) => {
                if let Some(tx) = self.tx.take() {
                    if let Err(abort_err) = tx.abort() {
                        crate::error!("Aborting failed flush: {}", abort_err);
                    }
                }
                Err(err)
            }
        }
    }

    fn write_and_recompute(&mut self) -> Result<RecomputeReport, AppError> {
        let tx = self.tx.as_ref().ok_or(AppError::SessionClosed)?;
        let model = self.storage.model();
        let mut writer = EntityWriter::new(self.storage, tx);

        for instance in self.instances.iter_mut().filter(|i| i.state == InstanceState::New) {
            instance.id = Some(writer.next_id(&instance.entity)?);
        }
        for (index, instance) in self.instances.iter().enumerate() {
            if let (InstanceState::New, Some(id)) = (instance.state, instance.id) {
                let root = model.root_of(&instance.entity)?.name.clone();
                self.identity_map.insert((root, id), InstanceId(index as u32));
            }
        }

        let ids: Vec<Option<Id>> = self.instances.iter().map(|i| i.id).collect();
        let resolve = |value: &Value| -> Result<Value, AppError> {
            match value {
                Value::Ref(handle) => ids
                    .get(handle.0 as usize)
                    .copied()
                    .flatten()
                    .map(Value::Id)
                    .ok_or(AppError::UnknownInstance(*handle)),
                other => Ok(other.clone()),
            }
        };

        let mut written = 0usize;
        for instance in self.instances.iter_mut() {
            let id = match instance.id {
                Some(id) => id,
                None => continue,
            };
            match instance.state {
                InstanceState::New => {
                    for value in instance.row.values_mut() {
                        *value = resolve(value)?;
                    }
                    writer.insert(&instance.entity, id, &instance.row)?;
                    instance.state = InstanceState::Persistent;
                    instance.dirty.clear();
                    written += 1;
                }
                InstanceState::Persistent if !instance.dirty.is_empty() => {
                    let mut changes = Row::new();
                    for column in std::mem::take(&mut instance.dirty) {
                        let value = resolve(instance.row.get(&column).unwrap_or(&Value::Null))?;
                        instance.row.insert(column.clone(), value.clone());
                        changes.insert(column, value);
                    }
                    writer.update(&instance.entity, id, &changes)?;
                    written += 1;
                }
                InstanceState::Deleted => {
                    writer.delete(&instance.entity, id)?;
                    instance.state = InstanceState::Gone;
                    written += 1;
                }
                _ => {}
            }
        }

        let pending = std::mem::take(&mut self.pending).resolve(|handle| ids.get(handle.0 as usize).copied().flatten());
        debug!("flushing {} rows, {} aggregate recomputes", written, pending.len());
        let report = self.maintainer.flush(&mut writer, pending)?;
        self.refresh(&report);
        Ok(report)
    }

    /// Copies recomputed values into the live instances they belong to.
    fn refresh(&mut self, report: &RecomputeReport) {
        let model = self.storage.model();
        for w in &report.written {
            let Ok(root) = model.root_of(&w.entity) else { continue };
            if let Some(handle) = self.identity_map.get(&(root.name.clone(), w.id)) {
                let instance = &mut self.instances[handle.0 as usize];
                if !instance.dirty.contains(&w.column) {
                    instance.row.insert(w.column.clone(), w.value.clone());
                }
            }
        }
    }
}
