use crate::error::AppError;
use crate::executor::{RecomputeExecutor, RecomputeReport};
use crate::observer::{ChangeEvent, ChangeObserver, PendingRecomputes};
use crate::registry::{AggregateRegistry, RegisteredAggregate, SpecId};
use crate::schema::{EntityDef, Model};
use crate::settings::MaintainerSettings;
use crate::store::{AggregateSource, AggregateStore};
use crate::value::{Id, Value};
use crate::info;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Stored aggregate value that disagrees with a fresh evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Drift {
    pub entity: String,
    pub id: Id,
    pub column: String,
    pub stored: Value,
    pub expected: Value,
}

impl fmt::Display for Drift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}.{} holds {} but should be {}", self.entity, self.id, self.column, self.stored, self.expected)
    }
}

/// Entry point of aggregate maintenance: the observer feeds it change events during a
/// unit of work, the flush hook hands it the resolved pending set.
pub struct AggregateMaintainer {
    registry: AggregateRegistry,
    settings: MaintainerSettings,
}

impl AggregateMaintainer {
    pub fn new(registry: AggregateRegistry, settings: MaintainerSettings) -> Self {
        AggregateMaintainer { registry, settings }
    }

    /// Maintainer over every aggregate submitted through `inventory`.
    pub fn collect(model: Arc<Model>, settings: MaintainerSettings) -> Result<Self, AppError> {
        let registry = AggregateRegistry::collect(model)?;
        info!("Maintaining {} aggregate columns", registry.all().len());
        Ok(AggregateMaintainer::new(registry, settings))
    }

    pub fn model(&self) -> &Arc<Model> {
        self.registry.model()
    }

    pub fn registry(&self) -> &AggregateRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &MaintainerSettings {
        &self.settings
    }

    fn executor(&self) -> RecomputeExecutor<'_> {
        RecomputeExecutor::new(&self.registry).skip_unchanged(self.settings.skip_unchanged)
    }

    pub fn observe(&self, event: &ChangeEvent, pending: &mut PendingRecomputes) -> Result<(), AppError> {
        ChangeObserver::new(&self.registry).observe(event, pending)
    }

    /// Flush hook: recomputes the resolved pending set inside the store's transaction.
    pub fn flush<S: AggregateStore>(&self, store: &mut S, pending: BTreeSet<(Id, SpecId)>) -> Result<RecomputeReport, AppError> {
        if pending.is_empty() {
            return Ok(RecomputeReport::default());
        }
        let pairs: Vec<(Id, SpecId)> = pending.iter().copied().collect();
        let report = self.executor().run(store, pending)?;
        if self.settings.verify_after_flush {
            for (id, spec_id) in pairs {
                let entry = self.registry.get(spec_id);
                if let Some(drift) = self.check(&*store, entry, id)? {
                    return Err(AppError::Corrupt(format!("aggregate out of sync after flush: {}", drift)));
                }
            }
        }
        Ok(report)
    }

    /// Recomputes every aggregate of one parent. Required after bulk writes that
    /// bypass the change events.
    pub fn recompute_parent<S: AggregateStore>(&self, store: &mut S, entity: &str, id: Id) -> Result<RecomputeReport, AppError> {
        let Some(concrete) = self.concrete_of(&*store, entity, id)? else {
            return Ok(RecomputeReport::default());
        };
        let pending = self.registry.specs_for_concrete(&concrete.name)
            .into_iter()
            .map(|entry| (id, entry.id))
            .collect();
        self.executor().run(store, pending)
    }

    /// Recomputes every stored row of `entity`, subtypes included.
    pub fn recompute_all<S: AggregateStore>(&self, store: &mut S, entity: &str) -> Result<RecomputeReport, AppError> {
        let table = self.model().entity(entity)?.table.clone();
        let ids = store.ids(&table)?;
        let mut report = RecomputeReport::default();
        for id in &ids {
            report.merge(self.recompute_parent(store, entity, *id)?);
        }
        info!("Recomputed {} rows of {}: {} written, {} unchanged", ids.len(), entity, report.written.len(), report.unchanged);
        Ok(report)
    }

    /// Compares stored aggregates of one parent with a fresh evaluation, without writing.
    pub fn verify<S: AggregateSource>(&self, source: &S, entity: &str, id: Id) -> Result<Vec<Drift>, AppError> {
        let Some(concrete) = self.concrete_of(source, entity, id)? else {
            return Ok(Vec::new());
        };
        let mut drifts = Vec::new();
        for entry in self.registry.specs_for_concrete(&concrete.name) {
            if let Some(drift) = self.check(source, entry, id)? {
                drifts.push(drift);
            }
        }
        Ok(drifts)
    }

    fn check<S: AggregateSource>(&self, source: &S, entry: &RegisteredAggregate, id: Id) -> Result<Option<Drift>, AppError> {
        let executor = self.executor();
        let Some(target_row) = executor.resolve_parent(source, entry, id)? else {
            return Ok(None);
        };
        let expected = executor.expected(source, entry, id)?;
        let stored = target_row.get(&entry.spec.column).cloned().unwrap_or(Value::Null);
        if stored == expected {
            Ok(None)
        } else {
            Ok(Some(Drift { entity: entry.target_entity.clone(), id, column: entry.spec.column.clone(), stored, expected }))
        }
    }

    /// Concrete type of the stored row `id` of `entity`, `None` when there is no such row.
    fn concrete_of<S: AggregateSource>(&self, source: &S, entity: &str, id: Id) -> Result<Option<&EntityDef>, AppError> {
        let model = self.model();
        let root = model.root_of(entity)?;
        let Some(base) = source.load_row(&root.table, id)? else {
            return Ok(None);
        };
        let concrete = match &root.polymorphic_on {
            Some(column) => {
                let discriminator = base.get(column).cloned().unwrap_or(Value::Null);
                model.resolve_identity(&root.name, &discriminator)
                    .ok_or_else(|| AppError::unresolved(entity, id, format!("unknown discriminator {}", discriminator)))?
            }
            None => root,
        };
        if model.is_a(&concrete.name, entity) {
            Ok(Some(concrete))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::memory::MemoryStore;
    use crate::expr::Aggregation;
    use crate::observer::ParentKey;
    use crate::registry::AggregateSpec;
    use crate::schema::test_models::catalog_model;
    use crate::value::{row, Row};
    use rust_decimal::Decimal;

    fn maintainer() -> AggregateMaintainer {
        let model = Arc::new(catalog_model());
        let mut registry = AggregateRegistry::new(model);
        for (aggregation, column) in [(Aggregation::sum("price"), "net_worth"), (Aggregation::count(), "product_count"), (Aggregation::max("price"), "max_price")] {
            registry.register(AggregateSpec::builder("CarCatalog")
                .relationship("products")
                .aggregate(aggregation)
                .column(column)
                .build()
                .unwrap()).unwrap();
        }
        AggregateMaintainer::new(registry, MaintainerSettings::default())
    }

    fn product(catalog: Id, price: i64) -> Row {
        row([("name", Value::from("p")), ("price", Value::Decimal(Decimal::from(price))), ("catalog_id", Value::Id(catalog))])
    }

    #[test]
    fn observed_events_flow_into_flush() {
        let maintainer = maintainer();
        let mut store = MemoryStore::new(maintainer.model().clone());
        store.put("CarCatalog", 1, row([("name", Value::from("C1"))]));
        store.put("Product", 10, product(1, 250));
        store.put("Product", 11, product(1, 750));

        let mut pending = PendingRecomputes::new();
        for id in [10, 11] {
            let event = ChangeEvent::Inserted { entity: "Product".into(), key: ParentKey::Id(id), row: product(1, 0) };
            maintainer.observe(&event, &mut pending).unwrap();
        }
        let report = maintainer.flush(&mut store, pending.resolve(|_| None)).unwrap();
        assert_eq!(report.written.len(), 3);
        assert_eq!(store.cell("car_catalog", 1, "net_worth"), Some(Value::Decimal(Decimal::from(1000))));
        assert_eq!(store.cell("car_catalog", 1, "product_count"), Some(Value::Int(2)));
        assert_eq!(store.cell("car_catalog", 1, "max_price"), Some(Value::Decimal(Decimal::from(750))));
    }

    #[test]
    fn verify_reports_drift_and_recompute_fixes_it() {
        let maintainer = maintainer();
        let mut store = MemoryStore::new(maintainer.model().clone());
        store.put("CarCatalog", 1, row([("name", Value::from("C1"))]));
        store.put("Product", 10, product(1, 100));

        let drifts = maintainer.verify(&store, "Catalog", 1).unwrap();
        assert_eq!(drifts.len(), 3);
        assert!(drifts.iter().any(|d| d.column == "net_worth" && d.stored == Value::Null));

        maintainer.recompute_parent(&mut store, "Catalog", 1).unwrap();
        assert!(maintainer.verify(&store, "Catalog", 1).unwrap().is_empty());

        let second = maintainer.recompute_parent(&mut store, "Catalog", 1).unwrap();
        assert!(second.is_noop());
        assert_eq!(second.unchanged, 3);
    }

    #[test]
    fn recompute_all_skips_other_subtypes() {
        let maintainer = maintainer();
        let mut store = MemoryStore::new(maintainer.model().clone());
        store.put("CarCatalog", 1, row([("name", Value::from("C1"))]));
        store.put("CostumeCatalog", 2, row([("name", Value::from("C2"))]));
        store.put("Product", 10, product(1, 3));

        let report = maintainer.recompute_all(&mut store, "Catalog").unwrap();
        assert!(report.written.iter().all(|w| w.id == 1));
        assert!(store.cell("costume_catalog", 2, "net_worth").is_none());
    }

    #[test]
    fn flush_of_nothing_touches_nothing() {
        let maintainer = maintainer();
        let mut store = MemoryStore::new(maintainer.model().clone());
        let report = maintainer.flush(&mut store, BTreeSet::new()).unwrap();
        assert!(report.is_noop());
        assert_eq!(store.writes, 0);
    }
}
