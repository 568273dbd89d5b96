use crate::error::AppError;
use crate::expr::coerce;
use crate::registry::{AggregateRegistry, RegisteredAggregate, SpecId};
use crate::store::{AggregateSource, AggregateStore};
use crate::value::{Id, Row, Value};
use crate::debug;
use std::collections::BTreeSet;

/// One aggregate column written by a recompute.
#[derive(Debug, Clone, PartialEq)]
pub struct WrittenAggregate {
    pub entity: String,
    pub table: String,
    pub id: Id,
    pub column: String,
    pub value: Value,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RecomputeReport {
    pub written: Vec<WrittenAggregate>,
    pub unchanged: usize,
    /// Pairs whose parent no longer exists.
    pub skipped: Vec<(Id, SpecId)>,
}

impl RecomputeReport {
    pub fn merge(&mut self, other: RecomputeReport) {
        self.written.extend(other.written);
        self.unchanged += other.unchanged;
        self.skipped.extend(other.skipped);
    }

    pub fn is_noop(&self) -> bool {
        self.written.is_empty()
    }
}

/// Evaluates pending aggregates and writes them into the parents' target tables,
/// inside whatever transaction the store is bound to.
pub struct RecomputeExecutor<'r> {
    registry: &'r AggregateRegistry,
    skip_unchanged: bool,
}

impl<'r> RecomputeExecutor<'r> {
    pub fn new(registry: &'r AggregateRegistry) -> Self {
        RecomputeExecutor { registry, skip_unchanged: true }
    }

    pub fn skip_unchanged(mut self, skip: bool) -> Self {
        self.skip_unchanged = skip;
        self
    }

    pub fn run<S: AggregateStore>(&self, store: &mut S, pending: BTreeSet<(Id, SpecId)>) -> Result<RecomputeReport, AppError> {
        let mut report = RecomputeReport::default();
        for (id, spec_id) in pending {
            let entry = self.registry.get(spec_id);
            let Some(target_row) = self.resolve_parent(&*store, entry, id)? else {
                debug!("{}#{} is gone, skipping {}", entry.spec.parent, id, entry.spec.column);
                report.skipped.push((id, spec_id));
                continue;
            };

            let value = self.expected(&*store, entry, id)?;
            let stored = target_row.get(&entry.spec.column).cloned().unwrap_or(Value::Null);
            if self.skip_unchanged && stored == value {
                report.unchanged += 1;
                continue;
            }

            debug!("{}#{}.{}: {} -> {}", entry.target_table, id, entry.spec.column, stored, value);
            store.write_column(&entry.target_table, id, &entry.spec.column, value.clone())?;
            report.written.push(WrittenAggregate {
                entity: entry.target_entity.clone(),
                table: entry.target_table.clone(),
                id,
                column: entry.spec.column.clone(),
                value,
            });
        }
        Ok(report)
    }

    /// Value the target column must hold given the current related rows.
    pub fn expected<S: AggregateSource>(&self, source: &S, entry: &RegisteredAggregate, id: Id) -> Result<Value, AppError> {
        let rows = source.related_rows(&entry.child, &entry.foreign_key, id)?;
        let value = match entry.spec.aggregation.evaluate(&rows)? {
            Value::Null => entry.fallback(),
            value => value,
        };
        coerce(value, &entry.spec.column, entry.target_kind)
    }

    /// Locates the row holding the target column of `entry` for parent `id`.
    ///
    /// The base row is read from the hierarchy root table and its discriminator is
    /// looked up in the model. The concrete type must be the declared parent or one
    /// of its subtypes, and the table owning the target column must have a row for `id`.
    /// `None` means the base row does not exist, i.e. the parent was deleted.
    pub fn resolve_parent<S: AggregateSource>(&self, source: &S, entry: &RegisteredAggregate, id: Id) -> Result<Option<Row>, AppError> {
        let model = self.registry.model();
        let parent = &entry.spec.parent;
        let root = model.root_of(parent)?;
        let Some(base) = source.load_row(&root.table, id)? else {
            return Ok(None);
        };

        let concrete = match &root.polymorphic_on {
            Some(column) => {
                let discriminator = base.get(column).cloned().unwrap_or(Value::Null);
                model.resolve_identity(&root.name, &discriminator).ok_or_else(|| {
                    AppError::unresolved(parent, id, format!("unknown discriminator {} in {}.{}", discriminator, root.table, column))
                })?
            }
            None => root,
        };
        if !model.is_a(&concrete.name, parent) {
            return Err(AppError::unresolved(parent, id, format!("row is a {}", concrete.name)));
        }

        if entry.target_table == root.table {
            return Ok(Some(base));
        }
        source.load_row(&entry.target_table, id)?
            .map(Some)
            .ok_or_else(|| AppError::unresolved(parent, id, format!("no row in {}", entry.target_table)))
    }
}


#[cfg(test)]
mod tests {
    use super::memory::MemoryStore;
    use super::*;
    use crate::expr::Aggregation;
    use crate::registry::AggregateSpec;
    use crate::schema::test_models::catalog_model;
    use crate::value::row;
    use rust_decimal::Decimal;
    use std::sync::Arc;

    fn setup() -> (AggregateRegistry, MemoryStore) {
        let model = Arc::new(catalog_model());
        let mut registry = AggregateRegistry::new(model.clone());
        registry.register(AggregateSpec::builder("CarCatalog")
            .relationship("products")
            .aggregate(Aggregation::sum("price"))
            .column("net_worth")
            .build()
            .unwrap()).unwrap();
        (registry, MemoryStore::new(model))
    }

    fn product(store: &mut MemoryStore, id: Id, catalog: Id, price: i64) {
        store.put("Product", id, row([
            ("name", Value::from(format!("p{}", id))),
            ("price", Value::Decimal(Decimal::from(price))),
            ("catalog_id", Value::Id(catalog)),
        ]));
    }

    fn pending(pairs: &[(Id, usize)]) -> BTreeSet<(Id, SpecId)> {
        pairs.iter().map(|(id, spec)| (*id, SpecId(*spec))).collect()
    }

    #[test]
    fn writes_sum_into_subtype_table_only() {
        let (registry, mut store) = setup();
        store.put("CarCatalog", 1, row([("name", Value::from("C1"))]));
        product(&mut store, 10, 1, 600);
        product(&mut store, 11, 1, 400);

        let report = RecomputeExecutor::new(&registry).run(&mut store, pending(&[(1, 0)])).unwrap();
        assert_eq!(report.written.len(), 1);
        assert_eq!(store.cell("car_catalog", 1, "net_worth"), Some(Value::Decimal(Decimal::from(1000))));
        assert_eq!(store.cell("catalog", 1, "net_worth"), None);
    }

    #[test]
    fn empty_collection_gets_column_default() {
        let (registry, mut store) = setup();
        store.put("CarCatalog", 1, row([("name", Value::from("C1")), ("net_worth", Value::Decimal(Decimal::from(5)))]));
        RecomputeExecutor::new(&registry).run(&mut store, pending(&[(1, 0)])).unwrap();
        assert_eq!(store.cell("car_catalog", 1, "net_worth"), Some(Value::Decimal(Decimal::ZERO)));
    }

    #[test]
    fn unchanged_value_is_not_rewritten() {
        let (registry, mut store) = setup();
        store.put("CarCatalog", 1, row([("name", Value::from("C1"))]));
        product(&mut store, 10, 1, 7);
        let executor = RecomputeExecutor::new(&registry);
        executor.run(&mut store, pending(&[(1, 0)])).unwrap();
        let writes = store.writes;

        let report = executor.run(&mut store, pending(&[(1, 0)])).unwrap();
        assert!(report.is_noop());
        assert_eq!(report.unchanged, 1);
        assert_eq!(store.writes, writes);
    }

    #[test]
    fn deleted_parent_is_skipped() {
        let (registry, mut store) = setup();
        let report = RecomputeExecutor::new(&registry).run(&mut store, pending(&[(9, 0)])).unwrap();
        assert_eq!(report.skipped, vec![(9, SpecId(0))]);
        assert_eq!(store.writes, 0);
    }

    #[test]
    fn unknown_discriminator_fails() {
        let (registry, mut store) = setup();
        store.put("CarCatalog", 1, Row::new());
        store.tables.get_mut("catalog").unwrap().get_mut(&1).unwrap().insert("type".into(), Value::from("boats"));
        let result = RecomputeExecutor::new(&registry).run(&mut store, pending(&[(1, 0)]));
        assert!(matches!(result, Err(AppError::UnresolvedParent { id: 1, .. })));
    }

    #[test]
    fn wrong_subtype_fails() {
        let (registry, mut store) = setup();
        store.put("CostumeCatalog", 2, row([("name", Value::from("C2"))]));
        let result = RecomputeExecutor::new(&registry).run(&mut store, pending(&[(2, 0)]));
        assert!(matches!(result, Err(AppError::UnresolvedParent { id: 2, .. })));
    }

    #[test]
    fn missing_subtype_row_fails() {
        let (registry, mut store) = setup();
        store.put("CarCatalog", 1, Row::new());
        store.tables.get_mut("car_catalog").unwrap().remove(&1);
        let result = RecomputeExecutor::new(&registry).run(&mut store, pending(&[(1, 0)]));
        assert!(matches!(result, Err(AppError::UnresolvedParent { id: 1, .. })));
    }
}
