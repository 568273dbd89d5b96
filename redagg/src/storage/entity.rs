use crate::error::AppError;
use crate::schema::EntityDef;
use crate::storage::init::Storage;
use crate::storage::table_fk_index::{FkIndexFactory, FkIndexTable, FkReadLike, ReadOnlyFkIndexTable};
use crate::storage::table_row::{ReadOnlyRowTable, RowFactory, RowReadLike, RowTable};
use crate::store::{AggregateSource, AggregateStore};
use crate::value::{Id, Row, Value};
use crate::debug;
use redb::{ReadTransaction, WriteTransaction};

/// Opens row and index tables the same way for read and write transactions, so
/// readers see uncommitted writes when bound to a write transaction.
pub trait TxTables {
    type Rows<'t>: RowReadLike where Self: 't;
    type Index<'t>: FkReadLike where Self: 't;

    fn rows<'t>(&'t self, factory: &RowFactory) -> Result<Self::Rows<'t>, AppError>;
    fn fk_index<'t>(&'t self, factory: &FkIndexFactory) -> Result<Self::Index<'t>, AppError>;
}

impl TxTables for WriteTransaction {
    type Rows<'t> = RowTable<'t> where Self: 't;
    type Index<'t> = FkIndexTable<'t> where Self: 't;

    fn rows<'t>(&'t self, factory: &RowFactory) -> Result<Self::Rows<'t>, AppError> {
        factory.open(self)
    }

    fn fk_index<'t>(&'t self, factory: &FkIndexFactory) -> Result<Self::Index<'t>, AppError> {
        factory.open(self)
    }
}

impl TxTables for ReadTransaction {
    type Rows<'t> = ReadOnlyRowTable where Self: 't;
    type Index<'t> = ReadOnlyFkIndexTable where Self: 't;

    fn rows<'t>(&'t self, factory: &RowFactory) -> Result<Self::Rows<'t>, AppError> {
        factory.open_for_read(self)
    }

    fn fk_index<'t>(&'t self, factory: &FkIndexFactory) -> Result<Self::Index<'t>, AppError> {
        factory.open_for_read(self)
    }
}

/// An instance loaded as its concrete type, with the columns of its whole lineage.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub entity: String,
    pub id: Id,
    pub row: Row,
}

impl Entity {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.row.get(column)
    }
}

pub struct EntityReader<'a, T: TxTables> {
    storage: &'a Storage,
    tx: &'a T,
}

impl<'a, T: TxTables> EntityReader<'a, T> {
    pub fn new(storage: &'a Storage, tx: &'a T) -> Self {
        EntityReader { storage, tx }
    }

    pub fn row(&self, table: &str, id: Id) -> Result<Option<Row>, AppError> {
        self.tx.rows(self.storage.row_factory(table)?)?.get_row(id)
    }

    /// Loads `id` as its concrete type, `None` when it is missing or not an `entity`.
    pub fn load(&self, entity: &str, id: Id) -> Result<Option<Entity>, AppError> {
        let model = self.storage.model();
        let root = model.root_of(entity)?;
        let Some(base) = self.row(&root.table, id)? else {
            return Ok(None);
        };
        let concrete = match &root.polymorphic_on {
            Some(column) => {
                let discriminator = base.get(column).cloned().unwrap_or(Value::Null);
                model.resolve_identity(&root.name, &discriminator).ok_or_else(|| {
                    AppError::Corrupt(format!("{}#{} has unknown discriminator {}", root.name, id, discriminator))
                })?
            }
            None => root,
        };
        if !model.is_a(&concrete.name, entity) {
            return Ok(None);
        }

        let mut merged = base;
        for def in model.lineage(&concrete.name)?.into_iter().skip(1) {
            let part = self.row(&def.table, id)?
                .ok_or_else(|| AppError::Corrupt(format!("{}#{} has no row in {}", concrete.name, id, def.table)))?;
            merged.extend(part);
        }
        Ok(Some(Entity { entity: concrete.name.clone(), id, row: merged }))
    }

    /// Every instance of `entity`; subtype rows live in the entity's own table too.
    pub fn all(&self, entity: &str) -> Result<Vec<Entity>, AppError> {
        let table = &self.storage.model().entity(entity)?.table;
        let ids = self.tx.rows(self.storage.row_factory(table)?)?.ids()?;
        let mut result = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(loaded) = self.load(entity, id)? {
                result.push(loaded);
            }
        }
        Ok(result)
    }

    /// Instances of `child` whose `foreign_key` references `parent`, found through the index.
    pub fn children(&self, child: &str, foreign_key: &str, parent: Id) -> Result<Vec<Entity>, AppError> {
        let (owner, _) = self.storage.model().column(child, foreign_key)?;
        let ids = self.tx.fk_index(self.storage.fk_factory(&owner.table, foreign_key)?)?.children(parent)?;
        let mut result = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load(child, id)? {
                Some(loaded) if loaded.get(foreign_key) == Some(&Value::Id(parent)) => result.push(loaded),
                Some(_) => return Err(AppError::Corrupt(format!("index {}.{} is out of sync for {}", owner.table, foreign_key, id))),
                None => {}
            }
        }
        Ok(result)
    }
}

impl<'a, T: TxTables> AggregateSource for EntityReader<'a, T> {
    fn load_row(&self, table: &str, id: Id) -> Result<Option<Row>, AppError> {
        self.row(table, id)
    }

    fn related_rows(&self, child: &str, foreign_key: &str, parent: Id) -> Result<Vec<Row>, AppError> {
        Ok(self.children(child, foreign_key, parent)?.into_iter().map(|e| e.row).collect())
    }

    fn ids(&self, table: &str) -> Result<Vec<Id>, AppError> {
        self.tx.rows(self.storage.row_factory(table)?)?.ids()
    }
}

/// Writes rows of an entity across its lineage tables and keeps the foreign-key indexes in step.
pub struct EntityWriter<'a> {
    storage: &'a Storage,
    tx: &'a WriteTransaction,
}

impl<'a> EntityWriter<'a> {
    pub fn new(storage: &'a Storage, tx: &'a WriteTransaction) -> Self {
        EntityWriter { storage, tx }
    }

    pub fn reader(&self) -> EntityReader<'a, WriteTransaction> {
        EntityReader::new(self.storage, self.tx)
    }

    pub fn next_id(&self, entity: &str) -> Result<Id, AppError> {
        let root = self.storage.model().root_of(entity)?;
        self.storage.next_id(self.tx, &root.table)
    }

    /// Inserts a new instance; columns missing from `row` are stored as null.
    pub fn insert(&self, entity: &str, id: Id, row: &Row) -> Result<(), AppError> {
        let model = self.storage.model();
        let lineage = model.lineage(entity)?;
        Self::check_columns(entity, &lineage, row)?;
        let mut row = row.clone();
        if let Some((column, discriminator)) = model.discriminator_for(entity)? {
            row.insert(column, discriminator);
        }

        for def in lineage {
            let part: Row = def.columns.iter()
                .map(|c| (c.name.clone(), row.get(&c.name).cloned().unwrap_or(Value::Null)))
                .collect();
            let replaced = self.tx.rows(self.storage.row_factory(&def.table)?)?.insert_row(id, &part)?;
            if replaced.is_some() {
                return Err(AppError::Corrupt(format!("{}#{} already exists in {}", entity, id, def.table)));
            }
            self.reindex(def, id, None, Some(&part))?;
        }
        debug!("inserted {}#{}", entity, id);
        Ok(())
    }

    /// Applies `changes` to the tables owning the changed columns only.
    pub fn update(&self, entity: &str, id: Id, changes: &Row) -> Result<(), AppError> {
        let lineage = self.storage.model().lineage(entity)?;
        Self::check_columns(entity, &lineage, changes)?;
        for def in lineage {
            let own: Row = changes.iter()
                .filter(|(column, _)| def.own_column(column).is_some())
                .map(|(column, value)| (column.clone(), value.clone()))
                .collect();
            if !own.is_empty() {
                self.update_table(def, id, &own)?;
            }
        }
        Ok(())
    }

    /// Removes `id` from every table of its concrete lineage, returning what was stored.
    pub fn delete(&self, entity: &str, id: Id) -> Result<Option<Entity>, AppError> {
        let Some(current) = self.reader().load(entity, id)? else {
            return Ok(None);
        };
        for def in self.storage.model().lineage(&current.entity)? {
            let removed = self.tx.rows(self.storage.row_factory(&def.table)?)?.delete_row(id)?;
            self.reindex(def, id, removed.as_ref(), None)?;
        }
        debug!("deleted {}#{}", current.entity, id);
        Ok(Some(current))
    }

    fn update_table(&self, def: &EntityDef, id: Id, changes: &Row) -> Result<(), AppError> {
        let mut rows = self.tx.rows(self.storage.row_factory(&def.table)?)?;
        let old = rows.get_row(id)?
            .ok_or_else(|| AppError::Corrupt(format!("{}#{} has no row in {}", def.name, id, def.table)))?;
        let mut new = old.clone();
        new.extend(changes.iter().map(|(c, v)| (c.clone(), v.clone())));
        rows.insert_row(id, &new)?;
        drop(rows);
        self.reindex(def, id, Some(&old), Some(&new))
    }

    fn reindex(&self, def: &EntityDef, id: Id, old: Option<&Row>, new: Option<&Row>) -> Result<(), AppError> {
        for column in self.storage.fk_columns(&def.table) {
            let parent_of = |row: Option<&Row>| row.and_then(|r| r.get(column)).and_then(Value::as_id);
            let (old_parent, new_parent) = (parent_of(old), parent_of(new));
            if old_parent != new_parent {
                let mut index = self.tx.fk_index(self.storage.fk_factory(&def.table, column)?)?;
                index.relink(id, old_parent, new_parent)?;
            }
        }
        Ok(())
    }

    fn check_columns(entity: &str, lineage: &[&EntityDef], row: &Row) -> Result<(), AppError> {
        match row.keys().find(|column| !lineage.iter().any(|def| def.own_column(column).is_some())) {
            Some(column) => Err(AppError::unknown_column(entity, column)),
            None => Ok(()),
        }
    }
}

impl<'a> AggregateSource for EntityWriter<'a> {
    fn load_row(&self, table: &str, id: Id) -> Result<Option<Row>, AppError> {
        self.reader().load_row(table, id)
    }

    fn related_rows(&self, child: &str, foreign_key: &str, parent: Id) -> Result<Vec<Row>, AppError> {
        self.reader().related_rows(child, foreign_key, parent)
    }

    fn ids(&self, table: &str) -> Result<Vec<Id>, AppError> {
        self.reader().ids(table)
    }
}

impl<'a> AggregateStore for EntityWriter<'a> {
    fn write_column(&mut self, table: &str, id: Id, column: &str, value: Value) -> Result<(), AppError> {
        let def = self.storage.model()
            .entities()
            .find(|def| def.table == table)
            .ok_or_else(|| AppError::Custom(format!("table `{}`: not found", table)))?;
        if def.own_column(column).is_none() {
            return Err(AppError::unknown_column(&def.name, column));
        }
        let mut changes = Row::new();
        changes.insert(column.to_string(), value);
        self.update_table(def, id, &changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::test_models::catalog_model;
    use crate::storage::init::create_random_storage;
    use crate::value::row;
    use rust_decimal::Decimal;
    use std::sync::Arc;

    fn storage() -> Arc<Storage> {
        create_random_storage("entity_test", Arc::new(catalog_model())).unwrap()
    }

    #[test]
    fn subtype_rows_are_split_and_merged() {
        let storage = storage();
        let tx = storage.begin_write().unwrap();
        let writer = EntityWriter::new(&storage, &tx);
        writer.insert("CarCatalog", 1, &row([("name", Value::from("C1")), ("model", Value::from("sedan"))])).unwrap();

        let reader = writer.reader();
        let base = reader.row("catalog", 1).unwrap().unwrap();
        assert_eq!(base.get("type"), Some(&Value::from("cars")));
        assert!(base.get("model").is_none());
        let loaded = reader.load("Catalog", 1).unwrap().unwrap();
        assert_eq!(loaded.entity, "CarCatalog");
        assert_eq!(loaded.get("model"), Some(&Value::from("sedan")));
        assert!(reader.load("CostumeCatalog", 1).unwrap().is_none());
        drop(writer);
        tx.commit().unwrap();

        assert_eq!(storage.load("CarCatalog", 1).unwrap().unwrap().get("name"), Some(&Value::from("C1")));
    }

    #[test]
    fn index_follows_reparenting_and_delete() {
        let storage = storage();
        let tx = storage.begin_write().unwrap();
        let writer = EntityWriter::new(&storage, &tx);
        writer.insert("CarCatalog", 1, &Row::new()).unwrap();
        writer.insert("CarCatalog", 2, &Row::new()).unwrap();
        writer.insert("Product", 10, &row([("price", Value::Decimal(Decimal::from(5))), ("catalog_id", Value::Id(1))])).unwrap();

        assert_eq!(writer.related_rows("Product", "catalog_id", 1).unwrap().len(), 1);
        writer.update("Product", 10, &row([("catalog_id", Value::Id(2))])).unwrap();
        assert!(writer.related_rows("Product", "catalog_id", 1).unwrap().is_empty());
        assert_eq!(writer.related_rows("Product", "catalog_id", 2).unwrap().len(), 1);

        let removed = writer.delete("Product", 10).unwrap().unwrap();
        assert_eq!(removed.get("catalog_id"), Some(&Value::Id(2)));
        assert!(writer.related_rows("Product", "catalog_id", 2).unwrap().is_empty());
        assert!(writer.delete("Product", 10).unwrap().is_none());
    }

    #[test]
    fn write_column_targets_owning_table() {
        let storage = storage();
        let tx = storage.begin_write().unwrap();
        let mut writer = EntityWriter::new(&storage, &tx);
        writer.insert("CarCatalog", 1, &Row::new()).unwrap();
        writer.write_column("car_catalog", 1, "net_worth", Value::Decimal(Decimal::from(3))).unwrap();
        assert_eq!(writer.load_row("car_catalog", 1).unwrap().unwrap().get("net_worth"), Some(&Value::Decimal(Decimal::from(3))));
        assert!(matches!(writer.write_column("catalog", 1, "net_worth", Value::Null), Err(AppError::UnknownColumn { .. })));
    }

    #[test]
    fn rejects_unknown_columns_and_duplicate_ids() {
        let storage = storage();
        let tx = storage.begin_write().unwrap();
        let writer = EntityWriter::new(&storage, &tx);
        assert!(matches!(writer.insert("Catalog", 1, &row([("color", Value::from("red"))])), Err(AppError::UnknownColumn { .. })));
        writer.insert("Catalog", 1, &Row::new()).unwrap();
        assert!(matches!(writer.insert("Catalog", 1, &Row::new()), Err(AppError::Corrupt(_))));
    }

    #[test]
    fn uncommitted_writes_are_invisible_outside() {
        let storage = storage();
        let tx = storage.begin_write().unwrap();
        EntityWriter::new(&storage, &tx).insert("Catalog", 1, &Row::new()).unwrap();
        assert!(storage.load("Catalog", 1).unwrap().is_none());
        tx.abort().unwrap();
        assert!(storage.all("Catalog").unwrap().is_empty());
    }
}
