use crate::error::AppError;
use crate::value::{Id, Row, Value};
use redb::{ReadOnlyTable, ReadTransaction, ReadableTable, Table, TableDefinition, WriteTransaction};

pub type RowTableDef = TableDefinition<'static, Id, &'static [u8]>;

/// Definition of the table holding one entity table's rows, keyed by primary key.
#[derive(Clone)]
pub struct RowFactory {
    pub(crate) name: String,
    pub(crate) table_def: RowTableDef,
}

impl RowFactory {
    pub fn new(name: &str) -> Self {
        let table_name: &'static str = Box::leak(format!("{}_rows", name).into_boxed_str());
        Self {
            name: name.to_string(),
            table_def: TableDefinition::new(table_name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn open<'txn>(&self, tx: &'txn WriteTransaction) -> Result<RowTable<'txn>, AppError> {
        Ok(RowTable { table: tx.open_table(self.table_def)? })
    }

    pub fn open_for_read(&self, tx: &ReadTransaction) -> Result<ReadOnlyRowTable, AppError> {
        Ok(ReadOnlyRowTable { table: tx.open_table(self.table_def)? })
    }
}

pub trait RowReadLike {
    fn get_row(&self, id: Id) -> Result<Option<Row>, AppError>;
    fn ids(&self) -> Result<Vec<Id>, AppError>;
}

pub(crate) fn encode(row: &Row) -> Result<Vec<u8>, AppError> {
    if let Some((column, value)) = row.iter().find(|(_, v)| matches!(v, Value::Ref(_))) {
        return Err(AppError::Custom(format!("column {} still references unflushed instance {}", column, value)));
    }
    Ok(bincode::serialize(row)?)
}

pub(crate) fn decode(bytes: &[u8]) -> Result<Row, AppError> {
    Ok(bincode::deserialize(bytes)?)
}

fn get_row_in<T: ReadableTable<Id, &'static [u8]>>(table: &T, id: Id) -> Result<Option<Row>, AppError> {
    match table.get(id)? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

fn ids_in<T: ReadableTable<Id, &'static [u8]>>(table: &T) -> Result<Vec<Id>, AppError> {
    let mut ids = Vec::new();
    for entry in table.iter()? {
        let (key, _) = entry?;
        ids.push(key.value());
    }
    Ok(ids)
}

pub struct RowTable<'txn> {
    pub(crate) table: Table<'txn, Id, &'static [u8]>,
}

impl<'txn> RowTable<'txn> {
    /// Stores `row` under `id`, returning the row it replaced.
    pub fn insert_row(&mut self, id: Id, row: &Row) -> Result<Option<Row>, AppError> {
        let bytes = encode(row)?;
        let previous = self.table.insert(id, bytes.as_slice())?;
        previous.map(|guard| decode(guard.value())).transpose()
    }

    pub fn delete_row(&mut self, id: Id) -> Result<Option<Row>, AppError> {
        let removed = self.table.remove(id)?;
        removed.map(|guard| decode(guard.value())).transpose()
    }
}

impl<'txn> RowReadLike for RowTable<'txn> {
    fn get_row(&self, id: Id) -> Result<Option<Row>, AppError> {
        get_row_in(&self.table, id)
    }

    fn ids(&self) -> Result<Vec<Id>, AppError> {
        ids_in(&self.table)
    }
}

pub struct ReadOnlyRowTable {
    table: ReadOnlyTable<Id, &'static [u8]>,
}

impl RowReadLike for ReadOnlyRowTable {
    fn get_row(&self, id: Id) -> Result<Option<Row>, AppError> {
        get_row_in(&self.table, id)
    }

    fn ids(&self) -> Result<Vec<Id>, AppError> {
        ids_in(&self.table)
    }
}
