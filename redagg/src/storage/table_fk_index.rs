use crate::error::AppError;
use crate::value::Id;
use redb::{MultimapTable, MultimapTableDefinition, MultimapValue, ReadOnlyMultimapTable, ReadTransaction, ReadableMultimapTable, WriteTransaction};

pub type FkIndexDef = MultimapTableDefinition<'static, Id, Id>;

/// Definition of the parent id -> child ids index of one foreign-key column.
#[derive(Clone)]
pub struct FkIndexFactory {
    pub(crate) name: String,
    pub(crate) index_def: FkIndexDef,
}

impl FkIndexFactory {
    pub fn new(table: &str, column: &str) -> Self {
        let name = format!("{}_{}", table, column);
        let index_name: &'static str = Box::leak(format!("{}_index", name).into_boxed_str());
        Self { name, index_def: MultimapTableDefinition::new(index_name) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn open<'txn>(&self, tx: &'txn WriteTransaction) -> Result<FkIndexTable<'txn>, AppError> {
        Ok(FkIndexTable { index: tx.open_multimap_table(self.index_def)? })
    }

    pub fn open_for_read(&self, tx: &ReadTransaction) -> Result<ReadOnlyFkIndexTable, AppError> {
        Ok(ReadOnlyFkIndexTable { index: tx.open_multimap_table(self.index_def)? })
    }
}

pub trait FkReadLike {
    /// Child ids referencing `parent`, in ascending order.
    fn children(&self, parent: Id) -> Result<Vec<Id>, AppError>;
}

fn collect_multimap_value(mut mmv: MultimapValue<'_, Id>) -> Result<Vec<Id>, AppError> {
    let mut results = Vec::new();
    while let Some(item_res) = mmv.next() {
        let guard = item_res?;
        results.push(guard.value());
    }
    Ok(results)
}

pub struct FkIndexTable<'txn> {
    pub(crate) index: MultimapTable<'txn, Id, Id>,
}

impl<'txn> FkIndexTable<'txn> {
    /// Returns `true` when the pair was not linked before.
    pub fn link(&mut self, parent: Id, child: Id) -> Result<bool, AppError> {
        let existed = self.index.insert(parent, child)?;
        Ok(!existed)
    }

    /// Returns `true` when the pair was linked.
    pub fn unlink(&mut self, parent: Id, child: Id) -> Result<bool, AppError> {
        Ok(self.index.remove(parent, child)?)
    }

    /// Moves `child` between parents; `None` on either side means no reference.
    pub fn relink(&mut self, child: Id, old: Option<Id>, new: Option<Id>) -> Result<(), AppError> {
        if old == new {
            return Ok(());
        }
        if let Some(parent) = old {
            self.unlink(parent, child)?;
        }
        if let Some(parent) = new {
            self.link(parent, child)?;
        }
        Ok(())
    }
}

impl<'txn> FkReadLike for FkIndexTable<'txn> {
    fn children(&self, parent: Id) -> Result<Vec<Id>, AppError> {
        collect_multimap_value(self.index.get(parent)?)
    }
}

pub struct ReadOnlyFkIndexTable {
    index: ReadOnlyMultimapTable<Id, Id>,
}

impl FkReadLike for ReadOnlyFkIndexTable {
    fn children(&self, parent: Id) -> Result<Vec<Id>, AppError> {
        collect_multimap_value(self.index.get(parent)?)
    }
}
