use crate::error::AppError;
use crate::info;
use crate::schema::Model;
use crate::settings::{DurabilityMode, StorageSettings};
use crate::storage::entity::{Entity, EntityReader};
use crate::storage::table_fk_index::FkIndexFactory;
use crate::storage::table_row::RowFactory;
use crate::value::Id;
use redb::{Database, Durability, ReadTransaction, ReadableTable, TableDefinition, WriteTransaction};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{env, fs};

const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("redagg_sequences");

/// One redb database holding every table derived from a `Model`.
pub struct Storage {
    db: Arc<Database>,
    model: Arc<Model>,
    rows: HashMap<String, RowFactory>,
    fk_indexes: HashMap<(String, String), FkIndexFactory>,
    fks_by_table: HashMap<String, Vec<String>>,
    durability: Durability,
}

impl Storage {
    /// Wraps `db` and creates any table of `model` that does not exist yet.
    pub fn new(db: Database, model: Arc<Model>, durability: Durability) -> Result<Self, AppError> {
        let rows: HashMap<String, RowFactory> = model.entities()
            .map(|def| (def.table.clone(), RowFactory::new(&def.table)))
            .collect();
        let mut fk_indexes = HashMap::new();
        let mut fks_by_table: HashMap<String, Vec<String>> = HashMap::new();
        for fk in model.foreign_keys() {
            fks_by_table.entry(fk.table.clone()).or_default().push(fk.column.clone());
            fk_indexes.insert((fk.table.clone(), fk.column.clone()), FkIndexFactory::new(&fk.table, &fk.column));
        }

        let tx = db.begin_write()?;
        for factory in rows.values() {
            factory.open(&tx)?;
        }
        for factory in fk_indexes.values() {
            factory.open(&tx)?;
        }
        tx.open_table(SEQUENCES)?;
        tx.commit()?;

        Ok(Storage { db: Arc::new(db), model, rows, fk_indexes, fks_by_table, durability })
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn row_factory(&self, table: &str) -> Result<&RowFactory, AppError> {
        self.rows.get(table).ok_or_else(|| AppError::Custom(format!("table `{}`: not found", table)))
    }

    pub fn fk_factory(&self, table: &str, column: &str) -> Result<&FkIndexFactory, AppError> {
        self.fk_indexes
            .get(&(table.to_string(), column.to_string()))
            .ok_or_else(|| AppError::Custom(format!("column `{}.{}`: not indexed", table, column)))
    }

    /// Indexed foreign-key columns stored in `table`.
    pub fn fk_columns(&self, table: &str) -> &[String] {
        self.fks_by_table.get(table).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn begin_write(&self) -> Result<WriteTransaction, AppError> {
        let mut tx = self.db.begin_write()?;
        tx.set_durability(self.durability);
        Ok(tx)
    }

    pub fn begin_read(&self) -> Result<ReadTransaction, AppError> {
        Ok(self.db.begin_read()?)
    }

    /// Next primary key of the hierarchy stored under `root_table`, starting at 1.
    pub(crate) fn next_id(&self, tx: &WriteTransaction, root_table: &str) -> Result<Id, AppError> {
        let mut sequences = tx.open_table(SEQUENCES)?;
        let next = sequences.get(root_table)?.map(|guard| guard.value()).unwrap_or(0) + 1;
        sequences.insert(root_table, next)?;
        Ok(next)
    }

    /// Committed state of one instance, loaded as its concrete type.
    pub fn load(&self, entity: &str, id: Id) -> Result<Option<Entity>, AppError> {
        let tx = self.begin_read()?;
        EntityReader::new(self, &tx).load(entity, id)
    }

    /// Every committed instance of `entity`, subtypes included.
    pub fn all(&self, entity: &str) -> Result<Vec<Entity>, AppError> {
        let tx = self.begin_read()?;
        EntityReader::new(self, &tx).all(entity)
    }

    fn db_file_path(dir: &Path) -> PathBuf {
        dir.join("redagg.db")
    }

    fn log_table_report(&self) {
        let mut lines: Vec<String> = self.rows.values().map(|f| format!("  rows   {}", f.name())).collect();
        lines.extend(self.fk_indexes.values().map(|f| format!("  index  {}", f.name())));
        lines.sort();
        info!("DB tables:\n{}", lines.join("\n"));
    }

    pub async fn init(db_dir: PathBuf, model: Arc<Model>, settings: &StorageSettings) -> Result<(bool, Arc<Storage>), AppError> {
        let cache_bytes = settings.db_cache_size_mb * 1024 * 1024;
        let durability: Durability = settings.durability.into();
        let path = Self::db_file_path(&db_dir);
        let (created, db) =
            if !db_dir.exists() {
                fs::create_dir_all(&db_dir)?;
                info!("Creating db at {:?} with cache size {} MB", db_dir, settings.db_cache_size_mb);
                (true, Database::builder().set_cache_size(cache_bytes).create(path)?)
            } else {
                info!(
                    "Opening existing db at {:?} with cache size {} MB, it might take a while in case previous process was killed",
                    db_dir, settings.db_cache_size_mb
                );
                let db = tokio::task::spawn_blocking(move || Database::builder().set_cache_size(cache_bytes).create(path)).await??;
                (false, db)
            };
        let storage = Storage::new(db, model, durability)?;
        storage.log_table_report();
        Ok((created, Arc::new(storage)))
    }

    pub async fn temp(name: &str, model: Arc<Model>, random: bool) -> Result<Arc<Storage>, AppError> {
        let db_dir = Self::temp_dir(name, random)?;
        let settings = StorageSettings {
            db_path: db_dir.to_string_lossy().into_owned(),
            db_cache_size_mb: 16,
            durability: DurabilityMode::None,
        };
        let (_, storage) = Storage::init(db_dir, model, &settings).await?;
        Ok(storage)
    }

    fn temp_dir(name: &str, random: bool) -> Result<PathBuf, AppError> {
        let db_name = if random { format!("{}_{}", name, rand::random::<u64>()) } else { name.to_string() };
        let db_dir = env::temp_dir().join("redagg").join(db_name);
        if random && db_dir.exists() {
            fs::remove_dir_all(&db_dir)?;
        }
        Ok(db_dir)
    }
}

/// Synchronous temp storage for tests and tools that run outside a runtime.
pub fn create_random_storage(name: &str, model: Arc<Model>) -> Result<Arc<Storage>, AppError> {
    let db_dir = Storage::temp_dir(name, true)?;
    fs::create_dir_all(&db_dir)?;
    let db = Database::builder().create(Storage::db_file_path(&db_dir))?;
    Ok(Arc::new(Storage::new(db, model, Durability::None)?))
}
