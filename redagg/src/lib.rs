//! redagg keeps denormalized aggregate columns (sum, count, min, max, avg) of a parent entity in sync
//! with its child collection, including parents that take part in joined-table inheritance.
//!
//! Entities and aggregates are declared through builders and submitted with `inventory`. Rows live in
//! [Redb](https://github.com/cberner/redb) tables encoded with `bincode`, one table per entity table,
//! plus a multimap index per foreign key. A [`Session`] reports every mutation to the
//! [`AggregateMaintainer`], and on flush the affected aggregates are recomputed inside the same write
//! transaction, so committing or rolling back covers them as well.
//!

pub mod decimal_serde_enc;
pub mod error;
pub mod executor;
pub mod expr;
pub mod logger;
pub mod maintainer;
pub mod observer;
pub mod registry;
pub mod schema;
pub mod session;
pub mod settings;
pub mod storage;
pub mod store;
pub mod value;

pub use chrono;
pub use error::AppError;
pub use executor::{RecomputeExecutor, RecomputeReport, WrittenAggregate};
pub use expr::Aggregation;
pub use inventory;
pub use maintainer::{AggregateMaintainer, Drift};
pub use observer::{ChangeEvent, ChangeObserver, ParentKey, PendingRecomputes};
pub use rand;
pub use redb;
pub use redb::Database;
pub use redb::Durability;
pub use redb::ReadTransaction;
pub use redb::WriteTransaction;
pub use registry::{AggregateInfo, AggregateRegistry, AggregateSpec, RegisteredAggregate, SpecId};
pub use rust_decimal::Decimal;
pub use schema::{ColumnDef, ColumnKind, EntityDef, EntityInfo, Model, PK};
pub use serde;
pub use serde_with;
pub use session::Session;
pub use settings::{AppConfig, DurabilityMode, LoggingSettings, MaintainerSettings, StorageSettings};
pub use std::sync::Arc;
pub use storage::entity::{Entity, EntityReader, EntityWriter};
pub use storage::init::{create_random_storage, Storage};
pub use store::{AggregateSource, AggregateStore};
pub use value::{row, Id, InstanceId, Row, Value};
