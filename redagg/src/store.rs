use crate::error::AppError;
use crate::value::{Id, Row, Value};

/// Read side of the persistence layer the maintainer depends on.
pub trait AggregateSource {
    /// Row of a single physical table, without merging inherited tables.
    fn load_row(&self, table: &str, id: Id) -> Result<Option<Row>, AppError>;

    /// Rows of `child` entities whose `foreign_key` references `parent`, as visible
    /// inside the current transaction. Rows carry every column of `child`'s lineage.
    fn related_rows(&self, child: &str, foreign_key: &str, parent: Id) -> Result<Vec<Row>, AppError>;

    /// Ids stored in a physical table, used by manual recomputes.
    fn ids(&self, table: &str) -> Result<Vec<Id>, AppError>;
}

/// Write side: a single column of a single row, inside the caller's transaction.
pub trait AggregateStore: AggregateSource {
    fn write_column(&mut self, table: &str, id: Id, column: &str, value: Value) -> Result<(), AppError>;
}
