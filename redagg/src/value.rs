use crate::decimal_serde_enc::DecimalBytes;
use crate::schema::ColumnKind;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Primary key shared by every table of an inheritance hierarchy.
pub type Id = u64;

/// Column name to value, as stored in one table or merged across a lineage.
pub type Row = BTreeMap<String, Value>;

/// Session-local handle of an entity instance, valid before an id is assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub u32);

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Decimal(#[serde_as(as = "DecimalBytes")] Decimal),
    Text(String),
    Id(Id),
    /// Points at an unflushed instance, replaced by `Id` before it reaches storage.
    Ref(InstanceId),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Decimal(_) => "decimal",
            Value::Text(_) => "text",
            Value::Id(_) => "id",
            Value::Ref(_) => "ref",
        }
    }

    /// Null fits every column, `Ref` fits id columns only.
    pub fn fits(&self, kind: ColumnKind) -> bool {
        matches!(
            (self, kind),
            (Value::Null, _)
                | (Value::Bool(_), ColumnKind::Bool)
                | (Value::Int(_), ColumnKind::Int)
                | (Value::Decimal(_), ColumnKind::Decimal)
                | (Value::Text(_), ColumnKind::Text)
                | (Value::Id(_), ColumnKind::Id)
                | (Value::Ref(_), ColumnKind::Id)
        )
    }

    pub fn as_id(&self) -> Option<Id> {
        match self {
            Value::Id(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Value::Decimal(d) => Some(*d),
            Value::Int(i) => Some(Decimal::from(*i)),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Ordering used by min/max. Ints and decimals compare numerically, other
    /// kinds only with themselves.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Decimal(a), Value::Decimal(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Decimal(b)) => Some(Decimal::from(*a).cmp(b)),
            (Value::Decimal(a), Value::Int(b)) => Some(a.cmp(&Decimal::from(*b))),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Id(a), Value::Id(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::Text(s) => write!(f, "{:?}", s),
            Value::Id(id) => write!(f, "#{}", id),
            Value::Ref(inst) => write!(f, "&{}", inst.0),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Value::Decimal(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<InstanceId> for Value {
    fn from(v: InstanceId) -> Self {
        Value::Ref(v)
    }
}

/// Builds a `Row` from `(column, value)` pairs.
pub fn row<I, K, V>(pairs: I) -> Row
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect()
}
