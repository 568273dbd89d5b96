use crate::error::AppError;
use crate::schema::ColumnKind;
use crate::value::{Row, Value};
use rust_decimal::Decimal;
use std::cmp::Ordering;

/// Aggregation evaluated over the related rows of one parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Aggregation {
    Sum(String),
    Count,
    Min(String),
    Max(String),
    Avg(String),
}

impl Aggregation {
    pub fn sum(field: &str) -> Self {
        Aggregation::Sum(field.to_string())
    }

    pub fn count() -> Self {
        Aggregation::Count
    }

    pub fn min(field: &str) -> Self {
        Aggregation::Min(field.to_string())
    }

    pub fn max(field: &str) -> Self {
        Aggregation::Max(field.to_string())
    }

    pub fn avg(field: &str) -> Self {
        Aggregation::Avg(field.to_string())
    }

    pub fn field(&self) -> Option<&str> {
        match self {
            Aggregation::Sum(f) | Aggregation::Min(f) | Aggregation::Max(f) | Aggregation::Avg(f) => Some(f),
            Aggregation::Count => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Aggregation::Sum(_) => "sum",
            Aggregation::Count => "count",
            Aggregation::Min(_) => "min",
            Aggregation::Max(_) => "max",
            Aggregation::Avg(_) => "avg",
        }
    }

    /// Checks the aggregated field kind ahead of any evaluation.
    pub fn accepts(&self, field_kind: ColumnKind) -> bool {
        match self {
            Aggregation::Sum(_) | Aggregation::Avg(_) => field_kind.is_numeric(),
            Aggregation::Min(_) | Aggregation::Max(_) => field_kind != ColumnKind::Bool,
            Aggregation::Count => true,
        }
    }

    /// Kind of the value this aggregation yields over a field of `field_kind`.
    pub fn result_kind(&self, field_kind: Option<ColumnKind>) -> Option<ColumnKind> {
        match self {
            Aggregation::Count => Some(ColumnKind::Int),
            Aggregation::Avg(_) => Some(ColumnKind::Decimal),
            Aggregation::Sum(_) | Aggregation::Min(_) | Aggregation::Max(_) => field_kind,
        }
    }

    /// Whether every result over a field of `field_kind` can be coerced into a `target` column.
    /// Only `Int` widens; a decimal result never narrows into an `Int` column.
    pub fn writable_into(&self, field_kind: Option<ColumnKind>, target: ColumnKind) -> bool {
        match self.result_kind(field_kind) {
            Some(kind) => kind == target || (kind == ColumnKind::Int && target == ColumnKind::Decimal),
            None => false,
        }
    }

    /// Evaluates with SQL semantics: nulls are ignored, and sum/min/max/avg of
    /// no values is null while count of no rows is 0.
    pub fn evaluate<'a, I>(&self, rows: I) -> Result<Value, AppError>
    where
        I: IntoIterator<Item = &'a Row>,
    {
        match self {
            Aggregation::Count => {
                let n = rows.into_iter().count();
                i64::try_from(n)
                    .map(Value::Int)
                    .map_err(|_| AppError::Evaluation(format!("count {} overflows", n)))
            }
            Aggregation::Sum(field) => sum(field, values(field, rows).into_iter()),
            Aggregation::Avg(field) => {
                let vals = values(field, rows);
                let n = vals.len();
                match sum(field, vals.into_iter())? {
                    Value::Null => Ok(Value::Null),
                    total => {
                        let total = total.as_decimal()
                            .ok_or_else(|| AppError::Evaluation(format!("avg({}) over non numeric values", field)))?;
                        total.checked_div(Decimal::from(n as u64))
                            .map(Value::Decimal)
                            .ok_or_else(|| AppError::Evaluation(format!("avg({}) overflows", field)))
                    }
                }
            }
            Aggregation::Min(field) => extreme(field, values(field, rows).into_iter(), Ordering::Less),
            Aggregation::Max(field) => extreme(field, values(field, rows).into_iter(), Ordering::Greater),
        }
    }
}

fn values<'a, I>(field: &str, rows: I) -> Vec<&'a Value>
where
    I: IntoIterator<Item = &'a Row>,
{
    rows.into_iter()
        .filter_map(|row| row.get(field))
        .filter(|v| !v.is_null())
        .collect()
}

fn sum<'a>(field: &str, vals: impl Iterator<Item = &'a Value>) -> Result<Value, AppError> {
    let mut acc = Value::Null;
    for v in vals {
        acc = match (&acc, v) {
            (Value::Null, Value::Int(i)) => Value::Int(*i),
            (Value::Null, Value::Decimal(d)) => Value::Decimal(*d),
            (Value::Int(a), Value::Int(b)) => Value::Int(a.checked_add(*b)
                .ok_or_else(|| AppError::Evaluation(format!("sum({}) overflows", field)))?),
            (Value::Int(_), Value::Decimal(_)) | (Value::Decimal(_), Value::Int(_)) | (Value::Decimal(_), Value::Decimal(_)) => {
                let (a, b) = (acc.as_decimal(), v.as_decimal());
                match (a, b) {
                    (Some(a), Some(b)) => Value::Decimal(a.checked_add(b)
                        .ok_or_else(|| AppError::Evaluation(format!("sum({}) overflows", field)))?),
                    _ => unreachable!("numeric values always convert to decimal"),
                }
            }
            (_, other) => {
                return Err(AppError::Evaluation(format!("sum({}) over {} value {}", field, other.kind_name(), other)));
            }
        };
    }
    Ok(acc)
}

fn extreme<'a>(field: &str, vals: impl Iterator<Item = &'a Value>, wanted: Ordering) -> Result<Value, AppError> {
    let mut best: Option<&Value> = None;
    for v in vals {
        best = match best {
            None => Some(v),
            Some(current) => match v.compare(current) {
                Some(ord) if ord == wanted => Some(v),
                Some(_) => Some(current),
                None => {
                    return Err(AppError::Evaluation(format!("{}({}) cannot compare {} with {}", if wanted == Ordering::Less { "min" } else { "max" }, field, v.kind_name(), current.kind_name())));
                }
            },
        };
    }
    Ok(best.cloned().unwrap_or(Value::Null))
}

/// Converts an aggregation result into the representation of the target column.
pub fn coerce(value: Value, column: &str, kind: ColumnKind) -> Result<Value, AppError> {
    match (value, kind) {
        (Value::Null, _) => Ok(Value::Null),
        (Value::Int(i), ColumnKind::Decimal) => Ok(Value::Decimal(Decimal::from(i))),
        (Value::Decimal(d), ColumnKind::Int) if d.fract().is_zero() => {
            i64::try_from(d).map(Value::Int).map_err(|_| AppError::TypeMismatch {
                column: column.to_string(),
                expected: kind,
                found: d.to_string(),
            })
        }
        (v, k) if v.fits(k) && !matches!(v, Value::Ref(_)) => Ok(v),
        (v, k) => Err(AppError::TypeMismatch { column: column.to_string(), expected: k, found: format!("{} {}", v.kind_name(), v) }),
    }
}
