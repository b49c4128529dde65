//! The polymorphic value representation shared by the predicate evaluator
//! and the plan restorer, together with the value-compare primitive.

use std::cmp::Ordering;

use crate::types::Oid;

/// A database value. `Null` is a first-class member: SQL comparison rules
/// treat it as "unknown", the total order used for sorting places it first.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum DbValue {
    #[default]
    Null,
    Int(i32),
    Bigint(i64),
    Double(f64),
    Varchar(String),
    Sequence(Vec<DbValue>),
    Oid(Oid),
}

impl DbValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DbValue::Null)
    }

    /// The value as a double, when it is numeric.
    fn as_double(&self) -> Option<f64> {
        match self {
            DbValue::Int(v) => Some(*v as f64),
            DbValue::Bigint(v) => Some(*v as f64),
            DbValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as a 64-bit integer, when it is an integer.
    pub fn as_bigint(&self) -> Option<i64> {
        match self {
            DbValue::Int(v) => Some(*v as i64),
            DbValue::Bigint(v) => Some(*v),
            _ => None,
        }
    }

    /// The sequence elements, when the value is a sequence.
    pub fn as_sequence(&self) -> Option<&[DbValue]> {
        match self {
            DbValue::Sequence(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DbValue::Varchar(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i32> for DbValue {
    fn from(v: i32) -> Self {
        DbValue::Int(v)
    }
}

impl From<i64> for DbValue {
    fn from(v: i64) -> Self {
        DbValue::Bigint(v)
    }
}

impl From<&str> for DbValue {
    fn from(v: &str) -> Self {
        DbValue::Varchar(v.to_owned())
    }
}

/// Outcome of a value comparison. `Unknown` means at least one operand was
/// NULL under ordinal comparison rules.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpResult {
    Lt,
    Eq,
    Gt,
    Unknown,
}

impl CmpResult {
    fn from_ordering(ord: Ordering) -> CmpResult {
        match ord {
            Ordering::Less => CmpResult::Lt,
            Ordering::Equal => CmpResult::Eq,
            Ordering::Greater => CmpResult::Gt,
        }
    }
}

/// Compare two values.
///
/// With `total_order` set, NULL participates in the order: it sorts before
/// every other value and two NULLs are equal. Without it, any NULL operand
/// yields `CmpResult::Unknown`.
///
/// Returns `None` when the operands are not comparable (incompatible
/// domains, or a NaN double).
pub fn tp_value_compare(a: &DbValue, b: &DbValue, total_order: bool) -> Option<CmpResult> {
    match (a, b) {
        (DbValue::Null, DbValue::Null) => {
            if total_order {
                Some(CmpResult::Eq)
            } else {
                Some(CmpResult::Unknown)
            }
        }
        (DbValue::Null, _) => {
            if total_order {
                Some(CmpResult::Lt)
            } else {
                Some(CmpResult::Unknown)
            }
        }
        (_, DbValue::Null) => {
            if total_order {
                Some(CmpResult::Gt)
            } else {
                Some(CmpResult::Unknown)
            }
        }
        (DbValue::Varchar(x), DbValue::Varchar(y)) => {
            Some(CmpResult::from_ordering(x.as_bytes().cmp(y.as_bytes())))
        }
        (DbValue::Oid(x), DbValue::Oid(y)) => Some(CmpResult::from_ordering(x.cmp(y))),
        (DbValue::Sequence(x), DbValue::Sequence(y)) => compare_sequences(x, y, total_order),
        _ => {
            // Numeric cross-domain comparison. Exact integer compare when
            // both sides are integers, double compare otherwise.
            if let (Some(x), Some(y)) = (a.as_bigint(), b.as_bigint()) {
                return Some(CmpResult::from_ordering(x.cmp(&y)));
            }
            let x = a.as_double()?;
            let y = b.as_double()?;
            x.partial_cmp(&y).map(CmpResult::from_ordering)
        }
    }
}

fn compare_sequences(x: &[DbValue], y: &[DbValue], total_order: bool) -> Option<CmpResult> {
    for (xe, ye) in x.iter().zip(y.iter()) {
        match tp_value_compare(xe, ye, total_order)? {
            CmpResult::Eq => continue,
            other => return Some(other),
        }
    }
    Some(CmpResult::from_ordering(x.len().cmp(&y.len())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_cross_domain() {
        assert_eq!(
            tp_value_compare(&DbValue::Int(3), &DbValue::Bigint(3), false),
            Some(CmpResult::Eq)
        );
        assert_eq!(
            tp_value_compare(&DbValue::Int(3), &DbValue::Double(3.5), false),
            Some(CmpResult::Lt)
        );
        assert_eq!(
            tp_value_compare(&DbValue::Bigint(i64::MAX), &DbValue::Bigint(i64::MAX - 1), false),
            Some(CmpResult::Gt)
        );
    }

    #[test]
    fn null_rules() {
        let null = DbValue::Null;
        let one = DbValue::Int(1);
        assert_eq!(tp_value_compare(&null, &one, false), Some(CmpResult::Unknown));
        assert_eq!(tp_value_compare(&null, &null, false), Some(CmpResult::Unknown));
        assert_eq!(tp_value_compare(&null, &one, true), Some(CmpResult::Lt));
        assert_eq!(tp_value_compare(&null, &null, true), Some(CmpResult::Eq));
    }

    #[test]
    fn not_comparable() {
        assert_eq!(
            tp_value_compare(&DbValue::Int(1), &DbValue::Varchar("1".into()), false),
            None
        );
        assert_eq!(
            tp_value_compare(&DbValue::Double(f64::NAN), &DbValue::Double(1.0), false),
            None
        );
    }

    #[test]
    fn sequences_compare_elementwise() {
        let a = DbValue::Sequence(vec![DbValue::Int(1), DbValue::Int(2)]);
        let b = DbValue::Sequence(vec![DbValue::Int(1), DbValue::Int(3)]);
        let c = DbValue::Sequence(vec![DbValue::Int(1)]);
        assert_eq!(tp_value_compare(&a, &b, false), Some(CmpResult::Lt));
        assert_eq!(tp_value_compare(&a, &c, false), Some(CmpResult::Gt));
        assert_eq!(tp_value_compare(&a, &a, false), Some(CmpResult::Eq));
    }
}
