//! Cross-type ordering of BSON values, as the server sorts them in an index.
//!
//! Comparison operators in a query filter only match values of the same
//! type bracket; an index walk with cursor bounds follows this order
//! instead.

use mongodb::bson::Bson;
use std::cmp::Ordering;

/// Orders values the way the server sorts mixed-type fields.
pub fn compare_bson(a: &Bson, b: &Bson) -> Ordering {
    match (a, b) {
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (Bson::String(x), Bson::String(y)) => x.cmp(y),
        (Bson::DateTime(x), Bson::DateTime(y)) => x.cmp(y),
        (Bson::Timestamp(x), Bson::Timestamp(y)) => {
            (x.time, x.increment).cmp(&(y.time, y.increment))
        }
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::Binary(x), Bson::Binary(y)) => x.bytes.cmp(&y.bytes),
        _ => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => type_rank(a).cmp(&type_rank(b)),
        },
    }
}

/// True when a filter comparison between `a` and `b` can match at all.
pub fn same_type_bracket(a: &Bson, b: &Bson) -> bool {
    type_rank(a) == type_rank(b)
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(f64::from(*n)),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::MinKey => 0,
        Bson::Null | Bson::Undefined => 1,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 2,
        Bson::String(_) | Bson::Symbol(_) => 3,
        Bson::Document(_) => 4,
        Bson::Array(_) => 5,
        Bson::Binary(_) => 6,
        Bson::ObjectId(_) => 7,
        Bson::Boolean(_) => 8,
        Bson::DateTime(_) => 9,
        Bson::Timestamp(_) => 10,
        Bson::RegularExpression(_) => 11,
        Bson::MaxKey => 13,
        _ => 12,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::oid::ObjectId;

    #[test]
    fn test_compare_bson() {
        assert_eq!(compare_bson(&Bson::Int32(2), &Bson::Int64(10)), Ordering::Less);
        assert_eq!(compare_bson(&Bson::Double(2.5), &Bson::Int32(2)), Ordering::Greater);
        assert_eq!(
            compare_bson(&Bson::Int32(99), &Bson::String("a".to_string())),
            Ordering::Less
        );
        let a = ObjectId::parse_str("5f1e9b2c8e4b0a1d2c3b4a59").unwrap();
        let b = ObjectId::parse_str("5f1e9b2c8e4b0a1d2c3b4a5a").unwrap();
        assert_eq!(
            compare_bson(&Bson::ObjectId(a), &Bson::ObjectId(b)),
            Ordering::Less
        );
        assert_eq!(
            compare_bson(&Bson::String("zzz".to_string()), &Bson::ObjectId(a)),
            Ordering::Less
        );
    }

    #[test]
    fn test_type_brackets() {
        assert!(same_type_bracket(&Bson::Int32(1), &Bson::Double(2.0)));
        assert!(!same_type_bracket(
            &Bson::String("a".to_string()),
            &Bson::ObjectId(ObjectId::new())
        ));
    }
}
