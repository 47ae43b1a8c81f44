//! Combining partial results reported by concurrent workers. The merge is associative and
//! commutative so deltas can be folded in any order and any grouping.

use logflow_core::{Value, ValueMap};

/// Merges two result values.
///
/// - absent or null on one side yields the other side, two nulls yield null
/// - integers are summed into the narrowest integer variant holding the sum
/// - a float operand makes the sum a double
/// - maps are merged key by key
/// - any other pair keeps the greatest value by its serialized form
pub fn merge_values(left: Option<&Value>, right: Option<&Value>) -> Option<Value> {
    match (left, right) {
        (None, None) => None,
        (None | Some(Value::Null), Some(value)) | (Some(value), None | Some(Value::Null)) => {
            Some(value.clone())
        }
        (Some(left), Some(right)) => Some(merge_present(left, right)),
    }
}

fn merge_present(left: &Value, right: &Value) -> Value {
    if let (Some(l), Some(r)) = (left.as_i128(), right.as_i128()) {
        return match l.checked_add(r) {
            Some(sum) => Value::integer(sum),
            None => Value::Double(l as f64 + r as f64),
        };
    }
    if let (true, true, Some(l), Some(r)) = (
        left.is_numeric(),
        right.is_numeric(),
        left.as_f64(),
        right.as_f64(),
    ) {
        return Value::Double(l + r);
    }
    if let (Value::Map(l), Value::Map(r)) = (left, right) {
        return Value::Map(merge_maps(l, r));
    }
    let rank = |value: &Value| serde_json::to_string(value).unwrap_or_default();
    if rank(left) >= rank(right) {
        left.clone()
    } else {
        right.clone()
    }
}

/// Key by key merge, keys present on a single side are kept as they are.
pub fn merge_maps(left: &ValueMap, right: &ValueMap) -> ValueMap {
    let mut merged = ValueMap::new();
    for key in left.keys().chain(right.keys()) {
        if merged.contains_key(key) {
            continue;
        }
        if let Some(value) = merge_values(left.get(key), right.get(key)) {
            merged.insert(key.clone(), value);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn merge(left: Value, right: Value) -> Value {
        merge_values(Some(&left), Some(&right)).unwrap()
    }

    #[test]
    fn int_sum_widens_to_long() {
        assert_eq!(merge(Value::Int(i32::MAX), Value::Int(1)), Value::Long(2_147_483_648));
        assert_eq!(
            merge(Value::Long(4_000_000_000), Value::Int(42)),
            Value::Long(4_000_000_042)
        );
        assert_eq!(merge(Value::Long(-5), Value::Long(7)), Value::Int(2));
    }

    #[test]
    fn long_sum_widens_to_big_int() {
        assert_eq!(
            merge(Value::Long(i64::MAX), Value::Long(i64::MAX)),
            Value::BigInt(2 * i128::from(i64::MAX))
        );
        assert!(matches!(
            merge(Value::BigInt(i128::MAX), Value::Int(1)),
            Value::Double(_)
        ));
    }

    #[test]
    fn float_operand_makes_a_double() {
        assert_eq!(merge(Value::Float(3.4e8), Value::Int(3)), Value::Double(340_000_003.0));
        assert_eq!(merge(Value::Int(3), Value::Float(3.4e8)), Value::Double(340_000_003.0));
        assert_eq!(merge(Value::Double(0.5), Value::Double(0.25)), Value::Double(0.75));
    }

    #[test]
    fn null_and_absent_are_identity() {
        assert_eq!(merge(Value::Null, Value::Int(1)), Value::Int(1));
        assert_eq!(merge(Value::Int(1), Value::Null), Value::Int(1));
        assert_eq!(merge(Value::Null, Value::Null), Value::Null);
        assert_eq!(merge_values(None, Some(&Value::Int(1))), Some(Value::Int(1)));
        assert_eq!(merge_values(Some(&Value::Int(1)), None), Some(Value::Int(1)));
        assert_eq!(merge_values(None, None), None);
    }

    #[test]
    fn maps_merge_recursively() {
        let left = ValueMap::from([
            ("count".to_string(), Value::Int(2)),
            (
                "byType".to_string(),
                Value::Map(ValueMap::from([("File".to_string(), Value::Int(1))])),
            ),
        ]);
        let right = ValueMap::from([
            ("count".to_string(), Value::Int(3)),
            ("skipped".to_string(), Value::Int(1)),
            (
                "byType".to_string(),
                Value::Map(ValueMap::from([
                    ("File".to_string(), Value::Int(4)),
                    ("Note".to_string(), Value::Int(1)),
                ])),
            ),
        ]);
        let merged = merge_maps(&left, &right);
        assert_eq!(merged.get("count"), Some(&Value::Int(5)));
        assert_eq!(merged.get("skipped"), Some(&Value::Int(1)));
        assert_eq!(
            merged.get("byType"),
            Some(&Value::Map(ValueMap::from([
                ("File".to_string(), Value::Int(5)),
                ("Note".to_string(), Value::Int(1)),
            ])))
        );
        assert_eq!(merge_maps(&right, &left), merged);
    }

    #[test]
    fn non_numeric_values_merge_commutatively() {
        let a = Value::from("alpha");
        let b = Value::from("beta");
        assert_eq!(merge(a.clone(), b.clone()), merge(b.clone(), a.clone()));
        assert_eq!(merge(a.clone(), a.clone()), a);
    }

    #[test]
    fn integer_merge_is_associative() {
        let values = [Value::Int(i32::MAX), Value::Long(7), Value::Int(-12)];
        let [a, b, c] = values;
        let left = merge(merge(a.clone(), b.clone()), c.clone());
        let right = merge(a, merge(b, c));
        assert_eq!(left, right);
        assert_eq!(left, Value::Int(i32::MAX - 5));
    }
}
