//! Structural similarity between two JSON values.

use serde_json::Value;

/// Scores how closely `live` resembles `recorded`, in `[0, 1]`.
///
/// Primitives contribute fully on equality and nothing otherwise;
/// containers score the mean of their children, with keys or positions
/// present on only one side contributing zero. Numbers compare by value so
/// that `1` and `1.0` agree.
pub fn structural_similarity(recorded: &Value, live: &Value) -> f64 {
    match (recorded, live) {
        (Value::Object(recorded_map), Value::Object(live_map)) => {
            let mut keys: Vec<&String> = recorded_map.keys().collect();
            for key in live_map.keys() {
                if !recorded_map.contains_key(key) {
                    keys.push(key);
                }
            }
            if keys.is_empty() {
                return 1.0;
            }
            let total: f64 = keys
                .iter()
                .map(|key| match (recorded_map.get(*key), live_map.get(*key)) {
                    (Some(a), Some(b)) => structural_similarity(a, b),
                    _ => 0.0,
                })
                .sum();
            total / keys.len() as f64
        }
        (Value::Array(recorded_items), Value::Array(live_items)) => {
            let len = recorded_items.len().max(live_items.len());
            if len == 0 {
                return 1.0;
            }
            let total: f64 = recorded_items
                .iter()
                .zip(live_items.iter())
                .map(|(a, b)| structural_similarity(a, b))
                .sum();
            total / len as f64
        }
        (Value::Number(a), Value::Number(b)) => {
            let equal = match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => a == b,
                _ => a == b,
            };
            if equal { 1.0 } else { 0.0 }
        }
        (a, b) => {
            if a == b { 1.0 } else { 0.0 }
        }
    }
}
