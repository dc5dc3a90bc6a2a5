//! Subscription ids
//!
//! A subscription id is a 64-bit FNV-1a hash over the optional name and the
//! query with object keys visited in sorted order, so two queries that differ
//! only in key order share one server-side subscription. Collisions are
//! possible; the id is a multiplexing key, not an identity guarantee.

use serde_json::Value;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

struct Fnv(u64);

impl Fnv {
    fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.0 ^= u64::from(*byte);
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }

    // Tag each node so `"1"` and `1` or `[]` and `{}` never collide trivially.
    fn value(&mut self, value: &Value) {
        match value {
            Value::Null => self.write(b"n"),
            Value::Bool(b) => self.write(if *b { b"t" } else { b"f" }),
            Value::Number(n) => {
                self.write(b"#");
                self.write(n.to_string().as_bytes());
            }
            Value::String(s) => {
                self.write(b"s");
                self.write(&(s.len() as u64).to_le_bytes());
                self.write(s.as_bytes());
            }
            Value::Array(items) => {
                self.write(b"[");
                for item in items {
                    self.value(item);
                }
                self.write(b"]");
            }
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                self.write(b"{");
                for key in keys {
                    self.write(&(key.len() as u64).to_le_bytes());
                    self.write(key.as_bytes());
                    self.value(&map[key]);
                }
                self.write(b"}");
            }
        }
    }
}

/// Compute the subscription id for a named (or anonymous) query
pub fn subscription_id(name: Option<&str>, query: &Value) -> u64 {
    let mut hasher = Fnv(FNV_OFFSET);
    match name {
        Some(name) => {
            hasher.write(b"N");
            hasher.write(name.as_bytes());
        }
        None => hasher.write(b"-"),
    }
    hasher.write(&[0]);
    hasher.value(query);
    hasher.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"a":1,"b":{"x":[1,2],"y":null}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b":{"y":null,"x":[1,2]},"a":1}"#).unwrap();
        assert_eq!(subscription_id(None, &a), subscription_id(None, &b));
    }

    #[test]
    fn test_name_is_part_of_the_id() {
        let q = json!({ "limit": 10 });
        assert_ne!(
            subscription_id(Some("feed"), &q),
            subscription_id(Some("alerts"), &q)
        );
        assert_ne!(subscription_id(Some("feed"), &q), subscription_id(None, &q));
    }

    #[test]
    fn test_value_types_are_distinguished() {
        assert_ne!(
            subscription_id(None, &json!("1")),
            subscription_id(None, &json!(1))
        );
        assert_ne!(
            subscription_id(None, &json!([])),
            subscription_id(None, &json!({}))
        );
        assert_ne!(
            subscription_id(None, &json!(["ab", "c"])),
            subscription_id(None, &json!(["a", "bc"]))
        );
    }

    #[test]
    fn test_pinned_values() {
        // Ids are persisted with the cache, so the scheme must not drift.
        assert_eq!(subscription_id(None, &Value::Null), 0xde1a_0117_ddc7_1c92);
        assert_eq!(
            subscription_id(Some("feed"), &json!({ "limit": 10 })),
            0x5e95_ba6e_ebd1_6a13
        );
    }
}
