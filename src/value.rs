//! Scalar/container value model shared by events, matches, and rule
//! configuration, plus the dotted-path lookup and `hashable()` coercion
//! described in spec §3 and §9.

use chrono::DateTime;

/// A value carried inside an [`Event`](crate::event::Event) or
/// [`Match`](crate::event::Match).
///
/// `Map` is an ordered `Vec` of pairs rather than a `HashMap` so that a
/// `Value` never needs to be `Hash` itself — only its [`HashableValue`]
/// projection does, produced on demand by [`hashable`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Array(Vec<Value>),
    Map(Vec<(String, Value)>),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Str(s) => s.parse().ok(),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// elastalert's truthiness test for `compound_compare_key` values:
    /// `not isinstance(val, bool) and not val` — i.e. booleans are never
    /// "falsy" for this purpose, but `Null`, `0`, `""`, and `[]` are.
    pub fn is_falsy_non_bool(&self) -> bool {
        match self {
            Value::Bool(_) => false,
            Value::Null => true,
            Value::Number(n) => *n == 0.0,
            Value::Str(s) => s.is_empty(),
            Value::Array(a) => a.is_empty(),
            Value::Map(m) => m.is_empty(),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Map(pairs) => {
                write!(f, "{{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{k}:{v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// HashableValue — canonical, Eq + Hash projection of a Value
// ---------------------------------------------------------------------------

/// The `hashable()` coercion from spec §9: a `Value` canonicalized into a
/// form that is safe to use as a `HashMap` key. Sequences become ordered
/// vectors of hashable children; maps become their pairs sorted by key.
/// Floats are compared bit-for-bit (`to_bits`), which is sufficient here
/// since query-key values are field contents (strings, ids, counts), never
/// computed floating-point results that would need epsilon comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashableValue {
    Null,
    Bool(bool),
    Number(u64),
    Str(String),
    Array(Vec<HashableValue>),
    Map(Vec<(String, HashableValue)>),
}

impl std::fmt::Display for HashableValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        hashable_to_value(self).fmt(f)
    }
}

pub fn hashable(value: &Value) -> HashableValue {
    match value {
        Value::Null => HashableValue::Null,
        Value::Bool(b) => HashableValue::Bool(*b),
        Value::Number(n) => HashableValue::Number(n.to_bits()),
        Value::Str(s) => HashableValue::Str(s.clone()),
        Value::Array(items) => HashableValue::Array(items.iter().map(hashable).collect()),
        Value::Map(pairs) => {
            let mut coerced: Vec<(String, HashableValue)> =
                pairs.iter().map(|(k, v)| (k.clone(), hashable(v))).collect();
            coerced.sort_by(|a, b| a.0.cmp(&b.0));
            HashableValue::Map(coerced)
        }
    }
}

/// Inverse of `hashable()` — recover a `Value` from its canonicalized
/// projection, used when a detector needs to re-embed a query key (itself
/// stored as `HashableValue` for map-key purposes) back into a match record.
pub fn dehash(h: &HashableValue) -> Value {
    hashable_to_value(h)
}

fn hashable_to_value(h: &HashableValue) -> Value {
    match h {
        HashableValue::Null => Value::Null,
        HashableValue::Bool(b) => Value::Bool(*b),
        HashableValue::Number(bits) => Value::Number(f64::from_bits(*bits)),
        HashableValue::Str(s) => Value::Str(s.clone()),
        HashableValue::Array(items) => Value::Array(items.iter().map(hashable_to_value).collect()),
        HashableValue::Map(pairs) => {
            Value::Map(pairs.iter().map(|(k, v)| (k.clone(), hashable_to_value(v))).collect())
        }
    }
}

// ---------------------------------------------------------------------------
// Dotted-path lookup
// ---------------------------------------------------------------------------

/// Resolve a dotted field path against a `Value::Map` or `Value::Array`.
///
/// A path component first tries an exact match against the full remaining
/// path (field names are allowed to contain literal dots), then falls back
/// to splitting on the next `.`. Within a `Value::Array`, a component may
/// select a single-key mapping whose lone key equals that component — the
/// "select by key among a sequence of single-key mappings" case from §3.
pub fn lookup_path(value: &Value, path: &str) -> Option<Value> {
    if path.is_empty() {
        return Some(value.clone());
    }
    if let Value::Map(pairs) = value
        && let Some((_, exact)) = pairs.iter().find(|(k, _)| k == path)
    {
        return Some(exact.clone());
    }

    let (head, rest) = match path.split_once('.') {
        Some((h, r)) => (h, Some(r)),
        None => (path, None),
    };

    let child = match value {
        Value::Map(pairs) => pairs.iter().find(|(k, _)| *k == head).map(|(_, v)| v)?,
        Value::Array(items) => items.iter().find_map(|item| match item {
            Value::Map(pairs) if pairs.len() == 1 && pairs[0].0 == head => Some(&pairs[0].1),
            _ => None,
        })?,
        _ => return None,
    };

    match rest {
        None => Some(child.clone()),
        Some(rest) => lookup_path(child, rest),
    }
}

// ---------------------------------------------------------------------------
// Timestamp parsing
// ---------------------------------------------------------------------------

/// Parse an event timestamp field, which is either an already-parsed
/// instant (nanoseconds since epoch, carried as `Value::Number`) or an
/// RFC3339 string.
pub fn parse_timestamp_nanos(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => Some(*n as i64),
        Value::Str(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .and_then(|dt| dt.timestamp_nanos_opt()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: Vec<(&str, Value)>) -> Value {
        Value::Map(pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    #[test]
    fn lookup_simple_field() {
        let v = map(vec![("a", Value::Number(1.0))]);
        assert_eq!(lookup_path(&v, "a"), Some(Value::Number(1.0)));
    }

    #[test]
    fn lookup_nested_dotted_path() {
        let v = map(vec![("a", map(vec![("b", Value::Str("x".into()))]))]);
        assert_eq!(lookup_path(&v, "a.b"), Some(Value::Str("x".into())));
    }

    #[test]
    fn lookup_literal_dotted_field_name() {
        let v = map(vec![("a.b", Value::Number(7.0))]);
        assert_eq!(lookup_path(&v, "a.b"), Some(Value::Number(7.0)));
    }

    #[test]
    fn lookup_sequence_of_single_key_maps() {
        let seq = Value::Array(vec![
            map(vec![("x", Value::Number(1.0))]),
            map(vec![("y", Value::Number(2.0))]),
        ]);
        let v = map(vec![("seq", seq)]);
        assert_eq!(lookup_path(&v, "seq.y"), Some(Value::Number(2.0)));
    }

    #[test]
    fn lookup_missing_returns_none() {
        let v = map(vec![("a", Value::Number(1.0))]);
        assert_eq!(lookup_path(&v, "missing"), None);
    }

    #[test]
    fn hashable_equal_for_reordered_maps() {
        let m1 = map(vec![("a", Value::Number(1.0)), ("b", Value::Number(2.0))]);
        let m2 = map(vec![("b", Value::Number(2.0)), ("a", Value::Number(1.0))]);
        assert_eq!(hashable(&m1), hashable(&m2));
    }

    #[test]
    fn falsy_non_bool() {
        assert!(Value::Null.is_falsy_non_bool());
        assert!(Value::Number(0.0).is_falsy_non_bool());
        assert!(Value::Str(String::new()).is_falsy_non_bool());
        assert!(!Value::Bool(false).is_falsy_non_bool());
        assert!(!Value::Number(1.0).is_falsy_non_bool());
    }

    #[test]
    fn parse_rfc3339_and_nanos() {
        let nanos = parse_timestamp_nanos(&Value::Str("2024-01-01T00:00:00Z".into())).unwrap();
        assert_eq!(nanos, 1_704_067_200_000_000_000);
        assert_eq!(parse_timestamp_nanos(&Value::Number(42.0)), Some(42));
    }
}
