//! ChangeRule (spec §4.4): matches when a set of tracked fields changes
//! value for the same query key. Grounded on `ruletypes.py`'s `ChangeRule`.

use std::collections::HashMap;
use std::time::Duration;

use crate::config::RuleConfig;
use crate::detector::{Detector, MatchBuffer};
use crate::error::CoreResult;
use crate::event::{Event, Match};
use crate::value::{hashable, parse_timestamp_nanos, HashableValue, Value};

pub struct ChangeRule {
    query_key: String,
    compound_compare_key: Vec<String>,
    ignore_null: bool,
    timeframe: Option<Duration>,
    ts_field: String,
    occurrences: HashMap<HashableValue, Vec<Value>>,
    occurrence_time: HashMap<HashableValue, i64>,
    /// Mirrors `ruletypes.py`'s `change_map`: a single shared slot per key,
    /// last-write-wins when a key changes more than once before a consumer
    /// reads it back — the "known defect" noted in spec §9. Our matches
    /// already carry `old_value`/`new_value` baked in at push time, so this
    /// map exists for state parity, not as the read path for a match.
    change_map: HashMap<HashableValue, (Vec<Value>, Vec<Value>)>,
    buffer: MatchBuffer,
}

impl ChangeRule {
    pub fn new(config: &RuleConfig) -> CoreResult<Self> {
        let query_key = config.require_str("query_key")?.to_string();
        let compound_compare_key = config.get_string_list("compound_compare_key");
        let ignore_null = config.get_bool_or("ignore_null", false);
        let timeframe = config.get_duration("timeframe");
        let ts_field = config.get_str("timestamp_field").unwrap_or("@timestamp").to_string();
        Ok(Self {
            query_key,
            compound_compare_key,
            ignore_null,
            timeframe,
            ts_field,
            occurrences: HashMap::new(),
            occurrence_time: HashMap::new(),
            change_map: HashMap::new(),
            buffer: MatchBuffer::default(),
        })
    }

    fn event_ts(&self, event: &Event) -> i64 {
        event
            .get_path(&self.ts_field)
            .as_ref()
            .and_then(parse_timestamp_nanos)
            .unwrap_or(0)
    }
}

impl Detector for ChangeRule {
    fn ingest_events(&mut self, events: &[Event]) -> CoreResult<()> {
        for event in events {
            let key = hashable(&event.get_path(&self.query_key).unwrap_or(Value::Null));
            let values: Vec<Value> = self
                .compound_compare_key
                .iter()
                .map(|field| event.get_path(field).unwrap_or(Value::Null))
                .collect();

            if self.ignore_null && values.iter().any(Value::is_falsy_non_bool) {
                continue;
            }

            let mut changed = false;
            if let Some(previous) = self.occurrences.get(&key) {
                changed = previous
                    .iter()
                    .zip(values.iter())
                    .any(|(old, new)| old != new);
                if changed {
                    self.change_map.insert(key.clone(), (previous.clone(), values.clone()));
                    if let (Some(timeframe), Some(&last_ts)) =
                        (self.timeframe, self.occurrence_time.get(&key))
                    {
                        let ts = self.event_ts(event);
                        changed = (ts - last_ts) as u64 <= timeframe.as_nanos() as u64;
                    }
                }
            }

            if changed {
                let (old_value, new_value) = self.change_map.get(&key).cloned().unwrap();
                let m = Match::from_event(event)
                    .with_field("old_value", Value::Array(old_value))
                    .with_field("new_value", Value::Array(new_value));
                self.buffer.push(m);
            }

            self.occurrences.insert(key.clone(), values);
            if self.timeframe.is_some() {
                self.occurrence_time.insert(key, self.event_ts(event));
            }
        }
        Ok(())
    }

    fn garbage_collect(&mut self, _now: i64) {}

    fn drain_matches(&mut self) -> Vec<Match> {
        self.buffer.drain()
    }

    fn format_match(&self, m: &Match) -> String {
        format!(
            "Field(s) {:?} changed for {} ({:?} -> {:?})",
            self.compound_compare_key,
            self.query_key,
            m.get("old_value"),
            m.get("new_value")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn matches_on_value_change_for_same_key() {
        let cfg = RuleConfig::new(json!({
            "query_key": "user",
            "compound_compare_key": ["status"],
            "ignore_null": true,
        }));
        let mut rule = ChangeRule::new(&cfg).unwrap();
        let e1 = Event::new()
            .with_field("user", Value::Str("u".into()))
            .with_field("status", Value::Str("ok".into()))
            .with_field("@timestamp", Value::Number(0.0));
        let e2 = Event::new()
            .with_field("user", Value::Str("u".into()))
            .with_field("status", Value::Str("err".into()))
            .with_field("@timestamp", Value::Number(1_000_000_000.0));
        rule.ingest_events(&[e1]).unwrap();
        assert!(rule.drain_matches().is_empty());
        rule.ingest_events(&[e2]).unwrap();
        let matches = rule.drain_matches();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].get("old_value"), Some(&Value::Array(vec![Value::Str("ok".into())])));
        assert_eq!(matches[0].get("new_value"), Some(&Value::Array(vec![Value::Str("err".into())])));
    }

    #[test]
    fn no_match_on_first_sighting() {
        let cfg = RuleConfig::new(json!({"query_key": "user", "compound_compare_key": ["status"], "ignore_null": false}));
        let mut rule = ChangeRule::new(&cfg).unwrap();
        let e = Event::new()
            .with_field("user", Value::Str("u".into()))
            .with_field("status", Value::Str("ok".into()));
        rule.ingest_events(&[e]).unwrap();
        assert!(rule.drain_matches().is_empty());
    }
}
