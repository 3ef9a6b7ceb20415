//! CardinalityRule (spec §4.9), grounded on `ruletypes.py`'s `CardinalityRule`.
//! Tracks the set of distinct `cardinality_field` values seen per key and
//! matches when that set grows past `max_cardinality` or stays below
//! `min_cardinality` for longer than `timeframe`.

use std::collections::HashMap;
use std::time::Duration;

use crate::config::RuleConfig;
use crate::detector::{Detector, MatchBuffer};
use crate::error::CoreResult;
use crate::event::{Event, Match};
use crate::value::{hashable, parse_timestamp_nanos, HashableValue, Value};

fn all_key() -> HashableValue {
    HashableValue::Str("all".to_string())
}

pub struct CardinalityRule {
    ts_field: String,
    query_key: Option<String>,
    cardinality_field: String,
    max_cardinality: Option<i64>,
    min_cardinality: Option<i64>,
    timeframe: Duration,

    cardinality_cache: HashMap<HashableValue, HashMap<HashableValue, i64>>,
    first_event: HashMap<HashableValue, i64>,
    buffer: MatchBuffer,
}

impl CardinalityRule {
    pub fn new(config: &RuleConfig) -> CoreResult<Self> {
        let timeframe = config.require_duration("timeframe")?;
        let cardinality_field = config.require_str("cardinality_field")?.to_string();
        let max_cardinality = config.get_f64("max_cardinality").map(|n| n as i64);
        let min_cardinality = config.get_f64("min_cardinality").map(|n| n as i64);
        if max_cardinality.is_none() && min_cardinality.is_none() {
            return Err(crate::error::CoreError::configuration(
                "CardinalityRule must have one of either max_cardinality or min_cardinality",
            ));
        }
        Ok(Self {
            ts_field: config.get_str("timestamp_field").unwrap_or("@timestamp").to_string(),
            query_key: config.get_str("query_key").map(str::to_string),
            cardinality_field,
            max_cardinality,
            min_cardinality,
            timeframe,
            cardinality_cache: HashMap::new(),
            first_event: HashMap::new(),
            buffer: MatchBuffer::default(),
        })
    }

    fn event_ts(&self, event: &Event) -> i64 {
        event.get_path(&self.ts_field).as_ref().and_then(parse_timestamp_nanos).unwrap_or(0)
    }

    fn key_of(&self, event: &Event) -> HashableValue {
        match &self.query_key {
            None => all_key(),
            Some(field) => hashable(&event.get_path(field).unwrap_or(Value::Null)),
        }
    }

    /// Mirrors `check_for_match(key, event, gc=True)`: on a first pass that
    /// finds a candidate match, run garbage collection once (stale terms
    /// are only pruned there) then re-test with `gc=false` before
    /// committing. Recursion depth is bounded at two calls.
    fn check_for_match(&mut self, key: HashableValue, event: &Event, gc: bool) {
        let ts = self.event_ts(event);
        let first = self.first_event.get(&key).copied().unwrap_or(ts);
        let timeframe_elapsed = (ts - first) as u64 > self.timeframe.as_nanos() as u64;

        let count = self.cardinality_cache.get(&key).map_or(0, |m| m.len() as i64);
        let over_max = self.max_cardinality.is_some_and(|max| count > max);
        let under_min = self.min_cardinality.is_some_and(|min| count < min) && timeframe_elapsed;

        if !(over_max || under_min) {
            return;
        }

        if gc {
            self.garbage_collect(ts);
            self.check_for_match(key, event, false);
        } else {
            self.first_event.remove(&key);
            let m = Match::from_event(event);
            self.buffer.push(m);
        }
    }
}

impl Detector for CardinalityRule {
    fn ingest_events(&mut self, events: &[Event]) -> CoreResult<()> {
        for event in events {
            let key = self.key_of(event);
            self.cardinality_cache.entry(key.clone()).or_default();
            let ts = self.event_ts(event);
            self.first_event.entry(key.clone()).or_insert(ts);

            if let Some(value) = event.get_path(&self.cardinality_field) {
                let value = hashable(&value);
                self.cardinality_cache.get_mut(&key).unwrap().insert(value, ts);
                self.check_for_match(key, event, true);
            }
        }
        Ok(())
    }

    /// Drop `(value, ts)` pairs older than `timeframe`; for `min_cardinality`
    /// rules, additionally synthesize a placeholder event per key so an
    /// under-cardinality match can fire even without new traffic.
    fn garbage_collect(&mut self, now: i64) {
        let keys: Vec<HashableValue> = self.cardinality_cache.keys().cloned().collect();
        for key in &keys {
            if let Some(values) = self.cardinality_cache.get_mut(key) {
                values.retain(|_, &mut last_ts| (now - last_ts) as u64 <= self.timeframe.as_nanos() as u64);
            }
        }

        if self.min_cardinality.is_some() {
            for key in keys {
                let mut placeholder = Event::new().with_field(self.ts_field.clone(), Value::Number(now as f64));
                if let Some(field) = &self.query_key {
                    placeholder = placeholder.with_field(field.clone(), crate::value::dehash(&key));
                }
                self.check_for_match(key, &placeholder, false);
            }
        }
    }

    fn drain_matches(&mut self) -> Vec<Match> {
        self.buffer.drain()
    }

    fn format_match(&self, m: &Match) -> String {
        match (self.max_cardinality, self.min_cardinality) {
            (Some(max), _) => format!(
                "A maximum of {max} unique {}(s) occurred since last alert, around {:?}",
                self.cardinality_field, m.get(&self.ts_field)
            ),
            (None, Some(min)) => format!(
                "Less than {min} unique {}(s) occurred since last alert, around {:?}",
                self.cardinality_field, m.get(&self.ts_field)
            ),
            (None, None) => unreachable!("constructor requires at least one bound"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn evt(ts_secs: i64, ip: &str) -> Event {
        Event::new()
            .with_field("@timestamp", Value::Number((ts_secs * 1_000_000_000) as f64))
            .with_field("ip", Value::Str(ip.to_string()))
    }

    #[test]
    fn max_cardinality_fires_once_exceeded() {
        let cfg = RuleConfig::new(json!({"max_cardinality": 3, "cardinality_field": "ip", "timeframe": 60.0}));
        let mut rule = CardinalityRule::new(&cfg).unwrap();
        rule.ingest_events(&[evt(0, "a"), evt(1, "b"), evt(2, "c")]).unwrap();
        assert!(rule.drain_matches().is_empty());
        rule.ingest_events(&[evt(3, "d")]).unwrap();
        assert_eq!(rule.drain_matches().len(), 1);
    }

    #[test]
    fn gc_evicts_stale_values_and_silences_further_matches() {
        let cfg = RuleConfig::new(json!({"max_cardinality": 3, "cardinality_field": "ip", "timeframe": 60.0}));
        let mut rule = CardinalityRule::new(&cfg).unwrap();
        rule.ingest_events(&[evt(0, "a"), evt(1, "b"), evt(2, "c"), evt(3, "d")]).unwrap();
        rule.drain_matches();
        rule.ingest_events(&[evt(100, "a")]).unwrap();
        assert!(rule.drain_matches().is_empty());
    }

    #[test]
    fn min_cardinality_requires_timeframe_elapsed() {
        let cfg = RuleConfig::new(json!({"min_cardinality": 2, "cardinality_field": "ip", "timeframe": 60.0}));
        let mut rule = CardinalityRule::new(&cfg).unwrap();
        rule.ingest_events(&[evt(0, "a")]).unwrap();
        assert!(rule.drain_matches().is_empty());
        rule.garbage_collect(61_000_000_000);
        assert_eq!(rule.drain_matches().len(), 1);
    }
}
