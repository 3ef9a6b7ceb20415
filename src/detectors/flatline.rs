//! FlatlineRule (spec §4.6), a `FrequencyRule` subclass in the original
//! implementation: alerts when a key's event rate drops below `threshold`
//! instead of crossing it from below. Grounded on `ruletypes.py`'s
//! `FlatlineRule`.

use std::collections::HashMap;

use crate::config::RuleConfig;
use crate::detector::{Detector, MatchBuffer};
use crate::error::CoreResult;
use crate::event::{Event, Match};
use crate::value::{dehash, HashableValue, Value};

use super::frequency::{all_key, query_key_of, WindowedState};

pub struct FlatlineRule {
    state: WindowedState,
    threshold: i64,
    forget_keys: bool,
    first_event: HashMap<HashableValue, i64>,
    buffer: MatchBuffer,
}

impl FlatlineRule {
    pub fn new(config: &RuleConfig) -> CoreResult<Self> {
        let threshold = config.require_f64("threshold")? as i64;
        let timeframe = config.require_duration("timeframe")?;
        let ts_field = config.get_str("timestamp_field").unwrap_or("@timestamp").to_string();
        let query_key = config.get_str("query_key").map(str::to_string);
        let forget_keys = config.get_bool_or("forget_keys", false);
        Ok(Self {
            state: WindowedState::new(timeframe, ts_field, query_key),
            threshold,
            forget_keys,
            first_event: HashMap::new(),
            buffer: MatchBuffer::default(),
        })
    }

    /// Only called on the final invocation per ingest batch (spec §4.6):
    /// checking between every appended event would produce false matches
    /// on partially-filled windows.
    fn check_for_match(&mut self, key: HashableValue) {
        let Some(window) = self.state.occurrences.get(&key) else { return };
        let Some((last_event, _)) = window.iter().last() else { return };
        let most_recent_ts = self.state.event_ts(last_event);

        let first = *self.first_event.entry(key.clone()).or_insert(most_recent_ts);
        if (most_recent_ts - first) < self.state.timeframe.as_nanos() as i64 {
            return;
        }

        let count = window.count();
        if count >= self.threshold {
            return;
        }

        let query_key_name = self.state.query_key.clone().unwrap_or_else(|| "query_key".to_string());
        let mut m = Match::from_event(last_event)
            .with_field("key", dehash(&key))
            .with_field("count", Value::Number(count as f64));
        m.fields.insert(query_key_name, dehash(&key));
        self.buffer.push(m);

        if self.forget_keys {
            self.first_event.remove(&key);
            self.state.occurrences.remove(&key);
        } else {
            let least_recent_ts = self.state.event_ts(&window.iter().next().unwrap().0);
            let timeframe_ago = most_recent_ts - self.state.timeframe.as_nanos() as i64;
            self.first_event.insert(key, least_recent_ts.min(timeframe_ago));
        }
    }
}

impl Detector for FlatlineRule {
    fn ingest_events(&mut self, events: &[Event]) -> CoreResult<()> {
        let query_key = self.state.query_key.clone();
        let mut last_key = None;
        for event in events {
            let key = query_key_of(event, query_key.as_deref());
            self.state.window_mut(key.clone()).append((event.clone(), 1));
            last_key = Some(key);
        }
        if let Some(key) = last_key {
            self.check_for_match(key);
        }
        Ok(())
    }

    fn garbage_collect(&mut self, now: i64) {
        let default: Vec<HashableValue> = if self.state.query_key.is_none() {
            vec![all_key()]
        } else {
            Vec::new()
        };
        let keys: Vec<HashableValue> = if self.state.occurrences.is_empty() {
            default
        } else {
            self.state.occurrences.keys().cloned().collect()
        };

        let ts_field = self.state.ts_field.clone();
        for key in keys {
            let placeholder = Event::placeholder().with_field(ts_field.clone(), Value::Number(now as f64));
            self.state.window_mut(key.clone()).append((placeholder, 0));
            self.first_event.entry(key.clone()).or_insert(now);
            self.check_for_match(key);
        }
    }

    fn drain_matches(&mut self) -> Vec<Match> {
        self.buffer.drain()
    }

    fn format_match(&self, m: &Match) -> String {
        format!(
            "Abnormally low event count (< {}) since {:?}: {:?}",
            self.threshold,
            self.state.timeframe,
            m.get("count")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn evt(ts_secs: i64) -> Event {
        Event::new().with_field("@timestamp", Value::Number((ts_secs * 1_000_000_000) as f64))
    }

    #[test]
    fn gc_placeholder_after_timeframe_reports_count() {
        let cfg = RuleConfig::new(json!({"threshold": 5, "timeframe": 60.0}));
        let mut rule = FlatlineRule::new(&cfg).unwrap();
        rule.ingest_events(&[evt(0)]).unwrap();
        assert!(rule.drain_matches().is_empty());
        rule.garbage_collect(61_000_000_000);
        let matches = rule.drain_matches();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].get("count"), Some(&Value::Number(1.0)));
    }

    #[test]
    fn no_match_before_timeframe_elapsed() {
        let cfg = RuleConfig::new(json!({"threshold": 5, "timeframe": 60.0}));
        let mut rule = FlatlineRule::new(&cfg).unwrap();
        rule.ingest_events(&[evt(0)]).unwrap();
        rule.garbage_collect(10_000_000_000);
        assert!(rule.drain_matches().is_empty());
    }

    #[test]
    fn above_threshold_never_matches() {
        let cfg = RuleConfig::new(json!({"threshold": 1, "timeframe": 60.0}));
        let mut rule = FlatlineRule::new(&cfg).unwrap();
        rule.ingest_events(&[evt(0), evt(10), evt(20)]).unwrap();
        rule.garbage_collect(61_000_000_000);
        assert!(rule.drain_matches().is_empty());
    }
}
