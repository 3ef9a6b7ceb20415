//! FrequencyRule (spec §4.5), grounded on `ruletypes.py`'s `FrequencyRule`.
//! Shares its per-key `EventWindow` bookkeeping with `FlatlineRule`
//! (`super::flatline`), which subclasses it in the original implementation.

use std::collections::HashMap;
use std::time::Duration;

use crate::config::RuleConfig;
use crate::detector::{CountData, Detector, MatchBuffer, TermBucket};
use crate::error::{CoreError, CoreResult};
use crate::event::{Event, Match};
use crate::value::{hashable, parse_timestamp_nanos, HashableValue, Value};
use crate::window::EventWindow;

/// The key used for windows when no `query_key` is configured, matching
/// `ruletypes.py`'s literal `'all'` sentinel.
pub(crate) fn all_key() -> HashableValue {
    HashableValue::Str("all".to_string())
}

pub(crate) fn query_key_of(event: &Event, query_key: Option<&str>) -> HashableValue {
    match query_key {
        None => all_key(),
        Some(field) => hashable(&event.get_path(field).unwrap_or(Value::Null)),
    }
}

/// Shared per-key window state for Frequency/Flatline.
pub(crate) struct WindowedState {
    pub(crate) occurrences: HashMap<HashableValue, EventWindow>,
    pub(crate) timeframe: Duration,
    pub(crate) ts_field: String,
    pub(crate) query_key: Option<String>,
}

impl WindowedState {
    pub(crate) fn new(timeframe: Duration, ts_field: String, query_key: Option<String>) -> Self {
        Self { occurrences: HashMap::new(), timeframe, ts_field, query_key }
    }

    pub(crate) fn window_mut(&mut self, key: HashableValue) -> &mut EventWindow {
        let timeframe = self.timeframe;
        let ts_field = self.ts_field.clone();
        self.occurrences.entry(key).or_insert_with(|| EventWindow::new(timeframe, ts_field))
    }

    pub(crate) fn event_ts(&self, event: &Event) -> i64 {
        event
            .get_path(&self.ts_field)
            .as_ref()
            .and_then(parse_timestamp_nanos)
            .unwrap_or(0)
    }
}

pub struct FrequencyRule {
    pub(crate) state: WindowedState,
    num_events: i64,
    attach_related: bool,
    nested_query_key: bool,
    buffer: MatchBuffer,
}

impl FrequencyRule {
    pub fn new(config: &RuleConfig) -> CoreResult<Self> {
        let num_events = config.require_f64("num_events")? as i64;
        let timeframe = config.require_duration("timeframe")?;
        let ts_field = config.get_str("timestamp_field").unwrap_or("@timestamp").to_string();
        let query_key = config.get_str("query_key").map(str::to_string);
        let attach_related = config.get_bool_or("attach_related", false);
        let nested_query_key = config.get_bool_or("nested_query_key", false);
        Ok(Self {
            state: WindowedState::new(timeframe, ts_field, query_key),
            num_events,
            attach_related,
            nested_query_key,
            buffer: MatchBuffer::default(),
        })
    }

    /// Append one entry for `key` and emit a match if the window's running
    /// count has crossed `num_events`, then drop the key's window.
    fn check_for_match(&mut self, key: HashableValue) {
        let crossed = self
            .state
            .occurrences
            .get(&key)
            .is_some_and(|w| w.count() >= self.num_events);
        if !crossed {
            return;
        }
        let window = self.state.occurrences.get(&key).unwrap();
        let (event, _) = window.iter().last().expect("window just crossed threshold");
        let mut m = Match::from_event(event);
        if self.attach_related {
            let related: Vec<Value> = window
                .iter()
                .take(window.len().saturating_sub(1))
                .map(|(e, _)| Value::Map(e.fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect()))
                .collect();
            m = m.with_field("related_events", Value::Array(related));
        }
        self.buffer.push(m);
        self.state.occurrences.remove(&key);
    }

    fn flatten_nested(
        &mut self,
        timestamp: i64,
        buckets: &[TermBucket],
        prefix: Option<String>,
        query_key: &str,
    ) {
        for bucket in buckets {
            let key_str = match &prefix {
                Some(p) => format!("{p},{}", bucket.key),
                None => bucket.key.to_string(),
            };
            if bucket.sub_buckets.is_empty() {
                let event = Event::new()
                    .with_field(self.state.ts_field.clone(), Value::Number(timestamp as f64))
                    .with_field(query_key, Value::Str(key_str.clone()));
                let k = hashable(&Value::Str(key_str));
                self.state.window_mut(k.clone()).append((event, bucket.doc_count));
                self.check_for_match(k);
            } else {
                self.flatten_nested(timestamp, &bucket.sub_buckets, Some(key_str), query_key);
            }
        }
    }
}

impl Detector for FrequencyRule {
    fn ingest_events(&mut self, events: &[Event]) -> CoreResult<()> {
        let query_key = self.state.query_key.clone();
        for event in events {
            let key = query_key_of(event, query_key.as_deref());
            self.state.window_mut(key.clone()).append((event.clone(), 1));
            self.check_for_match(key);
        }
        Ok(())
    }

    fn ingest_counts(&mut self, data: CountData) -> CoreResult<()> {
        let event = data.event.unwrap_or_else(|| {
            Event::new().with_field(self.state.ts_field.clone(), Value::Number(data.endtime as f64))
        });
        let key = all_key();
        self.state.window_mut(key.clone()).append((event, data.count));
        self.check_for_match(key);
        Ok(())
    }

    fn ingest_terms(&mut self, terms: HashMap<i64, Vec<TermBucket>>) -> CoreResult<()> {
        let query_key = self
            .state
            .query_key
            .clone()
            .ok_or_else(|| CoreError::configuration("query_key is required for ingest_terms"))?;
        for (timestamp, buckets) in terms {
            if self.nested_query_key {
                self.flatten_nested(timestamp, &buckets, None, &query_key);
            } else {
                for bucket in &buckets {
                    let event = Event::new()
                        .with_field(self.state.ts_field.clone(), Value::Number(timestamp as f64))
                        .with_field(query_key.clone(), Value::Str(bucket.key.to_string()));
                    self.state.window_mut(bucket.key.clone()).append((event, bucket.doc_count));
                    self.check_for_match(bucket.key.clone());
                }
            }
        }
        Ok(())
    }

    fn garbage_collect(&mut self, now: i64) {
        self.state.occurrences.retain(|_, window| {
            window
                .iter()
                .last()
                .map(|(e, _)| now - parse_timestamp_nanos(e.get_path(&self.state.ts_field).as_ref().unwrap_or(&Value::Null)).unwrap_or(0))
                .is_none_or(|age| (age as u64) <= self.state.timeframe.as_nanos() as u64)
        });
    }

    fn drain_matches(&mut self) -> Vec<Match> {
        self.buffer.drain()
    }

    fn format_match(&self, _m: &Match) -> String {
        format!("At least {} events occurred within {:?}", self.num_events, self.state.timeframe)
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
    fn matches_and_drops_window_after_threshold() {
        let cfg = RuleConfig::new(json!({"num_events": 3, "timeframe": 60.0}));
        let mut rule = FrequencyRule::new(&cfg).unwrap();
        rule.ingest_events(&[evt(0)]).unwrap();
        rule.ingest_events(&[evt(30)]).unwrap();
        assert!(rule.drain_matches().is_empty());
        rule.ingest_events(&[evt(50)]).unwrap();
        let matches = rule.drain_matches();
        assert_eq!(matches.len(), 1);
        assert!(rule.state.occurrences.is_empty());
    }

    #[test]
    fn does_not_match_below_threshold() {
        let cfg = RuleConfig::new(json!({"num_events": 5, "timeframe": 60.0}));
        let mut rule = FrequencyRule::new(&cfg).unwrap();
        rule.ingest_events(&[evt(0), evt(10)]).unwrap();
        assert!(rule.drain_matches().is_empty());
    }
}
