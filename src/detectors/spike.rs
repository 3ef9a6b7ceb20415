//! SpikeRule (spec §4.7): compares a current window against a trailing
//! reference window of equal length to detect sudden rises or drops in
//! event rate (or an aggregated field value). Grounded on `ruletypes.py`'s
//! `SpikeRule`.
//!
//! The reference window is wired to receive whatever the current window
//! evicts (spec §9's "directed, acyclic dataflow"). `EventWindow::append`
//! returns evictions as a `Vec` rather than invoking a stored callback, so
//! the wiring here is an explicit two-line hand-off at the call site
//! instead of a closure captured by the current window — same dataflow,
//! no self-referential borrow.

use std::collections::HashMap;
use std::time::Duration;

use crate::config::RuleConfig;
use crate::detector::{CountData, Detector, MatchBuffer, TermBucket};
use crate::error::{CoreError, CoreResult};
use crate::event::{Event, Match};
use crate::value::{dehash, hashable, parse_timestamp_nanos, HashableValue, Value};
use crate::window::EventWindow;

#[derive(Debug, Clone, Copy, PartialEq)]
enum SpikeType {
    Up,
    Down,
    Both,
}

impl SpikeType {
    fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            "both" => Ok(Self::Both),
            other => Err(CoreError::configuration(format!("unknown spike_type '{other}'"))),
        }
    }

    fn alerts_up(self) -> bool {
        matches!(self, Self::Up | Self::Both)
    }

    fn alerts_down(self) -> bool {
        matches!(self, Self::Down | Self::Both)
    }
}

pub(crate) fn all_key() -> HashableValue {
    HashableValue::Str("all".to_string())
}

pub struct SpikeRule {
    timeframe: Duration,
    spike_height: f64,
    spike_type: SpikeType,
    ts_field: String,
    query_key: Option<String>,
    field_value: Option<String>,
    metric_agg_type: Option<String>,
    threshold_cur: f64,
    threshold_ref: f64,
    alert_on_new_data: bool,

    ref_windows: HashMap<HashableValue, EventWindow>,
    cur_windows: HashMap<HashableValue, EventWindow>,
    first_event: HashMap<HashableValue, i64>,
    skip_checks: HashMap<HashableValue, i64>,
    ref_window_filled_once: bool,
    buffer: MatchBuffer,
}

impl SpikeRule {
    pub fn new(config: &RuleConfig) -> CoreResult<Self> {
        let timeframe = config.require_duration("timeframe")?;
        let spike_height = config.require_f64("spike_height")?;
        let spike_type = SpikeType::parse(config.require_str("spike_type")?)?;
        Ok(Self {
            timeframe,
            spike_height,
            spike_type,
            ts_field: config.get_str("timestamp_field").unwrap_or("@timestamp").to_string(),
            query_key: config.get_str("query_key").map(str::to_string),
            field_value: config.get_str("field_value").map(str::to_string),
            metric_agg_type: config.get_str("metric_agg_type").map(str::to_string),
            threshold_cur: config.get_f64("threshold_cur").unwrap_or(0.0),
            threshold_ref: config.get_f64("threshold_ref").unwrap_or(0.0),
            alert_on_new_data: config.get_bool_or("alert_on_new_data", false),
            ref_windows: HashMap::new(),
            cur_windows: HashMap::new(),
            first_event: HashMap::new(),
            skip_checks: HashMap::new(),
            ref_window_filled_once: false,
            buffer: MatchBuffer::default(),
        })
    }

    fn event_ts(&self, event: &Event) -> i64 {
        event.get_path(&self.ts_field).as_ref().and_then(parse_timestamp_nanos).unwrap_or(0)
    }

    fn get_spike_values(&self, qk: &HashableValue) -> (Option<f64>, Option<f64>) {
        let (Some(refw), Some(curw)) = (self.ref_windows.get(qk), self.cur_windows.get(qk)) else {
            return (None, None);
        };
        match self.metric_agg_type.as_deref() {
            None | Some("sum") | Some("value_count") | Some("cardinality") | Some("percentile") => {
                (Some(refw.count() as f64), Some(curw.count() as f64))
            }
            Some("avg") => (refw.mean(), curw.mean()),
            Some("min") => (refw.min().map(|v| v as f64), curw.min().map(|v| v as f64)),
            Some("max") => (refw.max().map(|v| v as f64), curw.max().map(|v| v as f64)),
            _ => (Some(refw.count() as f64), Some(curw.count() as f64)),
        }
    }

    fn find_matches(&self, reference: Option<f64>, current: Option<f64>) -> bool {
        if self.field_value.is_none() {
            let cur = current.unwrap_or(0.0);
            let reference = reference.unwrap_or(0.0);
            if cur < self.threshold_cur || reference < self.threshold_ref {
                return false;
            }
            self.spike_fired(reference, cur)
        } else {
            match (reference, current) {
                (Some(r), Some(c)) if r != 0.0 && c != 0.0 => self.spike_fired(r, c),
                _ => false,
            }
        }
    }

    fn spike_fired(&self, reference: f64, current: f64) -> bool {
        let spike_up = current >= reference * self.spike_height;
        let spike_down = current <= reference / self.spike_height;
        (self.spike_type.alerts_up() && spike_up) || (self.spike_type.alerts_down() && spike_down)
    }

    fn clear_windows(&mut self, qk: &HashableValue, at_ts: i64) {
        if let Some(w) = self.ref_windows.get_mut(qk) {
            w.clear();
        }
        self.first_event.remove(qk);
        self.skip_checks.insert(qk.clone(), at_ts + 2 * self.timeframe.as_nanos() as i64);
    }

    fn push_match(&mut self, event: &Event, qk: &HashableValue) {
        let (reference_count, spike_count) = if self.field_value.is_none() {
            self.get_spike_values(qk)
        } else {
            (self.ref_windows.get(qk).and_then(|w| w.mean()), self.cur_windows.get(qk).and_then(|w| w.mean()))
        };
        let mut m = Match::from_event(event);
        m = m.with_field("spike_count", spike_count.map(Value::Number).unwrap_or(Value::Null));
        m = m.with_field("reference_count", reference_count.map(Value::Number).unwrap_or(Value::Null));
        self.buffer.push(m);
    }

    /// `pub(crate)` so `SpikeMetricAggregationRule` can feed aggregation
    /// buckets through the same current/reference window machinery instead
    /// of duplicating it (`SpikeMetricAggregationRule.add_aggregation_data`
    /// in the original delegates to this exact method).
    pub(crate) fn handle_event(&mut self, event: Event, count: i64, qk: HashableValue) {
        let ts = self.event_ts(&event);
        self.first_event.entry(qk.clone()).or_insert(ts);

        self.ref_windows.entry(qk.clone()).or_insert_with(|| EventWindow::new(self.timeframe, self.ts_field.clone()));
        self.cur_windows.entry(qk.clone()).or_insert_with(|| EventWindow::new(self.timeframe, self.ts_field.clone()));

        let evicted = self.cur_windows.get_mut(&qk).unwrap().append((event.clone(), count));
        for pair in evicted {
            self.ref_windows.get_mut(&qk).unwrap().append(pair);
        }

        let first_ts = self.first_event[&qk];
        if ts - first_ts < 2 * self.timeframe.as_nanos() as i64 {
            if !self.ref_window_filled_once {
                return;
            }
            if !(self.query_key.is_some() && self.alert_on_new_data) {
                return;
            }
            if self.skip_checks.get(&qk).is_some_and(|&skip_until| ts < skip_until) {
                return;
            }
        } else {
            self.ref_window_filled_once = true;
        }

        let matched = if self.field_value.is_some() {
            let refw = &self.ref_windows[&qk];
            let curw = &self.cur_windows[&qk];
            self.find_matches(refw.mean(), curw.mean())
        } else {
            let (r, c) = self.get_spike_values(&qk);
            self.find_matches(r, c)
        };
        if !matched {
            return;
        }

        let skip_placeholders = self.field_value.is_some();
        let picked = self.cur_windows[&qk]
            .iter()
            .find(|(e, c)| if skip_placeholders { !e.is_placeholder() } else { *c != 0 })
            .map(|(e, _)| e.clone());
        if let Some(match_event) = picked {
            self.push_match(&match_event, &qk);
            self.clear_windows(&qk, ts);
        }
    }
}

impl Detector for SpikeRule {
    fn ingest_events(&mut self, events: &[Event]) -> CoreResult<()> {
        for event in events {
            let qk = match &self.query_key {
                None => all_key(),
                Some(field) => {
                    let v = event.get_path(field);
                    match v {
                        Some(v) => hashable(&v),
                        None => HashableValue::Str("other".to_string()),
                    }
                }
            };
            if let Some(field_value) = &self.field_value {
                if let Some(raw) = event.get_path(field_value) {
                    match raw.as_f64() {
                        Some(n) => self.handle_event(event.clone(), n as i64, qk),
                        None => log::warn!("{field_value} is not a number: {raw}"),
                    }
                }
            } else {
                self.handle_event(event.clone(), 1, qk);
            }
        }
        Ok(())
    }

    fn ingest_counts(&mut self, data: CountData) -> CoreResult<()> {
        let event = Event::new().with_field(self.ts_field.clone(), Value::Number(data.endtime as f64));
        self.handle_event(event, data.count, all_key());
        Ok(())
    }

    fn ingest_terms(&mut self, terms: HashMap<i64, Vec<TermBucket>>) -> CoreResult<()> {
        let query_key = self
            .query_key
            .clone()
            .ok_or_else(|| CoreError::configuration("query_key is required for ingest_terms"))?;
        for (timestamp, buckets) in terms {
            for bucket in buckets {
                let event = Event::new()
                    .with_field(self.ts_field.clone(), Value::Number(timestamp as f64))
                    .with_field(query_key.clone(), dehash(&bucket.key));
                self.handle_event(event, bucket.doc_count, bucket.key);
            }
        }
        Ok(())
    }

    fn garbage_collect(&mut self, now: i64) {
        let keys: Vec<HashableValue> = self.cur_windows.keys().cloned().collect();
        for qk in keys {
            let all = all_key();
            if qk != all
                && self.ref_windows.get(&qk).is_some_and(|w| w.count() == 0)
                && self.cur_windows.get(&qk).is_some_and(|w| w.count() == 0)
            {
                self.cur_windows.remove(&qk);
                self.ref_windows.remove(&qk);
                continue;
            }
            let mut placeholder = Event::placeholder().with_field(self.ts_field.clone(), Value::Number(now as f64));
            if qk != all
                && let Some(field) = &self.query_key
            {
                placeholder = placeholder.with_field(field.clone(), dehash(&qk));
            }
            self.handle_event(placeholder, 0, qk);
        }
    }

    fn drain_matches(&mut self) -> Vec<Match> {
        self.buffer.drain()
    }

    fn format_match(&self, m: &Match) -> String {
        match &self.field_value {
            None => format!(
                "Abnormal event count ({:?}) around {:?}; reference window had only {:?} within {:?}",
                m.get("spike_count"), m.get(&self.ts_field), m.get("reference_count"), self.timeframe
            ),
            Some(field) => format!(
                "Abnormal average value ({:?}) of field '{field}' around {:?}",
                m.get("spike_count"), m.get(&self.ts_field)
            ),
        }
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
    fn no_match_during_warmup() {
        let cfg = RuleConfig::new(json!({"timeframe": 10.0, "spike_height": 3.0, "spike_type": "up"}));
        let mut rule = SpikeRule::new(&cfg).unwrap();
        for t in 0..5 {
            rule.ingest_events(&[evt(t)]).unwrap();
        }
        assert!(rule.drain_matches().is_empty());
    }

    #[test]
    fn spike_up_after_warm_reference_window() {
        let cfg = RuleConfig::new(json!({"timeframe": 10.0, "spike_height": 3.0, "spike_type": "up"}));
        let mut rule = SpikeRule::new(&cfg).unwrap();
        for t in 0..20 {
            rule.ingest_events(&[evt(t)]).unwrap();
        }
        for _ in 0..10 {
            rule.ingest_events(&[evt(20)]).unwrap();
        }
        let matches = rule.drain_matches();
        assert_eq!(matches.len(), 1);
    }
}
