//! BaseAggregation family (spec §4.10): `MetricAggregation`,
//! `SpikeMetricAggregation`, `PercentageMatch`, `ErrorRate`, `AdvanceSearch`.
//! Grounded on `ruletypes.py`'s `BaseAggregationRule` and its subclasses.

use std::collections::HashMap;

use crate::config::RuleConfig;
use crate::detector::{AggPayload, Detector, MatchBuffer};
use crate::error::{CoreError, CoreResult};
use crate::event::{Event, Match};
use crate::value::{dehash, hashable, HashableValue, Value};

use super::spike::SpikeRule;

/// Shared dispatch for `ingest_aggregation` (§4.10): `interval_aggs` first
/// (recurse per bucket, using the bucket's own timestamp), else
/// `bucket_aggs` (recurse per term bucket, its key becomes the query key),
/// else invoke the leaf callback. A `dyn FnMut` avoids the awkwardness of a
/// generic function calling itself recursively with an opaque closure type.
fn walk_aggregation(
    timestamp: i64,
    query_key: Option<HashableValue>,
    data: &AggPayload,
    check_matches: &mut dyn FnMut(i64, Option<HashableValue>, &AggPayload),
) {
    if !data.interval_aggs.is_empty() {
        for (interval_ts, interval_data) in &data.interval_aggs {
            walk_aggregation(*interval_ts, query_key.clone(), interval_data, check_matches);
        }
    } else if !data.bucket_aggs.is_empty() {
        for (key, term_data) in &data.bucket_aggs {
            walk_aggregation(timestamp, Some(key.clone()), term_data, check_matches);
        }
    } else {
        check_matches(timestamp, query_key, data);
    }
}

fn unwrap_aggregation(
    payload: HashMap<i64, AggPayload>,
    mut check_matches: impl FnMut(i64, Option<HashableValue>, &AggPayload),
) {
    for (timestamp, data) in payload {
        walk_aggregation(timestamp, None, &data, &mut check_matches);
    }
}

// ---------------------------------------------------------------------------
// MetricAggregationRule
// ---------------------------------------------------------------------------

const ALLOWED_AGGREGATIONS: &[&str] = &["min", "max", "avg", "sum", "cardinality", "value_count"];
const ALLOWED_PERCENT_AGGREGATIONS: &[&str] = &["percentiles"];

pub struct MetricAggregationRule {
    ts_field: String,
    metric_agg_key: String,
    metric_agg_type: String,
    metric_key: String,
    max_threshold: Option<f64>,
    min_threshold: Option<f64>,
    query_key: Option<String>,
    compound_query_key: Vec<String>,
    metric_format_string: Option<String>,
    buffer: MatchBuffer,
}

impl MetricAggregationRule {
    pub fn new(config: &RuleConfig) -> CoreResult<Self> {
        let metric_agg_key = config.require_str("metric_agg_key")?.to_string();
        let metric_agg_type = config.require_str("metric_agg_type")?.to_string();
        let max_threshold = config.get_f64("max_threshold");
        let min_threshold = config.get_f64("min_threshold");
        if max_threshold.is_none() && min_threshold.is_none() {
            return Err(CoreError::configuration(
                "MetricAggregationRule must have at least one of either max_threshold or min_threshold",
            ));
        }
        if !ALLOWED_AGGREGATIONS.contains(&metric_agg_type.as_str())
            && !ALLOWED_PERCENT_AGGREGATIONS.contains(&metric_agg_type.as_str())
        {
            return Err(CoreError::configuration(format!(
                "metric_agg_type must be one of {ALLOWED_AGGREGATIONS:?}"
            )));
        }
        if ALLOWED_PERCENT_AGGREGATIONS.contains(&metric_agg_type.as_str()) && !config.has("percentile_range") {
            return Err(CoreError::configuration("percentile_range must be specified for percentiles aggregation"));
        }
        let metric_key = format!("metric_{metric_agg_key}_{metric_agg_type}");
        Ok(Self {
            ts_field: config.get_str("timestamp_field").unwrap_or("@timestamp").to_string(),
            metric_agg_key,
            metric_agg_type,
            metric_key,
            max_threshold,
            min_threshold,
            query_key: config.get_str("query_key").map(str::to_string),
            compound_query_key: config.get_string_list("compound_query_key"),
            metric_format_string: config.get_str("metric_format_string").map(str::to_string),
            buffer: MatchBuffer::default(),
        })
    }

    fn crossed_thresholds(&self, value: f64) -> bool {
        self.max_threshold.is_some_and(|max| value > max) || self.min_threshold.is_some_and(|min| value < min)
    }

    fn check_matches(&mut self, timestamp: i64, query_key: Option<HashableValue>, data: &AggPayload) {
        if !self.compound_query_key.is_empty() {
            self.check_matches_recursive(timestamp, data, &self.compound_query_key.clone(), HashMap::new());
            return;
        }
        let Some(metric_val) = data.get(&self.metric_key).and_then(Value::as_f64) else { return };
        if !self.crossed_thresholds(metric_val) {
            return;
        }
        let mut m = Match::new()
            .with_field(self.ts_field.clone(), Value::Number(timestamp as f64))
            .with_field(self.metric_key.clone(), Value::Number(metric_val))
            .with_field("metric_agg_value", Value::Number(metric_val));
        if let Some(fmt) = &self.metric_format_string {
            let formatted = Value::Str(format!("{fmt}{metric_val}"));
            m = m.with_field(format!("{}_formatted", self.metric_key), formatted.clone());
            m = m.with_field("metric_agg_value_formatted", formatted);
        }
        if let (Some(qk), Some(field)) = (query_key, &self.query_key) {
            m = m.with_field(field.clone(), dehash(&qk));
        }
        self.buffer.push(m);
    }

    /// Recurses through `data`'s own `bucket_aggs`, assigning each level's
    /// bucket key to the next name in `compound_query_key`, until a leaf is
    /// reached and the metric value(s) there are threshold-tested.
    fn check_matches_recursive(
        &mut self,
        timestamp: i64,
        data: &AggPayload,
        remaining_keys: &[String],
        match_fields: HashMap<String, Value>,
    ) {
        for (key, sub) in &data.bucket_aggs {
            let mut fields = match_fields.clone();
            if let Some(name) = remaining_keys.first() {
                fields.insert(name.clone(), dehash(key));
            }
            if !sub.bucket_aggs.is_empty() {
                self.check_matches_recursive(timestamp, sub, remaining_keys.get(1..).unwrap_or(&[]), fields);
                continue;
            }
            let metric_vals: Vec<f64> = if !sub.interval_aggs.is_empty() {
                sub.interval_aggs.iter().filter_map(|(_, d)| d.get(&self.metric_key).and_then(Value::as_f64)).collect()
            } else {
                sub.get(&self.metric_key).and_then(Value::as_f64).into_iter().collect()
            };
            for metric_val in metric_vals {
                if !self.crossed_thresholds(metric_val) {
                    continue;
                }
                let mut m_fields = fields.clone();
                m_fields.insert(self.ts_field.clone(), Value::Number(timestamp as f64));
                m_fields.insert(self.metric_key.clone(), Value::Number(metric_val));
                if let Some(query_key) = &self.query_key {
                    let compound_value: Vec<String> = self
                        .compound_query_key
                        .iter()
                        .map(|k| m_fields.get(k).map(|v| v.to_string()).unwrap_or_default())
                        .collect();
                    m_fields.insert(query_key.clone(), Value::Str(compound_value.join(",")));
                }
                self.buffer.push(Match { fields: m_fields });
            }
        }
    }
}

impl Detector for MetricAggregationRule {
    fn ingest_aggregation(&mut self, payload: HashMap<i64, AggPayload>) -> CoreResult<()> {
        let mut matches_to_check = Vec::new();
        unwrap_aggregation(payload, |ts, qk, data| matches_to_check.push((ts, qk, data.clone())));
        for (ts, qk, data) in matches_to_check {
            self.check_matches(ts, qk, &data);
        }
        Ok(())
    }

    fn garbage_collect(&mut self, _now: i64) {}

    fn drain_matches(&mut self) -> Vec<Match> {
        self.buffer.drain()
    }

    fn format_match(&self, m: &Match) -> String {
        format!(
            "Threshold violation, {}:{} {:?} (min: {:?} max: {:?})",
            self.metric_agg_type,
            self.metric_agg_key,
            m.get(&self.metric_key),
            self.min_threshold,
            self.max_threshold
        )
    }
}

// ---------------------------------------------------------------------------
// SpikeMetricAggregationRule
// ---------------------------------------------------------------------------

/// Unwraps aggregation buckets but, instead of crossing fixed thresholds,
/// feeds each `(event, agg_value, query_key)` triple into a `SpikeRule`'s
/// current/reference window machinery — grounded on
/// `SpikeMetricAggregationRule.add_aggregation_data`, which explicitly
/// reuses `SpikeRule.handle_event` rather than duplicating it.
pub struct SpikeMetricAggregationRule {
    spike: SpikeRule,
    ts_field: String,
    metric_agg_key: String,
    metric_agg_type: String,
    metric_key: String,
    query_key: Option<String>,
}

impl SpikeMetricAggregationRule {
    pub fn new(config: &RuleConfig) -> CoreResult<Self> {
        let metric_agg_key = config.require_str("metric_agg_key")?.to_string();
        let metric_agg_type = config.require_str("metric_agg_type")?.to_string();
        if !ALLOWED_AGGREGATIONS.contains(&metric_agg_type.as_str())
            && !ALLOWED_PERCENT_AGGREGATIONS.contains(&metric_agg_type.as_str())
        {
            return Err(CoreError::configuration(format!(
                "metric_agg_type must be one of {ALLOWED_AGGREGATIONS:?}"
            )));
        }
        if config.has("bucket_interval") {
            return Err(CoreError::configuration("bucket intervals are not supported for spike aggregation alerts"));
        }
        let metric_key = format!("metric_{metric_agg_key}_{metric_agg_type}");
        Ok(Self {
            spike: SpikeRule::new(config)?,
            ts_field: config.get_str("timestamp_field").unwrap_or("@timestamp").to_string(),
            metric_agg_key,
            metric_agg_type,
            metric_key,
            query_key: config.get_str("query_key").map(str::to_string),
        })
    }
}

impl Detector for SpikeMetricAggregationRule {
    fn ingest_aggregation(&mut self, payload: HashMap<i64, AggPayload>) -> CoreResult<()> {
        for (timestamp, data) in payload {
            if !data.bucket_aggs.is_empty() {
                self.unwrap_term_buckets(timestamp, &data.bucket_aggs, Vec::new());
            } else if let Some(value) = data.get(&self.metric_key).and_then(Value::as_f64) {
                let event = Event::new().with_field(self.ts_field.clone(), Value::Number(timestamp as f64));
                self.spike.handle_event(event, value as i64, super::spike::all_key());
            }
        }
        Ok(())
    }

    fn garbage_collect(&mut self, now: i64) {
        self.spike.garbage_collect(now);
    }

    fn drain_matches(&mut self) -> Vec<Match> {
        self.spike.drain_matches()
    }

    fn format_match(&self, m: &Match) -> String {
        format!(
            "An abnormal {} of {} ({:?}) occurred around {:?}. Preceding that, there was a {} of {} of ({:?})",
            self.metric_agg_type,
            self.metric_agg_key,
            m.get("spike_count"),
            m.get(&self.ts_field),
            self.metric_agg_type,
            self.metric_agg_key,
            m.get("reference_count"),
        )
    }
}

impl SpikeMetricAggregationRule {
    fn unwrap_term_buckets(&mut self, timestamp: i64, buckets: &[(HashableValue, AggPayload)], mut qk: Vec<String>) {
        for (key, term_data) in buckets {
            qk.push(key.to_string());
            if !term_data.bucket_aggs.is_empty() {
                self.unwrap_term_buckets(timestamp, &term_data.bucket_aggs, qk.clone());
            } else if let Some(value) = term_data.get(&self.metric_key).and_then(Value::as_f64) {
                let qk_str = qk.join(",");
                let mut event = Event::new().with_field(self.ts_field.clone(), Value::Number(timestamp as f64));
                if let Some(field) = &self.query_key {
                    event = event.with_field(field.clone(), Value::Str(qk_str.clone()));
                }
                self.spike.handle_event(event, value as i64, hashable(&Value::Str(qk_str)));
            }
            qk.pop();
        }
    }
}

// ---------------------------------------------------------------------------
// PercentageMatchRule
// ---------------------------------------------------------------------------

pub struct PercentageMatchRule {
    ts_field: String,
    min_percentage: Option<f64>,
    max_percentage: Option<f64>,
    min_denominator: f64,
    query_key: Option<String>,
    percentage_format_string: Option<String>,
    buffer: MatchBuffer,
}

impl PercentageMatchRule {
    pub fn new(config: &RuleConfig) -> CoreResult<Self> {
        config.require_str("match_bucket_filter")?;
        let min_percentage = config.get_f64("min_percentage");
        let max_percentage = config.get_f64("max_percentage");
        if min_percentage.is_none() && max_percentage.is_none() {
            return Err(CoreError::configuration(
                "PercentageMatchRule must have at least one of either min_percentage or max_percentage",
            ));
        }
        Ok(Self {
            ts_field: config.get_str("timestamp_field").unwrap_or("@timestamp").to_string(),
            min_percentage,
            max_percentage,
            min_denominator: config.get_f64("min_denominator").unwrap_or(0.0),
            query_key: config.get_str("query_key").map(str::to_string),
            percentage_format_string: config.get_str("percentage_format_string").map(str::to_string),
            buffer: MatchBuffer::default(),
        })
    }

    fn percentage_violation(&self, pct: f64) -> bool {
        self.max_percentage.is_some_and(|max| pct > max) || self.min_percentage.is_some_and(|min| pct < min)
    }

    fn check_matches(&mut self, timestamp: i64, query_key: Option<HashableValue>, data: &AggPayload) {
        let Some(match_count) = data.get("match_bucket_count").and_then(Value::as_f64) else { return };
        let Some(other_count) = data.get("other_bucket_count").and_then(Value::as_f64) else { return };
        let total = match_count + other_count;
        if total == 0.0 || total < self.min_denominator {
            return;
        }
        let pct = match_count / total * 100.0;
        if !self.percentage_violation(pct) {
            return;
        }
        let mut m = Match::new()
            .with_field(self.ts_field.clone(), Value::Number(timestamp as f64))
            .with_field("percentage", Value::Number(pct))
            .with_field("denominator", Value::Number(total));
        if let Some(fmt) = &self.percentage_format_string {
            m = m.with_field("percentage_formatted", Value::Str(format!("{fmt}{pct}")));
        }
        if let (Some(qk), Some(field)) = (query_key, &self.query_key) {
            m = m.with_field(field.clone(), dehash(&qk));
        }
        self.buffer.push(m);
    }
}

impl Detector for PercentageMatchRule {
    fn ingest_aggregation(&mut self, payload: HashMap<i64, AggPayload>) -> CoreResult<()> {
        let mut matches_to_check = Vec::new();
        unwrap_aggregation(payload, |ts, qk, data| matches_to_check.push((ts, qk, data.clone())));
        for (ts, qk, data) in matches_to_check {
            self.check_matches(ts, qk, &data);
        }
        Ok(())
    }

    fn garbage_collect(&mut self, _now: i64) {}

    fn drain_matches(&mut self) -> Vec<Match> {
        self.buffer.drain()
    }

    fn format_match(&self, m: &Match) -> String {
        format!(
            "Percentage violation, value: {:?} (min: {:?} max: {:?}) of {:?} items",
            m.get("percentage"), self.min_percentage, self.max_percentage, m.get("denominator")
        )
    }
}

// ---------------------------------------------------------------------------
// ErrorRateRule
// ---------------------------------------------------------------------------

pub struct ErrorRateRule {
    ts_field: String,
    sampling: f64,
    threshold: f64,
    count_all_errors: bool,
    buffer: MatchBuffer,
}

impl ErrorRateRule {
    pub fn new(config: &RuleConfig) -> CoreResult<Self> {
        let sampling = config.require_f64("sampling")?;
        let threshold = config.require_f64("threshold")?;
        config.require_str("error_condition")?;
        config.require_str("unique_column")?;
        let count_all_errors = config.get_str("error_calculation_method") != Some("count_traces_with_errors");
        Ok(Self {
            ts_field: config.get_str("timestamp_field").unwrap_or("@timestamp").to_string(),
            sampling,
            threshold,
            count_all_errors,
            buffer: MatchBuffer::default(),
        })
    }
}

impl Detector for ErrorRateRule {
    fn ingest_aggregation(&mut self, payload: HashMap<i64, AggPayload>) -> CoreResult<()> {
        for (timestamp, data) in payload {
            let Some(total_count) = data.get("total_count").and_then(Value::as_f64) else { continue };
            if total_count <= 0.0 {
                continue;
            }
            let Some(error_count) = data.get("error_count").and_then(Value::as_f64) else { continue };
            let rate = (error_count / total_count) / self.sampling * 100.0;
            if rate > self.threshold {
                let mut m = Match::new()
                    .with_field(self.ts_field.clone(), Value::Number(timestamp as f64))
                    .with_field("error_rate", Value::Number(rate));
                if let Some(from) = data.get("start_time") {
                    m = m.with_field("from", from.clone());
                }
                if let Some(to) = data.get("end_time") {
                    m = m.with_field("to", to.clone());
                }
                self.buffer.push(m);
            }
        }
        let _ = self.count_all_errors;
        Ok(())
    }

    fn garbage_collect(&mut self, _now: i64) {}

    fn drain_matches(&mut self) -> Vec<Match> {
        self.buffer.drain()
    }

    fn format_match(&self, m: &Match) -> String {
        format!("Error rate {:?}% exceeded threshold {}% around {:?}", m.get("error_rate"), self.threshold, m.get(&self.ts_field))
    }
}

// ---------------------------------------------------------------------------
// AdvanceSearch
// ---------------------------------------------------------------------------

/// Recursively walks a free-form aggregation tree; at each leaf, checks
/// thresholds against the named `alert_field`. Grounded on
/// `AdvanceSearchRule.check_matches_recursive`, whose `data_value`
/// reference is undefined in the original (spec §9 Open Question) — this
/// re-derives the evident intent: accumulate a `key_prefix` while
/// descending `bucket_aggs`, and at a leaf, test the leaf's own
/// `alert_field` value.
pub struct AdvanceSearchRule {
    ts_field: String,
    alert_field: String,
    max_threshold: Option<f64>,
    min_threshold: Option<f64>,
    buffer: MatchBuffer,
}

impl AdvanceSearchRule {
    pub fn new(config: &RuleConfig) -> CoreResult<Self> {
        let alert_field = config.require_str("alert_field")?.to_string();
        let max_threshold = config.get_f64("max_threshold");
        let min_threshold = config.get_f64("min_threshold");
        if max_threshold.is_none() && min_threshold.is_none() {
            return Err(CoreError::configuration("AdvanceSearchRule must have at least one of max_threshold or min_threshold"));
        }
        Ok(Self {
            ts_field: config.get_str("timestamp_field").unwrap_or("@timestamp").to_string(),
            alert_field,
            max_threshold,
            min_threshold,
            buffer: MatchBuffer::default(),
        })
    }

    fn crossed(&self, value: f64) -> bool {
        self.max_threshold.is_some_and(|max| value > max) || self.min_threshold.is_some_and(|min| value < min)
    }

    fn check_matches_recursive(&mut self, timestamp: i64, data: &AggPayload, key_prefix: Option<String>) {
        if !data.bucket_aggs.is_empty() {
            for (key, sub) in &data.bucket_aggs {
                let prefix = match &key_prefix {
                    Some(p) => format!("{p},{key}"),
                    None => key.to_string(),
                };
                self.check_matches_recursive(timestamp, sub, Some(prefix));
            }
            return;
        }
        let Some(value) = data.get(&self.alert_field).and_then(Value::as_f64) else { return };
        if !self.crossed(value) {
            return;
        }
        let key = key_prefix.unwrap_or_default();
        let m = Match::new()
            .with_field("key", Value::Str(key.clone()))
            .with_field("value", Value::Number(value))
            .with_field("key_value", Value::Str(format!("{key}:{value}")))
            .with_field(self.ts_field.clone(), Value::Number(timestamp as f64));
        self.buffer.push(m);
    }

    /// Blocking backend lookup used when an `AdvanceSearch` rule needs to
    /// resolve `alert_field`'s distinct values ahead of evaluation — the
    /// other of the two call sites (besides `NewTermsRule::new`) that touch
    /// `BackendClient` (spec §5).
    pub fn run_query(
        &self,
        backend: &dyn crate::detector::BackendClient,
        start: i64,
        end: i64,
    ) -> CoreResult<(Vec<HashableValue>, Vec<i64>)> {
        backend.query_terms(start, end, &crate::detector::FieldSpec {
            fields: vec![self.alert_field.clone()],
            use_keyword_postfix: false,
        })
    }
}

impl Detector for AdvanceSearchRule {
    fn ingest_aggregation(&mut self, payload: HashMap<i64, AggPayload>) -> CoreResult<()> {
        for (timestamp, data) in payload {
            self.check_matches_recursive(timestamp, &data, None);
        }
        Ok(())
    }

    fn garbage_collect(&mut self, _now: i64) {}

    fn drain_matches(&mut self) -> Vec<Match> {
        self.buffer.drain()
    }

    fn format_match(&self, m: &Match) -> String {
        format!("Field '{}' crossed threshold: {:?} at key {:?}", self.alert_field, m.get("value"), m.get("key"))
    }
}
