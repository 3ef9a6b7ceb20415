//! NewTermsRule (spec §4.8), grounded on `ruletypes.py`'s `NewTermsRule`.
//! On construction it backfills a `TermsWindow` per configured field from
//! the backend, then classifies runtime term buckets as new or already
//! seen.

use std::collections::HashMap;
use std::time::Duration;

use crate::config::RuleConfig;
use crate::detector::{BackendClient, Detector, FieldSpec, MatchBuffer, TermBucket};
use crate::error::{CoreError, CoreResult};
use crate::event::Match;
use crate::value::{dehash, HashableValue, Value};
use crate::terms_window::TermsWindow;

const DEFAULT_WINDOW: Duration = Duration::from_secs(7 * 86_400);
const MAX_WINDOW: Duration = Duration::from_secs(7 * 86_400);
const DEFAULT_THRESHOLD_WINDOW: Duration = Duration::from_secs(3600);
const MAX_THRESHOLD_WINDOW: Duration = Duration::from_secs(2 * 86_400);
const DEFAULT_TERMS_SIZE: usize = 500;
const MAX_TERMS_SIZE: usize = 1000;
const BACKFILL_STEP: Duration = Duration::from_secs(3600);

fn parse_fields(config: &RuleConfig) -> CoreResult<Vec<Vec<String>>> {
    if let Some(raw) = config.get_raw("fields") {
        let arr = raw
            .as_array()
            .ok_or_else(|| CoreError::configuration("fields must be a list"))?;
        let mut fields = Vec::new();
        for entry in arr {
            match entry {
                serde_json::Value::String(s) => fields.push(vec![s.clone()]),
                serde_json::Value::Array(composite) => {
                    let names: CoreResult<Vec<String>> = composite
                        .iter()
                        .map(|v| {
                            v.as_str()
                                .map(str::to_string)
                                .ok_or_else(|| CoreError::configuration("composite field entries must be strings"))
                        })
                        .collect();
                    fields.push(names?);
                }
                _ => return Err(CoreError::configuration("unsupported fields entry")),
            }
        }
        if fields.is_empty() {
            return Err(CoreError::configuration("fields must not be an empty list"));
        }
        return Ok(fields);
    }

    let query_key = config.require_str("query_key").map_err(|_| {
        CoreError::configuration("fields or query_key must be specified")
    })?;
    Ok(vec![vec![query_key.to_string()]])
}

fn lookup_key_string(field: &[String]) -> String {
    field.join(",")
}

pub struct NewTermsRule {
    ts_field: String,
    fields: Vec<Vec<String>>,
    term_windows: HashMap<usize, TermsWindow>,
    buffer: MatchBuffer,
}

impl NewTermsRule {
    /// `now` anchors the backfill window (`[now - terms_window_size, now)`),
    /// supplied by the caller rather than read from the system clock, the
    /// same way every other timestamp in this crate arrives from outside.
    pub fn new(config: &RuleConfig, backend: &dyn BackendClient, now: i64) -> CoreResult<Self> {
        let ts_field = config.get_str("timestamp_field").unwrap_or("@timestamp").to_string();
        let fields = parse_fields(config)?;
        let threshold = config.get_f64("threshold").unwrap_or(0.0) as i64;
        let window_size = config.get_duration("terms_window_size").unwrap_or(DEFAULT_WINDOW).min(MAX_WINDOW);
        let threshold_window_size = config
            .get_duration("threshold_window_size")
            .unwrap_or(DEFAULT_THRESHOLD_WINDOW)
            .min(MAX_THRESHOLD_WINDOW);
        let terms_size = config
            .get_f64("terms_size")
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_TERMS_SIZE)
            .min(MAX_TERMS_SIZE);
        let use_terms_query = config.get_bool_or("use_terms_query", false);
        let use_keyword_postfix = config.get_bool_or("use_keyword_postfix", false);

        if use_terms_query {
            let non_composite = fields.len() == 1 && fields[0].len() == 1;
            if !non_composite {
                return Err(CoreError::configuration(
                    "use_terms_query can only be used with a single non-composite field",
                ));
            }
        }

        let window_size_nanos = window_size.as_nanos() as i64;
        let start = now - window_size_nanos;
        let step_nanos = BACKFILL_STEP.as_nanos() as i64;

        let mut term_windows = HashMap::new();
        for (idx, field_spec) in fields.iter().enumerate() {
            let mut window = TermsWindow::new(window_size, ts_field.clone(), threshold, threshold_window_size);
            let spec = FieldSpec { fields: field_spec.clone(), use_keyword_postfix };
            let mut t = start;
            while t < now {
                let t_end = (t + step_nanos).min(now);
                let (terms, counts) = backend.query_terms(t, t_end, &spec)?;
                let terms: Vec<HashableValue> = terms.into_iter().take(terms_size).collect();
                window.seed(t_end, terms, counts);
                t = t_end;
            }
            if window.existing_terms().is_empty() {
                log::info!("found no existing values for {}", lookup_key_string(field_spec));
            } else {
                log::info!(
                    "found {} unique values for {}",
                    window.existing_terms().len(),
                    lookup_key_string(field_spec)
                );
            }
            term_windows.insert(idx, window);
        }

        Ok(Self { ts_field, fields, term_windows, buffer: MatchBuffer::default() })
    }

    /// Runtime entry point for a single field spec's bucket, supporting
    /// the composite-field case the shared `Detector::ingest_terms`
    /// contract can't express (it carries no "which field" dimension).
    pub fn ingest_field_terms(
        &mut self,
        field_index: usize,
        timestamp: i64,
        terms: Vec<HashableValue>,
        counts: Vec<i64>,
    ) -> CoreResult<()> {
        let lookup_key = self
            .fields
            .get(field_index)
            .map(|f| lookup_key_string(f))
            .ok_or_else(|| CoreError::configuration("field_index out of range"))?;
        let window = self
            .term_windows
            .get_mut(&field_index)
            .expect("term_windows populated for every configured field at construction");
        let (new_terms, new_counts) = window.get_new_terms(timestamp, terms, counts);
        for (term, count) in new_terms.iter().zip(new_counts.iter()) {
            let m = Match::new()
                .with_field("field", Value::Str(lookup_key.clone()))
                .with_field(self.ts_field.clone(), Value::Number(timestamp as f64))
                .with_field("new_value", dehash(term))
                .with_field("hits", Value::Number(*count as f64));
            self.buffer.push(m);
        }
        Ok(())
    }
}

impl Detector for NewTermsRule {
    fn ingest_terms(&mut self, terms: HashMap<i64, Vec<TermBucket>>) -> CoreResult<()> {
        if self.fields.len() != 1 {
            return Err(CoreError::not_implemented(
                "ingest_terms (use ingest_field_terms for composite field configurations)",
            ));
        }
        for (timestamp, buckets) in terms {
            let (keys, counts): (Vec<HashableValue>, Vec<i64>) =
                buckets.into_iter().map(|b| (b.key, b.doc_count)).unzip();
            self.ingest_field_terms(0, timestamp, keys, counts)?;
        }
        Ok(())
    }

    fn garbage_collect(&mut self, _now: i64) {}

    fn drain_matches(&mut self) -> Vec<Match> {
        self.buffer.drain()
    }

    fn format_match(&self, m: &Match) -> String {
        format!(
            "New value for {:?}: {:?} ({:?} hits)",
            m.get("field"),
            m.get("new_value"),
            m.get("hits")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::hashable;
    use serde_json::json;

    struct EmptyBackend;
    impl BackendClient for EmptyBackend {
        fn query_terms(&self, _s: i64, _e: i64, _f: &FieldSpec) -> CoreResult<(Vec<HashableValue>, Vec<i64>)> {
            Ok((Vec::new(), Vec::new()))
        }
    }

    #[test]
    fn first_sighting_after_empty_backfill_is_not_new() {
        let cfg = RuleConfig::new(json!({
            "fields": ["region"],
            "threshold": 2,
            "threshold_window_size": 3600.0,
            "terms_window_size": 86400.0,
        }));
        let mut rule = NewTermsRule::new(&cfg, &EmptyBackend, 0).unwrap();
        let mut terms = HashMap::new();
        terms.insert(0, vec![TermBucket { key: hashable(&Value::Str("us-east".into())), doc_count: 1, sub_buckets: vec![] }]);
        rule.ingest_terms(terms).unwrap();
        assert!(rule.drain_matches().is_empty());
    }

    #[test]
    fn sustained_candidate_is_promoted() {
        let cfg = RuleConfig::new(json!({
            "fields": ["region"],
            "threshold": 2,
            "threshold_window_size": 3600.0,
            "terms_window_size": 86400.0,
        }));
        let mut rule = NewTermsRule::new(&cfg, &EmptyBackend, 0).unwrap();
        let term = hashable(&Value::Str("us-east".into()));
        let mut t1 = HashMap::new();
        t1.insert(0, vec![TermBucket { key: term.clone(), doc_count: 1, sub_buckets: vec![] }]);
        rule.ingest_terms(t1).unwrap();
        let mut t2 = HashMap::new();
        t2.insert(1_000_000_000, vec![TermBucket { key: term, doc_count: 1, sub_buckets: vec![] }]);
        rule.ingest_terms(t2).unwrap();
        assert_eq!(rule.drain_matches().len(), 1);
    }
}
