//! The six concrete scenarios from spec §8, exercised end to end through
//! each detector's public `Detector` trait surface rather than its
//! internals.

use rule_core::detector::FieldSpec;
use rule_core::detectors::cardinality::CardinalityRule;
use rule_core::detectors::change::ChangeRule;
use rule_core::detectors::flatline::FlatlineRule;
use rule_core::detectors::frequency::FrequencyRule;
use rule_core::detectors::new_terms::NewTermsRule;
use rule_core::detectors::spike::SpikeRule;
use rule_core::{BackendClient, CoreResult, Detector, Event, HashableValue, RuleConfig, Value};
use serde_json::json;

fn evt(ts_secs: i64) -> Event {
    Event::new().with_field("@timestamp", Value::Number((ts_secs * 1_000_000_000) as f64))
}

fn evt_with(ts_secs: i64, field: &str, value: Value) -> Event {
    evt(ts_secs).with_field(field, value)
}

struct EmptyBackend;
impl BackendClient for EmptyBackend {
    fn query_terms(&self, _s: i64, _e: i64, _f: &FieldSpec) -> CoreResult<(Vec<HashableValue>, Vec<i64>)> {
        Ok((Vec::new(), Vec::new()))
    }
}

#[test]
fn scenario_1_frequency_matches_on_third_event_in_window() {
    let cfg = RuleConfig::new(json!({"num_events": 3, "timeframe": 60.0}));
    let mut rule = FrequencyRule::new(&cfg).unwrap();
    rule.ingest_events(&[evt_with(0, "user", Value::Str("a".into()))]).unwrap();
    rule.ingest_events(&[evt_with(30, "user", Value::Str("a".into()))]).unwrap();
    assert!(rule.drain_matches().is_empty());
    rule.ingest_events(&[evt_with(50, "user", Value::Str("a".into()))]).unwrap();
    let matches = rule.drain_matches();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].get("@timestamp"), Some(&Value::Number(50_000_000_000.0)));
}

#[test]
fn scenario_2_flatline_reports_low_count_after_gc() {
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
fn scenario_3_spike_up_after_reference_window_fills() {
    let cfg = RuleConfig::new(json!({"spike_height": 3.0, "spike_type": "up", "timeframe": 10.0}));
    let mut rule = SpikeRule::new(&cfg).unwrap();
    for t in 0..20 {
        rule.ingest_events(&[evt(t)]).unwrap();
    }
    for _ in 0..10 {
        rule.ingest_events(&[evt(20)]).unwrap();
    }
    let matches = rule.drain_matches();
    assert_eq!(matches.len(), 1);
    let spike_count = matches[0].get("spike_count").and_then(Value::as_f64).unwrap();
    let reference_count = matches[0].get("reference_count").and_then(Value::as_f64).unwrap();
    assert!(spike_count >= 30.0, "spike_count was {spike_count}");
    assert!((reference_count - 10.0).abs() < 1.0, "reference_count was {reference_count}");
}

#[test]
fn scenario_4_change_matches_with_old_and_new_value() {
    let cfg = RuleConfig::new(json!({
        "query_key": "user",
        "compound_compare_key": ["status"],
        "ignore_null": true,
    }));
    let mut rule = ChangeRule::new(&cfg).unwrap();
    let e1 = evt(0).with_field("user", Value::Str("u".into())).with_field("status", Value::Str("ok".into()));
    let e2 = evt(1).with_field("user", Value::Str("u".into())).with_field("status", Value::Str("err".into()));
    rule.ingest_events(&[e1]).unwrap();
    assert!(rule.drain_matches().is_empty());
    rule.ingest_events(&[e2]).unwrap();
    let matches = rule.drain_matches();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].get("old_value"), Some(&Value::Array(vec![Value::Str("ok".into())])));
    assert_eq!(matches[0].get("new_value"), Some(&Value::Array(vec![Value::Str("err".into())])));
}

#[test]
fn scenario_5_new_terms_promotes_after_sustained_sighting() {
    let cfg = RuleConfig::new(json!({
        "fields": ["term"],
        "threshold": 2,
        "threshold_window_size": 3600.0,
        "terms_window_size": 86400.0,
    }));
    let mut rule = NewTermsRule::new(&cfg, &EmptyBackend, 0).unwrap();
    let x = HashableValue::Str("x".into());

    rule.ingest_field_terms(0, 0, vec![x.clone()], vec![1]).unwrap();
    assert!(rule.drain_matches().is_empty());

    rule.ingest_field_terms(0, 1_800_000_000_000, vec![x.clone()], vec![1]).unwrap();
    let matches = rule.drain_matches();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].get("new_value"), Some(&Value::Str("x".into())));
    assert_eq!(matches[0].get("hits"), Some(&Value::Number(1.0)));

    rule.ingest_field_terms(0, 3_600_000_000_000, vec![x], vec![1]).unwrap();
    assert!(rule.drain_matches().is_empty());
}

#[test]
fn scenario_6_cardinality_matches_over_max_then_gc_quiets_it() {
    let cfg = RuleConfig::new(json!({"max_cardinality": 3, "cardinality_field": "ip", "timeframe": 60.0}));
    let mut rule = CardinalityRule::new(&cfg).unwrap();
    let ip = |s: &str| Value::Str(s.to_string());
    rule.ingest_events(&[
        evt_with(0, "ip", ip("a")),
        evt_with(1, "ip", ip("b")),
        evt_with(2, "ip", ip("c")),
    ]).unwrap();
    assert!(rule.drain_matches().is_empty());
    rule.ingest_events(&[evt_with(3, "ip", ip("d"))]).unwrap();
    assert_eq!(rule.drain_matches().len(), 1);

    rule.ingest_events(&[evt_with(100, "ip", ip("a"))]).unwrap();
    assert!(rule.drain_matches().is_empty());
}
