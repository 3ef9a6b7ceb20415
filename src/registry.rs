//! String-keyed detector factory (spec §6's `new(rules_config, args)`),
//! grounded on `wf-core/src/window/registry.rs`'s build-from-definitions
//! shape: one entry point that turns configuration into boxed trait
//! objects, erroring on anything it doesn't recognize.

use crate::config::RuleConfig;
use crate::detector::{BackendClient, Detector};
use crate::detectors::aggregation::{
    AdvanceSearchRule, ErrorRateRule, MetricAggregationRule, PercentageMatchRule, SpikeMetricAggregationRule,
};
use crate::detectors::cardinality::CardinalityRule;
use crate::detectors::change::ChangeRule;
use crate::detectors::compare::{AnyRule, BlacklistRule, WhitelistRule};
use crate::detectors::flatline::FlatlineRule;
use crate::detectors::frequency::FrequencyRule;
use crate::detectors::new_terms::NewTermsRule;
use crate::detectors::spike::SpikeRule;
use crate::error::{CoreError, CoreResult};

/// Build a detector for the named rule type. `backend`/`now` are only
/// consulted by `new_term`, which backfills from the backend at
/// construction time; every other rule type ignores them.
pub fn build_detector(
    rule_type: &str,
    config: &RuleConfig,
    backend: &dyn BackendClient,
    now: i64,
) -> CoreResult<Box<dyn Detector>> {
    let detector: Box<dyn Detector> = match rule_type {
        "any" => Box::new(AnyRule::new(config)?),
        "blacklist" => Box::new(BlacklistRule::new(config)?),
        "whitelist" => Box::new(WhitelistRule::new(config)?),
        "change" => Box::new(ChangeRule::new(config)?),
        "frequency" => Box::new(FrequencyRule::new(config)?),
        "flatline" => Box::new(FlatlineRule::new(config)?),
        "spike" => Box::new(SpikeRule::new(config)?),
        "new_term" => Box::new(NewTermsRule::new(config, backend, now)?),
        "cardinality" => Box::new(CardinalityRule::new(config)?),
        "metric_aggregation" => Box::new(MetricAggregationRule::new(config)?),
        "spike_aggregation" => Box::new(SpikeMetricAggregationRule::new(config)?),
        "percentage_match" => Box::new(PercentageMatchRule::new(config)?),
        "error_rate" => Box::new(ErrorRateRule::new(config)?),
        "advance_search" => Box::new(AdvanceSearchRule::new(config)?),
        other => return Err(CoreError::configuration(format!("unknown rule type '{other}'"))),
    };
    Ok(detector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::FieldSpec;
    use crate::value::HashableValue;
    use serde_json::json;

    struct EmptyBackend;
    impl BackendClient for EmptyBackend {
        fn query_terms(&self, _s: i64, _e: i64, _f: &FieldSpec) -> CoreResult<(Vec<HashableValue>, Vec<i64>)> {
            Ok((Vec::new(), Vec::new()))
        }
    }

    #[test]
    fn builds_known_rule_types() {
        let cfg = RuleConfig::new(json!({"compare_key": "user", "blacklist": ["bob"]}));
        assert!(build_detector("blacklist", &cfg, &EmptyBackend, 0).is_ok());
    }

    #[test]
    fn unknown_rule_type_is_configuration_error() {
        let cfg = RuleConfig::empty();
        let err = build_detector("not_a_real_rule", &cfg, &EmptyBackend, 0).unwrap_err();
        assert!(matches!(err, CoreError::Configuration(_)));
    }

    #[test]
    fn new_term_backfills_through_injected_backend() {
        let cfg = RuleConfig::new(json!({"fields": ["region"], "threshold": 1}));
        assert!(build_detector("new_term", &cfg, &EmptyBackend, 0).is_ok());
    }
}
