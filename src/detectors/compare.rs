//! Blacklist, whitelist, and any-match detectors (spec §4.3), grounded on
//! `ruletypes.py`'s `CompareRule`/`BlacklistRule`/`WhitelistRule`/`AnyRule`.
//! Stateless: every ingested event is tested independently against the
//! configured list.

use std::collections::HashSet;
use std::fs;

use crate::config::RuleConfig;
use crate::detector::{Detector, MatchBuffer};
use crate::error::{CoreError, CoreResult};
use crate::event::{Event, Match};
use crate::value::Value;

/// Expand `!file <path>` entries (one list entry per line, trailing
/// whitespace stripped) and fold everything into a set, per
/// `CompareRule.expand_entries`.
fn expand_entries(entries: &[String]) -> CoreResult<HashSet<String>> {
    let mut set = HashSet::new();
    for entry in entries {
        if let Some(path) = entry.strip_prefix("!file ") {
            let contents = fs::read_to_string(path.trim())
                .map_err(|e| CoreError::configuration(format!("cannot read {path}: {e}")))?;
            for line in contents.lines() {
                set.insert(line.trim_end().to_string());
            }
        } else {
            set.insert(entry.clone());
        }
    }
    Ok(set)
}

fn compare_value(event: &Event, compare_key: &str) -> Option<String> {
    event.get_path(compare_key).map(|v| match v {
        Value::Str(s) => s,
        other => other.to_string(),
    })
}

pub struct BlacklistRule {
    compare_key: String,
    blacklist: HashSet<String>,
    buffer: MatchBuffer,
}

impl BlacklistRule {
    pub fn new(config: &RuleConfig) -> CoreResult<Self> {
        let compare_key = config.require_str("compare_key")?.to_string();
        let blacklist = expand_entries(&config.get_string_list("blacklist"))?;
        Ok(Self { compare_key, blacklist, buffer: MatchBuffer::default() })
    }
}

impl Detector for BlacklistRule {
    fn ingest_events(&mut self, events: &[Event]) -> CoreResult<()> {
        for event in events {
            if let Some(term) = compare_value(event, &self.compare_key)
                && self.blacklist.contains(&term)
            {
                self.buffer.push(Match::from_event(event));
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
            "Field {} matched blacklist entry {:?}",
            self.compare_key,
            m.get_path_str(&self.compare_key)
        )
    }
}

pub struct WhitelistRule {
    compare_key: String,
    whitelist: HashSet<String>,
    ignore_null: bool,
    buffer: MatchBuffer,
}

impl WhitelistRule {
    pub fn new(config: &RuleConfig) -> CoreResult<Self> {
        let compare_key = config.require_str("compare_key")?.to_string();
        let whitelist = expand_entries(&config.get_string_list("whitelist"))?;
        let ignore_null = config.get_bool_or("ignore_null", false);
        Ok(Self { compare_key, whitelist, ignore_null, buffer: MatchBuffer::default() })
    }
}

impl Detector for WhitelistRule {
    fn ingest_events(&mut self, events: &[Event]) -> CoreResult<()> {
        for event in events {
            let term = compare_value(event, &self.compare_key);
            let is_match = match term {
                None => !self.ignore_null,
                Some(t) => !self.whitelist.contains(&t),
            };
            if is_match {
                self.buffer.push(Match::from_event(event));
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
            "Field {} value {:?} was not in the configured whitelist",
            self.compare_key,
            m.get_path_str(&self.compare_key)
        )
    }
}

/// Matches every ingested event unconditionally.
pub struct AnyRule {
    buffer: MatchBuffer,
}

impl AnyRule {
    pub fn new(_config: &RuleConfig) -> CoreResult<Self> {
        Ok(Self { buffer: MatchBuffer::default() })
    }
}

impl Detector for AnyRule {
    fn ingest_events(&mut self, events: &[Event]) -> CoreResult<()> {
        for event in events {
            self.buffer.push(Match::from_event(event));
        }
        Ok(())
    }

    fn garbage_collect(&mut self, _now: i64) {}

    fn drain_matches(&mut self) -> Vec<Match> {
        self.buffer.drain()
    }

    fn format_match(&self, _m: &Match) -> String {
        "Matched all events".to_string()
    }
}

trait MatchFieldDisplay {
    fn get_path_str(&self, path: &str) -> String;
}

impl MatchFieldDisplay for Match {
    fn get_path_str(&self, path: &str) -> String {
        if let Some(v) = self.fields.get(path) {
            return v.to_string();
        }
        "<missing>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn evt(field: &str, val: &str) -> Event {
        Event::new().with_field(field, Value::Str(val.to_string()))
    }

    #[test]
    fn blacklist_matches_listed_value() {
        let cfg = RuleConfig::new(json!({"compare_key": "user", "blacklist": ["bob"]}));
        let mut rule = BlacklistRule::new(&cfg).unwrap();
        rule.ingest_events(&[evt("user", "bob"), evt("user", "alice")]).unwrap();
        assert_eq!(rule.drain_matches().len(), 1);
    }

    #[test]
    fn whitelist_matches_unlisted_value() {
        let cfg = RuleConfig::new(json!({"compare_key": "user", "whitelist": ["alice"], "ignore_null": false}));
        let mut rule = WhitelistRule::new(&cfg).unwrap();
        rule.ingest_events(&[evt("user", "bob"), evt("user", "alice")]).unwrap();
        assert_eq!(rule.drain_matches().len(), 1);
    }

    #[test]
    fn whitelist_null_respects_ignore_null() {
        let cfg = RuleConfig::new(json!({"compare_key": "user", "whitelist": ["alice"], "ignore_null": true}));
        let mut rule = WhitelistRule::new(&cfg).unwrap();
        rule.ingest_events(&[Event::new()]).unwrap();
        assert!(rule.drain_matches().is_empty());
    }

    #[test]
    fn any_rule_matches_everything() {
        let cfg = RuleConfig::empty();
        let mut rule = AnyRule::new(&cfg).unwrap();
        rule.ingest_events(&[evt("a", "1"), evt("b", "2")]).unwrap();
        assert_eq!(rule.drain_matches().len(), 2);
    }
}
