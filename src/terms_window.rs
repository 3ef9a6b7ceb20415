//! New-term discovery window (spec §4.2), grounded on `ruletypes.py`'s
//! `TermsWindow`. Maintains a sliding window of `(timestamp, terms, counts)`
//! buckets, classifies incoming terms as existing vs. candidate-new, and
//! promotes a candidate to "new" once its own sub-window of sightings has
//! been sustained over `threshold` within `threshold_window_size`.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::value::HashableValue;
use crate::window::EventWindow;
use crate::Event;

fn nanos(d: Duration) -> i64 {
    d.as_nanos() as i64
}

#[derive(Debug, Clone)]
struct Bucket {
    timestamp: i64,
    terms: Vec<HashableValue>,
    counts: Vec<i64>,
}

pub struct TermsWindow {
    term_window_size: Duration,
    ts_field: String,
    threshold: i64,
    threshold_window_size: Duration,
    data: Vec<Bucket>,
    existing_terms: HashSet<HashableValue>,
    potential_new_term_windows: HashMap<HashableValue, EventWindow>,
    count_dict: HashMap<HashableValue, i64>,
}

impl TermsWindow {
    pub fn new(
        term_window_size: Duration,
        ts_field: impl Into<String>,
        threshold: i64,
        threshold_window_size: Duration,
    ) -> Self {
        Self {
            term_window_size,
            ts_field: ts_field.into(),
            threshold,
            threshold_window_size,
            data: Vec::new(),
            existing_terms: HashSet::new(),
            potential_new_term_windows: HashMap::new(),
            count_dict: HashMap::new(),
        }
    }

    pub fn existing_terms(&self) -> &HashSet<HashableValue> {
        &self.existing_terms
    }

    /// Seed the window directly, bypassing new-term classification. Used by
    /// `NewTermsRule`'s construction-time backfill, which queries existing
    /// history and wants every returned term recorded as already-seen.
    pub fn seed(&mut self, timestamp: i64, terms: Vec<HashableValue>, counts: Vec<i64>) {
        self.add(timestamp, terms, counts);
    }

    fn add(&mut self, timestamp: i64, terms: Vec<HashableValue>, counts: Vec<i64>) {
        for (term, count) in terms.iter().zip(counts.iter()) {
            *self.count_dict.entry(term.clone()).or_insert(0) += count;
            self.existing_terms.insert(term.clone());
        }
        let pos = self.data.partition_point(|b| b.timestamp <= timestamp);
        self.data.insert(pos, Bucket { timestamp, terms, counts });
        self.resize(None);
    }

    #[allow(clippy::type_complexity)]
    fn split(
        &mut self,
        timestamp: i64,
        terms: &[HashableValue],
        counts: &[i64],
    ) -> (Vec<HashableValue>, Vec<i64>, Vec<HashableValue>, Vec<i64>) {
        self.resize(Some(timestamp - nanos(self.term_window_size)));
        let mut seen_terms = Vec::new();
        let mut seen_counts = Vec::new();
        let mut unseen_terms = Vec::new();
        let mut unseen_counts = Vec::new();
        for (term, count) in terms.iter().zip(counts.iter()) {
            if self.existing_terms.contains(term) {
                seen_terms.push(term.clone());
                seen_counts.push(*count);
            } else {
                unseen_terms.push(term.clone());
                unseen_counts.push(*count);
            }
        }
        (seen_terms, seen_counts, unseen_terms, unseen_counts)
    }

    fn update_potential_new_term_windows(
        &mut self,
        timestamp: i64,
        unseen_terms: &[HashableValue],
        unseen_counts: &[i64],
    ) {
        for (term, count) in unseen_terms.iter().zip(unseen_counts.iter()) {
            let window = self
                .potential_new_term_windows
                .entry(term.clone())
                .or_insert_with(|| EventWindow::new(self.threshold_window_size, self.ts_field.clone()));
            let stamped = Event::new().with_field(
                self.ts_field.clone(),
                crate::value::Value::Number(timestamp as f64),
            );
            window.append((stamped, *count));
        }
    }

    fn extract_new_terms(
        &mut self,
        potential_new_terms: &[HashableValue],
        potential_term_counts: &[i64],
    ) -> (Vec<HashableValue>, Vec<i64>) {
        let mut new_terms = Vec::new();
        let mut new_counts = Vec::new();
        for (term, count) in potential_new_terms.iter().zip(potential_term_counts.iter()) {
            let crossed = self
                .potential_new_term_windows
                .get(term)
                .is_some_and(|w| w.count() >= self.threshold);
            if crossed {
                new_terms.push(term.clone());
                new_counts.push(*count);
                self.potential_new_term_windows.remove(term);
            }
        }
        (new_terms, new_counts)
    }

    /// Classify `terms` against the window, update candidate sub-windows,
    /// and return the subset that just crossed the new-term threshold.
    pub fn get_new_terms(
        &mut self,
        timestamp: i64,
        terms: Vec<HashableValue>,
        counts: Vec<i64>,
    ) -> (Vec<HashableValue>, Vec<i64>) {
        let (seen_terms, seen_counts, unseen_terms, unseen_counts) =
            self.split(timestamp, &terms, &counts);
        self.update_potential_new_term_windows(timestamp, &unseen_terms, &unseen_counts);
        let (new_terms, new_counts) = self.extract_new_terms(&unseen_terms, &unseen_counts);

        let mut all_terms = seen_terms;
        all_terms.extend(new_terms.iter().cloned());
        let mut all_counts = seen_counts;
        all_counts.extend(new_counts.iter().cloned());
        self.add(timestamp, all_terms, all_counts);

        (new_terms, new_counts)
    }

    /// Drop buckets older than `till` (default: newest timestamp minus
    /// `term_window_size`), decrementing `count_dict` and retiring any term
    /// whose count falls to zero or below from `existing_terms`.
    fn resize(&mut self, till: Option<i64>) {
        if self.data.is_empty() {
            return;
        }
        let till = till.unwrap_or_else(|| {
            self.data.last().expect("checked non-empty").timestamp - nanos(self.term_window_size)
        });
        while self.data.first().is_some_and(|b| b.timestamp < till) {
            let bucket = self.data.remove(0);
            for (term, count) in bucket.terms.iter().zip(bucket.counts.iter()) {
                if let Some(entry) = self.count_dict.get_mut(term) {
                    *entry -= count;
                    if *entry <= 0 {
                        self.count_dict.remove(term);
                        self.existing_terms.remove(term);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn term(s: &str) -> HashableValue {
        crate::value::hashable(&Value::Str(s.to_string()))
    }

    #[test]
    fn first_sighting_is_not_immediately_new() {
        let mut w = TermsWindow::new(
            Duration::from_secs(3600),
            "@timestamp",
            2,
            Duration::from_secs(60),
        );
        let (new_terms, _) = w.get_new_terms(0, vec![term("us-east")], vec![1]);
        assert!(new_terms.is_empty());
    }

    #[test]
    fn term_promoted_after_crossing_threshold() {
        let mut w = TermsWindow::new(
            Duration::from_secs(3600),
            "@timestamp",
            2,
            Duration::from_secs(60),
        );
        w.get_new_terms(0, vec![term("us-east")], vec![1]);
        let (new_terms, _) = w.get_new_terms(1_000_000_000, vec![term("us-east")], vec![1]);
        assert_eq!(new_terms, vec![term("us-east")]);
        assert!(w.existing_terms().contains(&term("us-east")));
    }

    #[test]
    fn seen_term_never_resurfaces_as_new() {
        let mut w = TermsWindow::new(
            Duration::from_secs(3600),
            "@timestamp",
            1,
            Duration::from_secs(60),
        );
        w.get_new_terms(0, vec![term("x")], vec![1]);
        let (new_terms, _) = w.get_new_terms(2_000_000_000, vec![term("x")], vec![1]);
        assert!(new_terms.is_empty());
    }

    #[test]
    fn resize_retires_expired_terms() {
        let mut w = TermsWindow::new(
            Duration::from_secs(10),
            "@timestamp",
            1,
            Duration::from_secs(1),
        );
        w.get_new_terms(0, vec![term("x")], vec![1]);
        assert!(w.existing_terms().contains(&term("x")));
        w.get_new_terms(20_000_000_000, vec![term("y")], vec![1]);
        assert!(!w.existing_terms().contains(&term("x")));
    }
}
