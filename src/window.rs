//! Sliding windows over timestamped, counted events (spec §4.1, §4.2),
//! grounded on `ruletypes.py`'s `EventWindow` and `TermsWindow`.
//!
//! The Python `EventWindow` keeps a `sortedlist` and fires an `onRemoved`
//! callback as it evicts. Storing a callback alongside the window it would
//! mutate is awkward in Rust when the window lives inside the same struct
//! that owns the callback's captures, so eviction is expressed as a return
//! value instead: `append` returns the events it evicted, and the caller
//! (a detector's `ingest_*` method) decides what to do with them. This also
//! subsumes Python's `append_middle` (a deque-rotation insert for
//! out-of-order arrivals) — our insertion position is always found by
//! binary search, so an out-of-order append costs no more than an in-order
//! one and a second method isn't needed.

use std::time::Duration;

use crate::event::CountedEvent;
use crate::value::parse_timestamp_nanos;
use crate::Event;

/// Chronologically ordered window of `(event, count)` pairs spanning at
/// most `timeframe`. Maintains a running sum so `count()` is O(1).
#[derive(Debug, Clone)]
pub struct EventWindow {
    timeframe: Duration,
    ts_field: String,
    data: Vec<CountedEvent>,
    running_count: i64,
}

impl EventWindow {
    pub fn new(timeframe: Duration, ts_field: impl Into<String>) -> Self {
        Self {
            timeframe,
            ts_field: ts_field.into(),
            data: Vec::new(),
            running_count: 0,
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.running_count = 0;
    }

    fn timestamp_of(&self, pair: &CountedEvent) -> i64 {
        pair.0
            .get_path(&self.ts_field)
            .as_ref()
            .and_then(parse_timestamp_nanos)
            .unwrap_or(0)
    }

    /// Insert `event`, then evict and return entries from the front until
    /// the window's span is back under `timeframe`.
    pub fn append(&mut self, event: CountedEvent) -> Vec<CountedEvent> {
        let ts = self.timestamp_of(&event);
        let pos = self
            .data
            .partition_point(|existing| self.timestamp_of(existing) <= ts);
        self.running_count += event.1;
        self.data.insert(pos, event);

        let mut evicted = Vec::new();
        while self.duration() >= self.timeframe {
            let oldest = self.data.remove(0);
            self.running_count -= oldest.1;
            evicted.push(oldest);
        }
        evicted
    }

    pub fn duration(&self) -> Duration {
        match (self.data.first(), self.data.last()) {
            (Some(first), Some(last)) => {
                let span = self.timestamp_of(last) - self.timestamp_of(first);
                Duration::from_nanos(span.max(0) as u64)
            }
            _ => Duration::ZERO,
        }
    }

    pub fn count(&self) -> i64 {
        self.running_count
    }

    /// Mean of the counted value across non-placeholder entries.
    pub fn mean(&self) -> Option<f64> {
        let mut sum = 0i64;
        let mut len = 0i64;
        for (event, count) in &self.data {
            if !event.is_placeholder() {
                sum += count;
                len += 1;
            }
        }
        (len > 0).then(|| sum as f64 / len as f64)
    }

    pub fn min(&self) -> Option<i64> {
        self.data.iter().map(|(_, c)| *c).min()
    }

    pub fn max(&self) -> Option<i64> {
        self.data.iter().map(|(_, c)| *c).max()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CountedEvent> {
        self.data.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn ts_event(nanos: i64, count: i64) -> CountedEvent {
        (Event::new().with_field("@timestamp", Value::Number(nanos as f64)), count)
    }

    #[test]
    fn evicts_once_timeframe_exceeded() {
        let mut w = EventWindow::new(Duration::from_secs(10), "@timestamp");
        assert!(w.append(ts_event(0, 1)).is_empty());
        assert!(w.append(ts_event(5_000_000_000, 1)).is_empty());
        let evicted = w.append(ts_event(11_000_000_000, 1));
        assert_eq!(evicted.len(), 1);
        assert_eq!(w.count(), 2);
    }

    #[test]
    fn mean_excludes_placeholders() {
        let mut w = EventWindow::new(Duration::from_secs(100), "@timestamp");
        w.append(ts_event(0, 4));
        w.append(ts_event(1_000_000_000, 6));
        let mut placeholder = Event::placeholder();
        placeholder.fields.insert("@timestamp".into(), Value::Number(2_000_000_000.0));
        w.append((placeholder, 0));
        assert_eq!(w.mean(), Some(5.0));
    }

    #[test]
    fn out_of_order_append_lands_in_sorted_position() {
        let mut w = EventWindow::new(Duration::from_secs(100), "@timestamp");
        w.append(ts_event(10_000_000_000, 1));
        w.append(ts_event(0, 1));
        let ordered: Vec<_> = w
            .iter()
            .map(|(e, _)| e.get("@timestamp").unwrap().as_f64().unwrap() as i64)
            .collect();
        assert_eq!(ordered, vec![0, 10_000_000_000]);
    }

    #[test]
    fn clear_resets_count_and_data() {
        let mut w = EventWindow::new(Duration::from_secs(10), "@timestamp");
        w.append(ts_event(0, 3));
        w.clear();
        assert_eq!(w.count(), 0);
        assert!(w.is_empty());
    }

    /// After a long randomized append sequence, `count()` always equals the
    /// sum of counts still present in `data` (the invariant behind the
    /// running-count optimization), and `duration()` never exceeds
    /// `timeframe` once at least one append has settled.
    #[test]
    fn running_count_matches_sum_after_random_appends() {
        let mut rng: u64 = 0x2545F4914F6CDD1D;
        let mut next = || {
            rng ^= rng << 13;
            rng ^= rng >> 7;
            rng ^= rng << 17;
            rng
        };
        let mut w = EventWindow::new(Duration::from_secs(30), "@timestamp");
        let mut t: i64 = 0;
        for _ in 0..500 {
            t += (next() % 5_000_000_000) as i64;
            let count = (next() % 10) as i64;
            w.append(ts_event(t, count));
            let actual_sum: i64 = w.iter().map(|(_, c)| *c).sum();
            assert_eq!(w.count(), actual_sum);
            assert!(w.duration() <= Duration::from_secs(30));
        }
    }
}
