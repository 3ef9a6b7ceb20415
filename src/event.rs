//! `Event` and `Match` records (spec §3), plus the `placeholder` sentinel
//! used by `EventWindow`'s garbage collector to advance window time without
//! perturbing aggregate statistics.

use std::collections::HashMap;

use crate::value::{lookup_path, Value};

/// A single event, keyed by field name. Mirrors
/// `wf-core`'s `match_engine::types::Event` shape, generalized with a
/// `Value::Map` container so dotted-path lookup can recurse into nested
/// structure instead of being limited to one flat level.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Event {
    pub fields: HashMap<String, Value>,
}

impl Event {
    pub fn new() -> Self {
        Self { fields: HashMap::new() }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Dotted-path resolution, see [`crate::value::lookup_path`]. The
    /// top-level lookup also tries the literal field name first, since most
    /// paths in practice are a single flat field and a `HashMap` lookup is
    /// cheaper than wrapping the map in a `Value::Map` to recurse through.
    pub fn get_path(&self, path: &str) -> Option<Value> {
        if let Some(v) = self.fields.get(path) {
            return Some(v.clone());
        }
        let (head, rest) = path.split_once('.')?;
        let head_val = self.fields.get(head)?;
        lookup_path(head_val, rest)
    }

    /// True when this event was synthesized by garbage collection to
    /// advance a window's clock rather than observed from the backend.
    /// Placeholders count toward `EventWindow::duration` but are excluded
    /// from `mean`/`min`/`max` and never reach a detector's match logic.
    pub fn is_placeholder(&self) -> bool {
        matches!(self.fields.get("placeholder"), Some(Value::Bool(true)))
    }

    pub fn placeholder() -> Self {
        Event::new().with_field("placeholder", Value::Bool(true))
    }
}

/// `(event, count)` pair carried by count-based windows (`EventWindow`
/// operating on bucketed frequency data rather than raw per-event hits).
pub type CountedEvent = (Event, i64);

pub fn is_placeholder(pair: &CountedEvent) -> bool {
    pair.0.is_placeholder()
}

/// A detector match, emitted to the caller via `Detector::drain_matches`.
/// Same shape as [`Event`] — a match is an event-shaped record carrying
/// whatever fields the firing detector chose to annotate.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Match {
    pub fields: HashMap<String, Value>,
}

impl Match {
    pub fn new() -> Self {
        Self { fields: HashMap::new() }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn from_event(event: &Event) -> Self {
        Self { fields: event.fields.clone() }
    }
}
