//! Stateful rule evaluation core for an alert engine (spec §1-§2):
//! threshold, change, spike, flatline, new-term, cardinality and
//! aggregation detectors running over per-key sliding windows, fed by an
//! external scheduler through the [`Detector`] trait.

pub mod config;
pub mod detector;
pub mod detectors;
pub mod error;
pub mod event;
pub mod registry;
pub mod terms_window;
pub mod value;
pub mod window;

pub use config::RuleConfig;
pub use detector::{AggPayload, BackendClient, CountData, Detector, FieldSpec, MatchBuffer, TermBucket};
pub use error::{CoreError, CoreResult};
pub use event::{CountedEvent, Event, Match};
pub use registry::build_detector;
pub use terms_window::TermsWindow;
pub use value::{dehash, hashable, HashableValue, Value};
pub use window::EventWindow;
