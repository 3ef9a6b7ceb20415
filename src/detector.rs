//! The common detector contract (spec §6): a capability set over four
//! ingest channels plus GC and match draining. A detector only supports the
//! channels its rule type consumes; the rest fall through to the default
//! bodies here and signal `NotImplemented`, mirroring the "tagged variants,
//! default-unsupported channels" shape from spec §9.

use std::collections::HashMap;

use crate::error::{CoreError, CoreResult};
use crate::event::{Event, Match};
use crate::value::{HashableValue, Value};

/// One pre-aggregated count bucket handed to `ingest_counts`.
#[derive(Debug, Clone)]
pub struct CountData {
    pub endtime: i64,
    pub count: i64,
    pub event: Option<Event>,
}

/// One bucket from a backend terms aggregation: a key, its doc count, and
/// (for composite/nested fields) further sub-buckets keyed by the next
/// field in the composite tuple.
#[derive(Debug, Clone, Default)]
pub struct TermBucket {
    pub key: HashableValue,
    pub doc_count: i64,
    pub sub_buckets: Vec<TermBucket>,
}

/// Nested aggregation payload handed to `ingest_aggregation`. At most one
/// of `interval_aggs` / `bucket_aggs` is populated for a given payload; a
/// leaf payload (neither populated) carries the metric fields a
/// `BaseAggregation` detector reads out directly.
#[derive(Debug, Clone, Default)]
pub struct AggPayload {
    pub interval_aggs: Vec<(i64, AggPayload)>,
    pub bucket_aggs: Vec<(HashableValue, AggPayload)>,
    pub fields: HashMap<String, Value>,
}

impl AggPayload {
    pub fn leaf(fields: HashMap<String, Value>) -> Self {
        Self { fields, ..Default::default() }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// The field(s) a `query_terms` call aggregates on — a single field, or a
/// composite tuple for multi-field `NewTermsRule` configurations.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub fields: Vec<String>,
    pub use_keyword_postfix: bool,
}

/// The single injected collaborator (spec §5): a synchronous backend query
/// used only by `NewTermsRule` backfill and `AdvanceSearch::run_query`.
pub trait BackendClient {
    fn query_terms(
        &self,
        start: i64,
        end: i64,
        field: &FieldSpec,
    ) -> CoreResult<(Vec<HashableValue>, Vec<i64>)>;
}

/// Common contract every detector implements. Default method bodies signal
/// `NotImplemented` for ingest channels a given rule type doesn't consume.
pub trait Detector {
    fn ingest_events(&mut self, events: &[Event]) -> CoreResult<()> {
        let _ = events;
        Err(CoreError::not_implemented("ingest_events"))
    }

    fn ingest_counts(&mut self, data: CountData) -> CoreResult<()> {
        let _ = data;
        Err(CoreError::not_implemented("ingest_counts"))
    }

    fn ingest_terms(&mut self, terms: HashMap<i64, Vec<TermBucket>>) -> CoreResult<()> {
        let _ = terms;
        Err(CoreError::not_implemented("ingest_terms"))
    }

    fn ingest_aggregation(&mut self, payload: HashMap<i64, AggPayload>) -> CoreResult<()> {
        let _ = payload;
        Err(CoreError::not_implemented("ingest_aggregation"))
    }

    fn garbage_collect(&mut self, now: i64);

    fn drain_matches(&mut self) -> Vec<Match>;

    fn format_match(&self, m: &Match) -> String;
}

/// Shared append/drain buffer used by every detector's match output. Not
/// part of the public `Detector` contract — a plain field each detector
/// struct embeds, the way `wf-core`'s rule executors embed an output `Vec`.
#[derive(Debug, Clone, Default)]
pub struct MatchBuffer(Vec<Match>);

impl MatchBuffer {
    pub fn push(&mut self, m: Match) {
        self.0.push(m);
    }

    pub fn drain(&mut self) -> Vec<Match> {
        std::mem::take(&mut self.0)
    }
}
