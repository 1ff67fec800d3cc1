//! Tally - device-side telemetry engine core.
//!
//! Tally ingests a continuous stream of structured events (atoms) and
//! produces time-bucketed metric reports — counts, durations, values,
//! gauges, and events sliced by configurable dimensions. A client
//! supplies a declarative configuration naming atom matchers,
//! predicates, metrics, alerts, and activation rules; the engine
//! compiles it into a dataflow graph and evaluates it online.
//!
//! # Features
//!
//! - **Declarative configuration**: matchers, predicates, metrics, and
//!   alerts wired by id, validated into an index-based graph
//! - **Five producer kinds**: count, duration, value, gauge, event
//! - **Dimension slicing**: structural keys with position collapse
//! - **Sampling**: probabilistic gates and consistent dimensional shards
//! - **Guardrails**: dimension limits and byte caps that degrade, never
//!   abort
//!
//! # Architecture
//!
//! - `core`: event model, configuration, errors, diagnostics
//! - `matcher`: the event filtering and transformation layer
//! - `condition`: stateful predicates and the sliced-condition wizard
//! - `metrics`: the five producers and shared bucket machinery
//! - `engine`: the per-configuration manager and dispatcher
//! - `report`: dump flow and report structures
//! - `alerts`: rolling-window anomaly trackers
//! - `external`: collaborator traits at the core boundary
//!
//! # Example
//!
//! ```
//! use tally::core::{ConfigKey, EngineConfig, Event, MatcherConfig, MatcherSpec,
//!     MetricConfig, ProducerConfig};
//! use tally::engine::MetricsManager;
//! use tally::external::Collaborators;
//! use tally::report::{DumpLatency, DumpRequest};
//!
//! let config = EngineConfig {
//!     matchers: vec![MatcherConfig {
//!         id: 1,
//!         spec: MatcherSpec::Simple {
//!             atom_id: 42,
//!             field_matchers: vec![],
//!             transforms: vec![],
//!         },
//!     }],
//!     metrics: vec![MetricConfig {
//!         id: 100,
//!         bucket: None,
//!         condition_id: None,
//!         condition_links: vec![],
//!         slice_by_state: vec![],
//!         state_links: vec![],
//!         dimensions_in_what: vec![],
//!         activations: vec![],
//!         sampling_percentage: None,
//!         dimensional_sampling: None,
//!         soft_dimension_limit: None,
//!         hard_dimension_limit: None,
//!         split_on_app_upgrade: true,
//!         omit_empty_buckets: false,
//!         producer: ProducerConfig::Count { what_matcher_id: 1 },
//!     }],
//!     ..Default::default()
//! };
//!
//! let key = ConfigKey { uid: 1000, id: 1 };
//! let mut manager = MetricsManager::new(key, config, 0, 0, Collaborators::default());
//! manager.on_event(&Event::builder(42).uid(1000).at(1_000_000_000).build());
//!
//! let report = manager
//!     .dump_report(&DumpRequest {
//!         dump_time_ns: 2_000_000_000,
//!         include_current_partial_bucket: true,
//!         erase_data: false,
//!         latency: DumpLatency::Slow,
//!     })
//!     .unwrap();
//! assert_eq!(report.metrics.len(), 1);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod alerts;
pub mod condition;
pub mod core;
pub mod dimension;
pub mod engine;
pub mod external;
pub mod matcher;
pub mod metrics;
pub mod report;
pub mod sampling;

pub use crate::core::{
    ConfigKey, EngineConfig, Event, EventBuilder, FieldPath, FieldValue, InvalidConfigReason,
    Result, TallyError, Value,
};
pub use engine::MetricsManager;
pub use report::{ConfigReport, DumpLatency, DumpRequest};
