//! PLC historian
//!
//! Polls tags from one or more industrial controllers on a fixed interval,
//! normalizes every reading to a quality-tagged `f64`, and appends each poll
//! cycle as one timestamped batch to a SQLite time series.
//!
//! Pipeline, per tick:
//!
//! ```text
//! PollScheduler ─▶ ControllerPool::poll_all ─▶ Normalizer ─▶ SqliteStore::append_batch
//!                   (one read per controller,
//!                    run concurrently)
//! ```

pub mod api;
pub mod config;
pub mod controller;
pub mod normalize;
pub mod pool;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod telemetry;

pub use config::{load_config, Config};
pub use controller::{ClientError, ControllerClient, ControllerConnection, RawValue};
pub use normalize::{normalize_value, Normalizer, PollBatch, Quality, Sample};
pub use pool::{ControllerPool, PollOutcome, PoolError};
pub use registry::{TagRegistry, TagSpec};
pub use scheduler::{PollScheduler, SchedulerError, SchedulerState, StopHandle};
pub use store::{FeatureMatrix, SqliteStore, StoreError};
