//! Self-calibration for one market: the warmup state machine, its bundle
//! derivation, the atomic snapshot store, the warmup report and the slow
//! post-warmup adaptation of the live bundle.

pub mod adapt;
pub mod config;
pub mod machine;
pub mod meta;
pub mod report;
pub mod store;

pub use crate::adapt::{adaptation_alpha, blend_bundle, ContinuousAdapter};
pub use crate::config::WarmupConfig;
pub use crate::machine::{CalibrationMachine, CalibrationPhase, PhaseChange};
pub use crate::meta::{default_bundle, meta_calibrate};
pub use crate::report::{CalibrationReport, SamplingSummary, SanityFlag, VolatilityVerdict};
pub use crate::store::{market_slug, CalibrationStore, PersistedCalibration, SNAPSHOT_VERSION};
