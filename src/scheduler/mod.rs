//! Request admission and the continuous batching control loop.

pub mod admission;
pub mod batch;
pub mod sink;
pub mod static_batch;

pub use admission::AdmissionQueue;
pub use batch::{Admission, DecodeScheduler, SchedulerStats, TickOutputs};
pub use sink::{GenerationResult, ResultSink};
pub use static_batch::{compare_results, run_alone, run_static_batch, Divergence, DivergenceKind};
