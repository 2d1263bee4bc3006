//! Evaluation of benchmark output collected on cluster nodes.

pub mod lscpu;
pub mod osu;

pub use lscpu::{expected_cpus, expected_threads_per_core, LscpuSummary};
pub use osu::{
    check_thresholds, parse_latency_output, Dimension, MetricDatum, ReferenceLatency,
    ReferenceResults, ACCEPTED_NUMBER_OF_FAILURES,
};
