//! OSU micro-benchmark latency evaluation.
//!
//! Measured latencies are compared against reference results recorded per MPI
//! variant, benchmark and packet size.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::BenchmarkError;

/// A benchmark fails once more than this many packet sizes exceed the threshold.
pub const ACCEPTED_NUMBER_OF_FAILURES: usize = 3;

const LATENCY_METRIC: &str = "Latency";
const PACKET_SIZE: &str = "PacketSize";
const BENCHMARK_NAME: &str = "OsuBenchmarkName";
const MPI_VARIANT: &str = "MpiVariant";

const REFERENCE_COLUMNS: [&str; 5] = ["mpi_version", "test_name", "packet_size", "average", "std"];

/// Reference latency of one packet size, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferenceLatency {
    pub average: f64,
    pub std: f64,
}

/// Reference results keyed by MPI variant, benchmark name and packet size.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceResults(BTreeMap<String, BTreeMap<String, BTreeMap<String, ReferenceLatency>>>);

impl ReferenceResults {
    /// Parse the reference results file.
    ///
    /// The file is `;`-delimited with a header row, may start with a UTF-8
    /// BOM, and writes numbers with `.` as thousands separator and `,` as
    /// decimal separator.
    ///
    /// # Errors
    /// Returns an error when a column is missing or a number is malformed.
    pub fn from_csv(text: &str) -> Result<Self, BenchmarkError> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let mut lines = text
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty());

        let Some((_, header)) = lines.next() else {
            return Ok(Self::default());
        };
        let header: Vec<&str> = header.split(';').map(str::trim).collect();
        let mut indexes = [0usize; REFERENCE_COLUMNS.len()];
        for (slot, column) in indexes.iter_mut().zip(REFERENCE_COLUMNS) {
            *slot = header
                .iter()
                .position(|name| *name == column)
                .ok_or_else(|| BenchmarkError::Reference {
                    line: 1,
                    reason: format!("missing column '{column}'"),
                })?;
        }

        let mut results = Self::default();
        for (index, line) in lines {
            let line_number = index + 1;
            let fields: Vec<&str> = line.split(';').map(str::trim).collect();
            let field = |i: usize| {
                fields.get(indexes[i]).copied().ok_or_else(|| BenchmarkError::Reference {
                    line: line_number,
                    reason: format!("missing value for '{}'", REFERENCE_COLUMNS[i]),
                })
            };
            let number = |i: usize| -> Result<f64, BenchmarkError> {
                let raw = field(i)?;
                parse_european_number(raw).ok_or_else(|| BenchmarkError::Reference {
                    line: line_number,
                    reason: format!("invalid number '{raw}' for '{}'", REFERENCE_COLUMNS[i]),
                })
            };

            let latency = ReferenceLatency {
                average: number(3)?,
                std: number(4)?,
            };
            results.insert(field(0)?, field(1)?, field(2)?, latency);
        }
        Ok(results)
    }

    /// Add or replace one reference value.
    pub fn insert(
        &mut self,
        mpi_variant: &str,
        test_name: &str,
        packet_size: &str,
        latency: ReferenceLatency,
    ) {
        self.0
            .entry(mpi_variant.to_string())
            .or_default()
            .entry(test_name.to_string())
            .or_default()
            .insert(packet_size.to_string(), latency);
    }

    /// Reference value of one packet size.
    #[must_use]
    pub fn get(
        &self,
        mpi_variant: &str,
        test_name: &str,
        packet_size: &str,
    ) -> Option<&ReferenceLatency> {
        self.0.get(mpi_variant)?.get(test_name)?.get(packet_size)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn parse_european_number(value: &str) -> Option<f64> {
    value.replace('.', "").replace(',', ".").parse().ok()
}

/// Dimension of a metric datum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Dimension {
    pub name: String,
    pub value: String,
}

impl Dimension {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// One metric datum in the CloudWatch `PutMetricData` shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetricDatum {
    pub metric_name: String,
    #[serde(default)]
    pub dimensions: Vec<Dimension>,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl MetricDatum {
    /// Value of a dimension.
    #[must_use]
    pub fn dimension(&self, name: &str) -> Option<&str> {
        self.dimensions
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.value.as_str())
    }
}

fn latency_line() -> &'static Regex {
    static LATENCY_LINE: OnceLock<Regex> = OnceLock::new();
    LATENCY_LINE.get_or_init(|| Regex::new(r"(\d+)\s+(\d+)\.").expect("latency pattern is valid"))
}

/// Extract one `Latency` datum per packet size from OSU benchmark output.
///
/// `dimensions` is copied into every datum, with `PacketSize` set from the
/// matched line.
#[must_use]
pub fn parse_latency_output(output: &str, dimensions: &[Dimension]) -> Vec<MetricDatum> {
    latency_line()
        .captures_iter(output)
        .filter_map(|captures| {
            let packet_size = captures.get(1)?.as_str();
            let latency: f64 = captures.get(2)?.as_str().parse().ok()?;

            let mut dims: Vec<Dimension> = dimensions
                .iter()
                .filter(|d| d.name != PACKET_SIZE)
                .cloned()
                .collect();
            dims.push(Dimension::new(PACKET_SIZE, packet_size));

            Some(MetricDatum {
                metric_name: LATENCY_METRIC.to_string(),
                dimensions: dims,
                value: latency,
                unit: Some("Microseconds".to_string()),
            })
        })
        .collect()
}

/// Compare latency metrics against the reference results.
///
/// The tolerated latency is `average + variability_factor * std`. Metrics
/// without a reference value are skipped with a warning. Returns, per
/// benchmark with more than [`ACCEPTED_NUMBER_OF_FAILURES`] packet sizes over
/// their threshold, the list of failure messages.
#[must_use]
pub fn check_thresholds(
    reference: &ReferenceResults,
    metrics: &[MetricDatum],
    variability_factor: f64,
) -> Vec<Vec<String>> {
    if reference.is_empty() {
        return Vec::new();
    }

    let mut failures_by_test: Vec<(String, Vec<String>)> = Vec::new();

    for metric in metrics.iter().filter(|m| m.metric_name == LATENCY_METRIC) {
        let (Some(mpi_variant), Some(test_name), Some(packet_size)) = (
            metric.dimension(MPI_VARIANT),
            metric.dimension(BENCHMARK_NAME),
            metric.dimension(PACKET_SIZE),
        ) else {
            warn!(dimensions = ?metric.dimensions, "Latency metric without benchmark dimensions");
            continue;
        };

        let Some(expected) = reference.get(mpi_variant, test_name, packet_size) else {
            warn!(
                "Reference result not found for mpi variant '{mpi_variant}' test '{test_name}' \
                 and packet size '{packet_size}'"
            );
            continue;
        };

        let threshold = expected.average + variability_factor * expected.std;
        let message = format!(
            "{mpi_variant} - {test_name} - packet size {packet_size}: tolerated: {threshold}, \
             current: {}",
            metric.value
        );

        if metric.value > threshold {
            error!("{message}");
            match failures_by_test.iter_mut().find(|(name, _)| name == test_name) {
                Some((_, messages)) => messages.push(message),
                None => failures_by_test.push((test_name.to_string(), vec![message])),
            }
        } else {
            info!("{message}");
        }
    }

    failures_by_test
        .into_iter()
        .filter(|(_, messages)| messages.len() > ACCEPTED_NUMBER_OF_FAILURES)
        .map(|(_, messages)| messages)
        .collect()
}
