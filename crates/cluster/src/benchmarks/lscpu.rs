//! `lscpu` output checks for hyperthreading settings.

use crate::error::BenchmarkError;

const THREADS_PER_CORE: &str = "Thread(s) per core";
const ONLINE_CPU_LIST: &str = "On-line CPU(s) list";

/// Fields of `lscpu` output relevant to hyperthreading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LscpuSummary {
    pub threads_per_core: u32,
    /// Number of CPUs in the on-line list.
    pub online_cpus: u32,
}

impl LscpuSummary {
    /// Parse `lscpu` output.
    ///
    /// # Errors
    /// Returns an error if either field is missing or malformed.
    pub fn parse(output: &str) -> Result<Self, BenchmarkError> {
        let threads = field(output, THREADS_PER_CORE)?;
        let threads_per_core = threads.parse().map_err(|_| BenchmarkError::InvalidField {
            field: THREADS_PER_CORE,
            value: threads.to_string(),
        })?;

        let online_cpus = count_cpu_list(field(output, ONLINE_CPU_LIST)?)?;

        Ok(Self {
            threads_per_core,
            online_cpus,
        })
    }

    /// Describe every difference with the expected layout of an instance.
    #[must_use]
    pub fn mismatches(
        &self,
        slots: u32,
        default_threads_per_core: u32,
        hyperthreading_disabled: bool,
    ) -> Vec<String> {
        let mut mismatches = Vec::new();

        let threads = expected_threads_per_core(default_threads_per_core, hyperthreading_disabled);
        if self.threads_per_core != threads {
            mismatches.push(format!(
                "expected {threads} thread(s) per core, found {}",
                self.threads_per_core
            ));
        }

        let cpus = expected_cpus(slots, default_threads_per_core, hyperthreading_disabled);
        if self.online_cpus != cpus {
            mismatches.push(format!(
                "expected {cpus} on-line CPU(s), found {}",
                self.online_cpus
            ));
        }
        mismatches
    }
}

/// CPUs an instance exposes with the given hyperthreading setting.
#[must_use]
pub fn expected_cpus(slots: u32, threads_per_core: u32, hyperthreading_disabled: bool) -> u32 {
    if hyperthreading_disabled {
        slots.checked_div(threads_per_core).unwrap_or(slots)
    } else {
        slots
    }
}

/// Threads per core with the given hyperthreading setting.
#[must_use]
pub fn expected_threads_per_core(default_threads_per_core: u32, hyperthreading_disabled: bool) -> u32 {
    if hyperthreading_disabled {
        1
    } else {
        default_threads_per_core
    }
}

fn field<'a>(output: &'a str, name: &'static str) -> Result<&'a str, BenchmarkError> {
    output
        .lines()
        .find_map(|line| {
            let (key, value) = line.split_once(':')?;
            (key.trim() == name).then(|| value.trim())
        })
        .ok_or(BenchmarkError::MissingField(name))
}

/// Count the CPUs of a list such as `0,2-5`.
fn count_cpu_list(list: &str) -> Result<u32, BenchmarkError> {
    let invalid = || BenchmarkError::InvalidField {
        field: ONLINE_CPU_LIST,
        value: list.to_string(),
    };
    let number = |s: &str| s.trim().parse::<u32>().map_err(|_| invalid());

    list.split(',')
        .filter(|interval| !interval.trim().is_empty())
        .map(|interval| match interval.split_once('-') {
            Some((start, end)) => Ok(number(end)?.abs_diff(number(start)?) + 1),
            None => number(interval).map(|_| 1),
        })
        .sum()
}
