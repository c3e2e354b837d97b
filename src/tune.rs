//! Autotuning infrastructure: the timing funnel, the tuning policy and the
//! bulk tuner.
//!
//! Each engine picks its parameters empirically. Candidate parameter sets
//! are timed through a caller-provided callback and winnowed across a
//! sequence of problem sizes (the funnel), so hopeless candidates are
//! eliminated cheaply on small inputs before the survivors are measured at
//! representative sizes.

use std::collections::HashSet;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use ocl::Device;

use crate::error::{Error, Result};
use crate::radix_sort::{RadixSort, RadixsortProblem};
use crate::reduce::{Reduce, ReduceProblem};
use crate::scan::{Scan, ScanProblem};
use crate::types::Type;
use crate::util;

/// Fraction of the best score a candidate must reach to survive a
/// non-final funnel phase.
pub(crate) const FUNNEL_RATIO: f64 = 0.5;

/// How much progress reporting tuning produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TuneVerbosity {
    /// No output at all.
    Silent,
    /// One line per tuned algorithm.
    Terse,
    /// A line per algorithm plus a progress character per timing test.
    Normal,
}

/// Controls whether and how loudly cache misses are repaired by tuning.
///
/// A policy travels with the problem descriptor; engines consult it when
/// construction misses the parameter cache. Disabling it turns every miss
/// into a hard [`Error::Cache`] instead of a (potentially slow) tuning run.
#[derive(Clone)]
pub struct TunePolicy {
    enabled: bool,
    verbosity: TuneVerbosity,
    output: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Default for TunePolicy {
    fn default() -> TunePolicy {
        TunePolicy {
            enabled: true,
            verbosity: TuneVerbosity::Normal,
            output: Arc::new(Mutex::new(Box::new(io::stdout()))),
        }
    }
}

impl std::fmt::Debug for TunePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("TunePolicy")
            .field("enabled", &self.enabled)
            .field("verbosity", &self.verbosity)
            .finish()
    }
}

impl TunePolicy {
    pub fn new() -> TunePolicy {
        TunePolicy::default()
    }

    /// Enables or disables transparent tuning on cache miss.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn set_verbosity(&mut self, verbosity: TuneVerbosity) {
        self.verbosity = verbosity;
    }

    /// Redirects progress reporting (stdout by default).
    pub fn set_output<W: Write + Send + 'static>(&mut self, output: W) {
        self.output = Arc::new(Mutex::new(Box::new(output)));
    }

    pub(crate) fn check_enabled(&self) -> Result<()> {
        if self.enabled {
            Ok(())
        } else {
            Err(Error::Cache(
                "no cached parameters found and tuning is disabled".into(),
            ))
        }
    }

    fn write(&self, text: &str) {
        if let Ok(mut out) = self.output.lock() {
            let _ = out.write_all(text.as_bytes());
            let _ = out.flush();
        }
    }

    pub(crate) fn log_start_algorithm(&self, description: &str) {
        if self.verbosity >= TuneVerbosity::Terse {
            self.write(&format!("Tuning {}\n", description));
        }
    }

    pub(crate) fn log_start_group(&self) {}

    pub(crate) fn log_start_test(&self) {}

    pub(crate) fn log_end_test(&self, success: bool) {
        if self.verbosity >= TuneVerbosity::Normal {
            self.write(if success { "." } else { "!" });
        }
    }

    pub(crate) fn log_end_group(&self) {
        if self.verbosity >= TuneVerbosity::Normal {
            self.write("\n");
        }
    }

    pub(crate) fn log_end_algorithm(&self) {}
}

/// Runs the funnel over `sets`, returning the winning parameter set.
///
/// `callback` times one candidate at one problem size and returns scores
/// `(a, b)` with `a <= b`. The winner is the *first* candidate whose `b`
/// reaches the maximum `a` of the final phase; returning `b` slightly above
/// `a` therefore biases the choice toward earlier (typically
/// smaller-footprint) candidates unless a later one is genuinely faster.
///
/// Candidates whose callback fails or reports NaN are dropped silently.
/// After every phase but the last, candidates scoring below
/// `ratio * max(a)` are eliminated.
pub(crate) fn tune_one<P, F>(
    policy: &TunePolicy,
    sets: &[P],
    problem_sizes: &[usize],
    mut callback: F,
    ratio: f64,
) -> Result<P>
where
    P: Clone,
    F: FnMut(usize, &P) -> Result<(f64, f64)>,
{
    let mut retained: Vec<P> = sets.to_vec();
    for (pass, &size) in problem_sizes.iter().enumerate() {
        policy.log_start_group();
        let mut survivors = Vec::with_capacity(retained.len());
        let mut results = Vec::with_capacity(retained.len());
        let mut max_a = f64::NEG_INFINITY;
        for params in &retained {
            policy.log_start_test();
            match callback(size, params) {
                Ok((a, b)) if !a.is_nan() => {
                    debug_assert!(a <= b);
                    survivors.push(params.clone());
                    results.push((a, b));
                    if a > max_a {
                        max_a = a;
                    }
                    policy.log_end_test(true);
                }
                Ok(_) => policy.log_end_test(false),
                Err(err) => {
                    log::debug!("tuning candidate failed: {}", err);
                    policy.log_end_test(false);
                }
            }
        }
        retained = survivors;
        if retained.is_empty() {
            return Err(Error::Tune("no suitable kernel found".into()));
        }
        policy.log_end_group();

        if pass + 1 < problem_sizes.len() {
            let keep: Vec<P> = retained
                .iter()
                .zip(results.iter())
                .filter(|(_, scores)| scores.0 >= ratio * max_a)
                .map(|(params, _)| params.clone())
                .collect();
            retained = keep;
        } else {
            for (params, &(_, b)) in retained.iter().zip(results.iter()) {
                if b >= max_a {
                    return Ok(params.clone());
                }
            }
        }
    }
    // Unreachable while a <= b holds for every candidate.
    Err(Error::Internal("tuning funnel did not select a winner".into()))
}

/// Bulk tuner: sweeps every supported problem shape for one or more
/// devices, as used by the `ocl-prims-tune` tool.
pub struct Tuner {
    force: bool,
    keep_going: bool,
    policy: TunePolicy,
    seen: HashSet<String>,
}

impl Default for Tuner {
    fn default() -> Tuner {
        Tuner::new()
    }
}

impl Tuner {
    pub fn new() -> Tuner {
        Tuner {
            force: true,
            keep_going: false,
            policy: TunePolicy::default(),
            seen: HashSet::new(),
        }
    }

    /// When disabled, combinations that already construct from cache are
    /// skipped.
    pub fn set_force(&mut self, force: bool) {
        self.force = force;
    }

    /// When enabled, a combination that fails to tune is logged and
    /// skipped instead of aborting the sweep.
    pub fn set_keep_going(&mut self, keep_going: bool) {
        self.keep_going = keep_going;
    }

    pub fn set_policy(&mut self, policy: TunePolicy) {
        self.policy = policy;
    }

    /// Marks a cache key as handled in this run; returns false if it was
    /// already handled (e.g. through type canonicalization).
    fn first_visit(&mut self, fingerprint: String) -> bool {
        self.seen.insert(fingerprint)
    }

    fn handle_outcome(&self, what: &str, result: Result<()>) -> Result<()> {
        match result {
            Err(Error::Tune(msg)) if self.keep_going => {
                log::warn!("tuning {} failed: {}", what, msg);
                eprintln!("WARNING: tuning {} failed: {}", what, msg);
                Ok(())
            }
            other => other,
        }
    }

    fn tune_scan(&mut self, device: &Device) -> Result<()> {
        for ty in Type::all_types() {
            if !Scan::type_supported(device, &ty)? {
                continue;
            }
            let mut problem = ScanProblem::new(ty)?;
            problem.set_tune_policy(self.policy.clone());
            if !self.first_visit(Scan::key_fingerprint(device, &problem)?) {
                continue;
            }
            if !self.force && Scan::is_cached(device, &problem)? {
                continue;
            }
            let result = Scan::tune_and_save(device, &problem);
            self.handle_outcome(&format!("scan for {} elements", ty), result)?;
        }
        Ok(())
    }

    fn tune_reduce(&mut self, device: &Device) -> Result<()> {
        for ty in Type::all_types() {
            if !Reduce::type_supported(device, &ty)? {
                continue;
            }
            let mut problem = ReduceProblem::new(ty)?;
            problem.set_tune_policy(self.policy.clone());
            if !self.first_visit(Reduce::key_fingerprint(device, &problem)?) {
                continue;
            }
            if !self.force && Reduce::is_cached(device, &problem)? {
                continue;
            }
            let result = Reduce::tune_and_save(device, &problem);
            self.handle_outcome(&format!("reduce for {} elements", ty), result)?;
        }
        Ok(())
    }

    fn tune_radix_sort(&mut self, device: &Device) -> Result<()> {
        let mut value_types = vec![Type::default()];
        value_types.extend(Type::all_types());
        for key_type in Type::all_types() {
            if !RadixSort::key_type_supported(device, &key_type)? {
                continue;
            }
            for value_type in &value_types {
                if !RadixSort::value_type_supported(device, value_type)? {
                    continue;
                }
                let mut problem = RadixsortProblem::new(key_type, *value_type)?;
                problem.set_tune_policy(self.policy.clone());
                if !self.first_visit(RadixSort::key_fingerprint(device, &problem)?) {
                    continue;
                }
                if !self.force && RadixSort::is_cached(device, &problem)? {
                    continue;
                }
                let result = RadixSort::tune_and_save(device, &problem);
                self.handle_outcome(
                    &format!(
                        "radixsort for {} keys and {} byte values",
                        key_type,
                        value_type.size()
                    ),
                    result,
                )?;
            }
        }
        Ok(())
    }

    /// Tunes every supported algorithm and type combination for `device`.
    pub fn tune_device(&mut self, device: &Device) -> Result<()> {
        self.tune_scan(device)?;
        self.tune_reduce(device)?;
        self.tune_radix_sort(device)
    }

    /// Tunes every device in `devices`.
    pub fn tune_all(&mut self, devices: &[Device]) -> Result<()> {
        for device in devices {
            self.tune_device(device)?;
        }
        Ok(())
    }
}

/// Elapsed seconds between the start and end profiling counters of `event`.
pub(crate) fn profiled_seconds(event: &ocl::Event) -> Result<f64> {
    use ocl::core::ProfilingInfo;
    let start = event.profiling_info(ProfilingInfo::Start)?.time()?;
    let end = event.profiling_info(ProfilingInfo::End)?.time()?;
    Ok((end.saturating_sub(start)) as f64 * 1e-9)
}

/// A profiling-enabled queue on a fresh, device-scoped context, as used for
/// every timing measurement.
pub(crate) fn profiling_queue(device: &Device) -> Result<(ocl::Context, ocl::Queue)> {
    let context = util::context_for_device(device)?;
    let queue = ocl::Queue::new(
        &context,
        *device,
        Some(ocl::CommandQueueProperties::new().profiling()),
    )?;
    Ok((context, queue))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn policy_with_buffer(verbosity: TuneVerbosity) -> (TunePolicy, Arc<Mutex<Vec<u8>>>) {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let mut policy = TunePolicy::new();
        policy.set_verbosity(verbosity);
        policy.set_output(SharedBuf(buf.clone()));
        (policy, buf)
    }

    fn score_callback(_size: usize, param: &f64) -> Result<(f64, f64)> {
        if *param < 0.0 {
            Err(Error::Internal("negative parameter".into()))
        } else {
            Ok((*param, *param))
        }
    }

    fn run_sample(policy: &TunePolicy) -> Result<f64> {
        policy.log_start_algorithm("test on Test Device");
        let winner = tune_one(policy, &[1.0, -1.0, 3.0], &[1, 2], score_callback, FUNNEL_RATIO);
        policy.log_end_algorithm();
        winner
    }

    fn output_of(buf: &Arc<Mutex<Vec<u8>>>) -> String {
        String::from_utf8(buf.lock().unwrap().clone()).unwrap()
    }

    #[test]
    fn picks_the_fastest() {
        let (policy, _buf) = policy_with_buffer(TuneVerbosity::Silent);
        assert_eq!(run_sample(&policy).unwrap(), 3.0);
    }

    #[test]
    fn verbosity_silent() {
        let (policy, buf) = policy_with_buffer(TuneVerbosity::Silent);
        run_sample(&policy).unwrap();
        assert_eq!(output_of(&buf), "");
    }

    #[test]
    fn verbosity_terse() {
        let (policy, buf) = policy_with_buffer(TuneVerbosity::Terse);
        run_sample(&policy).unwrap();
        assert_eq!(output_of(&buf), "Tuning test on Test Device\n");
    }

    #[test]
    fn verbosity_normal() {
        let (policy, buf) = policy_with_buffer(TuneVerbosity::Normal);
        run_sample(&policy).unwrap();
        // Three candidates in the first phase (one failing), then only the
        // survivor above half the best rate.
        assert_eq!(output_of(&buf), "Tuning test on Test Device\n.!.\n.\n");
    }

    #[test]
    fn disabled_policy_reports_cache_error() {
        let mut policy = TunePolicy::new();
        policy.set_enabled(false);
        match policy.check_enabled() {
            Err(Error::Cache(_)) => {}
            other => panic!("expected cache error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn all_failures_is_a_tune_error() {
        let (policy, _buf) = policy_with_buffer(TuneVerbosity::Silent);
        let result = tune_one(
            &policy,
            &[-1.0, -2.0],
            &[1],
            score_callback,
            FUNNEL_RATIO,
        );
        match result {
            Err(Error::Tune(_)) => {}
            other => panic!("expected tune error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn nan_scores_are_dropped() {
        let (policy, _buf) = policy_with_buffer(TuneVerbosity::Silent);
        let winner = tune_one(
            &policy,
            &[f64::NAN, 2.0],
            &[1],
            |_size, p: &f64| Ok((*p, *p)),
            FUNNEL_RATIO,
        )
        .unwrap();
        assert_eq!(winner, 2.0);
    }

    #[test]
    fn b_bias_prefers_earlier_candidates() {
        let (policy, _buf) = policy_with_buffer(TuneVerbosity::Silent);
        // Candidate 1 is 4% faster; with b = 1.05 * a the earlier candidate
        // still wins.
        let winner = tune_one(
            &policy,
            &[10.0, 10.4],
            &[1],
            |_size, p: &f64| Ok((*p, *p * 1.05)),
            FUNNEL_RATIO,
        )
        .unwrap();
        assert_eq!(winner, 10.0);

        // At 10% faster the later candidate takes over.
        let winner = tune_one(
            &policy,
            &[10.0, 11.0],
            &[1],
            |_size, p: &f64| Ok((*p, *p * 1.05)),
            FUNNEL_RATIO,
        )
        .unwrap();
        assert_eq!(winner, 11.0);
    }

    #[test]
    fn slow_candidates_funnel_out_early() {
        let (policy, _buf) = policy_with_buffer(TuneVerbosity::Silent);
        let mut second_phase_calls = Vec::new();
        tune_one(
            &policy,
            &[1.0, 10.0],
            &[1, 2],
            |size, p: &f64| {
                if size == 2 {
                    second_phase_calls.push(*p);
                }
                Ok((*p, *p))
            },
            FUNNEL_RATIO,
        )
        .unwrap();
        // 1.0 < 0.5 * 10.0, so only the fast candidate reaches phase two.
        assert_eq!(second_phase_calls, vec![10.0]);
    }
}
