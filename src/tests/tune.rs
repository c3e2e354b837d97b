use std::io;
use std::sync::{Arc, Mutex};

use crate::tests::{device_context, require_device};
use crate::tune::{TunePolicy, TuneVerbosity};
use crate::types::{BaseType, Type};
use crate::{Error, Scan, ScanProblem};

#[derive(Clone)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl io::Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn watched_policy() -> (TunePolicy, Arc<Mutex<Vec<u8>>>) {
    let buf = Arc::new(Mutex::new(Vec::new()));
    let mut policy = TunePolicy::new();
    policy.set_verbosity(TuneVerbosity::Normal);
    policy.set_output(SharedBuf(buf.clone()));
    (policy, buf)
}

#[test]
fn miss_tunes_then_hit_serves_from_cache() {
    let (_, device) = require_device!();
    let (context, _queue) = device_context(&device);

    // A type no other test constructs, so the first build here really is a
    // cache miss.
    let ty = Type::new(BaseType::Ulong, 1).unwrap();

    let (policy, output) = watched_policy();
    let mut problem = ScanProblem::new(ty).unwrap();
    problem.set_tune_policy(policy);
    Scan::new(&context, &device, &problem).expect("first construction tunes");
    let first_output = String::from_utf8(output.lock().unwrap().clone()).unwrap();
    assert!(
        first_output.contains("Tuning scan"),
        "expected tuning progress, got {:?}",
        first_output
    );

    // An identical engine immediately afterwards must come straight from
    // the cache, without a single timing run.
    let (policy, output) = watched_policy();
    let mut problem = ScanProblem::new(ty).unwrap();
    problem.set_tune_policy(policy);
    Scan::new(&context, &device, &problem).expect("second construction hits the cache");
    let second_output = String::from_utf8(output.lock().unwrap().clone()).unwrap();
    assert_eq!(second_output, "");
}

#[test]
fn disabled_tuning_turns_misses_into_cache_errors() {
    let (_, device) = require_device!();
    let (context, _queue) = device_context(&device);

    // Signed/unsigned canonicalization shares entries, so pick a vector
    // width nothing else touches.
    let ty = Type::new(BaseType::Uint, 8).unwrap();
    let mut policy = TunePolicy::new();
    policy.set_enabled(false);
    let mut problem = ScanProblem::new(ty).unwrap();
    problem.set_tune_policy(policy);
    match Scan::new(&context, &device, &problem) {
        Err(Error::Cache(_)) => {}
        Ok(_) => panic!("construction should not succeed with an empty cache"),
        Err(other) => panic!("expected Cache error, got {}", other),
    }
}
