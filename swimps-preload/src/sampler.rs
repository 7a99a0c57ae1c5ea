//! The timer-driven signal handler that takes samples.
//!
//! Everything on this path runs in signal context and must be
//! async-signal-safe: no allocation, no locks, no library calls beyond raw
//! syscalls, atomics, and the unwinder's local-only walk.

use std::os::raw::{c_int, c_void};
use std::sync::atomic::Ordering;

use swimps_trace::{RawBacktrace, MAX_STACK_FRAMES};

use crate::agent::{self, SAMPLE_IN_PROGRESS, SAMPLING_CLOCK};

/// The SIGPROF handler.
///
/// A signal arriving while a sample is in progress finds the flag set and
/// returns immediately: overlapping samples are dropped, not queued.
pub(crate) extern "C" fn sigprof_handler(
    _signal_number: c_int,
    _signal_info: *mut libc::siginfo_t,
    _context: *mut c_void,
) {
    if SAMPLE_IN_PROGRESS.swap(true, Ordering::Acquire) {
        // Drop samples that occur when a sample is already being taken.
        return;
    }

    take_sample();

    SAMPLE_IN_PROGRESS.store(false, Ordering::Release);
}

fn take_sample() {
    let Some(agent) = agent::get() else {
        return;
    };

    // The syscalls below may clobber errno, and the interrupted code could
    // be mid-way through inspecting it.
    let saved_errno = unsafe { *libc::__errno_location() };

    // Errors in here are not reportable from signal context; the sample is
    // simply dropped.
    if let Ok(timestamp) = swimps_time::now(SAMPLING_CLOCK) {
        let backtrace = capture_backtrace();
        if !backtrace.is_empty() {
            let _ = agent.sink.add_raw_sample(timestamp, &backtrace);
        }
    }

    unsafe { *libc::__errno_location() = saved_errno };
}

/// Walks the interrupted stack, recording up to 64 instruction pointers.
///
/// The unwinder self-captures from here, so the innermost few frames are
/// the agent's own; they resolve and dedup like any others and cost one
/// level of noise at the leaf of the call tree.
fn capture_backtrace() -> RawBacktrace {
    let mut backtrace = RawBacktrace::new();

    unsafe {
        backtrace::trace_unsynchronized(|frame| {
            let index = backtrace.count as usize;
            if index >= MAX_STACK_FRAMES {
                return false;
            }

            backtrace.instruction_pointers[index] = frame.ip() as u64;
            backtrace.count += 1;
            true
        });
    }

    backtrace
}

#[cfg(test)]
mod test {
    use super::*;

    use std::path::Path;
    use std::ptr;

    use swimps_time::SignalTimer;
    use swimps_trace_file::TraceFile;

    fn file_size(path: &Path) -> u64 {
        std::fs::metadata(path).unwrap().len()
    }

    #[test]
    fn samples_are_dropped_while_the_flag_is_held() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("re-entry-guard");

        let trace_file = TraceFile::create(&path).unwrap();
        let timer = SignalTimer::create(libc::CLOCK_MONOTONIC, libc::SIGPROF).unwrap();
        agent::install_for_test(agent::Agent {
            sink: trace_file.into_raw_sink(),
            timer,
        });

        let size_after_creation = file_size(&path);

        // Simulate a sample already being in progress: the handler must
        // return without appending anything.
        assert!(!SAMPLE_IN_PROGRESS.swap(true, Ordering::Acquire));
        sigprof_handler(libc::SIGPROF, ptr::null_mut(), ptr::null_mut());
        assert_eq!(file_size(&path), size_after_creation);

        // And it must not have cleared the flag on the way out.
        assert!(SAMPLE_IN_PROGRESS.load(Ordering::Acquire));

        // With the flag released, the handler takes a sample.
        SAMPLE_IN_PROGRESS.store(false, Ordering::Release);
        sigprof_handler(libc::SIGPROF, ptr::null_mut(), ptr::null_mut());
        assert!(file_size(&path) > size_after_creation);
        assert!(!SAMPLE_IN_PROGRESS.load(Ordering::Acquire));
    }
}
