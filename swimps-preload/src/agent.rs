//! Process-wide agent state and its lifecycle.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use log::debug;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use swimps_option::{Options, OPTIONS_ENVIRONMENT_VARIABLE};
use swimps_time::SignalTimer;
use swimps_trace_file::{RawSink, TraceFile};

use crate::sampler;

pub(crate) const SAMPLING_CLOCK: libc::clockid_t = libc::CLOCK_MONOTONIC;

/// Set while a sample is being taken. The handler test-and-sets it on entry
/// and drops the sample if it was already set; the destructor uses it to
/// wait out the last in-flight sample before closing the file.
pub(crate) static SAMPLE_IN_PROGRESS: AtomicBool = AtomicBool::new(false);

pub(crate) struct Agent {
    pub(crate) sink: RawSink,
    pub(crate) timer: SignalTimer,
}

// Initialised once by the constructor, read by the signal handler, never
// dropped. Reading it is an atomic load, which is fine in signal context.
static AGENT: OnceLock<Agent> = OnceLock::new();

pub(crate) fn get() -> Option<&'static Agent> {
    AGENT.get()
}

#[cfg(test)]
pub(crate) fn install_for_test(agent: Agent) -> &'static Agent {
    let _ = AGENT.set(agent);
    AGENT.get().unwrap()
}

/// Runs before the target's `main`.
///
/// Order matters here: the trace file and timer must exist and the handler
/// must be installed before the timer is armed, and nothing that allocates
/// may run after arming (a sample could arrive at any moment from then on).
pub(crate) fn initialise() {
    // If the options are absent, this library was preloaded without the
    // swimps controller; stay inert rather than sampling a stranger.
    let Ok(serialised_options) = std::env::var(OPTIONS_ENVIRONMENT_VARIABLE) else {
        return;
    };

    let options = match Options::parse(&serialised_options) {
        Ok(options) => options,
        Err(_) => std::process::abort(),
    };

    swimps_log::init(options.log_level);
    debug!("Preload constructor running.");

    if options.target_trace_file.is_empty() {
        fatal("No target trace file specified for the preload agent.");
    }

    let trace_file = match TraceFile::create(Path::new(&options.target_trace_file)) {
        Ok(trace_file) => trace_file,
        Err(error_code) => {
            fatal(&format!("Could not create trace file: {error_code}."));
        }
    };

    if let Err(error) = install_sigprof_handler() {
        fatal(&format!("Could not setup signal handler, errno {error}."));
    }

    let timer = match SignalTimer::create(SAMPLING_CLOCK, libc::SIGPROF) {
        Ok(timer) => timer,
        Err(error) => {
            fatal(&format!(
                "Could not create timer, errno {} ({error}).",
                error.raw_os_error().unwrap_or(0)
            ));
        }
    };

    let agent = Agent {
        sink: trace_file.into_raw_sink(),
        timer,
    };

    if AGENT.set(agent).is_err() {
        fatal("Preload agent initialised twice.");
    }

    let agent = AGENT.get().expect("the agent state was just initialised");

    // Everything from here onwards must be signal safe.

    if let Err(error) = agent.timer.arm(options.samples_per_second) {
        fatal(&format!(
            "Could not start timer, errno {} ({error}).",
            error.raw_os_error().unwrap_or(0)
        ));
    }

    debug!("Preload constructor finished.");
}

/// Runs after the target's `main`.
///
/// Disarming the timer before spinning on the flag establishes the
/// happens-before edge that lets the file descriptor be closed: once the
/// flag is observed clear, the last sample's write has returned. The flag
/// is left set so that a signal already in flight drops its sample instead
/// of writing to a closed descriptor.
pub(crate) fn teardown() {
    debug!("Preload destructor running.");

    let Some(agent) = AGENT.get() else {
        return;
    };

    let _ = agent.timer.disarm();

    while SAMPLE_IN_PROGRESS.swap(true, Ordering::Acquire) {
        std::hint::spin_loop();
    }

    agent.sink.close();

    debug!("Preload destructor finished.");
}

fn install_sigprof_handler() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::SigAction(sampler::sigprof_handler),
        SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
        SigSet::empty(),
    );

    unsafe { sigaction(Signal::SIGPROF, &action) }.map(drop)
}

fn fatal(message: &str) -> ! {
    log::error!("{message}");
    std::process::abort()
}
