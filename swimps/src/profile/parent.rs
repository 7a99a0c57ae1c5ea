//! The parent's wait loop: supervises the traced child until it ends.

use log::{debug, error};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use swimps_error::ErrorCode;

/// How the profiled child ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildOutcome {
    Exited(i32),
    Signalled(Signal),
}

impl ChildOutcome {
    /// The error the controller should eventually exit with, if any.
    ///
    /// A failing child does not stop the trace from being finalised and
    /// read; it only colours the final exit code.
    pub fn failure(self) -> Option<ErrorCode> {
        match self {
            ChildOutcome::Exited(0) => None,
            ChildOutcome::Exited(_) => Some(ErrorCode::ChildProcessHasNonZeroExitCode),
            ChildOutcome::Signalled(_) => Some(ErrorCode::ChildProcessExitedDueToSignal),
        }
    }
}

/// Blocks until the child exits or is killed.
///
/// Stops are ptrace's business: the SIGTRAP raised around exec is
/// swallowed, anything else is forwarded with `PTRACE_CONT` so the child's
/// own signal semantics are preserved.
pub(super) fn wait_for(child: Pid) -> Result<ChildOutcome, ErrorCode> {
    loop {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, exit_code)) => {
                debug!("Child process exited with code {exit_code}.");
                return Ok(ChildOutcome::Exited(exit_code));
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                debug!("Child process exited due to signal {signal}.");
                return Ok(ChildOutcome::Signalled(signal));
            }
            Ok(WaitStatus::Stopped(pid, signal)) => {
                debug!("Child process stopped due to signal {signal}.");

                let signal_to_forward = match signal {
                    // A ptrace artifact, not something the child expects.
                    Signal::SIGTRAP => None,
                    other => Some(other),
                };

                if let Err(errno) = nix::sys::ptrace::cont(pid, signal_to_forward) {
                    error!("ptrace(PTRACE_CONT) failed, errno {} ({errno}).", errno as i32);
                    return Err(ErrorCode::PtraceFailed);
                }
            }
            // Other stop reasons (ptrace events) just mean the child is
            // still going.
            Ok(_) => {}
            Err(Errno::EINTR) => {}
            Err(errno) => {
                error!("waitpid failed, errno {} ({errno}).", errno as i32);
                return Err(ErrorCode::PtraceFailed);
            }
        }
    }
}
