//! Launching the target and supervising it while the agent samples it.

use log::error;
use nix::unistd::ForkResult;

use swimps_error::ErrorCode;
use swimps_option::Options;

mod child;
mod parent;

pub use parent::ChildOutcome;

/// Forks and runs the target program under the sampling agent, blocking
/// until it finishes.
///
/// On success the trace file named in `options` contains the raw samples
/// and the returned outcome says how the child ended.
pub fn start(options: &Options) -> Result<ChildOutcome, ErrorCode> {
    match unsafe { nix::unistd::fork() } {
        Err(errno) => {
            error!("fork failed, errno {} ({errno}).", errno as i32);
            Err(ErrorCode::ForkFailed)
        }
        Ok(ForkResult::Child) => {
            // Only returns if the exec could not happen.
            let error_code = child::run(options);
            std::process::exit(error_code.exit_code());
        }
        Ok(ForkResult::Parent { child }) => parent::wait_for(child),
    }
}
