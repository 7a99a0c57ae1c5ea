//! The forked child: sets up the preload environment and execs the target.

use std::ffi::{CString, OsString};
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;

use log::{debug, error, info};

use swimps_error::ErrorCode;
use swimps_option::{Options, OPTIONS_ENVIRONMENT_VARIABLE};

const LD_PRELOAD: &str = "LD_PRELOAD";
const PRELOAD_LIBRARY_FILE_NAME: &str = "libswimps_preload.so";

/// Prepares the environment and replaces this process with the target.
///
/// Only returns if something failed; the caller turns the returned code
/// into the child's exit status.
pub(super) fn run(options: &Options) -> ErrorCode {
    if options.target_program.is_empty() {
        error!("No program specified.");
        return ErrorCode::InvalidParameter;
    }

    // Enable tracing of the program we're about to exec into.
    if options.ptrace {
        debug!("Running ptrace(PTRACE_TRACEME).");

        if let Err(errno) = nix::sys::ptrace::traceme() {
            error!("ptrace(PTRACE_TRACEME) failed, errno {} ({errno}).", errno as i32);
            return ErrorCode::PtraceFailed;
        }
    }

    let environment = match build_environment(options) {
        Ok(environment) => environment,
        Err(error_code) => return error_code,
    };

    info!(
        "Executing program: {} {}",
        options.target_program,
        options.target_program_args.join(" ")
    );

    let argv: Vec<CString> = std::iter::once(&options.target_program)
        .chain(options.target_program_args.iter())
        .filter_map(|argument| CString::new(argument.as_bytes()).ok())
        .collect();

    if argv.len() != options.target_program_args.len() + 1 {
        error!("Target program arguments must not contain nul bytes.");
        return ErrorCode::InvalidParameter;
    }

    // We only get past this call if the exec failed.
    if let Err(errno) = nix::unistd::execvpe(&argv[0], &argv, &environment) {
        error!(
            "Failed to execute target program, errno {} ({errno}).",
            errno as i32
        );
    }

    ErrorCode::ExecveFailed
}

/// The target's environment: everything we inherited, plus the serialised
/// options, plus an `LD_PRELOAD` with the agent prepended onto whatever was
/// already there.
fn build_environment(options: &Options) -> Result<Vec<CString>, ErrorCode> {
    let agent_path = match preload_library_path() {
        Ok(agent_path) => agent_path,
        Err(error) => {
            error!(
                "readlink of /proc/self/exe failed, errno {} ({error}).",
                error.raw_os_error().unwrap_or(0)
            );
            return Err(ErrorCode::ReadlinkFailed);
        }
    };

    let mut ld_preload_value = agent_path.into_os_string();
    let mut environment = Vec::new();

    for (name, value) in std::env::vars_os() {
        if name == LD_PRELOAD {
            // Prepending keeps the agent first in the search order while
            // preserving whatever the user had set up.
            ld_preload_value.push(":");
            ld_preload_value.push(&value);
            continue;
        }

        if name == OPTIONS_ENVIRONMENT_VARIABLE {
            continue;
        }

        let mut entry = name;
        entry.push("=");
        entry.push(&value);

        if let Ok(entry) = CString::new(entry.into_vec()) {
            environment.push(entry);
        }
    }

    let mut ld_preload_entry = OsString::from(format!("{LD_PRELOAD}="));
    ld_preload_entry.push(&ld_preload_value);
    environment.push(
        CString::new(ld_preload_entry.into_vec()).map_err(|_| ErrorCode::InvalidParameter)?,
    );

    let options_entry = format!(
        "{}={}",
        OPTIONS_ENVIRONMENT_VARIABLE,
        options.serialise()
    );
    environment.push(CString::new(options_entry).map_err(|_| ErrorCode::InvalidParameter)?);

    for entry in &environment {
        debug!("{}", entry.to_string_lossy());
    }

    Ok(environment)
}

/// The agent shared object lives next to the swimps binary.
fn preload_library_path() -> std::io::Result<PathBuf> {
    let mut path = std::fs::read_link("/proc/self/exe")?;
    path.pop();
    path.push(PRELOAD_LIBRARY_FILE_NAME);
    Ok(path)
}
