//! Command line parsing for the swimps binary.
//!
//! The clap surface here is user-facing; the result is folded into an
//! [`Options`], which is what the rest of swimps (and the preload agent, via
//! the environment) works with.

use clap::error::ErrorKind;
use clap::Parser;

use swimps_error::ErrorCode;
use swimps_log::LogLevel;
use swimps_option::Options;
use swimps_trace_file::generate_trace_file_name;

#[derive(Debug, Parser)]
#[command(
    name = "swimps",
    version,
    about = "swimps: an open-source performance analysis tool.",
    after_help = "EXAMPLES:\n    \
        swimps ./yourprogram its-args\n    \
        swimps --samples-per-second 100 --no-tui ./yourprogram\n    \
        swimps --load --target-trace-file swimps_trace_yourprogram_1_2"
)]
struct CommandLine {
    /// Load the target trace file rather than creating a new one.
    #[arg(long)]
    load: bool,

    /// Show the terminal UI after profiling.
    #[arg(long, overrides_with = "no_tui")]
    tui: bool,

    /// Do not show the terminal UI after profiling.
    #[arg(long, overrides_with = "tui")]
    no_tui: bool,

    /// Run the target under ptrace.
    #[arg(long, overrides_with = "no_ptrace")]
    ptrace: bool,

    /// Do not run the target under ptrace.
    #[arg(long, overrides_with = "ptrace")]
    no_ptrace: bool,

    /// Where to write (or, with --load, read) the trace.
    #[arg(long)]
    target_trace_file: Option<String>,

    /// How many samples to take per second.
    #[arg(long, default_value_t = 1.0)]
    samples_per_second: f64,

    /// The minimum severity required to show a log message.
    #[arg(long, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// The program to profile, followed by its arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

/// Parses the process's command line into an [`Options`].
///
/// Help and version requests print and exit successfully from here; any
/// parse problem reports `CommandLineParseFailed`.
pub fn parse_command_line() -> Result<Options, ErrorCode> {
    let command_line = match CommandLine::try_parse() {
        Ok(command_line) => command_line,
        Err(error) => {
            let _ = error.print();

            return match error.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => std::process::exit(0),
                _ => Err(ErrorCode::CommandLineParseFailed),
            };
        }
    };

    options_from(command_line)
}

fn options_from(command_line: CommandLine) -> Result<Options, ErrorCode> {
    let mut options = Options {
        tui: !command_line.no_tui,
        ptrace: !command_line.no_ptrace,
        load: command_line.load,
        log_level: command_line.log_level,
        samples_per_second: command_line.samples_per_second,
        target_trace_file: command_line.target_trace_file.unwrap_or_default(),
        ..Options::default()
    };

    let mut command = command_line.command.into_iter();
    options.target_program = command.next().unwrap_or_default();
    options.target_program_args = command.collect();

    if options.load {
        if options.target_trace_file.is_empty() {
            eprintln!("--load requires --target-trace-file.");
            return Err(ErrorCode::CommandLineParseFailed);
        }

        return Ok(options);
    }

    if options.target_program.is_empty() {
        eprintln!("No target program specified.");
        return Err(ErrorCode::CommandLineParseFailed);
    }

    if !options.samples_per_second.is_finite() || options.samples_per_second <= 0.0 {
        eprintln!("--samples-per-second must be a positive number.");
        return Err(ErrorCode::CommandLineParseFailed);
    }

    if options.target_trace_file.is_empty() {
        options.target_trace_file = default_trace_file_name(&options.target_program)
            .ok_or(ErrorCode::CommandLineParseFailed)?;
    }

    Ok(options)
}

fn default_trace_file_name(target_program: &str) -> Option<String> {
    let program_base_name = std::path::Path::new(target_program)
        .file_name()?
        .to_string_lossy()
        .into_owned();

    let time = swimps_time::now(libc::CLOCK_MONOTONIC).ok()?;

    Some(generate_trace_file_name(&program_base_name, &time))
}
