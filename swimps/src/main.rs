mod cli;
mod profile;

use std::path::Path;

use log::{error, info, warn};

use swimps_error::ErrorCode;
use swimps_io::Permissions;
use swimps_trace::Trace;
use swimps_trace_file::TraceFile;

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let options = match cli::parse_command_line() {
        Ok(options) => options,
        Err(error_code) => return error_code.exit_code(),
    };

    swimps_log::init(options.log_level);

    let mut child_failure = None;

    if !options.load {
        match profile::start(&options) {
            Ok(outcome) => {
                child_failure = outcome.failure();
                if let Some(error_code) = child_failure {
                    warn!("{error_code}; the trace covers the run up to that point.");
                }
            }
            Err(error_code) => {
                error!("Profile failed with code: {}.", error_code.exit_code());
                return error_code.exit_code();
            }
        }

        if let Err(error_code) = swimps_trace_file::finalise(Path::new(&options.target_trace_file))
        {
            error!("Finalising the trace failed with code: {}.", error_code.exit_code());
            return error_code.exit_code();
        }
    }

    let trace = {
        let trace_file_path = Path::new(&options.target_trace_file);
        let mut trace_file = match TraceFile::open(trace_file_path, Permissions::ReadOnly) {
            Ok(trace_file) => trace_file,
            Err(error_code) => return error_code.exit_code(),
        };

        match trace_file.read_trace() {
            Ok(trace) => trace,
            Err(error_code) => return error_code.exit_code(),
        }
    };

    info!(
        "Trace loaded: {} samples, {} backtraces, {} stack frames.",
        trace.samples.len(),
        trace.backtraces.len(),
        trace.stack_frames.len()
    );

    if options.tui {
        // The interactive trace browser consumes the trace here; until it
        // lands, show where the time went in plain text.
        print_summary(&trace);
    }

    child_failure
        .map(ErrorCode::exit_code)
        .unwrap_or(ErrorCode::None.exit_code())
}

/// Prints the hottest stack frames, most sampled first.
fn print_summary(trace: &Trace) {
    let mut sample_counts: Vec<(i64, usize)> = Vec::new();

    for sample in &trace.samples {
        let Some(backtrace) = trace
            .backtraces
            .iter()
            .find(|backtrace| backtrace.id == sample.backtrace_id)
        else {
            continue;
        };

        // The innermost frame is where the time was actually spent.
        let Some(stack_frame_id) = backtrace.stack_frame_ids.first() else {
            continue;
        };

        match sample_counts
            .iter_mut()
            .find(|(id, _)| id == stack_frame_id)
        {
            Some((_, count)) => *count += 1,
            None => sample_counts.push((*stack_frame_id, 1)),
        }
    }

    sample_counts.sort_by(|left, right| right.1.cmp(&left.1));

    println!("{:>8}  function", "samples");
    for (stack_frame_id, count) in sample_counts {
        let name = trace
            .stack_frames
            .iter()
            .find(|stack_frame| stack_frame.id == stack_frame_id)
            .map(|stack_frame| String::from_utf8_lossy(stack_frame.function_name()).into_owned())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "???".to_owned());

        println!("{count:>8}  {name}");
    }
}
