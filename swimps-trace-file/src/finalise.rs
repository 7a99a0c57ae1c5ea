//! The post-sampling pass that turns a raw trace file into a canonical one.

use std::os::raw::c_void;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use log::{debug, error};
use rustc_hash::FxHashMap;

use swimps_error::ErrorCode;
use swimps_io::Permissions;
use swimps_trace::{Backtrace, BacktraceId, InstructionPointer, Sample, StackFrame, StackFrameId};

use crate::{Entry, TraceFile};

/// Rewrites the raw trace file at `path` in canonical form.
///
/// Raw instruction pointers are mapped to dense stack frame ids in
/// first-seen order, backtraces are deduplicated by their id sequence, and
/// samples keep their original order. The result is written to
/// `/tmp/<name>.tmp` and then replaces the original.
pub fn finalise(path: &Path) -> Result<(), ErrorCode> {
    let mut raw_file = TraceFile::open(path, Permissions::ReadOnly)?;

    let (raw_samples, raw_backtraces) = read_raw_entries(&mut raw_file)?;
    drop(raw_file);

    let mut next_stack_frame_id: StackFrameId = 1;
    let mut stack_frame_ids = FxHashMap::<InstructionPointer, StackFrameId>::default();
    let mut stack_frames = Vec::<StackFrame>::new();

    let mut next_backtrace_id: BacktraceId = 1;
    let mut backtrace_ids = FxHashMap::<Vec<StackFrameId>, BacktraceId>::default();
    let mut backtraces = Vec::<Backtrace>::new();

    let mut samples = Vec::<Sample>::with_capacity(raw_samples.len());

    for raw_sample in &raw_samples {
        let Some(instruction_pointers) = raw_backtraces.get(&raw_sample.backtrace_id) else {
            error!(
                "Sample references raw backtrace {} which is not in the file.",
                raw_sample.backtrace_id
            );
            return Err(ErrorCode::ReadBacktraceFailed);
        };

        let ids: Vec<StackFrameId> = instruction_pointers
            .iter()
            .map(|instruction_pointer| {
                *stack_frame_ids
                    .entry(*instruction_pointer)
                    .or_insert_with(|| {
                        let id = next_stack_frame_id;
                        next_stack_frame_id += 1;
                        stack_frames.push(StackFrame::new(id, *instruction_pointer));
                        id
                    })
            })
            .collect();

        let backtrace_id = match backtrace_ids.get(&ids) {
            Some(id) => *id,
            None => {
                let id = next_backtrace_id;
                next_backtrace_id += 1;
                backtrace_ids.insert(ids.clone(), id);
                backtraces.push(Backtrace {
                    id,
                    stack_frame_ids: ids,
                });
                id
            }
        };

        samples.push(Sample {
            backtrace_id,
            timestamp: raw_sample.timestamp,
        });
    }

    debug!(
        "Finalising: {} samples, {} backtraces, {} stack frames.",
        samples.len(),
        backtraces.len(),
        stack_frames.len()
    );

    for stack_frame in &mut stack_frames {
        symbolise(stack_frame);
    }

    write_replacement(path, &samples, &backtraces, &stack_frames)
}

/// Collects the samples and raw backtraces out of a raw file.
fn read_raw_entries(
    raw_file: &mut TraceFile,
) -> Result<(Vec<Sample>, FxHashMap<BacktraceId, Vec<InstructionPointer>>), ErrorCode> {
    raw_file.seek_to_start().map_err(|error| {
        error!("Could not seek to the start of the raw trace file: {error}.");
        ErrorCode::OpenFailed
    })?;

    let mut samples = Vec::new();
    let mut backtraces = FxHashMap::default();

    loop {
        match raw_file.read_next_entry() {
            Entry::Sample(sample) => samples.push(sample),
            Entry::Backtrace(backtrace) => {
                // The frame id slots of a raw backtrace hold instruction
                // pointers.
                let instruction_pointers = backtrace
                    .stack_frame_ids
                    .iter()
                    .map(|id| *id as InstructionPointer)
                    .collect();

                backtraces.insert(backtrace.id, instruction_pointers);
            }
            Entry::StackFrame(stack_frame) => {
                // Raw files do not contain stack frames; tolerate one so
                // that finalising an already-finalised file is harmless.
                debug!("Skipping stack frame {} in raw trace file.", stack_frame.id);
            }
            Entry::Error(ErrorCode::EndOfFile) => return Ok((samples, backtraces)),
            Entry::Error(error_code) => return Err(error_code),
        }
    }
}

/// Resolves an instruction pointer against the running process's own
/// mappings: function name, offset from the function start, and source
/// coordinates when the debug info has them.
fn symbolise(stack_frame: &mut StackFrame) {
    let address = stack_frame.instruction_pointer as usize as *mut c_void;
    let mut resolved = false;

    backtrace::resolve(address, |symbol| {
        // The callback can run once per inlined frame; keep the first.
        if resolved {
            return;
        }
        resolved = true;

        if let Some(name) = symbol.name() {
            stack_frame.set_function_name(name.as_bytes());
        }

        if let Some(symbol_start) = symbol.addr() {
            stack_frame.offset = stack_frame
                .instruction_pointer
                .saturating_sub(symbol_start as u64);
        }

        if let Some(line_number) = symbol.lineno() {
            stack_frame.line_number = i64::from(line_number);
        }

        if let Some(source_file) = symbol.filename() {
            stack_frame.set_source_file_path(source_file.as_os_str().as_bytes());
        }
    });
}

/// Writes the canonical entries to a side file in `/tmp`, then swaps it in
/// over the original.
fn write_replacement(
    path: &Path,
    samples: &[Sample],
    backtraces: &[Backtrace],
    stack_frames: &[StackFrame],
) -> Result<(), ErrorCode> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "trace".to_owned());

    let temporary_path = PathBuf::from("/tmp").join(format!("{file_name}.tmp"));

    // A crashed earlier run may have left one behind.
    let _ = std::fs::remove_file(&temporary_path);

    let mut temporary_file = TraceFile::create(&temporary_path)?;

    let write_result = (|| {
        for sample in samples {
            temporary_file.add_sample(sample)?;
        }

        for backtrace in backtraces {
            temporary_file.add_backtrace(backtrace)?;
        }

        for stack_frame in stack_frames {
            temporary_file.add_stack_frame(stack_frame)?;
        }

        Ok::<(), std::io::Error>(())
    })();

    if let Err(error) = write_result {
        error!(
            "Could not write finalised trace to {}: {error}.",
            temporary_path.display()
        );
        return Err(ErrorCode::OpenFailed);
    }

    drop(temporary_file);

    // /tmp is often a different filesystem, in which case rename cannot be
    // used and the replacement falls back to copying.
    if std::fs::rename(&temporary_path, path).is_err() {
        std::fs::copy(&temporary_path, path).map_err(|error| {
            error!(
                "Could not replace {} with the finalised trace: {error}.",
                path.display()
            );
            ErrorCode::OpenFailed
        })?;

        let _ = std::fs::remove_file(&temporary_path);
    }

    Ok(())
}
