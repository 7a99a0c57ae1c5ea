//! Scalar and entry codecs over a raw file descriptor.
//!
//! These are free functions rather than methods so that the surface callable
//! from signal context stays small and auditable: every write here bottoms
//! out in [`swimps_io::write_to_file_descriptor`] and nothing else. Integers
//! are native-endian fixed width; strings are length-prefixed, not
//! nul-terminated.

use std::io;
use std::os::fd::RawFd;

use swimps_io::{write_to_file_descriptor, File};
use swimps_time::TimeSpecification;
use swimps_trace::{
    Backtrace, RawBacktrace, Sample, StackFrame, StackFrameCount, MAX_FUNCTION_NAME_LENGTH,
    MAX_SOURCE_FILE_PATH_LENGTH, MAX_STACK_FRAMES,
};

use crate::{BACKTRACE_MARKER, SAMPLE_MARKER, STACK_FRAME_MARKER};

pub(crate) fn write_i32(file_descriptor: RawFd, value: i32) -> io::Result<usize> {
    write_to_file_descriptor(file_descriptor, &value.to_ne_bytes())
}

pub(crate) fn write_i64(file_descriptor: RawFd, value: i64) -> io::Result<usize> {
    write_to_file_descriptor(file_descriptor, &value.to_ne_bytes())
}

pub(crate) fn write_u32(file_descriptor: RawFd, value: u32) -> io::Result<usize> {
    write_to_file_descriptor(file_descriptor, &value.to_ne_bytes())
}

pub(crate) fn write_u64(file_descriptor: RawFd, value: u64) -> io::Result<usize> {
    write_to_file_descriptor(file_descriptor, &value.to_ne_bytes())
}

/// Appends a sample entry. Async-signal-safe.
pub(crate) fn write_sample_entry(file_descriptor: RawFd, sample: &Sample) -> io::Result<usize> {
    let mut bytes_written = write_to_file_descriptor(file_descriptor, SAMPLE_MARKER)?;
    bytes_written += write_i64(file_descriptor, sample.backtrace_id)?;
    bytes_written += write_i64(file_descriptor, sample.timestamp.seconds)?;
    bytes_written += write_i64(file_descriptor, sample.timestamp.nanoseconds)?;
    Ok(bytes_written)
}

/// Appends a backtrace entry whose frame id slots carry raw instruction
/// pointers. Async-signal-safe: iterates a fixed-capacity array, no
/// allocation.
pub(crate) fn write_raw_backtrace_entry(
    file_descriptor: RawFd,
    id: i64,
    backtrace: &RawBacktrace,
) -> io::Result<usize> {
    let count = (backtrace.count.max(0) as usize).min(MAX_STACK_FRAMES);

    let mut bytes_written = write_to_file_descriptor(file_descriptor, BACKTRACE_MARKER)?;
    bytes_written += write_i64(file_descriptor, id)?;
    bytes_written += write_i32(file_descriptor, count as StackFrameCount)?;

    for instruction_pointer in &backtrace.instruction_pointers[..count] {
        bytes_written += write_i64(file_descriptor, *instruction_pointer as i64)?;
    }

    Ok(bytes_written)
}

/// Appends a finalised backtrace entry. Only the finaliser calls this, so it
/// is free to take the growable form.
pub(crate) fn write_backtrace_entry(
    file_descriptor: RawFd,
    backtrace: &Backtrace,
) -> io::Result<usize> {
    assert!(!backtrace.stack_frame_ids.is_empty());

    let mut bytes_written = write_to_file_descriptor(file_descriptor, BACKTRACE_MARKER)?;
    bytes_written += write_i64(file_descriptor, backtrace.id)?;
    bytes_written += write_i32(
        file_descriptor,
        backtrace.stack_frame_ids.len() as StackFrameCount,
    )?;

    for stack_frame_id in &backtrace.stack_frame_ids {
        bytes_written += write_i64(file_descriptor, *stack_frame_id)?;
    }

    Ok(bytes_written)
}

/// Appends a stack frame entry. Only the finaliser calls this.
pub(crate) fn write_stack_frame_entry(
    file_descriptor: RawFd,
    stack_frame: &StackFrame,
) -> io::Result<usize> {
    let function_name = stack_frame.function_name();
    let source_file_path = stack_frame.source_file_path();

    let mut bytes_written = write_to_file_descriptor(file_descriptor, STACK_FRAME_MARKER)?;
    bytes_written += write_i64(file_descriptor, stack_frame.id)?;
    bytes_written += write_i32(file_descriptor, function_name.len() as i32)?;
    bytes_written += write_to_file_descriptor(file_descriptor, function_name)?;
    bytes_written += write_u64(file_descriptor, stack_frame.offset)?;
    bytes_written += write_u64(file_descriptor, stack_frame.instruction_pointer)?;
    bytes_written += write_i64(file_descriptor, stack_frame.line_number)?;
    bytes_written += write_u32(file_descriptor, source_file_path.len() as u32)?;
    bytes_written += write_to_file_descriptor(file_descriptor, source_file_path)?;
    Ok(bytes_written)
}

pub(crate) fn read_i32(file: &mut File) -> Option<i32> {
    let mut buffer = [0u8; 4];
    match file.read(&mut buffer) {
        Ok(4) => Some(i32::from_ne_bytes(buffer)),
        _ => None,
    }
}

pub(crate) fn read_i64(file: &mut File) -> Option<i64> {
    let mut buffer = [0u8; 8];
    match file.read(&mut buffer) {
        Ok(8) => Some(i64::from_ne_bytes(buffer)),
        _ => None,
    }
}

pub(crate) fn read_u32(file: &mut File) -> Option<u32> {
    let mut buffer = [0u8; 4];
    match file.read(&mut buffer) {
        Ok(4) => Some(u32::from_ne_bytes(buffer)),
        _ => None,
    }
}

pub(crate) fn read_u64(file: &mut File) -> Option<u64> {
    let mut buffer = [0u8; 8];
    match file.read(&mut buffer) {
        Ok(8) => Some(u64::from_ne_bytes(buffer)),
        _ => None,
    }
}

pub(crate) fn read_sample(file: &mut File) -> Option<Sample> {
    let backtrace_id = read_i64(file)?;
    let seconds = read_i64(file)?;
    let nanoseconds = read_i64(file)?;

    Some(Sample {
        backtrace_id,
        timestamp: TimeSpecification {
            seconds,
            nanoseconds,
        },
    })
}

pub(crate) fn read_backtrace(file: &mut File) -> Option<Backtrace> {
    let id = read_i64(file)?;
    let count = read_i32(file)?;

    // A backtrace always has at least one frame, and captures are bounded;
    // anything else means the file is corrupt.
    if count < 1 || count as usize > MAX_STACK_FRAMES {
        return None;
    }

    let mut stack_frame_ids = Vec::with_capacity(count as usize);
    for _ in 0..count {
        stack_frame_ids.push(read_i64(file)?);
    }

    Some(Backtrace {
        id,
        stack_frame_ids,
    })
}

pub(crate) fn read_stack_frame(file: &mut File) -> Option<StackFrame> {
    let id = read_i64(file)?;

    let function_name_length = read_i32(file)?;
    if function_name_length < 0 || function_name_length as usize > MAX_FUNCTION_NAME_LENGTH {
        return None;
    }

    let mut function_name = [0u8; MAX_FUNCTION_NAME_LENGTH];
    let function_name = &mut function_name[..function_name_length as usize];
    if file.read(function_name).ok()? != function_name.len() {
        return None;
    }

    let offset = read_u64(file)?;
    let instruction_pointer = read_u64(file)?;
    let line_number = read_i64(file)?;

    let source_file_path_length = read_u32(file)?;
    if source_file_path_length as usize > MAX_SOURCE_FILE_PATH_LENGTH {
        return None;
    }

    let mut source_file_path = [0u8; MAX_SOURCE_FILE_PATH_LENGTH];
    let source_file_path = &mut source_file_path[..source_file_path_length as usize];
    if file.read(source_file_path).ok()? != source_file_path.len() {
        return None;
    }

    let mut stack_frame = StackFrame::new(id, instruction_pointer);
    stack_frame.offset = offset;
    stack_frame.line_number = line_number;
    stack_frame.set_function_name(function_name);
    stack_frame.set_source_file_path(source_file_path);

    Some(stack_frame)
}
