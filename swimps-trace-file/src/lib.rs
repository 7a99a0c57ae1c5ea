//! Reading and writing swimps trace files.
//!
//! A trace file starts with a 6-byte magic marker and is then a
//! concatenation of entries, each introduced by its own 6-byte marker. The
//! same layout serves two lives: the sampling agent appends raw entries to
//! it from signal context through [`RawSink`], and after the target exits
//! the [`finalise`] pass rewrites it with deduplicated, symbolised entries
//! which [`TraceFile::read_trace`] then loads.

use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;

use log::{debug, error};

use swimps_error::ErrorCode;
use swimps_io::{File, Permissions};
use swimps_time::TimeSpecification;
use swimps_trace::{Backtrace, Sample, StackFrame, Trace};

mod codec;
mod finalise;
mod raw;

pub use finalise::finalise;
pub use raw::RawSink;

pub(crate) const TRACE_ENTRY_MARKER_SIZE: usize = 6;
pub(crate) const TRACE_FILE_MARKER: &[u8; TRACE_ENTRY_MARKER_SIZE] = b"s_v1\n\0";
pub(crate) const SAMPLE_MARKER: &[u8; TRACE_ENTRY_MARKER_SIZE] = b"\nsp!\n\0";
pub(crate) const BACKTRACE_MARKER: &[u8; TRACE_ENTRY_MARKER_SIZE] = b"\nsb!\n\0";
pub(crate) const STACK_FRAME_MARKER: &[u8; TRACE_ENTRY_MARKER_SIZE] = b"\nsf!\n\0";

/// One parsed entry, or the reason parsing stopped.
///
/// `Error(ErrorCode::EndOfFile)` is the normal way a well-formed file ends
/// and is not a failure.
#[derive(Debug)]
pub enum Entry {
    Sample(Sample),
    Backtrace(Backtrace),
    StackFrame(StackFrame),
    Error(ErrorCode),
}

enum EntryKind {
    Unknown,
    EndOfFile,
    FileMarker,
    Sample,
    Backtrace,
    StackFrame,
}

/// A trace file opened outside signal context.
///
/// This is the finaliser- and reader-facing handle; none of its methods are
/// async-signal-safe. The agent-facing handle is [`RawSink`].
#[derive(Debug)]
pub struct TraceFile {
    file: File,
}

impl TraceFile {
    /// Creates a trace file at the given path, failing if one already
    /// exists, and stamps the file marker at offset 0.
    pub fn create(path: &Path) -> Result<TraceFile, ErrorCode> {
        debug!("Creating trace file {}.", path.display());

        let mut file = File::create(path).map_err(|error| {
            log_open_error("create", path, &error);
            ErrorCode::OpenFailed
        })?;

        if file.write(TRACE_FILE_MARKER).is_err() {
            // A file without the marker is not a trace file; do not leave it
            // lying around.
            let _ = file.remove();
            return Err(ErrorCode::OpenFailed);
        }

        Ok(TraceFile { file })
    }

    /// Creates a trace file at a unique `/tmp` path and stamps the marker.
    pub fn create_temporary(prefix: &str) -> Result<TraceFile, ErrorCode> {
        let mut file = File::create_temporary(prefix).map_err(|error| {
            error!("Could not create temporary trace file: {error}.");
            ErrorCode::OpenFailed
        })?;

        if file.write(TRACE_FILE_MARKER).is_err() {
            let _ = file.remove();
            return Err(ErrorCode::OpenFailed);
        }

        Ok(TraceFile { file })
    }

    /// Opens an existing trace file and checks it starts with the marker.
    /// The file position is left just past the marker.
    pub fn open(path: &Path, permissions: Permissions) -> Result<TraceFile, ErrorCode> {
        debug!("Opening trace file {}.", path.display());

        let mut file = File::open(path, permissions).map_err(|error| {
            log_open_error("open", path, &error);
            ErrorCode::OpenFailed
        })?;

        let mut marker = [0u8; TRACE_ENTRY_MARKER_SIZE];
        let marker_is_valid = matches!(
            file.read(&mut marker),
            Ok(TRACE_ENTRY_MARKER_SIZE) if &marker == TRACE_FILE_MARKER
        );

        if !marker_is_valid {
            error!("Missing trace file marker in {}.", path.display());
            return Err(ErrorCode::UnknownEntryKind);
        }

        Ok(TraceFile { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn seek_to_start(&mut self) -> io::Result<()> {
        self.file.seek_to_start()
    }

    /// Converts this handle into the async-signal-safe append handle used
    /// inside the profiled process.
    pub fn into_raw_sink(self) -> RawSink {
        RawSink::from_raw_fd(self.file.into_raw_fd())
    }

    /// Appends a sample entry.
    pub fn add_sample(&mut self, sample: &Sample) -> io::Result<usize> {
        codec::write_sample_entry(self.file.as_raw_fd(), sample)
    }

    /// Appends a backtrace entry. The backtrace must have at least one
    /// stack frame id.
    pub fn add_backtrace(&mut self, backtrace: &Backtrace) -> io::Result<usize> {
        codec::write_backtrace_entry(self.file.as_raw_fd(), backtrace)
    }

    /// Appends a stack frame entry.
    pub fn add_stack_frame(&mut self, stack_frame: &StackFrame) -> io::Result<usize> {
        codec::write_stack_frame_entry(self.file.as_raw_fd(), stack_frame)
    }

    /// Reads the entry at the current file position.
    ///
    /// File markers encountered mid-stream are skipped, so the first call
    /// after seeking to the start of a file consumes the magic marker and
    /// returns the first real entry.
    pub fn read_next_entry(&mut self) -> Entry {
        match self.read_next_entry_kind() {
            EntryKind::Sample => match codec::read_sample(&mut self.file) {
                Some(sample) => Entry::Sample(sample),
                None => {
                    error!("Reading sample failed.");
                    Entry::Error(ErrorCode::ReadSampleFailed)
                }
            },
            EntryKind::Backtrace => match codec::read_backtrace(&mut self.file) {
                Some(backtrace) => Entry::Backtrace(backtrace),
                None => {
                    error!("Reading backtrace failed.");
                    Entry::Error(ErrorCode::ReadBacktraceFailed)
                }
            },
            EntryKind::StackFrame => match codec::read_stack_frame(&mut self.file) {
                Some(stack_frame) => Entry::StackFrame(stack_frame),
                None => {
                    error!("Reading stack frame failed.");
                    Entry::Error(ErrorCode::ReadStackFrameFailed)
                }
            },
            EntryKind::EndOfFile => Entry::Error(ErrorCode::EndOfFile),
            EntryKind::FileMarker | EntryKind::Unknown => {
                debug!("Unknown entry kind detected, bailing.");
                Entry::Error(ErrorCode::UnknownEntryKind)
            }
        }
    }

    fn read_next_entry_kind(&mut self) -> EntryKind {
        loop {
            let mut marker = [0u8; TRACE_ENTRY_MARKER_SIZE];

            let kind = match self.file.read(&mut marker) {
                Ok(0) => EntryKind::EndOfFile,
                Ok(TRACE_ENTRY_MARKER_SIZE) => match &marker {
                    m if m == TRACE_FILE_MARKER => EntryKind::FileMarker,
                    m if m == SAMPLE_MARKER => EntryKind::Sample,
                    m if m == BACKTRACE_MARKER => EntryKind::Backtrace,
                    m if m == STACK_FRAME_MARKER => EntryKind::StackFrame,
                    _ => EntryKind::Unknown,
                },
                _ => EntryKind::Unknown,
            };

            if let EntryKind::FileMarker = kind {
                // Ignore it and grab the next one.
                continue;
            }

            return kind;
        }
    }

    /// Reads the whole trace from the start of the file.
    ///
    /// `EndOfFile` terminates the read normally; any other error is fatal.
    pub fn read_trace(&mut self) -> Result<Trace, ErrorCode> {
        if let Err(error) = self.file.seek_to_start() {
            error!("Could not seek to the start of the trace file: {error}.");
            return Err(ErrorCode::OpenFailed);
        }

        let mut trace = Trace::default();

        loop {
            match self.read_next_entry() {
                Entry::Sample(sample) => trace.samples.push(sample),
                Entry::Backtrace(backtrace) => trace.backtraces.push(backtrace),
                Entry::StackFrame(stack_frame) => trace.stack_frames.push(stack_frame),
                Entry::Error(ErrorCode::EndOfFile) => return Ok(trace),
                Entry::Error(error_code) => {
                    error!("Error reading trace file: {error_code}.");
                    return Err(error_code);
                }
            }
        }
    }
}

/// Generates the default name for a trace file:
/// `swimps_trace_<program>_<seconds>_<nanoseconds>`.
pub fn generate_trace_file_name(program_name: &str, time: &TimeSpecification) -> String {
    format!(
        "swimps_trace_{}_{}_{}",
        program_name, time.seconds, time.nanoseconds
    )
}

fn log_open_error(operation: &str, path: &Path, error: &io::Error) {
    error!(
        "Could not {} trace file {}, errno {} ({}).",
        operation,
        path.display(),
        error.raw_os_error().unwrap_or(0),
        error
    );
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn markers_are_six_bytes_and_distinct() {
        let markers = [
            TRACE_FILE_MARKER,
            SAMPLE_MARKER,
            BACKTRACE_MARKER,
            STACK_FRAME_MARKER,
        ];

        for (index, marker) in markers.iter().enumerate() {
            assert_eq!(marker.len(), TRACE_ENTRY_MARKER_SIZE);
            for other in &markers[index + 1..] {
                assert_ne!(marker, other);
            }
        }
    }

    #[test]
    fn trace_file_names_embed_program_and_time() {
        let time = TimeSpecification {
            seconds: 9,
            nanoseconds: 17,
        };

        assert_eq!(
            generate_trace_file_name("stress", &time),
            "swimps_trace_stress_9_17"
        );
    }
}
