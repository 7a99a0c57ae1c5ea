//! The entities a trace is made of.
//!
//! Signed identifier types are chosen so that overflow and uninitialised
//! data are easy to spot: valid identifiers start at 1, and `i64::MIN` is
//! the "never assigned" sentinel.

use std::fmt;

use swimps_time::TimeSpecification;

pub type StackFrameId = i64;
pub type BacktraceId = i64;
pub type StackFrameCount = i32;
pub type InstructionPointer = u64;

/// Backtraces captured in signal context are bounded; deeper stacks are
/// truncated at this many frames.
pub const MAX_STACK_FRAMES: usize = 64;

/// Function names longer than this are truncated.
pub const MAX_FUNCTION_NAME_LENGTH: usize = 256;

/// Source file paths longer than this are truncated.
pub const MAX_SOURCE_FILE_PATH_LENGTH: usize = 4096;

const UNINITIALISED_ID: i64 = i64::MIN;

/// One observation: which call chain was executing, and when.
///
/// Samples are the only entity produced on the sampling hot path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sample {
    pub backtrace_id: BacktraceId,
    pub timestamp: TimeSpecification,
}

/// An ordered call chain, innermost frame first.
///
/// Two backtraces are equivalent iff their stack frame id sequences match;
/// after finalisation no two backtraces in a trace are equivalent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backtrace {
    pub id: BacktraceId,
    pub stack_frame_ids: Vec<StackFrameId>,
}

impl Backtrace {
    pub fn is_equivalent_to(&self, other: &Backtrace) -> bool {
        self.stack_frame_ids == other.stack_frame_ids
    }
}

/// A fixed-capacity call chain, capturable without allocating.
///
/// This is the in-signal form of [`Backtrace`]: the slots hold raw
/// instruction pointers that the finaliser later maps to stack frame ids.
/// Both forms serialise to the same wire representation.
#[derive(Clone, Copy)]
pub struct RawBacktrace {
    pub instruction_pointers: [InstructionPointer; MAX_STACK_FRAMES],
    pub count: StackFrameCount,
}

impl RawBacktrace {
    pub fn new() -> Self {
        RawBacktrace {
            instruction_pointers: [0; MAX_STACK_FRAMES],
            count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl Default for RawBacktrace {
    fn default() -> Self {
        RawBacktrace::new()
    }
}

/// One return address, optionally resolved to symbolic form.
///
/// The buffers are fixed-capacity so that a frame can live on the stack in
/// signal context; the length fields say how much of each buffer is valid.
#[derive(Clone, Copy)]
pub struct StackFrame {
    pub id: StackFrameId,
    pub instruction_pointer: InstructionPointer,
    pub offset: u64,
    pub line_number: i64,
    function_name: [u8; MAX_FUNCTION_NAME_LENGTH],
    function_name_length: i32,
    source_file_path: [u8; MAX_SOURCE_FILE_PATH_LENGTH],
    source_file_path_length: u32,
}

impl StackFrame {
    pub fn new(id: StackFrameId, instruction_pointer: InstructionPointer) -> Self {
        StackFrame {
            id,
            instruction_pointer,
            offset: 0,
            line_number: -1,
            function_name: [0; MAX_FUNCTION_NAME_LENGTH],
            function_name_length: 0,
            source_file_path: [0; MAX_SOURCE_FILE_PATH_LENGTH],
            source_file_path_length: 0,
        }
    }

    pub fn function_name(&self) -> &[u8] {
        &self.function_name[..self.function_name_length as usize]
    }

    /// Stores a function name, truncating it to the buffer capacity.
    pub fn set_function_name(&mut self, name: &[u8]) {
        let length = name.len().min(MAX_FUNCTION_NAME_LENGTH);
        self.function_name[..length].copy_from_slice(&name[..length]);
        self.function_name_length = length as i32;
    }

    pub fn source_file_path(&self) -> &[u8] {
        &self.source_file_path[..self.source_file_path_length as usize]
    }

    /// Stores a source file path, truncating it to the buffer capacity.
    pub fn set_source_file_path(&mut self, path: &[u8]) {
        let length = path.len().min(MAX_SOURCE_FILE_PATH_LENGTH);
        self.source_file_path[..length].copy_from_slice(&path[..length]);
        self.source_file_path_length = length as u32;
    }

    /// Identity: the same frame record.
    pub fn is_same_as(&self, other: &StackFrame) -> bool {
        self.id == other.id && self.is_equivalent_to(other)
    }

    /// Equivalence: the same place in the program, regardless of id.
    ///
    /// After finalisation no two stack frames in a trace are equivalent.
    pub fn is_equivalent_to(&self, other: &StackFrame) -> bool {
        self.instruction_pointer == other.instruction_pointer
            && self.offset == other.offset
            && self.function_name() == other.function_name()
    }
}

impl Default for StackFrame {
    fn default() -> Self {
        StackFrame::new(UNINITIALISED_ID, 0)
    }
}

impl fmt::Debug for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackFrame")
            .field("id", &self.id)
            .field("instruction_pointer", &self.instruction_pointer)
            .field("offset", &self.offset)
            .field("line_number", &self.line_number)
            .field(
                "function_name",
                &String::from_utf8_lossy(self.function_name()),
            )
            .field(
                "source_file_path",
                &String::from_utf8_lossy(self.source_file_path()),
            )
            .finish()
    }
}

/// Everything a finalised trace file contains, in memory.
#[derive(Clone, Debug, Default)]
pub struct Trace {
    pub samples: Vec<Sample>,
    pub backtraces: Vec<Backtrace>,
    pub stack_frames: Vec<StackFrame>,
}
