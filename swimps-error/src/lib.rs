use thiserror::Error;

/// Every way swimps can fail, in one place.
///
/// The discriminants double as process exit codes, so they must stay stable:
/// only ever append to this list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[repr(i32)]
pub enum ErrorCode {
    #[error("no error")]
    None = 0,
    #[error("a required parameter was null")]
    NullParameter = 1,
    #[error("a parameter had an invalid value")]
    InvalidParameter = 2,
    #[error("fork failed")]
    ForkFailed = 3,
    #[error("ptrace failed")]
    PtraceFailed = 4,
    #[error("readlink failed")]
    ReadlinkFailed = 5,
    #[error("execve failed")]
    ExecveFailed = 6,
    #[error("could not open file")]
    OpenFailed = 7,
    #[error("child process has non-zero exit code")]
    ChildProcessHasNonZeroExitCode = 8,
    #[error("child process exited due to a signal")]
    ChildProcessExitedDueToSignal = 9,
    #[error("could not parse command line")]
    CommandLineParseFailed = 10,
    #[error("reading a sample failed")]
    ReadSampleFailed = 11,
    #[error("reading a backtrace failed")]
    ReadBacktraceFailed = 12,
    #[error("reading a stack frame failed")]
    ReadStackFrameFailed = 13,
    #[error("unknown trace file entry kind")]
    UnknownEntryKind = 14,
    #[error("end of file")]
    EndOfFile = 15,
}

impl ErrorCode {
    /// The value the swimps process exits with when this is the outcome.
    pub fn exit_code(self) -> i32 {
        self as i32
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exit_codes_are_stable() {
        assert_eq!(ErrorCode::None.exit_code(), 0);
        assert_eq!(ErrorCode::CommandLineParseFailed.exit_code(), 10);
        assert_eq!(ErrorCode::EndOfFile.exit_code(), 15);
    }
}
