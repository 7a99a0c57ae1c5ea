//! The append handle the sampling agent writes through.

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI64, Ordering};

use swimps_io::close_file_descriptor;
use swimps_time::TimeSpecification;
use swimps_trace::{RawBacktrace, Sample};

use crate::codec;

/// An append-only sink for raw samples.
///
/// Every method is async-signal-safe. The sink deliberately does not close
/// its descriptor on drop: the agent's teardown closes it explicitly, after
/// the last in-flight sample has finished writing, and the global holding
/// the sink is never dropped anyway.
#[derive(Debug)]
pub struct RawSink {
    file_descriptor: RawFd,
    next_backtrace_id: AtomicI64,
}

impl RawSink {
    pub(crate) fn from_raw_fd(file_descriptor: RawFd) -> RawSink {
        RawSink {
            file_descriptor,
            next_backtrace_id: AtomicI64::new(1),
        }
    }

    /// Appends one captured sample as a single burst: a backtrace entry
    /// whose slots carry the raw instruction pointers, then the sample
    /// entry referencing it.
    ///
    /// Async-signal-safe: writes through the fixed-capacity codec, no
    /// allocation, no locking.
    pub fn add_raw_sample(
        &self,
        timestamp: TimeSpecification,
        backtrace: &RawBacktrace,
    ) -> io::Result<usize> {
        let backtrace_id = self.next_backtrace_id.fetch_add(1, Ordering::Relaxed);

        let mut bytes_written =
            codec::write_raw_backtrace_entry(self.file_descriptor, backtrace_id, backtrace)?;

        bytes_written += codec::write_sample_entry(
            self.file_descriptor,
            &Sample {
                backtrace_id,
                timestamp,
            },
        )?;

        Ok(bytes_written)
    }

    /// Closes the underlying descriptor. Async-signal-safe.
    ///
    /// Only call this once no more samples can be in flight.
    pub fn close(&self) {
        close_file_descriptor(self.file_descriptor);
    }
}
