use std::io;
use std::mem::MaybeUninit;
use std::os::raw::c_int;
use std::ptr;

/// A fixed-width timestamp on some clock.
///
/// `libc::timespec` varies across platforms; this does not, which means a
/// trace file records time the same way everywhere it is read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimeSpecification {
    pub seconds: i64,
    pub nanoseconds: i64,
}

/// Reads the current value of the given clock.
///
/// Async-signal-safe: calls `clock_gettime` and nothing else.
pub fn now(clock_id: libc::clockid_t) -> io::Result<TimeSpecification> {
    let mut timespec = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };

    if unsafe { libc::clock_gettime(clock_id, &mut timespec) } == -1 {
        return Err(io::Error::last_os_error());
    }

    Ok(TimeSpecification {
        seconds: timespec.tv_sec as i64,
        nanoseconds: timespec.tv_nsec as i64,
    })
}

/// Converts a sampling rate into the timer interval that realises it.
///
/// The period `1/rate` is split into whole seconds and a fractional part,
/// the latter rounded to whole nanoseconds.
pub fn interval_for_rate(samples_per_second: f64) -> (i64, i64) {
    let period = 1.0 / samples_per_second;
    let whole_seconds = period.trunc();
    let fractional_seconds = period.fract();

    (
        whole_seconds as i64,
        (fractional_seconds * 1_000_000_000.0).round() as i64,
    )
}

/// A per-process timer that delivers a signal each time it expires.
pub struct SignalTimer {
    timer: libc::timer_t,
}

// timer_t is an opaque kernel handle (a pointer on glibc); the syscalls that
// take it do not care which thread calls them.
unsafe impl Send for SignalTimer {}
unsafe impl Sync for SignalTimer {}

impl SignalTimer {
    /// Creates a timer on the given clock that raises `signal` on expiry.
    ///
    /// The timer starts disarmed. Not async-signal-safe.
    pub fn create(clock_id: libc::clockid_t, signal: c_int) -> io::Result<Self> {
        let mut event = unsafe { MaybeUninit::<libc::sigevent>::zeroed().assume_init() };
        event.sigev_notify = libc::SIGEV_SIGNAL;
        event.sigev_signo = signal;

        let mut timer: libc::timer_t = ptr::null_mut();

        if unsafe { libc::timer_create(clock_id, &mut event, &mut timer) } == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(SignalTimer { timer })
    }

    /// Starts the timer firing `samples_per_second` times per second.
    ///
    /// Async-signal-safe: calls `timer_settime` and nothing else.
    pub fn arm(&self, samples_per_second: f64) -> io::Result<()> {
        let (seconds, nanoseconds) = interval_for_rate(samples_per_second);
        self.set(seconds, nanoseconds)
    }

    /// Stops the timer. Async-signal-safe.
    pub fn disarm(&self) -> io::Result<()> {
        self.set(0, 0)
    }

    fn set(&self, seconds: i64, nanoseconds: i64) -> io::Result<()> {
        let interval = libc::timespec {
            tv_sec: seconds,
            tv_nsec: nanoseconds,
        };

        let timer_specification = libc::itimerspec {
            it_interval: interval,
            it_value: interval,
        };

        if unsafe { libc::timer_settime(self.timer, 0, &timer_specification, ptr::null_mut()) }
            == -1
        {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }
}

impl Drop for SignalTimer {
    fn drop(&mut self) {
        unsafe { libc::timer_delete(self.timer) };
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn one_sample_per_second_is_a_whole_second() {
        assert_eq!(interval_for_rate(1.0), (1, 0));
    }

    #[test]
    fn two_samples_per_second_is_half_a_second() {
        assert_eq!(interval_for_rate(2.0), (0, 500_000_000));
    }

    #[test]
    fn sub_one_rates_span_multiple_seconds() {
        assert_eq!(interval_for_rate(0.5), (2, 0));
        assert_eq!(interval_for_rate(0.25), (4, 0));
    }

    #[test]
    fn monotonic_clock_does_not_go_backwards() {
        let before = now(libc::CLOCK_MONOTONIC).unwrap();
        let after = now(libc::CLOCK_MONOTONIC).unwrap();
        assert!(
            after.seconds > before.seconds
                || (after.seconds == before.seconds && after.nanoseconds >= before.nanoseconds)
        );
    }
}
