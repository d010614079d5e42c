//! Terminators for stopping a solve from the outside.
//!
//! Terminators are polled once per SQP iteration, at the iteration
//! boundary.  Provided implementations:
//! - [`TimeOutTerminator`]: wallclock time limit.
//! - [`CpuTimeTerminator`]: process CPU time limit.
//! - [`InterruptTerminator`]: responds to Ctrl-C (SIGINT).
//! - [`MultipleTerminators`]: combines several terminators.
//!
//! # Note
//! [`InterruptTerminator`] installs a global signal handler and **can only
//! be constructed once** per process.  Attempting to create multiple
//! instances will result in a panic.

use std::sync::{Arc, atomic::AtomicBool};
use std::time::Instant;

use crate::{E, SqpExitStatus};

pub trait Terminator {
    /// Called once at the beginning of a solve.
    fn initialize(&mut self) {}

    /// Returns the exit status to stop with, or `None` to continue.
    fn terminate(&mut self) -> Option<SqpExitStatus>;
}

/// Terminator that responds to Ctrl-C (SIGINT) or programmatic interrupts.
///
/// # Note
/// Only one instance can be constructed per process, as it installs a
/// global signal handler.  Creating more than one will panic.
pub struct InterruptTerminator {
    interrupted: Arc<AtomicBool>,
}

impl InterruptTerminator {
    pub fn new() -> Self {
        let interrupted = Arc::new(AtomicBool::new(false));
        ctrlc::set_handler({
            let interrupted_clone = interrupted.clone();
            move || {
                interrupted_clone.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        })
        .expect("Error setting Ctrl-C handler");
        Self { interrupted }
    }

    pub fn interrupt(&mut self) {
        self.interrupted.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Terminator for InterruptTerminator {
    fn terminate(&mut self) -> Option<SqpExitStatus> {
        if self.interrupted.load(std::sync::atomic::Ordering::SeqCst) {
            Some(SqpExitStatus::Interrupted)
        } else {
            None
        }
    }
}

/// Terminator that triggers after a wallclock time limit (in seconds).
pub struct TimeOutTerminator {
    max_seconds: E,
    start_time: Instant,
}

impl TimeOutTerminator {
    pub fn new(max_seconds: E) -> Self {
        Self {
            max_seconds,
            start_time: Instant::now(),
        }
    }
}

impl Terminator for TimeOutTerminator {
    fn initialize(&mut self) {
        self.start_time = Instant::now();
    }

    fn terminate(&mut self) -> Option<SqpExitStatus> {
        if self.start_time.elapsed().as_secs_f64() >= self.max_seconds {
            Some(SqpExitStatus::ExceedMaxWallclockTime)
        } else {
            None
        }
    }
}

/// Process CPU time in seconds.
pub fn cpu_time_seconds() -> E {
    let mut timespec = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let result =
        unsafe { libc::clock_gettime(libc::CLOCK_PROCESS_CPUTIME_ID, &mut timespec) };
    if result == 0 {
        timespec.tv_sec as E + timespec.tv_nsec as E * 1e-9
    } else {
        0.
    }
}

/// Terminator that triggers after a CPU time limit (in seconds).
pub struct CpuTimeTerminator {
    max_seconds: E,
    start_time: E,
}

impl CpuTimeTerminator {
    pub fn new(max_seconds: E) -> Self {
        Self {
            max_seconds,
            start_time: cpu_time_seconds(),
        }
    }
}

impl Terminator for CpuTimeTerminator {
    fn initialize(&mut self) {
        self.start_time = cpu_time_seconds();
    }

    fn terminate(&mut self) -> Option<SqpExitStatus> {
        if cpu_time_seconds() - self.start_time >= self.max_seconds {
            Some(SqpExitStatus::ExceedMaxCpuTime)
        } else {
            None
        }
    }
}

/// Terminator that combines multiple terminators and triggers if any of
/// them do.
pub struct MultipleTerminators {
    terminators: Vec<Box<dyn Terminator>>,
}

impl MultipleTerminators {
    pub fn new(terminators: Vec<Box<dyn Terminator>>) -> Self {
        Self { terminators }
    }

    pub fn add(&mut self, terminator: Box<dyn Terminator>) {
        self.terminators.push(terminator);
    }
}

impl Terminator for MultipleTerminators {
    fn initialize(&mut self) {
        for terminator in &mut self.terminators {
            terminator.initialize();
        }
    }

    fn terminate(&mut self) -> Option<SqpExitStatus> {
        for terminator in &mut self.terminators {
            if let Some(status) = terminator.as_mut().terminate() {
                return Some(status);
            }
        }
        None
    }
}
