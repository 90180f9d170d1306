//! Abort-on-error policy for programs that treat every transport failure as terminal.
use std::panic::Location;

use crate::error::{Error, Result};

/// Prints where and why the program failed to stderr, then exits with a failure code.
pub fn abort(err: &Error, location: &Location<'_>) -> ! {
    eprintln!(
        "Fatal error at {}:{}:{}: {}",
        location.file(),
        location.line(),
        location.column(),
        err
    );
    if let Some(os) = err.os_error() {
        eprintln!("System error: {}", os);
    }
    std::process::exit(1)
}

pub trait OrAbort<T> {
    /// Unwraps the value, or aborts the process pointing at the caller.
    fn or_abort(self) -> T;
}

impl<T> OrAbort<T> for Result<T> {
    #[track_caller]
    fn or_abort(self) -> T {
        match self {
            Ok(v) => v,
            Err(e) => abort(&e, Location::caller()),
        }
    }
}
