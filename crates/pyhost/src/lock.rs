//! Process-wide exclusive access to the embedded interpreter
//!
//! The interpreter may only be touched by one caller at a time. Access goes through
//! [`ExclusiveRuntimeLock::with`], which holds a process-wide gate plus the
//! interpreter's own GIL for the duration of a closure and hands it an
//! [`InterpreterToken`]. Every API that reads or writes interpreter state takes that
//! token, so code that does not hold the lock cannot call it.

use std::cell::Cell;
use std::sync::{Mutex, PoisonError};

use pyo3::Python;

use crate::error::{EvalError, EvalResult};

static GATE: Mutex<()> = Mutex::new(());

thread_local! {
    static HELD: Cell<bool> = const { Cell::new(false) };
}

/// Proof that the current thread holds the runtime lock.
///
/// Only [`ExclusiveRuntimeLock::with`] can create one. It is `Copy` and tied to the
/// GIL lifetime `'py`, so it cannot escape the locked region or cross threads.
#[derive(Clone, Copy)]
pub struct InterpreterToken<'py> {
    py: Python<'py>,
}

impl<'py> InterpreterToken<'py> {
    /// The interpreter's GIL token
    pub fn py(self) -> Python<'py> {
        self.py
    }
}

impl std::fmt::Debug for InterpreterToken<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("InterpreterToken")
    }
}

/// The single mutual-exclusion discipline gating all interpreter access.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExclusiveRuntimeLock;

impl ExclusiveRuntimeLock {
    /// Run `f` while holding the runtime lock.
    ///
    /// Blocks until the lock is free (FIFO as provided by the platform mutex). The
    /// lock is released on every exit path, including panics. Acquiring it again
    /// from the thread that already holds it returns [`EvalError::ReentrantLock`].
    ///
    /// Must not be called while the calling thread already holds the GIL through
    /// some other path: the gate is taken before the GIL.
    pub fn with<F, R>(self, f: F) -> EvalResult<R>
    where
        F: for<'py> FnOnce(InterpreterToken<'py>) -> R,
    {
        if HELD.with(Cell::get) {
            log::error!("[Lock] Re-entrant acquisition of the interpreter lock refused");
            return Err(EvalError::ReentrantLock);
        }

        let _gate = GATE.lock().unwrap_or_else(PoisonError::into_inner);
        let _held = HeldFlag::set();

        pyo3::prepare_freethreaded_python();
        Ok(Python::with_gil(|py| {
            f(InterpreterToken { py })
        }))
    }

    /// Whether the current thread is inside [`ExclusiveRuntimeLock::with`]
    pub fn is_held_by_current_thread(self) -> bool {
        HELD.with(Cell::get)
    }
}

/// Clears the thread-local flag when the locked region ends, even by unwinding.
struct HeldFlag;

impl HeldFlag {
    fn set() -> Self {
        HELD.with(|held| held.set(true));
        HeldFlag
    }
}

impl Drop for HeldFlag {
    fn drop(&mut self) {
        HELD.with(|held| held.set(false));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reentrant_acquisition_is_refused() {
        let lock = ExclusiveRuntimeLock;
        let nested = lock
            .with(|_| {
                assert!(lock.is_held_by_current_thread());
                lock.with(|_| ()).is_err()
            })
            .unwrap();
        assert!(nested, "nested acquisition must fail");
        assert!(!lock.is_held_by_current_thread());
    }

    #[test]
    fn test_flag_cleared_after_panic() {
        let lock = ExclusiveRuntimeLock;
        let result = std::panic::catch_unwind(|| {
            let _ = lock.with(|_| panic!("boom"));
        });
        assert!(result.is_err());
        assert!(!lock.is_held_by_current_thread());
        assert!(lock.with(|tok| tok.py().version().len()).unwrap() > 0);
    }
}
