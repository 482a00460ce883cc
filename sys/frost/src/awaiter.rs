// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Join handles for asynchronous tasks.
//!
//! An [`Awaiter`] is shared between the caller that launched a task and the
//! task record itself. The engine never releases an awaiter when its task is
//! deleted -- it only marks it canceled -- because the caller needs to
//! inspect the final status and result after the task is gone. The caller's
//! handle going out of scope is what actually frees the state.

use alloc::rc::Rc;
use core::cell::Cell;

use frost_abi::Error;

use crate::engine::Engine;
use crate::task::Word;

/// Join handle for an asynchronous task.
///
/// Interior mutability keeps this shareable between the caller and the task
/// record on the single engine thread; all accessors take `&self`.
pub struct Awaiter {
    finished: Cell<bool>,
    result: Cell<Word>,
    status: Cell<Result<(), Error>>,
    timeout: Cell<u64>,
}

impl Awaiter {
    /// Creates a pending awaiter, as attached to a just-launched task.
    pub fn pending() -> Rc<Self> {
        Rc::new(Awaiter {
            finished: Cell::new(false),
            result: Cell::new(0),
            status: Cell::new(Ok(())),
            timeout: Cell::new(0),
        })
    }

    /// Creates an already-resolved awaiter. Used to hand synchronous
    /// failures (or immediate values) to a caller expecting a join handle.
    pub fn resolved(result: Word, status: Result<(), Error>) -> Rc<Self> {
        let awaiter = Self::pending();
        awaiter.finished.set(true);
        awaiter.result.set(result);
        awaiter.status.set(status);
        awaiter
    }

    pub fn is_finished(&self) -> bool {
        self.finished.get()
    }

    pub fn result(&self) -> Word {
        self.result.get()
    }

    pub fn status(&self) -> Result<(), Error> {
        self.status.get()
    }

    /// Join timeout in milliseconds; zero means wait forever.
    pub fn timeout(&self) -> u64 {
        self.timeout.get()
    }

    pub fn set_timeout(&self, timeout_ms: u64) {
        self.timeout.set(timeout_ms);
    }

    /// Announces completion with `result`. Called by the task (or on its
    /// behalf) to let the joiner proceed.
    pub fn finish(&self, result: Word) {
        self.result.set(result);
        self.status.set(Ok(()));
        self.finished.set(true);
    }

    /// Marks the awaiter canceled. Called by the engine when the task is
    /// deleted before finishing; this is the sole path by which a joiner
    /// observes task death.
    pub fn cancel(&self) {
        self.result.set(0);
        self.status.set(Err(Error::Canceled));
        self.finished.set(true);
    }

    /// The final `{status, result}` pair as a `Result`.
    pub fn outcome(&self) -> Result<Word, Error> {
        self.status().map(|()| self.result())
    }

    fn force(&self, status: Error) {
        self.result.set(0);
        self.status.set(Err(status));
        self.finished.set(true);
    }
}

impl Engine {
    /// Blocking join: drives [`Engine::schedule`] until `awaiter` resolves.
    ///
    /// Resolution happens in one of three ways:
    ///
    /// - the task finishes or is canceled, in which case the awaiter's own
    ///   outcome is returned;
    /// - the awaiter's timeout (if nonzero) elapses, measured against the
    ///   scheduler tick from the moment this call started, in which case the
    ///   awaiter is forced to `Timeout`;
    /// - `schedule` itself fails, in which case the awaiter is forced to
    ///   `FatalError`.
    ///
    /// The scheduler tick only advances while tasks are being processed, so
    /// timeouts require at least one live periodic task to keep time moving.
    pub fn wait(&mut self, awaiter: &Awaiter) -> Result<Word, Error> {
        let start = self.sched_tick();

        loop {
            if self.schedule().is_err() {
                plog!(
                    self.port(),
                    "awaiting task failure, schedule() does not return ok"
                );
                awaiter.force(Error::FatalError);
                return Err(Error::FatalError);
            }

            if awaiter.is_finished() {
                return awaiter.outcome();
            }

            let timeout = awaiter.timeout();
            if timeout != 0 && self.sched_tick().wrapping_sub(start) >= timeout
            {
                plog!(self.port(), "task timed out, force to break");
                awaiter.force(Error::Timeout);
                return Err(Error::Timeout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::Port;
    use crate::testutil::FakePort;

    #[test]
    fn resolved_carries_value_and_status() {
        let a = Awaiter::resolved(7, Err(Error::OutOfMemory));
        assert!(a.is_finished());
        assert_eq!(a.result(), 7);
        assert_eq!(a.status(), Err(Error::OutOfMemory));
        assert_eq!(a.outcome(), Err(Error::OutOfMemory));
    }

    #[test]
    fn finish_then_outcome() {
        let a = Awaiter::pending();
        assert!(!a.is_finished());
        a.finish(42);
        assert!(a.is_finished());
        assert_eq!(a.outcome(), Ok(42));
    }

    #[test]
    fn cancel_clears_result() {
        let a = Awaiter::pending();
        a.finish(9);
        // Cancel after finish is not something the engine does, but the
        // state transition itself must still null the result.
        a.cancel();
        assert_eq!(a.result(), 0);
        assert_eq!(a.outcome(), Err(Error::Canceled));
    }

    #[test]
    fn wait_on_uninitialized_engine_is_fatal() {
        let mut engine = Engine::new(FakePort);
        let a = Awaiter::pending();
        assert_eq!(engine.wait(&a), Err(Error::FatalError));
        assert!(a.is_finished());
        assert_eq!(a.status(), Err(Error::FatalError));
    }

    #[test]
    fn port_default_log_is_a_no_op() {
        // Exercises the default trait body so a port without a sink is fine.
        FakePort.log_print("tag", format_args!("dropped"));
    }
}
