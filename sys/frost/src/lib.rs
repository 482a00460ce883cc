// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Frost cooperative task engine.
//!
//! Frost multiplexes named tasks -- one-shot asynchronous callbacks and
//! periodic interval callbacks -- on a single execution context, for hosts
//! that have a monotonic tick source but no preemptive kernel. On top of bare
//! scheduling it provides three primitives:
//!
//! 1. **Awaiters** -- synchronous-looking joins on asynchronous tasks,
//!    including timeout and cancellation.
//! 2. **Task-local storage** -- a fixed-size keyed scratch table per task.
//! 3. **Channels** -- fixed-capacity ring-buffered inboxes attached to tasks,
//!    with direct and broadcast writes plus close notifications.
//!
//! # Design principles
//!
//! While this isn't a *deeply* principled engine, there are some basic ideas
//! that appear consistently.
//!
//! 1. Strictly single-threaded, cooperative execution. There is exactly one
//!    logical thread: the application's outer loop plus any nested
//!    [`Engine::schedule`] invocations a callback makes. Nothing locks.
//! 2. No hidden global state. The engine is an explicit value threaded
//!    through every operation; callbacks receive `&mut Engine`.
//! 3. Tasks are addressed by [`TaskId`], a slot index plus generation
//!    number, so stale references to deleted peers are detected rather than
//!    dereferenced.
//! 4. A preference for simple and clear algorithms over fast and clever
//!    algorithms.
//!
//! The host supplies a [`Port`]: a monotonic millisecond tick source and an
//! optional log sink.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
pub mod port;

pub mod awaiter;
pub mod chan;
pub mod engine;
pub mod task;
pub mod tls;

pub use frost_abi::{
    ChanCtl, Error, Generation, TaskFlags, TaskId, CHAN_RING_DEPTH,
    MAX_TASK_ARGS, TLS_SIZE,
};

pub use crate::awaiter::Awaiter;
pub use crate::chan::Pack;
pub use crate::engine::Engine;
pub use crate::port::Port;
pub use crate::task::{ArgList, TaskEnum, TaskFn, Word};

#[cfg(test)]
pub(crate) mod testutil;
