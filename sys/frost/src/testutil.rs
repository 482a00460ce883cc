// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared test fixtures: a controllable fake clock and callback scratch.
//!
//! Task callbacks are plain `fn` pointers, so tests communicate with them
//! through thread-local cells. Each test runs on its own thread, which keeps
//! the cells isolated.

use core::cell::Cell;

use crate::engine::Engine;
use crate::port::Port;
use crate::task::ArgList;

thread_local! {
    pub static CURRENT_TIME: Cell<u64> = const { Cell::new(0) };
    pub static HITS: Cell<u64> = const { Cell::new(0) };
}

/// Port whose clock is the thread-local `CURRENT_TIME` cell.
pub struct FakePort;

impl Port for FakePort {
    fn time_tick(&self) -> u64 {
        CURRENT_TIME.with(|t| t.get())
    }
}

pub fn change_time(time: u64) {
    CURRENT_TIME.with(|t| t.set(time));
}

pub fn advance_time(delta: u64) {
    CURRENT_TIME.with(|t| t.set(t.get() + delta));
}

pub fn hits() -> u64 {
    HITS.with(|h| h.get())
}

/// Callback that counts its fires.
pub fn count_hit(_: &mut Engine, _: &ArgList) {
    HITS.with(|h| h.set(h.get() + 1));
}

/// Callback that does nothing at all.
pub fn noop(_: &mut Engine, _: &ArgList) {}

/// Fresh initialized engine over a reset fake clock.
pub fn make_engine() -> Engine {
    change_time(0);
    HITS.with(|h| h.set(0));
    let mut engine = Engine::new(FakePort);
    engine.init().unwrap();
    engine
}
