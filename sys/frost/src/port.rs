// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host port surface.
//!
//! The engine asks its host for exactly two things: a monotonic time source
//! and somewhere to send log lines. Everything else is portable.

use core::fmt;

/// Services the embedding application provides to the engine.
pub trait Port {
    /// Monotonic tick count in milliseconds.
    ///
    /// This is required for anything to happen: a stub that always returns
    /// the same value stalls interval scheduling, awaiter timeouts, and
    /// [`crate::Engine::sleep`].
    fn time_tick(&self) -> u64;

    /// Structured log sink. The default implementation discards everything,
    /// matching hosts that have nowhere to print.
    fn log_print(&self, tag: &str, args: fmt::Arguments<'_>) {
        let _ = (tag, args);
    }
}

/// Internal logging shorthand: stamps the current module path as the tag.
macro_rules! plog {
    ($port:expr, $($rest:tt)*) => {
        $port.log_print(module_path!(), format_args!($($rest)*))
    };
}
