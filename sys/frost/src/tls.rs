// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Task-local storage: a fixed table of word-sized slots per task.
//!
//! Every operation takes an optional task; `None` resolves to the current
//! context, for use from inside a callback. When a task is deleted with live
//! storage, the engine releases it automatically.

use frost_abi::{Error, TaskId, TLS_SIZE};

use crate::engine::Engine;
use crate::task::{Tls, Word};

impl Engine {
    /// Allocates the storage table for `task` (or the current context).
    /// Allocating twice is accepted and keeps the existing table.
    pub fn tls_alloc(&mut self, task: Option<TaskId>) -> Result<(), Error> {
        let index = self.resolve(task)?;

        let task = self.sched.tasks.get_mut(index);
        if task.tls.is_some() {
            plog!(self.port(), "this task already allocated tls, skipping");
            return Ok(());
        }

        task.tls = Some(Tls::new());
        let name = self.sched.tasks.get(index).name;
        plog!(self.port(), "tls has allocated for task '{name}'");
        Ok(())
    }

    /// Releases the storage table for `task` (or the current context).
    /// Destroying when nothing is allocated is accepted.
    pub fn tls_destroy(&mut self, task: Option<TaskId>) -> Result<(), Error> {
        let index = self.resolve(task)?;

        let task = self.sched.tasks.get_mut(index);
        if task.tls.is_none() {
            plog!(self.port(), "this task has not allocated tls, skipping");
            return Ok(());
        }

        task.tls = None;
        let name = self.sched.tasks.get(index).name;
        plog!(self.port(), "clearing tls for task '{name}'");
        Ok(())
    }

    /// Checks whether `task` (or the current context) has storage allocated.
    pub fn tls_is_allocated(
        &self,
        task: Option<TaskId>,
    ) -> Result<bool, Error> {
        let index = self.resolve(task)?;
        Ok(self.sched.tasks.get(index).tls.is_some())
    }

    /// Stores `value` in slot `index` of the task's table.
    pub fn tls_set_value(
        &mut self,
        task: Option<TaskId>,
        index: usize,
        value: Word,
    ) -> Result<(), Error> {
        let slot = self.resolve(task)?;
        if index >= TLS_SIZE {
            return Err(Error::InvalidParameter);
        }

        let tls = self
            .sched
            .tasks
            .get_mut(slot)
            .tls
            .as_mut()
            .ok_or(Error::InvalidParameter)?;
        tls.table[index] = value;
        Ok(())
    }

    /// Reads slot `index` of the task's table.
    pub fn tls_get_value(
        &self,
        task: Option<TaskId>,
        index: usize,
    ) -> Result<Word, Error> {
        let slot = self.resolve(task)?;
        if index >= TLS_SIZE {
            return Err(Error::InvalidParameter);
        }

        let tls = self
            .sched
            .tasks
            .get(slot)
            .tls
            .as_ref()
            .ok_or(Error::InvalidParameter)?;
        Ok(tls.table[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{make_engine, noop};

    #[test]
    fn alloc_set_get() {
        let mut e = make_engine();
        let t = e.interval(1000, noop).unwrap();

        assert_eq!(e.tls_is_allocated(Some(t)), Ok(false));
        e.tls_alloc(Some(t)).unwrap();
        assert_eq!(e.tls_is_allocated(Some(t)), Ok(true));

        for i in 0..TLS_SIZE {
            e.tls_set_value(Some(t), i, i * 10).unwrap();
        }
        for i in 0..TLS_SIZE {
            assert_eq!(e.tls_get_value(Some(t), i), Ok(i * 10));
        }
    }

    #[test]
    fn alloc_is_idempotent() {
        let mut e = make_engine();
        let t = e.interval(1000, noop).unwrap();

        e.tls_alloc(Some(t)).unwrap();
        e.tls_set_value(Some(t), 0, 7).unwrap();
        // Second alloc must keep the existing table.
        e.tls_alloc(Some(t)).unwrap();
        assert_eq!(e.tls_get_value(Some(t), 0), Ok(7));

        e.tls_destroy(Some(t)).unwrap();
        // Destroying again is fine too.
        e.tls_destroy(Some(t)).unwrap();
        assert_eq!(e.tls_is_allocated(Some(t)), Ok(false));
    }

    #[test]
    fn out_of_range_index_is_refused() {
        let mut e = make_engine();
        let t = e.interval(1000, noop).unwrap();
        e.tls_alloc(Some(t)).unwrap();

        assert_eq!(
            e.tls_set_value(Some(t), TLS_SIZE, 1),
            Err(Error::InvalidParameter)
        );
        assert_eq!(
            e.tls_get_value(Some(t), TLS_SIZE),
            Err(Error::InvalidParameter)
        );
    }

    #[test]
    fn unallocated_access_is_refused() {
        let mut e = make_engine();
        let t = e.interval(1000, noop).unwrap();

        assert_eq!(
            e.tls_set_value(Some(t), 0, 1),
            Err(Error::InvalidParameter)
        );
        assert_eq!(e.tls_get_value(Some(t), 0), Err(Error::InvalidParameter));
    }

    #[test]
    fn no_context_outside_tasks() {
        let mut e = make_engine();
        assert_eq!(e.tls_alloc(None), Err(Error::InvalidParameter));
        assert_eq!(e.tls_get_value(None, 0), Err(Error::InvalidParameter));
    }

    #[test]
    fn released_with_the_task() {
        let mut e = make_engine();
        let t = e.interval(1000, noop).unwrap();
        e.tls_alloc(Some(t)).unwrap();
        e.tls_set_value(Some(t), 0, 99).unwrap();

        e.delete(t).unwrap();

        // The slot is reused by the next task; it must come up without
        // storage, not with the dead task's table.
        let t2 = e.interval(1000, noop).unwrap();
        assert_eq!(t2.index(), t.index());
        assert_eq!(e.tls_is_allocated(Some(t2)), Ok(false));
        // And the stale id no longer resolves at all.
        assert_eq!(e.tls_is_allocated(Some(t)), Err(Error::InvalidParameter));
    }
}
