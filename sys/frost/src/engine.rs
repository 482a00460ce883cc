// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The engine: task lifecycle and the scheduler pass.
//!
//! One call to [`Engine::schedule`] performs a single pass over the task
//! sequence from head to tail, firing whatever is due. The application's
//! outer loop calls `schedule` repeatedly; callbacks may call back into the
//! engine to yield (a nested `schedule`), create or delete tasks, use
//! channels, or block on an awaiter.
//!
//! Iteration safety under in-callback mutation comes from the dirty flag:
//! any task creation or deletion marks the scheduler dirty, and the pass in
//! progress stops right after the callback that caused it. The caller simply
//! starts a fresh pass. This is the only mechanism -- there is no snapshot
//! iteration and no deferred-deletion queue.

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;

use frost_abi::{Error, TaskFlags, TaskId};

use crate::awaiter::Awaiter;
use crate::port::Port;
use crate::task::{ArgList, Task, TaskEnum, TaskFn, TaskIndex, TaskTable, Word};

/// Scheduler state.
pub(crate) struct Scheduler {
    /// Every live task record, addressed by slot.
    pub tasks: TaskTable,
    /// The scheduling sequence: slot indices in head-to-tail order. Priority
    /// promotion reorders this; the slot arena never moves.
    pub order: Vec<TaskIndex>,
    /// The task currently executing, if a callback is on the stack.
    pub context: Option<TaskId>,
    /// Cached tick, refreshed as the pass visits each task.
    pub tick: u64,
    /// Set whenever the task sequence is mutated; makes the pass in progress
    /// stop so the caller restarts with a consistent view.
    pub is_dirty: bool,
    /// True after a pass in which no fired task had overrun its deadline.
    pub is_realtime: bool,
}

/// The cooperative task engine.
///
/// An `Engine` is an explicit value: there is no process-wide singleton.
/// Embedders construct one over their [`Port`], call [`Engine::init`], and
/// drive [`Engine::schedule`] from their outer loop.
pub struct Engine {
    pub(crate) port: Box<dyn Port>,
    initialized: bool,
    pub(crate) sched: Scheduler,
}

impl Engine {
    /// Creates an engine over `port`. The engine starts uninitialized;
    /// call [`Engine::init`] before anything else.
    pub fn new(port: impl Port + 'static) -> Self {
        Engine {
            port: Box::new(port),
            initialized: false,
            sched: Scheduler {
                tasks: TaskTable::new(),
                order: Vec::new(),
                context: None,
                tick: 0,
                is_dirty: false,
                is_realtime: false,
            },
        }
    }

    /// Brings the engine up. Idempotent; calling on an initialized engine
    /// succeeds without side effects.
    pub fn init(&mut self) -> Result<(), Error> {
        if self.initialized {
            return Ok(());
        }

        self.initialized = true;
        plog!(self.port, "global initialization finished");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Tears the engine down, deleting every remaining task first so their
    /// awaiters are canceled and their TLS and channels released. The engine
    /// may be initialized again afterwards.
    pub fn uninit(&mut self) -> Result<(), Error> {
        while let Some(&index) = self.sched.order.first() {
            let id = self.sched.tasks.id_for(index);
            if self.delete(id).is_err() {
                break;
            }
        }

        self.sched.context = None;
        self.sched.is_dirty = false;
        self.initialized = false;
        plog!(self.port, "global uninit");
        Ok(())
    }

    /// The task currently executing, if this is called from inside a
    /// callback (directly or through nested scheduling).
    pub fn context(&self) -> Option<TaskId> {
        self.sched.context
    }

    /// The awaiter of the currently executing task, if it has one. This is
    /// how an asynchronous task announces its own completion:
    /// `engine.current_awaiter().unwrap().finish(value)`.
    pub fn current_awaiter(&self) -> Option<Rc<Awaiter>> {
        let id = self.sched.context?;
        let index = self.sched.tasks.index_of(id)?;
        self.sched.tasks.get(index).awaiter.clone()
    }

    /// Current tick from the port clock.
    pub fn timetick(&self) -> u64 {
        self.port.time_tick()
    }

    /// True when the last completed pass saw no fired task overrun its
    /// deadline.
    pub fn is_realtime(&self) -> bool {
        self.sched.is_realtime
    }

    /// Number of tasks in the scheduling sequence.
    pub fn task_count(&self) -> usize {
        self.sched.order.len()
    }

    pub(crate) fn sched_tick(&self) -> u64 {
        self.sched.tick
    }

    pub(crate) fn port(&self) -> &dyn Port {
        &*self.port
    }

    /// Resolves an optional task reference: `Some` is validated against the
    /// table, `None` means the current context.
    pub(crate) fn resolve(
        &self,
        task: Option<TaskId>,
    ) -> Result<TaskIndex, Error> {
        let id = match task {
            Some(id) => id,
            None => self.sched.context.ok_or(Error::InvalidParameter)?,
        };
        self.sched.tasks.index_of(id).ok_or(Error::InvalidParameter)
    }

    /// Launches a one-shot asynchronous task with no arguments.
    ///
    /// The returned awaiter is owned by the caller; pass it to
    /// [`Engine::wait`] to join, and let it drop when done with the result.
    pub fn run(&mut self, func: TaskFn) -> Rc<Awaiter> {
        self.run_with_args(func, &[])
    }

    /// Launches a one-shot asynchronous task, capturing `args` by value.
    ///
    /// Failures (engine not initialized, too many arguments, task table
    /// exhausted) surface through an immediately-resolved awaiter so the
    /// caller has a single way to observe the outcome.
    pub fn run_with_args(
        &mut self,
        func: TaskFn,
        args: &[Word],
    ) -> Rc<Awaiter> {
        if !self.initialized {
            return Awaiter::resolved(0, Err(Error::NotInitialized));
        }

        let args = match ArgList::from_slice(args) {
            Ok(args) => args,
            Err(e) => return Awaiter::resolved(0, Err(e)),
        };

        let awaiter = Awaiter::pending();

        let mut task = Task::new("<async task>", func);
        task.args = args;
        task.awaiter = Some(Rc::clone(&awaiter));

        plog!(self.port, "create async task");

        let index = match self.sched.tasks.insert(task) {
            Ok((index, _)) => index,
            Err(e) => return Awaiter::resolved(0, Err(e)),
        };
        self.sched.order.push(index);

        self.mark_dirty();
        awaiter
    }

    /// Creates a periodic task firing every `interval_ms` milliseconds,
    /// starting one period from now.
    pub fn interval(
        &mut self,
        interval_ms: u64,
        func: TaskFn,
    ) -> Result<TaskId, Error> {
        if !self.initialized {
            return Err(Error::NotInitialized);
        }

        plog!(
            self.port,
            "create interval task, interval {interval_ms} ms"
        );

        let mut task = Task::new("<interval>", func);
        task.refill = true;
        task.interval = interval_ms;
        task.due_tick = self.port.time_tick().wrapping_add(interval_ms);
        task.score = interval_ms as i64;

        let (index, id) = self.sched.tasks.insert(task)?;
        self.sched.order.push(index);

        self.mark_dirty();
        Ok(id)
    }

    /// Deletes a task: detaches it from the scheduling sequence, cancels its
    /// awaiter if one is still pending, releases its TLS, and destroys its
    /// channel (notifying bound peers).
    ///
    /// The awaiter object itself is not released here -- the caller that
    /// launched the task holds the other handle and gets to read the final
    /// status.
    pub fn delete(&mut self, task: TaskId) -> Result<(), Error> {
        if !self.initialized {
            return Err(Error::NotInitialized);
        }
        let index = self
            .sched
            .tasks
            .index_of(task)
            .ok_or(Error::InvalidParameter)?;

        plog!(
            self.port,
            "perform task '{}' deletion",
            self.sched.tasks.get(index).name
        );

        // Detach from the run order first so teardown sweeps below cannot
        // revisit the dying task.
        self.sched.order.retain(|&i| i != index);

        if let Some(awaiter) = &self.sched.tasks.get(index).awaiter {
            if !awaiter.is_finished() {
                plog!(
                    self.port,
                    "awaiter is not finished, force marked as cancel state"
                );
                awaiter.cancel();
            }
        }

        if self.sched.tasks.get(index).tls.is_some() {
            plog!(
                self.port,
                "destroying a task that has not destroyed tls storage yet"
            );
        }

        if self.sched.tasks.get(index).inbox.is_some() {
            let _ = self.chan_destroy(Some(task));
        }

        self.sched.tasks.remove(index);

        self.mark_dirty();
        Ok(())
    }

    /// Replaces the task's flag set.
    pub fn set_flags(
        &mut self,
        task: TaskId,
        flags: TaskFlags,
    ) -> Result<(), Error> {
        if !self.initialized {
            return Err(Error::NotInitialized);
        }
        let index = self
            .sched
            .tasks
            .index_of(task)
            .ok_or(Error::InvalidParameter)?;
        self.sched.tasks.get_mut(index).flags = flags;
        Ok(())
    }

    /// Reads the task's flag set.
    pub fn flags(&self, task: TaskId) -> Result<TaskFlags, Error> {
        if !self.initialized {
            return Err(Error::NotInitialized);
        }
        let index = self
            .sched
            .tasks
            .index_of(task)
            .ok_or(Error::InvalidParameter)?;
        Ok(self.sched.tasks.get(index).flags)
    }

    /// Schedules other tasks until `duration_ms` of port time has elapsed.
    /// This grabs the scheduling rights from the caller, so due tasks keep
    /// running while the caller is parked.
    pub fn sleep(&mut self, duration_ms: u64) -> Result<(), Error> {
        let start = self.port.time_tick();
        let mut result = Ok(());

        while self.port.time_tick().wrapping_sub(start) < duration_ms {
            result = self.schedule();
            if result.is_err() {
                break;
            }
        }

        result
    }

    /// Voluntary yield from inside a callback: runs one scheduling pass so
    /// other due tasks get the context, then returns to the caller.
    pub fn yield_now(&mut self) -> Result<(), Error> {
        self.schedule()
    }

    /// Advances an external cursor over the task sequence. Returns the next
    /// task in head-to-tail order, or `Eof` past the end.
    pub fn enumerate(&self, cursor: &mut TaskEnum) -> Result<TaskId, Error> {
        if !self.initialized {
            return Err(Error::NotInitialized);
        }

        match self.sched.order.get(cursor.next_pos) {
            None => {
                cursor.task = None;
                Err(Error::Eof)
            }
            Some(&index) => {
                let id = self.sched.tasks.id_for(index);
                cursor.index = cursor.next_pos;
                cursor.task = Some(id);
                cursor.next_pos += 1;
                Ok(id)
            }
        }
    }

    fn mark_dirty(&mut self) {
        self.sched.is_dirty = true;
        plog!(self.port, "mark scheduler context as 'dirty' state");
        plog!(self.port, "current task size => {}", self.sched.order.len());
    }

    /// Performs one scheduling pass over the task sequence.
    ///
    /// For each task, in sequence order: skip it if it is the current
    /// context (no reentrant self-invocation) or gated by its freeze flags;
    /// otherwise refresh the tick and fire it if due. Periodic tasks get
    /// their due tick refilled after the fire; one-shot tasks are deleted.
    /// If the callback mutated the task sequence, the pass stops there and
    /// the caller starts a fresh one.
    ///
    /// Tasks that were not skipped take part in priority promotion: a task
    /// with less slack than the task before it swaps one position toward the
    /// head. Over successive passes this drifts starved tasks forward
    /// without ever sorting the whole sequence.
    pub fn schedule(&mut self) -> Result<(), Error> {
        if !self.initialized {
            return Err(Error::NotInitialized);
        }

        let mut is_realtime = true;
        let mut last_score: i64 = 0;

        let mut pos = 0;
        while pos < self.sched.order.len() {
            let index = self.sched.order[pos];
            let id = self.sched.tasks.id_for(index);

            // Do not invoke ourselves: a nested pass started from inside a
            // callback must not reenter that callback's task.
            let mut eligible = self.sched.context != Some(id);

            // Freeze gate.
            if eligible {
                let flags = self.sched.tasks.get(index).flags;
                if flags.contains(TaskFlags::FREEZE) {
                    if !flags.contains(TaskFlags::UNFREEZE_BY_CHAN_WRITE) {
                        eligible = false;
                    } else {
                        let mail = self
                            .sched
                            .tasks
                            .get(index)
                            .inbox
                            .as_ref()
                            .map(|inbox| !inbox.is_empty());
                        match mail {
                            None => {
                                eligible = false;
                                plog!(
                                    self.port,
                                    "task '{}' set 'unfreeze_by_chan_write' \
                                     but no channel allocated",
                                    self.sched.tasks.get(index).name
                                );
                            }
                            Some(false) => eligible = false,
                            Some(true) => {
                                // Mail is waiting: sync the task to the
                                // scheduler tick so it fires on this pass.
                                let tick = self.sched.tick;
                                self.sched.tasks.get_mut(index).due_tick =
                                    tick;
                            }
                        }
                    }
                }
            }

            if eligible {
                let now = self.port.time_tick();
                self.sched.tick = now;
                let measure_start = now;

                let (callback, args, refill, due, interval) = {
                    let task = self.sched.tasks.get(index);
                    (
                        task.callback,
                        task.args,
                        task.refill,
                        task.due_tick,
                        task.interval,
                    )
                };

                let mut fired = false;
                if interval == 0 || now >= due {
                    fired = true;

                    #[cfg(feature = "debug-fire")]
                    {
                        self.sched.tasks.get_mut(index).fire += 1;
                    }

                    // Install the task as current context for the duration
                    // of the callback, restoring whatever was there (the
                    // parent task, for nested passes).
                    let previous = self.sched.context.replace(id);
                    callback(self, &args);
                    self.sched.context = previous;

                    if refill {
                        // The callback may have deleted its own task; only a
                        // live record gets a refill.
                        if let Some(task) =
                            self.sched.tasks.get_mut_checked(id)
                        {
                            if task.score > 0 {
                                // Ran ahead of schedule: keep the phase.
                                task.due_tick =
                                    task.due_tick.wrapping_add(task.interval);
                            } else {
                                // Ran behind: defer by the last measured
                                // execution cost so backlog does not
                                // compound.
                                task.due_tick = self
                                    .sched
                                    .tick
                                    .wrapping_sub(task.exec_time)
                                    .wrapping_add(task.interval);
                            }
                        }
                        if let Some(task) =
                            self.sched.tasks.get_mut_checked(id)
                        {
                            let now2 = self.port.time_tick();
                            self.sched.tick = now2;
                            task.exec_time = now2.wrapping_sub(measure_start);
                            task.score =
                                task.due_tick as i64 - now2 as i64;
                        }
                    } else {
                        // One-shot: remove after the single fire. If the
                        // callback already deleted itself this is a stale id
                        // and quietly does nothing.
                        let _ = self.delete(id);
                    }

                    // If the task sequence changed under us (task created or
                    // deleted in the callback), drop the pass; the caller
                    // will start over with a consistent view.
                    if self.sched.is_dirty {
                        plog!(
                            self.port,
                            "scheduler has been marked as 'dirty' state, \
                             reset context"
                        );
                        self.sched.context = None;
                        self.sched.is_dirty = false;
                        return Ok(());
                    }
                }

                // Priority promotion: one bubble step per pass.
                let score = self.sched.tasks.get(index).score;
                if score < last_score && pos > 0 {
                    self.sched.order.swap(pos - 1, pos);
                }
                last_score = score;

                if fired && score < 0 {
                    is_realtime = false;
                }
            }

            self.sched.is_realtime = is_realtime;
            pos += 1;
        }

        self.sched.context = None;
        Ok(())
    }
}
