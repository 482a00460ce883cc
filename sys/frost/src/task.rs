// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Task records and the slot table that owns them.

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;

use frost_abi::{
    Error, Generation, TaskFlags, TaskId, MAX_TASK_ARGS, TLS_SIZE,
};
use slabq::SlabQ;

use crate::awaiter::Awaiter;
use crate::chan::Pack;
use crate::engine::Engine;

/// An opaque machine word passed to task callbacks.
pub type Word = usize;

/// Task callback signature.
///
/// Callbacks receive the engine (to create tasks, yield, use channels, and so
/// on) and the argument list captured when the task was created. Interval
/// callbacks are created without arguments and should ignore the list.
pub type TaskFn = fn(&mut Engine, &ArgList);

/// Fixed-capacity argument list captured by value at task creation.
#[derive(Copy, Clone, Default)]
pub struct ArgList {
    len: u8,
    words: [Word; MAX_TASK_ARGS],
}

impl ArgList {
    /// Captures `words` by value. Refuses lists longer than
    /// [`MAX_TASK_ARGS`].
    pub fn from_slice(words: &[Word]) -> Result<Self, Error> {
        if words.len() > MAX_TASK_ARGS {
            return Err(Error::InvalidParameter);
        }
        let mut args = Self::default();
        args.len = words.len() as u8;
        args.words[..words.len()].copy_from_slice(words);
        Ok(args)
    }

    /// The captured words.
    pub fn as_slice(&self) -> &[Word] {
        &self.words[..usize::from(self.len)]
    }

    /// The captured word at `index`, if present.
    pub fn get(&self, index: usize) -> Option<Word> {
        self.as_slice().get(index).copied()
    }

    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Per-task fixed scratch table.
#[derive(Debug)]
pub(crate) struct Tls {
    pub table: [Word; TLS_SIZE],
}

impl Tls {
    pub fn new() -> Box<Self> {
        Box::new(Tls {
            table: [0; TLS_SIZE],
        })
    }
}

/// Internal representation of a task.
pub(crate) struct Task {
    /// Display name, used in log lines.
    pub name: &'static str,
    /// User callback fired by the scheduler.
    pub callback: TaskFn,
    /// Arguments captured at creation, forwarded to every fire.
    pub args: ArgList,
    /// Behavior flags.
    pub flags: TaskFlags,
    /// Firing period in milliseconds; zero means "fire on every pass", which
    /// is what one-shot tasks use.
    pub interval: u64,
    /// Tick at which this task is next due.
    pub due_tick: u64,
    /// Whether the due tick is refilled after a fire (periodic) or the task
    /// is deleted (one-shot).
    pub refill: bool,
    /// Duration of the last fire, in ticks.
    pub exec_time: u64,
    /// Signed slack measured after the last fire: positive means the task ran
    /// ahead of its deadline, negative means it overran.
    pub score: i64,
    /// Join handle shared with the caller of `run`, if this task was
    /// launched asynchronously.
    pub awaiter: Option<Rc<Awaiter>>,
    /// Task-local storage, if allocated.
    pub tls: Option<Box<Tls>>,
    /// Channel inbox, if allocated.
    pub inbox: Option<SlabQ<Rc<Pack>>>,
    /// Broadcast fan-out set. `None` means no bind list was ever created,
    /// which is distinct from an allocated-but-empty list: broadcasting
    /// without a list is a channel-state error, broadcasting to an empty one
    /// merely finds no takers.
    pub binds: Option<Vec<TaskId>>,
    /// Number of times this task has fired.
    #[cfg(feature = "debug-fire")]
    pub fire: u64,
}

impl Task {
    pub fn new(name: &'static str, callback: TaskFn) -> Self {
        Task {
            name,
            callback,
            args: ArgList::default(),
            flags: TaskFlags::empty(),
            interval: 0,
            due_tick: 0,
            refill: false,
            exec_time: 0,
            score: 0,
            awaiter: None,
            tls: None,
            inbox: None,
            binds: None,
            #[cfg(feature = "debug-fire")]
            fire: 0,
        }
    }
}

/// Index of a slot in the task table. Only valid while the slot stays
/// occupied; use [`TaskId`] for anything held across scheduling.
pub(crate) type TaskIndex = usize;

struct Slot {
    gen: Generation,
    task: Option<Task>,
}

/// Slot arena owning every task record.
///
/// Slots are reused after deletion, but each reuse bumps the slot's
/// generation, so a `TaskId` minted for the old occupant stops resolving.
pub(crate) struct TaskTable {
    slots: Vec<Slot>,
}

impl TaskTable {
    /// Upper bound on live tasks, imposed by the index field of `TaskId`.
    const MAX_TASKS: usize = TaskId::INDEX_MASK as usize + 1;

    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Stores `task` in a free slot and returns its index and ID.
    pub fn insert(&mut self, task: Task) -> Result<(TaskIndex, TaskId), Error> {
        let index = match self.slots.iter().position(|s| s.task.is_none()) {
            Some(i) => {
                self.slots[i].task = Some(task);
                i
            }
            None => {
                if self.slots.len() >= Self::MAX_TASKS {
                    return Err(Error::OutOfMemory);
                }
                self.slots.push(Slot {
                    gen: Generation::default(),
                    task: Some(task),
                });
                self.slots.len() - 1
            }
        };
        Ok((index, self.id_for(index)))
    }

    /// Removes the task at `index`, bumping the slot generation so stale IDs
    /// stop resolving.
    pub fn remove(&mut self, index: TaskIndex) -> Option<Task> {
        let slot = self.slots.get_mut(index)?;
        let task = slot.task.take()?;
        slot.gen = slot.gen.next();
        Some(task)
    }

    /// Fabricates the current `TaskId` for an occupied slot.
    pub fn id_for(&self, index: TaskIndex) -> TaskId {
        TaskId::for_index_and_gen(index, self.slots[index].gen)
    }

    /// Resolves `id` to a slot index, refusing out-of-range indices, stale
    /// generations, and empty slots alike.
    pub fn index_of(&self, id: TaskId) -> Option<TaskIndex> {
        let slot = self.slots.get(id.index())?;
        if slot.gen != id.generation() || slot.task.is_none() {
            return None;
        }
        Some(id.index())
    }

    pub fn get(&self, index: TaskIndex) -> &Task {
        self.slots[index].task.as_ref().expect("slot vacated")
    }

    pub fn get_mut(&mut self, index: TaskIndex) -> &mut Task {
        self.slots[index].task.as_mut().expect("slot vacated")
    }

    /// Re-resolves `id` after user code ran; the task may have been deleted
    /// (and the slot possibly reused) in the meantime.
    pub fn get_mut_checked(&mut self, id: TaskId) -> Option<&mut Task> {
        let index = self.index_of(id)?;
        Some(self.get_mut(index))
    }
}

/// External cursor for walking the task sequence.
///
/// The first call to [`Engine::enumerate`] yields the head of the sequence;
/// each subsequent call advances. Creating or deleting tasks in the middle of
/// a walk invalidates the cursor's position in unspecified ways, so finish
/// the walk first.
#[derive(Default)]
pub struct TaskEnum {
    pub(crate) next_pos: usize,
    /// Zero-based position of the task last yielded.
    pub index: usize,
    /// The task last yielded.
    pub task: Option<TaskId>,
}

impl TaskEnum {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &mut Engine, _: &ArgList) {}

    #[test]
    fn arg_list_capture() {
        let args = ArgList::from_slice(&[1, 2, 3]).unwrap();
        assert_eq!(args.as_slice(), &[1, 2, 3]);
        assert_eq!(args.get(2), Some(3));
        assert_eq!(args.get(3), None);
        assert_eq!(args.len(), 3);
    }

    #[test]
    fn arg_list_refuses_overflow() {
        let too_many = [0usize; MAX_TASK_ARGS + 1];
        assert_eq!(
            ArgList::from_slice(&too_many),
            Err(Error::InvalidParameter)
        );
        // Exactly at capacity is fine.
        assert!(ArgList::from_slice(&[0; MAX_TASK_ARGS]).is_ok());
    }

    impl PartialEq for ArgList {
        fn eq(&self, other: &Self) -> bool {
            self.as_slice() == other.as_slice()
        }
    }
    impl core::fmt::Debug for ArgList {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            self.as_slice().fmt(f)
        }
    }

    #[test]
    fn stale_ids_stop_resolving_after_remove() {
        let mut table = TaskTable::new();
        let (index, id) = table.insert(Task::new("a", noop)).unwrap();
        assert_eq!(table.index_of(id), Some(index));

        table.remove(index).unwrap();
        assert_eq!(table.index_of(id), None);

        // Reusing the slot mints a different generation.
        let (index2, id2) = table.insert(Task::new("b", noop)).unwrap();
        assert_eq!(index2, index);
        assert_ne!(id2, id);
        assert_eq!(table.index_of(id2), Some(index2));
        assert_eq!(table.index_of(id), None);
    }

    #[test]
    fn out_of_range_ids_do_not_resolve() {
        let table = TaskTable::new();
        let id = TaskId::for_index_and_gen(3, Generation::default());
        assert_eq!(table.index_of(id), None);
    }
}
