// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Channels: per-task ring-buffered inboxes with direct and broadcast
//! writes.
//!
//! A task acquires an inbox with [`Engine::chan_alloc`]. Binds form a
//! directed graph over tasks: after `bind(A, B)`, a broadcast write by A
//! fans the packet out to B (and every other task in A's bind list). Binds
//! hold task identities, not the tasks themselves: a peer that disappears is
//! detected by its stale [`TaskId`] and skipped at write time.
//!
//! Packets are retained on the heap once and shared between all accepting
//! inboxes through `Rc`; the strong count is exactly the subscriber
//! reference count of the packet. Every reader releases its reference with
//! [`Engine::free_pack`], and the last release frees the body.
//!
//! Inboxes refuse writes at capacity. There is no backpressure or retry
//! machinery; a caller that sees [`Error::Full`] decides whether to drop or
//! retry.

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;

use frost_abi::{ChanCtl, Error, TaskId, CHAN_RING_DEPTH};
use serde::Serialize;
use slabq::SlabQ;
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::engine::Engine;

/// Scratch size for marshalling structured payloads.
const PACK_SCRATCH: usize = 256;

/// A channel message, retained on the heap and shared between every inbox
/// that accepted it.
pub struct Pack {
    /// Identity of the writer, stamped at write time when the writer had a
    /// task context. `Close` packets carry the departing peer here instead.
    pub from: Option<TaskId>,
    /// Data or close notification.
    pub ctrl: ChanCtl,
    /// Payload bytes, deep-copied from the caller's buffer at write time.
    pub data: Box<[u8]>,
}

impl Pack {
    /// Reinterprets the payload as a plain-old-data value.
    pub fn read_as<T: FromBytes>(&self) -> Result<T, Error> {
        T::read_from_bytes(&self.data).map_err(|_| Error::InvalidParameter)
    }

    /// Unmarshals the payload written by [`Engine::chan_send`].
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, Error> {
        ssmarshal::deserialize(&self.data)
            .map(|(value, _)| value)
            .map_err(|_| Error::InvalidParameter)
    }
}

impl Engine {
    /// Allocates an inbox (capacity [`CHAN_RING_DEPTH`]) on `task`, or the
    /// current context. Fails if the task already has one.
    pub fn chan_alloc(&mut self, task: Option<TaskId>) -> Result<(), Error> {
        let index = self.resolve(task)?;

        let task = self.sched.tasks.get_mut(index);
        if task.inbox.is_some() {
            return Err(Error::InvalidParameter);
        }
        task.inbox = Some(SlabQ::new(CHAN_RING_DEPTH));

        plog!(
            self.port,
            "chan inbox has allocated for task '{}'",
            self.sched.tasks.get(index).name
        );
        Ok(())
    }

    /// Checks whether `task` (or the current context) has an inbox.
    pub fn chan_is_allocated(
        &self,
        task: Option<TaskId>,
    ) -> Result<bool, Error> {
        let index = self.resolve(task)?;
        Ok(self.sched.tasks.get(index).inbox.is_some())
    }

    /// Binds `a` to `b` (A -> B): subsequent broadcast writes by A fan out
    /// to B. The reverse direction is not implied. `a` of `None` means the
    /// current context.
    pub fn chan_bind(
        &mut self,
        a: Option<TaskId>,
        b: TaskId,
    ) -> Result<(), Error> {
        let a_index = self.resolve(a)?;
        // The peer must exist now; whether it has an inbox is checked at
        // write time, so binding ahead of the peer's chan_alloc is fine.
        self.resolve(Some(b))?;

        let task = self.sched.tasks.get_mut(a_index);
        task.binds.get_or_insert_with(Vec::new).push(b);
        Ok(())
    }

    /// Binds both directions between `a` and `b` (A <-> B), allowing echo.
    pub fn chan_crossbind(
        &mut self,
        a: Option<TaskId>,
        b: TaskId,
    ) -> Result<(), Error> {
        let a_index = self.resolve(a)?;
        let a_id = self.sched.tasks.id_for(a_index);

        self.chan_bind(Some(a_id), b)?;
        self.chan_bind(Some(b), a_id)?;
        Ok(())
    }

    /// Writes `data` as a packet.
    ///
    /// With `target` set, the packet goes into that task's inbox; without a
    /// target it is broadcast to every task in the caller's bind list that
    /// has an inbox with room. Broadcast requires a task context and a bind
    /// list, and reports [`Error::Full`] when not a single peer accepted.
    /// There is no retry policy; the caller drops or retries explicitly.
    pub fn chan_write(
        &mut self,
        target: Option<TaskId>,
        data: &[u8],
    ) -> Result<(), Error> {
        self.chan_write_pack(target, ChanCtl::Ok, None, data)
    }

    /// Writes a plain-old-data value as a packet, using its byte
    /// representation directly.
    pub fn chan_write_value<T: IntoBytes + Immutable>(
        &mut self,
        target: Option<TaskId>,
        value: &T,
    ) -> Result<(), Error> {
        self.chan_write(target, value.as_bytes())
    }

    /// Marshals `value` and writes it as a packet. The receiver unmarshals
    /// with [`Pack::decode`].
    pub fn chan_send<T: Serialize>(
        &mut self,
        target: Option<TaskId>,
        value: &T,
    ) -> Result<(), Error> {
        let mut scratch = [0u8; PACK_SCRATCH];
        let len = ssmarshal::serialize(&mut scratch, value)
            .map_err(|_| Error::OutOfMemory)?;
        self.chan_write(target, &scratch[..len])
    }

    /// Full write path, including control byte and explicit origin. `from`
    /// of `None` stamps the caller's context (when there is one); teardown
    /// pre-sets the departing peer instead.
    pub(crate) fn chan_write_pack(
        &mut self,
        target: Option<TaskId>,
        ctrl: ChanCtl,
        from: Option<TaskId>,
        data: &[u8],
    ) -> Result<(), Error> {
        match target {
            // Broadcast over the caller's bind list.
            None => {
                let caller = match self.sched.context {
                    Some(id) => id,
                    None => {
                        plog!(
                            self.port,
                            "intended to write an invalid chan from \
                             outside any task context"
                        );
                        return Err(Error::InvalidChan);
                    }
                };
                let caller_index = self
                    .sched
                    .tasks
                    .index_of(caller)
                    .ok_or(Error::InvalidChan)?;

                let binds = match &self.sched.tasks.get(caller_index).binds {
                    Some(binds) => binds.clone(),
                    None => {
                        plog!(
                            self.port,
                            "task '{}' intended to write an invalid chan",
                            self.sched.tasks.get(caller_index).name
                        );
                        return Err(Error::InvalidChan);
                    }
                };

                // Retain the packet on the heap; every accepting inbox gets
                // one reference.
                let pack = Rc::new(Pack {
                    from: from.or(Some(caller)),
                    ctrl,
                    data: data.into(),
                });

                let mut accepted = 0u32;
                for peer in binds {
                    let Some(peer_index) = self.sched.tasks.index_of(peer)
                    else {
                        // Peer departed since binding; identity no longer
                        // resolves.
                        continue;
                    };
                    let peer_task = self.sched.tasks.get_mut(peer_index);
                    let Some(inbox) = peer_task.inbox.as_mut() else {
                        continue;
                    };
                    match inbox.put(Rc::clone(&pack)) {
                        Ok(()) => {
                            accepted += 1;
                            plog!(
                                self.port,
                                "chanpack: write flow -> '{}'",
                                self.sched.tasks.get(peer_index).name
                            );
                        }
                        Err(_) => {
                            plog!(
                                self.port,
                                "chanpack put refused, peer '{}' inbox full",
                                self.sched.tasks.get(peer_index).name
                            );
                        }
                    }
                }

                // Nobody took it: release the retained packet and tell the
                // caller.
                if accepted == 0 {
                    return Err(Error::Full);
                }
                Ok(())
            }

            // Direct write into one task's inbox.
            Some(target) => {
                let from = from.or(self.sched.context);
                let index = self
                    .sched
                    .tasks
                    .index_of(target)
                    .ok_or(Error::InvalidChan)?;

                let pack = Rc::new(Pack {
                    from,
                    ctrl,
                    data: data.into(),
                });

                let task = self.sched.tasks.get_mut(index);
                let inbox =
                    task.inbox.as_mut().ok_or(Error::InvalidChan)?;
                inbox.put(pack).map_err(|_| Error::Full)
            }
        }
    }

    /// Reads the next packet from the current task's inbox.
    ///
    /// Returns `Eof` when the inbox is empty. A `Close` packet additionally
    /// removes the departing peer (named in `pack.from`) from the caller's
    /// bind list -- the client side of unbinding on peer departure. The
    /// caller must release every packet it reads with [`Engine::free_pack`].
    pub fn chan_read(&mut self) -> Result<Rc<Pack>, Error> {
        let caller =
            self.sched.context.ok_or(Error::InvalidChan)?;
        let index = self
            .sched
            .tasks
            .index_of(caller)
            .ok_or(Error::InvalidChan)?;

        let task = self.sched.tasks.get_mut(index);
        let inbox = task.inbox.as_mut().ok_or(Error::InvalidChan)?;

        let pack = inbox.pop().ok_or(Error::Eof)?;

        if pack.ctrl == ChanCtl::Close {
            if let Some(departed) = pack.from {
                if let Some(binds) = task.binds.as_mut() {
                    binds.retain(|&peer| peer != departed);
                }
            }
        }

        plog!(
            self.port,
            "chanpack: read flow '{}', refs {}",
            self.sched.tasks.get(index).name,
            Rc::strong_count(&pack)
        );

        Ok(pack)
    }

    /// Releases one reference to a packet obtained from
    /// [`Engine::chan_read`]. The packet body is freed when the last inbox
    /// or reader reference goes.
    pub fn free_pack(&self, pack: Rc<Pack>) {
        if Rc::strong_count(&pack) == 1 {
            plog!(self.port, "chanpack: destroyed");
        }
        drop(pack);
    }

    /// Unbinds `a` and `b`, both directions.
    ///
    /// For each direction X -> Y where X's bind list contains Y and Y has an
    /// inbox, the entry is removed from X's bind list and a `Close` packet
    /// naming Y is written into X's inbox, so X finds out its peer is gone
    /// the next time it reads. Direction A -> B is processed first for
    /// deterministic teardown.
    pub fn chan_unbind(&mut self, a: TaskId, b: TaskId) -> Result<(), Error> {
        let a_index = self
            .sched
            .tasks
            .index_of(a)
            .ok_or(Error::InvalidParameter)?;
        let b_index = self
            .sched
            .tasks
            .index_of(b)
            .ok_or(Error::InvalidParameter)?;

        // A -> B
        if self.bound(a_index, b)
            && self.sched.tasks.get(b_index).inbox.is_some()
        {
            plog!(self.port, "task unbinding with channel peer");
            self.unbind_entry(a_index, b);
            let _ = self.chan_write_pack(Some(a), ChanCtl::Close, Some(b), &[]);
        }

        // B -> A
        if self.bound(b_index, a)
            && self.sched.tasks.get(a_index).inbox.is_some()
        {
            plog!(self.port, "task unbinding with channel peer");
            self.unbind_entry(b_index, a);
            let _ = self.chan_write_pack(Some(b), ChanCtl::Close, Some(a), &[]);
        }

        Ok(())
    }

    /// Destroys the channel of `task` (or the current context): notifies
    /// every surviving peer that holds a bind to it, drains whatever is left
    /// in its inbox, and releases both the inbox and the bind list.
    pub fn chan_destroy(&mut self, task: Option<TaskId>) -> Result<(), Error> {
        let index = self.resolve(task)?;
        let id = self.sched.tasks.id_for(index);

        if self.sched.tasks.get(index).inbox.is_none() {
            return Err(Error::InvalidParameter);
        }

        // Sweep the task sequence and unbind everyone else from the dying
        // task; this is what delivers the Close notifications.
        let others: Vec<TaskId> = self
            .sched
            .order
            .iter()
            .map(|&i| self.sched.tasks.id_for(i))
            .filter(|&other| other != id)
            .collect();
        for other in others {
            let _ = self.chan_unbind(other, id);
        }

        // Unread packets lose their reference from this inbox.
        let task = self.sched.tasks.get_mut(index);
        if let Some(inbox) = task.inbox.as_mut() {
            if !inbox.is_empty() {
                plog!(
                    self.port,
                    "task has unread channel packs, do clean"
                );
            }
        }
        loop {
            let task = self.sched.tasks.get_mut(index);
            let Some(pack) = task.inbox.as_mut().and_then(|q| q.pop()) else {
                break;
            };
            self.free_pack(pack);
        }

        let task = self.sched.tasks.get_mut(index);
        task.binds = None;
        task.inbox = None;
        Ok(())
    }

    /// Whether the bind list of the task at `index` contains `peer`. This
    /// compares against the queried peer identity.
    fn bound(&self, index: crate::task::TaskIndex, peer: TaskId) -> bool {
        self.sched
            .tasks
            .get(index)
            .binds
            .as_ref()
            .is_some_and(|binds| binds.contains(&peer))
    }

    fn unbind_entry(&mut self, index: crate::task::TaskIndex, peer: TaskId) {
        if let Some(binds) = self.sched.tasks.get_mut(index).binds.as_mut() {
            if let Some(pos) = binds.iter().position(|&p| p == peer) {
                binds.remove(pos);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::task::ArgList;
    use crate::testutil::{make_engine, noop};
    use core::cell::{Cell, RefCell};
    use std::rc::Weak;
    use std::vec::Vec;

    thread_local! {
        // Packets stashed by reader callbacks, with the reference count
        // observed at read time.
        static STASH: RefCell<Vec<(Rc<Pack>, usize)>> =
            const { RefCell::new(Vec::new()) };
        static SENT: Cell<bool> = const { Cell::new(false) };
    }

    fn reader(e: &mut Engine, _: &ArgList) {
        if let Ok(pack) = e.chan_read() {
            let refs = Rc::strong_count(&pack);
            STASH.with(|s| s.borrow_mut().push((pack, refs)));
        }
    }

    fn broadcast_seven(e: &mut Engine, _: &ArgList) {
        SENT.with(|s| {
            if !s.get() {
                s.set(true);
                e.chan_write(None, &[7]).unwrap();
            }
        });
    }

    #[test]
    fn broadcast_fan_out() {
        let mut e = make_engine();
        let a = e.interval(0, broadcast_seven).unwrap();
        let b = e.interval(0, reader).unwrap();
        let c = e.interval(0, reader).unwrap();

        e.chan_alloc(Some(b)).unwrap();
        e.chan_alloc(Some(c)).unwrap();
        e.chan_bind(Some(a), b).unwrap();
        e.chan_bind(Some(a), c).unwrap();

        // Creation left the scheduler dirty; nothing fires in this pass
        // beyond clearing it... except everything is due (interval 0), so
        // the first fire is the broadcast and the pass restarts.
        e.schedule().unwrap();
        // Fresh pass: both readers drain their inboxes.
        e.schedule().unwrap();

        let observed = STASH.with(|s| {
            s.borrow()
                .iter()
                .map(|(pack, refs)| {
                    (pack.data.to_vec(), pack.from, pack.ctrl, *refs)
                })
                .collect::<Vec<_>>()
        });
        assert_eq!(observed.len(), 2, "both subscribers read the packet");
        for (data, from, ctrl, refs) in observed {
            assert_eq!(data, [7]);
            assert_eq!(from, Some(a));
            assert_eq!(ctrl, ChanCtl::Ok);
            // One reference per holder: the other subscriber still holds
            // one, this reader holds the other.
            assert_eq!(refs, 2);
        }

        // Releasing both references frees the packet exactly once.
        let weak: Weak<Pack> =
            STASH.with(|s| Rc::downgrade(&s.borrow()[0].0));
        STASH.with(|s| {
            for (pack, _) in s.borrow_mut().drain(..) {
                e.free_pack(pack);
            }
        });
        assert!(weak.upgrade().is_none(), "packet body not released");
    }

    #[test]
    fn broadcast_without_bind_list_is_invalid() {
        let mut e = make_engine();
        // Outside any task context.
        assert_eq!(e.chan_write(None, &[1]), Err(Error::InvalidChan));
    }

    fn broadcast_expect_invalid(e: &mut Engine, _: &ArgList) {
        assert_eq!(e.chan_write(None, &[1]), Err(Error::InvalidChan));
    }

    #[test]
    fn broadcast_from_unbound_task_is_invalid() {
        let mut e = make_engine();
        e.interval(0, broadcast_expect_invalid).unwrap();
        e.schedule().unwrap();
    }

    fn broadcast_expect_full(e: &mut Engine, _: &ArgList) {
        assert_eq!(e.chan_write(None, &[1]), Err(Error::Full));
    }

    #[test]
    fn broadcast_with_no_accepting_peer_reports_full() {
        let mut e = make_engine();
        let a = e.interval(0, broadcast_expect_full).unwrap();
        // Bound peer without an inbox: skipped, so nobody accepts.
        let b = e.interval(1000, noop).unwrap();
        e.chan_bind(Some(a), b).unwrap();
        e.schedule().unwrap();
    }

    #[test]
    fn broadcast_skips_departed_peers() {
        let mut e = make_engine();
        let a = e.interval(0, broadcast_expect_full).unwrap();
        let b = e.interval(1000, noop).unwrap();
        e.chan_alloc(Some(b)).unwrap();
        e.chan_bind(Some(a), b).unwrap();

        // The peer disappears; its stale id must be skipped, leaving no
        // acceptor.
        e.delete(b).unwrap();
        e.schedule().unwrap();
    }

    #[test]
    fn direct_write_fills_up() {
        let mut e = make_engine();
        let t = e.interval(1000, noop).unwrap();
        e.chan_alloc(Some(t)).unwrap();

        for i in 0..CHAN_RING_DEPTH {
            assert_eq!(e.chan_write(Some(t), &[i as u8]), Ok(()));
        }
        assert_eq!(e.chan_write(Some(t), &[0xff]), Err(Error::Full));
    }

    #[test]
    fn direct_write_requires_an_inbox() {
        let mut e = make_engine();
        let t = e.interval(1000, noop).unwrap();
        assert_eq!(e.chan_write(Some(t), &[1]), Err(Error::InvalidChan));

        e.chan_alloc(Some(t)).unwrap();
        assert_eq!(e.chan_write(Some(t), &[1]), Ok(()));

        // Stale target ids look like a missing channel, not a crash.
        e.delete(t).unwrap();
        assert_eq!(e.chan_write(Some(t), &[1]), Err(Error::InvalidChan));
    }

    #[test]
    fn alloc_twice_is_refused() {
        let mut e = make_engine();
        let t = e.interval(1000, noop).unwrap();
        assert_eq!(e.chan_is_allocated(Some(t)), Ok(false));
        e.chan_alloc(Some(t)).unwrap();
        assert_eq!(e.chan_is_allocated(Some(t)), Ok(true));
        assert_eq!(e.chan_alloc(Some(t)), Err(Error::InvalidParameter));
    }

    #[test]
    fn read_outside_context_is_invalid() {
        let mut e = make_engine();
        assert_eq!(e.chan_read().err(), Some(Error::InvalidChan));
    }

    #[test]
    fn close_propagates_on_destroy() {
        let mut e = make_engine();
        let a = e.interval(1000, noop).unwrap();
        let b = e.interval(1000, noop).unwrap();
        e.chan_alloc(Some(a)).unwrap();
        e.chan_alloc(Some(b)).unwrap();
        e.chan_crossbind(Some(a), b).unwrap();

        e.chan_destroy(Some(a)).unwrap();
        assert_eq!(e.chan_is_allocated(Some(a)), Ok(false));

        // B's next read yields the departure notification...
        e.sched.context = Some(b);
        let pack = e.chan_read().unwrap();
        assert_eq!(pack.ctrl, ChanCtl::Close);
        assert_eq!(pack.from, Some(a));

        // ...and B no longer holds a bind to A.
        let b_index = e.sched.tasks.index_of(b).unwrap();
        let binds = e.sched.tasks.get(b_index).binds.as_ref().unwrap();
        assert!(binds.is_empty());

        // Nothing further in the inbox.
        assert_eq!(e.chan_read().err(), Some(Error::Eof));
        e.sched.context = None;
        e.free_pack(pack);
    }

    #[test]
    fn close_reaches_one_directional_subscribers() {
        let mut e = make_engine();
        let a = e.interval(1000, noop).unwrap();
        let b = e.interval(1000, noop).unwrap();
        e.chan_alloc(Some(a)).unwrap();
        e.chan_alloc(Some(b)).unwrap();
        // Only B -> A: B broadcasts to A, A never writes back.
        e.chan_bind(Some(b), a).unwrap();

        e.chan_destroy(Some(a)).unwrap();

        e.sched.context = Some(b);
        let pack = e.chan_read().unwrap();
        assert_eq!(pack.ctrl, ChanCtl::Close);
        assert_eq!(pack.from, Some(a));
        e.sched.context = None;
        e.free_pack(pack);
    }

    #[test]
    fn unbind_notifies_both_sides() {
        let mut e = make_engine();
        let a = e.interval(1000, noop).unwrap();
        let b = e.interval(1000, noop).unwrap();
        e.chan_alloc(Some(a)).unwrap();
        e.chan_alloc(Some(b)).unwrap();
        e.chan_crossbind(Some(a), b).unwrap();

        e.chan_unbind(a, b).unwrap();

        for (reader_task, departed) in [(a, b), (b, a)] {
            e.sched.context = Some(reader_task);
            let pack = e.chan_read().unwrap();
            assert_eq!(pack.ctrl, ChanCtl::Close);
            assert_eq!(pack.from, Some(departed));
            e.free_pack(pack);
            e.sched.context = None;
        }
    }

    #[test]
    fn destroy_drains_unread_packets() {
        let mut e = make_engine();
        let t = e.interval(1000, noop).unwrap();
        e.chan_alloc(Some(t)).unwrap();
        e.chan_write(Some(t), &[1, 2, 3]).unwrap();
        e.chan_write(Some(t), &[4]).unwrap();

        e.chan_destroy(Some(t)).unwrap();
        assert_eq!(e.chan_is_allocated(Some(t)), Ok(false));
        // A second destroy has nothing to work on.
        assert_eq!(e.chan_destroy(Some(t)), Err(Error::InvalidParameter));
    }

    #[test]
    fn direct_write_from_outside_carries_no_origin() {
        let mut e = make_engine();
        let t = e.interval(1000, noop).unwrap();
        e.chan_alloc(Some(t)).unwrap();
        e.chan_write(Some(t), &[9]).unwrap();

        e.sched.context = Some(t);
        let pack = e.chan_read().unwrap();
        assert_eq!(pack.from, None);
        assert_eq!(&*pack.data, &[9]);
        e.sched.context = None;
        e.free_pack(pack);
    }

    #[derive(
        Debug,
        PartialEq,
        zerocopy_derive::IntoBytes,
        zerocopy_derive::FromBytes,
        zerocopy_derive::Immutable,
    )]
    #[repr(C)]
    struct Reading {
        channel: u32,
        millivolts: u32,
    }

    #[test]
    fn pod_payloads_round_trip() {
        let mut e = make_engine();
        let t = e.interval(1000, noop).unwrap();
        e.chan_alloc(Some(t)).unwrap();

        let out = Reading {
            channel: 3,
            millivolts: 3300,
        };
        e.chan_write_value(Some(t), &out).unwrap();

        e.sched.context = Some(t);
        let pack = e.chan_read().unwrap();
        assert_eq!(pack.read_as::<Reading>().unwrap(), out);
        e.sched.context = None;
        e.free_pack(pack);
    }

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Command {
        opcode: u8,
        arg: u32,
    }

    #[test]
    fn marshalled_payloads_round_trip() {
        let mut e = make_engine();
        let t = e.interval(1000, noop).unwrap();
        e.chan_alloc(Some(t)).unwrap();

        let out = Command {
            opcode: 7,
            arg: 0xdead_beef,
        };
        e.chan_send(Some(t), &out).unwrap();

        e.sched.context = Some(t);
        let pack = e.chan_read().unwrap();
        assert_eq!(pack.decode::<Command>().unwrap(), out);
        e.sched.context = None;
        e.free_pack(pack);
    }
}
