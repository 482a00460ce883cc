// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host demo: a heartbeat plus a crossbound ping/pong channel pair.
//!
//! `ping` fires every 500 ms, broadcasts a sequence number to its bound
//! peers, and drains whatever echoes came back. `pong` stays frozen until a
//! write lands in its inbox, then wakes, logs the number, and echoes it. The
//! sequence counter lives in ping's task-local storage, since callbacks
//! themselves are stateless.

use std::time::Instant;

use frost::{ArgList, ChanCtl, Engine, Port, TaskFlags};

/// Port over the host monotonic clock, logging to stderr.
struct StdPort {
    epoch: Instant,
}

impl Port for StdPort {
    fn time_tick(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn log_print(&self, tag: &str, args: std::fmt::Arguments<'_>) {
        eprintln!("[{tag}] {args}");
    }
}

fn heartbeat(engine: &mut Engine, _: &ArgList) {
    println!("=w= tick {} ms", engine.timetick());
}

fn ping(engine: &mut Engine, _: &ArgList) {
    // Drain echoes from previous rounds first.
    while let Ok(pack) = engine.chan_read() {
        if pack.ctrl == ChanCtl::Ok {
            let seq = pack.read_as::<u32>().unwrap_or(0);
            println!("ping: echo {seq}");
        }
        engine.free_pack(pack);
    }

    let seq = engine.tls_get_value(None, 0).unwrap_or(0);
    engine.tls_set_value(None, 0, seq + 1).ok();

    if engine.chan_write_value(None, &(seq as u32)).is_err() {
        println!("ping: peers full, dropping {seq}");
    }
}

fn pong(engine: &mut Engine, _: &ArgList) {
    while let Ok(pack) = engine.chan_read() {
        if pack.ctrl == ChanCtl::Ok {
            let seq = pack.read_as::<u32>().unwrap_or(0);
            println!("pong: ping {seq}");
            let _ = engine.chan_write_value(None, &seq);
        }
        engine.free_pack(pack);
    }
}

fn main() {
    let mut engine = Engine::new(StdPort {
        epoch: Instant::now(),
    });
    engine.init().expect("engine init");

    engine.interval(1000, heartbeat).expect("heartbeat task");

    let ping_task = engine.interval(500, ping).expect("ping task");
    let pong_task = engine.interval(0, pong).expect("pong task");

    engine.tls_alloc(Some(ping_task)).expect("ping tls");
    engine.chan_alloc(Some(ping_task)).expect("ping chan");
    engine.chan_alloc(Some(pong_task)).expect("pong chan");
    engine
        .chan_crossbind(Some(ping_task), pong_task)
        .expect("crossbind");

    // Pong only wakes when mail arrives.
    engine
        .set_flags(
            pong_task,
            TaskFlags::FREEZE | TaskFlags::UNFREEZE_BY_CHAN_WRITE,
        )
        .expect("pong flags");

    loop {
        engine.schedule().expect("schedule");
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
}
