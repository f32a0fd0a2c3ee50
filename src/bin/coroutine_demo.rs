//! Coroutine demo for the Rust Coroutine Library
//!
//! Runs a handful of tasks on the realtime frame driver and prints what each
//! one saw, with the scheduler time it saw it at.
//!
//! Usage:
//!   cargo run --bin coroutine_demo                    # 60 fps, time scale 1
//!   cargo run --bin coroutine_demo -- --fps 30 --scale 2
//!   RUST_LOG=rust_coroutine_lib=trace cargo run --bin coroutine_demo
//!
//! Tasks:
//!   metronome - `repeat` emitting a beat event every 0.25s, 8 times
//!   listener  - waits on the beat event until it goes quiet
//!   sequence  - time, frame and predicate waits in a row
//!   race      - two child tasks raced with `wait_one_of`
//!   worker    - a background thread answering through a callback adapter

use rust_coroutine_lib::primitive::UpdateFn;
use rust_coroutine_lib::{
    init_tracing, DriverConfig, Event, FrameDriver, OnDone, SchedError, Scheduler,
};
use std::cell::{Cell, RefCell};
use std::env;
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Shared record of what the tasks observed.
#[derive(Clone, Default)]
struct Journal {
    lines: Rc<RefCell<Vec<(f64, &'static str, String)>>>,
}

impl Journal {
    fn note(&self, at: f64, who: &'static str, what: impl Into<String>) {
        self.lines.borrow_mut().push((at, who, what.into()));
    }

    fn print(&self) {
        for (at, who, what) in self.lines.borrow().iter() {
            println!("[{at:>7.3}] {who:<10} {what}");
        }
    }
}

fn spawn_beats(sched: &Scheduler, journal: &Journal) -> anyhow::Result<()> {
    let beat = Rc::new(Event::<u64>::new());
    let heard = Rc::new(Cell::new(0_u64));

    let b = beat.clone();
    let j = journal.clone();
    sched.repeat(8, 0.25, move |cx, i| {
        j.note(cx.now(), "metronome", format!("beat {i}"));
        b.emit(i);
        Ok(())
    })?;

    let j = journal.clone();
    let h = heard.clone();
    sched.spawn("listener", move |co| async move {
        while let Some(i) = co.wait_event(&beat, 0.5).await? {
            h.set(h.get() + 1);
            j.note(co.now()?, "listener", format!("heard beat {i}"));
        }
        j.note(co.now()?, "listener", "quiet for 0.5s, done");
        Ok(())
    })?;

    let j = journal.clone();
    sched.spawn("sequence", move |co| async move {
        co.wait_time(0.1).await?;
        j.note(co.now()?, "sequence", "after wait_time(0.1)");
        co.frame().await?;
        j.note(co.now()?, "sequence", "one frame later");
        let met = co.wait_until(move || heard.get() >= 3, 5.0).await?;
        j.note(co.now()?, "sequence", format!("three beats heard: {met}"));
        Ok(())
    })?;
    Ok(())
}

fn spawn_race(sched: &Scheduler, journal: &Journal) -> anyhow::Result<()> {
    let j = journal.clone();
    sched.spawn("race", move |co| async move {
        let fast = co.spawn("fast", |c| async move {
            c.wait_time(0.3).await?;
            Ok(())
        })?;
        let slow = co.spawn("slow", |c| async move {
            c.wait_time(1.0).await?;
            Ok(())
        })?;
        let winner = co.wait_one_of(vec![fast.into(), slow.into()]).await?;
        let name = match winner {
            Some(0) => "fast",
            Some(_) => "slow",
            None => "nobody",
        };
        j.note(co.now()?, "race", format!("{name} won, the other was stopped"));
        Ok(())
    })?;
    Ok(())
}

fn spawn_worker(sched: &Scheduler, journal: &Journal) -> anyhow::Result<()> {
    let j = journal.clone();
    sched.spawn("worker", move |co| async move {
        let (tx, rx) = mpsc::channel::<String>();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(400));
            let _ = tx.send("checksum 0x5eed".to_string());
        });

        // The hook runs every tick while the task waits and completes the
        // callback once the thread has answered.
        let pending: Rc<RefCell<Option<OnDone<String>>>> = Rc::default();
        let p = pending.clone();
        let hook: UpdateFn = Rc::new(move || {
            if let Ok(msg) = rx.try_recv() {
                if let Some(done) = p.borrow_mut().take() {
                    done.done(msg);
                }
            }
            Ok(())
        });

        let sched = co.scheduler()?;
        let (reply, on_done) = sched.callback::<String>(Some(hook))?;
        *pending.borrow_mut() = Some(on_done);
        j.note(co.now()?, "worker", "request sent to background thread");

        let timeout = sched.wait_time(2.0)?;
        drop(sched);
        match co.wait_one_of(vec![reply.suspension(), timeout]).await? {
            Some(0) => {
                let msg = reply.take().ok_or(SchedError::CallbackEmpty)?;
                j.note(co.now()?, "worker", format!("reply: {msg}"));
            }
            _ => j.note(co.now()?, "worker", "gave up waiting"),
        }
        Ok(())
    })?;
    Ok(())
}

fn print_usage() {
    println!("Usage: coroutine_demo [--fps <f64>] [--scale <f64>]");
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args: Vec<String> = env::args().collect();

    let mut config = DriverConfig::default();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--fps" | "-f" => {
                i += 1;
                if let Some(v) = args.get(i) {
                    config.fps = v.parse()?;
                }
            }
            "--scale" | "-s" => {
                i += 1;
                if let Some(v) = args.get(i) {
                    config.time_scale = v.parse()?;
                }
            }
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            other => anyhow::bail!("unknown argument {other}"),
        }
        i += 1;
    }

    let sched = Scheduler::default();
    let journal = Journal::default();
    spawn_beats(&sched, &journal)?;
    spawn_race(&sched, &journal)?;
    spawn_worker(&sched, &journal)?;

    let mut driver = FrameDriver::new(sched, config);
    driver.run_until_idle()?;

    journal.print();
    println!();
    println!(
        "{} frames, {:.3}s real, {:.3}s scaled",
        driver.frames(),
        driver.clock().real(),
        driver.clock().scaled()
    );
    for s in driver.scheduler().pool_report() {
        println!(
            "{:<14} capacity {:>3}  acquires {:>4}  frees {:>4}  in use {}",
            s.kind, s.capacity, s.acquires, s.frees, s.used
        );
    }
    Ok(())
}
