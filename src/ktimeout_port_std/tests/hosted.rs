//! Runs the timeout engine on the hosted tick sources
use ktimeout::{Config, Timeout, TimeoutEngine, TimeoutId};
use ktimeout_port_std::{ManualPort, StdPort, TimerThread};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

fn init_logger() {
    let _ = ktimeout_port_std::env_logger::builder()
        .is_test(true)
        .try_init();
}

#[test]
fn manual_port_fires_in_order() {
    init_logger();
    let engine = TimeoutEngine::new(ManualPort::new(), Config::new());
    let fired = Arc::new(Mutex::new(Vec::new()));

    for (name, ticks) in [("c", 30), ("a", 10), ("b", 20), ("a2", 10)] {
        let id = engine.create_timeout();
        let fired = Arc::clone(&fired);
        engine.add_timeout(
            id,
            move |engine, _| fired.lock().unwrap().push((name, engine.tick_get())),
            Timeout::Ticks(ticks),
        );
    }

    while engine.port().run_to_deadline(&engine).is_some() {}

    assert_eq!(
        *fired.lock().unwrap(),
        [("a", 10), ("a2", 10), ("b", 20), ("c", 30)]
    );
    assert_eq!(engine.tick_get(), 30);
}

#[test]
fn manual_port_unannounced_ticks() {
    init_logger();
    let engine = TimeoutEngine::new(ManualPort::new(), Config::new());
    let id = engine.create_timeout();

    engine.port().advance(5);
    engine.add_timeout(id, |_, _| {}, Timeout::Ticks(10));
    assert_eq!(engine.time_remaining(id), 10);
    assert_eq!(engine.timeout_expires(id), 15);

    // The deadline is requested relative to the current (unannounced) tick
    assert_eq!(engine.port().programmed(), Some((10, false)));

    engine.port().tick(&engine, 9);
    assert!(!engine.is_inactive(id));
    assert_eq!(engine.time_remaining(id), 1);

    engine.port().tick(&engine, 1);
    assert!(engine.is_inactive(id));
}

#[test]
fn manual_port_timepoint_survives_spurious_wakeups() {
    init_logger();
    let engine = TimeoutEngine::new(ManualPort::new(), Config::new());
    let end = engine.timepoint_calc(engine.config().timeout_ms(100));
    assert_eq!(end.tick(), 10);

    // Each "wakeup" re-arms the wait with the time that is left
    let mut waits = Vec::new();
    loop {
        match engine.timepoint_timeout(end) {
            Timeout::NoWait => break,
            Timeout::Ticks(ticks) => {
                waits.push(ticks);
                engine.port().tick(&engine, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    assert_eq!(waits, [10, 7, 4, 1]);
    assert_eq!(engine.uptime_ms(), 120);
}

/// Clients on several threads while a tick thread announces.
#[test]
fn manual_port_concurrent_clients() {
    init_logger();
    const NUM_THREADS: usize = 4;
    const NUM_ROUNDS: usize = 50;

    let engine = Arc::new(TimeoutEngine::new(ManualPort::new(), Config::new()));
    let fire_count = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    let ticker = {
        let engine = Arc::clone(&engine);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            while done.load(Ordering::Acquire) < NUM_THREADS {
                engine.port().tick(&engine, 1);
                thread::yield_now();
            }
        })
    };

    let clients: Vec<_> = (0..NUM_THREADS)
        .map(|i| {
            let engine = Arc::clone(&engine);
            let fire_count = Arc::clone(&fire_count);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let id: TimeoutId = engine.create_timeout();
                let mut aborted = 0;
                for round in 0..NUM_ROUNDS {
                    // Wait for the previous round's timeout to fire or abort it
                    if round % 3 == i % 3 {
                        if engine.abort_timeout(id).is_ok() {
                            aborted += 1;
                        }
                    } else {
                        while !engine.is_inactive(id) {
                            thread::yield_now();
                        }
                    }

                    let fire_count = Arc::clone(&fire_count);
                    engine.add_timeout(
                        id,
                        move |_, _| {
                            fire_count.fetch_add(1, Ordering::Relaxed);
                        },
                        Timeout::Ticks((round % 4) as i64),
                    );
                }
                while !engine.is_inactive(id) {
                    thread::yield_now();
                }
                done.fetch_add(1, Ordering::Release);
                aborted
            })
        })
        .collect();

    let aborted: usize = clients.into_iter().map(|c| c.join().unwrap()).sum();
    ticker.join().unwrap();

    assert_eq!(
        fire_count.load(Ordering::Relaxed) + aborted,
        NUM_THREADS * NUM_ROUNDS
    );
}

#[test]
fn std_port_fires_in_real_time() {
    init_logger();
    let engine = Arc::new(TimeoutEngine::new(
        StdPort::new(1000),
        Config::new().with_ticks_per_sec(1000),
    ));
    let timer = TimerThread::start(Arc::clone(&engine));

    let (send, recv) = mpsc::channel();
    let start = Instant::now();
    for ms in [60, 20, 40] {
        let id = engine.create_timeout();
        let send = Mutex::new(send.clone());
        engine.add_timeout(
            id,
            move |_, _| {
                let _ = send.lock().unwrap().send(ms);
            },
            engine.config().timeout_ms(ms),
        );
    }

    let mut order = Vec::new();
    for _ in 0..3 {
        order.push(recv.recv_timeout(Duration::from_secs(10)).unwrap());
    }
    let elapsed = start.elapsed();

    assert_eq!(order, [20, 40, 60]);
    // The first deadline is counted from the start of the current tick
    assert!(elapsed >= Duration::from_millis(59), "{elapsed:?}");
    assert!(engine.uptime_ms() >= 60);

    timer.stop();
}

#[test]
fn std_port_timeouts_registered_before_start() {
    init_logger();
    let engine = Arc::new(TimeoutEngine::new(StdPort::new(100), Config::new()));

    let (send, recv) = mpsc::channel();
    let id = engine.create_timeout();
    let send = Mutex::new(send);
    engine.add_timeout(
        id,
        move |_, id| {
            let _ = send.lock().unwrap().send(id);
        },
        Timeout::Ticks(2),
    );

    let timer = TimerThread::start(Arc::clone(&engine));
    assert_eq!(recv.recv_timeout(Duration::from_secs(10)), Ok(id));
    assert!(engine.is_inactive(id));
    drop(timer);
}

#[test]
fn std_port_stop_keeps_time() {
    init_logger();
    let engine = Arc::new(TimeoutEngine::new(StdPort::new(1000), Config::new()));
    let timer = TimerThread::start(Arc::clone(&engine));
    timer.stop();

    let before = engine.tick_get();
    thread::sleep(Duration::from_millis(20));
    assert!(engine.tick_get() >= before + 20);
}

/// At 1 GHz, the absolute tick count passes `u32::MAX` after 4.3 seconds.
#[test]
fn std_port_deadline_beyond_u32_ticks() {
    init_logger();
    let engine = Arc::new(TimeoutEngine::new(
        StdPort::new(1_000_000_000),
        Config::new().with_ticks_per_sec(1_000_000_000),
    ));
    let timer = TimerThread::start(Arc::clone(&engine));

    let (send, recv) = mpsc::channel();
    let id = engine.create_timeout();
    let send = Mutex::new(send);
    engine.add_timeout(
        id,
        move |engine, _| {
            let _ = send.lock().unwrap().send(engine.tick_get());
        },
        Timeout::Ticks(4_400_000_000),
    );

    let fired_at = recv.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(fired_at >= 4_400_000_000, "{fired_at}");
    assert!(engine.is_inactive(id));

    timer.stop();
}
