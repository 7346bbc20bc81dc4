extern crate corc;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use corc::Scheduler;

// A coroutine spinning without any yield point is descheduled by the
// watchdog; with a single VPU, the main coroutine getting the CPU back is
// the proof.
#[test]
fn watchdog_preempts_tight_loop() {
    let progress = Arc::new(AtomicU64::new(0));
    let stop = Arc::new(AtomicBool::new(false));

    let progress2 = progress.clone();
    let stop2 = stop.clone();

    Scheduler::new()
        .with_preemption(Duration::from_millis(2))
        .run(move || {
            let looper = {
                let progress = progress2.clone();
                let stop = stop2.clone();
                corc::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        progress.fetch_add(1, Ordering::Relaxed);
                    }
                })
            };

            corc::sched();

            assert!(progress2.load(Ordering::Relaxed) > 0,
                    "the spinning coroutine never ran");
            stop2.store(true, Ordering::Relaxed);

            looper.join().unwrap();
        })
        .unwrap();
}
