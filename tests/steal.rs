extern crate corc;
extern crate env_logger;
extern crate num_cpus;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use corc::Scheduler;

// 1000 short CPU-bound coroutines spawned from one coroutine all land on
// the global queue; idle VPUs wake up and steal their share.
#[test]
fn work_stealing_spreads_load() {
    let _ = env_logger::try_init();

    let counts: Arc<Vec<AtomicUsize>> = Arc::new((0..4).map(|_| AtomicUsize::new(0)).collect());
    let counts2 = counts.clone();

    Scheduler::new()
        .with_workers(4)
        .run(move || {
            let mut guards = Vec::with_capacity(1000);

            for seed in 0..1000u64 {
                let counts = counts2.clone();
                guards.push(corc::spawn(move || {
                    let mut x = seed;
                    for i in 0..2000u64 {
                        x = x.wrapping_mul(31).wrapping_add(i);
                    }
                    let vpu = corc::vpu_id().expect("coroutine off any VPU");
                    counts[vpu].fetch_add(1, Ordering::Relaxed);
                    x
                }));
            }

            for guard in guards {
                guard.join().unwrap();
            }
        })
        .unwrap();

    let per_vpu: Vec<usize> = counts.iter().map(|c| c.load(Ordering::Relaxed)).collect();
    let total: usize = per_vpu.iter().sum();
    assert_eq!(total, 1000);

    let participating = per_vpu.iter().filter(|&&c| c > 0).count();
    assert!(participating >= 2,
            "all work stayed on a single VPU: {:?}",
            per_vpu);
}

// Same storm with one worker per hardware thread; everything completes.
#[test]
fn spawn_storm_completes_on_all_cores() {
    let _ = env_logger::try_init();

    let workers = num_cpus::get().max(2);
    let done = Arc::new(AtomicUsize::new(0));
    let done2 = done.clone();

    Scheduler::new()
        .with_workers(workers)
        .run(move || {
            let mut guards = Vec::with_capacity(500);
            for _ in 0..500 {
                let done = done2.clone();
                guards.push(corc::spawn(move || {
                    corc::sched();
                    done.fetch_add(1, Ordering::Relaxed);
                }));
            }
            for guard in guards {
                guard.join().unwrap();
            }
        })
        .unwrap();

    assert_eq!(done.load(Ordering::Relaxed), 500);
}
