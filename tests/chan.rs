extern crate corc;
extern crate rand;

use rand::Rng;

use corc::sync::{channel, RecvError};
use corc::Scheduler;

// A receiver parks on an empty rendezvous channel; a later send hands the
// value over directly and both sides succeed.
#[test]
fn rendezvous_recv_first() {
    Scheduler::new()
        .with_workers(2)
        .run(|| {
            let ch = channel::<i32>(0);

            let guard = {
                let ch = ch.clone();
                corc::spawn(move || ch.recv().unwrap())
            };

            for _ in 0..10 {
                corc::sched();
            }

            ch.send(42).unwrap();
            assert_eq!(guard.join().unwrap(), 42);
        })
        .unwrap();
}

// Capacity 2: the third send parks until a receive frees a slot, and the
// values still come out in send order.
#[test]
fn buffered_overflow_preserves_order() {
    Scheduler::new()
        .run(|| {
            let ch = channel::<i32>(2);
            ch.send(1).unwrap();
            ch.send(2).unwrap();

            let guard = {
                let ch = ch.clone();
                corc::spawn(move || ch.send(3))
            };

            for _ in 0..10 {
                corc::sched();
            }

            // this receive both yields 1 and moves the parked 3 into the buffer
            assert_eq!(ch.recv(), Ok(1));
            assert_eq!(ch.recv(), Ok(2));
            assert_eq!(ch.recv(), Ok(3));

            assert_eq!(guard.join().unwrap(), Ok(()));
        })
        .unwrap();
}

#[test]
fn single_producer_fifo() {
    Scheduler::new()
        .with_workers(2)
        .run(|| {
            let ch = channel::<usize>(3);

            let guard = {
                let ch = ch.clone();
                corc::spawn(move || {
                    for i in 0..200 {
                        ch.send(i).unwrap();
                    }
                })
            };

            for i in 0..200 {
                assert_eq!(ch.recv(), Ok(i));
            }
            guard.join().unwrap();
        })
        .unwrap();
}

// Parked receivers are woken in the order they parked.
#[test]
fn waiters_wake_in_fifo_order() {
    Scheduler::new()
        .run(|| {
            let ch = channel::<usize>(0);
            let order = channel::<usize>(8);

            for id in 0..3 {
                {
                    let ch = ch.clone();
                    let order = order.clone();
                    corc::spawn(move || {
                        let v = ch.recv().unwrap();
                        order.send(id * 100 + v).unwrap();
                    });
                }
                // single VPU: let this receiver park before spawning the next
                for _ in 0..5 {
                    corc::sched();
                }
            }

            for v in 0..3 {
                ch.send(v).unwrap();
            }

            assert_eq!(order.recv(), Ok(0));
            assert_eq!(order.recv(), Ok(101));
            assert_eq!(order.recv(), Ok(202));
        })
        .unwrap();
}

// All buffered values are observed before the close shows through.
#[test]
fn close_drains_buffer_first() {
    Scheduler::new()
        .run(|| {
            let ch = channel::<i32>(4);
            for i in 0..4 {
                ch.send(i).unwrap();
            }
            ch.close();

            for i in 0..4 {
                assert_eq!(ch.recv(), Ok(i));
            }
            assert_eq!(ch.recv(), Err(RecvError));
        })
        .unwrap();
}

// Many producers and consumers under randomized yields; nothing is lost,
// nothing is duplicated.
#[test]
fn randomized_producers_consumers() {
    Scheduler::new()
        .with_workers(4)
        .run(|| {
            let ch = channel::<u64>(4);
            let done = channel::<u64>(0);

            for p in 0..4u64 {
                let ch = ch.clone();
                corc::spawn(move || {
                    let mut rng = rand::thread_rng();
                    for i in 0..50u64 {
                        if rng.gen_bool(0.3) {
                            corc::sched();
                        }
                        ch.send(p * 1000 + i).unwrap();
                    }
                });
            }

            for _ in 0..2 {
                let ch = ch.clone();
                let done = done.clone();
                corc::spawn(move || {
                    let mut sum = 0u64;
                    for _ in 0..100 {
                        sum += ch.recv().unwrap();
                    }
                    done.send(sum).unwrap();
                });
            }

            let total = done.recv().unwrap() + done.recv().unwrap();
            let expected: u64 = (0..4u64)
                                    .map(|p| (0..50u64).map(|i| p * 1000 + i).sum::<u64>())
                                    .sum();
            assert_eq!(total, expected);
        })
        .unwrap();
}
