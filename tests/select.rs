extern crate corc;

use corc::sync::{channel, ChanSet};
use corc::Scheduler;

// Two workers race to serve a two-way select. Exactly one operation wins;
// the loser's token is extracted intact, so the other channel still
// delivers its value through a plain receive afterwards. Repeating the
// scenario exercises both outcomes.
#[test]
fn select_two_receivers() {
    for _ in 0..50 {
        Scheduler::new()
            .with_workers(2)
            .run(|| {
                let a = channel::<&'static str>(0);
                let b = channel::<&'static str>(0);

                let ga = {
                    let a = a.clone();
                    corc::spawn(move || {
                        corc::sched();
                        a.send("a")
                    })
                };
                let gb = {
                    let b = b.clone();
                    corc::spawn(move || {
                        corc::sched();
                        b.send("b")
                    })
                };

                let mut va = None;
                let mut vb = None;
                let winner = {
                    let mut set = ChanSet::new();
                    set.recv(&a, &mut va);
                    set.recv(&b, &mut vb);
                    set.select().unwrap()
                };

                assert!(!winner.closed);
                match winner.index {
                    0 => {
                        assert_eq!(va, Some("a"));
                        assert_eq!(vb, None);
                        assert_eq!(b.recv(), Ok("b"));
                    }
                    1 => {
                        assert_eq!(vb, Some("b"));
                        assert_eq!(va, None);
                        assert_eq!(a.recv(), Ok("a"));
                    }
                    index => panic!("select returned unknown index {}", index),
                }

                ga.join().unwrap().unwrap();
                gb.join().unwrap().unwrap();
            })
            .unwrap();
    }
}

// Registration order breaks ties between simultaneously ready operations.
#[test]
fn select_prefers_registration_order() {
    Scheduler::new()
        .run(|| {
            let a = channel::<i32>(1);
            let b = channel::<i32>(1);
            a.send(1).unwrap();
            b.send(2).unwrap();

            let mut va = None;
            let mut vb = None;
            let winner = {
                let mut set = ChanSet::new();
                set.recv(&a, &mut va);
                set.recv(&b, &mut vb);
                set.select().unwrap()
            };

            assert_eq!(winner.index, 0);
            assert_eq!(va, Some(1));
            assert_eq!(vb, None);
        })
        .unwrap();
}

#[test]
fn select_mixed_send_recv() {
    Scheduler::new()
        .run(|| {
            let a = channel::<i32>(1);
            let b = channel::<i32>(1);

            let mut vb = None;
            let winner = {
                let mut set = ChanSet::new();
                set.recv(&b, &mut vb);
                set.send(&a, 7);
                set.try_select().unwrap()
            };

            // the receive is not ready, the send has a free buffer slot
            assert_eq!(winner.index, 1);
            assert!(!winner.closed);
            assert_eq!(a.recv(), Ok(7));
        })
        .unwrap();
}

// A blocking select woken by close reports the winning operation as closed.
#[test]
fn select_woken_by_close() {
    Scheduler::new()
        .with_workers(2)
        .run(|| {
            let a = channel::<i32>(0);

            let guard = {
                let a = a.clone();
                corc::spawn(move || {
                    for _ in 0..4 {
                        corc::sched();
                    }
                    a.close();
                })
            };

            let mut va = None;
            let winner = {
                let mut set = ChanSet::new();
                set.recv(&a, &mut va);
                set.select().unwrap()
            };

            assert_eq!(winner.index, 0);
            assert!(winner.closed);
            assert_eq!(va, None);

            guard.join().unwrap();
        })
        .unwrap();
}
