extern crate corc;

use std::time::Instant;

use corc::sync::{channel, Channel};
use corc::{spawn, Scheduler};

fn create_node(next: Channel<usize>) -> Channel<usize> {
    let recv = channel::<usize>(1);
    let rx = recv.clone();
    spawn(move || {
        loop {
            let i = rx.recv().unwrap();
            if i == 0 {
                break;
            }
            next.send(i + 1).unwrap();
        }
        next.send(0).unwrap();
    });
    recv
}

fn master(iters: usize, size: usize) {
    let t0 = Instant::now();
    let first = channel::<usize>(1);
    let mut send = first.clone();
    for _ in 0..size - 1 {
        send = create_node(send);
    }
    let t1 = Instant::now();
    println!("Ring Created");
    let mut i = 0;
    for _ in 0..iters {
        send.send(i + 1).unwrap();
        i = first.recv().unwrap();
    }
    let t2 = Instant::now();
    println!("{}", i);
    send.send(0).unwrap();
    first.recv().unwrap();
    println!("Creation time: {:?}", t1.duration_since(t0));
    println!("Messaging time: {:?}", t2.duration_since(t1));
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let iters = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(1000);
    let size = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(50);
    let procs = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(2);
    let _ = Scheduler::new().with_workers(procs).run(move || {
        master(iters, size);
    });
}
