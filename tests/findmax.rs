extern crate corc;
extern crate rand;

use rand::Rng;

use corc::sync::{channel, Channel};
use corc::Scheduler;

// Recursive fan-out: each level splits its slice in half, spawns a worker
// per half with a rendezvous channel, and reports the larger of the two
// maxima to its parent.
fn find_max(out: Channel<i32>, mut data: Vec<i32>) {
    if data.len() <= 1 {
        out.send(data[0]).unwrap();
        return;
    }

    let right = data.split_off(data.len() / 2);
    let left = data;

    let lch = channel::<i32>(0);
    let rch = channel::<i32>(0);

    {
        let lch = lch.clone();
        corc::spawn(move || find_max(lch, left));
    }
    {
        let rch = rch.clone();
        corc::spawn(move || find_max(rch, right));
    }

    let l = lch.recv().unwrap();
    let r = rch.recv().unwrap();
    out.send(if l > r { l } else { r }).unwrap();
}

#[test]
fn fan_out_findmax() {
    Scheduler::new()
        .with_workers(2)
        .run(|| {
            let mut rng = rand::thread_rng();
            let data: Vec<i32> = (0..16).map(|_| rng.gen_range(-1000..1000)).collect();
            let expected = *data.iter().max().unwrap();

            let ch = channel::<i32>(0);
            {
                let ch = ch.clone();
                corc::spawn(move || find_max(ch, data));
            }

            assert_eq!(ch.recv(), Ok(expected));
        })
        .unwrap();
}
