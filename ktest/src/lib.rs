//! Shared helpers for exercising the kernel crates on the host.

use core::ops::Range;

use ksched::task;
use rand::Rng;

/// Generate a random integer in `range`.
pub fn rand_int(range: Range<usize>) -> usize {
    let mut rng = rand::thread_rng();
    rng.gen_range(range)
}

/// Generate `len` random bytes.
pub fn rand_bytes(len: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen()).collect()
}

/// Drive the executor from `ncpu` host threads until all tasks complete.
pub fn run_multi(ncpu: usize) {
    let mut threads = vec![];
    for _ in 0..ncpu {
        let t = std::thread::spawn(move || {
            task::run_all();
        });
        threads.push(t);
    }
    for thread in threads {
        thread.join().unwrap();
    }
}
