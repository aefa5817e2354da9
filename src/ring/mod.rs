//! Arithmetic in `Z_q[X]/(X^n + 1)` for word-sized primes `q`, with polynomials
//! over several primes stored modulus-major (all `n` residues for `q_0`, then
//! all for `q_1`, ...).

pub mod modulus;
pub mod ntt;
pub mod poly;
pub mod prime;
pub mod rns;

use std::{num::NonZeroUsize, sync::OnceLock, thread};

pub use self::{
    modulus::{Modulus, MulOperand},
    ntt::NttTables,
    prime::{CoeffModulus, PlainModulus},
    rns::RnsBase,
};

// Below this many coefficients, spawning threads costs more than it saves.
const PARALLEL_THRESHOLD: usize = 1 << 15;

fn worker_count() -> usize {
    static WORKERS: OnceLock<usize> = OnceLock::new();
    *WORKERS.get_or_init(|| {
        thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
    })
}

/// Calls `f(i, chunk)` for every length-`n` chunk of `data`.  Chunks are spread
/// over a bounded number of scoped threads when the input is large enough.
pub fn for_each_chunk<F>(data: &mut [u64], n: usize, f: F)
where
    F: Fn(usize, &mut [u64]) + Sync,
{
    debug_assert!(n > 0 && data.len() % n == 0);
    let chunk_count = data.len() / n;
    let workers = worker_count().min(chunk_count);
    if workers <= 1 || data.len() < PARALLEL_THRESHOLD {
        for (i, chunk) in data.chunks_exact_mut(n).enumerate() {
            f(i, chunk);
        }
        return;
    }

    let mut groups: Vec<Vec<(usize, &mut [u64])>> = (0..workers).map(|_| Vec::new()).collect();
    for (i, chunk) in data.chunks_exact_mut(n).enumerate() {
        groups[i % workers].push((i, chunk));
    }
    let f = &f;
    thread::scope(|scope| {
        for group in groups {
            scope.spawn(move || {
                for (i, chunk) in group {
                    f(i, chunk);
                }
            });
        }
    });
}
