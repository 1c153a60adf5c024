//! The user-supplied black box.

use crate::field::FFInt;

/// Bunch sizes the evaluator may be asked for.
pub const ALLOWED_BUNCH_SIZES: [usize; 8] = [1, 2, 4, 8, 16, 32, 64, 128];

/// A black box mapping a point in the active prime field to one output per
/// function.
///
/// Implementations must be callable from several worker threads at once;
/// `thread_id` identifies the calling worker for implementations that keep
/// per-thread scratch space.
pub trait BlackBox: Send + Sync {
    /// Evaluate at one point. The returned vector has one entry per
    /// function and must have the same length on every call.
    fn eval(&self, values: &[FFInt], thread_id: usize) -> Vec<FFInt>;

    /// Evaluate a bunch of points at once. The default maps over `eval`;
    /// implementations with vectorized evaluation override this.
    ///
    /// Returns one inner vector per function, each holding the outputs for
    /// all points of the bunch.
    fn eval_bunch(&self, values: &[Vec<FFInt>], thread_id: usize) -> Vec<Vec<FFInt>> {
        let mut out: Vec<Vec<FFInt>> = Vec::new();

        for point in values {
            let result = self.eval(point, thread_id);
            if out.is_empty() {
                out = result.into_iter().map(|v| vec![v]).collect();
            } else {
                for (per_fun, v) in out.iter_mut().zip(result) {
                    per_fun.push(v);
                }
            }
        }

        out
    }

    /// Called once per new-prime transition, on a single thread, before any
    /// worker evaluates in the new field.
    fn prime_changed(&self) {}
}

impl<F> BlackBox for F
where
    F: Fn(&[FFInt]) -> Vec<FFInt> + Send + Sync,
{
    fn eval(&self, values: &[FFInt], _thread_id: usize) -> Vec<FFInt> {
        self(values)
    }
}

/// The number of probes a worker should take from a backlog of
/// `queue_length` requests: the floor power of two of the per-thread share,
/// capped by the configured maximum bunch size.
pub fn compute_bunch_size(queue_length: usize, thr_n: usize, max_bunch_size: usize) -> usize {
    if max_bunch_size == 1 {
        return 1;
    }

    let mut tmp = queue_length / thr_n.max(1);

    if tmp == 0 {
        return 1;
    }

    // Floor power of two
    tmp |= tmp >> 1;
    tmp |= tmp >> 2;
    tmp |= tmp >> 4;
    tmp |= tmp >> 8;
    tmp |= tmp >> 16;
    tmp = (tmp + 1) >> 1;

    if (tmp << 1) < queue_length && tmp * thr_n != queue_length {
        tmp <<= 1;
    }

    tmp.min(max_bunch_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bunch_size_disabled() {
        assert_eq!(compute_bunch_size(100, 4, 1), 1);
    }

    #[test]
    fn test_bunch_size_powers_of_two() {
        for queue in 1..200 {
            for threads in 1..8 {
                let bs = compute_bunch_size(queue, threads, 128);
                assert!(ALLOWED_BUNCH_SIZES.contains(&bs), "bs = {bs}");
                assert!(bs <= queue);
            }
        }
    }

    #[test]
    fn test_bunch_size_small_backlog() {
        assert_eq!(compute_bunch_size(3, 4, 128), 1);
        assert_eq!(compute_bunch_size(0, 4, 128), 1);
    }

    #[test]
    fn test_bunch_size_capped() {
        assert_eq!(compute_bunch_size(10_000, 1, 16), 16);
    }
}
