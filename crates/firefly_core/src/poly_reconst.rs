//! Multivariate polynomial reconstruction over the active prime field.
//!
//! A `PolyReconst` recovers a polynomial P(z_2, ..., z_n) of bounded total
//! degree from probes taken at powers of the global anchor points: the probe
//! of zi-order (o, ..., o) evaluates P at (a_2^o, ..., a_n^o), so every
//! candidate monomial m contributes v_m^o with the node v_m = prod_i
//! a_i^{m_i}. Once as many values as candidate monomials have arrived the
//! coefficients follow from one transposed Vandermonde solve.
//!
//! On the first prime the candidate support is the full degree-bounded set;
//! on later primes the caller restricts it to the monomials that are still
//! unsolved, which is what makes the sparse (Zippel-style) passes cheap.

use crate::dense_solver::{solve_transposed_vandermonde, SolverError};
use crate::field::FFInt;
use crate::poly_ff::{degree_colex_cmp, FFMap, PolynomialFF};

/// Enumerate all exponent tuples of length `n` with total degree <= `deg`,
/// sorted by total degree then colexicographically.
pub fn degree_bounded_support(n: usize, deg: u32) -> Vec<Vec<u32>> {
    let mut support = Vec::new();
    let mut current = vec![0u32; n];
    enumerate(&mut support, &mut current, 0, deg);
    support.sort_by(|a, b| degree_colex_cmp(a, b));
    support
}

fn enumerate(out: &mut Vec<Vec<u32>>, current: &mut Vec<u32>, var: usize, budget: u32) {
    if var == current.len() {
        out.push(current.clone());
        return;
    }
    for e in 0..=budget {
        current[var] = e;
        enumerate(out, current, var + 1, budget - e);
    }
    current[var] = 0;
}

/// Reconstruction of one multivariate polynomial over the current field.
#[derive(Debug, Clone)]
pub struct PolyReconst {
    /// Number of z variables (one less than the full arity).
    n: usize,
    /// Candidate monomials, sorted by total degree then colex.
    support: Vec<Vec<u32>>,
    /// Values collected so far; index j belongs to zi-order j + 1.
    values: Vec<FFInt>,
    result: Option<PolynomialFF>,
}

impl PolyReconst {
    /// Dense first-prime reconstruction with the full support of total
    /// degree <= `deg`.
    pub fn new(n: usize, deg: u32) -> Self {
        Self::with_support(n, degree_bounded_support(n, deg))
    }

    /// Sparse reconstruction over a known support (later primes).
    pub fn with_support(n: usize, mut support: Vec<Vec<u32>>) -> Self {
        support.sort_by(|a, b| degree_colex_cmp(a, b));
        let values = Vec::with_capacity(support.len());
        let result = if support.is_empty() {
            // Nothing to solve; the polynomial is zero.
            Some(PolynomialFF::zero(n))
        } else {
            None
        };
        Self { n, support, values, result }
    }

    /// Number of probes still needed before the system can be solved.
    pub fn get_num_eqn(&self) -> usize {
        self.support.len() - self.values.len()
    }

    /// The zi-order the next value must correspond to.
    pub fn expected_order(&self) -> u32 {
        self.values.len() as u32 + 1
    }

    pub fn is_done(&self) -> bool {
        self.result.is_some()
    }

    /// Feed the probe value belonging to the currently expected order and
    /// solve once the system is saturated.
    ///
    /// Fails with a singular system when two candidate monomials collide on
    /// the same Vandermonde node; the caller re-randomizes the anchor points
    /// and retries.
    pub fn feed(&mut self, value: FFInt, anchors: &[FFInt]) -> Result<(), SolverError> {
        if self.result.is_some() {
            return Ok(());
        }

        self.values.push(value);

        if self.values.len() == self.support.len() {
            self.solve(anchors)?;
        }

        Ok(())
    }

    fn solve(&mut self, anchors: &[FFInt]) -> Result<(), SolverError> {
        let vis: Vec<FFInt> = self
            .support
            .iter()
            .map(|m| monomial_node(m, anchors))
            .collect();

        let coefs = solve_transposed_vandermonde(&vis, &self.values)?;

        let mut map = FFMap::with_capacity(coefs.len());
        for (deg, coef) in self.support.iter().zip(coefs) {
            if !coef.is_zero() {
                map.insert(deg.clone(), coef);
            }
        }

        self.result = Some(PolynomialFF { n: self.n, coefs: map });
        Ok(())
    }

    /// The reconstructed polynomial. Only valid once [`PolyReconst::is_done`]
    /// returns true.
    pub fn get_result_ff(&self) -> &PolynomialFF {
        self.result.as_ref().expect("polynomial not yet reconstructed")
    }
}

/// The Vandermonde node of a monomial: its evaluation at the anchor points.
pub fn monomial_node(deg: &[u32], anchors: &[FFInt]) -> FFInt {
    let mut vi = FFInt::one();
    for (a, &e) in anchors.iter().zip(deg.iter()) {
        if e != 0 {
            vi *= a.pow(e as u64);
        }
    }
    vi
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn setup() {
        FFInt::set_new_prime(crate::primes::primes()[0]);
    }

    fn f(n: u64) -> FFInt {
        FFInt::new(n)
    }

    #[test]
    #[serial]
    fn test_support_enumeration() {
        let support = degree_bounded_support(2, 2);
        assert_eq!(support.len(), 6); // 1, z2, z3, z2^2, z2*z3, z3^2
        assert_eq!(support[0], vec![0, 0]);

        for m in &support {
            assert!(m.iter().sum::<u32>() <= 2);
        }
    }

    #[test]
    #[serial]
    fn test_dense_reconstruction() {
        setup();
        // P(z2, z3) = 3 + 5*z2*z3 + 7*z3^2
        let eval = |z2: FFInt, z3: FFInt| f(3) + f(5) * z2 * z3 + f(7) * z3 * z3;

        let anchors = [f(23), f(47)];
        let mut rec = PolyReconst::new(2, 2);

        while !rec.is_done() {
            let o = rec.expected_order() as u64;
            let value = eval(anchors[0].pow(o), anchors[1].pow(o));
            rec.feed(value, &anchors).unwrap();
        }

        let result = rec.get_result_ff();
        assert_eq!(result.coefs[&vec![0, 0]], f(3));
        assert_eq!(result.coefs[&vec![1, 1]], f(5));
        assert_eq!(result.coefs[&vec![0, 2]], f(7));
        assert_eq!(result.coefs.len(), 3);
    }

    #[test]
    #[serial]
    fn test_sparse_second_pass() {
        setup();
        // Only the known support needs probes on later primes.
        let eval = |z2: FFInt, z3: FFInt| f(11) * z2 + f(13) * z3 * z3;

        let support = vec![vec![1, 0], vec![0, 2]];
        let anchors = [f(101), f(211)];
        let mut rec = PolyReconst::with_support(2, support);

        assert_eq!(rec.get_num_eqn(), 2);

        while !rec.is_done() {
            let o = rec.expected_order() as u64;
            let value = eval(anchors[0].pow(o), anchors[1].pow(o));
            rec.feed(value, &anchors).unwrap();
        }

        let result = rec.get_result_ff();
        assert_eq!(result.coefs[&vec![1, 0]], f(11));
        assert_eq!(result.coefs[&vec![0, 2]], f(13));
    }

    #[test]
    #[serial]
    fn test_node_collision_reported() {
        setup();
        // Anchors chosen so that z2 and z3 have the same node.
        let support = vec![vec![1, 0], vec![0, 1]];
        let anchors = [f(7), f(7)];
        let mut rec = PolyReconst::with_support(2, support);

        rec.feed(f(1), &anchors).unwrap();
        let err = rec.feed(f(2), &anchors);
        assert!(err.is_err());
    }

    #[test]
    #[serial]
    fn test_empty_support_is_zero() {
        setup();
        let rec = PolyReconst::with_support(2, Vec::new());
        assert!(rec.is_done());
        assert!(rec.get_result_ff().is_zero());
    }
}
