//! Sparse multivariate polynomials over the active prime field.
//!
//! Monomials are keyed by exponent tuples of fixed length `n`. Zero
//! coefficients are absent from the map.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::ops::{Add, AddAssign, Mul, Sub, SubAssign};

use crate::field::FFInt;

/// Map from exponent tuples to field coefficients.
pub type FFMap = HashMap<Vec<u32>, FFInt>;

/// Compare two exponent tuples colexicographically, from the last component
/// to the first.
pub fn colex_cmp(a: &[u32], b: &[u32]) -> Ordering {
    for (x, y) in a.iter().rev().zip(b.iter().rev()) {
        match x.cmp(y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Compare exponent tuples by total degree first, then colexicographically.
pub fn degree_colex_cmp(a: &[u32], b: &[u32]) -> Ordering {
    let deg_a: u32 = a.iter().sum();
    let deg_b: u32 = b.iter().sum();
    deg_a.cmp(&deg_b).then_with(|| colex_cmp(a, b))
}

/// A sparse polynomial over the active prime field.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PolynomialFF {
    /// Number of variables.
    pub n: usize,
    pub coefs: FFMap,
}

impl PolynomialFF {
    pub fn new(n: usize, coefs: FFMap) -> Self {
        let mut poly = Self { n, coefs };
        poly.coefs.retain(|_, c| !c.is_zero());
        poly
    }

    pub fn zero(n: usize) -> Self {
        Self { n, coefs: FFMap::new() }
    }

    /// The constant polynomial `c` in `n` variables.
    pub fn constant(n: usize, c: FFInt) -> Self {
        let mut coefs = FFMap::new();
        if !c.is_zero() {
            coefs.insert(vec![0; n], c);
        }
        Self { n, coefs }
    }

    pub fn is_zero(&self) -> bool {
        self.coefs.is_empty()
    }

    /// Evaluate at the given point. `values` must have length `n`.
    pub fn eval(&self, values: &[FFInt]) -> FFInt {
        debug_assert_eq!(values.len(), self.n);
        let mut result = FFInt::zero();

        for (deg, coef) in &self.coefs {
            let mut term = *coef;
            for (v, &e) in values.iter().zip(deg.iter()) {
                if e != 0 {
                    term *= v.pow(e as u64);
                }
            }
            result += term;
        }

        result
    }

    /// The exponent tuple of minimal total degree, ties broken colex-low.
    pub fn min_deg(&self) -> Option<&Vec<u32>> {
        self.coefs.keys().min_by(|a, b| degree_colex_cmp(a, b))
    }

    /// The exponent tuple of maximal total degree, ties broken colex-high.
    pub fn max_deg(&self) -> Option<&Vec<u32>> {
        self.coefs.keys().max_by(|a, b| degree_colex_cmp(a, b))
    }

    /// Total degree of a monomial.
    pub fn total_deg(deg: &[u32]) -> u32 {
        deg.iter().sum()
    }

    /// Homogenize a polynomial in `n` variables to total degree `deg` by
    /// absorbing the missing degree into a new first variable. The result
    /// has `n + 1` variables.
    pub fn homogenize(&self, deg: u32) -> PolynomialFF {
        let mut coefs = FFMap::with_capacity(self.coefs.len());

        for (old_deg, coef) in &self.coefs {
            let total: u32 = old_deg.iter().sum();
            let mut new_deg = Vec::with_capacity(self.n + 1);
            new_deg.push(deg - total);
            new_deg.extend_from_slice(old_deg);
            coefs.insert(new_deg, *coef);
        }

        PolynomialFF { n: self.n + 1, coefs }
    }

    /// Substitute `x_i -> x_i + s_i` and expand.
    pub fn add_shift(&self, shift: &[FFInt]) -> PolynomialFF {
        debug_assert_eq!(shift.len(), self.n);

        if shift.iter().all(|s| s.is_zero()) {
            return self.clone();
        }

        let mut result = PolynomialFF::zero(self.n);

        for (deg, coef) in &self.coefs {
            // Expand prod_i (x_i + s_i)^{e_i} one variable at a time.
            let mut terms: Vec<(Vec<u32>, FFInt)> = vec![(Vec::with_capacity(self.n), *coef)];

            for (i, &e) in deg.iter().enumerate() {
                let s = shift[i];
                let mut next = Vec::with_capacity(terms.len() * (e as usize + 1));

                for (powers, c) in &terms {
                    if e == 0 || s.is_zero() {
                        let mut p = powers.clone();
                        p.push(e);
                        next.push((p, *c));
                        continue;
                    }

                    // binomial expansion of (x_i + s)^e
                    let mut binom = FFInt::one();
                    for k in 0..=e {
                        let mut p = powers.clone();
                        p.push(k);
                        next.push((p, *c * binom * s.pow((e - k) as u64)));
                        // C(e, k+1) = C(e, k) * (e - k) / (k + 1)
                        binom = binom * FFInt::new((e - k) as u64) / FFInt::new(k as u64 + 1);
                    }
                }

                terms = next;
            }

            for (powers, c) in terms {
                let entry = result.coefs.entry(powers).or_insert_with(FFInt::zero);
                *entry += c;
            }
        }

        result.coefs.retain(|_, c| !c.is_zero());
        result
    }

    /// Multiply every coefficient by a scalar.
    pub fn scale(&self, factor: FFInt) -> PolynomialFF {
        if factor.is_zero() {
            return PolynomialFF::zero(self.n);
        }
        let coefs = self
            .coefs
            .iter()
            .map(|(deg, coef)| (deg.clone(), *coef * factor))
            .collect();
        PolynomialFF { n: self.n, coefs }
    }

    /// Multiply by a single variable power: `x_var^pow`.
    pub fn mul_var_pow(&self, var: usize, pow: u32) -> PolynomialFF {
        let coefs = self
            .coefs
            .iter()
            .map(|(deg, coef)| {
                let mut new_deg = deg.clone();
                new_deg[var] += pow;
                (new_deg, *coef)
            })
            .collect();
        PolynomialFF { n: self.n, coefs }
    }
}

impl AddAssign<&PolynomialFF> for PolynomialFF {
    fn add_assign(&mut self, rhs: &PolynomialFF) {
        if self.coefs.is_empty() {
            self.n = rhs.n;
        }
        debug_assert!(rhs.coefs.is_empty() || self.n == rhs.n);

        for (deg, coef) in &rhs.coefs {
            let entry = self.coefs.entry(deg.clone()).or_insert_with(FFInt::zero);
            *entry += *coef;
            if entry.is_zero() {
                self.coefs.remove(deg);
            }
        }
    }
}

impl Add for PolynomialFF {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self {
        self += &rhs;
        self
    }
}

impl SubAssign<&PolynomialFF> for PolynomialFF {
    fn sub_assign(&mut self, rhs: &PolynomialFF) {
        if self.coefs.is_empty() {
            self.n = rhs.n;
        }

        for (deg, coef) in &rhs.coefs {
            let entry = self.coefs.entry(deg.clone()).or_insert_with(FFInt::zero);
            *entry -= *coef;
            if entry.is_zero() {
                self.coefs.remove(deg);
            }
        }
    }
}

impl Sub for PolynomialFF {
    type Output = Self;

    fn sub(mut self, rhs: Self) -> Self {
        self -= &rhs;
        self
    }
}

impl Mul<FFInt> for &PolynomialFF {
    type Output = PolynomialFF;

    fn mul(self, factor: FFInt) -> PolynomialFF {
        self.scale(factor)
    }
}

impl fmt::Display for PolynomialFF {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut degs: Vec<_> = self.coefs.keys().collect();
        degs.sort_by(|a, b| degree_colex_cmp(a, b));

        let mut first = true;
        for deg in degs {
            if !first {
                write!(f, " + ")?;
            }
            first = false;
            write!(f, "{}*{:?}", self.coefs[deg], deg)?;
        }

        if first {
            write!(f, "0")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn setup() {
        FFInt::set_new_prime(crate::primes::primes()[0]);
    }

    #[test]
    #[serial]
    fn test_colex() {
        assert_eq!(colex_cmp(&[1, 0], &[0, 1]), Ordering::Less);
        assert_eq!(colex_cmp(&[0, 2], &[3, 1]), Ordering::Greater);
        assert_eq!(colex_cmp(&[2, 1], &[2, 1]), Ordering::Equal);
    }

    #[test]
    #[serial]
    fn test_eval() {
        setup();
        // 2*x*y + 3
        let mut coefs = FFMap::new();
        coefs.insert(vec![1, 1], FFInt::new(2));
        coefs.insert(vec![0, 0], FFInt::new(3));
        let poly = PolynomialFF::new(2, coefs);

        let v = poly.eval(&[FFInt::new(5), FFInt::new(7)]);
        assert_eq!(v.n, 73);
    }

    #[test]
    #[serial]
    fn test_homogenize() {
        setup();
        // y^2 + 1 in one variable, homogenized to degree 3 in two variables
        let mut coefs = FFMap::new();
        coefs.insert(vec![2], FFInt::new(1));
        coefs.insert(vec![0], FFInt::new(1));
        let poly = PolynomialFF::new(1, coefs);

        let hom = poly.homogenize(3);
        assert_eq!(hom.n, 2);
        assert_eq!(hom.coefs[&vec![1, 2]], FFInt::new(1));
        assert_eq!(hom.coefs[&vec![3, 0]], FFInt::new(1));
    }

    #[test]
    #[serial]
    fn test_add_shift() {
        setup();
        // P(x) = x^2, shift s=1: (x+1)^2 = x^2 + 2x + 1
        let mut coefs = FFMap::new();
        coefs.insert(vec![2], FFInt::new(1));
        let poly = PolynomialFF::new(1, coefs);

        let shifted = poly.add_shift(&[FFInt::new(1)]);
        assert_eq!(shifted.coefs[&vec![2]], FFInt::new(1));
        assert_eq!(shifted.coefs[&vec![1]], FFInt::new(2));
        assert_eq!(shifted.coefs[&vec![0]], FFInt::new(1));
    }

    #[test]
    #[serial]
    fn test_shift_consistency() {
        setup();
        // P(x, y) random-ish; check P(x+s) evaluated at v equals P(v+s)
        let mut coefs = FFMap::new();
        coefs.insert(vec![2, 1], FFInt::new(5));
        coefs.insert(vec![0, 3], FFInt::new(11));
        coefs.insert(vec![1, 0], FFInt::new(7));
        let poly = PolynomialFF::new(2, coefs);

        let shift = [FFInt::new(13), FFInt::new(29)];
        let shifted = poly.add_shift(&shift);

        let v = [FFInt::new(1000), FFInt::new(2000)];
        let v_shifted = [v[0] + shift[0], v[1] + shift[1]];
        assert_eq!(shifted.eval(&v), poly.eval(&v_shifted));
    }

    #[test]
    #[serial]
    fn test_add_sub() {
        setup();
        let mut a = PolynomialFF::constant(1, FFInt::new(4));
        let b = PolynomialFF::constant(1, FFInt::new(4));
        a -= &b;
        assert!(a.is_zero());
    }
}
