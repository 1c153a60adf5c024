//! Univariate rational interpolation through Thiele's continued fraction.
//!
//! Points are added one at a time; the reciprocal-difference table is
//! extended by one column per point. The interpolation has converged when a
//! new point is already predicted by the current continued fraction.

use thiserror::Error;

use crate::field::FFInt;
use crate::poly_ff::{FFMap, PolynomialFF};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ThieleError {
    /// A reciprocal difference hit a vanishing denominator; the caller must
    /// supply a fresh sample point.
    #[error("vanishing reciprocal difference, need a fresh sample point")]
    NeedFreshT,
}

/// Outcome of adding one sample point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThieleStatus {
    Converged,
    NeedMore,
}

/// Incremental Thiele interpolator.
///
/// The internal state machine is monotone; there is no rewind. All sample
/// points must be distinct.
#[derive(Debug, Clone, Default)]
pub struct ThieleInterpolator {
    /// Thiele coefficients a_i.
    ai: Vec<FFInt>,
    /// Sample points t_i.
    ti: Vec<FFInt>,
}

impl ThieleInterpolator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_points(&self) -> usize {
        self.ti.len()
    }

    /// Add the sample (t, f(t)).
    ///
    /// Returns `Converged` once the continued fraction predicts the new
    /// value, i.e. two successive candidates agree.
    pub fn add_point(&mut self, num: FFInt, ti: FFInt) -> Result<ThieleStatus, ThieleError> {
        self.ti.push(ti);
        let i = self.ti.len() - 1;

        if i == 0 {
            self.ai.push(num);
            return Ok(ThieleStatus::NeedMore);
        }

        if num == self.comp_fyi(i - 1, i - 1, ti)? {
            self.ti.pop();
            return Ok(ThieleStatus::Converged);
        }

        match self.comp_ai(i, i, num) {
            Ok(ai) => {
                self.ai.push(ai);
                Ok(ThieleStatus::NeedMore)
            }
            Err(e) => {
                self.ti.pop();
                Err(e)
            }
        }
    }

    /// Compute the coefficient a_i by the reciprocal-difference recursion.
    fn comp_ai(&self, i: usize, ip: usize, num: FFInt) -> Result<FFInt, ThieleError> {
        if ip == 0 {
            return Ok(num);
        }

        let inner = self.comp_ai(i, ip - 1, num)?;
        let diff = inner - self.ai[ip - 1];
        let inv = diff.try_inv().ok_or(ThieleError::NeedFreshT)?;
        Ok((self.ti[i] - self.ti[ip - 1]) * inv)
    }

    /// Evaluate the continued fraction built from a_0..a_i at y.
    fn comp_fyi(&self, i: usize, ip: usize, y: FFInt) -> Result<FFInt, ThieleError> {
        if ip == 0 {
            return Ok(self.ai[i]);
        }

        let inner = self.comp_fyi(i, ip - 1, y)?;
        let inv = inner.try_inv().ok_or(ThieleError::NeedFreshT)?;
        Ok(self.ai[i - ip] + (y - self.ti[i - ip]) * inv)
    }

    /// Flatten the continued fraction to canonical numerator and denominator
    /// coefficient maps (univariate, keyed by `vec![degree]`).
    pub fn construct_canonical(&self) -> (FFMap, FFMap) {
        if self.ai.len() == 1 {
            let mut num = FFMap::new();
            num.insert(vec![0], self.ai[0]);
            let mut den = FFMap::new();
            den.insert(vec![0], FFInt::one());
            return (num, den);
        }

        let (num, den) = self.iterate_canonical(1);
        let flat_num = num.scale(self.ai[0]) + den.mul_var_pow(0, 1) + den.scale(-self.ti[0]);
        (flat_num.coefs, num.coefs)
    }

    fn iterate_canonical(&self, i: usize) -> (PolynomialFF, PolynomialFF) {
        if i < self.ai.len() - 1 {
            let (num, den) = self.iterate_canonical(i + 1);
            let new_num = num.scale(self.ai[i]) + den.mul_var_pow(0, 1) + den.scale(-self.ti[i]);
            (new_num, num)
        } else {
            let num = PolynomialFF::constant(1, self.ai[i]);
            let den = PolynomialFF::constant(1, FFInt::one());
            (num, den)
        }
    }
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

    /// bb(t) = 2 / (2 + 7*t + 30*t^2)
    fn bb(t: FFInt) -> FFInt {
        f(2) / (f(2) + f(7) * t + f(30) * t * t)
    }

    #[test]
    #[serial]
    fn test_univariate_rational() {
        setup();
        let mut thiele = ThieleInterpolator::new();

        let mut t = 1u64;
        loop {
            let ti = f(t);
            match thiele.add_point(bb(ti), ti).unwrap() {
                ThieleStatus::Converged => break,
                ThieleStatus::NeedMore => t += 1,
            }
            assert!(t < 50, "no convergence");
        }

        let (num, den) = thiele.construct_canonical();

        // The canonical form is unique up to normalization; normalize by the
        // denominator constant.
        let norm = den[&vec![0]].inv();
        assert_eq!(num[&vec![0]] * norm, f(1));
        assert_eq!(den[&vec![1]] * norm, f(7) / f(2));
        assert_eq!(den[&vec![2]] * norm, f(15));
        assert_eq!(num.len(), 1);
        assert_eq!(den.len(), 3);
    }

    #[test]
    #[serial]
    fn test_polynomial_input() {
        setup();
        // bb(t) = 3 + t: a pure polynomial converges with trivial denominator
        let mut thiele = ThieleInterpolator::new();

        let mut t = 1u64;
        loop {
            let ti = f(t);
            match thiele.add_point(f(3) + ti, ti).unwrap() {
                ThieleStatus::Converged => break,
                ThieleStatus::NeedMore => t += 1,
            }
            assert!(t < 20);
        }

        let (num, den) = thiele.construct_canonical();
        let norm = den[&vec![0]].inv();
        assert_eq!(num[&vec![0]] * norm, f(3));
        assert_eq!(num[&vec![1]] * norm, f(1));
        assert_eq!(den.len(), 1);
    }

    #[test]
    #[serial]
    fn test_constant() {
        setup();
        let mut thiele = ThieleInterpolator::new();
        assert_eq!(thiele.add_point(f(5), f(1)).unwrap(), ThieleStatus::NeedMore);
        assert_eq!(thiele.add_point(f(5), f(2)).unwrap(), ThieleStatus::Converged);

        let (num, den) = thiele.construct_canonical();
        assert_eq!(num[&vec![0]], f(5));
        assert_eq!(den[&vec![0]], f(1));
    }
}
