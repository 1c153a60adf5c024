//! Word-sized elements of the active prime field.
//!
//! The active prime is process-wide and is switched exactly once per
//! new-prime transition by the scheduler, while no worker holds a field
//! element in flight. Outside of that barrier the prime is read-only, so
//! every `FFInt` observed by two threads was produced under the same prime.

use std::fmt;
use std::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Sub, SubAssign};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::primes::{mod_mul_u128, mod_pow_u128};

static PRIME: AtomicU64 = AtomicU64::new(0);

/// An element of the prime field defined by the active prime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FFInt {
    pub n: u64,
}

impl FFInt {
    /// Switch the process to a new prime field.
    ///
    /// Must only be called while no worker thread evaluates field arithmetic;
    /// the scheduler's new-prime barrier guarantees this.
    pub fn set_new_prime(prime: u64) {
        PRIME.store(prime, Ordering::Release);
    }

    /// The active prime.
    #[inline]
    pub fn prime() -> u64 {
        PRIME.load(Ordering::Acquire)
    }

    /// Construct an element, reducing modulo the active prime.
    #[inline]
    pub fn new(n: u64) -> Self {
        Self { n: n % Self::prime() }
    }

    /// Construct from a value already known to be reduced.
    #[inline]
    pub fn from_reduced(n: u64) -> Self {
        debug_assert!(n < Self::prime());
        Self { n }
    }

    /// Construct from a signed integer.
    pub fn from_i64(n: i64) -> Self {
        let p = Self::prime();
        if n >= 0 {
            Self { n: n as u64 % p }
        } else {
            Self { n: p - (n.unsigned_abs() % p) }
        }
    }

    #[inline]
    pub fn zero() -> Self {
        Self { n: 0 }
    }

    #[inline]
    pub fn one() -> Self {
        Self { n: 1 }
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.n == 0
    }

    /// Raise to a non-negative power.
    pub fn pow(&self, exp: u64) -> Self {
        Self { n: mod_pow_u128(self.n, exp, Self::prime()) }
    }

    /// Raise to a possibly negative power: negative exponents invert first.
    pub fn pow_i64(&self, exp: i64) -> Self {
        if exp >= 0 {
            self.pow(exp as u64)
        } else {
            self.inv().pow(exp.unsigned_abs())
        }
    }

    /// Multiplicative inverse via Fermat's little theorem.
    ///
    /// The inverse of zero is zero; callers for which zero is possible use
    /// [`FFInt::try_inv`] instead.
    pub fn inv(&self) -> Self {
        let p = Self::prime();
        if self.n == 0 {
            return Self::zero();
        }
        Self { n: mod_pow_u128(self.n, p - 2, p) }
    }

    /// Multiplicative inverse, or `None` for zero.
    pub fn try_inv(&self) -> Option<Self> {
        if self.n == 0 {
            None
        } else {
            Some(self.inv())
        }
    }
}

impl From<u64> for FFInt {
    fn from(n: u64) -> Self {
        Self::new(n)
    }
}

impl From<u32> for FFInt {
    fn from(n: u32) -> Self {
        Self::new(n as u64)
    }
}

impl fmt::Display for FFInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.n)
    }
}

impl Add for FFInt {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Self) -> Self {
        let p = Self::prime();
        let (sum, overflow) = self.n.overflowing_add(rhs.n);
        if overflow || sum >= p {
            Self { n: sum.wrapping_sub(p) }
        } else {
            Self { n: sum }
        }
    }
}

impl Sub for FFInt {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Self) -> Self {
        let p = Self::prime();
        if self.n >= rhs.n {
            Self { n: self.n - rhs.n }
        } else {
            Self { n: self.n + (p - rhs.n) }
        }
    }
}

impl Mul for FFInt {
    type Output = Self;

    #[inline]
    fn mul(self, rhs: Self) -> Self {
        Self { n: mod_mul_u128(self.n, rhs.n, Self::prime()) }
    }
}

impl Div for FFInt {
    type Output = Self;

    #[inline]
    fn div(self, rhs: Self) -> Self {
        self * rhs.inv()
    }
}

impl Neg for FFInt {
    type Output = Self;

    #[inline]
    fn neg(self) -> Self {
        if self.n == 0 {
            self
        } else {
            Self { n: Self::prime() - self.n }
        }
    }
}

impl AddAssign for FFInt {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl SubAssign for FFInt {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl MulAssign for FFInt {
    fn mul_assign(&mut self, rhs: Self) {
        *self = *self * rhs;
    }
}

impl DivAssign for FFInt {
    fn div_assign(&mut self, rhs: Self) {
        *self = *self / rhs;
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
    fn test_basic_arithmetic() {
        setup();
        let a = FFInt::new(17);
        let b = FFInt::new(5);

        assert_eq!((a + b).n, 22);
        assert_eq!((a - b).n, 12);
        assert_eq!((a * b).n, 85);
        assert_eq!(a / b * b, a);
    }

    #[test]
    #[serial]
    fn test_wrap_around() {
        setup();
        let p = FFInt::prime();
        let a = FFInt::new(p - 1);
        assert_eq!((a + FFInt::one()).n, 0);
        assert_eq!((FFInt::zero() - FFInt::one()).n, p - 1);
    }

    #[test]
    #[serial]
    fn test_inverse() {
        setup();
        let a = FFInt::new(123456789);
        assert_eq!(a * a.inv(), FFInt::one());
        assert_eq!(FFInt::zero().try_inv(), None);
    }

    #[test]
    #[serial]
    fn test_pow() {
        setup();
        let a = FFInt::new(3);
        assert_eq!(a.pow(4).n, 81);
        assert_eq!(a.pow(0), FFInt::one());
        assert_eq!(a.pow_i64(-1), a.inv());
        assert_eq!(a.pow_i64(-2), (a * a).inv());
    }

    #[test]
    #[serial]
    fn test_from_i64() {
        setup();
        let p = FFInt::prime();
        assert_eq!(FFInt::from_i64(-1).n, p - 1);
        assert_eq!(FFInt::from_i64(7).n, 7);
    }
}
