//! Exact rational coefficients.

use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};

use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{One, Signed, ToPrimitive, Zero};

use crate::field::FFInt;

/// A reduced fraction of arbitrary-precision integers with positive
/// denominator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RationalNumber {
    pub numerator: BigInt,
    pub denominator: BigInt,
}

impl RationalNumber {
    /// Create a new rational number from numerator and denominator.
    pub fn new(num: BigInt, den: BigInt) -> Self {
        let mut r = Self {
            numerator: num,
            denominator: den,
        };
        r.reduce();
        r
    }

    /// Create from parts already known to be reduced with positive
    /// denominator.
    pub fn from_parts_unchecked(num: BigInt, den: BigInt) -> Self {
        debug_assert!(den.is_positive());
        Self {
            numerator: num,
            denominator: den,
        }
    }

    /// Create a rational from an integer.
    pub fn from_int<T: Into<BigInt>>(n: T) -> Self {
        Self {
            numerator: n.into(),
            denominator: BigInt::one(),
        }
    }

    pub fn zero() -> Self {
        Self {
            numerator: BigInt::zero(),
            denominator: BigInt::one(),
        }
    }

    pub fn one() -> Self {
        Self {
            numerator: BigInt::one(),
            denominator: BigInt::one(),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.numerator.is_zero()
    }

    pub fn is_one(&self) -> bool {
        self.numerator.is_one() && self.denominator.is_one()
    }

    /// True if the fraction is an integer, i.e. has denominator 1.
    pub fn is_integer(&self) -> bool {
        self.denominator.is_one()
    }

    /// The multiplicative inverse. The fraction must not be zero.
    pub fn invert(&self) -> Self {
        if self.numerator.is_negative() {
            Self::from_parts_unchecked(-&self.denominator, -&self.numerator)
        } else {
            Self::from_parts_unchecked(self.denominator.clone(), self.numerator.clone())
        }
    }

    /// Reduce this fraction modulo the active prime.
    pub fn to_ffint(&self) -> FFInt {
        let p = BigInt::from(FFInt::prime());
        let num = self.numerator.mod_floor(&p).to_u64().unwrap_or(0);
        let den = self.denominator.mod_floor(&p).to_u64().unwrap_or(0);
        FFInt::from_reduced(num) / FFInt::from_reduced(den)
    }

    /// Reduce to lowest terms.
    fn reduce(&mut self) {
        if self.numerator.is_zero() {
            self.denominator = BigInt::one();
            return;
        }

        let g = self.numerator.gcd(&self.denominator);
        self.numerator = &self.numerator / &g;
        self.denominator = &self.denominator / &g;

        // Ensure denominator is positive
        if self.denominator.is_negative() {
            self.numerator = -&self.numerator;
            self.denominator = -&self.denominator;
        }
    }
}

impl fmt::Display for RationalNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.denominator.is_one() {
            write!(f, "{}", self.numerator)
        } else {
            write!(f, "{}/{}", self.numerator, self.denominator)
        }
    }
}

impl From<i64> for RationalNumber {
    fn from(n: i64) -> Self {
        Self::from_int(n)
    }
}

impl From<BigInt> for RationalNumber {
    fn from(n: BigInt) -> Self {
        Self::from_int(n)
    }
}

impl Add for &RationalNumber {
    type Output = RationalNumber;

    fn add(self, other: Self) -> RationalNumber {
        let num = &self.numerator * &other.denominator + &other.numerator * &self.denominator;
        let den = &self.denominator * &other.denominator;
        RationalNumber::new(num, den)
    }
}

impl Add for RationalNumber {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        &self + &other
    }
}

impl Sub for &RationalNumber {
    type Output = RationalNumber;

    fn sub(self, other: Self) -> RationalNumber {
        let num = &self.numerator * &other.denominator - &other.numerator * &self.denominator;
        let den = &self.denominator * &other.denominator;
        RationalNumber::new(num, den)
    }
}

impl Sub for RationalNumber {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        &self - &other
    }
}

impl Mul for &RationalNumber {
    type Output = RationalNumber;

    fn mul(self, other: Self) -> RationalNumber {
        let num = &self.numerator * &other.numerator;
        let den = &self.denominator * &other.denominator;
        RationalNumber::new(num, den)
    }
}

impl Mul for RationalNumber {
    type Output = Self;

    fn mul(self, other: Self) -> Self {
        &self * &other
    }
}

impl Div for &RationalNumber {
    type Output = RationalNumber;

    fn div(self, other: Self) -> RationalNumber {
        let num = &self.numerator * &other.denominator;
        let den = &self.denominator * &other.numerator;
        RationalNumber::new(num, den)
    }
}

impl Div for RationalNumber {
    type Output = Self;

    fn div(self, other: Self) -> Self {
        &self / &other
    }
}

impl Neg for RationalNumber {
    type Output = Self;

    fn neg(self) -> Self {
        Self {
            numerator: -self.numerator,
            denominator: self.denominator,
        }
    }
}

impl Neg for &RationalNumber {
    type Output = RationalNumber;

    fn neg(self) -> RationalNumber {
        RationalNumber {
            numerator: -&self.numerator,
            denominator: self.denominator.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_arithmetic() {
        let a = RationalNumber::new(BigInt::from(1), BigInt::from(2));
        let b = RationalNumber::new(BigInt::from(1), BigInt::from(3));

        let sum = a.clone() + b.clone();
        assert_eq!(sum, RationalNumber::new(BigInt::from(5), BigInt::from(6)));

        let prod = a.clone() * b.clone();
        assert_eq!(prod, RationalNumber::new(BigInt::from(1), BigInt::from(6)));
    }

    #[test]
    #[serial]
    fn test_reduction() {
        let r = RationalNumber::new(BigInt::from(4), BigInt::from(8));
        assert_eq!(r, RationalNumber::new(BigInt::from(1), BigInt::from(2)));

        let r = RationalNumber::new(BigInt::from(3), BigInt::from(-6));
        assert_eq!(r, RationalNumber::new(BigInt::from(-1), BigInt::from(2)));
    }

    #[test]
    #[serial]
    fn test_invert() {
        let r = RationalNumber::new(BigInt::from(-3), BigInt::from(7));
        let inv = r.invert();
        assert!(inv.denominator.is_positive());
        assert!((r * inv).is_one());
    }

    #[test]
    #[serial]
    fn test_to_ffint() {
        crate::field::FFInt::set_new_prime(crate::primes::primes()[0]);
        let r = RationalNumber::new(BigInt::from(7), BigInt::from(2));
        let expected = FFInt::new(7) / FFInt::new(2);
        assert_eq!(r.to_ffint(), expected);
    }
}
