//! Chinese Remainder combination and rational reconstruction.

use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{One, Signed, Zero};

use crate::rational::RationalNumber;

/// Combine `a1 mod m1` with `a2 mod m2` into the unique residue modulo
/// `m1 * m2`.
///
/// Returns the pair (combined residue, combined modulus). The moduli must be
/// coprime, which holds for distinct primes.
pub fn chinese_remainder(a1: &BigInt, m1: &BigInt, a2: &BigInt, m2: &BigInt) -> (BigInt, BigInt) {
    let m1_inv = mod_inverse(&(m1 % m2), m2).expect("moduli must be coprime");
    let diff = ((a2 - a1) % m2 + m2) % m2;
    let t = (diff * m1_inv) % m2;
    (a1 + m1 * t, m1 * m2)
}

/// Modular inverse using the extended Euclidean algorithm.
pub fn mod_inverse(a: &BigInt, m: &BigInt) -> Option<BigInt> {
    let (g, x, _) = extended_gcd(a, m);
    if g != BigInt::one() {
        return None;
    }
    Some(((x % m) + m) % m)
}

/// Extended Euclidean algorithm: returns (g, x, y) with a*x + b*y = g.
fn extended_gcd(a: &BigInt, b: &BigInt) -> (BigInt, BigInt, BigInt) {
    if b.is_zero() {
        (a.clone(), BigInt::one(), BigInt::zero())
    } else {
        let (g, x, y) = extended_gcd(b, &(a % b));
        (g, y.clone(), x - (a / b) * y)
    }
}

/// Rational reconstruction with the Wang bound.
///
/// Given `a mod m`, finds the unique fraction n/d with |n|, d <= sqrt(m/2)
/// and gcd(n, d) = 1 such that n ≡ a*d (mod m), or `None` if no such
/// fraction exists. The extended Euclidean remainder sequence is truncated
/// at the bound.
pub fn rational_reconstruct(a: &BigInt, m: &BigInt) -> Option<RationalNumber> {
    if a.is_zero() {
        return Some(RationalNumber::zero());
    }

    let bound = (m / 2u32).sqrt();

    let mut r0 = m.clone();
    let mut r1 = a.mod_floor(m);
    let mut t0 = BigInt::zero();
    let mut t1 = BigInt::one();

    while r1 > bound {
        let q = &r0 / &r1;
        let r2 = &r0 - &q * &r1;
        r0 = std::mem::replace(&mut r1, r2);
        let t2 = &t0 - &q * &t1;
        t0 = std::mem::replace(&mut t1, t2);
    }

    if t1.is_zero() || t1.abs() > bound {
        return None;
    }

    let (mut n, mut d) = (r1, t1);
    if d.is_negative() {
        n = -n;
        d = -d;
    }

    if n.gcd(&d) != BigInt::one() {
        return None;
    }

    Some(RationalNumber::from_parts_unchecked(n, d))
}

/// Maximal quotient rational reconstruction (Monagan).
///
/// A variant of [`rational_reconstruct`] that prefers the sparsest result by
/// tracking the largest quotient of the remainder sequence. The threshold is
/// set so that fewer than one percent of random inputs yield a false
/// positive.
pub fn rational_reconstruct_mqrr(u: &BigInt, m: &BigInt) -> Option<RationalNumber> {
    let mut threshold = BigInt::from(1024 * m.bits());

    if u.is_zero() {
        return if m > &threshold {
            Some(RationalNumber::zero())
        } else {
            None
        };
    }

    let mut n = BigInt::zero();
    let mut d = BigInt::zero();

    let mut r0 = m.clone();
    let mut r1 = u.mod_floor(m);
    let mut t0 = BigInt::zero();
    let mut t1 = BigInt::one();

    while !r1.is_zero() && r0 > threshold {
        let q = &r0 / &r1;

        if q > threshold {
            n = r1.clone();
            d = t1.clone();
            threshold = q.clone();
        }

        let r2 = &r0 - &q * &r1;
        r0 = std::mem::replace(&mut r1, r2);
        let t2 = &t0 - &q * &t1;
        t0 = std::mem::replace(&mut t1, t2);
    }

    if d.is_zero() || n.gcd(&d) != BigInt::one() {
        return None;
    }

    if d.is_negative() {
        n = -n;
        d = -d;
    }

    Some(RationalNumber::from_parts_unchecked(n, d))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primes::primes;

    #[test]
    fn test_chinese_remainder() {
        let (a, m) = chinese_remainder(
            &BigInt::from(2),
            &BigInt::from(5),
            &BigInt::from(3),
            &BigInt::from(7),
        );
        assert_eq!(m, BigInt::from(35));
        assert_eq!(a.mod_floor(&BigInt::from(5)), BigInt::from(2));
        assert_eq!(a.mod_floor(&BigInt::from(7)), BigInt::from(3));
    }

    #[test]
    fn test_rational_reconstruct_roundtrip() {
        let p = BigInt::from(primes()[0]);

        for (num, den) in [(3i64, 7u64), (-22, 113), (1, 1), (0, 1), (1000, 30011)] {
            let n = BigInt::from(num);
            let d = BigInt::from(den);
            let a = (&n * mod_inverse(&d, &p).unwrap()).mod_floor(&p);

            let rec = rational_reconstruct(&a, &p).unwrap();
            assert_eq!(rec.numerator, n);
            assert_eq!(rec.denominator, d);
        }
    }

    #[test]
    fn test_rational_reconstruct_too_large() {
        // A fraction whose numerator exceeds the Wang bound for a small
        // modulus is not recoverable.
        let m = BigInt::from(101);
        let a = BigInt::from(59);
        let rec = rational_reconstruct(&a, &m);

        if let Some(r) = rec {
            // If something is returned, it must satisfy the congruence.
            let lhs = (&r.numerator).mod_floor(&m);
            let rhs = (&a * &r.denominator).mod_floor(&m);
            assert_eq!(lhs, rhs);
        }
    }

    #[test]
    fn test_mqrr_roundtrip() {
        let p1 = BigInt::from(primes()[0]);
        let p2 = BigInt::from(primes()[1]);
        let m = &p1 * &p2;

        let n = BigInt::from(-123456789i64);
        let d = BigInt::from(987654321u64);
        let a = (&n * mod_inverse(&d, &m).unwrap()).mod_floor(&m);

        let rec = rational_reconstruct_mqrr(&a, &m).unwrap();
        assert_eq!(rec.numerator, n);
        assert_eq!(rec.denominator, d);
    }
}
