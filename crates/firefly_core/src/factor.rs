//! Univariate factor extraction for the factor scan.
//!
//! The factor scan reconstructs a univariate rational slice of every
//! function exactly over the rationals, then strips its rational linear
//! factors: roots are found modulo the active prime (distinct-degree
//! splitting of the linear part followed by equal-degree splitting),
//! lifted to rational candidates and verified by exact division. Anything
//! that does not lift, including irreducible higher-degree parts, stays in
//! the function.

use num_bigint::BigInt;
use rand::Rng;

use crate::field::FFInt;
use crate::poly::{Monomial, Polynomial};
use crate::rational::RationalNumber;

// ----- dense univariate arithmetic over the active field -----------------

fn trim(poly: &mut Vec<FFInt>) {
    while poly.last().is_some_and(|c| c.is_zero()) {
        poly.pop();
    }
}

fn poly_rem(mut a: Vec<FFInt>, b: &[FFInt]) -> Vec<FFInt> {
    debug_assert!(!b.is_empty());
    let lead_inv = b[b.len() - 1].inv();

    while a.len() >= b.len() {
        let factor = a[a.len() - 1] * lead_inv;
        let offset = a.len() - b.len();
        for (i, &bc) in b.iter().enumerate() {
            let sub = factor * bc;
            a[offset + i] -= sub;
        }
        trim(&mut a);
        if a.is_empty() {
            break;
        }
    }

    a
}

fn poly_gcd(mut a: Vec<FFInt>, mut b: Vec<FFInt>) -> Vec<FFInt> {
    trim(&mut a);
    trim(&mut b);

    while !b.is_empty() {
        let r = poly_rem(a, &b);
        a = std::mem::replace(&mut b, r);
    }

    // monic
    if let Some(&lead) = a.last() {
        let inv = lead.inv();
        for c in a.iter_mut() {
            *c *= inv;
        }
    }
    a
}

fn poly_mulmod(a: &[FFInt], b: &[FFInt], f: &[FFInt]) -> Vec<FFInt> {
    let mut prod = vec![FFInt::zero(); a.len() + b.len() - 1];
    for (i, &ac) in a.iter().enumerate() {
        if ac.is_zero() {
            continue;
        }
        for (j, &bc) in b.iter().enumerate() {
            prod[i + j] += ac * bc;
        }
    }
    trim(&mut prod);
    if prod.is_empty() {
        return prod;
    }
    poly_rem(prod, f)
}

/// Compute base^exp mod f by binary exponentiation.
fn poly_powmod(base: &[FFInt], mut exp: u64, f: &[FFInt]) -> Vec<FFInt> {
    let mut result = vec![FFInt::one()];
    let mut base = poly_rem(base.to_vec(), f);

    while exp > 0 {
        if exp & 1 == 1 {
            result = poly_mulmod(&result, &base, f);
            if result.is_empty() {
                return result;
            }
        }
        exp >>= 1;
        if exp > 0 {
            base = poly_mulmod(&base, &base, f);
        }
    }
    result
}

fn poly_sub(a: &[FFInt], b: &[FFInt]) -> Vec<FFInt> {
    let mut out = vec![FFInt::zero(); a.len().max(b.len())];
    for (i, &c) in a.iter().enumerate() {
        out[i] += c;
    }
    for (i, &c) in b.iter().enumerate() {
        out[i] -= c;
    }
    trim(&mut out);
    out
}

/// The distinct roots of a dense univariate polynomial over the active
/// field. Coefficient index is the degree.
pub fn roots_mod_p<R: Rng>(poly: &[FFInt], rng: &mut R) -> Vec<FFInt> {
    let mut f = poly.to_vec();
    trim(&mut f);

    let mut roots = Vec::new();
    if f.len() <= 1 {
        return roots;
    }

    // Root at zero
    if f[0].is_zero() {
        roots.push(FFInt::zero());
        while f.first().is_some_and(|c| c.is_zero()) {
            f.remove(0);
        }
        if f.len() <= 1 {
            return roots;
        }
    }

    // Product of the distinct linear factors: gcd(x^p - x, f)
    let x = vec![FFInt::zero(), FFInt::one()];
    let xp = poly_powmod(&x, FFInt::prime(), &f);
    let linear_part = poly_gcd(poly_sub(&xp, &x), f);

    if linear_part.len() > 1 {
        split_linear(&linear_part, rng, &mut roots);
    }

    roots
}

/// Equal-degree splitting of a monic product of distinct linear factors.
fn split_linear<R: Rng>(f: &[FFInt], rng: &mut R, roots: &mut Vec<FFInt>) {
    debug_assert!(f.len() > 1);

    if f.len() == 2 {
        // x + c0 with leading coefficient 1
        roots.push(-f[0]);
        return;
    }

    let half = (FFInt::prime() - 1) / 2;

    loop {
        // gcd((x + c)^((p-1)/2) - 1, f) splits off the roots r with
        // r + c a quadratic residue.
        let c = FFInt::new(rng.gen_range(1..FFInt::prime()));
        let shifted = vec![c, FFInt::one()];
        let pow = poly_powmod(&shifted, half, f);
        let h = poly_gcd(poly_sub(&pow, &[FFInt::one()]), f.to_vec());

        if h.len() > 1 && h.len() < f.len() {
            let quotient = poly_divide_exact(f, &h);
            split_linear(&h, rng, roots);
            split_linear(&quotient, rng, roots);
            return;
        }
    }
}

/// Exact division of monic polynomials, used after a successful split.
fn poly_divide_exact(a: &[FFInt], b: &[FFInt]) -> Vec<FFInt> {
    let mut rem = a.to_vec();
    let mut quot = vec![FFInt::zero(); a.len() - b.len() + 1];
    let lead_inv = b[b.len() - 1].inv();

    while rem.len() >= b.len() {
        let factor = rem[rem.len() - 1] * lead_inv;
        let offset = rem.len() - b.len();
        quot[offset] = factor;
        for (i, &bc) in b.iter().enumerate() {
            let sub = factor * bc;
            rem[offset + i] -= sub;
        }
        trim(&mut rem);
        if rem.is_empty() {
            break;
        }
    }

    quot
}

// ----- exact lifting over the rationals ----------------------------------

/// Dense rational coefficients of a univariate [`Polynomial`].
fn dense_coefficients(poly: &Polynomial) -> Vec<RationalNumber> {
    let deg = poly
        .coefs
        .iter()
        .map(|m| m.powers[0])
        .max()
        .unwrap_or(0) as usize;

    let mut out = vec![RationalNumber::zero(); deg + 1];
    for m in &poly.coefs {
        out[m.powers[0] as usize] = m.coef.clone();
    }
    out
}

fn from_dense(coefs: Vec<RationalNumber>) -> Polynomial {
    let monomials = coefs
        .into_iter()
        .enumerate()
        .filter(|(_, c)| !c.is_zero())
        .map(|(d, coef)| Monomial { powers: vec![d as u32], coef })
        .collect();
    Polynomial { coefs: monomials }
}

/// Divide by (x - root) over the rationals; returns the quotient when the
/// remainder vanishes.
fn divide_by_root(coefs: &[RationalNumber], root: &RationalNumber) -> Option<Vec<RationalNumber>> {
    let mut quot = vec![RationalNumber::zero(); coefs.len() - 1];
    let mut carry = RationalNumber::zero();

    for d in (1..coefs.len()).rev() {
        carry = &coefs[d] + &(&carry * root);
        quot[d - 1] = carry.clone();
    }

    let rem = &coefs[0] + &(&carry * root);
    if rem.is_zero() {
        Some(quot)
    } else {
        None
    }
}

/// A linear factor (x - root) with its multiplicity, plus the unfactored
/// remainder polynomial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearFactors {
    pub roots: Vec<(RationalNumber, u32)>,
    pub remainder: Polynomial,
}

/// Strip all rational linear factors from a univariate polynomial.
///
/// Roots are found modulo the active prime, lifted by rational
/// reconstruction and verified by exact division, so false lifts and
/// irrational roots are filtered out.
pub fn rational_linear_factors<R: Rng>(poly: &Polynomial, rng: &mut R) -> LinearFactors {
    let mut coefs = dense_coefficients(poly);
    let mut roots: Vec<(RationalNumber, u32)> = Vec::new();

    if coefs.len() <= 1 {
        return LinearFactors {
            roots,
            remainder: poly.clone(),
        };
    }

    let prime = BigInt::from(FFInt::prime());
    let coefs_ff: Vec<FFInt> = coefs.iter().map(|c| c.to_ffint()).collect();
    let candidates = roots_mod_p(&coefs_ff, rng);

    for r in candidates {
        let lifted = match crate::arith::rational_reconstruct(&BigInt::from(r.n), &prime) {
            Some(rn) => rn,
            None => continue,
        };

        let mut multiplicity = 0;
        while coefs.len() > 1 {
            match divide_by_root(&coefs, &lifted) {
                Some(quot) => {
                    coefs = quot;
                    multiplicity += 1;
                }
                None => break,
            }
        }

        if multiplicity > 0 {
            roots.push((lifted, multiplicity));
        }
    }

    roots.sort_by(|a, b| a.0.cmp(&b.0));

    LinearFactors {
        roots,
        remainder: from_dense(coefs),
    }
}

/// Rebuild the product of linear factors as a univariate polynomial.
pub fn factors_to_polynomial(roots: &[(RationalNumber, u32)]) -> Polynomial {
    let mut coefs = vec![RationalNumber::one()];

    for (root, multiplicity) in roots {
        for _ in 0..*multiplicity {
            // multiply by (x - root)
            let mut next = vec![RationalNumber::zero(); coefs.len() + 1];
            for (d, c) in coefs.iter().enumerate() {
                next[d + 1] = &next[d + 1] + c;
                next[d] = &next[d] - &(c * root);
            }
            coefs = next;
        }
    }

    from_dense(coefs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serial_test::serial;
    use std::collections::HashMap;

    fn setup() {
        FFInt::set_new_prime(crate::primes::primes()[0]);
    }

    fn f(n: i64) -> FFInt {
        FFInt::from_i64(n)
    }

    fn rn(n: i64, d: i64) -> RationalNumber {
        RationalNumber::new(BigInt::from(n), BigInt::from(d))
    }

    #[test]
    #[serial]
    fn test_roots_mod_p() {
        setup();
        let mut rng = StdRng::seed_from_u64(42);

        // (x - 1)(x + 1)(x - 5) = x^3 - 5x^2 - x + 5
        let poly = vec![f(5), f(-1), f(-5), f(1)];
        let mut roots = roots_mod_p(&poly, &mut rng);
        roots.sort();

        let mut expected = vec![f(1), f(-1), f(5)];
        expected.sort();
        assert_eq!(roots, expected);
    }

    #[test]
    #[serial]
    fn test_roots_with_zero_and_irreducible() {
        setup();
        let mut rng = StdRng::seed_from_u64(7);

        // x * (x^2 + 1) * (x - 3) = x^4 - 3x^3 + x^2 - 3x
        let poly = vec![f(0), f(-3), f(1), f(-3), f(1)];

        let roots = roots_mod_p(&poly, &mut rng);
        assert!(roots.contains(&f(0)));
        assert!(roots.contains(&f(3)));

        // every reported root is a genuine root
        for r in &roots {
            let mut acc = FFInt::zero();
            for (d, c) in poly.iter().enumerate() {
                acc += *c * r.pow(d as u64);
            }
            assert!(acc.is_zero());
        }
    }

    #[test]
    #[serial]
    fn test_rational_linear_factors() {
        setup();
        let mut rng = StdRng::seed_from_u64(3);

        // (x - 1)(x + 1)(x - 2/3): coefficients
        // (x^2 - 1)(x - 2/3) = x^3 - 2/3 x^2 - x + 2/3
        let mut map = HashMap::new();
        map.insert(vec![3], rn(1, 1));
        map.insert(vec![2], rn(-2, 3));
        map.insert(vec![1], rn(-1, 1));
        map.insert(vec![0], rn(2, 3));
        let poly = Polynomial::from_map(map);

        let factors = rational_linear_factors(&poly, &mut rng);

        let roots: HashMap<RationalNumber, u32> = factors.roots.into_iter().collect();
        assert_eq!(roots[&rn(1, 1)], 1);
        assert_eq!(roots[&rn(-1, 1)], 1);
        assert_eq!(roots[&rn(2, 3)], 1);

        // fully factored: remainder is the constant leading coefficient
        assert_eq!(factors.remainder.coefs.len(), 1);
        assert_eq!(factors.remainder.coefs[0].powers, vec![0]);
    }

    #[test]
    #[serial]
    fn test_multiplicity() {
        setup();
        let mut rng = StdRng::seed_from_u64(11);

        // (x - 2)^2 = x^2 - 4x + 4
        let mut map = HashMap::new();
        map.insert(vec![2], rn(1, 1));
        map.insert(vec![1], rn(-4, 1));
        map.insert(vec![0], rn(4, 1));
        let poly = Polynomial::from_map(map);

        let factors = rational_linear_factors(&poly, &mut rng);
        assert_eq!(factors.roots, vec![(rn(2, 1), 2)]);
    }

    #[test]
    #[serial]
    fn test_irreducible_stays() {
        setup();
        let mut rng = StdRng::seed_from_u64(13);

        // x^2 + x + 1 has no rational roots
        let mut map = HashMap::new();
        map.insert(vec![2], rn(1, 1));
        map.insert(vec![1], rn(1, 1));
        map.insert(vec![0], rn(1, 1));
        let poly = Polynomial::from_map(map.clone());

        let factors = rational_linear_factors(&poly, &mut rng);
        assert!(factors.roots.is_empty());
        assert_eq!(factors.remainder, Polynomial::from_map(map));
    }

    #[test]
    #[serial]
    fn test_factors_to_polynomial_roundtrip() {
        setup();
        let roots = vec![(rn(1, 1), 1), (rn(-1, 1), 1)];
        let poly = factors_to_polynomial(&roots);

        // (x - 1)(x + 1) = x^2 - 1
        let dense = dense_coefficients(&poly);
        assert_eq!(dense[0], rn(-1, 1));
        assert_eq!(dense[1], rn(0, 1));
        assert_eq!(dense[2], rn(1, 1));
    }
}
