//! Polynomials and rational functions over the rationals.
//!
//! These are the final results of a reconstruction. Monomials are kept
//! sorted by total degree, ties broken colexicographically.

use std::collections::HashMap;
use std::fmt;

use crate::field::FFInt;
use crate::poly_ff::degree_colex_cmp;
use crate::rational::RationalNumber;

/// A monomial with a rational coefficient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Monomial {
    pub powers: Vec<u32>,
    pub coef: RationalNumber,
}

/// A sparse polynomial with rational coefficients.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Polynomial {
    pub coefs: Vec<Monomial>,
}

impl Polynomial {
    /// Build from a coefficient map, dropping zeros and sorting.
    pub fn from_map(map: HashMap<Vec<u32>, RationalNumber>) -> Self {
        let mut coefs: Vec<Monomial> = map
            .into_iter()
            .filter(|(_, coef)| !coef.is_zero())
            .map(|(powers, coef)| Monomial { powers, coef })
            .collect();
        coefs.sort_by(|a, b| degree_colex_cmp(&a.powers, &b.powers));
        Self { coefs }
    }

    pub fn constant(n: usize, coef: RationalNumber) -> Self {
        if coef.is_zero() {
            return Self::default();
        }
        Self {
            coefs: vec![Monomial { powers: vec![0; n], coef }],
        }
    }

    pub fn is_zero(&self) -> bool {
        self.coefs.is_empty()
    }

    /// Multiply every coefficient by a rational factor.
    pub fn scale(&self, factor: &RationalNumber) -> Self {
        Self {
            coefs: self
                .coefs
                .iter()
                .map(|m| Monomial {
                    powers: m.powers.clone(),
                    coef: &m.coef * factor,
                })
                .collect(),
        }
    }

    /// Evaluate modulo the active prime.
    pub fn eval_ff(&self, values: &[FFInt]) -> FFInt {
        let mut result = FFInt::zero();

        for m in &self.coefs {
            let mut term = m.coef.to_ffint();
            for (v, &e) in values.iter().zip(m.powers.iter()) {
                if e != 0 {
                    term *= v.pow(e as u64);
                }
            }
            result += term;
        }

        result
    }

    /// Render in Horner form with respect to the given variable names.
    pub fn to_horner(&self, vars: &[&str]) -> String {
        horner(&self.coefs, vars, 0)
    }
}

/// Recursive Horner factoring, variable by variable.
fn horner(monomials: &[Monomial], vars: &[&str], var: usize) -> String {
    if monomials.is_empty() {
        return "0".to_string();
    }

    if var == vars.len() {
        // Only the constant can remain.
        return monomials[0].coef.to_string();
    }

    // Group by the power of the current variable.
    let mut by_power: Vec<(u32, Vec<Monomial>)> = Vec::new();
    for m in monomials {
        let p = m.powers[var];
        match by_power.iter_mut().find(|(q, _)| *q == p) {
            Some((_, group)) => group.push(m.clone()),
            None => by_power.push((p, vec![m.clone()])),
        }
    }
    by_power.sort_by_key(|(p, _)| *p);

    // Single group: factor the power out entirely.
    if by_power.len() == 1 {
        let (p, group) = &by_power[0];
        let inner = horner(group, vars, var + 1);
        return if *p == 0 {
            inner
        } else {
            format!("{}*({})", var_pow(vars[var], *p), inner)
        };
    }

    // Horner: c_0 + x*(c_1 + x*(c_2 + ...)) over the occurring powers.
    let mut result = String::new();
    let mut prev_power = 0u32;

    for (i, (p, group)) in by_power.iter().enumerate().rev() {
        let inner = horner(group, vars, var + 1);

        if i == by_power.len() - 1 {
            result = format!("({inner})");
        } else {
            result = format!("({inner}+{}*{result})", var_pow(vars[var], prev_power - p));
        }
        prev_power = *p;
    }

    if prev_power > 0 {
        result = format!("{}*{result}", var_pow(vars[var], prev_power));
    }

    result
}

fn var_pow(var: &str, pow: u32) -> String {
    if pow == 1 {
        var.to_string()
    } else {
        format!("{var}^{pow}")
    }
}

/// A univariate factor stripped off by the factor scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnivariateFactor {
    /// Index of the variable the factor depends on.
    pub var: usize,
    pub numerator: Polynomial,
    pub denominator: Polynomial,
}

impl UnivariateFactor {
    /// Evaluate the factor modulo the active prime at the full point.
    pub fn eval_ff(&self, values: &[FFInt]) -> FFInt {
        let v = [values[self.var]];
        self.numerator.eval_ff(&v) / self.denominator.eval_ff(&v)
    }
}

/// A reconstructed rational function.
///
/// Normal form: the lexicographically first monomial of the denominator has
/// coefficient 1.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RationalFunction {
    pub numerator: Polynomial,
    pub denominator: Polynomial,
    /// Maps internal variable index to the user's variable index when the
    /// factor scan reordered variables.
    pub var_order: Option<Vec<usize>>,
    /// Univariate factors divided out before the multivariate reconstruction.
    pub factors: Vec<UnivariateFactor>,
}

impl RationalFunction {
    pub fn new(numerator: Polynomial, denominator: Polynomial) -> Self {
        let mut rf = Self {
            numerator,
            denominator,
            var_order: None,
            factors: Vec::new(),
        };
        rf.normalize();
        rf
    }

    /// Rescale so that the first denominator coefficient is 1.
    fn normalize(&mut self) {
        let first = match self.denominator.coefs.first() {
            Some(m) => m.coef.clone(),
            None => return,
        };

        if !first.is_one() {
            let eq = first.invert();
            self.numerator = self.numerator.scale(&eq);
            self.denominator = self.denominator.scale(&eq);
        }
    }

    pub fn set_var_order(&mut self, order: Vec<usize>) {
        self.var_order = Some(order);
    }

    pub fn add_factor(&mut self, factor: UnivariateFactor) {
        self.factors.push(factor);
    }

    /// Evaluate modulo the active prime, including stripped factors and the
    /// variable permutation.
    pub fn eval_ff(&self, values: &[FFInt]) -> FFInt {
        let permuted: Vec<FFInt> = match &self.var_order {
            Some(order) => order.iter().map(|&i| values[i]).collect(),
            None => values.to_vec(),
        };

        let mut result =
            self.numerator.eval_ff(&permuted) / self.denominator.eval_ff(&permuted);

        for factor in &self.factors {
            result *= factor.eval_ff(values);
        }

        result
    }

    /// Render as `(num)/(den)` in Horner form, with factors multiplied in
    /// front.
    pub fn to_string_with_vars(&self, vars: &[&str]) -> String {
        let internal_vars: Vec<&str> = match &self.var_order {
            Some(order) => order.iter().map(|&i| vars[i]).collect(),
            None => vars.to_vec(),
        };

        let mut out = String::new();

        for factor in &self.factors {
            let fvars = [vars[factor.var]];
            out.push_str(&format!(
                "({})/({})*",
                factor.numerator.to_horner(&fvars),
                factor.denominator.to_horner(&fvars)
            ));
        }

        out.push_str(&format!(
            "({})/({})",
            self.numerator.to_horner(&internal_vars),
            self.denominator.to_horner(&internal_vars)
        ));

        out
    }
}

impl fmt::Display for RationalFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self
            .numerator
            .coefs
            .first()
            .or_else(|| self.denominator.coefs.first())
            .map(|m| m.powers.len())
            .unwrap_or(0);
        let names: Vec<String> = (1..=n).map(|i| format!("x{i}")).collect();
        let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        write!(f, "{}", self.to_string_with_vars(&refs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use num_bigint::BigInt;

    fn rn(n: i64, d: i64) -> RationalNumber {
        RationalNumber::new(BigInt::from(n), BigInt::from(d))
    }

    #[test]
    #[serial]
    fn test_normalization() {
        // (2x) / (2 + 4x) -> (x) / (1 + 2x)
        let mut num = HashMap::new();
        num.insert(vec![1], rn(2, 1));
        let mut den = HashMap::new();
        den.insert(vec![0], rn(2, 1));
        den.insert(vec![1], rn(4, 1));

        let rf = RationalFunction::new(Polynomial::from_map(num), Polynomial::from_map(den));

        assert_eq!(rf.denominator.coefs[0].coef, rn(1, 1));
        assert_eq!(rf.denominator.coefs[1].coef, rn(2, 1));
        assert_eq!(rf.numerator.coefs[0].coef, rn(1, 1));
    }

    #[test]
    #[serial]
    fn test_eval_ff() {
        crate::field::FFInt::set_new_prime(crate::primes::primes()[0]);

        // (x + y) / (x*y + 1) at (2, 3): 5 / 7
        let mut num = HashMap::new();
        num.insert(vec![1, 0], rn(1, 1));
        num.insert(vec![0, 1], rn(1, 1));
        let mut den = HashMap::new();
        den.insert(vec![1, 1], rn(1, 1));
        den.insert(vec![0, 0], rn(1, 1));

        let rf = RationalFunction::new(Polynomial::from_map(num), Polynomial::from_map(den));
        let v = rf.eval_ff(&[FFInt::new(2), FFInt::new(3)]);
        assert_eq!(v, FFInt::new(5) / FFInt::new(7));
    }

    #[test]
    #[serial]
    fn test_horner_univariate() {
        // 1 + 7/2 x + 15 x^2
        let mut map = HashMap::new();
        map.insert(vec![0], rn(1, 1));
        map.insert(vec![1], rn(7, 2));
        map.insert(vec![2], rn(15, 1));
        let poly = Polynomial::from_map(map);

        let s = poly.to_horner(&["x"]);
        assert_eq!(s, "(1+x*(7/2+x*(15)))");
    }

    #[test]
    #[serial]
    fn test_horner_eval_consistency() {
        crate::field::FFInt::set_new_prime(crate::primes::primes()[0]);

        let mut map = HashMap::new();
        map.insert(vec![0, 0], rn(3, 1));
        map.insert(vec![2, 1], rn(-5, 7));
        map.insert(vec![0, 3], rn(11, 2));
        let poly = Polynomial::from_map(map);

        // The Horner string is only rendered; here just check it is formed.
        let s = poly.to_horner(&["x", "y"]);
        assert!(s.contains('x') && s.contains('y'));
    }
}
