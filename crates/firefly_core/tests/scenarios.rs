//! End-to-end reconstruction scenarios against closure black boxes.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Mutex;

use num_bigint::BigInt;
use serial_test::serial;

use firefly_core::{FFInt, RationalNumber, Reconstructor};

fn rn(n: i64, d: i64) -> RationalNumber {
    RationalNumber::new(BigInt::from(n), BigInt::from(d))
}

fn coefficient_map(poly: &firefly_core::Polynomial) -> HashMap<Vec<u32>, RationalNumber> {
    poly.coefs
        .iter()
        .map(|m| (m.powers.clone(), m.coef.clone()))
        .collect()
}

#[test]
#[serial]
fn univariate_rational() {
    // bb(x) = 2 / (2 + 7x + 30x^2)
    let bb = |point: &[FFInt]| {
        let x = point[0];
        vec![FFInt::new(2) / (FFInt::new(2) + FFInt::new(7) * x + FFInt::new(30) * x * x)]
    };

    let mut reconstructor = Reconstructor::new(1, 2, bb);
    reconstructor.set_seed(42);
    reconstructor.reconstruct(10).unwrap();

    let results = reconstructor.get_result();
    assert_eq!(results.len(), 1);

    let num = coefficient_map(&results[0].numerator);
    let den = coefficient_map(&results[0].denominator);

    assert_eq!(num.len(), 1);
    assert_eq!(num[&vec![0]], rn(1, 1));
    assert_eq!(den.len(), 3);
    assert_eq!(den[&vec![0]], rn(1, 1));
    assert_eq!(den[&vec![1]], rn(7, 2));
    assert_eq!(den[&vec![2]], rn(15, 1));
}

#[test]
#[serial]
fn trivial_constant() {
    let bb = |_point: &[FFInt]| vec![FFInt::new(3)];

    let mut reconstructor = Reconstructor::new(3, 2, bb);
    reconstructor.set_seed(7);
    reconstructor.reconstruct(5).unwrap();

    let results = reconstructor.get_result();
    assert_eq!(results.len(), 1);

    let num = coefficient_map(&results[0].numerator);
    let den = coefficient_map(&results[0].denominator);
    assert_eq!(num.len(), 1);
    assert_eq!(num[&vec![0, 0, 0]], rn(3, 1));
    assert_eq!(den.len(), 1);
    assert_eq!(den[&vec![0, 0, 0]], rn(1, 1));
}

#[test]
#[serial]
fn sparse_bivariate_with_shift_scan() {
    // bb(x, y) = (x + y) / (x*y + 1)
    let bb = |point: &[FFInt]| {
        vec![(point[0] + point[1]) / (point[0] * point[1] + FFInt::one())]
    };

    let mut reconstructor = Reconstructor::new(2, 2, bb);
    reconstructor.set_seed(11);
    reconstructor.enable_shift_scan();
    reconstructor.reconstruct(10).unwrap();

    let results = reconstructor.get_result();
    assert_eq!(results.len(), 1);

    let num = coefficient_map(&results[0].numerator);
    let den = coefficient_map(&results[0].denominator);
    assert_eq!(num.len(), 2);
    assert_eq!(num[&vec![1, 0]], rn(1, 1));
    assert_eq!(num[&vec![0, 1]], rn(1, 1));
    assert_eq!(den.len(), 2);
    assert_eq!(den[&vec![0, 0]], rn(1, 1));
    assert_eq!(den[&vec![1, 1]], rn(1, 1));
}

#[test]
#[serial]
fn multiple_functions_at_once() {
    let bb = |point: &[FFInt]| {
        let (x, y) = (point[0], point[1]);
        vec![
            // a polynomial
            FFInt::new(5) * x * x + y,
            // a rational function with fractional coefficients
            (x + FFInt::new(3)) / (FFInt::new(2) * y + FFInt::one()),
            // a constant
            FFInt::new(9) / FFInt::new(4),
        ]
    };

    let mut reconstructor = Reconstructor::new(2, 4, bb);
    reconstructor.set_seed(23);
    reconstructor.reconstruct(10).unwrap();

    let results = reconstructor.get_result();
    assert_eq!(results.len(), 3);

    let num0 = coefficient_map(&results[0].numerator);
    assert_eq!(num0[&vec![2, 0]], rn(5, 1));
    assert_eq!(num0[&vec![0, 1]], rn(1, 1));

    let num1 = coefficient_map(&results[1].numerator);
    let den1 = coefficient_map(&results[1].denominator);
    assert_eq!(num1[&vec![1, 0]], rn(1, 1));
    assert_eq!(num1[&vec![0, 0]], rn(3, 1));
    assert_eq!(den1[&vec![0, 0]], rn(1, 1));
    assert_eq!(den1[&vec![0, 1]], rn(2, 1));

    let num2 = coefficient_map(&results[2].numerator);
    assert_eq!(num2[&vec![0, 0]], rn(9, 4));
}

/// The reconstructed function agrees with the black box at a fresh
/// random point.
#[test]
#[serial]
fn agreement_with_black_box_at_fresh_points() {
    let bb = |point: &[FFInt]| {
        let (x, y, z) = (point[0], point[1], point[2]);
        let num = FFInt::new(7) * x * y + FFInt::new(2) / FFInt::new(5) * z * z * z;
        let den = FFInt::one() + x * x + FFInt::new(11) * y * z;
        vec![num / den]
    };

    let mut reconstructor = Reconstructor::new(3, 4, bb);
    reconstructor.set_seed(31);
    reconstructor.reconstruct(10).unwrap();

    let results = reconstructor.get_result();
    assert_eq!(results.len(), 1);

    // Evaluate under the first prime at fresh points.
    FFInt::set_new_prime(firefly_core::primes::primes()[0]);
    for seed in [999u64, 123_456, 777_777_777] {
        let point = [
            FFInt::new(seed),
            FFInt::new(seed.wrapping_mul(31) + 7),
            FFInt::new(seed.wrapping_mul(101) + 13),
        ];
        let expected = bb(&point)[0];
        assert_eq!(results[0].eval_ff(&point), expected);
    }
}

/// No t is ever reused for a zi-order within one prime.
#[test]
#[serial]
fn probe_deduplication() {
    let seen = Mutex::new(HashSet::new());

    let bb = move |point: &[FFInt]| {
        let key: (u64, Vec<u64>) = (FFInt::prime(), point.iter().map(|v| v.n).collect());
        assert!(
            seen.lock().unwrap().insert(key),
            "probe point evaluated twice within one prime"
        );
        vec![(point[0] + FFInt::one()) / (point[0] * point[1] + FFInt::new(2))]
    };

    let mut reconstructor = Reconstructor::new(2, 2, bb);
    reconstructor.set_seed(47);
    reconstructor.reconstruct(10).unwrap();
    assert_eq!(reconstructor.get_result().len(), 1);
}

#[test]
#[serial]
fn factor_scan_strips_univariate_factors() {
    // bb(x, y) = (x^2 - 1)(y + 2) / (x + 3)
    let bb = |point: &[FFInt]| {
        let (x, y) = (point[0], point[1]);
        vec![(x * x - FFInt::one()) * (y + FFInt::new(2)) / (x + FFInt::new(3))]
    };

    let mut reconstructor = Reconstructor::new(2, 2, bb);
    reconstructor.set_seed(53);
    reconstructor.enable_factor_scan();
    reconstructor.reconstruct(10).unwrap();

    let results = reconstructor.get_result();
    assert_eq!(results.len(), 1);
    assert!(
        !results[0].factors.is_empty(),
        "factor scan found no factors"
    );

    // The residual multivariate part is the constant 1.
    let num = coefficient_map(&results[0].numerator);
    let den = coefficient_map(&results[0].denominator);
    assert_eq!(num.len(), 1);
    assert_eq!(den.len(), 1);

    // The full result, factors included, agrees with the black box.
    FFInt::set_new_prime(firefly_core::primes::primes()[0]);
    for seed in [17u64, 100_003, 999_999_937] {
        let point = [FFInt::new(seed), FFInt::new(seed.wrapping_mul(13) + 5)];
        assert_eq!(results[0].eval_ff(&point), bb(&point)[0]);
    }
}

#[test]
#[serial]
fn bunched_evaluation() {
    // Bunch size 4 with a single worker: must terminate and agree.
    let bb = |point: &[FFInt]| {
        vec![(point[0] + point[1]) / (point[0] * point[1] + FFInt::one())]
    };

    let mut reconstructor = Reconstructor::with_bunch_size(2, 1, 4, bb);
    reconstructor.set_seed(61);
    reconstructor.reconstruct(10).unwrap();

    let results = reconstructor.get_result();
    assert_eq!(results.len(), 1);

    let num = coefficient_map(&results[0].numerator);
    let den = coefficient_map(&results[0].denominator);
    assert_eq!(num[&vec![1, 0]], rn(1, 1));
    assert_eq!(num[&vec![0, 1]], rn(1, 1));
    assert_eq!(den[&vec![1, 1]], rn(1, 1));
}

#[test]
#[serial]
fn safe_mode_reconstruction() {
    let bb = |point: &[FFInt]| {
        vec![(point[0] * point[0] + FFInt::new(3)) / (point[1] + FFInt::new(2))]
    };

    let mut reconstructor = Reconstructor::new(2, 2, bb);
    reconstructor.set_seed(71);
    reconstructor.set_safe_interpolation();
    reconstructor.reconstruct(20).unwrap();

    let results = reconstructor.get_result();
    assert_eq!(results.len(), 1);

    let num = coefficient_map(&results[0].numerator);
    let den = coefficient_map(&results[0].denominator);
    assert_eq!(num[&vec![2, 0]], rn(1, 2));
    assert_eq!(num[&vec![0, 0]], rn(3, 2));
    assert_eq!(den[&vec![0, 0]], rn(1, 1));
    assert_eq!(den[&vec![0, 1]], rn(1, 2));
}

#[test]
#[serial]
fn early_results_are_collectable() {
    let bb = |point: &[FFInt]| vec![point[0] + FFInt::new(5), FFInt::new(2)];

    let mut reconstructor = Reconstructor::new(1, 2, bb);
    reconstructor.set_seed(83);
    reconstructor.reconstruct(10).unwrap();

    let early = reconstructor.get_early_results();
    assert_eq!(early.len(), 2);
    assert_eq!(early[0].0, "0");
    assert_eq!(early[1].0, "1");

    // Collected results are marked for deletion and not returned again.
    assert!(reconstructor.get_early_results().is_empty());
}
