//! FireFly core: reconstruction of multivariate rational functions over the
//! rationals from black-box probes over prime fields.
//!
//! # Overview
//!
//! The engine probes a user-supplied [`BlackBox`] at points of word-sized
//! prime fields and reconstructs every output as an exact rational function
//! with the minimum number of probes:
//!
//! 1. A univariate Thiele interpolation pins the degree bounds.
//! 2. Newton/Vandermonde interpolation recovers the multivariate
//!    coefficients in the first prime field.
//! 3. Chinese Remainder lifting over further primes and rational
//!    reconstruction produce the exact rational coefficients, confirmed by
//!    a guess test against a fresh probe.
//!
//! The [`Reconstructor`] schedules the probes over a thread pool, drives
//! the optional shift and factor scans, and can checkpoint and resume a run
//! from disk.
//!
//! # Example
//!
//! ```no_run
//! use firefly_core::{FFInt, Reconstructor};
//!
//! // f(x, y) = (x + y) / (x*y + 1)
//! let bb = |point: &[FFInt]| {
//!     vec![(point[0] + point[1]) / (point[0] * point[1] + FFInt::one())]
//! };
//!
//! let mut reconstructor = Reconstructor::new(2, 4, bb);
//! reconstructor.reconstruct(100).unwrap();
//! let result = reconstructor.get_result();
//! println!("{}", result[0]);
//! ```

pub mod arith;
pub mod black_box;
pub mod dense_solver;
pub mod error;
pub mod factor;
pub mod field;
pub mod poly;
pub mod poly_ff;
pub mod poly_reconst;
pub mod pool;
pub mod primes;
pub mod rat_reconst;
pub mod rational;
pub mod reconstructor;
pub mod save_state;
pub mod thiele;

pub use black_box::BlackBox;
pub use error::{FireFlyError, Result};
pub use field::FFInt;
pub use poly::{Polynomial, RationalFunction, UnivariateFactor};
pub use poly_ff::PolynomialFF;
pub use rat_reconst::{PrimeContext, RatReconst};
pub use rational::RationalNumber;
pub use reconstructor::Reconstructor;
