//! Dense linear algebra over the active prime field.
//!
//! Gauss-Jordan elimination for the mixed numerator/denominator systems, LU
//! factorization with partial pivoting for inversion and determinants, and
//! the transposed Vandermonde solver used by the polynomial interpolation.

use thiserror::Error;

use crate::field::FFInt;

pub type MatFF = Vec<Vec<FFInt>>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SolverError {
    /// The system has no unique solution. Fatal for the caller.
    #[error("singular system of equations")]
    SingularMatrix,
}

/// Solve an `n x (n + 1)` augmented system by Gauss-Jordan elimination to
/// row-reduced form. Row `i` is `[a_i1, ..., a_in | b_i]`.
pub fn solve_gauss_system(n: usize, mut a: MatFF) -> Result<Vec<FFInt>, SolverError> {
    debug_assert_eq!(a.len(), n);

    for col in 0..n {
        // Find pivot
        let pivot = (col..n)
            .find(|&row| !a[row][col].is_zero())
            .ok_or(SolverError::SingularMatrix)?;

        if pivot != col {
            a.swap(pivot, col);
        }

        // Scale pivot row
        let pivot_inv = a[col][col].try_inv().ok_or(SolverError::SingularMatrix)?;
        for j in col..=n {
            a[col][j] *= pivot_inv;
        }

        // Eliminate
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = a[row][col];
            if !factor.is_zero() {
                for j in col..=n {
                    let sub = factor * a[col][j];
                    a[row][j] -= sub;
                }
            }
        }
    }

    Ok(a.into_iter().map(|row| row[n]).collect())
}

/// Decompose `a` in place into LU form with partial pivoting.
///
/// Returns the permutation as a vector of row indices; the last entry counts
/// the number of row exchanges (needed for the determinant sign).
pub fn calc_lu_decomposition(a: &mut MatFF, n: usize) -> Result<Vec<usize>, SolverError> {
    let mut p: Vec<usize> = (0..=n).collect();
    p[n] = 0;

    for col in 0..n {
        let pivot = (col..n)
            .find(|&row| !a[row][col].is_zero())
            .ok_or(SolverError::SingularMatrix)?;

        if pivot != col {
            a.swap(pivot, col);
            p.swap(pivot, col);
            p[n] += 1;
        }

        let pivot_inv = a[col][col].inv();

        for row in (col + 1)..n {
            let factor = a[row][col] * pivot_inv;
            a[row][col] = factor;

            for j in (col + 1)..n {
                let sub = factor * a[col][j];
                a[row][j] -= sub;
            }
        }
    }

    Ok(p)
}

/// Solve `A x = b` for an already LU-decomposed `a`.
pub fn solve_lu(a: &MatFF, p: &[usize], b: &[FFInt], n: usize) -> Vec<FFInt> {
    let mut x: Vec<FFInt> = (0..n).map(|i| b[p[i]]).collect();

    // Forward substitution with L (unit diagonal)
    for i in 0..n {
        for j in 0..i {
            let sub = a[i][j] * x[j];
            x[i] -= sub;
        }
    }

    // Back substitution with U
    for i in (0..n).rev() {
        for j in (i + 1)..n {
            let sub = a[i][j] * x[j];
            x[i] -= sub;
        }
        x[i] /= a[i][i];
    }

    x
}

/// Invert an already LU-decomposed matrix.
pub fn calc_inverse_lu(a: &MatFF, p: &[usize], n: usize) -> MatFF {
    let mut inverse = vec![vec![FFInt::zero(); n]; n];

    for col in 0..n {
        let mut e = vec![FFInt::zero(); n];
        e[col] = FFInt::one();
        let x = solve_lu(a, p, &e, n);
        for row in 0..n {
            inverse[row][col] = x[row];
        }
    }

    inverse
}

/// Determinant of an already LU-decomposed matrix.
pub fn calc_determinant_lu(a: &MatFF, p: &[usize], n: usize) -> FFInt {
    let mut det = FFInt::one();
    for i in 0..n {
        det *= a[i][i];
    }

    if p[n] % 2 == 1 {
        -det
    } else {
        det
    }
}

/// Solve the transposed Vandermonde system `sum_i c_i v_j^i = s_j` for
/// pairwise distinct, non-zero nodes `vis`.
///
/// The master polynomial `prod_j (z - v_j)` is built incrementally and each
/// subfactor is removed by synthetic division.
pub fn solve_transposed_vandermonde(
    vis: &[FFInt],
    nums: &[FFInt],
) -> Result<Vec<FFInt>, SolverError> {
    let num_eqn = vis.len();
    debug_assert_eq!(nums.len(), num_eqn);

    for (i, vi) in vis.iter().enumerate() {
        if vi.is_zero() || vis[..i].contains(vi) {
            return Err(SolverError::SingularMatrix);
        }
    }

    if num_eqn == 1 {
        return Ok(vec![nums[0] / vis[0]]);
    }

    // Coefficients of the master polynomial
    // P(Z) = (Z - v_0)*(Z - v_1)*...*(Z - v_{n-1}) = c_0 + c_1*Z + ... + Z^n
    let mut cis = vec![FFInt::zero(); num_eqn];
    cis[num_eqn - 1] = -vis[0];

    for i in 1..num_eqn {
        for j in (num_eqn - 1 - i)..(num_eqn - 1) {
            let sub = vis[i] * cis[j + 1];
            cis[j] -= sub;
        }
        let last = vis[i];
        cis[num_eqn - 1] -= last;
    }

    // Synthetic division per node, multiplied against the right-hand side
    let mut result = vec![FFInt::zero(); num_eqn];

    for i in 0..num_eqn {
        let mut t = FFInt::one();
        let mut b = FFInt::one();
        let mut s = nums[num_eqn - 1];

        for j in (1..num_eqn).rev() {
            b = cis[j] + vis[i] * b;
            s += nums[j - 1] * b;
            t = vis[i] * t + b;
        }

        result[i] = s / t / vis[i];
    }

    Ok(result)
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
    fn test_gauss_solve() {
        setup();
        // 2x + y = 5, x + 3y = 10 => x = 1, y = 3
        let a = vec![vec![f(2), f(1), f(5)], vec![f(1), f(3), f(10)]];
        let x = solve_gauss_system(2, a).unwrap();
        assert_eq!(x, vec![f(1), f(3)]);
    }

    #[test]
    #[serial]
    fn test_gauss_singular() {
        setup();
        let a = vec![vec![f(1), f(2), f(3)], vec![f(2), f(4), f(6)]];
        assert_eq!(solve_gauss_system(2, a), Err(SolverError::SingularMatrix));
    }

    #[test]
    #[serial]
    fn test_lu_solve_and_det() {
        setup();
        let mut a = vec![vec![f(2), f(1)], vec![f(1), f(3)]];
        let p = calc_lu_decomposition(&mut a, 2).unwrap();

        let x = solve_lu(&a, &p, &[f(5), f(10)], 2);
        assert_eq!(x, vec![f(1), f(3)]);

        // det([[2,1],[1,3]]) = 5
        assert_eq!(calc_determinant_lu(&a, &p, 2), f(5));
    }

    #[test]
    #[serial]
    fn test_lu_inverse() {
        setup();
        let orig = vec![vec![f(2), f(1)], vec![f(1), f(3)]];
        let mut a = orig.clone();
        let p = calc_lu_decomposition(&mut a, 2).unwrap();
        let inv = calc_inverse_lu(&a, &p, 2);

        // orig * inv = identity
        for i in 0..2 {
            for j in 0..2 {
                let mut sum = FFInt::zero();
                for k in 0..2 {
                    sum += orig[i][k] * inv[k][j];
                }
                let expected = if i == j { FFInt::one() } else { FFInt::zero() };
                assert_eq!(sum, expected);
            }
        }
    }

    #[test]
    #[serial]
    fn test_transposed_vandermonde() {
        setup();
        // Coefficients c = [3, 5, 7] against nodes v = [2, 4, 9]:
        // s_j = sum_i c_i * v_i^(j+1)
        let vis = [f(2), f(4), f(9)];
        let c = [f(3), f(5), f(7)];

        let nums: Vec<FFInt> = (1..=3u64)
            .map(|j| {
                let mut s = FFInt::zero();
                for (ci, vi) in c.iter().zip(vis.iter()) {
                    s += *ci * vi.pow(j);
                }
                s
            })
            .collect();

        let solved = solve_transposed_vandermonde(&vis, &nums).unwrap();
        assert_eq!(solved, c);
    }

    #[test]
    #[serial]
    fn test_transposed_vandermonde_duplicate_nodes() {
        setup();
        let vis = [f(2), f(2)];
        let nums = [f(1), f(1)];
        assert_eq!(
            solve_transposed_vandermonde(&vis, &nums),
            Err(SolverError::SingularMatrix)
        );
    }
}
