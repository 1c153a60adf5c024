//! Per-function reconstruction of one multivariate rational function.
//!
//! A `RatReconst` consumes black-box probes fed by the scheduler and walks
//! through the phases
//!
//! Uni-Thiele -> Multi-Newton -> Normalization -> CRT-Lifting <-> RationalTest -> Done
//!
//! On the first prime a univariate Thiele interpolation in t pins the
//! maximal numerator and denominator degrees. The multivariate phase then
//! solves one univariate linear system per zi-order round and routes the
//! per-degree coefficients into `PolyReconst` objects, subtracting the
//! shift-induced contributions of already solved degrees. Each later prime
//! only re-solves the coefficients that have not yet stabilized under the
//! Chinese Remainder lifting; a reconstruction is finished once every
//! combined coefficient lifts to a rational number and a fresh probe agrees
//! with the guess.
//!
//! Feeding and interpolating are decoupled: `feed` only enqueues under a
//! short lock, `interpolate` drains the queue while holding an exclusive
//! interpolation flag, so at most one thread advances the state while
//! others keep appending probes.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{info, warn};
use num_bigint::BigInt;
use num_traits::Zero;

use crate::arith::{chinese_remainder, rational_reconstruct};
use crate::dense_solver::{
    calc_lu_decomposition, solve_gauss_system, solve_lu, solve_transposed_vandermonde,
};
use crate::error::{FireFlyError, Result};
use crate::field::FFInt;
use crate::poly::{Polynomial, RationalFunction};
use crate::poly_ff::{colex_cmp, FFMap, PolynomialFF};
use crate::poly_reconst::{monomial_node, PolyReconst};
use crate::rational::RationalNumber;
use crate::thiele::{ThieleError, ThieleInterpolator, ThieleStatus};

/// Per-prime interpolation context owned by the scheduler.
///
/// Regenerated at every new-prime barrier and handed to each function;
/// immutable afterwards.
#[derive(Debug, Clone)]
pub struct PrimeContext {
    pub prime_index: usize,
    /// Anchor points for z_2, ..., z_n.
    pub anchors: Vec<FFInt>,
    /// Shift added to every probe coordinate; all zero when disabled.
    pub shift: Vec<FFInt>,
}

impl PrimeContext {
    /// Anchor points raised to the given zi-order: the z-coordinates of a
    /// probe before multiplication with t and addition of the shift.
    pub fn yis(&self, zi_order: &[u32]) -> Vec<FFInt> {
        self.anchors
            .iter()
            .zip(zi_order.iter())
            .map(|(a, &o)| a.pow(o as u64))
            .collect()
    }

    /// The full probe point for a given t and zi-order.
    pub fn probe_point(&self, t: FFInt, zi_order: &[u32]) -> Vec<FFInt> {
        let mut values = Vec::with_capacity(self.shift.len());
        values.push(t + self.shift[0]);
        for (i, y) in self.yis(zi_order).into_iter().enumerate() {
            values.push(y * t + self.shift[i + 1]);
        }
        values
    }

    pub fn has_shift(&self) -> bool {
        self.shift.iter().any(|s| !s.is_zero())
    }
}

/// Result of one `interpolate` call, mirrored into the status snapshot.
#[derive(Debug, Clone, Copy)]
pub struct InterpolateResult {
    /// False when another thread already held the interpolation turn.
    pub interpolated: bool,
    pub done: bool,
    pub prime: usize,
}

/// Snapshot of the externally visible state, readable without contending
/// with a running interpolation.
#[derive(Debug, Clone, Default)]
struct Status {
    done: bool,
    new_prime: bool,
    prime_number: usize,
    num_eqn: usize,
    zi_order: Vec<u32>,
    needs_new_shift: bool,
    needs_new_anchors: bool,
    scan_finished: bool,
    shift_works: bool,
}

const MAX_ANCHOR_RETRIES: u32 = 4;

/// One degree-by-degree reconstruction cascade (numerator or denominator).
///
/// Degrees are solved from the maximum down: the coefficient of t^d in the
/// shifted function mixes the degree-d part with shift contributions of all
/// higher parts, so lower degrees wait for the subtraction polynomials of
/// the solved higher ones.
#[derive(Debug, Default)]
struct Cascade {
    /// Degree currently being reconstructed, counting down. None when done.
    curr_deg: Option<u32>,
    lowest_deg: u32,
    recs: HashMap<u32, PolyReconst>,
    /// Raw per-round values per degree; index j belongs to round j + 1.
    saved: HashMap<u32, Vec<FFInt>>,
    consumed: HashMap<u32, usize>,
    /// Shift-induced subtraction terms grouped by total degree (n vars).
    sub: HashMap<u32, PolynomialFF>,
    /// Finished degree polynomials in the z variables (n - 1 vars).
    results: HashMap<u32, PolynomialFF>,
}

impl Cascade {
    fn init(n_z: usize, max_deg: u32, lowest_deg: u32) -> Self {
        let mut recs = HashMap::new();
        for d in lowest_deg..=max_deg {
            recs.insert(d, PolyReconst::new(n_z, d));
        }
        Self {
            curr_deg: Some(max_deg),
            lowest_deg,
            recs,
            saved: HashMap::new(),
            consumed: HashMap::new(),
            sub: HashMap::new(),
            results: HashMap::new(),
        }
    }

    fn is_done(&self) -> bool {
        self.curr_deg.is_none()
    }

    fn solved_count(&self) -> usize {
        self.results.len()
    }

    fn is_solved(&self, deg: u32) -> bool {
        self.results.contains_key(&deg)
    }

    /// Record the raw value of every still-unsolved degree for this round.
    fn push_round_values(&mut self, values: &HashMap<u32, FFInt>) {
        for (&deg, &value) in values {
            self.saved.entry(deg).or_default().push(value);
        }
    }

    /// Evaluate the solved part of the t^deg coefficient at the given round
    /// point: the degree polynomial itself plus its stored subtraction term.
    fn solved_contribution(&self, deg: u32, yis_z: &[FFInt], yis_full: &[FFInt]) -> FFInt {
        let mut res = self.results[&deg].eval(yis_z);
        if let Some(sub) = self.sub.get(&deg) {
            res += sub.eval(yis_full);
        }
        res
    }
}

/// A probe waiting to be interpolated.
type Probe = (FFInt, FFInt, Vec<u32>);

/// Reconstruction state, guarded by the state mutex.
struct RatState {
    n: usize,
    tag: String,
    context: Arc<PrimeContext>,
    prime_number: usize,
    done: bool,
    new_prime: bool,
    use_chinese_remainder: bool,
    safe_mode: bool,

    curr_zi_order: Vec<u32>,
    saved_ti: HashMap<Vec<u32>, Vec<(FFInt, FFInt)>>,

    // Phase 1
    thiele: ThieleInterpolator,
    used_ts: HashSet<u64>,
    max_deg_num: Option<u32>,
    max_deg_den: Option<u32>,
    needs_new_shift: bool,
    needs_new_anchors: bool,
    anchor_retries: u32,

    // Shift scan
    is_scan: bool,
    scan_finished: bool,
    shift_works: bool,
    expected_degrees: Option<(u32, u32)>,

    // Phase 2 (first prime, and every prime in safe mode)
    num_cascade: Cascade,
    den_cascade: Cascade,

    // Shared linear system of the current round
    coef_mat: Vec<Vec<FFInt>>,
    num_eqn: usize,

    // CRT phase
    non_solved_num: BTreeMap<u32, Vec<Vec<u32>>>,
    non_solved_den: BTreeMap<u32, Vec<Vec<u32>>>,
    class_values_num: BTreeMap<u32, Vec<FFInt>>,
    class_values_den: BTreeMap<u32, Vec<FFInt>>,
    solved_num: PolynomialFF,
    solved_den: PolynomialFF,

    combined_prime: BigInt,
    combined_ni: HashMap<Vec<u32>, BigInt>,
    combined_di: HashMap<Vec<u32>, BigInt>,
    g_ni: HashMap<Vec<u32>, RationalNumber>,
    g_di: HashMap<Vec<u32>, RationalNumber>,

    result: Option<RationalFunction>,
}

/// Reconstructs one scalar rational function of n variables from a stream
/// of black-box values.
pub struct RatReconst {
    queue: Mutex<VecDeque<Probe>>,
    interpolating: AtomicBool,
    state: Mutex<RatState>,
    status: Mutex<Status>,
}

impl RatReconst {
    pub fn new(n: usize, context: Arc<PrimeContext>) -> Self {
        let state = RatState {
            n,
            tag: String::new(),
            prime_number: context.prime_index,
            context,
            done: false,
            new_prime: false,
            use_chinese_remainder: false,
            safe_mode: false,
            curr_zi_order: vec![1; n.saturating_sub(1)],
            saved_ti: HashMap::new(),
            thiele: ThieleInterpolator::new(),
            used_ts: HashSet::new(),
            max_deg_num: None,
            max_deg_den: None,
            needs_new_shift: false,
            needs_new_anchors: false,
            anchor_retries: 0,
            is_scan: false,
            scan_finished: false,
            shift_works: false,
            expected_degrees: None,
            num_cascade: Cascade::default(),
            den_cascade: Cascade::default(),
            coef_mat: Vec::new(),
            num_eqn: 1,
            non_solved_num: BTreeMap::new(),
            non_solved_den: BTreeMap::new(),
            class_values_num: BTreeMap::new(),
            class_values_den: BTreeMap::new(),
            solved_num: PolynomialFF::zero(n),
            solved_den: PolynomialFF::zero(n),
            combined_prime: BigInt::from(FFInt::prime()),
            combined_ni: HashMap::new(),
            combined_di: HashMap::new(),
            g_ni: HashMap::new(),
            g_di: HashMap::new(),
            result: None,
        };

        let status = Status {
            num_eqn: 1,
            prime_number: state.prime_number,
            zi_order: state.curr_zi_order.clone(),
            ..Status::default()
        };

        Self {
            queue: Mutex::new(VecDeque::new()),
            interpolating: AtomicBool::new(false),
            state: Mutex::new(state),
            status: Mutex::new(status),
        }
    }

    pub fn set_tag(&self, tag: &str) {
        self.state.lock().unwrap().tag = tag.to_string();
    }

    pub fn get_tag(&self) -> String {
        self.state.lock().unwrap().tag.clone()
    }

    pub fn set_safe_interpolation(&self) {
        self.state.lock().unwrap().safe_mode = true;
    }

    /// Put this function into shift-scan mode: stop after the Thiele phase
    /// and report whether the current shift keeps the denominator constant
    /// and the known degree bounds intact.
    pub fn scan_for_sparsest_shift(&self) {
        self.state.lock().unwrap().is_scan = true;
    }

    pub fn set_expected_degrees(&self, num: u32, den: u32) {
        self.state.lock().unwrap().expected_degrees = Some((num, den));
    }

    /// Install the interpolation context of a new prime.
    pub fn set_context(&self, context: Arc<PrimeContext>) {
        self.state.lock().unwrap().context = context;
    }

    /// Enqueue a probe result. Probes of a stale prime are dropped, probes
    /// of a mismatched zi-order are buffered during interpolation.
    pub fn feed(&self, t: FFInt, value: FFInt, zi_order: &[u32], fed_prime: usize) {
        let state_prime = self.status.lock().unwrap().prime_number;
        if fed_prime == state_prime {
            self.queue
                .lock()
                .unwrap()
                .push_back((t, value, zi_order.to_vec()));
        }
    }

    /// Drain the probe queue and advance the reconstruction.
    ///
    /// Only one thread interpolates at a time; concurrent callers return
    /// immediately with `interpolated == false`.
    pub fn interpolate(&self) -> Result<InterpolateResult> {
        loop {
            if self
                .interpolating
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                let status = self.status.lock().unwrap();
                return Ok(InterpolateResult {
                    interpolated: false,
                    done: status.done,
                    prime: status.prime_number,
                });
            }

            let result = self.interpolate_exclusive();
            self.interpolating.store(false, Ordering::Release);

            // A probe enqueued between the final drain check and the flag
            // release would be stranded; retry until the queue stays empty.
            if self.queue.lock().unwrap().is_empty() {
                return result;
            }
        }
    }

    fn interpolate_exclusive(&self) -> Result<InterpolateResult> {
        let mut state = self.state.lock().unwrap();

        loop {
            let probe = self.queue.lock().unwrap().pop_front();
            let Some((t, value, zi_order)) = probe else {
                break;
            };

            state.interpolate_probe(t, value, &zi_order)?;

            // Consume buffered probes whose order has become current.
            while let Some((t, value)) = state.pop_saved() {
                let order = state.curr_zi_order.clone();
                state.interpolate_probe(t, value, &order)?;
            }
        }

        let snapshot = state.snapshot();
        let result = InterpolateResult {
            interpolated: true,
            done: snapshot.done,
            prime: snapshot.prime_number,
        };
        *self.status.lock().unwrap() = snapshot;
        Ok(result)
    }

    pub fn is_done(&self) -> bool {
        self.status.lock().unwrap().done
    }

    pub fn is_new_prime(&self) -> bool {
        self.status.lock().unwrap().new_prime
    }

    pub fn get_prime(&self) -> usize {
        self.status.lock().unwrap().prime_number
    }

    /// Number of probes at the current zi-order still needed before the
    /// next system can be solved.
    pub fn get_num_eqn(&self) -> usize {
        self.status.lock().unwrap().num_eqn
    }

    /// The zi-orders the scheduler should queue next, with probe counts.
    pub fn get_zi_orders(&self) -> Vec<(Vec<u32>, usize)> {
        let status = self.status.lock().unwrap();
        if status.done {
            return Vec::new();
        }
        vec![(status.zi_order.clone(), status.num_eqn.max(1))]
    }

    /// The full schedule of uniform zi-orders needed to finish the current
    /// prime, used for prefetching in the lifting phase: for round o the
    /// count is the number of coefficient classes of size >= o. Empty in
    /// safe mode, where every prime runs the full dense pipeline instead.
    pub fn get_needed_feed_vec(&self) -> Vec<(u32, usize)> {
        let state = self.state.lock().unwrap();
        if state.safe_mode {
            return Vec::new();
        }
        let mut sizes: Vec<usize> = state
            .non_solved_num
            .values()
            .chain(state.non_solved_den.values())
            .map(|class| class.len())
            .collect();
        sizes.sort_unstable_by(|a, b| b.cmp(a));

        let mut schedule = Vec::new();
        let max_size = sizes.first().copied().unwrap_or(0);
        for o in 1..=max_size {
            let count = sizes.iter().take_while(|&&s| s >= o).count();
            schedule.push((o as u32, count));
        }
        schedule
    }

    pub fn needs_new_shift(&self) -> bool {
        self.status.lock().unwrap().needs_new_shift
    }

    pub fn needs_new_anchors(&self) -> bool {
        self.status.lock().unwrap().needs_new_anchors
    }

    pub fn is_shift_scan_finished(&self) -> bool {
        self.status.lock().unwrap().scan_finished
    }

    pub fn is_shift_working(&self) -> bool {
        self.status.lock().unwrap().shift_works
    }

    /// Degree bounds, once the Thiele phase pinned them.
    pub fn get_max_degrees(&self) -> Option<(u32, u32)> {
        let state = self.state.lock().unwrap();
        Some((state.max_deg_num?, state.max_deg_den?))
    }

    /// Restart the Thiele phase after the shared shift was redrawn.
    pub fn reset_uni_phase(&self) {
        let mut state = self.state.lock().unwrap();
        state.thiele = ThieleInterpolator::new();
        state.used_ts.clear();
        state.saved_ti.clear();
        state.max_deg_num = None;
        state.max_deg_den = None;
        state.needs_new_shift = false;
        state.scan_finished = false;
        state.num_eqn = 1;
        self.queue.lock().unwrap().clear();
        *self.status.lock().unwrap() = state.snapshot();
    }

    /// Restart the multivariate phase after the anchor points were redrawn.
    /// The degree bounds from the Thiele phase are kept.
    pub fn reset_multivariate_phase(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.anchor_retries += 1;
        if state.anchor_retries > MAX_ANCHOR_RETRIES {
            return Err(FireFlyError::Algorithm(format!(
                "rank deficiency persisted over {MAX_ANCHOR_RETRIES} anchor re-randomizations"
            )));
        }
        warn!(
            "FireFly warning: rank-deficient system, retrying with new anchor points ({}/{})",
            state.anchor_retries, MAX_ANCHOR_RETRIES
        );

        state.needs_new_anchors = false;
        state.coef_mat.clear();
        state.saved_ti.clear();
        state.class_values_num.clear();
        state.class_values_den.clear();
        let n = state.n;
        state.solved_num = PolynomialFF::zero(n);
        state.solved_den = PolynomialFF::zero(n);
        state.curr_zi_order = vec![1; n.saturating_sub(1)];

        if state.prime_number == 0 || state.safe_mode {
            state.init_cascades();
        } else {
            // Coefficient classes solved earlier in this prime were removed
            // from the unknown set; rebuild it from the combined maps.
            state.non_solved_num.clear();
            state.non_solved_den.clear();
            let keys: Vec<_> = state.combined_ni.keys().cloned().collect();
            for key in keys {
                add_non_solved(&mut state.non_solved_num, key);
            }
            let keys: Vec<_> = state.combined_di.keys().cloned().collect();
            for key in keys {
                add_non_solved(&mut state.non_solved_den, key);
            }
            state.num_eqn = state.non_solved_num.len() + state.non_solved_den.len();
        }

        self.queue.lock().unwrap().clear();
        *self.status.lock().unwrap() = state.snapshot();
        Ok(())
    }

    /// The reconstructed function, available once the state is Done.
    pub fn get_result(&self) -> Option<RationalFunction> {
        let mut state = self.state.lock().unwrap();
        if !state.done {
            return None;
        }
        if state.result.is_none() {
            state.build_result();
        }
        state.result.clone()
    }

    /// The guesses reduced to the active field, for result inspection
    /// before the rational phase completes.
    pub fn get_result_ff(&self) -> (PolynomialFF, PolynomialFF) {
        let state = self.state.lock().unwrap();
        let to_ff = |map: &HashMap<Vec<u32>, RationalNumber>| {
            let coefs: FFMap = map
                .iter()
                .map(|(deg, rn)| (deg.clone(), rn.to_ffint()))
                .collect();
            PolynomialFF::new(state.n, coefs)
        };
        (to_ff(&state.g_ni), to_ff(&state.g_di))
    }
}

impl RatState {
    fn snapshot(&self) -> Status {
        Status {
            done: self.done,
            new_prime: self.new_prime,
            prime_number: self.prime_number,
            num_eqn: self.num_eqn,
            zi_order: self.curr_zi_order.clone(),
            needs_new_shift: self.needs_new_shift,
            needs_new_anchors: self.needs_new_anchors,
            scan_finished: self.scan_finished,
            shift_works: self.shift_works,
        }
    }

    fn pop_saved(&mut self) -> Option<(FFInt, FFInt)> {
        let order = self.curr_zi_order.clone();
        let entries = self.saved_ti.get_mut(&order)?;
        let entry = entries.pop();
        if entries.is_empty() {
            self.saved_ti.remove(&order);
        }
        entry
    }

    /// Process a single probe.
    fn interpolate_probe(&mut self, t: FFInt, value: FFInt, zi_order: &[u32]) -> Result<()> {
        if self.done || self.needs_new_shift || self.needs_new_anchors || self.scan_finished {
            return Ok(());
        }

        if zi_order != self.curr_zi_order.as_slice() {
            self.saved_ti
                .entry(zi_order.to_vec())
                .or_default()
                .push((t, value));
            return Ok(());
        }

        // A pending prime promotion: first try to finish via rational
        // reconstruction and the guess test on this fresh probe.
        if self.new_prime {
            if self.rec_rat_coef() {
                if self.test_guess(t, value, zi_order) {
                    self.finish();
                    return Ok(());
                }
                // The guess was wrong; drop the tentative coefficients and
                // collect another prime.
                let keys: Vec<_> = self.combined_ni.keys().cloned().collect();
                for key in keys {
                    self.g_ni.remove(&key);
                }
                let keys: Vec<_> = self.combined_di.keys().cloned().collect();
                for key in keys {
                    self.g_di.remove(&key);
                }
            }

            self.use_chinese_remainder = true;
            self.new_prime = false;

            if self.prime_number > 0 && !self.safe_mode {
                self.num_eqn = self.non_solved_num.len() + self.non_solved_den.len();
                if self.num_eqn == 0 {
                    // Every coefficient stabilized but the guess test still
                    // failed: the lifting agreed by accident and cannot
                    // recover with more primes.
                    return Err(FireFlyError::Algorithm(
                        "guess test failed although all coefficients stabilized".into(),
                    ));
                }
            }
        }

        if self.max_deg_num.is_none() {
            self.thiele_step(t, value)
        } else if self.prime_number == 0 || self.safe_mode {
            self.multivariate_step(t, value)
        } else {
            self.lifting_step(t, value)
        }
    }

    // ----- Phase 1: univariate Thiele ------------------------------------

    fn thiele_step(&mut self, t: FFInt, value: FFInt) -> Result<()> {
        if !self.used_ts.insert(t.n) {
            // duplicate t, skip
            return Ok(());
        }

        match self.thiele.add_point(value, t) {
            Ok(ThieleStatus::NeedMore) => Ok(()),
            Err(ThieleError::NeedFreshT) => Ok(()),
            Ok(ThieleStatus::Converged) => self.finish_thiele(),
        }
    }

    fn finish_thiele(&mut self) -> Result<()> {
        let (num_map, den_map) = self.thiele.construct_canonical();
        let numerator = PolynomialFF::new(1, num_map);
        let denominator = PolynomialFF::new(1, den_map);

        let den_min = denominator
            .min_deg()
            .map(|d| d[0])
            .ok_or_else(|| FireFlyError::Algorithm("empty denominator from Thiele".into()))?;

        if self.n > 1 && den_min > 0 {
            if self.is_scan {
                self.shift_works = false;
                self.scan_finished = true;
                return Ok(());
            }

            info!("FireFly info: no constant term in denominator, requesting new shift");
            self.needs_new_shift = true;
            return Ok(());
        }

        let max_num = numerator.max_deg().map(|d| d[0]).unwrap_or(0);
        let max_den = denominator.max_deg().map(|d| d[0]).unwrap_or(0);

        if self.is_scan {
            self.shift_works = match self.expected_degrees {
                Some((e_num, e_den)) => max_num == e_num && max_den == e_den,
                None => true,
            };
            self.max_deg_num = Some(max_num);
            self.max_deg_den = Some(max_den);
            self.scan_finished = true;
            return Ok(());
        }

        self.max_deg_num = Some(max_num);
        self.max_deg_den = Some(max_den);
        self.thiele = ThieleInterpolator::new();
        self.used_ts.clear();

        if self.n == 1 {
            // The canonical form is already the full answer for this prime.
            let equalizer = denominator.coefs[&vec![den_min]].inv();
            let num = numerator.scale(equalizer);
            let den = denominator.scale(equalizer);
            self.combine_primes(convert_to_mpz(&num), convert_to_mpz(&den));
            self.promote_prime();
            return Ok(());
        }

        self.init_cascades();
        Ok(())
    }

    fn init_cascades(&mut self) {
        let max_num = self.max_deg_num.unwrap_or(0);
        let max_den = self.max_deg_den.unwrap_or(0);

        self.num_cascade = Cascade::init(self.n - 1, max_num, 0);
        self.den_cascade = if max_den > 0 {
            Cascade::init(self.n - 1, max_den, 1)
        } else {
            Cascade {
                curr_deg: None,
                ..Cascade::default()
            }
        };
        self.coef_mat.clear();
        self.num_eqn = (max_num + max_den + 1) as usize;
        self.curr_zi_order = vec![1; self.n - 1];
    }

    // ----- Phase 2: multivariate reconstruction in the first prime -------

    fn multivariate_step(&mut self, t: FFInt, value: FFInt) -> Result<()> {
        self.build_uni_gauss_row(t, value);

        if self.coef_mat.len() < self.num_eqn {
            return Ok(());
        }

        let mat = std::mem::take(&mut self.coef_mat);
        let results = match solve_gauss_system(self.num_eqn, mat) {
            Ok(r) => r,
            Err(_) => {
                self.needs_new_anchors = true;
                return Ok(());
            }
        };

        // Distribute the solved univariate coefficients to the cascades.
        let mut col = 0;
        let mut num_values = HashMap::new();
        for d in 0..=self.max_deg_num.unwrap() {
            if !self.num_cascade.is_solved(d) {
                num_values.insert(d, results[col]);
                col += 1;
            }
        }
        let mut den_values = HashMap::new();
        for d in 1..=self.max_deg_den.unwrap() {
            if !self.den_cascade.is_solved(d) {
                den_values.insert(d, results[col]);
                col += 1;
            }
        }

        self.num_cascade.push_round_values(&num_values);
        self.den_cascade.push_round_values(&den_values);

        if !self.advance_cascades()? {
            return Ok(());
        }

        if self.num_cascade.is_done() && self.den_cascade.is_done() {
            self.finalize_first_prime()?;
        } else {
            for o in self.curr_zi_order.iter_mut() {
                *o += 1;
            }
        }

        Ok(())
    }

    /// One row of the univariate system: unknowns are the coefficients of
    /// t^r for the unsolved numerator and denominator degrees; solved
    /// degrees are evaluated and moved to the right-hand side.
    fn build_uni_gauss_row(&mut self, t: FFInt, value: FFInt) {
        let yis_z = self.context.yis(&self.curr_zi_order);
        let mut yis_full = Vec::with_capacity(self.n);
        yis_full.push(FFInt::one());
        yis_full.extend_from_slice(&yis_z);

        let mut eq = Vec::with_capacity(self.num_eqn + 1);
        let mut rhs = value;

        for r in 0..=self.max_deg_num.unwrap() {
            if self.num_cascade.is_solved(r) {
                let sub = self.num_cascade.solved_contribution(r, &yis_z, &yis_full);
                rhs -= sub * t.pow(r as u64);
            } else {
                eq.push(t.pow(r as u64));
            }
        }

        for r in 1..=self.max_deg_den.unwrap() {
            if self.den_cascade.is_solved(r) {
                let sub = self.den_cascade.solved_contribution(r, &yis_z, &yis_full);
                rhs += value * sub * t.pow(r as u64);
            } else {
                eq.push(-value * t.pow(r as u64));
            }
        }

        eq.push(rhs);
        self.coef_mat.push(eq);
    }

    /// Feed saved values into the cascades, top degree first. Returns false
    /// when a rank deficiency asks for new anchor points.
    fn advance_cascades(&mut self) -> Result<bool> {
        let context = Arc::clone(&self.context);
        let shift = context.shift.clone();

        for is_num in [true, false] {
            let cascade = if is_num {
                &mut self.num_cascade
            } else {
                &mut self.den_cascade
            };

            while let Some(d) = cascade.curr_deg {
                let available = cascade.saved.get(&d).map(|v| v.len()).unwrap_or(0);
                let mut consumed = cascade.consumed.get(&d).copied().unwrap_or(0);
                let mut finished = cascade
                    .recs
                    .get(&d)
                    .map(|rec| rec.is_done())
                    .unwrap_or(true);

                while !finished && consumed < available {
                    let round = consumed as u32 + 1;
                    let order = vec![round; context.anchors.len()];
                    let yis_z = context.yis(&order);
                    let mut yis_full = Vec::with_capacity(yis_z.len() + 1);
                    yis_full.push(FFInt::one());
                    yis_full.extend_from_slice(&yis_z);

                    let mut value = cascade.saved[&d][consumed];
                    if let Some(sub) = cascade.sub.get(&d) {
                        value -= sub.eval(&yis_full);
                    }

                    consumed += 1;

                    let rec = cascade.recs.get_mut(&d).expect("cascade degree exists");
                    if rec.feed(value, &context.anchors).is_err() {
                        cascade.consumed.insert(d, consumed);
                        self.needs_new_anchors = true;
                        return Ok(false);
                    }
                    finished = rec.is_done();
                }

                cascade.consumed.insert(d, consumed);

                if !finished {
                    break;
                }

                // Degree solved: record the result and its shift term.
                let result = cascade.recs[&d].get_result_ff().clone();

                if d > 0 && !result.is_zero() && shift.iter().any(|s| !s.is_zero()) {
                    let hom = result.homogenize(d);
                    let mut sub_pol = hom.add_shift(&shift);
                    sub_pol -= &hom;

                    for (deg_vec, coef) in sub_pol.coefs {
                        let total: u32 = deg_vec.iter().sum();
                        let entry = cascade
                            .sub
                            .entry(total)
                            .or_insert_with(|| PolynomialFF::zero(deg_vec.len()));
                        let mono = PolynomialFF::new(
                            deg_vec.len(),
                            FFMap::from([(deg_vec, coef)]),
                        );
                        *entry += &mono;
                    }
                }

                cascade.results.insert(d, result);
                cascade.curr_deg = if d > cascade.lowest_deg {
                    Some(d - 1)
                } else {
                    None
                };
            }
        }

        self.num_eqn = (self.max_deg_num.unwrap() + self.max_deg_den.unwrap() + 1) as usize
            - self.num_cascade.solved_count()
            - self.den_cascade.solved_count();

        Ok(true)
    }

    /// Assemble the full polynomials, pick the normalizer, rescale and
    /// promote to the lifting phase.
    fn finalize_first_prime(&mut self) -> Result<()> {
        let mut numerator = PolynomialFF::zero(self.n);
        for (&d, res) in &self.num_cascade.results {
            if !res.is_zero() {
                numerator += &res.homogenize(d);
            }
        }

        let mut denominator = PolynomialFF::zero(self.n);
        for (&d, res) in &self.den_cascade.results {
            if !res.is_zero() {
                denominator += &res.homogenize(d);
            }
        }

        // The shifted denominator constant was normalized to 1 during the
        // univariate solves; recover the true constant term from the shift
        // contributions of the solved degrees.
        let zeros = vec![FFInt::zero(); self.n];
        let const_shift = self
            .den_cascade
            .sub
            .get(&0)
            .map(|p| p.eval(&zeros))
            .unwrap_or_else(FFInt::zero);

        let terminator;
        let true_den_const = FFInt::one() - const_shift;

        if !true_den_const.is_zero() {
            denominator += &PolynomialFF::constant(self.n, true_den_const);
            terminator = true_den_const;
        } else if let Some(c) = numerator.coefs.get(&vec![0; self.n]) {
            terminator = *c;
        } else {
            let normalizer = choose_singular_normalizer(&denominator, &numerator);
            let (from_den, deg_vec) = normalizer.ok_or_else(|| {
                FireFlyError::Algorithm("no normalizer candidate found".into())
            })?;
            terminator = if from_den {
                denominator.coefs[&deg_vec]
            } else {
                numerator.coefs[&deg_vec]
            };
        }

        let equalizer = terminator.inv();
        let numerator = numerator.scale(equalizer);
        let denominator = denominator.scale(equalizer);

        self.combine_primes(convert_to_mpz(&numerator), convert_to_mpz(&denominator));
        self.promote_prime();
        Ok(())
    }

    // ----- Phase 4: CRT lifting on later primes --------------------------

    fn lifting_step(&mut self, t: FFInt, value: FFInt) -> Result<()> {
        self.build_multi_gauss_row(t, value);

        if self.coef_mat.len() < self.num_eqn {
            return Ok(());
        }

        // The lifting system is square; solve it through an LU
        // factorization with partial pivoting.
        let rows = std::mem::take(&mut self.coef_mat);
        let n_eqn = self.num_eqn;
        let mut matrix = Vec::with_capacity(n_eqn);
        let mut rhs = Vec::with_capacity(n_eqn);
        for mut row in rows {
            let b = row.pop().expect("augmented row");
            matrix.push(row);
            rhs.push(b);
        }

        let results = match calc_lu_decomposition(&mut matrix, n_eqn) {
            Ok(permutation) => solve_lu(&matrix, &permutation, &rhs, n_eqn),
            Err(_) => {
                self.needs_new_anchors = true;
                return Ok(());
            }
        };

        // Collect the per-degree values and solve complete classes with the
        // transposed Vandermonde system.
        let mut col = 0;
        let num_degs: Vec<u32> = self.non_solved_num.keys().copied().collect();
        for deg in &num_degs {
            self.class_values_num
                .entry(*deg)
                .or_default()
                .push(results[col]);
            col += 1;
        }
        let den_degs: Vec<u32> = self.non_solved_den.keys().copied().collect();
        for deg in &den_degs {
            self.class_values_den
                .entry(*deg)
                .or_default()
                .push(results[col]);
            col += 1;
        }

        for deg in num_degs {
            if !self.solve_class(deg, true)? {
                return Ok(());
            }
        }
        for deg in den_degs {
            if !self.solve_class(deg, false)? {
                return Ok(());
            }
        }

        if self.non_solved_num.is_empty() && self.non_solved_den.is_empty() {
            let tmp_ni = convert_to_mpz(&self.solved_num);
            let tmp_di = convert_to_mpz(&self.solved_den);
            self.combine_primes(tmp_ni, tmp_di);
            self.promote_prime();
        } else {
            for o in self.curr_zi_order.iter_mut() {
                *o += 1;
            }
            self.num_eqn = self.non_solved_num.len() + self.non_solved_den.len();
        }

        Ok(())
    }

    /// One row of the homogenized system on a later prime: the probe point
    /// is x_1 = t, x_i = a_i^{o_i} * t, so every monomial of total degree d
    /// contributes to the t^d column.
    fn build_multi_gauss_row(&mut self, t: FFInt, value: FFInt) {
        let mut yis = Vec::with_capacity(self.n);
        yis.push(t);
        for y in self.context.yis(&self.curr_zi_order) {
            yis.push(y * t);
        }

        let mut eq = Vec::with_capacity(self.num_eqn + 1);

        for &deg in self.non_solved_num.keys() {
            eq.push(t.pow(deg as u64));
        }
        for &deg in self.non_solved_den.keys() {
            eq.push(-value * t.pow(deg as u64));
        }

        let mut rhs = FFInt::zero();
        for (deg_vec, rn) in &self.g_ni {
            rhs -= rn.to_ffint() * eval_monomial(deg_vec, &yis);
        }

        let mut den_known = FFInt::zero();
        for (deg_vec, rn) in &self.g_di {
            den_known += rn.to_ffint() * eval_monomial(deg_vec, &yis);
        }
        den_known += self.solved_den.eval(&yis);
        rhs += value * den_known;
        rhs -= self.solved_num.eval(&yis);

        eq.push(rhs);
        self.coef_mat.push(eq);
    }

    /// Solve the transposed Vandermonde system of a coefficient class once
    /// enough rounds have accumulated. Returns false on rank deficiency.
    fn solve_class(&mut self, deg: u32, is_num: bool) -> Result<bool> {
        let (non_solved, class_values, solved) = if is_num {
            (
                &mut self.non_solved_num,
                &mut self.class_values_num,
                &mut self.solved_num,
            )
        } else {
            (
                &mut self.non_solved_den,
                &mut self.class_values_den,
                &mut self.solved_den,
            )
        };

        let Some(class) = non_solved.get(&deg) else {
            return Ok(true);
        };
        let values = class_values.entry(deg).or_default();
        if values.len() < class.len() {
            return Ok(true);
        }

        let vis: Vec<FFInt> = class
            .iter()
            .map(|m| monomial_node(&m[1..], &self.context.anchors))
            .collect();

        match solve_transposed_vandermonde(&vis, values) {
            Ok(coefs) => {
                let mut map = FFMap::new();
                for (m, c) in class.iter().zip(coefs) {
                    map.insert(m.clone(), c);
                }
                *solved += &PolynomialFF::new(self.n, map);
                non_solved.remove(&deg);
                class_values.remove(&deg);
                Ok(true)
            }
            Err(_) => {
                self.needs_new_anchors = true;
                Ok(false)
            }
        }
    }

    // ----- CRT combination and promotion ---------------------------------

    /// Merge this prime's coefficients into the combined big integers and
    /// drop every coefficient that has stabilized.
    fn combine_primes(
        &mut self,
        tmp_ni: HashMap<Vec<u32>, BigInt>,
        tmp_di: HashMap<Vec<u32>, BigInt>,
    ) {
        self.non_solved_num.clear();
        self.non_solved_den.clear();

        let field_prime = BigInt::from(FFInt::prime());

        if !self.use_chinese_remainder {
            self.combined_prime = field_prime;
            self.combined_ni = tmp_ni;
            self.combined_di = tmp_di;

            // A coefficient that is already a plain integer will not change
            // in the next prime and is removed right away.
            for is_num in [true, false] {
                let combined = if is_num {
                    &mut self.combined_ni
                } else {
                    &mut self.combined_di
                };

                let mut stable = Vec::new();
                let mut open = Vec::new();
                for (deg_vec, value) in combined.iter() {
                    match rational_reconstruct(value, &self.combined_prime) {
                        Some(rn)
                            if !self.safe_mode
                                && rn.numerator == *value
                                && rn.is_integer() =>
                        {
                            stable.push((deg_vec.clone(), rn));
                        }
                        _ => open.push(deg_vec.clone()),
                    }
                }

                for (deg_vec, rn) in stable {
                    combined.remove(&deg_vec);
                    let g = if is_num { &mut self.g_ni } else { &mut self.g_di };
                    g.insert(deg_vec, rn);
                }
                for deg_vec in open {
                    let non_solved = if is_num {
                        &mut self.non_solved_num
                    } else {
                        &mut self.non_solved_den
                    };
                    add_non_solved(non_solved, deg_vec);
                }
            }
        } else {
            for is_num in [true, false] {
                let (combined, tmp) = if is_num {
                    (&mut self.combined_ni, &tmp_ni)
                } else {
                    (&mut self.combined_di, &tmp_di)
                };

                // A coefficient that vanished modulo all earlier primes may
                // only now become visible (safe mode re-solves everything).
                let g = if is_num { &self.g_ni } else { &self.g_di };
                for deg_vec in tmp.keys() {
                    if !combined.contains_key(deg_vec) && !g.contains_key(deg_vec) {
                        combined.insert(deg_vec.clone(), BigInt::zero());
                    }
                }

                let mut stable = Vec::new();
                let mut open = Vec::new();

                for (deg_vec, old_value) in combined.iter() {
                    let new_residue = tmp.get(deg_vec).cloned().unwrap_or_else(BigInt::zero);
                    let (new_value, _) = chinese_remainder(
                        old_value,
                        &self.combined_prime,
                        &new_residue,
                        &field_prime,
                    );

                    let new_prime = &self.combined_prime * &field_prime;
                    let last_rn = rational_reconstruct(old_value, &self.combined_prime);
                    let curr_rn = rational_reconstruct(&new_value, &new_prime);

                    let stabilized = match (&last_rn, &curr_rn) {
                        (Some(last), Some(curr)) if last == curr => Some(curr.clone()),
                        (None, _) | (_, None) if *old_value == new_value => {
                            Some(RationalNumber::from(old_value.clone()))
                        }
                        _ => None,
                    };

                    match stabilized {
                        Some(rn) if !self.safe_mode => stable.push((deg_vec.clone(), rn)),
                        _ => open.push((deg_vec.clone(), new_value)),
                    }
                }

                for (deg_vec, rn) in stable {
                    combined.remove(&deg_vec);
                    let g = if is_num { &mut self.g_ni } else { &mut self.g_di };
                    g.insert(deg_vec, rn);
                }
                for (deg_vec, new_value) in open {
                    combined.insert(deg_vec.clone(), new_value);
                    let non_solved = if is_num {
                        &mut self.non_solved_num
                    } else {
                        &mut self.non_solved_den
                    };
                    add_non_solved(non_solved, deg_vec);
                }
            }

            self.combined_prime = &self.combined_prime * &field_prime;
        }

        self.num_eqn = (self.non_solved_num.len() + self.non_solved_den.len()).max(1);
    }

    fn promote_prime(&mut self) {
        self.prime_number += 1;
        self.new_prime = true;
        self.saved_ti.clear();
        self.coef_mat.clear();
        self.class_values_num.clear();
        self.class_values_den.clear();
        self.solved_num = PolynomialFF::zero(self.n);
        self.solved_den = PolynomialFF::zero(self.n);
        self.num_cascade = Cascade::default();
        self.den_cascade = Cascade::default();
        self.curr_zi_order = vec![1; self.n.saturating_sub(1)];

        if self.safe_mode {
            // Everything is reconstructed from scratch in every prime.
            if self.n == 1 {
                self.max_deg_num = None;
                self.max_deg_den = None;
                self.num_eqn = 1;
            } else {
                self.num_eqn =
                    (self.max_deg_num.unwrap_or(0) + self.max_deg_den.unwrap_or(0) + 1) as usize;
            }
        }
    }

    /// On a new prime in safe mode the cascades must exist again before the
    /// first probe row is built.
    fn prepare_safe_mode_prime(&mut self) {
        if self.safe_mode && self.n > 1 && self.max_deg_num.is_some() {
            self.init_cascades();
        }
    }

    /// Try to lift every combined coefficient to a rational number.
    fn rec_rat_coef(&mut self) -> bool {
        let mut promoted_n = Vec::new();
        let mut promoted_d = Vec::new();

        for (deg_vec, value) in &self.combined_ni {
            match rational_reconstruct(value, &self.combined_prime) {
                Some(rn) => {
                    self.g_ni.insert(deg_vec.clone(), rn);
                    promoted_n.push(deg_vec.clone());
                }
                None => {
                    for key in &promoted_n {
                        self.g_ni.remove(key);
                    }
                    return false;
                }
            }
        }

        for (deg_vec, value) in &self.combined_di {
            match rational_reconstruct(value, &self.combined_prime) {
                Some(rn) => {
                    self.g_di.insert(deg_vec.clone(), rn);
                    promoted_d.push(deg_vec.clone());
                }
                None => {
                    for key in &promoted_n {
                        self.g_ni.remove(key);
                    }
                    for key in &promoted_d {
                        self.g_di.remove(key);
                    }
                    return false;
                }
            }
        }

        true
    }

    /// Compare the tentative rational guess against the black box at the
    /// probe point.
    fn test_guess(&self, t: FFInt, value: FFInt, zi_order: &[u32]) -> bool {
        let point = self.context.probe_point(t, zi_order);

        let mut num = FFInt::zero();
        for (deg_vec, rn) in &self.g_ni {
            num += rn.to_ffint() * eval_monomial(deg_vec, &point);
        }

        let mut den = FFInt::zero();
        for (deg_vec, rn) in &self.g_di {
            den += rn.to_ffint() * eval_monomial(deg_vec, &point);
        }

        match den.try_inv() {
            Some(inv) => num * inv == value,
            None => false,
        }
    }

    fn finish(&mut self) {
        self.done = true;
        self.new_prime = false;
        self.num_eqn = 0;
        self.combined_ni.clear();
        self.combined_di.clear();
        self.combined_prime = BigInt::zero();
        self.non_solved_num.clear();
        self.non_solved_den.clear();
        self.saved_ti.clear();
        self.use_chinese_remainder = false;
    }

    fn build_result(&mut self) {
        let numerator = Polynomial::from_map(
            self.g_ni
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        let denominator = Polynomial::from_map(
            self.g_di
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        self.result = Some(RationalFunction::new(numerator, denominator));
    }
}

/// Evaluate a single monomial at a full point.
fn eval_monomial(deg_vec: &[u32], values: &[FFInt]) -> FFInt {
    let mut res = FFInt::one();
    for (v, &e) in values.iter().zip(deg_vec.iter()) {
        if e != 0 {
            res *= v.pow(e as u64);
        }
    }
    res
}

fn convert_to_mpz(poly: &PolynomialFF) -> HashMap<Vec<u32>, BigInt> {
    poly.coefs
        .iter()
        .map(|(deg, coef)| (deg.clone(), BigInt::from(coef.n)))
        .collect()
}

fn add_non_solved(map: &mut BTreeMap<u32, Vec<Vec<u32>>>, deg_vec: Vec<u32>) {
    let total: u32 = deg_vec.iter().sum();
    let class = map.entry(total).or_default();
    class.push(deg_vec);
    class.sort_by(|a, b| colex_cmp(a, b));
}

/// Pick the singular normalizer: among the degree classes of the assembled
/// denominator (then numerator), prefer a singleton class; otherwise take
/// the sparsest class, lowest total degree first, and within the class the
/// colexicographically lowest monomial.
fn choose_singular_normalizer(
    denominator: &PolynomialFF,
    numerator: &PolynomialFF,
) -> Option<(bool, Vec<u32>)> {
    let classes = |poly: &PolynomialFF| -> BTreeMap<u32, Vec<Vec<u32>>> {
        let mut map = BTreeMap::new();
        for deg_vec in poly.coefs.keys() {
            add_non_solved(&mut map, deg_vec.clone());
        }
        map
    };

    let den_classes = classes(denominator);
    let num_classes = classes(numerator);

    for (from_den, class_map) in [(true, &den_classes), (false, &num_classes)] {
        for class in class_map.values() {
            if class.len() == 1 {
                return Some((from_den, class[0].clone()));
            }
        }
    }

    let mut best: Option<(usize, u32, bool, Vec<u32>)> = None;
    for (from_den, class_map) in [(true, &den_classes), (false, &num_classes)] {
        for (&deg, class) in class_map {
            let candidate = (class.len(), deg, from_den, class[0].clone());
            let better = match &best {
                None => true,
                Some((size, best_deg, ..)) => {
                    candidate.0 < *size || (candidate.0 == *size && deg < *best_deg)
                }
            };
            if better {
                best = Some(candidate);
            }
        }
    }

    best.map(|(_, _, from_den, deg_vec)| (from_den, deg_vec))
}

impl RatReconst {
    /// Hook called by the scheduler right after a new-prime barrier so that
    /// safe-mode functions rebuild their per-prime systems.
    pub fn on_new_prime_started(&self) {
        let mut state = self.state.lock().unwrap();
        state.prepare_safe_mode_prime();
        *self.status.lock().unwrap() = state.snapshot();
    }

    /// Serialize the lifting state. Only meaningful at a prime boundary;
    /// the in-prime progress is recovered by replaying the probe log.
    pub fn save_state_string(&self) -> String {
        let state = self.state.lock().unwrap();
        let mut out = String::new();

        out.push_str(&format!("n {}\n", state.n));
        out.push_str(&format!("tag {}\n", state.tag));
        out.push_str(&format!("prime {}\n", state.prime_number));
        out.push_str(&format!("done {}\n", u8::from(state.done)));
        out.push_str(&format!("new_prime {}\n", u8::from(state.new_prime)));
        out.push_str(&format!(
            "use_chinese_remainder {}\n",
            u8::from(state.use_chinese_remainder)
        ));

        match (state.max_deg_num, state.max_deg_den) {
            (Some(num), Some(den)) => out.push_str(&format!("max_deg {num} {den}\n")),
            _ => out.push_str("max_deg - -\n"),
        }

        out.push_str(&format!("combined_prime {}\n", state.combined_prime));

        for (section, map) in [("ni", &state.combined_ni), ("di", &state.combined_di)] {
            for (deg_vec, value) in map {
                out.push_str(section);
                for d in deg_vec {
                    out.push_str(&format!(" {d}"));
                }
                out.push_str(&format!(" : {value}\n"));
            }
        }

        for (section, map) in [("gn", &state.g_ni), ("gd", &state.g_di)] {
            for (deg_vec, rn) in map {
                out.push_str(section);
                for d in deg_vec {
                    out.push_str(&format!(" {d}"));
                }
                out.push_str(&format!(" : {} {}\n", rn.numerator, rn.denominator));
            }
        }

        out
    }

    /// Restore a state serialized by [`RatReconst::save_state_string`].
    pub fn load_state_string(&self, content: &str) -> Result<()> {
        let malformed = |line: &str| FireFlyError::Resume(format!("malformed state line: {line}"));
        let mut state = self.state.lock().unwrap();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let (key, rest) = line.split_once(' ').unwrap_or((line, ""));
            match key {
                "n" => {
                    let n: usize = rest.trim().parse().map_err(|_| malformed(line))?;
                    if n != state.n {
                        return Err(FireFlyError::Resume(format!(
                            "state file arity {n} does not match black box arity {}",
                            state.n
                        )));
                    }
                }
                "tag" => state.tag = rest.trim().to_string(),
                "prime" => {
                    state.prime_number = rest.trim().parse().map_err(|_| malformed(line))?;
                }
                "done" => state.done = rest.trim() == "1",
                "new_prime" => state.new_prime = rest.trim() == "1",
                "use_chinese_remainder" => {
                    state.use_chinese_remainder = rest.trim() == "1";
                }
                "max_deg" => {
                    let mut parts = rest.split_whitespace();
                    let num = parts.next().ok_or_else(|| malformed(line))?;
                    let den = parts.next().ok_or_else(|| malformed(line))?;
                    if num != "-" {
                        state.max_deg_num =
                            Some(num.parse().map_err(|_| malformed(line))?);
                        state.max_deg_den =
                            Some(den.parse().map_err(|_| malformed(line))?);
                    }
                }
                "combined_prime" => {
                    state.combined_prime = rest.trim().parse().map_err(|_| malformed(line))?;
                }
                "ni" | "di" => {
                    let (degs, value) = rest.split_once(':').ok_or_else(|| malformed(line))?;
                    let deg_vec: std::result::Result<Vec<u32>, _> =
                        degs.split_whitespace().map(|d| d.parse()).collect();
                    let deg_vec = deg_vec.map_err(|_| malformed(line))?;
                    let value: BigInt = value.trim().parse().map_err(|_| malformed(line))?;
                    if key == "ni" {
                        state.combined_ni.insert(deg_vec, value);
                    } else {
                        state.combined_di.insert(deg_vec, value);
                    }
                }
                "gn" | "gd" => {
                    let (degs, value) = rest.split_once(':').ok_or_else(|| malformed(line))?;
                    let deg_vec: std::result::Result<Vec<u32>, _> =
                        degs.split_whitespace().map(|d| d.parse()).collect();
                    let deg_vec = deg_vec.map_err(|_| malformed(line))?;
                    let mut parts = value.trim().split_whitespace();
                    let num: BigInt = parts
                        .next()
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| malformed(line))?;
                    let den: BigInt = parts
                        .next()
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| malformed(line))?;
                    let rn = RationalNumber::new(num, den);
                    if key == "gn" {
                        state.g_ni.insert(deg_vec, rn);
                    } else {
                        state.g_di.insert(deg_vec, rn);
                    }
                }
                _ => return Err(malformed(line)),
            }
        }

        // Rebuild the unknown classes from the combined coefficients.
        state.non_solved_num.clear();
        state.non_solved_den.clear();
        let keys: Vec<_> = state.combined_ni.keys().cloned().collect();
        for key in keys {
            add_non_solved(&mut state.non_solved_num, key);
        }
        let keys: Vec<_> = state.combined_di.keys().cloned().collect();
        for key in keys {
            add_non_solved(&mut state.non_solved_den, key);
        }

        if !state.done {
            if state.prime_number > 0 && !state.safe_mode {
                state.num_eqn =
                    (state.non_solved_num.len() + state.non_solved_den.len()).max(1);
            } else if state.max_deg_num.is_some() && state.n > 1 {
                state.init_cascades();
            }
        }
        state.curr_zi_order = vec![1; state.n.saturating_sub(1)];

        *self.status.lock().unwrap() = state.snapshot();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use crate::primes::primes;

    fn make_context(n: usize, prime_index: usize, with_shift: bool) -> Arc<PrimeContext> {
        FFInt::set_new_prime(primes()[prime_index]);
        let anchors = (0..n.saturating_sub(1))
            .map(|i| FFInt::new(17 + 31 * i as u64))
            .collect();
        let shift = if with_shift && n > 1 {
            (0..n).map(|i| FFInt::new(23 + 7 * i as u64)).collect()
        } else {
            vec![FFInt::zero(); n]
        };
        Arc::new(PrimeContext { prime_index, anchors, shift })
    }

    /// Drive a single function to completion against a closure black box.
    fn run_to_completion<F>(n: usize, bb: F, max_primes: usize) -> RationalFunction
    where
        F: Fn(&[FFInt]) -> FFInt,
    {
        let mut context = make_context(n, 0, true);
        let rec = RatReconst::new(n, Arc::clone(&context));
        let mut t_counter = 1u64;

        for _ in 0..100_000 {
            if rec.is_done() {
                break;
            }

            if rec.is_new_prime() {
                let next_prime = rec.get_prime();
                assert!(next_prime < max_primes, "too many primes needed");
                context = make_context(n, next_prime, false);
                rec.set_context(Arc::clone(&context));
                rec.on_new_prime_started();
                t_counter = 1;
            }

            let orders = rec.get_zi_orders();
            let (zi_order, count) = match orders.first() {
                Some(o) => o.clone(),
                None => break,
            };

            for _ in 0..count.max(1) {
                t_counter += 1;
                let t = FFInt::new(t_counter * 7 + 3);
                let point = context.probe_point(t, &zi_order);
                rec.feed(t, bb(&point), &zi_order, rec.get_prime());
            }
            rec.interpolate().unwrap();

            assert!(!rec.needs_new_shift(), "shift rejected in test");
            assert!(!rec.needs_new_anchors(), "anchors rejected in test");
        }

        assert!(rec.is_done(), "reconstruction did not finish");
        rec.get_result().unwrap()
    }

    fn rn(n: i64, d: i64) -> RationalNumber {
        RationalNumber::new(BigInt::from(n), BigInt::from(d))
    }

    #[test]
    #[serial]
    fn test_univariate_rational_s1() {
        // bb(x) = 2 / (2 + 7x + 30x^2)
        let result = run_to_completion(
            1,
            |v| {
                let x = v[0];
                FFInt::new(2) / (FFInt::new(2) + FFInt::new(7) * x + FFInt::new(30) * x * x)
            },
            5,
        );

        assert_eq!(result.numerator.coefs.len(), 1);
        assert_eq!(result.numerator.coefs[0].coef, rn(1, 1));
        assert_eq!(result.denominator.coefs.len(), 3);
        assert_eq!(result.denominator.coefs[0].coef, rn(1, 1));
        assert_eq!(result.denominator.coefs[1].coef, rn(7, 2));
        assert_eq!(result.denominator.coefs[2].coef, rn(15, 1));
    }

    #[test]
    #[serial]
    fn test_constant_s2() {
        let result = run_to_completion(2, |_| FFInt::new(3), 3);
        assert_eq!(result.numerator.coefs.len(), 1);
        assert_eq!(result.numerator.coefs[0].coef, rn(3, 1));
        assert_eq!(result.denominator.coefs.len(), 1);
        assert_eq!(result.denominator.coefs[0].coef, rn(1, 1));
    }

    #[test]
    #[serial]
    fn test_sparse_bivariate_s3() {
        // bb(x, y) = (x + y) / (x*y + 1)
        let result = run_to_completion(
            2,
            |v| (v[0] + v[1]) / (v[0] * v[1] + FFInt::one()),
            4,
        );

        // numerator x + y, denominator 1 + x*y
        assert_eq!(result.numerator.coefs.len(), 2);
        for m in &result.numerator.coefs {
            assert_eq!(m.coef, rn(1, 1));
            assert_eq!(m.powers.iter().sum::<u32>(), 1);
        }

        assert_eq!(result.denominator.coefs.len(), 2);
        assert_eq!(result.denominator.coefs[0].powers, vec![0, 0]);
        assert_eq!(result.denominator.coefs[0].coef, rn(1, 1));
        assert_eq!(result.denominator.coefs[1].powers, vec![1, 1]);
        assert_eq!(result.denominator.coefs[1].coef, rn(1, 1));
    }

    #[test]
    #[serial]
    fn test_trivariate_with_fractions() {
        // bb = (1/2 x1^2 + 3 x2 x3) / (1 + 5/7 x3^2)
        let result = run_to_completion(
            3,
            |v| {
                let num = FFInt::new(1) / FFInt::new(2) * v[0] * v[0]
                    + FFInt::new(3) * v[1] * v[2];
                let den = FFInt::one() + FFInt::new(5) / FFInt::new(7) * v[2] * v[2];
                num / den
            },
            6,
        );

        let num_map: HashMap<Vec<u32>, RationalNumber> = result
            .numerator
            .coefs
            .iter()
            .map(|m| (m.powers.clone(), m.coef.clone()))
            .collect();
        assert_eq!(num_map[&vec![2, 0, 0]], rn(1, 2));
        assert_eq!(num_map[&vec![0, 1, 1]], rn(3, 1));
        assert_eq!(num_map.len(), 2);

        let den_map: HashMap<Vec<u32>, RationalNumber> = result
            .denominator
            .coefs
            .iter()
            .map(|m| (m.powers.clone(), m.coef.clone()))
            .collect();
        assert_eq!(den_map[&vec![0, 0, 0]], rn(1, 1));
        assert_eq!(den_map[&vec![0, 0, 2]], rn(5, 7));
        assert_eq!(den_map.len(), 2);
    }

    #[test]
    #[serial]
    fn test_no_denominator_constant() {
        // bb(x, y) = 1 / (x*y): the denominator has no constant term, the
        // shift keeps the Thiele phase alive and the normalizer falls back
        // to a singular candidate.
        let result = run_to_completion(2, |v| (v[0] * v[1]).inv(), 4);

        assert_eq!(result.numerator.coefs.len(), 1);
        assert_eq!(result.numerator.coefs[0].coef, rn(1, 1));
        assert_eq!(result.denominator.coefs.len(), 1);
        assert_eq!(result.denominator.coefs[0].powers, vec![1, 1]);
        assert_eq!(result.denominator.coefs[0].coef, rn(1, 1));
    }

    #[test]
    #[serial]
    fn test_out_of_order_feed_is_buffered() {
        let context = make_context(2, 0, true);
        let rec = RatReconst::new(2, Arc::clone(&context));

        // Feed a probe of a later zi-order first; it must be buffered, not
        // consumed by the Thiele phase.
        rec.feed(FFInt::new(5), FFInt::new(1), &[3], 0);
        rec.interpolate().unwrap();
        assert!(!rec.is_done());
        assert_eq!(rec.get_zi_orders()[0].0, vec![1]);
    }

    #[test]
    #[serial]
    fn test_stale_prime_probe_dropped() {
        let context = make_context(2, 0, true);
        let rec = RatReconst::new(2, context);

        rec.feed(FFInt::new(5), FFInt::new(1), &[1], 7);
        assert!(rec.queue.lock().unwrap().is_empty());
    }
}
