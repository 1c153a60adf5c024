//! The scheduler driving all per-function reconstructions.
//!
//! The reconstructor owns the thread pool, the probe queues and the list of
//! per-function `RatReconst` objects. Workers evaluate the black box on
//! queued probe points (optionally in bunches); results travel back through
//! the computed-probes queue, are joined with their (t, zi-order) via the
//! index map and fed to every live function. Feed and interpolate jobs run
//! as priority tasks on the same pool. New-prime transitions are barriers:
//! the pool is drained, the field is switched, anchor points and shift are
//! regenerated and handed to the functions as a fresh immutable context.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Instant;

use log::{error, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::black_box::{compute_bunch_size, BlackBox, ALLOWED_BUNCH_SIZES};
use crate::error::{FireFlyError, Result};
use crate::factor::{factors_to_polynomial, rational_linear_factors};
use crate::field::FFInt;
use crate::poly::{RationalFunction, UnivariateFactor};
use crate::pool::ThreadPool;
use crate::primes::primes;
use crate::rat_reconst::{PrimeContext, RatReconst};
use crate::save_state;

/// Status of one function in the scheduler's list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunStatus {
    Reconstructing,
    Done,
    Delete,
}

struct FunctionReconst {
    index: usize,
    status: Mutex<FunStatus>,
    rec: RatReconst,
}

/// Probe bookkeeping guarded by the probe-queue mutex.
#[derive(Default)]
struct ProbeQueues {
    requested: VecDeque<(u64, Vec<FFInt>)>,
    index_map: HashMap<u64, (FFInt, Vec<u32>)>,
    ind: u64,
    probes_queued: usize,
}

#[derive(Default)]
struct JobCounters {
    feed_jobs: usize,
    interpolate_jobs: usize,
}

#[derive(Default)]
struct GlobalStatus {
    items_done: usize,
    items_new_prime: usize,
    one_done: bool,
    one_new_prime: bool,
}

#[derive(Default)]
struct ProbeStats {
    iteration: usize,
    total_iterations: usize,
    probes_fed: usize,
    average_black_box_time: f64,
}

type ComputedProbes = (Vec<u64>, Vec<Vec<FFInt>>);

/// State shared between the scheduler thread and the worker tasks.
struct Shared<B: BlackBox> {
    n: usize,
    thr_n: usize,
    bunch_size: usize,
    bb: B,

    probe_queues: Mutex<ProbeQueues>,
    computed: Mutex<VecDeque<ComputedProbes>>,
    condition_future: Condvar,

    chosen_t: Mutex<HashMap<Vec<u32>, HashSet<u64>>>,
    started_probes: Mutex<HashMap<Vec<u32>, usize>>,
    balance_of_ones: AtomicUsize,

    jobs: Mutex<JobCounters>,
    condition_feed: Condvar,

    status: Mutex<GlobalStatus>,
    stats: Mutex<ProbeStats>,

    context: RwLock<Arc<PrimeContext>>,
    reconst: RwLock<Vec<Arc<FunctionReconst>>>,
    prime_it: AtomicUsize,

    /// Univariate factors divided out of every probe result, per function.
    factors: RwLock<HashMap<usize, Vec<UnivariateFactor>>>,
    /// Internal variable index -> user variable index.
    var_order: RwLock<Option<Vec<usize>>>,

    rng: Mutex<StdRng>,
    fatal: Mutex<Option<FireFlyError>>,
    aborted: AtomicBool,

    save_states: bool,
    save_dir: PathBuf,
    precomputed: Mutex<Option<HashMap<Vec<u64>, Vec<u64>>>>,
    precomputed_exhausted: AtomicBool,
}

impl<B: BlackBox + 'static> Shared<B> {
    fn context(&self) -> Arc<PrimeContext> {
        Arc::clone(&self.context.read().unwrap())
    }

    fn set_fatal(&self, e: FireFlyError) {
        let mut fatal = self.fatal.lock().unwrap();
        if fatal.is_none() {
            *fatal = Some(e);
        }
        drop(fatal);
        self.signal_abort();
    }

    fn signal_abort(&self) {
        self.aborted.store(true, Ordering::Release);
        // Wake the scheduler if it blocks on the computed-probes queue.
        let _guard = self.computed.lock().unwrap();
        self.condition_future.notify_all();
    }

    /// Block until no feed or interpolate job is queued or running.
    fn wait_for_jobs(&self) {
        let mut jobs = self.jobs.lock().unwrap();
        while jobs.feed_jobs > 0 || jobs.interpolate_jobs > 0 {
            jobs = self.condition_feed.wait(jobs).unwrap();
        }
    }

    /// Map an internal probe point to the user's variable order.
    fn to_user_point(&self, internal: &[FFInt]) -> Vec<FFInt> {
        match self.var_order.read().unwrap().as_ref() {
            Some(order) => {
                let mut user = vec![FFInt::zero(); internal.len()];
                for (j, &v) in internal.iter().enumerate() {
                    user[order[j]] = v;
                }
                user
            }
            None => internal.to_vec(),
        }
    }

    /// Generate probes for a zi-order and hand matching jobs to the pool.
    fn queue_probes(self: &Arc<Self>, pool: &ThreadPool, zi_order: &[u32], to_start: usize) {
        let prime_it = self.prime_it.load(Ordering::Acquire);
        let ones = prime_it == 0 && zi_order.iter().all(|&o| o == 1);
        let context = self.context();

        for _ in 0..to_start {
            // Draw a t unused for this zi-order.
            let t = loop {
                let candidate = {
                    let mut rng = self.rng.lock().unwrap();
                    rng.gen_range(1..FFInt::prime())
                };

                let mut chosen = self.chosen_t.lock().unwrap();
                let used = chosen.entry(zi_order.to_vec()).or_default();
                if used.insert(candidate) {
                    break FFInt::from_reduced(candidate);
                }
            };

            let internal = context.probe_point(t, zi_order);
            let values = self.to_user_point(&internal);

            let mut queues = self.probe_queues.lock().unwrap();
            let ind = queues.ind;
            if ones {
                queues.requested.push_front((ind, values));
            } else {
                queues.requested.push_back((ind, values));
            }
            queues.index_map.insert(ind, (t, zi_order.to_vec()));
            queues.ind += 1;
            queues.probes_queued += 1;
        }

        for _ in 0..to_start {
            let shared = Arc::clone(self);
            pool.run_task(move |thread_id| shared.get_job(thread_id));
        }
    }

    /// Worker entry: take a bunch of requested probes and evaluate them.
    fn get_job(self: &Arc<Self>, thread_id: usize) {
        let (indices, points) = {
            let mut queues = self.probe_queues.lock().unwrap();
            if queues.requested.is_empty() {
                return;
            }

            let bunch = compute_bunch_size(queues.requested.len(), self.thr_n, self.bunch_size);
            let mut indices = Vec::with_capacity(bunch);
            let mut points = Vec::with_capacity(bunch);
            for _ in 0..bunch {
                let (ind, values) = queues.requested.pop_front().expect("non-empty backlog");
                indices.push(ind);
                points.push(values);
            }
            (indices, points)
        };

        let start = Instant::now();

        let mut per_function = if let Some(table) = self.precomputed.lock().unwrap().as_ref() {
            match lookup_precomputed(table, &points) {
                Some(values) => values,
                None => {
                    // The precomputed supply ran dry; push the requests back
                    // so the scheduler can dump them to disk, and wake it.
                    let mut queues = self.probe_queues.lock().unwrap();
                    for (ind, values) in indices.into_iter().zip(points).rev() {
                        queues.requested.push_front((ind, values));
                    }
                    drop(queues);
                    self.precomputed_exhausted.store(true, Ordering::Release);
                    self.condition_future.notify_all();
                    return;
                }
            }
        } else if points.len() == 1 {
            self.bb
                .eval(&points[0], thread_id)
                .into_iter()
                .map(|v| vec![v])
                .collect()
        } else {
            self.bb.eval_bunch(&points, thread_id)
        };

        let elapsed = start.elapsed().as_secs_f64();

        // Strip the factors found by the factor scan.
        {
            let factors = self.factors.read().unwrap();
            if !factors.is_empty() {
                for (fun_idx, values) in per_function.iter_mut().enumerate() {
                    if let Some(fun_factors) = factors.get(&fun_idx) {
                        for (point, value) in points.iter().zip(values.iter_mut()) {
                            for factor in fun_factors {
                                *value /= factor.eval_ff(point);
                            }
                        }
                    }
                }
            }
        }

        {
            let mut stats = self.stats.lock().unwrap();
            let bunch = indices.len();
            stats.iteration += bunch;
            let tmp_iterations = stats.total_iterations + stats.iteration;
            stats.average_black_box_time = (stats.average_black_box_time
                * (tmp_iterations - bunch) as f64
                + elapsed)
                / tmp_iterations as f64;
        }

        self.computed
            .lock()
            .unwrap()
            .push_back((indices, per_function));
        self.condition_future.notify_one();
    }

    /// Scheduler side: block until some worker delivered results. `None`
    /// signals that the precomputed probe supply ran dry.
    fn get_probe(&self) -> Option<ComputedProbes> {
        let mut computed = self.computed.lock().unwrap();
        while computed.is_empty() {
            if self.precomputed_exhausted.load(Ordering::Acquire)
                || self.aborted.load(Ordering::Acquire)
            {
                return None;
            }
            computed = self.condition_future.wait(computed).unwrap();
        }
        let (indices, probes) = computed.pop_front().expect("non-empty computed queue");
        drop(computed);

        let mut stats = self.stats.lock().unwrap();
        stats.probes_fed += indices.len();
        drop(stats);

        let mut queues = self.probe_queues.lock().unwrap();
        queues.probes_queued -= indices.len();
        drop(queues);

        Some((indices, probes))
    }

    /// Feed a batch of results to every live function and spawn the
    /// interpolation jobs.
    fn feed_job(self: &Arc<Self>, pool: &Arc<ThreadPool>, indices: Vec<u64>, probes: Vec<Vec<FFInt>>) {
        self.feed_job_inner(pool, indices, probes);

        let mut jobs = self.jobs.lock().unwrap();
        jobs.feed_jobs -= 1;
        self.condition_feed.notify_all();
    }

    fn feed_job_inner(
        self: &Arc<Self>,
        pool: &Arc<ThreadPool>,
        indices: Vec<u64>,
        probes: Vec<Vec<FFInt>>,
    ) {
        let prime_it = self.prime_it.load(Ordering::Acquire);

        let mut t_vec = Vec::with_capacity(indices.len());
        let mut zi_order_vec = Vec::with_capacity(indices.len());
        let mut count_ones = 0usize;

        {
            let mut queues = self.probe_queues.lock().unwrap();
            for index in &indices {
                let Some((t, zi_order)) = queues.index_map.remove(index) else {
                    // The index map was cleared by a barrier; drop the batch.
                    return;
                };
                if prime_it == 0 && zi_order.iter().all(|&o| o == 1) {
                    count_ones += 1;
                }
                t_vec.push(t);
                zi_order_vec.push(zi_order);
            }
        }

        if count_ones != 0 {
            self.balance_of_ones.fetch_add(count_ones, Ordering::AcqRel);
        }

        let reconst = self.reconst.read().unwrap().clone();

        for fun in reconst.iter() {
            if *fun.status.lock().unwrap() != FunStatus::Reconstructing {
                continue;
            }
            if fun.rec.is_done() || fun.rec.get_prime() != prime_it {
                continue;
            }

            for (k, (t, zi_order)) in t_vec.iter().zip(zi_order_vec.iter()).enumerate() {
                fun.rec.feed(*t, probes[fun.index][k], zi_order, prime_it);
            }

            if self.save_states {
                let mut lines = String::new();
                for (k, (t, zi_order)) in t_vec.iter().zip(zi_order_vec.iter()).enumerate() {
                    lines.push_str(&save_state::format_probe_line(
                        zi_order,
                        *t,
                        probes[fun.index][k],
                    ));
                }
                let path = self
                    .save_dir
                    .join(format!("probes/{}_{}.gz", fun.index, prime_it));
                if let Err(e) = save_state::append_gz(&path, &lines) {
                    self.set_fatal(e);
                }
            }

            {
                let mut jobs = self.jobs.lock().unwrap();
                jobs.interpolate_jobs += 1;
            }

            let shared = Arc::clone(self);
            let pool_clone = Arc::clone(pool);
            let fun = Arc::clone(fun);
            pool.run_priority_task(move |_| {
                shared.interpolate_job(&pool_clone, &fun);
            });
        }
    }

    /// Run one interpolation turn on a function and queue follow-up probes.
    fn interpolate_job(self: &Arc<Self>, pool: &Arc<ThreadPool>, fun: &FunctionReconst) {
        let reconstructing = *fun.status.lock().unwrap() == FunStatus::Reconstructing;

        if reconstructing && !self.aborted.load(Ordering::Acquire) {
            match fun.rec.interpolate() {
                Err(e) => self.set_fatal(e),
                Ok(result) if result.interpolated => {
                    self.post_interpolate(pool, fun, result.done, result.prime);
                }
                Ok(_) => {}
            }
        }

        let mut jobs = self.jobs.lock().unwrap();
        jobs.interpolate_jobs -= 1;
        self.condition_feed.notify_all();
    }

    fn post_interpolate(
        self: &Arc<Self>,
        pool: &Arc<ThreadPool>,
        fun: &FunctionReconst,
        done: bool,
        fun_prime: usize,
    ) {
        let prime_it = self.prime_it.load(Ordering::Acquire);

        if done {
            let mut status = fun.status.lock().unwrap();
            if *status == FunStatus::Reconstructing {
                *status = FunStatus::Done;
                drop(status);

                let mut global = self.status.lock().unwrap();
                global.items_done += 1;
                global.one_done = true;
                drop(global);

                if self.save_states {
                    self.write_state_file(fun, fun_prime);
                }
            }
            return;
        }

        if fun.rec.needs_new_shift() || fun.rec.needs_new_anchors() {
            // Handled by the scheduler at the next quiescent point.
            return;
        }

        if fun_prime > prime_it {
            {
                let mut global = self.status.lock().unwrap();
                global.items_new_prime += 1;
                global.one_new_prime = true;
            }

            if self.save_states {
                self.write_state_file(fun, fun_prime);
            }
            return;
        }

        // Queue further probes for this function. Past the first prime the
        // whole remaining schedule is known and prefetched; otherwise the
        // ones-population is kept constant and later orders are topped up.
        let schedule = if prime_it > 0 {
            fun.rec.get_needed_feed_vec()
        } else {
            Vec::new()
        };

        if !schedule.is_empty() {
            for (order, count) in schedule {
                let zi_order = vec![order; self.n.saturating_sub(1)];
                self.queue_missing(pool, &zi_order, count);
            }
        } else {
            for (zi_order, count) in fun.rec.get_zi_orders() {
                let ones = prime_it == 0 && zi_order.iter().all(|&o| o == 1);
                if ones {
                    let balance = self.balance_of_ones.swap(0, Ordering::AcqRel);
                    if balance > 0 {
                        self.started_probes
                            .lock()
                            .unwrap()
                            .entry(zi_order.clone())
                            .and_modify(|c| *c += balance)
                            .or_insert(balance);
                        self.queue_probes(pool, &zi_order, balance);
                    }
                } else {
                    self.queue_missing(pool, &zi_order, count);
                }
            }
        }
    }

    /// Queue as many probes as needed to reach `needed` started probes for
    /// the given order.
    fn queue_missing(self: &Arc<Self>, pool: &Arc<ThreadPool>, zi_order: &[u32], needed: usize) {
        let to_start = {
            let mut started = self.started_probes.lock().unwrap();
            let entry = started.entry(zi_order.to_vec()).or_insert(0);
            if needed > *entry {
                let to_start = needed - *entry;
                *entry = needed;
                to_start
            } else {
                0
            }
        };

        if to_start > 0 {
            self.queue_probes(pool, zi_order, to_start);
        }
    }

    fn write_state_file(&self, fun: &FunctionReconst, fun_prime: usize) {
        let content = fun.rec.save_state_string();
        let rel = format!("states/{}_{}.gz", fun.index, fun_prime);
        if let Err(e) = save_state::write_gz(&self.save_dir, &rel, &content) {
            self.set_fatal(e);
        }
    }
}

fn lookup_precomputed(
    table: &HashMap<Vec<u64>, Vec<u64>>,
    points: &[Vec<FFInt>],
) -> Option<Vec<Vec<FFInt>>> {
    let mut per_function: Vec<Vec<FFInt>> = Vec::new();

    for point in points {
        let key: Vec<u64> = point.iter().map(|v| v.n).collect();
        let outputs = table.get(&key)?;

        if per_function.is_empty() {
            per_function = outputs.iter().map(|&v| vec![FFInt::from_reduced(v)]).collect();
        } else {
            for (per_fun, &v) in per_function.iter_mut().zip(outputs.iter()) {
                per_fun.push(FFInt::from_reduced(v));
            }
        }
    }

    Some(per_function)
}

/// The reconstruction scheduler.
pub struct Reconstructor<B: BlackBox + 'static> {
    shared: Arc<Shared<B>>,
    pool: Arc<ThreadPool>,

    scan: bool,
    factor_scan: bool,
    stop_after_factor_scan: bool,
    safe_mode: bool,
    resume: bool,
    tags: Vec<String>,
    items: usize,
    start_time: Instant,
}

impl<B: BlackBox + 'static> Reconstructor<B> {
    /// Create a scheduler for an `n`-variable black box with `thr_n` worker
    /// threads.
    pub fn new(n: usize, thr_n: usize, bb: B) -> Self {
        Self::with_bunch_size(n, thr_n, 1, bb)
    }

    pub fn with_bunch_size(n: usize, thr_n: usize, bunch_size: usize, bb: B) -> Self {
        assert!(
            ALLOWED_BUNCH_SIZES.contains(&bunch_size),
            "bunch size must be one of {ALLOWED_BUNCH_SIZES:?}"
        );

        FFInt::set_new_prime(primes()[0]);

        let mut rng = StdRng::from_entropy();
        let context = Arc::new(generate_context(n, 0, true, &mut rng));

        let shared = Arc::new(Shared {
            n,
            thr_n,
            bunch_size,
            bb,
            probe_queues: Mutex::new(ProbeQueues::default()),
            computed: Mutex::new(VecDeque::new()),
            condition_future: Condvar::new(),
            chosen_t: Mutex::new(HashMap::new()),
            started_probes: Mutex::new(HashMap::new()),
            balance_of_ones: AtomicUsize::new(0),
            jobs: Mutex::new(JobCounters::default()),
            condition_feed: Condvar::new(),
            status: Mutex::new(GlobalStatus::default()),
            stats: Mutex::new(ProbeStats::default()),
            context: RwLock::new(context),
            reconst: RwLock::new(Vec::new()),
            prime_it: AtomicUsize::new(0),
            factors: RwLock::new(HashMap::new()),
            var_order: RwLock::new(None),
            rng: Mutex::new(rng),
            fatal: Mutex::new(None),
            aborted: AtomicBool::new(false),
            save_states: false,
            save_dir: PathBuf::from(save_state::SAVE_DIR),
            precomputed: Mutex::new(None),
            precomputed_exhausted: AtomicBool::new(false),
        });

        Self {
            pool: Arc::new(ThreadPool::new(thr_n)),
            shared,
            scan: false,
            factor_scan: false,
            stop_after_factor_scan: false,
            safe_mode: false,
            resume: false,
            tags: Vec::new(),
            items: 0,
            start_time: Instant::now(),
        }
    }

    /// Seed the internal random number generator, for reproducible runs.
    pub fn set_seed(&self, seed: u64) {
        *self.shared.rng.lock().unwrap() = StdRng::seed_from_u64(seed);
    }

    pub fn enable_shift_scan(&mut self) {
        if self.shared.n > 1 {
            self.scan = true;
        }
    }

    pub fn enable_factor_scan(&mut self) {
        self.factor_scan = true;
    }

    pub fn stop_after_factor_scan(&mut self) {
        self.stop_after_factor_scan = true;
    }

    pub fn set_safe_interpolation(&mut self) {
        self.safe_mode = true;
    }

    /// Enable tagged checkpointing under `ff_save/`.
    pub fn set_tags(&mut self, tags: Vec<String>) {
        self.tags = tags;
        self.enable_saving();
    }

    pub fn enable_saving(&mut self) {
        Arc::get_mut(&mut self.shared)
            .map(|s| s.save_states = true)
            .expect("set options before reconstruct");
    }

    pub fn set_save_dir<P: Into<PathBuf>>(&mut self, dir: P) {
        Arc::get_mut(&mut self.shared)
            .map(|s| s.save_dir = dir.into())
            .expect("set options before reconstruct");
    }

    /// Use a table of precomputed probes instead of the black box. Lines:
    /// `x1 x2 ... xn : v1 v2 ... vm`.
    pub fn load_precomputed_probes(&mut self, content: &str) -> Result<()> {
        let mut table = HashMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (point, values) = line
                .split_once(':')
                .ok_or_else(|| FireFlyError::Input(format!("malformed probe line: {line}")))?;
            let point: std::result::Result<Vec<u64>, _> =
                point.split_whitespace().map(|s| s.parse()).collect();
            let values: std::result::Result<Vec<u64>, _> =
                values.split_whitespace().map(|s| s.parse()).collect();
            match (point, values) {
                (Ok(p), Ok(v)) => {
                    table.insert(p, v);
                }
                _ => {
                    return Err(FireFlyError::Input(format!(
                        "malformed probe line: {line}"
                    )))
                }
            }
        }
        *self.shared.precomputed.lock().unwrap() = Some(table);
        Ok(())
    }

    /// Request cooperative cancellation; `reconstruct` returns after the
    /// current feeds drain and can be invoked again to resume.
    pub fn abort(&self) {
        self.shared.signal_abort();
    }

    /// Number of probes evaluated so far.
    pub fn probes_fed(&self) -> usize {
        self.shared.stats.lock().unwrap().probes_fed
    }

    /// Run the reconstruction over at most `max_primes` prime fields.
    pub fn reconstruct(&mut self, max_primes: usize) -> Result<()> {
        self.start_time = Instant::now();
        self.shared.aborted.store(false, Ordering::Release);

        if !self.resume {
            let prime_it = self.shared.prime_it.load(Ordering::Acquire);
            info!("FireFly info: promote to new prime field: F({})", primes()[prime_it]);

            if self.safe_mode && (self.factor_scan || self.scan) {
                warn!("FireFly warning: disabled factor and shift scan in safe mode");
                self.factor_scan = false;
                self.scan = false;
            }

            if self.shared.precomputed.lock().unwrap().is_some()
                && (self.factor_scan || self.scan)
            {
                warn!("FireFly warning: disabled factor and shift scan with precomputed probes");
                self.factor_scan = false;
                self.scan = false;
            }

            if self.factor_scan {
                self.scan_for_factors()?;

                if self.stop_after_factor_scan {
                    return Ok(());
                }
            }

            if self.scan {
                self.scan_for_shift()?;
            }

            self.start_first_runs()?;
        }

        if self.shared.save_states {
            save_state::init_save_dir(&self.shared.save_dir)?;
            self.write_context_files()?;
        }

        let result = self.run_until_done(max_primes);

        self.pool.kill_all();

        if let Some(e) = self.shared.fatal.lock().unwrap().take() {
            error!("{e}");
            return Err(e);
        }
        result?;

        let status = self.shared.status.lock().unwrap();
        let stats = self.shared.stats.lock().unwrap();
        let prime_it = self.shared.prime_it.load(Ordering::Acquire);
        if status.items_done == self.items {
            info!(
                "FireFly info: completed reconstruction in {:.3} s | {} probes in total",
                self.start_time.elapsed().as_secs_f64(),
                stats.total_iterations + stats.iteration,
            );
            info!("FireFly info: required prime fields: {} + 1", prime_it);
            info!(
                "FireFly info: average time of the black-box probe: {:.6} s",
                stats.average_black_box_time
            );
        }

        Ok(())
    }

    /// The results of all finished functions.
    pub fn get_result(&self) -> Vec<RationalFunction> {
        let reconst = self.shared.reconst.read().unwrap();
        let factors = self.shared.factors.read().unwrap();
        let var_order = self.shared.var_order.read().unwrap();

        let mut results = Vec::new();
        for fun in reconst.iter() {
            if *fun.status.lock().unwrap() == FunStatus::Done {
                if let Some(mut rf) = fun.rec.get_result() {
                    if let Some(order) = var_order.as_ref() {
                        rf.set_var_order(order.clone());
                    }
                    if let Some(fun_factors) = factors.get(&fun.index) {
                        for factor in fun_factors {
                            rf.add_factor(factor.clone());
                        }
                    }
                    results.push(rf);
                }
            }
        }
        results
    }

    /// Collect finished functions early; the collected functions are marked
    /// for deletion and skipped afterwards.
    pub fn get_early_results(&self) -> Vec<(String, RationalFunction)> {
        let reconst = self.shared.reconst.read().unwrap();
        let factors = self.shared.factors.read().unwrap();
        let var_order = self.shared.var_order.read().unwrap();

        let mut results = Vec::new();
        for fun in reconst.iter() {
            let mut status = fun.status.lock().unwrap();
            if *status == FunStatus::Done {
                if let Some(mut rf) = fun.rec.get_result() {
                    if let Some(order) = var_order.as_ref() {
                        rf.set_var_order(order.clone());
                    }
                    if let Some(fun_factors) = factors.get(&fun.index) {
                        for factor in fun_factors {
                            rf.add_factor(factor.clone());
                        }
                    }
                    let tag = fun.rec.get_tag();
                    let name = if tag.is_empty() {
                        fun.index.to_string()
                    } else {
                        tag
                    };
                    results.push((name, rf));
                    *status = FunStatus::Delete;
                }
            }
        }
        results
    }

    // ----- startup -------------------------------------------------------

    /// Evaluate the first probes, size the function list and create the
    /// per-function reconstruction objects.
    fn start_first_runs(&mut self) -> Result<()> {
        let zi_order = vec![1u32; self.shared.n.saturating_sub(1)];
        let to_start = self.shared.thr_n;

        self.shared.queue_probes(&self.pool, &zi_order, to_start);
        self.shared
            .started_probes
            .lock()
            .unwrap()
            .insert(zi_order.clone(), to_start);

        let Some((indices, probes)) = self.shared.get_probe() else {
            self.dump_requested_probes()?;
            return Err(FireFlyError::Input(
                "no precomputed probes available for the initial run".into(),
            ));
        };
        self.items = probes.len();

        if !self.tags.is_empty() && self.tags.len() != self.items {
            return Err(FireFlyError::Input(
                "number of tags does not match the black box".into(),
            ));
        }

        info!("FireFly info: {} function(s) will be interpolated", self.items);

        let mut t_vec = Vec::new();
        let mut zi_order_vec = Vec::new();
        {
            let mut queues = self.shared.probe_queues.lock().unwrap();
            for index in &indices {
                let (t, order) = queues
                    .index_map
                    .remove(index)
                    .expect("first probes are mapped");
                t_vec.push(t);
                zi_order_vec.push(order);
            }
        }
        self.shared
            .balance_of_ones
            .fetch_add(indices.len(), Ordering::AcqRel);

        if self.shared.save_states {
            save_state::init_save_dir(&self.shared.save_dir)?;
            self.write_validation_file(&t_vec[0], &zi_order_vec[0], &probes)?;
        }

        let context = self.shared.context();
        let mut reconst = Vec::with_capacity(self.items);

        for i in 0..self.items {
            let rec = RatReconst::new(self.shared.n, Arc::clone(&context));
            if self.safe_mode {
                rec.set_safe_interpolation();
            }

            let tag = self
                .tags
                .get(i)
                .cloned()
                .unwrap_or_else(|| i.to_string());
            rec.set_tag(&tag);

            for (k, (t, order)) in t_vec.iter().zip(zi_order_vec.iter()).enumerate() {
                rec.feed(*t, probes[i][k], order, 0);
            }
            let result = rec.interpolate()?;

            let mut global = self.shared.status.lock().unwrap();
            let status = if result.done {
                global.items_done += 1;
                global.one_done = true;
                FunStatus::Done
            } else if result.prime > 0 {
                global.items_new_prime += 1;
                global.one_new_prime = true;
                FunStatus::Reconstructing
            } else {
                FunStatus::Reconstructing
            };
            drop(global);

            if self.shared.save_states {
                let mut lines = String::new();
                for (k, (t, order)) in t_vec.iter().zip(zi_order_vec.iter()).enumerate() {
                    lines.push_str(&save_state::format_probe_line(order, *t, probes[i][k]));
                }
                let path = self.shared.save_dir.join(format!("probes/{i}_0.gz"));
                save_state::append_gz(&path, &lines)?;
            }

            reconst.push(Arc::new(FunctionReconst {
                index: i,
                status: Mutex::new(status),
                rec,
            }));
        }

        *self.shared.reconst.write().unwrap() = reconst;

        // Keep the ones flowing for the univariate phase.
        self.shared.queue_probes(&self.pool, &zi_order, indices.len());
        *self
            .shared
            .started_probes
            .lock()
            .unwrap()
            .entry(zi_order)
            .or_insert(0) += indices.len();

        Ok(())
    }

    // ----- the main loop -------------------------------------------------

    fn run_until_done(&mut self, max_primes: usize) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let mut new_prime = false;

        if self.resume {
            self.resume = false;
            let (items_done, items_new_prime) = {
                let status = shared.status.lock().unwrap();
                (status.items_done, status.items_new_prime)
            };
            if items_done == self.items {
                return Ok(());
            }
            if items_done + items_new_prime == self.items {
                new_prime = true;
            } else {
                // Continue inside the stored prime with whatever the live
                // functions ask for.
                if !self.attempt_to_continue() {
                    let zi_order = vec![1u32; shared.n.saturating_sub(1)];
                    shared.queue_probes(&self.pool, &zi_order, shared.thr_n);
                    *shared
                        .started_probes
                        .lock()
                        .unwrap()
                        .entry(zi_order)
                        .or_insert(0) += shared.thr_n;
                }
            }
        }

        loop {
            if shared.fatal.lock().unwrap().is_some() || shared.aborted.load(Ordering::Acquire) {
                return Ok(());
            }

            {
                let status = shared.status.lock().unwrap();
                if status.items_done == self.items {
                    break;
                }
                if status.items_done + status.items_new_prime == self.items {
                    drop(status);
                    new_prime = true;
                }
            }

            if new_prime {
                new_prime = false;
                if !self.advance_prime(max_primes)? {
                    break;
                }
                continue;
            }

            let Some((indices, probes)) = shared.get_probe() else {
                if shared.aborted.load(Ordering::Acquire) {
                    shared.wait_for_jobs();
                    return Ok(());
                }
                warn!("FireFly warning: precomputed probes exhausted, dumping open requests");
                self.dump_requested_probes()?;
                return Ok(());
            };

            {
                let mut jobs = shared.jobs.lock().unwrap();
                jobs.feed_jobs += 1;
            }
            {
                let shared = Arc::clone(&shared);
                let pool = Arc::clone(&self.pool);
                self.pool.run_priority_task(move |_| {
                    shared.feed_job(&pool, indices, probes);
                });
            }

            self.check_backlog()?;
        }

        self.pool.kill_all();

        let mut stats = shared.stats.lock().unwrap();
        stats.total_iterations += stats.iteration;
        stats.iteration = 0;

        Ok(())
    }

    /// Handle an empty probe backlog: wait out in-flight jobs, then decide
    /// between prime promotion, shift/anchor restarts and recovery.
    fn check_backlog(&mut self) -> Result<()> {
        let shared = Arc::clone(&self.shared);

        loop {
            {
                let queues = shared.probe_queues.lock().unwrap();
                if queues.probes_queued > 0 {
                    return Ok(());
                }
            }

            {
                let mut jobs = shared.jobs.lock().unwrap();
                while jobs.feed_jobs > 0 || jobs.interpolate_jobs > 0 {
                    jobs = shared.condition_feed.wait(jobs).unwrap();
                }
            }

            {
                let queues = shared.probe_queues.lock().unwrap();
                if queues.probes_queued > 0 {
                    return Ok(());
                }
            }

            while self.pool.wait() {}

            {
                let status = shared.status.lock().unwrap();
                if status.items_done == self.items
                    || status.items_done + status.items_new_prime == self.items
                {
                    return Ok(());
                }
            }

            if shared.fatal.lock().unwrap().is_some() || shared.aborted.load(Ordering::Acquire) {
                return Ok(());
            }

            if self.handle_restart_requests()? {
                continue;
            }

            warn!("FireFly warning: nothing left to feed, attempting to continue");
            if !self.attempt_to_continue() {
                return Err(FireFlyError::Algorithm(
                    "scheduler stalled with live functions and no feedable probes".into(),
                ));
            }
        }
    }

    /// Redraw the shift or the anchor points when a function asked for it.
    /// Returns true when a restart was performed.
    fn handle_restart_requests(&mut self) -> Result<bool> {
        let shared = &self.shared;
        let reconst = shared.reconst.read().unwrap().clone();

        let any_shift = reconst.iter().any(|f| f.rec.needs_new_shift());
        let any_anchors = reconst.iter().any(|f| f.rec.needs_new_anchors());

        if !any_shift && !any_anchors {
            return Ok(false);
        }

        shared.wait_for_jobs();
        self.pool.kill_all();
        self.clear_probe_state();

        let prime_it = shared.prime_it.load(Ordering::Acquire);
        let context = {
            let mut rng = shared.rng.lock().unwrap();
            let old = shared.context();
            let mut new = generate_context(shared.n, prime_it, any_shift || old.has_shift(), &mut rng);
            if !any_shift {
                new.shift = old.shift.clone();
            }
            Arc::new(new)
        };
        *shared.context.write().unwrap() = Arc::clone(&context);

        if any_shift {
            info!("FireFly info: trying again with new parameter shift");
        }

        for fun in reconst.iter() {
            if *fun.status.lock().unwrap() != FunStatus::Reconstructing
                || fun.rec.is_done()
                || fun.rec.get_prime() != prime_it
            {
                continue;
            }

            fun.rec.set_context(Arc::clone(&context));

            if any_shift || fun.rec.get_max_degrees().is_none() {
                fun.rec.reset_uni_phase();
            } else {
                fun.rec.reset_multivariate_phase()?;
            }
        }

        if self.shared.save_states {
            self.write_context_files()?;

            // The logged probes of this prime belong to the old shift or
            // anchor points; replaying them would corrupt a resumed run.
            for fun in reconst.iter() {
                let path = self
                    .shared
                    .save_dir
                    .join(format!("probes/{}_{}.gz", fun.index, prime_it));
                let _ = std::fs::remove_file(path);
            }
        }

        let zi_order = vec![1u32; shared.n.saturating_sub(1)];
        shared.queue_probes(&self.pool, &zi_order, shared.thr_n);
        shared
            .started_probes
            .lock()
            .unwrap()
            .insert(zi_order, shared.thr_n);

        Ok(true)
    }

    /// Ask every live function what it wants next and reseed the queues.
    fn attempt_to_continue(&mut self) -> bool {
        let shared = &self.shared;
        let reconst = shared.reconst.read().unwrap().clone();
        let prime_it = shared.prime_it.load(Ordering::Acquire);

        shared.started_probes.lock().unwrap().clear();
        self.shared.balance_of_ones.store(0, Ordering::Release);

        let mut queued_any = false;
        for fun in reconst.iter() {
            if *fun.status.lock().unwrap() != FunStatus::Reconstructing
                || fun.rec.is_done()
                || fun.rec.get_prime() != prime_it
            {
                continue;
            }

            for (zi_order, count) in fun.rec.get_zi_orders() {
                self.shared
                    .queue_missing(&self.pool, &zi_order, count.max(1));
                queued_any = true;
            }
        }

        queued_any
    }

    fn clear_probe_state(&self) {
        let shared = &self.shared;
        {
            let mut queues = shared.probe_queues.lock().unwrap();
            queues.requested.clear();
            queues.index_map.clear();
            queues.probes_queued = 0;
        }
        shared.computed.lock().unwrap().clear();
        shared.chosen_t.lock().unwrap().clear();
        shared.started_probes.lock().unwrap().clear();
        shared.balance_of_ones.store(0, Ordering::Release);
    }

    /// The new-prime barrier.
    fn advance_prime(&mut self, max_primes: usize) -> Result<bool> {
        let shared = Arc::clone(&self.shared);

        shared.wait_for_jobs();
        self.pool.kill_all();
        self.clean_reconst();

        let prime_it = shared.prime_it.load(Ordering::Acquire) + 1;
        if prime_it >= max_primes.min(primes().len()) {
            return Err(FireFlyError::Algorithm(format!(
                "reconstruction did not finish within {max_primes} prime fields"
            )));
        }
        shared.prime_it.store(prime_it, Ordering::Release);

        {
            let mut stats = shared.stats.lock().unwrap();
            stats.total_iterations += stats.iteration;
            stats.iteration = 0;

            let mut status = shared.status.lock().unwrap();
            if status.one_done || status.one_new_prime {
                status.one_done = false;
                info!(
                    "FireFly info: probe: {} | done: {} / {} | requires new prime field: {} / {}",
                    stats.probes_fed,
                    status.items_done,
                    self.items,
                    status.items_new_prime,
                    self.items - status.items_done
                );
            }
            info!(
                "FireFly info: promote to new prime field: F({})",
                primes()[prime_it]
            );
        }

        self.clear_probe_state();

        FFInt::set_new_prime(primes()[prime_it]);
        shared.bb.prime_changed();

        // Regenerate anchors; the shift is only kept in safe mode.
        let context = {
            let mut rng = shared.rng.lock().unwrap();
            Arc::new(generate_context(shared.n, prime_it, self.safe_mode, &mut rng))
        };
        if !self.safe_mode && shared.context().has_shift() {
            info!("FireFly info: disable shift");
        }
        *shared.context.write().unwrap() = Arc::clone(&context);

        {
            let mut status = shared.status.lock().unwrap();
            status.items_new_prime = 0;
            status.one_new_prime = false;
        }

        let reconst = shared.reconst.read().unwrap().clone();
        let mut probes_for_next_prime = 0;
        for fun in reconst.iter() {
            if *fun.status.lock().unwrap() != FunStatus::Reconstructing {
                continue;
            }
            fun.rec.set_context(Arc::clone(&context));
            fun.rec.on_new_prime_started();
            probes_for_next_prime = probes_for_next_prime.max(fun.rec.get_num_eqn());

            if fun.rec.get_prime() > prime_it {
                let mut status = shared.status.lock().unwrap();
                status.items_new_prime += 1;
            }
        }

        if self.shared.save_states {
            self.write_context_files()?;
        }

        if probes_for_next_prime == 0 {
            probes_for_next_prime = shared.thr_n;
        }

        let zi_order = vec![1u32; shared.n.saturating_sub(1)];
        let to_start = probes_for_next_prime.min(shared.thr_n.max(1));
        shared.queue_probes(&self.pool, &zi_order, to_start);
        shared
            .started_probes
            .lock()
            .unwrap()
            .insert(zi_order, to_start);

        Ok(true)
    }

    fn clean_reconst(&self) {
        let mut reconst = self.shared.reconst.write().unwrap();
        reconst.retain(|fun| *fun.status.lock().unwrap() != FunStatus::Delete);
    }

    /// Write the probe points the run still needs, for offline evaluation.
    fn dump_requested_probes(&self) -> Result<()> {
        let queues = self.shared.probe_queues.lock().unwrap();
        let mut content = String::new();
        for (_, point) in &queues.requested {
            content.push_str(save_state::format_ff_line(point).trim_end());
            content.push('\n');
        }
        drop(queues);
        std::fs::write("requested_probes", content)?;
        Ok(())
    }

    fn write_context_files(&self) -> Result<()> {
        let context = self.shared.context();
        save_state::write_plain(
            &self.shared.save_dir,
            "anchor_points",
            &save_state::format_ff_line(&context.anchors),
        )?;
        save_state::write_plain(
            &self.shared.save_dir,
            "shift",
            &save_state::format_ff_line(&context.shift),
        )?;
        Ok(())
    }

    fn write_validation_file(
        &self,
        t: &FFInt,
        zi_order: &[u32],
        probes: &[Vec<FFInt>],
    ) -> Result<()> {
        let context = self.shared.context();
        let internal = context.probe_point(*t, zi_order);
        let point = self.shared.to_user_point(&internal);

        let mut content = save_state::format_ff_line(&point);
        for fun_probes in probes {
            content.push_str(&format!("{}\n", fun_probes[0].n));
        }
        save_state::write_gz(&self.shared.save_dir, "validation.gz", &content)
    }
}

/// Draw fresh anchor points (and optionally a shift) for a prime.
fn generate_context(n: usize, prime_index: usize, with_shift: bool, rng: &mut StdRng) -> PrimeContext {
    let prime = FFInt::prime();
    let anchors = (0..n.saturating_sub(1))
        .map(|_| FFInt::from_reduced(rng.gen_range(2..prime)))
        .collect();
    let shift = if with_shift && n > 1 {
        (0..n)
            .map(|_| FFInt::from_reduced(rng.gen_range(1..1_000_000)))
            .collect()
    } else {
        vec![FFInt::zero(); n]
    };

    PrimeContext {
        prime_index,
        anchors,
        shift,
    }
}

// ----- shift scan --------------------------------------------------------

impl<B: BlackBox + 'static> Reconstructor<B> {
    /// Try sparse shifts: iterate over the subsets of variables to shift in
    /// colex order of their characteristic vectors and keep the first
    /// candidate every function accepts. The all-ones candidate runs first
    /// and pins the degree bounds.
    fn scan_for_shift(&mut self) -> Result<()> {
        info!("FireFly info: scanning for a sparse shift");
        let shared = Arc::clone(&self.shared);
        let n = shared.n;

        // All-ones first, then by number of shifted variables.
        let mut candidates: Vec<Vec<bool>> = Vec::new();
        candidates.push(vec![true; n]);
        for ones in 1..n {
            let mut masks = subset_masks(n, ones);
            masks.sort_by(|a, b| {
                let key = |m: &Vec<bool>| -> Vec<u8> {
                    m.iter().rev().map(|&b| u8::from(b)).collect()
                };
                key(a).cmp(&key(b))
            });
            candidates.extend(masks);
        }

        let mut degrees: Option<Vec<(u32, u32)>> = None;
        let mut accepted: Option<Vec<bool>> = None;

        for (candidate_idx, mask) in candidates.iter().enumerate() {
            let context = {
                let mut rng = shared.rng.lock().unwrap();
                let mut context = generate_context(n, 0, true, &mut rng);
                for (i, &shifted) in mask.iter().enumerate() {
                    if !shifted {
                        context.shift[i] = FFInt::zero();
                    }
                }
                Arc::new(context)
            };
            *shared.context.write().unwrap() = Arc::clone(&context);
            self.clear_probe_state();

            let works = self.run_scan_candidate(&context, degrees.as_deref(), candidate_idx == 0)?;

            if candidate_idx == 0 {
                degrees = Some(works.1);
                if n == 1 || !works.0 {
                    // The dense shift must work; if not, keep drawing dense
                    // shifts inside the main run instead.
                    break;
                }
                continue;
            }

            if works.0 {
                accepted = Some(mask.clone());
                info!(
                    "FireFly info: found sparse shift with {} shifted variable(s)",
                    mask.iter().filter(|&&b| b).count()
                );
                break;
            }
        }

        // Fall back to a dense shift when no sparse one exists.
        if accepted.is_none() {
            let context = {
                let mut rng = shared.rng.lock().unwrap();
                Arc::new(generate_context(n, 0, true, &mut rng))
            };
            *shared.context.write().unwrap() = context;
        }
        self.clear_probe_state();

        if self.shared.save_states {
            save_state::init_save_dir(&self.shared.save_dir)?;
            save_state::write_plain(&self.shared.save_dir, "scan", "")?;
        }

        Ok(())
    }

    /// Run the Thiele phase of every function under the current candidate
    /// shift. Returns whether all functions accept it, and the degree
    /// bounds discovered.
    fn run_scan_candidate(
        &mut self,
        context: &Arc<PrimeContext>,
        expected: Option<&[(u32, u32)]>,
        first: bool,
    ) -> Result<(bool, Vec<(u32, u32)>)> {
        let shared = Arc::clone(&self.shared);
        let zi_order = vec![1u32; shared.n.saturating_sub(1)];

        // Determine the function count with one probe if unknown.
        if self.items == 0 {
            let point = shared.to_user_point(&context.probe_point(FFInt::new(17), &zi_order));
            self.items = shared.bb.eval(&point, 0).len();
        }

        let scanners: Vec<RatReconst> = (0..self.items)
            .map(|i| {
                let rec = RatReconst::new(shared.n, Arc::clone(context));
                rec.scan_for_sparsest_shift();
                if let Some(expected) = expected {
                    rec.set_expected_degrees(expected[i].0, expected[i].1);
                }
                rec
            })
            .collect();

        let mut used_t: HashSet<u64> = HashSet::new();

        loop {
            let mut all_finished = true;
            for rec in &scanners {
                if !rec.is_shift_scan_finished() && !rec.needs_new_shift() {
                    all_finished = false;
                }
            }
            if all_finished {
                break;
            }

            let t = {
                let mut rng = shared.rng.lock().unwrap();
                loop {
                    let candidate = rng.gen_range(1..FFInt::prime());
                    if used_t.insert(candidate) {
                        break FFInt::from_reduced(candidate);
                    }
                }
            };

            let point = shared.to_user_point(&context.probe_point(t, &zi_order));
            let mut values = shared.bb.eval(&point, 0);

            {
                let factors = shared.factors.read().unwrap();
                for (fun_idx, value) in values.iter_mut().enumerate() {
                    if let Some(fun_factors) = factors.get(&fun_idx) {
                        for factor in fun_factors {
                            *value /= factor.eval_ff(&point);
                        }
                    }
                }
            }

            for (rec, value) in scanners.iter().zip(values) {
                if !rec.is_shift_scan_finished() {
                    rec.feed(t, value, &zi_order, 0);
                    rec.interpolate()?;
                }
            }
        }

        let mut all_work = true;
        let mut degrees = Vec::with_capacity(self.items);
        for rec in &scanners {
            if rec.needs_new_shift() || !rec.is_shift_working() {
                all_work = false;
            }
            let (num, den) = rec.get_max_degrees().unwrap_or((0, 0));
            degrees.push((num, den));
        }

        if first && !all_work {
            // With the dense candidate a failure means the shift values were
            // unlucky; the caller falls back to the main-run redraw loop.
            warn!("FireFly warning: dense shift candidate rejected during scan");
        }

        Ok((all_work, degrees))
    }
}

/// All boolean masks of length n with exactly `ones` true entries.
fn subset_masks(n: usize, ones: usize) -> Vec<Vec<bool>> {
    let mut out = Vec::new();
    let mut mask = vec![false; n];
    fill_masks(&mut out, &mut mask, 0, ones);
    out
}

fn fill_masks(out: &mut Vec<Vec<bool>>, mask: &mut Vec<bool>, start: usize, remaining: usize) {
    if remaining == 0 {
        out.push(mask.clone());
        return;
    }
    for i in start..=(mask.len() - remaining) {
        mask[i] = true;
        fill_masks(out, mask, i + 1, remaining - 1);
        mask[i] = false;
    }
}

// ----- factor scan -------------------------------------------------------

impl<B: BlackBox + 'static> Reconstructor<B> {
    /// Strip univariate factors before the multivariate phase.
    ///
    /// Variable by variable, the black box is sliced to a univariate
    /// function by fixing all other coordinates to random integers (reduced
    /// into every prime, so the slice is a fixed rational function). The
    /// slice is reconstructed exactly, its numerator and denominator are
    /// stripped of rational linear factors, and only factors appearing in
    /// two independent slices are accepted. The maximal observed degrees
    /// drive the variable reordering.
    fn scan_for_factors(&mut self) -> Result<()> {
        info!("FireFly info: scanning for univariate factors");
        let shared = Arc::clone(&self.shared);
        let n = shared.n;

        // Size the black box.
        FFInt::set_new_prime(primes()[0]);
        if self.items == 0 {
            let point: Vec<FFInt> = (0..n).map(|i| FFInt::new(100 + i as u64)).collect();
            self.items = shared.bb.eval(&point, 0).len();
        }

        let mut max_degs = vec![0u32; n];
        let mut all_factors: HashMap<usize, Vec<UnivariateFactor>> = HashMap::new();

        for var in 0..n {
            let mut slice_results: Vec<Vec<(Vec<(crate::rational::RationalNumber, u32)>, Vec<(crate::rational::RationalNumber, u32)>)>> = Vec::new();

            for _slice in 0..2 {
                // Integer offsets reduce consistently into every prime.
                let offsets: Vec<u64> = {
                    let mut rng = shared.rng.lock().unwrap();
                    (0..n).map(|_| rng.gen_range(1..1_000_000_000u64)).collect()
                };

                let mut per_function = Vec::with_capacity(self.items);
                for fun_idx in 0..self.items {
                    let rf = self.reconstruct_univariate_slice(var, &offsets, fun_idx)?;

                    let num_deg = rf
                        .numerator
                        .coefs
                        .iter()
                        .map(|m| m.powers[0])
                        .max()
                        .unwrap_or(0);
                    let den_deg = rf
                        .denominator
                        .coefs
                        .iter()
                        .map(|m| m.powers[0])
                        .max()
                        .unwrap_or(0);
                    max_degs[var] = max_degs[var].max(num_deg).max(den_deg);

                    FFInt::set_new_prime(primes()[0]);
                    let mut rng = shared.rng.lock().unwrap();
                    let num_factors = rational_linear_factors(&rf.numerator, &mut *rng);
                    let den_factors = rational_linear_factors(&rf.denominator, &mut *rng);
                    per_function.push((num_factors.roots, den_factors.roots));
                }
                slice_results.push(per_function);
            }

            // Accept factors found in both slices.
            for fun_idx in 0..self.items {
                let (num_a, den_a) = &slice_results[0][fun_idx];
                let (num_b, den_b) = &slice_results[1][fun_idx];

                let num_common = intersect_roots(num_a, num_b);
                let den_common = intersect_roots(den_a, den_b);

                if num_common.is_empty() && den_common.is_empty() {
                    continue;
                }

                let factor = UnivariateFactor {
                    var,
                    numerator: factors_to_polynomial(&num_common),
                    denominator: factors_to_polynomial(&den_common),
                };

                info!(
                    "FireFly info: function {fun_idx}: accepted univariate factor in variable {var}"
                );
                all_factors.entry(fun_idx).or_default().push(factor);
            }
        }

        FFInt::set_new_prime(primes()[0]);

        // Reorder variables so that degrees are non-increasing.
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| max_degs[b].cmp(&max_degs[a]).then(a.cmp(&b)));

        if order.iter().enumerate().any(|(j, &u)| j != u) {
            info!("FireFly info: optimized variable order: {order:?}");
            *shared.var_order.write().unwrap() = Some(order.clone());

            if self.shared.save_states {
                save_state::init_save_dir(&self.shared.save_dir)?;
                let mut content = String::new();
                for (internal, user) in order.iter().enumerate() {
                    content.push_str(&format!("{user} {internal}\n"));
                }
                save_state::write_gz(&self.shared.save_dir, "var_order.gz", &content)?;
            }
        }

        if self.shared.save_states && !all_factors.is_empty() {
            save_state::init_save_dir(&self.shared.save_dir)?;
            for (fun_idx, factors) in &all_factors {
                // Human-readable expression...
                let mut content = String::new();
                for factor in factors {
                    let var_name = format!("x{}", factor.var + 1);
                    content.push_str(&format!(
                        "({})/({})\n",
                        factor.numerator.to_horner(&[&var_name]),
                        factor.denominator.to_horner(&[&var_name]),
                    ));
                }
                save_state::write_gz(
                    &self.shared.save_dir,
                    &format!("factors/{fun_idx}.gz"),
                    &content,
                )?;

                // ...and the parsed form needed on resume.
                save_state::write_gz(
                    &self.shared.save_dir,
                    &format!("factors_rf/{fun_idx}.gz"),
                    &serialize_factors(factors),
                )?;
            }
        }

        *shared.factors.write().unwrap() = all_factors;

        Ok(())
    }

    /// Reconstruct one univariate slice of one function, exactly over the
    /// rationals, walking its own prime sequence.
    fn reconstruct_univariate_slice(
        &self,
        var: usize,
        offsets: &[u64],
        fun_idx: usize,
    ) -> Result<RationalFunction> {
        let shared = &self.shared;

        let mut prime_index = 0;
        FFInt::set_new_prime(primes()[prime_index]);
        let mut context = Arc::new(PrimeContext {
            prime_index,
            anchors: Vec::new(),
            shift: vec![FFInt::zero()],
        });

        let rec = RatReconst::new(1, Arc::clone(&context));
        let mut used_t: HashSet<u64> = HashSet::new();

        for _ in 0..1_000_000 {
            if rec.is_done() {
                break;
            }

            if rec.is_new_prime() {
                prime_index = rec.get_prime();
                if prime_index >= primes().len() {
                    return Err(FireFlyError::Algorithm(
                        "factor scan ran out of prime fields".into(),
                    ));
                }
                FFInt::set_new_prime(primes()[prime_index]);
                context = Arc::new(PrimeContext {
                    prime_index,
                    anchors: Vec::new(),
                    shift: vec![FFInt::zero()],
                });
                rec.set_context(Arc::clone(&context));
                rec.on_new_prime_started();
                used_t.clear();
            }

            let t = {
                let mut rng = shared.rng.lock().unwrap();
                loop {
                    let candidate = rng.gen_range(1..FFInt::prime());
                    if used_t.insert(candidate) {
                        break FFInt::from_reduced(candidate);
                    }
                }
            };

            let mut point: Vec<FFInt> = offsets.iter().map(|&o| FFInt::new(o)).collect();
            point[var] = t;

            let value = shared.bb.eval(&point, 0)[fun_idx];
            rec.feed(t, value, &[], rec.get_prime());
            rec.interpolate()?;
        }

        rec.get_result().ok_or_else(|| {
            FireFlyError::Algorithm("univariate slice reconstruction did not converge".into())
        })
    }
}

/// Serialize univariate factors as `var` plus dense numerator and
/// denominator coefficient lines (index = degree).
fn serialize_factors(factors: &[UnivariateFactor]) -> String {
    let mut out = String::new();
    for factor in factors {
        out.push_str(&format!("var {}\n", factor.var));
        for (label, poly) in [("num", &factor.numerator), ("den", &factor.denominator)] {
            out.push_str(label);
            let deg = poly.coefs.iter().map(|m| m.powers[0]).max().unwrap_or(0);
            for d in 0..=deg {
                let coef = poly
                    .coefs
                    .iter()
                    .find(|m| m.powers[0] == d)
                    .map(|m| m.coef.clone())
                    .unwrap_or_else(crate::rational::RationalNumber::zero);
                out.push_str(&format!(" {}/{}", coef.numerator, coef.denominator));
            }
            out.push('\n');
        }
    }
    out
}

fn parse_factors(content: &str) -> Result<Vec<UnivariateFactor>> {
    let malformed = || FireFlyError::Resume("malformed factor file".into());

    let mut factors = Vec::new();
    let mut lines = content.lines().peekable();

    while let Some(line) = lines.next() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let var: usize = line
            .strip_prefix("var ")
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(malformed)?;

        let mut polys = Vec::with_capacity(2);
        for label in ["num", "den"] {
            let poly_line = lines.next().ok_or_else(malformed)?;
            let rest = poly_line.trim().strip_prefix(label).ok_or_else(malformed)?;

            let mut map = HashMap::new();
            for (d, part) in rest.split_whitespace().enumerate() {
                let (p, q) = part.split_once('/').ok_or_else(malformed)?;
                let numerator: num_bigint::BigInt = p.parse().map_err(|_| malformed())?;
                let denominator: num_bigint::BigInt = q.parse().map_err(|_| malformed())?;
                let coef = crate::rational::RationalNumber::new(numerator, denominator);
                if !coef.is_zero() {
                    map.insert(vec![d as u32], coef);
                }
            }
            polys.push(crate::poly::Polynomial::from_map(map));
        }

        let denominator = polys.pop().expect("two polynomials");
        let numerator = polys.pop().expect("two polynomials");
        factors.push(UnivariateFactor { var, numerator, denominator });
    }

    Ok(factors)
}

/// Roots present in both slices, with the smaller multiplicity.
fn intersect_roots(
    a: &[(crate::rational::RationalNumber, u32)],
    b: &[(crate::rational::RationalNumber, u32)],
) -> Vec<(crate::rational::RationalNumber, u32)> {
    let mut out = Vec::new();
    for (root, mult_a) in a {
        if let Some((_, mult_b)) = b.iter().find(|(r, _)| r == root) {
            out.push((root.clone(), *mult_a.min(mult_b)));
        }
    }
    out
}

// ----- resume ------------------------------------------------------------

impl<B: BlackBox + 'static> Reconstructor<B> {
    /// Load a checkpoint from the save directory. The validation probe is
    /// replayed through the live black box; a mismatch is fatal.
    pub fn resume_from_saved_state(&mut self) -> Result<()> {
        self.enable_saving();
        let shared = Arc::clone(&self.shared);
        let base = shared.save_dir.clone();

        let state_files = save_state::list_state_files(&base)
            .map_err(|_| FireFlyError::Resume("no saved states found under ff_save".into()))?;
        if state_files.is_empty() {
            return Err(FireFlyError::Resume("no saved states found under ff_save".into()));
        }

        info!("FireFly info: loading saved states");

        // Variable order
        let var_order_path = base.join("var_order.gz");
        if var_order_path.exists() {
            let content = save_state::read_gz(&var_order_path)?;
            let mut order = vec![0usize; shared.n];
            for line in content.lines() {
                let mut parts = line.split_whitespace();
                let user: usize = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| FireFlyError::Resume("malformed var_order".into()))?;
                let internal: usize = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| FireFlyError::Resume("malformed var_order".into()))?;
                order[internal] = user;
            }
            *shared.var_order.write().unwrap() = Some(order);
        }

        // Factors stripped by a previous factor scan
        let factors_dir = base.join("factors_rf");
        if factors_dir.is_dir() {
            let mut all_factors = HashMap::new();
            for entry in std::fs::read_dir(&factors_dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let fun_idx: usize = name
                    .trim_end_matches(".gz")
                    .parse()
                    .map_err(|_| FireFlyError::Resume(format!("unexpected factor file: {name}")))?;
                let factors = parse_factors(&save_state::read_gz(&entry.path())?)?;
                all_factors.insert(fun_idx, factors);
            }
            info!("FireFly info: parsed {} factor file(s)", all_factors.len());
            *shared.factors.write().unwrap() = all_factors;
        }

        // Load every function state first; the stored big integers do not
        // depend on the active field.
        let placeholder = Arc::new(PrimeContext {
            prime_index: 0,
            anchors: vec![FFInt::zero(); shared.n.saturating_sub(1)],
            shift: vec![FFInt::zero(); shared.n],
        });

        let mut loaded = Vec::with_capacity(state_files.len());
        for (index, state_prime, path) in &state_files {
            let rec = RatReconst::new(shared.n, Arc::clone(&placeholder));
            if self.safe_mode {
                rec.set_safe_interpolation();
            }
            rec.load_state_string(&save_state::read_gz(path)?)?;
            loaded.push((*index, *state_prime, rec));
        }

        // The run resumes at the lowest prime a live function works in.
        let prime_it = loaded
            .iter()
            .filter(|(_, _, rec)| !rec.is_done())
            .map(|(_, _, rec)| rec.get_prime())
            .min()
            .unwrap_or_else(|| loaded.iter().map(|(_, _, rec)| rec.get_prime()).min().unwrap_or(0));
        if prime_it >= primes().len() {
            return Err(FireFlyError::Resume(
                "stored prime counter exceeds the available primes".into(),
            ));
        }
        shared.prime_it.store(prime_it, Ordering::Release);
        FFInt::set_new_prime(primes()[prime_it]);
        shared.bb.prime_changed();

        // Validation probe
        let validation_path = base.join("validation.gz");
        if !validation_path.exists() {
            return Err(FireFlyError::Resume("validation file not found".into()));
        }
        let validation = save_state::read_gz(&validation_path)?;
        // The validation probe was taken in the first prime field.
        FFInt::set_new_prime(primes()[0]);
        shared.bb.prime_changed();
        {
            let mut lines = validation.lines();
            let point_line = lines
                .next()
                .ok_or_else(|| FireFlyError::Resume("empty validation file".into()))?;
            let point: Vec<FFInt> = point_line
                .split_whitespace()
                .map(|s| {
                    s.parse::<u64>()
                        .map(FFInt::from_reduced)
                        .map_err(|e| FireFlyError::Resume(format!("malformed validation: {e}")))
                })
                .collect::<Result<_>>()?;

            let mut result = shared.bb.eval(&point, 0);

            {
                let factors = shared.factors.read().unwrap();
                for (fun_idx, value) in result.iter_mut().enumerate() {
                    if let Some(fun_factors) = factors.get(&fun_idx) {
                        for factor in fun_factors {
                            *value /= factor.eval_ff(&point);
                        }
                    }
                }
            }

            let mut count = 0usize;
            for (fun_idx, line) in lines.enumerate() {
                let expected: u64 = line
                    .trim()
                    .parse()
                    .map_err(|e| FireFlyError::Resume(format!("malformed validation: {e}")))?;
                if fun_idx >= result.len() || result[fun_idx].n != expected {
                    return Err(FireFlyError::Resume(format!(
                        "validation failed: entry {fun_idx} does not match the black box"
                    )));
                }
                count += 1;
            }
            if count != result.len() {
                return Err(FireFlyError::Resume(
                    "validation failed: number of entries does not match the black box".into(),
                ));
            }
        }
        FFInt::set_new_prime(primes()[prime_it]);
        shared.bb.prime_changed();

        // Anchor points and shift
        let anchors = save_state::parse_ff_line(
            save_state::read_plain(&base.join("anchor_points"))?.trim(),
            shared.n - 1,
        )?;
        let mut shift = save_state::parse_ff_line(
            save_state::read_plain(&base.join("shift"))?.trim(),
            shared.n,
        )?;
        // Past the first prime the shift is disabled outside of safe mode.
        if prime_it > 0 && !self.safe_mode {
            shift = vec![FFInt::zero(); shared.n];
        }
        let context = Arc::new(PrimeContext {
            prime_index: prime_it,
            anchors,
            shift,
        });
        *shared.context.write().unwrap() = Arc::clone(&context);

        self.items = state_files.len();

        // Replay the current prime's probe logs, reinstating the chosen t
        // pool as the union over all functions.
        let mut reconst = Vec::with_capacity(loaded.len());

        for (index, _, rec) in loaded {
            rec.set_context(Arc::clone(&context));
            rec.on_new_prime_started();

            let probe_path = base.join(format!("probes/{index}_{prime_it}.gz"));
            if probe_path.exists() && !rec.is_done() && rec.get_prime() == prime_it {
                let probes = save_state::parse_probe_log(&save_state::read_gz(&probe_path)?)?;

                {
                    let mut chosen = shared.chosen_t.lock().unwrap();
                    for (zi_order, t, _) in &probes {
                        chosen.entry(zi_order.clone()).or_default().insert(t.n);
                    }
                }

                for (zi_order, t, value) in probes {
                    rec.feed(t, value, &zi_order, prime_it);
                }
                rec.interpolate()?;
            }

            let status = if rec.is_done() {
                FunStatus::Done
            } else {
                FunStatus::Reconstructing
            };

            reconst.push(Arc::new(FunctionReconst {
                index,
                status: Mutex::new(status),
                rec,
            }));
        }

        let mut items_done = 0usize;
        let mut items_new_prime = 0usize;
        for fun in &reconst {
            if fun.rec.is_done() {
                items_done += 1;
            } else if fun.rec.get_prime() > prime_it {
                items_new_prime += 1;
            }
        }

        {
            let mut status = shared.status.lock().unwrap();
            status.items_done = items_done;
            status.items_new_prime = items_new_prime;
        }

        *shared.reconst.write().unwrap() = reconst;
        self.resume = true;
        self.scan = false;
        self.factor_scan = false;

        info!(
            "FireFly info: all files loaded | done: {} / {} | requires new prime field: {} / {}",
            items_done,
            self.items,
            items_new_prime,
            self.items - items_done
        );

        Ok(())
    }
}
