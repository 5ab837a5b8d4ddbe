//! # Segclock STO
//!
//! Stochastic solver for the zebrafish segmentation clock.
//!
//! The reaction network is simulated with an adaptive hybrid of two
//! algorithms:
//!
//! 1. **Next-reaction method** (Anderson's modified variant) for exact
//!    trajectories, extended with per-reaction delay queues so that a
//!    delayed reaction consumes nothing when it fires and delivers its
//!    product when its delay expires
//! 2. **Adaptive explicit/implicit tau-leaping** (Cao's tau selection)
//!    with improved delay-leaping: delayed firings drawn in one leap are
//!    merged into `(firings, span)` queue nodes when their firing rates
//!    are close, and completions are drained binomially
//!
//! Each iteration the scheduler classifies reactions as critical or
//! non-critical, proposes a leap, and falls back to bursts of exact steps
//! whenever the proposed leap is too small to be worth its overhead.

use std::collections::VecDeque;
use std::io::Write;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use segclock_core::{
    delayed_index, oscillation_features, rate, species, ClockError, Neighbourhood,
    OscillationFeatures, RateSet, Result, RunContext, SimFailure, Simulator, DELAYED_REACTIONS,
    DELAYED_TARGETS, DELAY_RATES, NUM_DELAYED, PARTIAL_EQ_PAIR, REACTIONS, SPECIES, STOICHIOMETRY,
};

// =============================================================================
// TUNING CONSTANTS
// =============================================================================

/// A reaction is critical when it could exhaust a reactant within this
/// many firings.
pub const NCRIT: i64 = 10;

/// Relative bound on the propensity change tolerated within one leap.
pub const EPSILON: f64 = 0.01;

/// The implicit candidate must beat the explicit one by this factor
/// before a step is taken implicitly.
pub const NSTIFF: f64 = 100.0;

/// Leaps smaller than `TAU1_MULT / a0` are abandoned in favour of exact
/// steps.
pub const TAU1_MULT: f64 = 10.0;

/// Exact steps to run after abandoning an explicit leap.
pub const SKIP_STEPS_EXPLICIT: i64 = 100;

/// Exact steps to run after abandoning an implicit leap.
pub const SKIP_STEPS_IMPLICIT: i64 = 10;

/// Relative tolerance for merging delay-queue nodes.
pub const BETA: f64 = 0.05;

/// Relative tolerance of the partial-equilibrium test.
pub const DELTA_FACTOR: f64 = 0.05;

// =============================================================================
// DELAY QUEUES
// =============================================================================

/// One batch of pending delayed completions.
///
/// `ready` is the earliest completion time; `firings` completions are
/// spread over `span` minutes from there. A node created by a single
/// exact firing has `firings == 1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueueNode {
    pub ready: f64,
    pub firings: u64,
    pub span: f64,
}

/// Per-cell, per-delayed-reaction FIFO queues of pending completions.
#[derive(Debug, Clone)]
pub struct DelayQueues {
    queues: Vec<VecDeque<QueueNode>>,
    cells: usize,
}

impl DelayQueues {
    pub fn new(cells: usize) -> Self {
        Self {
            queues: vec![VecDeque::new(); cells * NUM_DELAYED],
            cells,
        }
    }

    fn idx(&self, cell: usize, d: usize) -> usize {
        cell * NUM_DELAYED + d
    }

    pub fn clear(&mut self) {
        for q in &mut self.queues {
            q.clear();
        }
    }

    pub fn queue(&self, cell: usize, d: usize) -> &VecDeque<QueueNode> {
        &self.queues[self.idx(cell, d)]
    }

    pub fn queue_mut(&mut self, cell: usize, d: usize) -> &mut VecDeque<QueueNode> {
        let i = self.idx(cell, d);
        &mut self.queues[i]
    }

    pub fn front(&self, cell: usize, d: usize) -> Option<&QueueNode> {
        self.queue(cell, d).front()
    }

    pub fn push(&mut self, cell: usize, d: usize, node: QueueNode) {
        self.queue_mut(cell, d).push_back(node);
    }

    pub fn pop_front(&mut self, cell: usize, d: usize) -> Option<QueueNode> {
        self.queue_mut(cell, d).pop_front()
    }

    /// Append a leap's worth of delayed firings, merging into the tail
    /// node when the firing rates are within [`BETA`] of each other.
    /// Returns whether a merge happened.
    pub fn enqueue_leap(
        &mut self,
        cell: usize,
        d: usize,
        firings: u64,
        span: f64,
        ready: f64,
    ) -> bool {
        let q = self.queue_mut(cell, d);
        if let Some(tail) = q.back_mut() {
            let tail_rate = tail.firings as f64 / tail.span;
            let new_rate = firings as f64 / span;
            if (new_rate - tail_rate).abs() < BETA * tail_rate {
                tail.firings += firings;
                tail.span += span;
                return true;
            }
        }
        q.push_back(QueueNode {
            ready,
            firings,
            span,
        });
        false
    }

    /// Total pending firings for one reaction in one cell.
    pub fn pending(&self, cell: usize, d: usize) -> u64 {
        self.queue(cell, d).iter().map(|n| n.firings).sum()
    }

    pub fn total_nodes(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    pub fn cells(&self) -> usize {
        self.cells
    }
}

// =============================================================================
// PROPENSITY UPDATE UNITS
// =============================================================================

/// The disjoint groups of propensities that must be recomputed together
/// when a species changes. The set is closed, so dispatch is a fixed
/// table rather than function pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Her1Mrna,
    Her1Protein,
    DimerH1H1,
    Her7Protein,
    DimerH1H7,
    Her13Protein,
    DimerH1H13,
    Her7Mrna,
    DimerH7H7,
    DimerH7H13,
    Her13Mrna,
    DimerH13H13,
    DeltaMrna,
    DeltaProtein,
    Transcription,
}

const ALL_UNITS: [Unit; 15] = [
    Unit::Her1Mrna,
    Unit::Her1Protein,
    Unit::DimerH1H1,
    Unit::Her7Protein,
    Unit::DimerH1H7,
    Unit::Her13Protein,
    Unit::DimerH1H13,
    Unit::Her7Mrna,
    Unit::DimerH7H7,
    Unit::DimerH7H13,
    Unit::Her13Mrna,
    Unit::DimerH13H13,
    Unit::DeltaMrna,
    Unit::DeltaProtein,
    Unit::Transcription,
];

/// Units to re-run after each reaction changes its species, and whether
/// the refresh must reach every neighbour (only reactions moving Delta,
/// which feeds the neighbours' transcription propensities).
static UNIT_TABLE: [(&[Unit], bool); REACTIONS] = [
    (&[Unit::Her1Protein], false),                                        // 0
    (&[Unit::Her1Protein], false),                                        // 1
    (&[Unit::Her1Protein, Unit::DimerH1H1, Unit::Transcription], false),  // 2
    (&[Unit::Her1Protein, Unit::DimerH1H1, Unit::Transcription], false),  // 3
    (&[Unit::Her1Protein, Unit::DimerH1H7, Unit::Her7Protein], false),    // 4
    (&[Unit::Her1Protein, Unit::DimerH1H7, Unit::Her7Protein], false),    // 5
    (&[Unit::Her1Protein, Unit::DimerH1H13, Unit::Her13Protein], false),  // 6
    (&[Unit::Her1Protein, Unit::DimerH1H13, Unit::Her13Protein], false),  // 7
    (&[Unit::Her7Protein], false),                                        // 8
    (&[Unit::Her7Protein], false),                                        // 9
    (&[Unit::Her7Protein, Unit::DimerH7H7], false),                       // 10
    (&[Unit::Her7Protein, Unit::DimerH7H7], false),                       // 11
    (
        &[
            Unit::Her7Protein,
            Unit::DimerH7H13,
            Unit::Her13Protein,
            Unit::Transcription,
        ],
        false,
    ), // 12
    (
        &[
            Unit::Her7Protein,
            Unit::DimerH7H13,
            Unit::Her13Protein,
            Unit::Transcription,
        ],
        false,
    ), // 13
    (&[Unit::Her13Protein], false),                                       // 14
    (&[Unit::Her13Protein], false),                                       // 15
    (&[Unit::Her13Protein, Unit::DimerH13H13], false),                    // 16
    (&[Unit::Her13Protein, Unit::DimerH13H13], false),                    // 17
    (&[Unit::DimerH1H1, Unit::Transcription], false),                     // 18
    (&[Unit::DimerH1H7], false),                                          // 19
    (&[Unit::DimerH1H13], false),                                         // 20
    (&[Unit::DimerH7H7], false),                                          // 21
    (&[Unit::DimerH7H13, Unit::Transcription], false),                    // 22
    (&[Unit::DimerH13H13], false),                                        // 23
    (&[Unit::DeltaProtein, Unit::Transcription], true),                   // 24
    (&[Unit::DeltaProtein, Unit::Transcription], true),                   // 25
    (&[Unit::Her1Mrna], false),                                           // 26
    (&[Unit::Her1Mrna], false),                                           // 27
    (&[Unit::Her7Mrna], false),                                           // 28
    (&[Unit::Her7Mrna], false),                                           // 29
    (&[Unit::Her13Mrna], false),                                          // 30
    (&[Unit::Her13Mrna], false),                                          // 31
    (&[Unit::DeltaMrna], false),                                          // 32
    (&[Unit::DeltaMrna], false),                                          // 33
];

// =============================================================================
// CONFIGURATION AND RUN STATISTICS
// =============================================================================

/// Configuration of a stochastic run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoConfig {
    pub width: usize,
    pub height: usize,
    /// Simulated duration in minutes.
    pub minutes: f64,
    /// Hard cap on scheduler iterations.
    pub max_steps: u64,
    /// Minutes between output snapshots.
    pub granularity: f64,
    /// Minutes between flushes of buffered snapshots.
    pub print_interval: f64,
    /// Enable tau-leaping; exact next-reaction only when false.
    pub approximate: bool,
}

impl Default for StoConfig {
    fn default() -> Self {
        Self {
            width: 2,
            height: 1,
            minutes: 1200.0,
            max_steps: 1_000_000_000_000,
            granularity: 0.1,
            print_interval: 1200.0,
            approximate: false,
        }
    }
}

impl StoConfig {
    fn validate(&self) -> Result<()> {
        if self.minutes < 1.0 {
            return Err(ClockError::Config(
                "the simulation must run for at least one minute".into(),
            ));
        }
        if self.max_steps == 0 {
            return Err(ClockError::Config(
                "the simulation must run for at least one timestep".into(),
            ));
        }
        if self.granularity <= 0.0 {
            return Err(ClockError::Config(
                "the output granularity must be a positive real".into(),
            ));
        }
        if self.print_interval < 1.0 {
            return Err(ClockError::Config(
                "output cannot be flushed more than once a simulation-minute".into(),
            ));
        }
        Ok(())
    }
}

/// Counters describing how a run was scheduled, plus the sampled her1
/// trace of cell 0 used for feature extraction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub simulated_minutes: f64,
    pub exact_steps: u64,
    pub leaps: u64,
    pub implicit_leaps: u64,
    pub leap_retries: u64,
    pub leap_bailouts: u64,
    /// Delayed firings entering the queues, across both algorithms.
    pub delayed_firings: u64,
    /// Queue nodes absorbed into their predecessor by id-leaping.
    pub merged_nodes: u64,
    /// Her1 mRNA of cell 0 at snapshot cadence.
    pub her1: Vec<f64>,
}

// =============================================================================
// OUTPUT RING
// =============================================================================

/// Snapshot buffer between the scheduler and the output file.
///
/// Snapshots accumulate once per `granularity` simulated minutes and are
/// written out when the ring fills or `print_interval` minutes have gone
/// unflushed, so a slow simulation still shows progress without paying
/// for I/O on every step.
struct TraceRing {
    granularity: f64,
    print_interval: f64,
    capacity: usize,
    level: usize,
    rows: Vec<(f64, Vec<i64>)>,
    last_snapshot: f64,
    last_print: f64,
    her1: Vec<f64>,
}

impl TraceRing {
    fn new(cfg: &StoConfig, level: usize) -> Self {
        Self {
            granularity: cfg.granularity,
            print_interval: cfg.print_interval,
            capacity: (cfg.minutes / cfg.granularity) as usize + 1,
            level,
            rows: Vec::new(),
            last_snapshot: 0.0,
            last_print: 0.0,
            her1: Vec::new(),
        }
    }

    fn snapshot(&mut self, t: f64, counts: &Array2<i64>) {
        let row = counts.column(self.level).to_vec();
        self.rows.push((t, row));
        self.her1.push(counts[[0, species::MH1]] as f64);
        self.last_snapshot = t;
    }

    /// Record a snapshot if enough simulated time has passed. Returns
    /// `true` when the run should stop because the state summed negative.
    fn observe(
        &mut self,
        t: f64,
        counts: &Array2<i64>,
        out: &mut Option<&mut dyn Write>,
    ) -> Result<bool> {
        if t - self.last_snapshot < self.granularity {
            return Ok(false);
        }
        if counts.iter().sum::<i64>() < 0 {
            return Ok(true);
        }
        self.snapshot(t, counts);
        if self.rows.len() + 1 >= self.capacity || t - self.last_print >= self.print_interval {
            self.flush(out)?;
            self.last_print = t;
        }
        Ok(false)
    }

    fn flush(&mut self, out: &mut Option<&mut dyn Write>) -> Result<()> {
        if let Some(out) = out {
            for (t, row) in &self.rows {
                write!(out, "{t}\t")?;
                for v in row {
                    write!(out, "{v}\t")?;
                }
                writeln!(out)?;
            }
            out.flush()?;
        }
        self.rows.clear();
        Ok(())
    }

    fn finish(
        &mut self,
        t: f64,
        counts: &Array2<i64>,
        out: &mut Option<&mut dyn Write>,
    ) -> Result<()> {
        self.snapshot(t, counts);
        self.flush(out)
    }
}

// =============================================================================
// SIMULATOR
// =============================================================================

/// What the next-reaction scan selected.
enum NrmChoice {
    /// A reaction fires in a cell.
    Fire(usize, usize),
    /// A delayed reaction's front queue node completes.
    Complete(usize, usize),
}

/// The stochastic hybrid scheduler.
pub struct StoSimulator {
    cfg: StoConfig,
    neigh: Neighbourhood,
    /// Species counts, `cells x species`.
    counts: Array2<i64>,
    /// Propensities, `cells x reactions`, and their running sum.
    a: Array2<f64>,
    a0: f64,
    /// Anderson internal clocks and next firing targets.
    tk: Array2<f64>,
    pk: Array2<f64>,
    queues: DelayQueues,
    /// Signed update of each species by each reaction.
    stoich: [[i64; REACTIONS]; SPECIES],
}

impl StoSimulator {
    pub fn new(cfg: StoConfig) -> Result<Self> {
        cfg.validate()?;
        let neigh = Neighbourhood::new(cfg.width, cfg.height)?;
        let cells = neigh.cells();

        let mut stoich = [[0i64; REACTIONS]; SPECIES];
        for (k, updates) in STOICHIOMETRY.iter().enumerate() {
            for &(j, u) in *updates {
                stoich[j][k] = u;
            }
        }

        Ok(Self {
            cfg,
            neigh,
            counts: Array2::zeros((cells, SPECIES)),
            a: Array2::zeros((cells, REACTIONS)),
            a0: 0.0,
            tk: Array2::zeros((cells, REACTIONS)),
            pk: Array2::zeros((cells, REACTIONS)),
            queues: DelayQueues::new(cells),
            stoich,
        })
    }

    pub fn config(&self) -> &StoConfig {
        &self.cfg
    }

    pub fn counts(&self) -> &Array2<i64> {
        &self.counts
    }

    pub fn propensity_sum(&self) -> f64 {
        self.a0
    }

    pub fn propensity_drift(&self) -> f64 {
        (self.a.sum() - self.a0).abs()
    }

    fn cells(&self) -> usize {
        self.neigh.cells()
    }

    fn set_a(&mut self, cell: usize, k: usize, value: f64) {
        self.a0 += value - self.a[[cell, k]];
        self.a[[cell, k]] = value;
    }

    /// Reinitialise all state for a fresh run: empty tissue, quiescent
    /// queues, and the transcription propensities at their unrepressed
    /// values.
    fn reset(&mut self, rates: &RateSet, ctx: &mut RunContext) {
        self.counts.fill(0);
        self.a.fill(0.0);
        self.a0 = 0.0;
        self.tk.fill(0.0);
        for v in self.pk.iter_mut() {
            *v = ctx.next_target();
        }
        self.queues.clear();
        for i in 0..self.cells() {
            self.set_a(i, 26, rates.at(rate::MSH1, i));
            self.set_a(i, 28, rates.at(rate::MSH7, i));
            self.set_a(i, 30, rates.at(rate::MSH13, i));
            self.set_a(i, 32, rates.at(rate::MSD, i));
        }
    }

    fn count(&self, cell: usize, sp: usize) -> f64 {
        self.counts[[cell, sp]] as f64
    }

    fn apply_unit(&mut self, unit: Unit, cell: usize, rates: &RateSet) {
        let r = |idx: usize| rates.at(idx, cell);
        match unit {
            Unit::Her1Mrna => {
                let x = self.count(cell, species::MH1);
                self.set_a(cell, 0, r(rate::PSH1) * x);
                self.set_a(cell, 27, r(rate::MDH1) * x);
            }
            Unit::Her1Protein => {
                let x = self.count(cell, species::PH1);
                self.set_a(cell, 1, r(rate::PDH1) * x);
                self.set_a(cell, 2, r(rate::DAH1H1) * x * (x - 1.0) / 2.0);
                self.set_a(cell, 4, r(rate::DAH1H7) * x * self.count(cell, species::PH7));
                self.set_a(cell, 6, r(rate::DAH1H13) * x * self.count(cell, species::PH13));
            }
            Unit::DimerH1H1 => {
                let x = self.count(cell, species::PH11);
                self.set_a(cell, 3, r(rate::DDIH1H1) * x);
                self.set_a(cell, 18, r(rate::DDGH1H1) * x);
            }
            Unit::Her7Protein => {
                let x = self.count(cell, species::PH7);
                self.set_a(cell, 4, r(rate::DAH1H7) * self.count(cell, species::PH1) * x);
                self.set_a(cell, 9, r(rate::PDH7) * x);
                self.set_a(cell, 10, r(rate::DAH7H7) * x * (x - 1.0) / 2.0);
                self.set_a(cell, 12, r(rate::DAH7H13) * x * self.count(cell, species::PH13));
            }
            Unit::DimerH1H7 => {
                let x = self.count(cell, species::PH17);
                self.set_a(cell, 5, r(rate::DDIH1H7) * x);
                self.set_a(cell, 19, r(rate::DDGH1H7) * x);
            }
            Unit::Her13Protein => {
                let x = self.count(cell, species::PH13);
                self.set_a(cell, 6, r(rate::DAH1H13) * self.count(cell, species::PH1) * x);
                self.set_a(cell, 12, r(rate::DAH7H13) * self.count(cell, species::PH7) * x);
                self.set_a(cell, 15, r(rate::PDH13) * x);
                self.set_a(cell, 16, r(rate::DAH13H13) * x * (x - 1.0) / 2.0);
            }
            Unit::DimerH1H13 => {
                let x = self.count(cell, species::PH113);
                self.set_a(cell, 7, r(rate::DDIH1H13) * x);
                self.set_a(cell, 20, r(rate::DDGH1H13) * x);
            }
            Unit::Her7Mrna => {
                let x = self.count(cell, species::MH7);
                self.set_a(cell, 8, r(rate::PSH7) * x);
                self.set_a(cell, 29, r(rate::MDH7) * x);
            }
            Unit::DimerH7H7 => {
                let x = self.count(cell, species::PH77);
                self.set_a(cell, 11, r(rate::DDIH7H7) * x);
                self.set_a(cell, 21, r(rate::DDGH7H7) * x);
            }
            Unit::DimerH7H13 => {
                let x = self.count(cell, species::PH713);
                self.set_a(cell, 13, r(rate::DDIH7H13) * x);
                self.set_a(cell, 22, r(rate::DDGH7H13) * x);
            }
            Unit::Her13Mrna => {
                let x = self.count(cell, species::MH13);
                self.set_a(cell, 14, r(rate::PSH13) * x);
                self.set_a(cell, 31, r(rate::MDH13) * x);
            }
            Unit::DimerH13H13 => {
                let x = self.count(cell, species::PH1313);
                self.set_a(cell, 17, r(rate::DDIH13H13) * x);
                self.set_a(cell, 23, r(rate::DDGH13H13) * x);
            }
            Unit::DeltaMrna => {
                let x = self.count(cell, species::MD);
                self.set_a(cell, 24, r(rate::PSD) * x);
                self.set_a(cell, 33, r(rate::MDD) * x);
            }
            Unit::DeltaProtein => {
                let x = self.count(cell, species::PD);
                self.set_a(cell, 25, r(rate::PDD) * x);
            }
            Unit::Transcription => {
                let x11 = self.count(cell, species::PH11) / r(rate::CRITPH1H1);
                let x713 = self.count(cell, species::PH713) / r(rate::CRITPH7H13);
                let neighbours = self.neigh.neighbours(cell);
                let sum: i64 = neighbours
                    .iter()
                    .map(|&j| self.counts[[j, species::PD]])
                    .sum();
                let y = (sum as f64 / neighbours.len() as f64) / r(rate::CRITPD);
                let repression = 1.0 + x11 * x11 + x713 * x713;
                let activation = (1.0 + y) / (y + repression);
                self.set_a(cell, 26, r(rate::MSH1) * activation);
                self.set_a(cell, 28, r(rate::MSH7) * activation);
                self.set_a(cell, 32, r(rate::MSD) / repression);
            }
        }
    }

    /// Recompute the propensity groups touched by a reaction's species
    /// changes; Delta movements reach every neighbour's transcription.
    fn refresh_after(&mut self, reaction: usize, cell: usize, rates: &RateSet) {
        let (units, neighbour_wide) = UNIT_TABLE[reaction];
        if neighbour_wide {
            for idx in 0..self.neigh.row(cell).len() {
                let target = self.neigh.row(cell)[idx];
                for &unit in units {
                    self.apply_unit(unit, target, rates);
                }
            }
        } else {
            for &unit in units {
                self.apply_unit(unit, cell, rates);
            }
        }
    }

    fn refresh_all(&mut self, rates: &RateSet) {
        for cell in 0..self.cells() {
            for &unit in &ALL_UNITS {
                self.apply_unit(unit, cell, rates);
            }
        }
    }

    // -------------------------------------------------------------------------
    // NEXT-REACTION METHOD
    // -------------------------------------------------------------------------

    /// One exact step. Returns `false` when nothing can ever fire again.
    fn exact_step(
        &mut self,
        rates: &RateSet,
        ctx: &mut RunContext,
        t: &mut f64,
        stats: &mut RunStats,
    ) -> bool {
        let cells = self.cells();
        let mut delta = f64::INFINITY;
        let mut choice = None;

        for i in 0..cells {
            for k in 0..REACTIONS {
                let a = self.a[[i, k]];
                if a != 0.0 {
                    let candidate = (self.pk[[i, k]] - self.tk[[i, k]]) / a;
                    if candidate < delta {
                        delta = candidate;
                        choice = Some(NrmChoice::Fire(i, k));
                    }
                }
            }
        }
        for i in 0..cells {
            for d in 0..NUM_DELAYED {
                if let Some(node) = self.queues.front(i, d) {
                    let candidate = node.ready - *t;
                    if candidate < delta {
                        delta = candidate;
                        choice = Some(NrmChoice::Complete(i, d));
                    }
                }
            }
        }

        let Some(choice) = choice else {
            return false;
        };
        *t += delta;

        // advance every internal clock by the propensity active while
        // waiting, before the event changes anything
        for i in 0..cells {
            for k in 0..REACTIONS {
                self.tk[[i, k]] += self.a[[i, k]] * delta;
            }
        }

        match choice {
            NrmChoice::Complete(i, d) => {
                self.counts[[i, DELAYED_TARGETS[d]]] += 1;
                self.queues.pop_front(i, d);
                self.refresh_after(DELAYED_REACTIONS[d], i, rates);
            }
            NrmChoice::Fire(i, k) => {
                if let Some(d) = delayed_index(k) {
                    // a delayed reaction starting: queue its completion,
                    // touch no species yet
                    let ready = *t + rates.at(DELAY_RATES[d], i);
                    self.queues.push(
                        i,
                        d,
                        QueueNode {
                            ready,
                            firings: 1,
                            span: delta,
                        },
                    );
                    stats.delayed_firings += 1;
                } else {
                    for &(j, u) in STOICHIOMETRY[k] {
                        self.counts[[i, j]] += u;
                    }
                    self.refresh_after(k, i, rates);
                }
                self.pk[[i, k]] += ctx.next_target();
            }
        }

        stats.exact_steps += 1;
        true
    }

    // -------------------------------------------------------------------------
    // ADAPTIVE TAU-LEAPING
    // -------------------------------------------------------------------------

    /// Critical reactions could exhaust a reactant within [`NCRIT`]
    /// firings; they fire at most once per leap, scheduled exponentially.
    fn classify_critical(&self) -> Vec<bool> {
        let cells = self.cells();
        let mut critical = vec![false; cells * REACTIONS];
        for i in 0..cells {
            for k in 0..REACTIONS {
                if self.a[[i, k]] <= 0.0 {
                    continue;
                }
                let mut exhaust = i64::MAX;
                let mut consumes = false;
                for &(j, u) in STOICHIOMETRY[k] {
                    if u < 0 {
                        consumes = true;
                        exhaust = exhaust.min(self.counts[[i, j]] / -u);
                    }
                }
                critical[i * REACTIONS + k] = consumes && exhaust < NCRIT;
            }
        }
        critical
    }

    /// Cao's tau candidates over the non-critical reactions. The
    /// implicit candidate leaves out association/dissociation pairs in
    /// partial equilibrium, whose net drift cancels.
    fn tau_candidates(&self, critical: &[bool]) -> (f64, f64) {
        let cells = self.cells();
        let mut tau_ex = f64::INFINITY;
        let mut tau_im = f64::INFINITY;

        for i in 0..cells {
            for j in 0..SPECIES {
                let x = self.count(i, j);
                let mut bound = EPSILON * x;
                if (species::PH1..=species::PH13).contains(&j) {
                    bound /= 2.0 + 1.0 / (x + 1.0);
                }
                let bound = bound.max(1.0);

                let mut mu_ex = 0.0;
                let mut sigma_ex = 0.0;
                let mut mu_im = 0.0;
                let mut sigma_im = 0.0;
                for k in 0..REACTIONS {
                    if critical[i * REACTIONS + k] {
                        continue;
                    }
                    let u = self.stoich[j][k] as f64;
                    if u == 0.0 {
                        continue;
                    }
                    let change = u * self.a[[i, k]];
                    mu_ex += change;
                    sigma_ex += change * u;
                    match PARTIAL_EQ_PAIR[k] {
                        None => {
                            mu_im += change;
                            sigma_im += change * u;
                        }
                        Some(pair) if pair > k => {
                            let ak = self.a[[i, k]];
                            let ap = self.a[[i, pair]];
                            let in_equilibrium = (ak - ap).abs() <= DELTA_FACTOR * ak.min(ap);
                            if !in_equilibrium {
                                let pu = self.stoich[j][pair] as f64;
                                mu_im += change + pu * ap;
                                sigma_im += change * u + pu * pu * ap;
                            }
                        }
                        Some(_) => {}
                    }
                }

                tau_ex = tau_ex.min(candidate(bound, mu_ex, sigma_ex));
                tau_im = tau_im.min(candidate(bound, mu_im, sigma_im));
            }
        }
        (tau_ex, tau_im)
    }

    /// Complete queued delayed reactions whose windows overlap the leap,
    /// drawing the completed fraction of each node binomially.
    fn drain_queues(&mut self, next_t: f64, ctx: &mut RunContext) {
        for i in 0..self.cells() {
            for d in 0..NUM_DELAYED {
                let target = DELAYED_TARGETS[d];
                let mut completed = 0i64;
                {
                    let q = self.queues.queue_mut(i, d);
                    let mut idx = 0;
                    while idx < q.len() {
                        if q[idx].ready >= next_t {
                            idx += 1;
                            continue;
                        }
                        let node = &mut q[idx];
                        let elapsed = next_t - node.ready;
                        let p = elapsed.min(node.span) / node.span;
                        let fired = ctx.binomial(node.firings, p);
                        node.firings -= fired;
                        node.span -= elapsed;
                        node.ready = next_t;
                        completed += fired as i64;
                        if node.firings == 0 {
                            let _ = q.remove(idx);
                        } else {
                            idx += 1;
                        }
                    }
                }
                self.counts[[i, target]] += completed;
            }
        }
    }

    /// Attempt one tau-leap; on a too-small candidate, disable leaping
    /// for a burst of exact steps instead.
    #[allow(clippy::too_many_arguments)]
    fn leap_step(
        &mut self,
        rates: &RateSet,
        ctx: &mut RunContext,
        t: &mut f64,
        skip_steps: &mut i64,
        last_step_explicit: &mut bool,
        stats: &mut RunStats,
    ) {
        let cells = self.cells();
        let critical = self.classify_critical();
        let (tau_ex, tau_im) = self.tau_candidates(&critical);

        let previous_explicit = *last_step_explicit;
        let mut tau1 = if tau_im > NSTIFF * tau_ex {
            *last_step_explicit = false;
            tau_im
        } else {
            *last_step_explicit = true;
            tau_ex
        };

        loop {
            if tau1 < TAU1_MULT / self.a0 {
                *skip_steps = if previous_explicit {
                    SKIP_STEPS_EXPLICIT
                } else {
                    SKIP_STEPS_IMPLICIT
                };
                stats.leap_bailouts += 1;
                return;
            }

            let a0_crit: f64 = (0..cells)
                .flat_map(|i| (0..REACTIONS).map(move |k| (i, k)))
                .filter(|&(i, k)| critical[i * REACTIONS + k])
                .map(|(i, k)| self.a[[i, k]])
                .sum();
            let tau2 = ctx.exponential(a0_crit);
            let tau = tau1.min(tau2);
            let next_t = *t + tau;

            self.drain_queues(next_t, ctx);

            // draw firings: Poisson for the non-critical ensemble, at
            // most one critical firing chosen by propensity weight
            let mut firings = vec![0u64; cells * REACTIONS];
            if tau2 <= tau1 {
                let mut chosen = None;
                let mut last_critical = None;
                let mut cumulative = 0.0;
                let threshold = ctx.uniform();
                for i in 0..cells {
                    for k in 0..REACTIONS {
                        if critical[i * REACTIONS + k] {
                            last_critical = Some((i, k));
                            if chosen.is_none() {
                                cumulative += self.a[[i, k]] / a0_crit;
                                if cumulative >= threshold {
                                    chosen = Some((i, k));
                                }
                            }
                        }
                    }
                }
                if let Some((i, k)) = chosen.or(last_critical) {
                    firings[i * REACTIONS + k] = 1;
                }
            }
            for i in 0..cells {
                for k in 0..REACTIONS {
                    if !critical[i * REACTIONS + k] {
                        firings[i * REACTIONS + k] = ctx.poisson(self.a[[i, k]] * tau);
                    }
                }
            }

            // reject the draw rather than let any count go negative
            let mut negative = false;
            'check: for i in 0..cells {
                for k in 0..REACTIONS {
                    let f = firings[i * REACTIONS + k] as i64;
                    if f == 0 {
                        continue;
                    }
                    for &(j, u) in STOICHIOMETRY[k] {
                        if u < 0 && self.counts[[i, j]] + f * u < 0 {
                            negative = true;
                            break 'check;
                        }
                    }
                }
            }
            if negative {
                tau1 /= 2.0;
                stats.leap_retries += 1;
                continue;
            }

            // queue the delayed firings, merging similar rates
            for i in 0..cells {
                for (d, &k) in DELAYED_REACTIONS.iter().enumerate() {
                    let f = firings[i * REACTIONS + k];
                    if f > 0 {
                        let ready = *t + rates.at(DELAY_RATES[d], i);
                        if self.queues.enqueue_leap(i, d, f, tau, ready) {
                            stats.merged_nodes += 1;
                        }
                        stats.delayed_firings += f;
                    }
                }
            }

            // apply the immediate firings
            for i in 0..cells {
                for k in 0..REACTIONS {
                    if delayed_index(k).is_some() {
                        continue;
                    }
                    let f = firings[i * REACTIONS + k] as i64;
                    if f != 0 {
                        for &(j, u) in STOICHIOMETRY[k] {
                            self.counts[[i, j]] += f * u;
                        }
                    }
                }
            }

            self.refresh_all(rates);
            *t = next_t;
            stats.leaps += 1;
            if !*last_step_explicit {
                stats.implicit_leaps += 1;
            }
            return;
        }
    }

    // -------------------------------------------------------------------------
    // RUN LOOP
    // -------------------------------------------------------------------------

    /// Simulate one run, optionally streaming snapshots of the chosen
    /// concentration level to `out`.
    pub fn run(
        &mut self,
        rates: &RateSet,
        ctx: &mut RunContext,
        level: usize,
        mut out: Option<&mut dyn Write>,
    ) -> Result<RunStats> {
        self.reset(rates, ctx);
        let mut stats = RunStats::default();
        let mut ring = TraceRing::new(&self.cfg, level);
        ring.snapshot(0.0, &self.counts);

        let mut t = 0.0f64;
        let mut skip_steps: i64 = if self.cfg.approximate { 0 } else { -1 };
        let mut last_step_explicit = true;

        for _ in 0..self.cfg.max_steps {
            if t >= self.cfg.minutes {
                break;
            }
            if skip_steps == 0 {
                self.leap_step(
                    rates,
                    ctx,
                    &mut t,
                    &mut skip_steps,
                    &mut last_step_explicit,
                    &mut stats,
                );
            } else {
                if skip_steps > 0 {
                    skip_steps -= 1;
                }
                if !self.exact_step(rates, ctx, &mut t, &mut stats) {
                    break;
                }
            }
            if ring.observe(t, &self.counts, &mut out)? {
                break;
            }
        }

        ring.finish(t, &self.counts, &mut out)?;
        stats.simulated_minutes = t.min(self.cfg.minutes);
        stats.her1 = std::mem::take(&mut ring.her1);
        Ok(stats)
    }
}

fn candidate(bound: f64, mu: f64, sigma: f64) -> f64 {
    let mu = mu.abs();
    let first = if mu != 0.0 { bound / mu } else { f64::INFINITY };
    let second = if sigma != 0.0 {
        bound * bound / sigma
    } else {
        f64::INFINITY
    };
    first.min(second)
}

impl Simulator for StoSimulator {
    fn simulate(
        &mut self,
        rates: &mut RateSet,
        wild: bool,
        ctx: &mut RunContext,
    ) -> std::result::Result<OscillationFeatures, SimFailure> {
        rates.reset();
        let stats = self
            .run(rates, ctx, species::MH1, None)
            .expect("trace writing disabled");
        let trace = ndarray::Array1::from_vec(stats.her1);
        Ok(oscillation_features(
            trace.view(),
            self.cfg.granularity,
            wild,
        ))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use segclock_core::NUM_RATES;

    /// Dimer-free rates: mRNA turnover and delayed translation only.
    fn simple_rates() -> RateSet {
        let mut v = vec![0.0; NUM_RATES];
        v[rate::MSH1] = 50.0;
        v[rate::MSH7] = 45.0;
        v[rate::MSH13] = 40.0;
        v[rate::MSD] = 48.0;
        v[rate::MDH1] = 0.3;
        v[rate::MDH7] = 0.3;
        v[rate::MDH13] = 0.2;
        v[rate::MDD] = 0.25;
        v[rate::PSH1] = 40.0;
        v[rate::PSH7] = 30.0;
        v[rate::PSH13] = 35.0;
        v[rate::PSD] = 30.0;
        v[rate::PDH1] = 0.3;
        v[rate::PDH7] = 0.3;
        v[rate::PDH13] = 0.3;
        v[rate::PDD] = 0.3;
        v[rate::DELAYMH1] = 10.0;
        v[rate::DELAYMH7] = 9.0;
        v[rate::DELAYMH13] = segclock_core::DELAYMH13_SENTINEL;
        v[rate::DELAYMD] = 7.0;
        v[rate::DELAYPH1] = 1.0;
        v[rate::DELAYPH7] = 1.0;
        v[rate::DELAYPH13] = 1.2;
        v[rate::DELAYPD] = 12.0;
        v[rate::CRITPH1H1] = 400.0;
        v[rate::CRITPH7H13] = 500.0;
        v[rate::CRITPD] = 400.0;
        RateSet::new(&v, 2).unwrap()
    }

    fn short_config(minutes: f64, approximate: bool) -> StoConfig {
        StoConfig {
            minutes,
            approximate,
            ..StoConfig::default()
        }
    }

    #[test]
    fn reset_seeds_the_transcription_propensities() {
        let mut sim = StoSimulator::new(short_config(1.0, false)).unwrap();
        let rates = simple_rates();
        let mut ctx = RunContext::from_seed(3);
        sim.reset(&rates, &mut ctx);
        assert_eq!(sim.a[[0, 26]], 50.0);
        assert_eq!(sim.a[[1, 28]], 45.0);
        assert_eq!(sim.a[[0, 30]], 40.0);
        assert_eq!(sim.a[[1, 32]], 48.0);
        let expected = 2.0 * (50.0 + 45.0 + 40.0 + 48.0);
        assert!((sim.propensity_sum() - expected).abs() < 1e-12);
        assert!(sim.propensity_drift() < 1e-12);
    }

    #[test]
    fn queue_merge_conserves_firings() {
        let mut queues = DelayQueues::new(1);
        // same rate merges into the tail
        assert!(!queues.enqueue_leap(0, 2, 10, 0.1, 5.0));
        assert!(queues.enqueue_leap(0, 2, 10, 0.1, 5.1));
        assert_eq!(queues.queue(0, 2).len(), 1);
        assert_eq!(queues.pending(0, 2), 20);
        // a very different rate starts a new node
        assert!(!queues.enqueue_leap(0, 2, 100, 0.1, 5.2));
        assert_eq!(queues.queue(0, 2).len(), 2);
        assert_eq!(queues.pending(0, 2), 120);
        let tail = queues.queue(0, 2).back().unwrap();
        assert!(tail.firings >= 1 && tail.span > 0.0);
    }

    #[test]
    fn queue_merge_respects_the_rate_tolerance() {
        let mut queues = DelayQueues::new(1);
        queues.enqueue_leap(0, 0, 100, 1.0, 2.0);
        // 4% away merges, 6% away does not
        assert!(queues.enqueue_leap(0, 0, 104, 1.0, 2.5));
        assert!(!queues.enqueue_leap(0, 0, 108, 1.0, 3.0));
        assert_eq!(queues.queue(0, 0).len(), 2);
    }

    #[test]
    fn critical_classification_follows_exhaustion_distance() {
        let mut sim = StoSimulator::new(short_config(1.0, true)).unwrap();
        let rates = simple_rates();
        let mut ctx = RunContext::from_seed(3);
        sim.reset(&rates, &mut ctx);

        // 5 Her1 proteins, degradation possible: reaction 1 can exhaust
        // them in 5 < NCRIT firings
        sim.counts[[0, species::PH1]] = 5;
        sim.apply_unit(Unit::Her1Protein, 0, &rates);
        let critical = sim.classify_critical();
        assert!(critical[1]); // cell 0, reaction 1
        // plenty of mRNA: its degradation is not critical
        sim.counts[[0, species::MH1]] = 500;
        sim.apply_unit(Unit::Her1Mrna, 0, &rates);
        let critical = sim.classify_critical();
        assert!(!critical[27]);
        // synthesis consumes nothing, so it is never critical
        assert!(!critical[26]);
    }

    #[test]
    fn exact_run_keeps_propensity_sum_consistent() {
        let mut sim = StoSimulator::new(short_config(1.5, false)).unwrap();
        let rates = simple_rates();
        let mut ctx = RunContext::from_seed(42);
        let stats = sim.run(&rates, &mut ctx, species::MH1, None).unwrap();

        assert!(stats.exact_steps > 0);
        assert_eq!(stats.leaps, 0);
        assert!(stats.delayed_firings > 0);
        assert!(sim.counts.iter().all(|&x| x >= 0));
        let tolerance = 1e-9 * sim.propensity_sum().max(1.0);
        assert!(
            sim.propensity_drift() <= tolerance,
            "propensity sum drifted by {}",
            sim.propensity_drift()
        );
    }

    #[test]
    fn exact_runs_are_reproducible_from_the_seed() {
        let rates = simple_rates();
        let mut sim = StoSimulator::new(short_config(1.5, false)).unwrap();

        let mut ctx = RunContext::from_seed(42);
        let a = sim.run(&rates, &mut ctx, species::MH1, None).unwrap();
        let counts_a = sim.counts.clone();

        let mut ctx = RunContext::from_seed(42);
        let b = sim.run(&rates, &mut ctx, species::MH1, None).unwrap();
        assert_eq!(a.her1, b.her1);
        assert_eq!(a.exact_steps, b.exact_steps);
        assert_eq!(counts_a, sim.counts);
    }

    #[test]
    fn snapshot_rows_follow_the_output_format() {
        let mut sim = StoSimulator::new(short_config(1.0, false)).unwrap();
        let rates = simple_rates();
        let mut ctx = RunContext::from_seed(7);
        let mut buffer: Vec<u8> = Vec::new();
        sim.run(&rates, &mut ctx, species::MH1, Some(&mut buffer as &mut dyn Write))
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let first = text.lines().next().unwrap();
        let fields: Vec<&str> = first.split('\t').collect();
        // time, one value per cell, and the trailing tab
        assert_eq!(fields.len(), 4);
        assert_eq!(fields[0].parse::<f64>().unwrap(), 0.0);
        assert_eq!(fields[3], "");
        for line in text.lines() {
            assert!(line.ends_with('\t'));
        }
    }

    #[test]
    fn her1_trace_is_sampled_at_granularity() {
        let mut sim = StoSimulator::new(short_config(2.0, false)).unwrap();
        let rates = simple_rates();
        let mut ctx = RunContext::from_seed(11);
        let stats = sim.run(&rates, &mut ctx, species::MH1, None).unwrap();
        // one initial row, ~minutes/granularity interior rows, one final
        let expected = (2.0 / sim.cfg.granularity) as usize;
        assert!(stats.her1.len() >= expected);
        assert!(stats.her1.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn leaping_activates_and_merges_under_heavy_constitutive_load() {
        let mut v = vec![0.0; NUM_RATES];
        v[rate::MSH13] = 5000.0;
        v[rate::PSH13] = 1.0;
        v[rate::DELAYPH13] = 0.01;
        v[rate::DELAYPH1] = 1.0;
        v[rate::DELAYPH7] = 1.0;
        v[rate::DELAYPD] = 1.0;
        v[rate::DELAYMH1] = 1.0;
        v[rate::DELAYMH7] = 1.0;
        v[rate::DELAYMD] = 1.0;
        v[rate::CRITPH1H1] = 1000.0;
        v[rate::CRITPH7H13] = 1000.0;
        v[rate::CRITPD] = 1000.0;
        let rates = RateSet::new(&v, 2).unwrap();

        let mut sim = StoSimulator::new(short_config(2.0, true)).unwrap();
        let mut ctx = RunContext::from_seed(42);
        let stats = sim.run(&rates, &mut ctx, species::MH13, None).unwrap();

        assert!(stats.leaps > 0, "tau-leaping never activated");
        assert!(stats.merged_nodes > 0, "id-leaping never merged");
        assert!(
            sim.queues.total_nodes() as u64 + stats.merged_nodes <= stats.delayed_firings,
            "merging should keep node count below discrete firings"
        );
        assert!(sim.counts.iter().all(|&x| x >= 0));
        let tolerance = 1e-6 * sim.propensity_sum().max(1.0);
        assert!(sim.propensity_drift() <= tolerance);
    }

    #[test]
    fn approximate_run_with_biological_rates_completes() {
        let mut sim = StoSimulator::new(short_config(1.5, true)).unwrap();
        let rates = simple_rates();
        let mut ctx = RunContext::from_seed(42);
        let stats = sim.run(&rates, &mut ctx, species::MH1, None).unwrap();
        assert!(stats.simulated_minutes >= 1.5 || stats.exact_steps + stats.leaps > 0);
        assert!(sim.counts.iter().all(|&x| x >= 0));
    }

    #[test]
    fn drained_nodes_complete_fully_once_their_span_passes() {
        let mut sim = StoSimulator::new(short_config(1.0, true)).unwrap();
        let rates = simple_rates();
        let mut ctx = RunContext::from_seed(5);
        sim.reset(&rates, &mut ctx);
        sim.queues.push(
            0,
            0,
            QueueNode {
                ready: 0.2,
                firings: 7,
                span: 0.1,
            },
        );
        // the drain horizon is past ready + span: every firing completes
        sim.drain_queues(0.5, &mut ctx);
        assert_eq!(sim.counts[[0, species::PH1]], 7);
        assert!(sim.queues.queue(0, 0).is_empty());
    }

    #[test]
    fn partial_drain_advances_the_node_window() {
        let mut sim = StoSimulator::new(short_config(1.0, true)).unwrap();
        let rates = simple_rates();
        let mut ctx = RunContext::from_seed(5);
        sim.reset(&rates, &mut ctx);
        sim.queues.push(
            0,
            0,
            QueueNode {
                ready: 0.2,
                firings: 1000,
                span: 1.0,
            },
        );
        sim.drain_queues(0.7, &mut ctx);
        let completed = sim.counts[[0, species::PH1]];
        assert!(completed > 0, "no completions in half the span");
        match sim.queues.front(0, 0) {
            Some(node) => {
                assert_eq!(node.ready, 0.7);
                assert_eq!(node.firings + completed as u64, 1000);
                assert!(node.span > 0.0);
            }
            None => assert_eq!(completed, 1000),
        }
    }
}
