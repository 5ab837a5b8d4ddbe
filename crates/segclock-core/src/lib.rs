//! # Segclock Core
//!
//! Shared reaction model for the zebrafish segmentation clock.
//!
//! The segmentation clock is a small gene-regulatory network in which the
//! her1/her7 genes repress their own transcription through dimers of their
//! protein products, while Delta signalling couples the oscillations of
//! neighbouring cells. This crate holds everything the deterministic and
//! stochastic solvers have in common:
//!
//! 1. **Species and reactions**: the 14 molecular species and the fixed
//!    34-reaction network, including the seven delayed reactions
//! 2. **Rates**: the 45-entry parameter vector, spatial gradients, random
//!    parameter generation, and CSV parsing
//! 3. **Topology**: two-cell, wrapped chain, and hexagonal toroidal tissues
//! 4. **Features**: period / amplitude / peak-to-trough extraction from an
//!    mRNA trace, and the wild-type and mutant acceptance predicates
//! 5. **Run context**: seeded RNG and the sampling distributions both
//!    solvers draw from

use ndarray::ArrayView1;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Binomial, Distribution, Exp, Poisson};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// ERRORS
// =============================================================================

/// Errors that are fatal to the process (configuration, I/O, parsing).
#[derive(Debug, Error)]
pub enum ClockError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Read error: {0}")]
    Read(String),

    #[error("Resource error: {0}")]
    Resource(String),
}

pub type Result<T> = std::result::Result<T, ClockError>;

/// Failures that abort a single simulation but not the whole sweep.
///
/// The parameter-sweep driver treats these as "reject this set and move
/// on", in contrast to [`ClockError`] which ends the process.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum SimFailure {
    #[error("species {species} in cell {cell} went negative at t = {time:.3} min")]
    NegativeConcentration {
        species: usize,
        cell: usize,
        time: f64,
    },

    #[error("propensity of reaction {reaction} reached {value:.4e}, above the cap {cap:.4e}")]
    PropensityCap {
        reaction: usize,
        value: f64,
        cap: f64,
    },
}

// =============================================================================
// SPECIES
// =============================================================================

/// Number of molecular species in the network.
pub const SPECIES: usize = 14;

/// Species indices. These are contractual: the stochastic update tables
/// and the output level selection are keyed by them.
pub mod species {
    pub const MH1: usize = 0; // her1 mRNA
    pub const MH7: usize = 1; // her7 mRNA
    pub const MH13: usize = 2; // her13 mRNA
    pub const MD: usize = 3; // delta mRNA
    pub const PH1: usize = 4; // Her1 protein
    pub const PH7: usize = 5; // Her7 protein
    pub const PH13: usize = 6; // Her13 protein
    pub const PD: usize = 7; // Delta protein
    pub const PH11: usize = 8; // Her1:Her1 dimer
    pub const PH17: usize = 9; // Her1:Her7 dimer
    pub const PH113: usize = 10; // Her1:Her13 dimer
    pub const PH77: usize = 11; // Her7:Her7 dimer
    pub const PH713: usize = 12; // Her7:Her13 dimer
    pub const PH1313: usize = 13; // Her13:Her13 dimer
}

/// Concentration level names accepted on the command line, in species order.
pub const LEVEL_NAMES: [&str; SPECIES] = [
    "her1",
    "her7",
    "her13",
    "delta",
    "Her1",
    "Her7",
    "Her13",
    "Delta",
    "Her1Her1",
    "Her1Her7",
    "Her1Her13",
    "Her7Her7",
    "Her7Her13",
    "Her13Her13",
];

/// Look up a species index by its level name.
pub fn level_index(name: &str) -> Option<usize> {
    LEVEL_NAMES.iter().position(|&n| n == name)
}

// =============================================================================
// RATE SCHEMA
// =============================================================================

/// Number of entries in a parameter vector.
pub const NUM_RATES: usize = 45;

/// Rate indices in the canonical order used by parameter files, the
/// accepted-set CSV, and the random generator.
pub mod rate {
    // mRNA synthesis
    pub const MSH1: usize = 0;
    pub const MSH7: usize = 1;
    pub const MSH13: usize = 2;
    pub const MSD: usize = 3;

    // mRNA degradation
    pub const MDH1: usize = 4;
    pub const MDH7: usize = 5;
    pub const MDH13: usize = 6;
    pub const MDD: usize = 7;

    // protein synthesis
    pub const PSH1: usize = 8;
    pub const PSH7: usize = 9;
    pub const PSH13: usize = 10;
    pub const PSD: usize = 11;

    // protein degradation
    pub const PDH1: usize = 12;
    pub const PDH7: usize = 13;
    pub const PDH13: usize = 14;
    pub const PDD: usize = 15;

    // dimer association
    pub const DAH1H1: usize = 16;
    pub const DAH1H7: usize = 17;
    pub const DAH1H13: usize = 18;
    pub const DAH7H7: usize = 19;
    pub const DAH7H13: usize = 20;
    pub const DAH13H13: usize = 21;

    // dimer dissociation
    pub const DDIH1H1: usize = 22;
    pub const DDIH1H7: usize = 23;
    pub const DDIH1H13: usize = 24;
    pub const DDIH7H7: usize = 25;
    pub const DDIH7H13: usize = 26;
    pub const DDIH13H13: usize = 27;

    // dimer degradation
    pub const DDGH1H1: usize = 28;
    pub const DDGH1H7: usize = 29;
    pub const DDGH1H13: usize = 30;
    pub const DDGH7H7: usize = 31;
    pub const DDGH7H13: usize = 32;
    pub const DDGH13H13: usize = 33;

    // mRNA transcription delays
    pub const DELAYMH1: usize = 34;
    pub const DELAYMH7: usize = 35;
    pub const DELAYMH13: usize = 36;
    pub const DELAYMD: usize = 37;

    // protein translation delays
    pub const DELAYPH1: usize = 38;
    pub const DELAYPH7: usize = 39;
    pub const DELAYPH13: usize = 40;
    pub const DELAYPD: usize = 41;

    // critical molecule counts
    pub const CRITPH1H1: usize = 42;
    pub const CRITPH7H13: usize = 43;
    pub const CRITPD: usize = 44;
}

/// her13 transcription carries no delay; the slot holds this sentinel and
/// is never read by either solver.
pub const DELAYMH13_SENTINEL: f64 = -1.0;

// =============================================================================
// REACTION NETWORK
// =============================================================================

/// Number of reactions in the stochastic network.
pub const REACTIONS: usize = 34;

/// Number of delayed reactions.
pub const NUM_DELAYED: usize = 7;

/// Reaction indices of the delayed reactions: the four protein
/// translations and the three regulated mRNA transcriptions.
pub const DELAYED_REACTIONS: [usize; NUM_DELAYED] = [0, 8, 14, 24, 26, 28, 32];

/// The single species each delayed reaction produces on completion.
pub const DELAYED_TARGETS: [usize; NUM_DELAYED] = [
    species::PH1,
    species::PH7,
    species::PH13,
    species::PD,
    species::MH1,
    species::MH7,
    species::MD,
];

/// Rate index holding each delayed reaction's delay, in minutes.
pub const DELAY_RATES: [usize; NUM_DELAYED] = [
    rate::DELAYPH1,
    rate::DELAYPH7,
    rate::DELAYPH13,
    rate::DELAYPD,
    rate::DELAYMH1,
    rate::DELAYMH7,
    rate::DELAYMD,
];

/// Stoichiometry of each reaction as `(species, change)` pairs.
///
/// For delayed reactions the listed change is applied on *completion*,
/// never on firing. Reaction order: per mRNA a delayed synthesis and an
/// immediate degradation, per monomer association/dissociation with each
/// partner, dimer degradations, and the Delta-coupled transcriptions.
pub static STOICHIOMETRY: [&[(usize, i64)]; REACTIONS] = [
    &[(species::PH1, 1)],                                      // 0: Her1 translation (delayed)
    &[(species::PH1, -1)],                                     // 1: Her1 degradation
    &[(species::PH1, -2), (species::PH11, 1)],                 // 2: Her1+Her1 association
    &[(species::PH1, 2), (species::PH11, -1)],                 // 3: Her1:Her1 dissociation
    &[(species::PH1, -1), (species::PH7, -1), (species::PH17, 1)], // 4
    &[(species::PH1, 1), (species::PH7, 1), (species::PH17, -1)], // 5
    &[(species::PH1, -1), (species::PH13, -1), (species::PH113, 1)], // 6
    &[(species::PH1, 1), (species::PH13, 1), (species::PH113, -1)], // 7
    &[(species::PH7, 1)],                                      // 8: Her7 translation (delayed)
    &[(species::PH7, -1)],                                     // 9: Her7 degradation
    &[(species::PH7, -2), (species::PH77, 1)],                 // 10
    &[(species::PH7, 2), (species::PH77, -1)],                 // 11
    &[(species::PH7, -1), (species::PH13, -1), (species::PH713, 1)], // 12
    &[(species::PH7, 1), (species::PH13, 1), (species::PH713, -1)], // 13
    &[(species::PH13, 1)],                                     // 14: Her13 translation (delayed)
    &[(species::PH13, -1)],                                    // 15: Her13 degradation
    &[(species::PH13, -2), (species::PH1313, 1)],              // 16
    &[(species::PH13, 2), (species::PH1313, -1)],              // 17
    &[(species::PH11, -1)],                                    // 18: Her1:Her1 degradation
    &[(species::PH17, -1)],                                    // 19
    &[(species::PH113, -1)],                                   // 20
    &[(species::PH77, -1)],                                    // 21
    &[(species::PH713, -1)],                                   // 22
    &[(species::PH1313, -1)],                                  // 23
    &[(species::PD, 1)],                                       // 24: Delta translation (delayed)
    &[(species::PD, -1)],                                      // 25: Delta degradation
    &[(species::MH1, 1)],                                      // 26: her1 transcription (delayed)
    &[(species::MH1, -1)],                                     // 27: her1 mRNA degradation
    &[(species::MH7, 1)],                                      // 28: her7 transcription (delayed)
    &[(species::MH7, -1)],                                     // 29
    &[(species::MH13, 1)],                                     // 30: her13 transcription (constitutive)
    &[(species::MH13, -1)],                                    // 31
    &[(species::MD, 1)],                                       // 32: delta transcription (delayed)
    &[(species::MD, -1)],                                      // 33
];

/// Partial-equilibrium partner of each reaction: every dimer association
/// is paired with its dissociation and vice versa.
pub const PARTIAL_EQ_PAIR: [Option<usize>; REACTIONS] = [
    None,
    None,
    Some(3),
    Some(2),
    Some(5),
    Some(4),
    Some(7),
    Some(6),
    None,
    None,
    Some(11),
    Some(10),
    Some(13),
    Some(12),
    None,
    None,
    Some(17),
    Some(16),
    None,
    None,
    None,
    None,
    None,
    None,
    None,
    None,
    None,
    None,
    None,
    None,
    None,
    None,
    None,
    None,
];

/// Position of a reaction in [`DELAYED_REACTIONS`], if it is delayed.
pub fn delayed_index(reaction: usize) -> Option<usize> {
    DELAYED_REACTIONS.iter().position(|&r| r == reaction)
}

/// Hill-type transcription rate for her1 and her7: repressed by the
/// Her1:Her1 and Her7:Her13 dimers, activated by neighbouring Delta.
///
/// `x11`, `x713`, and `y` are the dimer and Delta inputs already divided
/// by their critical counts.
pub fn hill_her(ms: f64, x11: f64, x713: f64, y: f64) -> f64 {
    ms * (1.0 + y) / (1.0 + y + x11 * x11 + x713 * x713)
}

/// Hill-type transcription rate for delta: repression only.
pub fn hill_delta(ms: f64, x11: f64, x713: f64) -> f64 {
    ms / (1.0 + x11 * x11 + x713 * x713)
}

// =============================================================================
// RATES AND GRADIENTS
// =============================================================================

/// A parameter vector with optional spatial gradients.
///
/// The base vector holds the 45 canonical rates. A gradient attaches a
/// per-column factor row (1.0 = neutral) to a rate; the current vector is
/// `base * factor[position]` for whichever position was last refreshed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateSet {
    base: Vec<f64>,
    current: Vec<f64>,
    factors: Vec<Option<Vec<f64>>>,
    width: usize,
}

impl RateSet {
    /// Build a rate set from a canonical-order slice of 45 values.
    pub fn new(values: &[f64], width: usize) -> Result<Self> {
        if values.len() != NUM_RATES {
            return Err(ClockError::Parse(format!(
                "expected {} rates, got {}",
                NUM_RATES,
                values.len()
            )));
        }
        Ok(Self {
            base: values.to_vec(),
            current: values.to_vec(),
            factors: vec![None; NUM_RATES],
            width,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// The base (unscaled) value of a rate.
    pub fn base(&self, idx: usize) -> f64 {
        self.base[idx]
    }

    /// The base vector in canonical order, for echoing accepted sets.
    pub fn base_values(&self) -> &[f64] {
        &self.base
    }

    /// Overwrite a base rate. The current value follows immediately; a
    /// later [`refresh`](Self::refresh) re-applies any gradient.
    pub fn set_base(&mut self, idx: usize, value: f64) {
        self.base[idx] = value;
        self.current[idx] = value;
    }

    /// The current (position-scaled) value of a rate.
    pub fn current(&self, idx: usize) -> f64 {
        self.current[idx]
    }

    /// Reset the current vector to the base vector.
    pub fn reset(&mut self) {
        self.current.copy_from_slice(&self.base);
    }

    /// Re-scale every gradient-bearing rate for the given column.
    pub fn refresh(&mut self, position: usize) {
        let pos = position.min(self.width.saturating_sub(1));
        for i in 0..NUM_RATES {
            if let Some(row) = &self.factors[i] {
                self.current[i] = self.base[i] * row[pos];
            }
        }
    }

    /// The value of a rate in the column a given cell occupies.
    pub fn at(&self, idx: usize, cell: usize) -> f64 {
        match &self.factors[idx] {
            Some(row) => self.base[idx] * row[cell % self.width],
            None => self.base[idx],
        }
    }

    pub fn has_gradients(&self) -> bool {
        self.factors.iter().any(|f| f.is_some())
    }

    /// Parse a gradients description and attach the factor rows.
    ///
    /// Each line is `<rate_index> (<pos> <percent>) (<pos> <percent>)...`
    /// with 100 = neutral. Position 0 is an implicit neutral anchor,
    /// intermediate positions interpolate linearly, and the last anchor's
    /// value carries to the right edge.
    pub fn apply_gradient_text(&mut self, text: &str) -> Result<()> {
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (head, rest) = line.split_once(char::is_whitespace).ok_or_else(|| {
                ClockError::Config("gradient record is missing its anchor list".into())
            })?;
            let idx: usize = head.parse().map_err(|_| {
                ClockError::Config(format!("invalid gradient rate index `{head}`"))
            })?;
            if idx >= NUM_RATES {
                return Err(ClockError::Config(format!(
                    "gradient rate index {idx} is outside the valid range"
                )));
            }

            let mut row = vec![1.0; self.width];
            let mut last_anchor = 0usize;
            let mut any = false;
            let mut rest = rest.trim_start();
            while !rest.is_empty() {
                let open = rest.find('(').ok_or_else(|| {
                    ClockError::Config("gradient anchors must be parenthesised pairs".into())
                })?;
                let close = rest[open..].find(')').ok_or_else(|| {
                    ClockError::Config("unterminated gradient anchor".into())
                })? + open;
                let mut fields = rest[open + 1..close].split_whitespace();
                let pos: usize = fields
                    .next()
                    .and_then(|t| t.parse().ok())
                    .ok_or_else(|| ClockError::Config("invalid gradient position".into()))?;
                let percent: f64 = fields
                    .next()
                    .and_then(|t| t.parse().ok())
                    .ok_or_else(|| ClockError::Config("invalid gradient factor".into()))?;
                if pos >= self.width {
                    return Err(ClockError::Config(format!(
                        "gradient position {pos} is outside the tissue width {}",
                        self.width
                    )));
                }
                if percent < 0.0 {
                    return Err(ClockError::Config(
                        "gradient factors must be non-negative".into(),
                    ));
                }

                let factor = percent / 100.0;
                let start = row[last_anchor];
                for j in last_anchor + 1..pos {
                    row[j] = interpolate(j, last_anchor, pos, start, factor);
                }
                row[pos] = factor;
                last_anchor = pos;
                any = true;
                rest = rest[close + 1..].trim_start();
            }
            if !any {
                return Err(ClockError::Config(format!(
                    "gradient record for rate {idx} has no anchors"
                )));
            }
            // last anchor carries to the right edge
            for j in last_anchor + 1..self.width {
                row[j] = row[last_anchor];
            }
            self.factors[idx] = Some(row);
        }
        Ok(())
    }
}

fn interpolate(x: usize, x0: usize, x1: usize, y0: f64, y1: f64) -> f64 {
    y0 + (y1 - y0) * (x - x0) as f64 / (x1 - x0) as f64
}

// =============================================================================
// PARAMETER SETS
// =============================================================================

/// Parse one comma-separated parameter line into canonical order.
pub fn parse_parameter_line(line: &str) -> Result<Vec<f64>> {
    let values: std::result::Result<Vec<f64>, _> =
        line.split(',').map(|t| t.trim().parse::<f64>()).collect();
    let values =
        values.map_err(|e| ClockError::Parse(format!("invalid parameter value: {e}")))?;
    if values.len() != NUM_RATES {
        return Err(ClockError::Parse(format!(
            "parameter set has {} values, expected {}",
            values.len(),
            NUM_RATES
        )));
    }
    Ok(values)
}

/// Draw a random parameter set from the documented biological ranges.
///
/// Values land in canonical order; the draw order follows the original
/// screen so a fixed seed walks the ranges the same way.
pub fn generate_set(ctx: &mut RunContext) -> Vec<f64> {
    let mut items = vec![0.0; NUM_RATES];
    {
        let mut draw = |lo: f64, hi: f64| ctx.rng.gen_range(lo..=hi);

        // protein synthesis
        items[rate::PSH1] = draw(30.0, 60.0);
        items[rate::PSH7] = draw(10.0, 57.0);
        items[rate::PSH13] = draw(27.0, 57.0);
        items[rate::PSD] = draw(22.0, 59.0);

        // protein degradation
        items[rate::PDH1] = draw(0.12, 0.37);
        items[rate::PDH7] = draw(0.11, 0.4);
        items[rate::PDH13] = draw(0.11, 0.39);
        items[rate::PDD] = draw(0.15, 0.38);

        // mRNA synthesis
        items[rate::MSH1] = draw(32.0, 63.0);
        items[rate::MSH7] = draw(34.0, 62.0);
        items[rate::MSH13] = draw(31.0, 62.0);
        items[rate::MSD] = draw(31.0, 65.0);

        // mRNA degradation
        items[rate::MDH1] = draw(0.2, 0.38);
        items[rate::MDH7] = draw(0.28, 0.4);
        items[rate::MDH13] = draw(0.13, 0.39);
        items[rate::MDD] = draw(0.12, 0.39);

        // dimer degradation
        items[rate::DDGH1H1] = draw(0.25, 0.4);
        items[rate::DDGH1H7] = draw(0.16, 0.34);
        items[rate::DDGH1H13] = draw(0.1, 0.36);
        items[rate::DDGH7H7] = draw(0.12, 0.4);
        items[rate::DDGH7H13] = draw(0.26, 0.4);
        items[rate::DDGH13H13] = draw(0.11, 0.34);

        // transcription delays; her13 transcription is constitutive
        items[rate::DELAYMH1] = draw(8.8, 12.0);
        items[rate::DELAYMH7] = draw(8.6, 11.6);
        items[rate::DELAYMH13] = DELAYMH13_SENTINEL;
        items[rate::DELAYMD] = draw(6.1, 12.0);

        // translation delays
        items[rate::DELAYPH1] = draw(0.8, 2.0);
        items[rate::DELAYPH7] = draw(0.4, 1.8);
        items[rate::DELAYPH13] = draw(0.6, 1.8);
        items[rate::DELAYPD] = draw(10.0, 18.0);

        // dimer association and dissociation, interleaved per dimer
        items[rate::DAH1H1] = draw(0.005, 0.03);
        items[rate::DDIH1H1] = draw(0.06, 0.3);
        items[rate::DAH1H7] = draw(0.0006, 0.009);
        items[rate::DDIH1H7] = draw(0.03, 0.28);
        items[rate::DAH1H13] = draw(0.006, 0.029);
        items[rate::DDIH1H13] = draw(0.004, 0.18);
        items[rate::DAH7H7] = draw(0.002, 0.024);
        items[rate::DDIH7H7] = draw(0.07, 0.3);
        items[rate::DAH7H13] = draw(0.007, 0.03);
        items[rate::DDIH7H13] = draw(0.03, 0.3);
        items[rate::DAH13H13] = draw(0.001, 0.016);
        items[rate::DDIH13H13] = draw(0.05, 0.29);

        // critical molecule counts
        items[rate::CRITPH1H1] = draw(160.0, 720.0);
        items[rate::CRITPH7H13] = draw(200.0, 920.0);
        items[rate::CRITPD] = draw(240.0, 720.0);
    }
    items
}

// =============================================================================
// TISSUE TOPOLOGY
// =============================================================================

/// The three supported tissue shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tissue {
    /// Two coupled cells (2x1).
    TwoCell,
    /// Horizontally wrapped chain (Wx1, W >= 3).
    Chain,
    /// Hexagonal toroidal tissue (WxH, both even, both >= 4).
    Hexagonal,
}

/// Pre-computed neighbour map. Row `i` lists cell `i` first, followed by
/// its neighbours.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Neighbourhood {
    pub tissue: Tissue,
    pub width: usize,
    pub height: usize,
    map: Vec<Vec<usize>>,
}

/// Validate tissue dimensions.
///
/// Two-cell systems are 2x1; chains are Wx1 with W >= 3; hexagonal
/// tissues require both dimensions even and at least 4.
pub fn validate_size(width: usize, height: usize) -> Result<Tissue> {
    let invalid = (height == 1 && width < 2)
        || height == 2
        || height == 3
        || (height > 3 && (width < 4 || height % 2 == 1 || width % 2 == 1));
    if invalid {
        return Err(ClockError::Config(format!(
            "invalid tissue size {width}x{height}: use 2x1, Wx1 with W >= 3, \
             or WxH with both even and >= 4"
        )));
    }
    Ok(if height == 1 {
        if width == 2 {
            Tissue::TwoCell
        } else {
            Tissue::Chain
        }
    } else {
        Tissue::Hexagonal
    })
}

impl Neighbourhood {
    /// Build the neighbour map for a validated tissue size.
    ///
    /// Chains wrap horizontally; hexagonal tissues wrap on both axes with
    /// the column offsets alternating by row parity, like a honeycomb.
    pub fn new(width: usize, height: usize) -> Result<Self> {
        let tissue = validate_size(width, height)?;
        let cells = width * height;
        let mut map = Vec::with_capacity(cells);
        match tissue {
            Tissue::TwoCell => {
                for i in 0..2 {
                    map.push(vec![i, 1 - i]);
                }
            }
            Tissue::Chain => {
                for i in 0..cells {
                    let left = (i + width - 1) % width;
                    let right = (i + 1) % width;
                    map.push(vec![i, left, right]);
                }
            }
            Tissue::Hexagonal => {
                // row deltas are shared; column deltas depend on row parity
                const DR: [isize; 6] = [0, 0, -1, -1, 1, 1];
                const DC_EVEN: [isize; 6] = [-1, 1, -1, 0, -1, 0];
                const DC_ODD: [isize; 6] = [-1, 1, 0, 1, 0, 1];
                for i in 0..cells {
                    let row = i / width;
                    let col = i % width;
                    let dc = if row % 2 == 0 { &DC_EVEN } else { &DC_ODD };
                    let mut entry = vec![i];
                    for k in 0..6 {
                        let r = wrap(row as isize + DR[k], height);
                        let c = wrap(col as isize + dc[k], width);
                        entry.push(r * width + c);
                    }
                    map.push(entry);
                }
            }
        }
        Ok(Self {
            tissue,
            width,
            height,
            map,
        })
    }

    pub fn cells(&self) -> usize {
        self.map.len()
    }

    /// Neighbour count including the cell itself (2, 3, or 7).
    pub fn degree(&self) -> usize {
        self.map[0].len()
    }

    /// Cell `i` followed by its neighbours.
    pub fn row(&self, i: usize) -> &[usize] {
        &self.map[i]
    }

    /// The neighbours of cell `i`, excluding the cell itself.
    pub fn neighbours(&self, i: usize) -> &[usize] {
        &self.map[i][1..]
    }
}

fn wrap(x: isize, end: usize) -> usize {
    let end = end as isize;
    (((x % end) + end) % end) as usize
}

// =============================================================================
// RUN CONTEXT
// =============================================================================

/// Per-run mutable state: the seed and the PRNG both solvers draw from.
///
/// Keeping the RNG here (rather than in a global) makes a run a pure
/// function of its inputs plus this context, so a persisted seed
/// reproduces a run bit for bit.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub seed: u64,
    pub rng: SmallRng,
}

impl RunContext {
    pub fn from_seed(seed: u64) -> Self {
        Self {
            seed,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Seed from wall time and the process id, for unseeded runs.
    pub fn from_entropy() -> Self {
        let secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(1);
        let pid = std::process::id() as u64;
        let seed = (secs.wrapping_mul(181)).wrapping_mul((pid.wrapping_sub(83)).wrapping_mul(359))
            % 805306457;
        Self::from_seed(seed.max(1))
    }

    /// Uniform draw in (0, 1].
    pub fn uniform(&mut self) -> f64 {
        1.0 - self.rng.gen::<f64>()
    }

    /// Anderson's internal-time increment, `log(1/U)`.
    pub fn next_target(&mut self) -> f64 {
        (1.0 / self.uniform()).ln()
    }

    /// Poisson draw; zero mean yields zero firings.
    pub fn poisson(&mut self, mean: f64) -> u64 {
        if mean <= 0.0 {
            return 0;
        }
        Poisson::new(mean).expect("positive mean").sample(&mut self.rng) as u64
    }

    /// Binomial draw with the probability clamped into [0, 1].
    pub fn binomial(&mut self, n: u64, p: f64) -> u64 {
        if n == 0 {
            return 0;
        }
        let p = p.clamp(0.0, 1.0);
        Binomial::new(n, p).expect("valid probability").sample(&mut self.rng)
    }

    /// Exponential waiting time for the given rate; infinite if the rate
    /// vanishes.
    pub fn exponential(&mut self, lambda: f64) -> f64 {
        if lambda <= 0.0 {
            return f64::INFINITY;
        }
        Exp::new(lambda).expect("positive rate").sample(&mut self.rng)
    }
}

// =============================================================================
// OSCILLATION FEATURES
// =============================================================================

/// Oscillation features of a her1 mRNA trace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OscillationFeatures {
    /// Time between the last two peaks, in minutes.
    pub period: f64,
    /// Last peak minus last trough.
    pub amplitude: f64,
    /// Last peak over last trough (troughs below 1 count as 1).
    pub peak_to_trough: f64,
    /// Same ratio over the first half of the trace; only computed for the
    /// wild type, to check that oscillations are sustained.
    pub mid_peak_to_trough: f64,
}

/// Extract oscillation features from a single-cell trace.
///
/// Peaks and troughs are strict local extrema over the interior of the
/// trace. The last peak and trough are used because the first few cycles
/// can be transient.
pub fn oscillation_features(trace: ArrayView1<f64>, eps: f64, wild: bool) -> OscillationFeatures {
    let n = trace.len();
    let mut t_peak_last = 0.0;
    let mut t_peak_prev = 0.0;
    let mut v_peak_last = 0.0;
    let mut v_trough_last = 0.0;

    for i in 1..n.saturating_sub(1) {
        if trace[i + 1] < trace[i] && trace[i] > trace[i - 1] {
            t_peak_prev = t_peak_last;
            t_peak_last = i as f64 * eps;
            v_peak_last = trace[i];
        }
        if trace[i + 1] > trace[i] && trace[i] < trace[i - 1] {
            v_trough_last = trace[i];
        }
    }

    let mut features = OscillationFeatures {
        period: t_peak_last - t_peak_prev,
        amplitude: v_peak_last - v_trough_last,
        peak_to_trough: v_peak_last / v_trough_last.max(1.0),
        mid_peak_to_trough: 0.0,
    };

    if wild {
        let mut v_peak_mid = 0.0;
        let mut v_trough_mid = 0.0;
        for i in 2..n / 2 {
            if trace[i + 1] < trace[i] && trace[i] > trace[i - 1] {
                v_peak_mid = trace[i];
            }
            if trace[i + 1] > trace[i] && trace[i] < trace[i - 1] {
                v_trough_mid = trace[i];
            }
        }
        features.mid_peak_to_trough = v_peak_mid / v_trough_mid.max(1.0);
    }

    features
}

// =============================================================================
// MUTANTS AND ACCEPTANCE
// =============================================================================

/// The wild type and the five knockout mutants, in battery order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutant {
    Wild,
    Delta,
    Her13,
    Her1,
    Her7,
    Her713,
}

/// Simulation order of the battery; the wild type runs first so the
/// mutant predicates can compare against its period.
pub const MUTANT_SEQUENCE: [Mutant; 6] = [
    Mutant::Wild,
    Mutant::Delta,
    Mutant::Her13,
    Mutant::Her1,
    Mutant::Her7,
    Mutant::Her713,
];

impl Mutant {
    pub fn label(&self) -> &'static str {
        match self {
            Mutant::Wild => "wt",
            Mutant::Delta => "delta",
            Mutant::Her13 => "her13",
            Mutant::Her1 => "her1",
            Mutant::Her7 => "her7",
            Mutant::Her713 => "her713",
        }
    }

    /// Synthesis rates zeroed to produce this mutant.
    pub fn knocked_out(&self) -> &'static [usize] {
        match self {
            Mutant::Wild => &[],
            Mutant::Delta => &[rate::PSD],
            Mutant::Her13 => &[rate::PSH13],
            Mutant::Her1 => &[rate::PSH1],
            Mutant::Her7 => &[rate::PSH7],
            Mutant::Her713 => &[rate::PSH7, rate::PSH13],
        }
    }

    /// Acceptance predicate for this battery stage.
    ///
    /// The wild type must oscillate in a sustained way; each mutant's
    /// period must sit in a fixed band relative to the wild-type period.
    pub fn satisfied(&self, features: &OscillationFeatures, wild: &OscillationFeatures) -> bool {
        match self {
            Mutant::Wild => {
                features.mid_peak_to_trough >= 1.5
                    && features.peak_to_trough >= 1.5
                    && features.mid_peak_to_trough / features.peak_to_trough <= 1.5
            }
            Mutant::Her1 | Mutant::Her7 => period_ratio_in(features, wild, 0.97, 1.03),
            Mutant::Her13 | Mutant::Her713 => period_ratio_in(features, wild, 1.03, 1.09),
            Mutant::Delta => period_ratio_in(features, wild, 1.04, 1.30),
        }
    }
}

fn period_ratio_in(
    features: &OscillationFeatures,
    wild: &OscillationFeatures,
    lo: f64,
    hi: f64,
) -> bool {
    let ratio = features.period / wild.period;
    ratio > lo && ratio < hi
}

// =============================================================================
// SIMULATOR CAPABILITY AND MUTANT BATTERY
// =============================================================================

/// A simulation core the mutant battery can drive.
///
/// Implementations clear their own state, run to completion or abort, and
/// report the oscillation features of her1 mRNA in cell 0. `wild`
/// requests the additional sustained-oscillation scan.
pub trait Simulator {
    fn simulate(
        &mut self,
        rates: &mut RateSet,
        wild: bool,
        ctx: &mut RunContext,
    ) -> std::result::Result<OscillationFeatures, SimFailure>;
}

/// Why a parameter set was rejected.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RejectCause {
    /// The simulation aborted (negativity or propensity cap).
    Aborted(SimFailure),
    /// The stage's acceptance predicate failed.
    Predicate,
}

/// Outcome of a full battery over one parameter set.
#[derive(Debug, Clone, PartialEq)]
pub enum BatteryVerdict {
    /// All six stages passed; features in [`MUTANT_SEQUENCE`] order.
    Accepted(Vec<OscillationFeatures>),
    Rejected {
        stage: Mutant,
        cause: RejectCause,
    },
}

impl BatteryVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, BatteryVerdict::Accepted(_))
    }
}

/// Run the wild type and the five mutants against one parameter set.
///
/// Each stage zeroes its synthesis rates, simulates, and restores the
/// rates before the verdict is taken, so a rejection never leaks a
/// mutated vector back to the caller. `observe` is called after every
/// simulation (even an aborted one), which is where trace writing hooks
/// in.
pub fn run_battery<S, F>(
    sim: &mut S,
    rates: &mut RateSet,
    ctx: &mut RunContext,
    mut observe: F,
) -> BatteryVerdict
where
    S: Simulator,
    F: FnMut(Mutant, &S),
{
    let mut wild_features = OscillationFeatures::default();
    let mut collected = Vec::with_capacity(MUTANT_SEQUENCE.len());

    for mutant in MUTANT_SEQUENCE {
        let saved: Vec<(usize, f64)> = mutant
            .knocked_out()
            .iter()
            .map(|&i| (i, rates.base(i)))
            .collect();
        for &(i, _) in &saved {
            rates.set_base(i, 0.0);
        }

        let outcome = sim.simulate(rates, mutant == Mutant::Wild, ctx);
        observe(mutant, sim);

        for &(i, v) in &saved {
            rates.set_base(i, v);
        }

        let features = match outcome {
            Ok(features) => features,
            Err(failure) => {
                return BatteryVerdict::Rejected {
                    stage: mutant,
                    cause: RejectCause::Aborted(failure),
                }
            }
        };
        if !mutant.satisfied(&features, &wild_features) {
            return BatteryVerdict::Rejected {
                stage: mutant,
                cause: RejectCause::Predicate,
            };
        }
        if mutant == Mutant::Wild {
            wild_features = features;
        }
        collected.push(features);
    }

    BatteryVerdict::Accepted(collected)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    fn sine_trace(periods: f64, points: usize, floor: f64, amp: f64) -> Array1<f64> {
        Array1::from_iter((0..points).map(|i| {
            let phase = periods * 2.0 * std::f64::consts::PI * i as f64 / points as f64;
            floor + amp * (1.0 - phase.cos())
        }))
    }

    #[test]
    fn two_cell_neighbours_are_each_other() {
        let n = Neighbourhood::new(2, 1).unwrap();
        assert_eq!(n.tissue, Tissue::TwoCell);
        assert_eq!(n.row(0), &[0, 1]);
        assert_eq!(n.row(1), &[1, 0]);
    }

    #[test]
    fn chain_wraps_at_width_three() {
        let n = Neighbourhood::new(3, 1).unwrap();
        assert_eq!(n.row(0), &[0, 2, 1]);
        assert_eq!(n.row(2), &[2, 1, 0]);
    }

    #[test]
    fn hexagonal_neighbours_are_distinct_and_not_self() {
        let n = Neighbourhood::new(4, 4).unwrap();
        assert_eq!(n.degree(), 7);
        for i in 0..n.cells() {
            let neighbours = n.neighbours(i);
            assert_eq!(neighbours.len(), 6);
            for (a, &x) in neighbours.iter().enumerate() {
                assert_ne!(x, i, "cell {i} is its own neighbour");
                for &y in &neighbours[a + 1..] {
                    assert_ne!(x, y, "cell {i} has duplicate neighbour {x}");
                }
            }
        }
    }

    #[test]
    fn hexagonal_neighbour_map_is_symmetric() {
        let n = Neighbourhood::new(6, 4).unwrap();
        for i in 0..n.cells() {
            for &j in n.neighbours(i) {
                assert!(
                    n.neighbours(j).contains(&i),
                    "{j} neighbours {i} but not vice versa"
                );
            }
        }
    }

    #[test]
    fn rejects_invalid_tissue_sizes() {
        assert!(Neighbourhood::new(1, 1).is_err());
        assert!(Neighbourhood::new(4, 2).is_err());
        assert!(Neighbourhood::new(4, 3).is_err());
        assert!(Neighbourhood::new(5, 4).is_err());
        assert!(Neighbourhood::new(4, 5).is_err());
        assert!(Neighbourhood::new(2, 1).is_ok());
        assert!(Neighbourhood::new(10, 1).is_ok());
        assert!(Neighbourhood::new(8, 6).is_ok());
    }

    #[test]
    fn stoichiometry_conserves_monomers_in_dimer_reactions() {
        // every association/dissociation pair cancels exactly
        for (k, pair) in PARTIAL_EQ_PAIR.iter().enumerate() {
            if let Some(p) = pair {
                let mut net = [0i64; SPECIES];
                for &(j, u) in STOICHIOMETRY[k] {
                    net[j] += u;
                }
                for &(j, u) in STOICHIOMETRY[*p] {
                    net[j] += u;
                }
                assert!(net.iter().all(|&v| v == 0), "pair {k}/{p} does not cancel");
            }
        }
    }

    #[test]
    fn delayed_reactions_produce_their_targets() {
        for (d, &k) in DELAYED_REACTIONS.iter().enumerate() {
            assert_eq!(STOICHIOMETRY[k], &[(DELAYED_TARGETS[d], 1)]);
        }
    }

    #[test]
    fn hill_functions_match_limits() {
        // no repression, no activation: full synthesis
        assert!((hill_her(50.0, 0.0, 0.0, 0.0) - 50.0).abs() < 1e-12);
        assert!((hill_delta(40.0, 0.0, 0.0) - 40.0).abs() < 1e-12);
        // strong repression quenches transcription
        assert!(hill_her(50.0, 100.0, 0.0, 0.0) < 0.01);
        assert!(hill_delta(40.0, 100.0, 100.0) < 0.01);
        // Delta activation opposes dimer repression
        assert!(hill_her(50.0, 1.0, 0.0, 10.0) > hill_her(50.0, 1.0, 0.0, 0.0));
    }

    #[test]
    fn features_of_synthetic_oscillation() {
        // 6 cycles over 1200 points at eps = 0.1: period 20 minutes
        let trace = sine_trace(6.0, 1200, 10.0, 50.0);
        let f = oscillation_features(trace.view(), 0.1, true);
        assert!((f.period - 20.0).abs() < 0.3);
        assert!((f.amplitude - 100.0).abs() < 1.0);
        assert!(f.peak_to_trough > 10.0);
        assert!(f.mid_peak_to_trough > 10.0);
    }

    #[test]
    fn features_guard_against_zero_troughs() {
        let trace = sine_trace(4.0, 800, 0.0, 30.0);
        let f = oscillation_features(trace.view(), 0.1, false);
        assert!(f.peak_to_trough.is_finite());
        assert!(f.peak_to_trough > 1.0);
    }

    #[test]
    fn flat_trace_has_no_features() {
        let trace = Array1::from_elem(100, 5.0);
        let f = oscillation_features(trace.view(), 0.1, true);
        assert_eq!(f.period, 0.0);
        assert_eq!(f.amplitude, 0.0);
    }

    #[test]
    fn mutant_predicates_band_on_period_ratio() {
        let wild = OscillationFeatures {
            period: 30.0,
            amplitude: 50.0,
            peak_to_trough: 2.0,
            mid_peak_to_trough: 2.0,
        };
        let mut m = wild;
        m.period = 30.3; // ratio 1.01
        assert!(Mutant::Her1.satisfied(&m, &wild));
        assert!(!Mutant::Her13.satisfied(&m, &wild));
        m.period = 31.8; // ratio 1.06
        assert!(!Mutant::Her1.satisfied(&m, &wild));
        assert!(Mutant::Her13.satisfied(&m, &wild));
        assert!(Mutant::Her713.satisfied(&m, &wild));
        m.period = 36.0; // ratio 1.2
        assert!(Mutant::Delta.satisfied(&m, &wild));
        assert!(!Mutant::Her713.satisfied(&m, &wild));
    }

    #[test]
    fn wild_predicate_requires_sustained_oscillation() {
        let good = OscillationFeatures {
            period: 30.0,
            amplitude: 50.0,
            peak_to_trough: 2.0,
            mid_peak_to_trough: 2.5,
        };
        assert!(Mutant::Wild.satisfied(&good, &good));
        let damped = OscillationFeatures {
            mid_peak_to_trough: 4.0,
            peak_to_trough: 1.2,
            ..good
        };
        assert!(!Mutant::Wild.satisfied(&damped, &damped));
        let drifting = OscillationFeatures {
            mid_peak_to_trough: 4.0,
            peak_to_trough: 1.6,
            ..good
        };
        assert!(!Mutant::Wild.satisfied(&drifting, &drifting));
    }

    #[test]
    fn gradient_interpolates_and_carries() {
        let mut rates = RateSet::new(&vec![1.0; NUM_RATES], 6).unwrap();
        rates.apply_gradient_text("4 (1 100) (3 200)\n").unwrap();
        assert!(rates.has_gradients());
        assert!((rates.at(rate::MDH1, 1) - 1.0).abs() < 1e-12);
        assert!((rates.at(rate::MDH1, 2) - 1.5).abs() < 1e-12);
        assert!((rates.at(rate::MDH1, 3) - 2.0).abs() < 1e-12);
        // last anchor carries right
        assert!((rates.at(rate::MDH1, 5) - 2.0).abs() < 1e-12);
        // other rates untouched
        assert!((rates.at(rate::MSH1, 3) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn gradient_errors_are_fatal_configs() {
        let mut rates = RateSet::new(&vec![1.0; NUM_RATES], 4).unwrap();
        assert!(rates.apply_gradient_text("99 (0 100)").is_err());
        assert!(rates.apply_gradient_text("4 (9 100)").is_err());
        assert!(rates.apply_gradient_text("4 (1 -50)").is_err());
        assert!(rates.apply_gradient_text("4").is_err());
    }

    #[test]
    fn refresh_scales_current_rates_by_position() {
        let mut base = vec![1.0; NUM_RATES];
        base[rate::MSH1] = 40.0;
        let mut rates = RateSet::new(&base, 4).unwrap();
        rates.apply_gradient_text("0 (3 50)").unwrap();
        rates.refresh(3);
        assert!((rates.current(rate::MSH1) - 20.0).abs() < 1e-12);
        rates.reset();
        assert!((rates.current(rate::MSH1) - 40.0).abs() < 1e-12);
    }

    #[test]
    fn parse_rejects_short_lines() {
        assert!(parse_parameter_line("1.0,2.0,3.0").is_err());
        let line = vec!["1.5"; NUM_RATES].join(",");
        let parsed = parse_parameter_line(&line).unwrap();
        assert_eq!(parsed.len(), NUM_RATES);
        assert!((parsed[17] - 1.5).abs() < 1e-12);
    }

    #[test]
    fn generated_sets_respect_documented_ranges() {
        let mut ctx = RunContext::from_seed(1);
        for _ in 0..16 {
            let items = generate_set(&mut ctx);
            assert!(items[rate::PSH1] >= 30.0 && items[rate::PSH1] <= 60.0);
            assert!(items[rate::MDH7] >= 0.28 && items[rate::MDH7] <= 0.4);
            assert!(items[rate::DAH1H7] >= 0.0006 && items[rate::DAH1H7] <= 0.009);
            assert!(items[rate::CRITPD] >= 240.0 && items[rate::CRITPD] <= 720.0);
            assert_eq!(items[rate::DELAYMH13], DELAYMH13_SENTINEL);
        }
    }

    #[test]
    fn seeded_contexts_are_reproducible() {
        let mut a = RunContext::from_seed(42);
        let mut b = RunContext::from_seed(42);
        let xs: Vec<f64> = (0..32).map(|_| a.uniform()).collect();
        let ys: Vec<f64> = (0..32).map(|_| b.uniform()).collect();
        assert_eq!(xs, ys);
    }

    struct CannedSimulator {
        periods: Vec<f64>,
        calls: usize,
    }

    impl Simulator for CannedSimulator {
        fn simulate(
            &mut self,
            _rates: &mut RateSet,
            wild: bool,
            _ctx: &mut RunContext,
        ) -> std::result::Result<OscillationFeatures, SimFailure> {
            let period = self.periods[self.calls];
            self.calls += 1;
            Ok(OscillationFeatures {
                period,
                amplitude: 40.0,
                peak_to_trough: 2.0,
                mid_peak_to_trough: if wild { 2.0 } else { 0.0 },
            })
        }
    }

    #[test]
    fn battery_accepts_a_conforming_set() {
        // wild 30; delta 33.6 (1.12); her13 31.8 (1.06); her1 30.3; her7
        // 29.7; her713 31.8
        let mut sim = CannedSimulator {
            periods: vec![30.0, 33.6, 31.8, 30.3, 29.7, 31.8],
            calls: 0,
        };
        let mut rates = RateSet::new(&vec![1.0; NUM_RATES], 2).unwrap();
        let mut ctx = RunContext::from_seed(7);
        let verdict = run_battery(&mut sim, &mut rates, &mut ctx, |_, _| {});
        assert!(verdict.is_accepted());
        if let BatteryVerdict::Accepted(features) = verdict {
            assert_eq!(features.len(), 6);
        }
    }

    #[test]
    fn battery_rejects_out_of_band_her1_period() {
        // her1 runs fourth; its period ratio 1.2 is outside (0.97, 1.03)
        let mut sim = CannedSimulator {
            periods: vec![30.0, 33.6, 31.8, 36.0, 29.7, 31.8],
            calls: 0,
        };
        let mut rates = RateSet::new(&vec![1.0; NUM_RATES], 2).unwrap();
        let mut ctx = RunContext::from_seed(7);
        let verdict = run_battery(&mut sim, &mut rates, &mut ctx, |_, _| {});
        assert_eq!(
            verdict,
            BatteryVerdict::Rejected {
                stage: Mutant::Her1,
                cause: RejectCause::Predicate
            }
        );
    }

    #[test]
    fn battery_restores_knocked_out_rates() {
        struct FailingSimulator;
        impl Simulator for FailingSimulator {
            fn simulate(
                &mut self,
                rates: &mut RateSet,
                wild: bool,
                _ctx: &mut RunContext,
            ) -> std::result::Result<OscillationFeatures, SimFailure> {
                if !wild {
                    assert_eq!(rates.base(rate::PSD), 0.0);
                    return Err(SimFailure::NegativeConcentration {
                        species: 0,
                        cell: 0,
                        time: 1.0,
                    });
                }
                Ok(OscillationFeatures {
                    period: 30.0,
                    amplitude: 40.0,
                    peak_to_trough: 2.0,
                    mid_peak_to_trough: 2.0,
                })
            }
        }
        let mut base = vec![1.0; NUM_RATES];
        base[rate::PSD] = 44.0;
        let mut rates = RateSet::new(&base, 2).unwrap();
        let mut ctx = RunContext::from_seed(7);
        let verdict = run_battery(&mut FailingSimulator, &mut rates, &mut ctx, |_, _| {});
        assert!(matches!(
            verdict,
            BatteryVerdict::Rejected {
                stage: Mutant::Delta,
                cause: RejectCause::Aborted(_)
            }
        ));
        // the delta knockout was restored despite the abort
        assert_eq!(rates.base(rate::PSD), 44.0);
    }
}
