//! # Segclock DET
//!
//! Deterministic solver for the zebrafish segmentation clock.
//!
//! The clock is modelled as a system of delay differential equations over
//! a small tissue of coupled cells: mRNA transcription is repressed by
//! Her dimers and activated by the Delta protein of neighbouring cells,
//! both read at delays reflecting transcription and translation times.
//! The system is integrated with a fixed-step explicit Euler scheme; the
//! delayed terms index directly into the stored history.
//!
//! The solver is the workhorse of the parameter screen: it reports the
//! oscillation features of her1 mRNA for the wild type and the knockout
//! mutants, and aborts early when a concentration turns negative or a
//! stochastic propensity bound is exceeded.

use ndarray::{s, Array3, ArrayView1};
use serde::{Deserialize, Serialize};

use segclock_core::{
    hill_delta, hill_her, oscillation_features, rate, species, ClockError, Neighbourhood,
    OscillationFeatures, RateSet, Result, RunContext, SimFailure, Simulator, Tissue, REACTIONS,
};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Configuration of a deterministic run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetConfig {
    /// Tissue width in cells.
    pub width: usize,
    /// Tissue height in cells.
    pub height: usize,
    /// Simulated duration in minutes.
    pub minutes: f64,
    /// Euler step in minutes.
    pub epsilon: f64,
    /// Abort threshold for the stochastic propensity forms; `None`
    /// disables the check.
    pub max_propensity: Option<f64>,
    /// Number of windows over which gradient positions advance.
    pub gradient_windows: usize,
}

impl Default for DetConfig {
    fn default() -> Self {
        Self {
            width: 2,
            height: 1,
            minutes: 1200.0,
            epsilon: 0.01,
            max_propensity: None,
            gradient_windows: 50,
        }
    }
}

impl DetConfig {
    /// Total number of Euler steps.
    pub fn steps(&self) -> usize {
        (self.minutes / self.epsilon) as usize
    }

    fn validate(&self) -> Result<()> {
        if self.minutes < 1.0 {
            return Err(ClockError::Config(
                "the simulation must run for at least one minute".into(),
            ));
        }
        if self.epsilon <= 0.0 {
            return Err(ClockError::Config(
                "the Euler step must be a positive real number".into(),
            ));
        }
        if self.gradient_windows == 0 {
            return Err(ClockError::Config(
                "the gradient schedule needs at least one window".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// SIMULATOR
// =============================================================================

/// Euler integrator over the full concentration history.
///
/// Holds a `species x cells x timesteps` array written strictly forward
/// in time; delayed terms read completed timesteps directly. The buffer
/// is allocated once and cleared between runs.
pub struct DetSimulator {
    cfg: DetConfig,
    neigh: Neighbourhood,
    levels: Array3<f64>,
}

impl DetSimulator {
    pub fn new(cfg: DetConfig) -> Result<Self> {
        cfg.validate()?;
        let neigh = Neighbourhood::new(cfg.width, cfg.height)?;
        let steps = cfg.steps();
        let levels = Array3::zeros((segclock_core::SPECIES, neigh.cells(), steps));
        Ok(Self { cfg, neigh, levels })
    }

    pub fn config(&self) -> &DetConfig {
        &self.cfg
    }

    /// Full history of one species in one cell.
    pub fn trace(&self, species: usize, cell: usize) -> ArrayView1<f64> {
        self.levels.slice(s![species, cell, ..])
    }

    /// The her1 mRNA history of cell 0, the trace all features are
    /// extracted from.
    pub fn her1_trace(&self) -> ArrayView1<f64> {
        self.trace(species::MH1, 0)
    }

    /// Sample the her1 trace of cell 0 every `stride` minutes, as
    /// `(timestep, value)` pairs for plot files.
    pub fn plot_samples(&self, stride: f64) -> Vec<(usize, f64)> {
        let step = ((stride / self.cfg.epsilon) as usize).max(1);
        let trace = self.her1_trace();
        (0..trace.len())
            .step_by(step)
            .map(|n| (n, trace[n]))
            .collect()
    }

    fn clear(&mut self) {
        self.levels.fill(0.0);
    }

    /// Integrate the DDE system over the configured horizon.
    ///
    /// Concentrations are updated cell by cell in a fixed order (monomer
    /// proteins, Delta, dimers, mRNAs), each group followed by a
    /// negativity guard. History before a term's delay contributes zero.
    fn integrate(&mut self, rates: &mut RateSet) -> std::result::Result<(), SimFailure> {
        let eps = self.cfg.epsilon;
        let steps = self.cfg.steps();
        let cells = self.neigh.cells();

        let using_gradients = rates.has_gradients();
        let window = (steps / self.cfg.gradient_windows).max(1);
        let mut last_refresh = 1usize;

        // delays in whole timesteps
        let dstep = |r: f64| (r / eps) as usize;
        let nph1 = dstep(rates.current(rate::DELAYPH1));
        let nph7 = dstep(rates.current(rate::DELAYPH7));
        let nph13 = dstep(rates.current(rate::DELAYPH13));
        let npd = dstep(rates.current(rate::DELAYPD));
        let nmh1 = dstep(rates.current(rate::DELAYMH1));
        let nmh7 = dstep(rates.current(rate::DELAYMH7));
        let nmd = dstep(rates.current(rate::DELAYMD));

        for n in 1..steps {
            if using_gradients && n - last_refresh >= window {
                rates.refresh(last_refresh / window + 1);
                last_refresh = n;
            }
            let time = n as f64 * eps;

            for i in 0..cells {
                let x = &self.levels;
                let prev = |sp: usize| x[[sp, i, n - 1]];
                let delayed = |sp: usize, d: usize| if n > d { x[[sp, i, n - d]] } else { 0.0 };

                // monomer proteins: delayed translation, degradation, and
                // dimer exchange
                let ph1 = prev(species::PH1);
                let ph7 = prev(species::PH7);
                let ph13 = prev(species::PH13);
                let new_ph1 = ph1
                    + eps
                        * (rates.current(rate::PSH1) * delayed(species::MH1, nph1)
                            - rates.current(rate::PDH1) * ph1
                            - 2.0 * rates.current(rate::DAH1H1) * ph1 * ph1
                            + 2.0 * rates.current(rate::DDIH1H1) * prev(species::PH11)
                            - rates.current(rate::DAH1H7) * ph1 * ph7
                            + rates.current(rate::DDIH1H7) * prev(species::PH17)
                            - rates.current(rate::DAH1H13) * ph1 * ph13
                            + rates.current(rate::DDIH1H13) * prev(species::PH113));
                let new_ph7 = ph7
                    + eps
                        * (rates.current(rate::PSH7) * delayed(species::MH7, nph7)
                            - rates.current(rate::PDH7) * ph7
                            - 2.0 * rates.current(rate::DAH7H7) * ph7 * ph7
                            + 2.0 * rates.current(rate::DDIH7H7) * prev(species::PH77)
                            - rates.current(rate::DAH1H7) * ph1 * ph7
                            + rates.current(rate::DDIH1H7) * prev(species::PH17)
                            - rates.current(rate::DAH7H13) * ph7 * ph13
                            + rates.current(rate::DDIH7H13) * prev(species::PH713));
                let new_ph13 = ph13
                    + eps
                        * (rates.current(rate::PSH13) * delayed(species::MH13, nph13)
                            - rates.current(rate::PDH13) * ph13
                            - 2.0 * rates.current(rate::DAH13H13) * ph13 * ph13
                            + 2.0 * rates.current(rate::DDIH13H13) * prev(species::PH1313)
                            - rates.current(rate::DAH1H13) * ph1 * ph13
                            + rates.current(rate::DDIH1H13) * prev(species::PH113)
                            - rates.current(rate::DAH7H13) * ph7 * ph13
                            + rates.current(rate::DDIH7H13) * prev(species::PH713));

                // dimers: association gain, dissociation and degradation loss
                let dimer = |da: usize, ddi: usize, ddg: usize, a: f64, b: f64, sp: usize| {
                    prev(sp)
                        + eps
                            * (rates.current(da) * a * b
                                - rates.current(ddi) * prev(sp)
                                - rates.current(ddg) * prev(sp))
                };
                let new_ph11 = dimer(
                    rate::DAH1H1,
                    rate::DDIH1H1,
                    rate::DDGH1H1,
                    ph1,
                    ph1,
                    species::PH11,
                );
                let new_ph17 = dimer(
                    rate::DAH1H7,
                    rate::DDIH1H7,
                    rate::DDGH1H7,
                    ph1,
                    ph7,
                    species::PH17,
                );
                let new_ph113 = dimer(
                    rate::DAH1H13,
                    rate::DDIH1H13,
                    rate::DDGH1H13,
                    ph1,
                    ph13,
                    species::PH113,
                );
                let new_ph77 = dimer(
                    rate::DAH7H7,
                    rate::DDIH7H7,
                    rate::DDGH7H7,
                    ph7,
                    ph7,
                    species::PH77,
                );
                let new_ph713 = dimer(
                    rate::DAH7H13,
                    rate::DDIH7H13,
                    rate::DDGH7H13,
                    ph7,
                    ph13,
                    species::PH713,
                );
                let new_ph1313 = dimer(
                    rate::DAH13H13,
                    rate::DDIH13H13,
                    rate::DDGH13H13,
                    ph13,
                    ph13,
                    species::PH1313,
                );

                // Delta protein
                let pd = prev(species::PD);
                let new_pd = pd
                    + eps
                        * (rates.current(rate::PSD) * delayed(species::MD, npd)
                            - rates.current(rate::PDD) * pd);

                // Delta input averaged over the neighbours, one average
                // per regulated mRNA delay
                let avg = self.neighbour_delta(i, n, [nmh1, nmh7, nmd]);

                // mRNAs: Hill-regulated transcription at delayed
                // arguments, her13 constitutive
                let hill_inputs = |d: usize, y: f64| {
                    let x11 = delayed(species::PH11, d) / rates.current(rate::CRITPH1H1);
                    let x713 = delayed(species::PH713, d) / rates.current(rate::CRITPH7H13);
                    (x11, x713, y / rates.current(rate::CRITPD))
                };
                let mh1 = prev(species::MH1);
                let (x11, x713, y) = hill_inputs(nmh1, avg[0]);
                let new_mh1 = mh1
                    + eps
                        * (hill_her(rates.current(rate::MSH1), x11, x713, y)
                            - rates.current(rate::MDH1) * mh1);
                let mh7 = prev(species::MH7);
                let (x11, x713, y) = hill_inputs(nmh7, avg[1]);
                let new_mh7 = mh7
                    + eps
                        * (hill_her(rates.current(rate::MSH7), x11, x713, y)
                            - rates.current(rate::MDH7) * mh7);
                let mh13 = prev(species::MH13);
                let new_mh13 = mh13
                    + eps * (rates.current(rate::MSH13) - rates.current(rate::MDH13) * mh13);
                let md = prev(species::MD);
                let (x11, x713, _) = hill_inputs(nmd, 0.0);
                let new_md = md
                    + eps
                        * (hill_delta(rates.current(rate::MSD), x11, x713)
                            - rates.current(rate::MDD) * md);

                let written: [(usize, f64); 14] = [
                    (species::PH1, new_ph1),
                    (species::PH7, new_ph7),
                    (species::PH13, new_ph13),
                    (species::PH11, new_ph11),
                    (species::PH17, new_ph17),
                    (species::PH113, new_ph113),
                    (species::PH77, new_ph77),
                    (species::PH713, new_ph713),
                    (species::PH1313, new_ph1313),
                    (species::PD, new_pd),
                    (species::MH1, new_mh1),
                    (species::MH7, new_mh7),
                    (species::MH13, new_mh13),
                    (species::MD, new_md),
                ];
                for (sp, value) in written {
                    if value < 0.0 {
                        return Err(SimFailure::NegativeConcentration {
                            species: sp,
                            cell: i,
                            time,
                        });
                    }
                    self.levels[[sp, i, n]] = value;
                }

                if i == 0 {
                    if let Some(cap) = self.cfg.max_propensity {
                        self.check_propensities(rates, n, avg, cap)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Average the delayed Delta concentration over a cell's neighbours,
    /// excluding the cell itself. Pre-delay history contributes zero.
    fn neighbour_delta(&self, cell: usize, n: usize, delays: [usize; 3]) -> [f64; 3] {
        let mut avg = [0.0f64; 3];
        match self.neigh.tissue {
            Tissue::TwoCell => {
                let other = 1 - cell;
                for (k, &d) in delays.iter().enumerate() {
                    if n > d {
                        avg[k] = self.levels[[species::PD, other, n - d]];
                    }
                }
            }
            Tissue::Chain | Tissue::Hexagonal => {
                let neighbours = self.neigh.neighbours(cell);
                for (k, &d) in delays.iter().enumerate() {
                    if n > d {
                        let sum: f64 = neighbours
                            .iter()
                            .map(|&j| self.levels[[species::PD, j, n - d]])
                            .sum();
                        avg[k] = sum / neighbours.len() as f64;
                    }
                }
            }
        }
        avg
    }

    /// Evaluate every stochastic propensity form against cell 0's current
    /// concentrations and fail the run if any exceeds the cap.
    ///
    /// The Delta input to the transcription propensities is the
    /// neighbour-averaged delayed value already computed for this step.
    fn check_propensities(
        &self,
        rates: &RateSet,
        n: usize,
        avg: [f64; 3],
        cap: f64,
    ) -> std::result::Result<(), SimFailure> {
        let at = |sp: usize| self.levels[[sp, 0, n]];
        let r = |idx: usize| rates.current(idx);
        let mh1 = at(species::MH1);
        let mh7 = at(species::MH7);
        let mh13 = at(species::MH13);
        let md = at(species::MD);
        let ph1 = at(species::PH1);
        let ph7 = at(species::PH7);
        let ph13 = at(species::PH13);
        let pd = at(species::PD);
        let ph11 = at(species::PH11);
        let ph17 = at(species::PH17);
        let ph113 = at(species::PH113);
        let ph77 = at(species::PH77);
        let ph713 = at(species::PH713);
        let ph1313 = at(species::PH1313);

        let x11 = ph11 / r(rate::CRITPH1H1);
        let x713 = ph713 / r(rate::CRITPH7H13);
        let props: [f64; REACTIONS] = [
            r(rate::PSH1) * mh1,
            r(rate::PDH1) * ph1,
            r(rate::DAH1H1) * ph1 * (ph1 - 1.0) / 2.0,
            r(rate::DDIH1H1) * ph11,
            r(rate::DAH1H7) * ph1 * ph7,
            r(rate::DDIH1H7) * ph17,
            r(rate::DAH1H13) * ph1 * ph13,
            r(rate::DDIH1H13) * ph113,
            r(rate::PSH7) * mh7,
            r(rate::PDH7) * ph7,
            r(rate::DAH7H7) * ph7 * (ph7 - 1.0) / 2.0,
            r(rate::DDIH7H7) * ph77,
            r(rate::DAH7H13) * ph7 * ph13,
            r(rate::DDIH7H13) * ph713,
            r(rate::PSH13) * mh13,
            r(rate::PDH13) * ph13,
            r(rate::DAH13H13) * ph13 * (ph13 - 1.0) / 2.0,
            r(rate::DDIH13H13) * ph1313,
            r(rate::DDGH1H1) * ph11,
            r(rate::DDGH1H7) * ph17,
            r(rate::DDGH1H13) * ph113,
            r(rate::DDGH7H7) * ph77,
            r(rate::DDGH7H13) * ph713,
            r(rate::DDGH13H13) * ph1313,
            r(rate::PSD) * md,
            r(rate::PDD) * pd,
            hill_her(r(rate::MSH1), x11, x713, avg[0] / r(rate::CRITPD)),
            r(rate::MDH1) * mh1,
            hill_her(r(rate::MSH7), x11, x713, avg[1] / r(rate::CRITPD)),
            r(rate::MDH7) * mh7,
            r(rate::MSH13),
            r(rate::MDH13) * mh13,
            hill_delta(r(rate::MSD), x11, x713),
            r(rate::MDD) * md,
        ];

        for (reaction, &value) in props.iter().enumerate() {
            if value > cap {
                return Err(SimFailure::PropensityCap {
                    reaction,
                    value,
                    cap,
                });
            }
        }
        Ok(())
    }
}

impl Simulator for DetSimulator {
    fn simulate(
        &mut self,
        rates: &mut RateSet,
        wild: bool,
        _ctx: &mut RunContext,
    ) -> std::result::Result<OscillationFeatures, SimFailure> {
        self.clear();
        rates.reset();
        let outcome = self.integrate(rates);
        let features = oscillation_features(self.her1_trace(), self.cfg.epsilon, wild);
        outcome.map(|_| features)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use segclock_core::{run_battery, BatteryVerdict, Mutant, RejectCause, NUM_RATES};

    /// A dimer-free parameter vector whose dynamics are linear and
    /// provably stable under the Euler step used in tests.
    fn linear_rates() -> Vec<f64> {
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
        v[rate::DELAYPH13] = 1.0;
        v[rate::DELAYPD] = 12.0;
        v[rate::CRITPH1H1] = 400.0;
        v[rate::CRITPH7H13] = 500.0;
        v[rate::CRITPD] = 400.0;
        v
    }

    fn short_config(minutes: f64) -> DetConfig {
        DetConfig {
            minutes,
            ..DetConfig::default()
        }
    }

    #[test]
    fn her13_mrna_approaches_constitutive_steady_state() {
        let mut sim = DetSimulator::new(short_config(100.0)).unwrap();
        let mut rates = RateSet::new(&linear_rates(), 2).unwrap();
        let mut ctx = RunContext::from_seed(1);
        sim.simulate(&mut rates, false, &mut ctx).unwrap();
        let trace = sim.trace(species::MH13, 0);
        let last = trace[trace.len() - 1];
        let expected = 40.0 / 0.2;
        assert!(
            (last - expected).abs() / expected < 0.01,
            "mh13 settled at {last}, expected {expected}"
        );
    }

    #[test]
    fn delayed_translation_is_quiescent_before_its_delay() {
        let cfg = short_config(10.0);
        let eps = cfg.epsilon;
        let mut sim = DetSimulator::new(cfg).unwrap();
        let mut values = linear_rates();
        values[rate::DELAYPH13] = 2.0;
        let mut rates = RateSet::new(&values, 2).unwrap();
        let mut ctx = RunContext::from_seed(1);
        sim.simulate(&mut rates, false, &mut ctx).unwrap();

        let guard = (2.0 / eps) as usize;
        let trace = sim.trace(species::PH13, 0);
        for n in 0..=guard {
            assert_eq!(trace[n], 0.0, "ph13 moved at pre-delay step {n}");
        }
        assert!(trace[guard + 2] > 0.0, "ph13 never started after its delay");
    }

    #[test]
    fn runaway_degradation_aborts_with_negative_concentration() {
        let mut sim = DetSimulator::new(short_config(10.0)).unwrap();
        let mut values = linear_rates();
        // eps * mdh1 > 2 makes the explicit update overshoot below zero
        values[rate::MDH1] = 350.0;
        let mut rates = RateSet::new(&values, 2).unwrap();
        let mut ctx = RunContext::from_seed(1);
        let err = sim.simulate(&mut rates, false, &mut ctx).unwrap_err();
        assert!(matches!(
            err,
            SimFailure::NegativeConcentration {
                species: species::MH1,
                ..
            }
        ));
    }

    #[test]
    fn propensity_cap_aborts_the_run() {
        let mut sim = DetSimulator::new(DetConfig {
            minutes: 10.0,
            max_propensity: Some(1.0),
            ..DetConfig::default()
        })
        .unwrap();
        let mut rates = RateSet::new(&linear_rates(), 2).unwrap();
        let mut ctx = RunContext::from_seed(1);
        let err = sim.simulate(&mut rates, false, &mut ctx).unwrap_err();
        assert!(matches!(err, SimFailure::PropensityCap { .. }));
    }

    #[test]
    fn generous_propensity_cap_lets_the_run_finish() {
        let mut sim = DetSimulator::new(DetConfig {
            minutes: 10.0,
            max_propensity: Some(1e12),
            ..DetConfig::default()
        })
        .unwrap();
        let mut rates = RateSet::new(&linear_rates(), 2).unwrap();
        let mut ctx = RunContext::from_seed(1);
        assert!(sim.simulate(&mut rates, false, &mut ctx).is_ok());
    }

    #[test]
    fn repeated_runs_are_identical() {
        let mut sim = DetSimulator::new(short_config(50.0)).unwrap();
        let mut ctx = RunContext::from_seed(1);
        let mut rates = RateSet::new(&linear_rates(), 2).unwrap();
        let a = sim.simulate(&mut rates, true, &mut ctx).unwrap();
        let mut rates = RateSet::new(&linear_rates(), 2).unwrap();
        let b = sim.simulate(&mut rates, true, &mut ctx).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn tissue_integration_stays_non_negative() {
        let mut sim = DetSimulator::new(DetConfig {
            width: 4,
            height: 4,
            minutes: 20.0,
            ..DetConfig::default()
        })
        .unwrap();
        let mut rates = RateSet::new(&linear_rates(), 4).unwrap();
        let mut ctx = RunContext::from_seed(1);
        assert!(sim.simulate(&mut rates, false, &mut ctx).is_ok());
        for i in 0..16 {
            assert!(sim.trace(species::MD, i).iter().all(|&v| v >= 0.0));
        }
    }

    #[test]
    fn gradient_scaled_run_completes() {
        let mut sim = DetSimulator::new(DetConfig {
            width: 4,
            height: 1,
            minutes: 20.0,
            ..DetConfig::default()
        })
        .unwrap();
        let mut rates = RateSet::new(&linear_rates(), 4).unwrap();
        rates.apply_gradient_text("0 (1 120) (3 80)").unwrap();
        let mut ctx = RunContext::from_seed(1);
        assert!(sim.simulate(&mut rates, false, &mut ctx).is_ok());
    }

    #[test]
    fn non_oscillating_set_is_rejected_at_the_wild_stage() {
        let mut sim = DetSimulator::new(short_config(60.0)).unwrap();
        let mut rates = RateSet::new(&linear_rates(), 2).unwrap();
        let mut ctx = RunContext::from_seed(1);
        let verdict = run_battery(&mut sim, &mut rates, &mut ctx, |_, _| {});
        assert_eq!(
            verdict,
            BatteryVerdict::Rejected {
                stage: Mutant::Wild,
                cause: RejectCause::Predicate
            }
        );
    }

    #[test]
    fn two_cell_delta_input_is_the_other_cells_delayed_level() {
        let mut sim = DetSimulator::new(short_config(10.0)).unwrap();
        sim.levels[[species::PD, 1, 40]] = 7.5;
        sim.levels[[species::PD, 0, 40]] = 3.0;
        // at step 100 with a 60-step delay, cell 0 reads cell 1 at step 40
        let avg = sim.neighbour_delta(0, 100, [60, 60, 60]);
        assert_eq!(avg, [7.5; 3]);
        let avg = sim.neighbour_delta(1, 100, [60, 60, 60]);
        assert_eq!(avg, [3.0; 3]);
        // before the delay has elapsed the input is zero
        let avg = sim.neighbour_delta(0, 50, [60, 60, 60]);
        assert_eq!(avg, [0.0; 3]);
    }

    #[test]
    fn tissue_delta_input_averages_six_neighbours() {
        let mut sim = DetSimulator::new(DetConfig {
            width: 4,
            height: 4,
            minutes: 10.0,
            ..DetConfig::default()
        })
        .unwrap();
        for cell in 0..16 {
            sim.levels[[species::PD, cell, 10]] = 12.0;
        }
        let avg = sim.neighbour_delta(5, 30, [20, 20, 20]);
        // six neighbours at 12.0 each average to 12.0 exactly
        assert_eq!(avg, [12.0; 3]);
    }

    #[test]
    fn plot_samples_stride_matches_granularity() {
        let sim = DetSimulator::new(short_config(10.0)).unwrap();
        let samples = sim.plot_samples(0.1);
        assert_eq!(samples.len(), 100);
        assert_eq!(samples[1].0, 10);
    }
}
