//! Window adaptation of the step size and the diagonal mass matrix.

use tracing::debug;

use crate::adapt::{
    build_schedule, find_reasonable_step_size, DualAverage, DualAverageOptions, RunningVariance,
};
use crate::density::{FlatDensity, FlatLogpFunc, LogDensity};
use crate::error::{Error, Result};
use crate::hamiltonian::{DiagMassMatrix, EuclideanHamiltonian};
use crate::kernel::{check_step_params, state_from_point, transition};
use crate::key::Key;
use crate::state::{SampleState, TunedParams};
use crate::tree::ParamTree;

/// Settings for the warmup phase of a chain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WarmupOptions {
    /// Mean acceptance rate the step size is tuned towards.
    pub target_accept: f64,
    pub initial_step_size: f64,
    /// The maximum tree depth during sampling. The number of leapfrog steps
    /// is smaller than 2 ^ max_tree_depth.
    pub max_tree_depth: u64,
    /// Energy errors above this value are divergences.
    pub max_energy_error: f64,
    /// Draws at the start of warmup that only adapt the step size.
    pub initial_buffer: usize,
    /// Size of the first mass matrix window. Later windows double in size.
    pub first_window: usize,
    /// Draws at the end of warmup that only adapt the step size.
    pub final_buffer: usize,
    pub dual_average: DualAverageOptions,
    /// Search for a reasonable step size at the start of warmup and after
    /// every mass matrix update.
    pub find_step_size: bool,
}

impl Default for WarmupOptions {
    fn default() -> Self {
        WarmupOptions {
            target_accept: 0.8,
            initial_step_size: 1.,
            max_tree_depth: 10,
            max_energy_error: 1000.,
            initial_buffer: 75,
            first_window: 25,
            final_buffer: 50,
            dual_average: DualAverageOptions::default(),
            find_step_size: true,
        }
    }
}

impl WarmupOptions {
    pub fn validate(&self) -> Result<()> {
        if !(self.target_accept > 0. && self.target_accept < 1.) {
            return Err(Error::InvalidSettings(format!(
                "target_accept must be in (0, 1), got {}",
                self.target_accept
            )));
        }
        if !(self.max_energy_error > 0.) {
            return Err(Error::InvalidSettings(format!(
                "max_energy_error must be positive, got {}",
                self.max_energy_error
            )));
        }
        check_step_params(self.initial_step_size, self.max_tree_depth)
    }
}

/// Adapt step size and mass matrix for one chain, starting at `params`.
///
/// `key` is split into one key for the step size search and one key per
/// warmup draw. Returns the last warmup state and the tuned parameters.
pub fn warmup<D: LogDensity + ?Sized>(
    key: Key,
    params: &ParamTree,
    log_posterior: &D,
    n_warmup: usize,
    options: &WarmupOptions,
) -> Result<(SampleState, TunedParams)> {
    options.validate()?;

    let mut density = FlatDensity::new(log_posterior, params);
    let dim = density.dim();
    let (init, _) = params.flatten();

    let mut hamiltonian = EuclideanHamiltonian::new(
        DiagMassMatrix::new(dim),
        options.max_energy_error,
        options.initial_step_size,
    );
    let mut point = hamiltonian.init_point(&mut density, &init)?;

    let keys = key.split(n_warmup + 1);
    let mut search_rng = keys[0].rng();
    if options.find_step_size {
        hamiltonian.step_size =
            find_reasonable_step_size(&mut density, &point, &hamiltonian, &mut search_rng)?;
    }

    let mut step_size_adapt = DualAverage::new(options.dual_average, hamiltonian.step_size);
    let mut draw_variance = RunningVariance::new(dim);
    let schedule = build_schedule(
        n_warmup,
        options.initial_buffer,
        options.first_window,
        options.final_buffer,
    );

    for (draw, (stage, key)) in schedule.iter().zip(&keys[1..]).enumerate() {
        let (next, info) = transition(
            &mut density,
            &point,
            &hamiltonian,
            options.max_tree_depth,
            &mut key.rng(),
        )?;
        point = next;

        step_size_adapt.advance(info.acceptance_rate, options.target_accept);
        hamiltonian.step_size = step_size_adapt.current_step_size();

        if !stage.slow {
            continue;
        }
        draw_variance.add_sample(&point.position);
        if !stage.window_end {
            continue;
        }

        match draw_variance.current_regularized() {
            Some(variance) if variance.iter().all(|v| v.is_finite()) => {
                hamiltonian.mass_matrix = DiagMassMatrix::from_variance(&variance);
            }
            _ => debug!(draw, "Keeping the previous mass matrix"),
        }
        let window = draw_variance.count();
        draw_variance.reset();

        if options.find_step_size {
            hamiltonian.step_size =
                find_reasonable_step_size(&mut density, &point, &hamiltonian, &mut search_rng)?;
        }
        step_size_adapt.reset(hamiltonian.step_size);
        debug!(
            draw,
            window,
            step_size = hamiltonian.step_size,
            "Updated mass matrix"
        );
    }

    let step_size = if n_warmup > 0 {
        step_size_adapt.current_step_size_adapted()
    } else {
        hamiltonian.step_size
    };
    debug!(n_warmup, step_size, "Finished warmup");

    let tuned = TunedParams {
        step_size,
        inverse_mass_matrix: hamiltonian.mass_matrix.variance().into(),
        max_tree_depth: options.max_tree_depth,
        max_energy_error: options.max_energy_error,
    };
    Ok((state_from_point(&density, &point), tuned))
}
