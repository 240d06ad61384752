use rand::Rng;

use crate::adapt::AcceptanceRateCollector;
use crate::density::{FlatDensity, FlatLogpFunc, LogDensity};
use crate::error::{Error, Result};
use crate::execution::ChainMap;
use crate::hamiltonian::{EuclideanHamiltonian, Point};
use crate::key::Key;
use crate::nuts::{draw, NutsError, NutsOptions};
use crate::state::{SampleState, StepInfo, TunedParams};
use crate::tree::{ParamTree, TreeError};

/// A NUTS transition kernel with fixed, tuned parameters.
pub struct NutsKernel<'a, D: LogDensity + ?Sized> {
    tuned: TunedParams,
    log_posterior: &'a D,
}

/// Build the transition kernel for one chain.
pub fn kernel_for<'a, D: LogDensity + ?Sized>(
    tuned: &TunedParams,
    log_posterior: &'a D,
) -> NutsKernel<'a, D> {
    NutsKernel {
        tuned: tuned.clone(),
        log_posterior,
    }
}

/// [`kernel_for`], mapped over the tuned parameters of several chains.
pub fn kernels_for<'a, S, D>(
    strategy: &S,
    tuned: &[TunedParams],
    log_posterior: &'a D,
) -> Vec<NutsKernel<'a, D>>
where
    S: ChainMap + ?Sized,
    D: LogDensity + ?Sized,
{
    strategy.map_over_chains(tuned.to_vec(), |_, tuned| kernel_for(&tuned, log_posterior))
}

impl<D: LogDensity + ?Sized> NutsKernel<'_, D> {
    pub fn tuned_params(&self) -> &TunedParams {
        &self.tuned
    }

    /// Advance `state` by one NUTS transition driven by `key`.
    pub fn step(&self, key: Key, state: &SampleState) -> Result<(SampleState, StepInfo)> {
        let mut density = FlatDensity::new(self.log_posterior, &state.position);
        let hamiltonian = self.hamiltonian(density.dim())?;
        let point = point_from_state(&hamiltonian, state)?;
        let (next, info) = transition(
            &mut density,
            &point,
            &hamiltonian,
            self.tuned.max_tree_depth,
            &mut key.rng(),
        )?;
        Ok((state_from_point(&density, &next), info))
    }

    fn hamiltonian(&self, dim: usize) -> Result<EuclideanHamiltonian> {
        let tuned = &self.tuned;
        if tuned.inverse_mass_matrix.len() != dim {
            return Err(TreeError::BadFlatLength {
                expected: dim,
                actual: tuned.inverse_mass_matrix.len(),
            }
            .into());
        }
        if !tuned
            .inverse_mass_matrix
            .iter()
            .all(|&v| v.is_finite() & (v > 0.))
        {
            return Err(Error::InvalidSettings(
                "inverse mass matrix must be positive and finite".into(),
            ));
        }
        check_step_params(tuned.step_size, tuned.max_tree_depth)?;
        Ok(tuned.hamiltonian())
    }
}

pub(crate) fn check_step_params(step_size: f64, max_tree_depth: u64) -> Result<()> {
    if !(step_size.is_finite() & (step_size > 0.)) {
        return Err(Error::InvalidSettings(format!(
            "step size must be positive and finite, got {step_size}"
        )));
    }
    if max_tree_depth == 0 {
        return Err(Error::InvalidSettings(
            "max_tree_depth must be at least 1".into(),
        ));
    }
    Ok(())
}

fn point_from_state(hamiltonian: &EuclideanHamiltonian, state: &SampleState) -> Result<Point> {
    // Only used for the structure check.
    state
        .position
        .try_zip_map(&state.logdensity_grad, |a, _| Ok::<_, TreeError>(a.clone()))?;
    let (position, _) = state.position.flatten();
    let (gradient, _) = state.logdensity_grad.flatten();
    Ok(hamiltonian.point_at(&position, &gradient, state.logdensity))
}

pub(crate) fn state_from_point<D: LogDensity + ?Sized>(
    density: &FlatDensity<'_, D>,
    point: &Point,
) -> SampleState {
    SampleState {
        position: density.tree_from(&point.position),
        logdensity: point.logp(),
        logdensity_grad: density.tree_from(&point.gradient),
    }
}

/// One NUTS transition on flat vectors, with the statistics of the step.
pub(crate) fn transition<F, R>(
    logp: &mut F,
    point: &Point,
    hamiltonian: &EuclideanHamiltonian,
    max_tree_depth: u64,
    rng: &mut R,
) -> std::result::Result<(Point, StepInfo), NutsError>
where
    F: FlatLogpFunc,
    R: Rng + ?Sized,
{
    let mut init = point.clone();
    let mut collector = AcceptanceRateCollector::new();
    let options = NutsOptions {
        maxdepth: max_tree_depth,
    };
    let (next, info) = draw(logp, &mut init, rng, hamiltonian, &options, &mut collector)?;

    let step_info = StepInfo {
        acceptance_rate: collector.mean.current(),
        is_divergent: info.divergence_info.is_some(),
        is_turning: info.turning,
        energy: next.energy(),
        energy_error: next.energy_error(),
        num_trajectory_expansions: info.depth,
        num_integration_steps: collector.mean.count(),
        reached_max_depth: info.reached_maxdepth,
        index_in_trajectory: next.index_in_trajectory,
        step_size: hamiltonian.step_size,
        divergence_info: info.divergence_info,
    };
    Ok((next, step_info))
}

/// Evaluate the log density at `position` and wrap it as a sampler state.
pub(crate) fn initial_state<D: LogDensity + ?Sized>(
    log_posterior: &D,
    position: &ParamTree,
) -> Result<SampleState> {
    let mut density = FlatDensity::new(log_posterior, position);
    let mut gradient = vec![0f64; density.dim()];
    let (flat, _) = position.flatten();
    let logp = density
        .logp(&flat, &mut gradient)
        .map_err(|e| NutsError::LogpFailure(Box::new(e)))?;
    Ok(SampleState {
        position: position.clone(),
        logdensity: logp,
        logdensity_grad: density.tree_from(&gradient),
    })
}
