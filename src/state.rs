//! Values that flow between warmup, the kernel and the sampling loop.

use std::collections::BTreeMap;

use crate::hamiltonian::{DiagMassMatrix, DivergenceInfo, EuclideanHamiltonian};
use crate::tree::ParamTree;

/// A point of the chain: its position, log density and gradient.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleState {
    pub position: ParamTree,
    pub logdensity: f64,
    pub logdensity_grad: ParamTree,
}

/// Adapted sampler parameters of one chain. Fixed once warmup is done.
#[derive(Debug, Clone, PartialEq)]
pub struct TunedParams {
    pub step_size: f64,
    /// Diagonal of the inverse mass matrix, in flattening order of the
    /// parameter tree.
    pub inverse_mass_matrix: Box<[f64]>,
    pub max_tree_depth: u64,
    pub max_energy_error: f64,
}

impl TunedParams {
    pub(crate) fn hamiltonian(&self) -> EuclideanHamiltonian {
        EuclideanHamiltonian::new(
            DiagMassMatrix::from_variance(&self.inverse_mass_matrix),
            self.max_energy_error,
            self.step_size,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleStatValue {
    U64(u64),
    I64(i64),
    F64(f64),
    Bool(bool),
}

impl From<u64> for SampleStatValue {
    fn from(val: u64) -> Self {
        SampleStatValue::U64(val)
    }
}

impl From<i64> for SampleStatValue {
    fn from(val: i64) -> Self {
        SampleStatValue::I64(val)
    }
}

impl From<f64> for SampleStatValue {
    fn from(val: f64) -> Self {
        SampleStatValue::F64(val)
    }
}

impl From<bool> for SampleStatValue {
    fn from(val: bool) -> Self {
        SampleStatValue::Bool(val)
    }
}

/// Diagnostics of one NUTS transition.
#[derive(Debug, Clone)]
pub struct StepInfo {
    /// Mean acceptance probability over the leapfrog steps of the trajectory
    pub acceptance_rate: f64,
    pub is_divergent: bool,
    /// The trajectory stopped because it started to turn back
    pub is_turning: bool,
    /// Hamiltonian energy of the accepted point
    pub energy: f64,
    /// Energy of the accepted point minus the energy at the trajectory start
    pub energy_error: f64,
    /// Tree depth
    pub num_trajectory_expansions: u64,
    pub num_integration_steps: u64,
    pub reached_max_depth: bool,
    pub index_in_trajectory: i64,
    pub step_size: f64,
    pub divergence_info: Option<DivergenceInfo>,
}

impl StepInfo {
    /// Scalar statistics by name, in name order.
    ///
    /// The names follow the ArviZ `sample_stats` conventions rather than the
    /// field names: `is_divergent` is stored as `diverging`, `is_turning` as
    /// `turning`, `num_trajectory_expansions` as `tree_depth`,
    /// `num_integration_steps` as `n_steps` and `reached_max_depth` as
    /// `maxdepth_reached`. `divergence_info` is not a scalar and is left out.
    pub fn as_map(&self) -> BTreeMap<&'static str, SampleStatValue> {
        let mut map = BTreeMap::new();
        map.insert("acceptance_rate", self.acceptance_rate.into());
        map.insert("diverging", self.is_divergent.into());
        map.insert("turning", self.is_turning.into());
        map.insert("energy", self.energy.into());
        map.insert("energy_error", self.energy_error.into());
        map.insert("tree_depth", self.num_trajectory_expansions.into());
        map.insert("n_steps", self.num_integration_steps.into());
        map.insert("maxdepth_reached", self.reached_max_depth.into());
        map.insert("index_in_trajectory", self.index_in_trajectory.into());
        map.insert("step_size", self.step_size.into());
        map
    }
}
