use crate::density::LogDensity;
use crate::error::Result;
use crate::kernel::kernel_for;
use crate::key::Key;
use crate::state::{SampleState, StepInfo, TunedParams};

/// Run `n_samples` NUTS transitions from `initial_state` with fixed parameters.
///
/// `key` is split into one sub-key per transition up front, so draw `i`
/// only depends on the sub-key `i` and the state before it. The returned
/// vectors are aligned and have length `n_samples`.
pub fn sample<D: LogDensity + ?Sized>(
    key: Key,
    initial_state: &SampleState,
    tuned: &TunedParams,
    log_posterior: &D,
    n_samples: usize,
) -> Result<(Vec<SampleState>, Vec<StepInfo>)> {
    let kernel = kernel_for(tuned, log_posterior);

    let mut states: Vec<SampleState> = Vec::with_capacity(n_samples);
    let mut infos = Vec::with_capacity(n_samples);
    for key in key.split(n_samples) {
        let current = states.last().unwrap_or(initial_state);
        let (next, info) = kernel.step(key, current)?;
        states.push(next);
        infos.push(info);
    }
    Ok((states, infos))
}
