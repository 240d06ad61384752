//! Multi-chain orchestration: jitter, warm up and sample independent chains.

use itertools::izip;
use tracing::debug;

use crate::density::LogDensity;
use crate::error::{Error, Result};
use crate::execution::{ChainMap, Execution};
use crate::init::{jitter_init, JitterMode};
use crate::key::Key;
use crate::sample::sample;
use crate::state::{SampleState, StepInfo, TunedParams};
use crate::tree::ParamTree;
use crate::warmup::{warmup, WarmupOptions};

/// Settings for a multi-chain run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub n_chains: usize,
    /// Number of warmup draws per chain. They are not stored.
    pub n_warmup: usize,
    /// Number of stored draws per chain.
    pub n_samples: usize,
    pub warmup: WarmupOptions,
    /// Number of hardware lanes. Chains run in parallel when there is one
    /// lane per chain. Queried from the system if `None`.
    pub lanes: Option<usize>,
    pub jitter: JitterMode,
}

impl Default for RunSettings {
    fn default() -> Self {
        RunSettings {
            n_chains: 4,
            n_warmup: 500,
            n_samples: 500,
            warmup: WarmupOptions::default(),
            lanes: None,
            jitter: JitterMode::default(),
        }
    }
}

impl RunSettings {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("n_chains", self.n_chains),
            ("n_warmup", self.n_warmup),
            ("n_samples", self.n_samples),
        ] {
            if value == 0 {
                return Err(Error::InvalidSettings(format!("{name} must be at least 1")));
            }
        }
        self.warmup.validate()
    }

    fn check_batch_size(&self, dim: usize) -> Result<()> {
        // Each stored draw holds a position and a gradient.
        let max_values = isize::MAX as usize / std::mem::size_of::<f64>() / 2;
        let too_large = |n_draws: usize| Error::BatchTooLarge {
            n_chains: self.n_chains,
            n_draws,
            dim,
        };

        let stored = self
            .n_chains
            .checked_mul(self.n_samples)
            .and_then(|n| n.checked_mul(dim.max(1)));
        if stored.map_or(true, |n| n > max_values) {
            return Err(too_large(self.n_samples));
        }

        let warmup_keys = self
            .n_warmup
            .checked_add(1)
            .and_then(|n| n.checked_mul(self.n_chains));
        if warmup_keys.map_or(true, |n| n > max_values) {
            return Err(too_large(self.n_warmup));
        }
        Ok(())
    }
}

/// Draws, statistics and tuned parameters of one chain.
#[derive(Debug, Clone)]
pub struct ChainTrace {
    pub chain: usize,
    pub states: Vec<SampleState>,
    pub infos: Vec<StepInfo>,
    pub tuned: TunedParams,
}

impl ChainTrace {
    pub fn num_divergences(&self) -> usize {
        self.infos.iter().filter(|info| info.is_divergent).count()
    }

    /// Values of the leaf at `path` for every draw, concatenated.
    pub fn leaf_values(&self, path: &str) -> Option<Vec<f64>> {
        let Some(first) = self.states.first() else {
            return Some(vec![]);
        };
        let (idx, shape) = first
            .position
            .leaves()
            .into_iter()
            .enumerate()
            .find(|(_, (p, _))| p.to_string() == path)
            .map(|(idx, (_, leaf))| (idx, leaf.shape().to_vec()))?;

        let mut out = Vec::with_capacity(self.states.len() * shape.iter().product::<usize>());
        for state in self.states.iter() {
            let leaves = state.position.leaves();
            let (_, leaf) = leaves.get(idx).filter(|(_, leaf)| leaf.shape() == shape)?;
            out.extend_from_slice(leaf.values());
        }
        Some(out)
    }
}

/// The result of [`run_chains`]: one trace per chain, in chain order.
#[derive(Debug, Clone)]
pub struct ChainRun {
    chains: Vec<ChainTrace>,
}

impl ChainRun {
    pub fn new(chains: Vec<ChainTrace>) -> Self {
        ChainRun { chains }
    }

    pub fn chain(&self, chain: usize) -> Option<&ChainTrace> {
        self.chains.get(chain)
    }

    pub fn chains(&self) -> &[ChainTrace] {
        &self.chains
    }

    pub fn n_chains(&self) -> usize {
        self.chains.len()
    }

    /// Number of draws per chain.
    pub fn n_samples(&self) -> usize {
        self.chains.first().map_or(0, |c| c.states.len())
    }

    pub fn tuned_params(&self) -> Vec<&TunedParams> {
        self.chains.iter().map(|c| &c.tuned).collect()
    }

    pub fn chain_leaf_values(&self, chain: usize, path: &str) -> Option<Vec<f64>> {
        self.chain(chain)?.leaf_values(path)
    }

    /// Values of the leaf at `path` over all chains and draws, chain-major.
    pub fn pooled_leaf_values(&self, path: &str) -> Option<Vec<f64>> {
        let mut out = Vec::new();
        for chain in self.chains.iter() {
            out.extend(chain.leaf_values(path)?);
        }
        Some(out)
    }

    pub fn num_divergences(&self) -> usize {
        self.chains.iter().map(|c| c.num_divergences()).sum()
    }
}

/// Run `settings.n_chains` independent NUTS chains.
///
/// The seed is split into a sampling, a warmup and an initialization key,
/// and each of those into one key per chain. Every chain starts at a
/// jittered copy of `init_template`, runs window adaptation and then draws
/// `n_samples` states. A failure in any chain fails the whole run.
pub fn run_chains<D: LogDensity + ?Sized>(
    seed: Key,
    log_posterior: &D,
    init_template: &ParamTree,
    init_spread: Option<&ParamTree>,
    settings: &RunSettings,
) -> Result<ChainRun> {
    settings.validate()?;
    settings.check_batch_size(init_template.size())?;
    if let Some(spread) = init_spread {
        // Fail before spawning any chain.
        init_template.try_zip_map(spread, |a, _| Ok::<_, Error>(a.clone()))?;
    }

    let n_chains = settings.n_chains;
    let [sample_key, warmup_key, init_key] = seed.split_array::<3>();
    let chain_keys: Vec<(Key, Key, Key)> = izip!(
        init_key.split(n_chains),
        warmup_key.split(n_chains),
        sample_key.split(n_chains)
    )
    .collect();

    let lanes = settings.lanes.unwrap_or_else(Execution::available_lanes);
    let execution = Execution::select(lanes, n_chains)?;

    let traces = execution.map_over_chains(chain_keys, |chain, keys| {
        run_chain(chain, keys, log_posterior, init_template, init_spread, settings)
    });
    let chains = traces.into_iter().collect::<Result<Vec<_>>>()?;
    Ok(ChainRun::new(chains))
}

fn run_chain<D: LogDensity + ?Sized>(
    chain: usize,
    (init_key, warmup_key, sample_key): (Key, Key, Key),
    log_posterior: &D,
    init_template: &ParamTree,
    init_spread: Option<&ParamTree>,
    settings: &RunSettings,
) -> Result<ChainTrace> {
    let start = jitter_init(init_key, init_template, init_spread, settings.jitter)?;
    let (state, tuned) = warmup(
        warmup_key,
        &start,
        log_posterior,
        settings.n_warmup,
        &settings.warmup,
    )?;
    let (states, infos) = sample(sample_key, &state, &tuned, log_posterior, settings.n_samples)?;

    let trace = ChainTrace {
        chain,
        states,
        infos,
        tuned,
    };
    debug!(
        chain,
        divergences = trace.num_divergences(),
        step_size = trace.tuned.step_size,
        "Finished chain"
    );
    Ok(trace)
}
