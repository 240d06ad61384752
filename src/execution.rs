//! Strategies for running the same computation once per chain.
//!
//! Chains never share state, so both strategies produce exactly the same
//! results. They only differ in where the work runs.

use std::sync::mpsc::channel;

use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::info;

use crate::error::Result;

pub trait ChainMap {
    /// Apply `func` to every `(chain_index, arg)` pair. The results are in
    /// chain order.
    fn map_over_chains<A, R, F>(&self, args: Vec<A>, func: F) -> Vec<R>
    where
        A: Send,
        R: Send,
        F: Fn(usize, A) -> R + Sync;

    fn name(&self) -> &'static str;
}

/// One worker thread per chain.
pub struct ParallelMap {
    pool: ThreadPool,
}

impl ParallelMap {
    pub fn new(num_chains: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_chains.max(1))
            .thread_name(|i| format!("nuts-chain-{}", i))
            .build()?;
        Ok(ParallelMap { pool })
    }
}

impl ChainMap for ParallelMap {
    fn map_over_chains<A, R, F>(&self, args: Vec<A>, func: F) -> Vec<R>
    where
        A: Send,
        R: Send,
        F: Fn(usize, A) -> R + Sync,
    {
        let num_chains = args.len();
        let (results_tx, results_rx) = channel();
        let func = &func;

        self.pool.scope_fifo(move |scope| {
            for (chain, arg) in args.into_iter().enumerate() {
                let results_tx = results_tx.clone();
                scope.spawn_fifo(move |_| {
                    // The receiver outlives the scope.
                    let _ = results_tx.send((chain, func(chain, arg)));
                });
            }
        });

        let mut results: Vec<(usize, R)> = results_rx.into_iter().collect();
        assert!(results.len() == num_chains);
        results.sort_by_key(|&(chain, _)| chain);
        results.into_iter().map(|(_, result)| result).collect()
    }

    fn name(&self) -> &'static str {
        "parallel"
    }
}

/// All chains on the calling thread, one after the other.
#[derive(Debug, Clone, Copy, Default)]
pub struct VectorizedMap;

impl ChainMap for VectorizedMap {
    fn map_over_chains<A, R, F>(&self, args: Vec<A>, func: F) -> Vec<R>
    where
        A: Send,
        R: Send,
        F: Fn(usize, A) -> R + Sync,
    {
        args.into_iter()
            .enumerate()
            .map(|(chain, arg)| func(chain, arg))
            .collect()
    }

    fn name(&self) -> &'static str {
        "vectorized"
    }
}

/// The strategy picked for one multi-chain run.
pub enum Execution {
    Parallel(ParallelMap),
    Vectorized(VectorizedMap),
}

impl Execution {
    /// Run chains in parallel if there is a lane for each of them, and
    /// vectorized on the calling thread otherwise.
    pub fn select(lanes: usize, num_chains: usize) -> Result<Execution> {
        let execution = if lanes >= num_chains {
            Execution::Parallel(ParallelMap::new(num_chains)?)
        } else {
            Execution::Vectorized(VectorizedMap)
        };
        info!(
            lanes,
            num_chains,
            strategy = execution.name(),
            "Selected chain execution strategy"
        );
        Ok(execution)
    }

    /// Lanes available to this process, or one if that cannot be queried.
    pub fn available_lanes() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

impl ChainMap for Execution {
    fn map_over_chains<A, R, F>(&self, args: Vec<A>, func: F) -> Vec<R>
    where
        A: Send,
        R: Send,
        F: Fn(usize, A) -> R + Sync,
    {
        match self {
            Execution::Parallel(map) => map.map_over_chains(args, func),
            Execution::Vectorized(map) => map.map_over_chains(args, func),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Execution::Parallel(map) => map.name(),
            Execution::Vectorized(map) => map.name(),
        }
    }
}
