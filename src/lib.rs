//! Warmed-up multi-chain NUTS sampling over parameter trees.
//!
//! [`run_chains`] jitters an initial parameter tree per chain, adapts the
//! step size and a diagonal mass matrix with window adaptation and then
//! draws from every chain, either on a rayon thread pool or sequentially.
//! [`get_idata`] turns the result into arrow record batches.

pub(crate) mod adapt;
pub(crate) mod chains;
pub(crate) mod density;
pub(crate) mod diagnostics;
pub(crate) mod error;
pub(crate) mod execution;
pub(crate) mod hamiltonian;
pub(crate) mod idata;
pub(crate) mod init;
pub(crate) mod kernel;
pub(crate) mod key;
pub(crate) mod math;
pub(crate) mod nuts;
pub mod plot;
pub(crate) mod sample;
pub(crate) mod state;
pub(crate) mod tree;
pub(crate) mod warmup;

pub use adapt::DualAverageOptions;
pub use chains::{run_chains, ChainRun, ChainTrace, RunSettings};
pub use density::{LogDensity, LogpError};
pub use diagnostics::{summarize, Summary};
pub use error::{Error, Result};
pub use execution::{ChainMap, Execution, ParallelMap, VectorizedMap};
pub use hamiltonian::DivergenceInfo;
pub use idata::{get_idata, Coords, Dims, Group, IdataError, InferenceData, Variable};
pub use init::{jitter_init, JitterMode};
pub use kernel::{kernel_for, kernels_for, NutsKernel};
pub use key::Key;
pub use nuts::NutsError;
pub use sample::sample;
pub use state::{SampleStatValue, SampleState, StepInfo, TunedParams};
pub use tree::{Leaf, ParamTree, TreeDef, TreeError, TreePath};
pub use warmup::{warmup, WarmupOptions};
