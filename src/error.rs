use thiserror::Error;

use crate::nuts::NutsError;
use crate::tree::TreeError;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error("Sampling failed")]
    Nuts(#[from] NutsError),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("{n_chains} chains of {n_draws} draws with {dim} parameters do not fit into memory")]
    BatchTooLarge {
        n_chains: usize,
        n_draws: usize,
        dim: usize,
    },

    #[error("Could not start thread pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T> = std::result::Result<T, Error>;
