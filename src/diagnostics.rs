use itertools::Itertools;

use crate::chains::ChainRun;

/// Posterior summary of one scalar component of a parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub mean: f64,
    pub sd: f64,
    /// Split potential scale reduction. NaN with fewer than four draws per chain.
    pub r_hat: f64,
}

/// Mean, standard deviation and split R-hat of every scalar of the leaf at
/// `path`, pooled over chains. `None` if there is no such leaf.
pub fn summarize(run: &ChainRun, path: &str) -> Option<Vec<Summary>> {
    let size = run
        .chains()
        .first()?
        .states
        .first()?
        .position
        .leaf_at(path)?
        .len();

    // chains x components x draws
    let per_chain: Vec<Vec<Vec<f64>>> = run
        .chains()
        .iter()
        .map(|chain| {
            let values = chain.leaf_values(path)?;
            if values.len() != size * chain.states.len() {
                return None;
            }
            Some(
                (0..size)
                    .map(|i| values.iter().skip(i).step_by(size).copied().collect())
                    .collect(),
            )
        })
        .collect::<Option<_>>()?;

    let summaries = (0..size)
        .map(|i| {
            let chains = per_chain.iter().map(|c| c[i].as_slice()).collect_vec();
            let pooled = chains.iter().flat_map(|c| c.iter().copied()).collect_vec();
            let (mean, var) = mean_var(&pooled);
            Summary {
                mean,
                sd: var.sqrt(),
                r_hat: split_r_hat(&chains),
            }
        })
        .collect();
    Some(summaries)
}

/// Mean and sample variance.
fn mean_var(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / (n - 1.);
    (mean, var)
}

/// Gelman-Rubin statistic over the first and second half of every chain.
/// The middle draw of odd-length chains is dropped.
pub(crate) fn split_r_hat(chains: &[&[f64]]) -> f64 {
    let half = chains.iter().map(|c| c.len() / 2).min().unwrap_or(0);
    if half < 2 {
        return f64::NAN;
    }
    let halves = chains
        .iter()
        .flat_map(|c| [&c[..half], &c[c.len() - half..]])
        .collect_vec();

    let n = half as f64;
    let m = halves.len() as f64;
    let stats = halves.iter().map(|h| mean_var(h)).collect_vec();
    let grand_mean = stats.iter().map(|(mean, _)| mean).sum::<f64>() / m;
    let between = n / (m - 1.)
        * stats
            .iter()
            .map(|(mean, _)| (mean - grand_mean).powi(2))
            .sum::<f64>();
    let within = stats.iter().map(|(_, var)| var).sum::<f64>() / m;
    let var_plus = (n - 1.) / n * within + between / n;
    (var_plus / within).sqrt()
}
