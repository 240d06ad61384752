//! The log-posterior interface between user models and the sampler.

use std::convert::Infallible;

use crate::tree::ParamTree;

/// Errors that happen when we evaluate the logp and gradient function
pub trait LogpError: std::error::Error + Send + Sync + 'static {
    /// Unrecoverable errors during logp computation stop sampling,
    /// recoverable errors are seen as divergences.
    fn is_recoverable(&self) -> bool;
}

impl LogpError for Infallible {
    fn is_recoverable(&self) -> bool {
        match *self {}
    }
}

/// An unnormalized log-posterior density over a parameter tree.
///
/// `logp` returns the log density at `position` and writes its gradient into
/// `gradient`, a tree with the same structure whose values are zero on entry.
///
/// Any closure `Fn(&ParamTree, &mut ParamTree) -> Result<f64, E>` with
/// `E: LogpError` is a log density.
pub trait LogDensity: Sync {
    type LogpError: LogpError;

    fn logp(&self, position: &ParamTree, gradient: &mut ParamTree)
        -> Result<f64, Self::LogpError>;
}

impl<F, E> LogDensity for F
where
    F: Fn(&ParamTree, &mut ParamTree) -> Result<f64, E> + Sync,
    E: LogpError,
{
    type LogpError = E;

    fn logp(&self, position: &ParamTree, gradient: &mut ParamTree) -> Result<f64, E> {
        self(position, gradient)
    }
}

/// A log density on flat `f64` slices, the form the integrator works with.
pub(crate) trait FlatLogpFunc {
    type LogpError: LogpError;

    fn dim(&self) -> usize;

    fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, Self::LogpError>;
}

/// Evaluates a [`LogDensity`] on flat vectors by round-tripping through
/// scratch trees of the model's structure.
pub(crate) struct FlatDensity<'a, D: LogDensity + ?Sized> {
    density: &'a D,
    position: ParamTree,
    gradient: ParamTree,
    dim: usize,
}

impl<'a, D: LogDensity + ?Sized> FlatDensity<'a, D> {
    pub(crate) fn new(density: &'a D, template: &ParamTree) -> Self {
        FlatDensity {
            density,
            position: template.clone(),
            gradient: template.zeros_like(),
            dim: template.size(),
        }
    }

    /// A tree of the model's structure holding `values`.
    pub(crate) fn tree_from(&self, values: &[f64]) -> ParamTree {
        let mut tree = self.position.clone();
        tree.copy_from_flat(values);
        tree
    }
}

impl<D: LogDensity + ?Sized> FlatLogpFunc for FlatDensity<'_, D> {
    type LogpError = D::LogpError;

    fn dim(&self) -> usize {
        self.dim
    }

    fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, D::LogpError> {
        self.position.copy_from_flat(position);
        self.gradient.fill(0.);
        let logp = self.density.logp(&self.position, &mut self.gradient)?;
        self.gradient.write_flat(gradient);
        Ok(logp)
    }
}

#[cfg(test)]
pub(crate) mod test_logps {
    use super::*;
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub(crate) enum NormalLogpError {
        #[error("position is outside the support")]
        OutOfSupport,
        #[error("the model crashed")]
        Fatal,
    }

    impl LogpError for NormalLogpError {
        fn is_recoverable(&self) -> bool {
            matches!(self, NormalLogpError::OutOfSupport)
        }
    }

    /// Independent normals with a common mean and unit variance.
    pub(crate) struct NormalLogp {
        pub(crate) dim: usize,
        pub(crate) mu: f64,
    }

    impl NormalLogp {
        pub(crate) fn new(dim: usize, mu: f64) -> NormalLogp {
            NormalLogp { dim, mu }
        }
    }

    impl FlatLogpFunc for NormalLogp {
        type LogpError = NormalLogpError;

        fn dim(&self) -> usize {
            self.dim
        }

        fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, NormalLogpError> {
            let n = position.len();
            assert!(gradient.len() == n);

            let mut logp = 0f64;
            for (p, g) in position.iter().zip(gradient.iter_mut()) {
                let val = *p - self.mu;
                logp -= val * val / 2.;
                *g = -val;
            }
            Ok(logp)
        }
    }

    /// A unit normal over the tree `{x: scalar}`.
    pub(crate) fn standard_normal(
        position: &ParamTree,
        gradient: &mut ParamTree,
    ) -> Result<f64, NormalLogpError> {
        let x = position
            .get("x")
            .and_then(ParamTree::as_scalar)
            .ok_or(NormalLogpError::Fatal)?;
        if let Some(g) = gradient.get_mut("x").and_then(ParamTree::values_mut) {
            g[0] = -x;
        }
        Ok(-x * x / 2.)
    }
}
