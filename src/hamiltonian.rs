use std::sync::Arc;

use rand::distr::{Distribution, StandardUniform};
use rand_distr::StandardNormal;

use crate::density::{FlatLogpFunc, LogpError};
use crate::math::{axpy, axpy_out, multiply, scalar_prods2, scalar_prods3, vector_dot};
use crate::nuts::{Collector, NutsError};

/// Details about a divergence that might have occured during sampling
///
/// There are two reasons why we might observe a divergence:
/// - The integration error of the Hamiltonian is larger than
///   a cutoff value or nan.
/// - The logp function caused a recoverable error (eg if an ODE solver
///   failed)
#[derive(Debug, Clone)]
pub struct DivergenceInfo {
    /// The position in parameter space where the diverging leapfrog started
    pub start_location: Option<Box<[f64]>>,
    /// The position in parameter space where the diverging leapfrog ended
    pub end_location: Option<Box<[f64]>>,
    /// The difference between the energy at the initial location of the trajectory and
    /// the energy at the end of the diverging leapfrog step.
    ///
    /// This is not available if the divergence was caused by a logp function error
    pub energy_error: Option<f64>,
    pub start_idx_in_trajectory: Option<i64>,
    pub end_idx_in_trajectory: Option<i64>,
    /// The recoverable logp function error that caused the divergence, if any.
    pub logp_function_error: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Direction {
    Forward,
    Backward,
}

impl Distribution<Direction> for StandardUniform {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Direction {
        if rng.random::<bool>() {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }
}

pub(crate) enum LeapfrogResult<E, T = Point> {
    Ok(T),
    Divergence(DivergenceInfo),
    Err(E),
}

/// A point in phase space.
///
/// Besides position and momentum this stores the sum of the momenta from
/// the initial point of the trajectory up to this point, which the
/// termination criterion needs.
#[derive(Debug, Clone)]
pub(crate) struct Point {
    pub position: Box<[f64]>,
    pub velocity: Box<[f64]>,
    pub gradient: Box<[f64]>,
    pub momentum: Box<[f64]>,
    pub p_sum: Box<[f64]>,
    pub kinetic_energy: f64,
    pub potential_energy: f64,
    pub index_in_trajectory: i64,
    pub initial_energy: f64,
}

impl Point {
    fn new(dim: usize) -> Point {
        let zeros = || vec![0f64; dim].into_boxed_slice();
        Point {
            position: zeros(),
            velocity: zeros(),
            gradient: zeros(),
            momentum: zeros(),
            p_sum: zeros(),
            kinetic_energy: 0.,
            potential_energy: 0.,
            index_in_trajectory: 0,
            initial_energy: 0.,
        }
    }

    pub fn energy(&self) -> f64 {
        self.potential_energy + self.kinetic_energy
    }

    pub fn energy_error(&self) -> f64 {
        self.energy() - self.initial_energy
    }

    pub fn logp(&self) -> f64 {
        -self.potential_energy
    }

    pub fn is_turning(&self, other: &Point) -> bool {
        let (start, end) = if self.index_in_trajectory < other.index_in_trajectory {
            (self, other)
        } else {
            (other, self)
        };

        let a = start.index_in_trajectory;
        let b = end.index_in_trajectory;

        assert!(a < b);
        let (turn1, turn2) = if (a >= 0) & (b >= 0) {
            scalar_prods3(
                &end.p_sum,
                &start.p_sum,
                &start.momentum,
                &end.velocity,
                &start.velocity,
            )
        } else if (b >= 0) & (a < 0) {
            scalar_prods2(&end.p_sum, &start.p_sum, &end.velocity, &start.velocity)
        } else {
            assert!((a < 0) & (b < 0));
            scalar_prods3(
                &start.p_sum,
                &end.p_sum,
                &end.momentum,
                &end.velocity,
                &start.velocity,
            )
        };

        (turn1 < 0.) | (turn2 < 0.)
    }

    fn first_momentum_halfstep(&self, out: &mut Point, epsilon: f64) {
        axpy_out(&self.gradient, &self.momentum, epsilon / 2., &mut out.momentum);
    }

    fn position_step(&self, out: &mut Point, epsilon: f64) {
        axpy_out(&out.velocity, &self.position, epsilon, &mut out.position);
    }

    fn second_momentum_halfstep(&mut self, epsilon: f64) {
        axpy(&self.gradient, &mut self.momentum, epsilon / 2.);
    }

    fn set_psum(&self, out: &mut Point) {
        assert!(out.index_in_trajectory != 0);

        if out.index_in_trajectory == -1 {
            out.p_sum.copy_from_slice(&out.momentum);
        } else {
            axpy_out(&out.momentum, &self.p_sum, 1., &mut out.p_sum);
        }
    }

    fn update_potential_gradient<F: FlatLogpFunc>(
        &mut self,
        logp: &mut F,
    ) -> Result<(), F::LogpError> {
        let value = logp.logp(&self.position, &mut self.gradient)?;
        self.potential_energy = -value;
        Ok(())
    }
}

/// Diagonal mass matrix, stored as its inverse: the estimated posterior
/// variance of each coordinate.
#[derive(Debug, Clone)]
pub(crate) struct DiagMassMatrix {
    variance: Box<[f64]>,
    inv_stds: Box<[f64]>,
}

impl DiagMassMatrix {
    pub(crate) fn new(dim: usize) -> DiagMassMatrix {
        DiagMassMatrix {
            variance: vec![1f64; dim].into(),
            inv_stds: vec![1f64; dim].into(),
        }
    }

    /// Panics unless all values are positive and finite.
    pub(crate) fn from_variance(variance: &[f64]) -> DiagMassMatrix {
        assert!(variance.iter().all(|&v| v.is_finite() & (v > 0.)));
        DiagMassMatrix {
            variance: variance.into(),
            inv_stds: variance.iter().map(|&v| v.sqrt().recip()).collect(),
        }
    }

    pub(crate) fn variance(&self) -> &[f64] {
        &self.variance
    }

    fn update_velocity(&self, point: &mut Point) {
        multiply(&self.variance, &point.momentum, &mut point.velocity);
    }

    fn update_kinetic_energy(&self, point: &mut Point) {
        point.kinetic_energy = 0.5 * vector_dot(&point.momentum, &point.velocity);
    }

    fn randomize_momentum<R: rand::Rng + ?Sized>(&self, point: &mut Point, rng: &mut R) {
        point
            .momentum
            .iter_mut()
            .zip(self.inv_stds.iter())
            .for_each(|(p, &s)| {
                let z: f64 = rng.sample(StandardNormal);
                *p = s * z;
            });
    }
}

/// The hamiltonian defined by the log density (potential energy) and a
/// gaussian kinetic energy with a diagonal mass matrix.
#[derive(Debug, Clone)]
pub(crate) struct EuclideanHamiltonian {
    pub(crate) mass_matrix: DiagMassMatrix,
    pub(crate) max_energy_error: f64,
    pub(crate) step_size: f64,
}

impl EuclideanHamiltonian {
    pub(crate) fn new(mass_matrix: DiagMassMatrix, max_energy_error: f64, step_size: f64) -> Self {
        EuclideanHamiltonian {
            mass_matrix,
            max_energy_error,
            step_size,
        }
    }

    /// Perform one leapfrog step.
    ///
    /// Return either an unrecoverable error, a new point or a divergence.
    pub(crate) fn leapfrog<F: FlatLogpFunc, C: Collector>(
        &self,
        logp: &mut F,
        start: &Point,
        dir: Direction,
        collector: &mut C,
    ) -> LeapfrogResult<F::LogpError> {
        let mut out = start.clone();

        let sign = match dir {
            Direction::Forward => 1,
            Direction::Backward => -1,
        };

        let epsilon = (sign as f64) * self.step_size;

        start.first_momentum_halfstep(&mut out, epsilon);
        self.mass_matrix.update_velocity(&mut out);

        start.position_step(&mut out, epsilon);
        if let Err(logp_error) = out.update_potential_gradient(logp) {
            if !logp_error.is_recoverable() {
                return LeapfrogResult::Err(logp_error);
            }
            let div_info = DivergenceInfo {
                logp_function_error: Some(Arc::new(logp_error)),
                start_location: Some(start.position.clone()),
                end_location: None,
                start_idx_in_trajectory: Some(start.index_in_trajectory),
                end_idx_in_trajectory: None,
                energy_error: None,
            };
            collector.register_leapfrog(start, &out, Some(&div_info));
            return LeapfrogResult::Divergence(div_info);
        }

        out.second_momentum_halfstep(epsilon);

        self.mass_matrix.update_velocity(&mut out);
        self.mass_matrix.update_kinetic_energy(&mut out);

        out.index_in_trajectory = start.index_in_trajectory + sign;

        start.set_psum(&mut out);

        let energy_error = out.energy_error();
        if (energy_error > self.max_energy_error) | !energy_error.is_finite() {
            let divergence_info = DivergenceInfo {
                logp_function_error: None,
                start_location: Some(start.position.clone()),
                end_location: Some(out.position.clone()),
                start_idx_in_trajectory: Some(start.index_in_trajectory),
                end_idx_in_trajectory: Some(out.index_in_trajectory),
                energy_error: Some(energy_error),
            };
            collector.register_leapfrog(start, &out, Some(&divergence_info));
            return LeapfrogResult::Divergence(divergence_info);
        }

        collector.register_leapfrog(start, &out, None);

        LeapfrogResult::Ok(out)
    }

    /// Evaluate the density at a new location.
    ///
    /// The momentum is left at zero, [`EuclideanHamiltonian::initialize_trajectory`]
    /// sets it.
    pub(crate) fn init_point<F: FlatLogpFunc>(
        &self,
        logp: &mut F,
        init: &[f64],
    ) -> Result<Point, NutsError> {
        let mut point = Point::new(logp.dim());
        point.position.copy_from_slice(init);

        point
            .update_potential_gradient(logp)
            .map_err(|e| NutsError::LogpFailure(Box::new(e)))?;
        if !point.potential_energy.is_finite() {
            return Err(NutsError::BadInitLogp(point.logp()));
        }
        if !point.gradient.iter().all(|&g| g.is_finite()) {
            Err(NutsError::BadInitGrad())
        } else {
            Ok(point)
        }
    }

    /// A point from an already evaluated position.
    pub(crate) fn point_at(&self, position: &[f64], gradient: &[f64], logp: f64) -> Point {
        let mut point = Point::new(position.len());
        point.position.copy_from_slice(position);
        point.gradient.copy_from_slice(gradient);
        point.potential_energy = -logp;
        point
    }

    /// Draw a fresh momentum and make `point` the start of a trajectory.
    pub(crate) fn initialize_trajectory<R: rand::Rng + ?Sized>(
        &self,
        point: &mut Point,
        rng: &mut R,
    ) {
        self.mass_matrix.randomize_momentum(point, rng);
        self.mass_matrix.update_velocity(point);
        self.mass_matrix.update_kinetic_energy(point);
        point.index_in_trajectory = 0;
        point.initial_energy = point.energy();
        point.p_sum.copy_from_slice(&point.momentum);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::density::test_logps::NormalLogp;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    struct NoCollector;
    impl Collector for NoCollector {}

    #[test]
    fn leapfrog_conserves_energy_approximately() {
        let mut logp = NormalLogp::new(5, 1.);
        let hamiltonian = EuclideanHamiltonian::new(DiagMassMatrix::new(5), 1000., 0.1);
        let mut rng = ChaCha8Rng::seed_from_u64(42);

        let mut point = hamiltonian.init_point(&mut logp, &[0., 0.5, 1., 1.5, 2.]).unwrap();
        hamiltonian.initialize_trajectory(&mut point, &mut rng);

        let mut current = point.clone();
        for i in 1..=10 {
            current = match hamiltonian.leapfrog(&mut logp, &current, Direction::Forward, &mut NoCollector) {
                LeapfrogResult::Ok(next) => next,
                _ => panic!("unexpected divergence"),
            };
            assert_eq!(current.index_in_trajectory, i);
        }
        assert_abs_diff_eq!(current.energy_error(), 0., epsilon = 0.01);
        assert_eq!(current.initial_energy, point.initial_energy);
    }

    #[test]
    fn forward_then_backward_returns() {
        let mut logp = NormalLogp::new(3, 0.);
        let hamiltonian = EuclideanHamiltonian::new(
            DiagMassMatrix::from_variance(&[0.5, 1., 2.]),
            1000.,
            0.2,
        );
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut point = hamiltonian.init_point(&mut logp, &[0.3, -0.2, 1.]).unwrap();
        hamiltonian.initialize_trajectory(&mut point, &mut rng);

        let LeapfrogResult::Ok(forward) =
            hamiltonian.leapfrog(&mut logp, &point, Direction::Forward, &mut NoCollector)
        else {
            panic!("divergence");
        };
        // Flip the momentum and step forward again: time reversibility.
        let mut flipped = forward.clone();
        flipped.momentum.iter_mut().for_each(|p| *p = -*p);
        let LeapfrogResult::Ok(back) =
            hamiltonian.leapfrog(&mut logp, &flipped, Direction::Forward, &mut NoCollector)
        else {
            panic!("divergence");
        };
        for (a, b) in back.position.iter().zip(point.position.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn large_energy_error_diverges() {
        let mut logp = NormalLogp::new(2, 0.);
        let hamiltonian = EuclideanHamiltonian::new(DiagMassMatrix::new(2), 1., 10.);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut point = hamiltonian.init_point(&mut logp, &[3., -3.]).unwrap();
        hamiltonian.initialize_trajectory(&mut point, &mut rng);

        match hamiltonian.leapfrog(&mut logp, &point, Direction::Backward, &mut NoCollector) {
            LeapfrogResult::Divergence(info) => {
                assert!(info.energy_error.unwrap() > 1.);
                assert_eq!(info.end_idx_in_trajectory, Some(-1));
                assert!(info.logp_function_error.is_none());
            }
            _ => panic!("expected a divergence"),
        }
    }

    #[test]
    fn momentum_follows_mass_matrix() {
        let mass = DiagMassMatrix::from_variance(&[4., 0.25]);
        let mut point = Point::new(2);
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let n = 20_000;
        let mut sq = [0f64; 2];
        for _ in 0..n {
            mass.randomize_momentum(&mut point, &mut rng);
            sq[0] += point.momentum[0] * point.momentum[0];
            sq[1] += point.momentum[1] * point.momentum[1];
        }
        assert_abs_diff_eq!(sq[0] / n as f64, 0.25, epsilon = 0.02);
        assert_abs_diff_eq!(sq[1] / n as f64, 4., epsilon = 0.2);
        assert_eq!(mass.variance(), &[4., 0.25]);
    }
}
