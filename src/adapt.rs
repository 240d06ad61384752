//! Building blocks of window adaptation: dual averaging of the step size,
//! windowed variance estimation for the mass matrix and the warmup schedule.

use itertools::izip;
use multiversion::multiversion;

use crate::density::FlatLogpFunc;
use crate::hamiltonian::{Direction, DivergenceInfo, EuclideanHamiltonian, LeapfrogResult, Point};
use crate::nuts::{Collector, NutsError, NutsOptions};

/// Settings for step size adaptation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DualAverageOptions {
    pub kappa: f64,
    pub t0: f64,
    pub gamma: f64,
}

impl Default for DualAverageOptions {
    fn default() -> DualAverageOptions {
        DualAverageOptions {
            kappa: 0.75,
            t0: 10.,
            gamma: 0.05,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct DualAverage {
    log_step: f64,
    log_step_adapted: f64,
    hbar: f64,
    mu: f64,
    count: u64,
    settings: DualAverageOptions,
}

impl DualAverage {
    pub(crate) fn new(settings: DualAverageOptions, initial_step: f64) -> DualAverage {
        DualAverage {
            log_step: initial_step.ln(),
            log_step_adapted: initial_step.ln(),
            hbar: 0.,
            mu: (10. * initial_step).ln(),
            count: 1,
            settings,
        }
    }

    pub(crate) fn advance(&mut self, accept_stat: f64, target: f64) {
        let w = 1. / (self.count as f64 + self.settings.t0);
        self.hbar = (1. - w) * self.hbar + w * (target - accept_stat);
        self.log_step = self.mu - self.hbar * (self.count as f64).sqrt() / self.settings.gamma;
        let mk = (self.count as f64).powf(-self.settings.kappa);
        self.log_step_adapted = mk * self.log_step + (1. - mk) * self.log_step_adapted;
        self.count += 1;
    }

    pub(crate) fn current_step_size(&self) -> f64 {
        self.log_step.exp()
    }

    pub(crate) fn current_step_size_adapted(&self) -> f64 {
        self.log_step_adapted.exp()
    }

    /// Restart the averaging around a new initial step size.
    pub(crate) fn reset(&mut self, initial_step: f64) {
        *self = DualAverage::new(self.settings, initial_step);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RunningMean {
    sum: f64,
    count: u64,
}

impl RunningMean {
    fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub(crate) fn current(&self) -> f64 {
        self.sum / self.count as f64
    }

    fn reset(&mut self) {
        self.sum = 0f64;
        self.count = 0;
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }
}

/// Mean Metropolis acceptance probability over all leapfrog steps of one
/// trajectory. Divergent steps count as zero.
#[derive(Debug, Default)]
pub(crate) struct AcceptanceRateCollector {
    initial_energy: f64,
    pub(crate) mean: RunningMean,
}

impl AcceptanceRateCollector {
    pub(crate) fn new() -> AcceptanceRateCollector {
        AcceptanceRateCollector::default()
    }
}

impl Collector for AcceptanceRateCollector {
    fn register_leapfrog(
        &mut self,
        _start: &Point,
        end: &Point,
        divergence_info: Option<&DivergenceInfo>,
    ) {
        match divergence_info {
            Some(_) => self.mean.add(0.),
            None => {
                let diff = self.initial_energy - end.energy();
                self.mean.add(diff.min(0.).exp());
            }
        };
    }

    fn register_init(&mut self, point: &Point, _options: &NutsOptions) {
        self.initial_energy = point.energy();
        self.mean.reset();
    }
}

/// Welford estimate of the per-coordinate variance of the draws.
#[derive(Debug, Clone)]
pub(crate) struct RunningVariance {
    mean: Box<[f64]>,
    m2: Box<[f64]>,
    count: u64,
}

impl RunningVariance {
    pub(crate) fn new(dim: usize) -> Self {
        RunningVariance {
            mean: vec![0f64; dim].into(),
            m2: vec![0f64; dim].into(),
            count: 0,
        }
    }

    pub(crate) fn add_sample(&mut self, value: &[f64]) {
        self.count += 1;
        add_sample(&mut self.mean, &mut self.m2, value, self.count);
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }

    /// The sample variance shrunk towards `1e-3`, as Stan does for its
    /// diagonal metric. `None` until at least three draws were added.
    pub(crate) fn current_regularized(&self) -> Option<Box<[f64]>> {
        if self.count < 3 {
            return None;
        }
        let n = self.count as f64;
        let weight = n / (n + 5.);
        Some(
            self.m2
                .iter()
                .map(|&m2| weight * m2 / (n - 1.) + 1e-3 * (1. - weight))
                .collect(),
        )
    }

    pub(crate) fn reset(&mut self) {
        self.mean.fill(0.);
        self.m2.fill(0.);
        self.count = 0;
    }
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
fn add_sample(mean: &mut [f64], m2: &mut [f64], value: &[f64], count: u64) {
    assert!(mean.len() == value.len());
    assert!(m2.len() == value.len());
    let count = count as f64;
    izip!(value, mean, m2).for_each(|(&x, mean, m2)| {
        let delta = x - *mean;
        *mean += delta / count;
        *m2 += delta * (x - *mean);
    });
}

/// One warmup iteration: whether it feeds the mass matrix estimate and
/// whether it closes an adaptation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WindowStage {
    pub slow: bool,
    pub window_end: bool,
}

fn fast_stage(len: usize) -> impl Iterator<Item = WindowStage> {
    (0..len).map(move |i| WindowStage {
        slow: false,
        window_end: i + 1 == len,
    })
}

/// The Stan warmup layout: a fast initial buffer, slow windows that double
/// in size, and a fast final buffer. The last slow window is stretched to
/// end where the final buffer starts.
pub(crate) fn build_schedule(
    num_steps: usize,
    initial_buffer: usize,
    first_window: usize,
    final_buffer: usize,
) -> Vec<WindowStage> {
    if num_steps < 20 {
        return vec![
            WindowStage {
                slow: false,
                window_end: false
            };
            num_steps
        ];
    }

    let (initial_buffer, first_window, final_buffer) =
        if initial_buffer + first_window + final_buffer > num_steps {
            let initial = (0.15 * num_steps as f64) as usize;
            let fin = (0.1 * num_steps as f64) as usize;
            (initial, num_steps - initial - fin, fin)
        } else {
            (initial_buffer, first_window.max(1), final_buffer)
        };

    let mut schedule: Vec<WindowStage> = fast_stage(initial_buffer).collect();

    let final_buffer_start = num_steps - final_buffer;
    let mut next_window_size = first_window;
    let mut next_window_start = initial_buffer;
    while next_window_start < final_buffer_start {
        let current_start = next_window_start;
        let mut current_size = next_window_size;
        if 3 * current_size <= final_buffer_start - current_start {
            next_window_size = 2 * current_size;
        } else {
            current_size = final_buffer_start - current_start;
        }
        next_window_start = current_start + current_size;
        schedule.extend((0..current_size).map(|i| WindowStage {
            slow: true,
            window_end: i + 1 == current_size,
        }));
    }

    schedule.extend(fast_stage(final_buffer));
    schedule
}

const MAX_STEP_SIZE_SEARCH: usize = 100;

/// Double or halve the step size until the acceptance probability of a
/// single leapfrog step from `init` crosses one half.
///
/// A fresh momentum is drawn for every trial step.
pub(crate) fn find_reasonable_step_size<F, R>(
    logp: &mut F,
    init: &Point,
    hamiltonian: &EuclideanHamiltonian,
    rng: &mut R,
) -> Result<f64, NutsError>
where
    F: FlatLogpFunc,
    R: rand::Rng + ?Sized,
{
    let options = NutsOptions { maxdepth: 1 };
    let mut trial = hamiltonian.clone();
    let mut point = init.clone();

    let mut accept_prob = |trial: &EuclideanHamiltonian, rng: &mut R| {
        let mut collector = AcceptanceRateCollector::new();
        trial.initialize_trajectory(&mut point, rng);
        collector.register_init(&point, &options);
        match trial.leapfrog(&mut *logp, &point, Direction::Forward, &mut collector) {
            LeapfrogResult::Ok(_) | LeapfrogResult::Divergence(_) => Ok(collector.mean.current()),
            LeapfrogResult::Err(err) => Err(NutsError::LogpFailure(Box::new(err))),
        }
    };

    let accept = accept_prob(&trial, rng)?;
    let grow = accept > 0.5;
    let factor: f64 = if grow { 2. } else { 0.5 };

    for _ in 0..MAX_STEP_SIZE_SEARCH {
        let step_size = trial.step_size * factor;
        if !step_size.is_normal() {
            break;
        }
        trial.step_size = step_size;
        let accept = accept_prob(&trial, rng)?;
        if (accept > 0.5) != grow {
            // The last trial crossed the threshold. When growing, step back
            // to the last size that was still accepted.
            if grow {
                trial.step_size /= factor;
            }
            break;
        }
    }
    Ok(trial.step_size)
}
