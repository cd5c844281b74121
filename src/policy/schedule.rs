//! Switch schedules: how the policy pool is weighted at each step
//!
//! A schedule maps the run's progress counter to one weight per pool entry.
//! The dispatcher turns the weights into a single draw per batch.

/// Weighting of the policy pool over the course of a run
pub trait SwitchSchedule: Send {
    /// Pool weights at progress `step`, summing to one
    fn weights(&self, step: u64) -> Vec<f32>;

    /// Name of the schedule
    fn name(&self) -> &str;
}

// =============================================================================
// Fixed
// =============================================================================

/// Always the single configured policy
#[derive(Debug, Clone, Default)]
pub struct FixedSwitch;

impl SwitchSchedule for FixedSwitch {
    fn weights(&self, _step: u64) -> Vec<f32> {
        vec![1.0]
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

// =============================================================================
// Random
// =============================================================================

/// Constant per-batch weighted draw
#[derive(Debug, Clone)]
pub struct RandomSwitch {
    weights: Vec<f32>,
}

impl RandomSwitch {
    pub fn new(weights: Vec<f32>) -> Self {
        Self {
            weights: normalized(weights),
        }
    }
}

impl SwitchSchedule for RandomSwitch {
    fn weights(&self, _step: u64) -> Vec<f32> {
        self.weights.clone()
    }

    fn name(&self) -> &str {
        "random"
    }
}

// =============================================================================
// Scheduled
// =============================================================================

/// Weights interpolated linearly from `start` to `end` over `ramp_steps`
///
/// # Example
///
/// ```
/// use mezclar::policy::{LinearSwitch, SwitchSchedule};
///
/// let schedule = LinearSwitch::new(vec![1.0, 0.0], vec![0.0, 1.0], 10);
/// assert_eq!(schedule.weights(0), vec![1.0, 0.0]);
/// assert!((schedule.weights(5)[1] - 0.5).abs() < 1e-6);
/// assert_eq!(schedule.weights(50), vec![0.0, 1.0]);
/// ```
#[derive(Debug, Clone)]
pub struct LinearSwitch {
    start: Vec<f32>,
    end: Vec<f32>,
    ramp_steps: u64,
}

impl LinearSwitch {
    /// Both weight vectors must have one entry per pool policy
    pub fn new(start: Vec<f32>, end: Vec<f32>, ramp_steps: u64) -> Self {
        Self {
            start,
            end,
            ramp_steps: ramp_steps.max(1),
        }
    }

    /// Fraction of the ramp completed at `step`
    pub fn progress(&self, step: u64) -> f32 {
        (step as f32 / self.ramp_steps as f32).min(1.0)
    }
}

impl SwitchSchedule for LinearSwitch {
    fn weights(&self, step: u64) -> Vec<f32> {
        let t = self.progress(step);
        let lerped = self
            .start
            .iter()
            .zip(&self.end)
            .map(|(s, e)| s + t * (e - s))
            .collect();
        normalized(lerped)
    }

    fn name(&self) -> &str {
        "scheduled"
    }
}

fn normalized(mut weights: Vec<f32>) -> Vec<f32> {
    let total: f32 = weights.iter().sum();
    if total > 0.0 {
        weights.iter_mut().for_each(|w| *w /= total);
    }
    weights
}

/// Index picked by a uniform draw `u` in [0, 1) over cumulative weights
///
/// Zero-weight entries are never picked; float shortfall at the top end
/// lands on the last entry with positive weight.
pub fn draw_index(weights: &[f32], u: f32) -> usize {
    let mut acc = 0.0;
    let mut last_positive = 0;
    for (i, &w) in weights.iter().enumerate() {
        if w <= 0.0 {
            continue;
        }
        last_positive = i;
        acc += w;
        if u < acc {
            return i;
        }
    }
    last_positive
}
