use crate::params::LrSchedule;
use std::f32::consts::PI;

const COSINE_FLOOR: f32 = 0.01;
const STEP_DECAY_FACTOR: f32 = 0.5;

/// Learning rate for an epoch of a training call spanning `num_epochs` epochs.
pub fn learning_rate(schedule: LrSchedule, base: f32, epoch: usize, num_epochs: usize) -> f32 {
    match schedule {
        LrSchedule::Constant => base,
        LrSchedule::Cosine => {
            if num_epochs <= 1 {
                return base;
            }

            let progress = epoch.min(num_epochs - 1) as f32 / (num_epochs - 1) as f32;
            let floor = COSINE_FLOOR * base;
            floor + (base - floor) * 0.5 * (1.0 + (PI * progress).cos())
        }
        LrSchedule::StepDecay => {
            let step = (num_epochs / 3).max(1);
            base * STEP_DECAY_FACTOR.powi((epoch / step) as i32)
        }
    }
}
