use crate::params::OptimizerParams;

pub trait Optimizer {
    /// Applies one update step in place. Elements whose gradient or updated value is not finite
    /// keep their prior value; the number of such rejections is returned.
    fn step(&mut self, params: &mut [f32], grads: &[f32], learning_rate: f32) -> usize;
}

pub fn create(
    optimizer_params: &OptimizerParams,
    weight_decay: f32,
    num_params: usize,
) -> Box<dyn Optimizer + Send> {
    match *optimizer_params {
        OptimizerParams::Sgd { momentum } => Box::new(Sgd {
            momentum,
            weight_decay,
            velocity: vec![0.0; num_params],
        }),
        OptimizerParams::Adam {
            beta1,
            beta2,
            epsilon,
        } => Box::new(Adam::new(beta1, beta2, epsilon, weight_decay, false, num_params)),
        OptimizerParams::AdamW {
            beta1,
            beta2,
            epsilon,
        } => Box::new(Adam::new(beta1, beta2, epsilon, weight_decay, true, num_params)),
    }
}

struct Sgd {
    momentum: f32,
    weight_decay: f32,
    velocity: Vec<f32>,
}

struct Adam {
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,
    decoupled_decay: bool,
    first_moment: Vec<f32>,
    second_moment: Vec<f32>,
    num_steps: i32,
}

impl Adam {
    fn new(
        beta1: f32,
        beta2: f32,
        epsilon: f32,
        weight_decay: f32,
        decoupled_decay: bool,
        num_params: usize,
    ) -> Self {
        Self {
            beta1,
            beta2,
            epsilon,
            weight_decay,
            decoupled_decay,
            first_moment: vec![0.0; num_params],
            second_moment: vec![0.0; num_params],
            num_steps: 0,
        }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut [f32], grads: &[f32], learning_rate: f32) -> usize {
        let mut rejected = 0;

        for ((param, grad), velocity) in params.iter_mut().zip(grads).zip(&mut self.velocity) {
            let grad = grad + self.weight_decay * *param;
            let next_velocity = self.momentum * *velocity + grad;
            let candidate = *param - learning_rate * next_velocity;

            if candidate.is_finite() {
                *velocity = next_velocity;
                *param = candidate;
            } else {
                rejected += 1;
            }
        }

        rejected
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut [f32], grads: &[f32], learning_rate: f32) -> usize {
        self.num_steps += 1;
        let bias_correction1 = 1.0 - self.beta1.powi(self.num_steps);
        let bias_correction2 = 1.0 - self.beta2.powi(self.num_steps);
        let mut rejected = 0;

        for (idx, (param, grad)) in params.iter_mut().zip(grads).enumerate() {
            let grad = if self.decoupled_decay {
                *grad
            } else {
                grad + self.weight_decay * *param
            };

            let first_moment = self.beta1 * self.first_moment[idx] + (1.0 - self.beta1) * grad;
            let second_moment =
                self.beta2 * self.second_moment[idx] + (1.0 - self.beta2) * grad * grad;

            let m_hat = first_moment / bias_correction1;
            let v_hat = second_moment / bias_correction2;
            let mut candidate = *param - learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);

            if self.decoupled_decay {
                candidate -= learning_rate * self.weight_decay * *param;
            }

            if candidate.is_finite() {
                self.first_moment[idx] = first_moment;
                self.second_moment[idx] = second_moment;
                *param = candidate;
            } else {
                rejected += 1;
            }
        }

        rejected
    }
}
