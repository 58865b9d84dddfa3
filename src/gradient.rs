use crate::engine::{SimulationEngine, SpikeMode};
use crate::network::NetworkState;
use crate::params::GradientParams;
use crate::readout::{EpisodeMetrics, Readout};
use crate::sequence::CompiledEpisode;
use crate::util;
use simple_error::{SimpleError, SimpleResult};

const MIN_PROBABILITY: f32 = 1e-12;

#[derive(Debug, Clone)]
pub struct EpisodeGradient {
    pub metrics: EpisodeMetrics,
    pub loss: f32,
    pub weights: Vec<f32>,
    pub thresholds: Vec<f32>,
    pub leaks: Vec<f32>,
}

/// Unrolls one episode with surrogate spikes and backpropagates the softmax cross-entropy
/// between the accumulated output evidence and the target through every tick.
pub fn episode_gradient(
    network: &NetworkState,
    readout: &Readout,
    episode: &CompiledEpisode,
    gradient_params: &GradientParams,
) -> SimpleResult<EpisodeGradient> {
    let target_pos = readout.target_position(episode)?;
    let surrogate_beta = gradient_params.surrogate_beta;
    let temperature = gradient_params.temperature;
    let window_weights = readout.window_weights();

    let mut engine = SimulationEngine::with_tape(network, SpikeMode::Train { surrogate_beta });
    let mut surrogate_evidence = vec![0.0f32; readout.output_indices().len()];
    let mut window_tick = 0;

    let metrics = readout.run_episode_with(&mut engine, episode, |engine, in_window| {
        if in_window {
            for (value, idx) in surrogate_evidence.iter_mut().zip(readout.output_indices()) {
                *value += window_weights[window_tick] * engine.spikes()[*idx];
            }
            window_tick += 1;
        }
    })?;

    let logits: Vec<f32> = surrogate_evidence
        .iter()
        .map(|evidence| evidence / temperature)
        .collect();
    let probs = util::softmax(&logits);
    let loss = -probs[target_pos].max(MIN_PROBABILITY).ln();

    let grad_evidence: Vec<f32> = probs
        .iter()
        .enumerate()
        .map(|(pos, prob)| {
            let indicator = if pos == target_pos { 1.0 } else { 0.0 };
            (prob - indicator) / temperature
        })
        .collect();

    let tape = engine
        .tape()
        .ok_or_else(|| SimpleError::new("simulation did not record a tape"))?;

    let num_neurons = network.num_neurons();
    let synapses = network.synapses();
    let leaks = network.leaks();
    let warmup_ticks = readout.warmup_ticks();

    let mut grad_weights = vec![0.0; synapses.len()];
    let mut grad_thresholds = vec![0.0; num_neurons];
    let mut grad_leaks = vec![0.0; num_neurons];

    // gradients w.r.t. the membrane after a tick and the current integrated on the next tick
    let mut grad_membrane = vec![0.0f32; num_neurons];
    let mut grad_input = vec![0.0f32; num_neurons];
    let mut grad_spike = vec![0.0f32; num_neurons];

    for tick in (0..tape.num_ticks()).rev() {
        let base = tick * num_neurons;
        grad_spike.fill(0.0);

        for (syn_idx, synapse) in synapses.iter().enumerate() {
            let grad_post_input = grad_input[synapse.post_idx];
            grad_spike[synapse.pre_idx] += synapse.weight * grad_post_input;

            if tape.fired[base + synapse.pre_idx] {
                grad_weights[syn_idx] += grad_post_input;
            }
        }

        if tick >= warmup_ticks {
            let window_weight = window_weights[tick - warmup_ticks];

            for (grad, idx) in grad_evidence.iter().zip(readout.output_indices()) {
                grad_spike[*idx] += grad * window_weight;
            }
        }

        for idx in 0..num_neurons {
            let entry = base + idx;

            if !tape.integrating[entry] {
                // refractory: membrane held, incoming current discarded
                grad_input[idx] = 0.0;
                continue;
            }

            let surrogate = tape.surrogate[entry];
            let surrogate_slope = surrogate_beta * surrogate * (1.0 - surrogate);
            let grad_via_spike = grad_spike[idx] * surrogate_slope;

            let mut grad_clamped = if tape.fired[entry] {
                0.0
            } else {
                grad_membrane[idx]
            };
            grad_clamped += grad_via_spike;
            grad_thresholds[idx] -= grad_via_spike;

            let grad_pre_clamp = if tape.pre_clamp[entry] > 0.0 {
                grad_clamped
            } else {
                0.0
            };

            grad_leaks[idx] += grad_pre_clamp * tape.membrane_prev[entry];
            grad_membrane[idx] = grad_pre_clamp * leaks[idx];
            grad_input[idx] = grad_pre_clamp;
        }
    }

    Ok(EpisodeGradient {
        metrics,
        loss,
        weights: grad_weights,
        thresholds: grad_thresholds,
        leaks: grad_leaks,
    })
}

/// Trainable parameters as one flat vector: weights, then thresholds and leaks if trained.
pub fn flatten_params(network: &NetworkState, gradient_params: &GradientParams) -> Vec<f32> {
    flatten(
        &network.weights(),
        network.thresholds(),
        network.leaks(),
        gradient_params,
    )
}

pub fn flatten_grads(gradient: &EpisodeGradient, gradient_params: &GradientParams) -> Vec<f32> {
    flatten(
        &gradient.weights,
        &gradient.thresholds,
        &gradient.leaks,
        gradient_params,
    )
}

fn flatten(
    weights: &[f32],
    thresholds: &[f32],
    leaks: &[f32],
    gradient_params: &GradientParams,
) -> Vec<f32> {
    let mut flat = weights.to_vec();

    if gradient_params.train_thresholds {
        flat.extend_from_slice(thresholds);
    }

    if gradient_params.train_leaks {
        flat.extend_from_slice(leaks);
    }

    flat
}

/// Writes a flat parameter vector back, clipping weights and keeping leaks in [0, 1].
pub fn apply_params(
    network: &mut NetworkState,
    flat: &[f32],
    gradient_params: &GradientParams,
) -> SimpleResult<()> {
    let num_synapses = network.num_synapses();
    let num_neurons = network.num_neurons();
    let (weights, mut rest) = flat.split_at(num_synapses.min(flat.len()));

    let weights: Vec<f32> = match gradient_params.weight_clip {
        Some(weight_clip) => weights
            .iter()
            .map(|weight| weight.clamp(-weight_clip, weight_clip))
            .collect(),
        None => weights.to_vec(),
    };

    let mut thresholds = None;
    let mut leaks = None;

    if gradient_params.train_thresholds {
        let (head, tail) = rest.split_at(num_neurons.min(rest.len()));
        thresholds = Some(head);
        rest = tail;
    }

    if gradient_params.train_leaks {
        let (head, tail) = rest.split_at(num_neurons.min(rest.len()));
        leaks = Some(head.iter().map(|leak| leak.clamp(0.0, 1.0)).collect::<Vec<_>>());
        rest = tail;
    }

    if !rest.is_empty() {
        return Err(SimpleError::new(format!(
            "{} surplus values in parameter vector",
            rest.len()
        )));
    }

    let mut updated = network.clone();
    updated.set_weights(&weights)?;

    if let Some(thresholds) = thresholds {
        updated.set_thresholds(thresholds)?;
    }

    if let Some(leaks) = leaks {
        updated.set_leaks(&leaks)?;
    }

    *network = updated;
    Ok(())
}

/// Rescales the gradient so that its L2 norm does not exceed `max_norm`. Returns the norm
/// before clipping.
pub fn clip_grad_norm(grads: &mut [f32], max_norm: f32) -> f32 {
    let norm = grads.iter().map(|grad| grad * grad).sum::<f32>().sqrt();

    if norm > max_norm {
        let scale = max_norm / norm;
        grads.iter_mut().for_each(|grad| *grad *= scale);
    }

    norm
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description;
    use crate::params::DecisionParams;
    use crate::util::test_util;
    use float_cmp::assert_approx_eq;

    // S0 fires on every tick, the outputs integrate below threshold, so the loss is a smooth
    // function of every parameter downstream of S0.
    fn get_network(w0: f32, w1: f32) -> NetworkState {
        let mut network = description::parse_network(
            "NEURON S0 50 0 0\n\
             NEURON O0 50 0.5 0\n\
             NEURON O1 50 0.5 0\n\
             CONNECTION S0 O0 0\n\
             CONNECTION S0 O1 0\n",
        )
        .unwrap();
        network.set_weights(&[w0, w1]).unwrap();
        network
    }

    fn get_episode(network: &NetworkState) -> CompiledEpisode {
        let episode = test_util::get_constant_input_episode(&[("S0", 100.0)], 60, "O0");
        CompiledEpisode::compile(network, &episode).unwrap()
    }

    fn loss_of(network: &NetworkState) -> f32 {
        let readout = Readout::new(network, &DecisionParams::default()).unwrap();
        episode_gradient(
            network,
            &readout,
            &get_episode(network),
            &GradientParams::default(),
        )
        .unwrap()
        .loss
    }

    fn assert_close(numeric: f32, analytic: f32) {
        let tolerance = 0.02 * analytic.abs() + 1e-3;
        assert!(
            (numeric - analytic).abs() <= tolerance,
            "numeric {} vs analytic {}",
            numeric,
            analytic
        );
    }

    #[test]
    fn symmetric_outputs() {
        let network = get_network(20.0, 20.0);
        let readout = Readout::new(&network, &DecisionParams::default()).unwrap();
        let gradient = episode_gradient(
            &network,
            &readout,
            &get_episode(&network),
            &GradientParams::default(),
        )
        .unwrap();

        assert_approx_eq!(f32, gradient.loss, 2.0f32.ln(), epsilon = 1e-5);
        assert!(gradient.weights[0] < 0.0);
        assert_approx_eq!(f32, gradient.weights[0], -gradient.weights[1], epsilon = 1e-6);
        assert_eq!(gradient.metrics.winner, None);
    }

    #[test]
    fn matches_finite_differences() {
        let (w0, w1) = (20.0, 15.0);
        let network = get_network(w0, w1);
        let readout = Readout::new(&network, &DecisionParams::default()).unwrap();
        let gradient = episode_gradient(
            &network,
            &readout,
            &get_episode(&network),
            &GradientParams::default(),
        )
        .unwrap();

        let h = 0.05;
        let numeric = (loss_of(&get_network(w0 + h, w1)) - loss_of(&get_network(w0 - h, w1))) / (2.0 * h);
        assert_close(numeric, gradient.weights[0]);

        let numeric = (loss_of(&get_network(w0, w1 + h)) - loss_of(&get_network(w0, w1 - h))) / (2.0 * h);
        assert_close(numeric, gradient.weights[1]);

        for idx in [1, 2] {
            let mut plus = network.clone();
            let mut minus = network.clone();
            let mut thresholds = network.thresholds().to_vec();
            thresholds[idx] += h;
            plus.set_thresholds(&thresholds).unwrap();
            thresholds[idx] -= 2.0 * h;
            minus.set_thresholds(&thresholds).unwrap();

            let numeric = (loss_of(&plus) - loss_of(&minus)) / (2.0 * h);
            assert_close(numeric, gradient.thresholds[idx]);
        }

        let h = 0.005;
        for idx in [1, 2] {
            let mut plus = network.clone();
            let mut minus = network.clone();
            let mut leaks = network.leaks().to_vec();
            leaks[idx] += h;
            plus.set_leaks(&leaks).unwrap();
            leaks[idx] -= 2.0 * h;
            minus.set_leaks(&leaks).unwrap();

            let numeric = (loss_of(&plus) - loss_of(&minus)) / (2.0 * h);
            assert_close(numeric, gradient.leaks[idx]);
        }
    }

    #[test]
    fn non_output_target_rejected() {
        let network = get_network(20.0, 20.0);
        let readout = Readout::new(&network, &DecisionParams::default()).unwrap();
        let episode = test_util::get_constant_input_episode(&[("S0", 100.0)], 60, "S0");
        let episode = CompiledEpisode::compile(&network, &episode).unwrap();

        assert_eq!(
            episode_gradient(&network, &readout, &episode, &GradientParams::default())
                .unwrap_err()
                .as_str(),
            "unknown target id: S0"
        );
    }

    #[test]
    fn flatten_and_apply() {
        let mut network = get_network(20.0, 15.0);
        let params = GradientParams {
            train_leaks: true,
            weight_clip: Some(18.0),
            ..GradientParams::default()
        };

        let mut flat = flatten_params(&network, &params);
        assert_eq!(flat.len(), 5);

        flat[2] = 1.5;
        flat[3] = 0.25;
        apply_params(&mut network, &flat, &params).unwrap();

        assert_approx_eq!(f32, network.weights()[0], 18.0);
        assert_approx_eq!(f32, network.leaks()[0], 1.0);
        assert_approx_eq!(f32, network.leaks()[1], 0.25);
        assert_approx_eq!(f32, network.thresholds()[1], 50.0);

        assert!(apply_params(&mut network, &[1.0; 6], &params).is_err());
    }

    #[test]
    fn grad_norm_clipping() {
        let mut grads = [3.0, 4.0];
        assert_approx_eq!(f32, clip_grad_norm(&mut grads, 1.0), 5.0);
        assert_approx_eq!(f32, grads[0], 0.6);
        assert_approx_eq!(f32, grads[1], 0.8);

        let mut grads = [0.3, 0.4];
        clip_grad_norm(&mut grads, 1.0);
        assert_approx_eq!(f32, grads[0], 0.3);
    }
}
