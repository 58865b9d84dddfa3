use crate::engine::{SimulationEngine, SpikeMode};
use crate::network::NetworkState;
use crate::params::{HebbianParams, IntrinsicParams, RewardMode, UpdateGating};
use crate::readout::{EpisodeMetrics, Readout};
use crate::sequence::CompiledEpisode;
use crate::util::sigmoid;
use simple_error::SimpleResult;

/// Activity statistics of one episode, enough to compute a local weight update.
#[derive(Debug, Clone)]
pub struct EpisodeTrace {
    pub metrics: EpisodeMetrics,
    pub target_pos: usize,
    /// Per neuron, mean of the low-passed spike train over the decision window.
    pub pre_activity: Vec<f32>,
    /// Per synapse, decaying product of the presynaptic spike and the postsynaptic
    /// spike (or rate).
    pub eligibility: Vec<f32>,
    /// Per neuron, EMA firing rate at the end of the episode.
    pub rates: Vec<f32>,
}

pub fn episode_trace(
    network: &NetworkState,
    readout: &Readout,
    episode: &CompiledEpisode,
    hebbian_params: &HebbianParams,
) -> SimpleResult<EpisodeTrace> {
    let target_pos = readout.target_position(episode)?;
    let decay = hebbian_params.trace_decay;
    let rate_alpha = hebbian_params.rate_alpha;
    let synapses = network.synapses();
    let window_scale = 1.0 / readout.decision_window() as f32;

    let mut activity_trace = vec![0.0f32; network.num_neurons()];
    let mut pre_activity = vec![0.0f32; network.num_neurons()];
    let mut eligibility = vec![0.0f32; synapses.len()];
    let mut rates = vec![0.0f32; network.num_neurons()];

    let mut engine = SimulationEngine::new(network, SpikeMode::Eval);

    let metrics = readout.run_episode_with(&mut engine, episode, |engine, in_window| {
        let fired = engine.fired();

        for ((trace, rate), fired) in activity_trace.iter_mut().zip(&mut rates).zip(fired) {
            let spike = if *fired { 1.0 } else { 0.0 };
            *trace = decay * *trace + (1.0 - decay) * spike;
            *rate = (1.0 - rate_alpha) * *rate + rate_alpha * spike;
        }

        for (value, synapse) in eligibility.iter_mut().zip(synapses) {
            let post = if hebbian_params.eligibility_post_rate {
                rates[synapse.post_idx]
            } else if fired[synapse.post_idx] {
                1.0
            } else {
                0.0
            };
            let pre = if fired[synapse.pre_idx] { 1.0 } else { 0.0 };
            *value = decay * *value + pre * post;
        }

        if in_window {
            for (value, trace) in pre_activity.iter_mut().zip(&activity_trace) {
                *value += trace * window_scale;
            }
        }
    })?;

    Ok(EpisodeTrace {
        metrics,
        target_pos,
        pre_activity,
        eligibility,
        rates,
    })
}

pub fn is_satisfied(trace: &EpisodeTrace, hebbian_params: &HebbianParams) -> bool {
    let target_id = &trace.metrics.output_ids[trace.target_pos];
    trace.metrics.is_correct(target_id) && trace.metrics.margin >= hebbian_params.margin_delta
}

pub fn compute_reward(trace: &EpisodeTrace, hebbian_params: &HebbianParams) -> f32 {
    let target_id = &trace.metrics.output_ids[trace.target_pos];

    match hebbian_params.reward_mode {
        RewardMode::Binary {
            reward_pos,
            reward_neg,
        } => {
            if is_satisfied(trace, hebbian_params) {
                reward_pos
            } else {
                reward_neg
            }
        }
        RewardMode::MarginLinear { gain, min, max } => {
            (gain * trace.metrics.target_margin(target_id)).clamp(min, max)
        }
        RewardMode::SoftplusMargin { gain, min, max } => {
            let target_margin = trace.metrics.target_margin(target_id);
            let reward = sigmoid(gain * (hebbian_params.margin_delta - target_margin));

            if min < max {
                reward.clamp(min, max)
            } else {
                reward
            }
        }
    }
}

/// Exponential moving average of past rewards, subtracted to form an advantage.
#[derive(Debug, Clone, Default)]
pub struct RewardBaseline {
    value: Option<f32>,
}

impl RewardBaseline {
    pub fn advantage(&mut self, reward: f32, beta: f32) -> f32 {
        let baseline = self.value.unwrap_or(0.0);
        self.value = Some((1.0 - beta) * baseline + beta * reward);
        reward - baseline
    }

    pub fn value(&self) -> Option<f32> {
        self.value
    }
}

/// Adds one episode's contribution to the per-synapse deltas. Synapses onto outputs follow
/// a delta rule towards the target indicator; all others are reward-modulated. With gating,
/// only synapses onto the winner (or the target) are updated.
pub fn accumulate_deltas(
    network: &NetworkState,
    readout: &Readout,
    trace: &EpisodeTrace,
    reward: f32,
    update_gating: UpdateGating,
    deltas: &mut [f32],
) {
    let winner_pos = trace
        .metrics
        .winner
        .as_ref()
        .and_then(|winner| trace.metrics.output_ids.iter().position(|id| id == winner));

    let gated_pos = match update_gating {
        UpdateGating::All => None,
        UpdateGating::WinnerOnly => winner_pos,
        UpdateGating::TargetOnly => Some(trace.target_pos),
    };

    for (syn_idx, (delta, synapse)) in deltas.iter_mut().zip(network.synapses()).enumerate() {
        let post_pos = readout.output_position(synapse.post_idx);

        if gated_pos.is_some() && post_pos != gated_pos {
            continue;
        }

        match post_pos {
            Some(pos) => {
                let indicator = if pos == trace.target_pos { 1.0 } else { 0.0 };
                let error = indicator - trace.metrics.evidence[pos];
                *delta += error * trace.pre_activity[synapse.pre_idx];
            }
            None => *delta += reward * trace.eligibility[syn_idx],
        }
    }
}

/// Scales and applies accumulated deltas with weight decay and clipping. Returns the number
/// of rejected non-finite updates.
pub fn apply_deltas(
    network: &mut NetworkState,
    deltas: &[f32],
    learning_rate: f32,
    hebbian_params: &HebbianParams,
) -> usize {
    let mut rejected = 0;

    for (synapse, delta) in network.synapses_mut().iter_mut().zip(deltas) {
        let decay = hebbian_params.weight_decay * synapse.weight;
        let weight_change = learning_rate * (delta - decay);

        if !synapse.process_weight_change(weight_change, hebbian_params.weight_clip) {
            rejected += 1;
        }
    }

    rejected
}

/// Moves thresholds up and leaks down for neurons firing above the target rate, and the
/// reverse below it. `rates` are the batch mean of the episodes' end-of-episode rates.
pub fn apply_intrinsic_plasticity(
    network: &mut NetworkState,
    rates: &[f32],
    intrinsic_params: &IntrinsicParams,
) -> SimpleResult<()> {
    let target_rate = intrinsic_params.target_rate;

    let thresholds: Vec<f32> = network
        .thresholds()
        .iter()
        .zip(rates)
        .map(|(threshold, rate)| threshold + intrinsic_params.eta_threshold * (rate - target_rate))
        .collect();

    let leaks: Vec<f32> = network
        .leaks()
        .iter()
        .zip(rates)
        .map(|(leak, rate)| {
            (leak + intrinsic_params.eta_leak * (target_rate - rate)).clamp(0.0, 1.0)
        })
        .collect();

    network.set_thresholds(&thresholds)?;
    network.set_leaks(&leaks)?;

    Ok(())
}
