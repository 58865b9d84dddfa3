use crate::engine::{SimulationEngine, SpikeMode};
use crate::network::NetworkState;
use crate::params::{self, DecisionParams, EvidenceMode};
use crate::sequence::CompiledEpisode;
use serde::{Deserialize, Serialize};
use simple_error::{try_with, SimpleError, SimpleResult};

/// Decision of one episode. `evidence` is normalized to [0, 1] and ordered like `output_ids`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeMetrics {
    pub winner: Option<String>,
    pub margin: f32,
    pub output_ids: Vec<String>,
    pub evidence: Vec<f32>,
    pub num_ticks: usize,
}

impl EpisodeMetrics {
    pub fn is_correct(&self, target_id: &str) -> bool {
        self.winner.as_deref() == Some(target_id)
    }

    /// Target evidence minus the strongest competing evidence. Negative if the target lost.
    pub fn target_margin(&self, target_id: &str) -> f32 {
        let mut target = 0.0;
        let mut strongest_other = 0.0f32;

        for (id, evidence) in self.output_ids.iter().zip(&self.evidence) {
            if id == target_id {
                target = *evidence;
            } else {
                strongest_other = strongest_other.max(*evidence);
            }
        }

        target - strongest_other
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetrics {
    pub accuracy: f32,
    pub margin: f32,
    pub num_episodes: usize,
}

impl DatasetMetrics {
    pub fn from_episodes<'m, I>(metrics: I) -> Self
    where
        I: IntoIterator<Item = (&'m EpisodeMetrics, &'m str)>,
    {
        let mut num_correct = 0;
        let mut margin_sum = 0.0;
        let mut num_episodes = 0;

        for (episode_metrics, target_id) in metrics {
            num_episodes += 1;
            margin_sum += episode_metrics.target_margin(target_id);

            if episode_metrics.is_correct(target_id) {
                num_correct += 1;
            }
        }

        if num_episodes == 0 {
            return Self::default();
        }

        Self {
            accuracy: num_correct as f32 / num_episodes as f32,
            margin: margin_sum / num_episodes as f32,
            num_episodes,
        }
    }
}

/// Runs every episode in inference mode and aggregates accuracy and mean target margin.
pub fn evaluate_episodes(
    network: &NetworkState,
    readout: &Readout,
    episodes: &[CompiledEpisode],
) -> SimpleResult<DatasetMetrics> {
    let mut engine = SimulationEngine::new(network, SpikeMode::Eval);

    let metrics = episodes
        .iter()
        .map(|episode| {
            readout.target_position(episode)?;
            readout.run_episode(&mut engine, episode)
        })
        .collect::<SimpleResult<Vec<_>>>()?;

    Ok(DatasetMetrics::from_episodes(
        metrics
            .iter()
            .zip(episodes)
            .map(|(metrics, episode)| (metrics, episode.target_id())),
    ))
}

/// Turns output spikes within the decision window into a winner and a margin.
#[derive(Debug, Clone)]
pub struct Readout {
    warmup_ticks: usize,
    decision_window: usize,
    evidence_mode: EvidenceMode,
    output_indices: Vec<usize>,
    output_ids: Vec<String>,
    default_output: Option<String>,
}

impl Readout {
    pub fn new(network: &NetworkState, decision_params: &DecisionParams) -> SimpleResult<Self> {
        try_with!(
            params::validate_decision_params(decision_params),
            "invalid decision parameters"
        );

        let output_indices = network.output_indices(decision_params.output_ids.as_deref())?;
        let output_ids = output_indices
            .iter()
            .map(|idx| network.neuron_id(*idx).to_string())
            .collect();

        let default_output = decision_params
            .default_output
            .as_deref()
            .or_else(|| network.default_output());

        if let Some(default_output) = default_output {
            network.resolve_neuron_idx(default_output)?;
        }

        Ok(Self {
            warmup_ticks: decision_params.warmup_ticks,
            decision_window: decision_params.decision_window,
            evidence_mode: decision_params.evidence_mode.clone(),
            output_indices,
            output_ids,
            default_output: default_output.map(str::to_string),
        })
    }

    pub fn num_ticks(&self) -> usize {
        self.warmup_ticks + self.decision_window
    }

    pub fn warmup_ticks(&self) -> usize {
        self.warmup_ticks
    }

    pub fn decision_window(&self) -> usize {
        self.decision_window
    }

    pub fn output_indices(&self) -> &[usize] {
        &self.output_indices
    }

    pub fn output_ids(&self) -> &[String] {
        &self.output_ids
    }

    pub fn output_position(&self, neuron_idx: usize) -> Option<usize> {
        self.output_indices.iter().position(|idx| *idx == neuron_idx)
    }

    /// Maximum reachable raw evidence of one output over the decision window.
    pub fn normalizer(&self) -> f32 {
        match self.evidence_mode {
            EvidenceMode::SpikeCount => self.decision_window as f32,
            EvidenceMode::FiringRate { alpha } => {
                1.0 - (1.0 - alpha).powi(self.decision_window as i32)
            }
        }
    }

    /// Contribution of a spike at each tick of the decision window to the normalized evidence.
    pub fn window_weights(&self) -> Vec<f32> {
        let normalizer = self.normalizer();

        (0..self.decision_window)
            .map(|window_tick| match self.evidence_mode {
                EvidenceMode::SpikeCount => 1.0 / normalizer,
                EvidenceMode::FiringRate { alpha } => {
                    let ticks_after = (self.decision_window - 1 - window_tick) as i32;
                    alpha * (1.0 - alpha).powi(ticks_after) / normalizer
                }
            })
            .collect()
    }

    /// Checks that the episode's target is one of the outputs and returns its position.
    pub fn target_position(&self, episode: &CompiledEpisode) -> SimpleResult<usize> {
        self.output_position(episode.target_idx()).ok_or_else(|| {
            SimpleError::new(format!("unknown target id: {}", episode.target_id()))
        })
    }

    pub fn run_episode(
        &self,
        engine: &mut SimulationEngine,
        episode: &CompiledEpisode,
    ) -> SimpleResult<EpisodeMetrics> {
        self.run_episode_with(engine, episode, |_, _| {})
    }

    /// Runs a fresh episode, calling `on_tick` after every tick with the engine and whether
    /// the tick belongs to the decision window.
    pub fn run_episode_with<F>(
        &self,
        engine: &mut SimulationEngine,
        episode: &CompiledEpisode,
        mut on_tick: F,
    ) -> SimpleResult<EpisodeMetrics>
    where
        F: FnMut(&SimulationEngine, bool),
    {
        engine.reset();
        let mut evidence = vec![0.0; self.output_indices.len()];

        for tick in 0..self.num_ticks() {
            engine.tick(episode.injections_at(tick))?;
            let in_window = tick >= self.warmup_ticks;

            if in_window {
                self.accumulate(&mut evidence, engine.fired());
            }

            on_tick(engine, in_window);
        }

        Ok(self.decide(&evidence))
    }

    pub fn accumulate(&self, evidence: &mut [f32], fired: &[bool]) {
        for (value, idx) in evidence.iter_mut().zip(&self.output_indices) {
            let spike = if fired[*idx] { 1.0 } else { 0.0 };

            match self.evidence_mode {
                EvidenceMode::SpikeCount => *value += spike,
                EvidenceMode::FiringRate { alpha } => *value = (1.0 - alpha) * *value + alpha * spike,
            }
        }
    }

    /// Highest evidence wins, ties go to the lexicographically lowest id. Without any
    /// evidence the default output wins if one is configured.
    pub fn decide(&self, raw_evidence: &[f32]) -> EpisodeMetrics {
        let normalizer = self.normalizer();
        let evidence: Vec<f32> = raw_evidence.iter().map(|value| value / normalizer).collect();

        let mut winner_pos = None;
        let mut best = 0.0;

        for (pos, value) in evidence.iter().enumerate() {
            if *value > best {
                best = *value;
                winner_pos = Some(pos);
            }
        }

        let (winner, margin) = match winner_pos {
            Some(winner_pos) => {
                let runner_up = evidence
                    .iter()
                    .enumerate()
                    .filter(|(pos, _)| *pos != winner_pos)
                    .map(|(_, value)| *value)
                    .fold(0.0, f32::max);
                (Some(self.output_ids[winner_pos].clone()), best - runner_up)
            }
            None => (self.default_output.clone(), 0.0),
        };

        EpisodeMetrics {
            winner,
            margin,
            output_ids: self.output_ids.clone(),
            evidence,
            num_ticks: self.num_ticks(),
        }
    }
}
