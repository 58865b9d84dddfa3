use crate::engine::{SimulationEngine, SpikeMode};
use crate::genome::Genome;
use crate::gradient::{self, EpisodeGradient};
use crate::hebbian::{self, EpisodeTrace, RewardBaseline};
use crate::lr_schedule;
use crate::network::NetworkState;
use crate::optimizer::{self, Optimizer};
use crate::params::{
    self, GradientParams, HebbianParams, LearningRule, RevertMetric, TrainingParams,
};
use crate::pool::{Job, WorkerPool};
use crate::readout::{self, DatasetMetrics, EpisodeMetrics, Readout};
use crate::sequence::{self, CompiledEpisode, Episode};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use simple_error::{try_with, SimpleError, SimpleResult};
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub learning_rate: f32,
    /// Accuracy and margin of the decisions taken during the epoch, before each batch update.
    pub accuracy: f32,
    pub margin: f32,
    /// Mean cross-entropy over the epoch's episodes. Only the gradient rule has a loss.
    pub mean_loss: Option<f32>,
    pub rejected_updates: usize,
    /// Dataset metrics after the epoch's updates, measured when a revert policy is active.
    pub post_epoch: Option<DatasetMetrics>,
    pub reverted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochRecord>,
}

impl TrainingHistory {
    pub fn to_json(&self) -> SimpleResult<String> {
        Ok(try_with!(
            serde_json::to_string_pretty(self),
            "failed to serialize training history"
        ))
    }
}

#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub metrics: Vec<EpisodeMetrics>,
    pub mean_loss: Option<f32>,
    pub rejected_updates: usize,
}

struct BatchContext {
    readout: Readout,
    learning_rule: LearningRule,
}

struct BatchJob {
    context: Arc<BatchContext>,
    network: NetworkState,
    episodes: Vec<CompiledEpisode>,
}

impl Job for BatchJob {
    fn num_items(&self) -> usize {
        self.episodes.len()
    }
}

enum EpisodeOutcome {
    Gradient(EpisodeGradient),
    Hebbian(EpisodeTrace),
}

enum LearningState {
    Gradient {
        gradient_params: GradientParams,
        optimizer: Box<dyn Optimizer + Send>,
    },
    Hebbian {
        hebbian_params: HebbianParams,
        baseline: RewardBaseline,
    },
}

pub struct Trainer {
    network: NetworkState,
    params: TrainingParams,
    context: Arc<BatchContext>,
    learning_state: LearningState,
    pool: WorkerPool<BatchJob, EpisodeOutcome>,
    checkpoints: VecDeque<Genome>,
    last_post_epoch: Option<DatasetMetrics>,
    history: TrainingHistory,
    rng: StdRng,
}

impl Trainer {
    pub fn new(network: NetworkState, params: TrainingParams) -> SimpleResult<Self> {
        try_with!(
            params::validate_training_params(&params),
            "invalid training parameters"
        );

        let readout = Readout::new(&network, &params.decision_params)?;

        let learning_state = match &params.learning_rule {
            LearningRule::Gradient(gradient_params) => {
                let num_params = gradient::flatten_params(&network, gradient_params).len();

                LearningState::Gradient {
                    gradient_params: gradient_params.clone(),
                    optimizer: optimizer::create(
                        &gradient_params.optimizer,
                        gradient_params.weight_decay,
                        num_params,
                    ),
                }
            }
            LearningRule::Hebbian(hebbian_params) => LearningState::Hebbian {
                hebbian_params: hebbian_params.clone(),
                baseline: RewardBaseline::default(),
            },
        };

        let context = Arc::new(BatchContext {
            readout,
            learning_rule: params.learning_rule.clone(),
        });

        let pool = WorkerPool::new(&params.technical_params, process_episode);
        let rng = StdRng::seed_from_u64(params.technical_params.seed());

        Ok(Self {
            network,
            params,
            context,
            learning_state,
            pool,
            checkpoints: VecDeque::new(),
            last_post_epoch: None,
            history: TrainingHistory::default(),
            rng,
        })
    }

    pub fn network(&self) -> &NetworkState {
        &self.network
    }

    pub fn into_network(self) -> NetworkState {
        self.network
    }

    pub fn params(&self) -> &TrainingParams {
        &self.params
    }

    pub fn readout(&self) -> &Readout {
        &self.context.readout
    }

    pub fn history(&self) -> &TrainingHistory {
        &self.history
    }

    pub fn num_checkpoints(&self) -> usize {
        self.checkpoints.len()
    }

    /// Runs one episode in inference mode against the current parameters.
    pub fn evaluate(&self, episode: &Episode) -> SimpleResult<EpisodeMetrics> {
        let compiled = self.compile(std::slice::from_ref(episode))?;
        let mut engine = SimulationEngine::new(&self.network, SpikeMode::Eval);
        self.context.readout.run_episode(&mut engine, &compiled[0])
    }

    pub fn evaluate_dataset(&self, episodes: &[Episode]) -> SimpleResult<DatasetMetrics> {
        if episodes.is_empty() {
            return Err(SimpleError::new("empty dataset"));
        }

        let compiled = self.compile(episodes)?;
        readout::evaluate_episodes(&self.network, &self.context.readout, &compiled)
    }

    /// Trains for `num_epochs` passes over the dataset and returns the records of this call.
    /// The learning-rate schedule restarts with every call.
    pub fn train(
        &mut self,
        dataset: &[Episode],
        num_epochs: usize,
    ) -> SimpleResult<Vec<EpochRecord>> {
        if dataset.is_empty() {
            return Err(SimpleError::new("empty dataset"));
        }

        let mut compiled = self.compile(dataset)?;
        let batch_size = self.params.batch_size.min(compiled.len());
        let mut records = Vec::with_capacity(num_epochs);

        for epoch in 0..num_epochs {
            let learning_rate = lr_schedule::learning_rate(
                self.params.lr_schedule,
                self.params.learning_rate,
                epoch,
                num_epochs,
            );

            if self.params.shuffle {
                compiled.shuffle(&mut self.rng);
            }

            let mut epoch_metrics = Vec::with_capacity(compiled.len());
            let mut loss_sum = 0.0;
            let mut num_losses = 0;
            let mut rejected_updates = 0;

            for (batch_idx, batch) in compiled.chunks(batch_size).enumerate() {
                let summary = self.process_batch(batch, learning_rate)?;

                debug!(
                    "epoch {} batch {}: {} episodes, mean loss {:?}, {} rejected updates",
                    epoch,
                    batch_idx,
                    batch.len(),
                    summary.mean_loss,
                    summary.rejected_updates
                );

                if let Some(mean_loss) = summary.mean_loss {
                    loss_sum += mean_loss * batch.len() as f32;
                    num_losses += batch.len();
                }

                rejected_updates += summary.rejected_updates;
                epoch_metrics.extend(summary.metrics.into_iter().zip(batch));
            }

            let dataset_metrics = DatasetMetrics::from_episodes(
                epoch_metrics
                    .iter()
                    .map(|(metrics, episode)| (metrics, episode.target_id())),
            );

            let mut record = EpochRecord {
                epoch,
                learning_rate,
                accuracy: dataset_metrics.accuracy,
                margin: dataset_metrics.margin,
                mean_loss: (num_losses > 0).then(|| loss_sum / num_losses as f32),
                rejected_updates,
                post_epoch: None,
                reverted: false,
            };

            if rejected_updates > 0 {
                warn!(
                    "epoch {}: rejected {} non-finite parameter updates",
                    epoch, rejected_updates
                );
            }

            self.finish_epoch(&compiled, &mut record)?;

            info!(
                "epoch {}: accuracy {:.3}, margin {:.3}, mean loss {:?}, lr {}",
                epoch, record.accuracy, record.margin, record.mean_loss, learning_rate
            );

            self.history.epochs.push(record.clone());
            records.push(record);
        }

        Ok(records)
    }

    /// Applies one update from a batch of episodes at the configured base learning rate.
    pub fn train_batch(&mut self, batch: &[Episode]) -> SimpleResult<BatchSummary> {
        if batch.is_empty() {
            return Err(SimpleError::new("empty dataset"));
        }

        let compiled = self.compile(batch)?;
        self.process_batch(&compiled, self.params.learning_rate)
    }

    /// Stores a snapshot of the current parameters, dropping the oldest beyond the limit.
    pub fn checkpoint(&mut self) {
        if self.checkpoints.len() == self.params.checkpoint_params.max_checkpoints {
            self.checkpoints.pop_front();
        }

        if self.params.checkpoint_params.max_checkpoints > 0 {
            self.checkpoints.push_back(self.network.genome());
        }
    }

    /// Restores and removes the latest checkpoint. Returns false if there is none.
    pub fn revert_checkpoint(&mut self) -> SimpleResult<bool> {
        match self.checkpoints.pop_back() {
            Some(genome) => {
                self.network.apply_genome(&genome)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn compile(&self, episodes: &[Episode]) -> SimpleResult<Vec<CompiledEpisode>> {
        let compiled = sequence::compile_episodes(&self.network, episodes)?;

        for episode in &compiled {
            self.context.readout.target_position(episode)?;
        }

        Ok(compiled)
    }

    fn finish_epoch(
        &mut self,
        compiled: &[CompiledEpisode],
        record: &mut EpochRecord,
    ) -> SimpleResult<()> {
        if !self.params.checkpoint_params.enabled {
            return Ok(());
        }

        let revert_params = match self.params.checkpoint_params.revert_on_drop.clone() {
            Some(revert_params) => revert_params,
            None => {
                self.checkpoint();
                return Ok(());
            }
        };

        let post_epoch =
            readout::evaluate_episodes(&self.network, &self.context.readout, compiled)?;
        record.post_epoch = Some(post_epoch.clone());

        let dropped = match &self.last_post_epoch {
            Some(previous) => {
                let change = match revert_params.metric {
                    RevertMetric::Accuracy => previous.accuracy - post_epoch.accuracy,
                    RevertMetric::Margin => previous.margin - post_epoch.margin,
                };
                change >= revert_params.drop
            }
            None => false,
        };

        let restore = if dropped {
            self.checkpoints.back().cloned()
        } else {
            None
        };

        match restore {
            Some(genome) => {
                self.network.apply_genome(&genome)?;
                record.reverted = true;

                warn!(
                    "epoch {}: {:?} dropped by at least {}, reverted to last checkpoint",
                    record.epoch, revert_params.metric, revert_params.drop
                );
            }
            None => {
                self.checkpoint();
                self.last_post_epoch = Some(post_epoch);
            }
        }

        Ok(())
    }

    fn process_batch(
        &mut self,
        batch: &[CompiledEpisode],
        learning_rate: f32,
    ) -> SimpleResult<BatchSummary> {
        let job = BatchJob {
            context: Arc::clone(&self.context),
            network: self.network.clone(),
            episodes: batch.to_vec(),
        };

        let outcomes = self
            .pool
            .run(job)?
            .into_iter()
            .collect::<SimpleResult<Vec<_>>>()?;

        let scale = 1.0 / outcomes.len().max(1) as f32;

        match &mut self.learning_state {
            LearningState::Gradient {
                gradient_params,
                optimizer,
            } => {
                let mut params = gradient::flatten_params(&self.network, gradient_params);
                let mut grads = vec![0.0; params.len()];
                let mut loss_sum = 0.0;
                let mut metrics = Vec::with_capacity(outcomes.len());

                for outcome in outcomes {
                    if let EpisodeOutcome::Gradient(episode_gradient) = outcome {
                        let flat = gradient::flatten_grads(&episode_gradient, gradient_params);

                        for (grad, value) in grads.iter_mut().zip(flat) {
                            *grad += value * scale;
                        }

                        loss_sum += episode_gradient.loss;
                        metrics.push(episode_gradient.metrics);
                    }
                }

                if let Some(max_norm) = gradient_params.clip_grad_norm {
                    gradient::clip_grad_norm(&mut grads, max_norm);
                }

                let rejected_updates = optimizer.step(&mut params, &grads, learning_rate);
                gradient::apply_params(&mut self.network, &params, gradient_params)?;

                Ok(BatchSummary {
                    mean_loss: Some(loss_sum * scale),
                    metrics,
                    rejected_updates,
                })
            }
            LearningState::Hebbian {
                hebbian_params,
                baseline,
            } => {
                let readout = &self.context.readout;
                let mut deltas = vec![0.0; self.network.num_synapses()];
                let mut rates = vec![0.0; self.network.num_neurons()];
                let mut metrics = Vec::with_capacity(outcomes.len());

                for outcome in outcomes {
                    if let EpisodeOutcome::Hebbian(trace) = outcome {
                        for (rate, value) in rates.iter_mut().zip(&trace.rates) {
                            *rate += value * scale;
                        }

                        let reward = hebbian::compute_reward(&trace, hebbian_params);
                        let reward = match hebbian_params.baseline_beta {
                            Some(beta) => baseline.advantage(reward, beta),
                            None => reward,
                        };

                        let satisfied = hebbian::is_satisfied(&trace, hebbian_params);

                        if !(satisfied && hebbian_params.no_update_if_satisfied) {
                            hebbian::accumulate_deltas(
                                &self.network,
                                readout,
                                &trace,
                                reward,
                                hebbian_params.update_gating,
                                &mut deltas,
                            );
                        }

                        metrics.push(trace.metrics);
                    }
                }

                deltas.iter_mut().for_each(|delta| *delta *= scale);

                let rejected_updates = hebbian::apply_deltas(
                    &mut self.network,
                    &deltas,
                    learning_rate,
                    hebbian_params,
                );

                if let Some(intrinsic_params) = &hebbian_params.intrinsic_params {
                    hebbian::apply_intrinsic_plasticity(
                        &mut self.network,
                        &rates,
                        intrinsic_params,
                    )?;
                }

                Ok(BatchSummary {
                    metrics,
                    mean_loss: None,
                    rejected_updates,
                })
            }
        }
    }
}

fn process_episode(job: &BatchJob, item_idx: usize) -> SimpleResult<EpisodeOutcome> {
    let episode = &job.episodes[item_idx];
    let readout = &job.context.readout;

    match &job.context.learning_rule {
        LearningRule::Gradient(gradient_params) => Ok(EpisodeOutcome::Gradient(
            gradient::episode_gradient(&job.network, readout, episode, gradient_params)?,
        )),
        LearningRule::Hebbian(hebbian_params) => Ok(EpisodeOutcome::Hebbian(
            hebbian::episode_trace(&job.network, readout, episode, hebbian_params)?,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description;
    use crate::params::{CheckpointParams, IntrinsicParams, LrSchedule, RevertParams};
    use crate::util::test_util;
    use float_cmp::assert_approx_eq;

    fn get_fan_out_network() -> NetworkState {
        description::parse_network(
            "NEURON S0 50 0 0\n\
             NEURON O0 50 0 0\n\
             NEURON O1 50 0 0\n\
             CONNECTION S0 O0 60\n\
             CONNECTION S0 O1 60\n",
        )
        .unwrap()
    }

    fn get_hebbian_params(learning_rate: f32) -> TrainingParams {
        TrainingParams {
            learning_rate,
            learning_rule: LearningRule::Hebbian(HebbianParams::default()),
            ..TrainingParams::default()
        }
    }

    fn get_episode(target_id: &str) -> Episode {
        test_util::get_constant_input_episode(&[("S0", 100.0)], 60, target_id)
    }

    #[test]
    fn hebbian_learns_target() {
        let mut trainer = Trainer::new(get_fan_out_network(), get_hebbian_params(2.0)).unwrap();
        let dataset = [get_episode("O1")];

        assert_eq!(
            trainer.evaluate(&dataset[0]).unwrap().winner.as_deref(),
            Some("O0")
        );

        let records = trainer.train(&dataset, 15).unwrap();

        assert_eq!(records.len(), 15);
        assert_eq!(trainer.history().epochs.len(), 15);
        assert_approx_eq!(f32, records[0].accuracy, 0.0);
        assert!(records.iter().all(|record| record.mean_loss.is_none()));

        let metrics = trainer.evaluate(&dataset[0]).unwrap();
        assert_eq!(metrics.winner.as_deref(), Some("O1"));
        assert!(trainer.network().weight("S0", "O0").unwrap() < 50.0);
        assert_approx_eq!(f32, trainer.network().weight("S0", "O1").unwrap(), 60.0);

        let dataset_metrics = trainer.evaluate_dataset(&dataset).unwrap();
        assert_approx_eq!(f32, dataset_metrics.accuracy, 1.0);
    }

    #[test]
    fn rejects_unknown_target() {
        let mut trainer = Trainer::new(get_fan_out_network(), get_hebbian_params(1.0)).unwrap();

        let result = trainer.train(&[get_episode("S0")], 1);
        assert_eq!(result.unwrap_err().as_str(), "unknown target id: S0");

        let result = trainer.train(&[get_episode("X1")], 1);
        assert_eq!(result.unwrap_err().as_str(), "unknown target id: X1");

        let result = trainer.train(&[], 1);
        assert_eq!(result.unwrap_err().as_str(), "empty dataset");
    }

    #[test]
    fn invalid_params() {
        let params = TrainingParams {
            batch_size: 0,
            ..TrainingParams::default()
        };

        let result = Trainer::new(get_fan_out_network(), params);
        assert_eq!(
            result.err().unwrap().as_str(),
            "invalid training parameters, batch_size must be strictly positive"
        );
    }

    #[test]
    fn checkpoint_and_revert() {
        let params = TrainingParams {
            checkpoint_params: CheckpointParams {
                enabled: true,
                max_checkpoints: 2,
                revert_on_drop: None,
            },
            ..get_hebbian_params(2.0)
        };

        let mut trainer = Trainer::new(get_fan_out_network(), params).unwrap();
        assert!(!trainer.revert_checkpoint().unwrap());

        trainer.train(&[get_episode("O1")], 3).unwrap();
        assert_eq!(trainer.num_checkpoints(), 2);

        let latest = trainer.network().genome();
        trainer.train(&[get_episode("O1")], 1).unwrap();
        assert_ne!(trainer.network().genome(), latest);

        assert!(trainer.revert_checkpoint().unwrap());
        assert!(trainer.revert_checkpoint().unwrap());
        assert_eq!(trainer.network().genome(), latest);
        assert!(!trainer.revert_checkpoint().unwrap());
    }

    #[test]
    fn revert_on_accuracy_drop() {
        // Contradictory targets for the same input push both output weights down until
        // neither output fires.
        let params = TrainingParams {
            batch_size: 2,
            checkpoint_params: CheckpointParams {
                enabled: true,
                max_checkpoints: 4,
                revert_on_drop: Some(RevertParams {
                    metric: RevertMetric::Accuracy,
                    drop: 0.2,
                }),
            },
            ..get_hebbian_params(20.0)
        };

        let dataset = [get_episode("O0"), get_episode("O1")];
        let mut trainer = Trainer::new(get_fan_out_network(), params).unwrap();
        let records = trainer.train(&dataset, 3).unwrap();

        assert!(!records[0].reverted);
        assert_approx_eq!(f32, records[0].post_epoch.as_ref().unwrap().accuracy, 0.5);
        assert!(records[1].reverted);
        assert_approx_eq!(f32, records[1].post_epoch.as_ref().unwrap().accuracy, 0.0);
        assert!(records[2].reverted);

        let weight = trainer.network().weight("S0", "O0").unwrap();
        assert!(weight > 50.0 && weight < 60.0);
        assert_approx_eq!(f32, trainer.evaluate_dataset(&dataset).unwrap().accuracy, 0.5);
    }

    #[test]
    fn oversized_batch_is_truncated() {
        let dataset = [get_episode("O1"), get_episode("O0")];
        let get_trainer = |batch_size| {
            let params = TrainingParams {
                batch_size,
                ..get_hebbian_params(2.0)
            };
            Trainer::new(get_fan_out_network(), params).unwrap()
        };

        let mut oversized = get_trainer(10);
        let oversized_records = oversized.train(&dataset, 1).unwrap();

        let mut single_batch = get_trainer(2);
        single_batch.train_batch(&dataset).unwrap();
        assert_eq!(oversized.network().genome(), single_batch.network().genome());
        assert_ne!(oversized.network().genome(), get_fan_out_network().genome());

        let mut exact = get_trainer(2);
        let exact_records = exact.train(&dataset, 1).unwrap();
        assert_eq!(oversized_records, exact_records);

        let oversized_records = oversized.train(&dataset, 3).unwrap();
        let exact_records = exact.train(&dataset, 3).unwrap();
        assert_eq!(oversized_records, exact_records);
        assert_eq!(oversized.network().genome(), exact.network().genome());
    }

    #[test]
    fn lr_schedule_restarts_per_call() {
        let params = TrainingParams {
            lr_schedule: LrSchedule::Cosine,
            ..get_hebbian_params(2.0)
        };

        let mut trainer = Trainer::new(get_fan_out_network(), params).unwrap();
        let dataset = [get_episode("O1")];

        for _ in 0..2 {
            let records = trainer.train(&dataset, 3).unwrap();

            assert_eq!(records.len(), 3);
            assert_approx_eq!(f32, records[0].learning_rate, 2.0, epsilon = 1e-6);
            assert_approx_eq!(f32, records[1].learning_rate, 1.01, epsilon = 1e-6);
            assert_approx_eq!(f32, records[2].learning_rate, 0.02, epsilon = 1e-6);
        }

        assert_eq!(trainer.history().epochs.len(), 6);
    }

    #[test]
    fn intrinsic_plasticity_tracks_rates() {
        let params = TrainingParams {
            learning_rule: LearningRule::Hebbian(HebbianParams {
                intrinsic_params: Some(IntrinsicParams {
                    eta_threshold: 1.0,
                    eta_leak: 0.0,
                    target_rate: 0.0,
                }),
                ..HebbianParams::default()
            }),
            ..get_hebbian_params(1.0)
        };

        let mut trainer = Trainer::new(get_fan_out_network(), params).unwrap();
        trainer.train(&[get_episode("O0")], 1).unwrap();

        let rates = trainer.network().thresholds().iter().map(|threshold| threshold - 50.0);

        for rate in rates {
            assert!(rate > 0.9 && rate < 1.0);
        }

        assert!(trainer.network().leaks().iter().all(|leak| *leak == 0.0));
    }

    #[test]
    fn history_serializes() {
        let mut trainer = Trainer::new(get_fan_out_network(), get_hebbian_params(1.0)).unwrap();
        trainer.train(&[get_episode("O0")], 2).unwrap();

        let json = trainer.history().to_json().unwrap();
        let history: TrainingHistory = serde_json::from_str(&json).unwrap();
        assert_eq!(&history, trainer.history());
    }
}
