use crate::genome::Genome;
use crate::network::NetworkState;
use crate::params::{self, EvolutionParams, FitnessWeights, TrainingParams};
use crate::pool::{Job, WorkerPool};
use crate::readout::{self, DatasetMetrics, Readout};
use crate::sequence::{self, CompiledEpisode, Episode};
use crate::trainer::Trainer;
use crate::util;
use itertools::Itertools;
use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use simple_error::{try_with, SimpleError, SimpleResult};
use statrs::statistics::{Data, Median, Statistics};
use std::cmp::Ordering;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub generation: usize,
    /// Statistics over the successfully evaluated members; `None` if every member failed.
    pub best_fitness: Option<f64>,
    pub best_accuracy: Option<f32>,
    pub best_margin: Option<f32>,
    pub mean_fitness: Option<f64>,
    pub median_fitness: Option<f64>,
    pub num_failures: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageRecord {
    pub id: usize,
    pub parent_id: Option<usize>,
    pub generation: usize,
    pub fitness: Option<f64>,
    pub accuracy: Option<f32>,
    pub margin: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionResult {
    pub best_id: usize,
    pub best_generation: usize,
    pub best_fitness: f64,
    pub best_metrics: DatasetMetrics,
    pub best_genome: Genome,
    pub history: Vec<GenerationRecord>,
    pub lineage: Vec<LineageRecord>,
}

impl EvolutionResult {
    pub fn to_json(&self) -> SimpleResult<String> {
        Ok(try_with!(
            serde_json::to_string_pretty(self),
            "failed to serialize evolution result"
        ))
    }

    pub fn lineage_json(&self) -> SimpleResult<String> {
        Ok(try_with!(
            serde_json::to_string_pretty(&self.lineage),
            "failed to serialize lineage"
        ))
    }
}

#[derive(Debug, Clone)]
struct Evaluation {
    genome: Genome,
    metrics: DatasetMetrics,
    fitness: f64,
}

#[derive(Debug, Clone)]
struct Member {
    id: usize,
    parent_id: Option<usize>,
    genome: Genome,
    evaluation: Option<Evaluation>,
    failed: bool,
}

impl Member {
    fn fitness(&self) -> f64 {
        match &self.evaluation {
            Some(evaluation) => evaluation.fitness,
            None => f64::NEG_INFINITY,
        }
    }
}

struct EvaluationContext {
    network: NetworkState,
    train_set: Vec<Episode>,
    validation_set: Vec<Episode>,
    training_params: TrainingParams,
    train_epochs: usize,
    lamarckian: bool,
    fitness_weights: FitnessWeights,
    seed: u64,
}

struct EvaluationJob {
    context: Arc<EvaluationContext>,
    generation: usize,
    members: Vec<(usize, Genome)>,
}

impl Job for EvaluationJob {
    fn num_items(&self) -> usize {
        self.members.len()
    }
}

pub struct EvolutionEngine {
    network: NetworkState,
    train_set: Vec<Episode>,
    validation_set: Vec<Episode>,
    training_params: TrainingParams,
    evolution_params: EvolutionParams,
}

impl EvolutionEngine {
    pub fn new(
        network: NetworkState,
        train_set: Vec<Episode>,
        validation_set: Vec<Episode>,
        training_params: TrainingParams,
        evolution_params: EvolutionParams,
    ) -> SimpleResult<Self> {
        try_with!(
            params::validate_evolution_params(&evolution_params),
            "invalid evolution parameters"
        );

        try_with!(
            params::validate_training_params(&training_params),
            "invalid training parameters"
        );

        if validation_set.is_empty() {
            return Err(SimpleError::new("empty validation set"));
        }

        if evolution_params.lamarckian && evolution_params.train_epochs > 0 && train_set.is_empty()
        {
            return Err(SimpleError::new("empty training set"));
        }

        let readout = Readout::new(&network, &training_params.decision_params)?;

        for episodes in [&train_set, &validation_set] {
            for episode in sequence::compile_episodes(&network, episodes)? {
                readout.target_position(&episode)?;
            }
        }

        Ok(Self {
            network,
            train_set,
            validation_set,
            training_params,
            evolution_params,
        })
    }

    pub fn run(&self) -> SimpleResult<EvolutionResult> {
        let seed = self.evolution_params.technical_params.seed();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut next_id = 0;
        let population = self.initial_population(&mut rng, &mut next_id)?;

        self.evolve(population, rng, next_id)
    }

    fn evolve(
        &self,
        mut population: Vec<Member>,
        mut rng: StdRng,
        mut next_id: usize,
    ) -> SimpleResult<EvolutionResult> {
        let evolution_params = &self.evolution_params;
        let seed = evolution_params.technical_params.seed();

        let context = Arc::new(EvaluationContext {
            network: self.network.clone(),
            train_set: self.train_set.clone(),
            validation_set: self.validation_set.clone(),
            training_params: self.training_params.clone(),
            train_epochs: evolution_params.train_epochs,
            lamarckian: evolution_params.lamarckian,
            fitness_weights: evolution_params.fitness_weights.clone(),
            seed,
        });

        let mut pool = WorkerPool::new(&evolution_params.technical_params, evaluate_member);

        let mut best: Option<(Member, usize)> = None;
        let mut history = Vec::with_capacity(evolution_params.num_generations);
        let mut lineage = Vec::new();

        for generation in 0..evolution_params.num_generations {
            evaluate_population(&mut pool, &context, generation, &mut population)?;

            lineage.extend(population.iter().map(|member| LineageRecord {
                id: member.id,
                parent_id: member.parent_id,
                generation,
                fitness: member.evaluation.as_ref().map(|evaluation| evaluation.fitness),
                accuracy: member
                    .evaluation
                    .as_ref()
                    .map(|evaluation| evaluation.metrics.accuracy),
                margin: member
                    .evaluation
                    .as_ref()
                    .map(|evaluation| evaluation.metrics.margin),
            }));

            let ranking = rank(&population);
            let record = generation_record(generation, &population, &ranking);

            info!(
                "generation {}: best fitness {:?}, mean {:?}, median {:?}, {} failures",
                generation,
                record.best_fitness,
                record.mean_fitness,
                record.median_fitness,
                record.num_failures
            );

            history.push(record);

            let leader = &population[ranking[0]];

            if leader.evaluation.is_some() {
                let improved = match &best {
                    Some((best_member, _)) => leader.fitness() > best_member.fitness(),
                    None => true,
                };

                if improved {
                    best = Some((leader.clone(), generation));
                }
            }

            if generation + 1 < evolution_params.num_generations {
                population = self.next_population(&population, &ranking, &mut rng, &mut next_id)?;
            }
        }

        let (best_member, best_generation) =
            best.ok_or_else(|| SimpleError::new("no genome was evaluated successfully"))?;

        let best_evaluation = best_member
            .evaluation
            .ok_or_else(|| SimpleError::new("no genome was evaluated successfully"))?;

        Ok(EvolutionResult {
            best_id: best_member.id,
            best_generation,
            best_fitness: best_evaluation.fitness,
            best_metrics: best_evaluation.metrics,
            best_genome: best_member.genome,
            history,
            lineage,
        })
    }

    fn initial_population(&self, rng: &mut StdRng, next_id: &mut usize) -> SimpleResult<Vec<Member>> {
        let baseline = self.network.genome();
        let population_size = self.evolution_params.population_size;
        let mut population = Vec::with_capacity(population_size);

        population.push(new_member(next_id, None, baseline.clone()));

        for _ in 1..population_size {
            let mut genome = baseline.clone();
            let rejected = genome.mutate(&self.evolution_params.mutation_params, rng)?;
            log_rejections(rejected);
            population.push(new_member(next_id, Some(0), genome));
        }

        Ok(population)
    }

    fn next_population(
        &self,
        population: &[Member],
        ranking: &[usize],
        rng: &mut StdRng,
        next_id: &mut usize,
    ) -> SimpleResult<Vec<Member>> {
        let evolution_params = &self.evolution_params;
        let mut next = Vec::with_capacity(evolution_params.population_size);

        for elite in ranking
            .iter()
            .map(|idx| &population[*idx])
            .filter(|member| member.evaluation.is_some())
            .take(evolution_params.num_elites)
        {
            next.push(Member {
                evaluation: elite.evaluation.clone(),
                ..new_member(next_id, Some(elite.id), elite.genome.clone())
            });
        }

        let top = &ranking[..evolution_params.parents_pool];
        let evaluated_parents: Vec<usize> = top
            .iter()
            .copied()
            .filter(|idx| population[*idx].evaluation.is_some())
            .collect();

        let parents = if evaluated_parents.is_empty() {
            top.to_vec()
        } else {
            evaluated_parents
        };

        while next.len() < evolution_params.population_size {
            let parent = &population[parents[rng.gen_range(0..parents.len())]];
            let mut genome = parent.genome.clone();
            let rejected = genome.mutate(&evolution_params.mutation_params, rng)?;
            log_rejections(rejected);
            next.push(new_member(next_id, Some(parent.id), genome));
        }

        Ok(next)
    }
}

fn new_member(next_id: &mut usize, parent_id: Option<usize>, genome: Genome) -> Member {
    let id = *next_id;
    *next_id += 1;

    Member {
        id,
        parent_id,
        genome,
        evaluation: None,
        failed: false,
    }
}

fn log_rejections(rejected: usize) {
    if rejected > 0 {
        warn!("mutation rejected {} non-finite values", rejected);
    }
}

fn evaluate_population(
    pool: &mut WorkerPool<EvaluationJob, Evaluation>,
    context: &Arc<EvaluationContext>,
    generation: usize,
    population: &mut [Member],
) -> SimpleResult<()> {
    let pending: Vec<usize> = population
        .iter()
        .enumerate()
        .filter(|(_, member)| member.evaluation.is_none())
        .map(|(idx, _)| idx)
        .collect();

    let job = EvaluationJob {
        context: Arc::clone(context),
        generation,
        members: pending
            .iter()
            .map(|idx| (population[*idx].id, population[*idx].genome.clone()))
            .collect(),
    };

    for (idx, result) in pending.into_iter().zip(pool.run(job)?) {
        let member = &mut population[idx];

        match result {
            Ok(evaluation) => {
                member.genome = evaluation.genome.clone();
                member.evaluation = Some(evaluation);
            }
            Err(err) => {
                warn!(
                    "generation {}: evaluation of genome {} failed: {}",
                    generation, member.id, err
                );
                member.failed = true;
            }
        }
    }

    Ok(())
}

fn evaluate_member(job: &EvaluationJob, item_idx: usize) -> SimpleResult<Evaluation> {
    let context = &job.context;
    let (member_id, genome) = &job.members[item_idx];

    let mut network = context.network.clone();
    network.apply_genome(genome)?;

    if context.lamarckian && context.train_epochs > 0 {
        let mut training_params = context.training_params.clone();
        training_params.technical_params.num_threads = Some(1);
        training_params.technical_params.pin_threads = false;
        training_params.technical_params.seed_override = Some(util::calculate_hash(&(
            context.seed,
            job.generation,
            *member_id,
        )));

        let mut trainer = Trainer::new(network, training_params)?;
        trainer.train(&context.train_set, context.train_epochs)?;
        network = trainer.into_network();
    }

    let readout = Readout::new(&network, &context.training_params.decision_params)?;
    let validation_set: Vec<CompiledEpisode> =
        sequence::compile_episodes(&network, &context.validation_set)?;
    let metrics = readout::evaluate_episodes(&network, &readout, &validation_set)?;

    let genome = network.genome();
    let fitness = compute_fitness(&context.fitness_weights, &metrics, &genome);

    Ok(Evaluation {
        genome,
        metrics,
        fitness,
    })
}

fn compute_fitness(weights: &FitnessWeights, metrics: &DatasetMetrics, genome: &Genome) -> f64 {
    weights.accuracy * metrics.accuracy as f64 + weights.margin * metrics.margin as f64
        - weights.sparsity * genome.nonzero_weight_fraction()
}

/// Population indices by descending fitness. Ties keep population order.
fn rank(population: &[Member]) -> Vec<usize> {
    (0..population.len())
        .sorted_by(|a, b| {
            population[*b]
                .fitness()
                .partial_cmp(&population[*a].fitness())
                .unwrap_or(Ordering::Equal)
        })
        .collect()
}

fn generation_record(generation: usize, population: &[Member], ranking: &[usize]) -> GenerationRecord {
    let fitnesses: Vec<f64> = population
        .iter()
        .filter_map(|member| member.evaluation.as_ref())
        .map(|evaluation| evaluation.fitness)
        .collect();

    let num_failures = population.iter().filter(|member| member.failed).count();
    let leader = population[ranking[0]].evaluation.as_ref();

    let (mean_fitness, median_fitness) = if fitnesses.is_empty() {
        (None, None)
    } else {
        let mean = fitnesses.iter().mean();
        let median = Data::new(fitnesses.clone()).median();
        (Some(mean), Some(median))
    };

    GenerationRecord {
        generation,
        best_fitness: leader.map(|evaluation| evaluation.fitness),
        best_accuracy: leader.map(|evaluation| evaluation.metrics.accuracy),
        best_margin: leader.map(|evaluation| evaluation.metrics.margin),
        mean_fitness,
        median_fitness,
        num_failures,
    }
}
