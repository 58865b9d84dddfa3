use serde::{Deserialize, Serialize};
use simple_error::SimpleError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeuronParams {
    pub threshold: f32,
    pub leak: f32,
    pub resting: f32,
    pub refractory_period: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EvidenceMode {
    SpikeCount,
    FiringRate { alpha: f32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionParams {
    pub warmup_ticks: usize,
    pub decision_window: usize,
    pub evidence_mode: EvidenceMode,
    pub output_ids: Option<Vec<String>>,
    pub default_output: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OptimizerParams {
    Sgd {
        momentum: f32,
    },
    Adam {
        beta1: f32,
        beta2: f32,
        epsilon: f32,
    },
    AdamW {
        beta1: f32,
        beta2: f32,
        epsilon: f32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LrSchedule {
    Constant,
    Cosine,
    StepDecay,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradientParams {
    pub surrogate_beta: f32,
    pub temperature: f32,
    pub optimizer: OptimizerParams,
    pub weight_decay: f32,
    pub clip_grad_norm: Option<f32>,
    pub weight_clip: Option<f32>,
    pub train_thresholds: bool,
    pub train_leaks: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RewardMode {
    Binary { reward_pos: f32, reward_neg: f32 },
    MarginLinear { gain: f32, min: f32, max: f32 },
    /// `sigmoid(gain * (margin_delta - target_margin))`, clamped only if `min < max`.
    SoftplusMargin { gain: f32, min: f32, max: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum UpdateGating {
    All,
    WinnerOnly,
    TargetOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntrinsicParams {
    pub eta_threshold: f32,
    pub eta_leak: f32,
    pub target_rate: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HebbianParams {
    pub trace_decay: f32,
    pub rate_alpha: f32,
    pub eligibility_post_rate: bool,
    pub reward_mode: RewardMode,
    pub margin_delta: f32,
    pub baseline_beta: Option<f32>,
    pub no_update_if_satisfied: bool,
    pub update_gating: UpdateGating,
    pub intrinsic_params: Option<IntrinsicParams>,
    pub weight_decay: f32,
    pub weight_clip: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LearningRule {
    Hebbian(HebbianParams),
    Gradient(GradientParams),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RevertMetric {
    Accuracy,
    Margin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevertParams {
    pub metric: RevertMetric,
    pub drop: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointParams {
    pub enabled: bool,
    pub max_checkpoints: usize,
    pub revert_on_drop: Option<RevertParams>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingParams {
    pub learning_rate: f32,
    pub batch_size: usize,
    pub shuffle: bool,
    pub lr_schedule: LrSchedule,
    pub decision_params: DecisionParams,
    pub learning_rule: LearningRule,
    pub checkpoint_params: CheckpointParams,
    pub technical_params: TechnicalParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationParams {
    pub sigma_weight: f32,
    pub sigma_threshold: f32,
    pub sigma_leak: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitnessWeights {
    pub accuracy: f64,
    pub margin: f64,
    pub sparsity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionParams {
    pub population_size: usize,
    pub num_generations: usize,
    pub num_elites: usize,
    pub parents_pool: usize,
    pub train_epochs: usize,
    pub lamarckian: bool,
    pub mutation_params: MutationParams,
    pub fitness_weights: FitnessWeights,
    pub technical_params: TechnicalParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechnicalParams {
    pub num_threads: Option<usize>,
    pub pin_threads: bool,
    pub seed_override: Option<u64>,
}

impl Default for NeuronParams {
    fn default() -> Self {
        Self {
            threshold: 50.0,
            leak: 1.0,
            resting: 0.0,
            refractory_period: 0,
        }
    }
}

impl Default for DecisionParams {
    fn default() -> Self {
        Self {
            warmup_ticks: 10,
            decision_window: 50,
            evidence_mode: EvidenceMode::SpikeCount,
            output_ids: None,
            default_output: None,
        }
    }
}

impl OptimizerParams {
    pub fn from_name(name: &str) -> Result<Self, SimpleError> {
        match name.to_ascii_lowercase().as_str() {
            "sgd" => Ok(Self::Sgd { momentum: 0.9 }),
            "adam" => Ok(Self::Adam {
                beta1: 0.9,
                beta2: 0.999,
                epsilon: 1e-8,
            }),
            "adamw" => Ok(Self::AdamW {
                beta1: 0.9,
                beta2: 0.999,
                epsilon: 1e-8,
            }),
            _ => Err(SimpleError::new(format!("unknown optimizer: {}", name))),
        }
    }
}

impl Default for OptimizerParams {
    fn default() -> Self {
        Self::Adam {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

impl Default for GradientParams {
    fn default() -> Self {
        Self {
            surrogate_beta: 0.2,
            temperature: 0.1,
            optimizer: OptimizerParams::default(),
            weight_decay: 0.0,
            clip_grad_norm: None,
            weight_clip: None,
            train_thresholds: false,
            train_leaks: false,
        }
    }
}

impl Default for HebbianParams {
    fn default() -> Self {
        Self {
            trace_decay: 0.95,
            rate_alpha: 0.05,
            eligibility_post_rate: false,
            reward_mode: RewardMode::Binary {
                reward_pos: 1.0,
                reward_neg: -1.0,
            },
            margin_delta: 0.1,
            baseline_beta: None,
            no_update_if_satisfied: true,
            update_gating: UpdateGating::All,
            intrinsic_params: None,
            weight_decay: 0.0,
            weight_clip: None,
        }
    }
}

impl Default for LearningRule {
    fn default() -> Self {
        Self::Gradient(GradientParams::default())
    }
}

impl Default for CheckpointParams {
    fn default() -> Self {
        Self {
            enabled: false,
            max_checkpoints: 4,
            revert_on_drop: None,
        }
    }
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            batch_size: 1,
            shuffle: false,
            lr_schedule: LrSchedule::Constant,
            decision_params: DecisionParams::default(),
            learning_rule: LearningRule::default(),
            checkpoint_params: CheckpointParams::default(),
            technical_params: TechnicalParams::default(),
        }
    }
}

impl Default for MutationParams {
    fn default() -> Self {
        Self {
            sigma_weight: 0.05,
            sigma_threshold: 0.0,
            sigma_leak: 0.0,
        }
    }
}

impl Default for FitnessWeights {
    fn default() -> Self {
        Self {
            accuracy: 1.0,
            margin: 0.5,
            sparsity: 0.0,
        }
    }
}

impl Default for EvolutionParams {
    fn default() -> Self {
        Self {
            population_size: 8,
            num_generations: 10,
            num_elites: 2,
            parents_pool: 4,
            train_epochs: 3,
            lamarckian: true,
            mutation_params: MutationParams::default(),
            fitness_weights: FitnessWeights::default(),
            technical_params: TechnicalParams::default(),
        }
    }
}

impl Default for TechnicalParams {
    fn default() -> Self {
        Self {
            num_threads: Some(1),
            pin_threads: false,
            seed_override: None,
        }
    }
}

impl TechnicalParams {
    pub fn seed(&self) -> u64 {
        self.seed_override.unwrap_or(0)
    }
}

pub fn validate_neuron_params(neuron_params: &NeuronParams) -> Result<(), SimpleError> {
    if !neuron_params.threshold.is_finite() {
        return Err(SimpleError::new("threshold must be finite"));
    }

    if !(0.0..=1.0).contains(&neuron_params.leak) {
        return Err(SimpleError::new("leak must be in [0, 1]"));
    }

    if !neuron_params.resting.is_finite() || neuron_params.resting < 0.0 {
        return Err(SimpleError::new(
            "resting must be finite and not negative",
        ));
    }

    Ok(())
}

pub fn validate_decision_params(decision_params: &DecisionParams) -> Result<(), SimpleError> {
    if decision_params.decision_window == 0 {
        return Err(SimpleError::new(
            "decision_window must be strictly positive",
        ));
    }

    if let EvidenceMode::FiringRate { alpha } = decision_params.evidence_mode {
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(SimpleError::new("alpha must be in (0, 1]"));
        }
    }

    if let Some(output_ids) = &decision_params.output_ids {
        if output_ids.is_empty() {
            return Err(SimpleError::new("output_ids must not be empty"));
        }
    }

    Ok(())
}

pub fn validate_training_params(training_params: &TrainingParams) -> Result<(), SimpleError> {
    if !(training_params.learning_rate > 0.0) || !training_params.learning_rate.is_finite() {
        return Err(SimpleError::new("learning_rate must be strictly positive"));
    }

    if training_params.batch_size == 0 {
        return Err(SimpleError::new("batch_size must be strictly positive"));
    }

    validate_decision_params(&training_params.decision_params)?;

    match &training_params.learning_rule {
        LearningRule::Hebbian(hebbian_params) => validate_hebbian_params(hebbian_params)?,
        LearningRule::Gradient(gradient_params) => validate_gradient_params(gradient_params)?,
    }

    validate_checkpoint_params(&training_params.checkpoint_params)?;
    validate_technical_params(&training_params.technical_params)?;

    Ok(())
}

pub fn validate_evolution_params(evolution_params: &EvolutionParams) -> Result<(), SimpleError> {
    if evolution_params.population_size == 0 {
        return Err(SimpleError::new(
            "population_size must be strictly positive",
        ));
    }

    if evolution_params.num_generations == 0 {
        return Err(SimpleError::new(
            "num_generations must be strictly positive",
        ));
    }

    if evolution_params.num_elites > evolution_params.population_size {
        return Err(SimpleError::new(
            "num_elites must not be greater than population_size",
        ));
    }

    if evolution_params.parents_pool == 0
        || evolution_params.parents_pool > evolution_params.population_size
    {
        return Err(SimpleError::new(
            "parents_pool must be in [1, population_size]",
        ));
    }

    let mutation_params = &evolution_params.mutation_params;

    for (name, sigma) in [
        ("sigma_weight", mutation_params.sigma_weight),
        ("sigma_threshold", mutation_params.sigma_threshold),
        ("sigma_leak", mutation_params.sigma_leak),
    ] {
        if !(sigma >= 0.0) || !sigma.is_finite() {
            return Err(SimpleError::new(format!(
                "{} must be finite and not negative",
                name
            )));
        }
    }

    let fitness_weights = &evolution_params.fitness_weights;

    for (name, weight) in [
        ("accuracy", fitness_weights.accuracy),
        ("margin", fitness_weights.margin),
        ("sparsity", fitness_weights.sparsity),
    ] {
        if !(weight >= 0.0) || !weight.is_finite() {
            return Err(SimpleError::new(format!(
                "fitness weight {} must be finite and not negative",
                name
            )));
        }
    }

    validate_technical_params(&evolution_params.technical_params)?;

    Ok(())
}

fn validate_gradient_params(gradient_params: &GradientParams) -> Result<(), SimpleError> {
    if !(gradient_params.surrogate_beta > 0.0) || !gradient_params.surrogate_beta.is_finite() {
        return Err(SimpleError::new("surrogate_beta must be strictly positive"));
    }

    if !(gradient_params.temperature > 0.0) || !gradient_params.temperature.is_finite() {
        return Err(SimpleError::new("temperature must be strictly positive"));
    }

    if !(gradient_params.weight_decay >= 0.0) || !gradient_params.weight_decay.is_finite() {
        return Err(SimpleError::new("weight_decay must not be negative"));
    }

    if let Some(clip_grad_norm) = gradient_params.clip_grad_norm {
        if !(clip_grad_norm > 0.0) || !clip_grad_norm.is_finite() {
            return Err(SimpleError::new("clip_grad_norm must be strictly positive"));
        }
    }

    validate_weight_clip(gradient_params.weight_clip)?;
    validate_optimizer_params(&gradient_params.optimizer)?;

    Ok(())
}

fn validate_optimizer_params(optimizer_params: &OptimizerParams) -> Result<(), SimpleError> {
    match *optimizer_params {
        OptimizerParams::Sgd { momentum } => {
            if !(0.0..1.0).contains(&momentum) {
                return Err(SimpleError::new("momentum must be in [0, 1)"));
            }
        }
        OptimizerParams::Adam {
            beta1,
            beta2,
            epsilon,
        }
        | OptimizerParams::AdamW {
            beta1,
            beta2,
            epsilon,
        } => {
            if !(0.0..1.0).contains(&beta1) || !(0.0..1.0).contains(&beta2) {
                return Err(SimpleError::new("beta1 and beta2 must be in [0, 1)"));
            }

            if !(epsilon > 0.0) || !epsilon.is_finite() {
                return Err(SimpleError::new("epsilon must be strictly positive"));
            }
        }
    }

    Ok(())
}

fn validate_hebbian_params(hebbian_params: &HebbianParams) -> Result<(), SimpleError> {
    if !(0.0..1.0).contains(&hebbian_params.trace_decay) {
        return Err(SimpleError::new("trace_decay must be in [0, 1)"));
    }

    if !(hebbian_params.rate_alpha > 0.0 && hebbian_params.rate_alpha <= 1.0) {
        return Err(SimpleError::new("rate_alpha must be in (0, 1]"));
    }

    if !(hebbian_params.margin_delta >= 0.0) || !hebbian_params.margin_delta.is_finite() {
        return Err(SimpleError::new("margin_delta must not be negative"));
    }

    if let Some(baseline_beta) = hebbian_params.baseline_beta {
        if !(baseline_beta > 0.0 && baseline_beta <= 1.0) {
            return Err(SimpleError::new("baseline_beta must be in (0, 1]"));
        }
    }

    match hebbian_params.reward_mode {
        RewardMode::Binary {
            reward_pos,
            reward_neg,
        } => {
            if !reward_pos.is_finite() || !reward_neg.is_finite() {
                return Err(SimpleError::new("reward_mode: rewards must be finite"));
            }
        }
        RewardMode::MarginLinear { gain, min, max } => {
            if !gain.is_finite() || !min.is_finite() || !max.is_finite() {
                return Err(SimpleError::new("reward_mode: values must be finite"));
            }

            if min > max {
                return Err(SimpleError::new(
                    "reward_mode: min must not be greater than max",
                ));
            }
        }
        RewardMode::SoftplusMargin { gain, min, max } => {
            if !gain.is_finite() || !min.is_finite() || !max.is_finite() {
                return Err(SimpleError::new("reward_mode: values must be finite"));
            }
        }
    }

    if let Some(intrinsic_params) = &hebbian_params.intrinsic_params {
        if !intrinsic_params.eta_threshold.is_finite() || !intrinsic_params.eta_leak.is_finite() {
            return Err(SimpleError::new("intrinsic_params: eta must be finite"));
        }

        if !(0.0..=1.0).contains(&intrinsic_params.target_rate) {
            return Err(SimpleError::new(
                "intrinsic_params: target_rate must be in [0, 1]",
            ));
        }
    }

    if !(hebbian_params.weight_decay >= 0.0) || !hebbian_params.weight_decay.is_finite() {
        return Err(SimpleError::new("weight_decay must not be negative"));
    }

    validate_weight_clip(hebbian_params.weight_clip)?;

    Ok(())
}

fn validate_weight_clip(weight_clip: Option<f32>) -> Result<(), SimpleError> {
    if let Some(weight_clip) = weight_clip {
        if !(weight_clip > 0.0) || !weight_clip.is_finite() {
            return Err(SimpleError::new("weight_clip must be strictly positive"));
        }
    }

    Ok(())
}

fn validate_checkpoint_params(checkpoint_params: &CheckpointParams) -> Result<(), SimpleError> {
    if checkpoint_params.enabled && checkpoint_params.max_checkpoints == 0 {
        return Err(SimpleError::new(
            "max_checkpoints must be strictly positive",
        ));
    }

    if let Some(revert_params) = &checkpoint_params.revert_on_drop {
        if !checkpoint_params.enabled {
            return Err(SimpleError::new(
                "revert_on_drop requires checkpoints to be enabled",
            ));
        }

        if !(revert_params.drop > 0.0) || !revert_params.drop.is_finite() {
            return Err(SimpleError::new("drop must be strictly positive"));
        }
    }

    Ok(())
}

fn validate_technical_params(technical_parms: &TechnicalParams) -> Result<(), SimpleError> {
    if let Some(num_threads) = technical_parms.num_threads {
        if num_threads == 0 {
            return Err(SimpleError::new("num_threads must be strictly positive"));
        }

        if num_cpus::get() < num_threads {
            return Err(SimpleError::new(
                "num_threads must not be greater than number of available CPUs",
            ));
        }
    }

    Ok(())
}
