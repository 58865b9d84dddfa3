use glia::network::NetworkState;
use glia::params::{NeuronParams, TrainingParams};
use rand::{distributions::Uniform, prelude::Distribution, rngs::StdRng, Rng, SeedableRng};

pub const NUM_SENSORY: usize = 100;
pub const NUM_HIDDEN: usize = 800;
pub const NUM_OUTPUTS: usize = 10;

pub fn get_training_params() -> TrainingParams {
    let params_yaml_str = r#"
learning_rate: 0.05
batch_size: 4
shuffle: true
lr_schedule: Cosine
decision_params:
  warmup_ticks: 10
  decision_window: 40
  evidence_mode: SpikeCount
  output_ids: null
  default_output: null
learning_rule: !Gradient
  surrogate_beta: 0.2
  temperature: 0.1
  optimizer: !AdamW
    beta1: 0.9
    beta2: 0.999
    epsilon: 1.0e-8
  weight_decay: 0.001
  clip_grad_norm: 5.0
  weight_clip: 100.0
  train_thresholds: false
  train_leaks: false
checkpoint_params:
  enabled: true
  max_checkpoints: 4
  revert_on_drop: null
technical_params:
  num_threads: 1
  pin_threads: false
  seed_override: 0
"#;

    serde_yaml::from_str(params_yaml_str).unwrap()
}

/// Sensory neurons project onto a recurrent hidden pool, which projects onto the outputs.
pub fn build_network(seed: u64) -> NetworkState {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut network = NetworkState::new();

    let sensory_params = NeuronParams {
        threshold: 1.0,
        leak: 0.0,
        ..NeuronParams::default()
    };

    let hidden_params = NeuronParams {
        threshold: 20.0,
        leak: 0.9,
        refractory_period: 3,
        ..NeuronParams::default()
    };

    let output_params = NeuronParams {
        threshold: 20.0,
        leak: 0.8,
        refractory_period: 2,
        ..NeuronParams::default()
    };

    let sensory_ids: Vec<String> = (0..NUM_SENSORY).map(|idx| format!("S{}", idx)).collect();
    let hidden_ids: Vec<String> = (0..NUM_HIDDEN).map(|idx| format!("H{}", idx)).collect();
    let output_ids: Vec<String> = (0..NUM_OUTPUTS).map(|idx| format!("O{}", idx)).collect();

    for id in &sensory_ids {
        network.add_neuron(id, &sensory_params).unwrap();
    }

    for id in &hidden_ids {
        network.add_neuron(id, &hidden_params).unwrap();
    }

    for id in &output_ids {
        network.add_neuron(id, &output_params).unwrap();
    }

    let excitatory = Uniform::new(2.0, 12.0);
    let inhibitory = Uniform::new(-10.0, -2.0);

    let mut connect = |pre_ids: &[String], post_ids: &[String], density: f64, inhibitory_share| {
        for pre_id in pre_ids {
            for post_id in post_ids {
                if rng.gen_bool(density) {
                    let weight = if rng.gen_bool(inhibitory_share) {
                        inhibitory.sample(&mut rng)
                    } else {
                        excitatory.sample(&mut rng)
                    };

                    network.add_connection(pre_id, post_id, weight).unwrap();
                }
            }
        }
    };

    connect(&sensory_ids, &hidden_ids, 0.1, 0.0);
    connect(&hidden_ids, &hidden_ids, 0.02, 0.2);
    connect(&hidden_ids, &output_ids, 0.1, 0.2);

    network
}
