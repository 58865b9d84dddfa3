use float_cmp::assert_approx_eq;
use itertools::{assert_equal, Itertools};
use glia::{
    description,
    engine::{SimulationEngine, SpikeMode},
    evolution::EvolutionEngine,
    network::NetworkState,
    params::{
        DecisionParams, EvolutionParams, GradientParams, LearningRule, MutationParams,
        OptimizerParams, TechnicalParams, TrainingParams,
    },
    readout::Readout,
    sequence::{CompiledEpisode, Episode, InputSequence},
    trainer::Trainer,
};

const WTA_NETWORK: &str = r#"
# two sensory inputs, one inhibitory interneuron, three outputs
NEURON S0 50 1.0 0
NEURON S1 50 1.0 0
NEURON I0 40 0.8 0
NEURON O0 50 1.0 0
NEURON O1 50 1.0 0
NEURON O2 50 1.0 0
CONNECTION S0 O0 60
CONNECTION S1 O1 60
CONNECTION S0 O2 30
CONNECTION S1 O2 30
CONNECTION O0 I0 60
CONNECTION O1 I0 60
CONNECTION O2 I0 60
CONNECTION I0 O0 -45
CONNECTION I0 O1 -45
CONNECTION I0 O2 -45
"#;

// H0 needs both inputs to fire; its route to N3 starts out silent.
const XOR_NETWORK: &str = r#"
NEURON S0 50 0 0
NEURON S1 50 0 0
NEURON H0 50 0 0
NEURON N2 50 0 0
NEURON N3 50 0 0
CONNECTION S0 H0 30
CONNECTION S0 N3 40
CONNECTION S0 N2 10
CONNECTION S1 H0 30
CONNECTION S1 N3 40
CONNECTION S1 N2 10
CONNECTION H0 N3 0
CONNECTION H0 N2 10
"#;

fn constant_episode(injections: &[(&str, f32)], target_id: &str) -> Episode {
    Episode::new(InputSequence::constant(injections, 60), target_id)
}

fn run_wta(injections: &[(&str, f32)]) -> glia::readout::EpisodeMetrics {
    let network = description::parse_network(WTA_NETWORK).unwrap();
    let readout = Readout::new(&network, &DecisionParams::default()).unwrap();
    let episode = CompiledEpisode::compile(&network, &constant_episode(injections, "O0")).unwrap();
    let mut engine = SimulationEngine::new(&network, SpikeMode::Eval);

    readout.run_episode(&mut engine, &episode).unwrap()
}

fn xor_dataset() -> Vec<Episode> {
    vec![
        constant_episode(&[], "N2"),
        constant_episode(&[("S0", 100.0)], "N3"),
        constant_episode(&[("S1", 100.0)], "N3"),
        constant_episode(&[("S0", 100.0), ("S1", 100.0)], "N2"),
    ]
}

fn xor_training_params(num_threads: usize) -> TrainingParams {
    TrainingParams {
        learning_rate: 1.0,
        batch_size: 4,
        decision_params: DecisionParams {
            output_ids: Some(vec!["N2".to_string(), "N3".to_string()]),
            default_output: Some("N2".to_string()),
            ..DecisionParams::default()
        },
        learning_rule: LearningRule::Gradient(GradientParams {
            surrogate_beta: 0.2,
            temperature: 0.1,
            optimizer: OptimizerParams::from_name("adam").unwrap(),
            ..GradientParams::default()
        }),
        technical_params: TechnicalParams {
            num_threads: Some(num_threads),
            ..TechnicalParams::default()
        },
        ..TrainingParams::default()
    }
}

fn xor_network() -> NetworkState {
    description::parse_network(XOR_NETWORK).unwrap()
}

#[test]
fn no_spontaneous_activity() {
    let network = description::parse_network(WTA_NETWORK).unwrap();
    let mut engine = SimulationEngine::new(&network, SpikeMode::Eval);

    for _ in 0..100 {
        engine.tick(&[]).unwrap();
        assert!(engine.spiking_indices().is_empty());
    }

    assert!(engine.membrane().iter().all(|membrane| *membrane == 0.0));
    assert_eq!(engine.tick_count(), 100);
}

#[test]
fn zero_weight_isolation() {
    let network = description::parse_network(
        "NEURON S0 50 1.0 0\n\
         NEURON O0 50 1.0 0\n\
         CONNECTION S0 O0 0\n",
    )
    .unwrap();

    let mut engine = SimulationEngine::new(&network, SpikeMode::Eval);
    let injections = engine.resolve_injections(&[("S0", 100.0)]).unwrap();
    let mut sensory_spikes = 0;

    for _ in 0..50 {
        engine.tick(&injections).unwrap();
        sensory_spikes += engine.fired()[0] as usize;
        assert!(!engine.fired()[1]);
        assert_eq!(engine.membrane()[1], 0.0);
    }

    assert_eq!(sensory_spikes, 49);
}

#[test]
fn spike_propagation_delay() {
    let network = description::parse_network(
        "NEURON S0 50 0 0\n\
         NEURON N1 50 0 0\n\
         NEURON O0 50 0 0\n\
         CONNECTION S0 N1 60\n\
         CONNECTION N1 O0 60\n",
    )
    .unwrap();

    let mut engine = SimulationEngine::new(&network, SpikeMode::Eval);
    let mut spike_ticks = Vec::new();

    for tick in 0..5 {
        let injections = if tick == 0 { vec![(0, 100.0)] } else { Vec::new() };
        engine.tick(&injections).unwrap();
        spike_ticks.push(engine.spiking_indices());
    }

    assert_equal(spike_ticks, [vec![], vec![0usize], vec![1], vec![2], vec![]]);
}

#[test]
fn winner_take_all() {
    let metrics = run_wta(&[("S1", 100.0)]);
    assert_eq!(metrics.winner.as_deref(), Some("O1"));
    assert!(metrics.margin > 0.0);

    let metrics = run_wta(&[("S0", 100.0)]);
    assert_eq!(metrics.winner.as_deref(), Some("O0"));
    assert!(metrics.margin > 0.0);
    assert!(metrics.evidence[0] > metrics.evidence[2]);
    assert_approx_eq!(f32, metrics.evidence[1], 0.0);

    let metrics = run_wta(&[("S0", 100.0), ("S1", 100.0)]);
    assert_eq!(metrics.winner.as_deref(), Some("O0"));
    assert_approx_eq!(f32, metrics.margin, 0.0);
    assert!(metrics.evidence.iter().all_equal());

    let metrics = run_wta(&[]);
    assert_eq!(metrics.winner, None);
    assert_approx_eq!(f32, metrics.margin, 0.0);
}

#[test]
fn deterministic_simulation() {
    let network = description::parse_network(WTA_NETWORK).unwrap();
    let sequence = InputSequence::parse(
        "DURATION 40\n\
         LOOP true\n\
         0 S0 100\n\
         EVENT 3 S1 70\n\
         7 S0 20\n",
    )
    .unwrap();
    let episode = CompiledEpisode::compile(&network, &Episode::new(sequence, "O0")).unwrap();

    let run = || {
        let mut engine = SimulationEngine::new(&network, SpikeMode::Eval);
        (0..200)
            .map(|tick| {
                engine.tick(episode.injections_at(tick)).unwrap();
                (engine.spiking_indices(), engine.membrane().to_vec())
            })
            .collect_vec()
    };

    assert_eq!(run(), run());
}

#[test]
fn description_round_trip() {
    let mut network = xor_network();
    network.set_default_output(Some("N2")).unwrap();

    let mut trainer = Trainer::new(network, xor_training_params(1)).unwrap();
    trainer.train(&xor_dataset(), 3).unwrap();
    let trained = trainer.into_network();

    let text = description::write_network(&trained);
    let reparsed = description::parse_network(&text).unwrap();

    assert_eq!(reparsed.genome(), trained.genome());
    assert_eq!(reparsed.neuron_ids(), trained.neuron_ids());
    assert_eq!(reparsed.default_output(), Some("N2"));
    assert_eq!(description::write_network(&reparsed), text);
}

#[test]
fn invalid_injection() {
    let network = description::parse_network(WTA_NETWORK).unwrap();
    let engine = SimulationEngine::new(&network, SpikeMode::Eval);

    assert_eq!(
        engine
            .resolve_injections(&[("S9", 1.0)])
            .unwrap_err()
            .as_str(),
        "invalid neuron id: S9"
    );

    let result = CompiledEpisode::compile(&network, &constant_episode(&[("S9", 1.0)], "O0"));
    assert_eq!(result.unwrap_err().as_str(), "invalid neuron id: S9");
}

#[test]
fn unknown_optimizer() {
    assert_eq!(
        OptimizerParams::from_name("rmsprop").unwrap_err().as_str(),
        "unknown optimizer: rmsprop"
    );
}

#[test]
fn xor_gradient() {
    let dataset = xor_dataset();
    let mut trainer = Trainer::new(xor_network(), xor_training_params(1)).unwrap();

    let before = trainer.evaluate_dataset(&dataset).unwrap();
    assert!(before.accuracy < 0.5);

    let records = trainer.train(&dataset, 60).unwrap();
    assert_eq!(records.len(), 60);
    assert!(records[59].mean_loss.unwrap() < records[0].mean_loss.unwrap());

    let after = trainer.evaluate_dataset(&dataset).unwrap();
    assert!(after.accuracy >= 0.95);
    assert!(after.margin > before.margin);

    for episode in &dataset {
        let metrics = trainer.evaluate(episode).unwrap();
        assert!(metrics.is_correct(episode.target_id()));
    }

    // any injection above the sensory threshold drives a sensory neuron identically
    let resampled = [80.0, 120.0]
        .iter()
        .flat_map(|amount| {
            [
                constant_episode(&[("S0", *amount)], "N3"),
                constant_episode(&[("S1", *amount)], "N3"),
                constant_episode(&[("S0", *amount), ("S1", *amount)], "N2"),
            ]
        })
        .collect_vec();

    let held_out = trainer.evaluate_dataset(&resampled).unwrap();
    assert!(held_out.accuracy >= 0.95);
}

#[test]
fn parallel_training_matches_serial() {
    let num_threads = num_cpus::get().min(4);
    let params = TrainingParams {
        batch_size: 2,
        shuffle: true,
        technical_params: TechnicalParams {
            num_threads: Some(num_threads),
            seed_override: Some(3),
            ..TechnicalParams::default()
        },
        ..xor_training_params(num_threads)
    };

    let train = |params: TrainingParams| {
        let mut trainer = Trainer::new(xor_network(), params).unwrap();
        let records = trainer.train(&xor_dataset(), 10).unwrap();
        (records, trainer.into_network().genome())
    };

    let (parallel_records, parallel_genome) = train(params.clone());

    let serial_params = TrainingParams {
        technical_params: TechnicalParams {
            num_threads: Some(1),
            ..params.technical_params.clone()
        },
        ..params
    };
    let (serial_records, serial_genome) = train(serial_params);

    assert_eq!(parallel_records, serial_records);
    assert_eq!(parallel_genome, serial_genome);
}

#[test]
fn lamarckian_inheritance() {
    let evolution_params = |lamarckian| EvolutionParams {
        population_size: 2,
        num_generations: 2,
        num_elites: 1,
        parents_pool: 1,
        train_epochs: 5,
        lamarckian,
        mutation_params: MutationParams {
            sigma_weight: 0.0,
            sigma_threshold: 0.0,
            sigma_leak: 0.0,
        },
        ..EvolutionParams::default()
    };

    let run = |lamarckian| {
        EvolutionEngine::new(
            xor_network(),
            xor_dataset(),
            xor_dataset(),
            xor_training_params(1),
            evolution_params(lamarckian),
        )
        .unwrap()
        .run()
        .unwrap()
    };

    let baseline = xor_network().genome();
    let untrained_accuracy = Trainer::new(xor_network(), xor_training_params(1))
        .unwrap()
        .evaluate_dataset(&xor_dataset())
        .unwrap()
        .accuracy;

    let darwinian = run(false);
    assert_eq!(darwinian.best_genome, baseline);
    assert_approx_eq!(f32, darwinian.best_metrics.accuracy, untrained_accuracy);

    let lamarckian = run(true);
    assert_ne!(lamarckian.best_genome, baseline);
    assert_eq!(lamarckian.history.len(), 2);

    let lineage: Vec<glia::evolution::LineageRecord> =
        serde_json::from_str(&lamarckian.lineage_json().unwrap()).unwrap();
    assert_eq!(lineage, lamarckian.lineage);
    assert_equal(lineage.iter().map(|record| record.generation), [0, 0, 1, 1]);
}
