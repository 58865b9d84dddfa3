use std::time::Instant;

use glia::engine::{SimulationEngine, SpikeMode};
use glia::sequence::{Episode, InputSequence};
use glia::trainer::Trainer;
use rand::{
    distributions::Uniform, prelude::Distribution, rngs::StdRng, seq::SliceRandom, SeedableRng,
};
use statrs::distribution::Poisson;

#[path = "../scenario_params.rs"]
mod scenario_params;

fn main() {
    let network = scenario_params::build_network(0);
    let mut engine = SimulationEngine::new(&network, SpikeMode::Eval);

    let sensory_idxs: Vec<usize> = (0..scenario_params::NUM_SENSORY).collect();
    let mut rng = StdRng::seed_from_u64(0);
    let amount_dist = Uniform::new(1.0, 5.0);
    let num_stimulus_spikes_dist = Poisson::new(5.0).unwrap();

    let mut spike_count = 0usize;
    let mut synaptic_transmission_count = 0usize;
    let mut checksum = 0;
    let t_stop = 50000;

    let wall_start = Instant::now();

    for _ in 0..t_stop {
        let num_stimulus_spikes = num_stimulus_spikes_dist.sample(&mut rng) as usize;

        let injections: Vec<(usize, f32)> = sensory_idxs
            .choose_multiple(&mut rng, num_stimulus_spikes)
            .map(|idx| (*idx, amount_dist.sample(&mut rng)))
            .collect();

        engine.tick(&injections).unwrap();

        for idx in engine.spiking_indices() {
            spike_count += 1;
            synaptic_transmission_count += network.outgoing(idx).len();
            checksum += idx;
        }
    }

    let wall_time = wall_start.elapsed();
    let synaptic_transm_proc_throughput =
        synaptic_transmission_count as f64 / wall_time.as_secs_f64();

    eprintln!("Spikes per tick: {}", spike_count as f64 / t_stop as f64);
    eprintln!(
        "Synaptic transmission processing throughput: {:.3e} ({:.3} ns per transmission)",
        synaptic_transm_proc_throughput,
        1e9 / synaptic_transm_proc_throughput
    );
    eprintln!("Checksum: {}", checksum);

    let dataset: Vec<Episode> = (0..scenario_params::NUM_OUTPUTS)
        .map(|class| {
            let first_sensory = class * scenario_params::NUM_SENSORY / scenario_params::NUM_OUTPUTS;
            let injections: Vec<(String, f32)> = (first_sensory..first_sensory + 10)
                .map(|idx| (format!("S{}", idx), 2.0))
                .collect();
            let injections: Vec<(&str, f32)> = injections
                .iter()
                .map(|(id, amount)| (id.as_str(), *amount))
                .collect();

            Episode::new(InputSequence::constant(&injections, 50), &format!("O{}", class))
        })
        .collect();

    let mut trainer = Trainer::new(network.clone(), scenario_params::get_training_params()).unwrap();
    let wall_start = Instant::now();
    let records = trainer.train(&dataset, 2).unwrap();

    eprintln!(
        "Training: {:.3} s per epoch, last epoch accuracy {:.3}",
        wall_start.elapsed().as_secs_f64() / records.len() as f64,
        records[records.len() - 1].accuracy
    );
}
