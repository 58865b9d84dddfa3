use glia::description;
use glia::engine::{SimulationEngine, SpikeMode};
use glia::sequence::{Episode, InputSequence};
use glia::trainer::Trainer;
use rand::{prelude::Distribution, rngs::StdRng, seq::SliceRandom, SeedableRng};
use statrs::distribution::Poisson;

#[path = "../scenario_params.rs"]
mod scenario_params;

fn main() {
    let network = scenario_params::build_network(0);
    let mut engine = SimulationEngine::new(&network, SpikeMode::Eval);

    let stimulation_idxs: Vec<usize> = (0..network.num_neurons()).collect();
    let mut rng = StdRng::seed_from_u64(0);
    let amount = 25.0;

    let mut neuron_checksum = 0;
    let mut synaptic_transmission_count = 0usize;
    let t_stop = 1000;

    let num_stimulus_spikes_dist = Poisson::new(10.0).unwrap();

    for t in 0..t_stop {
        let num_stimulus_spikes = num_stimulus_spikes_dist.sample(&mut rng) as usize;

        let injections: Vec<(usize, f32)> = stimulation_idxs
            .choose_multiple(&mut rng, num_stimulus_spikes)
            .map(|idx| (*idx, amount))
            .collect();

        engine.tick(&injections).unwrap();

        for idx in engine.spiking_indices() {
            neuron_checksum += t * idx;
            synaptic_transmission_count += network.outgoing(idx).len();
        }
    }

    let membrane_checksum: f64 = engine.membrane().iter().map(|v| *v as f64).sum();

    println!("simulation result:");
    println!("...neuron checksum: {}", neuron_checksum);
    println!(
        "...synaptic transmission count: {}",
        synaptic_transmission_count
    );
    println!("...membrane checksum: {}", membrane_checksum);

    let dataset: Vec<Episode> = (0..scenario_params::NUM_OUTPUTS)
        .map(|class| {
            let sensory_id = format!("S{}", class);
            Episode::new(
                InputSequence::constant(&[(sensory_id.as_str(), 2.0)], 50),
                &format!("O{}", class),
            )
        })
        .collect();

    let mut trainer = Trainer::new(network.clone(), scenario_params::get_training_params()).unwrap();
    let records = trainer.train(&dataset, 2).unwrap();
    let trained = trainer.into_network();

    let weight_checksum: f64 = trained
        .synapses()
        .iter()
        .map(|synapse| {
            (synapse.pre_idx as f64 + 1.0) * (synapse.post_idx as f64 + 1.0) * synapse.weight as f64
        })
        .sum();

    println!("training result:");
    println!("...mean loss: {:?}", records[records.len() - 1].mean_loss);
    println!("...weight checksum: {}", weight_checksum);
    println!(
        "...description length: {}",
        description::write_network(&trained).len()
    );
}
