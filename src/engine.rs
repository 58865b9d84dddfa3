use crate::network::NetworkState;
use crate::util;
use simple_error::{SimpleError, SimpleResult};
use std::mem;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpikeMode {
    /// Spike vector holds hard 0/1 values.
    Eval,
    /// Spike vector holds `sigmoid(surrogate_beta * (membrane - threshold))` for integrating
    /// neurons. Propagation still uses the hard spike.
    Train { surrogate_beta: f32 },
}

/// Transient per-neuron state of one simulation run.
#[derive(Debug, Clone)]
pub struct NeuronBank {
    membrane: Vec<f32>,
    refractory_ticks: Vec<u32>,
    delta: Vec<f32>,
    on_deck: Vec<f32>,
    spikes: Vec<f32>,
    fired: Vec<bool>,
}

impl NeuronBank {
    pub fn new(network: &NetworkState) -> Self {
        let num_neurons = network.num_neurons();
        Self {
            membrane: network.resting().to_vec(),
            refractory_ticks: vec![0; num_neurons],
            delta: vec![0.0; num_neurons],
            on_deck: vec![0.0; num_neurons],
            spikes: vec![0.0; num_neurons],
            fired: vec![false; num_neurons],
        }
    }

    fn reset(&mut self, network: &NetworkState) {
        self.membrane.copy_from_slice(network.resting());
        self.refractory_ticks.fill(0);
        self.delta.fill(0.0);
        self.on_deck.fill(0.0);
        self.spikes.fill(0.0);
        self.fired.fill(false);
    }
}

/// Per-tick record of everything backpropagation through time needs. Entries are laid out
/// tick-major: the value of neuron `i` at tick `t` sits at `t * num_neurons + i`.
#[derive(Debug, Clone, Default)]
pub struct Tape {
    num_neurons: usize,
    pub(crate) membrane_prev: Vec<f32>,
    pub(crate) pre_clamp: Vec<f32>,
    pub(crate) surrogate: Vec<f32>,
    pub(crate) fired: Vec<bool>,
    pub(crate) integrating: Vec<bool>,
}

impl Tape {
    fn new(num_neurons: usize) -> Self {
        Self {
            num_neurons,
            ..Self::default()
        }
    }

    pub fn num_ticks(&self) -> usize {
        if self.num_neurons == 0 {
            0
        } else {
            self.fired.len() / self.num_neurons
        }
    }

    fn clear(&mut self) {
        self.membrane_prev.clear();
        self.pre_clamp.clear();
        self.surrogate.clear();
        self.fired.clear();
        self.integrating.clear();
    }

    fn record(
        &mut self,
        membrane_prev: f32,
        pre_clamp: f32,
        surrogate: f32,
        fired: bool,
        integrating: bool,
    ) {
        self.membrane_prev.push(membrane_prev);
        self.pre_clamp.push(pre_clamp);
        self.surrogate.push(surrogate);
        self.fired.push(fired);
        self.integrating.push(integrating);
    }
}

/// Advances a neuron bank against a read-only network, one discrete tick at a time.
pub struct SimulationEngine<'a> {
    network: &'a NetworkState,
    bank: NeuronBank,
    mode: SpikeMode,
    tape: Option<Tape>,
    tick_count: usize,
}

impl<'a> SimulationEngine<'a> {
    pub fn new(network: &'a NetworkState, mode: SpikeMode) -> Self {
        Self {
            network,
            bank: NeuronBank::new(network),
            mode,
            tape: None,
            tick_count: 0,
        }
    }

    /// Like `new`, but every tick is recorded on a tape for backpropagation.
    pub fn with_tape(network: &'a NetworkState, mode: SpikeMode) -> Self {
        let mut engine = Self::new(network, mode);
        engine.tape = Some(Tape::new(network.num_neurons()));
        engine
    }

    pub fn network(&self) -> &NetworkState {
        self.network
    }

    pub fn mode(&self) -> SpikeMode {
        self.mode
    }

    pub fn reset(&mut self) {
        self.bank.reset(self.network);
        self.tick_count = 0;

        if let Some(tape) = self.tape.as_mut() {
            tape.clear();
        }
    }

    pub fn tape(&self) -> Option<&Tape> {
        self.tape.as_ref()
    }

    pub fn tick_count(&self) -> usize {
        self.tick_count
    }

    pub fn membrane(&self) -> &[f32] {
        &self.bank.membrane
    }

    pub fn refractory_ticks(&self) -> &[u32] {
        &self.bank.refractory_ticks
    }

    pub fn spikes(&self) -> &[f32] {
        &self.bank.spikes
    }

    pub fn fired(&self) -> &[bool] {
        &self.bank.fired
    }

    pub fn spiking_indices(&self) -> Vec<usize> {
        self.bank
            .fired
            .iter()
            .enumerate()
            .filter_map(|(idx, fired)| fired.then_some(idx))
            .collect()
    }

    pub fn resolve_injections(&self, injections: &[(&str, f32)]) -> SimpleResult<Vec<(usize, f32)>> {
        injections
            .iter()
            .map(|(id, amount)| Ok((self.network.resolve_neuron_idx(id)?, *amount)))
            .collect()
    }

    /// Advances one tick. Injected currents are staged like synaptic input and integrated on
    /// the following tick.
    pub fn tick(&mut self, injections: &[(usize, f32)]) -> SimpleResult<()> {
        let network = self.network;
        let num_neurons = network.num_neurons();

        if let Some((idx, _)) = injections.iter().find(|(idx, _)| *idx >= num_neurons) {
            return Err(SimpleError::new(format!("invalid neuron index: {}", idx)));
        }

        let bank = &mut self.bank;

        mem::swap(&mut bank.delta, &mut bank.on_deck);
        bank.on_deck.fill(0.0);

        for (idx, amount) in injections {
            bank.on_deck[*idx] += amount;
        }

        let thresholds = network.thresholds();
        let leaks = network.leaks();
        let resting = network.resting();
        let refractory_periods = network.refractory_periods();

        for idx in 0..num_neurons {
            let membrane_prev = bank.membrane[idx];

            if bank.refractory_ticks[idx] > 0 {
                bank.refractory_ticks[idx] -= 1;
                bank.spikes[idx] = 0.0;
                bank.fired[idx] = false;

                if let Some(tape) = self.tape.as_mut() {
                    tape.record(membrane_prev, membrane_prev, 0.0, false, false);
                }

                continue;
            }

            let pre_clamp = leaks[idx] * membrane_prev + bank.delta[idx];
            let membrane = pre_clamp.max(0.0);
            let fired = membrane > thresholds[idx];

            let spike = match self.mode {
                SpikeMode::Eval => {
                    if fired {
                        1.0
                    } else {
                        0.0
                    }
                }
                SpikeMode::Train { surrogate_beta } => {
                    util::sigmoid(surrogate_beta * (membrane - thresholds[idx]))
                }
            };

            bank.spikes[idx] = spike;
            bank.fired[idx] = fired;

            if fired {
                bank.membrane[idx] = resting[idx];
                bank.refractory_ticks[idx] = refractory_periods[idx];
            } else {
                bank.membrane[idx] = membrane;
            }

            if let Some(tape) = self.tape.as_mut() {
                tape.record(membrane_prev, pre_clamp, spike, fired, true);
            }
        }

        let synapses = network.synapses();

        for pre_idx in 0..num_neurons {
            if bank.fired[pre_idx] {
                for syn_idx in network.outgoing(pre_idx) {
                    let synapse = &synapses[*syn_idx];
                    bank.on_deck[synapse.post_idx] += synapse.weight;
                }
            }
        }

        self.tick_count += 1;
        Ok(())
    }
}
