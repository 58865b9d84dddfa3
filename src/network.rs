use crate::genome::Genome;
use crate::params::{self, NeuronParams};
use crate::synapse::Synapse;
use rustc_hash::FxHashMap as HashMap;
use simple_error::{try_with, SimpleError, SimpleResult};

/// Neuron parameters and synapses of a network, stored as flat arrays in declaration order.
///
/// The simulation only ever reads this; transient state lives in the engine's neuron bank.
#[derive(Debug, Clone, Default)]
pub struct NetworkState {
    neuron_ids: Vec<String>,
    id_to_idx: HashMap<String, usize>,
    thresholds: Vec<f32>,
    leaks: Vec<f32>,
    resting: Vec<f32>,
    refractory_periods: Vec<u32>,
    synapses: Vec<Synapse>,
    synapse_lookup: HashMap<(usize, usize), usize>,
    outgoing: Vec<Vec<usize>>,
    default_output: Option<String>,
}

impl NetworkState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a neuron. Declaring an existing id updates its parameters in place.
    pub fn add_neuron(&mut self, id: &str, neuron_params: &NeuronParams) -> SimpleResult<usize> {
        if id.is_empty() || id.contains('#') || id.chars().any(char::is_whitespace) {
            return Err(SimpleError::new(format!("invalid neuron id: {:?}", id)));
        }

        try_with!(
            params::validate_neuron_params(neuron_params),
            "invalid parameters for neuron {}",
            id
        );

        if let Some(&idx) = self.id_to_idx.get(id) {
            self.thresholds[idx] = neuron_params.threshold;
            self.leaks[idx] = neuron_params.leak;
            self.resting[idx] = neuron_params.resting;
            self.refractory_periods[idx] = neuron_params.refractory_period;
            return Ok(idx);
        }

        let idx = self.neuron_ids.len();
        self.neuron_ids.push(id.to_string());
        self.id_to_idx.insert(id.to_string(), idx);
        self.thresholds.push(neuron_params.threshold);
        self.leaks.push(neuron_params.leak);
        self.resting.push(neuron_params.resting);
        self.refractory_periods.push(neuron_params.refractory_period);
        self.outgoing.push(Vec::new());
        Ok(idx)
    }

    /// Adds a synapse between two declared neurons. A repeated declaration for the same ordered
    /// pair adds its weight to the existing synapse.
    pub fn add_connection(&mut self, pre_id: &str, post_id: &str, weight: f32) -> SimpleResult<usize> {
        if !weight.is_finite() {
            return Err(SimpleError::new(format!(
                "weight of connection {} -> {} must be finite",
                pre_id, post_id
            )));
        }

        let pre_idx = self.resolve_neuron_idx(pre_id)?;
        let post_idx = self.resolve_neuron_idx(post_id)?;

        if let Some(&syn_idx) = self.synapse_lookup.get(&(pre_idx, post_idx)) {
            self.synapses[syn_idx].weight += weight;
            return Ok(syn_idx);
        }

        let syn_idx = self.synapses.len();
        self.synapses.push(Synapse::new(pre_idx, post_idx, weight));
        self.synapse_lookup.insert((pre_idx, post_idx), syn_idx);
        self.outgoing[pre_idx].push(syn_idx);
        Ok(syn_idx)
    }

    pub fn set_default_output(&mut self, id: Option<&str>) -> SimpleResult<()> {
        if let Some(id) = id {
            self.resolve_neuron_idx(id)?;
        }

        self.default_output = id.map(str::to_string);
        Ok(())
    }

    pub fn default_output(&self) -> Option<&str> {
        self.default_output.as_deref()
    }

    pub fn num_neurons(&self) -> usize {
        self.neuron_ids.len()
    }

    pub fn num_synapses(&self) -> usize {
        self.synapses.len()
    }

    pub fn neuron_ids(&self) -> &[String] {
        &self.neuron_ids
    }

    pub fn neuron_id(&self, idx: usize) -> &str {
        &self.neuron_ids[idx]
    }

    pub fn neuron_idx(&self, id: &str) -> Option<usize> {
        self.id_to_idx.get(id).copied()
    }

    pub fn resolve_neuron_idx(&self, id: &str) -> SimpleResult<usize> {
        self.neuron_idx(id)
            .ok_or_else(|| SimpleError::new(format!("invalid neuron id: {}", id)))
    }

    pub fn neuron_params(&self, idx: usize) -> NeuronParams {
        NeuronParams {
            threshold: self.thresholds[idx],
            leak: self.leaks[idx],
            resting: self.resting[idx],
            refractory_period: self.refractory_periods[idx],
        }
    }

    pub fn thresholds(&self) -> &[f32] {
        &self.thresholds
    }

    pub fn leaks(&self) -> &[f32] {
        &self.leaks
    }

    pub fn resting(&self) -> &[f32] {
        &self.resting
    }

    pub fn refractory_periods(&self) -> &[u32] {
        &self.refractory_periods
    }

    pub fn synapses(&self) -> &[Synapse] {
        &self.synapses
    }

    pub(crate) fn synapses_mut(&mut self) -> &mut [Synapse] {
        &mut self.synapses
    }

    /// Indices into `synapses()` of the synapses leaving the given neuron.
    pub fn outgoing(&self, pre_idx: usize) -> &[usize] {
        &self.outgoing[pre_idx]
    }

    pub fn weight(&self, pre_id: &str, post_id: &str) -> Option<f32> {
        let pre_idx = self.neuron_idx(pre_id)?;
        let post_idx = self.neuron_idx(post_id)?;
        self.synapse_lookup
            .get(&(pre_idx, post_idx))
            .map(|&syn_idx| self.synapses[syn_idx].weight)
    }

    pub fn weights(&self) -> Vec<f32> {
        self.synapses.iter().map(|synapse| synapse.weight).collect()
    }

    pub fn set_thresholds(&mut self, thresholds: &[f32]) -> SimpleResult<()> {
        check_len("thresholds", thresholds.len(), self.num_neurons())?;

        if thresholds.iter().any(|threshold| !threshold.is_finite()) {
            return Err(SimpleError::new("thresholds must be finite"));
        }

        self.thresholds.copy_from_slice(thresholds);
        Ok(())
    }

    pub fn set_leaks(&mut self, leaks: &[f32]) -> SimpleResult<()> {
        check_len("leaks", leaks.len(), self.num_neurons())?;

        if leaks.iter().any(|leak| !(0.0..=1.0).contains(leak)) {
            return Err(SimpleError::new("leaks must be in [0, 1]"));
        }

        self.leaks.copy_from_slice(leaks);
        Ok(())
    }

    pub fn set_weights(&mut self, weights: &[f32]) -> SimpleResult<()> {
        check_len("weights", weights.len(), self.num_synapses())?;

        if weights.iter().any(|weight| !weight.is_finite()) {
            return Err(SimpleError::new("weights must be finite"));
        }

        for (synapse, weight) in self.synapses.iter_mut().zip(weights) {
            synapse.weight = *weight;
        }

        Ok(())
    }

    pub fn nonzero_weight_fraction(&self) -> f64 {
        self.genome().nonzero_weight_fraction()
    }

    /// Output neurons, sorted by id. Without explicit ids, every neuron whose id starts with `O`.
    pub fn output_indices(&self, output_ids: Option<&[String]>) -> SimpleResult<Vec<usize>> {
        let mut indices = match output_ids {
            Some(output_ids) => output_ids
                .iter()
                .map(|id| self.resolve_neuron_idx(id))
                .collect::<SimpleResult<Vec<_>>>()?,
            None => (0..self.num_neurons())
                .filter(|idx| self.neuron_ids[*idx].starts_with('O'))
                .collect(),
        };

        indices.sort_by(|a, b| self.neuron_ids[*a].cmp(&self.neuron_ids[*b]));
        indices.dedup();

        if indices.is_empty() {
            return Err(SimpleError::new("network has no output neurons"));
        }

        Ok(indices)
    }

    pub fn genome(&self) -> Genome {
        Genome {
            thresholds: self.thresholds.clone(),
            leaks: self.leaks.clone(),
            weights: self.weights(),
        }
    }

    /// Loads all parameters of a genome. Nothing is changed if any part of it is invalid.
    pub fn apply_genome(&mut self, genome: &Genome) -> SimpleResult<()> {
        let mut updated = self.clone();
        updated.set_thresholds(&genome.thresholds)?;
        updated.set_leaks(&genome.leaks)?;
        updated.set_weights(&genome.weights)?;
        *self = updated;
        Ok(())
    }
}

fn check_len(name: &str, actual: usize, expected: usize) -> SimpleResult<()> {
    if actual != expected {
        return Err(SimpleError::new(format!(
            "{} has length {}, expected {}",
            name, actual, expected
        )));
    }

    Ok(())
}
