//! Line-oriented network description format.
//!
//! ```text
//! # comment
//! NEURON <id> <threshold> <leak> <resting> [<refractory_period>]
//! CONNECTION <pre_id> <post_id> <weight>
//! DEFAULT_OUTPUT <id>
//! ```

use crate::network::NetworkState;
use crate::params::NeuronParams;
use simple_error::{try_with, SimpleError, SimpleResult};
use std::fs;
use std::path::Path;
use std::str::FromStr;

pub fn parse_network(text: &str) -> SimpleResult<NetworkState> {
    let mut network = NetworkState::new();

    for (line_idx, line) in text.lines().enumerate() {
        let line_no = line_idx + 1;
        let line = strip_comment(line);
        let fields: Vec<&str> = line.split_whitespace().collect();

        let Some((&record, args)) = fields.split_first() else {
            continue;
        };

        match record {
            "NEURON" => {
                if args.len() != 4 && args.len() != 5 {
                    return Err(malformed(line_no, record));
                }

                let neuron_params = NeuronParams {
                    threshold: parse_field(args[1], line_no, "threshold")?,
                    leak: parse_field(args[2], line_no, "leak")?,
                    resting: parse_field(args[3], line_no, "resting")?,
                    refractory_period: match args.get(4) {
                        Some(field) => parse_field(field, line_no, "refractory_period")?,
                        None => 0,
                    },
                };

                try_with!(
                    network.add_neuron(args[0], &neuron_params),
                    "line {}",
                    line_no
                );
            }
            "CONNECTION" => {
                if args.len() != 3 {
                    return Err(malformed(line_no, record));
                }

                let weight = parse_field(args[2], line_no, "weight")?;
                try_with!(
                    network.add_connection(args[0], args[1], weight),
                    "line {}",
                    line_no
                );
            }
            "DEFAULT_OUTPUT" => {
                if args.len() != 1 {
                    return Err(malformed(line_no, record));
                }

                try_with!(
                    network.set_default_output(Some(args[0])),
                    "line {}",
                    line_no
                );
            }
            _ => {
                return Err(SimpleError::new(format!(
                    "line {}: unknown record type: {}",
                    line_no, record
                )))
            }
        }
    }

    Ok(network)
}

/// Writes a network such that `parse_network` reproduces it exactly.
pub fn write_network(network: &NetworkState) -> String {
    let mut lines = Vec::with_capacity(network.num_neurons() + network.num_synapses() + 1);

    for (idx, id) in network.neuron_ids().iter().enumerate() {
        let params = network.neuron_params(idx);
        let mut line = format!(
            "NEURON {} {} {} {}",
            id, params.threshold, params.leak, params.resting
        );

        if params.refractory_period != 0 {
            line.push_str(&format!(" {}", params.refractory_period));
        }

        lines.push(line);
    }

    for synapse in network.synapses() {
        lines.push(format!(
            "CONNECTION {} {} {}",
            network.neuron_id(synapse.pre_idx),
            network.neuron_id(synapse.post_idx),
            synapse.weight
        ));
    }

    if let Some(default_output) = network.default_output() {
        lines.push(format!("DEFAULT_OUTPUT {}", default_output));
    }

    lines.iter().map(|line| format!("{}\n", line)).collect()
}

pub fn load_network<P: AsRef<Path>>(path: P) -> SimpleResult<NetworkState> {
    let text = try_with!(
        fs::read_to_string(path.as_ref()),
        "cannot read network file {}",
        path.as_ref().display()
    );

    parse_network(&text)
}

pub fn save_network<P: AsRef<Path>>(network: &NetworkState, path: P) -> SimpleResult<()> {
    try_with!(
        fs::write(path.as_ref(), write_network(network)),
        "cannot write network file {}",
        path.as_ref().display()
    );

    Ok(())
}

pub(crate) fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    }
}

pub(crate) fn parse_field<T: FromStr>(field: &str, line_no: usize, name: &str) -> SimpleResult<T> {
    field.parse().map_err(|_| {
        SimpleError::new(format!(
            "line {}: invalid {}: {}",
            line_no, name, field
        ))
    })
}

fn malformed(line_no: usize, record: &str) -> SimpleError {
    SimpleError::new(format!("line {}: malformed {} record", line_no, record))
}
