//! Input sequences, episodes and the `.seq` text format.
//!
//! ```text
//! DURATION <ticks>
//! LOOP <true|false|1|0>
//! <tick> <id> <amount>
//! EVENT <tick> <id> <amount>
//! ```

use crate::description::{parse_field, strip_comment};
use crate::network::NetworkState;
use log::warn;
use serde::{Deserialize, Serialize};
use simple_error::{try_with, SimpleError, SimpleResult};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Current injections addressed by neuron id, stored only for ticks that have any.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputSequence {
    duration: usize,
    looping: bool,
    ticks: BTreeMap<usize, Vec<(String, f32)>>,
}

impl InputSequence {
    pub fn new(duration: usize, looping: bool) -> Self {
        Self {
            duration,
            looping,
            ticks: BTreeMap::new(),
        }
    }

    /// Injects the same currents on every tick of the sequence.
    pub fn constant(injections: &[(&str, f32)], duration: usize) -> Self {
        let mut sequence = Self::new(duration, false);

        for tick in 0..duration {
            for (id, amount) in injections {
                sequence.add_injection(tick, id, *amount);
            }
        }

        sequence
    }

    /// Returns false if the tick lies beyond the duration, in which case the injection is
    /// dropped. A second injection for the same tick and neuron replaces the first.
    pub fn add_injection(&mut self, tick: usize, id: &str, amount: f32) -> bool {
        if tick >= self.duration {
            return false;
        }

        let injections = self.ticks.entry(tick).or_default();

        match injections.iter_mut().find(|(existing, _)| existing == id) {
            Some(injection) => injection.1 = amount,
            None => injections.push((id.to_string(), amount)),
        }

        true
    }

    pub fn duration(&self) -> usize {
        self.duration
    }

    pub fn is_looping(&self) -> bool {
        self.looping
    }

    pub fn injections_at(&self, tick: usize) -> &[(String, f32)] {
        resolve_tick(tick, self.duration, self.looping)
            .and_then(|tick| self.ticks.get(&tick))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn parse(text: &str) -> SimpleResult<Self> {
        let mut duration = None;
        let mut looping = false;
        let mut rows = Vec::new();

        for (line_idx, line) in text.lines().enumerate() {
            let line_no = line_idx + 1;
            let fields: Vec<&str> = strip_comment(line).split_whitespace().collect();

            match fields.as_slice() {
                [] => {}
                ["DURATION", ticks] => duration = Some(parse_field(ticks, line_no, "duration")?),
                ["LOOP", flag] => looping = parse_flag(flag, line_no)?,
                ["EVENT", tick_field, id, amount] | [tick_field, id, amount] => {
                    let tick: usize = parse_field(tick_field, line_no, "tick")?;
                    let amount: f32 = parse_field(amount, line_no, "amount")?;

                    if tick == usize::MAX {
                        return Err(SimpleError::new(format!(
                            "line {}: invalid tick: {}",
                            line_no, tick_field
                        )));
                    }

                    rows.push((tick, id.to_string(), amount));
                }
                _ => {
                    return Err(SimpleError::new(format!(
                        "line {}: malformed sequence row",
                        line_no
                    )))
                }
            }
        }

        let duration = duration
            .unwrap_or_else(|| rows.iter().map(|(tick, _, _)| tick + 1).max().unwrap_or(0));

        let mut sequence = Self::new(duration, looping);

        for (tick, id, amount) in rows {
            if !sequence.add_injection(tick, &id, amount) {
                warn!(
                    "ignoring injection into {} at tick {} beyond sequence duration {}",
                    id, tick, duration
                );
            }
        }

        Ok(sequence)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> SimpleResult<Self> {
        let text = try_with!(
            fs::read_to_string(path.as_ref()),
            "cannot read sequence file {}",
            path.as_ref().display()
        );

        Self::parse(&text)
    }
}

/// An input sequence with the output neuron that should win it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    sequence: InputSequence,
    target_id: String,
}

impl Episode {
    pub fn new(sequence: InputSequence, target_id: &str) -> Self {
        Self {
            sequence,
            target_id: target_id.to_string(),
        }
    }

    pub fn sequence(&self) -> &InputSequence {
        &self.sequence
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }
}

/// An episode with neuron ids resolved against one network.
#[derive(Debug, Clone)]
pub struct CompiledEpisode {
    ticks: BTreeMap<usize, Vec<(usize, f32)>>,
    duration: usize,
    looping: bool,
    target_idx: usize,
    target_id: String,
}

impl CompiledEpisode {
    pub fn compile(network: &NetworkState, episode: &Episode) -> SimpleResult<Self> {
        let target_idx = network
            .neuron_idx(episode.target_id())
            .ok_or_else(|| {
                SimpleError::new(format!("unknown target id: {}", episode.target_id()))
            })?;

        let ticks = episode
            .sequence
            .ticks
            .iter()
            .map(|(tick, injections)| {
                let injections = injections
                    .iter()
                    .map(|(id, amount)| Ok((network.resolve_neuron_idx(id)?, *amount)))
                    .collect::<SimpleResult<Vec<_>>>()?;
                Ok((*tick, injections))
            })
            .collect::<SimpleResult<BTreeMap<_, _>>>()?;

        Ok(Self {
            ticks,
            duration: episode.sequence.duration,
            looping: episode.sequence.looping,
            target_idx,
            target_id: episode.target_id.clone(),
        })
    }

    pub fn injections_at(&self, tick: usize) -> &[(usize, f32)] {
        resolve_tick(tick, self.duration, self.looping)
            .and_then(|tick| self.ticks.get(&tick))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn target_idx(&self) -> usize {
        self.target_idx
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }
}

pub fn compile_episodes(
    network: &NetworkState,
    episodes: &[Episode],
) -> SimpleResult<Vec<CompiledEpisode>> {
    episodes
        .iter()
        .map(|episode| CompiledEpisode::compile(network, episode))
        .collect()
}

fn resolve_tick(tick: usize, duration: usize, looping: bool) -> Option<usize> {
    if tick < duration {
        Some(tick)
    } else if looping && duration > 0 {
        Some(tick % duration)
    } else {
        None
    }
}

fn parse_flag(field: &str, line_no: usize) -> SimpleResult<bool> {
    match field.to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(SimpleError::new(format!(
            "line {}: invalid loop flag: {}",
            line_no, field
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util;
    use itertools::assert_equal;

    #[test]
    fn parse_unordered_rows() {
        let text = "# stimulus\n\
                    DURATION 4\n\
                    LOOP false\n\
                    2 S1 50\n\
                    EVENT 0 S0 100\n\
                    0 S1 25.5\n\
                    9 S0 1\n";

        let sequence = InputSequence::parse(text).unwrap();

        assert_eq!(sequence.duration(), 4);
        assert!(!sequence.is_looping());
        assert_eq!(
            sequence.injections_at(0),
            &[("S0".to_string(), 100.0), ("S1".to_string(), 25.5)]
        );
        assert!(sequence.injections_at(1).is_empty());
        assert_eq!(sequence.injections_at(2), &[("S1".to_string(), 50.0)]);
        assert!(sequence.injections_at(9).is_empty());
    }

    #[test]
    fn duration_defaults_to_last_tick() {
        let sequence = InputSequence::parse("LOOP 1\n3 S0 1\n").unwrap();

        assert_eq!(sequence.duration(), 4);
        assert!(sequence.is_looping());
        assert_eq!(sequence.injections_at(7), sequence.injections_at(3));
        assert!(sequence.injections_at(5).is_empty());
    }

    #[test]
    fn same_tick_and_neuron_overwrites() {
        let sequence = InputSequence::parse("0 S0 1\n0 S0 2\n").unwrap();
        assert_eq!(sequence.injections_at(0), &[("S0".to_string(), 2.0)]);
    }

    #[test]
    fn malformed_rows() {
        assert_eq!(
            InputSequence::parse("LOOP maybe\n").unwrap_err().as_str(),
            "line 1: invalid loop flag: maybe"
        );
        assert_eq!(
            InputSequence::parse("1 S0\n").unwrap_err().as_str(),
            "line 1: malformed sequence row"
        );
        assert_eq!(
            InputSequence::parse("x S0 1\n").unwrap_err().as_str(),
            "line 1: invalid tick: x"
        );
    }

    #[test]
    fn tick_out_of_range() {
        let text = format!("{} S0 1\n", usize::MAX);
        assert_eq!(
            InputSequence::parse(&text).unwrap_err().as_str(),
            format!("line 1: invalid tick: {}", usize::MAX)
        );

        assert_eq!(
            InputSequence::parse("0 S0 1\n18446744073709551616 S0 1\n")
                .unwrap_err()
                .as_str(),
            "line 2: invalid tick: 18446744073709551616"
        );
    }

    #[test]
    fn huge_duration_is_sparse() {
        let text = format!("DURATION {}\nLOOP true\n5 S0 2\n", usize::MAX - 1);
        let sequence = InputSequence::parse(&text).unwrap();

        assert_eq!(sequence.duration(), usize::MAX - 1);
        assert_eq!(sequence.injections_at(5), &[("S0".to_string(), 2.0)]);
        assert!(sequence.injections_at(usize::MAX - 2).is_empty());

        let network = test_util::get_wta_network();
        let compiled = CompiledEpisode::compile(&network, &Episode::new(sequence, "O0")).unwrap();
        assert_equal(compiled.injections_at(5), &[(0, 2.0)]);
        assert!(compiled.injections_at(6).is_empty());
    }

    #[test]
    fn compile_resolves_ids() {
        let network = test_util::get_wta_network();
        let episode = test_util::get_constant_input_episode(&[("S1", 100.0)], 3, "O1");
        let compiled = CompiledEpisode::compile(&network, &episode).unwrap();

        assert_eq!(compiled.target_idx(), 4);
        assert_eq!(compiled.target_id(), "O1");
        assert_equal(compiled.injections_at(2), &[(1, 100.0)]);
        assert!(compiled.injections_at(3).is_empty());
    }

    #[test]
    fn compile_rejects_unknown_ids() {
        let network = test_util::get_wta_network();

        let episode = test_util::get_constant_input_episode(&[("S7", 100.0)], 3, "O1");
        assert_eq!(
            CompiledEpisode::compile(&network, &episode)
                .unwrap_err()
                .as_str(),
            "invalid neuron id: S7"
        );

        let episode = test_util::get_constant_input_episode(&[("S0", 100.0)], 3, "O7");
        assert_eq!(
            CompiledEpisode::compile(&network, &episode)
                .unwrap_err()
                .as_str(),
            "unknown target id: O7"
        );
    }
}
