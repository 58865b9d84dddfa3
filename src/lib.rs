pub mod description;
pub mod engine;
pub mod evolution;
pub mod genome;
pub mod lr_schedule;
pub mod network;
pub mod optimizer;
pub mod params;
pub mod readout;
pub mod sequence;
pub mod synapse;
pub mod trainer;

mod gradient;
mod hebbian;
mod pool;
mod util;
