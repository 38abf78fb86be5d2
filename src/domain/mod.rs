// Domain layer: records exchanged with the remote API and the ports (traits) the core depends on.

pub mod model;
pub mod ports;
