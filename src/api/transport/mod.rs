mod ecn_marking;
mod network_types;

pub use ecn_marking::*;
pub use network_types::*;
