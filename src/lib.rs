mod config;
mod error;
mod feedback;
mod pli;
mod rtcp;
mod rtp_queue;
mod scream_rx;
mod scream_tx;
mod shared;

pub use config::*;
pub use error::*;
pub use feedback::*;
pub use pli::*;
pub use rtcp::*;
pub use rtp_queue::*;
pub use scream_rx::*;
pub use scream_tx::*;
pub use shared::*;

pub mod api;
