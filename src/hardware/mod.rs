//! Instrument channels.
//!
//! - [`capabilities`]: async traits an instrument channel implements
//! - [`registry`]: maps `(terminal, parameter)` keys to channels
//! - [`ramp`]: hardware and software ramps to a target
//! - [`monitor`]: read-only background polling of mapped channels
//! - [`mock`]: simulated instruments for tests and dry runs

pub mod capabilities;
pub mod mock;
pub mod monitor;
pub mod ramp;
pub mod registry;

pub use capabilities::{BufferAdapter, RampSpeed, Rampable, Readable, Sample, Settable, TriggerAdapter};
pub use registry::{Capability, Channel, ChannelRegistry};
