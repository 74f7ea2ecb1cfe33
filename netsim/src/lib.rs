//! Network impairment simulator.
//!
//! Sits logically between two RTP endpoints and applies loss, latency,
//! jitter, reordering, duplication and payload corruption to the packets
//! passing through, delivering survivors at their computed arrival times.
//! [`Relay`] plugs the simulator between two real UDP sessions.

pub mod conditions;
pub mod queue;
pub mod relay;
pub mod simulator;

pub use conditions::{NetworkConditions, MAX_DELAY_MS};
pub use queue::{DeliveryQueue, ScheduledDelivery};
pub use relay::{Relay, RelayConfig, RelayStats};
pub use simulator::{DeliveryCallback, NetworkSimulator, SimulatorConfig, SimulatorStats};
