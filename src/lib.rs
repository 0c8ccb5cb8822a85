#![forbid(unsafe_code)]

//! An on-vehicle diagnostic engine for ELM327-class OBD-II adapters.
//!
//! The [`Kernel`] is the single point of entry: it negotiates the
//! adapter over a serial [`transport`], discovers which sensors the
//! vehicle supports, polls the active set round-robin in a background
//! worker, reads and clears diagnostic trouble codes, and evaluates
//! user-defined alert [`rule`]s over live sensor values.

pub mod capability;
pub mod dtc;
mod error;
pub mod events;
pub mod kernel;
mod poller;
mod response;
pub mod rule;
pub mod sensor;
pub mod session;
pub mod sim;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{DecodeError, KernelError, RuleError, SessionError, TransportError};
pub use kernel::Kernel;
pub use poller::POLL_TIMEOUT;
pub use sensor::{Pid, SensorSnapshot, Unit};
pub use session::SessionState;
