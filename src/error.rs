//! Error types for every failure domain of the engine.

use crate::sensor::Pid;

/// Errors raised by the serial transport itself.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    /// The serial port could not be opened
    #[error("could not open serial port: {0}")]
    OpenFailed(String),

    /// Another task currently owns the serial link
    #[error("serial link is in use by another task")]
    Busy,

    /// The adapter did not print its prompt before the deadline
    #[error("timed out waiting for the adapter prompt")]
    Timeout,

    /// The underlying device went away mid-session
    #[error("serial link closed: {0}")]
    IoClosed(String),
}

/// Errors raised while negotiating the adapter and the OBD bus.
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    /// The `0100` wake-up was rejected by the bus
    #[error("could not initialise the OBD bus")]
    BusInit,

    /// An adapter configuration command got no usable answer
    #[error("adapter gave no usable response to `{0}`")]
    AdapterUnresponsive(&'static str),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Errors raised when turning a raw adapter response into bytes.
#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    /// The response did not terminate with the `>` prompt
    #[error("no prompt character at end of response")]
    NoPrompt,

    /// The hex payload had an odd number of nibbles
    #[error("uneven number of hex characters in response")]
    OddNibbles,

    /// A byte position held something other than two hex characters
    #[error("response was not hexadecimal where it should have been")]
    NonHex,

    /// The adapter answered `NO DATA` or `?`
    #[error("adapter reported no data for the request")]
    NoData,

    /// The adapter reported a bus error between itself and the ECU
    #[error("adapter reported a bus error")]
    BusError,
}

/// Errors surfaced through the kernel facade.
#[derive(thiserror::Error, Debug)]
pub enum KernelError {
    /// No session is established
    #[error("not connected to an adapter")]
    NotConnected,

    /// The transport is held by another operation (usually the poller)
    #[error("the serial link is busy with another operation")]
    Busy,

    /// The vehicle does not support this PID
    #[error("sensor {0} is not supported by this vehicle")]
    Unsupported(Pid),

    /// The PID is not part of the sensor inventory
    #[error("unknown PID `{0}`")]
    UnknownPid(String),

    /// The named rule is not registered
    #[error("no such rule: {0}")]
    RuleNotActive(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the rule engine.
#[derive(thiserror::Error, Debug)]
pub enum RuleError {
    /// The expression did not match the rule grammar
    #[error("could not parse rule: {0}")]
    ParseFailed(String),

    /// A referenced sensor is not in the active set
    #[error("rule references sensor {0} which is not being monitored")]
    MissingSensor(Pid),
}
