//! Common event and command vocabulary
//!
//! Every adapter translates its wire protocol into these types, and the
//! connection state machine that governs each device lives here too.

pub mod command;
pub mod event;
pub mod state;

pub use self::command::{AmplifierMode, Command, CommandPolicy, DeviceCommand};
pub use self::event::{
    AmplifierStatus, DeviceSnapshot, EventPayload, NormalizedEvent, PortSource, PortStatus,
    RemovalReason, RotatorPosition, Spot,
};
pub use self::state::{is_valid_transition, Backoff, StateMachine, Transition};
