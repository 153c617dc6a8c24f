pub mod controller;
pub mod delivery;
pub mod error;
pub mod reconnect;

pub use controller::{ChatClient, ClientConfig, ClientEvent, ConnectionStatus};
pub use delivery::DeliveryTracker;
pub use error::ClientError;
pub use reconnect::{Directive, MachineEvent, Phase, ReconnectMachine};
