//! Simulation toolkit for the phoneswitch arbiter.
//!
//! Provides threaded fake radios with configurable latency, a driver that
//! runs scripted or seeded-random scenarios against a live
//! [`phoneswitch::ArbiterRuntime`], and checks for the settled state.

pub mod radio;
pub mod scenario;
pub mod sim;

pub use radio::{SimRadio, SimRadioConfig, SimRadioControl};
pub use scenario::{RandomScenario, ScenarioFile, Step};
pub use sim::Simulation;
