//! # Pipeline Tooling
//!
//! External-world seams: subprocess execution, codebase access, code
//! generation, and delivery. Everything here hides behind a trait so the
//! scheduler and pipeline can be tested with scripted doubles.

pub mod codebase;
pub mod delivery;
pub mod generator;
pub mod runner;

pub use codebase::Codebase;
pub use delivery::{CommandDelivery, DeliveryClient};
pub use generator::{CodeGenerator, CommandGenerator, GeneratedChange};
pub use runner::{CommandRunner, ProcessRunner, RunOutput};
