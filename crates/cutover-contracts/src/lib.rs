// Public contracts for the Cutover engine
// This crate defines bus message payloads, status enums, and admin API DTOs

pub mod common;
pub mod messages;
pub mod resources;
pub mod status;

pub use common::*;
pub use messages::*;
pub use resources::*;
pub use status::*;
