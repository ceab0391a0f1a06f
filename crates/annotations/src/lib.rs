//! Domain model for the annotation server: datasets, records, responses,
//! suggestions, the distribution policy and its record status state machine.

pub mod distribution;
pub mod policy;
pub mod schema;
pub mod validate;

pub use distribution::*;
pub use policy::{is_allowed, Action};
pub use schema::*;
pub use validate::ValidationError;
