//! Type definitions

pub mod job;
pub mod messages;
pub mod row;

pub use job::*;
pub use messages::*;
pub use row::*;
