//! Import pipeline services

pub mod artifact;
pub mod job_store;
pub mod orchestrator;
pub mod parser;
pub mod redis_store;
pub mod sink;
pub mod source;
pub mod validation;
