//! Repository traits and their SQLx implementations.

pub mod job;

pub use job::{JobRepository, SqlxJobRepository};

#[cfg(test)]
pub use job::MockJobRepository;
