//! Job worker: claims queued jobs from a shared store and runs them as child
//! processes or through a named provider.

pub mod config;
pub mod error;
pub mod jobs;
pub mod providers;
pub mod store;
pub mod worker;
