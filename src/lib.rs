pub mod analyze;
pub mod blob;
pub mod cache;
pub mod cli;
pub mod error;
pub mod fingerprint;
pub mod model;
pub mod report;
pub mod session;
pub mod syntax;
pub mod trace;
pub mod tracker;
