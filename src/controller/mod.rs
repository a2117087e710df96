pub mod apply;
pub mod artifact;
pub mod backoff;
pub mod checker;
pub mod decrypt;
pub mod digest;
pub mod error;
pub mod generator;
pub mod hooks;
pub mod index;
pub mod reconcile;
pub mod source;
pub mod store;
