//! Core types for the Facefy client.
//!
//! Holds the connection data model, the wire protocol spoken with the
//! detection server, preference persistence, and CLI settings. Nothing in
//! this crate touches the network or an async runtime.

pub mod error;
pub mod models;
pub mod preferences;
pub mod protocol;
pub mod settings;

pub use error::{FacefyError, Result};
