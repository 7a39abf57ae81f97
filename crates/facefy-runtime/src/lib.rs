//! Connection runtime for the Facefy client.
//!
//! Drives the WebSocket link to the detection server and combines its state
//! with the saved endpoint for presentation.

pub mod aggregator;
pub mod session;
pub mod transport;
