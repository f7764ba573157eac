//! seatlock: a seat-reservation table replicated across a fixed set of
//! servers, kept consistent with Lamport's distributed mutual exclusion.

pub mod client;
pub mod config;
pub mod mutex;
pub mod seats;
pub mod server;
