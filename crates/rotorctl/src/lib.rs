//! rotorctl - operator CLI for the rotor daemon.

pub mod client;
pub mod doctor;
pub mod output;
