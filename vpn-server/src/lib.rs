//! The server transmission loop: L2TP session dispatch across many client
//! shell channels sharing one UDP socket.

pub mod server;

pub use server::{server_transmission_loop, ConnectOutcome, DisconnectOutcome, ServerUpcalls};
