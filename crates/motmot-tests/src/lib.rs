//! Integration test helpers: in-process domain servers on ephemeral ports,
//! test clients, and scripted fake peers.

pub mod harness;
