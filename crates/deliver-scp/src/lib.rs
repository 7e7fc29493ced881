//! # deliver – SCP delivery
//!
//! Remote file delivery over SSH providing:
//!   • Source resolution (single file, directory, or wildcard pattern)
//!   • Remote destination building from a base directory and subdirectory token
//!   • A transport trait with libssh2 and OpenSSH-binary implementations
//!   • An orchestrator sequencing mkdir → upload → listing verification
//!   • Progress events for an external presentation layer

pub mod delivery;
