//! End-to-end scenarios for the Strand consensus engine.
//!
//! The [`harness`] runs real orchestrators, real threshold keys, and
//! real agreement over a deterministic in-process wire; the test modules
//! drive the scenarios: the four-node happy path, a crashed validator,
//! the all-zero empty block, and chain safety across nodes.

pub mod harness;

#[cfg(test)]
mod consensus_tests;
