//! Idempotent diff-and-converge of declared desired state onto the running
//! connection and detector sets. Passes are serialized by the single
//! timer-driven caller in `main`.

pub mod connections;
pub mod detectors;
