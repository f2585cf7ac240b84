//! The Orchard plotter: a four-phase pipeline that turns a 32-byte id and
//! a size parameter k into a proof-of-space plot file.
//!
//! Phase 1 evaluates the seven interlinked tables forward; phase 2 prunes
//! entries that no table-7 output can reach; phase 3 re-sorts each table by
//! line point and compresses it into fixed-size parks; phase 4 writes the
//! C1/C2/C3 checkpoint tables over the f7 stream. Everything is RAM-bounded
//! and moves through the external sort manager.

pub mod encoding;
pub mod fx;
pub mod park;
pub mod phase1;
pub mod phase2;
pub mod phase3;
pub mod phase4;
pub mod plotter;
pub mod progress;

pub use plotter::DiskPlotter;
pub use progress::{progress_none, ProgressCallback};
