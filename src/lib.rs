//! Library surface for the delta package builder: every component (C1–C10, A1–A3) is exposed
//! here so `src/main.rs` and `tests/` exercise the exact same code, instead of the binary
//! re-implementing the pipeline behind a process boundary.

pub mod amalgamator;
pub mod cache;
pub mod chunks;
pub mod config;
pub mod extract;
pub mod io_util;
pub mod manifest;
pub mod ordering;
pub mod package;
pub mod patch_select;
pub mod planner;
pub mod pkgdiff;
pub mod pool;
pub mod tools;
