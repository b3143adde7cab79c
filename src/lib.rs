//! Purpose: Library backing the `linespool` binary and its tests.
//! Exports: `core` (command log, records, errors), `protocol`, `serve`, `api`.
//! Role: Internal library; `api` is the surface the binary consumes.
//! Invariants: Core modules know nothing about sockets or threads.
pub mod api;
pub mod core;
pub mod protocol;
pub mod serve;
