//! Terminal rendering for command reports.

pub mod render;
