//! Scenario-based tests for brick-runtime

mod cache_coalescing;
mod context_threading;
mod handoff;
mod trace_records;
