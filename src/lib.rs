//! Compiles CNN layer graphs into fused operator-call source text plus chunked weight blobs.
pub mod compiler;
pub mod config;
pub mod model;
pub mod tensor;
