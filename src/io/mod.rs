//! Export of sampler output.

#[cfg(feature = "csv")]
pub mod csv;
