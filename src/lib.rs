pub mod bijectors;
pub mod config;
pub mod data;
pub mod distributions;
pub mod error;
pub mod hmc;
pub mod io;
pub mod model;
pub mod plot;
pub mod posterior;
pub mod stats;

pub use error::{BgmmError, Result};
