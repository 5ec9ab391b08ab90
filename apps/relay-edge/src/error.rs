use relay_bus::BusError;
use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum EdgeError {
    #[error("invalid worker configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Bus(#[from] BusError),
}
