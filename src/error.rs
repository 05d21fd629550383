use crate::bootstrap::BootstrapError;
use crate::config::ConfigError;
use crate::pool::PoolError;
use crate::storage::SlotError;
use crate::tee::TeeError;
use crate::work_order::WorkOrderError;

/// Any failure a process-level entry point can report
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    WorkOrder(#[from] WorkOrderError),

    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    #[error(transparent)]
    Tee(#[from] TeeError),

    #[error(transparent)]
    Slot(#[from] SlotError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
