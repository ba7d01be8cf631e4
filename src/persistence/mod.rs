// =============================================================================
// Persistence — SQLite-backed repositories
// =============================================================================

pub mod database;
pub mod repositories;

pub use repositories::{
    ConfigRepository, LifecycleRepository, OptimizerAuditRepository, PositionRepository,
    Repositories, TradeRepository,
};
