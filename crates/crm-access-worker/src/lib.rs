pub mod audit;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod effective;
pub mod error;
pub mod metrics;
pub mod resync;
pub mod rls;

pub use dispatcher::{Disposition, DispatcherConfig, OutboxDispatcher, SweepReport};
pub use effective::{BatchOutcome, EffectivePermissionComputer};
pub use error::{DispatchError, RecomputeError};
pub use metrics::DispatcherMetrics;
pub use rls::RlsEffectiveComputer;
