pub mod config;
pub mod driver;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod params;
pub mod pool;
pub mod registry;
pub mod relay;
pub mod rows;
pub mod shutdown;

#[cfg(test)]
mod testing;

pub use config::{DatabaseConfig, GatewayConfig, PoolConfig, RelayConfig};
pub use driver::{Driver, ListenSession, RawNotification};
pub use error::{CleanupError, ConfigError, DbError, DbResult, GatewayError, Result, ValidationError};
pub use executor::{QueryExecutor, QueryRequest, QueryResult};
pub use gateway::Gateway;
pub use params::{decode_params, QueryParam};
pub use pool::{ConnectionPool, PoolStatus};
pub use registry::{ActiveListener, ListenerId, ListenerRegistry};
pub use relay::{ChannelName, NotificationEvent, RelayHandle, RelayState, StopReason, Subscription};
pub use shutdown::{ShutdownCoordinator, ShutdownReport};
