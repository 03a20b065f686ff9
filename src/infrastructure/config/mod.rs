mod settings;

pub use settings::{
    DatabaseConfig, DispatchSettings, EventSettings, IntakeConfig, LoggingConfig, OtelConfig,
    OverflowPolicy, RecoverySettings, RedisConfig, RetrySettings, SeedSettings, Settings,
    StoreBackend, StoreSettings, TransportConfig, TransportMode, TransportSettings,
};
