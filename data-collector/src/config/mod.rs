//! Application settings and configuration

mod settings;

pub use settings::{
    AggregateSettings, BreakerSettings, ChannelSettings, DatabaseSettings, IngestSettings,
    LateEventPolicy, MonitoringSettings, ReconnectionSettings, RetentionSettings, Settings,
    ShardSettings, SymbolSettings, ValidationSettings, VenueSettings,
};
