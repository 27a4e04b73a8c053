pub use self::parser::{
    BridgeConfig, CacheConfig, Config, DatabaseConfig, DbType, LoggingConfig, MatrixConfig,
    MediaConfig, PowerLevelsConfig, RegistrationConfig,
};
pub use self::validator::ConfigError;

mod parser;
mod validator;
