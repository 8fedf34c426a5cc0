//! The `config` module loads broker and client settings.
//!
//! Sources, lowest priority first: built-in defaults, an optional TOML file
//! (`config/default.toml` unless a path is given), a `.env` file, then
//! environment variables such as `MINIMQ_BROKER__ACK_TIMEOUT_MS`.

mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{
    BrokerSettings, ClientSettings, ConsumerSettings, LoggingSettings, PoolSettings,
    ProducerSettings, ServerSettings, Settings,
};

pub const DEFAULT_CONFIG_FILE: &str = "config/default";
pub const ENV_PREFIX: &str = "MINIMQ";

/// Loads the configuration from the default file and environment variables
/// and merges it over the default values.
pub fn load_config() -> Result<Settings, ConfigError> {
    build(File::with_name(DEFAULT_CONFIG_FILE).required(false))
}

/// Like [`load_config`], but the given file must exist.
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    build(File::with_name(path).required(true))
}

fn build<S>(file: S) -> Result<Settings, ConfigError>
where
    S: config::Source + Send + Sync + 'static,
{
    // A missing .env file is the normal case
    let _ = dotenvy::dotenv();

    let config = Config::builder()
        .add_source(file)
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    // Try to deserialize what is available, then fill the gaps
    let partial: PartialSettings = config.try_deserialize()?;
    let settings = partial.merge(Settings::default());
    settings.validate()?;
    Ok(settings)
}
