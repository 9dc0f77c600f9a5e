//! Layered configuration loading.
//!
//! Precedence, lowest first:
//! 1. built-in defaults ([`MarketplaceConfig::default`]),
//! 2. an optional file named by `GRIDTRADE_CONFIG` (default `config/gridtrade`,
//!    any extension the `config` crate understands),
//! 3. environment variables `GRIDTRADE__<SECTION>__<KEY>`, e.g.
//!    `GRIDTRADE__FEES__RATE=0.03`.

use config::{Config, Environment, File, Source};
use gridtrade_types::{GridError, MarketplaceConfig, Result};

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "GRIDTRADE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/gridtrade";
const ENV_PREFIX: &str = "GRIDTRADE";

/// Load and validate the marketplace configuration.
pub fn load() -> Result<MarketplaceConfig> {
    let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let file_required = std::env::var(CONFIG_PATH_ENV).is_ok();
    resolve(
        File::with_name(&path).required(file_required),
        environment(ENV_PREFIX),
    )
}

fn environment(prefix: &str) -> Environment {
    Environment::with_prefix(prefix)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

fn resolve<F>(file: F, env: Environment) -> Result<MarketplaceConfig>
where
    F: Source + Send + Sync + 'static,
{
    let defaults = Config::try_from(&MarketplaceConfig::default()).map_err(config_error)?;
    let config: MarketplaceConfig = Config::builder()
        .add_source(defaults)
        .add_source(file)
        .add_source(env)
        .build()
        .map_err(config_error)?
        .try_deserialize()
        .map_err(config_error)?;
    config.validate()?;
    Ok(config)
}

#[allow(clippy::needless_pass_by_value)]
fn config_error(err: config::ConfigError) -> GridError {
    GridError::Configuration(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;
    use rust_decimal::Decimal;

    fn quiet_env() -> Environment {
        environment("GRIDTRADE_SETTINGS_TEST_UNSET")
    }

    #[test]
    fn defaults_without_file() {
        let config = resolve(File::from_str("", FileFormat::Toml), quiet_env()).unwrap();
        assert_eq!(config.currency.code, "INR");
        assert_eq!(config.fees.rate, Decimal::new(250, 4));
        assert_eq!(config.callbacks.max_attempts, 5);
    }

    #[test]
    fn file_overrides_defaults() {
        let toml = r#"
            [currency]
            code = "EUR"

            [fees]
            rate = "0.01"

            [cancellation]
            buffer_minutes = 45

            [logging]
            json = true
        "#;
        let config = resolve(File::from_str(toml, FileFormat::Toml), quiet_env()).unwrap();
        assert_eq!(config.currency.code, "EUR");
        assert_eq!(config.fees.rate, Decimal::new(1, 2));
        assert_eq!(config.fees.cap, Decimal::new(500, 0));
        assert_eq!(config.cancellation.buffer_minutes, 45);
        assert!(config.logging.json);
        assert_eq!(config.orders.pending_ttl_secs, 900);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let toml = r#"
            [locks]
            lease_ttl_ms = 0
        "#;
        let err = resolve(File::from_str(toml, FileFormat::Toml), quiet_env()).unwrap_err();
        assert!(matches!(err, GridError::Configuration(_)));
    }

    #[test]
    fn malformed_file_is_a_configuration_error() {
        let err = resolve(File::from_str("[fees\nrate =", FileFormat::Toml), quiet_env()).unwrap_err();
        assert_eq!(err.wire_code(), "CONFIGURATION_ERROR");
    }
}
