use crate::controller::candle::RetryPolicy;
use crate::models::timeframe_duration;
use crate::strategy::ma_cross::MaCrossConfig;
use crate::{Error, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;

const ENV_PREFIX: &str = "TRENDALERT";
const DEFAULT_CONFIG_FILE: &str = "config/default";

/// Conventional credential variables, applied on top of every other source
const CREDENTIAL_ENV: &[(&str, &str)] = &[
    ("binance.api_key", "BINANCE_API_KEY"),
    ("binance.api_secret", "BINANCE_API_SECRET"),
    ("telegram.token", "TELEGRAM_TOKEN"),
    ("telegram.chat_id", "TELEGRAM_CHAT_ID"),
];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BinanceConfig {
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub base_url: String,
    pub requests_per_second: u32,
    pub request_timeout_ms: u64,
    /// WebSocket endpoint for live kline streams
    pub ws_url: String,
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_secret: None,
            base_url: "https://api.binance.com".to_string(),
            requests_per_second: 20,
            request_timeout_ms: 5_000,
            ws_url: "wss://stream.binance.com:9443".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub token: Option<String>,
    pub chat_id: Option<i64>,
    pub base_url: String,
    pub messages_per_second: u32,
    pub burst: u32,
    pub timeout_ms: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            token: None,
            chat_id: None,
            base_url: "https://api.telegram.org".to_string(),
            messages_per_second: 30,
            burst: 1,
            timeout_ms: 5_000,
        }
    }
}

/// Application configuration, passed explicitly to every component
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub binance: BinanceConfig,
    pub telegram: TelegramConfig,
    /// Symbols to watch; empty means every trading symbol in `quote_asset`
    pub symbols: Vec<String>,
    pub excluded_symbols: Vec<String>,
    pub quote_asset: String,
    pub timeframes: Vec<String>,
    pub strategy: MaCrossConfig,
    pub stream: RetryPolicy,
    pub symbol_refresh_secs: u64,
    pub alert_queue_capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            binance: BinanceConfig::default(),
            telegram: TelegramConfig::default(),
            symbols: Vec::new(),
            excluded_symbols: Vec::new(),
            quote_asset: "USDT".to_string(),
            timeframes: vec!["4h".to_string()],
            strategy: MaCrossConfig::default(),
            stream: RetryPolicy::default(),
            symbol_refresh_secs: 30 * 60,
            alert_queue_capacity: 256,
        }
    }
}

impl AppConfig {
    /// Layer defaults, the config file, `TRENDALERT_*` variables and the
    /// credential variables, then validate
    ///
    /// Without an explicit path, `config/default.{toml,json,yaml}` is used
    /// when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let mut builder = Config::builder().add_source(file).add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("symbols")
                .with_list_parse_key("excluded_symbols")
                .with_list_parse_key("timeframes"),
        );

        for (key, var) in CREDENTIAL_ENV {
            builder = builder.set_override_option(*key, std::env::var(var).ok())?;
        }

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Checks shared by live and backtest runs
    pub fn validate(&self) -> Result<()> {
        if self.timeframes.is_empty() {
            return Err(Error::Config("at least one timeframe is required".to_string()));
        }
        if let Some(bad) = self
            .timeframes
            .iter()
            .find(|tf| timeframe_duration(tf).is_none())
        {
            return Err(Error::Config(format!("unsupported timeframe {:?}", bad)));
        }
        if self.strategy.ma_period == 0 || self.strategy.volume_period == 0 {
            return Err(Error::Config(
                "strategy.ma_period and strategy.volume_period must be positive".to_string(),
            ));
        }
        if self.stream.initial_backoff_ms > self.stream.max_backoff_ms {
            return Err(Error::Config(
                "stream.initial_backoff_ms must not exceed stream.max_backoff_ms".to_string(),
            ));
        }
        if self.alert_queue_capacity == 0 {
            return Err(Error::Config("alert_queue_capacity must be positive".to_string()));
        }
        if self.symbol_refresh_secs == 0 {
            return Err(Error::Config("symbol_refresh_secs must be positive".to_string()));
        }
        if self.binance.requests_per_second == 0
            || self.telegram.messages_per_second == 0
            || self.telegram.burst == 0
        {
            return Err(Error::Config("rate limits must be positive".to_string()));
        }
        Ok(())
    }

    /// Credentials required to talk to Binance and Telegram
    pub fn validate_live(&self) -> Result<()> {
        fn required(value: &Option<String>, name: &str) -> Result<()> {
            match value.as_deref().map(str::trim) {
                Some(v) if !v.is_empty() => Ok(()),
                _ => Err(Error::Config(format!("{} is required", name))),
            }
        }

        required(&self.binance.api_key, "binance.api_key")?;
        required(&self.binance.api_secret, "binance.api_secret")?;
        required(&self.telegram.token, "telegram.token")?;
        if self.telegram.chat_id.is_none() {
            return Err(Error::Config("telegram.chat_id is required".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.strategy.ma_period, 200);
        assert_eq!(config.symbol_refresh_secs, 1800);
        assert_eq!(config.binance.requests_per_second, 20);
    }

    #[test]
    fn test_missing_credentials() {
        let config = AppConfig::default();
        let err = config.validate_live().unwrap_err();
        assert!(err.to_string().contains("binance.api_key"));

        let mut config = AppConfig::default();
        config.binance.api_key = Some("k".to_string());
        config.binance.api_secret = Some("s".to_string());
        config.telegram.token = Some("  ".to_string());
        let err = config.validate_live().unwrap_err();
        assert!(err.to_string().contains("telegram.token"));

        config.telegram.token = Some("t".to_string());
        assert!(config.validate_live().is_err());
        config.telegram.chat_id = Some(42);
        assert!(config.validate_live().is_ok());
    }

    #[test]
    fn test_invalid_tunables() {
        let mut config = AppConfig::default();
        config.timeframes = vec!["4x".to_string()];
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = AppConfig::default();
        config.timeframes.clear();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.alert_queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.stream.initial_backoff_ms = config.stream.max_backoff_ms + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join(format!("trendalert-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bot.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
symbols = ["BTCUSDT", "ETHUSDT"]
timeframes = ["1h", "4h"]

[strategy]
ma_period = 50

[stream]
max_attempts = 3
"#
        )
        .unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(config.timeframes, vec!["1h", "4h"]);
        assert_eq!(config.strategy.ma_period, 50);
        assert_eq!(config.strategy.volume_period, MaCrossConfig::default().volume_period);
        assert_eq!(config.stream.max_attempts, Some(3));
        assert_eq!(config.quote_asset, "USDT");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let result = AppConfig::load(Some(Path::new("/nonexistent/trendalert.toml")));
        assert!(matches!(result, Err(Error::ConfigLoad(_))));
    }
}
