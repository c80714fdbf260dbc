// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : signal_exec_bot — signal-to-order execution core for Bybit v5
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Receives TradingView-style webhook signals, deduplicates them with
          a symbol-side lock, serializes execution per symbol, reconciles
          against live positions, clamps size to margin and lot rules,
          watches the private order stream to place trailing stops,
          exposes Prometheus metrics, and records JSONL events.
=============================================================================
*/
use std::env;
use std::str::FromStr;

use clap::Parser;
use dotenvy::dotenv;
use rust_decimal::Decimal;

/// Bybit environment per akun
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeEnv {
    Demo,
    Testnet,
    Mainnet,
}

impl ExchangeEnv {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "demo" => Some(ExchangeEnv::Demo),
            "testnet" => Some(ExchangeEnv::Testnet),
            "mainnet" | "live" | "prod" => Some(ExchangeEnv::Mainnet),
            _ => None,
        }
    }

    pub fn from_env(key: &str, default_mode: ExchangeEnv) -> ExchangeEnv {
        env::var(key).ok().and_then(|v| Self::parse(&v)).unwrap_or(default_mode)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeEnv::Demo => "demo",
            ExchangeEnv::Testnet => "testnet",
            ExchangeEnv::Mainnet => "mainnet",
        }
    }

    // Endpoint default per mode
    pub fn default_rest_url(&self) -> &'static str {
        match self {
            ExchangeEnv::Demo => "https://api-demo.bybit.com",
            ExchangeEnv::Testnet => "https://api-testnet.bybit.com",
            ExchangeEnv::Mainnet => "https://api.bybit.com",
        }
    }

    pub fn default_ws_url(&self) -> &'static str {
        match self {
            ExchangeEnv::Demo => "wss://stream-demo.bybit.com/v5/private",
            ExchangeEnv::Testnet => "wss://stream-testnet.bybit.com/v5/private",
            ExchangeEnv::Mainnet => "wss://stream.bybit.com/v5/private",
        }
    }
}

/// Satu akun Bybit (sandbox atau production)
#[derive(Clone, Debug)]
pub struct Account {
    pub mode: ExchangeEnv,
    pub rest_url: String,
    pub ws_url: String,
    pub api_key: String,
    pub api_secret: String,
}

impl Account {
    /// `None` kalau key/secret kosong: akun itu dianggap tidak dikonfigurasi.
    pub fn from_parts(
        mode: ExchangeEnv,
        api_key: Option<String>,
        api_secret: Option<String>,
        rest_url: Option<String>,
        ws_url: Option<String>,
    ) -> Option<Account> {
        let api_key = api_key.filter(|k| !k.trim().is_empty())?;
        let api_secret = api_secret.filter(|s| !s.trim().is_empty())?;
        Some(Account {
            mode,
            rest_url: rest_url.unwrap_or_else(|| mode.default_rest_url().to_string()),
            ws_url: ws_url.unwrap_or_else(|| mode.default_ws_url().to_string()),
            api_key,
            api_secret,
        })
    }

    fn from_env(prefix: &str, default_mode: ExchangeEnv) -> Option<Account> {
        let mode = ExchangeEnv::from_env(&format!("{prefix}_MODE"), default_mode);
        Self::from_parts(
            mode,
            env::var(format!("{prefix}_API_KEY")).ok(),
            env::var(format!("{prefix}_API_SECRET")).ok(),
            env::var(format!("{prefix}_REST_URL")).ok(),
            env::var(format!("{prefix}_WS_URL")).ok(),
        )
    }
}

#[derive(Clone, Debug)]
pub struct Telegram {
    pub base_url: String,
    pub bot_token: String,
    pub chat_id: String,
}

/// Override CLI di atas ENV
#[derive(Parser, Debug, Default)]
#[command(name = "signal_exec_bot", about = "Bybit signal execution core")]
pub struct Cli {
    /// HTTP port (ingress + /metrics); overrides HTTP_PORT
    #[arg(long)]
    pub port: Option<u16>,

    /// Ignore production credentials even if set
    #[arg(long, default_value_t = false)]
    pub sandbox_only: bool,

    /// JSONL journal path; overrides RECORD_FILE
    #[arg(long)]
    pub record_file: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Args {
    pub http_port: u16,
    pub record_file: Option<String>,

    // accounts
    pub sandbox: Option<Account>,
    pub production: Option<Account>,

    // execution tunables
    pub lock_period_secs: u64,
    pub recv_window_ms: u64,
    pub trailing_stop_distance: Decimal,
    pub default_leverage: u32,

    // collaborators (None -> in-process fallback)
    pub redis_url: Option<String>,
    pub database_url: Option<String>,
    pub telegram: Option<Telegram>,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}

pub fn load() -> Args {
    // Pastikan .env dibaca sebelum CLI/ENV diproses
    let _ = dotenv();
    let cli = Cli::parse();
    from_env(cli)
}

pub fn from_env(cli: Cli) -> Args {
    let sandbox = Account::from_env("BYBIT_SANDBOX", ExchangeEnv::Demo);
    let production = if cli.sandbox_only { None } else { Account::from_env("BYBIT_PROD", ExchangeEnv::Mainnet) };

    let telegram = match (env_opt("TELEGRAM_BOT_TOKEN"), env_opt("TELEGRAM_CHAT_ID")) {
        (Some(bot_token), Some(chat_id)) => Some(Telegram {
            base_url: env_opt("TELEGRAM_BASE_URL").unwrap_or_else(|| crate::notify::TELEGRAM_API_BASE.to_string()),
            bot_token,
            chat_id,
        }),
        _ => None,
    };

    Args {
        http_port: cli.port.unwrap_or_else(|| env_parse("HTTP_PORT", 8080)),
        record_file: cli.record_file.or_else(|| env_opt("RECORD_FILE")),
        sandbox,
        production,
        lock_period_secs: env_parse("LOCK_PERIOD_SECS", 10),
        recv_window_ms: env_parse("RECV_WINDOW_MS", crate::bybit::RECV_WINDOW_MS),
        trailing_stop_distance: env_parse("TRAILING_STOP_DISTANCE", Decimal::from(20)),
        default_leverage: env_parse("DEFAULT_LEVERAGE", 1u32).max(1),
        redis_url: env_opt("REDIS_URL"),
        database_url: env_opt("DATABASE_URL"),
        telegram,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_env_parsing_and_urls() {
        assert_eq!(ExchangeEnv::parse("Demo"), Some(ExchangeEnv::Demo));
        assert_eq!(ExchangeEnv::parse(" testnet "), Some(ExchangeEnv::Testnet));
        assert_eq!(ExchangeEnv::parse("live"), Some(ExchangeEnv::Mainnet));
        assert_eq!(ExchangeEnv::parse("binance"), None);
        assert_eq!(ExchangeEnv::Mainnet.default_rest_url(), "https://api.bybit.com");
        assert!(ExchangeEnv::Demo.default_ws_url().ends_with("/v5/private"));
    }

    #[test]
    fn account_requires_both_credentials() {
        assert!(Account::from_parts(ExchangeEnv::Demo, Some("k".into()), None, None, None).is_none());
        assert!(Account::from_parts(ExchangeEnv::Demo, Some("".into()), Some("s".into()), None, None).is_none());

        let acc = Account::from_parts(
            ExchangeEnv::Testnet,
            Some("k".into()),
            Some("s".into()),
            Some("http://localhost:1234".into()),
            None,
        )
        .unwrap();
        assert_eq!(acc.rest_url, "http://localhost:1234");
        assert_eq!(acc.ws_url, "wss://stream-testnet.bybit.com/v5/private");
    }
}
