// config.rs - Load configuration from environment variables

use alloy::primitives::Address;
use std::{env::var, num::ParseIntError};

/// Minimum challenge duration accepted at channel creation, in seconds.
pub const MIN_CHALLENGE_PERIOD: u64 = 3600;

/// Configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP/WebSocket server listens on (e.g., 3000)
    pub port: u16,

    /// Database connection string
    /// e.g., "sqlite://broker.db?mode=rwc" or "sqlite::memory:"
    pub database_url: String,

    /// Blockchain RPC endpoint
    pub rpc_url: String,

    /// Chain ID for EIP-712 signatures
    pub chain_id: u64,

    /// Broker's private key (hex string with 0x prefix)
    /// This wallet co-signs channel states and app-session updates
    pub broker_private_key: String,

    /// Address of the custody contract holding channel escrow
    pub custody: Address,

    /// Default adjudicator address for broker-proposed channels
    pub adjudicator: Address,

    /// HMAC secret for issued JWTs
    pub jwt_secret: String,

    /// Challenge duration the broker proposes for new channels, seconds
    pub challenge_duration: u64,

    /// Ceiling for an in-flight RPC request, seconds
    pub request_timeout: u64,

    /// Ceiling for an unfinished auth handshake, seconds
    pub auth_timeout: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, String> {
        Ok(Config {
            port: get_env("PORT")?
                .parse()
                .map_err(|e: ParseIntError| e.to_string())?,

            database_url: get_env("DATABASE_URL")?,
            rpc_url: get_env("RPC_URL")?,

            chain_id: get_env("CHAIN_ID")?
                .parse()
                .map_err(|e: ParseIntError| e.to_string())?,

            // Kept as string - parsed later by PrivateKeySigner
            broker_private_key: get_env("BROKER_PRIVATE_KEY")?,

            custody: get_env("CUSTODY_ADDRESS")?
                .parse()
                .map_err(|e| format!("invalid custody address: {}", e))?,

            adjudicator: get_env("ADJUDICATOR_ADDRESS")?
                .parse()
                .map_err(|e| format!("invalid adjudicator address: {}", e))?,

            jwt_secret: get_env("JWT_SECRET")?,

            challenge_duration: get_env_or("CHALLENGE_DURATION", "86400")
                .parse()
                .map_err(|e: ParseIntError| e.to_string())?,

            request_timeout: get_env_or("REQUEST_TIMEOUT", "10")
                .parse()
                .map_err(|e: ParseIntError| e.to_string())?,

            auth_timeout: get_env_or("AUTH_TIMEOUT", "60")
                .parse()
                .map_err(|e: ParseIntError| e.to_string())?,
        })
    }
}

/// Get a required environment variable
fn get_env(key: &str) -> Result<String, String> {
    var(key).map_err(|_| format!("Missing environment variable: {}", key))
}

/// Get an optional environment variable with a default
fn get_env_or(key: &str, default: &str) -> String {
    var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_load_config_from_env() {
        env::set_var("PORT", "4010");
        env::set_var("DATABASE_URL", "sqlite::memory:");
        env::set_var("RPC_URL", "http://localhost:8545");
        env::set_var("CHAIN_ID", "31337");
        env::set_var(
            "BROKER_PRIVATE_KEY",
            "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
        );
        env::set_var("CUSTODY_ADDRESS", "0x5FbDB2315678afecb367f032d93F642f64180aa3");
        env::set_var(
            "ADJUDICATOR_ADDRESS",
            "0xe7f1725E7734CE288F8367e1Bb143E90bb3F0512",
        );
        env::set_var("JWT_SECRET", "test-secret");

        let config = Config::from_env().expect("config should load");

        assert_eq!(config.port, 4010);
        assert_eq!(config.chain_id, 31337);
        assert_eq!(config.database_url, "sqlite::memory:");
        // Defaults apply when the tunables are unset
        assert_eq!(config.request_timeout, 10);
        assert_eq!(config.auth_timeout, 60);
        assert_eq!(
            config.custody,
            "0x5FbDB2315678afecb367f032d93F642f64180aa3"
                .parse::<Address>()
                .unwrap()
        );
    }
}
