//! Runtime settings: TOML file + environment variable overrides.
//!
//! Priority: environment variables > config file > defaults.

use std::path::Path;
use std::time::Duration;

use bitcoin::secp256k1::PublicKey;
use bitcoin::{FeeRate, Network};
use serde::{Deserialize, Serialize};

use crate::combination::{CombinationEngine, DEFAULT_MAX_COMBINATIONS};
use crate::error::ThreshError;
use crate::policy::{MultiSigPolicy, PolicyBuilder, Scheme};
use crate::store::SessionStore;

/// Top-level settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub policy: PolicySection,

    #[serde(default)]
    pub signing: SigningSection,

    #[serde(default)]
    pub fees: FeeSection,

    #[serde(default)]
    pub logging: LoggingSection,
}

/// Policy construction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySection {
    /// Ceiling on C(n, k)
    #[serde(default = "default_max_combinations")]
    pub max_combinations: u64,

    /// "bitcoin", "testnet", "signet" or "regtest"
    #[serde(default = "default_network")]
    pub network: String,

    /// Owner public key (hex, compressed)
    #[serde(default)]
    pub owner: Option<String>,

    /// Signer public keys (hex, compressed), any order
    #[serde(default)]
    pub signers: Vec<String>,

    /// Required signers; all of them when unset
    #[serde(default)]
    pub threshold: Option<usize>,

    #[serde(default = "default_scheme")]
    pub scheme: Scheme,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            max_combinations: default_max_combinations(),
            network: default_network(),
            owner: None,
            signers: Vec::new(),
            threshold: None,
            scheme: default_scheme(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningSection {
    /// Idle seconds before a session is evicted
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,
}

impl Default for SigningSection {
    fn default() -> Self {
        Self {
            session_timeout_secs: default_session_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeSection {
    /// Extra size margin for the buffered candidate (0..=100)
    #[serde(default = "default_buffer_percent")]
    pub buffer_percent: u32,

    #[serde(default = "default_fee_rate")]
    pub fee_rate_sat_vb: u64,
}

impl Default for FeeSection {
    fn default() -> Self {
        Self {
            buffer_percent: default_buffer_percent(),
            fee_rate_sat_vb: default_fee_rate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_max_combinations() -> u64 {
    DEFAULT_MAX_COMBINATIONS
}

fn default_network() -> String {
    "regtest".to_string()
}

fn default_scheme() -> Scheme {
    Scheme::MuSig2
}

fn default_session_timeout() -> u64 {
    3600 // 1 hour
}

fn default_buffer_percent() -> u32 {
    50
}

fn default_fee_rate() -> u64 {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

// ============================================================================
// Loading & environment override
// ============================================================================

impl Settings {
    pub fn from_file(path: &Path) -> Result<Self, ThreshError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ThreshError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ThreshError> {
        toml::from_str(contents).map_err(|e| ThreshError::Config(format!("invalid TOML: {}", e)))
    }

    /// Apply environment variable overrides.
    ///
    /// Supported env vars:
    /// - `TAPTHRESH_MAX_COMBINATIONS`
    /// - `TAPTHRESH_NETWORK`
    /// - `TAPTHRESH_SESSION_TIMEOUT_SECS`
    /// - `TAPTHRESH_BUFFER_PERCENT`
    /// - `TAPTHRESH_FEE_RATE`
    /// - `TAPTHRESH_LOG`
    ///
    /// Unparseable numbers are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TAPTHRESH_MAX_COMBINATIONS") {
            if let Ok(max) = v.parse::<u64>() {
                self.policy.max_combinations = max;
            }
        }
        if let Ok(v) = std::env::var("TAPTHRESH_NETWORK") {
            self.policy.network = v;
        }
        if let Ok(v) = std::env::var("TAPTHRESH_SESSION_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse::<u64>() {
                self.signing.session_timeout_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("TAPTHRESH_BUFFER_PERCENT") {
            if let Ok(pct) = v.parse::<u32>() {
                self.fees.buffer_percent = pct;
            }
        }
        if let Ok(v) = std::env::var("TAPTHRESH_FEE_RATE") {
            if let Ok(rate) = v.parse::<u64>() {
                self.fees.fee_rate_sat_vb = rate;
            }
        }
        if let Ok(v) = std::env::var("TAPTHRESH_LOG") {
            self.logging.level = v;
        }
    }

    pub fn network(&self) -> Result<Network, ThreshError> {
        match self.policy.network.to_ascii_lowercase().as_str() {
            "bitcoin" | "mainnet" => Ok(Network::Bitcoin),
            "testnet" | "testnet3" => Ok(Network::Testnet),
            "signet" => Ok(Network::Signet),
            "regtest" => Ok(Network::Regtest),
            other => Err(ThreshError::Config(format!("unknown network: {}", other))),
        }
    }

    pub fn validate(&self) -> Result<(), ThreshError> {
        if self.policy.max_combinations == 0 {
            return Err(ThreshError::Config("policy.max_combinations must be > 0".into()));
        }
        self.network()?;
        if self.signing.session_timeout_secs == 0 {
            return Err(ThreshError::Config(
                "signing.session_timeout_secs must be > 0".into(),
            ));
        }
        if self.fees.buffer_percent > 100 {
            return Err(ThreshError::InvalidBuffer(self.fees.buffer_percent));
        }
        if self.fees.fee_rate_sat_vb == 0 {
            return Err(ThreshError::Config("fees.fee_rate_sat_vb must be > 0".into()));
        }
        Ok(())
    }

    pub fn combination_engine(&self) -> CombinationEngine {
        CombinationEngine::new(self.policy.max_combinations)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.signing.session_timeout_secs)
    }

    pub fn session_store(&self) -> SessionStore {
        SessionStore::new(self.session_timeout())
    }

    pub fn fee_rate(&self) -> Result<FeeRate, ThreshError> {
        FeeRate::from_sat_per_vb(self.fees.fee_rate_sat_vb)
            .ok_or_else(|| ThreshError::Config("fee rate overflows".into()))
    }

    /// Build the policy described by `[policy]`.
    pub fn build_policy(&self) -> Result<MultiSigPolicy, ThreshError> {
        let owner = self
            .policy
            .owner
            .as_deref()
            .ok_or_else(|| ThreshError::Config("policy.owner is not set".into()))?;
        let owner = parse_pubkey(owner)?;
        let signers = self
            .policy
            .signers
            .iter()
            .map(|s| parse_pubkey(s))
            .collect::<Result<Vec<_>, _>>()?;

        let mut builder = PolicyBuilder::new(owner, self.network()?)
            .signers(signers)
            .scheme(self.policy.scheme)
            .engine(self.combination_engine());
        if let Some(k) = self.policy.threshold {
            builder = builder.threshold(k);
        }
        builder.build()
    }
}

/// Parse a hex-encoded compressed public key.
pub fn parse_pubkey(s: &str) -> Result<PublicKey, ThreshError> {
    s.trim()
        .parse::<PublicKey>()
        .map_err(|e| ThreshError::Config(format!("invalid public key {}: {}", s, e)))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{owner_keypair, signer_keypairs};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn full_toml() -> String {
        let signers: Vec<String> = signer_keypairs(3)
            .iter()
            .map(|(_, pk)| format!("\"{}\"", pk))
            .collect();
        format!(
            r#"
[policy]
max_combinations = 5000
network = "testnet"
owner = "{}"
signers = [{}]
threshold = 2
scheme = "threshold"

[signing]
session_timeout_secs = 600

[fees]
buffer_percent = 25
fee_rate_sat_vb = 12

[logging]
level = "debug"
"#,
            owner_keypair().1,
            signers.join(", ")
        )
    }

    #[test]
    fn test_defaults_from_empty_file() {
        let file = NamedTempFile::new().unwrap();
        let settings = Settings::from_file(file.path()).unwrap();

        assert_eq!(settings.policy.max_combinations, 1_000_000);
        assert_eq!(settings.network().unwrap(), Network::Regtest);
        assert_eq!(settings.session_timeout(), Duration::from_secs(3600));
        assert_eq!(settings.fees.buffer_percent, 50);
        assert_eq!(settings.fees.fee_rate_sat_vb, 2);
        assert_eq!(settings.logging.level, "info");
        assert_eq!(settings.policy.scheme, Scheme::MuSig2);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", full_toml()).unwrap();

        let settings = Settings::from_file(file.path()).unwrap();
        assert_eq!(settings.policy.max_combinations, 5000);
        assert_eq!(settings.network().unwrap(), Network::Testnet);
        assert_eq!(settings.policy.signers.len(), 3);
        assert_eq!(settings.policy.scheme, Scheme::Threshold);
        assert_eq!(settings.signing.session_timeout_secs, 600);
        assert_eq!(settings.fees.buffer_percent, 25);
        assert_eq!(settings.fee_rate().unwrap(), FeeRate::from_sat_per_vb(12).unwrap());
        assert_eq!(settings.combination_engine().max_combinations(), 5000);
        assert_eq!(settings.session_store().timeout(), Duration::from_secs(600));
    }

    #[test]
    fn test_build_policy_from_config() {
        let settings = Settings::from_toml_str(&full_toml()).unwrap();
        let policy = settings.build_policy().unwrap();
        assert_eq!(policy.threshold(), 2);
        assert_eq!(policy.signer_count(), 3);
        assert_eq!(policy.scheme(), Scheme::Threshold);
        assert!(policy.address().to_string().starts_with("tb1p"));
    }

    #[test]
    fn test_build_policy_requires_owner() {
        let settings = Settings::default();
        assert!(matches!(settings.build_policy(), Err(ThreshError::Config(_))));
    }

    #[test]
    fn test_env_overrides() {
        let mut settings = Settings::from_toml_str(&full_toml()).unwrap();

        std::env::set_var("TAPTHRESH_MAX_COMBINATIONS", "42");
        std::env::set_var("TAPTHRESH_NETWORK", "signet");
        std::env::set_var("TAPTHRESH_BUFFER_PERCENT", "not-a-number");

        settings.apply_env_overrides();

        assert_eq!(settings.policy.max_combinations, 42);
        assert_eq!(settings.network().unwrap(), Network::Signet);
        assert_eq!(settings.fees.buffer_percent, 25);

        std::env::remove_var("TAPTHRESH_MAX_COMBINATIONS");
        std::env::remove_var("TAPTHRESH_NETWORK");
        std::env::remove_var("TAPTHRESH_BUFFER_PERCENT");
    }

    #[test]
    fn test_validation_failures() {
        let cases = [
            "[policy]\nmax_combinations = 0",
            "[policy]\nnetwork = \"moonnet\"",
            "[signing]\nsession_timeout_secs = 0",
            "[fees]\nbuffer_percent = 101",
            "[fees]\nfee_rate_sat_vb = 0",
        ];
        for toml in cases {
            let settings = Settings::from_toml_str(toml).unwrap();
            assert!(settings.validate().is_err(), "accepted: {}", toml);
        }
    }

    #[test]
    fn test_malformed_toml() {
        assert!(matches!(
            Settings::from_toml_str("[policy\nnetwork ="),
            Err(ThreshError::Config(_))
        ));
    }

    #[test]
    fn test_serde_roundtrip() {
        let settings = Settings::from_toml_str(&full_toml()).unwrap();
        let serialized = toml::to_string_pretty(&settings).unwrap();
        let reparsed = Settings::from_toml_str(&serialized).unwrap();
        assert_eq!(reparsed.policy.signers, settings.policy.signers);
        assert_eq!(reparsed.fees.buffer_percent, settings.fees.buffer_percent);
    }
}
