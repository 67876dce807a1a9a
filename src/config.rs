//! Configuration for the hub.
//! Environment variables with defaults for everything except credentials,
//! plus the runtime-mutable knobs the admin config endpoint can change.

use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Fallback market-maker address used when the settlement service has not
/// told us ours yet (offline development).
pub const DEV_MM_ADDRESS: &str = "0x00000000000000000000000000000000000dev00";

/// Process-wide static configuration, read once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    pub port: u16,
    pub db_path: String,
    pub clearnode_url: String,
    pub mm_private_key: Option<String>,
    pub application_name: String,
    pub faucet_url: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            port: 3001,
            db_path: "data/pitchside.db".to_string(),
            clearnode_url: "wss://clearnet-sandbox.yellow.com/ws".to_string(),
            mm_private_key: None,
            application_name: "pitchside".to_string(),
            faucet_url: "https://clearnet-sandbox.yellow.com/faucet/requestTokens".to_string(),
        }
    }
}

impl HubConfig {
    /// Load configuration from environment variables with fallback to defaults.
    pub fn from_env() -> Self {
        let mut config = HubConfig::default();

        if let Ok(port) = env::var("PORT") {
            config.port = port.parse().unwrap_or(config.port);
        }
        if let Ok(db_path) = env::var("DB_PATH") {
            if !db_path.trim().is_empty() {
                config.db_path = db_path;
            }
        }
        if let Ok(url) = env::var("CLEARNODE_URL") {
            if !url.trim().is_empty() {
                config.clearnode_url = url;
            }
        }
        if let Ok(key) = env::var("MM_PRIVATE_KEY") {
            if !key.trim().is_empty() {
                config.mm_private_key = Some(key);
            }
        }
        if let Ok(name) = env::var("APPLICATION_NAME") {
            if !name.trim().is_empty() {
                config.application_name = name;
            }
        }
        if let Ok(url) = env::var("FAUCET_URL") {
            if !url.trim().is_empty() {
                config.faucet_url = url;
            }
        }

        config
    }
}

/// Runtime-mutable settings, shared across managers so concurrent reads stay
/// consistent. Mutated only by the admin config endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Percent fee withheld from winner payouts (0..100).
    pub transaction_fee_percent: f64,
    /// Multiplier applied to the pool value when auto-scaling `b` at open.
    pub lmsr_sensitivity_factor: f64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            transaction_fee_percent: 2.0,
            lmsr_sensitivity_factor: 0.01,
        }
    }
}

impl RuntimeSettings {
    fn from_env() -> Self {
        let mut settings = RuntimeSettings::default();
        if let Ok(fee) = env::var("TRANSACTION_FEE_PERCENT") {
            let parsed: f64 = fee.parse().unwrap_or(settings.transaction_fee_percent);
            settings.transaction_fee_percent = parsed.clamp(0.0, 100.0);
        }
        settings
    }
}

/// Shared holder for the runtime settings. Passed to managers; never a global.
#[derive(Clone)]
pub struct Settings {
    inner: Arc<RwLock<RuntimeSettings>>,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            inner: Arc::new(RwLock::new(RuntimeSettings::from_env())),
        }
    }

    pub fn with(values: RuntimeSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(values)),
        }
    }

    pub async fn snapshot(&self) -> RuntimeSettings {
        *self.inner.read().await
    }

    pub async fn transaction_fee_percent(&self) -> f64 {
        self.inner.read().await.transaction_fee_percent
    }

    pub async fn lmsr_sensitivity_factor(&self) -> f64 {
        self.inner.read().await.lmsr_sensitivity_factor
    }

    /// Apply a partial update; out-of-range values are rejected.
    pub async fn update(
        &self,
        transaction_fee_percent: Option<f64>,
        lmsr_sensitivity_factor: Option<f64>,
    ) -> Result<RuntimeSettings, String> {
        if let Some(fee) = transaction_fee_percent {
            if !(0.0..=100.0).contains(&fee) {
                return Err(format!("transactionFeePercent out of range: {fee}"));
            }
        }
        if let Some(factor) = lmsr_sensitivity_factor {
            if !(factor.is_finite() && factor > 0.0) {
                return Err(format!("lmsrSensitivityFactor must be positive: {factor}"));
            }
        }
        let mut guard = self.inner.write().await;
        if let Some(fee) = transaction_fee_percent {
            guard.transaction_fee_percent = fee;
        }
        if let Some(factor) = lmsr_sensitivity_factor {
            guard.lmsr_sensitivity_factor = factor;
        }
        Ok(*guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_everything_but_credentials() {
        let config = HubConfig::default();
        assert!(config.port > 0);
        assert!(!config.db_path.is_empty());
        assert!(!config.clearnode_url.is_empty());
        assert!(!config.faucet_url.is_empty());
        assert!(config.mm_private_key.is_none());
    }

    #[tokio::test]
    async fn settings_updates_are_validated() {
        let settings = Settings::with(RuntimeSettings::default());
        assert!(settings.update(Some(150.0), None).await.is_err());
        assert!(settings.update(None, Some(-0.5)).await.is_err());

        let updated = settings.update(Some(5.0), Some(0.02)).await.unwrap();
        assert_eq!(updated.transaction_fee_percent, 5.0);
        assert_eq!(updated.lmsr_sensitivity_factor, 0.02);
        assert_eq!(settings.transaction_fee_percent().await, 5.0);
    }
}
