// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

use crate::error::{ParleyError, Result};

use super::Settings;

impl Settings {
    /// Get the provider API key, checking the env var first.
    pub fn api_key(&self) -> Option<String> {
        // Priority: env var > config file.
        std::env::var(&self.provider.api_key_env)
            .ok()
            .filter(|key| !key.is_empty())
            .or_else(|| self.provider.api_key.clone())
    }

    /// Reject values the pipeline cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.provider.base_url.trim().is_empty() {
            return Err(ParleyError::Config("provider.base_url is empty".into()));
        }
        if self.provider.model.trim().is_empty() {
            return Err(ParleyError::Config("provider.model is empty".into()));
        }
        if self.resilience.backoff_factor < 1.0 {
            return Err(ParleyError::Config(format!(
                "resilience.backoff_factor must be >= 1.0, got {}",
                self.resilience.backoff_factor
            )));
        }
        if self.resilience.max_delay_ms < self.resilience.initial_delay_ms {
            return Err(ParleyError::Config(
                "resilience.max_delay_ms is below initial_delay_ms".into(),
            ));
        }
        if self.resilience.request_timeout_ms == 0 {
            return Err(ParleyError::Config(
                "resilience.request_timeout_ms must be positive".into(),
            ));
        }
        if self.tools.max_concurrency == 0 {
            return Err(ParleyError::Config(
                "tools.max_concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_small_backoff() {
        let mut settings = Settings::default();
        settings.resilience.backoff_factor = 0.5;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("backoff_factor"));
    }

    #[test]
    fn test_validate_rejects_inverted_delays() {
        let mut settings = Settings::default();
        settings.resilience.initial_delay_ms = 5000;
        settings.resilience.max_delay_ms = 100;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_model() {
        let mut settings = Settings::default();
        settings.provider.model = "  ".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_api_key_falls_back_to_config() {
        let mut settings = Settings::default();
        settings.provider.api_key_env = "PARLEY_TEST_UNSET_KEY_VAR".to_string();
        settings.provider.api_key = Some("sk-config".to_string());
        assert_eq!(settings.api_key(), Some("sk-config".to_string()));
    }
}
