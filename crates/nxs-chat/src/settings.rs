use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const MAX_STATUS_EXPIRY_HOURS: u32 = 168;

/// Application-wide limits and switches, edited from the admin console.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemSettings {
    pub app_name: String,
    pub max_message_length: usize,
    pub max_status_length: usize,
    pub status_expiry_hours: u32,
    pub allow_random_chat: bool,
    pub require_email_verification: bool,
    pub maintenance_mode: bool,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            app_name: "NXS Chat".to_string(),
            max_message_length: 2000,
            max_status_length: 500,
            status_expiry_hours: 24,
            allow_random_chat: true,
            require_email_verification: false,
            maintenance_mode: false,
        }
    }
}

impl SystemSettings {
    pub fn validate(&self) -> Result<()> {
        if self.app_name.trim().is_empty() {
            return Err(ChatError::validation("App name is required"));
        }
        if self.max_message_length == 0 {
            return Err(ChatError::validation("Max message length must be positive"));
        }
        if self.max_status_length == 0 {
            return Err(ChatError::validation("Max status length must be positive"));
        }
        if !(1..=MAX_STATUS_EXPIRY_HOURS).contains(&self.status_expiry_hours) {
            return Err(ChatError::validation(format!(
                "Status expiry must be between 1 and {} hours",
                MAX_STATUS_EXPIRY_HOURS
            )));
        }
        Ok(())
    }

    /// Load from `path`, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        let settings: Self = nxs_common::read_json(path)?.unwrap_or_default();
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        nxs_common::write_json(path, self)?;
        tracing::info!("[Settings] Saved to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_validate_bounds() {
        assert!(SystemSettings::default().validate().is_ok());

        let mut s = SystemSettings::default();
        s.status_expiry_hours = 0;
        assert!(s.validate().is_err());
        s.status_expiry_hours = 169;
        assert!(s.validate().is_err());
        s.status_expiry_hours = 168;
        assert!(s.validate().is_ok());

        s.max_message_length = 0;
        assert!(matches!(s.validate(), Err(ChatError::Validation(_))));
    }

    #[test]
    fn test_load_missing_then_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("local").join("settings.json");
        assert_eq!(SystemSettings::load(&path).unwrap(), SystemSettings::default());

        let mut s = SystemSettings::default();
        s.allow_random_chat = false;
        s.save(&path).unwrap();
        assert!(!SystemSettings::load(&path).unwrap().allow_random_chat);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"maintenance_mode": true}"#).unwrap();
        let s = SystemSettings::load(&path).unwrap();
        assert!(s.maintenance_mode);
        assert_eq!(s.max_message_length, 2000);
    }

    #[test]
    fn test_save_rejects_invalid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut s = SystemSettings::default();
        s.max_status_length = 0;
        assert!(s.save(&path).is_err());
        assert!(!path.exists());
    }
}
