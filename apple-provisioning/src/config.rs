// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Configuration files.

Configuration is YAML (or JSON, by `.json` extension). Every key is optional:

```yaml
team_id: ABCDE12345
distribution: ad-hoc
min_profile_validity_days: 30
test_devices:
  - 00008030-001A2B3C4D5E6F70
prefer_xcode_managed: false
credentials:
  api_key_path: ~/.appstoreconnect/key.json
keychain:
  path: /Users/ci/Library/Keychains/build.keychain-db
  password: hunter2
retry:
  max_attempts: 3
  backoff_seconds: 2
timeout_seconds: 60
```

`team_id` selects the team for projects that do not name one, and for Apple
ID sessions that do not carry one.
*/

use {
    crate::{
        developer_portal::{
            api_token::{ConnectTokenEncoder, UnifiedApiKey},
            session::SessionCredentials,
            Authenticator,
        },
        AppLayout, DistributionType, Keychain, ProvisioningError, RetryPolicy,
    },
    log::debug,
    serde::{Deserialize, Serialize},
    std::{
        path::{Path, PathBuf},
        time::Duration,
    },
};

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_seconds() -> u64 {
    2
}

fn default_timeout_seconds() -> u64 {
    60
}

/// Credentials for the developer portal.
///
/// Exactly one of an API key or an Apple ID session may be configured.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Unified JSON API key file.
    pub api_key_path: Option<PathBuf>,
    pub api_key_id: Option<String>,
    pub api_issuer_id: Option<String>,
    /// `AuthKey_<id>.p8` file. Searched for by key id when absent.
    pub api_private_key_path: Option<PathBuf>,
    /// Use the enterprise program API.
    pub enterprise: bool,
    /// Saved Apple ID session file.
    pub session_path: Option<PathBuf>,
}

impl CredentialsConfig {
    fn has_api_key(&self) -> bool {
        self.api_key_path.is_some()
            || self.api_key_id.is_some()
            || self.api_issuer_id.is_some()
            || self.api_private_key_path.is_some()
    }

    fn api_key_encoder(&self) -> Result<ConnectTokenEncoder, ProvisioningError> {
        if let Some(path) = &self.api_key_path {
            if self.api_key_id.is_some()
                || self.api_issuer_id.is_some()
                || self.api_private_key_path.is_some()
            {
                return Err(ProvisioningError::Configuration(
                    "api_key_path cannot be combined with other API key settings".into(),
                ));
            }

            debug!("loading API key from {}", path.display());
            return UnifiedApiKey::from_json_path(path)?.try_into();
        }

        let (key_id, issuer_id) = match (&self.api_key_id, &self.api_issuer_id) {
            (Some(key_id), Some(issuer_id)) => (key_id.clone(), issuer_id.clone()),
            (None, _) => {
                return Err(ProvisioningError::Configuration(
                    "API key id is required".into(),
                ))
            }
            (_, None) => {
                return Err(ProvisioningError::Configuration(
                    "API issuer id is required".into(),
                ))
            }
        };

        match &self.api_private_key_path {
            Some(path) => ConnectTokenEncoder::from_ecdsa_pem_path(key_id, issuer_id, path),
            None => ConnectTokenEncoder::from_api_key_id(key_id, issuer_id),
        }
    }

    /// Construct the [Authenticator] the credentials describe.
    ///
    /// `team_id` is used for sessions that do not name a team themselves.
    pub fn authenticator(&self, team_id: Option<&str>) -> Result<Authenticator, ProvisioningError> {
        match (self.has_api_key(), &self.session_path) {
            (true, Some(_)) => Err(ProvisioningError::AuthSelection(
                "both an API key and an Apple ID session are configured; use one".into(),
            )),
            (false, None) => Err(ProvisioningError::AuthSelection(
                "no API key or Apple ID session is configured".into(),
            )),
            (true, None) => {
                let encoder = self.api_key_encoder()?;

                Ok(Authenticator::api_key(if self.enterprise {
                    encoder.for_enterprise()
                } else {
                    encoder
                }))
            }
            (false, Some(path)) => {
                debug!("loading Apple ID session from {}", path.display());
                let mut session = SessionCredentials::from_json_path(path)?;

                if session.team_id.is_none() {
                    session.team_id = team_id.map(|t| t.to_string());
                }

                Ok(Authenticator::session(session))
            }
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct KeychainConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub password: Option<String>,
}

impl From<KeychainConfig> for Keychain {
    fn from(v: KeychainConfig) -> Self {
        Self {
            path: v.path,
            password: v.password,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_seconds")]
    pub backoff_seconds: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_seconds: default_backoff_seconds(),
        }
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(v: RetryConfig) -> Self {
        Self {
            max_attempts: v.max_attempts,
            backoff: Duration::from_secs(v.backoff_seconds),
        }
    }
}

/// Settings of a provisioning run.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    pub credentials: CredentialsConfig,
    pub team_id: Option<String>,
    pub distribution: Option<DistributionType>,
    pub min_profile_validity_days: u32,
    pub test_devices: Vec<String>,
    pub prefer_xcode_managed: bool,
    pub keychain: Option<KeychainConfig>,
    pub profiles_dir: Option<PathBuf>,
    pub certificate_dir: Option<PathBuf>,
    pub retry: RetryConfig,
    pub timeout_seconds: u64,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            credentials: CredentialsConfig::default(),
            team_id: None,
            distribution: None,
            min_profile_validity_days: 0,
            test_devices: vec![],
            prefer_xcode_managed: false,
            keychain: None,
            profiles_dir: None,
            certificate_dir: None,
            retry: RetryConfig::default(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl ProvisioningConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self, ProvisioningError> {
        Ok(serde_yaml::from_str(s)?)
    }

    pub fn from_json_str(s: &str) -> Result<Self, ProvisioningError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Load a file, parsed as JSON if its extension is `.json` and YAML otherwise.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ProvisioningError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)?;

        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            Self::from_json_str(&data)
        } else {
            Self::from_yaml_str(&data)
        }
    }

    pub fn distribution_type(&self) -> DistributionType {
        self.distribution.unwrap_or(DistributionType::Development)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.into()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn authenticator(&self) -> Result<Authenticator, ProvisioningError> {
        self.credentials.authenticator(self.team_id.as_deref())
    }

    /// Sign for the configured team when the project does not name one.
    pub fn apply_to_layout(&self, layout: &mut AppLayout) {
        if layout.team_id.is_none() {
            layout.team_id = self.team_id.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::CredentialKind, indoc::indoc};

    #[test]
    fn yaml_with_defaults() -> Result<(), ProvisioningError> {
        let config = ProvisioningConfig::from_yaml_str(indoc! {"
            team_id: ABCDE12345
            distribution: ad-hoc
            test_devices:
              - 00008030-001A2B3C4D5E6F70
            keychain:
              path: /tmp/build.keychain-db
            retry:
              max_attempts: 5
        "})?;

        assert_eq!(config.distribution_type(), DistributionType::AdHoc);
        assert_eq!(config.test_devices.len(), 1);
        assert_eq!(config.keychain.as_ref().unwrap().password, None);
        assert_eq!(
            config.retry_policy(),
            RetryPolicy {
                max_attempts: 5,
                backoff: Duration::from_secs(2),
            }
        );
        assert_eq!(config.timeout(), Duration::from_secs(60));

        let mut layout = AppLayout::new(crate::Platform::Ios);
        config.apply_to_layout(&mut layout);
        assert_eq!(layout.team_id.as_deref(), Some("ABCDE12345"));

        layout.team_id = Some("FGHIJ67890".into());
        config.apply_to_layout(&mut layout);
        assert_eq!(layout.team_id.as_deref(), Some("FGHIJ67890"));

        let empty = ProvisioningConfig::from_yaml_str("{}")?;
        assert_eq!(empty, ProvisioningConfig::default());
        assert_eq!(empty.distribution_type(), DistributionType::Development);

        Ok(())
    }

    #[test]
    fn credential_selection() -> Result<(), ProvisioningError> {
        let td = tempfile::tempdir()?;

        let session_path = td.path().join("session.json");
        std::fs::write(
            &session_path,
            r#"{"apple_id": "dev@example.com", "session_cookies": {
                "https://developer.apple.com": [{"name": "DSESSIONID", "value": "s1"}]
            }}"#,
        )?;

        let key_path = td.path().join("key.json");
        std::fs::write(
            &key_path,
            r#"{"issuer_id": "issuer", "key_id": "DEADBEEF42", "private_key": "MAMCAQA="}"#,
        )?;

        let mut credentials = CredentialsConfig::default();
        assert!(matches!(
            credentials.authenticator(None),
            Err(ProvisioningError::AuthSelection(_))
        ));

        credentials.session_path = Some(session_path);
        let auth = credentials.authenticator(Some("ABCDE12345"))?;
        assert_eq!(auth.kind(), CredentialKind::Session);
        match auth {
            Authenticator::Session(session) => {
                assert_eq!(session.team_id.as_deref(), Some("ABCDE12345"))
            }
            _ => panic!("expected a session"),
        }

        credentials.api_key_path = Some(key_path.clone());
        assert!(matches!(
            credentials.authenticator(None),
            Err(ProvisioningError::AuthSelection(_))
        ));

        let mut credentials = CredentialsConfig {
            api_key_path: Some(key_path),
            ..Default::default()
        };
        assert_eq!(credentials.authenticator(None)?.kind(), CredentialKind::ApiKey);

        credentials.api_key_id = Some("OTHER".into());
        assert!(matches!(
            credentials.authenticator(None),
            Err(ProvisioningError::Configuration(_))
        ));

        let credentials = CredentialsConfig {
            api_key_id: Some("DEADBEEF42".into()),
            ..Default::default()
        };
        assert!(matches!(
            credentials.authenticator(None),
            Err(ProvisioningError::Configuration(_))
        ));

        Ok(())
    }
}
