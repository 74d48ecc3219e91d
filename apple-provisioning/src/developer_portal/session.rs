// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Saved Apple ID web sessions.
//!
//! A session file records the cookies of an authenticated Apple ID login,
//! keyed by the URL they were issued for:
//!
//! ```json
//! {
//!   "apple_id": "dev@example.com",
//!   "team_id": "ABCDE12345",
//!   "connection_expiry_date": "2030-01-01T00:00:00Z",
//!   "session_cookies": {
//!     "https://idmsa.apple.com": [
//!       {"name": "myacinfo", "value": "...", "domain": "apple.com", "path": "/"}
//!     ]
//!   }
//! }
//! ```

use {
    crate::ProvisioningError,
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    std::{collections::BTreeMap, path::Path},
};

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_age: Option<i64>,
    #[serde(default)]
    pub httponly: bool,
    #[serde(default)]
    pub for_domain: bool,
}

impl SessionCookie {
    /// Whether the cookie should be sent to `host` at `now`.
    pub fn applies_to(&self, host: &str, now: DateTime<Utc>) -> bool {
        if matches!(self.expires, Some(expires) if expires <= now) {
            return false;
        }

        match &self.domain {
            None => true,
            Some(domain) => {
                let domain = domain.trim_start_matches('.');
                host == domain || host.ends_with(&format!(".{}", domain))
            }
        }
    }
}

/// Credentials of a saved Apple ID session.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SessionCredentials {
    pub apple_id: String,
    /// Team to operate on. Required when the Apple ID belongs to several teams.
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub connection_expiry_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub session_cookies: BTreeMap<String, Vec<SessionCookie>>,
}

impl SessionCredentials {
    pub fn from_json(data: impl AsRef<[u8]>) -> Result<Self, ProvisioningError> {
        let res: Self = serde_json::from_slice(data.as_ref())?;

        if res.session_cookies.values().all(|cookies| cookies.is_empty()) {
            return Err(ProvisioningError::Configuration(format!(
                "session for {} contains no cookies",
                res.apple_id
            )));
        }

        Ok(res)
    }

    pub fn from_json_path(path: impl AsRef<Path>) -> Result<Self, ProvisioningError> {
        let data = std::fs::read(path.as_ref())?;

        Self::from_json(data)
    }

    /// Whether the session is known to have expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.connection_expiry_date, Some(expiry) if expiry <= now)
    }

    /// Value of a `Cookie` header for requests to `host`.
    ///
    /// Later cookies of the same name replace earlier ones.
    pub fn cookie_header(&self, host: &str, now: DateTime<Utc>) -> Option<String> {
        let cookies = self
            .session_cookies
            .values()
            .flatten()
            .filter(|c| c.applies_to(host, now))
            .map(|c| (c.name.as_str(), c.value.as_str()))
            .collect::<BTreeMap<_, _>>();

        if cookies.is_empty() {
            None
        } else {
            Some(
                cookies
                    .into_iter()
                    .map(|(name, value)| format!("{}={}", name, value))
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, chrono::Duration, indoc::indoc};

    const SESSION: &str = indoc! {r#"
        {
          "apple_id": "dev@example.com",
          "team_id": "ABCDE12345",
          "connection_expiry_date": "2030-01-01T00:00:00Z",
          "session_cookies": {
            "https://idmsa.apple.com": [
              {"name": "myacinfo", "value": "abc", "domain": "apple.com", "path": "/"},
              {"name": "stale", "value": "old", "domain": "apple.com", "expires": "2001-01-01T00:00:00Z"},
              {"name": "other", "value": "x", "domain": "icloud.com"}
            ],
            "https://developer.apple.com": [
              {"name": "DSESSIONID", "value": "s1", "domain": ".developer.apple.com"}
            ]
          }
        }
    "#};

    #[test]
    fn cookies_for_host() -> Result<(), ProvisioningError> {
        let session = SessionCredentials::from_json(SESSION)?;
        let now = Utc::now();

        assert_eq!(session.team_id.as_deref(), Some("ABCDE12345"));
        assert_eq!(
            session.cookie_header("developer.apple.com", now).as_deref(),
            Some("DSESSIONID=s1; myacinfo=abc")
        );
        assert_eq!(session.cookie_header("example.com", now), None);

        Ok(())
    }

    #[test]
    fn expiry() -> Result<(), ProvisioningError> {
        let session = SessionCredentials::from_json(SESSION)?;
        let expiry = session.connection_expiry_date.unwrap();

        assert!(!session.is_expired(expiry - Duration::days(1)));
        assert!(session.is_expired(expiry));

        Ok(())
    }

    #[test]
    fn empty_sessions_rejected() {
        assert!(matches!(
            SessionCredentials::from_json(r#"{"apple_id": "dev@example.com"}"#),
            Err(ProvisioningError::Configuration(_))
        ));
    }
}
