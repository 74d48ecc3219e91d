// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! App Store Connect API keys and the JWTs they issue.

use {
    crate::ProvisioningError,
    chrono::{DateTime, Duration, Utc},
    jsonwebtoken::{Algorithm, EncodingKey, Header},
    serde::{Deserialize, Serialize},
    std::{fs::Permissions, io::Write, path::Path},
};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

#[cfg(unix)]
pub(crate) fn set_permissions_private(p: &mut Permissions) {
    p.set_mode(0o600);
}

#[cfg(windows)]
pub(crate) fn set_permissions_private(_: &mut Permissions) {}

/// Audience of tokens for the public App Store Connect API.
pub const APP_STORE_CONNECT_AUDIENCE: &str = "appstoreconnect-v1";

/// Audience of tokens for the enterprise program API.
pub const ENTERPRISE_AUDIENCE: &str = "apple-developer-enterprise-v1";

/// How long issued tokens are valid for. Apple rejects lifetimes over 20 minutes.
pub const TOKEN_LIFETIME_SECONDS: i64 = 18 * 60;

#[derive(Clone, Debug, Deserialize, Serialize)]
struct ConnectTokenClaims {
    iss: String,
    iat: i64,
    exp: i64,
    aud: String,
}

/// An issued JWT and when it stops being valid.
#[derive(Clone, Debug)]
pub struct ConnectToken {
    pub token: String,
    pub expires: DateTime<Utc>,
}

impl ConnectToken {
    /// Whether the token is unusable or about to be at `now`.
    pub fn is_expiring(&self, now: DateTime<Utc>) -> bool {
        now + Duration::minutes(1) >= self.expires
    }
}

/// Holds an App Store Connect API key and issues tokens from it.
///
/// Keys consist of a key id like `DEADBEEF42`, an issuer id (a UUID) and an
/// ECDSA private key. They are managed at https://appstoreconnect.apple.com/access/api.
#[derive(Clone)]
pub struct ConnectTokenEncoder {
    key_id: String,
    issuer_id: String,
    audience: String,
    encoding_key: EncodingKey,
}

impl ConnectTokenEncoder {
    /// Construct an instance from an [EncodingKey] instance.
    pub fn from_jwt_encoding_key(
        key_id: String,
        issuer_id: String,
        encoding_key: EncodingKey,
    ) -> Self {
        Self {
            key_id,
            issuer_id,
            audience: APP_STORE_CONNECT_AUDIENCE.to_string(),
            encoding_key,
        }
    }

    /// Construct an instance from a DER encoded ECDSA private key.
    pub fn from_ecdsa_der(key_id: String, issuer_id: String, der_data: &[u8]) -> Self {
        Self::from_jwt_encoding_key(key_id, issuer_id, EncodingKey::from_ec_der(der_data))
    }

    /// Construct an instance from a PEM encoded ECDSA private key.
    pub fn from_ecdsa_pem(
        key_id: String,
        issuer_id: String,
        pem_data: &[u8],
    ) -> Result<Self, ProvisioningError> {
        let encoding_key = EncodingKey::from_ec_pem(pem_data)?;

        Ok(Self::from_jwt_encoding_key(key_id, issuer_id, encoding_key))
    }

    /// Construct an instance from a PEM encoded ECDSA private key file.
    pub fn from_ecdsa_pem_path(
        key_id: String,
        issuer_id: String,
        path: impl AsRef<Path>,
    ) -> Result<Self, ProvisioningError> {
        let data = std::fs::read(path.as_ref())?;

        Self::from_ecdsa_pem(key_id, issuer_id, &data)
    }

    /// Construct an instance by locating the `AuthKey_<id>.p8` file of a key id.
    ///
    /// `private_keys` directories in the current directory and home directory
    /// are searched, as are `~/.private_keys` and `~/.appstoreconnect/private_keys`.
    pub fn from_api_key_id(key_id: String, issuer_id: String) -> Result<Self, ProvisioningError> {
        let mut search_paths = vec![std::env::current_dir()?.join("private_keys")];

        if let Some(home) = dirs::home_dir() {
            search_paths.extend([
                home.join("private_keys"),
                home.join(".private_keys"),
                home.join(".appstoreconnect").join("private_keys"),
            ]);
        }

        let filename = format!("AuthKey_{}.p8", key_id);

        for path in search_paths {
            let candidate = path.join(&filename);

            if candidate.exists() {
                return Self::from_ecdsa_pem_path(key_id, issuer_id, candidate);
            }
        }

        Err(ProvisioningError::AppStoreConnectApiKeyNotFound(key_id))
    }

    /// Issue tokens for the enterprise program API instead of App Store Connect.
    pub fn for_enterprise(mut self) -> Self {
        self.audience = ENTERPRISE_AUDIENCE.to_string();
        self
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Mint a new token valid from `now` for [TOKEN_LIFETIME_SECONDS].
    pub fn new_token(&self, now: DateTime<Utc>) -> Result<ConnectToken, ProvisioningError> {
        let header = Header {
            kid: Some(self.key_id.clone()),
            alg: Algorithm::ES256,
            ..Default::default()
        };

        let expires = now + Duration::seconds(TOKEN_LIFETIME_SECONDS);

        let claims = ConnectTokenClaims {
            iss: self.issuer_id.clone(),
            iat: now.timestamp(),
            exp: expires.timestamp(),
            aud: self.audience.clone(),
        };

        let token = jsonwebtoken::encode(&header, &claims, &self.encoding_key)?;

        Ok(ConnectToken { token, expires })
    }
}

/// All components of an App Store Connect API key in one serializable value.
///
/// Saving this as a single file spares providing the three components of the
/// key separately.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UnifiedApiKey {
    /// Who issued the key. Likely a UUID.
    issuer_id: String,

    /// Key identifier like `DEADBEEF42`.
    key_id: String,

    /// Base64 encoded DER of ECDSA private key material.
    private_key: String,
}

impl UnifiedApiKey {
    /// Construct an instance from the `.p8` file downloaded from App Store Connect.
    pub fn from_ecdsa_pem_path(
        issuer_id: impl ToString,
        key_id: impl ToString,
        path: impl AsRef<Path>,
    ) -> Result<Self, ProvisioningError> {
        let pem_data = std::fs::read(path.as_ref())?;

        let parsed = pem::parse(pem_data).map_err(|e| {
            ProvisioningError::AppStoreConnectApiKey(format!("error parsing PEM: {}", e))
        })?;

        if parsed.tag != "PRIVATE KEY" {
            return Err(ProvisioningError::AppStoreConnectApiKey(
                "does not look like a PRIVATE KEY".to_string(),
            ));
        }

        Ok(Self {
            issuer_id: issuer_id.to_string(),
            key_id: key_id.to_string(),
            private_key: base64::encode(parsed.contents),
        })
    }

    pub fn from_json(data: impl AsRef<[u8]>) -> Result<Self, ProvisioningError> {
        Ok(serde_json::from_slice(data.as_ref())?)
    }

    pub fn from_json_path(path: impl AsRef<Path>) -> Result<Self, ProvisioningError> {
        let data = std::fs::read(path.as_ref())?;

        Self::from_json(data)
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn to_json_string(&self) -> Result<String, ProvisioningError> {
        Ok(serde_json::to_string_pretty(&self)?)
    }

    /// Write this instance to a JSON file readable only by its owner.
    ///
    /// Parent directories are created if missing.
    pub fn write_json_file(&self, path: impl AsRef<Path>) -> Result<(), ProvisioningError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let data = self.to_json_string()?;

        let mut fh = std::fs::File::create(path)?;
        let mut permissions = fh.metadata()?.permissions();
        set_permissions_private(&mut permissions);
        fh.set_permissions(permissions)?;
        fh.write_all(data.as_bytes())?;

        Ok(())
    }
}

impl TryFrom<UnifiedApiKey> for ConnectTokenEncoder {
    type Error = ProvisioningError;

    fn try_from(value: UnifiedApiKey) -> Result<Self, Self::Error> {
        let der = base64::decode(value.private_key).map_err(|e| {
            ProvisioningError::AppStoreConnectApiKey(format!(
                "failed to base64 decode private key: {}",
                e
            ))
        })?;

        Ok(Self::from_ecdsa_der(value.key_id, value.issuer_id, &der))
    }
}
