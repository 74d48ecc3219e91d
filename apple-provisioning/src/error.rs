// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    cryptographic_message_syntax::CmsError, std::path::PathBuf, thiserror::Error,
    x509_certificate::X509CertificateError,
};

/// Unified error type for resolving and reconciling code signing assets.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("unknown command")]
    CliUnknownCommand,

    #[error("bad argument")]
    CliBadArgument,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("YAML serialization error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),

    #[error("plist error: {0}")]
    Plist(#[from] plist::Error),

    #[error("CMS error: {0}")]
    Cms(#[from] CmsError),

    #[error("X.509 certificate handler error: {0}")]
    X509(#[from] X509CertificateError),

    #[error("PEM error: {0}")]
    Pem(#[from] pem::PemError),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("HTTP error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("bundle identifier pattern error: {0}")]
    Glob(#[from] glob::PatternError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("credential selection error: {0}")]
    AuthSelection(String),

    #[error("App Store Connect API key error: {0}")]
    AppStoreConnectApiKey(String),

    #[error("unable to locate App Store Connect API key file AuthKey_{0}.p8")]
    AppStoreConnectApiKeyNotFound(String),

    #[error("target {bundle_id} uses entitlement {entitlement} which cannot be provisioned remotely; create its profile manually")]
    UnsupportedEntitlement {
        bundle_id: String,
        entitlement: String,
    },

    #[error("unable to assign iCloud containers {} to app id {bundle_id}; add them to the app id manually in the developer portal", .containers.join(", "))]
    ICloudContainersUnassigned {
        bundle_id: String,
        containers: Vec<String>,
    },

    #[error("remote provisioning API error (HTTP {status}): {message}")]
    RemoteApi { status: u16, message: String },

    #[error("no usable {0} certificate is held")]
    NoSigningCertificate(String),

    #[error("no code signing assets could be resolved for: {}", .0.join(", "))]
    ResolutionIncomplete(Vec<String>),

    #[error("failed to persist {asset}: {message}")]
    AssetWrite { asset: String, message: String },

    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),

    #[error("unknown platform: {0}")]
    UnknownPlatform(String),

    #[error("unknown distribution type: {0}")]
    UnknownDistributionType(String),

    #[error("invalid bundle identifier {0}: it has no '.' separated components")]
    InvalidBundleId(String),

    #[error("malformed provisioning profile {0}: {1}")]
    ProfileMalformed(PathBuf, String),

    #[error("provisioning profile does not contain signed content")]
    ProfileNoContent,

    #[error("certificate has no common name")]
    CertificateNoCommonName,

    #[error("error building certificate: {0}")]
    CertificateBuild(String),

    #[error("failed to run {0}: {1}")]
    ExternalCommand(String, String),
}
