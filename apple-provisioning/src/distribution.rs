// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Platforms, distribution types and the remote enumerations derived from them.

use {
    crate::ProvisioningError,
    serde::{Deserialize, Serialize},
    std::{fmt::Display, str::FromStr},
};

/// An Apple operating system that a target is built for.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum Platform {
    #[serde(rename = "iOS", alias = "ios", alias = "IOS")]
    Ios,
    #[serde(rename = "tvOS", alias = "tvos", alias = "TVOS")]
    TvOs,
    #[serde(rename = "macOS", alias = "macos", alias = "MAC_OS", alias = "osx")]
    MacOs,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ios => "iOS",
            Self::TvOs => "tvOS",
            Self::MacOs => "macOS",
        }
    }

    /// The platform value used by the remote API for devices and bundle ids.
    ///
    /// tvOS resources are registered under the iOS platform.
    pub fn api_platform(&self) -> &'static str {
        match self {
            Self::Ios | Self::TvOs => "IOS",
            Self::MacOs => "MAC_OS",
        }
    }

    /// File extension used for installed provisioning profiles.
    pub fn profile_extension(&self) -> &'static str {
        match self {
            Self::Ios | Self::TvOs => "mobileprovision",
            Self::MacOs => "provisionprofile",
        }
    }
}

impl Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = ProvisioningError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ios" => Ok(Self::Ios),
            "tvos" => Ok(Self::TvOs),
            "macos" | "osx" | "mac_os" => Ok(Self::MacOs),
            _ => Err(ProvisioningError::UnknownPlatform(s.to_string())),
        }
    }
}

/// The release channel an app is signed for.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DistributionType {
    Development,
    AppStore,
    AdHoc,
    Enterprise,
}

impl DistributionType {
    pub fn all() -> &'static [Self] {
        &[
            Self::Development,
            Self::AppStore,
            Self::AdHoc,
            Self::Enterprise,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::AppStore => "app-store",
            Self::AdHoc => "ad-hoc",
            Self::Enterprise => "enterprise",
        }
    }

    /// Whether profiles of this type embed an explicit device list.
    pub fn requires_device_list(&self) -> bool {
        matches!(self, Self::Development | Self::AdHoc)
    }

    /// The certificate class able to sign for this distribution type.
    pub fn certificate_class(&self) -> CertificateClass {
        match self {
            Self::Development => CertificateClass::Development,
            _ => CertificateClass::Distribution,
        }
    }
}

impl Display for DistributionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistributionType {
    type Err = ProvisioningError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| ProvisioningError::UnknownDistributionType(s.to_string()))
    }
}

/// Whether a signing certificate is for development or distribution.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CertificateClass {
    Development,
    Distribution,
}

impl CertificateClass {
    /// Infer the class from a certificate's common name.
    pub fn from_common_name(common_name: &str) -> Self {
        if common_name.starts_with("iPhone Distribution")
            || common_name.starts_with("Apple Distribution")
        {
            Self::Distribution
        } else {
            Self::Development
        }
    }

    /// Map a remote `certificateType` value to a class.
    pub fn from_api_type(value: &str) -> Option<Self> {
        match value {
            "IOS_DEVELOPMENT" | "DEVELOPMENT" | "MAC_APP_DEVELOPMENT" => Some(Self::Development),
            "IOS_DISTRIBUTION" | "DISTRIBUTION" | "MAC_APP_DISTRIBUTION" => {
                Some(Self::Distribution)
            }
            _ => None,
        }
    }

    /// The `certificateType` to request when creating a certificate of this class.
    pub fn api_type(&self) -> &'static str {
        match self {
            Self::Development => "DEVELOPMENT",
            Self::Distribution => "DISTRIBUTION",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Distribution => "distribution",
        }
    }
}

impl Display for CertificateClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote profile type, combining platform and distribution type.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProfileType {
    IosAppDevelopment,
    IosAppStore,
    IosAppAdhoc,
    IosAppInhouse,
    TvosAppDevelopment,
    TvosAppStore,
    TvosAppAdhoc,
    TvosAppInhouse,
    MacAppDevelopment,
    MacAppStore,
    MacAppDirect,
}

impl ProfileType {
    pub fn new(platform: Platform, distribution: DistributionType) -> Self {
        match (platform, distribution) {
            (Platform::Ios, DistributionType::Development) => Self::IosAppDevelopment,
            (Platform::Ios, DistributionType::AppStore) => Self::IosAppStore,
            (Platform::Ios, DistributionType::AdHoc) => Self::IosAppAdhoc,
            (Platform::Ios, DistributionType::Enterprise) => Self::IosAppInhouse,
            (Platform::TvOs, DistributionType::Development) => Self::TvosAppDevelopment,
            (Platform::TvOs, DistributionType::AppStore) => Self::TvosAppStore,
            (Platform::TvOs, DistributionType::AdHoc) => Self::TvosAppAdhoc,
            (Platform::TvOs, DistributionType::Enterprise) => Self::TvosAppInhouse,
            (Platform::MacOs, DistributionType::Development) => Self::MacAppDevelopment,
            (Platform::MacOs, DistributionType::AppStore) => Self::MacAppStore,
            (Platform::MacOs, DistributionType::AdHoc | DistributionType::Enterprise) => {
                Self::MacAppDirect
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IosAppDevelopment => "IOS_APP_DEVELOPMENT",
            Self::IosAppStore => "IOS_APP_STORE",
            Self::IosAppAdhoc => "IOS_APP_ADHOC",
            Self::IosAppInhouse => "IOS_APP_INHOUSE",
            Self::TvosAppDevelopment => "TVOS_APP_DEVELOPMENT",
            Self::TvosAppStore => "TVOS_APP_STORE",
            Self::TvosAppAdhoc => "TVOS_APP_ADHOC",
            Self::TvosAppInhouse => "TVOS_APP_INHOUSE",
            Self::MacAppDevelopment => "MAC_APP_DEVELOPMENT",
            Self::MacAppStore => "MAC_APP_STORE",
            Self::MacAppDirect => "MAC_APP_DIRECT",
        }
    }

    pub fn platform(&self) -> Platform {
        match self {
            Self::IosAppDevelopment | Self::IosAppStore | Self::IosAppAdhoc | Self::IosAppInhouse => {
                Platform::Ios
            }
            Self::TvosAppDevelopment
            | Self::TvosAppStore
            | Self::TvosAppAdhoc
            | Self::TvosAppInhouse => Platform::TvOs,
            Self::MacAppDevelopment | Self::MacAppStore | Self::MacAppDirect => Platform::MacOs,
        }
    }

    /// The distribution type this profile type serves.
    ///
    /// `MAC_APP_DIRECT` covers both ad-hoc and enterprise; it is reported as ad-hoc.
    pub fn distribution_type(&self) -> DistributionType {
        match self {
            Self::IosAppDevelopment | Self::TvosAppDevelopment | Self::MacAppDevelopment => {
                DistributionType::Development
            }
            Self::IosAppStore | Self::TvosAppStore | Self::MacAppStore => {
                DistributionType::AppStore
            }
            Self::IosAppAdhoc | Self::TvosAppAdhoc | Self::MacAppDirect => DistributionType::AdHoc,
            Self::IosAppInhouse | Self::TvosAppInhouse => DistributionType::Enterprise,
        }
    }
}

impl Display for ProfileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_platform() -> Result<(), ProvisioningError> {
        assert_eq!(Platform::from_str("iOS")?, Platform::Ios);
        assert_eq!(Platform::from_str("TVOS")?, Platform::TvOs);
        assert_eq!(Platform::from_str("osx")?, Platform::MacOs);
        assert!(Platform::from_str("watchOS").is_err());

        Ok(())
    }

    #[test]
    fn distribution_round_trip_strings() -> Result<(), ProvisioningError> {
        for t in DistributionType::all() {
            assert_eq!(&DistributionType::from_str(t.as_str())?, t);
        }
        assert!(DistributionType::from_str("store").is_err());

        Ok(())
    }

    #[test]
    fn device_lists_and_certificate_classes() {
        assert!(DistributionType::Development.requires_device_list());
        assert!(DistributionType::AdHoc.requires_device_list());
        assert!(!DistributionType::AppStore.requires_device_list());
        assert!(!DistributionType::Enterprise.requires_device_list());

        assert_eq!(
            DistributionType::Development.certificate_class(),
            CertificateClass::Development
        );
        assert_eq!(
            DistributionType::Enterprise.certificate_class(),
            CertificateClass::Distribution
        );
    }

    #[test]
    fn certificate_class_from_names() {
        assert_eq!(
            CertificateClass::from_common_name("Apple Distribution: Acme (ABCDE12345)"),
            CertificateClass::Distribution
        );
        assert_eq!(
            CertificateClass::from_common_name("iPhone Distribution: Acme"),
            CertificateClass::Distribution
        );
        assert_eq!(
            CertificateClass::from_common_name("Apple Development: Jane (XYZ)"),
            CertificateClass::Development
        );
        assert_eq!(
            CertificateClass::from_api_type("IOS_DISTRIBUTION"),
            Some(CertificateClass::Distribution)
        );
        assert_eq!(CertificateClass::from_api_type("PASS_TYPE_ID"), None);
    }

    #[test]
    fn profile_types() {
        let t = ProfileType::new(Platform::MacOs, DistributionType::Enterprise);
        assert_eq!(t, ProfileType::MacAppDirect);
        assert_eq!(t.as_str(), "MAC_APP_DIRECT");

        let t = ProfileType::new(Platform::TvOs, DistributionType::AppStore);
        assert_eq!(t.platform(), Platform::TvOs);
        assert_eq!(t.distribution_type(), DistributionType::AppStore);

        let v: ProfileType = serde_json::from_str("\"IOS_APP_INHOUSE\"").unwrap();
        assert_eq!(v, ProfileType::IosAppInhouse);
    }
}
