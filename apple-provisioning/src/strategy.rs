// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Choosing who manages code signing assets.

use {
    crate::{Project, ProvisioningError},
    duct::cmd,
    log::{debug, warn},
    once_cell::sync::Lazy,
    regex::Regex,
    std::fmt::Display,
};

/// First Xcode major version able to manage signing with an API key.
pub const MINIMUM_XCODE_MAJOR_VERSION_FOR_API_KEY: u32 = 13;

static XCODE_VERSION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Xcode (\d+)(?:\.(\d+))?(?:\.(\d+))?").expect("Xcode version regex should compile")
});

/// The kind of credential used to talk to the developer portal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CredentialKind {
    /// App Store Connect API key.
    ApiKey,
    /// Apple ID session cookies.
    Session,
}

/// Who provides code signing assets.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SigningStrategy {
    /// Xcode's automatic signing, authenticated with an API key.
    XcodeManaged,
    /// This crate, authenticated with an API key.
    ManagedWithApiKey,
    /// This crate, authenticated with an Apple ID session.
    ManagedWithAppleId,
}

impl SigningStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::XcodeManaged => "xcode-managed",
            Self::ManagedWithApiKey => "managed-with-api-key",
            Self::ManagedWithAppleId => "managed-with-apple-id",
        }
    }
}

impl Display for SigningStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StrategyDecision {
    pub strategy: SigningStrategy,
    pub reason: String,
    pub warning: Option<String>,
}

impl StrategyDecision {
    fn new(strategy: SigningStrategy, reason: impl ToString) -> Self {
        Self {
            strategy,
            reason: reason.to_string(),
            warning: None,
        }
    }
}

/// An Xcode version.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct XcodeVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl XcodeVersion {
    /// Parse `xcodebuild -version` output.
    pub fn parse(output: &str) -> Option<Self> {
        let caps = XCODE_VERSION_RE.captures(output)?;

        let part = |i: usize| {
            caps.get(i)
                .map(|m| m.as_str().parse::<u32>().ok())
                .unwrap_or(Some(0))
        };

        Some(Self {
            major: part(1)?,
            minor: part(2)?,
            patch: part(3)?,
        })
    }

    /// Probe the version of the selected Xcode.
    pub fn probe() -> Result<Self, ProvisioningError> {
        let output = cmd("xcodebuild", &["-version"])
            .stderr_null()
            .read()
            .map_err(|e| ProvisioningError::ExternalCommand("xcodebuild".into(), e.to_string()))?;

        Self::parse(&output).ok_or_else(|| {
            ProvisioningError::ExternalCommand(
                "xcodebuild".into(),
                format!("unrecognized version output: {}", output),
            )
        })
    }
}

impl Display for XcodeVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Decides a [SigningStrategy].
#[derive(Clone, Debug)]
pub struct StrategySelector {
    pub prefer_xcode_managed: bool,
    pub min_profile_validity_days: u32,
    /// `None` when the version is unknown.
    pub xcode_version: Option<XcodeVersion>,
}

impl StrategySelector {
    pub fn new(prefer_xcode_managed: bool) -> Self {
        Self {
            prefer_xcode_managed,
            min_profile_validity_days: 0,
            xcode_version: None,
        }
    }

    /// Set the Xcode version by running `xcodebuild`.
    ///
    /// Failure leaves the version unknown.
    pub fn probe_xcode_version(mut self) -> Self {
        match XcodeVersion::probe() {
            Ok(version) => {
                debug!("found Xcode {}", version);
                self.xcode_version = Some(version);
            }
            Err(e) => {
                warn!("unable to determine Xcode version: {}", e);
                self.xcode_version = None;
            }
        }

        self
    }

    pub fn select(&self, credential: CredentialKind, project: &dyn Project) -> StrategyDecision {
        if credential == CredentialKind::Session {
            return StrategyDecision::new(
                SigningStrategy::ManagedWithAppleId,
                "Apple ID sessions cannot drive Xcode managed signing",
            );
        }

        if !self.prefer_xcode_managed {
            return StrategyDecision::new(
                SigningStrategy::ManagedWithApiKey,
                "Xcode managed signing is not preferred",
            );
        }

        if self.min_profile_validity_days > 0 {
            return StrategyDecision::new(
                SigningStrategy::ManagedWithApiKey,
                format!(
                    "Xcode managed signing cannot guarantee {} days of profile validity",
                    self.min_profile_validity_days
                ),
            );
        }

        match self.xcode_version {
            Some(v) if v.major >= MINIMUM_XCODE_MAJOR_VERSION_FOR_API_KEY => {}
            Some(v) => {
                return StrategyDecision::new(
                    SigningStrategy::ManagedWithApiKey,
                    format!(
                        "Xcode {} does not support managed signing with an API key; {} or newer is required",
                        v, MINIMUM_XCODE_MAJOR_VERSION_FOR_API_KEY
                    ),
                )
            }
            None => {
                return StrategyDecision::new(
                    SigningStrategy::ManagedWithApiKey,
                    "Xcode version is unknown",
                )
            }
        }

        match project.is_signing_managed_automatically() {
            Ok(true) => StrategyDecision::new(
                SigningStrategy::XcodeManaged,
                "the project uses automatic signing",
            ),
            Ok(false) => StrategyDecision::new(
                SigningStrategy::ManagedWithApiKey,
                "the project uses manual signing",
            ),
            Err(e) => {
                warn!("unable to determine project signing style: {}", e);

                let mut decision = StrategyDecision::new(
                    SigningStrategy::ManagedWithApiKey,
                    "the project signing style is unknown",
                );
                decision.warning = Some(e.to_string());
                decision
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{AppLayout, CodesignAssets, DistributionType, Platform},
    };

    struct FakeProject {
        automatic: Result<bool, String>,
    }

    impl Project for FakeProject {
        fn is_signing_managed_automatically(&self) -> Result<bool, ProvisioningError> {
            self.automatic
                .clone()
                .map_err(ProvisioningError::Configuration)
        }

        fn platform(&self) -> Result<Platform, ProvisioningError> {
            Ok(Platform::Ios)
        }

        fn app_layout(&self, _: bool) -> Result<AppLayout, ProvisioningError> {
            Ok(AppLayout::new(Platform::Ios))
        }

        fn force_codesign_assets(
            &mut self,
            _: DistributionType,
            _: &CodesignAssets,
        ) -> Result<(), ProvisioningError> {
            Ok(())
        }
    }

    fn selector() -> StrategySelector {
        let mut s = StrategySelector::new(true);
        s.xcode_version = XcodeVersion::parse("Xcode 14.2\nBuild version 14C18");
        s
    }

    #[test]
    fn parse_version() {
        assert_eq!(
            XcodeVersion::parse("Xcode 14.2\nBuild version 14C18"),
            Some(XcodeVersion {
                major: 14,
                minor: 2,
                patch: 0
            })
        );
        assert_eq!(XcodeVersion::parse("Xcode 12").map(|v| v.major), Some(12));
        assert_eq!(XcodeVersion::parse("command not found"), None);
    }

    #[test]
    fn session_credentials_force_apple_id() {
        let project = FakeProject {
            automatic: Ok(true),
        };

        assert_eq!(
            selector()
                .select(CredentialKind::Session, &project)
                .strategy,
            SigningStrategy::ManagedWithAppleId
        );
    }

    #[test]
    fn api_key_decisions() {
        let automatic = FakeProject {
            automatic: Ok(true),
        };
        let manual = FakeProject {
            automatic: Ok(false),
        };

        let s = selector();
        assert_eq!(
            s.select(CredentialKind::ApiKey, &automatic).strategy,
            SigningStrategy::XcodeManaged
        );
        assert_eq!(
            s.select(CredentialKind::ApiKey, &manual).strategy,
            SigningStrategy::ManagedWithApiKey
        );

        let mut s = selector();
        s.prefer_xcode_managed = false;
        assert_eq!(
            s.select(CredentialKind::ApiKey, &automatic).strategy,
            SigningStrategy::ManagedWithApiKey
        );

        let mut s = selector();
        s.min_profile_validity_days = 30;
        assert_eq!(
            s.select(CredentialKind::ApiKey, &automatic).strategy,
            SigningStrategy::ManagedWithApiKey
        );

        let mut s = selector();
        s.xcode_version = XcodeVersion::parse("Xcode 12.5.1");
        assert_eq!(
            s.select(CredentialKind::ApiKey, &automatic).strategy,
            SigningStrategy::ManagedWithApiKey
        );

        s.xcode_version = None;
        assert_eq!(
            s.select(CredentialKind::ApiKey, &automatic).strategy,
            SigningStrategy::ManagedWithApiKey
        );
    }

    #[test]
    fn project_errors_become_warnings() {
        let broken = FakeProject {
            automatic: Err("unreadable".into()),
        };

        let decision = selector().select(CredentialKind::ApiKey, &broken);
        assert_eq!(decision.strategy, SigningStrategy::ManagedWithApiKey);
        assert!(decision.warning.unwrap().contains("unreadable"));
    }
}
