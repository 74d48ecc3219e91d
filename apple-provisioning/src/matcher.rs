// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deciding whether a provisioning profile can sign a target.

use {
    crate::{
        entitlements::ICLOUD_CONTAINER_IDENTIFIERS_KEY, DistributionType, Entitlements, Platform,
        ProfileState, ProvisioningProfile,
    },
    chrono::{DateTime, Utc},
    std::fmt::{Display, Formatter},
};

/// What a profile must satisfy to sign a target.
#[derive(Clone, Copy, Debug)]
pub struct ProfileRequirements<'a> {
    pub platform: Platform,
    pub distribution_type: DistributionType,
    /// Literal bundle identifier of the target.
    pub bundle_id: &'a str,
    pub entitlements: &'a Entitlements,
    pub min_validity_days: u32,
    /// Serials of certificates that must be embedded in the profile.
    pub certificate_serials: &'a [String],
    pub device_udids: &'a [String],
}

/// The reason a profile was rejected.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Mismatch {
    Inactive,
    DistributionType(DistributionType),
    Platform(Platform),
    BundleId(String),
    MissingCertificate(String),
    Entitlement(String),
    MissingDevice(String),
    XcodeManaged,
    /// Only the listed iCloud containers are missing.
    MissingContainers(Vec<String>),
}

impl Display for Mismatch {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inactive => f.write_str("invalid, expired or expiring within the validity window"),
            Self::DistributionType(t) => write!(f, "distribution type is {}", t),
            Self::Platform(p) => write!(f, "platform is {}", p),
            Self::BundleId(id) => write!(f, "bundle identifier is {}", id),
            Self::MissingCertificate(serial) => write!(f, "certificate {} not included", serial),
            Self::Entitlement(key) => write!(f, "entitlement {} differs", key),
            Self::MissingDevice(udid) => write!(f, "device {} not included", udid),
            Self::XcodeManaged => f.write_str("managed by Xcode"),
            Self::MissingContainers(c) => write!(f, "missing iCloud containers {}", c.join(", ")),
        }
    }
}

/// Pure predicate over profiles, evaluated at a fixed point in time.
#[derive(Clone, Copy, Debug)]
pub struct CompatibilityMatcher {
    now: DateTime<Utc>,
}

impl CompatibilityMatcher {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Whether a profile can sign a target with exactly its bundle id.
    pub fn matches(&self, profile: &ProvisioningProfile, req: &ProfileRequirements) -> bool {
        self.check(profile, req).is_ok()
    }

    /// Check a profile against requirements, reporting the first failed rule.
    ///
    /// Missing iCloud containers are reported only once every other rule passed.
    pub fn check(
        &self,
        profile: &ProvisioningProfile,
        req: &ProfileRequirements,
    ) -> Result<(), Mismatch> {
        self.check_common(profile, req)?;

        if profile.bundle_id != req.bundle_id {
            return Err(Mismatch::BundleId(profile.bundle_id.clone()));
        }

        for serial in req.certificate_serials {
            if !profile.embeds_certificate(serial) {
                return Err(Mismatch::MissingCertificate(serial.clone()));
            }
        }

        self.check_entitlements(profile, req.entitlements)?;
        self.check_devices(profile, req.device_udids)?;

        if profile.xcode_managed {
            return Err(Mismatch::XcodeManaged);
        }

        self.check_containers(profile, req.entitlements)
    }

    /// Whether a profile's bundle id pattern can serve a target.
    pub fn matches_pattern(
        &self,
        profile: &ProvisioningProfile,
        req: &ProfileRequirements,
    ) -> bool {
        self.check_pattern(profile, req).is_ok()
    }

    /// Like [Self::check] but glob matching the bundle id.
    ///
    /// Certificate embedding and Xcode management are not checked: the group
    /// resolver handles both itself.
    pub fn check_pattern(
        &self,
        profile: &ProvisioningProfile,
        req: &ProfileRequirements,
    ) -> Result<(), Mismatch> {
        self.check_common(profile, req)?;

        if !profile.matches_bundle_id(req.bundle_id) {
            return Err(Mismatch::BundleId(profile.bundle_id.clone()));
        }

        self.check_entitlements(profile, req.entitlements)?;
        self.check_devices(profile, req.device_udids)?;
        self.check_containers(profile, req.entitlements)
    }

    fn check_common(
        &self,
        profile: &ProvisioningProfile,
        req: &ProfileRequirements,
    ) -> Result<(), Mismatch> {
        if profile.state != ProfileState::Active
            || !profile.is_active_at(self.now, req.min_validity_days)
        {
            return Err(Mismatch::Inactive);
        }
        if profile.distribution_type != req.distribution_type {
            return Err(Mismatch::DistributionType(profile.distribution_type));
        }
        if profile.platform != req.platform {
            return Err(Mismatch::Platform(profile.platform));
        }

        Ok(())
    }

    fn check_entitlements(
        &self,
        profile: &ProvisioningProfile,
        required: &Entitlements,
    ) -> Result<(), Mismatch> {
        for (key, value) in required.iter() {
            if key == ICLOUD_CONTAINER_IDENTIFIERS_KEY {
                continue;
            }

            if profile.entitlements.get(key) != Some(value) {
                return Err(Mismatch::Entitlement(key.clone()));
            }
        }

        Ok(())
    }

    fn check_devices(
        &self,
        profile: &ProvisioningProfile,
        udids: &[String],
    ) -> Result<(), Mismatch> {
        match udids.iter().find(|udid| !profile.provisions_device(udid)) {
            Some(udid) => Err(Mismatch::MissingDevice(udid.clone())),
            None => Ok(()),
        }
    }

    fn check_containers(
        &self,
        profile: &ProvisioningProfile,
        required: &Entitlements,
    ) -> Result<(), Mismatch> {
        match required.find_missing_containers(&profile.entitlements) {
            Ok(missing) if missing.is_empty() => Ok(()),
            Ok(missing) => Err(Mismatch::MissingContainers(missing)),
            Err(_) => Err(Mismatch::Entitlement(
                ICLOUD_CONTAINER_IDENTIFIERS_KEY.to_string(),
            )),
        }
    }
}
