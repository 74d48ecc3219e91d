// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Provisioning profiles.

A provisioning profile is a CMS SignedData structure whose content is an XML
plist. The plist binds a bundle identifier pattern, entitlements, devices and
developer certificates together under an expiration date.
*/

use {
    crate::{
        certificate::normalize_serial, DistributionType, Entitlements, Platform, ProfileType,
        ProvisioningError, SigningCertificate,
    },
    chrono::{DateTime, Duration, Utc},
    cryptographic_message_syntax::SignedData,
    log::warn,
    once_cell::sync::Lazy,
    regex::Regex,
    serde::{Deserialize, Serialize},
    std::{
        cmp::Reverse,
        path::{Path, PathBuf},
        time::SystemTime,
    },
};

/// Prefix of names given to profiles and app ids this crate creates.
pub const MANAGED_NAME_PREFIX: &str = "rprovision";

/// Name prefixes of profiles generated by Xcode's automatic signing.
const XCODE_MANAGED_NAME_PREFIXES: &[&str] = &[
    "iOS Team Provisioning Profile",
    "tvOS Team Provisioning Profile",
    "Mac Team Provisioning Profile",
    "Mac Catalyst Team Provisioning Profile",
    "XC ",
];

static UDID_INVALID_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new("[^a-zA-Z0-9-]").expect("UDID regex should compile"));

/// Remote state of a profile.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProfileState {
    Active,
    Invalid,
}

impl Default for ProfileState {
    fn default() -> Self {
        Self::Active
    }
}

/// A provisioning profile.
///
/// The UUID is the identity of a profile.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProvisioningProfile {
    pub uuid: String,
    pub name: String,
    /// Bundle identifier this profile provisions. May end in `*`.
    pub bundle_id: String,
    #[serde(default)]
    pub team_id: Option<String>,
    pub platform: Platform,
    pub distribution_type: DistributionType,
    #[serde(default)]
    pub entitlements: Entitlements,
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(default)]
    pub provisions_all_devices: bool,
    pub expires: DateTime<Utc>,
    /// Normalized serials of the certificates embedded in the profile.
    #[serde(default)]
    pub certificate_serials: Vec<String>,
    #[serde(default)]
    pub xcode_managed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    #[serde(default)]
    pub state: ProfileState,
    /// Raw profile file content, as installed on disk.
    #[serde(skip)]
    pub content: Option<Vec<u8>>,
}

impl PartialEq for ProvisioningProfile {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid
    }
}

impl Eq for ProvisioningProfile {}

impl ProvisioningProfile {
    /// Construct an instance with no entitlements, devices or certificates.
    pub fn new(
        uuid: impl ToString,
        name: impl ToString,
        bundle_id: impl ToString,
        platform: Platform,
        distribution_type: DistributionType,
        expires: DateTime<Utc>,
    ) -> Self {
        let name = name.to_string();

        Self {
            uuid: uuid.to_string(),
            xcode_managed: is_xcode_managed_name(&name),
            name,
            bundle_id: bundle_id.to_string(),
            team_id: None,
            platform,
            distribution_type,
            entitlements: Entitlements::default(),
            devices: vec![],
            provisions_all_devices: false,
            expires,
            certificate_serials: vec![],
            remote_id: None,
            state: ProfileState::Active,
            content: None,
        }
    }

    /// Parse a profile from the bytes of a `.mobileprovision` or `.provisionprofile` file.
    pub fn from_signed_data(data: &[u8]) -> Result<Self, ProvisioningError> {
        let signed_data = SignedData::parse_ber(data)?;
        let content = signed_data
            .signed_content()
            .ok_or(ProvisioningError::ProfileNoContent)?;

        let value = plist::Value::from_reader(std::io::Cursor::new(content))?;

        let mut profile = Self::from_plist_value(&value)
            .map_err(|e| ProvisioningError::ProfileMalformed(PathBuf::new(), e))?;
        profile.content = Some(data.to_vec());

        Ok(profile)
    }

    /// Parse a profile file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ProvisioningError> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;

        match Self::from_signed_data(&data) {
            Err(ProvisioningError::ProfileMalformed(_, msg)) => {
                Err(ProvisioningError::ProfileMalformed(path.to_path_buf(), msg))
            }
            res => res,
        }
    }

    /// Construct an instance from the profile's decoded plist.
    pub fn from_plist_value(value: &plist::Value) -> Result<Self, String> {
        let dict = value
            .as_dictionary()
            .ok_or_else(|| "root is not a dictionary".to_string())?;

        let string = |key: &str| -> Result<String, String> {
            dict.get(key)
                .and_then(|v| v.as_string())
                .map(|s| s.to_string())
                .ok_or_else(|| format!("missing string {}", key))
        };
        let first_string = |key: &str| -> Option<String> {
            dict.get(key)
                .and_then(|v| v.as_array())
                .and_then(|a| a.iter().find_map(|v| v.as_string()))
                .map(|s| s.to_string())
        };

        let uuid = string("UUID")?;
        let name = string("Name")?;

        let expires = dict
            .get("ExpirationDate")
            .and_then(|v| v.as_date())
            .map(|d| DateTime::<Utc>::from(SystemTime::from(d)))
            .ok_or_else(|| "missing ExpirationDate".to_string())?;

        let entitlements = dict
            .get("Entitlements")
            .and_then(|v| v.as_dictionary())
            .map(Entitlements::from_plist_dictionary)
            .unwrap_or_default();

        let team_id = first_string("TeamIdentifier");
        let prefix = first_string("ApplicationIdentifierPrefix").or_else(|| team_id.clone());

        let application_identifier = entitlements
            .get("application-identifier")
            .or_else(|| entitlements.get("com.apple.application-identifier"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| "entitlements lack application-identifier".to_string())?;

        let bundle_id = match &prefix {
            Some(prefix) => application_identifier
                .strip_prefix(&format!("{}.", prefix))
                .unwrap_or(application_identifier),
            None => application_identifier
                .split_once('.')
                .map(|(_, rest)| rest)
                .unwrap_or(application_identifier),
        }
        .to_string();

        let platform = dict
            .get("Platform")
            .and_then(|v| v.as_array())
            .and_then(|a| {
                a.iter()
                    .filter_map(|v| v.as_string())
                    .find_map(|s| s.parse::<Platform>().ok())
            })
            .unwrap_or(Platform::Ios);

        let devices = dict
            .get("ProvisionedDevices")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_string())
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let provisions_all_devices = dict
            .get("ProvisionsAllDevices")
            .and_then(|v| v.as_boolean())
            .unwrap_or(false);

        let get_task_allow = entitlements
            .get("get-task-allow")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let distribution_type = if provisions_all_devices {
            DistributionType::Enterprise
        } else if !devices.is_empty() {
            if get_task_allow {
                DistributionType::Development
            } else {
                DistributionType::AdHoc
            }
        } else {
            DistributionType::AppStore
        };

        let mut certificate_serials = vec![];
        if let Some(certs) = dict.get("DeveloperCertificates").and_then(|v| v.as_array()) {
            for data in certs.iter().filter_map(|v| v.as_data()) {
                match SigningCertificate::from_der(data.to_vec()) {
                    Ok(cert) => certificate_serials.push(cert.serial().to_string()),
                    Err(e) => warn!("profile {} embeds unreadable certificate: {}", uuid, e),
                }
            }
        }

        let mut profile = Self::new(
            uuid,
            name,
            bundle_id,
            platform,
            distribution_type,
            expires,
        );
        profile.team_id = team_id;
        profile.entitlements = entitlements;
        profile.devices = devices;
        profile.provisions_all_devices = provisions_all_devices;
        profile.certificate_serials = certificate_serials;
        profile.xcode_managed |= dict
            .get("IsXcodeManaged")
            .and_then(|v| v.as_boolean())
            .unwrap_or(false);

        Ok(profile)
    }

    pub fn profile_type(&self) -> ProfileType {
        ProfileType::new(self.platform, self.distribution_type)
    }

    pub fn is_wildcard(&self) -> bool {
        self.bundle_id.contains('*')
    }

    /// The bundle id pattern as a glob, where `*` matches any run of characters.
    pub fn bundle_id_pattern(&self) -> Result<glob::Pattern, ProvisioningError> {
        Ok(glob::Pattern::new(&self.bundle_id)?)
    }

    /// Whether this profile's bundle id pattern matches a literal bundle id.
    ///
    /// A pattern that is not a valid glob matches nothing.
    pub fn matches_bundle_id(&self, bundle_id: &str) -> bool {
        match self.bundle_id_pattern() {
            Ok(pattern) => pattern.matches(bundle_id),
            Err(e) => {
                warn!("ignoring profile {}: {}", self, e);
                false
            }
        }
    }

    /// Number of literal characters in the bundle id pattern.
    pub fn specificity(&self) -> usize {
        self.bundle_id.chars().filter(|c| *c != '*').count()
    }

    /// Sort key placing the most specific pattern first, then the smallest UUID.
    pub fn specificity_key(&self) -> (Reverse<usize>, bool, &str) {
        (Reverse(self.specificity()), self.is_wildcard(), &self.uuid)
    }

    pub fn embeds_certificate(&self, serial: &str) -> bool {
        let serial = normalize_serial(serial);
        self.certificate_serials.iter().any(|s| *s == serial)
    }

    /// Whether the profile is still valid `min_validity_days` from `now`.
    ///
    /// A window reaching past the representable date range is never satisfied.
    pub fn is_active_at(&self, now: DateTime<Utc>, min_validity_days: u32) -> bool {
        now.checked_add_signed(Duration::days(i64::from(min_validity_days)))
            .map(|end| end < self.expires)
            .unwrap_or(false)
    }

    /// Whether the profile provisions a device, comparing normalized UDIDs.
    pub fn provisions_device(&self, udid: &str) -> bool {
        if self.provisions_all_devices {
            return true;
        }

        let udid = normalize_udid(udid);
        self.devices.iter().any(|d| normalize_udid(d) == udid)
    }

    /// File name the profile is installed under.
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.uuid, self.platform.profile_extension())
    }
}

impl std::fmt::Display for ProvisioningProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.uuid)
    }
}

/// Whether a profile name denotes a profile managed by Xcode.
pub fn is_xcode_managed_name(name: &str) -> bool {
    XCODE_MANAGED_NAME_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

/// Replace the last component of a bundle id with `*`.
pub fn wildcard_bundle_id(bundle_id: &str) -> Result<String, ProvisioningError> {
    bundle_id
        .rfind('.')
        .map(|idx| format!("{}.*", &bundle_id[..idx]))
        .ok_or_else(|| ProvisioningError::InvalidBundleId(bundle_id.to_string()))
}

/// Name of the profile this crate manages for a profile type and bundle id.
///
/// `*` is not permitted in profile names, so wildcard ids are spelled out.
pub fn managed_profile_name(profile_type: ProfileType, bundle_id: &str) -> String {
    let (prefix, bundle_id) = match bundle_id.strip_suffix(".*") {
        Some(stripped) => ("Wildcard ", stripped),
        None => ("", bundle_id),
    };

    format!(
        "{}{} {} {} - ({})",
        prefix,
        MANAGED_NAME_PREFIX,
        profile_type.platform(),
        profile_type.distribution_type(),
        bundle_id
    )
}

/// Name of the app id this crate registers for a bundle id.
pub fn app_id_name(bundle_id: &str) -> String {
    let prefix = if bundle_id.ends_with(".*") {
        "Wildcard "
    } else {
        ""
    };

    let words = bundle_id.replace(&['.', '_', '-', '*'][..], " ");

    format!("{}{} {}", prefix, MANAGED_NAME_PREFIX, words)
}

/// Normalize a device UDID for comparison.
///
/// Characters other than alphanumerics and `-` are dropped, then `-` is dropped
/// and the result is lowercased.
pub fn normalize_udid(udid: &str) -> String {
    UDID_INVALID_CHARS
        .replace_all(udid, "")
        .replace('-', "")
        .to_lowercase()
}
