// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Entitlements required by targets and granted by provisioning profiles.
//!
//! Entitlement values are kept as JSON values. Profile plists are converted on
//! load so that target and profile entitlements compare with plain equality.

use {
    crate::ProvisioningError,
    serde::{Deserialize, Serialize},
    serde_json::Value,
    std::collections::BTreeMap,
};

/// Entitlement holding the iCloud container identifiers.
///
/// Compared as a set containment rather than by equality.
pub const ICLOUD_CONTAINER_IDENTIFIERS_KEY: &str =
    "com.apple.developer.icloud-container-identifiers";

pub const UBIQUITY_CONTAINER_IDENTIFIERS_KEY: &str =
    "com.apple.developer.ubiquity-container-identifiers";

pub const PARENT_APPLICATION_IDENTIFIERS_KEY: &str =
    "com.apple.developer.parent-application-identifiers";

pub const ON_DEMAND_INSTALL_CAPABLE_KEY: &str = "com.apple.developer.on-demand-install-capable";

pub const SIGN_IN_WITH_APPLE_KEY: &str = "com.apple.developer.applesignin";

pub const DATA_PROTECTION_KEY: &str = "com.apple.developer.default-data-protection";

/// How the remote authority treats an entitlement key.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntitlementKind {
    /// Backed by a bundle id capability of the given remote type.
    Capability(&'static str),
    /// Present in profiles but not managed as a capability.
    Ignored,
    /// Only attachable to a profile through a manually requested template.
    ProfileAttached,
    /// Not a capability we know about.
    Unknown,
}

const CAPABILITIES: &[(&str, &str)] = &[
    ("com.apple.security.application-groups", "APP_GROUPS"),
    ("com.apple.developer.in-app-payments", "APPLE_PAY"),
    ("com.apple.developer.associated-domains", "ASSOCIATED_DOMAINS"),
    ("com.apple.developer.healthkit", "HEALTHKIT"),
    ("com.apple.developer.homekit", "HOMEKIT"),
    (
        "com.apple.developer.networking.HotspotConfiguration",
        "HOT_SPOT",
    ),
    ("com.apple.InAppPurchase", "IN_APP_PURCHASE"),
    ("inter-app-audio", "INTER_APP_AUDIO"),
    ("com.apple.developer.networking.multipath", "MULTIPATH"),
    (
        "com.apple.developer.networking.networkextension",
        "NETWORK_EXTENSIONS",
    ),
    (
        "com.apple.developer.nfc.readersession.formats",
        "NFC_TAG_READING",
    ),
    ("com.apple.developer.networking.vpn.api", "PERSONAL_VPN"),
    ("aps-environment", "PUSH_NOTIFICATIONS"),
    ("com.apple.developer.siri", "SIRIKIT"),
    (SIGN_IN_WITH_APPLE_KEY, "APPLE_ID_AUTH"),
    (ON_DEMAND_INSTALL_CAPABLE_KEY, "ON_DEMAND_INSTALL_CAPABLE"),
    ("com.apple.developer.pass-type-identifiers", "WALLET"),
    (
        "com.apple.external-accessory.wireless-configuration",
        "WIRELESS_ACCESSORY_CONFIGURATION",
    ),
    (DATA_PROTECTION_KEY, "DATA_PROTECTION"),
    ("com.apple.developer.icloud-services", "ICLOUD"),
    (
        "com.apple.developer.authentication-services.autofill-credential-provider",
        "AUTOFILL_CREDENTIAL_PROVIDER",
    ),
    (
        "com.apple.developer.networking.wifi-info",
        "ACCESS_WIFI_INFORMATION",
    ),
    ("com.apple.developer.ClassKit-environment", "CLASSKIT"),
    (
        "com.apple.developer.coremedia.hls.low-latency",
        "COREMEDIA_HLS_LOW_LATENCY",
    ),
];

const IGNORED: &[&str] = &[
    ICLOUD_CONTAINER_IDENTIFIERS_KEY,
    UBIQUITY_CONTAINER_IDENTIFIERS_KEY,
    PARENT_APPLICATION_IDENTIFIERS_KEY,
];

const PROFILE_ATTACHED: &[&str] = &[
    "com.apple.developer.contacts.notes",
    "com.apple.developer.carplay-audio",
    "com.apple.developer.carplay-communication",
    "com.apple.developer.carplay-charging",
    "com.apple.developer.carplay-maps",
    "com.apple.developer.carplay-parking",
    "com.apple.developer.carplay-quick-ordering",
    "com.apple.developer.exposure-notification",
];

/// App Clip entitlements. Their app ids must be registered by hand.
const APP_CLIP: &[&str] = &[
    ON_DEMAND_INSTALL_CAPABLE_KEY,
    PARENT_APPLICATION_IDENTIFIERS_KEY,
];

/// Classify an entitlement key.
pub fn entitlement_kind(key: &str) -> EntitlementKind {
    if let Some((_, capability)) = CAPABILITIES.iter().find(|(k, _)| *k == key) {
        EntitlementKind::Capability(capability)
    } else if IGNORED.contains(&key) {
        EntitlementKind::Ignored
    } else if PROFILE_ATTACHED.contains(&key) {
        EntitlementKind::ProfileAttached
    } else {
        EntitlementKind::Unknown
    }
}

/// Map a `default-data-protection` value to the remote capability option key.
pub fn data_protection_option(value: &str) -> Option<&'static str> {
    match value {
        "NSFileProtectionComplete" => Some("COMPLETE_PROTECTION"),
        "NSFileProtectionCompleteUnlessOpen" => Some("PROTECTED_UNLESS_OPEN"),
        "NSFileProtectionCompleteUntilFirstUserAuthentication" => {
            Some("PROTECTED_UNTIL_FIRST_USER_AUTH")
        }
        _ => None,
    }
}

/// A set of entitlements keyed by entitlement name.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Entitlements(BTreeMap<String, Value>);

impl Entitlements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl ToString, value: Value) -> Option<Value> {
        self.0.insert(key.to_string(), value)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(|k| k.as_str())
    }

    /// Convert a plist dictionary, such as a profile's `Entitlements` key.
    pub fn from_plist_dictionary(dict: &plist::Dictionary) -> Self {
        Self(
            dict.iter()
                .map(|(k, v)| (k.clone(), plist_to_json(v)))
                .collect(),
        )
    }

    /// iCloud container identifiers, or `None` when the key is absent.
    pub fn icloud_containers(&self) -> Result<Option<Vec<String>>, ProvisioningError> {
        match self.0.get(ICLOUD_CONTAINER_IDENTIFIERS_KEY) {
            None => Ok(None),
            Some(Value::Array(values)) => values
                .iter()
                .map(|v| {
                    v.as_str().map(|s| s.to_string()).ok_or_else(|| {
                        ProvisioningError::Configuration(format!(
                            "{} must only contain strings",
                            ICLOUD_CONTAINER_IDENTIFIERS_KEY
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
            Some(_) => Err(ProvisioningError::Configuration(format!(
                "{} must be an array",
                ICLOUD_CONTAINER_IDENTIFIERS_KEY
            ))),
        }
    }

    /// Containers required by `self` that `granted` does not provide.
    ///
    /// When `self` has no container key nothing is missing. When `granted`
    /// has none, every required container is missing.
    pub fn find_missing_containers(
        &self,
        granted: &Entitlements,
    ) -> Result<Vec<String>, ProvisioningError> {
        let required = match self.icloud_containers()? {
            Some(required) => required,
            None => return Ok(vec![]),
        };

        let available = match granted.icloud_containers()? {
            Some(available) => available,
            None => return Ok(required),
        };

        Ok(required
            .into_iter()
            .filter(|c| !available.contains(c))
            .collect())
    }

    /// Keys of entitlements that cannot be expressed through remote profile creation.
    pub fn unsupported_keys(&self) -> Vec<&str> {
        self.keys()
            .filter(|k| {
                APP_CLIP.contains(k) || entitlement_kind(k) == EntitlementKind::ProfileAttached
            })
            .collect()
    }

    /// Remote capability types implied by these entitlements, in key order.
    pub fn capability_types(&self) -> Vec<(&str, &'static str)> {
        self.keys()
            .filter_map(|k| match entitlement_kind(k) {
                EntitlementKind::Capability(c) => Some((k, c)),
                _ => None,
            })
            .collect()
    }
}

impl FromIterator<(String, Value)> for Entitlements {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<BTreeMap<String, Value>> for Entitlements {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Self(v)
    }
}

/// Convert a plist value to its JSON equivalent.
///
/// Dates become RFC 3339 strings and data becomes base64 text.
pub fn plist_to_json(value: &plist::Value) -> Value {
    match value {
        plist::Value::Array(a) => Value::Array(a.iter().map(plist_to_json).collect()),
        plist::Value::Dictionary(d) => Value::Object(
            d.iter()
                .map(|(k, v)| (k.clone(), plist_to_json(v)))
                .collect(),
        ),
        plist::Value::Boolean(b) => Value::Bool(*b),
        plist::Value::Data(data) => Value::String(base64::encode(data)),
        plist::Value::Date(date) => Value::String(
            chrono::DateTime::<chrono::Utc>::from(std::time::SystemTime::from(*date)).to_rfc3339(),
        ),
        plist::Value::Real(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        plist::Value::Integer(i) => {
            if let Some(v) = i.as_signed() {
                Value::from(v)
            } else if let Some(v) = i.as_unsigned() {
                Value::from(v)
            } else {
                Value::Null
            }
        }
        plist::Value::String(s) => Value::String(s.clone()),
        plist::Value::Uid(uid) => Value::from(uid.get()),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    fn ents(value: Value) -> Entitlements {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn missing_containers() -> Result<(), ProvisioningError> {
        let required = ents(json!({
            ICLOUD_CONTAINER_IDENTIFIERS_KEY: ["iCloud.com.acme.a", "iCloud.com.acme.b"],
        }));

        assert!(Entitlements::new()
            .find_missing_containers(&required)?
            .is_empty());

        assert_eq!(
            required.find_missing_containers(&Entitlements::new())?,
            vec!["iCloud.com.acme.a", "iCloud.com.acme.b"]
        );

        let granted = ents(json!({
            ICLOUD_CONTAINER_IDENTIFIERS_KEY: ["iCloud.com.acme.b", "iCloud.com.acme.c"],
        }));
        assert_eq!(
            required.find_missing_containers(&granted)?,
            vec!["iCloud.com.acme.a"]
        );

        let granted = ents(json!({
            ICLOUD_CONTAINER_IDENTIFIERS_KEY: [
                "iCloud.com.acme.a", "iCloud.com.acme.b", "iCloud.com.acme.c"
            ],
        }));
        assert!(required.find_missing_containers(&granted)?.is_empty());

        Ok(())
    }

    #[test]
    fn malformed_containers() {
        let bad = ents(json!({ ICLOUD_CONTAINER_IDENTIFIERS_KEY: "iCloud.com.acme" }));
        assert!(bad.find_missing_containers(&Entitlements::new()).is_err());
    }

    #[test]
    fn classification() {
        assert_eq!(
            entitlement_kind("aps-environment"),
            EntitlementKind::Capability("PUSH_NOTIFICATIONS")
        );
        assert_eq!(
            entitlement_kind(ICLOUD_CONTAINER_IDENTIFIERS_KEY),
            EntitlementKind::Ignored
        );
        assert_eq!(
            entitlement_kind("com.apple.developer.carplay-maps"),
            EntitlementKind::ProfileAttached
        );
        assert_eq!(
            entitlement_kind("keychain-access-groups"),
            EntitlementKind::Unknown
        );
    }

    #[test]
    fn unsupported_keys() {
        let e = ents(json!({
            "aps-environment": "production",
            "com.apple.developer.contacts.notes": true,
            ON_DEMAND_INSTALL_CAPABLE_KEY: true,
        }));

        assert_eq!(
            e.unsupported_keys(),
            vec![
                "com.apple.developer.contacts.notes",
                ON_DEMAND_INSTALL_CAPABLE_KEY
            ]
        );
        assert_eq!(
            e.capability_types(),
            vec![
                ("aps-environment", "PUSH_NOTIFICATIONS"),
                (ON_DEMAND_INSTALL_CAPABLE_KEY, "ON_DEMAND_INSTALL_CAPABLE"),
            ]
        );
    }

    #[test]
    fn plist_conversion() {
        let mut dict = plist::Dictionary::new();
        dict.insert("get-task-allow".into(), plist::Value::Boolean(true));
        dict.insert(
            ICLOUD_CONTAINER_IDENTIFIERS_KEY.into(),
            plist::Value::Array(vec![plist::Value::String("iCloud.x".into())]),
        );
        dict.insert("count".into(), plist::Value::Integer(3.into()));

        let e = Entitlements::from_plist_dictionary(&dict);
        assert_eq!(e.get("get-task-allow"), Some(&json!(true)));
        assert_eq!(e.get("count"), Some(&json!(3)));
        assert_eq!(
            e.icloud_containers().unwrap(),
            Some(vec!["iCloud.x".to_string()])
        );
    }

    #[test]
    fn data_protection() {
        assert_eq!(
            data_protection_option("NSFileProtectionComplete"),
            Some("COMPLETE_PROTECTION")
        );
        assert_eq!(data_protection_option("bogus"), None);
    }
}
