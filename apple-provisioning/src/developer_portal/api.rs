// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! JSON:API documents exchanged with the developer portal.
//!
//! Both authentication modes speak the same documents, as documented at
//! https://developer.apple.com/documentation/appstoreconnectapi.

use {
    crate::{
        entitlements::data_protection_option, CertificateClass, ProfileState, ProfileType,
        ProvisioningError, ProvisioningProfile, SigningCertificate,
    },
    chrono::{DateTime, Utc},
    log::warn,
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

/// A document with a primary `data` member.
#[derive(Clone, Debug, Deserialize)]
pub struct Document<T> {
    pub data: T,
    #[serde(default)]
    pub links: DocumentLinks,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct DocumentLinks {
    #[serde(default)]
    pub next: Option<String>,
}

/// A resource object.
#[derive(Clone, Debug, Deserialize)]
pub struct Resource<A> {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub attributes: A,
}

/// Reference to a resource in a relationship.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ResourceRef {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl ResourceRef {
    pub fn new(id: impl ToString, kind: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: kind.to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ToOne {
    pub data: ResourceRef,
}

#[derive(Clone, Debug, Serialize)]
pub struct ToMany {
    pub data: Vec<ResourceRef>,
}

/// A request document creating or updating a resource.
#[derive(Clone, Debug, Serialize)]
pub struct RequestDocument<A, R> {
    pub data: RequestData<A, R>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RequestData<A, R> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub attributes: A,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relationships: Option<R>,
}

impl<A, R> RequestDocument<A, R> {
    pub fn new(kind: &'static str, attributes: A, relationships: Option<R>) -> Self {
        Self {
            data: RequestData {
                kind,
                id: None,
                attributes,
                relationships,
            },
        }
    }
}

/// Relationships of a request that has none.
#[derive(Clone, Debug, Serialize)]
pub struct NoRelationships {}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateAttributes {
    #[serde(default)]
    pub certificate_content: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub expiration_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub platform: Option<String>,
    pub serial_number: String,
    pub certificate_type: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateCreateAttributes {
    pub csr_content: String,
    pub certificate_type: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileAttributes {
    pub name: String,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub profile_content: Option<String>,
    pub uuid: String,
    pub profile_state: ProfileState,
    pub profile_type: ProfileType,
    #[serde(default)]
    pub expiration_date: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileCreateAttributes {
    pub name: String,
    pub profile_type: ProfileType,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileCreateRelationships {
    pub bundle_id: ToOne,
    pub certificates: ToMany,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub devices: Option<ToMany>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAttributes {
    pub udid: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing)]
    pub status: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleIdAttributes {
    pub identifier: String,
    pub name: String,
    pub platform: String,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CapabilityOption {
    pub key: String,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CapabilitySetting {
    pub key: String,
    #[serde(default)]
    pub options: Vec<CapabilityOption>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleIdCapabilityAttributes {
    pub capability_type: String,
    #[serde(default)]
    pub settings: Option<Vec<CapabilitySetting>>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleIdCapabilityRelationships {
    pub bundle_id: ToOne,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ErrorDocument {
    #[serde(default)]
    pub errors: Vec<ApiError>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub detail: String,
}

/// Summarize an error response body on one line.
pub fn error_summary(body: &[u8]) -> String {
    match serde_json::from_slice::<ErrorDocument>(body) {
        Ok(doc) if !doc.errors.is_empty() => doc
            .errors
            .iter()
            .map(|e| format!("{}: {}: {}", e.code, e.title, e.detail))
            .collect::<Vec<_>>()
            .join("; "),
        _ => String::from_utf8_lossy(body).trim().to_string(),
    }
}

/// Settings to enable a capability with, derived from the entitlement value.
pub fn capability_settings(capability_type: &str, value: &Value) -> Option<Vec<CapabilitySetting>> {
    let setting = |key: &str, option: &str| {
        Some(vec![CapabilitySetting {
            key: key.to_string(),
            options: vec![CapabilityOption {
                key: option.to_string(),
            }],
        }])
    };

    match capability_type {
        "ICLOUD" => setting("ICLOUD_VERSION", "XCODE_6"),
        "DATA_PROTECTION" => value
            .as_str()
            .and_then(data_protection_option)
            .and_then(|option| setting("DATA_PROTECTION_PERMISSION_LEVEL", option)),
        "APPLE_ID_AUTH" => setting("APPLE_ID_AUTH_APP_CONSENT", "PRIMARY_APP_CONSENT"),
        _ => None,
    }
}

impl Resource<CertificateAttributes> {
    /// Convert to the certificate model.
    ///
    /// The certificate content is parsed when present, otherwise listing
    /// metadata is used.
    pub fn into_certificate(self) -> Result<SigningCertificate, ProvisioningError> {
        let attributes = self.attributes;

        let mut cert = match &attributes.certificate_content {
            Some(content) => SigningCertificate::from_der(base64::decode(content)?)?,
            None => SigningCertificate::new(
                &attributes.serial_number,
                attributes
                    .name
                    .clone()
                    .or_else(|| attributes.display_name.clone())
                    .unwrap_or_default(),
                CertificateClass::Development,
                attributes.expiration_date.unwrap_or_else(Utc::now),
            ),
        };

        if let Some(class) = CertificateClass::from_api_type(&attributes.certificate_type) {
            cert.class = class;
        }
        cert.remote_id = Some(self.id);

        Ok(cert)
    }
}

impl Resource<ProfileAttributes> {
    /// Convert to the profile model.
    ///
    /// Profile content is decoded when present. Listing metadata is used when
    /// the content is absent or unreadable.
    pub fn into_profile(self) -> Result<ProvisioningProfile, ProvisioningError> {
        let attributes = self.attributes;

        let decoded = match &attributes.profile_content {
            Some(content) => {
                let data = base64::decode(content)?;
                match ProvisioningProfile::from_signed_data(&data) {
                    Ok(profile) => Some(profile),
                    Err(e) => {
                        warn!("unable to decode content of profile {}: {}", attributes.name, e);
                        None
                    }
                }
            }
            None => None,
        };

        let mut profile = match decoded {
            Some(profile) => profile,
            None => ProvisioningProfile::new(
                &attributes.uuid,
                &attributes.name,
                "",
                attributes.profile_type.platform(),
                attributes.profile_type.distribution_type(),
                attributes.expiration_date.unwrap_or_else(Utc::now),
            ),
        };

        // The remote authority knows the distribution type; decoding can only guess.
        profile.distribution_type = attributes.profile_type.distribution_type();
        profile.name = attributes.name;
        profile.state = attributes.profile_state;
        profile.remote_id = Some(self.id);

        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, indoc::indoc, serde_json::json};

    #[test]
    fn profile_create_request_shape() -> Result<(), ProvisioningError> {
        let doc = RequestDocument::new(
            "profiles",
            ProfileCreateAttributes {
                name: "rprovision iOS development - (com.acme.app)".into(),
                profile_type: ProfileType::IosAppDevelopment,
            },
            Some(ProfileCreateRelationships {
                bundle_id: ToOne {
                    data: ResourceRef::new("B1", "bundleIds"),
                },
                certificates: ToMany {
                    data: vec![ResourceRef::new("C1", "certificates")],
                },
                devices: None,
            }),
        );

        assert_eq!(
            serde_json::to_value(&doc)?,
            json!({
                "data": {
                    "type": "profiles",
                    "attributes": {
                        "name": "rprovision iOS development - (com.acme.app)",
                        "profileType": "IOS_APP_DEVELOPMENT",
                    },
                    "relationships": {
                        "bundleId": {"data": {"id": "B1", "type": "bundleIds"}},
                        "certificates": {"data": [{"id": "C1", "type": "certificates"}]},
                    }
                }
            })
        );

        Ok(())
    }

    #[test]
    fn profile_listing_without_content() -> Result<(), ProvisioningError> {
        let doc: Document<Vec<Resource<ProfileAttributes>>> = serde_json::from_str(indoc! {r#"
            {
              "data": [
                {
                  "id": "P1",
                  "type": "profiles",
                  "attributes": {
                    "name": "rprovision iOS app-store - (com.acme.app)",
                    "platform": "IOS",
                    "uuid": "uuid-1",
                    "profileState": "INVALID",
                    "profileType": "IOS_APP_STORE",
                    "expirationDate": "2030-01-01T00:00:00.000+00:00"
                  }
                }
              ],
              "links": {"next": "https://api.appstoreconnect.apple.com/v1/profiles?cursor=x"}
            }
        "#})?;

        assert!(doc.links.next.is_some());

        let profile = doc.data.into_iter().next().unwrap().into_profile()?;
        assert_eq!(profile.uuid, "uuid-1");
        assert_eq!(profile.remote_id.as_deref(), Some("P1"));
        assert_eq!(profile.state, ProfileState::Invalid);
        assert_eq!(profile.distribution_type, crate::DistributionType::AppStore);

        Ok(())
    }

    #[test]
    fn errors_summarized() {
        let body = br#"{"errors": [{"code": "ENTITY_ERROR", "title": "bad", "detail": "udid invalid"}]}"#;
        assert_eq!(error_summary(body), "ENTITY_ERROR: bad: udid invalid");
        assert_eq!(error_summary(b"gateway timeout\n"), "gateway timeout");
    }

    #[test]
    fn settings_for_capabilities() {
        assert_eq!(
            capability_settings("ICLOUD", &json!(["CloudKit"])).unwrap()[0].options[0].key,
            "XCODE_6"
        );
        assert_eq!(
            capability_settings("DATA_PROTECTION", &json!("NSFileProtectionComplete")).unwrap()[0]
                .options[0]
                .key,
            "COMPLETE_PROTECTION"
        );
        assert!(capability_settings("DATA_PROTECTION", &json!("bogus")).is_none());
        assert!(capability_settings("PUSH_NOTIFICATIONS", &json!("production")).is_none());
    }
}
