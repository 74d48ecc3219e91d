// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! A client for Apple's developer portal.

[DeveloperPortalClient] implements [RemoteProvisioningClient] over the JSON:API
documents in [api]. It authenticates either with an App Store Connect API key
([api_token]) or with a saved Apple ID web session ([session]). Which one is
used is decided by the [Authenticator] it is constructed with.
*/

pub mod api;
pub mod api_token;
pub mod session;

use {
    self::{
        api::{
            capability_settings, error_summary, BundleIdAttributes, BundleIdCapabilityAttributes,
            BundleIdCapabilityRelationships, CertificateAttributes, CertificateCreateAttributes,
            DeviceAttributes, Document, NoRelationships, ProfileAttributes,
            ProfileCreateAttributes, ProfileCreateRelationships, RequestDocument, Resource,
            ResourceRef, ToMany, ToOne,
        },
        api_token::{ConnectToken, ConnectTokenEncoder, ENTERPRISE_AUDIENCE},
        session::SessionCredentials,
    },
    crate::{
        app_id_name, normalize_udid, AttemptError, CertificateClass, CredentialKind, Device,
        Entitlements, Platform, ProfileFilter, ProfileRequest, ProvisioningError,
        ProvisioningProfile, RemoteProvisioningClient, RetryPolicy, SigningCertificate,
    },
    chrono::Utc,
    log::{debug, error, info, warn},
    reqwest::{
        blocking::{Client, ClientBuilder, RequestBuilder},
        header::RETRY_AFTER,
        Method, StatusCode,
    },
    serde::{de::DeserializeOwned, Serialize},
    serde_json::Value,
    std::{collections::BTreeMap, sync::Mutex, time::Duration},
    x509_certificate::{EcdsaCurve, InMemorySigningKeyPair, KeyAlgorithm, X509CertificateBuilder},
};

pub const APP_STORE_CONNECT_API_URL: &str = "https://api.appstoreconnect.apple.com/v1/";
pub const ENTERPRISE_API_URL: &str = "https://api.enterprise.developer.apple.com/v1/";
pub const SESSION_API_URL: &str = "https://developer.apple.com/services-account/v1/";

const SESSION_HOST: &str = "developer.apple.com";
const USER_AGENT: &str = concat!("rprovision/", env!("CARGO_PKG_VERSION"));
const PAGE_LIMIT: &str = "200";

/// Common name of certificate signing requests. The portal assigns its own subject.
const CSR_COMMON_NAME: &str = "rprovision";

/// Default timeout of HTTP requests.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// How requests to the developer portal are authenticated.
pub enum Authenticator {
    /// Bearer JWTs minted from an App Store Connect API key.
    ApiKey {
        encoder: ConnectTokenEncoder,
        token: Mutex<Option<ConnectToken>>,
    },
    /// Cookies of an Apple ID web session.
    Session(SessionCredentials),
}

impl Authenticator {
    pub fn api_key(encoder: ConnectTokenEncoder) -> Self {
        Self::ApiKey {
            encoder,
            token: Mutex::new(None),
        }
    }

    pub fn session(credentials: SessionCredentials) -> Self {
        Self::Session(credentials)
    }

    pub fn kind(&self) -> CredentialKind {
        match self {
            Self::ApiKey { .. } => CredentialKind::ApiKey,
            Self::Session(_) => CredentialKind::Session,
        }
    }

    /// The API root requests are sent to.
    pub fn base_url(&self) -> &'static str {
        match self {
            Self::ApiKey { encoder, .. } if encoder.audience() == ENTERPRISE_AUDIENCE => {
                ENTERPRISE_API_URL
            }
            Self::ApiKey { .. } => APP_STORE_CONNECT_API_URL,
            Self::Session(_) => SESSION_API_URL,
        }
    }

    fn bearer_token(
        encoder: &ConnectTokenEncoder,
        token: &Mutex<Option<ConnectToken>>,
    ) -> Result<String, ProvisioningError> {
        let mut token = token.lock().map_err(|_| {
            ProvisioningError::InvariantViolation("API token lock poisoned".into())
        })?;

        let now = Utc::now();

        match token.as_ref() {
            Some(existing) if !existing.is_expiring(now) => Ok(existing.token.clone()),
            _ => {
                debug!("issuing new token for API key {}", encoder.key_id());
                let new = encoder.new_token(now)?;
                let value = new.token.clone();
                token.replace(new);

                Ok(value)
            }
        }
    }

    /// Add credentials to a request for `url`.
    fn authorize(
        &self,
        request: RequestBuilder,
        url: &str,
    ) -> Result<RequestBuilder, ProvisioningError> {
        match self {
            Self::ApiKey { encoder, token } => {
                Ok(request.bearer_auth(Self::bearer_token(encoder, token)?))
            }
            Self::Session(session) => {
                let now = Utc::now();

                if session.is_expired(now) {
                    return Err(ProvisioningError::Configuration(format!(
                        "Apple ID session of {} has expired; log in again",
                        session.apple_id
                    )));
                }

                let cookie = session.cookie_header(SESSION_HOST, now).ok_or_else(|| {
                    ProvisioningError::Configuration(format!(
                        "Apple ID session of {} has no cookies for {}",
                        session.apple_id, SESSION_HOST
                    ))
                })?;

                let mut request = request
                    .header("Cookie", cookie)
                    .header("X-Requested-With", "XMLHttpRequest");

                if let Some(team_id) = &session.team_id {
                    if !url.contains("teamId=") {
                        request = request.query(&[("teamId", team_id)]);
                    }
                }

                Ok(request)
            }
        }
    }

    /// Forget cached credentials after the server rejected them.
    fn invalidate(&self) {
        if let Self::ApiKey { token, .. } = self {
            if let Ok(mut token) = token.lock() {
                token.take();
            }
        }
    }
}

/// A client for the developer portal's provisioning resources.
pub struct DeveloperPortalClient {
    client: Client,
    base_url: String,
    authenticator: Authenticator,
    retry: RetryPolicy,
}

impl DeveloperPortalClient {
    pub fn new(
        authenticator: Authenticator,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Result<Self, ProvisioningError> {
        let client = ClientBuilder::default()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: authenticator.base_url().to_string(),
            authenticator,
            retry,
        })
    }

    /// Send requests to another API root.
    pub fn with_base_url(mut self, base_url: impl ToString) -> Self {
        self.base_url = base_url.to_string();
        if !self.base_url.ends_with('/') {
            self.base_url.push('/');
        }
        self
    }

    pub fn credential_kind(&self) -> CredentialKind {
        self.authenticator.kind()
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("https://") || path.starts_with("http://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }

    /// Perform a single attempt of a request.
    fn attempt(
        &self,
        method: &Method,
        url: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Vec<u8>, AttemptError> {
        let mut request = self
            .client
            .request(method.clone(), url)
            .header("Accept", "application/json")
            .query(query);

        if let Some(body) = body {
            request = request.json(body);
        }

        let request = self
            .authenticator
            .authorize(request, url)
            .map_err(AttemptError::Permanent)?
            .build()
            .map_err(|e| AttemptError::Permanent(e.into()))?;

        debug!("{} {}", request.method(), request.url());

        let response = self
            .client
            .execute(request)
            .map_err(|e| AttemptError::Transient(e.into(), None))?;

        let status = response.status();

        if status.is_success() {
            return response
                .bytes()
                .map(|b| b.to_vec())
                .map_err(|e| AttemptError::Transient(e.into(), None));
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        error!("HTTP error from {}", url);

        let body = response.bytes().map(|b| b.to_vec()).unwrap_or_default();

        if let Ok(value) = serde_json::from_slice::<Value>(&body) {
            if let Ok(pretty) = serde_json::to_string_pretty(&value) {
                for line in pretty.lines() {
                    error!("{}", line);
                }
            }
        } else {
            error!("{}", String::from_utf8_lossy(&body));
        }

        if status == StatusCode::UNAUTHORIZED {
            self.authenticator.invalidate();
        }

        let err = ProvisioningError::RemoteApi {
            status: status.as_u16(),
            message: error_summary(&body),
        };

        if RetryPolicy::is_retryable_status(status.as_u16()) {
            Err(AttemptError::Transient(err, retry_after))
        } else {
            Err(AttemptError::Permanent(err))
        }
    }

    /// Send a request, retrying reads according to the retry policy.
    fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<Vec<u8>, ProvisioningError> {
        let url = self.url(path);

        let policy = if method == Method::GET {
            self.retry
        } else {
            RetryPolicy::once()
        };

        policy.run(
            || self.attempt(&method, &url, query, body.as_ref()),
            std::thread::sleep,
        )
    }

    fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ProvisioningError> {
        Ok(serde_json::from_slice(&self.send(
            Method::GET,
            path,
            query,
            None,
        )?)?)
    }

    /// Fetch every page of a collection.
    fn get_all<A: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<Resource<A>>, ProvisioningError> {
        let mut doc: Document<Vec<Resource<A>>> = self.get(path, query)?;
        let mut res = std::mem::take(&mut doc.data);

        while let Some(next) = doc.links.next.take() {
            doc = self.get(&next, &[])?;
            res.append(&mut doc.data);
        }

        Ok(res)
    }

    fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T, ProvisioningError> {
        let body = serde_json::to_value(body)?;

        Ok(serde_json::from_slice(&self.send(
            Method::POST,
            path,
            &[],
            Some(body),
        )?)?)
    }

    fn patch(&self, path: &str, body: &impl Serialize) -> Result<(), ProvisioningError> {
        let body = serde_json::to_value(body)?;
        self.send(Method::PATCH, path, &[], Some(body))?;

        Ok(())
    }

    fn delete(&self, path: &str) -> Result<(), ProvisioningError> {
        self.send(Method::DELETE, path, &[], None)?;

        Ok(())
    }

    /// Find the bundle id resource of an identifier, registering it if missing.
    fn ensure_bundle_id(
        &self,
        identifier: &str,
        platform: Platform,
    ) -> Result<String, ProvisioningError> {
        if let Some(id) = self.find_bundle_id(identifier)? {
            return Ok(id);
        }

        info!("registering bundle identifier {}", identifier);

        let doc: Document<Resource<BundleIdAttributes>> = self.post(
            "bundleIds",
            &RequestDocument::<_, NoRelationships>::new(
                "bundleIds",
                BundleIdAttributes {
                    identifier: identifier.to_string(),
                    name: app_id_name(identifier),
                    platform: platform.api_platform().to_string(),
                },
                None,
            ),
        )?;

        Ok(doc.data.id)
    }

    /// Enable the capabilities entitlements require on a bundle id.
    fn sync_capabilities(
        &self,
        bundle_id_resource: &str,
        entitlements: &Entitlements,
    ) -> Result<(), ProvisioningError> {
        let wanted = entitlements.capability_types();
        if wanted.is_empty() {
            return Ok(());
        }

        let existing = self
            .get_all::<BundleIdCapabilityAttributes>(
                &format!("bundleIds/{}/bundleIdCapabilities", bundle_id_resource),
                &[],
            )?
            .into_iter()
            .map(|r| (r.attributes.capability_type.clone(), r))
            .collect::<BTreeMap<_, _>>();

        for (key, capability_type) in wanted {
            let settings = entitlements
                .get(key)
                .and_then(|value| capability_settings(capability_type, value));

            match existing.get(capability_type) {
                Some(current) if settings.is_none() || current.attributes.settings == settings => {
                    debug!("capability {} already enabled", capability_type);
                }
                Some(current) => {
                    info!("updating capability {}", capability_type);

                    let mut doc = RequestDocument::<_, NoRelationships>::new(
                        "bundleIdCapabilities",
                        BundleIdCapabilityAttributes {
                            capability_type: capability_type.to_string(),
                            settings,
                        },
                        None,
                    );
                    doc.data.id = Some(current.id.clone());

                    self.patch(&format!("bundleIdCapabilities/{}", current.id), &doc)?;
                }
                None => {
                    info!("enabling capability {} for {}", capability_type, key);

                    let _: Value = self.post(
                        "bundleIdCapabilities",
                        &RequestDocument::new(
                            "bundleIdCapabilities",
                            BundleIdCapabilityAttributes {
                                capability_type: capability_type.to_string(),
                                settings,
                            },
                            Some(BundleIdCapabilityRelationships {
                                bundle_id: ToOne {
                                    data: ResourceRef::new(bundle_id_resource, "bundleIds"),
                                },
                            }),
                        ),
                    )?;
                }
            }
        }

        Ok(())
    }

    /// Resolve device UDIDs to remote resource ids.
    ///
    /// Unregistered devices are skipped with a warning.
    fn device_ids(
        &self,
        platform: Platform,
        udids: &[String],
    ) -> Result<Vec<String>, ProvisioningError> {
        if udids.is_empty() {
            return Ok(vec![]);
        }

        let registered = self
            .list_devices(platform)?
            .into_iter()
            .map(|d| (normalize_udid(&d.udid), d.id))
            .collect::<BTreeMap<_, _>>();

        Ok(udids
            .iter()
            .filter_map(|udid| match registered.get(&normalize_udid(udid)) {
                Some(id) => Some(id.clone()),
                None => {
                    warn!("device {} is not registered; not provisioning it", udid);
                    None
                }
            })
            .collect())
    }
}

impl From<Resource<DeviceAttributes>> for Device {
    fn from(r: Resource<DeviceAttributes>) -> Self {
        Self {
            id: r.id,
            udid: r.attributes.udid,
            name: r.attributes.name,
            platform: r.attributes.platform,
            status: r.attributes.status,
        }
    }
}

impl RemoteProvisioningClient for DeveloperPortalClient {
    fn create_certificate(
        &self,
        class: CertificateClass,
    ) -> Result<SigningCertificate, ProvisioningError> {
        info!("creating {} certificate", class.as_str());

        let key_algorithm = KeyAlgorithm::Ecdsa(EcdsaCurve::Secp256r1);
        let (key_pair, pkcs8) = InMemorySigningKeyPair::generate_random(key_algorithm)?;

        let mut builder = X509CertificateBuilder::new(key_algorithm);
        builder
            .subject()
            .append_common_name_utf8_string(CSR_COMMON_NAME)
            .map_err(|e| ProvisioningError::CertificateBuild(format!("{:?}", e)))?;

        let csr = builder
            .create_certificate_signing_request(&key_pair)?
            .encode_pem()?;

        let doc: Document<Resource<CertificateAttributes>> = self.post(
            "certificates",
            &RequestDocument::<_, NoRelationships>::new(
                "certificates",
                CertificateCreateAttributes {
                    csr_content: csr,
                    certificate_type: class.api_type().to_string(),
                },
                None,
            ),
        )?;

        let mut cert = doc.data.into_certificate()?;
        cert.private_key_pkcs8 = Some(pkcs8.as_ref().to_vec());
        cert.has_private_key = true;

        info!("created certificate {}", cert);

        Ok(cert)
    }

    fn create_profile(
        &self,
        request: &ProfileRequest,
    ) -> Result<ProvisioningProfile, ProvisioningError> {
        let platform = request.profile_type.platform();

        let bundle_id_resource = self.ensure_bundle_id(&request.bundle_id, platform)?;

        if !request.bundle_id.contains('*') {
            self.sync_capabilities(&bundle_id_resource, &request.entitlements)?;
        }

        let devices = if request.profile_type.distribution_type().requires_device_list() {
            Some(ToMany {
                data: self
                    .device_ids(platform, &request.device_udids)?
                    .into_iter()
                    .map(|id| ResourceRef::new(id, "devices"))
                    .collect(),
            })
        } else {
            None
        };

        info!("creating profile {}", request.name);

        let doc: Document<Resource<ProfileAttributes>> = self.post(
            "profiles",
            &RequestDocument::new(
                "profiles",
                ProfileCreateAttributes {
                    name: request.name.clone(),
                    profile_type: request.profile_type,
                },
                Some(ProfileCreateRelationships {
                    bundle_id: ToOne {
                        data: ResourceRef::new(bundle_id_resource, "bundleIds"),
                    },
                    certificates: ToMany {
                        data: request
                            .certificate_ids
                            .iter()
                            .map(|id| ResourceRef::new(id, "certificates"))
                            .collect(),
                    },
                    devices: devices.filter(|d| !d.data.is_empty()),
                }),
            ),
        )?;

        doc.data.into_profile()
    }

    fn update_profile(
        &self,
        profile_id: &str,
        request: &ProfileRequest,
    ) -> Result<ProvisioningProfile, ProvisioningError> {
        // Profiles cannot be edited through the API. Regenerate under the same name.
        info!("regenerating profile {}", request.name);
        self.delete_profile(profile_id)?;
        self.create_profile(request)
    }

    fn register_device(&self, udid: &str, platform: Platform) -> Result<Device, ProvisioningError> {
        info!("registering device {}", udid);

        let doc: Document<Resource<DeviceAttributes>> = self.post(
            "devices",
            &RequestDocument::<_, NoRelationships>::new(
                "devices",
                DeviceAttributes {
                    udid: udid.to_string(),
                    name: udid.to_string(),
                    platform: Some(platform.api_platform().to_string()),
                    status: None,
                },
                None,
            ),
        )?;

        Ok(doc.data.into())
    }

    fn find_bundle_id(&self, identifier: &str) -> Result<Option<String>, ProvisioningError> {
        let existing = self.get_all::<BundleIdAttributes>(
            "bundleIds",
            &[
                ("filter[identifier]", identifier.to_string()),
                ("limit", PAGE_LIMIT.to_string()),
            ],
        )?;

        // The identifier filter matches prefixes.
        Ok(existing
            .into_iter()
            .find(|r| r.attributes.identifier == identifier)
            .map(|r| r.id))
    }

    fn list_certificates(
        &self,
        class: Option<CertificateClass>,
    ) -> Result<Vec<SigningCertificate>, ProvisioningError> {
        let mut query = vec![("limit", PAGE_LIMIT.to_string())];
        if let Some(class) = class {
            query.push(("filter[certificateType]", class.api_type().to_string()));
        }

        let mut res = vec![];
        for resource in self.get_all::<CertificateAttributes>("certificates", &query)? {
            let id = resource.id.clone();
            match resource.into_certificate() {
                Ok(cert) => res.push(cert),
                Err(e) => warn!("ignoring unreadable certificate {}: {}", id, e),
            }
        }

        debug!("found {} remote certificates", res.len());

        Ok(res)
    }

    fn list_profiles(
        &self,
        filter: &ProfileFilter,
    ) -> Result<Vec<ProvisioningProfile>, ProvisioningError> {
        let mut query = vec![("limit", PAGE_LIMIT.to_string())];
        if let Some(name) = &filter.name {
            query.push(("filter[name]", name.clone()));
        }
        if let Some(profile_type) = filter.profile_type {
            query.push(("filter[profileType]", profile_type.as_str().to_string()));
        }

        let mut res = vec![];
        for resource in self.get_all::<ProfileAttributes>("profiles", &query)? {
            let id = resource.id.clone();
            match resource.into_profile() {
                Ok(profile) => res.push(profile),
                Err(e) => warn!("ignoring unreadable profile {}: {}", id, e),
            }
        }

        debug!("found {} remote profiles", res.len());

        Ok(res)
    }

    fn list_devices(&self, platform: Platform) -> Result<Vec<Device>, ProvisioningError> {
        Ok(self
            .get_all::<DeviceAttributes>(
                "devices",
                &[
                    ("filter[platform]", platform.api_platform().to_string()),
                    ("limit", PAGE_LIMIT.to_string()),
                ],
            )?
            .into_iter()
            .map(Device::from)
            .collect())
    }

    fn delete_profile(&self, profile_id: &str) -> Result<(), ProvisioningError> {
        info!("deleting profile {}", profile_id);
        self.delete(&format!("profiles/{}", profile_id))
    }
}

#[cfg(test)]
mod tests {
    use {super::*, chrono::Duration as ChronoDuration};

    fn encoder() -> ConnectTokenEncoder {
        ConnectTokenEncoder::from_jwt_encoding_key(
            "DEADBEEF42".into(),
            "issuer".into(),
            jsonwebtoken::EncodingKey::from_secret(b"unused"),
        )
    }

    #[test]
    fn authenticator_kinds_and_roots() -> Result<(), ProvisioningError> {
        let auth = Authenticator::api_key(encoder());
        assert_eq!(auth.kind(), CredentialKind::ApiKey);
        assert_eq!(auth.base_url(), APP_STORE_CONNECT_API_URL);

        let auth = Authenticator::api_key(encoder().for_enterprise());
        assert_eq!(auth.base_url(), ENTERPRISE_API_URL);

        let session = SessionCredentials::from_json(
            r#"{"apple_id": "dev@example.com", "session_cookies": {
                "https://developer.apple.com": [{"name": "DSESSIONID", "value": "s1"}]
            }}"#,
        )?;
        let auth = Authenticator::session(session);
        assert_eq!(auth.kind(), CredentialKind::Session);
        assert_eq!(auth.base_url(), SESSION_API_URL);

        Ok(())
    }

    #[test]
    fn expired_sessions_refused() -> Result<(), ProvisioningError> {
        let mut session = SessionCredentials::from_json(
            r#"{"apple_id": "dev@example.com", "session_cookies": {
                "https://developer.apple.com": [{"name": "DSESSIONID", "value": "s1"}]
            }}"#,
        )?;
        session.connection_expiry_date = Some(Utc::now() - ChronoDuration::days(1));

        let client = DeveloperPortalClient::new(
            Authenticator::session(session),
            RetryPolicy::once(),
            DEFAULT_TIMEOUT,
        )?;

        // Authorization fails before anything is sent.
        assert!(matches!(
            client.list_devices(Platform::Ios),
            Err(ProvisioningError::Configuration(_))
        ));

        Ok(())
    }

    #[test]
    fn base_url_override() -> Result<(), ProvisioningError> {
        let client = DeveloperPortalClient::new(
            Authenticator::api_key(encoder()),
            RetryPolicy::default(),
            DEFAULT_TIMEOUT,
        )?
        .with_base_url("http://127.0.0.1:1/v1");

        assert_eq!(client.url("profiles"), "http://127.0.0.1:1/v1/profiles");
        assert_eq!(
            client.url("https://api.appstoreconnect.apple.com/v1/profiles?cursor=x"),
            "https://api.appstoreconnect.apple.com/v1/profiles?cursor=x"
        );
        assert_eq!(client.credential_kind(), CredentialKind::ApiKey);

        Ok(())
    }

    #[test]
    fn device_conversion() {
        let device = Device::from(Resource {
            id: "D1".into(),
            kind: "devices".into(),
            attributes: DeviceAttributes {
                udid: "00008030-001A".into(),
                name: "iPhone".into(),
                platform: Some("IOS".into()),
                status: Some("ENABLED".into()),
            },
        });

        assert_eq!(device.id, "D1");
        assert_eq!(device.udid, "00008030-001A");
        assert_eq!(device.status.as_deref(), Some("ENABLED"));
    }
}
