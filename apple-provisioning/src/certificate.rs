// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Code signing certificates as seen by asset resolution.

use {
    crate::{CertificateClass, ProvisioningError},
    bcder::Oid,
    chrono::{DateTime, Utc},
    log::{debug, warn},
    once_cell::sync::Lazy,
    regex::Regex,
    serde::{Deserialize, Serialize},
    std::{collections::BTreeMap, path::Path},
    x509_certificate::{
        asn1time::Time, rfc4519, rfc5280, CapturedX509Certificate, X509Certificate,
    },
};

static PEM_BLOCK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)-----BEGIN [A-Z0-9 ]+-----.*?-----END [A-Z0-9 ]+-----")
        .expect("PEM block regex should compile")
});

/// Normalize a certificate serial number for comparisons.
///
/// Serials are compared as uppercase hex without leading zeros, which is how
/// both DER integers and remote listings can be brought to agreement.
pub fn normalize_serial(serial: &str) -> String {
    let trimmed = serial
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches('0')
        .to_uppercase();

    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed
    }
}

/// A code signing certificate.
///
/// The serial number is the identity of a certificate.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SigningCertificate {
    serial: String,
    pub common_name: String,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub team_name: Option<String>,
    pub class: CertificateClass,
    pub expires: DateTime<Utc>,
    /// Whether we hold the private key and can sign with this certificate.
    #[serde(default)]
    pub has_private_key: bool,
    /// Identifier of the certificate resource on the remote authority.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    /// DER encoded certificate.
    #[serde(skip)]
    pub der: Option<Vec<u8>>,
    /// PKCS#8 DER encoded private key.
    #[serde(skip)]
    pub private_key_pkcs8: Option<Vec<u8>>,
}

impl PartialEq for SigningCertificate {
    fn eq(&self, other: &Self) -> bool {
        self.serial == other.serial
    }
}

impl Eq for SigningCertificate {}

impl SigningCertificate {
    /// Construct an instance from metadata alone.
    pub fn new(
        serial: impl AsRef<str>,
        common_name: impl ToString,
        class: CertificateClass,
        expires: DateTime<Utc>,
    ) -> Self {
        Self {
            serial: normalize_serial(serial.as_ref()),
            common_name: common_name.to_string(),
            team_id: None,
            team_name: None,
            class,
            expires,
            has_private_key: false,
            remote_id: None,
            der: None,
            private_key_pkcs8: None,
        }
    }

    /// Construct an instance by parsing a DER encoded X.509 certificate.
    pub fn from_der(der: impl Into<Vec<u8>>) -> Result<Self, ProvisioningError> {
        let cert = CapturedX509Certificate::from_der(der)?;

        let common_name = cert
            .subject_common_name()
            .ok_or(ProvisioningError::CertificateNoCommonName)?;

        let serial = hex::encode_upper(cert.serial_number_asn1().as_slice());

        let subject = cert.subject_name();
        let team_id = subject
            .find_first_attribute_string(Oid(rfc4519::OID_ORGANIZATIONAL_UNIT_NAME
                .as_ref()
                .into()))
            .unwrap_or(None);
        let team_name = subject
            .find_first_attribute_string(Oid(rfc4519::OID_ORGANIZATION_NAME.as_ref().into()))
            .unwrap_or(None);

        let x509: &X509Certificate = cert.as_ref();
        let inner: &rfc5280::Certificate = x509.as_ref();
        let expires = match &inner.tbs_certificate.validity.not_after {
            Time::UtcTime(t) => **t,
            Time::GeneralTime(t) => t.clone().into(),
        };

        let mut res = Self::new(
            serial,
            &common_name,
            CertificateClass::from_common_name(&common_name),
            expires,
        );
        res.team_id = team_id;
        res.team_name = team_name;
        res.der = Some(cert.constructed_data().to_vec());

        Ok(res)
    }

    /// Construct an instance from PEM data holding a certificate and optionally its key.
    ///
    /// The first `CERTIFICATE` block is used. A `PRIVATE KEY` block marks the
    /// certificate as usable for signing.
    pub fn from_pem(data: impl AsRef<[u8]>) -> Result<Self, ProvisioningError> {
        let mut cert = None;
        let mut key = None;

        let text = String::from_utf8_lossy(data.as_ref());

        for m in PEM_BLOCK_RE.find_iter(&text) {
            let block = pem::parse(m.as_str())?;

            match block.tag.as_str() {
                "CERTIFICATE" if cert.is_none() => cert = Some(block.contents),
                "PRIVATE KEY" if key.is_none() => key = Some(block.contents),
                tag => debug!("ignoring PEM block {}", tag),
            }
        }

        let mut res = Self::from_der(cert.ok_or_else(|| {
            ProvisioningError::Configuration("PEM data does not contain a CERTIFICATE".into())
        })?)?;

        if let Some(key) = key {
            res.has_private_key = true;
            res.private_key_pkcs8 = Some(key);
        }

        Ok(res)
    }

    /// Construct an instance from a PEM file.
    pub fn from_pem_path(path: impl AsRef<Path>) -> Result<Self, ProvisioningError> {
        let data = std::fs::read(path.as_ref())?;

        Self::from_pem(data)
    }

    /// The normalized serial number.
    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires
    }

    /// PEM encoding of the certificate, if DER data is held.
    pub fn certificate_pem(&self) -> Option<String> {
        self.der.as_ref().map(|der| {
            pem::encode(&pem::Pem {
                tag: "CERTIFICATE".to_string(),
                contents: der.clone(),
            })
        })
    }

    /// PEM encoding of the private key, if held.
    pub fn private_key_pem(&self) -> Option<String> {
        self.private_key_pkcs8.as_ref().map(|key| {
            pem::encode(&pem::Pem {
                tag: "PRIVATE KEY".to_string(),
                contents: key.clone(),
            })
        })
    }

    /// Fold information from another record of the same certificate into this one.
    ///
    /// Used when a remote listing describes a certificate also held locally.
    pub fn merge(&mut self, other: &SigningCertificate) {
        self.has_private_key |= other.has_private_key;
        if self.remote_id.is_none() {
            self.remote_id = other.remote_id.clone();
        }
        if self.team_id.is_none() {
            self.team_id = other.team_id.clone();
        }
        if self.team_name.is_none() {
            self.team_name = other.team_name.clone();
        }
        if self.der.is_none() {
            self.der = other.der.clone();
        }
        if self.private_key_pkcs8.is_none() {
            self.private_key_pkcs8 = other.private_key_pkcs8.clone();
        }
    }
}

impl std::fmt::Display for SigningCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]", self.common_name, self.serial)
    }
}

/// Result of [filter_valid_certificates].
#[derive(Debug, Default)]
pub struct FilteredCertificates {
    pub valid: Vec<SigningCertificate>,
    pub expired: Vec<SigningCertificate>,
    pub duplicated: Vec<SigningCertificate>,
}

/// Drop expired certificates and certificates sharing a common name.
///
/// Of several certificates with the same common name, the one expiring last
/// is kept. Output is ordered by common name.
pub fn filter_valid_certificates(
    certs: impl IntoIterator<Item = SigningCertificate>,
    now: DateTime<Utc>,
) -> FilteredCertificates {
    let mut res = FilteredCertificates::default();
    let mut by_name = BTreeMap::<String, SigningCertificate>::new();

    for cert in certs {
        if !cert.is_valid_at(now) {
            warn!("ignoring expired certificate: {}", cert);
            res.expired.push(cert);
            continue;
        }

        match by_name.remove(&cert.common_name) {
            Some(existing) if existing.expires >= cert.expires => {
                warn!("ignoring duplicated certificate: {}", cert);
                res.duplicated.push(cert);
                by_name.insert(existing.common_name.clone(), existing);
            }
            Some(existing) => {
                warn!("ignoring duplicated certificate: {}", existing);
                res.duplicated.push(existing);
                by_name.insert(cert.common_name.clone(), cert);
            }
            None => {
                by_name.insert(cert.common_name.clone(), cert);
            }
        }
    }

    res.valid = by_name.into_values().collect();

    res
}
