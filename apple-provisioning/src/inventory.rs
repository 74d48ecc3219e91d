// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Known certificates and provisioning profiles.

An [AssetInventory] is populated from one or more [AssetSource]s. Records
describing the same certificate (by serial) or profile (by UUID) are merged,
so a local PEM file and a remote listing of the same certificate become one
entry that both holds a private key and knows its remote id.
*/

use {
    crate::{
        certificate::filter_valid_certificates, CertificateClass, ProvisioningError,
        ProvisioningProfile, SigningCertificate,
    },
    chrono::{DateTime, Utc},
    log::{debug, warn},
    std::{
        collections::BTreeMap,
        path::{Path, PathBuf},
    },
};

/// Something that can enumerate code signing assets.
pub trait AssetSource {
    fn list_certificates(&self) -> Result<Vec<SigningCertificate>, ProvisioningError>;

    fn list_profiles(&self) -> Result<Vec<ProvisioningProfile>, ProvisioningError>;
}

/// Assets on the local filesystem.
///
/// Profiles are read from a directory of installed profiles. Certificates are
/// read from PEM files, which should also hold the private key.
#[derive(Clone, Debug, Default)]
pub struct LocalAssetSource {
    profiles_dir: Option<PathBuf>,
    certificate_paths: Vec<PathBuf>,
}

impl LocalAssetSource {
    pub fn new(profiles_dir: Option<PathBuf>) -> Self {
        Self {
            profiles_dir,
            certificate_paths: vec![],
        }
    }

    /// The directory Xcode installs provisioning profiles into.
    pub fn default_profiles_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|home| {
            home.join("Library")
                .join("MobileDevice")
                .join("Provisioning Profiles")
        })
    }

    pub fn profiles_dir(&self) -> Option<&Path> {
        self.profiles_dir.as_deref()
    }

    pub fn add_certificate_path(&mut self, path: impl AsRef<Path>) {
        self.certificate_paths.push(path.as_ref().to_path_buf());
    }

    /// Add every `.pem` file in a directory. A missing directory adds nothing.
    pub fn add_certificate_dir(&mut self, dir: impl AsRef<Path>) -> Result<(), ProvisioningError> {
        let dir = dir.as_ref();

        if !dir.exists() {
            return Ok(());
        }

        let mut paths = std::fs::read_dir(dir)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<Vec<_>, _>>()?;
        paths.sort();

        self.certificate_paths.extend(
            paths
                .into_iter()
                .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("pem")),
        );

        Ok(())
    }
}

impl AssetSource for LocalAssetSource {
    /// Certificates read from the PEM files, without expired or duplicated ones.
    fn list_certificates(&self) -> Result<Vec<SigningCertificate>, ProvisioningError> {
        let certs = self
            .certificate_paths
            .iter()
            .map(|path| {
                debug!("reading certificate from {}", path.display());
                SigningCertificate::from_pem_path(path)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(filter_valid_certificates(certs, Utc::now()).valid)
    }

    fn list_profiles(&self) -> Result<Vec<ProvisioningProfile>, ProvisioningError> {
        let dir = match &self.profiles_dir {
            Some(dir) => dir,
            None => return Ok(vec![]),
        };

        if !dir.exists() {
            debug!("profiles directory {} does not exist", dir.display());
            return Ok(vec![]);
        }

        let mut paths = std::fs::read_dir(dir)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<Vec<_>, _>>()?;
        paths.sort();

        let mut res = vec![];

        for path in paths {
            let is_profile = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("mobileprovision") | Some("provisionprofile")
            );
            if !is_profile {
                continue;
            }

            match ProvisioningProfile::from_path(&path) {
                Ok(profile) => {
                    debug!("found profile {} at {}", profile, path.display());
                    res.push(profile);
                }
                Err(e) => {
                    warn!("ignoring unreadable profile {}: {}", path.display(), e);
                }
            }
        }

        Ok(res)
    }
}

/// The certificates and profiles currently known.
#[derive(Clone, Debug, Default)]
pub struct AssetInventory {
    certificates: BTreeMap<String, SigningCertificate>,
    profiles: BTreeMap<String, ProvisioningProfile>,
}

impl AssetInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct an instance holding everything a source lists.
    pub fn from_source(source: &dyn AssetSource) -> Result<Self, ProvisioningError> {
        let mut res = Self::new();
        res.merge_source(source)?;

        Ok(res)
    }

    /// Add everything a source lists to this inventory.
    pub fn merge_source(&mut self, source: &dyn AssetSource) -> Result<(), ProvisioningError> {
        for cert in source.list_certificates()? {
            self.add_certificate(cert);
        }
        for profile in source.list_profiles()? {
            self.add_profile(profile);
        }

        Ok(())
    }

    /// Add a certificate, merging with an existing record of the same serial.
    pub fn add_certificate(&mut self, cert: SigningCertificate) {
        match self.certificates.get_mut(cert.serial()) {
            Some(existing) => existing.merge(&cert),
            None => {
                self.certificates.insert(cert.serial().to_string(), cert);
            }
        }
    }

    /// Add a profile, replacing an existing record of the same UUID.
    ///
    /// Installable content and remote id of the replaced record are retained
    /// if the new record lacks them.
    pub fn add_profile(&mut self, mut profile: ProvisioningProfile) {
        if let Some(existing) = self.profiles.remove(&profile.uuid) {
            if profile.content.is_none() {
                profile.content = existing.content;
            }
            if profile.remote_id.is_none() {
                profile.remote_id = existing.remote_id;
            }
        }

        self.profiles.insert(profile.uuid.clone(), profile);
    }

    pub fn remove_profile(&mut self, uuid: &str) -> Option<ProvisioningProfile> {
        self.profiles.remove(uuid)
    }

    /// All certificates, in serial order.
    pub fn certificates(&self) -> impl Iterator<Item = &SigningCertificate> {
        self.certificates.values()
    }

    /// All profiles, in UUID order.
    pub fn profiles(&self) -> impl Iterator<Item = &ProvisioningProfile> {
        self.profiles.values()
    }

    pub fn certificate(&self, serial: &str) -> Option<&SigningCertificate> {
        self.certificates
            .get(crate::certificate::normalize_serial(serial).as_str())
    }

    pub fn profile(&self, uuid: &str) -> Option<&ProvisioningProfile> {
        self.profiles.get(uuid)
    }

    /// Certificates whose private key is held.
    pub fn possessed_certificates(&self) -> impl Iterator<Item = &SigningCertificate> {
        self.certificates().filter(|c| c.has_private_key)
    }

    /// Possessed certificates of a class that have not expired.
    pub fn usable_certificates(
        &self,
        class: CertificateClass,
        now: DateTime<Utc>,
    ) -> Vec<&SigningCertificate> {
        self.possessed_certificates()
            .filter(|c| c.class == class && c.is_valid_at(now))
            .collect()
    }

    /// Profiles embedding a certificate, in UUID order.
    pub fn profiles_embedding(
        &self,
        serial: &str,
    ) -> impl Iterator<Item = &ProvisioningProfile> + '_ {
        let serial = crate::certificate::normalize_serial(serial);
        self.profiles().filter(move |p| p.embeds_certificate(&serial))
    }

    /// Profiles having a given name, in UUID order.
    pub fn profiles_named(&self, name: &str) -> impl Iterator<Item = &ProvisioningProfile> + '_ {
        let name = name.to_string();
        self.profiles().filter(move |p| p.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty() && self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{DistributionType, Platform},
        chrono::Duration,
    };

    struct StaticSource {
        certs: Vec<SigningCertificate>,
        profiles: Vec<ProvisioningProfile>,
    }

    impl AssetSource for StaticSource {
        fn list_certificates(&self) -> Result<Vec<SigningCertificate>, ProvisioningError> {
            Ok(self.certs.clone())
        }

        fn list_profiles(&self) -> Result<Vec<ProvisioningProfile>, ProvisioningError> {
            Ok(self.profiles.clone())
        }
    }

    #[test]
    fn merges_by_identity() -> Result<(), ProvisioningError> {
        let now = Utc::now();

        let mut local_cert = SigningCertificate::new(
            "0A",
            "Apple Development: A",
            CertificateClass::Development,
            now + Duration::days(100),
        );
        local_cert.has_private_key = true;

        let mut remote_cert = local_cert.clone();
        remote_cert.has_private_key = false;
        remote_cert.remote_id = Some("CERT1".into());

        let mut local_profile = ProvisioningProfile::new(
            "uuid-1",
            "p",
            "com.acme.app",
            Platform::Ios,
            DistributionType::Development,
            now + Duration::days(100),
        );
        local_profile.content = Some(vec![1, 2, 3]);
        local_profile.certificate_serials = vec!["A".into()];

        let mut remote_profile = local_profile.clone();
        remote_profile.content = None;
        remote_profile.remote_id = Some("PROF1".into());

        let mut inventory = AssetInventory::from_source(&StaticSource {
            certs: vec![local_cert],
            profiles: vec![local_profile],
        })?;
        inventory.merge_source(&StaticSource {
            certs: vec![remote_cert],
            profiles: vec![remote_profile],
        })?;

        assert_eq!(inventory.certificates().count(), 1);
        let cert = inventory.certificate("000a").unwrap();
        assert!(cert.has_private_key);
        assert_eq!(cert.remote_id.as_deref(), Some("CERT1"));
        assert_eq!(
            inventory
                .usable_certificates(CertificateClass::Development, now)
                .len(),
            1
        );

        let profile = inventory.profile("uuid-1").unwrap();
        assert_eq!(profile.content.as_deref(), Some(&[1u8, 2, 3][..]));
        assert_eq!(profile.remote_id.as_deref(), Some("PROF1"));
        assert_eq!(inventory.profiles_embedding("0A").count(), 1);
        assert_eq!(inventory.profiles_named("p").count(), 1);

        Ok(())
    }

    #[test]
    fn local_source_skips_unreadable_profiles() -> Result<(), ProvisioningError> {
        let td = tempfile::tempdir()?;
        std::fs::write(td.path().join("bad.mobileprovision"), b"not a profile")?;
        std::fs::write(td.path().join("notes.txt"), b"ignored")?;

        let source = LocalAssetSource::new(Some(td.path().to_path_buf()));
        assert!(source.list_profiles()?.is_empty());

        let missing = LocalAssetSource::new(Some(td.path().join("missing")));
        assert!(missing.list_profiles()?.is_empty());

        Ok(())
    }
}
