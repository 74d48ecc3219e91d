// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persisting code signing assets.

use {
    crate::{
        developer_portal::api_token::set_permissions_private, ProvisioningError,
        ProvisioningProfile, SigningCertificate,
    },
    duct::cmd,
    log::{debug, info, warn},
    std::{
        io::Write,
        path::{Path, PathBuf},
    },
};

/// Receives assets that should be available to the code signing tools.
pub trait AssetWriter {
    /// Make a certificate and its private key available for signing.
    fn install_certificate(&self, cert: &SigningCertificate) -> Result<(), ProvisioningError>;

    /// Install a provisioning profile.
    fn install_profile(&self, profile: &ProvisioningProfile) -> Result<(), ProvisioningError>;
}

/// A keychain certificates are imported into.
#[derive(Clone, Debug)]
pub struct Keychain {
    pub path: PathBuf,
    pub password: Option<String>,
}

/// Writes assets to the local machine.
///
/// Profiles are written to a profiles directory. Certificates are imported
/// into a keychain with `security`, or written as PEM files holding the
/// certificate and private key when no keychain is configured.
#[derive(Clone, Debug)]
pub struct FilesystemAssetWriter {
    profiles_dir: PathBuf,
    keychain: Option<Keychain>,
    certificate_dir: Option<PathBuf>,
}

fn write_error(asset: impl ToString, message: impl ToString) -> ProvisioningError {
    ProvisioningError::AssetWrite {
        asset: asset.to_string(),
        message: message.to_string(),
    }
}

/// Write a file readable only by its owner.
fn write_private_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut fh = std::fs::File::create(path)?;
    let mut permissions = fh.metadata()?.permissions();
    set_permissions_private(&mut permissions);
    fh.set_permissions(permissions)?;
    fh.write_all(data)?;

    Ok(())
}

impl FilesystemAssetWriter {
    pub fn new(profiles_dir: impl AsRef<Path>) -> Self {
        Self {
            profiles_dir: profiles_dir.as_ref().to_path_buf(),
            keychain: None,
            certificate_dir: None,
        }
    }

    pub fn with_keychain(mut self, keychain: Keychain) -> Self {
        self.keychain = Some(keychain);
        self
    }

    pub fn with_certificate_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.certificate_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn profiles_dir(&self) -> &Path {
        &self.profiles_dir
    }

    /// Path a certificate is written to when no keychain is configured.
    pub fn certificate_path(&self, cert: &SigningCertificate) -> Option<PathBuf> {
        self.certificate_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.pem", cert.serial())))
    }

    fn import_into_keychain(
        &self,
        keychain: &Keychain,
        cert: &SigningCertificate,
        pem: &str,
    ) -> Result<(), ProvisioningError> {
        let security = which::which("security")
            .map_err(|e| write_error(cert, format!("unable to find security: {}", e)))?;

        let td = tempfile::tempdir()?;
        let pem_path = td.path().join("identity.pem");
        write_private_file(&pem_path, pem.as_bytes())?;

        let keychain_path = keychain.path.to_string_lossy().to_string();

        if let Some(password) = &keychain.password {
            debug!("unlocking keychain {}", keychain.path.display());
            cmd(
                &security,
                vec![
                    "unlock-keychain".to_string(),
                    "-p".to_string(),
                    password.clone(),
                    keychain_path.clone(),
                ],
            )
            .stdout_null()
            .stderr_capture()
            .run()
            .map_err(|e| write_error(cert, format!("unable to unlock keychain: {}", e)))?;
        }

        info!("importing {} into {}", cert, keychain.path.display());
        cmd(
            &security,
            vec![
                "import".to_string(),
                pem_path.to_string_lossy().to_string(),
                "-k".to_string(),
                keychain_path,
                "-T".to_string(),
                "/usr/bin/codesign".to_string(),
                "-T".to_string(),
                "/usr/bin/security".to_string(),
            ],
        )
        .stdout_null()
        .stderr_capture()
        .run()
        .map_err(|e| write_error(cert, format!("security import failed: {}", e)))?;

        Ok(())
    }
}

impl AssetWriter for FilesystemAssetWriter {
    fn install_certificate(&self, cert: &SigningCertificate) -> Result<(), ProvisioningError> {
        // Without key material the certificate came from an existing identity.
        let key_pem = match cert.private_key_pem() {
            Some(pem) => pem,
            None => {
                debug!("{} holds no new key material; nothing to install", cert);
                return Ok(());
            }
        };

        let cert_pem = cert
            .certificate_pem()
            .ok_or_else(|| write_error(cert, "certificate content is not available"))?;

        let pem = format!("{}{}", cert_pem, key_pem);

        if let Some(keychain) = &self.keychain {
            return self.import_into_keychain(keychain, cert, &pem);
        }

        let path = self
            .certificate_path(cert)
            .ok_or_else(|| write_error(cert, "no keychain or certificate directory configured"))?;

        if path.exists() {
            warn!("replacing {}", path.display());
        }

        info!("writing {} to {}", cert, path.display());
        write_private_file(&path, pem.as_bytes()).map_err(|e| write_error(cert, e))
    }

    fn install_profile(&self, profile: &ProvisioningProfile) -> Result<(), ProvisioningError> {
        let content = profile
            .content
            .as_ref()
            .ok_or_else(|| write_error(profile, "profile content is not available"))?;

        let path = self.profiles_dir.join(profile.file_name());

        if let Ok(existing) = std::fs::read(&path) {
            if &existing == content {
                debug!("{} is already installed", profile);
                return Ok(());
            }
        }

        info!("installing {} to {}", profile, path.display());
        write_private_file(&path, content).map_err(|e| write_error(profile, e))
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{CertificateClass, DistributionType, Platform},
        chrono::{Duration, Utc},
    };

    fn profile(content: Option<&[u8]>) -> ProvisioningProfile {
        let mut p = ProvisioningProfile::new(
            "5A0E1C2D-0000-4000-8000-000000000001",
            "rprovision iOS development - (com.acme.app)",
            "com.acme.app",
            Platform::Ios,
            DistributionType::Development,
            Utc::now() + Duration::days(100),
        );
        p.content = content.map(|c| c.to_vec());
        p
    }

    #[test]
    fn profiles_written_by_uuid() -> Result<(), ProvisioningError> {
        let td = tempfile::tempdir()?;
        let writer = FilesystemAssetWriter::new(td.path().join("profiles"));

        writer.install_profile(&profile(Some(b"profile data")))?;
        // Reinstalling identical content is a no-op.
        writer.install_profile(&profile(Some(b"profile data")))?;

        let path = writer
            .profiles_dir()
            .join("5A0E1C2D-0000-4000-8000-000000000001.mobileprovision");
        assert_eq!(std::fs::read(&path)?, b"profile data");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(std::fs::metadata(&path)?.permissions().mode() & 0o777, 0o600);
        }

        Ok(())
    }

    #[test]
    fn profiles_without_content_rejected() -> Result<(), ProvisioningError> {
        let td = tempfile::tempdir()?;
        let writer = FilesystemAssetWriter::new(td.path());

        assert!(matches!(
            writer.install_profile(&profile(None)),
            Err(ProvisioningError::AssetWrite { .. })
        ));

        Ok(())
    }

    #[test]
    fn certificates_need_a_destination() -> Result<(), ProvisioningError> {
        let td = tempfile::tempdir()?;

        let mut cert = SigningCertificate::new(
            "0A1B",
            "Apple Development: Acme",
            CertificateClass::Development,
            Utc::now() + Duration::days(300),
        );

        // Nothing to do for certificates without new key material.
        FilesystemAssetWriter::new(td.path()).install_certificate(&cert)?;

        cert.der = Some(vec![0x30, 0x00]);
        cert.private_key_pkcs8 = Some(vec![0x30, 0x01, 0x00]);

        assert!(matches!(
            FilesystemAssetWriter::new(td.path()).install_certificate(&cert),
            Err(ProvisioningError::AssetWrite { .. })
        ));

        let writer =
            FilesystemAssetWriter::new(td.path()).with_certificate_dir(td.path().join("certs"));
        writer.install_certificate(&cert)?;

        let written = std::fs::read_to_string(td.path().join("certs").join("A1B.pem"))?;
        assert!(written.contains("BEGIN CERTIFICATE"));
        assert!(written.contains("BEGIN PRIVATE KEY"));

        Ok(())
    }
}
