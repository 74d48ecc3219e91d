// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The application being signed.

A [Project] describes the buildable targets of an application and receives
the code signing assets chosen for them. [ProjectDescriptor] implements it
over a JSON document:

```json
{
  "team_id": "ABCDE12345",
  "platform": "iOS",
  "automatic_signing": false,
  "targets": [
    {
      "name": "App",
      "bundle_id": "com.acme.app",
      "entitlements": {"aps-environment": "production"}
    },
    {
      "name": "AppUITests",
      "bundle_id": "com.acme.app.uitests",
      "ui_test": true
    }
  ]
}
```
*/

use {
    crate::{
        DistributionType, Entitlements, Platform, ProvisioningError, ProvisioningProfile,
        SigningCertificate,
    },
    log::info,
    serde::{Deserialize, Serialize},
    std::{
        collections::BTreeMap,
        path::{Path, PathBuf},
    },
};

/// Targets needing code signing assets.
#[derive(Clone, Debug, PartialEq)]
pub struct AppLayout {
    pub team_id: Option<String>,
    pub platform: Platform,
    /// Entitlements of each archivable target, keyed by bundle id.
    pub entitlements_by_bundle_id: BTreeMap<String, Entitlements>,
    pub ui_test_target_bundle_ids: Vec<String>,
}

impl AppLayout {
    pub fn new(platform: Platform) -> Self {
        Self {
            team_id: None,
            platform,
            entitlements_by_bundle_id: BTreeMap::new(),
            ui_test_target_bundle_ids: vec![],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entitlements_by_bundle_id.is_empty() && self.ui_test_target_bundle_ids.is_empty()
    }
}

/// A certificate and the profiles assigned to each target.
#[derive(Clone, Debug)]
pub struct CodesignAssets {
    pub certificate: SigningCertificate,
    pub archivable_target_profiles: BTreeMap<String, ProvisioningProfile>,
    pub ui_test_target_profiles: BTreeMap<String, ProvisioningProfile>,
}

impl CodesignAssets {
    /// Every assigned profile, without duplicates, in UUID order.
    pub fn unique_profiles(&self) -> Vec<&ProvisioningProfile> {
        self.archivable_target_profiles
            .values()
            .chain(self.ui_test_target_profiles.values())
            .map(|p| (p.uuid.as_str(), p))
            .collect::<BTreeMap<_, _>>()
            .into_values()
            .collect()
    }

    pub fn profile_for(&self, bundle_id: &str) -> Option<&ProvisioningProfile> {
        self.archivable_target_profiles
            .get(bundle_id)
            .or_else(|| self.ui_test_target_profiles.get(bundle_id))
    }
}

/// An application whose targets are signed.
pub trait Project {
    /// Whether Xcode's automatic signing is enabled.
    fn is_signing_managed_automatically(&self) -> Result<bool, ProvisioningError>;

    fn platform(&self) -> Result<Platform, ProvisioningError>;

    /// Obtain the targets needing assets.
    fn app_layout(&self, include_ui_tests: bool) -> Result<AppLayout, ProvisioningError>;

    /// Record the assets to sign targets with, disabling automatic signing.
    fn force_codesign_assets(
        &mut self,
        distribution_type: DistributionType,
        assets: &CodesignAssets,
    ) -> Result<(), ProvisioningError>;
}

/// Signing settings forced onto a target.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ForcedSigning {
    pub distribution_type: DistributionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    pub certificate_common_name: String,
    pub certificate_serial: String,
    pub profile_uuid: String,
    pub profile_name: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TargetDescriptor {
    pub name: String,
    pub bundle_id: String,
    #[serde(default)]
    pub entitlements: Entitlements,
    #[serde(default)]
    pub ui_test: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing: Option<ForcedSigning>,
}

/// A JSON project description.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProjectDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    pub platform: Platform,
    #[serde(default)]
    pub automatic_signing: bool,
    pub targets: Vec<TargetDescriptor>,

    #[serde(skip)]
    path: Option<PathBuf>,
}

impl ProjectDescriptor {
    pub fn from_json_str(s: &str) -> Result<Self, ProvisioningError> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ProvisioningError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)?;

        let mut res = Self::from_json_str(&data)?;
        res.path = Some(path.to_path_buf());

        Ok(res)
    }

    /// File this descriptor was read from and is saved to.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn save(&self) -> Result<(), ProvisioningError> {
        if let Some(path) = &self.path {
            let mut data = serde_json::to_string_pretty(self)?;
            data.push('\n');
            std::fs::write(path, data)?;
        }

        Ok(())
    }
}

impl Project for ProjectDescriptor {
    fn is_signing_managed_automatically(&self) -> Result<bool, ProvisioningError> {
        Ok(self.automatic_signing)
    }

    fn platform(&self) -> Result<Platform, ProvisioningError> {
        Ok(self.platform)
    }

    fn app_layout(&self, include_ui_tests: bool) -> Result<AppLayout, ProvisioningError> {
        let mut layout = AppLayout::new(self.platform);
        layout.team_id = self.team_id.clone();

        for target in &self.targets {
            if target.ui_test {
                if include_ui_tests {
                    layout.ui_test_target_bundle_ids.push(target.bundle_id.clone());
                }
            } else if layout
                .entitlements_by_bundle_id
                .insert(target.bundle_id.clone(), target.entitlements.clone())
                .is_some()
            {
                return Err(ProvisioningError::Configuration(format!(
                    "bundle identifier {} is used by more than one target",
                    target.bundle_id
                )));
            }
        }

        Ok(layout)
    }

    fn force_codesign_assets(
        &mut self,
        distribution_type: DistributionType,
        assets: &CodesignAssets,
    ) -> Result<(), ProvisioningError> {
        let team_id = assets
            .certificate
            .team_id
            .clone()
            .or_else(|| self.team_id.clone());

        for target in self.targets.iter_mut() {
            let profile = match assets.profile_for(&target.bundle_id) {
                Some(profile) => profile,
                // UI test targets are only signed for development.
                None if target.ui_test => continue,
                None => {
                    return Err(ProvisioningError::InvariantViolation(format!(
                        "no profile resolved for target {}",
                        target.name
                    )))
                }
            };

            info!(
                "forcing {} to sign with {} and profile {}",
                target.name, assets.certificate, profile
            );

            target.signing = Some(ForcedSigning {
                distribution_type,
                team_id: team_id.clone(),
                certificate_common_name: assets.certificate.common_name.clone(),
                certificate_serial: assets.certificate.serial().to_string(),
                profile_uuid: profile.uuid.clone(),
                profile_name: profile.name.clone(),
            });
        }

        self.automatic_signing = false;
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::CertificateClass,
        chrono::{Duration, Utc},
        indoc::indoc,
    };

    const DESCRIPTOR: &str = indoc! {r#"
        {
          "team_id": "ABCDE12345",
          "platform": "iOS",
          "automatic_signing": true,
          "targets": [
            {
              "name": "App",
              "bundle_id": "com.acme.app",
              "entitlements": {"aps-environment": "production"}
            },
            {
              "name": "AppUITests",
              "bundle_id": "com.acme.app.uitests",
              "ui_test": true
            }
          ]
        }
    "#};

    #[test]
    fn layout_from_descriptor() -> Result<(), ProvisioningError> {
        let project = ProjectDescriptor::from_json_str(DESCRIPTOR)?;

        assert!(project.is_signing_managed_automatically()?);
        assert_eq!(project.platform()?, Platform::Ios);

        let layout = project.app_layout(true)?;
        assert_eq!(layout.team_id.as_deref(), Some("ABCDE12345"));
        assert_eq!(
            layout.entitlements_by_bundle_id.keys().collect::<Vec<_>>(),
            vec!["com.acme.app"]
        );
        assert_eq!(layout.ui_test_target_bundle_ids, vec!["com.acme.app.uitests"]);

        assert!(project.app_layout(false)?.ui_test_target_bundle_ids.is_empty());

        Ok(())
    }

    #[test]
    fn force_assets_and_save() -> Result<(), ProvisioningError> {
        let td = tempfile::tempdir()?;
        let path = td.path().join("project.json");
        std::fs::write(&path, DESCRIPTOR)?;

        let mut project = ProjectDescriptor::from_path(&path)?;

        let certificate = SigningCertificate::new(
            "0A",
            "Apple Distribution: Acme",
            CertificateClass::Distribution,
            Utc::now() + Duration::days(100),
        );
        let profile = ProvisioningProfile::new(
            "uuid-1",
            "rprovision iOS app-store - (com.acme.app)",
            "com.acme.app",
            Platform::Ios,
            DistributionType::AppStore,
            Utc::now() + Duration::days(100),
        );

        let assets = CodesignAssets {
            certificate,
            archivable_target_profiles: vec![("com.acme.app".to_string(), profile)]
                .into_iter()
                .collect(),
            ui_test_target_profiles: BTreeMap::new(),
        };

        project.force_codesign_assets(DistributionType::AppStore, &assets)?;

        let reloaded = ProjectDescriptor::from_path(&path)?;
        assert!(!reloaded.automatic_signing);
        let signing = reloaded.targets[0].signing.as_ref().unwrap();
        assert_eq!(signing.profile_uuid, "uuid-1");
        assert_eq!(signing.certificate_serial, "A");
        assert_eq!(signing.team_id.as_deref(), Some("ABCDE12345"));
        assert!(reloaded.targets[1].signing.is_none());

        Ok(())
    }

    #[test]
    fn duplicate_bundle_ids_rejected() -> Result<(), ProvisioningError> {
        let project = ProjectDescriptor::from_json_str(
            r#"{"platform": "iOS", "targets": [
                {"name": "A", "bundle_id": "com.acme.app"},
                {"name": "B", "bundle_id": "com.acme.app"}
            ]}"#,
        )?;

        assert!(matches!(
            project.app_layout(false),
            Err(ProvisioningError::Configuration(_))
        ));

        Ok(())
    }
}
