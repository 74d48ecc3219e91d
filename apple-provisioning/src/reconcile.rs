// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Ensuring code signing assets exist.

[ReconciliationEngine::ensure_assets] resolves an app layout against local
assets first. Only when that fails is the remote authority consulted: its
certificates and profiles are merged in, and whatever is still missing is
created. Created resources are named deterministically so a later run finds
and reuses them instead of creating duplicates.
*/

use {
    crate::{
        managed_profile_name, normalize_udid, profile::wildcard_bundle_id, AppLayout,
        AssetInventory, AssetSource, AssetWriter, CodesignAssets, CompatibilityMatcher,
        Entitlements, GroupResolver, Mismatch, Platform, ProfileFilter, ProfileRequest,
        ProfileRequirements, ProfileType, ProvisioningError, RemoteAssetSource,
        RemoteProvisioningClient, ResolveOptions, SigningCertificate, UnresolvedTargets,
    },
    chrono::{DateTime, Utc},
    log::{debug, info, warn},
    std::collections::{BTreeMap, BTreeSet},
};

/// A profile the remote authority should hold for residual targets.
struct ProfileSpec {
    bundle_id: String,
    entitlements: Entitlements,
}

/// Resolves assets for an app and creates whatever is missing.
pub struct ReconciliationEngine<'a> {
    local: &'a dyn AssetSource,
    remote: Option<&'a dyn RemoteProvisioningClient>,
    writer: &'a dyn AssetWriter,
    now: DateTime<Utc>,
}

impl<'a> ReconciliationEngine<'a> {
    pub fn new(local: &'a dyn AssetSource, writer: &'a dyn AssetWriter) -> Self {
        Self {
            local,
            remote: None,
            writer,
            now: Utc::now(),
        }
    }

    /// Allow creating missing assets through a remote authority.
    pub fn with_remote(mut self, remote: &'a dyn RemoteProvisioningClient) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Evaluate validity windows at a fixed time.
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    fn resolve(
        &self,
        inventory: &AssetInventory,
        layout: &AppLayout,
        options: &ResolveOptions,
        include_ui_tests: bool,
    ) -> Result<Result<CodesignAssets, UnresolvedTargets>, ProvisioningError> {
        GroupResolver::new(inventory, CompatibilityMatcher::new(self.now)).resolve_assets(
            layout,
            options,
            include_ui_tests,
        )
    }

    /// Obtain a certificate and profiles covering every target of a layout.
    ///
    /// Nothing is reported as resolved until the assets are persisted.
    pub fn ensure_assets(
        &self,
        layout: &AppLayout,
        options: &ResolveOptions,
        include_ui_tests: bool,
    ) -> Result<CodesignAssets, ProvisioningError> {
        let mut inventory = AssetInventory::from_source(self.local)?;

        let unresolved = match self.resolve(&inventory, layout, options, include_ui_tests)? {
            Ok(assets) => {
                info!("local assets cover every target");
                self.persist(&assets, None)?;
                return Ok(assets);
            }
            Err(unresolved) => unresolved,
        };

        if unresolved.is_empty() {
            return Err(ProvisioningError::NoSigningCertificate(
                options.distribution_type.certificate_class().as_str().to_string(),
            ));
        }

        info!(
            "local assets do not cover {}",
            unresolved.all_bundle_ids().join(", ")
        );

        check_supported(layout, &unresolved)?;

        let remote = match self.remote {
            Some(remote) => remote,
            None => {
                return Err(ProvisioningError::ResolutionIncomplete(
                    unresolved.all_bundle_ids(),
                ))
            }
        };

        let class = options.distribution_type.certificate_class();
        let profile_type = ProfileType::new(layout.platform, options.distribution_type);

        info!("fetching {} assets from the developer portal", class.as_str());
        inventory.merge_source(&RemoteAssetSource::new(
            remote,
            Some(class),
            ProfileFilter {
                name: None,
                profile_type: Some(profile_type),
            },
        ))?;

        let unresolved = match self.resolve(&inventory, layout, options, include_ui_tests)? {
            Ok(assets) => {
                info!("remote assets cover every target");
                self.persist(&assets, None)?;
                return Ok(assets);
            }
            Err(unresolved) => unresolved,
        };

        let existing = self.existing_certificate(&inventory, &unresolved, options);

        // Checks below run before anything is changed remotely.
        let residual = match &existing {
            Some(cert) => GroupResolver::new(&inventory, CompatibilityMatcher::new(self.now))
                .unresolved_for_certificate(cert, layout, options, include_ui_tests)?,
            None => UnresolvedTargets::for_layout(layout, options, include_ui_tests),
        };
        check_supported(layout, &residual)?;
        check_app_ids_hold_containers(remote, layout, &residual)?;

        let (certificate, created) = match existing {
            Some(cert) => {
                debug!("using certificate {}", cert);
                (cert, None)
            }
            None => {
                let cert = self.create_certificate(remote, &mut inventory, options)?;
                let serial = cert.serial().to_string();
                (cert, Some(serial))
            }
        };

        let mut options = options.clone();
        if options.distribution_type.requires_device_list() {
            options.device_udids =
                self.register_devices(remote, layout.platform, &options.device_udids)?;
        }

        // Devices may have been dropped, so look again at what the chosen certificate lacks.
        let residual = GroupResolver::new(&inventory, CompatibilityMatcher::new(self.now))
            .unresolved_for_certificate(&certificate, layout, &options, include_ui_tests)?;

        for spec in profile_specs(layout, &residual)? {
            self.ensure_profile(
                remote,
                &mut inventory,
                &certificate,
                profile_type,
                &spec,
                &options,
            )?;
        }

        match self.resolve(&inventory, layout, &options, include_ui_tests)? {
            Ok(assets) => {
                self.persist(&assets, created.as_deref())?;
                Ok(assets)
            }
            Err(unresolved) => Err(ProvisioningError::ResolutionIncomplete(
                unresolved.all_bundle_ids(),
            )),
        }
    }

    /// A possessed certificate the remote authority knows.
    ///
    /// The certificate that came closest to covering every target is
    /// preferred.
    fn existing_certificate(
        &self,
        inventory: &AssetInventory,
        unresolved: &UnresolvedTargets,
        options: &ResolveOptions,
    ) -> Option<SigningCertificate> {
        let closest = unresolved
            .certificate
            .as_ref()
            .and_then(|c| inventory.certificate(c.serial()))
            .filter(|c| c.remote_id.is_some());

        closest
            .or_else(|| {
                inventory
                    .usable_certificates(options.distribution_type.certificate_class(), self.now)
                    .into_iter()
                    .find(|c| c.remote_id.is_some())
            })
            .cloned()
    }

    /// Create a certificate remotely and add it to the inventory.
    fn create_certificate(
        &self,
        remote: &dyn RemoteProvisioningClient,
        inventory: &mut AssetInventory,
        options: &ResolveOptions,
    ) -> Result<SigningCertificate, ProvisioningError> {
        let class = options.distribution_type.certificate_class();

        info!("no usable {} certificate is held", class.as_str());
        let cert = remote.create_certificate(class)?;

        if cert.remote_id.is_none() || !cert.has_private_key {
            return Err(ProvisioningError::InvariantViolation(format!(
                "created certificate {} lacks a remote id or private key",
                cert
            )));
        }

        inventory.add_certificate(cert.clone());

        Ok(cert)
    }

    /// Register devices not yet known remotely.
    ///
    /// Returns the UDIDs registered after the call. Devices failing
    /// registration are left out.
    fn register_devices(
        &self,
        remote: &dyn RemoteProvisioningClient,
        platform: Platform,
        udids: &[String],
    ) -> Result<Vec<String>, ProvisioningError> {
        if udids.is_empty() {
            return Ok(vec![]);
        }

        let registered = remote
            .list_devices(platform)?
            .into_iter()
            .map(|d| normalize_udid(&d.udid))
            .collect::<BTreeSet<_>>();

        let mut available = vec![];

        for udid in udids {
            if registered.contains(&normalize_udid(udid)) {
                debug!("device {} is registered", udid);
                available.push(udid.clone());
                continue;
            }

            match remote.register_device(udid, platform) {
                Ok(device) => {
                    info!("registered device {} as {}", udid, device.id);
                    available.push(udid.clone());
                }
                Err(e) => {
                    warn!("unable to register device {}: {}; skipping it", udid, e);
                }
            }
        }

        Ok(available)
    }

    /// Make sure a managed profile covering `spec` exists and is usable.
    fn ensure_profile(
        &self,
        remote: &dyn RemoteProvisioningClient,
        inventory: &mut AssetInventory,
        certificate: &SigningCertificate,
        profile_type: ProfileType,
        spec: &ProfileSpec,
        options: &ResolveOptions,
    ) -> Result<(), ProvisioningError> {
        let certificate_id = certificate.remote_id.clone().ok_or_else(|| {
            ProvisioningError::InvariantViolation(format!(
                "certificate {} has no remote id",
                certificate
            ))
        })?;

        let devices = if options.distribution_type.requires_device_list() {
            options.device_udids.clone()
        } else {
            vec![]
        };

        let request = ProfileRequest {
            name: managed_profile_name(profile_type, &spec.bundle_id),
            profile_type,
            bundle_id: spec.bundle_id.clone(),
            entitlements: spec.entitlements.clone(),
            certificate_ids: vec![certificate_id],
            device_udids: devices,
        };

        let serials = [certificate.serial().to_string()];
        let requirements = ProfileRequirements {
            platform: profile_type.platform(),
            distribution_type: options.distribution_type,
            bundle_id: &spec.bundle_id,
            entitlements: &spec.entitlements,
            min_validity_days: options.min_validity_days,
            certificate_serials: &serials,
            device_udids: &request.device_udids,
        };

        let matcher = CompatibilityMatcher::new(self.now);

        let existing = inventory
            .profiles_named(&request.name)
            .filter(|p| p.remote_id.is_some())
            .map(|p| (p.clone(), matcher.check(p, &requirements)))
            .collect::<Vec<_>>();

        if let Some((profile, _)) = existing.iter().find(|(_, check)| check.is_ok()) {
            info!("reusing profile {}", profile);
            return Ok(());
        }

        let mut updatable = None;

        for (profile, check) in existing {
            let remote_id = match &profile.remote_id {
                Some(id) => id.clone(),
                None => continue,
            };

            match check {
                Err(Mismatch::MissingContainers(missing)) if updatable.is_none() => {
                    info!(
                        "profile {} lacks iCloud containers {}",
                        profile,
                        missing.join(", ")
                    );
                    updatable = Some((profile, remote_id));
                }
                Err(reason) => {
                    info!("profile {} is unusable: {}", profile, reason);
                    remote.delete_profile(&remote_id)?;
                    inventory.remove_profile(&profile.uuid);
                }
                Ok(()) => {}
            }
        }

        let created = match updatable {
            Some((profile, remote_id)) => {
                let updated = remote.update_profile(&remote_id, &request)?;
                inventory.remove_profile(&profile.uuid);
                updated
            }
            None => remote.create_profile(&request)?,
        };

        info!("obtained profile {}", created);

        // The app id decides which containers a profile grants.
        let check = matcher.check(&created, &requirements);
        inventory.add_profile(created);

        if let Err(Mismatch::MissingContainers(containers)) = check {
            return Err(ProvisioningError::ICloudContainersUnassigned {
                bundle_id: spec.bundle_id.clone(),
                containers,
            });
        }

        Ok(())
    }

    /// Hand resolved assets to the writer.
    ///
    /// The certificate is only installed if it was created by this run.
    fn persist(
        &self,
        assets: &CodesignAssets,
        created_certificate: Option<&str>,
    ) -> Result<(), ProvisioningError> {
        if created_certificate == Some(assets.certificate.serial()) {
            self.writer.install_certificate(&assets.certificate)?;
        }

        for profile in assets.unique_profiles() {
            self.writer.install_profile(profile)?;
        }

        Ok(())
    }
}

/// Fail if a residual target needs entitlements profiles cannot be created with.
fn check_supported(
    layout: &AppLayout,
    unresolved: &UnresolvedTargets,
) -> Result<(), ProvisioningError> {
    for bundle_id in &unresolved.bundle_ids {
        if let Some(entitlements) = layout.entitlements_by_bundle_id.get(bundle_id) {
            if let Some(key) = entitlements.unsupported_keys().first() {
                return Err(ProvisioningError::UnsupportedEntitlement {
                    bundle_id: bundle_id.clone(),
                    entitlement: key.to_string(),
                });
            }
        }
    }

    Ok(())
}

/// Fail if a residual target needs iCloud containers on an app id that does not exist yet.
///
/// Containers cannot be assigned to a newly registered app id, so the profile
/// created for it would never grant them.
fn check_app_ids_hold_containers(
    remote: &dyn RemoteProvisioningClient,
    layout: &AppLayout,
    unresolved: &UnresolvedTargets,
) -> Result<(), ProvisioningError> {
    for bundle_id in &unresolved.bundle_ids {
        let containers = match layout.entitlements_by_bundle_id.get(bundle_id) {
            Some(entitlements) => entitlements.icloud_containers()?.unwrap_or_default(),
            None => continue,
        };

        if containers.is_empty() {
            continue;
        }

        if remote.find_bundle_id(bundle_id)?.is_none() {
            return Err(ProvisioningError::ICloudContainersUnassigned {
                bundle_id: bundle_id.clone(),
                containers,
            });
        }
    }

    Ok(())
}

/// Profiles to request for residual targets.
///
/// UI test targets share wildcard profiles without entitlements.
fn profile_specs(
    layout: &AppLayout,
    unresolved: &UnresolvedTargets,
) -> Result<Vec<ProfileSpec>, ProvisioningError> {
    let mut specs = BTreeMap::new();

    for bundle_id in &unresolved.bundle_ids {
        let entitlements = layout
            .entitlements_by_bundle_id
            .get(bundle_id)
            .cloned()
            .ok_or_else(|| {
                ProvisioningError::InvariantViolation(format!(
                    "unresolved target {} is not part of the layout",
                    bundle_id
                ))
            })?;

        specs.insert(
            bundle_id.clone(),
            ProfileSpec {
                bundle_id: bundle_id.clone(),
                entitlements,
            },
        );
    }

    for bundle_id in &unresolved.ui_test_bundle_ids {
        let wildcard = wildcard_bundle_id(bundle_id)?;

        specs.entry(wildcard.clone()).or_insert(ProfileSpec {
            bundle_id: wildcard,
            entitlements: Entitlements::default(),
        });
    }

    Ok(specs.into_values().collect())
}
