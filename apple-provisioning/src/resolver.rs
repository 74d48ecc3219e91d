// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Assigning provisioning profiles to targets.

Resolution works per certificate. For each possessed certificate the profiles
embedding it are collected and, for every target, the eligible profiles whose
bundle id pattern covers the target are listed most specific first. These
candidate lists are then turned into concrete assignments through four tiers,
each of which may only use profiles that earlier tiers left unused:

1. A single profile covering every target (typically a wildcard).
2. Unique reduction among Xcode managed profiles.
3. Unique reduction among other profiles.
4. First remaining candidate per target.

The resulting groups are ordered so that explicitly created profiles are
preferred over Xcode managed ones, which are preferred over wildcards.
*/

use {
    crate::{
        profile::wildcard_bundle_id, AppLayout, AssetInventory, CodesignAssets,
        CompatibilityMatcher, DistributionType, Entitlements, Platform, ProfileRequirements,
        ProvisioningError, ProvisioningProfile, SigningCertificate,
    },
    log::{debug, warn},
    std::collections::{BTreeMap, BTreeSet},
};

/// Profile candidates per target bundle id, most preferred first.
pub type Candidates<'a> = BTreeMap<String, Vec<&'a ProvisioningProfile>>;

/// UUIDs of profiles assigned by an earlier tier.
pub type UsedProfiles = BTreeSet<String>;

/// The tier that produced a group.
///
/// Declaration order is the order groups are preferred in.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum GroupKind {
    NonXcodeManaged,
    XcodeManaged,
    SingleWildcard,
    Fallback,
}

/// A certificate and a profile for every target, all embedding that certificate.
#[derive(Clone, Debug)]
pub struct CodeSignGroup {
    pub certificate: SigningCertificate,
    pub profiles: BTreeMap<String, ProvisioningProfile>,
    pub kind: GroupKind,
}

impl CodeSignGroup {
    fn new(
        certificate: &SigningCertificate,
        profiles: BTreeMap<String, ProvisioningProfile>,
        kind: GroupKind,
    ) -> Self {
        Self {
            certificate: certificate.clone(),
            profiles,
            kind,
        }
    }

    /// Team the group signs for.
    ///
    /// Taken from the certificate, falling back to the profiles.
    pub fn team_id(&self) -> Option<&str> {
        self.certificate
            .team_id
            .as_deref()
            .or_else(|| self.profiles.values().find_map(|p| p.team_id.as_deref()))
    }
}

/// Parameters of a resolution request besides the targets.
#[derive(Clone, Debug)]
pub struct ResolveOptions {
    pub distribution_type: DistributionType,
    pub min_validity_days: u32,
    /// Devices every profile must provision, when the distribution type has a device list.
    pub device_udids: Vec<String>,
}

impl ResolveOptions {
    pub fn new(distribution_type: DistributionType) -> Self {
        Self {
            distribution_type,
            min_validity_days: 0,
            device_udids: vec![],
        }
    }

    fn devices(&self) -> &[String] {
        if self.distribution_type.requires_device_list() {
            &self.device_udids
        } else {
            &[]
        }
    }
}

/// Targets left without a profile by [GroupResolver::resolve_assets].
#[derive(Clone, Debug, Default)]
pub struct UnresolvedTargets {
    /// The certificate that got closest to covering every target.
    pub certificate: Option<SigningCertificate>,
    pub bundle_ids: Vec<String>,
    pub ui_test_bundle_ids: Vec<String>,
}

impl UnresolvedTargets {
    pub fn all_bundle_ids(&self) -> Vec<String> {
        self.bundle_ids
            .iter()
            .chain(self.ui_test_bundle_ids.iter())
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.bundle_ids.is_empty() && self.ui_test_bundle_ids.is_empty()
    }

    /// Every target of a layout, attributed to no certificate.
    pub fn for_layout(layout: &AppLayout, options: &ResolveOptions, include_ui_tests: bool) -> Self {
        Self {
            certificate: None,
            bundle_ids: layout.entitlements_by_bundle_id.keys().cloned().collect(),
            ui_test_bundle_ids: ui_test_bundle_ids(layout, options, include_ui_tests),
        }
    }
}

/// UI test targets taking part in a resolution.
///
/// Only development signing has UI test targets.
fn ui_test_bundle_ids(
    layout: &AppLayout,
    options: &ResolveOptions,
    include_ui_tests: bool,
) -> Vec<String> {
    if include_ui_tests && options.distribution_type == DistributionType::Development {
        layout.ui_test_target_bundle_ids.clone()
    } else {
        vec![]
    }
}

/// A target as seen by the resolver.
struct TargetSpec<'a> {
    bundle_id: &'a str,
    /// The bundle id profile patterns are matched against.
    match_id: String,
    entitlements: &'a Entitlements,
}

fn archivable_specs(targets: &BTreeMap<String, Entitlements>) -> Vec<TargetSpec> {
    targets
        .iter()
        .map(|(bundle_id, entitlements)| TargetSpec {
            bundle_id,
            match_id: bundle_id.clone(),
            entitlements,
        })
        .collect()
}

/// UI test targets carry no entitlements and match through their wildcard bundle id.
fn ui_test_specs<'b>(
    bundle_ids: &'b [String],
    empty: &'b Entitlements,
) -> Result<Vec<TargetSpec<'b>>, ProvisioningError> {
    bundle_ids
        .iter()
        .map(|bundle_id| {
            Ok(TargetSpec {
                bundle_id,
                match_id: wildcard_bundle_id(bundle_id)?,
                entitlements: empty,
            })
        })
        .collect()
}

/// Resolves targets against an inventory.
pub struct GroupResolver<'a> {
    inventory: &'a AssetInventory,
    matcher: CompatibilityMatcher,
}

impl<'a> GroupResolver<'a> {
    pub fn new(inventory: &'a AssetInventory, matcher: CompatibilityMatcher) -> Self {
        Self { inventory, matcher }
    }

    /// Resolve candidate groups for a set of targets.
    ///
    /// Groups are ordered most preferred first. Within a tier, groups follow
    /// certificate serial order.
    pub fn resolve_groups(
        &self,
        targets: &BTreeMap<String, Entitlements>,
        platform: Platform,
        team_id: Option<&str>,
        options: &ResolveOptions,
    ) -> Vec<CodeSignGroup> {
        self.resolve_specs(&archivable_specs(targets), platform, team_id, options)
    }

    /// Resolve candidate groups for UI test targets.
    ///
    /// UI test targets carry no entitlements and are matched through their
    /// wildcard bundle id. Only development signing has UI test targets.
    pub fn resolve_ui_test_groups(
        &self,
        bundle_ids: &[String],
        platform: Platform,
        team_id: Option<&str>,
        options: &ResolveOptions,
    ) -> Result<Vec<CodeSignGroup>, ProvisioningError> {
        if options.distribution_type != DistributionType::Development {
            return Ok(vec![]);
        }

        let empty = Entitlements::default();
        let specs = ui_test_specs(bundle_ids, &empty)?;

        Ok(self.resolve_specs(&specs, platform, team_id, options))
    }

    fn resolve_specs(
        &self,
        specs: &[TargetSpec],
        platform: Platform,
        team_id: Option<&str>,
        options: &ResolveOptions,
    ) -> Vec<CodeSignGroup> {
        if specs.is_empty() {
            return vec![];
        }

        let mut groups = vec![];

        for certificate in self.inventory.possessed_certificates() {
            if !certificate.is_valid_at(self.matcher.now()) {
                continue;
            }

            let candidates = self.candidates(certificate, specs, platform, team_id, options);

            if let Some((bundle_id, _)) = candidates.iter().find(|(_, ps)| ps.is_empty()) {
                debug!(
                    "certificate {} has no profile for {}; skipping",
                    certificate, bundle_id
                );
                continue;
            }

            groups.extend(resolve_selectable(certificate, &candidates));
        }

        // Stable, so certificate order is kept within a kind.
        groups.sort_by_key(|g| g.kind);

        groups
    }

    /// Profiles embedding a certificate that can serve each target.
    fn candidates(
        &self,
        certificate: &SigningCertificate,
        specs: &[TargetSpec],
        platform: Platform,
        team_id: Option<&str>,
        options: &ResolveOptions,
    ) -> Candidates<'a> {
        let inventory: &'a AssetInventory = self.inventory;
        let embedding = inventory
            .profiles_embedding(certificate.serial())
            .filter(|p| match (team_id, p.team_id.as_deref()) {
                (Some(want), Some(have)) => want == have,
                _ => true,
            })
            .collect::<Vec<_>>();

        specs
            .iter()
            .map(|spec| {
                let req = ProfileRequirements {
                    platform,
                    distribution_type: options.distribution_type,
                    bundle_id: &spec.match_id,
                    entitlements: spec.entitlements,
                    min_validity_days: options.min_validity_days,
                    certificate_serials: &[],
                    device_udids: options.devices(),
                };

                let mut matching = embedding
                    .iter()
                    .copied()
                    .filter(|p| match self.matcher.check_pattern(p, &req) {
                        Ok(()) => true,
                        Err(mismatch) => {
                            debug!("profile {} rejected for {}: {}", p, spec.bundle_id, mismatch);
                            false
                        }
                    })
                    .collect::<Vec<_>>();
                matching.sort_by(|a, b| a.specificity_key().cmp(&b.specificity_key()));

                (spec.bundle_id.to_string(), matching)
            })
            .collect()
    }

    /// Resolve an app layout into assets sharing one certificate.
    ///
    /// On failure, reports which targets are left uncovered for the
    /// certificate that came closest. A layout without targets only needs a
    /// usable certificate; without one it fails with no targets reported.
    pub fn resolve_assets(
        &self,
        layout: &AppLayout,
        options: &ResolveOptions,
        include_ui_tests: bool,
    ) -> Result<Result<CodesignAssets, UnresolvedTargets>, ProvisioningError> {
        let team_id = layout.team_id.as_deref();
        let ui_test_bundle_ids = ui_test_bundle_ids(layout, options, include_ui_tests);

        if layout.entitlements_by_bundle_id.is_empty() && ui_test_bundle_ids.is_empty() {
            debug!("layout has no targets to resolve");

            return Ok(match self.team_certificates(team_id, options).first() {
                Some(certificate) => Ok(CodesignAssets {
                    certificate: (*certificate).clone(),
                    archivable_target_profiles: BTreeMap::new(),
                    ui_test_target_profiles: BTreeMap::new(),
                }),
                None => Err(UnresolvedTargets::default()),
            });
        }

        let groups = filter_for_distribution(
            filter_for_team(
                self.resolve_groups(
                    &layout.entitlements_by_bundle_id,
                    layout.platform,
                    team_id,
                    options,
                ),
                team_id,
            ),
            options.distribution_type,
        );

        let ui_groups = filter_for_distribution(
            filter_for_team(
                self.resolve_ui_test_groups(&ui_test_bundle_ids, layout.platform, team_id, options)?,
                team_id,
            ),
            options.distribution_type,
        );

        for group in &groups {
            let ui_group = if ui_test_bundle_ids.is_empty() {
                None
            } else {
                match ui_groups
                    .iter()
                    .find(|g| g.certificate.serial() == group.certificate.serial())
                {
                    Some(g) => Some(g),
                    None => continue,
                }
            };

            debug!(
                "selected {:?} group with certificate {}",
                group.kind, group.certificate
            );

            return Ok(Ok(CodesignAssets {
                certificate: group.certificate.clone(),
                archivable_target_profiles: group.profiles.clone(),
                ui_test_target_profiles: ui_group.map(|g| g.profiles.clone()).unwrap_or_default(),
            }));
        }

        // Layouts with no archivable targets resolve through UI tests alone.
        if layout.entitlements_by_bundle_id.is_empty() {
            if let Some(g) = ui_groups.first() {
                return Ok(Ok(CodesignAssets {
                    certificate: g.certificate.clone(),
                    archivable_target_profiles: BTreeMap::new(),
                    ui_test_target_profiles: g.profiles.clone(),
                }));
            }
        }

        Ok(Err(self.unresolved(layout, options, &ui_test_bundle_ids)?))
    }

    /// Usable certificates of the distribution's class not belonging to another team.
    fn team_certificates(
        &self,
        team_id: Option<&str>,
        options: &ResolveOptions,
    ) -> Vec<&'a SigningCertificate> {
        let inventory: &'a AssetInventory = self.inventory;

        inventory
            .usable_certificates(options.distribution_type.certificate_class(), self.matcher.now())
            .into_iter()
            .filter(|c| match (team_id, c.team_id.as_deref()) {
                (Some(want), Some(have)) => want == have,
                _ => true,
            })
            .collect()
    }

    /// Targets a specific certificate leaves without a profile.
    ///
    /// When every target has candidates but no assignment could be made, all
    /// targets are reported.
    pub fn unresolved_for_certificate(
        &self,
        certificate: &SigningCertificate,
        layout: &AppLayout,
        options: &ResolveOptions,
        include_ui_tests: bool,
    ) -> Result<UnresolvedTargets, ProvisioningError> {
        let ui_test_bundle_ids = ui_test_bundle_ids(layout, options, include_ui_tests);

        self.uncovered(certificate, layout, options, &ui_test_bundle_ids)
    }

    fn uncovered(
        &self,
        certificate: &SigningCertificate,
        layout: &AppLayout,
        options: &ResolveOptions,
        ui_test_bundle_ids: &[String],
    ) -> Result<UnresolvedTargets, ProvisioningError> {
        let team_id = layout.team_id.as_deref();
        let empty = Entitlements::default();
        let ui_specs = ui_test_specs(ui_test_bundle_ids, &empty)?;

        let uncovered = |specs: &[TargetSpec]| {
            self.candidates(certificate, specs, layout.platform, team_id, options)
                .into_iter()
                .filter(|(_, ps)| ps.is_empty())
                .map(|(bundle_id, _)| bundle_id)
                .collect::<Vec<_>>()
        };

        let current = UnresolvedTargets {
            certificate: Some(certificate.clone()),
            bundle_ids: uncovered(&archivable_specs(&layout.entitlements_by_bundle_id)),
            ui_test_bundle_ids: uncovered(&ui_specs),
        };

        // Every target has candidates but tiering still failed.
        if current.is_empty() {
            return Ok(UnresolvedTargets {
                certificate: Some(certificate.clone()),
                bundle_ids: layout.entitlements_by_bundle_id.keys().cloned().collect(),
                ui_test_bundle_ids: ui_test_bundle_ids.to_vec(),
            });
        }

        Ok(current)
    }

    fn unresolved(
        &self,
        layout: &AppLayout,
        options: &ResolveOptions,
        ui_test_bundle_ids: &[String],
    ) -> Result<UnresolvedTargets, ProvisioningError> {
        let mut best: Option<UnresolvedTargets> = None;

        for certificate in self.team_certificates(layout.team_id.as_deref(), options) {
            let current = self.uncovered(certificate, layout, options, ui_test_bundle_ids)?;

            let count = current.bundle_ids.len() + current.ui_test_bundle_ids.len();
            if best
                .as_ref()
                .map(|b| count < b.bundle_ids.len() + b.ui_test_bundle_ids.len())
                .unwrap_or(true)
            {
                best = Some(current);
            }
        }

        Ok(best.unwrap_or_else(|| UnresolvedTargets {
            certificate: None,
            bundle_ids: layout.entitlements_by_bundle_id.keys().cloned().collect(),
            ui_test_bundle_ids: ui_test_bundle_ids.to_vec(),
        }))
    }
}

/// Resolve one certificate's candidates through all tiers.
pub fn resolve_selectable(
    certificate: &SigningCertificate,
    candidates: &Candidates,
) -> Vec<CodeSignGroup> {
    let used = UsedProfiles::new();

    let (mut groups, used) = tier_single_wildcard(certificate, candidates, used);

    let (group, used) = tier_reduction(certificate, candidates, used, true);
    groups.extend(group);

    let (group, used) = tier_reduction(certificate, candidates, used, false);
    groups.extend(group);

    let (group, _) = tier_fallback(certificate, candidates, used);
    groups.extend(group);

    groups
}

/// Groups assigning one profile to every target.
///
/// Each qualifying profile yields its own group.
pub fn tier_single_wildcard(
    certificate: &SigningCertificate,
    candidates: &Candidates,
    mut used: UsedProfiles,
) -> (Vec<CodeSignGroup>, UsedProfiles) {
    let mut groups = vec![];

    let first = match candidates.values().next() {
        Some(first) => first,
        None => return (groups, used),
    };

    // A profile covering every target is necessarily a candidate of the first.
    for profile in first {
        if used.contains(&profile.uuid) {
            continue;
        }

        let covers_all = candidates
            .values()
            .all(|ps| ps.iter().any(|p| p.uuid == profile.uuid));

        if covers_all {
            debug!("profile {} covers every target", profile);
            used.insert(profile.uuid.clone());

            groups.push(CodeSignGroup::new(
                certificate,
                candidates
                    .keys()
                    .map(|bundle_id| (bundle_id.clone(), (*profile).clone()))
                    .collect(),
                GroupKind::SingleWildcard,
            ));
        }
    }

    (groups, used)
}

/// Assign targets having exactly one candidate, repeatedly.
///
/// Only profiles whose Xcode managed flag equals `xcode_managed` take part.
/// The group is committed only if every target gets a profile.
pub fn tier_reduction(
    certificate: &SigningCertificate,
    candidates: &Candidates,
    mut used: UsedProfiles,
    xcode_managed: bool,
) -> (Option<CodeSignGroup>, UsedProfiles) {
    if candidates.is_empty() {
        return (None, used);
    }

    let mut pools = candidates
        .iter()
        .map(|(bundle_id, ps)| {
            (
                bundle_id.as_str(),
                ps.iter()
                    .copied()
                    .filter(|p| p.xcode_managed == xcode_managed && !used.contains(&p.uuid))
                    .collect::<Vec<_>>(),
            )
        })
        .collect::<BTreeMap<_, _>>();

    let mut assigned = BTreeMap::new();

    loop {
        let unique = pools
            .iter()
            .find(|(_, ps)| ps.len() == 1)
            .map(|(bundle_id, ps)| (*bundle_id, ps[0]));

        let (bundle_id, profile) = match unique {
            Some(v) => v,
            None => break,
        };

        pools.remove(bundle_id);
        for ps in pools.values_mut() {
            ps.retain(|p| p.uuid != profile.uuid);
        }

        assigned.insert(bundle_id.to_string(), profile.clone());
    }

    if !pools.is_empty() {
        return (None, used);
    }

    used.extend(assigned.values().map(|p| p.uuid.clone()));

    let kind = if xcode_managed {
        GroupKind::XcodeManaged
    } else {
        GroupKind::NonXcodeManaged
    };

    (Some(CodeSignGroup::new(certificate, assigned, kind)), used)
}

/// Assign each target its first remaining candidate.
///
/// Candidates are expected most specific pattern first, then by UUID, which
/// decides ties. A profile is never assigned to two targets of the group.
pub fn tier_fallback(
    certificate: &SigningCertificate,
    candidates: &Candidates,
    mut used: UsedProfiles,
) -> (Option<CodeSignGroup>, UsedProfiles) {
    if candidates.is_empty() {
        return (None, used);
    }

    let mut assigned = BTreeMap::<String, ProvisioningProfile>::new();

    for (bundle_id, ps) in candidates {
        let chosen = ps.iter().find(|p| {
            !used.contains(&p.uuid) && !assigned.values().any(|a| a.uuid == p.uuid)
        });

        match chosen {
            Some(p) => {
                assigned.insert(bundle_id.clone(), (*p).clone());
            }
            None => return (None, used),
        }
    }

    used.extend(assigned.values().map(|p| p.uuid.clone()));

    (
        Some(CodeSignGroup::new(certificate, assigned, GroupKind::Fallback)),
        used,
    )
}

/// Keep groups signing for a team.
pub fn filter_for_team(groups: Vec<CodeSignGroup>, team_id: Option<&str>) -> Vec<CodeSignGroup> {
    let team_id = match team_id {
        Some(team_id) => team_id,
        None => return groups,
    };

    groups
        .into_iter()
        .filter(|g| match g.team_id() {
            Some(have) if have != team_id => {
                warn!(
                    "ignoring certificate {} of team {}; want team {}",
                    g.certificate, have, team_id
                );
                false
            }
            _ => true,
        })
        .collect()
}

/// Keep groups whose profiles and certificate serve a distribution type.
pub fn filter_for_distribution(
    groups: Vec<CodeSignGroup>,
    distribution_type: DistributionType,
) -> Vec<CodeSignGroup> {
    groups
        .into_iter()
        .filter(|g| {
            g.certificate.class == distribution_type.certificate_class()
                && g
                    .profiles
                    .values()
                    .all(|p| p.distribution_type == distribution_type)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::CertificateClass,
        chrono::{Duration, Utc},
        serde_json::json,
    };

    fn certificate(serial: &str) -> SigningCertificate {
        let mut c = SigningCertificate::new(
            serial,
            format!("Apple Distribution: Acme {}", serial),
            CertificateClass::Distribution,
            Utc::now() + Duration::days(365),
        );
        c.has_private_key = true;
        c
    }

    fn profile(uuid: &str, bundle_id: &str, serials: &[&str]) -> ProvisioningProfile {
        let mut p = ProvisioningProfile::new(
            uuid,
            format!("profile {}", uuid),
            bundle_id,
            Platform::Ios,
            DistributionType::AppStore,
            Utc::now() + Duration::days(365),
        );
        p.certificate_serials = serials.iter().map(|s| s.to_string()).collect();
        p
    }

    fn targets(value: serde_json::Value) -> BTreeMap<String, Entitlements> {
        serde_json::from_value(value).unwrap()
    }

    fn inventory(
        certs: Vec<SigningCertificate>,
        profiles: Vec<ProvisioningProfile>,
    ) -> AssetInventory {
        let mut inventory = AssetInventory::new();
        for c in certs {
            inventory.add_certificate(c);
        }
        for p in profiles {
            inventory.add_profile(p);
        }
        inventory
    }

    fn assigned(group: &CodeSignGroup) -> Vec<(&str, &str)> {
        group
            .profiles
            .iter()
            .map(|(b, p)| (b.as_str(), p.uuid.as_str()))
            .collect()
    }

    #[test]
    fn entitlements_exclude_profiles_before_tiering() {
        let mut a = profile("A", "com.acme.*", &["C1"]);
        a.entitlements = serde_json::from_value(json!({"aps-environment": "production"})).unwrap();
        let b = profile("B", "com.acme.app", &["C1"]);

        let inventory = inventory(vec![certificate("C1")], vec![a, b]);
        let resolver = GroupResolver::new(&inventory, CompatibilityMatcher::new(Utc::now()));

        let groups = resolver.resolve_groups(
            &targets(json!({"com.acme.app": {"aps-environment": "production"}})),
            Platform::Ios,
            None,
            &ResolveOptions::new(DistributionType::AppStore),
        );

        assert!(!groups.is_empty());
        for group in &groups {
            assert_eq!(assigned(group), vec![("com.acme.app", "A")]);
        }
    }

    #[test]
    fn single_wildcard_covers_all_targets() {
        let inventory = inventory(
            vec![certificate("C1")],
            vec![profile("W", "com.acme.*", &["C1"])],
        );
        let resolver = GroupResolver::new(&inventory, CompatibilityMatcher::new(Utc::now()));

        let groups = resolver.resolve_groups(
            &targets(json!({"com.acme.app": {}, "com.acme.app.widget": {}})),
            Platform::Ios,
            None,
            &ResolveOptions::new(DistributionType::AppStore),
        );

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].kind, GroupKind::SingleWildcard);
        assert_eq!(
            assigned(&groups[0]),
            vec![("com.acme.app", "W"), ("com.acme.app.widget", "W")]
        );
    }

    #[test]
    fn reduction_locks_unique_candidates() {
        let cert = certificate("C1");
        let app = profile("P1", "com.acme.app", &["C1"]);
        let widget = profile("P2", "com.acme.app.widget", &["C1"]);
        let wildcard = profile("P3", "com.acme.app.*", &["C1"]);

        let candidates: Candidates = vec![
            ("com.acme.app".to_string(), vec![&app]),
            ("com.acme.app.widget".to_string(), vec![&widget, &wildcard]),
        ]
        .into_iter()
        .collect();

        let (group, used) = tier_reduction(&cert, &candidates, UsedProfiles::new(), false);
        assert!(group.is_none());
        assert!(used.is_empty());

        let candidates: Candidates = vec![
            ("com.acme.app".to_string(), vec![&app]),
            ("com.acme.app.widget".to_string(), vec![&widget, &app]),
        ]
        .into_iter()
        .collect();

        let (group, used) = tier_reduction(&cert, &candidates, UsedProfiles::new(), false);
        let group = group.unwrap();
        assert_eq!(group.kind, GroupKind::NonXcodeManaged);
        assert_eq!(
            assigned(&group),
            vec![("com.acme.app", "P1"), ("com.acme.app.widget", "P2")]
        );
        assert_eq!(used.len(), 2);

        let (group, _) = tier_reduction(&cert, &candidates, used, false);
        assert!(group.is_none());
    }

    #[test]
    fn xcode_managed_reduction_ignores_other_profiles() {
        let cert = certificate("C1");
        let mut managed = profile("M", "com.acme.*", &["C1"]);
        managed.xcode_managed = true;
        let explicit = profile("E", "com.acme.app", &["C1"]);

        let candidates: Candidates = vec![("com.acme.app".to_string(), vec![&explicit, &managed])]
            .into_iter()
            .collect();

        let (group, _) = tier_reduction(&cert, &candidates, UsedProfiles::new(), true);
        assert_eq!(assigned(&group.unwrap()), vec![("com.acme.app", "M")]);

        let (group, _) = tier_reduction(&cert, &candidates, UsedProfiles::new(), false);
        assert_eq!(assigned(&group.unwrap()), vec![("com.acme.app", "E")]);
    }

    #[test]
    fn fallback_tie_break() {
        let inventory = inventory(
            vec![certificate("C1")],
            vec![
                profile("b-uuid", "com.acme.*", &["C1"]),
                profile("a-uuid", "com.acme.*", &["C1"]),
                profile("c-uuid", "*", &["C1"]),
            ],
        );
        let resolver = GroupResolver::new(&inventory, CompatibilityMatcher::new(Utc::now()));
        let t = targets(json!({"com.acme.app": {}}));

        let groups = resolver.resolve_groups(
            &t,
            Platform::Ios,
            None,
            &ResolveOptions::new(DistributionType::AppStore),
        );

        // Every profile covers the single target; tier 1 takes them in preference order.
        assert_eq!(
            groups
                .iter()
                .map(|g| assigned(g)[0].1)
                .collect::<Vec<_>>(),
            vec!["a-uuid", "b-uuid", "c-uuid"]
        );

        let (group, _) = tier_fallback(
            &certificate("C1"),
            &resolver.candidates(
                &certificate("C1"),
                &[TargetSpec {
                    bundle_id: "com.acme.app",
                    match_id: "com.acme.app".into(),
                    entitlements: &Entitlements::default(),
                }],
                Platform::Ios,
                None,
                &ResolveOptions::new(DistributionType::AppStore),
            ),
            UsedProfiles::new(),
        );
        assert_eq!(assigned(&group.unwrap()), vec![("com.acme.app", "a-uuid")]);
    }

    #[test]
    fn fallback_never_shares_a_profile() {
        let cert = certificate("C1");
        let shared = profile("S", "com.acme.*", &["C1"]);

        let candidates: Candidates = vec![
            ("com.acme.a".to_string(), vec![&shared]),
            ("com.acme.b".to_string(), vec![&shared]),
        ]
        .into_iter()
        .collect();

        let (group, used) = tier_fallback(&cert, &candidates, UsedProfiles::new());
        assert!(group.is_none());
        assert!(used.is_empty());
    }

    #[test]
    fn group_order_and_determinism() {
        let mut managed = profile("M", "com.acme.app", &["C1"]);
        managed.xcode_managed = true;

        let profiles = vec![
            profile("W", "com.acme.*", &["C1"]),
            profile("X", "com.acme.app.extension", &["C1"]),
            managed,
            profile("E", "com.acme.app", &["C1", "C2"]),
        ];

        let inventory = inventory(vec![certificate("C2"), certificate("C1")], profiles);
        let resolver = GroupResolver::new(&inventory, CompatibilityMatcher::new(Utc::now()));
        let t = targets(json!({"com.acme.app": {}, "com.acme.app.extension": {}}));
        let options = ResolveOptions::new(DistributionType::AppStore);

        let groups = resolver.resolve_groups(&t, Platform::Ios, None, &options);
        let again = resolver.resolve_groups(&t, Platform::Ios, None, &options);

        let summary = |groups: &[CodeSignGroup]| {
            groups
                .iter()
                .map(|g| (g.certificate.serial().to_string(), g.kind, g.profiles.len()))
                .collect::<Vec<_>>()
        };

        assert_eq!(summary(&groups), summary(&again));
        assert_eq!(
            summary(&groups),
            vec![
                ("C1".to_string(), GroupKind::NonXcodeManaged, 2),
                ("C1".to_string(), GroupKind::SingleWildcard, 2),
            ]
        );
        assert!(groups.windows(2).all(|w| w[0].kind <= w[1].kind));

        for group in &groups {
            assert_eq!(group.profiles.len(), 2);
            if group.kind != GroupKind::SingleWildcard {
                let uuids = group
                    .profiles
                    .values()
                    .map(|p| p.uuid.as_str())
                    .collect::<BTreeSet<_>>();
                assert_eq!(uuids.len(), 2);
            }
        }
    }

    #[test]
    fn filters() {
        let mut c1 = certificate("C1");
        c1.team_id = Some("TEAM1".into());
        let mut c2 = certificate("C2");
        c2.team_id = Some("TEAM2".into());

        let groups = vec![
            CodeSignGroup::new(
                &c1,
                vec![("a".to_string(), profile("P1", "a", &["C1"]))]
                    .into_iter()
                    .collect(),
                GroupKind::Fallback,
            ),
            CodeSignGroup::new(
                &c2,
                vec![("a".to_string(), profile("P2", "a", &["C2"]))]
                    .into_iter()
                    .collect(),
                GroupKind::Fallback,
            ),
        ];

        let kept = filter_for_team(groups.clone(), Some("TEAM2"));
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].certificate.serial(), "C2");
        assert_eq!(filter_for_team(groups.clone(), None).len(), 2);

        assert_eq!(
            filter_for_distribution(groups.clone(), DistributionType::AppStore).len(),
            2
        );
        assert!(filter_for_distribution(groups, DistributionType::AdHoc).is_empty());
    }

    #[test]
    fn resolve_assets_reports_uncovered_targets() -> Result<(), ProvisioningError> {
        let inventory = inventory(
            vec![certificate("C1")],
            vec![profile("P1", "com.acme.app", &["C1"])],
        );
        let resolver = GroupResolver::new(&inventory, CompatibilityMatcher::new(Utc::now()));

        let mut layout = AppLayout::new(Platform::Ios);
        layout
            .entitlements_by_bundle_id
            .insert("com.acme.app".into(), Entitlements::default());

        let options = ResolveOptions::new(DistributionType::AppStore);
        let assets = resolver.resolve_assets(&layout, &options, false)?.unwrap();
        assert_eq!(assets.certificate.serial(), "C1");
        assert_eq!(assets.archivable_target_profiles["com.acme.app"].uuid, "P1");

        layout
            .entitlements_by_bundle_id
            .insert("com.acme.app.widget".into(), Entitlements::default());

        let unresolved = resolver.resolve_assets(&layout, &options, false)?.unwrap_err();
        assert_eq!(
            unresolved.certificate.as_ref().map(|c| c.serial()),
            Some("C1")
        );
        assert_eq!(unresolved.bundle_ids, vec!["com.acme.app.widget".to_string()]);

        Ok(())
    }

    #[test]
    fn uncovered_targets_of_a_chosen_certificate() -> Result<(), ProvisioningError> {
        let inventory = inventory(
            vec![certificate("C1"), certificate("C2")],
            vec![
                profile("P1", "com.acme.app", &["C1"]),
                profile("P2", "com.acme.app.widget", &["C2"]),
            ],
        );
        let resolver = GroupResolver::new(&inventory, CompatibilityMatcher::new(Utc::now()));

        let mut layout = AppLayout::new(Platform::Ios);
        for bundle_id in ["com.acme.app", "com.acme.app.widget"] {
            layout
                .entitlements_by_bundle_id
                .insert(bundle_id.into(), Entitlements::default());
        }
        let options = ResolveOptions::new(DistributionType::AppStore);

        let c2 = inventory.certificate("C2").unwrap();
        let unresolved = resolver.unresolved_for_certificate(c2, &layout, &options, false)?;
        assert_eq!(
            unresolved.certificate.as_ref().map(|c| c.serial()),
            Some("C2")
        );
        assert_eq!(unresolved.bundle_ids, vec!["com.acme.app".to_string()]);

        let unresolved =
            resolver.unresolved_for_certificate(&certificate("C3"), &layout, &options, false)?;
        assert_eq!(
            unresolved.bundle_ids,
            vec!["com.acme.app".to_string(), "com.acme.app.widget".to_string()]
        );

        Ok(())
    }

    #[test]
    fn layout_without_targets_needs_only_a_certificate() -> Result<(), ProvisioningError> {
        let mut layout = AppLayout::new(Platform::Ios);
        // UI tests only take part in development signing.
        layout
            .ui_test_target_bundle_ids
            .push("com.acme.app.uitests".into());
        let options = ResolveOptions::new(DistributionType::AppStore);

        let inventory = inventory(vec![certificate("C1")], vec![]);
        let resolver = GroupResolver::new(&inventory, CompatibilityMatcher::new(Utc::now()));
        let assets = resolver.resolve_assets(&layout, &options, true)?.unwrap();
        assert_eq!(assets.certificate.serial(), "C1");
        assert!(assets.unique_profiles().is_empty());

        let empty = AssetInventory::new();
        let unresolved = GroupResolver::new(&empty, CompatibilityMatcher::new(Utc::now()))
            .resolve_assets(&layout, &options, true)?
            .unwrap_err();
        assert!(unresolved.is_empty());
        assert!(unresolved.certificate.is_none());

        Ok(())
    }

    #[test]
    fn ui_test_targets_use_wildcard_profiles() -> Result<(), ProvisioningError> {
        let mut cert = certificate("C1");
        cert.class = CertificateClass::Development;

        let mut app = profile("P1", "com.acme.app", &["C1"]);
        app.distribution_type = DistributionType::Development;
        let mut wildcard = profile("W1", "com.acme.app.*", &["C1"]);
        wildcard.distribution_type = DistributionType::Development;

        let inventory = inventory(vec![cert], vec![app, wildcard]);
        let resolver = GroupResolver::new(&inventory, CompatibilityMatcher::new(Utc::now()));

        let mut layout = AppLayout::new(Platform::Ios);
        layout
            .entitlements_by_bundle_id
            .insert("com.acme.app".into(), Entitlements::default());
        layout
            .ui_test_target_bundle_ids
            .push("com.acme.app.uitests".into());

        let options = ResolveOptions::new(DistributionType::Development);
        let assets = resolver.resolve_assets(&layout, &options, true)?.unwrap();

        assert_eq!(
            assets.ui_test_target_profiles["com.acme.app.uitests"].uuid,
            "W1"
        );
        assert_eq!(assets.archivable_target_profiles["com.acme.app"].uuid, "P1");

        Ok(())
    }
}
