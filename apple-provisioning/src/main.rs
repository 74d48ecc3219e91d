// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    apple_provisioning::{
        developer_portal::{api_token::UnifiedApiKey, DeveloperPortalClient},
        filter_for_distribution, filter_for_team, AssetInventory, AssetSource, CodesignAssets,
        CompatibilityMatcher, DistributionType, FilesystemAssetWriter, GroupResolver,
        LocalAssetSource, ProfileFilter, ProfileType, Project, ProjectDescriptor,
        ProvisioningConfig, ProvisioningError, ProvisioningProfile, ReconciliationEngine,
        RemoteProvisioningClient, ResolveOptions, SigningStrategy, StrategySelector,
    },
    chrono::Utc,
    clap::{Arg, ArgMatches, Command},
    log::{info, warn, LevelFilter},
    std::{
        path::{Path, PathBuf},
        str::FromStr,
    },
};

const ENSURE_ASSETS_ABOUT: &str = "\
Ensure code signing assets exist for every target of a project.

The project is a JSON document describing the targets of an application,
their bundle identifiers and their entitlements.

Certificates and provisioning profiles already on this machine are tried
first. If they do not cover every target, the Apple developer portal is
consulted: existing remote assets are downloaded and missing ones are
created. Assets created this way carry deterministic names so subsequent
runs reuse them.

The chosen certificate and profiles are recorded in the project document,
which is rewritten in place. Automatic signing is disabled in the process.

Credentials for the developer portal come from the configuration file.
Either an App Store Connect API key or a saved Apple ID session may be
configured, not both. When Xcode managed signing is preferred and usable,
this command does nothing and reports that Xcode should manage signing.
";

const RESOLVE_ABOUT: &str = "\
Print which local certificate and profiles would sign a project.

Only assets on this machine are considered. Nothing is created or modified.
Targets no local asset can sign are reported.
";

const ENCODE_APP_STORE_CONNECT_API_KEY_ABOUT: &str = "\
Encode an App Store Connect API Key to JSON.

App Store Connect API Keys are defined by 3 components:

* The Issuer ID (likely a UUID)
* A Key ID (an alphanumeric value like `DEADBEEF42`)
* A PEM encoded ECDSA private key (typically a file like
  `AuthKey_<key ID>.p8`).

This command encodes all 3 components into a single JSON object which can
be referenced by the `api_key_path` credentials setting of the
configuration file.

Be aware that the JSON file contains the private key and anybody with
access to it effectively has access to your App Store Connect account.
";

fn config_arg() -> Arg<'static> {
    Arg::new("config")
        .long("config")
        .short('c')
        .takes_value(true)
        .allow_invalid_utf8(true)
        .help("Path to a YAML or JSON configuration file")
}

fn project_arg() -> Arg<'static> {
    Arg::new("project")
        .long("project")
        .takes_value(true)
        .required(true)
        .allow_invalid_utf8(true)
        .help("Path to a JSON project description")
}

fn distribution_arg() -> Arg<'static> {
    Arg::new("distribution")
        .long("distribution")
        .takes_value(true)
        .possible_values(["development", "app-store", "ad-hoc", "enterprise"])
        .help("Distribution type to sign for")
}

fn load_config(args: &ArgMatches) -> Result<ProvisioningConfig, ProvisioningError> {
    let mut config = match args.value_of_os("config") {
        Some(path) => {
            let path = Path::new(path);
            info!("reading configuration from {}", path.display());
            ProvisioningConfig::from_path(path)?
        }
        None => ProvisioningConfig::default(),
    };

    if let Some(value) = args.value_of("distribution") {
        config.distribution = Some(DistributionType::from_str(value)?);
    }

    Ok(config)
}

/// Apply the command line overrides of [resolution_args].
fn apply_resolution_args(
    config: &mut ProvisioningConfig,
    args: &ArgMatches,
) -> Result<(), ProvisioningError> {
    if let Some(value) = args.value_of("min_profile_validity_days") {
        config.min_profile_validity_days = value
            .parse()
            .map_err(|_| ProvisioningError::CliBadArgument)?;
    }

    if let Some(values) = args.values_of("device") {
        config.test_devices = values.map(|v| v.to_string()).collect();
    }

    if let Some(path) = args.value_of_os("profiles_dir") {
        config.profiles_dir = Some(PathBuf::from(path));
    }

    Ok(())
}

fn resolution_args(command: Command<'static>) -> Command<'static> {
    command
        .arg(project_arg())
        .arg(config_arg())
        .arg(distribution_arg())
        .arg(
            Arg::new("min_profile_validity_days")
                .long("min-profile-validity-days")
                .takes_value(true)
                .help("Reject profiles expiring within this many days"),
        )
        .arg(
            Arg::new("device")
                .long("device")
                .takes_value(true)
                .multiple_occurrences(true)
                .help("UDID of a device profiles must provision"),
        )
        .arg(
            Arg::new("profiles_dir")
                .long("profiles-dir")
                .takes_value(true)
                .allow_invalid_utf8(true)
                .help("Directory provisioning profiles are read from and installed to"),
        )
        .arg(
            Arg::new("certificate")
                .long("certificate")
                .takes_value(true)
                .multiple_occurrences(true)
                .allow_invalid_utf8(true)
                .help("PEM file holding a certificate and its private key"),
        )
        .arg(
            Arg::new("ui_tests")
                .long("ui-tests")
                .help("Also provide assets for UI test targets"),
        )
}

fn resolve_options(config: &ProvisioningConfig) -> ResolveOptions {
    ResolveOptions {
        distribution_type: config.distribution_type(),
        min_validity_days: config.min_profile_validity_days,
        device_udids: config.test_devices.clone(),
    }
}

fn profiles_dir(config: &ProvisioningConfig) -> Result<PathBuf, ProvisioningError> {
    config
        .profiles_dir
        .clone()
        .or_else(LocalAssetSource::default_profiles_dir)
        .ok_or_else(|| {
            ProvisioningError::Configuration(
                "unable to determine the provisioning profiles directory".into(),
            )
        })
}

/// Local assets named by the configuration and [resolution_args].
fn local_source(
    config: &ProvisioningConfig,
    args: &ArgMatches,
) -> Result<(LocalAssetSource, PathBuf), ProvisioningError> {
    let profiles_dir = profiles_dir(config)?;

    let mut source = LocalAssetSource::new(Some(profiles_dir.clone()));

    if let Some(dir) = &config.certificate_dir {
        source.add_certificate_dir(dir)?;
    }
    if let Some(paths) = args.values_of_os("certificate") {
        for path in paths {
            source.add_certificate_path(path);
        }
    }

    Ok((source, profiles_dir))
}

fn print_assets(assets: &CodesignAssets) {
    println!("certificate: {}", assets.certificate);
    for (bundle_id, profile) in &assets.archivable_target_profiles {
        println!("  {}: {}", bundle_id, profile);
    }
    for (bundle_id, profile) in &assets.ui_test_target_profiles {
        println!("  {} (UI tests): {}", bundle_id, profile);
    }
}

fn command_ensure_assets(args: &ArgMatches) -> Result<(), ProvisioningError> {
    let mut config = load_config(args)?;
    apply_resolution_args(&mut config, args)?;
    let project_path = Path::new(
        args.value_of_os("project")
            .expect("arg should have been required"),
    );
    let local_only = args.is_present("local_only");
    let include_ui_tests = args.is_present("ui_tests");

    let mut project = ProjectDescriptor::from_path(project_path)?;

    let client = if local_only {
        None
    } else {
        let authenticator = config.authenticator()?;

        let mut selector = StrategySelector::new(config.prefer_xcode_managed);
        if config.prefer_xcode_managed {
            selector = selector.probe_xcode_version();
        }
        selector.min_profile_validity_days = config.min_profile_validity_days;

        let decision = selector.select(authenticator.kind(), &project);
        if let Some(warning) = &decision.warning {
            warn!("{}", warning);
        }
        info!("signing strategy {}: {}", decision.strategy, decision.reason);

        if decision.strategy == SigningStrategy::XcodeManaged {
            println!("{}: {}", decision.strategy, decision.reason);
            return Ok(());
        }

        Some(DeveloperPortalClient::new(
            authenticator,
            config.retry_policy(),
            config.timeout(),
        )?)
    };

    let (local, profiles_dir) = local_source(&config, args)?;

    let mut writer = FilesystemAssetWriter::new(&profiles_dir);
    if let Some(keychain) = config.keychain.clone() {
        writer = writer.with_keychain(keychain.into());
    }
    if let Some(dir) = &config.certificate_dir {
        writer = writer.with_certificate_dir(dir);
    }

    let mut engine = ReconciliationEngine::new(&local, &writer);
    if let Some(client) = &client {
        engine = engine.with_remote(client);
    }

    let mut layout = project.app_layout(include_ui_tests)?;
    config.apply_to_layout(&mut layout);
    let assets = engine.ensure_assets(&layout, &resolve_options(&config), include_ui_tests)?;

    project.force_codesign_assets(config.distribution_type(), &assets)?;
    eprintln!("updated {}", project_path.display());

    print_assets(&assets);

    Ok(())
}

fn command_resolve(args: &ArgMatches) -> Result<(), ProvisioningError> {
    let mut config = load_config(args)?;
    apply_resolution_args(&mut config, args)?;
    let project = ProjectDescriptor::from_path(Path::new(
        args.value_of_os("project")
            .expect("arg should have been required"),
    ))?;
    let include_ui_tests = args.is_present("ui_tests");

    let (local, _) = local_source(&config, args)?;
    let inventory = AssetInventory::from_source(&local)?;

    let resolver = GroupResolver::new(&inventory, CompatibilityMatcher::new(Utc::now()));
    let mut layout = project.app_layout(include_ui_tests)?;
    config.apply_to_layout(&mut layout);
    let options = resolve_options(&config);
    let team_id = layout.team_id.as_deref();

    let groups = filter_for_distribution(
        filter_for_team(
            resolver.resolve_groups(
                &layout.entitlements_by_bundle_id,
                layout.platform,
                team_id,
                &options,
            ),
            team_id,
        ),
        options.distribution_type,
    );

    for (i, group) in groups.iter().enumerate() {
        println!("group {} ({:?}): {}", i, group.kind, group.certificate);
        for (bundle_id, profile) in &group.profiles {
            println!("  {}: {}", bundle_id, profile);
        }
    }

    match resolver.resolve_assets(&layout, &options, include_ui_tests)? {
        Ok(assets) => {
            println!("selected:");
            print_assets(&assets);
            Ok(())
        }
        Err(unresolved) => {
            if let Some(cert) = &unresolved.certificate {
                println!("closest certificate: {}", cert);
            }
            for bundle_id in unresolved.all_bundle_ids() {
                println!("  {}: unresolved", bundle_id);
            }

            Err(ProvisioningError::ResolutionIncomplete(
                unresolved.all_bundle_ids(),
            ))
        }
    }
}

fn command_select_strategy(args: &ArgMatches) -> Result<(), ProvisioningError> {
    let config = load_config(args)?;
    let project = ProjectDescriptor::from_path(Path::new(
        args.value_of_os("project")
            .expect("arg should have been required"),
    ))?;

    let authenticator = config.authenticator()?;

    let mut selector = StrategySelector::new(config.prefer_xcode_managed).probe_xcode_version();
    selector.min_profile_validity_days = config.min_profile_validity_days;

    if let Some(version) = selector.xcode_version {
        println!("Xcode version: {}", version);
    }

    let decision = selector.select(authenticator.kind(), &project);
    println!("strategy: {}", decision.strategy);
    println!("reason: {}", decision.reason);
    if let Some(warning) = decision.warning {
        println!("warning: {}", warning);
    }

    Ok(())
}

fn print_profile(profile: &ProvisioningProfile) {
    println!("{}", profile);
    println!("  type: {}", profile.profile_type());
    println!("  bundle id: {}", profile.bundle_id);
    if let Some(team_id) = &profile.team_id {
        println!("  team: {}", team_id);
    }
    println!("  state: {:?}", profile.state);
    println!("  expires: {}", profile.expires.to_rfc3339());
    println!("  certificates: {}", profile.certificate_serials.join(", "));
    if profile.provisions_all_devices {
        println!("  devices: all");
    } else if !profile.devices.is_empty() {
        println!("  devices: {}", profile.devices.len());
    }
    if profile.xcode_managed {
        println!("  managed by Xcode");
    }
}

fn command_list_profiles(args: &ArgMatches) -> Result<(), ProvisioningError> {
    let mut config = load_config(args)?;
    if let Some(path) = args.value_of_os("profiles_dir") {
        config.profiles_dir = Some(PathBuf::from(path));
    }

    let profile_type = match args.value_of("platform") {
        Some(platform) => Some(ProfileType::new(
            platform.parse()?,
            config.distribution_type(),
        )),
        None => None,
    };
    let name = args.value_of("name");

    let profiles = if args.is_present("remote") {
        let client = DeveloperPortalClient::new(
            config.authenticator()?,
            config.retry_policy(),
            config.timeout(),
        )?;

        client.list_profiles(&ProfileFilter {
            name: name.map(|s| s.to_string()),
            profile_type,
        })?
    } else {
        LocalAssetSource::new(Some(profiles_dir(&config)?))
            .list_profiles()?
            .into_iter()
            .filter(|p| name.map(|n| p.name == n).unwrap_or(true))
            .filter(|p| profile_type.map(|t| p.profile_type() == t).unwrap_or(true))
            .collect()
    };

    for profile in &profiles {
        print_profile(profile);
    }

    Ok(())
}

fn command_encode_app_store_connect_api_key(args: &ArgMatches) -> Result<(), ProvisioningError> {
    let issuer_id = args
        .value_of("issuer_id")
        .expect("arg should have been required");
    let key_id = args
        .value_of("key_id")
        .expect("arg should have been required");
    let private_key_path = Path::new(
        args.value_of_os("private_key_path")
            .expect("arg should have been required"),
    );

    let unified = UnifiedApiKey::from_ecdsa_pem_path(issuer_id, key_id, private_key_path)?;

    if let Some(output_path) = args.value_of_os("output_path") {
        let output_path = Path::new(output_path);

        eprintln!("writing unified key JSON to {}", output_path.display());
        unified.write_json_file(output_path)?;
        eprintln!(
            "consider auditing the file's access permissions to ensure its content remains secure"
        );
    } else {
        println!("{}", unified.to_json_string()?);
    }

    Ok(())
}

fn main_impl() -> Result<(), ProvisioningError> {
    let app = Command::new("rprovision")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Gregory Szorc <gregory.szorc@gmail.com>")
        .about("Resolve and create Apple code signing certificates and provisioning profiles")
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .multiple_occurrences(true)
                .help("Increase logging verbosity. Can be specified multiple times."),
        );

    let app = app.subcommand(
        Command::new("encode-app-store-connect-api-key")
            .about("Encode App Store Connect API Key metadata to a single file")
            .long_about(ENCODE_APP_STORE_CONNECT_API_KEY_ABOUT)
            .arg(
                Arg::new("output_path")
                    .short('o')
                    .long("output-path")
                    .takes_value(true)
                    .allow_invalid_utf8(true)
                    .help("Path to a JSON file to create the output to"),
            )
            .arg(
                Arg::new("issuer_id")
                    .required(true)
                    .help("The issuer of the API Token. Likely a UUID"),
            )
            .arg(
                Arg::new("key_id")
                    .required(true)
                    .help("The Key ID. A short alphanumeric string like DEADBEEF42"),
            )
            .arg(
                Arg::new("private_key_path")
                    .required(true)
                    .allow_invalid_utf8(true)
                    .help("Path to a file containing the private key downloaded from Apple"),
            ),
    );

    let app = app.subcommand(
        resolution_args(
            Command::new("ensure-assets")
                .about("Ensure code signing assets exist for a project")
                .long_about(ENSURE_ASSETS_ABOUT),
        )
        .arg(
            Arg::new("local_only")
                .long("local-only")
                .help("Only use assets on this machine; never contact the developer portal"),
        ),
    );

    let app = app.subcommand(
        Command::new("list-profiles")
            .about("List provisioning profiles")
            .arg(config_arg())
            .arg(distribution_arg())
            .arg(
                Arg::new("profiles_dir")
                    .long("profiles-dir")
                    .takes_value(true)
                    .allow_invalid_utf8(true)
                    .help("Directory provisioning profiles are read from"),
            )
            .arg(
                Arg::new("platform")
                    .long("platform")
                    .takes_value(true)
                    .possible_values(["ios", "tvos", "macos"])
                    .help("Only list profiles of this platform and the distribution type"),
            )
            .arg(
                Arg::new("name")
                    .long("name")
                    .takes_value(true)
                    .help("Only list profiles having this name"),
            )
            .arg(
                Arg::new("remote")
                    .long("remote")
                    .help("List profiles registered with the developer portal instead"),
            ),
    );

    let app = app.subcommand(
        resolution_args(
            Command::new("resolve")
                .about("Print the local assets that would sign a project")
                .long_about(RESOLVE_ABOUT),
        ),
    );

    let app = app.subcommand(
        Command::new("select-strategy")
            .about("Print whether Xcode or this tool should manage signing assets")
            .arg(project_arg())
            .arg(config_arg())
            .arg(distribution_arg()),
    );

    let matches = app.get_matches();

    let log_level = match matches.occurrences_of("verbose") {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );

    // Disable log context except at higher log levels.
    if log_level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_level(false)
            .format_target(false);
    }

    // HTTP plumbing is chatty at default level.
    if log_level == LevelFilter::Info {
        builder.filter_module("rustls", LevelFilter::Error);
        builder.filter_module("reqwest", LevelFilter::Error);
    }

    builder.init();

    match matches.subcommand() {
        Some(("encode-app-store-connect-api-key", args)) => {
            command_encode_app_store_connect_api_key(args)
        }
        Some(("ensure-assets", args)) => command_ensure_assets(args),
        Some(("list-profiles", args)) => command_list_profiles(args),
        Some(("resolve", args)) => command_resolve(args),
        Some(("select-strategy", args)) => command_select_strategy(args),
        _ => Err(ProvisioningError::CliUnknownCommand),
    }
}

fn main() {
    let exit_code = match main_impl() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {}", err);
            1
        }
    };

    std::process::exit(exit_code)
}
