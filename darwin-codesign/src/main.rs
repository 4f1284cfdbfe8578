// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    clap::{Arg, ArgMatches, Command},
    darwin_codesign::{
        app_store_connect::AppStoreConnectClient,
        config::{Config, NotaryConfig, SignConfig},
        cryptography::parse_pfx_data,
        notarization::{NotarizationOutcome, Notarizer},
        reader::{MachOReport, P12Report},
        signing_identity::{resolve_env_indirection, resolve_p12_data},
        DarwinCodesignError, SigningSettings, UnifiedSigner,
    },
    log::{warn, LevelFilter},
    std::path::{Path, PathBuf},
};

const SIGN_ABOUT: &str = "\
Sign a Mach-O binary in place.

Thin and universal binaries are supported. Every slice of a universal
binary is signed.

Without a PKCS#12 identity the binary is signed ad-hoc. With one, a CMS
signature is embedded and a time-stamp token is requested from the
configured server unless the server is `none`.

The signing certificate chain is checked for completeness before
anything is sent over the network. Pass
`--fail-without-full-chain false` to sign with an incomplete chain.

The file is only replaced once signing succeeded.
";

const NOTARIZE_ABOUT: &str = "\
Upload a signed binary to Apple's Notary API.

The binary is wrapped in a zip archive and uploaded. Unless waiting is
disabled, the submission is polled until Apple reaches a verdict. The
command fails unless the verdict is `Accepted`.

Credentials are an App Store Connect API key: the issuer id, the key id
and the private key. The private key may be a path, PEM content or
`env:NAME`.
";

/// Look up an argument that may be given at any subcommand depth.
fn global_value(matches: &ArgMatches, name: &str) -> Option<String> {
    let mut value = matches.value_of(name).map(|s| s.to_string());
    let mut current = matches;

    while let Some((_, sub)) = current.subcommand() {
        if let Some(v) = sub.value_of(name) {
            value = Some(v.to_string());
        }
        current = sub;
    }

    value
}

fn global_occurrences(matches: &ArgMatches, name: &str) -> u64 {
    let mut count = matches.occurrences_of(name);
    let mut current = matches;

    while let Some((_, sub)) = current.subcommand() {
        count = count.max(sub.occurrences_of(name));
        current = sub;
    }

    count
}

fn required<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a str, DarwinCodesignError> {
    args.value_of(name)
        .ok_or_else(|| DarwinCodesignError::CliBadArgument(format!("{} is required", name)))
}

fn parse_bool_arg(value: &str) -> Result<bool, DarwinCodesignError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(DarwinCodesignError::CliBadArgument(format!(
            "expected true or false; got {}",
            value
        ))),
    }
}

fn add_sign_args(app: Command) -> Command {
    app.arg(
        Arg::new("identity")
            .long("identity")
            .takes_value(true)
            .help("Identifier to record in the Code Directory. Defaults to the file name"),
    )
    .arg(
        Arg::new("p12")
            .long("p12")
            .takes_value(true)
            .help("PKCS#12 signing identity: a path, base64 content or env:NAME"),
    )
    .arg(
        Arg::new("password")
            .long("password")
            .takes_value(true)
            .help("Password of the PKCS#12 identity. May be env:NAME"),
    )
    .arg(
        Arg::new("ad_hoc")
            .long("ad-hoc")
            .help("Sign ad-hoc, ignoring any configured identity"),
    )
    .arg(
        Arg::new("timestamp_server")
            .long("timestamp-server")
            .takes_value(true)
            .help("Time-Stamp Protocol server URL, or none to disable time-stamping"),
    )
    .arg(
        Arg::new("fail_without_full_chain")
            .long("fail-without-full-chain")
            .takes_value(true)
            .possible_values(["true", "false"])
            .help("Whether an incomplete certificate chain fails signing"),
    )
    .arg(
        Arg::new("digest")
            .long("digest")
            .takes_value(true)
            .multiple_occurrences(true)
            .possible_values(["sha1", "sha256", "sha384"])
            .help("Digest algorithm of a Code Directory. The first is the primary"),
    )
    .arg(
        Arg::new("entitlements")
            .long("entitlements")
            .takes_value(true)
            .help("Path to an entitlements plist to embed"),
    )
    .arg(
        Arg::new("runtime")
            .long("runtime")
            .help("Enable the hardened runtime"),
    )
}

fn add_notary_args(app: Command) -> Command {
    app.arg(
        Arg::new("issuer")
            .long("issuer")
            .takes_value(true)
            .help("App Store Connect API key issuer id"),
    )
    .arg(
        Arg::new("key_id")
            .long("key-id")
            .takes_value(true)
            .help("App Store Connect API key id"),
    )
    .arg(
        Arg::new("private_key")
            .long("private-key")
            .takes_value(true)
            .help("App Store Connect API private key: a path, PEM content or env:NAME"),
    )
}

fn add_wait_args(app: Command) -> Command {
    app.arg(
        Arg::new("no_wait")
            .long("no-wait")
            .help("Return once uploaded instead of waiting for a verdict"),
    )
    .arg(
        Arg::new("max_wait_seconds")
            .long("max-wait-seconds")
            .takes_value(true)
            .help("Give up waiting on a verdict after this many seconds"),
    )
}

fn apply_sign_args(config: &mut SignConfig, args: &ArgMatches) -> Result<(), DarwinCodesignError> {
    if let Some(value) = args.value_of("identity") {
        config.identity = value.to_string();
    }
    if let Some(value) = args.value_of("p12") {
        config.p12 = value.to_string();
    }
    if let Some(value) = args.value_of("password") {
        config.password = value.to_string();
    }
    if args.is_present("ad_hoc") {
        config.ad_hoc = true;
    }
    if let Some(value) = args.value_of("timestamp_server") {
        config.timestamp_server = value.to_string();
    }
    if let Some(value) = args.value_of("fail_without_full_chain") {
        config.fail_without_full_chain = parse_bool_arg(value)?;
    }
    if let Some(values) = args.values_of("digest") {
        config.digests = values.map(|s| s.to_string()).collect();
    }
    if let Some(value) = args.value_of("entitlements") {
        config.entitlements = value.to_string();
    }
    if args.is_present("runtime") {
        config.runtime = true;
    }

    Ok(())
}

fn apply_notary_args(config: &mut NotaryConfig, args: &ArgMatches) {
    if let Some(value) = args.value_of("issuer") {
        config.issuer = value.to_string();
    }
    if let Some(value) = args.value_of("key_id") {
        config.key_id = value.to_string();
    }
    if let Some(value) = args.value_of("private_key") {
        config.private_key = value.to_string();
    }
}

fn apply_wait_args(config: &mut Config, args: &ArgMatches) -> Result<(), DarwinCodesignError> {
    if args.is_present("no_wait") {
        config.status.wait = false;
    }
    if let Some(value) = args.value_of("max_wait_seconds") {
        config.status.timeout_seconds = value.parse::<u64>().map_err(|_| {
            DarwinCodesignError::CliBadArgument(format!(
                "--max-wait-seconds expects a number; got {}",
                value
            ))
        })?;
    }

    Ok(())
}

fn notary_client(config: &Config) -> Result<AppStoreConnectClient, DarwinCodesignError> {
    AppStoreConnectClient::new(config.notary.token_encoder()?, config.notary.http_timeout())
}

fn notarizer(config: &Config) -> Result<Notarizer, DarwinCodesignError> {
    let poll = config.status.poll_settings();

    let notarizer = if config.dry_run {
        Notarizer::dry_run(poll)
    } else {
        Notarizer::new(notary_client(config)?, poll)
    };

    Ok(notarizer.with_upload_timeout(config.notary.upload_timeout()))
}

fn sign_with_config(config: &SignConfig, path: &Path) -> Result<(), DarwinCodesignError> {
    let identity = config.signing_identity()?;

    let mut settings = SigningSettings::from_identity(&identity);
    config.apply_to_settings(&mut settings)?;

    let mut signer = UnifiedSigner::new(settings);
    signer.set_fail_without_full_chain(config.fail_without_full_chain);

    warn!("signing {}", path.display());
    signer.sign_path_in_place(path)?;
    warn!("signed {}", path.display());

    Ok(())
}

fn notarize_with_config(config: &Config, path: &Path) -> Result<(), DarwinCodesignError> {
    let notarizer = notarizer(config)?;

    match notarizer.notarize_path(path, config.status.wait)? {
        NotarizationOutcome::Skipped => {}
        NotarizationOutcome::Submitted(submission) => {
            println!("{}", submission.id);
            warn!(
                "not waiting on submission; check it with `submission status {}`",
                submission.id
            );
        }
        NotarizationOutcome::Accepted(submission) => {
            println!("{} Accepted", submission.id);
        }
    }

    Ok(())
}

fn command_sign(config: &mut Config, args: &ArgMatches) -> Result<(), DarwinCodesignError> {
    apply_sign_args(&mut config.sign, args)?;
    let path = PathBuf::from(required(args, "path")?);

    sign_with_config(&config.sign, &path)
}

fn command_notarize(config: &mut Config, args: &ArgMatches) -> Result<(), DarwinCodesignError> {
    apply_notary_args(&mut config.notary, args);
    apply_wait_args(config, args)?;
    let path = PathBuf::from(required(args, "path")?);

    notarize_with_config(config, &path)
}

fn command_sign_and_notarize(
    config: &mut Config,
    args: &ArgMatches,
) -> Result<(), DarwinCodesignError> {
    apply_sign_args(&mut config.sign, args)?;
    apply_notary_args(&mut config.notary, args);
    apply_wait_args(config, args)?;
    if args.is_present("dry_run") {
        config.dry_run = true;
    }
    let path = PathBuf::from(required(args, "path")?);

    // Resolve credentials before signing so a misconfiguration leaves the
    // file alone.
    let notarizer = notarizer(config)?;

    sign_with_config(&config.sign, &path)?;

    match notarizer.notarize_path(&path, config.status.wait)? {
        NotarizationOutcome::Skipped => {}
        NotarizationOutcome::Submitted(submission) => println!("{}", submission.id),
        NotarizationOutcome::Accepted(submission) => println!("{} Accepted", submission.id),
    }

    Ok(())
}

fn command_submission_list(config: &Config) -> Result<(), DarwinCodesignError> {
    let client = notary_client(config)?;
    let submissions = client.list_submissions()?;

    println!("{:<36} {:<32} {:<12} CREATED", "ID", "NAME", "STATUS");
    for submission in submissions.data {
        println!(
            "{:<36} {:<32} {:<12} {}",
            submission.id,
            submission.attributes.name,
            submission.attributes.status,
            submission.attributes.created_date
        );
    }

    Ok(())
}

fn command_submission_status(
    config: &mut Config,
    args: &ArgMatches,
) -> Result<(), DarwinCodesignError> {
    if let Some(value) = args.value_of("max_wait_seconds") {
        config.status.timeout_seconds = value.parse::<u64>().map_err(|_| {
            DarwinCodesignError::CliBadArgument(format!(
                "--max-wait-seconds expects a number; got {}",
                value
            ))
        })?;
    }
    let id = required(args, "id")?;
    let client = notary_client(config)?;

    if args.is_present("wait") {
        let notarizer = Notarizer::new(client, config.status.poll_settings());
        let status = notarizer.wait_on_submission(id)?;
        println!("{} {}", id, status);
    } else {
        let submission = client.get_submission(id)?;
        println!(
            "{} {} {} {}",
            submission.data.id,
            submission.data.attributes.name,
            submission.data.attributes.status,
            submission.data.attributes.created_date
        );
    }

    Ok(())
}

fn command_submission_logs(config: &Config, args: &ArgMatches) -> Result<(), DarwinCodesignError> {
    let id = required(args, "id")?;
    let client = notary_client(config)?;

    let log = client.get_submission_log(id)?;
    println!("{}", serde_json::to_string_pretty(&log)?);

    Ok(())
}

fn command_submission(config: &mut Config, args: &ArgMatches) -> Result<(), DarwinCodesignError> {
    match args.subcommand() {
        Some(("list", sub)) => {
            apply_notary_args(&mut config.notary, sub);
            command_submission_list(config)
        }
        Some(("status", sub)) => {
            apply_notary_args(&mut config.notary, sub);
            command_submission_status(config, sub)
        }
        Some(("logs", sub)) => {
            apply_notary_args(&mut config.notary, sub);
            command_submission_logs(config, sub)
        }
        _ => Err(DarwinCodesignError::CliBadArgument(
            "unknown submission command".into(),
        )),
    }
}

fn command_describe(args: &ArgMatches) -> Result<(), DarwinCodesignError> {
    let path = required(args, "path")?;
    let data = std::fs::read(path)?;

    let report = MachOReport::from_data(&data)?;

    match args.value_of("output") {
        Some("json") => println!("{}", report.to_json()?),
        _ => print!("{}", report.to_text(args.is_present("detail"))),
    }

    Ok(())
}

fn command_p12_describe(args: &ArgMatches) -> Result<(), DarwinCodesignError> {
    let path = required(args, "path")?;
    let password = resolve_env_indirection(args.value_of("password").unwrap_or_default())?;

    let data = resolve_p12_data(path)?;
    let contents = parse_pfx_data(&data, &password)?;

    print!("{}", P12Report::from(&contents).to_text());

    Ok(())
}

fn command_p12(args: &ArgMatches) -> Result<(), DarwinCodesignError> {
    match args.subcommand() {
        Some(("describe", sub)) => command_p12_describe(sub),
        _ => Err(DarwinCodesignError::CliBadArgument(
            "unknown p12 command".into(),
        )),
    }
}

fn main_impl() -> Result<(), DarwinCodesignError> {
    let app = Command::new("Cross platform Darwin code signing and notarization")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Sign and notarize Mach-O binaries from any platform")
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .multiple_occurrences(true)
                .help("Increase logging verbosity. Can be specified multiple times."),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .takes_value(true)
                .help("Path to a YAML configuration file"),
        );

    let app = app.subcommand(add_sign_args(
        Command::new("sign")
            .about("Sign a Mach-O binary in place")
            .long_about(SIGN_ABOUT)
            .arg(
                Arg::new("path")
                    .required(true)
                    .help("Path to the Mach-O binary to sign"),
            ),
    ));

    let app = app.subcommand(add_wait_args(add_notary_args(
        Command::new("notarize")
            .about("Notarize a signed Mach-O binary")
            .long_about(NOTARIZE_ABOUT)
            .arg(
                Arg::new("path")
                    .required(true)
                    .help("Path to the signed Mach-O binary to notarize"),
            ),
    )));

    let app = app.subcommand(add_wait_args(add_notary_args(add_sign_args(
        Command::new("sign-and-notarize")
            .about("Sign a Mach-O binary in place, then notarize it")
            .arg(
                Arg::new("path")
                    .required(true)
                    .help("Path to the Mach-O binary to sign and notarize"),
            )
            .arg(
                Arg::new("dry_run")
                    .long("dry-run")
                    .help("Sign but only log the notarization that would happen"),
            ),
    ))));

    let app = app.subcommand(
        Command::new("submission")
            .about("Inspect Notary API submissions")
            .subcommand_required(true)
            .arg_required_else_help(true)
            .subcommand(add_notary_args(
                Command::new("list").about("List previous submissions"),
            ))
            .subcommand(add_notary_args(
                Command::new("status")
                    .about("Print the status of a submission")
                    .arg(Arg::new("id").required(true).help("Submission id"))
                    .arg(
                        Arg::new("wait")
                            .long("wait")
                            .help("Poll until the submission reaches a verdict"),
                    )
                    .arg(
                        Arg::new("max_wait_seconds")
                            .long("max-wait-seconds")
                            .takes_value(true)
                            .requires("wait")
                            .help("Give up waiting after this many seconds"),
                    ),
            ))
            .subcommand(add_notary_args(
                Command::new("logs")
                    .about("Print the developer log of a submission")
                    .arg(Arg::new("id").required(true).help("Submission id")),
            )),
    );

    let app = app.subcommand(
        Command::new("describe")
            .about("Describe the structure and signature of a Mach-O binary")
            .arg(
                Arg::new("path")
                    .required(true)
                    .help("Path to the Mach-O binary to examine"),
            )
            .arg(
                Arg::new("output")
                    .short('o')
                    .long("output")
                    .takes_value(true)
                    .possible_values(["text", "json"])
                    .default_value("text")
                    .help("Output format"),
            )
            .arg(
                Arg::new("detail")
                    .long("detail")
                    .help("Include load commands, blobs and digests in text output"),
            ),
    );

    let app = app.subcommand(
        Command::new("p12")
            .about("Inspect PKCS#12 containers")
            .subcommand_required(true)
            .arg_required_else_help(true)
            .subcommand(
                Command::new("describe")
                    .about("Print the certificates in a PKCS#12 container")
                    .arg(
                        Arg::new("path")
                            .required(true)
                            .help("PKCS#12 source: a path, base64 content or env:NAME"),
                    )
                    .arg(
                        Arg::new("password")
                            .long("password")
                            .takes_value(true)
                            .help("Password of the container. May be env:NAME"),
                    ),
            ),
    );

    let matches = app.get_matches();

    let log_level = match global_occurrences(&matches, "verbose") {
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

    // This spews unwanted output at default level. Nerf it by default.
    if log_level == LevelFilter::Info {
        builder.filter_module("rustls", LevelFilter::Error);
    }

    builder.init();

    let config_path = global_value(&matches, "config").map(PathBuf::from);

    // Describing files needs no configuration.
    match matches.subcommand() {
        Some(("describe", args)) => return command_describe(args),
        Some(("p12", args)) => return command_p12(args),
        _ => {}
    }

    let mut config = Config::load(config_path.as_deref())?;

    match matches.subcommand() {
        Some(("sign", args)) => command_sign(&mut config, args),
        Some(("notarize", args)) => command_notarize(&mut config, args),
        Some(("sign-and-notarize", args)) => command_sign_and_notarize(&mut config, args),
        Some(("submission", args)) => command_submission(&mut config, args),
        _ => Err(DarwinCodesignError::CliBadArgument(
            "unknown command".into(),
        )),
    }
}

fn main() {
    let exit_code = match main_impl() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {}", err);
            err.category().exit_code()
        }
    };

    std::process::exit(exit_code)
}
