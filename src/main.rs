use std::fs;
use std::io::stdout;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{crate_version, Arg, Command};

use govcs_gen::cache::{CacheDirs, OverrideStore};
use govcs_gen::config::GeneratorConfig;
use govcs_gen::driver::ResolutionDriver;
use govcs_gen::emit;
use govcs_gen::vanity::ReqwestVanityProbe;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn clap() -> Command {
    Command::new("govcs-gen")
        .version(crate_version!())
        .about("resolves go.mod/go.sum dependencies to verified VCS commits")
        .infer_subcommands(true)
        .subcommand_required(true)
        .subcommand(
            Command::new("generate")
                .about("resolve a module's dependencies and emit JSON")
                .arg(
                    Arg::new("go-mod")
                        .long("go-mod")
                        .required(true)
                        .value_parser(clap::value_parser!(PathBuf))
                        .help("path to go.mod"),
                )
                .arg(
                    Arg::new("go-sum")
                        .long("go-sum")
                        .value_parser(clap::value_parser!(PathBuf))
                        .help("path to go.sum, if available"),
                )
                .arg(
                    Arg::new("out")
                        .short('o')
                        .long("out")
                        .value_parser(clap::value_parser!(PathBuf))
                        .help("output file (defaults to stdout)"),
                )
                .arg(
                    Arg::new("jobs")
                        .short('j')
                        .long("jobs")
                        .value_parser(clap::value_parser!(usize))
                        .help("verification worker count (0 = sequential)"),
                )
                .arg(
                    Arg::new("discovery")
                        .long("discovery")
                        .value_parser(clap::value_parser!(PathBuf))
                        .help("optional pre-computed discovery JSON, short-circuiting module-proxy lookups"),
                ),
        )
        .subcommand(
            Command::new("set-repo")
                .about("pin a module (optionally at a version) to a specific repository URL")
                .arg(Arg::new("module").required(true))
                .arg(Arg::new("url").required(true))
                .arg(Arg::new("version").long("version").short('v')),
        )
        .subcommand(
            Command::new("clear-repo")
                .about("remove a pinned repository override")
                .arg(Arg::new("module").required(true))
                .arg(Arg::new("version").long("version").short('v')),
        )
}

fn run_generate(matches: &clap::ArgMatches) -> Result<()> {
    let mut config = GeneratorConfig::from_env();
    if let Some(jobs) = matches.get_one::<usize>("jobs") {
        config.jobs = *jobs;
    }

    let go_mod_path = matches.get_one::<PathBuf>("go-mod").unwrap();
    let go_mod = fs::read_to_string(go_mod_path)
        .with_context(|| format!("reading {}", go_mod_path.display()))?;
    let go_sum = match matches.get_one::<PathBuf>("go-sum") {
        Some(path) => {
            Some(fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?)
        }
        None => None,
    };

    let requirements = ResolutionDriver::build_module_list(&go_mod, go_sum.as_deref());
    tracing::info!(count = requirements.len(), "resolving module list");

    let discovery = match matches.get_one::<PathBuf>("discovery") {
        Some(path) => govcs_gen::cache::load_discovery_file(path)
            .with_context(|| format!("reading discovery file {}", path.display()))?,
        None => Vec::new(),
    };

    let driver = ResolutionDriver::new(config)?;
    let probe = ReqwestVanityProbe::new()?;
    let outcome = driver.run(requirements, &probe, &discovery)?;

    tracing::info!(
        resolved = outcome.records.len(),
        skipped = outcome.skipped.len(),
        "resolution complete"
    );

    let run = emit::build_run(&outcome.records, &outcome.skipped);
    match matches.get_one::<PathBuf>("out") {
        Some(path) => {
            let mut file =
                fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;
            emit::write_json(&run, &mut file)?;
        }
        None => emit::write_json(&run, &mut stdout())?,
    }

    Ok(())
}

fn run_set_repo(matches: &clap::ArgMatches) -> Result<()> {
    let config = GeneratorConfig::from_env();
    let dirs = CacheDirs::new(config.cache_base.clone())?;
    let mut overrides =
        OverrideStore::load(dirs.manual_overrides_path(), dirs.dynamic_overrides_path());

    let module = matches.get_one::<String>("module").unwrap();
    let url = matches.get_one::<String>("url").unwrap();
    let version = matches.get_one::<String>("version").map(String::as_str);

    overrides.set_repo(module, version, url);
    overrides.save()?;
    Ok(())
}

fn run_clear_repo(matches: &clap::ArgMatches) -> Result<()> {
    let config = GeneratorConfig::from_env();
    let dirs = CacheDirs::new(config.cache_base.clone())?;
    let mut overrides =
        OverrideStore::load(dirs.manual_overrides_path(), dirs.dynamic_overrides_path());

    let module = matches.get_one::<String>("module").unwrap();
    let version = matches.get_one::<String>("version").map(String::as_str);

    overrides.clear_repo(module, version);
    overrides.save()?;
    Ok(())
}

fn main() -> Result<()> {
    init_tracing();

    let matches = clap().get_matches();
    match matches.subcommand() {
        Some(("generate", sub)) => run_generate(sub),
        Some(("set-repo", sub)) => run_set_repo(sub),
        Some(("clear-repo", sub)) => run_clear_repo(sub),
        _ => unreachable!("subcommand_required guarantees one of the above matched"),
    }
}
