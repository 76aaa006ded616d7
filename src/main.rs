//! `isoprobe`: runs the isolation matrix against one target and prints the
//! report.
//!
//! Exit codes: 0 when every scenario ran (whatever the verdicts), 1 when the
//! target could not be prepared, 2 on configuration errors.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Arg, ArgAction, ArgMatches, Command};
use tracing_subscriber::filter::LevelFilter;

use isoprobe::{IsolationLevel, ProbeConfig, ProbeError, Runner, ScenarioKind, backend};

fn build_cli() -> Command {
    Command::new("isoprobe")
        .about("Probe the observable behaviour of transaction isolation levels")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_name("FILE")
                .help("TOML configuration file"),
        )
        .arg(
            Arg::new("target")
                .long("target")
                .value_name("BACKEND")
                .help("Target backend: memory or sqlite"),
        )
        .arg(
            Arg::new("sqlite-path")
                .long("sqlite-path")
                .value_name("PATH")
                .help("Database file of the sqlite target"),
        )
        .arg(
            Arg::new("level")
                .long("level")
                .short('l')
                .action(ArgAction::Append)
                .help("Isolation level to probe (repeatable, default: all)"),
        )
        .arg(
            Arg::new("scenario")
                .long("scenario")
                .short('s')
                .action(ArgAction::Append)
                .help("Scenario to run (repeatable, default: all)"),
        )
        .arg(
            Arg::new("rounds")
                .long("rounds")
                .value_parser(clap::value_parser!(usize))
                .help("Run the whole matrix this many times"),
        )
        .arg(
            Arg::new("handshake")
                .long("handshake")
                .action(ArgAction::SetTrue)
                .help("Exchange explicit cues between workers on top of the delays"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .action(ArgAction::SetTrue)
                .help("Print the report as JSON"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .action(ArgAction::Count)
                .conflicts_with("quiet")
                .help("More log output (-vv for trace)"),
        )
        .arg(
            Arg::new("quiet")
                .long("quiet")
                .short('q')
                .action(ArgAction::SetTrue)
                .help("Only log warnings and errors"),
        )
}

fn init_logging(matches: &ArgMatches) {
    let level = if matches.get_flag("quiet") {
        LevelFilter::WARN
    } else {
        match matches.get_count("verbose") {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Defaults, then the config file, then the environment, then flags.
fn load_config(matches: &ArgMatches) -> Result<ProbeConfig, ProbeError> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => ProbeConfig::load(&PathBuf::from(path))?,
        None => ProbeConfig::default(),
    };
    config.apply_process_env()?;

    if let Some(target) = matches.get_one::<String>("target") {
        config.target.backend = target.parse()?;
    }
    if let Some(path) = matches.get_one::<String>("sqlite-path") {
        config.target.sqlite_path = Some(PathBuf::from(path));
    }
    if let Some(levels) = matches.get_many::<String>("level") {
        config.levels = levels
            .map(|level| level.parse::<IsolationLevel>())
            .collect::<Result<_, _>>()?;
    }
    if let Some(scenarios) = matches.get_many::<String>("scenario") {
        config.scenarios = scenarios
            .map(|scenario| scenario.parse::<ScenarioKind>())
            .collect::<Result<_, _>>()?;
    }
    if let Some(rounds) = matches.get_one::<usize>("rounds") {
        config.runner.rounds = *rounds;
    }
    if matches.get_flag("handshake") {
        config.timing.handshake = true;
    }
    config.validate()?;
    Ok(config)
}

fn main() {
    let matches = build_cli().get_matches();
    init_logging(&matches);

    let config = match load_config(&matches) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("{e}");
            process::exit(2);
        }
    };

    let factory = match backend::build_factory(&config) {
        Ok(factory) => factory,
        Err(e) => {
            eprintln!("{e}");
            let code = if matches!(e, ProbeError::Configuration(_)) { 2 } else { 1 };
            process::exit(code);
        }
    };

    let report = Runner::new(Arc::clone(&config), factory).run();
    if matches.get_flag("json") {
        match report.to_json() {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("{e}");
                process::exit(1);
            }
        }
    } else {
        println!("{report}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let matches = build_cli()
            .try_get_matches_from([
                "isoprobe",
                "--level",
                "serializable",
                "-l",
                "read_committed",
                "--scenario",
                "phantom",
                "--rounds",
                "3",
            ])
            .unwrap();
        let config = load_config(&matches).unwrap();
        assert_eq!(
            config.levels,
            vec![IsolationLevel::Serializable, IsolationLevel::ReadCommitted]
        );
        assert_eq!(config.scenarios, vec![ScenarioKind::PhantomRead]);
        assert_eq!(config.runner.rounds, 3);
    }

    #[test]
    fn unknown_level_is_a_configuration_error() {
        let matches = build_cli()
            .try_get_matches_from(["isoprobe", "--level", "snapshot"])
            .unwrap();
        assert!(matches!(
            load_config(&matches),
            Err(ProbeError::Configuration(_))
        ));
    }

    #[test]
    fn verbose_and_quiet_conflict() {
        assert!(build_cli().try_get_matches_from(["isoprobe", "-v", "-q"]).is_err());
    }
}
