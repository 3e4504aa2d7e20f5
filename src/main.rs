//! steps-runner CLI Entry Point
//!
//! Provides the command-line interface used by the action's stage hooks
//! and by the interceptor steps inside the nested jobs.
//!
//! # Usage
//!
//! ```bash
//! # Install the nested runner, then run the Pre and Main stages
//! steps-runner run
//!
//! # Run a single stage (Post runs from the action's post hook)
//! steps-runner stage post
//!
//! # Step-side hook, called by the interceptor action
//! steps-runner interceptor main
//! ```

use std::env;
use std::process::ExitCode;

use log::{debug, info, LevelFilter};

use steps_runner::config::{InterceptorConfig, RunnerConfig, Verbosity};
use steps_runner::environment::{act, GithubContext};
use steps_runner::error::RunnerError;
use steps_runner::execution::Engine;
use steps_runner::interceptor::{run_hook, Hook};
use steps_runner::workflow::Stage;
use steps_runner::{APP_NAME, VERSION};

/// Subcommand parsed from arguments.
#[derive(Debug, PartialEq)]
enum Command {
    Run,
    Install,
    Stage(Stage),
    Interceptor(Hook),
}

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    command: Command,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(level: LevelFilter) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.as_str()))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: steps-runner [OPTIONS] <COMMAND>");
    println!();
    println!("Commands:");
    println!("  run                   Install the nested runner, run the Pre and Main stages");
    println!("  install               Install the pinned gh act extension");
    println!("  stage <pre|main|post> Run a single stage");
    println!("  interceptor <pre|main> Step-side hook of the interceptor action");
    println!();
    println!("Options:");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Configuration is read from the action environment (INPUT_STEPS, INPUT_TOKEN, ...).");
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut command = None;
    let mut verbose = false;
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => {
                verbose = true;
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ if command.is_some() => {
                return Err(format!("Unexpected argument: {}", arg));
            }
            "run" => command = Some(Command::Run),
            "install" => command = Some(Command::Install),
            "stage" | "interceptor" => {
                i += 1;
                let Some(value) = args.get(i) else {
                    return Err(format!("{} requires an argument", arg));
                };
                command = Some(if arg == "stage" {
                    Command::Stage(value.parse()?)
                } else {
                    Command::Interceptor(value.parse()?)
                });
            }
            _ => return Err(format!("Unknown command: {}", arg)),
        }
        i += 1;
    }

    let command = command.ok_or_else(|| "No command given".to_string())?;
    Ok(Config { command, verbose })
}

async fn run_stages(stages: &[Stage]) -> Result<(), RunnerError> {
    let config = RunnerConfig::from_env()?;
    debug!("Temp directory: {}", config.temp_dir.display());

    let engine = Engine::new(config);
    let mut context = GithubContext::from_env();
    for stage in stages {
        info!("Running {} stage", stage);
        engine.run_stage(*stage, &mut context).await?;
    }
    Ok(())
}

/// Main application entry point.
async fn run(config: Config) -> Result<(), RunnerError> {
    match config.command {
        Command::Run => {
            act::install(&RunnerConfig::from_env()?.token)?;
            run_stages(&[Stage::Pre, Stage::Main]).await
        }
        Command::Install => act::install(&RunnerConfig::from_env()?.token),
        Command::Stage(stage) => run_stages(&[stage]).await,
        Command::Interceptor(hook) => {
            let interceptor = InterceptorConfig::from_env()?;
            let mut context = GithubContext::from_env();
            run_hook(hook, &interceptor, &mut context).await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();

    let config = match parse_arguments(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    let level = if config.verbose {
        LevelFilter::Debug
    } else {
        Verbosity::from_env().level_filter()
    };
    setup_logging(level);

    if env::var("GITHUB_ACTIONS").is_ok_and(|value| value == "true") {
        colored::control::set_override(true);
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            println!("::error::{}", e);
            ExitCode::FAILURE
        }
    }
}
