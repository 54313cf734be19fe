//! Stepledger CLI Entry Point
//!
//! Inspects a workflow ledger captured from a continuation request.
//!
//! # Usage
//!
//! ```bash
//! # Print the records of a captured continuation body
//! stepledger body.json
//!
//! # Label the output with the run id
//! stepledger body.json --workflow-id wf3f2a
//!
//! # Include decoding details
//! stepledger body.json --verbose
//! ```

use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::process::ExitCode;

use colored::Colorize;
use log::{debug, error, info, warn};

use stepledger::execution::{ParallelCallState, ParallelGroup};
use stepledger::workflow::{decode_ledger, Ledger, Step, StepRole};
use stepledger::{APP_NAME, VERSION};

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default, PartialEq)]
struct Config {
    ledger_path: Option<String>,
    workflow_id: Option<String>,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
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

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Workflow Ledger Inspector");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: stepledger [OPTIONS] <LEDGER_FILE>");
    println!();
    println!("Arguments:");
    println!("  <LEDGER_FILE>        Continuation body: JSON array of encoded steps");
    println!();
    println!("Options:");
    println!("  --workflow-id ID     Label the output with a workflow run id");
    println!("  --verbose            Enable debug logging");
    println!("  --help               Show this help message");
    println!("  --version            Show version information");
    println!();
    println!("Examples:");
    println!("  stepledger body.json");
    println!("  stepledger body.json --workflow-id wf3f2a --verbose");
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
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
                config.verbose = true;
            }
            "--workflow-id" => {
                i += 1;
                if i >= args.len() {
                    return Err("--workflow-id requires an id argument".to_string());
                }
                config.workflow_id = Some(args[i].clone());
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.ledger_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.ledger_path = Some(arg.clone());
            }
        }
        i += 1;
    }

    if config.ledger_path.is_none() {
        return Err("Missing <LEDGER_FILE> argument".to_string());
    }

    Ok(config)
}

/// Reads and decodes a ledger file.
fn load_ledger(path: &str) -> Result<Ledger, Box<dyn std::error::Error>> {
    let body = fs::read_to_string(path)
        .map_err(|e| format!("Could not read ledger from '{}': {}", path, e))?;
    let steps = decode_ledger(&body)?;
    debug!("Decoded {} record(s) from {}", steps.len(), path);
    Ok(Ledger::new(steps))
}

/// Finds the `(concurrent, target_step)` of every parallel group.
///
/// Results name their group directly. Groups known only from plans start
/// at their lowest planned position.
fn parallel_groups(ledger: &Ledger) -> Vec<(usize, usize)> {
    let mut groups: BTreeSet<(usize, usize)> = ledger
        .steps()
        .iter()
        .filter(|s| s.is_result() && s.concurrent > 1)
        .map(|s| (s.target_step, s.concurrent))
        .collect();

    let mut plans: Vec<(usize, usize)> = ledger
        .plans()
        .map(|s| (s.target_step, s.concurrent))
        .collect();
    plans.sort_unstable();

    for (position, concurrent) in plans {
        let covered = groups
            .iter()
            .any(|&(start, k)| k == concurrent && position >= start && position < start + k);
        if !covered {
            groups.insert((position, concurrent));
        }
    }

    groups.into_iter().map(|(start, k)| (k, start)).collect()
}

fn role_label(step: &Step) -> colored::ColoredString {
    match step.role() {
        StepRole::Init => "init  ".blue(),
        StepRole::Plan => "plan  ".yellow(),
        StepRole::Result if step.settles() => "result".green(),
        StepRole::Result => "call  ".magenta(),
    }
}

fn print_records(ledger: &Ledger) {
    println!("{}", "Records".bold());
    for (index, step) in ledger.steps().iter().enumerate() {
        let out = step
            .out
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "-".dimmed().to_string());
        println!("  {:>3}  {}  {}  {}", index, role_label(step), step.summary(), out);
    }
    println!();
}

fn print_groups(ledger: &Ledger) -> Result<(), Box<dyn std::error::Error>> {
    let groups = parallel_groups(ledger);
    if groups.is_empty() {
        return Ok(());
    }

    println!("{}", "Parallel groups".bold());
    for (concurrent, target) in groups {
        let group = ParallelGroup::collect(concurrent, target, ledger)?;
        let state = match group.classify(ledger) {
            ParallelCallState::Last => "last".green(),
            ParallelCallState::First => "first".cyan(),
            ParallelCallState::Partial { .. } => "partial".yellow(),
            ParallelCallState::Discard => "discard".dimmed(),
        };
        println!(
            "  positions {}..{}  settled {}/{}  trigger: {}",
            target,
            target + concurrent - 1,
            group.settled_count(),
            concurrent,
            state
        );
    }
    println!();
    Ok(())
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    let path = config.ledger_path.unwrap_or_default();
    info!("Loading ledger: {}", path);
    let ledger = load_ledger(&path).map_err(|e| {
        error!("Failed to load ledger: {}", e);
        e
    })?;

    if let Some(id) = &config.workflow_id {
        info!("Workflow run: {}", id);
    }
    info!("{} record(s), highest step {}", ledger.len(), ledger.max_step_id());
    println!();

    print_records(&ledger);

    match ledger.validate() {
        Ok(()) => info!("{}", "Ledger is consistent".green()),
        Err(e) => {
            warn!("{}", e);
            return Err(e.into());
        }
    }

    if ledger.is_redundant_trigger() {
        warn!("Last record repeats an earlier one; its delivery would be discarded");
    }

    print_groups(&ledger)
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepledger::workflow::{encode_ledger, StepType};
    use tempfile::tempdir;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("stepledger")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_arguments() {
        let config = parse_arguments(&args(&["body.json", "--workflow-id", "wf1", "-v"])).unwrap();
        assert_eq!(config.ledger_path.as_deref(), Some("body.json"));
        assert_eq!(config.workflow_id.as_deref(), Some("wf1"));
        assert!(config.verbose);
    }

    #[test]
    fn test_parse_arguments_errors() {
        assert!(parse_arguments(&args(&[])).is_err());
        assert!(parse_arguments(&args(&["a.json", "b.json"])).is_err());
        assert!(parse_arguments(&args(&["a.json", "--workflow-id"])).is_err());
        assert!(parse_arguments(&args(&["a.json", "--bogus"])).is_err());
    }

    #[test]
    fn test_load_ledger_from_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("body.json");
        let steps = vec![
            Step::init(json!({"foo": "bar"})),
            Step::new(1, "a", StepType::Run, 1, 1).with_out(json!(1)),
        ];
        std::fs::write(&path, encode_ledger(&steps).unwrap()).unwrap();

        let ledger = load_ledger(path.to_str().unwrap()).unwrap();
        assert_eq!(ledger.steps(), steps.as_slice());
    }

    #[test]
    fn test_load_ledger_missing_file() {
        assert!(load_ledger("/nonexistent/body.json").is_err());
    }

    #[test]
    fn test_parallel_groups() {
        let ledger = Ledger::new(vec![
            Step::init(json!(null)),
            Step::new(0, "a", StepType::Run, 2, 1),
            Step::new(0, "b", StepType::Run, 2, 2),
            Step::new(2, "b", StepType::Run, 2, 1).with_out(json!("b")),
            Step::new(3, "c", StepType::Run, 1, 3).with_out(json!("c")),
            Step::new(0, "d", StepType::Run, 3, 4),
            Step::new(0, "e", StepType::Run, 3, 5),
        ]);

        assert_eq!(parallel_groups(&ledger), vec![(2, 1), (3, 4)]);
    }
}
