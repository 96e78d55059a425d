// Simulation driver
//
// Usage:
//   ledger-sim
//   ledger-sim scenarios/bootstrap.yaml
//   ledger-sim scenarios/bootstrap.yaml --seed 42 --workers 8 --ticks 20000
//   ledger-sim --log sim.log --dump network.txt

use std::env;
use std::path::PathBuf;
use std::process;
use std::str::FromStr;

use log::{error, info, LevelFilter};
use simple_logger::SimpleLogger;

use ledger_sim::{ScenarioFile, ScenarioRunner, SimError};

#[derive(Debug, Default)]
struct Args {
    scenario: Option<PathBuf>,
    seed: Option<u64>,
    workers: Option<usize>,
    ticks: Option<u64>,
    log: Option<PathBuf>,
    dump: Option<PathBuf>,
}

fn usage(program: &str) -> ! {
    eprintln!(
        "Usage: {} [scenario.yaml] [--seed N] [--workers N] [--ticks N] [--log FILE] [--dump FILE]",
        program
    );
    eprintln!("\nExamples:");
    eprintln!("  {} scenarios/bootstrap.yaml", program);
    eprintln!("  {} --seed 42 --ticks 5000 --log sim.log", program);
    process::exit(1);
}

fn parse_value<T: FromStr>(program: &str, flag: &str, value: Option<String>) -> T {
    match value.as_deref().map(str::parse) {
        Some(Ok(v)) => v,
        _ => {
            eprintln!("Error: {} expects a value", flag);
            usage(program)
        }
    }
}

fn parse_args() -> Args {
    let mut raw = env::args();
    let program = raw.next().unwrap_or_else(|| "ledger-sim".to_string());
    let mut args = Args::default();

    while let Some(arg) = raw.next() {
        match arg.as_str() {
            "--seed" => args.seed = Some(parse_value(&program, "--seed", raw.next())),
            "--workers" => args.workers = Some(parse_value(&program, "--workers", raw.next())),
            "--ticks" => args.ticks = Some(parse_value(&program, "--ticks", raw.next())),
            "--log" => args.log = Some(parse_value(&program, "--log", raw.next())),
            "--dump" => args.dump = Some(parse_value(&program, "--dump", raw.next())),
            "-h" | "--help" => usage(&program),
            other if other.starts_with("--") => {
                eprintln!("Error: unknown option {}", other);
                usage(&program)
            }
            other => args.scenario = Some(PathBuf::from(other)),
        }
    }
    args
}

fn run(args: Args) -> Result<(), SimError> {
    let mut scenario = match &args.scenario {
        Some(path) => ScenarioFile::from_yaml_file(path)?,
        None => ScenarioFile::default(),
    };
    if let Some(seed) = args.seed {
        scenario.run.seed = Some(seed);
    }
    if let Some(workers) = args.workers {
        scenario.run.workers = workers;
    }
    if let Some(ticks) = args.ticks {
        scenario.run.ticks = ticks;
    }

    let mut runner = ScenarioRunner::new(scenario)?;
    let log_path = args.log.unwrap_or_else(|| PathBuf::from("simulation.log"));
    runner.controller().set_output_file(&log_path)?;

    let report = runner.run()?;
    runner.controller().flush_log();

    info!(
        "finished after {} ticks: {} nodes, {} links, {} proposals, top block {}",
        report.ticks, report.nodes, report.links, report.proposals, report.top_block
    );
    info!("event log written to {}", log_path.display());

    if let Some(dump) = args.dump {
        runner.controller().write_network_file(&dump)?;
        info!("network state written to {}", dump.display());
    }
    Ok(())
}

fn main() {
    if let Err(e) = SimpleLogger::new().with_level(LevelFilter::Info).init() {
        eprintln!("logger setup failed: {}", e);
    }

    let args = parse_args();
    if let Err(e) = run(args) {
        error!("simulation failed: {}", e);
        process::exit(1);
    }
}
