use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, LevelFilter};

use ffa_memval::config::Config;
use ffa_memval::suite::{self, TestEnv};

/// FF-A memory management conformance validator
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// FF-A manifest (flattened device tree) overriding the default layout
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Run only this test; repeat to run several
    #[arg(long = "test", value_name = "NAME")]
    tests: Vec<String>,

    /// Print the test catalogue and exit
    #[arg(long)]
    list: bool,

    /// -v shows every ABI call, -vv everything
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    match verbose {
        0 => {}
        1 => {
            builder.filter_level(LevelFilter::Debug);
        }
        _ => {
            builder.filter_level(LevelFilter::Trace);
        }
    }
    builder.format_timestamp(None).init();
}

fn load_config(manifest: Option<&PathBuf>) -> Result<Config> {
    let Some(path) = manifest else {
        return Ok(Config::default());
    };
    let blob = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Config::from_manifest(&blob).with_context(|| format!("parsing {}", path.display()))
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(args.verbose);

    if args.list {
        for test in suite::all() {
            println!("{}", test.name);
        }
        return Ok(ExitCode::SUCCESS);
    }

    let config = load_config(args.manifest.as_ref())?;
    config.validate()?;

    let tests = if args.tests.is_empty() {
        suite::all().iter().collect::<Vec<_>>()
    } else {
        args.tests
            .iter()
            .map(|name| suite::find(name).with_context(|| format!("no test named {}", name)))
            .collect::<Result<Vec<_>>>()?
    };

    info!(
        "client {:#06x}, server {:#06x}, {} test(s)",
        config.client_id,
        config.server_id,
        tests.len()
    );
    let env = TestEnv::with_stub(config);
    let summary = suite::run_all(&env, tests);

    Ok(if summary.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
