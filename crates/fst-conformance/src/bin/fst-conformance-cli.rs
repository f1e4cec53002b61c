#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;

use fst_conformance::{HarnessConfig, aggregate_fixture, load_fixtures, run_suite, write_report};
use tracing_subscriber::EnvFilter;

struct CliArgs {
    case_filter: Option<String>,
    fixture_root: Option<PathBuf>,
    report: Option<PathBuf>,
    dump: bool,
    skip_wire: bool,
    require_green: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(error) => {
            eprintln!("fst-conformance-cli error: {error}");
            ExitCode::from(2)
        }
    }
}

fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let Some(args) = parse_args()? else {
        return Ok(true);
    };

    let mut config = HarnessConfig::default_paths();
    if let Some(root) = args.fixture_root {
        config.fixture_root = root;
    }
    config.check_wire = !args.skip_wire;

    if args.dump {
        for fixture in load_fixtures(&config, args.case_filter.as_deref())? {
            let result = aggregate_fixture(&fixture)?;
            println!("{}", fst_wire::to_json_string(&result.statistics)?);
        }
        return Ok(true);
    }

    let report = run_suite(&config, args.case_filter.as_deref())?;
    for result in &report.results {
        println!(
            "case={} status={:?} issues={}",
            result.case_id, result.status, result.issue_count
        );
        for mismatch in &result.mismatches {
            println!("  mismatch: {mismatch}");
        }
    }
    println!(
        "fixtures={} passed={} failed={} green={}",
        report.fixture_count,
        report.passed,
        report.failed,
        report.is_green()
    );

    if let Some(path) = args.report {
        write_report(&path, &report)?;
        println!("wrote report={}", path.display());
    }

    Ok(!args.require_green || report.is_green())
}

fn parse_args() -> Result<Option<CliArgs>, Box<dyn std::error::Error>> {
    let mut out = CliArgs {
        case_filter: None,
        fixture_root: None,
        report: None,
        dump: false,
        skip_wire: false,
        require_green: false,
    };

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--case" => {
                out.case_filter = Some(args.next().ok_or("--case requires a case id")?);
            }
            "--fixtures" => {
                out.fixture_root = Some(PathBuf::from(
                    args.next().ok_or("--fixtures requires a directory")?,
                ));
            }
            "--report" => {
                out.report = Some(PathBuf::from(args.next().ok_or("--report requires a path")?));
            }
            "--dump" => out.dump = true,
            "--skip-wire" => out.skip_wire = true,
            "--require-green" => out.require_green = true,
            "--help" | "-h" => {
                print_help();
                return Ok(None);
            }
            other => return Err(format!("unknown argument: {other}").into()),
        }
    }
    Ok(Some(out))
}

fn print_help() {
    println!(
        "fst-conformance-cli\n\
         Usage:\n\
         \tfst-conformance-cli [--case <id>] [--fixtures <dir>] [--report <path>] [--dump] [--require-green]\n\
         Options:\n\
         \t--case <id>        Run only one fixture case\n\
         \t--fixtures <dir>   Fixture directory (default: crates/fst-conformance/fixtures)\n\
         \t--report <path>    Write the suite report as JSON\n\
         \t--dump             Print the aggregated statistics of each fixture as JSON\n\
         \t--skip-wire        Skip the protobuf round-trip check\n\
         \t--require-green    Exit non-zero when any fixture fails\n\
         \t-h, --help         Show this help\n\
         Logging is controlled with RUST_LOG (default: warn)."
    );
}
