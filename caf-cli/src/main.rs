use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};

use caf_core::generate::default_concurrency;
use caf_core::localize::FluentLoc;
use caf_core::size::{parse_disk_usage, SizeSpec};
use caf_core::{
    CollisionPolicy, FileStatus, GenerationEngine, GenerationRequest, VerificationEngine,
    VerifyOptions,
};

/// Applied when neither `--max-files` nor `--max-disk-usage` is given.
const DEFAULT_MAX_FILES: u64 = 100;

#[derive(Parser)]
#[command(name = "caf", version, about = "Generate and verify content-addressed random files")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    /// Log debug detail
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Cmd {
    /// Fill a directory with random files named by their BLAKE3 digest
    Gen(GenArgs),
    /// Re-hash every file in a directory's manifest
    Verify(VerifyArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OnCollision {
    Suffix,
    Fail,
}

impl From<OnCollision> for CollisionPolicy {
    fn from(v: OnCollision) -> Self {
        match v {
            OnCollision::Suffix => CollisionPolicy::Suffix,
            OnCollision::Fail => CollisionPolicy::Fail,
        }
    }
}

#[derive(Args)]
struct GenArgs {
    #[arg(short, long, default_value = ".")]
    dir: PathBuf,
    #[arg(short = 'm', long)]
    max_files: Option<u64>,
    /// Total bytes to write, e.g. 512m or 2g
    #[arg(short = 'u', long, value_parser = parse_usage)]
    max_disk_usage: Option<u64>,
    /// Fixed size, min-max range, or distribution (type=lognormal,mean=1m,stddev=256k)
    #[arg(short = 's', long, default_value = "4048", value_parser = parse_spec)]
    file_size: SizeSpec,
    #[arg(short = 'j', long, default_value_t = default_concurrency())]
    jobs: usize,
    #[arg(long)]
    seed: Option<u64>,
    /// Add to an existing manifest
    #[arg(long)]
    append: bool,
    #[arg(long, value_enum, default_value_t = OnCollision::Suffix)]
    on_collision: OnCollision,
    /// Sync each file to disk before recording it
    #[arg(long)]
    fsync: bool,
    #[arg(long)]
    progress: bool,
}

#[derive(Args)]
struct VerifyArgs {
    #[arg(short, long, default_value = ".")]
    dir: PathBuf,
    #[arg(short = 'j', long, default_value_t = default_concurrency())]
    jobs: usize,
    /// Fail on files the manifest does not list
    #[arg(long)]
    strict: bool,
    /// Print the report as JSON
    #[arg(long)]
    json: bool,
    #[arg(long)]
    progress: bool,
}

fn parse_spec(s: &str) -> std::result::Result<SizeSpec, String> {
    s.parse::<SizeSpec>().map_err(|e| e.to_string())
}

fn parse_usage(s: &str) -> std::result::Result<u64, String> {
    parse_disk_usage(s).map_err(|e| e.to_string())
}

fn init_logging(cli: &Cli) {
    let default_level = if cli.quiet {
        "warn"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp(None)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);
    let loc = FluentLoc::default();
    let outcome = match cli.cmd {
        Cmd::Gen(args) => gen(args, &loc).map(|()| true),
        Cmd::Verify(args) => verify(args, &loc),
    };
    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn gen(args: GenArgs, loc: &FluentLoc) -> Result<()> {
    let mut req = GenerationRequest::new(&args.dir);
    req.size_spec = args.file_size;
    req.max_files = args.max_files;
    req.max_disk_usage = args.max_disk_usage;
    if req.max_files.is_none() && req.max_disk_usage.is_none() {
        log::info!("no limit given, defaulting to {DEFAULT_MAX_FILES} files");
        req.max_files = Some(DEFAULT_MAX_FILES);
    }
    req.concurrency = args.jobs;
    req.seed = args.seed;
    req.on_collision = args.on_collision.into();
    req.append = args.append;
    req.fsync = args.fsync;
    req.progress = args.progress;

    let report = GenerationEngine::run(&req)
        .with_context(|| format!("generating files in {}", args.dir.display()))?;

    println!(
        "{}",
        loc.msg(
            "gen-summary",
            &[
                ("files", &report.files_created.to_string()),
                ("bytes", &report.bytes_written.to_string()),
                ("dir", &args.dir.display().to_string()),
            ],
        )
    );
    log::info!("{}", loc.msg("gen-seed", &[("seed", &report.seed.to_string())]));
    if report.collisions > 0 {
        log::info!("{}", loc.msg("gen-collisions", &[("count", &report.collisions.to_string())]));
    }
    if report.failed_writes > 0 {
        log::warn!("{}", loc.msg("gen-failures", &[("count", &report.failed_writes.to_string())]));
    }
    Ok(())
}

/// Returns whether the directory passed.
fn verify(args: VerifyArgs, loc: &FluentLoc) -> Result<bool> {
    let opts = VerifyOptions { concurrency: args.jobs, strict: args.strict, progress: args.progress };
    let report = VerificationEngine::run(&args.dir, &opts)
        .with_context(|| format!("verifying {}", args.dir.display()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(report.is_pass());
    }

    for o in &report.failures {
        let line = match &o.status {
            FileStatus::Ok => continue,
            FileStatus::Missing => loc.msg("verify-missing", &[("name", &o.name)]),
            FileStatus::Mismatch { .. } => loc.msg("verify-mismatch", &[("name", &o.name)]),
            FileStatus::Unreadable { reason } => {
                loc.msg("verify-unreadable", &[("name", &o.name), ("reason", reason)])
            }
        };
        println!("{line}");
    }
    for name in &report.unreferenced {
        println!("{}", loc.msg("verify-unreferenced", &[("name", name)]));
    }
    log::info!(
        "{} in {:.2?}",
        loc.msg(
            "verify-summary",
            &[
                ("total", &report.total.to_string()),
                ("passed", &report.passed.to_string()),
                ("failed", &report.failed.to_string()),
            ],
        ),
        report.elapsed
    );
    let pass = report.is_pass();
    println!("{}", loc.msg(if pass { "verify-ok" } else { "verify-failed" }, &[]));
    Ok(pass)
}
