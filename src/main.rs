use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use anyhow::Context;
use chrono::{Local, Utc};
use clap::{Parser, ValueEnum, ColorChoice, ArgAction, CommandFactory};
use clap_complete::Shell;
use is_terminal::IsTerminal;
use serde::{Deserialize, Serialize};
use crate::error::ReporterError;
use crate::report::{CsvSink, ReportSink, RunSummary, ReputationSummary, SHEET_ROW_LIMIT};
use crate::reputation::{ReputationSet, DEFAULT_FEED_URL};
use crate::retrieval::{RetrievalConfig, DEFAULT_ATTEMPTS, DEFAULT_WORKERS};
use crate::store::{LocalStore, ObjectStore};
use crate::window::{StoragePrefix, TimeWindow};
mod aggregate;
mod error;
mod record;
mod report;
mod reputation;
mod retrieval;
mod store;
mod window;

static ENABLE_COLOR: OnceLock<bool> = OnceLock::new();
const DEFAULT_CONFIG: &str = "alb-reporter.toml";
const DEFAULT_OUTPUT_DIR: &str = "./data/output";
const DEFAULT_TIMEZONE: &str = "UTC";

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum OutputFmt { Text, Json }

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum LogLevel { Error, Warn, Info, Debug, Trace }

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum LogFormat { Text, Json }

#[derive(Parser, Debug)]
#[command(
    name = "alb-reporter",
    about = "Application Load Balancer access log reporter",
    long_about = "Reads ALB access logs for a time window from S3 (or a local mirror of the bucket), aggregates status codes, slow requests, clients, URLs and user agents, and writes a paginated report.",
    after_long_help = "Examples:\n  alb-reporter -b s3://my-logs/AWSLogs/123456789012/elasticloadbalancing/ap-northeast-2 -s \"2024-03-01 09:00\" -e \"2024-03-01 18:00\" -z Asia/Seoul\n  alb-reporter -b s3://my-logs/AWSLogs/123456789012/elasticloadbalancing/us-east-1 -s \"2024-03-01 00:00\" --profile prod --progress\n  alb-reporter -b s3://my-logs/AWSLogs/1/elasticloadbalancing/us-east-1 -s \"2024-03-01 00:00\" --store-root ./mirror --no-reputation --output json",
    color = ColorChoice::Auto
)]
struct Args {
    /// Storage prefix, s3://bucket/AWSLogs/{account}/elasticloadbalancing/{region}
    #[arg(long, short = 'b')]
    bucket: Option<String>,
    /// Window start, "YYYY-MM-DD HH:MM" in --timezone
    #[arg(long, short = 's')]
    start: Option<String>,
    /// Window end, defaults to now
    #[arg(long, short = 'e')]
    end: Option<String>,
    #[arg(long, short = 'z', default_value = DEFAULT_TIMEZONE)]
    timezone: String,
    /// Named AWS profile (SSO or static credentials)
    #[arg(long, short = 'p')]
    profile: Option<String>,
    /// Read objects from <dir>/<bucket>/<key> instead of S3
    #[arg(long)]
    store_root: Option<String>,
    /// Only read objects whose file name matches this glob
    #[arg(long, short = 'g')]
    object_glob: Option<String>,
    #[arg(long, short = 'w', default_value_t = DEFAULT_WORKERS)]
    workers: usize,
    /// Extra attempts per object after a transient failure
    #[arg(long, default_value_t = DEFAULT_ATTEMPTS - 1)]
    retries: u32,
    #[arg(long, default_value_t = 200)]
    backoff_ms: u64,
    /// Per-attempt timeout for object and feed downloads
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
    #[arg(long)]
    reputation_path: Option<String>,
    #[arg(long, default_value = DEFAULT_FEED_URL)]
    reputation_url: String,
    #[arg(long, default_value_t = false)]
    no_reputation: bool,
    #[arg(long, default_value = DEFAULT_OUTPUT_DIR)]
    output_dir: String,
    #[arg(long, short = 'o', value_enum, default_value = "text")]
    output: OutputFmt,
    #[arg(long, short = 'n', default_value_t = aggregate::TOP_N)]
    top: usize,
    #[arg(long, default_value_t = false)]
    progress: bool,
    #[arg(long, short = 'C', default_value_t = false)]
    no_color: bool,
    #[arg(long, default_value_t = false)]
    force_color: bool,
    #[arg(short = 'q', long, default_value_t = false)]
    quiet: bool,
    #[arg(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,
    #[arg(long)]
    log_level: Option<LogLevel>,
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
    #[arg(long)]
    log_path: Option<String>,
    #[arg(long)]
    config: Option<String>,
    #[arg(long, value_enum)]
    completions: Option<Shell>,
    #[arg(long)]
    completions_out: Option<String>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            bucket: None,
            start: None,
            end: None,
            timezone: DEFAULT_TIMEZONE.to_string(),
            profile: None,
            store_root: None,
            object_glob: None,
            workers: DEFAULT_WORKERS,
            retries: DEFAULT_ATTEMPTS - 1,
            backoff_ms: 200,
            timeout_secs: 60,
            reputation_path: None,
            reputation_url: DEFAULT_FEED_URL.to_string(),
            no_reputation: false,
            output_dir: DEFAULT_OUTPUT_DIR.to_string(),
            output: OutputFmt::Text,
            top: aggregate::TOP_N,
            progress: false,
            no_color: false,
            force_color: false,
            quiet: false,
            verbose: 0,
            log_level: None,
            log_format: None,
            log_path: None,
            config: None,
            completions: None,
            completions_out: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct AppConfig {
    bucket: Option<String>,
    start: Option<String>,
    end: Option<String>,
    timezone: Option<String>,
    profile: Option<String>,
    store_root: Option<String>,
    object_glob: Option<String>,
    workers: Option<usize>,
    retries: Option<u32>,
    backoff_ms: Option<u64>,
    timeout_secs: Option<u64>,
    reputation_path: Option<String>,
    reputation_url: Option<String>,
    no_reputation: Option<bool>,
    output_dir: Option<String>,
    output: Option<OutputFmt>,
    top: Option<usize>,
    progress: Option<bool>,
    force_color: Option<bool>,
    log_level: Option<LogLevel>,
    log_format: Option<LogFormat>,
    log_path: Option<String>,
}

fn main() {
    let mut args = Args::parse();
    if let Some(sh) = args.completions {
        let mut cmd = Args::command();
        if let Some(path) = args.completions_out.as_ref() && let Ok(mut f) = std::fs::File::create(path) {
            clap_complete::generate(sh, &mut cmd, "alb-reporter", &mut f);
        } else {
            clap_complete::generate(sh, &mut cmd, "alb-reporter", &mut std::io::stdout());
        }
        return;
    }
    let config_err = load_config(&mut args).err();
    init_logging(&args);
    if let Some(e) = config_err { log::warn!("{:#}", e); }
    let term = std::env::var("TERM").unwrap_or_default();
    let no_color_env = std::env::var_os("NO_COLOR").is_some();
    let color_default = std::io::stdout().is_terminal() && !no_color_env && term != "dumb";
    let enable_color = if args.force_color { true } else { color_default && !args.no_color };
    let _ = ENABLE_COLOR.set(enable_color);
    if let Err(e) = run(&args) {
        eprintln!("{}", paint(&format!("error: {:#}", e), "1;31"));
        std::process::exit(exit_code(&e));
    }
}

/// Reads `--config`, else `alb-reporter.toml` in the working directory when present.
fn load_config(args: &mut Args) -> anyhow::Result<()> {
    let path = match args.config.as_ref() {
        Some(p) => PathBuf::from(p),
        None if Path::new(DEFAULT_CONFIG).is_file() => PathBuf::from(DEFAULT_CONFIG),
        None => return Ok(()),
    };
    let s = std::fs::read_to_string(&path).with_context(|| format!("reading config {}", path.display()))?;
    let cfg = toml::from_str::<AppConfig>(&s).with_context(|| format!("parsing config {}", path.display()))?;
    apply_config(args, cfg);
    Ok(())
}

/// File values only fill fields the command line left at their defaults.
fn apply_config(args: &mut Args, cfg: AppConfig) {
    if args.bucket.is_none() && let Some(v) = cfg.bucket { args.bucket = Some(v); }
    if args.start.is_none() && let Some(v) = cfg.start { args.start = Some(v); }
    if args.end.is_none() && let Some(v) = cfg.end { args.end = Some(v); }
    if args.timezone == DEFAULT_TIMEZONE && let Some(v) = cfg.timezone { args.timezone = v; }
    if args.profile.is_none() && let Some(v) = cfg.profile { args.profile = Some(v); }
    if args.store_root.is_none() && let Some(v) = cfg.store_root { args.store_root = Some(v); }
    if args.object_glob.is_none() && let Some(v) = cfg.object_glob { args.object_glob = Some(v); }
    if args.workers == DEFAULT_WORKERS && let Some(v) = cfg.workers { args.workers = v; }
    if args.retries == DEFAULT_ATTEMPTS - 1 && let Some(v) = cfg.retries { args.retries = v; }
    if args.backoff_ms == 200 && let Some(v) = cfg.backoff_ms { args.backoff_ms = v; }
    if args.timeout_secs == 60 && let Some(v) = cfg.timeout_secs { args.timeout_secs = v; }
    if args.reputation_path.is_none() && let Some(v) = cfg.reputation_path { args.reputation_path = Some(v); }
    if args.reputation_url == DEFAULT_FEED_URL && let Some(v) = cfg.reputation_url { args.reputation_url = v; }
    if let Some(v) = cfg.no_reputation { args.no_reputation |= v; }
    if args.output_dir == DEFAULT_OUTPUT_DIR && let Some(v) = cfg.output_dir { args.output_dir = v; }
    if args.output == OutputFmt::Text && let Some(v) = cfg.output { args.output = v; }
    if args.top == aggregate::TOP_N && let Some(v) = cfg.top { args.top = v; }
    if let Some(v) = cfg.progress { args.progress |= v; }
    if let Some(v) = cfg.force_color { args.force_color |= v; }
    if args.log_level.is_none() && let Some(v) = cfg.log_level { args.log_level = Some(v); }
    if args.log_format.is_none() && let Some(v) = cfg.log_format { args.log_format = Some(v); }
    if args.log_path.is_none() && let Some(v) = cfg.log_path { args.log_path = Some(v); }
}

impl LogLevel {
    fn filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// Level forced by the flags. `--quiet` beats `--log-level`, which beats `-v`.
/// `None` leaves the choice to `RUST_LOG` when it is set.
fn level_filter(args: &Args, rust_log_set: bool) -> Option<log::LevelFilter> {
    if args.quiet { return Some(log::LevelFilter::Error); }
    if let Some(lvl) = args.log_level { return Some(lvl.filter()); }
    match args.verbose {
        0 if rust_log_set => None,
        0 => Some(log::LevelFilter::Info),
        1 => Some(log::LevelFilter::Debug),
        _ => Some(log::LevelFilter::Trace),
    }
}

/// Logs go to stderr, or to `--log-file` when it can be created.
/// JSON lines carry `time`, `level`, `module` and `message`.
fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
    if let Some(level) = level_filter(args, std::env::var_os("RUST_LOG").is_some()) {
        builder.filter_level(level);
    }
    let json = matches!(args.log_format, Some(LogFormat::Json));
    builder.format(move |buf, record| {
        use std::io::Write;
        if json {
            let line = serde_json::json!({
                "time": Utc::now().to_rfc3339(),
                "level": record.level().as_str(),
                "module": record.module_path().unwrap_or_else(|| record.target()),
                "message": record.args().to_string(),
            });
            writeln!(buf, "{}", line)
        } else {
            writeln!(buf, "{} {:>5} {}", Local::now().format("%Y-%m-%d %H:%M:%S"), record.level(), record.args())
        }
    });
    if let Some(path) = args.log_path.as_deref() {
        match std::fs::File::create(path) {
            Ok(file) => { builder.target(env_logger::Target::Pipe(Box::new(file))); }
            Err(e) => eprintln!("Cannot write log file {}: {}; logging to stderr", path, e),
        }
    }
    if builder.try_init().is_err() {
        log::debug!("Logger already initialised");
    }
}

fn open_store(args: &Args, prefix: &StoragePrefix) -> anyhow::Result<Box<dyn ObjectStore>> {
    if let Some(root) = args.store_root.as_ref() {
        return Ok(Box::new(LocalStore::new(root, &prefix.bucket)));
    }
    #[cfg(feature = "s3")]
    {
        let s3 = store::S3Store::connect(&prefix.bucket, args.profile.as_deref(), Duration::from_secs(args.timeout_secs))
            .with_context(|| format!("connecting to s3://{}", prefix.bucket))?;
        return Ok(Box::new(s3));
    }
    #[cfg(not(feature = "s3"))]
    Err(ReporterError::config("this build has no S3 support; pass --store-root or rebuild with --features s3").into())
}

/// `<output_dir>/<YYYYmmdd_HHMMSS>/<bucket_path>_report`
fn report_dir(output_dir: &str, prefix: &StoragePrefix, at: chrono::DateTime<Local>) -> PathBuf {
    PathBuf::from(output_dir).join(at.format("%Y%m%d_%H%M%S").to_string()).join(format!("{}_report", prefix.report_stem()))
}

fn run(args: &Args) -> anyhow::Result<PathBuf> {
    let bucket = args.bucket.as_deref().ok_or_else(|| ReporterError::config("--bucket is required"))?;
    let start = args.start.as_deref().ok_or_else(|| ReporterError::config("--start is required"))?;
    let prefix = StoragePrefix::parse(bucket)?;
    let window = TimeWindow::parse(start, args.end.as_deref(), &args.timezone)?;
    let object_glob = args.object_glob.as_deref().map(retrieval::compile_glob).transpose()?;
    let store = open_store(args, &prefix)?;
    log::info!("Reading {} via {} from {} to {}", prefix, store.describe(), window.start.with_timezone(&window.tz), window.end.with_timezone(&window.tz));

    let cfg = RetrievalConfig {
        workers: args.workers,
        attempts: args.retries.saturating_add(1),
        backoff: Duration::from_millis(args.backoff_ms),
        object_glob,
        top_n: args.top,
        progress: args.progress && !args.quiet,
    };
    let (agg, stats) = retrieval::collect(store.as_ref(), &prefix, &window, &cfg)?;

    let reputation = if args.no_reputation { ReputationSet::empty() } else {
        reputation::load(args.reputation_path.as_deref(), &args.reputation_url, Duration::from_secs(args.timeout_secs))
    };
    let views = agg.finish(&reputation, window.tz);

    let dir = report_dir(&args.output_dir, &prefix, Local::now());
    let mut sink = CsvSink::create(&dir).with_context(|| format!("creating {}", dir.display()))?;
    let sheets = report::emit(&views, &mut sink, SHEET_ROW_LIMIT).with_context(|| format!("writing report to {}", dir.display()))?;
    let summary = RunSummary {
        generated_at: Utc::now(),
        prefix: prefix.to_string(),
        store: store.describe(),
        timezone: window.tz.name().to_string(),
        window_start: window.start.with_timezone(&window.tz).format("%Y-%m-%d %H:%M:%S").to_string(),
        window_end: window.end.with_timezone(&window.tz).format("%Y-%m-%d %H:%M:%S").to_string(),
        reputation: (!args.no_reputation).then(|| ReputationSummary { source: reputation.source.clone(), updated: reputation.updated, addresses: reputation.len() }),
        stats,
        views: RunSummary::describe_views(&views, SHEET_ROW_LIMIT),
    };
    sink.finish(&summary).with_context(|| format!("writing summary to {}", dir.display()))?;
    log::info!("Wrote {} sheet(s) in {} file(s) to {}", sheets, sink.files.len(), sink.dir().display());

    match args.output {
        OutputFmt::Text => {
            if !args.quiet {
                println!("{}", report::render_summary(&summary));
                println!("{}", paint(&format!("Report written: {} ({} sheets)", dir.display(), sheets), "1;36"));
            }
        }
        OutputFmt::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
    }
    Ok(dir)
}

/// 2 for bad input or an empty window, 1 for anything else.
fn exit_code(e: &anyhow::Error) -> i32 {
    match e.downcast_ref::<ReporterError>() {
        Some(ReporterError::Configuration(_)) => 2,
        _ => 1,
    }
}

fn paint(s: &str, code: &str) -> String {
    if *ENABLE_COLOR.get().unwrap_or(&true) { format!("\x1b[{}m{}\x1b[0m", code, s) } else { s.to_string() }
}
