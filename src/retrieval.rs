use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::Read;
use std::time::Duration;
use flate2::read::MultiGzDecoder;
use globset::{GlobBuilder, GlobMatcher};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::Serialize;
use crate::aggregate::Aggregator;
use crate::error::{ReporterError, Result, StoreError};
use crate::record::parse_line;
use crate::store::ObjectStore;
use crate::window::{ObjectKey, StoragePrefix, TimeWindow};

pub const DEFAULT_WORKERS: usize = 10;
pub const DEFAULT_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Clone, Debug)]
pub struct RetrievalConfig {
    pub workers: usize,
    /// Attempts per object including the first.
    pub attempts: u32,
    /// Delay before the second attempt; doubles for each one after.
    pub backoff: Duration,
    pub object_glob: Option<GlobMatcher>,
    pub top_n: usize,
    pub progress: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self { workers: DEFAULT_WORKERS, attempts: DEFAULT_ATTEMPTS, backoff: DEFAULT_BACKOFF, object_glob: None, top_n: crate::aggregate::TOP_N, progress: false }
    }
}

pub fn compile_glob(pattern: &str) -> Result<GlobMatcher> {
    GlobBuilder::new(pattern)
        .case_insensitive(true)
        .literal_separator(false)
        .build()
        .map(|g| g.compile_matcher())
        .map_err(|e| ReporterError::config(format!("invalid object glob '{}': {}", pattern, e)))
}

/// Counters surfaced at the end of a run.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RunStats {
    pub partitions: usize,
    pub partitions_unlisted: usize,
    pub objects_listed: usize,
    pub objects_selected: usize,
    pub objects_attempted: usize,
    pub objects_processed: usize,
    pub skipped_retrieval: usize,
    pub skipped_decompression: usize,
    pub retries: u64,
    pub bytes_fetched: u64,
    pub lines_read: u64,
    pub records_parsed: u64,
    pub lines_malformed: u64,
    pub malformed_by_reason: BTreeMap<String, u64>,
    pub records_outside_window: u64,
    pub absent_elb_status: u64,
    pub absent_target_status: u64,
    pub unclassified_elb_status: u64,
    pub unclassified_target_status: u64,
}

impl RunStats {
    pub fn merge(mut self, o: RunStats) -> RunStats {
        self.partitions += o.partitions;
        self.partitions_unlisted += o.partitions_unlisted;
        self.objects_listed += o.objects_listed;
        self.objects_selected += o.objects_selected;
        self.objects_attempted += o.objects_attempted;
        self.objects_processed += o.objects_processed;
        self.skipped_retrieval += o.skipped_retrieval;
        self.skipped_decompression += o.skipped_decompression;
        self.retries += o.retries;
        self.bytes_fetched += o.bytes_fetched;
        self.lines_read += o.lines_read;
        self.records_parsed += o.records_parsed;
        self.lines_malformed += o.lines_malformed;
        for (k, v) in o.malformed_by_reason { *self.malformed_by_reason.entry(k).or_insert(0) += v; }
        self.records_outside_window += o.records_outside_window;
        self.absent_elb_status += o.absent_elb_status;
        self.absent_target_status += o.absent_target_status;
        self.unclassified_elb_status += o.unclassified_elb_status;
        self.unclassified_target_status += o.unclassified_target_status;
        self
    }
}

/// Runs `op` until it succeeds, fails permanently, or runs out of attempts.
/// Returns the value with the number of retries it took, or the last error with the attempt count.
fn with_retry<T>(what: &str, cfg: &RetrievalConfig, mut op: impl FnMut() -> std::result::Result<T, StoreError>) -> std::result::Result<(T, u32), (StoreError, u32)> {
    let attempts = cfg.attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op() {
            Ok(v) => return Ok((v, attempt - 1)),
            Err(e) if e.is_retryable() && attempt < attempts => {
                let delay = cfg.backoff.saturating_mul(1u32 << (attempt - 1).min(16));
                log::debug!("{} failed (attempt {}/{}), retrying in {:?}: {}", what, attempt, attempts, delay, e);
                if !delay.is_zero() { std::thread::sleep(delay); }
            }
            Err(e) => return Err((e, attempt)),
        }
    }
}

/// Lists every partition of the window and keeps objects whose interval overlaps
/// it (and that match the glob, if any). Output is ordered by key.
pub fn select_objects(store: &dyn ObjectStore, prefix: &StoragePrefix, window: &TimeWindow, cfg: &RetrievalConfig) -> (Vec<ObjectKey>, RunStats) {
    let mut stats = RunStats::default();
    let mut selected = Vec::new();
    for day in window.partitions() {
        stats.partitions += 1;
        let p = prefix.partition_prefix(day);
        let listed = match with_retry(&format!("list {}", p), cfg, || store.list(&p)) {
            Ok((objs, retries)) => { stats.retries += retries as u64; objs }
            Err((e, attempts)) => {
                log::error!("Listing {} failed after {} attempt(s): {}", p, attempts, e);
                stats.partitions_unlisted += 1;
                continue;
            }
        };
        log::debug!("{} objects under {}", listed.len(), p);
        stats.objects_listed += listed.len();
        for meta in listed {
            let obj = ObjectKey::new(meta.key, day, meta.size);
            if !obj.in_window(window) { continue; }
            if let Some(g) = &cfg.object_glob && !g.is_match(obj.file_name()) { continue; }
            log::trace!("Selected {} from partition {}", obj.file_name(), obj.partition);
            selected.push(obj);
        }
    }
    selected.sort_by(|a, b| a.key.cmp(&b.key));
    selected.dedup_by(|a, b| a.key == b.key);
    stats.objects_selected = selected.len();
    (selected, stats)
}

/// Fetches one object, retrying transient failures with exponential backoff.
pub fn fetch_with_retry(store: &dyn ObjectStore, key: &str, cfg: &RetrievalConfig) -> Result<(Vec<u8>, u32)> {
    with_retry(key, cfg, || store.fetch(key))
        .map_err(|(source, attempts)| ReporterError::Retrieval { key: key.to_string(), attempts, source })
}

/// Inflates the whole object before any line is handed out, so a truncated
/// archive contributes nothing. Keys without `.gz` are plain text.
pub fn decompress(key: &str, bytes: Vec<u8>) -> Result<Vec<u8>> {
    if !key.ends_with(".gz") { return Ok(bytes); }
    let mut out = Vec::with_capacity(bytes.len() * 8);
    MultiGzDecoder::new(&bytes[..])
        .read_to_end(&mut out)
        .map_err(|source| ReporterError::Decompression { key: key.to_string(), source })?;
    Ok(out)
}

/// Non-empty lines; invalid UTF-8 is replaced rather than rejected.
pub fn lines(buf: &[u8]) -> impl Iterator<Item = Cow<'_, str>> {
    buf.split(|&b| b == b'\n')
        .map(|l| l.strip_suffix(b"\r").unwrap_or(l))
        .filter(|l| !l.is_empty())
        .map(String::from_utf8_lossy)
}

/// One worker's share of the run.
#[derive(Clone, Debug)]
pub struct Partial {
    pub agg: Aggregator,
    pub stats: RunStats,
}

impl Partial {
    pub fn new(top_n: usize) -> Self { Self { agg: Aggregator::new(top_n), stats: RunStats::default() } }

    pub fn absorb(&mut self, data: &[u8], window: &TimeWindow) {
        for line in lines(data) {
            self.stats.lines_read += 1;
            match parse_line(&line) {
                Ok(r) if !window.contains(r.time) => self.stats.records_outside_window += 1,
                Ok(r) => {
                    self.stats.records_parsed += 1;
                    self.agg.add(&r);
                }
                Err(reason) => {
                    self.stats.lines_malformed += 1;
                    *self.stats.malformed_by_reason.entry(reason.to_string()).or_insert(0) += 1;
                    log::trace!("Malformed line ({}): {}", reason, line);
                }
            }
        }
    }

    fn process(&mut self, store: &dyn ObjectStore, obj: &ObjectKey, window: &TimeWindow, cfg: &RetrievalConfig) {
        self.stats.objects_attempted += 1;
        let bytes = match fetch_with_retry(store, &obj.key, cfg) {
            Ok((b, retries)) => { self.stats.retries += retries as u64; b }
            Err(e) => {
                log::error!("{} (partition {})", e, obj.partition);
                self.stats.skipped_retrieval += 1;
                return;
            }
        };
        self.stats.bytes_fetched += bytes.len() as u64;
        let data = match decompress(&obj.key, bytes) {
            Ok(d) => d,
            Err(e) => {
                log::error!("{} (partition {})", e, obj.partition);
                self.stats.skipped_decompression += 1;
                return;
            }
        };
        self.stats.objects_processed += 1;
        self.absorb(&data, window);
    }

    pub fn merge(self, other: Partial) -> Partial {
        Partial { agg: self.agg.merge(other.agg), stats: self.stats.merge(other.stats) }
    }
}

fn progress_bar(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} {msg}").unwrap_or_else(|_| ProgressStyle::default_bar()));
    pb.set_message("objects");
    pb
}

/// Selects, retrieves, and folds every object of the window on a bounded pool.
/// Fails with a configuration error when nothing could be read.
pub fn collect(store: &dyn ObjectStore, prefix: &StoragePrefix, window: &TimeWindow, cfg: &RetrievalConfig) -> Result<(Aggregator, RunStats)> {
    let (objects, listed) = select_objects(store, prefix, window, cfg);
    let known_bytes: u64 = objects.iter().filter_map(|o| o.size).sum();
    log::info!("Selected {} of {} listed objects ({} bytes) across {} partition(s) of {}", objects.len(), listed.objects_listed, known_bytes, listed.partitions, prefix);
    if objects.is_empty() {
        return Err(ReporterError::config(format!(
            "no log objects under {} between {} and {}",
            prefix, window.start.with_timezone(&window.tz), window.end.with_timezone(&window.tz),
        )));
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(cfg.workers.max(1))
        .thread_name(|i| format!("alb-worker-{}", i))
        .build()
        .map_err(|e| ReporterError::config(format!("worker pool: {}", e)))?;
    let pb = if cfg.progress { Some(progress_bar(objects.len())) } else { None };

    let top_n = cfg.top_n;
    let folded = pool.install(|| {
        objects.par_iter()
            .fold(|| Partial::new(top_n), |mut acc, obj| {
                acc.process(store, obj, window, cfg);
                if let Some(pb) = &pb { pb.inc(1); }
                acc
            })
            .reduce(|| Partial::new(top_n), Partial::merge)
    });
    if let Some(pb) = pb { pb.finish_and_clear(); }

    let mut stats = listed.merge(folded.stats);
    stats.absent_elb_status = folded.agg.absent_elb_status;
    stats.absent_target_status = folded.agg.absent_target_status;
    stats.unclassified_elb_status = folded.agg.unclassified_elb_status;
    stats.unclassified_target_status = folded.agg.unclassified_target_status;
    if stats.objects_processed == 0 {
        return Err(ReporterError::config(format!("none of the {} selected objects could be read", stats.objects_selected)));
    }
    if stats.skipped_retrieval + stats.skipped_decompression > 0 {
        log::warn!("Skipped {} object(s) ({} retrieval, {} decompression)", stats.skipped_retrieval + stats.skipped_decompression, stats.skipped_retrieval, stats.skipped_decompression);
    }
    log::info!("Parsed {} records from {} lines ({} malformed, {} outside window)", stats.records_parsed, stats.lines_read, stats.lines_malformed, stats.records_outside_window);
    Ok((folded.agg, stats))
}
