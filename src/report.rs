use std::fs;
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use comfy_table::{presets::UTF8_FULL, Cell as TableCell, CellAlignment, ContentArrangement, Table};
use serde::Serialize;
use crate::retrieval::RunStats;

/// Row limit of one spreadsheet sheet; larger views are split into pages.
pub const SHEET_ROW_LIMIT: usize = 1_048_576;
pub const SHEET_NAME_MAX: usize = 31;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CellKind { Int, Float, Text, Time, Flag }

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Column {
    pub name: &'static str,
    pub kind: CellKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Cell {
    Int(u64),
    Float(f64),
    Text(String),
    Time(DateTime<Tz>),
    Flag(bool),
    Empty,
}

impl Cell {
    pub fn render(&self) -> String {
        match self {
            Cell::Int(v) => v.to_string(),
            Cell::Float(v) => format!("{:.3}", v),
            Cell::Text(s) => s.clone(),
            Cell::Time(t) => t.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            Cell::Flag(true) => "Yes".to_string(),
            Cell::Flag(false) => "No".to_string(),
            Cell::Empty => String::new(),
        }
    }
}

pub type Row = Vec<Cell>;

/// One named table of the report.
#[derive(Clone, Debug, PartialEq)]
pub struct ReportView {
    pub name: String,
    pub columns: Vec<Column>,
    pub rows: Vec<Row>,
}

impl ReportView {
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self { name: name.into(), columns, rows: Vec::new() }
    }

    pub fn push(&mut self, row: Row) {
        debug_assert_eq!(row.len(), self.columns.len(), "row width for {}", self.name);
        self.rows.push(row);
    }

    pub fn pages(&self, limit: usize) -> Vec<Page<'_>> {
        let ranges = page_ranges(self.rows.len(), limit);
        let of = ranges.len();
        ranges.into_iter().enumerate().map(|(i, r)| Page {
            sheet: sheet_name(&self.name, i + 1),
            index: i + 1,
            of,
            columns: &self.columns,
            rows: &self.rows[r],
        }).collect()
    }
}

/// A slice of a view small enough for one sheet.
#[derive(Debug)]
pub struct Page<'a> {
    pub sheet: String,
    pub index: usize,
    pub of: usize,
    pub columns: &'a [Column],
    pub rows: &'a [Row],
}

/// Contiguous row ranges of at most `limit` rows. An empty view still gets
/// one (empty) page so its header is written.
pub fn page_ranges(len: usize, limit: usize) -> Vec<Range<usize>> {
    let limit = limit.max(1);
    if len == 0 { return vec![0..0]; }
    (0..len).step_by(limit).map(|s| s..(s + limit).min(len)).collect()
}

/// Page 1 keeps the view name, later pages get a ` (k)` suffix that survives clipping.
pub fn sheet_name(name: &str, page: usize) -> String {
    let clean: String = name.chars().map(|c| if matches!(c, '[' | ']' | ':' | '*' | '?' | '/' | '\\') { '_' } else { c }).collect();
    let suffix = if page <= 1 { String::new() } else { format!(" ({})", page) };
    let room = SHEET_NAME_MAX.saturating_sub(suffix.chars().count());
    let mut out: String = clean.chars().take(room).collect();
    out.push_str(&suffix);
    out
}

#[derive(Clone, Debug, Serialize)]
pub struct ViewSummary {
    pub name: String,
    pub rows: usize,
    pub pages: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct ReputationSummary {
    pub source: String,
    pub updated: Option<DateTime<Utc>>,
    pub addresses: usize,
}

/// Everything about a run except the rows themselves.
#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub generated_at: DateTime<Utc>,
    pub prefix: String,
    pub store: String,
    pub timezone: String,
    pub window_start: String,
    pub window_end: String,
    pub reputation: Option<ReputationSummary>,
    pub stats: RunStats,
    pub views: Vec<ViewSummary>,
}

impl RunSummary {
    pub fn describe_views(views: &[ReportView], limit: usize) -> Vec<ViewSummary> {
        views.iter().map(|v| ViewSummary { name: v.name.clone(), rows: v.rows.len(), pages: page_ranges(v.rows.len(), limit).len() }).collect()
    }
}

/// Destination for paginated views. Pages arrive in sheet order.
pub trait ReportSink {
    fn write_page(&mut self, page: &Page<'_>) -> io::Result<()>;
    fn finish(&mut self, summary: &RunSummary) -> io::Result<()>;
}

/// Writes every view through `sink`, splitting at `limit` rows. Returns the number of pages written.
pub fn emit(views: &[ReportView], sink: &mut dyn ReportSink, limit: usize) -> io::Result<usize> {
    let mut written = 0;
    for v in views {
        let pages = v.pages(limit);
        if pages.len() > 1 { log::info!("{} has {} rows, split into {} sheets", v.name, v.rows.len(), pages.len()); }
        for p in &pages {
            sink.write_page(p)?;
            written += 1;
        }
    }
    Ok(written)
}

/// One CSV file per page, prefixed with its sheet position, plus `summary.json`.
pub struct CsvSink {
    dir: PathBuf,
    seq: usize,
    pub files: Vec<PathBuf>,
}

impl CsvSink {
    pub fn create(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self { dir: dir.to_path_buf(), seq: 0, files: Vec::new() })
    }

    pub fn dir(&self) -> &Path { &self.dir }
}

fn file_stem(sheet: &str) -> String {
    sheet.chars().map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' }).collect::<String>()
        .split('_').filter(|s| !s.is_empty()).collect::<Vec<_>>().join("_")
}

impl ReportSink for CsvSink {
    fn write_page(&mut self, page: &Page<'_>) -> io::Result<()> {
        self.seq += 1;
        let path = self.dir.join(format!("{:02}_{}.csv", self.seq, file_stem(&page.sheet)));
        let mut wtr = csv::Writer::from_path(&path)?;
        wtr.write_record(page.columns.iter().map(|c| c.name))?;
        for row in page.rows {
            wtr.write_record(row.iter().map(Cell::render))?;
        }
        wtr.flush()?;
        log::debug!("Wrote {} rows to {} (sheet {}/{} of {})", page.rows.len(), path.to_string_lossy(), page.index, page.of, page.sheet);
        self.files.push(path);
        Ok(())
    }

    fn finish(&mut self, summary: &RunSummary) -> io::Result<()> {
        let path = self.dir.join("summary.json");
        let json = serde_json::to_string_pretty(summary).map_err(io::Error::other)?;
        fs::write(&path, json)?;
        self.files.push(path);
        Ok(())
    }
}

/// Human-readable run summary: one table of counters, one of view sizes.
pub fn render_summary(summary: &RunSummary) -> String {
    let s = &summary.stats;
    let mut t = Table::new();
    t.load_preset(UTF8_FULL).set_content_arrangement(ContentArrangement::Dynamic).set_header(vec!["Run", "Value"]);
    let mut kv = |k: &str, v: String| { t.add_row(vec![TableCell::new(k), TableCell::new(v).set_alignment(CellAlignment::Right)]); };
    kv("Prefix", summary.prefix.clone());
    kv("Window", format!("{} .. {} ({})", summary.window_start, summary.window_end, summary.timezone));
    kv("Partitions", s.partitions.to_string());
    kv("Partitions unlisted", s.partitions_unlisted.to_string());
    kv("Objects listed", s.objects_listed.to_string());
    kv("Objects selected", s.objects_selected.to_string());
    kv("Objects processed", format!("{}/{}", s.objects_processed, s.objects_attempted));
    kv("Skipped (retrieval)", s.skipped_retrieval.to_string());
    kv("Skipped (decompression)", s.skipped_decompression.to_string());
    kv("Retries", s.retries.to_string());
    kv("Lines read", s.lines_read.to_string());
    kv("Records parsed", s.records_parsed.to_string());
    kv("Lines malformed", s.lines_malformed.to_string());
    kv("Outside window", s.records_outside_window.to_string());
    kv("Absent ELB status", s.absent_elb_status.to_string());
    kv("Absent backend status", s.absent_target_status.to_string());
    kv("Unclassified ELB status", s.unclassified_elb_status.to_string());
    kv("Unclassified backend status", s.unclassified_target_status.to_string());
    if let Some(r) = &summary.reputation {
        kv("Reputation", format!("{} addresses from {}", r.addresses, r.source));
    }

    let mut v = Table::new();
    v.load_preset(UTF8_FULL).set_content_arrangement(ContentArrangement::Dynamic).set_header(vec!["View", "Rows", "Sheets"]);
    for vs in &summary.views {
        v.add_row(vec![TableCell::new(&vs.name), TableCell::new(vs.rows).set_alignment(CellAlignment::Right), TableCell::new(vs.pages).set_alignment(CellAlignment::Right)]);
    }
    format!("{}\n{}", t, v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(n: usize) -> ReportView {
        let mut v = ReportView::new("ELB 4xx Timestamp", vec![Column { name: "N", kind: CellKind::Int }]);
        v.rows = (0..n as u64).map(|i| vec![Cell::Int(i)]).collect();
        v
    }

    #[test]
    fn one_row_over_the_limit_spills_to_a_second_page() {
        let r = page_ranges(1_048_577, SHEET_ROW_LIMIT);
        assert_eq!(r.iter().map(|r| r.len()).collect::<Vec<_>>(), vec![1_048_576, 1]);
    }

    #[test]
    fn pages_conserve_rows_in_order() {
        let v = numbered(23);
        let pages = v.pages(5);
        assert_eq!(pages.len(), 5);
        let flat: Vec<&Row> = pages.iter().flat_map(|p| p.rows.iter()).collect();
        assert_eq!(flat.len(), 23);
        assert!(flat.iter().enumerate().all(|(i, r)| r[0] == Cell::Int(i as u64)));
        assert_eq!(pages[0].sheet, "ELB 4xx Timestamp");
        assert_eq!(pages[1].sheet, "ELB 4xx Timestamp (2)");
        assert_eq!(pages[4].of, 5);
    }

    #[test]
    fn empty_view_keeps_its_header_page() {
        let v = numbered(0);
        let pages = v.pages(SHEET_ROW_LIMIT);
        assert_eq!(pages.len(), 1);
        assert!(pages[0].rows.is_empty());
    }

    #[test]
    fn long_names_are_clipped_before_the_suffix() {
        let name = "Backend 5xx Timestamp with a very long tail";
        assert_eq!(sheet_name(name, 1).chars().count(), SHEET_NAME_MAX);
        let p12 = sheet_name(name, 12);
        assert_eq!(p12.chars().count(), SHEET_NAME_MAX);
        assert!(p12.ends_with(" (12)"));
        assert_eq!(sheet_name("a/b:c", 1), "a_b_c");
    }

    #[test]
    fn cells_render_for_csv() {
        let t = chrono::TimeZone::with_ymd_and_hms(&Tz::Asia__Seoul, 2024, 3, 1, 9, 0, 5).unwrap();
        assert_eq!(Cell::Time(t).render(), "2024-03-01 09:00:05.000");
        assert_eq!(Cell::Float(1.23456).render(), "1.235");
        assert_eq!(Cell::Flag(true).render(), "Yes");
        assert_eq!(Cell::Empty.render(), "");
    }

    fn summary(views: &[ReportView]) -> RunSummary {
        RunSummary {
            generated_at: Utc::now(),
            prefix: "s3://logs/AWSLogs".into(),
            store: "test".into(),
            timezone: "UTC".into(),
            window_start: "2024-03-01 00:00".into(),
            window_end: "2024-03-01 01:00".into(),
            reputation: None,
            stats: RunStats::default(),
            views: RunSummary::describe_views(views, 4),
        }
    }

    #[test]
    fn csv_sink_writes_one_file_per_page_and_summary() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sink = CsvSink::create(&tmp.path().join("report")).unwrap();
        let mut flagged = ReportView::new("Top 100 Client IP", vec![Column { name: "Client IP", kind: CellKind::Text }, Column { name: "Abuse", kind: CellKind::Flag }]);
        flagged.push(vec![Cell::Text("203.0.113.5".into()), Cell::Flag(true)]);
        let views = vec![flagged, numbered(9)];
        let pages = emit(&views, &mut sink, 4).unwrap();
        assert_eq!(pages, 4);
        sink.finish(&summary(&views)).unwrap();
        let names: Vec<String> = sink.files.iter().map(|p| p.file_name().unwrap().to_string_lossy().into_owned()).collect();
        assert_eq!(names, vec!["01_Top_100_Client_IP.csv", "02_ELB_4xx_Timestamp.csv", "03_ELB_4xx_Timestamp_2.csv", "04_ELB_4xx_Timestamp_3.csv", "summary.json"]);
        let first = std::fs::read_to_string(&sink.files[0]).unwrap();
        assert_eq!(first, "Client IP,Abuse\n203.0.113.5,Yes\n");
        let last = std::fs::read_to_string(&sink.files[3]).unwrap();
        assert_eq!(last, "N\n8\n");
        let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&sink.files[4]).unwrap()).unwrap();
        assert_eq!(json["views"][1]["pages"], 3);
    }

    #[test]
    fn summary_table_lists_views() {
        let mut s = summary(&[numbered(2)]);
        s.stats.partitions_unlisted = 3;
        s.stats.retries = 17;
        s.stats.unclassified_target_status = 42;
        let text = render_summary(&s);
        assert!(text.contains("ELB 4xx Timestamp"));
        assert!(text.contains("Records parsed"));
        let row = |label: &str| text.lines().find(|l| l.contains(label)).unwrap_or_else(|| panic!("no row {}", label)).to_string();
        assert!(row("Partitions unlisted").contains('3'));
        assert!(row("Retries").contains("17"));
        assert!(row("Unclassified backend status").contains("42"));
    }
}
