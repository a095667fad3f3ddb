use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::hash::Hash;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use crate::record::LogRecord;
use crate::report::{Cell, CellKind, Column, ReportView};
use crate::reputation::ReputationSet;

pub const TOP_N: usize = 100;
/// Records faster than this never enter the slow-request ranking.
pub const SLOW_THRESHOLD_SECS: f64 = 1.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Source { Elb, Backend }

impl Source {
    fn label(self) -> &'static str { match self { Source::Elb => "ELB", Source::Backend => "Backend" } }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StatusClass { S2xx, S3xx, S4xx, S5xx }

impl StatusClass {
    pub const ALL: [StatusClass; 4] = [StatusClass::S2xx, StatusClass::S3xx, StatusClass::S4xx, StatusClass::S5xx];

    pub fn of(code: u16) -> Option<Self> {
        match code / 100 { 2 => Some(Self::S2xx), 3 => Some(Self::S3xx), 4 => Some(Self::S4xx), 5 => Some(Self::S5xx), _ => None }
    }

    fn label(self) -> &'static str { match self { Self::S2xx => "2xx", Self::S3xx => "3xx", Self::S4xx => "4xx", Self::S5xx => "5xx" } }

    fn is_error(self) -> bool { matches!(self, Self::S4xx | Self::S5xx) }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct KeyStats { count: u64, first_seen: DateTime<Utc> }

/// Frequency counter whose ranking does not depend on insertion order: ties
/// go to the key seen earliest in log time, then to the smaller key.
#[derive(Clone, Debug)]
struct Counter<K> { map: HashMap<K, KeyStats> }

impl<K> Default for Counter<K> {
    fn default() -> Self { Self { map: HashMap::new() } }
}

impl<K: Hash + Eq + Ord> Counter<K> {
    fn add(&mut self, key: K, t: DateTime<Utc>) {
        let e = self.map.entry(key).or_insert(KeyStats { count: 0, first_seen: t });
        e.count += 1;
        if t < e.first_seen { e.first_seen = t; }
    }

    fn merge(&mut self, other: Counter<K>) {
        for (k, s) in other.map {
            let e = self.map.entry(k).or_insert(KeyStats { count: 0, first_seen: s.first_seen });
            e.count += s.count;
            e.first_seen = e.first_seen.min(s.first_seen);
        }
    }

    fn ranked(self) -> Vec<(K, u64)> {
        let mut v: Vec<(K, KeyStats)> = self.map.into_iter().collect();
        v.sort_by(|a, b| b.1.count.cmp(&a.1.count).then(a.1.first_seen.cmp(&b.1.first_seen)).then_with(|| a.0.cmp(&b.0)));
        v.into_iter().map(|(k, s)| (k, s.count)).collect()
    }
}

type StatusKey = (String, String, Option<String>);

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct ErrorHit {
    time: DateTime<Utc>,
    client_ip: String,
    url: String,
    elb_status: Option<u16>,
    target_status: Option<u16>,
}

#[derive(Clone, Debug)]
struct SlowHit {
    total: f64,
    time: DateTime<Utc>,
    client_ip: String,
    target_ip: Option<String>,
    url: String,
    elb_status: Option<u16>,
}

impl Ord for SlowHit {
    /// Greater ranks higher: longer total, then earlier timestamp.
    fn cmp(&self, o: &Self) -> Ordering {
        self.total.total_cmp(&o.total)
            .then_with(|| o.time.cmp(&self.time))
            .then_with(|| o.client_ip.cmp(&self.client_ip))
            .then_with(|| o.url.cmp(&self.url))
            .then_with(|| o.target_ip.cmp(&self.target_ip))
            .then_with(|| o.elb_status.cmp(&self.elb_status))
    }
}
impl PartialOrd for SlowHit { fn partial_cmp(&self, o: &Self) -> Option<Ordering> { Some(self.cmp(o)) } }
impl PartialEq for SlowHit { fn eq(&self, o: &Self) -> bool { self.cmp(o) == Ordering::Equal } }
impl Eq for SlowHit {}

/// Keeps the `cap` highest-ranked hits; the weakest sits on top of the min-heap.
#[derive(Clone, Debug)]
struct TopSlow { heap: BinaryHeap<Reverse<SlowHit>>, cap: usize }

impl TopSlow {
    fn new(cap: usize) -> Self { Self { heap: BinaryHeap::with_capacity(cap + 1), cap } }

    fn offer(&mut self, hit: SlowHit) {
        if self.cap == 0 { return; }
        if self.heap.len() == self.cap && let Some(Reverse(weakest)) = self.heap.peek() && hit <= *weakest { return; }
        self.heap.push(Reverse(hit));
        if self.heap.len() > self.cap { self.heap.pop(); }
    }

    fn merge(&mut self, other: TopSlow) { for Reverse(h) in other.heap { self.offer(h); } }

    fn ranked(self) -> Vec<SlowHit> { self.heap.into_sorted_vec().into_iter().map(|Reverse(h)| h).collect() }
}

/// Per-worker accumulator for every report view. Partial aggregators merge
/// associatively, so worker count and object order do not change the result.
#[derive(Clone, Debug)]
pub struct Aggregator {
    top_n: usize,
    status: BTreeMap<(Source, StatusClass), Counter<StatusKey>>,
    listings: BTreeMap<(Source, StatusClass), Vec<ErrorHit>>,
    slow: TopSlow,
    clients: Counter<String>,
    urls: Counter<String>,
    agents: Counter<String>,
    pub records: u64,
    pub absent_elb_status: u64,
    pub absent_target_status: u64,
    /// Present codes outside 200..=599; they reach no status view.
    pub unclassified_elb_status: u64,
    pub unclassified_target_status: u64,
}

impl Default for Aggregator {
    fn default() -> Self { Self::new(TOP_N) }
}

impl Aggregator {
    pub fn new(top_n: usize) -> Self {
        Self {
            top_n,
            status: BTreeMap::new(),
            listings: BTreeMap::new(),
            slow: TopSlow::new(top_n),
            clients: Counter::default(),
            urls: Counter::default(),
            agents: Counter::default(),
            records: 0,
            absent_elb_status: 0,
            absent_target_status: 0,
            unclassified_elb_status: 0,
            unclassified_target_status: 0,
        }
    }

    pub fn add(&mut self, r: &LogRecord) {
        self.records += 1;
        match r.elb_status { Some(c) => self.add_status(Source::Elb, c, r), None => self.absent_elb_status += 1 }
        match r.target_status { Some(c) => self.add_status(Source::Backend, c, r), None => self.absent_target_status += 1 }
        let total = r.total_time();
        if r.has_timing() && total >= SLOW_THRESHOLD_SECS {
            self.slow.offer(SlowHit { total, time: r.time, client_ip: r.client_ip.clone(), target_ip: r.target_ip.clone(), url: r.url.clone(), elb_status: r.elb_status });
        }
        self.clients.add(r.client_ip.clone(), r.time);
        self.urls.add(r.url.clone(), r.time);
        self.agents.add(r.user_agent.clone().unwrap_or_else(|| "-".to_string()), r.time);
    }

    fn add_status(&mut self, source: Source, code: u16, r: &LogRecord) {
        let Some(class) = StatusClass::of(code) else {
            match source {
                Source::Elb => self.unclassified_elb_status += 1,
                Source::Backend => self.unclassified_target_status += 1,
            }
            return;
        };
        let redirect = if class == StatusClass::S3xx { r.redirect_url.clone() } else { None };
        self.status.entry((source, class)).or_default().add((r.client_ip.clone(), r.url.clone(), redirect), r.time);
        if class.is_error() {
            self.listings.entry((source, class)).or_default().push(ErrorHit {
                time: r.time,
                client_ip: r.client_ip.clone(),
                url: r.url.clone(),
                elb_status: r.elb_status,
                target_status: r.target_status,
            });
        }
    }

    pub fn merge(mut self, other: Aggregator) -> Aggregator {
        for (k, c) in other.status { self.status.entry(k).or_default().merge(c); }
        for (k, mut v) in other.listings { self.listings.entry(k).or_default().append(&mut v); }
        self.slow.merge(other.slow);
        self.clients.merge(other.clients);
        self.urls.merge(other.urls);
        self.agents.merge(other.agents);
        self.records += other.records;
        self.absent_elb_status += other.absent_elb_status;
        self.absent_target_status += other.absent_target_status;
        self.unclassified_elb_status += other.unclassified_elb_status;
        self.unclassified_target_status += other.unclassified_target_status;
        self
    }

    /// Builds the report views in sheet order. Timestamps render in `tz`.
    pub fn finish(mut self, reputation: &ReputationSet, tz: Tz) -> Vec<ReportView> {
        let n = self.top_n;
        let mut views = Vec::with_capacity(16);

        let mut clients = ReportView::new(format!("Top {} Client IP", n), vec![col("Count", CellKind::Int), col("Client IP", CellKind::Text), col("Abuse", CellKind::Flag)]);
        for (ip, count) in std::mem::take(&mut self.clients).ranked().into_iter().take(n) {
            let flagged = !reputation.is_empty() && reputation.contains(&ip);
            clients.push(vec![Cell::Int(count), Cell::Text(ip), Cell::Flag(flagged)]);
        }
        views.push(clients);
        views.push(frequency_view(format!("Top {} Request URL", n), "Request URL", std::mem::take(&mut self.urls), n));
        views.push(frequency_view(format!("Top {} User Agents", n), "User Agent", std::mem::take(&mut self.agents), n));

        for source in [Source::Elb, Source::Backend] {
            for class in StatusClass::ALL {
                let name = format!("{} {} Count", source.label(), class.label());
                let mut columns = vec![col("Count", CellKind::Int), col("Client IP", CellKind::Text), col("Request URL", CellKind::Text)];
                if class == StatusClass::S3xx { columns.push(col("Redirect URL", CellKind::Text)); }
                let mut view = ReportView::new(name, columns);
                for ((client, url, redirect), count) in self.status.remove(&(source, class)).unwrap_or_default().ranked() {
                    let mut row = vec![Cell::Int(count), Cell::Text(client), Cell::Text(url)];
                    if class == StatusClass::S3xx { row.push(redirect.map(Cell::Text).unwrap_or(Cell::Empty)); }
                    view.push(row);
                }
                views.push(view);
            }
        }

        for source in [Source::Elb, Source::Backend] {
            for class in [StatusClass::S4xx, StatusClass::S5xx] {
                let mut hits = self.listings.remove(&(source, class)).unwrap_or_default();
                hits.sort_unstable();
                let mut view = ReportView::new(format!("{} {} Timestamp", source.label(), class.label()), vec![
                    col("Timestamp", CellKind::Time), col("Client IP", CellKind::Text), col("Request URL", CellKind::Text),
                    col("ELB Status Code", CellKind::Int), col("Backend Status Code", CellKind::Int),
                ]);
                view.rows.reserve(hits.len());
                for h in hits {
                    view.push(vec![Cell::Time(h.time.with_timezone(&tz)), Cell::Text(h.client_ip), Cell::Text(h.url), status_cell(h.elb_status), status_cell(h.target_status)]);
                }
                views.push(view);
            }
        }

        let mut slow = ReportView::new(format!("Top {} Total Time", n), vec![
            col("Total Time", CellKind::Float), col("Timestamp", CellKind::Time), col("Client IP", CellKind::Text),
            col("Target IP", CellKind::Text), col("Request URL", CellKind::Text), col("ELB Status Code", CellKind::Int),
        ]);
        for h in self.slow.ranked() {
            slow.push(vec![Cell::Float(h.total), Cell::Time(h.time.with_timezone(&tz)), Cell::Text(h.client_ip), h.target_ip.map(Cell::Text).unwrap_or(Cell::Empty), Cell::Text(h.url), status_cell(h.elb_status)]);
        }
        views.push(slow);
        views
    }
}

fn col(name: &'static str, kind: CellKind) -> Column { Column { name, kind } }

fn status_cell(code: Option<u16>) -> Cell { code.map(|c| Cell::Int(c as u64)).unwrap_or(Cell::Empty) }

fn frequency_view(name: String, key_col: &'static str, counter: Counter<String>, n: usize) -> ReportView {
    let mut view = ReportView::new(name, vec![col("Count", CellKind::Int), col(key_col, CellKind::Text)]);
    for (k, count) in counter.ranked().into_iter().take(n) { view.push(vec![Cell::Int(count), Cell::Text(k)]); }
    view
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{fixture::LineSpec, parse_line};

    fn rec(line: LineSpec) -> LogRecord { parse_line(&line.render()).unwrap() }

    fn view<'a>(views: &'a [ReportView], name: &str) -> &'a ReportView {
        views.iter().find(|v| v.name == name).unwrap_or_else(|| panic!("no view {}", name))
    }

    fn fold(records: &[LogRecord]) -> Aggregator {
        let mut a = Aggregator::default();
        for r in records { a.add(r); }
        a
    }

    #[test]
    fn five_hundred_counts_and_timing_exclusion() {
        let ok = rec(LineSpec::default().client("10.0.0.1").status("200", "200").times("0.02", "0.09", "0.01"));
        let gw = rec(LineSpec::default().client("10.0.0.2").status("504", "-").times("-1", "-1", "-1"));
        assert!((ok.total_time() - 0.12).abs() < 1e-9);
        let views = fold(&[ok, gw]).finish(&ReputationSet::empty(), Tz::UTC);
        let five = view(&views, "ELB 5xx Count");
        assert_eq!(five.rows.len(), 1);
        assert_eq!(five.rows[0][0], Cell::Int(1));
        assert_eq!(five.rows[0][1], Cell::Text("10.0.0.2".into()));
        assert_eq!(view(&views, "ELB 2xx Count").rows.len(), 1);
        assert!(view(&views, "Top 100 Total Time").rows.is_empty());
        assert_eq!(view(&views, "ELB 5xx Timestamp").rows.len(), 1);
        assert!(view(&views, "Backend 5xx Timestamp").rows.is_empty());
    }

    #[test]
    fn absent_status_is_counted_separately() {
        let a = fold(&[rec(LineSpec::default().status("504", "-")), rec(LineSpec::default().status("-", "-"))]);
        assert_eq!(a.absent_elb_status, 1);
        assert_eq!(a.absent_target_status, 2);
        assert_eq!(a.records, 2);
    }

    #[test]
    fn out_of_range_status_is_counted_not_dropped() {
        let odd = fold(&[rec(LineSpec::default().status("101", "600")), rec(LineSpec::default().status("000", "200"))]);
        let other = fold(&[rec(LineSpec::default().status("460", "199"))]);
        let a = odd.merge(other);
        assert_eq!(a.unclassified_elb_status, 2);
        assert_eq!(a.unclassified_target_status, 2);
        assert_eq!(a.absent_elb_status, 0);
        let views = a.finish(&ReputationSet::empty(), Tz::UTC);
        assert_eq!(view(&views, "ELB 4xx Count").rows.len(), 1);
        assert_eq!(view(&views, "Backend 2xx Count").rows.len(), 1);
        assert!(view(&views, "ELB 2xx Count").rows.is_empty());
    }

    #[test]
    fn flagged_client_row_carries_reputation() {
        let bad = LineSpec::default().client("203.0.113.5");
        let mut records: Vec<LogRecord> = (0..42).map(|_| rec(bad.clone())).collect();
        records.push(rec(LineSpec::default().client("10.0.0.9")));
        let rep = ReputationSet::from_lines("203.0.113.5\n", "test", None);
        let views = fold(&records).finish(&rep, Tz::UTC);
        let clients = view(&views, "Top 100 Client IP");
        assert_eq!(clients.rows[0], vec![Cell::Int(42), Cell::Text("203.0.113.5".into()), Cell::Flag(true)]);
        assert_eq!(clients.rows[1], vec![Cell::Int(1), Cell::Text("10.0.0.9".into()), Cell::Flag(false)]);
    }

    #[test]
    fn frequency_ties_go_to_first_seen() {
        let late = rec(LineSpec::default().url("https://a.example.com/late").at("2024-03-01T00:05:00.000000Z"));
        let early = rec(LineSpec::default().url("https://z.example.com/early").at("2024-03-01T00:01:00.000000Z"));
        let views = fold(&[late, early]).finish(&ReputationSet::empty(), Tz::UTC);
        let urls = view(&views, "Top 100 Request URL");
        assert_eq!(urls.rows[0][1], Cell::Text("https://z.example.com/early".into()));
    }

    #[test]
    fn three_xx_buckets_include_redirect() {
        let a = rec(LineSpec::default().status("301", "-").redirect("https://x.example.com/"));
        let b = rec(LineSpec::default().status("302", "-").redirect("https://y.example.com/"));
        let views = fold(&[a.clone(), a, b]).finish(&ReputationSet::empty(), Tz::UTC);
        let v = view(&views, "ELB 3xx Count");
        assert_eq!(v.columns.len(), 4);
        assert_eq!(v.rows.len(), 2);
        assert_eq!(v.rows[0][0], Cell::Int(2));
        assert_eq!(v.rows[0][3], Cell::Text("https://x.example.com/".into()));
    }

    #[test]
    fn backend_classes_use_target_status() {
        let r = rec(LineSpec::default().status("502", "503"));
        let views = fold(&[r]).finish(&ReputationSet::empty(), Tz::UTC);
        assert_eq!(view(&views, "ELB 5xx Count").rows.len(), 1);
        assert_eq!(view(&views, "Backend 5xx Count").rows.len(), 1);
        let ts = view(&views, "Backend 5xx Timestamp");
        assert_eq!(ts.rows[0][3], Cell::Int(502));
        assert_eq!(ts.rows[0][4], Cell::Int(503));
    }

    #[test]
    fn error_listing_is_time_ordered() {
        let times = ["2024-03-01T00:03:00.000000Z", "2024-03-01T00:01:00.000000Z", "2024-03-01T00:02:00.000000Z"];
        let recs: Vec<LogRecord> = times.iter().map(|t| rec(LineSpec::default().status("404", "404").at(t))).collect();
        let views = fold(&recs).finish(&ReputationSet::empty(), Tz::UTC);
        let v = view(&views, "ELB 4xx Timestamp");
        let got: Vec<String> = v.rows.iter().map(|r| r[0].render()).collect();
        assert_eq!(got, vec!["2024-03-01 00:01:00.000", "2024-03-01 00:02:00.000", "2024-03-01 00:03:00.000"]);
    }

    #[test]
    fn slow_ranking_is_bounded_and_tie_broken_by_time() {
        let mut a = Aggregator::new(3);
        for (i, total) in ["1.5", "4.0", "0.5", "2.0", "4.0", "3.0"].iter().enumerate() {
            let t = format!("2024-03-01T00:0{}:00.000000Z", 5 - i);
            a.add(&rec(LineSpec::default().times("0", total, "0").at(&t)));
        }
        let views = a.finish(&ReputationSet::empty(), Tz::UTC);
        let v = view(&views, "Top 3 Total Time");
        let got: Vec<(String, String)> = v.rows.iter().map(|r| (r[0].render(), r[1].render())).collect();
        assert_eq!(got, vec![
            ("4.000".to_string(), "2024-03-01 00:01:00.000".to_string()),
            ("4.000".to_string(), "2024-03-01 00:04:00.000".to_string()),
            ("3.000".to_string(), "2024-03-01 00:00:00.000".to_string()),
        ]);
    }

    #[test]
    fn merge_order_does_not_change_views() {
        let recs: Vec<LogRecord> = (0..40).map(|i| {
            let status = ["200", "404", "503", "301"][i % 4];
            rec(LineSpec::default()
                .client(&format!("10.0.0.{}", i % 7))
                .status(status, status)
                .times("0", &format!("{}.25", i % 5), "0")
                .at(&format!("2024-03-01T00:{:02}:00.000000Z", i)))
        }).collect();
        let whole = fold(&recs).finish(&ReputationSet::empty(), Tz::UTC);
        let (left, right) = recs.split_at(17);
        let split = fold(right).merge(fold(left)).finish(&ReputationSet::empty(), Tz::UTC);
        assert_eq!(whole, split);
    }

    #[test]
    fn view_rows_match_distinct_keys() {
        let recs: Vec<LogRecord> = (0..25).map(|i| rec(LineSpec::default().status("404", "404").client(&format!("10.0.1.{}", i % 5)))).collect();
        let views = fold(&recs).finish(&ReputationSet::empty(), Tz::UTC);
        assert_eq!(view(&views, "ELB 4xx Count").rows.len(), 5);
        assert_eq!(view(&views, "ELB 4xx Timestamp").rows.len(), 25);
        let counted: u64 = view(&views, "ELB 4xx Count").rows.iter().map(|r| match r[0] { Cell::Int(c) => c, _ => 0 }).sum();
        assert_eq!(counted, 25);
    }

    #[test]
    fn report_lists_every_view_once() {
        let views = Aggregator::default().finish(&ReputationSet::empty(), Tz::UTC);
        assert_eq!(views.len(), 16);
        let mut names: Vec<&str> = views.iter().map(|v| v.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), 16);
    }
}
