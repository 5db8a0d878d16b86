use crate::error::{PipelineError, Result};
use chrono::{DateTime, Duration, NaiveDate};
use rand::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use tracing::{debug, info};

pub const REQUIRED_COLUMNS: [&str; 4] = ["Date", "Symbol", "Open", "Close"];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"];

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PanelRecord {
    pub open: f64,
    pub close: f64,
}

/// Date x symbol grid of daily records, possibly with holes.
///
/// `symbols` is sorted and deduplicated; its order fixes the column layout of
/// every tensor built from the panel. `dates` is sorted by calendar value and
/// every entry has a (possibly empty) row in `records`.
#[derive(Clone, Debug, PartialEq)]
pub struct Panel {
    pub symbols: Vec<String>,
    pub dates: Vec<NaiveDate>,
    pub records: HashMap<NaiveDate, HashMap<String, PanelRecord>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParseStats {
    pub rows: usize,
    pub skipped: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FillStats {
    pub filled: usize,
}

/// Reads a `.csv` panel from disk. The extension is checked before the file is touched.
pub async fn load_panel(path: &Path) -> Result<(Panel, ParseStats)> {
    let is_csv = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(".csv"));
    if !is_csv {
        return Err(PipelineError::Format(format!(
            "expected a .csv file, got '{}'",
            path.display()
        )));
    }
    let text = tokio::fs::read_to_string(path).await?;
    parse_panel(&text)
}

pub fn parse_panel(text: &str) -> Result<(Panel, ParseStats)> {
    let mut lines = text.trim().lines().filter(|l| !l.trim().is_empty());
    let header_line = lines
        .next()
        .ok_or_else(|| PipelineError::Format("file is empty, expected a header row".to_string()))?;
    let header: Vec<String> = split_line(header_line)
        .into_iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut idx = [0usize; 4];
    for (slot, name) in idx.iter_mut().zip(REQUIRED_COLUMNS) {
        *slot = header.iter().position(|h| h == name).ok_or_else(|| {
            PipelineError::Format(format!(
                "CSV must contain {} (missing '{}')",
                REQUIRED_COLUMNS.join(","),
                name
            ))
        })?;
    }
    let [date_idx, sym_idx, open_idx, close_idx] = idx;

    let mut records: HashMap<NaiveDate, HashMap<String, PanelRecord>> = HashMap::new();
    let mut symbols = BTreeSet::new();
    let mut stats = ParseStats::default();

    for line in lines {
        stats.rows += 1;
        let row = split_line(line);
        let parsed = (|| {
            let date = parse_date(row.get(date_idx)?)?;
            let symbol = row.get(sym_idx)?.trim();
            if symbol.is_empty() {
                return None;
            }
            let open = parse_price(row.get(open_idx)?)?;
            let close = parse_price(row.get(close_idx)?)?;
            Some((date, symbol.to_string(), PanelRecord { open, close }))
        })();

        let Some((date, symbol, record)) = parsed else {
            debug!("Skipping unparseable row: {}", line);
            stats.skipped += 1;
            continue;
        };
        symbols.insert(symbol.clone());
        records.entry(date).or_default().insert(symbol, record);
    }

    let mut dates: Vec<NaiveDate> = records.keys().copied().collect();
    dates.sort();

    info!(
        "Parsed panel: {} rows ({} skipped), {} symbols, {} dates",
        stats.rows,
        stats.skipped,
        symbols.len(),
        dates.len()
    );

    Ok((
        Panel {
            symbols: symbols.into_iter().collect(),
            dates,
            records,
        },
        stats,
    ))
}

/// Splits on commas outside `"..."` spans and drops the quote characters.
/// Doubled quotes are not treated as escapes.
pub fn split_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut cur = String::new();
    let mut in_quote = false;
    for c in line.chars() {
        match c {
            '"' => in_quote = !in_quote,
            ',' if !in_quote => fields.push(std::mem::take(&mut cur)),
            _ => cur.push(c),
        }
    }
    fields.push(cur);
    fields
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.date_naive()))
}

fn parse_price(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

impl Panel {
    pub fn record(&self, date: &NaiveDate, symbol: &str) -> Option<&PanelRecord> {
        self.records.get(date).and_then(|row| row.get(symbol))
    }

    /// Carries each symbol's last record forward into the next date when that
    /// date lacks it. One ordered pass: date `i` sees date `i - 1` after its own
    /// fill, so runs of missing days are bridged one day at a time. Nothing is
    /// filled backwards, so a symbol stays missing until its first appearance.
    pub fn forward_fill(mut self) -> (Self, FillStats) {
        let mut stats = FillStats::default();
        for i in 1..self.dates.len() {
            let fills: Vec<(String, PanelRecord)> = {
                let prev = self.records.get(&self.dates[i - 1]);
                let cur = self.records.get(&self.dates[i]);
                self.symbols
                    .iter()
                    .filter(|s| cur.is_none_or(|row| !row.contains_key(s.as_str())))
                    .filter_map(|s| {
                        prev.and_then(|row| row.get(s.as_str()))
                            .map(|rec| (s.clone(), *rec))
                    })
                    .collect()
            };
            stats.filled += fills.len();
            let cur = self.records.entry(self.dates[i]).or_default();
            for (symbol, record) in fills {
                cur.insert(symbol, record);
            }
        }
        info!("Forward-filled {} missing (date, symbol) entries", stats.filled);
        (self, stats)
    }

    /// Random-walk panel over consecutive calendar days with no gaps.
    #[allow(dead_code)]
    pub fn new_mock(symbols: &[&str], days: usize) -> Self {
        let mut rng = rand::thread_rng();
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default();
        let mut symbols: Vec<String> = symbols.iter().map(|s| s.to_string()).collect();
        symbols.sort();
        symbols.dedup();

        let mut prices: Vec<f64> = symbols.iter().map(|_| rng.gen_range(50.0..150.0)).collect();
        let mut dates = Vec::with_capacity(days);
        let mut records = HashMap::with_capacity(days);

        for d in 0..days {
            let date = start + Duration::days(d as i64);
            let mut row = HashMap::with_capacity(symbols.len());
            for (s, price) in symbols.iter().zip(prices.iter_mut()) {
                let open = *price;
                let close = open * (1.0 + rng.gen_range(-0.02..0.02));
                row.insert(s.clone(), PanelRecord { open, close });
                *price = close;
            }
            dates.push(date);
            records.insert(date, row);
        }

        Self { symbols, dates, records }
    }
}
