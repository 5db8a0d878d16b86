use crate::config::{PipelineConfig, SCALE_EPS};
use crate::data::{self, FillStats, Panel, PanelRecord, ParseStats};
use crate::error::{PipelineError, Result};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MinMax {
    pub min: f64,
    pub max: f64,
}

impl MinMax {
    fn empty() -> Self {
        Self { min: f64::INFINITY, max: f64::NEG_INFINITY }
    }

    fn update(&mut self, v: f64) {
        self.min = self.min.min(v);
        self.max = self.max.max(v);
    }

    /// May leave [0, 1] for values outside the fitted range.
    pub fn scale(&self, v: f64) -> f64 {
        (v - self.min) / (self.max - self.min + SCALE_EPS)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SymbolBounds {
    pub open: MinMax,
    pub close: MinMax,
}

/// Per-symbol min/max fitted on the training prefix of the date axis only.
/// Symbols with no record inside the prefix have no bounds.
#[derive(Clone, Debug, PartialEq)]
pub struct ScalingParams {
    bounds: HashMap<String, SymbolBounds>,
    train_end: usize,
}

impl ScalingParams {
    pub fn fit(panel: &Panel, train_fraction: f64) -> Self {
        let train_end = (panel.dates.len() as f64 * train_fraction).floor() as usize;
        let train_dates = &panel.dates[..train_end.min(panel.dates.len())];

        let mut bounds = HashMap::with_capacity(panel.symbols.len());
        for s in &panel.symbols {
            let mut open = MinMax::empty();
            let mut close = MinMax::empty();
            let mut seen = false;
            for date in train_dates {
                let Some(rec) = panel.record(date, s) else { continue };
                open.update(rec.open);
                close.update(rec.close);
                seen = true;
            }
            if seen {
                bounds.insert(s.clone(), SymbolBounds { open, close });
            } else {
                warn!("{} has no records in the first {} dates; it cannot be scaled", s, train_end);
            }
        }

        Self { bounds, train_end }
    }

    pub fn train_end(&self) -> usize {
        self.train_end
    }

    pub fn get(&self, symbol: &str) -> Option<&SymbolBounds> {
        self.bounds.get(symbol)
    }

    pub fn scale(&self, symbol: &str, rec: &PanelRecord) -> Option<(f64, f64)> {
        let b = self.get(symbol)?;
        Some((b.open.scale(rec.open), b.close.scale(rec.close)))
    }
}

/// Position of (symbol, horizon day) in a label row.
pub fn label_index(symbol_idx: usize, day: usize, horizon: usize) -> usize {
    symbol_idx * horizon + day
}

/// Row-major window set: each feature row is `[lookback, 2 * symbols]` flattened
/// (scaled open then close per symbol, per day); each label row is `[symbols * horizon]`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Windows {
    pub features: Vec<Vec<f32>>,
    pub labels: Vec<Vec<f32>>,
}

impl Windows {
    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WindowStats {
    pub candidates: usize,
    pub emitted: usize,
    /// Windows touching a (date, symbol) cell with no record after forward fill.
    pub dropped_gaps: usize,
    /// Complete windows needing a symbol that has no training-prefix bounds.
    pub dropped_unscaled: usize,
}

impl WindowStats {
    pub fn dropped(&self) -> usize {
        self.dropped_gaps + self.dropped_unscaled
    }
}

enum WindowDrop {
    Gap,
    Unscaled,
}

/// Slides the lookback/horizon window over the aligned panel in date order.
/// A window missing any (date, symbol) record, or needing an unscalable
/// symbol, is dropped whole.
pub fn build_windows(panel: &Panel, scaling: &ScalingParams, cfg: &PipelineConfig) -> (Windows, WindowStats) {
    let (lookback, horizon) = (cfg.lookback, cfg.horizon);
    let n_dates = panel.dates.len();
    let mut windows = Windows::default();
    let mut stats = WindowStats::default();

    if n_dates < lookback + horizon {
        return (windows, stats);
    }

    for i in lookback..=n_dates - horizon {
        stats.candidates += 1;
        match build_window(panel, scaling, i, lookback, horizon) {
            Ok((features, labels)) => {
                windows.features.push(features);
                windows.labels.push(labels);
                stats.emitted += 1;
            }
            Err(WindowDrop::Gap) => stats.dropped_gaps += 1,
            Err(WindowDrop::Unscaled) => stats.dropped_unscaled += 1,
        }
    }

    info!(
        "Windows: {} candidates, {} emitted, {} dropped for gaps, {} dropped as unscalable",
        stats.candidates, stats.emitted, stats.dropped_gaps, stats.dropped_unscaled
    );
    (windows, stats)
}

fn build_window(
    panel: &Panel,
    scaling: &ScalingParams,
    i: usize,
    lookback: usize,
    horizon: usize,
) -> std::result::Result<(Vec<f32>, Vec<f32>), WindowDrop> {
    let n_sym = panel.symbols.len();
    let span = &panel.dates[i - lookback..i + horizon];
    let complete = span
        .iter()
        .all(|date| panel.symbols.iter().all(|s| panel.record(date, s).is_some()));
    if !complete {
        return Err(WindowDrop::Gap);
    }

    let mut features = Vec::with_capacity(lookback * 2 * n_sym);
    for date in &panel.dates[i - lookback..i] {
        for s in &panel.symbols {
            let rec = panel.record(date, s).ok_or(WindowDrop::Gap)?;
            let (open, close) = scaling.scale(s, rec).ok_or(WindowDrop::Unscaled)?;
            features.push(open as f32);
            features.push(close as f32);
        }
    }

    let base_date = &panel.dates[i - 1];
    let mut labels = vec![0.0f32; n_sym * horizon];
    for (d, date) in panel.dates[i..i + horizon].iter().enumerate() {
        for (s_idx, s) in panel.symbols.iter().enumerate() {
            let base_close = panel.record(base_date, s).ok_or(WindowDrop::Gap)?.close;
            let future_close = panel.record(date, s).ok_or(WindowDrop::Gap)?.close;
            if future_close > base_close {
                labels[label_index(s_idx, d, horizon)] = 1.0;
            }
        }
    }

    Ok((features, labels))
}

/// Chronological split of the inputs handed to the trainer and the evaluator.
#[derive(Clone, Debug, PartialEq)]
pub struct Dataset {
    pub x_train: Vec<Vec<f32>>,
    pub y_train: Vec<Vec<f32>>,
    pub x_test: Vec<Vec<f32>>,
    pub y_test: Vec<Vec<f32>>,
    pub symbols: Vec<String>,
    pub lookback: usize,
    pub horizon: usize,
}

impl Dataset {
    /// Cuts at `floor(n * train_fraction)` without reordering.
    pub fn split(windows: Windows, symbols: Vec<String>, cfg: &PipelineConfig) -> Self {
        let Windows { mut features, mut labels } = windows;
        let split = cfg.train_len(features.len());
        let x_test = features.split_off(split);
        let y_test = labels.split_off(split);
        Self {
            x_train: features,
            y_train: labels,
            x_test,
            y_test,
            symbols,
            lookback: cfg.lookback,
            horizon: cfg.horizon,
        }
    }

    pub fn n_train(&self) -> usize {
        self.x_train.len()
    }

    pub fn n_test(&self) -> usize {
        self.x_test.len()
    }

    /// Feature channels per timestep: scaled open and close for every symbol.
    #[allow(dead_code)]
    pub fn feature_width(&self) -> usize {
        2 * self.symbols.len()
    }

    #[allow(dead_code)]
    pub fn label_width(&self) -> usize {
        self.horizon * self.symbols.len()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub parse: ParseStats,
    pub fill: FillStats,
    pub windows: WindowStats,
}

pub async fn load_dataset(path: &Path, cfg: &PipelineConfig) -> Result<(Dataset, LoadReport)> {
    cfg.validate()?;
    let (panel, parse) = data::load_panel(path).await?;
    let (dataset, mut report) = dataset_from_panel(panel, cfg)?;
    report.parse = parse;
    Ok((dataset, report))
}

#[allow(dead_code)]
pub fn dataset_from_csv(text: &str, cfg: &PipelineConfig) -> Result<(Dataset, LoadReport)> {
    cfg.validate()?;
    let (panel, parse) = data::parse_panel(text)?;
    let (dataset, mut report) = dataset_from_panel(panel, cfg)?;
    report.parse = parse;
    Ok((dataset, report))
}

/// Align, scale, window and split. Fails when no window survives.
pub fn dataset_from_panel(panel: Panel, cfg: &PipelineConfig) -> Result<(Dataset, LoadReport)> {
    cfg.validate()?;
    let (panel, fill) = panel.forward_fill();
    let scaling = ScalingParams::fit(&panel, cfg.train_fraction);
    info!("Scaling bounds fitted on {} of {} dates", scaling.train_end(), panel.dates.len());

    let (windows, window_stats) = build_windows(&panel, &scaling, cfg);
    if windows.is_empty() {
        return Err(PipelineError::DataSufficiency(format!(
            "no valid windows: {} dates, {} candidate positions, {} dropped for gaps, {} dropped as unscalable (need at least {} consecutive complete dates)",
            panel.dates.len(),
            window_stats.candidates,
            window_stats.dropped_gaps,
            window_stats.dropped_unscaled,
            cfg.lookback + cfg.horizon
        )));
    }

    let dataset = Dataset::split(windows, panel.symbols, cfg);
    info!(
        "Dataset ready: {} train / {} test windows, {} symbols",
        dataset.n_train(),
        dataset.n_test(),
        dataset.symbols.len()
    );

    Ok((
        dataset,
        LoadReport {
            parse: ParseStats::default(),
            fill,
            windows: window_stats,
        },
    ))
}
