#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use csv::{QuoteStyle, Terminator, WriterBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tk_stats::{AggregateRecord, compute_average_histogram};
use tk_types::{
    ExperimentInstanceKey, StatPath, StatTree, StatValue, TreeDescriptor, is_related_query,
    resolve_subtree,
};
use tracing::debug;

#[derive(Debug, Error)]
pub enum TableError {
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// One coordinate of a pivot table.
#[derive(Debug, Clone)]
pub enum AxisValue {
    Count(u64),
    Megabytes(f64),
    Label(String),
}

impl AxisValue {
    fn rank(&self) -> u8 {
        match self {
            Self::Count(_) => 0,
            Self::Megabytes(_) => 1,
            Self::Label(_) => 2,
        }
    }
}

impl PartialEq for AxisValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for AxisValue {}

impl PartialOrd for AxisValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AxisValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Count(left), Self::Count(right)) => left.cmp(right),
            (Self::Megabytes(left), Self::Megabytes(right)) => left.total_cmp(right),
            (Self::Label(left), Self::Label(right)) => left.cmp(right),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl fmt::Display for AxisValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(value) => write!(f, "{value}"),
            Self::Megabytes(value) => f.write_str(&format_float(*value)),
            Self::Label(value) => f.write_str(value),
        }
    }
}

/// Renders a float the way the plotting scripts read it back: integral
/// values keep a `.0` suffix, so `4` prints as `4.0`.
#[must_use]
pub fn format_float(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

/// Statistics trees of every instance that falls into one cell.
pub type Cell<'a> = Vec<&'a StatTree>;
/// series value -> cell
pub type PivotRow<'a> = BTreeMap<AxisValue, Cell<'a>>;
/// varied value -> row
pub type PivotRows<'a> = BTreeMap<AxisValue, PivotRow<'a>>;
/// fixed outer value -> rows; one `.stat` file per outer value and statistic.
pub type PivotTable<'a> = BTreeMap<AxisValue, PivotRows<'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pivot {
    DocumentSize,
    QuerySize,
    K,
}

impl Pivot {
    pub const ALL: [Self; 3] = [Self::DocumentSize, Self::QuerySize, Self::K];

    #[must_use]
    pub fn plot(self) -> PlotSpec {
        match self {
            Self::DocumentSize => PlotSpec {
                name: "vary document size",
                suffix: "k",
                varied: "T",
                series: "Q",
                histogram_names_varied: true,
            },
            Self::QuerySize => PlotSpec {
                name: "vary query size",
                suffix: "k",
                varied: "Q",
                series: "T",
                histogram_names_varied: true,
            },
            Self::K => PlotSpec {
                name: "vary k",
                suffix: "q",
                varied: "k",
                series: "T",
                histogram_names_varied: true,
            },
        }
    }
}

/// Naming of one family of tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlotSpec {
    pub name: &'static str,
    /// Prefix of the fixed outer value in file names.
    pub suffix: &'static str,
    /// Row axis label.
    pub varied: &'static str,
    /// Column axis label.
    pub series: &'static str,
    pub histogram_names_varied: bool,
}

pub const ROUND_PLOT: PlotSpec = PlotSpec {
    name: "rounds",
    suffix: "",
    varied: "round",
    series: "k",
    histogram_names_varied: false,
};

/// Display label for a dataset size (`82.09` -> `TB`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizeSymbol {
    pub size_mb: f64,
    pub label: String,
}

impl SizeSymbol {
    #[must_use]
    pub fn new(size_mb: f64, label: impl Into<String>) -> Self {
        Self {
            size_mb,
            label: label.into(),
        }
    }
}

/// A rendered-ready table; the first row is the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatTable {
    pub file_name: String,
    pub rows: Vec<Vec<String>>,
}

impl StatTable {
    /// Statistic key the table was built for, as it appears in the file name.
    #[must_use]
    pub fn stat_prefix(&self) -> &str {
        self.file_name
            .split('-')
            .next()
            .unwrap_or(&self.file_name)
    }
}

pub struct TableBuilder<'a> {
    name: &'a str,
    records: &'a BTreeMap<ExperimentInstanceKey, AggregateRecord>,
    datasets: &'a [TreeDescriptor],
    queries: &'a [TreeDescriptor],
    ks: &'a [u64],
    symbols: &'a [SizeSymbol],
}

impl<'a> TableBuilder<'a> {
    #[must_use]
    pub fn new(
        name: &'a str,
        records: &'a BTreeMap<ExperimentInstanceKey, AggregateRecord>,
        datasets: &'a [TreeDescriptor],
        queries: &'a [TreeDescriptor],
        ks: &'a [u64],
    ) -> Self {
        Self {
            name,
            records,
            datasets,
            queries,
            ks,
            symbols: &[],
        }
    }

    #[must_use]
    pub fn with_symbols(mut self, symbols: &'a [SizeSymbol]) -> Self {
        self.symbols = symbols;
        self
    }

    fn record(&self, dataset: &TreeDescriptor, query: &TreeDescriptor, k: u64) -> Option<&'a AggregateRecord> {
        if !is_related_query(&dataset.path, &query.path) {
            return None;
        }
        self.records.get(&ExperimentInstanceKey::new(
            dataset.path.clone(),
            query.path.clone(),
            k,
        ))
    }

    /// Full grid over every k, dataset and query. Cells only receive the
    /// records of related dataset/query pairs and may stay empty.
    #[must_use]
    pub fn pivot(&self, pivot: Pivot) -> PivotTable<'a> {
        let mut table = PivotTable::new();
        for &k in self.ks {
            for dataset in self.datasets {
                for query in self.queries {
                    let (outer, varied, series) = match pivot {
                        Pivot::DocumentSize => (
                            AxisValue::Count(k),
                            AxisValue::Megabytes(dataset.size_mb),
                            AxisValue::Count(query.size_nodes),
                        ),
                        Pivot::QuerySize => (
                            AxisValue::Count(k),
                            AxisValue::Count(query.size_nodes),
                            AxisValue::Megabytes(dataset.size_mb),
                        ),
                        Pivot::K => (
                            AxisValue::Count(query.size_nodes),
                            AxisValue::Count(k),
                            AxisValue::Megabytes(dataset.size_mb),
                        ),
                    };
                    let cell = table
                        .entry(outer)
                        .or_default()
                        .entry(varied)
                        .or_default()
                        .entry(series)
                        .or_default();
                    if let Some(record) = self.record(dataset, query, k) {
                        cell.push(&record.stats);
                    }
                }
            }
        }
        table
    }

    /// Per dataset/query pair: round index rows against k columns, with the
    /// round groups found under `rounds` as cells.
    #[must_use]
    pub fn pivot_rounds(&self, rounds: &StatPath) -> PivotTable<'a> {
        let mut table = PivotTable::new();
        for dataset in self.datasets {
            for query in self.queries {
                let mut rows = PivotRows::new();
                for &k in self.ks {
                    let Some(by_round) = self
                        .record(dataset, query, k)
                        .and_then(|record| record.subtree(rounds))
                    else {
                        continue;
                    };
                    for (round, stats) in by_round {
                        let (Ok(index), Some(stats)) = (round.parse::<u64>(), stats.as_subtree())
                        else {
                            continue;
                        };
                        rows.entry(AxisValue::Count(index))
                            .or_default()
                            .entry(AxisValue::Count(k))
                            .or_default()
                            .push(stats);
                    }
                }
                if rows.is_empty() {
                    continue;
                }
                for row in rows.values_mut() {
                    for &k in self.ks {
                        row.entry(AxisValue::Count(k)).or_default();
                    }
                }
                let label = format!(
                    "{}-{}-{}",
                    dataset.file_stem(),
                    parent_stem(&query.path),
                    query.file_stem()
                );
                table.insert(AxisValue::Label(label), rows);
            }
        }
        table
    }

    /// Every table for statistics under `layers` across the three base
    /// pivots, followed by the round tables of each `round_layers` entry.
    #[must_use]
    pub fn stat_tables(&self, layers: &[StatPath], round_layers: &[StatPath]) -> Vec<StatTable> {
        let mut tables = Vec::new();
        for layer in layers {
            for pivot in Pivot::ALL {
                let symbols = (pivot == Pivot::DocumentSize && !self.symbols.is_empty())
                    .then_some(self.symbols);
                tables.extend(render_plot(
                    self.name,
                    &pivot.plot(),
                    layer,
                    &self.pivot(pivot),
                    symbols,
                ));
            }
        }
        for rounds in round_layers {
            tables.extend(render_plot(
                self.name,
                &ROUND_PLOT,
                &StatPath::root(),
                &self.pivot_rounds(rounds),
                None,
            ));
        }
        debug!(tables = tables.len(), "built stat tables");
        tables
    }
}

fn parent_stem(path: &str) -> &str {
    path.rsplit('/')
        .nth(1)
        .map_or("", |dir| dir.split('.').next().unwrap_or(dir))
}

/// Renders the tables of one plot family, one per statistic found under
/// `layers` and fixed outer value.
#[must_use]
pub fn render_plot(
    name: &str,
    plot: &PlotSpec,
    layers: &StatPath,
    table: &PivotTable<'_>,
    symbols: Option<&[SizeSymbol]>,
) -> Vec<StatTable> {
    let mut tables = Vec::new();
    for (key, histogram) in stat_keys(table, layers) {
        for (outer, rows) in table {
            let rows = if histogram {
                histogram_rows(name, plot, layers, &key, rows)
            } else {
                scalar_rows(name, plot, layers, &key, rows, symbols)
            };
            tables.push(StatTable {
                file_name: stat_file_name(&key, plot, outer),
                rows,
            });
        }
    }
    tables
}

/// Statistic keys present under `layers` in any cell, flagged when they hold
/// histograms. Nested groups are not tabulated.
fn stat_keys(table: &PivotTable<'_>, layers: &StatPath) -> BTreeMap<String, bool> {
    let mut keys = BTreeMap::new();
    let trees = table
        .values()
        .flat_map(BTreeMap::values)
        .flat_map(BTreeMap::values)
        .flatten();
    for tree in trees {
        let Some(stats) = resolve_subtree(tree, layers) else {
            continue;
        };
        for (key, value) in stats {
            let histogram = match value {
                StatValue::Subtree(_) => continue,
                StatValue::Histogram(_) => true,
                StatValue::Scalar(_) => key.ends_with("hist"),
            };
            *keys.entry(key.clone()).or_insert(false) |= histogram;
        }
    }
    keys
}

fn stat_file_name(key: &str, plot: &PlotSpec, outer: &AxisValue) -> String {
    format!(
        "{}-{}-{}{}.stat",
        hyphenate(key),
        hyphenate(plot.name),
        hyphenate(plot.suffix),
        outer
    )
}

fn hyphenate(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join("-")
}

fn series_columns<'r>(rows: &'r PivotRows<'_>) -> Vec<&'r AxisValue> {
    rows.values()
        .flat_map(BTreeMap::keys)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn cell_values<'t>(cell: &[&'t StatTree], layers: &StatPath, key: &str) -> Vec<&'t StatValue> {
    cell.iter()
        .filter_map(|tree| resolve_subtree(*tree, layers)?.get(key))
        .collect()
}

fn average_scalar(cell: &[&StatTree], layers: &StatPath, key: &str) -> Option<f64> {
    let values: Vec<f64> = cell_values(cell, layers, key)
        .into_iter()
        .filter_map(StatValue::as_scalar)
        .collect();
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

fn scalar_rows(
    name: &str,
    plot: &PlotSpec,
    layers: &StatPath,
    key: &str,
    rows: &PivotRows<'_>,
    symbols: Option<&[SizeSymbol]>,
) -> Vec<Vec<String>> {
    let columns = series_columns(rows);
    let mut header = vec![plot.varied.to_owned()];
    if symbols.is_some() {
        header.push("SYM".to_owned());
    }
    header.extend(
        columns
            .iter()
            .map(|series| format!("{name}, {} = {series}", plot.series)),
    );
    header.push(String::new());

    let mut out = vec![header];
    for (varied, row) in rows {
        let mut line = vec![varied.to_string()];
        if let Some(symbols) = symbols {
            line.push(symbol_for(symbols, varied).unwrap_or_default());
        }
        for column in &columns {
            line.push(
                row.get(*column)
                    .and_then(|cell| average_scalar(cell, layers, key))
                    .map(format_float)
                    .unwrap_or_default(),
            );
        }
        line.push(String::new());
        out.push(line);
    }
    out
}

fn histogram_rows(
    name: &str,
    plot: &PlotSpec,
    layers: &StatPath,
    key: &str,
    rows: &PivotRows<'_>,
) -> Vec<Vec<String>> {
    let mut header = vec!["val".to_owned()];
    let mut columns = Vec::new();
    for (varied, row) in rows {
        for (series, cell) in row {
            let averaged = compute_average_histogram(
                cell_values(cell, layers, key)
                    .into_iter()
                    .filter_map(StatValue::as_histogram),
            );
            header.push(if plot.histogram_names_varied {
                format!(
                    "{name}, {} = {series}, {} = {varied}",
                    plot.series, plot.varied
                )
            } else {
                format!("{name}, {} = {series}", plot.series)
            });
            columns.push(averaged);
        }
    }
    header.push(String::new());

    let buckets: BTreeSet<i64> = columns.iter().flat_map(BTreeMap::keys).copied().collect();
    let mut out = vec![header];
    for bucket in buckets {
        let mut line = vec![bucket.to_string()];
        line.extend(columns.iter().map(|column| {
            column
                .get(&bucket)
                .copied()
                .map(format_float)
                .unwrap_or_default()
        }));
        line.push(String::new());
        out.push(line);
    }
    out
}

fn symbol_for(symbols: &[SizeSymbol], value: &AxisValue) -> Option<String> {
    let AxisValue::Megabytes(size) = value else {
        return None;
    };
    symbols
        .iter()
        .find(|symbol| (symbol.size_mb - size).abs() < 1e-9)
        .map(|symbol| symbol.label.clone())
}

/// Serializes a table as `;`-separated lines, each ending in `;`.
pub fn render_stat_table(table: &StatTable) -> Result<String, TableError> {
    let mut writer = WriterBuilder::new()
        .delimiter(b';')
        .flexible(true)
        .quote_style(QuoteStyle::Never)
        .terminator(Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    for row in &table.rows {
        writer.write_record(row)?;
    }
    let bytes = writer.into_inner().map_err(|err| err.into_error())?;
    Ok(String::from_utf8(bytes)?)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;
    use tk_stats::AggregateRecord;
    use tk_types::{ExperimentInstanceKey, StatPath, StatValue, TreeDescriptor};

    use super::{AxisValue, SizeSymbol, StatTable, TableBuilder, format_float, render_stat_table};

    fn record(stats: serde_json::Value) -> AggregateRecord {
        let StatValue::Subtree(stats) = StatValue::from_json(&stats).expect("stats") else {
            panic!("expected subtree");
        };
        AggregateRecord { runs: 1, stats }
    }

    fn corpus() -> (Vec<TreeDescriptor>, Vec<TreeDescriptor>) {
        (
            vec![
                TreeDescriptor::new("data/tb.xml", 82.09, 1000),
                TreeDescriptor::new("data/xmark1.xml", 111.12, 2000),
            ],
            vec![
                TreeDescriptor::new("q/tb/tb_q1.xml", 0.01, 5),
                TreeDescriptor::new("q/xmark1/xmark1_q1.xml", 0.01, 5),
            ],
        )
    }

    fn find<'t>(tables: &'t [StatTable], file_name: &str) -> &'t StatTable {
        tables
            .iter()
            .find(|table| table.file_name == file_name)
            .unwrap_or_else(|| panic!("missing table {file_name}"))
    }

    #[test]
    fn base_pivots_render_one_table_per_statistic_and_outer_value() {
        let (datasets, queries) = corpus();
        let records = BTreeMap::from([
            (
                ExperimentInstanceKey::new("data/tb.xml", "q/tb/tb_q1.xml", 10),
                record(json!({"filter": {"global": {"timingfiltering": 4.0}}})),
            ),
            (
                ExperimentInstanceKey::new("data/xmark1.xml", "q/xmark1/xmark1_q1.xml", 10),
                record(json!({"filter": {"global": {"timingfiltering": 8.0}}})),
            ),
        ]);
        let symbols = [SizeSymbol::new(82.09, "TB"), SizeSymbol::new(111.12, "XMark1")];
        let tables = TableBuilder::new("slim", &records, &datasets, &queries, &[10])
            .with_symbols(&symbols)
            .stat_tables(&[StatPath::new(["filter", "global"])], &[]);
        assert_eq!(tables.len(), 3);

        let by_document = render_stat_table(find(&tables, "timingfiltering-vary-document-size-k10.stat"))
            .expect("render");
        assert_eq!(by_document, "T;SYM;slim, Q = 5;\n82.09;TB;4.0;\n111.12;XMark1;8.0;\n");

        let by_query = render_stat_table(find(&tables, "timingfiltering-vary-query-size-k10.stat"))
            .expect("render");
        assert_eq!(by_query, "Q;slim, T = 82.09;slim, T = 111.12;\n5;4.0;8.0;\n");

        let by_k = render_stat_table(find(&tables, "timingfiltering-vary-k-q5.stat")).expect("render");
        assert_eq!(by_k, "k;slim, T = 82.09;slim, T = 111.12;\n10;4.0;8.0;\n");
        assert_eq!(tables[0].stat_prefix(), "timingfiltering");
    }

    #[test]
    fn cells_without_records_stay_empty() {
        let (datasets, queries) = corpus();
        let records = BTreeMap::from([(
            ExperimentInstanceKey::new("data/tb.xml", "q/tb/tb_q1.xml", 10),
            record(json!({"index": {"timingindexing": 3}})),
        )]);
        let tables = TableBuilder::new("slim", &records, &datasets, &queries, &[10])
            .stat_tables(&[StatPath::new(["index"])], &[]);
        let text = render_stat_table(find(&tables, "timingindexing-vary-document-size-k10.stat"))
            .expect("render");
        assert_eq!(text, "T;slim, Q = 5;\n82.09;3.0;\n111.12;;\n");
    }

    #[test]
    fn round_tables_list_rounds_against_k() {
        let (datasets, queries) = corpus();
        let records = BTreeMap::from([
            (
                ExperimentInstanceKey::new("data/tb.xml", "q/tb/tb_q1.xml", 10),
                record(json!({"filter": {"rounds": {
                    "0": {"t": 2, "lenhist": [[1, 2]]},
                    "1": {"t": 4}
                }}})),
            ),
            (
                ExperimentInstanceKey::new("data/tb.xml", "q/tb/tb_q1.xml", 20),
                record(json!({"filter": {"rounds": {"0": {"t": 6, "lenhist": [[1, 4], [2, 1]]}}}})),
            ),
        ]);
        let tables = TableBuilder::new("slim", &records, &datasets, &queries, &[10, 20])
            .stat_tables(&[], &[StatPath::new(["filter", "rounds"])]);
        assert_eq!(tables.len(), 2);

        let scalar = render_stat_table(find(&tables, "t-rounds-tb-tb-tb_q1.stat")).expect("render");
        assert_eq!(scalar, "round;slim, k = 10;slim, k = 20;\n0;2.0;6.0;\n1;4.0;;\n");

        let histogram =
            render_stat_table(find(&tables, "lenhist-rounds-tb-tb-tb_q1.stat")).expect("render");
        let mut lines = histogram.lines();
        assert_eq!(
            lines.next(),
            Some("val;slim, k = 10;slim, k = 20;slim, k = 10;slim, k = 20;")
        );
        assert_eq!(lines.next(), Some("1;2.0;4.0;;;"));
        assert_eq!(lines.next(), Some("2;;1.0;;;"));
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn histogram_headers_name_both_axes_for_base_pivots() {
        let (datasets, queries) = corpus();
        let records = BTreeMap::from([(
            ExperimentInstanceKey::new("data/tb.xml", "q/tb/tb_q1.xml", 10),
            record(json!({"index": {"sizehist": [[0, 1.5]]}})),
        )]);
        let tables = TableBuilder::new("slim", &records, &datasets, &queries, &[10])
            .stat_tables(&[StatPath::new(["index"])], &[]);
        let text = render_stat_table(find(&tables, "sizehist-vary-document-size-k10.stat"))
            .expect("render");
        assert_eq!(
            text,
            "val;slim, Q = 5, T = 82.09;slim, Q = 5, T = 111.12;\n0;1.5;;\n"
        );
    }

    #[test]
    fn integral_floats_keep_their_decimal_point() {
        assert_eq!(format_float(4.0), "4.0");
        assert_eq!(format_float(1.5), "1.5");
        assert_eq!(format_float(-0.25), "-0.25");
        assert_eq!(AxisValue::Megabytes(1791.0).to_string(), "1791.0");
        assert_eq!(AxisValue::Megabytes(82.09).to_string(), "82.09");
        assert_eq!(AxisValue::Count(10).to_string(), "10");
    }

    #[test]
    fn whole_megabyte_sizes_render_with_a_decimal_point() {
        let datasets = vec![TreeDescriptor::new("data/xmark16.xml", 1791.0, 4000)];
        let queries = vec![TreeDescriptor::new("q/xmark16/xmark16_q1.xml", 0.01, 5)];
        let records = BTreeMap::from([(
            ExperimentInstanceKey::new("data/xmark16.xml", "q/xmark16/xmark16_q1.xml", 10),
            record(json!({"index": {"timingindexing": 12}})),
        )]);
        let tables = TableBuilder::new("slim", &records, &datasets, &queries, &[10])
            .stat_tables(&[StatPath::new(["index"])], &[]);
        let by_document = render_stat_table(find(&tables, "timingindexing-vary-document-size-k10.stat"))
            .expect("render");
        assert_eq!(by_document, "T;slim, Q = 5;\n1791.0;12.0;\n");
        let by_query = render_stat_table(find(&tables, "timingindexing-vary-query-size-k10.stat"))
            .expect("render");
        assert_eq!(by_query, "Q;slim, T = 1791.0;\n5;12.0;\n");
    }
}
