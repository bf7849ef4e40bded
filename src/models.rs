use serde::Serialize;

/// One cell of the canonical record set. Missing cells are explicit `Null`,
/// never absent keys.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Number(f64),
    Bool(bool),
    Text(String),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Numeric view of the cell. Numeric-looking text counts, so columns
    /// that arrived as strings can still qualify as numeric.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) => Some(*n),
            CellValue::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
            _ => None,
        }
    }

    /// Display form used for labels, frequency keys and prompt samples.
    pub fn render(&self) -> String {
        match self {
            CellValue::Null => String::new(),
            CellValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{:.0}", n)
                } else {
                    n.to_string()
                }
            }
            CellValue::Bool(b) => b.to_string(),
            CellValue::Text(s) => s.clone(),
        }
    }
}

/// Canonical record set: fixed column set, source row order preserved.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
}

impl RecordSet {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn column_values(&self, idx: usize) -> Vec<&CellValue> {
        self.rows.iter().map(|row| &row[idx]).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InferredType {
    Numeric,
    Categorical,
    Datetime,
    Boolean,
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueCount {
    pub value: String,
    pub count: usize,
}

/// Type-appropriate per-column statistics. Text columns carry none.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ColumnStats {
    #[serde(rename_all = "camelCase")]
    Numeric {
        min: f64,
        max: f64,
        mean: f64,
        std_dev: f64,
    },
    #[serde(rename_all = "camelCase")]
    Categorical { top_values: Vec<ValueCount> },
    #[serde(rename_all = "camelCase")]
    Datetime { min: String, max: String },
    #[serde(rename_all = "camelCase")]
    Boolean { true_count: usize, false_count: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnProfile {
    pub name: String,
    pub inferred_type: InferredType,
    pub non_null_count: usize,
    pub distinct_count: usize,
    pub sample_values: Vec<String>,
    #[serde(flatten)]
    pub stats: Option<ColumnStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataProfile {
    pub row_count: usize,
    pub columns: Vec<ColumnProfile>,
}

impl DataProfile {
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartType {
    Bar,
    Line,
    Pie,
    Scatter,
    Histogram,
}

impl ChartType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "bar" => Some(ChartType::Bar),
            "line" => Some(ChartType::Line),
            "pie" => Some(ChartType::Pie),
            "scatter" => Some(ChartType::Scatter),
            "histogram" => Some(ChartType::Histogram),
            _ => None,
        }
    }

    /// Minimum number of column references a suggestion of this kind needs.
    pub fn min_columns(&self) -> usize {
        match self {
            ChartType::Line | ChartType::Scatter => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Sum,
    Mean,
    Count,
}

impl Default for Aggregation {
    fn default() -> Self {
        Aggregation::Sum
    }
}

impl Aggregation {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "sum" => Some(Aggregation::Sum),
            "mean" | "avg" | "average" => Some(Aggregation::Mean),
            "count" => Some(Aggregation::Count),
            _ => None,
        }
    }
}

/// An AI-proposed chart, already validated against the data profile.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartSuggestion {
    pub chart_type: ChartType,
    pub columns: Vec<String>,
    pub rationale: String,
    pub aggregation: Aggregation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartSeries {
    pub name: String,
    pub values: Vec<f64>,
}

/// Final renderer-agnostic chart description.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartSpec {
    pub chart_type: ChartType,
    pub title: String,
    pub labels: Vec<String>,
    pub series: Vec<ChartSeries>,
}

/// Parsed and validated LLM output, before chart synthesis.
#[derive(Debug, Clone, PartialEq)]
pub struct InsightOutcome {
    pub summary: String,
    pub insights: Vec<String>,
    pub recommendations: Vec<String>,
    pub suggestions: Vec<ChartSuggestion>,
}

/// Complete response payload for both analysis endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub summary: String,
    pub insights: Vec<String>,
    pub statistics: DataProfile,
    pub recommendations: Vec<String>,
    pub charts: Vec<ChartSpec>,
}
