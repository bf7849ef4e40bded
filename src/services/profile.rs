use std::collections::HashMap;

use chrono::{NaiveDate, NaiveDateTime};
use rayon::prelude::*;

use crate::config::ProfilerConfig;
use crate::error::AppError;
use crate::models::{
    CellValue, ColumnProfile, ColumnStats, DataProfile, InferredType, RecordSet, ValueCount,
};

const SAMPLE_SIZE: usize = 3;

const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%Y/%m/%d", "%d-%m-%Y"];

/// Structural and statistical profile of a canonical record set. Output is
/// byte-for-byte reproducible for fixed input.
pub fn profile(records: &RecordSet, cfg: &ProfilerConfig) -> Result<DataProfile, AppError> {
    if records.row_count() == 0 || records.column_count() == 0 {
        return Err(AppError::EmptyDataset(
            "record set has no usable rows or columns".to_string(),
        ));
    }

    let columns = records
        .columns
        .iter()
        .enumerate()
        .map(|(idx, name)| profile_column(name, &records.column_values(idx), cfg))
        .collect();

    Ok(DataProfile {
        row_count: records.row_count(),
        columns,
    })
}

fn profile_column(name: &str, values: &[&CellValue], cfg: &ProfilerConfig) -> ColumnProfile {
    let scan = scan_types(values);
    let non_null = scan.non_null;

    // Distinct and frequency bookkeeping in one sequential pass so that
    // first-seen order is preserved for tie-breaking.
    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut first_seen: Vec<String> = Vec::new();
    for value in values.iter().filter(|v| !v.is_null()) {
        let key = value.render();
        if !counts.contains_key(&key) {
            first_seen.push(key.clone());
        }
        *counts.entry(key).or_insert(0) += 1;
    }
    let distinct = first_seen.len();

    let inferred_type = infer_type(&scan, distinct, cfg);
    let stats = column_stats(inferred_type, values, &counts, &first_seen, cfg);

    ColumnProfile {
        name: name.to_string(),
        inferred_type,
        non_null_count: non_null,
        distinct_count: distinct,
        sample_values: values.iter().take(SAMPLE_SIZE).map(|v| v.render()).collect(),
        stats,
    }
}

#[derive(Debug, Default)]
struct TypeScan {
    non_null: usize,
    numeric: usize,
    datetime: usize,
    bool_like: usize,
}

/// Counting scan over one column. Counts are associative so the fold/reduce
/// split cannot affect the result.
fn scan_types(values: &[&CellValue]) -> TypeScan {
    let (non_null, numeric, datetime, bool_like) = values
        .par_iter()
        .filter(|v| !v.is_null())
        .fold(
            || (0usize, 0usize, 0usize, 0usize),
            |(mut non_null, mut numeric, mut datetime, mut bool_like), value| {
                non_null += 1;
                if value.as_number().is_some() {
                    numeric += 1;
                }
                if is_datetime_value(value) {
                    datetime += 1;
                }
                if is_bool_like(value) {
                    bool_like += 1;
                }
                (non_null, numeric, datetime, bool_like)
            },
        )
        .reduce(
            || (0, 0, 0, 0),
            |a, b| (a.0 + b.0, a.1 + b.1, a.2 + b.2, a.3 + b.3),
        );

    TypeScan {
        non_null,
        numeric,
        datetime,
        bool_like,
    }
}

fn infer_type(scan: &TypeScan, distinct: usize, cfg: &ProfilerConfig) -> InferredType {
    if scan.non_null == 0 {
        return InferredType::Text;
    }
    let non_null = scan.non_null as f64;
    if scan.numeric as f64 >= cfg.numeric_threshold * non_null {
        InferredType::Numeric
    } else if scan.datetime as f64 >= cfg.datetime_threshold * non_null {
        InferredType::Datetime
    } else if scan.bool_like == scan.non_null {
        InferredType::Boolean
    } else if (distinct as f64) / non_null < cfg.categorical_ratio {
        InferredType::Categorical
    } else {
        InferredType::Text
    }
}

fn column_stats(
    inferred_type: InferredType,
    values: &[&CellValue],
    counts: &HashMap<String, usize>,
    first_seen: &[String],
    cfg: &ProfilerConfig,
) -> Option<ColumnStats> {
    match inferred_type {
        InferredType::Numeric => {
            let mut running = RunningStats::default();
            for n in values.iter().filter_map(|v| v.as_number()) {
                running.push(n);
            }
            running.finish()
        }
        InferredType::Categorical => {
            // Stable sort keeps first-seen order for equal counts.
            let mut ordered: Vec<ValueCount> = first_seen
                .iter()
                .map(|value| ValueCount {
                    value: value.clone(),
                    count: counts[value],
                })
                .collect();
            ordered.sort_by_key(|vc| std::cmp::Reverse(vc.count));
            ordered.truncate(cfg.top_k);
            Some(ColumnStats::Categorical { top_values: ordered })
        }
        InferredType::Datetime => {
            let mut min: Option<(NaiveDateTime, String)> = None;
            let mut max: Option<(NaiveDateTime, String)> = None;
            for value in values.iter().filter(|v| !v.is_null()) {
                let text = value.render();
                if let Some(parsed) = parse_datetime(&text) {
                    if min.as_ref().map_or(true, |(m, _)| parsed < *m) {
                        min = Some((parsed, text.clone()));
                    }
                    if max.as_ref().map_or(true, |(m, _)| parsed > *m) {
                        max = Some((parsed, text));
                    }
                }
            }
            match (min, max) {
                (Some((_, min)), Some((_, max))) => Some(ColumnStats::Datetime { min, max }),
                _ => None,
            }
        }
        InferredType::Boolean => {
            let true_count = values.iter().filter(|v| bool_value(v) == Some(true)).count();
            let false_count = values
                .iter()
                .filter(|v| bool_value(v) == Some(false))
                .count();
            Some(ColumnStats::Boolean {
                true_count,
                false_count,
            })
        }
        InferredType::Text => None,
    }
}

/// Single-pass min/max/mean/variance. Welford's update avoids the
/// catastrophic cancellation of the naive sum-of-squares form.
#[derive(Debug, Default)]
pub struct RunningStats {
    count: usize,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    pub fn push(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn finish(&self) -> Option<ColumnStats> {
        if self.count == 0 {
            return None;
        }
        Some(ColumnStats::Numeric {
            min: self.min,
            max: self.max,
            mean: self.mean,
            std_dev: (self.m2 / self.count as f64).sqrt(),
        })
    }
}

fn is_datetime_value(value: &CellValue) -> bool {
    match value {
        CellValue::Text(s) => parse_datetime(s).is_some(),
        _ => false,
    }
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    let trimmed = s.trim();
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(dt);
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(trimmed, fmt) {
            return d.and_hms_opt(0, 0, 0);
        }
    }
    chrono::DateTime::parse_from_rfc3339(trimmed)
        .ok()
        .map(|dt| dt.naive_utc())
}

fn is_bool_like(value: &CellValue) -> bool {
    bool_value(value).is_some()
}

/// The boolean value set is {true, false, 0, 1, "true", "false"}.
fn bool_value(value: &CellValue) -> Option<bool> {
    match value {
        CellValue::Bool(b) => Some(*b),
        CellValue::Number(n) if *n == 0.0 => Some(false),
        CellValue::Number(n) if *n == 1.0 => Some(true),
        CellValue::Text(s) => match s.trim().to_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}
