use std::collections::HashMap;

use crate::config::ChartConfig;
use crate::models::{
    Aggregation, ChartSeries, ChartSpec, ChartSuggestion, ChartType, RecordSet,
};

/// Turns validated suggestions into renderer-ready specs. Suggestions that
/// yield no plottable points are dropped, never reported as errors, and the
/// output keeps the input order.
pub fn synthesize(
    suggestions: &[ChartSuggestion],
    records: &RecordSet,
    cfg: &ChartConfig,
) -> Vec<ChartSpec> {
    suggestions
        .iter()
        .filter_map(|suggestion| {
            let spec = synthesize_one(suggestion, records, cfg);
            if spec.is_none() {
                tracing::warn!(
                    "dropping {:?} chart over {:?}: no plottable data",
                    suggestion.chart_type,
                    suggestion.columns
                );
            }
            spec
        })
        .collect()
}

fn synthesize_one(
    suggestion: &ChartSuggestion,
    records: &RecordSet,
    cfg: &ChartConfig,
) -> Option<ChartSpec> {
    match suggestion.chart_type {
        ChartType::Bar | ChartType::Pie => categorical_chart(suggestion, records),
        ChartType::Line | ChartType::Scatter => xy_chart(suggestion, records),
        ChartType::Histogram => histogram_chart(suggestion, records, cfg.histogram_buckets),
    }
}

/// Labels are distinct values of the label column in first-seen order; the
/// series aggregates the value column per label. A single-column suggestion
/// degrades to category counts.
fn categorical_chart(suggestion: &ChartSuggestion, records: &RecordSet) -> Option<ChartSpec> {
    let label_col = suggestion.columns.first()?;
    let label_idx = records.column_index(label_col)?;
    let value_col = suggestion.columns.get(1);
    let value_idx = match value_col {
        Some(col) => Some(records.column_index(col)?),
        None => None,
    };
    let aggregation = match value_idx {
        Some(_) => suggestion.aggregation,
        None => Aggregation::Count,
    };

    let mut order: Vec<String> = Vec::new();
    let mut buckets: HashMap<String, (f64, usize)> = HashMap::new();
    for row in &records.rows {
        let label_cell = &row[label_idx];
        if label_cell.is_null() {
            continue;
        }
        let value = match value_idx {
            Some(idx) => match row[idx].as_number() {
                Some(n) => n,
                None => continue,
            },
            None => 1.0,
        };
        let label = label_cell.render();
        if !buckets.contains_key(&label) {
            order.push(label.clone());
        }
        let entry = buckets.entry(label).or_insert((0.0, 0));
        entry.0 += value;
        entry.1 += 1;
    }

    if order.is_empty() {
        return None;
    }

    let values: Vec<f64> = order
        .iter()
        .map(|label| {
            let (sum, count) = buckets[label];
            match aggregation {
                Aggregation::Sum => sum,
                Aggregation::Mean => sum / count as f64,
                Aggregation::Count => count as f64,
            }
        })
        .collect();

    let series_name = value_col.cloned().unwrap_or_else(|| "count".to_string());
    let title = match value_col {
        Some(value_col) => format!("{} by {}", value_col, label_col),
        None => format!("{} counts", label_col),
    };

    Some(ChartSpec {
        chart_type: suggestion.chart_type,
        title,
        labels: order,
        series: vec![ChartSeries {
            name: series_name,
            values,
        }],
    })
}

/// Labels are x values in row order, the series is the aligned y values.
fn xy_chart(suggestion: &ChartSuggestion, records: &RecordSet) -> Option<ChartSpec> {
    let x_col = suggestion.columns.first()?;
    let y_col = suggestion.columns.get(1)?;
    let x_idx = records.column_index(x_col)?;
    let y_idx = records.column_index(y_col)?;

    let mut labels = Vec::new();
    let mut values = Vec::new();
    for row in &records.rows {
        let x = &row[x_idx];
        if x.is_null() {
            continue;
        }
        let Some(y) = row[y_idx].as_number() else {
            continue;
        };
        labels.push(x.render());
        values.push(y);
    }

    if values.is_empty() {
        return None;
    }

    Some(ChartSpec {
        chart_type: suggestion.chart_type,
        title: format!("{} vs {}", y_col, x_col),
        labels,
        series: vec![ChartSeries {
            name: y_col.clone(),
            values,
        }],
    })
}

/// Equal-width buckets over the observed range; a degenerate range
/// collapses to a single bucket.
fn histogram_chart(
    suggestion: &ChartSuggestion,
    records: &RecordSet,
    bucket_count: usize,
) -> Option<ChartSpec> {
    let col = suggestion.columns.first()?;
    let idx = records.column_index(col)?;
    let bucket_count = bucket_count.max(1);

    let values: Vec<f64> = records
        .rows
        .iter()
        .filter_map(|row| row[idx].as_number())
        .collect();
    if values.is_empty() {
        return None;
    }

    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    let (labels, counts) = if min == max {
        (vec![format_bound(min)], vec![values.len() as f64])
    } else {
        let width = (max - min) / bucket_count as f64;
        let mut counts = vec![0usize; bucket_count];
        for v in &values {
            let bucket = (((v - min) / width) as usize).min(bucket_count - 1);
            counts[bucket] += 1;
        }
        let labels = (0..bucket_count)
            .map(|i| {
                format!(
                    "{} - {}",
                    format_bound(min + width * i as f64),
                    format_bound(min + width * (i + 1) as f64)
                )
            })
            .collect();
        (labels, counts.into_iter().map(|c| c as f64).collect())
    };

    Some(ChartSpec {
        chart_type: ChartType::Histogram,
        title: format!("Distribution of {}", col),
        labels,
        series: vec![ChartSeries {
            name: col.clone(),
            values: counts,
        }],
    })
}

fn format_bound(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{:.0}", value)
    } else {
        format!("{:.2}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CellValue;

    fn cfg() -> ChartConfig {
        ChartConfig::default()
    }

    fn sales_records() -> RecordSet {
        RecordSet {
            columns: vec!["region".into(), "sales".into()],
            rows: vec![
                vec![CellValue::Text("east".into()), CellValue::Number(100.0)],
                vec![CellValue::Text("west".into()), CellValue::Number(50.0)],
                vec![CellValue::Text("east".into()), CellValue::Number(30.0)],
            ],
        }
    }

    fn suggestion(chart_type: ChartType, columns: &[&str], aggregation: Aggregation) -> ChartSuggestion {
        ChartSuggestion {
            chart_type,
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rationale: String::new(),
            aggregation,
        }
    }

    #[test]
    fn bar_chart_sums_by_category() {
        let specs = synthesize(
            &[suggestion(ChartType::Bar, &["region", "sales"], Aggregation::Sum)],
            &sales_records(),
            &cfg(),
        );
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].labels, vec!["east", "west"]);
        assert_eq!(specs[0].series.len(), 1);
        assert_eq!(specs[0].series[0].name, "sales");
        assert_eq!(specs[0].series[0].values, vec![130.0, 50.0]);
    }

    #[test]
    fn bar_chart_mean_aggregation() {
        let specs = synthesize(
            &[suggestion(ChartType::Bar, &["region", "sales"], Aggregation::Mean)],
            &sales_records(),
            &cfg(),
        );
        assert_eq!(specs[0].series[0].values, vec![65.0, 50.0]);
    }

    #[test]
    fn single_column_bar_degrades_to_counts() {
        let specs = synthesize(
            &[suggestion(ChartType::Pie, &["region"], Aggregation::Sum)],
            &sales_records(),
            &cfg(),
        );
        assert_eq!(specs[0].labels, vec!["east", "west"]);
        assert_eq!(specs[0].series[0].name, "count");
        assert_eq!(specs[0].series[0].values, vec![2.0, 1.0]);
    }

    #[test]
    fn null_rows_are_excluded_per_chart() {
        let records = RecordSet {
            columns: vec!["region".into(), "sales".into()],
            rows: vec![
                vec![CellValue::Text("east".into()), CellValue::Number(100.0)],
                vec![CellValue::Null, CellValue::Number(999.0)],
                vec![CellValue::Text("west".into()), CellValue::Null],
                vec![CellValue::Text("west".into()), CellValue::Number(50.0)],
            ],
        };
        let specs = synthesize(
            &[suggestion(ChartType::Bar, &["region", "sales"], Aggregation::Sum)],
            &records,
            &cfg(),
        );
        assert_eq!(specs[0].labels, vec!["east", "west"]);
        assert_eq!(specs[0].series[0].values, vec![100.0, 50.0]);
    }

    #[test]
    fn zero_point_suggestion_is_dropped() {
        let records = RecordSet {
            columns: vec!["region".into(), "sales".into()],
            rows: vec![vec![CellValue::Text("east".into()), CellValue::Null]],
        };
        let specs = synthesize(
            &[
                suggestion(ChartType::Bar, &["region", "sales"], Aggregation::Sum),
                suggestion(ChartType::Pie, &["region"], Aggregation::Sum),
            ],
            &records,
            &cfg(),
        );
        // The bar chart has no plottable points; the pie count chart does.
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].chart_type, ChartType::Pie);
    }

    #[test]
    fn unknown_column_yields_no_spec() {
        let specs = synthesize(
            &[suggestion(ChartType::Bar, &["ghost", "sales"], Aggregation::Sum)],
            &sales_records(),
            &cfg(),
        );
        assert!(specs.is_empty());
    }

    #[test]
    fn scatter_preserves_row_order() {
        let records = RecordSet {
            columns: vec!["x".into(), "y".into()],
            rows: vec![
                vec![CellValue::Number(3.0), CellValue::Number(9.0)],
                vec![CellValue::Number(1.0), CellValue::Number(1.0)],
                vec![CellValue::Number(2.0), CellValue::Null],
                vec![CellValue::Number(2.0), CellValue::Number(4.0)],
            ],
        };
        let specs = synthesize(
            &[suggestion(ChartType::Scatter, &["x", "y"], Aggregation::Sum)],
            &records,
            &cfg(),
        );
        assert_eq!(specs[0].labels, vec!["3", "1", "2"]);
        assert_eq!(specs[0].series[0].values, vec![9.0, 1.0, 4.0]);
    }

    #[test]
    fn histogram_buckets_cover_the_range() {
        let records = RecordSet {
            columns: vec!["v".into()],
            rows: (1..=20).map(|i| vec![CellValue::Number(i as f64)]).collect(),
        };
        let specs = synthesize(
            &[suggestion(ChartType::Histogram, &["v"], Aggregation::Sum)],
            &records,
            &cfg(),
        );
        assert_eq!(specs[0].labels.len(), 10);
        let total: f64 = specs[0].series[0].values.iter().sum();
        assert_eq!(total, 20.0);
        // The maximum lands in the last bucket, not out of range.
        assert!(*specs[0].series[0].values.last().unwrap() >= 1.0);
    }

    #[test]
    fn histogram_degenerate_range_is_one_bucket() {
        let records = RecordSet {
            columns: vec!["v".into()],
            rows: vec![
                vec![CellValue::Number(7.0)],
                vec![CellValue::Number(7.0)],
                vec![CellValue::Number(7.0)],
            ],
        };
        let specs = synthesize(
            &[suggestion(ChartType::Histogram, &["v"], Aggregation::Sum)],
            &records,
            &cfg(),
        );
        assert_eq!(specs[0].labels, vec!["7"]);
        assert_eq!(specs[0].series[0].values, vec![3.0]);
    }

    #[test]
    fn output_order_matches_suggestion_order() {
        let specs = synthesize(
            &[
                suggestion(ChartType::Histogram, &["sales"], Aggregation::Sum),
                suggestion(ChartType::Bar, &["region", "sales"], Aggregation::Sum),
            ],
            &sales_records(),
            &cfg(),
        );
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].chart_type, ChartType::Histogram);
        assert_eq!(specs[1].chart_type, ChartType::Bar);
    }
}
