//! Region-to-column assignment policies.

use std::sync::OnceLock;

use regex::Regex;

use crate::config::DEFAULT_COLUMN_GAP;
use crate::models::Schema;
use crate::types::RecognizedRegion;

/// A piece of recognized text destined for one cell.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub text: String,
    pub confidence: Option<f64>,
}

impl Fragment {
    fn of(region: &RecognizedRegion, text: &str) -> Self {
        Self {
            text: text.trim().to_string(),
            confidence: region.confidence,
        }
    }
}

/// One physical line of the sheet, with fragments grouped per schema column.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AlignedLine {
    pub columns: Vec<Vec<Fragment>>,
    pub notes: Vec<String>,
}

impl AlignedLine {
    fn new(column_count: usize) -> Self {
        Self {
            columns: vec![Vec::new(); column_count],
            notes: Vec::new(),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.columns.iter().flatten().all(|f| f.text.is_empty())
    }

    pub fn fragments(&self) -> impl Iterator<Item = &Fragment> {
        self.columns.iter().flatten()
    }
}

/// Strategy for mapping recognized regions onto template columns.
pub trait ColumnAlignment: Send + Sync + std::fmt::Debug {
    fn align(&self, regions: &[RecognizedRegion], schema: &Schema) -> Vec<AlignedLine>;

    fn name(&self) -> &'static str;
}

/// Group regions into lines by vertical position. Without boxes every region is its own line,
/// in recognizer order. Each returned line is sorted left to right.
pub(crate) fn group_lines(regions: &[RecognizedRegion]) -> Vec<Vec<usize>> {
    if regions.iter().any(|r| r.bounds.is_none()) {
        return (0..regions.len()).map(|i| vec![i]).collect();
    }
    let boxes: Vec<_> = regions.iter().filter_map(|r| r.bounds).collect();
    let mut heights: Vec<f64> = boxes.iter().map(|b| b.height).collect();
    heights.sort_by(f64::total_cmp);
    let median = heights.get(heights.len() / 2).copied().unwrap_or(0.0);
    let tolerance = (median / 2.0).max(1.0);

    let mut order: Vec<usize> = (0..boxes.len()).collect();
    order.sort_by(|&a, &b| boxes[a].center_y().total_cmp(&boxes[b].center_y()));

    let mut lines: Vec<Vec<usize>> = Vec::new();
    let mut line_y = 0.0;
    for idx in order {
        let cy = boxes[idx].center_y();
        match lines.last_mut() {
            Some(line) if (cy - line_y).abs() <= tolerance => {
                line.push(idx);
                let n = line.len() as f64;
                line_y += (cy - line_y) / n;
            }
            _ => {
                lines.push(vec![idx]);
                line_y = cy;
            }
        }
    }
    for line in &mut lines {
        line.sort_by(|&a, &b| boxes[a].center_x().total_cmp(&boxes[b].center_x()));
    }
    lines
}

fn field_delimiter() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\t|\||;| {2,}").expect("field delimiter regex"))
}

/// Split a line's text into fields: explicit delimiters first, then single spaces when that
/// yields enough fields to cover the template.
fn split_fields(text: &str, column_count: usize) -> Vec<String> {
    let fields: Vec<String> = field_delimiter()
        .split(text)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    if fields.len() == 1 && column_count > 1 {
        let words: Vec<&str> = text.split_whitespace().collect();
        if words.len() >= column_count {
            return words.into_iter().map(String::from).collect();
        }
    }
    fields
}

/// Place fields left to right; surplus fields are merged into the last column.
fn fill_in_order(fields: Vec<Fragment>, schema: &Schema) -> AlignedLine {
    let n = schema.len();
    let mut line = AlignedLine::new(n);
    let surplus = fields.len().saturating_sub(n);
    for (i, fragment) in fields.into_iter().enumerate() {
        line.columns[i.min(n - 1)].push(fragment);
    }
    if surplus > 0 {
        if let Some(last) = schema.column(n - 1) {
            line.notes.push(format!(
                "{} extra field(s) merged into '{}'",
                surplus, last.name
            ));
        }
    }
    line
}

/// Nearest-column-by-reading-order: the k-th field of a line goes to the k-th column.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadingOrder;

impl ColumnAlignment for ReadingOrder {
    fn align(&self, regions: &[RecognizedRegion], schema: &Schema) -> Vec<AlignedLine> {
        group_lines(regions)
            .into_iter()
            .map(|line| {
                let multi = line.len() > 1;
                let fields: Vec<Fragment> = line
                    .iter()
                    .flat_map(|&idx| {
                        let region = &regions[idx];
                        let pieces: Vec<String> = if multi {
                            field_delimiter()
                                .split(&region.text)
                                .map(str::trim)
                                .filter(|s| !s.is_empty())
                                .map(String::from)
                                .collect()
                        } else {
                            split_fields(&region.text, schema.len())
                        };
                        pieces
                            .into_iter()
                            .map(|p| Fragment::of(region, &p))
                            .collect::<Vec<_>>()
                    })
                    .collect();
                fill_in_order(fields, schema)
            })
            .collect()
    }

    fn name(&self) -> &'static str {
        "reading-order"
    }
}

/// Clusters region x-centres into columns; a gap wider than `gap` pixels starts a new column.
#[derive(Debug, Clone, Copy)]
pub struct ColumnClustering {
    pub gap: f64,
}

impl Default for ColumnClustering {
    fn default() -> Self {
        Self {
            gap: DEFAULT_COLUMN_GAP,
        }
    }
}

impl ColumnAlignment for ColumnClustering {
    fn align(&self, regions: &[RecognizedRegion], schema: &Schema) -> Vec<AlignedLine> {
        let Some(centres) = regions
            .iter()
            .map(|r| r.bounds.map(|b| b.center_x()))
            .collect::<Option<Vec<f64>>>()
        else {
            return ReadingOrder.align(regions, schema);
        };

        let mut by_x: Vec<usize> = (0..regions.len()).collect();
        by_x.sort_by(|&a, &b| centres[a].total_cmp(&centres[b]));
        let mut cluster_of = vec![0usize; regions.len()];
        let mut cluster = 0usize;
        let mut last_x: Option<f64> = None;
        for idx in by_x {
            if let Some(prev) = last_x {
                if centres[idx] - prev > self.gap {
                    cluster += 1;
                }
            }
            cluster_of[idx] = cluster;
            last_x = Some(centres[idx]);
        }
        let clusters = if regions.is_empty() { 0 } else { cluster + 1 };
        let n = schema.len();

        group_lines(regions)
            .into_iter()
            .enumerate()
            .map(|(i, line)| {
                let mut aligned = AlignedLine::new(n);
                for idx in line {
                    let column = cluster_of[idx].min(n - 1);
                    aligned.columns[column].push(Fragment::of(&regions[idx], &regions[idx].text));
                }
                if i == 0 && clusters > n {
                    aligned.notes.push(format!(
                        "{} column(s) detected for a {}-column template",
                        clusters, n
                    ));
                }
                aligned
            })
            .collect()
    }

    fn name(&self) -> &'static str {
        "columns"
    }
}

/// Uses the horizontal bands declared on the template columns.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateRegions;

impl ColumnAlignment for TemplateRegions {
    fn align(&self, regions: &[RecognizedRegion], schema: &Schema) -> Vec<AlignedLine> {
        if !schema.has_regions() || regions.iter().any(|r| r.bounds.is_none()) {
            return ReadingOrder.align(regions, schema);
        }
        group_lines(regions)
            .into_iter()
            .map(|line| {
                let mut aligned = AlignedLine::new(schema.len());
                for idx in line {
                    let region = &regions[idx];
                    let Some(x) = region.bounds.map(|b| b.center_x()) else {
                        continue;
                    };
                    let nearest = schema
                        .columns()
                        .iter()
                        .enumerate()
                        .filter_map(|(i, c)| c.region.map(|r| (i, r.distance_to(x))))
                        .min_by(|a, b| a.1.total_cmp(&b.1))
                        .map(|(i, _)| i);
                    if let Some(column) = nearest {
                        aligned.columns[column].push(Fragment::of(region, &region.text));
                    }
                }
                aligned
            })
            .collect()
    }

    fn name(&self) -> &'static str {
        "template"
    }
}
