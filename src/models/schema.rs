use serde::{Deserialize, Serialize};

use crate::error::{Error, SchemaError};

/// Value type a template column expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Number,
    Date,
}

/// Horizontal band (in image pixels) a column occupies on the paper form.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnRegion {
    pub left: f64,
    pub right: f64,
}

impl ColumnRegion {
    /// Distance from `x` to the band; zero when inside it.
    pub fn distance_to(&self, x: f64) -> f64 {
        if x < self.left {
            self.left - x
        } else if x > self.right {
            x - self.right
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<ColumnRegion>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType, required: bool) -> Self {
        Self {
            name: name.into(),
            column_type,
            required,
            region: None,
        }
    }

    pub fn with_region(mut self, left: f64, right: f64) -> Self {
        self.region = Some(ColumnRegion { left, right });
        self
    }
}

/// Ordered, validated column definitions parsed from the user's template.
///
/// Column order is the output order of the spreadsheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSchema")]
pub struct Schema {
    columns: Vec<ColumnDef>,
}

#[derive(Deserialize)]
struct RawSchema {
    columns: Vec<ColumnDef>,
}

impl TryFrom<RawSchema> for Schema {
    type Error = SchemaError;

    fn try_from(raw: RawSchema) -> Result<Self, Self::Error> {
        Schema::new(raw.columns)
    }
}

impl Schema {
    pub fn new(columns: Vec<ColumnDef>) -> Result<Self, SchemaError> {
        if columns.is_empty() {
            return Err(SchemaError::Empty);
        }
        let mut seen = std::collections::HashSet::new();
        for (i, col) in columns.iter().enumerate() {
            let key = col.name.trim().to_lowercase();
            if key.is_empty() {
                return Err(SchemaError::EmptyName(i));
            }
            if !seen.insert(key) {
                return Err(SchemaError::DuplicateColumn(col.name.clone()));
            }
        }
        Ok(Self { columns })
    }

    /// Parse and validate a template. Column errors surface as [`Error::Json`] because
    /// validation runs inside deserialization.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column(&self, index: usize) -> Option<&ColumnDef> {
        self.columns.get(index)
    }

    /// Case-insensitive lookup of a column position by name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        let wanted = name.trim();
        self.columns
            .iter()
            .position(|c| c.name.trim().eq_ignore_ascii_case(wanted))
    }

    pub fn has_required(&self) -> bool {
        self.columns.iter().any(|c| c.required)
    }

    pub fn has_regions(&self) -> bool {
        self.columns.iter().any(|c| c.region.is_some())
    }
}
