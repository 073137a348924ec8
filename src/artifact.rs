use std::collections::BTreeMap;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    features: Vec<String>,
    samples: Vec<String>,
    cells: Vec<Option<f64>>,
}

impl Table {
    pub fn new(
        features: Vec<String>,
        samples: Vec<String>,
        cells: Vec<Option<f64>>,
    ) -> Result<Self, String> {
        if cells.len() != features.len() * samples.len() {
            return Err(format!(
                "table has {} cells, expected {} features x {} samples",
                cells.len(),
                features.len(),
                samples.len()
            ));
        }
        Ok(Self {
            features,
            samples,
            cells,
        })
    }

    pub fn from_rows(
        features: Vec<String>,
        samples: Vec<String>,
        rows: Vec<Vec<Option<f64>>>,
    ) -> Result<Self, String> {
        if rows.len() != features.len() {
            return Err(format!(
                "table has {} rows but {} feature labels",
                rows.len(),
                features.len()
            ));
        }
        if let Some((index, row)) = rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != samples.len())
        {
            return Err(format!(
                "row {index} has {} cells but there are {} samples",
                row.len(),
                samples.len()
            ));
        }
        Self::new(features, samples, rows.into_iter().flatten().collect())
    }

    pub fn features(&self) -> &[String] {
        &self.features
    }

    pub fn samples(&self) -> &[String] {
        &self.samples
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.features.len(), self.samples.len())
    }

    pub fn get(&self, feature: usize, sample: usize) -> Option<f64> {
        if feature >= self.features.len() || sample >= self.samples.len() {
            return None;
        }
        self.cells[feature * self.samples.len() + sample]
    }

    pub fn row(&self, feature: usize) -> Option<&[Option<f64>]> {
        if feature >= self.features.len() {
            return None;
        }
        let width = self.samples.len();
        self.cells.get(feature * width..(feature + 1) * width)
    }

    pub fn cells(&self) -> &[Option<f64>] {
        &self.cells
    }

    pub fn has_missing_values(&self) -> bool {
        self.cells.iter().any(|cell| cell.is_none_or(|value| value.is_nan()))
    }

    pub fn summary(&self) -> TableSummary {
        TableSummary {
            features_count: self.features.len(),
            samples_count: self.samples.len(),
            has_missing_values: self.has_missing_values(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    Table(Table),
    Projects(BTreeMap<String, Table>),
    Opaque { description: String },
}

impl Artifact {
    pub fn summary(&self) -> ArtifactSummary {
        match self {
            Artifact::Table(table) => ArtifactSummary::Table(table.summary()),
            Artifact::Projects(projects) => ArtifactSummary::Projects {
                projects: projects
                    .iter()
                    .map(|(name, table)| (name.clone(), table.summary()))
                    .collect(),
            },
            Artifact::Opaque { description } => ArtifactSummary::Opaque {
                description: description.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSummary {
    pub features_count: usize,
    pub samples_count: usize,
    pub has_missing_values: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result_type", rename_all = "snake_case")]
pub enum ArtifactSummary {
    Table(TableSummary),
    Projects {
        projects: BTreeMap<String, TableSummary>,
    },
    Opaque {
        description: String,
    },
}
