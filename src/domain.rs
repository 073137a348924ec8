use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::DromaError;

static PROJECT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    Single,
    Multi,
}

impl DatasetKind {
    pub fn label(&self) -> &'static str {
        match self {
            DatasetKind::Single => "DromaSet",
            DatasetKind::Multi => "MultiDromaSet",
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetKind::Single => write!(f, "single"),
            DatasetKind::Multi => write!(f, "multi"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DatasetId(String);

impl DatasetId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn projects(&self) -> Vec<&str> {
        self.0.split(',').collect()
    }

    pub fn is_multi_project(&self) -> bool {
        self.0.contains(',')
    }

    pub fn default_kind(&self) -> DatasetKind {
        if self.is_multi_project() {
            DatasetKind::Multi
        } else {
            DatasetKind::Single
        }
    }

    pub fn fits(&self, kind: DatasetKind) -> bool {
        match kind {
            DatasetKind::Single => !self.is_multi_project(),
            DatasetKind::Multi => true,
        }
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DatasetId {
    type Err = DromaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut projects: Vec<&str> = Vec::new();
        for name in value.split(',').map(str::trim) {
            if !PROJECT_NAME.is_match(name) {
                return Err(DromaError::InvalidDatasetId(value.to_string()));
            }
            if !projects.contains(&name) {
                projects.push(name);
            }
        }
        Ok(Self(projects.join(",")))
    }
}

impl TryFrom<String> for DatasetId {
    type Error = DromaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DatasetId> for String {
    fn from(value: DatasetId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RuntimeRef(String);

impl RuntimeRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuntimeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
pub enum MolecularType {
    #[serde(rename = "mRNA")]
    #[value(name = "mRNA")]
    Mrna,
    #[serde(rename = "cnv")]
    #[value(name = "cnv")]
    Cnv,
    #[serde(rename = "meth")]
    #[value(name = "meth")]
    Meth,
    #[serde(rename = "proteinrppa")]
    #[value(name = "proteinrppa")]
    ProteinRppa,
    #[serde(rename = "proteinms")]
    #[value(name = "proteinms")]
    ProteinMs,
    #[serde(rename = "mutation_gene")]
    #[value(name = "mutation_gene")]
    MutationGene,
    #[serde(rename = "mutation_site")]
    #[value(name = "mutation_site")]
    MutationSite,
    #[serde(rename = "fusion")]
    #[value(name = "fusion")]
    Fusion,
}

impl MolecularType {
    pub const ALL: [MolecularType; 8] = [
        MolecularType::Mrna,
        MolecularType::Cnv,
        MolecularType::Meth,
        MolecularType::ProteinRppa,
        MolecularType::ProteinMs,
        MolecularType::MutationGene,
        MolecularType::MutationSite,
        MolecularType::Fusion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MolecularType::Mrna => "mRNA",
            MolecularType::Cnv => "cnv",
            MolecularType::Meth => "meth",
            MolecularType::ProteinRppa => "proteinrppa",
            MolecularType::ProteinMs => "proteinms",
            MolecularType::MutationGene => "mutation_gene",
            MolecularType::MutationSite => "mutation_site",
            MolecularType::Fusion => "fusion",
        }
    }

    // Mutation and fusion calls are binary; z-scoring them is a no-op upstream.
    pub fn is_continuous(&self) -> bool {
        !matches!(
            self,
            MolecularType::MutationGene | MolecularType::MutationSite | MolecularType::Fusion
        )
    }
}

impl fmt::Display for MolecularType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MolecularType {
    type Err = DromaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        MolecularType::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| DromaError::InvalidMolecularType(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ValueEnum)]
pub enum DataType {
    #[default]
    #[serde(rename = "all")]
    #[value(name = "all")]
    All,
    #[serde(rename = "CellLine")]
    #[value(name = "CellLine")]
    CellLine,
    #[serde(rename = "PDO")]
    #[value(name = "PDO")]
    Pdo,
    #[serde(rename = "PDC")]
    #[value(name = "PDC")]
    Pdc,
    #[serde(rename = "PDX")]
    #[value(name = "PDX")]
    Pdx,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::All => "all",
            DataType::CellLine => "CellLine",
            DataType::Pdo => "PDO",
            DataType::Pdc => "PDC",
            DataType::Pdx => "PDX",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = DromaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        [
            DataType::All,
            DataType::CellLine,
            DataType::Pdo,
            DataType::Pdc,
            DataType::Pdx,
        ]
        .into_iter()
        .find(|kind| kind.as_str().eq_ignore_ascii_case(trimmed))
        .ok_or_else(|| DromaError::InvalidDataType(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    MolecularProfiles,
    TreatmentResponse,
    MultiMolecularProfiles,
    MultiTreatmentResponse,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::MolecularProfiles => "mol_profiles",
            Operation::TreatmentResponse => "treatment_response",
            Operation::MultiMolecularProfiles => "multi_mol_profiles",
            Operation::MultiTreatmentResponse => "multi_treatment_response",
        }
    }

    pub fn runtime_function(&self) -> &'static str {
        match self {
            Operation::MolecularProfiles => "loadMolecularProfilesNormalized",
            Operation::TreatmentResponse => "loadTreatmentResponseNormalized",
            Operation::MultiMolecularProfiles => "loadMultiProjectMolecularProfilesNormalized",
            Operation::MultiTreatmentResponse => "loadMultiProjectTreatmentResponseNormalized",
        }
    }

    pub fn dataset_kind(&self) -> DatasetKind {
        match self {
            Operation::MolecularProfiles | Operation::TreatmentResponse => DatasetKind::Single,
            Operation::MultiMolecularProfiles | Operation::MultiTreatmentResponse => {
                DatasetKind::Multi
            }
        }
    }

    pub fn needs_molecular_type(&self) -> bool {
        matches!(
            self,
            Operation::MolecularProfiles | Operation::MultiMolecularProfiles
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn multi_id_is_trimmed_and_deduplicated() {
        let id: DatasetId = " CCLE , gCSI,CCLE".parse().unwrap();
        assert_eq!(id.as_str(), "CCLE,gCSI");
        assert_eq!(id.projects(), vec!["CCLE", "gCSI"]);
        assert!(id.is_multi_project());
        assert!(!id.fits(DatasetKind::Single));
    }

    #[test]
    fn id_rejects_runtime_syntax() {
        let err = "CCLE\"); system(\"rm".parse::<DatasetId>().unwrap_err();
        assert_matches!(err, DromaError::InvalidDatasetId(_));
        assert!("".parse::<DatasetId>().is_err());
        assert!("CCLE,".parse::<DatasetId>().is_err());
    }

    #[test]
    fn molecular_type_parses_case_insensitively() {
        assert_eq!("mrna".parse::<MolecularType>().unwrap(), MolecularType::Mrna);
        assert!(!MolecularType::Fusion.is_continuous());
        assert!(MolecularType::Meth.is_continuous());
    }
}
