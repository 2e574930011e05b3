use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::error::Result;
use crate::ontology::Ontology;
use crate::types::{Asset, ProjectInfo};

/// Project file: identity plus the interface definition.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectFile {
    #[serde(flatten)]
    pub info: ProjectInfo,
    pub json_interface: Value,
}

/// Read and deserialize a JSON file
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

/// Project identity and its ontology
pub fn load_project(path: &Path) -> Result<(ProjectInfo, Ontology)> {
    let project: ProjectFile = read_json(path)?;
    let ontology = Ontology::from_interface(&project.json_interface)?;
    Ok((project.info, ontology))
}

pub fn load_assets(path: &Path) -> Result<Vec<Asset>> {
    read_json(path)
}
