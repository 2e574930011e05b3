//! Project ontology: the job graph described by a Kili interface definition.
//!
//! An [`Ontology`] is built once per project and shared read-only (usually as
//! `Arc<Ontology>`) by every label parsed against it. Jobs and categories keep
//! the insertion order of the interface definition, which downstream formats
//! rely on for stable class indices.

use indexmap::IndexMap;
use log::warn;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{KiliError, Result};

/// Machine-learning task performed by a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MlTask {
    Classification,
    Transcription,
    ObjectDetection,
    NamedEntitiesRecognition,
    NamedEntitiesRelation,
    ObjectRelation,
    PoseEstimation,
}

impl MlTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            MlTask::Classification => "CLASSIFICATION",
            MlTask::Transcription => "TRANSCRIPTION",
            MlTask::ObjectDetection => "OBJECT_DETECTION",
            MlTask::NamedEntitiesRecognition => "NAMED_ENTITIES_RECOGNITION",
            MlTask::NamedEntitiesRelation => "NAMED_ENTITIES_RELATION",
            MlTask::ObjectRelation => "OBJECT_RELATION",
            MlTask::PoseEstimation => "POSE_ESTIMATION",
        }
    }

    /// Whether the job's content carries a category set.
    pub fn has_categories(&self) -> bool {
        !matches!(self, MlTask::Transcription)
    }
}

impl fmt::Display for MlTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MlTask {
    type Err = KiliError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CLASSIFICATION" => Ok(MlTask::Classification),
            "TRANSCRIPTION" => Ok(MlTask::Transcription),
            "OBJECT_DETECTION" => Ok(MlTask::ObjectDetection),
            "NAMED_ENTITIES_RECOGNITION" => Ok(MlTask::NamedEntitiesRecognition),
            "NAMED_ENTITIES_RELATION" => Ok(MlTask::NamedEntitiesRelation),
            "OBJECT_RELATION" => Ok(MlTask::ObjectRelation),
            "POSE_ESTIMATION" => Ok(MlTask::PoseEstimation),
            other => Err(KiliError::ontology(format!("unknown mlTask '{}'", other))),
        }
    }
}

/// How many categories a job accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobInput {
    Radio,
    Checkbox,
    SingleDropdown,
    MultipleDropdown,
    TextField,
    Number,
    Date,
}

impl JobInput {
    /// Radio-like inputs accept exactly one category.
    pub fn is_single_choice(&self) -> bool {
        matches!(self, JobInput::Radio | JobInput::SingleDropdown)
    }
}

impl FromStr for JobInput {
    type Err = KiliError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "radio" => Ok(JobInput::Radio),
            "checkbox" => Ok(JobInput::Checkbox),
            "singleDropdown" => Ok(JobInput::SingleDropdown),
            "multipleDropdown" => Ok(JobInput::MultipleDropdown),
            "textField" => Ok(JobInput::TextField),
            "number" => Ok(JobInput::Number),
            "date" => Ok(JobInput::Date),
            other => Err(KiliError::ontology(format!("unknown content input '{}'", other))),
        }
    }
}

/// Drawing tool enabled on a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tool {
    Rectangle,
    Polygon,
    Semantic,
    Marker,
    Polyline,
    Vector,
    Pose,
    Other(String),
}

impl From<&str> for Tool {
    fn from(s: &str) -> Self {
        match s {
            "rectangle" => Tool::Rectangle,
            "polygon" => Tool::Polygon,
            "semantic" => Tool::Semantic,
            "marker" => Tool::Marker,
            "polyline" => Tool::Polyline,
            "vector" => Tool::Vector,
            "pose" => Tool::Pose,
            other => Tool::Other(other.to_string()),
        }
    }
}

/// One selectable class within a job.
#[derive(Debug, Clone, PartialEq)]
pub struct Category {
    pub key: String,
    pub name: String,
    pub color: Option<String>,
    pub children: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub ml_task: MlTask,
    pub input: Option<JobInput>,
    pub required: bool,
    pub is_child: bool,
    pub instruction: Option<String>,
    pub tools: Vec<Tool>,
    pub categories: IndexMap<String, Category>,
}

impl Job {
    pub fn category(&self, key: &str) -> Option<&Category> {
        self.categories.get(key)
    }

    /// Zero-based position of a category in the interface's insertion order.
    pub fn category_position(&self, key: &str) -> Option<usize> {
        self.categories.get_index_of(key)
    }

    pub fn is_single_choice(&self) -> bool {
        self.input.is_some_and(|input| input.is_single_choice())
    }

    pub fn has_tool(&self, tool: &Tool) -> bool {
        self.tools.contains(tool)
    }

    /// Object-detection job drawing axis-aligned boxes.
    pub fn is_rectangle_detection(&self) -> bool {
        self.ml_task == MlTask::ObjectDetection && self.has_tool(&Tool::Rectangle)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ontology {
    jobs: IndexMap<String, Job>,
    max_depth: usize,
}

/// Build an ontology from a project's interface definition.
pub fn build_ontology(interface: &Value) -> Result<Ontology> {
    Ontology::from_interface(interface)
}

impl Ontology {
    pub fn from_interface(interface: &Value) -> Result<Self> {
        let jobs_value = interface
            .get("jobs")
            .and_then(Value::as_object)
            .ok_or_else(|| KiliError::ontology("interface has no 'jobs' object"))?;

        let mut jobs = IndexMap::with_capacity(jobs_value.len());
        for (job_id, job_value) in jobs_value {
            let job = parse_job(job_id, job_value)?;
            jobs.insert(job_id.clone(), job);
        }

        // Every referenced child job must exist.
        for job in jobs.values() {
            for category in job.categories.values() {
                for child in &category.children {
                    if !jobs.contains_key(child) {
                        return Err(KiliError::ontology(format!(
                            "category '{}' of job '{}' references unknown child job '{}'",
                            category.key, job.id, child
                        )));
                    }
                }
            }
        }

        let max_depth = longest_child_chain(&jobs)?;

        let reachable: HashSet<&str> = jobs
            .values()
            .flat_map(|job| job.categories.values())
            .flat_map(|category| category.children.iter().map(String::as_str))
            .collect();
        for job in jobs.values().filter(|job| job.is_child) {
            if !reachable.contains(job.id.as_str()) {
                warn!("Child job '{}' is not referenced by any category", job.id);
            }
        }

        Ok(Self { jobs, max_depth })
    }

    pub fn job(&self, job_id: &str) -> Option<&Job> {
        self.jobs.get(job_id)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    /// Top-level jobs in interface order.
    pub fn root_jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values().filter(|job| !job.is_child)
    }

    /// Length of the longest parent → child chain.
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }
}

fn parse_job(job_id: &str, value: &Value) -> Result<Job> {
    let job = value
        .as_object()
        .ok_or_else(|| KiliError::ontology(format!("job '{}' is not an object", job_id)))?;

    let ml_task: MlTask = job
        .get("mlTask")
        .and_then(Value::as_str)
        .ok_or_else(|| KiliError::ontology(format!("job '{}' has no mlTask", job_id)))?
        .parse()?;

    let content = job.get("content").and_then(Value::as_object);

    let input = content
        .and_then(|content| content.get("input"))
        .and_then(Value::as_str)
        .map(JobInput::from_str)
        .transpose()?;

    let categories = if ml_task.has_categories() {
        let categories = content
            .and_then(|content| content.get("categories"))
            .and_then(Value::as_object)
            .ok_or_else(|| {
                KiliError::ontology(format!("job '{}' has no content.categories", job_id))
            })?;
        parse_categories(job_id, categories)?
    } else {
        IndexMap::new()
    };

    let tools = job
        .get("tools")
        .and_then(Value::as_array)
        .map(|tools| tools.iter().filter_map(Value::as_str).map(Tool::from).collect())
        .unwrap_or_default();

    Ok(Job {
        id: job_id.to_string(),
        ml_task,
        input,
        required: flag(job.get("required")),
        is_child: flag(job.get("isChild")),
        instruction: job
            .get("instruction")
            .and_then(Value::as_str)
            .map(str::to_string),
        tools,
        categories,
    })
}

fn parse_categories(job_id: &str, categories: &Map<String, Value>) -> Result<IndexMap<String, Category>> {
    let mut parsed = IndexMap::with_capacity(categories.len());
    for (key, value) in categories {
        let category = value.as_object().ok_or_else(|| {
            KiliError::ontology(format!(
                "category '{}' of job '{}' is not an object",
                key, job_id
            ))
        })?;
        let children = match category.get("children") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(children)) => children
                .iter()
                .map(|child| {
                    child.as_str().map(str::to_string).ok_or_else(|| {
                        KiliError::ontology(format!(
                            "category '{}' of job '{}' has a non-string child",
                            key, job_id
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            Some(_) => {
                return Err(KiliError::ontology(format!(
                    "category '{}' of job '{}' has malformed children",
                    key, job_id
                )))
            }
        };
        parsed.insert(
            key.clone(),
            Category {
                key: key.clone(),
                name: category
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or(key)
                    .to_string(),
                color: category
                    .get("color")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                children,
            },
        );
    }
    Ok(parsed)
}

// Kili stores boolean flags either as booleans or as 0/1.
fn flag(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
        _ => false,
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Visit {
    InProgress,
    Done(usize),
}

/// Depth of the child-job graph, failing on cycles.
fn longest_child_chain(jobs: &IndexMap<String, Job>) -> Result<usize> {
    fn visit<'a>(
        job_id: &'a str,
        jobs: &'a IndexMap<String, Job>,
        state: &mut std::collections::HashMap<&'a str, Visit>,
    ) -> Result<usize> {
        match state.get(job_id) {
            Some(Visit::Done(depth)) => return Ok(*depth),
            Some(Visit::InProgress) => {
                return Err(KiliError::ontology(format!(
                    "child-job graph has a cycle through '{}'",
                    job_id
                )))
            }
            None => {}
        }
        state.insert(job_id, Visit::InProgress);
        let mut depth = 0;
        if let Some(job) = jobs.get(job_id) {
            for category in job.categories.values() {
                for child in &category.children {
                    depth = depth.max(visit(child, jobs, state)? + 1);
                }
            }
        }
        state.insert(job_id, Visit::Done(depth));
        Ok(depth)
    }

    let mut state = std::collections::HashMap::new();
    let mut max_depth = 0;
    for job_id in jobs.keys() {
        max_depth = max_depth.max(visit(job_id, jobs, &mut state)?);
    }
    Ok(max_depth)
}
