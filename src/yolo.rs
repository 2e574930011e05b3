//! YOLO v4/v5/v7 export and import.
//!
//! Every version writes the same per-line format,
//! `class_index center_x center_y width height`, normalized to `[0, 1]`. The
//! versions only differ in the companion metadata file. Only axis-aligned
//! boxes of rectangle object-detection jobs are representable.

use log::debug;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::SplitOption;
use crate::conversion::{label_file_stem, ArchivePaths, ArchiveSink, Converter, ExportLabel, SkipLog};
use crate::error::{KiliError, Result};
use crate::geometry::BoundingBox;
use crate::label::{bounding_poly, Geometry, JobResponse, Label};
use crate::ontology::Ontology;
use crate::types::{Asset, InputType};
use crate::utils::{file_stem, format_coordinate, frame_stem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YoloVersion {
    V4,
    V5,
    V7,
}

impl YoloVersion {
    pub fn metadata_file_name(&self) -> &'static str {
        match self {
            YoloVersion::V4 => "classes.txt",
            YoloVersion::V5 | YoloVersion::V7 => "data.yaml",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct YoloClass {
    pub job_id: String,
    pub key: String,
    pub name: String,
}

/// Classes sharing one output directory and one index space.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassGroup {
    /// Directory inside the archive; empty for the merged layout.
    pub directory: String,
    pub classes: Vec<YoloClass>,
}

/// Class indices fixed once per export from the ontology's category order.
#[derive(Debug, Clone, PartialEq)]
pub struct YoloClassMap {
    groups: Vec<ClassGroup>,
    lookup: HashMap<(String, String), (usize, usize)>,
}

impl YoloClassMap {
    pub fn from_ontology(ontology: &Ontology, split_option: SplitOption) -> Self {
        let jobs = ontology
            .root_jobs()
            .filter(|job| job.is_rectangle_detection());

        let mut groups: Vec<ClassGroup> = Vec::new();
        for job in jobs {
            let classes = job.categories.values().map(|category| YoloClass {
                job_id: job.id.clone(),
                key: category.key.clone(),
                name: category.name.clone(),
            });
            match split_option {
                SplitOption::Split => groups.push(ClassGroup {
                    directory: job.id.clone(),
                    classes: classes.collect(),
                }),
                SplitOption::Merged => {
                    if groups.is_empty() {
                        groups.push(ClassGroup {
                            directory: String::new(),
                            classes: Vec::new(),
                        });
                    }
                    groups[0].classes.extend(classes);
                }
            }
        }

        let lookup = groups
            .iter()
            .enumerate()
            .flat_map(|(group_index, group)| {
                group.classes.iter().enumerate().map(move |(class_index, class)| {
                    (
                        (class.job_id.clone(), class.key.clone()),
                        (group_index, class_index),
                    )
                })
            })
            .collect();

        Self { groups, lookup }
    }

    pub fn groups(&self) -> &[ClassGroup] {
        &self.groups
    }

    pub fn has_job(&self, job_id: &str) -> bool {
        self.groups
            .iter()
            .any(|group| group.classes.iter().any(|class| class.job_id == job_id))
    }

    /// `(group, class_index)` of a job's category.
    pub fn class_of(&self, job_id: &str, key: &str) -> Option<(usize, usize)> {
        self.lookup
            .get(&(job_id.to_string(), key.to_string()))
            .copied()
    }
}

/// One `class cx cy w h` line.
pub fn yolo_line(class_index: usize, bbox: &BoundingBox) -> String {
    let (x_center, y_center) = bbox.center();
    format!(
        "{} {} {} {} {}\n",
        class_index,
        format_coordinate(x_center),
        format_coordinate(y_center),
        format_coordinate(bbox.width()),
        format_coordinate(bbox.height())
    )
}

/// Label files of one asset: `(group, stem, contents)`.
pub type YoloFiles = Vec<(usize, String, String)>;

pub struct YoloConverter {
    version: YoloVersion,
    classes: YoloClassMap,
    one_file_per_label: bool,
}

impl YoloConverter {
    pub fn new(version: YoloVersion, classes: YoloClassMap, one_file_per_label: bool) -> Self {
        Self {
            version,
            classes,
            one_file_per_label,
        }
    }

    fn convert_frame(
        &self,
        frame: &crate::label::JobResponses,
        skips: &mut SkipLog,
    ) -> Result<Vec<String>> {
        let mut contents = vec![String::new(); self.classes.groups().len()];

        for (job_id, response) in frame.iter() {
            let annotations = match response {
                JobResponse::ObjectDetection(r) if self.classes.has_job(job_id) => &r.annotations,
                other => {
                    skips.job(job_id, format!("{} job is not exported to YOLO", other.task()));
                    continue;
                }
            };
            for annotation in annotations {
                let Geometry::Rectangle(polygon) = &annotation.geometry else {
                    skips.annotation(
                        job_id,
                        &annotation.mid,
                        format!("{} shapes are not exported to YOLO", annotation.geometry.shape_name()),
                    );
                    continue;
                };
                let Some((group, class_index)) = annotation
                    .category()
                    .and_then(|category| self.classes.class_of(job_id, category.key()))
                else {
                    skips.annotation(job_id, &annotation.mid, "category has no YOLO class");
                    continue;
                };
                let bbox = polygon.bounding_box()?;
                contents[group].push_str(&yolo_line(class_index, &bbox));
                skips.nested(job_id, annotation, "YOLO");
            }
        }
        for job_id in frame.passthrough().keys() {
            skips.job(job_id, "job is not part of the ontology");
        }
        Ok(contents)
    }

    /// Companion metadata for one class group.
    pub fn metadata(&self, group: &ClassGroup) -> String {
        let names: Vec<&str> = group.classes.iter().map(|class| class.name.as_str()).collect();
        match self.version {
            YoloVersion::V4 => names
                .iter()
                .enumerate()
                .map(|(index, name)| format!("{} {}\n", index, name))
                .collect(),
            YoloVersion::V5 => {
                let mut yaml = String::from("path: .\ntrain: images/train\nval: images/val\ntest:\n\n");
                yaml.push_str(&format!("nc: {}\n", names.len()));
                yaml.push_str("names:\n");
                for (index, name) in names.iter().enumerate() {
                    yaml.push_str(&format!("    {}: {}\n", index, yaml_quote(name)));
                }
                yaml
            }
            YoloVersion::V7 => {
                let quoted: Vec<String> = names.iter().map(|name| yaml_quote(name)).collect();
                format!(
                    "train: images/train\nval: images/val\ntest: images/test\n\nnc: {}\nnames: [{}]\n",
                    names.len(),
                    quoted.join(", ")
                )
            }
        }
    }
}

impl Converter for YoloConverter {
    type Output = YoloFiles;

    fn convert_asset(
        &self,
        asset: &Asset,
        labels: &[ExportLabel<'_>],
        skips: &mut SkipLog,
    ) -> Result<YoloFiles> {
        let stem = file_stem(&asset.external_id);
        let mut files = Vec::new();

        for export_label in labels {
            let label_stem = label_file_stem(&stem, export_label.raw, self.one_file_per_label);
            let frames = export_label.label.frames();
            for (frame_index, frame) in frames.iter().enumerate() {
                let frame_file = if export_label.label.is_video() {
                    frame_stem(&label_stem, frame_index, frames.len())
                } else {
                    label_stem.clone()
                };
                for (group, contents) in self.convert_frame(frame, skips)?.into_iter().enumerate() {
                    files.push((group, frame_file.clone(), contents));
                }
            }
        }
        Ok(files)
    }

    fn write_outputs(&self, outputs: Vec<YoloFiles>, sink: &mut dyn ArchiveSink) -> Result<usize> {
        let groups = self.classes.groups();
        let mut paths = ArchivePaths::default();
        let mut written = 0;

        for (group, stem, contents) in outputs.into_iter().flatten() {
            let path = paths.claim(archive_path(&groups[group].directory, &format!("labels/{}.txt", stem)));
            sink.add_file(&path, contents.as_bytes())?;
            written += 1;
        }
        for group in groups {
            let path = archive_path(&group.directory, self.version.metadata_file_name());
            sink.add_file(&path, self.metadata(group).as_bytes())?;
            written += 1;
        }
        debug!("Wrote {} YOLO files", written);
        Ok(written)
    }
}

fn archive_path(directory: &str, file: &str) -> String {
    if directory.is_empty() {
        file.to_string()
    } else {
        format!("{}/{}", directory, file)
    }
}

fn yaml_quote(name: &str) -> String {
    format!("'{}'", name.replace('\'', "''"))
}

/// Class names from a `classes.txt` (v4) or `data.yaml` (v5/v7) file.
pub fn parse_class_names(metadata: &str, version: YoloVersion) -> Result<Vec<String>> {
    let invalid = |message: String| KiliError::InvalidImport {
        format: "yolo",
        message,
    };
    match version {
        YoloVersion::V4 => metadata
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .enumerate()
            .map(|(position, line)| match line.split_once(' ') {
                Some((index, name)) if index.parse::<usize>() == Ok(position) => Ok(name.trim().to_string()),
                Some((index, _)) if index.parse::<usize>().is_ok() => Err(invalid(format!(
                    "class index {} out of order in classes.txt",
                    index
                ))),
                _ => Ok(line.to_string()),
            })
            .collect(),
        YoloVersion::V5 | YoloVersion::V7 => {
            let yaml: serde_yaml::Value = serde_yaml::from_str(metadata)?;
            match yaml.get("names") {
                Some(serde_yaml::Value::Sequence(names)) => names
                    .iter()
                    .map(|name| {
                        name.as_str()
                            .map(str::to_string)
                            .ok_or_else(|| invalid(format!("class name {:?} is not a string", name)))
                    })
                    .collect(),
                Some(serde_yaml::Value::Mapping(names)) => {
                    let mut indexed = names
                        .iter()
                        .map(|(index, name)| match (index.as_u64(), name.as_str()) {
                            (Some(index), Some(name)) => Ok((index, name.to_string())),
                            _ => Err(invalid(format!("malformed names entry {:?}: {:?}", index, name))),
                        })
                        .collect::<Result<Vec<_>>>()?;
                    indexed.sort_by_key(|(index, _)| *index);
                    Ok(indexed.into_iter().map(|(_, name)| name).collect())
                }
                _ => Err(invalid("data.yaml has no 'names'".to_string())),
            }
        }
    }
}

/// Build labels for `job_id` from YOLO label files given as
/// `(external_id, contents)`. Without `class_names`, a class index is the
/// position of the category in the job; with them, classes are matched by
/// category name or key.
pub fn import_yolo(
    files: &[(String, String)],
    ontology: &Arc<Ontology>,
    job_id: &str,
    class_names: Option<&[String]>,
) -> Result<Vec<(String, Label)>> {
    let invalid = |message: String| KiliError::InvalidImport {
        format: "yolo",
        message,
    };
    let job = ontology
        .job(job_id)
        .filter(|job| job.is_rectangle_detection())
        .ok_or_else(|| invalid(format!("'{}' is not a rectangle object-detection job", job_id)))?;

    let category_for = |class_index: usize| -> Option<&str> {
        match class_names {
            Some(names) => {
                let name = names.get(class_index)?;
                job.categories
                    .values()
                    .find(|category| &category.name == name || &category.key == name)
                    .map(|category| category.key.as_str())
            }
            None => job
                .categories
                .get_index(class_index)
                .map(|(key, _)| key.as_str()),
        }
    };

    files
        .iter()
        .map(|(external_id, contents)| {
            let mut annotations = Vec::new();
            for (line_number, line) in contents.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let fields: Vec<&str> = line.split_whitespace().collect();
                let [class, cx, cy, w, h] = fields[..] else {
                    return Err(invalid(format!(
                        "{} line {}: expected 5 fields, found {}",
                        external_id,
                        line_number + 1,
                        fields.len()
                    )));
                };
                let class_index: usize = class.parse().map_err(|_| {
                    invalid(format!("{} line {}: bad class '{}'", external_id, line_number + 1, class))
                })?;
                let values = [cx, cy, w, h]
                    .iter()
                    .map(|value| value.parse::<f64>())
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| invalid(format!("{} line {}: {}", external_id, line_number + 1, e)))?;
                let key = category_for(class_index).ok_or_else(|| {
                    invalid(format!("{}: class {} has no category in job '{}'", external_id, class_index, job_id))
                })?;
                let bbox = BoundingBox::from_center(values[0], values[1], values[2], values[3])?
                    .clamp_normalized()?;

                annotations.push(json!({
                    "mid": format!("{}-yolo-{}", file_stem(external_id), line_number + 1),
                    "type": "rectangle",
                    "categories": [{"name": key}],
                    "boundingPoly": bounding_poly(&[bbox.to_polygon()]),
                    "children": {}
                }));
            }

            let mut payload = Map::new();
            payload.insert(job_id.to_string(), json!({ "annotations": annotations }));
            let label = Label::parse(&Value::Object(payload), ontology, InputType::Image)?;
            Ok((external_id.clone(), label))
        })
        .collect()
}
