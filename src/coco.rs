//! COCO format data structures, export and import
//!
//! All object-detection jobs share one category list with 1-based ids, in
//! ontology order. Rectangles become `bbox` only; polygons and semantic masks
//! also carry a pixel `segmentation`. COCO is pixel based, so every exported
//! asset needs its width and height.

use chrono::{DateTime, Datelike, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::conversion::{label_file_stem, ArchiveSink, Converter, ExportLabel, SkipLog};
use crate::error::{KiliError, Result};
use crate::geometry::{denormalize, normalize, polygon_area, BoundingBox, Point, Polygon};
use crate::label::{bounding_poly, Geometry, JobResponse, JobResponses, Label};
use crate::ontology::{MlTask, Ontology};
use crate::types::{Asset, InputType, ProjectInfo};
use crate::utils::{file_stem, frame_stem};

pub const COCO_FILE: &str = "annotations.json";

/// COCO dataset information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Info {
    pub year: u32,
    pub version: String,
    pub description: String,
    pub contributor: String,
    pub url: String,
    pub date_created: String,
}

impl Info {
    pub fn for_project(project: &ProjectInfo, exported_at: DateTime<Utc>) -> Self {
        Self {
            year: exported_at.year().max(0) as u32,
            version: "1.0".to_string(),
            description: format!("{} (exported from Kili)", project.title),
            contributor: "kili_export".to_string(),
            url: String::new(),
            date_created: exported_at.date_naive().to_string(),
        }
    }
}

/// COCO license information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct License {
    pub id: u32,
    pub name: String,
    pub url: String,
}

impl Default for License {
    fn default() -> Self {
        Self {
            id: 1,
            name: "Unknown".to_string(),
            url: String::new(),
        }
    }
}

/// COCO category information
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Category {
    pub id: u32,
    pub name: String,
    /// Id of the job the category belongs to
    pub supercategory: String,
}

/// COCO image information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: u32,
    pub file_name: String,
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_license")]
    pub license: u32,
}

fn default_license() -> u32 {
    1
}

/// COCO annotation information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annotation {
    pub id: u32,
    pub image_id: u32,
    pub category_id: u32,
    pub bbox: [f64; 4], // [x, y, width, height]
    pub area: f64,
    #[serde(default)]
    pub iscrowd: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segmentation: Option<Vec<Vec<f64>>>,
}

/// Complete COCO dataset structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CocoFile {
    #[serde(default)]
    pub info: Info,
    #[serde(default)]
    pub licenses: Vec<License>,
    pub categories: Vec<Category>,
    pub images: Vec<Image>,
    pub annotations: Vec<Annotation>,
}

/// Categories of every object-detection job, 1-based, in ontology order.
pub fn coco_categories(ontology: &Ontology) -> Vec<Category> {
    keyed_categories(ontology).into_iter().map(|(_, category)| category).collect()
}

/// COCO categories paired with the `(job id, category key)` they stand for.
/// Display names may repeat inside a job, keys do not.
fn keyed_categories(ontology: &Ontology) -> Vec<((String, String), Category)> {
    ontology
        .root_jobs()
        .filter(|job| job.ml_task == MlTask::ObjectDetection)
        .flat_map(|job| job.categories.iter().map(move |(key, category)| (job, key, category)))
        .enumerate()
        .map(|(index, (job, key, category))| {
            (
                (job.id.clone(), key.clone()),
                Category {
                    id: index as u32 + 1,
                    name: category.name.clone(),
                    supercategory: job.id.clone(),
                },
            )
        })
        .collect()
}

/// Images and annotations of one asset, before ids are assigned.
#[derive(Debug, Default)]
pub struct CocoAssetOutput {
    pub images: Vec<(Image, Vec<Annotation>)>,
}

pub struct CocoConverter {
    categories: Vec<Category>,
    category_ids: HashMap<(String, String), u32>,
    info: Info,
    one_file_per_label: bool,
}

impl CocoConverter {
    pub fn new(
        ontology: &Ontology,
        project: &ProjectInfo,
        exported_at: DateTime<Utc>,
        one_file_per_label: bool,
    ) -> Self {
        let mut category_ids = HashMap::new();
        let mut categories = Vec::new();
        for (job_key, category) in keyed_categories(ontology) {
            category_ids.insert(job_key, category.id);
            categories.push(category);
        }
        Self {
            categories,
            category_ids,
            info: Info::for_project(project, exported_at),
            one_file_per_label,
        }
    }

    fn convert_frame(
        &self,
        frame: &JobResponses,
        width: f64,
        height: f64,
        skips: &mut SkipLog,
    ) -> Result<Vec<Annotation>> {
        let mut annotations = Vec::new();

        for (job_id, response) in frame.iter() {
            let JobResponse::ObjectDetection(response) = response else {
                skips.job(job_id, format!("{} job is not exported to COCO", response.task()));
                continue;
            };
            for annotation in &response.annotations {
                let Some(category_id) = annotation
                    .category()
                    .and_then(|category| self.category_ids.get(&(job_id.to_string(), category.key().to_string())))
                else {
                    skips.annotation(job_id, &annotation.mid, "category has no COCO id");
                    continue;
                };
                let rings: Vec<&Polygon> = match &annotation.geometry {
                    Geometry::Rectangle(_) => Vec::new(),
                    Geometry::Polygon(polygon) => vec![polygon],
                    Geometry::Semantic(rings) => rings.iter().collect(),
                    other => {
                        skips.annotation(
                            job_id,
                            &annotation.mid,
                            format!("{} shapes are not exported to COCO", other.shape_name()),
                        );
                        continue;
                    }
                };
                let Some(bbox) = annotation.geometry.bounding_box() else {
                    continue;
                };
                let pixel_box = denormalize(&bbox?, width, height)?;

                let segmentation = rings
                    .iter()
                    .map(|ring| Ok(denormalize(*ring, width, height)?.flatten()))
                    .collect::<Result<Vec<_>>>()?;
                let area = if segmentation.is_empty() {
                    pixel_box.area()
                } else {
                    segmentation.iter().map(|ring| polygon_area(ring)).sum()
                };

                annotations.push(Annotation {
                    id: 0,
                    image_id: 0,
                    category_id: *category_id,
                    bbox: pixel_box.to_xywh(),
                    area,
                    iscrowd: 0,
                    segmentation: if segmentation.is_empty() { None } else { Some(segmentation) },
                });
                skips.nested(job_id, annotation, "COCO");
            }
        }
        for job_id in frame.passthrough().keys() {
            skips.job(job_id, "job is not part of the ontology");
        }
        Ok(annotations)
    }
}

impl Converter for CocoConverter {
    type Output = CocoAssetOutput;

    fn convert_asset(
        &self,
        asset: &Asset,
        labels: &[ExportLabel<'_>],
        skips: &mut SkipLog,
    ) -> Result<CocoAssetOutput> {
        let (width, height) = asset.dimensions().ok_or_else(|| KiliError::MissingDimensions {
            external_id: asset.external_id.clone(),
            format: "coco",
        })?;
        let stem = file_stem(&asset.external_id);
        let mut output = CocoAssetOutput::default();

        for export_label in labels {
            let label_stem = label_file_stem(&stem, export_label.raw, self.one_file_per_label);
            let frames = export_label.label.frames();
            for (frame_index, frame) in frames.iter().enumerate() {
                let image_stem = if export_label.label.is_video() {
                    frame_stem(&label_stem, frame_index, frames.len())
                } else {
                    label_stem.clone()
                };
                let image = Image {
                    id: 0,
                    file_name: format!("data/{}", image_stem),
                    width: width as u32,
                    height: height as u32,
                    license: 1,
                };
                let annotations = self.convert_frame(frame, width, height, skips)?;
                output.images.push((image, annotations));
            }
        }
        Ok(output)
    }

    fn write_outputs(&self, outputs: Vec<CocoAssetOutput>, sink: &mut dyn ArchiveSink) -> Result<usize> {
        let mut images = Vec::new();
        let mut annotations = Vec::new();

        for (mut image, image_annotations) in outputs.into_iter().flat_map(|output| output.images) {
            image.id = images.len() as u32 + 1;
            for mut annotation in image_annotations {
                annotation.id = annotations.len() as u32 + 1;
                annotation.image_id = image.id;
                annotations.push(annotation);
            }
            images.push(image);
        }
        debug!("COCO: {} images, {} annotations", images.len(), annotations.len());

        let coco = CocoFile {
            info: self.info.clone(),
            licenses: vec![License::default()],
            categories: self.categories.clone(),
            images,
            annotations,
        };
        sink.add_file(COCO_FILE, &serde_json::to_vec_pretty(&coco)?)?;
        Ok(1)
    }
}

/// Build labels from a COCO annotation file. Categories are matched to jobs
/// through their supercategory and to categories by key, then by name in
/// ontology order for names that repeat; image file
/// names without their `data/` prefix give the external ids.
pub fn import_coco(contents: &str, ontology: &Arc<Ontology>) -> Result<Vec<(String, Label)>> {
    let invalid = |message: String| KiliError::InvalidImport {
        format: "coco",
        message,
    };
    let coco: CocoFile = serde_json::from_str(contents)?;

    let mut categories: HashMap<u32, (&str, &str)> = HashMap::new();
    let mut claimed: HashSet<(&str, &str)> = HashSet::new();
    for category in &coco.categories {
        let job = ontology
            .job(&category.supercategory)
            .filter(|job| job.ml_task == MlTask::ObjectDetection)
            .ok_or_else(|| {
                invalid(format!(
                    "category {} refers to unknown object-detection job '{}'",
                    category.id, category.supercategory
                ))
            })?;
        let key = job
            .categories
            .values()
            .find(|c| c.key == category.name)
            .or_else(|| {
                job.categories
                    .values()
                    .find(|c| c.name == category.name && !claimed.contains(&(job.id.as_str(), c.key.as_str())))
            })
            .map(|c| c.key.as_str())
            .ok_or_else(|| {
                invalid(format!("category '{}' is not part of job '{}'", category.name, job.id))
            })?;
        claimed.insert((job.id.as_str(), key));
        categories.insert(category.id, (job.id.as_str(), key));
    }

    let mut per_image: HashMap<u32, Vec<&Annotation>> = HashMap::new();
    for annotation in &coco.annotations {
        per_image.entry(annotation.image_id).or_default().push(annotation);
    }

    coco.images
        .iter()
        .map(|image| {
            let (width, height) = (image.width as f64, image.height as f64);
            let mut payload: Map<String, Value> = Map::new();

            for annotation in per_image.get(&image.id).into_iter().flatten() {
                let (job_id, key) = categories.get(&annotation.category_id).copied().ok_or_else(|| {
                    invalid(format!(
                        "annotation {} uses unknown category {}",
                        annotation.id, annotation.category_id
                    ))
                })?;
                let rings = annotation.segmentation.as_deref().unwrap_or_default();
                let (shape, polygons) = match rings {
                    [] => {
                        let [x, y, w, h] = annotation.bbox;
                        let pixel_box = BoundingBox::from_xywh(x, y, w, h)?;
                        ("rectangle", vec![normalize(&pixel_box, width, height)?.to_polygon()])
                    }
                    rings => {
                        let polygons = rings
                            .iter()
                            .map(|ring| {
                                let vertices: Vec<Point> =
                                    ring.chunks_exact(2).map(|xy| Point::new(xy[0], xy[1])).collect();
                                normalize(&Polygon::new(vertices), width, height)
                            })
                            .collect::<Result<Vec<_>>>()?;
                        (if polygons.len() == 1 { "polygon" } else { "semantic" }, polygons)
                    }
                };

                let job = payload
                    .entry(job_id.to_string())
                    .or_insert_with(|| json!({ "annotations": [] }));
                if let Some(Value::Array(list)) = job.get_mut("annotations") {
                    list.push(json!({
                        "mid": format!("coco-{}", annotation.id),
                        "type": shape,
                        "categories": [{"name": key}],
                        "boundingPoly": bounding_poly(&polygons),
                        "children": {}
                    }));
                }
            }

            let external_id = image
                .file_name
                .strip_prefix("data/")
                .unwrap_or(&image.file_name)
                .to_string();
            let label = Label::parse(&Value::Object(payload), ontology, InputType::Image)?;
            Ok((external_id, label))
        })
        .collect()
}
