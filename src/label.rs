//! Typed view over a raw Kili `jsonResponse`.
//!
//! [`Label::parse`] interprets a payload against an [`Ontology`], dispatching
//! each job on its ML task, and [`Label::to_dict`] turns it back into the exact
//! raw structure. Keys a job response does not model are carried along in an
//! `extra` map, and responses for jobs the ontology does not know are kept
//! verbatim, so re-serialising never loses data.
//!
//! Coordinates are held as `f64`: a vertex written as the JSON integer `0`
//! comes back as `0.0`, which is the same value.

use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{KiliError, Result};
use crate::geometry::{validate_normalized_point, BoundingBox, Point, Polygon};
use crate::ontology::{Job, MlTask, Ontology};
use crate::types::InputType;

/// One label, for one asset, interpreted against its project's ontology.
#[derive(Debug, Clone)]
pub struct Label {
    ontology: Arc<Ontology>,
    input_type: InputType,
    frames: Vec<JobResponses>,
}

impl Label {
    /// Parse a raw payload. Video payloads are keyed by frame index
    /// (`"0"` to `"N-1"`, without gaps); every other input kind has one frame.
    pub fn parse(raw: &Value, ontology: &Arc<Ontology>, input_type: InputType) -> Result<Self> {
        let payload = raw
            .as_object()
            .ok_or_else(|| KiliError::label("payload is not a JSON object"))?;
        let parser = Parser {
            ontology: ontology.as_ref(),
            input_type,
        };

        let frames = if input_type == InputType::Video {
            let mut indexed = payload
                .iter()
                .map(|(key, frame)| {
                    key.parse::<usize>()
                        .map(|index| (index, frame))
                        .map_err(|_| KiliError::label(format!("'{}' is not a frame index", key)))
                })
                .collect::<Result<Vec<_>>>()?;
            indexed.sort_by_key(|(index, _)| *index);

            let mut frames = Vec::with_capacity(indexed.len());
            for (position, (index, frame)) in indexed.into_iter().enumerate() {
                if index != position {
                    return Err(KiliError::label(format!(
                        "video frames are not contiguous: expected frame {}, found {}",
                        position, index
                    )));
                }
                let frame = frame.as_object().ok_or_else(|| {
                    KiliError::label(format!("frame {} is not a JSON object", index))
                })?;
                frames.push(parser.frame(frame)?);
            }
            frames
        } else {
            vec![parser.frame(payload)?]
        };

        Ok(Self {
            ontology: Arc::clone(ontology),
            input_type,
            frames,
        })
    }

    /// Serialise back to the raw payload structure.
    pub fn to_dict(&self) -> Value {
        if self.is_video() {
            let frames: Map<String, Value> = self
                .frames
                .iter()
                .enumerate()
                .map(|(index, frame)| (index.to_string(), frame.to_value()))
                .collect();
            Value::Object(frames)
        } else {
            self.frames
                .first()
                .map(JobResponses::to_value)
                .unwrap_or_else(|| Value::Object(Map::new()))
        }
    }

    pub fn ontology(&self) -> &Arc<Ontology> {
        &self.ontology
    }

    pub fn input_type(&self) -> InputType {
        self.input_type
    }

    pub fn is_video(&self) -> bool {
        self.input_type == InputType::Video
    }

    /// Per-frame responses; a single element for non-video assets.
    pub fn frames(&self) -> &[JobResponses] {
        &self.frames
    }

    /// Responses of a non-video label.
    pub fn jobs(&self) -> Option<&JobResponses> {
        if self.is_video() {
            None
        } else {
            self.frames.first()
        }
    }

    pub fn job(&self, job_id: &str) -> Option<&JobResponse> {
        self.jobs().and_then(|jobs| jobs.get(job_id))
    }
}

/// Mapping from job id to response. Used for a whole frame and for the
/// nested `children` of categories and annotations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobResponses {
    responses: IndexMap<String, JobResponse>,
    passthrough: Map<String, Value>,
}

impl JobResponses {
    pub fn get(&self, job_id: &str) -> Option<&JobResponse> {
        self.responses.get(job_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &JobResponse)> {
        self.responses.iter().map(|(id, response)| (id.as_str(), response))
    }

    /// Entries whose job id is absent from the ontology, kept untouched.
    pub fn passthrough(&self) -> &Map<String, Value> {
        &self.passthrough
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty() && self.passthrough.is_empty()
    }

    pub fn to_value(&self) -> Value {
        let mut map = self.passthrough.clone();
        for (job_id, response) in &self.responses {
            map.insert(job_id.clone(), response.to_value());
        }
        Value::Object(map)
    }

    fn collect_mids<'a>(&'a self, mids: &mut HashSet<&'a str>) {
        for response in self.responses.values() {
            match response {
                JobResponse::Classification(classification) => {
                    for category in &classification.categories {
                        if let Some(children) = &category.children {
                            children.collect_mids(mids);
                        }
                    }
                }
                JobResponse::ObjectDetection(r)
                | JobResponse::NamedEntities(r)
                | JobResponse::PdfEntities(r)
                | JobResponse::PoseEstimation(r) => {
                    for annotation in &r.annotations {
                        mids.insert(annotation.mid.as_str());
                        if let Some(children) = &annotation.children {
                            children.collect_mids(mids);
                        }
                    }
                }
                JobResponse::Relation(_) | JobResponse::Transcription(_) => {}
            }
        }
    }

    fn relations(&self) -> impl Iterator<Item = (&str, &Relation)> {
        self.responses.iter().flat_map(|(job_id, response)| {
            let relations: &[Relation] = match response {
                JobResponse::Relation(r) => &r.relations,
                _ => &[],
            };
            relations.iter().map(move |relation| (job_id.as_str(), relation))
        })
    }
}

/// Task-specific response of one job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResponse {
    Classification(ClassificationResponse),
    Transcription(TranscriptionResponse),
    ObjectDetection(AnnotationsResponse),
    NamedEntities(AnnotationsResponse),
    /// Named entities located on PDF pages.
    PdfEntities(AnnotationsResponse),
    PoseEstimation(AnnotationsResponse),
    Relation(RelationResponse),
}

impl JobResponse {
    pub fn task(&self) -> MlTask {
        match self {
            JobResponse::Classification(_) => MlTask::Classification,
            JobResponse::Transcription(_) => MlTask::Transcription,
            JobResponse::ObjectDetection(_) => MlTask::ObjectDetection,
            JobResponse::NamedEntities(_) | JobResponse::PdfEntities(_) => {
                MlTask::NamedEntitiesRecognition
            }
            JobResponse::PoseEstimation(_) => MlTask::PoseEstimation,
            JobResponse::Relation(r) => match r.kind {
                RelationKind::Entities => MlTask::NamedEntitiesRelation,
                RelationKind::Objects => MlTask::ObjectRelation,
            },
        }
    }

    fn wrong_task(&self, expected: &'static str) -> KiliError {
        KiliError::WrongTask {
            expected,
            found: self.task(),
        }
    }

    pub fn categories(&self) -> Result<&[CategoryInstance]> {
        match self {
            JobResponse::Classification(r) => Ok(&r.categories),
            _ => Err(self.wrong_task("classification")),
        }
    }

    /// The single selected category of a classification response.
    pub fn category(&self) -> Result<&CategoryInstance> {
        match self.categories()? {
            [category] => Ok(category),
            categories => Err(KiliError::label(format!(
                "expected exactly one category, found {}",
                categories.len()
            ))),
        }
    }

    pub fn text(&self) -> Result<&str> {
        match self {
            JobResponse::Transcription(r) => Ok(&r.text),
            _ => Err(self.wrong_task("transcription")),
        }
    }

    pub fn annotations(&self) -> Result<&[Annotation]> {
        match self {
            JobResponse::ObjectDetection(r)
            | JobResponse::NamedEntities(r)
            | JobResponse::PdfEntities(r)
            | JobResponse::PoseEstimation(r) => Ok(&r.annotations),
            _ => Err(self.wrong_task("annotation")),
        }
    }

    pub fn relations(&self) -> Result<&[Relation]> {
        match self {
            JobResponse::Relation(r) => Ok(&r.relations),
            _ => Err(self.wrong_task("relation")),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            JobResponse::Classification(r) => {
                let mut map = r.extra.clone();
                map.insert(
                    "categories".to_string(),
                    r.categories.iter().map(CategoryInstance::to_value).collect(),
                );
                Value::Object(map)
            }
            JobResponse::Transcription(r) => {
                let mut map = r.extra.clone();
                map.insert("text".to_string(), Value::String(r.text.clone()));
                Value::Object(map)
            }
            JobResponse::ObjectDetection(r)
            | JobResponse::NamedEntities(r)
            | JobResponse::PdfEntities(r)
            | JobResponse::PoseEstimation(r) => {
                let mut map = r.extra.clone();
                map.insert(
                    "annotations".to_string(),
                    r.annotations.iter().map(Annotation::to_value).collect(),
                );
                Value::Object(map)
            }
            JobResponse::Relation(r) => {
                let mut map = r.extra.clone();
                map.insert(
                    "annotations".to_string(),
                    r.relations
                        .iter()
                        .map(|relation| relation.to_value(r.kind))
                        .collect(),
                );
                Value::Object(map)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationResponse {
    pub categories: Vec<CategoryInstance>,
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptionResponse {
    pub text: String,
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationsResponse {
    pub annotations: Vec<Annotation>,
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    Entities,
    Objects,
}

impl RelationKind {
    fn keys(&self) -> (&'static str, &'static str) {
        match self {
            RelationKind::Entities => ("startEntities", "endEntities"),
            RelationKind::Objects => ("startObjects", "endObjects"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationResponse {
    pub kind: RelationKind,
    pub relations: Vec<Relation>,
    pub extra: Map<String, Value>,
}

/// A selected category.
///
/// [`display_name`](Self::display_name) returns the name configured in the
/// ontology (for example `"A"`), while [`key`](Self::key) returns the raw
/// category key stored in the payload (for example `"CATEGORY_A"`). Only the
/// key is written back by [`Label::to_dict`].
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryInstance {
    key: String,
    display_name: String,
    confidence: Option<u8>,
    children: Option<JobResponses>,
    extra: Map<String, Value>,
}

impl CategoryInstance {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Confidence in `[0, 100]`, when the payload carries one.
    pub fn confidence(&self) -> Option<u8> {
        self.confidence
    }

    pub fn children(&self) -> Option<&JobResponses> {
        self.children.as_ref()
    }

    pub fn to_value(&self) -> Value {
        let mut map = self.extra.clone();
        map.insert("name".to_string(), Value::String(self.key.clone()));
        if let Some(confidence) = self.confidence {
            map.insert("confidence".to_string(), Value::from(confidence));
        }
        if let Some(children) = &self.children {
            map.insert("children".to_string(), children.to_value());
        }
        Value::Object(map)
    }
}

/// One drawn or highlighted instance within a job.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub mid: String,
    pub categories: Vec<CategoryInstance>,
    pub geometry: Geometry,
    pub children: Option<JobResponses>,
    pub extra: Map<String, Value>,
}

impl Annotation {
    /// First selected category.
    pub fn category(&self) -> Option<&CategoryInstance> {
        self.categories.first()
    }

    pub fn to_value(&self) -> Value {
        let mut map = self.extra.clone();
        map.insert("mid".to_string(), Value::String(self.mid.clone()));
        map.insert(
            "categories".to_string(),
            self.categories.iter().map(CategoryInstance::to_value).collect(),
        );
        if let Some(children) = &self.children {
            map.insert("children".to_string(), children.to_value());
        }
        self.geometry.write_into(&mut map);
        Value::Object(map)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Keypoint {
    pub code: String,
    pub point: Point,
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PdfRegion {
    pub pages: Vec<u32>,
    pub polygons: Vec<Polygon>,
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextSpan {
    pub begin_offset: u64,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    /// Axis-aligned box, four normalized vertices.
    Rectangle(Polygon),
    Polygon(Polygon),
    /// Mask made of one or more rings.
    Semantic(Vec<Polygon>),
    Point(Point),
    Polyline(Vec<Point>),
    Vector(Vec<Point>),
    Pose(Vec<Keypoint>),
    PdfRegions(Vec<PdfRegion>),
    TextSpan(TextSpan),
}

impl Geometry {
    pub fn shape_name(&self) -> &'static str {
        match self {
            Geometry::Rectangle(_) => "rectangle",
            Geometry::Polygon(_) => "polygon",
            Geometry::Semantic(_) => "semantic",
            Geometry::Point(_) => "marker",
            Geometry::Polyline(_) => "polyline",
            Geometry::Vector(_) => "vector",
            Geometry::Pose(_) => "pose",
            Geometry::PdfRegions(_) => "pdf",
            Geometry::TextSpan(_) => "text span",
        }
    }

    /// Enclosing normalized box of area-like geometries.
    pub fn bounding_box(&self) -> Option<Result<BoundingBox>> {
        match self {
            Geometry::Rectangle(polygon) | Geometry::Polygon(polygon) => {
                Some(polygon.bounding_box())
            }
            Geometry::Semantic(rings) => {
                let vertices: Vec<Point> =
                    rings.iter().flat_map(|ring| ring.vertices.clone()).collect();
                Some(BoundingBox::from_vertices(&vertices))
            }
            _ => None,
        }
    }

    fn write_into(&self, map: &mut Map<String, Value>) {
        let shape = |map: &mut Map<String, Value>, name: &str| {
            map.insert("type".to_string(), Value::String(name.to_string()));
        };
        match self {
            Geometry::Rectangle(polygon) => {
                shape(map, "rectangle");
                map.insert("boundingPoly".to_string(), bounding_poly(std::slice::from_ref(polygon)));
            }
            Geometry::Polygon(polygon) => {
                shape(map, "polygon");
                map.insert("boundingPoly".to_string(), bounding_poly(std::slice::from_ref(polygon)));
            }
            Geometry::Semantic(rings) => {
                shape(map, "semantic");
                map.insert("boundingPoly".to_string(), bounding_poly(rings));
            }
            Geometry::Point(point) => {
                shape(map, "marker");
                map.insert("point".to_string(), point.to_value());
            }
            Geometry::Polyline(points) => {
                shape(map, "polyline");
                map.insert("polyline".to_string(), points.iter().map(|p| p.to_value()).collect());
            }
            Geometry::Vector(points) => {
                shape(map, "vector");
                map.insert("polyline".to_string(), points.iter().map(|p| p.to_value()).collect());
            }
            Geometry::Pose(keypoints) => {
                let points = keypoints
                    .iter()
                    .map(|keypoint| {
                        let mut point = keypoint.extra.clone();
                        point.insert("code".to_string(), Value::String(keypoint.code.clone()));
                        point.insert("point".to_string(), keypoint.point.to_value());
                        Value::Object(point)
                    })
                    .collect();
                map.insert("points".to_string(), points);
            }
            Geometry::PdfRegions(regions) => {
                let regions = regions
                    .iter()
                    .map(|region| {
                        let mut value = region.extra.clone();
                        value.insert("pageNumberArray".to_string(), region.pages.iter().copied().collect());
                        value.insert("polys".to_string(), bounding_poly(&region.polygons));
                        Value::Object(value)
                    })
                    .collect();
                map.insert("annotations".to_string(), regions);
            }
            Geometry::TextSpan(span) => {
                map.insert("beginOffset".to_string(), Value::from(span.begin_offset));
                map.insert("content".to_string(), Value::String(span.content.clone()));
            }
        }
    }
}

/// Link between annotations of the same frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Relation {
    pub mid: Option<String>,
    pub categories: Vec<CategoryInstance>,
    pub start: Vec<String>,
    pub end: Vec<String>,
    pub extra: Map<String, Value>,
}

impl Relation {
    fn to_value(&self, kind: RelationKind) -> Value {
        let endpoints = |mids: &[String]| -> Value {
            mids.iter()
                .map(|mid| {
                    let mut endpoint = Map::new();
                    endpoint.insert("mid".to_string(), Value::String(mid.clone()));
                    Value::Object(endpoint)
                })
                .collect()
        };
        let (start_key, end_key) = kind.keys();
        let mut map = self.extra.clone();
        if let Some(mid) = &self.mid {
            map.insert("mid".to_string(), Value::String(mid.clone()));
        }
        map.insert(
            "categories".to_string(),
            self.categories.iter().map(CategoryInstance::to_value).collect(),
        );
        map.insert(start_key.to_string(), endpoints(&self.start));
        map.insert(end_key.to_string(), endpoints(&self.end));
        Value::Object(map)
    }
}

pub(crate) fn bounding_poly(polygons: &[Polygon]) -> Value {
    polygons
        .iter()
        .map(|polygon| {
            let mut ring = Map::new();
            ring.insert(
                "normalizedVertices".to_string(),
                polygon.vertices.iter().map(|p| p.to_value()).collect(),
            );
            Value::Object(ring)
        })
        .collect()
}

struct Parser<'a> {
    ontology: &'a Ontology,
    input_type: InputType,
}

impl Parser<'_> {
    fn frame(&self, payload: &Map<String, Value>) -> Result<JobResponses> {
        let frame = self.responses(payload, 0)?;
        validate_relations(&frame)?;
        Ok(frame)
    }

    fn responses(&self, payload: &Map<String, Value>, depth: usize) -> Result<JobResponses> {
        if !payload.is_empty() && depth > self.ontology.max_depth() {
            return Err(KiliError::label(format!(
                "children nested {} levels deep, the ontology allows {}",
                depth,
                self.ontology.max_depth()
            )));
        }

        let mut responses = JobResponses::default();
        for (job_id, value) in payload {
            match self.ontology.job(job_id) {
                Some(job) => {
                    let response = self.response(job, value, depth)?;
                    responses.responses.insert(job_id.clone(), response);
                }
                None => {
                    responses.passthrough.insert(job_id.clone(), value.clone());
                }
            }
        }
        Ok(responses)
    }

    fn response(&self, job: &Job, value: &Value, depth: usize) -> Result<JobResponse> {
        let mut fields = object(value, || format!("response of job '{}'", job.id))?;

        match job.ml_task {
            MlTask::Classification => {
                let categories = take_array(&mut fields, "categories", &job.id)?
                    .iter()
                    .map(|category| self.category(job, category, depth))
                    .collect::<Result<Vec<_>>>()?;
                if job.is_single_choice() && categories.len() > 1 {
                    return Err(KiliError::label(format!(
                        "job '{}' accepts one category, found {}",
                        job.id,
                        categories.len()
                    )));
                }
                Ok(JobResponse::Classification(ClassificationResponse {
                    categories,
                    extra: fields,
                }))
            }
            MlTask::Transcription => match fields.remove("text") {
                Some(Value::String(text)) => Ok(JobResponse::Transcription(TranscriptionResponse {
                    text,
                    extra: fields,
                })),
                _ => Err(KiliError::label(format!(
                    "transcription job '{}' has no text",
                    job.id
                ))),
            },
            MlTask::ObjectDetection | MlTask::PoseEstimation | MlTask::NamedEntitiesRecognition => {
                let annotations = take_array(&mut fields, "annotations", &job.id)?
                    .iter()
                    .map(|annotation| self.annotation(job, annotation, depth))
                    .collect::<Result<Vec<_>>>()?;
                let response = AnnotationsResponse {
                    annotations,
                    extra: fields,
                };
                Ok(match job.ml_task {
                    MlTask::ObjectDetection => JobResponse::ObjectDetection(response),
                    MlTask::PoseEstimation => JobResponse::PoseEstimation(response),
                    _ if self.input_type == InputType::Pdf => JobResponse::PdfEntities(response),
                    _ => JobResponse::NamedEntities(response),
                })
            }
            MlTask::NamedEntitiesRelation | MlTask::ObjectRelation => {
                let kind = if job.ml_task == MlTask::ObjectRelation {
                    RelationKind::Objects
                } else {
                    RelationKind::Entities
                };
                let relations = take_array(&mut fields, "annotations", &job.id)?
                    .iter()
                    .map(|relation| self.relation(job, kind, relation, depth))
                    .collect::<Result<Vec<_>>>()?;
                Ok(JobResponse::Relation(RelationResponse {
                    kind,
                    relations,
                    extra: fields,
                }))
            }
        }
    }

    fn category(&self, job: &Job, value: &Value, depth: usize) -> Result<CategoryInstance> {
        let mut fields = object(value, || format!("category of job '{}'", job.id))?;
        let key = match fields.remove("name") {
            Some(Value::String(key)) => key,
            _ => {
                return Err(KiliError::label(format!(
                    "category without a name in job '{}'",
                    job.id
                )))
            }
        };
        let category = job.category(&key).ok_or_else(|| {
            KiliError::label(format!(
                "category '{}' does not exist in job '{}'",
                key, job.id
            ))
        })?;
        let confidence = match fields.remove("confidence") {
            None => None,
            Some(value) => Some(
                value
                    .as_u64()
                    .filter(|confidence| *confidence <= 100)
                    .map(|confidence| confidence as u8)
                    .ok_or_else(|| {
                        KiliError::label(format!(
                            "confidence {} of category '{}' is not an integer in [0, 100]",
                            value, key
                        ))
                    })?,
            ),
        };
        let children = self.children(&mut fields, depth)?;

        Ok(CategoryInstance {
            display_name: category.name.clone(),
            key,
            confidence,
            children,
            extra: fields,
        })
    }

    fn children(&self, fields: &mut Map<String, Value>, depth: usize) -> Result<Option<JobResponses>> {
        match fields.remove("children") {
            None => Ok(None),
            Some(Value::Object(children)) => Ok(Some(self.responses(&children, depth + 1)?)),
            Some(other) => Err(KiliError::label(format!("children must be an object, got {}", other))),
        }
    }

    fn annotation(&self, job: &Job, value: &Value, depth: usize) -> Result<Annotation> {
        let mut fields = object(value, || format!("annotation of job '{}'", job.id))?;
        let mid = match fields.remove("mid") {
            Some(Value::String(mid)) => mid,
            _ => {
                return Err(KiliError::label(format!(
                    "annotation without mid in job '{}'",
                    job.id
                )))
            }
        };
        let categories = take_array(&mut fields, "categories", &job.id)?
            .iter()
            .map(|category| self.category(job, category, depth))
            .collect::<Result<Vec<_>>>()?;
        if categories.is_empty() {
            return Err(KiliError::label(format!(
                "annotation '{}' of job '{}' has no category",
                mid, job.id
            )));
        }
        let children = self.children(&mut fields, depth)?;
        let geometry = self.geometry(job, &mut fields).map_err(|error| match error {
            KiliError::InvalidGeometry(message) => {
                KiliError::InvalidGeometry(format!("annotation '{}': {}", mid, message))
            }
            other => other,
        })?;

        Ok(Annotation {
            mid,
            categories,
            geometry,
            children,
            extra: fields,
        })
    }

    fn geometry(&self, job: &Job, fields: &mut Map<String, Value>) -> Result<Geometry> {
        match job.ml_task {
            MlTask::ObjectDetection => {
                let shape = match fields.remove("type") {
                    Some(Value::String(shape)) => shape,
                    _ => {
                        return Err(KiliError::label(format!(
                            "object-detection annotation of job '{}' has no type",
                            job.id
                        )))
                    }
                };
                match shape.as_str() {
                    "rectangle" => {
                        let ring = single_ring(take_rings(fields, "boundingPoly")?)?;
                        if ring.vertices.len() != 4 {
                            return Err(KiliError::geometry(format!(
                                "rectangle has {} vertices instead of 4",
                                ring.vertices.len()
                            )));
                        }
                        ring.validate()?;
                        ring.bounding_box()?;
                        Ok(Geometry::Rectangle(ring))
                    }
                    "polygon" => {
                        let ring = single_ring(take_rings(fields, "boundingPoly")?)?;
                        ring.validate()?;
                        Ok(Geometry::Polygon(ring))
                    }
                    "semantic" => {
                        let rings = take_rings(fields, "boundingPoly")?;
                        if rings.is_empty() {
                            return Err(KiliError::geometry("semantic mask has no ring"));
                        }
                        rings.iter().try_for_each(Polygon::validate)?;
                        Ok(Geometry::Semantic(rings))
                    }
                    "marker" => {
                        let point = fields
                            .remove("point")
                            .ok_or_else(|| KiliError::geometry("marker has no point"))?;
                        let point = Point::from_value(&point)?;
                        validate_normalized_point(&point)?;
                        Ok(Geometry::Point(point))
                    }
                    "polyline" | "vector" => {
                        let points = take_points(fields, "polyline")?;
                        if shape == "vector" {
                            if points.len() != 2 {
                                return Err(KiliError::geometry(format!(
                                    "vector has {} points instead of 2",
                                    points.len()
                                )));
                            }
                            Ok(Geometry::Vector(points))
                        } else {
                            if points.len() < 2 {
                                return Err(KiliError::geometry("polyline needs at least 2 points"));
                            }
                            Ok(Geometry::Polyline(points))
                        }
                    }
                    other => Err(KiliError::label(format!(
                        "unknown annotation type '{}' in job '{}'",
                        other, job.id
                    ))),
                }
            }
            MlTask::PoseEstimation => {
                let keypoints = take_array(fields, "points", &job.id)?
                    .into_iter()
                    .map(|keypoint| {
                        let mut keypoint = object(&keypoint, || "pose keypoint".to_string())?;
                        let code = match keypoint.remove("code") {
                            Some(Value::String(code)) => code,
                            _ => return Err(KiliError::label("pose keypoint has no code")),
                        };
                        let point = keypoint
                            .remove("point")
                            .ok_or_else(|| KiliError::geometry(format!("keypoint '{}' has no point", code)))?;
                        let point = Point::from_value(&point)?;
                        validate_normalized_point(&point)?;
                        Ok(Keypoint {
                            code,
                            point,
                            extra: keypoint,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Geometry::Pose(keypoints))
            }
            MlTask::NamedEntitiesRecognition if self.input_type == InputType::Pdf => {
                let regions = take_array(fields, "annotations", &job.id)?
                    .into_iter()
                    .map(|region| {
                        let mut region = object(&region, || "PDF region".to_string())?;
                        let pages = match region.remove("pageNumberArray") {
                            Some(Value::Array(pages)) => pages
                                .iter()
                                .map(|page| {
                                    page.as_u64()
                                        .and_then(|page| u32::try_from(page).ok())
                                        .ok_or_else(|| KiliError::label(format!("invalid page number {}", page)))
                                })
                                .collect::<Result<Vec<_>>>()?,
                            _ => return Err(KiliError::label("PDF region has no pageNumberArray")),
                        };
                        let polygons = take_rings(&mut region, "polys")?;
                        polygons.iter().try_for_each(Polygon::validate)?;
                        Ok(PdfRegion {
                            pages,
                            polygons,
                            extra: region,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Geometry::PdfRegions(regions))
            }
            MlTask::NamedEntitiesRecognition => {
                let begin_offset = fields
                    .remove("beginOffset")
                    .and_then(|offset| offset.as_u64())
                    .ok_or_else(|| KiliError::label(format!("entity in job '{}' has no beginOffset", job.id)))?;
                let content = match fields.remove("content") {
                    Some(Value::String(content)) => content,
                    _ => return Err(KiliError::label(format!("entity in job '{}' has no content", job.id))),
                };
                Ok(Geometry::TextSpan(TextSpan {
                    begin_offset,
                    content,
                }))
            }
            other => Err(KiliError::label(format!("{} jobs carry no geometry", other))),
        }
    }

    fn relation(&self, job: &Job, kind: RelationKind, value: &Value, depth: usize) -> Result<Relation> {
        let mut fields = object(value, || format!("relation of job '{}'", job.id))?;
        let mid = match fields.remove("mid") {
            None => None,
            Some(Value::String(mid)) => Some(mid),
            Some(other) => return Err(KiliError::label(format!("relation mid {} is not a string", other))),
        };
        let categories = take_array(&mut fields, "categories", &job.id)?
            .iter()
            .map(|category| self.category(job, category, depth))
            .collect::<Result<Vec<_>>>()?;
        let (start_key, end_key) = kind.keys();
        let start = take_endpoints(&mut fields, start_key, &job.id)?;
        let end = take_endpoints(&mut fields, end_key, &job.id)?;

        Ok(Relation {
            mid,
            categories,
            start,
            end,
            extra: fields,
        })
    }
}

/// Relation endpoints must name annotations of the same frame.
fn validate_relations(frame: &JobResponses) -> Result<()> {
    let mut mids = HashSet::new();
    frame.collect_mids(&mut mids);
    for (job_id, relation) in frame.relations() {
        for mid in relation.start.iter().chain(&relation.end) {
            if !mids.contains(mid.as_str()) {
                return Err(KiliError::label(format!(
                    "relation in job '{}' references unknown annotation '{}'",
                    job_id, mid
                )));
            }
        }
    }
    Ok(())
}

fn object(value: &Value, what: impl FnOnce() -> String) -> Result<Map<String, Value>> {
    value
        .as_object()
        .cloned()
        .ok_or_else(|| KiliError::label(format!("{} is not a JSON object", what())))
}

fn take_array(fields: &mut Map<String, Value>, key: &str, job_id: &str) -> Result<Vec<Value>> {
    match fields.remove(key) {
        Some(Value::Array(items)) => Ok(items),
        _ => Err(KiliError::label(format!(
            "job '{}' response has no '{}' array",
            job_id, key
        ))),
    }
}

fn take_points(fields: &mut Map<String, Value>, key: &str) -> Result<Vec<Point>> {
    let points = match fields.remove(key) {
        Some(Value::Array(points)) => points,
        _ => return Err(KiliError::geometry(format!("missing '{}' point list", key))),
    };
    points
        .iter()
        .map(|point| {
            let point = Point::from_value(point)?;
            validate_normalized_point(&point)?;
            Ok(point)
        })
        .collect()
}

fn take_rings(fields: &mut Map<String, Value>, key: &str) -> Result<Vec<Polygon>> {
    let rings = match fields.remove(key) {
        Some(Value::Array(rings)) => rings,
        _ => return Err(KiliError::geometry(format!("missing '{}'", key))),
    };
    rings
        .iter()
        .map(|ring| {
            let vertices = ring
                .get("normalizedVertices")
                .and_then(Value::as_array)
                .ok_or_else(|| KiliError::geometry(format!("'{}' entry has no normalizedVertices", key)))?;
            Ok(Polygon::new(
                vertices.iter().map(Point::from_value).collect::<Result<Vec<_>>>()?,
            ))
        })
        .collect()
}

fn single_ring(mut rings: Vec<Polygon>) -> Result<Polygon> {
    if rings.len() != 1 {
        return Err(KiliError::geometry(format!(
            "expected one boundingPoly ring, found {}",
            rings.len()
        )));
    }
    Ok(rings.remove(0))
}

fn take_endpoints(fields: &mut Map<String, Value>, key: &str, job_id: &str) -> Result<Vec<String>> {
    take_array(fields, key, job_id)?
        .iter()
        .map(|endpoint| {
            endpoint
                .get("mid")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| KiliError::label(format!("'{}' entry of job '{}' has no mid", key, job_id)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ontology::build_ontology;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn ontology() -> Arc<Ontology> {
        Arc::new(
            build_ontology(&json!({
                "jobs": {
                    "JOB_0": {
                        "mlTask": "CLASSIFICATION",
                        "content": {
                            "categories": {
                                "CATEGORY_A": {"name": "A", "children": ["JOB_1"]},
                                "CATEGORY_B": {"name": "B"}
                            },
                            "input": "radio"
                        },
                        "required": 1,
                        "isChild": false
                    },
                    "JOB_1": {
                        "mlTask": "TRANSCRIPTION",
                        "content": {"input": "textField"},
                        "isChild": true
                    },
                    "OBJECT_DETECTION_JOB": {
                        "mlTask": "OBJECT_DETECTION",
                        "content": {
                            "categories": {"CAR": {"name": "Car"}, "BIKE": {"name": "Bike"}},
                            "input": "radio"
                        },
                        "tools": ["rectangle", "polygon", "marker"]
                    },
                    "NER_JOB": {
                        "mlTask": "NAMED_ENTITIES_RECOGNITION",
                        "content": {"categories": {"PERSON": {"name": "Person"}}, "input": "radio"}
                    },
                    "RELATION_JOB": {
                        "mlTask": "NAMED_ENTITIES_RELATION",
                        "content": {"categories": {"KNOWS": {"name": "Knows"}}, "input": "radio"}
                    },
                    "POSE_JOB": {
                        "mlTask": "POSE_ESTIMATION",
                        "content": {"categories": {"FACE": {"name": "Face"}}, "input": "radio"},
                        "tools": ["pose"]
                    }
                }
            }))
            .unwrap(),
        )
    }

    fn rectangle(mid: &str) -> Value {
        json!({
            "mid": mid,
            "type": "rectangle",
            "categories": [{"name": "CAR", "confidence": 90}],
            "boundingPoly": [{"normalizedVertices": [
                {"x": 0.1, "y": 0.5}, {"x": 0.1, "y": 0.1}, {"x": 0.5, "y": 0.1}, {"x": 0.5, "y": 0.5}
            ]}],
            "children": {},
            "isKeyFrame": true
        })
    }

    #[test]
    fn test_classification_scenario() {
        let raw = json!({"JOB_0": {"categories": [{"name": "CATEGORY_A", "confidence": 100}]}});
        let label = Label::parse(&raw, &ontology(), InputType::Image).unwrap();
        let category = label.job("JOB_0").unwrap().category().unwrap();
        assert_eq!(category.display_name(), "A");
        assert_eq!(category.key(), "CATEGORY_A");
        assert_eq!(category.confidence(), Some(100));
        assert_eq!(label.to_dict(), raw);
    }

    #[test]
    fn test_display_name_is_not_the_key() {
        let raw = json!({"OBJECT_DETECTION_JOB": {"annotations": [rectangle("m1")]}});
        let label = Label::parse(&raw, &ontology(), InputType::Image).unwrap();
        let annotation = &label.job("OBJECT_DETECTION_JOB").unwrap().annotations().unwrap()[0];
        let category = annotation.category().unwrap();
        assert_eq!(category.display_name(), "Car");
        assert_eq!(category.key(), "CAR");
        assert_eq!(category.to_value()["name"], "CAR");
    }

    #[test]
    fn test_round_trip_integer_vertices() {
        let raw = json!({"OBJECT_DETECTION_JOB": {"annotations": [{
            "mid": "edge",
            "type": "rectangle",
            "categories": [{"name": "CAR"}],
            "boundingPoly": [{"normalizedVertices": [
                {"x": 0, "y": 1}, {"x": 0, "y": 0.5}, {"x": 0.5, "y": 0.5}, {"x": 0.5, "y": 1}
            ]}]
        }, {
            "mid": "pin",
            "type": "marker",
            "categories": [{"name": "BIKE"}],
            "point": {"x": 1, "y": 0.25}
        }]}});
        let label = Label::parse(&raw, &ontology(), InputType::Image).unwrap();
        assert_eq!(label.to_dict(), raw);
    }

    #[test]
    fn test_round_trip_mixed_payload() {
        let raw = json!({
            "JOB_0": {
                "categories": [{
                    "name": "CATEGORY_A",
                    "confidence": 42,
                    "children": {"JOB_1": {"text": "nested"}}
                }]
            },
            "OBJECT_DETECTION_JOB": {
                "annotations": [
                    rectangle("box"),
                    {
                        "mid": "poly",
                        "type": "polygon",
                        "categories": [{"name": "BIKE"}],
                        "boundingPoly": [{"normalizedVertices": [
                            {"x": 0.2, "y": 0.2}, {"x": 0.6, "y": 0.25}, {"x": 0.4, "y": 0.7}
                        ]}]
                    },
                    {
                        "mid": "dot",
                        "type": "marker",
                        "categories": [{"name": "CAR"}],
                        "point": {"x": 0.25, "y": 0.75}
                    }
                ]
            },
            "NER_JOB": {
                "annotations": [
                    {"mid": "e1", "beginOffset": 0, "endOffset": 4, "content": "John", "categories": [{"name": "PERSON"}]},
                    {"mid": "e2", "beginOffset": 10, "content": "Mary", "categories": [{"name": "PERSON"}]}
                ]
            },
            "RELATION_JOB": {
                "annotations": [{
                    "categories": [{"name": "KNOWS"}],
                    "startEntities": [{"mid": "e1"}],
                    "endEntities": [{"mid": "e2"}]
                }]
            },
            "POSE_JOB": {
                "annotations": [{
                    "mid": "pose",
                    "kind": "POSE",
                    "categories": [{"name": "FACE"}],
                    "points": [{"code": "NOSE", "point": {"x": 0.5, "y": 0.45}, "type": "marker"}]
                }]
            },
            "UNKNOWN_JOB": {"whatever": [1, 2, 3]},
            "ANNOTATION_JOB_COUNTER": {"CAR": 1}
        });
        let label = Label::parse(&raw, &ontology(), InputType::Image).unwrap();
        assert_eq!(label.to_dict(), raw);
        assert!(label.jobs().unwrap().passthrough().contains_key("UNKNOWN_JOB"));

        let nested = label.job("JOB_0").unwrap().category().unwrap().children().unwrap();
        assert_eq!(nested.get("JOB_1").unwrap().text().unwrap(), "nested");
        let relation = &label.job("RELATION_JOB").unwrap().relations().unwrap()[0];
        assert_eq!(relation.start, vec!["e1"]);
        assert_eq!(label.job("RELATION_JOB").unwrap().task(), MlTask::NamedEntitiesRelation);
    }

    #[test]
    fn test_pdf_entities() {
        let raw = json!({
            "NER_JOB": {"annotations": [{
                "mid": "pdf-1",
                "content": "Lorem",
                "categories": [{"name": "PERSON"}],
                "annotations": [{
                    "pageNumberArray": [2],
                    "polys": [{"normalizedVertices": [
                        {"x": 0.1, "y": 0.1}, {"x": 0.2, "y": 0.1}, {"x": 0.2, "y": 0.15}, {"x": 0.1, "y": 0.15}
                    ]}]
                }]
            }]}
        });
        let label = Label::parse(&raw, &ontology(), InputType::Pdf).unwrap();
        let response = label.job("NER_JOB").unwrap();
        assert_matches!(response, JobResponse::PdfEntities(_));
        assert_matches!(
            &response.annotations().unwrap()[0].geometry,
            Geometry::PdfRegions(regions) if regions[0].pages == vec![2]
        );
        assert_eq!(label.to_dict(), raw);
    }

    #[test]
    fn test_video_frames() {
        let raw = json!({
            "0": {"OBJECT_DETECTION_JOB": {"annotations": [rectangle("a")]}},
            "1": {},
            "2": {"OBJECT_DETECTION_JOB": {"annotations": [rectangle("a")]}}
        });
        let label = Label::parse(&raw, &ontology(), InputType::Video).unwrap();
        assert_eq!(label.frames().len(), 3);
        assert!(label.frames()[1].is_empty());
        assert!(label.jobs().is_none());
        assert_eq!(label.to_dict(), raw);

        let gap = json!({"0": {}, "2": {}});
        assert_matches!(
            Label::parse(&gap, &ontology(), InputType::Video),
            Err(KiliError::InvalidLabel(_))
        );
    }

    #[test]
    fn test_wrong_task_accessor() {
        let raw = json!({"JOB_0": {"categories": [{"name": "CATEGORY_B"}]}});
        let label = Label::parse(&raw, &ontology(), InputType::Image).unwrap();
        let response = label.job("JOB_0").unwrap();
        assert_matches!(
            response.text(),
            Err(KiliError::WrongTask { expected: "transcription", found: MlTask::Classification })
        );
        assert_matches!(response.annotations(), Err(KiliError::WrongTask { .. }));
        assert_matches!(response.relations(), Err(KiliError::WrongTask { .. }));
    }

    #[test]
    fn test_unknown_category_fails() {
        let raw = json!({"JOB_0": {"categories": [{"name": "CATEGORY_Z"}]}});
        assert_matches!(
            Label::parse(&raw, &ontology(), InputType::Image),
            Err(KiliError::InvalidLabel(msg)) if msg.contains("CATEGORY_Z")
        );
    }

    #[test]
    fn test_confidence_range() {
        let raw = json!({"JOB_0": {"categories": [{"name": "CATEGORY_A", "confidence": 101}]}});
        assert_matches!(
            Label::parse(&raw, &ontology(), InputType::Image),
            Err(KiliError::InvalidLabel(_))
        );
    }

    #[test]
    fn test_radio_accepts_one_category() {
        let raw = json!({"JOB_0": {"categories": [{"name": "CATEGORY_A"}, {"name": "CATEGORY_B"}]}});
        assert_matches!(
            Label::parse(&raw, &ontology(), InputType::Image),
            Err(KiliError::InvalidLabel(_))
        );
    }

    #[test]
    fn test_degenerate_polygon() {
        let raw = json!({"OBJECT_DETECTION_JOB": {"annotations": [{
            "mid": "bad",
            "type": "polygon",
            "categories": [{"name": "CAR"}],
            "boundingPoly": [{"normalizedVertices": [{"x": 0.1, "y": 0.1}, {"x": 0.2, "y": 0.2}]}]
        }]}});
        assert_matches!(
            Label::parse(&raw, &ontology(), InputType::Image),
            Err(KiliError::InvalidGeometry(msg)) if msg.contains("bad")
        );
    }

    #[test]
    fn test_relation_to_missing_entity() {
        let raw = json!({
            "RELATION_JOB": {"annotations": [{
                "categories": [{"name": "KNOWS"}],
                "startEntities": [{"mid": "ghost"}],
                "endEntities": []
            }]}
        });
        assert_matches!(
            Label::parse(&raw, &ontology(), InputType::Text),
            Err(KiliError::InvalidLabel(msg)) if msg.contains("ghost")
        );
    }

    #[test]
    fn test_nesting_is_bounded_by_ontology() {
        // JOB_0 -> JOB_1 is one level deep; a second level is rejected.
        let raw = json!({
            "JOB_0": {"categories": [{
                "name": "CATEGORY_A",
                "children": {"JOB_0": {"categories": [{
                    "name": "CATEGORY_A",
                    "children": {"JOB_1": {"text": "too deep"}}
                }]}}
            }]}
        });
        assert_matches!(
            Label::parse(&raw, &ontology(), InputType::Image),
            Err(KiliError::InvalidLabel(msg)) if msg.contains("nested")
        );
    }

    #[test]
    fn test_rectangle_bounding_box() {
        let raw = json!({"OBJECT_DETECTION_JOB": {"annotations": [rectangle("m1")]}});
        let label = Label::parse(&raw, &ontology(), InputType::Image).unwrap();
        let annotation = &label.job("OBJECT_DETECTION_JOB").unwrap().annotations().unwrap()[0];
        let bbox = annotation.geometry.bounding_box().unwrap().unwrap();
        assert!((bbox.width() - 0.4).abs() < 1e-9);
        assert_eq!(annotation.geometry.shape_name(), "rectangle");
    }
}
