//! Pascal VOC export: one XML document per image (or video frame) with the
//! rectangles of every rectangle object-detection job, in integer pixels.

use log::debug;
use std::sync::Arc;

use crate::conversion::{label_file_stem, ArchivePaths, ArchiveSink, Converter, ExportLabel, SkipLog};
use crate::error::{KiliError, Result};
use crate::geometry::{denormalize, BoundingBox};
use crate::label::{Geometry, JobResponse, JobResponses};
use crate::ontology::Ontology;
use crate::types::Asset;
use crate::utils::{file_stem, frame_stem};

/// A box ready to be written, already in pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct VocObject {
    pub name: String,
    pub bbox: BoundingBox,
}

pub struct PascalVocConverter {
    ontology: Arc<Ontology>,
    one_file_per_label: bool,
}

impl PascalVocConverter {
    pub fn new(ontology: Arc<Ontology>, one_file_per_label: bool) -> Self {
        Self {
            ontology,
            one_file_per_label,
        }
    }

    fn objects(
        &self,
        frame: &JobResponses,
        width: f64,
        height: f64,
        skips: &mut SkipLog,
    ) -> Result<Vec<VocObject>> {
        let mut objects = Vec::new();

        for (job_id, response) in frame.iter() {
            let job = self.ontology.job(job_id).filter(|job| job.is_rectangle_detection() && !job.is_child);
            let (JobResponse::ObjectDetection(response), Some(job)) = (response, job) else {
                skips.job(job_id, format!("{} job is not exported to Pascal VOC", response.task()));
                continue;
            };
            for annotation in &response.annotations {
                let Geometry::Rectangle(polygon) = &annotation.geometry else {
                    skips.annotation(
                        job_id,
                        &annotation.mid,
                        format!("{} shapes are not exported to Pascal VOC", annotation.geometry.shape_name()),
                    );
                    continue;
                };
                let Some(category) = annotation.category().and_then(|c| job.category(c.key())) else {
                    continue;
                };
                objects.push(VocObject {
                    name: category.name.clone(),
                    bbox: denormalize(&polygon.bounding_box()?, width, height)?,
                });
                skips.nested(job_id, annotation, "Pascal VOC");
            }
        }
        for job_id in frame.passthrough().keys() {
            skips.job(job_id, "job is not part of the ontology");
        }
        Ok(objects)
    }
}

impl Converter for PascalVocConverter {
    type Output = Vec<(String, String)>;

    fn convert_asset(
        &self,
        asset: &Asset,
        labels: &[ExportLabel<'_>],
        skips: &mut SkipLog,
    ) -> Result<Self::Output> {
        let (width, height) = asset.dimensions().ok_or_else(|| KiliError::MissingDimensions {
            external_id: asset.external_id.clone(),
            format: "pascal_voc",
        })?;
        let stem = file_stem(&asset.external_id);
        let mut documents = Vec::new();

        for export_label in labels {
            let label_stem = label_file_stem(&stem, export_label.raw, self.one_file_per_label);
            let frames = export_label.label.frames();
            for (frame_index, frame) in frames.iter().enumerate() {
                let document_stem = if export_label.label.is_video() {
                    frame_stem(&label_stem, frame_index, frames.len())
                } else {
                    label_stem.clone()
                };
                let objects = self.objects(frame, width, height, skips)?;
                let xml = voc_document(&document_stem, width as u32, height as u32, &objects);
                documents.push((document_stem, xml));
            }
        }
        Ok(documents)
    }

    fn write_outputs(&self, outputs: Vec<Self::Output>, sink: &mut dyn ArchiveSink) -> Result<usize> {
        let mut paths = ArchivePaths::default();
        let mut written = 0;
        for (stem, xml) in outputs.into_iter().flatten() {
            let path = paths.claim(format!("labels/{}.xml", stem));
            sink.add_file(&path, xml.as_bytes())?;
            written += 1;
        }
        debug!("Wrote {} Pascal VOC documents", written);
        Ok(written)
    }
}

/// Render one `<annotation>` document.
pub fn voc_document(file_name: &str, width: u32, height: u32, objects: &[VocObject]) -> String {
    let mut xml = String::from("<annotation>\n");
    xml.push_str("  <folder>images</folder>\n");
    xml.push_str(&format!("  <filename>{}</filename>\n", escape_xml(file_name)));
    xml.push_str("  <source>\n    <database>Kili</database>\n  </source>\n");
    xml.push_str(&format!(
        "  <size>\n    <width>{}</width>\n    <height>{}</height>\n    <depth>3</depth>\n  </size>\n",
        width, height
    ));
    xml.push_str("  <segmented>0</segmented>\n");

    for object in objects {
        xml.push_str("  <object>\n");
        xml.push_str(&format!("    <name>{}</name>\n", escape_xml(&object.name)));
        xml.push_str("    <pose>Unspecified</pose>\n    <truncated>0</truncated>\n    <difficult>0</difficult>\n");
        xml.push_str(&format!(
            "    <bndbox>\n      <xmin>{}</xmin>\n      <ymin>{}</ymin>\n      <xmax>{}</xmax>\n      <ymax>{}</ymax>\n    </bndbox>\n",
            object.bbox.x_min.round() as i64,
            object.bbox.y_min.round() as i64,
            object.bbox.x_max.round() as i64,
            object.bbox.y_max.round() as i64
        ));
        xml.push_str("  </object>\n");
    }
    xml.push_str("</annotation>\n");
    xml
}

pub fn escape_xml(text: &str) -> String {
    text.chars().fold(String::with_capacity(text.len()), |mut escaped, c| {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            other => escaped.push(other),
        }
        escaped
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversion::MemorySink;
    use crate::label::Label;
    use crate::ontology::build_ontology;
    use crate::types::{InputType, LabelType, RawLabel};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn ontology() -> Arc<Ontology> {
        Arc::new(
            build_ontology(&json!({
                "jobs": {
                    "OBJECT_DETECTION_JOB": {
                        "mlTask": "OBJECT_DETECTION",
                        "content": {"categories": {"CAR": {"name": "Car & truck"}}, "input": "radio"},
                        "tools": ["rectangle"]
                    },
                    "CLASSIFICATION_JOB": {
                        "mlTask": "CLASSIFICATION",
                        "content": {"categories": {"DAY": {"name": "Day"}}, "input": "radio"}
                    }
                }
            }))
            .unwrap(),
        )
    }

    #[test]
    fn test_escape_xml() {
        assert_eq!(escape_xml("a<b>&\"c'"), "a&lt;b&gt;&amp;&quot;c&apos;");
    }

    #[test]
    fn test_export_rectangles_in_pixels() {
        let ontology = ontology();
        let raw = RawLabel {
            id: "l1".to_string(),
            label_type: LabelType::Default,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            author: None,
            json_response: json!({
                "OBJECT_DETECTION_JOB": {"annotations": [{
                    "mid": "m1", "type": "rectangle", "categories": [{"name": "CAR"}],
                    "boundingPoly": [{"normalizedVertices": [
                        {"x": 0.1, "y": 0.6}, {"x": 0.1, "y": 0.2}, {"x": 0.55, "y": 0.2}, {"x": 0.55, "y": 0.6}
                    ]}]
                }]},
                "CLASSIFICATION_JOB": {"categories": [{"name": "DAY"}]}
            }),
        };
        let label = Label::parse(&raw.json_response, &ontology, InputType::Image).unwrap();
        let asset = Asset {
            id: None,
            external_id: "street.jpg".to_string(),
            content: None,
            width: Some(640),
            height: Some(480),
            input_type: InputType::Image,
            json_metadata: None,
            labels: Vec::new(),
        };
        let converter = PascalVocConverter::new(Arc::clone(&ontology), false);
        let mut skips = SkipLog::new("street.jpg");
        let output = converter
            .convert_asset(&asset, &[ExportLabel { raw: &raw, label }], &mut skips)
            .unwrap();
        assert_eq!(skips.len(), 1);

        let mut sink = MemorySink::default();
        assert_eq!(converter.write_outputs(vec![output], &mut sink).unwrap(), 1);
        let xml = sink.text("labels/street.jpg.xml").unwrap();
        assert!(xml.contains("<name>Car &amp; truck</name>"));
        assert!(xml.contains("<width>640</width>"));
        assert!(xml.contains("<xmin>64</xmin>"));
        assert!(xml.contains("<ymin>96</ymin>"));
        assert!(xml.contains("<xmax>352</xmax>"));
        assert!(xml.contains("<ymax>288</ymax>"));
    }
}
