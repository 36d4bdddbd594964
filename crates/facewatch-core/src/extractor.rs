//! Upstream embedding extractor interface and a JSON-lines adapter.
//!
//! Face detection and encoding run in a separate process; it writes one JSON
//! object per processed frame:
//!
//! ```json
//! {"camera":"door","sequence":42,"captured_at":"2024-05-01T10:00:00Z",
//!  "image_ref":"frames/42.jpg","faces":[{"bbox":{"top":10,"right":60,"bottom":70,"left":0},"embedding":[0.01, ...]}]}
//! ```

use std::io::BufRead;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Embedding, FaceBox, FaceObservation, FrameContext};

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("extractor read failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedFace {
    pub bbox: FaceBox,
    pub embedding: Embedding,
}

/// Extractor output for one frame. An empty `faces` list is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedFrame {
    #[serde(default = "default_camera")]
    pub camera: String,
    #[serde(default)]
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub image_ref: Option<String>,
    #[serde(default)]
    pub faces: Vec<ExtractedFace>,
}

/// One line as written by the extractor. Faces are decoded one at a time
/// so a malformed face does not cost the rest of the frame.
#[derive(Deserialize)]
struct FrameLine {
    #[serde(default = "default_camera")]
    camera: String,
    #[serde(default)]
    sequence: u64,
    captured_at: DateTime<Utc>,
    #[serde(default)]
    image_ref: Option<String>,
    #[serde(default)]
    faces: Vec<serde_json::Value>,
}

fn default_camera() -> String {
    "default".to_string()
}

impl ExtractedFrame {
    pub fn into_observations(self) -> (FrameContext, Vec<FaceObservation>) {
        let captured_at = self.captured_at;
        let observations = self
            .faces
            .into_iter()
            .map(|face| FaceObservation {
                bbox: face.bbox,
                embedding: face.embedding,
                captured_at,
            })
            .collect();
        let context = FrameContext {
            camera: self.camera,
            sequence: self.sequence,
            captured_at,
            image_ref: self.image_ref,
        };
        (context, observations)
    }
}

/// Source of per-frame extractor output, in capture order.
pub trait EmbeddingExtractor {
    /// Next frame, or `None` at end of stream.
    fn next_frame(&mut self) -> Result<Option<ExtractedFrame>, ExtractorError>;
}

/// Reads [`ExtractedFrame`]s from newline-delimited JSON.
///
/// Blank lines and `#` comments are ignored. Lines that fail to parse are
/// logged and skipped, as are individual faces that fail to decode.
pub struct JsonLinesExtractor<R> {
    reader: R,
    line_no: usize,
    skipped: usize,
    skipped_faces: usize,
    buf: String,
}

impl<R: BufRead> JsonLinesExtractor<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line_no: 0,
            skipped: 0,
            skipped_faces: 0,
            buf: String::new(),
        }
    }

    /// Lines rejected so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Faces dropped from otherwise valid lines.
    pub fn skipped_faces(&self) -> usize {
        self.skipped_faces
    }

    fn decode_faces(&mut self, sequence: u64, raw: Vec<serde_json::Value>) -> Vec<ExtractedFace> {
        let mut faces = Vec::with_capacity(raw.len());
        for (index, value) in raw.into_iter().enumerate() {
            match serde_json::from_value::<ExtractedFace>(value) {
                Ok(face) => faces.push(face),
                Err(e) => {
                    self.skipped_faces += 1;
                    tracing::warn!(
                        line = self.line_no,
                        sequence,
                        face = index,
                        error = %e,
                        "skipping malformed face"
                    );
                }
            }
        }
        faces
    }
}

impl<R: BufRead> EmbeddingExtractor for JsonLinesExtractor<R> {
    fn next_frame(&mut self) -> Result<Option<ExtractedFrame>, ExtractorError> {
        loop {
            self.buf.clear();
            if self.reader.read_line(&mut self.buf)? == 0 {
                return Ok(None);
            }
            self.line_no += 1;

            let line = self.buf.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let parsed = match serde_json::from_str::<FrameLine>(line) {
                Ok(parsed) => parsed,
                Err(e) => {
                    self.skipped += 1;
                    tracing::warn!(line = self.line_no, error = %e, "skipping malformed extractor line");
                    continue;
                }
            };

            let faces = self.decode_faces(parsed.sequence, parsed.faces);
            return Ok(Some(ExtractedFrame {
                camera: parsed.camera,
                sequence: parsed.sequence,
                captured_at: parsed.captured_at,
                image_ref: parsed.image_ref,
                faces,
            }));
        }
    }
}

impl<R: BufRead> Iterator for JsonLinesExtractor<R> {
    type Item = Result<ExtractedFrame, ExtractorError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_reads_frames_and_skips_noise() {
        let input = r#"
# capture from door camera
{"camera":"door","sequence":1,"captured_at":"2024-05-01T10:00:00Z","faces":[{"bbox":{"top":10,"right":60,"bottom":70,"left":0},"embedding":[0.1,0.2]}]}
not json
{"captured_at":"2024-05-01T10:00:01Z"}
"#;
        let mut extractor = JsonLinesExtractor::new(Cursor::new(input));

        let first = extractor.next_frame().unwrap().unwrap();
        assert_eq!(first.camera, "door");
        assert_eq!(first.faces.len(), 1);
        assert_eq!(first.faces[0].embedding.values, vec![0.1, 0.2]);

        let second = extractor.next_frame().unwrap().unwrap();
        assert_eq!(second.camera, "default");
        assert!(second.faces.is_empty());

        assert!(extractor.next_frame().unwrap().is_none());
        assert_eq!(extractor.skipped(), 1);
    }

    #[test]
    fn test_bad_face_keeps_rest_of_frame() {
        let input = concat!(
            r#"{"camera":"door","sequence":3,"captured_at":"2024-05-01T10:00:00Z","faces":["#,
            r#"{"bbox":{"top":0,"right":40,"bottom":40,"left":0},"embedding":[0.1,0.2]},"#,
            r#"{"bbox":{"top":0,"right":90,"bottom":40,"left":50},"embedding":[0.1,null]},"#,
            r#"{"bbox":{"top":0,"right":140,"bottom":40,"left":100},"embedding":"0.3,0.4"},"#,
            r#"{"embedding":[0.5,0.6]}]}"#,
            "\n"
        );
        let mut extractor = JsonLinesExtractor::new(Cursor::new(input));

        let frame = extractor.next_frame().unwrap().unwrap();
        assert_eq!(frame.sequence, 3);
        assert_eq!(frame.faces.len(), 1);
        assert_eq!(frame.faces[0].embedding.values, vec![0.1, 0.2]);
        assert_eq!(extractor.skipped(), 0);
        assert_eq!(extractor.skipped_faces(), 3);
        assert!(extractor.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_into_observations_shares_timestamp() {
        let frame: ExtractedFrame = serde_json::from_str(
            r#"{"sequence":7,"captured_at":"2024-05-01T10:00:00Z","image_ref":"7.jpg",
                "faces":[{"bbox":{"top":0,"right":10,"bottom":10,"left":0},"embedding":[1.0]},
                         {"bbox":{"top":0,"right":30,"bottom":10,"left":20},"embedding":[0.5]}]}"#,
        )
        .unwrap();
        let (context, observations) = frame.into_observations();
        assert_eq!(context.sequence, 7);
        assert_eq!(context.image_ref.as_deref(), Some("7.jpg"));
        assert_eq!(observations.len(), 2);
        assert!(observations.iter().all(|o| o.captured_at == context.captured_at));
    }

    #[test]
    fn test_iterator_collects_frames() {
        let input = "{\"captured_at\":\"2024-05-01T10:00:00Z\"}\n{\"captured_at\":\"2024-05-01T10:00:01Z\"}\n";
        let frames: Result<Vec<_>, _> = JsonLinesExtractor::new(Cursor::new(input)).collect();
        assert_eq!(frames.unwrap().len(), 2);
    }
}
