use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel label for a detected face that matched no known identity.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Raw detector output in the coordinate space of the image it ran on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face rectangle in integer pixel coordinates.
///
/// Coordinates follow the (top, right, bottom, left) convention. Scaling
/// truncates toward zero so the same input always lands on the same pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub left: i32,
}

impl Region {
    pub fn new(top: i32, right: i32, bottom: i32, left: i32) -> Self {
        Self {
            top,
            right,
            bottom,
            left,
        }
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    /// Multiply every coordinate by `factor`, truncating.
    pub fn scaled_by(&self, factor: f32) -> Self {
        let s = |v: i32| (v as f32 * factor) as i32;
        Self::new(s(self.top), s(self.right), s(self.bottom), s(self.left))
    }

    /// Map a region found on an image reduced by `downscale` back to the
    /// full-resolution frame: every coordinate is divided by `downscale`
    /// and truncated.
    pub fn to_full_resolution(&self, downscale: f32) -> Self {
        let s = |v: i32| (v as f32 / downscale) as i32;
        Self::new(s(self.top), s(self.right), s(self.bottom), s(self.left))
    }
}

impl From<&BoundingBox> for Region {
    fn from(b: &BoundingBox) -> Self {
        Self::new(
            b.y as i32,
            (b.x + b.width) as i32,
            (b.y + b.height) as i32,
            b.x as i32,
        )
    }
}

/// A detected face: its region plus what the encoder needs to align it.
#[derive(Debug, Clone, PartialEq)]
pub struct Face {
    pub region: Region,
    pub landmarks: Option<[(f32, f32); 5]>,
    pub confidence: f32,
}

impl Face {
    /// A face covering the given region, without landmarks.
    pub fn from_region(region: Region) -> Self {
        Self {
            region,
            landmarks: None,
            confidence: 1.0,
        }
    }

    /// Rescale region and landmarks from a `downscale`-reduced image to full resolution.
    pub fn to_full_resolution(&self, downscale: f32) -> Self {
        Self {
            region: self.region.to_full_resolution(downscale),
            landmarks: self
                .landmarks
                .map(|lms| lms.map(|(x, y)| (x / downscale, y / downscale))),
            confidence: self.confidence,
        }
    }
}

impl From<&BoundingBox> for Face {
    fn from(b: &BoundingBox) -> Self {
        Self {
            region: Region::from(b),
            landmarks: b.landmarks,
            confidence: b.confidence,
        }
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// Embeddings of different dimensions are incomparable and score 0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return 0.0;
        }
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }
}

/// An enrolled person: display name plus one reference embedding.
///
/// A person enrolled from several images appears once per image.
#[derive(Debug, Clone)]
pub struct KnownIdentity {
    pub name: String,
    pub embedding: Embedding,
}

/// Whether `name` cannot be used for an enrolled identity.
///
/// Empty names and the [`UNKNOWN_LABEL`] text would be indistinguishable
/// from an unmatched face downstream.
pub fn is_reserved_name(name: &str) -> bool {
    name.trim().is_empty() || name == UNKNOWN_LABEL
}

/// Display label attached to a region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Label {
    /// Matched a known identity.
    Known(String),
    /// Matched nothing in the identity store.
    Unknown,
    /// Region from a detect-only pass; identity not evaluated.
    Unlabeled,
}

impl Label {
    /// Name of the matched identity, if any.
    pub fn known_name(&self) -> Option<&str> {
        match self {
            Label::Known(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::Known(name) => f.write_str(name),
            Label::Unknown => f.write_str(UNKNOWN_LABEL),
            Label::Unlabeled => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub region: Region,
    pub label: Label,
}

/// The displayable overlay: every region from the last processing pass
/// with its label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnnotationSet(Vec<Annotation>);

impl AnnotationSet {
    pub fn new(annotations: Vec<Annotation>) -> Self {
        Self(annotations)
    }

    /// Regions from a detect-only pass, all labelled [`Label::Unlabeled`].
    pub fn unlabeled(regions: impl IntoIterator<Item = Region>) -> Self {
        Self(
            regions
                .into_iter()
                .map(|region| Annotation {
                    region,
                    label: Label::Unlabeled,
                })
                .collect(),
        )
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Annotation> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a AnnotationSet {
    type Item = &'a Annotation;
    type IntoIter = std::slice::Iter<'a, Annotation>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
