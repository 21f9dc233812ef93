//! Build an identity store from a folder-per-person image dataset.
//!
//! Layout: `<dataset>/<person>/<image>`. People and images are visited in
//! name order so repeated enrollments produce the same gallery order.

use crate::detector::FaceLocator;
use crate::recognizer::FaceEncoder;
use crate::store::IdentityStore;
use crate::types::{is_reserved_name, Face, Region};
use image::RgbImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("cannot read dataset directory {path}: {source}")]
    Dataset {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What happened to one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleOutcome {
    /// The first detected face was encoded.
    Encoded,
    /// No face was detected; the whole image was encoded as the face.
    WholeImage,
    /// The file could not be read or decoded.
    Unreadable(String),
    /// Detection or encoding failed.
    Failed(String),
}

impl SampleOutcome {
    pub fn is_encoded(&self) -> bool {
        matches!(self, SampleOutcome::Encoded | SampleOutcome::WholeImage)
    }
}

pub struct EnrollReport {
    pub store: IdentityStore,
    /// Every visited image with its person and outcome, in visiting order.
    pub samples: Vec<(String, PathBuf, SampleOutcome)>,
}

impl EnrollReport {
    pub fn encoded(&self) -> usize {
        self.samples.iter().filter(|(_, _, o)| o.is_encoded()).count()
    }

    pub fn skipped(&self) -> usize {
        self.samples.len() - self.encoded()
    }
}

pub fn enroll_dataset<L, E>(
    dataset: &Path,
    locator: &mut L,
    encoder: &mut E,
) -> Result<EnrollReport, EnrollError>
where
    L: FaceLocator + ?Sized,
    E: FaceEncoder + ?Sized,
{
    let mut report = EnrollReport {
        store: IdentityStore::new(),
        samples: Vec::new(),
    };

    for person_dir in sorted_entries(dataset)?.into_iter().filter(|p| p.is_dir()) {
        let person = match person_dir.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => continue,
        };
        if is_reserved_name(&person) {
            tracing::warn!(person = %person, path = %person_dir.display(), "skipping folder with a reserved name");
            continue;
        }
        tracing::info!(person = %person, "enrolling");

        for image_path in sorted_entries(&person_dir)?.into_iter().filter(|p| p.is_file()) {
            let outcome = enroll_one(&image_path, &person, locator, encoder, &mut report.store);
            match &outcome {
                SampleOutcome::Encoded | SampleOutcome::WholeImage => {
                    tracing::debug!(person = %person, path = %image_path.display(), ?outcome, "sample encoded")
                }
                SampleOutcome::Unreadable(e) | SampleOutcome::Failed(e) => {
                    tracing::warn!(person = %person, path = %image_path.display(), error = %e, "sample skipped")
                }
            }
            report.samples.push((person.clone(), image_path, outcome));
        }
    }

    tracing::info!(
        encoded = report.encoded(),
        skipped = report.skipped(),
        identities = report.store.sample_counts().len(),
        "enrollment finished"
    );
    Ok(report)
}

fn enroll_one<L, E>(
    path: &Path,
    person: &str,
    locator: &mut L,
    encoder: &mut E,
    store: &mut IdentityStore,
) -> SampleOutcome
where
    L: FaceLocator + ?Sized,
    E: FaceEncoder + ?Sized,
{
    let image: RgbImage = match image::open(path) {
        Ok(img) => img.to_rgb8(),
        Err(e) => return SampleOutcome::Unreadable(e.to_string()),
    };

    let mut faces = match locator.locate(&image) {
        Ok(faces) => faces,
        Err(e) => return SampleOutcome::Failed(e.to_string()),
    };
    let whole_image = faces.is_empty();
    if whole_image {
        faces.push(whole_image_face(&image));
    }

    match encoder.encode(&image, &faces[..1]) {
        Ok(embeddings) => match embeddings.first() {
            Some(embedding) => {
                store.push(person, embedding);
                if whole_image {
                    SampleOutcome::WholeImage
                } else {
                    SampleOutcome::Encoded
                }
            }
            None => SampleOutcome::Failed("encoder returned no embedding".into()),
        },
        Err(e) => SampleOutcome::Failed(e.to_string()),
    }
}

/// Samples are usually pre-cropped faces, so the full frame is a usable
/// fallback region.
fn whole_image_face(image: &RgbImage) -> Face {
    Face::from_region(Region::new(0, image.width() as i32, image.height() as i32, 0))
}

/// Non-hidden entries of `dir`, sorted by path.
fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, EnrollError> {
    let entries = std::fs::read_dir(dir).map_err(|source| EnrollError::Dataset {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            !p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'))
        })
        .collect();
    paths.sort();
    Ok(paths)
}
