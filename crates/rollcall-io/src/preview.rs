//! Headless display: the latest annotated frame written to disk.
//!
//! Every `every`-th frame is drawn with its overlay and saved as JPEG next
//! to a JSON sidecar listing the regions and labels. Boxes are only colour
//! coded on the JPEG; identity names are in the sidecar. The operator stops
//! the loop through the shared quit flag.

use image::{ImageFormat, Rgb, RgbImage};
use rollcall_core::frame::Frame;
use rollcall_core::pipeline::RenderSink;
use rollcall_core::types::{AnnotationSet, Label, Region};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

const BOX_THICKNESS: u32 = 2;
const KNOWN_COLOR: Rgb<u8> = Rgb([0, 200, 0]);
const UNKNOWN_COLOR: Rgb<u8> = Rgb([220, 0, 0]);
const UNLABELED_COLOR: Rgb<u8> = Rgb([230, 200, 0]);

#[derive(Error, Debug)]
pub enum PreviewError {
    #[error("failed to encode preview image: {0}")]
    Encode(#[from] image::ImageError),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize preview sidecar: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct Sidecar<'a> {
    sequence: u64,
    width: u32,
    height: u32,
    annotations: &'a AnnotationSet,
}

/// Render sink that keeps the latest annotated frame on disk.
///
/// The JPEG at `path` carries the boxes, green for a known identity, red
/// for `Unknown` and yellow for unlabeled detections. The names for each
/// box are written to the JSON sidecar at [`PreviewSink::sidecar_path`].
pub struct PreviewSink {
    path: PathBuf,
    every: u64,
    rendered: u64,
    written: u64,
    quit: Arc<AtomicBool>,
}

impl PreviewSink {
    pub fn new(path: impl Into<PathBuf>, every: u64) -> Self {
        Self {
            path: path.into(),
            every: every.max(1),
            rendered: 0,
            written: 0,
            quit: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that, once set, makes the loop stop before the next frame.
    pub fn quit_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.quit)
    }

    pub fn sidecar_path(&self) -> PathBuf {
        self.path.with_extension("json")
    }

    fn write(&self, frame: &Frame, overlay: Option<&AnnotationSet>) -> Result<(), PreviewError> {
        let empty = AnnotationSet::default();
        let annotations = overlay.unwrap_or(&empty);

        let mut canvas = frame.image.clone();
        for annotation in annotations {
            draw_region(&mut canvas, &annotation.region, label_color(&annotation.label));
        }

        write_atomic(&self.path, |tmp| Ok(canvas.save_with_format(tmp, ImageFormat::Jpeg)?))?;

        let sidecar = Sidecar {
            sequence: frame.sequence,
            width: frame.width(),
            height: frame.height(),
            annotations,
        };
        let json = serde_json::to_vec_pretty(&sidecar)?;
        write_atomic(&self.sidecar_path(), |tmp| {
            std::fs::write(tmp, &json).map_err(|source| PreviewError::Io {
                path: tmp.to_path_buf(),
                source,
            })
        })
    }
}

impl RenderSink for PreviewSink {
    fn render(&mut self, frame: &Frame, overlay: Option<&AnnotationSet>) {
        self.rendered += 1;
        if self.rendered % self.every != 0 {
            return;
        }
        match self.write(frame, overlay) {
            Ok(()) => self.written += 1,
            Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "preview write failed"),
        }
    }

    fn quit_requested(&self) -> bool {
        self.quit.load(Ordering::Relaxed)
    }

    fn close(&mut self) {
        tracing::info!(
            path = %self.path.display(),
            rendered = self.rendered,
            written = self.written,
            "preview closed"
        );
    }
}

fn label_color(label: &Label) -> Rgb<u8> {
    match label {
        Label::Known(_) => KNOWN_COLOR,
        Label::Unknown => UNKNOWN_COLOR,
        Label::Unlabeled => UNLABELED_COLOR,
    }
}

/// Write through a sibling temp file so readers never see a partial image.
fn write_atomic(
    path: &Path,
    write: impl FnOnce(&Path) -> Result<(), PreviewError>,
) -> Result<(), PreviewError> {
    let tmp = path.with_extension("tmp");
    write(&tmp)?;
    std::fs::rename(&tmp, path).map_err(|source| PreviewError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Outline `region`, clamped to the image. Regions entirely outside are skipped.
fn draw_region(img: &mut RgbImage, region: &Region, color: Rgb<u8>) {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return;
    }
    if region.right < 0 || region.bottom < 0 || region.left >= w as i32 || region.top >= h as i32 {
        return;
    }
    let clamp = |v: i32, max: u32| v.clamp(0, max as i32 - 1) as u32;
    let (x0, x1) = (clamp(region.left, w), clamp(region.right, w));
    let (y0, y1) = (clamp(region.top, h), clamp(region.bottom, h));

    for t in 0..BOX_THICKNESS {
        let (xa, ya) = (x0 + t, y0 + t);
        let (xb, yb) = (x1.saturating_sub(t), y1.saturating_sub(t));
        if xa > xb || ya > yb {
            break;
        }
        for x in xa..=xb {
            img.put_pixel(x, ya, color);
            img.put_pixel(x, yb, color);
        }
        for y in ya..=yb {
            img.put_pixel(xa, y, color);
            img.put_pixel(xb, y, color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::types::Annotation;

    fn frame(seq: u64) -> Frame {
        Frame::new(RgbImage::from_pixel(40, 30, Rgb([0, 0, 0])), seq)
    }

    fn overlay() -> AnnotationSet {
        AnnotationSet::new(vec![
            Annotation { region: Region::new(2, 12, 12, 2), label: Label::Known("alice".into()) },
            Annotation { region: Region::new(15, 35, 25, 25), label: Label::Unknown },
        ])
    }

    #[test]
    fn test_draw_region_outline_only() {
        let mut img = RgbImage::new(20, 20);
        draw_region(&mut img, &Region::new(2, 12, 12, 2), KNOWN_COLOR);
        assert_eq!(img.get_pixel(2, 2), &KNOWN_COLOR);
        assert_eq!(img.get_pixel(12, 7), &KNOWN_COLOR);
        assert_eq!(img.get_pixel(3, 3), &KNOWN_COLOR); // second ring
        assert_eq!(img.get_pixel(7, 7), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_draw_region_clamps_and_skips() {
        let mut img = RgbImage::new(10, 10);
        draw_region(&mut img, &Region::new(-5, 50, 50, -5), UNKNOWN_COLOR);
        assert_eq!(img.get_pixel(0, 0), &UNKNOWN_COLOR);
        assert_eq!(img.get_pixel(9, 9), &UNKNOWN_COLOR);

        let mut img = RgbImage::new(10, 10);
        draw_region(&mut img, &Region::new(20, 40, 30, 20), UNKNOWN_COLOR);
        assert!(img.pixels().all(|p| *p == Rgb([0, 0, 0])));
    }

    #[test]
    fn test_writes_every_nth_frame_with_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preview.jpg");
        let mut sink = PreviewSink::new(&path, 2);
        let set = overlay();

        sink.render(&frame(1), Some(&set));
        assert!(!path.exists());
        sink.render(&frame(2), Some(&set));
        assert!(path.exists());

        let image = image::open(&path).unwrap();
        assert_eq!((image.width(), image.height()), (40, 30));

        let sidecar: serde_json::Value =
            serde_json::from_slice(&std::fs::read(sink.sidecar_path()).unwrap()).unwrap();
        assert_eq!(sidecar["sequence"], 2);
        assert_eq!(sidecar["annotations"].as_array().unwrap().len(), 2);
        assert!(!dir.path().join("preview.tmp").exists());
    }

    #[test]
    fn test_no_overlay_writes_empty_annotations() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = PreviewSink::new(dir.path().join("p.jpg"), 1);
        sink.render(&frame(7), None);
        let sidecar: serde_json::Value =
            serde_json::from_slice(&std::fs::read(sink.sidecar_path()).unwrap()).unwrap();
        assert!(sidecar["annotations"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_quit_flag() {
        let sink = PreviewSink::new("unused.jpg", 1);
        assert!(!sink.quit_requested());
        sink.quit_handle().store(true, Ordering::Relaxed);
        assert!(sink.quit_requested());
    }

    #[test]
    fn test_missing_directory_is_encode_error() {
        let dir = tempfile::tempdir().unwrap();
        let sink = PreviewSink::new(dir.path().join("missing/p.jpg"), 1);
        assert!(matches!(sink.write(&frame(1), None), Err(PreviewError::Encode(_))));
    }

    #[test]
    fn test_rename_failure_names_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("taken.jpg");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("keep"), b"x").unwrap();

        let err = write_atomic(&target, |tmp| {
            std::fs::write(tmp, b"data").map_err(|source| PreviewError::Io {
                path: tmp.to_path_buf(),
                source,
            })
        })
        .unwrap_err();
        assert!(matches!(err, PreviewError::Io { ref path, .. } if *path == target));
    }

    #[test]
    fn test_unwritable_path_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = PreviewSink::new(dir.path().join("missing/dir/p.jpg"), 1);
        sink.render(&frame(1), None);
        sink.close();
        assert_eq!(sink.written, 0);
    }
}
