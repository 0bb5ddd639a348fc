//! Frame rendering targets for annotated gate output.

use facegate_core::BoundingBox;
use facegate_hw::frame::{draw_rect, draw_text, text_height};
use facegate_hw::Frame;
use image::{Rgb, RgbImage};
use std::path::PathBuf;
use thiserror::Error;

const MATCHED_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const UNKNOWN_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const VERDICT_COLOR: Rgb<u8> = Rgb([0, 255, 255]);
const COOLDOWN_COLOR: Rgb<u8> = Rgb([255, 165, 0]);
const BOX_THICKNESS: i64 = 2;
const TEXT_SCALE: u32 = 2;
const TEXT_GAP: i64 = 4;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("image encode failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Overlay for one processed face.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceAnnotation {
    pub bbox: BoundingBox,
    pub matched: bool,
    /// `"{label} ({distance:.2})"`.
    pub caption: String,
    pub status: Option<FaceStatus>,
}

/// Extra line shown for a recognised face.
#[derive(Debug, Clone, PartialEq)]
pub enum FaceStatus {
    /// Backend answer, `"{type} - {status}"`.
    Verdict(String),
    /// `"COOLDOWN: {m}m {s}s"`.
    Cooldown(String),
}

impl FaceStatus {
    pub fn text(&self) -> &str {
        match self {
            FaceStatus::Verdict(text) | FaceStatus::Cooldown(text) => text,
        }
    }
}

impl FaceAnnotation {
    pub fn color(&self) -> Rgb<u8> {
        if self.matched { MATCHED_COLOR } else { UNKNOWN_COLOR }
    }

    pub fn status_text(&self) -> Option<&str> {
        self.status.as_ref().map(FaceStatus::text)
    }

    /// Box, caption above it, and the status line: verdicts below the box,
    /// cooldowns above the caption.
    pub fn draw(&self, image: &mut RgbImage) {
        let x = self.bbox.x.round() as i64;
        let y = self.bbox.y.round() as i64;
        let w = self.bbox.width.round() as i64;
        let h = self.bbox.height.round() as i64;
        let line = text_height(TEXT_SCALE) + TEXT_GAP;

        draw_rect(image, x, y, w, h, BOX_THICKNESS, self.color());

        let caption_y = (y - line).max(0);
        draw_text(image, x, caption_y, &self.caption, TEXT_SCALE, self.color());

        match &self.status {
            Some(FaceStatus::Verdict(text)) => {
                draw_text(image, x, y + h + TEXT_GAP, text, TEXT_SCALE, VERDICT_COLOR);
            }
            Some(FaceStatus::Cooldown(text)) => {
                draw_text(image, x, caption_y - line, text, TEXT_SCALE, COOLDOWN_COLOR);
            }
            None => {}
        }
    }
}

/// Where processed frames go.
pub trait FrameSink {
    fn render(&mut self, frame: &Frame, annotations: &[FaceAnnotation]) -> Result<(), SinkError>;
}

/// Logs annotations without keeping any image output.
pub struct LogSink;

impl FrameSink for LogSink {
    fn render(&mut self, frame: &Frame, annotations: &[FaceAnnotation]) -> Result<(), SinkError> {
        for a in annotations {
            tracing::debug!(
                seq = frame.sequence,
                caption = %a.caption,
                status = a.status_text().unwrap_or(""),
                "face"
            );
        }
        Ok(())
    }
}

/// Draws annotations onto the frame and overwrites a single image file.
pub struct SnapshotSink {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl SnapshotSink {
    pub fn new(path: PathBuf) -> Self {
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        Self {
            path,
            tmp_path: PathBuf::from(tmp),
        }
    }
}

impl FrameSink for SnapshotSink {
    fn render(&mut self, frame: &Frame, annotations: &[FaceAnnotation]) -> Result<(), SinkError> {
        LogSink.render(frame, annotations)?;

        let mut image = frame.image.clone();
        for a in annotations {
            a.draw(&mut image);
        }

        // Write-then-rename so readers never see a half-written file.
        let format = image::ImageFormat::from_path(&self.path).unwrap_or(image::ImageFormat::Png);
        image.save_with_format(&self.tmp_path, format)?;
        std::fs::rename(&self.tmp_path, &self.path)?;
        Ok(())
    }
}

impl Drop for SnapshotSink {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.tmp_path);
    }
}
