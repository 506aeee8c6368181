//! Local frame source.
//!
//! `FileSource` reads frames without network access:
//! - `stub://<name>?frames=N&width=W&height=H` synthesizes a scene with one
//!   colored object sweeping left to right
//! - a directory path yields the images inside it in file-name order
//!   (requires the ingest-images feature)

use anyhow::{anyhow, Context, Result};
#[cfg(any(feature = "ingest-images", test))]
use std::path::{Path, PathBuf};
use url::Url;

use crate::frame::{Frame, FrameSource};

const DEFAULT_SYNTHETIC_FRAMES: u64 = 100;
const BACKGROUND_RGB: [u8; 3] = [40, 120, 40];
const OBJECT_RGB: [u8; 3] = [220, 140, 20];
/// Largest synthetic width or height; frames are allocated up front.
const MAX_SYNTHETIC_DIMENSION: u32 = 8192;

/// Configuration for a local frame source.
#[derive(Clone, Debug)]
pub struct FileConfig {
    /// `stub://...` or a local directory path.
    pub path: String,
    /// Synthetic frame width (directory sources use the image size).
    pub width: u32,
    /// Synthetic frame height.
    pub height: u32,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            path: "stub://apiary".to_string(),
            width: 640,
            height: 480,
        }
    }
}

/// Local frame source.
pub struct FileSource {
    backend: FileBackend,
}

enum FileBackend {
    Synthetic(SyntheticSource),
    #[cfg(feature = "ingest-images")]
    Images(ImageDirSource),
}

impl FileSource {
    pub fn new(config: FileConfig) -> Result<Self> {
        if config.path.trim().is_empty() {
            return Err(anyhow!("frame source path must not be empty"));
        }
        if config.path.starts_with("stub://") {
            return Ok(Self {
                backend: FileBackend::Synthetic(SyntheticSource::new(&config)?),
            });
        }
        if config.path.contains("://") {
            return Err(anyhow!(
                "frame source only supports local paths or stub:// (got {})",
                config.path
            ));
        }
        #[cfg(feature = "ingest-images")]
        {
            Ok(Self {
                backend: FileBackend::Images(ImageDirSource::new(&config)?),
            })
        }
        #[cfg(not(feature = "ingest-images"))]
        {
            Err(anyhow!(
                "image directory ingestion requires the ingest-images feature"
            ))
        }
    }
}

impl FrameSource for FileSource {
    fn describe(&self) -> String {
        match &self.backend {
            FileBackend::Synthetic(source) => source.url.to_string(),
            #[cfg(feature = "ingest-images")]
            FileBackend::Images(source) => source.dir.display().to_string(),
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        match &mut self.backend {
            FileBackend::Synthetic(source) => source.next_frame(),
            #[cfg(feature = "ingest-images")]
            FileBackend::Images(source) => source.next_frame(),
        }
    }

    fn frames_produced(&self) -> u64 {
        match &self.backend {
            FileBackend::Synthetic(source) => source.frame_count,
            #[cfg(feature = "ingest-images")]
            FileBackend::Images(source) => source.frame_count,
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://)
// ----------------------------------------------------------------------------

struct SyntheticSource {
    url: Url,
    total_frames: u64,
    width: u32,
    height: u32,
    frame_count: u64,
}

impl SyntheticSource {
    fn new(config: &FileConfig) -> Result<Self> {
        let url = Url::parse(&config.path).context("parse stub source url")?;
        let mut total_frames = DEFAULT_SYNTHETIC_FRAMES;
        let mut width = config.width;
        let mut height = config.height;
        for (key, value) in url.query_pairs() {
            let parsed: u64 = value
                .parse()
                .map_err(|_| anyhow!("stub source parameter {}={} is not an integer", key, value))?;
            let dimension = || {
                u32::try_from(parsed)
                    .map_err(|_| anyhow!("stub source {} {} is out of range", key, parsed))
            };
            match key.as_ref() {
                "frames" => total_frames = parsed,
                "width" => width = dimension()?,
                "height" => height = dimension()?,
                other => return Err(anyhow!("unknown stub source parameter '{}'", other)),
            }
        }
        if width == 0 || height == 0 {
            return Err(anyhow!("stub source dimensions must be non-zero"));
        }
        if width > MAX_SYNTHETIC_DIMENSION || height > MAX_SYNTHETIC_DIMENSION {
            return Err(anyhow!(
                "stub source {}x{} exceeds the {} pixel limit per side",
                width,
                height,
                MAX_SYNTHETIC_DIMENSION
            ));
        }
        log::info!(
            "FileSource: synthetic {} ({} frames, {}x{})",
            url,
            total_frames,
            width,
            height
        );
        Ok(Self {
            url,
            total_frames,
            width,
            height,
            frame_count: 0,
        })
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.frame_count >= self.total_frames {
            return Ok(None);
        }
        self.frame_count += 1;

        let mut frame = Frame::solid(self.width, self.height, BACKGROUND_RGB);
        frame.index = self.frame_count;

        let size = (self.width.min(self.height) / 8).max(1);
        let travel = self.width.saturating_sub(size).max(1) as u64;
        let x1 = ((self.frame_count * 7) % travel) as u32;
        let y1 = self.height / 2 - size / 2;
        frame.fill_rect(x1, y1, x1 + size, y1 + size, OBJECT_RGB);
        Ok(Some(frame))
    }
}

// ----------------------------------------------------------------------------
// Image directory source
// ----------------------------------------------------------------------------

#[cfg(feature = "ingest-images")]
struct ImageDirSource {
    dir: PathBuf,
    files: std::vec::IntoIter<PathBuf>,
    frame_count: u64,
}

#[cfg(feature = "ingest-images")]
impl ImageDirSource {
    fn new(config: &FileConfig) -> Result<Self> {
        let dir = PathBuf::from(&config.path);
        let mut files = list_images(&dir)?;
        files.sort();
        log::info!(
            "FileSource: {} images in {}",
            files.len(),
            dir.display()
        );
        Ok(Self {
            dir,
            files: files.into_iter(),
            frame_count: 0,
        })
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(path) = self.files.next() else {
            return Ok(None);
        };
        let image = image::open(&path)
            .with_context(|| format!("decode image {}", path.display()))?
            .into_rgb8();
        let (width, height) = image.dimensions();
        self.frame_count += 1;
        let frame = Frame::new(image.into_raw(), width, height, self.frame_count)?;
        Ok(Some(frame))
    }
}

#[cfg(any(feature = "ingest-images", test))]
fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("read frame directory {}", dir.display()))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| matches!(ext.to_lowercase().as_str(), "jpg" | "jpeg" | "png"))
            .unwrap_or(false);
        if is_image {
            files.push(path);
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_source_is_finite() {
        let mut source = FileSource::new(FileConfig {
            path: "stub://bench?frames=3&width=64&height=32".to_string(),
            ..FileConfig::default()
        })
        .unwrap();
        let mut indices = Vec::new();
        while let Some(frame) = source.next_frame().unwrap() {
            assert_eq!((frame.width, frame.height), (64, 32));
            indices.push(frame.index);
        }
        assert_eq!(indices, vec![1, 2, 3]);
        assert_eq!(source.frames_produced(), 3);
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn synthetic_frames_contain_the_object_color() {
        let mut source = FileSource::new(FileConfig {
            path: "stub://bench?frames=1&width=80&height=80".to_string(),
            ..FileConfig::default()
        })
        .unwrap();
        let frame = source.next_frame().unwrap().unwrap();
        let found = frame
            .pixels()
            .chunks(3)
            .any(|px| px == OBJECT_RGB.as_slice());
        assert!(found);
    }

    #[test]
    fn rejects_remote_urls_and_unknown_parameters() {
        assert!(FileSource::new(FileConfig {
            path: "rtsp://camera".to_string(),
            ..FileConfig::default()
        })
        .is_err());
        assert!(FileSource::new(FileConfig {
            path: "stub://bench?fps=3".to_string(),
            ..FileConfig::default()
        })
        .is_err());
    }

    #[test]
    fn rejects_oversized_dimensions() {
        for path in [
            "stub://bench?width=4294967296&height=10",
            "stub://bench?width=10&height=4294967360",
            "stub://bench?width=8193&height=10",
            "stub://bench?width=0",
        ] {
            let err = FileSource::new(FileConfig {
                path: path.to_string(),
                ..FileConfig::default()
            });
            assert!(err.is_err(), "{} should be rejected", path);
        }
        assert!(FileSource::new(FileConfig {
            path: "stub://bench?frames=1&width=8192&height=1".to_string(),
            ..FileConfig::default()
        })
        .is_ok());
    }

    #[test]
    fn lists_only_image_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.png"), b"x").unwrap();
        std::fs::write(dir.path().join("a.JPG"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        let mut files = list_images(dir.path()).unwrap();
        files.sort();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.JPG", "b.png"]);
    }
}
