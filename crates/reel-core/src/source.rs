//! Media source adapters: file, network URL, and capture inputs.
//!
//! The adapter resolves a [`MediaLocator`] into everything the demux layer
//! needs to open a container: a pull-based byte stream plus a probe window
//! for file sources, a bounded network timeout for URL sources, or a named
//! capture backend for camera/desktop sources.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use url::Url;

use crate::video::MediaError;

/// How many leading bytes of a file the demux layer gets for container
/// format probing. The stream is rewound after the probe is read.
pub const PROBE_WINDOW: usize = 64 * 1024;

/// Connect/read timeout applied to network sources.
pub const NETWORK_TIMEOUT: Duration = Duration::from_secs(5);

/// Identifies a media input.
#[derive(Debug, Clone)]
pub enum MediaLocator {
    /// A local file path
    File(PathBuf),
    /// A network URL
    Url(Url),
    /// The default camera capture device
    Camera,
    /// Desktop/screen capture
    Desktop,
}

impl MediaLocator {
    /// True for file-backed sources, the only kind that accepts seeks.
    pub fn is_file(&self) -> bool {
        matches!(self, MediaLocator::File(_))
    }
}

/// Pull-based byte access handed to the demux layer.
pub trait ByteStream: Send {
    /// Reads into `buf`. Zero bytes read means end-of-stream.
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Absolute/relative/end-relative repositioning.
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64>;

    /// Total size in bytes, when the medium can report it.
    fn byte_len(&self) -> Option<u64>;
}

/// A regular file opened for shared read.
pub struct FileStream {
    file: File,
    len: u64,
}

impl FileStream {
    /// Opens `path`, requiring it to resolve to a regular file.
    pub fn open(path: &Path) -> Result<Self, MediaError> {
        let meta = std::fs::metadata(path)
            .map_err(|e| MediaError::OpenFailed(format!("{}: {e}", path.display())))?;
        if !meta.is_file() {
            return Err(MediaError::OpenFailed(format!(
                "{}: not a regular file",
                path.display()
            )));
        }
        let file = File::open(path)
            .map_err(|e| MediaError::OpenFailed(format!("{}: {e}", path.display())))?;
        Ok(Self {
            file,
            len: meta.len(),
        })
    }
}

impl ByteStream for FileStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }

    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.file.seek(pos)
    }

    fn byte_len(&self) -> Option<u64> {
        Some(self.len)
    }
}

/// A named capture backend resolved for camera/desktop sources.
///
/// The demux layer opens the backend by name instead of reading bytes; the
/// optional target selects a capture surface where the backend needs one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureBackend {
    pub name: &'static str,
    pub target: Option<&'static str>,
}

#[cfg(target_os = "linux")]
fn camera_backend() -> CaptureBackend {
    CaptureBackend {
        name: "v4l2",
        target: Some("/dev/video0"),
    }
}

#[cfg(target_os = "macos")]
fn camera_backend() -> CaptureBackend {
    CaptureBackend {
        name: "avfoundation",
        target: Some("0"),
    }
}

#[cfg(target_os = "windows")]
fn camera_backend() -> CaptureBackend {
    CaptureBackend {
        name: "vfwcap",
        target: None,
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn camera_backend() -> CaptureBackend {
    CaptureBackend {
        name: "camera",
        target: None,
    }
}

#[cfg(target_os = "linux")]
fn desktop_backend() -> CaptureBackend {
    CaptureBackend {
        name: "x11grab",
        target: Some(":0.0"),
    }
}

#[cfg(target_os = "macos")]
fn desktop_backend() -> CaptureBackend {
    CaptureBackend {
        name: "avfoundation",
        target: Some("1:none"),
    }
}

#[cfg(target_os = "windows")]
fn desktop_backend() -> CaptureBackend {
    CaptureBackend {
        name: "gdigrab",
        target: Some("desktop"),
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn desktop_backend() -> CaptureBackend {
    CaptureBackend {
        name: "desktop",
        target: None,
    }
}

/// Everything the demux layer needs to open a container.
pub struct OpenedSource {
    pub locator: MediaLocator,
    /// Byte stream for file sources
    pub stream: Option<Box<dyn ByteStream>>,
    /// Leading bytes for container probing; the stream is rewound
    pub probe: Option<Vec<u8>>,
    /// Bounded timeout for network sources
    pub network_timeout: Option<Duration>,
    /// Resolved backend for capture sources
    pub capture: Option<CaptureBackend>,
}

/// Resolves locators into opened sources.
pub struct SourceAdapter;

impl SourceAdapter {
    /// Opens a locator. On failure every partially acquired resource has
    /// already been released (nothing is stored before this returns).
    pub fn open(locator: MediaLocator) -> Result<OpenedSource, MediaError> {
        match locator {
            MediaLocator::File(path) => Self::open_file(path),
            MediaLocator::Url(url) => {
                tracing::debug!(url = %url, "opening network source");
                Ok(OpenedSource {
                    locator: MediaLocator::Url(url),
                    stream: None,
                    probe: None,
                    network_timeout: Some(NETWORK_TIMEOUT),
                    capture: None,
                })
            }
            MediaLocator::Camera => {
                let capture = camera_backend();
                tracing::debug!(backend = capture.name, "opening camera source");
                Ok(OpenedSource {
                    locator: MediaLocator::Camera,
                    stream: None,
                    probe: None,
                    network_timeout: None,
                    capture: Some(capture),
                })
            }
            MediaLocator::Desktop => {
                let capture = desktop_backend();
                tracing::debug!(backend = capture.name, "opening desktop source");
                Ok(OpenedSource {
                    locator: MediaLocator::Desktop,
                    stream: None,
                    probe: None,
                    network_timeout: None,
                    capture: Some(capture),
                })
            }
        }
    }

    fn open_file(path: PathBuf) -> Result<OpenedSource, MediaError> {
        let mut stream = FileStream::open(&path)?;

        // Read the probe window so the demux layer can guess the container
        // format, then rewind to the start of the file.
        let mut probe = vec![0u8; PROBE_WINDOW];
        let mut filled = 0;
        while filled < probe.len() {
            let n = stream
                .read(&mut probe[filled..])
                .map_err(|e| MediaError::Io(e.to_string()))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        probe.truncate(filled);
        stream
            .seek(SeekFrom::Start(0))
            .map_err(|e| MediaError::Io(e.to_string()))?;

        tracing::debug!(path = %path.display(), probe_len = filled, "opened file source");

        Ok(OpenedSource {
            locator: MediaLocator::File(path),
            stream: Some(Box::new(stream)),
            probe: Some(probe),
            network_timeout: None,
            capture: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_file_source_probe_and_rewind() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"ftypisom-some-container-bytes").unwrap();

        let source = SourceAdapter::open(MediaLocator::File(tmp.path().to_path_buf())).unwrap();
        let probe = source.probe.unwrap();
        assert_eq!(probe, b"ftypisom-some-container-bytes");

        // The stream was rewound: reading starts at byte zero again.
        let mut stream = source.stream.unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"ftyp");
        assert_eq!(stream.byte_len(), Some(29));
    }

    #[test]
    fn test_missing_file_fails() {
        let result = SourceAdapter::open(MediaLocator::File(PathBuf::from(
            "/nonexistent/definitely-missing.mp4",
        )));
        assert!(matches!(result, Err(MediaError::OpenFailed(_))));
    }

    #[test]
    fn test_directory_is_not_a_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = SourceAdapter::open(MediaLocator::File(dir.path().to_path_buf()));
        assert!(matches!(result, Err(MediaError::OpenFailed(_))));
    }

    #[test]
    fn test_network_source_carries_timeout() {
        let url = Url::parse("rtsp://example.com/stream").unwrap();
        let source = SourceAdapter::open(MediaLocator::Url(url)).unwrap();
        assert_eq!(source.network_timeout, Some(NETWORK_TIMEOUT));
        assert!(source.stream.is_none());
        assert!(source.probe.is_none());
    }

    #[test]
    fn test_capture_sources_resolve_backends() {
        let camera = SourceAdapter::open(MediaLocator::Camera).unwrap();
        assert!(camera.capture.is_some());
        let desktop = SourceAdapter::open(MediaLocator::Desktop).unwrap();
        assert!(desktop.capture.is_some());
        assert!(!camera.locator.is_file());
    }

    #[test]
    fn test_zero_read_is_end_of_stream() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"abc").unwrap();
        let mut stream = FileStream::open(tmp.path()).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).unwrap(), 3);
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
    }
}
