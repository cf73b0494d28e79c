//! Scan decoder seam
//!
//! Reading the satellite file format is delegated to an external program.
//! [`CommandDecoder`] speaks a two-subcommand protocol:
//!
//! - `<cmd> header <scan>` prints the [`ScanHeader`] as JSON on stdout
//! - `<cmd> radiance <scan> <row0> <row1> <col0> <col1> <out>` writes the
//!   half-open radiance window to `<out>` as little-endian `f32`, row-major

use crate::frame::ScanHeader;
use crate::grid::PixelWindow;
use async_trait::async_trait;
use ndarray::Array2;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    /// Decoder program not found in PATH
    #[error("decoder program not found: {0}")]
    BinaryNotFound(String),

    /// Failed to launch the decoder
    #[error("failed to execute decoder: {0}")]
    ExecutionError(String),

    /// Decoder exited unsuccessfully
    #[error("decoder failed: {0}")]
    DecoderFailed(String),

    /// Decoder output could not be interpreted
    #[error("failed to parse decoder output: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Reads headers and radiance windows from scan files
#[async_trait]
pub trait ScanDecoder: Send + Sync {
    async fn header(&self, scan: &Path) -> Result<ScanHeader, DecodeError>;

    /// Radiance over `window`, shaped `window.shape()`
    async fn read_radiance(&self, scan: &Path, window: &PixelWindow) -> Result<Array2<f32>, DecodeError>;
}

/// Decoder backed by an external program
pub struct CommandDecoder {
    program: String,
    args: Vec<String>,
    scratch_dir: PathBuf,
    counter: AtomicU64,
}

impl CommandDecoder {
    /// `args` are placed before the subcommand; radiance files are written
    /// under `scratch_dir`
    pub fn new(program: impl Into<String>, args: Vec<String>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            scratch_dir: scratch_dir.into(),
            counter: AtomicU64::new(0),
        }
    }

    fn scratch_file(&self) -> PathBuf {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        self.scratch_dir
            .join(format!("radiance_{}_{n}.f32", std::process::id()))
    }

    async fn run(&self, tail: Vec<String>) -> Result<Output, DecodeError> {
        let program = self.program.clone();
        let mut argv = self.args.clone();
        argv.extend(tail);

        tracing::debug!(program = %program, args = ?argv, "Running decoder");

        let output = tokio::task::spawn_blocking({
            let program = program.clone();
            move || Command::new(&program).args(&argv).output()
        })
        .await
        .map_err(|e| DecodeError::ExecutionError(format!("task join error: {e}")))?
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DecodeError::BinaryNotFound(program)
            } else {
                DecodeError::ExecutionError(e.to_string())
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DecodeError::DecoderFailed(format!(
                "exit status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(output)
    }
}

#[async_trait]
impl ScanDecoder for CommandDecoder {
    async fn header(&self, scan: &Path) -> Result<ScanHeader, DecodeError> {
        let output = self
            .run(vec!["header".to_string(), scan.display().to_string()])
            .await?;
        parse_header(&output.stdout)
    }

    async fn read_radiance(&self, scan: &Path, window: &PixelWindow) -> Result<Array2<f32>, DecodeError> {
        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        let out = self.scratch_file();

        let result = self
            .run(vec![
                "radiance".to_string(),
                scan.display().to_string(),
                window.row0.to_string(),
                window.row1.to_string(),
                window.col0.to_string(),
                window.col1.to_string(),
                out.display().to_string(),
            ])
            .await;

        let bytes = match result {
            Ok(_) => tokio::fs::read(&out).await,
            Err(e) => {
                let _ = tokio::fs::remove_file(&out).await;
                return Err(e);
            }
        };
        if let Err(e) = tokio::fs::remove_file(&out).await {
            tracing::warn!(file = %out.display(), error = %e, "Failed to clean up radiance file");
        }

        decode_f32_le(&bytes?, window.shape())
    }
}

pub fn parse_header(stdout: &[u8]) -> Result<ScanHeader, DecodeError> {
    serde_json::from_slice(stdout).map_err(|e| DecodeError::ParseError(e.to_string()))
}

/// Row-major little-endian `f32` buffer into an array of `shape`
pub fn decode_f32_le(bytes: &[u8], shape: (usize, usize)) -> Result<Array2<f32>, DecodeError> {
    let expected = shape.0 * shape.1 * 4;
    if bytes.len() != expected {
        return Err(DecodeError::ParseError(format!(
            "radiance file holds {} bytes, expected {expected} for {}x{}",
            bytes.len(),
            shape.0,
            shape.1
        )));
    }
    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Array2::from_shape_vec(shape, values).map_err(|e| DecodeError::ParseError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_decode_f32_le() {
        let mut bytes = Vec::new();
        for v in [1.0f32, -2.5, 0.0, 7.25, f32::NAN, 3.0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let arr = decode_f32_le(&bytes, (2, 3)).unwrap();
        assert_eq!(arr[[0, 1]], -2.5);
        assert_eq!(arr[[1, 0]], 7.25);
        assert!(arr[[1, 1]].is_nan());

        assert!(matches!(
            decode_f32_le(&bytes[..20], (2, 3)),
            Err(DecodeError::ParseError(_))
        ));
    }

    #[test]
    fn test_parse_header_rejects_garbage() {
        assert!(matches!(
            parse_header(b"not json"),
            Err(DecodeError::ParseError(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_program_reports_not_found() {
        let dir = tempfile::TempDir::new().unwrap();
        let decoder = CommandDecoder::new("ctp-decoder-that-does-not-exist", Vec::new(), dir.path());
        let err = decoder.header(Path::new("scan.nc")).await.unwrap_err();
        assert!(matches!(err, DecodeError::BinaryNotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_exit_includes_stderr() {
        let dir = tempfile::TempDir::new().unwrap();
        let decoder = CommandDecoder::new(
            "sh",
            vec!["-c".to_string(), "echo broken scan >&2; exit 3".to_string(), "decoder".to_string()],
            dir.path(),
        );
        let err = decoder.header(Path::new("scan.nc")).await.unwrap_err();
        match err {
            DecodeError::DecoderFailed(msg) => assert!(msg.contains("broken scan")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_radiance_file_is_read_and_removed() {
        let dir = tempfile::TempDir::new().unwrap();
        // $7 is the output path: sh -c <script> decoder radiance scan r0 r1 c0 c1 out
        let script = r#"printf '\000\000\200\077\000\000\000\100' > "$7""#;
        let decoder = CommandDecoder::new(
            "sh",
            vec!["-c".to_string(), script.to_string(), "decoder".to_string()],
            dir.path(),
        );
        let window = PixelWindow {
            row0: 0,
            row1: 1,
            col0: 0,
            col1: 2,
        };
        let radiance = decoder
            .read_radiance(Path::new("scan.nc"), &window)
            .await
            .unwrap();
        assert_eq!(radiance, array![[1.0, 2.0]]);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
