use std::fs::{self, File};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::models::error::CaptureError;
use crate::models::format::FormatDescriptor;
use crate::processing::wav_format;

/// A writer shared between the producer callback and the session controller.
pub type SharedWriter<W = BufWriter<File>> = Arc<Mutex<WavWriter<W>>>;

/// Progress of a writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriterState {
    /// PCM bytes appended after the header.
    pub bytes_written: u64,
    /// Set once by `close()`; no writes are accepted afterwards.
    pub header_finalized: bool,
}

/// Streaming WAV writer.
///
/// ## File Format
/// ```text
/// [44-byte WAV header, data length 0 until close]
/// [raw PCM data in the source's native layout...]
/// ```
///
/// The header is rewritten with the final data length exactly once, by `close()`.
pub struct WavWriter<W: Write + Seek = BufWriter<File>> {
    sink: Option<W>,
    format: FormatDescriptor,
    state: WriterState,
}

impl WavWriter<BufWriter<File>> {
    /// Create (or truncate) `path` and write the provisional header.
    pub fn create(path: &Path, format: FormatDescriptor) -> Result<Self, CaptureError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| CaptureError::io("failed to create directory", e))?;
        }

        let file = File::create(path).map_err(|e| CaptureError::io("failed to create file", e))?;

        Self::new(BufWriter::new(file), format)
    }
}

impl<W: Write + Seek> WavWriter<W> {
    /// Write the provisional header into `sink`.
    pub fn new(mut sink: W, format: FormatDescriptor) -> Result<Self, CaptureError> {
        let header = wav_format::generate_wav_header(&format, 0);
        sink.write_all(&header)
            .map_err(|e| CaptureError::io("failed to write WAV header", e))?;

        Ok(Self {
            sink: Some(sink),
            format,
            state: WriterState::default(),
        })
    }

    /// Append raw PCM bytes in the writer's format.
    ///
    /// A failed write leaves `bytes_written` unchanged.
    pub fn append(&mut self, data: &[u8]) -> Result<(), CaptureError> {
        if self.state.header_finalized {
            return Err(CaptureError::Io("writer already finalized".into()));
        }
        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| CaptureError::Io("file is not open".into()))?;
        sink.write_all(data)
            .map_err(|e| CaptureError::io("write failed", e))?;
        self.state.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Finalize the file: rewrite the header with the accumulated data
    /// length, flush and release the sink.
    ///
    /// Calling `close` again is a no-op.
    pub fn close(&mut self) -> Result<(), CaptureError> {
        if self.state.header_finalized {
            return Ok(());
        }
        let mut sink = self
            .sink
            .take()
            .ok_or_else(|| CaptureError::Io("file is not open".into()))?;

        if self.state.bytes_written > wav_format::MAX_DATA_SIZE {
            log::warn!(
                "Recording holds {} bytes, more than a WAV header can declare; header is saturated",
                self.state.bytes_written
            );
        }

        let header = wav_format::generate_wav_header(&self.format, self.state.bytes_written);
        sink.seek(SeekFrom::Start(0))
            .map_err(|e| CaptureError::io("failed to seek to header", e))?;
        sink.write_all(&header)
            .map_err(|e| CaptureError::io("failed to rewrite header", e))?;
        sink.flush().map_err(|e| CaptureError::io("failed to flush", e))?;

        self.state.header_finalized = true;
        Ok(())
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    pub fn format(&self) -> &FormatDescriptor {
        &self.format
    }

    pub fn into_shared(self) -> SharedWriter<W> {
        Arc::new(Mutex::new(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::format::SampleFormat;
    use crate::processing::wav_format::parse_header;
    use std::io::{self, Cursor};

    fn stereo_16() -> FormatDescriptor {
        FormatDescriptor::pcm(44100.0, 2, 16, SampleFormat::Int)
    }

    /// Seekable sink that fails every write once armed.
    struct BrokenSink {
        inner: Cursor<Vec<u8>>,
        fail: bool,
    }

    impl Write for BrokenSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            self.inner.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for BrokenSink {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    #[test]
    fn write_plain_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.wav");

        let mut writer = WavWriter::create(&path, stereo_16()).unwrap();
        writer.append(&[0u8; 16]).unwrap();
        writer.append(&[1u8; 8]).unwrap();
        writer.close().unwrap();

        let file_data = fs::read(&path).unwrap();
        assert_eq!(file_data.len(), 44 + 24);

        let header = parse_header(&file_data).unwrap();
        assert_eq!(header.data_size, 24);
        assert_eq!(header.riff_size, 36 + 24);
        assert_eq!(header.byte_rate, 176_400);
        assert_eq!(header.block_align, 4);
    }

    #[test]
    fn provisional_header_declares_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("open.wav");

        let mut writer = WavWriter::create(&path, stereo_16()).unwrap();
        writer.append(&[0u8; 400]).unwrap();
        // Flushes the provisional header without finalizing.
        drop(writer);

        let file_data = fs::read(&path).unwrap();
        assert_eq!(parse_header(&file_data).unwrap().data_size, 0);
    }

    #[test]
    fn close_twice_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("twice.wav");

        let mut writer = WavWriter::create(&path, stereo_16()).unwrap();
        writer.append(&[7u8; 64]).unwrap();
        writer.close().unwrap();
        let once = fs::read(&path).unwrap();

        writer.close().unwrap();
        let twice = fs::read(&path).unwrap();

        assert_eq!(once, twice);
        assert!(writer.state().header_finalized);
    }

    #[test]
    fn append_after_close_fails() {
        let mut writer = WavWriter::new(Cursor::new(Vec::new()), stereo_16()).unwrap();
        writer.close().unwrap();
        assert!(matches!(writer.append(&[0u8; 4]), Err(CaptureError::Io(_))));
        assert_eq!(writer.state().bytes_written, 0);
    }

    #[test]
    fn failed_append_is_not_counted() {
        let sink = BrokenSink {
            inner: Cursor::new(Vec::new()),
            fail: false,
        };
        let mut writer = WavWriter::new(sink, stereo_16()).unwrap();
        writer.append(&[0u8; 8]).unwrap();

        writer.sink.as_mut().unwrap().fail = true;
        assert!(writer.append(&[0u8; 8]).is_err());
        assert_eq!(writer.state().bytes_written, 8);
    }

    #[test]
    fn create_in_missing_location_fails() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();

        let result = WavWriter::create(&blocker.join("out.wav"), stereo_16());
        assert!(matches!(result, Err(CaptureError::Io(_))));
    }
}
