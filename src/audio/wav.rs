//! RIFF/WAVE container writing
//!
//! `PcmContainerWriter` streams raw little-endian PCM into a file that starts
//! with a provisional 44-byte header. `finalize()` seeks back and rewrites the
//! header with the real data length. Reading (duration probing) goes through
//! hound.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::frame::PcmFormat;
use crate::error::{AudioError, Result};

/// Size of the minimal PCM header.
pub const HEADER_LEN: usize = 44;

/// Largest data chunk whose total-size field (36 + data) still fits in 32 bits.
pub const MAX_DATA_LEN: u32 = u32::MAX - 36;

/// Encode the 44-byte RIFF/WAVE header for `data_len` bytes of PCM.
/// Lengths past `MAX_DATA_LEN` are clamped so both size fields stay consistent.
pub fn encode_header(format: &PcmFormat, data_len: u32) -> [u8; HEADER_LEN] {
    let data_len = data_len.min(MAX_DATA_LEN);
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(b"RIFF");
    header[4..8].copy_from_slice(&(36 + data_len).to_le_bytes());
    header[8..12].copy_from_slice(b"WAVE");

    header[12..16].copy_from_slice(b"fmt ");
    header[16..20].copy_from_slice(&16u32.to_le_bytes());
    header[20..22].copy_from_slice(&1u16.to_le_bytes()); // PCM
    header[22..24].copy_from_slice(&format.channels.to_le_bytes());
    header[24..28].copy_from_slice(&format.sample_rate.to_le_bytes());
    header[28..32].copy_from_slice(&format.byte_rate().to_le_bytes());
    header[32..34].copy_from_slice(&format.block_align().to_le_bytes());
    header[34..36].copy_from_slice(&format.bits_per_sample.to_le_bytes());

    header[36..40].copy_from_slice(b"data");
    header[40..44].copy_from_slice(&data_len.to_le_bytes());
    header
}

/// Backing file of a container. Only `File` implements it outside tests.
trait ContainerFile: Write + Seek + Send {
    fn truncate(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}

impl ContainerFile for File {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

/// Streams PCM chunks into a WAV container.
pub struct PcmContainerWriter {
    path: PathBuf,
    format: PcmFormat,
    file: Option<BufWriter<Box<dyn ContainerFile>>>,
    data_len: u32,
    max_data_len: u32,
}

impl PcmContainerWriter {
    /// Create the file and write a provisional header (data length 0).
    /// A file that cannot receive its header is removed again.
    pub fn create(path: impl Into<PathBuf>, format: PcmFormat) -> Result<Self> {
        let path = path.into();
        if !format.is_valid() {
            return Err(AudioError::UnsupportedFormat(format!(
                "{} Hz, {} ch, {} bit",
                format.sample_rate, format.channels, format.bits_per_sample
            )));
        }

        let file = File::create(&path).map_err(|e| AudioError::io(&path, e))?;
        match Self::with_file(path.clone(), format, Box::new(file)) {
            Ok(writer) => Ok(writer),
            Err(e) => {
                if let Err(rm) = fs::remove_file(&path) {
                    log::warn!("Could not remove partial container {:?}: {}", path, rm);
                }
                Err(e)
            }
        }
    }

    fn with_file(path: PathBuf, format: PcmFormat, file: Box<dyn ContainerFile>) -> Result<Self> {
        let mut file = BufWriter::new(file);
        file.write_all(&encode_header(&format, 0))
            .map_err(|e| AudioError::io(&path, e))?;

        log::debug!(
            "Container opened: {:?} ({} Hz, {} ch, {} bit)",
            path,
            format.sample_rate,
            format.channels,
            format.bits_per_sample
        );

        Ok(Self {
            path,
            format,
            file: Some(file),
            data_len: 0,
            max_data_len: MAX_DATA_LEN,
        })
    }

    /// Cap the data chunk below the RIFF limit. Chunks that would cross it
    /// are rejected with `ContainerFull`.
    pub fn with_max_data_len(mut self, limit: u32) -> Self {
        self.max_data_len = limit.min(MAX_DATA_LEN);
        self
    }

    /// Append raw PCM bytes.
    ///
    /// On an I/O failure the file is cut back to the last complete chunk (or
    /// to what actually reached the disk), so `data_len()` and the header
    /// written by `finalize()` keep matching the file.
    pub fn write_chunk(&mut self, bytes: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| AudioError::AlreadyFinalized(self.path.clone()))?;

        let new_len = u32::try_from(bytes.len())
            .ok()
            .and_then(|n| self.data_len.checked_add(n))
            .filter(|&total| total <= self.max_data_len)
            .ok_or_else(|| AudioError::ContainerFull(self.path.clone()))?;

        if let Err(e) = file.write_all(bytes) {
            self.rewind_failed_write();
            return Err(AudioError::io(&self.path, e));
        }

        self.data_len = new_len;
        Ok(())
    }

    /// Drop the partial chunk a failed write left behind.
    fn rewind_failed_write(&mut self) {
        let Some(writer) = self.file.take() else {
            return;
        };
        // Buffered bytes are the tail of the stream that never reached the file
        let (mut file, buffered) = writer.into_parts();
        let buffered = buffered.unwrap_or_else(|panicked| panicked.into_inner());
        let committed = HEADER_LEN as u64 + u64::from(self.data_len);
        let block_align = u64::from(self.format.block_align().max(1));

        match settle(file.as_mut(), &buffered, committed, block_align) {
            Ok(kept) => {
                if kept < u64::from(self.data_len) {
                    log::warn!(
                        "Container {:?} lost {} committed bytes after a failed write",
                        self.path,
                        u64::from(self.data_len) - kept
                    );
                }
                self.data_len = u32::try_from(kept).unwrap_or(self.data_len);
            }
            Err(e) => log::error!(
                "Could not trim {:?} after a failed write, file may be inconsistent: {}",
                self.path,
                e
            ),
        }
        self.file = Some(BufWriter::new(file));
    }

    /// Rewrite the header with the final sizes and close the file.
    /// Returns the data length. Calling it twice is an error.
    pub fn finalize(&mut self) -> Result<u32> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| AudioError::AlreadyFinalized(self.path.clone()))?;

        let header = encode_header(&self.format, self.data_len);
        let written = file
            .seek(SeekFrom::Start(0))
            .and_then(|_| file.write_all(&header))
            .and_then(|_| file.flush());

        let synced = written.and_then(|_| {
            file.into_inner()
                .map_err(|e| e.into_error())
                .and_then(|mut f| f.sync())
        });

        synced.map_err(|e| AudioError::io(&self.path, e))?;

        log::debug!(
            "Container finalized: {:?} ({} data bytes)",
            self.path,
            self.data_len
        );
        Ok(self.data_len)
    }

    pub fn data_len(&self) -> u32 {
        self.data_len
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> PcmFormat {
        self.format
    }

    pub fn is_finalized(&self) -> bool {
        self.file.is_none()
    }
}

impl Drop for PcmContainerWriter {
    fn drop(&mut self) {
        if self.file.is_some() {
            match self.finalize() {
                Ok(len) => log::warn!(
                    "Container {:?} finalized on drop ({} data bytes)",
                    self.path,
                    len
                ),
                Err(e) => log::error!("Container {:?} could not be closed: {}", self.path, e),
            }
        }
    }
}

/// Flush what is still owed up to `committed`, then cut the file to whole
/// sample frames. Returns the data bytes kept.
fn settle(
    file: &mut dyn ContainerFile,
    buffered: &[u8],
    committed: u64,
    block_align: u64,
) -> io::Result<u64> {
    let on_disk = file.stream_position()?;
    let mut reached = on_disk;
    if on_disk < committed {
        let owed = usize::try_from(committed - on_disk)
            .unwrap_or(usize::MAX)
            .min(buffered.len());
        match file.write_all(&buffered[..owed]) {
            Ok(()) => reached += owed as u64,
            Err(e) => {
                log::warn!("Could not write back buffered PCM: {}", e);
                reached = file.stream_position()?;
            }
        }
    }

    let data = reached.min(committed).saturating_sub(HEADER_LEN as u64);
    let data = data - data % block_align;
    let end = HEADER_LEN as u64 + data;
    file.truncate(end)?;
    file.seek(SeekFrom::Start(end))?;
    Ok(data)
}

/// Playable length of a WAV file.
pub fn wav_duration(path: &Path) -> Result<Duration> {
    if !path.exists() {
        return Err(AudioError::NotFound(path.to_path_buf()));
    }

    let reader = hound::WavReader::open(path).map_err(|e| AudioError::InvalidFile {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return Err(AudioError::InvalidFile {
            path: path.to_path_buf(),
            reason: "sample rate is zero".to_string(),
        });
    }

    // hound reports duration in frames (samples per channel)
    let frames = reader.duration();
    Ok(Duration::from_secs_f64(
        frames as f64 / spec.sample_rate as f64,
    ))
}

/// Wrap an existing raw PCM file into a WAV container. Returns the data length.
pub fn convert_raw_pcm(pcm_path: &Path, wav_path: &Path, format: PcmFormat) -> Result<u32> {
    let pcm = File::open(pcm_path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => AudioError::NotFound(pcm_path.to_path_buf()),
        _ => AudioError::io(pcm_path, e),
    })?;
    let mut reader = BufReader::new(pcm);
    let mut writer = PcmContainerWriter::create(wav_path, format)?;

    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(AudioError::io(pcm_path, e)),
        };
        writer.write_chunk(&chunk[..n])?;
    }

    let len = writer.finalize()?;
    log::info!("Wrapped {:?} into {:?} ({} bytes)", pcm_path, wav_path, len);
    Ok(len)
}
