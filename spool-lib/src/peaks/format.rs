//! Binary peak-file layout.
//!
//! ```text
//! offset 0   i32 LE   chunk size in frames
//! offset 4.. f32 LE   {min, max} per channel, channels interleaved per chunk
//! ```

use std::fs::{self, File};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{Peak, PeaksError};

pub(crate) const HEADER_SIZE: u64 = 4;
const PEAK_BYTES: u64 = 8; // min f32 + max f32

/// Peak file that belongs to `source` at resolution `chunksize`.
pub fn peak_file_path(source: &Path, chunksize: u32) -> PathBuf {
    let mut name = source.as_os_str().to_os_string();
    name.push(format!("-[{}].peak", chunksize));
    PathBuf::from(name)
}

/// Appends peak groups to a new peak file.
///
/// An atomic writer works on a sibling temp file that only replaces the
/// final file on [`PeakWriter::commit`]; dropping it uncommitted removes the
/// temp file. An in-place writer exposes its progress immediately.
pub(crate) struct PeakWriter {
    writer: BufWriter<File>,
    final_path: PathBuf,
    temp_path: Option<PathBuf>,
    committed: bool,
}

impl PeakWriter {
    pub(crate) fn create_atomic(path: &Path, chunksize: u32) -> Result<Self, PeaksError> {
        let mut temp = path.as_os_str().to_os_string();
        temp.push(".tmp");
        let temp_path = PathBuf::from(temp);
        let mut writer = Self {
            writer: BufWriter::new(File::create(&temp_path)?),
            final_path: path.to_path_buf(),
            temp_path: Some(temp_path),
            committed: false,
        };
        writer.write_header(chunksize)?;
        Ok(writer)
    }

    pub(crate) fn create_in_place(path: &Path, chunksize: u32) -> Result<Self, PeaksError> {
        let mut writer = Self {
            writer: BufWriter::new(File::create(path)?),
            final_path: path.to_path_buf(),
            temp_path: None,
            committed: false,
        };
        writer.write_header(chunksize)?;
        writer.writer.flush()?;
        Ok(writer)
    }

    fn write_header(&mut self, chunksize: u32) -> Result<(), PeaksError> {
        let chunksize =
            i32::try_from(chunksize).map_err(|_| PeaksError::InvalidChunksize(chunksize))?;
        self.writer.write_all(&chunksize.to_le_bytes())?;
        Ok(())
    }

    pub(crate) fn push(&mut self, peaks: &[Peak]) -> Result<(), PeaksError> {
        for peak in peaks {
            self.writer.write_all(&peak.min.to_le_bytes())?;
            self.writer.write_all(&peak.max.to_le_bytes())?;
        }
        Ok(())
    }

    pub(crate) fn flush(&mut self) -> Result<(), PeaksError> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flush and move the file into place. An in-place file is touched so
    /// it is at least as new as a source finalized while it was open.
    pub(crate) fn commit(mut self) -> Result<(), PeaksError> {
        self.writer.flush()?;
        match &self.temp_path {
            Some(temp_path) => fs::rename(temp_path, &self.final_path)?,
            None => self.writer.get_ref().set_modified(SystemTime::now())?,
        }
        self.committed = true;
        Ok(())
    }
}

impl Drop for PeakWriter {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Some(temp_path) = &self.temp_path {
            let _ = fs::remove_file(temp_path);
        }
    }
}

/// Random access to the records of an existing peak file.
pub(crate) struct PeakFile {
    file: File,
    chunksize: u32,
    records: u64,
}

impl PeakFile {
    pub(crate) fn open(path: &Path) -> Result<Self, PeaksError> {
        let mut file = File::open(path)?;
        let mut header = [0_u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)?;
        let chunksize = i32::from_le_bytes(header);
        if chunksize <= 0 {
            return Err(PeaksError::InvalidFormat(format!(
                "chunk size must be positive, found {}",
                chunksize
            )));
        }
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            chunksize: chunksize as u32,
            records: len.saturating_sub(HEADER_SIZE) / PEAK_BYTES,
        })
    }

    pub(crate) fn chunksize(&self) -> u32 {
        self.chunksize
    }

    /// Complete chunk groups stored for a source with `channels` channels.
    pub(crate) fn groups(&self, channels: usize) -> u64 {
        self.records / channels as u64
    }

    /// Read up to `count` groups starting at `first`. Reading stops early at
    /// the end of the stored data.
    pub(crate) fn read_groups(
        &mut self,
        first: u64,
        count: u64,
        channels: usize,
    ) -> Result<Vec<Peak>, PeaksError> {
        let available = self.groups(channels).saturating_sub(first);
        let count = count.min(available);
        let records = usize::try_from(count * channels as u64).map_err(|_| {
            PeaksError::InvalidFormat("peak range exceeds addressable memory size".to_string())
        })?;
        if records == 0 {
            return Ok(Vec::new());
        }

        let offset = HEADER_SIZE + first * channels as u64 * PEAK_BYTES;
        self.file.seek(SeekFrom::Start(offset))?;
        let mut bytes = vec![0_u8; records * PEAK_BYTES as usize];
        self.file.read_exact(&mut bytes)?;

        Ok(bytes
            .chunks_exact(PEAK_BYTES as usize)
            .map(|record| Peak {
                min: f32::from_le_bytes([record[0], record[1], record[2], record[3]]),
                max: f32::from_le_bytes([record[4], record[5], record[6], record[7]]),
            })
            .collect())
    }
}
