//! Whisper 1.x round-robin archive files.
//!
//! Fixed-size files holding layered archives of `(timestamp, value)`
//! points, big-endian on disk. Writes land in the highest-precision
//! archive covering the sample age and propagate downward whenever enough
//! of the higher archive's window is known (the x-files factor).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::StoreError;

const METADATA_SIZE: u64 = 16;
const ARCHIVE_INFO_SIZE: u64 = 12;
const POINT_SIZE: u64 = 12;

/// On-disk aggregation selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Average,
    Sum,
    Last,
    Max,
    Min,
}

impl Aggregation {
    fn to_u32(self) -> u32 {
        match self {
            Aggregation::Average => 1,
            Aggregation::Sum => 2,
            Aggregation::Last => 3,
            Aggregation::Max => 4,
            Aggregation::Min => 5,
        }
    }

    fn from_u32(v: u32) -> Result<Self, StoreError> {
        Ok(match v {
            1 => Aggregation::Average,
            2 => Aggregation::Sum,
            3 => Aggregation::Last,
            4 => Aggregation::Max,
            5 => Aggregation::Min,
            other => {
                return Err(StoreError::BadWhisperFile(format!(
                    "unknown aggregation {other}"
                )))
            }
        })
    }

    fn apply(self, values: &[f64]) -> f64 {
        match self {
            Aggregation::Average => values.iter().sum::<f64>() / values.len() as f64,
            Aggregation::Sum => values.iter().sum(),
            Aggregation::Last => *values.last().unwrap_or(&f64::NAN),
            Aggregation::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            Aggregation::Min => values.iter().cloned().fold(f64::INFINITY, f64::min),
        }
    }
}

/// One retention layer: `seconds_per_point` granularity held for
/// `points` slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub seconds_per_point: u32,
    pub points: u32,
}

impl Retention {
    pub fn retention(&self) -> u32 {
        self.seconds_per_point * self.points
    }
}

/// Parse a retention policy like `10m:3d,1h:3w` into layers, highest
/// precision first.
pub fn parse_retentions(spec: &str) -> Result<Vec<Retention>, StoreError> {
    let mut retentions = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        let (granularity, length) = part
            .split_once(':')
            .ok_or_else(|| StoreError::InvalidRetention(part.to_string()))?;
        let granularity = crate::config::parse_duration(granularity)
            .map_err(|_| StoreError::InvalidRetention(part.to_string()))?;
        let length = crate::config::parse_duration(length)
            .map_err(|_| StoreError::InvalidRetention(part.to_string()))?;
        let seconds_per_point = granularity.as_secs() as u32;
        if seconds_per_point == 0 || length.as_secs() == 0 {
            return Err(StoreError::InvalidRetention(part.to_string()));
        }
        let points = (length.as_secs() / u64::from(seconds_per_point)) as u32;
        if points == 0 {
            return Err(StoreError::InvalidRetention(part.to_string()));
        }
        retentions.push(Retention {
            seconds_per_point,
            points,
        });
    }
    if retentions.is_empty() {
        return Err(StoreError::InvalidRetention(spec.to_string()));
    }
    validate_retentions(&retentions)?;
    Ok(retentions)
}

fn validate_retentions(retentions: &[Retention]) -> Result<(), StoreError> {
    for pair in retentions.windows(2) {
        let (higher, lower) = (pair[0], pair[1]);
        if lower.seconds_per_point <= higher.seconds_per_point
            || lower.seconds_per_point % higher.seconds_per_point != 0
            || lower.retention() <= higher.retention()
        {
            return Err(StoreError::InvalidRetention(format!(
                "{}:{} after {}:{}",
                lower.seconds_per_point,
                lower.points,
                higher.seconds_per_point,
                higher.points
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct ArchiveInfo {
    offset: u32,
    seconds_per_point: u32,
    points: u32,
}

impl ArchiveInfo {
    fn retention(&self) -> u32 {
        self.seconds_per_point * self.points
    }

    fn interval(&self, timestamp: u32) -> u32 {
        timestamp - timestamp % self.seconds_per_point
    }
}

/// An open whisper file.
pub struct Whisper {
    file: File,
    aggregation: Aggregation,
    max_retention: u32,
    x_files_factor: f32,
    archives: Vec<ArchiveInfo>,
}

impl Whisper {
    /// Create a new file with the given layout; refuses to overwrite.
    pub fn create(
        path: &Path,
        retentions: &[Retention],
        aggregation: Aggregation,
        x_files_factor: f32,
    ) -> Result<Self, StoreError> {
        validate_retentions(retentions)?;
        if retentions.is_empty() {
            return Err(StoreError::InvalidRetention("empty".into()));
        }

        let header_size = METADATA_SIZE + ARCHIVE_INFO_SIZE * retentions.len() as u64;
        let mut archives = Vec::with_capacity(retentions.len());
        let mut offset = header_size;
        for r in retentions {
            archives.push(ArchiveInfo {
                offset: offset as u32,
                seconds_per_point: r.seconds_per_point,
                points: r.points,
            });
            offset += u64::from(r.points) * POINT_SIZE;
        }
        let max_retention = retentions.last().map(Retention::retention).unwrap_or(0);

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let mut header = Vec::with_capacity(header_size as usize);
        header.extend_from_slice(&aggregation.to_u32().to_be_bytes());
        header.extend_from_slice(&max_retention.to_be_bytes());
        header.extend_from_slice(&x_files_factor.to_be_bytes());
        header.extend_from_slice(&(archives.len() as u32).to_be_bytes());
        for a in &archives {
            header.extend_from_slice(&a.offset.to_be_bytes());
            header.extend_from_slice(&a.seconds_per_point.to_be_bytes());
            header.extend_from_slice(&a.points.to_be_bytes());
        }
        file.write_all(&header)?;
        file.set_len(offset)?;

        Ok(Self {
            file,
            aggregation,
            max_retention,
            x_files_factor,
            archives,
        })
    }

    /// Open an existing file read-write.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut meta = [0u8; METADATA_SIZE as usize];
        file.read_exact(&mut meta)?;
        let aggregation = Aggregation::from_u32(u32::from_be_bytes(meta[0..4].try_into().unwrap()))?;
        let max_retention = u32::from_be_bytes(meta[4..8].try_into().unwrap());
        let x_files_factor = f32::from_be_bytes(meta[8..12].try_into().unwrap());
        let archive_count = u32::from_be_bytes(meta[12..16].try_into().unwrap());
        if archive_count == 0 || archive_count > 64 {
            return Err(StoreError::BadWhisperFile(format!(
                "archive count {archive_count}"
            )));
        }

        let mut archives = Vec::with_capacity(archive_count as usize);
        for _ in 0..archive_count {
            let mut info = [0u8; ARCHIVE_INFO_SIZE as usize];
            file.read_exact(&mut info)?;
            archives.push(ArchiveInfo {
                offset: u32::from_be_bytes(info[0..4].try_into().unwrap()),
                seconds_per_point: u32::from_be_bytes(info[4..8].try_into().unwrap()),
                points: u32::from_be_bytes(info[8..12].try_into().unwrap()),
            });
        }

        Ok(Self {
            file,
            aggregation,
            max_retention,
            x_files_factor,
            archives,
        })
    }

    /// Open read-write; a failed open falls through to a create call.
    pub fn open_or_create(
        path: &Path,
        retentions: &[Retention],
        aggregation: Aggregation,
        x_files_factor: f32,
    ) -> Result<Self, StoreError> {
        match Self::open(path) {
            Ok(w) => Ok(w),
            Err(_) => Self::create(path, retentions, aggregation, x_files_factor),
        }
    }

    pub fn update(&mut self, timestamp: u32, value: f64) -> Result<(), StoreError> {
        self.update_at(timestamp, value, unix_now())
    }

    /// Record one sample. The write lands in the highest-precision archive
    /// whose retention covers the sample's age, then aggregates downward.
    pub fn update_at(&mut self, timestamp: u32, value: f64, now: u32) -> Result<(), StoreError> {
        if timestamp > now || now - timestamp >= self.max_retention {
            return Err(StoreError::BadWhisperFile(format!(
                "timestamp {timestamp} outside retention window"
            )));
        }
        let age = now - timestamp;
        let index = self
            .archives
            .iter()
            .position(|a| age < a.retention())
            .unwrap_or(self.archives.len() - 1);

        let archive = self.archives[index];
        let interval = archive.interval(timestamp);
        self.write_point(&archive, interval, value)?;
        self.propagate(index, timestamp)?;
        Ok(())
    }

    /// Fetch the series covering `[from, until]`.
    pub fn fetch(&mut self, from: u32, until: u32) -> Result<TimeSeries, StoreError> {
        self.fetch_at(from, until, unix_now())
    }

    pub fn fetch_at(&mut self, from: u32, until: u32, now: u32) -> Result<TimeSeries, StoreError> {
        if from > until {
            return Err(StoreError::BadWhisperFile(format!(
                "invalid fetch window {from}..{until}"
            )));
        }
        let oldest = now.saturating_sub(self.max_retention);
        let from = from.max(oldest);
        let until = until.min(now);

        let age = now.saturating_sub(from);
        let archive = *self
            .archives
            .iter()
            .find(|a| age <= a.retention())
            .unwrap_or(self.archives.last().expect("at least one archive"));

        let step = archive.seconds_per_point;
        let from_interval = archive.interval(from) + step;
        let until_interval = archive.interval(until) + step;
        let slots = ((until_interval - from_interval) / step) as usize;

        let base = self.read_point(u64::from(archive.offset))?;
        let mut values = vec![f64::NAN; slots];
        if base.0 != 0 {
            for (slot, value) in values.iter_mut().enumerate() {
                let expected = from_interval + slot as u32 * step;
                let point = self.read_point(self.slot_offset(&archive, base.0, expected))?;
                if point.0 == expected {
                    *value = point.1;
                }
            }
        }

        Ok(TimeSeries {
            from: from_interval,
            until: until_interval,
            step,
            values,
        })
    }

    pub fn aggregation(&self) -> Aggregation {
        self.aggregation
    }

    pub fn x_files_factor(&self) -> f32 {
        self.x_files_factor
    }

    pub fn retentions(&self) -> Vec<Retention> {
        self.archives
            .iter()
            .map(|a| Retention {
                seconds_per_point: a.seconds_per_point,
                points: a.points,
            })
            .collect()
    }

    /// Aggregate freshly written intervals into each lower-precision
    /// archive while enough of the window is known.
    fn propagate(&mut self, from_index: usize, timestamp: u32) -> Result<(), StoreError> {
        for pair in from_index..self.archives.len().saturating_sub(1) {
            let higher = self.archives[pair];
            let lower = self.archives[pair + 1];

            let lower_interval = lower.interval(timestamp);
            let slots = (lower.seconds_per_point / higher.seconds_per_point) as usize;

            let base = self.read_point(u64::from(higher.offset))?;
            if base.0 == 0 {
                break;
            }
            let mut known = Vec::with_capacity(slots);
            for slot in 0..slots {
                let expected = lower_interval + slot as u32 * higher.seconds_per_point;
                let point = self.read_point(self.slot_offset(&higher, base.0, expected))?;
                if point.0 == expected {
                    known.push(point.1);
                }
            }

            if (known.len() as f32) < self.x_files_factor * slots as f32 || known.is_empty() {
                break;
            }
            let aggregate = self.aggregation.apply(&known);
            self.write_point(&lower, lower_interval, aggregate)?;
        }
        Ok(())
    }

    fn slot_offset(&self, archive: &ArchiveInfo, base_interval: u32, interval: u32) -> u64 {
        let spp = i64::from(archive.seconds_per_point);
        let points = i64::from(archive.points);
        let mut index = (i64::from(interval) - i64::from(base_interval)) / spp % points;
        if index < 0 {
            index += points;
        }
        u64::from(archive.offset) + index as u64 * POINT_SIZE
    }

    fn write_point(&mut self, archive: &ArchiveInfo, interval: u32, value: f64) -> Result<(), StoreError> {
        let base = self.read_point(u64::from(archive.offset))?;
        let offset = if base.0 == 0 {
            u64::from(archive.offset)
        } else {
            self.slot_offset(archive, base.0, interval)
        };
        let mut buf = [0u8; POINT_SIZE as usize];
        buf[0..4].copy_from_slice(&interval.to_be_bytes());
        buf[4..12].copy_from_slice(&value.to_be_bytes());
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&buf)?;
        Ok(())
    }

    fn read_point(&self, offset: u64) -> Result<(u32, f64), StoreError> {
        let mut buf = [0u8; POINT_SIZE as usize];
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        let ts = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let value = f64::from_be_bytes(buf[4..12].try_into().unwrap());
        Ok((ts, value))
    }
}

/// A fetched slice of one archive. Slots with no stored sample are NaN.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeries {
    pub from: u32,
    pub until: u32,
    pub step: u32,
    pub values: Vec<f64>,
}

impl TimeSeries {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// `(timestamp, value)` pairs, one per slot.
    pub fn points(&self) -> impl Iterator<Item = (u32, f64)> + '_ {
        self.values
            .iter()
            .enumerate()
            .map(|(i, &v)| (self.from + i as u32 * self.step, v))
    }
}

fn unix_now() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
