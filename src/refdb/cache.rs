//! The `.mpz1` on-disk cache: a gzip-compressed msgpack dump of a slice.
//!
//! Files are self-describing only by name. Readers stream gzip into the
//! msgpack decoder; writers truncate and rewrite the whole file.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::RefDbError;

const SUFFIX: &str = ".mpz1";

/// Append the cache suffix when absent. Idempotent.
pub fn filename(name: &str) -> String {
    if name.ends_with(SUFFIX) {
        name.to_string()
    } else {
        format!("{name}{SUFFIX}")
    }
}

fn path(dir: &Path, name: &str) -> PathBuf {
    dir.join(filename(name))
}

pub fn exists(dir: &Path, name: &str) -> bool {
    path(dir, name).is_file()
}

/// Serialize `items`, compress and write to `<dir>/<name>.mpz1`.
pub fn write<T: Serialize>(dir: &Path, name: &str, items: &[T]) -> Result<(), RefDbError> {
    std::fs::create_dir_all(dir)?;
    let file = open_for_rewrite(&path(dir, name))?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    rmp_serde::encode::write(&mut encoder, items)?;
    encoder.finish()?;
    Ok(())
}

#[cfg(unix)]
fn open_for_rewrite(p: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(p)
}

#[cfg(not(unix))]
fn open_for_rewrite(p: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(p)
}

/// Read `<dir>/<name>.mpz1` back into a vector.
pub fn read<T: DeserializeOwned>(dir: &Path, name: &str) -> Result<Vec<T>, RefDbError> {
    let file = File::open(path(dir, name))?;
    let decoder = GzDecoder::new(file);
    Ok(rmp_serde::decode::from_read(decoder)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        a: bool,
        b: String,
        c: i64,
    }

    #[test]
    fn test_filename_is_idempotent() {
        assert_eq!(filename("t"), "t.mpz1");
        assert_eq!(filename("t.mpz1"), "t.mpz1");
        assert_eq!(filename(&filename("cache")), filename("cache"));
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let items = vec![
            Sample {
                a: true,
                b: "str".into(),
                c: 42,
            },
            Sample {
                a: false,
                b: "false".into(),
                c: -1,
            },
        ];

        write(dir.path(), "t", &items).unwrap();
        assert!(dir.path().join("t.mpz1").is_file());
        assert!(exists(dir.path(), "t"));
        assert!(exists(dir.path(), "t.mpz1"));

        let back: Vec<Sample> = read(dir.path(), "t").unwrap();
        assert_eq!(back, items);
    }

    #[test]
    fn test_write_truncates_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let long: Vec<u32> = (0..1000).collect();
        write(dir.path(), "t", &long).unwrap();
        let short = vec![7u32];
        write(dir.path(), "t", &short).unwrap();
        let back: Vec<u32> = read(dir.path(), "t").unwrap();
        assert_eq!(back, short);
    }

    #[test]
    fn test_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!exists(dir.path(), "absent"));
        assert!(read::<Sample>(dir.path(), "absent").is_err());
    }
}
