// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;

pub fn read_from_file<T>(path: &Path) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let val = match std::fs::read_to_string(path) {
        Ok(val) => val,
        Err(_) => {
            bail!("Failed to open or read file {:?}", path);
        }
    };
    let val = val.trim_end_matches('\0');

    match val.trim().parse::<T>() {
        Ok(parsed) => Ok(parsed),
        Err(_) => {
            bail!("Failed to parse content '{}' from {:?}", val.trim(), path);
        }
    }
}

/// Sizes as found in sysfs cache descriptions, e.g. 10K, 10M, 10G, 10.
pub fn read_file_byte(path: &Path) -> Result<usize> {
    let val = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {:?}", path))?;
    let val = val.trim_end_matches('\0').trim();

    for (suffix, mult) in [("K", 1usize << 10), ("M", 1 << 20), ("G", 1 << 30)] {
        if let Some(sval) = val.strip_suffix(suffix) {
            return Ok(sval.parse::<usize>()? * mult);
        }
    }
    Ok(val.parse::<usize>()?)
}

/// Write `content` to an existing sysfs/resctrl attribute in one `write(2)`.
pub fn write_to_file(path: &Path, content: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("Failed to open {:?}", path))?;
    file.write_all(content.as_bytes())
        .with_context(|| format!("Failed to write '{}' to {:?}", content.trim(), path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_file_byte() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("size");
        for (content, expected) in [("36608K\n", 36608 * 1024), ("2M", 2 << 20), ("512", 512)] {
            std::fs::write(&path, content).unwrap();
            assert_eq!(read_file_byte(&path).unwrap(), expected);
        }
        std::fs::write(&path, "lots").unwrap();
        assert!(read_file_byte(&path).is_err());
    }

    #[test]
    fn test_read_write() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("val");
        std::fs::write(&path, "").unwrap();
        write_to_file(&path, "42\n").unwrap();
        assert_eq!(read_from_file::<u32>(&path).unwrap(), 42);
        assert!(read_from_file::<u32>(&tmp.path().join("missing")).is_err());
        assert!(write_to_file(&tmp.path().join("missing"), "1").is_err());
    }
}
