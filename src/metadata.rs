// Copyright (c) 2022, Matteo Bernacchia <dev@kikijiki.com>. All rights reserved.
// This project is dual licensed under the Apache License 2.0 and the MIT license.
// See the LICENSE files in the project root for details.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;

use tracing::info;

use crate::{
    errors::{RawCopyError, RawCopyResult},
    file_info::StandardInformation,
};

fn write_error(path: &Path) -> impl FnOnce(io::Error) -> RawCopyError + '_ {
    move |source| RawCopyError::MetadataWriteError {
        path: path.to_path_buf(),
        source,
    }
}

/// Gives the copied file the creation, access and modification times of
/// the original.
#[cfg(windows)]
pub fn apply_metadata(path: &Path, info: &StandardInformation) -> RawCopyResult<()> {
    use std::os::windows::io::AsRawHandle;

    use windows::Win32::Foundation::{FILETIME, HANDLE};
    use windows::Win32::Storage::FileSystem;

    fn file_time(ticks: u64) -> FILETIME {
        FILETIME {
            dwLowDateTime: ticks as u32,
            dwHighDateTime: (ticks >> 32) as u32,
        }
    }

    info!("Applying original file times to {}", path.display());
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(write_error(path))?;

    // NTFS ticks and FILETIME share epoch and resolution.
    let created = file_time(info.creation_time);
    let accessed = file_time(info.access_time);
    let modified = file_time(info.modification_time);

    let result = unsafe {
        FileSystem::SetFileTime(
            HANDLE(file.as_raw_handle()),
            Some(&created as *const FILETIME),
            Some(&accessed as *const FILETIME),
            Some(&modified as *const FILETIME),
        )
    };
    result.map_err(io::Error::from).map_err(write_error(path))
}

/// Gives the copied file the access and modification times of the original.
///
/// Creation time cannot be assigned through the portable API and is left
/// as is.
#[cfg(not(windows))]
pub fn apply_metadata(path: &Path, info: &StandardInformation) -> RawCopyResult<()> {
    use std::fs::FileTimes;

    use tracing::warn;

    info!("Applying original file times to {}", path.display());
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(write_error(path))?;

    let times = FileTimes::new()
        .set_accessed(info.accessed_system_time())
        .set_modified(info.modified_system_time());
    file.set_times(times).map_err(write_error(path))?;

    warn!(
        "Creation time {} not applied: unsupported on this platform",
        info.created()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::EPOCH_DIFFERENCE;

    fn info() -> StandardInformation {
        StandardInformation {
            creation_time: EPOCH_DIFFERENCE + 1_500_000_000 * 10_000_000,
            modification_time: EPOCH_DIFFERENCE + 1_600_000_000 * 10_000_000 + 5,
            mft_modification_time: EPOCH_DIFFERENCE + 1_600_000_001 * 10_000_000,
            access_time: EPOCH_DIFFERENCE + 1_650_000_000 * 10_000_000,
            file_attributes: 0,
            size: 3,
        }
    }

    #[test]
    fn applies_access_and_modification_times() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        std::fs::write(&path, b"abc").unwrap();

        apply_metadata(&path, &info()).unwrap();

        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.modified().unwrap(), info().modified_system_time());
        assert_eq!(meta.accessed().unwrap(), info().accessed_system_time());
        assert_eq!(std::fs::read(&path).unwrap(), b"abc");
    }

    #[test]
    fn missing_destination_is_a_metadata_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.bin");

        match apply_metadata(&path, &info()) {
            Err(RawCopyError::MetadataWriteError { path: reported, .. }) => {
                assert_eq!(reported, path)
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!path.exists());
    }
}
