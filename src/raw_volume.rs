// Copyright (c) 2022, Matteo Bernacchia <dev@kikijiki.com>. All rights reserved.
// This project is dual licensed under the Apache License 2.0 and the MIT license.
// See the LICENSE files in the project root for details.

use std::fs::File;
use std::io;
use std::path::Path;

use tracing::debug;

use crate::{
    config::VolumeId,
    errors::{RawCopyError, RawCopyResult},
};

/// Opens the whole volume behind a drive letter for reading.
///
/// Going through the device namespace reads the volume below the filesystem,
/// so locks other processes hold on files inside it do not apply.
/// The handle is closed when the returned `File` is dropped.
#[cfg(windows)]
pub fn open_raw_volume(volume: &VolumeId) -> RawCopyResult<File> {
    let device = volume.device_path();

    if !is_elevated().unwrap_or(false) {
        return Err(RawCopyError::DeviceInaccessible {
            device,
            source: io::Error::new(
                io::ErrorKind::PermissionDenied,
                "raw volume access requires an elevated process",
            ),
        });
    }

    debug!("Opening {}", device);
    File::open(&device).map_err(|source| RawCopyError::DeviceInaccessible { device, source })
}

#[cfg(not(windows))]
pub fn open_raw_volume(volume: &VolumeId) -> RawCopyResult<File> {
    let device = volume.device_path();
    debug!("Raw volume {} requested on a non-Windows host", device);
    Err(RawCopyError::DeviceInaccessible {
        device,
        source: io::Error::new(
            io::ErrorKind::Unsupported,
            "drive letters can only be opened on Windows, use an image instead",
        ),
    })
}

/// Opens a volume image (raw `dd` style dump of an NTFS partition).
pub fn open_volume_image(path: &Path) -> RawCopyResult<File> {
    debug!("Opening image {}", path.display());
    File::open(path).map_err(|source| RawCopyError::DeviceInaccessible {
        device: path.display().to_string(),
        source,
    })
}

#[cfg(windows)]
fn is_elevated() -> windows::core::Result<bool> {
    use windows::Win32::{
        Foundation::{CloseHandle, HANDLE},
        Security::{GetTokenInformation, TokenElevation, TOKEN_ELEVATION, TOKEN_QUERY},
        System::Threading::{GetCurrentProcess, OpenProcessToken},
    };

    unsafe {
        let mut handle: HANDLE = HANDLE::default();
        OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut handle)?;

        let mut elevation = TOKEN_ELEVATION::default();
        let mut returned_length = 0;

        let result = GetTokenInformation(
            handle,
            TokenElevation,
            Some(&mut elevation as *mut _ as *mut _),
            std::mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut returned_length,
        );
        let _ = CloseHandle(handle);
        result?;

        Ok(elevation.TokenIsElevated != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_image_is_device_inaccessible() {
        let err = open_volume_image(Path::new("/definitely/not/here.img")).unwrap_err();
        assert!(matches!(err, RawCopyError::DeviceInaccessible { .. }));
    }

    #[cfg(not(windows))]
    #[test]
    fn drive_letters_need_windows() {
        let volume = VolumeId::parse("C:").unwrap();
        let err = open_raw_volume(&volume).unwrap_err();
        assert!(matches!(err, RawCopyError::DeviceInaccessible { .. }));
    }

    #[cfg(windows)]
    #[test]
    #[ignore = "needs an elevated process"]
    fn opens_system_volume() {
        let volume = VolumeId::parse(&crate::test_utils::test_volume_letter()).unwrap();
        open_raw_volume(&volume).unwrap();
    }
}
