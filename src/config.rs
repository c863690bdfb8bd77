// Copyright (c) 2022, Matteo Bernacchia <dev@kikijiki.com>. All rights reserved.
// This project is dual licensed under the Apache License 2.0 and the MIT license.
// See the LICENSE files in the project root for details.

use std::fmt;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;

use crate::errors::{RawCopyError, RawCopyResult};
use crate::paged_reader::{DEFAULT_CACHE_PAGES, DEFAULT_PAGE_SIZE};

static DRIVE_LETTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z]:$").expect("drive letter pattern"));

/// A drive letter with its colon, e.g. `C:`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeId(String);

impl VolumeId {
    pub fn parse(input: &str) -> RawCopyResult<Self> {
        if !DRIVE_LETTER.is_match(input) {
            return Err(RawCopyError::InvalidInput {
                input: input.to_string(),
                reason: "volume must be a single drive letter followed by a colon",
            });
        }
        Ok(VolumeId(input.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Device namespace path that bypasses the filesystem, e.g. `\\.\C:`.
    pub fn device_path(&self) -> String {
        format!("\\\\.\\{}", self.0)
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Input path split into the volume and the path components inside it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetPath {
    pub volume: VolumeId,
    pub segments: Vec<String>,
}

impl TargetPath {
    /// Splits `C:\dir\file`. Forward slashes are accepted as well so the tool
    /// can be driven from Unix shells against volume images.
    pub fn parse(input: &str) -> RawCopyResult<Self> {
        let mut parts = input.split(['\\', '/']);
        let volume = VolumeId::parse(parts.next().unwrap_or_default())?;
        let segments: Vec<String> = parts
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        if segments.is_empty() {
            return Err(RawCopyError::InvalidInput {
                input: input.to_string(),
                reason: "no file path inside the volume",
            });
        }

        Ok(TargetPath { volume, segments })
    }

    /// Path inside the volume with `/` separators, as the resolver expects.
    pub fn relative_path(&self) -> String {
        self.segments.join("/")
    }
}

impl fmt::Display for TargetPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.volume, self.relative_path())
    }
}

/// Everything one extraction needs, built once at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub target: TargetPath,
    pub output: PathBuf,
    /// Named alternate data stream; `None` copies the default stream.
    pub stream: Option<String>,
    /// Read the volume from an image file instead of the raw device.
    pub image: Option<PathBuf>,
    /// Byte offset of the NTFS boot sector, for images of whole disks.
    pub boot_offset: u64,
    pub page_size: u64,
    pub cache_pages: usize,
}

impl Config {
    pub fn new<P: Into<PathBuf>>(input: &str, output: P) -> RawCopyResult<Self> {
        Ok(Config {
            target: TargetPath::parse(input)?,
            output: output.into(),
            stream: None,
            image: None,
            boot_offset: 0,
            page_size: DEFAULT_PAGE_SIZE,
            cache_pages: DEFAULT_CACHE_PAGES,
        })
    }
}
