// Copyright (c) 2022, Matteo Bernacchia <dev@kikijiki.com>. All rights reserved.
// This project is dual licensed under the Apache License 2.0 and the MIT license.
// See the LICENSE files in the project root for details.

use std::path::PathBuf;

use clap::Parser;
use tracing::Level;

use ntfs_rawcopy::{
    config::Config,
    errors::RawCopyResult,
    paged_reader::{DEFAULT_CACHE_PAGES, DEFAULT_PAGE_SIZE},
};

const EXAMPLES: &str = r#"
EXAMPLES:
  Copy the SAM hive of the running system (elevated prompt):
    ntfs-rawcopy -i C:\Windows\System32\config\SAM -o D:\dump\SAM

  Extract the Zone.Identifier stream of a download:
    ntfs-rawcopy -i C:\Users\me\Downloads\setup.exe -s Zone.Identifier -o zone.txt

  Work on a partition image instead of a live volume:
    ntfs-rawcopy --image disk.img --boot-offset 1048576 -i C:/Windows/notepad.exe -o notepad.exe
"#;

#[derive(Parser, Debug)]
#[command(name = "ntfs-rawcopy")]
#[command(version)]
#[command(about = "Copy locked files by reading the NTFS volume below the filesystem")]
#[command(after_help = EXAMPLES)]
pub struct Cli {
    /// File to copy, as a drive letter followed by the path, e.g. C:\pagefile.sys
    #[arg(short = 'i', long = "in", value_name = "PATH")]
    pub input: String,

    /// Destination file
    #[arg(short, long = "out", value_name = "PATH")]
    pub output: PathBuf,

    /// Copy this named alternate data stream instead of the file content
    #[arg(short, long, value_name = "NAME")]
    pub stream: Option<String>,

    /// Read the volume from an image file instead of the raw device
    #[arg(long, value_name = "FILE")]
    pub image: Option<PathBuf>,

    /// Byte offset of the NTFS boot sector inside the image
    #[arg(long, value_name = "BYTES", default_value_t = 0)]
    pub boot_offset: u64,

    /// Size of one cached device page, a power of two
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_PAGE_SIZE)]
    pub page_size: u64,

    /// Number of pages kept in the read cache
    #[arg(long, value_name = "N", default_value_t = DEFAULT_CACHE_PAGES)]
    pub cache_pages: usize,

    /// More output; repeat for even more
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn log_level(&self) -> Level {
        match self.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }

    pub fn into_config(self) -> RawCopyResult<Config> {
        let mut config = Config::new(&self.input, self.output)?;
        config.stream = self.stream.filter(|s| !s.is_empty());
        config.image = self.image;
        config.boot_offset = self.boot_offset;
        config.page_size = self.page_size;
        config.cache_pages = self.cache_pages;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_command_line() {
        let cli = Cli::try_parse_from([
            "ntfs-rawcopy",
            "-i",
            "C:\\Users\\me\\file.txt",
            "-o",
            "out.txt",
            "-s",
            "Zone.Identifier",
            "--image",
            "disk.img",
            "--boot-offset",
            "1048576",
            "--page-size",
            "8192",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.log_level(), Level::TRACE);

        let config = cli.into_config().unwrap();
        assert_eq!(config.target.segments, ["Users", "me", "file.txt"]);
        assert_eq!(config.stream.as_deref(), Some("Zone.Identifier"));
        assert_eq!(config.image, Some(PathBuf::from("disk.img")));
        assert_eq!(config.boot_offset, 1_048_576);
        assert_eq!(config.page_size, 8192);
        assert_eq!(config.cache_pages, DEFAULT_CACHE_PAGES);
    }

    #[test]
    fn input_and_output_are_required() {
        assert!(Cli::try_parse_from(["ntfs-rawcopy", "-i", "C:\\a"]).is_err());
        assert!(Cli::try_parse_from(["ntfs-rawcopy", "-o", "out"]).is_err());
    }

    #[test]
    fn bad_volume_is_rejected_before_any_io() {
        let cli = Cli::try_parse_from(["ntfs-rawcopy", "-i", "CC:\\a", "-o", "out"]).unwrap();
        assert!(cli.into_config().is_err());
    }
}
