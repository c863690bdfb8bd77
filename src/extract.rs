// Copyright (c) 2022, Matteo Bernacchia <dev@kikijiki.com>. All rights reserved.
// This project is dual licensed under the Apache License 2.0 and the MIT license.
// See the LICENSE files in the project root for details.

use std::io::{Read, Seek};

use tracing::info;

use crate::{
    config::Config,
    copier::copy_to_file,
    errors::RawCopyResult,
    metadata::apply_metadata,
    paged_reader::PagedReader,
    raw_volume::{open_raw_volume, open_volume_image},
    volume::VolumeContext,
};

/// Copies the file named by `config` out of its volume and returns the
/// number of bytes written.
///
/// The device handle is owned by this call and closed on every return path.
pub fn retrieve_file(config: &Config) -> RawCopyResult<u64> {
    info!("Target {} -> {}", config.target, config.output.display());

    info!("Open Raw Device Handle.");
    let device = match &config.image {
        Some(image) => open_volume_image(image)?,
        None => open_raw_volume(&config.target.volume)?,
    };

    info!(
        "Create PagedReader with page {}, cache size {}.",
        config.page_size,
        config.page_size * config.cache_pages as u64
    );
    let reader = PagedReader::new(device, config.page_size, config.cache_pages)?;

    info!("Create NTFS context.");
    let mut ctx = VolumeContext::new(reader, config.boot_offset)?;
    let written = retrieve_from_context(&mut ctx, config)?;

    let (hits, misses) = ctx.reader.cache_stats();
    info!("Page cache: {} hits, {} misses", hits, misses);
    Ok(written)
}

/// Runs the extraction against an already opened volume.
pub fn retrieve_from_context<R>(ctx: &mut VolumeContext<R>, config: &Config) -> RawCopyResult<u64>
where
    R: Read + Seek,
{
    info!("Start to find root directory.");
    let root = ctx.root_directory()?;

    info!("Try to find file MFT entry location.");
    let record = ctx.open(&root, &config.target.relative_path())?;

    info!("Metadata checking...");
    let stream_name = config.stream.as_deref();
    let metadata = ctx.standard_information(&record, stream_name)?;
    let full_path = ctx.full_path(&record)?;
    metadata.log(&format!("{}/{}", config.target.volume, full_path));

    info!("Retrieving data stream from attribute.");
    let mut stream = ctx.open_stream(&record, stream_name)?;
    if !stream.name().is_empty() {
        info!("Using alternate data stream {:?}.", stream.name());
    }

    info!("Start copying.");
    let written = copy_to_file(&mut stream, &config.output)?;

    info!("Copy done. Applying original file times.");
    apply_metadata(&config.output, &metadata)?;

    info!("Workload successfully finished.");
    Ok(written)
}
