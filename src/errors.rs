// Copyright (c) 2022, Matteo Bernacchia <dev@kikijiki.com>. All rights reserved.
// This project is dual licensed under the Apache License 2.0 and the MIT license.
// See the LICENSE files in the project root for details.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RawCopyError {
    #[error("invalid input {input:?}: {reason}")]
    InvalidInput { input: String, reason: &'static str },
    #[error("raw device {device} is not accessible")]
    DeviceInaccessible {
        device: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} not found on the volume")]
    NotFound { path: String },
    #[error("file record {record} has no standard information")]
    MissingMetadata { record: u64 },
    #[error("file record {record} has no data stream {stream:?}")]
    StreamNotFound { record: u64, stream: String },
    #[error("io error")]
    IOError(#[from] std::io::Error),
    #[error("failed to apply timestamps to {path} (copied content is intact)")]
    MetadataWriteError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("binread error")]
    BinReadError(#[from] binread::error::Error),
    #[error("invalid boot sector: {details}")]
    InvalidBootSector { details: &'static str },
    #[error("invalid file record {record}: {details}")]
    InvalidRecord { record: u64, details: &'static str },
    #[error("invalid data run: {details}")]
    InvalidDataRun { details: &'static str },
    #[error("invalid directory index in record {record}: {details}")]
    InvalidIndex { record: u64, details: &'static str },
    #[error("unsupported attribute in record {record}: {details}")]
    UnsupportedAttribute { record: u64, details: &'static str },
}

pub type RawCopyResult<T> = core::result::Result<T, RawCopyError>;
