// Copyright (c) 2022, Matteo Bernacchia <dev@kikijiki.com>. All rights reserved.
// This project is dual licensed under the Apache License 2.0 and the MIT license.
// See the LICENSE files in the project root for details.

pub mod api;
pub mod attribute;
pub mod config;
pub mod copier;
pub mod errors;
pub mod extract;
pub mod file;
pub mod file_info;
pub mod index;
pub mod metadata;
pub mod mft;
pub mod paged_reader;
pub mod raw_volume;
pub mod stream;
#[doc(hidden)]
pub mod test_utils;
pub mod volume;
