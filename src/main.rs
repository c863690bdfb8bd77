// Copyright (c) 2022, Matteo Bernacchia <dev@kikijiki.com>. All rights reserved.
// This project is dual licensed under the Apache License 2.0 and the MIT license.
// See the LICENSE files in the project root for details.

mod cli;

use std::error::Error;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::FmtSubscriber;

use ntfs_rawcopy::extract::retrieve_file;

use crate::cli::Cli;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(cli.log_level())
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    info!("ntfs-rawcopy {}", env!("CARGO_PKG_VERSION"));

    let result = cli.into_config().and_then(|config| retrieve_file(&config));
    match result {
        Ok(written) => {
            info!("{} bytes copied", written);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            let mut source = e.source();
            while let Some(cause) = source {
                error!("  caused by: {}", cause);
                source = cause.source();
            }
            ExitCode::FAILURE
        }
    }
}
