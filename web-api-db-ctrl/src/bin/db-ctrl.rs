// Copyright 2023 Xayn AG
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Operator CLI for the multi-tenant database.
//!
//! Exit codes: 0 = ok, 1 = critical failure, 2 = invalid input.

use std::{fs, path::PathBuf, process::ExitCode};

use clap::Parser;
use campus_web_api_db_ctrl::{Operation, Provisioner};
use campus_web_api_shared::postgres::Config as PgConfig;
use tracing_subscriber::filter::LevelFilter;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Run management/public catalog setup and re-provision all tenants first.
    #[arg(long)]
    initialize: bool,

    /// JSON file with a list of operations to run.
    ///
    /// Instead of a path, "inline:" followed by the JSON content can be
    /// passed in.
    #[arg(short, long)]
    ops: Option<String>,

    /// Postgres config as a TOML file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_ansi(false)
        .with_max_level(LevelFilter::INFO)
        .init();

    let args = Args::parse();

    let ops: Vec<Operation> = match &args.ops {
        None => Vec::new(),
        Some(ops) => {
            let content = if let Some(inline) = ops.strip_prefix("inline:") {
                inline.to_owned()
            } else {
                match fs::read_to_string(ops) {
                    Ok(content) => content,
                    Err(error) => {
                        eprintln!("Error: reading ops file failed: {error}");
                        return ExitCode::from(2);
                    }
                }
            };
            match serde_json::from_str(&content) {
                Ok(ops) => ops,
                Err(error) => {
                    eprintln!("Error: parsing ops failed: {error}");
                    return ExitCode::from(2);
                }
            }
        }
    };

    let config = match &args.config {
        None => PgConfig::default(),
        Some(path) => {
            let content = match fs::read_to_string(path) {
                Ok(content) => content,
                Err(error) => {
                    eprintln!("Error: reading config failed: {error}");
                    return ExitCode::from(2);
                }
            };
            match toml::from_str(&content) {
                Ok(config) => config,
                Err(error) => {
                    eprintln!("Error: parsing config failed: {error}");
                    return ExitCode::from(2);
                }
            }
        }
    };

    let provisioner = match Provisioner::new(config).await {
        Ok(provisioner) => provisioner,
        Err(error) => {
            eprintln!("Error: connecting to postgres failed: {error}");
            return ExitCode::from(1);
        }
    };

    match provisioner.run_operations(args.initialize, ops).await {
        Ok(results) => {
            let any_error = results.iter().any(|result| result.is_error());
            match serde_json::to_string_pretty(&results) {
                Ok(rendered) => println!("{rendered}"),
                Err(error) => {
                    eprintln!("Error: rendering results failed: {error}");
                    return ExitCode::from(1);
                }
            }
            if any_error {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(error) => {
            eprintln!("Error: {error}");
            ExitCode::from(1)
        }
    }
}
