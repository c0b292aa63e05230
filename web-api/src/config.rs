// Copyright 2022 Xayn AG
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

mod cli;

use std::{ffi::OsString, fmt::Display, path::Path, process::exit};

use anyhow::bail;
use clap::{CommandFactory, Parser};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use self::cli::Args;
use crate::{
    auth,
    logging,
    middleware::rate_limit,
    net,
    rbac,
    storage,
    tenants,
    SetupError,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
    Test,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct PilotConfig {
    pub enabled: bool,
    /// Active schools allowed while piloting.
    pub max_schools: u32,
    /// Upper bound on rows per bulk import.
    pub max_import_rows: u32,
}

impl Default for PilotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_schools: 10,
            max_import_rows: 5000,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
#[cfg_attr(test, serde(deny_unknown_fields))]
pub struct Config {
    pub(crate) environment: Environment,
    pub(crate) logging: logging::Config,
    pub(crate) net: net::Config,
    pub(crate) storage: storage::Config,
    pub(crate) tenants: tenants::Config,
    pub(crate) auth: auth::Config,
    pub(crate) rbac: rbac::Config,
    pub(crate) queue: campus_job_queue::Config,
    pub(crate) pilot: PilotConfig,
    pub(crate) rate_limit: rate_limit::Config,
}

impl Config {
    /// Loads the config.
    ///
    /// # Panic/Program Exit
    ///
    /// In case of `--help`, `--print-config` and failure
    /// this functions will not return normally but terminate
    /// the program normally instead.
    pub fn load(application_names: impl IntoIterator<Item = impl Display>) -> UnvalidatedConfig {
        load_with_parsed_args(application_names, Args::parse())
    }

    /// Loads the config with custom CLI args.
    ///
    /// See [`Config::load()`].
    pub fn load_with_args(
        application_names: impl IntoIterator<Item = impl Display>,
        args: impl IntoIterator<Item = impl Into<OsString> + Clone>,
    ) -> UnvalidatedConfig {
        load_with_parsed_args(application_names, Args::parse_from(args))
    }
}

pub struct UnvalidatedConfig {
    config: Config,
    print_config: bool,
}

impl UnvalidatedConfig {
    pub fn logging_config(&self) -> &logging::Config {
        &self.config.logging
    }

    /// Finalizes the config doing any post deserialization validation
    /// steps.
    ///
    /// If the `--print-config` CLI arg was used a JSON serialization of the config
    /// will be printed to stdout. If additionally `exit_on_print` was set the program
    /// will exit with a success status code after printing.
    pub fn finalize(self, exit_on_print: bool) -> Result<Config, SetupError> {
        let Self {
            mut config,
            print_config,
        } = self;

        validate(&mut config)?;

        if print_config {
            println!("{}", serde_json::to_string_pretty(&config)?);
            if exit_on_print {
                exit(0)
            }
        }
        Ok(config)
    }
}

fn validate(config: &mut Config) -> Result<(), SetupError> {
    if config.environment == Environment::Production {
        if config.net.cors_origins.iter().any(|origin| origin == "*") {
            bail!("wildcard CORS origin is not allowed in production");
        }
        if config.tenants.allow_schema_header {
            bail!("the x-schema-name header must not be honored in production");
        }
    }

    // pilot mode tightens the screws
    if config.pilot.enabled {
        config.rbac.strict_log = true;
        if config.pilot.max_schools == 0 {
            bail!("pilot mode requires max_schools > 0");
        }
    }

    Ok(())
}

fn load_with_parsed_args(
    application_names: impl IntoIterator<Item = impl Display>,
    mut cli_args: Args,
) -> UnvalidatedConfig {
    let config = cli_args.config.take();
    let config = match load_config(
        application_names,
        config.as_deref(),
        cli_args.to_config_overrides(),
    ) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {err}");
            cli::Args::command().print_help().ok();
            exit(1);
        }
    };

    UnvalidatedConfig {
        config,
        print_config: cli_args.print_config,
    }
}

/// Load the configuration into given type.
///
/// # Load order/priority
///
/// This will by ascending priority load:
///
/// 1. `./config.toml` or specified toml config file
/// 2. `./.env`
/// 3. `./.env.local`
/// 4. process environment
/// 5. options passed through `update_with`
///
/// Config values loaded from higher priority sources override such from lower
/// priority sources. E.g. values defined in `update_with` override values
/// from any other source.
///
/// `.env` is included to avoid confusion with env variables missing when calling
/// cargo directly instead of indirectly through `just`.
///
/// `.env.local` is a semi-standard way to add temporary local overrides that you
/// don't want to commit.
///
/// # Env and .env
///
/// Environment variables from `.env` and `.env.local` will be loaded into the process
/// environment if they don't already exist there (keeping priority as described above).
///
/// When creating the config type instance, only environment variables which start with
/// one of the names passed in `application_names` will be considered (case insensitive).
///
/// Variables with names earlier in the array take priority over variables with names
/// later in the array.
///
/// Env variable are converted into a config path by splitting it at `__` (and stripping
/// the application name). E.g. `CAMPUS_WEB_API__STORAGE__MAX_POOL_SIZE=12` will be
/// treated like the json `{ "storage": { "max_pool_size": 12 } }` wrt. deserializing
/// the config if `CAMPUS_WEB_API` is in `application_names`.
fn load_config<C, U>(
    application_names: impl IntoIterator<Item = impl Display>,
    config: Option<&str>,
    update_with: U,
) -> Result<C, figment::Error>
where
    C: DeserializeOwned,
    U: Serialize,
{
    // the order must be from highest to lowest priority
    // or else it won't work correctly
    load_dotenv(".env.local")?;
    load_dotenv(".env")?;

    let mut figment = Figment::new().join(Serialized::defaults(update_with));

    for name in application_names {
        figment = figment.join(Env::prefixed(&format!("{name}__")).split("__"));
    }

    let provider = config
        .map(|content_or_path| {
            if let Some(content) = content_or_path.strip_prefix("inline:") {
                Toml::string(content)
            } else {
                Toml::file(content_or_path)
            }
        })
        .or_else(|| {
            let default_file = Path::new("config.toml");
            default_file.exists().then(|| Toml::file(default_file))
        });

    if let Some(provider) = provider {
        figment = figment.join(provider);
    }

    figment.extract().map_err(Into::into)
}

fn load_dotenv(file_name: &str) -> Result<(), figment::Error> {
    match dotenvy::from_filename(file_name) {
        Err(error) if !error.not_found() => {
            Err(figment::Error::from(error.to_string()).with_path(file_name))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> Config {
        load_config::<Config, _>(
            ["CAMPUS_TEST_NOPE"],
            Some(&format!("inline:{toml}")),
            serde_json::json!({}),
        )
        .unwrap()
    }

    #[test]
    fn test_defaults_deserialize() {
        let config = parse("");
        assert_eq!(config.environment, Environment::Development);
        assert!(!config.pilot.enabled);
        assert!(!config.tenants.allow_schema_header);
    }

    #[test]
    fn test_wildcard_cors_rejected_in_production() {
        let mut config = parse(
            r#"
            environment = "production"
            [net]
            cors_origins = ["*"]
            "#,
        );
        assert!(validate(&mut config).is_err());
    }

    #[test]
    fn test_schema_header_rejected_in_production() {
        let mut config = parse(
            r#"
            environment = "production"
            [tenants]
            allow_schema_header = true
            "#,
        );
        assert!(validate(&mut config).is_err());
    }

    #[test]
    fn test_pilot_forces_rbac_shadow_mode() {
        let mut config = parse(
            r#"
            [pilot]
            enabled = true
            "#,
        );
        assert!(!config.rbac.strict_log);
        validate(&mut config).unwrap();
        assert!(config.rbac.strict_log);
    }
}
