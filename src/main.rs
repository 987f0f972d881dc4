use std::fs;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod database;
mod error;
mod http;
mod record;
mod service;
mod storage;

/// Daemon that stores environmental sensor readings and serves them over a JSON http api.
#[derive(Debug, Parser)]
#[command(name = "sensord", version)]
struct Cli {
    /// Path to the daemon configuration.
    #[arg(short, long, default_value = "resources/sensord.yml")]
    config: PathBuf,

    /// Path to the log4rs configuration.
    #[arg(short, long, default_value = "resources/log.yml")]
    log_config: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct Configuration {
    http_connection_parameters: http::HttpParameters,
    #[serde(default)]
    database_connection_parameters: Option<database::DatabaseParameters>,
}

#[derive(Error, Debug)]
enum ConfigurationError {
    #[error("Cannot read the configuration from file: \'{0}\'")]
    Read(#[from] std::io::Error),

    #[error("Cannot deserialize the configuration: \'{0}\'")]
    Deserialize(#[from] serde_yaml::Error),
}

impl Configuration {
    fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let configuration_string = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str::<Configuration>(configuration_string.as_str())?)
    }
}

fn main() {
    let cli = Cli::parse();

    match log4rs::init_file(&cli.log_config, Default::default()) {
        Ok(_) => {},
        Err(err) => {
            eprintln!("Could not create logger from yaml configuration: {}", err);
            exit(-100);
        }
    };

    let configuration = match Configuration::load(&cli.config) {
        Ok(configuration) => configuration,
        Err(err) => {
            log::error!(target: "sensord", "{}", err);
            exit(101);
        }
    };

    if configuration.http_connection_parameters.signing_secret.is_some() {
        log::warn!(target: "sensord", "A signing secret is configured but requests are not authenticated!");
    }

    let (tx, rx): (Sender<database::DatabaseRequest>, Receiver<database::DatabaseRequest>) = mpsc::channel();

    let terminate_programm = Arc::new(AtomicBool::new(false));
    let terminate_main_thread = Arc::clone(&terminate_programm);
    let terminate_http_thread = Arc::clone(&terminate_programm);
    let terminate_database_thread = Arc::clone(&terminate_programm);

    match ctrlc::set_handler(move || {
        log::info!(target: "sensord", "Termination signal received!");
        terminate_main_thread.store(true, Ordering::SeqCst);
    }) {
        Ok(_) => {},
        Err(err) => {
            log::error!(target: "sensord", "Could not set the termination handler: \'{}\'", err);
            exit(102);
        }
    };

    let database_configuration = configuration.database_connection_parameters.clone();
    let database_thread = match thread::Builder::new()
        .name("database".to_string())
        .spawn(move || {
            database::database_thread(rx, terminate_database_thread, database_configuration);
        }) {
        Ok(database_handle) => database_handle,
        Err(err) => {
            log::error!(target: "sensord", "Cannot start the database thread: \'{}\'", err);
            exit(202);
        }
    };

    let http_configuration = configuration.http_connection_parameters.clone();
    let database_handle = database::DatabaseHandle::new(tx);
    let http_thread = match thread::Builder::new()
        .name("http".to_string())
        .spawn(move || {
            http::http_thread(database_handle, terminate_http_thread, http_configuration);
        }) {
        Ok(http_handle) => http_handle,
        Err(err) => {
            log::error!(target: "sensord", "Cannot start the http thread: \'{}\'", err);
            terminate_programm.store(true, Ordering::SeqCst);
            exit(201);
        }
    };

    match http_thread.join() {
        Ok(_) => log::debug!(target: "sensord", "Joined http thread!"),
        Err(_) => {
            log::error!(target: "sensord", "Could not join the http thread!");
            exit(301);
        }
    };
    match database_thread.join() {
        Ok(_) => log::debug!(target: "sensord", "Joined database thread!"),
        Err(_) => {
            log::error!(target: "sensord", "Could not join the database thread!");
            exit(302);
        }
    };

    log::info!(target: "sensord", "Exiting");
    exit(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shipped_configuration_parses() {
        let configuration: Configuration =
            serde_yaml::from_str(include_str!("../resources/sensord.yml")).unwrap();

        assert_eq!(configuration.http_connection_parameters.port, 5000);
        let database = configuration.database_connection_parameters.expect("database section");
        assert_eq!(database.port, 5432);
        assert!(!database.tls_enable);
    }

    #[test]
    fn database_section_is_optional() {
        let configuration: Configuration = serde_yaml::from_str(
            "http_connection_parameters:\n  address: 0.0.0.0\n  port: 8080\n",
        )
        .unwrap();

        assert!(configuration.database_connection_parameters.is_none());
        assert!(configuration.http_connection_parameters.signing_secret.is_none());
        assert_eq!(configuration.http_connection_parameters.address, "0.0.0.0");
    }

    #[test]
    fn tls_parameters_are_read() {
        let configuration: Configuration = serde_yaml::from_str(
            r#"
http_connection_parameters:
  address: 127.0.0.1
  port: 5000
  signing_secret: change-me
database_connection_parameters:
  hostname: db
  port: 5432
  username: sensord
  password: sensord
  database: sensord
  tls_enable: true
  tls_params:
    server_ca_path: /etc/sensord/ca.pem
    client_cert_path: /etc/sensord/client.pem
    client_key_path: /etc/sensord/client.key
"#,
        )
        .unwrap();

        let tls = configuration.database_connection_parameters.unwrap().tls_params.unwrap();
        assert_eq!(tls.client_key_path, "/etc/sensord/client.key");
        assert_eq!(configuration.http_connection_parameters.signing_secret.as_deref(), Some("change-me"));
    }

    #[test]
    fn missing_configuration_file_is_a_read_error() {
        let err = Configuration::load(Path::new("does/not/exist.yml")).unwrap_err();
        assert!(matches!(err, ConfigurationError::Read(_)));
    }

    #[test]
    fn cli_defaults_point_to_resources() {
        let cli = Cli::parse_from(["sensord"]);
        assert_eq!(cli.config, PathBuf::from("resources/sensord.yml"));
        assert_eq!(cli.log_config, PathBuf::from("resources/log.yml"));
    }
}
