//! Module for connecting to a postgres database and serving the requests of the http handlers
//! from a dedicated database thread.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time;

use chrono::{FixedOffset, NaiveDate, NaiveDateTime, TimeZone};
use openssl::ssl::{SslConnector, SslFiletype, SslMethod, SslVerifyMode};
use postgres::{Client, Row};
use postgres_openssl::MakeTlsConnector;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::{ApiError, StoreError};
use crate::record::{Measurements, NewReading, ReadingPatch, SensorReading};
use crate::service;
use crate::storage::{MemoryStore, ReadingStore};

static SQL_CREATE_TABLE: &str = include_str!("sql/create_table.sql");

static SQL_INSERT_READING: &str = include_str!("sql/insert_reading.sql");
static SQL_SELECT_READINGS: &str = include_str!("sql/select_readings.sql");
static SQL_SELECT_READINGS_ON: &str = include_str!("sql/select_readings_on.sql");
static SQL_UPDATE_READING: &str = include_str!("sql/update_reading.sql");
static SQL_DELETE_READINGS: &str = include_str!("sql/delete_readings.sql");

#[derive(Serialize, Deserialize, Debug, Clone)]
/// Struct modeling the parameters required for a database connection.
///
/// This includes SSL/TLS encryption.
pub struct DatabaseParameters
{
    /// The hostname of the database server.
    pub hostname: String,
    /// The port for the database server.
    pub port: u16,
    /// The username to connect as.
    pub username: String,
    /// The password to connect with.
    pub password: String,
    /// The database to open on the server.
    pub database: String,
    /// Flag to enable tls for the database server connection.
    pub tls_enable: bool,
    /// Parameters for the tls connection to the database server.
    pub tls_params: Option<DatabaseTlsParameters>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
/// Struct for the parameters required for a tls connection to the database.
pub struct DatabaseTlsParameters {
    /// The path to the server certificate for TLS encryption.
    pub server_ca_path: String,
    /// The path to the client certificate for TLS encryption.
    pub client_cert_path: String,
    /// The path to the client key for TLS encryption.
    pub client_key_path: String,
}

impl DatabaseParameters {
    fn connection_string(&self) -> String {
        format!("user={} password={} host={} port={} dbname={} application_name=sensord",
                self.username,
                self.password,
                self.hostname,
                self.port,
                self.database)
    }
}

/// Readings stored in a postgres table.
pub struct PostgresStore {
    client: Client,
}

impl PostgresStore {
    /// Opens the connection and creates the readings table if it does not exist yet.
    ///
    /// # Errors
    ///
    /// * TLS is enabled but no TLS parameters are given, or the certificate files cannot be loaded.
    ///
    /// * The connection cannot be established or the user is not authorized for the database.
    pub fn connect(connection_parameters: &DatabaseParameters) -> Result<Self, StoreError> {
        let connection_string = connection_parameters.connection_string();

        let client = if connection_parameters.tls_enable {
            let tls_params = connection_parameters
                .tls_params
                .as_ref()
                .ok_or(StoreError::MissingTlsParameters)?;

            let mut ssl_connection_builder = SslConnector::builder(SslMethod::tls())?;
            ssl_connection_builder.set_verify(SslVerifyMode::PEER);
            ssl_connection_builder.set_ca_file(&tls_params.server_ca_path)?;
            ssl_connection_builder.set_certificate_file(&tls_params.client_cert_path, SslFiletype::PEM)?;
            ssl_connection_builder.set_private_key_file(&tls_params.client_key_path, SslFiletype::PEM)?;

            let tls_connector = MakeTlsConnector::new(ssl_connection_builder.build());
            Client::connect(connection_string.as_str(), tls_connector)?
        } else {
            Client::connect(connection_string.as_str(), postgres::NoTls)?
        };

        PostgresStore::with_client(client)
    }

    /// Wraps an open connection, creating the readings table if it does not exist yet.
    pub fn with_client(mut client: Client) -> Result<Self, StoreError> {
        client.batch_execute(SQL_CREATE_TABLE)?;

        Ok(PostgresStore { client })
    }
}

fn reading_from_row(row: &Row) -> Result<SensorReading, StoreError> {
    let observed_at: NaiveDateTime = row.try_get("observed_at")?;
    let utc_offset: i32 = row.try_get("utc_offset")?;

    let timestamp = FixedOffset::east_opt(utc_offset)
        .and_then(|offset| offset.from_local_datetime(&observed_at).single())
        .ok_or_else(|| StoreError::Backend(format!("Stored UTC offset \'{}\' is out of range", utc_offset)))?;

    Ok(SensorReading {
        id: row.try_get("id")?,
        timestamp,
        coordinates: row.try_get("coordinates")?,
        measurements: Measurements {
            temperature_water: row.try_get("temperature_water")?,
            temperature_air: row.try_get("temperature_air")?,
            humidity: row.try_get("humidity")?,
            wind_speed: row.try_get("wind_speed")?,
            wind_direction: row.try_get("wind_direction")?,
            precipitation: row.try_get("precipitation")?,
            haze: row.try_get("haze")?,
            becquerel: row.try_get("becquerel")?,
        },
    })
}

impl ReadingStore for PostgresStore {
    fn begin(&mut self) -> Result<(), StoreError> {
        Ok(self.client.batch_execute("BEGIN")?)
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        Ok(self.client.batch_execute("COMMIT")?)
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        Ok(self.client.batch_execute("ROLLBACK")?)
    }

    fn insert(&mut self, reading: &NewReading) -> Result<i32, StoreError> {
        let m = &reading.measurements;
        let observed_at = reading.timestamp.naive_local();
        let utc_offset = reading.timestamp.offset().local_minus_utc();

        let row = self.client.query_one(SQL_INSERT_READING,
                                        &[&observed_at, &utc_offset, &reading.coordinates,
                                          &m.temperature_water, &m.temperature_air, &m.humidity,
                                          &m.wind_speed, &m.wind_direction, &m.precipitation,
                                          &m.haze, &m.becquerel])?;
        Ok(row.try_get("id")?)
    }

    fn select_all(&mut self) -> Result<Vec<SensorReading>, StoreError> {
        self.client
            .query(SQL_SELECT_READINGS, &[])?
            .iter()
            .map(reading_from_row)
            .collect()
    }

    fn select_on(&mut self, date: NaiveDate) -> Result<Vec<SensorReading>, StoreError> {
        self.client
            .query(SQL_SELECT_READINGS_ON, &[&date])?
            .iter()
            .map(reading_from_row)
            .collect()
    }

    fn replace(&mut self, reading: &SensorReading) -> Result<(), StoreError> {
        let m = &reading.measurements;

        let updated = self.client.execute(SQL_UPDATE_READING,
                                          &[&reading.id, &reading.coordinates,
                                            &m.temperature_water, &m.temperature_air, &m.humidity,
                                            &m.wind_speed, &m.wind_direction, &m.precipitation,
                                            &m.haze, &m.becquerel])?;
        if updated != 1 {
            log::warn!(target: "sensord::db", "Update of reading \'{}\' touched \'{}\' rows", reading.id, updated);
            return Err(StoreError::Backend(format!("Reading \'{}\' does not exist", reading.id)));
        }
        Ok(())
    }

    fn delete(&mut self, ids: &[i32]) -> Result<u64, StoreError> {
        Ok(self.client.execute(SQL_DELETE_READINGS, &[&ids])?)
    }
}

/// Channel half the database thread answers on.
pub type Reply<T> = oneshot::Sender<Result<T, ApiError>>;

/// A single operation handed to the database thread.
pub enum DatabaseRequest {
    Create { reading: NewReading, reply: Reply<NaiveDate> },
    List { reply: Reply<Vec<SensorReading>> },
    FindByDate { date: NaiveDate, reply: Reply<Vec<SensorReading>> },
    UpdateByDate { date: NaiveDate, patch: ReadingPatch, reply: Reply<NaiveDate> },
    DeleteByDate { date: NaiveDate, reply: Reply<u64> },
}

impl DatabaseRequest {
    fn handle(self, store: &mut dyn ReadingStore) {
        let delivered = match self {
            DatabaseRequest::Create { reading, reply } => {
                reply.send(service::create(store, reading)).is_ok()
            }
            DatabaseRequest::List { reply } => reply.send(service::list(store)).is_ok(),
            DatabaseRequest::FindByDate { date, reply } => {
                reply.send(service::find_by_date(store, date)).is_ok()
            }
            DatabaseRequest::UpdateByDate { date, patch, reply } => {
                reply.send(service::update_by_date(store, date, patch)).is_ok()
            }
            DatabaseRequest::DeleteByDate { date, reply } => {
                reply.send(service::delete_by_date(store, date)).is_ok()
            }
        };

        if !delivered {
            log::warn!(target: "sensord::db", "Request was abandoned before its result could be delivered!");
        }
    }
}

#[derive(Clone)]
/// Cloneable handle used by the http handlers to talk to the database thread.
pub struct DatabaseHandle {
    tx: Sender<DatabaseRequest>,
}

impl DatabaseHandle {
    pub fn new(tx: Sender<DatabaseRequest>) -> Self {
        DatabaseHandle { tx }
    }

    pub async fn create(&self, reading: NewReading) -> Result<NaiveDate, ApiError> {
        self.call(|reply| DatabaseRequest::Create { reading, reply }).await
    }

    pub async fn list(&self) -> Result<Vec<SensorReading>, ApiError> {
        self.call(|reply| DatabaseRequest::List { reply }).await
    }

    pub async fn find_by_date(&self, date: NaiveDate) -> Result<Vec<SensorReading>, ApiError> {
        self.call(|reply| DatabaseRequest::FindByDate { date, reply }).await
    }

    pub async fn update_by_date(&self, date: NaiveDate, patch: ReadingPatch) -> Result<NaiveDate, ApiError> {
        self.call(|reply| DatabaseRequest::UpdateByDate { date, patch, reply }).await
    }

    pub async fn delete_by_date(&self, date: NaiveDate) -> Result<u64, ApiError> {
        self.call(|reply| DatabaseRequest::DeleteByDate { date, reply }).await
    }

    async fn call<T>(&self, request: impl FnOnce(Reply<T>) -> DatabaseRequest) -> Result<T, ApiError> {
        let (reply, response) = oneshot::channel();

        self.tx.send(request(reply)).map_err(|_| StoreError::Disconnected)?;
        response.await.map_err(|_| StoreError::Disconnected)?
    }
}

/// Answers requests from `rx` until `thread_finish` is set or every sender is gone.
pub fn serve_requests(rx: &Receiver<DatabaseRequest>, thread_finish: &AtomicBool, store: &mut dyn ReadingStore) {
    let timeout = time::Duration::from_millis(100);

    while !thread_finish.load(Ordering::SeqCst) {
        let request = match rx.recv_timeout(timeout) {
            Ok(request) => request,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                log::debug!(target: "sensord::db", "All request senders are gone!");
                break;
            }
        };

        request.handle(store);
    }
}

/// Thread function for the database connection.
///
/// This thread opens the configured store and applies every request received on the channel to it.
/// Without connection parameters the readings are only kept in memory.
///
/// This function will run until the `thread_finish` parameter was set or the channel is closed.
///
/// # Arguments
///
/// * `rx` - The channel to receive the requests from.
///
/// * `thread_finish` - Indicates that the thread should finish operation and should return.
///
/// * `connection_parameters` - Parameters for the database connection.
///
/// # Errors
///
/// If the database connection cannot be established the error is logged, `thread_finish` is set and
/// the function returns.
pub fn database_thread(rx: Receiver<DatabaseRequest>, thread_finish: Arc<AtomicBool>, connection_parameters: Option<DatabaseParameters>)
{
    let mut store: Box<dyn ReadingStore> = match connection_parameters {
        Some(connection_parameters) => match PostgresStore::connect(&connection_parameters) {
            Ok(store) => {
                log::info!(target: "sensord::db", "Database connection established!");
                Box::new(store)
            }
            Err(err) => {
                log::error!(target: "sensord::db", "Could not establish database connection: \'{}\'", err);
                thread_finish.store(true, Ordering::SeqCst);
                return;
            }
        },
        None => {
            log::warn!(target: "sensord::db", "No database configured, readings are kept in memory only!");
            Box::new(MemoryStore::new())
        }
    };

    serve_requests(&rx, &thread_finish, store.as_mut());
    log::info!(target: "sensord::db", "Database thread finished!");
}
