//! The operations of the sensor reading store.
//!
//! Every write runs inside one transaction. When a step fails the transaction is rolled back
//! explicitly before the error is handed back to the caller.
use chrono::NaiveDate;

use crate::error::ApiError;
use crate::record::{NewReading, ReadingPatch, SensorReading};
use crate::storage::ReadingStore;

/// Stores a new reading and returns its calendar date.
pub fn create(store: &mut dyn ReadingStore, reading: NewReading) -> Result<NaiveDate, ApiError> {
    in_transaction(store, |store| {
        let id = store.insert(&reading)?;
        log::debug!(target: "sensord::db", "Inserted reading with id \'{}\'", id);
        Ok(reading.timestamp.date_naive())
    })
}

pub fn list(store: &mut dyn ReadingStore) -> Result<Vec<SensorReading>, ApiError> {
    Ok(store.select_all()?)
}

/// All readings on `date`. An empty result is reported as [`ApiError::NotFound`].
pub fn find_by_date(store: &mut dyn ReadingStore, date: NaiveDate) -> Result<Vec<SensorReading>, ApiError> {
    let readings = store.select_on(date)?;

    if readings.is_empty() {
        return Err(ApiError::NotFound(String::from("No data found for the specified date")));
    }

    Ok(readings)
}

/// Applies `patch` to the first reading on `date` (lowest id). Other readings on the same date
/// are left alone.
pub fn update_by_date(
    store: &mut dyn ReadingStore,
    date: NaiveDate,
    patch: ReadingPatch,
) -> Result<NaiveDate, ApiError> {
    in_transaction(store, |store| {
        let mut reading = store
            .select_on(date)?
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::NotFound(String::from("Sensor data not found.")))?;

        patch.apply_to(&mut reading);
        store.replace(&reading)?;

        log::debug!(target: "sensord::db", "Updated reading with id \'{}\'", reading.id);
        Ok(reading.date())
    })
}

/// Removes every reading on `date` and returns how many were removed. Either all of them are
/// removed or none.
pub fn delete_by_date(store: &mut dyn ReadingStore, date: NaiveDate) -> Result<u64, ApiError> {
    in_transaction(store, |store| {
        let ids: Vec<i32> = store.select_on(date)?.iter().map(|r| r.id).collect();

        if ids.is_empty() {
            return Err(ApiError::NotFound(String::from(
                "No data found for the specified date to delete",
            )));
        }

        let deleted = store.delete(&ids)?;
        log::debug!(target: "sensord::db", "Deleted \'{}\' readings on \'{}\'", deleted, date);
        Ok(deleted)
    })
}

/// Runs `body` between `begin` and `commit`. Any error, including a failed commit, is followed by
/// an explicit rollback.
fn in_transaction<T>(
    store: &mut dyn ReadingStore,
    body: impl FnOnce(&mut dyn ReadingStore) -> Result<T, ApiError>,
) -> Result<T, ApiError> {
    store.begin()?;

    let result = body(&mut *store).and_then(|value| {
        store.commit()?;
        Ok(value)
    });

    if let Err(err) = &result {
        log::warn!(target: "sensord::db", "Rolling back transaction: \'{}\'", err);
        if let Err(rollback_err) = store.rollback() {
            log::error!(target: "sensord::db", "Could not roll back transaction: \'{}\'", rollback_err);
        }
    }

    result
}
