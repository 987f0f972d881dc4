//! Storage abstraction for sensor readings.
//!
//! Writes are bracketed by explicit [`ReadingStore::begin`], [`ReadingStore::commit`] and
//! [`ReadingStore::rollback`] calls. Nothing is rolled back implicitly, the caller decides.
use chrono::NaiveDate;

use crate::error::StoreError;
use crate::record::{NewReading, SensorReading};

/// Persistence port for sensor readings.
///
/// Queries return readings ordered by id.
pub trait ReadingStore: Send {
    /// Opens a transaction.
    fn begin(&mut self) -> Result<(), StoreError>;

    /// Finalizes the open transaction.
    fn commit(&mut self) -> Result<(), StoreError>;

    /// Reverts every change made since [`ReadingStore::begin`].
    fn rollback(&mut self) -> Result<(), StoreError>;

    /// Stores a new reading and returns its id.
    fn insert(&mut self, reading: &NewReading) -> Result<i32, StoreError>;

    fn select_all(&mut self) -> Result<Vec<SensorReading>, StoreError>;

    /// All readings whose timestamp falls on `date`, ignoring time of day.
    fn select_on(&mut self, date: NaiveDate) -> Result<Vec<SensorReading>, StoreError>;

    /// Replaces every mutable field of the stored reading with the same id.
    fn replace(&mut self, reading: &SensorReading) -> Result<(), StoreError>;

    /// Removes the readings with the given ids and returns how many were removed.
    fn delete(&mut self, ids: &[i32]) -> Result<u64, StoreError>;
}

#[derive(Debug)]
/// Process local store, used when no database is configured.
pub struct MemoryStore {
    readings: Vec<SensorReading>,
    next_id: i32,
    snapshot: Option<(Vec<SensorReading>, i32)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            readings: Vec::new(),
            next_id: 1,
            snapshot: None,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadingStore for MemoryStore {
    fn begin(&mut self) -> Result<(), StoreError> {
        if self.snapshot.is_some() {
            return Err(StoreError::Backend(String::from("Transaction already in progress")));
        }
        self.snapshot = Some((self.readings.clone(), self.next_id));
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.snapshot.take().map(|_| ()).ok_or(StoreError::NoTransaction)
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        let (readings, next_id) = self.snapshot.take().ok_or(StoreError::NoTransaction)?;
        self.readings = readings;
        self.next_id = next_id;
        Ok(())
    }

    fn insert(&mut self, reading: &NewReading) -> Result<i32, StoreError> {
        let id = self.next_id;
        self.next_id += 1;
        self.readings.push(reading.clone().with_id(id));
        Ok(id)
    }

    fn select_all(&mut self) -> Result<Vec<SensorReading>, StoreError> {
        Ok(self.readings.clone())
    }

    fn select_on(&mut self, date: NaiveDate) -> Result<Vec<SensorReading>, StoreError> {
        Ok(self.readings.iter().filter(|r| r.date() == date).cloned().collect())
    }

    fn replace(&mut self, reading: &SensorReading) -> Result<(), StoreError> {
        let stored = self
            .readings
            .iter_mut()
            .find(|r| r.id == reading.id)
            .ok_or_else(|| StoreError::Backend(format!("Reading {} does not exist", reading.id)))?;

        stored.coordinates = reading.coordinates.clone();
        stored.measurements = reading.measurements.clone();
        Ok(())
    }

    fn delete(&mut self, ids: &[i32]) -> Result<u64, StoreError> {
        let before = self.readings.len();
        self.readings.retain(|r| !ids.contains(&r.id));
        Ok((before - self.readings.len()) as u64)
    }
}
