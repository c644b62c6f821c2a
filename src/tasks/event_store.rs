//! Append-only per-task event storage.
//!
//! Each task owns one stream. Offsets are assigned at append time, start at
//! 1 and increase by exactly one per event, so any range read is gap-free.
//! Appends to the same stream are serialized by a per-stream lock; appends
//! to different streams never contend with each other beyond the map lookup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::EventStoreError;

use super::types::{EventBody, TaskEvent};

/// Storage backend for task event streams.
///
/// The broker is the only writer. A persistent implementation can replace
/// [`MemoryEventStore`] without touching the worker or the pipeline.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Creates an empty stream for a new task.
    async fn create_stream(&self, task_id: Uuid) -> Result<(), EventStoreError>;

    /// Appends an event and returns it with its assigned offset.
    ///
    /// Fails only when the stream does not exist.
    async fn append(&self, task_id: Uuid, body: EventBody) -> Result<TaskEvent, EventStoreError>;

    /// Returns every event with `offset >= from`, in offset order.
    async fn read_from(&self, task_id: Uuid, from: u64) -> Result<Vec<TaskEvent>, EventStoreError>;

    /// Returns the highest assigned offset, 0 for an empty stream.
    async fn last_offset(&self, task_id: Uuid) -> Result<u64, EventStoreError>;
}

type Stream = Arc<Mutex<Vec<TaskEvent>>>;

/// In-process event store.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    streams: RwLock<HashMap<Uuid, Stream>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn stream(&self, task_id: Uuid) -> Result<Stream, EventStoreError> {
        self.streams
            .read()
            .expect("event streams read lock poisoned")
            .get(&task_id)
            .cloned()
            .ok_or(EventStoreError::StreamNotFound(task_id))
    }

    /// Returns the number of streams held.
    pub fn len(&self) -> usize {
        self.streams
            .read()
            .expect("event streams read lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn create_stream(&self, task_id: Uuid) -> Result<(), EventStoreError> {
        let mut streams = self
            .streams
            .write()
            .expect("event streams write lock poisoned");
        if streams.contains_key(&task_id) {
            return Err(EventStoreError::StreamExists(task_id));
        }
        streams.insert(task_id, Arc::new(Mutex::new(Vec::new())));
        Ok(())
    }

    async fn append(&self, task_id: Uuid, body: EventBody) -> Result<TaskEvent, EventStoreError> {
        let stream = self.stream(task_id)?;
        let mut events = stream.lock().expect("event stream lock poisoned");

        let event = TaskEvent {
            task_id,
            offset: events.len() as u64 + 1,
            body,
            created_at: Utc::now(),
        };
        events.push(event.clone());

        Ok(event)
    }

    async fn read_from(&self, task_id: Uuid, from: u64) -> Result<Vec<TaskEvent>, EventStoreError> {
        let stream = self.stream(task_id)?;
        let events = stream.lock().expect("event stream lock poisoned");

        // offset N lives at index N - 1
        let start = from.saturating_sub(1) as usize;
        Ok(events.get(start..).map(<[_]>::to_vec).unwrap_or_default())
    }

    async fn last_offset(&self, task_id: Uuid) -> Result<u64, EventStoreError> {
        let stream = self.stream(task_id)?;
        let events = stream.lock().expect("event stream lock poisoned");
        Ok(events.len() as u64)
    }
}
