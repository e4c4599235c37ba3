//! Event journal.
//!
//! Subscribers receive every event posted to every job as a response
//! stream: `{id, eventlog_seq, events:[entry]}`. A subscriber asking for
//! `full` history first gets a replay of all retained eventlogs
//! (inactive jobs then active, in id order), terminated by a sentinel
//! frame, then the live stream. The eventlog sequence number is the
//! per-job ordering key.

use serde_json::json;

use crate::event::EventEntry;
use crate::ids::JobId;
use crate::manager::JobManager;
use crate::rpc::{ClientId, Request, Responder, ServiceError};

/// Sentinel id separating replayed history from live events.
pub const JOURNAL_SENTINEL: u64 = u64::MAX;

struct Subscriber {
    responder: Responder,
}

#[derive(Default)]
pub struct JournalCtx {
    subscribers: Vec<Subscriber>,
}

impl JournalCtx {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listener_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Broadcast one event to every subscriber.
    pub fn publish(&mut self, id: JobId, seq: u64, entry: &EventEntry) {
        if self.subscribers.is_empty() {
            return;
        }
        let payload = json!({
            "id": id.0,
            "eventlog_seq": seq,
            "events": [entry.to_json()],
        });
        for subscriber in &self.subscribers {
            subscriber.responder.respond(payload.clone());
        }
    }

    pub fn disconnect(&mut self, client: ClientId) {
        self.subscribers
            .retain(|s| s.responder.client() != client);
    }
}

impl JobManager {
    /// journal {full?}: subscribe to the event stream.
    pub(crate) fn handle_journal(&mut self, request: &Request) -> Result<(), ServiceError> {
        let full = request.opt_bool("full")?.unwrap_or(false);
        if full {
            let mut ids = self.jobs.inactive_ids_ordered();
            ids.extend(self.jobs.active_ids_ordered());
            for id in ids {
                let Some(job) = self.jobs.lookup(id) else {
                    continue;
                };
                for (index, entry) in job.eventlog.iter().enumerate() {
                    request.responder.respond(json!({
                        "id": id.0,
                        "eventlog_seq": index + 1,
                        "events": [entry.to_json()],
                    }));
                }
            }
            request
                .responder
                .respond(json!({ "id": JOURNAL_SENTINEL }));
        }
        self.journal.subscribers.push(Subscriber {
            responder: request.responder.clone(),
        });
        Ok(())
    }
}
