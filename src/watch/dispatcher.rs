//! The dispatcher task: sole owner of watcher state.
//!
//! Streams and the watchable store talk to it through [`Command`]s on one unbounded
//! channel, so registrations, cancellations and commits are handled in the order
//! they were issued. Commits arrive in revision order; `rev` is the last one handed
//! to synced watchers, and catch-up never reads past it, which keeps each event
//! delivered exactly once across the unsynced to synced promotion.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::group::{WatcherGroup, WatcherKey};
use super::stream::Staged;
use super::{deliverable, WatchConfig, WatchRange, WatchRequest, WatchResponse, INVALID_WATCH_ID};
use crate::storage::{Event, MvccStore, StorageError};

pub(crate) enum Command {
    OpenStream {
        stream: u64,
        sink: mpsc::Sender<Staged>,
    },
    CloseStream {
        stream: u64,
    },
    Register {
        stream: u64,
        id: i64,
        serial: u64,
        request: WatchRequest,
    },
    Cancel {
        stream: u64,
        id: i64,
    },
    Progress {
        stream: u64,
        id: i64,
    },
    ProgressAll {
        stream: u64,
    },
    Commit {
        revision: i64,
        events: Vec<Event>,
    },
}

struct Watcher {
    request: WatchRequest,
    /// Registration serial stamped on everything staged for this watcher
    serial: u64,
    range: WatchRange,
    /// Next revision this watcher has to see
    min_rev: i64,
}

pub(crate) struct Dispatcher {
    store: Arc<MvccStore>,
    config: WatchConfig,
    /// Last revision dispatched to synced watchers
    rev: i64,
    watchers: HashMap<WatcherKey, Watcher>,
    synced: WatcherGroup,
    unsynced: WatcherGroup,
    /// Staging channel of each open stream
    sinks: HashMap<u64, mpsc::Sender<Staged>>,
}

impl Dispatcher {
    pub(crate) fn new(store: Arc<MvccStore>, config: WatchConfig) -> Self {
        let rev = store.current_revision();
        Self {
            store,
            config,
            rev,
            watchers: HashMap::new(),
            synced: WatcherGroup::default(),
            unsynced: WatcherGroup::default(),
            sinks: HashMap::new(),
        }
    }

    /// Runs until every command sender is gone.
    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let sync_every = self.config.sync_interval;
        let mut sync_ticker = time::interval_at(Instant::now() + sync_every, sync_every);
        sync_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let progress_every = self.config.progress_interval;
        let mut progress_ticker =
            time::interval_at(Instant::now() + progress_every, progress_every);
        progress_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = sync_ticker.tick() => self.sync_watchers(),
                _ = progress_ticker.tick() => self.notify_progress(),
            }
        }

        info!(revision = self.rev, "Watch dispatcher stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::OpenStream { stream, sink } => {
                self.sinks.insert(stream, sink);
            }
            Command::CloseStream { stream } => self.close_stream(stream),
            Command::Register {
                stream,
                id,
                serial,
                request,
            } => self.register((stream, id), serial, request),
            Command::Cancel { stream, id } => {
                self.remove((stream, id));
            }
            Command::Progress { stream, id } => self.progress((stream, id)),
            Command::ProgressAll { stream } => self.progress_all(stream),
            Command::Commit { revision, events } => self.commit(revision, &events),
        }
    }

    fn register(&mut self, key: WatcherKey, serial: u64, request: WatchRequest) {
        if !self.sinks.contains_key(&key.0) {
            debug!(stream = key.0, "Ignoring watch on a closed stream");
            return;
        }
        self.remove(key);

        let range = request.watch_range();
        let start = request.start_revision;
        let synced = start == 0 || start > self.rev;
        let min_rev = if start == 0 { self.rev + 1 } else { start };

        if synced {
            self.synced.add(key, &range);
        } else {
            self.unsynced.add(key, &range);
        }
        self.watchers.insert(
            key,
            Watcher {
                request,
                serial,
                range,
                min_rev,
            },
        );
        debug!(
            stream = key.0,
            watch_id = key.1,
            min_rev,
            synced,
            "Watcher registered"
        );

        if !synced {
            self.sync_watchers();
        }
    }

    fn remove(&mut self, key: WatcherKey) -> Option<Watcher> {
        let watcher = self.watchers.remove(&key)?;
        if !self.synced.remove(key, &watcher.range) {
            self.unsynced.remove(key, &watcher.range);
        }
        Some(watcher)
    }

    fn close_stream(&mut self, stream: u64) {
        self.sinks.remove(&stream);
        let owned: Vec<WatcherKey> = self
            .watchers
            .keys()
            .filter(|key| key.0 == stream)
            .copied()
            .collect();
        for key in owned {
            self.remove(key);
        }
        debug!(stream, "Watch stream closed");
    }

    /// Stages a response on a stream. Returns false if the stream is gone,
    /// disconnecting it when its buffer is full.
    fn send(&mut self, stream: u64, serial: u64, response: WatchResponse) -> bool {
        let Some(sink) = self.sinks.get(&stream) else {
            return false;
        };
        match sink.try_send(Staged { serial, response }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(stream, "Watch stream is not keeping up, disconnecting");
                self.close_stream(stream);
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.close_stream(stream);
                false
            }
        }
    }

    /// Hands one commit to the synced watchers, one response per watcher.
    fn commit(&mut self, revision: i64, events: &[Event]) {
        if revision <= self.rev {
            warn!(
                revision,
                dispatched = self.rev,
                "Ignoring commit that is not newer than the dispatched revision"
            );
            return;
        }

        let mut batches: HashMap<WatcherKey, (u64, Vec<Event>)> = HashMap::new();
        for event in events {
            for key in self.synced.matching(&event.kv.key) {
                let Some(watcher) = self.watchers.get(&key) else {
                    continue;
                };
                if revision < watcher.min_rev || !watcher.request.accepts(event) {
                    continue;
                }
                batches
                    .entry(key)
                    .or_insert_with(|| (watcher.serial, Vec::new()))
                    .1
                    .push(deliverable(event, watcher.request.prev_kv));
            }
        }
        self.rev = revision;

        for ((stream, id), (serial, events)) in batches {
            self.send(
                stream,
                serial,
                WatchResponse {
                    watch_id: id,
                    revision,
                    events,
                    ..Default::default()
                },
            );
        }

        if !self.unsynced.is_empty() {
            self.sync_watchers();
        }
    }

    /// One catch-up pass over the unsynced watchers.
    fn sync_watchers(&mut self) {
        if self.unsynced.is_empty() {
            return;
        }
        let mut pending: Vec<WatcherKey> = self.unsynced.watchers().collect();
        pending.sort_unstable();
        pending.truncate(self.config.sync_watcher_limit.max(1));

        for key in pending {
            self.sync_watcher(key);
        }
        debug!(
            synced = self.synced.len(),
            unsynced = self.unsynced.len(),
            revision = self.rev,
            "Watch catch-up pass finished"
        );
    }

    fn sync_watcher(&mut self, key: WatcherKey) {
        let Some(watcher) = self.watchers.get(&key) else {
            return;
        };
        let serial = watcher.serial;
        let window = self.config.sync_revision_limit.max(1);
        let until = self.rev.min(watcher.min_rev - 1 + window);

        let replayed = self.store.events_since(
            &watcher.range.key,
            &watcher.range.range_end,
            watcher.min_rev - 1,
            until,
            watcher.request.prev_kv,
        );

        let responses = match replayed {
            Ok(events) => group_by_revision(key.1, events, &watcher.request),
            Err(StorageError::Compacted { compacted, .. }) => {
                debug!(
                    stream = key.0,
                    watch_id = key.1,
                    min_rev = watcher.min_rev,
                    compacted,
                    "Watcher start revision compacted"
                );
                self.terminate(key, serial, compacted);
                return;
            }
            Err(e) => {
                error!(stream = key.0, watch_id = key.1, error = %e, "Watch catch-up failed");
                self.terminate(key, serial, 0);
                return;
            }
        };

        if let Some(watcher) = self.watchers.get_mut(&key) {
            watcher.min_rev = until + 1;
        }
        for resp in responses {
            if !self.send(key.0, serial, resp) {
                return;
            }
        }

        if until >= self.rev {
            if let Some(watcher) = self.watchers.get(&key) {
                self.unsynced.remove(key, &watcher.range);
                self.synced.add(key, &watcher.range);
                debug!(stream = key.0, watch_id = key.1, revision = self.rev, "Watcher synced");
            }
        }
    }

    /// Removes a watcher and delivers its final response.
    fn terminate(&mut self, key: WatcherKey, serial: u64, compact_revision: i64) {
        self.remove(key);
        let resp = WatchResponse {
            watch_id: key.1,
            revision: self.rev,
            events: Vec::new(),
            compact_revision,
            canceled: true,
        };
        self.send(key.0, serial, resp);
    }

    /// Whether a progress response may be sent: the watcher has seen everything
    /// up to the dispatched revision and does not wait for a later start.
    fn progress_allowed(&self, key: WatcherKey, watcher: &Watcher) -> bool {
        self.synced.contains(key, &watcher.range) && watcher.min_rev <= self.rev + 1
    }

    fn progress(&mut self, key: WatcherKey) {
        let allowed = self
            .watchers
            .get(&key)
            .filter(|watcher| self.progress_allowed(key, watcher))
            .map(|watcher| watcher.serial);
        if let Some(serial) = allowed {
            self.send(key.0, serial, self.progress_response(key.1));
        }
    }

    fn progress_all(&mut self, stream: u64) {
        let all_synced = self
            .watchers
            .iter()
            .filter(|(key, _)| key.0 == stream)
            .all(|(key, watcher)| self.progress_allowed(*key, watcher));
        if all_synced {
            self.send(stream, 0, self.progress_response(INVALID_WATCH_ID));
        }
    }

    fn notify_progress(&mut self) {
        let due: Vec<(WatcherKey, u64)> = self
            .watchers
            .iter()
            .filter(|(key, watcher)| {
                watcher.request.progress_notify && self.progress_allowed(**key, watcher)
            })
            .map(|(key, watcher)| (*key, watcher.serial))
            .collect();
        for (key, serial) in due {
            self.send(key.0, serial, self.progress_response(key.1));
        }
    }

    fn progress_response(&self, watch_id: i64) -> WatchResponse {
        WatchResponse {
            watch_id,
            revision: self.rev,
            ..Default::default()
        }
    }
}

/// Replayed events as one response per main revision, filters applied.
fn group_by_revision(watch_id: i64, events: Vec<Event>, request: &WatchRequest) -> Vec<WatchResponse> {
    let mut responses: Vec<WatchResponse> = Vec::new();
    for event in events.into_iter().filter(|event| request.accepts(event)) {
        let revision = event.kv.mod_revision;
        match responses.last_mut() {
            Some(last) if last.revision == revision => last.events.push(event),
            _ => responses.push(WatchResponse {
                watch_id,
                revision,
                events: vec![event],
                ..Default::default()
            }),
        }
    }
    responses
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{EventType, KeyValue};

    fn event(event_type: EventType, key: &str, rev: i64) -> Event {
        Event {
            event_type,
            kv: KeyValue {
                key: key.as_bytes().to_vec(),
                mod_revision: rev,
                ..Default::default()
            },
            prev_kv: None,
        }
    }

    #[test]
    fn test_group_by_revision() {
        let events = vec![
            event(EventType::Put, "a", 2),
            event(EventType::Put, "b", 2),
            event(EventType::Delete, "a", 3),
            event(EventType::Put, "a", 4),
        ];

        let all = group_by_revision(7, events.clone(), &WatchRequest::key(b"a"));
        let shape: Vec<(i64, usize)> = all.iter().map(|r| (r.revision, r.events.len())).collect();
        assert_eq!(shape, vec![(2, 2), (3, 1), (4, 1)]);
        assert!(all.iter().all(|r| r.watch_id == 7));

        let no_put = WatchRequest::key(b"a").with_filter(crate::watch::WatchFilter::NoPut);
        let deletes = group_by_revision(7, events, &no_put);
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].revision, 3);
    }
}
