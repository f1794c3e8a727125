//! Watch streams: one caller session, many watchers, one ordered response channel.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use super::dispatcher::Command;
use super::{WatchError, WatchRequest, WatchResponse, WatchResult, AUTO_WATCH_ID, INVALID_WATCH_ID};

/// A response staged by the dispatcher, stamped with the registration it
/// belongs to. Serial 0 is used for stream-wide responses.
#[derive(Debug)]
pub(crate) struct Staged {
    pub(crate) serial: u64,
    pub(crate) response: WatchResponse,
}

/// A set of watchers sharing one delivery channel.
///
/// Watch ids are scoped to the stream. Dropping the stream cancels all of its
/// watchers.
pub struct WatchStream {
    id: u64,
    commands: mpsc::UnboundedSender<Command>,
    /// Live watch ids and the serial of their current registration, shared
    /// with the delivery task
    active: Arc<Mutex<HashMap<i64, u64>>>,
    next_id: i64,
    next_serial: u64,
    responses: mpsc::Receiver<WatchResponse>,
}

impl WatchStream {
    pub(crate) fn open(id: u64, commands: mpsc::UnboundedSender<Command>, buffer: usize) -> Self {
        let (sink, staged) = mpsc::channel(buffer.max(1));
        let (out, responses) = mpsc::channel(buffer.max(1));
        let active = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(deliver(id, staged, out, active.clone()));
        if commands.send(Command::OpenStream { stream: id, sink }).is_err() {
            debug!(stream = id, "Watch dispatcher is gone, stream opened closed");
        }

        Self {
            id,
            commands,
            active,
            next_id: 0,
            next_serial: 1,
            responses,
        }
    }

    /// Creates a watcher and returns its id.
    pub fn watch(&mut self, request: WatchRequest) -> WatchResult<i64> {
        request.validate()?;

        let id = {
            let mut active = self.active.lock();
            let id = if request.watch_id == AUTO_WATCH_ID {
                while active.contains_key(&self.next_id) {
                    self.next_id += 1;
                }
                let id = self.next_id;
                self.next_id += 1;
                id
            } else if active.contains_key(&request.watch_id) {
                return Err(WatchError::DuplicateWatchId(request.watch_id));
            } else {
                request.watch_id
            };
            active.insert(id, self.next_serial);
            id
        };
        let serial = self.next_serial;
        self.next_serial += 1;

        let command = Command::Register {
            stream: self.id,
            id,
            serial,
            request,
        };
        if self.commands.send(command).is_err() {
            self.active.lock().remove(&id);
            return Err(WatchError::ChannelClosed);
        }

        debug!(stream = self.id, watch_id = id, "Watch created");
        Ok(id)
    }

    /// Cancels a watcher. Nothing staged for it is delivered afterwards.
    pub fn cancel(&mut self, id: i64) -> WatchResult<()> {
        if self.active.lock().remove(&id).is_none() {
            return Err(WatchError::WatchNotFound(id));
        }
        // The dispatcher may already be gone; the id is inactive either way.
        let _ = self.commands.send(Command::Cancel {
            stream: self.id,
            id,
        });
        debug!(stream = self.id, watch_id = id, "Watch canceled");
        Ok(())
    }

    /// Asks for a progress response for one watcher. Only answered once the
    /// watcher is synced.
    pub fn request_progress(&self, id: i64) -> WatchResult<()> {
        if !self.active.lock().contains_key(&id) {
            return Err(WatchError::WatchNotFound(id));
        }
        self.commands
            .send(Command::Progress {
                stream: self.id,
                id,
            })
            .map_err(|_| WatchError::ChannelClosed)
    }

    /// Asks for one progress response for the whole stream, tagged with
    /// [`INVALID_WATCH_ID`]. Only answered when every watcher is synced.
    pub fn request_progress_all(&self) -> WatchResult<()> {
        self.commands
            .send(Command::ProgressAll { stream: self.id })
            .map_err(|_| WatchError::ChannelClosed)
    }

    /// Next response, or `None` once the stream has been disconnected.
    pub async fn recv(&mut self) -> Option<WatchResponse> {
        self.responses.recv().await
    }

    pub fn try_recv(&mut self) -> Option<WatchResponse> {
        self.responses.try_recv().ok()
    }

    /// Number of watchers that have not been cancelled.
    pub fn watcher_count(&self) -> usize {
        self.active.lock().len()
    }
}

impl Drop for WatchStream {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::CloseStream { stream: self.id });
    }
}

/// Forwards staged responses to the consumer, dropping those of cancelled
/// registrations even when their id has been reused since.
async fn deliver(
    stream: u64,
    mut staged: mpsc::Receiver<Staged>,
    out: mpsc::Sender<WatchResponse>,
    active: Arc<Mutex<HashMap<i64, u64>>>,
) {
    while let Some(Staged { serial, response: resp }) = staged.recv().await {
        if resp.watch_id != INVALID_WATCH_ID {
            let mut active = active.lock();
            if active.get(&resp.watch_id) != Some(&serial) {
                debug!(stream, watch_id = resp.watch_id, serial, "Dropping response of canceled watch");
                continue;
            }
            if resp.canceled {
                active.remove(&resp.watch_id);
            }
        }
        if out.send(resp).await.is_err() {
            break;
        }
    }
    debug!(stream, "Watch stream delivery stopped");
}
