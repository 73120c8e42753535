//! A remote process as a streaming-reply handle.
//!
//! The correlation id of the `spawn_process` command identifies the process
//! for its whole life: every data frame and the stdin/destroy commands carry
//! it. Frames are delivered on the reactor task by the owning container's
//! dispatcher; callers park on [`Process::wait_until_complete`] or the
//! one-shot stdin reply slot.

use std::sync::{Arc, Mutex};

use berth_wire::{Message, commands};
use bytes::Bytes;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::connection::Connection;
use crate::lifecycle::{DeadFlag, Latch};
use crate::{Error, Result};

/// Invoked on the reactor task with the bulk of every non-empty data frame.
pub type DataCallback = Box<dyn FnMut(&[u8]) + Send>;
/// Invoked exactly once, however the process ends.
pub type TerminationCallback = Box<dyn FnOnce() + Send>;

pub struct Process {
    uuid: String,
    node_pk: String,
    container_uuid: String,
    conn: Arc<Connection>,
    dead: DeadFlag,
    completed: Latch,
    state: Mutex<ProcessState>,
}

struct ProcessState {
    /// Collected bulks when no data callback is set; returned by
    /// [`Process::wait_until_complete`].
    buffer: Vec<u8>,
    data_callback: Option<DataCallback>,
    termination_callback: Option<TerminationCallback>,
    /// A parked `stdin_replied` caller, released by the next data frame.
    reply_slot: Option<oneshot::Sender<Bytes>>,
    /// Discard the next frame (it echoes what we just injected).
    drop_next: bool,
}

impl Process {
    pub(crate) fn new(
        conn: Arc<Connection>,
        node_pk: String,
        container_uuid: String,
        uuid: String,
        data_callback: Option<DataCallback>,
        termination_callback: Option<TerminationCallback>,
    ) -> Arc<Process> {
        info!("created process: {uuid}");
        Arc::new(Process {
            uuid,
            node_pk,
            container_uuid,
            conn,
            dead: DeadFlag::new(),
            completed: Latch::new(),
            state: Mutex::new(ProcessState {
                buffer: Vec::new(),
                data_callback,
                termination_callback,
                reply_slot: None,
                drop_next: false,
            }),
        })
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    fn stdin_params(&self) -> serde_json::Value {
        json!({
            "node": self.node_pk,
            "container": self.container_uuid,
            "process": self.uuid,
        })
    }

    /// Inject bytes into the remote stdin. Raw data: add `\n` yourself if
    /// you are emulating a carriage return. With `drop_echo` the next frame
    /// (a tty echo of this input) is discarded instead of reaching the data
    /// callback or buffer.
    pub fn stdin(&self, data: impl Into<Bytes>, drop_echo: bool) -> Result<()> {
        self.dead.ensure_alive("process")?;
        // Armed before the send so a fast echo cannot slip past.
        self.state.lock().unwrap().drop_next = drop_echo;
        self.conn.send_cmd(commands::STDIN_PROCESS, self.stdin_params(), data)
    }

    /// Inject bytes and park until the next data frame, which is returned
    /// instead of being delivered as ordinary data. With `drop_echo` the
    /// very next frame (a tty echo of the input) is discarded first.
    pub async fn stdin_replied(&self, data: impl Into<Bytes>, drop_echo: bool) -> Result<Bytes> {
        self.dead.ensure_alive("process")?;
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().unwrap();
            if state.reply_slot.is_some() {
                return Err(Error::State("a stdin reply is already being awaited".into()));
            }
            state.drop_next = drop_echo;
            // Installed before the send so the reply cannot be missed.
            state.reply_slot = Some(tx);
        }
        self.conn.send_cmd(commands::STDIN_PROCESS, self.stdin_params(), data)?;
        rx.await
            .map_err(|_| Error::State("process terminated before a reply arrived".into()))
    }

    /// Park until the process ends (remote close or local destroy). When no
    /// data callback was given, returns everything the process wrote.
    pub async fn wait_until_complete(&self) -> Result<Bytes> {
        self.completed.wait().await?;
        let state = self.state.lock().unwrap();
        Ok(Bytes::copy_from_slice(&state.buffer))
    }

    /// One frame of the streaming reply, delivered by the container's
    /// dispatcher on the reactor task.
    pub(crate) fn handle_frame(&self, msg: &Message) {
        if self.dead.bail_if_dead("process") {
            return;
        }

        // An empty bulk is the remote obituary.
        if msg.bulk.is_empty() {
            info!("process terminated server side: {}", self.uuid);
            self.terminate();
            return;
        }

        let mut state = self.state.lock().unwrap();
        if state.drop_next {
            state.drop_next = false;
            return;
        }
        if let Some(tx) = state.reply_slot.take() {
            let _ = tx.send(msg.bulk.clone());
        }
        match state.data_callback.as_mut() {
            Some(callback) => callback(&msg.bulk),
            None => state.buffer.extend_from_slice(&msg.bulk),
        }
    }

    /// Tear the handle down. `with_command` distinguishes a caller-initiated
    /// destroy (tell the broker) from cleanup after the container itself is
    /// gone (the remote side is already dead).
    pub(crate) fn internal_destroy(&self, with_command: bool) {
        if self.dead.bail_if_dead("process") {
            return;
        }
        if with_command {
            let _ = self.conn.send_cmd(
                commands::DESTROY_PROCESS,
                json!({
                    "node": self.node_pk,
                    "container": self.container_uuid,
                    "process": self.uuid,
                }),
                Bytes::new(),
            );
        }
        debug!("destroyed process: {}", self.uuid);
        self.terminate();
    }

    /// Exactly-once terminal bookkeeping, whichever side initiated it.
    fn terminate(&self) {
        if !self.dead.mark_as_dead() {
            return;
        }
        let (reply_slot, callback) = {
            let mut state = self.state.lock().unwrap();
            (state.reply_slot.take(), state.termination_callback.take())
        };
        // A parked stdin reply will never get its frame now.
        drop(reply_slot);
        if let Some(callback) = callback {
            callback();
        }
        self.completed.mark_as_ready();
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process").field("uuid", &self.uuid).finish_non_exhaustive()
    }
}
