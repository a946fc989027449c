//! Ownership of live log transports.
//!
//! Each watched run has one slot holding its `LogStream` state and, while
//! live, the task reading the server's event stream. Transport tasks never
//! touch shared state: they forward `StreamSignal`s over a channel and the
//! owner applies them. Dropping a slot's transport aborts the task, and a
//! per-open generation number lets the owner discard signals from a transport
//! that has already been replaced.

use std::collections::HashMap;
use std::sync::Arc;

use conductor_client::{ConductorClientError, SseEvent};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::api::ConductorApi;
use crate::log_stream::{LogStream, LogStreamSnapshot, LogStreamState};

pub const SIGNAL_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
pub enum SignalKind {
    Opened,
    Frame(SseEvent),
    Failed(ConductorClientError),
    /// The server ended the stream.
    Ended,
}

#[derive(Debug)]
pub struct StreamSignal {
    pub run_id: String,
    pub generation: u64,
    pub kind: SignalKind,
}

#[derive(Debug)]
struct TransportHandle {
    task: JoinHandle<()>,
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Debug)]
struct StreamSlot {
    stream: LogStream,
    generation: u64,
    transport: Option<TransportHandle>,
}

#[derive(Debug)]
pub struct LogStreams {
    slots: HashMap<String, StreamSlot>,
    next_generation: u64,
    signals: mpsc::Sender<StreamSignal>,
}

impl LogStreams {
    #[must_use]
    pub fn new(signals: mpsc::Sender<StreamSignal>) -> Self {
        Self {
            slots: HashMap::new(),
            next_generation: 0,
            signals,
        }
    }

    #[must_use]
    pub fn state(&self, run_id: &str) -> Option<LogStreamState> {
        self.slots.get(run_id).map(|slot| slot.stream.state())
    }

    #[must_use]
    pub fn is_live(&self, run_id: &str) -> bool {
        self.state(run_id).is_some_and(LogStreamState::is_live)
    }

    #[must_use]
    pub fn snapshot(&self, run_id: &str) -> Option<LogStreamSnapshot> {
        self.slots.get(run_id).map(|slot| slot.stream.snapshot())
    }

    #[must_use]
    pub fn live_run_ids(&self) -> Vec<String> {
        let mut ids = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.stream.state().is_live())
            .map(|(run_id, _)| run_id.clone())
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    /// Start a transport for the run. Returns `None` when one is already live.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open<A>(&mut self, api: Arc<A>, run_id: &str) -> Option<u64>
    where
        A: ConductorApi,
    {
        if self.is_live(run_id) {
            return None;
        }
        self.next_generation = self.next_generation.saturating_add(1);
        let generation = self.next_generation;

        let mut stream = LogStream::new(run_id);
        stream.begin_connect();
        let task = spawn_transport(api, run_id.to_string(), generation, self.signals.clone());
        // Replacing a finished slot drops its handle, if any.
        self.slots.insert(
            run_id.to_string(),
            StreamSlot {
                stream,
                generation,
                transport: Some(TransportHandle { task }),
            },
        );
        Some(generation)
    }

    /// The stream for `run_id` if `generation` is still current.
    pub fn current_mut(&mut self, run_id: &str, generation: u64) -> Option<&mut LogStream> {
        self.slots
            .get_mut(run_id)
            .filter(|slot| slot.generation == generation)
            .map(|slot| &mut slot.stream)
    }

    /// Release the transport after the server completed the stream.
    pub fn finish(&mut self, run_id: &str) {
        if let Some(slot) = self.slots.get_mut(run_id) {
            slot.transport = None;
            slot.stream.finish_closing();
        }
    }

    /// Release the transport after a failure, keeping the errored state visible.
    pub fn release(&mut self, run_id: &str) {
        if let Some(slot) = self.slots.get_mut(run_id) {
            slot.transport = None;
        }
    }

    /// Close the run's stream and abort its transport. Idempotent.
    pub fn close(&mut self, run_id: &str) -> bool {
        let Some(slot) = self.slots.get_mut(run_id) else {
            return false;
        };
        slot.transport = None;
        slot.stream.close()
    }

    /// Close the run's stream and forget its slot. Returns whether a live
    /// stream was closed.
    pub fn remove(&mut self, run_id: &str) -> bool {
        let closed = self.close(run_id);
        self.slots.remove(run_id);
        closed
    }
}

fn signal(run_id: &str, generation: u64, kind: SignalKind) -> StreamSignal {
    StreamSignal {
        run_id: run_id.to_string(),
        generation,
        kind,
    }
}

fn spawn_transport<A>(
    api: Arc<A>,
    run_id: String,
    generation: u64,
    signals: mpsc::Sender<StreamSignal>,
) -> JoinHandle<()>
where
    A: ConductorApi,
{
    tokio::spawn(async move {
        let mut events = match api.open_run_logs(&run_id).await {
            Ok(events) => events,
            Err(error) => {
                let _ = signals
                    .send(signal(&run_id, generation, SignalKind::Failed(error)))
                    .await;
                return;
            }
        };
        if signals
            .send(signal(&run_id, generation, SignalKind::Opened))
            .await
            .is_err()
        {
            return;
        }

        while let Some(item) = events.next().await {
            let (kind, last) = match item {
                Ok(frame) => (SignalKind::Frame(frame), false),
                Err(error) => (SignalKind::Failed(error), true),
            };
            if signals.send(signal(&run_id, generation, kind)).await.is_err() || last {
                return;
            }
        }
        let _ = signals
            .send(signal(&run_id, generation, SignalKind::Ended))
            .await;
    })
}
