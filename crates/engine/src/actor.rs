//! Per-thread actors — the single-writer serialization point.
//!
//! Every mutation for a `(endpoint_id, thread_id)` runs as a job on that
//! thread's actor. Actors are created lazily, carry a bounded mailbox,
//! and tear themselves down after an idle TTL — unless the thread still
//! has an in-memory active run, in which case the timer resets.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use strand_domain::error::{Error, Result};

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;
type ActorKey = (String, String);
type ActorMap = Arc<Mutex<HashMap<ActorKey, mpsc::Sender<Job>>>>;

/// Answers "does this thread still have an active run?" for TTL resets.
pub type BusyProbe = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

pub struct ThreadManager {
    actors: ActorMap,
    mailbox: usize,
    idle_ttl: Duration,
    is_busy: BusyProbe,
}

impl ThreadManager {
    pub fn new(mailbox: usize, idle_ttl: Duration, is_busy: BusyProbe) -> Self {
        Self {
            actors: Arc::new(Mutex::new(HashMap::new())),
            mailbox: mailbox.max(1),
            idle_ttl,
            is_busy,
        }
    }

    /// Number of live actors (for tests and introspection).
    pub fn live_actors(&self) -> usize {
        self.actors.lock().len()
    }

    /// Run a job on the thread's actor, serialized with every other job
    /// for that thread. Fails with `ThreadBusy` when the mailbox is full.
    pub async fn run<T, F, Fut>(&self, endpoint_id: &str, thread_id: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = T> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            Box::pin(async move {
                let _ = reply_tx.send(f().await);
            })
        });

        let sender = self.sender_for(endpoint_id, thread_id);
        match sender.try_send(job) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => return Err(Error::ThreadBusy),
            Err(mpsc::error::TrySendError::Closed(job)) => {
                // The actor died between lookup and send (idle teardown
                // race); mint a fresh one and retry once.
                self.remove(endpoint_id, thread_id, &sender);
                let sender = self.sender_for(endpoint_id, thread_id);
                sender.try_send(job).map_err(|e| match e {
                    mpsc::error::TrySendError::Full(_) => Error::ThreadBusy,
                    mpsc::error::TrySendError::Closed(_) => {
                        Error::Other("thread actor unavailable".into())
                    }
                })?;
            }
        }

        reply_rx
            .await
            .map_err(|_| Error::Other("thread actor dropped the job".into()))
    }

    fn sender_for(&self, endpoint_id: &str, thread_id: &str) -> mpsc::Sender<Job> {
        let key = (endpoint_id.to_string(), thread_id.to_string());
        let mut actors = self.actors.lock();
        if let Some(sender) = actors.get(&key) {
            if !sender.is_closed() {
                return sender.clone();
            }
        }

        let (tx, rx) = mpsc::channel::<Job>(self.mailbox);
        actors.insert(key.clone(), tx.clone());
        drop(actors);

        spawn_actor(
            key,
            rx,
            self.actors.clone(),
            self.idle_ttl,
            self.is_busy.clone(),
        );
        tx
    }

    fn remove(&self, endpoint_id: &str, thread_id: &str, stale: &mpsc::Sender<Job>) {
        let key = (endpoint_id.to_string(), thread_id.to_string());
        let mut actors = self.actors.lock();
        if let Some(current) = actors.get(&key) {
            if current.same_channel(stale) {
                actors.remove(&key);
            }
        }
    }
}

fn spawn_actor(
    key: ActorKey,
    mut rx: mpsc::Receiver<Job>,
    actors: ActorMap,
    idle_ttl: Duration,
    is_busy: BusyProbe,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                job = rx.recv() => match job {
                    Some(job) => job().await,
                    None => break,
                },
                _ = tokio::time::sleep(idle_ttl) => {
                    // An in-memory active run defers teardown.
                    if is_busy(&key.0, &key.1) {
                        continue;
                    }
                    break;
                }
            }
        }
        rx.close();
        // Drain anything that raced in before closing.
        while let Some(job) = rx.recv().await {
            job().await;
        }
        actors.lock().remove(&key);
        tracing::debug!(endpoint_id = %key.0, thread_id = %key.1, "thread actor stopped");
    });
}
