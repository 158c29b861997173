//! Scripted identity source: tests decide what fetch returns and push watch updates.

use async_trait::async_trait;
use futures::StreamExt;
use oneedge_agent::common::credential::Credential;
use oneedge_agent::common::errors::IdentityError;
use oneedge_agent::identity::{CredentialStream, IdentitySource};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
pub struct ScriptedSource {
    current: Mutex<Option<Credential>>,
    fetch_delay: Mutex<Duration>,
    hang: AtomicBool,
    fetches: AtomicUsize,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Result<Credential, IdentityError>>>>,
    closed: AtomicBool,
}

impl ScriptedSource {
    pub fn new(initial: Option<Credential>) -> Self {
        let source = Self::default();
        *source.current.lock().unwrap() = initial;
        source
    }

    /// Never answers fetch.
    pub fn hanging() -> Self {
        let source = Self::default();
        source.hang.store(true, Ordering::SeqCst);
        source
    }

    pub fn set_current(&self, cred: Credential) {
        *self.current.lock().unwrap() = Some(cred);
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = delay;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap()
            .iter()
            .filter(|s| !s.is_closed())
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Delivers an item to every open watch stream.
    pub fn push(&self, item: Result<Credential, IdentityError>) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(item.clone()).is_ok());
    }

    /// Ends every open watch stream.
    pub fn end_streams(&self) {
        self.subscribers.lock().unwrap().clear();
    }
}

#[async_trait]
impl IdentitySource for ScriptedSource {
    async fn fetch(&self) -> Result<Credential, IdentityError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        let delay = *self.fetch_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.current
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| IdentityError::SourceUnavailable("no credential scripted".into()))
    }

    async fn watch(&self) -> Result<CredentialStream, IdentityError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.end_streams();
    }
}
