use super::{JobEnvelope, QueueBroker, QueueError, QueueResult};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// FIFO broker held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    queues: Mutex<HashMap<String, VecDeque<JobEnvelope>>>,
    unreachable: AtomicBool,
}

impl InMemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail as if the broker were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    #[must_use]
    pub fn len(&self, queue: &str) -> usize {
        self.lock().get(queue).map_or(0, VecDeque::len)
    }

    #[must_use]
    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }

    /// Copy of the pending envelopes in delivery order.
    #[must_use]
    pub fn snapshot(&self, queue: &str) -> Vec<JobEnvelope> {
        self.lock().get(queue).map(|q| q.iter().cloned().collect()).unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<JobEnvelope>>> {
        self.queues.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn check(&self) -> QueueResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("in-memory broker marked unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueBroker for InMemoryBroker {
    async fn push(&self, queue: &str, envelope: &JobEnvelope) -> QueueResult<()> {
        self.check()?;
        self.lock().entry(queue.to_string()).or_default().push_back(envelope.clone());
        Ok(())
    }

    async fn pop(&self, queue: &str) -> QueueResult<Option<JobEnvelope>> {
        self.check()?;
        Ok(self.lock().get_mut(queue).and_then(VecDeque::pop_front))
    }
}
