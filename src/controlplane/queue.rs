//! In-process event queue
//!
//! FIFO queue shared by one watch loop (producer) and one notification loop
//! (consumer). Enqueue wakes a waiting consumer instead of leaving it to poll.

use crate::domain::ports::EventQueue;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

pub struct LocalEventQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> LocalEventQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }
}

impl<T> Default for LocalEventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Send + 'static> EventQueue<T> for LocalEventQueue<T> {
    fn enqueue(&self, item: T) {
        self.items.lock().push_back(item);
        // Stores a permit if nobody is waiting yet
        self.notify.notify_one();
    }

    fn try_dequeue(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    async fn notified(&self) {
        if !self.items.lock().is_empty() {
            return;
        }
        self.notify.notified().await;
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }
}
