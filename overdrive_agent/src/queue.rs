//! Set of pids currently being processed; lets the ingress layer suppress
//! duplicate requests while an optimization is in flight or watched.

use std::collections::HashSet;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
pub struct ProcessingQueue {
    pids: Mutex<HashSet<i32>>,
}

impl ProcessingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_pid(&self, pid: i32) -> bool {
        self.pids.lock().await.insert(pid)
    }

    pub async fn remove_pids<I: IntoIterator<Item = i32>>(&self, pids: I) {
        let mut guard = self.pids.lock().await;
        for pid in pids {
            guard.remove(&pid);
        }
    }

    pub async fn contains(&self, pid: i32) -> bool {
        self.pids.lock().await.contains(&pid)
    }

    pub async fn len(&self) -> usize {
        self.pids.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_is_idempotent() {
        let queue = ProcessingQueue::new();
        assert!(queue.add_pid(10).await);
        assert!(!queue.add_pid(10).await);
        assert!(queue.contains(10).await);
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn remove_accepts_many() {
        let queue = ProcessingQueue::new();
        queue.add_pid(1).await;
        queue.add_pid(2).await;
        queue.remove_pids([1, 2, 3]).await;
        assert_eq!(queue.len().await, 0);
    }
}
