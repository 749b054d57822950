// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Coordinated shutdown. A [DrainTrigger] starts the drain and waits until every outstanding
//! [DrainWatcher] has been dropped. Listeners stop accepting once they observe the drain, and
//! background loops (such as the cluster directory refresh) exit.

use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMode {
    Immediate,
    Graceful,
}

enum Never {}

/// Creates a connected trigger/watcher pair.
pub fn new() -> (DrainTrigger, DrainWatcher) {
    let (signal_tx, signal_rx) = watch::channel(None);
    let (drained_tx, drained_rx) = mpsc::channel(1);
    (
        DrainTrigger {
            drained_rx,
            signal_tx,
        },
        DrainWatcher {
            drained_tx,
            signal_rx,
        },
    )
}

pub struct DrainTrigger {
    drained_rx: mpsc::Receiver<Never>,
    signal_tx: watch::Sender<Option<DrainMode>>,
}

impl DrainTrigger {
    /// Signals every watcher and waits for all of them to be released.
    pub async fn start_drain_and_wait(mut self, mode: DrainMode) {
        let _ = self.signal_tx.send(Some(mode));
        match self.drained_rx.recv().await {
            None => {}
            Some(never) => match never {},
        }
    }
}

#[derive(Clone)]
pub struct DrainWatcher {
    drained_tx: mpsc::Sender<Never>,
    signal_rx: watch::Receiver<Option<DrainMode>>,
}

impl DrainWatcher {
    /// Completes once a drain has been signaled. The returned blocker keeps the drain pending
    /// until it is dropped, so cleanup can finish first.
    pub async fn wait_for_drain(mut self) -> DrainBlocker {
        // A dropped trigger means nobody will wait on us; treat it as an immediate drain.
        let mode = match self.signal_rx.wait_for(Option::is_some).await {
            Ok(mode) => (*mode).unwrap_or(DrainMode::Immediate),
            Err(_) => DrainMode::Immediate,
        };
        DrainBlocker(self.drained_tx, mode)
    }
}

#[must_use = "DrainBlocker should be dropped explicitly to release the runtime"]
pub struct DrainBlocker(#[allow(dead_code)] mpsc::Sender<Never>, DrainMode);

impl DrainBlocker {
    pub fn mode(&self) -> DrainMode {
        self.1
    }
}

impl std::fmt::Debug for DrainTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrainTrigger").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for DrainWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrainWatcher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn drain_waits_for_watchers() {
        let (trigger, watcher) = new();
        let held = watcher.clone();
        drop(watcher);
        let (done_tx, mut done_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            trigger.start_drain_and_wait(DrainMode::Graceful).await;
            let _ = done_tx.send(());
        });
        let blocker = held.wait_for_drain().await;
        assert_eq!(blocker.mode(), DrainMode::Graceful);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(done_rx.try_recv().is_err());
        drop(blocker);
        tokio::time::timeout(Duration::from_secs(1), done_rx)
            .await
            .expect("drain completes")
            .expect("sender alive");
    }

    #[tokio::test]
    async fn dropped_trigger_is_immediate() {
        let (trigger, watcher) = new();
        drop(trigger);
        let blocker = watcher.wait_for_drain().await;
        assert_eq!(blocker.mode(), DrainMode::Immediate);
    }
}
