// Copyright (c) 2025 the sensormux contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Ordered proximity-state notification.
//!
//! Callbacks must observe proximity transitions in the order they
//! happened. A single worker thread drains a FIFO of notification jobs;
//! enqueueing is non-blocking and transition order is the queue order.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

/// Observer of the "some proximity sensor is active" state.
pub trait ProximityActiveListener: Send + Sync {
    fn on_proximity_active(&self, active: bool);
}

enum Job {
    Notify { active: bool, listeners: Vec<Arc<dyn ProximityActiveListener>> },
    Shutdown,
}

pub(crate) struct ProximityNotifier {
    sender: mpsc::Sender<Job>,
    worker: Option<thread::JoinHandle<()>>,
}

impl ProximityNotifier {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let worker = thread::Builder::new()
            .name("sensormux-prox-notify".to_string())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    match job {
                        Job::Notify { active, listeners } => {
                            for listener in listeners {
                                listener.on_proximity_active(active);
                            }
                        }
                        Job::Shutdown => break,
                    }
                }
            })
            .ok();
        Self { sender, worker }
    }

    /// Queues one notification for the given listener snapshot.
    pub fn notify(&self, active: bool, listeners: Vec<Arc<dyn ProximityActiveListener>>) {
        if listeners.is_empty() {
            return;
        }
        if self.sender.send(Job::Notify { active, listeners }).is_err() {
            tracing::warn!("proximity notifier worker is gone; dropping notification");
        }
    }

    pub fn shutdown(&mut self) {
        let _ = self.sender.send(Job::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for ProximityNotifier {
    fn drop(&mut self) {
        self.shutdown();
    }
}
