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

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::directory::{Cluster, ClusterInventory, Error};
use crate::hyper_util;

/// MockInventory serves a settable cluster list.
#[derive(Default)]
pub struct MockInventory {
    clusters: Mutex<Vec<Cluster>>,
    projects: Mutex<Vec<String>>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl MockInventory {
    pub fn new(clusters: Vec<Cluster>) -> Self {
        MockInventory {
            clusters: Mutex::new(clusters),
            ..Default::default()
        }
    }

    pub fn set_clusters(&self, clusters: Vec<Cluster>) {
        *self.clusters.lock().unwrap() = clusters;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Projects listed so far, in order.
    pub fn projects(&self) -> Vec<String> {
        self.projects.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ClusterInventory for MockInventory {
    async fn list_clusters(&self, project: &str) -> Result<Vec<Cluster>, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.projects.lock().unwrap().push(project.to_string());
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Inventory {
                endpoint: "mock".to_string(),
                source: hyper_util::Error::Status {
                    status: hyper::StatusCode::SERVICE_UNAVAILABLE,
                    body: "unavailable".to_string(),
                },
            });
        }
        Ok(self.clusters.lock().unwrap().clone())
    }
}

pub fn running_cluster(name: &str, endpoint: &str, ca_certificate: &str) -> Cluster {
    Cluster {
        name: name.to_string(),
        endpoint: endpoint.to_string(),
        status: crate::directory::RUNNING.to_string(),
        ca_certificate: ca_certificate.to_string(),
    }
}
