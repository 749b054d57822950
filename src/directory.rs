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

use std::fmt;
use std::sync::Arc;

use rustls::RootCertStore;

use crate::{hyper_util, identity};

mod cache;
pub use cache::*;

mod inventory;
pub use inventory::*;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no project configured and the credentials do not name one")]
    NoProject,
    #[error("credentials: {0}")]
    Credentials(#[from] identity::Error),
    #[error("{endpoint}: {source}")]
    Inventory {
        endpoint: String,
        source: hyper_util::Error,
    },
    #[error("invalid request: {0}")]
    Request(#[from] http::Error),
    #[error("listing clusters in {project}: {source}")]
    ListClusters {
        project: String,
        source: Box<Error>,
    },
}

/// Cluster is one entry of the inventory listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cluster {
    pub name: String,
    pub endpoint: String,
    pub status: String,
    /// Base64 encoded PEM bundle of the cluster's CA.
    pub ca_certificate: String,
}

impl Cluster {
    pub fn is_running(&self) -> bool {
        self.status == RUNNING
    }
}

pub const RUNNING: &str = "RUNNING";

/// ConnectInfo is what a proxy needs to reach one cluster endpoint. Entries are replaced on
/// refresh, never mutated.
#[derive(Clone)]
pub struct ConnectInfo {
    pub name: String,
    pub endpoint: String,
    pub ca_certificate: String,
    /// Trust pool built from `ca_certificate`. Empty when it could not be parsed.
    pub root_store: Arc<RootCertStore>,
}

impl fmt::Debug for ConnectInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectInfo")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("roots", &self.root_store.len())
            .finish()
    }
}

/// ClusterInventory lists the clusters of a project.
#[async_trait::async_trait]
pub trait ClusterInventory: Send + Sync {
    async fn list_clusters(&self, project: &str) -> Result<Vec<Cluster>, Error>;
}
