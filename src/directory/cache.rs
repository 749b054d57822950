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

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustls::RootCertStore;
use tracing::{debug, info, warn};

use super::{ClusterInventory, ConnectInfo, Error};
use crate::drain::DrainWatcher;
use crate::identity::TokenProvider;
use crate::tls;

type Snapshot = HashMap<String, Arc<ConnectInfo>>;

/// Cache holds the endpoint directory of a project and keeps it fresh in the background.
///
/// Readers never block on a refresh: the snapshot is swapped whole, and the lock is only held
/// long enough to clone the pointer to it.
pub struct Cache {
    project: String,
    inventory: Arc<dyn ClusterInventory>,
    refresh_interval: Duration,
    snapshot: Mutex<Arc<Snapshot>>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("project", &self.project)
            .field("refresh_interval", &self.refresh_interval)
            .field("endpoints", &self.current().len())
            .finish()
    }
}

impl Cache {
    /// Performs the initial listing and starts the refresh loop, which runs until `drain`
    /// is signaled. `project` falls back to the default project of `credentials`.
    pub async fn new(
        project: Option<String>,
        credentials: &dyn TokenProvider,
        inventory: Arc<dyn ClusterInventory>,
        refresh_interval: Duration,
        drain: DrainWatcher,
    ) -> Result<Arc<Cache>, Error> {
        let project = match project {
            Some(p) => p,
            None => credentials
                .default_project()
                .await?
                .ok_or(Error::NoProject)?,
        };
        let initial = fetch(inventory.as_ref(), &project).await?;
        info!(%project, endpoints=initial.len(), "loaded cluster directory");
        let cache = Arc::new(Cache {
            project,
            inventory,
            refresh_interval,
            snapshot: Mutex::new(Arc::new(initial)),
        });
        tokio::spawn(cache.clone().run(drain));
        Ok(cache)
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    fn current(&self) -> Arc<Snapshot> {
        self.snapshot.lock().expect("mutex").clone()
    }

    /// Finds the entry for a host, with or without a `:port` suffix.
    pub fn lookup(&self, host: &str) -> Option<Arc<ConnectInfo>> {
        let key = strip_port(host).to_ascii_lowercase();
        self.current().get(&key).cloned()
    }

    /// An independent copy of the current directory.
    pub fn snapshot_copy(&self) -> HashMap<String, ConnectInfo> {
        self.current()
            .iter()
            .map(|(k, v)| (k.clone(), ConnectInfo::clone(v)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.current().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lists the project again and swaps in the result. On failure the current snapshot is kept.
    pub async fn refresh(&self) -> Result<(), Error> {
        let next = fetch(self.inventory.as_ref(), &self.project).await?;
        debug!(project=%self.project, endpoints=next.len(), "refreshed cluster directory");
        *self.snapshot.lock().expect("mutex") = Arc::new(next);
        Ok(())
    }

    async fn run(self: Arc<Self>, drain: DrainWatcher) {
        let stop = drain.wait_for_drain();
        tokio::pin!(stop);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.refresh_interval) => {
                    if let Err(e) = self.refresh().await {
                        warn!(project=%self.project, "failed to refresh cluster directory: {e}");
                    }
                }
                _blocker = &mut stop => {
                    debug!(project=%self.project, "cluster directory refresh stopped");
                    return;
                }
            }
        }
    }
}

async fn fetch(inventory: &dyn ClusterInventory, project: &str) -> Result<Snapshot, Error> {
    let clusters = inventory
        .list_clusters(project)
        .await
        .map_err(|e| Error::ListClusters {
            project: project.to_string(),
            source: Box::new(e),
        })?;
    let mut snapshot = Snapshot::with_capacity(clusters.len());
    for cluster in clusters {
        if !cluster.is_running() {
            info!(
                cluster=%cluster.name,
                status=%cluster.status,
                "skipping cluster that is not running"
            );
            continue;
        }
        let root_store = match tls::root_store_from_base64(&cluster.ca_certificate) {
            Ok(store) => store,
            Err(e) => {
                warn!(cluster=%cluster.name, "failed to load cluster CA: {e}");
                RootCertStore::empty()
            }
        };
        let key = cluster.endpoint.to_ascii_lowercase();
        snapshot.insert(
            key,
            Arc::new(ConnectInfo {
                name: cluster.name,
                endpoint: cluster.endpoint,
                ca_certificate: cluster.ca_certificate,
                root_store: Arc::new(root_store),
            }),
        );
    }
    Ok(snapshot)
}

/// Strips an optional port. Bracketed IPv6 literals lose their brackets; bare IPv6
/// literals are returned unchanged.
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split_once(']').map(|(h, _)| h).unwrap_or(rest);
    }
    match host.split_once(':') {
        Some((h, port)) if !port.contains(':') => h,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::Cluster;
    use crate::drain;
    use crate::test_helpers::directory::MockInventory;
    use crate::test_helpers::identity::MockTokenProvider;
    use crate::tls::mock::TestCa;
    use matches::assert_matches;
    use test_case::test_case;

    fn cluster(name: &str, endpoint: &str, status: &str, ca: &str) -> Cluster {
        Cluster {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            status: status.to_string(),
            ca_certificate: ca.to_string(),
        }
    }

    async fn cache_with(
        inventory: Arc<MockInventory>,
    ) -> (Arc<Cache>, drain::DrainTrigger) {
        let (trigger, watcher) = drain::new();
        let creds = MockTokenProvider::new("t");
        let cache = Cache::new(
            Some("proj".to_string()),
            &creds,
            inventory,
            Duration::from_secs(300),
            watcher,
        )
        .await
        .unwrap();
        (cache, trigger)
    }

    #[test_case("10.0.0.5", "10.0.0.5"; "bare")]
    #[test_case("10.0.0.5:443", "10.0.0.5"; "ipv4 with port")]
    #[test_case("api.example.com:8443", "api.example.com"; "dns with port")]
    #[test_case("[fd00::1]:443", "fd00::1"; "bracketed ipv6")]
    #[test_case("fd00::1", "fd00::1"; "bare ipv6")]
    fn strips_port(input: &str, expected: &str) {
        assert_eq!(strip_port(input), expected);
    }

    #[tokio::test]
    async fn builds_directory() {
        let ca = TestCa::new("c1-ca");
        let inventory = Arc::new(MockInventory::new(vec![
            cluster("c1", "10.0.0.5", "RUNNING", &ca.cert_base64()),
            cluster("c2", "10.0.0.6", "STOPPING", &ca.cert_base64()),
        ]));
        let (cache, _trigger) = cache_with(inventory).await;

        let info = cache.lookup("10.0.0.5").unwrap();
        assert_eq!(info.name, "c1");
        assert_eq!(info.root_store.len(), 1);
        let with_port = cache.lookup("10.0.0.5:443").unwrap();
        assert!(Arc::ptr_eq(&info, &with_port));
        assert!(cache.lookup("10.0.0.6").is_none());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn bad_ca_yields_empty_pool() {
        let inventory = Arc::new(MockInventory::new(vec![cluster(
            "c1", "10.0.0.5", "RUNNING", "%%%not-base64",
        )]));
        let (cache, _trigger) = cache_with(inventory).await;
        let info = cache.lookup("10.0.0.5").unwrap();
        assert!(info.root_store.is_empty());
    }

    #[tokio::test]
    async fn initial_failure_is_fatal() {
        let inventory = Arc::new(MockInventory::new(vec![]));
        inventory.set_failing(true);
        let (_trigger, watcher) = drain::new();
        let creds = MockTokenProvider::new("t");
        let res = Cache::new(
            Some("proj".to_string()),
            &creds,
            inventory,
            Duration::from_secs(1),
            watcher,
        )
        .await;
        assert_matches!(res, Err(Error::ListClusters { .. }));
    }

    #[tokio::test]
    async fn project_from_credentials() {
        let inventory = Arc::new(MockInventory::new(vec![]));
        let (_trigger, watcher) = drain::new();
        let creds = MockTokenProvider::new("t").with_project("from-creds");
        let cache = Cache::new(None, &creds, inventory.clone(), Duration::from_secs(1), watcher)
            .await
            .unwrap();
        assert_eq!(cache.project(), "from-creds");
        assert_eq!(inventory.projects(), vec!["from-creds"]);

        let (_trigger, watcher) = drain::new();
        let creds = MockTokenProvider::new("t");
        let res = Cache::new(None, &creds, inventory, Duration::from_secs(1), watcher).await;
        assert_matches!(res, Err(Error::NoProject));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_snapshot() {
        let inventory = Arc::new(MockInventory::new(vec![cluster(
            "c1", "10.0.0.5", "RUNNING", "",
        )]));
        let (cache, _trigger) = cache_with(inventory.clone()).await;
        inventory.set_failing(true);
        assert!(cache.refresh().await.is_err());
        assert_eq!(cache.lookup("10.0.0.5").unwrap().name, "c1");

        inventory.set_failing(false);
        inventory.set_clusters(vec![cluster("c9", "10.0.0.9", "RUNNING", "")]);
        cache.refresh().await.unwrap();
        assert!(cache.lookup("10.0.0.5").is_none());
        assert_eq!(cache.lookup("10.0.0.9").unwrap().name, "c9");
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_until_drained() {
        let inventory = Arc::new(MockInventory::new(vec![]));
        let (trigger, watcher) = drain::new();
        let creds = MockTokenProvider::new("t");
        let cache = Cache::new(
            Some("proj".to_string()),
            &creds,
            inventory.clone(),
            Duration::from_secs(10),
            watcher,
        )
        .await
        .unwrap();
        assert_eq!(inventory.calls(), 1);

        inventory.set_clusters(vec![cluster("c1", "10.0.0.5", "RUNNING", "")]);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(inventory.calls(), 2);
        assert!(cache.lookup("10.0.0.5").is_some());

        trigger.start_drain_and_wait(drain::DrainMode::Graceful).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(inventory.calls(), 2);
        // Reads keep working after the loop stops.
        assert!(cache.lookup("10.0.0.5").is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn readers_see_whole_snapshots() {
        let generation = |g: &str| {
            vec![
                cluster(g, "10.0.0.1", "RUNNING", ""),
                cluster(g, "10.0.0.2", "RUNNING", ""),
            ]
        };
        let inventory = Arc::new(MockInventory::new(generation("a")));
        let (cache, _trigger) = cache_with(inventory.clone()).await;

        let mut readers = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            readers.push(tokio::spawn(async move {
                for _ in 0..500 {
                    let snap = cache.snapshot_copy();
                    assert_eq!(snap.len(), 2);
                    assert_eq!(snap["10.0.0.1"].name, snap["10.0.0.2"].name);
                    tokio::task::yield_now().await;
                }
            }));
        }
        for i in 0..100 {
            inventory.set_clusters(generation(if i % 2 == 0 { "b" } else { "a" }));
            cache.refresh().await.unwrap();
        }
        for r in futures::future::join_all(readers).await {
            r.unwrap();
        }
    }
}
