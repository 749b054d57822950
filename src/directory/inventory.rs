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

use std::sync::Arc;

use hyper::Request;
use hyper::header::AUTHORIZATION;
use serde::Deserialize;

use super::{Cluster, ClusterInventory, Error};
use crate::hyper_util::{self, HttpsClient};
use crate::identity::TokenProvider;

pub const CONTAINER_API_URL: &str = "https://container.googleapis.com";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListClustersResponse {
    #[serde(default)]
    clusters: Vec<GkeCluster>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GkeCluster {
    name: String,
    #[serde(default)]
    endpoint: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    master_auth: MasterAuth,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct MasterAuth {
    #[serde(default)]
    cluster_ca_certificate: String,
}

impl From<GkeCluster> for Cluster {
    fn from(c: GkeCluster) -> Self {
        Cluster {
            name: c.name,
            endpoint: c.endpoint,
            status: c.status,
            ca_certificate: c.master_auth.cluster_ca_certificate,
        }
    }
}

/// GkeInventory lists clusters across every location of a project through the container API.
pub struct GkeInventory {
    client: HttpsClient,
    credentials: Arc<dyn TokenProvider>,
    base_url: String,
}

impl GkeInventory {
    pub fn new(client: HttpsClient, credentials: Arc<dyn TokenProvider>) -> Self {
        GkeInventory {
            client,
            credentials,
            base_url: CONTAINER_API_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait::async_trait]
impl ClusterInventory for GkeInventory {
    async fn list_clusters(&self, project: &str) -> Result<Vec<Cluster>, Error> {
        let token = self.credentials.fetch_token().await?;
        let endpoint = format!(
            "{}/v1/projects/{project}/locations/-/clusters",
            self.base_url
        );
        let req = Request::get(&endpoint)
            .header(AUTHORIZATION, token.authorization())
            .body(hyper_util::empty())?;
        let resp: ListClustersResponse = hyper_util::fetch_json(&self.client, req)
            .await
            .map_err(|source| Error::Inventory { endpoint, source })?;
        Ok(resp.clusters.into_iter().map(Cluster::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_listing() {
        let raw = r#"{
            "clusters": [
                {"name": "c1", "endpoint": "10.0.0.5", "status": "RUNNING",
                 "masterAuth": {"clusterCaCertificate": "Zm9v"}},
                {"name": "c2", "status": "PROVISIONING"}
            ],
            "missingZones": []
        }"#;
        let resp: ListClustersResponse = serde_json::from_str(raw).unwrap();
        let clusters: Vec<Cluster> = resp.clusters.into_iter().map(Cluster::from).collect();
        assert_eq!(
            clusters[0],
            Cluster {
                name: "c1".to_string(),
                endpoint: "10.0.0.5".to_string(),
                status: "RUNNING".to_string(),
                ca_certificate: "Zm9v".to_string(),
            }
        );
        assert!(clusters[0].is_running());
        assert!(!clusters[1].is_running());
        assert_eq!(clusters[1].ca_certificate, "");
    }

    #[test]
    fn decodes_empty_listing() {
        let resp: ListClustersResponse = serde_json::from_str("{}").unwrap();
        assert!(resp.clusters.is_empty());
    }
}
