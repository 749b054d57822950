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
use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use regex::Regex;
use url::Url;

use crate::identity::CredentialSource;

const PORT: &str = "PORT";
const PROJECT: &str = "PROJECT";
const KEY_FILE: &str = "KEY_FILE";
const CERTIFICATE_FILE: &str = "CERTIFICATE_FILE";
const DEBUG: &str = "DEBUG";
const REFRESH_INTERVAL: &str = "REFRESH_INTERVAL";
const TERMINATION_GRACE_PERIOD: &str = "TERMINATION_GRACE_PERIOD";
const CREDENTIALS_TOKEN_FILE: &str = "CREDENTIALS_TOKEN_FILE";
const USE_DEFAULT_CREDENTIALS: &str = "USE_DEFAULT_CREDENTIALS";

const TARGET_URL: &str = "TARGET_URL";
const IAP_AUDIENCE: &str = "IAP_AUDIENCE";
const SERVICE_ACCOUNT: &str = "SERVICE_ACCOUNT";
const TO_GKE: &str = "TO_GKE";
const TO_HOST: &str = "TO_HOST";
const HTTP_PROTOCOL: &str = "HTTP_PROTOCOL";
const HEADER_INJECTION_MODE: &str = "HEADER_INJECTION_MODE";
const IN_SCOPE_ACTION: &str = "IN_SCOPE_ACTION";
const OUT_OF_SCOPE_ACTION: &str = "OUT_OF_SCOPE_ACTION";

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_DRAIN_DURATION: Duration = Duration::from_secs(5);

/// Where the credential injected by the client proxy is placed.
#[derive(serde::Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum HeaderInjectionMode {
    /// Injected token goes into `Authorization` when the caller did not send one, and into
    /// `Proxy-Authorization` otherwise.
    Authorization,
    /// Caller's `Authorization` is left alone, the injected token goes into `Proxy-Authorization`.
    ProxyAuthorization,
    /// Caller's `Authorization` moves to `X-Real-Authorization`, the injected token takes its slot.
    #[default]
    RenameThenAuthorization,
}

impl FromStr for HeaderInjectionMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "authorization" => Ok(HeaderInjectionMode::Authorization),
            "proxy-authorization" | "proxyauthorization" => {
                Ok(HeaderInjectionMode::ProxyAuthorization)
            }
            "rename-then-authorization" | "renamethenauthorization" | "rename" => {
                Ok(HeaderInjectionMode::RenameThenAuthorization)
            }
            _ => Err(()),
        }
    }
}

/// CONNECT disposition for destinations that pass the interception gate.
#[derive(serde::Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum InScopeAction {
    #[default]
    Mitm,
    HttpMitm,
}

impl FromStr for InScopeAction {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mitm" => Ok(InScopeAction::Mitm),
            "http-mitm" | "httpmitm" => Ok(InScopeAction::HttpMitm),
            _ => Err(()),
        }
    }
}

/// CONNECT disposition for everything else.
#[derive(serde::Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum OutOfScopeAction {
    #[default]
    Accept,
    Reject,
}

impl FromStr for OutOfScopeAction {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "accept" => Ok(OutOfScopeAction::Accept),
            "reject" => Ok(OutOfScopeAction::Reject),
            _ => Err(()),
        }
    }
}

/// Settings shared by both proxies.
#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct SharedConfig {
    pub listen_addr: SocketAddr,
    /// Project whose clusters are listed. Falls back to the credential's default project.
    pub project: Option<String>,
    pub key_file: Option<PathBuf>,
    pub certificate_file: Option<PathBuf>,
    pub debug: bool,
    pub refresh_interval: Duration,
    pub termination_grace_period: Duration,
    pub credentials: CredentialSource,
}

#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    #[serde(flatten)]
    pub shared: SharedConfig,
    /// The access-proxy front door every in-scope request is sent to.
    pub target_url: Url,
    pub audience: String,
    pub service_account: String,
    /// Intercept traffic for the endpoints of running clusters in the project.
    pub to_gke: bool,
    /// Intercept traffic for hosts matching any of these regular expressions.
    pub to_hosts: Vec<String>,
    /// Serve the proxy listener over plain HTTP.
    pub plaintext: bool,
    pub injection_mode: HeaderInjectionMode,
    pub in_scope_action: InScopeAction,
    pub out_of_scope_action: OutOfScopeAction,
}

#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    #[serde(flatten)]
    pub shared: SharedConfig,
}

impl ServerConfig {
    /// Without a key pair the reverse proxy serves plain HTTP, which is only
    /// suitable behind a TLS terminating load balancer.
    pub fn plaintext(&self) -> bool {
        self.shared.key_file.is_none()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid env var {0}={1}")]
    EnvVar(String, String),
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("invalid target url {0}, {1}")]
    InvalidTargetUrl(String, url::ParseError),
    #[error("target url {0} must be https")]
    TargetNotHttps(String),
    #[error("at least one of TO_GKE or TO_HOST must be specified")]
    NoDestinations,
    #[error("invalid TO_HOST value {0}, {1}")]
    InvalidHostPattern(String, regex::Error),
    #[error("specify either USE_DEFAULT_CREDENTIALS or CREDENTIALS_TOKEN_FILE, not both")]
    ConflictingCredentials,
    #[error("both KEY_FILE and CERTIFICATE_FILE are required")]
    IncompleteKeyPair,
}

/// Environment snapshot the configuration is built from.
#[derive(Clone, Debug, Default)]
pub struct Vars(HashMap<String, String>);

impl Vars {
    pub fn from_env() -> Self {
        Vars(std::env::vars().collect())
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Vars {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Vars(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// GoDuration accepts durations written like `5m`, `30s` or `1h30m`.
struct GoDuration(Duration);

impl FromStr for GoDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        duration_str::parse(s).map(GoDuration)
    }
}

fn parse<T: FromStr>(vars: &Vars, env: &str) -> Result<Option<T>, Error> {
    match vars.get(env) {
        Some(val) => val
            .parse()
            .map(Some)
            .map_err(|_| Error::EnvVar(env.to_string(), val.to_string())),
        None => Ok(None),
    }
}

fn parse_default<T: FromStr>(vars: &Vars, env: &str, default: T) -> Result<T, Error> {
    parse(vars, env).map(|v| v.unwrap_or(default))
}

fn required(vars: &Vars, env: &'static str) -> Result<String, Error> {
    vars.get(env)
        .map(str::to_string)
        .ok_or(Error::Missing(env))
}

pub fn parse_client_config() -> Result<ClientConfig, Error> {
    construct_client_config(&Vars::from_env())
}

pub fn parse_server_config() -> Result<ServerConfig, Error> {
    construct_server_config(&Vars::from_env())
}

fn construct_shared_config(vars: &Vars) -> Result<SharedConfig, Error> {
    let token_file: Option<PathBuf> = parse(vars, CREDENTIALS_TOKEN_FILE)?;
    let use_default: bool = parse_default(vars, USE_DEFAULT_CREDENTIALS, false)?;
    let credentials = match (use_default, token_file) {
        (true, Some(_)) => return Err(Error::ConflictingCredentials),
        (_, Some(path)) => CredentialSource::TokenFile(path),
        (_, None) => CredentialSource::Metadata,
    };

    let key_file: Option<PathBuf> = parse(vars, KEY_FILE)?;
    let certificate_file: Option<PathBuf> = parse(vars, CERTIFICATE_FILE)?;
    if key_file.is_some() != certificate_file.is_some() {
        return Err(Error::IncompleteKeyPair);
    }

    Ok(SharedConfig {
        listen_addr: SocketAddr::new(
            IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            parse_default(vars, PORT, DEFAULT_PORT)?,
        ),
        project: parse(vars, PROJECT)?,
        key_file,
        certificate_file,
        debug: parse_default(vars, DEBUG, false)?,
        refresh_interval: parse::<GoDuration>(vars, REFRESH_INTERVAL)?
            .map(|d| d.0)
            .unwrap_or(DEFAULT_REFRESH_INTERVAL),
        termination_grace_period: parse::<GoDuration>(vars, TERMINATION_GRACE_PERIOD)?
            .map(|d| d.0)
            .unwrap_or(DEFAULT_DRAIN_DURATION),
        credentials,
    })
}

pub fn construct_client_config(vars: &Vars) -> Result<ClientConfig, Error> {
    let shared = construct_shared_config(vars)?;
    // The client presents its key pair to callers and signs intercepted hosts with it.
    if shared.key_file.is_none() {
        return Err(Error::Missing(KEY_FILE));
    }

    let raw_target = required(vars, TARGET_URL)?;
    let target_url =
        Url::parse(&raw_target).map_err(|e| Error::InvalidTargetUrl(raw_target.clone(), e))?;
    if target_url.scheme() != "https" {
        return Err(Error::TargetNotHttps(raw_target));
    }

    let audience = required(vars, IAP_AUDIENCE)?;
    let service_account = required(vars, SERVICE_ACCOUNT)?;

    let to_gke = parse_default(vars, TO_GKE, false)?;
    let to_hosts: Vec<String> = vars
        .get(TO_HOST)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if !to_gke && to_hosts.is_empty() {
        return Err(Error::NoDestinations);
    }
    for pattern in &to_hosts {
        Regex::new(pattern).map_err(|e| Error::InvalidHostPattern(pattern.clone(), e))?;
    }

    Ok(ClientConfig {
        shared,
        target_url,
        audience,
        service_account,
        to_gke,
        to_hosts,
        plaintext: parse_default(vars, HTTP_PROTOCOL, false)?,
        injection_mode: parse_default(vars, HEADER_INJECTION_MODE, Default::default())?,
        in_scope_action: parse_default(vars, IN_SCOPE_ACTION, Default::default())?,
        out_of_scope_action: parse_default(vars, OUT_OF_SCOPE_ACTION, Default::default())?,
    })
}

pub fn construct_server_config(vars: &Vars) -> Result<ServerConfig, Error> {
    Ok(ServerConfig {
        shared: construct_shared_config(vars)?,
    })
}

impl fmt::Display for HeaderInjectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HeaderInjectionMode::Authorization => "authorization",
            HeaderInjectionMode::ProxyAuthorization => "proxy-authorization",
            HeaderInjectionMode::RenameThenAuthorization => "rename-then-authorization",
        };
        f.write_str(s)
    }
}
