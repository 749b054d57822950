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

use std::env;
use std::time::Instant;

use once_cell::sync::Lazy;
use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing::{Event, Subscriber, info, warn};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields, format};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{Layer, Registry, filter, filter::EnvFilter, prelude::*, reload};

pub static APPLICATION_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);
static LOG_HANDLE: OnceCell<LogHandle> = OnceCell::new();

/// Installs the global subscriber. Honors `RUST_LOG` for filtering and `LOG_FORMAT=json` for
/// structured output.
pub fn setup_logging() {
    Lazy::force(&APPLICATION_START_TIME);
    tracing_subscriber::registry().with(fmt_layer()).init();
}

fn json_fmt() -> BoxLayer {
    let format = tracing_subscriber::fmt::format().json().flatten_event(true);
    let format = tracing_subscriber::fmt::layer()
        .event_format(format)
        .fmt_fields(format::JsonFields::default());
    Box::new(format)
}

fn plain_fmt() -> BoxLayer {
    let format = tracing_subscriber::fmt::layer().event_format(PlainFormat);
    Box::new(format)
}

fn fmt_layer() -> BoxLayer {
    let format = if env::var("LOG_FORMAT").unwrap_or("plain".to_string()) == "json" {
        json_fmt()
    } else {
        plain_fmt()
    };
    let (layer, reload) = reload::Layer::new(format.with_filter(default_env_filter()));
    LOG_HANDLE
        .set(reload)
        .map_or_else(|_| warn!("setup log handler failed"), |_| {});
    Box::new(layer)
}

fn default_level() -> &'static str {
    "info"
}

fn default_env_filter() -> EnvFilter {
    // hyper and rustls are chatty at debug; keep them at info unless explicitly asked for.
    let base = format!("hyper=info,rustls=info,{}", default_level());
    let var = env::var(EnvFilter::DEFAULT_ENV)
        .map(|v| format!("{base},{v}"))
        .unwrap_or(base);
    EnvFilter::builder()
        .with_regex(false)
        .parse(var)
        .unwrap_or_else(|_| EnvFilter::new(default_level()))
}

type BoxLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;
type FilteredLayer = filter::Filtered<BoxLayer, EnvFilter, Registry>;
type LogHandle = reload::Handle<FilteredLayer, Registry>;

/// set_level dynamically updates the logging level to *include* level. If `reset` is true, it will
/// reset the entire logging configuration first.
pub fn set_level(reset: bool, level: &str) -> Result<(), Error> {
    let Some(handle) = LOG_HANDLE.get() else {
        warn!("failed to get log handle");
        return Err(Error::Uninitialized);
    };
    let new_directive = match handle.with_current(|f| f.filter().to_string()) {
        Ok(_) if reset => format!("{},{}", default_env_filter(), level),
        Ok(current) => format!("{current},{level}"),
        Err(_) => level.to_string(),
    };
    let new_filter = EnvFilter::builder().parse(new_directive)?;
    info!("new log filter is {new_filter}");
    Ok(handle.modify(|layer| {
        *layer.filter_mut() = new_filter;
    })?)
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("parse failure: {0}")]
    InvalidFilter(#[from] filter::ParseError),
    #[error("reload failure: {0}")]
    Reload(#[from] reload::Error),
    #[error("logging is not initialized")]
    Uninitialized,
}

/// Tab separated `time level target[:span{fields}] message k=v` lines.
struct PlainFormat;

impl<S, N> FormatEvent<S, N> for PlainFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        use tracing_log::NormalizeEvent;
        use tracing_subscriber::fmt::time::{FormatTime, SystemTime};

        let normalized_meta = event.normalized_metadata();
        let meta = normalized_meta.as_ref().unwrap_or_else(|| event.metadata());
        SystemTime.format_time(&mut writer)?;
        write!(
            writer,
            "\t{}\t",
            meta.level().to_string().to_ascii_lowercase()
        )?;

        let target = meta.target();
        write!(
            writer,
            "{}",
            target.strip_prefix("iap_proxy::").unwrap_or(target)
        )?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, ":{}", span.metadata().name())?;
                let ext = span.extensions();
                if let Some(fields) = &ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
            }
        };
        write!(writer, "\t")?;
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
