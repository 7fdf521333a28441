use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use log::{info, warn};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval_at, sleep, Instant};

use crate::condition::{ConditionValue, Value, SERVICE_NAME_VALUE};
use crate::events::{Event, EventBus, EventKind};
use crate::flag::{normalize_flag_name, normalize_service_name, Flag};

/// Name of the flag whose raw value is the toggle server base URL. It is
/// looked up globally when the client connects; an empty value disables
/// remote coordination.
pub const SERVER_ADDRESS_FLAG: &str = "TOGGLE_SERVER";

const FEATURE_PREFIX: &str = "FEATURE_";
const GLOBAL_PREFIX: &str = "_GLOBAL__";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30 * 60);
const DEFAULT_API_PATH: &str = "/flags";
const SEED_TIMEOUT: Duration = Duration::from_secs(10);

type FlagStore = HashMap<String, Vec<Flag>>;

/// Options of a single flag lookup.
#[derive(Clone, Debug, Default)]
pub struct Lookup {
    global: bool,
    values: Vec<ConditionValue>,
}

impl Lookup {
    pub fn new() -> Lookup {
        Lookup::default()
    }

    /// Permits global flags to match this lookup.
    pub fn global(mut self) -> Lookup {
        self.global = true;
        self
    }

    /// Adds an integer value for the flag's condition.
    pub fn for_int(self, name: impl Into<String>, value: i64) -> Lookup {
        self.for_value(name, value)
    }

    /// Adds a float value for the flag's condition.
    pub fn for_float(self, name: impl Into<String>, value: f64) -> Lookup {
        self.for_value(name, value)
    }

    /// Adds a boolean value for the flag's condition.
    pub fn for_bool(self, name: impl Into<String>, value: bool) -> Lookup {
        self.for_value(name, value)
    }

    /// Adds a string value for the flag's condition.
    pub fn for_string(self, name: impl Into<String>, value: impl Into<String>) -> Lookup {
        self.for_value(name, value.into())
    }

    fn for_value(mut self, name: impl Into<String>, value: impl Into<Value>) -> Lookup {
        self.values.push(ConditionValue::new(name, value));
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("seeding flags to {url}: {source}")]
    Seed {
        url: String,
        #[source]
        source: RequestError,
    },
    #[error("polling flags from {url}: {source}")]
    Poll {
        url: String,
        #[source]
        source: RequestError,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(reqwest::StatusCode),
}

/// The long-lived per-service flag client.
///
/// Lookups run on caller threads against an in-memory index;
/// [Client::connect] starts the background task that keeps the index
/// coherent with the toggle server.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    values: Vec<ConditionValue>,
    bus: Option<Arc<dyn EventBus>>,
    poll_interval: Duration,
    http: reqwest::Client,
    api_path: String,
    store: RwLock<FlagStore>,
}

pub struct ClientBuilder {
    name: String,
    values: Vec<ConditionValue>,
    bus: Option<Arc<dyn EventBus>>,
    poll_interval: Duration,
    http: Option<reqwest::Client>,
    api_path: String,
}

impl ClientBuilder {
    fn new(service_name: &str) -> ClientBuilder {
        ClientBuilder {
            name: normalize_service_name(service_name),
            values: Vec::new(),
            bus: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            http: None,
            api_path: DEFAULT_API_PATH.to_string(),
        }
    }

    /// Adds a condition value available to every lookup.
    pub fn value(mut self, value: ConditionValue) -> ClientBuilder {
        self.values.push(value);
        self
    }

    /// Sets the event bus used to receive flag updates.
    pub fn event_bus(mut self, bus: Arc<dyn EventBus>) -> ClientBuilder {
        self.bus = Some(bus);
        self
    }

    /// Sets the poll cycle duration. Defaults to 30 minutes.
    pub fn poll_interval(mut self, interval: Duration) -> ClientBuilder {
        self.poll_interval = interval;
        self
    }

    /// Sets the HTTP client used to reach the toggle server.
    pub fn http_client(mut self, http: reqwest::Client) -> ClientBuilder {
        self.http = Some(http);
        self
    }

    /// Sets the server API base path. Defaults to `/flags`.
    pub fn api_path(mut self, path: impl Into<String>) -> ClientBuilder {
        self.api_path = path.into();
        self
    }

    pub fn build(self) -> Client {
        // The service name is always present as a condition value.
        let mut values = vec![ConditionValue::new(SERVICE_NAME_VALUE, self.name.clone())];
        values.extend(self.values);

        Client {
            inner: Arc::new(Inner {
                name: self.name,
                values,
                bus: self.bus,
                poll_interval: self.poll_interval,
                http: self.http.unwrap_or_default(),
                api_path: self.api_path,
                store: RwLock::new(FlagStore::new()),
            }),
        }
    }
}

impl Client {
    /// Creates a client for the given service with default options.
    pub fn new(service_name: &str) -> Client {
        Client::builder(service_name).build()
    }

    pub fn builder(service_name: &str) -> ClientBuilder {
        ClientBuilder::new(service_name)
    }

    pub fn service_name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the boolean value of the flag.
    pub fn get(&self, name: &str) -> bool {
        self.get_with(name, &Lookup::default())
    }

    pub fn get_with(&self, name: &str, lookup: &Lookup) -> bool {
        self.flag(name, lookup).value
    }

    /// Returns the raw string value of the flag.
    pub fn get_raw(&self, name: &str) -> String {
        self.get_raw_with(name, &Lookup::default())
    }

    pub fn get_raw_with(&self, name: &str, lookup: &Lookup) -> String {
        self.flag(name, lookup).raw_value
    }

    fn flag(&self, name: &str, lookup: &Lookup) -> Flag {
        let name = normalize_flag_name(name);
        let store = self.inner.store.read().unwrap_or_else(PoisonError::into_inner);

        let Some(flags) = store.get(&name) else {
            return Flag::default();
        };

        for flag in flags {
            if flag.service_name != self.inner.name
                && !(flag.service_name.is_empty() && lookup.global)
            {
                continue;
            }

            let mut values = self.inner.values.clone();
            values.extend_from_slice(&lookup.values);
            if !flag.condition.matches(&values) {
                // The first candidate decides: a global fallback must not
                // mask a service-specific non-match.
                break;
            }

            return flag.clone();
        }

        Flag::default()
    }

    /// Seeds the store from `KEY=VALUE` environment entries, replacing its
    /// whole contents.
    ///
    /// Only `FEATURE_`-prefixed keys count. The segment after the prefix is
    /// the service name up to the first `_` and the flag name after it,
    /// unless it starts with `_GLOBAL__`, which marks the flag global.
    /// Entries of other services, without a `=`, or with an empty value are
    /// ignored. The value is true iff it case-folds to one of `1`, `y`,
    /// `yes`, `t`, `true`.
    pub fn parse_env<I, S>(&self, env: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut flags = FlagStore::new();

        for entry in env {
            let entry = entry.as_ref();
            let Some(rest) = entry.strip_prefix(FEATURE_PREFIX) else {
                continue;
            };
            let Some((key, raw_value)) = rest.split_once('=') else {
                continue;
            };
            if raw_value.is_empty() {
                continue;
            }

            let (service_name, key) = match key.strip_prefix(GLOBAL_PREFIX) {
                Some(key) => ("", key),
                None => match key.split_once('_') {
                    Some((service_name, key)) => (service_name, key),
                    None => continue,
                },
            };

            let value = matches!(
                raw_value.to_lowercase().as_str(),
                "1" | "y" | "yes" | "t" | "true"
            );

            let name = normalize_flag_name(key);
            let service_name = normalize_service_name(service_name);
            if service_name != self.inner.name && !service_name.is_empty() {
                continue;
            }

            flags.entry(name.clone()).or_default().push(Flag {
                name,
                service_name,
                raw_value: raw_value.to_string(),
                value,
                ..Flag::default()
            });
        }

        let mut store = self.inner.store.write().unwrap_or_else(PoisonError::into_inner);
        *store = flags;
    }

    /// Starts the background coordination task and returns its error
    /// channel.
    ///
    /// When the [SERVER_ADDRESS_FLAG] flag is unset the channel comes back
    /// already closed and nothing runs. Otherwise the task seeds the server
    /// with the current store, retrying with linear backoff, then consumes
    /// bus events and polls on the configured interval until `shutdown`
    /// fires. Recoverable errors are emitted on the channel and never stop
    /// the task.
    pub fn connect(&self, shutdown: broadcast::Receiver<()>) -> mpsc::Receiver<ClientError> {
        let (tx, rx) = mpsc::channel(1);

        let client = self.clone();
        tokio::spawn(async move {
            client.run(shutdown, tx).await;
        });

        rx
    }

    async fn run(&self, mut shutdown: broadcast::Receiver<()>, errors: mpsc::Sender<ClientError>) {
        let addr = self.get_raw_with(SERVER_ADDRESS_FLAG, &Lookup::new().global());
        if addr.is_empty() {
            return;
        }

        if !self.seed_until_ready(&addr, &mut shutdown, &errors).await {
            return;
        }

        let mut events = match &self.inner.bus {
            Some(bus) => Some(bus.receiver().await),
            None => None,
        };

        let mut poll = interval_at(
            Instant::now() + self.inner.poll_interval,
            self.inner.poll_interval,
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                event = next_event(&mut events) => match event {
                    Some(event) => self.apply_event(event),
                    // The bus ended; continue with polling only.
                    None => events = None,
                },
                _ = poll.tick() => {
                    // Shutting down aborts an in-flight poll.
                    let result = tokio::select! {
                        _ = shutdown.recv() => return,
                        result = self.poll(&addr) => result,
                    };
                    if let Err(err) = result {
                        warn!("polling flags: {err}");
                        tokio::select! {
                            _ = shutdown.recv() => return,
                            _ = errors.send(err) => {}
                        }
                    }
                }
            }
        }
    }

    /// SEED state: posts the current store until the server accepts it.
    /// Returns false when shut down while retrying.
    async fn seed_until_ready(
        &self,
        addr: &str,
        shutdown: &mut broadcast::Receiver<()>,
        errors: &mpsc::Sender<ClientError>,
    ) -> bool {
        let mut backoff = 1_u64;

        loop {
            let result = tokio::select! {
                _ = shutdown.recv() => return false,
                result = self.seed(addr) => result,
            };

            match result {
                Ok(()) => return true,
                Err(err) => {
                    let retry = Duration::from_secs(backoff);
                    warn!("sending the seed flags: {err}; retry in {retry:?}");
                    backoff += 1;

                    tokio::select! {
                        _ = shutdown.recv() => return false,
                        _ = errors.send(err) => {}
                    }
                    tokio::select! {
                        _ = shutdown.recv() => return false,
                        _ = sleep(retry) => {}
                    }
                }
            }
        }
    }

    async fn seed(&self, addr: &str) -> Result<(), ClientError> {
        info!("sending initial environment flags to the server");

        let snapshot: Vec<Flag> = {
            let store = self.inner.store.read().unwrap_or_else(PoisonError::into_inner);
            store.values().flatten().cloned().collect()
        };

        let url = self.url(addr, &["initial"]);
        let request = self
            .inner
            .http
            .post(&url)
            .timeout(SEED_TIMEOUT)
            .json(&snapshot);

        match self.request_flags(request).await {
            Ok(flags) => {
                self.replace_store(flags);
                Ok(())
            }
            Err(source) => Err(ClientError::Seed { url, source }),
        }
    }

    async fn poll(&self, addr: &str) -> Result<(), ClientError> {
        info!("polling for flags");

        let url = self.url(addr, &[]);
        match self.request_flags(self.inner.http.get(&url)).await {
            Ok(flags) => {
                self.replace_store(flags);
                Ok(())
            }
            Err(source) => Err(ClientError::Poll { url, source }),
        }
    }

    async fn request_flags(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<Vec<Flag>, RequestError> {
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(RequestError::Status(response.status()));
        }
        Ok(response.json().await?)
    }

    /// Joins the server address, API path, service name and any trailing
    /// segments into a request URL.
    fn url(&self, addr: &str, segments: &[&str]) -> String {
        let mut url = format!(
            "{}/{}/{}",
            addr.trim_end_matches('/'),
            self.inner.api_path.trim_matches('/'),
            self.inner.name,
        );
        for segment in segments {
            url.push('/');
            url.push_str(segment);
        }
        url
    }

    /// Builds a fresh normalized index from the list and swaps it in
    /// atomically; readers see either the old or the new map in full.
    fn replace_store(&self, flags: Vec<Flag>) {
        let mut fresh = FlagStore::new();
        for flag in flags {
            let flag = flag.normalized();
            fresh.entry(flag.name.clone()).or_default().push(flag);
        }

        let mut store = self.inner.store.write().unwrap_or_else(PoisonError::into_inner);
        *store = fresh;
    }

    /// Applies a bus event to the store in place. Flags of other services
    /// are dropped; error events are only logged.
    fn apply_event(&self, event: Event) {
        match event.kind {
            EventKind::Error => {
                warn!("received an error event: {}", event.error);
                return;
            }
            EventKind::Save | EventKind::Delete => {}
        }

        let flags: Vec<Flag> = event
            .flags
            .iter()
            .map(Flag::normalized)
            .filter(|f| f.service_name == self.inner.name || f.service_name.is_empty())
            .collect();

        info!("applying {:?} event with {} flags", event.kind, flags.len());

        let mut store = self.inner.store.write().unwrap_or_else(PoisonError::into_inner);
        match event.kind {
            EventKind::Save => {
                for flag in flags {
                    let stored = store.entry(flag.name.clone()).or_default();
                    match stored
                        .iter_mut()
                        .find(|f| f.service_name == flag.service_name)
                    {
                        Some(existing) => *existing = flag,
                        None => stored.push(flag),
                    }
                }
            }
            EventKind::Delete => {
                for flag in flags {
                    if let Some(stored) = store.get_mut(&flag.name) {
                        stored.retain(|f| f.service_name != flag.service_name);
                        if stored.is_empty() {
                            store.remove(&flag.name);
                        }
                    }
                }
            }
            EventKind::Error => {}
        }
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<Event>>) -> Option<Event> {
    match events {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

impl Serialize for Client {
    /// Serializes as `{"opts": {"path", "values"}, "flags": [..]}` with the
    /// flags sorted by `(name, service)`.
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        #[derive(Serialize)]
        struct Opts<'a> {
            path: &'a str,
            values: &'a [ConditionValue],
        }

        let mut flags: Vec<Flag> = {
            let store = self.inner.store.read().unwrap_or_else(PoisonError::into_inner);
            store.values().flatten().cloned().collect()
        };
        flags.sort_by(|a, b| (&a.name, &a.service_name).cmp(&(&b.name, &b.service_name)));

        let mut state = serializer.serialize_struct("Client", 2)?;
        state.serialize_field(
            "opts",
            &Opts {
                path: &self.inner.api_path,
                values: &self.inner.values,
            },
        )?;
        state.serialize_field("flags", &flags)?;
        state.end()
    }
}
