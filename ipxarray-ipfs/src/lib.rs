//! A concrete implementation of the `ipxarray::Mapper` interface for IPFS.
//!
//! Reads go through an HTTP gateway, writes and pin management through the Kubo RPC API. All
//! requests share one admission semaphore, and transient failures are retried with capped
//! exponential backoff.
//!
mod config;
mod retry;

use std::{collections::BTreeMap, future::Future, io, str::FromStr, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, RANGE},
    multipart::{Form, Part},
    Client, RequestBuilder, StatusCode,
};
use serde::{de::IgnoredAny, Deserialize};
use tokio::sync::Semaphore;
use tracing::{debug, trace};

use ipxarray::{ByteRange, ContentCodec, Error, Mapper, Pin, Result};

pub use config::{IpfsConfig, RetryPolicy};

use retry::with_backoff;

pub struct IpfsMapper {
    client: Client,
    config: IpfsConfig,
    admission: Arc<Semaphore>,
}

impl IpfsMapper {
    pub fn new(config: IpfsConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_str(name)
                .map_err(|err| invalid_config(format!("header name {name:?}: {err}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| invalid_config(format!("header value for {name}: {err}")))?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .timeout(config.timeout())
            .default_headers(headers)
            .build()
            .map_err(|err| invalid_config(err.to_string()))?;
        let admission = Arc::new(Semaphore::new(config.max_concurrent_requests.max(1)));

        Ok(Self {
            client,
            config,
            admission,
        })
    }

    /// A mapper for a node on this machine with default ports
    ///
    pub fn local() -> Result<Self> {
        Self::new(IpfsConfig::local())
    }

    pub fn config(&self) -> &IpfsConfig {
        &self.config
    }

    /// Requests that could start right now without waiting for admission
    ///
    pub fn available_permits(&self) -> usize {
        self.admission.available_permits()
    }

    fn gateway_url(&self, cid: &Cid) -> String {
        format!("{}/ipfs/{cid}", self.config.gateway_url.trim_end_matches('/'))
    }

    fn write_url(&self, codec: ContentCodec) -> Result<String> {
        let rpc = self.config.rpc_url.as_deref().ok_or(Error::StoreReadOnly)?;

        Ok(format!(
            "{}?cid-codec={}&mhtype=sha2-256&pin=false",
            rpc_method(rpc, "block/put"),
            codec.name()
        ))
    }

    fn pin_url(&self, method: &str, what: &str) -> Result<String> {
        let rpc = self
            .config
            .pin_url
            .as_deref()
            .ok_or_else(|| Error::NotSupported(format!("{what} without a pin endpoint")))?;

        Ok(rpc_method(rpc, method))
    }

    /// Run `request` holding a slot of the admission semaphore
    ///
    async fn admitted<T, F, Fut>(&self, request: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.admission.available_permits() == 0 {
            trace!("waiting for admission");
        }
        let _permit = self
            .admission
            .acquire()
            .await
            .map_err(|err| Error::FetchFailed {
                attempts: 0,
                reason: err.to_string(),
            })?;

        request().await
    }

    /// Send a request built fresh for each attempt, retrying transient failures.
    ///
    /// The body is read while the request still holds its admission slot, so a transfer that
    /// breaks off partway is retried like any other transient failure.
    ///
    async fn send<F>(&self, what: &str, cid: Option<&Cid>, build: F) -> Result<Reply>
    where
        F: Fn() -> Result<RequestBuilder>,
    {
        let build = &build;
        with_backoff(&self.config.retry, what, || async move {
            let request = build()?;
            self.admitted(|| async {
                let response = request.send().await.map_err(transport)?;
                let status = response.status();
                if let Some(err) = classify(status, cid) {
                    return Err(err);
                }
                let body = response.bytes().await.map_err(transport)?;

                Ok(Reply { status, body })
            })
            .await
        })
        .await
    }

    async fn rpc_json<T>(&self, what: &str, url: String, args: &[(&str, String)]) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let reply = self
            .send(what, None, || Ok(self.client.post(&url).query(args)))
            .await?;

        Ok(serde_json::from_slice(&reply.body)?)
    }
}

/// Status and complete body of a successful response
struct Reply {
    status: StatusCode,
    body: Bytes,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BlockPutResponse {
    key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PinLsResponse {
    #[serde(default)]
    keys: BTreeMap<String, PinType>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PinType {
    #[serde(rename = "Type")]
    kind: String,
}

#[async_trait]
impl Mapper for IpfsMapper {
    /// Upload `data` as a single block, returning its CIDv1.
    ///
    async fn save(&self, data: Bytes, codec: ContentCodec) -> Result<Cid> {
        let url = self.write_url(codec)?;
        let reply = self
            .send("save", None, || {
                let part = Part::stream(data.clone()).file_name("block");
                Ok(self.client.post(&url).multipart(Form::new().part("file", part)))
            })
            .await?;
        let added: BlockPutResponse = serde_json::from_slice(&reply.body)?;
        let cid = Cid::from_str(&added.key)?;
        debug!(%cid, size = data.len(), codec = codec.name(), "saved block");

        Ok(cid)
    }

    async fn load(&self, cid: &Cid, range: ByteRange) -> Result<Bytes> {
        let url = self.gateway_url(cid);
        let header = range.http_header();
        trace!(%cid, ?range, "loading");

        let reply = self
            .send("load", Some(cid), || {
                let request = self.client.get(&url);
                Ok(match &header {
                    Some(header) => request.header(RANGE, header.as_str()),
                    None => request,
                })
            })
            .await?;

        if header.is_some() && reply.status != StatusCode::PARTIAL_CONTENT {
            // The gateway ignored the range and sent everything
            return Ok(range.slice(&reply.body));
        }

        Ok(reply.body)
    }

    async fn pin(&self, cid: &Cid) -> Result<()> {
        let url = self.pin_url("pin/add", "pin")?;
        let _: IgnoredAny = self.rpc_json("pin", url, &[("arg", cid.to_string())]).await?;
        debug!(%cid, "pinned");

        Ok(())
    }

    async fn unpin(&self, cid: &Cid) -> Result<()> {
        let url = self.pin_url("pin/rm", "unpin")?;
        let _: IgnoredAny = self.rpc_json("unpin", url, &[("arg", cid.to_string())]).await?;
        debug!(%cid, "unpinned");

        Ok(())
    }

    async fn pin_update(&self, from: &Cid, to: &Cid) -> Result<()> {
        let url = self.pin_url("pin/update", "pin update")?;
        let args = [("arg", from.to_string()), ("arg", to.to_string())];
        let _: IgnoredAny = self.rpc_json("pin update", url, &args).await?;
        debug!(%from, %to, "updated pin");

        Ok(())
    }

    async fn pin_ls(&self) -> Result<Vec<Pin>> {
        let url = self.pin_url("pin/ls", "pin listing")?;
        let listing: PinLsResponse = self
            .rpc_json("pin listing", url, &[("type", String::from("recursive"))])
            .await?;

        listing
            .keys
            .into_iter()
            .map(|(cid, pin)| -> Result<Pin> {
                Ok(Pin {
                    cid: Cid::from_str(&cid)?,
                    kind: pin.kind,
                })
            })
            .collect()
    }
}

fn rpc_method(rpc: &str, method: &str) -> String {
    format!("{}/api/v0/{method}", rpc.trim_end_matches('/'))
}

fn invalid_config(reason: String) -> Error {
    io::Error::new(io::ErrorKind::InvalidInput, reason).into()
}

/// Failures to get a complete response are worth retrying
///
fn transport(err: reqwest::Error) -> Error {
    Error::FetchFailed {
        attempts: 1,
        reason: err.to_string(),
    }
}

/// Sort a response by status: success, definitive absence, retryable, or a plain failure.
///
fn classify(status: StatusCode, cid: Option<&Cid>) -> Option<Error> {
    if status.is_success() {
        return None;
    }

    Some(match (status, cid) {
        (StatusCode::NOT_FOUND | StatusCode::GONE, Some(cid)) => Error::NotFound(*cid),
        (StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS, _) => Error::FetchFailed {
            attempts: 1,
            reason: format!("server responded {status}"),
        },
        (status, _) if status.is_server_error() => Error::FetchFailed {
            attempts: 1,
            reason: format!("server responded {status}"),
        },
        (status, _) => Error::NotSupported(format!("request rejected with {status}")),
    })
}
