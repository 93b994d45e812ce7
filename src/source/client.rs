//! TCP client for the upstream time-series service
//!
//! Every request opens its own connection, sends one request frame and
//! reads frames until the response is complete, then drops the connection.
//! Connection setup is bounded by the connect timeout and the whole
//! response by the response timeout.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, error, warn};

use super::protocol::{FrameCodec, Message, MessageType, StreamsRequest};
use super::{CollectionId, CollectionInfo, HistoryRequest, LabelHistory, StreamRecord, TimeSeriesSource};
use crate::config::UpstreamConfig;
use crate::error::SourceError;
use crate::metrics;
use crate::types::{StreamId, TimeRange, Timestamp};

type Connection = Framed<TcpStream, FrameCodec>;

/// Client for the upstream time-series service
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    address: String,
    connect_timeout: Duration,
    response_timeout: Duration,
    max_frame_bytes: usize,
}

impl UpstreamClient {
    /// Create a client; no connection is made until the first request
    pub fn new(config: &UpstreamConfig) -> Self {
        Self {
            address: config.address(),
            connect_timeout: config.connect_timeout(),
            response_timeout: config.response_timeout(),
            max_frame_bytes: config.max_frame_bytes,
        }
    }

    /// `host:port` this client talks to
    pub fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> Result<Connection, SourceError> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| {
                SourceError::Connection(format!("Timed out connecting to {}", self.address))
            })?
            .map_err(|e| {
                SourceError::Connection(format!("Failed to connect to {}: {}", self.address, e))
            })?;

        stream.set_nodelay(true)?;
        debug!(address = %self.address, "Connected to upstream");

        Ok(Framed::new(
            stream,
            FrameCodec::with_max_frame_size(self.max_frame_bytes),
        ))
    }

    /// Send `request` on a fresh connection and collect the response
    async fn exchange<T, F, Fut>(&self, name: &str, request: Message, read: F) -> Result<T, SourceError>
    where
        F: FnOnce(Connection) -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let start = Instant::now();

        let result = async {
            let mut conn = self.connect().await?;
            conn.send(request).await?;

            timeout(self.response_timeout, read(conn))
                .await
                .map_err(|_| {
                    SourceError::Connection(format!(
                        "No complete {} response from {} within {:?}",
                        name, self.address, self.response_timeout
                    ))
                })?
        }
        .await;

        metrics::record_upstream_request(name, start.elapsed().as_secs_f64(), result.is_ok());
        if let Err(e) = &result {
            error!(request = name, address = %self.address, error = %e, "Upstream request failed");
        }
        result
    }
}

async fn next_message(conn: &mut Connection) -> Result<Message, SourceError> {
    match conn.next().await {
        Some(message) => message,
        None => Err(SourceError::Connection(
            "Upstream closed the connection mid-response".to_string(),
        )),
    }
}

fn unexpected(expected: MessageType, actual: &Message) -> SourceError {
    SourceError::UnexpectedMessage {
        expected: expected.name().to_string(),
        actual: actual.message_type().name().to_string(),
    }
}

#[async_trait]
impl TimeSeriesSource for UpstreamClient {
    async fn request_collections(&self) -> Result<Vec<CollectionInfo>, SourceError> {
        self.exchange("collections", Message::RequestCollections, |mut conn| async move {
            match next_message(&mut conn).await? {
                Message::Collections(list) => Ok(list.collections),
                Message::QueryCancelled(_) => Err(SourceError::Connection(
                    "Request for collections timed out upstream".to_string(),
                )),
                other => Err(unexpected(MessageType::Collections, &other)),
            }
        })
        .await
    }

    async fn request_streams(
        &self,
        collection: CollectionId,
        since: StreamId,
    ) -> Result<Vec<StreamRecord>, SourceError> {
        let boundary = i64::try_from(since).map_err(|_| {
            SourceError::Protocol(format!("Stream id {} does not fit the wire format", since))
        })?;
        let request = Message::RequestStreams(StreamsRequest { collection, boundary });

        self.exchange("streams", request, |mut conn| async move {
            let mut streams = Vec::new();
            loop {
                match next_message(&mut conn).await? {
                    Message::Streams(chunk) => {
                        if chunk.collection != collection {
                            continue;
                        }
                        streams.extend(chunk.streams);
                        if !chunk.more {
                            return Ok(streams);
                        }
                    },
                    Message::QueryCancelled(_) => {
                        return Err(SourceError::Connection(format!(
                            "Request for streams of collection {} timed out upstream",
                            collection
                        )))
                    },
                    other => return Err(unexpected(MessageType::Streams, &other)),
                }
            }
        })
        .await
    }

    async fn request_active_streams(
        &self,
        collection: CollectionId,
        since: Timestamp,
    ) -> Result<Vec<StreamId>, SourceError> {
        let request = Message::RequestActiveStreams(StreamsRequest {
            collection,
            boundary: since,
        });

        self.exchange("active_streams", request, |mut conn| async move {
            let mut streams = Vec::new();
            loop {
                match next_message(&mut conn).await? {
                    Message::ActiveStreams(chunk) => {
                        if chunk.collection != collection {
                            continue;
                        }
                        streams.extend(chunk.streams);
                        if !chunk.more {
                            return Ok(streams);
                        }
                    },
                    Message::QueryCancelled(_) => {
                        return Err(SourceError::Connection(format!(
                            "Request for active streams of collection {} timed out upstream",
                            collection
                        )))
                    },
                    other => return Err(unexpected(MessageType::ActiveStreams, &other)),
                }
            }
        })
        .await
    }

    async fn request_history(
        &self,
        request: &HistoryRequest,
    ) -> Result<BTreeMap<String, LabelHistory>, SourceError> {
        if request.labels.is_empty() {
            return Ok(BTreeMap::new());
        }

        let message = Message::RequestHistory(request.clone());
        self.exchange("history", message, |mut conn| async move {
            collect_history(&mut conn, request).await
        })
        .await
    }
}

/// Read history frames until every requested label is complete
///
/// Stream announcements interleaved with the response are skipped, as
/// are chunks for other collections or labels that were not asked for.
async fn collect_history(
    conn: &mut Connection,
    request: &HistoryRequest,
) -> Result<BTreeMap<String, LabelHistory>, SourceError> {
    let mut results: BTreeMap<String, LabelHistory> = BTreeMap::new();
    let mut complete: HashSet<String> = HashSet::new();

    while complete.len() < request.labels.len() {
        match next_message(conn).await? {
            Message::Streams(_) | Message::ActiveStreams(_) => continue,
            Message::QueryCancelled(cancel) => {
                if cancel.collection != Some(request.collection) {
                    continue;
                }

                for label in cancel.labels {
                    if !request.labels.contains_key(&label) {
                        continue;
                    }

                    warn!(
                        collection = request.collection,
                        label = %label,
                        start = cancel.start,
                        end = cancel.end,
                        "Upstream query timed out"
                    );

                    let entry = results.entry(label.clone()).or_default();
                    entry
                        .timed_out
                        .push(TimeRange::new_unchecked(cancel.start, cancel.end + 1));

                    if !cancel.more {
                        if entry.frequency == 0 {
                            entry.frequency = request.binsize;
                        }
                        complete.insert(label);
                    }
                }
            },
            Message::History(chunk) => {
                if chunk.collection != request.collection
                    || !request.labels.contains_key(&chunk.label)
                {
                    continue;
                }

                debug!(
                    label = %chunk.label,
                    rows = chunk.data.len(),
                    more = chunk.more,
                    "Received history chunk"
                );

                let entry = results.entry(chunk.label.clone()).or_default();
                if entry.frequency == 0 {
                    entry.frequency = chunk.binsize;
                }
                entry.data.extend(chunk.data);

                if !chunk.more {
                    complete.insert(chunk.label);
                }
            },
            other => return Err(unexpected(MessageType::History, &other)),
        }
    }

    Ok(results)
}
