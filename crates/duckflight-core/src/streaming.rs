//! Stream phase: redeem a ticket and push its result into a [`BatchSink`].
//!
//! The schema is written exactly once and before any batch; batches follow in
//! the order the engine produced them. The sink is closed on every exit path,
//! with the terminal error if there is one, so a consumer sees either a clean
//! end of stream or an explicit failure after whatever prefix was delivered.

use crate::catalog::SqlInfoCatalog;
use crate::engine::QueryEngine;
use crate::ticket::{Ticket, TicketPayload};
use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Failure reported by a sink.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The consumer went away. Not an application error.
    #[error("batch sink closed")]
    Closed,
    #[error("failed to encode batch: {0}")]
    Encode(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("engine failure: {0}")]
    EngineFailure(String),
    #[error("ticket does not reference a known result")]
    UnsupportedTicket,
    #[error("encode failure: {0}")]
    Encode(String),
}

/// Destination of one result stream.
#[async_trait]
pub trait BatchSink: Send {
    async fn write_schema(&mut self, schema: &SchemaRef) -> Result<(), SinkError>;

    async fn write_batch(&mut self, batch: &RecordBatch) -> Result<(), SinkError>;

    /// Called once, last. `error` is the reason the stream failed, if it did.
    async fn close(&mut self, error: Option<&StreamError>);
}

/// What a ticket resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTarget {
    Capabilities,
    Statement { query_id: String, query: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed { batches: usize, rows: usize },
    /// The sink closed before the result was exhausted.
    Cancelled { batches: usize, rows: usize },
}

#[derive(Clone)]
pub struct ResultStreamer {
    engine: Arc<dyn QueryEngine>,
    catalog: Arc<SqlInfoCatalog>,
}

impl ResultStreamer {
    pub fn new(engine: Arc<dyn QueryEngine>, catalog: Arc<SqlInfoCatalog>) -> Self {
        Self { engine, catalog }
    }

    pub fn resolve(ticket: &Ticket) -> Result<StreamTarget, StreamError> {
        match ticket.payload() {
            Some(TicketPayload::SqlInfo) => Ok(StreamTarget::Capabilities),
            Some(TicketPayload::Statement { query_id, query }) => {
                Ok(StreamTarget::Statement { query_id, query })
            }
            None => Err(StreamError::UnsupportedTicket),
        }
    }

    pub async fn stream<S>(&self, ticket: &Ticket, sink: &mut S) -> Result<StreamOutcome, StreamError>
    where
        S: BatchSink + ?Sized,
    {
        match Self::resolve(ticket) {
            Ok(target) => self.stream_target(target, sink).await,
            Err(e) => {
                sink.close(Some(&e)).await;
                Err(e)
            }
        }
    }

    pub async fn stream_target<S>(
        &self,
        target: StreamTarget,
        sink: &mut S,
    ) -> Result<StreamOutcome, StreamError>
    where
        S: BatchSink + ?Sized,
    {
        let result = match target {
            StreamTarget::Capabilities => self.stream_capabilities(sink).await,
            StreamTarget::Statement { query_id, query } => {
                self.stream_statement(&query_id, &query, sink).await
            }
        };
        sink.close(result.as_ref().err()).await;
        result
    }

    async fn stream_capabilities<S>(&self, sink: &mut S) -> Result<StreamOutcome, StreamError>
    where
        S: BatchSink + ?Sized,
    {
        let batch = self
            .catalog
            .record_batch()
            .map_err(|e| StreamError::Encode(e.to_string()))?;

        let mut progress = Progress::default();
        if sink_write(sink.write_schema(&batch.schema()).await)?.is_none() {
            return Ok(progress.cancelled());
        }
        if sink_write(sink.write_batch(&batch).await)?.is_none() {
            return Ok(progress.cancelled());
        }
        progress.record(&batch);
        Ok(progress.completed())
    }

    async fn stream_statement<S>(
        &self,
        query_id: &str,
        query: &str,
        sink: &mut S,
    ) -> Result<StreamOutcome, StreamError>
    where
        S: BatchSink + ?Sized,
    {
        info!(query_id = %query_id, "streaming statement");
        let mut cursor = self.engine.execute(query).await.map_err(|e| {
            warn!(query_id = %query_id, error = %e, "statement failed to start");
            StreamError::EngineFailure(e.to_string())
        })?;

        let mut progress = Progress::default();
        if sink_write(sink.write_schema(&cursor.schema()).await)?.is_none() {
            debug!(query_id = %query_id, "consumer left before schema");
            return Ok(progress.cancelled());
        }

        // Dropping the cursor on any early return stops the engine producer.
        while let Some(next) = cursor.next().await {
            let batch = next.map_err(|e| {
                warn!(
                    query_id = %query_id,
                    batches = progress.batches,
                    error = %e,
                    "statement failed mid-stream"
                );
                StreamError::EngineFailure(e.to_string())
            })?;
            if sink_write(sink.write_batch(&batch).await)?.is_none() {
                debug!(
                    query_id = %query_id,
                    batches = progress.batches,
                    rows = progress.rows,
                    "consumer cancelled stream"
                );
                return Ok(progress.cancelled());
            }
            progress.record(&batch);
        }

        info!(
            query_id = %query_id,
            batches = progress.batches,
            rows = progress.rows,
            "statement streamed"
        );
        Ok(progress.completed())
    }
}

/// `Ok(None)` when the consumer has gone.
fn sink_write(result: Result<(), SinkError>) -> Result<Option<()>, StreamError> {
    match result {
        Ok(()) => Ok(Some(())),
        Err(SinkError::Closed) => Ok(None),
        Err(SinkError::Encode(message)) => Err(StreamError::Encode(message)),
    }
}

#[derive(Debug, Default)]
struct Progress {
    batches: usize,
    rows: usize,
}

impl Progress {
    fn record(&mut self, batch: &RecordBatch) {
        self.batches += 1;
        self.rows += batch.num_rows();
    }

    fn completed(&self) -> StreamOutcome {
        StreamOutcome::Completed {
            batches: self.batches,
            rows: self.rows,
        }
    }

    fn cancelled(&self) -> StreamOutcome {
        StreamOutcome::Cancelled {
            batches: self.batches,
            rows: self.rows,
        }
    }
}
