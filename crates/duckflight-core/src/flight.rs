//! Arrow Flight service
//!
//! Binds the two protocol phases to the Flight RPC surface:
//! - `GetFlightInfo` / `GetSchema`: decode the command descriptor and describe it
//! - `DoGet`: redeem a ticket and stream Arrow IPC messages
//! - `DoAction`: no actions are implemented
//!
//! Everything else answers `Unimplemented`.

use crate::catalog::{ServerIdentity, SqlInfoCatalog, DEFAULT_SERVER_NAME};
use crate::command::{short_type_name, Command, DecodeError};
use crate::dispatch::{DispatchError, Dispatcher};
use crate::engine::{DuckDbEngine, QueryEngine};
use crate::streaming::{BatchSink, ResultStreamer, SinkError, StreamError};
use crate::ticket::Ticket;
use arrow_array::RecordBatch;
use arrow_flight::flight_descriptor::DescriptorType;
use arrow_flight::flight_service_server::{FlightService, FlightServiceServer};
use arrow_flight::{
    Action, ActionType, Criteria, Empty, FlightData, FlightDescriptor, FlightEndpoint, FlightInfo,
    HandshakeRequest, HandshakeResponse, PollInfo, PutResult, SchemaAsIpc, SchemaResult,
};
use arrow_ipc::writer::{DictionaryTracker, IpcDataGenerator, IpcWriteOptions};
use arrow_schema::{ArrowError, SchemaRef};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

/// Flight server configuration
#[derive(Debug, Clone)]
pub struct FlightConfig {
    /// Host to bind to
    pub host: String,
    /// Port for Flight service
    pub port: u16,
    /// Maximum encoded/decoded gRPC message size (bytes)
    pub max_message_size: usize,
    /// FlightData messages buffered per DoGet stream
    pub stream_buffer: usize,
    /// Reported as the server name in the capability table
    pub server_name: String,
}

impl Default for FlightConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 32010,
            max_message_size: 64 * 1024 * 1024, // 64MB
            stream_buffer: 2,
            server_name: DEFAULT_SERVER_NAME.to_string(),
        }
    }
}

impl FlightConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn grpc_uri(&self) -> String {
        format!("grpc://{}:{}", self.host, self.port)
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    pub fn with_stream_buffer(mut self, stream_buffer: usize) -> Self {
        self.stream_buffer = stream_buffer.max(1);
        self
    }
}

impl From<DecodeError> for Status {
    fn from(e: DecodeError) -> Self {
        match e {
            DecodeError::Unsupported(type_url) => Status::unimplemented(format!(
                "unsupported command: {}",
                short_type_name(&type_url)
            )),
            DecodeError::Malformed(message) => Status::invalid_argument(message),
        }
    }
}

impl From<DispatchError> for Status {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::EngineFailure(message) => Status::cancelled(message),
        }
    }
}

impl From<StreamError> for Status {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::EngineFailure(message) => Status::internal(message),
            StreamError::UnsupportedTicket => Status::unimplemented(e.to_string()),
            StreamError::Encode(message) => Status::internal(message),
        }
    }
}

fn arrow_status(e: ArrowError) -> Status {
    Status::internal(e.to_string())
}

/// Only command descriptors are understood.
fn decode_descriptor(descriptor: &FlightDescriptor) -> Result<Command, Status> {
    match descriptor.r#type() {
        DescriptorType::Cmd => Ok(Command::decode(&descriptor.cmd)?),
        DescriptorType::Path => Err(Status::unimplemented("path descriptors are not supported")),
        DescriptorType::Unknown => Err(Status::invalid_argument("descriptor type is not set")),
    }
}

/// [`BatchSink`] writing Arrow IPC `FlightData` into a DoGet response channel.
pub struct FlightSink {
    tx: mpsc::Sender<Result<FlightData, Status>>,
    options: IpcWriteOptions,
    generator: IpcDataGenerator,
    dictionaries: DictionaryTracker,
}

impl FlightSink {
    pub fn new(tx: mpsc::Sender<Result<FlightData, Status>>) -> Self {
        Self {
            tx,
            options: IpcWriteOptions::default(),
            generator: IpcDataGenerator::default(),
            dictionaries: DictionaryTracker::new(false),
        }
    }

    async fn send(&self, data: FlightData) -> Result<(), SinkError> {
        self.tx.send(Ok(data)).await.map_err(|_| SinkError::Closed)
    }
}

#[async_trait]
impl BatchSink for FlightSink {
    async fn write_schema(&mut self, schema: &SchemaRef) -> Result<(), SinkError> {
        let data: FlightData = SchemaAsIpc::new(schema, &self.options).into();
        self.send(data).await
    }

    async fn write_batch(&mut self, batch: &RecordBatch) -> Result<(), SinkError> {
        let (dictionaries, encoded) = self
            .generator
            .encoded_batch(batch, &mut self.dictionaries, &self.options)
            .map_err(|e| SinkError::Encode(e.to_string()))?;
        for dictionary in dictionaries {
            self.send(dictionary.into()).await?;
        }
        self.send(encoded.into()).await
    }

    async fn close(&mut self, error: Option<&StreamError>) {
        if let Some(e) = error {
            // The consumer may already be gone; nothing left to report to.
            let _ = self.tx.send(Err(Status::from(e.clone()))).await;
        }
    }
}

/// Flight service over a [`QueryEngine`].
#[derive(Clone)]
pub struct DuckFlightService {
    dispatcher: Dispatcher,
    streamer: ResultStreamer,
    config: FlightConfig,
}

impl DuckFlightService {
    pub fn new(engine: Arc<dyn QueryEngine>, catalog: SqlInfoCatalog, config: FlightConfig) -> Self {
        let catalog = Arc::new(catalog);
        Self {
            dispatcher: Dispatcher::new(engine.clone(), catalog.clone()),
            streamer: ResultStreamer::new(engine, catalog),
            config,
        }
    }

    /// Capability table built from the engine's version and access mode.
    pub fn for_duckdb(engine: DuckDbEngine, config: FlightConfig) -> Self {
        let identity = ServerIdentity::new(
            config.server_name.clone(),
            engine.version(),
            engine.read_only(),
        );
        let catalog = SqlInfoCatalog::new(&identity);
        Self::new(Arc::new(engine), catalog, config)
    }

    pub fn config(&self) -> &FlightConfig {
        &self.config
    }

    /// gRPC server wrapper with the configured message size limits.
    pub fn into_server(self) -> FlightServiceServer<Self> {
        let limit = self.config.max_message_size;
        FlightServiceServer::new(self)
            .max_decoding_message_size(limit)
            .max_encoding_message_size(limit)
    }
}

#[tonic::async_trait]
impl FlightService for DuckFlightService {
    type HandshakeStream = BoxStream<'static, Result<HandshakeResponse, Status>>;
    type ListFlightsStream = BoxStream<'static, Result<FlightInfo, Status>>;
    type DoGetStream = BoxStream<'static, Result<FlightData, Status>>;
    type DoPutStream = BoxStream<'static, Result<PutResult, Status>>;
    type DoActionStream = BoxStream<'static, Result<arrow_flight::Result, Status>>;
    type ListActionsStream = BoxStream<'static, Result<ActionType, Status>>;
    type DoExchangeStream = BoxStream<'static, Result<FlightData, Status>>;

    async fn handshake(
        &self,
        _request: Request<Streaming<HandshakeRequest>>,
    ) -> Result<Response<Self::HandshakeStream>, Status> {
        Err(Status::unimplemented("handshake is not supported"))
    }

    async fn list_flights(
        &self,
        _request: Request<Criteria>,
    ) -> Result<Response<Self::ListFlightsStream>, Status> {
        Err(Status::unimplemented("list_flights is not supported"))
    }

    async fn get_flight_info(
        &self,
        request: Request<FlightDescriptor>,
    ) -> Result<Response<FlightInfo>, Status> {
        let descriptor = request.into_inner();
        let command = decode_descriptor(&descriptor)?;
        info!(command = command.kind(), "get_flight_info");

        let plan = self.dispatcher.describe(&command).await?;
        let endpoint = FlightEndpoint::new()
            .with_ticket(arrow_flight::Ticket::new(plan.ticket.into_bytes()));
        let info = FlightInfo::new()
            .try_with_schema(&plan.schema)
            .map_err(arrow_status)?
            .with_endpoint(endpoint)
            .with_descriptor(descriptor);
        Ok(Response::new(info))
    }

    async fn poll_flight_info(
        &self,
        _request: Request<FlightDescriptor>,
    ) -> Result<Response<PollInfo>, Status> {
        Err(Status::unimplemented("poll_flight_info is not supported"))
    }

    async fn get_schema(
        &self,
        request: Request<FlightDescriptor>,
    ) -> Result<Response<SchemaResult>, Status> {
        let descriptor = request.into_inner();
        let command = decode_descriptor(&descriptor)?;
        info!(command = command.kind(), "get_schema");

        let plan = self.dispatcher.describe(&command).await?;
        let result: SchemaResult = SchemaAsIpc::new(&plan.schema, &IpcWriteOptions::default())
            .try_into()
            .map_err(arrow_status)?;
        Ok(Response::new(result))
    }

    async fn do_get(
        &self,
        request: Request<arrow_flight::Ticket>,
    ) -> Result<Response<Self::DoGetStream>, Status> {
        let ticket = Ticket::from_bytes(request.into_inner().ticket.to_vec());
        let target = ResultStreamer::resolve(&ticket).inspect_err(|_| {
            debug!("do_get with unrecognised ticket");
        })?;

        let (tx, rx) = mpsc::channel(self.config.stream_buffer.max(1));
        let streamer = self.streamer.clone();
        tokio::spawn(async move {
            let mut sink = FlightSink::new(tx);
            if let Err(e) = streamer.stream_target(target, &mut sink).await {
                warn!(error = %e, "do_get stream failed");
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn do_put(
        &self,
        _request: Request<Streaming<FlightData>>,
    ) -> Result<Response<Self::DoPutStream>, Status> {
        Err(Status::unimplemented("do_put is not supported"))
    }

    async fn do_action(
        &self,
        request: Request<Action>,
    ) -> Result<Response<Self::DoActionStream>, Status> {
        let action = request.into_inner();
        Err(Status::unimplemented(format!(
            "unknown action type: {}",
            action.r#type
        )))
    }

    async fn list_actions(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::ListActionsStream>, Status> {
        Ok(Response::new(Box::pin(stream::empty())))
    }

    async fn do_exchange(
        &self,
        _request: Request<Streaming<FlightData>>,
    ) -> Result<Response<Self::DoExchangeStream>, Status> {
        Err(Status::unimplemented("do_exchange is not supported"))
    }
}
