pub mod catalog;
pub mod command;
pub mod dispatch;
pub mod engine;
pub mod flight;
pub mod streaming;
pub mod ticket;

pub use catalog::{
    sql_info_schema, CapabilityEntry, ServerIdentity, SqlInfoCatalog, SqlInfoUnionBuilder,
    TaggedValue, ValueKind,
};
pub use command::{Command, DecodeError};
pub use dispatch::{DispatchError, Dispatcher, FlightPlan};
pub use engine::{DuckDbEngine, EngineConfig, EngineError, QueryCursor, QueryEngine};
pub use flight::{DuckFlightService, FlightConfig, FlightSink};
pub use streaming::{
    BatchSink, ResultStreamer, SinkError, StreamError, StreamOutcome, StreamTarget,
};
pub use ticket::{Ticket, TicketPayload};
