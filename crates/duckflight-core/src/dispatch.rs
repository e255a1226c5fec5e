//! Describe phase: a decoded command becomes a result schema plus the ticket
//! that redeems it.

use crate::catalog::SqlInfoCatalog;
use crate::command::Command;
use crate::engine::QueryEngine;
use crate::ticket::{new_query_id, Ticket};
use arrow_schema::SchemaRef;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("engine rejected query: {0}")]
    EngineFailure(String),
}

/// Schema and ticket for a single endpoint.
#[derive(Debug, Clone)]
pub struct FlightPlan {
    pub schema: SchemaRef,
    pub ticket: Ticket,
}

#[derive(Clone)]
pub struct Dispatcher {
    engine: Arc<dyn QueryEngine>,
    catalog: Arc<SqlInfoCatalog>,
}

impl Dispatcher {
    pub fn new(engine: Arc<dyn QueryEngine>, catalog: Arc<SqlInfoCatalog>) -> Self {
        Self { engine, catalog }
    }

    /// Nothing is reserved on the server; the ticket carries everything
    /// needed to redeem it.
    pub async fn describe(&self, command: &Command) -> Result<FlightPlan, DispatchError> {
        match command {
            Command::RunStatement { query } => {
                let query_id = new_query_id();
                debug!(query_id = %query_id, "describing statement");
                let schema = self.engine.describe(query).await.map_err(|e| {
                    warn!(query_id = %query_id, error = %e, "engine rejected statement");
                    DispatchError::EngineFailure(e.to_string())
                })?;
                Ok(FlightPlan {
                    schema,
                    ticket: Ticket::statement(&query_id, query),
                })
            }
            Command::DescribeCapabilities => Ok(FlightPlan {
                schema: self.catalog.schema(),
                ticket: Ticket::sql_info(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{sql_info_schema, ServerIdentity};
    use crate::engine::{DuckDbEngine, EngineConfig};
    use crate::ticket::TicketPayload;
    use arrow_schema::DataType;

    fn dispatcher() -> Dispatcher {
        let engine = DuckDbEngine::open(
            EngineConfig::in_memory()
                .with_pool_size(1)
                .with_load_extensions(false),
        )
        .unwrap();
        let catalog = SqlInfoCatalog::new(&ServerIdentity::new("test", engine.version(), false));
        Dispatcher::new(Arc::new(engine), Arc::new(catalog))
    }

    #[tokio::test]
    async fn test_statement_plan_carries_schema_and_query() {
        let plan = dispatcher()
            .describe(&Command::RunStatement {
                query: "SELECT 1::BIGINT AS id, 'a' AS name".into(),
            })
            .await
            .unwrap();

        assert_eq!(plan.schema.field(0).name(), "id");
        assert_eq!(plan.schema.field(0).data_type(), &DataType::Int64);
        assert_eq!(plan.schema.field(1).name(), "name");
        match plan.ticket.payload() {
            Some(TicketPayload::Statement { query, .. }) => {
                assert_eq!(query, "SELECT 1::BIGINT AS id, 'a' AS name")
            }
            other => panic!("expected statement ticket, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_capabilities_plan_uses_sentinel() {
        let plan = dispatcher()
            .describe(&Command::DescribeCapabilities)
            .await
            .unwrap();
        assert_eq!(plan.schema, sql_info_schema());
        assert_eq!(plan.ticket, Ticket::sql_info());
    }

    #[tokio::test]
    async fn test_rejected_statement_issues_no_ticket() {
        let err = dispatcher()
            .describe(&Command::RunStatement {
                query: "SELECT * FROM missing_table".into(),
            })
            .await
            .unwrap_err();
        let DispatchError::EngineFailure(message) = err;
        assert!(message.contains("missing_table"));
    }
}
