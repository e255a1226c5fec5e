//! Flight tickets.
//!
//! A ticket is the opaque token handed out by `GetFlightInfo` and redeemed
//! with `DoGet`. The payload is self-contained JSON, so redemption needs no
//! server-side state:
//!
//! ```json
//! {"kind":"statement","query_id":"6f1c...","query":"SELECT 42"}
//! {"kind":"sql_info"}
//! ```

use serde::{Deserialize, Serialize};

/// Fresh id correlating the describe and stream phases of one query.
pub fn new_query_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// What a ticket points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TicketPayload {
    /// SQL text to execute on redemption.
    Statement {
        /// Correlates the two phases in logs
        query_id: String,
        query: String,
    },
    /// The capability table.
    SqlInfo,
}

/// Opaque server-issued ticket bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ticket(Vec<u8>);

impl Ticket {
    pub fn statement(query_id: &str, query: &str) -> Self {
        Self::from_payload(&TicketPayload::Statement {
            query_id: query_id.to_string(),
            query: query.to_string(),
        })
    }

    /// The fixed sentinel ticket for the capability table.
    pub fn sql_info() -> Self {
        Self::from_payload(&TicketPayload::SqlInfo)
    }

    fn from_payload(payload: &TicketPayload) -> Self {
        Ticket(serde_json::to_vec(payload).unwrap_or_default())
    }

    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Ticket(data.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Parse the payload; `None` if these bytes were not issued by this server.
    pub fn payload(&self) -> Option<TicketPayload> {
        serde_json::from_slice(&self.0).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_ticket_roundtrip() {
        let ticket = Ticket::statement(&new_query_id(), "SELECT * FROM events");
        let restored = Ticket::from_bytes(ticket.as_bytes().to_vec());

        match restored.payload() {
            Some(TicketPayload::Statement { query_id, query }) => {
                assert_eq!(query, "SELECT * FROM events");
                assert!(!query_id.is_empty());
            }
            other => panic!("Expected Statement, got {other:?}"),
        }
    }

    #[test]
    fn test_statement_tickets_get_distinct_ids() {
        let a = Ticket::statement(&new_query_id(), "SELECT 1");
        let b = Ticket::statement(&new_query_id(), "SELECT 1");
        assert_ne!(a, b);
    }

    #[test]
    fn test_sql_info_sentinel_is_fixed() {
        assert_eq!(Ticket::sql_info(), Ticket::sql_info());
        assert_eq!(Ticket::sql_info().as_bytes(), br#"{"kind":"sql_info"}"#);
        assert_eq!(Ticket::sql_info().payload(), Some(TicketPayload::SqlInfo));
    }

    #[test]
    fn test_foreign_bytes_have_no_payload() {
        assert_eq!(Ticket::from_bytes(b"CommandGetSqlInfo".to_vec()).payload(), None);
        assert_eq!(Ticket::from_bytes(Vec::new()).payload(), None);
        assert_eq!(
            Ticket::from_bytes(br#"{"kind":"table","name":"t"}"#.to_vec()).payload(),
            None
        );
    }
}
