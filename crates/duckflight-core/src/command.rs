//! Decoding of Flight SQL command descriptors.
//!
//! A command descriptor carries a protobuf `google.protobuf.Any`. The
//! `type_url` field is the discriminator; `value` holds the encoded command
//! message. Only the two commands this server answers are recognised.

use prost::Message;
use thiserror::Error;

const TYPE_URL_PREFIX: &str = "type.googleapis.com/arrow.flight.protocol.sql.";

pub const STATEMENT_QUERY_TYPE_URL: &str =
    "type.googleapis.com/arrow.flight.protocol.sql.CommandStatementQuery";
pub const GET_SQL_INFO_TYPE_URL: &str =
    "type.googleapis.com/arrow.flight.protocol.sql.CommandGetSqlInfo";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed command: {0}")]
    Malformed(String),
    #[error("unsupported command: {0}")]
    Unsupported(String),
}

/// `google.protobuf.Any`
#[derive(Clone, PartialEq, Message)]
pub struct AnyEnvelope {
    #[prost(string, tag = "1")]
    pub type_url: String,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

/// `arrow.flight.protocol.sql.CommandStatementQuery`
#[derive(Clone, PartialEq, Message)]
pub struct CommandStatementQuery {
    #[prost(string, tag = "1")]
    pub query: String,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub transaction_id: Option<Vec<u8>>,
}

/// `arrow.flight.protocol.sql.CommandGetSqlInfo`
#[derive(Clone, PartialEq, Message)]
pub struct CommandGetSqlInfo {
    #[prost(uint32, repeated, tag = "1")]
    pub info: Vec<u32>,
}

/// A decoded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run a SQL statement. The text is passed to the engine untouched.
    RunStatement { query: String },
    /// Describe the server's capability table.
    DescribeCapabilities,
}

impl Command {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let envelope = AnyEnvelope::decode(payload)
            .map_err(|e| DecodeError::Malformed(format!("command envelope: {e}")))?;

        match envelope.type_url.as_str() {
            STATEMENT_QUERY_TYPE_URL => {
                let cmd = CommandStatementQuery::decode(envelope.value.as_slice())
                    .map_err(|e| DecodeError::Malformed(format!("CommandStatementQuery: {e}")))?;
                Ok(Command::RunStatement { query: cmd.query })
            }
            GET_SQL_INFO_TYPE_URL => {
                CommandGetSqlInfo::decode(envelope.value.as_slice())
                    .map_err(|e| DecodeError::Malformed(format!("CommandGetSqlInfo: {e}")))?;
                Ok(Command::DescribeCapabilities)
            }
            "" => Err(DecodeError::Malformed("command envelope has no type url".into())),
            other => Err(DecodeError::Unsupported(other.to_string())),
        }
    }

    /// Encode as a command descriptor payload.
    pub fn encode(&self) -> Vec<u8> {
        let (type_url, value) = match self {
            Command::RunStatement { query } => (
                STATEMENT_QUERY_TYPE_URL,
                CommandStatementQuery {
                    query: query.clone(),
                    transaction_id: None,
                }
                .encode_to_vec(),
            ),
            Command::DescribeCapabilities => (
                GET_SQL_INFO_TYPE_URL,
                CommandGetSqlInfo { info: Vec::new() }.encode_to_vec(),
            ),
        };
        AnyEnvelope {
            type_url: type_url.to_string(),
            value,
        }
        .encode_to_vec()
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::RunStatement { .. } => "statement",
            Command::DescribeCapabilities => "sql_info",
        }
    }
}

/// Strip the Flight SQL prefix from a type url, for error messages.
pub fn short_type_name(type_url: &str) -> &str {
    type_url.strip_prefix(TYPE_URL_PREFIX).unwrap_or(type_url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(type_url: &str, value: Vec<u8>) -> Vec<u8> {
        AnyEnvelope {
            type_url: type_url.to_string(),
            value,
        }
        .encode_to_vec()
    }

    #[test]
    fn test_decode_statement_keeps_query_verbatim() {
        let query = "  SELECT 1 AS \"x\" -- trailing\n";
        let payload = envelope(
            STATEMENT_QUERY_TYPE_URL,
            CommandStatementQuery {
                query: query.to_string(),
                transaction_id: Some(b"txn-1".to_vec()),
            }
            .encode_to_vec(),
        );

        let cmd = Command::decode(&payload).unwrap();
        assert_eq!(
            cmd,
            Command::RunStatement {
                query: query.to_string()
            }
        );
    }

    #[test]
    fn test_decode_sql_info() {
        let payload = envelope(
            GET_SQL_INFO_TYPE_URL,
            CommandGetSqlInfo { info: vec![0, 1] }.encode_to_vec(),
        );
        assert_eq!(Command::decode(&payload).unwrap(), Command::DescribeCapabilities);
    }

    #[test]
    fn test_encode_decode_round_trip() {
        for cmd in [
            Command::RunStatement {
                query: "SELECT * FROM range(10)".into(),
            },
            Command::DescribeCapabilities,
        ] {
            assert_eq!(Command::decode(&cmd.encode()).unwrap(), cmd);
        }
    }

    #[test]
    fn test_unknown_type_url_is_unsupported() {
        let payload = envelope(
            "type.googleapis.com/arrow.flight.protocol.sql.CommandGetCatalogs",
            Vec::new(),
        );
        match Command::decode(&payload) {
            Err(DecodeError::Unsupported(url)) => {
                assert_eq!(short_type_name(&url), "CommandGetCatalogs")
            }
            other => panic!("expected Unsupported, got {other:?}"),
        }
    }

    #[test]
    fn test_query_text_in_type_url_is_not_a_discriminator() {
        // A statement whose SQL happens to equal a type url must still be a statement.
        let payload = Command::RunStatement {
            query: GET_SQL_INFO_TYPE_URL.to_string(),
        }
        .encode();
        assert!(matches!(
            Command::decode(&payload).unwrap(),
            Command::RunStatement { .. }
        ));
    }

    #[test]
    fn test_garbage_payload_is_malformed() {
        let err = Command::decode(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn test_bad_inner_message_is_malformed() {
        let payload = envelope(STATEMENT_QUERY_TYPE_URL, vec![0x0a, 0x10, b'S']);
        let err = Command::decode(&payload).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn test_empty_payload_is_malformed() {
        let err = Command::decode(&[]).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }
}
