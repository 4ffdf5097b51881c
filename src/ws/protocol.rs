//! Wire protocol for the realtime gateway.
//!
//! Every frame is a JSON object with a `type` tag. Client-to-server events
//! drive authentication and subscription changes; server-to-client events
//! carry acknowledgements, stream data, and errors. Unknown tags are rejected
//! with an `error` event rather than dropping the connection.

use serde::{Deserialize, Serialize};

use crate::mux::logparse::ParsedLogLine;
use crate::mux::status::ServiceStatus;

/// Events the browser sends.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Explicit authentication with a session token, for clients that cannot
    /// present the session cookie on the upgrade request.
    Authenticate { token: String },
    /// Start a journal tail for one service.
    SubscribeLogs { service: String },
    /// Stop the journal tail for one service.
    UnsubscribeLogs { service: String },
    /// Start the periodic status poll. `interval_ms` falls back to the
    /// server-configured default when omitted.
    SubscribeStatus {
        #[serde(default)]
        interval_ms: Option<u64>,
    },
    /// Stop the status poll.
    UnsubscribeStatus,
}

/// Events the server sends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Authentication outcome, for both cookie auto-auth and explicit auth.
    Authenticated { success: bool },
    /// Something went wrong; the connection may or may not survive.
    Error { message: String },
    /// One line from a subscribed journal tail, with a best-effort parse.
    LogData {
        service: String,
        line: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        parsed: Option<ParsedLogLine>,
    },
    /// One batch from the status poll, covering every matched unit.
    StatusUpdate { services: Vec<ServiceStatus> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_events_use_snake_case_tags() {
        let event: ClientEvent =
            serde_json::from_str(r#"{"type":"subscribe_logs","service":"ethpillar-execution"}"#)
                .unwrap();
        assert_eq!(
            event,
            ClientEvent::SubscribeLogs {
                service: "ethpillar-execution".to_string()
            }
        );

        let event: ClientEvent = serde_json::from_str(r#"{"type":"subscribe_status"}"#).unwrap();
        assert_eq!(event, ClientEvent::SubscribeStatus { interval_ms: None });
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        assert!(serde_json::from_str::<ClientEvent>(r#"{"type":"reboot_host"}"#).is_err());
    }

    #[test]
    fn test_log_data_omits_parsed_when_absent() {
        let json = serde_json::to_string(&ServerEvent::LogData {
            service: "beacon".to_string(),
            line: "raw line".to_string(),
            parsed: None,
        })
        .unwrap();
        assert_eq!(
            json,
            r#"{"type":"log_data","service":"beacon","line":"raw line"}"#
        );
    }
}
