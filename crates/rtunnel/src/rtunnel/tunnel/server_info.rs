use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::rtunnel::tunnel::{SERVER_INFO_REQUEST, error::TunnelError, session::SecureSession};

/// Relay self-description. Any JSON object is accepted; fields are not
/// interpreted here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerInfo(Map<String, Value>);

impl ServerInfo {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }
}

impl std::fmt::Display for ServerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(&self.0) {
            Ok(s) => f.write_str(&s),
            Err(_) => f.write_str("{}"),
        }
    }
}

/// Issues one server-info request and decodes the reply. The session is left
/// open whatever the outcome.
pub async fn fetch_server_info(
    session: &dyn SecureSession,
    endpoint: &str,
) -> Result<ServerInfo, TunnelError> {
    let (ok, payload) = session
        .send_request(SERVER_INFO_REQUEST, true, &[])
        .await
        .map_err(|err| TunnelError::Protocol {
            endpoint: endpoint.to_string(),
            reason: "request failed".into(),
            source: Some(err),
        })?;
    if !ok {
        return Err(TunnelError::Protocol {
            endpoint: endpoint.to_string(),
            reason: "request rejected by relay".into(),
            source: None,
        });
    }

    serde_json::from_slice(&payload).map_err(|source| TunnelError::Decode {
        endpoint: endpoint.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtunnel::tunnel::session::testing::MockSession;

    const EP: &str = "ssh://relay.test:22";

    #[tokio::test]
    async fn decodes_object_reply() {
        let s = MockSession::new();
        s.reply(
            SERVER_INFO_REQUEST,
            Ok((true, br#"{"region":"eu","nodes":3}"#.to_vec())),
        );

        let info = fetch_server_info(s.as_ref(), EP).await.unwrap();
        assert_eq!(info.get("region"), Some(&Value::from("eu")));
        assert_eq!(info.get("nodes"), Some(&Value::from(3)));
        assert_eq!(s.calls(SERVER_INFO_REQUEST), 1);
    }

    #[tokio::test]
    async fn negative_ack_is_a_protocol_error() {
        let s = MockSession::new();
        s.reply(SERVER_INFO_REQUEST, Ok((false, Vec::new())));

        let err = fetch_server_info(s.as_ref(), EP).await.unwrap_err();
        assert!(matches!(err, TunnelError::Protocol { source: None, .. }));
        assert!(err.to_string().contains("error fetching server info"));
        assert!(!s.is_closed());
    }

    #[tokio::test]
    async fn transport_failure_is_a_protocol_error() {
        let s = MockSession::new();
        s.reply(SERVER_INFO_REQUEST, Err("broken pipe".into()));

        let err = fetch_server_info(s.as_ref(), EP).await.unwrap_err();
        assert!(matches!(err, TunnelError::Protocol { source: Some(_), .. }));
    }

    #[tokio::test]
    async fn undecodable_reply_is_a_decode_error() {
        let s = MockSession::new();
        for body in [&b"not json"[..], &b"[1,2]"[..], &b""[..]] {
            s.reply(SERVER_INFO_REQUEST, Ok((true, body.to_vec())));
            let err = fetch_server_info(s.as_ref(), EP).await.unwrap_err();
            assert!(matches!(err, TunnelError::Decode { .. }), "{body:?}: {err}");
        }
        assert!(!s.is_closed());
    }

    #[test]
    fn display_is_compact_json() {
        let info: ServerInfo = serde_json::from_str(r#"{"a":1}"#).unwrap();
        assert_eq!(info.to_string(), r#"{"a":1}"#);
    }
}
