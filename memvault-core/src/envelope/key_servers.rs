//! Key-share holders and quorum aggregation.
//!
//! Each configured server returns a share derived from the identity bytes.
//! Shares are opaque to the core; aggregation only requires that a weighted
//! quorum of responders agree byte-for-byte. Any disagreement among
//! responders is surfaced as [`Error::InconsistentKeyServers`] and never
//! retried silently.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::KeyServerConfig;

/// Fetch-share request issued to every configured server.
#[derive(Debug, Clone)]
pub struct FetchShareRequest {
    /// Session-key handle authenticating the caller.
    pub session_handle: Uuid,
    /// Approval message naming the content identity and requesting identity.
    pub approval_message: Vec<u8>,
    /// Identity bytes the share is derived over.
    pub identity_bytes: Vec<u8>,
    /// Requesting identity, textual form.
    pub requesting_identity: String,
}

/// Approval message format: names the content identity and the requester.
#[must_use]
pub fn approval_message(content_identity: &str, requesting_identity: &str) -> Vec<u8> {
    format!("Approve key release for {content_identity} to {requesting_identity}").into_bytes()
}

/// One key-share holder. Transport and policy live behind this trait.
#[async_trait]
pub trait KeyServer: Send + Sync {
    /// Stable server id (matches the configured `object_id`).
    fn id(&self) -> &str;

    /// Return this server's share for the request, or an error when the
    /// server is unreachable or refuses.
    async fn fetch_share(&self, request: &FetchShareRequest) -> anyhow::Result<Vec<u8>>;
}

/// A configured server together with its transport.
pub struct ServerHandle {
    pub config: KeyServerConfig,
    pub transport: Arc<dyn KeyServer>,
}

/// Outcome of one aggregation round.
#[derive(Debug)]
pub struct AggregatedShare {
    pub share: Vec<u8>,
    /// Weight of the agreeing responders.
    pub agreeing_weight: u32,
    pub responding_weight: u32,
}

/// Fan the request out to all servers and aggregate replies.
///
/// * All responders must agree byte-for-byte, otherwise
///   [`Error::InconsistentKeyServers`].
/// * The agreeing weight must reach `quorum`, otherwise
///   [`Error::KeyServerUnavailable`].
pub async fn fetch_quorum_share(
    servers: &[ServerHandle],
    request: &FetchShareRequest,
    quorum: u32,
    timeout: Duration,
) -> Result<AggregatedShare> {
    if servers.is_empty() {
        return Err(Error::Configuration("no key servers configured".into()));
    }

    let futures = servers.iter().map(|server| async move {
        let reply = tokio::time::timeout(timeout, server.transport.fetch_share(request)).await;
        match reply {
            Ok(Ok(share)) => Some((server.config.weight, share)),
            Ok(Err(err)) => {
                tracing::warn!(server = server.config.object_id, error = %err, "key server refused");
                None
            }
            Err(_) => {
                tracing::warn!(server = server.config.object_id, "key server timed out");
                None
            }
        }
    });

    let replies: Vec<Option<(u32, Vec<u8>)>> = futures::future::join_all(futures).await;
    let replies: Vec<(u32, Vec<u8>)> = replies.into_iter().flatten().collect();

    let responding_weight: u32 = replies.iter().map(|(w, _)| *w).sum();
    if replies.is_empty() {
        return Err(Error::KeyServerUnavailable(
            "no key server responded".into(),
        ));
    }

    // Group replies by share value; all responders must agree.
    let mut groups: Vec<(&[u8], u32)> = Vec::new();
    for (weight, share) in &replies {
        match groups.iter_mut().find(|(bytes, _)| bytes == &share.as_slice()) {
            Some((_, w)) => *w += weight,
            None => groups.push((share.as_slice(), *weight)),
        }
    }

    let (best_share, agreeing_weight) = groups
        .iter()
        .max_by_key(|(_, weight)| *weight)
        .map(|(bytes, weight)| (bytes.to_vec(), *weight))
        .unwrap_or_default();

    if groups.len() > 1 {
        return Err(Error::InconsistentKeyServers {
            agreeing: agreeing_weight,
            responding: responding_weight,
        });
    }

    if agreeing_weight < quorum {
        return Err(Error::KeyServerUnavailable(format!(
            "quorum not reached: weight {agreeing_weight} of required {quorum}"
        )));
    }

    Ok(AggregatedShare {
        share: best_share,
        agreeing_weight,
        responding_weight,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::KeyServerMode;

    struct FixedServer {
        id: String,
        share: Option<Vec<u8>>,
    }

    #[async_trait]
    impl KeyServer for FixedServer {
        fn id(&self) -> &str {
            &self.id
        }

        async fn fetch_share(&self, _request: &FetchShareRequest) -> anyhow::Result<Vec<u8>> {
            self.share
                .clone()
                .ok_or_else(|| anyhow::anyhow!("server down"))
        }
    }

    fn handle(id: &str, weight: u32, share: Option<&[u8]>) -> ServerHandle {
        ServerHandle {
            config: KeyServerConfig {
                object_id: id.to_string(),
                url: format!("https://{id}.example"),
                weight,
                mode: KeyServerMode::Open,
            },
            transport: Arc::new(FixedServer {
                id: id.to_string(),
                share: share.map(<[u8]>::to_vec),
            }),
        }
    }

    fn request() -> FetchShareRequest {
        FetchShareRequest {
            session_handle: Uuid::new_v4(),
            approval_message: approval_message("self:0xa1", "self:0xa1"),
            identity_bytes: b"self:0xa1".to_vec(),
            requesting_identity: "self:0xa1".to_string(),
        }
    }

    const TIMEOUT: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn unanimous_servers_reach_quorum() {
        let servers = vec![
            handle("s1", 1, Some(b"share")),
            handle("s2", 1, Some(b"share")),
            handle("s3", 1, Some(b"share")),
        ];
        let agg = fetch_quorum_share(&servers, &request(), 2, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(agg.share, b"share");
        assert_eq!(agg.agreeing_weight, 3);
    }

    #[tokio::test]
    async fn disagreement_is_never_masked() {
        // Two of three corrupted: even though the corrupt pair agrees with
        // itself, disagreement across responders must surface.
        let servers = vec![
            handle("s1", 1, Some(b"good")),
            handle("s2", 1, Some(b"evil")),
            handle("s3", 1, Some(b"evil")),
        ];
        let err = fetch_quorum_share(&servers, &request(), 2, TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InconsistentKeyServers { .. }));
    }

    #[tokio::test]
    async fn down_servers_reduce_weight_but_not_consistency() {
        let servers = vec![
            handle("s1", 1, Some(b"share")),
            handle("s2", 1, None),
            handle("s3", 1, Some(b"share")),
        ];
        let agg = fetch_quorum_share(&servers, &request(), 2, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(agg.agreeing_weight, 2);
    }

    #[tokio::test]
    async fn below_quorum_is_unavailable() {
        let servers = vec![
            handle("s1", 1, Some(b"share")),
            handle("s2", 1, None),
            handle("s3", 1, None),
        ];
        let err = fetch_quorum_share(&servers, &request(), 2, TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::KeyServerUnavailable(_)));
    }

    #[tokio::test]
    async fn weights_count_toward_quorum() {
        let servers = vec![handle("s1", 3, Some(b"share")), handle("s2", 1, None)];
        let agg = fetch_quorum_share(&servers, &request(), 2, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(agg.agreeing_weight, 3);
    }
}
