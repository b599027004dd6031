//! Broadcast target predicates.

use std::sync::Arc;
use switchwire_conn::Connection;

/// Chooses which trusted connections a broadcast reaches.
pub type ConnectionFilter = Arc<dyn Fn(&Connection) -> bool + Send + Sync>;

/// Passes only connections every filter passes.
pub fn and_filter(filters: Vec<ConnectionFilter>) -> ConnectionFilter {
    Arc::new(move |conn| filters.iter().all(|f| f(conn)))
}

/// Connections that upgraded through `endpoint`.
pub fn endpoint_match(endpoint: impl Into<String>) -> ConnectionFilter {
    let endpoint = endpoint.into();
    Arc::new(move |conn| {
        conn.client_info()
            .is_some_and(|info| info.endpoint == endpoint)
    })
}

/// Connections registered with environment tag `env`.
pub fn env_match(env: impl Into<String>) -> ConnectionFilter {
    let env = env.into();
    Arc::new(move |conn| conn.client_info().is_some_and(|info| info.env_tag == env))
}

/// Connections registered with namespace tag `namespace`.
pub fn namespace_match(namespace: impl Into<String>) -> ConnectionFilter {
    let namespace = namespace.into();
    Arc::new(move |conn| {
        conn.client_info()
            .is_some_and(|info| info.namespace_tag == namespace)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::BoxFuture;
    use switchwire_conn::{
        CancellationToken, ConnectionSettings, MessageProcessor, ProcessError, Transport,
    };
    use switchwire_core::{ClientProxyInfo, DisconnectReason, ServerInfo};

    struct Idle;

    impl MessageProcessor for Idle {
        fn process_message(&self, _: &Arc<Connection>, _: &[u8]) -> Result<(), ProcessError> {
            Ok(())
        }
        fn on_connect<'a>(
            &'a self,
            _: &'a Arc<Connection>,
            _: &'a CancellationToken,
        ) -> BoxFuture<'a, ()> {
            Box::pin(async {})
        }
        fn on_disconnect(&self, _: &Connection, _: DisconnectReason) {}
    }

    fn proxy(endpoint: &str, namespace: &str, env: &str) -> Arc<Connection> {
        let (local, _peer) = Transport::pair();
        let info = ClientProxyInfo {
            id: "p".into(),
            endpoint: endpoint.into(),
            namespace_tag: namespace.into(),
            env_tag: env.into(),
            ..Default::default()
        };
        Connection::proxy(
            "p",
            local,
            ConnectionSettings::default(),
            Arc::new(Idle),
            info,
            ServerInfo::default(),
        )
    }

    #[test]
    fn stock_predicates() {
        let conn = proxy("/ws/config/change", "ns1", "prod");
        let conn: &Connection = &conn;
        assert!(endpoint_match("/ws/config/change")(conn));
        assert!(!endpoint_match("/ws/config/fullSync")(conn));
        assert!(env_match("prod")(conn));
        assert!(!env_match("dev")(conn));
        assert!(namespace_match("ns1")(conn));
    }

    #[test]
    fn and_requires_all() {
        let conn = proxy("/ws/config/change", "ns1", "prod");
        let conn: &Connection = &conn;
        let both = and_filter(vec![env_match("prod"), namespace_match("ns1")]);
        assert!(both(conn));
        let mismatch = and_filter(vec![env_match("prod"), namespace_match("ns2")]);
        assert!(!mismatch(conn));
        assert!(and_filter(Vec::new())(conn));
    }
}
