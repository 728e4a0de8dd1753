use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use overmesh_api::ApiState;
use overmesh_core::IdRegistry;
use overmesh_services::MemoryNetwork;

use crate::*;

/// Serve `node` on an ephemeral loopback port. Returns the port.
async fn serve(node: &Node, name: &str) -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let state = ApiState {
        rendezvous: node.rendezvous.clone(),
        resolver: node.resolver.clone(),
        ids: Arc::new(IdRegistry::standard()),
        node_name: name.to_string(),
        started_at: Instant::now(),
    };
    tokio::spawn(async move {
        if let Err(e) = overmesh_api::serve_on(listener, state).await {
            eprintln!("api server failed: {e}");
        }
    });
    Ok(port)
}

/// Minimal HTTP/1.1 client: one request per connection.
async fn request(port: u16, method: &str, path: &str, body: Option<Value>) -> Result<(u16, Value)> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let body = body.map(|b| b.to_string()).unwrap_or_default();
    let req = format!(
        "{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\
         Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(req.as_bytes()).await?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await?;
    let text = String::from_utf8(raw)?;
    let (head, body) = text.split_once("\r\n\r\n").context("no header terminator")?;
    let status: u16 = head
        .split_whitespace()
        .nth(1)
        .context("no status code")?
        .parse()?;
    if body.is_empty() {
        return Ok((status, Value::Null));
    }
    match serde_json::from_str(body) {
        Ok(v) => Ok((status, v)),
        Err(_) if status >= 400 => Ok((status, Value::String(body.to_string()))),
        Err(e) => bail!("bad JSON body {body:?}: {e}"),
    }
}

#[tokio::test]
async fn status_reports_rendezvous_state() {
    let net = MemoryNetwork::new();
    let rdv = spawn_node(&net, "rdv", rendezvous_config(), &[]);
    let edge = spawn_node(&net, "edge", edge_config(), &[]);
    lease(&net, &edge, &rdv);
    edge.resolver
        .register_handler("search", Arc::new(Recorder::default()));

    let result = async {
        let port = serve(&edge, "edge").await?;

        let (code, status) = request(port, "GET", "/api/status", None).await?;
        assert_eq!(code, 200);
        assert_eq!(status["peer"], edge.peer.to_string());
        assert_eq!(status["name"], "edge");
        assert_eq!(status["role"], "edge");
        assert_eq!(status["rendezvous_connections"], 1);
        assert_eq!(status["query_handlers"], 1);

        let (_, handlers) = request(port, "GET", "/api/handlers", None).await?;
        assert_eq!(handlers["query"], serde_json::json!(["search"]));

        let (_, rendezvous) = request(port, "GET", "/api/rendezvous", None).await?;
        let connections = rendezvous["connections"].as_array().context("connections")?;
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0]["peer"], rdv.peer.to_string());
        assert_eq!(connections[0]["state"], "leased");
        Ok::<_, anyhow::Error>(())
    }
    .await;

    if let Err(e) = result {
        panic!("status_reports_rendezvous_state: {e}");
    }
}

#[tokio::test]
async fn challenge_and_disconnect_over_http() {
    let net = MemoryNetwork::new();
    let rdv = spawn_node(&net, "rdv", rendezvous_config(), &[]);
    let edge = spawn_node(&net, "edge", edge_config(), &[]);
    lease(&net, &edge, &rdv);
    let port = serve(&edge, "edge").await.unwrap();

    let (code, _) = request(port, "POST", "/api/rendezvous/not-a-peer/challenge", Some(serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(code, 400);

    let path = format!("/api/rendezvous/{}/challenge", rdv.peer);
    let (code, body) = request(port, "POST", &path, Some(serde_json::json!({ "delay_ms": 1000 })))
        .await
        .unwrap();
    assert_eq!(code, 200);
    assert_eq!(body["found"], true);
    let snap = edge.rendezvous.connection(&rdv.peer).unwrap();
    assert!(snap.lease_remaining_ms <= 1000);

    let path = format!("/api/rendezvous/{}", rdv.peer);
    let (code, body) = request(port, "DELETE", &path, None).await.unwrap();
    assert_eq!(code, 200);
    assert_eq!(body["found"], true);
    assert!(!edge.rendezvous.is_connected(&rdv.peer));

    net.run_until_idle();
    assert!(rdv.rendezvous.clients().is_empty());
}
