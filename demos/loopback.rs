//! Loopback DNS tunnel demo
//! Runs a server and a client over 127.0.0.1 and echoes one message through
//! TXT queries, using the simulated engine.
//!
//! RUST_LOG=debug cargo run --example loopback

use dnsquic::config::{ResolverSpec, TunnelConfig};
use dnsquic::engine::SimEngine;
use dnsquic::session::{spawn_client, spawn_server, ClientOptions, ServerOptions};
use dnsquic::{ConnectionEvent, PathMode};
use std::time::Duration;
use tokio::time::timeout;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let mut config = TunnelConfig::default();
    config.domains = vec!["t.example.com".to_string()];
    config.server.listen = "127.0.0.1:15353".parse()?;
    config.client.bind = "127.0.0.1:0".parse()?;
    config.client.idle_poll_interval = Duration::from_millis(100);
    config.client.resolvers = vec![ResolverSpec {
        address: config.server.listen.to_string(),
        mode: PathMode::Recursive,
    }];

    println!("=== DNS tunnel loopback ({}) ===", dnsquic::BUILD_DATE);

    let mut server = spawn_server(
        SimEngine::server(&rand::random::<[u8; 16]>()),
        ServerOptions::from_config(&config)?,
        config.server.listen,
        true,
    )
    .await?;
    println!("[SERVER] listening on {}", server.local_addr);

    let server_handle = server.handle.clone();
    let mut server_events = server.events;
    let echo = tokio::spawn(async move {
        while let Some(event) = server_events.recv().await {
            if let ConnectionEvent::Readable { cnx, stream } = event {
                let read = server_handle.read(cnx, stream).await?;
                if read.data.is_empty() {
                    continue;
                }
                println!(
                    "[SERVER] {} stream {}: {}",
                    cnx,
                    stream,
                    String::from_utf8_lossy(&read.data)
                );
                let mut reply = b"ECHO: ".to_vec();
                reply.extend_from_slice(&read.data);
                server_handle.write(cnx, stream, reply).await?;
                server_handle.finish(cnx, stream).await?;
            }
        }
        Ok::<_, dnsquic::TunnelError>(())
    });

    let mut client = spawn_client(
        SimEngine::client(),
        ClientOptions::from_config(&config)?,
        config.client.bind,
    )
    .await?;

    timeout(Duration::from_secs(5), async {
        while let Some(event) = client.events.recv().await {
            if matches!(event, ConnectionEvent::Ready { .. }) {
                break;
            }
        }
    })
    .await?;
    println!("[CLIENT] connected");

    let stream = client.handle.open_stream().await?;
    client
        .handle
        .write(stream, b"Hello from the DNS tunnel!".to_vec())
        .await?;

    let reply = timeout(Duration::from_secs(5), async {
        let mut reply = Vec::new();
        loop {
            let read = client.handle.read(stream).await?;
            reply.extend_from_slice(&read.data);
            if read.fin {
                return Ok::<_, dnsquic::TunnelError>(reply);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await??;
    println!("[CLIENT] received: {}", String::from_utf8_lossy(&reply));

    let stats = client.handle.stats().await?;
    println!("[CLIENT] stats: {}", stats.to_json());

    client.handle.shutdown().await?;
    server.handle.shutdown().await?;
    echo.abort();
    Ok(())
}
