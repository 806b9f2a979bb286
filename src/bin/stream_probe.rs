//! Diagnostic client: connect, log in, then print incoming stanzas.
//!
//! Configuration comes from the environment:
//!   PROBE_HOST     socket host            (default 127.0.0.1)
//!   PROBE_PORT     socket port            (default 5222)
//!   PROBE_DOMAIN   service name           (default localhost)
//!   PROBE_USER     username               (anonymous login when unset)
//!   PROBE_PASS     password
//!   PROBE_RESOURCE resource               (default "probe")
//!   PROBE_TLS      required|enabled|disabled (default enabled)

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use stanzastream::{
    AcceptAll, ConnectionEvent, SecurityMode, Stanza, XmppConnection,
};

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    stanzastream_tools::init_tracing();

    let host = env_or("PROBE_HOST", "127.0.0.1");
    let port: u16 = env_or("PROBE_PORT", "5222").parse().context("PROBE_PORT")?;
    let domain = env_or("PROBE_DOMAIN", "localhost");
    let resource = env_or("PROBE_RESOURCE", "probe");
    let security = match env_or("PROBE_TLS", "enabled").as_str() {
        "required" => SecurityMode::Required,
        "disabled" => SecurityMode::Disabled,
        _ => SecurityMode::Enabled,
    };

    let config = stanzastream::builder()
        .address(host.clone(), port, domain.clone())
        .security(security)
        .reply_timeout(Duration::from_secs(5))
        .build();
    let connection = XmppConnection::new(config);

    connection.add_connection_listener(Arc::new(|event: &ConnectionEvent| match event {
        ConnectionEvent::ReconnectingIn(secs) if *secs > 0 => {
            println!("... reconnecting in {secs}s");
        }
        other => println!("event: {other:?}"),
    }));

    println!("Connecting to {host}:{port} ({domain})...");
    connection.connect().await.context("connect")?;
    println!("Connected; secure={}", connection.is_secure());

    let address = match std::env::var("PROBE_USER") {
        Ok(user) => {
            let pass = std::env::var("PROBE_PASS").context("PROBE_PASS required with PROBE_USER")?;
            connection.login(&user, &pass, &resource).await.context("login")?
        }
        Err(_) => connection
            .login_anonymously()
            .await
            .context("anonymous login")?,
    };
    println!("Logged in as {address}");
    println!("Press Ctrl+C to stop\n");

    connection.add_stanza_listener(
        Arc::new(|stanza: &Stanza| -> stanzastream::Result<()> {
            println!("<< {}", stanza.as_xml());
            Ok(())
        }),
        AcceptAll,
    );

    tokio::signal::ctrl_c().await.context("signal handler")?;
    println!("Shutting down...");
    connection.disconnect().await;
    println!("Shutdown complete");
    Ok(())
}
