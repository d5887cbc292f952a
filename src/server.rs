use anyhow::{Context, Result};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::dispatch::DispatchHandle;
use crate::protocol::{self, ConnectionMeta, Protocol};
use crate::session::{Link, SessionRegistry};

const READ_CHUNK: usize = 4096;

/// Listen on every configured protocol port until one listener fails.
pub async fn run(config: &Config, registry: SessionRegistry, dispatch: DispatchHandle) -> Result<()> {
    let h02 = TcpListener::bind(&config.h02_listen)
        .await
        .with_context(|| format!("binding H02 listener on {}", config.h02_listen))?;
    let gt06 = TcpListener::bind(&config.gt06_listen)
        .await
        .with_context(|| format!("binding GT06 listener on {}", config.gt06_listen))?;
    let auto = match &config.auto_listen {
        Some(addr) => Some(
            TcpListener::bind(addr)
                .await
                .with_context(|| format!("binding auto-detect listener on {addr}"))?,
        ),
        None => None,
    };

    let sniffing = async {
        match auto {
            Some(listener) => serve(listener, None, registry.clone(), dispatch.clone()).await,
            None => Ok(()),
        }
    };
    tokio::try_join!(
        serve(h02, Some(Protocol::H02), registry.clone(), dispatch.clone()),
        serve(gt06, Some(Protocol::Gt06), registry.clone(), dispatch.clone()),
        sniffing,
    )?;
    Ok(())
}

/// Accept loop for one listener. Each connection gets its own task. Without
/// a `declared` protocol, each connection is identified by its first bytes.
pub async fn serve(
    listener: TcpListener,
    declared: Option<Protocol>,
    registry: SessionRegistry,
    dispatch: DispatchHandle,
) -> Result<()> {
    info!(
        protocol = declared.map_or("auto", |p| p.name()),
        addr = %listener.local_addr()?,
        "Listening for devices"
    );
    loop {
        let (stream, peer) = listener.accept().await?;
        let registry = registry.clone();
        let dispatch = dispatch.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, declared, registry, dispatch).await {
                warn!(peer = %peer, error = %e, "Connection ended with error");
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    declared: Option<Protocol>,
    registry: SessionRegistry,
    dispatch: DispatchHandle,
) -> Result<()> {
    let mut buf = vec![0u8; READ_CHUNK];
    let mut unread = 0;
    if declared.is_none() {
        unread = stream.read(&mut buf).await?;
        if unread == 0 {
            return Ok(());
        }
    }

    let protocol = protocol::resolve(&ConnectionMeta {
        declared: declared.map(|p| p.name()),
        peek: &buf[..unread],
        peer: Some(peer),
    })?;
    let mut link = Link::new(protocol, registry);
    debug!(link = link.id(), peer = %peer, protocol = %protocol, "Connection opened");

    let outcome: Result<()> = loop {
        let n = if unread > 0 {
            std::mem::take(&mut unread)
        } else {
            match stream.read(&mut buf).await {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(e.into()),
            }
        };
        match link.feed(&buf[..n]).await {
            Ok(mut output) => {
                if !output.accepted.ack.is_empty() {
                    if let Err(e) = stream.write_all(&output.accepted.ack).await {
                        error!(link = link.id(), error = %e, "Failed to write ack");
                    }
                }
                dispatch.forward(&mut output);
            }
            Err(e) => break Err(e.into()),
        }
    };

    debug!(link = link.id(), peer = %peer, device_id = ?link.device_id(), "Connection closed");
    if let Some(trip) = link.close().await {
        dispatch.submit_trip(trip);
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewaySettings;
    use crate::dispatch::Dispatcher;
    use crate::session::SessionSettings;
    use crate::storage::MemoryGateway;
    use std::time::Duration;

    const LOGIN: [u8; 18] = [
        0x78, 0x78, 0x0D, 0x01, 0x01, 0x23, 0x45, 0x67, 0x89, 0x01, 0x23, 0x45, 0x00, 0x01, 0x8C,
        0xDD, 0x0D, 0x0A,
    ];
    const LOGIN_ACK: [u8; 10] = [0x78, 0x78, 0x05, 0x01, 0x00, 0x01, 0xD9, 0xDC, 0x0D, 0x0A];

    async fn listen(
        declared: Option<Protocol>,
    ) -> (SocketAddr, SessionRegistry, DispatchHandle, MemoryGateway) {
        let gateway = MemoryGateway::new();
        let (dispatch, _task) = Dispatcher::spawn(gateway.clone(), None, GatewaySettings::default());
        let registry = SessionRegistry::new(SessionSettings::default());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, declared, registry.clone(), dispatch.clone()));
        (addr, registry, dispatch, gateway)
    }

    async fn wait_disconnected(registry: &SessionRegistry) {
        for _ in 0..100 {
            if !registry.is_empty() && registry.connected().await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn gt06_login_is_acknowledged_over_tcp() {
        let (addr, registry, dispatch, gateway) = listen(Some(Protocol::Gt06)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&LOGIN).await.unwrap();

        let mut ack = [0u8; 10];
        client.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack, LOGIN_ACK);

        drop(client);
        wait_disconnected(&registry).await;
        assert_eq!(registry.connected().await, 0);

        assert!(dispatch.shutdown().await.is_empty());
        let store = gateway.store();
        assert_eq!(store.devices.len(), 1);
        assert_eq!(store.devices[0].serial, "123456789012345");
    }

    #[tokio::test]
    async fn undeclared_listener_detects_protocol_from_first_bytes() {
        let (addr, registry, dispatch, gateway) = listen(None).await;

        let mut gt06 = TcpStream::connect(addr).await.unwrap();
        gt06.write_all(&LOGIN).await.unwrap();
        let mut ack = [0u8; 10];
        gt06.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack, LOGIN_ACK);
        drop(gt06);

        let mut h02 = TcpStream::connect(addr).await.unwrap();
        h02.write_all(b"*HQ,1234567890,HTBT#").await.unwrap();
        drop(h02);

        for _ in 0..100 {
            if registry.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        wait_disconnected(&registry).await;

        assert!(dispatch.shutdown().await.is_empty());
        let mut devices: Vec<(String, Protocol)> = gateway
            .store()
            .devices
            .iter()
            .map(|d| (d.serial.clone(), d.protocol))
            .collect();
        devices.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            devices,
            vec![
                ("1234567890".to_string(), Protocol::H02),
                ("123456789012345".to_string(), Protocol::Gt06),
            ]
        );
    }

    #[tokio::test]
    async fn unrecognized_bytes_close_the_connection() {
        let (addr, registry, _dispatch, _gateway) = listen(None).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let mut rest = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest)).await;
        // closed by the server, not left hanging
        assert!(read.is_ok());
        assert!(registry.is_empty());
    }
}
