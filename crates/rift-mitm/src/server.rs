//! TCP accept loop.
//!
//! Each accepted connection is served on its own task by hyper's HTTP/1.1
//! server with upgrades enabled, which is what lets CONNECT tunnels take
//! over the raw connection.

use crate::proxy::Proxy;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use socket2::{Domain, Protocol, Socket, Type};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

const LISTEN_BACKLOG: i32 = 1024;

/// Create a non-blocking TCP listener with `SO_REUSEADDR` set.
pub fn create_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}

pub struct ProxyServer {
    proxy: Proxy,
    listener: TcpListener,
}

impl ProxyServer {
    pub fn bind(addr: SocketAddr, proxy: Proxy) -> std::io::Result<Self> {
        Ok(Self {
            proxy,
            listener: create_listener(addr)?,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    /// Serve until the task is cancelled.
    pub async fn run(self) {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves. Connections already accepted keep
    /// running on their own tasks.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Listening on http://{}", addr);
        }
        if self.proxy.authority().is_some() {
            info!("HTTPS decryption enabled");
        }

        tokio::pin!(shutdown);
        loop {
            let (stream, remote_addr) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(err) => {
                        // Usually descriptor exhaustion; back off instead of spinning.
                        error!("Failed to accept connection: {}", err);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                },
                _ = &mut shutdown => {
                    info!("Shutting down listener");
                    return;
                }
            };

            let _ = stream.set_nodelay(true);
            let proxy = self.proxy.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let proxy = proxy.clone();
                    async move { Ok::<_, Infallible>(proxy.serve(req, Some(remote_addr)).await) }
                });

                if let Err(err) = http1::Builder::new()
                    .preserve_header_case(true)
                    .title_case_headers(true)
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await
                {
                    debug!("Error serving connection from {}: {}", remote_addr, err);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_listener_on_ephemeral_port() {
        let listener = create_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_run_until_returns_on_shutdown() {
        let proxy = Proxy::builder().build().unwrap();
        let server = ProxyServer::bind("127.0.0.1:0".parse().unwrap(), proxy).unwrap();
        tokio::time::timeout(Duration::from_secs(2), server.run_until(async {}))
            .await
            .expect("server did not stop");
    }
}
