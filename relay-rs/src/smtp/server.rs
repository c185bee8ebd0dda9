use crate::config::Config;
use crate::error::Result;
use crate::session::SessionBackend;
use crate::smtp::connection::{ConnectionSettings, SmtpConnection};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, info_span, Instrument};

/// TCP acceptor: one task and one fresh session per connection
pub struct SmtpServer<B: SessionBackend> {
    listen_addr: String,
    settings: ConnectionSettings,
    backend: Arc<B>,
}

impl<B: SessionBackend> SmtpServer<B> {
    pub fn new(config: &Config, backend: Arc<B>) -> Self {
        Self {
            listen_addr: config.smtp.listen_addr.clone(),
            settings: ConnectionSettings::from_config(config),
            backend,
        }
    }

    /// Bind the configured address and serve forever
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        info!("SMTP relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, addr)) => self.spawn_connection(socket, addr),
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    fn spawn_connection(&self, socket: TcpStream, addr: SocketAddr) {
        info!("New SMTP connection from {}", addr);

        let session = self.backend.new_session(addr);
        let connection = SmtpConnection::new(session, self.settings.clone());
        let span = info_span!("smtp", peer = %addr);

        tokio::spawn(
            async move {
                if let Err(e) = connection.run(socket).await {
                    error!("Connection error: {}", e);
                }
                info!("Connection closed");
            }
            .instrument(span),
        );
    }
}
