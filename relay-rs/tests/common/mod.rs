#![allow(dead_code)]

use relay_rs::config::Config;
use relay_rs::relay::MockRelay;
use relay_rs::session::context::fields;
use relay_rs::session::{DiagnosticContext, SessionFactory};
use relay_rs::smtp::SmtpServer;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Start a relay on an ephemeral port backed by `relay`
pub async fn start_relay(relay: Arc<MockRelay>) -> SocketAddr {
    let mut config = Config::default();
    config.server.domain = "relay.test".to_string();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let factory = SessionFactory::new(relay, DiagnosticContext::new().with_base(fields::SERVICE, "relay-rs"));
    let server = SmtpServer::new(&config, Arc::new(factory));
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    addr
}

pub struct SmtpTestClient {
    stream: BufReader<TcpStream>,
}

impl SmtpTestClient {
    /// Connect and consume the greeting
    pub async fn connect(addr: SocketAddr) -> Result<Self, String> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| format!("Failed to connect to SMTP: {}", e))?;

        let mut client = Self {
            stream: BufReader::new(stream),
        };

        let greeting = client.read_response().await?;
        if !greeting.starts_with("220") {
            return Err(format!("Unexpected greeting: {}", greeting));
        }

        Ok(client)
    }

    /// Send one command and read its reply
    pub async fn command(&mut self, command: &str) -> Result<String, String> {
        self.send_line(command).await?;
        self.read_response().await
    }

    pub async fn ehlo(&mut self, hostname: &str) -> Result<String, String> {
        self.command(&format!("EHLO {}", hostname)).await
    }

    pub async fn mail_from(&mut self, from: &str) -> Result<String, String> {
        self.command(&format!("MAIL FROM:<{}>", from)).await
    }

    pub async fn rcpt_to(&mut self, to: &str) -> Result<String, String> {
        self.command(&format!("RCPT TO:<{}>", to)).await
    }

    /// DATA with `lines` sent dot-stuffed, then the terminator
    pub async fn data(&mut self, lines: &[&str]) -> Result<String, String> {
        let response = self.command("DATA").await?;
        if !response.starts_with("354") {
            return Ok(response);
        }

        for line in lines {
            if line.starts_with('.') {
                self.send_line(&format!(".{}", line)).await?;
            } else {
                self.send_line(line).await?;
            }
        }
        self.send_line(".").await?;
        self.read_response().await
    }

    pub async fn quit(mut self) -> Result<String, String> {
        self.command("QUIT").await
    }

    pub async fn send_line(&mut self, line: &str) -> Result<(), String> {
        let line = format!("{}\r\n", line);
        self.stream
            .get_mut()
            .write_all(line.as_bytes())
            .await
            .map_err(|e| format!("Failed to send command: {}", e))?;
        self.stream
            .get_mut()
            .flush()
            .await
            .map_err(|e| format!("Failed to flush: {}", e))
    }

    /// Half-close the connection and read whatever the server still says
    pub async fn hang_up(mut self) -> String {
        let _ = self.stream.get_mut().shutdown().await;
        let mut rest = String::new();
        let _ = self.stream.read_to_string(&mut rest).await;
        rest
    }

    /// Read a reply, following `250-` continuation lines
    pub async fn read_response(&mut self) -> Result<String, String> {
        let mut full_response = String::new();
        let mut line = String::new();

        loop {
            line.clear();
            self.stream
                .read_line(&mut line)
                .await
                .map_err(|e| format!("Failed to read response: {}", e))?;

            if line.is_empty() {
                break;
            }

            full_response.push_str(&line);

            if line.len() >= 4 && line.as_bytes()[3] == b' ' {
                break;
            }
        }

        Ok(full_response.trim().to_string())
    }
}
