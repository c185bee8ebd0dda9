use crate::config::Config;
use crate::error::{RelayRsError, Result};
use crate::security::{self, AuthMechanism};
use crate::session::{SessionError, SessionHooks};
use crate::smtp::commands::SmtpCommand;
use crate::smtp::reply::{EnhancedCode, SmtpReply};
use bytes::Bytes;
use futures::stream::{self, Stream};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tokio_util::io::StreamReader;
use tracing::{debug, error, info, warn};

/// Maximum number of errors before disconnecting
const MAX_ERRORS: usize = 10;

/// Per-connection protocol settings, taken from [`Config`]
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub domain: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub allow_auth: bool,
    pub max_line_length: usize,
}

impl ConnectionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            domain: config.server.domain.clone(),
            read_timeout: config.smtp.read_timeout(),
            write_timeout: config.smtp.write_timeout(),
            allow_auth: config.smtp.allow_insecure_auth,
            max_line_length: config.smtp.max_line_length,
        }
    }
}

/// What to do after a command has been answered
#[derive(Debug, PartialEq)]
enum Flow {
    Continue,
    Close,
}

/// Result of reading one line from the client
#[derive(Debug, PartialEq)]
enum Incoming {
    Line(Vec<u8>),
    /// Line exceeded the limit; its bytes were discarded up to the newline
    TooLong(usize),
    Closed,
    TimedOut,
}

/// Client answer to an AUTH challenge
enum Answer {
    Line(String),
    TooLong,
    Hangup,
}

/// SMTP protocol engine for one connection
///
/// Parses commands, enforces command ordering, and calls into the session
/// hooks. The session never sees two calls at once, and `logout` is called
/// exactly once however the connection ends.
pub struct SmtpConnection<S: SessionHooks> {
    session: S,
    settings: ConnectionSettings,
    greeted: bool,
    authenticated: bool,
    in_transaction: bool,
    error_count: usize,
}

impl<S: SessionHooks> SmtpConnection<S> {
    pub fn new(session: S, settings: ConnectionSettings) -> Self {
        Self {
            session,
            settings,
            greeted: false,
            authenticated: false,
            in_transaction: false,
            error_count: 0,
        }
    }

    /// Serve the connection until QUIT, EOF, timeout, or I/O failure
    pub async fn run<T>(mut self, stream: T) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut stream = BufReader::new(stream);
        let result = self.serve(&mut stream).await;
        self.session.logout();
        result
    }

    async fn serve<T>(&mut self, stream: &mut BufReader<T>) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let greeting = SmtpReply::new(
            220,
            None,
            format!("{} ESMTP Service Ready", self.settings.domain),
        );
        self.write_reply(stream, &greeting).await?;

        loop {
            // Security: disconnect abusive clients
            if self.error_count >= MAX_ERRORS {
                warn!("Too many errors, disconnecting");
                self.write_reply(
                    stream,
                    &SmtpReply::service_closing("Too many errors, closing connection"),
                )
                .await?;
                return Ok(());
            }

            let line = match self.read_line(stream).await? {
                Incoming::Line(line) => line,
                Incoming::Closed => {
                    debug!("Client disconnected");
                    return Ok(());
                }
                Incoming::TimedOut => {
                    warn!("Command timeout, disconnecting");
                    self.write_reply(stream, &SmtpReply::service_closing("Timeout, closing connection"))
                        .await?;
                    return Ok(());
                }
                Incoming::TooLong(len) => {
                    error!("Line too long: {} bytes", len);
                    self.write_reply(stream, &line_too_long()).await?;
                    self.error_count += 1;
                    continue;
                }
            };

            let text = String::from_utf8_lossy(&line);
            let text = text.trim_end();
            debug!("< {}", redact(text));

            let cmd = match SmtpCommand::parse(text) {
                Ok(cmd) => cmd,
                Err(e) => {
                    error!("Command parse error: {}", e);
                    self.write_reply(stream, &SmtpReply::syntax_error(e.to_string())).await?;
                    self.error_count += 1;
                    continue;
                }
            };

            if self.handle_command(cmd, stream).await? == Flow::Close {
                return Ok(());
            }
        }
    }

    async fn handle_command<T>(&mut self, cmd: SmtpCommand, stream: &mut BufReader<T>) -> Result<Flow>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let reply = match cmd {
            SmtpCommand::Helo(client) => {
                self.greet();
                SmtpReply::new(250, None, format!("{} Hello {}", self.settings.domain, client))
            }
            SmtpCommand::Ehlo(client) => {
                self.greet();
                let mut lines = vec![
                    format!("{} Hello {}", self.settings.domain, client),
                    "8BITMIME".to_string(),
                ];
                if self.settings.allow_auth {
                    lines.push("AUTH PLAIN LOGIN".to_string());
                }
                SmtpReply::new(250, None, lines.join("\n"))
            }
            SmtpCommand::Auth(mechanism, initial) => {
                return self.handle_auth(&mechanism, initial, stream).await;
            }
            SmtpCommand::MailFrom(from) => {
                if !self.greeted {
                    SmtpReply::bad_sequence("Send HELO/EHLO first")
                } else {
                    match self.session.set_sender(&from) {
                        Ok(()) => {
                            self.in_transaction = true;
                            SmtpReply::ok()
                        }
                        Err(e) => e.to_reply(),
                    }
                }
            }
            SmtpCommand::RcptTo(to) => {
                if !self.in_transaction {
                    SmtpReply::bad_sequence("Need MAIL command")
                } else {
                    match self.session.add_recipient(&to) {
                        Ok(()) => SmtpReply::ok(),
                        Err(e) => e.to_reply(),
                    }
                }
            }
            SmtpCommand::Data => {
                if !self.in_transaction {
                    SmtpReply::bad_sequence("Need MAIL command")
                } else {
                    return self.handle_data(stream).await;
                }
            }
            SmtpCommand::Rset => {
                self.session.reset();
                self.in_transaction = false;
                SmtpReply::ok()
            }
            SmtpCommand::Noop => SmtpReply::ok(),
            SmtpCommand::Quit => {
                let reply = SmtpReply::new(
                    221,
                    Some(EnhancedCode(2, 0, 0)),
                    format!("{} closing connection", self.settings.domain),
                );
                self.write_reply(stream, &reply).await?;
                return Ok(Flow::Close);
            }
            SmtpCommand::Unknown(cmd) => {
                warn!("Unknown command: {}", cmd);
                SmtpReply::new(502, Some(EnhancedCode(5, 5, 1)), "Command not implemented")
            }
        };

        if reply.is_permanent() {
            self.error_count += 1;
        }
        self.write_reply(stream, &reply).await?;
        Ok(Flow::Continue)
    }

    /// HELO/EHLO start over with a clean transaction
    fn greet(&mut self) {
        self.greeted = true;
        if self.in_transaction {
            self.session.reset();
            self.in_transaction = false;
        }
    }

    async fn handle_data<T>(&mut self, stream: &mut BufReader<T>) -> Result<Flow>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.write_reply(
            stream,
            &SmtpReply::new(354, None, "Start mail input; end with <CRLF>.<CRLF>"),
        )
        .await?;

        let (outcome, drained) = {
            let mut body = StreamReader::new(Box::pin(data_stream(
                stream,
                self.settings.read_timeout,
                self.settings.max_line_length,
            )));
            let outcome = self.session.receive_body(&mut body).await;
            // Whatever the session left unread must not be taken for commands
            let drained = tokio::io::copy(&mut body, &mut tokio::io::sink()).await;
            (outcome, drained)
        };

        let (reply, flow) = match outcome {
            Ok(reply) => {
                self.in_transaction = false;
                (reply, Flow::Continue)
            }
            // The stream broke mid-message: framing is lost, so hang up
            Err(e @ SessionError::BodyRead(_)) => (e.to_reply(), Flow::Close),
            Err(e) => (e.to_reply(), Flow::Continue),
        };

        if let Err(e) = drained {
            warn!("Error draining message data: {}", e);
            self.write_reply(stream, &reply).await?;
            return Ok(Flow::Close);
        }

        info!("DATA: {}", reply);
        self.write_reply(stream, &reply).await?;
        Ok(flow)
    }

    async fn handle_auth<T>(
        &mut self,
        mechanism: &str,
        initial: Option<String>,
        stream: &mut BufReader<T>,
    ) -> Result<Flow>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let refusal = if !self.settings.allow_auth {
            Some(SmtpReply::new(502, Some(EnhancedCode(5, 5, 1)), "AUTH not available"))
        } else if !self.greeted {
            Some(SmtpReply::bad_sequence("Send HELO/EHLO first"))
        } else if self.authenticated {
            Some(SmtpReply::bad_sequence("Already authenticated"))
        } else {
            None
        };
        if let Some(reply) = refusal {
            self.write_reply(stream, &reply).await?;
            return Ok(Flow::Continue);
        }

        let mechanism = match AuthMechanism::parse(mechanism) {
            Some(m) => m,
            None => {
                self.write_reply(
                    stream,
                    &SmtpReply::new(504, Some(EnhancedCode(5, 5, 4)), "Unrecognized authentication type"),
                )
                .await?;
                return Ok(Flow::Continue);
            }
        };

        info!("AUTH {} initiated", mechanism.as_str());

        let credentials = match mechanism {
            AuthMechanism::Plain => {
                let data = match initial {
                    Some(data) => data,
                    None => match self.auth_challenge(stream, "").await? {
                        Answer::Line(data) => data,
                        other => return self.abandon_auth(stream, other).await,
                    },
                };
                self.decode_or_cancel(&data, security::decode_plain)
            }
            AuthMechanism::Login => {
                // Server sends base64 "Username:" then "Password:"
                let username = match initial {
                    Some(data) => data,
                    None => match self.auth_challenge(stream, "VXNlcm5hbWU6").await? {
                        Answer::Line(data) => data,
                        other => return self.abandon_auth(stream, other).await,
                    },
                };
                let password = match self.auth_challenge(stream, "UGFzc3dvcmQ6").await? {
                    Answer::Line(data) => data,
                    other => return self.abandon_auth(stream, other).await,
                };
                self.decode_or_cancel(&username, security::decode_login)
                    .and_then(|user| {
                        self.decode_or_cancel(&password, security::decode_login)
                            .map(|pass| (user, pass))
                    })
            }
        };

        let reply = match credentials {
            Ok((identity, credential)) => match self.session.authenticate(&identity, &credential) {
                Ok(()) => {
                    self.authenticated = true;
                    info!("Authentication accepted for {}", identity);
                    SmtpReply::new(235, Some(EnhancedCode(2, 7, 0)), "Authentication succeeded")
                }
                Err(e) => e.to_reply(),
            },
            Err(reply) => {
                self.error_count += 1;
                reply
            }
        };

        self.write_reply(stream, &reply).await?;
        Ok(Flow::Continue)
    }

    /// Send a 334 challenge and read the client's answer
    async fn auth_challenge<T>(&mut self, stream: &mut BufReader<T>, challenge: &str) -> Result<Answer>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.write_reply(stream, &SmtpReply::new(334, None, challenge)).await?;

        match self.read_line(stream).await? {
            Incoming::Line(line) => Ok(Answer::Line(String::from_utf8_lossy(&line).trim().to_string())),
            Incoming::TooLong(_) => Ok(Answer::TooLong),
            Incoming::Closed => Ok(Answer::Hangup),
            Incoming::TimedOut => {
                warn!("AUTH timeout, disconnecting");
                self.write_reply(stream, &SmtpReply::service_closing("Timeout, closing connection"))
                    .await?;
                Ok(Answer::Hangup)
            }
        }
    }

    /// End an AUTH exchange that got no usable answer
    async fn abandon_auth<T>(&mut self, stream: &mut BufReader<T>, answer: Answer) -> Result<Flow>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        match answer {
            Answer::TooLong => {
                self.error_count += 1;
                self.write_reply(stream, &line_too_long()).await?;
                Ok(Flow::Continue)
            }
            Answer::Line(_) | Answer::Hangup => Ok(Flow::Close),
        }
    }

    fn decode_or_cancel<V>(
        &self,
        data: &str,
        decode: fn(&str) -> Result<V>,
    ) -> std::result::Result<V, SmtpReply> {
        if data == "*" {
            return Err(SmtpReply::syntax_error("Authentication cancelled"));
        }
        decode(data).map_err(|e| {
            warn!("AUTH decode error: {}", e);
            SmtpReply::syntax_error(e.to_string())
        })
    }

    async fn read_line<T>(&self, stream: &mut BufReader<T>) -> Result<Incoming>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let limit = self.settings.max_line_length;
        match timeout(self.settings.read_timeout, read_bounded_line(stream, limit)).await {
            Ok(Ok(incoming)) => Ok(incoming),
            Ok(Err(e)) => {
                error!("IO error reading line: {}", e);
                Err(e.into())
            }
            Err(_) => Ok(Incoming::TimedOut),
        }
    }

    async fn write_reply<W>(&self, stream: &mut W, reply: &SmtpReply) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        debug!("> {}", reply);
        let wire = reply.to_wire();
        let write = async {
            stream.write_all(wire.as_bytes()).await?;
            stream.flush().await
        };
        match timeout(self.settings.write_timeout, write).await {
            Ok(result) => result.map_err(RelayRsError::from),
            Err(_) => Err(RelayRsError::SmtpProtocol("Write timeout".to_string())),
        }
    }
}

fn line_too_long() -> SmtpReply {
    SmtpReply::new(500, Some(EnhancedCode(5, 5, 2)), "Line too long")
}

/// Keep AUTH initial responses out of debug logs
fn redact(line: &str) -> &str {
    let is_auth = line.len() > 5
        && line
            .get(..5)
            .map_or(false, |prefix| prefix.eq_ignore_ascii_case("AUTH "));
    if is_auth {
        "AUTH ***"
    } else {
        line
    }
}

/// Read one line, never buffering more than `limit + 1` bytes of it
///
/// An overlong line is consumed up to its newline in bounded chunks and
/// reported as [`Incoming::TooLong`].
async fn read_bounded_line<R>(reader: &mut R, limit: usize) -> io::Result<Incoming>
where
    R: AsyncBufRead + Unpin,
{
    let cap = limit as u64 + 1;
    let mut line = Vec::new();
    let n = (&mut *reader).take(cap).read_until(b'\n', &mut line).await?;

    if n == 0 {
        return Ok(Incoming::Closed);
    }
    let complete = line.last() == Some(&b'\n');
    if line.len() <= limit {
        // Either a full line, or the last bytes before EOF
        return Ok(Incoming::Line(line));
    }
    if complete {
        return Ok(Incoming::TooLong(line.len()));
    }

    let mut discarded = line.len();
    loop {
        line.clear();
        let n = (&mut *reader).take(cap).read_until(b'\n', &mut line).await?;
        discarded += n;
        if n == 0 || line.last() == Some(&b'\n') {
            return Ok(Incoming::TooLong(discarded));
        }
    }
}

/// The DATA section as a stream of unstuffed lines, ending at the lone `.`
///
/// Lines longer than `chunk_limit` arrive in several chunks; only a chunk
/// that starts a line is checked for the terminator and dot-stuffing.
/// A timeout, read error, or EOF before the terminator yields one error and
/// ends the stream.
fn data_stream<T>(
    reader: &mut BufReader<T>,
    read_timeout: Duration,
    chunk_limit: usize,
) -> impl Stream<Item = io::Result<Bytes>> + Send + '_
where
    T: AsyncRead + Unpin + Send,
{
    stream::unfold(Some((reader, true)), move |state| async move {
        let (reader, at_line_start) = state?;
        let mut line = Vec::new();
        let mut limited = (&mut *reader).take(chunk_limit as u64);

        match timeout(read_timeout, limited.read_until(b'\n', &mut line)).await {
            Err(_) => Some((
                Err(io::Error::new(io::ErrorKind::TimedOut, "timeout during DATA")),
                None,
            )),
            Ok(Err(e)) => Some((Err(e), None)),
            Ok(Ok(0)) => Some((
                Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed during DATA",
                )),
                None,
            )),
            Ok(Ok(_)) => {
                let line_ends = line.last() == Some(&b'\n');
                if at_line_start {
                    if line == b".\r\n" || line == b".\n" {
                        return None;
                    }
                    // Transparency (RFC 5321 4.5.2)
                    if line.first() == Some(&b'.') {
                        line.remove(0);
                    }
                }
                Some((Ok(Bytes::from(line)), Some((reader, line_ends))))
            }
        }
    })
}
