//! Low-level POP3 session over TCP or TLS.
//!
//! Blocking I/O — callers run sessions inside `spawn_blocking`. Covers the
//! handful of commands the adapter needs (STAT, UIDL, TOP, RETR, QUIT) plus
//! multiline responses with byte-unstuffing per RFC 1939.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::error::MailError;

const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection parameters for one POP3 session, derived from settings.
#[derive(Debug, Clone)]
pub struct Pop3Config {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub tls: bool,
}

/// The transport under the session: plain TCP or TLS.
enum Wire {
    Plain(TcpStream),
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

impl Read for Wire {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Wire::Plain(stream) => stream.read(buf),
            Wire::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for Wire {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Wire::Plain(stream) => stream.write(buf),
            Wire::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Wire::Plain(stream) => stream.flush(),
            Wire::Tls(stream) => stream.flush(),
        }
    }
}

/// The session-level operations the fetch strategies need.
///
/// Split out as a trait so the strategies can run against a scripted
/// session in tests.
pub(crate) trait Pop3Io {
    /// Message count and total size in octets.
    fn stat(&mut self) -> Result<(u64, u64), MailError>;
    /// `(message number, unique id)` pairs for every message on the server.
    fn uidl(&mut self) -> Result<Vec<(u32, String)>, MailError>;
    /// Headers plus the first `lines` body lines of a message.
    fn top(&mut self, msg: u32, lines: u32) -> Result<String, MailError>;
    /// The full message text.
    fn retr(&mut self, msg: u32) -> Result<String, MailError>;
    fn quit(&mut self) -> Result<(), MailError>;
}

/// An authenticated POP3 session.
pub(crate) struct Pop3Session {
    reader: BufReader<Wire>,
}

impl Pop3Session {
    /// Connect, optionally wrap in TLS, read the greeting, and authenticate.
    pub(crate) fn connect(config: &Pop3Config) -> Result<Self, MailError> {
        let tcp =
            TcpStream::connect((&*config.host, config.port)).map_err(|e| MailError::Connect {
                host: config.host.clone(),
                port: config.port,
                reason: e.to_string(),
            })?;
        tcp.set_read_timeout(Some(READ_TIMEOUT))?;
        tcp.set_write_timeout(Some(READ_TIMEOUT))?;

        let wire = if config.tls {
            let mut root_store = rustls::RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let tls_config = Arc::new(
                rustls::ClientConfig::builder()
                    .with_root_certificates(root_store)
                    .with_no_client_auth(),
            );
            let server_name: rustls::pki_types::ServerName<'_> =
                rustls::pki_types::ServerName::try_from(config.host.clone())
                    .map_err(|e| MailError::Tls(e.to_string()))?;
            let conn = rustls::ClientConnection::new(tls_config, server_name)
                .map_err(|e| MailError::Tls(e.to_string()))?;
            Wire::Tls(Box::new(rustls::StreamOwned::new(conn, tcp)))
        } else {
            Wire::Plain(tcp)
        };

        let mut session = Self {
            reader: BufReader::new(wire),
        };

        let greeting = session.read_line()?;
        if !greeting.starts_with("+OK") {
            return Err(MailError::Rejected {
                command: "greeting".into(),
                reply: greeting,
            });
        }

        session.command(&format!("USER {}", config.username))?;
        session.command(&format!("PASS {}", config.password.expose_secret()))?;

        Ok(session)
    }

    /// Read one CRLF-terminated line, without the terminator.
    fn read_line(&mut self) -> Result<String, MailError> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line)?;
        if n == 0 {
            return Err(MailError::Disconnected);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }

    /// Send a command and check the single-line status reply for `+OK`.
    ///
    /// Errors carry only the command verb, never its arguments (PASS).
    fn command(&mut self, cmd: &str) -> Result<String, MailError> {
        let verb = cmd.split_whitespace().next().unwrap_or(cmd).to_string();

        self.reader
            .get_mut()
            .write_all(format!("{cmd}\r\n").as_bytes())?;
        self.reader.get_mut().flush()?;

        let reply = self.read_line()?;
        if reply.starts_with("+OK") {
            Ok(reply)
        } else {
            Err(MailError::Rejected {
                command: verb,
                reply,
            })
        }
    }

    /// Read a multiline response body up to the lone-dot terminator,
    /// undoing byte-stuffing on the way.
    fn read_multiline(&mut self) -> Result<String, MailError> {
        let mut out = String::new();
        loop {
            let line = self.read_line()?;
            if line == "." {
                break;
            }
            let line = line.strip_prefix('.').unwrap_or(&line);
            out.push_str(line);
            out.push_str("\r\n");
        }
        Ok(out)
    }
}

impl Pop3Io for Pop3Session {
    fn stat(&mut self) -> Result<(u64, u64), MailError> {
        let reply = self.command("STAT")?;
        let mut words = reply.split_whitespace().skip(1);
        let parse = |w: Option<&str>| w.and_then(|s| s.parse::<u64>().ok());
        match (parse(words.next()), parse(words.next())) {
            (Some(count), Some(size)) => Ok((count, size)),
            _ => Err(MailError::BadResponse {
                command: "STAT".into(),
                reply,
            }),
        }
    }

    fn uidl(&mut self) -> Result<Vec<(u32, String)>, MailError> {
        self.command("UIDL")?;
        let body = self.read_multiline()?;

        let mut listing = Vec::new();
        for line in body.lines() {
            let mut words = line.split_whitespace();
            if let (Some(num), Some(uid)) = (words.next(), words.next())
                && let Ok(num) = num.parse::<u32>()
            {
                listing.push((num, uid.to_string()));
            }
        }
        Ok(listing)
    }

    fn top(&mut self, msg: u32, lines: u32) -> Result<String, MailError> {
        self.command(&format!("TOP {msg} {lines}"))?;
        self.read_multiline()
    }

    fn retr(&mut self, msg: u32) -> Result<String, MailError> {
        self.command(&format!("RETR {msg}"))?;
        self.read_multiline()
    }

    fn quit(&mut self) -> Result<(), MailError> {
        self.command("QUIT")?;
        Ok(())
    }
}
