//! Scripted Postgres backend for wire-level tests
//!
//! Speaks just enough of the v3 protocol to exercise startup,
//! authentication, the simple query protocol and transaction status.

#![allow(dead_code)]

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

type HmacSha256 = Hmac<Sha256>;

/// How the mock server authenticates clients
#[derive(Debug, Clone)]
pub enum Auth {
    Trust,
    Cleartext(String),
    Scram(String),
    Md5,
}

/// A running mock backend
pub struct MockServer {
    pub addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    log: Arc<Mutex<Vec<String>>>,
}

impl MockServer {
    pub async fn start(auth: Auth) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let log = Arc::new(Mutex::new(Vec::new()));

        let (accepted_task, log_task) = (Arc::clone(&accepted), Arc::clone(&log));
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let pid = accepted_task.fetch_add(1, Ordering::SeqCst) as i32 + 1;
                let session = Session {
                    socket,
                    pid,
                    auth: auth.clone(),
                    tx_status: b'I',
                    log: Arc::clone(&log_task),
                };
                tokio::spawn(session.run());
            }
        });

        Self { addr, accepted, log }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Sessions accepted so far
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Everything received, as `"<pid>: <text>"` lines
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Queries received, without the session prefix
    pub fn queries(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter_map(|line| line.split_once(": Q ").map(|(_, q)| q.to_string()))
            .collect()
    }
}

struct Session {
    socket: TcpStream,
    pid: i32,
    auth: Auth,
    tx_status: u8,
    log: Arc<Mutex<Vec<String>>>,
}

impl Session {
    async fn run(mut self) {
        if self.serve().await.is_none() {
            self.record("disconnected".into());
        }
    }

    fn record(&self, line: String) {
        self.log.lock().unwrap().push(format!("{}: {}", self.pid, line));
    }

    async fn serve(&mut self) -> Option<()> {
        let len = self.socket.read_i32().await.ok()? as usize;
        let mut body = vec![0u8; len - 4];
        self.socket.read_exact(&mut body).await.ok()?;
        let params = cstrings(&body[4..]);
        self.record(format!("startup {}", params.join(" ")));

        if !self.authenticate().await? {
            return Some(());
        }

        let mut out = auth_message(0, &[]);
        out.extend(message(b'S', &cstr_pair("server_version", "16.2")));
        let mut key = self.pid.to_be_bytes().to_vec();
        key.extend_from_slice(&42i32.to_be_bytes());
        out.extend(message(b'K', &key));
        out.extend(ready(b'I'));
        self.socket.write_all(&out).await.ok()?;

        loop {
            let (tag, body) = self.read_frontend().await?;
            match tag {
                b'Q' => {
                    let sql = cstrings(&body).into_iter().next().unwrap_or_default();
                    self.record(format!("Q {}", sql));
                    let (reply, keep_open) = self.answer(&sql);
                    self.socket.write_all(&reply).await.ok()?;
                    if !keep_open {
                        return None;
                    }
                }
                b'X' => {
                    self.record("terminate".into());
                    return Some(());
                }
                other => panic!("mock server got unexpected message {}", other as char),
            }
        }
    }

    async fn read_frontend(&mut self) -> Option<(u8, Vec<u8>)> {
        let tag = self.socket.read_u8().await.ok()?;
        let len = self.socket.read_i32().await.ok()? as usize;
        let mut body = vec![0u8; len - 4];
        self.socket.read_exact(&mut body).await.ok()?;
        Some((tag, body))
    }

    /// Returns `Some(false)` when the client was rejected
    async fn authenticate(&mut self) -> Option<bool> {
        match self.auth.clone() {
            Auth::Trust => Some(true),
            Auth::Md5 => {
                self.socket
                    .write_all(&auth_message(5, &[1, 2, 3, 4]))
                    .await
                    .ok()?;
                Some(false)
            }
            Auth::Cleartext(expected) => {
                self.socket.write_all(&auth_message(3, &[])).await.ok()?;
                let (_, body) = self.read_frontend().await?;
                let given = cstrings(&body).into_iter().next().unwrap_or_default();
                if given == expected {
                    Some(true)
                } else {
                    let err = error_response("FATAL", "28P01", "password authentication failed");
                    self.socket.write_all(&err).await.ok()?;
                    Some(false)
                }
            }
            Auth::Scram(password) => self.scram(&password).await,
        }
    }

    async fn scram(&mut self, password: &str) -> Option<bool> {
        let mut offer = b"SCRAM-SHA-256\0".to_vec();
        offer.push(0);
        self.socket.write_all(&auth_message(10, &offer)).await.ok()?;

        // SASLInitialResponse: mechanism\0 len data
        let (_, body) = self.read_frontend().await?;
        let mechanism_end = body.iter().position(|&b| b == 0)?;
        let client_first = String::from_utf8(body[mechanism_end + 5..].to_vec()).ok()?;
        let client_first_bare = client_first.strip_prefix("n,,")?.to_string();
        let client_nonce = client_first_bare.split_once("r=")?.1.to_string();

        let salt = b"mock-salt-123456";
        let nonce = format!("{}serverpart", client_nonce);
        let server_first = format!("r={},s={},i=4096", nonce, BASE64.encode(salt));
        self.socket
            .write_all(&auth_message(11, server_first.as_bytes()))
            .await
            .ok()?;

        let (_, body) = self.read_frontend().await?;
        let client_final = String::from_utf8(body).ok()?;
        let (without_proof, proof) = client_final.rsplit_once(",p=")?;
        let proof = BASE64.decode(proof).ok()?;

        let mut salted = [0u8; 32];
        pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, 4096, &mut salted).ok()?;
        let client_key = hmac(&salted, b"Client Key");
        let stored_key = Sha256::digest(&client_key);
        let auth_message_text = format!("{},{},{}", client_first_bare, server_first, without_proof);
        let signature = hmac(&stored_key, auth_message_text.as_bytes());
        let recovered: Vec<u8> = proof.iter().zip(&signature).map(|(p, s)| p ^ s).collect();

        if Sha256::digest(&recovered).as_slice() != stored_key.as_slice() {
            let err = error_response("FATAL", "28P01", "password authentication failed");
            self.socket.write_all(&err).await.ok()?;
            return Some(false);
        }

        let server_key = hmac(&salted, b"Server Key");
        let server_signature = hmac(&server_key, auth_message_text.as_bytes());
        let server_final = format!("v={}", BASE64.encode(server_signature));
        self.socket
            .write_all(&auth_message(12, server_final.as_bytes()))
            .await
            .ok()?;
        Some(true)
    }

    /// Scripted reply to one query; `false` means the session dies
    fn answer(&mut self, sql: &str) -> (Vec<u8>, bool) {
        let mut out = Vec::new();
        let verb = sql.split_whitespace().next().unwrap_or("").to_uppercase();

        if sql.contains("terminate_me") {
            out.extend(error_response(
                "FATAL",
                "57P01",
                "terminating connection due to administrator command",
            ));
            return (out, false);
        }
        if sql.contains("pg_sleep") {
            // Never answers; the client is expected to give up
            return (out, true);
        }
        if sql.contains("boom") {
            out.extend(error_response("ERROR", "42P01", "relation \"boom\" does not exist"));
            if self.tx_status == b'T' {
                self.tx_status = b'E';
            }
            out.extend(ready(self.tx_status));
            return (out, true);
        }

        match verb.as_str() {
            "" => out.extend(message(b'I', &[])),
            "BEGIN" => {
                self.tx_status = b'T';
                out.extend(command_complete("BEGIN"));
            }
            "COMMIT" => {
                let tag = if self.tx_status == b'E' { "ROLLBACK" } else { "COMMIT" };
                self.tx_status = b'I';
                out.extend(command_complete(tag));
            }
            "ROLLBACK" => {
                self.tx_status = b'I';
                out.extend(command_complete("ROLLBACK"));
            }
            "SELECT" => {
                out.extend(row_description(&["ID", "Name"]));
                out.extend(data_row(&[Some("1"), Some("ada")]));
                out.extend(data_row(&[Some("2"), None]));
                out.extend(command_complete("SELECT 2"));
            }
            "INSERT" => out.extend(command_complete("INSERT 0 1")),
            "NOTIFY" => {
                let mut body = self.pid.to_be_bytes().to_vec();
                body.extend_from_slice(&cstr_pair("jobs", "queued"));
                out.extend(message(b'A', &body));
                out.extend(command_complete("NOTIFY"));
            }
            other => out.extend(command_complete(other)),
        }
        out.extend(ready(self.tx_status));
        (out, true)
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).unwrap();
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn cstrings(body: &[u8]) -> Vec<String> {
    body.split(|&b| b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

fn cstr_pair(a: &str, b: &str) -> Vec<u8> {
    let mut out = a.as_bytes().to_vec();
    out.push(0);
    out.extend_from_slice(b.as_bytes());
    out.push(0);
    out
}

pub fn message(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

fn auth_message(code: i32, extra: &[u8]) -> Vec<u8> {
    let mut body = code.to_be_bytes().to_vec();
    body.extend_from_slice(extra);
    message(b'R', &body)
}

fn ready(status: u8) -> Vec<u8> {
    message(b'Z', &[status])
}

fn command_complete(tag: &str) -> Vec<u8> {
    let mut body = tag.as_bytes().to_vec();
    body.push(0);
    message(b'C', &body)
}

fn row_description(names: &[&str]) -> Vec<u8> {
    let mut body = (names.len() as i16).to_be_bytes().to_vec();
    for name in names {
        body.extend_from_slice(name.as_bytes());
        body.push(0);
        body.extend_from_slice(&0i32.to_be_bytes());
        body.extend_from_slice(&0i16.to_be_bytes());
        body.extend_from_slice(&25i32.to_be_bytes());
        body.extend_from_slice(&(-1i16).to_be_bytes());
        body.extend_from_slice(&(-1i32).to_be_bytes());
        body.extend_from_slice(&0i16.to_be_bytes());
    }
    message(b'T', &body)
}

fn data_row(cells: &[Option<&str>]) -> Vec<u8> {
    let mut body = (cells.len() as i16).to_be_bytes().to_vec();
    for cell in cells {
        match cell {
            Some(text) => {
                body.extend_from_slice(&(text.len() as i32).to_be_bytes());
                body.extend_from_slice(text.as_bytes());
            }
            None => body.extend_from_slice(&(-1i32).to_be_bytes()),
        }
    }
    message(b'D', &body)
}

fn error_response(severity: &str, code: &str, text: &str) -> Vec<u8> {
    let mut body = Vec::new();
    for (field, value) in [(b'S', severity), (b'C', code), (b'M', text)] {
        body.push(field);
        body.extend_from_slice(value.as_bytes());
        body.push(0);
    }
    body.push(0);
    message(b'E', &body)
}
