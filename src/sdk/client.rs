use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::{Error, Result};

/// Longest key the Memcached text protocol accepts.
pub const MAX_KEY_LEN: usize = 250;

/// Async client for the Memcached text protocol.
///
/// A single connection is kept behind a lock and re-established on demand;
/// requests that hit a broken connection are retried up to three times.
pub struct Client {
    addr: String,
    inner: Mutex<Option<ClientInner>>,
}

struct ClientInner {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

#[derive(Debug, PartialEq)]
enum Reply {
    Status(String),
    Value(Option<Vec<u8>>),
}

impl Client {
    pub async fn connect(addr: &str) -> Result<Self> {
        let inner = Client::connect_inner(addr).await?;
        Ok(Self {
            addr: addr.to_string(),
            inner: Mutex::new(Some(inner)),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn connect_inner(addr: &str) -> Result<ClientInner> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(ClientInner {
            reader: BufReader::new(reader),
            writer,
        })
    }

    /// Sends one request and reads its reply.
    ///
    /// The connection leaves the slot while the request is in flight and only
    /// goes back after a complete reply, so a caller dropped between the write
    /// and the read closes it instead of leaving a stale reply on the wire.
    async fn send_and_receive(&self, request: &[u8]) -> Result<Reply> {
        let mut inner_guard = self.inner.lock().await;

        for i in 0..3u64 {
            let mut inner = match inner_guard.take() {
                Some(inner) => inner,
                None => match Client::connect_inner(&self.addr).await {
                    Ok(inner) => inner,
                    Err(e) => {
                        if i == 2 {
                            return Err(e);
                        }
                        tokio::time::sleep(std::time::Duration::from_millis((i + 1) * 200)).await;
                        continue;
                    }
                },
            };

            if let Err(e) = inner.writer.write_all(request).await {
                log::debug!("memcached write to {} failed: {}", self.addr, e);
                continue;
            }

            match read_reply(&mut inner.reader).await {
                Ok(Some(reply)) => {
                    *inner_guard = Some(inner);
                    return reply;
                }
                Ok(None) => continue,
                Err(e) => {
                    log::debug!("memcached read from {} failed: {}", self.addr, e);
                    continue;
                }
            }
        }

        Err(Error::Backend("memcached: failed after 3 attempts".to_string()))
    }

    /// Fetches the raw bytes stored under `key`.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        check_key(key)?;
        match self.send_and_receive(format!("get {}\r\n", key).as_bytes()).await? {
            Reply::Value(value) => Ok(value),
            Reply::Status(status) => Err(unexpected("get", &status)),
        }
    }

    /// Stores `value` under `key`; an `exptime` of 0 never expires.
    pub async fn set(&self, key: &str, value: &[u8], exptime: u64) -> Result<String> {
        check_key(key)?;
        let mut request = format!("set {} 0 {} {}\r\n", key, exptime, value.len()).into_bytes();
        request.extend_from_slice(value);
        request.extend_from_slice(b"\r\n");

        match self.send_and_receive(&request).await? {
            Reply::Status(status) if status == "STORED" => Ok(status),
            Reply::Status(status) => Err(unexpected("set", &status)),
            Reply::Value(_) => Err(unexpected("set", "VALUE")),
        }
    }

    /// Returns `true` if the key existed.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        check_key(key)?;
        self.flag("delete", format!("delete {}\r\n", key), "DELETED").await
    }

    /// Updates the expiration of an existing key, returning `true` if it existed.
    pub async fn touch(&self, key: &str, exptime: u64) -> Result<bool> {
        check_key(key)?;
        self.flag("touch", format!("touch {} {}\r\n", key, exptime), "TOUCHED").await
    }

    pub async fn flush_all(&self) -> Result<String> {
        match self.send_and_receive(b"flush_all\r\n").await? {
            Reply::Status(status) if status == "OK" => Ok(status),
            Reply::Status(status) => Err(unexpected("flush_all", &status)),
            Reply::Value(_) => Err(unexpected("flush_all", "VALUE")),
        }
    }

    async fn flag(&self, command: &str, request: String, hit: &str) -> Result<bool> {
        match self.send_and_receive(request.as_bytes()).await? {
            Reply::Status(status) if status == hit => Ok(true),
            Reply::Status(status) if status == "NOT_FOUND" => Ok(false),
            Reply::Status(status) => Err(unexpected(command, &status)),
            Reply::Value(_) => Err(unexpected(command, "VALUE")),
        }
    }
}

fn check_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN || key.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Error::Backend(format!("memcached: invalid key {:?}", key)));
    }
    Ok(())
}

fn unexpected(command: &str, status: &str) -> Error {
    Error::Backend(format!("memcached: unexpected reply to {}: {}", command, status))
}

/// Reads one reply. `Ok(None)` means the server closed the connection.
///
/// The outer `Result` carries transport failures, the inner one errors the
/// server reported.
async fn read_reply<R>(reader: &mut R) -> std::io::Result<Option<Result<Reply>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let line = line.trim_end();

    if line == "ERROR" {
        return Ok(Some(Err(Error::Backend("memcached: unknown command".to_string()))));
    }
    if let Some(msg) = line.strip_prefix("CLIENT_ERROR ").or_else(|| line.strip_prefix("SERVER_ERROR ")) {
        return Ok(Some(Err(Error::Backend(format!("memcached: {}", msg)))));
    }
    if line == "END" {
        return Ok(Some(Ok(Reply::Value(None))));
    }

    let Some(header) = line.strip_prefix("VALUE ") else {
        return Ok(Some(Ok(Reply::Status(line.to_string()))));
    };

    // VALUE <key> <flags> <bytes> [<cas unique>]
    let len = match header.split_whitespace().nth(2).and_then(|n| n.parse::<usize>().ok()) {
        Some(len) => len,
        None => return Ok(Some(Err(unexpected("get", line)))),
    };

    let mut data = vec![0u8; len + 2];
    reader.read_exact(&mut data).await?;
    data.truncate(len);

    let mut end = String::new();
    if reader.read_line(&mut end).await? == 0 {
        return Ok(None);
    }
    if end.trim_end() != "END" {
        return Ok(Some(Err(unexpected("get", end.trim_end()))));
    }

    Ok(Some(Ok(Reply::Value(Some(data)))))
}
