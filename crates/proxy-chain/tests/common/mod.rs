//! In-process fakes for upstream proxies and origin servers.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use proxy_chain::{ChainOptions, ProxyChain};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Request heads received by a fake, in arrival order.
#[derive(Clone, Default)]
pub struct Heads(Arc<Mutex<Vec<String>>>);

impl Heads {
    pub fn all(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn first(&self) -> Option<String> {
        self.0.lock().first().cloned()
    }

    fn push(&self, head: String) {
        self.0.lock().push(head);
    }
}

/// Read up to and including the blank line ending a request head.
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> Option<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => head.push(byte[0]),
        }
    }
    Some(String::from_utf8_lossy(&head).into_owned())
}

/// Echoes every byte back until the peer closes.
pub async fn echo<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) {
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if stream.write_all(&buf[..n]).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Origin server answering every request with `body`, closing afterwards.
pub async fn spawn_origin(body: &'static str) -> (SocketAddr, Heads) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let heads = Heads::default();
    let recorded = heads.clone();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let recorded = recorded.clone();
            tokio::spawn(async move {
                if let Some(head) = read_head(&mut stream).await {
                    recorded.push(head);
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nX-Origin: yes\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                }
            });
        }
    });
    (addr, heads)
}

/// How a fake HTTP proxy answers CONNECT.
#[derive(Clone, Copy)]
pub enum ConnectBehavior {
    /// 200, then echo tunnel bytes.
    Accept,
    /// 200 with `prefix` written right after the head, then echo.
    AcceptWithPayload(&'static str),
    Refuse(u16, &'static str),
    /// Read the head and never answer.
    Stall,
    /// 200, then close without relaying anything.
    AcceptThenClose,
}

/// HTTP proxy that answers plain requests with `plain_body` and CONNECT
/// requests according to `behavior`.
pub async fn spawn_http_proxy(
    behavior: ConnectBehavior,
    plain_body: &'static str,
) -> (SocketAddr, Heads) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let heads = Heads::default();
    let recorded = heads.clone();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let recorded = recorded.clone();
            tokio::spawn(async move {
                let Some(head) = read_head(&mut stream).await else {
                    return;
                };
                let is_connect = head.starts_with("CONNECT ");
                recorded.push(head);
                if !is_connect {
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nX-Upstream: http\r\nConnection: close\r\n\r\n{}",
                        plain_body.len(),
                        plain_body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    return;
                }
                match behavior {
                    ConnectBehavior::Accept => {
                        let _ = stream
                            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                            .await;
                        echo(&mut stream).await;
                    }
                    ConnectBehavior::AcceptWithPayload(payload) => {
                        let response =
                            format!("HTTP/1.1 200 Connection established\r\n\r\n{payload}");
                        let _ = stream.write_all(response.as_bytes()).await;
                        echo(&mut stream).await;
                    }
                    ConnectBehavior::Refuse(code, description) => {
                        let response = format!("HTTP/1.1 {code} {description}\r\n\r\n");
                        let _ = stream.write_all(response.as_bytes()).await;
                    }
                    ConnectBehavior::Stall => {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                    }
                    ConnectBehavior::AcceptThenClose => {
                        let _ = stream
                            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                            .await;
                    }
                }
            });
        }
    });
    (addr, heads)
}

/// Unauthenticated SOCKS5 server that connects to the requested IPv4 or
/// domain target and relays bytes. Records the requested targets.
pub async fn spawn_socks5() -> (SocketAddr, Heads) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let targets = Heads::default();
    let recorded = targets.clone();
    tokio::spawn(async move {
        while let Ok((mut client, _)) = listener.accept().await {
            let recorded = recorded.clone();
            tokio::spawn(async move {
                let Some(target) = socks5_handshake(&mut client).await else {
                    return;
                };
                recorded.push(target.clone());
                let Ok(mut upstream) = TcpStream::connect(target.as_str()).await else {
                    let _ = client.write_all(&[5, 5, 0, 1, 0, 0, 0, 0, 0, 0]).await;
                    return;
                };
                if client.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await.is_err() {
                    return;
                }
                let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
            });
        }
    });
    (addr, targets)
}

async fn socks5_handshake(stream: &mut TcpStream) -> Option<String> {
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await.ok()?;
    let mut methods = vec![0u8; greeting[1] as usize];
    stream.read_exact(&mut methods).await.ok()?;
    stream.write_all(&[5, 0]).await.ok()?;

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await.ok()?;
    let host = match request[3] {
        1 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await.ok()?;
            std::net::Ipv4Addr::from(ip).to_string()
        }
        3 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.ok()?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await.ok()?;
            String::from_utf8(name).ok()?
        }
        _ => return None,
    };
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await.ok()?;
    Some(format!("{}:{}", host, u16::from_be_bytes(port)))
}

/// SOCKS4/4a server that connects to the requested target and relays
/// bytes. Records `userid@host:port` for every request.
pub async fn spawn_socks4() -> (SocketAddr, Heads) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Heads::default();
    let recorded = requests.clone();
    tokio::spawn(async move {
        while let Ok((mut client, _)) = listener.accept().await {
            let recorded = recorded.clone();
            tokio::spawn(async move {
                let Some((user_id, target)) = socks4_handshake(&mut client).await else {
                    return;
                };
                recorded.push(format!("{user_id}@{target}"));
                let Ok(mut upstream) = TcpStream::connect(target.as_str()).await else {
                    let _ = client.write_all(&[0, 0x5B, 0, 0, 0, 0, 0, 0]).await;
                    return;
                };
                if client.write_all(&[0, 0x5A, 0, 0, 0, 0, 0, 0]).await.is_err() {
                    return;
                }
                let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
            });
        }
    });
    (addr, requests)
}

async fn read_null_terminated(stream: &mut TcpStream) -> Option<String> {
    let mut bytes = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await.ok()?;
        if byte[0] == 0 {
            break;
        }
        bytes.push(byte[0]);
    }
    String::from_utf8(bytes).ok()
}

async fn socks4_handshake(stream: &mut TcpStream) -> Option<(String, String)> {
    let mut request = [0u8; 8];
    stream.read_exact(&mut request).await.ok()?;
    if request[0] != 4 || request[1] != 1 {
        return None;
    }
    let port = u16::from_be_bytes([request[2], request[3]]);
    let ip = [request[4], request[5], request[6], request[7]];
    let user_id = read_null_terminated(stream).await?;
    // 0.0.0.x with x != 0 announces a domain after the user id.
    let host = if ip[..3] == [0, 0, 0] && ip[3] != 0 {
        read_null_terminated(stream).await?
    } else {
        std::net::Ipv4Addr::from(ip).to_string()
    };
    Some((user_id, format!("{host}:{port}")))
}

pub async fn start_chain(options: ChainOptions) -> (ProxyChain, SocketAddr) {
    let mut chain = ProxyChain::new(options).unwrap();
    let addr = chain.listen().await.unwrap();
    (chain, addr)
}

pub fn options_for(upstream: &str) -> ChainOptions {
    ChainOptions::new("127.0.0.1:0".parse().unwrap()).with_proxy_url(upstream)
}

/// Client that sends everything through the chain at `chain`.
pub fn client_via(chain: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(format!("http://{chain}")).unwrap())
        .timeout(TEST_TIMEOUT)
        .build()
        .unwrap()
}

/// Send a raw CONNECT and return the response head plus the open stream.
pub async fn raw_connect(chain: SocketAddr, target: &str) -> (String, TcpStream) {
    let mut stream = TcpStream::connect(chain).await.unwrap();
    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let head = tokio::time::timeout(TEST_TIMEOUT, read_head(&mut stream))
        .await
        .unwrap()
        .unwrap_or_default();
    (head, stream)
}

/// Poll until `condition` holds or the test timeout passes.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
