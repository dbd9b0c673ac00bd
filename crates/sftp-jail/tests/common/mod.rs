//! Shared helpers for integration tests
//!
//! A minimal SFTP v3 client built on the crate's own codec, plus sandbox and
//! handler fixtures.

#![allow(dead_code)]

use bytes::{BufMut, BytesMut};
use futures_util::{SinkExt, StreamExt};
use sftp_jail::auth::AuthMethod;
use sftp_jail::protocol::{codec, FileAttrs, MessageType, OpenFlags, StatusCode, SFTP_VERSION};
use sftp_jail::request_server::RequestServer;
use sftp_jail::{FileHandler, Sandbox, SessionIdentity};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Parsed server reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Version(u32),
    Status { code: u32, message: String },
    Handle(String),
    Data(Vec<u8>),
    Name(Vec<NameEntry>),
    Attrs(FileAttrs),
}

/// One entry of a NAME reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameEntry {
    pub filename: String,
    pub longname: String,
    pub attrs: FileAttrs,
}

impl Reply {
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            Reply::Status { code, .. } => StatusCode::try_from(*code).ok(),
            _ => None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status_code() == Some(StatusCode::Ok)
    }
}

/// Sandbox under a fresh temporary base path with roots for `users`
pub fn sandbox_for(users: &[&str]) -> (TempDir, Arc<Sandbox>) {
    let temp_dir = TempDir::new().unwrap();
    let sandbox = Sandbox::new(temp_dir.path().join("base"));
    sandbox.prepare(users.iter().copied()).unwrap();
    (temp_dir, Arc::new(sandbox))
}

/// Password-authenticated handler for `username`
pub fn handler_for(sandbox: &Arc<Sandbox>, username: &str) -> Arc<FileHandler> {
    Arc::new(FileHandler::new(
        SessionIdentity::new(username, AuthMethod::Password),
        sandbox.clone(),
    ))
}

/// SFTP client speaking to a request server over any byte stream
pub struct TestClient<S> {
    framed: Framed<S, LengthDelimitedCodec>,
    next_id: u32,
}

impl TestClient<DuplexStream> {
    /// Spawn a request server for `handler` and return an initialized client
    pub async fn spawn(handler: Arc<FileHandler>) -> (Self, JoinHandle<sftp_jail::Result<()>>) {
        let (client_end, server_end) = tokio::io::duplex(512 * 1024);
        let server = tokio::spawn(RequestServer::new(server_end, handler).serve());
        let mut client = TestClient::new(client_end);
        client.init().await;
        (client, server)
    }
}

impl<S> TestClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        let framed = LengthDelimitedCodec::builder()
            .max_frame_length(1024 * 1024)
            .new_framed(stream);
        Self { framed, next_id: 1 }
    }

    /// INIT / VERSION exchange
    pub async fn init(&mut self) {
        let mut packet = BytesMut::new();
        packet.put_u8(MessageType::Init as u8);
        packet.put_u32(SFTP_VERSION);
        self.framed.send(packet.freeze()).await.unwrap();
        assert_eq!(self.recv().await, Reply::Version(SFTP_VERSION));
    }

    /// Send a raw packet and return the parsed reply
    pub async fn raw(&mut self, packet: BytesMut) -> Reply {
        self.framed.send(packet.freeze()).await.unwrap();
        self.recv().await
    }

    /// Send a request with a fresh id; `body` follows the id
    pub async fn request(&mut self, kind: u8, body: BytesMut) -> Reply {
        let id = self.next_id;
        self.next_id += 1;

        let mut packet = BytesMut::new();
        packet.put_u8(kind);
        packet.put_u32(id);
        packet.extend_from_slice(&body);
        self.framed.send(packet.freeze()).await.unwrap();

        let reply = self.recv_with_id().await;
        assert_eq!(reply.0, id, "reply id does not match request id");
        reply.1
    }

    async fn next_frame(&mut self) -> BytesMut {
        self.framed
            .next()
            .await
            .expect("server closed the stream")
            .unwrap()
    }

    async fn recv(&mut self) -> Reply {
        let frame = self.next_frame().await;
        if frame[0] == MessageType::Version as u8 {
            let mut buf = &frame[1..];
            return Reply::Version(codec::get_u32(&mut buf).unwrap());
        }
        parse_reply(&frame).1
    }

    async fn recv_with_id(&mut self) -> (u32, Reply) {
        let frame = self.next_frame().await;
        parse_reply(&frame)
    }

    pub async fn open(&mut self, path: &str, flags: u32) -> Reply {
        let mut body = BytesMut::new();
        codec::put_string(&mut body, path);
        body.put_u32(flags);
        body.extend_from_slice(&FileAttrs::default().encode());
        self.request(MessageType::Open as u8, body).await
    }

    pub async fn open_handle(&mut self, path: &str, flags: u32) -> String {
        match self.open(path, flags).await {
            Reply::Handle(handle) => handle,
            other => panic!("open {:?} failed: {:?}", path, other),
        }
    }

    pub async fn close(&mut self, handle: &str) -> Reply {
        self.request(MessageType::Close as u8, handle_body(handle)).await
    }

    pub async fn read(&mut self, handle: &str, offset: u64, len: u32) -> Reply {
        let mut body = handle_body(handle);
        body.put_u64(offset);
        body.put_u32(len);
        self.request(MessageType::Read as u8, body).await
    }

    pub async fn write(&mut self, handle: &str, offset: u64, data: &[u8]) -> Reply {
        let mut body = handle_body(handle);
        body.put_u64(offset);
        codec::put_bytes(&mut body, data);
        self.request(MessageType::Write as u8, body).await
    }

    pub async fn stat(&mut self, path: &str) -> Reply {
        self.request(MessageType::Stat as u8, path_body(path)).await
    }

    pub async fn lstat(&mut self, path: &str) -> Reply {
        self.request(MessageType::Lstat as u8, path_body(path)).await
    }

    pub async fn fstat(&mut self, handle: &str) -> Reply {
        self.request(MessageType::Fstat as u8, handle_body(handle)).await
    }

    pub async fn opendir(&mut self, path: &str) -> Reply {
        self.request(MessageType::Opendir as u8, path_body(path)).await
    }

    pub async fn readdir(&mut self, handle: &str) -> Reply {
        self.request(MessageType::Readdir as u8, handle_body(handle)).await
    }

    pub async fn remove(&mut self, path: &str) -> Reply {
        self.request(MessageType::Remove as u8, path_body(path)).await
    }

    pub async fn realpath(&mut self, path: &str) -> Reply {
        self.request(MessageType::Realpath as u8, path_body(path)).await
    }

    pub async fn mkdir(&mut self, path: &str) -> Reply {
        let mut body = path_body(path);
        body.extend_from_slice(&FileAttrs::default().encode());
        self.request(MessageType::Mkdir as u8, body).await
    }

    pub async fn rmdir(&mut self, path: &str) -> Reply {
        self.request(MessageType::Rmdir as u8, path_body(path)).await
    }

    pub async fn rename(&mut self, from: &str, to: &str) -> Reply {
        let mut body = path_body(from);
        codec::put_string(&mut body, to);
        self.request(MessageType::Rename as u8, body).await
    }

    pub async fn symlink(&mut self, link: &str, target: &str) -> Reply {
        let mut body = path_body(link);
        codec::put_string(&mut body, target);
        self.request(MessageType::Symlink as u8, body).await
    }

    pub async fn readlink(&mut self, path: &str) -> Reply {
        self.request(MessageType::Readlink as u8, path_body(path)).await
    }

    pub async fn setstat(&mut self, path: &str, attrs: &FileAttrs) -> Reply {
        let mut body = path_body(path);
        body.extend_from_slice(&attrs.encode());
        self.request(MessageType::Setstat as u8, body).await
    }

    /// Create (truncating) and fill a file in 32 KiB writes
    pub async fn upload(&mut self, path: &str, data: &[u8]) {
        let flags = OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::TRUNC;
        let handle = self.open_handle(path, flags).await;
        let mut offset = 0u64;
        for chunk in data.chunks(32 * 1024) {
            let reply = self.write(&handle, offset, chunk).await;
            assert!(reply.is_ok(), "write failed: {:?}", reply);
            offset += chunk.len() as u64;
        }
        assert!(self.close(&handle).await.is_ok());
    }

    /// Read a whole file until EOF
    pub async fn download(&mut self, path: &str) -> Vec<u8> {
        let handle = self.open_handle(path, OpenFlags::READ).await;
        let mut content = Vec::new();
        loop {
            match self.read(&handle, content.len() as u64, 32 * 1024).await {
                Reply::Data(data) => content.extend_from_slice(&data),
                reply if reply.status_code() == Some(StatusCode::Eof) => break,
                other => panic!("read failed: {:?}", other),
            }
        }
        assert!(self.close(&handle).await.is_ok());
        content
    }

    /// Every entry name in a directory, across all READDIR pages
    pub async fn list_dir(&mut self, path: &str) -> Vec<String> {
        let handle = match self.opendir(path).await {
            Reply::Handle(handle) => handle,
            other => panic!("opendir {:?} failed: {:?}", path, other),
        };
        let mut names = Vec::new();
        loop {
            match self.readdir(&handle).await {
                Reply::Name(entries) => names.extend(entries.into_iter().map(|e| e.filename)),
                reply if reply.status_code() == Some(StatusCode::Eof) => break,
                other => panic!("readdir failed: {:?}", other),
            }
        }
        assert!(self.close(&handle).await.is_ok());
        names
    }

    /// Drop the client side of the stream
    pub fn into_inner(self) -> S {
        self.framed.into_inner()
    }
}

fn path_body(path: &str) -> BytesMut {
    let mut body = BytesMut::new();
    codec::put_string(&mut body, path);
    body
}

fn handle_body(handle: &str) -> BytesMut {
    path_body(handle)
}

fn parse_reply(frame: &[u8]) -> (u32, Reply) {
    let kind = frame[0];
    let mut buf = &frame[1..];
    let id = codec::get_u32(&mut buf).unwrap();

    let reply = match MessageType::try_from(kind).unwrap() {
        MessageType::Status => {
            let code = codec::get_u32(&mut buf).unwrap();
            let message = codec::get_string(&mut buf).unwrap();
            let _language = codec::get_string(&mut buf).unwrap();
            Reply::Status { code, message }
        }
        MessageType::Handle => Reply::Handle(codec::get_string(&mut buf).unwrap()),
        MessageType::Data => Reply::Data(codec::get_bytes(&mut buf).unwrap()),
        MessageType::Name => {
            let count = codec::get_u32(&mut buf).unwrap();
            let mut entries = Vec::new();
            for _ in 0..count {
                entries.push(NameEntry {
                    filename: codec::get_string(&mut buf).unwrap(),
                    longname: codec::get_string(&mut buf).unwrap(),
                    attrs: FileAttrs::decode(&mut buf).unwrap(),
                });
            }
            Reply::Name(entries)
        }
        MessageType::Attrs => Reply::Attrs(FileAttrs::decode(&mut buf).unwrap()),
        other => panic!("unexpected reply type {:?}", other),
    };
    assert!(buf.is_empty(), "trailing bytes in reply");
    (id, reply)
}
