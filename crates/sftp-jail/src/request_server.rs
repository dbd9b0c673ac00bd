//! SFTP v3 request loop for one session channel
//!
//! Reads length-prefixed SFTP packets from the channel stream, maps each one to
//! an [`Operation`] for the channel's [`FileHandler`], and writes the reply.
//! Failures scoped to one request become a STATUS reply; stream errors end the
//! loop.

use crate::handler::{CommandFamily, FileHandler, Operation, Outcome};
use crate::listing::ListingSnapshot;
use crate::protocol::{codec, FileAttrs, MessageType, OpenFlags, StatusCode, SFTP_VERSION};
use crate::sandbox::clean_virtual;
use crate::{Error, Result};
use bytes::{BufMut, BytesMut};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

/// Largest payload returned by one READ
pub const MAX_READ_LEN: u32 = 256 * 1024;

/// Entries per READDIR reply
pub const READDIR_PAGE: usize = 100;

/// Largest accepted packet (a full-size WRITE plus its header)
const MAX_PACKET_LEN: usize = MAX_READ_LEN as usize + 1024;

enum OpenHandle {
    File { file: fs::File, writable: bool },
    Dir { listing: ListingSnapshot, offset: usize },
}

/// Serves SFTP requests from one stream until it ends
pub struct RequestServer<S> {
    framed: Framed<S, LengthDelimitedCodec>,
    handler: Arc<FileHandler>,
    handles: HashMap<String, OpenHandle>,
    next_handle: u64,
    initialized: bool,
}

impl<S> RequestServer<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Request loop over `stream`, serving files through `handler`
    pub fn new(stream: S, handler: Arc<FileHandler>) -> Self {
        let framed = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_PACKET_LEN)
            .new_framed(stream);
        Self {
            framed,
            handler,
            handles: HashMap::new(),
            next_handle: 0,
            initialized: false,
        }
    }

    /// Serve until the client closes the stream
    ///
    /// # Errors
    ///
    /// Returns stream read/write errors, oversized packets, and packets that
    /// arrive before `INIT` or are too short to carry a request id.
    pub async fn serve(mut self) -> Result<()> {
        let result = self.run().await;
        self.close_all().await;
        result
    }

    async fn run(&mut self) -> Result<()> {
        while let Some(frame) = self.framed.next().await {
            let frame = frame?;
            let reply = self.process(&frame).await?;
            self.framed.send(reply.freeze()).await?;
        }
        debug!(
            username = %self.handler.identity().username(),
            "SFTP stream closed by client"
        );
        Ok(())
    }

    async fn process(&mut self, frame: &[u8]) -> Result<BytesMut> {
        let (&kind, mut buf) = frame
            .split_first()
            .ok_or_else(|| Error::Protocol("Empty packet".into()))?;
        let msg_type = MessageType::try_from(kind).ok();

        if msg_type == Some(MessageType::Init) {
            return self.handle_init(&mut buf);
        }
        if !self.initialized {
            return Err(Error::Protocol("Session not initialized".into()));
        }

        let id = codec::get_u32(&mut buf)?;
        debug!(request_id = id, kind, "SFTP request");

        let result = match msg_type {
            Some(msg_type) => self.dispatch(msg_type, id, &mut buf).await,
            None => Err(Error::NotSupported(format!("unsupported request type: {}", kind))),
        };

        Ok(result.unwrap_or_else(|e| {
            if e.is_security_event() {
                warn!(request_id = id, error = %e, "Request denied");
            }
            status_reply(id, e.to_status_code(), &e.sanitized_message())
        }))
    }

    fn handle_init(&mut self, buf: &mut &[u8]) -> Result<BytesMut> {
        let version = codec::get_u32(buf)?;
        debug!(client_version = version, "SFTP init");
        self.initialized = true;

        let mut reply = BytesMut::new();
        reply.put_u8(MessageType::Version as u8);
        reply.put_u32(SFTP_VERSION);
        Ok(reply)
    }

    async fn dispatch(&mut self, msg_type: MessageType, id: u32, buf: &mut &[u8]) -> Result<BytesMut> {
        match msg_type {
            MessageType::Open => self.handle_open(id, buf).await,
            MessageType::Close => self.handle_close(id, buf).await,
            MessageType::Read => self.handle_read(id, buf).await,
            MessageType::Write => self.handle_write(id, buf).await,
            MessageType::Stat | MessageType::Lstat => self.handle_stat(id, buf).await,
            MessageType::Fstat => self.handle_fstat(id, buf).await,
            MessageType::Opendir => self.handle_opendir(id, buf).await,
            MessageType::Readdir => self.handle_readdir(id, buf),
            MessageType::Remove => self.handle_remove(id, buf).await,
            MessageType::Realpath => handle_realpath(id, buf),
            MessageType::Setstat | MessageType::Fsetstat => {
                self.refuse(CommandFamily::File, "Setstat").await
            }
            MessageType::Rename => self.refuse(CommandFamily::File, "Rename").await,
            MessageType::Mkdir => self.refuse(CommandFamily::File, "Mkdir").await,
            MessageType::Rmdir => self.refuse(CommandFamily::File, "Rmdir").await,
            MessageType::Symlink => self.refuse(CommandFamily::File, "Symlink").await,
            MessageType::Readlink => self.refuse(CommandFamily::List, "Readlink").await,
            other => Err(Error::NotSupported(format!(
                "unsupported request type: {:?}",
                other
            ))),
        }
    }

    async fn handle_open(&mut self, id: u32, buf: &mut &[u8]) -> Result<BytesMut> {
        let path = codec::get_string(buf)?;
        let flags = OpenFlags(codec::get_u32(buf)?);
        let _attrs = FileAttrs::decode(buf)?;

        let request = if flags.opens_for_write() {
            Operation::Write {
                path,
                truncate: flags.contains(OpenFlags::TRUNC),
            }
        } else {
            Operation::Read { path }
        };

        let handle = match self.handler.handle(request).await? {
            Outcome::Reader(file) => OpenHandle::File {
                file,
                writable: false,
            },
            Outcome::Writer(file) => OpenHandle::File {
                file,
                writable: true,
            },
            _ => return Err(Error::Other("unexpected open response".into())),
        };

        Ok(handle_reply(id, &self.allocate(handle)))
    }

    async fn handle_close(&mut self, id: u32, buf: &mut &[u8]) -> Result<BytesMut> {
        let key = handle_key(buf)?;
        match self.handles.remove(&key) {
            Some(OpenHandle::File {
                mut file,
                writable: true,
            }) => {
                file.flush().await?;
                file.sync_all().await?;
            }
            Some(_) => {}
            None => return Err(Error::invalid_handle("Handle does not exist")),
        }
        Ok(status_reply(id, StatusCode::Ok, "Success"))
    }

    async fn handle_read(&mut self, id: u32, buf: &mut &[u8]) -> Result<BytesMut> {
        let key = handle_key(buf)?;
        let offset = codec::get_u64(buf)?;
        let len = codec::get_u32(buf)?.min(MAX_READ_LEN) as usize;

        let file = match self.handles.get_mut(&key) {
            Some(OpenHandle::File { file, .. }) => file,
            Some(OpenHandle::Dir { .. }) => {
                return Err(Error::invalid_handle("Cannot read from directory handle"));
            }
            None => return Err(Error::invalid_handle("Handle does not exist")),
        };

        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut data = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = file.read(&mut data[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        // a zero-length read only reports EOF at or past the end
        if filled == 0 && (len > 0 || offset >= file.metadata().await?.len()) {
            return Ok(status_reply(id, StatusCode::Eof, "End of file"));
        }
        data.truncate(filled);

        let mut reply = BytesMut::with_capacity(filled + 9);
        reply.put_u8(MessageType::Data as u8);
        reply.put_u32(id);
        codec::put_bytes(&mut reply, &data);
        Ok(reply)
    }

    async fn handle_write(&mut self, id: u32, buf: &mut &[u8]) -> Result<BytesMut> {
        let key = handle_key(buf)?;
        let offset = codec::get_u64(buf)?;
        let data = codec::get_bytes(buf)?;

        let file = match self.handles.get_mut(&key) {
            Some(OpenHandle::File {
                file,
                writable: true,
            }) => file,
            Some(OpenHandle::File { .. }) => {
                return Err(Error::PermissionDenied("handle not open for writing".into()));
            }
            Some(OpenHandle::Dir { .. }) => {
                return Err(Error::invalid_handle("Cannot write to directory handle"));
            }
            None => return Err(Error::invalid_handle("Handle does not exist")),
        };

        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(&data).await?;
        Ok(status_reply(id, StatusCode::Ok, "Success"))
    }

    async fn handle_stat(&mut self, id: u32, buf: &mut &[u8]) -> Result<BytesMut> {
        let path = codec::get_string(buf)?;
        let listing = match self.handler.handle(Operation::Stat { path }).await? {
            Outcome::Listing(listing) => listing,
            _ => return Err(Error::Other("unexpected stat response".into())),
        };

        let entry = listing
            .list_at(0, 1)
            .first()
            .ok_or_else(|| Error::FileNotFound("empty stat result".into()))?;
        Ok(attrs_reply(id, &entry.attrs))
    }

    async fn handle_fstat(&mut self, id: u32, buf: &mut &[u8]) -> Result<BytesMut> {
        let key = handle_key(buf)?;
        match self.handles.get(&key) {
            Some(OpenHandle::File { file, .. }) => {
                let metadata = file.metadata().await?;
                Ok(attrs_reply(id, &FileAttrs::from_metadata(&metadata)))
            }
            Some(OpenHandle::Dir { .. }) => {
                Err(Error::invalid_handle("Cannot fstat a directory handle"))
            }
            None => Err(Error::invalid_handle("Handle does not exist")),
        }
    }

    async fn handle_opendir(&mut self, id: u32, buf: &mut &[u8]) -> Result<BytesMut> {
        let path = codec::get_string(buf)?;
        let listing = match self.handler.handle(Operation::List { path }).await? {
            Outcome::Listing(listing) => listing,
            _ => return Err(Error::Other("unexpected list response".into())),
        };

        let key = self.allocate(OpenHandle::Dir { listing, offset: 0 });
        Ok(handle_reply(id, &key))
    }

    fn handle_readdir(&mut self, id: u32, buf: &mut &[u8]) -> Result<BytesMut> {
        let key = handle_key(buf)?;
        let (listing, offset) = match self.handles.get_mut(&key) {
            Some(OpenHandle::Dir { listing, offset }) => (listing, offset),
            Some(OpenHandle::File { .. }) => {
                return Err(Error::invalid_handle("Not a directory handle"));
            }
            None => return Err(Error::invalid_handle("Handle does not exist")),
        };

        let page = listing.list_at(*offset, READDIR_PAGE);
        if page.is_empty() {
            return Ok(status_reply(id, StatusCode::Eof, "End of directory"));
        }
        *offset += page.len();

        let mut reply = BytesMut::new();
        reply.put_u8(MessageType::Name as u8);
        reply.put_u32(id);
        reply.put_u32(page.len() as u32);
        for entry in page {
            codec::put_string(&mut reply, &entry.name);
            codec::put_string(&mut reply, &entry.long_name());
            reply.extend_from_slice(&entry.attrs.encode());
        }
        Ok(reply)
    }

    async fn handle_remove(&mut self, id: u32, buf: &mut &[u8]) -> Result<BytesMut> {
        let path = codec::get_string(buf)?;
        self.handler.handle(Operation::Remove { path }).await?;
        Ok(status_reply(id, StatusCode::Ok, "Success"))
    }

    async fn refuse(&mut self, family: CommandFamily, name: &str) -> Result<BytesMut> {
        let operation = Operation::Unsupported {
            family,
            name: name.to_string(),
        };
        self.handler.handle(operation).await?;
        Err(Error::Other(format!("{} was not refused", name)))
    }

    fn allocate(&mut self, handle: OpenHandle) -> String {
        let key = self.next_handle.to_string();
        self.next_handle += 1;
        self.handles.insert(key.clone(), handle);
        key
    }

    async fn close_all(&mut self) {
        for (_, handle) in self.handles.drain() {
            if let OpenHandle::File {
                mut file,
                writable: true,
            } = handle
            {
                if let Err(e) = file.flush().await {
                    warn!(error = %e, "Failed to flush file on session end");
                }
            }
        }
    }
}

fn handle_realpath(id: u32, buf: &mut &[u8]) -> Result<BytesMut> {
    let path = codec::get_string(buf)?;
    let cleaned = clean_virtual(&path);

    let mut reply = BytesMut::new();
    reply.put_u8(MessageType::Name as u8);
    reply.put_u32(id);
    reply.put_u32(1);
    codec::put_string(&mut reply, &cleaned);
    codec::put_string(&mut reply, &cleaned);
    reply.extend_from_slice(&FileAttrs::default().encode());
    Ok(reply)
}

fn handle_key(buf: &mut &[u8]) -> Result<String> {
    let raw = codec::get_bytes(buf)?;
    String::from_utf8(raw).map_err(|_| Error::invalid_handle("Malformed handle"))
}

fn status_reply(id: u32, code: StatusCode, message: &str) -> BytesMut {
    let mut reply = BytesMut::new();
    reply.put_u8(MessageType::Status as u8);
    reply.put_u32(id);
    reply.put_u32(code.into());
    codec::put_string(&mut reply, message);
    codec::put_string(&mut reply, "");
    reply
}

fn handle_reply(id: u32, key: &str) -> BytesMut {
    let mut reply = BytesMut::new();
    reply.put_u8(MessageType::Handle as u8);
    reply.put_u32(id);
    codec::put_string(&mut reply, key);
    reply
}

fn attrs_reply(id: u32, attrs: &FileAttrs) -> BytesMut {
    let mut reply = BytesMut::new();
    reply.put_u8(MessageType::Attrs as u8);
    reply.put_u32(id);
    reply.extend_from_slice(&attrs.encode());
    reply
}
