//! Asynchronous server side of a 9P2000 connection.
//!
//! A connection is driven through the protocol state machine: a `Tversion`
//! exchange, a `Tattach`, then a dispatcher loop that serves requests
//! concurrently and writes tag-correlated responses in completion order.

use {
    crate::{
        error::{Error, string},
        fcall::*,
        framing::FrameCodec,
        io_err,
        utils::{self, Result},
    },
    async_trait::async_trait,
    futures::sink::SinkExt,
    log::{error, info, warn},
    std::{
        collections::HashMap,
        path::{Path, PathBuf},
        sync::{Arc, atomic::Ordering},
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpListener, UnixListener},
        sync::{Mutex, watch},
        task::JoinHandle,
    },
    tokio_stream::StreamExt,
    tokio_util::codec::{FramedRead, FramedWrite},
};

/// Connection parameters fixed by the version/attach handshake.
///
/// Immutable once the dispatcher is running.
#[derive(Clone, Debug)]
pub struct ConnInfo {
    /// The fid the client bound to the root of the tree
    pub root_fid: u32,
    /// Negotiated protocol version
    pub version: String,
    /// The tree the client attached to
    pub aname: String,
    /// Negotiated maximum message size
    pub msize: u32,
}

/// Server-side connection settings.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// The largest frame this server is willing to handle; the handshake
    /// negotiates down to `min(msize, client msize)`.
    pub msize: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            msize: DEFAULT_MSIZE,
        }
    }
}

/// The request callback a file server plugs in behind a connection.
///
/// `rpc` may be invoked concurrently for different tags on the same
/// connection; implementations must be prepared for that. Returning `Err`
/// sends an `Rerror` carrying the error's ename and keeps the connection
/// alive.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Produce the root qid for an attach.
    async fn attach(&self, _uname: &str, _aname: &str) -> Result<QId> {
        Ok(QId {
            typ: QIdType::DIR,
            version: 0,
            path: 0,
        })
    }

    /// Serve one T-message, producing the matching R-message.
    ///
    /// `Tversion`, `Tattach` and `Tflush` never reach this method; the
    /// engine handles them itself.
    async fn rpc(&self, info: &ConnInfo, req: FCall) -> Result<FCall>;
}

/// A live server connection with a running dispatcher.
pub struct Connection {
    info: Arc<ConnInfo>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl Connection {
    /// Parameters negotiated with this client.
    pub fn info(&self) -> &ConnInfo {
        &self.info
    }

    /// Request shutdown and wait for the dispatcher to exit.
    ///
    /// In-flight handlers are not cancelled; responses they produce after
    /// this point are discarded.
    pub async fn disconnect(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.task
            .await
            .map_err(|e| Error::Io(io_err!(Other, e.to_string())))?
    }

    /// Wait for the client to hang up or the connection to fail.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| Error::Io(io_err!(Other, e.to_string())))?
    }
}

/// Perform the server-side handshake on a fresh byte stream and spawn the
/// dispatcher.
///
/// Fails if the peer opens with anything but a well-formed `Tversion` at
/// `NOTAG`, proposes an unintelligible version (after answering
/// `Rversion "unknown"`), or does not follow up with a `Tattach`.
pub async fn accept<H, R, W>(
    handler: H,
    reader: R,
    writer: W,
    config: ServerConfig,
) -> Result<Connection>
where
    H: Handler,
    R: 'static + AsyncRead + Send + Unpin,
    W: 'static + AsyncWrite + Send + Unpin,
{
    let mut framedread = FramedRead::new(reader, FrameCodec::new(config.msize));
    let mut framedwrite = FramedWrite::new(writer, FrameCodec::new(config.msize));

    let handler = Arc::new(handler);
    let info = Arc::new(handshake(&handler, &mut framedread, &mut framedwrite, &config).await?);

    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(dispatch(
        handler,
        framedread,
        Arc::new(Mutex::new(framedwrite)),
        info.clone(),
        shutdown_rx,
    ));

    Ok(Connection {
        info,
        shutdown,
        task,
    })
}

async fn recv_msg<R>(framedread: &mut FramedRead<R, FrameCodec>) -> Result<Msg>
where
    R: AsyncRead + Unpin,
{
    let frame = framedread.next().await.ok_or(Error::Disconnected)??;
    frame.parse().map_err(Error::Decode)
}

async fn reply<W>(framedwrite: &mut FramedWrite<W, FrameCodec>, tag: u16, body: FCall) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    framedwrite.send(&Msg { tag, body }).await
}

// How many Tauth probes the handshake refuses before giving up on the peer.
const AUTH_REFUSAL_LIMIT: u32 = 8;

async fn handshake<H, R, W>(
    handler: &Arc<H>,
    framedread: &mut FramedRead<R, FrameCodec>,
    framedwrite: &mut FramedWrite<W, FrameCodec>,
    config: &ServerConfig,
) -> Result<ConnInfo>
where
    H: Handler,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let msg = recv_msg(framedread).await?;
    let (client_msize, client_version) = match msg.body {
        FCall::TVersion { msize, version } if msg.tag == NOTAG => (msize, version),
        _ => {
            reply(
                framedwrite,
                msg.tag,
                FCall::RError {
                    ename: string::EBOTCH.to_owned(),
                },
            )
            .await?;
            return Err(Error::Protocol("expected Tversion at NOTAG".to_owned()));
        }
    };

    let msize = config.msize.min(client_msize);

    // "9P2000.x" negotiates down to plain 9P2000; anything else is refused
    // with the "unknown" sentinel.
    if client_version != P92000 && !client_version.starts_with("9P2000.") {
        reply(
            framedwrite,
            NOTAG,
            FCall::RVersion {
                msize,
                version: VERSION_UNKNOWN.to_owned(),
            },
        )
        .await?;
        return Err(Error::Protocol(format!(
            "unsupported version {:?}",
            client_version
        )));
    }

    framedread.decoder_mut().set_msize(msize);
    framedwrite.encoder_mut().set_msize(msize);
    reply(
        framedwrite,
        NOTAG,
        FCall::RVersion {
            msize,
            version: P92000.to_owned(),
        },
    )
    .await?;

    let mut auth_refusals = 0u32;
    loop {
        let msg = recv_msg(framedread).await?;
        match msg.body {
            // No authentication: refuse the afid, keep waiting for the
            // attach. Past the limit the peer is not attaching in good faith
            // and falls through to the violation arm.
            FCall::TAuth { .. } if auth_refusals < AUTH_REFUSAL_LIMIT => {
                auth_refusals += 1;
                reply(
                    framedwrite,
                    msg.tag,
                    FCall::RError {
                        ename: string::ENOAUTH.to_owned(),
                    },
                )
                .await?;
            }
            FCall::TAttach {
                fid, uname, aname, ..
            } if msg.tag != NOTAG => {
                let qid = match handler.attach(&uname, &aname).await {
                    Ok(qid) => qid,
                    Err(e) => {
                        reply(
                            framedwrite,
                            msg.tag,
                            FCall::RError { ename: e.ename() },
                        )
                        .await?;
                        return Err(e);
                    }
                };
                reply(framedwrite, msg.tag, FCall::RAttach { qid }).await?;

                info!(
                    "attached: fid={} aname={:?} msize={}",
                    fid, aname, msize
                );
                return Ok(ConnInfo {
                    root_fid: fid,
                    version: P92000.to_owned(),
                    aname,
                    msize,
                });
            }
            _ => {
                reply(
                    framedwrite,
                    msg.tag,
                    FCall::RError {
                        ename: string::EBOTCH.to_owned(),
                    },
                )
                .await?;
                return Err(Error::Protocol(
                    "expected Tattach after version negotiation".to_owned(),
                ));
            }
        }
    }
}

async fn dispatch<H, R, W>(
    handler: Arc<H>,
    mut framedread: FramedRead<R, FrameCodec>,
    framedwrite: Arc<Mutex<FramedWrite<W, FrameCodec>>>,
    info: Arc<ConnInfo>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    H: Handler,
    R: 'static + AsyncRead + Send + Unpin,
    W: 'static + AsyncWrite + Send + Unpin,
{
    // tag -> sequence number of the request a handler is working on. A
    // flush removes the entry, freeing the tag for immediate reuse; the
    // sequence number keeps a late handler from answering under a reused
    // tag's new life.
    let in_flight: Arc<Mutex<HashMap<u16, u64>>> = Default::default();
    let mut next_seq = 0u64;

    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            frame = framedread.next() => frame,
        };

        let frame = match frame {
            None => return Ok(()),
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                error!("connection lost: {}", e);
                return Err(e);
            }
        };

        let msg = match frame.parse() {
            Ok(msg) => msg,
            // The frame header survived, so the failure is reportable at
            // that tag and the connection keeps going.
            Err(e) => {
                warn!("malformed request at tag {}: {}", frame.tag, e);
                let mut w = framedwrite.lock().await;
                reply(
                    &mut *w,
                    frame.tag,
                    FCall::RError {
                        ename: e.to_string(),
                    },
                )
                .await?;
                continue;
            }
        };

        info!("\t← {:?}", msg);

        let violation = match msg.body {
            FCall::TVersion { .. } | FCall::TAttach { .. } | FCall::TAuth { .. } => true,
            _ => msg.body.is_r() || msg.tag == NOTAG,
        };
        if violation {
            let mut w = framedwrite.lock().await;
            reply(
                &mut *w,
                msg.tag,
                FCall::RError {
                    ename: string::EBOTCH.to_owned(),
                },
            )
            .await?;
            return Err(Error::Protocol(format!(
                "{:?} arrived on an established connection",
                MsgType::from(&msg.body)
            )));
        }

        if let FCall::TFlush { oldtag } = msg.body {
            // Holding the write lock across the retire and the Rflush pins
            // the ordering: once the Rflush is on the wire, no response for
            // oldtag can follow it, and the tag is free again.
            let mut w = framedwrite.lock().await;
            in_flight.lock().await.remove(&oldtag);
            reply(&mut *w, msg.tag, FCall::RFlush).await?;
            info!("\t→ Rflush tag={} oldtag={}", msg.tag, oldtag);
            continue;
        }

        let seq = next_seq;
        next_seq += 1;
        {
            let mut tags = in_flight.lock().await;
            if tags.contains_key(&msg.tag) {
                drop(tags);
                let mut w = framedwrite.lock().await;
                reply(
                    &mut *w,
                    msg.tag,
                    FCall::RError {
                        ename: string::EDUPTAG.to_owned(),
                    },
                )
                .await?;
                continue;
            }
            tags.insert(msg.tag, seq);
        }

        tokio::spawn(process_request(
            handler.clone(),
            info.clone(),
            framedwrite.clone(),
            in_flight.clone(),
            seq,
            msg,
        ));
    }
}

async fn process_request<H, W>(
    handler: Arc<H>,
    info: Arc<ConnInfo>,
    framedwrite: Arc<Mutex<FramedWrite<W, FrameCodec>>>,
    in_flight: Arc<Mutex<HashMap<u16, u64>>>,
    seq: u64,
    msg: Msg,
) where
    H: Handler,
    W: 'static + AsyncWrite + Send + Unpin,
{
    let tag = msg.tag;
    let body = match handler.rpc(&info, msg.body).await {
        Ok(body) if body.is_r() => body,
        Ok(body) => {
            error!(
                "handler returned {:?} for tag {}, expected an R-message",
                MsgType::from(&body),
                tag
            );
            FCall::RError {
                ename: string::EIO.to_owned(),
            }
        }
        Err(e) => FCall::RError { ename: e.ename() },
    };
    let response = Msg { tag, body };

    // Write lock first, then the flush table; see the Tflush path. A
    // missing or renumbered entry means this request was flushed and the
    // tag may already be living a new life.
    let mut w = framedwrite.lock().await;
    {
        let mut tags = in_flight.lock().await;
        if tags.get(&tag) != Some(&seq) {
            info!("discarding flushed response for tag {}", tag);
            return;
        }
        tags.remove(&tag);
    }

    if let Err(e) = w.send(&response).await {
        // The connection may already be shutting down; drop the response.
        warn!("dropping response for tag {}: {}", tag, e);
        return;
    }
    info!("\t→ {:?}", response);
}

async fn srv_tcp<H>(handler: H, addr: &str) -> Result<()>
where
    H: Handler + Clone,
{
    let listener = TcpListener::bind(addr).await?;

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("accepted: {:?}", peer);

        let handler = handler.clone();
        tokio::spawn(async move {
            let (readhalf, writehalf) = stream.into_split();
            let served = async {
                accept(handler, readhalf, writehalf, ServerConfig::default())
                    .await?
                    .join()
                    .await
            };
            if let Err(e) = served.await {
                error!("connection error: {}", e);
            }
        });
    }
}

struct DeleteOnDrop {
    path: PathBuf,
    listener: UnixListener,
}

impl DeleteOnDrop {
    fn bind(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_owned();
        UnixListener::bind(&path).map(|listener| DeleteOnDrop { path, listener })
    }
}

impl std::ops::Deref for DeleteOnDrop {
    type Target = UnixListener;

    fn deref(&self) -> &Self::Target {
        &self.listener
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        // There's no way to return a useful error here
        if let Err(e) = std::fs::remove_file(&self.path) {
            eprintln!(
                "Warning: Failed to remove socket file {:?}: {}",
                self.path, e
            );
        }
    }
}

async fn srv_unix<H>(handler: H, addr: impl AsRef<Path>) -> Result<()>
where
    H: Handler + Clone,
{
    use tokio::signal::unix::{SignalKind, signal};

    let listener = DeleteOnDrop::bind(addr)?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let running = Arc::new(std::sync::atomic::AtomicBool::new(true));

    {
        let running = running.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully");
                }
            }
            running.store(false, Ordering::SeqCst);
        });
    }

    while running.load(Ordering::SeqCst) {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        info!("accepted: {:?}", peer);

                        let handler = handler.clone();
                        tokio::spawn(async move {
                            let (readhalf, writehalf) = tokio::io::split(stream);
                            let served = async {
                                accept(handler, readhalf, writehalf, ServerConfig::default())
                                    .await?
                                    .join()
                                    .await
                            };
                            if let Err(e) = served.await {
                                error!("connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {
                // Allow the server to check the running flag
            }
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Listen on `proto!address!port` (`tcp!0.0.0.0!564`, `unix!/tmp/sock`) and
/// serve every connection with a clone of `handler`.
pub async fn srv<H>(handler: H, addr: &str) -> Result<()>
where
    H: Handler + Clone,
{
    let (proto, listen_addr) = utils::parse_proto(addr)
        .ok_or_else(|| io_err!(InvalidInput, "Invalid protocol or address"))?;

    match proto {
        "tcp" => srv_tcp(handler, &listen_addr).await,
        "unix" => srv_unix(handler, &listen_addr).await,
        _ => Err(From::from(io_err!(InvalidInput, "Protocol not supported"))),
    }
}
