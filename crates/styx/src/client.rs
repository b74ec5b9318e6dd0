//! Asynchronous client side of a 9P2000 connection.
//!
//! One task owns the read half and routes responses to waiting callers by
//! tag; writes from concurrent callers are serialised through a mutex, so
//! any number of transactions can be in flight at once.

use {
    crate::{
        error::{Error, string},
        fcall::*,
        framing::FrameCodec,
        utils::Result,
    },
    futures::sink::SinkExt,
    log::{error, info, warn},
    std::{
        collections::{HashMap, HashSet},
        sync::Arc,
    },
    tokio::{
        io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf},
        sync::{Mutex, oneshot},
    },
    tokio_stream::StreamExt,
    tokio_util::codec::{FramedRead, FramedWrite},
};

pub use crate::srv::ConnInfo;

/// The fid this client binds to the root of the served tree.
pub const ROOT_FID: u32 = 0;

/// Client-side connection settings.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// The largest frame this client is willing to handle; the handshake
    /// negotiates down from here.
    pub msize: u32,
    /// User name sent in the attach
    pub uname: String,
    /// The tree to attach to
    pub aname: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            msize: DEFAULT_MSIZE,
            uname: "anon".to_owned(),
            aname: String::new(),
        }
    }
}

trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> AsyncReadWrite for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

type BoxedStream = Box<dyn AsyncReadWrite>;

/// 16-bit transaction tags, skipping `NOTAG` and tags still in flight.
#[derive(Debug, Default)]
struct TagAlloc {
    next: u16,
    in_use: HashSet<u16>,
}

impl TagAlloc {
    fn alloc(&mut self) -> Option<u16> {
        for _ in 0..=u16::MAX as u32 {
            let tag = self.next;
            self.next = self.next.wrapping_add(1);
            if tag == NOTAG {
                continue;
            }
            if self.in_use.insert(tag) {
                return Some(tag);
            }
        }
        None
    }

    fn free(&mut self, tag: u16) {
        self.in_use.remove(&tag);
    }
}

/// 32-bit fids, skipping `NOFID` and the root fid, reusing clunked ones.
#[derive(Debug)]
struct FidAlloc {
    next: u32,
    free: Vec<u32>,
}

impl Default for FidAlloc {
    fn default() -> Self {
        FidAlloc {
            next: ROOT_FID.wrapping_add(1),
            free: Vec::new(),
        }
    }
}

impl FidAlloc {
    fn alloc(&mut self) -> u32 {
        if let Some(fid) = self.free.pop() {
            return fid;
        }
        loop {
            let fid = self.next;
            self.next = self.next.wrapping_add(1);
            if fid != NOFID && fid != ROOT_FID {
                return fid;
            }
        }
    }

    fn release(&mut self, fid: u32) {
        self.free.push(fid);
    }
}

struct Inner {
    writer: Mutex<FramedWrite<WriteHalf<BoxedStream>, FrameCodec>>,
    pending: Mutex<HashMap<u16, oneshot::Sender<FCall>>>,
    tags: Mutex<TagAlloc>,
    fids: Mutex<FidAlloc>,
    info: ConnInfo,
    root_qid: QId,
}

/// A connected 9P2000 client.
///
/// Cheap to clone; all clones share the connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

/// An in-flight transaction: await it with [`Call::wait`] or abort it with
/// [`Call::cancel`].
pub struct Call {
    tag: u16,
    rx: oneshot::Receiver<FCall>,
    inner: Arc<Inner>,
}

impl Client {
    /// Run the version/attach handshake over `stream` and start the response
    /// router.
    pub async fn connect<S>(stream: S, config: ClientConfig) -> Result<Client>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let stream: BoxedStream = Box::new(stream);
        let (reader, writer) = tokio::io::split(stream);
        let mut framedread = FramedRead::new(reader, FrameCodec::new(config.msize));
        let mut framedwrite = FramedWrite::new(writer, FrameCodec::new(config.msize));

        framedwrite
            .send(&Msg {
                tag: NOTAG,
                body: FCall::TVersion {
                    msize: config.msize,
                    version: P92000.to_owned(),
                },
            })
            .await?;

        let msg = recv_msg(&mut framedread).await?;
        let (msize, version) = match msg.body {
            FCall::RVersion { msize, version } if msg.tag == NOTAG => (msize, version),
            FCall::RError { ename } => return Err(Error::Ename(ename)),
            other => {
                return Err(Error::Protocol(format!(
                    "expected Rversion, got {:?}",
                    MsgType::from(&other)
                )));
            }
        };
        if version != P92000 {
            return Err(Error::Protocol(format!(
                "server does not speak {}: offered {:?}",
                P92000, version
            )));
        }
        if msize > config.msize {
            return Err(Error::Protocol(format!(
                "server raised msize to {} beyond our offer {}",
                msize, config.msize
            )));
        }
        framedread.decoder_mut().set_msize(msize);
        framedwrite.encoder_mut().set_msize(msize);

        let mut tags = TagAlloc::default();
        let tag = tags.alloc().ok_or(Error::TagsExhausted)?;
        framedwrite
            .send(&Msg {
                tag,
                body: FCall::TAttach {
                    fid: ROOT_FID,
                    afid: NOFID,
                    uname: config.uname.clone(),
                    aname: config.aname.clone(),
                },
            })
            .await?;

        let msg = recv_msg(&mut framedread).await?;
        let root_qid = match msg.body {
            FCall::RAttach { qid } if msg.tag == tag => qid,
            FCall::RError { ename } => return Err(Error::Ename(ename)),
            other => {
                return Err(Error::Protocol(format!(
                    "expected Rattach, got {:?}",
                    MsgType::from(&other)
                )));
            }
        };
        tags.free(tag);

        info!(
            "attached: aname={:?} msize={} root={:?}",
            config.aname, msize, root_qid
        );

        let inner = Arc::new(Inner {
            writer: Mutex::new(framedwrite),
            pending: Mutex::new(HashMap::new()),
            tags: Mutex::new(tags),
            fids: Mutex::new(FidAlloc::default()),
            info: ConnInfo {
                root_fid: ROOT_FID,
                version,
                aname: config.aname,
                msize,
            },
            root_qid,
        });

        let router = inner.clone();
        tokio::spawn(async move { read_loop(framedread, router).await });

        Ok(Client { inner })
    }

    /// Parameters negotiated with this server.
    pub fn info(&self) -> &ConnInfo {
        &self.inner.info
    }

    /// The fid bound to the served tree's root.
    pub fn root(&self) -> u32 {
        self.inner.info.root_fid
    }

    /// The qid the server returned for the root.
    pub fn root_qid(&self) -> QId {
        self.inner.root_qid
    }

    /// Issue a request and return a handle for awaiting its response.
    pub async fn send(&self, body: FCall) -> Result<Call> {
        match body {
            FCall::TVersion { .. } | FCall::TAttach { .. } => {
                return Err(Error::Protocol(
                    "handshake messages cannot be reissued".to_owned(),
                ));
            }
            ref body if body.is_r() => {
                return Err(Error::Protocol(
                    "clients send T-messages only".to_owned(),
                ));
            }
            _ => {}
        }

        let tag = self
            .inner
            .tags
            .lock()
            .await
            .alloc()
            .ok_or(Error::TagsExhausted)?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(tag, tx);

        let msg = Msg { tag, body };
        info!("\t→ {:?}", msg);

        let sent = {
            let mut writer = self.inner.writer.lock().await;
            writer.send(&msg).await
        };
        if let Err(e) = sent {
            self.inner.pending.lock().await.remove(&tag);
            self.inner.tags.lock().await.free(tag);
            return Err(e);
        }

        Ok(Call {
            tag,
            rx,
            inner: self.inner.clone(),
        })
    }

    /// Issue a request and wait for its response.
    pub async fn call(&self, body: FCall) -> Result<FCall> {
        self.send(body).await?.wait().await
    }

    /// Walk from `fid` along `wnames`, returning a freshly allocated fid for
    /// the destination together with the qids visited.
    pub async fn walk(&self, fid: u32, wnames: &[&str]) -> Result<(u32, Vec<QId>)> {
        let newfid = self.inner.fids.lock().await.alloc();
        let req = FCall::TWalk {
            fid,
            newfid,
            wnames: wnames.iter().map(|s| (*s).to_owned()).collect(),
        };

        match self.call(req).await {
            // A shorter qid list means the walk stopped early and the new
            // fid was never installed.
            Ok(FCall::RWalk { wqids }) if wqids.len() == wnames.len() => Ok((newfid, wqids)),
            Ok(FCall::RWalk { .. }) => {
                self.inner.fids.lock().await.release(newfid);
                Err(Error::Ename(string::ENOENT.to_owned()))
            }
            Ok(other) => {
                self.inner.fids.lock().await.release(newfid);
                Err(unexpected(MsgType::RWalk, &other))
            }
            Err(e) => {
                self.inner.fids.lock().await.release(newfid);
                Err(e)
            }
        }
    }

    /// Open `fid` with one of the `om` modes.
    pub async fn open(&self, fid: u32, mode: u8) -> Result<(QId, u32)> {
        match self.call(FCall::TOpen { fid, mode }).await? {
            FCall::ROpen { qid, iounit } => Ok((qid, iounit)),
            other => Err(unexpected(MsgType::ROpen, &other)),
        }
    }

    /// Create `name` in the directory `fid` and open it; `fid` then refers
    /// to the new file.
    pub async fn create(&self, fid: u32, name: &str, perm: u32, mode: u8) -> Result<(QId, u32)> {
        let req = FCall::TCreate {
            fid,
            name: name.to_owned(),
            perm,
            mode,
        };
        match self.call(req).await? {
            FCall::RCreate { qid, iounit } => Ok((qid, iounit)),
            other => Err(unexpected(MsgType::RCreate, &other)),
        }
    }

    /// Read up to `count` bytes at `offset`.
    pub async fn read(&self, fid: u32, offset: u64, count: u32) -> Result<Vec<u8>> {
        let count = count.min(self.inner.info.msize - IOHDRSZ);
        match self.call(FCall::TRead { fid, offset, count }).await? {
            FCall::RRead { data } => Ok(data.0),
            other => Err(unexpected(MsgType::RRead, &other)),
        }
    }

    /// Write `data` at `offset`, returning the count accepted.
    pub async fn write(&self, fid: u32, offset: u64, data: &[u8]) -> Result<u32> {
        let req = FCall::TWrite {
            fid,
            offset,
            data: Data(data.to_vec()),
        };
        match self.call(req).await? {
            FCall::RWrite { count } => Ok(count),
            other => Err(unexpected(MsgType::RWrite, &other)),
        }
    }

    /// Release `fid`; it becomes available for reuse.
    pub async fn clunk(&self, fid: u32) -> Result<()> {
        match self.call(FCall::TClunk { fid }).await? {
            FCall::RClunk => {
                self.release_fid(fid).await;
                Ok(())
            }
            other => Err(unexpected(MsgType::RClunk, &other)),
        }
    }

    /// Remove the file `fid` refers to; the fid is clunked either way.
    pub async fn remove(&self, fid: u32) -> Result<()> {
        let result = self.call(FCall::TRemove { fid }).await;
        self.release_fid(fid).await;
        match result? {
            FCall::RRemove => Ok(()),
            other => Err(unexpected(MsgType::RRemove, &other)),
        }
    }

    /// Fetch the directory entry for `fid`.
    pub async fn stat(&self, fid: u32) -> Result<Stat> {
        match self.call(FCall::TStat { fid }).await? {
            FCall::RStat { stat } => Ok(stat),
            other => Err(unexpected(MsgType::RStat, &other)),
        }
    }

    /// Update the directory entry for `fid`.
    pub async fn wstat(&self, fid: u32, stat: Stat) -> Result<()> {
        match self.call(FCall::TWStat { fid, stat }).await? {
            FCall::RWStat => Ok(()),
            other => Err(unexpected(MsgType::RWStat, &other)),
        }
    }

    async fn release_fid(&self, fid: u32) {
        if fid != self.inner.info.root_fid && fid != NOFID {
            self.inner.fids.lock().await.release(fid);
        }
    }
}

impl Call {
    /// The tag this transaction was issued under.
    pub fn tag(&self) -> u16 {
        self.tag
    }

    /// Wait for the response; an `Rerror` resolves as [`Error::Ename`].
    pub async fn wait(self) -> Result<FCall> {
        let Call { tag, rx, inner } = self;

        let outcome = rx.await;
        inner.tags.lock().await.free(tag);

        match outcome {
            Err(_) => Err(Error::Disconnected),
            Ok(FCall::RError { ename }) => Err(Error::Ename(ename)),
            Ok(body) => Ok(body),
        }
    }

    /// Abort the transaction with a `Tflush` exchange.
    ///
    /// The tag stays reserved until the server's `Rflush` arrives; per the
    /// protocol, the server sends no response for it after that.
    pub async fn cancel(self) -> Result<()> {
        let Call { tag, rx, inner } = self;

        let flush_tag = inner
            .tags
            .lock()
            .await
            .alloc()
            .ok_or(Error::TagsExhausted)?;
        let (tx, flush_rx) = oneshot::channel();
        inner.pending.lock().await.insert(flush_tag, tx);

        let msg = Msg {
            tag: flush_tag,
            body: FCall::TFlush { oldtag: tag },
        };
        info!("\t→ {:?}", msg);
        let sent = {
            let mut writer = inner.writer.lock().await;
            writer.send(&msg).await
        };
        if let Err(e) = sent {
            inner.pending.lock().await.remove(&flush_tag);
            inner.tags.lock().await.free(flush_tag);
            return Err(e);
        }

        let outcome = flush_rx.await;
        inner.tags.lock().await.free(flush_tag);

        // Only now may the old tag be retired and reused.
        inner.pending.lock().await.remove(&tag);
        inner.tags.lock().await.free(tag);
        drop(rx);

        match outcome {
            Err(_) => Err(Error::Disconnected),
            Ok(FCall::RFlush) => Ok(()),
            Ok(FCall::RError { ename }) => Err(Error::Ename(ename)),
            Ok(other) => Err(unexpected(MsgType::RFlush, &other)),
        }
    }
}

fn unexpected(want: MsgType, got: &FCall) -> Error {
    Error::Protocol(format!(
        "expected {:?}, got {:?}",
        want,
        MsgType::from(got)
    ))
}

async fn recv_msg<R>(framedread: &mut FramedRead<R, FrameCodec>) -> Result<Msg>
where
    R: AsyncRead + Unpin,
{
    let frame = framedread.next().await.ok_or(Error::Disconnected)??;
    frame.parse().map_err(Error::Decode)
}

async fn read_loop(
    mut framedread: FramedRead<ReadHalf<BoxedStream>, FrameCodec>,
    inner: Arc<Inner>,
) {
    loop {
        match framedread.next().await {
            None => break,
            Some(Err(e)) => {
                error!("connection lost: {}", e);
                break;
            }
            Some(Ok(frame)) => {
                let msg = match frame.parse() {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("dropping malformed response at tag {}: {}", frame.tag, e);
                        continue;
                    }
                };
                info!("\t← {:?}", msg);

                let tx = inner.pending.lock().await.remove(&msg.tag);
                match tx {
                    Some(tx) => {
                        let _ = tx.send(msg.body);
                    }
                    // Nothing waits on this tag; the server is confused.
                    None => warn!("dropping response with unknown tag {}", msg.tag),
                }
            }
        }
    }

    // Dropping the senders resolves every outstanding call as Disconnected.
    inner.pending.lock().await.clear();
}
