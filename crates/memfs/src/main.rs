use {
    async_trait::async_trait,
    clap::Parser,
    std::{collections::HashMap, sync::Arc},
    styx::{
        Data, FCall, QId, Result, dm, errstr, om,
        serialize::Encodable,
        srv::{ConnInfo, Handler, srv},
    },
    tokio::sync::RwLock,
};

mod fs;
use crate::fs::{ROOT_PATH, Tree};

// Access class in the low bits of an open mode.
fn readable(mode: u8) -> bool {
    mode & 3 != om::WRITE
}

fn writable(mode: u8) -> bool {
    matches!(mode & 3, om::WRITE | om::RDWR)
}

struct FidState {
    path: u64,
    open: Option<u8>,
}

pub struct Memfs {
    tree: Arc<RwLock<Tree>>,
    fids: Arc<RwLock<HashMap<u32, FidState>>>,
}

impl Memfs {
    pub fn new() -> Memfs {
        Memfs {
            tree: Arc::new(RwLock::new(Tree::new())),
            fids: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn fid(&self, info: &ConnInfo, fid: u32) -> Result<FidEntry> {
        let fids = self.fids.read().await;
        if let Some(state) = fids.get(&fid) {
            return Ok(FidEntry {
                path: state.path,
                open: state.open,
            });
        }
        drop(fids);

        // The root fid is born at attach time without a Twalk.
        if fid == info.root_fid {
            self.fids.write().await.entry(fid).or_insert(FidState {
                path: ROOT_PATH,
                open: None,
            });
            return Ok(FidEntry {
                path: ROOT_PATH,
                open: None,
            });
        }

        Err(errstr::EBADF.into())
    }

    async fn walk(&self, info: &ConnInfo, fid: u32, newfid: u32, wnames: &[String]) -> Result<FCall> {
        let entry = self.fid(info, fid).await?;
        if entry.open.is_some() {
            return Err("cannot walk an open fid".into());
        }
        if newfid != fid && self.fids.read().await.contains_key(&newfid) {
            return Err("fid already in use".into());
        }

        let (dest, wqids) = {
            let tree = self.tree.read().await;
            let mut cur = entry.path;
            let mut wqids = Vec::new();
            for (i, name) in wnames.iter().enumerate() {
                match tree.lookup(cur, name) {
                    Ok(next) => {
                        wqids.push(tree.get(next)?.qid(next));
                        cur = next;
                    }
                    Err(e) if i == 0 => return Err(e),
                    Err(_) => break,
                }
            }
            (cur, wqids)
        };

        // The new fid exists only if every element walked.
        if wqids.len() == wnames.len() {
            self.fids.write().await.insert(
                newfid,
                FidState {
                    path: dest,
                    open: None,
                },
            );
        }

        Ok(FCall::RWalk { wqids })
    }

    async fn open(&self, info: &ConnInfo, fid: u32, mode: u8) -> Result<FCall> {
        let entry = self.fid(info, fid).await?;
        if entry.open.is_some() {
            return Err("fid already open".into());
        }

        let mut tree = self.tree.write().await;
        let node = tree.get(entry.path)?;
        if node.is_dir() && (!readable(mode) || mode & om::TRUNC != 0) {
            return Err(errstr::EISDIR.into());
        }

        if mode & om::TRUNC != 0 {
            tree.get_mut(entry.path)?.data.clear();
            tree.touch(entry.path)?;
        }

        let qid = tree.get(entry.path)?.qid(entry.path);
        self.fids.write().await.get_mut(&fid).ok_or(errstr::EBADF)?.open = Some(mode);
        Ok(FCall::ROpen { qid, iounit: 0 })
    }

    async fn create(
        &self,
        info: &ConnInfo,
        fid: u32,
        name: &str,
        perm: u32,
        mode: u8,
    ) -> Result<FCall> {
        let entry = self.fid(info, fid).await?;
        if entry.open.is_some() {
            return Err("fid already open".into());
        }

        let mut tree = self.tree.write().await;
        if !tree.get(entry.path)?.is_dir() {
            return Err(errstr::ENOTDIR.into());
        }
        if perm & dm::DIR != 0 && writable(mode) {
            return Err(errstr::EISDIR.into());
        }

        let path = tree.create(entry.path, name, perm)?;
        let qid = tree.get(path)?.qid(path);

        // The fid moves to the new file, open with the requested mode.
        self.fids.write().await.insert(
            fid,
            FidState {
                path,
                open: Some(mode),
            },
        );
        Ok(FCall::RCreate { qid, iounit: 0 })
    }

    async fn read(&self, info: &ConnInfo, fid: u32, offset: u64, count: u32) -> Result<FCall> {
        let entry = self.fid(info, fid).await?;
        let mode = entry.open.ok_or("fid not open")?;
        if !readable(mode) {
            return Err(errstr::EPERM.into());
        }

        let tree = self.tree.read().await;
        let node = tree.get(entry.path)?;

        let data = if node.is_dir() {
            dir_bytes(tree.read_dir(entry.path)?, offset, count)?
        } else {
            let len = node.data.len() as u64;
            let start = offset.min(len) as usize;
            let end = (offset.saturating_add(count as u64)).min(len) as usize;
            node.data[start..end].to_vec()
        };

        Ok(FCall::RRead { data: Data(data) })
    }

    async fn write(&self, info: &ConnInfo, fid: u32, offset: u64, data: &[u8]) -> Result<FCall> {
        let entry = self.fid(info, fid).await?;
        let mode = entry.open.ok_or("fid not open")?;
        if !writable(mode) {
            return Err(errstr::EPERM.into());
        }

        let mut tree = self.tree.write().await;
        let node = tree.get_mut(entry.path)?;
        if node.is_dir() {
            return Err(errstr::EISDIR.into());
        }

        let offset = if node.mode & dm::APPEND != 0 {
            node.data.len() as u64
        } else {
            offset
        };
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(errstr::EINVAL)?;
        if end > usize::MAX as u64 {
            return Err(errstr::EINVAL.into());
        }
        let (offset, end) = (offset as usize, end as usize);
        if node.data.len() < end {
            node.data.resize(end, 0);
        }
        node.data[offset..end].copy_from_slice(data);
        tree.touch(entry.path)?;

        Ok(FCall::RWrite {
            count: data.len() as u32,
        })
    }

    async fn clunk(&self, info: &ConnInfo, fid: u32, remove: bool) -> Result<FCall> {
        let entry = self.fid(info, fid).await?;
        let state = self.fids.write().await.remove(&fid);

        let rclose = matches!(state.and_then(|s| s.open), Some(m) if m & om::RCLOSE != 0);
        if remove || rclose {
            self.tree.write().await.remove(entry.path)?;
        }

        if remove {
            Ok(FCall::RRemove)
        } else {
            Ok(FCall::RClunk)
        }
    }

    async fn stat(&self, info: &ConnInfo, fid: u32) -> Result<FCall> {
        let entry = self.fid(info, fid).await?;
        let tree = self.tree.read().await;
        let stat = tree.get(entry.path)?.stat(entry.path);
        Ok(FCall::RStat { stat })
    }

    async fn wstat(&self, info: &ConnInfo, fid: u32, stat: &styx::Stat) -> Result<FCall> {
        let entry = self.fid(info, fid).await?;
        let mut tree = self.tree.write().await;

        // All-ones and empty fields mean "don't touch" in Twstat.
        if !stat.name.is_empty() {
            tree.rename(entry.path, &stat.name)?;
        }
        if stat.mode != u32::MAX {
            let node = tree.get_mut(entry.path)?;
            if (stat.mode ^ node.mode) & dm::DIR != 0 {
                return Err(errstr::EINVAL.into());
            }
            node.mode = stat.mode;
        }
        if stat.mtime != u32::MAX {
            tree.get_mut(entry.path)?.mtime = stat.mtime;
        }
        if stat.length != u64::MAX {
            if tree.get(entry.path)?.is_dir() {
                return Err(errstr::EISDIR.into());
            }
            tree.get_mut(entry.path)?.data.resize(stat.length as usize, 0);
            tree.touch(entry.path)?;
        }

        Ok(FCall::RWStat)
    }
}

struct FidEntry {
    path: u64,
    open: Option<u8>,
}

// A clone serves a new connection: the tree is shared, the fid table is not.
impl Clone for Memfs {
    fn clone(&self) -> Self {
        Memfs {
            tree: self.tree.clone(),
            fids: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for Memfs {
    fn default() -> Self {
        Memfs::new()
    }
}

/// Serialise whole stat records starting exactly at `offset`, never more
/// than `count` bytes of them.
fn dir_bytes(entries: Vec<styx::Stat>, offset: u64, count: u32) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut pos = 0u64;

    for stat in entries {
        let mut entry = Vec::new();
        stat.encode(&mut entry)?;
        let elen = entry.len() as u64;

        if pos + elen <= offset {
            pos += elen;
            continue;
        }
        if pos < offset {
            return Err("bad offset in directory read".into());
        }
        if buf.len() + entry.len() > count as usize {
            break;
        }
        buf.extend_from_slice(&entry);
        pos += elen;
    }

    Ok(buf)
}

#[async_trait]
impl Handler for Memfs {
    async fn attach(&self, _uname: &str, _aname: &str) -> Result<QId> {
        let tree = self.tree.read().await;
        Ok(tree.get(ROOT_PATH)?.qid(ROOT_PATH))
    }

    async fn rpc(&self, info: &ConnInfo, req: FCall) -> Result<FCall> {
        match req {
            FCall::TWalk {
                fid,
                newfid,
                ref wnames,
            } => self.walk(info, fid, newfid, wnames).await,
            FCall::TOpen { fid, mode } => self.open(info, fid, mode).await,
            FCall::TCreate {
                fid,
                ref name,
                perm,
                mode,
            } => self.create(info, fid, name, perm, mode).await,
            FCall::TRead { fid, offset, count } => self.read(info, fid, offset, count).await,
            FCall::TWrite {
                fid,
                offset,
                ref data,
            } => self.write(info, fid, offset, &data.0).await,
            FCall::TClunk { fid } => self.clunk(info, fid, false).await,
            FCall::TRemove { fid } => self.clunk(info, fid, true).await,
            FCall::TStat { fid } => self.stat(info, fid).await,
            FCall::TWStat { fid, ref stat } => self.wstat(info, fid, stat).await,
            _ => Err(errstr::EINVAL.into()),
        }
    }
}

#[derive(Debug, clap::Parser)]
struct Cli {
    /// proto!address!port
    /// where: proto = tcp | unix
    #[arg(default_value = "tcp!127.0.0.1!564")]
    address: String,
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = Cli::parse();
    println!("[*] Ready to accept clients: {}", cli.address);

    if let Err(e) = srv(Memfs::new(), &cli.address).await {
        eprintln!("Error: {:?}", e);
        std::process::exit(-1);
    }
}
