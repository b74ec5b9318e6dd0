//! The in-memory file tree served over 9P.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use styx::{QId, QIdType, Result, Stat, dm, errstr};

/// Qid path of the root directory.
pub const ROOT_PATH: u64 = 0;

fn now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

pub struct Node {
    pub name: String,
    pub parent: u64,
    pub mode: u32,
    pub atime: u32,
    pub mtime: u32,
    pub version: u32,
    pub data: Vec<u8>,
    pub children: Vec<u64>,
}

impl Node {
    pub fn is_dir(&self) -> bool {
        self.mode & dm::DIR != 0
    }

    pub fn qid(&self, path: u64) -> QId {
        QId {
            typ: if self.is_dir() {
                QIdType::DIR
            } else {
                QIdType::FILE
            },
            version: self.version,
            path,
        }
    }

    pub fn stat(&self, path: u64) -> Stat {
        Stat {
            typ: 0,
            dev: 0,
            qid: self.qid(path),
            mode: self.mode,
            atime: self.atime,
            mtime: self.mtime,
            length: if self.is_dir() {
                0
            } else {
                self.data.len() as u64
            },
            name: if path == ROOT_PATH {
                "/".to_owned()
            } else {
                self.name.clone()
            },
            uid: "memfs".to_owned(),
            gid: "memfs".to_owned(),
            muid: "memfs".to_owned(),
        }
    }
}

pub struct Tree {
    nodes: HashMap<u64, Node>,
    next_path: u64,
}

impl Tree {
    pub fn new() -> Tree {
        let t = now();
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_PATH,
            Node {
                name: String::new(),
                parent: ROOT_PATH,
                mode: dm::DIR | 0o777,
                atime: t,
                mtime: t,
                version: 0,
                data: Vec::new(),
                children: Vec::new(),
            },
        );
        Tree {
            nodes,
            next_path: ROOT_PATH + 1,
        }
    }

    pub fn get(&self, path: u64) -> Result<&Node> {
        self.nodes.get(&path).ok_or_else(|| errstr::ENOENT.into())
    }

    pub fn get_mut(&mut self, path: u64) -> Result<&mut Node> {
        self.nodes
            .get_mut(&path)
            .ok_or_else(|| errstr::ENOENT.into())
    }

    /// Resolve one walk element inside the directory `dir`.
    pub fn lookup(&self, dir: u64, name: &str) -> Result<u64> {
        let node = self.get(dir)?;
        if !node.is_dir() {
            return Err(errstr::ENOTDIR.into());
        }

        match name {
            "." => Ok(dir),
            ".." => Ok(node.parent),
            _ => node
                .children
                .iter()
                .find(|&&c| self.nodes.get(&c).map(|n| n.name == name) == Some(true))
                .copied()
                .ok_or_else(|| errstr::ENOENT.into()),
        }
    }

    pub fn create(&mut self, dir: u64, name: &str, mode: u32) -> Result<u64> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(errstr::EINVAL.into());
        }
        if self.lookup(dir, name).is_ok() {
            return Err(errstr::EEXIST.into());
        }

        let t = now();
        let path = self.next_path;
        self.next_path += 1;
        self.nodes.insert(
            path,
            Node {
                name: name.to_owned(),
                parent: dir,
                mode,
                atime: t,
                mtime: t,
                version: 0,
                data: Vec::new(),
                children: Vec::new(),
            },
        );

        let parent = self.get_mut(dir)?;
        parent.children.push(path);
        parent.mtime = t;
        parent.version = parent.version.wrapping_add(1);
        Ok(path)
    }

    pub fn remove(&mut self, path: u64) -> Result<()> {
        if path == ROOT_PATH {
            return Err(errstr::EPERM.into());
        }
        let node = self.get(path)?;
        if node.is_dir() && !node.children.is_empty() {
            return Err(errstr::ENOTEMPTY.into());
        }

        let parent = node.parent;
        self.nodes.remove(&path);
        if let Ok(parent) = self.get_mut(parent) {
            parent.children.retain(|&c| c != path);
            parent.mtime = now();
            parent.version = parent.version.wrapping_add(1);
        }
        Ok(())
    }

    pub fn rename(&mut self, path: u64, new_name: &str) -> Result<()> {
        let parent = self.get(path)?.parent;
        if self.lookup(parent, new_name).is_ok() {
            return Err(errstr::EEXIST.into());
        }
        self.get_mut(path)?.name = new_name.to_owned();
        Ok(())
    }

    /// Stat records for the entries of `dir`, in a stable order.
    pub fn read_dir(&self, dir: u64) -> Result<Vec<Stat>> {
        let node = self.get(dir)?;
        if !node.is_dir() {
            return Err(errstr::ENOTDIR.into());
        }
        node.children
            .iter()
            .map(|&c| self.get(c).map(|n| n.stat(c)))
            .collect()
    }

    pub fn touch(&mut self, path: u64) -> Result<()> {
        let node = self.get_mut(path)?;
        node.mtime = now();
        node.version = node.version.wrapping_add(1);
        Ok(())
    }
}
