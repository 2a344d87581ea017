//! In-memory filesystem backend.
//!
//! Paths are resolved lexically from `/`; there are no symlinks, so STAT
//! and LSTAT agree. Handles are 4-byte big-endian slot numbers.

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use log::{debug, trace};

use crate::attrs::Attrs;
use crate::parse::{canonicalize, split_parent_name};
use crate::protocol::*;
use crate::server::{ReplyBuilder, SftpServer};

const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const PERM_MASK: u32 = 0o7777;

/// Most names returned by one READDIR.
const READDIR_BATCH: usize = 64;

/// Default bound on the size a client may grow a file to.
const DEFAULT_MAX_FILE_LEN: u64 = 64 * 1024 * 1024;

struct Node {
    dir: bool,
    data: Vec<u8>,
    permissions: u32,
    owner: (u32, u32),
    times: (u32, u32),
}

impl Node {
    fn attrs(&self) -> Attrs {
        let kind = if self.dir { S_IFDIR } else { S_IFREG };
        Attrs {
            size: Some(self.data.len() as u64),
            owner: Some(self.owner),
            permissions: Some(kind | self.permissions),
            times: Some(self.times),
        }
    }
}

enum OpenNode {
    File { path: String, flags: u32 },
    Dir { path: String, cursor: usize },
}

impl OpenNode {
    fn path_mut(&mut self) -> &mut String {
        match self {
            OpenNode::File { path, .. } | OpenNode::Dir { path, .. } => path,
        }
    }
}

/// Filesystem tree held entirely in memory.
pub struct MemFs {
    nodes: BTreeMap<String, Node>,
    handles: BTreeMap<u32, OpenNode>,
    next_handle: u32,
    now: u32,
    max_file_len: u64,
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemFs {
    /// An empty tree holding only `/`.
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(String::from("/"), Self::node(true, 0o755, 0));
        Self {
            nodes,
            handles: BTreeMap::new(),
            next_handle: 1,
            now: 0,
            max_file_len: DEFAULT_MAX_FILE_LEN,
        }
    }

    /// Refuse WRITE and SETSTAT requests that would leave a file longer than `len` bytes.
    pub fn with_max_file_len(mut self, len: u64) -> Self {
        self.max_file_len = len;
        self
    }

    /// Timestamp stamped on nodes created or modified from now on.
    pub fn set_time(&mut self, now: u32) {
        self.now = now;
    }

    /// Create a file, and any missing parent directories, holding `data`.
    pub fn insert_file(&mut self, path: &str, data: &[u8]) {
        let path = canonicalize("/", path);
        if let Ok((parent, _)) = split_parent_name(&path) {
            let parent = String::from(parent);
            self.insert_dir(&parent);
        }
        let mut node = Self::node(false, 0o644, self.now);
        node.data = data.to_vec();
        self.nodes.insert(path, node);
    }

    /// Create a directory and any missing parents.
    pub fn insert_dir(&mut self, path: &str) {
        let path = canonicalize("/", path);
        let mut prefix = String::new();
        for part in path.split('/').filter(|part| !part.is_empty()) {
            prefix.push('/');
            prefix.push_str(part);
            if !self.nodes.contains_key(&prefix) {
                let node = Self::node(true, 0o755, self.now);
                self.nodes.insert(prefix.clone(), node);
            }
        }
    }

    pub fn file_contents(&self, path: &str) -> Option<&[u8]> {
        match self.nodes.get(&canonicalize("/", path)) {
            Some(node) if !node.dir => Some(&node.data),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.nodes.contains_key(&canonicalize("/", path))
    }

    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    fn node(dir: bool, permissions: u32, now: u32) -> Node {
        Node {
            dir,
            data: Vec::new(),
            permissions,
            owner: (0, 0),
            times: (now, now),
        }
    }

    fn alloc_handle(&mut self, open: OpenNode) -> [u8; 4] {
        let mut id = self.next_handle;
        while self.handles.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        self.next_handle = id.wrapping_add(1);
        self.handles.insert(id, open);
        id.to_be_bytes()
    }

    fn handle_id(handle: &[u8]) -> Option<u32> {
        let raw: [u8; 4] = handle.try_into().ok()?;
        Some(u32::from_be_bytes(raw))
    }

    fn open_node(&mut self, handle: &[u8]) -> Option<&mut OpenNode> {
        self.handles.get_mut(&Self::handle_id(handle)?)
    }

    fn handle_path(&self, handle: &[u8]) -> Option<&str> {
        match self.handles.get(&Self::handle_id(handle)?)? {
            OpenNode::File { path, .. } | OpenNode::Dir { path, .. } => Some(path.as_str()),
        }
    }

    /// Names directly inside `dir`, in sorted order.
    fn children(&self, dir: &str) -> Vec<String> {
        let prefix = if dir == "/" {
            String::from("/")
        } else {
            format!("{}/", dir)
        };
        self.nodes
            .range::<str, _>((
                core::ops::Bound::Excluded(prefix.as_str()),
                core::ops::Bound::Unbounded,
            ))
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| &key[prefix.len()..])
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(ToString::to_string)
            .collect()
    }

    fn parent_is_dir(&self, path: &str) -> bool {
        match split_parent_name(path) {
            Ok((parent, _)) => self.nodes.get(parent).is_some_and(|node| node.dir),
            Err(_) => false,
        }
    }

    fn apply_attrs(
        node: &mut Node,
        attrs: &Attrs,
        now: u32,
        max_len: u64,
    ) -> Result<(), (u32, &'static str)> {
        if let Some(size) = attrs.size {
            if node.dir {
                return Err((SSH_FX_FAILURE, "cannot resize a directory"));
            }
            if size > max_len {
                return Err((SSH_FX_FAILURE, "size too large"));
            }
            let size = usize::try_from(size).map_err(|_| (SSH_FX_FAILURE, "size too large"))?;
            node.data.resize(size, 0);
            node.times.1 = now;
        }
        if let Some(perms) = attrs.permissions {
            node.permissions = perms & PERM_MASK;
        }
        if let Some(owner) = attrs.owner {
            node.owner = owner;
        }
        if let Some(times) = attrs.times {
            node.times = times;
        }
        Ok(())
    }

    fn setstat_path(&mut self, reply: &mut dyn ReplyBuilder, path: &str, attrs: &Attrs) {
        let (now, max_len) = (self.now, self.max_file_len);
        match self.nodes.get_mut(path) {
            None => reply.reply_error(SSH_FX_NO_SUCH_FILE, "no such file or directory"),
            Some(node) => match Self::apply_attrs(node, attrs, now, max_len) {
                Ok(()) => reply.reply_ok(),
                Err((code, msg)) => reply.reply_error(code, msg),
            },
        }
    }
}

impl SftpServer for MemFs {
    fn realpath(&mut self, reply: &mut dyn ReplyBuilder, path: &str) {
        reply.reply_simple_name(&canonicalize("/", path));
    }

    fn open(&mut self, reply: &mut dyn ReplyBuilder, path: &str, flags: u32, attrs: Attrs) {
        let path = canonicalize("/", path);
        let now = self.now;
        match self.nodes.get_mut(&path) {
            Some(node) if node.dir => {
                return reply.reply_error(SSH_FX_FAILURE, "is a directory");
            }
            Some(_) if flags & SSH_FXF_CREAT != 0 && flags & SSH_FXF_EXCL != 0 => {
                return reply.reply_error(SSH_FX_FAILURE, "file exists");
            }
            Some(node) => {
                if flags & SSH_FXF_TRUNC != 0 {
                    node.data.clear();
                    node.times.1 = now;
                }
            }
            None => {
                if flags & SSH_FXF_CREAT == 0 || !self.parent_is_dir(&path) {
                    return reply.reply_error(SSH_FX_NO_SUCH_FILE, "no such file or directory");
                }
                let node = Self::node(false, attrs.permissions_or(0o644) & PERM_MASK, now);
                self.nodes.insert(path.clone(), node);
            }
        }
        debug!("open {} flags {:#x}", path, flags);
        let handle = self.alloc_handle(OpenNode::File { path, flags });
        reply.reply_handle(&handle);
    }

    fn opendir(&mut self, reply: &mut dyn ReplyBuilder, path: &str) {
        let path = canonicalize("/", path);
        match self.nodes.get(&path) {
            None => reply.reply_error(SSH_FX_NO_SUCH_FILE, "no such file or directory"),
            Some(node) if !node.dir => reply.reply_error(SSH_FX_FAILURE, "not a directory"),
            Some(_) => {
                let handle = self.alloc_handle(OpenNode::Dir { path, cursor: 0 });
                reply.reply_handle(&handle);
            }
        }
    }

    fn close(&mut self, reply: &mut dyn ReplyBuilder, handle: &[u8]) {
        match Self::handle_id(handle).and_then(|id| self.handles.remove(&id)) {
            Some(_) => reply.reply_ok(),
            None => reply.reply_error(SSH_FX_FAILURE, "invalid handle"),
        }
    }

    fn mkdir(&mut self, reply: &mut dyn ReplyBuilder, path: &str, attrs: Attrs) {
        let path = canonicalize("/", path);
        if self.nodes.contains_key(&path) {
            return reply.reply_error(SSH_FX_FAILURE, "file exists");
        }
        if !self.parent_is_dir(&path) {
            return reply.reply_error(SSH_FX_NO_SUCH_FILE, "no such file or directory");
        }
        let node = Self::node(true, attrs.permissions_or(0o755) & PERM_MASK, self.now);
        self.nodes.insert(path, node);
        reply.reply_ok();
    }

    fn rmdir(&mut self, reply: &mut dyn ReplyBuilder, path: &str) {
        let path = canonicalize("/", path);
        if path == "/" {
            return reply.reply_error(SSH_FX_PERMISSION_DENIED, "cannot remove root");
        }
        match self.nodes.get(&path) {
            None => reply.reply_error(SSH_FX_NO_SUCH_FILE, "no such file or directory"),
            Some(node) if !node.dir => reply.reply_error(SSH_FX_FAILURE, "not a directory"),
            Some(_) if !self.children(&path).is_empty() => {
                reply.reply_error(SSH_FX_FAILURE, "directory not empty")
            }
            Some(_) => {
                self.nodes.remove(&path);
                reply.reply_ok();
            }
        }
    }

    fn remove(&mut self, reply: &mut dyn ReplyBuilder, path: &str) {
        let path = canonicalize("/", path);
        match self.nodes.get(&path) {
            None => reply.reply_error(SSH_FX_NO_SUCH_FILE, "no such file or directory"),
            Some(node) if node.dir => reply.reply_error(SSH_FX_FAILURE, "is a directory"),
            Some(_) => {
                self.nodes.remove(&path);
                reply.reply_ok();
            }
        }
    }

    fn rename(&mut self, reply: &mut dyn ReplyBuilder, src: &str, dst: &str) {
        let src = canonicalize("/", src);
        let dst = canonicalize("/", dst);
        if !self.nodes.contains_key(&src) {
            return reply.reply_error(SSH_FX_NO_SUCH_FILE, "no such file or directory");
        }
        if self.nodes.contains_key(&dst) {
            return reply.reply_error(SSH_FX_FAILURE, "file exists");
        }
        if !self.parent_is_dir(&dst) {
            return reply.reply_error(SSH_FX_NO_SUCH_FILE, "no such file or directory");
        }
        let subtree = format!("{}/", src);
        if src == "/" || dst.starts_with(&subtree) {
            return reply.reply_error(SSH_FX_FAILURE, "invalid rename");
        }

        let moved: Vec<String> = self
            .nodes
            .keys()
            .filter(|key| **key == src || key.starts_with(&subtree))
            .cloned()
            .collect();
        for old in moved {
            if let Some(node) = self.nodes.remove(&old) {
                let new = format!("{}{}", dst, &old[src.len()..]);
                trace!("rename {} -> {}", old, new);
                self.nodes.insert(new, node);
            }
        }
        for open in self.handles.values_mut() {
            let path = open.path_mut();
            if *path == src || path.starts_with(&subtree) {
                *path = format!("{}{}", dst, &path[src.len()..]);
            }
        }
        reply.reply_ok();
    }

    fn stat(&mut self, reply: &mut dyn ReplyBuilder, path: &str, _follow_symlinks: bool) {
        match self.nodes.get(&canonicalize("/", path)) {
            Some(node) => reply.reply_attrs(&node.attrs()),
            None => reply.reply_error(SSH_FX_NO_SUCH_FILE, "no such file or directory"),
        }
    }

    fn fstat(&mut self, reply: &mut dyn ReplyBuilder, handle: &[u8]) {
        match self.handle_path(handle).and_then(|path| self.nodes.get(path)) {
            Some(node) => reply.reply_attrs(&node.attrs()),
            None => reply.reply_error(SSH_FX_FAILURE, "invalid handle"),
        }
    }

    fn setstat(&mut self, reply: &mut dyn ReplyBuilder, path: &str, attrs: Attrs) {
        let path = canonicalize("/", path);
        self.setstat_path(reply, &path, &attrs);
    }

    fn fsetstat(&mut self, reply: &mut dyn ReplyBuilder, handle: &[u8], attrs: Attrs) {
        match self.handle_path(handle).map(String::from) {
            Some(path) => self.setstat_path(reply, &path, &attrs),
            None => reply.reply_error(SSH_FX_FAILURE, "invalid handle"),
        }
    }

    fn read(&mut self, reply: &mut dyn ReplyBuilder, handle: &[u8], offset: u64, length: u32) {
        let (path, flags) = match self.open_node(handle) {
            Some(OpenNode::File { path, flags }) => (path.clone(), *flags),
            _ => return reply.reply_error(SSH_FX_FAILURE, "invalid handle"),
        };
        if flags & SSH_FXF_READ == 0 {
            return reply.reply_error(SSH_FX_PERMISSION_DENIED, "not opened for reading");
        }
        let Some(node) = self.nodes.get(&path) else {
            return reply.reply_error(SSH_FX_NO_SUCH_FILE, "file has been removed");
        };
        let len = node.data.len() as u64;
        if offset >= len {
            return reply.reply_error(SSH_FX_EOF, "end of file");
        }
        let start = offset as usize;
        let length = length.min(MAX_READ_LEN) as usize;
        let end = start + length.min(node.data.len() - start);
        trace!("read {} [{}, {})", path, start, end);
        reply.reply_data(&node.data[start..end]);
    }

    fn write(&mut self, reply: &mut dyn ReplyBuilder, handle: &[u8], offset: u64, data: &[u8]) {
        let (path, flags) = match self.open_node(handle) {
            Some(OpenNode::File { path, flags }) => (path.clone(), *flags),
            _ => return reply.reply_error(SSH_FX_FAILURE, "invalid handle"),
        };
        if flags & SSH_FXF_WRITE == 0 {
            return reply.reply_error(SSH_FX_PERMISSION_DENIED, "not opened for writing");
        }
        let (now, max_len) = (self.now, self.max_file_len);
        let Some(node) = self.nodes.get_mut(&path) else {
            return reply.reply_error(SSH_FX_NO_SUCH_FILE, "file has been removed");
        };
        let start = if flags & SSH_FXF_APPEND != 0 {
            node.data.len() as u64
        } else {
            offset
        };
        let end = match start.checked_add(data.len() as u64) {
            Some(end) if end <= max_len => end,
            _ => return reply.reply_error(SSH_FX_FAILURE, "write past maximum file size"),
        };
        let (Ok(start), Ok(end)) = (usize::try_from(start), usize::try_from(end)) else {
            return reply.reply_error(SSH_FX_FAILURE, "offset too large");
        };
        if node.data.len() < end {
            node.data.resize(end, 0);
        }
        node.data[start..end].copy_from_slice(data);
        node.times.1 = now;
        trace!("write {} [{}, {})", path, start, end);
        reply.reply_ok();
    }

    fn readdir(
        &mut self,
        reply: &mut dyn ReplyBuilder,
        handle: &[u8],
        max_entries: usize,
        omit_longname: bool,
    ) {
        let (path, cursor) = match self.open_node(handle) {
            Some(OpenNode::Dir { path, cursor }) => (path.clone(), *cursor),
            _ => return reply.reply_error(SSH_FX_FAILURE, "invalid handle"),
        };
        let names = self.children(&path);
        if cursor >= names.len() {
            return reply.reply_error(SSH_FX_EOF, "end of directory");
        }
        let batch = &names[cursor..(cursor + max_entries.min(READDIR_BATCH)).min(names.len())];
        reply.reply_name_count(batch.len() as u32);
        for name in batch {
            let full = if path == "/" {
                format!("/{}", name)
            } else {
                format!("{}/{}", path, name)
            };
            let attrs = self.nodes.get(&full).map(Node::attrs).unwrap_or_default();
            let longname = if omit_longname {
                String::new()
            } else {
                long_name(name, &attrs)
            };
            reply.reply_full_name(name, &longname, &attrs);
        }
        if let Some(OpenNode::Dir { cursor, .. }) = self.open_node(handle) {
            *cursor += batch.len();
        }
    }
}

/// `ls -l` style rendering of one directory entry.
pub fn long_name(name: &str, attrs: &Attrs) -> String {
    let perms = attrs.permissions_or(0);
    let mut mode = String::with_capacity(10);
    mode.push(if perms & S_IFDIR != 0 { 'd' } else { '-' });
    for shift in [6u32, 3, 0] {
        let bits = (perms >> shift) & 7;
        mode.push(if bits & 4 != 0 { 'r' } else { '-' });
        mode.push(if bits & 2 != 0 { 'w' } else { '-' });
        mode.push(if bits & 1 != 0 { 'x' } else { '-' });
    }
    let (uid, gid) = attrs.owner.unwrap_or((0, 0));
    let mtime = attrs.times.map_or(0, |(_, mtime)| mtime);
    let (year, month, day) = civil_date(mtime);
    format!(
        "{} 1 {:<8} {:<8} {:>8} {} {:>2} {:>5} {}",
        mode,
        uid,
        gid,
        attrs.size_or(0),
        MONTHS[month as usize - 1],
        day,
        year,
        name
    )
}

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Unix seconds to a proleptic Gregorian `(year, month, day)`.
fn civil_date(secs: u32) -> (i64, u32, u32) {
    let z = secs as i64 / 86_400 + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}
