//! Reply body parsing and path handling.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use log::warn;

use crate::attrs::Attrs;
use crate::error::{Error, Result, StatusError};
use crate::message::{Packet, dump_hex};
use crate::protocol::SSH_FX_OK;

/// One entry of a NAME reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NameEntry {
    pub filename: String,
    /// `ls -l` style rendering, when the server sent a non-empty one.
    pub longname: Option<String>,
    pub attrs: Attrs,
}

/// Smallest wire size of one NAME entry: two empty strings and a flags word.
const MIN_NAME_ENTRY_LEN: usize = 12;

/// Decode the body of a STATUS reply; OK maps to `Ok(())`.
pub(crate) fn parse_status(pkt: &Packet) -> Result<()> {
    let code = pkt
        .get_u32()
        .map_err(|_| Error::Malformed("malformed FXP_STATUS packet"))?;
    if code == SSH_FX_OK {
        return Ok(());
    }
    // Some v3 servers omit the message and language tag.
    let message = pkt.get_str().map(ToString::to_string).unwrap_or_default();
    Err(StatusError::new(code, message).into())
}

/// Decode the body of a NAME reply.
pub(crate) fn parse_names(pkt: &Packet) -> Result<Vec<NameEntry>> {
    let count = pkt.get_u32()? as usize;
    if count > pkt.remaining() / MIN_NAME_ENTRY_LEN {
        warn!(
            "NAME reply claims {} entries in {} bytes: {}",
            count,
            pkt.remaining(),
            dump_hex(pkt.rest())
        );
        return Err(Error::Malformed("NAME reply has too many entries"));
    }
    let mut names = Vec::with_capacity(count);
    for _ in 0..count {
        let filename = pkt.get_str()?.to_string();
        let longname = pkt.get_str()?;
        let attrs = pkt.get_attrs()?;
        names.push(NameEntry {
            filename,
            longname: (!longname.is_empty()).then(|| longname.to_string()),
            attrs,
        });
    }
    Ok(names)
}

/// Split a path into parent directory and leaf name.
pub(crate) fn split_parent_name(path: &str) -> Result<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(Error::Protocol(String::from("invalid path")));
    }
    let mut parts = trimmed.rsplitn(2, '/');
    let name = parts.next().unwrap_or("");
    let parent = parts.next().unwrap_or("");
    let parent = if parent.is_empty() { "/" } else { parent };
    if name.is_empty() {
        Err(Error::Protocol(String::from("invalid path")))
    } else {
        Ok((parent, name))
    }
}

/// Split a path into normalized components.
pub(crate) fn path_parts(path: &str) -> Vec<&str> {
    path.split('/').filter(|part| !part.is_empty() && *part != ".").collect()
}

/// Resolve `.` and `..` lexically, anchoring relative paths at `cwd`.
pub(crate) fn canonicalize(cwd: &str, path: &str) -> String {
    let mut stack: Vec<&str> = Vec::new();
    if !path.starts_with('/') {
        stack.extend(path_parts(cwd));
    }
    for part in path_parts(path) {
        if part == ".." {
            stack.pop();
        } else {
            stack.push(part);
        }
    }
    let mut out = String::new();
    for part in &stack {
        out.push('/');
        out.push_str(part);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}
