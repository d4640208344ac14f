//! Pax header encoding and decoding.
//!
//! Encoding wraps the `tar` crate's ustar header construction and adds
//! hand-built pax extended records (`len key=value\n`) for anything the
//! fixed fields cannot carry: long member names, long link targets, large
//! sizes, wide uid/gid, and extended attributes.
//!
//! The single entry point [`encode_header`] is a pure function of the
//! entry's metadata. The layout planner calls it to size headers and keeps
//! the returned bytes for the writer, so the size used for offset
//! arithmetic can never diverge from the bytes that hit the disk.

use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::{ArchiveError, Result};
use crate::flist::{Entry, EntryKind};

pub const BLOCK_SIZE: u64 = 512;

/// Ceiling on one entry's encoded header. Preserve mode can produce very
/// large xattr records; anything beyond this is an encoding error.
pub const MAX_HEADER_SIZE: usize = 128 * 1024 * 1024;

/// Largest value a 12-character octal field holds (size, mtime).
const MAX_OCTAL_12: u64 = 0o77777777777;
/// Largest value an 8-character octal field holds (uid, gid).
const MAX_OCTAL_8: u64 = 0o7777777;

/// Data region length rounded up to the tar block size.
pub fn pad512(size: u64) -> u64 {
    (size + (BLOCK_SIZE - 1)) & !(BLOCK_SIZE - 1)
}

fn path_bytes(path: &Path) -> Vec<u8> {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        path.as_os_str().as_bytes().to_vec()
    }
    #[cfg(not(unix))]
    {
        path.to_string_lossy().into_owned().into_bytes()
    }
}

/// Accumulates pax extended records. Record format is
/// `"<len> <key>=<value>\n"` where `<len>` counts the whole record
/// including itself.
#[derive(Default)]
struct PaxRecords {
    data: Vec<u8>,
}

impl PaxRecords {
    fn add(&mut self, key: &str, value: &[u8]) {
        let payload = key.len() + value.len() + 3; // space, '=', newline
        let digits = dec_digits(payload);
        let mut total = payload + digits;
        // The length field may itself need one more digit.
        if dec_digits(total) > digits {
            total += 1;
        }
        self.data.extend_from_slice(total.to_string().as_bytes());
        self.data.push(b' ');
        self.data.extend_from_slice(key.as_bytes());
        self.data.push(b'=');
        self.data.extend_from_slice(value);
        self.data.push(b'\n');
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

fn dec_digits(mut n: usize) -> usize {
    let mut d = 1;
    while n >= 10 {
        n /= 10;
        d += 1;
    }
    d
}

fn truncate_name(name: &str) -> &str {
    let mut cut = name.len().min(100);
    while !name.is_char_boundary(cut) {
        cut -= 1;
    }
    &name[..cut]
}

/// Encode the full header for one entry: optional pax extended block(s)
/// followed by the ustar block. The result is always a multiple of 512
/// bytes.
pub fn encode_header(entry: &Entry) -> Result<Vec<u8>> {
    let encode_err = |reason: String| ArchiveError::Encode {
        name: entry.name.clone(),
        reason,
    };

    let member = match entry.kind {
        EntryKind::Dir => format!("{}/", entry.name),
        _ => entry.name.clone(),
    };

    let mut pax = PaxRecords::default();
    let mut hdr = tar::Header::new_ustar();
    hdr.set_entry_type(match entry.kind {
        EntryKind::File => tar::EntryType::Regular,
        EntryKind::Dir => tar::EntryType::Directory,
        EntryKind::Symlink => tar::EntryType::Symlink,
        EntryKind::Other => return Err(encode_err("unsupported entry kind".into())),
    });

    if hdr.set_path(&member).is_err() {
        pax.add("path", member.as_bytes());
        hdr.set_path(truncate_name(&member))
            .map_err(|e| encode_err(format!("member name not encodable: {e}")))?;
    }

    if entry.kind == EntryKind::Symlink {
        let target = entry
            .link_target
            .clone()
            .ok_or_else(|| encode_err("symlink without target".into()))?;
        if hdr.set_link_name(&target).is_err() {
            pax.add("linkpath", &path_bytes(&target));
        }
    }

    let size = if entry.kind == EntryKind::File {
        entry.size
    } else {
        0
    };
    if size <= MAX_OCTAL_12 {
        hdr.set_size(size);
    } else {
        hdr.set_size(0);
        pax.add("size", size.to_string().as_bytes());
    }

    hdr.set_mode(entry.mode & 0o7777);
    if entry.uid <= MAX_OCTAL_8 {
        hdr.set_uid(entry.uid);
    } else {
        hdr.set_uid(0);
        pax.add("uid", entry.uid.to_string().as_bytes());
    }
    if entry.gid <= MAX_OCTAL_8 {
        hdr.set_gid(entry.gid);
    } else {
        hdr.set_gid(0);
        pax.add("gid", entry.gid.to_string().as_bytes());
    }
    if entry.mtime <= MAX_OCTAL_12 {
        hdr.set_mtime(entry.mtime);
    } else {
        hdr.set_mtime(0);
        pax.add("mtime", entry.mtime.to_string().as_bytes());
    }
    if hdr.set_username(&entry.uname).is_err() {
        pax.add("uname", entry.uname.as_bytes());
    }
    if hdr.set_groupname(&entry.gname).is_err() {
        pax.add("gname", entry.gname.as_bytes());
    }
    for (key, value) in &entry.xattrs {
        pax.add(&format!("SCHILY.xattr.{key}"), value);
    }
    hdr.set_cksum();

    let mut out = Vec::with_capacity(BLOCK_SIZE as usize * 2);
    if !pax.is_empty() {
        let data = pax.data;
        if data.len() > MAX_HEADER_SIZE {
            return Err(encode_err(format!(
                "pax records of {} bytes exceed the header ceiling",
                data.len()
            )));
        }
        let mut ext = tar::Header::new_ustar();
        ext.set_entry_type(tar::EntryType::XHeader);
        ext.set_path("@PaxHeader")
            .map_err(|e| encode_err(format!("pax header name: {e}")))?;
        ext.set_mode(0o644);
        ext.set_uid(0);
        ext.set_gid(0);
        ext.set_mtime(entry.mtime.min(MAX_OCTAL_12));
        ext.set_size(data.len() as u64);
        ext.set_cksum();
        out.extend_from_slice(ext.as_bytes());
        out.extend_from_slice(&data);
        let tail = pad512(data.len() as u64) as usize - data.len();
        out.extend(std::iter::repeat(0u8).take(tail));
    }
    out.extend_from_slice(hdr.as_bytes());

    if out.len() > MAX_HEADER_SIZE {
        return Err(encode_err(format!(
            "encoded header of {} bytes exceeds the header ceiling",
            out.len()
        )));
    }
    Ok(out)
}

/// Metadata recovered from one logical archive entry.
#[derive(Debug, Clone)]
pub struct ParsedEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub mtime: u64,
    pub uname: String,
    pub gname: String,
    pub link_target: Option<PathBuf>,
    pub xattrs: Vec<(String, Vec<u8>)>,
    /// Bytes consumed by all header blocks (pax and ustar) of this entry.
    pub header_size: u64,
}

impl ParsedEntry {
    pub fn padded_size(&self) -> u64 {
        pad512(self.size)
    }
}

#[derive(Default)]
struct Overrides {
    path: Option<String>,
    linkpath: Option<PathBuf>,
    size: Option<u64>,
    uid: Option<u64>,
    gid: Option<u64>,
    mtime: Option<u64>,
    uname: Option<String>,
    gname: Option<String>,
    xattrs: Vec<(String, Vec<u8>)>,
    seen: bool,
}

/// Parse one logical entry (pax blocks folded in) starting at the
/// reader's current position. Returns `None` at the end-of-archive marker
/// or a clean EOF on an entry boundary. The entry's data region is *not*
/// consumed; the caller skips or copies `padded_size()` bytes.
pub fn parse_entry<R: Read>(reader: &mut R) -> Result<Option<ParsedEntry>> {
    let mut consumed: u64 = 0;
    let mut ov = Overrides::default();

    loop {
        let mut block = [0u8; BLOCK_SIZE as usize];
        if !read_block(reader, &mut block, consumed == 0 && !ov.seen)? {
            return Ok(None);
        }
        consumed += BLOCK_SIZE;

        if block.iter().all(|&b| b == 0) {
            if ov.seen {
                return Err(ArchiveError::Format(
                    "extended header not followed by an entry".into(),
                ));
            }
            // End-of-archive: the second zero block may be absent in
            // truncated-but-finished archives.
            let mut rest = [0u8; BLOCK_SIZE as usize];
            let _ = read_block(reader, &mut rest, true)?;
            return Ok(None);
        }

        verify_checksum(&block)?;
        let typeflag = block[156];
        match typeflag {
            b'x' | b'g' | b'L' | b'K' => {
                let size = parse_octal(&block[124..136])?;
                if size as usize > MAX_HEADER_SIZE {
                    return Err(ArchiveError::Format(format!(
                        "extended header of {size} bytes exceeds the header ceiling"
                    )));
                }
                let padded = pad512(size);
                let mut data = vec![0u8; padded as usize];
                reader
                    .read_exact(&mut data)
                    .map_err(|e| ArchiveError::Format(format!("truncated extended header: {e}")))?;
                consumed += padded;
                data.truncate(size as usize);
                match typeflag {
                    b'x' => apply_pax_records(&mut ov, &data)?,
                    b'L' => {
                        ov.path = Some(String::from_utf8_lossy(trim_nul(&data)).into_owned())
                    }
                    b'K' => {
                        ov.linkpath = Some(PathBuf::from(
                            String::from_utf8_lossy(trim_nul(&data)).into_owned(),
                        ))
                    }
                    _ => {} // global extended header: ignored
                }
                ov.seen = true;
            }
            _ => return Ok(Some(build_entry(&block, ov, consumed)?)),
        }
    }
}

/// Read one block. `Ok(false)` means a clean EOF before any byte, which is
/// only legal when `eof_ok` (an entry boundary).
fn read_block<R: Read>(reader: &mut R, block: &mut [u8], eof_ok: bool) -> Result<bool> {
    let mut filled = 0usize;
    while filled < block.len() {
        let n = reader
            .read(&mut block[filled..])
            .map_err(|e| ArchiveError::Format(format!("archive read failed: {e}")))?;
        if n == 0 {
            if filled == 0 && eof_ok {
                return Ok(false);
            }
            return Err(ArchiveError::Format("archive ends mid-header".into()));
        }
        filled += n;
    }
    Ok(true)
}

fn verify_checksum(block: &[u8]) -> Result<()> {
    let stored = parse_octal(&block[148..156])?;
    let mut sum: u64 = 0;
    for (i, b) in block.iter().enumerate() {
        sum += if (148..156).contains(&i) {
            b' ' as u64
        } else {
            *b as u64
        };
    }
    if sum != stored {
        return Err(ArchiveError::Format(format!(
            "header checksum mismatch (stored {stored}, computed {sum})"
        )));
    }
    Ok(())
}

/// Octal numeric field, tolerating NUL/space termination and the GNU
/// base-256 extension for oversized values.
fn parse_octal(field: &[u8]) -> Result<u64> {
    if field.first().is_some_and(|&b| b & 0x80 != 0) {
        let mut val: u64 = (field[0] & 0x7f) as u64;
        for &b in &field[1..] {
            val = val
                .checked_mul(256)
                .and_then(|v| v.checked_add(b as u64))
                .ok_or_else(|| ArchiveError::Format("base-256 field overflow".into()))?;
        }
        return Ok(val);
    }
    let mut val: u64 = 0;
    let mut seen = false;
    for &b in field {
        match b {
            b'0'..=b'7' => {
                val = val
                    .checked_mul(8)
                    .and_then(|v| v.checked_add((b - b'0') as u64))
                    .ok_or_else(|| ArchiveError::Format("octal field overflow".into()))?;
                seen = true;
            }
            b' ' if !seen => {}
            b' ' | 0 => break,
            _ => return Err(ArchiveError::Format("bad octal digit in header".into())),
        }
    }
    Ok(val)
}

fn trim_nul(bytes: &[u8]) -> &[u8] {
    match bytes.iter().position(|&b| b == 0) {
        Some(p) => &bytes[..p],
        None => bytes,
    }
}

fn field_string(field: &[u8]) -> String {
    String::from_utf8_lossy(trim_nul(field)).into_owned()
}

fn apply_pax_records(ov: &mut Overrides, mut data: &[u8]) -> Result<()> {
    while !data.is_empty() {
        let space = data
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| ArchiveError::Format("pax record missing length".into()))?;
        let len: usize = std::str::from_utf8(&data[..space])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ArchiveError::Format("pax record length not numeric".into()))?;
        if len <= space + 1 || len > data.len() {
            return Err(ArchiveError::Format("pax record length out of range".into()));
        }
        let record = &data[space + 1..len];
        data = &data[len..];
        let record = record
            .strip_suffix(b"\n")
            .ok_or_else(|| ArchiveError::Format("pax record missing newline".into()))?;
        let eq = record
            .iter()
            .position(|&b| b == b'=')
            .ok_or_else(|| ArchiveError::Format("pax record missing '='".into()))?;
        let key = String::from_utf8_lossy(&record[..eq]).into_owned();
        let value = &record[eq + 1..];

        let text = || String::from_utf8_lossy(value).into_owned();
        let number = |what: &str| -> Result<u64> {
            let s = String::from_utf8_lossy(value);
            // mtime may carry a fractional part; keep whole seconds.
            let whole = s.split('.').next().unwrap_or("");
            whole
                .parse()
                .map_err(|_| ArchiveError::Format(format!("pax {what} not numeric")))
        };

        match key.as_str() {
            "path" => ov.path = Some(text()),
            "linkpath" => ov.linkpath = Some(PathBuf::from(text())),
            "size" => ov.size = Some(number("size")?),
            "uid" => ov.uid = Some(number("uid")?),
            "gid" => ov.gid = Some(number("gid")?),
            "mtime" => ov.mtime = Some(number("mtime")?),
            "uname" => ov.uname = Some(text()),
            "gname" => ov.gname = Some(text()),
            _ => {
                if let Some(attr) = key.strip_prefix("SCHILY.xattr.") {
                    ov.xattrs.push((attr.to_string(), value.to_vec()));
                }
            }
        }
    }
    Ok(())
}

fn build_entry(block: &[u8], ov: Overrides, consumed: u64) -> Result<ParsedEntry> {
    let mut name = match ov.path {
        Some(p) => p,
        None => {
            let prefix = field_string(&block[345..500]);
            let short = field_string(&block[..100]);
            if prefix.is_empty() {
                short
            } else {
                format!("{prefix}/{short}")
            }
        }
    };

    let typeflag = block[156];
    let kind = if name.ends_with('/') {
        EntryKind::Dir
    } else {
        match typeflag {
            0 | b'0' | b'7' => EntryKind::File,
            b'5' => EntryKind::Dir,
            b'2' => EntryKind::Symlink,
            _ => EntryKind::Other,
        }
    };
    while name.ends_with('/') {
        name.pop();
    }

    // Directories and symlinks never carry data; anything else (including
    // unknown kinds that will be skipped) keeps its stated size so the
    // stream stays in step.
    let size = match kind {
        EntryKind::Dir | EntryKind::Symlink => 0,
        _ => ov.size.unwrap_or(parse_octal(&block[124..136])?),
    };
    let link_target = if kind == EntryKind::Symlink {
        Some(match ov.linkpath {
            Some(p) => p,
            None => PathBuf::from(field_string(&block[157..257])),
        })
    } else {
        None
    };

    Ok(ParsedEntry {
        name,
        kind,
        size,
        mode: parse_octal(&block[100..108])? as u32,
        uid: ov.uid.unwrap_or(parse_octal(&block[108..116])?),
        gid: ov.gid.unwrap_or(parse_octal(&block[116..124])?),
        mtime: ov.mtime.unwrap_or(parse_octal(&block[136..148])?),
        uname: ov.uname.unwrap_or_else(|| field_string(&block[265..297])),
        gname: ov.gname.unwrap_or_else(|| field_string(&block[297..329])),
        link_target,
        xattrs: ov.xattrs,
        header_size: consumed,
    })
}
