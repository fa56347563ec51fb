//! Embed an encoded, compressed debug-data table into a reserved region of
//! a target binary: find `magic`, check the reservation is big enough,
//! and overwrite `max_size`/`data_size`/payload, zero-filling the rest.

use std::{error, fmt, fs, path::Path};

use crate::walker::DEFAULT_MAGIC;

const HEADER_LEN: usize = 16;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    MagicNotFound { magic: [u8; 8] },
    PayloadTooLarge { payload_len: usize, max_size: u32 },
    RegionTooSmall { max_size: u32, file_len: usize },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "could not read or write target file: {e}"),
            Self::MagicNotFound { magic } => write!(
                f,
                "magic header not found in target file; reserve space for it first:\n{}",
                reservation_help(magic)
            ),
            Self::PayloadTooLarge { payload_len, max_size } => write!(
                f,
                "encoded payload ({payload_len} bytes + 16-byte header) does not fit \
                 in the {max_size}-byte reservation; enlarge it"
            ),
            Self::RegionTooSmall { max_size, file_len } => write!(
                f,
                "reserved region claims {max_size} bytes but the target file is only \
                 {file_len} bytes from the magic header; reserved region too small"
            ),
        }
    }
}

impl error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Reservation-snippet guidance shown alongside a missing-magic error, in
/// both C and Rust, since the target firmware isn't assumed to be written in
/// either specifically. Shows the actual magic bytes being searched for,
/// which may differ from `DEFAULT_MAGIC` when `-m` was passed on the CLI.
fn reservation_help(magic: &[u8; 8]) -> String {
    let c_bytes = magic.iter().map(|b| format!("0x{b:02X}")).collect::<Vec<_>>().join(", ");
    let rust_bytes = magic
        .iter()
        .enumerate()
        .map(|(i, b)| format!("table[{i}] = 0x{b:02X};"))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        r#"
C:
    #define DEBUG_DATA_MAX_SIZE 4096
    __attribute__((section(".debug_data")))
    unsigned char debug_data_table[DEBUG_DATA_MAX_SIZE] = {{
        {c_bytes}, // magic
    }};

Rust:
    #[link_section = ".debug_data"]
    #[no_mangle]
    static DEBUG_DATA_TABLE: [u8; 4096] = {{
        let mut table = [0u8; 4096];
        {rust_bytes}
        table
    }};
"#
    )
}

/// Find the first occurrence of `magic` in `haystack`.
fn find_magic(haystack: &[u8], magic: &[u8; 8]) -> Option<usize> {
    haystack.windows(magic.len()).position(|w| w == magic)
}

/// Patch `payload` (already encoded and DEFLATE-compressed) into `target`
/// at the first occurrence of `magic`, in place.
pub fn patch_file(target: &Path, payload: &[u8], magic: &[u8; 8]) -> Result<(), Error> {
    let mut bytes = fs::read(target)?;
    let addr = find_magic(&bytes, magic).ok_or(Error::MagicNotFound { magic: *magic })?;

    if addr + HEADER_LEN > bytes.len() {
        return Err(Error::MagicNotFound { magic: *magic });
    }
    let max_size = u32::from_le_bytes(bytes[addr + 8..addr + 12].try_into().unwrap());
    if payload.len() + HEADER_LEN > max_size as usize {
        return Err(Error::PayloadTooLarge {
            payload_len: payload.len(),
            max_size,
        });
    }
    // `max_size` is the size of the whole reserved region, header included
    // (spec §6; original_source/patch.py::write_db clears `size - 16 -
    // len(data)` bytes starting at `addr+16`, i.e. the region spans
    // `addr .. addr+size`). A bogus `max_size` from a false magic match
    // must not read/write past the actual file.
    let region_end = addr + max_size as usize;
    if region_end > bytes.len() {
        return Err(Error::RegionTooSmall {
            max_size,
            file_len: bytes.len() - addr,
        });
    }

    bytes[addr + 12..addr + 16].copy_from_slice(&(payload.len() as u32).to_le_bytes());

    let data_start = addr + HEADER_LEN;
    for byte in &mut bytes[data_start..region_end] {
        *byte = 0;
    }
    bytes[data_start..data_start + payload.len()].copy_from_slice(payload);

    fs::write(target, bytes)?;
    Ok(())
}

/// Patch every file in `targets` with the same payload.
pub fn patch_files(targets: &[std::path::PathBuf], payload: &[u8], magic: &[u8; 8]) -> Result<(), Error> {
    for target in targets {
        patch_file(target, payload, magic)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    /// `max_size` is the total reserved region, header included, so the
    /// fixture allocates `max_size` bytes starting at the magic, not
    /// `max_size` bytes after the 16-byte header.
    fn reserved_file(max_size: u32) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[0xde, 0xad]).unwrap(); // leading noise
        f.write_all(&DEFAULT_MAGIC).unwrap();
        f.write_all(&max_size.to_le_bytes()).unwrap();
        f.write_all(&0u32.to_le_bytes()).unwrap(); // data_size
        f.write_all(&vec![0u8; max_size as usize - HEADER_LEN]).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn patches_payload_after_the_magic() {
        let f = reserved_file(64);
        let payload = vec![1, 2, 3, 4, 5];
        patch_file(f.path(), &payload, &DEFAULT_MAGIC).unwrap();

        let written = fs::read(f.path()).unwrap();
        let addr = find_magic(&written, &DEFAULT_MAGIC).unwrap();
        let data_size = u32::from_le_bytes(written[addr + 12..addr + 16].try_into().unwrap());
        assert_eq!(data_size, 5);
        assert_eq!(&written[addr + 16..addr + 21], &payload[..]);
        assert!(written[addr + 21..addr + 64].iter().all(|&b| b == 0));
        assert_eq!(written.len(), addr + 64);
    }

    #[test]
    fn missing_magic_is_an_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[0u8; 32]).unwrap();
        f.flush().unwrap();
        assert!(matches!(
            patch_file(f.path(), &[1, 2, 3], &DEFAULT_MAGIC),
            Err(Error::MagicNotFound { .. })
        ));
    }

    #[test]
    fn oversized_payload_is_an_error() {
        let f = reserved_file(16);
        let payload = vec![0u8; 32];
        assert!(matches!(
            patch_file(f.path(), &payload, &DEFAULT_MAGIC),
            Err(Error::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn max_size_past_end_of_file_is_an_error() {
        // A false magic match (or a truncated file) can yield a `max_size`
        // claiming more bytes than the file actually has.
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&DEFAULT_MAGIC).unwrap();
        f.write_all(&4096u32.to_le_bytes()).unwrap();
        f.write_all(&0u32.to_le_bytes()).unwrap();
        f.flush().unwrap();

        assert!(matches!(
            patch_file(f.path(), &[1, 2, 3], &DEFAULT_MAGIC),
            Err(Error::RegionTooSmall { .. })
        ));
    }
}
