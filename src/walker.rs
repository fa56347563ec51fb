//! Find the embedded debug-data table in a running target, decode it, and
//! walk its `Variable`s through live memory reads (and writes) over a
//! `transport::Client`.
//!
//! Table layout (16-byte header, all integers little-endian):
//! `magic: [u8; 8]`, `max_size: u32`, `data_size: u32`, followed by
//! `data_size` bytes of DEFLATE-compressed encoded graph, zero-padded to
//! `max_size`.

use std::{error, fmt};

use crate::codec;
use crate::transport::{self, Client};
use crate::value::{Graph, NodeId, ValueTag};

pub const DEFAULT_MAGIC: [u8; 8] = [0xA1, 0x07, 0x23, 0x45, 0xF0, 0x5C, 0xAE, 0x4C];
const HEADER_LEN: u64 = 16;
pub const DEFAULT_SYMBOL: &str = "DEBUG_DATA";

#[derive(Debug)]
pub enum Error {
    Transport(transport::Error),
    Codec(codec::Error),
    Decompress(std::io::Error),
    BadMagic,
    DataSizeExceedsMaxSize { data_size: u32, max_size: u32 },
    UnresolvedSymbol(String),
    UnknownVariable(String),
    NullDereference,
    NotDereferenceable,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "{e}"),
            Self::Codec(e) => write!(f, "{e}"),
            Self::Decompress(e) => write!(f, "could not inflate embedded table: {e}"),
            Self::BadMagic => write!(f, "embedded table magic did not match"),
            Self::DataSizeExceedsMaxSize { data_size, max_size } => write!(
                f,
                "embedded table data_size {data_size} exceeds max_size {max_size}"
            ),
            Self::UnresolvedSymbol(sym) => write!(f, "symbol `{sym}` not found in debug data"),
            Self::UnknownVariable(name) => write!(f, "no such variable `{name}`"),
            Self::NullDereference => write!(f, "attempted to dereference a null pointer"),
            Self::NotDereferenceable => write!(f, "value has no address to read"),
        }
    }
}

impl error::Error for Error {}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

impl From<codec::Error> for Error {
    fn from(e: codec::Error) -> Self {
        Self::Codec(e)
    }
}

/// A live cursor into target memory: the `Value` describing the shape,
/// plus the address in the target's address space that value currently
/// occupies.
#[derive(Clone, Copy)]
pub struct Cursor {
    pub node: NodeId,
    pub address: u64,
}

pub enum Rendered {
    Scalar(u64),
    Symbol { name: String, value: u64 },
    Null,
    Aggregate,
}

impl fmt::Display for Rendered {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(v) => write!(f, "{v}"),
            Self::Symbol { name, value } => write!(f, "{name} ({value})"),
            Self::Null => write!(f, "NULL"),
            Self::Aggregate => write!(f, "{{...}}"),
        }
    }
}

pub struct Walker {
    client: Client,
    graph: Graph,
    base: u64,
}

impl Walker {
    /// Locate the table in the target, decode it, and compute the load
    /// base from `symbol`'s value in the decoded graph.
    pub fn attach(mut client: Client, symbol: &str) -> Result<Self, Error> {
        let table_addr = client.info()?;
        let header = client.read(table_addr, HEADER_LEN)?;
        if header[0..8] != DEFAULT_MAGIC {
            return Err(Error::BadMagic);
        }
        let max_size = u32::from_le_bytes(header[8..12].try_into().unwrap());
        let data_size = u32::from_le_bytes(header[12..16].try_into().unwrap());
        if data_size > max_size {
            return Err(Error::DataSizeExceedsMaxSize { data_size, max_size });
        }

        let compressed = client.read(table_addr + HEADER_LEN, u64::from(data_size))?;
        let mut decoder = flate2::read::DeflateDecoder::new(&compressed[..]);
        let mut raw = Vec::new();
        std::io::Read::read_to_end(&mut decoder, &mut raw).map_err(Error::Decompress)?;
        let graph = codec::decode(&raw)?;

        let root = graph
            .root()
            .ok_or_else(|| Error::UnresolvedSymbol(symbol.to_string()))?;
        let symbol_value = graph
            .find_variable(root, symbol)
            .map(|v| graph.value(v))
            .ok_or_else(|| Error::UnresolvedSymbol(symbol.to_string()))?;
        let base = table_addr.wrapping_sub(symbol_value);

        Ok(Self { client, graph, base })
    }

    #[must_use]
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Start a cursor at a named top-level variable.
    pub fn variable(&self, name: &str) -> Result<Cursor, Error> {
        let root = self.graph.root().expect("attach always decodes a rooted graph");
        let var = self
            .graph
            .find_variable(root, name)
            .ok_or_else(|| Error::UnknownVariable(name.to_string()))?;
        Ok(Cursor {
            node: var,
            address: self.base + self.graph.value(var),
        })
    }

    /// Every top-level variable's cursor, in declaration order.
    #[must_use]
    pub fn top_level_cursors(&self) -> Vec<Cursor> {
        let Some(root) = self.graph.root() else {
            return Vec::new();
        };
        self.graph
            .variables(root)
            .into_iter()
            .map(|var| Cursor {
                node: var,
                address: self.base + self.graph.value(var),
            })
            .collect()
    }

    /// Peel `Variable`/`Typedef` wrapper layers to the underlying typed
    /// cursor a read/write/expand should actually act on.
    fn settle(&self, cursor: Cursor) -> Cursor {
        let g = &self.graph;
        match g.tag(cursor.node) {
            ValueTag::Variable => {
                let ty = g.type_of(cursor.node).expect("variable always has a type child");
                self.settle(Cursor {
                    node: ty,
                    address: cursor.address,
                })
            }
            ValueTag::Typedef => {
                let ty = g.type_of(cursor.node).expect("typedef always has a type child");
                self.settle(Cursor {
                    node: ty,
                    address: cursor.address,
                })
            }
            _ => cursor,
        }
    }

    /// The byte size of whatever `node` describes, resolved through
    /// typedefs, used to compute array element stride.
    fn stride(&self, node: NodeId) -> u64 {
        let g = &self.graph;
        match g.tag(g.untypedef(node)) {
            ValueTag::Pointer => g.value(g.untypedef(node)),
            ValueTag::BaseType | ValueTag::Enum | ValueTag::Struct => g.value(g.untypedef(node)),
            _ => 0,
        }
    }

    /// Expand one level: a pointer dereferences to its pointee, an array
    /// index to an element cursor, a struct member by name to its field
    /// cursor. Returns `None` for terminal (scalar) values.
    pub fn dereference(&mut self, cursor: Cursor) -> Result<Option<Cursor>, Error> {
        let settled = self.settle(cursor);
        let g = &self.graph;
        match g.tag(settled.node) {
            ValueTag::Pointer => {
                let width = g.value(settled.node).max(1);
                let bytes = self.client.read(settled.address, width)?;
                let raw = le_bytes_to_u64(&bytes);
                if raw == 0 {
                    return Ok(None);
                }
                let pointee = g.type_of(settled.node).expect("pointer always has a type child");
                Ok(Some(Cursor {
                    node: pointee,
                    address: raw,
                }))
            }
            _ => Ok(None),
        }
    }

    /// Element cursor `index` of an array-typed cursor.
    pub fn index(&self, cursor: Cursor, index: u64) -> Cursor {
        let settled = self.settle(cursor);
        let g = &self.graph;
        let elem_ty = g.type_of(settled.node).expect("array always has a type child");
        let stride = self.stride(elem_ty).max(1);
        Cursor {
            node: elem_ty,
            address: settled.address + index * stride,
        }
    }

    /// Field cursor for `member` of a struct-typed cursor.
    pub fn field(&self, cursor: Cursor, member: &str) -> Option<Cursor> {
        let settled = self.settle(cursor);
        let g = &self.graph;
        let member_node = g
            .children(settled.node)
            .iter()
            .find(|&&c| g.name(c) == member)
            .copied()?;
        let offset = g.value(member_node);
        Some(Cursor {
            node: member_node,
            address: settled.address + offset,
        })
    }

    /// Read and render a terminal cursor. Pointers render `"NULL"` or the
    /// pointee address; enums look up a matching `EnumValue` child or fall
    /// back to the raw integer; everything else renders as an unsigned
    /// little-endian integer.
    pub fn render(&mut self, cursor: Cursor) -> Result<Rendered, Error> {
        let settled = self.settle(cursor);
        let g = &self.graph;
        match g.tag(settled.node) {
            ValueTag::Pointer => {
                let width = g.value(settled.node).max(1);
                let bytes = self.client.read(settled.address, width)?;
                let raw = le_bytes_to_u64(&bytes);
                if raw == 0 {
                    Ok(Rendered::Null)
                } else {
                    Ok(Rendered::Scalar(raw))
                }
            }
            ValueTag::Enum => {
                let size = g.value(settled.node).max(1);
                let bytes = self.client.read(settled.address, size)?;
                let raw = le_bytes_to_u64(&bytes);
                let symbol = g
                    .children(settled.node)
                    .iter()
                    .find(|&&c| g.value(c) == raw)
                    .map(|&c| g.name(c).to_string());
                Ok(match symbol {
                    Some(name) => Rendered::Symbol { name, value: raw },
                    None => Rendered::Scalar(raw),
                })
            }
            ValueTag::BaseType => {
                let size = g.value(settled.node).max(1);
                let bytes = self.client.read(settled.address, size)?;
                Ok(Rendered::Scalar(le_bytes_to_u64(&bytes)))
            }
            ValueTag::EnumValue => Ok(Rendered::Scalar(g.value(settled.node))),
            ValueTag::Struct | ValueTag::Array => Ok(Rendered::Aggregate),
            ValueTag::Root | ValueTag::CompileUnit | ValueTag::Variable | ValueTag::Typedef => {
                Err(Error::NotDereferenceable)
            }
        }
    }

    /// Parse `text` (decimal, or `0x`-prefixed hex, or a single-quoted
    /// char literal) as the terminal value's byte width and write it.
    pub fn write(&mut self, cursor: Cursor, text: &str) -> Result<(), Error> {
        let settled = self.settle(cursor);
        let width = match self.graph.tag(settled.node) {
            ValueTag::Pointer => self.graph.value(settled.node).max(1),
            ValueTag::Enum | ValueTag::BaseType => self.graph.value(settled.node).max(1),
            _ => return Err(Error::NotDereferenceable),
        };
        let value = parse_literal(text);
        let mut bytes = value.to_le_bytes().to_vec();
        bytes.truncate(width as usize);
        self.client.write(settled.address, &bytes)?;
        Ok(())
    }

    /// Render every top-level variable, in declaration order, as
    /// `(Value, Rendered)` pairs. Used by the `connect` binary's flat
    /// periodic dump.
    pub fn render_all(&mut self) -> Vec<(NodeId, Result<Rendered, Error>)> {
        self.top_level_cursors()
            .into_iter()
            .map(|cursor| (cursor.node, self.render(cursor)))
            .collect()
    }
}

fn le_bytes_to_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    if bytes.len() > 8 && bytes[8..].iter().any(|&b| b != 0) {
        tracing::warn!(width = bytes.len(), "value wider than 8 bytes, truncating to low 64 bits");
    }
    buf[..n].copy_from_slice(&bytes[..n]);
    u64::from_le_bytes(buf)
}

fn parse_literal(text: &str) -> u64 {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).unwrap_or(0)
    } else if text.len() >= 3 && text.starts_with('\'') && text.ends_with('\'') {
        text.as_bytes().get(1).copied().unwrap_or(0) as u64
    } else {
        text.parse().unwrap_or(0)
    }
}
