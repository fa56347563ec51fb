//! Deterministic binary serialization of a `Graph`.
//!
//! Every reachable `Value` gets a dense id in pre-order, first-visit order
//! from the root (the root is always id 0). Fields are then emitted
//! columnwise -- one column per attribute, across all values -- so that
//! like-typed bytes cluster and compress tightly under DEFLATE. All
//! integers are LEB128 variable-length unsigned.

use std::{error, fmt};

use crate::value::{Graph, NodeId, ValueTag};

#[derive(Debug, Clone)]
pub enum Error {
    /// The buffer ended before a value expected to be there.
    Truncated,
    /// A tag byte on decode did not match any `ValueTag` (corrupt database
    /// or version skew).
    UnknownTag(u8),
    /// A child or type id referenced an index outside `0..count`.
    BadReference(u32),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated buffer"),
            Self::UnknownTag(tag) => write!(f, "unknown value tag `{tag}` on decode"),
            Self::BadReference(id) => write!(f, "reference to nonexistent value `{id}`"),
        }
    }
}

impl error::Error for Error {}

/// Write a LEB128 (7 bits per byte, high bit = continuation) unsigned
/// integer.
fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

/// Byte cursor with LEB128 decoding, mirroring the bit-cursor's
/// read-and-advance style but at byte granularity.
struct Reader<'input> {
    buffer: &'input [u8],
    offset: usize,
}

impl<'input> Reader<'input> {
    fn new(buffer: &'input [u8]) -> Self {
        Self { buffer, offset: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, Error> {
        let b = *self.buffer.get(self.offset).ok_or(Error::Truncated)?;
        self.offset += 1;
        Ok(b)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'input [u8], Error> {
        let end = self.offset.checked_add(len).ok_or(Error::Truncated)?;
        let bytes = self.buffer.get(self.offset..end).ok_or(Error::Truncated)?;
        self.offset = end;
        Ok(bytes)
    }

    fn read_varint(&mut self) -> Result<u64, Error> {
        let mut result: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            result |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
            if shift >= 64 {
                return Err(Error::Truncated);
            }
        }
    }

    fn read_varint_usize(&mut self) -> Result<usize, Error> {
        Ok(self.read_varint()? as usize)
    }
}

/// Assign every reachable value a dense pre-order id, memoized so each node
/// gets exactly one id. Iterative (explicit stack), so deep type chains
/// don't blow the call stack, and stable under cycles since child
/// resolution never needs to recurse.
fn assign_ids(graph: &Graph, root: NodeId) -> Vec<NodeId> {
    let mut order = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut stack = vec![root];
    seen.insert(root);
    while let Some(node) = stack.pop() {
        order.push(node);
        // Push in reverse so the leftmost unseen child is popped (and thus
        // assigned the next id) first, preserving left-to-right pre-order.
        for &child in graph.children(node).iter().rev() {
            if seen.insert(child) {
                stack.push(child);
            }
        }
    }
    order
}

/// Encode `graph` (rooted at `graph.root()`) to its columnar byte form.
/// Deterministic: the same graph always produces the same bytes, because
/// id assignment depends only on child insertion order.
pub fn encode(graph: &Graph) -> Vec<u8> {
    let Some(root) = graph.root() else {
        let mut out = Vec::new();
        write_varint(&mut out, 0);
        return out;
    };
    let ids = assign_ids(graph, root);
    let index_of: std::collections::HashMap<NodeId, u32> = ids
        .iter()
        .enumerate()
        .map(|(i, &id)| (id, i as u32))
        .collect();

    let mut out = Vec::new();
    write_varint(&mut out, ids.len() as u64);

    // Column 1: tag
    for &id in &ids {
        out.push(graph.tag(id) as u8);
    }
    // Column 2 + 3: name length, then all name bytes concatenated
    for &id in &ids {
        write_varint(&mut out, graph.name(id).len() as u64);
    }
    for &id in &ids {
        out.extend_from_slice(graph.name(id).as_bytes());
    }
    // Column 4: value
    for &id in &ids {
        write_varint(&mut out, graph.value(id));
    }
    // Column 5 + 6: child count, then children ids grouped per parent
    for &id in &ids {
        write_varint(&mut out, graph.children(id).len() as u64);
    }
    for &id in &ids {
        for &child in graph.children(id) {
            write_varint(&mut out, u64::from(index_of[&child]));
        }
    }
    out
}

/// Decode a byte buffer produced by `encode` back into a `Graph`. Any
/// malformed input (short buffer, unknown tag, dangling reference) is
/// fatal -- the codec never degrades gracefully, unlike the DWARF ingester.
pub fn decode(data: &[u8]) -> Result<Graph, Error> {
    let mut r = Reader::new(data);
    let count = r.read_varint_usize()?;

    let mut tags = Vec::with_capacity(count);
    for _ in 0..count {
        let raw = r.read_u8()?;
        tags.push(ValueTag::try_from(raw).map_err(|_| Error::UnknownTag(raw))?);
    }

    let mut name_lens = Vec::with_capacity(count);
    for _ in 0..count {
        name_lens.push(r.read_varint_usize()?);
    }
    let mut names = Vec::with_capacity(count);
    for &len in &name_lens {
        let bytes = r.read_bytes(len)?;
        names.push(String::from_utf8_lossy(bytes).into_owned());
    }

    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(r.read_varint()?);
    }

    let mut child_counts = Vec::with_capacity(count);
    for _ in 0..count {
        child_counts.push(r.read_varint_usize()?);
    }
    let mut child_ids: Vec<Vec<u32>> = Vec::with_capacity(count);
    for &n in &child_counts {
        let mut row = Vec::with_capacity(n);
        for _ in 0..n {
            row.push(r.read_varint()? as u32);
        }
        child_ids.push(row);
    }

    let mut graph = Graph::new();
    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        ids.push(graph.alloc(tags[i], std::mem::take(&mut names[i]), values[i]));
    }
    for (i, &id) in ids.iter().enumerate() {
        let mut children = Vec::with_capacity(child_ids[i].len());
        for &child_index in &child_ids[i] {
            let child_id = *ids
                .get(child_index as usize)
                .ok_or(Error::BadReference(child_index))?;
            children.push(child_id);
        }
        graph.set_children(id, children);
    }
    if let Some(&root) = ids.first() {
        graph.set_root(root);
    }
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{dedup, deeply_equal};

    fn sample_graph() -> Graph {
        let mut g = Graph::new();
        let root = g.alloc(ValueTag::Root, "main.elf", 0);
        let cu = g.alloc(ValueTag::CompileUnit, "main.c", 0);
        g.set_children(root, vec![cu]);

        let int_ty = g.alloc(ValueTag::BaseType, "int", 4);
        let x = g.alloc(ValueTag::Variable, "x", 0x1000);
        g.set_children(x, vec![int_ty]);

        let char_ty = g.alloc(ValueTag::BaseType, "char", 1);
        let arr_ty = g.alloc(ValueTag::Array, "", 4);
        g.set_children(arr_ty, vec![char_ty]);
        let buf = g.alloc(ValueTag::Variable, "buf", 0x2000);
        g.set_children(buf, vec![arr_ty]);

        g.set_children(cu, vec![x, buf]);
        g.set_root(root);
        g
    }

    #[test]
    fn round_trip_preserves_shape() {
        let g = sample_graph();
        let bytes = encode(&g);
        let g2 = decode(&bytes).unwrap();
        assert!(deeply_equal(&g, g.root().unwrap(), &g2, g2.root().unwrap()));
    }

    #[test]
    fn round_trip_preserves_shape_with_cycles() {
        let mut g = Graph::new();
        let s = g.alloc(ValueTag::Struct, "node", 8);
        let p = g.alloc(ValueTag::Pointer, "", 8);
        g.set_children(p, vec![s]);
        let next = g.alloc(ValueTag::Variable, "next", 0);
        g.set_children(next, vec![p]);
        g.set_children(s, vec![next]);
        g.set_root(s);

        let bytes = encode(&g);
        let g2 = decode(&bytes).unwrap();
        assert!(deeply_equal(&g, s, &g2, g2.root().unwrap()));
    }

    #[test]
    fn encode_is_deterministic() {
        let g = sample_graph();
        assert_eq!(encode(&g), encode(&g));
    }

    #[test]
    fn dedup_then_encode_round_trips_to_an_equal_graph() {
        let g = sample_graph();
        let d = dedup(&g);
        let bytes = encode(&d);
        let decoded = decode(&bytes).unwrap();
        assert!(deeply_equal(
            &g,
            g.root().unwrap(),
            &decoded,
            decoded.root().unwrap()
        ));
        assert!(encode(&d).len() <= encode(&g).len());
    }

    #[test]
    fn truncated_buffer_is_an_error() {
        let g = sample_graph();
        let mut bytes = encode(&g);
        bytes.truncate(bytes.len() / 2);
        assert!(matches!(decode(&bytes), Err(Error::Truncated)));
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let mut bytes = Vec::new();
        write_varint(&mut bytes, 1); // count = 1
        bytes.push(255); // invalid tag
        write_varint(&mut bytes, 0); // name len
        write_varint(&mut bytes, 0); // value
        write_varint(&mut bytes, 0); // child count
        assert!(matches!(decode(&bytes), Err(Error::UnknownTag(255))));
    }
}
