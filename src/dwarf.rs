//! Translate DWARF debug info into a `Value` tree: one `CompileUnit`
//! subtree per compile unit, under a single `Root`.
//!
//! The graph-building logic (this module) is independent of how DIEs are
//! actually read -- it only consumes the small `DieSource` surface below.
//! The concrete source is `GimliSource`, backed by `gimli` + `object`; a
//! test-only `FakeSource` exercises the ingester without a real binary.

use std::borrow::Cow;
use std::collections::HashMap;
use std::{error, fmt, fs, path::Path};

use crate::value::{Graph, NodeId, ValueTag};

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Object(object::Error),
    Dwarf(gimli::Error),
    MissingDwarfSection,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "could not read file: {e}"),
            Self::Object(e) => write!(f, "could not parse object file: {e}"),
            Self::Dwarf(e) => write!(f, "could not parse DWARF: {e}"),
            Self::MissingDwarfSection => write!(f, "binary has no DWARF debug info"),
        }
    }
}

impl error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<object::Error> for Error {
    fn from(e: object::Error) -> Self {
        Self::Object(e)
    }
}

impl From<gimli::Error> for Error {
    fn from(e: gimli::Error) -> Self {
        Self::Dwarf(e)
    }
}

/// A single attribute value the ingester cares about. Location expressions
/// are pre-evaluated down to "is there a single `DW_OP_addr`, and if so
/// what address" -- the core never interprets DWARF expressions itself.
pub enum Location {
    Address(u64),
    Other,
}

/// The DIE surface the ingester needs. Implemented for real DWARF via
/// `GimliSource`; kept generic so the graph-building logic in this module
/// never depends on a specific DWARF library.
pub trait DieSource {
    type Id: Copy + Eq + std::hash::Hash;

    fn tag_name(&self, die: Self::Id) -> &'static str;
    fn name(&self, die: Self::Id) -> Option<String>;
    fn byte_size(&self, die: Self::Id) -> Option<u64>;
    fn data_member_location(&self, die: Self::Id) -> Option<u64>;
    fn const_value(&self, die: Self::Id) -> Option<u64>;
    fn array_count(&self, die: Self::Id) -> Option<u64>;
    fn location(&self, die: Self::Id) -> Location;
    fn type_of(&self, die: Self::Id) -> Option<Self::Id>;
    fn children(&self, die: Self::Id) -> Vec<Self::Id>;
    fn children_tagged(&self, die: Self::Id, tag: &str) -> Vec<Self::Id>;
    fn compile_units(&self) -> Vec<Self::Id>;
    fn pointer_width(&self) -> u64 {
        8
    }
}

/// Build a `Root` value from every compile unit `source` exposes.
pub fn ingest<S: DieSource>(source: &S, root_name: &str) -> Graph {
    let mut graph = Graph::new();
    let root = graph.alloc(ValueTag::Root, root_name, 0);

    let mut cache: HashMap<S::Id, NodeId> = HashMap::new();
    let void = graph.alloc(ValueTag::BaseType, "void", 0);

    let mut cu_children = Vec::new();
    for cu_die in source.compile_units() {
        if let Some(cu_value) = visit(source, cu_die, &mut graph, &mut cache, void) {
            cu_children.push(cu_value);
        }
    }
    graph.set_children(root, cu_children);
    graph.set_root(root);
    graph
}

fn type_of_or_void<S: DieSource>(
    source: &S,
    die: S::Id,
    graph: &mut Graph,
    cache: &mut HashMap<S::Id, NodeId>,
    void: NodeId,
) -> NodeId {
    match source.type_of(die) {
        Some(type_die) => visit(source, type_die, graph, cache, void).unwrap_or(void),
        None => void,
    }
}

/// Visit one DIE, memoized by its source-specific id so cross-references
/// (including ones that form cycles, e.g. `struct node { node *next; }`)
/// terminate and share a single `Value`.
fn visit<S: DieSource>(
    source: &S,
    die: S::Id,
    graph: &mut Graph,
    cache: &mut HashMap<S::Id, NodeId>,
    void: NodeId,
) -> Option<NodeId> {
    if let Some(&existing) = cache.get(&die) {
        return Some(existing);
    }

    let name = source.name(die).unwrap_or_default();

    match source.tag_name(die) {
        "compile_unit" => {
            let value = graph.alloc(ValueTag::CompileUnit, name, 0);
            cache.insert(die, value);
            let vars: Vec<NodeId> = source
                .children_tagged(die, "variable")
                .into_iter()
                .filter_map(|child| visit(source, child, graph, cache, void))
                .collect();
            graph.set_children(value, vars);
            Some(value)
        }
        "variable" => {
            if source.name(die).is_none() {
                return None;
            }
            let addr = match source.location(die) {
                Location::Address(addr) => addr,
                Location::Other => return None,
            };
            let value = graph.alloc(ValueTag::Variable, name, addr);
            cache.insert(die, value);
            let ty = type_of_or_void(source, die, graph, cache, void);
            graph.set_children(value, vec![ty]);
            Some(value)
        }
        "typedef" => {
            let value = graph.alloc(ValueTag::Typedef, name, 0);
            cache.insert(die, value);
            let ty = type_of_or_void(source, die, graph, cache, void);
            graph.set_children(value, vec![ty]);
            Some(value)
        }
        "pointer_type" => {
            let value = graph.alloc(ValueTag::Pointer, name, source.pointer_width());
            cache.insert(die, value);
            let ty = type_of_or_void(source, die, graph, cache, void);
            graph.set_children(value, vec![ty]);
            Some(value)
        }
        "array_type" => {
            let count = source.array_count(die).unwrap_or(1).max(1);
            let value = graph.alloc(ValueTag::Array, name, count);
            cache.insert(die, value);
            let ty = type_of_or_void(source, die, graph, cache, void);
            graph.set_children(value, vec![ty]);
            Some(value)
        }
        "structure_type" | "class_type" | "union_type" => {
            let size = source.byte_size(die).unwrap_or(0);
            let value = graph.alloc(ValueTag::Struct, name, size);
            cache.insert(die, value);
            let members: Vec<NodeId> = source
                .children_tagged(die, "member")
                .into_iter()
                .filter_map(|child| visit(source, child, graph, cache, void))
                .collect();
            graph.set_children(value, members);
            Some(value)
        }
        "member" => {
            let offset = source.data_member_location(die).unwrap_or(0);
            let value = graph.alloc(ValueTag::Variable, name, offset);
            cache.insert(die, value);
            let ty = type_of_or_void(source, die, graph, cache, void);
            graph.set_children(value, vec![ty]);
            Some(value)
        }
        "enumeration_type" => {
            let size = source.byte_size(die).unwrap_or(0);
            let value = graph.alloc(ValueTag::Enum, name, size);
            cache.insert(die, value);
            let variants: Vec<NodeId> = source
                .children_tagged(die, "enumerator")
                .into_iter()
                .filter_map(|child| visit(source, child, graph, cache, void))
                .collect();
            graph.set_children(value, variants);
            Some(value)
        }
        "enumerator" => {
            let constant = source.const_value(die).unwrap_or(0);
            let value = graph.alloc(ValueTag::EnumValue, name, constant);
            cache.insert(die, value);
            Some(value)
        }
        "base_type" => {
            let size = source.byte_size(die).unwrap_or(0);
            let value = graph.alloc(ValueTag::BaseType, name, size);
            cache.insert(die, value);
            Some(value)
        }
        "volatile_type" | "const_type" | "atomic_type" => {
            // Qualifiers are transparent: resolve straight to the
            // underlying type, caching that resolution under this DIE too
            // so repeat references are free.
            let resolved = type_of_or_void(source, die, graph, cache, void);
            cache.insert(die, resolved);
            Some(resolved)
        }
        "subroutine_type" => Some(void),
        other => {
            tracing::warn!(tag = other, "unhandled DIE tag, treating as void");
            Some(void)
        }
    }
}

/// Concrete `DieSource` over a real ELF/DWARF binary, via `object` +
/// `gimli`. Only `DW_AT_location` expressions consisting of a single
/// `DW_OP_addr` are resolved to an address; anything else (register
/// locations, location lists, `DW_OP_fbreg`, ...) is reported as
/// `Location::Other` and the ingester drops that variable.
pub struct GimliSource<'a> {
    dwarf: gimli::Dwarf<gimli::EndianSlice<'a, gimli::RunTimeEndian>>,
    units: Vec<gimli::Unit<gimli::EndianSlice<'a, gimli::RunTimeEndian>>>,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DieId {
    unit: usize,
    offset: gimli::UnitOffset,
}

fn load_section<'data>(
    object_file: &object::File<'data>,
    id: gimli::SectionId,
) -> Result<Cow<'data, [u8]>, object::Error> {
    use object::{Object, ObjectSection};
    match object_file.section_by_name(id.name()) {
        Some(section) => section.uncompressed_data(),
        None => Ok(Cow::Owned(Vec::new())),
    }
}

pub fn load(path: &Path) -> Result<Graph, Error> {
    use object::Object;
    let data = fs::read(path)?;
    let object_file = object::File::parse(&*data)?;
    if object_file
        .section_by_name(gimli::SectionId::DebugInfo.name())
        .is_none()
    {
        return Err(Error::MissingDwarfSection);
    }
    let endian = if object_file.is_little_endian() {
        gimli::RunTimeEndian::Little
    } else {
        gimli::RunTimeEndian::Big
    };

    let dwarf_cow = gimli::Dwarf::load(|id| load_section(&object_file, id))?;
    let dwarf = dwarf_cow.borrow(|section| gimli::EndianSlice::new(section, endian));

    let mut units = Vec::new();
    let mut iter = dwarf.units();
    while let Some(header) = iter.next()? {
        units.push(dwarf.unit(header)?);
    }

    let source = GimliSource { dwarf, units };
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(ingest(&source, &name))
}

impl<'a> GimliSource<'a> {
    fn entry(&self, id: DieId) -> gimli::DebuggingInformationEntry<'_, '_, gimli::EndianSlice<'a, gimli::RunTimeEndian>> {
        self.units[id.unit]
            .entry(id.offset)
            .expect("DieId always refers to a live entry")
    }

    fn attr_u64(&self, id: DieId, attr: gimli::DwAt) -> Option<u64> {
        let entry = self.entry(id);
        let value = entry.attr_value(attr).ok().flatten()?;
        value.udata_value()
    }

    fn string_attr(&self, id: DieId, attr: gimli::DwAt) -> Option<String> {
        let entry = self.entry(id);
        let value = entry.attr_value(attr).ok().flatten()?;
        let r = self.dwarf.attr_string(&self.units[id.unit], value).ok()?;
        Some(r.to_string_lossy().into_owned())
    }
}

impl<'a> DieSource for GimliSource<'a> {
    type Id = DieId;

    fn tag_name(&self, die: Self::Id) -> &'static str {
        match self.entry(die).tag() {
            gimli::constants::DW_TAG_compile_unit => "compile_unit",
            gimli::constants::DW_TAG_variable => "variable",
            gimli::constants::DW_TAG_typedef => "typedef",
            gimli::constants::DW_TAG_pointer_type => "pointer_type",
            gimli::constants::DW_TAG_array_type => "array_type",
            gimli::constants::DW_TAG_structure_type => "structure_type",
            gimli::constants::DW_TAG_class_type => "class_type",
            gimli::constants::DW_TAG_union_type => "union_type",
            gimli::constants::DW_TAG_member => "member",
            gimli::constants::DW_TAG_enumeration_type => "enumeration_type",
            gimli::constants::DW_TAG_enumerator => "enumerator",
            gimli::constants::DW_TAG_base_type => "base_type",
            gimli::constants::DW_TAG_volatile_type => "volatile_type",
            gimli::constants::DW_TAG_const_type => "const_type",
            gimli::constants::DW_TAG_atomic_type => "atomic_type",
            gimli::constants::DW_TAG_subroutine_type => "subroutine_type",
            _ => "unknown",
        }
    }

    fn name(&self, die: Self::Id) -> Option<String> {
        self.string_attr(die, gimli::constants::DW_AT_name)
    }

    fn byte_size(&self, die: Self::Id) -> Option<u64> {
        self.attr_u64(die, gimli::constants::DW_AT_byte_size)
    }

    fn data_member_location(&self, die: Self::Id) -> Option<u64> {
        self.attr_u64(die, gimli::constants::DW_AT_data_member_location)
    }

    fn const_value(&self, die: Self::Id) -> Option<u64> {
        self.attr_u64(die, gimli::constants::DW_AT_const_value)
    }

    fn array_count(&self, die: Self::Id) -> Option<u64> {
        let mut total: u64 = 1;
        let mut found = false;
        for child in self.children(die) {
            if self.entry(child).tag() != gimli::constants::DW_TAG_subrange_type {
                continue;
            }
            if let Some(count) = self.attr_u64(child, gimli::constants::DW_AT_count) {
                total *= count;
                found = true;
            } else if let Some(upper) = self.attr_u64(child, gimli::constants::DW_AT_upper_bound) {
                total *= upper + 1;
                found = true;
            }
        }
        found.then_some(total)
    }

    fn location(&self, die: Self::Id) -> Location {
        let entry = self.entry(die);
        let Ok(Some(value)) = entry.attr_value(gimli::constants::DW_AT_location) else {
            return Location::Other;
        };
        let gimli::AttributeValue::Exprloc(expr) = value else {
            return Location::Other;
        };
        let mut ops = expr.operations(self.units[die.unit].encoding());
        let first = ops.next();
        let second = ops.next();
        match (first, second) {
            (Ok(Some(gimli::Operation::Address { address })), Ok(None)) => {
                Location::Address(address)
            }
            _ => Location::Other,
        }
    }

    fn type_of(&self, die: Self::Id) -> Option<Self::Id> {
        let entry = self.entry(die);
        let value = entry.attr_value(gimli::constants::DW_AT_type).ok().flatten()?;
        match value {
            gimli::AttributeValue::UnitRef(offset) => Some(DieId {
                unit: die.unit,
                offset,
            }),
            _ => None,
        }
    }

    fn children(&self, die: Self::Id) -> Vec<Self::Id> {
        let unit = &self.units[die.unit];
        let mut tree = match unit.entries_tree(Some(die.offset)) {
            Ok(tree) => tree,
            Err(_) => return Vec::new(),
        };
        let root = match tree.root() {
            Ok(root) => root,
            Err(_) => return Vec::new(),
        };
        let mut out = Vec::new();
        let mut children = root.children();
        while let Ok(Some(child)) = children.next() {
            out.push(DieId {
                unit: die.unit,
                offset: child.entry().offset(),
            });
        }
        out
    }

    fn children_tagged(&self, die: Self::Id, tag: &str) -> Vec<Self::Id> {
        self.children(die)
            .into_iter()
            .filter(|&c| self.tag_name(c) == tag)
            .collect()
    }

    fn compile_units(&self) -> Vec<Self::Id> {
        (0..self.units.len())
            .filter_map(|unit| {
                let root = self.units[unit].entries_tree(None).ok()?.root().ok()?.entry().offset();
                Some(DieId {
                    unit,
                    offset: root,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    /// A hand-built `DieSource` standing in for a real DWARF file, letting
    /// the ingester's graph-shaping logic be tested without `gimli`.
    struct FakeSource {
        tags: Map<u32, &'static str>,
        names: Map<u32, String>,
        sizes: Map<u32, u64>,
        offsets: Map<u32, u64>,
        consts: Map<u32, u64>,
        types: Map<u32, u32>,
        kids: Map<u32, Vec<u32>>,
        locs: Map<u32, u64>,
        cus: Vec<u32>,
    }

    impl DieSource for FakeSource {
        type Id = u32;

        fn tag_name(&self, die: u32) -> &'static str {
            self.tags.get(&die).copied().unwrap_or("unknown")
        }
        fn name(&self, die: u32) -> Option<String> {
            self.names.get(&die).cloned()
        }
        fn byte_size(&self, die: u32) -> Option<u64> {
            self.sizes.get(&die).copied()
        }
        fn data_member_location(&self, die: u32) -> Option<u64> {
            self.offsets.get(&die).copied()
        }
        fn const_value(&self, die: u32) -> Option<u64> {
            self.consts.get(&die).copied()
        }
        fn array_count(&self, die: u32) -> Option<u64> {
            self.sizes.get(&die).copied()
        }
        fn location(&self, die: u32) -> Location {
            match self.locs.get(&die) {
                Some(&addr) => Location::Address(addr),
                None => Location::Other,
            }
        }
        fn type_of(&self, die: u32) -> Option<u32> {
            self.types.get(&die).copied()
        }
        fn children(&self, die: u32) -> Vec<u32> {
            self.kids.get(&die).cloned().unwrap_or_default()
        }
        fn children_tagged(&self, die: u32, tag: &str) -> Vec<u32> {
            self.children(die)
                .into_iter()
                .filter(|c| self.tag_name(*c) == tag)
                .collect()
        }
        fn compile_units(&self) -> Vec<u32> {
            self.cus.clone()
        }
    }

    #[test]
    fn ingests_a_variable_with_a_resolvable_address() {
        let mut src = FakeSource {
            tags: Map::new(),
            names: Map::new(),
            sizes: Map::new(),
            offsets: Map::new(),
            consts: Map::new(),
            types: Map::new(),
            kids: Map::new(),
            locs: Map::new(),
            cus: vec![1],
        };
        src.tags.insert(1, "compile_unit");
        src.names.insert(1, "main.c".into());
        src.kids.insert(1, vec![2]);

        src.tags.insert(2, "variable");
        src.names.insert(2, "x".into());
        src.locs.insert(2, 0x1000);
        src.types.insert(2, 3);

        src.tags.insert(3, "base_type");
        src.names.insert(3, "int".into());
        src.sizes.insert(3, 4);

        let graph = ingest(&src, "main.elf");
        let root = graph.root().unwrap();
        let vars = graph.variables(root);
        assert_eq!(vars.len(), 1);
        assert_eq!(graph.name(vars[0]), "x");
        assert_eq!(graph.value(vars[0]), 0x1000);
        let ty = graph.type_of(vars[0]).unwrap();
        assert_eq!(graph.name(ty), "int");
        assert_eq!(graph.value(ty), 4);
    }

    #[test]
    fn drops_variables_without_a_resolvable_address() {
        let mut src = FakeSource {
            tags: Map::new(),
            names: Map::new(),
            sizes: Map::new(),
            offsets: Map::new(),
            consts: Map::new(),
            types: Map::new(),
            kids: Map::new(),
            locs: Map::new(),
            cus: vec![1],
        };
        src.tags.insert(1, "compile_unit");
        src.names.insert(1, "main.c".into());
        src.kids.insert(1, vec![2]);
        src.tags.insert(2, "variable");
        src.names.insert(2, "optimized_out".into());
        // No entry in `locs`: location is unresolvable.

        let graph = ingest(&src, "main.elf");
        let root = graph.root().unwrap();
        assert!(graph.variables(root).is_empty());
    }

    #[test]
    fn unknown_tags_become_void() {
        let mut src = FakeSource {
            tags: Map::new(),
            names: Map::new(),
            sizes: Map::new(),
            offsets: Map::new(),
            consts: Map::new(),
            types: Map::new(),
            kids: Map::new(),
            locs: Map::new(),
            cus: vec![1],
        };
        src.tags.insert(1, "compile_unit");
        src.kids.insert(1, vec![2]);
        src.tags.insert(2, "variable");
        src.names.insert(2, "v".into());
        src.locs.insert(2, 0x10);
        src.types.insert(2, 3);
        src.tags.insert(3, "something_new");

        let graph = ingest(&src, "main.elf");
        let root = graph.root().unwrap();
        let v = graph.variables(root)[0];
        let ty = graph.type_of(v).unwrap();
        assert_eq!(graph.name(ty), "void");
        assert_eq!(graph.value(ty), 0);
    }
}
