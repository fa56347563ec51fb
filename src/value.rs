//! The type/variable graph (`Value`), its structural equality, and
//! deduplication into a minimal DAG.
//!
//! Values live in an arena (`Graph`); edges are indices (`NodeId`), never
//! references. This is what lets the comparator and the dedup pass walk a
//! cyclic, cross-referencing graph without `Rc<RefCell<_>>` or unsafe code.

use std::collections::HashMap;

use num_enum::TryFromPrimitive;

/// What kind of node this is. Historical `Function`/`Volatile`/`Const`/
/// `Namespace` variants from earlier revisions of the on-wire format are not
/// represented here: qualifiers fold to their underlying type during
/// ingestion and `Function` is dropped (see `dwarf` module).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum ValueTag {
    Root = 0,
    CompileUnit = 1,
    Variable = 2,
    BaseType = 3,
    Pointer = 4,
    Array = 5,
    Struct = 6,
    Enum = 7,
    EnumValue = 8,
    Typedef = 9,
}

/// Index of a `Value` in a `Graph`'s arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ValueData {
    pub tag: ValueTag,
    pub name: String,
    pub value: u64,
    pub children: Vec<NodeId>,
}

/// Arena holding every reachable `Value`. A `Graph` always has exactly one
/// root, set by `set_root` (or implicitly by `ingest`/`decode`).
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<ValueData>,
    root: Option<NodeId>,
}

impl Graph {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            root: None,
        }
    }

    /// Allocate a new `Value` with no children yet and return its id.
    pub fn alloc(&mut self, tag: ValueTag, name: impl Into<String>, value: u64) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(ValueData {
            tag,
            name: name.into(),
            value,
            children: Vec::new(),
        });
        id
    }

    pub fn set_children(&mut self, id: NodeId, children: Vec<NodeId>) {
        self.nodes[id.index()].children = children;
    }

    pub fn push_child(&mut self, id: NodeId, child: NodeId) {
        self.nodes[id.index()].children.push(child);
    }

    pub fn set_root(&mut self, root: NodeId) {
        self.root = Some(root);
    }

    #[must_use]
    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub(crate) fn data(&self, id: NodeId) -> &ValueData {
        &self.nodes[id.index()]
    }

    #[must_use]
    pub fn tag(&self, id: NodeId) -> ValueTag {
        self.nodes[id.index()].tag
    }

    #[must_use]
    pub fn name(&self, id: NodeId) -> &str {
        &self.nodes[id.index()].name
    }

    #[must_use]
    pub fn value(&self, id: NodeId) -> u64 {
        self.nodes[id.index()].value
    }

    #[must_use]
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.index()].children
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// `children[0]`, the "pointed-to type", for tags that carry one.
    #[must_use]
    pub fn type_of(&self, id: NodeId) -> Option<NodeId> {
        match self.tag(id) {
            ValueTag::Variable | ValueTag::Pointer | ValueTag::Array | ValueTag::Typedef => {
                self.children(id).first().copied()
            }
            _ => None,
        }
    }

    /// Follow `type_of` to the bottom-most type (does not stop at Typedef).
    #[must_use]
    pub fn bottom(&self, id: NodeId) -> NodeId {
        match self.type_of(id) {
            Some(t) => self.bottom(t),
            None => id,
        }
    }

    /// Peel exactly `Typedef` nodes, stopping at the first non-typedef.
    #[must_use]
    pub fn untypedef(&self, id: NodeId) -> NodeId {
        if self.tag(id) == ValueTag::Typedef {
            match self.type_of(id) {
                Some(t) => self.untypedef(t),
                None => id,
            }
        } else {
            id
        }
    }

    /// One-line human-readable rendering, e.g. `"int x"`, `"struct S"`,
    /// `"RED = 1"`, `"T*"`, `"T[4]"`.
    #[must_use]
    pub fn pretty(&self, id: NodeId) -> String {
        match self.tag(id) {
            ValueTag::Root => format!("Root {}", self.name(id)),
            ValueTag::CompileUnit => format!("CompileUnit {}", self.name(id)),
            ValueTag::Variable => {
                let ty = self.type_of(id).map(|t| self.pretty(t)).unwrap_or_default();
                format!("{ty} {}", self.name(id))
            }
            ValueTag::BaseType => self.name(id).to_string(),
            ValueTag::Pointer => {
                let ty = self.type_of(id).map(|t| self.pretty(t)).unwrap_or_default();
                format!("{ty}*")
            }
            ValueTag::Array => {
                let ty = self.type_of(id).map(|t| self.pretty(t)).unwrap_or_default();
                format!("{ty}[{}]", self.value(id))
            }
            ValueTag::Struct => format!("struct {}", self.name(id)),
            ValueTag::Enum => format!("enum {}", self.name(id)),
            ValueTag::EnumValue => format!("{} = {}", self.name(id), self.value(id)),
            ValueTag::Typedef => self.name(id).to_string(),
        }
    }

    /// Top-level variables reachable from `id`: the `Variable` children of
    /// every `CompileUnit` below a `Root`, or the children of a
    /// `CompileUnit` directly, or `[]` otherwise.
    #[must_use]
    pub fn variables(&self, id: NodeId) -> Vec<NodeId> {
        match self.tag(id) {
            ValueTag::Root => self
                .children(id)
                .iter()
                .flat_map(|&cu| self.variables(cu))
                .collect(),
            ValueTag::CompileUnit => self.children(id).to_vec(),
            _ => Vec::new(),
        }
    }

    #[must_use]
    pub fn find_variable(&self, root: NodeId, name: &str) -> Option<NodeId> {
        self.variables(root).into_iter().find(|&v| self.name(v) == name)
    }

    /// Every node reachable from `start`, compile-unit-subtree then root.
    #[must_use]
    pub fn compile_units(&self, root: NodeId) -> Vec<NodeId> {
        self.children(root).to_vec()
    }
}

/// Deep structural equality between `a` and `b`, per the coinductive rule:
/// when the comparator re-encounters a pair already on its stack, the pair
/// is equal iff both sides closed the cycle at the same stack depth.
#[must_use]
pub fn deeply_equal(ga: &Graph, a: NodeId, gb: &Graph, b: NodeId) -> bool {
    // `stack[i] == (x, y)` means "we are in the middle of comparing x to y".
    let mut stack: Vec<(NodeId, NodeId)> = Vec::new();
    deeply_equal_rec(ga, a, gb, b, &mut stack)
}

fn deeply_equal_rec(
    ga: &Graph,
    a: NodeId,
    gb: &Graph,
    b: NodeId,
    stack: &mut Vec<(NodeId, NodeId)>,
) -> bool {
    if let Some(depth_a) = stack.iter().position(|&(x, _)| x == a) {
        // Closes a cycle. Equal only if `b` closes its own cycle at the
        // same stack depth (i.e. both sides re-enter in lockstep).
        return stack.get(depth_a).map(|&(_, y)| y) == Some(b);
    }
    if stack.iter().any(|&(_, y)| y == b) {
        return false;
    }

    let da = ga.data(a);
    let db = gb.data(b);
    if da.tag != db.tag || da.name != db.name || da.value != db.value {
        return false;
    }
    if da.children.len() != db.children.len() {
        return false;
    }

    stack.push((a, b));
    let children_a = da.children.clone();
    let children_b = db.children.clone();
    let equal = children_a
        .iter()
        .zip(children_b.iter())
        .all(|(&ca, &cb)| deeply_equal_rec(ga, ca, gb, cb, stack));
    stack.pop();
    equal
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum Color {
    Gray,
    Black,
}

/// Find every node reachable from `root` that participates in a cycle
/// (i.e. some descendant edge points back to a still-open ancestor), and
/// return a post-order visitation list of all reachable nodes.
fn analyze(graph: &Graph, root: NodeId) -> (Vec<NodeId>, std::collections::HashSet<NodeId>) {
    let mut color: HashMap<NodeId, Color> = HashMap::new();
    let mut cyclic = std::collections::HashSet::new();
    let mut order = Vec::new();
    // Explicit DFS stack; its node sequence is exactly the current path of
    // open (gray) ancestors, used to find how far back a cycle closes.
    let mut stack: Vec<(NodeId, usize)> = vec![(root, 0)];
    color.insert(root, Color::Gray);

    while let Some(&mut (node, ref mut next_child)) = stack.last_mut() {
        let children = graph.children(node);
        if *next_child < children.len() {
            let child = children[*next_child];
            *next_child += 1;
            match color.get(&child) {
                None => {
                    color.insert(child, Color::Gray);
                    stack.push((child, 0));
                }
                Some(Color::Gray) => {
                    // Back edge: everything from `child` to the top of the
                    // path is part of a cycle.
                    let pos = stack.iter().position(|&(n, _)| n == child).unwrap();
                    for &(n, _) in &stack[pos..] {
                        cyclic.insert(n);
                    }
                }
                Some(Color::Black) => {}
            }
        } else {
            color.insert(node, Color::Black);
            order.push(node);
            stack.pop();
        }
    }
    (order, cyclic)
}

/// Bucket key for candidate matching before a full deep comparison.
type BucketKey = (ValueTag, String, u64, usize);

/// Produce a new graph in which every maximal subtree that is deeply equal
/// to another has been replaced by a single shared node. Idempotent (up to
/// the identity of the shared representatives); does not change what any
/// walk over the graph observes.
///
/// Nodes that participate in a pointer cycle are not deduplicated against
/// each other (tracked per spec as an accepted simplification) -- the
/// result is still correct, merely larger than the theoretical minimum.
#[must_use]
pub fn dedup(graph: &Graph) -> Graph {
    let Some(root) = graph.root() else {
        return Graph::new();
    };
    let (order, cyclic) = analyze(graph, root);

    // old NodeId -> new NodeId
    let mut canon: HashMap<NodeId, NodeId> = HashMap::new();
    let mut buckets: HashMap<BucketKey, Vec<NodeId>> = HashMap::new();
    let mut new_graph = Graph::new();
    // For cyclic nodes we must defer child resolution: store the OLD child
    // ids here and rewrite them once `canon` is complete for the whole
    // graph.
    let mut deferred: Vec<(NodeId, Vec<NodeId>)> = Vec::new();

    for &old in &order {
        let data = graph.data(old);
        if cyclic.contains(&old) {
            let new_id = new_graph.alloc(data.tag, data.name.clone(), data.value);
            deferred.push((new_id, data.children.clone()));
            canon.insert(old, new_id);
            continue;
        }

        // Non-cyclic: every child was already visited earlier in `order`
        // (true post-order over a DAG), so `canon` already has them.
        let resolved_children: Vec<NodeId> = data
            .children
            .iter()
            .map(|c| *canon.get(c).expect("post-order guarantees child is canon"))
            .collect();

        let key: BucketKey = (data.tag, data.name.clone(), data.value, resolved_children.len());
        let bucket = buckets.entry(key).or_default();
        let mut found = None;
        for &candidate in bucket.iter() {
            if new_graph.children(candidate) == resolved_children.as_slice() {
                found = Some(candidate);
                break;
            }
        }

        let new_id = match found {
            Some(existing) => existing,
            None => {
                let new_id = new_graph.alloc(data.tag, data.name.clone(), data.value);
                new_graph.set_children(new_id, resolved_children);
                bucket.push(new_id);
                new_id
            }
        };
        canon.insert(old, new_id);
    }

    for (new_id, old_children) in deferred {
        let resolved: Vec<NodeId> = old_children
            .iter()
            .map(|c| *canon.get(c).expect("canon complete after full pass"))
            .collect();
        new_graph.set_children(new_id, resolved);
    }

    new_graph.set_root(*canon.get(&root).expect("root is always visited"));
    new_graph
}
