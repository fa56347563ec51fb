use inspect_core::value::{deeply_equal, Graph, ValueTag};
use inspect_core::codec;

/// Scenario: a minimal graph (one compile unit, one `int` variable) must
/// round-trip through encode/decode unchanged.
#[test]
fn minimal_graph_round_trips() {
    let mut g = Graph::new();
    let root = g.alloc(ValueTag::Root, "main.elf", 0);
    let cu = g.alloc(ValueTag::CompileUnit, "main.c", 0);
    let int_ty = g.alloc(ValueTag::BaseType, "int", 4);
    let x = g.alloc(ValueTag::Variable, "x", 0x2000_0000);
    g.set_children(x, vec![int_ty]);
    g.set_children(cu, vec![x]);
    g.set_children(root, vec![cu]);
    g.set_root(root);

    let bytes = codec::encode(&g);
    let decoded = codec::decode(&bytes).unwrap();

    assert!(deeply_equal(&g, root, &decoded, decoded.root().unwrap()));
    let var = decoded.variables(decoded.root().unwrap())[0];
    assert_eq!(decoded.name(var), "x");
    assert_eq!(decoded.value(var), 0x2000_0000);
    assert_eq!(decoded.pretty(var), "int x");
}

#[test]
fn empty_graph_round_trips() {
    let g = Graph::new();
    let bytes = codec::encode(&g);
    let decoded = codec::decode(&bytes).unwrap();
    assert!(decoded.is_empty());
    assert!(decoded.root().is_none());
}
