//! Randomized object graphs pushed through the collector and the library
//! codec, checked structurally against the shape they were built from.

use proptest::prelude::*;
use proptest::test_runner::TestCaseError;

use squill::heap::object::ObjBody;
use squill::heap::Heap;
use squill::library::read::read_library;
use squill::library::write::write_library;
use squill::library::Library;
use squill::value::Value;
use squill::vm::frame::Registers;
use squill::vm::natives::NativeRegistry;

/// Shape of a heap graph to build. Mirrors what the writer can carry.
#[derive(Clone, Debug)]
enum NodeSpec {
    Fix(i64),
    Text(String),
    List(Vec<NodeSpec>),
    Vector(Vec<NodeSpec>),
}

fn node_strategy() -> impl Strategy<Value = NodeSpec> {
    let leaf = prop_oneof![
        any::<i32>().prop_map(|n| NodeSpec::Fix(n as i64)),
        "[a-z]{0,8}".prop_map(NodeSpec::Text),
    ];
    leaf.prop_recursive(3, 32, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(NodeSpec::List),
            prop::collection::vec(inner, 0..4).prop_map(NodeSpec::Vector),
        ]
    })
}

/// Build the described graph. Finished siblings wait on the `roots` stack so
/// a collection in the middle of a composite cannot lose them; values inside
/// an allocation's own body are relocated with it and need no extra rooting.
fn build_node(
    heap: &mut Heap,
    regs: &mut Registers,
    spec: &NodeSpec,
    roots: &mut Vec<Value>,
) -> Value {
    match spec {
        NodeSpec::Fix(n) => Value::fixnum(*n),
        NodeSpec::Text(s) => heap.alloc_with_roots(ObjBody::Str(s.clone()), regs, roots),
        NodeSpec::List(items) => {
            let base = roots.len();
            for item in items {
                let v = build_node(heap, regs, item, roots);
                roots.push(v);
            }
            let mut tail = Value::NIL;
            while roots.len() > base {
                let car = match roots.pop() {
                    Some(v) => v,
                    None => unreachable!(),
                };
                tail = heap.alloc_with_roots(ObjBody::Pair { car, cdr: tail }, regs, roots);
            }
            tail
        }
        NodeSpec::Vector(items) => {
            let base = roots.len();
            for item in items {
                let v = build_node(heap, regs, item, roots);
                roots.push(v);
            }
            let slots = roots.split_off(base);
            heap.alloc_with_roots(ObjBody::Vector(slots), regs, roots)
        }
    }
}

/// Structural comparison of a heap value against the shape it came from.
fn matches(heap: &Heap, v: Value, spec: &NodeSpec) -> bool {
    match spec {
        NodeSpec::Fix(n) => v == Value::fixnum(*n),
        NodeSpec::Text(s) => {
            v.is_object() && matches!(heap.body(v), ObjBody::Str(t) if t == s)
        }
        NodeSpec::List(items) => match heap.list_to_vec(v) {
            Some(vals) => {
                vals.len() == items.len()
                    && vals.iter().zip(items).all(|(v, s)| matches(heap, *v, s))
            }
            None => false,
        },
        NodeSpec::Vector(items) => {
            if !v.is_object() {
                return false;
            }
            match heap.body(v) {
                ObjBody::Vector(slots) => {
                    slots.len() == items.len()
                        && slots.iter().zip(items).all(|(v, s)| matches(heap, *v, s))
                }
                _ => false,
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn graphs_survive_collections(spec in node_strategy()) {
        // A tiny threshold makes collections land mid-construction.
        let mut heap = Heap::with_limits(32, 1 << 22);
        let mut regs = Registers::new();
        let mut roots = Vec::new();
        regs.acc = build_node(&mut heap, &mut regs, &spec, &mut roots);
        prop_assert!(matches(&heap, regs.acc, &spec));
        for _ in 0..3 {
            heap.collect(Some(&mut regs), &mut []);
            prop_assert!(matches(&heap, regs.acc, &spec));
        }
    }

    #[test]
    fn graphs_survive_the_library_codec(spec in node_strategy()) {
        let mut heap = Heap::new();
        let mut regs = Registers::new();
        let mut roots = Vec::new();
        let v = build_node(&mut heap, &mut regs, &spec, &mut roots);
        let lib = Library::new(
            vec!["prop".to_string()],
            vec![0],
            vec![("value".to_string(), v)],
            vec![],
        );
        let mut bytes = Vec::new();
        write_library(&heap, &lib, &mut bytes).map_err(|e| {
            TestCaseError::fail(format!("write failed: {e}"))
        })?;
        let mut dest = Heap::new();
        let registry = NativeRegistry::standard();
        let got = read_library(&mut dest, &registry, &mut bytes.as_slice()).map_err(|e| {
            TestCaseError::fail(format!("read failed: {e}"))
        })?;
        prop_assert!(matches(&dest, got.exports[0].1, &spec));
    }
}
