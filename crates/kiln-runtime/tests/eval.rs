//! End-to-end evaluator tests: parse, resolve, type, lower, optimize,
//! flatten, run.

use kiln_lang::diagnostics::Diagnostics;
use kiln_lang::parser::{parse_expression, parse_file};
use kiln_lang::datatype::SumRegistry;
use kiln_lang::infer::infer_program;
use kiln_lang::resolver::resolve_program;
use kiln_lang::types::TypeContext;
use kiln_runtime::{register_basics, Obj, PrimRegistry, Runtime};
use std::rc::Rc;

const PRELUDE: &str = r#"
data Boolean = True | False
data Order = LT | EQ | GT
data List a = Nil | Cons a (List a)
data Unit = Unit
data Pair a b = Pair a b
data Result o f = Pass o | Fail f
global def iadd x y = prim "iadd"
global def isub x y = prim "isub"
global def icmp x y = prim "icmp"
global def scat x y = prim "scat"
global def panic s = prim "panic"
global def print s = prim "print"
global def format v = prim "format"
global def tnew l = prim "tnew"
global def tget t k f = prim "tget"
global def x + y = iadd x y
global def x - y = isub x y
global def lcat a b = match a
    Nil = b
    Cons h t = Cons h (lcat t b)
global def x ++ y = lcat x y
"#;

struct Built {
    rt: Runtime,
    result: kiln_runtime::RootId,
}

fn build(src: &str, entry: &str) -> Built {
    let mut diags = Diagnostics::new();
    let prelude = parse_file("<prelude>", PRELUDE, &mut diags);
    let user = parse_file("build.kiln", src, &mut diags);
    assert!(diags.ok(), "parse: {:?}", diags.take());

    let mut sums = SumRegistry::new();
    for d in prelude.datas.iter().chain(user.datas.iter()) {
        sums.define(d, &mut diags);
    }
    sums.check_special(&mut diags);
    assert!(diags.ok(), "sums: {:?}", diags.take());

    let mut registry = PrimRegistry::new();
    register_basics(&mut registry, &sums);
    let iface = registry.interface();

    let body = parse_expression(entry, &mut diags).expect("entry parses");
    let mut root = resolve_program(&[prelude, user], body, &sums, &iface, &mut diags)
        .unwrap_or_else(|| panic!("resolve: {:?}", diags.take()));

    let mut cx = TypeContext::new();
    infer_program(&mut root, &mut cx, &iface, &mut diags);
    assert!(diags.ok(), "types: {:?}", diags.take());

    let fun = kiln_ssa::lower(&root);
    let fun = kiln_ssa::optimize(fun);
    let program = kiln_ssa::flatten(fun);

    let mut rt = Runtime::new(program, Rc::new(registry), 1.5);
    let result = rt.seed();
    Built { rt, result }
}

fn run_int(src: &str, entry: &str) -> i64 {
    let mut b = build(src, entry);
    b.rt.run();
    assert!(!b.rt.abort, "evaluation aborted");
    let v = b.rt.result_value(b.result).expect("result fulfilled");
    match b.rt.heap.get(v) {
        Obj::Int(i) => *i,
        other => panic!("expected int result, got {:?}", other),
    }
}

#[test]
fn arithmetic_evaluates() {
    assert_eq!(run_int("global def main = 1 + 2 * 1 + 39\n", "main"), 42);
}

#[test]
fn match_over_lists() {
    let src = "\
global def sum l = match l
    Nil = 0
    Cons h t = h + sum t
global def main = sum (Cons 1 (Cons 2 (Cons 3 Nil)))
";
    assert_eq!(run_int(src, "main"), 6);
}

#[test]
fn list_concat_through_operator() {
    let src = "\
global def sum l = match l
    Nil = 0
    Cons h t = h + sum t
global def main = sum ((Cons 1 Nil) ++ (Cons 2 (Cons 3 Nil)))
";
    assert_eq!(run_int(src, "main"), 6);
}

#[test]
fn mutual_recursion_runs() {
    let src = "\
global def even n = match (icmp n 0)
    EQ = True
    _ = odd (n - 1)
global def odd n = match (icmp n 0)
    EQ = False
    _ = even (n - 1)
global def main = match (even 10)
    True = 1
    False = 0
";
    assert_eq!(run_int(src, "main"), 1);
}

#[test]
fn guards_and_literal_patterns() {
    let src = "\
global def classify n = match n
    0 = 100
    x if lt x 0 = 200
    _ = 300
global def lt a b = match (icmp a b)
    LT = True
    _ = False
global def main = classify 0 + classify (0 - 5) + classify 9
";
    assert_eq!(run_int(src, "main"), 600);
}

#[test]
fn zero_arg_definition_evaluates_once_lazily() {
    // A 0-argument definition's body evaluates exactly once.
    let src = "\
global def noisy =
    def u = print \"tick\"
    41
global def main = noisy + 1
";
    let mut b = build(src, "main");
    b.rt.run();
    assert!(!b.rt.abort);
    assert_eq!(String::from_utf8_lossy(&b.rt.stdout), "tick");
}

#[test]
fn target_memoizes_per_argument_tuple() {
    let src = "\
target double x =
    def u = print \"eval \"
    x + x
global def main = double 3 + double 3 + double 4
";
    let mut b = build(src, "main");
    b.rt.run();
    assert!(!b.rt.abort, "evaluation aborted");
    let v = b.rt.result_value(b.result).expect("result fulfilled");
    match b.rt.heap.get(v) {
        Obj::Int(i) => assert_eq!(*i, 20),
        other => panic!("expected int, got {:?}", other),
    }
    // Two distinct argument tuples, three call sites.
    assert_eq!(String::from_utf8_lossy(&b.rt.stdout), "eval eval ");
}

#[test]
fn panic_aborts_without_result() {
    let src = "global def main = panic \"boom\"\n";
    let mut b = build(src, "main");
    b.rt.run();
    assert!(b.rt.abort);
    assert!(b.rt.result_value(b.result).is_none());
}

#[test]
fn division_by_zero_panics() {
    let src = "\
global def idiv x y = prim \"idiv\"
global def main = idiv 1 0
";
    let mut b = build(src, "main");
    b.rt.run();
    assert!(b.rt.abort);
}

#[test]
fn division_overflow_panics() {
    // i64::MIN / -1 does not fit; it must panic, not wrap.
    let src = "\
global def idiv x y = prim \"idiv\"
global def main = idiv (0 - 9223372036854775807 - 1) (0 - 1)
";
    let mut b = build(src, "main");
    b.rt.run();
    assert!(b.rt.abort);
    assert!(b.rt.result_value(b.result).is_none());
}

#[test]
fn evaluation_survives_forced_collections() {
    let src = "\
global def build n = match (icmp n 0)
    EQ = Nil
    _ = Cons n (build (n - 1))
global def sum l = match l
    Nil = 0
    Cons h t = h + sum t
global def main = sum (build 200)
";
    let mut b = build(src, "main");
    // Tighten the arena so the run is forced through many collections.
    b.rt.heap.set_limit(2048);
    b.rt.run();
    assert!(!b.rt.abort, "evaluation aborted");
    let v = b.rt.result_value(b.result).expect("result fulfilled");
    match b.rt.heap.get(v) {
        Obj::Int(i) => assert_eq!(*i, 20100),
        other => panic!("expected int, got {:?}", other),
    }
    assert!(b.rt.heap.collections > 0, "the stress limit forced no GC");
}

#[test]
fn cse_preserves_effect_order() {
    let src = "\
global def main =
    def a = print \"a\"
    def b = print \"b\"
    def c = print \"a\"
    7
";
    let mut b = build(src, "main");
    b.rt.run();
    assert!(!b.rt.abort);
    // Three effect invocations survive: the duplicated print is not
    // merged away and nothing is dropped.
    assert_eq!(String::from_utf8_lossy(&b.rt.stdout), "aba");
}

#[test]
fn publish_subscribe_chains_in_order() {
    let src = "\
publish flags = Cons \"-O2\" Nil
publish flags = Cons \"-g\" Nil
global def len l = match l
    Nil = 0
    Cons _ t = 1 + len t
global def main = len (subscribe flags)
";
    assert_eq!(run_int(src, "main"), 2);
}

#[test]
fn subscribe_without_publishes_is_nil() {
    let src = "\
global def len l = match l
    Nil = 0
    Cons _ t = 1 + len t
global def main = len (subscribe nothing)
";
    assert_eq!(run_int(src, "main"), 0);
}

#[test]
fn block_publish_shadows_outward() {
    let src = "\
publish path = Cons \"outer\" Nil
global def len l = match l
    Nil = 0
    Cons _ t = 1 + len t
global def main =
    publish path = Cons \"inner\" Nil
    len (subscribe path)
";
    // The inner channel chains onto the outer one.
    assert_eq!(run_int(src, "main"), 2);
}

#[test]
fn record_hash_depends_only_on_shape() {
    let src = "global def main = Pair 1 (Cons 2 Nil)\n";
    let mut b = build(src, "main");
    b.rt.run();
    let v = b.rt.result_value(b.result).expect("result");
    let h1 = b.rt.value_hash(v).expect("fully evaluated");
    let h2 = b.rt.value_hash(v).expect("fully evaluated");
    assert_eq!(h1, h2);

    let mut b2 = build("global def main = Pair 1 (Cons 2 Nil)\n", "main");
    b2.rt.run();
    let v2 = b2.rt.result_value(b2.result).expect("result");
    let h3 = b2.rt.value_hash(v2).expect("fully evaluated");
    assert_eq!(h1, h3, "equal records hash equally across runs");
}
