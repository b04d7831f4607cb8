//! Frame-Map Construction Benchmarks
//!
//! Measures event-log replay for methods of growing loop depth, where every
//! extra level of nesting adds another fixed-point pass.
//!
//! # Benchmark Categories
//!
//! 1. **Replay**: frame-map construction from a recorded event log
//! 2. **Translate + Replay**: the full compile pipeline minus installation

use corvus_bytecode::{
    CodeBody, CodeBuilder, Condition, FieldRef, Instruction, MethodDescriptor, MethodFlags,
    MethodRef,
};
use corvus_jit::compiler::{frame_map, translate};
use corvus_jit::{
    Class, ClassId, InvokeKind, JitOptions, Method, MethodId, MethodParts, ResolveError,
    ResolvedField, Resolver,
};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;

// =============================================================================
// Benchmark Helpers
// =============================================================================

struct NoSymbols;

impl Resolver for NoSymbols {
    fn resolve_class(&self, name: &str) -> Result<Arc<Class>, ResolveError> {
        Err(ResolveError::ClassNotFound(name.to_string()))
    }

    fn resolve_method(&self, r: &MethodRef, _: InvokeKind) -> Result<Arc<Method>, ResolveError> {
        Err(ResolveError::ClassNotFound(r.class.to_string()))
    }

    fn resolve_field(&self, r: &FieldRef, _: bool) -> Result<ResolvedField, ResolveError> {
        Err(ResolveError::ClassNotFound(r.class.to_string()))
    }

    fn intern_string(&self, _: &str) -> Result<u64, ResolveError> {
        Ok(1)
    }
}

/// `depth` nested counting loops; the innermost body overwrites a local
/// that held a reference on entry.
fn nested_loops(depth: u16) -> CodeBody {
    let counters = 2..2 + depth;
    let mut b = CodeBuilder::new(2 + depth);
    b.emit_all([Instruction::ALoad(0), Instruction::AStore(1)]);

    let mut exits = Vec::new();
    let mut heads = Vec::new();
    for counter in counters.clone() {
        b.emit_all([Instruction::IConst(4), Instruction::IStore(counter)]);
        let head = b.create_label();
        let exit = b.create_label();
        b.bind_label(head);
        b.emit(Instruction::ILoad(counter));
        b.emit_if(Condition::Le, exit);
        heads.push(head);
        exits.push(exit);
    }
    b.emit_all([Instruction::IConst(0), Instruction::IStore(1)]);
    for counter in counters.rev() {
        let head = heads.pop().unwrap();
        let exit = exits.pop().unwrap();
        b.emit(Instruction::IInc(counter, -1));
        b.emit_goto(head);
        b.bind_label(exit);
    }
    b.emit(Instruction::Return);
    b.finish().unwrap()
}

fn method(code: CodeBody) -> Arc<Method> {
    Arc::new(Method::new(
        MethodParts {
            id: MethodId(0),
            class: ClassId(1),
            class_name: Arc::from("bench/B"),
            name: Arc::from("loops"),
            descriptor: Arc::from("(Lbench/A;)V"),
            signature: MethodDescriptor::parse("(Lbench/A;)V").unwrap(),
            flags: MethodFlags::STATIC,
            code: Some(code),
            vtable_index: None,
        },
        0,
    ))
}

// =============================================================================
// Replay Benchmarks
// =============================================================================

fn bench_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_map_replay");
    let options = JitOptions::default();

    for depth in [1u16, 2, 4, 8] {
        let m = method(nested_loops(depth));
        let t = translate(&m, &NoSymbols, &options).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(depth), &t, |b, t| {
            b.iter(|| {
                black_box(frame_map::build(
                    black_box(&t.log),
                    &t.visits,
                    &t.layout,
                    t.trace_count(),
                ))
            })
        });
    }

    group.finish();
}

fn bench_translate(c: &mut Criterion) {
    let mut group = c.benchmark_group("translate_and_replay");
    let options = JitOptions::default();

    for depth in [1u16, 4] {
        let m = method(nested_loops(depth));
        group.bench_with_input(BenchmarkId::from_parameter(depth), &m, |b, m| {
            b.iter(|| {
                let t = translate(black_box(m), &NoSymbols, &options).unwrap();
                black_box(frame_map::build(&t.log, &t.visits, &t.layout, t.trace_count()))
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_replay, bench_translate);
criterion_main!(benches);
