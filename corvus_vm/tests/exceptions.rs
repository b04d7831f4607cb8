//! Exception dispatch through compiled frames.

mod common;

use common::*;
use corvus_bytecode::{
    ArrayKind, ClassDef, ClassRef, FieldDef, FieldRef, Instruction as I, MethodDef, MethodFlags,
    MethodRef, TypeKind,
};
use corvus_vm::{VmError, names};

/// `1 / n` guarded by two handlers covering the same range, each
/// returning its own value.
fn divide(name: &str, handlers: [(Option<&'static str>, i32); 2]) -> MethodDef {
    static_method(name, "(I)I", 1, |b| {
        let start = b.create_label();
        let end = b.create_label();
        b.bind_label(start);
        b.emit_all([I::IConst(1), I::ILoad(0), I::IDiv, I::IReturn]);
        b.bind_label(end);
        for (catch, value) in handlers {
            let handler = b.create_label();
            b.bind_label(handler);
            b.emit_all([I::Pop, I::IConst(value), I::IReturn]);
            b.add_handler(start, end, handler, catch);
        }
    })
}

#[test]
fn test_first_matching_handler_in_table_order_wins() {
    let rt = runtime();
    let arithmetic = Some(names::ARITHMETIC_ERROR);
    rt.define_class(
        &ClassDef::new("app/Div")
            .method(divide("specificFirst", [(arithmetic, -1), (None, -2)]))
            .method(divide("catchAllFirst", [(None, -2), (arithmetic, -1)]))
            .method(divide(
                "unrelatedFirst",
                [(Some(names::NULL_POINTER_ERROR), -3), (None, -2)],
            )),
    )
    .unwrap();
    let thread = rt.attach_thread();
    let run = |name| as_int(call(&rt, &thread, "app/Div", name, "(I)I", &[int(0)]).unwrap());
    assert_eq!(run("specificFirst"), -1);
    assert_eq!(run("catchAllFirst"), -2);
    assert_eq!(run("unrelatedFirst"), -2);

    let ok = call(&rt, &thread, "app/Div", "specificFirst", "(I)I", &[int(1)]).unwrap();
    assert_eq!(as_int(ok), 1);
}

#[test]
fn test_uncaught_divide_by_zero() {
    let rt = runtime();
    rt.define_class(&ClassDef::new("app/Div").method(static_method("div", "(II)I", 2, |b| {
        b.emit_all([I::ILoad(0), I::ILoad(1), I::IDiv, I::IReturn]);
    })))
    .unwrap();
    let thread = rt.attach_thread();
    let err = call(&rt, &thread, "app/Div", "div", "(II)I", &[int(1), int(0)]).unwrap_err();
    match err {
        VmError::Uncaught { class, message, exception } => {
            assert_eq!(class, names::ARITHMETIC_ERROR);
            assert_eq!(message.as_deref(), Some("/ by zero"));
            assert_ne!(exception, 0);
        }
        other => panic!("unexpected error: {other}"),
    }
    // i32::MIN / -1 wraps instead of trapping.
    let min = call(&rt, &thread, "app/Div", "div", "(II)I", &[int(i32::MIN), int(-1)]).unwrap();
    assert_eq!(as_int(min), i32::MIN);
}

#[test]
fn test_handler_reads_exception_message() {
    let rt = runtime();
    rt.define_class(&ClassDef::new("app/Div").method(static_method(
        "describe",
        "(I)Llang/String;",
        1,
        |b| {
            let start = b.create_label();
            let end = b.create_label();
            let handler = b.create_label();
            b.bind_label(start);
            b.emit_all([I::IConst(1), I::ILoad(0), I::IDiv, I::Pop, I::AConstNull, I::AReturn]);
            b.bind_label(end);
            b.bind_label(handler);
            b.emit_all([
                I::InvokeVirtual(MethodRef::new(
                    names::THROWABLE_CLASS,
                    "getMessage",
                    "()Llang/String;",
                )),
                I::AReturn,
            ]);
            b.add_handler(start, end, handler, Some(names::THROWABLE_CLASS));
        },
    )))
    .unwrap();
    let thread = rt.attach_thread();
    let message = call(&rt, &thread, "app/Div", "describe", "(I)Llang/String;", &[int(0)]).unwrap();
    assert_eq!(&*rt.heap().string(message).unwrap(), "/ by zero");
    let none = call(&rt, &thread, "app/Div", "describe", "(I)Llang/String;", &[int(3)]).unwrap();
    assert_eq!(none, 0);
}

#[test]
fn test_null_field_access_raises() {
    let rt = runtime();
    let value = FieldRef::new("app/Node", "value", TypeKind::Int);
    rt.define_class(
        &ClassDef::new("app/Node")
            .field(FieldDef::instance("value", TypeKind::Int))
            .method(static_method("read", "(Lapp/Node;)I", 1, move |b| {
                b.emit_all([I::ALoad(0), I::GetField(value), I::IReturn]);
            })),
    )
    .unwrap();
    let thread = rt.attach_thread();
    let err = call(&rt, &thread, "app/Node", "read", "(Lapp/Node;)I", &[0]).unwrap_err();
    assert_eq!(err.exception_class(), Some(names::NULL_POINTER_ERROR));
}

#[test]
fn test_array_bounds_message() {
    let rt = runtime();
    rt.define_class(
        &ClassDef::new("app/Arrays")
            .method(static_method("outside", "(I)I", 1, |b| {
                b.emit_all([
                    I::IConst(2),
                    I::NewArray(ArrayKind::Int),
                    I::ILoad(0),
                    I::IALoad,
                    I::IReturn,
                ]);
            }))
            .method(static_method("negative", "()I", 0, |b| {
                b.emit_all([I::IConst(-1), I::NewArray(ArrayKind::Long), I::ArrayLength, I::IReturn]);
            })),
    )
    .unwrap();
    let thread = rt.attach_thread();
    let err = call(&rt, &thread, "app/Arrays", "outside", "(I)I", &[int(5)]).unwrap_err();
    assert!(matches!(
        &err,
        VmError::Uncaught { class, message: Some(message), .. }
            if class == names::ARRAY_INDEX_ERROR
                && message == "index 5 out of bounds for length 2"
    ));
    let err = call(&rt, &thread, "app/Arrays", "outside", "(I)I", &[int(-1)]).unwrap_err();
    assert_eq!(err.exception_class(), Some(names::ARRAY_INDEX_ERROR));
    let err = call(&rt, &thread, "app/Arrays", "negative", "()I", &[]).unwrap_err();
    assert_eq!(err.exception_class(), Some(names::NEGATIVE_ARRAY_SIZE_ERROR));
}

// =============================================================================
// Propagation across frames
// =============================================================================

fn thrower_classes() -> Vec<ClassDef> {
    let fail = MethodRef::new("app/Thrower", "fail", "()V");
    let guarded = |name: &str, catch: &'static str| {
        let fail = fail.clone();
        static_method(name, "()I", 0, move |b| {
            let start = b.create_label();
            let end = b.create_label();
            let handler = b.create_label();
            b.bind_label(start);
            b.emit_all([I::InvokeStatic(fail), I::IConst(1), I::IReturn]);
            b.bind_label(end);
            b.bind_label(handler);
            b.emit_all([I::Pop, I::IConst(7), I::IReturn]);
            b.add_handler(start, end, handler, Some(catch));
        })
    };
    vec![
        ClassDef::new("app/Oops").extends(names::EXCEPTION),
        ClassDef::new("app/Thrower")
            .method(static_method("fail", "()V", 0, |b| {
                b.emit_all([I::New(ClassRef::new("app/Oops")), I::AThrow]);
            }))
            .method(guarded("catchExact", "app/Oops"))
            .method(guarded("catchSuper", names::THROWABLE_CLASS))
            .method(guarded("catchOther", names::ARITHMETIC_ERROR))
            .method(static_method("throwNull", "()V", 0, |b| {
                b.emit_all([I::AConstNull, I::AThrow]);
            })),
    ]
}

#[test]
fn test_callee_exception_caught_by_caller() {
    let rt = runtime();
    for def in thrower_classes() {
        rt.define_class(&def).unwrap();
    }
    let thread = rt.attach_thread();
    let exact = call(&rt, &thread, "app/Thrower", "catchExact", "()I", &[]).unwrap();
    assert_eq!(as_int(exact), 7);
    let by_super = call(&rt, &thread, "app/Thrower", "catchSuper", "()I", &[]).unwrap();
    assert_eq!(as_int(by_super), 7);

    let err = call(&rt, &thread, "app/Thrower", "catchOther", "()I", &[]).unwrap_err();
    assert_eq!(err.exception_class(), Some("app/Oops"));
    let VmError::Uncaught { message, .. } = err else {
        unreachable!();
    };
    assert_eq!(message, None);
}

#[test]
fn test_throwing_null_raises_null_pointer() {
    let rt = runtime();
    for def in thrower_classes() {
        rt.define_class(&def).unwrap();
    }
    let thread = rt.attach_thread();
    let err = call(&rt, &thread, "app/Thrower", "throwNull", "()V", &[]).unwrap_err();
    assert_eq!(err.exception_class(), Some(names::NULL_POINTER_ERROR));
}

#[test]
fn test_missing_callee_raises_linkage_error_in_caller() {
    let rt = runtime();
    rt.define_class(
        &ClassDef::new("app/Broken")
            .method(static_method("callMissing", "()I", 0, |b| {
                b.emit_all([
                    I::InvokeStatic(MethodRef::new("app/Nowhere", "run", "()I")),
                    I::IConst(1),
                    I::IAdd,
                    I::IReturn,
                ]);
            }))
            .method(static_method("guarded", "()I", 0, |b| {
                let start = b.create_label();
                let end = b.create_label();
                let handler = b.create_label();
                b.bind_label(start);
                b.emit_all([
                    I::InvokeStatic(MethodRef::new("app/Broken", "callMissing", "()I")),
                    I::IReturn,
                ]);
                b.bind_label(end);
                b.bind_label(handler);
                b.emit_all([I::Pop, I::IConst(-9), I::IReturn]);
                b.add_handler(start, end, handler, Some(names::LINKAGE_ERROR));
            })),
    )
    .unwrap();
    let thread = rt.attach_thread();
    let caught = call(&rt, &thread, "app/Broken", "guarded", "()I", &[]).unwrap();
    assert_eq!(as_int(caught), -9);
}

// =============================================================================
// Monitors
// =============================================================================

fn locked_class() -> ClassDef {
    ClassDef::new("app/Locked")
        .method(static_method("make", "()Lapp/Locked;", 0, |b| {
            b.emit_all([I::New(ClassRef::new("app/Locked")), I::AReturn]);
        }))
        .method(MethodDef::native("lockDepth", "(Lapp/Locked;)I", MethodFlags::STATIC))
        .method(method("held", "()I", MethodFlags::SYNCHRONIZED, 1, |b| {
            b.emit_all([
                I::ALoad(0),
                I::InvokeStatic(MethodRef::new("app/Locked", "lockDepth", "(Lapp/Locked;)I")),
                I::IReturn,
            ]);
        }))
        .method(method("fail", "()V", MethodFlags::SYNCHRONIZED, 1, |b| {
            b.emit_all([I::IConst(1), I::IConst(0), I::IDiv, I::Pop, I::Return]);
        }))
        .method(static_method("unbalanced", "(Lapp/Locked;)V", 1, |b| {
            b.emit_all([I::ALoad(0), I::MonitorExit, I::Return]);
        }))
}

#[test]
fn test_synchronized_method_holds_monitor_while_running() {
    let rt = runtime();
    rt.natives().register("app/Locked.lockDepth", |call, args| {
        let depth = call.runtime().monitors().owner(args[0]).map_or(0, |(_, count)| count);
        Ok(u64::from(depth))
    });
    rt.define_class(&locked_class()).unwrap();
    let thread = rt.attach_thread();
    let object = call(&rt, &thread, "app/Locked", "make", "()Lapp/Locked;", &[]).unwrap();
    let held = rt.find_method("app/Locked", "held", "()I").unwrap();
    assert_eq!(rt.invoke(&thread, &held, &[object]).map(as_int), Ok(1));
    assert_eq!(rt.monitors().owner(object), None);
    assert_eq!(rt.monitors().held_count(), 0);
}

#[test]
fn test_synchronized_method_releases_monitor_on_unwind() {
    let rt = runtime();
    rt.define_class(&locked_class()).unwrap();
    let thread = rt.attach_thread();
    let object = call(&rt, &thread, "app/Locked", "make", "()Lapp/Locked;", &[]).unwrap();
    let fail = rt.find_method("app/Locked", "fail", "()V").unwrap();
    let err = rt.invoke(&thread, &fail, &[object]).unwrap_err();
    assert_eq!(err.exception_class(), Some(names::ARITHMETIC_ERROR));
    assert_eq!(rt.monitors().held_count(), 0);
}

#[test]
fn test_exit_without_enter_raises_illegal_monitor_state() {
    let rt = runtime();
    rt.define_class(&locked_class()).unwrap();
    let thread = rt.attach_thread();
    let object = call(&rt, &thread, "app/Locked", "make", "()Lapp/Locked;", &[]).unwrap();
    let err = call(&rt, &thread, "app/Locked", "unbalanced", "(Lapp/Locked;)V", &[object])
        .unwrap_err();
    assert_eq!(err.exception_class(), Some(names::ILLEGAL_MONITOR_STATE_ERROR));
}
