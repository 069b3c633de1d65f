//! Throughput of the paths a lock-free interpreter stresses most:
//! suspended generator frames, contended object locks and the collector.
//!   cargo bench --bench vm_benchmark

use std::sync::Arc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use protopy::{CodeObject, Interpreter, VM, VMCreateInfo, Value, assemble};

/// One assembled module plus the VM it runs on. Threads started by the
/// module are reaped after every run so handles do not pile up.
struct Workload {
    vm: VM,
    interp: Interpreter,
    code: Arc<CodeObject>,
}

impl Workload {
    fn new(name: &str, source: &str) -> Self {
        let vm = VM::new(VMCreateInfo::default());
        let interp = Interpreter::new(vm.new_proxy());
        let code = assemble(source, name)
            .unwrap_or_else(|err| panic!("{name} does not assemble: {err}"));
        Self { vm, interp, code }
    }

    fn run(&mut self) -> Value {
        let value = self
            .interp
            .run_code(black_box(self.code.clone()))
            .unwrap_or_else(|err| panic!("{}", err.report()));
        self.vm.join_threads().unwrap();
        value
    }
}

/// Starts four threads on `work` and joins them all. Appended to module
/// sources that define `work`.
const FAN_OUT: &str = r#"
    IMPORT_NAME _thread
    STORE_NAME _thread
    BUILD_LIST 0
    STORE_NAME threads
    LOAD_NAME range
    LOAD_CONST 4
    CALL_FUNCTION 1
    GET_ITER
spawn:
    FOR_ITER spawned
    POP_TOP
    LOAD_NAME _thread
    LOAD_ATTR Thread
    LOAD_NAME work
    LOAD_CONST ("target",)
    CALL_FUNCTION_KW 1
    DUP_TOP
    LOAD_ATTR start
    CALL_FUNCTION 0
    POP_TOP
    LOAD_NAME threads
    LOAD_ATTR append
    ROT_TWO
    CALL_FUNCTION 1
    POP_TOP
    JUMP spawn
spawned:
    LOAD_NAME threads
    GET_ITER
join:
    FOR_ITER joined
    LOAD_ATTR join
    CALL_FUNCTION 0
    POP_TOP
    JUMP join
joined:
"#;

/// sum(relay(relay(squares(range(200))))): every item crosses three
/// suspended frames, two of them through `yield from`.
fn bench_generator_pipeline(c: &mut Criterion) {
    let mut workload = Workload::new(
        "pipeline",
        r#"
.code squares
.args items
.generator
    LOAD_FAST items
    GET_ITER
top:
    FOR_ITER done
    DUP_TOP
    BINARY_OP *
    YIELD_VALUE
    POP_TOP
    JUMP top
done:
    LOAD_CONST None
    RETURN_VALUE
.end
.code relay
.args inner
.generator
    LOAD_FAST inner
    GET_YIELD_FROM_ITER
    LOAD_CONST None
    YIELD_FROM
    RETURN_VALUE
.end
    LOAD_CONST @relay
    MAKE_FUNCTION 0
    STORE_NAME relay
    LOAD_NAME sum
    LOAD_NAME relay
    LOAD_NAME relay
    LOAD_CONST @squares
    MAKE_FUNCTION 0
    LOAD_NAME range
    LOAD_CONST 200
    CALL_FUNCTION 1
    CALL_FUNCTION 1
    CALL_FUNCTION 1
    CALL_FUNCTION 1
    CALL_FUNCTION 1
    RETURN_VALUE
"#,
    );
    assert_eq!(workload.run(), Value::Int(2_646_700));

    c.bench_function("generator_pipeline_200", |b| b.iter(|| workload.run()));
}

/// Four threads bump one counter 250 times each under a shared lock.
fn bench_contended_lock(c: &mut Criterion) {
    let source = format!(
        r#"
.code work
    LOAD_GLOBAL range
    LOAD_CONST 250
    CALL_FUNCTION 1
    GET_ITER
top:
    FOR_ITER done
    POP_TOP
    LOAD_GLOBAL lock
    LOAD_ATTR acquire
    CALL_FUNCTION 0
    POP_TOP
    LOAD_GLOBAL counter
    LOAD_CONST 0
    DUP_TOP_TWO
    BINARY_SUBSCR
    LOAD_CONST 1
    INPLACE_OP +
    ROT_THREE
    STORE_SUBSCR
    LOAD_GLOBAL lock
    LOAD_ATTR release
    CALL_FUNCTION 0
    POP_TOP
    JUMP top
done:
    LOAD_CONST None
    RETURN_VALUE
.end
    IMPORT_NAME _thread
    LOAD_ATTR Lock
    CALL_FUNCTION 0
    STORE_NAME lock
    LOAD_CONST 0
    BUILD_LIST 1
    STORE_NAME counter
    LOAD_CONST @work
    MAKE_FUNCTION 0
    STORE_NAME work
{FAN_OUT}
    LOAD_NAME counter
    LOAD_CONST 0
    BINARY_SUBSCR
    RETURN_VALUE
"#
    );
    let mut workload = Workload::new("contended_lock", &source);
    assert_eq!(workload.run(), Value::Int(1000));

    c.bench_function("contended_lock_4x250", |b| b.iter(|| workload.run()));
}

/// Four threads append to one list with no lock but the list's own.
fn bench_concurrent_append(c: &mut Criterion) {
    let source = format!(
        r#"
.code work
    LOAD_GLOBAL range
    LOAD_CONST 250
    CALL_FUNCTION 1
    GET_ITER
top:
    FOR_ITER done
    LOAD_GLOBAL items
    LOAD_ATTR append
    ROT_TWO
    CALL_FUNCTION 1
    POP_TOP
    JUMP top
done:
    LOAD_CONST None
    RETURN_VALUE
.end
    BUILD_LIST 0
    STORE_NAME items
    LOAD_CONST @work
    MAKE_FUNCTION 0
    STORE_NAME work
{FAN_OUT}
    LOAD_NAME len
    LOAD_NAME items
    CALL_FUNCTION 1
    RETURN_VALUE
"#
    );
    let mut workload = Workload::new("concurrent_append", &source);
    assert_eq!(workload.run(), Value::Int(1000));

    c.bench_function("concurrent_append_4x250", |b| b.iter(|| workload.run()));
}

/// Self-referencing lists only a full collection reclaims.
fn bench_cycle_collection(c: &mut Criterion) {
    let mut workload = Workload::new(
        "cycles",
        r#"
    LOAD_NAME range
    LOAD_CONST 200
    CALL_FUNCTION 1
    GET_ITER
top:
    FOR_ITER done
    POP_TOP
    BUILD_LIST 0
    DUP_TOP
    LOAD_ATTR append
    ROT_TWO
    CALL_FUNCTION 1
    POP_TOP
    JUMP top
done:
    IMPORT_NAME gc
    LOAD_ATTR collect
    CALL_FUNCTION 0
    RETURN_VALUE
"#,
    );
    workload.run();

    c.bench_function("self_cycles_200_collect", |b| b.iter(|| workload.run()));
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(20);
    targets = bench_generator_pipeline, bench_contended_lock, bench_concurrent_append, bench_cycle_collection
}

criterion_main!(benches);
