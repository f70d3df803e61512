//! End-to-end session behaviour over the CPU reference driver.

use cl_offload::host::{Fault, HostArg};
use cl_offload::kernels::{VECTOR_ADD, VECTOR_ADD_SRC, bundled};
use cl_offload::{
    ClStatus, DeviceTypeSetting, HostCall, HostDriver, HostPlatformSpec, LifecycleEvent,
    MemorySink, OffloadConfig, OffloadError, Resource, Session, Step,
};

const VECTOR_MUL: &str = "vector_mul";
const VECTOR_MUL_SRC: &str = r#"
__kernel void vector_mul(const int n,
                         __global const float* a,
                         __global const float* b,
                         __global float* out)
{
    int gid = get_global_id(0);
    if (gid < n) {
        out[gid] = a[gid] * b[gid];
    }
}
"#;

fn driver() -> HostDriver {
    HostDriver::single_cpu()
        .with_host_kernel(VECTOR_ADD, |a, b| a + b)
        .with_host_kernel(VECTOR_MUL, |a, b| a * b)
}

fn open(sink: &MemorySink) -> Session<HostDriver, &MemorySink> {
    Session::open(driver(), &OffloadConfig::default(), sink)
        .expect("open session")
        .with_source_store(bundled())
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[test]
fn vector_add_of_three_elements() {
    let sink = MemorySink::new();
    let mut session = open(&sink);
    session.load_kernel(VECTOR_ADD).unwrap();
    let out = session.dispatch(3, &[1.0, 2.0, 3.0], &[10.0, 20.0, 30.0]).unwrap();
    assert_eq!(out, vec![11.0, 22.0, 33.0]);
    session.shutdown().unwrap();
}

#[test]
fn zero_count_is_a_degenerate_dispatch() {
    let sink = MemorySink::new();
    let mut session = open(&sink);
    session.load_kernel(VECTOR_ADD).unwrap();
    let out = session.dispatch(0, &[], &[]).unwrap();
    assert!(out.is_empty());
    let stats = session.driver().stats();
    assert_eq!(stats.created(Resource::Buffer), 3);
    assert_eq!(stats.released(Resource::Buffer), 3);
}

#[test]
fn n_dispatches_create_and_release_three_n_buffers() {
    let sink = MemorySink::new();
    let mut session = open(&sink);
    session.load_kernel(VECTOR_ADD).unwrap();
    for i in 0..5 {
        let x = i as f32;
        assert_eq!(session.dispatch(2, &[x, x], &[1.0, 2.0]).unwrap(), vec![x + 1.0, x + 2.0]);
    }
    let stats = session.driver().stats();
    assert_eq!(stats.created(Resource::Buffer), 15);
    assert_eq!(stats.released(Resource::Buffer), 15);
    assert_eq!(sink.count(|e| matches!(e, LifecycleEvent::DispatchCompleted { .. })), 5);
}

#[test]
fn driver_sees_scalar_then_three_buffers() {
    let sink = MemorySink::new();
    let mut session = open(&sink);
    session.load_kernel(VECTOR_ADD).unwrap();
    session.driver().clear_calls();
    session.dispatch(4, &[0.0; 4], &[0.0; 4]).unwrap();

    let calls = session.driver().calls();
    let buffers: Vec<u64> = calls
        .iter()
        .filter_map(|c| match c {
            HostCall::CreateBuffer { id, size_bytes } => {
                assert_eq!(*size_bytes, 16);
                Some(*id)
            }
            _ => None,
        })
        .collect();
    let args: Vec<HostArg> = calls
        .iter()
        .filter_map(|c| match c {
            HostCall::SetKernelArg { arg, .. } => Some(*arg),
            _ => None,
        })
        .collect();
    assert_eq!(
        args,
        vec![
            HostArg::Int(4),
            HostArg::Buffer(buffers[0]),
            HostArg::Buffer(buffers[1]),
            HostArg::Buffer(buffers[2]),
        ]
    );
}

// ---------------------------------------------------------------------------
// Kernel slot
// ---------------------------------------------------------------------------

#[test]
fn compile_failure_keeps_previous_kernel() {
    let sink = MemorySink::new();
    let mut session = open(&sink);
    session.load_kernel(VECTOR_ADD).unwrap();

    let err = session
        .load_kernel_from_source(VECTOR_ADD, "__kernel void vector_add(const int n) {")
        .unwrap_err();
    match &err {
        OffloadError::Compilation { kernel, log, .. } => {
            assert_eq!(kernel, VECTOR_ADD);
            assert!(log.contains("unbalanced"), "{log}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!err.is_fatal());

    assert_eq!(session.kernel_name(), Some(VECTOR_ADD));
    assert_eq!(session.dispatch(1, &[1.0], &[2.0]).unwrap(), vec![3.0]);
    assert_eq!(session.driver().stats().live(Resource::Program), 0);
}

#[test]
fn missing_entry_point_keeps_previous_kernel() {
    let sink = MemorySink::new();
    let mut session = open(&sink);
    session.load_kernel(VECTOR_ADD).unwrap();

    let err = session.load_kernel_from_source("vector_sub", VECTOR_ADD_SRC).unwrap_err();
    assert!(matches!(err, OffloadError::EntryPointNotFound { .. }));
    assert_eq!(err.step(), Step::CreateKernel);
    assert_eq!(session.dispatch(1, &[1.0], &[2.0]).unwrap(), vec![3.0]);
}

#[test]
fn unknown_kernel_name_is_source_not_found() {
    let sink = MemorySink::new();
    let mut session = open(&sink);
    let err = session.load_kernel("does_not_exist").unwrap_err();
    assert!(matches!(err, OffloadError::SourceNotFound { .. }));
    assert_eq!(session.driver().stats().created(Resource::Program), 0);
}

#[test]
fn loading_a_second_kernel_replaces_the_first() {
    let sink = MemorySink::new();
    let mut session = open(&sink);
    session.load_kernel(VECTOR_ADD).unwrap();
    session.load_kernel_from_source(VECTOR_MUL, VECTOR_MUL_SRC).unwrap();

    assert_eq!(session.kernel_name(), Some(VECTOR_MUL));
    assert_eq!(session.dispatch(2, &[2.0, 3.0], &[4.0, 5.0]).unwrap(), vec![8.0, 15.0]);
    let stats = session.driver().stats();
    assert_eq!(stats.created(Resource::Kernel), 2);
    assert_eq!(stats.live(Resource::Kernel), 1);
    assert!(sink.events().contains(&LifecycleEvent::KernelReplaced {
        previous: VECTOR_ADD.into(),
        kernel: VECTOR_MUL.into(),
    }));
}

#[test]
fn replacement_survives_failed_release_of_old_kernel() {
    let sink = MemorySink::new();
    let mut session = open(&sink);
    session.load_kernel(VECTOR_ADD).unwrap();
    session.driver().inject(Fault::Release(Resource::Kernel, ClStatus::InvalidKernel));

    session.load_kernel_from_source(VECTOR_MUL, VECTOR_MUL_SRC).unwrap();
    assert_eq!(session.kernel_name(), Some(VECTOR_MUL));
    assert_eq!(session.dispatch(2, &[2.0, 3.0], &[4.0, 5.0]).unwrap(), vec![8.0, 15.0]);
    assert_eq!(sink.count(|e| matches!(e, LifecycleEvent::KernelLoaded { .. })), 2);
    assert!(sink.events().contains(&LifecycleEvent::KernelReplaced {
        previous: VECTOR_ADD.into(),
        kernel: VECTOR_MUL.into(),
    }));
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[test]
fn shutdown_leaves_nothing_allocated() {
    let sink = MemorySink::new();
    let mut session = open(&sink);
    session.load_kernel(VECTOR_ADD).unwrap();
    session.dispatch(3, &[1.0; 3], &[1.0; 3]).unwrap();
    session.shutdown().unwrap();
    assert_eq!(session.driver().stats().live_total(), 0);
}

#[test]
fn use_after_shutdown_is_session_closed() {
    let sink = MemorySink::new();
    let mut session = open(&sink);
    session.load_kernel(VECTOR_ADD).unwrap();
    session.shutdown().unwrap();

    for err in [
        session.shutdown().unwrap_err(),
        session.dispatch(1, &[1.0], &[1.0]).unwrap_err(),
        session.load_kernel(VECTOR_ADD).unwrap_err(),
    ] {
        assert!(matches!(err, OffloadError::SessionClosed));
        assert!(err.is_fatal());
    }
    assert_eq!(sink.count(|e| *e == LifecycleEvent::ShutdownCompleted), 1);
}

#[test]
fn open_fails_without_platforms() {
    let driver = HostDriver::with_platforms(vec![]);
    let err = Session::open(driver, &OffloadConfig::default(), MemorySink::new()).unwrap_err();
    assert!(matches!(err, OffloadError::NoPlatform { .. }));
    assert_eq!(err.step(), Step::EnumeratePlatforms);
}

#[test]
fn config_selects_platform_and_device_type() {
    let driver = HostDriver::with_platforms(vec![
        HostPlatformSpec::new("first").cpu("cpu"),
        HostPlatformSpec::new("second").cpu("cpu").gpu("gpu"),
    ])
    .with_host_kernel(VECTOR_ADD, |a, b| a + b);
    let config = OffloadConfig {
        platform_index: 1,
        device_type: DeviceTypeSetting::Gpu,
        ..Default::default()
    };
    let sink = MemorySink::new();
    let mut session = Session::open(driver, &config, &sink).unwrap();
    let selected = LifecycleEvent::DeviceSelected { index: 0, name: "gpu".into() };
    assert!(sink.events().contains(&selected));
    session.load_kernel_from_source(VECTOR_ADD, VECTOR_ADD_SRC).unwrap();
    assert_eq!(session.dispatch(1, &[1.0], &[1.0]).unwrap(), vec![2.0]);
}
