mod common;

use common::{adapter, hwnd_ok, test_config, MockCompositor};
use interop_core::device::AdapterKind;
use interop_core::hdr::OutputLuminance;
use interop_core::{
    BridgeState, CompositorBridge, Extent, FrameBridge, FrameStatus, InitArgs, InitStage,
    InteropError,
};

fn ready_bridge(mock: MockCompositor) -> CompositorBridge<MockCompositor> {
    let mut b = CompositorBridge::new(mock, test_config());
    b.on_init(InitArgs::new(Extent::new(1920, 1080), hwnd_ok))
        .expect("init");
    b
}

#[test]
fn frame_registers_draws_and_presents() {
    let mut b = ready_bridge(MockCompositor::new());
    let start = b.backend().calls.len();

    assert_eq!(b.on_loop().unwrap(), FrameStatus::Ready);
    assert_eq!(b.state(), BridgeState::RenderingFrame);
    assert_eq!(b.framebuffer(), 7);
    assert_eq!(b.swap_buffers().unwrap(), FrameStatus::Ready);
    assert_eq!(b.state(), BridgeState::Ready);

    assert_eq!(
        &b.backend().calls[start..],
        [
            "register_targets",
            "bind_framebuffer",
            "unregister_targets",
            "present"
        ]
    );
}

#[test]
fn registration_is_retried_once() {
    let mut mock = MockCompositor::new();
    mock.register_failures = 1;
    let mut b = ready_bridge(mock);

    assert_eq!(b.on_loop().unwrap(), FrameStatus::Ready);
    assert_eq!(b.registration_retries(), 1);
    assert_eq!(b.backend().count("register_targets"), 2);
    assert_eq!(b.swap_buffers().unwrap(), FrameStatus::Ready);
}

#[test]
fn second_registration_failure_drops_the_frame() {
    let mut mock = MockCompositor::new();
    mock.register_failures = 2;
    let mut b = ready_bridge(mock);

    assert_eq!(b.on_loop().unwrap(), FrameStatus::Skipped);
    assert_eq!(b.state(), BridgeState::Ready);
    assert!(matches!(
        b.last_transient(),
        Some(InteropError::FrameAcquireFailed { .. })
    ));
    assert!(!b.backend().registered);

    assert_eq!(b.swap_buffers().unwrap(), FrameStatus::Skipped);
    assert_eq!(b.backend().count("present"), 0);

    assert_eq!(b.on_loop().unwrap(), FrameStatus::Ready);
    assert_eq!(b.swap_buffers().unwrap(), FrameStatus::Ready);
}

#[test]
fn resize_rebuilds_targets_in_order() {
    let mut b = ready_bridge(MockCompositor::new());
    let start = b.backend().calls.len();
    b.on_resize(800, 600).unwrap();
    assert_eq!(
        &b.backend().calls[start..],
        [
            "release_targets",
            "resize_buffers",
            "set_viewport",
            "create_targets"
        ]
    );
    assert_eq!(b.extent(), Extent::new(800, 600));
    assert_eq!(b.backend().extent, Extent::new(800, 600));

    b.on_resize(800, 600).unwrap();
    assert_eq!(b.backend().count("resize_buffers"), 1);
}

#[test]
fn zero_resize_is_clamped() {
    let mut b = ready_bridge(MockCompositor::new());
    b.on_resize(0, 0).unwrap();
    assert_eq!(b.extent(), Extent::MIN);
}

#[test]
fn resize_mid_frame_waits_for_present() {
    let mut b = ready_bridge(MockCompositor::new());
    b.on_loop().unwrap();
    b.on_resize(1024, 768).unwrap();
    assert_eq!(b.backend().count("resize_buffers"), 0);

    assert_eq!(b.swap_buffers().unwrap(), FrameStatus::Skipped);
    let present = b.backend().calls.iter().rposition(|c| c == "present");
    let resize = b.backend().calls.iter().rposition(|c| c == "resize_buffers");
    assert!(present < resize);
    assert_eq!(b.extent(), Extent::new(1024, 768));
}

#[test]
fn depth_buffer_follows_config() {
    let mut b = CompositorBridge::new(
        MockCompositor::new(),
        test_config().with_depth_buffer(true),
    );
    b.on_init(InitArgs::new(Extent::new(640, 480), hwnd_ok))
        .unwrap();
    assert!(b.backend().depth);
    b.on_resize(320, 240).unwrap();
    assert!(b.backend().depth);
}

#[test]
fn hdr_query_is_cached_per_output() {
    let mut mock = MockCompositor::new();
    mock.luminance.insert(
        0,
        OutputLuminance {
            bt2020: true,
            max_luminance_nits: 600.0,
            sdr_white_level_raw: 3000,
        },
    );
    let mut b = ready_bridge(mock);

    let props = b.hdr_properties(0).unwrap();
    assert!(props.is_hdr);
    assert_eq!(props.sdr_white_level_nits, 240.0);
    assert_eq!(props.headroom, 2.5);

    assert!(b.hdr_properties(0).is_none());
    assert!(b.hdr_properties(1).is_none());
    assert!(b.hdr_properties(0).is_some());
    assert_eq!(b.backend().count("output_luminance"), 3);
}

#[test]
fn software_adapter_is_rejected() {
    let mut mock = MockCompositor::new();
    mock.adapters = vec![adapter(0, AdapterKind::Software, 16384)];
    let mut b = CompositorBridge::new(mock, test_config());
    let err = b
        .on_init(InitArgs::new(Extent::new(640, 480), hwnd_ok))
        .unwrap_err();
    assert!(matches!(
        err,
        InteropError::InitFailed {
            stage: InitStage::DeviceSelection,
            ..
        }
    ));
    assert_eq!(b.backend().count("create_device"), 0);
}

#[test]
fn partial_init_failure_is_cleaned_up_once() {
    let mut mock = MockCompositor::new();
    mock.fail.insert("open_interop");
    let mut b = CompositorBridge::new(mock, test_config());
    let err = b
        .on_init(InitArgs::new(Extent::new(640, 480), hwnd_ok))
        .unwrap_err();
    assert!(matches!(
        err,
        InteropError::InitFailed {
            stage: InitStage::LegacyTargets,
            ..
        }
    ));
    assert_eq!(b.backend().count("destroy"), 1);

    b.on_destroy();
    b.on_destroy();
    assert_eq!(b.state(), BridgeState::Destroyed);
    assert_eq!(b.backend().count("destroy"), 1);
}

#[test]
fn destroy_mid_frame_unregisters_first() {
    let mut b = ready_bridge(MockCompositor::new());
    b.on_loop().unwrap();
    b.on_destroy();
    let calls = &b.backend().calls;
    let unregister = calls.iter().rposition(|c| c == "unregister_targets");
    let destroy = calls.iter().rposition(|c| c == "destroy");
    assert!(unregister.is_some() && unregister < destroy);
    assert!(!b.backend().registered);
}
