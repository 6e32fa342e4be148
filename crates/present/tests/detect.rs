mod common;

use core::{sync::atomic::Ordering, time::Duration};
use std::thread;

use asdf_present::{Api, DetectOutcome, Phase};
use common::*;

fn confirmed_api(outcome: &DetectOutcome) -> Api {
    outcome.backend().expect("confirmed backend").api()
}

#[test]
fn nothing_loaded_times_out() {
    let fx = Fixture::new();
    let session = fx.session();

    let outcome = session
        .detect(Duration::ZERO)
        .wait_timeout(Duration::from_secs(5))
        .expect("resolved");

    assert!(matches!(outcome, DetectOutcome::TimedOut));
    assert_eq!(session.phase(), Phase::TimedOut);
    assert_eq!(fx.patcher.total_installs(), 0);
}

#[test]
fn gl_swap_confirms_opengl() {
    let fx = Fixture::new();
    fx.modules.load_wgl(0x61, &[]);
    let session = fx.session();

    let pending = session.detect_default();
    let outcome = drive(&pending, || {
        swap_buffers();
    });

    let backend = outcome.backend().expect("confirmed backend");
    assert_eq!(backend.api(), Api::OpenGl);
    assert!(backend.is_attached());
    // swap, swap layer and delete context
    assert_eq!(backend.hook_count(), 3);
    assert_eq!(session.probe_hook_count(), 0);
    assert_eq!(session.phase(), Phase::Confirmed);

    let renders = fx.overlay.renders();
    swap_buffers();
    assert_eq!(fx.overlay.renders(), renders + 1);
}

#[test]
fn swap_chain_device_selects_direct3d_version() {
    for (devices, api) in [
        (&[IID_D3D11_DEVICE][..], Api::Dx11),
        (&[IID_D3D10_DEVICE][..], Api::Dx10),
        (&[IID_D3D11_DEVICE, IID_D3D10_DEVICE][..], Api::Dx11),
    ] {
        let fx = Fixture::new();
        let swapchain = fx.with_dxgi(devices);
        let session = fx.session();

        let pending = session.detect_default();
        let outcome = drive(&pending, || {
            present(swapchain, 0);
        });

        assert_eq!(confirmed_api(&outcome), api);
        session.shutdown();
    }
}

#[test]
fn direct3d12_needs_command_queue() {
    let fx = Fixture::new();
    let swapchain = fx.with_dxgi(&[IID_D3D12_DEVICE, IID_D3D11_DEVICE]);
    fx.with_queue();
    let session = fx.session();

    let pending = session.detect_default();
    let outcome = drive(&pending, || {
        present(swapchain, 0);
    });

    let backend = outcome.backend().expect("confirmed backend");
    assert_eq!(backend.api(), Api::Dx12);
    // present, present1, resize buffers, resize buffers1 and execute command lists
    assert_eq!(backend.hook_count(), 5);
}

#[test]
fn unknown_swap_chain_device_does_not_confirm() {
    let fx = Fixture::new();
    let swapchain = fx.with_dxgi(&[]);
    let session = fx.session();

    let pending = session.detect(Duration::from_millis(200));
    let outcome = drive(&pending, || {
        present(swapchain, 0);
    });

    assert!(matches!(outcome, DetectOutcome::TimedOut));
    assert!(CALLS.present.load(Ordering::SeqCst) > 0);
}

#[test]
fn old_gl_version_exhausts_candidate() {
    let fx = Fixture::new();
    set_gl_version(c"2.1 Mesa 9.0");
    fx.modules.load_wgl(0x61, &[]);
    let session = fx.session();
    let target = wgl_swap_buffers_target();

    let pending = session.detect(Duration::from_millis(300));
    assert!(wait_until(Duration::from_secs(5), || fx.patcher.is_hooked(target)));

    let outcome = drive(&pending, || {
        swap_buffers();
    });

    assert!(matches!(outcome, DetectOutcome::TimedOut));
    assert!(!fx.patcher.is_hooked(target));
    // not probed again while the module stays loaded
    assert_eq!(fx.patcher.installs_of(target), 1);
}

#[test]
fn present_test_flag_is_ignored() {
    let fx = Fixture::new();
    let swapchain = fx.with_dxgi(&[IID_D3D11_DEVICE]);
    let session = fx.session();

    let pending = session.detect_default();
    assert!(wait_until(Duration::from_secs(5), || {
        fx.patcher.is_hooked(present_target())
    }));

    for _ in 0..20 {
        present(swapchain, DXGI_PRESENT_TEST);
    }
    thread::sleep(Duration::from_millis(30));
    assert!(pending.try_outcome().is_none());

    let outcome = drive(&pending, || {
        present(swapchain, 0);
    });
    assert_eq!(confirmed_api(&outcome), Api::Dx11);
}

#[test]
fn dxgi_present_inside_gl_swap_is_ignored() {
    let fx = Fixture::new();
    let swapchain = fx.with_dxgi(&[IID_D3D11_DEVICE]);
    fx.modules.load_wgl(0x61, &[]);
    present_inside_swap(Some(swapchain));
    let session = fx.session();

    let pending = session.detect_default();
    assert!(wait_until(Duration::from_secs(5), || {
        fx.patcher.is_hooked(present_target()) && fx.patcher.is_hooked(wgl_swap_buffers_target())
    }));

    let outcome = drive(&pending, || {
        swap_buffers();
    });

    assert_eq!(confirmed_api(&outcome), Api::OpenGl);
    assert!(CALLS.present.load(Ordering::SeqCst) > 0);
}

#[test]
fn offscreen_failure_does_not_block_other_candidates() {
    let fx = Fixture::new();
    // dxgi loaded, but no offscreen swap chain can be created
    fx.modules.load("dxgi.dll", 0xd61, &[]);
    fx.modules.load_wgl(0x61, &[]);
    let session = fx.session();

    let pending = session.detect_default();
    let outcome = drive(&pending, || {
        swap_buffers();
    });

    assert_eq!(confirmed_api(&outcome), Api::OpenGl);
}

#[test]
fn failed_attach_resumes_probing() {
    let fx = Fixture::new();
    fx.modules.load_wgl(0x61, &[c"wglDeleteContext"]);
    let device = fx.with_d3d9();
    let session = fx.session();
    let target = wgl_swap_buffers_target();

    let pending = session.detect_default();
    assert!(wait_until(Duration::from_secs(5), || fx.patcher.is_hooked(target)));

    // the wgl probe confirms, its backend cannot attach without wglDeleteContext
    assert!(wait_until(Duration::from_secs(5), || {
        swap_buffers();
        !fx.patcher.is_hooked(target)
    }));
    assert!(pending.try_outcome().is_none());

    let outcome = drive(&pending, || {
        end_scene(device);
    });

    assert_eq!(confirmed_api(&outcome), Api::Dx9);
    assert_eq!(fx.patcher.installs_of(target), 1);
}

#[test]
fn failed_hook_install_removes_partial_probe() {
    let fx = Fixture::new();
    fx.with_dxgi(&[IID_D3D11_DEVICE]);
    fx.modules.load_wgl(0x61, &[]);
    // Present1 cannot be patched, the Present probe must not stay behind
    fx.patcher.fail(present1_target());
    let session = fx.session();

    let pending = session.detect_default();
    let outcome = drive(&pending, || {
        swap_buffers();
    });

    assert_eq!(confirmed_api(&outcome), Api::OpenGl);
    assert!(!fx.patcher.is_hooked(present_target()));
    assert_eq!(fx.patcher.installs_of(present_target()), 1);
}

#[test]
fn reloaded_module_is_probed_again() {
    let fx = Fixture::new();
    set_gl_version(c"2.1 Mesa 9.0");
    fx.modules.load_wgl(0x61, &[]);
    let session = fx.session();
    let target = wgl_swap_buffers_target();

    let pending = session.detect_default();
    assert!(wait_until(Duration::from_secs(5), || fx.patcher.is_hooked(target)));
    assert!(wait_until(Duration::from_secs(5), || {
        swap_buffers();
        !fx.patcher.is_hooked(target)
    }));

    set_gl_version(c"4.6.0 Fake");
    fx.modules.unload("opengl32.dll");
    fx.modules.load_wgl(0x62, &[]);
    assert!(wait_until(Duration::from_secs(5), || {
        fx.patcher.installs_of(target) == 2
    }));

    let outcome = drive(&pending, || {
        swap_buffers();
    });
    assert_eq!(confirmed_api(&outcome), Api::OpenGl);
}

#[test]
fn glx_swap_confirms_glx() {
    let fx = Fixture::new();
    fx.modules.load_glx(0x91);
    let session = fx.session();

    let outcome = drive(&session.detect_default(), || {
        glx_swap_buffers(0xd15, 0x42);
    });

    let backend = outcome.backend().expect("confirmed backend");
    assert_eq!(backend.api(), Api::Glx);
    // swap and destroy context
    assert_eq!(backend.hook_count(), 2);
    assert!(fx.patcher.is_hooked(glx_swap_buffers_target()));

    let renders = fx.overlay.renders();
    glx_swap_buffers(0xd15, 0x42);
    assert_eq!(fx.overlay.renders(), renders + 1);
}

#[test]
fn vulkan_present_on_captured_queue_confirms() {
    let fx = Fixture::new();
    fx.modules.load_vulkan(0x7b);
    let session = fx.session();

    let pending = session.detect_default();
    let (_, queue, swapchain) = vk_host(&fx.patcher);
    let outcome = drive(&pending, || {
        vk_queue_present(queue, swapchain);
    });

    let backend = outcome.backend().expect("confirmed backend");
    assert_eq!(backend.api(), Api::Vulkan);
    // present, destroy swap chain and the three capture hooks
    assert_eq!(backend.hook_count(), 5);
    assert_eq!(session.probe_hook_count(), 0);

    let renders = fx.overlay.renders();
    vk_queue_present(queue, swapchain);
    assert_eq!(fx.overlay.renders(), renders + 1);
}

#[test]
fn queue_retrieved_before_detection_exhausts_vulkan() {
    let fx = Fixture::new();
    fx.modules.load_vulkan(0x7b);
    // the host set up its device before anything was hooked
    let device = vk_create_device();
    let queue = vk_get_device_queue(device);
    let swapchain = vk_create_swapchain(device);
    let session = fx.session();

    let outcome = drive(&session.detect(Duration::from_millis(300)), || {
        vk_queue_present(queue, swapchain);
    });

    assert!(matches!(outcome, DetectOutcome::TimedOut));
    assert!(CALLS.vk_queue_present.load(Ordering::SeqCst) > 0);
    assert_eq!(fx.patcher.installs_of(vk_queue_present_target()), 1);
    assert!(!fx.patcher.is_hooked(vk_queue_present_target()));
    assert!(!fx.patcher.is_hooked(vk_get_device_queue_target()));
    assert_eq!(fx.stats().attempts.load(Ordering::SeqCst), 0);
}

#[test]
fn metal_present_confirms_metal() {
    // with and without the drawable class exported by name
    for named_class in [true, false] {
        let fx = Fixture::new();
        fx.modules.load_metal(named_class);
        let session = fx.session();

        let outcome = drive(&session.detect_default(), || {
            metal_present(METAL_DRAWABLE);
        });

        assert_eq!(confirmed_api(&outcome), Api::Metal);
        assert!(fx.patcher.is_hooked(metal_present_target()));
        assert_eq!(OPEN_POOLS.load(Ordering::SeqCst), 0);

        let renders = fx.overlay.renders();
        metal_present(METAL_DRAWABLE);
        assert_eq!(fx.overlay.renders(), renders + 1);
    }
}
