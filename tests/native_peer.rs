use libc::c_void;
use mama_bridge::ffi::{NativeHandle, RawStatus};
use mama_bridge::Core::{BridgeError, Disposal, Ownership, PeerHandle, Status};
use serial_test::serial;
use std::sync::atomic::{AtomicUsize, Ordering};

static DESTROYED: AtomicUsize = AtomicUsize::new(0);
static FAILING_CALLS: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn counting_destroy(_handle: NativeHandle) -> RawStatus {
    DESTROYED.fetch_add(1, Ordering::SeqCst);
    0
}

// Fails the first time, succeeds afterwards
unsafe extern "C" fn flaky_destroy(_handle: NativeHandle) -> RawStatus {
    if FAILING_CALLS.fetch_add(1, Ordering::SeqCst) == 0 {
        4
    } else {
        DESTROYED.fetch_add(1, Ordering::SeqCst);
        0
    }
}

fn fake_handle(addr: usize) -> NativeHandle {
    NativeHandle::from_raw(addr as *mut c_void)
}

fn allocate(addr: usize) -> impl FnOnce(*mut NativeHandle) -> RawStatus {
    move |out| {
        unsafe { *out = fake_handle(addr) };
        0
    }
}

fn reset() {
    DESTROYED.store(0, Ordering::SeqCst);
    FAILING_CALLS.store(0, Ordering::SeqCst);
}

#[test]
#[serial]
fn create_destroy_destroy_runs_destructor_once() {
    reset();
    let peer = PeerHandle::new("test", counting_destroy);
    peer.create(allocate(0x1000)).unwrap();

    assert_eq!(peer.dispose().unwrap(), Disposal::Destroy);
    assert_eq!(peer.dispose().unwrap(), Disposal::Noop);
    drop(peer);

    assert_eq!(DESTROYED.load(Ordering::SeqCst), 1);
}

#[test]
#[serial]
fn use_before_create_is_rejected() {
    reset();
    let peer = PeerHandle::new("test", counting_destroy);
    assert_eq!(peer.ensure_created(), Err(BridgeError::NotInitialized));
    assert_eq!(peer.dispose().unwrap(), Disposal::Noop);
    drop(peer);
    assert_eq!(DESTROYED.load(Ordering::SeqCst), 0);
}

#[test]
#[serial]
fn second_create_fails() {
    reset();
    let peer = PeerHandle::new("test", counting_destroy);
    peer.create(allocate(0x2000)).unwrap();
    assert_eq!(peer.create(allocate(0x3000)), Err(BridgeError::AlreadyCreated));
    assert_eq!(peer.handle(), fake_handle(0x2000));
}

#[test]
#[serial]
fn failed_allocation_leaves_peer_unbound() {
    reset();
    let peer = PeerHandle::new("test", counting_destroy);
    assert_eq!(peer.create(|_| 1), Err(BridgeError::Native(Status::NoMem)));
    assert_eq!(peer.create(|_| 0), Err(BridgeError::Native(Status::NullArg)));
    assert!(peer.handle().is_null());
    drop(peer);
    assert_eq!(DESTROYED.load(Ordering::SeqCst), 0);
}

#[test]
#[serial]
fn drop_releases_owned_peer() {
    reset();
    {
        let peer = PeerHandle::new("test", counting_destroy);
        peer.create(allocate(0x4000)).unwrap();
    }
    assert_eq!(DESTROYED.load(Ordering::SeqCst), 1);
}

#[test]
#[serial]
fn view_never_destroys() {
    reset();
    let view = PeerHandle::view("test", fake_handle(0x5000));
    assert_eq!(view.ownership(), Ownership::NotOwned);
    assert!(view.set_self_managed(true).is_err());
    assert_eq!(view.dispose().unwrap(), Disposal::Detached);
    drop(view);

    let lent = PeerHandle::from_native("test", counting_destroy, fake_handle(0x5100), Ownership::NotOwned);
    drop(lent);
    assert_eq!(DESTROYED.load(Ordering::SeqCst), 0);
}

#[test]
#[serial]
fn self_managed_toggle_controls_destruction() {
    reset();
    let peer = PeerHandle::from_native("test", counting_destroy, fake_handle(0x6000), Ownership::Owned);
    peer.set_self_managed(false).unwrap();
    drop(peer);
    assert_eq!(DESTROYED.load(Ordering::SeqCst), 0);

    let peer = PeerHandle::from_native("test", counting_destroy, fake_handle(0x6100), Ownership::NotOwned);
    peer.set_self_managed(true).unwrap();
    drop(peer);
    assert_eq!(DESTROYED.load(Ordering::SeqCst), 1);
}

#[test]
#[serial]
fn engine_owned_peer_survives_disposal_until_reclaimed() {
    reset();
    let peer = PeerHandle::new("test", counting_destroy);
    peer.create(allocate(0x7000)).unwrap();

    assert!(peer.hand_to_engine().unwrap());
    assert_eq!(peer.ownership(), Ownership::EngineOwned);
    assert_eq!(peer.dispose().unwrap(), Disposal::Deferred);
    assert_eq!(DESTROYED.load(Ordering::SeqCst), 0, "destroyed while the engine held it");

    // Completion: the parked disposal runs now, exactly once
    peer.reclaim_from_engine().unwrap();
    assert_eq!(DESTROYED.load(Ordering::SeqCst), 1);
    assert!(peer.is_released());
    assert_eq!(peer.dispose().unwrap(), Disposal::Noop);
    drop(peer);
    assert_eq!(DESTROYED.load(Ordering::SeqCst), 1);
}

#[test]
#[serial]
fn reclaimed_peer_is_destroyable_again() {
    reset();
    let peer = PeerHandle::new("test", counting_destroy);
    peer.create(allocate(0x8000)).unwrap();

    peer.hand_to_engine().unwrap();
    assert!(peer.hand_to_engine().is_err(), "handed over twice");
    peer.reclaim_from_engine().unwrap();
    assert_eq!(peer.ownership(), Ownership::Owned);
    assert_eq!(DESTROYED.load(Ordering::SeqCst), 0);

    assert_eq!(peer.dispose().unwrap(), Disposal::Destroy);
    assert_eq!(DESTROYED.load(Ordering::SeqCst), 1);
}

#[test]
#[serial]
fn failed_destroy_keeps_peer_bound() {
    reset();
    let peer = PeerHandle::new("test", flaky_destroy);
    peer.create(allocate(0x9000)).unwrap();

    assert_eq!(peer.dispose(), Err(BridgeError::Native(Status::InvalidArg)));
    assert_eq!(peer.ensure_created(), Ok(fake_handle(0x9000)));

    assert_eq!(peer.dispose().unwrap(), Disposal::Destroy);
    assert_eq!(DESTROYED.load(Ordering::SeqCst), 1);
}

#[test]
#[serial]
fn rebinding_a_view_walks_handles() {
    reset();
    let view = PeerHandle::view("field", NativeHandle::NULL);
    for addr in [0xa000usize, 0xa010, 0xa020] {
        view.set_native_handle(fake_handle(addr));
        assert_eq!(view.ensure_created(), Ok(fake_handle(addr)));
    }
    println!("{:?}", view);
}
