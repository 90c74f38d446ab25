mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use common::{export, raw, surface, Fixture, StubLoader};
use uniproxy::error::{DispatchError, RegistrationError};
use uniproxy::library::ExportDescriptor;
use uniproxy::{ExportFn, ExportState, Forward, Phase, Proxy, Slot, Surface, UnresolvedPolicy};

type DivMod = unsafe extern "C" fn(i32, i32, *mut i32) -> i32;
type Counter = unsafe extern "C" fn() -> u32;
type Square = unsafe extern "system" fn(u64) -> u64;
type Unary = unsafe extern "C" fn(u32) -> u32;

unsafe extern "C" fn divmod(a: i32, b: i32, rem: *mut i32) -> i32 {
    if b == 0 {
        return i32::MIN;
    }
    if !rem.is_null() {
        unsafe { *rem = a % b };
    }
    a / b
}

unsafe extern "system" fn square(x: u64) -> u64 {
    x * x
}

unsafe extern "C" fn not_divmod(_: i32, _: i32, _: *mut i32) -> i32 {
    -7
}

fn proxy_for(
    library: &'static str,
    slots: Vec<Slot>,
    exports: Vec<ExportDescriptor>,
) -> (Fixture, &'static Surface, Proxy) {
    common::setup_tracing();

    let fixture = Fixture::new(library);
    let surface = surface(library, slots);
    let proxy = Proxy::with_loader(surface, fixture.config(), StubLoader::new(exports));
    (fixture, surface, proxy)
}

fn divmod_proxy(library: &'static str) -> (Fixture, &'static Surface, Proxy) {
    proxy_for(
        library,
        vec![Slot::typed::<DivMod>("DivMod", 1), Slot::typed::<Square>("Square", 2)],
        vec![export("DivMod", 1, divmod as DivMod), export("Square", 2, square as Square)],
    )
}

#[test]
fn test_forwarding_matches_direct_call() {
    let (fixture, surface, proxy) = divmod_proxy("dispatch_forward.dll");
    proxy.attach(&fixture.module).unwrap();
    let slot = surface.find("DivMod").unwrap();

    for (a, b) in [(17, 5), (-17, 5), (0, 3), (i32::MAX, 7), (4, 0)] {
        let mut direct_rem = 0;
        let direct = unsafe { divmod(a, b, &mut direct_rem) };

        let mut proxied_rem = 0;
        let proxied = unsafe {
            proxy.dispatcher().dispatch::<DivMod>(slot, (a, b, &mut proxied_rem as *mut i32))
        }
        .unwrap();

        assert_eq!(proxied, direct);
        assert_eq!(proxied_rem, direct_rem);
    }

    let slot = surface.find("Square").unwrap();
    assert_eq!(unsafe { proxy.dispatcher().dispatch::<Square>(slot, (12,)) }.unwrap(), 144);
    assert_eq!(proxy.dispatcher().state(slot), ExportState::Forwarding);
}

#[test]
fn test_interceptor_and_genuine_each_run_once() {
    static GENUINE: AtomicUsize = AtomicUsize::new(0);
    static INTERCEPTOR: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn counted() -> u32 {
        GENUINE.fetch_add(1, Ordering::SeqCst) as u32 + 100
    }

    let (fixture, surface, proxy) = proxy_for(
        "dispatch_once.dll",
        vec![Slot::typed::<Counter>("Count", 1)],
        vec![export("Count", 1, counted as Counter)],
    );
    proxy.attach(&fixture.module).unwrap();

    proxy
        .register::<Counter, _>("Count", |forward, args| {
            INTERCEPTOR.fetch_add(1, Ordering::SeqCst);
            unsafe { forward.call(args) + 1 }
        })
        .unwrap();

    let slot = surface.find("Count").unwrap();
    assert_eq!(proxy.dispatcher().state(slot), ExportState::Intercepted);

    let result = unsafe { proxy.dispatcher().dispatch::<Counter>(slot, ()) }.unwrap();
    assert_eq!(result, 101);
    assert_eq!(INTERCEPTOR.load(Ordering::SeqCst), 1);
    assert_eq!(GENUINE.load(Ordering::SeqCst), 1);
}

#[test]
fn test_interceptor_may_skip_the_genuine() {
    static GENUINE: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn counted() -> u32 {
        GENUINE.fetch_add(1, Ordering::SeqCst) as u32
    }

    let (fixture, surface, proxy) = proxy_for(
        "dispatch_skip.dll",
        vec![Slot::typed::<Counter>("Count", 1)],
        vec![export("Count", 1, counted as Counter)],
    );
    proxy.attach(&fixture.module).unwrap();
    proxy.register::<Counter, _>("Count", |_, ()| 42).unwrap();

    let slot = surface.find("Count").unwrap();
    for _ in 0..3 {
        assert_eq!(unsafe { proxy.dispatcher().dispatch::<Counter>(slot, ()) }.unwrap(), 42);
    }
    assert_eq!(GENUINE.load(Ordering::SeqCst), 0);
}

#[test]
fn test_interceptor_may_retry_the_genuine() {
    static GENUINE: AtomicUsize = AtomicUsize::new(0);

    // Fails twice, then succeeds.
    unsafe extern "C" fn flaky() -> u32 {
        match GENUINE.fetch_add(1, Ordering::SeqCst) {
            0 | 1 => 0,
            n => n as u32,
        }
    }

    let (fixture, surface, proxy) = proxy_for(
        "dispatch_retry.dll",
        vec![Slot::typed::<Counter>("Flaky", 1)],
        vec![export("Flaky", 1, flaky as Counter)],
    );
    proxy.attach(&fixture.module).unwrap();
    proxy
        .register::<Counter, _>("Flaky", |forward: &Forward<Counter>, ()| {
            (0..5).map(|_| unsafe { forward.call(()) }).find(|&r| r != 0).unwrap_or(0)
        })
        .unwrap();

    let slot = surface.find("Flaky").unwrap();
    assert_eq!(unsafe { proxy.dispatcher().dispatch::<Counter>(slot, ()) }.unwrap(), 2);
    assert_eq!(GENUINE.load(Ordering::SeqCst), 3);
}

#[test]
fn test_blocked_interceptor_doesnt_block_other_exports() {
    let (fixture, surface, proxy) = divmod_proxy("dispatch_parallel.dll");
    let proxy: &'static Proxy = Box::leak(Box::new(proxy));
    proxy.attach(&fixture.module).unwrap();

    let (entered_tx, entered_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Mutex::new(release_rx);
    proxy
        .register::<DivMod, _>("DivMod", move |forward, args| {
            entered_tx.send(()).unwrap();
            release_rx.lock().unwrap().recv().unwrap();
            unsafe { forward.call(args) }
        })
        .unwrap();

    let divmod_slot = surface.find("DivMod").unwrap();
    let blocked = thread::spawn(move || unsafe {
        proxy.dispatcher().dispatch::<DivMod>(divmod_slot, (9, 2, std::ptr::null_mut()))
    });
    entered_rx.recv().unwrap();

    // Same proxy, other export, while DivMod is stuck in its interceptor.
    let square_slot = surface.find("Square").unwrap();
    let other = thread::spawn(move || unsafe {
        proxy.dispatcher().dispatch::<Square>(square_slot, (9,))
    });
    assert_eq!(other.join().unwrap().unwrap(), 81);

    release_tx.send(()).unwrap();
    assert_eq!(blocked.join().unwrap().unwrap(), 4);
}

#[test]
fn test_raw_interceptor_on_typed_export() {
    let (fixture, surface, proxy) = divmod_proxy("dispatch_raw.dll");
    proxy.attach(&fixture.module).unwrap();
    proxy.register_raw("DivMod", raw(not_divmod as DivMod)).unwrap();

    let slot = surface.find("DivMod").unwrap();
    let result = unsafe {
        proxy.dispatcher().dispatch::<DivMod>(slot, (9, 2, std::ptr::null_mut()))
    };
    assert_eq!(result.unwrap(), -7);

    proxy.unregister("DivMod").unwrap();
    let result = unsafe {
        proxy.dispatcher().dispatch::<DivMod>(slot, (9, 2, std::ptr::null_mut()))
    };
    assert_eq!(result.unwrap(), 4);
}

#[test]
fn test_signature_mismatch_is_refused() {
    let (fixture, surface, proxy) = divmod_proxy("dispatch_mismatch.dll");
    proxy.attach(&fixture.module).unwrap();

    // Registered with the wrong calling convention.
    type Wrong = unsafe extern "C" fn(u64) -> u64;
    let err = proxy
        .register::<Wrong, _>("Square", |forward, args| unsafe { forward.call(args) })
        .unwrap_err();
    assert_eq!(err, RegistrationError::SignatureMismatch("Square".to_owned()));
    assert!(proxy.registry().is_empty());

    // The export keeps working.
    let slot = surface.find("Square").unwrap();
    assert_eq!(unsafe { proxy.dispatcher().dispatch::<Square>(slot, (3,)) }.unwrap(), 9);

    // A caller using the wrong type is refused before anything runs.
    proxy.register::<Square, _>("Square", |forward, args| unsafe { forward.call(args) }).unwrap();
    let result = unsafe { proxy.dispatcher().dispatch::<Wrong>(slot, (3,)) };
    assert!(matches!(result, Err(DispatchError::SignatureMismatch { .. })));
}

#[test]
fn test_fail_fast_before_attach() {
    let (fixture, surface, _) = divmod_proxy("dispatch_failfast.dll");
    let proxy = Proxy::with_loader(
        surface,
        fixture.config().with_unresolved(UnresolvedPolicy::FailFast),
        StubLoader::new(vec![]),
    );
    let slot = surface.find("Square").unwrap();

    assert_eq!(proxy.dispatcher().state(slot), ExportState::Unresolved);
    let result = unsafe { proxy.dispatcher().dispatch::<Square>(slot, (3,)) };
    assert!(matches!(
        result,
        Err(DispatchError::InvalidState { phase: Phase::NotAttached, .. })
    ));
}

#[test]
fn test_block_policy_times_out() {
    let (_fixture, surface, proxy) = divmod_proxy("dispatch_timeout.dll");
    let proxy = Proxy::with_loader(
        surface,
        proxy.config().clone().with_unresolved(UnresolvedPolicy::Block(Duration::from_millis(30))),
        StubLoader::new(vec![]),
    );
    let slot = surface.find("Square").unwrap();

    let start = Instant::now();
    let result = unsafe { proxy.dispatcher().dispatch::<Square>(slot, (3,)) };
    assert!(start.elapsed() >= Duration::from_millis(30));
    match result {
        Err(DispatchError::Timeout { export, waited }) => {
            assert_eq!(export.to_string(), "Square");
            assert_eq!(waited, Duration::from_millis(30));
        },
        result => panic!("unexpected result: {result:?}"),
    }
}

#[test]
fn test_state_follows_lifecycle() {
    let (fixture, surface, proxy) = divmod_proxy("dispatch_state.dll");
    let slot = surface.find("DivMod").unwrap();
    let dispatcher = proxy.dispatcher();

    assert_eq!(dispatcher.state(slot), ExportState::Unresolved);
    proxy.attach(&fixture.module).unwrap();
    assert_eq!(dispatcher.state(slot), ExportState::Forwarding);

    proxy.register::<DivMod, _>("DivMod", |forward, args| unsafe { forward.call(args) }).unwrap();
    assert_eq!(dispatcher.state(slot), ExportState::Intercepted);

    proxy.unregister("DivMod").unwrap();
    assert_eq!(dispatcher.state(slot), ExportState::Forwarding);

    proxy.detach(false);
    assert_eq!(dispatcher.state(slot), ExportState::Closed);
}

#[test]
fn test_registration_races_calls() {
    const CALLERS: u32 = 4;
    const ROUNDS: usize = 50;

    unsafe extern "C" fn plain(x: u32) -> u32 {
        x * 2
    }

    unsafe extern "C" fn marked(x: u32) -> u32 {
        x * 2 + 1
    }

    let (fixture, surface, proxy) = proxy_for(
        "dispatch_race.dll",
        vec![Slot::typed::<Unary>("Typed", 1), Slot::forward("Forward", 2)],
        vec![export("Typed", 1, plain as Unary), export("Forward", 2, plain as Unary)],
    );
    let proxy: &'static Proxy = Box::leak(Box::new(proxy));
    proxy.attach(&fixture.module).unwrap();

    let typed = surface.find("Typed").unwrap();
    let forward = surface.find("Forward").unwrap();

    // Odd while both interceptors are registered and their removal hasn't
    // started.
    let epoch = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicBool::new(false));

    let callers = (0..CALLERS)
        .map(|i| {
            let epoch = Arc::clone(&epoch);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut calls = 0usize;
                let mut x = i;
                while !done.load(Ordering::SeqCst) {
                    x = (x + CALLERS) % 1_000_000;

                    let before = epoch.load(Ordering::SeqCst);
                    let typed_result =
                        unsafe { proxy.dispatcher().dispatch::<Unary>(typed, (x,)) }.unwrap();
                    // What a trampoline does: load the target, jump to it.
                    let target =
                        unsafe { <Unary as ExportFn>::from_raw(forward.target().unwrap()) };
                    let forward_result = unsafe { target(x) };
                    let after = epoch.load(Ordering::SeqCst);

                    for result in [typed_result, forward_result] {
                        assert!(result == x * 2 || result == x * 2 + 1, "{x} -> {result}");
                        if before == after && before % 2 == 1 {
                            assert_eq!(result, x * 2 + 1, "registered call went to the genuine");
                        }
                    }
                    calls += 1;
                }
                calls
            })
        })
        .collect::<Vec<_>>();

    for _ in 0..ROUNDS {
        proxy
            .register::<Unary, _>("Typed", |forward, (x,)| unsafe { forward.call((x,)) + 1 })
            .unwrap();
        proxy.register_raw("Forward", raw(marked as Unary)).unwrap();
        epoch.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_micros(200));

        epoch.fetch_add(1, Ordering::SeqCst);
        proxy.unregister("Typed").unwrap();
        proxy.unregister("Forward").unwrap();
        thread::sleep(Duration::from_micros(200));
    }
    done.store(true, Ordering::SeqCst);

    let calls = callers.into_iter().map(|caller| caller.join().unwrap()).sum::<usize>();
    assert!(calls > 0);
    assert!(proxy.registry().is_empty());
    assert_eq!(forward.target(), Some(raw(plain as Unary)));
}
