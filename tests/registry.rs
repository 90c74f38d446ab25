mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use common::{export, noname, raw, surface, Fixture, StubLoader};
use uniproxy::error::RegistrationError;
use uniproxy::{ExportKey, Proxy, Slot, Surface};

type Binary = unsafe extern "C" fn(i32, i32) -> i32;

unsafe extern "C" fn add(a: i32, b: i32) -> i32 {
    a + b
}

unsafe extern "C" fn sub(a: i32, b: i32) -> i32 {
    a - b
}

unsafe extern "C" fn mul(a: i32, b: i32) -> i32 {
    a * b
}

unsafe extern "C" fn max(a: i32, b: i32) -> i32 {
    a.max(b)
}

fn arith(library: &'static str) -> &'static Surface {
    surface(
        library,
        vec![Slot::typed::<Binary>("Add", 1), Slot::forward("Sub", 2), Slot::noname(3)],
    )
}

fn arith_exports() -> Vec<uniproxy::library::ExportDescriptor> {
    vec![export("Add", 1, add as Binary), export("Sub", 2, sub as Binary), noname(3, mul as Binary)]
}

#[test]
fn test_duplicate_registration_keeps_first() {
    let fixture = Fixture::new("registry_dup.dll");
    let surface = arith("registry_dup.dll");
    let proxy = Proxy::with_loader(surface, fixture.config(), StubLoader::new(arith_exports()));
    proxy.attach(&fixture.module).unwrap();

    proxy.register::<Binary, _>("Add", |_, (a, b)| a * 100 + b).unwrap();
    let err = proxy.register::<Binary, _>("Add", |_, (a, b)| a - b).unwrap_err();
    assert_eq!(err, RegistrationError::DuplicateName("Add".to_owned()));

    let err = proxy.register_raw("Add", raw(max as Binary)).unwrap_err();
    assert_eq!(err, RegistrationError::DuplicateName("Add".to_owned()));

    let slot = surface.find("Add").unwrap();
    let result = unsafe { proxy.dispatcher().dispatch::<Binary>(slot, (4, 2)) };
    assert_eq!(result.unwrap(), 402);
    assert_eq!(proxy.registry().len(), 1);

    // Once removed, the name is free again.
    proxy.unregister("Add").unwrap();
    proxy.register::<Binary, _>("Add", |_, (a, b)| a - b).unwrap();
    let result = unsafe { proxy.dispatcher().dispatch::<Binary>(slot, (4, 2)) };
    assert_eq!(result.unwrap(), 2);
}

#[test]
fn test_unknown_and_untyped_exports() {
    let proxy = Proxy::with_loader(
        arith("registry_unknown.dll"),
        Default::default(),
        StubLoader::new(arith_exports()),
    );

    assert_eq!(
        proxy.register_raw("Div", raw(max as Binary)).unwrap_err(),
        RegistrationError::UnknownExport("Div".to_owned())
    );
    assert_eq!(
        proxy.register_raw("#7", raw(max as Binary)).unwrap_err(),
        RegistrationError::UnknownExport("#7".to_owned())
    );
    assert_eq!(
        proxy.register::<Binary, _>("Sub", |_, (a, b)| a + b).unwrap_err(),
        RegistrationError::Untyped("Sub".to_owned())
    );
    assert_eq!(
        proxy.unregister("Div").unwrap_err(),
        RegistrationError::UnknownExport("Div".to_owned())
    );
    assert!(proxy.registry().is_empty());
}

#[test]
fn test_accessor_resolves_on_attach() {
    let fixture = Fixture::new("registry_accessor.dll");
    let surface = arith("registry_accessor.dll");
    let proxy = Proxy::with_loader(surface, fixture.config(), StubLoader::new(arith_exports()));

    let accessor = proxy.register_raw("Sub", raw(max as Binary)).unwrap();
    assert_eq!(accessor.key(), ExportKey::parse("Sub"));
    assert!(!accessor.is_resolved());
    assert_eq!(accessor.get().unwrap_err(), RegistrationError::NotYetResolved("Sub".to_owned()));

    proxy.attach(&fixture.module).unwrap();

    assert!(accessor.is_resolved());
    assert_eq!(accessor.get().unwrap(), raw(sub as Binary));
    let genuine = unsafe { accessor.get_as::<Binary>() }.unwrap();
    assert_eq!(unsafe { genuine(7, 3) }, 4);

    // The trampoline goes to the interceptor, the accessor to the genuine.
    let slot = surface.find("Sub").unwrap();
    assert_eq!(slot.target(), Some(raw(max as Binary)));
    assert_eq!(slot.original(), Some(raw(sub as Binary)));

    // Accessors don't require an interceptor.
    let accessor = proxy.original("Add").unwrap();
    assert_eq!(accessor.get().unwrap(), raw(add as Binary));
}

#[test]
fn test_raw_registration_after_attach_retargets() {
    let fixture = Fixture::new("registry_late.dll");
    let surface = arith("registry_late.dll");
    let proxy = Proxy::with_loader(surface, fixture.config(), StubLoader::new(arith_exports()));
    proxy.attach(&fixture.module).unwrap();

    let slot = surface.find("#3").unwrap();
    assert_eq!(slot.target(), Some(raw(mul as Binary)));

    let accessor = proxy.register_raw("#3", raw(max as Binary)).unwrap();
    assert_eq!(accessor.key(), ExportKey::Ordinal(3));
    assert_eq!(slot.target(), Some(raw(max as Binary)));
    assert!(proxy.registry().contains(&ExportKey::Ordinal(3)));

    proxy.unregister("#3").unwrap();
    assert_eq!(slot.target(), Some(raw(mul as Binary)));
    assert!(!proxy.registry().contains(&ExportKey::Ordinal(3)));
}

#[test]
fn test_concurrent_registration_has_one_winner() {
    const THREADS: usize = 8;

    let proxy = Arc::new(Proxy::with_loader(
        arith("registry_race.dll"),
        Default::default(),
        StubLoader::new(arith_exports()),
    ));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles = (0..THREADS)
        .map(|i| {
            let proxy = Arc::clone(&proxy);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let export = if i % 2 == 0 { "Add" } else { "#3" };
                if export == "Add" {
                    proxy.register::<Binary, _>(export, move |_, (a, _)| a + i as i32).is_ok()
                } else {
                    proxy.register_raw(export, raw(max as Binary)).is_ok()
                }
            })
        })
        .collect::<Vec<_>>();

    let winners = handles.into_iter().map(|h| h.join().unwrap()).filter(|&won| won);
    assert_eq!(winners.count(), 2);
    assert_eq!(proxy.registry().len(), 2);
}
