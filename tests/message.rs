use mama_bridge::loopback;
use mama_bridge::Bridge::{Bridge, BridgeBuilder, FieldType, Message};
use mama_bridge::Core::{BridgeError, NativeWrapper, Ownership, Status};
use serial_test::serial;

fn bridge() -> Bridge {
    loopback::reset();
    BridgeBuilder::new().with_name("message-tests").build(loopback::api())
}

#[test]
#[serial]
fn scalar_fields_round_trip() {
    let bridge = bridge();
    let msg = Message::new(&bridge).unwrap();

    msg.add_i32(Some("qty"), 10, 300).unwrap();
    msg.add_i64(Some("seq"), 11, 9_000_000_000).unwrap();
    msg.add_f64(Some("bid"), 12, 101.25).unwrap();
    msg.add_bool(Some("halted"), 13, true).unwrap();
    msg.add_string(Some("symbol"), 14, "IBM").unwrap();

    assert_eq!(msg.num_fields().unwrap(), 5);
    assert_eq!(msg.get_i32(Some("qty"), 0).unwrap(), 300);
    assert_eq!(msg.get_i64(None, 11).unwrap(), 9_000_000_000);
    assert_eq!(msg.get_f64(Some("bid"), 12).unwrap(), 101.25);
    assert!(msg.get_bool(None, 13).unwrap());
    assert_eq!(msg.get_string(Some("symbol"), 0).unwrap(), "IBM");
}

#[test]
#[serial]
fn vector_field_round_trip() {
    let bridge = bridge();
    let msg = Message::new(&bridge).unwrap();
    msg.add_vector_i32(Some("levels"), 20, &[5, 4, 3, 2, 1]).unwrap();
    msg.add_vector_i32(Some("empty"), 21, &[]).unwrap();

    assert_eq!(msg.get_vector_i32(None, 20).unwrap(), vec![5, 4, 3, 2, 1]);
    assert_eq!(msg.get_vector_i32(Some("empty"), 0).unwrap(), Vec::<i32>::new());
}

#[test]
#[serial]
fn try_accessors_swallow_only_not_found() {
    let bridge = bridge();
    let msg = Message::new(&bridge).unwrap();
    msg.add_string(Some("symbol"), 1, "MSFT").unwrap();

    assert_eq!(msg.try_i32(Some("missing"), 99).unwrap(), None);
    assert_eq!(msg.try_string(None, 1).unwrap(), Some("MSFT".to_string()));
    assert_eq!(
        msg.get_i32(Some("missing"), 99),
        Err(BridgeError::Native(Status::NotFound))
    );

    // A type mismatch is a real error, not an absent field
    assert_eq!(
        msg.try_i32(None, 1),
        Err(BridgeError::Native(Status::WrongFieldType))
    );
}

#[test]
#[serial]
fn argument_checks_can_be_disabled() {
    loopback::reset();
    let checked = BridgeBuilder::new().build(loopback::api());
    let msg = Message::new(&checked).unwrap();
    assert!(matches!(msg.add_i32(None, 0, 1), Err(BridgeError::InvalidArgument(_))));

    // Unchecked, the engine sees the call and rejects it itself
    let unchecked = BridgeBuilder::new().with_check_arguments(false).build(loopback::api());
    let msg = Message::new(&unchecked).unwrap();
    assert_eq!(msg.add_i32(None, 0, 1), Err(BridgeError::Native(Status::InvalidArg)));

    assert!(matches!(
        msg.add_string(Some("bad\0name"), 1, "x"),
        Err(BridgeError::InvalidArgument(_))
    ));
}

#[test]
#[serial]
fn field_iteration_reuses_one_view() {
    let bridge = bridge();
    let msg = Message::new(&bridge).unwrap();
    msg.add_i32(Some("a"), 1, 7).unwrap();
    msg.add_f64(Some("b"), 2, 2.5).unwrap();
    msg.add_string(Some("c"), 3, "text").unwrap();

    let mut seen = vec![];
    let mut handles = vec![];
    msg.for_each_field(|field| {
        let name = field.name()?;
        let kind = field.field_type()?;
        match kind {
            FieldType::I32 => assert_eq!(field.as_i64()?, 7),
            FieldType::F64 => assert_eq!(field.as_f64()?, 2.5),
            _ => {}
        }
        handles.push(field.native_handle());
        seen.push((field.fid()?, name, kind));
        Ok(())
    })
    .unwrap();

    println!("fields: {:?}", seen);
    assert_eq!(
        seen,
        vec![
            (1, "a".to_string(), FieldType::I32),
            (2, "b".to_string(), FieldType::F64),
            (3, "c".to_string(), FieldType::String),
        ]
    );
    // Same wrapper, different native field each time
    handles.dedup();
    assert_eq!(handles.len(), 3);
}

#[test]
#[serial]
fn repeated_iteration_hands_out_the_same_field_views() {
    let bridge = bridge();
    let msg = Message::new(&bridge).unwrap();
    msg.add_i32(Some("a"), 1, 7).unwrap();
    msg.add_i64(Some("b"), 2, 8).unwrap();
    msg.add_bool(Some("c"), 3, true).unwrap();

    let mut passes = vec![];
    for _ in 0..4 {
        let mut handles = vec![];
        msg.for_each_field(|field| {
            handles.push(field.native_handle());
            Ok(())
        })
        .unwrap();
        passes.push(handles);
    }
    assert!(passes.windows(2).all(|pair| pair[0] == pair[1]));
    // One engine-side view per field, however often the message is walked
    assert_eq!(loopback::counters().field_views, 3);
    assert_eq!(loopback::counters().live_objects, 1);

    msg.dispose().unwrap();
    assert_eq!(loopback::counters().field_views, 0);
}

#[test]
#[serial]
fn clear_drops_fields() {
    let bridge = bridge();
    let msg = Message::new(&bridge).unwrap();
    msg.add_i32(Some("a"), 1, 1).unwrap();
    msg.clear().unwrap();
    assert_eq!(msg.num_fields().unwrap(), 0);
    assert_eq!(msg.try_i32(Some("a"), 1).unwrap(), None);
}

#[test]
#[serial]
fn destroy_is_idempotent_and_counted_once() {
    let bridge = bridge();
    let msg = Message::new(&bridge).unwrap();
    msg.dispose().unwrap();
    msg.dispose().unwrap();
    assert_eq!(msg.num_fields(), Err(BridgeError::NotInitialized));
    drop(msg);

    let counters = loopback::counters();
    println!("{:?}", counters);
    assert_eq!(counters.messages_destroyed, 1);
    assert_eq!(counters.double_destroys, 0);
}

#[test]
#[serial]
fn wrapping_a_lent_message_never_destroys_it() {
    let bridge = bridge();
    let owner = Message::new(&bridge).unwrap();
    owner.add_i32(Some("x"), 1, 42).unwrap();

    let lent = unsafe { Message::from_native(&bridge, owner.native_handle().unwrap(), Ownership::NotOwned) };
    assert_eq!(lent.get_i32(Some("x"), 1).unwrap(), 42);
    drop(lent);
    assert_eq!(loopback::counters().messages_destroyed, 0);

    // Still usable through the owner
    assert_eq!(owner.get_i32(None, 1).unwrap(), 42);
    drop(owner);
    assert_eq!(loopback::counters().messages_destroyed, 1);
}
