// Layout conformance tests for the C ABI.
// These tests assert sizes, alignments, and field offsets of the structs the
// engine reads directly. They also print the observed values to aid
// debugging when a mismatch occurs on a given platform.
use mama_bridge::ffi::{NativeApi, NativeHandle, QueueMonitorCallbacks, SubscriptionCallbacks};
use memoffset::offset_of;
use std::mem::{align_of, size_of};

const PTR: usize = size_of::<*const ()>();

#[test]
fn test_native_handle_layout() {
    let size = size_of::<NativeHandle>();
    let align = align_of::<NativeHandle>();
    println!(
        "NativeHandle => size: {size}, align: {align} (pointer size: {PTR}, pointer align: {})",
        align_of::<*const ()>()
    );

    // Must pass through function pointers exactly like void*
    assert_eq!(size, PTR);
    assert_eq!(align, align_of::<*const ()>());
    assert_eq!(size_of::<Option<NativeHandle>>(), PTR * 2);
}

#[test]
fn test_subscription_callbacks_layout() {
    let size = size_of::<SubscriptionCallbacks>();
    let align = align_of::<SubscriptionCallbacks>();
    let off_on_create = offset_of!(SubscriptionCallbacks, on_create);
    let off_on_error = offset_of!(SubscriptionCallbacks, on_error);
    let off_on_msg = offset_of!(SubscriptionCallbacks, on_msg);
    let off_on_destroy = offset_of!(SubscriptionCallbacks, on_destroy);

    println!(
        "SubscriptionCallbacks => size: {size}, expected: {}, align: {align}, offsets: [on_create:{off_on_create}, on_error:{off_on_error}, on_msg:{off_on_msg}, on_destroy:{off_on_destroy}]",
        4 * PTR
    );

    // Option<fn> is a nullable function pointer, same as the C table
    assert_eq!(size, 4 * PTR);
    assert_eq!(align, align_of::<*const ()>());
    assert_eq!(off_on_create, 0);
    assert_eq!(off_on_error, PTR);
    assert_eq!(off_on_msg, 2 * PTR);
    assert_eq!(off_on_destroy, 3 * PTR);
}

#[test]
fn test_queue_monitor_callbacks_layout() {
    let size = size_of::<QueueMonitorCallbacks>();
    let off_high = offset_of!(QueueMonitorCallbacks, on_high_watermark_exceeded);
    let off_low = offset_of!(QueueMonitorCallbacks, on_low_watermark);
    println!("QueueMonitorCallbacks => size: {size}, offsets: [high:{off_high}, low:{off_low}]");

    assert_eq!(size, 2 * PTR);
    assert_eq!(off_high, 0);
    assert_eq!(off_low, PTR);
}

#[test]
fn test_native_api_layout() {
    let size = size_of::<NativeApi>();
    let off_first = offset_of!(NativeApi, transport_create);
    let off_queue = offset_of!(NativeApi, queue_create);
    let off_msg = offset_of!(NativeApi, msg_create);
    let off_last = offset_of!(NativeApi, subscription_get_topic);
    println!(
        "NativeApi => size: {size}, entries: {}, offsets: [transport_create:{off_first}, queue_create:{off_queue}, subscription_get_topic:{off_last}]",
        size / PTR
    );

    // A packed table of function pointers in declaration order
    assert_eq!(size % PTR, 0);
    assert_eq!(off_first, 0);
    // Seven transport entries, then eighteen queue entries
    assert_eq!(off_queue, 7 * PTR);
    assert_eq!(off_msg, 25 * PTR);
    assert_eq!(off_last, size - PTR);
}
