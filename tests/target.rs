// SPDX-License-Identifier: MPL-2.0

//! End-to-end tests against `Target`: pass-through I/O, administrative
//! remapping, save/reopen recovery, tolerance of corrupted metadata
//! copies, auto-remap on a media error, and the admin text protocol.

use std::sync::Arc;

use sparemap::{BlockDevice, Errno, MemBlockDevice, TargetConfig};
use sparemap::target::Target;

fn devices(main_sectors: u64, spare_sectors: u64) -> (Arc<MemBlockDevice>, Arc<MemBlockDevice>) {
    (Arc::new(MemBlockDevice::new(main_sectors)), Arc::new(MemBlockDevice::new(spare_sectors)))
}

fn config(logical_length: u64) -> TargetConfig {
    TargetConfig::new(0, logical_length).with_metadata_copies(5).with_stride_blocks(1)
}

#[test]
fn unmapped_io_passes_through_to_main_device() {
    let (main, spare) = devices(1000, 200 + 1000);
    let target = Target::create(config(1000), main.clone(), spare.clone()).unwrap();

    let payload = vec![0xAAu8; 512];
    target.write(42, &payload).unwrap();

    let mut readback = vec![0u8; 512];
    target.read(42, &mut readback).unwrap();
    assert_eq!(readback, payload);

    let mut from_main = vec![0u8; 512];
    main.read_at(42 * 512, &mut from_main).unwrap();
    assert_eq!(from_main, payload);

    target.close().unwrap();
}

#[test]
fn admin_add_redirects_io_to_allocated_spare() {
    let (main, spare) = devices(1000, 200 + 1000);
    let target = Target::create(config(1000), main.clone(), spare.clone()).unwrap();

    let entry = target.add(100).unwrap();

    let payload = vec![0xBBu8; 512];
    target.write(100, &payload).unwrap();

    let mut readback = vec![0u8; 512];
    target.read(100, &mut readback).unwrap();
    assert_eq!(readback, payload);

    let mut from_main = vec![0u8; 512];
    main.read_at(100 * 512, &mut from_main).unwrap();
    assert_eq!(from_main, vec![0u8; 512]);

    let mut from_spare = vec![0u8; 512];
    spare.read_at(entry.spare * 512, &mut from_spare).unwrap();
    assert_eq!(from_spare, payload);

    assert!(target.handle_line("status").starts_with("ok entries=1"));

    target.close().unwrap();
}

#[test]
fn save_then_reopen_recovers_all_entries() {
    let (main, spare) = devices(1000, 200 + 1000);
    {
        let target = Target::create(config(1000), main.clone(), spare.clone()).unwrap();
        target.add(100).unwrap();
        target.add(200).unwrap();
        target.add(300).unwrap();
        target.save().unwrap();
        target.close().unwrap();
    }

    let reopened = Target::open(config(1000), main, spare).unwrap();
    let status = reopened.handle_line("status");
    assert!(status.starts_with("ok entries=3"), "unexpected status: {status}");

    for bad in [100, 200, 300] {
        assert!(reopened.add(bad).is_err(), "bad={bad} should already be mapped after recovery");
    }

    reopened.close().unwrap();
}

#[test]
fn zeroed_metadata_copies_are_tolerated_and_rewritten() {
    let (main, spare) = devices(1000, 200 + 1000);
    {
        let target = Target::create(config(1000), main.clone(), spare.clone()).unwrap();
        target.add(100).unwrap();
        target.add(200).unwrap();
        target.add(300).unwrap();
        target.save().unwrap();
        target.close().unwrap();
    }

    // Zero out the first two metadata copies (stride_blocks=1, block 0 and
    // block 1), leaving copies 2..5 intact.
    let zeroed = vec![0u8; 4096];
    spare.write_at(0, &zeroed).unwrap();
    spare.write_at(4096, &zeroed).unwrap();

    let reopened = Target::open(config(1000), main, spare.clone()).unwrap();
    let status = reopened.handle_line("status");
    assert!(status.starts_with("ok entries=3"), "unexpected status: {status}");

    // Opening enqueues a corrective rewrite; force it to complete.
    reopened.save().unwrap();

    let mut first_copy = vec![0u8; 4096];
    spare.read_at(0, &mut first_copy).unwrap();
    assert_ne!(first_copy, zeroed, "corrective cycle should have restored copy 0");

    reopened.close().unwrap();
}

#[test]
fn media_error_on_main_device_triggers_auto_remap() {
    let (main, spare) = devices(1000, 200 + 1000);
    main.fail_read(500);

    let target = Target::create(config(1000), main.clone(), spare.clone()).unwrap();

    let mut buf = vec![0u8; 512];
    let err = target.read(500, &mut buf).unwrap_err();
    assert_eq!(err.errno(), Errno::MediaError);

    let status = target.handle_line("status");
    assert!(status.starts_with("ok entries=1"), "expected an auto-remap entry: {status}");

    main.clear_failures(500);
    let payload = vec![0xCCu8; 512];
    target.write(500, &payload).unwrap();

    let mut readback = vec![0u8; 512];
    target.read(500, &mut readback).unwrap();
    assert_eq!(readback, payload);

    target.close().unwrap();
}

#[test]
fn insert_remove_insert_reuses_or_reallocates_spare() {
    let (main, spare) = devices(1000, 200 + 1000);
    let target = Target::create(config(1000), main, spare).unwrap();

    let first = target.add(42).unwrap();
    target.remove(42).unwrap();
    let second = target.add(42).unwrap();

    assert_eq!(target.handle_line("status").contains("entries=1"), true);
    let _ = (first.spare, second.spare);

    target.close().unwrap();
}

#[test]
fn out_of_range_io_is_rejected_without_touching_devices() {
    let (main, spare) = devices(100, 200 + 100);
    let target = Target::create(config(100), main, spare).unwrap();

    let mut buf = vec![0u8; 512];
    let err = target.read(99_999, &mut buf).unwrap_err();
    assert_eq!(err.errno(), Errno::OutOfRange);
}

#[test]
fn admin_surface_round_trips_through_text_commands() {
    let (main, spare) = devices(1000, 200 + 1000);
    let target = Target::create(config(1000), main, spare).unwrap();

    assert!(target.handle_line("add 10").starts_with("ok"));
    assert!(target.handle_line("add 10").starts_with("err AlreadyMapped"));
    assert!(target.handle_line("test_remap 20 150").starts_with("ok"));
    assert!(target.handle_line("remove 999").starts_with("err NotFound"));
    assert!(target.handle_line("save").starts_with("ok"));
    assert!(target.handle_line("frobnicate").starts_with("err"));

    target.close().unwrap();
}
