//! Device layer integration tests
//!
//! Exercises the shared device logic against the in-memory platform:
//! - opening, descriptor caching and string helpers
//! - unwinding of partially opened devices
//! - synchronous and asynchronous control transfers
//! - isochronous frame scheduling and pipe cursors
//! - device list maintenance across enumerations
//!
//! Run with: `cargo test -p usb --test device_tests`

use std::sync::Arc;
use usb::test_utils::{DEFAULT_LANGUAGE_ID, FakeDevice, FakeInterface, FakePlatform};
use usb::{
    Device, DeviceId, DeviceList, Error, ISO_ASAP_ATTEMPTS, ListChange, Recipient, RequestType,
    TransferStatus, open_with,
};

// ============================================================================
// Test Utilities
// ============================================================================

const GET_DESCRIPTOR: u8 = 0x06;

/// Audio-style device: a control interface and a streaming interface whose
/// alternate setting 1 carries an isochronous OUT endpoint
fn audio_device() -> Arc<FakeDevice> {
    FakeDevice::builder()
        .ids(0x1234, 0x5678)
        .strings("Acme", "Speaker", "")
        .interface(FakeInterface::new(0, 0, 0x01))
        .interface(FakeInterface::new(1, 0, 0x01))
        .interface(FakeInterface::new(1, 1, 0x01).endpoint(0x01, 0x05, 192))
        .build()
}

fn open(fake: &Arc<FakeDevice>) -> (FakePlatform, Device) {
    let platform = FakePlatform::new();
    platform.add(DeviceId::new("1-1"), fake.clone());
    let device = open_with(&platform, &DeviceId::new("1-1")).unwrap();
    (platform, device)
}

/// Device with the streaming alternate selected and the clock at frame 100
fn streaming_device() -> (Arc<FakeDevice>, FakePlatform, Device) {
    let fake = audio_device();
    let (platform, device) = open(&fake);
    device.set_alternate(1, 1).unwrap();
    fake.set_frame(100);
    fake.auto_complete_iso(true);
    (fake, platform, device)
}

// ============================================================================
// Opening and descriptors
// ============================================================================

mod opening {
    use super::*;

    #[test]
    fn test_open_caches_descriptor_tree() {
        let fake = audio_device();
        let (_platform, device) = open(&fake);

        assert!(device.is_open());
        assert_eq!(device.vendor_id().unwrap(), 0x1234);
        assert_eq!(device.product_id().unwrap(), 0x5678);
        assert_eq!(device.num_interfaces().unwrap(), 2);

        let descriptors = device.descriptors().unwrap();
        assert_eq!(descriptors.num_configurations, 1);
        let config = descriptors.first_configuration().unwrap();
        assert_eq!(config.interfaces.len(), 3);
        assert_eq!(config.alternate_settings(1).count(), 2);
        assert_eq!(fake.events(), vec!["open", "claim 0", "claim 1"]);
    }

    #[test]
    fn test_strings() {
        let fake = audio_device();
        let (_platform, device) = open(&fake);

        assert_eq!(device.language_ids().unwrap(), vec![DEFAULT_LANGUAGE_ID]);
        assert_eq!(device.manufacturer(DEFAULT_LANGUAGE_ID).unwrap(), "Acme");
        assert_eq!(device.product(DEFAULT_LANGUAGE_ID).unwrap(), "Speaker");
        // No serial string: index 0, no request sent
        let requests_before = fake.control_ins().len();
        assert_eq!(device.serial(DEFAULT_LANGUAGE_ID).unwrap(), "");
        assert_eq!(fake.control_ins().len(), requests_before);
    }

    #[test]
    fn test_string_index_zero_rejected() {
        let fake = audio_device();
        let (_platform, device) = open(&fake);
        assert!(matches!(
            device.string_descriptor(0, DEFAULT_LANGUAGE_ID),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_non_ascii_string() {
        let fake = FakeDevice::builder()
            .strings("Müller", "Gerät", "")
            .build();
        let (_platform, device) = open(&fake);

        assert_eq!(device.manufacturer(DEFAULT_LANGUAGE_ID).unwrap(), "M?ller");
        assert_eq!(device.string_descriptor(2, DEFAULT_LANGUAGE_ID).unwrap(), "Gerät");
    }

    #[test]
    fn test_descriptor_reads_use_header_then_body() {
        let fake = audio_device();
        let (_platform, _device) = open(&fake);

        let lengths: Vec<u16> = fake
            .control_ins()
            .iter()
            .filter(|setup| setup.value == 0x0100)
            .map(|setup| setup.length)
            .collect();
        assert_eq!(lengths, vec![2, 18]);
    }

    #[test]
    fn test_unknown_device() {
        let platform = FakePlatform::new();
        let result = open_with(&platform, &DeviceId::new("9-9"));
        assert!(matches!(result, Err(Error::NotFound)));
    }

    #[test]
    fn test_interface_mismatch_releases_in_reverse() {
        let fake = FakeDevice::builder()
            .interface(FakeInterface::new(0, 0, 0xFF))
            .interface(FakeInterface::new(1, 0, 0xFF))
            .reported_interfaces(vec![0, 3])
            .build();
        let platform = FakePlatform::new();
        platform.add(DeviceId::new("1-1"), fake.clone());

        let result = open_with(&platform, &DeviceId::new("1-1"));
        assert!(matches!(
            result,
            Err(Error::InterfaceNumberMismatch {
                position: 1,
                reported: 3
            })
        ));
        assert_eq!(
            fake.events(),
            vec!["open", "claim 0", "claim 3", "release 3", "release 0", "close"]
        );
    }

    #[test]
    fn test_short_device_descriptor_closes_device() {
        let mut bytes = usb::test_utils::device_descriptor_bytes(0x1234, 0x5678, [0; 3], 1);
        bytes.pop();
        let fake = FakeDevice::builder().raw_device_descriptor(bytes).build();
        let platform = FakePlatform::new();
        platform.add(DeviceId::new("1-1"), fake.clone());

        let result = open_with(&platform, &DeviceId::new("1-1"));
        assert!(matches!(result, Err(Error::DescriptorReadFailed)));
        assert_eq!(fake.close_count(), 1);
        assert!(!usb::PlatformDevice::is_open(fake.as_ref()));
    }

    #[test]
    fn test_malformed_configuration_closes_device() {
        let fake = FakeDevice::builder()
            .raw_configuration(vec![9, 0x02, 13, 0, 1, 1, 0, 0x80, 50, 0, 0x04, 0, 0])
            .build();
        let platform = FakePlatform::new();
        platform.add(DeviceId::new("1-1"), fake.clone());

        let result = open_with(&platform, &DeviceId::new("1-1"));
        assert!(matches!(
            result,
            Err(Error::Descriptor(protocol::DescriptorError::ZeroLength {
                offset: 9
            }))
        ));
        assert_eq!(fake.close_count(), 1);
    }

    #[test]
    fn test_open_error_is_reported() {
        let fake = audio_device();
        let platform = FakePlatform::new();
        platform.add(DeviceId::new("1-1"), fake.clone());
        platform.fail_open(Error::AccessDenied);

        let result = open_with(&platform, &DeviceId::new("1-1"));
        assert!(matches!(result, Err(Error::AccessDenied)));
        assert!(fake.events().is_empty());
    }

    #[test]
    fn test_interleaved_alternates_claim_each_interface_once() {
        let fake = FakeDevice::builder()
            .interface(FakeInterface::new(0, 0, 0x01))
            .interface(FakeInterface::new(1, 0, 0x01))
            .interface(FakeInterface::new(0, 1, 0x01))
            .build();
        let (_platform, device) = open(&fake);

        assert_eq!(device.num_interfaces().unwrap(), 2);
        assert_eq!(fake.events(), vec!["open", "claim 0", "claim 1"]);
    }
}

// ============================================================================
// Closing
// ============================================================================

mod closing {
    use super::*;

    #[test]
    fn test_operations_after_close_fail() {
        let fake = audio_device();
        let (_platform, device) = open(&fake);
        device.close();

        assert!(!device.is_open());
        assert_eq!(device.vendor_id(), Err(Error::NotOpen));
        assert!(matches!(device.descriptors(), Err(Error::NotOpen)));
        assert_eq!(device.product(DEFAULT_LANGUAGE_ID), Err(Error::NotOpen));
        assert_eq!(device.bus_frame_number(), Err(Error::NotOpen));
        assert_eq!(
            device.control_in_sync(
                Recipient::Device,
                RequestType::Standard,
                GET_DESCRIPTOR,
                0x0100,
                0,
                18
            ),
            Err(Error::NotOpen)
        );
        assert!(matches!(
            device.create_iso_write_buffer(1, 0x01, 8, 192),
            Err(Error::NotOpen)
        ));
    }

    #[test]
    fn test_close_is_idempotent() {
        let fake = audio_device();
        let (_platform, device) = open(&fake);
        device.close();
        device.close();
        assert_eq!(fake.close_count(), 1);
    }
}

// ============================================================================
// Control transfers
// ============================================================================

mod control {
    use super::*;

    #[test]
    fn test_control_in_sync_returns_short_reads() {
        let fake = audio_device();
        let (_platform, device) = open(&fake);

        let data = device
            .control_in_sync(
                Recipient::Device,
                RequestType::Standard,
                GET_DESCRIPTOR,
                0x0100,
                0,
                64,
            )
            .unwrap();
        assert_eq!(data.len(), 18);
        assert_eq!(&data[8..12], &[0x34, 0x12, 0x78, 0x56]);
    }

    #[test]
    fn test_stalled_request() {
        let fake = audio_device();
        let (_platform, device) = open(&fake);

        let result =
            device.control_in_sync(Recipient::Interface, RequestType::Class, 0x81, 0x0100, 1, 2);
        assert_eq!(result, Err(Error::TransferFailed(TransferStatus::Stall)));
    }

    #[test]
    fn test_control_out_sync_records_request() {
        let fake = audio_device();
        let (_platform, device) = open(&fake);

        device
            .control_out_sync(
                Recipient::Endpoint,
                RequestType::Class,
                0x01,
                0x0100,
                0x0001,
                &[0x80, 0xBB, 0x00],
            )
            .unwrap();

        let outs = fake.control_outs();
        assert_eq!(outs.len(), 1);
        let (setup, data) = &outs[0];
        assert_eq!(setup.request_type, 0x22);
        assert_eq!(setup.request, 0x01);
        assert_eq!(setup.value, 0x0100);
        assert_eq!(setup.index, 0x0001);
        assert_eq!(setup.length, 3);
        assert_eq!(data, &vec![0x80, 0xBB, 0x00]);
    }

    #[test]
    fn test_control_out_sync_short_write() {
        let fake = audio_device();
        let (_platform, device) = open(&fake);
        fake.short_write(2);

        let result = device.control_out_sync(
            Recipient::Device,
            RequestType::Vendor,
            0x10,
            0,
            0,
            &[1, 2, 3, 4],
        );
        assert_eq!(
            result,
            Err(Error::Incomplete {
                expected: 4,
                actual: 2
            })
        );
    }

    #[test]
    fn test_control_out_payload_limit() {
        let fake = audio_device();
        let (_platform, device) = open(&fake);

        let payload = vec![0u8; 0x10000];
        let result =
            device.control_out_sync(Recipient::Device, RequestType::Vendor, 0x10, 0, 0, &payload);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert!(fake.control_outs().is_empty());
    }

    #[test]
    fn test_async_control_in() {
        let fake = audio_device();
        let (_platform, device) = open(&fake);

        let handle = device
            .control_in(
                Recipient::Device,
                RequestType::Standard,
                GET_DESCRIPTOR,
                0x0100,
                0,
                18,
            )
            .unwrap();
        assert_eq!(handle.result(false), Err(Error::NotFinished));
        assert!(!handle.is_finished());

        assert!(fake.complete_next_control());
        let data = handle.result(true).unwrap();
        assert_eq!(data.len(), 18);
        assert_eq!(handle.result(false).unwrap(), data);
    }

    #[test]
    fn test_async_control_out_unsupported() {
        let fake = audio_device();
        let (_platform, device) = open(&fake);

        let result = device.control_out(
            Recipient::Device,
            RequestType::Vendor,
            0x10,
            0,
            0,
            vec![1, 2],
        );
        assert!(matches!(result, Err(Error::UnsupportedOperation)));
    }

    #[test]
    fn test_pending_transfer_outlives_device() {
        let fake = audio_device();
        let (platform, device) = open(&fake);

        let handle = device
            .control_in(
                Recipient::Device,
                RequestType::Standard,
                GET_DESCRIPTOR,
                0x0100,
                0,
                18,
            )
            .unwrap();
        drop(device);
        drop(handle);

        // The pending transfer still references the backend device
        let held = Arc::strong_count(&fake);
        assert!(fake.complete_next_control());
        assert_eq!(Arc::strong_count(&fake), held - 1);
        drop(platform);
    }

    #[test]
    fn test_unresolved_completion_reports_cancelled() {
        let fake = audio_device();
        let (_platform, device) = open(&fake);

        let handle = device
            .control_in(
                Recipient::Device,
                RequestType::Standard,
                GET_DESCRIPTOR,
                0x0100,
                0,
                18,
            )
            .unwrap();
        let (_setup, completion) = fake.take_pending_control().unwrap();
        drop(completion);
        assert_eq!(
            handle.result(true),
            Err(Error::TransferFailed(TransferStatus::Cancelled))
        );
    }
}

// ============================================================================
// Isochronous scheduling
// ============================================================================

mod isochronous {
    use super::*;

    #[test]
    fn test_asap_starts_after_current_frame() {
        let (fake, _platform, device) = streaming_device();
        let buffer = device.create_iso_write_buffer(1, 0x01, 8, 192).unwrap();

        let handle = device.submit_iso_asap(&buffer, false).unwrap();
        assert_eq!(handle.result(true), Ok(8 * 192));
        assert_eq!(fake.iso_submissions(), vec![(0x01, 101)]);
        assert_eq!(device.next_frame(1, 0x01), Some(109));
        assert_eq!(buffer.frame_lengths(), vec![192; 8]);
    }

    #[test]
    fn test_continued_stream_is_contiguous() {
        let (fake, _platform, device) = streaming_device();
        let buffer = device.create_iso_write_buffer(1, 0x01, 16, 192).unwrap();

        device.submit_iso_asap(&buffer, true).unwrap();
        for _ in 0..4 {
            device.submit_iso_asap(&buffer, true).unwrap();
        }

        let frames: Vec<u64> = fake.iso_submissions().iter().map(|(_, f)| *f).collect();
        assert_eq!(frames, vec![101, 117, 133, 149, 165]);
        assert_eq!(device.next_frame(1, 0x01), Some(181));
    }

    #[test]
    fn test_continue_retries_next_frame_once() {
        let (fake, _platform, device) = streaming_device();
        let buffer = device.create_iso_write_buffer(1, 0x01, 8, 192).unwrap();
        device.submit_iso_asap(&buffer, true).unwrap();
        assert_eq!(device.next_frame(1, 0x01), Some(109));

        // Cursor frame 109 has just elapsed; 110 is still in the future
        fake.set_frame(110);
        device.submit_iso_asap(&buffer, true).unwrap();
        assert_eq!(fake.iso_submissions().last(), Some(&(0x01, 110)));
        assert_eq!(device.next_frame(1, 0x01), Some(118));

        fake.reject_next_iso(2);
        let result = device.submit_iso_asap(&buffer, true);
        assert!(matches!(
            result,
            Err(Error::IsoScheduleFailed { attempts: 2 })
        ));
    }

    #[test]
    fn test_asap_gives_up_after_attempt_limit() {
        let (fake, _platform, device) = streaming_device();
        let buffer = device.create_iso_write_buffer(1, 0x01, 8, 192).unwrap();

        fake.reject_next_iso(ISO_ASAP_ATTEMPTS - 1);
        device.submit_iso_asap(&buffer, false).unwrap();
        assert_eq!(
            fake.iso_submissions(),
            vec![(0x01, 101 + ISO_ASAP_ATTEMPTS as u64 - 1)]
        );

        fake.reject_next_iso(ISO_ASAP_ATTEMPTS);
        let result = device.submit_iso_asap(&buffer, false);
        assert!(matches!(
            result,
            Err(Error::IsoScheduleFailed { attempts }) if attempts == ISO_ASAP_ATTEMPTS
        ));
    }

    #[test]
    fn test_at_frame_in_the_past() {
        let (fake, _platform, device) = streaming_device();
        let buffer = device.create_iso_write_buffer(1, 0x01, 8, 192).unwrap();

        let result = device.submit_iso_at_frame(&buffer, 50);
        assert!(matches!(
            result,
            Err(Error::IsoScheduleFailed { attempts: 1 })
        ));
        assert!(fake.iso_submissions().is_empty());

        device.submit_iso_at_frame(&buffer, 200).unwrap();
        assert_eq!(fake.iso_submissions(), vec![(0x01, 200)]);
        assert_eq!(device.next_frame(1, 0x01), Some(208));
    }

    #[test]
    fn test_set_alternate_resets_cursors_and_pipes() {
        let (_fake, _platform, device) = streaming_device();
        let buffer = device.create_iso_write_buffer(1, 0x01, 8, 192).unwrap();
        device.submit_iso_asap(&buffer, true).unwrap();
        assert!(device.next_frame(1, 0x01).is_some());

        device.set_alternate(1, 0).unwrap();
        assert_eq!(device.next_frame(1, 0x01), None);

        // Endpoint 0x01 only exists in alternate setting 1
        assert!(matches!(
            device.submit_iso_asap(&buffer, false),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            device.create_iso_write_buffer(1, 0x01, 8, 192),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_unknown_alternate_setting() {
        let (_fake, _platform, device) = streaming_device();
        assert!(matches!(
            device.set_alternate(1, 7),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_buffer_direction_must_match_endpoint() {
        let (_fake, _platform, device) = streaming_device();
        assert!(matches!(
            device.create_iso_read_buffer(1, 0x01, 8, 192),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_failed_iso_transfer() {
        let (fake, _platform, device) = streaming_device();
        fake.auto_complete_iso(false);
        let buffer = device.create_iso_write_buffer(1, 0x01, 8, 192).unwrap();

        let handle = device.submit_iso_asap(&buffer, false).unwrap();
        assert_eq!(fake.pending_iso(), 1);
        assert!(fake.complete_next_iso(TransferStatus::NoDevice));
        assert_eq!(handle.result(true), Err(Error::NotFound));
    }

    #[test]
    fn test_pending_iso_keeps_buffer_alive() {
        let (fake, _platform, device) = streaming_device();
        fake.auto_complete_iso(false);
        let buffer = device.create_iso_write_buffer(1, 0x01, 4, 192).unwrap();
        buffer.write_frame(0, &[7; 192]).unwrap();

        let handle = device.submit_iso_asap(&buffer, false).unwrap();
        drop(buffer);
        drop(handle);

        let pending = fake.pending_iso_buffer(0).unwrap();
        assert_eq!(pending.read_frame(0).unwrap(), Vec::<u8>::new());
        assert!(fake.complete_next_iso(TransferStatus::Completed));
        assert_eq!(pending.read_frame(0).unwrap(), vec![7; 192]);
    }
}

// ============================================================================
// Device list
// ============================================================================

mod device_list {
    use super::*;
    use usb::Platform;

    fn named(product: &str) -> Arc<FakeDevice> {
        FakeDevice::builder().strings("", product, "").build()
    }

    #[test]
    fn test_tracks_enumeration() {
        let platform = FakePlatform::new();
        platform.add(DeviceId::new("1-1"), named("Keyboard"));
        platform.add(DeviceId::new("1-2"), named("audio interface"));

        let mut list = DeviceList::new();
        let changes = list.update(&platform.enumerate().unwrap());
        assert_eq!(changes.len(), 2);
        let products: Vec<&str> = list.entries().iter().map(|e| e.product.as_str()).collect();
        assert_eq!(products, vec!["audio interface", "Keyboard"]);

        platform.remove(&DeviceId::new("1-1"));
        platform.add(DeviceId::new("1-3"), named("Mouse"));
        let changes = list.update(&platform.enumerate().unwrap());

        assert!(matches!(
            &changes[0],
            ListChange::Removed { index: 1, info } if info.product == "Keyboard"
        ));
        assert!(matches!(
            &changes[1],
            ListChange::Inserted { index: 1, info } if info.product == "Mouse"
        ));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_enumeration_failure() {
        let platform = FakePlatform::new();
        platform.fail_enumeration(Error::Platform {
            code: -1,
            message: "io".to_string(),
        });
        assert!(platform.enumerate().is_err());
        assert!(platform.enumerate().unwrap().is_empty());
    }

    #[test]
    fn test_unqueryable_device_is_skipped() {
        let platform = FakePlatform::new();
        let locked = named("Locked");
        locked.set_unqueryable(Some(Error::AccessDenied));
        platform.add(DeviceId::new("1-1"), locked.clone());
        platform.add(DeviceId::new("1-2"), named("Mouse"));

        let mut list = DeviceList::new();
        list.update(&platform.enumerate().unwrap());
        assert_eq!(list.len(), 1);
        assert_eq!(list.entries()[0].product, "Mouse");

        locked.set_unqueryable(None);
        let changes = list.update(&platform.enumerate().unwrap());
        assert_eq!(changes.len(), 1);
        assert_eq!(list.len(), 2);
    }
}
