//! Coordinator scenarios against a real FAT image and the simulated device link.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use embroidery_core::device_link::{
    GadgetLink, LinkEventKind, LinkProbe, MemoryPort, SimulatedLink,
};
use embroidery_core::disk::writer::DirectWriter;
use embroidery_core::{
    create_disk_image, DiskConfig, DiskCoordinator, DiskError, GadgetDescriptor, LinkState,
    VirtualDisk, WriterKind,
};
use tempfile::TempDir;

struct Fixture {
    _tmp: TempDir,
    image: PathBuf,
    coordinator: DiskCoordinator,
    probe: LinkProbe,
}

fn fixture(size_mb: u64) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let image = tmp.path().join("test.img");
    create_disk_image(&image, size_mb).unwrap();

    let config = DiskConfig {
        path: image.clone(),
        size_mb,
        auto_create: false,
        writer: WriterKind::Direct,
    };
    let link = SimulatedLink::new();
    let probe = link.probe();
    let coordinator = DiskCoordinator::new(&config, Box::new(link)).unwrap();
    // initialize 的首次连接不计入
    assert_eq!(probe.disconnect_calls(), 0);
    assert_eq!(probe.reconnect_calls(), 0);

    Fixture {
        _tmp: tmp,
        image,
        coordinator,
        probe,
    }
}

fn read_all(coordinator: &DiskCoordinator, path: &str) -> Vec<u8> {
    coordinator.read_file(path).unwrap().into_bytes()
}

#[test]
fn write_then_read_back() {
    let f = fixture(10);
    let data = b"hello";

    f.coordinator
        .begin_transaction(|tx| tx.write_file("/test.txt", &data[..], data.len() as u64))
        .unwrap();

    assert_eq!(read_all(&f.coordinator, "/test.txt"), data);
    assert_eq!(f.coordinator.image_path(), f.image);
    assert!(f.probe.is_connected());
}

#[test]
fn never_opened_disk_is_not_initialized() {
    let link = SimulatedLink::new();
    let probe = link.probe();
    let coordinator = DiskCoordinator::from_parts(
        VirtualDisk::unopened("/nonexistent/disk.img"),
        Box::new(DirectWriter::new()),
        Box::new(link),
    );
    assert!(!coordinator.is_initialized());

    let ran = AtomicBool::new(false);
    let err = coordinator
        .begin_transaction(|_| {
            ran.store(true, Ordering::SeqCst);
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, DiskError::NotInitialized));
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(probe.disconnect_calls(), 0);

    assert!(matches!(
        coordinator.read_file("/test.txt"),
        Err(DiskError::NotInitialized)
    ));
    assert!(matches!(
        coordinator.clear_files(),
        Err(DiskError::NotInitialized)
    ));
}

#[test]
fn missing_image_fails_construction() {
    let tmp = tempfile::tempdir().unwrap();
    let config = DiskConfig {
        path: tmp.path().join("absent.img"),
        ..DiskConfig::default()
    };
    let link = SimulatedLink::new();
    let probe = link.probe();
    let err = DiskCoordinator::new(&config, Box::new(link)).unwrap_err();
    assert!(matches!(err, DiskError::ImageMissing { .. }));
    assert_eq!(probe.state(), LinkState::Uninitialized);
}

#[test]
fn link_failure_fails_construction_and_cleans_up() {
    let tmp = tempfile::tempdir().unwrap();
    let image = tmp.path().join("test.img");
    create_disk_image(&image, 4).unwrap();
    let config = DiskConfig {
        path: image.clone(),
        size_mb: 4,
        ..DiskConfig::default()
    };
    let descriptor = GadgetDescriptor {
        short_name: "embroidery".to_string(),
        vendor_id: 0x1d6b,
        product_id: 0x0104,
        bcd_device: 0x0100,
        bcd_usb: 0x0200,
        manufacturer: "Embroidery Buddy".to_string(),
        product: "Embroidery USB Storage".to_string(),
        serial_number: "000000000000".to_string(),
        backing_file: image,
    };

    // 有 configfs 但没有 UDC：已建立的目录树必须被拆掉
    let port = MemoryPort::with_controllers(&[]);
    let link = GadgetLink::new(descriptor, port.clone());
    let err = DiskCoordinator::new(&config, Box::new(link)).unwrap_err();
    assert!(matches!(err, DiskError::LinkUnavailable { .. }));
    assert!(port.is_empty());
}

#[test]
fn missing_file_is_not_found() {
    let f = fixture(10);
    match f.coordinator.read_file("/missing.txt") {
        Err(DiskError::NotFound { path }) => assert_eq!(path, "/missing.txt"),
        other => panic!("expected NotFound, got {:?}", other.map(|c| c.len())),
    }
}

#[test]
fn one_bracket_for_many_files() {
    let f = fixture(10);
    let files: [(&str, &[u8]); 5] = [
        ("/a.txt", b"first"),
        ("/b.dst", b"second file"),
        ("/designs/flower.pes", b"\x23PES0001"),
        ("/designs/2024/spring/tulip.jef", b"tulip"),
        ("notes/readme.txt", b"relative path"),
    ];

    f.coordinator
        .begin_transaction(|tx| {
            for (path, data) in files {
                tx.write_file(path, data, data.len() as u64)?;
            }
            Ok(())
        })
        .unwrap();

    assert_eq!(f.probe.disconnect_calls(), 1);
    assert_eq!(f.probe.reconnect_calls(), 1);
    for (path, data) in files {
        assert_eq!(read_all(&f.coordinator, path), data, "path {}", path);
    }
    assert_eq!(read_all(&f.coordinator, "/notes/readme.txt"), b"relative path");
}

#[test]
fn empty_transaction_still_brackets_once() {
    let f = fixture(10);
    f.coordinator.begin_transaction(|_| Ok(())).unwrap();
    assert_eq!(f.probe.disconnect_calls(), 1);
    assert_eq!(f.probe.reconnect_calls(), 1);
}

#[test]
fn empty_and_binary_content_round_trip() {
    let f = fixture(10);
    let binary: Vec<u8> = (0..=255u8).cycle().take(70_000).collect();
    let utf8 = "刺绣 ü ß".as_bytes();

    f.coordinator
        .begin_transaction(|tx| {
            tx.write_file("/empty.bin", &b""[..], 0)?;
            tx.write_file("/binary.bin", binary.as_slice(), binary.len() as u64)?;
            tx.write_file("/utf8.txt", utf8, utf8.len() as u64)
        })
        .unwrap();

    assert!(f.coordinator.read_file("/empty.bin").unwrap().is_empty());
    assert_eq!(read_all(&f.coordinator, "/binary.bin"), binary);
    assert_eq!(read_all(&f.coordinator, "/utf8.txt"), utf8);
}

#[test]
fn paths_are_normalized_before_reaching_disk() {
    let f = fixture(10);
    f.coordinator
        .begin_transaction(|tx| tx.write_file("a/./b/../c.txt", &b"c"[..], 1))
        .unwrap();
    assert_eq!(read_all(&f.coordinator, "/a/c.txt"), b"c");
    assert_eq!(read_all(&f.coordinator, "//a//c.txt"), b"c");
    assert_eq!(read_all(&f.coordinator, "/../../a/c.txt"), b"c");
}

#[test]
fn disconnect_failure_skips_body() {
    let f = fixture(10);
    f.probe.fail_next_disconnect();

    let ran = AtomicBool::new(false);
    let err = f
        .coordinator
        .begin_transaction(|tx| {
            ran.store(true, Ordering::SeqCst);
            tx.write_file("/never.txt", &b"x"[..], 1)
        })
        .unwrap_err();

    assert!(matches!(err, DiskError::LinkUnavailable { .. }));
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(f.probe.reconnect_calls(), 0);
    assert!(matches!(
        f.coordinator.read_file("/never.txt"),
        Err(DiskError::NotFound { .. })
    ));
}

#[test]
fn reconnect_failure_does_not_fail_transaction() {
    let f = fixture(10);
    f.probe.set_fail_reconnect(true);

    f.coordinator
        .begin_transaction(|tx| tx.write_file("/kept.txt", &b"kept"[..], 4))
        .unwrap();
    assert_eq!(f.probe.reconnect_calls(), 1);
    assert_eq!(f.coordinator.link_state(), LinkState::Disconnected);
    assert_eq!(read_all(&f.coordinator, "/kept.txt"), b"kept");

    // 下一次事务照常进行，重连恢复
    f.probe.set_fail_reconnect(false);
    f.coordinator.begin_transaction(|_| Ok(())).unwrap();
    assert_eq!(f.coordinator.link_state(), LinkState::Connected);
}

#[test]
fn panicking_body_still_reconnects() {
    let f = fixture(10);
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let _ = f.coordinator.begin_transaction(|tx| -> Result<(), DiskError> {
            tx.write_file("/partial.txt", &b"partial"[..], 7)?;
            panic!("body exploded");
        });
    }));
    assert!(result.is_err());
    assert_eq!(f.probe.disconnect_calls(), 1);
    assert_eq!(f.probe.reconnect_calls(), 1);
    assert!(f.probe.is_connected());

    // 锁中毒后仍可使用
    assert_eq!(read_all(&f.coordinator, "/partial.txt"), b"partial");
    f.coordinator.begin_transaction(|_| Ok(())).unwrap();
}

#[test]
fn disk_full_reports_insufficient_space_and_keeps_earlier_files() {
    let f = fixture(2);
    let big = vec![0xa5u8; 3 * 1024 * 1024];

    let err = f
        .coordinator
        .begin_transaction(|tx| {
            tx.write_file("/small.txt", &b"small"[..], 5)?;
            tx.write_file("/big.bin", big.as_slice(), big.len() as u64)
        })
        .unwrap_err();

    assert!(matches!(err, DiskError::InsufficientSpace { .. }));
    assert!(err.user_message().is_some());
    assert_eq!(read_all(&f.coordinator, "/small.txt"), b"small");
    assert!(f.probe.is_connected());
}

#[test]
fn transactions_never_overlap() {
    let f = fixture(10);
    let coordinator = Arc::new(f.coordinator);
    let windows = Arc::new(Mutex::new(Vec::<(Instant, Instant)>::new()));
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let coordinator = Arc::clone(&coordinator);
            let windows = Arc::clone(&windows);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                coordinator
                    .begin_transaction(|tx| {
                        let enter = Instant::now();
                        let name = format!("/worker-{}.txt", i);
                        tx.write_file(&name, name.as_bytes(), name.len() as u64)?;
                        thread::sleep(Duration::from_millis(30));
                        windows.lock().unwrap().push((enter, Instant::now()));
                        Ok(())
                    })
                    .unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let mut windows = windows.lock().unwrap().clone();
    windows.sort();
    assert_eq!(windows.len(), 4);
    for pair in windows.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "bodies overlapped: {:?}", pair);
    }

    let kinds: Vec<LinkEventKind> = f.probe.events().iter().map(|e| e.kind).collect();
    assert_eq!(kinds.len(), 8);
    for pair in kinds.chunks(2) {
        assert_eq!(pair, [LinkEventKind::Disconnect, LinkEventKind::Reconnect]);
    }
    for i in 0..4 {
        let name = format!("/worker-{}.txt", i);
        assert_eq!(read_all(&coordinator, &name), name.as_bytes());
    }
}

#[test]
fn concurrent_reads() {
    let f = fixture(10);
    f.coordinator
        .begin_transaction(|tx| tx.write_file("/shared.txt", &b"shared"[..], 6))
        .unwrap();

    let coordinator = Arc::new(f.coordinator);
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let coordinator = Arc::clone(&coordinator);
            thread::spawn(move || read_all(&coordinator, "/shared.txt"))
        })
        .collect();
    for h in handles {
        assert_eq!(h.join().unwrap(), b"shared");
    }
}

#[test]
fn clear_files_wipes_disk_under_bracket() {
    let f = fixture(10);
    f.coordinator
        .begin_transaction(|tx| {
            tx.write_file("/one.txt", &b"1"[..], 1)?;
            tx.write_file("/dir/two.txt", &b"2"[..], 1)
        })
        .unwrap();
    f.probe.reset_counts();

    f.coordinator.clear_files().unwrap();
    assert_eq!(f.probe.disconnect_calls(), 1);
    assert_eq!(f.probe.reconnect_calls(), 1);
    assert!(matches!(
        f.coordinator.read_file("/one.txt"),
        Err(DiskError::NotFound { .. })
    ));
    assert!(matches!(
        f.coordinator.read_file("/dir/two.txt"),
        Err(DiskError::NotFound { .. })
    ));

    // 清空后仍可写入
    f.coordinator
        .begin_transaction(|tx| tx.write_file("/again.txt", &b"again"[..], 5))
        .unwrap();
    assert_eq!(read_all(&f.coordinator, "/again.txt"), b"again");
}

#[test]
fn clear_files_skips_reformat_when_disconnect_fails() {
    let f = fixture(10);
    f.coordinator
        .begin_transaction(|tx| tx.write_file("/keep.txt", &b"keep"[..], 4))
        .unwrap();
    f.probe.reset_counts();
    f.probe.fail_next_disconnect();

    let err = f.coordinator.clear_files().unwrap_err();
    assert!(matches!(err, DiskError::LinkUnavailable { .. }));
    assert_eq!(f.probe.disconnect_calls(), 1);
    assert_eq!(f.probe.reconnect_calls(), 0);
    assert!(f.probe.is_connected());
    assert_eq!(read_all(&f.coordinator, "/keep.txt"), b"keep");
}

#[test]
fn close_is_idempotent() {
    let f = fixture(10);
    f.coordinator.close();
    f.coordinator.close();

    assert_eq!(f.probe.state(), LinkState::Destroyed);
    assert!(!f.probe.is_connected());
    assert!(!f.coordinator.is_initialized());
    assert!(matches!(
        f.coordinator.begin_transaction(|_| Ok(())),
        Err(DiskError::NotInitialized)
    ));
    assert!(matches!(
        f.coordinator.read_file("/test.txt"),
        Err(DiskError::NotInitialized)
    ));
}
