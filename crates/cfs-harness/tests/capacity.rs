#![forbid(unsafe_code)]

use cfs::FsError;
use cfs_harness::mounted;

#[test]
fn directory_fills_at_128_entries() {
    let (mut fs, _dev) = mounted(8);

    for index in 0..128 {
        fs.create(&format!("f{index}")).expect("create within capacity");
    }
    assert_eq!(fs.info().expect("info").free_directory_entries, 0);

    match fs.create("straggler") {
        Err(FsError::DirectoryFull) => {}
        other => panic!("expected DirectoryFull, got {other:?}"),
    }

    // Freeing any slot makes create work again, reusing that slot.
    fs.delete("f77").expect("delete");
    fs.create("replacement").expect("create after delete");
    let rows: Vec<_> = fs.list().expect("list").collect();
    assert_eq!(rows[77].name, "replacement");
}

#[test]
fn open_table_fills_at_32_descriptors() {
    let (mut fs, _dev) = mounted(8);
    fs.create("shared").expect("create");

    let mut fds = Vec::new();
    for expected in 0..32 {
        let fd = fs.open("shared").expect("open within capacity");
        assert_eq!(fd.0, expected, "descriptors are the lowest free slot");
        fds.push(fd);
    }

    match fs.open("shared") {
        Err(FsError::TooManyOpen) => {}
        other => panic!("expected TooManyOpen, got {other:?}"),
    }

    // Closing one slot frees exactly that descriptor id for reuse.
    fs.close(fds[5]).expect("close");
    assert_eq!(fs.open("shared").expect("reopen").0, 5);

    for fd in fds {
        fs.close(fd).expect("close");
    }
    fs.unmount().expect("unmount with all closed");
}

#[test]
fn delete_waits_for_every_descriptor() {
    let (mut fs, _dev) = mounted(8);
    fs.create("busy").expect("create");
    let first = fs.open("busy").expect("open");
    let second = fs.open("busy").expect("open");

    assert!(matches!(fs.delete("busy"), Err(FsError::Busy(_))));
    fs.close(first).expect("close");
    assert!(matches!(fs.delete("busy"), Err(FsError::Busy(_))));
    fs.close(second).expect("close");
    fs.delete("busy").expect("delete once fully closed");
}

#[test]
fn failed_operations_leave_tables_untouched() {
    let (mut fs, _dev) = mounted(8);
    fs.create("a").expect("create");
    let fd = fs.open("a").expect("open");
    let before = fs.info().expect("info");

    assert!(matches!(fs.delete("missing"), Err(FsError::NotFound(_))));
    assert!(matches!(fs.open("missing"), Err(FsError::NotFound(_))));
    assert!(matches!(
        fs.close(cfs::Fd(31)),
        Err(FsError::BadDescriptor(31))
    ));
    assert!(matches!(fs.create("a"), Err(FsError::AlreadyExists(_))));

    assert_eq!(fs.info().expect("info"), before);

    fs.close(fd).expect("close");
    assert!(matches!(fs.close(fd), Err(FsError::BadDescriptor(0))));
    assert_eq!(fs.info().expect("info").open_descriptors, 0);
}
