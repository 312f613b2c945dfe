use super::*;
use crate::uevent::{decode_kernel, UeventProperties};
use std::cell::RefCell;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use tempfile::tempdir;

fn known_subsystems(name: &str) -> io::Result<bool> {
    Ok(matches!(name, "usb" | "block" | "net" | "input"))
}

#[derive(Clone)]
struct CountingProbe {
    calls: Rc<RefCell<Vec<String>>>,
}

impl SubsystemProbe for CountingProbe {
    fn subsystem_exists(&self, name: &str) -> io::Result<bool> {
        self.calls.borrow_mut().push(name.to_string());
        known_subsystems(name)
    }
}

fn add(devpath: &str, subsystem: &str, devtype: Option<&str>) -> Uevent {
    Uevent::synthetic_add(
        devpath,
        subsystem,
        UeventProperties {
            devtype: devtype.map(str::to_string),
            devname: None,
            modalias: None,
        },
    )
}

fn event(action: Action, devpath: &str, devpath_old: Option<&str>) -> Uevent {
    Uevent {
        action,
        devpath: devpath.to_string(),
        subsystem: "block".into(),
        devtype: None,
        devname: None,
        modalias: None,
        devpath_old: devpath_old.map(str::to_string),
        seqnum: 1,
    }
}

fn added(change: Option<TreeChange>) -> DeviceId {
    match change {
        Some(TreeChange::Added(id)) => id,
        other => panic!("expected Added, got {other:?}"),
    }
}

type Log = Rc<RefCell<Vec<(&'static str, Result<i32, SysfdError>)>>>;

fn recorder(log: &Log, name: &'static str) -> impl FnOnce(Result<BorrowedFd<'_>, SysfdError>) {
    let log = Rc::clone(log);
    move |result: Result<BorrowedFd<'_>, SysfdError>| {
        log.borrow_mut()
            .push((name, result.map(|fd| fd.as_raw_fd())));
    }
}

fn open_dir(path: &std::path::Path) -> io::Result<OwnedFd> {
    File::open(path).map(OwnedFd::from)
}

#[test]
fn add_prepends_to_devtype_list() {
    let mut tree = DeviceTree::new(known_subsystems);
    let first = added(
        tree.apply(&add("pci0/usb1/1-1", "usb", Some("usb_device")))
            .unwrap(),
    );
    let second = added(
        tree.apply(&add("pci0/usb1/1-2", "usb", Some("usb_device")))
            .unwrap(),
    );
    added(tree.apply(&add("pci0/usb1/1-2/1-2:1.0", "usb", None)).unwrap());

    let order: Vec<&str> = tree
        .devices_of("usb", Some("usb_device"))
        .map(Device::devpath)
        .collect();
    assert_eq!(order, vec!["pci0/usb1/1-2", "pci0/usb1/1-1"]);
    assert_eq!(tree.devices_of("usb", None).count(), 1);
    assert_eq!(tree.lookup("pci0/usb1/1-1"), Some(first));
    assert_eq!(tree.device(second).unwrap().subsystem(), Some("usb"));
    assert_eq!(tree.len(), 3);
}

#[test]
fn duplicate_add_is_change_until_settled() {
    let mut tree = DeviceTree::new(known_subsystems);
    let id = added(tree.apply(&add("virtual/block/loop0", "block", Some("disk"))).unwrap());

    let change = tree
        .apply(&add("virtual/block/loop0", "block", Some("disk")))
        .unwrap();
    assert_eq!(
        change,
        Some(TreeChange::Changed {
            id,
            kind: ChangeKind::Change
        })
    );
    assert_eq!(tree.len(), 1);
    assert_eq!(tree.devices_of("block", Some("disk")).count(), 1);

    tree.settle();
    let err = tree
        .apply(&add("virtual/block/loop0", "block", Some("disk")))
        .unwrap_err();
    assert!(matches!(err, DeviceError::UnexpectedEvent { action: "add", .. }));
    assert!(err.is_fatal());
}

#[test]
fn remove_of_unknown_device_is_benign_while_enumerating() {
    let mut tree = DeviceTree::new(known_subsystems);
    let event =
        decode_kernel(b"ACTION=remove\0DEVPATH=/devices/foo\0SUBSYSTEM=usb\0SEQNUM=42\0").unwrap();
    assert_eq!(tree.apply(&event).unwrap(), None);
    assert!(tree.is_empty());

    tree.settle();
    let err = tree.apply(&event).unwrap_err();
    assert!(matches!(
        err,
        DeviceError::UnexpectedEvent {
            action: "remove",
            ..
        }
    ));
}

#[test]
fn change_of_unknown_device_depends_on_state() {
    let mut tree = DeviceTree::new(known_subsystems);
    let err = tree
        .apply(&event(Action::Change, "virtual/block/loop1", None))
        .unwrap_err();
    assert!(matches!(err, DeviceError::DependencyUnavailable { .. }));
    assert!(!err.is_fatal());

    tree.settle();
    let err = tree
        .apply(&event(Action::Offline, "virtual/block/loop1", None))
        .unwrap_err();
    assert!(matches!(
        err,
        DeviceError::UnexpectedEvent {
            action: "offline",
            ..
        }
    ));
}

#[test]
fn online_and_offline_are_changes() {
    let mut tree = DeviceTree::new(known_subsystems);
    let id = added(tree.apply(&add("system/cpu/cpu1", "block", None)).unwrap());
    tree.settle();
    for (action, kind) in [
        (Action::Online, ChangeKind::Online),
        (Action::Offline, ChangeKind::Offline),
    ] {
        let change = tree.apply(&event(action, "system/cpu/cpu1", None)).unwrap();
        assert_eq!(change, Some(TreeChange::Changed { id, kind }));
    }
}

#[test]
fn move_without_old_devpath_is_rejected() {
    let mut tree = DeviceTree::new(known_subsystems);
    let err = tree
        .apply(&event(Action::Move, "virtual/net/wlan0", None))
        .unwrap_err();
    assert!(matches!(err, DeviceError::MissingOldDevpath { .. }));
    assert!(!err.is_fatal());
}

#[test]
fn add_remove_add_yields_fresh_device() {
    let mut tree = DeviceTree::new(known_subsystems);
    let log: Log = Rc::default();

    let first = added(tree.apply(&add("virtual/block/loop2", "block", Some("disk"))).unwrap());
    tree.device_call_with_sysfd(first, recorder(&log, "old"));
    assert_eq!(tree.take_sysfd_requests().len(), 1);

    let removed = tree
        .apply(&event(Action::Remove, "virtual/block/loop2", None))
        .unwrap();
    assert!(matches!(removed, Some(TreeChange::Removed { .. })));
    assert_eq!(log.borrow().as_slice(), &[("old", Err(SysfdError::Gone))]);
    assert_eq!(tree.devices_of("block", Some("disk")).count(), 0);

    let second = added(tree.apply(&add("virtual/block/loop2", "block", Some("disk"))).unwrap());
    assert_ne!(first, second);
    assert_eq!(tree.device(second).unwrap().pending_subscribers(), 0);
    assert!(tree.device(first).is_none());
    assert_eq!(log.borrow().len(), 1);
}

#[test]
fn invalid_subsystem_is_tracked_but_reprobed() {
    let calls = Rc::new(RefCell::new(Vec::new()));
    let mut tree = DeviceTree::new(CountingProbe {
        calls: Rc::clone(&calls),
    });

    let ghost = added(tree.apply(&add("platform/ghost0", "ghost", None)).unwrap());
    added(tree.apply(&add("platform/ghost1", "ghost", None)).unwrap());
    added(tree.apply(&add("virtual/net/lo", "net", None)).unwrap());
    added(tree.apply(&add("virtual/net/eth0", "net", None)).unwrap());

    assert_eq!(
        calls.borrow().as_slice(),
        &["ghost".to_string(), "ghost".to_string(), "net".to_string()]
    );
    assert_eq!(tree.device(ghost).unwrap().subsystem(), None);
    assert!(tree.lookup("platform/ghost1").is_some());
    assert_eq!(tree.subsystems().collect::<Vec<_>>(), vec!["net"]);

    assert!(tree.apply(&event(Action::Remove, "platform/ghost0", None)).is_ok());
    assert!(tree.lookup("platform/ghost0").is_none());
}

#[test]
fn probe_failure_is_reported_without_inserting() {
    let mut tree = DeviceTree::new(|_: &str| -> io::Result<bool> {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"))
    });
    let err = tree.apply(&add("virtual/misc/fuse", "misc", None)).unwrap_err();
    assert!(matches!(err, DeviceError::Probe { .. }));
    assert!(!err.is_fatal());
    assert!(tree.lookup("virtual/misc/fuse").is_none());

    let mut tree = DeviceTree::new(|_: &str| -> io::Result<bool> {
        Err(io::Error::from_raw_os_error(libc::EMFILE))
    });
    let err = tree.apply(&add("virtual/misc/fuse", "misc", None)).unwrap_err();
    assert!(err.is_fatal());
}

#[test]
fn empty_devtype_is_freed_but_subsystem_stays() {
    let mut tree = DeviceTree::new(known_subsystems);
    added(tree.apply(&add("virtual/input/input3", "input", Some("kbd"))).unwrap());
    tree.apply(&event(Action::Remove, "virtual/input/input3", None))
        .unwrap();

    let subsystem = tree.subsystems.get("input").unwrap();
    assert!(subsystem.devtypes.is_empty());
    assert_eq!(tree.subsystems().collect::<Vec<_>>(), vec!["input"]);
}

#[test]
fn subscribers_share_one_open_and_fire_once() {
    let dir = tempdir().unwrap();
    let mut tree = DeviceTree::new(known_subsystems);
    let log: Log = Rc::default();
    let id = added(tree.apply(&add("virtual/block/loop3", "block", None)).unwrap());

    tree.device_call_with_sysfd(id, recorder(&log, "first"));
    tree.device_call_with_sysfd(id, recorder(&log, "second"));
    let requests = tree.take_sysfd_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].devpath, "virtual/block/loop3");
    assert_eq!(tree.device(id).unwrap().pending_subscribers(), 2);

    let fired = tree
        .sysfd_ready(requests[0].token, open_dir(dir.path()))
        .unwrap();
    assert_eq!(fired, 2);
    {
        let log = log.borrow();
        let names: Vec<_> = log.iter().map(|(name, _)| *name).collect();
        assert_eq!(names, vec!["second", "first"]);
        assert!(log.iter().all(|(_, result)| matches!(result, Ok(fd) if *fd >= 0)));
    }

    // Replayed readiness for the same token does nothing.
    assert_eq!(
        tree.sysfd_ready(requests[0].token, open_dir(dir.path()))
            .unwrap(),
        0
    );
    assert_eq!(log.borrow().len(), 2);

    // Handle was closed; the next subscriber triggers a fresh open.
    tree.device_call_with_sysfd(id, recorder(&log, "third"));
    let again = tree.take_sysfd_requests();
    assert_eq!(again.len(), 1);
    assert_ne!(again[0].token, requests[0].token);
}

#[test]
fn late_subscriber_of_removed_device_fails_immediately() {
    let dir = tempdir().unwrap();
    let mut tree = DeviceTree::new(known_subsystems);
    let log: Log = Rc::default();
    let id = added(tree.apply(&add("virtual/block/loop4", "block", None)).unwrap());
    tree.device_call_with_sysfd(id, recorder(&log, "pending"));
    let token = tree.take_sysfd_requests()[0].token;

    tree.apply(&event(Action::Remove, "virtual/block/loop4", None))
        .unwrap();
    tree.device_call_with_sysfd(id, recorder(&log, "late"));
    assert!(tree.take_sysfd_requests().is_empty());

    assert_eq!(tree.sysfd_ready(token, open_dir(dir.path())).unwrap(), 0);
    assert_eq!(
        log.borrow().as_slice(),
        &[
            ("pending", Err(SysfdError::Gone)),
            ("late", Err(SysfdError::Gone))
        ]
    );
}

#[test]
fn move_carries_subscribers_to_new_devpath() {
    let dir = tempdir().unwrap();
    let mut tree = DeviceTree::new(known_subsystems);
    let log: Log = Rc::default();

    let mut wlan = add("virtual/net/wlp2s0", "net", Some("wlan"));
    wlan.modalias = Some("pci:v00008086".into());
    let old = added(tree.apply(&wlan).unwrap());
    tree.device_call_with_sysfd(old, recorder(&log, "a"));
    tree.device_call_with_sysfd(old, recorder(&log, "b"));
    let stale = tree.take_sysfd_requests()[0].token;

    tree.settle();
    let change = tree
        .apply(&event(
            Action::Move,
            "virtual/net/wlan0",
            Some("virtual/net/wlp2s0"),
        ))
        .unwrap();
    let (id, devpath_old) = match change {
        Some(TreeChange::Moved { id, devpath_old }) => (id, devpath_old),
        other => panic!("expected Moved, got {other:?}"),
    };
    assert_eq!(devpath_old, "virtual/net/wlp2s0");
    assert_ne!(id, old);
    assert!(tree.lookup("virtual/net/wlp2s0").is_none());

    let moved = tree.device(id).unwrap();
    assert_eq!(moved.devpath(), "virtual/net/wlan0");
    assert_eq!(moved.devtype(), Some("wlan"));
    assert_eq!(moved.modalias(), Some("pci:v00008086"));
    assert_eq!(moved.pending_subscribers(), 2);
    assert_eq!(tree.devices_of("net", Some("wlan")).count(), 1);

    let reissued = tree.take_sysfd_requests();
    assert_eq!(reissued.len(), 1);
    assert_eq!(reissued[0].devpath, "virtual/net/wlan0");

    assert_eq!(tree.sysfd_ready(stale, open_dir(dir.path())).unwrap(), 0);
    assert!(log.borrow().is_empty());

    assert_eq!(
        tree.sysfd_ready(reissued[0].token, open_dir(dir.path()))
            .unwrap(),
        2
    );
    let log = log.borrow();
    let names: Vec<_> = log.iter().map(|(name, _)| *name).collect();
    assert_eq!(names, vec!["b", "a"]);
    assert!(log.iter().all(|(_, result)| result.is_ok()));
}

#[test]
fn move_onto_existing_devpath() {
    let mut tree = DeviceTree::new(known_subsystems);
    let log: Log = Rc::default();
    let old = added(tree.apply(&add("virtual/net/eth1", "net", None)).unwrap());
    let new = added(tree.apply(&add("virtual/net/lan0", "net", None)).unwrap());
    tree.device_call_with_sysfd(old, recorder(&log, "old"));

    // Enumeration raced the rename: keep the new entry, drop the old one.
    let change = tree
        .apply(&event(Action::Move, "virtual/net/lan0", Some("virtual/net/eth1")))
        .unwrap();
    assert_eq!(
        change,
        Some(TreeChange::Changed {
            id: new,
            kind: ChangeKind::Change
        })
    );
    assert!(tree.lookup("virtual/net/eth1").is_none());
    assert_eq!(log.borrow().as_slice(), &[("old", Err(SysfdError::Gone))]);

    added(tree.apply(&add("virtual/net/eth2", "net", None)).unwrap());
    tree.settle();
    let err = tree
        .apply(&event(Action::Move, "virtual/net/lan0", Some("virtual/net/eth2")))
        .unwrap_err();
    assert!(err.is_fatal());
    assert!(tree.lookup("virtual/net/eth2").is_some());
    assert!(tree.lookup("virtual/net/lan0").is_some());
}

#[test]
fn move_of_unknown_device_follows_remove_policy() {
    let mut tree = DeviceTree::new(known_subsystems);
    let change = tree
        .apply(&event(Action::Move, "virtual/net/wlan1", Some("virtual/net/wlan9")))
        .unwrap();
    assert_eq!(change, None);
    assert!(tree.lookup("virtual/net/wlan1").is_none());

    tree.settle();
    let err = tree
        .apply(&event(Action::Move, "virtual/net/wlan1", Some("virtual/net/wlan9")))
        .unwrap_err();
    assert!(matches!(err, DeviceError::UnexpectedEvent { action: "move", .. }));
}

#[test]
fn descriptor_exhaustion_fails_subscribers_and_is_fatal() {
    let mut tree = DeviceTree::new(known_subsystems);
    let log: Log = Rc::default();
    let id = added(tree.apply(&add("virtual/block/loop5", "block", None)).unwrap());
    tree.device_call_with_sysfd(id, recorder(&log, "only"));
    let token = tree.take_sysfd_requests()[0].token;

    let err = tree
        .sysfd_ready(token, Err(io::Error::from_raw_os_error(libc::EMFILE)))
        .unwrap_err();
    assert!(matches!(err, DeviceError::ResourceExhausted { .. }));
    assert!(err.is_fatal());
    assert!(matches!(
        log.borrow().as_slice(),
        [("only", Err(SysfdError::Open(_)))]
    ));
    assert_eq!(tree.device(id).unwrap().pending_subscribers(), 0);

    tree.device_call_with_sysfd(id, |_| {});
    assert_eq!(tree.take_sysfd_requests().len(), 1);
}
