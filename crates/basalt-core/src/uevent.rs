//! Kernel uevent wire format.
//!
//! Netlink datagrams are NUL-separated `KEY=VALUE` records: `ACTION`,
//! `DEVPATH` and `SUBSYSTEM` come first and in that order, `DEVPATH_OLD`
//! follows for moves, `SEQNUM` closes the datagram. Everything in between is
//! unordered. `/sys/.../uevent` files carry the unordered part only, one
//! record per line.

use std::fmt;
use std::str;
use thiserror::Error;

/// Every devpath we accept lives below this prefix.
pub const DEVICES_ROOT: &str = "/devices/";

/// Multicast group the kernel broadcasts uevents on.
pub const KERNEL_UEVENT_GROUP: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UeventError {
    #[error("datagram is not NUL terminated")]
    MissingTerminator,
    #[error("record `{0}` has no `=`")]
    MissingSeparator(String),
    #[error("expected `{expected}` record, found `{found}`")]
    UnexpectedField { expected: &'static str, found: String },
    #[error("unknown action `{0}`")]
    UnknownAction(String),
    #[error("SEQNUM `{0}` is not a number")]
    InvalidSeqnum(String),
    #[error("record is not valid UTF-8")]
    NotUtf8,
    #[error("devpath `{0}` is outside {DEVICES_ROOT}")]
    OutsideDevicesRoot(String),
    #[error("sender port {0} is not the kernel")]
    ForeignSender(u32),
    #[error("multicast group {0} is not the kernel uevent group")]
    WrongGroup(u32),
    #[error("datagram carries no sender credentials")]
    MissingCredentials,
    #[error("sender uid {0} is not root")]
    UnprivilegedSender(u32),
}

impl UeventError {
    /// Events for pseudo-paths such as `/module/...` are legitimate kernel
    /// traffic that the device tree simply does not track.
    pub fn is_skip(&self) -> bool {
        matches!(self, UeventError::OutsideDevicesRoot(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Add,
    Remove,
    Change,
    Move,
    Online,
    Offline,
}

impl Action {
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "add" => Action::Add,
            "remove" => Action::Remove,
            "change" => Action::Change,
            "move" => Action::Move,
            "online" => Action::Online,
            "offline" => Action::Offline,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Add => "add",
            Action::Remove => "remove",
            Action::Change => "change",
            Action::Move => "move",
            Action::Online => "online",
            Action::Offline => "offline",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded uevent. `devpath` and `devpath_old` are relative to
/// [`DEVICES_ROOT`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uevent {
    pub action: Action,
    pub devpath: String,
    pub subsystem: String,
    pub devtype: Option<String>,
    pub devname: Option<String>,
    pub modalias: Option<String>,
    pub devpath_old: Option<String>,
    pub seqnum: u64,
}

/// Properties found in a `/sys/.../uevent` file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UeventProperties {
    pub devtype: Option<String>,
    pub devname: Option<String>,
    pub modalias: Option<String>,
}

/// Credentials attached to a netlink datagram via `SCM_CREDENTIALS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderCredentials {
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
}

impl Uevent {
    /// ADD event synthesised from a `/sys` scan; seqnum 0 marks it as such.
    pub fn synthetic_add(devpath: &str, subsystem: &str, properties: UeventProperties) -> Self {
        Self {
            action: Action::Add,
            devpath: devpath.to_string(),
            subsystem: subsystem.to_string(),
            devtype: properties.devtype,
            devname: properties.devname,
            modalias: properties.modalias,
            devpath_old: None,
            seqnum: 0,
        }
    }

    /// Serialise into the kernel's netlink layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut push = |key: &str, value: &str| {
            out.extend_from_slice(key.as_bytes());
            out.push(b'=');
            out.extend_from_slice(value.as_bytes());
            out.push(0);
        };

        push("ACTION", self.action.as_str());
        push("DEVPATH", &format!("{DEVICES_ROOT}{}", self.devpath));
        push("SUBSYSTEM", &self.subsystem);
        if let Some(old) = &self.devpath_old {
            push("DEVPATH_OLD", &format!("{DEVICES_ROOT}{old}"));
        }
        if let Some(devtype) = &self.devtype {
            push("DEVTYPE", devtype);
        }
        if let Some(devname) = &self.devname {
            push("DEVNAME", devname);
        }
        if let Some(modalias) = &self.modalias {
            push("MODALIAS", modalias);
        }
        push("SEQNUM", &self.seqnum.to_string());
        out
    }
}

/// Decode one netlink datagram.
pub fn decode_kernel(buf: &[u8]) -> Result<Uevent, UeventError> {
    // The kernel always NUL-terminates the last record; a bare tail is truncation.
    let body = buf
        .strip_suffix(&[0])
        .ok_or(UeventError::MissingTerminator)?;

    let records: Vec<&[u8]> = body.split(|byte| *byte == 0).collect();
    let (last, rest) = records
        .split_last()
        .ok_or(UeventError::MissingTerminator)?;

    let (key, value) = split_record(last)?;
    if key != "SEQNUM" {
        return Err(UeventError::UnexpectedField {
            expected: "SEQNUM",
            found: key.to_string(),
        });
    }
    let seqnum = value
        .parse::<u64>()
        .map_err(|_| UeventError::InvalidSeqnum(value.to_string()))?;

    let rest = match rest.split_first() {
        Some((first, tail)) if is_summary_record(first) => tail,
        _ => rest,
    };

    let mut records = rest.iter().map(|record| split_record(*record));

    let action_value = expect_field(&mut records, "ACTION")?;
    let action = Action::parse(action_value)
        .ok_or_else(|| UeventError::UnknownAction(action_value.to_string()))?;
    let devpath = strip_devices_root(expect_field(&mut records, "DEVPATH")?)?;
    let subsystem = expect_field(&mut records, "SUBSYSTEM")?.to_string();
    let devpath_old = if action == Action::Move {
        Some(strip_devices_root(expect_field(&mut records, "DEVPATH_OLD")?)?)
    } else {
        None
    };

    let mut event = Uevent {
        action,
        devpath,
        subsystem,
        devtype: None,
        devname: None,
        modalias: None,
        devpath_old,
        seqnum,
    };

    for record in records {
        let (key, value) = record?;
        match key {
            "DEVTYPE" => event.devtype = Some(value.to_string()),
            "DEVNAME" => event.devname = Some(value.to_string()),
            "MODALIAS" => event.modalias = Some(value.to_string()),
            _ => {}
        }
    }

    Ok(event)
}

/// Parse the newline-separated contents of a `/sys/.../uevent` file.
pub fn parse_uevent_file(contents: &str) -> Result<UeventProperties, UeventError> {
    let mut properties = UeventProperties::default();
    for line in contents.lines() {
        if line.is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| UeventError::MissingSeparator(line.to_string()))?;
        match key {
            "DEVTYPE" => properties.devtype = Some(value.to_string()),
            "DEVNAME" => properties.devname = Some(value.to_string()),
            "MODALIAS" => properties.modalias = Some(value.to_string()),
            _ => {}
        }
    }
    Ok(properties)
}

/// Reject datagrams that did not come from the kernel's broadcast.
pub fn validate_sender(
    port: u32,
    groups: u32,
    credentials: Option<&SenderCredentials>,
) -> Result<(), UeventError> {
    if port != 0 {
        return Err(UeventError::ForeignSender(port));
    }
    if groups != KERNEL_UEVENT_GROUP {
        return Err(UeventError::WrongGroup(groups));
    }
    let credentials = credentials.ok_or(UeventError::MissingCredentials)?;
    if credentials.uid != 0 {
        return Err(UeventError::UnprivilegedSender(credentials.uid));
    }
    Ok(())
}

/// Strip [`DEVICES_ROOT`] from an absolute devpath.
pub fn strip_devices_root(value: &str) -> Result<String, UeventError> {
    value
        .strip_prefix(DEVICES_ROOT)
        .filter(|relative| !relative.is_empty())
        .map(str::to_string)
        .ok_or_else(|| UeventError::OutsideDevicesRoot(value.to_string()))
}

fn split_record(record: &[u8]) -> Result<(&str, &str), UeventError> {
    let text = str::from_utf8(record).map_err(|_| UeventError::NotUtf8)?;
    text.split_once('=')
        .ok_or_else(|| UeventError::MissingSeparator(text.to_string()))
}

// The kernel prefixes datagrams with `action@devpath`.
fn is_summary_record(record: &[u8]) -> bool {
    !record.starts_with(b"ACTION=") && record.contains(&b'@')
}

fn expect_field<'a, I>(records: &mut I, expected: &'static str) -> Result<&'a str, UeventError>
where
    I: Iterator<Item = Result<(&'a str, &'a str), UeventError>>,
{
    match records.next() {
        Some(record) => {
            let (key, value) = record?;
            if key == expected {
                Ok(value)
            } else {
                Err(UeventError::UnexpectedField {
                    expected,
                    found: key.to_string(),
                })
            }
        }
        None => Err(UeventError::UnexpectedField {
            expected,
            found: String::new(),
        }),
    }
}
