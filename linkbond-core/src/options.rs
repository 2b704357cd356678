//! Group options and deferred per-link configuration.
//!
//! Options arrive as opaque `(opt_id, bytes)` pairs. Recognized ids are
//! decoded into the typed [`GroupOptions`] view; every set option is also
//! kept in an ordered list so it can be replayed onto member links that join
//! later. Unknown options are stored but never dispatched.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::GroupError;
use crate::link::Link;
use crate::msg::{LIVE_DEF_PAYLOAD_SIZE, LIVE_MAX_PAYLOAD_SIZE};

/// Option identifier. Recognized values are the `OPT_*` constants; anything
/// else is carried opaquely.
pub type OptId = u16;

/// Send timeout in milliseconds; -1 blocks indefinitely.
pub const OPT_SND_TIMEOUT: OptId = 1;
/// Receive timeout in milliseconds; -1 blocks indefinitely.
pub const OPT_RCV_TIMEOUT: OptId = 2;
/// Stability timeout in milliseconds (backup link health).
pub const OPT_STABILITY_TIMEOUT: OptId = 3;
/// Enable time-stamp-based packet delivery (bool).
pub const OPT_TSBPD: OptId = 4;
/// TSBPD delay in milliseconds.
pub const OPT_TSBPD_DELAY: OptId = 5;
/// Enable dropping of undeliverable packets (bool).
pub const OPT_PACKET_DROP: OptId = 6;
/// Maximum payload size in bytes.
pub const OPT_PAYLOAD_SIZE: OptId = 7;
/// Blocking send mode (bool).
pub const OPT_SND_SYN: OptId = 8;
/// Blocking receive mode (bool).
pub const OPT_RCV_SYN: OptId = 9;

/// Options forwarded to each member link when it joins.
const LINK_OPTS: &[OptId] = &[
    OPT_TSBPD,
    OPT_TSBPD_DELAY,
    OPT_PACKET_DROP,
    OPT_PAYLOAD_SIZE,
];

/// One stored option: id plus its raw little-endian value bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigItem {
    pub opt: OptId,
    pub value: Vec<u8>,
}

impl ConfigItem {
    pub fn new(opt: OptId, value: &[u8]) -> ConfigItem {
        ConfigItem {
            opt,
            value: value.to_vec(),
        }
    }

    pub fn from_i32(opt: OptId, v: i32) -> ConfigItem {
        ConfigItem {
            opt,
            value: v.to_le_bytes().to_vec(),
        }
    }

    pub fn from_bool(opt: OptId, v: bool) -> ConfigItem {
        ConfigItem {
            opt,
            value: vec![v as u8],
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        let bytes: [u8; 4] = self.value.get(..4)?.try_into().ok()?;
        Some(i32::from_le_bytes(bytes))
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.value.first().map(|&b| b != 0)
    }
}

/// Typed view of the recognized group options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupOptions {
    /// `None` blocks indefinitely.
    pub snd_timeout: Option<Duration>,
    /// `None` blocks indefinitely.
    pub rcv_timeout: Option<Duration>,
    /// Max time since the last peer response before a running link counts
    /// as unstable.
    pub stability_timeout: Duration,
    pub tsbpd: bool,
    pub tsbpd_delay: Duration,
    /// When set, a missing sequence is declared dropped after a wait
    /// instead of stalling delivery forever.
    pub pkt_drop: bool,
    pub payload_size: usize,
    pub snd_syn: bool,
    pub rcv_syn: bool,
}

impl Default for GroupOptions {
    fn default() -> Self {
        GroupOptions {
            snd_timeout: None,
            rcv_timeout: None,
            stability_timeout: Duration::from_millis(60),
            tsbpd: true,
            tsbpd_delay: Duration::from_millis(120),
            pkt_drop: true,
            payload_size: LIVE_DEF_PAYLOAD_SIZE,
            snd_syn: true,
            rcv_syn: true,
        }
    }
}

fn timeout_from_ms(ms: i32) -> Result<Option<Duration>, GroupError> {
    if ms < -1 {
        return Err(GroupError::InvalidParam("negative timeout"));
    }
    if ms == -1 {
        return Ok(None);
    }
    Ok(Some(Duration::from_millis(ms as u64)))
}

impl GroupOptions {
    /// Decode one recognized option into the typed view.
    ///
    /// Returns `Ok(false)` for unrecognized ids (the caller still stores
    /// them), `Err(InvalidParam)` for a recognized id with a bad value.
    pub fn apply_item(&mut self, item: &ConfigItem) -> Result<bool, GroupError> {
        let want_i32 =
            || item.as_i32().ok_or(GroupError::InvalidParam("option value too short"));
        let want_bool =
            || item.as_bool().ok_or(GroupError::InvalidParam("option value empty"));

        match item.opt {
            OPT_SND_TIMEOUT => self.snd_timeout = timeout_from_ms(want_i32()?)?,
            OPT_RCV_TIMEOUT => self.rcv_timeout = timeout_from_ms(want_i32()?)?,
            OPT_STABILITY_TIMEOUT => {
                let ms = want_i32()?;
                if ms <= 0 {
                    return Err(GroupError::InvalidParam("stability timeout must be positive"));
                }
                self.stability_timeout = Duration::from_millis(ms as u64);
            }
            OPT_TSBPD => self.tsbpd = want_bool()?,
            OPT_TSBPD_DELAY => {
                let ms = want_i32()?;
                if ms < 0 {
                    return Err(GroupError::InvalidParam("negative tsbpd delay"));
                }
                self.tsbpd_delay = Duration::from_millis(ms as u64);
            }
            OPT_PACKET_DROP => self.pkt_drop = want_bool()?,
            OPT_PAYLOAD_SIZE => {
                let size = want_i32()?;
                if size <= 0 || size as usize > LIVE_MAX_PAYLOAD_SIZE {
                    return Err(GroupError::InvalidParam("payload size out of range"));
                }
                self.payload_size = size as usize;
            }
            OPT_SND_SYN => self.snd_syn = want_bool()?,
            OPT_RCV_SYN => self.rcv_syn = want_bool()?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

/// Store an option in the deferred list: insertion preserves order, a later
/// set of the same id overwrites in place.
pub(crate) fn store_config(config: &mut Vec<ConfigItem>, item: ConfigItem) {
    if let Some(existing) = config.iter_mut().find(|c| c.opt == item.opt) {
        existing.value = item.value;
    } else {
        config.push(item);
    }
}

/// Dispatch one option to a link if it is a per-link option; group-only and
/// unknown ids are never forwarded.
pub(crate) fn apply_item_to_link(item: &ConfigItem, link: &dyn Link) -> Result<(), GroupError> {
    if !LINK_OPTS.contains(&item.opt) {
        return Ok(());
    }
    link.apply_option(item)
        .map_err(|_| GroupError::InvalidParam("option rejected by member link"))
}

/// Replay the deferred option list onto a freshly joined link, in insertion
/// order.
pub(crate) fn apply_config_to_link(
    config: &[ConfigItem],
    link: &dyn Link,
) -> Result<(), GroupError> {
    for item in config {
        apply_item_to_link(item, link)?;
    }
    Ok(())
}
