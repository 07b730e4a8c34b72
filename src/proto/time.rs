//! Ticket lifetimes and clock handling.
//!
//! A lifetime travels as a single byte. Codes below 0x80 count five minute units, codes 0x80 to
//! 0xBF index a geometric table reaching thirty days, and 0xFF means the ticket never expires.

use crate::error::KrbError;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, trace};

/// The "never expires" end time.
pub const NEVERDATE: u32 = u32::MAX;

pub const NEVER_EXPIRES_LIFE: u8 = 0xff;

const LIFE_UNIT: u32 = 5 * 60;
const TABLE_FIRST_CODE: u8 = 0x80;
const TABLE_LAST_CODE: u8 = 0xbf;
const MAX_LIFETIME: u32 = 30 * 24 * 60 * 60;

/// Seconds for the codes 0x80 to 0xBF. Each step is about 6.9% longer than the last.
const LIFETIME_TABLE: [u32; 64] = [
    38400, 41055, 43894, 46929, 50174, 53643, 57352, 61318, 65558, 70091, 74937, 80119, 85658,
    91581, 97914, 104684, 111922, 119661, 127935, 136781, 146239, 156350, 167161, 178720, 191077,
    204289, 218415, 233517, 249664, 266926, 285383, 305116, 326213, 348769, 372885, 398668,
    426234, 455705, 487215, 520904, 556921, 595430, 636601, 680618, 727680, 777995, 831789,
    889303, 950794, 1016537, 1086825, 1161973, 1242318, 1328218, 1420057, 1518247, 1623226,
    1735464, 1855462, 1983758, 2120925, 2267576, 2424367, 2592000,
];

/// How lifetime codes are interpreted. `Short` is the older linear-only form, where every code
/// (including 0xFF) counts five minute units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifetimeCodec {
    #[default]
    Table,
    Short,
}

impl LifetimeCodec {
    pub fn from_short_lifetimes(short: bool) -> Self {
        if short {
            LifetimeCodec::Short
        } else {
            LifetimeCodec::Table
        }
    }

    /// The absolute end time of a ticket issued at `start` with lifetime `code`.
    pub fn life_to_time(self, start: u32, code: u8) -> u32 {
        match self {
            LifetimeCodec::Short => start.saturating_add(code as u32 * LIFE_UNIT),
            LifetimeCodec::Table => {
                if code == NEVER_EXPIRES_LIFE {
                    NEVERDATE
                } else if code < TABLE_FIRST_CODE {
                    start.saturating_add(code as u32 * LIFE_UNIT)
                } else if code > TABLE_LAST_CODE {
                    start.saturating_add(MAX_LIFETIME)
                } else {
                    let idx = (code - TABLE_FIRST_CODE) as usize;
                    start.saturating_add(LIFETIME_TABLE[idx])
                }
            }
        }
    }

    /// The smallest code whose lifetime covers `start` to `end`.
    pub fn time_to_life(self, start: u32, end: u32) -> u8 {
        match self {
            LifetimeCodec::Short => {
                let lifetime = end.saturating_sub(start);
                lifetime.div_ceil(LIFE_UNIT).min(u8::MAX as u32) as u8
            }
            LifetimeCodec::Table => {
                if end >= NEVERDATE {
                    return NEVER_EXPIRES_LIFE;
                }
                if end <= start {
                    return 0;
                }
                let lifetime = end - start;

                if lifetime > MAX_LIFETIME {
                    trace!(lifetime, "Clamping lifetime to the table maximum");
                    return TABLE_LAST_CODE;
                }

                if lifetime < LIFETIME_TABLE[0] {
                    return lifetime.div_ceil(LIFE_UNIT) as u8;
                }

                let idx = LIFETIME_TABLE
                    .iter()
                    .position(|entry| lifetime <= *entry)
                    .unwrap_or(LIFETIME_TABLE.len() - 1);
                TABLE_FIRST_CODE + idx as u8
            }
        }
    }
}

pub fn life_to_time(start: u32, code: u8) -> u32 {
    LifetimeCodec::Table.life_to_time(start, code)
}

pub fn time_to_life(start: u32, end: u32) -> u8 {
    LifetimeCodec::Table.time_to_life(start, end)
}

/// A point in time as carried by Kerberos IV: whole seconds plus a five millisecond unit count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KrbTime {
    pub sec: u32,
    pub usec: u32,
}

impl KrbTime {
    pub fn now(offset: i64) -> Result<Self, KrbError> {
        Self::from_system_time(SystemTime::now(), offset)
    }

    pub fn from_system_time(t: SystemTime, offset: i64) -> Result<Self, KrbError> {
        let since = t.duration_since(UNIX_EPOCH).map_err(|err| {
            error!(?err, "System time is before the unix epoch");
            KrbError::DoYouHaveATimeMachine
        })?;
        let sec = (since.as_secs() as i64).saturating_add(offset);
        let sec = u32::try_from(sec.max(0)).map_err(|err| {
            error!(?err, "Time is not representable on the wire");
            KrbError::ValueOutOfRange
        })?;
        Ok(KrbTime {
            sec,
            usec: since.subsec_micros(),
        })
    }

    /// The sub-second field carried in authenticators and private/safe messages.
    pub fn time_5ms(&self) -> u8 {
        (self.usec / 5000) as u8
    }

    pub fn to_system_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.sec as u64)
    }
}

/// Local time in seconds, adjusted by a recorded KDC offset.
pub fn unix_now(offset: i64) -> Result<u32, KrbError> {
    KrbTime::now(offset).map(|t| t.sec)
}

/// Whether `theirs` lies within `skew` seconds of `ours`.
pub fn within_skew(ours: u32, theirs: u32, skew: u32) -> bool {
    ours.abs_diff(theirs) <= skew
}
