/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::{fmt, str::FromStr};

use bitflags::bitflags;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("parse mac address failed from: {0}")]
    ParseMacFailed(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

bitflags! {
    #[derive(Default)]
    pub struct LinkFlags: u32 {
        const UP = 1 << 0;
        const BROADCAST = 1 << 1;
        const LOOPBACK = 1 << 3;
        const POINT_TO_POINT = 1 << 4;
        const MULTICAST = 1 << 12;
    }
}

pub const MAC_ADDR_LEN: usize = 6;

#[derive(Serialize, Clone, PartialEq, Eq, PartialOrd, Ord, Default, Copy, Hash)]
// slice is in bigendian
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub const ZERO: MacAddr = MacAddr([0, 0, 0, 0, 0, 0]);

    const BROADCAST: u64 = 0xffffffffffff;
    const MULTICAST: u64 = 0x010000000000;

    pub fn octets(&self) -> &[u8; 6] {
        &self.0
    }

    pub fn is_unicast(mac: MacAddr) -> bool {
        let mac_num = u64::from(mac);
        mac_num != Self::BROADCAST && mac_num & Self::MULTICAST != Self::MULTICAST
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl From<MacAddr> for u64 {
    fn from(mac: MacAddr) -> Self {
        ((u16::from_be_bytes(mac.0[0..2].try_into().unwrap()) as u64) << 32)
            | u32::from_be_bytes(mac.0[2..6].try_into().unwrap()) as u64
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(octets: [u8; 6]) -> Self {
        MacAddr(octets)
    }
}

impl FromStr for MacAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut addr = [0u8; 6];
        let mut count = 0;
        for (idx, n_s) in s.split(':').enumerate() {
            if idx >= MAC_ADDR_LEN {
                return Err(Error::ParseMacFailed(s.to_string()));
            }
            match u8::from_str_radix(n_s, 16) {
                Ok(n) => addr[idx] = n,
                Err(_) => return Err(Error::ParseMacFailed(s.to_string())),
            }
            count = idx + 1;
        }
        if count != MAC_ADDR_LEN {
            return Err(Error::ParseMacFailed(s.to_string()));
        }
        Ok(MacAddr(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_parse_and_display() {
        let mac: MacAddr = "02:1b:21:aa:00:fe".parse().unwrap();
        assert_eq!(mac.to_string(), "02:1b:21:aa:00:fe");
        assert_eq!(u64::from(mac), 0x021b21aa00fe);
        assert!(MacAddr::is_unicast(mac));
    }

    #[test]
    fn mac_parse_rejects_malformed() {
        assert!("02:1b:21:aa:00".parse::<MacAddr>().is_err());
        assert!("02:1b:21:aa:00:fe:11".parse::<MacAddr>().is_err());
        assert!("02:1b:21:zz:00:fe".parse::<MacAddr>().is_err());
    }

    #[test]
    fn broadcast_is_not_unicast() {
        let mac = MacAddr::from([0xff; 6]);
        assert!(!MacAddr::is_unicast(mac));
    }
}
