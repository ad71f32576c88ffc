// Copyright 2025 RisingWave Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! `FromSql` adapters for types the driver has no canonical textual
//! mapping for. Each decodes the binary wire form directly and yields the
//! text representation the downstream encoder expects.

use std::error::Error;
use std::net::{Ipv4Addr, Ipv6Addr};

use tokio_postgres::types::{FromSql, Type};

type BoxError = Box<dyn Error + Sync + Send>;

fn read_i16(raw: &[u8], at: usize) -> Result<i16, BoxError> {
    let bytes: [u8; 2] = raw
        .get(at..at + 2)
        .ok_or("truncated value")?
        .try_into()
        .unwrap();
    Ok(i16::from_be_bytes(bytes))
}

/// NUMERIC rendered as a plain decimal string.
#[derive(Debug, Clone, PartialEq)]
pub struct PgNumeric(pub String);

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        let ndigits = read_i16(raw, 0)?;
        let weight = read_i16(raw, 2)?;
        let sign = read_i16(raw, 4)? as u16;
        let dscale = read_i16(raw, 6)? as u16 as usize;

        match sign {
            0xC000 => return Ok(Self("NaN".to_owned())),
            0xD000 => return Ok(Self("Infinity".to_owned())),
            0xF000 => return Ok(Self("-Infinity".to_owned())),
            0x0000 | 0x4000 => {}
            other => return Err(format!("bad numeric sign 0x{other:04X}").into()),
        }

        // base-10000 digit groups, most significant first; `weight` is the
        // power of 10000 of the first group
        let mut digits = Vec::with_capacity(ndigits as usize);
        for i in 0..ndigits as usize {
            digits.push(read_i16(raw, 8 + i * 2)? as u16);
        }

        let mut out = String::new();
        if sign == 0x4000 {
            out.push('-');
        }

        if weight < 0 {
            out.push('0');
        } else {
            for i in 0..=weight as usize {
                let group = digits.get(i).copied().unwrap_or(0);
                if i == 0 {
                    out.push_str(&group.to_string());
                } else {
                    out.push_str(&format!("{group:04}"));
                }
            }
        }

        if dscale > 0 {
            let mut frac = String::new();
            // groups between the units place and the first stored group are
            // implicit zeros when weight is negative
            for _ in 0..(-(weight as i32 + 1)).max(0) {
                frac.push_str("0000");
            }
            let first_frac = (weight as i32 + 1).max(0) as usize;
            for i in first_frac..digits.len() {
                frac.push_str(&format!("{:04}", digits[i]));
            }
            while frac.len() < dscale {
                frac.push('0');
            }
            frac.truncate(dscale);
            out.push('.');
            out.push_str(&frac);
        }

        Ok(Self(out))
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

/// INET/CIDR rendered in canonical `addr` / `addr/bits` form.
#[derive(Debug, Clone, PartialEq)]
pub struct PgInet(pub String);

const AF_INET: u8 = 2;

impl<'a> FromSql<'a> for PgInet {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        if raw.len() < 4 {
            return Err("truncated inet value".into());
        }
        let (family, bits, is_cidr, len) = (raw[0], raw[1], raw[2] != 0, raw[3] as usize);
        let addr_bytes = raw.get(4..4 + len).ok_or("truncated inet address")?;

        let (addr, full) = if family == AF_INET {
            let octets: [u8; 4] = addr_bytes.try_into().map_err(|_| "bad inet length")?;
            (Ipv4Addr::from(octets).to_string(), 32)
        } else {
            let octets: [u8; 16] = addr_bytes.try_into().map_err(|_| "bad inet length")?;
            (Ipv6Addr::from(octets).to_string(), 128)
        };

        if is_cidr || bits != full {
            Ok(Self(format!("{addr}/{bits}")))
        } else {
            Ok(Self(addr))
        }
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::INET || *ty == Type::CIDR
    }
}

/// MACADDR rendered as colon-separated lowercase hex.
#[derive(Debug, Clone, PartialEq)]
pub struct PgMacAddr(pub String);

impl<'a> FromSql<'a> for PgMacAddr {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        if raw.len() != 6 {
            return Err("bad macaddr length".into());
        }
        Ok(Self(format!(
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            raw[0], raw[1], raw[2], raw[3], raw[4], raw[5]
        )))
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::MACADDR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric(ndigits: i16, weight: i16, sign: u16, dscale: u16, digits: &[u16]) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(&ndigits.to_be_bytes());
        raw.extend_from_slice(&weight.to_be_bytes());
        raw.extend_from_slice(&sign.to_be_bytes());
        raw.extend_from_slice(&dscale.to_be_bytes());
        for d in digits {
            raw.extend_from_slice(&d.to_be_bytes());
        }
        raw
    }

    fn decode_numeric(raw: &[u8]) -> String {
        PgNumeric::from_sql(&Type::NUMERIC, raw).unwrap().0
    }

    #[test]
    fn test_numeric_integer() {
        // 12345678 = [1234, 5678] at weight 1
        assert_eq!(decode_numeric(&numeric(2, 1, 0, 0, &[1234, 5678])), "12345678");
        assert_eq!(decode_numeric(&numeric(1, 0, 0, 0, &[7])), "7");
        assert_eq!(decode_numeric(&numeric(0, 0, 0, 0, &[])), "0");
    }

    #[test]
    fn test_numeric_fraction() {
        // 144659.20 = [14, 4659, 2000] at weight 1, dscale 2
        assert_eq!(
            decode_numeric(&numeric(3, 1, 0, 2, &[14, 4659, 2000])),
            "144659.20"
        );
        // -0.0042 = [42] at weight -1, dscale 4
        assert_eq!(decode_numeric(&numeric(1, -1, 0x4000, 4, &[42])), "-0.0042");
        // 5.00 with trailing zero groups elided by the server
        assert_eq!(decode_numeric(&numeric(1, 0, 0, 2, &[5])), "5.00");
    }

    #[test]
    fn test_numeric_nan() {
        assert_eq!(decode_numeric(&numeric(0, 0, 0xC000, 0, &[])), "NaN");
    }

    #[test]
    fn test_inet_v4() {
        let raw = [AF_INET, 32, 0, 4, 192, 168, 0, 1];
        assert_eq!(PgInet::from_sql(&Type::INET, &raw).unwrap().0, "192.168.0.1");
        let raw = [AF_INET, 24, 1, 4, 10, 0, 0, 0];
        assert_eq!(PgInet::from_sql(&Type::CIDR, &raw).unwrap().0, "10.0.0.0/24");
    }

    #[test]
    fn test_macaddr() {
        let raw = [0x08, 0x00, 0x2B, 0x01, 0x02, 0x03];
        assert_eq!(
            PgMacAddr::from_sql(&Type::MACADDR, &raw).unwrap().0,
            "08:00:2b:01:02:03"
        );
    }
}
