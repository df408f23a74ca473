//! Arbitrary precision `numeric` values.
//!
//! Values are held in the server's own representation: base-10000 digit
//! groups, a group weight, and a display scale. Text conversion works on
//! decimal digits directly and never passes through a float.

use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};

const NBASE: i32 = 10_000;

// Sign codes of the binary format
const SIGN_POSITIVE: u16 = 0x0000;
const SIGN_NEGATIVE: u16 = 0x4000;
const SIGN_NAN: u16 = 0xC000;
const SIGN_PINF: u16 = 0xD000;
const SIGN_NINF: u16 = 0xF000;

/// A PostgreSQL `numeric`.
///
/// Finite values are normalized: no leading or trailing zero groups, and
/// zero is `digits == []` with `negative == false`. The display scale is
/// kept, so `1.0` and `1.00` are different values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Numeric {
    NaN,
    Infinity,
    NegInfinity,
    Finite {
        negative: bool,
        /// Power of 10000 of the first group
        weight: i16,
        /// Number of decimal digits after the point
        scale: u16,
        /// Base-10000 groups, most significant first
        digits: Vec<i16>,
    },
}

impl Numeric {
    pub fn zero() -> Self {
        Numeric::Finite {
            negative: false,
            weight: 0,
            scale: 0,
            digits: Vec::new(),
        }
    }

    pub fn is_finite(&self) -> bool {
        matches!(self, Numeric::Finite { .. })
    }

    /// Decode the binary wire format.
    pub fn decode_binary(data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(Error::Type(format!("Invalid NUMERIC length: {}", data.len())));
        }
        let ndigits = i16::from_be_bytes([data[0], data[1]]);
        let weight = i16::from_be_bytes([data[2], data[3]]);
        let sign = u16::from_be_bytes([data[4], data[5]]);
        let scale = u16::from_be_bytes([data[6], data[7]]);

        if ndigits < 0 || data.len() != 8 + 2 * ndigits as usize {
            return Err(Error::Type(format!(
                "NUMERIC with {} digits has {} bytes",
                ndigits,
                data.len()
            )));
        }

        let negative = match sign {
            SIGN_POSITIVE => false,
            SIGN_NEGATIVE => true,
            SIGN_NAN => return Ok(Numeric::NaN),
            SIGN_PINF => return Ok(Numeric::Infinity),
            SIGN_NINF => return Ok(Numeric::NegInfinity),
            other => return Err(Error::Type(format!("Invalid NUMERIC sign: {:#06x}", other))),
        };

        let mut digits = Vec::with_capacity(ndigits as usize);
        for chunk in data[8..].chunks_exact(2) {
            let d = i16::from_be_bytes([chunk[0], chunk[1]]);
            if !(0..NBASE as i16).contains(&d) {
                return Err(Error::Type(format!("Invalid NUMERIC digit: {}", d)));
            }
            digits.push(d);
        }

        Ok(Self::normalized(negative, weight as i32, scale, digits))
    }

    /// Append the binary wire format to `buf`.
    pub fn encode_binary(&self, buf: &mut BytesMut) {
        let (sign, weight, scale, digits): (u16, i16, u16, &[i16]) = match self {
            Numeric::NaN => (SIGN_NAN, 0, 0, &[]),
            Numeric::Infinity => (SIGN_PINF, 0, 0, &[]),
            Numeric::NegInfinity => (SIGN_NINF, 0, 0, &[]),
            Numeric::Finite {
                negative,
                weight,
                scale,
                digits,
            } => (
                if *negative { SIGN_NEGATIVE } else { SIGN_POSITIVE },
                *weight,
                *scale,
                digits,
            ),
        };
        buf.put_i16(digits.len() as i16);
        buf.put_i16(weight);
        buf.put_u16(sign);
        buf.put_u16(scale);
        for d in digits {
            buf.put_i16(*d);
        }
    }

    fn normalized(negative: bool, mut weight: i32, scale: u16, mut digits: Vec<i16>) -> Self {
        let leading = digits.iter().take_while(|d| **d == 0).count();
        digits.drain(..leading);
        weight -= leading as i32;
        while digits.last() == Some(&0) {
            digits.pop();
        }
        if digits.is_empty() {
            return Numeric::Finite {
                negative: false,
                weight: 0,
                scale,
                digits,
            };
        }
        Numeric::Finite {
            negative,
            weight: weight as i16,
            scale,
            digits,
        }
    }

    /// Decimal digit at power of ten `p` (0 = units).
    fn digit_at(weight: i16, digits: &[i16], p: i32) -> i32 {
        let group = p.div_euclid(4);
        let idx = weight as i32 - group;
        if idx < 0 || idx as usize >= digits.len() {
            return 0;
        }
        (digits[idx as usize] as i32 / 10_i32.pow(p.rem_euclid(4) as u32)) % 10
    }
}

impl FromStr for Numeric {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Type(format!("Invalid NUMERIC: {:?}", s));
        let trimmed = s.trim();

        match trimmed.to_ascii_lowercase().as_str() {
            "nan" => return Ok(Numeric::NaN),
            "infinity" | "+infinity" | "inf" | "+inf" => return Ok(Numeric::Infinity),
            "-infinity" | "-inf" => return Ok(Numeric::NegInfinity),
            _ => {}
        }

        let (negative, rest) = match trimmed.as_bytes().first() {
            Some(b'-') => (true, &trimmed[1..]),
            Some(b'+') => (false, &trimmed[1..]),
            _ => (false, trimmed),
        };

        let (mantissa, exponent) = match rest.find(|c: char| c == 'e' || c == 'E') {
            Some(pos) => {
                let exp: i32 = rest[pos + 1..].parse().map_err(|_| invalid())?;
                (&rest[..pos], exp)
            }
            None => (rest, 0),
        };

        let (int_part, frac_part) = match mantissa.split_once('.') {
            Some((i, f)) => (i, f),
            None => (mantissa, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }
        if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let scale = (frac_part.len() as i64 - exponent as i64).max(0);
        let scale = u16::try_from(scale).map_err(|_| invalid())?;

        let all: Vec<u8> = int_part
            .bytes()
            .chain(frac_part.bytes())
            .map(|b| b - b'0')
            .collect();
        // Position of the decimal point, counted from the first digit
        let mut point = int_part.len() as i64 + exponent as i64;

        let leading = all.iter().take_while(|d| **d == 0).count();
        let mut all = &all[leading..];
        point -= leading as i64;
        while let [head @ .., 0] = all {
            all = head;
        }
        if all.is_empty() {
            return Ok(Numeric::Finite {
                negative: false,
                weight: 0,
                scale,
                digits: Vec::new(),
            });
        }

        let weight = (point - 1).div_euclid(4);
        let lowest = (point - all.len() as i64).div_euclid(4);
        if weight > i16::MAX as i64 || lowest < i16::MIN as i64 {
            return Err(Error::Type(format!("NUMERIC out of range: {:?}", s)));
        }

        let mut digits = vec![0i16; (weight - lowest + 1) as usize];
        for (i, d) in all.iter().enumerate() {
            let p = point - 1 - i as i64;
            let idx = (weight - p.div_euclid(4)) as usize;
            digits[idx] += (*d as i16) * 10_i16.pow(p.rem_euclid(4) as u32);
        }

        Ok(Self::normalized(negative, weight as i32, scale, digits))
    }
}

impl fmt::Display for Numeric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (negative, weight, scale, digits) = match self {
            Numeric::NaN => return f.write_str("NaN"),
            Numeric::Infinity => return f.write_str("Infinity"),
            Numeric::NegInfinity => return f.write_str("-Infinity"),
            Numeric::Finite {
                negative,
                weight,
                scale,
                digits,
            } => (*negative, *weight, *scale, digits),
        };

        let mut out = String::new();
        if negative {
            out.push('-');
        }

        let top = (weight as i32 * 4 + 3).max(0);
        let mut started = false;
        for p in (0..=top).rev() {
            let d = Self::digit_at(weight, digits, p);
            if d != 0 || started || p == 0 {
                started = true;
                out.push(char::from(b'0' + d as u8));
            }
        }

        if scale > 0 {
            out.push('.');
            for p in 1..=scale as i32 {
                let d = Self::digit_at(weight, digits, -p);
                out.push(char::from(b'0' + d as u8));
            }
        }

        f.write_str(&out)
    }
}

impl From<i64> for Numeric {
    fn from(n: i64) -> Self {
        let mut magnitude = n.unsigned_abs();
        let mut groups = Vec::new();
        while magnitude > 0 {
            groups.push((magnitude % NBASE as u64) as i16);
            magnitude /= NBASE as u64;
        }
        groups.reverse();
        let weight = groups.len() as i32 - 1;
        Self::normalized(n < 0, weight, 0, groups)
    }
}

impl From<i32> for Numeric {
    fn from(n: i32) -> Self {
        Numeric::from(n as i64)
    }
}

impl TryFrom<f64> for Numeric {
    type Error = Error;

    fn try_from(v: f64) -> Result<Self> {
        if v.is_nan() {
            Ok(Numeric::NaN)
        } else if v.is_infinite() {
            Ok(if v > 0.0 {
                Numeric::Infinity
            } else {
                Numeric::NegInfinity
            })
        } else {
            v.to_string().parse()
        }
    }
}
