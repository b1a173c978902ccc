//! Short-name / long-name character handling.
//!
//! Short names live in the OEM code page, space-padded to 8 + 3, always
//! upper case on disk; the two NT-reserved case bits record whether the
//! base or extension should read back lower case. Long names are UTF-16
//! and preserve case. Converting a long name to its short alias
//! uppercases, maps anything outside the short set to `_`, and flags the
//! conversion lossy; a lossy alias gets a `~N` numeric tail picked from
//! the smallest free value within the current 32-wide base window.

use alloc::string::String;
use alloc::vec::Vec;

use crate::fat::entry::{ShortDirEntry, NTRES_LOWER_BASE, NTRES_LOWER_EXT};
use crate::{Error, Result, LONG_NAME_CAP, SPACE};

pub fn is_delimiter(c: char) -> bool {
    c == '/' || c == '\\'
}

//                                0123456789abcdef 0123456789abcdef
// 0x20-0x3f of the short map:    1101111111000110 1111111111000000
//                                _! #$%&'() +,-.  0123456789 ; =
static VALID_SHORT_MAP: [u32; 8] = [
    0x0000_0000, // 0x00-0x1f
    0xdfc6_ffc0, // 0x20-0x3f
    0xffff_ffe3, // 0x40-0x5f: @A-Z[ ]^_
    0x8000_0016, // 0x60-0x7f: `           { }~
    0x0000_0000, // 0x80-0x9f
    0x0000_0000, // 0xa0-0xbf
    0x0000_0000, // 0xc0-0xdf
    0x0000_0000, // 0xe0-0xff
];

// The long map additionally admits + , ; = [ ] and the dot.
static VALID_LONG_MAP: [u32; 8] = [
    0x0000_0000, // 0x00-0x1f
    0xdfde_ffd4, // 0x20-0x3f
    0xffff_fff7, // 0x40-0x5f
    0x8000_0016, // 0x60-0x7f
    0x0000_0000, // 0x80-0x9f
    0x0000_0000, // 0xa0-0xbf
    0x0000_0000, // 0xc0-0xdf
    0x0000_0000, // 0xe0-0xff
];

pub fn is_valid_short_char(ch: u8) -> bool {
    VALID_SHORT_MAP[ch as usize / 32] & (0x8000_0000u32 >> (ch as usize % 32)) != 0
}

pub fn is_valid_long_char(ch: u8) -> bool {
    VALID_LONG_MAP[ch as usize / 32] & (0x8000_0000u32 >> (ch as usize % 32)) != 0
}

/// Encode a path component to UTF-16, bounded by the 255-unit limit.
pub fn utf8_to_utf16(name: &str) -> Result<Vec<u16>> {
    let units: Vec<u16> = name.encode_utf16().collect();
    if LONG_NAME_CAP < units.len() {
        return Err(Error::NameTooLong);
    }
    Ok(units)
}

pub fn utf16_to_string(units: &[u16]) -> String {
    String::from_utf16_lossy(units)
}

fn fold(u: u16) -> u16 {
    if (u as u32) < 0x80 {
        (u as u8).to_ascii_uppercase() as u16
    } else {
        u
    }
}

/// Case-insensitive UTF-16 comparison; the fold is ASCII-only, like the
/// OEM code page's.
pub fn utf16_eq_ignore_case(a: &[u16], b: &[u16]) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(&x, &y)| fold(x) == fold(y))
}

/// Split a path at `/` or `\`, collapsing delimiter runs. Empty
/// components are kept out; a lone delimiter yields nothing.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split(is_delimiter).filter(|c| !c.is_empty())
}

/// Decode the 11-byte OEM name back to UTF-16, honoring the two case
/// bits. `None` when the stored name has no valid rendering (as happens
/// for orphaned or garbage entries).
pub fn oem_to_utf16(name: &[u8; 11], nt_res: u8) -> Option<Vec<u16>> {
    let mut out = Vec::with_capacity(12);

    let base_end = (0..8).rev().find(|&j| name[j] != SPACE).map(|j| j + 1)?;
    for &b in &name[..base_end] {
        if !is_valid_short_char(b) {
            return None;
        }
        let b = if nt_res & NTRES_LOWER_BASE != 0 {
            b.to_ascii_lowercase()
        } else {
            b
        };
        out.push(b as u16);
    }

    if let Some(ext_end) = (8..11).rev().find(|&j| name[j] != SPACE).map(|j| j + 1) {
        out.push('.' as u16);
        for &b in &name[8..ext_end] {
            if !is_valid_short_char(b) {
                return None;
            }
            let b = if nt_res & NTRES_LOWER_EXT != 0 {
                b.to_ascii_lowercase()
            } else {
                b
            };
            out.push(b as u16);
        }
    }

    Some(out)
}

// Map one UTF-16 unit onto the OEM set. NUL passes through; characters
// illegal even in a long name are rejected outright; anything merely
// outside the short set becomes '_' and marks the conversion lossy.
fn oem_code(unit: u16, lossy: &mut bool) -> Result<u8> {
    if unit == 0 {
        return Ok(0);
    }
    if unit < 0x7F {
        let ch = (unit as u8).to_ascii_uppercase();
        if !is_valid_long_char(ch) {
            return Err(Error::AccessDenied);
        }
        if !is_valid_short_char(ch) {
            *lossy = true;
            return Ok(b'_');
        }
        Ok(ch)
    } else {
        *lossy = true;
        Ok(b'_')
    }
}

/// Result of deriving a short alias from a long name.
#[derive(Debug)]
pub struct OemName {
    pub name: [u8; 11],
    pub nt_res: u8,
    /// The alias does not reproduce the long name: a `~N` tail and a
    /// long-name run are required.
    pub lossy: bool,
}

// Case-tracking state: 0 unseen, -1 committed upper, 1 committed lower.
// Mixing within one part makes the name lossy.
fn track_case(unit: u16, state: &mut i8, lossy: &mut bool) {
    if *lossy || 0x80 <= unit {
        return;
    }
    let b = unit as u8;
    if b.is_ascii_uppercase() {
        if *state <= 0 {
            *state = -1;
        } else {
            *lossy = true;
        }
    }
    if b.is_ascii_lowercase() {
        if 0 <= *state {
            *state = 1;
        } else {
            *lossy = true;
        }
    }
}

/// Derive the 8+3 alias. The rightmost dot separates the extension;
/// embedded dots and spaces are dropped as lossy; a leading dot becomes
/// `_`.
pub fn utf16_to_oem(utf16: &[u16]) -> Result<OemName> {
    let mut name = [SPACE; 11];
    let mut lossy = false;
    let mut case_base: i8 = 0;
    let mut case_ext: i8 = 0;

    let unit_at = |i: usize| -> u16 {
        if i < utf16.len() {
            utf16[i]
        } else {
            0
        }
    };

    // Base part.
    let mut i = 0;
    let mut n = 0;
    let mut ch;
    loop {
        ch = oem_code(unit_at(i), &mut lossy)?;
        if ch == 0 || 8 <= n {
            break;
        }
        if ch == SPACE {
            lossy = true;
        } else {
            if ch == b'.' {
                if n == 0 {
                    ch = b'_';
                    lossy = true;
                } else {
                    break;
                }
            }
            track_case(unit_at(i), &mut case_base, &mut lossy);
            name[n] = ch;
            n += 1;
        }
        i += 1;
    }

    // Extension part: restart at every further dot so only the
    // rightmost one wins.
    let mut e = 0;
    while ch != 0 {
        if ch != b'.' {
            // The base overflowed into more characters.
            lossy = true;
            loop {
                ch = oem_code(unit_at(i), &mut lossy)?;
                i += 1;
                if ch == 0 || ch == b'.' {
                    break;
                }
            }
        }
        if ch == b'.' {
            if 0 < e {
                lossy = true;
            }
            e = 0;
            loop {
                ch = oem_code(unit_at(i), &mut lossy)?;
                if ch == 0 || ch == b'.' || 3 <= e {
                    break;
                }
                if ch == SPACE {
                    lossy = true;
                } else {
                    track_case(unit_at(i), &mut case_ext, &mut lossy);
                    name[8 + e] = ch;
                    e += 1;
                }
                i += 1;
            }
            i += 1;
        }
    }

    let mut nt_res = 0;
    if !lossy {
        if 0 < case_base {
            nt_res |= NTRES_LOWER_BASE;
        }
        if 0 < case_ext {
            nt_res |= NTRES_LOWER_EXT;
        }
    }

    Ok(OemName {
        name,
        nt_res,
        lossy,
    })
}

/// Compare a wanted component against both the reconstructed long name
/// and the OEM name re-decoded from the FCB.
pub fn is_equal(file_name: &[u16], long_name: &[u16], sde: &ShortDirEntry) -> bool {
    if !long_name.is_empty() && utf16_eq_ignore_case(file_name, long_name) {
        return true;
    }
    if let Some(oem) = oem_to_utf16(&sde.name, sde.nt_res) {
        if utf16_eq_ignore_case(file_name, &oem) {
            return true;
        }
    }
    false
}

fn base_len(name: &[u8; 11]) -> usize {
    (0..8).rev().find(|&j| name[j] != SPACE).map_or(0, |j| j + 1)
}

/// Parse a `~N` numeric tail out of a base name. Yields the prefix
/// length (characters before the `~`) and `N`; `None` when there is no
/// well-formed tail.
pub fn numeric_trail(name: &[u8; 11]) -> Option<(usize, u32)> {
    let end = base_len(name);
    if end == 0 {
        return None;
    }
    let mut s = end - 1;
    let mut n: u32 = 0;
    let mut d: u32 = 0;
    let mut k: u32 = 1;
    while 0 < s {
        let c = name[s];
        if c.is_ascii_digit() {
            d = (c - b'0') as u32;
            n += d * k;
            k *= 10;
        } else if c == b'~' {
            if d == 0 {
                return None;
            }
            return Some((s, n));
        } else {
            return None;
        }
        s -= 1;
    }
    None
}

/// The tail value of `fcb_name` when it aliases the same base as
/// `oem`; zero otherwise. Extensions must agree and the shorter prefix
/// decides the comparison window.
pub fn matching_trail(oem: &[u8; 11], fcb_name: &[u8; 11]) -> u32 {
    if oem[8..11] != fcb_name[8..11] {
        return 0;
    }

    let (o2, n2) = match numeric_trail(fcb_name) {
        Some(t) => t,
        None => return 0,
    };
    let o1 = numeric_trail(oem).map_or_else(|| base_len(oem), |(p, _)| p);

    // A shorter prefix only aliases a longer one when the short side
    // was cut off at the 8-byte boundary.
    if o1 < o2 && oem[7] == SPACE {
        return 0;
    }
    if o2 < o1 && fcb_name[7] == SPACE {
        return 0;
    }
    let cmp = o1.min(o2);
    if oem[..cmp] != fcb_name[..cmp] {
        return 0;
    }
    n2
}

/// Overwrite the base-name tail with `~n`, positioned so the result
/// still fits in 8 bytes.
pub fn set_numeric_trail(name: &mut [u8; 11], n: u32) {
    debug_assert!(0 < n && n < 1_000_000);

    let mut k = 0;
    let mut d = n;
    while 0 < d {
        k += 1;
        d /= 10;
    }

    let prefix_last = numeric_trail(name)
        .map(|(p, _)| p - 1)
        .unwrap_or_else(|| base_len(name).saturating_sub(1));

    let mut t = (prefix_last + 1 + k).min(7);
    let mut m = n;
    while 0 < m {
        name[t] = b'0' + (m % 10) as u8;
        m /= 10;
        t -= 1;
    }
    name[t] = b'~';
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn u16s(s: &str) -> Vec<u16> {
        s.encode_utf16().collect()
    }

    #[test]
    fn conformant_name_is_not_lossy() {
        let oem = utf16_to_oem(&u16s("readme.txt")).unwrap();
        assert!(!oem.lossy);
        assert_eq!(&oem.name, b"README  TXT");
        assert_eq!(oem.nt_res, NTRES_LOWER_BASE | NTRES_LOWER_EXT);
    }

    #[test]
    fn mixed_case_is_lossy() {
        let oem = utf16_to_oem(&u16s("Foo.txt")).unwrap();
        assert!(oem.lossy);
        assert_eq!(&oem.name, b"FOO     TXT");
    }

    #[test]
    fn uppercase_base_keeps_no_case_bits() {
        let oem = utf16_to_oem(&u16s("TAR.txt")).unwrap();
        assert!(!oem.lossy);
        assert_eq!(oem.nt_res, NTRES_LOWER_EXT);
        let back = oem_to_utf16(&oem.name, oem.nt_res).unwrap();
        assert_eq!(utf16_to_string(&back), "TAR.txt");
    }

    #[test]
    fn rightmost_dot_separates_extension() {
        let oem = utf16_to_oem(&u16s("a.b.c")).unwrap();
        assert!(oem.lossy);
        assert_eq!(&oem.name[..8], b"A       ");
        assert_eq!(&oem.name[8..], b"C  ");
    }

    #[test]
    fn long_base_truncates_lossily() {
        let oem = utf16_to_oem(&u16s("abc_defgh.txt")).unwrap();
        assert!(oem.lossy);
        assert_eq!(&oem.name, b"ABC_DEFGTXT");
    }

    #[test]
    fn non_ascii_maps_to_underscore() {
        let oem = utf16_to_oem(&u16s("ファイル")).unwrap();
        assert!(oem.lossy);
        assert_eq!(&oem.name[..8], b"____    ");
    }

    #[test]
    fn illegal_characters_are_rejected() {
        assert_eq!(
            utf16_to_oem(&u16s("a*b")).unwrap_err(),
            Error::AccessDenied
        );
    }

    #[test]
    fn trail_round_trip() {
        let mut name = *b"FOO_____TXT";
        name[3..8].copy_from_slice(b"     ");
        set_numeric_trail(&mut name, 1);
        assert_eq!(&name[..8], b"FOO~1   ");
        assert_eq!(numeric_trail(&name), Some((3, 1)));

        let mut full = *b"ABCDEFGHTXT";
        set_numeric_trail(&mut full, 12);
        assert_eq!(&full[..8], b"ABCDE~12");
        assert_eq!(numeric_trail(&full), Some((5, 12)));
    }

    #[test]
    fn matching_trail_requires_same_base_and_extension() {
        let oem = *b"DOC_____TXT";
        let mut oem = oem;
        oem[3..8].copy_from_slice(b"     ");

        let mut a = oem;
        set_numeric_trail(&mut a, 3);
        assert_eq!(matching_trail(&oem, &a), 3);

        let mut other = a;
        other[8..11].copy_from_slice(b"BIN");
        assert_eq!(matching_trail(&oem, &other), 0);

        let plain = *b"DOC     TXT";
        assert_eq!(matching_trail(&oem, &plain), 0);
    }

    #[test]
    fn path_components_skip_delimiter_runs() {
        let parts: Vec<&str> = components("a//b\\c/").collect();
        assert_eq!(parts, vec!["a", "b", "c"]);
    }
}
