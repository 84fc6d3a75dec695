use std::{
    borrow::Cow,
    collections::{BTreeSet, HashMap},
    net::{IpAddr, Ipv4Addr},
};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("invalid integer pattern '{0}'")]
    BadInt(String),
    #[error("invalid version pattern '{0}'")]
    BadVersion(String),
    #[error("invalid address pattern '{0}'")]
    BadAddr(String),
    #[error("invalid regex pattern '{0}': {1}")]
    BadRegex(String, String),
    #[error("a range cannot carry a comparison operator")]
    RangeWithOperator,
    #[error("'{0}' takes no pattern")]
    UnexpectedPattern(String),
}

/// How a fetched sample is compared against patterns.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MatchKind {
    /// No comparison; the fetch decides by itself (always_true & co).
    Nothing,
    /// Exact string, optional ignore-case.
    Str,
    /// String prefix.
    Beg,
    /// String suffix.
    End,
    /// Substring.
    Sub,
    /// Substring delimited by `/` or `?`.
    Dir,
    /// Substring delimited by `/`, `?`, `.` or `:`.
    Dom,
    /// Regular expression over the raw bytes.
    Reg,
    /// Integer against a range.
    Int,
    /// Sample length against a range.
    Len,
    /// IPv4 address against address/mask.
    Ip,
    /// Dotted `major.minor` version packed 16+16, against a range.
    Ver,
}

impl MatchKind {
    /// Whether patterns of this kind parse like integers (with the
    /// eq/gt/ge/lt/le prefix operators).
    fn integer_like(self) -> bool {
        matches!(self, MatchKind::Int | MatchKind::Len | MatchKind::Ver)
    }
}

/// A fetched sample value. Byte samples borrow from the session
/// buffers whenever possible; matchers never mutate them.
#[derive(Clone, Debug, PartialEq)]
pub enum Value<'a> {
    Int(u64),
    Ip(IpAddr),
    Bytes(Cow<'a, [u8]>),
}

impl Value<'_> {
    pub fn as_int(&self) -> Option<u64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IntRange {
    pub min: Option<u64>,
    pub max: Option<u64>,
}

impl IntRange {
    pub fn contains(&self, v: u64) -> bool {
        self.min.is_none_or(|m| m <= v) && self.max.is_none_or(|m| v <= m)
    }
}

/// One compiled pattern.
#[derive(Debug)]
pub enum Pattern {
    Str { bytes: Box<[u8]>, icase: bool },
    Reg(regex::bytes::Regex),
    Range(IntRange),
    Ipv4 { addr: u32, mask: u32 },
}

/// Compiled pattern list plus the optional indexes: exact
/// case-sensitive strings live in an ordered byte tree, contiguous
/// CIDR prefixes in a longest-match-first prefix index. Everything
/// else is scanned in declaration order.
#[derive(Debug, Default)]
pub struct PatternSet {
    pub list: Vec<Pattern>,
    str_tree: BTreeSet<Box<[u8]>>,
    /// prefix length -> set of masked networks, probed longest first
    ip_index: HashMap<u8, BTreeSet<u32>>,
}

impl PatternSet {
    pub fn is_empty(&self) -> bool {
        self.list.is_empty() && self.str_tree.is_empty() && self.ip_index.is_empty()
    }

    fn insert_str(&mut self, bytes: Box<[u8]>, icase: bool, kind: MatchKind) {
        if kind == MatchKind::Str && !icase {
            self.str_tree.insert(bytes);
        } else {
            self.list.push(Pattern::Str { bytes, icase });
        }
    }

    fn insert_ipv4(&mut self, addr: u32, mask: u32) {
        // a contiguous mask has only ones on the left; only those can
        // live in the prefix index
        if mask.wrapping_add(mask & mask.wrapping_neg()) == 0 {
            let len = mask.count_ones() as u8;
            self.ip_index.entry(len).or_default().insert(addr & mask);
        } else {
            self.list.push(Pattern::Ipv4 { addr: addr & mask, mask });
        }
    }

    /// True when the sample matches any pattern, indexes first.
    pub fn matches(&self, kind: MatchKind, value: &Value<'_>) -> bool {
        match kind {
            MatchKind::Nothing => false,
            MatchKind::Str => {
                let Some(b) = value.as_bytes() else { return false };
                if self.str_tree.contains(b) {
                    return true;
                }
                self.list.iter().any(|p| match_str(p, b))
            }
            MatchKind::Beg | MatchKind::End | MatchKind::Sub | MatchKind::Dir | MatchKind::Dom
            | MatchKind::Reg => {
                let Some(b) = value.as_bytes() else { return false };
                self.list.iter().any(|p| match_text(kind, p, b))
            }
            MatchKind::Int | MatchKind::Ver => {
                let Some(i) = value.as_int() else { return false };
                self.list.iter().any(|p| matches!(p, Pattern::Range(r) if r.contains(i)))
            }
            MatchKind::Len => {
                let Some(b) = value.as_bytes() else { return false };
                let len = b.len() as u64;
                self.list.iter().any(|p| matches!(p, Pattern::Range(r) if r.contains(len)))
            }
            MatchKind::Ip => {
                let Value::Ip(IpAddr::V4(ip)) = value else { return false };
                let ip = u32::from(*ip);
                // longest prefix first
                let mut lens: Vec<u8> = self.ip_index.keys().copied().collect();
                lens.sort_unstable_by(|a, b| b.cmp(a));
                for len in lens {
                    let mask = prefix_mask(len);
                    if self.ip_index[&len].contains(&(ip & mask)) {
                        return true;
                    }
                }
                self.list
                    .iter()
                    .any(|p| matches!(p, Pattern::Ipv4 { addr, mask } if ip & mask == *addr))
            }
        }
    }
}

fn prefix_mask(len: u8) -> u32 {
    if len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(len))
    }
}

fn match_str(p: &Pattern, sample: &[u8]) -> bool {
    let Pattern::Str { bytes, icase } = p else { return false };
    if bytes.len() != sample.len() {
        return false;
    }
    if *icase {
        bytes.eq_ignore_ascii_case(sample)
    } else {
        **bytes == *sample
    }
}

fn match_text(kind: MatchKind, p: &Pattern, sample: &[u8]) -> bool {
    match (kind, p) {
        (MatchKind::Reg, Pattern::Reg(re)) => re.is_match(sample),
        (_, Pattern::Str { bytes, icase }) => {
            let pat: &[u8] = bytes;
            match kind {
                MatchKind::Beg => {
                    sample.len() >= pat.len() && eq_maybe_icase(&sample[..pat.len()], pat, *icase)
                }
                MatchKind::End => {
                    sample.len() >= pat.len()
                        && eq_maybe_icase(&sample[sample.len() - pat.len()..], pat, *icase)
                }
                MatchKind::Sub => find_sub(sample, pat, *icase),
                MatchKind::Dir => match_word(sample, pat, *icase, b"/?"),
                MatchKind::Dom => match_word(sample, pat, *icase, b"/?.:"),
                _ => false,
            }
        }
        _ => false,
    }
}

fn eq_maybe_icase(a: &[u8], b: &[u8], icase: bool) -> bool {
    if icase {
        a.eq_ignore_ascii_case(b)
    } else {
        a == b
    }
}

fn find_sub(sample: &[u8], pat: &[u8], icase: bool) -> bool {
    if pat.len() > sample.len() {
        return false;
    }
    sample
        .windows(pat.len())
        .any(|win| eq_maybe_icase(win, pat, icase))
}

/// Word match: the pattern must appear delimited by one of `delims`
/// (or the sample boundary) on both sides. Delimiters at the pattern's
/// own edges are stripped first.
fn match_word(sample: &[u8], pat: &[u8], icase: bool, delims: &[u8]) -> bool {
    let mut pat = pat;
    while let Some((&f, rest)) = pat.split_first() {
        if delims.contains(&f) {
            pat = rest;
        } else {
            break;
        }
    }
    while let Some((&l, rest)) = pat.split_last() {
        if delims.contains(&l) {
            pat = rest;
        } else {
            break;
        }
    }
    if pat.is_empty() || pat.len() > sample.len() {
        return false;
    }

    for start in 0..=(sample.len() - pat.len()) {
        if start > 0 && !delims.contains(&sample[start - 1]) {
            continue;
        }
        let end = start + pat.len();
        if end < sample.len() && !delims.contains(&sample[end]) {
            continue;
        }
        if eq_maybe_icase(&sample[start..end], pat, icase) {
            return true;
        }
    }
    false
}

/// Comparison operator consumed ahead of integer-like patterns.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
enum IntOp {
    #[default]
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
}

/// Parses the pattern arguments of one ACL expression. `icase` only
/// affects string kinds. The operator state persists across
/// arguments, so `ge 10 20` applies `ge` to both values.
pub fn parse_patterns(
    kind: MatchKind,
    args: &[String],
    icase: bool,
) -> Result<PatternSet, PatternError> {
    let mut set = PatternSet::default();
    if kind == MatchKind::Nothing {
        if args.is_empty() {
            return Ok(set);
        }
        return Err(PatternError::UnexpectedPattern(args[0].clone()));
    }

    let mut op = IntOp::default();
    for arg in args {
        if kind.integer_like() {
            match arg.as_str() {
                "eq" => {
                    op = IntOp::Eq;
                    continue;
                }
                "gt" => {
                    op = IntOp::Gt;
                    continue;
                }
                "ge" => {
                    op = IntOp::Ge;
                    continue;
                }
                "lt" => {
                    op = IntOp::Lt;
                    continue;
                }
                "le" => {
                    op = IntOp::Le;
                    continue;
                }
                _ => {}
            }
        }
        match kind {
            MatchKind::Int | MatchKind::Len => {
                set.list.push(Pattern::Range(parse_int_range(arg, op, false)?));
            }
            MatchKind::Ver => {
                set.list.push(Pattern::Range(parse_int_range(arg, op, true)?));
            }
            MatchKind::Ip => {
                let (addr, mask) = parse_ipv4_net(arg)?;
                set.insert_ipv4(addr, mask);
            }
            MatchKind::Reg => {
                let re = regex::bytes::RegexBuilder::new(arg)
                    .case_insensitive(icase)
                    .build()
                    .map_err(|e| PatternError::BadRegex(arg.clone(), e.to_string()))?;
                set.list.push(Pattern::Reg(re));
            }
            _ => set.insert_str(arg.clone().into_bytes().into_boxed_slice(), icase, kind),
        }
    }
    Ok(set)
}

fn parse_component(s: &str, ver: bool) -> Option<u64> {
    if ver {
        let (major, minor) = match s.split_once('.') {
            Some((ma, mi)) => (ma.parse::<u64>().ok()?, mi.parse::<u64>().ok()?),
            None => (s.parse::<u64>().ok()?, 0),
        };
        if major >= 65_536 || minor >= 65_536 {
            return None;
        }
        Some((major << 16) + minor)
    } else {
        s.parse::<u64>().ok()
    }
}

fn parse_int_range(arg: &str, op: IntOp, ver: bool) -> Result<IntRange, PatternError> {
    let bad = || {
        if ver {
            PatternError::BadVersion(arg.to_string())
        } else {
            PatternError::BadInt(arg.to_string())
        }
    };

    let sep = arg.find([':', '-']);
    if let Some(pos) = sep {
        if op != IntOp::Eq {
            return Err(PatternError::RangeWithOperator);
        }
        let lo = parse_component(&arg[..pos], ver).ok_or_else(bad)?;
        let hi = parse_component(&arg[pos + 1..], ver).ok_or_else(bad)?;
        return Ok(IntRange { min: Some(lo), max: Some(hi) });
    }

    let v = parse_component(arg, ver).ok_or_else(bad)?;
    Ok(match op {
        IntOp::Eq => IntRange { min: Some(v), max: Some(v) },
        IntOp::Gt => IntRange { min: Some(v.saturating_add(1)), max: None },
        IntOp::Ge => IntRange { min: Some(v), max: None },
        IntOp::Lt => IntRange { min: None, max: Some(v.saturating_sub(1)) },
        IntOp::Le => IntRange { min: None, max: Some(v) },
    })
}

fn parse_ipv4_net(arg: &str) -> Result<(u32, u32), PatternError> {
    let bad = || PatternError::BadAddr(arg.to_string());
    let (addr_s, mask_s) = match arg.split_once('/') {
        Some((a, m)) => (a, Some(m)),
        None => (arg, None),
    };
    let addr: Ipv4Addr = addr_s.parse().map_err(|_| bad())?;
    let mask = match mask_s {
        None => u32::MAX,
        Some(m) => {
            if let Ok(bits) = m.parse::<u8>() {
                if bits > 32 {
                    return Err(bad());
                }
                prefix_mask(bits)
            } else {
                let m: Ipv4Addr = m.parse().map_err(|_| bad())?;
                u32::from(m)
            }
        }
    };
    Ok((u32::from(addr), mask))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn exact_strings_go_to_tree() {
        let set = parse_patterns(MatchKind::Str, &strs(&["GET", "HEAD"]), false).unwrap();
        assert!(set.matches(MatchKind::Str, &Value::Bytes(Cow::Borrowed(b"GET"))));
        assert!(!set.matches(MatchKind::Str, &Value::Bytes(Cow::Borrowed(b"GETX"))));
        assert!(set.list.is_empty(), "case-sensitive exact strings are indexed");
    }

    #[test]
    fn icase_strings_scan_the_list() {
        let set = parse_patterns(MatchKind::Str, &strs(&["cookie"]), true).unwrap();
        assert!(set.matches(MatchKind::Str, &Value::Bytes(Cow::Borrowed(b"CoOkIe"))));
    }

    #[test]
    fn int_operators() {
        let set = parse_patterns(MatchKind::Int, &strs(&["gt", "0"]), false).unwrap();
        assert!(set.matches(MatchKind::Int, &Value::Int(1)));
        assert!(!set.matches(MatchKind::Int, &Value::Int(0)));

        let set = parse_patterns(MatchKind::Int, &strs(&["10:20"]), false).unwrap();
        assert!(set.matches(MatchKind::Int, &Value::Int(10)));
        assert!(set.matches(MatchKind::Int, &Value::Int(20)));
        assert!(!set.matches(MatchKind::Int, &Value::Int(21)));
    }

    #[test]
    fn range_with_operator_is_an_error() {
        assert_eq!(
            parse_patterns(MatchKind::Int, &strs(&["ge", "10:20"]), false).unwrap_err(),
            PatternError::RangeWithOperator
        );
    }

    #[test]
    fn dotted_version_packs_16_16() {
        let set = parse_patterns(MatchKind::Ver, &strs(&["3.0-3.1"]), false).unwrap();
        assert!(set.matches(MatchKind::Ver, &Value::Int(3 << 16)));
        assert!(set.matches(MatchKind::Ver, &Value::Int((3 << 16) + 1)));
        assert!(!set.matches(MatchKind::Ver, &Value::Int(2 << 16)));

        let set = parse_patterns(MatchKind::Ver, &strs(&["lt", "3"]), false).unwrap();
        assert!(set.matches(MatchKind::Ver, &Value::Int((2 << 16) + 5)));
        assert!(!set.matches(MatchKind::Ver, &Value::Int(3 << 16)));
    }

    #[test]
    fn cidr_longest_match() {
        let set = parse_patterns(MatchKind::Ip, &strs(&["10.0.0.0/8", "127.0.0.1/8"]), false).unwrap();
        let hit = Value::Ip("10.1.2.3".parse().unwrap());
        let local = Value::Ip("127.0.0.1".parse().unwrap());
        let miss = Value::Ip("192.168.0.1".parse().unwrap());
        assert!(set.matches(MatchKind::Ip, &hit));
        assert!(set.matches(MatchKind::Ip, &local));
        assert!(!set.matches(MatchKind::Ip, &miss));
    }

    #[test]
    fn noncontiguous_mask_scans_list() {
        let set = parse_patterns(MatchKind::Ip, &strs(&["10.0.0.1/255.0.0.255"]), false).unwrap();
        assert!(!set.list.is_empty());
        assert!(set.matches(MatchKind::Ip, &Value::Ip("10.9.9.1".parse().unwrap())));
        assert!(!set.matches(MatchKind::Ip, &Value::Ip("10.9.9.2".parse().unwrap())));
    }

    #[test]
    fn ipv6_sample_never_matches_v4_pattern() {
        let set = parse_patterns(MatchKind::Ip, &strs(&["0.0.0.0/0"]), false).unwrap();
        assert!(!set.matches(MatchKind::Ip, &Value::Ip("::1".parse().unwrap())));
    }

    #[test]
    fn word_match_respects_delimiters() {
        let set = parse_patterns(MatchKind::Dir, &strs(&["/img/"]), false).unwrap();
        assert!(set.matches(MatchKind::Dir, &Value::Bytes(Cow::Borrowed(b"/static/img/x.png"))));
        assert!(!set.matches(MatchKind::Dir, &Value::Bytes(Cow::Borrowed(b"/imgs/x.png"))));
    }

    #[test]
    fn regex_on_bounded_bytes() {
        let set = parse_patterns(MatchKind::Reg, &strs(&["^[^/:]*://"]), false).unwrap();
        assert!(set.matches(MatchKind::Reg, &Value::Bytes(Cow::Borrowed(b"http://x/"))));
        assert!(!set.matches(MatchKind::Reg, &Value::Bytes(Cow::Borrowed(b"/path"))));
    }

    #[test]
    fn len_matches_sample_length() {
        let set = parse_patterns(MatchKind::Len, &strs(&["gt", "4"]), false).unwrap();
        assert!(set.matches(MatchKind::Len, &Value::Bytes(Cow::Borrowed(b"hello"))));
        assert!(!set.matches(MatchKind::Len, &Value::Bytes(Cow::Borrowed(b"hi"))));
    }
}
