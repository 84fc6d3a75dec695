use std::{borrow::Cow, net::SocketAddr};

use bitflags::bitflags;
use strum::EnumString;

use crate::acl::pattern::{MatchKind, Value};
use crate::buffer::Buffer;

bitflags! {
    /// What a keyword needs from the session to be fetchable. Each
    /// evaluation hook declares the subset it can provide; referencing
    /// anything else there is a configuration error.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct Caps: u32 {
        const TCP4  = 1 << 0;
        const TCP6  = 1 << 1;
        const L4REQ = 1 << 2;
        const L7REQ = 1 << 3;
        const L4RTR = 1 << 4;
        const L7RTR = 1 << 5;

        const TCP_ANY = Self::TCP4.bits() | Self::TCP6.bits();
        const REQ_ANY = Self::L4REQ.bits() | Self::L7REQ.bits();
        const RTR_ANY = Self::L4RTR.bits() | Self::L7RTR.bits();
    }
}

bitflags! {
    /// Side signals attached to a fetch result.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct FetchFlags: u8 {
        /// The value may differ once more data arrives; retry later
        /// when the hook runs in partial mode.
        const MAY_CHANGE = 1 << 0;
        /// Multi-valued fetch: call again for the next value.
        const FETCH_MORE = 1 << 1;
        /// Even an absent value should be offered to the matcher.
        const NULL_MATCH = 1 << 2;
        /// The fetch already decided: force PASS.
        const SET_PASS   = 1 << 3;
        /// The fetch already decided: force FAIL.
        const SET_FAIL   = 1 << 4;
        /// Not cacheable across calls.
        const VOLATILE   = 1 << 5;
    }
}

/// One fetch outcome: an optional sample plus signals.
#[derive(Debug, Default)]
pub struct Fetched<'a> {
    pub value: Option<Value<'a>>,
    pub flags: FetchFlags,
}

impl<'a> Fetched<'a> {
    fn none() -> Self {
        Self::default()
    }

    fn flags(flags: FetchFlags) -> Self {
        Self { value: None, flags }
    }

    fn value(value: Value<'a>, flags: FetchFlags) -> Self {
        Self { value: Some(value), flags }
    }
}

/// Minimal view of an HTTP transaction, filled in by a plugged HTTP
/// analyser. Absent in pure TCP processing.
#[derive(Clone, Debug)]
pub struct HttpTxn {
    pub method: Box<str>,
    pub uri: Box<str>,
    pub version: (u16, u16),
    pub content_length: Option<u64>,
}

/// Everything a sample fetcher may look at. Borrowed immutably from
/// the session so evaluation can never mutate traffic data.
pub struct SampleCtx<'a> {
    pub cli: SocketAddr,
    pub frt: SocketAddr,
    pub req: Option<&'a Buffer>,
    pub http: Option<&'a HttpTxn>,
    pub fe_id: u32,
    pub so_id: u32,
    pub so_conns: u64,
    /// More data may still arrive (inspection window open).
    pub partial: bool,
}

/// Embedded sample-fetch keywords.
#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Keyword {
    AlwaysTrue,
    AlwaysFalse,
    WaitEnd,
    Src,
    Dst,
    SrcPort,
    DstPort,
    DstConn,
    FeId,
    SoId,
    ReqLen,
    ReqSslVer,
    ReqRdpCookie,
    ReqRdpCookieCnt,
    // L7 keywords backing the default ACL set; they only yield values
    // once an HTTP analyser has published a transaction.
    ReqProtoHttp,
    ReqVer,
    Method,
    Url,
    UrlBeg,
    UrlReg,
    HdrVal,
}

impl Keyword {
    pub fn requires(self) -> Caps {
        use Keyword::*;
        match self {
            AlwaysTrue | AlwaysFalse | WaitEnd | DstConn | FeId | SoId => Caps::empty(),
            Src | Dst | SrcPort | DstPort => Caps::TCP_ANY,
            ReqLen | ReqSslVer | ReqRdpCookie | ReqRdpCookieCnt => Caps::L4REQ,
            ReqProtoHttp | ReqVer | Method | Url | UrlBeg | UrlReg | HdrVal => Caps::L7REQ,
        }
    }

    pub fn match_kind(self) -> MatchKind {
        use Keyword::*;
        match self {
            AlwaysTrue | AlwaysFalse | WaitEnd | ReqProtoHttp => MatchKind::Nothing,
            Src | Dst => MatchKind::Ip,
            SrcPort | DstPort | DstConn | FeId | SoId | ReqLen | ReqRdpCookieCnt | HdrVal => {
                MatchKind::Int
            }
            ReqSslVer => MatchKind::Ver,
            ReqRdpCookie | ReqVer | Method | Url => MatchKind::Str,
            UrlBeg => MatchKind::Beg,
            UrlReg => MatchKind::Reg,
        }
    }

    /// Runs the fetch. `arg` is the parenthesised keyword argument
    /// (cookie name, header name).
    pub fn fetch<'a>(self, arg: Option<&str>, ctx: &SampleCtx<'a>) -> Fetched<'a> {
        use Keyword::*;
        match self {
            AlwaysTrue => Fetched::flags(FetchFlags::SET_PASS),
            AlwaysFalse => Fetched::flags(FetchFlags::SET_FAIL),
            WaitEnd => {
                if ctx.partial {
                    Fetched::flags(FetchFlags::MAY_CHANGE)
                } else {
                    Fetched::flags(FetchFlags::SET_PASS)
                }
            }
            Src => Fetched::value(Value::Ip(ctx.cli.ip()), FetchFlags::empty()),
            Dst => Fetched::value(Value::Ip(ctx.frt.ip()), FetchFlags::empty()),
            SrcPort => Fetched::value(Value::Int(ctx.cli.port().into()), FetchFlags::empty()),
            DstPort => Fetched::value(Value::Int(ctx.frt.port().into()), FetchFlags::empty()),
            DstConn => Fetched::value(Value::Int(ctx.so_conns), FetchFlags::empty()),
            FeId => Fetched::value(Value::Int(ctx.fe_id.into()), FetchFlags::empty()),
            SoId => Fetched::value(Value::Int(ctx.so_id.into()), FetchFlags::empty()),
            ReqLen => match ctx.req {
                Some(req) => Fetched::value(
                    Value::Int(req.len() as u64),
                    FetchFlags::VOLATILE | FetchFlags::MAY_CHANGE,
                ),
                None => Fetched::none(),
            },
            ReqSslVer => match ctx.req {
                Some(req) => fetch_ssl_version(req),
                None => Fetched::none(),
            },
            ReqRdpCookie => match ctx.req {
                Some(req) => fetch_rdp_cookie(req, arg),
                None => Fetched::none(),
            },
            ReqRdpCookieCnt => match ctx.req {
                Some(req) => {
                    let inner = fetch_rdp_cookie(req, arg);
                    if inner.flags.contains(FetchFlags::MAY_CHANGE) {
                        return Fetched::flags(FetchFlags::MAY_CHANGE);
                    }
                    let found = u64::from(inner.value.is_some());
                    Fetched::value(Value::Int(found), FetchFlags::VOLATILE)
                }
                None => Fetched::none(),
            },
            ReqProtoHttp => match ctx.http {
                Some(_) => Fetched::flags(FetchFlags::SET_PASS),
                None if ctx.partial => Fetched::flags(FetchFlags::MAY_CHANGE),
                None => Fetched::none(),
            },
            ReqVer => match ctx.http {
                Some(txn) => Fetched::value(
                    Value::Bytes(Cow::Owned(format!("{}.{}", txn.version.0, txn.version.1).into_bytes())),
                    FetchFlags::VOLATILE,
                ),
                None => Fetched::none(),
            },
            Method => match ctx.http {
                Some(txn) => {
                    Fetched::value(Value::Bytes(Cow::Owned(txn.method.as_bytes().to_vec())), FetchFlags::VOLATILE)
                }
                None => Fetched::none(),
            },
            Url | UrlBeg | UrlReg => match ctx.http {
                Some(txn) => {
                    Fetched::value(Value::Bytes(Cow::Owned(txn.uri.as_bytes().to_vec())), FetchFlags::VOLATILE)
                }
                None => Fetched::none(),
            },
            HdrVal => match ctx.http {
                Some(txn) => {
                    let want_cl = arg.is_none_or(|a| a.eq_ignore_ascii_case("content-length"));
                    match (want_cl, txn.content_length) {
                        (true, Some(cl)) => Fetched::value(Value::Int(cl), FetchFlags::VOLATILE),
                        _ => Fetched::none(),
                    }
                }
                None => Fetched::none(),
            },
        }
    }
}

/// Recognises an SSLv3/TLS record header or an SSLv2 hello and returns
/// the protocol version packed `major << 16 | minor`. Works on the
/// contiguous part of the request only; short input asks to be called
/// again.
fn fetch_ssl_version(req: &Buffer) -> Fetched<'static> {
    let data = req.data_contig();
    let mut bleft = data.len();
    if bleft == 0 {
        return Fetched::flags(FetchFlags::MAY_CHANGE);
    }
    let mut data = data;
    let version: u64;
    let msg_len: usize;

    if (0x14..=0x17).contains(&data[0]) || data[0] == 0xFF {
        // SSLv3 record format
        if bleft < 5 {
            return Fetched::flags(FetchFlags::MAY_CHANGE);
        }
        version = ((data[1] as u64) << 16) + data[2] as u64;
        msg_len = (((data[3] as usize) << 8) + data[4] as usize) as usize;
        if version < 0x0003_0000 {
            return Fetched::none();
        }
        if msg_len < 1 || msg_len > (1 << 14) + 2048 {
            return Fetched::none();
        }
        bleft -= 5;
        data = &data[5..];
    } else {
        // SSLv2 header, hello only
        let rlen;
        let plen;
        if data[0] & 0x80 != 0 {
            if bleft < 3 {
                return Fetched::flags(FetchFlags::MAY_CHANGE);
            }
            rlen = (((data[0] & 0x7F) as usize) << 8) | data[1] as usize;
            plen = 0;
            bleft -= 2;
            data = &data[2..];
        } else {
            if bleft < 4 {
                return Fetched::flags(FetchFlags::MAY_CHANGE);
            }
            rlen = (((data[0] & 0x3F) as usize) << 8) | data[1] as usize;
            plen = data[2] as usize;
            bleft -= 3;
            data = &data[2..];
        }
        if data[0] != 0x01 {
            return Fetched::none();
        }
        bleft -= 1;
        data = &data[1..];
        if bleft < 8 {
            return Fetched::flags(FetchFlags::MAY_CHANGE);
        }
        version = ((data[0] as u64) << 16) + data[1] as u64;
        let cilen = (((data[2] as usize) << 8) + data[3] as usize) as usize;
        let silen = (((data[4] as usize) << 8) + data[5] as usize) as usize;
        let chlen = (((data[6] as usize) << 8) + data[7] as usize) as usize;
        bleft -= 8;
        data = &data[8..];
        if cilen % 3 != 0 || (silen != 0 && silen != 16) || !(16..=32).contains(&chlen) {
            return Fetched::none();
        }
        if rlen != 9 + cilen + silen + chlen {
            return Fetched::none();
        }
        msg_len = cilen + silen + chlen + plen;
    }

    let _ = data;
    // the whole message must fit in what the buffer can hold before
    // we trust the version field
    let cap = req.max_len();
    let msg_len = msg_len.min(cap);
    if bleft < msg_len {
        return Fetched::flags(FetchFlags::MAY_CHANGE);
    }
    Fetched::value(Value::Int(version), FetchFlags::VOLATILE)
}

/// Extracts the RDP cookie value from the fixed offset 11, matching
/// `name` when given, otherwise accepting any identifier up to `=`.
/// The value runs to the CRLF.
fn fetch_rdp_cookie<'a>(req: &'a Buffer, name: Option<&str>) -> Fetched<'a> {
    let data = req.data_contig();
    if data.len() <= 11 {
        return Fetched::flags(FetchFlags::MAY_CHANGE);
    }
    let mut rest = &data[11..];
    if rest.len() <= 7 {
        return Fetched::flags(FetchFlags::MAY_CHANGE);
    }
    if !rest[..7].eq_ignore_ascii_case(b"Cookie:") {
        return Fetched::none();
    }
    rest = &rest[7..];
    while let Some((&b' ', tail)) = rest.split_first() {
        rest = tail;
    }

    match name {
        Some(name) if !name.is_empty() => {
            let n = name.len();
            if rest.len() <= n {
                return Fetched::flags(FetchFlags::MAY_CHANGE);
            }
            if rest[n] != b'=' || !rest[..n].eq_ignore_ascii_case(name.as_bytes()) {
                return Fetched::none();
            }
            rest = &rest[n + 1..];
        }
        _ => {
            let mut i = 0;
            while i < rest.len() && rest[i] != b'=' {
                if rest[i] == b'\r' || rest[i] == b'\n' {
                    return Fetched::none();
                }
                i += 1;
            }
            if i >= rest.len() {
                return Fetched::flags(FetchFlags::MAY_CHANGE);
            }
            rest = &rest[i + 1..];
        }
    }

    let value_start = rest;
    let mut len = 0;
    while len < value_start.len() && value_start[len] != b'\r' {
        len += 1;
    }
    if value_start.len() - len < 2 {
        return Fetched::flags(FetchFlags::MAY_CHANGE);
    }
    if value_start[len] != b'\r' || value_start[len + 1] != b'\n' {
        return Fetched::none();
    }
    Fetched::value(Value::Bytes(Cow::Borrowed(&value_start[..len])), FetchFlags::VOLATILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn req_with(content: &[u8]) -> Buffer {
        let mut buf = Buffer::new(512);
        assert_eq!(buf.feed(content), crate::buffer::Store::Written);
        buf
    }

    fn ctx<'a>(req: Option<&'a Buffer>, partial: bool) -> SampleCtx<'a> {
        SampleCtx {
            cli: "192.0.2.1:12345".parse().unwrap(),
            frt: "198.51.100.2:443".parse().unwrap(),
            req,
            http: None,
            fe_id: 7,
            so_id: 3,
            so_conns: 1,
            partial,
        }
    }

    #[test]
    fn keyword_names_parse() {
        assert_eq!(Keyword::from_str("always_true").unwrap(), Keyword::AlwaysTrue);
        assert_eq!(Keyword::from_str("req_rdp_cookie_cnt").unwrap(), Keyword::ReqRdpCookieCnt);
        assert_eq!(Keyword::from_str("req_ssl_ver").unwrap(), Keyword::ReqSslVer);
        assert!(Keyword::from_str("no_such_keyword").is_err());
    }

    #[test]
    fn wait_end_holds_while_partial() {
        let c = ctx(None, true);
        assert!(Keyword::WaitEnd.fetch(None, &c).flags.contains(FetchFlags::MAY_CHANGE));
        let c = ctx(None, false);
        assert!(Keyword::WaitEnd.fetch(None, &c).flags.contains(FetchFlags::SET_PASS));
    }

    #[test]
    fn src_and_ports() {
        let c = ctx(None, false);
        assert_eq!(
            Keyword::Src.fetch(None, &c).value,
            Some(Value::Ip("192.0.2.1".parse().unwrap()))
        );
        assert_eq!(Keyword::SrcPort.fetch(None, &c).value, Some(Value::Int(12345)));
        assert_eq!(Keyword::DstPort.fetch(None, &c).value, Some(Value::Int(443)));
    }

    #[test]
    fn req_len_signals_may_change() {
        let req = req_with(b"hello");
        let c = ctx(Some(&req), true);
        let f = Keyword::ReqLen.fetch(None, &c);
        assert_eq!(f.value, Some(Value::Int(5)));
        assert!(f.flags.contains(FetchFlags::MAY_CHANGE));
    }

    #[test]
    fn ssl_version_sslv3_header() {
        // TLS 1.0 handshake record, 5 byte header + payload
        let mut rec = vec![0x16, 0x03, 0x01, 0x00, 0x04];
        rec.extend_from_slice(&[0u8; 4]);
        let req = req_with(&rec);
        let c = ctx(Some(&req), true);
        let f = Keyword::ReqSslVer.fetch(None, &c);
        assert_eq!(f.value, Some(Value::Int((3 << 16) + 1)));
    }

    #[test]
    fn ssl_version_short_read_waits() {
        let req = req_with(&[0x16, 0x03]);
        let c = ctx(Some(&req), true);
        let f = Keyword::ReqSslVer.fetch(None, &c);
        assert!(f.value.is_none());
        assert!(f.flags.contains(FetchFlags::MAY_CHANGE));
    }

    #[test]
    fn not_ssl_fails_without_retry() {
        let req = req_with(b"GET / HTTP/1.0\r\n");
        let c = ctx(Some(&req), true);
        let f = Keyword::ReqSslVer.fetch(None, &c);
        assert!(f.value.is_none());
        assert!(!f.flags.contains(FetchFlags::MAY_CHANGE));
    }

    fn rdp_payload(cookie: &str) -> Vec<u8> {
        let mut buf = vec![0u8; 11];
        buf.extend_from_slice(cookie.as_bytes());
        buf
    }

    #[test]
    fn rdp_cookie_by_name() {
        let req = req_with(&rdp_payload("Cookie: mstshash=10.0.0.1.3389\r\n"));
        let c = ctx(Some(&req), true);
        let f = Keyword::ReqRdpCookie.fetch(Some("mstshash"), &c);
        assert_eq!(f.value, Some(Value::Bytes(Cow::Borrowed(b"10.0.0.1.3389"))));
    }

    #[test]
    fn rdp_cookie_any_name() {
        let req = req_with(&rdp_payload("Cookie: other=1.2.3.4.999\r\n"));
        let c = ctx(Some(&req), true);
        let f = Keyword::ReqRdpCookie.fetch(None, &c);
        assert_eq!(f.value, Some(Value::Bytes(Cow::Borrowed(b"1.2.3.4.999"))));
    }

    #[test]
    fn rdp_cookie_wrong_name_is_final() {
        let req = req_with(&rdp_payload("Cookie: msts=1.2.3.4.5\r\n"));
        let c = ctx(Some(&req), true);
        let f = Keyword::ReqRdpCookie.fetch(Some("mstshash"), &c);
        assert!(f.value.is_none());
        assert!(!f.flags.contains(FetchFlags::MAY_CHANGE));
    }

    #[test]
    fn rdp_cookie_count() {
        let req = req_with(&rdp_payload("Cookie: mstshash=10.0.0.1.3389\r\n"));
        let c = ctx(Some(&req), true);
        let f = Keyword::ReqRdpCookieCnt.fetch(None, &c);
        assert_eq!(f.value, Some(Value::Int(1)));
    }
}
