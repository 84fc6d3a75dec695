//! Named predicate engine: keywords fetch samples from the session,
//! patterns classify them, conditions combine ACLs into the boolean
//! form `IF/UNLESS (term AND term ...) OR (suite) ...`.

pub mod fetch;
pub mod pattern;

use std::str::FromStr;

use indexmap::IndexMap;
use thiserror::Error;

pub use fetch::{Caps, FetchFlags, Fetched, HttpTxn, Keyword, SampleCtx};
pub use pattern::{MatchKind, PatternError, PatternSet, Value};

#[derive(Debug, Error)]
pub enum AclError {
    #[error("unknown sample keyword '{0}'")]
    UnknownKeyword(String),
    #[error("unknown ACL '{0}'")]
    UnknownAcl(String),
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error("ACL '{acl}' requires data unavailable at this hook")]
    HookDenied { acl: String },
    #[error("condition syntax error: {0}")]
    Syntax(String),
}

/// Tri-state outcome. `Miss` can only surface while the hook runs in
/// partial mode (data still arriving).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum AclResult {
    Fail,
    Miss,
    Pass,
}

impl AclResult {
    /// OR: anything beats Fail, Pass beats Miss.
    #[inline]
    pub fn or(self, other: Self) -> Self {
        self.max(other)
    }

    /// AND: anything loses to Fail, Miss beats Pass.
    #[inline]
    pub fn and(self, other: Self) -> Self {
        self.min(other)
    }

    /// Negation swaps Pass/Fail and preserves Miss.
    #[inline]
    pub fn neg(self) -> Self {
        match self {
            AclResult::Pass => AclResult::Fail,
            AclResult::Fail => AclResult::Pass,
            AclResult::Miss => AclResult::Miss,
        }
    }

    #[inline]
    pub fn to_bool(self) -> bool {
        self == AclResult::Pass
    }
}

/// keyword + optional argument + compiled patterns.
#[derive(Debug)]
pub struct Expr {
    pub kw: Keyword,
    pub arg: Option<String>,
    pub patterns: PatternSet,
}

/// Named ACL: a disjunction of expressions.
#[derive(Debug)]
pub struct Acl {
    pub name: String,
    pub exprs: Vec<Expr>,
    pub requires: Caps,
}

/// Per-proxy registry, in declaration order.
#[derive(Debug, Default)]
pub struct AclRegistry {
    acls: IndexMap<String, Acl>,
    anon: u32,
}

/// Polarity applied by the caller of a condition.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Polarity {
    If,
    Unless,
}

/// One optionally negated ACL reference.
#[derive(Debug)]
pub struct Term {
    pub acl: usize,
    pub neg: bool,
}

/// Conjunction of terms.
#[derive(Debug, Default)]
pub struct TermSuite {
    pub terms: Vec<Term>,
}

/// Disjunction of suites with a polarity.
#[derive(Debug)]
pub struct Cond {
    pub pol: Polarity,
    pub suites: Vec<TermSuite>,
    pub requires: Caps,
}

/// Built-in ACLs available without declaration. Only the ones actually
/// referenced get compiled into the registry.
const DEFAULT_ACLS: &[(&str, &[&str])] = &[
    ("TRUE", &["always_true"]),
    ("FALSE", &["always_false"]),
    ("LOCALHOST", &["src", "127.0.0.1/8"]),
    ("HTTP", &["req_proto_http"]),
    ("HTTP_1.0", &["req_ver", "1.0"]),
    ("HTTP_1.1", &["req_ver", "1.1"]),
    ("METH_CONNECT", &["method", "CONNECT"]),
    ("METH_GET", &["method", "GET", "HEAD"]),
    ("METH_HEAD", &["method", "HEAD"]),
    ("METH_OPTIONS", &["method", "OPTIONS"]),
    ("METH_POST", &["method", "POST"]),
    ("METH_TRACE", &["method", "TRACE"]),
    ("HTTP_URL_ABS", &["url_reg", "^[^/:]*://"]),
    ("HTTP_URL_SLASH", &["url_beg", "/"]),
    ("HTTP_URL_STAR", &["url", "*"]),
    ("HTTP_CONTENT", &["hdr_val(content-length)", "gt", "0"]),
    ("RDP_COOKIE", &["req_rdp_cookie_cnt", "gt", "0"]),
    ("REQ_CONTENT", &["req_len", "gt", "0"]),
    ("WAIT_END", &["wait_end"]),
];

impl AclRegistry {
    /// Declares (or extends) a named ACL: `name kw[(arg)] [flags] pat...`.
    pub fn declare(&mut self, args: &[String]) -> Result<(), AclError> {
        let [name, expr_args @ ..] = args else {
            return Err(AclError::Syntax("acl declaration needs a name".into()));
        };
        if expr_args.is_empty() {
            return Err(AclError::Syntax(format!("acl '{name}' has no expression")));
        }
        let expr = parse_expr(expr_args)?;
        let requires = expr.kw.requires();
        match self.acls.get_mut(name.as_str()) {
            Some(acl) => {
                acl.requires |= requires;
                acl.exprs.push(expr);
            }
            None => {
                self.acls.insert(
                    name.clone(),
                    Acl { name: name.clone(), exprs: vec![expr], requires },
                );
            }
        }
        Ok(())
    }

    pub fn get(&self, idx: usize) -> &Acl {
        &self.acls[idx]
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.acls.get_index_of(name)
    }

    /// Looks `name` up, compiling it from the default table on first
    /// reference.
    fn resolve(&mut self, name: &str) -> Result<usize, AclError> {
        if let Some(idx) = self.index_of(name) {
            return Ok(idx);
        }
        let Some((_, expr)) = DEFAULT_ACLS.iter().find(|(n, _)| *n == name) else {
            return Err(AclError::UnknownAcl(name.to_string()));
        };
        let mut args: Vec<String> = vec![name.to_string()];
        args.extend(expr.iter().map(|s| (*s).to_string()));
        self.declare(&args)?;
        Ok(self.acls.len() - 1)
    }

    fn declare_anonymous(&mut self, expr_args: &[String]) -> Result<usize, AclError> {
        self.anon += 1;
        let name = format!("_anon_{}", self.anon);
        let mut args = vec![name];
        args.extend_from_slice(expr_args);
        self.declare(&args)?;
        Ok(self.acls.len() - 1)
    }
}

/// Parses `kw[(arg)] [-i] pattern...` into a compiled expression.
fn parse_expr(args: &[String]) -> Result<Expr, AclError> {
    let (kw_str, arg) = match args[0].split_once('(') {
        Some((kw, rest)) => {
            let arg = rest
                .strip_suffix(')')
                .ok_or_else(|| AclError::Syntax(format!("unbalanced '(' in '{}'", args[0])))?;
            (kw, Some(arg.to_string()))
        }
        None => (args[0].as_str(), None),
    };
    let kw = Keyword::from_str(kw_str).map_err(|_| AclError::UnknownKeyword(kw_str.to_string()))?;

    let mut icase = false;
    let mut pats: Vec<String> = Vec::new();
    for a in &args[1..] {
        if a == "-i" {
            icase = true;
        } else {
            pats.push(a.clone());
        }
    }
    let patterns = pattern::parse_patterns(kw.match_kind(), &pats, icase)?;
    Ok(Expr { kw, arg, patterns })
}

/// Builds a condition from `if`/`unless` argument tokens. Suites are
/// separated by `||` or `or`; a leading `!` negates a term; `{ expr }`
/// declares an anonymous ACL inline. `allowed` is the hook's
/// capability mask and gates what the condition may reference.
pub fn build_cond(
    args: &[String],
    registry: &mut AclRegistry,
    allowed: Caps,
) -> Result<Cond, AclError> {
    let [pol_tok, rest @ ..] = args else {
        return Err(AclError::Syntax("expected 'if' or 'unless'".into()));
    };
    let pol = match pol_tok.as_str() {
        "if" => Polarity::If,
        "unless" => Polarity::Unless,
        other => return Err(AclError::Syntax(format!("expected 'if' or 'unless', got '{other}'"))),
    };

    let mut suites = vec![TermSuite::default()];
    let mut requires = Caps::empty();
    let mut i = 0;
    while i < rest.len() {
        let tok = &rest[i];
        if tok == "||" || tok == "or" {
            if suites.last().is_some_and(|s| s.terms.is_empty()) {
                return Err(AclError::Syntax("empty term suite".into()));
            }
            suites.push(TermSuite::default());
            i += 1;
            continue;
        }

        let (neg, tok) = match tok.strip_prefix('!') {
            Some(rest_tok) if !rest_tok.is_empty() => (true, rest_tok.to_string()),
            Some(_) => {
                // bare '!' negates the following token
                i += 1;
                let Some(next) = rest.get(i) else {
                    return Err(AclError::Syntax("dangling '!'".into()));
                };
                (true, next.clone())
            }
            None => (false, tok.clone()),
        };

        let acl_idx = if tok == "{" {
            let mut j = i + 1;
            let mut inner = Vec::new();
            while j < rest.len() && rest[j] != "}" {
                inner.push(rest[j].clone());
                j += 1;
            }
            if j == rest.len() {
                return Err(AclError::Syntax("unterminated '{'".into()));
            }
            i = j;
            registry.declare_anonymous(&inner)?
        } else {
            registry.resolve(&tok)?
        };

        let acl = registry.get(acl_idx);
        if !allowed.contains(acl.requires) {
            return Err(AclError::HookDenied { acl: acl.name.clone() });
        }
        requires |= acl.requires;
        suites
            .last_mut()
            .expect("at least one suite")
            .terms
            .push(Term { acl: acl_idx, neg });
        i += 1;
    }

    if suites.last().is_some_and(|s| s.terms.is_empty()) {
        return Err(AclError::Syntax("empty condition".into()));
    }
    Ok(Cond { pol, suites, requires })
}

/// Evaluates a condition, without applying its polarity (the caller
/// does `if pol == Unless { res = res.neg() }` once Miss is handled).
pub fn eval_cond(cond: &Cond, registry: &AclRegistry, ctx: &SampleCtx<'_>) -> AclResult {
    let mut cond_res = AclResult::Fail;
    for suite in &cond.suites {
        let mut suite_res = AclResult::Pass;
        for term in &suite.terms {
            let mut acl_res = eval_acl(registry.get(term.acl), ctx);
            if term.neg {
                acl_res = acl_res.neg();
            }
            suite_res = suite_res.and(acl_res);
            if suite_res == AclResult::Fail {
                break;
            }
        }
        cond_res = cond_res.or(suite_res);
        if cond_res == AclResult::Pass {
            break;
        }
    }
    cond_res
}

/// Upper bound on FETCH_MORE re-entries, to keep a buggy multi-value
/// fetch from spinning the engine.
const FETCH_MORE_LIMIT: u32 = 64;

fn eval_acl(acl: &Acl, ctx: &SampleCtx<'_>) -> AclResult {
    let mut acl_res = AclResult::Fail;
    'exprs: for expr in &acl.exprs {
        let mut more = FETCH_MORE_LIMIT;
        loop {
            let fetched = expr.kw.fetch(expr.arg.as_deref(), ctx);
            let Some(value) = fetched.value else {
                if fetched.flags.contains(FetchFlags::MAY_CHANGE) && ctx.partial {
                    acl_res = acl_res.or(AclResult::Miss);
                }
                if fetched.flags.contains(FetchFlags::SET_PASS) {
                    acl_res = AclResult::Pass;
                } else if fetched.flags.contains(FetchFlags::NULL_MATCH)
                    && expr.patterns.is_empty()
                {
                    acl_res = acl_res.or(AclResult::Fail);
                }
                if acl_res == AclResult::Pass {
                    break 'exprs;
                }
                continue 'exprs;
            };

            if fetched.flags.contains(FetchFlags::SET_PASS) {
                acl_res = AclResult::Pass;
            } else if fetched.flags.contains(FetchFlags::SET_FAIL) {
                // stays at its current value; FAIL is the floor
            } else if expr.patterns.matches(expr.kw.match_kind(), &value) {
                acl_res = AclResult::Pass;
            }

            if acl_res == AclResult::Pass {
                break 'exprs;
            }
            if fetched.flags.contains(FetchFlags::FETCH_MORE) && more > 0 {
                more -= 1;
                continue;
            }
            if fetched.flags.contains(FetchFlags::MAY_CHANGE) && ctx.partial {
                acl_res = acl_res.or(AclResult::Miss);
            }
            continue 'exprs;
        }
    }
    acl_res
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(partial: bool) -> SampleCtx<'static> {
        SampleCtx {
            cli: "10.0.0.7:40000".parse().unwrap(),
            frt: "192.0.2.1:80".parse().unwrap(),
            req: None,
            http: None,
            fe_id: 1,
            so_id: 1,
            so_conns: 0,
            partial,
        }
    }

    fn strs(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn default_acls_compile_on_first_reference() {
        let mut reg = AclRegistry::default();
        let cond = build_cond(&strs(&["if", "TRUE"]), &mut reg, Caps::all()).unwrap();
        assert_eq!(eval_cond(&cond, &reg, &ctx(false)), AclResult::Pass);

        let cond = build_cond(&strs(&["if", "FALSE"]), &mut reg, Caps::all()).unwrap();
        assert_eq!(eval_cond(&cond, &reg, &ctx(false)), AclResult::Fail);
    }

    #[test]
    fn localhost_matches_loopback_sources_only() {
        let mut reg = AclRegistry::default();
        let cond = build_cond(&strs(&["if", "LOCALHOST"]), &mut reg, Caps::all()).unwrap();
        let mut c = ctx(false);
        assert_eq!(eval_cond(&cond, &reg, &c), AclResult::Fail);
        c.cli = "127.0.0.42:999".parse().unwrap();
        assert_eq!(eval_cond(&cond, &reg, &c), AclResult::Pass);
    }

    #[test]
    fn anonymous_acl_in_condition() {
        let mut reg = AclRegistry::default();
        let cond =
            build_cond(&strs(&["if", "{", "src", "10.0.0.0/8", "}"]), &mut reg, Caps::all())
                .unwrap();
        assert_eq!(eval_cond(&cond, &reg, &ctx(false)), AclResult::Pass);
    }

    #[test]
    fn negation_flips_and_preserves_miss() {
        let mut reg = AclRegistry::default();
        let cond =
            build_cond(&strs(&["if", "!", "WAIT_END"]), &mut reg, Caps::all()).unwrap();
        // partial: wait_end misses; negation must keep the miss
        assert_eq!(eval_cond(&cond, &reg, &ctx(true)), AclResult::Miss);
        // complete: wait_end passes; negated to fail
        assert_eq!(eval_cond(&cond, &reg, &ctx(false)), AclResult::Fail);
    }

    #[test]
    fn neg_is_involutive_on_decided_results() {
        for r in [AclResult::Pass, AclResult::Fail, AclResult::Miss] {
            assert_eq!(r.neg().neg(), r);
        }
        assert_eq!(AclResult::Miss.neg(), AclResult::Miss);
    }

    #[test]
    fn suites_are_or_terms_are_and() {
        let mut reg = AclRegistry::default();
        reg.declare(&strs(&["is_src", "src", "10.0.0.0/8"])).unwrap();
        // FALSE or (is_src and TRUE)  => Pass
        let cond = build_cond(
            &strs(&["if", "FALSE", "||", "is_src", "TRUE"]),
            &mut reg,
            Caps::all(),
        )
        .unwrap();
        assert_eq!(eval_cond(&cond, &reg, &ctx(false)), AclResult::Pass);
        // FALSE or (is_src and FALSE) => Fail
        let cond = build_cond(
            &strs(&["if", "FALSE", "||", "is_src", "FALSE"]),
            &mut reg,
            Caps::all(),
        )
        .unwrap();
        assert_eq!(eval_cond(&cond, &reg, &ctx(false)), AclResult::Fail);
    }

    #[test]
    fn hook_capability_gates_l7() {
        let mut reg = AclRegistry::default();
        let err = build_cond(
            &strs(&["if", "HTTP"]),
            &mut reg,
            Caps::TCP_ANY | Caps::L4REQ,
        )
        .unwrap_err();
        assert!(matches!(err, AclError::HookDenied { .. }));
    }

    #[test]
    fn unknown_acl_is_an_error() {
        let mut reg = AclRegistry::default();
        let err = build_cond(&strs(&["if", "nope"]), &mut reg, Caps::all()).unwrap_err();
        assert!(matches!(err, AclError::UnknownAcl(_)));
    }

    #[test]
    fn miss_propagates_through_and() {
        let mut reg = AclRegistry::default();
        let cond = build_cond(&strs(&["if", "TRUE", "WAIT_END"]), &mut reg, Caps::all()).unwrap();
        assert_eq!(eval_cond(&cond, &reg, &ctx(true)), AclResult::Miss);
        assert_eq!(eval_cond(&cond, &reg, &ctx(false)), AclResult::Pass);
    }
}
