//! Routing rule language.
//!
//! A rule is a boolean expression over atomic matchers, e.g.
//! ``Host(`a.test`) && (PathPrefix(`/api`) || Path(`/healthz`))``.
//! Parsing produces an AST once; evaluation runs against a normalized
//! request projection on every dispatch, so nothing is re-parsed on the
//! data path. Compiled rules are cached by rule string so identical
//! reloads reuse the previous AST.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use crate::error::{FluxgateError, FluxgateResult};

/// Boolean expression tree over atomic matchers.
#[derive(Debug)]
pub enum Expr<M> {
    Matcher(M),
    And(Box<Expr<M>>, Box<Expr<M>>),
    Or(Box<Expr<M>>, Box<Expr<M>>),
    Not(Box<Expr<M>>),
}

impl<M> Expr<M> {
    /// Evaluate the expression with `eval` deciding each leaf.
    pub fn matches<F: Fn(&M) -> bool + Copy>(&self, eval: F) -> bool {
        match self {
            Expr::Matcher(m) => eval(m),
            Expr::And(a, b) => a.matches(eval) && b.matches(eval),
            Expr::Or(a, b) => a.matches(eval) || b.matches(eval),
            Expr::Not(inner) => !inner.matches(eval),
        }
    }
}

/// Atomic matchers for the HTTP plane.
#[derive(Debug)]
pub enum HttpMatcher {
    Host(Vec<String>),
    HostRegexp(Vec<Regex>),
    Path(Vec<String>),
    PathPrefix(Vec<String>),
    PathRegexp(Vec<Regex>),
    Method(Vec<String>),
    /// Header name/value pair, exact value match
    Header(String, String),
    HeaderRegexp(String, Regex),
    /// Query key/value pair, exact value match
    Query(String, String),
    QueryRegexp(String, Regex),
    ClientIp(Vec<IpPrefix>),
}

/// Atomic matchers for the TCP plane.
#[derive(Debug)]
pub enum TcpMatcher {
    HostSni(Vec<String>),
    HostSniRegexp(Vec<Regex>),
    ClientIp(Vec<IpPrefix>),
    Alpn(Vec<String>),
}

/// Normalized view of an HTTP request used for rule evaluation.
#[derive(Debug, Default, Clone)]
pub struct RequestProjection {
    /// Lowercased host, port stripped
    pub host: String,
    pub path: String,
    pub method: String,
    /// Lowercased header names
    pub headers: HashMap<String, Vec<String>>,
    pub query: HashMap<String, Vec<String>>,
    pub client_ip: Option<IpAddr>,
}

impl RequestProjection {
    pub fn from_request<B>(req: &hyper::Request<B>, client_ip: Option<IpAddr>) -> Self {
        let host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| req.uri().host())
            .map(normalize_host)
            .unwrap_or_default();

        let mut headers: HashMap<String, Vec<String>> = HashMap::new();
        for (name, value) in req.headers() {
            if let Ok(v) = value.to_str() {
                headers
                    .entry(name.as_str().to_ascii_lowercase())
                    .or_default()
                    .push(v.to_string());
            }
        }

        let mut query: HashMap<String, Vec<String>> = HashMap::new();
        if let Some(q) = req.uri().query() {
            for (k, v) in url::form_urlencoded::parse(q.as_bytes()) {
                query.entry(k.into_owned()).or_default().push(v.into_owned());
            }
        }

        Self {
            host,
            path: req.uri().path().to_string(),
            method: req.method().as_str().to_string(),
            headers,
            query,
            client_ip,
        }
    }
}

/// Normalized view of a TCP connection used for rule evaluation.
#[derive(Debug, Default, Clone)]
pub struct ConnProjection {
    /// SNI from the ClientHello, lowercased, trailing dot trimmed
    pub sni: Option<String>,
    /// ALPN protocols offered by the client
    pub alpn: Vec<String>,
    pub client_ip: Option<IpAddr>,
}

/// Lowercase a host and strip any port and trailing dot.
pub fn normalize_host(host: &str) -> String {
    // A bare IPv6 address contains multiple colons and carries no port
    // unless bracketed.
    let strippable = host.starts_with('[') || host.matches(':').count() <= 1;
    let host = if strippable {
        host.rsplit_once(':').map_or(host, |(h, p)| {
            if !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()) {
                h
            } else {
                host
            }
        })
    } else {
        host
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}

impl HttpMatcher {
    pub fn matches(&self, req: &RequestProjection) -> bool {
        match self {
            HttpMatcher::Host(hosts) => hosts.iter().any(|h| *h == req.host),
            HttpMatcher::HostRegexp(res) => res.iter().any(|re| re.is_match(&req.host)),
            HttpMatcher::Path(paths) => paths.iter().any(|p| *p == req.path),
            HttpMatcher::PathPrefix(prefixes) => {
                prefixes.iter().any(|p| req.path.starts_with(p.as_str()))
            }
            HttpMatcher::PathRegexp(res) => res.iter().any(|re| re.is_match(&req.path)),
            HttpMatcher::Method(methods) => methods.iter().any(|m| *m == req.method),
            HttpMatcher::Header(name, value) => req
                .headers
                .get(name)
                .is_some_and(|vals| vals.iter().any(|v| v == value)),
            HttpMatcher::HeaderRegexp(name, re) => req
                .headers
                .get(name)
                .is_some_and(|vals| vals.iter().any(|v| re.is_match(v))),
            HttpMatcher::Query(key, value) => req
                .query
                .get(key)
                .is_some_and(|vals| vals.iter().any(|v| v == value)),
            HttpMatcher::QueryRegexp(key, re) => req
                .query
                .get(key)
                .is_some_and(|vals| vals.iter().any(|v| re.is_match(v))),
            HttpMatcher::ClientIp(prefixes) => req
                .client_ip
                .is_some_and(|ip| prefixes.iter().any(|p| p.contains(ip))),
        }
    }
}

impl TcpMatcher {
    pub fn matches(&self, conn: &ConnProjection) -> bool {
        match self {
            TcpMatcher::HostSni(hosts) => {
                // HostSNI(`*`) matches any connection, with or without SNI.
                if hosts.iter().any(|h| h == "*") {
                    return true;
                }
                conn.sni
                    .as_deref()
                    .is_some_and(|sni| hosts.iter().any(|h| h == sni))
            }
            TcpMatcher::HostSniRegexp(res) => conn
                .sni
                .as_deref()
                .is_some_and(|sni| res.iter().any(|re| re.is_match(sni))),
            TcpMatcher::ClientIp(prefixes) => conn
                .client_ip
                .is_some_and(|ip| prefixes.iter().any(|p| p.contains(ip))),
            TcpMatcher::Alpn(protos) => {
                protos.iter().any(|p| conn.alpn.iter().any(|a| a == p))
            }
        }
    }
}

/// An IP prefix in CIDR notation; a bare address is a full-length prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpPrefix {
    addr: IpAddr,
    prefix_len: u8,
}

impl IpPrefix {
    pub fn parse(s: &str) -> FluxgateResult<Self> {
        let (addr_str, len_str) = match s.split_once('/') {
            Some((a, l)) => (a, Some(l)),
            None => (s, None),
        };

        let addr: IpAddr = addr_str
            .parse()
            .map_err(|e| FluxgateError::rule(format!("invalid IP '{}': {}", s, e)))?;

        let max_len = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };

        let prefix_len = match len_str {
            Some(l) => {
                let len: u8 = l
                    .parse()
                    .map_err(|e| FluxgateError::rule(format!("invalid prefix '{}': {}", s, e)))?;
                if len > max_len {
                    return Err(FluxgateError::rule(format!(
                        "prefix length {} out of range for '{}'",
                        len, s
                    )));
                }
                len
            }
            None => max_len,
        };

        Ok(Self { addr, prefix_len })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        let (prefix_octets, ip_octets): (Vec<u8>, Vec<u8>) = match (self.addr, ip) {
            (IpAddr::V4(a), IpAddr::V4(b)) => (a.octets().to_vec(), b.octets().to_vec()),
            (IpAddr::V6(a), IpAddr::V6(b)) => (a.octets().to_vec(), b.octets().to_vec()),
            _ => return false,
        };

        let full_bytes = (self.prefix_len / 8) as usize;
        let rem_bits = self.prefix_len % 8;

        if prefix_octets[..full_bytes] != ip_octets[..full_bytes] {
            return false;
        }
        if rem_bits == 0 {
            return true;
        }
        let mask = !(0xffu8 >> rem_bits);
        prefix_octets[full_bytes] & mask == ip_octets[full_bytes] & mask
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    LParen,
    RParen,
    Comma,
    And,
    Or,
    Not,
}

fn tokenize(input: &str) -> FluxgateResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '!' => {
                chars.next();
                tokens.push(Token::Not);
            }
            '&' => {
                chars.next();
                match chars.next() {
                    Some((_, '&')) => tokens.push(Token::And),
                    _ => {
                        return Err(FluxgateError::rule(format!(
                            "expected '&&' at offset {}",
                            pos
                        )))
                    }
                }
            }
            '|' => {
                chars.next();
                match chars.next() {
                    Some((_, '|')) => tokens.push(Token::Or),
                    _ => {
                        return Err(FluxgateError::rule(format!(
                            "expected '||' at offset {}",
                            pos
                        )))
                    }
                }
            }
            '`' | '"' => {
                let quote = c;
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == quote {
                        closed = true;
                        break;
                    }
                    value.push(c);
                }
                if !closed {
                    return Err(FluxgateError::rule(format!(
                        "unterminated string at offset {}",
                        pos
                    )));
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_alphabetic() => {
                let mut ident = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => {
                return Err(FluxgateError::rule(format!(
                    "unexpected character '{}' at offset {}",
                    other, pos
                )))
            }
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser<'a, M> {
    tokens: &'a [Token],
    pos: usize,
    build: fn(&str, Vec<String>) -> FluxgateResult<M>,
}

impl<'a, M> Parser<'a, M> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        self.pos += 1;
        t
    }

    fn expect(&mut self, expected: Token) -> FluxgateResult<()> {
        match self.next() {
            Some(t) if *t == expected => Ok(()),
            other => Err(FluxgateError::rule(format!(
                "expected {:?}, found {:?}",
                expected, other
            ))),
        }
    }

    // expr := term ('||' term)*
    fn parse_expr(&mut self) -> FluxgateResult<Expr<M>> {
        let mut left = self.parse_term()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.parse_term()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    // term := factor ('&&' factor)*
    fn parse_term(&mut self) -> FluxgateResult<Expr<M>> {
        let mut left = self.parse_factor()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.parse_factor()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    // factor := '!' factor | '(' expr ')' | matcher
    fn parse_factor(&mut self) -> FluxgateResult<Expr<M>> {
        match self.peek() {
            Some(Token::Not) => {
                self.next();
                Ok(Expr::Not(Box::new(self.parse_factor()?)))
            }
            Some(Token::LParen) => {
                self.next();
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(_)) => self.parse_matcher(),
            other => Err(FluxgateError::rule(format!(
                "expected matcher, found {:?}",
                other
            ))),
        }
    }

    // matcher := Ident '(' string (',' string)* ')'
    fn parse_matcher(&mut self) -> FluxgateResult<Expr<M>> {
        let name = match self.next() {
            Some(Token::Ident(name)) => name.clone(),
            other => {
                return Err(FluxgateError::rule(format!(
                    "expected matcher name, found {:?}",
                    other
                )))
            }
        };

        self.expect(Token::LParen)?;

        let mut args = Vec::new();
        loop {
            match self.next() {
                Some(Token::Str(s)) => args.push(s.clone()),
                other => {
                    return Err(FluxgateError::rule(format!(
                        "expected string argument in {}(), found {:?}",
                        name, other
                    )))
                }
            }
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => break,
                other => {
                    return Err(FluxgateError::rule(format!(
                        "expected ',' or ')' in {}(), found {:?}",
                        name, other
                    )))
                }
            }
        }

        Ok(Expr::Matcher((self.build)(&name, args)?))
    }
}

fn parse_rule<M>(
    rule: &str,
    build: fn(&str, Vec<String>) -> FluxgateResult<M>,
) -> FluxgateResult<Expr<M>> {
    let tokens = tokenize(rule)?;
    if tokens.is_empty() {
        return Err(FluxgateError::rule("empty rule"));
    }
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        build,
    };
    let expr = parser.parse_expr()?;
    if parser.pos != tokens.len() {
        return Err(FluxgateError::rule(format!(
            "trailing input after expression: {:?}",
            parser.tokens.get(parser.pos)
        )));
    }
    Ok(expr)
}

fn compile_regexps(name: &str, args: &[String]) -> FluxgateResult<Vec<Regex>> {
    args.iter()
        .map(|a| {
            Regex::new(a)
                .map_err(|e| FluxgateError::rule(format!("{}: invalid regexp '{}': {}", name, a, e)))
        })
        .collect()
}

fn single_pair(name: &str, args: Vec<String>) -> FluxgateResult<(String, String)> {
    let mut iter = args.into_iter();
    match (iter.next(), iter.next(), iter.next()) {
        (Some(key), Some(value), None) => Ok((key, value)),
        _ => Err(FluxgateError::rule(format!(
            "{}() expects exactly two arguments",
            name
        ))),
    }
}

fn build_http_matcher(name: &str, args: Vec<String>) -> FluxgateResult<HttpMatcher> {
    if args.is_empty() {
        return Err(FluxgateError::rule(format!(
            "{}() expects at least one argument",
            name
        )));
    }

    match name {
        "Host" => Ok(HttpMatcher::Host(
            args.iter().map(|a| normalize_host(a)).collect(),
        )),
        "HostRegexp" => Ok(HttpMatcher::HostRegexp(compile_regexps(name, &args)?)),
        "Path" => Ok(HttpMatcher::Path(args)),
        "PathPrefix" => Ok(HttpMatcher::PathPrefix(args)),
        "PathRegexp" => Ok(HttpMatcher::PathRegexp(compile_regexps(name, &args)?)),
        "Method" => Ok(HttpMatcher::Method(
            args.iter().map(|a| a.to_ascii_uppercase()).collect(),
        )),
        "Header" | "Headers" => {
            let (k, v) = single_pair(name, args)?;
            Ok(HttpMatcher::Header(k.to_ascii_lowercase(), v))
        }
        "HeaderRegexp" | "HeadersRegexp" => {
            let (k, v) = single_pair(name, args)?;
            let re = Regex::new(&v)
                .map_err(|e| FluxgateError::rule(format!("{}: invalid regexp '{}': {}", name, v, e)))?;
            Ok(HttpMatcher::HeaderRegexp(k.to_ascii_lowercase(), re))
        }
        "Query" => {
            let (k, v) = single_pair(name, args)?;
            Ok(HttpMatcher::Query(k, v))
        }
        "QueryRegexp" => {
            let (k, v) = single_pair(name, args)?;
            let re = Regex::new(&v)
                .map_err(|e| FluxgateError::rule(format!("{}: invalid regexp '{}': {}", name, v, e)))?;
            Ok(HttpMatcher::QueryRegexp(k, re))
        }
        "ClientIP" => Ok(HttpMatcher::ClientIp(
            args.iter()
                .map(|a| IpPrefix::parse(a))
                .collect::<FluxgateResult<Vec<_>>>()?,
        )),
        other => Err(FluxgateError::rule(format!(
            "unknown HTTP matcher '{}'",
            other
        ))),
    }
}

fn build_tcp_matcher(name: &str, args: Vec<String>) -> FluxgateResult<TcpMatcher> {
    if args.is_empty() {
        return Err(FluxgateError::rule(format!(
            "{}() expects at least one argument",
            name
        )));
    }

    match name {
        "HostSNI" => Ok(TcpMatcher::HostSni(
            args.iter()
                .map(|a| {
                    if a == "*" {
                        a.clone()
                    } else {
                        normalize_host(a)
                    }
                })
                .collect(),
        )),
        "HostSNIRegexp" => Ok(TcpMatcher::HostSniRegexp(compile_regexps(name, &args)?)),
        "ClientIP" => Ok(TcpMatcher::ClientIp(
            args.iter()
                .map(|a| IpPrefix::parse(a))
                .collect::<FluxgateResult<Vec<_>>>()?,
        )),
        "ALPN" => Ok(TcpMatcher::Alpn(args)),
        other => Err(FluxgateError::rule(format!(
            "unknown TCP matcher '{}'",
            other
        ))),
    }
}

/// Parse an HTTP routing rule into its AST.
pub fn parse_http_rule(rule: &str) -> FluxgateResult<Expr<HttpMatcher>> {
    parse_rule(rule, build_http_matcher)
}

/// Parse a TCP routing rule into its AST.
pub fn parse_tcp_rule(rule: &str) -> FluxgateResult<Expr<TcpMatcher>> {
    parse_rule(rule, build_tcp_matcher)
}

/// Whether a TCP rule can match without terminating TLS. Rules that
/// require SNI content beyond `HostSNI(`*`)` still work on passthrough
/// because the SNI is peeked from the ClientHello.
pub fn tcp_rule_requires_sni(expr: &Expr<TcpMatcher>) -> bool {
    match expr {
        Expr::Matcher(TcpMatcher::HostSni(hosts)) => !hosts.iter().any(|h| h == "*"),
        Expr::Matcher(TcpMatcher::HostSniRegexp(_)) => true,
        Expr::Matcher(_) => false,
        Expr::And(a, b) | Expr::Or(a, b) => {
            tcp_rule_requires_sni(a) || tcp_rule_requires_sni(b)
        }
        Expr::Not(inner) => tcp_rule_requires_sni(inner),
    }
}

// ---------------------------------------------------------------------------
// Compiled-rule caches
// ---------------------------------------------------------------------------

/// Process-wide cache of compiled HTTP rules, keyed by rule string.
/// Identical reloads skip re-parsing.
static HTTP_RULE_CACHE: Lazy<Mutex<HashMap<String, Arc<Expr<HttpMatcher>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

static TCP_RULE_CACHE: Lazy<Mutex<HashMap<String, Arc<Expr<TcpMatcher>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub fn cached_http_rule(rule: &str) -> FluxgateResult<Arc<Expr<HttpMatcher>>> {
    if let Some(expr) = HTTP_RULE_CACHE.lock().expect("rule cache lock").get(rule) {
        return Ok(Arc::clone(expr));
    }
    let expr = Arc::new(parse_http_rule(rule)?);
    HTTP_RULE_CACHE
        .lock()
        .expect("rule cache lock")
        .insert(rule.to_string(), Arc::clone(&expr));
    Ok(expr)
}

pub fn cached_tcp_rule(rule: &str) -> FluxgateResult<Arc<Expr<TcpMatcher>>> {
    if let Some(expr) = TCP_RULE_CACHE.lock().expect("rule cache lock").get(rule) {
        return Ok(Arc::clone(expr));
    }
    let expr = Arc::new(parse_tcp_rule(rule)?);
    TCP_RULE_CACHE
        .lock()
        .expect("rule cache lock")
        .insert(rule.to_string(), Arc::clone(&expr));
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_req(host: &str, path_and_query: &str, method: &str) -> RequestProjection {
        let req = hyper::Request::builder()
            .method(method)
            .uri(format!("http://placeholder{}", path_and_query))
            .header("host", host)
            .header("x-env", "prod")
            .body(hyper::Body::empty())
            .unwrap();
        RequestProjection::from_request(&req, Some("10.1.2.3".parse().unwrap()))
    }

    #[test]
    fn test_host_and_path() {
        let expr = parse_http_rule("Host(`A.test`) && Path(`/x`)").unwrap();
        assert!(expr.matches(|m| m.matches(&http_req("a.test", "/x", "GET"))));
        assert!(!expr.matches(|m| m.matches(&http_req("a.test", "/y", "GET"))));
        assert!(!expr.matches(|m| m.matches(&http_req("b.test", "/x", "GET"))));
    }

    #[test]
    fn test_host_strips_port() {
        let expr = parse_http_rule("Host(`a.test`)").unwrap();
        assert!(expr.matches(|m| m.matches(&http_req("a.test:8080", "/", "GET"))));
    }

    #[test]
    fn test_or_and_precedence() {
        // `a && b || c` parses as `(a && b) || c`
        let expr =
            parse_http_rule("Host(`a.test`) && Path(`/x`) || Path(`/open`)").unwrap();
        assert!(expr.matches(|m| m.matches(&http_req("other.test", "/open", "GET"))));
        assert!(expr.matches(|m| m.matches(&http_req("a.test", "/x", "GET"))));
        assert!(!expr.matches(|m| m.matches(&http_req("other.test", "/x", "GET"))));
    }

    #[test]
    fn test_parentheses_and_not() {
        let expr = parse_http_rule("Host(`a.test`) && !(PathPrefix(`/private`))").unwrap();
        assert!(expr.matches(|m| m.matches(&http_req("a.test", "/public", "GET"))));
        assert!(!expr.matches(|m| m.matches(&http_req("a.test", "/private/x", "GET"))));
    }

    #[test]
    fn test_method_and_header() {
        let expr = parse_http_rule("Method(`post`) && Header(`X-Env`, `prod`)").unwrap();
        assert!(expr.matches(|m| m.matches(&http_req("a.test", "/", "POST"))));
        assert!(!expr.matches(|m| m.matches(&http_req("a.test", "/", "GET"))));
    }

    #[test]
    fn test_query_matchers() {
        let expr = parse_http_rule("Query(`version`, `v2`)").unwrap();
        assert!(expr.matches(|m| m.matches(&http_req("a.test", "/api?version=v2", "GET"))));
        assert!(!expr.matches(|m| m.matches(&http_req("a.test", "/api?version=v1", "GET"))));

        let expr = parse_http_rule("QueryRegexp(`version`, `^v[0-9]+$`)").unwrap();
        assert!(expr.matches(|m| m.matches(&http_req("a.test", "/api?version=v10", "GET"))));
        assert!(!expr.matches(|m| m.matches(&http_req("a.test", "/api?version=beta", "GET"))));
    }

    #[test]
    fn test_host_regexp() {
        let expr = parse_http_rule(r"HostRegexp(`^[a-z]+\.example\.com$`)").unwrap();
        assert!(expr.matches(|m| m.matches(&http_req("api.example.com", "/", "GET"))));
        assert!(!expr.matches(|m| m.matches(&http_req("api.other.com", "/", "GET"))));
    }

    #[test]
    fn test_client_ip_cidr() {
        let expr = parse_http_rule("ClientIP(`10.0.0.0/8`, `192.168.1.7`)").unwrap();
        assert!(expr.matches(|m| m.matches(&http_req("a.test", "/", "GET")))); // 10.1.2.3

        let mut req = http_req("a.test", "/", "GET");
        req.client_ip = Some("192.168.1.7".parse().unwrap());
        assert!(expr.matches(|m| m.matches(&req)));

        req.client_ip = Some("192.168.1.8".parse().unwrap());
        assert!(!expr.matches(|m| m.matches(&req)));
    }

    #[test]
    fn test_ip_prefix_edges() {
        let p = IpPrefix::parse("10.0.0.0/9").unwrap();
        assert!(p.contains("10.127.255.255".parse().unwrap()));
        assert!(!p.contains("10.128.0.0".parse().unwrap()));
        assert!(!p.contains("::1".parse().unwrap())); // family mismatch

        assert!(IpPrefix::parse("10.0.0.0/33").is_err());
        assert!(IpPrefix::parse("not-an-ip").is_err());
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_http_rule("").is_err());
        assert!(parse_http_rule("Host(`a`) &&").is_err());
        assert!(parse_http_rule("Host(`a`) & Path(`/x`)").is_err());
        assert!(parse_http_rule("Host(`unterminated").is_err());
        assert!(parse_http_rule("Frobnicate(`a`)").is_err());
        assert!(parse_http_rule("Host()").is_err());
        assert!(parse_http_rule("Host(`a`) Path(`/x`)").is_err());
        assert!(parse_http_rule("Header(`only-one`)").is_err());
    }

    #[test]
    fn test_tcp_rules() {
        let conn = ConnProjection {
            sni: Some("db.test".to_string()),
            alpn: vec!["h2".to_string()],
            client_ip: Some("10.0.0.9".parse().unwrap()),
        };

        let expr = parse_tcp_rule("HostSNI(`db.test`)").unwrap();
        assert!(expr.matches(|m| m.matches(&conn)));
        assert!(tcp_rule_requires_sni(&expr));

        let expr = parse_tcp_rule("HostSNI(`*`)").unwrap();
        assert!(expr.matches(|m| m.matches(&conn)));
        assert!(expr.matches(|m| m.matches(&ConnProjection::default())));
        assert!(!tcp_rule_requires_sni(&expr));

        let expr = parse_tcp_rule("HostSNI(`db.test`) && ALPN(`h2`)").unwrap();
        assert!(expr.matches(|m| m.matches(&conn)));

        let expr = parse_tcp_rule("ClientIP(`10.0.0.0/24`)").unwrap();
        assert!(expr.matches(|m| m.matches(&conn)));
        assert!(!tcp_rule_requires_sni(&expr));

        assert!(parse_tcp_rule("Host(`a.test`)").is_err()); // HTTP matcher on TCP plane
    }

    #[test]
    fn test_rule_cache_reuses_ast() {
        let a = cached_http_rule("PathPrefix(`/cached`)").unwrap();
        let b = cached_http_rule("PathPrefix(`/cached`)").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("Example.COM"), "example.com");
        assert_eq!(normalize_host("example.com."), "example.com");
        assert_eq!(normalize_host("example.com:8443"), "example.com");
        assert_eq!(normalize_host("[::1]:8443"), "[::1]");
    }
}
