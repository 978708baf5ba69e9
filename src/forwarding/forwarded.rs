//! Forwarded header processing.
//!
//! Computes the effective scheme, host, port, remote address and absolute URI
//! of a request from its transport metadata, its headers and the trust
//! decision taken for its connection.
//!
//! # Precedence
//! With precedence `Forwarded` (the default) a present `Forwarded` header is
//! authoritative for the whole request: the `X-Forwarded-*` family is ignored,
//! even for fields the `Forwarded` element lacks. The only exception is
//! `X-Forwarded-Ssl: on`, which still forces `https` when no `proto=` is given.
//! With precedence `XForwarded` the `X-Forwarded-*` family wins whenever any of
//! its headers is present.
//!
//! Only the first hop of a comma separated chain is ever consulted.

use std::sync::Arc;

use axum::http::header::{HeaderMap, HeaderName, FORWARDED};
use serde::{Deserialize, Serialize};

use crate::forwarding::trust::TrustDecision;

pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
pub const X_FORWARDED_PORT: HeaderName = HeaderName::from_static("x-forwarded-port");
pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_SSL: HeaderName = HeaderName::from_static("x-forwarded-ssl");
pub const X_FORWARDED_PREFIX: HeaderName = HeaderName::from_static("x-forwarded-prefix");

/// Which header family is applied to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardedMode {
    /// The standard `Forwarded` header.
    Standard,
    /// `X-Forwarded-Proto/Host/Port/For/Ssl`.
    XForwarded,
}

/// Which family wins when both are enabled and present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ForwardedPrecedence {
    #[default]
    Forwarded,
    XForwarded,
}

/// Header processing switches.
#[derive(Debug, Clone)]
pub struct ForwardingOptions {
    pub allow_forwarded: bool,
    pub allow_x_forwarded: bool,
    pub precedence: ForwardedPrecedence,
    pub enable_forwarded_host: bool,
    pub forwarded_host_header: HeaderName,
    pub enable_forwarded_prefix: bool,
    pub forwarded_prefix_header: HeaderName,
}

impl Default for ForwardingOptions {
    fn default() -> Self {
        Self {
            allow_forwarded: true,
            allow_x_forwarded: true,
            precedence: ForwardedPrecedence::Forwarded,
            enable_forwarded_host: true,
            forwarded_host_header: X_FORWARDED_HOST,
            enable_forwarded_prefix: false,
            forwarded_prefix_header: X_FORWARDED_PREFIX,
        }
    }
}

impl ForwardingOptions {
    /// Pick the header family to apply to a request with these headers.
    pub fn select_mode(&self, headers: &HeaderMap) -> Option<ForwardedMode> {
        let standard = self.allow_forwarded && headers.contains_key(FORWARDED);
        let x_present = self.allow_x_forwarded && self.has_x_forwarded(headers);

        match self.precedence {
            ForwardedPrecedence::Forwarded if standard => Some(ForwardedMode::Standard),
            ForwardedPrecedence::XForwarded if x_present => Some(ForwardedMode::XForwarded),
            ForwardedPrecedence::XForwarded if standard => Some(ForwardedMode::Standard),
            _ if self.allow_x_forwarded => Some(ForwardedMode::XForwarded),
            _ => None,
        }
    }

    fn has_x_forwarded(&self, headers: &HeaderMap) -> bool {
        [
            &X_FORWARDED_PROTO,
            &X_FORWARDED_PORT,
            &X_FORWARDED_FOR,
            &X_FORWARDED_SSL,
            &self.forwarded_host_header,
        ]
        .into_iter()
        .any(|name| headers.contains_key(name))
    }
}

/// Address of the remote end as reported by the transport or a proxy.
///
/// `host` is usually an IP, but `Forwarded: for=` may also carry obfuscated
/// identifiers such as `unknown` or `_hidden`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAddress {
    pub host: String,
    pub port: Option<u16>,
}

impl RemoteAddress {
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        Self { host: host.into(), port }
    }
}

impl std::fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bracket = self.host.contains(':');
        match (self.port, bracket) {
            (Some(port), true) => write!(f, "[{}]:{}", self.host, port),
            (Some(port), false) => write!(f, "{}:{}", self.host, port),
            (None, _) => write!(f, "{}", self.host),
        }
    }
}

/// Request metadata exactly as observed on the wire.
#[derive(Debug, Clone)]
pub struct RawRequestMetadata<'a> {
    pub scheme: &'a str,
    /// Host without port; IPv6 literals keep their brackets.
    pub host: &'a str,
    pub port: Option<u16>,
    pub remote: Option<RemoteAddress>,
    pub path_and_query: &'a str,
    pub absolute_uri: Arc<str>,
    pub headers: &'a HeaderMap,
}

/// Request metadata after forwarded headers have been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveRequestMetadata {
    pub scheme: String,
    /// Host without port; IPv6 literals keep their brackets.
    pub host: String,
    /// Explicit port; `None` when it is the scheme's default.
    pub port: Option<u16>,
    pub remote: Option<RemoteAddress>,
    pub absolute_uri: Arc<str>,
}

impl EffectiveRequestMetadata {
    /// Effective port, falling back to the scheme default.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| default_port(&self.scheme))
    }

    /// `host[:port]`, suitable for a `Host` header.
    pub fn host_header(&self) -> String {
        authority(&self.host, self.port)
    }
}

/// Compute the effective metadata of one request.
///
/// Denied requests and requests without an applicable header family get
/// their transport metadata back unchanged.
pub fn compute_effective(
    raw: &RawRequestMetadata<'_>,
    decision: TrustDecision,
    mode: Option<ForwardedMode>,
    options: &ForwardingOptions,
) -> EffectiveRequestMetadata {
    let Some(mode) = mode.filter(|_| decision.allowed) else {
        return unchanged(raw);
    };

    let input = TransformInput { raw, mode, options };
    let mut draft = Draft {
        scheme: raw.scheme.to_string(),
        host: raw.host.to_string(),
        port: raw.port,
        remote: raw.remote.clone(),
        prefix: None,
    };

    for transform in TRANSFORMS {
        transform(&mut draft, &input);
    }

    let original_port = canonical_port(raw.scheme, raw.port);
    let changed = draft.scheme != raw.scheme
        || draft.host != raw.host
        || draft.port != original_port
        || draft.prefix.is_some();

    let absolute_uri = if changed {
        let path = match &draft.prefix {
            Some(prefix) => format!("{}{}", prefix, raw.path_and_query),
            None => raw.path_and_query.to_string(),
        };
        Arc::from(format!("{}://{}{}", draft.scheme, authority(&draft.host, draft.port), path))
    } else {
        Arc::clone(&raw.absolute_uri)
    };

    EffectiveRequestMetadata {
        scheme: draft.scheme,
        host: draft.host,
        port: draft.port,
        remote: draft.remote,
        absolute_uri,
    }
}

fn unchanged(raw: &RawRequestMetadata<'_>) -> EffectiveRequestMetadata {
    EffectiveRequestMetadata {
        scheme: raw.scheme.to_string(),
        host: raw.host.to_string(),
        port: canonical_port(raw.scheme, raw.port),
        remote: raw.remote.clone(),
        absolute_uri: Arc::clone(&raw.absolute_uri),
    }
}

struct Draft {
    scheme: String,
    host: String,
    port: Option<u16>,
    remote: Option<RemoteAddress>,
    prefix: Option<String>,
}

struct TransformInput<'r, 'a> {
    raw: &'r RawRequestMetadata<'a>,
    mode: ForwardedMode,
    options: &'r ForwardingOptions,
}

type Transform = fn(&mut Draft, &TransformInput<'_, '_>);

/// Applied in order to every trusted request.
const TRANSFORMS: [Transform; 3] = [apply_forwarding, apply_prefix, canonicalize];

fn apply_forwarding(draft: &mut Draft, input: &TransformInput<'_, '_>) {
    match input.mode {
        ForwardedMode::Standard => apply_standard(draft, input.raw.headers),
        ForwardedMode::XForwarded => apply_x_forwarded(draft, input.raw.headers, input.options),
    }
}

fn apply_standard(draft: &mut Draft, headers: &HeaderMap) {
    let Some(value) = header_str(headers, &FORWARDED) else {
        return;
    };
    let Some(element) = split_unquoted(value, ',').into_iter().next() else {
        return;
    };

    let mut proto = None;
    let mut host = None;
    let mut forwarded_for = None;
    for pair in split_unquoted(element, ';') {
        let Some((key, val)) = pair.split_once('=') else {
            continue;
        };
        let val = unquote(val.trim());
        match key.trim().to_ascii_lowercase().as_str() {
            "proto" if proto.is_none() => proto = Some(val),
            "host" if host.is_none() => host = Some(val),
            "for" if forwarded_for.is_none() => forwarded_for = Some(val),
            _ => {}
        }
    }

    match proto {
        Some(proto) => set_scheme(draft, &proto),
        None if ssl_forwarded(headers) => set_scheme(draft, "https"),
        None => {}
    }
    if let Some(host) = host {
        set_host_and_port(draft, &host);
    }
    if let Some(value) = forwarded_for {
        set_remote(draft, &value);
    }
}

fn apply_x_forwarded(draft: &mut Draft, headers: &HeaderMap, options: &ForwardingOptions) {
    match first_value(headers, &X_FORWARDED_PROTO) {
        Some(proto) => set_scheme(draft, proto),
        None if ssl_forwarded(headers) => set_scheme(draft, "https"),
        None => {}
    }

    if options.enable_forwarded_host {
        if let Some(host) = first_value(headers, &options.forwarded_host_header) {
            set_host_and_port(draft, host);
        }
    }

    if let Some(port) = first_value(headers, &X_FORWARDED_PORT) {
        match port.parse::<u16>() {
            Ok(port) => draft.port = Some(port),
            Err(_) => {
                tracing::warn!(value = %port, "Ignoring malformed X-Forwarded-Port");
            }
        }
    }

    if let Some(value) = first_value(headers, &X_FORWARDED_FOR) {
        set_remote(draft, value);
    }
}

fn apply_prefix(draft: &mut Draft, input: &TransformInput<'_, '_>) {
    if !input.options.enable_forwarded_prefix {
        return;
    }
    let Some(prefix) = first_value(input.raw.headers, &input.options.forwarded_prefix_header) else {
        return;
    };
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return;
    }
    if prefix.starts_with('/') {
        draft.prefix = Some(prefix.to_string());
    } else {
        draft.prefix = Some(format!("/{}", prefix));
    }
}

fn canonicalize(draft: &mut Draft, _input: &TransformInput<'_, '_>) {
    draft.port = canonical_port(&draft.scheme, draft.port);
}

fn set_scheme(draft: &mut Draft, proto: &str) {
    let proto = proto.trim().to_ascii_lowercase();
    let valid = !proto.is_empty()
        && proto.starts_with(|c: char| c.is_ascii_alphabetic())
        && proto.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    if !valid {
        tracing::warn!(value = %proto, "Ignoring malformed forwarded protocol");
        return;
    }
    draft.scheme = proto;
    draft.port = None;
}

/// Replace the host. A host without a port drops the previous port, which
/// belonged to the authority being replaced.
fn set_host_and_port(draft: &mut Draft, value: &str) {
    let (host, port) = split_host_port(value.trim());
    if !is_valid_host(host) {
        tracing::warn!(value = %value, "Ignoring malformed forwarded host");
        return;
    }
    draft.host = host.to_string();
    match port.map(str::parse::<u16>) {
        Some(Ok(port)) => draft.port = Some(port),
        Some(Err(_)) => tracing::warn!(value = %value, "Ignoring malformed port in forwarded host"),
        None => draft.port = None,
    }
}

/// A registered name or a bracketed IPv6 literal.
fn is_valid_host(host: &str) -> bool {
    if let Some(literal) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        return literal.parse::<std::net::Ipv6Addr>().is_ok();
    }
    !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~' | '%'))
}

fn set_remote(draft: &mut Draft, value: &str) {
    let (host, port) = split_host_port(value.trim());
    if host.is_empty() {
        return;
    }
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let previous_port = draft.remote.as_ref().and_then(|r| r.port);
    let port = match port {
        Some(port) => match port.parse::<u16>() {
            Ok(port) => Some(port),
            Err(_) => {
                tracing::warn!(value = %value, "Ignoring malformed port in forwarded address");
                previous_port
            }
        },
        None => previous_port,
    };
    draft.remote = Some(RemoteAddress::new(host, port));
}

fn ssl_forwarded(headers: &HeaderMap) -> bool {
    first_value(headers, &X_FORWARDED_SSL).is_some_and(|v| v.eq_ignore_ascii_case("on"))
}

/// Split `host[:port]`, keeping the brackets of IPv6 literals.
///
/// An unbracketed value with more than one colon is a bare IPv6 literal and
/// has no port.
pub fn split_host_port(value: &str) -> (&str, Option<&str>) {
    if value.starts_with('[') {
        return match value.find(']') {
            Some(end) => {
                let host = &value[..=end];
                let port = value[end + 1..].strip_prefix(':');
                (host, port)
            }
            None => (value, None),
        };
    }
    match value.split_once(':') {
        Some((host, port)) if !port.contains(':') => (host, Some(port)),
        _ => (value, None),
    }
}

pub fn default_port(scheme: &str) -> u16 {
    if scheme.eq_ignore_ascii_case("https") || scheme.eq_ignore_ascii_case("wss") {
        443
    } else {
        80
    }
}

fn canonical_port(scheme: &str, port: Option<u16>) -> Option<u16> {
    match (scheme, port) {
        ("http", Some(80)) | ("https", Some(443)) => None,
        _ => port,
    }
}

fn authority(host: &str, port: Option<u16>) -> String {
    match port {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

fn header_str<'h>(headers: &'h HeaderMap, name: &HeaderName) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn first_value<'h>(headers: &'h HeaderMap, name: &HeaderName) -> Option<&'h str> {
    header_str(headers, name)
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Split on `sep`, ignoring separators inside double quotes.
fn split_unquoted(value: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in value.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            c if c == sep && !in_quotes => {
                parts.push(value[start..i].trim());
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(value[start..].trim());
    parts
}

fn unquote(value: &str) -> String {
    match value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        Some(inner) => {
            let mut out = String::with_capacity(inner.len());
            let mut chars = inner.chars();
            while let Some(c) = chars.next() {
                if c == '\\' {
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                } else {
                    out.push(c);
                }
            }
            out
        }
        None => value.to_string(),
    }
}
