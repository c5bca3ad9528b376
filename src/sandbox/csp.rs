use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use url::Url;

/// Policy applied when the widget runs in permissive mode. Debugging only.
pub(crate) const PERMISSIVE_POLICY: &str = "default-src * 'unsafe-inline' 'unsafe-eval' data: blob: filesystem: about: ws: wss:; \
script-src * 'unsafe-inline' 'unsafe-eval' data: blob:; \
style-src * 'unsafe-inline' data: blob:; \
img-src * data: blob:; \
font-src * data: blob:; \
media-src * data: blob:; \
connect-src * data: blob: ws: wss:; \
frame-src * data: blob:; \
base-uri *";

pub(crate) const DEFAULT_GUEST_SANDBOX: &str =
    "allow-scripts allow-same-origin allow-forms allow-popups allow-popups-to-escape-sandbox";

const KNOWN_SANDBOX_TOKENS: &[&str] = &[
    "allow-scripts",
    "allow-same-origin",
    "allow-forms",
    "allow-popups",
    "allow-popups-to-escape-sandbox",
    "allow-modals",
    "allow-downloads",
    "allow-pointer-lock",
    "allow-presentation",
];

const BASELINE_ALLOW: &[&str] = &["autoplay", "fullscreen"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum CspMode {
    Permissive,
    #[default]
    WidgetDeclared,
}

impl CspMode {
    pub(crate) fn is_permissive(self) -> bool {
        matches!(self, Self::Permissive)
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Permissive => "permissive",
            Self::WidgetDeclared => "widget-declared",
        }
    }
}

/// Domains a widget declares it needs, grouped by directive family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WidgetCsp {
    #[serde(default)]
    pub(crate) connect_domains: Vec<String>,
    #[serde(default)]
    pub(crate) resource_domains: Vec<String>,
    #[serde(default)]
    pub(crate) frame_domains: Vec<String>,
    #[serde(default)]
    pub(crate) base_uri_domains: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum Permission {
    Camera,
    Microphone,
    Geolocation,
    ClipboardWrite,
}

impl Permission {
    const ALL: [Permission; 4] = [
        Permission::Camera,
        Permission::Microphone,
        Permission::Geolocation,
        Permission::ClipboardWrite,
    ];

    fn key(self) -> &'static str {
        match self {
            Self::Camera => "camera",
            Self::Microphone => "microphone",
            Self::Geolocation => "geolocation",
            Self::ClipboardWrite => "clipboardWrite",
        }
    }

    fn allow_token(self) -> &'static str {
        match self {
            Self::Camera => "camera",
            Self::Microphone => "microphone",
            Self::Geolocation => "geolocation",
            Self::ClipboardWrite => "clipboard-write",
        }
    }
}

/// Browser capabilities a widget declares. Serialized as `{ "camera": {}, ... }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>", into = "Map<String, Value>")]
pub(crate) struct WidgetPermissions {
    granted: BTreeSet<Permission>,
}

impl WidgetPermissions {
    pub(crate) fn contains(&self, permission: Permission) -> bool {
        self.granted.contains(&permission)
    }
}

impl From<Map<String, Value>> for WidgetPermissions {
    fn from(map: Map<String, Value>) -> Self {
        let granted = Permission::ALL
            .into_iter()
            .filter(|permission| {
                map.get(permission.key())
                    .is_some_and(|value| !matches!(value, Value::Null | Value::Bool(false)))
            })
            .collect();
        Self { granted }
    }
}

impl From<WidgetPermissions> for Map<String, Value> {
    fn from(permissions: WidgetPermissions) -> Self {
        permissions
            .granted
            .into_iter()
            .map(|permission| (permission.key().to_string(), json!({})))
            .collect()
    }
}

/// A restriction violation observed inside a guest document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CspViolation {
    pub(crate) directive: String,
    pub(crate) effective_directive: String,
    pub(crate) blocked_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) source_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) line_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) column_number: Option<u64>,
    pub(crate) timestamp: DateTime<Utc>,
}

impl CspViolation {
    /// Normalizes the loosely typed record posted by the guest listener.
    pub(crate) fn from_guest(params: &Value) -> Option<Self> {
        let object = params.as_object()?;
        let text = |key: &str| {
            object
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        let effective_directive = text("effectiveDirective").or_else(|| text("violatedDirective"))?;
        let directive = text("directive")
            .or_else(|| text("violatedDirective"))
            .unwrap_or_else(|| effective_directive.clone());
        let timestamp = object
            .get("timestamp")
            .and_then(Value::as_f64)
            .and_then(|millis| DateTime::<Utc>::from_timestamp_millis(millis as i64))
            .unwrap_or_else(Utc::now);

        Some(Self {
            directive,
            effective_directive,
            blocked_uri: text("blockedUri").unwrap_or_default(),
            source_file: text("sourceFile"),
            line_number: object.get("lineNumber").and_then(Value::as_u64),
            column_number: object.get("columnNumber").and_then(Value::as_u64),
            timestamp,
        })
    }
}

/// Builds the policy string injected into the guest document.
///
/// Permissive mode ignores any declared domains. Declared mode denies
/// connections, nested frames and base URIs unless domains are listed, and
/// limits resources to inline, `data:` and `blob:` sources plus declared
/// resource domains.
pub(crate) fn build_policy(csp: Option<&WidgetCsp>, permissive: bool) -> String {
    if permissive {
        return PERMISSIVE_POLICY.to_string();
    }

    let declared = csp.cloned().unwrap_or_default();
    let resources = sanitize_domains(&declared.resource_domains);
    let connect = sanitize_domains(&declared.connect_domains);
    let frames = sanitize_domains(&declared.frame_domains);
    let base_uris = sanitize_domains(&declared.base_uri_domains);

    let clauses = [
        "default-src 'none'".to_string(),
        format!(
            "script-src {}",
            with_sources(&["'unsafe-inline'", "data:", "blob:"], &resources)
        ),
        format!(
            "style-src {}",
            with_sources(&["'unsafe-inline'", "data:", "blob:"], &resources)
        ),
        format!("img-src {}", with_sources(&["data:", "blob:"], &resources)),
        format!("font-src {}", with_sources(&["data:", "blob:"], &resources)),
        format!("media-src {}", with_sources(&["data:", "blob:"], &resources)),
        format!("connect-src {}", deny_when_empty(&connect)),
        format!("frame-src {}", deny_when_empty(&frames)),
        format!("base-uri {}", deny_when_empty(&base_uris)),
        "object-src 'none'".to_string(),
    ];

    clauses.join("; ")
}

/// Strips anything that could terminate a policy clause or an HTML attribute.
/// Internationalized hosts are converted to their ASCII form; a source that
/// cannot be converted is dropped.
pub(crate) fn sanitize_domain(raw: &str) -> Option<String> {
    let cleaned = raw
        .chars()
        .filter(|ch| {
            !ch.is_whitespace()
                && !ch.is_control()
                && !matches!(ch, '\'' | '"' | ';' | ',' | '<' | '>' | '`' | '\\')
        })
        .collect::<String>();

    if cleaned.is_empty() {
        return None;
    }
    if cleaned.is_ascii() {
        return Some(cleaned);
    }
    ascii_source(&cleaned)
}

fn ascii_source(source: &str) -> Option<String> {
    let (scheme, rest) = match source.split_once("://") {
        Some((scheme, rest)) => (Some(scheme), rest),
        None => (None, source),
    };
    let url = Url::parse(&format!("{}://{rest}", scheme.unwrap_or("https"))).ok()?;
    let mut ascii = String::new();
    if scheme.is_some() {
        ascii.push_str(url.scheme());
        ascii.push_str("://");
    }
    ascii.push_str(url.host_str()?);
    if let Some(port) = url.port() {
        ascii.push_str(&format!(":{port}"));
    }
    if rest.contains('/') {
        ascii.push_str(url.path());
    }
    ascii.is_ascii().then_some(ascii)
}

fn sanitize_domains(domains: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    domains
        .iter()
        .filter_map(|domain| sanitize_domain(domain))
        .filter(|domain| seen.insert(domain.clone()))
        .collect()
}

fn with_sources(base: &[&str], domains: &[String]) -> String {
    base.iter()
        .map(|source| source.to_string())
        .chain(domains.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn deny_when_empty(domains: &[String]) -> String {
    if domains.is_empty() {
        "'none'".to_string()
    } else {
        domains.join(" ")
    }
}

/// Keeps only recognised sandbox capability tokens; falls back to the guest default.
pub(crate) fn sanitize_sandbox(raw: Option<&str>) -> String {
    let mut seen = BTreeSet::new();
    let tokens = raw
        .unwrap_or_default()
        .split_whitespace()
        .filter(|token| KNOWN_SANDBOX_TOKENS.contains(token))
        .filter(|token| seen.insert(*token))
        .collect::<Vec<_>>();

    if tokens.is_empty() {
        DEFAULT_GUEST_SANDBOX.to_string()
    } else {
        tokens.join(" ")
    }
}

/// Permission policy for the guest frame: baseline entries plus declared capabilities.
pub(crate) fn build_allow_attribute(permissions: &WidgetPermissions) -> String {
    BASELINE_ALLOW
        .iter()
        .copied()
        .chain(
            Permission::ALL
                .into_iter()
                .filter(|permission| permissions.contains(*permission))
                .map(Permission::allow_token),
        )
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
pub(crate) fn directive<'a>(policy: &'a str, name: &str) -> Option<&'a str> {
    policy.split(';').map(str::trim).find_map(|clause| {
        let (key, sources) = clause.split_once(' ').unwrap_or((clause, ""));
        (key == name).then_some(sources)
    })
}
