use std::{
    net::{Ipv4Addr, Ipv6Addr},
    sync::OnceLock,
};

use url::{Host, Url};

use crate::error::WidgetError;

/// Resolves, once per process, the origin the sandbox proxy is served from.
///
/// The sandbox origin must be browser-distinct from the host origin. In local
/// development that is achieved by swapping loopback aliases; deployments
/// configure a dedicated origin instead.
pub(crate) struct OriginResolver {
    host_origin: String,
    configured: Option<String>,
    resolved: OnceLock<String>,
}

impl OriginResolver {
    pub(crate) fn new(host_origin: impl Into<String>, configured: Option<String>) -> Self {
        Self {
            host_origin: host_origin.into(),
            configured,
            resolved: OnceLock::new(),
        }
    }

    pub(crate) fn host_origin(&self) -> &str {
        &self.host_origin
    }

    pub(crate) fn sandbox_origin(&self) -> Result<String, WidgetError> {
        if let Some(origin) = self.resolved.get() {
            return Ok(origin.clone());
        }

        let origin = resolve_sandbox_origin(&self.host_origin, self.configured.as_deref())?;
        Ok(self.resolved.get_or_init(|| origin).clone())
    }
}

pub(crate) fn resolve_sandbox_origin(
    host_origin: &str,
    configured: Option<&str>,
) -> Result<String, WidgetError> {
    let host = parse_tuple_origin(host_origin, host_origin)?;
    let host_serialized = host.origin().ascii_serialization();

    if let Some(configured) = configured {
        let sandbox = parse_tuple_origin(configured, host_origin)?;
        let sandbox_serialized = sandbox.origin().ascii_serialization();
        if sandbox_serialized == host_serialized {
            return Err(configuration_error(
                host_origin,
                "configured sandbox origin equals the host origin",
            ));
        }
        return Ok(sandbox_serialized);
    }

    let alias = match host.host() {
        Some(Host::Domain(domain)) if domain.eq_ignore_ascii_case("localhost") => "127.0.0.1",
        Some(Host::Ipv4(ip)) if ip == Ipv4Addr::LOCALHOST => "localhost",
        Some(Host::Ipv6(ip)) if ip == Ipv6Addr::LOCALHOST => "localhost",
        _ => {
            return Err(configuration_error(
                host_origin,
                "host has no loopback alias; set BRIDGE_SANDBOX_ORIGIN",
            ))
        }
    };

    let mut alternate = host.clone();
    alternate
        .set_host(Some(alias))
        .map_err(|error| configuration_error(host_origin, &error.to_string()))?;

    Ok(alternate.origin().ascii_serialization())
}

fn parse_tuple_origin(raw: &str, host_origin: &str) -> Result<Url, WidgetError> {
    let url = Url::parse(raw.trim())
        .map_err(|error| configuration_error(host_origin, &format!("invalid origin '{raw}': {error}")))?;
    if !url.origin().is_tuple() {
        return Err(configuration_error(
            host_origin,
            &format!("origin '{raw}' is opaque"),
        ));
    }
    Ok(url)
}

fn configuration_error(host_origin: &str, reason: &str) -> WidgetError {
    WidgetError::Configuration {
        host_origin: host_origin.to_string(),
        reason: reason.to_string(),
    }
}
