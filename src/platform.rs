//! Recognizing the platform's own telemetry
//!
//! The collector, OpAMP server and ollyscale itself all export spans. Query
//! endpoints hide them unless the caller passes `include_platform`.

const PLATFORM_PREFIXES: &[&str] = &["ollyscale", "tinyolly"];

const PLATFORM_SERVICES: &[&str] = &[
    "otel-collector",
    "opentelemetry-collector",
    "otelcol",
    "otelcol-contrib",
    "opamp-server",
];

/// Whether a service name belongs to the observability platform itself
pub fn is_platform_service(name: &str) -> bool {
    let name = name.trim().to_ascii_lowercase();
    PLATFORM_PREFIXES.iter().any(|p| name.starts_with(p))
        || PLATFORM_SERVICES.contains(&name.as_str())
}

/// Apply the platform toggle to a service name
pub fn is_visible(name: &str, include_platform: bool) -> bool {
    include_platform || !is_platform_service(name)
}
